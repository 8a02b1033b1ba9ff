pub mod client_ops;
pub mod dispatch;
pub mod worker_ops;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use crate::config::AppConfig;
use crate::diagnostics::{self, ManagerIdentity, StatusSources};
use crate::logging::{LogLevel, Logger};
use crate::multiplexer::{CloseReason, Readiness};
use crate::orchestrator::blobs::{BlobShadow, BlobShadowState};
use crate::orchestrator::files::{FileRecord, FileRegistry, FileState, Replica};
use crate::orchestrator::projects::ProjectRegistry;
use crate::orchestrator::services::ServiceRegistry;
use crate::orchestrator::tasks::{TaskRegistry, TaskShadow, TaskShadowState};
use crate::orchestrator::transition::{Tracked, TransitionOutcome};
use crate::server::SessionKey;
use crate::sessions::{OutstandingRpc, ReleasedSession, RpcTarget, SessionPools, SessionRole};
use crate::wire::codec::WireCodec;
use crate::wire::envelope::{Inbound, Request, Response, ResultCode, UNKNOWN_REQUEST_ID};
use crate::wire::handshake::{evaluate_handshake_frame, PeerRole};
use crate::wire::session::{build_error_frame, build_response_frame, evaluate_session_frame};

use dispatch::{DispatchTable, MethodError, Reply};

/// Manager-issued RPC ids start here so they never collide with the small
/// ids peers typically use.
pub const FIRST_RPC_ID: i64 = 1000;

const OVERSIZED_ERROR_MESSAGE: &str = "error message exceeded the message size limit";

#[derive(Clone, Copy, Debug)]
pub struct ManagerSettings {
    pub codec: WireCodec,
    pub file_quorum: usize,
    pub connect_timeout: Duration,
    pub notification_limit: usize,
}

impl ManagerSettings {
    pub fn from_app_config(config: &AppConfig, codec: WireCodec) -> Self {
        Self {
            codec,
            file_quorum: config.manager.file_quorum.max(1),
            connect_timeout: Duration::seconds(
                i64::try_from(config.manager.connect_timeout_seconds).unwrap_or(i64::from(u32::MAX)),
            ),
            notification_limit: config.manager.max_queued_notifications.max(1),
        }
    }
}

/// Everything the control thread owns: sessions, registries and the method
/// tables. Only ever touched from one thread.
pub struct Manager {
    identity: ManagerIdentity,
    settings: ManagerSettings,
    logger: Arc<Logger>,
    sessions: SessionPools,
    tasks: TaskRegistry,
    files: FileRegistry,
    projects: ProjectRegistry,
    services: ServiceRegistry,
    client_methods: DispatchTable,
    worker_methods: DispatchTable,
    next_blob_sequence: u64,
    next_rpc_id: i64,
}

impl Manager {
    pub fn new(identity: ManagerIdentity, settings: ManagerSettings, logger: Arc<Logger>) -> Self {
        let projects = ProjectRegistry::new(identity.project.clone());
        Self {
            identity,
            settings,
            logger,
            sessions: SessionPools::new(),
            tasks: TaskRegistry::new(),
            files: FileRegistry::new(),
            projects,
            services: ServiceRegistry::new(),
            client_methods: DispatchTable::new(client_ops::METHODS),
            worker_methods: DispatchTable::new(worker_ops::METHODS),
            next_blob_sequence: 0,
            next_rpc_id: FIRST_RPC_ID,
        }
    }

    pub fn identity(&self) -> &ManagerIdentity {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionPools {
        &self.sessions
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn status_document(&self, now: DateTime<Utc>) -> Value {
        diagnostics::build_status_document(
            &StatusSources {
                identity: &self.identity,
                sessions: &self.sessions,
                tasks: &self.tasks,
                files: &self.files,
                projects: &self.projects,
                services: &self.services,
            },
            now,
        )
    }

    pub fn handle_readiness(&mut self, event: Readiness) {
        match event {
            Readiness::Accepted { key, connection } => {
                let peer_addr = connection.peer_addr();
                self.sessions.register_pending(connection);
                self.logger.log(
                    LogLevel::Debug,
                    Some("manager::sessions"),
                    "Connection awaiting handshake",
                    Some(json!({
                        "session": key.to_string(),
                        "peer_addr": peer_addr.to_string()
                    })),
                );
            }
            Readiness::Message { key, frame } => self.handle_message(key, &frame),
            Readiness::Closed { key, reason } => {
                if self.sessions.role_of(key).is_none() {
                    return;
                }
                if let CloseReason::Oversized { .. } = reason {
                    self.send_error(
                        key,
                        UNKNOWN_REQUEST_ID,
                        ResultCode::MalformedMessage,
                        &reason.to_string(),
                    );
                }
                self.disconnect(key, &reason.to_string());
            }
        }
    }

    fn handle_message(&mut self, key: SessionKey, frame: &[u8]) {
        match self.sessions.role_of(key) {
            Some(SessionRole::Pending) => self.handle_handshake(key, frame),
            Some(SessionRole::Client) => self.handle_client_message(key, frame),
            Some(SessionRole::Worker) => self.handle_worker_message(key, frame),
            None => self.logger.verbose(
                Some("manager::sessions"),
                &format!("dropping message for released session {key}"),
            ),
        }
    }

    fn handle_handshake(&mut self, key: SessionKey, frame: &[u8]) {
        match evaluate_handshake_frame(&self.settings.codec, frame) {
            Ok(handshake) => {
                if let Err(error) = self.sessions.promote(key, handshake.role, handshake.request_id) {
                    self.logger
                        .warn(Some("manager::sessions"), &format!("promotion failed: {error}"));
                    return;
                }
                self.send_value(key, handshake.request_id, None);
                self.logger.log(
                    LogLevel::Info,
                    Some("manager::sessions"),
                    "Handshake completed",
                    Some(json!({
                        "session": key.to_string(),
                        "role": handshake.role.as_str()
                    })),
                );
            }
            Err(error) => {
                self.send_error(key, error.request_id(), error.result_code(), &error.to_string());
                self.disconnect(key, &format!("handshake rejected: {error}"));
            }
        }
    }

    fn handle_client_message(&mut self, key: SessionKey, frame: &[u8]) {
        let codec = self.settings.codec;
        let evaluated = match self.sessions.client_mut(key) {
            Some(client) => {
                client.last_seen_at = Utc::now();
                evaluate_session_frame(&codec, frame, &mut client.last_request_id)
            }
            None => return,
        };

        match evaluated {
            Ok(Inbound::Request(request)) => self.dispatch(key, PeerRole::Client, request),
            Ok(Inbound::Response(response)) => self.send_error(
                key,
                response.id,
                ResultCode::MalformedMessage,
                "clients may only send requests",
            ),
            Err(error) => {
                self.logger.debug(
                    Some("manager::wire"),
                    &format!("malformed message from client {key}: {error}"),
                );
                self.send_error(key, error.request_id(), error.result_code(), &error.to_string());
            }
        }
    }

    fn handle_worker_message(&mut self, key: SessionKey, frame: &[u8]) {
        let codec = self.settings.codec;
        let evaluated = match self.sessions.worker_mut(key) {
            Some(worker) => {
                worker.last_seen_at = Utc::now();
                evaluate_session_frame(&codec, frame, &mut worker.last_request_id)
            }
            None => return,
        };

        match evaluated {
            Ok(Inbound::Request(request)) => self.dispatch(key, PeerRole::Worker, request),
            Ok(Inbound::Response(response)) => self.handle_rpc_response(key, response),
            Err(error) => {
                self.send_error(key, error.request_id(), error.result_code(), &error.to_string());
                self.disconnect(key, &format!("protocol violation: {error}"));
            }
        }
    }

    fn dispatch(&mut self, key: SessionKey, role: PeerRole, request: Request) {
        let reply_id = request.id.unwrap_or(UNKNOWN_REQUEST_ID);
        let table = match role {
            PeerRole::Client => &self.client_methods,
            PeerRole::Worker => &self.worker_methods,
        };
        let Some(handler) = table.get(&request.method) else {
            self.send_error(
                key,
                reply_id,
                ResultCode::UnexpectedMethod,
                &format!("unknown {} method '{}'", role.as_str(), request.method),
            );
            return;
        };

        self.logger.verbose(
            Some("manager::dispatch"),
            &format!("{key} -> {} (id {reply_id})", request.method),
        );
        match handler(self, key, &request) {
            Ok(Reply::Value(value)) => self.send_value(key, reply_id, value),
            Ok(Reply::Deferred) => {}
            Err(error) => {
                self.logger.debug(
                    Some("manager::dispatch"),
                    &format!("{} from {key} failed: {error}", request.method),
                );
                self.send_error(key, reply_id, error.code, &error.message);
            }
        }
    }

    fn handle_rpc_response(&mut self, key: SessionKey, response: Response) {
        let Some(worker) = self.sessions.worker_mut(key) else {
            return;
        };
        let Some(rpc) = worker.take_rpc(response.id) else {
            self.logger.debug(
                Some("manager::rpc"),
                &format!("worker {key} answered unknown rpc {}", response.id),
            );
            return;
        };
        if response.result.is_success() {
            return;
        }

        self.logger.warn(
            Some("manager::rpc"),
            &format!(
                "worker {key} rejected {} with {}",
                rpc.method, response.result
            ),
        );
        match rpc.target {
            RpcTarget::Task { task_id } => {
                let failed = worker
                    .task_shadow_mut(&task_id)
                    .filter(|shadow| !shadow.lifecycle.is_settled())
                    .map(|shadow| shadow.lifecycle.fail(response.result));
                if let Some(TransitionOutcome::Failed { attempted, .. }) = failed {
                    let owner = self.tasks.get(&task_id).and_then(|task| task.owner);
                    self.notify(
                        owner,
                        task_notification(&task_id, key, attempted, response.result),
                    );
                    self.release_stalled_deletion(&task_id);
                }
            }
            RpcTarget::Blob { blob_id } => {
                let failed = worker
                    .blob_shadow_mut(&blob_id)
                    .filter(|shadow| !shadow.lifecycle.is_settled())
                    .map(|shadow| {
                        let outcome = shadow.lifecycle.fail(response.result);
                        (outcome, shadow.file_id.clone())
                    });
                if let Some((TransitionOutcome::Failed { attempted, .. }, file_id)) = failed {
                    let owner = file_id
                        .as_deref()
                        .and_then(|file_id| self.files.get(file_id))
                        .and_then(|file| file.owner);
                    self.notify(
                        owner,
                        blob_notification(&blob_id, file_id.as_deref(), key, attempted, response.result),
                    );
                }
            }
        }
    }

    /// Drops the session and closes its connection after queued frames.
    fn disconnect(&mut self, key: SessionKey, reason: &str) {
        let released = match self.sessions.release(key) {
            Ok(released) => released,
            Err(_) => return,
        };
        released.connection().close();

        self.logger.log(
            LogLevel::Info,
            Some("manager::sessions"),
            "Session closed",
            Some(json!({
                "session": key.to_string(),
                "role": format!("{:?}", released.role()).to_lowercase(),
                "reason": reason
            })),
        );

        if let ReleasedSession::Worker(worker) = released {
            for file in self.files.iter_mut() {
                file.remove_replicas_on(key);
            }
            let lost = worker
                .task_shadows()
                .map(|shadow| (shadow.task_id.clone(), shadow.lifecycle.state()))
                .collect::<Vec<_>>();
            for (task_id, state) in lost {
                let owner = self.tasks.get(&task_id).and_then(|task| task.owner);
                self.notify(
                    owner,
                    task_notification(&task_id, key, state, ResultCode::WorkerDisconnected),
                );
            }
        }
    }

    /// Closes every connection; used on shutdown.
    pub fn shutdown(&mut self) {
        for key in self.sessions.keys() {
            if let Some(connection) = self.sessions.connection(key) {
                connection.shutdown();
            }
        }
    }

    pub(crate) fn notify(&mut self, owner: Option<SessionKey>, notification: Value) {
        let limit = self.settings.notification_limit;
        let Some((owner, client)) =
            owner.and_then(|owner| self.sessions.client_mut(owner).map(|client| (owner, client)))
        else {
            return;
        };
        if let Some(dropped) = client.notify(notification, limit) {
            self.logger.log(
                LogLevel::Warn,
                Some("manager::notifications"),
                "Notification queue full, oldest entry dropped",
                Some(json!({ "client": owner.to_string(), "limit": limit, "dropped": dropped })),
            );
        }
    }

    /// Takes the longest prefix of the client's queue that fits in one reply
    /// to `request_id`. The rest stays queued for the next `wait`.
    pub(crate) fn take_notification_batch(&mut self, key: SessionKey, request_id: i64) -> Vec<Value> {
        let codec = self.settings.codec;
        let Some(client) = self.sessions.client_mut(key) else {
            return Vec::new();
        };

        let mut count = client.notification_count();
        while count > 0 {
            let batch = client.peek_notifications(count);
            let encoded = build_response_frame(&codec, request_id, Some(Value::Array(batch.clone())));
            if encoded.is_ok() {
                client.consume_notifications(count);
                return batch;
            }
            count /= 2;
        }

        if client.has_notifications() {
            // A single notification above the message limit can never be sent.
            client.consume_notifications(1);
            self.logger.warn(
                Some("manager::notifications"),
                &format!("dropped a notification for {key} larger than the message limit"),
            );
        }
        Vec::new()
    }

    fn send_frame(&self, key: SessionKey, frame: Vec<u8>) {
        let Some(connection) = self.sessions.connection(key) else {
            return;
        };
        if !connection.send(frame) {
            self.logger.debug(
                Some("manager::wire"),
                &format!("writer for {key} is gone; reply dropped"),
            );
        }
    }

    /// Sends a success reply, or TOO_FULL when the value does not fit in one
    /// message.
    pub(crate) fn send_value(&self, key: SessionKey, request_id: i64, value: Option<Value>) {
        match build_response_frame(&self.settings.codec, request_id, value) {
            Ok(frame) => self.send_frame(key, frame),
            Err(error) => {
                self.logger.warn(
                    Some("manager::wire"),
                    &format!("reply {request_id} for {key} not encodable: {error}"),
                );
                self.send_error(
                    key,
                    request_id,
                    ResultCode::TooFull,
                    &format!("reply not sent: {error}"),
                );
            }
        }
    }

    pub(crate) fn send_error(&self, key: SessionKey, request_id: i64, code: ResultCode, message: &str) {
        let codec = &self.settings.codec;
        let frame = build_error_frame(codec, request_id, code, message)
            .or_else(|_| build_error_frame(codec, request_id, code, OVERSIZED_ERROR_MESSAGE));
        match frame {
            Ok(frame) => self.send_frame(key, frame),
            Err(error) => self.logger.warn(
                Some("manager::wire"),
                &format!("failed to encode error reply for {key}: {error}"),
            ),
        }
    }

    /// Sends a request to a worker and remembers what it was for. Returns
    /// the rpc id.
    pub(crate) fn send_rpc(
        &mut self,
        worker_key: SessionKey,
        method: &'static str,
        params: Map<String, Value>,
        target: RpcTarget,
    ) -> Result<i64, MethodError> {
        let rpc_id = self.next_rpc_id;
        let frame = self
            .settings
            .codec
            .encode_frame(&Request::new(method, params, Some(rpc_id)).into_raw())
            .map_err(|error| MethodError::new(ResultCode::Unable, error.to_string()))?;
        let worker = self.sessions.worker_mut(worker_key).ok_or_else(|| {
            MethodError::new(ResultCode::Unable, format!("{worker_key} is not a worker"))
        })?;

        self.next_rpc_id += 1;
        worker.track_rpc(rpc_id, OutstandingRpc { method, target });
        if !worker.connection.send(frame) {
            self.logger.debug(
                Some("manager::rpc"),
                &format!("{method} to {worker_key} could not be queued"),
            );
        }
        Ok(rpc_id)
    }

    /// Creates the shadow of `task_id` on a worker, moving toward READY.
    /// The task must exist and the worker must not already hold it.
    pub fn add_task_to_worker(
        &mut self,
        worker_key: SessionKey,
        task_id: &str,
    ) -> Result<(), MethodError> {
        let Some(task) = self.tasks.get(task_id) else {
            panic!("cannot shadow unknown task '{task_id}' on {worker_key}");
        };
        if task.deleting {
            return Err(MethodError::new(
                ResultCode::InvalidTransition,
                format!("task '{task_id}' is being deleted"),
            ));
        }
        let description = task.description.clone();
        let worker = self.sessions.worker_mut(worker_key).ok_or_else(|| {
            MethodError::new(ResultCode::Unable, format!("{worker_key} is not a worker"))
        })?;

        let mut shadow = TaskShadow::new(task_id, description);
        shadow
            .lifecycle
            .request(TaskShadowState::Ready)
            .map_err(|error| MethodError::new(ResultCode::InvalidTransition, error.to_string()))?;
        worker.insert_task_shadow(shadow);
        Ok(())
    }

    /// Clears the deleting mark of a task once no worker is still deleting
    /// it, so a later `task-delete` can try again.
    pub(crate) fn release_stalled_deletion(&mut self, task_id: &str) {
        let still_deleting = self.sessions.workers().any(|(_, worker)| {
            worker
                .task_shadow(task_id)
                .is_some_and(|shadow| shadow.is_being_deleted())
        });
        let holders = self
            .sessions
            .workers()
            .filter(|(_, worker)| worker.task_shadow(task_id).is_some())
            .count();
        if still_deleting || holders == 0 {
            return;
        }
        if let Some(task) = self.tasks.get_mut(task_id).filter(|task| task.deleting) {
            task.deleting = false;
            self.logger.debug(
                Some("manager::tasks"),
                &format!("{task_id} deletion stalled; delete may be retried"),
            );
        }
    }

    /// Places a task on a worker: shadow plus `task-submit`.
    pub fn place_task(&mut self, task_id: &str, worker_key: SessionKey) -> Result<i64, MethodError> {
        self.add_task_to_worker(worker_key, task_id)?;
        let description = self
            .tasks
            .get(task_id)
            .map(|task| task.description.clone())
            .unwrap_or(Value::Null);

        let mut params = Map::new();
        params.insert("task-id".to_owned(), Value::String(task_id.to_owned()));
        params.insert("description".to_owned(), description);
        self.send_rpc(
            worker_key,
            "task-submit",
            params,
            RpcTarget::Task {
                task_id: task_id.to_owned(),
            },
        )
    }

    /// Creates a fresh blob shadow on a worker, moving toward READ-WRITE.
    pub fn add_blob_to_worker(
        &mut self,
        worker_key: SessionKey,
        file_id: Option<String>,
        size: u64,
        metadata: Value,
    ) -> Result<String, MethodError> {
        let worker = self.sessions.worker_mut(worker_key).ok_or_else(|| {
            MethodError::new(ResultCode::Unable, format!("{worker_key} is not a worker"))
        })?;

        let blob_id = format!("blob-{}", self.next_blob_sequence);
        self.next_blob_sequence += 1;

        let mut shadow = BlobShadow::new(blob_id.clone(), file_id, size, metadata);
        shadow
            .lifecycle
            .request(BlobShadowState::ReadWrite)
            .map_err(|error| MethodError::new(ResultCode::InvalidTransition, error.to_string()))?;
        worker.insert_blob_shadow(shadow);
        Ok(blob_id)
    }

    /// Requests `target` on every replica of a file and sends `method` for
    /// each replica that accepted the request.
    pub(crate) fn drive_replicas(
        &mut self,
        file_id: &str,
        target: BlobShadowState,
        method: &'static str,
    ) {
        let replicas = self
            .files
            .get(file_id)
            .map(|file| file.replicas.clone())
            .unwrap_or_default();

        for replica in replicas {
            let requested = self
                .sessions
                .worker_mut(replica.worker)
                .and_then(|worker| worker.blob_shadow_mut(&replica.blob_id))
                .map(|shadow| match target {
                    BlobShadowState::Deleting
                        if shadow.lifecycle.is_settled()
                            && shadow.lifecycle.state() == BlobShadowState::Deleting =>
                    {
                        shadow.lifecycle.request(BlobShadowState::Deleted)
                    }
                    BlobShadowState::Deleting => shadow.lifecycle.redirect(target),
                    _ => shadow.lifecycle.request(target),
                });

            match requested {
                Some(Ok(())) => {
                    let mut params = Map::new();
                    params.insert("blob-id".to_owned(), Value::String(replica.blob_id.clone()));
                    if let Err(error) = self.send_rpc(
                        replica.worker,
                        method,
                        params,
                        RpcTarget::Blob {
                            blob_id: replica.blob_id.clone(),
                        },
                    ) {
                        self.logger.warn(Some("manager::files"), &error.to_string());
                    }
                }
                Some(Err(error)) => self.logger.debug(
                    Some("manager::files"),
                    &format!("skipping {} on {}: {error}", replica.blob_id, replica.worker),
                ),
                None => {}
            }
        }
    }

    /// One pass over everything time or derived state can move.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.expire_pending(now);
        self.allocate_pending_files();
        self.reconcile_files();
        self.reclaim_deleted_tasks();
        self.answer_waits(now);
    }

    fn expire_pending(&mut self, now: DateTime<Utc>) {
        for key in self
            .sessions
            .expired_pending(now, self.settings.connect_timeout)
        {
            self.send_error(
                key,
                UNKNOWN_REQUEST_ID,
                ResultCode::Timeout,
                "no handshake received in time",
            );
            self.disconnect(key, "handshake timeout");
        }
    }

    fn allocate_pending_files(&mut self) {
        let pending = self.files.ids_in_state(FileState::Pending);
        if pending.is_empty() || self.sessions.worker_count() == 0 {
            return;
        }

        for file_id in pending {
            let Some(file) = self.files.get(&file_id) else {
                continue;
            };
            let (size, metadata) = (file.size, file.metadata.clone());

            let mut candidates = self
                .sessions
                .workers()
                .map(|(key, worker)| (worker.blob_count(), key))
                .collect::<Vec<_>>();
            candidates.sort();

            let mut replicas = Vec::new();
            for (_, worker_key) in candidates.into_iter().take(self.settings.file_quorum) {
                let blob_id = match self.add_blob_to_worker(
                    worker_key,
                    Some(file_id.clone()),
                    size,
                    metadata.clone(),
                ) {
                    Ok(blob_id) => blob_id,
                    Err(error) => {
                        self.logger.warn(Some("manager::files"), &error.to_string());
                        continue;
                    }
                };

                let mut params = Map::new();
                params.insert("blob-id".to_owned(), Value::String(blob_id.clone()));
                params.insert("size".to_owned(), json!(size));
                params.insert("metadata".to_owned(), metadata.clone());
                if let Err(error) = self.send_rpc(
                    worker_key,
                    "blob-create",
                    params,
                    RpcTarget::Blob {
                        blob_id: blob_id.clone(),
                    },
                ) {
                    self.logger.warn(Some("manager::files"), &error.to_string());
                }
                replicas.push(Replica {
                    worker: worker_key,
                    blob_id,
                });
            }

            let placed = replicas
                .iter()
                .map(|replica| json!({"worker": replica.worker.to_string(), "blob-id": replica.blob_id}))
                .collect::<Vec<_>>();
            match self
                .files
                .get_mut(&file_id)
                .and_then(|file| file.begin_allocation(replicas))
            {
                Ok(()) => self.logger.log(
                    LogLevel::Debug,
                    Some("manager::files"),
                    "File allocated",
                    Some(json!({ "file-id": file_id, "replicas": placed })),
                ),
                Err(error) => self.logger.warn(Some("manager::files"), &error.to_string()),
            }
        }
    }

    fn replica_views(&self, file: &FileRecord) -> Vec<Tracked<BlobShadowState>> {
        file.replicas
            .iter()
            .filter_map(|replica| {
                self.sessions
                    .worker(replica.worker)
                    .and_then(|worker| worker.blob_shadow(&replica.blob_id))
                    .map(|shadow| shadow.lifecycle.clone())
            })
            .collect()
    }

    fn reconcile_files(&mut self) {
        let quorum = self.settings.file_quorum;

        for file_id in self.files.ids() {
            let views = match self.files.get(&file_id) {
                Some(file) if !file.lifecycle.is_settled() => self.replica_views(file),
                _ => continue,
            };
            let Ok(file) = self.files.get_mut(&file_id) else {
                continue;
            };
            let Some(outcome) = file.reconcile(&views, quorum) else {
                continue;
            };
            let owner = file.owner;
            let deleted = file.state() == FileState::Deleted;
            let replicas = file.replicas.clone();

            let notification = match outcome {
                TransitionOutcome::Settled { to, .. } => {
                    file_notification(&file_id, to, ResultCode::Success)
                }
                TransitionOutcome::Failed {
                    attempted, result, ..
                } => {
                    self.logger.warn(
                        Some("manager::files"),
                        &format!("{file_id} could not reach {attempted}: {result}"),
                    );
                    file_notification(&file_id, attempted, result)
                }
                TransitionOutcome::Unchanged { .. } => continue,
            };
            self.logger.log(
                LogLevel::Debug,
                Some("manager::files"),
                "File state changed",
                Some(notification.clone()),
            );
            self.notify(owner, notification);

            if deleted {
                for replica in replicas {
                    if let Some(worker) = self.sessions.worker_mut(replica.worker) {
                        worker.remove_blob_shadow(&replica.blob_id);
                    }
                }
                self.files.remove(&file_id);
            }
        }
    }

    fn reclaim_deleted_tasks(&mut self) {
        let deleting = self
            .tasks
            .snapshot()
            .into_iter()
            .filter(|task| task.deleting)
            .map(|task| task.task_id.clone())
            .collect::<Vec<_>>();

        for task_id in deleting {
            let still_held = self
                .sessions
                .workers()
                .any(|(_, worker)| worker.task_shadow(&task_id).is_some());
            if still_held {
                continue;
            }
            if let Some(task) = self.tasks.remove(&task_id) {
                self.logger
                    .debug(Some("manager::tasks"), &format!("{task_id} reclaimed"));
                self.notify(
                    task.owner,
                    json!({
                        "type": "task",
                        "task-id": task_id,
                        "state": TaskShadowState::Deleted.as_str(),
                        "result": ResultCode::Success.as_str()
                    }),
                );
            }
        }
    }

    fn answer_waits(&mut self, now: DateTime<Utc>) {
        let mut due = Vec::new();
        for (key, client) in self.sessions.clients_mut() {
            let Some(wait) = client.pending_wait else {
                continue;
            };
            if client.has_notifications() || now >= wait.deadline {
                client.pending_wait = None;
                due.push((key, wait.request_id));
            }
        }

        for (key, request_id) in due {
            let notifications = self.take_notification_batch(key, request_id);
            self.send_value(key, request_id, Some(Value::Array(notifications)));
        }
    }

    /// True when every live task has at least one DONE shadow.
    pub fn queue_is_empty(&self) -> bool {
        self.tasks
            .snapshot()
            .into_iter()
            .filter(|task| !task.deleting)
            .all(|task| {
                self.sessions.workers().any(|(_, worker)| {
                    worker
                        .task_shadow(&task.task_id)
                        .is_some_and(|shadow| shadow.lifecycle.state() == TaskShadowState::Done)
                })
            })
    }
}

pub(crate) fn task_notification(
    task_id: &str,
    worker: SessionKey,
    state: TaskShadowState,
    result: ResultCode,
) -> Value {
    json!({
        "type": "task",
        "task-id": task_id,
        "worker": worker.to_string(),
        "state": state.as_str(),
        "result": result.as_str()
    })
}

pub(crate) fn blob_notification(
    blob_id: &str,
    file_id: Option<&str>,
    worker: SessionKey,
    state: BlobShadowState,
    result: ResultCode,
) -> Value {
    json!({
        "type": "blob",
        "blob-id": blob_id,
        "file-id": file_id,
        "worker": worker.to_string(),
        "state": state.as_str(),
        "result": result.as_str()
    })
}

pub(crate) fn file_notification(file_id: &str, state: FileState, result: ResultCode) -> Value {
    json!({
        "type": "file",
        "file-id": file_id,
        "state": state.as_str(),
        "result": result.as_str()
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::mpsc::Receiver;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::{json, Value};

    use crate::diagnostics::ManagerIdentity;
    use crate::logging::tests::quiet_logger;
    use crate::multiplexer::{CloseReason, Readiness};
    use crate::orchestrator::files::FileState;
    use crate::orchestrator::tasks::TaskShadowState;
    use crate::server::{Outbound, PeerConnection, SessionKey};
    use crate::sessions::SessionRole;
    use crate::wire::codec::{CodecConfig, WireCodec};
    use crate::wire::envelope::ResultCode;

    use super::{Manager, ManagerSettings, FIRST_RPC_ID};

    /// Drives a manager with in-memory connections.
    pub(crate) struct Harness {
        pub(crate) manager: Manager,
        outbound: HashMap<SessionKey, Receiver<Outbound>>,
        closed: HashMap<SessionKey, bool>,
        next_key: u64,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self::with_quorum(1)
        }

        pub(crate) fn with_quorum(file_quorum: usize) -> Self {
            Self::with_settings(ManagerSettings {
                file_quorum,
                ..Self::default_settings()
            })
        }

        pub(crate) fn default_settings() -> ManagerSettings {
            ManagerSettings {
                codec: WireCodec::default(),
                file_quorum: 1,
                connect_timeout: Duration::seconds(5),
                notification_limit: 100,
            }
        }

        pub(crate) fn with_settings(settings: ManagerSettings) -> Self {
            Self {
                manager: Manager::new(
                    ManagerIdentity::new("dataswarm", 9123),
                    settings,
                    quiet_logger(),
                ),
                outbound: HashMap::new(),
                closed: HashMap::new(),
                next_key: 1,
            }
        }

        pub(crate) fn connect(&mut self) -> SessionKey {
            let key = SessionKey::new(self.next_key);
            self.next_key += 1;
            let addr: SocketAddr = "127.0.0.1:40000".parse().expect("addr");
            let (connection, outbound) = PeerConnection::detached(key, addr);
            self.outbound.insert(key, outbound);
            self.manager.handle_readiness(Readiness::Accepted {
                key,
                connection: Arc::new(connection),
            });
            key
        }

        pub(crate) fn send_raw(&mut self, key: SessionKey, frame: &[u8]) {
            self.manager.handle_readiness(Readiness::Message {
                key,
                frame: frame.to_vec(),
            });
        }

        pub(crate) fn send(&mut self, key: SessionKey, message: Value) {
            let frame = serde_json::to_vec(&message).expect("encode test message");
            self.send_raw(key, &frame);
        }

        /// Everything written to `key` since the last call.
        pub(crate) fn replies(&mut self, key: SessionKey) -> Vec<Value> {
            let mut replies = Vec::new();
            if let Some(outbound) = self.outbound.get(&key) {
                while let Ok(item) = outbound.try_recv() {
                    match item {
                        Outbound::Frame(frame) => {
                            assert_eq!(frame.last(), Some(&b'\n'));
                            replies.push(serde_json::from_slice(&frame).expect("reply is json"));
                        }
                        Outbound::Close => {
                            self.closed.insert(key, true);
                        }
                    }
                }
            }
            replies
        }

        pub(crate) fn is_closed(&mut self, key: SessionKey) -> bool {
            self.replies(key);
            self.closed.get(&key).copied().unwrap_or(false)
        }

        pub(crate) fn last_reply(&mut self, key: SessionKey) -> Value {
            self.replies(key).pop().expect("expected a reply")
        }

        pub(crate) fn handshake(&mut self, role: &str) -> SessionKey {
            let key = self.connect();
            self.send(
                key,
                json!({"method": "handshake", "params": {"type": role}, "id": 1}),
            );
            assert_eq!(self.last_reply(key), json!({"id": 1, "result": "SUCCESS"}));
            key
        }

        pub(crate) fn client(&mut self) -> SessionKey {
            self.handshake("client")
        }

        pub(crate) fn worker(&mut self) -> SessionKey {
            self.handshake("worker")
        }

        pub(crate) fn request(&mut self, key: SessionKey, method: &str, params: Value, id: i64) -> Value {
            self.send(key, json!({"method": method, "params": params, "id": id}));
            self.last_reply(key)
        }

        pub(crate) fn close(&mut self, key: SessionKey) {
            self.manager.handle_readiness(Readiness::Closed {
                key,
                reason: CloseReason::PeerClosed,
            });
        }

        pub(crate) fn advance(&mut self) {
            self.manager.advance(Utc::now());
        }

        pub(crate) fn submit_task(&mut self, client: SessionKey, id: i64) -> String {
            let reply = self.request(client, "task-submit", json!({"command": "echo hi"}), id);
            reply["value"].as_str().expect("task id").to_owned()
        }
    }

    #[test]
    fn client_handshake_registers_a_client_session() {
        let mut harness = Harness::new();
        let key = harness.connect();
        harness.send(
            key,
            json!({"method":"handshake","params":{"type":"client"},"id":1}),
        );

        assert_eq!(harness.replies(key), vec![json!({"id":1,"result":"SUCCESS"})]);
        assert_eq!(
            harness.manager.sessions().role_of(key),
            Some(SessionRole::Client)
        );
    }

    #[test]
    fn bad_handshake_is_answered_then_closed() {
        let mut harness = Harness::new();
        let key = harness.connect();
        harness.send(key, json!({"method":"status","params":{},"id":3}));

        let reply = harness.last_reply(key);
        assert_eq!(reply["id"], json!(3));
        assert_eq!(reply["result"], json!("UNEXPECTED_METHOD"));
        assert!(harness.is_closed(key));
        assert_eq!(harness.manager.sessions().role_of(key), None);
    }

    #[test]
    fn silent_connections_time_out() {
        let mut harness = Harness::new();
        let key = harness.connect();

        harness.manager.advance(Utc::now());
        assert!(!harness.is_closed(key));

        harness.manager.advance(Utc::now() + Duration::seconds(6));
        assert!(harness.is_closed(key));
        assert_eq!(harness.manager.sessions().pending_count(), 0);
    }

    #[test]
    fn unknown_methods_are_answered_on_both_roles() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();

        let reply = harness.request(client, "task-explode", json!({}), 2);
        assert_eq!(reply["result"], json!("UNEXPECTED_METHOD"));
        assert_eq!(reply["id"], json!(2));

        let reply = harness.request(worker, "file-submit", json!({}), 2);
        assert_eq!(reply["result"], json!("UNEXPECTED_METHOD"));
        assert!(!harness.is_closed(worker));
    }

    #[test]
    fn malformed_client_message_keeps_the_session() {
        let mut harness = Harness::new();
        let client = harness.client();

        harness.send_raw(client, b"{not json");
        assert_eq!(harness.last_reply(client)["result"], json!("MALFORMED_MESSAGE"));
        assert!(!harness.is_closed(client));

        let reply = harness.request(client, "queue-empty", json!({}), 2);
        assert_eq!(reply["result"], json!("SUCCESS"));
    }

    #[test]
    fn malformed_worker_message_disconnects() {
        let mut harness = Harness::new();
        let worker = harness.worker();

        harness.send(worker, json!({"params": {}, "id": 4}));
        assert_eq!(harness.last_reply(worker)["result"], json!("MALFORMED_MESSAGE"));
        assert!(harness.is_closed(worker));
        assert_eq!(harness.manager.sessions().worker_count(), 0);
    }

    #[test]
    fn request_ids_must_increase() {
        let mut harness = Harness::new();
        let client = harness.client();

        harness.request(client, "queue-empty", json!({}), 5);
        let reply = harness.request(client, "queue-empty", json!({}), 5);
        assert_eq!(reply["result"], json!("MALFORMED_ID"));
        assert_eq!(reply["id"], json!(5));
    }

    #[test]
    fn worker_loss_keeps_global_entries_queryable() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();

        let task_id = harness.submit_task(client, 2);
        harness
            .manager
            .place_task(&task_id, worker)
            .expect("task should be placed");
        let file_id = harness.request(client, "file-submit", json!({"size": 10}), 3)["value"]
            .as_str()
            .expect("file id")
            .to_owned();
        harness.advance();
        assert_eq!(
            harness.manager.files().get(&file_id).expect("file").replicas.len(),
            1
        );

        harness.close(worker);
        assert_eq!(harness.manager.sessions().worker(worker).map(|_| ()), None);

        let reply = harness.request(client, "task-retrieve", json!({"task-id": task_id}), 4);
        assert_eq!(reply["result"], json!("SUCCESS"));
        assert_eq!(reply["value"]["shadows"], json!([]));
        let file = harness.manager.files().get(&file_id).expect("file stays");
        assert!(file.replicas.is_empty());

        let reply = harness.request(client, "wait", json!({}), 5);
        let notifications = reply["value"].as_array().expect("notifications").clone();
        assert!(notifications.iter().any(|notification| {
            notification["task-id"] == json!(task_id)
                && notification["result"] == json!("WORKER_DISCONNECTED")
        }));
    }

    #[test]
    fn placing_a_task_sends_task_submit_with_manager_rpc_id() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);

        let rpc_id = harness.manager.place_task(&task_id, worker).expect("placed");
        assert_eq!(rpc_id, FIRST_RPC_ID);

        let sent = harness.last_reply(worker);
        assert_eq!(sent["method"], json!("task-submit"));
        assert_eq!(sent["id"], json!(FIRST_RPC_ID));
        assert_eq!(sent["params"]["task-id"], json!(task_id));
        assert_eq!(sent["params"]["description"]["command"], json!("echo hi"));

        let shadow = harness
            .manager
            .sessions()
            .worker(worker)
            .and_then(|worker| worker.task_shadow(&task_id))
            .expect("shadow");
        assert_eq!(shadow.lifecycle.in_transition(), TaskShadowState::Ready);
    }

    #[test]
    fn rejected_rpc_fails_the_shadow_and_notifies_the_owner() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);
        let rpc_id = harness.manager.place_task(&task_id, worker).expect("placed");
        harness.replies(worker);

        harness.send(
            worker,
            json!({"id": rpc_id, "result": "TOO_FULL", "value": {"message": "no cores"}}),
        );
        assert!(harness.replies(worker).is_empty());

        let shadow = harness
            .manager
            .sessions()
            .worker(worker)
            .and_then(|worker| worker.task_shadow(&task_id))
            .expect("shadow");
        assert!(shadow.lifecycle.is_settled());
        assert_eq!(shadow.lifecycle.state(), TaskShadowState::New);

        let reply = harness.request(client, "wait", json!({}), 3);
        assert_eq!(reply["value"][0]["result"], json!("TOO_FULL"));
        assert_eq!(reply["value"][0]["state"], json!("READY"));
    }

    #[test]
    fn unrecognised_rpc_result_fails_the_shadow_without_disconnecting() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);
        let rpc_id = harness.manager.place_task(&task_id, worker).expect("placed");
        harness.replies(worker);

        harness.send(worker, json!({"id": rpc_id, "result": "OUT_OF_LUCK"}));
        assert!(!harness.is_closed(worker));

        let shadow = harness
            .manager
            .sessions()
            .worker(worker)
            .and_then(|worker| worker.task_shadow(&task_id))
            .expect("shadow");
        assert_eq!(shadow.lifecycle.state(), TaskShadowState::New);
        assert_eq!(shadow.lifecycle.result(), ResultCode::Unable);
    }

    fn small_messages() -> ManagerSettings {
        ManagerSettings {
            codec: WireCodec::new(CodecConfig {
                max_message_size_bytes: 1024,
            }),
            ..Harness::default_settings()
        }
    }

    #[test]
    fn oversized_reply_is_answered_with_too_full() {
        let mut harness = Harness::with_settings(small_messages());
        let client = harness.client();

        let command = "x".repeat(940);
        let reply = harness.request(client, "task-submit", json!({"command": command}), 2);
        let task_id = reply["value"].as_str().expect("task id").to_owned();

        let reply = harness.request(client, "task-retrieve", json!({"task-id": task_id}), 3);
        assert_eq!(reply["id"], json!(3));
        assert_eq!(reply["result"], json!("TOO_FULL"));

        let reply = harness.request(client, "queue-empty", json!({}), 4);
        assert_eq!(reply["result"], json!("SUCCESS"));
    }

    #[test]
    fn wait_returns_what_fits_and_keeps_the_rest() {
        let mut harness = Harness::with_settings(small_messages());
        let client = harness.client();
        for n in 0..20 {
            harness.manager.notify(
                Some(client),
                json!({"type": "task", "task-id": format!("task-{n}"), "note": "y".repeat(60)}),
            );
        }

        let mut received = Vec::new();
        for id in 2..40 {
            let reply = harness.request(client, "wait", json!({}), id);
            assert_eq!(reply["result"], json!("SUCCESS"));
            let batch = reply["value"].as_array().expect("notifications").clone();
            if batch.is_empty() {
                break;
            }
            assert!(batch.len() < 20);
            received.extend(batch);
        }

        let ids = received
            .iter()
            .map(|notification| notification["task-id"].clone())
            .collect::<Vec<_>>();
        let expected = (0..20).map(|n| json!(format!("task-{n}"))).collect::<Vec<_>>();
        assert_eq!(ids, expected);
    }

    #[test]
    fn full_notification_queue_keeps_the_newest() {
        let mut harness = Harness::with_settings(ManagerSettings {
            notification_limit: 3,
            ..Harness::default_settings()
        });
        let client = harness.client();
        for n in 0..5 {
            harness.manager.notify(Some(client), json!({"n": n}));
        }

        let reply = harness.request(client, "wait", json!({}), 2);
        assert_eq!(reply["value"], json!([{"n": 2}, {"n": 3}, {"n": 4}]));
    }

    #[test]
    #[should_panic(expected = "already holds a shadow for task")]
    fn placing_the_same_task_twice_on_a_worker_panics() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);

        let _ = harness.manager.add_task_to_worker(worker, &task_id);
        let _ = harness.manager.add_task_to_worker(worker, &task_id);
    }

    #[test]
    #[should_panic(expected = "cannot shadow unknown task 'task-42'")]
    fn shadowing_an_unknown_task_panics() {
        let mut harness = Harness::new();
        let worker = harness.worker();
        let _ = harness.manager.add_task_to_worker(worker, "task-42");
    }

    #[test]
    fn pending_files_are_placed_on_the_least_loaded_workers() {
        let mut harness = Harness::with_quorum(2);
        let client = harness.client();
        let first = harness.worker();
        let second = harness.worker();
        let third = harness.worker();
        harness
            .manager
            .add_blob_to_worker(first, None, 0, json!({}))
            .expect("preload first worker");

        let file_id = harness.request(client, "file-submit", json!({"size": 64, "metadata": {"name": "reads.fq"}}), 2)["value"]
            .as_str()
            .expect("file id")
            .to_owned();
        harness.advance();

        let file = harness.manager.files().get(&file_id).expect("file");
        assert_eq!(file.state(), FileState::Allocating);
        let workers = file.replicas.iter().map(|replica| replica.worker).collect::<Vec<_>>();
        assert_eq!(workers, vec![second, third]);

        let create = harness.last_reply(second);
        assert_eq!(create["method"], json!("blob-create"));
        assert_eq!(create["params"]["size"], json!(64));
        assert_eq!(create["params"]["metadata"]["name"], json!("reads.fq"));
        assert!(harness.replies(first).is_empty());
    }

    #[test]
    fn files_wait_for_workers_before_allocating() {
        let mut harness = Harness::new();
        let client = harness.client();
        harness.request(client, "file-submit", json!({}), 2);
        harness.advance();

        let files = harness.manager.files().snapshot();
        assert_eq!(files[0].state(), FileState::Pending);
    }

    #[test]
    fn queue_is_empty_tracks_done_shadows() {
        let mut harness = Harness::new();
        assert!(harness.manager.queue_is_empty());

        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);
        assert!(!harness.manager.queue_is_empty());

        harness.manager.place_task(&task_id, worker).expect("placed");
        for (id, state) in [(2, "READY"), (3, "RUNNING"), (4, "DONE")] {
            let reply = harness.request(
                worker,
                "task-change",
                json!({"task-id": task_id, "state": state}),
                id,
            );
            assert_eq!(reply["result"], json!("SUCCESS"));
        }
        assert!(harness.manager.queue_is_empty());
    }
}
