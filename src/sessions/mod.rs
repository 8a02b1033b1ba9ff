use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::orchestrator::blobs::BlobShadow;
use crate::orchestrator::tasks::TaskShadow;
use crate::server::{PeerConnection, SessionKey};
use crate::wire::handshake::PeerRole;

#[derive(Debug, PartialEq, Eq)]
pub enum SessionPoolError {
    PendingNotFound { key: SessionKey },
    SessionNotFound { key: SessionKey },
}

impl fmt::Display for SessionPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingNotFound { key } => write!(f, "pending connection {key} not found"),
            Self::SessionNotFound { key } => write!(f, "session {key} not found"),
        }
    }
}

impl std::error::Error for SessionPoolError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Pending,
    Worker,
    Client,
}

/// An accepted connection that has not completed its handshake.
#[derive(Debug)]
pub struct PendingConnection {
    pub connection: Arc<PeerConnection>,
    pub connected_at: DateTime<Utc>,
}

/// What an outstanding manager-to-worker RPC was about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcTarget {
    Task { task_id: String },
    Blob { blob_id: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutstandingRpc {
    pub method: &'static str,
    pub target: RpcTarget,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub received_at: DateTime<Utc>,
    pub report: Value,
}

#[derive(Debug)]
pub struct WorkerSession {
    pub connection: Arc<PeerConnection>,
    pub promoted_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_request_id: i64,
    pub status_report: Option<StatusReport>,
    tasks: BTreeMap<String, TaskShadow>,
    blobs: BTreeMap<String, BlobShadow>,
    outstanding: HashMap<i64, OutstandingRpc>,
}

impl WorkerSession {
    fn new(connection: Arc<PeerConnection>, last_request_id: i64) -> Self {
        let now = Utc::now();
        Self {
            connection,
            promoted_at: now,
            last_seen_at: now,
            last_request_id,
            status_report: None,
            tasks: BTreeMap::new(),
            blobs: BTreeMap::new(),
            outstanding: HashMap::new(),
        }
    }

    /// A worker holds at most one shadow per task; a second one means the
    /// manager's bookkeeping is corrupt.
    pub fn insert_task_shadow(&mut self, shadow: TaskShadow) {
        if self.tasks.contains_key(&shadow.task_id) {
            panic!(
                "worker {} already holds a shadow for task '{}'",
                self.connection.key(),
                shadow.task_id
            );
        }
        self.tasks.insert(shadow.task_id.clone(), shadow);
    }

    pub fn insert_blob_shadow(&mut self, shadow: BlobShadow) {
        if self.blobs.contains_key(&shadow.blob_id) {
            panic!(
                "worker {} already holds a shadow for blob '{}'",
                self.connection.key(),
                shadow.blob_id
            );
        }
        self.blobs.insert(shadow.blob_id.clone(), shadow);
    }

    pub fn task_shadow(&self, task_id: &str) -> Option<&TaskShadow> {
        self.tasks.get(task_id)
    }

    pub fn task_shadow_mut(&mut self, task_id: &str) -> Option<&mut TaskShadow> {
        self.tasks.get_mut(task_id)
    }

    pub fn remove_task_shadow(&mut self, task_id: &str) -> Option<TaskShadow> {
        self.tasks.remove(task_id)
    }

    pub fn task_shadows(&self) -> impl Iterator<Item = &TaskShadow> {
        self.tasks.values()
    }

    pub fn blob_shadow(&self, blob_id: &str) -> Option<&BlobShadow> {
        self.blobs.get(blob_id)
    }

    pub fn blob_shadow_mut(&mut self, blob_id: &str) -> Option<&mut BlobShadow> {
        self.blobs.get_mut(blob_id)
    }

    pub fn remove_blob_shadow(&mut self, blob_id: &str) -> Option<BlobShadow> {
        self.blobs.remove(blob_id)
    }

    pub fn blob_shadows(&self) -> impl Iterator<Item = &BlobShadow> {
        self.blobs.values()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn track_rpc(&mut self, rpc_id: i64, rpc: OutstandingRpc) {
        self.outstanding.insert(rpc_id, rpc);
    }

    pub fn take_rpc(&mut self, rpc_id: i64) -> Option<OutstandingRpc> {
        self.outstanding.remove(&rpc_id)
    }

    pub fn outstanding_rpcs(&self) -> usize {
        self.outstanding.len()
    }
}

/// A deferred `wait` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingWait {
    pub request_id: i64,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ClientSession {
    pub connection: Arc<PeerConnection>,
    pub promoted_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_request_id: i64,
    pub pending_wait: Option<PendingWait>,
    notifications: VecDeque<Value>,
}

impl ClientSession {
    fn new(connection: Arc<PeerConnection>, last_request_id: i64) -> Self {
        let now = Utc::now();
        Self {
            connection,
            promoted_at: now,
            last_seen_at: now,
            last_request_id,
            pending_wait: None,
            notifications: VecDeque::new(),
        }
    }

    /// Queues a notification, dropping the oldest one once `limit` are
    /// waiting. Returns what was dropped.
    pub fn notify(&mut self, notification: Value, limit: usize) -> Option<Value> {
        let dropped = if self.notifications.len() >= limit.max(1) {
            self.notifications.pop_front()
        } else {
            None
        };
        self.notifications.push_back(notification);
        dropped
    }

    /// The first `count` queued notifications, left in the queue.
    pub fn peek_notifications(&self, count: usize) -> Vec<Value> {
        self.notifications.iter().take(count).cloned().collect()
    }

    pub fn consume_notifications(&mut self, count: usize) {
        let count = count.min(self.notifications.len());
        self.notifications.drain(..count);
    }

    pub fn has_notifications(&self) -> bool {
        !self.notifications.is_empty()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }
}

/// A session that was just removed from the pools, handed back so the caller
/// can clean up what it referenced.
#[derive(Debug)]
pub enum ReleasedSession {
    Pending(PendingConnection),
    Worker(WorkerSession),
    Client(ClientSession),
}

impl ReleasedSession {
    pub fn connection(&self) -> &Arc<PeerConnection> {
        match self {
            Self::Pending(pending) => &pending.connection,
            Self::Worker(worker) => &worker.connection,
            Self::Client(client) => &client.connection,
        }
    }

    pub fn role(&self) -> SessionRole {
        match self {
            Self::Pending(_) => SessionRole::Pending,
            Self::Worker(_) => SessionRole::Worker,
            Self::Client(_) => SessionRole::Client,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionPools {
    pending: BTreeMap<SessionKey, PendingConnection>,
    workers: BTreeMap<SessionKey, WorkerSession>,
    clients: BTreeMap<SessionKey, ClientSession>,
}

impl SessionPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pending(&mut self, connection: Arc<PeerConnection>) -> SessionKey {
        let key = connection.key();
        self.pending.insert(
            key,
            PendingConnection {
                connection,
                connected_at: Utc::now(),
            },
        );
        key
    }

    /// Moves a pending connection into the pool for `role`, keeping its key.
    pub fn promote(
        &mut self,
        key: SessionKey,
        role: PeerRole,
        handshake_id: i64,
    ) -> Result<(), SessionPoolError> {
        let pending = self
            .pending
            .remove(&key)
            .ok_or(SessionPoolError::PendingNotFound { key })?;

        match role {
            PeerRole::Worker => {
                self.workers
                    .insert(key, WorkerSession::new(pending.connection, handshake_id));
            }
            PeerRole::Client => {
                self.clients
                    .insert(key, ClientSession::new(pending.connection, handshake_id));
            }
        }
        Ok(())
    }

    pub fn release(&mut self, key: SessionKey) -> Result<ReleasedSession, SessionPoolError> {
        if let Some(pending) = self.pending.remove(&key) {
            return Ok(ReleasedSession::Pending(pending));
        }
        if let Some(worker) = self.workers.remove(&key) {
            return Ok(ReleasedSession::Worker(worker));
        }
        if let Some(client) = self.clients.remove(&key) {
            return Ok(ReleasedSession::Client(client));
        }
        Err(SessionPoolError::SessionNotFound { key })
    }

    pub fn role_of(&self, key: SessionKey) -> Option<SessionRole> {
        if self.pending.contains_key(&key) {
            Some(SessionRole::Pending)
        } else if self.workers.contains_key(&key) {
            Some(SessionRole::Worker)
        } else if self.clients.contains_key(&key) {
            Some(SessionRole::Client)
        } else {
            None
        }
    }

    pub fn connection(&self, key: SessionKey) -> Option<&Arc<PeerConnection>> {
        self.pending
            .get(&key)
            .map(|pending| &pending.connection)
            .or_else(|| self.workers.get(&key).map(|worker| &worker.connection))
            .or_else(|| self.clients.get(&key).map(|client| &client.connection))
    }

    /// Pending connections that connected more than `timeout` before `now`.
    pub fn expired_pending(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<SessionKey> {
        self.pending
            .iter()
            .filter(|(_, pending)| now - pending.connected_at >= timeout)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn worker(&self, key: SessionKey) -> Option<&WorkerSession> {
        self.workers.get(&key)
    }

    pub fn worker_mut(&mut self, key: SessionKey) -> Option<&mut WorkerSession> {
        self.workers.get_mut(&key)
    }

    pub fn client(&self, key: SessionKey) -> Option<&ClientSession> {
        self.clients.get(&key)
    }

    pub fn client_mut(&mut self, key: SessionKey) -> Option<&mut ClientSession> {
        self.clients.get_mut(&key)
    }

    /// Workers in key order.
    pub fn workers(&self) -> impl Iterator<Item = (SessionKey, &WorkerSession)> {
        self.workers.iter().map(|(key, worker)| (*key, worker))
    }

    pub fn clients(&self) -> impl Iterator<Item = (SessionKey, &ClientSession)> {
        self.clients.iter().map(|(key, client)| (*key, client))
    }

    pub fn clients_mut(&mut self) -> impl Iterator<Item = (SessionKey, &mut ClientSession)> {
        self.clients.iter_mut().map(|(key, client)| (*key, client))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.pending
            .keys()
            .chain(self.workers.keys())
            .chain(self.clients.keys())
            .copied()
            .collect()
    }
}
