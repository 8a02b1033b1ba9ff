use chrono::Utc;
use serde_json::Value;

use crate::orchestrator::blobs::BlobShadowState;
use crate::orchestrator::tasks::TaskShadowState;
use crate::orchestrator::transition::{LifecycleState, Tracked, TransitionOutcome};
use crate::orchestrator::RegistryError;
use crate::server::SessionKey;
use crate::sessions::{StatusReport, WorkerSession};
use crate::wire::envelope::{Request, ResultCode};

use super::dispatch::{optional_result, required_str, MethodError, MethodHandler, Reply};
use super::{blob_notification, task_notification, Manager};

pub const METHODS: &[(&str, MethodHandler)] = &[
    ("task-change", task_change),
    ("blob-change", blob_change),
    ("status-report", status_report),
];

fn worker_session(manager: &mut Manager, key: SessionKey) -> Result<&mut WorkerSession, MethodError> {
    manager
        .sessions
        .worker_mut(key)
        .ok_or_else(|| MethodError::new(ResultCode::Unable, format!("{key} is not a worker")))
}

/// Applies a worker report. A successful report of a state one legal edge
/// past the pending target confirms the target first.
fn apply_report<S: LifecycleState>(
    lifecycle: &mut Tracked<S>,
    reported: S,
    result: ResultCode,
) -> Result<TransitionOutcome<S>, MethodError> {
    let error = match lifecycle.apply_report(reported, result) {
        Ok(outcome) => return Ok(outcome),
        Err(error) => error,
    };

    let pending = lifecycle.in_transition();
    if !lifecycle.is_settled() && pending.can_transition_to(reported) {
        let from = lifecycle.state();
        lifecycle.settle();
        if let Ok(TransitionOutcome::Settled { to, .. }) = lifecycle.advance(reported) {
            return Ok(TransitionOutcome::Settled { from, to });
        }
    }
    Err(MethodError::new(ResultCode::InvalidTransition, error.to_string()))
}

fn task_change(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let task_id = required_str(&request.params, "task-id")?;
    let raw_state = required_str(&request.params, "state")?;
    let reported = TaskShadowState::parse(raw_state).ok_or_else(|| {
        MethodError::malformed_parameters(format!("unknown task state '{raw_state}'"))
    })?;
    let result = optional_result(&request.params)?;

    let worker = worker_session(manager, key)?;
    let shadow = worker
        .task_shadow_mut(task_id)
        .ok_or_else(|| RegistryError::NoSuchTask {
            task_id: task_id.to_owned(),
        })?;
    let outcome = apply_report(&mut shadow.lifecycle, reported, result)?;

    let notification = match outcome {
        TransitionOutcome::Settled { to, .. } => {
            if to == TaskShadowState::Deleted {
                worker.remove_task_shadow(task_id);
            }
            task_notification(task_id, key, to, ResultCode::Success)
        }
        TransitionOutcome::Failed {
            attempted, result, ..
        } => {
            manager.logger.warn(
                Some("manager::tasks"),
                &format!("{task_id} on {key} failed to reach {attempted}: {result}"),
            );
            task_notification(task_id, key, attempted, result)
        }
        TransitionOutcome::Unchanged { .. } => return Ok(Reply::Value(None)),
    };

    let owner = manager.tasks.get(task_id).and_then(|task| task.owner);
    manager.notify(owner, notification);
    manager.release_stalled_deletion(task_id);
    Ok(Reply::Value(None))
}

fn blob_change(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let blob_id = required_str(&request.params, "blob-id")?;
    let raw_state = required_str(&request.params, "state")?;
    let reported = BlobShadowState::parse_reported(raw_state).ok_or_else(|| {
        MethodError::malformed_parameters(format!("unknown blob state '{raw_state}'"))
    })?;
    let result = optional_result(&request.params)?;

    let worker = worker_session(manager, key)?;
    let shadow = worker.blob_shadow_mut(blob_id).ok_or_else(|| {
        MethodError::new(
            ResultCode::NoSuchBlob,
            format!("{key} holds no blob '{blob_id}'"),
        )
    })?;
    let outcome = apply_report(&mut shadow.lifecycle, reported, result)?;
    let file_id = shadow.file_id.clone();

    // File state follows from its replicas in the next advance step; only
    // failures are reported per blob.
    if let TransitionOutcome::Failed {
        attempted, result, ..
    } = outcome
    {
        manager.logger.warn(
            Some("manager::files"),
            &format!("{blob_id} on {key} failed to reach {attempted}: {result}"),
        );
        let owner = file_id
            .as_deref()
            .and_then(|file_id| manager.files.get(file_id))
            .and_then(|file| file.owner);
        manager.notify(
            owner,
            blob_notification(blob_id, file_id.as_deref(), key, attempted, result),
        );
    }
    Ok(Reply::Value(None))
}

fn status_report(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let worker = worker_session(manager, key)?;
    worker.status_report = Some(StatusReport {
        received_at: Utc::now(),
        report: Value::Object(request.params.clone()),
    });
    manager
        .logger
        .verbose(Some("manager::workers"), &format!("status report from {key}"));
    Ok(Reply::Value(None))
}
