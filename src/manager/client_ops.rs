use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::logging::LogLevel;
use crate::orchestrator::blobs::BlobShadowState;
use crate::orchestrator::files::FileState;
use crate::orchestrator::tasks::{TaskDescription, TaskShadowState};
use crate::orchestrator::RegistryError;
use crate::server::SessionKey;
use crate::sessions::{PendingWait, RpcTarget};
use crate::wire::envelope::{Request, ResultCode, UNKNOWN_REQUEST_ID};

use super::dispatch::{
    optional_object, optional_seconds, optional_str, optional_u64, required_str, MethodError,
    MethodHandler, Reply,
};
use super::Manager;

/// Longest a single `wait` may be deferred.
const MAX_WAIT_SECONDS: f64 = 86_400.0;

pub const METHODS: &[(&str, MethodHandler)] = &[
    ("task-submit", task_submit),
    ("task-delete", task_delete),
    ("task-retrieve", task_retrieve),
    ("file-submit", file_submit),
    ("file-commit", file_commit),
    ("file-delete", file_delete),
    ("file-copy", file_copy),
    ("service-submit", service_submit),
    ("service-delete", service_delete),
    ("project-create", project_create),
    ("project-delete", project_delete),
    ("wait", wait),
    ("queue-empty", queue_empty),
    ("status", status),
];

fn task_submit(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let description = TaskDescription::from_params(&request.params)?;
    let project = manager.projects.resolve(description.project.as_deref())?;
    let task_id = manager.tasks.submit(description, project.clone(), Some(key))?;

    manager.logger.log(
        LogLevel::Debug,
        Some("manager::tasks"),
        "Task submitted",
        Some(json!({ "task-id": task_id, "project": project, "owner": key.to_string() })),
    );
    Ok(Reply::Value(Some(Value::String(task_id))))
}

fn task_delete(manager: &mut Manager, _key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let task_id = required_str(&request.params, "task-id")?;
    let already_deleting = manager
        .tasks
        .get(task_id)
        .map(|task| task.deleting)
        .ok_or_else(|| RegistryError::NoSuchTask {
            task_id: task_id.to_owned(),
        })?;

    let mut holders = Vec::new();
    let mut to_drive = Vec::new();
    for (worker_key, worker) in manager.sessions.workers() {
        let Some(shadow) = worker.task_shadow(task_id) else {
            continue;
        };
        holders.push(worker_key);
        if !shadow.is_being_deleted() {
            to_drive.push(worker_key);
        }
    }

    if holders.is_empty() {
        manager.tasks.remove(task_id);
        manager
            .logger
            .debug(Some("manager::tasks"), &format!("{task_id} deleted"));
        return Ok(Reply::Value(None));
    }
    if already_deleting && to_drive.is_empty() {
        return Err(MethodError::new(
            ResultCode::InvalidTransition,
            format!("task '{task_id}' is already being deleted"),
        ));
    }

    if let Some(task) = manager.tasks.get_mut(task_id) {
        task.deleting = true;
    }
    for worker_key in to_drive {
        let requested = manager
            .sessions
            .worker_mut(worker_key)
            .and_then(|worker| worker.task_shadow_mut(task_id))
            .map(|shadow| shadow.lifecycle.redirect(TaskShadowState::Deleting));

        match requested {
            Some(Ok(())) => {
                let mut params = serde_json::Map::new();
                params.insert("task-id".to_owned(), Value::String(task_id.to_owned()));
                manager.send_rpc(
                    worker_key,
                    "task-remove",
                    params,
                    RpcTarget::Task {
                        task_id: task_id.to_owned(),
                    },
                )?;
            }
            Some(Err(error)) => manager.logger.debug(
                Some("manager::tasks"),
                &format!("{task_id} on {worker_key} not removable: {error}"),
            ),
            None => {}
        }
    }
    manager.release_stalled_deletion(task_id);
    Ok(Reply::Value(None))
}

fn task_retrieve(manager: &mut Manager, _key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let task_id = required_str(&request.params, "task-id")?;
    let task = manager
        .tasks
        .get(task_id)
        .ok_or_else(|| RegistryError::NoSuchTask {
            task_id: task_id.to_owned(),
        })?;

    let shadows = manager
        .sessions
        .workers()
        .filter_map(|(worker_key, worker)| {
            worker.task_shadow(task_id).map(|shadow| {
                json!({
                    "worker": worker_key.to_string(),
                    "state": shadow.lifecycle.state().as_str(),
                    "in-transition": shadow.lifecycle.in_transition().as_str(),
                    "result": shadow.lifecycle.result().as_str(),
                })
            })
        })
        .collect::<Vec<_>>();

    Ok(Reply::Value(Some(json!({
        "task-id": task.task_id,
        "description": task.description,
        "project": task.project,
        "deleting": task.deleting,
        "submitted-at": task.submitted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "shadows": shadows,
    }))))
}

fn file_submit(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let project = manager
        .projects
        .resolve(optional_str(&request.params, "project")?)?;
    let size = optional_u64(&request.params, "size")?.unwrap_or(0);
    let metadata = optional_object(&request.params, "metadata")?.unwrap_or_else(|| json!({}));

    let file_id = manager.files.submit(project, size, metadata, Some(key), None);
    manager
        .logger
        .debug(Some("manager::files"), &format!("{file_id} submitted ({size} bytes)"));
    Ok(Reply::Value(Some(Value::String(file_id))))
}

fn file_commit(manager: &mut Manager, _key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let file_id = required_str(&request.params, "file-id")?;
    manager.files.get_mut(file_id)?.begin_commit()?;
    manager.drive_replicas(file_id, BlobShadowState::ReadOnly, "blob-commit");
    Ok(Reply::Value(None))
}

fn file_delete(manager: &mut Manager, _key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let file_id = required_str(&request.params, "file-id")?;
    manager.files.get_mut(file_id)?.begin_delete()?;
    manager.drive_replicas(file_id, BlobShadowState::Deleting, "blob-delete");
    Ok(Reply::Value(None))
}

fn file_copy(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let source_id = required_str(&request.params, "file-id")?;
    let requested_project = optional_str(&request.params, "project")?;
    let source = manager.files.get(source_id).ok_or_else(|| RegistryError::NoSuchFile {
        file_id: source_id.to_owned(),
    })?;
    if source.state() != FileState::Immutable || !source.lifecycle.is_settled() {
        return Err(MethodError::new(
            ResultCode::InvalidTransition,
            format!("{source_id} is {} and only IMMUTABLE files can be copied", source.state()),
        ));
    }

    let (size, metadata) = (source.size, source.metadata.clone());
    let project = match requested_project {
        Some(_) => manager.projects.resolve(requested_project)?,
        None => source.project.clone(),
    };
    let file_id = manager
        .files
        .submit(project, size, metadata, Some(key), Some(source_id.to_owned()));
    Ok(Reply::Value(Some(Value::String(file_id))))
}

fn service_submit(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let project = manager
        .projects
        .resolve(optional_str(&request.params, "project")?)?;
    let service_id = manager
        .services
        .submit(request.params.clone(), project, Some(key));
    Ok(Reply::Value(Some(Value::String(service_id))))
}

fn service_delete(manager: &mut Manager, _key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let service_id = required_str(&request.params, "service-id")?;
    manager.services.delete(service_id)?;
    Ok(Reply::Value(None))
}

fn project_create(manager: &mut Manager, _key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let name = required_str(&request.params, "name")?;
    manager.projects.create(name)?;
    manager
        .logger
        .info(Some("manager::projects"), &format!("project '{name}' created"));
    Ok(Reply::Value(None))
}

fn project_delete(manager: &mut Manager, _key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let name = required_str(&request.params, "name")?;
    let references = manager.tasks.count_in_project(name)
        + manager.files.count_in_project(name)
        + manager.services.count_in_project(name);
    manager.projects.delete(name, references)?;
    manager
        .logger
        .info(Some("manager::projects"), &format!("project '{name}' deleted"));
    Ok(Reply::Value(None))
}

/// Drains the notification queue now, or parks the request until something
/// arrives or the timeout passes. A newer wait answers the older one with
/// an empty list.
fn wait(manager: &mut Manager, key: SessionKey, request: &Request) -> Result<Reply, MethodError> {
    let timeout = optional_seconds(&request.params, "timeout")?
        .unwrap_or(0.0)
        .min(MAX_WAIT_SECONDS);
    let request_id = request.id.unwrap_or(UNKNOWN_REQUEST_ID);

    let not_a_client = || MethodError::new(ResultCode::Unable, format!("{key} is not a client"));
    let replaced = manager
        .sessions
        .client_mut(key)
        .ok_or_else(not_a_client)?
        .pending_wait
        .take();
    if let Some(previous) = replaced {
        manager.send_value(key, previous.request_id, Some(json!([])));
    }

    let queued = manager
        .sessions
        .client_mut(key)
        .ok_or_else(not_a_client)?
        .has_notifications();
    if queued || timeout <= 0.0 {
        let batch = manager.take_notification_batch(key, request_id);
        return Ok(Reply::Value(Some(Value::Array(batch))));
    }

    let client = manager.sessions.client_mut(key).ok_or_else(not_a_client)?;
    client.pending_wait = Some(PendingWait {
        request_id,
        deadline: Utc::now() + Duration::milliseconds((timeout * 1_000.0) as i64),
    });
    Ok(Reply::Deferred)
}

fn queue_empty(manager: &mut Manager, _key: SessionKey, _request: &Request) -> Result<Reply, MethodError> {
    Ok(Reply::Value(Some(Value::Bool(manager.queue_is_empty()))))
}

fn status(manager: &mut Manager, _key: SessionKey, _request: &Request) -> Result<Reply, MethodError> {
    Ok(Reply::Value(Some(manager.status_document(Utc::now()))))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::manager::tests::Harness;
    use crate::orchestrator::files::FileState;

    #[test]
    fn task_ids_follow_submission_order() {
        let mut harness = Harness::new();
        let client = harness.client();

        let first = harness.request(client, "task-submit", json!({"command": "sleep 1"}), 2);
        assert_eq!(first, json!({"id": 2, "result": "SUCCESS", "value": "task-0"}));
        let second = harness.request(client, "task-submit", json!({"command": "sleep 2"}), 3);
        assert_eq!(second["value"], json!("task-1"));

        let retrieved = harness.request(client, "task-retrieve", json!({"task-id": "task-1"}), 4);
        assert_eq!(retrieved["value"]["description"]["task-id"], json!("task-1"));
        assert_eq!(retrieved["value"]["description"]["command"], json!("sleep 2"));
        assert_eq!(retrieved["value"]["project"], json!("dataswarm"));
        assert_eq!(retrieved["value"]["deleting"], json!(false));
    }

    #[test]
    fn invalid_descriptions_do_not_consume_ids() {
        let mut harness = Harness::new();
        let client = harness.client();

        let reply = harness.request(client, "task-submit", json!({"cores": 4}), 2);
        assert_eq!(reply["result"], json!("MALFORMED_PARAMETERS"));
        assert!(reply["value"]["message"].is_string());

        let reply = harness.request(client, "task-submit", json!({"command": "   "}), 3);
        assert_eq!(reply["result"], json!("MALFORMED_PARAMETERS"));

        let reply = harness.request(
            client,
            "task-submit",
            json!({"command": "ls", "project": "nowhere"}),
            4,
        );
        assert_eq!(reply["result"], json!("NO_SUCH_PROJECT"));

        assert_eq!(harness.submit_task(client, 5), "task-0");
    }

    #[test]
    fn requests_without_id_are_answered_with_zero() {
        let mut harness = Harness::new();
        let client = harness.client();

        harness.send(client, json!({"method": "task-submit", "params": {"command": "ls"}}));
        assert_eq!(
            harness.last_reply(client),
            json!({"id": 0, "result": "SUCCESS", "value": "task-0"})
        );
    }

    #[test]
    fn unplaced_tasks_are_deleted_at_once() {
        let mut harness = Harness::new();
        let client = harness.client();
        let task_id = harness.submit_task(client, 2);

        let reply = harness.request(client, "task-delete", json!({"task-id": task_id}), 3);
        assert_eq!(reply, json!({"id": 3, "result": "SUCCESS"}));

        let reply = harness.request(client, "task-retrieve", json!({"task-id": task_id}), 4);
        assert_eq!(reply["result"], json!("NO_SUCH_TASK"));
        let reply = harness.request(client, "task-delete", json!({"task-id": task_id}), 5);
        assert_eq!(reply["result"], json!("NO_SUCH_TASK"));
    }

    #[test]
    fn placed_tasks_are_removed_from_workers_first() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);
        harness.manager.place_task(&task_id, worker).expect("placed");
        harness.request(worker, "task-change", json!({"task-id": task_id, "state": "READY"}), 2);
        harness.replies(worker);

        let reply = harness.request(client, "task-delete", json!({"task-id": task_id}), 3);
        assert_eq!(reply["result"], json!("SUCCESS"));
        let remove = harness.last_reply(worker);
        assert_eq!(remove["method"], json!("task-remove"));
        assert_eq!(remove["params"], json!({"task-id": task_id}));

        let reply = harness.request(client, "task-delete", json!({"task-id": task_id}), 4);
        assert_eq!(reply["result"], json!("INVALID_TRANSITION"));
        let reply = harness.request(client, "task-retrieve", json!({"task-id": task_id}), 5);
        assert_eq!(reply["value"]["deleting"], json!(true));

        for (id, state) in [(3, "DELETING"), (4, "DELETED")] {
            let reply = harness.request(
                worker,
                "task-change",
                json!({"task-id": task_id, "state": state}),
                id,
            );
            assert_eq!(reply["result"], json!("SUCCESS"));
        }
        harness.advance();

        assert!(harness.manager.tasks().get(&task_id).is_none());
        let reply = harness.request(client, "wait", json!({}), 6);
        let notifications = reply["value"].as_array().expect("notifications").clone();
        assert_eq!(
            notifications.last().map(|notification| notification["state"].clone()),
            Some(json!("DELETED"))
        );
    }

    #[test]
    fn refused_task_remove_lets_the_delete_be_retried() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);
        harness.manager.place_task(&task_id, worker).expect("placed");
        harness.request(worker, "task-change", json!({"task-id": task_id, "state": "READY"}), 2);
        harness.replies(worker);

        harness.request(client, "task-delete", json!({"task-id": task_id}), 3);
        let first_remove = harness.last_reply(worker);
        harness.send(worker, json!({"id": first_remove["id"], "result": "UNABLE"}));

        let reply = harness.request(client, "task-retrieve", json!({"task-id": task_id}), 4);
        assert_eq!(reply["value"]["deleting"], json!(false));
        assert_eq!(reply["value"]["shadows"][0]["state"], json!("READY"));
        assert_eq!(reply["value"]["shadows"][0]["result"], json!("UNABLE"));

        let reply = harness.request(client, "task-delete", json!({"task-id": task_id}), 5);
        assert_eq!(reply["result"], json!("SUCCESS"));
        let second_remove = harness.last_reply(worker);
        assert_eq!(second_remove["method"], json!("task-remove"));
        assert_ne!(second_remove["id"], first_remove["id"]);

        harness.request(worker, "task-change", json!({"task-id": task_id, "state": "DELETED"}), 3);
        harness.advance();
        assert!(harness.manager.tasks().get(&task_id).is_none());
    }

    #[test]
    fn refused_blob_delete_lets_the_file_delete_be_retried() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let file_id = harness.request(client, "file-submit", json!({"size": 5}), 2)["value"]
            .as_str()
            .expect("file id")
            .to_owned();
        harness.advance();
        let blob_id = harness.last_reply(worker)["params"]["blob-id"]
            .as_str()
            .expect("blob id")
            .to_owned();
        harness.request(worker, "blob-change", json!({"blob-id": blob_id, "state": "READ-WRITE"}), 2);
        harness.advance();

        harness.request(client, "file-delete", json!({"file-id": file_id}), 3);
        assert_eq!(harness.last_reply(worker)["method"], json!("blob-delete"));
        harness.request(
            worker,
            "blob-change",
            json!({"blob-id": blob_id, "state": "DELETED", "result": "UNABLE"}),
            3,
        );
        harness.advance();
        let file = harness.manager.files().get(&file_id).expect("file kept");
        assert_eq!(file.state(), FileState::Deleting);
        assert!(file.lifecycle.is_settled());

        let reply = harness.request(client, "file-delete", json!({"file-id": file_id}), 4);
        assert_eq!(reply["result"], json!("SUCCESS"));
        assert_eq!(harness.last_reply(worker)["method"], json!("blob-delete"));

        harness.request(worker, "blob-change", json!({"blob-id": blob_id, "state": "DELETED"}), 4);
        harness.advance();
        assert!(harness.manager.files().get(&file_id).is_none());
    }

    #[test]
    fn file_operations_check_the_file_state() {
        let mut harness = Harness::new();
        let client = harness.client();

        let reply = harness.request(client, "file-submit", json!({"size": 12}), 2);
        let file_id = reply["value"].as_str().expect("file id").to_owned();
        assert_eq!(file_id, "file-0");

        let reply = harness.request(client, "file-commit", json!({"file-id": file_id}), 3);
        assert_eq!(reply["result"], json!("INVALID_TRANSITION"));
        let reply = harness.request(client, "file-copy", json!({"file-id": file_id}), 4);
        assert_eq!(reply["result"], json!("INVALID_TRANSITION"));
        let reply = harness.request(client, "file-commit", json!({"file-id": "file-9"}), 5);
        assert_eq!(reply["result"], json!("NO_SUCH_FILE"));
        let reply = harness.request(client, "file-submit", json!({"size": "big"}), 6);
        assert_eq!(reply["result"], json!("MALFORMED_PARAMETERS"));

        let reply = harness.request(client, "file-delete", json!({"file-id": file_id}), 7);
        assert_eq!(reply["result"], json!("SUCCESS"));
        let reply = harness.request(client, "file-delete", json!({"file-id": file_id}), 8);
        assert_eq!(reply["result"], json!("INVALID_TRANSITION"));

        harness.advance();
        assert!(harness.manager.files().get(&file_id).is_none());
        let reply = harness.request(client, "wait", json!({}), 9);
        assert_eq!(reply["value"][0]["state"], json!("DELETED"));
    }

    #[test]
    fn immutable_files_can_be_copied_into_other_projects() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        harness.request(client, "project-create", json!({"name": "assembly"}), 2);

        let file_id = harness.request(
            client,
            "file-submit",
            json!({"size": 7, "metadata": {"name": "contigs.fa"}}),
            3,
        )["value"]
            .as_str()
            .expect("file id")
            .to_owned();
        harness.advance();
        let create = harness.last_reply(worker);
        let blob_id = create["params"]["blob-id"].as_str().expect("blob id").to_owned();

        harness.request(worker, "blob-change", json!({"blob-id": blob_id, "state": "READ-WRITE"}), 2);
        harness.advance();
        harness.request(client, "file-commit", json!({"file-id": file_id}), 4);
        harness.request(worker, "blob-change", json!({"blob-id": blob_id, "state": "READ-ONLY"}), 3);
        harness.advance();
        assert_eq!(
            harness.manager.files().get(&file_id).map(|file| file.state()),
            Some(FileState::Immutable)
        );

        let reply = harness.request(
            client,
            "file-copy",
            json!({"file-id": file_id, "project": "assembly"}),
            5,
        );
        let copy_id = reply["value"].as_str().expect("copy id").to_owned();
        let copy = harness.manager.files().get(&copy_id).expect("copy");
        assert_eq!(copy.state(), FileState::Pending);
        assert_eq!(copy.size, 7);
        assert_eq!(copy.project, "assembly");
        assert_eq!(copy.copy_of.as_deref(), Some(file_id.as_str()));
        assert_eq!(copy.metadata["name"], json!("contigs.fa"));
    }

    #[test]
    fn projects_guard_their_references() {
        let mut harness = Harness::new();
        let client = harness.client();

        let reply = harness.request(client, "project-create", json!({"name": "rnaseq"}), 2);
        assert_eq!(reply["result"], json!("SUCCESS"));
        let reply = harness.request(client, "project-create", json!({"name": "rnaseq"}), 3);
        assert_eq!(reply["result"], json!("ALREADY_EXISTS"));

        let reply = harness.request(
            client,
            "service-submit",
            json!({"command": "httpd", "project": "rnaseq"}),
            4,
        );
        let service_id = reply["value"].as_str().expect("service id").to_owned();
        assert_eq!(service_id, "service-0");

        let reply = harness.request(client, "project-delete", json!({"name": "rnaseq"}), 5);
        assert_eq!(reply["result"], json!("PROJECT_IN_USE"));

        let reply = harness.request(client, "service-delete", json!({"service-id": service_id}), 6);
        assert_eq!(reply["result"], json!("SUCCESS"));
        let reply = harness.request(client, "service-delete", json!({"service-id": service_id}), 7);
        assert_eq!(reply["result"], json!("NO_SUCH_SERVICE"));

        let reply = harness.request(client, "project-delete", json!({"name": "rnaseq"}), 8);
        assert_eq!(reply["result"], json!("SUCCESS"));
        let reply = harness.request(client, "project-delete", json!({"name": "rnaseq"}), 9);
        assert_eq!(reply["result"], json!("NO_SUCH_PROJECT"));
        let reply = harness.request(client, "project-delete", json!({"name": "dataswarm"}), 10);
        assert_eq!(reply["result"], json!("BAD_PERMISSION"));
    }

    #[test]
    fn wait_without_timeout_answers_immediately() {
        let mut harness = Harness::new();
        let client = harness.client();

        let reply = harness.request(client, "wait", json!({}), 2);
        assert_eq!(reply, json!({"id": 2, "result": "SUCCESS", "value": []}));
        let reply = harness.request(client, "wait", json!({"timeout": -1}), 3);
        assert_eq!(reply["result"], json!("MALFORMED_PARAMETERS"));
    }

    #[test]
    fn deferred_wait_is_answered_by_a_notification() {
        let mut harness = Harness::new();
        let client = harness.client();
        let worker = harness.worker();
        let task_id = harness.submit_task(client, 2);
        harness.manager.place_task(&task_id, worker).expect("placed");

        harness.send(client, json!({"method": "wait", "params": {"timeout": 30}, "id": 3}));
        assert!(harness.replies(client).is_empty());
        harness.advance();
        assert!(harness.replies(client).is_empty());

        harness.request(worker, "task-change", json!({"task-id": task_id, "state": "READY"}), 2);
        harness.advance();
        let reply = harness.last_reply(client);
        assert_eq!(reply["id"], json!(3));
        assert_eq!(reply["value"][0]["task-id"], json!(task_id));
        assert_eq!(reply["value"][0]["state"], json!("READY"));
    }

    #[test]
    fn deferred_wait_expires_empty_and_is_replaced_by_a_newer_wait() {
        let mut harness = Harness::new();
        let client = harness.client();

        harness.send(client, json!({"method": "wait", "params": {"timeout": 10}, "id": 2}));
        harness.send(client, json!({"method": "wait", "params": {"timeout": 10}, "id": 3}));
        assert_eq!(
            harness.replies(client),
            vec![json!({"id": 2, "result": "SUCCESS", "value": []})]
        );

        harness.manager.advance(Utc::now() + Duration::seconds(11));
        assert_eq!(
            harness.replies(client),
            vec![json!({"id": 3, "result": "SUCCESS", "value": []})]
        );
    }

    #[test]
    fn status_reports_the_manager_document() {
        let mut harness = Harness::new();
        let client = harness.client();
        harness.worker();

        let reply = harness.request(client, "status", json!({}), 2);
        assert_eq!(reply["result"], json!("SUCCESS"));
        assert_eq!(reply["value"]["type"], json!("ds_manager"));
        assert_eq!(reply["value"]["project"], json!("dataswarm"));
        assert_eq!(reply["value"]["port"], json!(9123));
        assert_eq!(reply["value"]["sessions"]["workers_total"], json!(1));
        assert_eq!(reply["value"]["sessions"]["clients"], json!(1));
    }

    #[test]
    fn queue_empty_reports_a_boolean() {
        let mut harness = Harness::new();
        let client = harness.client();

        let reply = harness.request(client, "queue-empty", json!({}), 2);
        assert_eq!(reply["value"], json!(true));
        harness.submit_task(client, 3);
        let reply = harness.request(client, "queue-empty", json!({}), 4);
        assert_eq!(reply["value"], json!(false));
    }
}
