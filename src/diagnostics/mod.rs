use std::fs;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::orchestrator::files::FileRegistry;
use crate::orchestrator::projects::ProjectRegistry;
use crate::orchestrator::services::ServiceRegistry;
use crate::orchestrator::tasks::TaskRegistry;
use crate::sessions::SessionPools;

pub const CATALOG_TYPE: &str = "ds_manager";

/// Who this manager is, fixed at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerIdentity {
    pub manager_id: Uuid,
    pub project: String,
    pub port: u16,
    pub owner: String,
    pub started_at: DateTime<Utc>,
}

impl ManagerIdentity {
    pub fn new(project: impl Into<String>, port: u16) -> Self {
        Self {
            manager_id: Uuid::new_v4(),
            project: project.into(),
            port,
            owner: login_user(),
            started_at: Utc::now(),
        }
    }
}

/// Login name of the user running the manager.
pub fn login_user() -> String {
    ["USER", "LOGNAME"]
        .into_iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "unknown".to_owned())
}

pub fn build_catalog_document(identity: &ManagerIdentity) -> Value {
    json!({
        "type": CATALOG_TYPE,
        "project": identity.project,
        "starttime": identity.started_at.timestamp(),
        "owner": identity.owner,
        "version": env!("CARGO_PKG_VERSION"),
        "port": identity.port,
        "manager_id": identity.manager_id.to_string(),
    })
}

pub struct StatusSources<'a> {
    pub identity: &'a ManagerIdentity,
    pub sessions: &'a SessionPools,
    pub tasks: &'a TaskRegistry,
    pub files: &'a FileRegistry,
    pub projects: &'a ProjectRegistry,
    pub services: &'a ServiceRegistry,
}

/// The document answered to `status`: the catalog fields plus live counts.
pub fn build_status_document(sources: &StatusSources<'_>, now: DateTime<Utc>) -> Value {
    let mut document = build_catalog_document(sources.identity);
    if let Value::Object(map) = &mut document {
        map.insert(
            "application".to_owned(),
            application_status(sources.identity.started_at, now),
        );
        map.insert("memory".to_owned(), memory_stats());
        map.insert("sessions".to_owned(), session_stats(sources.sessions));
        map.insert(
            "entities".to_owned(),
            json!({
                "tasks": sources.tasks.count(),
                "files": sources.files.count(),
                "services": sources.services.count(),
                "projects": sources.projects.names(),
            }),
        );
    }
    document
}

pub fn application_status(started_at: DateTime<Utc>, now: DateTime<Utc>) -> Value {
    let uptime_seconds = (now - started_at).num_seconds().max(0);
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "build_date_utc": env!("DATASWARM_BUILD_DATE_UTC"),
        "git_revision": env!("DATASWARM_GIT_REVISION"),
        "started_at": started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "now": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "uptime_seconds": uptime_seconds,
        "pid": std::process::id(),
    })
}

pub fn memory_stats() -> Value {
    let mut vm_rss_kb: Option<i64> = None;
    let mut vm_size_kb: Option<i64> = None;
    let mut vm_peak_kb: Option<i64> = None;

    if let Ok(status) = fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if line.starts_with("VmRSS:") {
                vm_rss_kb = parse_kb_field(line);
            } else if line.starts_with("VmSize:") {
                vm_size_kb = parse_kb_field(line);
            } else if line.starts_with("VmPeak:") {
                vm_peak_kb = parse_kb_field(line);
            }
        }
    }

    json!({
        "source": "/proc/self/status",
        "available": vm_rss_kb.is_some() || vm_size_kb.is_some() || vm_peak_kb.is_some(),
        "vm_rss_kb": vm_rss_kb,
        "vm_size_kb": vm_size_kb,
        "vm_peak_kb": vm_peak_kb,
    })
}

pub fn session_stats(sessions: &SessionPools) -> Value {
    let workers = sessions
        .workers()
        .map(|(key, worker)| {
            json!({
                "session": key.to_string(),
                "peer_addr": worker.connection.peer_addr().to_string(),
                "promoted_at": worker.promoted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                "tasks": worker.task_shadows().count(),
                "blobs": worker.blob_count(),
                "outstanding_rpcs": worker.outstanding_rpcs(),
                "last_report_at": worker
                    .status_report
                    .as_ref()
                    .map(|report| report.received_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            })
        })
        .collect::<Vec<_>>();

    json!({
        "pending": sessions.pending_count(),
        "clients": sessions.client_count(),
        "workers_total": sessions.worker_count(),
        "workers": workers,
    })
}

fn parse_kb_field(line: &str) -> Option<i64> {
    line.split_whitespace().nth(1)?.parse::<i64>().ok()
}
