use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::blobs::BlobShadowState;
use crate::orchestrator::transition::{LifecycleState, Tracked, TransitionOutcome};
use crate::orchestrator::RegistryError;
use crate::server::SessionKey;
use crate::wire::envelope::ResultCode;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum FileState {
    Pending,
    Allocating,
    Mutable,
    Committing,
    Immutable,
    Deleting,
    Deleted,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Allocating => "ALLOCATING",
            Self::Mutable => "MUTABLE",
            Self::Committing => "COMMITTING",
            Self::Immutable => "IMMUTABLE",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        }
    }

    /// The state a transitional state resolves to once its replicas agree.
    fn settles_to(self) -> Option<Self> {
        match self {
            Self::Allocating => Some(Self::Mutable),
            Self::Committing => Some(Self::Immutable),
            Self::Deleting => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleState for FileState {
    fn can_transition_to(self, target: Self) -> bool {
        use FileState::*;
        match (self, target) {
            (Pending, Allocating)
            | (Allocating, Mutable)
            | (Mutable, Committing)
            | (Committing, Immutable)
            | (Deleting, Deleted) => true,
            (from, Deleting) => !matches!(from, Deleting | Deleted),
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        self == Self::Deleted
    }
}

/// One copy of a file: a blob on a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replica {
    pub worker: SessionKey,
    pub blob_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileRecord {
    pub file_id: String,
    pub sequence: u64,
    pub lifecycle: Tracked<FileState>,
    pub size: u64,
    pub project: String,
    pub metadata: Value,
    pub owner: Option<SessionKey>,
    pub copy_of: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub replicas: Vec<Replica>,
}

impl FileRecord {
    pub fn state(&self) -> FileState {
        self.lifecycle.state()
    }

    /// Records where the file was placed and waits for the replicas to
    /// become writable.
    pub fn begin_allocation(&mut self, replicas: Vec<Replica>) -> Result<(), RegistryError> {
        self.enter_transitional(FileState::Allocating)?;
        self.replicas = replicas;
        Ok(())
    }

    pub fn begin_commit(&mut self) -> Result<(), RegistryError> {
        self.enter_transitional(FileState::Committing)
    }

    /// Moves to DELETING from any live state, dropping whatever was pending.
    /// A file left in DELETING by a failed delete asks for DELETED again.
    pub fn begin_delete(&mut self) -> Result<(), RegistryError> {
        if self.state() == FileState::Deleting && self.lifecycle.is_settled() {
            return self
                .lifecycle
                .request(FileState::Deleted)
                .map_err(|error| self.transition_error(error));
        }

        let pending = self.lifecycle.in_transition();
        self.lifecycle.abandon();
        self.enter_transitional(FileState::Deleting).inspect_err(|_| {
            if pending != self.lifecycle.state() {
                let _ = self.lifecycle.request(pending);
            }
        })
    }

    fn enter_transitional(&mut self, state: FileState) -> Result<(), RegistryError> {
        self.lifecycle
            .advance(state)
            .map_err(|error| self.transition_error(error))?;
        if let Some(target) = state.settles_to() {
            self.lifecycle
                .request(target)
                .map_err(|error| self.transition_error(error))?;
        }
        Ok(())
    }

    fn transition_error(&self, error: impl fmt::Display) -> RegistryError {
        RegistryError::InvalidTransition {
            entity: self.file_id.clone(),
            reason: error.to_string(),
        }
    }

    pub fn remove_replicas_on(&mut self, worker: SessionKey) -> usize {
        let before = self.replicas.len();
        self.replicas.retain(|replica| replica.worker != worker);
        before - self.replicas.len()
    }

    /// Re-evaluates the file against its replicas' blob shadows, given in
    /// replica order. Returns what changed, if anything.
    pub fn reconcile(
        &mut self,
        replicas: &[Tracked<BlobShadowState>],
        quorum: usize,
    ) -> Option<TransitionOutcome<FileState>> {
        if self.lifecycle.is_settled() {
            return None;
        }

        let target = self.lifecycle.in_transition();
        let reached = match target {
            FileState::Mutable => replicas
                .iter()
                .any(|shadow| shadow.state() == BlobShadowState::ReadWrite),
            FileState::Immutable => {
                let read_only = replicas
                    .iter()
                    .filter(|shadow| shadow.state() == BlobShadowState::ReadOnly)
                    .count();
                !replicas.is_empty() && read_only >= quorum.max(1)
            }
            FileState::Deleted => replicas
                .iter()
                .all(|shadow| shadow.state() == BlobShadowState::Deleted),
            _ => false,
        };
        if reached {
            return Some(self.lifecycle.settle());
        }

        let still_moving = replicas.iter().any(|shadow| !shadow.is_settled());
        if still_moving {
            return None;
        }

        let result = replicas
            .iter()
            .map(Tracked::result)
            .find(|result| !result.is_success())
            .unwrap_or(ResultCode::WorkerDisconnected);
        Some(self.lifecycle.fail(result))
    }
}

#[derive(Debug, Default)]
pub struct FileRegistry {
    files: HashMap<String, FileRecord>,
    next_sequence: u64,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(
        &mut self,
        project: impl Into<String>,
        size: u64,
        metadata: Value,
        owner: Option<SessionKey>,
        copy_of: Option<String>,
    ) -> String {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let file_id = format!("file-{sequence}");

        self.files.insert(
            file_id.clone(),
            FileRecord {
                file_id: file_id.clone(),
                sequence,
                lifecycle: Tracked::new(FileState::Pending),
                size,
                project: project.into(),
                metadata,
                owner,
                copy_of,
                submitted_at: Utc::now(),
                replicas: Vec::new(),
            },
        );

        file_id
    }

    pub fn get(&self, file_id: &str) -> Option<&FileRecord> {
        self.files.get(file_id)
    }

    pub fn get_mut(&mut self, file_id: &str) -> Result<&mut FileRecord, RegistryError> {
        self.files
            .get_mut(file_id)
            .ok_or_else(|| RegistryError::NoSuchFile {
                file_id: file_id.to_owned(),
            })
    }

    pub fn remove(&mut self, file_id: &str) -> Option<FileRecord> {
        self.files.remove(file_id)
    }

    pub fn count(&self) -> usize {
        self.files.len()
    }

    pub fn count_in_project(&self, project: &str) -> usize {
        self.files.values().filter(|file| file.project == project).count()
    }

    /// File ids in submission order.
    pub fn ids(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .map(|file| file.file_id.clone())
            .collect()
    }

    pub fn ids_in_state(&self, state: FileState) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|file| file.lifecycle.is_settled() && file.state() == state)
            .map(|file| file.file_id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<&FileRecord> {
        let mut files = self.files.values().collect::<Vec<_>>();
        files.sort_by_key(|file| file.sequence);
        files
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileRecord> {
        self.files.values_mut()
    }
}
