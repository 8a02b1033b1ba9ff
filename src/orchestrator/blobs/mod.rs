use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::transition::{LifecycleState, Tracked};

/// Blob state as the manager believes it to be on one worker.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum BlobShadowState {
    New,
    ReadWrite,
    ReadOnly,
    Deleting,
    Deleted,
}

impl BlobShadowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::ReadWrite => "READ-WRITE",
            Self::ReadOnly => "READ-ONLY",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        }
    }

    /// Parses a state a worker may report. `NEW` never comes from a worker.
    pub fn parse_reported(value: &str) -> Option<Self> {
        BlobState::parse(value).map(Self::from)
    }
}

impl fmt::Display for BlobShadowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleState for BlobShadowState {
    fn can_transition_to(self, target: Self) -> bool {
        use BlobShadowState::*;
        matches!(
            (self, target),
            (New, ReadWrite)
                | (ReadWrite, ReadOnly)
                | (New | ReadWrite | ReadOnly, Deleting)
                | (Deleting, Deleted)
        )
    }

    fn is_terminal(self) -> bool {
        self == Self::Deleted
    }
}

/// Worker-side blob vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobState {
    ReadWrite,
    ReadOnly,
    Deleting,
    Deleted,
}

impl BlobState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "READ-WRITE" => Some(Self::ReadWrite),
            "READ-ONLY" => Some(Self::ReadOnly),
            "DELETING" => Some(Self::Deleting),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl From<BlobState> for BlobShadowState {
    fn from(state: BlobState) -> Self {
        match state {
            BlobState::ReadWrite => Self::ReadWrite,
            BlobState::ReadOnly => Self::ReadOnly,
            BlobState::Deleting => Self::Deleting,
            BlobState::Deleted => Self::Deleted,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlobShadow {
    pub blob_id: String,
    /// File this blob replicates, if the manager allocated it for one.
    pub file_id: Option<String>,
    pub size: u64,
    pub metadata: Value,
    pub lifecycle: Tracked<BlobShadowState>,
}

impl BlobShadow {
    pub fn new(blob_id: impl Into<String>, file_id: Option<String>, size: u64, metadata: Value) -> Self {
        Self {
            blob_id: blob_id.into(),
            file_id,
            size,
            metadata,
            lifecycle: Tracked::new(BlobShadowState::New),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::orchestrator::transition::LifecycleState;

    use super::{BlobShadow, BlobShadowState};

    #[test]
    fn edges_follow_blob_lifecycle() {
        use BlobShadowState::*;
        assert!(New.can_transition_to(ReadWrite));
        assert!(ReadWrite.can_transition_to(ReadOnly));
        assert!(ReadOnly.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(!New.can_transition_to(ReadOnly));
        assert!(!ReadOnly.can_transition_to(ReadWrite));
        assert!(!Deleted.can_transition_to(Deleting));
    }

    #[test]
    fn wire_names_use_dashes() {
        assert_eq!(
            serde_json::to_value(BlobShadowState::ReadWrite).expect("serialize"),
            json!("READ-WRITE")
        );
        assert_eq!(
            BlobShadowState::parse_reported("READ-ONLY"),
            Some(BlobShadowState::ReadOnly)
        );
        assert_eq!(BlobShadowState::parse_reported("NEW"), None);
        assert_eq!(BlobShadowState::parse_reported("read-only"), None);
    }

    #[test]
    fn new_shadow_starts_settled_in_new() {
        let shadow = BlobShadow::new("blob-0", Some("file-0".to_owned()), 64, json!({}));
        assert_eq!(shadow.lifecycle.state(), BlobShadowState::New);
        assert!(shadow.lifecycle.is_settled());
    }
}
