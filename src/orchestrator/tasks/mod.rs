use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::orchestrator::transition::{LifecycleState, Tracked};
use crate::orchestrator::RegistryError;
use crate::server::SessionKey;

pub const TASK_ID_KEY: &str = "task-id";

/// Task state as a specific worker reports it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum TaskShadowState {
    New,
    Ready,
    Running,
    Done,
    Deleting,
    Deleted,
}

impl TaskShadowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            Self::New,
            Self::Ready,
            Self::Running,
            Self::Done,
            Self::Deleting,
            Self::Deleted,
        ]
        .into_iter()
        .find(|state| state.as_str() == value)
    }
}

impl fmt::Display for TaskShadowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleState for TaskShadowState {
    fn can_transition_to(self, target: Self) -> bool {
        use TaskShadowState::*;
        matches!(
            (self, target),
            (New, Ready)
                | (Ready, Running)
                | (Ready, Done)
                | (Running, Done)
                | (New | Ready | Running | Done, Deleting)
                | (Deleting, Deleted)
        )
    }

    fn is_terminal(self) -> bool {
        self == Self::Deleted
    }
}

/// What a client submits: a command plus whatever else it wants carried.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskDescription {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskDescription {
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, RegistryError> {
        let description: TaskDescription = serde_json::from_value(Value::Object(params.clone()))
            .map_err(|error| RegistryError::MalformedDescription {
                reason: error.to_string(),
            })?;
        if description.command.trim().is_empty() {
            return Err(RegistryError::MalformedDescription {
                reason: "'command' must not be empty".to_owned(),
            });
        }
        Ok(description)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub sequence: u64,
    /// The submitted description with `task-id` stamped in.
    pub description: Value,
    pub project: String,
    pub owner: Option<SessionKey>,
    pub submitted_at: DateTime<Utc>,
    pub deleting: bool,
}

/// The manager's belief about one task on one worker.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskShadow {
    pub task_id: String,
    pub lifecycle: Tracked<TaskShadowState>,
    pub description: Value,
}

impl TaskShadow {
    pub fn new(task_id: impl Into<String>, description: Value) -> Self {
        Self {
            task_id: task_id.into(),
            lifecycle: Tracked::new(TaskShadowState::New),
            description,
        }
    }

    /// True once DELETING is confirmed or pending on this worker.
    pub fn is_being_deleted(&self) -> bool {
        [self.lifecycle.state(), self.lifecycle.in_transition()]
            .iter()
            .any(|state| matches!(state, TaskShadowState::Deleting | TaskShadowState::Deleted))
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
    next_sequence: u64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a description under a fresh `task-N` id. Ids are never reused.
    pub fn submit(
        &mut self,
        description: TaskDescription,
        project: impl Into<String>,
        owner: Option<SessionKey>,
    ) -> Result<String, RegistryError> {
        let sequence = self.next_sequence;
        let task_id = format!("task-{sequence}");

        let mut stamped = serde_json::to_value(&description).map_err(|error| {
            RegistryError::MalformedDescription {
                reason: error.to_string(),
            }
        })?;
        if let Value::Object(map) = &mut stamped {
            map.insert(TASK_ID_KEY.to_owned(), Value::String(task_id.clone()));
        }

        self.next_sequence += 1;
        self.tasks.insert(
            task_id.clone(),
            Task {
                task_id: task_id.clone(),
                sequence,
                description: stamped,
                project: project.into(),
                owner,
                submitted_at: Utc::now(),
                deleting: false,
            },
        );

        Ok(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(task_id)
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Task> {
        self.tasks.remove(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    pub fn count_in_project(&self, project: &str) -> usize {
        self.tasks.values().filter(|task| task.project == project).count()
    }

    /// Tasks in submission order.
    pub fn snapshot(&self) -> Vec<&Task> {
        let mut tasks = self.tasks.values().collect::<Vec<_>>();
        tasks.sort_by_key(|task| task.sequence);
        tasks
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::orchestrator::transition::LifecycleState;
    use crate::orchestrator::RegistryError;

    use super::{TaskDescription, TaskRegistry, TaskShadowState, TASK_ID_KEY};

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    fn echo() -> TaskDescription {
        TaskDescription::from_params(&params(json!({"command": "echo hi"})))
            .expect("description should parse")
    }

    #[test]
    fn first_submission_is_task_zero_with_stamped_id() {
        let mut registry = TaskRegistry::new();
        let task_id = registry.submit(echo(), "dataswarm", None).expect("submit");

        assert_eq!(task_id, "task-0");
        let task = registry.get("task-0").expect("task should be stored");
        assert_eq!(task.description[TASK_ID_KEY], json!("task-0"));
        assert_eq!(task.description["command"], json!("echo hi"));
    }

    #[test]
    fn ids_are_sequential_and_never_reused() {
        let mut registry = TaskRegistry::new();
        let first = registry.submit(echo(), "dataswarm", None).expect("submit");
        let second = registry.submit(echo(), "dataswarm", None).expect("submit");
        assert_eq!((first.as_str(), second.as_str()), ("task-0", "task-1"));

        registry.remove(&first);
        let third = registry.submit(echo(), "dataswarm", None).expect("submit");
        assert_eq!(third, "task-2");

        let order = registry
            .snapshot()
            .into_iter()
            .map(|task| task.task_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["task-1", "task-2"]);
    }

    #[test]
    fn description_keeps_extra_attributes() {
        let description = TaskDescription::from_params(&params(json!({
            "command": "bwa mem ref.fa query.fq",
            "project": "genomes",
            "cores": 4,
            "inputs": ["file-1"]
        })))
        .expect("description should parse");

        assert_eq!(description.project.as_deref(), Some("genomes"));
        assert_eq!(description.extra.get("cores"), Some(&json!(4)));
        assert!(!description.extra.contains_key("command"));
    }

    #[test]
    fn description_requires_a_command() {
        let err = TaskDescription::from_params(&params(json!({"cores": 2})))
            .expect_err("missing command should fail");
        assert!(matches!(err, RegistryError::MalformedDescription { .. }));

        let err = TaskDescription::from_params(&params(json!({"command": "  "})))
            .expect_err("blank command should fail");
        assert!(matches!(err, RegistryError::MalformedDescription { .. }));

        let err = TaskDescription::from_params(&params(json!({"command": 7})))
            .expect_err("non-string command should fail");
        assert!(matches!(err, RegistryError::MalformedDescription { .. }));
    }

    #[test]
    fn shadow_edges_follow_the_task_lifecycle() {
        use TaskShadowState::*;
        assert!(New.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Done));
        assert!(Running.can_transition_to(Deleting));
        assert!(!New.can_transition_to(Done));
        assert!(!Deleted.can_transition_to(Deleting));
        assert!(Deleted.is_terminal());
        assert_eq!(TaskShadowState::parse("RUNNING"), Some(Running));
        assert_eq!(
            serde_json::to_value(Deleting).expect("serialize"),
            json!("DELETING")
        );
    }
}
