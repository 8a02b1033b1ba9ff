pub mod blobs;
pub mod files;
pub mod projects;
pub mod services;
pub mod tasks;
pub mod transition;

use std::fmt;

use crate::wire::envelope::ResultCode;

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    MalformedDescription { reason: String },
    NoSuchTask { task_id: String },
    NoSuchFile { file_id: String },
    NoSuchService { service_id: String },
    NoSuchProject { name: String },
    ProjectAlreadyExists { name: String },
    ProjectInUse { name: String, references: usize },
    ProtectedProject { name: String },
    InvalidTransition { entity: String, reason: String },
}

impl RegistryError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::MalformedDescription { .. } => ResultCode::MalformedParameters,
            Self::NoSuchTask { .. } => ResultCode::NoSuchTask,
            Self::NoSuchFile { .. } => ResultCode::NoSuchFile,
            Self::NoSuchService { .. } => ResultCode::NoSuchService,
            Self::NoSuchProject { .. } => ResultCode::NoSuchProject,
            Self::ProjectAlreadyExists { .. } => ResultCode::AlreadyExists,
            Self::ProjectInUse { .. } => ResultCode::ProjectInUse,
            Self::ProtectedProject { .. } => ResultCode::BadPermission,
            Self::InvalidTransition { .. } => ResultCode::InvalidTransition,
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedDescription { reason } => write!(f, "malformed description: {reason}"),
            Self::NoSuchTask { task_id } => write!(f, "task '{task_id}' not found"),
            Self::NoSuchFile { file_id } => write!(f, "file '{file_id}' not found"),
            Self::NoSuchService { service_id } => write!(f, "service '{service_id}' not found"),
            Self::NoSuchProject { name } => write!(f, "project '{name}' not found"),
            Self::ProjectAlreadyExists { name } => write!(f, "project '{name}' already exists"),
            Self::ProjectInUse { name, references } => write!(
                f,
                "project '{name}' is still referenced by {references} entities"
            ),
            Self::ProtectedProject { name } => {
                write!(f, "project '{name}' belongs to the manager and cannot be deleted")
            }
            Self::InvalidTransition { entity, reason } => {
                write!(f, "invalid transition for '{entity}': {reason}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}
