use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::orchestrator::RegistryError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Named namespaces for tasks, files and services. The manager's own project
/// exists from startup and cannot be removed.
#[derive(Debug)]
pub struct ProjectRegistry {
    manager_project: String,
    projects: BTreeMap<String, Project>,
}

impl ProjectRegistry {
    pub fn new(manager_project: impl Into<String>) -> Self {
        let manager_project = manager_project.into();
        let mut projects = BTreeMap::new();
        projects.insert(
            manager_project.clone(),
            Project {
                name: manager_project.clone(),
                created_at: Utc::now(),
            },
        );

        Self {
            manager_project,
            projects,
        }
    }

    pub fn manager_project(&self) -> &str {
        &self.manager_project
    }

    pub fn create(&mut self, name: &str) -> Result<(), RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::MalformedDescription {
                reason: "project name must not be empty".to_owned(),
            });
        }
        if self.projects.contains_key(name) {
            return Err(RegistryError::ProjectAlreadyExists {
                name: name.to_owned(),
            });
        }

        self.projects.insert(
            name.to_owned(),
            Project {
                name: name.to_owned(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// `references` is how many live tasks, files and services still name the
    /// project.
    pub fn delete(&mut self, name: &str, references: usize) -> Result<Project, RegistryError> {
        if name == self.manager_project {
            return Err(RegistryError::ProtectedProject {
                name: name.to_owned(),
            });
        }
        if !self.projects.contains_key(name) {
            return Err(RegistryError::NoSuchProject {
                name: name.to_owned(),
            });
        }
        if references > 0 {
            return Err(RegistryError::ProjectInUse {
                name: name.to_owned(),
                references,
            });
        }

        self.projects
            .remove(name)
            .ok_or_else(|| RegistryError::NoSuchProject {
                name: name.to_owned(),
            })
    }

    /// Resolves an optional project name, defaulting to the manager project.
    pub fn resolve(&self, requested: Option<&str>) -> Result<String, RegistryError> {
        match requested {
            None => Ok(self.manager_project.clone()),
            Some(name) if self.projects.contains_key(name) => Ok(name.to_owned()),
            Some(name) => Err(RegistryError::NoSuchProject {
                name: name.to_owned(),
            }),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.projects.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.projects.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::orchestrator::RegistryError;
    use crate::wire::envelope::ResultCode;

    use super::ProjectRegistry;

    #[test]
    fn manager_project_exists_from_start() {
        let registry = ProjectRegistry::new("dataswarm");
        assert_eq!(registry.names(), vec!["dataswarm"]);
        assert_eq!(registry.resolve(None).expect("default"), "dataswarm");
    }

    #[test]
    fn duplicate_create_is_already_exists() {
        let mut registry = ProjectRegistry::new("dataswarm");
        registry.create("genomes").expect("first create");
        let err = registry.create("genomes").expect_err("duplicate");
        assert_eq!(err.result_code(), ResultCode::AlreadyExists);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn delete_rules() {
        let mut registry = ProjectRegistry::new("dataswarm");
        registry.create("genomes").expect("create");

        assert_eq!(
            registry.delete("missing", 0).map(|_| ()),
            Err(RegistryError::NoSuchProject {
                name: "missing".to_owned()
            })
        );
        assert_eq!(
            registry.delete("genomes", 3).map(|_| ()).map_err(|e| e.result_code()),
            Err(ResultCode::ProjectInUse)
        );
        assert_eq!(
            registry.delete("dataswarm", 0).map(|_| ()).map_err(|e| e.result_code()),
            Err(ResultCode::BadPermission)
        );

        let removed = registry.delete("genomes", 0).expect("unused project");
        assert_eq!(removed.name, "genomes");
        assert!(registry.resolve(Some("genomes")).is_err());
    }
}
