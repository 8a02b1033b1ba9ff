use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::orchestrator::RegistryError;
use crate::server::SessionKey;

pub const SERVICE_ID_KEY: &str = "service-id";

#[derive(Clone, Debug, PartialEq)]
pub struct Service {
    pub service_id: String,
    pub sequence: u64,
    pub description: Value,
    pub project: String,
    pub owner: Option<SessionKey>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
    next_sequence: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(
        &mut self,
        mut description: Map<String, Value>,
        project: impl Into<String>,
        owner: Option<SessionKey>,
    ) -> String {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let service_id = format!("service-{sequence}");
        description.insert(SERVICE_ID_KEY.to_owned(), Value::String(service_id.clone()));

        self.services.insert(
            service_id.clone(),
            Service {
                service_id: service_id.clone(),
                sequence,
                description: Value::Object(description),
                project: project.into(),
                owner,
                submitted_at: Utc::now(),
            },
        );

        service_id
    }

    pub fn delete(&mut self, service_id: &str) -> Result<Service, RegistryError> {
        self.services
            .remove(service_id)
            .ok_or_else(|| RegistryError::NoSuchService {
                service_id: service_id.to_owned(),
            })
    }

    pub fn get(&self, service_id: &str) -> Option<&Service> {
        self.services.get(service_id)
    }

    pub fn count(&self) -> usize {
        self.services.len()
    }

    pub fn count_in_project(&self, project: &str) -> usize {
        self.services
            .values()
            .filter(|service| service.project == project)
            .count()
    }
}
