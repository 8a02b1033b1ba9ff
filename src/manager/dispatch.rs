use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::manager::Manager;
use crate::orchestrator::RegistryError;
use crate::server::SessionKey;
use crate::wire::envelope::{Request, ResultCode};

/// What a handler produced for its request.
#[derive(Debug, PartialEq)]
pub enum Reply {
    Value(Option<Value>),
    /// The handler keeps the request id and answers later.
    Deferred,
}

/// A message-level failure, answered to the peer with its code.
#[derive(Debug, PartialEq, Eq)]
pub struct MethodError {
    pub code: ResultCode,
    pub message: String,
}

impl MethodError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn malformed_parameters(message: impl Into<String>) -> Self {
        Self::new(ResultCode::MalformedParameters, message)
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for MethodError {}

impl From<RegistryError> for MethodError {
    fn from(error: RegistryError) -> Self {
        Self::new(error.result_code(), error.to_string())
    }
}

pub type MethodHandler = fn(&mut Manager, SessionKey, &Request) -> Result<Reply, MethodError>;

/// Method name to handler, one table per peer role.
pub struct DispatchTable {
    handlers: BTreeMap<&'static str, MethodHandler>,
}

impl DispatchTable {
    pub fn new(entries: &[(&'static str, MethodHandler)]) -> Self {
        Self {
            handlers: entries.iter().copied().collect(),
        }
    }

    pub fn get(&self, method: &str) -> Option<MethodHandler> {
        self.handlers.get(method).copied()
    }

    pub fn methods(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.methods()).finish()
    }
}

pub fn required_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, MethodError> {
    match params.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        Some(_) => Err(MethodError::malformed_parameters(format!(
            "'{key}' must be a non-empty string"
        ))),
        None => Err(MethodError::malformed_parameters(format!("'{key}' is required"))),
    }
}

pub fn optional_str<'a>(
    params: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, MethodError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(MethodError::malformed_parameters(format!(
            "'{key}' must be a string"
        ))),
    }
}

pub fn optional_u64(params: &Map<String, Value>, key: &str) -> Result<Option<u64>, MethodError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            MethodError::malformed_parameters(format!("'{key}' must be a non-negative integer"))
        }),
    }
}

pub fn optional_seconds(params: &Map<String, Value>, key: &str) -> Result<Option<f64>, MethodError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .map(Some)
            .ok_or_else(|| {
                MethodError::malformed_parameters(format!("'{key}' must be a non-negative number"))
            }),
    }
}

pub fn optional_object(params: &Map<String, Value>, key: &str) -> Result<Option<Value>, MethodError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value.clone())),
        Some(_) => Err(MethodError::malformed_parameters(format!(
            "'{key}' must be an object"
        ))),
    }
}

/// Parses an optional result code, defaulting to success.
pub fn optional_result(params: &Map<String, Value>) -> Result<ResultCode, MethodError> {
    match optional_str(params, "result")? {
        None => Ok(ResultCode::Success),
        Some(raw) => Ok(ResultCode::from_reported(raw)),
    }
}
