use std::fmt;

use serde_json::{json, Map, Value};

use crate::wire::codec::MessageEnvelope;

/// Reply id used when the request carried none or it could not be parsed.
pub const UNKNOWN_REQUEST_ID: i64 = 0;

pub type Params = Map<String, Value>;

/// Result vocabulary shared by manager replies and worker reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    MalformedMessage,
    UnexpectedMethod,
    MalformedId,
    MalformedParameters,
    NoSuchTask,
    NoSuchBlob,
    NoSuchFile,
    NoSuchService,
    NoSuchProject,
    AlreadyExists,
    ProjectInUse,
    InvalidTransition,
    WorkerDisconnected,
    Unable,
    TooFull,
    BadPermission,
    Timeout,
}

impl ResultCode {
    const ALL: [ResultCode; 18] = [
        Self::Success,
        Self::MalformedMessage,
        Self::UnexpectedMethod,
        Self::MalformedId,
        Self::MalformedParameters,
        Self::NoSuchTask,
        Self::NoSuchBlob,
        Self::NoSuchFile,
        Self::NoSuchService,
        Self::NoSuchProject,
        Self::AlreadyExists,
        Self::ProjectInUse,
        Self::InvalidTransition,
        Self::WorkerDisconnected,
        Self::Unable,
        Self::TooFull,
        Self::BadPermission,
        Self::Timeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::UnexpectedMethod => "UNEXPECTED_METHOD",
            Self::MalformedId => "MALFORMED_ID",
            Self::MalformedParameters => "MALFORMED_PARAMETERS",
            Self::NoSuchTask => "NO_SUCH_TASK",
            Self::NoSuchBlob => "NO_SUCH_BLOB",
            Self::NoSuchFile => "NO_SUCH_FILE",
            Self::NoSuchService => "NO_SUCH_SERVICE",
            Self::NoSuchProject => "NO_SUCH_PROJECT",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::ProjectInUse => "PROJECT_IN_USE",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::WorkerDisconnected => "WORKER_DISCONNECTED",
            Self::Unable => "UNABLE",
            Self::TooFull => "TOO_FULL",
            Self::BadPermission => "BAD_PERMISSION",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == value)
    }

    /// Reads a result a worker reported. Codes outside the vocabulary count
    /// as a failure.
    pub fn from_reported(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::Unable)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    RequestIdMustBePositive { actual: i64 },
}

impl EnvelopeError {
    /// The result code a peer should see for this violation.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::MissingField { field: "id" }
            | Self::InvalidFieldType { field: "id", .. }
            | Self::RequestIdMustBePositive { .. } => ResultCode::MalformedId,
            Self::MissingField { .. } | Self::InvalidFieldType { .. } => {
                ResultCode::MalformedMessage
            }
        }
    }
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::RequestIdMustBePositive { actual } => {
                write!(f, "request id must be a positive integer, got {actual}")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// `{ "method": string, "params": object, "id"?: integer }`
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: String,
    pub params: Params,
    pub id: Option<i64>,
}

/// `{ "id": integer, "result": string, "value"?: any }`
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: i64,
    pub result: ResultCode,
    pub value: Option<Value>,
}

/// Anything a peer may send once its session is established.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn new(method: impl Into<String>, params: Params, id: Option<i64>) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        let method = match raw.get("method") {
            Some(Value::String(method)) => method.clone(),
            Some(_) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: "method",
                    expected: "string",
                })
            }
            None => return Err(EnvelopeError::MissingField { field: "method" }),
        };

        let params = match raw.get("params") {
            Some(Value::Object(params)) => params.clone(),
            Some(_) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: "params",
                    expected: "object",
                })
            }
            None => return Err(EnvelopeError::MissingField { field: "params" }),
        };

        let id = match raw.get("id") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_request_id(value)?),
        };

        Ok(Self { method, params, id })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert("method".to_owned(), Value::String(self.method));
        raw.insert("params".to_owned(), Value::Object(self.params));
        if let Some(id) = self.id {
            raw.insert("id".to_owned(), json!(id));
        }
        raw
    }
}

impl Response {
    pub fn success(id: i64, value: Option<Value>) -> Self {
        Self {
            id,
            result: ResultCode::Success,
            value,
        }
    }

    pub fn error(id: i64, result: ResultCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result,
            value: Some(json!({ "message": message.into() })),
        }
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        let id = match raw.get("id") {
            Some(value) => value.as_i64().ok_or(EnvelopeError::InvalidFieldType {
                field: "id",
                expected: "integer",
            })?,
            None => return Err(EnvelopeError::MissingField { field: "id" }),
        };
        let result = match raw.get("result") {
            Some(Value::String(text)) => ResultCode::from_reported(text),
            Some(_) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: "result",
                    expected: "string",
                })
            }
            None => return Err(EnvelopeError::MissingField { field: "result" }),
        };

        Ok(Self {
            id,
            result,
            value: raw.get("value").cloned(),
        })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert("id".to_owned(), json!(self.id));
        raw.insert(
            "result".to_owned(),
            Value::String(self.result.as_str().to_owned()),
        );
        if let Some(value) = self.value {
            raw.insert("value".to_owned(), value);
        }
        raw
    }
}

impl Inbound {
    /// Requests carry `method`; a message with `result` and no `method` is a
    /// reply to something the manager sent.
    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        if !raw.contains_key("method") && raw.contains_key("result") {
            return Response::from_raw(raw).map(Self::Response);
        }
        Request::from_raw(raw).map(Self::Request)
    }
}

/// Best effort id extraction for error replies to messages that failed
/// validation.
pub fn salvage_request_id(raw: &MessageEnvelope) -> i64 {
    raw.get("id")
        .and_then(Value::as_i64)
        .filter(|id| *id > 0)
        .unwrap_or(UNKNOWN_REQUEST_ID)
}

fn parse_request_id(value: &Value) -> Result<i64, EnvelopeError> {
    let id = value.as_i64().ok_or(EnvelopeError::InvalidFieldType {
        field: "id",
        expected: "integer",
    })?;
    if id < 1 {
        return Err(EnvelopeError::RequestIdMustBePositive { actual: id });
    }
    Ok(id)
}
