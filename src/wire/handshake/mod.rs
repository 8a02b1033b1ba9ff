use std::fmt;

use serde_json::Value;

use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::envelope::{salvage_request_id, EnvelopeError, Request, ResultCode};

pub const HANDSHAKE_METHOD: &str = "handshake";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Worker,
    Client,
}

impl PeerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Client => "client",
        }
    }
}

/// An accepted handshake: who the peer is and which id to answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub role: PeerRole,
    pub request_id: i64,
}

/// Every variant is fatal for the connection.
#[derive(Debug)]
pub enum HandshakeError {
    Codec(CodecError),
    Envelope { request_id: i64, source: EnvelopeError },
    UnexpectedMethod { request_id: i64, method: String },
    MissingRequestId,
    InvalidPeerType { request_id: i64, value: Option<String> },
}

impl HandshakeError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Codec(_) => ResultCode::MalformedMessage,
            Self::Envelope { source, .. } => source.result_code(),
            Self::UnexpectedMethod { .. } => ResultCode::UnexpectedMethod,
            Self::MissingRequestId => ResultCode::MalformedId,
            Self::InvalidPeerType { .. } => ResultCode::MalformedParameters,
        }
    }

    pub fn request_id(&self) -> i64 {
        match self {
            Self::Codec(_) | Self::MissingRequestId => 0,
            Self::Envelope { request_id, .. }
            | Self::UnexpectedMethod { request_id, .. }
            | Self::InvalidPeerType { request_id, .. } => *request_id,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "handshake codec error: {source}"),
            Self::Envelope { source, .. } => write!(f, "handshake envelope error: {source}"),
            Self::UnexpectedMethod { method, .. } => write!(
                f,
                "expected '{HANDSHAKE_METHOD}' as the first message, got '{method}'"
            ),
            Self::MissingRequestId => write!(f, "handshake requires a positive 'id'"),
            Self::InvalidPeerType { value, .. } => write!(
                f,
                "handshake params.type must be 'worker' or 'client', got {}",
                value.as_deref().unwrap_or("nothing")
            ),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Validates the first message of a fresh connection.
pub fn evaluate_handshake_frame(
    codec: &WireCodec,
    frame: &[u8],
) -> Result<Handshake, HandshakeError> {
    let raw = codec.decode_frame(frame).map_err(HandshakeError::Codec)?;
    let request = Request::from_raw(&raw).map_err(|source| HandshakeError::Envelope {
        request_id: salvage_request_id(&raw),
        source,
    })?;

    if request.method != HANDSHAKE_METHOD {
        return Err(HandshakeError::UnexpectedMethod {
            request_id: request.id.unwrap_or(0),
            method: request.method,
        });
    }

    let request_id = request.id.ok_or(HandshakeError::MissingRequestId)?;

    let role = match request.params.get("type") {
        Some(Value::String(kind)) if kind == PeerRole::Worker.as_str() => PeerRole::Worker,
        Some(Value::String(kind)) if kind == PeerRole::Client.as_str() => PeerRole::Client,
        other => {
            return Err(HandshakeError::InvalidPeerType {
                request_id,
                value: other.map(Value::to_string),
            })
        }
    };

    Ok(Handshake { role, request_id })
}
