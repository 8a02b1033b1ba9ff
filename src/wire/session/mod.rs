use std::fmt;

use serde_json::Value;

use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::envelope::{
    salvage_request_id, EnvelopeError, Inbound, Response, ResultCode, UNKNOWN_REQUEST_ID,
};

#[derive(Debug)]
pub enum SessionError {
    Codec(CodecError),
    Envelope { request_id: i64, source: EnvelopeError },
    RequestIdNotIncreasing { request_id: i64, last_seen: i64 },
}

impl SessionError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Codec(_) => ResultCode::MalformedMessage,
            Self::Envelope { source, .. } => source.result_code(),
            Self::RequestIdNotIncreasing { .. } => ResultCode::MalformedId,
        }
    }

    pub fn request_id(&self) -> i64 {
        match self {
            Self::Codec(_) => UNKNOWN_REQUEST_ID,
            Self::Envelope { request_id, .. } | Self::RequestIdNotIncreasing { request_id, .. } => {
                *request_id
            }
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "session codec error: {source}"),
            Self::Envelope { source, .. } => write!(f, "session envelope error: {source}"),
            Self::RequestIdNotIncreasing {
                request_id,
                last_seen,
            } => write!(
                f,
                "request id {request_id} is not greater than the last id {last_seen}"
            ),
        }
    }
}

impl std::error::Error for SessionError {}

/// Decodes one message on an established session. Request ids, when present,
/// must grow strictly; `last_request_id` is advanced on success.
pub fn evaluate_session_frame(
    codec: &WireCodec,
    frame: &[u8],
    last_request_id: &mut i64,
) -> Result<Inbound, SessionError> {
    let raw = codec.decode_frame(frame).map_err(SessionError::Codec)?;
    let inbound = Inbound::from_raw(&raw).map_err(|source| SessionError::Envelope {
        request_id: salvage_request_id(&raw),
        source,
    })?;

    if let Inbound::Request(request) = &inbound {
        if let Some(request_id) = request.id {
            if request_id <= *last_request_id {
                return Err(SessionError::RequestIdNotIncreasing {
                    request_id,
                    last_seen: *last_request_id,
                });
            }
            *last_request_id = request_id;
        }
    }

    Ok(inbound)
}

pub fn build_response_frame(
    codec: &WireCodec,
    request_id: i64,
    value: Option<Value>,
) -> Result<Vec<u8>, CodecError> {
    codec.encode_frame(&Response::success(request_id, value).into_raw())
}

pub fn build_error_frame(
    codec: &WireCodec,
    request_id: i64,
    code: ResultCode,
    message: &str,
) -> Result<Vec<u8>, CodecError> {
    codec.encode_frame(&Response::error(request_id, code, message).into_raw())
}
