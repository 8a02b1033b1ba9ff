use std::fmt;
use std::io::{self, BufRead, Read};

use serde_json::{Map, Value};

use crate::config::{AppConfig, MIN_MESSAGE_SIZE_BYTES};

pub const DEFAULT_MAX_MESSAGE_SIZE_BYTES: usize = 1024 * 1024;
pub const MESSAGE_DELIMITER: u8 = b'\n';

/// A decoded message: always a JSON object, never interpreted here.
pub type MessageEnvelope = Map<String, Value>;

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    MessageTooLarge { limit: usize },
    EmptyMessage,
    Json(serde_json::Error),
    EnvelopeMustBeObject,
    Encode(serde_json::Error),
    InvalidLimit { limit: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "message read error: {source}"),
            Self::MessageTooLarge { limit } => {
                write!(f, "message exceeds limit of {limit} bytes")
            }
            Self::EmptyMessage => write!(f, "message is empty"),
            Self::Json(source) => write!(f, "message is not valid JSON: {source}"),
            Self::EnvelopeMustBeObject => write!(f, "message envelope must be a JSON object"),
            Self::Encode(source) => write!(f, "message encode error: {source}"),
            Self::InvalidLimit { limit } => write!(
                f,
                "max message size {limit} is below the minimum of {MIN_MESSAGE_SIZE_BYTES} bytes"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_message_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        }
    }
}

/// Newline-delimited JSON: one message per line, bounded in size.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    config: CodecConfig,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        let limit = app_config.wire.max_message_size_bytes;
        if limit < MIN_MESSAGE_SIZE_BYTES {
            return Err(CodecError::InvalidLimit { limit });
        }
        Ok(Self::new(CodecConfig {
            max_message_size_bytes: limit,
        }))
    }

    pub fn max_message_size_bytes(&self) -> usize {
        self.config.max_message_size_bytes
    }

    /// Reads the next non-blank line. `Ok(None)` means the peer closed the
    /// stream. A line longer than the limit is an error and the stream
    /// position is no longer meaningful afterwards.
    pub fn read_frame<R: BufRead>(&self, reader: &mut R) -> Result<Option<Vec<u8>>, CodecError> {
        let limit = self.config.max_message_size_bytes as u64 + 1;

        loop {
            let mut line = Vec::new();
            let read = reader
                .by_ref()
                .take(limit)
                .read_until(MESSAGE_DELIMITER, &mut line)
                .map_err(CodecError::Io)?;
            if read == 0 {
                return Ok(None);
            }

            if line.last() == Some(&MESSAGE_DELIMITER) {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
            } else if read as u64 >= limit {
                return Err(CodecError::MessageTooLarge {
                    limit: self.config.max_message_size_bytes,
                });
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if frame.len() > self.config.max_message_size_bytes {
            return Err(CodecError::MessageTooLarge {
                limit: self.config.max_message_size_bytes,
            });
        }
        if frame.iter().all(u8::is_ascii_whitespace) {
            return Err(CodecError::EmptyMessage);
        }

        match serde_json::from_slice::<Value>(frame).map_err(CodecError::Json)? {
            Value::Object(envelope) => Ok(envelope),
            _ => Err(CodecError::EnvelopeMustBeObject),
        }
    }

    pub fn encode_frame(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let mut frame = serde_json::to_vec(envelope).map_err(CodecError::Encode)?;
        if frame.len() > self.config.max_message_size_bytes {
            return Err(CodecError::MessageTooLarge {
                limit: self.config.max_message_size_bytes,
            });
        }
        frame.push(MESSAGE_DELIMITER);
        Ok(frame)
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}
