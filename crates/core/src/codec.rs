//! Record serialization strategies.
//!
//! Producer and consumer sessions pick one [`SerdeFormat`] for keys and one
//! for values from configuration. The set is closed on purpose: each variant
//! is a named strategy rather than a pluggable type.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, ConfigError};

/// Named serialization strategy for record keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerdeFormat {
    /// UTF-8 text; decoding rejects invalid UTF-8
    String,
    /// Raw bytes; decoding is lossy UTF-8 for display
    Bytes,
    /// JSON document; both directions validate and re-encode compactly
    Json,
}

impl SerdeFormat {
    /// Encode a message for the wire.
    pub fn encode(&self, value: &str) -> Result<Bytes, CodecError> {
        match self {
            Self::String | Self::Bytes => Ok(Bytes::copy_from_slice(value.as_bytes())),
            Self::Json => {
                let parsed: serde_json::Value = serde_json::from_str(value)
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                let compact = serde_json::to_vec(&parsed)
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                Ok(Bytes::from(compact))
            }
        }
    }

    /// Decode a wire payload back into text.
    pub fn decode(&self, raw: &[u8]) -> Result<String, CodecError> {
        match self {
            Self::String => std::str::from_utf8(raw)
                .map(str::to_owned)
                .map_err(|e| CodecError::InvalidUtf8(e.to_string())),
            Self::Bytes => Ok(String::from_utf8_lossy(raw).into_owned()),
            Self::Json => {
                let parsed: serde_json::Value = serde_json::from_slice(raw)
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                Ok(parsed.to_string())
            }
        }
    }
}

impl fmt::Display for SerdeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for SerdeFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "bytes" => Ok(Self::Bytes),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                field: "format".to_owned(),
                reason: format!("unknown serde format '{other}', expected string, bytes or json"),
            }),
        }
    }
}
