//! The outer, on-wire envelope. The relay forwards these fields verbatim and
//! must not mutate them.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterEnvelope {
    pub device_id: String,
    pub payload: String,
    pub signature: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_counter: Option<i64>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeValidationError {
    UnsupportedVersion,
}

impl OuterEnvelope {
    /// Required-field presence is guaranteed by `serde` (the struct has no
    /// optional required fields); only the version needs runtime checking.
    pub fn validate_version(&self) -> Result<(), EnvelopeValidationError> {
        if self.version != PROTOCOL_VERSION {
            return Err(EnvelopeValidationError::UnsupportedVersion);
        }
        Ok(())
    }
}
