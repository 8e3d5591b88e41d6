//! Transport encodings for source text.
//!
//! The wire protocol is line oriented, so the driver can ask for the source
//! to be wrapped in base64 when it cannot cope with arbitrary text inside a
//! JSON string.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EncodingError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Source is sent verbatim.
    #[default]
    Utf8,
    /// Source bytes are sent as standard, padded base64.
    Base64,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Base64 => "base64",
        }
    }

    /// Encode text for the wire. A `&str` is always well-formed, so this cannot fail.
    pub fn encode(&self, text: &str) -> String {
        match self {
            Self::Utf8 => text.to_owned(),
            Self::Base64 => STANDARD.encode(text.as_bytes()),
        }
    }

    /// Encode raw bytes, validating them as UTF-8 when no binary-safe wrapping is used.
    pub fn encode_bytes(&self, bytes: &[u8]) -> Result<String, EncodingError> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(EncodingError::InvalidUtf8),
            Self::Base64 => Ok(STANDARD.encode(bytes)),
        }
    }

    pub fn decode(&self, wire: &str) -> Result<String, EncodingError> {
        match self {
            Self::Utf8 => Ok(wire.to_owned()),
            Self::Base64 => {
                let bytes = STANDARD.decode(wire)?;
                String::from_utf8(bytes).map_err(|e| EncodingError::InvalidUtf8(e.utf8_error()))
            }
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    /// Empty tags select the default encoding.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "utf8" | "utf-8" => Ok(Self::Utf8),
            "base64" => Ok(Self::Base64),
            _ => Err(ConfigError::UnknownEncoding(s.to_string())),
        }
    }
}
