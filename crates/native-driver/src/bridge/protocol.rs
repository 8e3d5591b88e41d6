//! Wire protocol types for client-driver communication.
//!
//! One JSON object per line in each direction:
//! - **Request** (stdin): `{"action":"parse","content":...,"encoding":...}`
//! - **Response** (stdout): `{"status":"ok","ast":...}` or `{"status":"error","message":...}`

use serde::{Deserialize, Serialize};

use crate::encoding::Encoding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Parse,
}

/// Messages from client to driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    /// Source text, already transformed by `encoding`.
    pub content: String,
    pub encoding: Encoding,
}

impl Request {
    /// Build a parse request, encoding `source` for the wire.
    pub fn parse(source: &str, encoding: Encoding) -> Self {
        Self {
            action: Action::Parse,
            content: encoding.encode(source),
            encoding,
        }
    }
}

/// Messages from driver to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    #[serde(rename = "ok")]
    Success { ast: serde_json::Value },

    #[serde(rename = "error")]
    Failure { message: String },
}
