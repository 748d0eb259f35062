//! Wire schema of the per-context output stream.

use crate::core::context::RequestContext;
use crate::core::error::MessageError;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferStatus {
    InProgress,
    Finished,
    Error,
}

impl InferStatus {
    /// `FINISHED` and `ERROR` end a context's stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, InferStatus::Finished | InferStatus::Error)
    }
}

/// The unit published on a context's channel and forwarded to the caller.
///
/// Unknown fields are rejected on decode. `error` is only set on `ERROR` messages and is
/// always serialized, as `null` when absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutMessage {
    pub text: String,
    pub status: InferStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl OutMessage {
    pub fn in_progress(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: InferStatus::InProgress,
            error: None,
        }
    }

    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: InferStatus::Finished,
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            status: InferStatus::Error,
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn to_json(&self) -> String {
        // Plain strings and a unit enum, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(payload: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// One fragment of output produced for a context by the inference provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub context: RequestContext,
    pub text: String,
    pub is_last: bool,
}

impl ChunkResult {
    pub fn new(context: RequestContext, text: impl Into<String>, is_last: bool) -> Self {
        Self {
            context,
            text: text.into(),
            is_last,
        }
    }
}

impl From<&ChunkResult> for OutMessage {
    fn from(chunk: &ChunkResult) -> Self {
        if chunk.is_last {
            OutMessage::finished(chunk.text.clone())
        } else {
            OutMessage::in_progress(chunk.text.clone())
        }
    }
}
