use serde::{Deserialize, Serialize};

/// Error body returned by the management API for non-200 responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorContext {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub principals: Vec<String>,
}

impl ErrorEnvelope {
    /// Decodes an error body, returning `None` unless it carries a message.
    pub fn from_body(body: &str) -> Option<Self> {
        let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
        if envelope.message.is_empty() {
            return None;
        }
        Some(envelope)
    }
}
