use mtbridge_core::{BridgeError, Command, CommandName, CommandParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Layout of the command file: `id`, `command`, then the command's own
/// fields at the top level (the EA reads them by key, not from a nested map).
#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    id: &'a str,
    command: CommandName,
    #[serde(flatten)]
    params: &'a CommandParams,
}

/// Layout of the response file written by the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// A non-empty `error` wins over any `result`. A missing result is `null`.
    pub fn into_outcome(self) -> Result<Value, BridgeError> {
        match self.error {
            Some(error) if !error.trim().is_empty() => Err(BridgeError::Rejected(error)),
            _ => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Serialize a command into the bytes of the command file.
pub fn encode_command(command: &Command) -> Result<Vec<u8>, BridgeError> {
    let envelope = CommandEnvelope {
        id: &command.id,
        command: command.name,
        params: &command.params,
    };
    serde_json::to_vec(&envelope)
        .map_err(|e| BridgeError::MalformedPayload(format!("Serialization error: {}", e)))
}

/// Parse the bytes of a response file.
///
/// Empty, whitespace-only, truncated, or otherwise invalid content is
/// `MalformedPayload`. During collection that only means "not ready yet".
pub fn decode_response(bytes: &[u8]) -> Result<Response, BridgeError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|e| BridgeError::MalformedPayload(format!("Invalid UTF-8: {}", e)))?
        .trim();

    if text.is_empty() {
        return Err(BridgeError::MalformedPayload(
            "Empty response file".to_string(),
        ));
    }

    serde_json::from_str(text)
        .map_err(|e| BridgeError::MalformedPayload(format!("Deserialization error: {}", e)))
}
