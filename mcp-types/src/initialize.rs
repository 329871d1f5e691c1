use serde::Deserialize;
use serde::Serialize;

use crate::capabilities::ClientCapabilities;
use crate::capabilities::ServerCapabilities;

/// Name and version of an MCP peer implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
    pub protocol_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub capabilities: ServerCapabilities,
    /// Usage hints for the client's model, not shown to end users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub protocol_version: String,
    pub server_info: Implementation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn initialize_result_round_trip() {
        let result = InitializeResult {
            capabilities: ServerCapabilities::default(),
            instructions: Some("be gentle".to_string()),
            protocol_version: crate::LATEST_PROTOCOL_VERSION.to_string(),
            server_info: Implementation::new("test-server", "0.1.0"),
        };
        let value = serde_json::to_value(&result).expect("to_value");
        assert_eq!(
            value,
            json!({
                "capabilities": {},
                "instructions": "be gentle",
                "protocolVersion": "2025-03-26",
                "serverInfo": {"name": "test-server", "version": "0.1.0"},
            })
        );
        let back: InitializeResult = serde_json::from_value(value).expect("from_value");
        assert_eq!(back, result);
    }
}
