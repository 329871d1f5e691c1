//! The client side of the capability gate: which server capability a method
//! needs before the client may call it, and which client capability gates the
//! requests the client is willing to answer.

use mcp_protocol::McpError;
use mcp_protocol::Result;
use mcp_types::ClientCapabilities;
use mcp_types::ServerCapabilities;

/// Server capability required to *send* `method`, phrased as a human-readable
/// capability name for error messages. `None` means the method is always
/// allowed.
pub(crate) fn required_server_capability(method: &str) -> Option<&'static str> {
    match method {
        "initialize" | "ping" => None,
        m if m.starts_with("tools/") => Some("tools"),
        m if m.starts_with("prompts/") => Some("prompts"),
        "resources/subscribe" | "resources/unsubscribe" => Some("resources.subscribe"),
        m if m.starts_with("resources/") => Some("resources"),
        "completion/complete" => Some("completions"),
        "logging/setLevel" => Some("logging"),
        _ => None,
    }
}

pub(crate) fn check_server_capability(
    capabilities: &ServerCapabilities,
    method: &str,
) -> Result<()> {
    let missing = match required_server_capability(method) {
        None => return Ok(()),
        Some("tools") => capabilities.tools.is_none(),
        Some("prompts") => capabilities.prompts.is_none(),
        Some("resources") => capabilities.resources.is_none(),
        Some("resources.subscribe") => !capabilities.resources_subscribe(),
        Some("completions") => capabilities.completions.is_none(),
        Some("logging") => capabilities.logging.is_none(),
        Some(_) => false,
    };
    if missing {
        let capability = required_server_capability(method).unwrap_or(method);
        return Err(McpError::CapabilityUnsupported(format!(
            "server does not support {capability} (required for {method})"
        )));
    }
    Ok(())
}

pub(crate) fn check_local_handler_capability(
    capabilities: &ClientCapabilities,
    method: &str,
) -> Result<()> {
    let allowed = match method {
        "ping" => true,
        "sampling/createMessage" => capabilities.sampling.is_some(),
        "roots/list" => capabilities.roots.is_some(),
        "elicitation/create" => capabilities.elicitation.is_some(),
        _ => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(McpError::CapabilityUnsupported(format!(
            "client did not declare the capability required to handle {method}"
        )))
    }
}

pub(crate) fn check_local_notification_capability(
    capabilities: &ClientCapabilities,
    method: &str,
) -> Result<()> {
    let allowed = match method {
        "notifications/roots/list_changed" => capabilities.roots_list_changed(),
        _ => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(McpError::CapabilityUnsupported(format!(
            "client did not declare the capability required to send {method}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::ServerCapabilitiesResources;
    use mcp_types::ServerCapabilitiesTools;

    #[test]
    fn tools_methods_need_the_tools_capability() {
        let none = ServerCapabilities::default();
        assert!(check_server_capability(&none, "tools/list").is_err());
        assert!(check_server_capability(&none, "tools/call").is_err());

        let with_tools = ServerCapabilities {
            tools: Some(ServerCapabilitiesTools::default()),
            ..Default::default()
        };
        assert!(check_server_capability(&with_tools, "tools/list").is_ok());
    }

    #[test]
    fn subscribe_needs_the_subscribe_flag_not_just_resources() {
        let resources_only = ServerCapabilities {
            resources: Some(ServerCapabilitiesResources::default()),
            ..Default::default()
        };
        assert!(check_server_capability(&resources_only, "resources/read").is_ok());
        assert!(check_server_capability(&resources_only, "resources/subscribe").is_err());

        let subscribable = ServerCapabilities {
            resources: Some(ServerCapabilitiesResources {
                subscribe: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(check_server_capability(&subscribable, "resources/subscribe").is_ok());
    }

    #[test]
    fn ping_and_initialize_are_always_allowed() {
        let none = ServerCapabilities::default();
        assert!(check_server_capability(&none, "ping").is_ok());
        assert!(check_server_capability(&none, "initialize").is_ok());
    }
}
