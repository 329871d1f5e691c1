use std::sync::Arc;
use std::time::Duration;

use mcp_client::Client;
use mcp_client::ClientOptions;
use mcp_protocol::McpError;
use mcp_protocol::RequestOptions;
use mcp_server::Server;
use mcp_server::ServerOptions;
use mcp_server::ServerSession;
use mcp_server::tool;
use mcp_transport::InMemoryTransport;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ContentBlock;
use mcp_types::Implementation;
use mcp_types::ServerCapabilities;
use mcp_types::ServerCapabilitiesTools;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;

fn echo_server() -> Server {
    Server::new(
        Implementation::new("echo-server", "0.1.0"),
        ServerOptions {
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            ..Default::default()
        },
    )
}

async fn connect(server: &Server, client: &Client) -> ServerSession {
    let (client_transport, server_transport) = InMemoryTransport::create_linked_pair();
    let session = server
        .create_session(Arc::new(server_transport))
        .await
        .unwrap();
    client.connect(Arc::new(client_transport)).await.unwrap();
    session
}

async fn install_echo_tool(server: &Server) {
    server
        .add_tool(
            tool(
                "echo",
                "Echoes its input",
                json!({"text": {"type": "string"}}),
                &["text"],
            ),
            Arc::new(|params, _extra| {
                Box::pin(async move {
                    let text = params
                        .arguments
                        .as_ref()
                        .and_then(|a| a.get("text"))
                        .and_then(|t| t.as_str())
                        .unwrap_or_default();
                    Ok(CallToolResult::text(format!("Echo: {text}")))
                })
            }),
        )
        .await;
}

#[tokio::test]
async fn call_tool_round_trip() {
    let server = echo_server();
    install_echo_tool(&server).await;
    let client = Client::new(
        Implementation::new("test-client", "0.0.1"),
        ClientOptions::default(),
    );
    let _session = connect(&server, &client).await;

    let result = client
        .call_tool("echo", Some(json!({"text": "hi"})), None)
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({"content": [{"type": "text", "text": "Echo: hi"}]})
    );
}

#[tokio::test]
async fn list_tools_returns_registered_definitions() {
    let server = echo_server();
    install_echo_tool(&server).await;
    let client = Client::new(
        Implementation::new("test-client", "0.0.1"),
        ClientOptions::default(),
    );
    let _session = connect(&server, &client).await;

    let listed = client.list_tools(None).await.unwrap();
    assert_eq!(listed.tools.len(), 1);
    assert_eq!(listed.tools[0].name, "echo");
    assert_eq!(
        listed.tools[0].description.as_deref(),
        Some("Echoes its input")
    );

    let unknown = client.call_tool("not-there", None, None).await;
    let Err(McpError::Peer { code, .. }) = unknown else {
        panic!("expected error for unknown tool");
    };
    assert_eq!(code, -32602);
}

#[tokio::test]
async fn reserved_meta_keys_are_rejected_before_send() {
    let server = echo_server();
    install_echo_tool(&server).await;
    let client = Client::new(
        Implementation::new("test-client", "0.0.1"),
        ClientOptions::default(),
    );
    let _session = connect(&server, &client).await;

    let mut meta = serde_json::Map::new();
    meta.insert("mcp/x".to_string(), json!(1));
    let result = client.call_tool("echo", None, Some(meta)).await;
    assert!(matches!(result, Err(McpError::InvalidArgument(_))));
}

#[tokio::test]
async fn valid_meta_keys_round_trip_to_the_handler() {
    let server = echo_server();
    server
        .add_tool(
            tool("meta-probe", "Reflects the caller's _meta", json!({}), &[]),
            Arc::new(|params, _extra| {
                Box::pin(async move {
                    let value = params
                        .meta
                        .as_ref()
                        .and_then(|m| m.get("api.example.com/v"))
                        .cloned()
                        .unwrap_or(json!(null));
                    Ok(CallToolResult {
                        content: vec![ContentBlock::text("ok")],
                        structured_content: Some(json!({"observed": value})),
                        is_error: None,
                    })
                })
            }),
        )
        .await;
    let client = Client::new(
        Implementation::new("test-client", "0.0.1"),
        ClientOptions::default(),
    );
    let _session = connect(&server, &client).await;

    let mut meta = serde_json::Map::new();
    meta.insert("api.example.com/v".to_string(), json!(1));
    let result = client.call_tool("meta-probe", None, Some(meta)).await.unwrap();
    assert_eq!(result.structured_content, Some(json!({"observed": 1})));
}

#[tokio::test]
async fn tool_progress_reaches_the_caller_in_order() {
    let server = echo_server();
    server
        .add_tool(
            tool("countdown", "Reports progress", json!({}), &[]),
            Arc::new(|_params, extra| {
                Box::pin(async move {
                    for step in 1..=3 {
                        extra
                            .report_progress(f64::from(step), Some(3.0), None)
                            .await?;
                    }
                    Ok(CallToolResult::text("done"))
                })
            }),
        )
        .await;
    let client = Client::new(
        Implementation::new("test-client", "0.0.1"),
        ClientOptions::default(),
    );
    let _session = connect(&server, &client).await;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let result = client
        .call_tool_with_options(
            CallToolRequestParams {
                name: "countdown".to_string(),
                arguments: None,
                meta: None,
            },
            RequestOptions {
                timeout: Some(Duration::from_secs(5)),
                on_progress: Some(Arc::new(move |params| {
                    progress_tx.send(params.progress).ok();
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.content.len(), 1);

    assert_eq!(progress_rx.recv().await.unwrap(), 1.0);
    assert_eq!(progress_rx.recv().await.unwrap(), 2.0);
    assert_eq!(progress_rx.recv().await.unwrap(), 3.0);
}

#[tokio::test]
async fn server_instructions_and_info_surface_on_the_client() {
    let server = Server::new(
        Implementation::new("echo-server", "0.1.0"),
        ServerOptions {
            instructions: Some("Use the echo tool responsibly.".to_string()),
            ..Default::default()
        },
    );
    let client = Client::new(
        Implementation::new("test-client", "0.0.1"),
        ClientOptions::default(),
    );
    let _session = connect(&server, &client).await;

    assert_eq!(
        client.server_info().map(|i| i.name),
        Some("echo-server".to_string())
    );
    assert_eq!(
        client.server_instructions().as_deref(),
        Some("Use the echo tool responsibly.")
    );
    assert_eq!(
        client.negotiated_protocol_version().as_deref(),
        Some(mcp_types::LATEST_PROTOCOL_VERSION)
    );
}
