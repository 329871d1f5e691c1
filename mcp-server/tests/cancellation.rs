use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use mcp_client::Client;
use mcp_client::ClientOptions;
use mcp_protocol::RequestOptions;
use mcp_server::Server;
use mcp_server::ServerOptions;
use mcp_server::ServerSession;
use mcp_server::tool;
use mcp_transport::InMemoryTransport;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::Implementation;
use mcp_types::ServerCapabilities;
use mcp_types::ServerCapabilitiesTools;
use serde_json::json;
use tokio::sync::mpsc;

async fn connect(server: &Server, client: &Client) -> ServerSession {
    let (client_transport, server_transport) = InMemoryTransport::create_linked_pair();
    let session = server
        .create_session(Arc::new(server_transport))
        .await
        .unwrap();
    client.connect(Arc::new(client_transport)).await.unwrap();
    session
}

#[tokio::test]
async fn timed_out_call_cancels_the_server_side_handler() {
    let server = Server::new(
        Implementation::new("slow-server", "0.1.0"),
        ServerOptions {
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools::default()),
                ..Default::default()
            },
            ..Default::default()
        },
    );

    // Signals when the handler future is dropped, which is how the engine
    // aborts a cancelled handler.
    struct DropSignal(mpsc::UnboundedSender<Instant>);
    impl Drop for DropSignal {
        fn drop(&mut self) {
            let _ = self.0.send(Instant::now());
        }
    }

    let (cancelled_tx, mut cancelled_rx) = mpsc::unbounded_channel();
    server
        .add_tool(
            tool("stall", "Never returns", json!({}), &[]),
            Arc::new(move |_params, _extra| {
                let signal = DropSignal(cancelled_tx.clone());
                Box::pin(async move {
                    let _signal = signal;
                    futures::future::pending::<()>().await;
                    Ok(CallToolResult::text("unreachable"))
                })
            }),
        )
        .await;

    let client = Client::new(
        Implementation::new("impatient", "0.0.1"),
        ClientOptions::default(),
    );
    let _session = connect(&server, &client).await;

    let started = Instant::now();
    let result = client
        .call_tool_with_options(
            CallToolRequestParams {
                name: "stall".to_string(),
                arguments: None,
                meta: None,
            },
            RequestOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await;

    let Err(error) = result else {
        panic!("expected a timeout");
    };
    assert_eq!(error.code(), -32001);

    // The peer saw notifications/cancelled promptly.
    let observed = tokio::time::timeout(Duration::from_millis(200), cancelled_rx.recv())
        .await
        .expect("handler observed the cancellation")
        .expect("channel open");
    assert!(observed.duration_since(started) < Duration::from_millis(200));
}
