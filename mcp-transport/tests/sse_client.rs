use std::sync::Arc;

use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_transport::SseClientTransport;
use mcp_transport::Transport;
use mcp_transport::TransportError;
use mcp_transport::TransportSendOptions;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use url::Url;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

#[tokio::test]
async fn start_resolves_endpoint_and_messages_flow_both_ways() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: endpoint\n",
        "data: /messages?sid=x\n",
        "\n",
        "id: 1\n",
        "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/mcp/sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let sse_url = Url::parse(&format!("{}/api/mcp/sse", server.uri())).unwrap();
    let transport = SseClientTransport::new(sse_url, None);
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    transport.on_message(Arc::new(move |message| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            seen_tx.send(message).ok();
            Ok(())
        })
    }));

    transport.start().await.unwrap();

    // Absolute endpoint paths rebase onto the origin.
    let endpoint = transport.endpoint_url().unwrap();
    assert_eq!(
        endpoint.as_str(),
        format!("{}/messages?sid=x", server.uri())
    );

    // The message event on the stream is delivered.
    let delivered = seen_rx.recv().await.unwrap();
    assert_eq!(
        delivered,
        JSONRPCMessage::Notification(JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method: "notifications/tools/list_changed".into(),
            params: None,
        })
    );

    // Sends POST to the resolved endpoint; the 202 body is ignored.
    transport
        .send(
            JSONRPCMessage::Notification(JSONRPCNotification {
                jsonrpc: JSONRPC_VERSION.into(),
                method: "notifications/initialized".into(),
                params: None,
            }),
            TransportSendOptions::default(),
        )
        .await
        .unwrap();

    transport.close().await.unwrap();

    let posts: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .collect();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].url.path(), "/messages");
    assert_eq!(posts[0].url.query(), Some("sid=x"));
}

#[tokio::test]
async fn relative_endpoint_paths_resolve_against_the_stream_url() {
    let server = MockServer::start().await;
    let body = concat!("event: endpoint\n", "data: post?sid=y\n", "\n");
    Mock::given(method("GET"))
        .and(path("/api/mcp/sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let sse_url = Url::parse(&format!("{}/api/mcp/sse", server.uri())).unwrap();
    let transport = SseClientTransport::new(sse_url, None);
    transport.start().await.unwrap();
    assert_eq!(
        transport.endpoint_url().unwrap().as_str(),
        format!("{}/api/mcp/post?sid=y", server.uri())
    );
    transport.close().await.unwrap();
}

#[tokio::test]
async fn failed_initial_connect_fails_start() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let sse_url = Url::parse(&format!("{}/sse", server.uri())).unwrap();
    let transport = SseClientTransport::new(sse_url, None);
    let result = transport.start().await;
    assert!(matches!(
        result,
        Err(TransportError::Http { status: 404, .. })
    ));
}
