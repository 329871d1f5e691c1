use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_transport::MCP_SUBPROTOCOL;
use mcp_transport::Transport;
use mcp_transport::TransportSendOptions;
use mcp_transport::WebSocketTransport;
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::handshake::server::Response;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use url::Url;

fn accept_with_subprotocol(request: &Request, mut response: Response) -> Result<Response, tokio_tungstenite::tungstenite::http::Response<Option<String>>> {
    response.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(MCP_SUBPROTOCOL),
    );
    let _ = request;
    Ok(response)
}

fn note(method: &str) -> JSONRPCMessage {
    JSONRPCMessage::Notification(JSONRPCNotification {
        jsonrpc: JSONRPC_VERSION.into(),
        method: method.into(),
        params: None,
    })
}

#[tokio::test]
async fn frames_round_trip_between_client_and_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Echo server: every text frame comes straight back.
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, accept_with_subprotocol)
            .await
            .unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                if ws.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    let url = Url::parse(&format!("ws://{addr}/")).unwrap();
    let transport = WebSocketTransport::connect(&url).await.unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    transport.on_message(Arc::new(move |message| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            seen_tx.send(message).ok();
            Ok(())
        })
    }));
    transport.start().await.unwrap();

    transport
        .send(note("notifications/initialized"), TransportSendOptions::default())
        .await
        .unwrap();
    let echoed = seen_rx.recv().await.unwrap();
    assert_eq!(echoed, note("notifications/initialized"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn server_close_frame_closes_the_transport() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, accept_with_subprotocol)
            .await
            .unwrap();
        ws.send(Message::Close(None)).await.unwrap();
    });

    let url = Url::parse(&format!("ws://{addr}/")).unwrap();
    let transport = WebSocketTransport::connect(&url).await.unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = closes.clone();
        transport.on_close(Arc::new(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    transport.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while closes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("close fired");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
