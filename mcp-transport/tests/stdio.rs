use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCRequest;
use mcp_types::RequestId;
use mcp_transport::StdioTransport;
use mcp_transport::Transport;
use mcp_transport::TransportError;
use mcp_transport::TransportSendOptions;
use pretty_assertions::assert_eq;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;

fn ping(id: i64) -> JSONRPCMessage {
    JSONRPCMessage::Request(JSONRPCRequest {
        jsonrpc: JSONRPC_VERSION.into(),
        id: RequestId::Integer(id),
        method: "ping".into(),
        params: None,
    })
}

#[tokio::test]
async fn send_writes_one_json_object_per_line() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(ours);
    let transport = StdioTransport::over_streams(read_half, write_half);
    transport.start().await.unwrap();

    transport
        .send(ping(1), TransportSendOptions::default())
        .await
        .unwrap();
    transport
        .send(ping(2), TransportSendOptions::default())
        .await
        .unwrap();

    let (peer_read, _peer_write) = tokio::io::split(theirs);
    let mut lines = BufReader::new(peer_read).lines();
    let first = lines.next_line().await.unwrap().unwrap();
    let second = lines.next_line().await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_str::<JSONRPCMessage>(&first).unwrap(),
        ping(1)
    );
    assert_eq!(
        serde_json::from_str::<JSONRPCMessage>(&second).unwrap(),
        ping(2)
    );
}

#[tokio::test]
async fn inbound_lines_reach_every_callback_in_order() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(ours);
    let transport = StdioTransport::over_streams(read_half, write_half);

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(&'static str, JSONRPCMessage)>();
    for tag in ["first", "second"] {
        let seen_tx = seen_tx.clone();
        transport.on_message(Arc::new(move |message| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                seen_tx.send((tag, message)).ok();
                Ok(())
            })
        }));
    }
    transport.start().await.unwrap();

    let (_peer_read, mut peer_write) = tokio::io::split(theirs);
    let line = format!("{}\n", serde_json::to_string(&ping(5)).unwrap());
    peer_write.write_all(line.as_bytes()).await.unwrap();

    let (tag, message) = seen_rx.recv().await.unwrap();
    assert_eq!(tag, "first");
    assert_eq!(message, ping(5));
    let (tag, message) = seen_rx.recv().await.unwrap();
    assert_eq!(tag, "second");
    assert_eq!(message, ping(5));
}

#[tokio::test]
async fn malformed_line_goes_to_on_error_and_pump_survives() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(ours);
    let transport = StdioTransport::over_streams(read_half, write_half);

    let errors = Arc::new(AtomicUsize::new(0));
    {
        let errors = errors.clone();
        transport.on_error(Arc::new(move |error| {
            assert!(matches!(error, TransportError::InvalidMessage(_)));
            errors.fetch_add(1, Ordering::SeqCst);
        }));
    }
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    transport.on_message(Arc::new(move |message| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            seen_tx.send(message).ok();
            Ok(())
        })
    }));
    transport.start().await.unwrap();

    let (_peer_read, mut peer_write) = tokio::io::split(theirs);
    peer_write.write_all(b"this is not json\n").await.unwrap();
    let line = format!("{}\n", serde_json::to_string(&ping(9)).unwrap());
    peer_write.write_all(line.as_bytes()).await.unwrap();

    // The good message still arrives after the bad line.
    let message = seen_rx.recv().await.unwrap();
    assert_eq!(message, ping(9));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn eof_fires_on_close_exactly_once() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(ours);
    let transport = StdioTransport::over_streams(read_half, write_half);

    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = closes.clone();
        transport.on_close(Arc::new(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    transport.start().await.unwrap();

    drop(theirs); // peer hangs up -> reader observes EOF

    tokio::time::timeout(Duration::from_secs(2), async {
        while closes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("close callback fired");

    // Explicit close afterwards is idempotent.
    transport.close().await.unwrap();
    transport.close().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    assert!(matches!(
        transport
            .send(ping(1), TransportSendOptions::default())
            .await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn lifecycle_violations_are_reported() {
    let (ours, _theirs) = tokio::io::duplex(64);
    let (read_half, write_half) = tokio::io::split(ours);
    let transport = StdioTransport::over_streams(read_half, write_half);

    assert!(matches!(
        transport
            .send(ping(1), TransportSendOptions::default())
            .await,
        Err(TransportError::NotStarted)
    ));
    transport.start().await.unwrap();
    assert!(matches!(
        transport.start().await,
        Err(TransportError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn messages_split_across_chunk_boundaries_are_reassembled() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(ours);
    let transport = StdioTransport::over_streams(read_half, write_half);

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    transport.on_message(Arc::new(move |message| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            seen_tx.send(message).ok();
            Ok(())
        })
    }));
    transport.start().await.unwrap();

    let json = serde_json::to_string(&ping(11)).unwrap();
    let (head, tail) = json.split_at(json.len() / 2);
    let (_peer_read, mut peer_write) = tokio::io::split(theirs);
    peer_write.write_all(head.as_bytes()).await.unwrap();
    peer_write.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer_write.write_all(tail.as_bytes()).await.unwrap();
    peer_write.write_all(b"\n").await.unwrap();

    assert_eq!(seen_rx.recv().await.unwrap(), ping(11));
}
