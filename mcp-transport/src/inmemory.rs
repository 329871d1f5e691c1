//! A linked pair of in-process transports, used by the engine and role test
//! suites. Whatever one side sends, the other side's `on_message` chain
//! receives, in order.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use mcp_types::JSONRPCMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::MessageCallback;
use crate::Transport;
use crate::TransportCore;
use crate::TransportError;
use crate::TransportSendOptions;

pub struct InMemoryTransport {
    core: Arc<TransportCore>,
    /// Dropped on close so the peer's pump observes end-of-stream.
    peer_tx: Mutex<Option<mpsc::UnboundedSender<JSONRPCMessage>>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<JSONRPCMessage>>>,
    shutdown: CancellationToken,
}

impl InMemoryTransport {
    /// Two transports joined back to back. Sends on the first arrive at the
    /// second and vice versa.
    pub fn create_linked_pair() -> (InMemoryTransport, InMemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = InMemoryTransport {
            core: Arc::new(TransportCore::new()),
            peer_tx: Mutex::new(Some(b_tx)),
            incoming_rx: Mutex::new(Some(a_rx)),
            shutdown: CancellationToken::new(),
        };
        let b = InMemoryTransport {
            core: Arc::new(TransportCore::new()),
            peer_tx: Mutex::new(Some(a_tx)),
            incoming_rx: Mutex::new(Some(b_rx)),
            shutdown: CancellationToken::new(),
        };
        (a, b)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.core.begin_start()?;
        let Some(mut incoming_rx) = self
            .incoming_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(TransportError::SendFailed(
                "incoming channel already consumed".to_string(),
            ));
        };
        let core = self.core.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    maybe = incoming_rx.recv() => match maybe {
                        Some(message) => message,
                        // Peer dropped its sender: it closed.
                        None => break,
                    },
                };
                core.deliver_message(message).await;
            }
            if core.begin_close() {
                core.fire_close();
            }
        });
        Ok(())
    }

    async fn send(
        &self,
        message: JSONRPCMessage,
        _options: TransportSendOptions,
    ) -> Result<(), TransportError> {
        self.core.ensure_operational()?;
        let tx = self
            .peer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(message)
            .map_err(|_| TransportError::SendFailed("peer transport is gone".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.core.begin_close() {
            self.peer_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.shutdown.cancel();
            self.core.fire_close();
        }
        Ok(())
    }

    fn on_message(&self, callback: MessageCallback) {
        self.core.register_message_callback(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.core.register_error_callback(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.core.register_close_callback(callback);
    }
}
