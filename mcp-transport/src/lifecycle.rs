//! State machine and callback plumbing shared by every transport.

use std::sync::Mutex;
use std::sync::PoisonError;

use mcp_types::JSONRPCMessage;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::MessageCallback;
use crate::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Operational,
    Closed,
}

/// Shared lifecycle core: the `New → Operational → Closed` state machine,
/// the additive callback chains, and the per-transport serialization of
/// inbound delivery.
///
/// The state and callback vectors live behind std mutexes that are only held
/// for field access, never across an await. Delivery order is enforced by a
/// separate async mutex so concurrent pump tasks cannot interleave
/// `on_message` invocations.
pub struct TransportCore {
    state: Mutex<State>,
    message_callbacks: Mutex<Vec<MessageCallback>>,
    error_callbacks: Mutex<Vec<ErrorCallback>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    delivery: AsyncMutex<()>,
}

impl Default for TransportCore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::New),
            message_callbacks: Mutex::new(Vec::new()),
            error_callbacks: Mutex::new(Vec::new()),
            close_callbacks: Mutex::new(Vec::new()),
            delivery: AsyncMutex::new(()),
        }
    }

    /// Transition `New → Operational`.
    pub fn begin_start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            State::New => {
                *state = State::Operational;
                Ok(())
            }
            State::Operational => Err(TransportError::AlreadyStarted),
            State::Closed => Err(TransportError::Closed),
        }
    }

    /// Check that `send` is currently legal.
    pub fn ensure_operational(&self) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            State::New => Err(TransportError::NotStarted),
            State::Operational => Ok(()),
            State::Closed => Err(TransportError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == State::Closed
    }

    /// Transition to `Closed`. Returns `true` on the first call (the caller
    /// must then run its teardown and call [`TransportCore::fire_close`]);
    /// `false` means another path already closed the transport.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == State::Closed {
            return false;
        }
        *state = State::Closed;
        true
    }

    pub fn register_message_callback(&self, callback: MessageCallback) {
        self.message_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub fn register_error_callback(&self, callback: ErrorCallback) {
        self.error_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub fn register_close_callback(&self, callback: CloseCallback) {
        self.close_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Deliver one inbound envelope through the `on_message` chain, in
    /// registration order. Invocations are serialized per transport. A
    /// callback error is routed to `on_error` and does not stop the chain.
    pub async fn deliver_message(&self, message: JSONRPCMessage) {
        let _serialized = self.delivery.lock().await;
        let callbacks: Vec<MessageCallback> = self
            .message_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if let Err(e) = callback(message.clone()).await {
                self.deliver_error(&TransportError::Callback(format!("{e:#}")));
            }
        }
    }

    /// Fan a pump-level fault out to the `on_error` chain.
    pub fn deliver_error(&self, error: &TransportError) {
        let callbacks: Vec<ErrorCallback> = self
            .error_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if callbacks.is_empty() {
            warn!("transport error with no on_error callback registered: {error}");
        }
        for callback in callbacks {
            callback(error);
        }
    }

    /// Run the `on_close` chain. Must only be called by the task that won
    /// [`TransportCore::begin_close`], so it runs exactly once.
    pub fn fire_close(&self) {
        let callbacks: Vec<CloseCallback> = self
            .close_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn request() -> JSONRPCMessage {
        JSONRPCMessage::Request(mcp_types::JSONRPCRequest {
            jsonrpc: mcp_types::JSONRPC_VERSION.into(),
            id: mcp_types::RequestId::Integer(1),
            method: "ping".into(),
            params: None,
        })
    }

    #[test]
    fn start_is_one_shot() {
        let core = TransportCore::new();
        assert!(core.begin_start().is_ok());
        assert!(matches!(
            core.begin_start(),
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[test]
    fn send_requires_start() {
        let core = TransportCore::new();
        assert!(matches!(
            core.ensure_operational(),
            Err(TransportError::NotStarted)
        ));
        core.begin_start().expect("start");
        assert!(core.ensure_operational().is_ok());
        assert!(core.begin_close());
        assert!(matches!(
            core.ensure_operational(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn close_transitions_once() {
        let core = TransportCore::new();
        core.begin_start().expect("start");
        assert!(core.begin_close());
        assert!(!core.begin_close());
        assert!(!core.begin_close());
    }

    #[tokio::test]
    async fn message_callbacks_run_in_registration_order() {
        let core = TransportCore::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            core.register_message_callback(Arc::new(move |_msg| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().expect("order lock").push(tag);
                    Ok(())
                })
            }));
        }
        core.deliver_message(request()).await;
        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn failing_callback_reports_error_and_chain_continues() {
        let core = TransportCore::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        core.register_message_callback(Arc::new(|_msg| {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        }));
        {
            let delivered = delivered.clone();
            core.register_message_callback(Arc::new(move |_msg| {
                let delivered = delivered.clone();
                Box::pin(async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }
        {
            let errors = errors.clone();
            core.register_error_callback(Arc::new(move |_err| {
                errors.fetch_add(1, Ordering::SeqCst);
            }));
        }

        core.deliver_message(request()).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
