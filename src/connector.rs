//! The Connector Surface: a small capability set (start/stop/send-or-poll/
//! status) shared by every transport, tagged by [`TransportKind`] rather than
//! modeled as one trait per protocol (`spec.md` §9's design note).

use async_trait::async_trait;

use crate::domain::channel::TransportKind;
use crate::domain::message::Response;
use crate::domain_types::MessageId;
use crate::error::ConnectorError;
use crate::router::SourceChain;

/// Status an operator-facing dashboard polls for a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatusEvent {
    /// Not currently reading or writing.
    Idle,
    /// A source connector is actively polling or listening.
    Reading,
    /// A source connector's transport is unavailable.
    Disconnected,
    /// A source connector is in the middle of accepting a message.
    Receiving,
    /// A destination connector is in the middle of sending a message.
    Sending,
}

/// Capabilities every source connector exposes, independent of transport.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Which transport this connector speaks.
    fn transport(&self) -> TransportKind;

    /// Begins listening/polling. Idempotent if already started.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] if the transport cannot be
    /// started (e.g. bind failure, bad credentials).
    async fn start(&self) -> Result<(), ConnectorError>;

    /// Stops listening/polling, allowing in-flight reads to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] if shutdown fails.
    async fn stop(&self) -> Result<(), ConnectorError>;

    /// Current dashboard status.
    fn status(&self) -> ConnectorStatusEvent;
}

/// Capabilities every destination connector exposes, independent of transport.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    /// Which transport this connector speaks.
    fn transport(&self) -> TransportKind;

    /// Begins accepting sends. Idempotent if already started.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] if the transport cannot be
    /// started.
    async fn start(&self) -> Result<(), ConnectorError>;

    /// Stops accepting sends.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] if shutdown fails.
    async fn stop(&self) -> Result<(), ConnectorError>;

    /// Sends `payload` (with connector properties already resolved by the
    /// router) and returns the destination's response. `message_id` and
    /// `chain` carry the dispatching message's own identity and ancestor
    /// source chain, so a `Vm`-transport destination can extend the chain
    /// of custody across the hop instead of starting a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Retryable`] for a transient failure the
    /// pipeline should retry, or [`ConnectorError::Permanent`] for one it
    /// should not.
    async fn send(&self, payload: &[u8], message_id: MessageId, chain: &SourceChain) -> Result<Response, ConnectorError>;

    /// Current dashboard status.
    fn status(&self) -> ConnectorStatusEvent;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDestination {
        transport: TransportKind,
        fail_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DestinationConnector for StubDestination {
        fn transport(&self) -> TransportKind {
            self.transport
        }

        async fn start(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn send(&self, _payload: &[u8], _message_id: MessageId, _chain: &SourceChain) -> Result<Response, ConnectorError> {
            if self.fail_once.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(ConnectorError::Retryable("connection reset".to_string()));
            }
            Ok(Response::sent())
        }

        fn status(&self) -> ConnectorStatusEvent {
            ConnectorStatusEvent::Idle
        }
    }

    #[tokio::test]
    async fn retryable_failure_then_success() {
        let connector =
            StubDestination { transport: TransportKind::Http, fail_once: std::sync::atomic::AtomicBool::new(true) };
        let message_id = MessageId::try_new(1).unwrap();
        let chain = SourceChain::default();

        let first = connector.send(b"payload", message_id, &chain).await;
        assert!(matches!(first, Err(ConnectorError::Retryable(_))));

        let second = connector.send(b"payload", message_id, &chain).await;
        assert!(second.is_ok());
    }
}
