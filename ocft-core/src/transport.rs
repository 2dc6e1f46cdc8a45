//! Outbound text seam. The host owns the chat channel; the engine only hands it encoded text.

use std::sync::mpsc;

/// Encoded protocol text addressed to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundText {
    pub peer_id: String,
    pub text: String,
}

/// Deliver text to a peer. Fire-and-forget from the engine's side; retries belong to the host.
pub trait Transport: Send {
    fn send_text(&self, peer_id: &str, text: &str) -> Result<(), TransportError>;
}

/// Queue outbound text on a channel drained by the host's channel writer.
impl Transport for mpsc::Sender<OutboundText> {
    fn send_text(&self, peer_id: &str, text: &str) -> Result<(), TransportError> {
        self.send(OutboundText {
            peer_id: peer_id.to_string(),
            text: text.to_string(),
        })
        .map_err(|_| TransportError::Closed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}
