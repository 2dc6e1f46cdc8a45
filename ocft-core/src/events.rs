//! Notifications the engine raises on state transitions.

use std::sync::mpsc;

use crate::engine::TransferInfo;

/// Transfer notification for the host. Lifecycle events carry a snapshot of the record.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    OfferSent(TransferInfo),
    OfferReceived(TransferInfo),
    Accepted(TransferInfo),
    Rejected { info: TransferInfo, reason: String },
    Started(TransferInfo),
    ChunkSent { transfer_id: String, index: u32, total: u32 },
    /// `progress` is the receiver's running percentage, 0..=100.
    ChunkReceived { transfer_id: String, index: u32, progress: u8 },
    AckReceived { transfer_id: String, index: u32, received: bool },
    Completed(TransferInfo),
    Failed { info: TransferInfo, error: String },
    Resumed { info: TransferInfo, from: u32 },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferEvent::OfferSent(info)
            | TransferEvent::OfferReceived(info)
            | TransferEvent::Accepted(info)
            | TransferEvent::Started(info)
            | TransferEvent::Completed(info)
            | TransferEvent::Rejected { info, .. }
            | TransferEvent::Failed { info, .. }
            | TransferEvent::Resumed { info, .. } => &info.id,
            TransferEvent::ChunkSent { transfer_id, .. }
            | TransferEvent::ChunkReceived { transfer_id, .. }
            | TransferEvent::AckReceived { transfer_id, .. } => transfer_id,
        }
    }
}

/// Receives engine notifications. Must not call back into the engine.
pub trait EventSink: Send {
    fn emit(&self, event: TransferEvent);
}

impl EventSink for mpsc::Sender<TransferEvent> {
    fn emit(&self, event: TransferEvent) {
        // A host that dropped its receiver is not interested any more.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: TransferEvent) {}
}
