//! Host-driven transfer engine: the host passes incoming text in, the engine updates the
//! per-transfer state machine and emits protocol text and notifications through injected seams.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::chunk::{self, AssembleError, Assembler, ChunkError, FileInfo};
use crate::config::NodeConfig;
use crate::events::{EventSink, NoopSink, TransferEvent};
use crate::protocol::{
    self, error_code, AcceptPayload, AckPayload, ChunkPayload, CompletePayload, EncodeError,
    ErrorPayload, OfferPayload, Payload, RejectPayload, FINAL_ACK_INDEX,
};
use crate::storage::FileStore;
use crate::transport::{Transport, TransportError};
use crate::trust::{self, MemoryTrustStore, TrustStore};
use crate::util::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Pending,
    Accepted,
    Rejected,
    Transferring,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Accepted => "accepted",
            TransferState::Rejected => "rejected",
            TransferState::Transferring => "transferring",
            TransferState::Completing => "completing",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Rejected
                | TransferState::Completed
                | TransferState::Failed
                | TransferState::Cancelled
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one transfer as seen from this side.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
    pub id: String,
    pub direction: Direction,
    pub state: TransferState,
    pub peer_id: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// Sender: indices acked by the peer. Receiver: indices verified and stored.
    pub received_chunks: BTreeSet<u32>,
    pub started_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
    /// Sender: source file. Receiver: destination, once written.
    pub local_path: Option<PathBuf>,
    /// Cleared once the transfer is rejected, cancelled or its assembled content is wrong.
    pub resumable: bool,
}

impl TransferInfo {
    fn outgoing(id: String, peer_id: &str, file: FileInfo, path: &Path, now: u64) -> Self {
        Self {
            id,
            direction: Direction::Send,
            state: TransferState::Pending,
            peer_id: peer_id.to_string(),
            filename: file.filename,
            size: file.size,
            mime_type: file.mime_type,
            hash: file.hash,
            chunk_size: file.chunk_size,
            total_chunks: file.total_chunks,
            received_chunks: BTreeSet::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            local_path: Some(path.to_path_buf()),
            resumable: true,
        }
    }

    fn incoming(id: &str, peer_id: &str, offer: &OfferPayload, now: u64) -> Self {
        Self {
            id: id.to_string(),
            direction: Direction::Receive,
            state: TransferState::Pending,
            peer_id: peer_id.to_string(),
            filename: offer.filename.clone(),
            size: offer.size,
            mime_type: offer.mime_type.clone(),
            hash: offer.hash.clone(),
            chunk_size: offer.chunk_size,
            total_chunks: offer.total_chunks,
            received_chunks: BTreeSet::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            local_path: None,
            resumable: true,
        }
    }

    /// Whether `offer` describes the same file as this record.
    fn matches_offer(&self, offer: &OfferPayload) -> bool {
        self.filename == offer.filename
            && self.size == offer.size
            && self.hash == offer.hash
            && self.chunk_size == offer.chunk_size
            && self.total_chunks == offer.total_chunks
    }

    /// Percentage of chunks exchanged, 0..=100.
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        (self.received_chunks.len() as u64 * 100 / u64::from(self.total_chunks)) as u8
    }

    /// First chunk index after the highest one exchanged so far.
    pub fn resume_index(&self) -> u32 {
        self.received_chunks.last().map_or(0, |&i| i + 1)
    }

    fn set_state(&mut self, state: TransferState) {
        self.state = state;
        self.updated_at = now_millis();
    }
}

/// Engine-private per-transfer bookkeeping around the public record.
struct Transfer {
    info: TransferInfo,
    /// Receiver only; present while chunks may still arrive.
    assembler: Option<Assembler>,
    /// Sender only; the single unacknowledged chunk.
    in_flight: Option<u32>,
    /// Consecutive nacks for `in_flight`.
    retries: u32,
}

impl Transfer {
    fn new(info: TransferInfo) -> Self {
        Self {
            info,
            assembler: None,
            in_flight: None,
            retries: 0,
        }
    }
}

/// Injected collaborators plus configuration. Kept apart from the transfer map so handlers can
/// hold a transfer mutably while sending.
struct Context {
    config: NodeConfig,
    transport: Box<dyn Transport>,
    store: Box<dyn FileStore>,
    trust: Box<dyn TrustStore>,
    events: Box<dyn EventSink>,
}

impl Context {
    fn send(
        &self,
        peer_id: &str,
        transfer_id: &str,
        payload: Payload,
    ) -> Result<(), TransferError> {
        let msg = protocol::build(transfer_id, self.config.node_id.as_str(), peer_id, payload);
        let text = protocol::encode_for_transport(&msg)?;
        self.transport.send_text(peer_id, &text)?;
        Ok(())
    }

    /// Fire-and-forget send; delivery failures are the host's to retry.
    fn send_or_warn(&self, peer_id: &str, transfer_id: &str, payload: Payload) {
        let kind = payload.message_type();
        if let Err(e) = self.send(peer_id, transfer_id, payload) {
            warn!(transfer_id, peer = peer_id, ?kind, error = %e, "failed to send message");
        }
    }

    fn emit(&self, event: TransferEvent) {
        self.events.emit(event);
    }

    fn offer_for(&self, info: &TransferInfo, resume_from: Option<u32>) -> OfferPayload {
        let secret = self.trust.get(&info.peer_id).map(|p| p.secret);
        let secret_ttl = match (&secret, self.config.secret_ttl_secs) {
            (Some(_), Some(ttl)) => Some(now_millis().saturating_add(ttl.saturating_mul(1000))),
            _ => None,
        };
        OfferPayload {
            filename: info.filename.clone(),
            size: info.size,
            mime_type: info.mime_type.clone(),
            hash: info.hash.clone(),
            chunk_size: info.chunk_size,
            total_chunks: info.total_chunks,
            secret,
            secret_ttl,
            resume_from,
            metadata: None,
        }
    }

    /// Receiver: accept from `resume_from`, keeping verified chunks when resuming past 0.
    /// Without verified chunks to keep, the transfer restarts at 0. Returns the index the
    /// sender is asked to start at.
    fn accept(&self, t: &mut Transfer, resume_from: Option<u32>) -> u32 {
        let start = match resume_from {
            Some(i) if i > 0 && t.assembler.is_some() => i,
            _ => {
                let info = &t.info;
                t.assembler = Some(Assembler::new(info.hash.clone(), info.size, info.chunk_size));
                t.info.received_chunks.clear();
                t.info.resumable = true;
                0
            }
        };
        t.info.error = None;
        t.info.set_state(TransferState::Accepted);
        info!(transfer_id = %t.info.id, peer = %t.info.peer_id, start, "transfer accepted");
        let payload = Payload::Accept(AcceptPayload {
            ready: true,
            resume_from: (start > 0).then_some(start),
        });
        self.send_or_warn(&t.info.peer_id, &t.info.id, payload);
        self.emit(TransferEvent::Accepted(t.info.clone()));
        start
    }

    /// Sender: put chunk `index` on the wire, or send `complete` once past the last chunk.
    fn send_chunk_or_finish(&self, t: &mut Transfer, index: u32) {
        if index >= t.info.total_chunks {
            t.in_flight = None;
            t.info.set_state(TransferState::Completing);
            info!(transfer_id = %t.info.id, "all chunks acknowledged, completing");
            let payload = Payload::Complete(CompletePayload {
                total_chunks: t.info.total_chunks,
                hash: t.info.hash.clone(),
            });
            self.send_or_warn(&t.info.peer_id, &t.info.id, payload);
            return;
        }
        let read = match t.info.local_path.as_deref() {
            Some(path) => chunk::read_chunk(&*self.store, path, index, t.info.chunk_size),
            None => Err(ChunkError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no source path",
            ))),
        };
        match read {
            Ok(c) => {
                t.in_flight = Some(index);
                debug!(transfer_id = %t.info.id, index, len = c.data.len(), "sending chunk");
                let payload = Payload::Chunk(ChunkPayload {
                    index,
                    data: c.data,
                    hash: c.hash,
                });
                self.send_or_warn(&t.info.peer_id, &t.info.id, payload);
                self.emit(TransferEvent::ChunkSent {
                    transfer_id: t.info.id.clone(),
                    index,
                    total: t.info.total_chunks,
                });
            }
            Err(e) => {
                let error = format!("failed to read chunk {index}: {e}");
                let payload = Payload::Error(ErrorPayload {
                    code: error_code::IO_ERROR.to_string(),
                    message: error.clone(),
                    recoverable: false,
                });
                self.send_or_warn(&t.info.peer_id, &t.info.id, payload);
                self.fail(t, error);
            }
        }
    }

    fn fail(&self, t: &mut Transfer, error: String) {
        t.in_flight = None;
        t.info.error = Some(error.clone());
        t.info.set_state(TransferState::Failed);
        warn!(transfer_id = %t.info.id, peer = %t.info.peer_id, %error, "transfer failed");
        self.emit(TransferEvent::Failed {
            info: t.info.clone(),
            error,
        });
    }

    fn complete(&self, t: &mut Transfer) {
        t.in_flight = None;
        t.assembler = None;
        t.info.completed_at = Some(now_millis());
        t.info.set_state(TransferState::Completed);
        info!(
            transfer_id = %t.info.id,
            peer = %t.info.peer_id,
            size = t.info.size,
            "transfer completed"
        );
        self.emit(TransferEvent::Completed(t.info.clone()));
    }
}

/// Per-node transfer engine. Wrap it in a mutex if messages arrive from several tasks: each
/// call runs one message to completion before the next.
pub struct TransferEngine {
    ctx: Context,
    transfers: HashMap<String, Transfer>,
}

impl TransferEngine {
    /// New engine with an empty trust store and no event listener.
    pub fn new(
        config: NodeConfig,
        transport: impl Transport + 'static,
        store: impl FileStore + 'static,
    ) -> Self {
        Self {
            ctx: Context {
                config,
                transport: Box::new(transport),
                store: Box::new(store),
                trust: Box::new(MemoryTrustStore::new()),
                events: Box::new(NoopSink),
            },
            transfers: HashMap::new(),
        }
    }

    pub fn with_trust_store(mut self, trust: impl TrustStore + 'static) -> Self {
        self.ctx.trust = Box::new(trust);
        self
    }

    pub fn with_events(mut self, events: impl EventSink + 'static) -> Self {
        self.ctx.events = Box::new(events);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.ctx.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<&TransferInfo> {
        self.transfers.get(transfer_id).map(|t| &t.info)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &TransferInfo> {
        self.transfers.values().map(|t| &t.info)
    }

    /// Transfers marked resumable that have exchanged at least one chunk and did not finish
    /// successfully, get rejected or get cancelled.
    pub fn resumable_transfers(&self) -> Vec<&TransferInfo> {
        self.transfers()
            .filter(|info| {
                info.resumable
                    && info.state != TransferState::Completed
                    && !info.received_chunks.is_empty()
            })
            .collect()
    }

    /// Offer `path` to `peer_id`. Returns the new transfer id once the offer is handed to the
    /// transport; progress is then driven by incoming messages.
    pub fn send_file(
        &mut self,
        peer_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<String, TransferError> {
        let path = path.as_ref();
        let file = chunk::describe(&*self.ctx.store, path, self.ctx.config.chunk_size)?;
        let id = uuid::Uuid::new_v4().to_string();
        let info = TransferInfo::outgoing(id.clone(), peer_id, file, path, now_millis());
        let offer = self.ctx.offer_for(&info, None);
        self.ctx.send(peer_id, &id, Payload::Offer(offer))?;
        info!(
            transfer_id = %id,
            peer = peer_id,
            file = %info.filename,
            size = info.size,
            chunks = info.total_chunks,
            "offer sent"
        );
        self.ctx.emit(TransferEvent::OfferSent(info.clone()));
        self.transfers.insert(id.clone(), Transfer::new(info));
        Ok(id)
    }

    /// Accept a pending incoming offer, optionally asking the sender to start at `resume_from`.
    /// Returns the index actually requested: `resume_from` is honoured only when verified
    /// chunks from an earlier attempt are still held, otherwise the transfer starts at 0.
    pub fn accept_transfer(
        &mut self,
        transfer_id: &str,
        resume_from: Option<u32>,
    ) -> Result<u32, TransferError> {
        let t = pending_incoming(&mut self.transfers, transfer_id, "accept")?;
        Ok(self.ctx.accept(t, resume_from))
    }

    /// Decline a pending incoming offer.
    pub fn reject_transfer(
        &mut self,
        transfer_id: &str,
        reason: &str,
    ) -> Result<(), TransferError> {
        let t = pending_incoming(&mut self.transfers, transfer_id, "reject")?;
        t.assembler = None;
        t.info.resumable = false;
        t.info.error = Some(reason.to_string());
        t.info.set_state(TransferState::Rejected);
        info!(transfer_id, peer = %t.info.peer_id, reason, "transfer rejected");
        let payload = Payload::Reject(RejectPayload {
            reason: reason.to_string(),
        });
        self.ctx.send_or_warn(&t.info.peer_id, transfer_id, payload);
        self.ctx.emit(TransferEvent::Rejected {
            info: t.info.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Restart an unfinished transfer after the highest exchanged chunk. The receiver re-accepts
    /// from that point; the sender re-offers with `resumeFrom` and waits for a new accept.
    /// Returns the resume index.
    pub fn resume_transfer(&mut self, transfer_id: &str) -> Result<u32, TransferError> {
        let t = self
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if !t.info.resumable || t.info.state == TransferState::Completed {
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                state: t.info.state,
                op: "resume",
            });
        }
        let from = t.info.resume_index();
        let from = match t.info.direction {
            Direction::Receive => self.ctx.accept(t, Some(from)),
            Direction::Send => {
                t.in_flight = None;
                t.retries = 0;
                t.info.error = None;
                t.info.set_state(TransferState::Pending);
                let offer = self.ctx.offer_for(&t.info, Some(from));
                self.ctx
                    .send_or_warn(&t.info.peer_id, transfer_id, Payload::Offer(offer));
                from
            }
        };
        info!(transfer_id, peer = %t.info.peer_id, from, "transfer resumed");
        self.ctx.emit(TransferEvent::Resumed {
            info: t.info.clone(),
            from,
        });
        Ok(from)
    }

    /// Host-driven abandonment. Later protocol messages for the transfer are ignored.
    pub fn cancel_transfer(&mut self, transfer_id: &str) -> Result<(), TransferError> {
        let t = self
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if t.info.state.is_terminal() {
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                state: t.info.state,
                op: "cancel",
            });
        }
        t.assembler = None;
        t.in_flight = None;
        t.info.resumable = false;
        t.info.set_state(TransferState::Cancelled);
        info!(transfer_id, "transfer cancelled");
        Ok(())
    }

    /// Feed one text received from `from_peer`. Returns false if the text is not protocol
    /// traffic; true if it was recognised, whether or not it changed any state.
    pub fn handle_message(&mut self, from_peer: &str, raw: &str) -> bool {
        if !protocol::is_protocol_text(raw) {
            return false;
        }
        let Some(msg) = protocol::decode_from_transport(raw) else {
            return false;
        };
        if msg.to != self.ctx.config.node_id {
            debug!(transfer_id = %msg.transfer_id, to = %msg.to, "message addressed elsewhere");
            return true;
        }
        let id = msg.transfer_id;
        match msg.payload {
            Payload::Offer(offer) => self.on_offer(from_peer, &id, offer),
            Payload::Accept(accept) => self.on_accept(from_peer, &id, accept),
            Payload::Reject(reject) => self.on_reject(from_peer, &id, reject),
            Payload::Chunk(chunk) => self.on_chunk(from_peer, &id, chunk),
            Payload::Ack(ack) => self.on_ack(from_peer, &id, ack),
            Payload::Complete(complete) => self.on_complete(from_peer, &id, complete),
            Payload::Error(error) => self.on_error(from_peer, &id, error),
        }
        true
    }

    fn on_offer(&mut self, from_peer: &str, transfer_id: &str, offer: OfferPayload) {
        if let Err(e) = validate_offer(&offer, self.ctx.config.max_file_size) {
            info!(transfer_id, peer = from_peer, reason = %e, "rejecting offer");
            let payload = Payload::Reject(RejectPayload {
                reason: e.to_string(),
            });
            self.ctx.send_or_warn(from_peer, transfer_id, payload);
            return;
        }
        let now = now_millis();
        let resumed = match self.transfers.get_mut(transfer_id) {
            Some(t) if t.info.peer_id != from_peer || t.info.direction != Direction::Receive => {
                debug!(transfer_id, peer = from_peer, "offer clashes with a known transfer");
                return;
            }
            Some(t)
                if matches!(
                    t.info.state,
                    TransferState::Completed | TransferState::Cancelled
                ) =>
            {
                debug!(transfer_id, state = %t.info.state, "ignoring repeated offer");
                return;
            }
            Some(t) if t.info.matches_offer(&offer) => {
                t.info.error = None;
                t.info.set_state(TransferState::Pending);
                true
            }
            Some(t) => {
                *t = Transfer::new(TransferInfo::incoming(transfer_id, from_peer, &offer, now));
                false
            }
            None => {
                let info = TransferInfo::incoming(transfer_id, from_peer, &offer, now);
                self.transfers
                    .insert(transfer_id.to_string(), Transfer::new(info));
                false
            }
        };
        let Some(t) = self.transfers.get_mut(transfer_id) else {
            return;
        };
        info!(
            transfer_id,
            peer = from_peer,
            file = %offer.filename,
            size = offer.size,
            resumed,
            "offer received"
        );
        self.ctx.emit(TransferEvent::OfferReceived(t.info.clone()));
        if resumed {
            self.ctx.emit(TransferEvent::Resumed {
                info: t.info.clone(),
                from: offer.resume_from.unwrap_or(0),
            });
        }

        let sender = self.ctx.trust.get(from_peer);
        let decision = trust::evaluate_offer(
            &offer,
            self.ctx.config.secret.as_deref(),
            sender.as_ref(),
            self.ctx.config.auto_accept_trusted,
            now,
        );
        if decision.accepts() {
            info!(transfer_id, ?decision, "auto-accepting offer");
            self.ctx.accept(t, offer.resume_from);
        } else {
            debug!(transfer_id, "offer awaiting manual decision");
        }
    }

    fn on_accept(&mut self, from_peer: &str, transfer_id: &str, accept: AcceptPayload) {
        let Some(t) = lookup(&mut self.transfers, from_peer, transfer_id, Some(Direction::Send))
        else {
            return;
        };
        if matches!(
            t.info.state,
            TransferState::Completed | TransferState::Rejected
        ) {
            debug!(transfer_id, state = %t.info.state, "ignoring accept");
            return;
        }
        if !accept.ready {
            debug!(transfer_id, "peer accepted but is not ready");
            return;
        }
        let start = accept.resume_from.unwrap_or(0);
        let resumed = t.info.state != TransferState::Pending || start > 0;
        t.retries = 0;
        t.info.error = None;
        t.info.set_state(TransferState::Transferring);
        info!(transfer_id, peer = from_peer, start, "offer accepted, sending chunks");
        self.ctx.emit(TransferEvent::Accepted(t.info.clone()));
        self.ctx.emit(TransferEvent::Started(t.info.clone()));
        if resumed {
            self.ctx.emit(TransferEvent::Resumed {
                info: t.info.clone(),
                from: start,
            });
        }
        self.ctx.send_chunk_or_finish(t, start);
    }

    fn on_reject(&mut self, from_peer: &str, transfer_id: &str, reject: RejectPayload) {
        let Some(t) = lookup(&mut self.transfers, from_peer, transfer_id, Some(Direction::Send))
        else {
            return;
        };
        if t.info.state.is_terminal() {
            debug!(transfer_id, state = %t.info.state, "ignoring reject");
            return;
        }
        t.in_flight = None;
        t.info.resumable = false;
        t.info.error = Some(reject.reason.clone());
        t.info.set_state(TransferState::Rejected);
        info!(transfer_id, peer = from_peer, reason = %reject.reason, "offer rejected by peer");
        self.ctx.emit(TransferEvent::Rejected {
            info: t.info.clone(),
            reason: reject.reason,
        });
    }

    fn on_chunk(&mut self, from_peer: &str, transfer_id: &str, chunk: ChunkPayload) {
        let Some(t) = lookup(&mut self.transfers, from_peer, transfer_id, Some(Direction::Receive))
        else {
            return;
        };
        if !matches!(
            t.info.state,
            TransferState::Accepted | TransferState::Transferring
        ) {
            debug!(transfer_id, state = %t.info.state, index = chunk.index, "ignoring chunk");
            return;
        }
        let Some(assembler) = t.assembler.as_mut() else {
            debug!(transfer_id, "chunk without an active assembler");
            return;
        };
        if t.info.state == TransferState::Accepted {
            t.info.set_state(TransferState::Transferring);
            self.ctx.emit(TransferEvent::Started(t.info.clone()));
        }

        let index = chunk.index;
        let rejection = match assembler.expected_len(index) {
            None => "Chunk index out of range",
            Some(len) if len != chunk.data.len() => "Chunk length mismatch",
            Some(_) => "Hash mismatch",
        };
        if assembler.add_chunk(index, chunk.data, &chunk.hash) {
            let progress = assembler.progress();
            t.info.received_chunks.insert(index);
            t.info.updated_at = now_millis();
            debug!(transfer_id, index, progress, "chunk stored");
            let ack = Payload::Ack(AckPayload {
                index: i64::from(index),
                received: true,
                error: None,
            });
            self.ctx.send_or_warn(from_peer, transfer_id, ack);
            self.ctx.emit(TransferEvent::ChunkReceived {
                transfer_id: transfer_id.to_string(),
                index,
                progress,
            });
        } else {
            warn!(transfer_id, index, error = rejection, "chunk rejected, requesting resend");
            let nack = Payload::Ack(AckPayload {
                index: i64::from(index),
                received: false,
                error: Some(rejection.to_string()),
            });
            self.ctx.send_or_warn(from_peer, transfer_id, nack);
        }
    }

    fn on_ack(&mut self, from_peer: &str, transfer_id: &str, ack: AckPayload) {
        let Some(t) = lookup(&mut self.transfers, from_peer, transfer_id, Some(Direction::Send))
        else {
            return;
        };
        if ack.is_final() {
            match t.info.state {
                TransferState::Completing if ack.received => self.ctx.complete(t),
                TransferState::Completing => {
                    let error = ack
                        .error
                        .unwrap_or_else(|| "receiver could not assemble the file".to_string());
                    self.ctx.fail(t, error);
                }
                state => debug!(transfer_id, %state, "ignoring final ack"),
            }
            return;
        }
        let index = match ack.chunk_index() {
            Some(i) if t.info.state == TransferState::Transferring && t.in_flight == Some(i) => i,
            _ => {
                debug!(transfer_id, index = ack.index, state = %t.info.state, "ignoring stray ack");
                return;
            }
        };
        self.ctx.emit(TransferEvent::AckReceived {
            transfer_id: transfer_id.to_string(),
            index,
            received: ack.received,
        });

        if !ack.received {
            t.retries += 1;
            if t.retries > self.ctx.config.max_chunk_retries {
                let error = format!("chunk {index} rejected {} times", t.retries);
                let payload = Payload::Error(ErrorPayload {
                    code: error_code::TOO_MANY_RETRIES.to_string(),
                    message: error.clone(),
                    recoverable: true,
                });
                self.ctx.send_or_warn(from_peer, transfer_id, payload);
                self.ctx.fail(t, error);
                return;
            }
            warn!(
                transfer_id,
                index,
                attempt = t.retries,
                error = ack.error.as_deref().unwrap_or(""),
                "peer rejected chunk, resending"
            );
            self.ctx.send_chunk_or_finish(t, index);
            return;
        }

        t.retries = 0;
        t.info.received_chunks.insert(index);
        t.info.updated_at = now_millis();
        self.ctx.send_chunk_or_finish(t, index + 1);
    }

    fn on_complete(&mut self, from_peer: &str, transfer_id: &str, complete: CompletePayload) {
        let Some(t) = lookup(&mut self.transfers, from_peer, transfer_id, Some(Direction::Receive))
        else {
            return;
        };
        if !matches!(
            t.info.state,
            TransferState::Accepted | TransferState::Transferring
        ) {
            debug!(transfer_id, state = %t.info.state, "ignoring complete");
            return;
        }
        let Some(assembler) = t.assembler.as_ref() else {
            debug!(transfer_id, "complete without an active assembler");
            return;
        };
        if !complete.hash.eq_ignore_ascii_case(&t.info.hash) {
            warn!(
                transfer_id,
                offered = %t.info.hash,
                declared = %complete.hash,
                "complete declares a different file hash than the offer"
            );
        }
        if complete.total_chunks != t.info.total_chunks {
            warn!(
                transfer_id,
                offered = t.info.total_chunks,
                declared = complete.total_chunks,
                "complete declares a different chunk count than the offer"
            );
        }

        let store = &*self.ctx.store;
        let dest = destination_path(store, &self.ctx.config.download_dir, &t.info.filename);
        let outcome = assembler.assemble_to(store, &dest);
        let final_ack = match outcome {
            Ok(_) => {
                t.info.local_path = Some(dest);
                self.ctx.complete(t);
                AckPayload {
                    index: FINAL_ACK_INDEX,
                    received: true,
                    error: None,
                }
            }
            Err(e) => {
                // Verified chunks stay around for a resume unless the content itself is wrong.
                if matches!(e, AssembleError::HashMismatch { .. }) {
                    t.assembler = None;
                    t.info.resumable = false;
                }
                let error = e.to_string();
                self.ctx.fail(t, error.clone());
                AckPayload {
                    index: FINAL_ACK_INDEX,
                    received: false,
                    error: Some(error),
                }
            }
        };
        self.ctx
            .send_or_warn(from_peer, transfer_id, Payload::Ack(final_ack));
    }

    fn on_error(&mut self, from_peer: &str, transfer_id: &str, error: ErrorPayload) {
        let Some(t) = lookup(&mut self.transfers, from_peer, transfer_id, None) else {
            return;
        };
        if t.info.state == TransferState::Completed {
            debug!(transfer_id, code = %error.code, "ignoring error for completed transfer");
            return;
        }
        self.ctx
            .fail(t, format!("{}: {}", error.code, error.message));
    }
}

/// Transfer `transfer_id` if `from_peer` owns it, it runs in `direction` (when given) and the
/// host has not cancelled it.
fn lookup<'a>(
    transfers: &'a mut HashMap<String, Transfer>,
    from_peer: &str,
    transfer_id: &str,
    direction: Option<Direction>,
) -> Option<&'a mut Transfer> {
    let Some(t) = transfers.get_mut(transfer_id) else {
        debug!(transfer_id, peer = from_peer, "message for unknown transfer");
        return None;
    };
    if t.info.peer_id != from_peer {
        debug!(transfer_id, peer = from_peer, owner = %t.info.peer_id, "message from wrong peer");
        return None;
    }
    if direction.is_some_and(|d| d != t.info.direction) {
        debug!(transfer_id, "message for the other direction");
        return None;
    }
    if t.info.state == TransferState::Cancelled {
        debug!(transfer_id, "message for cancelled transfer");
        return None;
    }
    Some(t)
}

fn pending_incoming<'a>(
    transfers: &'a mut HashMap<String, Transfer>,
    transfer_id: &str,
    op: &'static str,
) -> Result<&'a mut Transfer, TransferError> {
    let t = transfers
        .get_mut(transfer_id)
        .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
    if t.info.direction != Direction::Receive || t.info.state != TransferState::Pending {
        return Err(TransferError::InvalidState {
            id: transfer_id.to_string(),
            state: t.info.state,
            op,
        });
    }
    Ok(t)
}

/// Check an offer before creating any state for it.
pub fn validate_offer(offer: &OfferPayload, max_file_size: u64) -> Result<(), OfferError> {
    if offer.size > max_file_size {
        return Err(OfferError::SizeLimitExceeded {
            size: offer.size,
            max: max_file_size,
        });
    }
    if offer.chunk_size < chunk::MIN_CHUNK_SIZE {
        return Err(OfferError::Invalid("chunk size below minimum"));
    }
    if chunk::total_chunks(offer.size, offer.chunk_size) != u64::from(offer.total_chunks) {
        return Err(OfferError::Invalid("chunk count does not match size"));
    }
    if offer.total_chunks > chunk::MAX_TOTAL_CHUNKS {
        return Err(OfferError::Invalid("too many chunks"));
    }
    Ok(())
}

/// Where a received `filename` lands: its last path component under `dir`, renamed
/// `name (n).ext` while the store already holds that path.
pub fn destination_path<S: FileStore + ?Sized>(store: &S, dir: &Path, filename: &str) -> PathBuf {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("download");
    let candidate = dir.join(base);
    if !store.exists(&candidate) {
        return candidate;
    }
    let base_path = Path::new(base);
    let stem = base_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base);
    let ext = base_path.extension().and_then(|e| e.to_str());
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !store.exists(p))
        .unwrap_or(candidate)
}

/// Why an incoming offer was refused. The message is sent back as the reject reason.
#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("File size {size} bytes exceeds maximum allowed size of {max} bytes")]
    SizeLimitExceeded { size: u64, max: u64 },
    #[error("Invalid offer: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
    #[error("cannot {op} transfer {id} in state {state}")]
    InvalidState {
        id: String,
        state: TransferState,
        op: &'static str,
    },
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
