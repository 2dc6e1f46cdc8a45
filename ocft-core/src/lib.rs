//! OCFT: file transfer over text-only chat channels.
//! Host-driven: the host feeds received text in and supplies the transport, file store, trust
//! store and event sink; the engine never does I/O of its own.

pub mod chunk;
pub mod config;
pub mod engine;
pub mod events;
pub mod integrity;
pub mod protocol;
pub mod storage;
pub mod transport;
pub mod trust;
mod util;

pub use chunk::{Assembler, Chunk, FileInfo, DEFAULT_CHUNK_SIZE};
pub use config::NodeConfig;
pub use engine::{Direction, OfferError, TransferEngine, TransferError, TransferInfo, TransferState};
pub use events::{EventSink, NoopSink, TransferEvent};
pub use protocol::{Message, MessageType, Payload, PROTOCOL_VERSION, TRANSPORT_PREFIX};
pub use storage::{FileStore, LocalFileStore, MemoryFileStore};
pub use transport::{OutboundText, Transport, TransportError};
pub use trust::{generate_secret, AutoAccept, MemoryTrustStore, TrustStore, TrustedPeer};
pub use util::now_millis;
