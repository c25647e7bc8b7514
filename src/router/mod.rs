pub mod envelope;
pub mod error;
pub mod frame;
pub mod registry;
pub mod router;

pub use envelope::{ControlAction, Envelope, PeerRole};
pub use error::{RouterError, RouterResult};
pub use frame::{decode_chunk_frame, encode_chunk_frame, ChunkFrameHeader};
pub use registry::{OutboundFrame, PeerHandle, Registry};
pub use router::MessageRouter;
