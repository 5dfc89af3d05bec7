pub mod packer;
pub mod queue;

pub use packer::{pack, pack_with, packed_len, ChromaLayout, PackedBuffer};
pub use queue::{FrameQueue, QueueStats};
