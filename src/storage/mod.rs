pub mod codec;
pub mod store;

pub use self::codec::{encode_node, CodecLimits, NodeDecoder, RefResolver};
pub use self::store::{MemoryStore, OverflowStore};
