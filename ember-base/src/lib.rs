//! Base types for ember: content links, hashers, the DAG-CBOR codec and blocks.

pub mod base32;
pub mod block;
pub mod codec;
pub mod hash;
pub mod link;

pub use self::{
    block::{fetch_decoded, Block, BlockFetcher, MemoryBlockstore, MissingBlock, Overlay},
    codec::CodecError,
    hash::{Hasher, HasherRegistry},
    link::{Codec, HashCode, Link, LinkError},
};
