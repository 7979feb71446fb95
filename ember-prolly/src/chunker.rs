use std::fmt;

use sha2::{Digest, Sha256};

/// Decides where nodes end.
pub trait Chunker: Clone + Send + Sync + fmt::Debug + 'static {
    /// Whether a node should be closed after the entry encoded as `entry`.
    fn is_boundary(&self, entry: &[u8]) -> bool;
}

/// Closes a node when the hash of an entry is divisible by `factor`.
///
/// On average nodes hold `factor` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashChunker {
    factor: u32,
}

impl HashChunker {
    pub const DEFAULT_FACTOR: u32 = 30;

    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor.max(1),
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }
}

impl Default for HashChunker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FACTOR)
    }
}

impl Chunker for HashChunker {
    fn is_boundary(&self, entry: &[u8]) -> bool {
        let digest = Sha256::digest(entry);
        let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        n % self.factor == 0
    }
}
