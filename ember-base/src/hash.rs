//! Hash algorithms used to derive [`Link`] digests.

use std::{collections::BTreeMap, fmt, sync::Arc};

use sha2::Digest;

use crate::link::{Codec, HashCode, Link, DIGEST_LEN};

/// A hash function producing 32 byte digests.
pub trait Hasher: Send + Sync + fmt::Debug {
    /// Multihash code of this hasher.
    fn code(&self) -> HashCode;

    /// Digest of `data`.
    fn digest(&self, data: &[u8]) -> [u8; DIGEST_LEN];

    /// Link for `data` under `codec`.
    fn link(&self, codec: Codec, data: &[u8]) -> Link {
        Link::new(codec, self.code(), self.digest(data))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha2_256;

impl Hasher for Sha2_256 {
    fn code(&self) -> HashCode {
        HashCode::SHA2_256
    }

    fn digest(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        sha2::Sha256::digest(data).into()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3;

impl Hasher for Blake3 {
    fn code(&self) -> HashCode {
        HashCode::BLAKE3
    }

    fn digest(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        *blake3::hash(data).as_bytes()
    }
}

/// Hashers known by code, with a default used for new blocks.
#[derive(Debug, Clone)]
pub struct HasherRegistry {
    default: HashCode,
    hashers: BTreeMap<HashCode, Arc<dyn Hasher>>,
}

impl Default for HasherRegistry {
    fn default() -> Self {
        let mut registry = Self {
            default: HashCode::SHA2_256,
            hashers: BTreeMap::new(),
        };
        registry.register(Arc::new(Sha2_256));
        registry.register(Arc::new(Blake3));
        registry
    }
}

impl HasherRegistry {
    /// Adds or replaces a hasher.
    pub fn register(&mut self, hasher: Arc<dyn Hasher>) {
        self.hashers.insert(hasher.code(), hasher);
    }

    /// Selects the hasher used by [`Self::link`]. Returns false if it is not registered.
    pub fn set_default(&mut self, code: HashCode) -> bool {
        if self.hashers.contains_key(&code) {
            self.default = code;
            true
        } else {
            false
        }
    }

    pub fn get(&self, code: HashCode) -> Option<&Arc<dyn Hasher>> {
        self.hashers.get(&code)
    }

    /// Link for `data` using the default hasher.
    pub fn link(&self, codec: Codec, data: &[u8]) -> Link {
        match self.hashers.get(&self.default) {
            Some(hasher) => hasher.link(codec, data),
            None => Sha2_256.link(codec, data),
        }
    }

    /// Checks that `link` addresses `data`. Unknown hashers never verify.
    pub fn verify(&self, link: &Link, data: &[u8]) -> bool {
        self.hashers
            .get(&link.hash_code())
            .is_some_and(|hasher| &hasher.digest(data) == link.digest())
    }
}

impl Link {
    /// Sha2-256 link of `data`, the default for all stored blocks.
    pub fn sha256(codec: Codec, data: &[u8]) -> Self {
        Sha2_256.link(codec, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_digest() {
        let link = Link::sha256(Codec::RAW, b"");
        assert_eq!(
            crate::base32::fmt(link.digest()),
            crate::base32::fmt(
                [
                    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99,
                    0x6f, 0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95,
                    0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55
                ]
            )
        );
    }

    #[test]
    fn registry_verifies_by_code() {
        let mut registry = HasherRegistry::default();
        let sha = registry.link(Codec::RAW, b"hello");
        assert!(registry.verify(&sha, b"hello"));
        assert!(!registry.verify(&sha, b"world"));

        assert!(registry.set_default(HashCode::BLAKE3));
        let b3 = registry.link(Codec::RAW, b"hello");
        assert_eq!(b3.hash_code(), HashCode::BLAKE3);
        assert!(registry.verify(&b3, b"hello"));
        assert!(!registry.set_default(HashCode(0x99)));
    }
}
