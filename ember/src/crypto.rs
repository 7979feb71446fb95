//! At-rest encryption of blocks and CAR files.
//!
//! Every block is sealed with AES-256-GCM. The plaintext is the block link (length
//! prefixed) followed by the block bytes, and the nonce is derived from the plaintext hash,
//! so equal blocks encrypt to equal ciphertexts and deduplicate across commits.
//!
//! An encrypted CAR holds the sealed blocks, the nodes of a prolly tree listing their links,
//! and a root block `[sealed root, link set root]`.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bytes::Bytes;
use ember_base::{codec, Block, Codec, HasherRegistry, Link, MemoryBlockstore};
use ember_prolly::{HashChunker, ProllyTree};
use integer_encoding::VarInt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    car::CarBlocks,
    error::{Error, Result},
};

const IV_LEN: usize = 12;

/// A 256 bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_key, &mut bytes)
            .map_err(|e| Error::Configuration(format!("invalid encryption key: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0.into())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sealed {
    bytes: Bytes,
    iv: Bytes,
}

fn derive_iv(plaintext: &[u8]) -> [u8; IV_LEN] {
    let digest = Sha256::digest(plaintext);
    let mut iv = [0u8; IV_LEN];
    for (i, byte) in digest.iter().enumerate() {
        iv[i % IV_LEN] ^= byte;
    }
    iv
}

/// Seals one block.
pub fn encrypt_block(key: &EncryptionKey, block: &Block) -> Result<Block> {
    let link_bytes = block.link.to_bytes();
    let mut plaintext = link_bytes.len().encode_var_vec();
    plaintext.extend_from_slice(&link_bytes);
    plaintext.extend_from_slice(&block.data);

    let iv = derive_iv(&plaintext);
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|_| Error::Consistency("encryption failed".to_string()))?;
    let data = codec::encode(&Sealed {
        bytes: ciphertext.into(),
        iv: Bytes::copy_from_slice(&iv),
    })?;
    Ok(Block::new(Link::sha256(Codec::ENCRYPTED, &data), data))
}

/// Opens one sealed block and checks it against the nonce and its embedded link.
pub fn decrypt_block(key: &EncryptionKey, block: &Block) -> Result<Block> {
    let sealed: Sealed = block.decode()?;
    if sealed.iv.len() != IV_LEN {
        return Err(Error::Consistency(format!(
            "block {} has an iv of {} bytes",
            block.link,
            sealed.iv.len()
        )));
    }
    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(&sealed.iv), &sealed.bytes[..])
        .map_err(|_| Error::Decrypt)?;
    if derive_iv(&plaintext)[..] != sealed.iv[..] {
        return Err(Error::Consistency(format!(
            "iv of block {} does not match its content",
            block.link
        )));
    }
    let (link_len, read) = usize::decode_var(&plaintext)
        .ok_or_else(|| Error::Consistency("truncated encrypted block".to_string()))?;
    let link_end = read + link_len;
    let link_bytes = plaintext
        .get(read..link_end)
        .ok_or_else(|| Error::Consistency("truncated encrypted block".to_string()))?;
    let link = Link::from_bytes(link_bytes)?;
    let data = Bytes::copy_from_slice(&plaintext[link_end..]);
    if !HasherRegistry::default().verify(&link, &data) {
        return Err(Error::Consistency(format!(
            "decrypted block does not match {link}"
        )));
    }
    Ok(Block::new(link, data))
}

/// Seals the blocks of one CAR file and returns the new root and the blocks to write.
pub fn encrypt_car(
    key: &EncryptionKey,
    root: Link,
    blocks: &[Block],
) -> Result<(Link, Vec<Block>)> {
    let mut out = Vec::with_capacity(blocks.len() + 2);
    let mut sealed_root = None;
    for block in blocks {
        let sealed = encrypt_block(key, block)?;
        if block.link == root {
            sealed_root = Some(sealed.link);
        }
        out.push(sealed);
    }
    let sealed_root = sealed_root
        .ok_or_else(|| Error::Consistency(format!("root {root} is not part of the car")))?;

    let set = ProllyTree::<Link, (), HashChunker>::create(
        out.iter().map(|b| (b.link, ())),
        HashChunker::default(),
    )?;
    out.extend(set.blocks);
    let root_block = Block::encode(&(sealed_root, set.root))?;
    let root = root_block.link;
    out.push(root_block);
    Ok((root, out))
}

/// Opens an encrypted CAR. The result is rooted at the plaintext root.
pub async fn decrypt_car(key: &EncryptionKey, car: &CarBlocks) -> Result<CarBlocks> {
    let root_block = car
        .blocks
        .get_sync(&car.root()?)
        .ok_or(Error::MalformedHeader)?;
    let (sealed_root, set_root): (Link, Link) = root_block.decode()?;
    let set = ProllyTree::<Link, (), HashChunker>::load(set_root, HashChunker::default());
    let sealed_links = set.entries(car).await?;

    let blocks = MemoryBlockstore::new();
    for (link, ()) in sealed_links {
        if link == sealed_root {
            continue;
        }
        let sealed = car.blocks.get_sync(&link).ok_or(Error::MissingBlock(link))?;
        blocks.put_block(decrypt_block(key, &sealed)?);
    }
    let sealed = car
        .blocks
        .get_sync(&sealed_root)
        .ok_or(Error::MissingBlock(sealed_root))?;
    let root = decrypt_block(key, &sealed)?;
    let root_link = root.link;
    blocks.put_block(root);
    Ok(CarBlocks {
        roots: vec![root_link],
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::{decode_car, encode_car};

    #[test]
    fn blocks_roundtrip_deterministically() -> anyhow::Result<()> {
        let key = EncryptionKey::generate();
        let block = Block::encode(&serde_json::json!({"hello": "world"}))?;
        let a = encrypt_block(&key, &block)?;
        let b = encrypt_block(&key, &block)?;
        assert_eq!(a, b);
        assert_eq!(a.link.codec(), Codec::ENCRYPTED);
        assert_eq!(decrypt_block(&key, &a)?, block);

        let other = EncryptionKey::generate();
        assert!(matches!(decrypt_block(&other, &a), Err(Error::Decrypt)));
        Ok(())
    }

    #[test]
    fn key_hex_roundtrip() -> anyhow::Result<()> {
        let key = EncryptionKey::generate();
        assert_eq!(EncryptionKey::from_hex(&key.to_hex())?, key);
        assert!(matches!(
            EncryptionKey::from_hex("abc"),
            Err(Error::Configuration(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn car_roundtrip() -> anyhow::Result<()> {
        let key = EncryptionKey::generate();
        let blocks: Vec<Block> = (0..50u32)
            .map(|i| Block::encode(&format!("block {i}")))
            .collect::<std::result::Result<_, _>>()?;
        let root = blocks[0].link;
        let (sealed_root, sealed) = encrypt_car(&key, root, &blocks)?;
        let car = encode_car(vec![sealed_root], &sealed).await?;

        let parsed = decode_car(&car.link, &car.bytes).await?;
        assert!(parsed.is_encrypted());
        assert!(parsed.blocks.get_sync(&root).is_none());

        let opened = decrypt_car(&key, &parsed).await?;
        assert_eq!(opened.root()?, root);
        assert_eq!(opened.blocks.len(), blocks.len());
        for block in &blocks {
            assert_eq!(opened.blocks.get_sync(&block.link).as_ref(), Some(block));
        }
        Ok(())
    }
}
