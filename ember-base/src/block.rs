//! Blocks and block sources.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec::{self, CodecError},
    link::{Codec, Link},
};

/// An immutable, content addressed chunk of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub link: Link,
    pub data: Bytes,
}

impl Block {
    pub fn new(link: Link, data: impl Into<Bytes>) -> Self {
        Self {
            link,
            data: data.into(),
        }
    }

    /// Encodes `value` as DAG-CBOR and addresses it with sha2-256.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        let data = codec::encode(value)?;
        let link = Link::sha256(Codec::DAG_CBOR, &data);
        Ok(Self::new(link, data))
    }

    /// A raw block over opaque bytes.
    pub fn from_raw(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::new(Link::sha256(Codec::RAW, &data), data)
    }

    /// Decodes the payload as DAG-CBOR.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::decode(&self.data)
    }
}

/// A block that was referenced but could not be found in any source.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("missing block {0}")]
pub struct MissingBlock(pub Link);

/// Anything that can resolve a [`Link`] to a [`Block`].
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Returns the block, or `None` when this source does not have it.
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>>;

    /// Like [`Self::get`] but treats absence as a [`MissingBlock`] error.
    async fn get_required(&self, link: &Link) -> anyhow::Result<Block> {
        match self.get(link).await? {
            Some(block) => Ok(block),
            None => Err(MissingBlock(*link).into()),
        }
    }
}

#[async_trait]
impl<T: BlockFetcher + ?Sized> BlockFetcher for Arc<T> {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        self.as_ref().get(link).await
    }
}

#[async_trait]
impl<T: BlockFetcher + ?Sized> BlockFetcher for &T {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        (**self).get(link).await
    }
}

/// Decodes the DAG-CBOR block at `link`.
pub async fn fetch_decoded<T: DeserializeOwned>(
    fetcher: &(impl BlockFetcher + ?Sized),
    link: &Link,
) -> anyhow::Result<T> {
    let block = fetcher.get_required(link).await?;
    Ok(block.decode()?)
}

#[derive(Debug, Default)]
struct Blocks {
    data: HashMap<Link, Bytes>,
    order: Vec<Link>,
}

/// An in memory block map that remembers insertion order.
///
/// Clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlockstore {
    inner: Arc<RwLock<Blocks>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a block. Putting an existing link keeps its original position.
    pub fn put(&self, link: Link, data: impl Into<Bytes>) {
        let mut inner = self.inner.write();
        if inner.data.insert(link, data.into()).is_none() {
            inner.order.push(link);
        }
    }

    pub fn put_block(&self, block: Block) {
        self.put(block.link, block.data)
    }

    pub fn get_sync(&self, link: &Link) -> Option<Block> {
        self.inner
            .read()
            .data
            .get(link)
            .map(|data| Block::new(*link, data.clone()))
    }

    pub fn contains(&self, link: &Link) -> bool {
        self.inner.read().data.contains_key(link)
    }

    /// All blocks in insertion order.
    pub fn entries(&self) -> Vec<Block> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|link| {
                inner
                    .data
                    .get(link)
                    .map(|data| Block::new(*link, data.clone()))
            })
            .collect()
    }

    pub fn links(&self) -> Vec<Link> {
        self.inner.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.inner.read().data.values().map(Bytes::len).sum()
    }
}

#[async_trait]
impl BlockFetcher for MemoryBlockstore {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        Ok(self.get_sync(link))
    }
}

/// Reads from `local` first and falls back to `parent`.
#[derive(Debug, Clone, Copy)]
pub struct Overlay<'a, F: ?Sized> {
    pub local: &'a MemoryBlockstore,
    pub parent: &'a F,
}

impl<'a, F: BlockFetcher + ?Sized> Overlay<'a, F> {
    pub fn new(local: &'a MemoryBlockstore, parent: &'a F) -> Self {
        Self { local, parent }
    }
}

#[async_trait]
impl<F: BlockFetcher + ?Sized> BlockFetcher for Overlay<'_, F> {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        if let Some(block) = self.local.get_sync(link) {
            return Ok(Some(block));
        }
        self.parent.get(link).await
    }
}
