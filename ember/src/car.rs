//! Packing blocks into CAR files and reading them back.

use async_trait::async_trait;
use bytes::Bytes;
use ember_base::{Block, BlockFetcher, Codec, Link, MemoryBlockstore};
use ember_car::{section_len, CarHeader, CarReader, CarWriter};
use futures::TryStreamExt;

use crate::error::{Error, Result};

/// The decoded content of one CAR file.
#[derive(Debug, Clone)]
pub struct CarBlocks {
    pub roots: Vec<Link>,
    pub blocks: MemoryBlockstore,
}

impl CarBlocks {
    pub fn root(&self) -> Result<Link> {
        self.roots.first().copied().ok_or(Error::MalformedHeader)
    }

    /// Whether the CAR carries encrypted blocks.
    pub fn is_encrypted(&self) -> bool {
        self.blocks
            .links()
            .iter()
            .any(|link| link.codec() == Codec::ENCRYPTED)
    }
}

#[async_trait]
impl BlockFetcher for CarBlocks {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        Ok(self.blocks.get_sync(link))
    }
}

/// A serialized CAR file and its content address.
#[derive(Debug, Clone)]
pub struct CarFile {
    pub link: Link,
    pub bytes: Bytes,
}

/// Writes `blocks` as a CARv1 file with the given roots.
pub async fn encode_car(roots: Vec<Link>, blocks: &[Block]) -> Result<CarFile> {
    let mut buffer = Vec::new();
    let mut writer = CarWriter::new(CarHeader::new_v1(roots), &mut buffer);
    for block in blocks {
        writer.write(block.link, &block.data).await?;
    }
    writer.finish().await?;
    let link = Link::sha256(Codec::CAR, &buffer);
    Ok(CarFile {
        link,
        bytes: buffer.into(),
    })
}

/// Parses a CAR file, checking it against the link it was stored under.
pub async fn decode_car(link: &Link, bytes: &[u8]) -> Result<CarBlocks> {
    if Link::sha256(Codec::CAR, bytes).digest() != link.digest() {
        return Err(Error::Consistency(format!("car {link} does not match its content")));
    }
    let reader = CarReader::new(bytes).await?;
    let roots = reader.header().roots().to_vec();
    let blocks = MemoryBlockstore::new();
    let entries: Vec<(Link, Vec<u8>)> = reader.stream().try_collect().await?;
    for (link, data) in entries {
        blocks.put(link, data);
    }
    Ok(CarBlocks { roots, blocks })
}

/// Splits a commit into files of at most `threshold` bytes of block sections.
///
/// The header block leads the first file and is its root. Every later file is rooted at
/// its own first block. A single block larger than the threshold gets a file of its own.
pub fn split_commit(header: Block, blocks: Vec<Block>, threshold: usize) -> Vec<(Link, Vec<Block>)> {
    let mut files = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for block in std::iter::once(header).chain(blocks) {
        let len = section_len(&block.link, block.data.len());
        if !current.is_empty() && size + len > threshold {
            files.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(block);
    }
    if !current.is_empty() {
        files.push(current);
    }
    files
        .into_iter()
        .filter_map(|blocks| blocks.first().map(|b| b.link).map(|root| (root, blocks)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_threshold() {
        let header = Block::encode("header").unwrap();
        let blocks: Vec<_> = (0u8..10).map(|i| Block::from_raw(vec![i; 100])).collect();
        let one = split_commit(header.clone(), blocks.clone(), 1_000_000);
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].0, header.link);
        assert_eq!(one[0].1.len(), 11);

        // each raw section is 1 + 36 + 100 bytes
        let many = split_commit(header.clone(), blocks.clone(), 300);
        assert!(many.len() > 3);
        assert_eq!(many[0].0, header.link);
        for (root, blocks) in &many[1..] {
            assert_eq!(*root, blocks[0].link);
            let size: usize = blocks
                .iter()
                .map(|b| section_len(&b.link, b.data.len()))
                .sum();
            assert!(size <= 300);
        }
        let total: usize = many.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(total, 11);
    }

    #[tokio::test]
    async fn car_roundtrip_checks_link() -> anyhow::Result<()> {
        let blocks = vec![Block::encode("root")?, Block::from_raw(b"x".to_vec())];
        let car = encode_car(vec![blocks[0].link], &blocks).await?;
        let decoded = decode_car(&car.link, &car.bytes).await?;
        assert_eq!(decoded.root()?, blocks[0].link);
        assert_eq!(decoded.blocks.entries(), blocks);
        assert!(!decoded.is_encrypted());

        let wrong = Link::sha256(Codec::CAR, b"other");
        assert!(matches!(
            decode_car(&wrong, &car.bytes).await,
            Err(Error::Consistency(_))
        ));
        Ok(())
    }
}
