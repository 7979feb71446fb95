use ember_base::{codec, Link};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A car header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CarHeader {
    V1(CarHeaderV1),
}

impl CarHeader {
    pub fn new_v1(roots: Vec<Link>) -> Self {
        Self::V1(roots.into())
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, Error> {
        let header: CarHeaderV1 =
            codec::decode(buffer).map_err(|e| Error::Parsing(e.to_string()))?;

        if header.roots.is_empty() {
            return Err(Error::Parsing("empty CAR file".to_owned()));
        }

        if header.version != 1 {
            return Err(Error::InvalidFile(
                "Only CAR file version 1 is supported".to_string(),
            ));
        }

        Ok(CarHeader::V1(header))
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        match self {
            CarHeader::V1(ref header) => Ok(codec::encode(header)?),
        }
    }

    pub fn roots(&self) -> &[Link] {
        match self {
            CarHeader::V1(header) => &header.roots,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            CarHeader::V1(_) => 1,
        }
    }
}

/// CAR file header version 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeaderV1 {
    pub roots: Vec<Link>,
    pub version: u64,
}

impl CarHeaderV1 {
    /// Creates a new CAR file header
    pub fn new(roots: Vec<Link>, version: u64) -> Self {
        Self { roots, version }
    }
}

impl From<Vec<Link>> for CarHeaderV1 {
    fn from(roots: Vec<Link>) -> Self {
        Self { roots, version: 1 }
    }
}

#[cfg(test)]
mod tests {
    use ember_base::Codec;

    use super::*;

    #[test]
    fn symmetric_header_v1() {
        let link = Link::sha256(Codec::DAG_CBOR, b"test");
        let header = CarHeader::new_v1(vec![link]);

        let bytes = header.encode().unwrap();
        assert_eq!(CarHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_empty_roots_and_other_versions() {
        let bytes = codec::encode(&CarHeaderV1::new(vec![], 1)).unwrap();
        assert!(matches!(CarHeader::decode(&bytes), Err(Error::Parsing(_))));

        let link = Link::sha256(Codec::DAG_CBOR, b"test");
        let bytes = codec::encode(&CarHeaderV1::new(vec![link], 2)).unwrap();
        assert!(matches!(
            CarHeader::decode(&bytes),
            Err(Error::InvalidFile(_))
        ));
    }
}
