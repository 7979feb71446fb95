//! Content addresses for blocks.
//!
//! A [`Link`] names a block by the codec of its payload, the hash algorithm used and the
//! resulting digest. The binary form is self describing and compatible with CIDv1, so
//! stored links stay readable when new codecs or hashers are registered.

use std::{cmp::Ordering, fmt, str::FromStr};

use bytes::Bytes;
use ciborium::tag::Required;
use integer_encoding::VarInt;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::base32;

/// Length of every digest carried by a [`Link`].
pub const DIGEST_LEN: usize = 32;

/// CBOR tag used by DAG-CBOR for links.
pub const DAG_CBOR_LINK_TAG: u64 = 42;

const LINK_VERSION: u64 = 1;

/// Multicodec code describing how a block payload is encoded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("{_0:#x}")]
pub struct Codec(pub u64);

impl Codec {
    /// Opaque bytes.
    pub const RAW: Codec = Codec(0x55);
    /// Canonical CBOR with tag 42 links.
    pub const DAG_CBOR: Codec = Codec(0x71);
    /// A whole CAR file addressed as a single payload.
    pub const CAR: Codec = Codec(0x0202);
    /// A block encrypted by the at-rest codec.
    pub const ENCRYPTED: Codec = Codec(0x300539);
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Codec::RAW => f.write_str("Codec::RAW"),
            Codec::DAG_CBOR => f.write_str("Codec::DAG_CBOR"),
            Codec::CAR => f.write_str("Codec::CAR"),
            Codec::ENCRYPTED => f.write_str("Codec::ENCRYPTED"),
            Codec(other) => write!(f, "Codec({other:#x})"),
        }
    }
}

/// Multihash code naming the hash algorithm of a [`Link`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("{_0:#x}")]
pub struct HashCode(pub u64);

impl HashCode {
    pub const SHA2_256: HashCode = HashCode(0x12);
    pub const BLAKE3: HashCode = HashCode(0x1e);
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HashCode::SHA2_256 => f.write_str("HashCode::SHA2_256"),
            HashCode::BLAKE3 => f.write_str("HashCode::BLAKE3"),
            HashCode(other) => write!(f, "HashCode({other:#x})"),
        }
    }
}

/// Errors when parsing a [`Link`] from bytes or text.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("unsupported link version {0}")]
    UnsupportedVersion(u64),
    #[error("invalid varint in link")]
    Varint,
    #[error("unsupported digest length {0}")]
    DigestLength(u64),
    #[error("link is truncated")]
    Truncated,
    #[error("trailing bytes after link")]
    TrailingBytes,
    #[error("missing multibase prefix")]
    MissingPrefix,
    #[error("base32: {0}")]
    Base32(#[from] base32::DecodeError),
}

/// A content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    codec: Codec,
    hash: HashCode,
    digest: [u8; DIGEST_LEN],
}

impl Link {
    /// Creates a link from its parts.
    pub const fn new(codec: Codec, hash: HashCode, digest: [u8; DIGEST_LEN]) -> Self {
        Self {
            codec,
            hash,
            digest,
        }
    }

    /// The codec of the addressed payload.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// The hash algorithm that produced the digest.
    pub fn hash_code(&self) -> HashCode {
        self.hash
    }

    /// The raw digest bytes.
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Returns the same digest under a different codec.
    pub fn with_codec(&self, codec: Codec) -> Self {
        Self { codec, ..*self }
    }

    /// Encodes the link in its binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_bytes(&mut out);
        out
    }

    /// Appends the binary form of the link to `out`.
    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&LINK_VERSION.encode_var_vec());
        out.extend_from_slice(&self.codec.0.encode_var_vec());
        out.extend_from_slice(&self.hash.0.encode_var_vec());
        out.extend_from_slice(&(DIGEST_LEN as u64).encode_var_vec());
        out.extend_from_slice(&self.digest);
    }

    /// Length of the binary form in bytes.
    pub fn encoded_len(&self) -> usize {
        LINK_VERSION.required_space()
            + self.codec.0.required_space()
            + self.hash.0.required_space()
            + (DIGEST_LEN as u64).required_space()
            + DIGEST_LEN
    }

    /// Decodes a link that spans all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        let (link, len) = Self::read_prefix(bytes)?;
        if len != bytes.len() {
            return Err(LinkError::TrailingBytes);
        }
        Ok(link)
    }

    /// Decodes a link from the start of `bytes`, returning it with the number of bytes read.
    pub fn read_prefix(bytes: &[u8]) -> Result<(Self, usize), LinkError> {
        let mut pos = 0;
        let version = read_varint(bytes, &mut pos)?;
        if version != LINK_VERSION {
            return Err(LinkError::UnsupportedVersion(version));
        }
        let codec = Codec(read_varint(bytes, &mut pos)?);
        let hash = HashCode(read_varint(bytes, &mut pos)?);
        let len = read_varint(bytes, &mut pos)?;
        if len != DIGEST_LEN as u64 {
            return Err(LinkError::DigestLength(len));
        }
        let end = pos + DIGEST_LEN;
        let digest: [u8; DIGEST_LEN] = bytes
            .get(pos..end)
            .ok_or(LinkError::Truncated)?
            .try_into()
            .map_err(|_| LinkError::Truncated)?;
        Ok((Self::new(codec, hash, digest), end))
    }

    /// Short base32 form of the digest, for logging.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.digest)
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, LinkError> {
    let rest = bytes.get(*pos..).ok_or(LinkError::Truncated)?;
    let (value, read) = u64::decode_var(rest).ok_or(LinkError::Varint)?;
    *pos += read;
    Ok(value)
}

impl Ord for Link {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for Link {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32::fmt_multibase(self.to_bytes()))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({self})")
    }
}

impl FromStr for Link {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(base32::MULTIBASE_PREFIX)
            .ok_or(LinkError::MissingPrefix)?;
        let bytes = base32::parse_vec(rest)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Link {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // dag-cbor prefixes the binary link with the identity multibase byte
        let mut bytes = Vec::with_capacity(1 + self.encoded_len());
        bytes.push(0);
        self.write_bytes(&mut bytes);
        Required::<Bytes, DAG_CBOR_LINK_TAG>(Bytes::from(bytes)).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Link {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Required(bytes) = Required::<Bytes, DAG_CBOR_LINK_TAG>::deserialize(deserializer)?;
        match bytes.split_first() {
            Some((0, rest)) => Link::from_bytes(rest).map_err(de::Error::custom),
            _ => Err(de::Error::custom("link is missing the identity prefix")),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn link(seed: u8) -> Link {
        Link::new(Codec::DAG_CBOR, HashCode::SHA2_256, [seed; DIGEST_LEN])
    }

    #[test]
    fn binary_form_is_cid_v1() {
        let bytes = link(1).to_bytes();
        assert_eq!(&bytes[..4], &[0x01, 0x71, 0x12, 0x20]);
        assert_eq!(bytes.len(), link(1).encoded_len());
    }

    #[test]
    fn text_form_uses_multibase() {
        let text = link(3).to_string();
        assert!(text.starts_with("bafyrei"), "{text}");
        assert_eq!(text.parse::<Link>().unwrap(), link(3));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            "afyrei".parse::<Link>(),
            Err(LinkError::MissingPrefix)
        ));
        let mut bytes = link(2).to_bytes();
        bytes.push(0);
        assert!(matches!(
            Link::from_bytes(&bytes),
            Err(LinkError::TrailingBytes)
        ));
        bytes.truncate(10);
        assert!(matches!(Link::from_bytes(&bytes), Err(LinkError::Truncated)));
    }

    #[test]
    fn large_codec_varint() {
        let link = Link::new(Codec::ENCRYPTED, HashCode::SHA2_256, [9; DIGEST_LEN]);
        let bytes = link.to_bytes();
        assert_eq!(Link::read_prefix(&bytes).unwrap(), (link, bytes.len()));
    }

    proptest! {
        #[test]
        fn bytes_roundtrip(codec in 0u64..0x400000, hash in 0u64..0x100, digest in any::<[u8; 32]>()) {
            let link = Link::new(Codec(codec), HashCode(hash), digest);
            prop_assert_eq!(Link::from_bytes(&link.to_bytes()).unwrap(), link);
            prop_assert_eq!(link.to_string().parse::<Link>().unwrap(), link);
        }
    }
}
