//! Lowercase multibase base32 text, as used for [`Link`](crate::Link) strings.

pub use data_encoding::{DecodeError, DecodeKind};

/// Multibase prefix of lowercase, unpadded base32.
pub const MULTIBASE_PREFIX: char = 'b';

/// Convert to a base32 string
pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
    let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
    text.make_ascii_lowercase();
    text
}

/// Convert to a multibase string, i.e. base32 with the `b` prefix.
pub fn fmt_multibase(bytes: impl AsRef<[u8]>) -> String {
    let mut out = String::with_capacity(1 + bytes.as_ref().len() * 8 / 5 + 1);
    out.push(MULTIBASE_PREFIX);
    let start = out.len();
    data_encoding::BASE32_NOPAD.encode_append(bytes.as_ref(), &mut out);
    out[start..].make_ascii_lowercase();
    out
}

/// Convert to a base32 string limited to the first 10 bytes
pub fn fmt_short(bytes: impl AsRef<[u8]>) -> String {
    let len = bytes.as_ref().len().min(10);
    let mut text = data_encoding::BASE32_NOPAD.encode(&bytes.as_ref()[..len]);
    text.make_ascii_lowercase();
    text
}

/// Decode form a base32 string to a vector of bytes
pub fn parse_vec(input: &str) -> Result<Vec<u8>, DecodeError> {
    data_encoding::BASE32_NOPAD.decode(input.to_ascii_uppercase().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multibase_roundtrip() {
        let text = fmt_multibase(b"ember");
        assert!(text.starts_with(MULTIBASE_PREFIX));
        assert_eq!(parse_vec(&text[1..]).unwrap(), b"ember");
        assert_eq!(text[1..], fmt(b"ember"));
    }

    #[test]
    fn short_is_prefix() {
        let bytes = [7u8; 32];
        assert!(fmt(bytes).starts_with(&fmt_short(bytes)));
    }
}
