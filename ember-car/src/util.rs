use ember_base::Link;
use integer_encoding::{VarInt, VarIntAsyncReader};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::Error;

/// Maximum size that is used for single node.
pub const MAX_ALLOC: usize = 4 * 1024 * 1024;

/// Number of bytes a block section takes in a CAR file, including its length prefix.
pub fn section_len(link: &Link, data_len: usize) -> usize {
    let len = link.encoded_len() + data_len;
    len.required_space() + len
}

pub(crate) async fn ld_read<R>(mut reader: R, buf: &mut Vec<u8>) -> Result<Option<&[u8]>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let length: usize = match VarIntAsyncReader::read_varint_async(&mut reader).await {
        Ok(len) => len,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(Error::Parsing(e.to_string()));
        }
    };

    if length > MAX_ALLOC {
        return Err(Error::LdReadTooLarge(length));
    }
    if length > buf.len() {
        buf.resize(length, 0);
    }

    reader
        .read_exact(&mut buf[..length])
        .await
        .map_err(|e| Error::Parsing(e.to_string()))?;

    Ok(Some(&buf[..length]))
}

pub(crate) async fn read_node<R>(
    buf_reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<(Link, Vec<u8>)>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    if let Some(buf) = ld_read(buf_reader, buf).await? {
        let (link, pos) = Link::read_prefix(buf)?;
        return Ok(Some((link, buf[pos..].to_vec())));
    }
    Ok(None)
}
