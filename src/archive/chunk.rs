//! Chunk framing.
//!
//! Every chunk is a 4-byte ASCII id followed by a big-endian u64 payload
//! size and the payload bytes. Readers that do not understand a chunk id
//! can skip the payload by its size.

use crate::storage::StorageReader;
use crate::{Error, Result};

/// Archive info; the first chunk of every archive.
pub const ID_INFO: [u8; 4] = *b"BARC";
/// Meta marker entry.
pub const ID_META: [u8; 4] = *b"META";
/// Entry header.
pub const ID_ENTRY: [u8; 4] = *b"ENTR";
/// One frame of an entry's encoded data stream.
pub const ID_DATA: [u8; 4] = *b"DATA";
/// Signature over the preceding archive byte range.
pub const ID_SIGNATURE: [u8; 4] = *b"SIGN";

/// On-wire size of a chunk header.
pub const HEADER_LEN: usize = 12;

/// Largest accepted non-data payload; guards header parsing against
/// corrupt size fields.
const MAX_HEADER_PAYLOAD: u64 = 16 * 1024 * 1024;

/// A decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk id.
    pub id: [u8; 4],
    /// Payload size in bytes.
    pub size: u64,
}

impl ChunkHeader {
    /// Encodes the header into its wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.id);
        out[4..].copy_from_slice(&self.size.to_be_bytes());
        out
    }

    /// True for the known chunk ids.
    pub fn is_known(&self) -> bool {
        matches!(self.id, ID_INFO | ID_META | ID_ENTRY | ID_DATA | ID_SIGNATURE)
    }
}

/// Reads exactly `buf.len()` bytes from storage.
pub(crate) fn read_exact(reader: &mut dyn StorageReader, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::InvalidFormat("truncated archive".into()));
        }
        filled += n;
    }
    Ok(())
}

/// Reads the next chunk header, or `None` at a clean end of the archive.
pub(crate) fn read_header(reader: &mut dyn StorageReader) -> Result<Option<ChunkHeader>> {
    let mut raw = [0u8; HEADER_LEN];
    let n = reader.read(&mut raw[..1])?;
    if n == 0 {
        return Ok(None);
    }
    read_exact(reader, &mut raw[1..])?;
    let mut id = [0u8; 4];
    id.copy_from_slice(&raw[..4]);
    let size = u64::from_be_bytes(raw[4..].try_into().expect("len 8"));
    let header = ChunkHeader { id, size };
    if !header.is_known() {
        return Err(Error::InvalidFormat(format!(
            "unknown chunk id {:?}",
            String::from_utf8_lossy(&id)
        )));
    }
    if header.id != ID_DATA && size > MAX_HEADER_PAYLOAD {
        return Err(Error::InvalidFormat(format!(
            "implausible chunk size {size}"
        )));
    }
    Ok(Some(header))
}

/// Reads a whole chunk payload.
pub(crate) fn read_payload(reader: &mut dyn StorageReader, header: &ChunkHeader) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; header.size as usize];
    read_exact(reader, &mut payload)?;
    Ok(payload)
}

/// Encodes a complete chunk (header plus payload).
pub(crate) fn encode_chunk(id: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let header = ChunkHeader {
        id,
        size: payload.len() as u64,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}
