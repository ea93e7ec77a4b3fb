//! Chunked archive wire format and the per-entry read/write pipeline.
//!
//! An archive is a flat chain of self-describing chunks: an info chunk, an
//! optional meta marker, entry chunks each followed by their data chunks,
//! and signature chunks covering the preceding byte range. See
//! [`chunk`] for the framing and [`entry`] for header payloads.

pub mod chunk;
pub mod entry;
pub mod read;
pub mod signature;
pub mod write;

pub use entry::{ArchiveEntryKind, EntryHeader, Fragment, MetaPayload};
pub use read::{ArchiveReader, EntryCursor, PeekedEntry};
pub use signature::{SignatureVerdict, verify_signatures};
pub use write::{ArchiveWriter, EntryWriteCursor};

use crate::{Error, Result};

/// Current wire format version.
pub const FORMAT_VERSION: u16 = 1;

/// The archive info carried by the leading chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// Wire format version.
    pub version: u16,
}

impl ArchiveInfo {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u16(self.version);
        w.into_inner()
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let version = r.u16()?;
        if version != FORMAT_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported format version {version}"
            )));
        }
        Ok(Self { version })
    }
}

/// Serializer for chunk payloads: big-endian integers, u16-length-prefixed
/// UTF-8 strings.
pub(crate) struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub(crate) fn put_string(&mut self, v: &str) {
        let bytes = v.as_bytes();
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.put_u16(bytes.len() as u16);
        self.put_bytes(bytes);
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Deserializer matching [`WireWriter`].
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn truncated() -> Error {
        Error::InvalidFormat("truncated chunk payload".into())
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(Self::truncated)?;
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("len 2")))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidFormat("invalid UTF-8 in chunk payload".into()))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
