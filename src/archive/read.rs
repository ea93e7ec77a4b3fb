//! Read side of the entry pipeline.

use std::sync::Arc;

use super::chunk::{self, ChunkHeader, HEADER_LEN, ID_DATA, ID_ENTRY, ID_INFO, ID_META, ID_SIGNATURE};
use super::entry::{ArchiveEntryKind, EntryHeader, MetaPayload};
use super::signature::SignaturePayload;
use super::{ArchiveInfo, WireReader};
use crate::codec::DeltaSource;
use crate::codec::stack::{DecodeStack, StackParams};
use crate::crypto::Password;
use crate::storage::StorageReader;
use crate::{Error, Result};

/// Transfer buffer size of the data path.
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// The kind and archive offset of the next entry, as reported by
/// [`ArchiveReader::peek_next_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeekedEntry {
    /// The entry kind.
    pub kind: ArchiveEntryKind,
    /// Absolute offset of the entry's chunk header; workers seek here.
    pub offset: u64,
}

/// Chunk state between peek and consume.
enum Pending {
    /// Header read, payload still on the wire.
    Header(ChunkHeader),
    /// An entry chunk whose payload was pulled in to learn its kind.
    EntryPayload(Vec<u8>),
}

/// Sequential reader over one archive object.
///
/// The reader owns the storage cursor; bodies are consumed through
/// [`EntryCursor`]s which must be closed on every exit path so the cursor
/// lands on the next chunk boundary.
pub struct ArchiveReader {
    storage: Box<dyn StorageReader>,
    info: ArchiveInfo,
    position: u64,
    pending: Option<Pending>,
    pending_start: u64,
}

impl ArchiveReader {
    /// Opens an archive, reading and checking the leading info chunk.
    pub fn open(mut storage: Box<dyn StorageReader>) -> Result<Self> {
        storage.seek(0)?;
        let header = chunk::read_header(storage.as_mut())?
            .ok_or_else(|| Error::InvalidFormat("empty archive".into()))?;
        if header.id != ID_INFO {
            return Err(Error::InvalidFormat("missing archive info chunk".into()));
        }
        let payload = chunk::read_payload(storage.as_mut(), &header)?;
        let info = ArchiveInfo::decode(&payload)?;
        let position = (HEADER_LEN as u64) + header.size;
        Ok(Self {
            storage,
            info,
            position,
            pending: None,
            pending_start: 0,
        })
    }

    /// The archive info from the leading chunk.
    pub fn info(&self) -> ArchiveInfo {
        self.info
    }

    /// The absolute offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Repositions to an absolute offset (an entry boundary).
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.storage.seek(offset)?;
        self.position = offset;
        self.pending = None;
        Ok(())
    }

    fn peek_chunk(&mut self) -> Result<Option<&Pending>> {
        if self.pending.is_none() {
            self.pending_start = self.position;
            match chunk::read_header(self.storage.as_mut())? {
                Some(header) => {
                    self.position += HEADER_LEN as u64;
                    self.pending = Some(Pending::Header(header));
                }
                None => return Ok(None),
            }
        }
        Ok(self.pending.as_ref())
    }

    fn pending_id(&mut self) -> Result<Option<[u8; 4]>> {
        Ok(match self.peek_chunk()? {
            None => None,
            Some(Pending::Header(h)) => Some(h.id),
            Some(Pending::EntryPayload(_)) => Some(ID_ENTRY),
        })
    }

    /// Consumes the pending chunk's payload.
    fn consume_payload(&mut self) -> Result<Vec<u8>> {
        match self.pending.take() {
            Some(Pending::Header(header)) => {
                let payload = chunk::read_payload(self.storage.as_mut(), &header)?;
                self.position += header.size;
                Ok(payload)
            }
            Some(Pending::EntryPayload(payload)) => Ok(payload),
            None => Err(Error::InvalidFormat("no pending chunk".into())),
        }
    }

    fn begin_data_payload(&mut self) -> Result<u64> {
        match self.pending.take() {
            Some(Pending::Header(header)) if header.id == ID_DATA => Ok(header.size),
            _ => Err(Error::InvalidFormat("expected data chunk".into())),
        }
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.storage.read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(Error::InvalidFormat("truncated archive".into()));
        }
        self.position += n as u64;
        Ok(n)
    }

    fn skip_bytes(&mut self, n: u64) -> Result<()> {
        let target = self.position + n;
        self.storage.seek(target)?;
        self.position = target;
        Ok(())
    }

    /// Reports the kind and offset of the next entry, or `None` at the end
    /// of the archive. Does not consume the entry.
    pub fn peek_next_kind(&mut self) -> Result<Option<PeekedEntry>> {
        loop {
            let Some(id) = self.pending_id()? else {
                return Ok(None);
            };
            let offset = self.pending_start;
            let kind = match id {
                ID_ENTRY => {
                    // The kind tag is the first payload byte; pull the
                    // payload in and keep it for the header read.
                    if matches!(self.pending, Some(Pending::Header(_))) {
                        let payload = self.consume_payload()?;
                        let kind = entry_kind_of_payload(&payload)?;
                        self.pending = Some(Pending::EntryPayload(payload));
                        kind
                    } else if let Some(Pending::EntryPayload(payload)) = &self.pending {
                        entry_kind_of_payload(payload)?
                    } else {
                        unreachable!("pending_id said entry")
                    }
                }
                ID_META => ArchiveEntryKind::Meta,
                ID_SIGNATURE => ArchiveEntryKind::Signature,
                ID_DATA => {
                    return Err(Error::InvalidFormat(
                        "data chunk outside an entry body".into(),
                    ));
                }
                ID_INFO => {
                    // A second info chunk is tolerated and skipped.
                    self.consume_payload()?;
                    continue;
                }
                _ => unreachable!("read_header rejects unknown ids"),
            };
            return Ok(Some(PeekedEntry { kind, offset }));
        }
    }

    /// Consumes a pending meta marker.
    pub fn read_meta(&mut self) -> Result<MetaPayload> {
        self.expect_pending(ID_META)?;
        let payload = self.consume_payload()?;
        MetaPayload::decode(&payload)
    }

    /// Consumes a pending signature marker without verifying it (stream
    /// verification is a whole-archive scan, see
    /// [`verify_signatures`](super::verify_signatures)).
    pub fn read_signature(&mut self) -> Result<SignaturePayload> {
        self.expect_pending(ID_SIGNATURE)?;
        let payload = self.consume_payload()?;
        SignaturePayload::decode(&payload)
    }

    /// Consumes a pending entry chunk and returns its parsed header.
    pub fn read_entry_header(&mut self) -> Result<EntryHeader> {
        self.expect_pending(ID_ENTRY)?;
        let payload = self.consume_payload()?;
        EntryHeader::decode(&payload)
    }

    /// Opens the data body following the just-read entry header.
    pub fn open_data(
        &mut self,
        params: &StackParams,
        password: Option<&Password>,
        source: Option<Arc<dyn DeltaSource>>,
    ) -> Result<EntryCursor<'_>> {
        let stack = DecodeStack::new(params, password, source)?;
        Ok(EntryCursor {
            reader: self,
            stack,
            chunk_remaining: 0,
            data_done: false,
        })
    }

    /// Skips every data chunk up to the next entry boundary.
    pub fn skip_data(&mut self) -> Result<()> {
        loop {
            match self.pending_id()? {
                Some(id) if id == ID_DATA => {
                    let size = self.begin_data_payload()?;
                    self.skip_bytes(size)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn expect_pending(&mut self, id: [u8; 4]) -> Result<()> {
        match self.pending_id()? {
            Some(have) if have == id => Ok(()),
            Some(have) => Err(Error::InvalidFormat(format!(
                "expected chunk {:?}, found {:?}",
                String::from_utf8_lossy(&id),
                String::from_utf8_lossy(&have)
            ))),
            None => Err(Error::InvalidFormat("unexpected end of archive".into())),
        }
    }
}

/// Cursor over one entry's decoded data body.
pub struct EntryCursor<'a> {
    reader: &'a mut ArchiveReader,
    stack: DecodeStack,
    chunk_remaining: u64,
    data_done: bool,
}

impl EntryCursor<'_> {
    /// Reads decoded bytes into `buf`, returning 0 at the end of the body.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.stack.drain(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if self.data_done {
                return Ok(0);
            }
            self.fill()?;
        }
    }

    /// True once the archive-side stream of this entry is exhausted and
    /// nothing but cipher-block padding remains on the decoded side.
    /// Probing consumes pending bytes, so callers check this only after
    /// the body is fully read.
    pub fn eof_data(&mut self) -> bool {
        let slack = self.stack.padding_slack();
        let mut seen = 0usize;
        let mut probe = [0u8; 64];
        loop {
            match self.stack.drain(&mut probe) {
                Err(_) => return false,
                Ok(0) => {
                    if self.data_done {
                        return self.stack.end_of_data() && seen <= slack;
                    }
                    if self.fill().is_err() {
                        return false;
                    }
                }
                Ok(n) => {
                    seen += n;
                    if seen > slack {
                        return false;
                    }
                }
            }
        }
    }

    /// Advances the reader past any remaining data chunks. Must be called
    /// on every exit path, success or failure.
    pub fn close(self) -> Result<()> {
        if self.chunk_remaining > 0 {
            let n = self.chunk_remaining;
            self.reader.skip_bytes(n)?;
        }
        self.reader.skip_data()
    }

    fn fill(&mut self) -> Result<()> {
        if self.chunk_remaining == 0 {
            match self.reader.pending_id()? {
                Some(id) if id == ID_DATA => {
                    self.chunk_remaining = self.reader.begin_data_payload()?;
                    if self.chunk_remaining == 0 {
                        return Ok(());
                    }
                }
                _ => {
                    // Next chunk belongs to the following entry.
                    self.data_done = true;
                    self.stack.finish_input()?;
                    return Ok(());
                }
            }
        }
        let want = (self.chunk_remaining as usize).min(TRANSFER_BUFFER_SIZE);
        let mut buf = vec![0u8; want];
        let n = self.reader.read_raw(&mut buf)?;
        self.chunk_remaining -= n as u64;
        self.stack.push(&buf[..n])?;
        Ok(())
    }
}

/// Parses the entry kind out of a raw entry-chunk payload without a full
/// header decode; used when seeding the work queue.
pub(crate) fn entry_kind_of_payload(payload: &[u8]) -> Result<ArchiveEntryKind> {
    let mut r = WireReader::new(payload);
    let tag = r.u8()?;
    ArchiveEntryKind::from_tag(tag)
        .ok_or_else(|| Error::InvalidFormat(format!("unknown entry kind tag {tag}")))
}
