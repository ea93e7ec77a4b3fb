//! Write side of the entry pipeline.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::chunk::{self, ID_DATA, ID_ENTRY, ID_INFO, ID_META, ID_SIGNATURE};
use super::entry::{EntryHeader, MetaPayload};
use super::signature::{DIGEST_SHA256, SignaturePayload};
use super::{ArchiveInfo, FORMAT_VERSION};
use crate::codec::DeltaSource;
use crate::codec::stack::{EncodeStack, StackParams};
use crate::crypto::Password;
use crate::storage::StorageWriter;
use crate::{Error, Result};

/// Data chunks are cut at this payload size.
const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// Sequential writer producing one archive object.
///
/// All written bytes feed a running digest so a signature chunk can cover
/// the byte range since the previous signature (or the start of the
/// archive).
pub struct ArchiveWriter {
    storage: Box<dyn StorageWriter>,
    digest: Sha256,
    entry_open: bool,
    finished: bool,
}

impl ArchiveWriter {
    /// Creates an archive, writing the leading info chunk.
    pub fn create(storage: Box<dyn StorageWriter>) -> Result<Self> {
        let mut writer = Self {
            storage,
            digest: Sha256::new(),
            entry_open: false,
            finished: false,
        };
        let info = ArchiveInfo {
            version: FORMAT_VERSION,
        };
        writer.write_chunk(ID_INFO, &info.encode())?;
        Ok(writer)
    }

    /// Writes a meta marker.
    pub fn write_meta(&mut self, meta: &MetaPayload) -> Result<()> {
        self.write_chunk(ID_META, &meta.encode())
    }

    /// Writes an entry header and returns the cursor for its data body.
    ///
    /// Kinds without a data body still go through the cursor; closing it
    /// frames the (empty) body.
    pub fn new_entry(
        &mut self,
        header: &EntryHeader,
        password: Option<&Password>,
        source: Option<Arc<dyn DeltaSource>>,
    ) -> Result<EntryWriteCursor<'_>> {
        if self.entry_open {
            return Err(Error::InvalidFormat("previous entry not closed".into()));
        }
        let params = header.params().copied().unwrap_or_default();
        let stack = if header.kind().has_data() {
            Some(EncodeStack::new(&params, password, source)?)
        } else {
            None
        };
        self.write_chunk(ID_ENTRY, &header.encode())?;
        self.entry_open = true;
        Ok(EntryWriteCursor {
            writer: self,
            stack,
            buffered: Vec::new(),
        })
    }

    /// Writes a signature chunk covering everything since the previous one.
    pub fn write_signature(&mut self) -> Result<()> {
        let digest: [u8; 32] = std::mem::take(&mut self.digest).finalize().into();
        let payload = SignaturePayload {
            algorithm: DIGEST_SHA256,
            digest,
        };
        // The signature chunk itself is excluded from its own digest; the
        // hasher restarts for the following range.
        let bytes = chunk::encode_chunk(ID_SIGNATURE, &payload.encode());
        self.storage.write(&bytes)?;
        Ok(())
    }

    /// Finishes the archive and closes the storage object.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.entry_open {
            return Err(Error::InvalidFormat("entry still open at finish".into()));
        }
        self.finished = true;
        self.storage.close()
    }

    fn write_chunk(&mut self, id: [u8; 4], payload: &[u8]) -> Result<()> {
        let bytes = chunk::encode_chunk(id, payload);
        self.digest.update(&bytes);
        self.storage.write(&bytes)
    }
}

/// Cursor writing one entry's data body.
pub struct EntryWriteCursor<'a> {
    writer: &'a mut ArchiveWriter,
    stack: Option<EncodeStack>,
    buffered: Vec<u8>,
}

impl EntryWriteCursor<'_> {
    /// Feeds raw entry bytes through the encode stack.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let stack = self.stack.as_mut().ok_or_else(|| {
            Error::InvalidFormat("entry kind carries no data body".into())
        })?;
        stack.push(data)?;
        self.buffered.append(&mut stack.take_output());
        self.flush_full_chunks()?;
        Ok(())
    }

    /// Raw bytes accepted so far.
    pub fn raw_bytes(&self) -> u64 {
        self.stack.as_ref().map_or(0, EncodeStack::raw_bytes)
    }

    /// Completes the stack, writes trailing data chunks and closes the
    /// entry. Must be called on every exit path.
    pub fn close(mut self) -> Result<()> {
        if let Some(stack) = self.stack.as_mut() {
            stack.finish()?;
            let tail = stack.take_output();
            self.buffered.extend_from_slice(&tail);
        }
        self.flush_full_chunks()?;
        if !self.buffered.is_empty() {
            let payload = std::mem::take(&mut self.buffered);
            self.writer.write_chunk(ID_DATA, &payload)?;
        }
        self.writer.entry_open = false;
        Ok(())
    }

    /// Abandons the entry without writing trailing data. The archive is
    /// still chunk-consistent (the entry simply ends short); the caller
    /// records the failure.
    pub fn abort(self) {
        self.writer.entry_open = false;
    }

    fn flush_full_chunks(&mut self) -> Result<()> {
        while self.buffered.len() >= DATA_CHUNK_SIZE {
            let rest = self.buffered.split_off(DATA_CHUNK_SIZE);
            let payload = std::mem::replace(&mut self.buffered, rest);
            self.writer.write_chunk(ID_DATA, &payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::read::ArchiveReader;
    use crate::archive::entry::{ArchiveEntryKind, Fragment};
    use crate::fsx::FileInfo;
    use crate::storage::{LocalStorage, Storage, StorageSpecifier};

    fn spec_in(dir: &tempfile::TempDir, name: &str) -> StorageSpecifier {
        StorageSpecifier::parse(dir.path().join(name).to_str().unwrap()).unwrap()
    }

    #[test]
    fn write_then_read_single_file_entry() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(&dir, "t.bar");
        let storage = LocalStorage::new();

        let data = vec![0x5Au8; 150_000];
        {
            let mut writer = ArchiveWriter::create(storage.open_write(&spec, 0).unwrap()).unwrap();
            writer
                .write_meta(&MetaPayload {
                    created: 1_700_000_000,
                    host_name: "host".into(),
                    job_name: "job".into(),
                })
                .unwrap();
            let header = EntryHeader::File {
                path: "big.bin".into(),
                info: FileInfo {
                    size: data.len() as u64,
                    ..FileInfo::default()
                },
                params: StackParams::default(),
                fragment: Fragment {
                    offset: 0,
                    size: data.len() as u64,
                },
                delta_source: None,
            };
            let mut cursor = writer.new_entry(&header, None, None).unwrap();
            cursor.write_data(&data).unwrap();
            cursor.close().unwrap();
            writer.write_signature().unwrap();
            writer.finish().unwrap();
        }

        let mut reader = ArchiveReader::open(storage.open_read(&spec).unwrap()).unwrap();
        let peeked = reader.peek_next_kind().unwrap().unwrap();
        assert_eq!(peeked.kind, ArchiveEntryKind::Meta);
        let meta = reader.read_meta().unwrap();
        assert_eq!(meta.job_name, "job");

        let peeked = reader.peek_next_kind().unwrap().unwrap();
        assert_eq!(peeked.kind, ArchiveEntryKind::File);
        let header = reader.read_entry_header().unwrap();
        assert_eq!(header.name(), "big.bin");
        let params = header.params().copied().unwrap();

        let mut cursor = reader.open_data(&params, None, None).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = cursor.read_data(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert!(cursor.eof_data());
        cursor.close().unwrap();
        assert_eq!(out, data);

        let peeked = reader.peek_next_kind().unwrap().unwrap();
        assert_eq!(peeked.kind, ArchiveEntryKind::Signature);
        reader.read_signature().unwrap();
        assert!(reader.peek_next_kind().unwrap().is_none());
    }

    #[test]
    fn skip_data_lands_on_next_entry() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(&dir, "s.bar");
        let storage = LocalStorage::new();

        {
            let mut writer = ArchiveWriter::create(storage.open_write(&spec, 0).unwrap()).unwrap();
            for (name, content) in [("a", b"AAAA".as_slice()), ("b", b"BBBBBBBB".as_slice())] {
                let header = EntryHeader::File {
                    path: name.into(),
                    info: FileInfo {
                        size: content.len() as u64,
                        ..FileInfo::default()
                    },
                    params: StackParams::default(),
                    fragment: Fragment {
                        offset: 0,
                        size: content.len() as u64,
                    },
                    delta_source: None,
                };
                let mut cursor = writer.new_entry(&header, None, None).unwrap();
                cursor.write_data(content).unwrap();
                cursor.close().unwrap();
            }
            writer.finish().unwrap();
        }

        let mut reader = ArchiveReader::open(storage.open_read(&spec).unwrap()).unwrap();
        reader.peek_next_kind().unwrap().unwrap();
        let _ = reader.read_entry_header().unwrap();
        reader.skip_data().unwrap();
        let second = reader.read_entry_header().unwrap();
        assert_eq!(second.name(), "b");
    }

    #[test]
    fn workers_can_seek_to_peeked_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(&dir, "w.bar");
        let storage = LocalStorage::new();

        {
            let mut writer = ArchiveWriter::create(storage.open_write(&spec, 0).unwrap()).unwrap();
            for name in ["one", "two", "three"] {
                let header = EntryHeader::Directory {
                    path: name.into(),
                    info: FileInfo::default(),
                };
                let cursor = writer.new_entry(&header, None, None).unwrap();
                cursor.close().unwrap();
            }
            writer.finish().unwrap();
        }

        // Scan offsets with one reader.
        let mut offsets = Vec::new();
        let mut scanner = ArchiveReader::open(storage.open_read(&spec).unwrap()).unwrap();
        while let Some(peeked) = scanner.peek_next_kind().unwrap() {
            offsets.push(peeked.offset);
            let _ = scanner.read_entry_header().unwrap();
            scanner.skip_data().unwrap();
        }
        assert_eq!(offsets.len(), 3);

        // Re-read the middle entry through an independent handle.
        let mut reader = ArchiveReader::open(storage.open_read(&spec).unwrap()).unwrap();
        reader.seek_to(offsets[1]).unwrap();
        let header = reader.read_entry_header().unwrap();
        assert_eq!(header.name(), "two");
    }
}
