//! Delta-source resolver.
//!
//! Delta compression needs the prior content of an entry. The resolver
//! walks the job's delta-source list, opens each candidate archive, and
//! restores the single matching entry into a scratch temp file; the
//! returned handle serves block reads out of that file. Scratch files are
//! removed when the handle drops.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::archive::{ArchiveEntryKind, ArchiveReader, EntryHeader};
use crate::codec::{CompressAlgorithm, DeltaSource};
use crate::crypto::Password;
use crate::pattern::{Pattern, PatternMatchMode, PatternType};
use crate::storage::{self, Storage, StorageSpecifier};
use crate::{Error, Result};

/// Nested delta references are followed at most this deep.
const MAX_SOURCE_DEPTH: u32 = 4;

/// One candidate in the delta-source list.
#[derive(Debug, Clone)]
pub struct DeltaSourceEntry {
    /// Storage name of the candidate archive.
    pub storage_name: String,
    /// Pattern type used when matching entry names inside the candidate.
    pub pattern_type: PatternType,
}

/// Ordered list of candidate archives consulted for delta sources.
#[derive(Debug, Clone, Default)]
pub struct DeltaSourceList {
    entries: Vec<DeltaSourceEntry>,
}

impl DeltaSourceList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a candidate.
    pub fn append(&mut self, storage_name: &str, pattern_type: PatternType) {
        self.entries.push(DeltaSourceEntry {
            storage_name: storage_name.to_string(),
            pattern_type,
        });
    }

    /// Returns `true` when no candidates are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the candidates in order.
    pub fn iter(&self) -> impl Iterator<Item = &DeltaSourceEntry> {
        self.entries.iter()
    }
}

/// Resolves delta sources for entry names.
pub struct SourceResolver {
    list: DeltaSourceList,
    storage: Arc<dyn Storage>,
    password: Option<Password>,
    temp_dir: Option<PathBuf>,
}

impl SourceResolver {
    /// Creates a resolver over the job's candidate list.
    pub fn new(
        list: DeltaSourceList,
        storage: Arc<dyn Storage>,
        password: Option<Password>,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            list,
            storage,
            password,
            temp_dir,
        }
    }

    /// Locates prior content for `entry_name`.
    ///
    /// Candidates are tried in list order; `fallback` (typically the source
    /// name recorded in an entry header) is tried last. Returns the handle
    /// and the storage name that supplied it.
    pub fn open_source(
        &self,
        entry_name: &str,
        fallback: Option<&str>,
    ) -> Result<(Arc<dyn DeltaSource>, String)> {
        self.open_source_at_depth(entry_name, fallback, MAX_SOURCE_DEPTH)
    }

    fn open_source_at_depth(
        &self,
        entry_name: &str,
        fallback: Option<&str>,
        depth: u32,
    ) -> Result<(Arc<dyn DeltaSource>, String)> {
        for candidate in self.list.iter() {
            match self.restore_entry(
                &candidate.storage_name,
                entry_name,
                candidate.pattern_type,
                depth,
            ) {
                Ok(handle) => {
                    return Ok((Arc::new(handle), candidate.storage_name.clone()));
                }
                Err(e) => {
                    log::debug!(
                        "delta source candidate '{}' has no entry '{}' ({})",
                        candidate.storage_name,
                        entry_name,
                        e
                    );
                }
            }
        }
        if let Some(fallback) = fallback {
            if let Ok(handle) =
                self.restore_entry(fallback, entry_name, PatternType::Glob, depth)
            {
                return Ok((Arc::new(handle), fallback.to_string()));
            }
        }
        Err(Error::DeltaSourceNotFound {
            name: entry_name.to_string(),
        })
    }

    /// Restores the single entry matching `entry_name` from the candidate
    /// archive into a scratch file.
    fn restore_entry(
        &self,
        storage_name: &str,
        entry_name: &str,
        pattern_type: PatternType,
        depth: u32,
    ) -> Result<SourceHandle> {
        let spec = StorageSpecifier::parse(storage_name)?;
        let pattern = Pattern::compile(entry_name, pattern_type, true)?;
        let mut reader = ArchiveReader::open(self.storage.open_read(&spec)?)?;

        let scratch = storage::get_tmp_file_name("barc-source-", self.temp_dir.as_deref())?;
        let mut file = scratch.reopen()?;
        let mut found = false;

        while let Some(peeked) = reader.peek_next_kind()? {
            match peeked.kind {
                ArchiveEntryKind::Meta => {
                    reader.read_meta()?;
                }
                ArchiveEntryKind::Signature => {
                    reader.read_signature()?;
                }
                _ => {
                    let header = reader.read_entry_header()?;
                    if !entry_matches(&header, &pattern) {
                        reader.skip_data()?;
                        continue;
                    }
                    let Some(params) = header.params().copied() else {
                        reader.skip_data()?;
                        continue;
                    };
                    let Some(fragment) = header.fragment() else {
                        reader.skip_data()?;
                        continue;
                    };

                    let nested = if params.delta == CompressAlgorithm::None {
                        None
                    } else {
                        if depth == 0 {
                            return Err(Error::DeltaSourceNotFound {
                                name: entry_name.to_string(),
                            });
                        }
                        let nested_fallback = match &header {
                            EntryHeader::File { delta_source, .. }
                            | EntryHeader::HardLink { delta_source, .. } => {
                                delta_source.as_deref()
                            }
                            _ => None,
                        };
                        Some(
                            self.open_source_at_depth(header.name(), nested_fallback, depth - 1)?
                                .0,
                        )
                    };

                    let expected = match &header {
                        EntryHeader::Image { block_size, .. } => {
                            fragment.size * u64::from(*block_size)
                        }
                        _ => fragment.size,
                    };
                    let mut cursor =
                        reader.open_data(&params, self.password.as_ref(), nested)?;
                    file.seek(SeekFrom::Start(fragment.offset))?;
                    let mut buf = [0u8; 64 * 1024];
                    let copy = (|| -> Result<()> {
                        let mut copied = 0u64;
                        while copied < expected {
                            let want = ((expected - copied) as usize).min(buf.len());
                            let n = cursor.read_data(&mut buf[..want])?;
                            if n == 0 {
                                return Err(Error::InvalidFormat(format!(
                                    "entry '{entry_name}' body ends short"
                                )));
                            }
                            file.write_all(&buf[..n])?;
                            copied += n as u64;
                        }
                        Ok(())
                    })();
                    let close_result = cursor.close();
                    copy?;
                    close_result?;
                    found = true;
                }
            }
        }

        if !found {
            return Err(Error::DeltaSourceNotFound {
                name: entry_name.to_string(),
            });
        }
        file.flush()?;
        Ok(SourceHandle {
            file: Mutex::new(file),
            _scratch: scratch,
        })
    }
}

fn entry_matches(header: &EntryHeader, pattern: &Pattern) -> bool {
    match header {
        EntryHeader::File { path, .. } => pattern.matches(path, PatternMatchMode::Exact),
        EntryHeader::HardLink { paths, .. } => paths
            .iter()
            .any(|p| pattern.matches(p, PatternMatchMode::Exact)),
        EntryHeader::Image { device_path, .. } => {
            pattern.matches(device_path, PatternMatchMode::Exact)
        }
        _ => false,
    }
}

/// Prior content restored into a scratch file.
pub struct SourceHandle {
    file: Mutex<File>,
    _scratch: tempfile::NamedTempFile,
}

impl DeltaSource for SourceHandle {
    fn size(&self) -> Result<u64> {
        let file = self.file.lock().map_err(|_| Error::Aborted)?;
        Ok(file.metadata()?.len())
    }

    fn get_block(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock().map_err(|_| Error::Aborted)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < out.len() {
            let n = file.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::entry::Fragment;
    use crate::archive::write::ArchiveWriter;
    use crate::codec::stack::StackParams;
    use crate::fsx::FileInfo;
    use crate::storage::LocalStorage;

    fn write_simple_archive(path: &std::path::Path, name: &str, data: &[u8]) {
        let spec = StorageSpecifier::parse(path.to_str().unwrap()).unwrap();
        let storage = LocalStorage::new();
        let mut writer = ArchiveWriter::create(storage.open_write(&spec, 0).unwrap()).unwrap();
        let header = EntryHeader::File {
            path: name.into(),
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
        cursor.write_data(data).unwrap();
        cursor.close().unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn resolver_finds_entry_in_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("prev.bar");
        write_simple_archive(&archive, "data/report.txt", b"previous contents");

        let mut list = DeltaSourceList::new();
        list.append(archive.to_str().unwrap(), PatternType::Glob);
        let resolver = SourceResolver::new(list, Arc::new(LocalStorage::new()), None, None);

        let (source, from) = resolver.open_source("data/report.txt", None).unwrap();
        assert_eq!(from, archive.to_str().unwrap());
        assert_eq!(source.size().unwrap(), 17);
        let mut buf = [0u8; 8];
        assert_eq!(source.get_block(9, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"contents");
    }

    #[test]
    fn resolver_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fallback.bar");
        write_simple_archive(&archive, "x", b"fb");

        let resolver = SourceResolver::new(
            DeltaSourceList::new(),
            Arc::new(LocalStorage::new()),
            None,
            None,
        );
        let (source, _) = resolver
            .open_source("x", Some(archive.to_str().unwrap()))
            .unwrap();
        assert_eq!(source.size().unwrap(), 2);
    }

    #[test]
    fn missing_source_is_reported() {
        let resolver = SourceResolver::new(
            DeltaSourceList::new(),
            Arc::new(LocalStorage::new()),
            None,
            None,
        );
        let err = resolver.open_source("nope", None).unwrap_err();
        assert!(matches!(err, Error::DeltaSourceNotFound { .. }));
    }
}
