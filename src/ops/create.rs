//! Create operation: walk filesystem roots and write archive entries.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{EntryOutcome, FailTracker, Job, fragments_check};
use crate::archive::entry::{EntryHeader, Fragment, MetaPayload};
use crate::archive::write::ArchiveWriter;
use crate::codec::CompressAlgorithm;
use crate::codec::stack::StackParams;
use crate::crypto::{CryptMode, PasswordUse, salt_for};
use crate::fragment::FragmentLedger;
use crate::fsprobe::BlockUsage;
use crate::fsx::{self, FileInfo, FsEntryKind, SpecialKind};
use crate::pattern::PatternMatchMode;
use crate::source::SourceResolver;
use crate::storage::StorageSpecifier;
use crate::{Error, Result};

/// Device block size used for images.
const IMAGE_BLOCK_SIZE: u32 = 512;

/// Read buffer of the create data path.
const READ_BUFFER: usize = 64 * 1024;

/// Creates one archive from the given filesystem roots.
///
/// Regular files, directories, symbolic links and specials are archived by
/// kind; files with multiple links are grouped into hard-link entries; a
/// root that is a block device becomes an image entry. The exclude list
/// prunes the walk.
pub fn create(job: &Job, storage_name: &str, roots: &[PathBuf]) -> Result<()> {
    job.control.reset_stop();
    let spec = StorageSpecifier::parse(storage_name)?;
    let resolver = SourceResolver::new(
        job.delta_sources.clone(),
        Arc::clone(&job.storage),
        job.password.clone(),
        job.options.temp_directory.clone(),
    );
    let ledger = Mutex::new(FragmentLedger::new());
    let fail = FailTracker::new();

    let mut writer = ArchiveWriter::create(job.storage.open_write(&spec, 0)?)?;
    writer.write_meta(&MetaPayload {
        created: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        host_name: job.host_name.clone(),
        job_name: job.job_name.clone(),
    })?;

    let mut creator = Creator {
        job,
        resolver: &resolver,
        ledger: &ledger,
        fail: &fail,
        writer: &mut writer,
        hard_links: BTreeMap::new(),
    };

    for root in roots {
        if job.control.should_stop() {
            break;
        }
        if let Err(error) = creator.walk(root) {
            match error {
                Error::Aborted => break,
                other => {
                    fail.record(other);
                    if job.options.stop_on_error {
                        break;
                    }
                }
            }
        }
    }
    if !job.control.should_stop() || !job.options.stop_on_error {
        creator.flush_hard_links();
    }

    writer.write_signature()?;
    writer.finish()?;

    fragments_check(job, &ledger, &fail);
    fail.into_result()
}

#[cfg(unix)]
type HardLinkKey = (u64, u64);

struct Creator<'a> {
    job: &'a Job,
    resolver: &'a SourceResolver,
    ledger: &'a Mutex<FragmentLedger>,
    fail: &'a FailTracker,
    writer: &'a mut ArchiveWriter,
    #[cfg(unix)]
    hard_links: BTreeMap<HardLinkKey, (Vec<String>, FileInfo)>,
    #[cfg(not(unix))]
    hard_links: BTreeMap<u64, (Vec<String>, FileInfo)>,
}

impl Creator<'_> {
    fn walk(&mut self, path: &Path) -> Result<()> {
        self.job.control.checkpoint()?;
        let name = path_name(path);
        if self.job.exclude.matches(&name, PatternMatchMode::Exact) {
            log::info!("Create '{name}'...skipped");
            return Ok(());
        }

        let (kind, info) = fsx::capture(path)?;
        let result = match kind {
            FsEntryKind::Directory => {
                self.emit_directory(&name, &info)?;
                let mut children: Vec<PathBuf> = std::fs::read_dir(path)?
                    .collect::<std::io::Result<Vec<_>>>()?
                    .into_iter()
                    .map(|e| e.path())
                    .collect();
                children.sort();
                for child in children {
                    if let Err(error) = self.walk(&child) {
                        match error {
                            Error::Aborted => return Err(Error::Aborted),
                            other => {
                                log::error!(
                                    "Create '{}' (error: {})",
                                    path_name(&child),
                                    other
                                );
                                if self.job.options.stop_on_error {
                                    self.fail.record(other);
                                    self.job.control.request_stop();
                                    return Err(Error::Aborted);
                                }
                                log::warn!(
                                    "Warning: continuing after failed entry '{}'",
                                    path_name(&child)
                                );
                            }
                        }
                    }
                }
                Ok(())
            }
            FsEntryKind::File => self.collect_file(path, &name, &info),
            FsEntryKind::Symlink => self.emit_link(path, &name, &info),
            FsEntryKind::Special(SpecialKind::BlockDevice { .. }) => {
                // A block-device root is archived as an image.
                self.emit_image(path, &name)
            }
            FsEntryKind::Special(_) => self.emit_special(&name, &info),
        };
        result
    }

    fn params_for(&self, entry_name: &str) -> Result<(StackParams, Option<String>, Option<Arc<dyn crate::codec::DeltaSource>>)> {
        let mut params = StackParams {
            compress: self.job.options.compress,
            delta: CompressAlgorithm::None,
            crypt: self.job.options.crypt,
            salt: salt_for(self.job.options.crypt)?,
        };
        let mut delta_source_name = None;
        let mut source = None;
        if self.job.options.delta != CompressAlgorithm::None {
            match self.resolver.open_source(entry_name, None) {
                Ok((handle, from)) => {
                    params.delta = self.job.options.delta;
                    delta_source_name = Some(from);
                    source = Some(handle);
                }
                Err(error) => {
                    log::warn!(
                        "Warning: no delta source for '{entry_name}' ({error}), storing plain"
                    );
                }
            }
        }
        Ok((params, delta_source_name, source))
    }

    fn collect_file(&mut self, path: &Path, name: &str, info: &FileInfo) -> Result<()> {
        #[cfg(unix)]
        {
            let (dev, ino, nlink) = fsx::hardlink_id(path)?;
            if nlink > 1 {
                let slot = self
                    .hard_links
                    .entry((dev, ino))
                    .or_insert_with(|| (Vec::new(), *info));
                slot.0.push(name.to_string());
                return Ok(());
            }
        }
        self.emit_file(path, name, info)
    }

    /// Emits hard-link groups collected during the walk. A group with a
    /// single observed path degrades to a plain file entry.
    fn flush_hard_links(&mut self) {
        let groups = std::mem::take(&mut self.hard_links);
        for (_, (paths, info)) in groups {
            let first = paths[0].clone();
            let result = if paths.len() == 1 {
                self.emit_file(Path::new(&first), &first, &info)
            } else {
                self.emit_hard_link(paths, &info)
            };
            if let Err(error) = result {
                log::error!("Create hard link '{first}' (error: {error})");
                self.fail.record(error);
                if self.job.options.stop_on_error {
                    self.job.control.request_stop();
                    return;
                }
            }
        }
    }

    fn emit_file(&mut self, path: &Path, name: &str, info: &FileInfo) -> Result<()> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(error) if self.job.options.skip_unreadable => {
                log::warn!("Warning: cannot read '{name}' ({error}), skipped");
                self.job.progress.entry_done(EntryOutcome::Skipped);
                return Ok(());
            }
            Err(error) => return Err(Error::Io(error)),
        };

        self.job.progress.entry_start("Create", "file", name);
        let (params, delta_source, source) = self.params_for(name)?;
        let header = EntryHeader::File {
            path: name.to_string(),
            info: *info,
            params,
            fragment: Fragment {
                offset: 0,
                size: info.size,
            },
            delta_source,
        };
        let password = if params.crypt == CryptMode::None {
            None
        } else {
            self.job.password_for(PasswordUse::Encrypt, name)
        };
        let mut cursor = self
            .writer
            .new_entry(&header, password.as_ref(), source)?;

        let mut buf = vec![0u8; READ_BUFFER];
        let copy = (|| -> Result<()> {
            // The header's fragment size is authoritative; a file growing
            // underneath the walk is cut off at the captured size.
            let mut written = 0u64;
            while written < info.size {
                self.job.control.checkpoint()?;
                let want = ((info.size - written) as usize).min(READ_BUFFER);
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("'{name}' ends short at {written} of {} bytes", info.size),
                    )));
                }
                cursor.write_data(&buf[..n])?;
                written += n as u64;
                self.job
                    .progress
                    .entry_step(((written * 100) / info.size) as u8);
            }
            Ok(())
        })();
        match copy {
            Ok(()) => {
                cursor.close()?;
                self.ledger
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .add_range(name, info.size, 0, info.size);
                self.job.progress.entry_done(EntryOutcome::Ok);
                log::info!("Create file '{name}'...OK");
                Ok(())
            }
            Err(error) => {
                cursor.abort();
                self.job.progress.entry_done(EntryOutcome::Fail);
                Err(error)
            }
        }
    }

    fn emit_hard_link(&mut self, paths: Vec<String>, info: &FileInfo) -> Result<()> {
        let first = paths[0].clone();
        let mut file = File::open(Path::new(&first))?;
        self.job.progress.entry_start("Create", "hard link", &first);
        let (params, delta_source, source) = self.params_for(&first)?;
        let header = EntryHeader::HardLink {
            paths,
            info: *info,
            params,
            fragment: Fragment {
                offset: 0,
                size: info.size,
            },
            delta_source,
        };
        let password = if params.crypt == CryptMode::None {
            None
        } else {
            self.job.password_for(PasswordUse::Encrypt, &first)
        };
        let mut cursor = self
            .writer
            .new_entry(&header, password.as_ref(), source)?;
        let mut buf = vec![0u8; READ_BUFFER];
        let copy = (|| -> Result<()> {
            let mut written = 0u64;
            while written < info.size {
                self.job.control.checkpoint()?;
                let want = ((info.size - written) as usize).min(READ_BUFFER);
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("'{first}' ends short at {written} of {} bytes", info.size),
                    )));
                }
                cursor.write_data(&buf[..n])?;
                written += n as u64;
            }
            Ok(())
        })();
        match copy {
            Ok(()) => {
                cursor.close()?;
                self.ledger
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .add_range(&first, info.size, 0, info.size);
                self.job.progress.entry_done(EntryOutcome::Ok);
                log::info!("Create hard link '{first}'...OK");
                Ok(())
            }
            Err(error) => {
                cursor.abort();
                self.job.progress.entry_done(EntryOutcome::Fail);
                Err(error)
            }
        }
    }

    fn emit_directory(&mut self, name: &str, info: &FileInfo) -> Result<()> {
        let header = EntryHeader::Directory {
            path: name.to_string(),
            info: *info,
        };
        let cursor = self.writer.new_entry(&header, None, None)?;
        cursor.close()?;
        log::info!("Create directory '{name}'...OK");
        Ok(())
    }

    fn emit_link(&mut self, path: &Path, name: &str, info: &FileInfo) -> Result<()> {
        let target = std::fs::read_link(path)?;
        let header = EntryHeader::Link {
            path: name.to_string(),
            target: path_name(&target),
            info: *info,
        };
        let cursor = self.writer.new_entry(&header, None, None)?;
        cursor.close()?;
        log::info!("Create link '{name}'...OK");
        Ok(())
    }

    fn emit_special(&mut self, name: &str, info: &FileInfo) -> Result<()> {
        let header = EntryHeader::Special {
            path: name.to_string(),
            info: *info,
        };
        let cursor = self.writer.new_entry(&header, None, None)?;
        cursor.close()?;
        log::info!("Create special '{name}'...OK");
        Ok(())
    }

    fn emit_image(&mut self, path: &Path, name: &str) -> Result<()> {
        let mut device = match File::open(path) {
            Ok(device) => device,
            Err(error) if self.job.options.skip_unreadable => {
                log::warn!("Warning: cannot read device '{name}' ({error}), skipped");
                return Ok(());
            }
            Err(error) => return Err(Error::Io(error)),
        };
        let total_size = device.seek(SeekFrom::End(0))?;
        device.seek(SeekFrom::Start(0))?;

        let file_system = if self.job.options.raw_images {
            None
        } else {
            let usage = BlockUsage::probe(&mut device)?;
            device.seek(SeekFrom::Start(0))?;
            usage.map(|u| u.kind())
        };

        let block_size64 = u64::from(IMAGE_BLOCK_SIZE);
        let total_blocks = total_size.div_ceil(block_size64);
        self.job.progress.entry_start("Create", "image", name);

        let params = StackParams {
            compress: self.job.options.compress,
            delta: CompressAlgorithm::None,
            crypt: self.job.options.crypt,
            salt: salt_for(self.job.options.crypt)?,
        };
        let header = EntryHeader::Image {
            device_path: name.to_string(),
            total_size,
            block_size: IMAGE_BLOCK_SIZE,
            fragment: Fragment {
                offset: 0,
                size: total_blocks,
            },
            file_system,
            params,
        };
        let password = if params.crypt == CryptMode::None {
            None
        } else {
            self.job.password_for(PasswordUse::Encrypt, name)
        };
        let mut cursor = self
            .writer
            .new_entry(&header, password.as_ref(), None)?;

        let mut buf = vec![0u8; IMAGE_BLOCK_SIZE as usize];
        let copy = (|| -> Result<()> {
            for block_index in 0..total_blocks {
                self.job.control.checkpoint()?;
                device.seek(SeekFrom::Start(block_index * block_size64))?;
                let mut filled = 0;
                while filled < buf.len() {
                    let n = device.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                // The final block of an unaligned device is zero-padded.
                buf[filled..].fill(0);
                cursor.write_data(&buf)?;
                if total_blocks > 0 {
                    self.job
                        .progress
                        .entry_step((((block_index + 1) * 100) / total_blocks) as u8);
                }
            }
            Ok(())
        })();
        match copy {
            Ok(()) => {
                cursor.close()?;
                self.ledger
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .add_range(name, total_blocks, 0, total_blocks);
                self.job.progress.entry_done(EntryOutcome::Ok);
                log::info!("Create image '{name}'...OK");
                Ok(())
            }
            Err(error) => {
                cursor.abort();
                self.job.progress.entry_done(EntryOutcome::Fail);
                Err(error)
            }
        }
    }
}

fn path_name(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
