//! Compare operation: read entry bodies and compare them byte-for-byte
//! against the live filesystem.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::{EntryVisitor, Job, OpContext, run_read_operation, warn_unexpected_tail, with_body};
use crate::archive::entry::EntryHeader;
use crate::archive::read::{ArchiveReader, TRANSFER_BUFFER_SIZE};
use crate::fsprobe::BlockUsage;
use crate::fsx::{self, FsEntryKind};
use crate::{Error, Result};

/// Compares every selected entry of the given archives against the
/// filesystem. The first differing byte of an entry is reported with its
/// absolute offset within the logical file.
pub fn compare(job: &Job, storage_names: &[String]) -> Result<()> {
    run_read_operation(job, storage_names, &CompareVisitor, true)
}

struct CompareVisitor;

/// Reads exactly `buf.len()` bytes or fails with the entry name.
fn read_local_exact(file: &mut File, buf: &mut [u8], name: &str) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < buf.len() {
        return Err(Error::EntriesDiffer {
            name: name.to_string(),
            offset: filled as u64,
        });
    }
    Ok(filled)
}

fn compare_file_content(
    ctx: &OpContext<'_>,
    reader: &mut ArchiveReader,
    header: &EntryHeader,
    name: &str,
    expected_size: u64,
    fragment_offset: u64,
    fragment_size: u64,
) -> Result<()> {
    let path = Path::new(name);
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::FileNotFound {
            path: name.to_string(),
        },
        _ => Error::Io(e),
    })?;
    if !metadata.is_file() {
        return Err(Error::WrongEntryType {
            name: name.to_string(),
        });
    }
    if metadata.len() != expected_size {
        return Err(Error::EntriesDiffer {
            name: name.to_string(),
            offset: metadata.len().min(expected_size),
        });
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(fragment_offset))?;

    let kind = header.kind();
    with_body(ctx, reader, header, |cursor, params| {
        let mut archive_buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut local_buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut processed = 0u64;
        while processed < fragment_size {
            ctx.job.control.checkpoint()?;
            let want = ((fragment_size - processed) as usize).min(TRANSFER_BUFFER_SIZE);
            let n = cursor.read_data(&mut archive_buf[..want])?;
            if n == 0 {
                return Err(Error::InvalidFormat(format!(
                    "entry '{name}' body ends short at {processed} of {fragment_size} bytes"
                )));
            }
            read_local_exact(&mut file, &mut local_buf[..n], name).map_err(|e| match e {
                Error::EntriesDiffer { offset, .. } => Error::EntriesDiffer {
                    name: name.to_string(),
                    offset: fragment_offset + processed + offset,
                },
                other => other,
            })?;
            if let Some(idx) = first_difference(&archive_buf[..n], &local_buf[..n]) {
                return Err(Error::EntriesDiffer {
                    name: name.to_string(),
                    offset: fragment_offset + processed + idx as u64,
                });
            }
            processed += n as u64;
            if fragment_size > 0 {
                ctx.job
                    .progress
                    .entry_step(((processed * 100) / fragment_size) as u8);
            }
        }
        warn_unexpected_tail(params, cursor, kind, name);
        Ok(())
    })
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b.iter()).position(|(x, y)| x != y)
}

impl EntryVisitor for CompareVisitor {
    fn operation(&self) -> &'static str {
        "Compare"
    }

    fn on_file(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::File {
            path,
            info,
            fragment,
            ..
        } = header
        else {
            unreachable!("dispatched on kind");
        };
        compare_file_content(
            ctx,
            reader,
            header,
            path,
            info.size,
            fragment.offset,
            fragment.size,
        )?;
        ctx.record_fragment(path, info.size, fragment.offset, fragment.size, false);
        Ok(())
    }

    fn on_image(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::Image {
            device_path,
            total_size,
            block_size,
            fragment,
            ..
        } = header
        else {
            unreachable!("dispatched on kind");
        };
        let block_size_u = *block_size as usize;
        if block_size_u == 0 || block_size_u > TRANSFER_BUFFER_SIZE {
            return Err(Error::InvalidDeviceBlockSize {
                block_size: *block_size,
                buffer_size: TRANSFER_BUFFER_SIZE,
            });
        }

        let mut device = File::open(Path::new(device_path)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound {
                path: device_path.clone(),
            },
            _ => Error::Io(e),
        })?;
        let usage = if ctx.job.options.raw_images {
            None
        } else {
            BlockUsage::probe(&mut device)?
        };

        let name = device_path.clone();
        let kind = header.kind();
        let block_size64 = u64::from(*block_size);
        with_body(ctx, reader, header, |cursor, params| {
            let mut archive_buf = vec![0u8; block_size_u];
            let mut local_buf = vec![0u8; block_size_u];
            for block_index in 0..fragment.size {
                ctx.job.control.checkpoint()?;
                let mut filled = 0;
                while filled < block_size_u {
                    let n = cursor.read_data(&mut archive_buf[filled..])?;
                    if n == 0 {
                        return Err(Error::InvalidFormat(format!(
                            "image '{name}' body ends short in block {block_index}"
                        )));
                    }
                    filled += n;
                }

                let byte_offset = (fragment.offset + block_index) * block_size64;
                let in_use = usage.as_ref().is_none_or(|u| u.block_is_used(byte_offset));
                if !in_use {
                    // Unused filesystem block: archive data is discarded.
                    continue;
                }

                device.seek(SeekFrom::Start(byte_offset))?;
                let mut got = 0;
                while got < block_size_u {
                    let n = device.read(&mut local_buf[got..])?;
                    if n == 0 {
                        break;
                    }
                    got += n;
                }
                if got < block_size_u {
                    return Err(Error::EntriesDiffer {
                        name: name.clone(),
                        offset: byte_offset + got as u64,
                    });
                }
                if let Some(idx) = first_difference(&archive_buf, &local_buf) {
                    return Err(Error::EntriesDiffer {
                        name: name.clone(),
                        offset: byte_offset + idx as u64,
                    });
                }
                if fragment.size > 0 {
                    ctx.job
                        .progress
                        .entry_step((((block_index + 1) * 100) / fragment.size) as u8);
                }
            }
            warn_unexpected_tail(params, cursor, kind, &name);
            Ok(())
        })?;

        let total_blocks = total_size.div_ceil(block_size64);
        ctx.record_fragment(device_path, total_blocks, fragment.offset, fragment.size, false);
        Ok(())
    }

    fn on_directory(
        &self,
        _ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::Directory { path, .. } = header else {
            unreachable!("dispatched on kind");
        };
        reader.skip_data()?;
        let (kind, _) = fsx::capture(Path::new(path))?;
        if kind != FsEntryKind::Directory {
            return Err(Error::WrongEntryType { name: path.clone() });
        }
        Ok(())
    }

    fn on_link(
        &self,
        _ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::Link { path, target, .. } = header else {
            unreachable!("dispatched on kind");
        };
        reader.skip_data()?;
        let live_target = std::fs::read_link(Path::new(path)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound { path: path.clone() },
            std::io::ErrorKind::InvalidInput => Error::WrongEntryType { name: path.clone() },
            _ => Error::Io(e),
        })?;
        if live_target != Path::new(target) {
            return Err(Error::EntriesDiffer {
                name: path.clone(),
                offset: 0,
            });
        }
        Ok(())
    }

    fn on_hard_link(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::HardLink {
            paths,
            info,
            fragment,
            ..
        } = header
        else {
            unreachable!("dispatched on kind");
        };
        let first = paths.first().expect("decode rejects empty groups");
        for other in &paths[1..] {
            if !Path::new(other).exists() {
                return Err(Error::FileNotFound {
                    path: other.clone(),
                });
            }
        }
        compare_file_content(
            ctx,
            reader,
            header,
            first,
            info.size,
            fragment.offset,
            fragment.size,
        )?;
        ctx.record_fragment(first, info.size, fragment.offset, fragment.size, false);
        Ok(())
    }

    fn on_special(
        &self,
        _ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::Special { path, info } = header else {
            unreachable!("dispatched on kind");
        };
        reader.skip_data()?;
        let (kind, _) = fsx::capture(Path::new(path))?;
        match kind {
            FsEntryKind::Special(live) if Some(live) == info.special => Ok(()),
            _ => Err(Error::WrongEntryType { name: path.clone() }),
        }
    }
}
