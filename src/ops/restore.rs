//! Restore operation: read entry bodies and write them back to the
//! filesystem under the derived destination path.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    EntryVisitor, Job, OpContext, derive_destination_path, run_read_operation,
    warn_unexpected_tail, with_body,
};
use crate::archive::entry::EntryHeader;
use crate::archive::read::{ArchiveReader, TRANSFER_BUFFER_SIZE};
use crate::fsx::{self, FileInfo, SpecialKind};
use crate::{Error, Result};

/// Restores every selected entry of the given archives.
///
/// Fragments may arrive in any order and across archives; the ledger
/// frees each logical entry as soon as it is complete.
pub fn restore(job: &Job, storage_names: &[String]) -> Result<()> {
    run_read_operation(job, storage_names, &RestoreVisitor, false)
}

struct RestoreVisitor;

impl RestoreVisitor {
    fn destination_for(&self, ctx: &OpContext<'_>, entry_path: &str) -> PathBuf {
        derive_destination_path(
            entry_path,
            ctx.job.options.destination.as_deref(),
            ctx.job.options.directory_strip_count,
        )
    }

    /// Drains the body without writing anything (dry runs and skips).
    fn drain_only(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        with_body(ctx, reader, header, |cursor, _params| {
            let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
            loop {
                ctx.job.control.checkpoint()?;
                if cursor.read_data(&mut buf)? == 0 {
                    return Ok(());
                }
            }
        })
    }

    /// Writes one content fragment into `target`, returning whether the
    /// logical entry is now complete.
    #[allow(clippy::too_many_arguments)]
    fn restore_fragment(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
        ledger_name: &str,
        target: &Path,
        info: &FileInfo,
        fragment_offset: u64,
        fragment_size: u64,
    ) -> Result<bool> {
        if ctx.range_exists(ledger_name, fragment_offset, fragment_size) {
            log::warn!(
                "Warning: fragment [{fragment_offset}, +{fragment_size}) of '{ledger_name}' already restored"
            );
            self.drain_only(ctx, reader, header)?;
            return Ok(false);
        }
        let first_fragment = {
            let ledger = ctx.ledger.lock().unwrap_or_else(|p| p.into_inner());
            ledger.find(ledger_name).is_none()
        };
        if first_fragment && target.exists() && !ctx.job.options.overwrite_files {
            log::warn!(
                "Warning: '{}' exists, not overwritten",
                target.display()
            );
            self.drain_only(ctx, reader, header)?;
            return Ok(false);
        }

        if ctx.job.options.dry_run {
            self.drain_only(ctx, reader, header)?;
            return Ok(ctx.record_fragment(ledger_name, info.size, fragment_offset, fragment_size, true));
        }

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                fsx::apply_permissions(parent, info.permissions | 0o700)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)?;
        file.seek(SeekFrom::Start(fragment_offset))?;

        let name = header.name().to_string();
        let kind = header.kind();
        with_body(ctx, reader, header, |cursor, params| {
            let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
            let mut written = 0u64;
            while written < fragment_size {
                ctx.job.control.checkpoint()?;
                let want = ((fragment_size - written) as usize).min(TRANSFER_BUFFER_SIZE);
                let n = cursor.read_data(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::InvalidFormat(format!(
                        "entry '{name}' body ends short at {written} of {fragment_size} bytes"
                    )));
                }
                file.write_all(&buf[..n])?;
                written += n as u64;
                if fragment_size > 0 {
                    ctx.job
                        .progress
                        .entry_step(((written * 100) / fragment_size) as u8);
                }
            }
            warn_unexpected_tail(params, cursor, kind, &name);
            Ok(())
        })?;

        let complete =
            ctx.record_fragment(ledger_name, info.size, fragment_offset, fragment_size, true);
        if complete {
            // Writes may have extended a preexisting longer file.
            if file.metadata()?.len() > info.size {
                file.set_len(info.size)?;
            }
            drop(file);
            self.apply_metadata(ctx, target, info)?;
        }
        Ok(complete)
    }

    fn apply_metadata(&self, ctx: &OpContext<'_>, target: &Path, info: &FileInfo) -> Result<()> {
        fsx::apply_permissions(target, info.permissions)?;
        let user_id = ctx.job.options.owner.user_id.unwrap_or(info.user_id);
        let group_id = ctx.job.options.owner.group_id.unwrap_or(info.group_id);
        if let Err(error) = fsx::apply_owner(target, user_id, group_id) {
            // Only root may chown; everyone else keeps their own ownership.
            log::warn!(
                "Warning: cannot set owner of '{}' (error: {})",
                target.display(),
                error
            );
        }
        fsx::apply_times(target, info)?;
        Ok(())
    }
}

impl EntryVisitor for RestoreVisitor {
    fn operation(&self) -> &'static str {
        "Restore"
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
        let target = self.destination_for(ctx, path);
        self.restore_fragment(
            ctx,
            reader,
            header,
            path,
            &target,
            info,
            fragment.offset,
            fragment.size,
        )?;
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

        // Images restore to the destination directory under their base
        // name, or back onto the device path itself.
        let destination = ctx.job.options.destination.as_deref();
        let target = match destination {
            Some(dest) => {
                let base = Path::new(device_path)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("image"));
                dest.join(base)
            }
            None => PathBuf::from(device_path),
        };

        if ctx.range_exists(device_path, fragment.offset, fragment.size) {
            log::warn!(
                "Warning: fragment [{}, +{}) of '{device_path}' already restored",
                fragment.offset,
                fragment.size
            );
            self.drain_only(ctx, reader, header)?;
            return Ok(());
        }
        // Writing back onto the device node itself always hits an existing
        // path; the existence gate applies to the destination-file case.
        let first_fragment = {
            let ledger = ctx.ledger.lock().unwrap_or_else(|p| p.into_inner());
            ledger.find(device_path).is_none()
        };
        if destination.is_some()
            && first_fragment
            && target.exists()
            && !ctx.job.options.overwrite_files
        {
            log::warn!("Warning: '{}' exists, not overwritten", target.display());
            self.drain_only(ctx, reader, header)?;
            return Ok(());
        }

        if ctx.job.options.dry_run {
            self.drain_only(ctx, reader, header)?;
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&target)?;

        let name = device_path.clone();
        let kind = header.kind();
        let block_size64 = u64::from(*block_size);
        with_body(ctx, reader, header, |cursor, params| {
            let mut buf = vec![0u8; block_size_u];
            for block_index in 0..fragment.size {
                ctx.job.control.checkpoint()?;
                let mut filled = 0;
                while filled < block_size_u {
                    let n = cursor.read_data(&mut buf[filled..])?;
                    if n == 0 {
                        return Err(Error::InvalidFormat(format!(
                            "image '{name}' body ends short in block {block_index}"
                        )));
                    }
                    filled += n;
                }
                let byte_offset = (fragment.offset + block_index) * block_size64;
                if buf.iter().all(|&b| b == 0) {
                    // All-zero blocks become holes.
                    file.seek(SeekFrom::Start(byte_offset + block_size64))?;
                } else {
                    file.seek(SeekFrom::Start(byte_offset))?;
                    file.write_all(&buf)?;
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
        let complete =
            ctx.record_fragment(device_path, total_blocks, fragment.offset, fragment.size, true);
        if complete && file.metadata()?.len() < *total_size {
            // Extend to full device size so trailing holes exist.
            file.set_len(*total_size)?;
        }
        Ok(())
    }

    fn on_directory(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::Directory { path, info } = header else {
            unreachable!("dispatched on kind");
        };
        reader.skip_data()?;
        if ctx.job.options.dry_run {
            return Ok(());
        }
        let target = self.destination_for(ctx, path);
        if !target.exists() {
            std::fs::create_dir_all(&target)?;
        } else if !target.is_dir() {
            return Err(Error::WrongEntryType { name: path.clone() });
        }
        self.apply_metadata(ctx, &target, info)?;
        Ok(())
    }

    fn on_link(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::Link { path, target, info } = header else {
            unreachable!("dispatched on kind");
        };
        reader.skip_data()?;
        if ctx.job.options.dry_run {
            return Ok(());
        }
        let link_path = self.destination_for(ctx, path);
        if link_path.symlink_metadata().is_ok() {
            if !ctx.job.options.overwrite_files {
                log::warn!("Warning: '{}' exists, not overwritten", link_path.display());
                return Ok(());
            }
            std::fs::remove_file(&link_path)?;
        }
        if let Some(parent) = link_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        fsx::create_symlink(&link_path, Path::new(target))?;
        let user_id = ctx.job.options.owner.user_id.unwrap_or(info.user_id);
        let group_id = ctx.job.options.owner.group_id.unwrap_or(info.group_id);
        if let Err(error) = fsx::apply_owner(&link_path, user_id, group_id) {
            log::warn!(
                "Warning: cannot set owner of '{}' (error: {})",
                link_path.display(),
                error
            );
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
        let target = self.destination_for(ctx, first);
        let complete = self.restore_fragment(
            ctx,
            reader,
            header,
            first,
            &target,
            info,
            fragment.offset,
            fragment.size,
        )?;
        if complete && !ctx.job.options.dry_run {
            for other in &paths[1..] {
                let link = self.destination_for(ctx, other);
                if link.symlink_metadata().is_ok() {
                    if !ctx.job.options.overwrite_files {
                        log::warn!("Warning: '{}' exists, not overwritten", link.display());
                        continue;
                    }
                    std::fs::remove_file(&link)?;
                }
                if let Some(parent) = link.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::hard_link(&target, &link)?;
            }
        }
        Ok(())
    }

    fn on_special(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let EntryHeader::Special { path, info } = header else {
            unreachable!("dispatched on kind");
        };
        reader.skip_data()?;
        if ctx.job.options.dry_run {
            return Ok(());
        }
        let target = self.destination_for(ctx, path);
        if target.symlink_metadata().is_ok() {
            if !ctx.job.options.overwrite_files {
                log::warn!("Warning: '{}' exists, not overwritten", target.display());
                return Ok(());
            }
            std::fs::remove_file(&target)?;
        }
        let Some(kind) = info.special else {
            return Err(Error::WrongEntryType { name: path.clone() });
        };
        if kind == SpecialKind::Socket {
            log::warn!("Warning: cannot restore socket '{path}', skipped");
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        fsx::create_special(&target, kind, info.permissions)?;
        self.apply_metadata(ctx, &target, info)?;
        Ok(())
    }
}
