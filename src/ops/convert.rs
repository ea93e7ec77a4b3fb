//! Convert operation: rewrite archives with different compression and
//! encryption parameters.
//!
//! Bytes flow through a decode stack and an encode stack wired
//! back-to-back; the filesystem is never touched. Each source archive is
//! rewritten into a temporary file which is then persisted under the
//! original storage name.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{
    EntryVisitor, FailTracker, Job, OpContext, check_signatures, enumerate_archives,
    fragments_check, run_archive_parallel, with_body,
};
use crate::archive::entry::{EntryHeader, MetaPayload};
use crate::archive::read::{ArchiveReader, TRANSFER_BUFFER_SIZE};
use crate::archive::write::ArchiveWriter;
use crate::codec::CompressAlgorithm;
use crate::codec::stack::StackParams;
use crate::crypto::{CryptMode, PasswordUse, salt_for};
use crate::fragment::FragmentLedger;
use crate::source::SourceResolver;
use crate::storage::{self, StorageSpecifier, StorageWriter};
use crate::{Error, Result};

/// Converts every archive matched by the given storage names, re-encoding
/// entry data with the job's compression/encryption parameters.
pub fn convert(job: &Job, storage_names: &[String]) -> Result<()> {
    job.control.reset_stop();
    let ledger = Mutex::new(FragmentLedger::new());
    let resolver = SourceResolver::new(
        job.delta_sources.clone(),
        Arc::clone(&job.storage),
        job.password.clone(),
        job.options.temp_directory.clone(),
    );
    let fail = FailTracker::new();

    'names: for name in storage_names {
        let specs = match enumerate_archives(job, name) {
            Ok(specs) => specs,
            Err(error) => {
                log::error!("open storage '{name}' (error: {error})");
                fail.record(error);
                if job.options.stop_on_error {
                    break;
                }
                continue;
            }
        };
        for spec in specs {
            if job.control.should_stop() {
                break 'names;
            }
            let printable = spec.printable_name(None);
            log::info!("Convert archive '{printable}'");

            if let Err(error) = check_signatures(job, &spec) {
                log::error!("verify signatures '{printable}' (error: {error})");
                fail.record(error);
                if job.options.stop_on_error {
                    break 'names;
                }
                continue;
            }

            if let Err(error) = convert_archive(job, &ledger, &resolver, &fail, &spec) {
                match error {
                    Error::Aborted => break 'names,
                    other => {
                        log::error!("convert archive '{printable}' (error: {other})");
                        fail.record(other);
                        if job.options.stop_on_error {
                            break 'names;
                        }
                    }
                }
            }
        }
    }

    fragments_check(job, &ledger, &fail);
    fail.into_result()
}

/// StorageWriter over a scratch file.
struct TempWriter {
    file: std::fs::File,
}

impl StorageWriter for TempWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

fn convert_archive(
    job: &Job,
    ledger: &Mutex<FragmentLedger>,
    resolver: &SourceResolver,
    fail: &FailTracker,
    spec: &StorageSpecifier,
) -> Result<()> {
    let scratch =
        storage::get_tmp_file_name("barc-convert-", job.options.temp_directory.as_deref())?;
    let mut writer = ArchiveWriter::create(Box::new(TempWriter {
        file: scratch.reopen()?,
    }))?;
    writer.write_meta(&MetaPayload {
        created: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        host_name: job.host_name.clone(),
        job_name: job.job_name.clone(),
    })?;

    let visitor = ConvertVisitor {
        writer: Mutex::new(writer),
    };
    run_archive_parallel(job, ledger, resolver, fail, spec, &visitor)?;

    let mut writer = visitor
        .writer
        .into_inner()
        .unwrap_or_else(|p| p.into_inner());
    writer.write_signature()?;
    writer.finish()?;

    if job.control.should_stop() {
        return Ok(());
    }

    // Persist the rewritten archive under the original name.
    let mut source_file = scratch.reopen()?;
    use std::io::Seek;
    source_file.seek(std::io::SeekFrom::Start(0))?;
    let mut out = job.storage.open_write(spec, source_file.metadata()?.len())?;
    let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
    loop {
        let n = source_file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write(&buf[..n])?;
    }
    out.close()?;
    Ok(())
}

struct ConvertVisitor {
    writer: Mutex<ArchiveWriter>,
}

impl ConvertVisitor {
    fn new_params(&self, ctx: &OpContext<'_>) -> Result<StackParams> {
        Ok(StackParams {
            compress: ctx.job.options.compress,
            delta: CompressAlgorithm::None,
            crypt: ctx.job.options.crypt,
            salt: salt_for(ctx.job.options.crypt)?,
        })
    }

    /// Decodes one body completely, then re-encodes it under the writer
    /// lock with the job's parameters.
    fn reencode(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        let expected = match header {
            EntryHeader::Image {
                block_size,
                fragment,
                ..
            } => fragment.size * u64::from(*block_size),
            other => other.fragment().map_or(0, |f| f.size),
        };
        let name = header.name().to_string();
        let decoded = with_body(ctx, reader, header, |cursor, _params| {
            let mut out = Vec::with_capacity(expected.min(1 << 20) as usize);
            let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
            while (out.len() as u64) < expected {
                ctx.job.control.checkpoint()?;
                let want = ((expected - out.len() as u64) as usize).min(TRANSFER_BUFFER_SIZE);
                let n = cursor.read_data(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::InvalidFormat(format!(
                        "entry '{name}' body ends short at {} of {expected} bytes",
                        out.len()
                    )));
                }
                out.extend_from_slice(&buf[..n]);
            }
            Ok(out)
        })?;

        let mut new_params = self.new_params(ctx)?;
        let mut delta_source_name = None;
        let mut source = None;
        if ctx.job.options.delta != CompressAlgorithm::None {
            let fallback = match header {
                EntryHeader::File { delta_source, .. }
                | EntryHeader::HardLink { delta_source, .. } => delta_source.as_deref(),
                _ => None,
            };
            match ctx.resolver.open_source(header.name(), fallback) {
                Ok((handle, from)) => {
                    new_params.delta = ctx.job.options.delta;
                    delta_source_name = Some(from);
                    source = Some(handle);
                }
                Err(error) => {
                    log::warn!(
                        "Warning: no delta source for '{}' ({error}), storing plain",
                        header.name()
                    );
                }
            }
        }

        let new_header = match header.clone() {
            EntryHeader::File {
                path,
                info,
                fragment,
                ..
            } => EntryHeader::File {
                path,
                info,
                params: new_params,
                fragment,
                delta_source: delta_source_name,
            },
            EntryHeader::HardLink {
                paths,
                info,
                fragment,
                ..
            } => EntryHeader::HardLink {
                paths,
                info,
                params: new_params,
                fragment,
                delta_source: delta_source_name,
            },
            EntryHeader::Image {
                device_path,
                total_size,
                block_size,
                fragment,
                file_system,
                ..
            } => EntryHeader::Image {
                device_path,
                total_size,
                block_size,
                fragment,
                file_system,
                params: new_params,
            },
            other => other,
        };

        let password = if new_params.crypt == CryptMode::None {
            None
        } else {
            ctx.job.password_for(PasswordUse::Encrypt, header.name())
        };
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let mut cursor = writer.new_entry(&new_header, password.as_ref(), source)?;
        match cursor.write_data(&decoded) {
            Ok(()) => cursor.close()?,
            Err(error) => {
                cursor.abort();
                return Err(error);
            }
        }
        Ok(())
    }

    fn copy_bodyless(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        reader.skip_data()?;
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let cursor = writer.new_entry(header, None, None)?;
        cursor.close()
    }
}

impl EntryVisitor for ConvertVisitor {
    fn operation(&self) -> &'static str {
        "Convert"
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
        self.reencode(ctx, reader, header)?;
        ctx.record_fragment(path, info.size, fragment.offset, fragment.size, true);
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
        self.reencode(ctx, reader, header)?;
        let total_blocks = total_size.div_ceil(u64::from(*block_size));
        ctx.record_fragment(device_path, total_blocks, fragment.offset, fragment.size, true);
        Ok(())
    }

    fn on_directory(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        self.copy_bodyless(ctx, reader, header)
    }

    fn on_link(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        self.copy_bodyless(ctx, reader, header)
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
        self.reencode(ctx, reader, header)?;
        if let Some(first) = paths.first() {
            ctx.record_fragment(first, info.size, fragment.offset, fragment.size, true);
        }
        Ok(())
    }

    fn on_special(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()> {
        self.copy_bodyless(ctx, reader, header)
    }
}
