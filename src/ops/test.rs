//! Test operation: read every entry body and verify the stream decodes
//! end-to-end; nothing touches the filesystem.

use super::{EntryVisitor, Job, OpContext, run_read_operation, warn_unexpected_tail, with_body};
use crate::archive::entry::EntryHeader;
use crate::archive::read::{ArchiveReader, TRANSFER_BUFFER_SIZE};
use crate::{Error, Result};

/// Tests every selected entry of the given archives.
///
/// Each body is decompressed/decrypted and discarded; fragment coverage is
/// reconciled at the end of the operation.
pub fn test(job: &Job, storage_names: &[String]) -> Result<()> {
    run_read_operation(job, storage_names, &TestVisitor, false)
}

struct TestVisitor;

impl TestVisitor {
    fn drain_body(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
        expected: u64,
    ) -> Result<()> {
        let name = header.name().to_string();
        let kind = header.kind();
        with_body(ctx, reader, header, |cursor, params| {
            let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
            let mut produced = 0u64;
            while produced < expected {
                ctx.job.control.checkpoint()?;
                let want = ((expected - produced) as usize).min(TRANSFER_BUFFER_SIZE);
                let n = cursor.read_data(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::InvalidFormat(format!(
                        "entry '{name}' body has {produced} bytes, header claims {expected}"
                    )));
                }
                produced += n as u64;
                let percent = ((produced.min(expected) * 100) / expected) as u8;
                ctx.job.progress.entry_step(percent);
            }
            warn_unexpected_tail(params, cursor, kind, &name);
            Ok(())
        })
    }
}

impl EntryVisitor for TestVisitor {
    fn operation(&self) -> &'static str {
        "Test"
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
        self.drain_body(ctx, reader, header, fragment.size)?;
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
        if *block_size as usize > TRANSFER_BUFFER_SIZE {
            return Err(Error::InvalidDeviceBlockSize {
                block_size: *block_size,
                buffer_size: TRANSFER_BUFFER_SIZE,
            });
        }
        let expected = fragment.size * u64::from(*block_size);
        self.drain_body(ctx, reader, header, expected)?;
        let total_blocks = total_size.div_ceil(u64::from(*block_size));
        ctx.record_fragment(device_path, total_blocks, fragment.offset, fragment.size, false);
        Ok(())
    }

    fn on_directory(
        &self,
        _ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        _header: &EntryHeader,
    ) -> Result<()> {
        reader.skip_data()
    }

    fn on_link(
        &self,
        _ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        _header: &EntryHeader,
    ) -> Result<()> {
        reader.skip_data()
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
        self.drain_body(ctx, reader, header, fragment.size)?;
        if let Some(first) = paths.first() {
            ctx.record_fragment(first, info.size, fragment.offset, fragment.size, false);
        }
        Ok(())
    }

    fn on_special(
        &self,
        _ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        _header: &EntryHeader,
    ) -> Result<()> {
        reader.skip_data()
    }
}
