//! Deflate-family codec (zip levels 0-9).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::{CodecDirection, Step};
use crate::ringbuf::RingBuffer;
use crate::{Error, Result};

enum ZipInner {
    Deflate(Compress),
    Inflate(Decompress),
}

/// Streaming state for one zip-family direction.
///
/// The underlying library drives flushing; a buffer-error status is
/// progress-without-completion and never fatal.
pub(crate) struct ZipState {
    inner: ZipInner,
}

impl ZipState {
    pub(crate) fn new(level: u8, direction: CodecDirection) -> Self {
        let inner = match direction {
            CodecDirection::Deflate => {
                ZipInner::Deflate(Compress::new(Compression::new(u32::from(level)), false))
            }
            CodecDirection::Inflate => ZipInner::Inflate(Decompress::new(false)),
        };
        Self { inner }
    }

    pub(crate) fn step(
        &mut self,
        input: &mut RingBuffer,
        output: &mut RingBuffer,
        flush: bool,
    ) -> Result<Step> {
        match &mut self.inner {
            ZipInner::Deflate(c) => {
                let before_in = c.total_in();
                let before_out = c.total_out();
                let mode = if flush {
                    FlushCompress::Finish
                } else {
                    FlushCompress::None
                };
                let status = {
                    let dst = output.writable();
                    if dst.is_empty() {
                        return Ok(Step {
                            progress: false,
                            end: false,
                        });
                    }
                    c.compress(input.readable(), dst, mode)
                        .map_err(|e| Error::DeflateFail {
                            code: -1,
                            reason: e.to_string(),
                        })?
                };
                let consumed = (c.total_in() - before_in) as usize;
                let produced = (c.total_out() - before_out) as usize;
                input.advance_read(consumed);
                output.advance_write(produced);
                Ok(Step {
                    progress: consumed > 0 || produced > 0,
                    end: matches!(status, Status::StreamEnd),
                })
            }
            ZipInner::Inflate(d) => {
                let before_in = d.total_in();
                let before_out = d.total_out();
                let mode = if flush {
                    FlushDecompress::Finish
                } else {
                    FlushDecompress::None
                };
                let status = {
                    let dst = output.writable();
                    if dst.is_empty() {
                        return Ok(Step {
                            progress: false,
                            end: false,
                        });
                    }
                    d.decompress(input.readable(), dst, mode)
                        .map_err(|e| Error::InflateFail {
                            code: -1,
                            reason: e.to_string(),
                        })?
                };
                let consumed = (d.total_in() - before_in) as usize;
                let produced = (d.total_out() - before_out) as usize;
                input.advance_read(consumed);
                output.advance_write(produced);
                Ok(Step {
                    progress: consumed > 0 || produced > 0,
                    end: matches!(status, Status::StreamEnd),
                })
            }
        }
    }
}
