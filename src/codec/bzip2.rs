//! BZip2 codec (levels 1-9).

use bzip2::{Action, Compress, Compression, Decompress, Status};

use super::{CodecDirection, Step};
use crate::ringbuf::RingBuffer;
use crate::{Error, Result};

enum Bzip2Inner {
    Deflate(Compress),
    Inflate(Decompress),
}

/// Streaming state for one bzip2 direction.
pub(crate) struct Bzip2State {
    inner: Bzip2Inner,
}

impl Bzip2State {
    pub(crate) fn new(level: u8, direction: CodecDirection) -> Self {
        let inner = match direction {
            CodecDirection::Deflate => {
                Bzip2Inner::Deflate(Compress::new(Compression::new(u32::from(level)), 30))
            }
            CodecDirection::Inflate => Bzip2Inner::Inflate(Decompress::new(false)),
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
            Bzip2Inner::Deflate(c) => {
                let before_in = c.total_in();
                let before_out = c.total_out();
                let action = if flush { Action::Finish } else { Action::Run };
                let status = {
                    let dst = output.writable();
                    if dst.is_empty() {
                        return Ok(Step {
                            progress: false,
                            end: false,
                        });
                    }
                    c.compress(input.readable(), dst, action)
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
            Bzip2Inner::Inflate(d) => {
                let before_in = d.total_in();
                let before_out = d.total_out();
                let status = {
                    let dst = output.writable();
                    if dst.is_empty() {
                        return Ok(Step {
                            progress: false,
                            end: false,
                        });
                    }
                    d.decompress(input.readable(), dst)
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
