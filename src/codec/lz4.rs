//! LZ4 codec (levels 0-16), block-framed.
//!
//! Raw input is cut into 64 KiB blocks; each block is compressed with the
//! LZ4 block format and framed with the 4-byte header of
//! [`framing`](super::framing). A block the compressor cannot shrink is
//! stored verbatim with the compressed flag clear, so one block's framed
//! payload never exceeds one raw block.

use super::framing::{BLOCK_SIZE, BlockHeader};
use super::{CodecDirection, Step};
use crate::ringbuf::RingBuffer;
use crate::{Error, Result};

pub(crate) struct Lz4State {
    direction: CodecDirection,
    block: Vec<u8>,
    pending_header: Option<BlockHeader>,
    out: Vec<u8>,
    out_pos: usize,
    finished: bool,
}

impl Lz4State {
    pub(crate) fn new(_level: u8, direction: CodecDirection) -> Self {
        Self {
            direction,
            block: Vec::with_capacity(BLOCK_SIZE),
            pending_header: None,
            out: Vec::new(),
            out_pos: 0,
            finished: false,
        }
    }

    pub(crate) fn step(
        &mut self,
        input: &mut RingBuffer,
        output: &mut RingBuffer,
        flush: bool,
    ) -> Result<Step> {
        let mut progress = match self.direction {
            CodecDirection::Deflate => self.step_deflate(input, flush)?,
            CodecDirection::Inflate => self.step_inflate(input)?,
        };

        while self.out_pos < self.out.len() && output.free() > 0 {
            let n = output.write(&self.out[self.out_pos..]);
            self.out_pos += n;
            progress = progress || n > 0;
            if n == 0 {
                break;
            }
        }
        if self.out_pos == self.out.len() && !self.out.is_empty() {
            self.out.clear();
            self.out_pos = 0;
        }

        Ok(Step {
            progress,
            end: self.finished && self.out_pos == self.out.len(),
        })
    }

    fn step_deflate(&mut self, input: &mut RingBuffer, flush: bool) -> Result<bool> {
        let mut progress = false;

        while self.block.len() < BLOCK_SIZE && !input.is_empty() {
            let need = BLOCK_SIZE - self.block.len();
            let src = input.readable();
            let n = src.len().min(need);
            self.block.extend_from_slice(&src[..n]);
            input.advance_read(n);
            progress = true;
        }

        if self.block.len() == BLOCK_SIZE {
            let last = flush && input.is_empty();
            self.emit_block(last)?;
            self.finished = last;
            progress = true;
        } else if flush && input.is_empty() && !self.finished {
            // Final short (possibly empty) block.
            self.emit_block(true)?;
            self.finished = true;
            progress = true;
        }

        Ok(progress)
    }

    fn emit_block(&mut self, last: bool) -> Result<()> {
        if self.block.is_empty() {
            let header = BlockHeader {
                length: 0,
                compressed: false,
                end_of_data: last,
            };
            self.out.extend_from_slice(&header.encode()?);
            return Ok(());
        }

        let bound = lz4_flex::block::get_maximum_output_size(self.block.len());
        let mut scratch = vec![0u8; bound];
        let compressed_len = lz4_flex::block::compress_into(&self.block, &mut scratch)
            .map_err(|e| Error::DeflateFail {
                code: -1,
                reason: e.to_string(),
            })?;

        if compressed_len < self.block.len() {
            let header = BlockHeader {
                length: compressed_len as u32,
                compressed: true,
                end_of_data: last,
            };
            self.out.extend_from_slice(&header.encode()?);
            self.out.extend_from_slice(&scratch[..compressed_len]);
        } else {
            // Store verbatim when compression does not shrink the block.
            let header = BlockHeader {
                length: self.block.len() as u32,
                compressed: false,
                end_of_data: last,
            };
            self.out.extend_from_slice(&header.encode()?);
            self.out.extend_from_slice(&self.block);
        }
        self.block.clear();
        Ok(())
    }

    fn step_inflate(&mut self, input: &mut RingBuffer) -> Result<bool> {
        let mut progress = false;

        if self.finished {
            return Ok(false);
        }

        if self.pending_header.is_none() && input.len() >= 4 {
            let mut raw = [0u8; 4];
            input.read(&mut raw);
            self.pending_header = Some(BlockHeader::decode(raw, BLOCK_SIZE)?);
            self.block.clear();
            progress = true;
        }

        if let Some(header) = self.pending_header {
            let want = header.length as usize;
            while self.block.len() < want && !input.is_empty() {
                let need = want - self.block.len();
                let src = input.readable();
                let n = src.len().min(need);
                self.block.extend_from_slice(&src[..n]);
                input.advance_read(n);
                progress = true;
            }

            if self.block.len() == want {
                if header.compressed {
                    let mut scratch = vec![0u8; BLOCK_SIZE];
                    let n = lz4_flex::block::decompress_into(&self.block, &mut scratch)
                        .map_err(|e| Error::InflateFail {
                            code: -1,
                            reason: e.to_string(),
                        })?;
                    self.out.extend_from_slice(&scratch[..n]);
                } else {
                    self.out.extend_from_slice(&self.block);
                }
                if header.end_of_data {
                    self.finished = true;
                }
                self.block.clear();
                self.pending_header = None;
                progress = true;
            }
        }

        Ok(progress)
    }
}
