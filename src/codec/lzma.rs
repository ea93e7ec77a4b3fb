//! LZMA codec (levels 1-9).
//!
//! The LZMA library exposes reader/writer adapters rather than a push-style
//! stream, so this state stages one entry fragment through an owned buffer
//! and transforms it when the stream is flushed. Codec streams live for a
//! single entry; the staging window is bounded by the fragment size.
//!
//! The stream layout is a 13-byte prelude (properties byte, little-endian
//! dictionary size, little-endian raw length) followed by the raw LZMA
//! stream with end marker.

use std::io::{Cursor, Read, Write};

use super::{CodecDirection, Step};
use crate::ringbuf::RingBuffer;
use crate::{Error, Result};

const PRELUDE_LEN: usize = 13;

pub(crate) struct LzmaState {
    preset: u32,
    direction: CodecDirection,
    staging: Vec<u8>,
    result: Vec<u8>,
    result_pos: usize,
    transformed: bool,
}

impl LzmaState {
    pub(crate) fn new(level: u8, direction: CodecDirection) -> Self {
        Self {
            preset: u32::from(level),
            direction,
            staging: Vec::new(),
            result: Vec::new(),
            result_pos: 0,
            transformed: false,
        }
    }

    pub(crate) fn step(
        &mut self,
        input: &mut RingBuffer,
        output: &mut RingBuffer,
        flush: bool,
    ) -> Result<Step> {
        let mut progress = false;

        while !input.is_empty() {
            self.staging.extend_from_slice(input.readable());
            let n = input.readable().len();
            input.advance_read(n);
            progress = true;
        }

        if flush && !self.transformed {
            self.result = match self.direction {
                CodecDirection::Deflate => encode(&self.staging, self.preset)?,
                CodecDirection::Inflate => decode(&self.staging)?,
            };
            self.staging = Vec::new();
            self.transformed = true;
            progress = true;
        }

        while self.result_pos < self.result.len() && output.free() > 0 {
            let n = output.write(&self.result[self.result_pos..]);
            self.result_pos += n;
            progress = n > 0 || progress;
            if n == 0 {
                break;
            }
        }

        Ok(Step {
            progress,
            end: self.transformed && self.result_pos == self.result.len(),
        })
    }
}

fn encode(raw: &[u8], preset: u32) -> Result<Vec<u8>> {
    let opts = lzma_rust2::LzmaOptions::with_preset(preset);

    let mut body: Vec<u8> = Vec::new();
    {
        let mut writer = lzma_rust2::LzmaWriter::new_no_header(&mut body, &opts, true)
            .map_err(|e| Error::InitCompress {
                reason: e.to_string(),
            })?;
        writer.write_all(raw).map_err(|e| Error::DeflateFail {
            code: -1,
            reason: e.to_string(),
        })?;
        let _ = writer.finish().map_err(|e| Error::DeflateFail {
            code: -1,
            reason: e.to_string(),
        })?;
    }

    let mut out = Vec::with_capacity(PRELUDE_LEN + body.len());
    out.push(opts.get_props());
    out.extend_from_slice(&opts.dict_size.to_le_bytes());
    out.extend_from_slice(&(raw.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode(compressed: &[u8]) -> Result<Vec<u8>> {
    if compressed.len() < PRELUDE_LEN {
        return Err(Error::InflateFail {
            code: -1,
            reason: "truncated lzma prelude".into(),
        });
    }
    let props = compressed[0];
    let dict_size = u32::from_le_bytes(
        compressed[1..5]
            .try_into()
            .map_err(|_| Error::InflateFail {
                code: -1,
                reason: "truncated lzma prelude".into(),
            })?,
    );
    let raw_len = u64::from_le_bytes(
        compressed[5..PRELUDE_LEN]
            .try_into()
            .map_err(|_| Error::InflateFail {
                code: -1,
                reason: "truncated lzma prelude".into(),
            })?,
    );

    let cursor = Cursor::new(&compressed[PRELUDE_LEN..]);
    let mut reader = lzma_rust2::LzmaReader::new_with_props(cursor, raw_len, props, dict_size, None)
        .map_err(|e| Error::InitDecompress {
            reason: e.to_string(),
        })?;

    let mut out = Vec::with_capacity(raw_len.min(1 << 20) as usize);
    reader.read_to_end(&mut out).map_err(|e| Error::InflateFail {
        code: -1,
        reason: e.to_string(),
    })?;
    Ok(out)
}
