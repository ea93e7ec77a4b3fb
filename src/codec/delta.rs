//! Delta codec (levels 1-9): block-match compression against a source
//! stream.
//!
//! The encoder builds a block signature of the source (rolling weak hash
//! plus a truncated SHA-256 strong hash per block), scans the target with
//! the rolling hash, and emits copy/literal ops; the decoder replays the
//! ops, pulling copy ranges back out of the source through the same
//! callback interface. The level selects the signature block size.
//!
//! Op stream: `0x01` literal (u32 length, bytes), `0x02` copy (u64 source
//! offset, u32 length), `0x00` end marker.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{CodecDirection, Step};
use crate::ringbuf::RingBuffer;
use crate::{Error, Result};

const OP_END: u8 = 0x00;
const OP_LITERAL: u8 = 0x01;
const OP_COPY: u8 = 0x02;

/// Scratch size for materializing copy ranges on decode.
const COPY_CHUNK: usize = 64 * 1024;

/// Random access into the delta source stream.
///
/// The callback is invoked lazily as the codec requests blocks; a short
/// return count means the source ended inside the window.
pub trait DeltaSource: Send + Sync {
    /// Total size of the source stream in bytes.
    fn size(&self) -> Result<u64>;

    /// Reads bytes starting at `offset` into `out`, returning the count
    /// actually read (0 at end of source).
    fn get_block(&self, offset: u64, out: &mut [u8]) -> Result<usize>;
}

impl std::fmt::Debug for dyn DeltaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn DeltaSource")
    }
}

/// An in-memory delta source, used by tests and by convert.
pub struct SliceSource(pub Vec<u8>);

impl DeltaSource for SliceSource {
    fn size(&self) -> Result<u64> {
        Ok(self.0.len() as u64)
    }

    fn get_block(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let off = usize::try_from(offset).unwrap_or(usize::MAX);
        if off >= self.0.len() {
            return Ok(0);
        }
        let n = out.len().min(self.0.len() - off);
        out[..n].copy_from_slice(&self.0[off..off + n]);
        Ok(n)
    }
}

/// Signature block size for a delta level (512 bytes at level 1 doubling
/// up to 128 KiB at level 9).
fn block_size_for_level(level: u8) -> usize {
    512usize << (level.clamp(1, 9) - 1)
}

type StrongHash = [u8; 8];

struct Signature {
    block_size: usize,
    blocks: HashMap<u32, Vec<(u64, StrongHash)>>,
}

impl Signature {
    fn build(source: &dyn DeltaSource, block_size: usize) -> Result<Self> {
        let size = source.size()?;
        let mut blocks: HashMap<u32, Vec<(u64, StrongHash)>> = HashMap::new();
        let mut buf = vec![0u8; block_size];
        let mut offset = 0u64;
        while offset + block_size as u64 <= size {
            let n = read_full(source, offset, &mut buf)?;
            if n < block_size {
                break;
            }
            let weak = weak_hash(&buf);
            blocks.entry(weak).or_default().push((offset, strong_hash(&buf)));
            offset += block_size as u64;
        }
        Ok(Self { block_size, blocks })
    }

    fn lookup(&self, weak: u32, window: &[u8]) -> Option<u64> {
        let candidates = self.blocks.get(&weak)?;
        let strong = strong_hash(window);
        candidates
            .iter()
            .find(|(_, s)| *s == strong)
            .map(|(off, _)| *off)
    }
}

fn read_full(source: &dyn DeltaSource, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.get_block(offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn strong_hash(data: &[u8]) -> StrongHash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

fn weak_hash(data: &[u8]) -> u32 {
    let mut a = 0u32;
    let mut b = 0u32;
    let len = data.len() as u32;
    for (i, &x) in data.iter().enumerate() {
        a = a.wrapping_add(u32::from(x));
        b = b.wrapping_add((len - i as u32).wrapping_mul(u32::from(x)));
    }
    (a & 0xffff) | ((b & 0xffff) << 16)
}

struct RollingHash {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingHash {
    fn new(window: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        let len = window.len() as u32;
        for (i, &x) in window.iter().enumerate() {
            a = a.wrapping_add(u32::from(x));
            b = b.wrapping_add((len - i as u32).wrapping_mul(u32::from(x)));
        }
        Self { a, b, len }
    }

    fn roll(&mut self, out_byte: u8, in_byte: u8) {
        self.a = self
            .a
            .wrapping_sub(u32::from(out_byte))
            .wrapping_add(u32::from(in_byte));
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(u32::from(out_byte)))
            .wrapping_add(self.a);
    }

    fn value(&self) -> u32 {
        (self.a & 0xffff) | ((self.b & 0xffff) << 16)
    }
}

pub(crate) struct DeltaState {
    direction: CodecDirection,
    block_size: usize,
    source: Arc<dyn DeltaSource>,
    signature: Option<Signature>,
    // Deflate side: accumulated target, encoded ops waiting to drain.
    window: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    finished: bool,
    // Inflate side: undecoded op bytes.
    pending: Vec<u8>,
}

impl DeltaState {
    pub(crate) fn new(
        level: u8,
        direction: CodecDirection,
        source: Arc<dyn DeltaSource>,
    ) -> Result<Self> {
        Ok(Self {
            direction,
            block_size: block_size_for_level(level),
            source,
            signature: None,
            window: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            finished: false,
            pending: Vec::new(),
        })
    }

    pub(crate) fn step(
        &mut self,
        input: &mut RingBuffer,
        output: &mut RingBuffer,
        flush: bool,
    ) -> Result<Step> {
        let mut progress = false;

        while !input.is_empty() {
            let src = input.readable();
            match self.direction {
                CodecDirection::Deflate => self.window.extend_from_slice(src),
                CodecDirection::Inflate => self.pending.extend_from_slice(src),
            }
            let n = src.len();
            input.advance_read(n);
            progress = true;
        }

        if flush && !self.finished {
            match self.direction {
                CodecDirection::Deflate => self.encode_window()?,
                CodecDirection::Inflate => self.decode_ops()?,
            }
            self.finished = true;
            progress = true;
        }

        while self.out_pos < self.out.len() && output.free() > 0 {
            let n = output.write(&self.out[self.out_pos..]);
            self.out_pos += n;
            progress = progress || n > 0;
            if n == 0 {
                break;
            }
        }

        Ok(Step {
            progress,
            end: self.finished && self.out_pos == self.out.len(),
        })
    }

    fn encode_window(&mut self) -> Result<()> {
        if self.signature.is_none() {
            self.signature = Some(Signature::build(self.source.as_ref(), self.block_size)?);
        }
        let signature = self.signature.as_ref().expect("signature was just built");
        let window = std::mem::take(&mut self.window);
        let block = self.block_size;

        let mut lit_start = 0usize;
        if window.len() >= block && !signature.blocks.is_empty() {
            let mut i = 0usize;
            let mut hash = RollingHash::new(&window[..block]);
            loop {
                if let Some(src_offset) = signature.lookup(hash.value(), &window[i..i + block]) {
                    emit_literal(&mut self.out, &window[lit_start..i])?;
                    emit_copy(&mut self.out, src_offset, block as u32);
                    i += block;
                    lit_start = i;
                    if i + block > window.len() {
                        break;
                    }
                    hash = RollingHash::new(&window[i..i + block]);
                } else {
                    if i + block >= window.len() {
                        break;
                    }
                    hash.roll(window[i], window[i + block]);
                    i += 1;
                }
            }
        }
        emit_literal(&mut self.out, &window[lit_start..])?;
        self.out.push(OP_END);
        Ok(())
    }

    fn decode_ops(&mut self) -> Result<()> {
        let ops = std::mem::take(&mut self.pending);
        let mut pos = 0usize;
        let truncated = || Error::InflateFail {
            code: -1,
            reason: "truncated delta op stream".into(),
        };

        loop {
            let op = *ops.get(pos).ok_or_else(truncated)?;
            pos += 1;
            match op {
                OP_END => return Ok(()),
                OP_LITERAL => {
                    let len = read_u32(&ops, &mut pos).ok_or_else(truncated)? as usize;
                    let bytes = ops.get(pos..pos + len).ok_or_else(truncated)?;
                    self.out.extend_from_slice(bytes);
                    pos += len;
                }
                OP_COPY => {
                    let offset = read_u64(&ops, &mut pos).ok_or_else(truncated)?;
                    let len = read_u32(&ops, &mut pos).ok_or_else(truncated)? as u64;
                    self.copy_from_source(offset, len)?;
                }
                other => {
                    return Err(Error::InflateFail {
                        code: -1,
                        reason: format!("unknown delta op {other:#04x}"),
                    });
                }
            }
        }
    }

    fn copy_from_source(&mut self, offset: u64, len: u64) -> Result<()> {
        let mut remaining = len;
        let mut at = offset;
        let mut scratch = vec![0u8; COPY_CHUNK.min(len as usize).max(1)];
        while remaining > 0 {
            let want = scratch.len().min(remaining as usize);
            let n = read_full(self.source.as_ref(), at, &mut scratch[..want])?;
            if n == 0 {
                return Err(Error::InflateFail {
                    code: -1,
                    reason: format!("delta source ended at offset {at}"),
                });
            }
            self.out.extend_from_slice(&scratch[..n]);
            at += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }
}

fn emit_literal(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let len = u32::try_from(bytes.len()).map_err(|_| Error::DeflateFail {
        code: -1,
        reason: "delta literal too long".into(),
    })?;
    out.push(OP_LITERAL);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn emit_copy(out: &mut Vec<u8>, offset: u64, len: u32) {
    out.push(OP_COPY);
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(*pos..*pos + 4)?.try_into().ok()?;
    *pos += 4;
    Some(u32::from_be_bytes(bytes))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(*pos..*pos + 8)?.try_into().ok()?;
    *pos += 8;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecStream, CompressAlgorithm};

    fn round_trip(level: u8, source: &[u8], target: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let src: Arc<dyn DeltaSource> = Arc::new(SliceSource(source.to_vec()));

        let mut enc =
            CodecStream::new_deflate(CompressAlgorithm::Delta(level), Some(Arc::clone(&src)))
                .unwrap();
        let mut encoded = Vec::new();
        let mut fed = 0;
        while fed < target.len() {
            fed += enc.feed(&target[fed..]).unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let n = enc.drain(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                encoded.extend_from_slice(&buf[..n]);
            }
        }
        enc.flush().unwrap();
        loop {
            let mut buf = [0u8; 4096];
            let n = enc.drain(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            encoded.extend_from_slice(&buf[..n]);
        }
        assert!(enc.end_of_data());

        let mut dec = CodecStream::new_inflate(CompressAlgorithm::Delta(level), Some(src)).unwrap();
        let mut decoded = Vec::new();
        let mut fed = 0;
        while fed < encoded.len() {
            fed += dec.feed(&encoded[fed..]).unwrap();
        }
        dec.flush().unwrap();
        loop {
            let mut buf = [0u8; 4096];
            let n = dec.drain(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            decoded.extend_from_slice(&buf[..n]);
        }
        assert!(dec.end_of_data());

        (encoded, decoded)
    }

    #[test]
    fn identical_target_collapses_to_copies() {
        let source: Vec<u8> = (0..8192u32).flat_map(|i| i.to_le_bytes()).collect();
        let (encoded, decoded) = round_trip(1, &source, &source);
        assert_eq!(decoded, source);
        // Nothing but copy ops and the end marker: far smaller than the input.
        assert!(encoded.len() < source.len() / 8, "encoded {}", encoded.len());
    }

    #[test]
    fn modified_target_round_trips() {
        let source: Vec<u8> = (0..16384u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut target = source.clone();
        target[1000] ^= 0xFF;
        target.extend_from_slice(b"appended tail");
        let (_, decoded) = round_trip(2, &source, &target);
        assert_eq!(decoded, target);
    }

    #[test]
    fn unrelated_target_falls_back_to_literal() {
        let source = vec![0u8; 4096];
        let target: Vec<u8> = (0..4096u32).map(|i| (i * 7 + 1) as u8).collect();
        let (encoded, decoded) = round_trip(1, &source, &target);
        assert_eq!(decoded, target);
        // One literal op of the whole target plus framing.
        assert!(encoded.len() >= target.len());
    }

    #[test]
    fn empty_target() {
        let source = b"some source".to_vec();
        let (encoded, decoded) = round_trip(1, &source, b"");
        assert!(decoded.is_empty());
        assert_eq!(encoded, vec![OP_END]);
    }

    #[test]
    fn target_smaller_than_block() {
        let source = vec![9u8; 4096];
        let target = b"tiny".to_vec();
        let (_, decoded) = round_trip(3, &source, &target);
        assert_eq!(decoded, target);
    }

    #[test]
    fn missing_source_fails_construction() {
        let err = CodecStream::new_deflate(CompressAlgorithm::Delta(1), None).unwrap_err();
        assert!(matches!(err, Error::InitCompress { .. }));
        let err = CodecStream::new_inflate(CompressAlgorithm::Delta(1), None).unwrap_err();
        assert!(matches!(err, Error::InitDecompress { .. }));
    }

    #[test]
    fn weak_hash_rolls_consistently() {
        let data: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(31)).collect();
        let block = 16;
        let mut hash = RollingHash::new(&data[..block]);
        for i in 0..data.len() - block {
            assert_eq!(hash.value(), weak_hash(&data[i..i + block]), "window {i}");
            hash.roll(data[i], data[i + block]);
        }
    }
}
