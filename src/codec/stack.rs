//! Linear composition of the per-entry transform stages.
//!
//! Encode order: raw bytes → delta (when a source was resolved) → byte
//! compression (when not `None`) → encryption. Decode reverses the order.
//! Each stage's `flush`/`end_of_data` signal cascades to the next stage, so
//! a stack is finished only when its last stage is.

use std::sync::Arc;

use super::{CodecStream, CompressAlgorithm, DeltaSource};
use crate::Result;
use crate::crypto::{CryptMode, CryptStream, Password};

/// Scratch size for moving bytes between stages.
const STAGE_BUFFER: usize = 64 * 1024;

/// The per-entry stream configuration carried in entry headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackParams {
    /// Byte-compression algorithm (`None` disables the stage).
    pub compress: CompressAlgorithm,
    /// Delta algorithm (`None` disables the stage).
    pub delta: CompressAlgorithm,
    /// Encryption mode.
    pub crypt: CryptMode,
    /// Per-entry crypt salt.
    pub salt: [u8; crate::crypto::SALT_LEN],
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            compress: CompressAlgorithm::None,
            delta: CompressAlgorithm::None,
            crypt: CryptMode::None,
            salt: [0u8; crate::crypto::SALT_LEN],
        }
    }
}

impl StackParams {
    /// True when neither a byte nor a delta algorithm transforms the data,
    /// so archive-side EOF must coincide with the raw byte count.
    pub fn is_identity(&self) -> bool {
        self.compress == CompressAlgorithm::None && self.delta == CompressAlgorithm::None
    }
}

/// Encode-direction stack: raw bytes in, ciphertext out.
pub struct EncodeStack {
    delta: Option<CodecStream>,
    byte: CodecStream,
    crypt: CryptStream,
    out: Vec<u8>,
    byte_flushed: bool,
    finished: bool,
}

impl EncodeStack {
    /// Builds an encode stack for one entry.
    pub fn new(
        params: &StackParams,
        password: Option<&Password>,
        source: Option<Arc<dyn DeltaSource>>,
    ) -> Result<Self> {
        let delta = match params.delta {
            CompressAlgorithm::None => None,
            algorithm => Some(CodecStream::new_deflate(algorithm, source)?),
        };
        let byte = CodecStream::new_deflate(params.compress, None)?;
        let crypt = CryptStream::new(params.crypt, password, &params.salt)?;
        Ok(Self {
            delta,
            byte,
            crypt,
            out: Vec::new(),
            byte_flushed: false,
            finished: false,
        })
    }

    /// Feeds raw entry bytes through the stack. Produced ciphertext
    /// accumulates until [`take_output`](Self::take_output).
    pub fn push(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = match &mut self.delta {
                Some(d) => d.feed(data)?,
                None => self.byte.feed(data)?,
            };
            data = &data[n..];
            self.pump(false)?;
        }
        Ok(())
    }

    /// Marks end-of-entry and drives every stage to completion.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if let Some(d) = &mut self.delta {
            d.flush()?;
        }
        self.pump(true)?;
        self.crypt.finish_encrypt(&mut self.out)?;
        self.finished = true;
        Ok(())
    }

    /// Takes the ciphertext produced so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Bytes accepted on the raw side.
    pub fn raw_bytes(&self) -> u64 {
        match &self.delta {
            Some(d) => d.input_bytes(),
            None => self.byte.input_bytes(),
        }
    }

    fn pump(&mut self, finishing: bool) -> Result<()> {
        let mut buf = [0u8; STAGE_BUFFER];
        loop {
            let mut progress = false;

            // delta → byte
            if let Some(d) = &mut self.delta {
                let n = d.drain(&mut buf)?;
                if n > 0 {
                    let mut fed = 0;
                    while fed < n {
                        let k = self.byte.feed(&buf[fed..n])?;
                        fed += k;
                        if k == 0 {
                            drain_into_crypt(
                                &mut self.byte,
                                &mut self.crypt,
                                &mut self.out,
                                &mut progress,
                            )?;
                        }
                    }
                    progress = true;
                }
                if finishing && d.end_of_data() && !self.byte_flushed {
                    self.byte.flush()?;
                    self.byte_flushed = true;
                    progress = true;
                }
            } else if finishing && !self.byte_flushed {
                self.byte.flush()?;
                self.byte_flushed = true;
                progress = true;
            }

            // byte → crypt
            drain_into_crypt(&mut self.byte, &mut self.crypt, &mut self.out, &mut progress)?;

            if !progress {
                return Ok(());
            }
        }
    }
}

fn drain_into_crypt(
    byte: &mut CodecStream,
    crypt: &mut CryptStream,
    out: &mut Vec<u8>,
    progress: &mut bool,
) -> Result<()> {
    let mut buf = [0u8; STAGE_BUFFER];
    loop {
        let n = byte.drain(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        crypt.encrypt(&buf[..n], out)?;
        *progress = true;
    }
}

/// Decode-direction stack: ciphertext in, raw bytes out.
pub struct DecodeStack {
    crypt: CryptStream,
    byte: CodecStream,
    delta: Option<CodecStream>,
    plain: Vec<u8>,
    plain_pos: usize,
    input_done: bool,
    byte_flushed: bool,
    delta_flushed: bool,
}

impl DecodeStack {
    /// Builds a decode stack for one entry from its header parameters.
    pub fn new(
        params: &StackParams,
        password: Option<&Password>,
        source: Option<Arc<dyn DeltaSource>>,
    ) -> Result<Self> {
        let delta = match params.delta {
            CompressAlgorithm::None => None,
            algorithm => Some(CodecStream::new_inflate(algorithm, source)?),
        };
        let byte = CodecStream::new_inflate(params.compress, None)?;
        let crypt = CryptStream::new(params.crypt, password, &params.salt)?;
        Ok(Self {
            crypt,
            byte,
            delta,
            plain: Vec::new(),
            plain_pos: 0,
            input_done: false,
            byte_flushed: false,
            delta_flushed: false,
        })
    }

    /// Feeds ciphertext bytes from the archive.
    pub fn push(&mut self, ciphertext: &[u8]) -> Result<()> {
        self.crypt.decrypt(ciphertext, &mut self.plain)?;
        Ok(())
    }

    /// Marks the archive side as exhausted; trailing output is completed on
    /// subsequent drains.
    pub fn finish_input(&mut self) -> Result<()> {
        if self.input_done {
            return Ok(());
        }
        self.crypt.finish_decrypt()?;
        self.input_done = true;
        Ok(())
    }

    /// Produces decoded raw bytes into `out`, returning the count (0 when
    /// no more output can be produced right now).
    pub fn drain(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let mut progress = false;

            // plain → byte
            if self.plain_pos < self.plain.len() {
                let n = self.byte.feed(&self.plain[self.plain_pos..])?;
                self.plain_pos += n;
                if self.plain_pos == self.plain.len() {
                    self.plain.clear();
                    self.plain_pos = 0;
                }
                progress = n > 0 || progress;
            } else if self.input_done && !self.byte_flushed {
                self.byte.flush()?;
                self.byte_flushed = true;
                progress = true;
            }

            match &mut self.delta {
                None => {
                    let n = self.byte.drain(out)?;
                    if n > 0 {
                        return Ok(n);
                    }
                }
                Some(d) => {
                    // byte → delta
                    let mut buf = [0u8; STAGE_BUFFER];
                    loop {
                        let n = self.byte.drain(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        let mut fed = 0;
                        while fed < n {
                            fed += d.feed(&buf[fed..n])?;
                        }
                        progress = true;
                    }
                    if self.byte_flushed && self.byte.end_of_data() && !self.delta_flushed {
                        d.flush()?;
                        self.delta_flushed = true;
                        progress = true;
                    }
                    let n = d.drain(out)?;
                    if n > 0 {
                        return Ok(n);
                    }
                }
            }

            if !progress {
                return Ok(0);
            }
        }
    }

    /// Decoded bytes that may trail the payload as cipher-block padding:
    /// zero without encryption, one block minus one byte with it. Padding
    /// reaches the decoded side only when no compression strips it.
    pub fn padding_slack(&self) -> usize {
        self.crypt.mode().block_size().saturating_sub(1)
    }

    /// True when every stage finished and all output was drained.
    pub fn end_of_data(&self) -> bool {
        let byte_done = self.byte_flushed && self.byte.end_of_data();
        match &self.delta {
            None => self.input_done && byte_done,
            Some(d) => self.input_done && byte_done && self.delta_flushed && d.end_of_data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SliceSource;

    fn run_stack(
        params: &StackParams,
        password: Option<&Password>,
        source: Option<Arc<dyn DeltaSource>>,
        data: &[u8],
    ) -> Vec<u8> {
        let mut enc = EncodeStack::new(params, password, source.clone()).unwrap();
        enc.push(data).unwrap();
        enc.finish().unwrap();
        let encoded = enc.take_output();

        let mut dec = DecodeStack::new(params, password, source).unwrap();
        dec.push(&encoded).unwrap();
        dec.finish_input().unwrap();

        let mut decoded = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = dec.drain(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            decoded.extend_from_slice(&buf[..n]);
        }
        assert!(dec.end_of_data());
        decoded
    }

    #[test]
    fn identity_stack_round_trip() {
        let params = StackParams::default();
        assert!(params.is_identity());
        let data = b"plain pass-through".to_vec();
        assert_eq!(run_stack(&params, None, None, &data), data);
    }

    #[cfg(feature = "zip")]
    #[test]
    fn compressed_stack_round_trip() {
        let params = StackParams {
            compress: CompressAlgorithm::Zip(6),
            ..StackParams::default()
        };
        assert!(!params.is_identity());
        let data = vec![7u8; 200_000];
        assert_eq!(run_stack(&params, None, None, &data), data);
    }

    #[cfg(all(feature = "zip", feature = "aes"))]
    #[test]
    fn compressed_encrypted_stack_round_trip() {
        let password = Password::new("stack secret");
        let params = StackParams {
            compress: CompressAlgorithm::Zip(9),
            crypt: CryptMode::Aes256,
            salt: crate::crypto::generate_salt().unwrap(),
            ..StackParams::default()
        };
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(run_stack(&params, Some(&password), None, &data), data);
    }

    #[cfg(feature = "bzip2")]
    #[test]
    fn delta_plus_byte_stack_round_trip() {
        let source_bytes: Vec<u8> = (0..40_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut target = source_bytes.clone();
        target[5000] ^= 0x55;
        let source: Arc<dyn DeltaSource> = Arc::new(SliceSource(source_bytes));

        let params = StackParams {
            compress: CompressAlgorithm::Bzip2(5),
            delta: CompressAlgorithm::Delta(2),
            ..StackParams::default()
        };
        assert_eq!(run_stack(&params, None, Some(source), &target), target);
    }

    #[test]
    fn empty_input_round_trips() {
        let params = StackParams::default();
        assert!(run_stack(&params, None, None, b"").is_empty());
    }
}
