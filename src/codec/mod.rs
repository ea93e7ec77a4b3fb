//! Compression codec infrastructure.
//!
//! Every entry body flows through a stack of streaming transforms: an
//! optional delta stage against a prior source, an optional byte-compression
//! stage, and the encryption stage. The first two are [`CodecStream`]s: one
//! direction (deflate *or* inflate) of one algorithm, moving bytes between a
//! raw-side and a compressed-side ring buffer.
//!
//! Algorithm families are feature-gated; an archive naming a family that is
//! not compiled in is still parseable, but constructing the stream reports
//! [`Error::UnsupportedAlgorithm`].

pub mod framing;
pub mod stack;

#[cfg(feature = "bzip2")]
pub(crate) mod bzip2;
pub(crate) mod delta;
#[cfg(feature = "lz4")]
pub(crate) mod lz4;
#[cfg(feature = "lzma")]
pub(crate) mod lzma;
#[cfg(feature = "zip")]
pub(crate) mod zip;

pub use delta::{DeltaSource, SliceSource};

use std::sync::Arc;

use crate::ringbuf::RingBuffer;
use crate::{Error, Result};

/// Capacity of the feed-side ring buffer.
const INPUT_RING_CAPACITY: usize = 128 * 1024;

/// Capacity of the drain-side ring buffer.
const OUTPUT_RING_CAPACITY: usize = 256 * 1024;

/// The compression algorithm of one stream, as stored in entry headers.
///
/// The wire tag is a single byte; the numbering leaves room inside each
/// family and is append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlgorithm {
    /// Identity pass-through.
    None,
    /// Deflate family, levels 0-9.
    Zip(u8),
    /// BZip2, levels 1-9.
    Bzip2(u8),
    /// LZMA, levels 1-9.
    Lzma(u8),
    /// Delta compression against a source stream, levels 1-9.
    Delta(u8),
    /// LZO, levels 1-5. Recognized on the wire; no backend in this build.
    Lzo(u8),
    /// LZ4, levels 0-16 (1 and above select the high-compression path).
    Lz4(u8),
}

impl Default for CompressAlgorithm {
    fn default() -> Self {
        CompressAlgorithm::None
    }
}

impl CompressAlgorithm {
    /// Encodes the algorithm as its wire tag.
    pub fn to_tag(self) -> u8 {
        match self {
            CompressAlgorithm::None => 0,
            CompressAlgorithm::Zip(l) => 1 + l,
            // The bzip2 range has a historical hole at 17.
            CompressAlgorithm::Bzip2(l) if l <= 6 => 10 + l,
            CompressAlgorithm::Bzip2(l) => 11 + l,
            CompressAlgorithm::Lzma(l) => 20 + l,
            CompressAlgorithm::Delta(l) => 29 + l,
            CompressAlgorithm::Lzo(l) => 38 + l,
            CompressAlgorithm::Lz4(l) => 44 + l,
        }
    }

    /// Decodes a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressAlgorithm::None),
            1..=10 => Some(CompressAlgorithm::Zip(tag - 1)),
            11..=16 => Some(CompressAlgorithm::Bzip2(tag - 10)),
            17 => None,
            18..=20 => Some(CompressAlgorithm::Bzip2(tag - 11)),
            21..=29 => Some(CompressAlgorithm::Lzma(tag - 20)),
            30..=38 => Some(CompressAlgorithm::Delta(tag - 29)),
            39..=43 => Some(CompressAlgorithm::Lzo(tag - 38)),
            44..=60 => Some(CompressAlgorithm::Lz4(tag - 44)),
            _ => None,
        }
    }

    /// Returns `true` for the delta family.
    pub fn is_delta(self) -> bool {
        matches!(self, CompressAlgorithm::Delta(_))
    }

    /// Returns `true` for byte-compression families (everything except
    /// `None` and the delta family).
    pub fn is_byte_compression(self) -> bool {
        !matches!(self, CompressAlgorithm::None | CompressAlgorithm::Delta(_))
    }

    /// The compression level, where the family has one.
    pub fn level(self) -> u8 {
        match self {
            CompressAlgorithm::None => 0,
            CompressAlgorithm::Zip(l)
            | CompressAlgorithm::Bzip2(l)
            | CompressAlgorithm::Lzma(l)
            | CompressAlgorithm::Delta(l)
            | CompressAlgorithm::Lzo(l)
            | CompressAlgorithm::Lz4(l) => l,
        }
    }

    /// Human-readable family name.
    pub fn name(self) -> &'static str {
        match self {
            CompressAlgorithm::None => "none",
            CompressAlgorithm::Zip(_) => "zip",
            CompressAlgorithm::Bzip2(_) => "bzip2",
            CompressAlgorithm::Lzma(_) => "lzma",
            CompressAlgorithm::Delta(_) => "delta",
            CompressAlgorithm::Lzo(_) => "lzo",
            CompressAlgorithm::Lz4(_) => "lz4",
        }
    }

    /// Checks the level range for the family.
    pub fn validate(self) -> Result<()> {
        let ok = match self {
            CompressAlgorithm::None => true,
            CompressAlgorithm::Zip(l) => l <= 9,
            CompressAlgorithm::Bzip2(l) | CompressAlgorithm::Lzma(l) => (1..=9).contains(&l),
            CompressAlgorithm::Delta(l) => (1..=9).contains(&l),
            CompressAlgorithm::Lzo(l) => (1..=5).contains(&l),
            CompressAlgorithm::Lz4(l) => l <= 16,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InitCompress {
                reason: format!("invalid {} level {}", self.name(), self.level()),
            })
        }
    }
}

/// Direction of a codec stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecDirection {
    /// Raw bytes in, compressed bytes out.
    Deflate,
    /// Compressed bytes in, raw bytes out.
    Inflate,
}

/// Per-algorithm stream state.
///
/// A closed set: the algorithm families are stable, so dispatch is a match,
/// not a vtable.
enum CodecState {
    Identity { running: bool },
    #[cfg(feature = "zip")]
    Zip(zip::ZipState),
    #[cfg(feature = "bzip2")]
    Bzip2(bzip2::Bzip2State),
    #[cfg(feature = "lzma")]
    Lzma(lzma::LzmaState),
    #[cfg(feature = "lz4")]
    Lz4(lz4::Lz4State),
    Delta(delta::DeltaState),
}

/// Result of one transform step.
pub(crate) struct Step {
    /// Whether any byte moved on either side.
    pub progress: bool,
    /// Whether the algorithm reached its end-of-stream.
    pub end: bool,
}

/// One direction of one algorithm as a streaming transform.
///
/// Feed pushes bytes into the input-side ring buffer and runs the transform;
/// drain runs the transform and pops the output side. After [`flush`]
/// completes (`end_of_data` true) all internal buffers are empty and further
/// drains return 0.
///
/// [`flush`]: CodecStream::flush
pub struct CodecStream {
    algorithm: CompressAlgorithm,
    direction: CodecDirection,
    source: Option<Arc<dyn DeltaSource>>,
    input: RingBuffer,
    output: RingBuffer,
    state: CodecState,
    flush_requested: bool,
    ended: bool,
    total_in: u64,
    total_out: u64,
}

impl std::fmt::Debug for CodecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecStream")
            .field("algorithm", &self.algorithm)
            .field("direction", &self.direction)
            .field("total_in", &self.total_in)
            .field("total_out", &self.total_out)
            .finish_non_exhaustive()
    }
}

impl CodecStream {
    /// Creates a deflate-direction stream.
    ///
    /// Delta algorithms need `source`; all other families ignore it.
    pub fn new_deflate(
        algorithm: CompressAlgorithm,
        source: Option<Arc<dyn DeltaSource>>,
    ) -> Result<Self> {
        Self::new(algorithm, CodecDirection::Deflate, source)
    }

    /// Creates an inflate-direction stream.
    pub fn new_inflate(
        algorithm: CompressAlgorithm,
        source: Option<Arc<dyn DeltaSource>>,
    ) -> Result<Self> {
        Self::new(algorithm, CodecDirection::Inflate, source)
    }

    fn new(
        algorithm: CompressAlgorithm,
        direction: CodecDirection,
        source: Option<Arc<dyn DeltaSource>>,
    ) -> Result<Self> {
        algorithm.validate()?;
        let state = build_state(algorithm, direction, source.as_ref())?;
        Ok(Self {
            algorithm,
            direction,
            source,
            input: RingBuffer::with_capacity(INPUT_RING_CAPACITY),
            output: RingBuffer::with_capacity(OUTPUT_RING_CAPACITY),
            state,
            flush_requested: false,
            ended: false,
            total_in: 0,
            total_out: 0,
        })
    }

    /// The stream's algorithm.
    pub fn algorithm(&self) -> CompressAlgorithm {
        self.algorithm
    }

    /// The stream's direction.
    pub fn direction(&self) -> CodecDirection {
        self.direction
    }

    /// Pushes bytes into the stream and runs the transform. Returns the
    /// number of bytes consumed from `data`; callers drain eagerly and
    /// re-feed the remainder.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.input.write(data);
        self.total_in += n as u64;
        self.run()?;
        Ok(n)
    }

    /// Pops transformed bytes into `out`, running the transform first.
    /// Returns the number of bytes produced.
    pub fn drain(&mut self, out: &mut [u8]) -> Result<usize> {
        self.run()?;
        let n = self.output.read(out);
        self.total_out += n as u64;
        Ok(n)
    }

    /// Marks end-of-input. Subsequent drains complete trailing output until
    /// [`end_of_data`](Self::end_of_data) reports true.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_requested = true;
        self.run()
    }

    /// True once the algorithm finished after a flush and every produced
    /// byte has been drained.
    pub fn end_of_data(&self) -> bool {
        self.ended && self.output.is_empty()
    }

    /// Total bytes accepted by [`feed`](Self::feed).
    pub fn input_bytes(&self) -> u64 {
        self.total_in
    }

    /// Total bytes handed out by [`drain`](Self::drain).
    pub fn output_bytes(&self) -> u64 {
        self.total_out
    }

    /// Returns the stream to its post-construction state, keeping the
    /// configuration (algorithm, direction, delta source).
    pub fn reset(&mut self) -> Result<()> {
        self.state = build_state(self.algorithm, self.direction, self.source.as_ref())?;
        self.input.clear();
        self.output.clear();
        self.flush_requested = false;
        self.ended = false;
        self.total_in = 0;
        self.total_out = 0;
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        loop {
            let step = match &mut self.state {
                CodecState::Identity { running } => {
                    identity_step(running, &mut self.input, &mut self.output, self.flush_requested)
                }
                #[cfg(feature = "zip")]
                CodecState::Zip(s) => {
                    s.step(&mut self.input, &mut self.output, self.flush_requested)?
                }
                #[cfg(feature = "bzip2")]
                CodecState::Bzip2(s) => {
                    s.step(&mut self.input, &mut self.output, self.flush_requested)?
                }
                #[cfg(feature = "lzma")]
                CodecState::Lzma(s) => {
                    s.step(&mut self.input, &mut self.output, self.flush_requested)?
                }
                #[cfg(feature = "lz4")]
                CodecState::Lz4(s) => {
                    s.step(&mut self.input, &mut self.output, self.flush_requested)?
                }
                CodecState::Delta(s) => {
                    s.step(&mut self.input, &mut self.output, self.flush_requested)?
                }
            };
            if step.end {
                self.ended = true;
                return Ok(());
            }
            if !step.progress {
                return Ok(());
            }
        }
    }
}

fn identity_step(
    running: &mut bool,
    input: &mut RingBuffer,
    output: &mut RingBuffer,
    flush: bool,
) -> Step {
    let mut moved = 0usize;
    while !input.is_empty() && output.free() > 0 {
        let n = {
            let dst = output.writable();
            let src = input.readable();
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            n
        };
        output.advance_write(n);
        input.advance_read(n);
        moved += n;
    }
    if moved > 0 {
        *running = true;
    }
    Step {
        progress: moved > 0,
        end: flush && input.is_empty(),
    }
}

fn build_state(
    algorithm: CompressAlgorithm,
    direction: CodecDirection,
    source: Option<&Arc<dyn DeltaSource>>,
) -> Result<CodecState> {
    match algorithm {
        CompressAlgorithm::None => Ok(CodecState::Identity { running: false }),

        #[cfg(feature = "zip")]
        CompressAlgorithm::Zip(level) => Ok(CodecState::Zip(zip::ZipState::new(level, direction))),

        #[cfg(feature = "bzip2")]
        CompressAlgorithm::Bzip2(level) => {
            Ok(CodecState::Bzip2(bzip2::Bzip2State::new(level, direction)))
        }

        #[cfg(feature = "lzma")]
        CompressAlgorithm::Lzma(level) => {
            Ok(CodecState::Lzma(lzma::LzmaState::new(level, direction)))
        }

        #[cfg(feature = "lz4")]
        CompressAlgorithm::Lz4(level) => Ok(CodecState::Lz4(lz4::Lz4State::new(level, direction))),

        CompressAlgorithm::Delta(level) => {
            let source = source.ok_or_else(|| match direction {
                CodecDirection::Deflate => Error::InitCompress {
                    reason: "delta compression requires a source stream".into(),
                },
                CodecDirection::Inflate => Error::InitDecompress {
                    reason: "delta decompression requires a source stream".into(),
                },
            })?;
            Ok(CodecState::Delta(delta::DeltaState::new(
                level,
                direction,
                Arc::clone(source),
            )?))
        }

        // Families without a compiled backend.
        #[allow(unreachable_patterns)]
        other => Err(Error::UnsupportedAlgorithm {
            tag: other.to_tag(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        let algorithms = [
            CompressAlgorithm::None,
            CompressAlgorithm::Zip(0),
            CompressAlgorithm::Zip(9),
            CompressAlgorithm::Bzip2(1),
            CompressAlgorithm::Bzip2(6),
            CompressAlgorithm::Bzip2(7),
            CompressAlgorithm::Bzip2(9),
            CompressAlgorithm::Lzma(1),
            CompressAlgorithm::Lzma(9),
            CompressAlgorithm::Delta(1),
            CompressAlgorithm::Delta(9),
            CompressAlgorithm::Lzo(1),
            CompressAlgorithm::Lzo(5),
            CompressAlgorithm::Lz4(0),
            CompressAlgorithm::Lz4(16),
        ];
        for a in algorithms {
            assert_eq!(CompressAlgorithm::from_tag(a.to_tag()), Some(a), "{a:?}");
        }
        // The bzip2 hole and out-of-range tags decode to nothing.
        assert_eq!(CompressAlgorithm::from_tag(17), None);
        assert_eq!(CompressAlgorithm::from_tag(61), None);
        assert_eq!(CompressAlgorithm::from_tag(255), None);
    }

    #[test]
    fn tags_are_unique() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for tag in 0u8..=60 {
            if let Some(a) = CompressAlgorithm::from_tag(tag) {
                assert!(seen.insert(a.to_tag()));
                assert_eq!(a.to_tag(), tag);
            }
        }
    }

    #[test]
    fn lzo_is_unsupported() {
        let err = CodecStream::new_inflate(CompressAlgorithm::Lzo(1), None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm { tag: 39 }));
    }

    #[test]
    fn level_validation() {
        assert!(CompressAlgorithm::Zip(10).validate().is_err());
        assert!(CompressAlgorithm::Bzip2(0).validate().is_err());
        assert!(CompressAlgorithm::Lz4(17).validate().is_err());
        assert!(CompressAlgorithm::Lz4(16).validate().is_ok());
        assert!(CompressAlgorithm::None.validate().is_ok());
    }

    #[test]
    fn identity_round_trip_and_counters() {
        let mut deflate = CodecStream::new_deflate(CompressAlgorithm::None, None).unwrap();
        let data = b"identity payload";
        assert_eq!(deflate.feed(data).unwrap(), data.len());
        deflate.flush().unwrap();

        let mut out = vec![0u8; 64];
        let n = deflate.drain(&mut out).unwrap();
        assert_eq!(&out[..n], data);
        assert!(deflate.end_of_data());
        // The identity family reports equal totals on both sides.
        assert_eq!(deflate.input_bytes(), deflate.output_bytes());
        assert_eq!(deflate.drain(&mut out).unwrap(), 0);
    }

    #[test]
    fn reset_restores_fresh_state() {
        let mut s = CodecStream::new_deflate(CompressAlgorithm::None, None).unwrap();
        s.feed(b"abc").unwrap();
        s.flush().unwrap();
        let mut out = [0u8; 8];
        s.drain(&mut out).unwrap();
        assert!(s.end_of_data());

        s.reset().unwrap();
        assert_eq!(s.input_bytes(), 0);
        assert_eq!(s.output_bytes(), 0);
        assert!(!s.end_of_data());
        s.feed(b"xyz").unwrap();
        s.flush().unwrap();
        let n = s.drain(&mut out).unwrap();
        assert_eq!(&out[..n], b"xyz");
    }
}
