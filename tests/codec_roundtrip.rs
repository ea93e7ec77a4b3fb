//! Codec round-trip coverage across algorithms, levels and input shapes.

use std::sync::Arc;

use barc::codec::framing::{BLOCK_SIZE, COMPRESSED_FLAG, END_OF_DATA_FLAG, LENGTH_MASK};
use barc::codec::{CodecStream, CompressAlgorithm, DeltaSource, SliceSource};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Pushes `data` through a deflate stream and returns the compressed
/// bytes, draining eagerly.
fn deflate(stream: &mut CodecStream, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 32 * 1024];
    let mut fed = 0;
    while fed < data.len() {
        fed += stream.feed(&data[fed..]).unwrap();
        loop {
            let n = stream.drain(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
    stream.flush().unwrap();
    loop {
        let n = stream.drain(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert!(stream.end_of_data());
    out
}

fn inflate(stream: &mut CodecStream, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 32 * 1024];
    let mut fed = 0;
    while fed < data.len() {
        fed += stream.feed(&data[fed..]).unwrap();
        loop {
            let n = stream.drain(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
    stream.flush().unwrap();
    loop {
        let n = stream.drain(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert!(stream.end_of_data());
    out
}

fn round_trip(algorithm: CompressAlgorithm, data: &[u8]) {
    let mut enc = CodecStream::new_deflate(algorithm, None).unwrap();
    let compressed = deflate(&mut enc, data);

    let mut dec = CodecStream::new_inflate(algorithm, None).unwrap();
    let decompressed = inflate(&mut dec, &compressed);

    assert_eq!(decompressed, data, "{algorithm:?} with {} bytes", data.len());
    // Raw-side totals agree between the two directions.
    assert_eq!(enc.input_bytes(), dec.output_bytes(), "{algorithm:?}");
    // Compressed-side totals agree as well.
    assert_eq!(enc.output_bytes(), dec.input_bytes(), "{algorithm:?}");
}

fn shaped_inputs() -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(0x6261_7263);
    let mut random_mib = vec![0u8; 1024 * 1024];
    rng.fill(random_mib.as_mut_slice());

    let pattern = |len: usize| -> Vec<u8> {
        (0..len).map(|i| ((i * 31) % 251) as u8).collect()
    };

    vec![
        Vec::new(),
        vec![0x41],
        pattern(BLOCK_SIZE - 1),
        pattern(BLOCK_SIZE),
        pattern(BLOCK_SIZE + 1),
        pattern(10 * BLOCK_SIZE),
        random_mib,
        vec![0u8; 1024 * 1024],
    ]
}

#[test]
fn none_round_trips_all_shapes() {
    for data in shaped_inputs() {
        round_trip(CompressAlgorithm::None, &data);
    }
}

#[cfg(feature = "zip")]
#[test]
fn zip_round_trips_all_shapes() {
    for level in [0, 1, 6, 9] {
        for data in shaped_inputs() {
            round_trip(CompressAlgorithm::Zip(level), &data);
        }
    }
}

#[cfg(feature = "bzip2")]
#[test]
fn bzip2_round_trips_all_shapes() {
    for level in [1, 9] {
        for data in shaped_inputs() {
            round_trip(CompressAlgorithm::Bzip2(level), &data);
        }
    }
}

#[cfg(feature = "lzma")]
#[test]
fn lzma_round_trips_all_shapes() {
    for level in [1, 6] {
        for data in shaped_inputs() {
            round_trip(CompressAlgorithm::Lzma(level), &data);
        }
    }
}

#[cfg(feature = "lz4")]
#[test]
fn lz4_round_trips_all_shapes() {
    for level in [0, 3, 16] {
        for data in shaped_inputs() {
            round_trip(CompressAlgorithm::Lz4(level), &data);
        }
    }
}

#[test]
fn delta_round_trips_all_shapes() {
    for data in shaped_inputs() {
        // Source shares a prefix with the target so copies appear.
        let source: Arc<dyn DeltaSource> =
            Arc::new(SliceSource(data.iter().copied().take(64 * 1024).collect()));

        let mut enc =
            CodecStream::new_deflate(CompressAlgorithm::Delta(2), Some(Arc::clone(&source)))
                .unwrap();
        let compressed = deflate(&mut enc, &data);

        let mut dec =
            CodecStream::new_inflate(CompressAlgorithm::Delta(2), Some(source)).unwrap();
        let decompressed = inflate(&mut dec, &compressed);
        assert_eq!(decompressed, data);
    }
}

#[cfg(feature = "lz4")]
#[test]
fn lz4_shrinking_block_sets_compressed_and_end_flags() {
    // 65 bytes of 'A' compress well: a single final compressed block.
    let data = vec![b'A'; 65];
    let mut enc = CodecStream::new_deflate(CompressAlgorithm::Lz4(3), None).unwrap();
    let compressed = deflate(&mut enc, &data);

    assert!(compressed.len() >= 4);
    let word = u32::from_be_bytes(compressed[..4].try_into().unwrap());
    assert_ne!(word & COMPRESSED_FLAG, 0, "block must be compressed");
    assert_ne!(word & END_OF_DATA_FLAG, 0, "single block must be final");
    let length = (word & LENGTH_MASK) as usize;
    assert_eq!(compressed.len(), 4 + length, "header length matches payload");
    assert!(length < data.len());

    let mut dec = CodecStream::new_inflate(CompressAlgorithm::Lz4(3), None).unwrap();
    assert_eq!(inflate(&mut dec, &compressed), data);
}

#[cfg(feature = "lz4")]
#[test]
fn lz4_incompressible_block_is_stored_verbatim() {
    // High-entropy input cannot shrink; the encoder stores it raw, so the
    // framed output is at most header + one raw block per block.
    let mut rng = StdRng::seed_from_u64(7);
    let mut data = vec![0u8; BLOCK_SIZE];
    rng.fill(data.as_mut_slice());

    let mut enc = CodecStream::new_deflate(CompressAlgorithm::Lz4(1), None).unwrap();
    let compressed = deflate(&mut enc, &data);

    let word = u32::from_be_bytes(compressed[..4].try_into().unwrap());
    assert_eq!(word & COMPRESSED_FLAG, 0, "stored block keeps flag clear");
    assert_eq!((word & LENGTH_MASK) as usize, BLOCK_SIZE);
    assert_eq!(compressed.len(), 4 + BLOCK_SIZE);

    let mut dec = CodecStream::new_inflate(CompressAlgorithm::Lz4(1), None).unwrap();
    assert_eq!(inflate(&mut dec, &compressed), data);
}

#[test]
fn streams_are_reusable_after_reset() {
    let mut enc = CodecStream::new_deflate(CompressAlgorithm::None, None).unwrap();
    let first = deflate(&mut enc, b"first entry");
    assert_eq!(first, b"first entry");

    enc.reset().unwrap();
    assert_eq!(enc.input_bytes(), 0);
    let second = deflate(&mut enc, b"second entry");
    assert_eq!(second, b"second entry");
}
