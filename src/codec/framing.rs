//! Block framing for the block-oriented codec families.
//!
//! Within the compressed stream, each block is preceded by a four-byte
//! big-endian header: bit 31 marks the final block of the entry, bit 30
//! distinguishes compressed from stored-verbatim blocks, and bits 0..29
//! carry the payload length.

use crate::{Error, Result};

/// Marks the final block of an entry.
pub const END_OF_DATA_FLAG: u32 = 0x8000_0000;

/// Set when the payload is compressed; clear for stored-verbatim payloads.
pub const COMPRESSED_FLAG: u32 = 0x4000_0000;

/// Mask for the payload length bits.
pub const LENGTH_MASK: u32 = 0x3FFF_FFFF;

/// Raw bytes per block fed to the block compressors.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// A decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// Whether the payload is compressed.
    pub compressed: bool,
    /// Whether this is the entry's final block.
    pub end_of_data: bool,
}

impl BlockHeader {
    /// Encodes the header into its wire form.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::DeflateFail`] when the length does not fit the
    /// 30 length bits.
    pub fn encode(self) -> Result<[u8; 4]> {
        if self.length > LENGTH_MASK {
            return Err(Error::DeflateFail {
                code: -1,
                reason: format!("block length {} exceeds frame limit", self.length),
            });
        }
        let mut word = self.length;
        if self.compressed {
            word |= COMPRESSED_FLAG;
        }
        if self.end_of_data {
            word |= END_OF_DATA_FLAG;
        }
        Ok(word.to_be_bytes())
    }

    /// Decodes a wire header, rejecting lengths above `max_length`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InflateFail`] carrying `invalid data size` when
    /// the length field exceeds the decoder's input buffer.
    pub fn decode(bytes: [u8; 4], max_length: usize) -> Result<Self> {
        let word = u32::from_be_bytes(bytes);
        let length = word & LENGTH_MASK;
        if length as usize > max_length {
            return Err(Error::InflateFail {
                code: -1,
                reason: "invalid data size".into(),
            });
        }
        Ok(Self {
            length,
            compressed: word & COMPRESSED_FLAG != 0,
            end_of_data: word & END_OF_DATA_FLAG != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let hdr = BlockHeader {
            length: 5,
            compressed: true,
            end_of_data: true,
        };
        let bytes = hdr.encode().unwrap();
        assert_eq!(u32::from_be_bytes(bytes), 5 | COMPRESSED_FLAG | END_OF_DATA_FLAG);
        assert_eq!(BlockHeader::decode(bytes, BLOCK_SIZE).unwrap(), hdr);
    }

    #[test]
    fn stored_block_has_clear_compressed_flag() {
        let hdr = BlockHeader {
            length: BLOCK_SIZE as u32,
            compressed: false,
            end_of_data: false,
        };
        let bytes = hdr.encode().unwrap();
        let word = u32::from_be_bytes(bytes);
        assert_eq!(word & COMPRESSED_FLAG, 0);
        assert_eq!(word & END_OF_DATA_FLAG, 0);
        assert_eq!(word & LENGTH_MASK, BLOCK_SIZE as u32);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let word = (BLOCK_SIZE as u32 + 1) | COMPRESSED_FLAG;
        let err = BlockHeader::decode(word.to_be_bytes(), BLOCK_SIZE).unwrap_err();
        match err {
            Error::InflateFail { reason, .. } => assert!(reason.contains("invalid data size")),
            other => panic!("expected InflateFail, got {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_over_mask() {
        let hdr = BlockHeader {
            length: LENGTH_MASK + 1,
            compressed: false,
            end_of_data: false,
        };
        assert!(hdr.encode().is_err());
    }
}
