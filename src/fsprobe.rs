//! Filesystem detection on device images.
//!
//! When an image carries a recognizable filesystem, the pipeline reads and
//! writes only blocks the filesystem marks as used; everything else becomes
//! a hole. The probe recognizes ext2-family superblocks and loads the
//! block-group bitmaps. A failed probe means the image is processed raw.

use std::io::{Read, Seek, SeekFrom};

use crate::Result;
use crate::archive::entry::FileSystemKind;

/// ext superblock magic.
const EXT_MAGIC: u16 = 0xEF53;

/// Upper bound on filesystem block size accepted by the probe.
const MAX_FS_BLOCK_SIZE: u32 = 64 * 1024;

/// Upper bound on block groups; guards bitmap memory against corrupt
/// superblocks.
const MAX_GROUPS: u64 = 1 << 16;

/// Used-block map of a probed filesystem.
pub struct BlockUsage {
    kind: FileSystemKind,
    fs_block_size: u32,
    first_data_block: u64,
    total_blocks: u64,
    /// One bit per filesystem block starting at `first_data_block`.
    bitmap: Vec<u8>,
}

impl BlockUsage {
    /// Probes an image for a recognizable filesystem. Returns `None` when
    /// no supported superblock is found; errors are real I/O failures.
    pub fn probe<R: Read + Seek>(image: &mut R) -> Result<Option<Self>> {
        let mut superblock = [0u8; 1024];
        image.seek(SeekFrom::Start(1024))?;
        if read_fully(image, &mut superblock)?.is_none() {
            return Ok(None);
        }

        let magic = u16::from_le_bytes([superblock[56], superblock[57]]);
        if magic != EXT_MAGIC {
            return Ok(None);
        }

        let blocks_count = u64::from(u32::from_le_bytes(
            superblock[4..8].try_into().expect("len 4"),
        ));
        let first_data_block = u64::from(u32::from_le_bytes(
            superblock[20..24].try_into().expect("len 4"),
        ));
        let log_block_size = u32::from_le_bytes(superblock[24..28].try_into().expect("len 4"));
        let blocks_per_group = u64::from(u32::from_le_bytes(
            superblock[32..36].try_into().expect("len 4"),
        ));

        if log_block_size > 6 || blocks_per_group == 0 || blocks_count <= first_data_block {
            return Ok(None);
        }
        let fs_block_size = 1024u32 << log_block_size;
        if fs_block_size > MAX_FS_BLOCK_SIZE {
            return Ok(None);
        }
        let data_blocks = blocks_count - first_data_block;
        let group_count = data_blocks.div_ceil(blocks_per_group);
        if group_count > MAX_GROUPS {
            return Ok(None);
        }

        // Group descriptor table lives in the block after the superblock.
        let descriptor_base = (first_data_block + 1) * u64::from(fs_block_size);
        let mut bitmap = vec![0u8; (data_blocks as usize).div_ceil(8)];
        let mut block_buf = vec![0u8; fs_block_size as usize];

        for group in 0..group_count {
            let mut descriptor = [0u8; 32];
            image.seek(SeekFrom::Start(descriptor_base + group * 32))?;
            if read_fully(image, &mut descriptor)?.is_none() {
                return Ok(None);
            }
            let bitmap_block = u64::from(u32::from_le_bytes(
                descriptor[0..4].try_into().expect("len 4"),
            ));
            if bitmap_block >= blocks_count {
                return Ok(None);
            }

            image.seek(SeekFrom::Start(bitmap_block * u64::from(fs_block_size)))?;
            if read_fully(image, &mut block_buf)?.is_none() {
                return Ok(None);
            }

            let group_first = group * blocks_per_group;
            let group_blocks = blocks_per_group.min(data_blocks - group_first);
            for i in 0..group_blocks {
                let byte = block_buf[(i / 8) as usize];
                if byte & (1 << (i % 8)) != 0 {
                    let bit = group_first + i;
                    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
                }
            }
        }

        Ok(Some(Self {
            kind: FileSystemKind::Ext2,
            fs_block_size,
            first_data_block,
            total_blocks: blocks_count,
            bitmap,
        }))
    }

    /// The detected filesystem kind.
    pub fn kind(&self) -> FileSystemKind {
        self.kind
    }

    /// The filesystem block size in bytes.
    pub fn fs_block_size(&self) -> u32 {
        self.fs_block_size
    }

    /// Whether the filesystem block containing `byte_offset` is in use.
    ///
    /// Out-of-range offsets and the boot region before the first data
    /// block report used, so unknown territory is always copied.
    pub fn block_is_used(&self, byte_offset: u64) -> bool {
        let block = byte_offset / u64::from(self.fs_block_size);
        if block < self.first_data_block {
            return true;
        }
        if block >= self.total_blocks {
            return true;
        }
        let bit = block - self.first_data_block;
        match self.bitmap.get((bit / 8) as usize) {
            Some(byte) => byte & (1 << (bit % 8)) != 0,
            None => true,
        }
    }
}

/// Reads exactly `buf.len()` bytes, returning `None` on a short read.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<Option<()>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Builds a minimal 1 KiB-block image: superblock, one descriptor
    /// table, two group bitmaps.
    fn synthetic_image() -> Vec<u8> {
        let block = 1024usize;
        let blocks_count = 16u32;
        let mut image = vec![0u8; block * blocks_count as usize];

        // Superblock at byte 1024.
        image[1024 + 4..1024 + 8].copy_from_slice(&blocks_count.to_le_bytes());
        image[1024 + 20..1024 + 24].copy_from_slice(&1u32.to_le_bytes()); // first data block
        image[1024 + 24..1024 + 28].copy_from_slice(&0u32.to_le_bytes()); // 1 KiB blocks
        image[1024 + 32..1024 + 36].copy_from_slice(&8u32.to_le_bytes()); // blocks per group
        image[1024 + 56..1024 + 58].copy_from_slice(&EXT_MAGIC.to_le_bytes());

        // Descriptor table in block 2: bitmaps live in blocks 3 and 4.
        image[2048..2052].copy_from_slice(&3u32.to_le_bytes());
        image[2048 + 32..2048 + 36].copy_from_slice(&4u32.to_le_bytes());

        // Group 0 (blocks 1..9): first four used.
        image[3 * 1024] = 0b0000_1111;
        // Group 1 (blocks 9..16): only its last block used.
        image[4 * 1024] = 0b0100_0000;

        image
    }

    #[test]
    fn probe_detects_ext_superblock() {
        let mut cursor = Cursor::new(synthetic_image());
        let usage = BlockUsage::probe(&mut cursor).unwrap().unwrap();
        assert_eq!(usage.kind(), FileSystemKind::Ext2);
        assert_eq!(usage.fs_block_size(), 1024);
    }

    #[test]
    fn bitmap_bits_map_to_blocks() {
        let mut cursor = Cursor::new(synthetic_image());
        let usage = BlockUsage::probe(&mut cursor).unwrap().unwrap();

        // Boot region is always used.
        assert!(usage.block_is_used(0));
        // Blocks 1..5 used (group 0, bits 0..4).
        for block in 1..5u64 {
            assert!(usage.block_is_used(block * 1024), "block {block}");
        }
        // Blocks 5..9 free.
        for block in 5..9u64 {
            assert!(!usage.block_is_used(block * 1024), "block {block}");
        }
        // Group 1: block 9 + 6 = 15 used, the rest free.
        assert!(usage.block_is_used(15 * 1024));
        for block in 9..15u64 {
            assert!(!usage.block_is_used(block * 1024), "block {block}");
        }
        // Past the end counts as used.
        assert!(usage.block_is_used(16 * 1024));
    }

    #[test]
    fn probe_rejects_foreign_data() {
        let mut cursor = Cursor::new(vec![0u8; 4096]);
        assert!(BlockUsage::probe(&mut cursor).unwrap().is_none());
        let mut cursor = Cursor::new(vec![0u8; 128]);
        assert!(BlockUsage::probe(&mut cursor).unwrap().is_none());
    }
}
