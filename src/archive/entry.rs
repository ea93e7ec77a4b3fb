//! Entry kinds and header payloads.

use super::{WireReader, WireWriter};
use crate::codec::CompressAlgorithm;
use crate::codec::stack::StackParams;
use crate::crypto::{CryptMode, SALT_LEN};
use crate::fsx::{FileInfo, SpecialKind};
use crate::{Error, Result};

/// The kind tag of one archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveEntryKind {
    /// Regular file content.
    File,
    /// Block-device image content.
    Image,
    /// Directory.
    Directory,
    /// Symbolic link.
    Link,
    /// Hard-link group sharing one content fragment.
    HardLink,
    /// Character/block device, fifo or socket.
    Special,
    /// Opaque boundary marker carrying job metadata.
    Meta,
    /// Signature over the preceding entry range.
    Signature,
}

impl ArchiveEntryKind {
    /// The wire tag.
    pub fn to_tag(self) -> u8 {
        match self {
            ArchiveEntryKind::File => 1,
            ArchiveEntryKind::Image => 2,
            ArchiveEntryKind::Directory => 3,
            ArchiveEntryKind::Link => 4,
            ArchiveEntryKind::HardLink => 5,
            ArchiveEntryKind::Special => 6,
            ArchiveEntryKind::Meta => 7,
            ArchiveEntryKind::Signature => 8,
        }
    }

    /// Decodes a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ArchiveEntryKind::File),
            2 => Some(ArchiveEntryKind::Image),
            3 => Some(ArchiveEntryKind::Directory),
            4 => Some(ArchiveEntryKind::Link),
            5 => Some(ArchiveEntryKind::HardLink),
            6 => Some(ArchiveEntryKind::Special),
            7 => Some(ArchiveEntryKind::Meta),
            8 => Some(ArchiveEntryKind::Signature),
            _ => None,
        }
    }

    /// Lower-case name used in progress and error messages.
    pub fn name(self) -> &'static str {
        match self {
            ArchiveEntryKind::File => "file",
            ArchiveEntryKind::Image => "image",
            ArchiveEntryKind::Directory => "directory",
            ArchiveEntryKind::Link => "link",
            ArchiveEntryKind::HardLink => "hard link",
            ArchiveEntryKind::Special => "special",
            ArchiveEntryKind::Meta => "meta",
            ArchiveEntryKind::Signature => "signature",
        }
    }

    /// True for kinds that carry a data body.
    pub fn has_data(self) -> bool {
        matches!(
            self,
            ArchiveEntryKind::File | ArchiveEntryKind::Image | ArchiveEntryKind::HardLink
        )
    }
}

/// One entry's slice of a logical byte range. Units are bytes for files and
/// hard links, blocks for images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fragment {
    /// Start of the slice.
    pub offset: u64,
    /// Length of the slice.
    pub size: u64,
}

/// The filesystem kind detected on an image, enabling used-block skipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemKind {
    /// ext2-family superblock.
    Ext2,
}

impl FileSystemKind {
    fn to_tag(self) -> u8 {
        match self {
            FileSystemKind::Ext2 => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FileSystemKind::Ext2),
            _ => None,
        }
    }
}

/// Meta marker payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPayload {
    /// Creation time, seconds since the epoch.
    pub created: i64,
    /// Host the archive was created on.
    pub host_name: String,
    /// Job name.
    pub job_name: String,
}

impl MetaPayload {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_i64(self.created);
        w.put_string(&self.host_name);
        w.put_string(&self.job_name);
        w.into_inner()
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            created: r.i64()?,
            host_name: r.string()?,
            job_name: r.string()?,
        })
    }
}

/// A parsed entry header.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryHeader {
    /// Regular file content (one fragment of it).
    File {
        /// Entry path.
        path: String,
        /// Captured metadata.
        info: FileInfo,
        /// Stream transform parameters.
        params: StackParams,
        /// This entry's byte slice of the logical file.
        fragment: Fragment,
        /// Name of the delta source, when delta compression is in effect.
        delta_source: Option<String>,
    },
    /// Device image content (one block-range fragment of it).
    Image {
        /// Device path.
        device_path: String,
        /// Total device size in bytes.
        total_size: u64,
        /// Device block size in bytes.
        block_size: u32,
        /// This entry's slice of the device, in blocks.
        fragment: Fragment,
        /// Detected filesystem, when block skipping was applied.
        file_system: Option<FileSystemKind>,
        /// Stream transform parameters.
        params: StackParams,
    },
    /// Directory.
    Directory {
        /// Entry path.
        path: String,
        /// Captured metadata.
        info: FileInfo,
    },
    /// Symbolic link.
    Link {
        /// Link path.
        path: String,
        /// Link target text.
        target: String,
        /// Captured metadata.
        info: FileInfo,
    },
    /// Hard-link group; all paths share the content fragment.
    HardLink {
        /// All paths of the group (at least one).
        paths: Vec<String>,
        /// Captured metadata.
        info: FileInfo,
        /// Stream transform parameters.
        params: StackParams,
        /// This entry's byte slice of the logical content.
        fragment: Fragment,
        /// Name of the delta source, when delta compression is in effect.
        delta_source: Option<String>,
    },
    /// Special file.
    Special {
        /// Entry path.
        path: String,
        /// Captured metadata, including the special kind.
        info: FileInfo,
    },
}

impl EntryHeader {
    /// The entry kind.
    pub fn kind(&self) -> ArchiveEntryKind {
        match self {
            EntryHeader::File { .. } => ArchiveEntryKind::File,
            EntryHeader::Image { .. } => ArchiveEntryKind::Image,
            EntryHeader::Directory { .. } => ArchiveEntryKind::Directory,
            EntryHeader::Link { .. } => ArchiveEntryKind::Link,
            EntryHeader::HardLink { .. } => ArchiveEntryKind::HardLink,
            EntryHeader::Special { .. } => ArchiveEntryKind::Special,
        }
    }

    /// The entry's primary name (the first path for hard-link groups).
    pub fn name(&self) -> &str {
        match self {
            EntryHeader::File { path, .. }
            | EntryHeader::Directory { path, .. }
            | EntryHeader::Link { path, .. }
            | EntryHeader::Special { path, .. } => path,
            EntryHeader::Image { device_path, .. } => device_path,
            EntryHeader::HardLink { paths, .. } => paths.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// Stream parameters for data-bearing kinds.
    pub fn params(&self) -> Option<&StackParams> {
        match self {
            EntryHeader::File { params, .. }
            | EntryHeader::Image { params, .. }
            | EntryHeader::HardLink { params, .. } => Some(params),
            _ => None,
        }
    }

    /// The fragment for data-bearing kinds.
    pub fn fragment(&self) -> Option<Fragment> {
        match self {
            EntryHeader::File { fragment, .. }
            | EntryHeader::Image { fragment, .. }
            | EntryHeader::HardLink { fragment, .. } => Some(*fragment),
            _ => None,
        }
    }

    /// Serializes the header into an entry-chunk payload (kind tag, fields,
    /// CRC-32 trailer).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(self.kind().to_tag());
        match self {
            EntryHeader::File {
                path,
                info,
                params,
                fragment,
                delta_source,
            } => {
                w.put_string(path);
                put_file_info(&mut w, info);
                put_params(&mut w, params);
                put_fragment(&mut w, fragment);
                put_opt_string(&mut w, delta_source.as_deref());
            }
            EntryHeader::Image {
                device_path,
                total_size,
                block_size,
                fragment,
                file_system,
                params,
            } => {
                w.put_string(device_path);
                w.put_u64(*total_size);
                w.put_u32(*block_size);
                put_fragment(&mut w, fragment);
                w.put_u8(file_system.map_or(0, FileSystemKind::to_tag));
                put_params(&mut w, params);
            }
            EntryHeader::Directory { path, info } => {
                w.put_string(path);
                put_file_info(&mut w, info);
            }
            EntryHeader::Link { path, target, info } => {
                w.put_string(path);
                w.put_string(target);
                put_file_info(&mut w, info);
            }
            EntryHeader::HardLink {
                paths,
                info,
                params,
                fragment,
                delta_source,
            } => {
                w.put_u16(paths.len() as u16);
                for path in paths {
                    w.put_string(path);
                }
                put_file_info(&mut w, info);
                put_params(&mut w, params);
                put_fragment(&mut w, fragment);
                put_opt_string(&mut w, delta_source.as_deref());
            }
            EntryHeader::Special { path, info } => {
                w.put_string(path);
                put_file_info(&mut w, info);
            }
        }
        let mut payload = w.into_inner();
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_be_bytes());
        payload
    }

    /// Parses an entry-chunk payload, verifying the CRC-32 trailer.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(Error::InvalidFormat("entry header too short".into()));
        }
        let (body, trailer) = payload.split_at(payload.len() - 4);
        let want = u32::from_be_bytes(trailer.try_into().expect("len 4"));
        let have = crc32fast::hash(body);
        if want != have {
            return Err(Error::InvalidFormat(format!(
                "entry header CRC mismatch (expected {want:#010x}, got {have:#010x})"
            )));
        }

        let mut r = WireReader::new(body);
        let tag = r.u8()?;
        let kind = ArchiveEntryKind::from_tag(tag)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown entry kind tag {tag}")))?;
        let header = match kind {
            ArchiveEntryKind::File => EntryHeader::File {
                path: r.string()?,
                info: get_file_info(&mut r)?,
                params: get_params(&mut r)?,
                fragment: get_fragment(&mut r)?,
                delta_source: get_opt_string(&mut r)?,
            },
            ArchiveEntryKind::Image => EntryHeader::Image {
                device_path: r.string()?,
                total_size: r.u64()?,
                block_size: r.u32()?,
                fragment: get_fragment(&mut r)?,
                file_system: {
                    let tag = r.u8()?;
                    if tag == 0 {
                        None
                    } else {
                        Some(FileSystemKind::from_tag(tag).ok_or_else(|| {
                            Error::InvalidFormat(format!("unknown file system tag {tag}"))
                        })?)
                    }
                },
                params: get_params(&mut r)?,
            },
            ArchiveEntryKind::Directory => EntryHeader::Directory {
                path: r.string()?,
                info: get_file_info(&mut r)?,
            },
            ArchiveEntryKind::Link => EntryHeader::Link {
                path: r.string()?,
                target: r.string()?,
                info: get_file_info(&mut r)?,
            },
            ArchiveEntryKind::HardLink => {
                let count = r.u16()? as usize;
                if count == 0 {
                    return Err(Error::InvalidFormat("hard link group without paths".into()));
                }
                let mut paths = Vec::with_capacity(count);
                for _ in 0..count {
                    paths.push(r.string()?);
                }
                EntryHeader::HardLink {
                    paths,
                    info: get_file_info(&mut r)?,
                    params: get_params(&mut r)?,
                    fragment: get_fragment(&mut r)?,
                    delta_source: get_opt_string(&mut r)?,
                }
            }
            ArchiveEntryKind::Special => EntryHeader::Special {
                path: r.string()?,
                info: get_file_info(&mut r)?,
            },
            ArchiveEntryKind::Meta | ArchiveEntryKind::Signature => {
                return Err(Error::InvalidFormat(
                    "marker kind inside entry chunk".into(),
                ));
            }
        };
        if r.remaining() != 0 {
            return Err(Error::InvalidFormat("trailing bytes in entry header".into()));
        }
        Ok(header)
    }
}

fn put_fragment(w: &mut WireWriter, fragment: &Fragment) {
    w.put_u64(fragment.offset);
    w.put_u64(fragment.size);
}

fn get_fragment(r: &mut WireReader<'_>) -> Result<Fragment> {
    Ok(Fragment {
        offset: r.u64()?,
        size: r.u64()?,
    })
}

fn put_opt_string(w: &mut WireWriter, s: Option<&str>) {
    match s {
        Some(s) => {
            w.put_u8(1);
            w.put_string(s);
        }
        None => w.put_u8(0),
    }
}

fn get_opt_string(r: &mut WireReader<'_>) -> Result<Option<String>> {
    if r.u8()? == 0 {
        Ok(None)
    } else {
        Ok(Some(r.string()?))
    }
}

fn put_params(w: &mut WireWriter, params: &StackParams) {
    w.put_u8(params.compress.to_tag());
    w.put_u8(params.delta.to_tag());
    w.put_u8(params.crypt.to_tag());
    w.put_bytes(&params.salt);
}

fn get_params(r: &mut WireReader<'_>) -> Result<StackParams> {
    let compress_tag = r.u8()?;
    let compress = CompressAlgorithm::from_tag(compress_tag)
        .ok_or(Error::UnsupportedAlgorithm { tag: compress_tag })?;
    let delta_tag = r.u8()?;
    let delta = CompressAlgorithm::from_tag(delta_tag)
        .ok_or(Error::UnsupportedAlgorithm { tag: delta_tag })?;
    let crypt_tag = r.u8()?;
    let crypt = CryptMode::from_tag(crypt_tag)
        .ok_or_else(|| Error::InvalidFormat(format!("unknown crypt mode tag {crypt_tag}")))?;
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(r.take(SALT_LEN)?);
    Ok(StackParams {
        compress,
        delta,
        crypt,
        salt,
    })
}

fn put_file_info(w: &mut WireWriter, info: &FileInfo) {
    w.put_u64(info.size);
    w.put_i64(info.time_modified);
    w.put_i64(info.time_access);
    w.put_i64(info.time_changed);
    w.put_u32(info.user_id);
    w.put_u32(info.group_id);
    w.put_u32(info.permissions);
    match info.special {
        None => w.put_u8(0),
        Some(SpecialKind::CharDevice { major, minor }) => {
            w.put_u8(1);
            w.put_u32(major);
            w.put_u32(minor);
        }
        Some(SpecialKind::BlockDevice { major, minor }) => {
            w.put_u8(2);
            w.put_u32(major);
            w.put_u32(minor);
        }
        Some(SpecialKind::Fifo) => w.put_u8(3),
        Some(SpecialKind::Socket) => w.put_u8(4),
    }
}

fn get_file_info(r: &mut WireReader<'_>) -> Result<FileInfo> {
    let size = r.u64()?;
    let time_modified = r.i64()?;
    let time_access = r.i64()?;
    let time_changed = r.i64()?;
    let user_id = r.u32()?;
    let group_id = r.u32()?;
    let permissions = r.u32()?;
    let special = match r.u8()? {
        0 => None,
        1 => Some(SpecialKind::CharDevice {
            major: r.u32()?,
            minor: r.u32()?,
        }),
        2 => Some(SpecialKind::BlockDevice {
            major: r.u32()?,
            minor: r.u32()?,
        }),
        3 => Some(SpecialKind::Fifo),
        4 => Some(SpecialKind::Socket),
        tag => {
            return Err(Error::InvalidFormat(format!(
                "unknown special kind tag {tag}"
            )));
        }
    };
    Ok(FileInfo {
        size,
        time_modified,
        time_access,
        time_changed,
        user_id,
        group_id,
        permissions,
        special,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> FileInfo {
        FileInfo {
            size: 1234,
            time_modified: 1_700_000_000,
            time_access: 1_700_000_001,
            time_changed: 1_700_000_002,
            user_id: 1000,
            group_id: 100,
            permissions: 0o644,
            special: None,
        }
    }

    #[test]
    fn file_header_round_trip() {
        let header = EntryHeader::File {
            path: "home/user/notes.txt".into(),
            info: sample_info(),
            params: StackParams::default(),
            fragment: Fragment {
                offset: 1000,
                size: 2000,
            },
            delta_source: Some("home/user/notes.txt".into()),
        };
        let payload = header.encode();
        assert_eq!(EntryHeader::decode(&payload).unwrap(), header);
    }

    #[test]
    fn image_header_round_trip() {
        let header = EntryHeader::Image {
            device_path: "/dev/sdb1".into(),
            total_size: 1 << 30,
            block_size: 512,
            fragment: Fragment {
                offset: 2048,
                size: 4096,
            },
            file_system: Some(FileSystemKind::Ext2),
            params: StackParams::default(),
        };
        let payload = header.encode();
        assert_eq!(EntryHeader::decode(&payload).unwrap(), header);
    }

    #[test]
    fn hard_link_header_round_trip() {
        let header = EntryHeader::HardLink {
            paths: vec!["a/one".into(), "a/two".into()],
            info: sample_info(),
            params: StackParams::default(),
            fragment: Fragment { offset: 0, size: 64 },
            delta_source: None,
        };
        let payload = header.encode();
        assert_eq!(EntryHeader::decode(&payload).unwrap(), header);
    }

    #[test]
    fn special_header_round_trip() {
        let mut info = sample_info();
        info.special = Some(SpecialKind::BlockDevice { major: 8, minor: 1 });
        let header = EntryHeader::Special {
            path: "dev/sda1".into(),
            info,
        };
        let payload = header.encode();
        assert_eq!(EntryHeader::decode(&payload).unwrap(), header);
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let header = EntryHeader::Directory {
            path: "etc".into(),
            info: sample_info(),
        };
        let mut payload = header.encode();
        payload[3] ^= 0xFF;
        let err = EntryHeader::decode(&payload).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn meta_payload_round_trip() {
        let meta = MetaPayload {
            created: 1_700_000_000,
            host_name: "backup-host".into(),
            job_name: "nightly".into(),
        };
        assert_eq!(MetaPayload::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            ArchiveEntryKind::File,
            ArchiveEntryKind::Image,
            ArchiveEntryKind::Directory,
            ArchiveEntryKind::Link,
            ArchiveEntryKind::HardLink,
            ArchiveEntryKind::Special,
            ArchiveEntryKind::Meta,
            ArchiveEntryKind::Signature,
        ] {
            assert_eq!(ArchiveEntryKind::from_tag(kind.to_tag()), Some(kind));
        }
        assert_eq!(ArchiveEntryKind::from_tag(0), None);
        assert_eq!(ArchiveEntryKind::from_tag(9), None);
    }

    #[test]
    fn empty_hard_link_group_is_rejected() {
        // Hand-build a payload with zero paths.
        let mut w = WireWriter::new();
        w.put_u8(ArchiveEntryKind::HardLink.to_tag());
        w.put_u16(0);
        let mut payload = w.into_inner();
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_be_bytes());
        assert!(EntryHeader::decode(&payload).is_err());
    }
}
