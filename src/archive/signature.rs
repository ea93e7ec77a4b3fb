//! Signature chunks: digests over archive byte ranges.
//!
//! A signature chunk carries a digest of every archive byte since the
//! previous signature chunk (or the start of the file), excluding the
//! signature chunk itself. Verification is a whole-archive scan done
//! before entries are processed.

use sha2::{Digest, Sha256};

use super::chunk::{self, ID_SIGNATURE};
use super::{WireReader, WireWriter};
use crate::storage::StorageReader;
use crate::{Error, Result};

/// Digest algorithm tag for SHA-256.
pub const DIGEST_SHA256: u8 = 1;

/// Verification outcome over all signature chunks of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    /// Every signature matched (or the archive carries none).
    Valid,
    /// At least one signature did not match its byte range.
    Invalid,
    /// No mismatch, but at least one signature used an unknown digest.
    Unknown,
}

/// A decoded signature payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignaturePayload {
    /// Digest algorithm tag.
    pub algorithm: u8,
    /// The digest value.
    pub digest: [u8; 32],
}

impl SignaturePayload {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(self.algorithm);
        w.put_bytes(&self.digest);
        w.into_inner()
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let algorithm = r.u8()?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(r.take(32)?);
        Ok(Self { algorithm, digest })
    }
}

/// Scans the whole archive and checks every signature chunk.
///
/// The reader is left at an arbitrary position; callers reopen or seek
/// before processing entries.
pub fn verify_signatures(reader: &mut dyn StorageReader) -> Result<SignatureVerdict> {
    reader.seek(0)?;
    let mut hasher = Sha256::new();
    let mut saw_unknown = false;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let Some(header) = chunk::read_header(reader)? else {
            break;
        };
        if header.id == ID_SIGNATURE {
            let payload = chunk::read_payload(reader, &header)?;
            let signature = SignaturePayload::decode(&payload)?;
            let digest: [u8; 32] = std::mem::take(&mut hasher).finalize().into();
            if signature.algorithm != DIGEST_SHA256 {
                saw_unknown = true;
                continue;
            }
            if digest != signature.digest {
                return Ok(SignatureVerdict::Invalid);
            }
        } else {
            hasher.update(header.encode());
            let mut remaining = header.size;
            while remaining > 0 {
                let want = (remaining as usize).min(buf.len());
                let n = reader.read(&mut buf[..want])?;
                if n == 0 {
                    return Err(Error::InvalidFormat("truncated archive".into()));
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
            }
        }
    }
    if saw_unknown {
        Ok(SignatureVerdict::Unknown)
    } else {
        Ok(SignatureVerdict::Valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::entry::Fragment;
    use crate::archive::write::ArchiveWriter;
    use crate::archive::EntryHeader;
    use crate::codec::stack::StackParams;
    use crate::fsx::FileInfo;
    use crate::storage::{LocalStorage, Storage, StorageSpecifier};

    fn build_archive(dir: &tempfile::TempDir) -> StorageSpecifier {
        let spec =
            StorageSpecifier::parse(dir.path().join("sig.bar").to_str().unwrap()).unwrap();
        let storage = LocalStorage::new();
        let mut writer = ArchiveWriter::create(storage.open_write(&spec, 0).unwrap()).unwrap();
        let header = EntryHeader::File {
            path: "x".into(),
            info: FileInfo {
                size: 8,
                ..FileInfo::default()
            },
            params: StackParams::default(),
            fragment: Fragment { offset: 0, size: 8 },
            delta_source: None,
        };
        let mut cursor = writer.new_entry(&header, None, None).unwrap();
        cursor.write_data(b"ABCDEFGH").unwrap();
        cursor.close().unwrap();
        writer.write_signature().unwrap();
        writer.finish().unwrap();
        spec
    }

    #[test]
    fn intact_archive_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let spec = build_archive(&dir);
        let mut reader = LocalStorage::new().open_read(&spec).unwrap();
        assert_eq!(
            verify_signatures(reader.as_mut()).unwrap(),
            SignatureVerdict::Valid
        );
    }

    #[test]
    fn flipped_byte_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let spec = build_archive(&dir);
        // Flip one data byte in the middle of the file.
        let mut bytes = std::fs::read(&spec.path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        std::fs::write(&spec.path, &bytes).unwrap();

        let mut reader = LocalStorage::new().open_read(&spec).unwrap();
        assert_eq!(
            verify_signatures(reader.as_mut()).unwrap(),
            SignatureVerdict::Invalid
        );
    }

    #[test]
    fn signature_payload_round_trip() {
        let payload = SignaturePayload {
            algorithm: DIGEST_SHA256,
            digest: [7u8; 32],
        };
        assert_eq!(
            SignaturePayload::decode(&payload.encode()).unwrap(),
            payload
        );
    }
}
