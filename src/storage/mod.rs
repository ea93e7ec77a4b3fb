//! Storage abstraction.
//!
//! The engine moves archive bytes through this narrow interface; transports
//! (network protocols, optical media) live outside the core and plug in
//! here. The crate ships the local-filesystem implementation.

mod local;

pub use local::LocalStorage;

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Sequential/seekable reader over one archive object.
pub trait StorageReader: Send {
    /// Reads into `buf`, returning the byte count (0 at end).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Repositions the cursor to an absolute offset.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Total object size in bytes.
    fn size(&mut self) -> Result<u64>;

    /// True when the cursor is at or past the end.
    fn eof(&mut self) -> bool;
}

impl std::fmt::Debug for dyn StorageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn StorageReader")
    }
}

/// Sequential writer over one archive object.
pub trait StorageWriter: Send {
    /// Writes all of `buf`.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Flushes and closes the object. Must be called exactly once.
    fn close(&mut self) -> Result<()>;
}

/// Directory listing handle; dropping it closes the listing.
pub trait DirectoryList: Send {
    /// Returns the next name, or `None` at the end of the listing.
    fn read_next(&mut self) -> Result<Option<String>>;
}

/// A storage backend.
pub trait Storage: Send + Sync {
    /// Opens an archive object for reading.
    fn open_read(&self, spec: &StorageSpecifier) -> Result<Box<dyn StorageReader>>;

    /// Opens an archive object for writing. `expected_size` is advisory
    /// (transports may pre-allocate); 0 means unknown.
    fn open_write(&self, spec: &StorageSpecifier, expected_size: u64)
    -> Result<Box<dyn StorageWriter>>;

    /// Opens a listing of the directory containing `spec`.
    fn open_directory_list(&self, spec: &StorageSpecifier) -> Result<Box<dyn DirectoryList>>;

    /// True when the object already exists.
    fn exists(&self, spec: &StorageSpecifier) -> bool;
}

/// The transport family of a storage name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageKind {
    /// Local filesystem.
    File,
}

/// A parsed storage name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSpecifier {
    /// The transport family.
    pub kind: StorageKind,
    /// Path within the transport.
    pub path: PathBuf,
}

impl StorageSpecifier {
    /// Parses a storage name. `file://` prefixes and bare paths map to the
    /// local filesystem.
    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(Error::InvalidFormat("empty storage name".into()));
        }
        let path = text.strip_prefix("file://").unwrap_or(text);
        if let Some((scheme, _)) = path.split_once("://") {
            return Err(Error::InvalidFormat(format!(
                "unsupported storage scheme '{scheme}'"
            )));
        }
        Ok(Self {
            kind: StorageKind::File,
            path: PathBuf::from(path),
        })
    }

    /// Printable form for diagnostics; `archive_name` replaces the final
    /// path component when given.
    pub fn printable_name(&self, archive_name: Option<&str>) -> String {
        match archive_name {
            Some(name) => {
                let mut path = self.path.clone();
                path.set_file_name(name);
                path.display().to_string()
            }
            None => self.path.display().to_string(),
        }
    }

    /// The final path component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// A specifier for a sibling object with the given name.
    pub fn with_file_name(&self, name: &str) -> Self {
        let mut path = self.path.clone();
        path.set_file_name(name);
        Self {
            kind: self.kind,
            path,
        }
    }
}

/// Returns a guaranteed-unique temp file path in `dir` (or the system temp
/// directory), keeping the file alive via the returned guard.
pub fn get_tmp_file_name(prefix: &str, dir: Option<&Path>) -> Result<tempfile::NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_path() {
        let spec = StorageSpecifier::parse("/var/backups/full-001.bar").unwrap();
        assert_eq!(spec.kind, StorageKind::File);
        assert_eq!(spec.path, PathBuf::from("/var/backups/full-001.bar"));
    }

    #[test]
    fn parse_file_scheme() {
        let spec = StorageSpecifier::parse("file:///data/a.bar").unwrap();
        assert_eq!(spec.path, PathBuf::from("/data/a.bar"));
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(StorageSpecifier::parse("ftp://host/a.bar").is_err());
        assert!(StorageSpecifier::parse("").is_err());
    }

    #[test]
    fn printable_name_replaces_file_name() {
        let spec = StorageSpecifier::parse("/backups/full-001.bar").unwrap();
        assert_eq!(spec.printable_name(None), "/backups/full-001.bar");
        assert_eq!(
            spec.printable_name(Some("full-002.bar")),
            "/backups/full-002.bar"
        );
    }

    #[test]
    fn tmp_file_names_are_unique() {
        let a = get_tmp_file_name("barc-", None).unwrap();
        let b = get_tmp_file_name("barc-", None).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
