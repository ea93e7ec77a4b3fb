//! Error types for archive operations.
//!
//! All fallible operations in this crate return [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. The [`Error`] enum covers every failure
//! mode of the engine: invalid input, missing data, content mismatches,
//! codec failures, storage I/O and cancellation.

use std::io;

/// The main error type for archive operations.
///
/// # Error categories
///
/// | Category | Variants | Typical cause |
/// |----------|----------|---------------|
/// | Invalid input | [`InvalidPattern`][Self::InvalidPattern], [`InvalidDeviceBlockSize`][Self::InvalidDeviceBlockSize], [`InvalidSignature`][Self::InvalidSignature], [`InvalidFormat`][Self::InvalidFormat] | Bad job configuration or damaged archive |
/// | Missing data | [`FileNotFound`][Self::FileNotFound], [`WrongEntryType`][Self::WrongEntryType], [`DeltaSourceNotFound`][Self::DeltaSourceNotFound] | Entry or source lookup failed |
/// | Content mismatch | [`EntriesDiffer`][Self::EntriesDiffer], [`EntryIncomplete`][Self::EntryIncomplete] | Compare found a difference, fragments missing |
/// | Codec | [`InitCompress`][Self::InitCompress], [`InitDecompress`][Self::InitDecompress], [`DeflateFail`][Self::DeflateFail], [`InflateFail`][Self::InflateFail], [`UnsupportedAlgorithm`][Self::UnsupportedAlgorithm] | Compression library failure |
/// | Encryption | [`PasswordRequired`][Self::PasswordRequired], [`WrongPassword`][Self::WrongPassword], [`Crypto`][Self::Crypto] | Key derivation / cipher failure |
/// | I/O | [`Io`][Self::Io] | Storage read/write/seek errors, surfaced verbatim |
/// | Cancellation | [`Aborted`][Self::Aborted] | Caller raised the abort flag |
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error from the storage layer or the local filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The archive stream is not valid: bad magic, truncated chunk,
    /// corrupt header payload or CRC mismatch.
    #[error("invalid archive format: {0}")]
    InvalidFormat(String),

    /// A pattern failed to compile. The reason is the regex library's
    /// diagnostic.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern text that failed to compile.
        pattern: String,
        /// The underlying diagnostic.
        reason: String,
    },

    /// An image entry declares a device block size larger than the
    /// transfer buffer.
    #[error("invalid device block size {block_size} (buffer size {buffer_size})")]
    InvalidDeviceBlockSize {
        /// Block size from the entry header.
        block_size: u32,
        /// The pipeline transfer buffer size.
        buffer_size: usize,
    },

    /// A signature chunk did not verify against the archive bytes it covers.
    #[error("invalid signature in archive '{archive}'")]
    InvalidSignature {
        /// Printable name of the archive.
        archive: String,
    },

    /// A filesystem entry named by the archive does not exist.
    #[error("file not found: '{path}'")]
    FileNotFound {
        /// The missing path.
        path: String,
    },

    /// The on-disk object exists but has a different kind than the entry
    /// (e.g. a directory where the archive expects a regular file).
    #[error("wrong entry type for '{name}'")]
    WrongEntryType {
        /// The entry name.
        name: String,
    },

    /// No delta-source candidate could supply the named entry.
    #[error("delta source not found for '{name}'")]
    DeltaSourceNotFound {
        /// The entry name the resolver looked for.
        name: String,
    },

    /// Compare found differing content.
    #[error("'{name}' differ at offset {offset}")]
    EntriesDiffer {
        /// The entry name.
        name: String,
        /// Absolute byte offset of the first difference within the
        /// logical file.
        offset: u64,
    },

    /// Not all fragments of a logical entry were present at the end of the
    /// operation.
    #[error("incomplete entry '{name}'")]
    EntryIncomplete {
        /// The logical entry name.
        name: String,
    },

    /// A compress stream could not be initialized.
    #[error("initialize compress fail: {reason}")]
    InitCompress {
        /// The underlying diagnostic.
        reason: String,
    },

    /// A decompress stream could not be initialized.
    #[error("initialize decompress fail: {reason}")]
    InitDecompress {
        /// The underlying diagnostic.
        reason: String,
    },

    /// The archive names a compression algorithm this build does not carry.
    #[error("unsupported compress algorithm (tag {tag})")]
    UnsupportedAlgorithm {
        /// The wire tag value.
        tag: u8,
    },

    /// The compress library reported a failure while encoding.
    #[error("deflate fail (error {code}: {reason})")]
    DeflateFail {
        /// Library error code.
        code: i32,
        /// Library diagnostic text.
        reason: String,
    },

    /// The compress library reported a failure while decoding.
    #[error("inflate fail (error {code}: {reason})")]
    InflateFail {
        /// Library error code.
        code: i32,
        /// Library diagnostic text.
        reason: String,
    },

    /// Entry data is encrypted and no password was supplied.
    #[error("password required for encrypted archive")]
    PasswordRequired,

    /// The supplied password does not decrypt the entry.
    #[error("wrong password for entry '{name}'")]
    WrongPassword {
        /// The entry name.
        name: String,
    },

    /// A cryptographic primitive failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The operation was aborted by the caller.
    #[error("aborted")]
    Aborted,
}

impl Error {
    /// Returns `true` if this error reports damaged archive data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::InvalidFormat(_) | Error::InvalidSignature { .. } | Error::InflateFail { .. }
        )
    }

    /// Returns `true` if this error reports a content mismatch rather than a
    /// hard failure (compare differences, missing fragments).
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            Error::EntriesDiffer { .. } | Error::EntryIncomplete { .. }
        )
    }

    /// Returns `true` if the archive uses a capability this build lacks.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::UnsupportedAlgorithm { .. })
    }

    /// Returns `true` for errors where retrying with different input could
    /// succeed (wrong password, transient I/O, caller abort).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::WrongPassword { .. } | Error::PasswordRequired | Error::Aborted => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns the entry name carried by this error, if any.
    pub fn entry_name(&self) -> Option<&str> {
        match self {
            Error::WrongEntryType { name }
            | Error::DeltaSourceNotFound { name }
            | Error::EntriesDiffer { name, .. }
            | Error::EntryIncomplete { name }
            | Error::WrongPassword { name } => Some(name.as_str()),
            Error::FileNotFound { path } => Some(path.as_str()),
            _ => None,
        }
    }
}

/// A specialized Result type for archive operations.
pub type Result<T> = std::result::Result<T, Error>;
