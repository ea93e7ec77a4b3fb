//! # barc
//!
//! A backup archiver engine: it serializes filesystem entries (files,
//! device images, directories, links, hard links, specials) into chunked
//! archives with per-entry delta compression, byte compression and
//! encryption, and it can test, compare, restore and convert those
//! archives.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use barc::{Job, JobOptions, LocalStorage, Result};
//! use barc::codec::CompressAlgorithm;
//!
//! fn main() -> Result<()> {
//!     let mut options = JobOptions::default();
//!     options.compress = CompressAlgorithm::Lz4(3);
//!     let job = Job::new(options, Arc::new(LocalStorage::new()));
//!
//!     // Archive a directory tree.
//!     barc::ops::create(&job, "/backups/home-001.bar", &["/home/user".into()])?;
//!
//!     // Verify the archive decodes end-to-end.
//!     barc::ops::test(&job, &["/backups/home-001.bar".to_string()])?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Layer | Module | Responsibility |
//! |-------|--------|----------------|
//! | Pattern filter | [`pattern`] | Glob/regex compilation and include/exclude lists |
//! | Fragment ledger | [`fragment`] | Byte-range coverage of logical entries |
//! | Codec stack | [`codec`], [`crypto`] | Delta, byte compression and encryption as streaming transforms |
//! | Entry pipeline | [`archive`] | Chunk framing, entry headers, per-entry data cursors |
//! | Operation driver | [`ops`] | create / test / compare / restore / convert over worker pools |
//!
//! Entry data flows raw bytes → delta → byte compression → encryption →
//! block framing on the way into an archive, and back out in reverse.
//! Large entries are split into fragments that may spread over several
//! archives; the [`fragment::FragmentLedger`] reassembles the picture and
//! reports incomplete entries.
//!
//! ## Feature flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `zip` | Yes | Deflate-family byte compression |
//! | `bzip2` | Yes | BZip2 byte compression |
//! | `lzma` | Yes | LZMA byte compression |
//! | `lz4` | Yes | LZ4 block compression |
//! | `aes` | Yes | AES-CBC entry encryption |
//!
//! Archives naming a family that is not compiled in remain parseable;
//! opening such a data stream reports an unsupported-algorithm error.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod archive;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod fragment;
pub mod fsprobe;
pub mod fsx;
pub mod options;
pub mod ops;
pub mod pattern;
pub mod ringbuf;
pub mod source;
pub mod storage;

pub use error::{Error, Result};

pub use archive::{ArchiveEntryKind, ArchiveReader, ArchiveWriter, EntryHeader, Fragment};
pub use codec::{CodecDirection, CodecStream, CompressAlgorithm, DeltaSource};
pub use crypto::{CryptMode, Password, PasswordSource, PasswordUse};
pub use fragment::{FragmentLedger, FragmentNode, FragmentRange};
pub use fsx::{FileInfo, SpecialKind};
pub use options::{JobOptions, Owner};
pub use ops::{Control, EntryOutcome, Job, NoProgress, ProgressReporter};
pub use pattern::{EntryFilterKind, EntryList, Pattern, PatternList, PatternMatchMode, PatternType};
pub use source::{DeltaSourceList, SourceResolver};
pub use storage::{LocalStorage, Storage, StorageReader, StorageSpecifier, StorageWriter};
