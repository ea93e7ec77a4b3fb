//! Job options recognized by the engine.

use std::path::PathBuf;

use crate::codec::CompressAlgorithm;
use crate::crypto::CryptMode;
use crate::pattern::PatternType;

/// Owner override applied on restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    /// Overriding user id; `None` keeps the header's user id.
    pub user_id: Option<u32>,
    /// Overriding group id; `None` keeps the header's group id.
    pub group_id: Option<u32>,
}

/// The per-job options that affect the engine.
///
/// The command layer parses these from its own surface and hands them in;
/// the engine never reads the environment.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Restore writes no filesystem bytes.
    pub dry_run: bool,
    /// Destination may replace existing entries.
    pub overwrite_files: bool,
    /// An unreadable file or device during create becomes a skip instead of
    /// a failure.
    pub skip_unreadable: bool,
    /// Per-entry failures abort the operation instead of degrading to
    /// warnings. On by default; the command layer's `no_stop_on_error`
    /// switch clears it.
    pub stop_on_error: bool,
    /// Skip signature verification when opening archives.
    pub skip_verify_signatures: bool,
    /// Suppress the end-of-operation incomplete-fragment check.
    pub no_fragments_check: bool,
    /// Disable filesystem-aware block skipping for images.
    pub raw_images: bool,
    /// Path components stripped from entry paths before prepending the
    /// destination.
    pub directory_strip_count: u32,
    /// Restore root directory.
    pub destination: Option<PathBuf>,
    /// Owner override for restored entries.
    pub owner: Owner,
    /// Worker threads; 0 means "use the core count".
    pub max_threads: u32,
    /// Default pattern type for include/exclude compilation.
    pub pattern_type: PatternType,
    /// Byte-compression algorithm for create/convert.
    pub compress: CompressAlgorithm,
    /// Delta algorithm for create/convert (`None` disables delta).
    pub delta: CompressAlgorithm,
    /// Encryption mode for create/convert.
    pub crypt: CryptMode,
    /// Directory for scratch files; `None` uses the system temp directory.
    pub temp_directory: Option<PathBuf>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            overwrite_files: false,
            skip_unreadable: false,
            stop_on_error: true,
            skip_verify_signatures: false,
            no_fragments_check: false,
            raw_images: false,
            directory_strip_count: 0,
            destination: None,
            owner: Owner::default(),
            max_threads: 0,
            pattern_type: PatternType::Glob,
            compress: CompressAlgorithm::None,
            delta: CompressAlgorithm::None,
            crypt: CryptMode::None,
            temp_directory: None,
        }
    }
}

impl JobOptions {
    /// The worker pool size: `min(max_threads, available cores)`, with 0
    /// meaning the core count.
    pub fn effective_threads(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.max_threads == 0 {
            cores
        } else {
            (self.max_threads as usize).min(cores)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let options = JobOptions::default();
        assert!(!options.dry_run);
        assert!(!options.overwrite_files);
        assert!(options.stop_on_error);
        assert_eq!(options.directory_strip_count, 0);
        assert_eq!(options.compress, CompressAlgorithm::None);
        assert_eq!(options.crypt, CryptMode::None);
    }

    #[test]
    fn effective_threads_honors_cap() {
        let mut options = JobOptions::default();
        options.max_threads = 1;
        assert_eq!(options.effective_threads(), 1);
        options.max_threads = 0;
        assert!(options.effective_threads() >= 1);
    }
}
