//! Operation driver.
//!
//! The five operations (create, test, compare, restore, convert) share one
//! skeleton: walk the job's storage names, enumerate matching archives,
//! route every entry through the filter and the entry pipeline, apply the
//! operation's visitor, and reconcile fragments at the end.
//!
//! Entry headers are read in archive order by a single reader; bodies are
//! processed by workers that open independent storage handles and seek to
//! the entry offset. Workers communicate over one bounded queue per
//! archive.

mod compare;
mod convert;
mod create;
mod restore;
mod test;

pub use compare::compare;
pub use convert::convert;
pub use create::create;
pub use restore::restore;
pub use test::test;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::archive::entry::{ArchiveEntryKind, EntryHeader};
use crate::archive::read::{ArchiveReader, EntryCursor};
use crate::archive::signature::SignatureVerdict;
use crate::archive::verify_signatures;
use crate::codec::CompressAlgorithm;
use crate::codec::DeltaSource;
use crate::codec::stack::StackParams;
use crate::crypto::{CryptMode, Password, PasswordSource, PasswordUse};
use crate::fragment::FragmentLedger;
use crate::options::JobOptions;
use crate::pattern::{EntryFilterKind, EntryList, PatternList, PatternMatchMode};
use crate::source::{DeltaSourceList, SourceResolver};
use crate::storage::{Storage, StorageSpecifier};
use crate::{Error, Result};

/// Capacity of the per-archive entry queue.
const ENTRY_QUEUE_CAPACITY: usize = 256;

/// Poll interval of the pause loop.
const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Caller-owned pause/abort flags, polled before each entry.
#[derive(Debug, Clone, Default)]
pub struct Control {
    pause: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl Control {
    /// Creates a control block with both flags clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// The pause flag; workers sleep while it is set.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pause)
    }

    /// The abort flag; workers finish the current I/O call and exit.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Blocks while paused, then reports `Aborted` if the abort flag is
    /// set.
    pub fn checkpoint(&self) -> Result<()> {
        while self.pause.load(Ordering::Relaxed) && !self.abort.load(Ordering::Relaxed) {
            std::thread::sleep(PAUSE_POLL);
        }
        if self.abort.load(Ordering::Relaxed) {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Clears the internal stop latch at the start of an operation; the
    /// caller-owned abort flag is left alone.
    pub(crate) fn reset_stop(&self) {
        self.stop.store(false, Ordering::Relaxed);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.abort.load(Ordering::Relaxed)
    }
}

/// Outcome shown for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry was processed successfully.
    Ok,
    /// The entry failed.
    Fail,
    /// The entry was filtered out.
    Skipped,
}

/// Receives per-entry progress.
///
/// All methods have no-op defaults; the command layer installs a reporter
/// that renders progress lines.
pub trait ProgressReporter: Send + Sync {
    /// An entry is about to be processed.
    fn entry_start(&self, _operation: &str, _kind: &str, _name: &str) {}

    /// Data-path progress of the current entry, 0-100.
    fn entry_step(&self, _percent: u8) {}

    /// The entry finished.
    fn entry_done(&self, _outcome: EntryOutcome) {}
}

/// The default reporter: silence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// Everything an operation needs, bundled by the command layer.
pub struct Job {
    /// Engine options.
    pub options: JobOptions,
    /// Storage backend.
    pub storage: Arc<dyn Storage>,
    /// Include filters (empty list includes everything).
    pub include: EntryList,
    /// Exclude patterns.
    pub exclude: PatternList,
    /// Delta-source candidates.
    pub delta_sources: DeltaSourceList,
    /// Password for encrypted entries, when the caller already has it.
    pub password: Option<Password>,
    /// Asked once for a password when an encrypted entry is met and
    /// [`password`](Self::password) is unset.
    pub password_source: Option<Arc<dyn PasswordSource>>,
    /// Progress sink.
    pub progress: Arc<dyn ProgressReporter>,
    /// Pause/abort flags.
    pub control: Control,
    /// Job name recorded in meta markers.
    pub job_name: String,
    /// Host name recorded in meta markers.
    pub host_name: String,
    resolved_password: OnceLock<Option<Password>>,
}

impl Job {
    /// Creates a job with default filters, no password and silent
    /// progress.
    pub fn new(options: JobOptions, storage: Arc<dyn Storage>) -> Self {
        Self {
            options,
            storage,
            include: EntryList::new(),
            exclude: PatternList::new(),
            delta_sources: DeltaSourceList::new(),
            password: None,
            password_source: None,
            progress: Arc::new(NoProgress),
            control: Control::new(),
            job_name: String::new(),
            host_name: String::new(),
            resolved_password: OnceLock::new(),
        }
    }

    /// The password to use for an encrypted entry: the configured one, or
    /// the password source consulted once per job.
    pub(crate) fn password_for(&self, usage: PasswordUse, prompt: &str) -> Option<Password> {
        if let Some(password) = &self.password {
            return Some(password.clone());
        }
        self.resolved_password
            .get_or_init(|| {
                self.password_source
                    .as_ref()
                    .and_then(|source| source.get_password(prompt, usage).ok())
            })
            .clone()
    }
}

/// Records the first failure of an operation; later failures are logged
/// but do not overwrite it.
pub(crate) struct FailTracker {
    first: Mutex<Option<Error>>,
}

impl FailTracker {
    pub(crate) fn new() -> Self {
        Self {
            first: Mutex::new(None),
        }
    }

    pub(crate) fn record(&self, error: Error) {
        let mut slot = self.first.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn into_result(self) -> Result<()> {
        match self.first.into_inner().unwrap_or_else(|p| p.into_inner()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Shared state handed to visitor methods.
pub(crate) struct OpContext<'a> {
    pub(crate) job: &'a Job,
    pub(crate) ledger: &'a Mutex<FragmentLedger>,
    pub(crate) resolver: &'a SourceResolver,
    pub(crate) fail: &'a FailTracker,
}

impl OpContext<'_> {
    /// Resolves the delta source an entry was encoded against.
    pub(crate) fn open_source_for(
        &self,
        header: &EntryHeader,
    ) -> Result<Option<Arc<dyn DeltaSource>>> {
        let Some(params) = header.params() else {
            return Ok(None);
        };
        if params.delta == CompressAlgorithm::None {
            return Ok(None);
        }
        let fallback = match header {
            EntryHeader::File { delta_source, .. }
            | EntryHeader::HardLink { delta_source, .. } => delta_source.as_deref(),
            _ => None,
        };
        let (source, _) = self.resolver.open_source(header.name(), fallback)?;
        Ok(Some(source))
    }

    /// Adds a fragment range under the ledger lock; when the node becomes
    /// complete it is discarded if `discard_when_complete` (restore and
    /// convert free nodes early to cap memory).
    pub(crate) fn record_fragment(
        &self,
        name: &str,
        total_size: u64,
        offset: u64,
        size: u64,
        discard_when_complete: bool,
    ) -> bool {
        let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        ledger.add_range(name, total_size, offset, size);
        let complete = ledger.is_complete(name);
        if complete && discard_when_complete {
            ledger.discard(name);
        }
        complete
    }

    /// Whether the byte window of `name` was already processed.
    pub(crate) fn range_exists(&self, name: &str, offset: u64, size: u64) -> bool {
        let ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        ledger.range_exists(name, offset, size)
    }
}

/// One visitor method per entry kind; the operation parameterizes the
/// shared driver with an implementation.
pub(crate) trait EntryVisitor: Send + Sync {
    /// Capitalized operation verb for progress and error lines.
    fn operation(&self) -> &'static str;

    fn on_file(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()>;

    fn on_image(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()>;

    fn on_directory(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()>;

    fn on_link(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()>;

    fn on_hard_link(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()>;

    fn on_special(
        &self,
        ctx: &OpContext<'_>,
        reader: &mut ArchiveReader,
        header: &EntryHeader,
    ) -> Result<()>;
}

fn dispatch(
    visitor: &dyn EntryVisitor,
    ctx: &OpContext<'_>,
    reader: &mut ArchiveReader,
    header: &EntryHeader,
) -> Result<()> {
    match header.kind() {
        ArchiveEntryKind::File => visitor.on_file(ctx, reader, header),
        ArchiveEntryKind::Image => visitor.on_image(ctx, reader, header),
        ArchiveEntryKind::Directory => visitor.on_directory(ctx, reader, header),
        ArchiveEntryKind::Link => visitor.on_link(ctx, reader, header),
        ArchiveEntryKind::HardLink => visitor.on_hard_link(ctx, reader, header),
        ArchiveEntryKind::Special => visitor.on_special(ctx, reader, header),
        ArchiveEntryKind::Meta | ArchiveEntryKind::Signature => Ok(()),
    }
}

/// True when the include/exclude lists select this entry.
pub(crate) fn entry_included(job: &Job, header: &EntryHeader) -> bool {
    let kind = match header.kind() {
        ArchiveEntryKind::Image => EntryFilterKind::Image,
        _ => EntryFilterKind::File,
    };
    let names: Vec<&str> = match header {
        EntryHeader::HardLink { paths, .. } => paths.iter().map(String::as_str).collect(),
        other => vec![other.name()],
    };
    let included = names
        .iter()
        .any(|n| job.include.matches_kind(kind, n, PatternMatchMode::Begin));
    // A hard-link group stays included while any of its paths survives the
    // exclude list.
    let excluded = names
        .iter()
        .all(|n| job.exclude.matches(n, PatternMatchMode::Exact));
    included && !excluded
}

/// Opens the entry's data body, runs `f`, and closes the cursor on every
/// exit path. A close failure after success is a warning, never an error.
pub(crate) fn with_body<T>(
    ctx: &OpContext<'_>,
    reader: &mut ArchiveReader,
    header: &EntryHeader,
    f: impl FnOnce(&mut EntryCursor<'_>, &StackParams) -> Result<T>,
) -> Result<T> {
    let params = header.params().copied().unwrap_or_default();
    let source = ctx.open_source_for(header)?;
    let password = if params.crypt == CryptMode::None {
        None
    } else {
        ctx.job.password_for(PasswordUse::Decrypt, header.name())
    };
    let mut cursor = reader.open_data(&params, password.as_ref(), source)?;
    let result = f(&mut cursor, &params);
    match cursor.close() {
        Ok(()) => {}
        Err(close_error) => {
            if result.is_ok() {
                log::warn!(
                    "Warning: close '{}' entry fail (error: {})",
                    header.kind().name(),
                    close_error
                );
            }
        }
    }
    result
}

/// Warns when archive-side data remains after the body was fully consumed
/// and no transform is in effect.
pub(crate) fn warn_unexpected_tail(
    params: &StackParams,
    cursor: &mut EntryCursor<'_>,
    kind: ArchiveEntryKind,
    name: &str,
) {
    if params.is_identity() && !cursor.eof_data() {
        log::warn!(
            "Warning: unexpected data at end of {} entry '{}'",
            kind.name(),
            name
        );
    }
}

/// Processes the next element of the archive stream. Returns `Ok(false)`
/// at the end of the archive.
pub(crate) fn process_next(
    ctx: &OpContext<'_>,
    reader: &mut ArchiveReader,
    visitor: &dyn EntryVisitor,
) -> Result<bool> {
    let Some(peeked) = reader.peek_next_kind()? else {
        return Ok(false);
    };
    ctx.job.control.checkpoint()?;
    match peeked.kind {
        ArchiveEntryKind::Meta => {
            reader.read_meta()?;
        }
        ArchiveEntryKind::Signature => {
            reader.read_signature()?;
        }
        _ => {
            let header = reader.read_entry_header()?;
            let name = header.name().to_string();
            let kind = header.kind();
            if !entry_included(ctx.job, &header) {
                ctx.job.progress.entry_start(visitor.operation(), kind.name(), &name);
                ctx.job.progress.entry_done(EntryOutcome::Skipped);
                log::info!("{} {} '{}'...skipped", visitor.operation(), kind.name(), name);
                reader.skip_data()?;
                return Ok(true);
            }

            ctx.job.progress.entry_start(visitor.operation(), kind.name(), &name);
            match dispatch(visitor, ctx, reader, &header) {
                Ok(()) => {
                    ctx.job.progress.entry_done(EntryOutcome::Ok);
                    log::info!("{} {} '{}'...OK", visitor.operation(), kind.name(), name);
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(error) => {
                    ctx.job.progress.entry_done(EntryOutcome::Fail);
                    log::error!(
                        "{} {} '{}' (error: {})",
                        visitor.operation(),
                        kind.name(),
                        name,
                        error
                    );
                    // Resynchronize to the next entry boundary.
                    reader.skip_data()?;
                    if ctx.job.options.stop_on_error {
                        ctx.fail.record(error);
                        ctx.job.control.request_stop();
                        return Err(Error::Aborted);
                    }
                    log::warn!("Warning: continuing after failed entry '{name}'");
                }
            }
        }
    }
    Ok(true)
}

/// Sequential archive walk.
pub(crate) fn run_archive_sequential(
    ctx: &OpContext<'_>,
    spec: &StorageSpecifier,
    visitor: &dyn EntryVisitor,
) -> Result<()> {
    let mut reader = ArchiveReader::open(ctx.job.storage.open_read(spec)?)?;
    while process_next(ctx, &mut reader, visitor)? {
        if ctx.job.control.should_stop() {
            break;
        }
    }
    Ok(())
}

struct EntryMsg {
    offset: u64,
}

/// Parallel archive walk: one reader thread seeds a bounded queue of entry
/// offsets; workers seek independent handles and run the visitor.
pub(crate) fn run_archive_parallel(
    job: &Job,
    ledger: &Mutex<FragmentLedger>,
    resolver: &SourceResolver,
    fail: &FailTracker,
    spec: &StorageSpecifier,
    visitor: &dyn EntryVisitor,
) -> Result<()> {
    let workers = job.options.effective_threads();
    if workers <= 1 {
        let ctx = OpContext {
            job,
            ledger,
            resolver,
            fail,
        };
        return run_archive_sequential(&ctx, spec, visitor);
    }

    let (tx, rx) = crossbeam_channel::bounded::<EntryMsg>(ENTRY_QUEUE_CAPACITY);

    std::thread::scope(|scope| {
        // The reader thread is the only task touching its archive cursor;
        // it consumes markers itself and forwards entry offsets.
        let reader_handle = scope.spawn(move || -> Result<()> {
            let mut reader = ArchiveReader::open(job.storage.open_read(spec)?)?;
            while let Some(peeked) = reader.peek_next_kind()? {
                if job.control.should_stop() {
                    break;
                }
                match peeked.kind {
                    ArchiveEntryKind::Meta => {
                        reader.read_meta()?;
                    }
                    ArchiveEntryKind::Signature => {
                        reader.read_signature()?;
                    }
                    _ => {
                        let offset = peeked.offset;
                        reader.read_entry_header()?;
                        reader.skip_data()?;
                        if tx.send(EntryMsg { offset }).is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(())
        });

        for _ in 0..workers {
            let rx = rx.clone();
            scope.spawn(move || {
                let mut reader = match job
                    .storage
                    .open_read(spec)
                    .and_then(ArchiveReader::open)
                {
                    Ok(reader) => reader,
                    Err(error) => {
                        fail.record(error);
                        job.control.request_stop();
                        return;
                    }
                };
                let ctx = OpContext {
                    job,
                    ledger,
                    resolver,
                    fail,
                };
                for msg in rx.iter() {
                    if job.control.should_stop() {
                        break;
                    }
                    let outcome = reader
                        .seek_to(msg.offset)
                        .and_then(|()| process_next(&ctx, &mut reader, visitor));
                    match outcome {
                        Ok(_) => {}
                        Err(Error::Aborted) => break,
                        Err(error) => {
                            fail.record(error);
                            job.control.request_stop();
                            break;
                        }
                    }
                }
            });
        }
        drop(rx);

        if let Err(error) = reader_handle.join().unwrap_or(Err(Error::Aborted)) {
            match error {
                Error::Aborted => {}
                other => fail.record(other),
            }
            job.control.request_stop();
        }
    });

    Ok(())
}

/// Expands one storage name into the archives it matches. A name whose
/// final component has glob characters matches against the containing
/// directory listing; anything else names exactly one archive.
pub(crate) fn enumerate_archives(job: &Job, name: &str) -> Result<Vec<StorageSpecifier>> {
    let spec = StorageSpecifier::parse(name)?;
    let Some(file_name) = spec.file_name() else {
        return Ok(vec![spec]);
    };
    if !file_name.contains(['*', '?']) {
        return Ok(vec![spec]);
    }

    let pattern =
        crate::pattern::Pattern::compile(file_name, crate::pattern::PatternType::Glob, true)?;
    let mut list = job.storage.open_directory_list(&spec)?;
    let mut out = Vec::new();
    while let Some(candidate) = list.read_next()? {
        if pattern.matches(&candidate, PatternMatchMode::Exact) {
            out.push(spec.with_file_name(&candidate));
        }
    }
    Ok(out)
}

/// Verifies signatures of one archive unless the job disables it.
pub(crate) fn check_signatures(job: &Job, spec: &StorageSpecifier) -> Result<()> {
    if job.options.skip_verify_signatures {
        return Ok(());
    }
    let mut reader = job.storage.open_read(spec)?;
    match verify_signatures(reader.as_mut())? {
        SignatureVerdict::Valid | SignatureVerdict::Unknown => Ok(()),
        SignatureVerdict::Invalid => Err(Error::InvalidSignature {
            archive: spec.printable_name(None),
        }),
    }
}

/// End-of-operation fragment reconciliation: warn on incomplete nodes and
/// record the first as the operation's failure.
pub(crate) fn fragments_check(job: &Job, ledger: &Mutex<FragmentLedger>, fail: &FailTracker) {
    if job.options.no_fragments_check {
        return;
    }
    let incomplete = ledger
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .incomplete_names();
    for name in incomplete {
        log::warn!("Warning: incomplete entry '{name}'");
        fail.record(Error::EntryIncomplete { name });
    }
}

/// Derives the on-disk destination for an entry path: drop the first
/// `strip` directory components, rejoin, prepend `destination`. The base
/// filename is never stripped.
pub fn derive_destination_path(
    entry_path: &str,
    destination: Option<&Path>,
    strip: u32,
) -> PathBuf {
    let components: Vec<&str> = entry_path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    let mut out = destination.map(Path::to_path_buf).unwrap_or_default();
    if let Some((base, dirs)) = components.split_last() {
        for dir in dirs.iter().skip(strip as usize) {
            out.push(dir);
        }
        out.push(base);
    }
    out
}

/// Shared frame of the read-side operations (test, compare, restore,
/// convert): walk archives, verify signatures, run the visitor, reconcile
/// fragments.
pub(crate) fn run_read_operation(
    job: &Job,
    storage_names: &[String],
    visitor: &dyn EntryVisitor,
    parallel: bool,
) -> Result<()> {
    job.control.reset_stop();
    let ledger = Mutex::new(FragmentLedger::new());
    let resolver = SourceResolver::new(
        job.delta_sources.clone(),
        Arc::clone(&job.storage),
        job.password.clone(),
        job.options.temp_directory.clone(),
    );
    let fail = FailTracker::new();

    'names: for name in storage_names {
        let specs = match enumerate_archives(job, name) {
            Ok(specs) => specs,
            Err(error) => {
                log::error!("open storage '{name}' (error: {error})");
                fail.record(error);
                if job.options.stop_on_error {
                    break;
                }
                continue;
            }
        };
        for spec in specs {
            if job.control.should_stop() {
                break 'names;
            }
            let printable = spec.printable_name(None);
            log::info!("{} archive '{}'", visitor.operation(), printable);

            if let Err(error) = check_signatures(job, &spec) {
                log::error!("verify signatures '{printable}' (error: {error})");
                fail.record(error);
                if job.options.stop_on_error {
                    break 'names;
                }
                continue;
            }

            let archive_result = if parallel {
                run_archive_parallel(job, &ledger, &resolver, &fail, &spec, visitor)
            } else {
                let ctx = OpContext {
                    job,
                    ledger: &ledger,
                    resolver: &resolver,
                    fail: &fail,
                };
                run_archive_sequential(&ctx, &spec, visitor)
            };
            if let Err(error) = archive_result {
                match error {
                    Error::Aborted => break 'names,
                    other => {
                        log::error!("process archive '{printable}' (error: {other})");
                        fail.record(other);
                        if job.options.stop_on_error {
                            break 'names;
                        }
                    }
                }
            }
        }
    }

    fragments_check(job, &ledger, &fail);
    fail.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_derivation_strips_directories() {
        let dest = Path::new("/restore");
        assert_eq!(
            derive_destination_path("home/user/notes.txt", Some(dest), 0),
            PathBuf::from("/restore/home/user/notes.txt")
        );
        assert_eq!(
            derive_destination_path("home/user/notes.txt", Some(dest), 1),
            PathBuf::from("/restore/user/notes.txt")
        );
        // Strip count at or past the depth leaves only the base name.
        assert_eq!(
            derive_destination_path("home/user/notes.txt", Some(dest), 2),
            PathBuf::from("/restore/notes.txt")
        );
        assert_eq!(
            derive_destination_path("home/user/notes.txt", Some(dest), 99),
            PathBuf::from("/restore/notes.txt")
        );
    }

    #[test]
    fn destination_derivation_without_destination() {
        assert_eq!(
            derive_destination_path("/etc/fstab", None, 0),
            PathBuf::from("etc/fstab")
        );
    }

    #[test]
    fn control_abort_reports() {
        let control = Control::new();
        assert!(control.checkpoint().is_ok());
        control.abort_flag().store(true, Ordering::Relaxed);
        assert!(matches!(control.checkpoint(), Err(Error::Aborted)));
        assert!(control.should_stop());
    }

    #[test]
    fn password_source_is_consulted_once() {
        use std::sync::atomic::AtomicUsize;

        struct Counting(AtomicUsize);
        impl PasswordSource for Counting {
            fn get_password(&self, _prompt: &str, _usage: PasswordUse) -> crate::Result<Password> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(Password::new("asked"))
            }
        }

        let source = Arc::new(Counting(AtomicUsize::new(0)));
        let mut job = Job::new(
            crate::options::JobOptions::default(),
            Arc::new(crate::storage::LocalStorage::new()),
        );
        job.password_source = Some(source.clone());

        let a = job.password_for(PasswordUse::Decrypt, "x").unwrap();
        let b = job.password_for(PasswordUse::Decrypt, "y").unwrap();
        assert_eq!(a.as_bytes(), b"asked");
        assert_eq!(b.as_bytes(), b"asked");
        assert_eq!(source.0.load(Ordering::Relaxed), 1);

        // An explicit password short-circuits the source.
        job.password = Some(Password::new("direct"));
        let c = job.password_for(PasswordUse::Encrypt, "z").unwrap();
        assert_eq!(c.as_bytes(), b"direct");
    }

    #[test]
    fn fail_tracker_keeps_first() {
        let fail = FailTracker::new();
        fail.record(Error::EntryIncomplete { name: "a".into() });
        fail.record(Error::Aborted);
        match fail.into_result() {
            Err(Error::EntryIncomplete { name }) => assert_eq!(name, "a"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
