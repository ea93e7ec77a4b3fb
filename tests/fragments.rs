//! Fragment semantics across hand-built archives: completeness tracking,
//! multi-archive reassembly, and compare offsets on partial fragments.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use barc::archive::entry::Fragment;
use barc::archive::{ArchiveWriter, EntryHeader};
use barc::codec::stack::StackParams;
use barc::fsx::FileInfo;
use barc::ops::{self, Job};
use barc::{
    Error, FragmentLedger, JobOptions, LocalStorage, Storage, StorageSpecifier,
};

/// Writes an archive containing one File entry per `(offset, data)` pair,
/// all describing the same logical file `name` of `total_size` bytes.
fn write_fragment_archive(
    path: &Path,
    name: &str,
    total_size: u64,
    fragments: &[(u64, &[u8])],
    info: FileInfo,
) {
    let spec = StorageSpecifier::parse(path.to_str().unwrap()).unwrap();
    let storage = LocalStorage::new();
    let mut writer = ArchiveWriter::create(storage.open_write(&spec, 0).unwrap()).unwrap();
    for (offset, data) in fragments {
        let header = EntryHeader::File {
            path: name.into(),
            info: FileInfo {
                size: total_size,
                permissions: if info.permissions == 0 { 0o644 } else { info.permissions },
                ..info
            },
            params: StackParams::default(),
            fragment: Fragment {
                offset: *offset,
                size: data.len() as u64,
            },
            delta_source: None,
        };
        let mut cursor = writer.new_entry(&header, None, None).unwrap();
        cursor.write_data(data).unwrap();
        cursor.close().unwrap();
    }
    writer.write_signature().unwrap();
    writer.finish().unwrap();
}

#[test]
fn ledger_merges_out_of_order_fragments() {
    let mut ledger = FragmentLedger::new();
    ledger.add_range("f", 100, 0, 40);
    ledger.add_range("f", 100, 60, 40);
    assert!(!ledger.is_complete("f"));
    ledger.add_range("f", 100, 40, 20);
    assert!(ledger.is_complete("f"));
    let node = ledger.find("f").unwrap();
    assert_eq!(node.parts().len(), 1);
    assert_eq!(node.parts()[0].lo, 0);
    assert_eq!(node.parts()[0].hi, 100);
}

#[test]
fn test_reports_incomplete_entry() {
    let work = tempfile::tempdir().unwrap();
    let archive_path = work.path().join("gap.bar");

    // Entry G claims 300 bytes but the archive only carries [0,100) and
    // [200,300).
    write_fragment_archive(
        &archive_path,
        "G",
        300,
        &[(0, &[1u8; 100]), (200, &[3u8; 100])],
        FileInfo::default(),
    );

    let job = Job::new(JobOptions::default(), Arc::new(LocalStorage::new()));
    let error = ops::test(&job, &[archive_path.to_string_lossy().into_owned()]).unwrap_err();
    match error {
        Error::EntryIncomplete { name } => assert_eq!(name, "G"),
        other => panic!("expected EntryIncomplete, got {other:?}"),
    }

    // The check can be disabled.
    let mut options = JobOptions::default();
    options.no_fragments_check = true;
    let job = Job::new(options, Arc::new(LocalStorage::new()));
    ops::test(&job, &[archive_path.to_string_lossy().into_owned()]).unwrap();
}

#[test]
fn restore_reassembles_fragments_across_archives() {
    let work = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let logical_name = "data/rebuilt.bin";

    // Three fragments spread over two archives, out of order.
    let a = work.path().join("part-a.bar");
    let b = work.path().join("part-b.bar");
    write_fragment_archive(
        &a,
        logical_name,
        1000,
        &[(400, &content[400..700])],
        FileInfo::default(),
    );
    write_fragment_archive(
        &b,
        logical_name,
        1000,
        &[(700, &content[700..]), (0, &content[..400])],
        FileInfo::default(),
    );

    let restore_root = work.path().join("out");
    let mut options = JobOptions::default();
    options.destination = Some(restore_root.clone());
    let job = Job::new(options, Arc::new(LocalStorage::new()));
    ops::restore(
        &job,
        &[
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ],
    )
    .unwrap();

    let restored = fs::read(restore_root.join(logical_name)).unwrap();
    assert_eq!(restored, content);
}

#[test]
fn restore_skips_already_restored_ranges() {
    let work = tempfile::tempdir().unwrap();
    let logical_name = "dup.bin";

    // The same range appears twice; the duplicate must not clobber.
    let archive_path = work.path().join("dup.bar");
    write_fragment_archive(
        &archive_path,
        logical_name,
        8,
        &[(0, b"ORIGINAL"), (0, b"DUPLICAT")],
        FileInfo::default(),
    );

    let restore_root = work.path().join("out");
    let mut options = JobOptions::default();
    options.destination = Some(restore_root.clone());
    let job = Job::new(options, Arc::new(LocalStorage::new()));
    ops::restore(&job, &[archive_path.to_string_lossy().into_owned()]).unwrap();

    assert_eq!(fs::read(restore_root.join(logical_name)).unwrap(), b"ORIGINAL");
}

#[test]
fn compare_reports_offset_within_fragment() {
    let work = tempfile::tempdir().unwrap();

    // A logical 3000-byte file; the archive carries only fragment
    // [1000, 3000). The on-disk copy differs at absolute offset 1500.
    let mut content = vec![0xA7u8; 3000];
    let disk_path = work.path().join("frag.bin");

    let archive_path = work.path().join("frag.bar");
    let info = FileInfo::default();
    let name = disk_path.to_string_lossy().into_owned();
    write_fragment_archive(&archive_path, &name, 3000, &[(1000, &content[1000..])], info);

    content[1500] ^= 0x01;
    fs::write(&disk_path, &content).unwrap();

    let mut options = JobOptions::default();
    options.no_fragments_check = true;
    options.max_threads = 1;
    let job = Job::new(options, Arc::new(LocalStorage::new()));
    let error = ops::compare(&job, &[archive_path.to_string_lossy().into_owned()]).unwrap_err();
    match error {
        Error::EntriesDiffer { name: entry, offset } => {
            assert_eq!(entry, name);
            assert_eq!(offset, 1500);
        }
        other => panic!("expected EntriesDiffer, got {other:?}"),
    }
}

#[test]
fn compare_accepts_partial_but_matching_fragments() {
    let work = tempfile::tempdir().unwrap();
    let content = vec![0x3Cu8; 2000];
    let disk_path = work.path().join("ok.bin");
    fs::write(&disk_path, &content).unwrap();

    let archive_path = work.path().join("ok.bar");
    let name = disk_path.to_string_lossy().into_owned();
    write_fragment_archive(
        &archive_path,
        &name,
        2000,
        &[(500, &content[500..1500])],
        FileInfo::default(),
    );

    // Content matches, but coverage is incomplete: the result is the
    // incomplete-entry code, preceded by a warning.
    let mut options = JobOptions::default();
    options.max_threads = 1;
    let job = Job::new(options, Arc::new(LocalStorage::new()));
    let error = ops::compare(&job, &[archive_path.to_string_lossy().into_owned()]).unwrap_err();
    match error {
        Error::EntryIncomplete { name: entry } => assert_eq!(entry, name),
        other => panic!("expected EntryIncomplete, got {other:?}"),
    }

    // With the fragment check disabled the compare succeeds.
    let mut options = JobOptions::default();
    options.no_fragments_check = true;
    options.max_threads = 1;
    let job = Job::new(options, Arc::new(LocalStorage::new()));
    ops::compare(&job, &[archive_path.to_string_lossy().into_owned()]).unwrap();
}
