//! End-to-end scenarios exercised against a real file-backed device,
//! mirroring the journal's lifecycle from format through mount, append,
//! commit, and drain.

use std::fs::OpenOptions;
use std::sync::Arc;

use shallfs_engine::device::{BlockDevice, FileDevice};
use shallfs_engine::{
    Credentials, DecodeOutcome, Engine, MountOptions, Operation, Phase, RecordFields,
    decode_operation, encode_operation, format, parse_record,
};

const ALIGNMENT: u32 = 8;
const NUM_SUPERBLOCKS: u32 = 16;

fn open_formatted(size: u64) -> (tempfile::NamedTempFile, u64) {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(size).unwrap();
    let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
    let mut device = FileDevice::open(file, size);
    format(&mut device, ALIGNMENT, NUM_SUPERBLOCKS).unwrap();
    (tmp, size)
}

fn open_device(tmp: &tempfile::NamedTempFile, size: u64) -> FileDevice {
    let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
    FileDevice::open(file, size)
}

fn mount_record(path: &str) -> RecordFields {
    RecordFields {
        operation: encode_operation(Operation::Mount, Phase::After),
        req_sec: 1,
        req_nsec: 0,
        result: 0,
        creds: Some(Credentials { uid: 0, euid: 0, fsuid: 0, gid: 0, egid: 0, fsgid: 0 }),
        file1: Some(path.as_bytes().to_vec()),
        file2: None,
        payload: None,
    }
}

/// Scenario 1: format a 1 MiB file-backed device and verify the resulting
/// superblock.
#[test]
fn format_produces_a_valid_clean_superblock() {
    let size = 1 << 20;
    let (tmp, size) = open_formatted(size);
    let device = open_device(&tmp, size);

    let mut buf = [0u8; shallfs_engine::superblock::SUPERBLOCK_SIZE];
    device.read_at(shallfs_engine::superblock::SuperBlock::byte_offset(0), &mut buf).unwrap();
    let (sb, index) = shallfs_engine::superblock::SuperBlock::decode(&buf).unwrap();

    assert_eq!(index, 0);
    assert_eq!(sb.device_size, size);
    assert!(sb.is_valid());
    assert!(!sb.is_dirty());
    assert_eq!(sb.data_length, 0);
    assert_eq!(sb.data_space + 4096 * NUM_SUPERBLOCKS as u64, size);
}

/// Scenario 2: append a MOUNT record, commit, close, reopen, and drain.
#[test]
fn mount_record_survives_a_close_and_reopen() {
    let (tmp, size) = open_formatted(1 << 20);

    {
        let device = open_device(&tmp, size);
        let engine = Engine::mount(Box::new(device), MountOptions::default()).unwrap();
        engine.append(mount_record("/tmp/x")).unwrap();
        engine.commit().unwrap();
        engine.unmount().unwrap();
    }

    let device = open_device(&tmp, size);
    let engine = Engine::mount(Box::new(device), MountOptions::default()).unwrap();

    let mut buf = vec![0u8; 4096];
    let n = engine.read_records(&mut buf).unwrap();
    assert!(n > 0);

    match parse_record(&buf[..n]) {
        DecodeOutcome::Record(rec, _) => {
            let (op, phase) = decode_operation(rec.operation).unwrap();
            assert_eq!(op, Operation::Mount);
            assert_eq!(phase, Phase::After);
            assert_eq!(rec.file1, Some(b"/tmp/x".to_vec()));
            assert!(rec.creds.is_some());
        }
        other => panic!("expected a record, got {other:?}"),
    }

    engine.unmount().unwrap();
}

/// Scenario 3: a small `commit_size` forces several size-reason commits
/// across a batch of appends, and the final drain returns every record.
#[test]
fn small_commit_size_triggers_repeated_size_commits() {
    let (tmp, size) = open_formatted(4 << 20);
    let device = open_device(&tmp, size);

    let options = MountOptions { commit_size: 8192, ..MountOptions::default() };
    let engine = Engine::mount(Box::new(device), options).unwrap();

    for i in 0..100u32 {
        engine
            .append(RecordFields {
                operation: encode_operation(Operation::Write, Phase::After),
                req_sec: i as u64,
                req_nsec: 0,
                result: 0,
                creds: None,
                file1: None,
                file2: None,
                payload: Some(shallfs_engine::Payload::Data {
                    region: shallfs_engine::Region::default(),
                    bytes: vec![0u8; 300],
                }),
            })
            .unwrap();
    }
    engine.commit().unwrap();

    let counts = engine.commit_counts();
    assert!(counts[0] >= 3, "expected at least 3 size-reason commits, got {counts:?}");

    let mut delivered = 0u32;
    loop {
        let mut buf = vec![0u8; 65536];
        let n = engine.read_records(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        let mut pos = 0;
        while pos < n {
            match parse_record(&buf[pos..n]) {
                DecodeOutcome::Record(_, len) => {
                    delivered += 1;
                    pos += len;
                }
                _ => break,
            }
        }
    }
    assert_eq!(delivered, 100);

    engine.unmount().unwrap();
}

/// Scenario 4: a tight ring under the `DROP` overflow policy emits exactly
/// one `OVERFLOW` marker, drops the records that don't fit, and pairs a
/// `RECOVER` marker with the dropped count once a drain frees space.
#[test]
fn tight_ring_drops_and_then_recovers() {
    let num_superblocks = 16u32;
    let data_space = 65_536u64;
    let device_size = data_space + 4096 * num_superblocks as u64;
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(device_size).unwrap();
    {
        let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        let mut device = FileDevice::open(file, device_size);
        format(&mut device, ALIGNMENT, num_superblocks).unwrap();
    }

    let device = open_device(&tmp, device_size);
    let options = MountOptions { overflow_policy: shallfs_engine::OverflowPolicy::Drop, ..MountOptions::default() };
    let engine = Engine::mount(Box::new(device), options).unwrap();

    let mut overflow_markers = 0u32;
    for i in 0..500u32 {
        engine
            .append(RecordFields {
                operation: encode_operation(Operation::Write, Phase::After),
                req_sec: i as u64,
                req_nsec: 0,
                result: 0,
                creds: None,
                file1: None,
                file2: None,
                payload: Some(shallfs_engine::Payload::Data {
                    region: shallfs_engine::Region::default(),
                    bytes: vec![0u8; 184],
                }),
            })
            .unwrap();
    }
    engine.commit().unwrap();

    let mut buf = vec![0u8; data_space as usize];
    let n = engine.read_records(&mut buf).unwrap();
    let mut pos = 0;
    let mut delivered = 0u32;
    while pos < n {
        match parse_record(&buf[pos..n]) {
            DecodeOutcome::Record(rec, len) => {
                if decode_operation(rec.operation) == Some((Operation::Overflow, Phase::After)) {
                    overflow_markers += 1;
                }
                delivered += 1;
                pos += len;
            }
            _ => break,
        }
    }

    assert!(delivered < 500, "a tight ring must drop some records");
    assert_eq!(overflow_markers, 1, "exactly one OVERFLOW marker is expected");

    // A later append after the drain pairs a RECOVER marker with the drop.
    engine.append(mount_record("/tmp/after-recovery")).unwrap();
    engine.commit().unwrap();

    let mut buf = vec![0u8; data_space as usize];
    let n = engine.read_records(&mut buf).unwrap();
    let mut pos = 0;
    let mut saw_recover = false;
    while pos < n {
        match parse_record(&buf[pos..n]) {
            DecodeOutcome::Record(rec, len) => {
                if decode_operation(rec.operation) == Some((Operation::Recover, Phase::After)) {
                    saw_recover = true;
                    assert!(rec.result > 0);
                }
                pos += len;
            }
            _ => break,
        }
    }
    assert!(saw_recover, "expected a RECOVER marker after the drain freed space");

    engine.unmount().unwrap();
}

/// Scenario 5: an unclean shutdown leaves sb 0 `DIRTY`; remounting must
/// scan every superblock and select the greatest version rather than
/// trusting sb 0 blindly.
#[test]
fn dirty_superblock_forces_a_version_scan_on_remount() {
    let (tmp, size) = open_formatted(1 << 20);

    {
        let device = open_device(&tmp, size);
        let engine = Engine::mount(Box::new(device), MountOptions::default()).unwrap();
        engine.append(mount_record("/tmp/x")).unwrap();
        engine.commit().unwrap();
        // Deliberately skip unmount(): sb 0 stays DIRTY, simulating a crash.
    }

    let device = open_device(&tmp, size);
    let engine = Engine::mount(Box::new(device), MountOptions::default()).unwrap();

    let mut buf = vec![0u8; 4096];
    let n = engine.read_records(&mut buf).unwrap();
    assert!(n > 0, "the committed record must still be visible after the crash");

    engine.unmount().unwrap();
}

/// Scenario 6: concurrent producers and a concurrent consumer; every
/// record is delivered exactly once and every delivered header's CRC is
/// valid (checked implicitly by `parse_record` never returning `Invalid`).
#[test]
fn concurrent_producers_and_consumer_deliver_every_record() {
    let (tmp, size) = open_formatted(8 << 20);
    let device = open_device(&tmp, size);
    let engine = Engine::mount(Box::new(device), MountOptions::default()).unwrap();

    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 200;

    let mut handles = Vec::new();
    for thread_id in 0..THREADS {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            for seq in 0..PER_THREAD {
                let tag = format!("{thread_id}:{seq}");
                engine
                    .append(RecordFields {
                        operation: encode_operation(Operation::UserLog, Phase::After),
                        req_sec: 0,
                        req_nsec: 0,
                        result: 0,
                        creds: None,
                        file1: Some(tag.into_bytes()),
                        file2: None,
                        payload: None,
                    })
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    engine.commit().unwrap();

    let mut seen = std::collections::HashSet::new();
    loop {
        let mut buf = vec![0u8; 65536];
        let n = engine.read_records(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        let mut pos = 0;
        while pos < n {
            match parse_record(&buf[pos..n]) {
                DecodeOutcome::Record(rec, len) => {
                    let tag = String::from_utf8(rec.file1.unwrap()).unwrap();
                    assert!(seen.insert(tag), "every (thread_id, seq) tag must appear exactly once");
                    pos += len;
                }
                other => panic!("unexpected decode outcome mid-stream: {other:?}"),
            }
        }
    }

    assert_eq!(seen.len(), (THREADS * PER_THREAD) as usize);
    engine.unmount().unwrap();
}
