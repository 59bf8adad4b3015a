//! End-to-end scenarios for the partition log engine
//!
//! Each test drives the public API against a real temporary directory:
//! append/read round trips, segment rolling, both retention policies, crash
//! recovery without an index, and key-based compaction.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use tanklog::flush::Flusher;
use tanklog::partition::{IterAction, NewMessage, PartitionLog, RetentionOutcome};
use tanklog::{Codec, Engine, FileOpener, Message, PartitionConfig};
use tempfile::tempdir;

fn value_msg(payload: String) -> NewMessage {
    NewMessage {
        ts: 0,
        key: None,
        payload: Bytes::from(payload),
    }
}

fn open_log(dir: &Path, config: PartitionConfig, now: u32) -> PartitionLog {
    PartitionLog::open(
        dir,
        "events",
        0,
        config,
        FileOpener::default(),
        Flusher::disconnected(),
        0,
        now,
    )
    .unwrap()
}

fn collect(log: &PartitionLog) -> Vec<Message> {
    let mut msgs = Vec::new();
    log.for_each_msg(&mut |m: &Message| {
        msgs.push(m.clone());
        IterAction::Continue
    })
    .unwrap();
    msgs
}

/// Replay bundle headers from the start of a segment file to verify that
/// `offset` sits on a bundle boundary and that the bundle there covers
/// `seq`.
fn assert_offset_covers(data: &[u8], base_seq: u64, offset: u64, seq: u64) {
    let mut pos = 0usize;
    let mut next = base_seq;
    while pos < offset as usize {
        let header = tanklog::bundle::read_bundle_header(&data[pos..]).unwrap();
        let (_, last) = header.seq_range(next);
        next = last + 1;
        pos += header.total_len;
    }
    assert_eq!(pos, offset as usize, "offset {offset} is not a bundle boundary");
    let header = tanklog::bundle::read_bundle_header(&data[pos..]).unwrap();
    let (first, last) = header.seq_range(next);
    assert!(
        first <= seq && seq <= last,
        "bundle [{first}, {last}] does not cover {seq}"
    );
}

#[test]
fn basic_append_read() {
    let dir = tempdir().unwrap();
    let config = PartitionConfig::parse(
        "log.segment.bytes = 1mb\nlog.index.interval.bytes = 4k\n",
    )
    .unwrap();
    let mut log = open_log(dir.path(), config, 1_000);

    for i in 0..1_000u64 {
        let msg = NewMessage {
            ts: 1_700_000_000_000 + i,
            key: None,
            payload: Bytes::from(format!("v{i}")),
        };
        log.append(1_000, &[msg], Codec::None).unwrap();
    }

    let msgs = collect(&log);
    assert_eq!(msgs.len(), 1_000);
    for (i, msg) in msgs.iter().enumerate() {
        assert_eq!(msg.seq_num, i as u64);
        assert_eq!(msg.ts, 1_700_000_000_000 + i as u64);
        assert_eq!(msg.payload, Bytes::from(format!("v{i}")));
    }
}

#[test]
fn segment_rolling() {
    let dir = tempdir().unwrap();
    let config = PartitionConfig::parse("log.segment.bytes = 4096\n").unwrap();
    let mut log = open_log(dir.path(), config, 1_000);

    let payload = "x".repeat(512);
    let mut appended = 0u64;
    while log.ro_segment_count() < 4 {
        log.append(1_000, &[value_msg(payload.clone())], Codec::None)
            .unwrap();
        appended += 1;
    }

    // every sealed data file respects the roll threshold (plus at most one
    // bundle of overrun) and consecutive segments stay adjacent
    let mut sealed: Vec<(u64, u64, u64)> = Vec::new(); // (base, last, size)
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().into_string().unwrap();
        if let Some(tanklog::segment::SegmentFileName::Sealed {
            base_seq, last_seq, ..
        }) = tanklog::segment::parse_segment_filename(&name)
        {
            let size = entry.metadata().unwrap().len();
            sealed.push((base_seq, last_seq, size));
        }
    }
    sealed.sort();
    assert_eq!(sealed.len(), 4);

    let one_bundle_overrun = 512 + 64;
    for window in sealed.windows(2) {
        assert_eq!(window[1].0, window[0].1 + 1);
    }
    for (_, _, size) in &sealed {
        assert!(*size <= 4_096 + one_bundle_overrun);
    }

    let msgs = collect(&log);
    assert_eq!(msgs.len() as u64, appended);
    assert!(msgs.windows(2).all(|w| w[1].seq_num == w[0].seq_num + 1));
}

#[test]
fn delete_retention_by_count() {
    let dir = tempdir().unwrap();
    let config = PartitionConfig::parse(
        "log.segment.bytes = 4096\nretention.segments.count = 2\n",
    )
    .unwrap();
    let mut log = open_log(dir.path(), config, 1_000);

    let payload = "y".repeat(512);
    while log.ro_segment_count() < 5 {
        log.append(1_000, &[value_msg(payload.clone())], Codec::None)
            .unwrap();
    }

    let outcome = log.consider_ro_segments(1_010).unwrap();
    assert!(matches!(outcome, RetentionOutcome::Deleted { .. }));
    assert_eq!(log.ro_segment_count(), 2);

    // exactly two sealed files survive on disk, plus the active one
    let ilogs: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .filter(|n| n.ends_with(".ilog"))
        .collect();
    assert_eq!(ilogs.len(), 3);

    // firstAvailableSeqNum equals the surviving front's base and iteration
    // starts there
    let msgs = collect(&log);
    assert_eq!(msgs[0].seq_num, log.first_available_seq_num());
    assert!(msgs[0].seq_num > 0);
}

#[test]
fn delete_retention_by_age() {
    let dir = tempdir().unwrap();
    let config = PartitionConfig::parse(
        "log.segment.bytes = 4096\nlog.retention.secs = 60\n",
    )
    .unwrap();

    let now = 2_000u32;
    {
        let mut log = open_log(dir.path(), config.clone(), now);
        let payload = "z".repeat(512);
        while log.ro_segment_count() < 3 {
            log.append(now, &[value_msg(payload.clone())], Codec::None)
                .unwrap();
        }
        // everything was just created; nothing is old enough to delete
        assert_eq!(log.consider_ro_segments(now).unwrap(), RetentionOutcome::Idle);
    }

    // backdate the oldest sealed segment's creation timestamp on disk
    let mut sealed: Vec<(u64, u64, u32, String)> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .filter_map(|name| match tanklog::segment::parse_segment_filename(&name) {
            Some(tanklog::segment::SegmentFileName::Sealed {
                base_seq,
                last_seq,
                created_ts,
            }) => Some((base_seq, last_seq, created_ts, name)),
            _ => None,
        })
        .collect();
    sealed.sort();
    let (base, last, _, old_name) = sealed[0].clone();
    let backdated = tanklog::segment::sealed_segment_filename(base, last, now - 61);
    std::fs::rename(dir.path().join(&old_name), dir.path().join(&backdated)).unwrap();

    let mut log = open_log(dir.path(), config, now);
    let outcome = log.consider_ro_segments(now).unwrap();
    assert_eq!(outcome, RetentionOutcome::Deleted { segments: 1 });

    assert!(!dir.path().join(&backdated).exists());
    assert!(!dir
        .path()
        .join(tanklog::segment::index_filename(base))
        .exists());
    assert_eq!(log.first_available_seq_num(), last + 1);
}

#[test]
fn crash_restart_without_index() {
    let dir = tempdir().unwrap();
    let config = PartitionConfig::parse(
        "log.segment.bytes = 1mb\nlog.index.interval.bytes = 4k\n",
    )
    .unwrap();

    {
        let mut log = open_log(dir.path(), config.clone(), 1_000);
        for i in 0..1_000u64 {
            let msg = NewMessage {
                ts: 1_700_000_000_000 + i,
                key: None,
                payload: Bytes::from(format!("v{i}")),
            };
            log.append(1_000, &[msg], Codec::None).unwrap();
        }
    }

    std::fs::remove_file(dir.path().join("0.index")).unwrap();

    let log = open_log(dir.path(), config, 1_100);
    let msgs = collect(&log);
    assert_eq!(msgs.len(), 1_000);
    assert!(msgs.iter().enumerate().all(|(i, m)| m.seq_num == i as u64));

    // the index came back and lookups land on covering bundle boundaries
    assert!(dir.path().join("0.index").exists());
    assert!(std::fs::metadata(dir.path().join("0.index")).unwrap().len() > 0);

    let range = log.lookup(500).unwrap();
    let data = std::fs::read(dir.path().join("0.ilog")).unwrap();
    assert_offset_covers(&data, range.base_seq, range.offset, 500);
}

#[test]
fn compaction_latest_per_key() {
    let dir = tempdir().unwrap();
    let config = PartitionConfig::parse(
        "log.segment.bytes = 4096\nlog.cleanup.policy = cleanup\nlog.cleaner.min.cleanable.ratio = 0.3\n",
    )
    .unwrap();
    let mut log = open_log(dir.path(), config, 1_000);

    for round in 0..100 {
        for key in ["k1", "k2", "k3", "k4"] {
            log.append(
                1_000,
                &[NewMessage {
                    ts: 1_700_000_000_000 + round,
                    key: Some(Bytes::copy_from_slice(key.as_bytes())),
                    payload: Bytes::from(format!("{key}-payload-{round}")),
                }],
                Codec::None,
            )
            .unwrap();
        }
    }
    // filler appends push the final k1..k4 values out of the active segment
    for i in 0..8 {
        log.append(
            1_000,
            &[NewMessage {
                ts: 1_700_000_000_400 + i,
                key: None,
                payload: Bytes::copy_from_slice(&vec![b'f'; 512]),
            }],
            Codec::None,
        )
        .unwrap();
    }

    let outcome = log.consider_ro_segments(1_100).unwrap();
    assert!(matches!(outcome, RetentionOutcome::Compacted { .. }));

    let msgs = collect(&log);
    let mut per_key: HashMap<&[u8], Vec<&Message>> = HashMap::new();
    for msg in &msgs {
        if let Some(key) = &msg.key {
            per_key.entry(key.as_ref()).or_default().push(msg);
        }
    }

    // exactly one message per key survives and it carries the final payload
    assert_eq!(per_key.len(), 4);
    for key in ["k1", "k2", "k3", "k4"] {
        let survivors = per_key.get(key.as_bytes()).unwrap();
        assert_eq!(survivors.len(), 1, "{key} should collapse to one message");
        assert_eq!(
            survivors[0].payload,
            Bytes::from(format!("{key}-payload-99"))
        );
    }

    // relative order follows the final sequence numbers: k1 < k2 < k3 < k4
    let final_seqs: Vec<u64> = ["k1", "k2", "k3", "k4"]
        .iter()
        .map(|k| per_key.get(k.as_bytes()).unwrap()[0].seq_num)
        .collect();
    assert!(final_seqs.windows(2).all(|w| w[0] < w[1]));

    // iteration order is still globally sorted by sequence number
    assert!(msgs.windows(2).all(|w| w[0].seq_num < w[1].seq_num));
}

#[test]
fn engine_survives_restart_with_retention() {
    let dir = tempdir().unwrap();
    let defaults = PartitionConfig::parse(
        "log.segment.bytes = 4096\nretention.segments.count = 3\n",
    )
    .unwrap();

    {
        let mut engine = Engine::open(dir.path(), defaults.clone(), None, 1_000).unwrap();
        engine.create_partition("audit", 0, 1_000).unwrap();
        for i in 0..64u64 {
            engine
                .append(
                    "audit",
                    0,
                    1_000,
                    &[NewMessage {
                        ts: 1_700_000_000_000 + i,
                        key: None,
                        payload: Bytes::from("e".repeat(256)),
                    }],
                    Codec::Snappy,
                )
                .unwrap();
        }
        engine.tick(1_010);
        engine.shutdown(1_010);
    }

    let mut engine = Engine::open(dir.path(), defaults, None, 2_000).unwrap();
    assert_eq!(engine.partition_count(), 1);
    assert_eq!(engine.next_seq("audit", 0, 2_000).unwrap(), 64);

    let first = engine.first_available_seq_num("audit", 0, 2_000).unwrap();
    let mut seen = Vec::new();
    engine
        .for_each_msg("audit", 0, 2_000, &mut |m: &Message| {
            seen.push(m.seq_num);
            IterAction::Continue
        })
        .unwrap();
    assert_eq!(seen.first().copied(), Some(first));
    assert_eq!(seen.last().copied(), Some(63));
    assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
    engine.shutdown(2_000);
}
