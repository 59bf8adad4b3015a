//! Property-based tests for the log engine
//!
//! Uses proptest to push randomized inputs through the codec, the index and
//! the partition log, verifying the invariants that unit tests only probe
//! pointwise: bit-exact codec round trips, monotone iteration, index lookup
//! correctness, rebuild idempotence, retention monotonicity and
//! latest-per-key compaction.

use bytes::Bytes;
use proptest::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use tanklog::bundle::{decode_bundle, encode_bundle, read_bundle_header};
use tanklog::flush::Flusher;
use tanklog::partition::{IterAction, NewMessage, PartitionLog};
use tanklog::{Codec, FileOpener, Message, PartitionConfig};
use tempfile::tempdir;

fn arbitrary_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

fn arbitrary_key() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(any::<u8>(), 0..32))
}

fn arbitrary_codec() -> impl Strategy<Value = Codec> {
    prop_oneof![Just(Codec::None), Just(Codec::Snappy)]
}

/// Draft messages: (ts, key, payload) tuples without sequence numbers.
fn arbitrary_drafts(max: usize) -> impl Strategy<Value = Vec<(u64, Option<Vec<u8>>, Vec<u8>)>> {
    prop::collection::vec((0..u64::MAX / 2, arbitrary_key(), arbitrary_payload()), 1..max)
}

fn materialize(drafts: &[(u64, Option<Vec<u8>>, Vec<u8>)], seqs: &[u64]) -> Vec<Message> {
    drafts
        .iter()
        .zip(seqs)
        .map(|((ts, key, payload), seq)| Message {
            seq_num: *seq,
            ts: *ts,
            key: key.clone().map(Bytes::from),
            payload: Bytes::from(payload.clone()),
        })
        .collect()
}

fn open_log(dir: &Path, config: PartitionConfig) -> PartitionLog {
    PartitionLog::open(
        dir,
        "prop",
        0,
        config,
        FileOpener::default(),
        Flusher::disconnected(),
        0,
        1_000,
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

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Dense bundles survive an encode/decode round trip bit-exactly.
    #[test]
    fn codec_roundtrip_dense(
        drafts in arbitrary_drafts(40),
        base in 0..u64::MAX / 4,
        codec in arbitrary_codec(),
    ) {
        let seqs: Vec<u64> = (0..drafts.len() as u64).map(|i| base + i).collect();
        let msgs = materialize(&drafts, &seqs);

        let encoded = encode_bundle(&msgs, codec, false).unwrap();
        let (consumed, decoded) = decode_bundle(&encoded, base).unwrap();

        prop_assert_eq!(consumed, encoded.len());
        prop_assert_eq!(decoded.first_seq, base);
        prop_assert_eq!(decoded.last_seq, base + drafts.len() as u64 - 1);
        prop_assert_eq!(decoded.msgs, msgs);
    }

    /// Sparse bundles reconstruct explicit sequence numbers exactly,
    /// whatever the running sequence of the surrounding scan says.
    #[test]
    fn codec_roundtrip_sparse(
        drafts in arbitrary_drafts(40),
        base in 0..u64::MAX / 4,
        gaps in prop::collection::vec(0u64..1000, 40),
        codec in arbitrary_codec(),
        wrong_next in 0..u64::MAX / 4,
    ) {
        let mut seqs = Vec::with_capacity(drafts.len());
        let mut seq = base;
        for gap in gaps.iter().take(drafts.len()) {
            seqs.push(seq);
            seq += 1 + gap;
        }
        let msgs = materialize(&drafts, &seqs);

        let encoded = encode_bundle(&msgs, codec, true).unwrap();
        let (_, decoded) = decode_bundle(&encoded, wrong_next).unwrap();
        prop_assert_eq!(decoded.msgs, msgs);
    }

    /// Iterating a log after arbitrary appends yields strictly increasing
    /// sequence numbers starting at the first available one.
    #[test]
    fn iteration_is_dense_and_ordered(
        batch_sizes in prop::collection::vec(1usize..10, 1..20),
        segment_bytes in 256u64..2048,
    ) {
        let dir = tempdir().unwrap();
        let config = PartitionConfig {
            max_segment_size: segment_bytes,
            ..Default::default()
        };
        let mut log = open_log(dir.path(), config);

        let mut expected = 0u64;
        for size in &batch_sizes {
            let batch: Vec<NewMessage> = (0..*size)
                .map(|i| NewMessage {
                    ts: 1 + i as u64,
                    key: None,
                    payload: Bytes::from(vec![b'p'; 32]),
                })
                .collect();
            let (first, last) = log.append(1_000, &batch, Codec::None).unwrap();
            prop_assert_eq!(first, expected);
            expected = last + 1;
        }

        let msgs = collect(&log);
        prop_assert_eq!(msgs.len() as u64, expected);
        for (i, msg) in msgs.iter().enumerate() {
            prop_assert_eq!(msg.seq_num, i as u64);
        }
    }

    /// Every lookup lands on a bundle boundary whose bundle covers the
    /// requested sequence number.
    #[test]
    fn lookup_lands_on_covering_bundle(
        batch_sizes in prop::collection::vec(1usize..6, 4..24),
        targets in prop::collection::vec(0.0f64..1.0, 8),
    ) {
        let dir = tempdir().unwrap();
        let config = PartitionConfig {
            max_segment_size: 512,
            ..Default::default()
        };
        let mut log = open_log(dir.path(), config);

        for size in &batch_sizes {
            let batch: Vec<NewMessage> = (0..*size)
                .map(|_| NewMessage {
                    ts: 9,
                    key: None,
                    payload: Bytes::from(vec![b'q'; 24]),
                })
                .collect();
            log.append(1_000, &batch, Codec::None).unwrap();
        }

        let total = log.next_seq();
        for t in &targets {
            let seq = ((total as f64) * t) as u64;
            let seq = seq.min(total - 1);
            let range = log.lookup(seq).unwrap();

            // replay headers up to the offset: boundary + coverage
            // (positional reads; the shared cursor belongs to the writer)
            let mut data = vec![0u8; range.file_size as usize];
            {
                use std::os::unix::fs::FileExt;
                range.fdh.read_exact_at(&mut data, 0).unwrap();
            }
            let mut pos = 0usize;
            let mut next = range.base_seq;
            while pos < range.offset as usize {
                let header = read_bundle_header(&data[pos..]).unwrap();
                let (_, last) = header.seq_range(next);
                next = last + 1;
                pos += header.total_len;
            }
            prop_assert_eq!(pos, range.offset as usize);
            let header = read_bundle_header(&data[pos..]).unwrap();
            let (first, last) = header.seq_range(next);
            prop_assert!(first <= seq && seq <= last);
        }
    }

    /// Deleting the index and reopening regenerates a byte-identical file.
    #[test]
    fn index_rebuild_is_idempotent(
        batch_sizes in prop::collection::vec(1usize..8, 4..20),
        index_interval in 128u64..1024,
    ) {
        let dir = tempdir().unwrap();
        let config = PartitionConfig {
            max_segment_size: 1024,
            index_interval,
            ..Default::default()
        };
        {
            let mut log = open_log(dir.path(), config.clone());
            for size in &batch_sizes {
                let batch: Vec<NewMessage> = (0..*size)
                    .map(|_| NewMessage {
                        ts: 5,
                        key: None,
                        payload: Bytes::from(vec![b'r'; 48]),
                    })
                    .collect();
                log.append(1_000, &batch, Codec::None).unwrap();
            }
        }

        let index_files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().into_string().ok())
            .filter(|n| n.ends_with(".index"))
            .collect();
        let originals: HashMap<String, Vec<u8>> = index_files
            .iter()
            .map(|n| (n.clone(), std::fs::read(dir.path().join(n)).unwrap()))
            .collect();

        for name in &index_files {
            std::fs::remove_file(dir.path().join(name)).unwrap();
        }
        let log = open_log(dir.path(), config);
        drop(log);

        for (name, original) in &originals {
            let rebuilt = std::fs::read(dir.path().join(name)).unwrap();
            prop_assert_eq!(&rebuilt, original, "index {} diverged after rebuild", name);
        }
    }

    /// firstAvailableSeqNum never moves backwards across retention passes.
    #[test]
    fn delete_retention_is_monotone(
        rounds in prop::collection::vec((1usize..6, 0u32..3), 2..12),
    ) {
        let dir = tempdir().unwrap();
        let config = PartitionConfig {
            max_segment_size: 256,
            ro_segments_cnt: 2,
            ..Default::default()
        };
        let mut log = open_log(dir.path(), config);

        let mut now = 1_000u32;
        let mut previous_first = log.first_available_seq_num();
        for (appends, idle) in &rounds {
            for _ in 0..*appends {
                log.append(now, &[NewMessage {
                    ts: 1,
                    key: None,
                    payload: Bytes::from(vec![b's'; 64]),
                }], Codec::None).unwrap();
            }
            now += idle;
            log.consider_ro_segments(now).unwrap();

            let first = log.first_available_seq_num();
            prop_assert!(first >= previous_first);
            prop_assert!(first <= log.next_seq());
            previous_first = first;
        }
    }

    /// Compaction keeps exactly the highest-sequence message per key within
    /// the sealed run.
    #[test]
    fn compaction_keeps_latest_per_key(
        writes in prop::collection::vec((0u8..5, arbitrary_payload()), 20..80),
    ) {
        let dir = tempdir().unwrap();
        let config = PartitionConfig {
            max_segment_size: 512,
            log_cleanup_policy: tanklog::CleanupPolicy::Cleanup,
            log_clean_ratio_min: 0.0,
            ..Default::default()
        };
        let mut log = open_log(dir.path(), config);

        let mut expected: HashMap<u8, (u64, Vec<u8>)> = HashMap::new();
        for (key_id, payload) in &writes {
            let (_, seq) = log.append(1_000, &[NewMessage {
                ts: 7,
                key: Some(Bytes::from(vec![*key_id])),
                // non-empty payloads only; tombstones have their own test
                payload: Bytes::from([&[1u8], payload.as_slice()].concat()),
            }], Codec::None).unwrap();
            expected.insert(*key_id, (seq, [&[1u8], payload.as_slice()].concat()));
        }

        log.consider_ro_segments(2_000).unwrap();

        let sealed_last = log.last_cleanup_max_seq();
        let msgs = collect(&log);
        let mut sealed_per_key: HashMap<u8, Vec<&Message>> = HashMap::new();
        for msg in &msgs {
            if msg.seq_num <= sealed_last {
                let key = msg.key.as_ref().unwrap()[0];
                sealed_per_key.entry(key).or_default().push(msg);
            }
        }

        for (key, survivors) in &sealed_per_key {
            prop_assert_eq!(survivors.len(), 1, "key {} kept {} messages", key, survivors.len());
            let survivor = survivors[0];
            let (expected_seq, expected_payload) = &expected[key];
            // the survivor is the latest write unless that write is still
            // in the active segment
            if *expected_seq <= sealed_last {
                prop_assert_eq!(survivor.seq_num, *expected_seq);
                prop_assert_eq!(survivor.payload.as_ref(), expected_payload.as_slice());
            }
        }
    }
}
