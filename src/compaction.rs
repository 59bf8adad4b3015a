//! Key-based log cleaning and the cleanup checkpoint
//!
//! Compaction rewrites the sealed segment run of a partition so that only
//! the latest message per key survives. Keyless messages are untouchable and
//! always carried over; tombstones (keyed messages with an empty payload)
//! survive until a retention grace has elapsed since their timestamp, after
//! which the key disappears entirely.
//!
//! The rewrite is crash-safe: output segments are written and fsynced in a
//! staging directory, renamed into the partition directory, and only then are
//! the originals unlinked. Any failure before the swap leaves the original
//! run untouched. The pass is cooperatively cancellable at bundle
//! boundaries.
//!
//! `.cleanup.log` at the base path checkpoints, per partition, the highest
//! sequence number covered by a completed pass; it feeds the dirty-ratio
//! computation that decides when the next pass is due. The file is rewritten
//! whole through `.cleanup.log.int` and renamed over.

use crate::bundle::{decode_bundle, encode_bundle, Codec, Message};
use crate::config::PartitionConfig;
use crate::engine::FileOpener;
use crate::error::{IoResultExt, Result, TankError};
use crate::index::{rebuild_index, IndexWriter};
use crate::mmap::map_readonly;
use crate::segment::{index_filename, sealed_segment_filename, RoSegment};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// How long a tombstone keeps shadowing its key before both are dropped.
pub const TOMBSTONE_GRACE_SECS: u32 = 86_400;

/// Messages per sparse bundle in rewritten segments.
const OUT_BUNDLE_MAX_MSGS: usize = 64;

const STAGING_DIR: &str = ".cleanup.tmp";

const CHECKPOINT_FILE: &str = ".cleanup.log";
const CHECKPOINT_TMP: &str = ".cleanup.log.int";

struct Survivor {
    seq: u64,
    // scan ordinal; breaks seq ties in favor of the later file position
    ordinal: u64,
    tombstone: bool,
    ts: u64,
}

/// Rewrite the sealed run of a partition, retaining the latest message per
/// key. Returns the replacement segments, already reopened read-only.
pub fn compact(
    dir: &Path,
    segments: &VecDeque<RoSegment>,
    config: &PartitionConfig,
    opener: &FileOpener,
    now: u32,
    cancel: &AtomicBool,
) -> Result<VecDeque<RoSegment>> {
    let input_last = segments
        .back()
        .map(|s| s.last_seq())
        .ok_or_else(|| TankError::invariant("compaction over an empty segment run".to_string()))?;

    let survivors = collect_survivors(segments, now, cancel)?;

    let staging = dir.join(STAGING_DIR);
    let _ = std::fs::remove_dir_all(&staging);
    std::fs::create_dir_all(&staging).at_path(&staging)?;

    let outputs = match write_cleaned_run(
        &staging,
        segments,
        &survivors,
        config,
        input_last,
        now,
        cancel,
    ) {
        Ok(outputs) => outputs,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    // swap: move the cleaned run into place, then retire the originals
    let mut output_paths: HashSet<PathBuf> = HashSet::new();
    for out in &outputs {
        let data_target = dir.join(sealed_segment_filename(out.base_seq, out.last_seq, now));
        let index_target = dir.join(index_filename(out.base_seq));
        std::fs::rename(&out.data_path, &data_target).at_path(&out.data_path)?;
        std::fs::rename(&out.index_path, &index_target).at_path(&out.index_path)?;
        output_paths.insert(data_target);
        output_paths.insert(index_target);
    }
    sync_dir(dir)?;

    for seg in segments {
        if !output_paths.contains(seg.data_path()) {
            if let Err(e) = std::fs::remove_file(seg.data_path()) {
                warn!(path = %seg.data_path().display(), error = %e, "failed to unlink compacted segment");
            }
        }
        let index_path = dir.join(index_filename(seg.base_seq()));
        if !output_paths.contains(&index_path) {
            if let Err(e) = std::fs::remove_file(&index_path) {
                warn!(path = %index_path.display(), error = %e, "failed to unlink compacted index");
            }
        }
    }
    let _ = std::fs::remove_dir_all(&staging);

    let mut replacement = VecDeque::with_capacity(outputs.len());
    for out in &outputs {
        replacement.push_back(RoSegment::open(
            dir,
            out.base_seq,
            out.last_seq,
            now,
            opener,
            config.index_interval,
        )?);
    }

    info!(
        inputs = segments.len(),
        outputs = replacement.len(),
        last_cleanup_max_seq = input_last,
        "compaction finished"
    );
    Ok(replacement)
}

/// Pass 1: latest surviving record per key over the whole run.
fn collect_survivors(
    segments: &VecDeque<RoSegment>,
    now: u32,
    cancel: &AtomicBool,
) -> Result<HashMap<Bytes, Survivor>> {
    let mut latest: HashMap<Bytes, Survivor> = HashMap::new();
    let mut ordinal = 0u64;

    for seg in segments {
        let Some(data) = seg.map_sequential()? else { continue };
        let mut next_seq = seg.base_seq();
        let mut pos = 0usize;
        while pos < data.len() {
            if cancel.load(Ordering::Relaxed) {
                return Err(TankError::Cancelled);
            }
            let (consumed, bundle) = decode_bundle(&data[pos..], next_seq)?;
            for msg in bundle.msgs {
                let tombstone = msg.is_tombstone();
                let Some(key) = msg.key else { continue };
                ordinal += 1;
                let candidate = Survivor {
                    seq: msg.seq_num,
                    ordinal,
                    tombstone,
                    ts: msg.ts,
                };
                match latest.get(&key) {
                    Some(existing) if existing.seq > candidate.seq => {}
                    _ => {
                        latest.insert(key, candidate);
                    }
                }
            }
            next_seq = bundle.last_seq + 1;
            pos += consumed;
        }
    }

    // a tombstone past its grace drops the key entirely
    let now_ms = u64::from(now) * 1_000;
    let grace_ms = u64::from(TOMBSTONE_GRACE_SECS) * 1_000;
    latest.retain(|_, s| !(s.tombstone && now_ms.saturating_sub(s.ts) >= grace_ms));

    Ok(latest)
}

struct OutputSegment {
    base_seq: u64,
    last_seq: u64,
    data_path: PathBuf,
    index_path: PathBuf,
}

struct RunWriter<'a> {
    staging: &'a Path,
    max_segment_size: u64,
    index_interval: u64,
    // current output file, if any
    file: Option<(File, PathBuf, u64)>, // handle, path, bytes written
    first_seq: u64,
    last_seq: u64,
    pending: Vec<Message>,
    outputs: Vec<OutputSegment>,
    seq: usize, // staging file counter
}

impl<'a> RunWriter<'a> {
    fn new(staging: &'a Path, config: &PartitionConfig) -> Self {
        Self {
            staging,
            max_segment_size: config.max_segment_size,
            index_interval: config.index_interval,
            file: None,
            first_seq: 0,
            last_seq: 0,
            pending: Vec::new(),
            outputs: Vec::new(),
            seq: 0,
        }
    }

    fn push(&mut self, msg: Message) -> Result<()> {
        if self.pending.is_empty() && self.file.is_none() {
            self.first_seq = msg.seq_num;
        }
        self.last_seq = msg.seq_num;
        self.pending.push(msg);
        if self.pending.len() >= OUT_BUNDLE_MAX_MSGS {
            self.flush_bundle()?;
        }
        Ok(())
    }

    fn flush_bundle(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let encoded = encode_bundle(&self.pending, Codec::Snappy, true)?;
        self.pending.clear();

        if self.file.is_none() {
            let path = self.staging.join(format!("out-{}.ilog", self.seq));
            self.seq += 1;
            let file = File::create(&path).at_path(&path)?;
            self.file = Some((file, path, 0));
        }
        let (file, path, written) = self.file.as_mut().expect("output file just ensured");
        {
            use std::io::Write;
            file.write_all(&encoded).at_path(&*path)?;
        }
        *written += encoded.len() as u64;

        if *written >= self.max_segment_size {
            self.cut_segment()?;
        }
        Ok(())
    }

    /// Close the current output data file and remember its message range.
    fn cut_segment(&mut self) -> Result<()> {
        let Some((file, path, _)) = self.file.take() else {
            return Ok(());
        };
        file.sync_data().at_path(&path)?;
        self.outputs.push(OutputSegment {
            base_seq: self.first_seq,
            last_seq: self.last_seq,
            data_path: path,
            index_path: PathBuf::new(), // assigned in finish()
        });
        Ok(())
    }

    /// Tile the outputs over the input range so consecutive segments stay
    /// adjacent, build their indexes and fsync everything.
    fn finish(mut self, input_last: u64, now: u32, cancel: &AtomicBool) -> Result<Vec<OutputSegment>> {
        self.flush_bundle()?;
        self.cut_segment()?;

        let count = self.outputs.len();
        for k in 0..count {
            if cancel.load(Ordering::Relaxed) {
                return Err(TankError::Cancelled);
            }
            // bases after the first are pinned to the previous last + 1;
            // the final segment absorbs the tail of the input range
            if k > 0 {
                self.outputs[k].base_seq = self.outputs[k - 1].last_seq + 1;
            }
            if k + 1 == count {
                self.outputs[k].last_seq = input_last;
            } else {
                let next_first = self.outputs[k + 1].base_seq;
                self.outputs[k].last_seq = next_first - 1;
            }

            let out = &mut self.outputs[k];
            let final_data = self
                .staging
                .join(sealed_segment_filename(out.base_seq, out.last_seq, now));
            std::fs::rename(&out.data_path, &final_data).at_path(&out.data_path)?;
            out.data_path = final_data;

            out.index_path = self.staging.join(index_filename(out.base_seq));
            let index_file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .open(&out.index_path)
                .at_path(&out.index_path)?;
            let mut writer = IndexWriter::create(&out.index_path, index_file)?;
            let data_file = File::open(&out.data_path).at_path(&out.data_path)?;
            if data_file.metadata().at_path(&out.data_path)?.len() > 0 {
                let data = map_readonly(&data_file, &out.data_path)?;
                rebuild_index(&data, out.base_seq, self.index_interval, &mut writer)?;
            }
            writer.fdh().sync_data().at_path(&out.index_path)?;

            debug!(
                base_seq = out.base_seq,
                last_seq = out.last_seq,
                "staged compacted segment"
            );
        }

        sync_dir(self.staging)?;
        Ok(self.outputs)
    }
}

/// Pass 2: stream the run again, writing the retained messages as sparse
/// bundles into staged output segments.
fn write_cleaned_run(
    staging: &Path,
    segments: &VecDeque<RoSegment>,
    survivors: &HashMap<Bytes, Survivor>,
    config: &PartitionConfig,
    input_last: u64,
    now: u32,
    cancel: &AtomicBool,
) -> Result<Vec<OutputSegment>> {
    let mut writer = RunWriter::new(staging, config);
    let mut ordinal = 0u64;

    for seg in segments {
        let Some(data) = seg.map_sequential()? else { continue };
        let mut next_seq = seg.base_seq();
        let mut pos = 0usize;
        while pos < data.len() {
            if cancel.load(Ordering::Relaxed) {
                return Err(TankError::Cancelled);
            }
            let (consumed, bundle) = decode_bundle(&data[pos..], next_seq)?;
            for msg in bundle.msgs {
                let retained = match &msg.key {
                    None => true,
                    Some(key) => {
                        ordinal += 1;
                        survivors
                            .get(key)
                            .map(|s| s.ordinal == ordinal)
                            .unwrap_or(false)
                    }
                };
                if retained {
                    writer.push(msg)?;
                }
            }
            next_seq = bundle.last_seq + 1;
            pos += consumed;
        }
    }

    writer.finish(input_last, now, cancel)
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir).at_path(dir)?.sync_all().at_path(dir)
}

/// Per-partition compaction progress, persisted at the engine base path.
#[derive(Debug, Default)]
pub struct CleanupCheckpoint {
    entries: HashMap<(String, u16), u64>,
}

impl CleanupCheckpoint {
    /// Load `.cleanup.log` from `base`; a missing file is an empty
    /// checkpoint.
    pub fn load(base: &Path) -> Result<Self> {
        let path = base.join(CHECKPOINT_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(TankError::io(&path, e)),
        };

        let mut entries = HashMap::new();
        let mut r = crate::varint::Reader::new(&raw);
        while !r.is_empty() {
            let len = r.read_u8()? as usize;
            let topic = std::str::from_utf8(r.read_bytes(len)?)
                .map_err(|_| TankError::malformed("cleanup checkpoint", "topic not utf-8"))?
                .to_string();
            let partition = r.read_u16_le()?;
            let last_cleanup_max_seq = r.read_u64_le()?;
            entries.insert((topic, partition), last_cleanup_max_seq);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, topic: &str, partition: u16) -> u64 {
        self.entries
            .get(&(topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    pub fn set(&mut self, topic: &str, partition: u16, last_cleanup_max_seq: u64) {
        self.entries
            .insert((topic.to_string(), partition), last_cleanup_max_seq);
    }

    /// Rewrite the checkpoint atomically via the `.int` file.
    pub fn store(&self, base: &Path) -> Result<()> {
        let mut buf = BytesMut::new();
        for ((topic, partition), seq) in &self.entries {
            buf.put_u8(topic.len() as u8);
            buf.put_slice(topic.as_bytes());
            buf.put_u16_le(*partition);
            buf.put_u64_le(*seq);
        }

        let tmp = base.join(CHECKPOINT_TMP);
        let target = base.join(CHECKPOINT_FILE);
        std::fs::write(&tmp, &buf).at_path(&tmp)?;
        File::open(&tmp).at_path(&tmp)?.sync_all().at_path(&tmp)?;
        std::fs::rename(&tmp, &target).at_path(&tmp)?;
        Ok(())
    }
}
