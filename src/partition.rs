//! Partition log: the ordered run of sealed segments plus the writable tail
//!
//! All mutable state of a partition lives here and is only ever touched from
//! the engine's event loop thread. The log drives the append path (encode,
//! roll if needed, write, index, flush accounting), sequence lookup for the
//! read path, retention dispatch and full-log iteration.
//!
//! Sequence numbers are dense and monotonically increasing, assigned at
//! append time; sparse appends (replicated tails, compaction rewrites) carry
//! explicit numbers and may skip ahead but never go backwards.

use crate::bundle::{decode_bundle, encode_bundle, Codec, Message};
use crate::compaction;
use crate::config::{CleanupPolicy, PartitionConfig};
use crate::engine::FileOpener;
use crate::error::{IoResultExt, Result, TankError};
use crate::flush::Flusher;
use crate::segment::{
    index_filename, parse_segment_filename, sealed_segment_filename, ActiveSegment, FdHandle,
    RoSegment, SegmentFileName,
};
use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::{debug, info, warn};

/// Visitor verdict for [`PartitionLog::for_each_msg`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterAction {
    Continue,
    Stop,
}

/// Callback over stored messages
pub trait MsgVisitor {
    fn on_msg(&mut self, msg: &Message) -> IterAction;
}

impl<F: FnMut(&Message) -> IterAction> MsgVisitor for F {
    fn on_msg(&mut self, msg: &Message) -> IterAction {
        self(msg)
    }
}

/// A message handed to [`PartitionLog::append`], before a sequence number is
/// assigned
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Milliseconds since epoch
    pub ts: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// A readable byte range within one segment, for the wire path: the caller
/// serves `[offset, file_size)` straight off the descriptor.
pub struct ReadRange {
    pub fdh: FdHandle,
    pub file_size: u64,
    pub offset: u64,
    pub base_seq: u64,
}

/// What a retention pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionOutcome {
    Idle,
    Deleted { segments: usize },
    Compacted { last_cleanup_max_seq: u64 },
}

struct FlushState {
    pending_msgs: u32,
    next_flush_ts: u32,
}

/// One partition's log
pub struct PartitionLog {
    topic: String,
    partition: u16,
    dir: PathBuf,
    config: PartitionConfig,
    opener: FileOpener,
    flusher: Flusher,
    cur: ActiveSegment,
    ro_segments: VecDeque<RoSegment>,
    first_available_seq_num: u64,
    next_seq: u64,
    roll_jitter: u32,
    flush_state: FlushState,
    compacting: bool,
    last_cleanup_max_seq: u64,
}

impl PartitionLog {
    /// Open (or create) the log stored under `dir`.
    ///
    /// Reconstructs the segment list from the file names, validates the
    /// structural invariants, adopts a leftover active segment and rebuilds
    /// any missing index along the way.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        dir: &Path,
        topic: &str,
        partition: u16,
        config: PartitionConfig,
        opener: FileOpener,
        flusher: Flusher,
        last_cleanup_max_seq: u64,
        now: u32,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir).at_path(dir)?;

        let mut sealed: Vec<(u64, u64, u32)> = Vec::new();
        let mut active_bases: Vec<u64> = Vec::new();

        for entry in std::fs::read_dir(dir).at_path(dir)? {
            let entry = entry.at_path(dir)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match parse_segment_filename(name) {
                Some(SegmentFileName::Active { base_seq }) => active_bases.push(base_seq),
                Some(SegmentFileName::Sealed {
                    base_seq,
                    last_seq,
                    created_ts,
                }) => sealed.push((base_seq, last_seq, created_ts)),
                None => {}
            }
        }

        if active_bases.len() > 1 {
            return Err(TankError::invariant(format!(
                "{topic}/{partition}: {} active segments on disk, expected at most one",
                active_bases.len()
            )));
        }

        sealed.sort_by_key(|(base, _, _)| *base);
        for pair in sealed.windows(2) {
            let (_, prev_last, _) = pair[0];
            let (next_base, _, _) = pair[1];
            if next_base != prev_last + 1 {
                return Err(TankError::invariant(format!(
                    "{topic}/{partition}: segment gap between {prev_last} and {next_base}"
                )));
            }
        }

        let mut ro_segments = VecDeque::with_capacity(sealed.len());
        for (base_seq, last_seq, created_ts) in &sealed {
            ro_segments.push_back(RoSegment::open(
                dir,
                *base_seq,
                *last_seq,
                *created_ts,
                &opener,
                config.index_interval,
            )?);
        }

        let tail_base = sealed.last().map(|(_, last, _)| last + 1);
        let (cur, next_seq) = match active_bases.first() {
            Some(&base_seq) => {
                if let Some(expected) = tail_base {
                    if base_seq != expected {
                        return Err(TankError::invariant(format!(
                            "{topic}/{partition}: active segment starts at {base_seq}, expected {expected}"
                        )));
                    }
                }
                ActiveSegment::open_existing(dir, base_seq, &opener, config.index_interval)?
            }
            None => {
                let base_seq = tail_base.unwrap_or(0);
                (ActiveSegment::create(dir, base_seq, now, &opener)?, base_seq)
            }
        };

        let first_available_seq_num = ro_segments
            .front()
            .map(|s| s.base_seq())
            .unwrap_or_else(|| cur.base_seq());

        let roll_jitter = stable_roll_jitter(topic, partition, config.max_roll_jitter_secs);
        let next_flush_ts = now.saturating_add(config.flush_interval_secs);

        info!(
            topic,
            partition,
            ro_segments = ro_segments.len(),
            first_available_seq_num,
            next_seq,
            "opened partition log"
        );

        Ok(Self {
            topic: topic.to_string(),
            partition,
            dir: dir.to_path_buf(),
            config,
            opener,
            flusher,
            cur,
            ro_segments,
            first_available_seq_num,
            next_seq,
            roll_jitter,
            flush_state: FlushState {
                pending_msgs: 0,
                next_flush_ts,
            },
            compacting: false,
            last_cleanup_max_seq,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u16 {
        self.partition
    }

    /// Sequence number the next append will receive; doubles as the
    /// partition's high-water mark.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Oldest sequence number still stored.
    pub fn first_available_seq_num(&self) -> u64 {
        self.first_available_seq_num
    }

    pub fn ro_segment_count(&self) -> usize {
        self.ro_segments.len()
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Highest sequence number covered by the last compaction pass.
    pub fn last_cleanup_max_seq(&self) -> u64 {
        self.last_cleanup_max_seq
    }

    pub(crate) fn ro_segments(&self) -> &VecDeque<RoSegment> {
        &self.ro_segments
    }

    /// Swap in an updated configuration; takes effect from the next append
    /// or retention pass.
    pub fn update_config(&mut self, config: PartitionConfig) {
        self.roll_jitter =
            stable_roll_jitter(&self.topic, self.partition, config.max_roll_jitter_secs);
        self.config = config;
    }

    /// Append a batch of messages as one bundle, assigning dense sequence
    /// numbers. Returns the `[first, last]` range assigned.
    pub fn append(&mut self, now: u32, batch: &[NewMessage], codec: Codec) -> Result<(u64, u64)> {
        if batch.is_empty() {
            return Err(TankError::malformed("bundle", "empty append batch"));
        }

        let first = self.next_seq;
        let msgs: Vec<Message> = batch
            .iter()
            .enumerate()
            .map(|(i, m)| Message {
                seq_num: first + i as u64,
                ts: m.ts,
                key: m.key.clone(),
                payload: m.payload.clone(),
            })
            .collect();

        let encoded = encode_bundle(&msgs, codec, false)?;
        self.write_bundle(now, &encoded, first, first + batch.len() as u64 - 1)
    }

    /// Append messages carrying explicit sequence numbers as a sparse
    /// bundle. Numbers must be strictly increasing and start at or past the
    /// current tail.
    pub fn append_sparse(&mut self, now: u32, msgs: &[Message], codec: Codec) -> Result<(u64, u64)> {
        if msgs.is_empty() {
            return Err(TankError::malformed("bundle", "empty append batch"));
        }
        if msgs[0].seq_num < self.next_seq {
            return Err(TankError::invariant(format!(
                "sparse append at {} behind the tail {}",
                msgs[0].seq_num, self.next_seq
            )));
        }

        let encoded = encode_bundle(msgs, codec, true)?;
        let first = msgs[0].seq_num;
        let last = msgs[msgs.len() - 1].seq_num;
        self.write_bundle(now, &encoded, first, last)
    }

    fn write_bundle(
        &mut self,
        now: u32,
        encoded: &[u8],
        first: u64,
        last: u64,
    ) -> Result<(u64, u64)> {
        if self
            .cur
            .should_roll(encoded.len() as u64, now, &self.config, self.roll_jitter)
        {
            self.roll(now)?;
        }

        self.cur
            .append_bundle(encoded, first, self.config.index_interval)?;
        self.next_seq = last + 1;
        self.flush_state.pending_msgs = self
            .flush_state
            .pending_msgs
            .saturating_add((last - first + 1) as u32);
        self.maybe_schedule_flush(now);
        Ok((first, last))
    }

    /// Seal the active segment and open a fresh one at the tail.
    ///
    /// The rename happens before the new active file is created, so a crash
    /// in between can never leave two writable segments behind.
    fn roll(&mut self, now: u32) -> Result<()> {
        let base_seq = self.cur.base_seq();
        let created_ts = self.cur.created_ts();
        let last = self.next_seq - 1;

        // one final durable flush for the segment being sealed
        self.flusher
            .schedule(self.cur.fdh().clone(), self.cur.index().fdh().clone());

        let sealed_path = self
            .dir
            .join(sealed_segment_filename(base_seq, last, created_ts));
        std::fs::rename(self.cur.data_path(), &sealed_path)
            .at_path(self.cur.data_path())?;

        info!(
            topic = %self.topic,
            partition = self.partition,
            base_seq,
            last_seq = last,
            "rolled segment"
        );

        self.cur = ActiveSegment::create(&self.dir, self.next_seq, now, &self.opener)?;
        let ro = RoSegment::open(
            &self.dir,
            base_seq,
            last,
            created_ts,
            &self.opener,
            self.config.index_interval,
        )?;
        self.ro_segments.push_back(ro);
        Ok(())
    }

    /// Locate the byte range serving `seq`.
    pub fn lookup(&self, seq: u64) -> Result<ReadRange> {
        if seq < self.first_available_seq_num || seq >= self.next_seq {
            return Err(TankError::SeqOutOfRange {
                seq,
                first_available: self.first_available_seq_num,
                next: self.next_seq,
            });
        }

        if seq >= self.cur.base_seq() {
            let offset = self.cur.lookup(seq)?;
            return Ok(ReadRange {
                fdh: self.cur.fdh().clone(),
                file_size: self.cur.file_size(),
                offset,
                base_seq: self.cur.base_seq(),
            });
        }

        let idx = match self
            .ro_segments
            .binary_search_by(|s| s.base_seq().cmp(&seq))
        {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let seg = &self.ro_segments[idx];
        let offset = seg.lookup(seq)?;
        Ok(ReadRange {
            fdh: seg.fdh().clone(),
            file_size: seg.file_size(),
            offset,
            base_seq: seg.base_seq(),
        })
    }

    /// Walk every stored message, sealed segments first, then the active
    /// tail. Returns `Ok(false)` when the visitor stopped early.
    pub fn for_each_msg<V: MsgVisitor + ?Sized>(&self, visitor: &mut V) -> Result<bool> {
        for seg in &self.ro_segments {
            if let Some(data) = seg.map_sequential()? {
                if !scan_messages(&data, seg.base_seq(), visitor)? {
                    return Ok(false);
                }
            }
        }
        if let Some(data) = self.cur.map_sequential()? {
            if !scan_messages(&data, self.cur.base_seq(), visitor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply the retention policy over the sealed segment run.
    pub fn consider_ro_segments(&mut self, now: u32) -> Result<RetentionOutcome> {
        if self.compacting {
            return Ok(RetentionOutcome::Idle);
        }

        match self.config.log_cleanup_policy {
            CleanupPolicy::Delete => Ok(self.apply_delete_policy(now)),
            CleanupPolicy::Cleanup => self.apply_cleanup_policy(now),
        }
    }

    fn apply_delete_policy(&mut self, now: u32) -> RetentionOutcome {
        let mut sum: u64 = self.ro_segments.iter().map(|s| s.file_size()).sum();
        let mut removed = 0usize;

        loop {
            let Some(front) = self.ro_segments.front() else { break };

            let over_count = self.config.ro_segments_cnt > 0
                && self.ro_segments.len() as u32 > self.config.ro_segments_cnt;
            let over_size =
                self.config.ro_segments_size > 0 && sum > self.config.ro_segments_size;
            let over_age = front.created_ts() != 0
                && self.config.last_segment_max_age > 0
                && front.created_ts().saturating_add(self.config.last_segment_max_age) < now;

            if !(over_count || over_size || over_age) {
                break;
            }

            let seg = self
                .ro_segments
                .pop_front()
                .expect("front checked just above");

            // data file goes first: an orphan index is recoverable by
            // rebuild, an orphan data file would resurrect deleted messages
            if let Err(e) = std::fs::remove_file(seg.data_path()) {
                warn!(path = %seg.data_path().display(), error = %e, "failed to unlink segment");
            }
            let index_path = self.dir.join(index_filename(seg.base_seq()));
            if let Err(e) = std::fs::remove_file(&index_path) {
                warn!(path = %index_path.display(), error = %e, "failed to unlink index");
            }

            sum -= seg.file_size();
            removed += 1;

            debug!(
                topic = %self.topic,
                partition = self.partition,
                base_seq = seg.base_seq(),
                "retired segment"
            );
            // dropping the segment releases its descriptor handle; any
            // in-flight read holding a clone keeps the file alive until done
        }

        self.first_available_seq_num = self
            .ro_segments
            .front()
            .map(|s| s.base_seq())
            .unwrap_or_else(|| self.cur.base_seq());

        if removed > 0 {
            RetentionOutcome::Deleted { segments: removed }
        } else {
            RetentionOutcome::Idle
        }
    }

    fn apply_cleanup_policy(&mut self, now: u32) -> Result<RetentionOutcome> {
        let first_dirty = self.first_dirty_offset();
        let mut dirty_bytes = 0u64;
        let mut sum = 0u64;
        for seg in &self.ro_segments {
            if seg.base_seq() >= first_dirty {
                dirty_bytes += seg.file_size();
            }
            sum += seg.file_size();
        }

        let cleanable_ratio = if sum > 0 {
            dirty_bytes as f64 / sum as f64
        } else {
            0.0
        };
        if cleanable_ratio < self.config.log_clean_ratio_min || self.ro_segments.is_empty() {
            return Ok(RetentionOutcome::Idle);
        }

        info!(
            topic = %self.topic,
            partition = self.partition,
            dirty_bytes,
            total_bytes = sum,
            cleanable_ratio,
            "starting compaction"
        );

        self.compacting = true;
        let cancel = AtomicBool::new(false);
        let result = compaction::compact(
            &self.dir,
            &self.ro_segments,
            &self.config,
            &self.opener,
            now,
            &cancel,
        );
        self.compacting = false;

        let new_segments = result?;
        let max_seq = self
            .ro_segments
            .back()
            .map(|s| s.last_seq())
            .expect("non-empty checked above");
        self.ro_segments = new_segments;
        self.last_cleanup_max_seq = max_seq;
        self.first_available_seq_num = self
            .ro_segments
            .front()
            .map(|s| s.base_seq())
            .unwrap_or_else(|| self.cur.base_seq());

        Ok(RetentionOutcome::Compacted {
            last_cleanup_max_seq: max_seq,
        })
    }

    /// Earliest sequence number not covered by a prior compaction pass.
    fn first_dirty_offset(&self) -> u64 {
        if self.last_cleanup_max_seq == 0 {
            0
        } else {
            self.last_cleanup_max_seq + 1
        }
    }

    /// Enqueue a durable flush of the active segment and reset the soft
    /// trigger state.
    pub fn schedule_flush(&mut self, now: u32) {
        self.flush_state.pending_msgs = 0;
        self.flush_state.next_flush_ts = now.saturating_add(self.config.flush_interval_secs);
        self.flusher
            .schedule(self.cur.fdh().clone(), self.cur.index().fdh().clone());
    }

    fn maybe_schedule_flush(&mut self, now: u32) {
        let by_msgs = self.config.flush_interval_msgs > 0
            && self.flush_state.pending_msgs >= self.config.flush_interval_msgs;
        let by_time =
            self.config.flush_interval_secs > 0 && now >= self.flush_state.next_flush_ts;
        if by_msgs || by_time {
            self.schedule_flush(now);
        }
    }

    /// Tick hook: applies the time-based soft flush trigger.
    pub fn flush_if_due(&mut self, now: u32) {
        self.maybe_schedule_flush(now);
    }

    /// Close the log: one final flush for the active pair, then every
    /// descriptor this log holds drops.
    pub fn close(mut self, now: u32) {
        self.schedule_flush(now);
        debug!(
            topic = %self.topic,
            partition = self.partition,
            "closed partition log"
        );
    }
}

/// Decode bundles sequentially from `data`, yielding each message to the
/// visitor. Returns `Ok(false)` on early stop.
pub(crate) fn scan_messages<V: MsgVisitor + ?Sized>(
    data: &[u8],
    base_seq: u64,
    visitor: &mut V,
) -> Result<bool> {
    let mut next_seq = base_seq;
    let mut pos = 0usize;
    while pos < data.len() {
        let (consumed, bundle) = decode_bundle(&data[pos..], next_seq)?;
        for msg in &bundle.msgs {
            if visitor.on_msg(msg) == IterAction::Stop {
                return Ok(false);
            }
        }
        next_seq = bundle.last_seq + 1;
        pos += consumed;
    }
    Ok(true)
}

/// Stable per-partition roll jitter in `[0, max)`; the same partition always
/// draws the same value so roll points stay put across reopens.
fn stable_roll_jitter(topic: &str, partition: u16, max: u32) -> u32 {
    if max == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    (topic, partition).hash(&mut hasher);
    StdRng::seed_from_u64(hasher.finish()).gen_range(0..max)
}
