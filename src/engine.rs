//! Engine context: partition registry, descriptor-safe opens, tick dispatch
//!
//! The engine owns everything that is not per-partition: the base directory,
//! the default configuration, the flush worker, the compaction checkpoint
//! and the passive cache that closes idle logs. All partition state is only
//! touched from the thread driving the engine; the flush worker is the one
//! auxiliary thread.
//!
//! Startup scans `<base>/<topic>/<partition>/` and initialises every
//! partition log with a small bounded worker pool, publishing the opened
//! logs through a mutex-guarded vector.

use crate::cache::AccessTracker;
use crate::compaction::CleanupCheckpoint;
use crate::config::PartitionConfig;
use crate::error::{IoResultExt, Result, TankError};
use crate::flush::{FlushWorker, Flusher};
use crate::partition::{MsgVisitor, NewMessage, PartitionLog, ReadRange, RetentionOutcome};
use crate::bundle::{Codec, Message};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts against `EMFILE`/`ENFILE` before giving up with `FdExhausted`.
const OPEN_RETRY_BUDGET: u32 = 8;

/// Startup initialisation parallelism.
const INIT_WORKERS: usize = 4;

/// How often the tick runs retention over open partitions.
const RETENTION_CHECK_INTERVAL_SECS: u32 = 5;

/// Seam to the network layer: asked to release descriptors when `open()`
/// runs into the process limit.
pub trait IdleCloser: Send + Sync {
    /// Close up to `count` idle connections; `false` means nothing could be
    /// released and retrying is pointless.
    fn try_shutdown_idle(&self, count: usize) -> bool;
}

/// `open()` wrapper shared by everything that touches segment files.
///
/// Retries `EINTR` forever; on descriptor exhaustion it asks the registered
/// [`IdleCloser`] for room and retries within a fixed budget.
#[derive(Clone, Default)]
pub struct FileOpener {
    closer: Option<Arc<dyn IdleCloser>>,
}

impl FileOpener {
    pub fn new(closer: Arc<dyn IdleCloser>) -> Self {
        Self {
            closer: Some(closer),
        }
    }

    pub fn open_read(&self, path: &Path) -> Result<File> {
        self.open(path, File::options().read(true))
    }

    pub fn open_read_write(&self, path: &Path) -> Result<File> {
        self.open(path, File::options().read(true).write(true).create(true))
    }

    fn open(&self, path: &Path, opts: &std::fs::OpenOptions) -> Result<File> {
        let mut exhausted_retries = 0u32;
        loop {
            match opts.open(path) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) =>
                {
                    exhausted_retries += 1;
                    let freed = match &self.closer {
                        Some(closer) => closer.try_shutdown_idle(1),
                        None => false,
                    };
                    if !freed || exhausted_retries > OPEN_RETRY_BUDGET {
                        return Err(TankError::FdExhausted);
                    }
                }
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EACCES) {
                        // usually an ownership mismatch on the data directory;
                        // worth calling out before someone burns an hour on it
                        warn!(
                            path = %path.display(),
                            "cannot access file: effective uid does not match the owner"
                        );
                    }
                    return Err(TankError::io(path, e));
                }
            }
        }
    }
}

struct PartitionSlot {
    topic: String,
    partition: u16,
    dir: PathBuf,
    config: PartitionConfig,
    log: Option<PartitionLog>,
}

/// The log engine over one base directory
pub struct Engine {
    base: PathBuf,
    defaults: PartitionConfig,
    opener: FileOpener,
    flush_worker: FlushWorker,
    flusher: Flusher,
    slots: Vec<PartitionSlot>,
    by_name: HashMap<(String, u16), usize>,
    tracker: AccessTracker,
    checkpoint: CleanupCheckpoint,
    next_retention_check: u32,
}

impl Engine {
    /// Open the engine over `base`, discovering and initialising every
    /// `<topic>/<partition>` directory found there.
    pub fn open(
        base: &Path,
        defaults: PartitionConfig,
        closer: Option<Arc<dyn IdleCloser>>,
        now: u32,
    ) -> Result<Self> {
        std::fs::create_dir_all(base).at_path(base)?;

        let opener = match closer {
            Some(closer) => FileOpener::new(closer),
            None => FileOpener::default(),
        };
        let flush_worker = FlushWorker::spawn();
        let flusher = flush_worker.flusher();
        let checkpoint = CleanupCheckpoint::load(base)?;

        let work = discover_partitions(base, &defaults)?;
        let logs = init_partitions(&work, &opener, &flusher, &checkpoint, now)?;

        let mut slots = Vec::with_capacity(work.len());
        let mut by_name = HashMap::new();
        let mut tracker = AccessTracker::new();
        for ((topic, partition, dir, config), log) in work.into_iter().zip(logs) {
            let idx = slots.len();
            by_name.insert((topic.clone(), partition), idx);
            tracker.touch(idx, now);
            slots.push(PartitionSlot {
                topic,
                partition,
                dir,
                config,
                log: Some(log),
            });
        }

        info!(
            base = %base.display(),
            partitions = slots.len(),
            "engine open"
        );

        Ok(Self {
            base: base.to_path_buf(),
            defaults,
            opener,
            flush_worker,
            flusher,
            slots,
            by_name,
            tracker,
            checkpoint,
            next_retention_check: now,
        })
    }

    pub fn partition_count(&self) -> usize {
        self.slots.len()
    }

    /// Register (and create on disk) a new partition.
    pub fn create_partition(
        &mut self,
        topic: &str,
        partition: u16,
        now: u32,
    ) -> Result<()> {
        if self.by_name.contains_key(&(topic.to_string(), partition)) {
            return Err(TankError::invariant(format!(
                "partition {topic}/{partition} already exists"
            )));
        }

        let dir = self.base.join(topic).join(partition.to_string());
        let mut config = self.defaults.clone();
        config.apply_file(&self.base.join(topic).join("config"))?;

        let log = PartitionLog::open(
            &dir,
            topic,
            partition,
            config.clone(),
            self.opener.clone(),
            self.flusher.clone(),
            self.checkpoint.get(topic, partition),
            now,
        )?;

        let idx = self.slots.len();
        self.by_name.insert((topic.to_string(), partition), idx);
        self.tracker.touch(idx, now);
        self.slots.push(PartitionSlot {
            topic: topic.to_string(),
            partition,
            dir,
            config,
            log: Some(log),
        });
        Ok(())
    }

    fn slot_index(&self, topic: &str, partition: u16) -> Result<usize> {
        self.by_name
            .get(&(topic.to_string(), partition))
            .copied()
            .ok_or_else(|| TankError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }

    /// Run `f` against an open partition log, reopening a passively closed
    /// one on demand and refreshing its recency.
    fn with_log<T>(
        &mut self,
        topic: &str,
        partition: u16,
        now: u32,
        f: impl FnOnce(&mut PartitionLog) -> Result<T>,
    ) -> Result<T> {
        let idx = self.slot_index(topic, partition)?;
        if self.slots[idx].log.is_none() {
            let slot = &self.slots[idx];
            debug!(topic, partition, "reopening passively closed partition");
            let log = PartitionLog::open(
                &slot.dir,
                &slot.topic,
                slot.partition,
                slot.config.clone(),
                self.opener.clone(),
                self.flusher.clone(),
                self.checkpoint.get(&slot.topic, slot.partition),
                now,
            )?;
            self.slots[idx].log = Some(log);
        }
        self.tracker.touch(idx, now);
        f(self.slots[idx]
            .log
            .as_mut()
            .expect("log just ensured open"))
    }

    /// Append a batch; returns the assigned `[first, last]` sequence range.
    pub fn append(
        &mut self,
        topic: &str,
        partition: u16,
        now: u32,
        batch: &[NewMessage],
        codec: Codec,
    ) -> Result<(u64, u64)> {
        self.with_log(topic, partition, now, |log| log.append(now, batch, codec))
    }

    /// Append messages with explicit sequence numbers as a sparse bundle.
    pub fn append_sparse(
        &mut self,
        topic: &str,
        partition: u16,
        now: u32,
        msgs: &[Message],
        codec: Codec,
    ) -> Result<(u64, u64)> {
        self.with_log(topic, partition, now, |log| {
            log.append_sparse(now, msgs, codec)
        })
    }

    /// Resolve the byte range serving `seq`.
    pub fn lookup(
        &mut self,
        topic: &str,
        partition: u16,
        now: u32,
        seq: u64,
    ) -> Result<ReadRange> {
        self.with_log(topic, partition, now, |log| log.lookup(seq))
    }

    /// Iterate every stored message of a partition.
    pub fn for_each_msg<V: MsgVisitor + ?Sized>(
        &mut self,
        topic: &str,
        partition: u16,
        now: u32,
        visitor: &mut V,
    ) -> Result<bool> {
        self.with_log(topic, partition, now, |log| log.for_each_msg(visitor))
    }

    /// Next sequence number (high-water mark) of a partition.
    pub fn next_seq(&mut self, topic: &str, partition: u16, now: u32) -> Result<u64> {
        self.with_log(topic, partition, now, |log| Ok(log.next_seq()))
    }

    /// Oldest stored sequence number of a partition.
    pub fn first_available_seq_num(
        &mut self,
        topic: &str,
        partition: u16,
        now: u32,
    ) -> Result<u64> {
        self.with_log(topic, partition, now, |log| {
            Ok(log.first_available_seq_num())
        })
    }

    /// Apply an updated configuration to one partition.
    pub fn update_partition_config(
        &mut self,
        topic: &str,
        partition: u16,
        config: PartitionConfig,
    ) -> Result<()> {
        let idx = self.slot_index(topic, partition)?;
        self.slots[idx].config = config.clone();
        if let Some(log) = &mut self.slots[idx].log {
            log.update_config(config);
        }
        Ok(())
    }

    /// Wall-clock tick: soft flush triggers, retention, passive-cache sweep.
    pub fn tick(&mut self, now: u32) {
        let run_retention = now >= self.next_retention_check;
        if run_retention {
            self.next_retention_check = now.saturating_add(RETENTION_CHECK_INTERVAL_SECS);
        }

        let mut checkpoint_dirty = false;
        for slot in &mut self.slots {
            let Some(log) = &mut slot.log else { continue };
            log.flush_if_due(now);
            if !run_retention {
                continue;
            }
            match log.consider_ro_segments(now) {
                Ok(RetentionOutcome::Compacted {
                    last_cleanup_max_seq,
                }) => {
                    self.checkpoint
                        .set(&slot.topic, slot.partition, last_cleanup_max_seq);
                    checkpoint_dirty = true;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        topic = %slot.topic,
                        partition = slot.partition,
                        error = %e,
                        "retention pass aborted"
                    );
                }
            }
        }
        if checkpoint_dirty {
            if let Err(e) = self.checkpoint.store(&self.base) {
                warn!(error = %e, "failed to persist cleanup checkpoint");
            }
        }

        for idx in self.tracker.sweep(now) {
            if let Some(log) = self.slots[idx].log.take() {
                debug!(
                    topic = %self.slots[idx].topic,
                    partition = self.slots[idx].partition,
                    "closing idle partition log"
                );
                log.close(now);
            }
        }
    }

    /// Final flush for every open log, checkpoint persisted, flush worker
    /// drained and joined.
    pub fn shutdown(mut self, now: u32) {
        for slot in &mut self.slots {
            if let Some(log) = slot.log.take() {
                log.close(now);
            }
        }
        if let Err(e) = self.checkpoint.store(&self.base) {
            warn!(error = %e, "failed to persist cleanup checkpoint");
        }
        self.flush_worker.shutdown();
    }
}

type PartitionWork = (String, u16, PathBuf, PartitionConfig);

/// Scan `<base>/<topic>/<partition>` directories into init work items.
fn discover_partitions(base: &Path, defaults: &PartitionConfig) -> Result<Vec<PartitionWork>> {
    let mut work = Vec::new();

    for topic_entry in std::fs::read_dir(base).at_path(base)? {
        let topic_entry = topic_entry.at_path(base)?;
        if !topic_entry.file_type().at_path(base)?.is_dir() {
            continue;
        }
        let topic_name = topic_entry.file_name();
        let Some(topic) = topic_name.to_str() else { continue };
        if topic.starts_with('.') {
            continue;
        }

        let topic_dir = topic_entry.path();
        let mut topic_config = defaults.clone();
        topic_config.apply_file(&topic_dir.join("config"))?;

        for part_entry in std::fs::read_dir(&topic_dir).at_path(&topic_dir)? {
            let part_entry = part_entry.at_path(&topic_dir)?;
            if !part_entry.file_type().at_path(&topic_dir)?.is_dir() {
                continue;
            }
            let part_name = part_entry.file_name();
            let Some(partition) = part_name.to_str().and_then(|s| s.parse::<u16>().ok()) else {
                continue;
            };
            work.push((
                topic.to_string(),
                partition,
                part_entry.path(),
                topic_config.clone(),
            ));
        }
    }

    work.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    Ok(work)
}

/// Initialise partition logs with a bounded worker pool; results are
/// published through a mutex and re-ordered to match `work`.
fn init_partitions(
    work: &[PartitionWork],
    opener: &FileOpener,
    flusher: &Flusher,
    checkpoint: &CleanupCheckpoint,
    now: u32,
) -> Result<Vec<PartitionLog>> {
    if work.is_empty() {
        return Ok(Vec::new());
    }

    let queue: Mutex<Vec<usize>> = Mutex::new((0..work.len()).collect());
    let results: Mutex<Vec<(usize, Result<PartitionLog>)>> =
        Mutex::new(Vec::with_capacity(work.len()));

    std::thread::scope(|scope| {
        for _ in 0..INIT_WORKERS.min(work.len()) {
            scope.spawn(|| loop {
                let Some(idx) = queue.lock().pop() else { break };
                let (topic, partition, dir, config) = &work[idx];
                let log = PartitionLog::open(
                    dir,
                    topic,
                    *partition,
                    config.clone(),
                    opener.clone(),
                    flusher.clone(),
                    checkpoint.get(topic, *partition),
                    now,
                );
                results.lock().push((idx, log));
            });
        }
    });

    let mut results = results.into_inner();
    results.sort_by_key(|(idx, _)| *idx);

    let mut logs = Vec::with_capacity(results.len());
    for (_, result) in results {
        logs.push(result?);
    }
    Ok(logs)
}
