//! Segment files: the immutable tail-sealed units of a partition log
//!
//! A segment is a pair of files under the partition directory: the data file
//! (`.ilog`, concatenated bundles, no padding or holes) and its sparse index.
//! The single writable segment of a partition is named `<base_seq>.ilog`;
//! sealing renames it to `<base_seq>-<last_seq>_<created_ts>.ilog` in one
//! atomic step, which is the only transition between the two forms.
//!
//! Descriptors are shared through [`FdHandle`]: a sealed segment, an in-flight
//! read and a queued flush job may all hold the same file; the last clone
//! dropped closes it.

use crate::config::PartitionConfig;
use crate::engine::FileOpener;
use crate::error::{IoResultExt, Result, TankError};
use crate::index::{rebuild_index, IndexWriter, SegmentIndex, INDEX_ENTRY_SIZE};
use crate::mmap::map_readonly;
use crate::{bundle, mmap};
use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// Clonable shared-ownership handle to an open file.
///
/// The last clone dropped closes the descriptor; nothing in the engine closes
/// files by hand.
pub type FdHandle = Arc<File>;

/// Name of the active (writable) data file for `base_seq`.
pub fn active_segment_filename(base_seq: u64) -> String {
    format!("{base_seq}.ilog")
}

/// Name of a sealed data file. `created_ts == 0` produces the legacy form
/// without the creation-timestamp suffix, which is still accepted on open.
pub fn sealed_segment_filename(base_seq: u64, last_seq: u64, created_ts: u32) -> String {
    if created_ts != 0 {
        format!("{base_seq}-{last_seq}_{created_ts}.ilog")
    } else {
        format!("{base_seq}-{last_seq}.ilog")
    }
}

/// Name of the 32-bit index file for `base_seq`.
pub fn index_filename(base_seq: u64) -> String {
    format!("{base_seq}.index")
}

/// Name of the reserved wide (64-bit entry) index form.
pub fn wide_index_filename(base_seq: u64) -> String {
    format!("{base_seq}_64.index")
}

/// A parsed `.ilog` file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFileName {
    /// `<base_seq>.ilog`, the writable tail
    Active { base_seq: u64 },
    /// `<base_seq>-<last_seq>[_<created_ts>].ilog`
    Sealed {
        base_seq: u64,
        last_seq: u64,
        created_ts: u32,
    },
}

/// Parse a directory entry name; returns `None` for anything that is not a
/// well-formed `.ilog` name (index files, temp files, stray droppings).
pub fn parse_segment_filename(name: &str) -> Option<SegmentFileName> {
    let stem = name.strip_suffix(".ilog")?;
    match stem.split_once('-') {
        None => stem.parse().ok().map(|base_seq| SegmentFileName::Active { base_seq }),
        Some((base, rest)) => {
            let base_seq = base.parse().ok()?;
            let (last, ts) = match rest.split_once('_') {
                Some((last, ts)) => (last, ts.parse().ok()?),
                None => (rest, 0),
            };
            Some(SegmentFileName::Sealed {
                base_seq,
                last_seq: last.parse().ok()?,
                created_ts: ts,
            })
        }
    }
}

/// Walk bundle prefixes to find the sequence number following the last
/// stored bundle. Shared by active-segment adoption and lookup scans.
fn scan_tail(data: &[u8], base_seq: u64) -> Result<u64> {
    let mut next_seq = base_seq;
    let mut pos = 0usize;
    while pos < data.len() {
        let header = bundle::read_bundle_header(&data[pos..])?;
        let (_, last) = header.seq_range(next_seq);
        next_seq = last + 1;
        pos += header.total_len;
    }
    Ok(next_seq)
}

/// Scan forward from `start` for the byte offset of the bundle holding
/// `target_seq`. `next_seq` is the sequence implied at `start`.
fn scan_for_bundle(data: &[u8], start: usize, mut next_seq: u64, target_seq: u64) -> Result<u64> {
    let mut pos = start;
    while pos < data.len() {
        let header = bundle::read_bundle_header(&data[pos..])?;
        let (_, last) = header.seq_range(next_seq);
        if target_seq <= last {
            return Ok(pos as u64);
        }
        next_seq = last + 1;
        pos += header.total_len;
    }
    Err(TankError::invariant(format!(
        "sequence {target_seq} not found scanning from byte {start}"
    )))
}

/// An immutable, fully-written segment
pub struct RoSegment {
    base_seq: u64,
    last_seq: u64,
    created_ts: u32,
    data_path: PathBuf,
    fdh: FdHandle,
    file_size: u64,
    index: SegmentIndex,
}

impl RoSegment {
    /// Open the on-disk artifacts of a sealed segment.
    ///
    /// Rebuilds the index from the data file when it is missing, empty or
    /// truncated, which is the mandatory crash-recovery path. Segments
    /// carrying the wide index form are rejected outright.
    pub fn open(
        dir: &Path,
        base_seq: u64,
        last_seq: u64,
        created_ts: u32,
        opener: &FileOpener,
        index_interval: u64,
    ) -> Result<Self> {
        if last_seq < base_seq {
            return Err(TankError::invariant(format!(
                "segment {base_seq}-{last_seq}: last below base"
            )));
        }

        if dir.join(wide_index_filename(base_seq)).exists() {
            return Err(TankError::malformed(
                "index",
                format!("segment {base_seq}: wide (64-bit) index entries are not supported"),
            ));
        }

        let data_path = dir.join(sealed_segment_filename(base_seq, last_seq, created_ts));
        let file = opener.open_read(&data_path)?;
        let file_size = file.metadata().at_path(&data_path)?.len();
        let fdh: FdHandle = Arc::new(file);

        let index_path = dir.join(index_filename(base_seq));
        let usable = match std::fs::metadata(&index_path) {
            Ok(meta) => meta.len() > 0 && meta.len() % INDEX_ENTRY_SIZE as u64 == 0,
            Err(_) => false,
        };

        let index = if usable {
            let index_file = opener.open_read(&index_path)?;
            SegmentIndex::open(&index_file, &index_path)?
        } else {
            info!(
                segment = %data_path.display(),
                "index missing or truncated, rebuilding from data file"
            );
            let index_file = opener.open_read_write(&index_path)?;
            let mut writer = IndexWriter::create(&index_path, index_file)?;
            if file_size > 0 {
                let data = map_readonly(&fdh, &data_path)?;
                rebuild_index(&data, base_seq, index_interval, &mut writer)?;
            }
            writer.fdh().sync_data().at_path(&index_path)?;
            drop(writer);

            let index_file = opener.open_read(&index_path)?;
            SegmentIndex::open(&index_file, &index_path)?
        };

        debug!(
            base_seq,
            last_seq,
            created_ts,
            file_size,
            index_entries = index.len(),
            "opened ro segment"
        );

        Ok(Self {
            base_seq,
            last_seq,
            created_ts,
            data_path,
            fdh,
            file_size,
            index,
        })
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn created_ts(&self) -> u32 {
        self.created_ts
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn fdh(&self) -> &FdHandle {
        &self.fdh
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    /// Map the data file for a sequential scan.
    pub fn map_sequential(&self) -> Result<Option<Mmap>> {
        if self.file_size == 0 {
            return Ok(None);
        }
        let data = map_readonly(&self.fdh, &self.data_path)?;
        mmap::advise_sequential(&data);
        Ok(Some(data))
    }

    /// Byte offset of the bundle containing `target_seq`.
    ///
    /// Index search narrows the range, then a forward header scan finds the
    /// exact bundle boundary.
    pub fn lookup(&self, target_seq: u64) -> Result<u64> {
        debug_assert!(target_seq >= self.base_seq && target_seq <= self.last_seq);

        let rel = u32::try_from(target_seq - self.base_seq).map_err(|_| {
            TankError::malformed("index", "relative sequence overflows 32-bit entries")
        })?;
        let (start, next_seq) = match self.index.lookup(rel) {
            Some(entry) => (entry.file_pos as usize, self.base_seq + u64::from(entry.rel_seq)),
            None => (0, self.base_seq),
        };

        let data = map_readonly(&self.fdh, &self.data_path)?;
        scan_for_bundle(&data, start, next_seq, target_seq)
    }
}

/// The single writable tail segment of a partition
pub struct ActiveSegment {
    base_seq: u64,
    created_ts: u32,
    data_path: PathBuf,
    fdh: FdHandle,
    file_size: u64,
    index: IndexWriter,
}

impl ActiveSegment {
    /// Create a brand new active segment starting at `base_seq`.
    pub fn create(dir: &Path, base_seq: u64, now: u32, opener: &FileOpener) -> Result<Self> {
        let data_path = dir.join(active_segment_filename(base_seq));
        let file = opener.open_read_write(&data_path)?;
        file.set_len(0).at_path(&data_path)?;

        let index_path = dir.join(index_filename(base_seq));
        let index_file = opener.open_read_write(&index_path)?;
        let index = IndexWriter::create(&index_path, index_file)?;

        debug!(base_seq, created_ts = now, "created active segment");

        Ok(Self {
            base_seq,
            created_ts: now,
            data_path,
            fdh: Arc::new(file),
            file_size: 0,
            index,
        })
    }

    /// Adopt an existing `<base_seq>.ilog` left behind by a previous run.
    ///
    /// Scans the data file to recover the tail sequence number and rebuilds
    /// the index when it does not match the data file. Returns the segment
    /// and the next sequence number to assign.
    pub fn open_existing(
        dir: &Path,
        base_seq: u64,
        opener: &FileOpener,
        index_interval: u64,
    ) -> Result<(Self, u64)> {
        let data_path = dir.join(active_segment_filename(base_seq));
        let file = opener.open_read_write(&data_path)?;
        let meta = file.metadata().at_path(&data_path)?;
        let file_size = meta.len();

        // appends go through the shared cursor; park it at the tail
        {
            use std::io::{Seek, SeekFrom};
            (&file).seek(SeekFrom::End(0)).at_path(&data_path)?;
        }

        // the active file name carries no creation timestamp; mtime is the
        // closest surviving approximation after a restart
        let created_ts = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let fdh: FdHandle = Arc::new(file);
        let index_path = dir.join(index_filename(base_seq));
        let usable = match std::fs::metadata(&index_path) {
            Ok(m) => m.len() % INDEX_ENTRY_SIZE as u64 == 0,
            Err(_) => false,
        };

        let (index, next_seq) = if usable {
            let index_file = opener.open_read_write(&index_path)?;
            let index = IndexWriter::open_existing(&index_path, index_file, file_size)?;
            let next_seq = if file_size > 0 {
                let data = map_readonly(&fdh, &data_path)?;
                scan_tail(&data, base_seq)?
            } else {
                base_seq
            };
            (index, next_seq)
        } else {
            info!(
                segment = %data_path.display(),
                "active index unusable, rebuilding"
            );
            let index_file = opener.open_read_write(&index_path)?;
            let mut index = IndexWriter::create(&index_path, index_file)?;
            let next_seq = if file_size > 0 {
                let data = map_readonly(&fdh, &data_path)?;
                rebuild_index(&data, base_seq, index_interval, &mut index)?
            } else {
                base_seq
            };
            (index, next_seq)
        };

        debug!(base_seq, file_size, next_seq, "adopted active segment");

        Ok((
            Self {
                base_seq,
                created_ts,
                data_path,
                fdh,
                file_size,
                index,
            },
            next_seq,
        ))
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    pub fn created_ts(&self) -> u32 {
        self.created_ts
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn fdh(&self) -> &FdHandle {
        &self.fdh
    }

    pub fn index(&self) -> &IndexWriter {
        &self.index
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Append one encoded bundle, updating the sparse index along the way.
    pub fn append_bundle(
        &mut self,
        encoded: &[u8],
        first_seq: u64,
        index_interval: u64,
    ) -> Result<()> {
        let rel = u32::try_from(first_seq - self.base_seq).map_err(|_| {
            TankError::malformed("index", "relative sequence overflows 32-bit entries")
        })?;
        let pos = u32::try_from(self.file_size).map_err(|_| {
            TankError::malformed("index", "byte offset overflows 32-bit entries")
        })?;

        self.index
            .observe_bundle(rel, pos, encoded.len() as u64, index_interval)?;
        (&*self.fdh).write_all(encoded).at_path(&self.data_path)?;
        self.file_size += encoded.len() as u64;
        Ok(())
    }

    /// Whether appending `incoming` more bytes should seal this segment
    /// first. Never rolls an empty segment.
    pub fn should_roll(
        &self,
        incoming: u64,
        now: u32,
        config: &PartitionConfig,
        roll_jitter: u32,
    ) -> bool {
        if self.file_size == 0 {
            return false;
        }
        if config.max_segment_size > 0 && self.file_size + incoming > config.max_segment_size {
            return true;
        }
        if config.cur_segment_max_age > 0
            && now
                >= self
                    .created_ts
                    .saturating_add(config.cur_segment_max_age)
                    .saturating_add(roll_jitter)
        {
            return true;
        }
        if config.max_index_size > 0 && self.index.size() + INDEX_ENTRY_SIZE as u64 > config.max_index_size
        {
            return true;
        }
        false
    }

    /// Map the data file for a sequential scan.
    pub fn map_sequential(&self) -> Result<Option<Mmap>> {
        if self.file_size == 0 {
            return Ok(None);
        }
        let data = map_readonly(&self.fdh, &self.data_path)?;
        mmap::advise_sequential(&data);
        Ok(Some(data))
    }

    /// Byte offset of the bundle containing `target_seq`, within the
    /// still-growing data file.
    pub fn lookup(&self, target_seq: u64) -> Result<u64> {
        let rel = u32::try_from(target_seq - self.base_seq).map_err(|_| {
            TankError::malformed("index", "relative sequence overflows 32-bit entries")
        })?;
        let (start, next_seq) = match self.index.lookup(rel) {
            Some(entry) => (entry.file_pos as usize, self.base_seq + u64::from(entry.rel_seq)),
            None => (0, self.base_seq),
        };

        let data = map_readonly(&self.fdh, &self.data_path)?;
        scan_for_bundle(&data, start, next_seq, target_seq)
    }

}
