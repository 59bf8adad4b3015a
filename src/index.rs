//! Sparse segment index
//!
//! Each segment file is paired with a `<base_seq>.index` of fixed-width
//! entries `{ rel_seq: u32, file_pos: u32 }` (little-endian, 8 bytes). An
//! entry is emitted roughly every `log.index.interval.bytes` of appended
//! bundle data and always points at the first byte of a bundle. Lookups
//! binary-search the entries for the greatest `rel_seq` at or below the
//! target, then the caller scans forward bundle by bundle.
//!
//! On the append path the index grows through [`IndexWriter`]; sealed
//! segments map the file read-only through [`SegmentIndex`]. A missing or
//! truncated index is rebuilt from the data file with [`rebuild_index`];
//! that is the crash-recovery path, since index writes are not synced with
//! data writes.
//!
//! The `<base_seq>_64.index` wide form (64-bit entries) is reserved; any
//! segment whose relative sequence numbers or byte offsets overflow `u32`
//! is rejected rather than silently mis-indexed.

use crate::bundle::read_bundle_header;
use crate::error::{IoResultExt, Result, TankError};
use crate::mmap::map_readonly;
use crate::segment::FdHandle;
use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of one index entry on disk
pub const INDEX_ENTRY_SIZE: usize = 8;

/// One `(relative sequence number, absolute byte offset)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// First sequence number of the indexed bundle, relative to the
    /// segment's base sequence number
    pub rel_seq: u32,
    /// Byte offset of the bundle within the segment data file
    pub file_pos: u32,
}

impl IndexEntry {
    pub fn to_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.rel_seq.to_le_bytes());
        buf[4..8].copy_from_slice(&self.file_pos.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8; INDEX_ENTRY_SIZE]) -> Self {
        Self {
            rel_seq: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            file_pos: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        }
    }
}

/// Append-path handle for the active segment's index file.
///
/// Tracks the bytes accumulated since the last emitted entry so that the
/// append path and [`rebuild_index`] produce byte-identical index files for
/// the same data file.
pub struct IndexWriter {
    path: PathBuf,
    fdh: FdHandle,
    // in-memory mirror of the on-disk entries, so the active segment can
    // answer lookups without re-reading its own index file
    entries: Vec<IndexEntry>,
    bytes_since_entry: u64,
}

impl IndexWriter {
    /// Create a fresh, empty index file, truncating any leftover.
    pub fn create(path: &Path, file: File) -> Result<Self> {
        file.set_len(0).at_path(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            fdh: Arc::new(file),
            entries: Vec::new(),
            bytes_since_entry: 0,
        })
    }

    /// Adopt an existing index file of a reopened active segment.
    ///
    /// `data_file_size` restores the interval accumulator: everything past
    /// the last indexed bundle counts as pending. The file size must be a
    /// multiple of the entry size; a truncated file is the caller's cue to
    /// rebuild instead.
    pub fn open_existing(path: &Path, file: File, data_file_size: u64) -> Result<Self> {
        let size = file.metadata().at_path(path)?.len();
        if size % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(TankError::malformed(
                "index",
                format!("{}: size {} not a multiple of {}", path.display(), size, INDEX_ENTRY_SIZE),
            ));
        }

        let mut raw = Vec::with_capacity(size as usize);
        {
            use std::io::Read;
            let mut f = &file;
            f.read_to_end(&mut raw).at_path(path)?;
        }
        let mut entries = Vec::with_capacity(raw.len() / INDEX_ENTRY_SIZE);
        for chunk in raw.chunks_exact(INDEX_ENTRY_SIZE) {
            let mut buf = [0u8; INDEX_ENTRY_SIZE];
            buf.copy_from_slice(chunk);
            entries.push(IndexEntry::from_bytes(&buf));
        }

        let bytes_since_entry = match entries.last() {
            Some(entry) => data_file_size.saturating_sub(u64::from(entry.file_pos)),
            None => data_file_size,
        };

        Ok(Self {
            path: path.to_path_buf(),
            fdh: Arc::new(file),
            entries,
            bytes_since_entry,
        })
    }

    /// Unconditionally append one entry.
    pub fn append(&mut self, entry: IndexEntry) -> Result<()> {
        (&*self.fdh).write_all(&entry.to_bytes()).at_path(&self.path)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Account for one appended bundle, emitting an index entry when
    /// `interval` bytes have accumulated since the last one. Returns whether
    /// an entry was written.
    pub fn observe_bundle(
        &mut self,
        rel_seq: u32,
        file_pos: u32,
        bundle_len: u64,
        interval: u64,
    ) -> Result<bool> {
        let mut wrote = false;
        if self.bytes_since_entry >= interval {
            self.append(IndexEntry { rel_seq, file_pos })?;
            self.bytes_since_entry = 0;
            wrote = true;
        }
        self.bytes_since_entry += bundle_len;
        Ok(wrote)
    }

    /// Current index file size in bytes.
    pub fn size(&self) -> u64 {
        (self.entries.len() * INDEX_ENTRY_SIZE) as u64
    }

    /// The most recently written entry, if any.
    pub fn last_recorded(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    /// Greatest entry with `rel_seq <= target`, mirroring
    /// [`SegmentIndex::lookup`] for the still-writable tail.
    pub fn lookup(&self, target: u32) -> Option<IndexEntry> {
        let i = self.entries.partition_point(|e| e.rel_seq <= target);
        if i == 0 {
            None
        } else {
            Some(self.entries[i - 1])
        }
    }

    /// Shared handle to the index file, for flush jobs.
    pub fn fdh(&self) -> &FdHandle {
        &self.fdh
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read-only, memory-mapped view over a sealed segment's index.
pub struct SegmentIndex {
    mmap: Option<Mmap>,
    entries: usize,
}

impl SegmentIndex {
    /// Map `file` read-only. The caller guarantees the file is well-formed
    /// (non-truncated); a zero-length file yields an empty index.
    pub fn open(file: &File, path: &Path) -> Result<Self> {
        let size = file.metadata().at_path(path)?.len();
        if size == 0 {
            return Ok(Self {
                mmap: None,
                entries: 0,
            });
        }
        if size % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(TankError::malformed(
                "index",
                format!("{}: size {} not a multiple of {}", path.display(), size, INDEX_ENTRY_SIZE),
            ));
        }

        let mmap = map_readonly(file, path)?;
        let entries = mmap.len() / INDEX_ENTRY_SIZE;
        Ok(Self {
            mmap: Some(mmap),
            entries,
        })
    }

    fn entry_at(&self, i: usize) -> IndexEntry {
        let mmap = self.mmap.as_ref().expect("entry_at on empty index");
        let off = i * INDEX_ENTRY_SIZE;
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf.copy_from_slice(&mmap[off..off + INDEX_ENTRY_SIZE]);
        IndexEntry::from_bytes(&buf)
    }

    /// Greatest entry with `rel_seq <= target`, or `None` when the target
    /// precedes every entry (scan from the start of the segment).
    pub fn lookup(&self, target: u32) -> Option<IndexEntry> {
        let mut lo = 0usize;
        let mut hi = self.entries;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry_at(mid).rel_seq <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            None
        } else {
            Some(self.entry_at(lo - 1))
        }
    }

    /// Final entry of the index; bounds backward scans in O(1).
    pub fn last_recorded(&self) -> Option<IndexEntry> {
        if self.entries == 0 {
            None
        } else {
            Some(self.entry_at(self.entries - 1))
        }
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Regenerate an index by scanning a segment data file bundle by bundle.
///
/// Only bundle prefixes are decoded; message sets are skipped without
/// decompression. Returns the sequence number following the last stored
/// bundle (`base_seq` for an empty data file), which doubles as the
/// recovered tail position for a reopened active segment.
pub fn rebuild_index(
    data: &[u8],
    base_seq: u64,
    interval: u64,
    writer: &mut IndexWriter,
) -> Result<u64> {
    let mut next_seq = base_seq;
    let mut pos = 0usize;

    while pos < data.len() {
        let header = read_bundle_header(&data[pos..])?;
        let (first, last) = header.seq_range(next_seq);

        let rel_seq = u32::try_from(first.saturating_sub(base_seq)).map_err(|_| {
            TankError::malformed("index", "relative sequence overflows 32-bit entries")
        })?;
        let file_pos = u32::try_from(pos)
            .map_err(|_| TankError::malformed("index", "byte offset overflows 32-bit entries"))?;

        writer.observe_bundle(rel_seq, file_pos, header.total_len as u64, interval)?;

        next_seq = last + 1;
        pos += header.total_len;
    }

    Ok(next_seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{encode_bundle, Codec, Message};
    use bytes::{BufMut, Bytes, BytesMut};
    use tempfile::tempdir;

    fn entry(rel_seq: u32, file_pos: u32) -> IndexEntry {
        IndexEntry { rel_seq, file_pos }
    }

    fn write_index(path: &Path, entries: &[IndexEntry]) {
        let mut buf = BytesMut::new();
        for e in entries {
            buf.put_slice(&e.to_bytes());
        }
        std::fs::write(path, &buf).unwrap();
    }

    #[test]
    fn test_entry_roundtrip() {
        let e = entry(1234, 987654);
        assert_eq!(IndexEntry::from_bytes(&e.to_bytes()), e);
    }

    #[test]
    fn test_lookup_semantics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        write_index(&path, &[entry(10, 100), entry(20, 200), entry(30, 300)]);

        let file = File::open(&path).unwrap();
        let index = SegmentIndex::open(&file, &path).unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index.lookup(5), None); // before first entry
        assert_eq!(index.lookup(10), Some(entry(10, 100)));
        assert_eq!(index.lookup(15), Some(entry(10, 100)));
        assert_eq!(index.lookup(30), Some(entry(30, 300)));
        assert_eq!(index.lookup(1000), Some(entry(30, 300)));
        assert_eq!(index.last_recorded(), Some(entry(30, 300)));
    }

    #[test]
    fn test_empty_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        std::fs::write(&path, b"").unwrap();

        let file = File::open(&path).unwrap();
        let index = SegmentIndex::open(&file, &path).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.lookup(0), None);
        assert_eq!(index.last_recorded(), None);
    }

    #[test]
    fn test_truncated_index_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        std::fs::write(&path, &[0u8; 11]).unwrap();

        let file = File::open(&path).unwrap();
        assert!(SegmentIndex::open(&file, &path).is_err());
    }

    #[test]
    fn test_writer_interval_accumulation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let mut writer = IndexWriter::create(&path, file).unwrap();

        // first bundle never indexed; entries fire once 100 bytes accumulate
        assert!(!writer.observe_bundle(0, 0, 60, 100).unwrap());
        assert!(!writer.observe_bundle(1, 60, 30, 100).unwrap());
        assert!(writer.observe_bundle(2, 90, 50, 100).unwrap());
        assert!(!writer.observe_bundle(3, 140, 60, 100).unwrap());
        assert!(writer.observe_bundle(4, 200, 10, 100).unwrap());

        assert_eq!(writer.size(), 16);
        assert_eq!(writer.last_recorded(), Some(entry(4, 200)));
    }

    fn build_segment_data(base_seq: u64, count: u64, payload: &str) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..count {
            let msgs = vec![Message {
                seq_num: base_seq + i,
                ts: 1000 + i,
                key: None,
                payload: Bytes::copy_from_slice(payload.as_bytes()),
            }];
            data.extend_from_slice(&encode_bundle(&msgs, Codec::None, false).unwrap());
        }
        data
    }

    #[test]
    fn test_rebuild_matches_append_path() {
        let dir = tempdir().unwrap();
        let data = build_segment_data(100, 50, "abcdefgh");

        // index produced incrementally on the append path
        let live_path = dir.path().join("live.index");
        let live_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&live_path)
            .unwrap();
        let mut live = IndexWriter::create(&live_path, live_file).unwrap();
        let mut pos = 0usize;
        let mut next_seq = 100u64;
        while pos < data.len() {
            let header = read_bundle_header(&data[pos..]).unwrap();
            let (first, last) = header.seq_range(next_seq);
            live.observe_bundle(
                (first - 100) as u32,
                pos as u32,
                header.total_len as u64,
                128,
            )
            .unwrap();
            next_seq = last + 1;
            pos += header.total_len;
        }

        // index rebuilt from scratch off the data file
        let rebuilt_path = dir.path().join("rebuilt.index");
        let rebuilt_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&rebuilt_path)
            .unwrap();
        let mut rebuilt = IndexWriter::create(&rebuilt_path, rebuilt_file).unwrap();
        let tail = rebuild_index(&data, 100, 128, &mut rebuilt).unwrap();

        assert_eq!(tail, 150);
        assert_eq!(
            std::fs::read(&live_path).unwrap(),
            std::fs::read(&rebuilt_path).unwrap()
        );
        assert!(rebuilt.size() > 0);
    }

    #[test]
    fn test_rebuild_empty_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let mut writer = IndexWriter::create(&path, file).unwrap();

        let tail = rebuild_index(&[], 7, 4096, &mut writer).unwrap();
        assert_eq!(tail, 7);
        assert_eq!(writer.size(), 0);
        assert_eq!(writer.last_recorded(), None);
    }

    #[test]
    fn test_open_existing_restores_accumulator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        write_index(&path, &[entry(0, 0), entry(40, 4000)]);

        let file = File::options().read(true).write(true).open(&path).unwrap();
        let writer = IndexWriter::open_existing(&path, file, 5000).unwrap();
        assert_eq!(writer.size(), 16);
        assert_eq!(writer.last_recorded(), Some(entry(40, 4000)));
        // 1000 bytes written past the last indexed bundle
        assert_eq!(writer.bytes_since_entry, 1000);
    }
}
