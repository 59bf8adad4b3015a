//! Read-only memory mapping helpers
//!
//! Sealed segment data and index files are mapped read-only for scans and
//! lookups. Mappings are always advised `MADV_DONTDUMP` (log payloads have no
//! business in core dumps); sequential scans additionally advise
//! `MADV_SEQUENTIAL` so the kernel prefetches ahead of the cursor.

use crate::error::{Result, TankError};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Map a file read-only.
///
/// The caller must guarantee the file is non-empty; mapping a zero-length
/// file is an error on every platform we care about.
pub fn map_readonly(file: &File, path: &Path) -> Result<Mmap> {
    // SAFETY: the file is opened read-only and the mapping is PROT_READ;
    // the Mmap keeps its own duplicated handle so the mapping stays valid
    // for its whole lifetime even if `file` is closed.
    let mmap = unsafe { Mmap::map(file) }.map_err(|e| TankError::io(path, e))?;
    advise_dontdump(&mmap);
    Ok(mmap)
}

/// Exclude the mapped region from core dumps. Best-effort.
pub fn advise_dontdump(mmap: &Mmap) {
    madvise(mmap, libc::MADV_DONTDUMP);
}

/// Hint that the region will be read front to back. Best-effort.
pub fn advise_sequential(mmap: &Mmap) {
    madvise(mmap, libc::MADV_SEQUENTIAL);
}

fn madvise(mmap: &Mmap, advice: libc::c_int) {
    // SAFETY: pointer and length describe a live mapping owned by `mmap`;
    // madvise is advisory and cannot invalidate the region. Failures are
    // ignored, the hints only affect paging behavior.
    unsafe {
        libc::madvise(mmap.as_ptr() as *mut libc::c_void, mmap.len(), advice);
    }
}
