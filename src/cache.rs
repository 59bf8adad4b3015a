//! Passive partition cache
//!
//! A broker can host far more partitions than it has descriptors to spare,
//! so logs that nobody touches get closed and reopened transparently on the
//! next access. This module tracks recency: every partition access links the
//! partition into an intrusive list ordered by last access; a sweep runs at
//! most every [`SWEEP_INTERVAL_SECS`] and reports the partitions idle for
//! [`IDLE_CLOSE_SECS`] or longer so the engine can close their logs.
//!
//! The list is index-based: an arena of slots keyed by the engine's
//! partition index, each carrying `{prev, next}` links. No allocation per
//! touch, O(1) link moves, and the sweep walks from the least recently used
//! end and stops at the first survivor.

/// Sweep cadence in seconds
pub const SWEEP_INTERVAL_SECS: u32 = 8;

/// A partition untouched for this long gets its log closed
pub const IDLE_CLOSE_SECS: u32 = 16;

const NIL: u32 = u32::MAX;

#[derive(Clone)]
struct Slot {
    prev: u32,
    next: u32,
    last_access: u32,
    linked: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
            last_access: 0,
            linked: false,
        }
    }
}

/// Recency list over engine partition indices
pub struct AccessTracker {
    slots: Vec<Slot>,
    head: u32, // least recently accessed
    tail: u32, // most recently accessed
    next_sweep: u32,
}

impl Default for AccessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessTracker {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: NIL,
            tail: NIL,
            next_sweep: 0,
        }
    }

    fn ensure_slot(&mut self, id: usize) {
        if id >= self.slots.len() {
            self.slots.resize(id + 1, Slot::default());
        }
    }

    fn unlink(&mut self, id: u32) {
        let (prev, next) = {
            let slot = &self.slots[id as usize];
            (slot.prev, slot.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }
        let slot = &mut self.slots[id as usize];
        slot.prev = NIL;
        slot.next = NIL;
        slot.linked = false;
    }

    fn push_tail(&mut self, id: u32) {
        let old_tail = self.tail;
        {
            let slot = &mut self.slots[id as usize];
            slot.prev = old_tail;
            slot.next = NIL;
            slot.linked = true;
        }
        if old_tail == NIL {
            self.head = id;
        } else {
            self.slots[old_tail as usize].next = id;
        }
        self.tail = id;
    }

    /// Record an access; links (or re-links) the partition at the recent end.
    pub fn touch(&mut self, id: usize, now: u32) {
        self.ensure_slot(id);
        let idx = id as u32;
        if self.slots[id].linked {
            self.unlink(idx);
        }
        self.slots[id].last_access = now;
        self.push_tail(idx);
    }

    /// Drop a partition from the list without waiting for the sweep (the
    /// engine closed it for another reason).
    pub fn remove(&mut self, id: usize) {
        if id < self.slots.len() && self.slots[id].linked {
            self.unlink(id as u32);
        }
    }

    pub fn is_tracked(&self, id: usize) -> bool {
        id < self.slots.len() && self.slots[id].linked
    }

    /// Collect the partitions idle long enough to close. Runs at most once
    /// per [`SWEEP_INTERVAL_SECS`]; off-cadence calls return nothing.
    pub fn sweep(&mut self, now: u32) -> Vec<usize> {
        if now < self.next_sweep {
            return Vec::new();
        }
        self.next_sweep = now.saturating_add(SWEEP_INTERVAL_SECS);

        let mut idle = Vec::new();
        // touch() keeps the list ordered by last_access, so the walk can
        // stop at the first survivor
        let mut cursor = self.head;
        while cursor != NIL {
            let slot = &self.slots[cursor as usize];
            if slot.last_access.saturating_add(IDLE_CLOSE_SECS) > now {
                break;
            }
            let next = slot.next;
            self.unlink(cursor);
            idle.push(cursor as usize);
            cursor = next;
        }
        idle
    }
}
