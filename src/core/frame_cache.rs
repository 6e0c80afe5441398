//! Frame Cache: time-range-keyed telemetry segments with LRU eviction.
//!
//! **Why**: Re-fetching telemetry for a range the console already displayed
//! is the single most expensive avoidable request. The cache answers "what do
//! we already hold for this range, and exactly which channel keys are still
//! missing" so the caller fetches only the gap.
//!
//! Partial-hit policy: partial data is returned, never discarded for being
//! incomplete. Ranges are canonicalized (`TimeRange::make_valid`) before
//! every lookup so equal ranges always hit the same entry.
//!
//! Eviction: LRU by range recency against an explicit byte budget, enforced
//! by an evict-loop on insert. `get` promotes recency; `contains` peeks
//! without promoting.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use lru::LruCache;

use crate::entities::telem::{Frame, TimeRange};

/// Result of a range lookup: whatever was cached for the requested keys,
/// plus the keys that still need a network retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult {
    /// Cached subset restricted to the requested channel keys.
    pub frame: Frame,
    /// Requested keys with no cached segment for this range.
    pub missing: Vec<String>,
}

impl CacheResult {
    /// True when every requested key was served from cache.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Cache of merged telemetry frames keyed by canonical time range.
#[derive(Debug)]
pub struct FrameCache {
    /// LRU map: canonical range -> merged frame for that range.
    entries: Mutex<LruCache<TimeRange, Frame>>,
    /// Total reported byte size across entries.
    bytes: AtomicUsize,
    /// Byte budget enforced on insert.
    max_bytes: usize,
}

impl FrameCache {
    /// Cache bounded to `max_bytes` of reported segment data.
    pub fn new(max_bytes: usize) -> Self {
        debug!("FrameCache created: budget={} bytes", max_bytes);
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            bytes: AtomicUsize::new(0),
            max_bytes,
        }
    }

    /// Cached data for `range` restricted to `keys`, plus the keys still
    /// missing. A range with no entry is a full miss: empty frame, all keys
    /// missing. Promotes the entry's LRU recency.
    pub fn get(&self, range: TimeRange, keys: &[&str]) -> CacheResult {
        let canonical = range.make_valid();
        let mut entries = self.entries.lock().expect("lock");
        match entries.get(&canonical) {
            Some(cached) => {
                let frame = cached.filter(keys);
                let missing = keys
                    .iter()
                    .filter(|k| !cached.contains_key(k))
                    .map(|k| k.to_string())
                    .collect();
                CacheResult { frame, missing }
            }
            None => CacheResult {
                frame: Frame::new(),
                missing: keys.iter().map(|k| k.to_string()).collect(),
            },
        }
    }

    /// Check for an entry without promoting LRU recency.
    pub fn contains(&self, range: TimeRange) -> bool {
        let canonical = range.make_valid();
        self.entries.lock().expect("lock").peek(&canonical).is_some()
    }

    /// Store retrieved segments for a range.
    ///
    /// If no entry exists the incoming frame becomes the entry. Otherwise
    /// the incoming frame's segments overwrite the matching channel keys in
    /// the existing entry and leave the rest untouched, so re-fetching
    /// channel A for an already-cached range never clobbers channel B.
    pub fn set(&self, range: TimeRange, frame: Frame) {
        self.override_frame(range, frame);
    }

    /// Merge variant of `set`; same per-channel-key replace semantics.
    pub fn override_frame(&self, range: TimeRange, frame: Frame) {
        let canonical = range.make_valid();
        let incoming_bytes = frame.byte_size();
        {
            let mut entries = self.entries.lock().expect("lock");
            match entries.get_mut(&canonical) {
                Some(existing) => {
                    let before = existing.byte_size();
                    existing.merge(frame);
                    let after = existing.byte_size();
                    self.add_bytes(after);
                    self.free_bytes(before);
                }
                None => {
                    entries.push(canonical, frame);
                    self.add_bytes(incoming_bytes);
                }
            }

            // Evict least-recently-used ranges until under budget
            while self.bytes.load(Ordering::Relaxed) > self.max_bytes {
                match entries.pop_lru() {
                    Some((evicted_range, evicted)) => {
                        let freed = evicted.byte_size();
                        self.free_bytes(freed);
                        debug!(
                            "evicted range [{}, {}): freed {} bytes (usage {} / {})",
                            evicted_range.start,
                            evicted_range.end,
                            freed,
                            self.bytes.load(Ordering::Relaxed),
                            self.max_bytes
                        );
                    }
                    None => break, // cache empty
                }
            }
        }
    }

    /// Drop the entry for a range, if present.
    pub fn invalidate(&self, range: TimeRange) {
        let canonical = range.make_valid();
        let mut entries = self.entries.lock().expect("lock");
        if let Some(frame) = entries.pop(&canonical) {
            self.free_bytes(frame.byte_size());
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("lock");
        entries.clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    /// Total cache size in bytes, summed from each entry's reported size.
    /// Consumed by cache-pressure decisions made elsewhere.
    pub fn size(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of cached ranges.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("lock").is_empty()
    }

    fn add_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn free_bytes(&self, bytes: usize) {
        // Compare-exchange loop for saturating subtraction
        loop {
            let current = self.bytes.load(Ordering::Relaxed);
            let next = current.saturating_sub(bytes);
            if self
                .bytes
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}
