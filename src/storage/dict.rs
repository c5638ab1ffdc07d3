//! The incrementally-rehashing dictionary.
//!
//! A resize never happens in one pass. When the load factor leaves its
//! bounds the dict enters the `Rehashing` state, holding both the old and
//! the new table plus a bucket cursor, and each call to [`Dict::rehash_step`]
//! migrates a bounded number of buckets. Lookups probe the old table first
//! and the new one second for exactly as long as the rehash is in flight.

use super::table::HashTable;
use bytes::Bytes;
use std::cell::Cell;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default bucket-count exponent (2^7 = 128 buckets).
const DEFAULT_BASE_EXP: u32 = 7;

/// Grow once `len > bucket_count * MAX_LOAD_FACTOR`.
const MAX_LOAD_FACTOR: usize = 3;

/// Never shrink a table holding this many entries or fewer.
const SHRINK_MIN_LEN: usize = 128;

/// Budget multiplier for empty-bucket visits per rehash step.
const EMPTY_VISITS_PER_BUCKET: usize = 10;

/// Bucket granularity of [`Dict::rehash_for_duration`].
const REHASH_BATCH_BUCKETS: usize = 100;

/// Buckets cleared between callback invocations in [`Dict::clear`].
const CLEAR_CALLBACK_PERIOD: usize = 65536;

enum TableState {
    /// Not rehashing: one authoritative table.
    Stable(HashTable),
    /// Rehash in flight: every bucket below `cursor` in `old` has already
    /// been migrated into `new`.
    Rehashing {
        old: HashTable,
        new: HashTable,
        cursor: usize,
    },
}

/// The key/value store.
pub struct Dict {
    state: TableState,
    base_buckets: usize,
    /// Live iterator guards. While non-zero the dict must not begin a
    /// resize, or the traversal would observe a moving key space.
    iterators: Cell<usize>,
}

impl Dict {
    /// Create a dict whose initial (and minimum) bucket count is
    /// `2^base_exp`.
    pub fn with_base_exp(base_exp: u32) -> Self {
        let base_exp = base_exp.max(1);
        let base_buckets = 1usize << base_exp;
        Self {
            state: TableState::Stable(HashTable::with_buckets(base_buckets)),
            base_buckets,
            iterators: Cell::new(0),
        }
    }

    /// Look a key up.
    pub fn find(&self, key: &[u8]) -> Option<&Bytes> {
        match &self.state {
            TableState::Stable(table) => table.find(key).map(|e| &e.value),
            TableState::Rehashing { old, new, .. } => old
                .find(key)
                .or_else(|| new.find(key))
                .map(|e| &e.value),
        }
    }

    /// Insert a key or update it in place.
    ///
    /// An existing entry keeps its position in whichever table holds it;
    /// new entries go to the new table while a rehash is in flight so the
    /// old table only ever drains.
    pub fn insert(&mut self, key: Bytes, value: Bytes) {
        match &mut self.state {
            TableState::Stable(table) => {
                if let Some(entry) = table.find_mut(&key) {
                    entry.value = value;
                } else {
                    table.insert_new(key, value);
                }
            }
            TableState::Rehashing { old, new, .. } => {
                if let Some(entry) = old.find_mut(&key) {
                    entry.value = value;
                } else if let Some(entry) = new.find_mut(&key) {
                    entry.value = value;
                } else {
                    new.insert_new(key, value);
                }
            }
        }
    }

    /// Unlink a key, returning the owned value.
    pub fn erase(&mut self, key: &[u8]) -> Option<Bytes> {
        let entry = match &mut self.state {
            TableState::Stable(table) => table.erase(key),
            TableState::Rehashing { old, new, .. } => {
                old.erase(key).or_else(|| new.erase(key))
            }
        };
        entry.map(|e| e.value)
    }

    /// Number of live entries across both tables.
    pub fn len(&self) -> usize {
        match &self.state {
            TableState::Stable(table) => table.len(),
            TableState::Rehashing { old, new, .. } => old.len() + new.len(),
        }
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket count of the authoritative table (the migration target while
    /// rehashing).
    pub fn bucket_count(&self) -> usize {
        match &self.state {
            TableState::Stable(table) => table.bucket_count(),
            TableState::Rehashing { new, .. } => new.bucket_count(),
        }
    }

    /// True while a rehash is in flight.
    pub fn is_rehashing(&self) -> bool {
        matches!(self.state, TableState::Rehashing { .. })
    }

    /// Migrate up to `n_buckets` non-empty buckets from the old table.
    ///
    /// Also the resize trigger point: when stable and out of load-factor
    /// bounds, this transitions into the rehashing state first. At most
    /// `10 * n_buckets` buckets are visited in total (empty or not) so a
    /// sparse table cannot stall the caller. Returns true once no rehash
    /// is (or needs to be) in progress; the return is advisory, never an
    /// error.
    pub fn rehash_step(&mut self, n_buckets: usize) -> bool {
        if let TableState::Stable(table) = &self.state {
            let (len, buckets) = (table.len(), table.bucket_count());
            match self.resize_target(len, buckets) {
                Some(target) if self.iterators.get() == 0 => {
                    debug!(
                        from = buckets,
                        to = target,
                        entries = len,
                        "starting incremental rehash"
                    );
                    let old = match std::mem::replace(
                        &mut self.state,
                        TableState::Stable(HashTable::with_buckets(1)),
                    ) {
                        TableState::Stable(table) => table,
                        TableState::Rehashing { .. } => unreachable!("checked stable"),
                    };
                    self.state = TableState::Rehashing {
                        old,
                        new: HashTable::with_buckets(target),
                        cursor: 0,
                    };
                }
                _ => return true,
            }
        }

        let TableState::Rehashing { old, new, cursor } = &mut self.state else {
            unreachable!("rehashing state established above");
        };

        let mut visits = n_buckets * EMPTY_VISITS_PER_BUCKET;
        let mut migrated = 0;
        while migrated < n_buckets && !old.is_empty() {
            // Skip already-empty buckets under the visit budget. The old
            // table is non-empty, so a chain exists at or past the cursor.
            while old.bucket_is_empty(*cursor) {
                *cursor += 1;
                visits -= 1;
                if visits == 0 {
                    return false;
                }
            }
            for entry in old.drain_bucket(*cursor) {
                new.adopt(entry);
            }
            *cursor += 1;
            migrated += 1;
            visits = visits.saturating_sub(1);
            if visits == 0 {
                break;
            }
        }

        if old.is_empty() {
            self.finish_rehash();
            return true;
        }
        false
    }

    /// Rehash in batches of 100 buckets until complete or `max` wall-clock
    /// time has elapsed. Bounds the pause a background tick can impose.
    pub fn rehash_for_duration(&mut self, max: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.rehash_step(REHASH_BATCH_BUCKETS) {
                return true;
            }
            if start.elapsed() >= max {
                return false;
            }
        }
    }

    /// Take the new table as authoritative and drop the drained old one.
    fn finish_rehash(&mut self) {
        let state = std::mem::replace(
            &mut self.state,
            TableState::Stable(HashTable::with_buckets(1)),
        );
        if let TableState::Rehashing { new, .. } = state {
            debug!(buckets = new.bucket_count(), entries = new.len(), "rehash complete");
            self.state = TableState::Stable(new);
        }
    }

    /// Decide whether a stable table needs resizing, and to what.
    fn resize_target(&self, len: usize, buckets: usize) -> Option<usize> {
        if len > buckets * MAX_LOAD_FACTOR {
            return Some((len * 2).next_power_of_two());
        }
        if len < buckets / 2 && len > SHRINK_MIN_LEN {
            let target = Self::shrink_buckets(len).max(self.base_buckets);
            if target < buckets {
                return Some(target);
            }
        }
        None
    }

    /// Half the entry count rounded to the power of two that keeps the
    /// load factor within bounds.
    fn shrink_buckets(len: usize) -> usize {
        let up = (len / 2).max(1).next_power_of_two();
        let down = (up / 2).max(1);
        if len <= down * MAX_LOAD_FACTOR {
            down
        } else {
            up
        }
    }

    /// Remove every entry, visiting buckets in bounded batches.
    ///
    /// `callback` (when given) runs every 65536 buckets so a huge clear can
    /// still service periodic work such as heartbeats.
    pub fn clear(&mut self, mut callback: Option<&mut dyn FnMut()>) {
        let state = std::mem::replace(
            &mut self.state,
            TableState::Stable(HashTable::with_buckets(self.base_buckets)),
        );
        let tables = match state {
            TableState::Stable(table) => vec![table],
            TableState::Rehashing { old, new, .. } => vec![old, new],
        };
        let mut visited = 0usize;
        for mut table in tables {
            for bucket in 0..table.bucket_count() {
                table.drain_bucket(bucket);
                visited += 1;
                if visited % CLEAR_CALLBACK_PERIOD == 0 {
                    if let Some(cb) = callback.as_mut() {
                        cb();
                    }
                }
            }
        }
    }

    /// Iterate over every live entry.
    ///
    /// The guard pins the dict against starting a resize until dropped.
    pub fn iter(&self) -> DictIter<'_> {
        self.iterators.set(self.iterators.get() + 1);
        let inner: Box<dyn Iterator<Item = (&Bytes, &Bytes)> + '_> = match &self.state {
            TableState::Stable(table) => {
                Box::new(table.iter().map(|e| (&e.key, &e.value)))
            }
            TableState::Rehashing { old, new, .. } => Box::new(
                old.iter()
                    .chain(new.iter())
                    .map(|e| (&e.key, &e.value)),
            ),
        };
        DictIter { dict: self, inner }
    }

    /// Copy out every entry, for snapshot dumps and AOF rewrites.
    pub fn snapshot_entries(&self) -> Vec<(Bytes, Bytes)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Entry iterator over both tables; holding one forbids resize
/// transitions.
pub struct DictIter<'a> {
    dict: &'a Dict,
    inner: Box<dyn Iterator<Item = (&'a Bytes, &'a Bytes)> + 'a>,
}

impl<'a> Iterator for DictIter<'a> {
    type Item = (&'a Bytes, &'a Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl Drop for DictIter<'_> {
    fn drop(&mut self) {
        self.dict.iterators.set(self.dict.iterators.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn drive_to_completion(dict: &mut Dict) {
        // Each step is bounded, so a finite table needs finitely many.
        for _ in 0..10_000 {
            if dict.rehash_step(4) {
                return;
            }
        }
        panic!("rehash did not terminate");
    }

    #[test]
    fn test_set_get_update_in_place() {
        let mut dict = Dict::with_base_exp(2);
        dict.insert(b("a"), b("1"));
        dict.insert(b("a"), b("2"));
        assert_eq!(dict.find(b"a"), Some(&b("2")));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_erase_returns_value() {
        let mut dict = Dict::with_base_exp(2);
        dict.insert(b("a"), b("1"));
        assert_eq!(dict.erase(b"a"), Some(b("1")));
        assert_eq!(dict.erase(b"a"), None);
        assert!(dict.is_empty());
    }

    #[test]
    fn test_growth_keeps_every_key_findable() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..500 {
            dict.insert(b(&format!("key-{i}")), b(&format!("val-{i}")));
            // Interleave bounded rehash work with the inserts.
            dict.rehash_step(2);
        }
        for i in 0..500 {
            assert_eq!(
                dict.find(format!("key-{i}").as_bytes()),
                Some(&b(&format!("val-{i}"))),
                "key-{i}"
            );
        }
    }

    #[test]
    fn test_updates_and_erases_during_rehash() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..200 {
            dict.insert(b(&format!("k{i}")), b("old"));
        }
        // Kick off a grow and leave it mid-flight.
        assert!(!dict.rehash_step(1));
        assert!(dict.is_rehashing());

        dict.insert(b("k10"), b("new"));
        dict.insert(b("k199"), b("new"));
        assert_eq!(dict.erase(b"k20"), Some(b("old")));
        let before = dict.len();
        dict.insert(b("fresh"), b("new"));
        assert_eq!(dict.len(), before + 1);

        drive_to_completion(&mut dict);
        assert!(!dict.is_rehashing());
        assert_eq!(dict.find(b"k10"), Some(&b("new")));
        assert_eq!(dict.find(b"k199"), Some(&b("new")));
        assert_eq!(dict.find(b"k20"), None);
        assert_eq!(dict.find(b"fresh"), Some(&b("new")));
    }

    #[test]
    fn test_thousand_keys_base_64() {
        let mut dict = Dict::with_base_exp(6);
        for i in 0..1000 {
            dict.insert(b(&format!("key-{i}")), b("v"));
        }
        drive_to_completion(&mut dict);
        let buckets = dict.bucket_count();
        assert!(buckets.is_power_of_two());
        assert!(buckets >= 2000, "bucket_count {buckets} < 2000");
        for i in 0..1000 {
            assert!(dict.find(format!("key-{i}").as_bytes()).is_some(), "key-{i}");
        }
    }

    #[test]
    fn test_load_factor_after_growth() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..5000 {
            dict.insert(b(&format!("k{i}")), b("v"));
        }
        drive_to_completion(&mut dict);
        assert!(dict.len() <= dict.bucket_count() * 3);
    }

    #[test]
    fn test_shrink_to_smallest_power_of_two_in_bounds() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..5000 {
            dict.insert(b(&format!("k{i}")), b("v"));
        }
        drive_to_completion(&mut dict);
        for i in 200..5000 {
            dict.erase(format!("k{i}").as_bytes());
        }
        drive_to_completion(&mut dict);

        let buckets = dict.bucket_count();
        assert!(buckets.is_power_of_two());
        assert!(dict.len() <= buckets * 3);
        // Smallest power of two still within the load factor bound.
        assert!(dict.len() > (buckets / 2) * 3 || buckets == 4);
        for i in 0..200 {
            assert!(dict.find(format!("k{i}").as_bytes()).is_some());
        }
    }

    #[test]
    fn test_no_shrink_below_min_len() {
        let mut dict = Dict::with_base_exp(7); // 128 buckets
        for i in 0..60 {
            dict.insert(b(&format!("k{i}")), b("v"));
        }
        // 60 < 128/2 but 60 <= 128 entries, so no shrink may start.
        assert!(dict.rehash_step(100));
        assert!(!dict.is_rehashing());
        assert_eq!(dict.bucket_count(), 128);
    }

    #[test]
    fn test_live_iterator_blocks_resize() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..100 {
            dict.insert(b(&format!("k{i}")), b("v"));
        }
        {
            let iter = dict.iter();
            assert!(iter.count() == 100);
        }
        // Guard dropped: the resize may proceed now.
        assert!(!dict.rehash_step(1));
        assert!(dict.is_rehashing());
    }

    #[test]
    fn test_rehash_terminates_and_old_table_is_empty() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..1000 {
            dict.insert(b(&format!("k{i}")), b("v"));
        }
        let mut steps = 0;
        while !dict.rehash_step(1) {
            steps += 1;
            assert!(steps < 100_000, "rehash never completed");
        }
        assert!(!dict.is_rehashing());
        assert_eq!(dict.len(), 1000);
    }

    #[test]
    fn test_clear_empties_both_tables() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..300 {
            dict.insert(b(&format!("k{i}")), b("v"));
        }
        dict.rehash_step(1); // leave a rehash in flight
        let mut ticks = 0;
        dict.clear(Some(&mut || ticks += 1));
        assert!(dict.is_empty());
        assert!(!dict.is_rehashing());
        assert_eq!(dict.find(b"k0"), None);
    }

    #[test]
    fn test_snapshot_entries_covers_both_tables() {
        let mut dict = Dict::with_base_exp(2);
        for i in 0..100 {
            dict.insert(b(&format!("k{i}")), b(&format!("v{i}")));
        }
        dict.rehash_step(1);
        assert!(dict.is_rehashing());
        let entries = dict.snapshot_entries();
        assert_eq!(entries.len(), 100);
    }
}
