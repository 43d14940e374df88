//! Bounded, time-aware frame cache.
//!
//! Frames are stored per source under a quantized time key
//! (`round(timestamp * time_resolution)`). Each source holds at most
//! `max_frames_per_video` entries. At capacity the cache evicts the oldest
//! entry lying more than `behind_margin_secs` behind the tracked playback
//! position, and falls back to evicting the oldest entry outright when every
//! entry is near or ahead of playback.
//!
//! Values are released by dropping them. Overwrites and evictions drop the
//! displaced value before the call returns.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use cutline_common::config::CacheConfig;

/// Quantized timestamp used as a cache index.
pub type TimeKey = i64;

/// Quantize `timestamp` (seconds) at `resolution` units per second.
///
/// Saturates at the `TimeKey` bounds; key arithmetic must saturate too.
pub fn time_key(timestamp: f64, resolution: u32) -> TimeKey {
    (timestamp * resolution as f64).round() as TimeKey
}

/// Counters describing cache behavior since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub fuzzy_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub emergency_evictions: u64,
    pub overwrites: u64,
}

#[derive(Debug)]
struct Entry<F> {
    frame: F,
    /// Insertion order; lower is older.
    seq: u64,
}

#[derive(Debug)]
struct SourceFrames<F> {
    frames: BTreeMap<TimeKey, Entry<F>>,
    playback_key: Option<TimeKey>,
}

impl<F> Default for SourceFrames<F> {
    fn default() -> Self {
        Self {
            frames: BTreeMap::new(),
            playback_key: None,
        }
    }
}

/// Per-source bounded map from quantized timestamp to frame.
#[derive(Debug)]
pub struct FrameCache<F> {
    config: CacheConfig,
    sources: HashMap<String, SourceFrames<F>>,
    next_seq: u64,
    stats: CacheStats,
}

impl<F> FrameCache<F> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            sources: HashMap::new(),
            next_seq: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key_for(&self, timestamp: f64) -> TimeKey {
        time_key(timestamp, self.config.time_resolution)
    }

    fn behind_margin_units(&self) -> TimeKey {
        (self.config.behind_margin_secs * self.config.time_resolution as f64).round() as TimeKey
    }

    /// Store `frame` for `source_id` at `timestamp`.
    ///
    /// An existing entry at the same key is replaced and its frame dropped.
    /// Inserting a new key into a full source evicts first.
    pub fn put(&mut self, source_id: &str, timestamp: f64, frame: F) {
        let key = self.key_for(timestamp);
        let capacity = self.config.max_frames_per_video.max(1);
        let margin = self.behind_margin_units();
        let seq = self.next_seq;
        self.next_seq += 1;

        let source = self.sources.entry(source_id.to_string()).or_default();

        if let Some(entry) = source.frames.get_mut(&key) {
            let old = std::mem::replace(&mut entry.frame, frame);
            drop(old);
            self.stats.overwrites += 1;
            trace!(source_id, time_key = key, "Replaced cached frame");
            return;
        }

        while source.frames.len() >= capacity {
            match Self::eviction_candidate(source, margin) {
                (Some(victim), emergency) => {
                    if let Some(entry) = source.frames.remove(&victim) {
                        drop(entry.frame);
                    }
                    self.stats.evictions += 1;
                    if emergency {
                        self.stats.emergency_evictions += 1;
                        debug!(
                            source_id,
                            time_key = victim,
                            playback_key = ?source.playback_key,
                            "Emergency eviction: no frame behind playback"
                        );
                    } else {
                        trace!(source_id, time_key = victim, "Evicted frame behind playback");
                    }
                }
                (None, _) => break,
            }
        }

        source.frames.insert(key, Entry { frame, seq });
    }

    /// Pick the key to evict and whether it is an emergency eviction.
    fn eviction_candidate(source: &SourceFrames<F>, margin: TimeKey) -> (Option<TimeKey>, bool) {
        let oldest_where = |pred: &dyn Fn(TimeKey) -> bool| {
            source
                .frames
                .iter()
                .filter(|(key, _)| pred(**key))
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(key, _)| *key)
        };

        if let Some(position) = source.playback_key {
            let threshold = position.saturating_sub(margin);
            if let Some(key) = oldest_where(&|key| key < threshold) {
                return (Some(key), false);
            }
        }
        (oldest_where(&|_| true), true)
    }

    /// Look up the frame closest to `timestamp`.
    ///
    /// Tries the exact key, then keys within `neighbor_radius` (the earlier
    /// key first at each distance), then the nearest key within
    /// `search_window`. Returns `None` beyond that.
    pub fn get(&mut self, source_id: &str, timestamp: f64) -> Option<&F> {
        let key = self.key_for(timestamp);
        let radius = self.config.neighbor_radius.max(0);
        let window = self.config.search_window.max(radius);

        let Some(source) = self.sources.get(source_id) else {
            self.stats.misses += 1;
            return None;
        };

        if source.frames.contains_key(&key) {
            self.stats.hits += 1;
            return source.frames.get(&key).map(|entry| &entry.frame);
        }

        let found = (1..=radius)
            .flat_map(|d| [key.saturating_sub(d), key.saturating_add(d)])
            .find(|candidate| source.frames.contains_key(candidate))
            .or_else(|| {
                source
                    .frames
                    .range(key.saturating_sub(window)..=key.saturating_add(window))
                    .map(|(candidate, _)| *candidate)
                    .min_by_key(|candidate| (candidate.abs_diff(key), *candidate))
            });

        match found {
            Some(found) => {
                self.stats.fuzzy_hits += 1;
                source.frames.get(&found).map(|entry| &entry.frame)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Whether an entry exists at exactly the key of `timestamp`.
    pub fn contains_exact(&self, source_id: &str, timestamp: f64) -> bool {
        let key = self.key_for(timestamp);
        self.sources
            .get(source_id)
            .is_some_and(|source| source.frames.contains_key(&key))
    }

    /// Record where playback currently is for `source_id`.
    ///
    /// Only sources already holding frames are tracked, so reads for unknown
    /// or evicted sources leave no entry behind.
    pub fn mark_playback_position(&mut self, source_id: &str, timestamp: f64) {
        let key = self.key_for(timestamp);
        if let Some(source) = self.sources.get_mut(source_id) {
            source.playback_key = Some(key);
        }
    }

    /// Number of sources with an entry in the cache.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn playback_key(&self, source_id: &str) -> Option<TimeKey> {
        self.sources.get(source_id).and_then(|source| source.playback_key)
    }

    /// Drop every frame held for `source_id`.
    pub fn evict_source(&mut self, source_id: &str) -> usize {
        let Some(source) = self.sources.remove(source_id) else {
            return 0;
        };
        let count = source.frames.len();
        drop(source);
        debug!(source_id, count, "Evicted source from frame cache");
        count
    }

    /// Drop every frame for every source.
    pub fn evict_all(&mut self) -> usize {
        let count = self.total_len();
        self.sources.clear();
        debug!(count, "Cleared frame cache");
        count
    }

    /// Snapshot of the keys held for `source_id`, ascending.
    pub fn keys(&self, source_id: &str) -> Vec<TimeKey> {
        self.sources
            .get(source_id)
            .map(|source| source.frames.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, source_id: &str) -> usize {
        self.sources
            .get(source_id)
            .map(|source| source.frames.len())
            .unwrap_or(0)
    }

    pub fn total_len(&self) -> usize {
        self.sources.values().map(|source| source.frames.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Frame stand-in that counts drops.
    #[derive(Debug)]
    struct Tracked {
        key: TimeKey,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max: usize) -> CacheConfig {
        CacheConfig {
            max_frames_per_video: max,
            ..CacheConfig::default()
        }
    }

    fn put_key(cache: &mut FrameCache<Tracked>, key: TimeKey, drops: &Arc<AtomicUsize>) {
        cache.put(
            "clip",
            key as f64 / 30.0,
            Tracked {
                key,
                drops: drops.clone(),
            },
        );
    }

    #[test]
    fn test_time_key_rounds() {
        assert_eq!(time_key(1.0, 30), 30);
        assert_eq!(time_key(1.0 / 30.0 * 7.4, 30), 7);
        assert_eq!(time_key(1.0 / 30.0 * 7.6, 30), 8);
    }

    #[test]
    fn test_exact_then_neighbor_then_window() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(300));
        for key in [10, 50] {
            put_key(&mut cache, key, &drops);
        }

        assert_eq!(cache.get("clip", 10.0 / 30.0).unwrap().key, 10);
        assert_eq!(cache.get("clip", 12.0 / 30.0).unwrap().key, 10);
        assert_eq!(cache.get("clip", 35.0 / 30.0).unwrap().key, 50);
        assert_eq!(cache.get("clip", 29.0 / 30.0).unwrap().key, 10);
        assert!(cache.get("clip", 81.0 / 30.0).is_none());
        assert!(cache.get("other", 0.0).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.fuzzy_hits, 3);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_neighbor_prefers_earlier_at_equal_distance() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(300));
        put_key(&mut cache, 98, &drops);
        put_key(&mut cache, 102, &drops);
        assert_eq!(cache.get("clip", 100.0 / 30.0).unwrap().key, 98);
    }

    #[test]
    fn test_overwrite_releases_previous_frame() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(300));
        put_key(&mut cache, 5, &drops);
        put_key(&mut cache, 5, &drops);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len("clip"), 1);
        assert_eq!(cache.stats().overwrites, 1);
    }

    #[test]
    fn test_playback_scrub_scenario() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(14));
        for key in [100, 101, 102] {
            put_key(&mut cache, key, &drops);
        }
        for key in 200..=210 {
            put_key(&mut cache, key, &drops);
        }
        assert_eq!(cache.len("clip"), 14);

        cache.mark_playback_position("clip", 150.0 / 30.0);
        put_key(&mut cache, 211, &drops);

        let keys = cache.keys("clip");
        assert!(!keys.contains(&100));
        assert!(keys.contains(&101));
        assert!(keys.contains(&200));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().emergency_evictions, 0);
    }

    #[test]
    fn test_emergency_eviction_when_everything_is_ahead() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(3));
        for key in [90, 60, 30] {
            put_key(&mut cache, key, &drops);
        }
        cache.mark_playback_position("clip", 0.0);
        put_key(&mut cache, 120, &drops);

        // Oldest by insertion, not smallest key.
        assert_eq!(cache.keys("clip"), vec![30, 60, 120]);
        assert_eq!(cache.stats().emergency_evictions, 1);
    }

    #[test]
    fn test_marking_unknown_source_leaves_no_entry() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(300));
        cache.mark_playback_position("ghost", 1.0);
        assert_eq!(cache.source_count(), 0);
        assert_eq!(cache.playback_key("ghost"), None);

        put_key(&mut cache, 10, &drops);
        cache.evict_source("clip");
        cache.mark_playback_position("clip", 1.0);
        assert!(cache.get("clip", 1.0).is_none());
        assert_eq!(cache.source_count(), 0);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(2));
        for timestamp in [f64::MAX, -f64::MAX, 1e300] {
            cache.put(
                "clip",
                timestamp,
                Tracked {
                    key: time_key(timestamp, 30),
                    drops: drops.clone(),
                },
            );
        }
        assert_eq!(cache.len("clip"), 2);

        cache.mark_playback_position("clip", -f64::MAX);
        cache.put(
            "clip",
            0.0,
            Tracked {
                key: 0,
                drops: drops.clone(),
            },
        );
        // Nothing sits behind the lowest possible position, so the oldest
        // insertion goes.
        assert_eq!(cache.keys("clip"), vec![TimeKey::MIN, 0]);
        assert_eq!(cache.stats().emergency_evictions, 1);

        assert!(cache.get("clip", f64::MAX).is_none());
        assert!(cache.get("clip", 1e18).is_none());
        assert_eq!(cache.get("clip", -f64::MAX).map(|frame| frame.key), Some(TimeKey::MIN));
        assert_eq!(cache.get("clip", -1e300).map(|frame| frame.key), Some(TimeKey::MIN));
    }

    #[test]
    fn test_evict_source_and_all_release_frames() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut cache = FrameCache::new(config(300));
        for key in 0..5 {
            put_key(&mut cache, key, &drops);
        }
        cache.put(
            "other",
            0.0,
            Tracked {
                key: 0,
                drops: drops.clone(),
            },
        );

        assert_eq!(cache.evict_source("clip"), 5);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
        assert_eq!(cache.evict_all(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 6);
        assert!(cache.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Put(TimeKey),
            Mark(TimeKey),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0i64..400).prop_map(Op::Put),
                1 => (0i64..400).prop_map(Op::Mark),
            ]
        }

        proptest! {
            #[test]
            fn test_size_bounded_and_each_release_counted_once(
                max in 1usize..40,
                ops in proptest::collection::vec(op(), 0..300),
            ) {
                let drops = Arc::new(AtomicUsize::new(0));
                let mut cache = FrameCache::new(config(max));
                let mut inserted = 0usize;

                for op in ops {
                    match op {
                        Op::Put(key) => {
                            put_key(&mut cache, key, &drops);
                            inserted += 1;
                        }
                        Op::Mark(key) => cache.mark_playback_position("clip", key as f64 / 30.0),
                    }
                    prop_assert!(cache.len("clip") <= max);
                    prop_assert_eq!(drops.load(Ordering::SeqCst) + cache.len("clip"), inserted);
                }

                let held = cache.len("clip");
                cache.evict_all();
                prop_assert_eq!(drops.load(Ordering::SeqCst), inserted);
                prop_assert!(held <= max);
            }

            #[test]
            fn test_eviction_spares_frames_near_playback(
                max in 2usize..30,
                keys in proptest::collection::hash_set(0i64..300, 2..30),
                position in 0i64..330,
                incoming in 300i64..400,
            ) {
                let keys: Vec<TimeKey> = keys.into_iter().take(max).collect();
                let drops = Arc::new(AtomicUsize::new(0));
                let mut cache = FrameCache::new(config(keys.len()));
                for key in &keys {
                    put_key(&mut cache, *key, &drops);
                }
                cache.mark_playback_position("clip", position as f64 / 30.0);

                let before = cache.keys("clip");
                put_key(&mut cache, incoming, &drops);
                let after = cache.keys("clip");

                let evicted: Vec<TimeKey> =
                    before.iter().copied().filter(|key| !after.contains(key)).collect();
                prop_assert_eq!(evicted.len(), 1);

                let threshold = position - 30;
                let any_behind = before.iter().any(|key| *key < threshold);
                if any_behind {
                    prop_assert!(evicted[0] < threshold);
                }
            }

            #[test]
            fn test_lookup_returns_closest_within_window(
                keys in proptest::collection::btree_set(0i64..200, 1..40),
                query in 0i64..200,
            ) {
                let drops = Arc::new(AtomicUsize::new(0));
                let mut cache = FrameCache::new(config(300));
                for key in &keys {
                    put_key(&mut cache, *key, &drops);
                }

                let best = keys
                    .iter()
                    .copied()
                    .filter(|key| (key - query).abs() <= 30)
                    .min_by_key(|key| ((key - query).abs(), *key));

                let got = cache.get("clip", query as f64 / 30.0).map(|frame| frame.key);
                prop_assert_eq!(got, best);
            }
        }
    }
}
