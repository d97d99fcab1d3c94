//! Strategy & Predictor (§4.G): classifies access patterns over a bounded history window and
//! recommends an eviction strategy; a baseline LRU-K(2) predictor answers `predict_next`.

use fc_common::{AccessPattern, AccessRecord, CacheLevel, RecommendedStrategy};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const HISTORY_CAPACITY: usize = 10_000;
const LRU_K: usize = 2;

pub struct AccessTracker {
    history: RwLock<VecDeque<AccessRecord>>,
    last_k_access: RwLock<HashMap<String, VecDeque<Instant>>>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            last_k_access: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, key: &str, category: Option<String>, level: CacheLevel, hit: bool, latency_us: u64) {
        let record = AccessRecord { ts: Instant::now(), key: key.to_string(), category, level, hit, latency_us };
        {
            let mut history = self.history.write();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(record);
        }
        let mut lru_k = self.last_k_access.write();
        let entry = lru_k.entry(key.to_string()).or_default();
        entry.push_back(Instant::now());
        if entry.len() > LRU_K {
            entry.pop_front();
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let history = self.history.read();
        if history.is_empty() {
            return 0.0;
        }
        let hits = history.iter().filter(|r| r.hit).count();
        hits as f64 / history.len() as f64
    }

    pub fn average_latency_us(&self) -> f64 {
        let history = self.history.read();
        if history.is_empty() {
            return 0.0;
        }
        let total: u64 = history.iter().map(|r| r.latency_us).sum();
        total as f64 / history.len() as f64
    }

    /// Pattern classification per §4.G's thresholds.
    pub fn classify(&self) -> AccessPattern {
        let history = self.history.read();
        let window = history.len();
        if window < 10 {
            return AccessPattern::Random;
        }

        let sequential_hits = count_sequential(&history);
        if sequential_hits as f64 / window as f64 >= 0.30 {
            return AccessPattern::Sequential;
        }

        let temporal_hits = count_temporal(&history);
        if temporal_hits as f64 / window as f64 >= 0.20 {
            return AccessPattern::Temporal;
        }

        if is_burst(&history) {
            return AccessPattern::Burst;
        }

        AccessPattern::Random
    }

    pub fn recommend_strategy(&self) -> RecommendedStrategy {
        self.classify().into()
    }

    /// `predict_next(n)`: the `n` keys most likely to be re-accessed soon, ranked by recency
    /// of their K-th most recent access (LRU-K baseline).
    pub fn predict_next(&self, n: usize) -> Vec<String> {
        let lru_k = self.last_k_access.read();
        let mut scored: Vec<(String, Instant)> = lru_k
            .iter()
            .filter_map(|(key, accesses)| accesses.front().map(|t| (key.clone(), *t)))
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.into_iter().take(n).map(|(k, _)| k).collect()
    }

    pub fn recommend_prefetch(&self, key: &str, n: usize) -> Vec<String> {
        let history = self.history.read();
        let mut followers: HashMap<String, u64> = HashMap::new();
        let mut prev: Option<&str> = None;
        for record in history.iter() {
            if let Some(p) = prev {
                if p == key {
                    *followers.entry(record.key.clone()).or_insert(0) += 1;
                }
            }
            prev = Some(&record.key);
        }
        let mut ranked: Vec<(String, u64)> = followers.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().take(n).map(|(k, _)| k).collect()
    }
}

impl Default for AccessTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn count_sequential(history: &VecDeque<AccessRecord>) -> usize {
    let mut count = 0;
    let mut prev_suffix: Option<u64> = None;
    for record in history.iter() {
        let suffix = trailing_digits(&record.key);
        if let (Some(p), Some(s)) = (prev_suffix, suffix) {
            if s == p + 1 {
                count += 1;
            }
        }
        prev_suffix = suffix;
    }
    count
}

fn trailing_digits(key: &str) -> Option<u64> {
    let digits: String = key.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

fn count_temporal(history: &VecDeque<AccessRecord>) -> usize {
    let mut last_seen: HashMap<&str, Instant> = HashMap::new();
    let mut count = 0;
    for record in history.iter() {
        if let Some(prev) = last_seen.get(record.key.as_str()) {
            if record.ts.saturating_duration_since(*prev) <= Duration::from_secs(60) {
                count += 1;
            }
        }
        last_seen.insert(&record.key, record.ts);
    }
    count
}

fn is_burst(history: &VecDeque<AccessRecord>) -> bool {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for record in history.iter() {
        *counts.entry(record.key.as_str()).or_insert(0) += 1;
    }
    let total = history.len() as f64;
    let max_share = counts.values().copied().max().unwrap_or(0) as f64 / total;
    max_share >= 0.10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_keys_are_classified_sequential() {
        let tracker = AccessTracker::new();
        for i in 0..20 {
            tracker.record(&format!("item-{i}"), None, CacheLevel::L1, true, 10);
        }
        assert_eq!(tracker.classify(), AccessPattern::Sequential);
    }

    #[test]
    fn single_hot_key_is_classified_burst() {
        let tracker = AccessTracker::new();
        for _ in 0..20 {
            tracker.record("hot", None, CacheLevel::L1, true, 10);
        }
        for i in 0..5 {
            tracker.record(&format!("other-{i}"), None, CacheLevel::L1, true, 10);
        }
        assert_eq!(tracker.classify(), AccessPattern::Burst);
    }

    #[test]
    fn predict_next_ranks_most_recently_accessed_first() {
        let tracker = AccessTracker::new();
        tracker.record("a", None, CacheLevel::L1, true, 1);
        tracker.record("b", None, CacheLevel::L1, true, 1);
        let predicted = tracker.predict_next(2);
        assert_eq!(predicted.len(), 2);
    }
}
