// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-operation call statistics keyed by operation text.
//!
//! Keys are compared by content, so two distinct `String`s holding the same query
//! always resolve to the same entry regardless of how they hash. Entries iterate in
//! insertion order, which keeps serialized rollups deterministic.
//!
//! A map holds a bounded number of distinct keys. Once the limit is reached,
//! observations for unseen keys are folded into [`OVERFLOW_KEY`].

use std::hash::{BuildHasher, BuildHasherDefault};
use std::time::Duration;

use fnv::FnvHasher;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

pub const OVERFLOW_KEY: &str = "LIMIT EXCEEDED BUCKET";
pub const DEFAULT_MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub execution_count: u64,
    pub total_duration: Duration,
    pub total_rows: Option<u64>,
}

impl CallStats {
    pub fn record(&mut self, elapsed: Duration, rows: Option<u64>) {
        self.execution_count += 1;
        self.total_duration += elapsed;
        self.add_rows(rows);
    }

    pub fn add(&mut self, other: &CallStats) {
        self.execution_count += other.execution_count;
        self.total_duration += other.total_duration;
        self.add_rows(other.total_rows);
    }

    fn add_rows(&mut self, rows: Option<u64>) {
        if let Some(rows) = rows {
            self.total_rows = Some(self.total_rows.unwrap_or(0) + rows);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub text: String,
    pub execution_count: u64,
    pub total_nanos: u64,
    #[serde(default)]
    pub total_rows: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CallAggregationMap<S = BuildHasherDefault<FnvHasher>> {
    index: HashMap<String, usize, S>,
    entries: Vec<(String, CallStats)>,
    max_entries: usize,
}

impl CallAggregationMap {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_ENTRIES)
    }

    #[must_use]
    pub fn with_limit(max_entries: usize) -> Self {
        Self::with_limit_and_hasher(max_entries, BuildHasherDefault::default())
    }
}

impl Default for CallAggregationMap {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BuildHasher> CallAggregationMap<S> {
    pub fn with_limit_and_hasher(max_entries: usize, hasher: S) -> Self {
        Self {
            index: HashMap::with_hasher(hasher),
            entries: Vec::new(),
            max_entries,
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&mut self, key: &str, value: CallStats) {
        if let Some(&slot) = self.index.get(key) {
            self.entries[slot].1 = value;
            return;
        }
        self.entry_mut(key).add(&value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CallStats> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    /// Records one execution of `key`, creating its entry on first observation.
    pub fn record(&mut self, key: &str, elapsed: Duration, rows: Option<u64>) {
        self.entry_mut(key).record(elapsed, rows);
    }

    /// Adds every entry of this map into `target`, creating missing keys zeroed.
    pub fn merge_into<T: BuildHasher>(&self, target: &mut CallAggregationMap<T>) {
        for (key, stats) in &self.entries {
            target.entry_mut(key).add(stats);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CallStats)> {
        self.entries.iter().map(|(key, stats)| (key.as_str(), stats))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        self.iter()
            .map(|(text, stats)| CallSnapshot {
                text: text.to_string(),
                execution_count: stats.execution_count,
                total_nanos: u64::try_from(stats.total_duration.as_nanos()).unwrap_or(u64::MAX),
                total_rows: stats.total_rows,
            })
            .collect()
    }

    fn entry_mut(&mut self, key: &str) -> &mut CallStats {
        let key = if self.index.contains_key(key) || self.distinct_keys() < self.max_entries {
            key
        } else {
            OVERFLOW_KEY
        };
        let slot = match self.index.get(key) {
            Some(&slot) => slot,
            None => {
                self.entries.push((key.to_string(), CallStats::default()));
                let slot = self.entries.len() - 1;
                self.index.insert(key.to_string(), slot);
                slot
            }
        };
        &mut self.entries[slot].1
    }

    fn distinct_keys(&self) -> usize {
        if self.index.contains_key(OVERFLOW_KEY) {
            self.entries.len() - 1
        } else {
            self.entries.len()
        }
    }
}
