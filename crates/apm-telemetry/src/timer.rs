// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction timer trees and their merge into rollups.
//!
//! A transaction owns its root [`TimerNode`] exclusively while it runs, so none of
//! the operations here synchronize. Rollup accumulators are plain `TimerNode`s too;
//! whoever owns an accumulator serializes merges into it (see
//! [`crate::rollup::RollupService`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::MergeError;
use crate::timer_name::TimerName;

#[derive(Debug, Clone)]
pub struct TimerNode {
    name: TimerName,
    total_duration: Duration,
    invocation_count: u64,
    active: bool,
    // unique by name; fan-out is small so lookups scan linearly
    children: Vec<TimerNode>,
}

/// Immutable, serializable projection of a timer subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub name: String,
    pub extended: bool,
    pub total_nanos: u64,
    pub count: u64,
    pub active: bool,
    #[serde(default)]
    pub children: Vec<TimerSnapshot>,
}

impl TimerNode {
    /// Starts the root timer of a new transaction.
    #[must_use]
    pub fn start_root(name: TimerName) -> Self {
        Self {
            name,
            total_duration: Duration::ZERO,
            invocation_count: 0,
            active: true,
            children: Vec::new(),
        }
    }

    fn empty(name: TimerName) -> Self {
        Self {
            active: false,
            ..Self::start_root(name)
        }
    }

    /// Starts `name` under this node, reusing the existing child of that name.
    pub fn start_child(&mut self, name: TimerName) -> &mut TimerNode {
        let index = match self.children.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.children.push(Self::empty(name));
                self.children.len() - 1
            }
        };
        let child = &mut self.children[index];
        child.active = true;
        child
    }

    /// Records one completed invocation.
    ///
    /// The node stays active if a nested timer is still running.
    pub fn stop(&mut self, elapsed: Duration) {
        self.invocation_count += 1;
        self.total_duration += elapsed;
        self.active = self.children.iter().any(|c| c.active);
    }

    /// Merges `source` into this node. Both must carry the same name.
    pub fn merge(&mut self, source: &TimerNode) -> Result<(), MergeError> {
        if self.name != source.name {
            return Err(MergeError::NameMismatch {
                accumulator: self.name.to_string(),
                source_name: source.name.to_string(),
            });
        }
        self.merge_matching(source);
        Ok(())
    }

    fn merge_matching(&mut self, source: &TimerNode) {
        self.total_duration += source.total_duration;
        self.invocation_count += source.invocation_count;
        self.active |= source.active;
        for source_child in &source.children {
            match self.children.iter_mut().find(|c| c.name == source_child.name) {
                Some(child) => child.merge_matching(source_child),
                None => self.children.push(source_child.clone()),
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            name: self.name.label().to_string(),
            extended: self.name.is_extended(),
            total_nanos: u64::try_from(self.total_duration.as_nanos()).unwrap_or(u64::MAX),
            count: self.invocation_count,
            active: self.active,
            children: self.children.iter().map(TimerNode::snapshot).collect(),
        }
    }

    #[must_use]
    pub fn name(&self) -> TimerName {
        self.name
    }

    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.name.is_extended()
    }

    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    #[must_use]
    pub fn invocation_count(&self) -> u64 {
        self.invocation_count
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn children(&self) -> &[TimerNode] {
        &self.children
    }

    #[must_use]
    pub fn child(&self, name: TimerName) -> Option<&TimerNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Merges a completed root into the accumulator root of the same name,
/// creating that accumulator root on first merge.
pub fn merge_into(roots: &mut Vec<TimerNode>, source: &TimerNode) {
    match roots.iter_mut().find(|r| r.name == source.name) {
        Some(root) => root.merge_matching(source),
        None => roots.push(source.clone()),
    }
}
