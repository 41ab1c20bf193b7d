//! Operator inspection types: per-queue counts and whole-fleet totals.

use crate::job::QueueName;
use serde::{Deserialize, Serialize};

/// Broker-side state of an in-flight item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// Read-only snapshot of a single queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queue: QueueName,
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

impl QueueCounts {
    pub fn empty(queue: QueueName) -> Self {
        Self {
            queue,
            waiting: 0,
            active: 0,
            delayed: 0,
            completed: 0,
            failed: 0,
            paused: false,
        }
    }
}

/// Aggregate totals across every queue in the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetTotals {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl FleetTotals {
    pub fn add(&mut self, counts: &QueueCounts) {
        self.waiting += counts.waiting;
        self.active += counts.active;
        self.delayed += counts.delayed;
        self.completed += counts.completed;
        self.failed += counts.failed;
    }
}
