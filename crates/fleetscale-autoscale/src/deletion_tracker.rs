//! Bookkeeping for node deletions running in the background.
//!
//! Deletion units start and end on tokio tasks while the control loop
//! keeps ticking. The loop only reads the counters here as a gate for its
//! next decision, and drains buffered results once per tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::status::NodeDeletionResult;

#[derive(Debug, Default)]
struct TrackerInner {
    /// Node group id → deletions in flight.
    in_progress: HashMap<String, usize>,
    non_empty_in_progress: bool,
    /// Node name → outcome, since the last `take_results`.
    results: BTreeMap<String, NodeDeletionResult>,
}

#[derive(Debug, Default)]
pub struct NodeDeletionTracker {
    inner: Mutex<TrackerInner>,
}

impl NodeDeletionTracker {
    /// Create a tracker with no deletions in flight.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take one in-flight slot of `group`.
    pub fn start_deletion(&self, group: &str) {
        let mut inner = self.lock();
        let count = inner.in_progress.entry(group.to_string()).or_insert(0);
        *count += 1;
        debug!(group, in_progress = *count, "node deletion started");
    }

    /// Record the outcome for `node` and release one in-flight slot of
    /// `group`. An end without a matching start is logged and ignored.
    pub fn end_deletion(&self, group: &str, node: &str, result: NodeDeletionResult) {
        let mut inner = self.lock();
        match inner.in_progress.get_mut(group) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    inner.in_progress.remove(group);
                }
            }
            _ => warn!(group, node, "deletion ended without a matching start"),
        }
        debug!(group, node, kind = ?result.kind, "node deletion finished");
        inner.results.insert(node.to_string(), result);
    }

    /// Deletions of `group` still running.
    pub fn deletions_in_progress(&self, group: &str) -> usize {
        self.lock().in_progress.get(group).copied().unwrap_or(0)
    }

    /// Deletions still running across all groups.
    pub fn total_in_progress(&self) -> usize {
        self.lock().in_progress.values().sum()
    }

    /// Set or release the non-empty deletion slot.
    pub fn set_non_empty_in_progress(&self, in_progress: bool) {
        self.lock().non_empty_in_progress = in_progress;
    }

    /// Whether a drain-and-delete is running.
    pub fn is_non_empty_in_progress(&self) -> bool {
        self.lock().non_empty_in_progress
    }

    /// Claim the single non-empty deletion slot. Returns `false` if it is
    /// already taken.
    pub fn try_start_non_empty(&self) -> bool {
        let mut inner = self.lock();
        if inner.non_empty_in_progress {
            return false;
        }
        inner.non_empty_in_progress = true;
        true
    }

    /// Results buffered since the previous call.
    pub fn take_results(&self) -> BTreeMap<String, NodeDeletionResult> {
        std::mem::take(&mut self.lock().results)
    }
}
