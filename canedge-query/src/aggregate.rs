//! Result aggregator
//!
//! Collects the resampled points of each file into one series per target slot
//! and marks session boundaries with a single `[null, null]` point.

use crate::planner::TargetSlot;
use crate::types::{TimeSeriesPoint, TimeSeriesResult};

#[derive(Debug)]
struct SlotState {
    result: TimeSeriesResult,
    pending_gap: bool,
}

/// Running results of one request, one per target slot
#[derive(Debug)]
pub struct ResultAggregator {
    slots: Vec<SlotState>,
}

impl ResultAggregator {
    /// Start with an empty result for every slot
    pub fn new(targets: &[TargetSlot]) -> Self {
        let slots = targets
            .iter()
            .map(|t| SlotState {
                result: TimeSeriesResult::empty(&t.ref_id, &t.target),
                pending_gap: false,
            })
            .collect();
        Self { slots }
    }

    /// Announce the next file for `slots`
    ///
    /// On a session change, slots that already hold points get one gap marker
    /// ahead of their next appended points.
    pub fn begin_file(&mut self, session_changed: bool, slots: &[usize]) {
        if !session_changed {
            return;
        }
        for &slot in slots {
            if let Some(state) = self.slots.get_mut(slot) {
                if !state.result.datapoints.is_empty() {
                    state.pending_gap = true;
                }
            }
        }
    }

    /// Append a file's points to a slot, in file order
    pub fn append(&mut self, slot: usize, points: Vec<TimeSeriesPoint>) {
        let Some(state) = self.slots.get_mut(slot) else {
            log::warn!("No result slot {}", slot);
            return;
        };
        if points.is_empty() {
            return;
        }
        if state.pending_gap {
            state.result.datapoints.push(TimeSeriesPoint::gap());
            state.pending_gap = false;
        }
        state.result.datapoints.extend(points);
    }

    /// Slot of the first target carrying `label`
    pub fn slot_for(&self, label: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.result.target == label)
    }

    /// Results in slot order
    pub fn finish(self) -> Vec<TimeSeriesResult> {
        self.slots.into_iter().map(|s| s.result).collect()
    }
}
