//! One firing of a trigger class for a base trace id.
//!
//! A fired trigger is `Idle` (nothing pending, linked into its queue's idle
//! LRU, may time out) or `Reporting` (some member trace has pending buffers,
//! its base id sits in the queue's reporting tree, never times out).

use std::collections::HashSet;
use std::time::Instant;

pub use crate::TriggerId;
use crate::{BufferId, TraceId};

use super::data_manager::DataManager;
use super::error::StateError;
use super::trigger_queue::TriggerQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiredState {
    Idle { last_modified: Instant },
    Reporting,
}

#[derive(Debug)]
pub struct FiredTrigger {
    id: TriggerId,
    /// Lateral traces that share this trigger's fate.
    traces: HashSet<TraceId>,
    /// Sum of pending buffers across member traces.
    buffer_count: usize,
    state: FiredState,
}

impl FiredTrigger {
    pub fn id(&self) -> TriggerId {
        self.id
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn contains_trace(&self, trace_id: TraceId) -> bool {
        self.traces.contains(&trace_id)
    }

    pub fn state(&self) -> FiredState {
        self.state
    }

    pub fn is_reporting(&self) -> bool {
        self.state == FiredState::Reporting
    }

    fn member_traces(&self) -> Vec<TraceId> {
        self.traces.iter().copied().collect()
    }
}

impl TriggerQueue {
    /// Creates an idle trigger at the front of the idle LRU.
    pub(super) fn create_trigger(&mut self, base_trace_id: TraceId, now: Instant) {
        let trigger = FiredTrigger {
            id: TriggerId {
                queue_id: self.id,
                base_trace_id,
            },
            traces: HashSet::new(),
            buffer_count: 0,
            state: FiredState::Idle { last_modified: now },
        };
        self.idle.touch(base_trace_id);
        self.fired.insert(base_trace_id, trigger);
        self.metrics.count += 1;
    }

    /// A member trace received `n` buffers to report.
    pub(super) fn buffers_added(&mut self, base_trace_id: TraceId, n: usize) -> Result<(), StateError> {
        let id = self.trigger_id(base_trace_id);
        let trigger = self
            .fired
            .get_mut(&base_trace_id)
            .ok_or(StateError::UnknownTrigger(id))?;

        trigger.buffer_count += n;
        self.buffer_count += n;
        self.metrics.buffers += n as u64;

        if let FiredState::Idle { .. } = trigger.state {
            trigger.state = FiredState::Reporting;
            self.idle.remove(&base_trace_id);
            self.reporting.insert(base_trace_id);
        }
        Ok(())
    }

    /// A member trace gave up `n` pending buffers. A reporting trigger
    /// left with nothing pending goes idle; its base id stays in the
    /// reporting tree and is skipped when popped.
    pub(super) fn buffers_removed(
        &mut self,
        base_trace_id: TraceId,
        n: usize,
        now: Instant,
    ) -> Result<(), StateError> {
        let id = self.trigger_id(base_trace_id);
        let trigger = self
            .fired
            .get_mut(&base_trace_id)
            .ok_or(StateError::UnknownTrigger(id))?;
        trigger.buffer_count -= n;
        self.buffer_count -= n;

        if trigger.buffer_count == 0 && trigger.is_reporting() {
            trigger.state = FiredState::Idle { last_modified: now };
            self.idle.touch(base_trace_id);
        }
        Ok(())
    }

    /// Popped base ids may be stale: deleted, or drained by another queue.
    pub(super) fn is_reporting(&self, base_trace_id: TraceId) -> bool {
        self.fired
            .get(&base_trace_id)
            .is_some_and(FiredTrigger::is_reporting)
    }

    fn trigger_id(&self, base_trace_id: TraceId) -> TriggerId {
        TriggerId {
            queue_id: self.id,
            base_trace_id,
        }
    }
}

impl DataManager {
    fn fired(&self, id: TriggerId) -> Result<&FiredTrigger, StateError> {
        self.triggered
            .queues
            .get(&id.queue_id)
            .and_then(|q| q.fired.get(&id.base_trace_id))
            .ok_or(StateError::UnknownTrigger(id))
    }

    fn fired_mut(&mut self, id: TriggerId) -> Result<&mut FiredTrigger, StateError> {
        self.triggered
            .queues
            .get_mut(&id.queue_id)
            .and_then(|q| q.fired.get_mut(&id.base_trace_id))
            .ok_or(StateError::UnknownTrigger(id))
    }

    /// Adds a lateral trace to the trigger. Returns breadcrumbs to
    /// disseminate immediately.
    pub(super) fn add_trace(
        &mut self,
        id: TriggerId,
        trace_id: TraceId,
    ) -> Result<Vec<String>, StateError> {
        self.fired_mut(id)?.traces.insert(trace_id);
        self.with_trace(trace_id, |state, ledger| {
            state.add_trigger(trace_id, id, ledger)
        })
    }

    /// Drains every member trace and returns the trigger to idle.
    pub(super) fn report_trigger(&mut self, id: TriggerId) -> Result<Vec<BufferId>, StateError> {
        if !self.fired(id)?.is_reporting() {
            return Err(StateError::TriggerIdle {
                trigger: id,
                op: "report",
            });
        }

        let mut buffers = Vec::new();
        for trace_id in self.fired(id)?.member_traces() {
            buffers.extend(self.with_trace(trace_id, |state, ledger| {
                state.take_buffers(trace_id, ledger)
            })?);
        }

        let now = self.now;
        let trigger = self.fired_mut(id)?;
        if trigger.buffer_count != 0 {
            return Err(StateError::BuffersRemain {
                trigger: id,
                remaining: trigger.buffer_count,
                op: "report",
            });
        }
        trigger.state = FiredState::Idle { last_modified: now };
        self.triggered.queue_mut(id.queue_id)?.idle.touch(id.base_trace_id);
        Ok(buffers)
    }

    /// Detaches every member trace and deletes the trigger. Returns buffers
    /// of traces that had no other trigger.
    pub(super) fn evict_trigger(&mut self, id: TriggerId) -> Result<Vec<BufferId>, StateError> {
        if !self.fired(id)?.is_reporting() {
            return Err(StateError::TriggerIdle {
                trigger: id,
                op: "evict",
            });
        }

        let mut buffers = Vec::new();
        for trace_id in self.fired(id)?.member_traces() {
            buffers.extend(self.with_trace(trace_id, |state, ledger| {
                state.remove_trigger(trace_id, id, ledger)
            })?);
        }

        let remaining = self.fired(id)?.buffer_count;
        if remaining != 0 {
            return Err(StateError::BuffersRemain {
                trigger: id,
                remaining,
                op: "evict",
            });
        }
        let queue = self.triggered.queue_mut(id.queue_id)?;
        queue.idle.remove(&id.base_trace_id);
        queue.fired.remove(&id.base_trace_id);
        Ok(buffers)
    }

    /// Deletes an idle trigger last touched at or before `before`.
    /// Reporting triggers never time out.
    pub(super) fn check_trigger_timeout(
        &mut self,
        id: TriggerId,
        before: Instant,
    ) -> Result<bool, StateError> {
        let trigger = self.fired(id)?;
        match trigger.state {
            FiredState::Reporting => return Ok(false),
            FiredState::Idle { last_modified } if last_modified > before => return Ok(false),
            FiredState::Idle { .. } => {}
        }

        for trace_id in trigger.member_traces() {
            let released = self.with_trace(trace_id, |state, ledger| {
                state.remove_trigger(trace_id, id, ledger)
            })?;
            if !released.is_empty() {
                return Err(StateError::IdleTriggerHadBuffers {
                    trigger: id,
                    count: released.len(),
                });
            }
        }

        let queue = self.triggered.queue_mut(id.queue_id)?;
        queue.idle.remove(&id.base_trace_id);
        queue.fired.remove(&id.base_trace_id);
        Ok(true)
    }
}
