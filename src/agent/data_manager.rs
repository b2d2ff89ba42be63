//! Owner of every trace and trigger queue on the agent.
//!
//! The data manager only records state; eviction policy and timeouts are
//! driven from the outside by the agent loop.

use std::collections::HashMap;
use std::time::Instant;

use crate::util::lru::Lru;
use crate::{BufferId, QueueId, TraceId};

use super::error::StateError;
use super::fired_trigger::TriggerId;
use super::trace::{Ledger, Step, TraceState};
use super::trigger_queue::{QueueHandle, TriggerQueue};

/// Traces with no trigger, in LRU order.
#[derive(Debug, Default)]
pub struct UntriggeredData {
    pub(super) lru: Lru<TraceId>,
    pub(super) trace_count: usize,
    pub(super) buffer_count: usize,
    /// Last-modified time of the most recently evicted untriggered trace.
    pub(super) event_horizon: Option<Instant>,
}

/// Traces belonging to at least one fired trigger.
#[derive(Debug, Default)]
pub struct TriggeredData {
    pub(super) trace_count: usize,
    pub(super) buffer_count: usize,
    pub(super) queues: HashMap<QueueId, TriggerQueue>,
    /// Queue ids by last use, for retiring vacant queues.
    pub(super) queue_lru: Lru<QueueId>,
}

impl TriggeredData {
    pub(super) fn queue_mut(&mut self, id: QueueId) -> Result<&mut TriggerQueue, StateError> {
        self.queues.get_mut(&id).ok_or(StateError::UnknownQueue(id))
    }

    pub(super) fn buffers_added(&mut self, trigger: TriggerId, n: usize) -> Result<(), StateError> {
        self.queue_mut(trigger.queue_id)?
            .buffers_added(trigger.base_trace_id, n)
    }

    pub(super) fn buffers_removed(
        &mut self,
        trigger: TriggerId,
        n: usize,
        now: Instant,
    ) -> Result<(), StateError> {
        self.queue_mut(trigger.queue_id)?
            .buffers_removed(trigger.base_trace_id, n, now)
    }
}

#[derive(Debug)]
pub struct DataManager {
    pub(super) now: Instant,
    pub(super) traces: HashMap<TraceId, TraceState>,
    pub(super) untriggered: UntriggeredData,
    pub(super) triggered: TriggeredData,
}

impl DataManager {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            traces: HashMap::new(),
            untriggered: UntriggeredData::default(),
            triggered: TriggeredData::default(),
        }
    }

    /// Timestamp applied to subsequent modifications.
    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn trace_count(&self) -> usize {
        self.untriggered.trace_count + self.triggered.trace_count
    }

    pub fn buffer_count(&self) -> usize {
        self.untriggered.buffer_count + self.triggered.buffer_count
    }

    pub fn untriggered_trace_count(&self) -> usize {
        self.untriggered.trace_count
    }

    pub fn untriggered_buffer_count(&self) -> usize {
        self.untriggered.buffer_count
    }

    pub fn triggered_trace_count(&self) -> usize {
        self.triggered.trace_count
    }

    pub fn triggered_buffer_count(&self) -> usize {
        self.triggered.buffer_count
    }

    /// Last-modified time of the most recently evicted untriggered trace.
    pub fn event_horizon(&self) -> Option<Instant> {
        self.untriggered.event_horizon
    }

    pub fn trace(&self, id: TraceId) -> Option<&TraceState> {
        self.traces.get(&id)
    }

    pub fn queue_count(&self) -> usize {
        self.triggered.queues.len()
    }

    pub fn has_queue(&self, id: QueueId) -> bool {
        self.triggered.queues.contains_key(&id)
    }

    pub fn queue_ids(&self) -> Vec<QueueId> {
        self.triggered.queues.keys().copied().collect()
    }

    /// Read-only view of a queue, without creating it.
    pub fn queue_state(&self, id: QueueId) -> Option<&TriggerQueue> {
        self.triggered.queues.get(&id)
    }

    pub fn queue_state_mut(&mut self, id: QueueId) -> Option<&mut TriggerQueue> {
        self.triggered.queues.get_mut(&id)
    }

    /// Returns the queue, creating it on first use.
    pub fn queue(&mut self, id: QueueId) -> QueueHandle<'_> {
        self.triggered
            .queues
            .entry(id)
            .or_insert_with(|| TriggerQueue::new(id));
        self.triggered.queue_lru.touch(id);
        QueueHandle { dm: self, id }
    }

    /// Removes the least recently used queue that holds nothing.
    pub fn retire_vacant_queue(&mut self) -> Option<QueueId> {
        let queues = &self.triggered.queues;
        let victim = self
            .triggered
            .queue_lru
            .iter_oldest()
            .find(|id| queues.get(id).is_some_and(TriggerQueue::is_vacant))?;
        self.triggered.queue_lru.remove(&victim);
        self.triggered.queues.remove(&victim);
        Some(victim)
    }

    pub fn add_buffers(&mut self, trace_id: TraceId, buffers: Vec<BufferId>) -> Result<(), StateError> {
        self.ensure_trace(trace_id);
        self.with_trace(trace_id, |state, ledger| {
            state.add_buffers(trace_id, buffers, ledger)
        })
    }

    /// Returns breadcrumbs to disseminate now (non-empty only if triggered).
    pub fn add_breadcrumbs(
        &mut self,
        trace_id: TraceId,
        breadcrumbs: Vec<String>,
    ) -> Result<Vec<String>, StateError> {
        self.ensure_trace(trace_id);
        self.with_trace(trace_id, |state, ledger| {
            state.add_breadcrumbs(trace_id, breadcrumbs, ledger)
        })
    }

    pub fn trigger(
        &mut self,
        queue_id: QueueId,
        base_trace_id: TraceId,
        trace_ids: &[TraceId],
    ) -> Result<HashMap<TraceId, Vec<String>>, StateError> {
        self.queue(queue_id).trigger(base_trace_id, trace_ids)
    }

    /// Evicts the least recently used untriggered trace.
    pub fn evict(&mut self) -> Result<Vec<BufferId>, StateError> {
        match self.untriggered.lru.back() {
            Some(trace_id) => self.with_trace(trace_id, |state, ledger| {
                state.take_buffers(trace_id, ledger)
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Evicts untriggered traces, oldest first, until the total buffer count
    /// falls to `target`, in batches of at least `target / 100` buffers.
    /// Negative targets disable eviction.
    pub fn evict_to_capacity(&mut self, target: i64) -> Result<Vec<BufferId>, StateError> {
        let current = self.buffer_count() as i64;
        if target < 0 || current <= target {
            return Ok(Vec::new());
        }
        let num_to_evict = (current - target).max(target / 100) as usize;

        let mut evicted = Vec::new();
        while evicted.len() < num_to_evict && !self.untriggered.lru.is_empty() {
            evicted.extend(self.evict()?);
        }
        Ok(evicted)
    }

    /// Evicts from whichever queue currently holds the most buffers.
    pub fn evict_triggered_to_capacity(&mut self, target: i64) -> Result<Vec<BufferId>, StateError> {
        let current = self.triggered.buffer_count as i64;
        if target < 0 || current <= target {
            return Ok(Vec::new());
        }
        let largest = self
            .triggered
            .queues
            .values()
            .max_by_key(|q| q.buffer_count)
            .map(|q| q.id);
        match largest {
            Some(id) => QueueHandle { dm: self, id }.evict_to_capacity(target),
            None => Ok(Vec::new()),
        }
    }

    /// Times out idle triggers in every queue. Returns how many were removed.
    pub fn check_idle_triggers(&mut self, before: Instant) -> Result<usize, StateError> {
        let mut removed = 0;
        for id in self.queue_ids() {
            removed += QueueHandle { dm: self, id }.check_idle_triggers(before)?;
        }
        Ok(removed)
    }

    pub(super) fn ensure_trace(&mut self, trace_id: TraceId) {
        if self.traces.contains_key(&trace_id) {
            return;
        }
        let mut ledger = Ledger {
            now: self.now,
            untriggered: &mut self.untriggered,
            triggered: &mut self.triggered,
        };
        let state = TraceState::create(trace_id, &mut ledger);
        self.traces.insert(trace_id, state);
    }

    /// Runs one transition on a trace, reinserting its next state or
    /// deleting it.
    pub(super) fn with_trace<T>(
        &mut self,
        trace_id: TraceId,
        transition: impl FnOnce(TraceState, &mut Ledger<'_>) -> Step<T>,
    ) -> Result<T, StateError> {
        let state = self
            .traces
            .remove(&trace_id)
            .ok_or(StateError::UnknownTrace(trace_id))?;
        let mut ledger = Ledger {
            now: self.now,
            untriggered: &mut self.untriggered,
            triggered: &mut self.triggered,
        };
        let (next, out) = transition(state, &mut ledger)?;
        if let Some(next) = next {
            self.traces.insert(trace_id, next);
        }
        Ok(out)
    }
}

impl Default for DataManager {
    fn default() -> Self {
        Self::new()
    }
}
