//! Fired triggers grouped by trigger class.

use std::collections::HashMap;
use std::time::Instant;

use crate::util::lru::Lru;
use crate::util::priority_tree::PriorityTree;
use crate::{BufferId, QueueId, TraceId};

use super::data_manager::DataManager;
use super::error::StateError;
use super::fired_trigger::{FiredTrigger, TriggerId};

/// Per-queue counters, reset on every telemetry snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerMetrics {
    /// Fired triggers created.
    pub count: u64,
    /// Triggers fired locally and accepted.
    pub local: u64,
    /// Triggers received from the coordinator.
    pub remote: u64,
    /// Local triggers rejected by the rate limit.
    pub dropped: u64,
    /// Fired triggers evicted under memory pressure.
    pub evicted: u64,
    /// Buffers that became pending for report.
    pub buffers: u64,
    pub reported_buffers: u64,
    pub evicted_buffers: u64,
}

#[derive(Debug)]
pub struct TriggerQueue {
    pub(super) id: QueueId,
    pub(super) trace_count: usize,
    pub(super) buffer_count: usize,
    pub(super) fired: HashMap<TraceId, FiredTrigger>,
    /// Base ids of reporting triggers.
    pub(super) reporting: PriorityTree,
    /// Base ids of idle triggers, most recently idle first.
    pub(super) idle: Lru<TraceId>,
    pub(super) metrics: TriggerMetrics,
}

impl TriggerQueue {
    pub(super) fn new(id: QueueId) -> Self {
        Self {
            id,
            trace_count: 0,
            buffer_count: 0,
            fired: HashMap::new(),
            reporting: PriorityTree::new(),
            idle: Lru::new(),
            metrics: TriggerMetrics::default(),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn trace_count(&self) -> usize {
        self.trace_count
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn fired(&self, base_trace_id: TraceId) -> Option<&FiredTrigger> {
        self.fired.get(&base_trace_id)
    }

    pub fn fired_count(&self) -> usize {
        self.fired.len()
    }

    /// Fired triggers with data pending.
    pub fn reporting_count(&self) -> usize {
        self.fired.values().filter(|t| t.is_reporting()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn metrics(&self) -> &TriggerMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut TriggerMetrics {
        &mut self.metrics
    }

    /// Returns the counters accumulated since the previous call.
    pub fn take_metrics(&mut self) -> TriggerMetrics {
        std::mem::take(&mut self.metrics)
    }

    /// Holds no triggers and no data; safe to discard.
    pub fn is_vacant(&self) -> bool {
        self.fired.is_empty() && self.trace_count == 0 && self.buffer_count == 0
    }
}

/// Mutable view of one queue with access to the traces it references.
///
/// Obtained from [`DataManager::queue`], which creates the queue on first use.
pub struct QueueHandle<'a> {
    pub(super) dm: &'a mut DataManager,
    pub(super) id: QueueId,
}

impl QueueHandle<'_> {
    fn queue(&self) -> Result<&TriggerQueue, StateError> {
        self.dm
            .triggered
            .queues
            .get(&self.id)
            .ok_or(StateError::UnknownQueue(self.id))
    }

    fn queue_mut(&mut self) -> Result<&mut TriggerQueue, StateError> {
        self.dm.triggered.queue_mut(self.id)
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn state(&self) -> Option<&TriggerQueue> {
        self.queue().ok()
    }

    pub fn state_mut(&mut self) -> Option<&mut TriggerQueue> {
        self.queue_mut().ok()
    }

    pub fn buffer_count(&self) -> usize {
        self.queue().map(|q| q.buffer_count).unwrap_or(0)
    }

    pub fn trace_count(&self) -> usize {
        self.queue().map(|q| q.trace_count).unwrap_or(0)
    }

    /// Fires `base_trace_id` over `trace_ids`. Returns, per trace, the
    /// breadcrumbs that were waiting for a trigger.
    pub fn trigger(
        &mut self,
        base_trace_id: TraceId,
        trace_ids: &[TraceId],
    ) -> Result<HashMap<TraceId, Vec<String>>, StateError> {
        let now = self.dm.now;
        let queue = self.queue_mut()?;
        if !queue.fired.contains_key(&base_trace_id) {
            queue.create_trigger(base_trace_id, now);
        }

        let id = TriggerId {
            queue_id: self.id,
            base_trace_id,
        };
        let mut breadcrumbs = HashMap::new();
        for &trace_id in trace_ids {
            self.dm.ensure_trace(trace_id);
            let pending = self.dm.add_trace(id, trace_id)?;
            if !pending.is_empty() {
                breadcrumbs.insert(trace_id, pending);
            }
        }
        Ok(breadcrumbs)
    }

    /// Reports the lowest base id with pending data.
    pub fn report_next(&mut self) -> Result<Vec<BufferId>, StateError> {
        let Some(base_trace_id) = self.queue_mut()?.reporting.pop_min() else {
            return Ok(Vec::new());
        };
        if !self.queue()?.is_reporting(base_trace_id) {
            return Ok(Vec::new());
        }
        let buffers = self.dm.report_trigger(TriggerId {
            queue_id: self.id,
            base_trace_id,
        })?;
        self.queue_mut()?.metrics.reported_buffers += buffers.len() as u64;
        Ok(buffers)
    }

    /// Evicts one reporting trigger with a large base id.
    pub fn evict_next(&mut self) -> Result<Vec<BufferId>, StateError> {
        let Some(base_trace_id) = self.queue_mut()?.reporting.pop_near_max() else {
            return Ok(Vec::new());
        };
        if !self.queue()?.is_reporting(base_trace_id) {
            return Ok(Vec::new());
        }
        self.dm.evict_trigger(TriggerId {
            queue_id: self.id,
            base_trace_id,
        })
    }

    /// Evicts triggers until the data manager's triggered buffer count falls
    /// to `target`, in batches of at least `target / 100` buffers. Negative
    /// targets disable eviction. May drain the queue without reaching target.
    pub fn evict_to_capacity(&mut self, target: i64) -> Result<Vec<BufferId>, StateError> {
        let current = self.dm.triggered.buffer_count as i64;
        if target < 0 || current <= target {
            return Ok(Vec::new());
        }
        let num_to_evict = (current - target).max(target / 100) as usize;

        let mut evicted = Vec::new();
        let mut triggers = 0u64;
        while evicted.len() < num_to_evict {
            let Some(base_trace_id) = self.queue_mut()?.reporting.pop_near_max() else {
                break;
            };
            if !self.queue()?.is_reporting(base_trace_id) {
                continue;
            }
            evicted.extend(self.dm.evict_trigger(TriggerId {
                queue_id: self.id,
                base_trace_id,
            })?);
            triggers += 1;
        }

        let metrics = &mut self.queue_mut()?.metrics;
        metrics.evicted += triggers;
        metrics.evicted_buffers += evicted.len() as u64;
        Ok(evicted)
    }

    /// Times out idle triggers untouched since `before`, oldest first.
    /// Returns how many were removed.
    pub fn check_idle_triggers(&mut self, before: Instant) -> Result<usize, StateError> {
        let mut removed = 0;
        while let Some(base_trace_id) = self.queue()?.idle.back() {
            let timed_out = self.dm.check_trigger_timeout(
                TriggerId {
                    queue_id: self.id,
                    base_trace_id,
                },
                before,
            )?;
            if !timed_out {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }
}
