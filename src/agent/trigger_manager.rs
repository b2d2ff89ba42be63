//! Rate limiting and fair-share reporting across trigger queues.

use std::collections::HashMap;

use crate::util::token_bucket::TokenBucket;
use crate::{BufferId, QueueId, TraceId};

use super::data_manager::DataManager;
use super::error::StateError;

/// Default reporting bandwidth per queue: effectively unlimited.
pub const DEFAULT_REPORTING_LIMIT: f64 = 10.0 * 1024.0 * 1024.0 * 1024.0;

/// Default local trigger rate per queue, in triggers per second.
pub const DEFAULT_TRIGGER_LIMIT: f64 = 10_000.0;

/// Target bytes per report batch.
const REPORT_BATCH_BYTES: usize = 128 * 1024;

const MB: f64 = 1024.0 * 1024.0;

/// Breadcrumbs keyed by trace id that must be disseminated now.
pub type Breadcrumbs = HashMap<TraceId, Vec<String>>;

#[derive(Debug)]
struct ManagedQueue {
    trigger_limiter: TokenBucket,
    reporting_limiter: TokenBucket,
    /// Virtual time for fair sharing of report bandwidth.
    vt: u64,
}

#[derive(Debug)]
pub struct TriggerManager {
    dm: DataManager,
    queues: HashMap<QueueId, ManagedQueue>,
    /// Virtual time of the most recently serviced queue.
    vc: u64,
    buffer_size: usize,
    trigger_limit: f64,
    reporting_limit: f64,
    /// Per-queue reporting limits in bytes per second.
    queue_reporting_limits: HashMap<QueueId, f64>,
    batch_size: usize,
    /// Upper bound on live queues; zero means unbounded.
    max_queues: usize,
    rejected_triggers: u64,
}

impl TriggerManager {
    /// `trigger_limit` is local triggers per second per queue; zero disables
    /// the limit.
    pub fn new(dm: DataManager, buffer_size: usize, trigger_limit: f64) -> Self {
        let trigger_limit = if trigger_limit <= 0.0 {
            DEFAULT_REPORTING_LIMIT
        } else {
            trigger_limit
        };
        Self {
            dm,
            queues: HashMap::new(),
            vc: 0,
            buffer_size: buffer_size.max(1),
            trigger_limit,
            reporting_limit: DEFAULT_REPORTING_LIMIT,
            queue_reporting_limits: HashMap::new(),
            batch_size: 1 + REPORT_BATCH_BYTES / buffer_size.max(1),
            max_queues: 0,
            rejected_triggers: 0,
        }
    }

    /// Sets per-queue reporting limits, in MB/s.
    pub fn configure_rate_limits(&mut self, limits_mb: &HashMap<QueueId, f64>) {
        let now = self.dm.now();
        for (&queue_id, &limit) in limits_mb {
            let bytes = limit * MB;
            self.queue_reporting_limits.insert(queue_id, bytes);
            if let Some(queue) = self.queues.get_mut(&queue_id) {
                queue.reporting_limiter = TokenBucket::new(bytes, now);
            }
        }
    }

    pub fn set_max_queues(&mut self, max_queues: usize) {
        self.max_queues = max_queues;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn data_manager(&self) -> &DataManager {
        &self.dm
    }

    pub fn data_manager_mut(&mut self) -> &mut DataManager {
        &mut self.dm
    }

    /// Triggers refused because the queue limit was reached.
    pub fn take_rejected_triggers(&mut self) -> u64 {
        std::mem::take(&mut self.rejected_triggers)
    }

    fn managed_queue(&mut self, queue_id: QueueId) -> Option<&mut ManagedQueue> {
        if !self.queues.contains_key(&queue_id) {
            if !self.dm.has_queue(queue_id)
                && self.max_queues > 0
                && self.dm.queue_count() >= self.max_queues
            {
                let retired = self.dm.retire_vacant_queue()?;
                self.queues.remove(&retired);
            }

            let now = self.dm.now();
            let reporting_limit = self
                .queue_reporting_limits
                .get(&queue_id)
                .copied()
                .unwrap_or(self.reporting_limit);
            self.dm.queue(queue_id);
            self.queues.insert(
                queue_id,
                ManagedQueue {
                    trigger_limiter: TokenBucket::new(self.trigger_limit, now),
                    reporting_limiter: TokenBucket::new(reporting_limit, now),
                    vt: self.vc,
                },
            );
        }
        self.queues.get_mut(&queue_id)
    }

    /// Fires a trigger observed on this host, subject to the queue's trigger
    /// rate. Returns `None` when the trigger was not accepted.
    pub fn trigger_local(
        &mut self,
        queue_id: QueueId,
        base_trace_id: TraceId,
        trace_ids: &[TraceId],
    ) -> Result<Option<Breadcrumbs>, StateError> {
        let now = self.dm.now();
        let admitted = self.managed_queue(queue_id).map(|managed| {
            if managed.trigger_limiter.available(now) < 0.0 {
                return false;
            }
            managed.trigger_limiter.take(1.0, now);
            true
        });

        match admitted {
            None => {
                self.rejected_triggers += 1;
                Ok(None)
            }
            Some(false) => {
                if let Some(queue) = self.dm.queue_state_mut(queue_id) {
                    queue.metrics_mut().dropped += 1;
                }
                Ok(None)
            }
            Some(true) => {
                let mut queue = self.dm.queue(queue_id);
                if let Some(state) = queue.state_mut() {
                    state.metrics_mut().local += 1;
                }
                queue.trigger(base_trace_id, trace_ids).map(Some)
            }
        }
    }

    /// Fires a trigger forwarded by the coordinator. Never rate limited.
    pub fn trigger_remote(
        &mut self,
        queue_id: QueueId,
        base_trace_id: TraceId,
        trace_ids: &[TraceId],
    ) -> Result<Option<Breadcrumbs>, StateError> {
        if self.managed_queue(queue_id).is_none() {
            self.rejected_triggers += 1;
            return Ok(None);
        }

        let mut queue = self.dm.queue(queue_id);
        if let Some(state) = queue.state_mut() {
            state.metrics_mut().remote += 1;
        }
        queue.trigger(base_trace_id, trace_ids).map(Some)
    }

    /// Collects up to one batch of buffers to report, drawing from queues by
    /// lowest virtual time. Stops early when every queue with data is
    /// rate limited.
    pub fn next_batch_to_report(&mut self) -> Result<Vec<BufferId>, StateError> {
        let mut buffers = Vec::new();
        while buffers.len() < self.batch_size && self.dm.triggered_buffer_count() > 0 {
            match self.next_buffers_to_report()? {
                Some(next) => buffers.extend(next),
                None => break,
            }
        }
        Ok(buffers)
    }

    /// `None` when no queue is eligible.
    fn next_buffers_to_report(&mut self) -> Result<Option<Vec<BufferId>>, StateError> {
        let now = self.dm.now();
        let vc = self.vc;

        let mut chosen: Option<(QueueId, u64)> = None;
        for (&queue_id, managed) in self.queues.iter_mut() {
            let pending = self
                .dm
                .queue_state(queue_id)
                .map(|q| q.buffer_count())
                .unwrap_or(0);
            if pending == 0 {
                managed.vt = vc;
                continue;
            }
            if managed.reporting_limiter.available(now) < 0.0 {
                managed.vt = vc;
                continue;
            }
            if chosen.map_or(true, |(_, vt)| managed.vt < vt) {
                chosen = Some((queue_id, managed.vt));
            }
        }

        let Some((queue_id, _)) = chosen else {
            return Ok(None);
        };
        let buffers = self.dm.queue(queue_id).report_next()?;
        if !buffers.is_empty() {
            if let Some(managed) = self.queues.get_mut(&queue_id) {
                managed.vt += buffers.len() as u64;
                self.vc = managed.vt;
                managed
                    .reporting_limiter
                    .take((buffers.len() * self.buffer_size) as f64, now);
            }
        }
        Ok(Some(buffers))
    }

    /// Virtual time of a queue, if managed.
    pub fn virtual_time(&self, queue_id: QueueId) -> Option<u64> {
        self.queues.get(&queue_id).map(|q| q.vt)
    }
}
