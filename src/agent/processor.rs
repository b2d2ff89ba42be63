//! The agent's serialized processing loop.
//!
//! Every mutation of the data manager happens on this task. Other tasks talk
//! to it only through channels, and it never blocks on any of them: outbound
//! sends that would block are dropped and counted instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::export::health::HealthMetrics;
use crate::transport::{BreadcrumbBatch, CompleteBatch, LocalTrigger};
use crate::{BufferId, TraceId};

use super::error::StateError;
use super::metrics::{AgentMetrics, Stats};
use super::trigger_manager::{Breadcrumbs, TriggerManager};

/// Depth of the channels toward the coordinator senders.
pub const COORDINATOR_CHANNEL_SIZE: usize = 500;
/// Depth of the remote-trigger channel fed by the RPC handler.
pub const REMOTE_TRIGGER_CHANNEL_SIZE: usize = 500;
/// Depth of the channel toward the reporting sender.
pub const REPORTING_CHANNEL_SIZE: usize = 4;

/// Channels the loop consumes.
#[derive(Debug)]
pub struct ProcessorInputs {
    pub complete: mpsc::Receiver<CompleteBatch>,
    pub breadcrumbs: mpsc::Receiver<BreadcrumbBatch>,
    pub local_triggers: mpsc::Receiver<Vec<LocalTrigger>>,
    /// Triggers forwarded by the coordinator, one entry per trace id.
    pub remote_triggers: mpsc::Receiver<Vec<LocalTrigger>>,
}

/// Channels the loop produces into.
#[derive(Debug, Clone)]
pub struct ProcessorOutputs {
    /// Buffers released back to the producer.
    pub available: mpsc::UnboundedSender<Vec<BufferId>>,
    pub coordinator_triggers: mpsc::Sender<Vec<LocalTrigger>>,
    pub coordinator_breadcrumbs: mpsc::Sender<Breadcrumbs>,
    pub reporting: mpsc::Sender<Vec<BufferId>>,
}

pub struct Processor {
    tm: TriggerManager,
    cache_capacity: usize,
    triggered_capacity: usize,
    idle_trigger_timeout: Duration,
    report_interval: Duration,
    stats_interval: Duration,
    verbose_stats: bool,
    metrics: AgentMetrics,
    health: Arc<HealthMetrics>,
    outputs: ProcessorOutputs,
}

impl Processor {
    /// `capacity` is the number of buffers in the pool. Eviction starts at
    /// four fifths of it; triggered data may hold half of that.
    pub fn new(
        tm: TriggerManager,
        capacity: usize,
        cfg: &AgentConfig,
        health: Arc<HealthMetrics>,
        outputs: ProcessorOutputs,
    ) -> Self {
        let cache_capacity = 4 * capacity / 5;
        Self {
            tm,
            cache_capacity,
            triggered_capacity: cache_capacity / 2,
            idle_trigger_timeout: cfg.idle_trigger_timeout,
            report_interval: cfg.report_interval,
            stats_interval: cfg.stats_interval,
            verbose_stats: cfg.verbose_stats,
            metrics: AgentMetrics::default(),
            health,
            outputs,
        }
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    pub fn triggered_capacity(&self) -> usize {
        self.triggered_capacity
    }

    pub fn trigger_manager(&self) -> &TriggerManager {
        &self.tm
    }

    pub fn trigger_manager_mut(&mut self) -> &mut TriggerManager {
        &mut self.tm
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    fn recycle(&self, buffers: Vec<BufferId>) {
        if buffers.is_empty() {
            return;
        }
        if self.outputs.available.send(buffers).is_err() {
            debug!("buffer producer gone, dropping released buffers");
        }
    }

    /// Evicts once the cache is nearly full: idle triggers first, then
    /// triggered data, then untriggered data.
    pub fn maybe_evict(&mut self) -> Result<(), StateError> {
        let dm = self.tm.data_manager_mut();
        if dm.buffer_count() < self.cache_capacity {
            return Ok(());
        }

        let now = dm.now();
        if let Some(cutoff) = now.checked_sub(self.idle_trigger_timeout) {
            dm.check_idle_triggers(cutoff)?;
        }
        let triggered = dm.evict_triggered_to_capacity(self.triggered_capacity as i64)?;
        let untriggered = dm.evict_to_capacity(self.cache_capacity as i64)?;
        if let Some(horizon) = dm.event_horizon() {
            self.metrics.event_horizon = now.saturating_duration_since(horizon);
        }

        self.health
            .buffers_evicted
            .with_label_values(&["triggered"])
            .inc_by(triggered.len() as f64);
        self.health
            .buffers_evicted
            .with_label_values(&["untriggered"])
            .inc_by(untriggered.len() as f64);

        self.recycle(triggered);
        self.recycle(untriggered);
        Ok(())
    }

    pub fn process_completed_buffers(&mut self, batch: CompleteBatch) -> Result<(), StateError> {
        let mut freed = Vec::new();
        let mut received = 0;
        for (trace_id, buffers) in batch {
            received += buffers.len() as u64;
            if trace_id == 0 {
                freed.extend(buffers);
            } else {
                self.tm.data_manager_mut().add_buffers(trace_id, buffers)?;
            }
        }
        self.metrics.complete_buffers += received;
        self.health.buffers_received.inc_by(received as f64);

        self.maybe_evict()?;
        self.recycle(freed);

        self.metrics.complete_batches += 1;
        self.health.complete_batches.inc();
        Ok(())
    }

    pub fn process_breadcrumbs(&mut self, batch: BreadcrumbBatch) -> Result<(), StateError> {
        let mut to_forward = Breadcrumbs::new();
        for (trace_id, addrs) in batch {
            if trace_id == 0 {
                continue;
            }
            let forward = self.tm.data_manager_mut().add_breadcrumbs(trace_id, addrs)?;
            if !forward.is_empty() {
                to_forward.insert(trace_id, forward);
            }
        }
        self.forward_breadcrumbs(to_forward);
        Ok(())
    }

    pub fn process_triggers(&mut self, batch: Vec<LocalTrigger>) -> Result<(), StateError> {
        let mut accepted = Vec::new();
        let mut to_forward = Breadcrumbs::new();
        for trigger in batch {
            let fired =
                self.tm
                    .trigger_local(trigger.queue_id, trigger.base_trace_id, &[trigger.trace_id])?;
            if let Some(breadcrumbs) = fired {
                accepted.push(trigger);
                merge_breadcrumbs(&mut to_forward, breadcrumbs);
            }
        }
        self.count_rejected();

        if !accepted.is_empty() {
            let n = accepted.len();
            self.health
                .triggers
                .with_label_values(&["local"])
                .inc_by(n as f64);
            if self.outputs.coordinator_triggers.try_send(accepted).is_err() {
                self.metrics.dropped_triggers += n as u64;
                self.health
                    .channel_dropped
                    .with_label_values(&["triggers"])
                    .inc_by(n as f64);
            }
        }
        self.forward_breadcrumbs(to_forward);
        Ok(())
    }

    pub fn process_remote_triggers(&mut self, batch: Vec<LocalTrigger>) -> Result<(), StateError> {
        let mut to_forward = Breadcrumbs::new();
        let mut accepted: u32 = 0;
        for trigger in batch {
            let fired =
                self.tm
                    .trigger_remote(trigger.queue_id, trigger.base_trace_id, &[trigger.trace_id])?;
            if let Some(breadcrumbs) = fired {
                accepted += 1;
                merge_breadcrumbs(&mut to_forward, breadcrumbs);
            }
        }
        self.count_rejected();
        self.health
            .triggers
            .with_label_values(&["remote"])
            .inc_by(f64::from(accepted));

        self.forward_breadcrumbs(to_forward);
        Ok(())
    }

    fn count_rejected(&mut self) {
        let rejected = self.tm.take_rejected_triggers();
        if rejected > 0 {
            self.health
                .triggers_dropped
                .with_label_values(&["queue_limit"])
                .inc_by(rejected as f64);
        }
    }

    fn forward_breadcrumbs(&mut self, breadcrumbs: Breadcrumbs) {
        if breadcrumbs.is_empty() {
            return;
        }
        let n: usize = breadcrumbs.values().map(Vec::len).sum();
        if self
            .outputs
            .coordinator_breadcrumbs
            .try_send(breadcrumbs)
            .is_err()
        {
            self.metrics.dropped_breadcrumbs += n as u64;
            self.health
                .channel_dropped
                .with_label_values(&["breadcrumbs"])
                .inc_by(n as f64);
        }
    }

    /// Collects the next report batch and updates the cache gauges.
    pub fn next_batch(&mut self) -> Result<Vec<BufferId>, StateError> {
        let batch = self.tm.next_batch_to_report()?;
        let dm = self.tm.data_manager();
        self.health
            .cache_buffers
            .with_label_values(&["untriggered"])
            .set(dm.untriggered_buffer_count() as f64);
        self.health
            .cache_buffers
            .with_label_values(&["triggered"])
            .set(dm.triggered_buffer_count() as f64);
        Ok(batch)
    }

    fn report_stats(&mut self, interval: Duration) {
        let stats = Stats::collect(&mut self.metrics, &mut self.tm, interval);
        stats.publish(&self.health);
        if self.verbose_stats {
            info!("{stats}");
        } else {
            debug!("{stats}");
        }
    }

    /// Runs until cancelled. Returns an error only for a broken cache
    /// invariant, which leaves the agent's state unusable.
    pub async fn run(mut self, mut inputs: ProcessorInputs, cancel: CancellationToken) -> Result<()> {
        info!("begun receiving trace data");

        let mut pending: Vec<BufferId> = Vec::new();
        let report_timer = sleep(Duration::ZERO);
        tokio::pin!(report_timer);

        let mut stats_ticker = interval_at(Instant::now() + self.stats_interval, self.stats_interval);
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_stats = Instant::now();

        let reporting = self.outputs.reporting.clone();
        let mut open = Open::default();

        let result = loop {
            self.tm.data_manager_mut().set_now(std::time::Instant::now());
            let has_pending = !pending.is_empty();

            let step: Result<(), StateError> = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                _ = &mut report_timer, if !has_pending => {
                    report_timer.as_mut().reset(Instant::now() + self.report_interval);
                    self.next_batch().map(|batch| pending = batch)
                }

                permit = reporting.reserve(), if has_pending => match permit {
                    Ok(permit) => {
                        let batch = std::mem::take(&mut pending);
                        self.health.buffers_reported.inc_by(batch.len() as f64);
                        permit.send(batch);
                        report_timer.as_mut().reset(Instant::now() + self.report_interval);
                        self.next_batch().map(|batch| pending = batch)
                    }
                    Err(_) => {
                        warn!("reporting channel closed, recycling unreported buffers");
                        self.recycle(std::mem::take(&mut pending));
                        break Ok(());
                    }
                },

                received = inputs.remote_triggers.recv(), if open.remote_triggers => match received {
                    Some(batch) => self.process_remote_triggers(batch),
                    None => { open.remote_triggers = false; Ok(()) }
                },

                received = inputs.local_triggers.recv(), if open.local_triggers => match received {
                    Some(batch) => self.process_triggers(batch),
                    None => { open.local_triggers = false; Ok(()) }
                },

                received = inputs.complete.recv(), if open.complete => match received {
                    Some(batch) => self.process_completed_buffers(batch),
                    None => { open.complete = false; Ok(()) }
                },

                received = inputs.breadcrumbs.recv(), if open.breadcrumbs => match received {
                    Some(batch) => self.process_breadcrumbs(batch),
                    None => { open.breadcrumbs = false; Ok(()) }
                },

                _ = stats_ticker.tick() => {
                    let now = Instant::now();
                    self.report_stats(now.duration_since(last_stats));
                    last_stats = now;
                    Ok(())
                }
            };

            if let Err(e) = step {
                error!(error = %e, "agent cache state corrupted");
                break Err(e.into());
            }
        };

        self.recycle(pending);
        info!("stopped receiving trace data");
        result
    }
}

#[derive(Debug)]
struct Open {
    complete: bool,
    breadcrumbs: bool,
    local_triggers: bool,
    remote_triggers: bool,
}

impl Default for Open {
    fn default() -> Self {
        Self {
            complete: true,
            breadcrumbs: true,
            local_triggers: true,
            remote_triggers: true,
        }
    }
}

fn merge_breadcrumbs(into: &mut Breadcrumbs, from: impl IntoIterator<Item = (TraceId, Vec<String>)>) {
    for (trace_id, addrs) in from {
        if !addrs.is_empty() {
            into.entry(trace_id).or_default().extend(addrs);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::agent::data_manager::DataManager;

    struct Harness {
        processor: Processor,
        available: mpsc::UnboundedReceiver<Vec<BufferId>>,
        triggers: mpsc::Receiver<Vec<LocalTrigger>>,
        breadcrumbs: mpsc::Receiver<Breadcrumbs>,
        _reporting: mpsc::Receiver<Vec<BufferId>>,
    }

    fn harness(capacity: usize) -> Harness {
        let (available_tx, available) = mpsc::unbounded_channel();
        let (triggers_tx, triggers) = mpsc::channel(1);
        let (breadcrumbs_tx, breadcrumbs) = mpsc::channel(1);
        let (reporting_tx, reporting) = mpsc::channel(REPORTING_CHANNEL_SIZE);

        let mut dm = DataManager::new();
        dm.set_now(std::time::Instant::now());
        let tm = TriggerManager::new(dm, 1024, 0.0);
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let processor = Processor::new(
            tm,
            capacity,
            &AgentConfig::default(),
            health,
            ProcessorOutputs {
                available: available_tx,
                coordinator_triggers: triggers_tx,
                coordinator_breadcrumbs: breadcrumbs_tx,
                reporting: reporting_tx,
            },
        );
        Harness {
            processor,
            available,
            triggers,
            breadcrumbs,
            _reporting: reporting,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<BufferId>>) -> Vec<BufferId> {
        let mut out = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            out.extend(batch);
        }
        out.sort_unstable();
        out
    }

    #[test]
    fn test_capacities_derive_from_pool_size() {
        let h = harness(100);
        assert_eq!(h.processor.cache_capacity(), 80);
        assert_eq!(h.processor.triggered_capacity(), 40);
    }

    #[test]
    fn test_trace_zero_buffers_recycled_immediately() {
        let mut h = harness(100);
        let batch = HashMap::from([(0, vec![1, 2]), (7, vec![3])]);

        h.processor.process_completed_buffers(batch).unwrap();

        assert_eq!(drain(&mut h.available), vec![1, 2]);
        assert_eq!(h.processor.trigger_manager().data_manager().buffer_count(), 1);
        assert_eq!(h.processor.metrics().complete_buffers, 3);
        assert_eq!(h.processor.metrics().complete_batches, 1);
    }

    #[test]
    fn test_eviction_starts_at_cache_capacity() {
        let mut h = harness(10);
        for trace_id in 1..=8 {
            let batch = HashMap::from([(trace_id, vec![trace_id as BufferId])]);
            h.processor.process_completed_buffers(batch).unwrap();
        }
        assert!(drain(&mut h.available).is_empty());

        let batch = HashMap::from([(9, vec![9])]);
        h.processor.process_completed_buffers(batch).unwrap();

        assert_eq!(drain(&mut h.available), vec![1]);
        assert_eq!(h.processor.trigger_manager().data_manager().buffer_count(), 8);
    }

    #[test]
    fn test_local_trigger_forwarded_with_breadcrumbs() {
        let mut h = harness(100);
        h.processor
            .process_breadcrumbs(HashMap::from([(5, vec!["peer:1".to_string()])]))
            .unwrap();
        assert!(h.breadcrumbs.try_recv().is_err());

        let trigger = LocalTrigger {
            queue_id: 1,
            base_trace_id: 5,
            trace_id: 5,
        };
        h.processor.process_triggers(vec![trigger]).unwrap();

        assert_eq!(h.triggers.try_recv().unwrap(), vec![trigger]);
        assert_eq!(
            h.breadcrumbs.try_recv().unwrap(),
            HashMap::from([(5, vec!["peer:1".to_string()])])
        );
    }

    #[test]
    fn test_full_coordinator_channel_counts_drops() {
        let mut h = harness(100);
        let trigger = |id| LocalTrigger {
            queue_id: 1,
            base_trace_id: id,
            trace_id: id,
        };

        h.processor.process_triggers(vec![trigger(1)]).unwrap();
        h.processor
            .process_triggers(vec![trigger(2), trigger(3)])
            .unwrap();

        assert_eq!(h.processor.metrics().dropped_triggers, 2);
    }

    #[test]
    fn test_remote_trigger_not_forwarded_to_coordinator() {
        let mut h = harness(100);
        let trigger = LocalTrigger {
            queue_id: 2,
            base_trace_id: 9,
            trace_id: 9,
        };
        h.processor.process_remote_triggers(vec![trigger]).unwrap();

        assert!(h.triggers.try_recv().is_err());
        let dm = h.processor.trigger_manager().data_manager();
        assert!(dm.trace(9).is_some_and(|t| t.is_triggered()));
    }

    #[test]
    fn test_breadcrumbs_for_trace_zero_ignored() {
        let mut h = harness(100);
        h.processor
            .process_breadcrumbs(HashMap::from([(0, vec!["peer:1".to_string()])]))
            .unwrap();
        assert_eq!(h.processor.trigger_manager().data_manager().trace_count(), 0);
    }
}
