//! Interval telemetry for the agent.
//!
//! Counters accumulate in [`AgentMetrics`] and in each queue's
//! [`TriggerMetrics`]; every stats interval they are snapshotted, reset and
//! turned into rates.

use std::fmt;
use std::time::Duration;

use crate::export::health::HealthMetrics;
use crate::QueueId;

use super::trigger_manager::TriggerManager;
use super::trigger_queue::TriggerMetrics;

const MB: f64 = 1024.0 * 1024.0;

/// Agent-wide counters for the current interval.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgentMetrics {
    pub complete_batches: u64,
    pub complete_buffers: u64,
    /// Age of the most recently evicted untriggered trace.
    pub event_horizon: Duration,
    pub dropped_triggers: u64,
    pub dropped_breadcrumbs: u64,
}

/// Rates for one queue, or the sum over all queues.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueStats {
    pub trigger_count: u64,
    pub eviction_count: u64,
    pub local_trigger_count: u64,
    pub remote_trigger_count: u64,
    pub dropped_count: u64,
    pub buffers: u64,
    pub reported_buffers: u64,
    pub evicted_buffers: u64,
    pub trigger_rate: f64,
    pub reported_buffer_rate: f64,
    pub reported_mb_rate: f64,
    pub evicted_buffer_rate: f64,
    pub evicted_mb_rate: f64,
    pub eviction_percent: f64,
}

fn eviction_percent(reported: f64, evicted: f64) -> f64 {
    if reported + evicted > 0.0 {
        100.0 * evicted / (reported + evicted)
    } else {
        0.0
    }
}

impl QueueStats {
    pub fn from_metrics(metrics: &TriggerMetrics, interval: Duration, buffer_size: usize) -> Self {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        let reported_buffer_rate = metrics.reported_buffers as f64 / secs;
        let evicted_buffer_rate = metrics.evicted_buffers as f64 / secs;
        Self {
            trigger_count: metrics.count,
            eviction_count: metrics.evicted,
            local_trigger_count: metrics.local,
            remote_trigger_count: metrics.remote,
            dropped_count: metrics.dropped,
            buffers: metrics.buffers,
            reported_buffers: metrics.reported_buffers,
            evicted_buffers: metrics.evicted_buffers,
            trigger_rate: metrics.count as f64 / secs,
            reported_buffer_rate,
            reported_mb_rate: reported_buffer_rate * buffer_size as f64 / MB,
            evicted_buffer_rate,
            evicted_mb_rate: evicted_buffer_rate * buffer_size as f64 / MB,
            eviction_percent: eviction_percent(reported_buffer_rate, evicted_buffer_rate),
        }
    }

    pub fn add(&mut self, other: &QueueStats) {
        self.trigger_count += other.trigger_count;
        self.eviction_count += other.eviction_count;
        self.local_trigger_count += other.local_trigger_count;
        self.remote_trigger_count += other.remote_trigger_count;
        self.dropped_count += other.dropped_count;
        self.buffers += other.buffers;
        self.reported_buffers += other.reported_buffers;
        self.evicted_buffers += other.evicted_buffers;
        self.trigger_rate += other.trigger_rate;
        self.reported_buffer_rate += other.reported_buffer_rate;
        self.reported_mb_rate += other.reported_mb_rate;
        self.evicted_buffer_rate += other.evicted_buffer_rate;
        self.evicted_mb_rate += other.evicted_mb_rate;
        self.eviction_percent =
            eviction_percent(self.reported_buffer_rate, self.evicted_buffer_rate);
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} trigs/s {:.1} MB/s ({:.0} bufs/s, {} total) {:.0}% loss ({:.1} MB/s)",
            self.trigger_rate,
            self.reported_mb_rate,
            self.reported_buffer_rate,
            self.reported_buffers,
            self.eviction_percent,
            self.evicted_mb_rate,
        )
    }
}

/// One telemetry snapshot.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Stats {
    pub complete_batches: u64,
    pub complete_buffers: u64,
    pub buffer_rate: f64,
    pub buffer_mb_rate: f64,
    pub mean_batch_size: f64,
    pub event_horizon: Duration,
    pub dropped_triggers: u64,
    pub dropped_breadcrumbs: u64,
    pub totals: QueueStats,
    /// Sorted by queue id.
    pub queues: Vec<(QueueId, QueueStats)>,
}

impl Stats {
    /// Computes a snapshot and resets every counter it read.
    pub fn collect(metrics: &mut AgentMetrics, tm: &mut TriggerManager, interval: Duration) -> Self {
        let metrics = std::mem::take(metrics);
        let buffer_size = tm.buffer_size();
        let secs = interval.as_secs_f64().max(f64::EPSILON);

        let buffer_rate = metrics.complete_buffers as f64 / secs;
        let mean_batch_size = if metrics.complete_batches > 0 {
            metrics.complete_buffers as f64 / metrics.complete_batches as f64
        } else {
            0.0
        };

        let dm = tm.data_manager_mut();
        let mut totals = QueueStats::default();
        let mut queues = Vec::new();
        for queue_id in dm.queue_ids() {
            let Some(queue) = dm.queue_state_mut(queue_id) else {
                continue;
            };
            let stats = QueueStats::from_metrics(&queue.take_metrics(), interval, buffer_size);
            totals.add(&stats);
            queues.push((queue_id, stats));
        }

        Self {
            complete_batches: metrics.complete_batches,
            complete_buffers: metrics.complete_buffers,
            buffer_rate,
            buffer_mb_rate: buffer_rate * buffer_size as f64 / MB,
            mean_batch_size,
            event_horizon: metrics.event_horizon,
            dropped_triggers: metrics.dropped_triggers,
            dropped_breadcrumbs: metrics.dropped_breadcrumbs,
            totals,
            queues,
        }
    }

    /// Moves the snapshot into the Prometheus registry.
    pub fn publish(&self, health: &HealthMetrics) {
        health.mean_batch_size.set(self.mean_batch_size);
        health
            .triggers_dropped
            .with_label_values(&["rate_limit"])
            .inc_by(self.totals.dropped_count as f64);
        health
            .event_horizon_seconds
            .set(self.event_horizon.as_secs_f64());

        for (queue_id, stats) in &self.queues {
            let label = queue_id.to_string();
            health
                .queue_eviction_percent
                .with_label_values(&[&label])
                .set(stats.eviction_percent);
            health
                .queue_reported_rate
                .with_label_values(&[&label])
                .set(stats.reported_buffer_rate);
            health
                .queue_evicted_rate
                .with_label_values(&[&label])
                .set(stats.evicted_buffer_rate);
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "EH: {} ms {:.3} MB/s ({:.0} bufs/s, {} bufs total), Avg batch {:.1}, Drops {},{}",
            self.event_horizon.as_millis(),
            self.buffer_mb_rate,
            self.buffer_rate,
            self.complete_buffers,
            self.mean_batch_size,
            self.dropped_triggers,
            self.dropped_breadcrumbs,
        )?;
        write!(f, "  -- Triggers {}", self.totals)?;
        for (queue_id, stats) in &self.queues {
            write!(f, "\n            {queue_id} - {stats}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats_eviction_percent() {
        let metrics = TriggerMetrics {
            count: 10,
            reported_buffers: 30,
            evicted_buffers: 10,
            ..Default::default()
        };
        let stats = QueueStats::from_metrics(&metrics, Duration::from_secs(2), 1024 * 1024);

        assert_eq!(stats.trigger_rate, 5.0);
        assert_eq!(stats.reported_buffer_rate, 15.0);
        assert_eq!(stats.reported_mb_rate, 15.0);
        assert_eq!(stats.eviction_percent, 25.0);
    }

    #[test]
    fn test_queue_stats_without_traffic() {
        let stats = QueueStats::from_metrics(
            &TriggerMetrics::default(),
            Duration::from_secs(1),
            4096,
        );
        assert_eq!(stats.eviction_percent, 0.0);
    }

    #[test]
    fn test_totals_recompute_eviction_percent() {
        let a = QueueStats::from_metrics(
            &TriggerMetrics {
                reported_buffers: 10,
                ..Default::default()
            },
            Duration::from_secs(1),
            1,
        );
        let b = QueueStats::from_metrics(
            &TriggerMetrics {
                evicted_buffers: 10,
                ..Default::default()
            },
            Duration::from_secs(1),
            1,
        );
        let mut totals = QueueStats::default();
        totals.add(&a);
        totals.add(&b);

        assert_eq!(totals.eviction_percent, 50.0);
        assert_eq!(totals.evicted_buffers, 10);
    }
}
