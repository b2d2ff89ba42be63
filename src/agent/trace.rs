//! Per-trace lifecycle.
//!
//! ```text
//!   Untriggered --add_trigger--> Triggered | Reporting
//!   Triggered   --add_buffers--> Reporting
//!   Reporting   --take_buffers-> Triggered
//!   Triggered/Reporting --remove_trigger(last)--> deleted
//!   Untriggered --take_buffers (evict)--> deleted
//! ```
//!
//! Every transition consumes the current state and returns the next one
//! (`None` when the trace is deleted) together with its output.

use std::collections::HashSet;
use std::time::Instant;

use crate::{BufferId, TraceId};

use super::data_manager::{TriggeredData, UntriggeredData};
use super::error::StateError;
use super::fired_trigger::TriggerId;

/// Next state (or deletion) plus the transition's output.
pub(super) type Step<T> = Result<(Option<TraceState>, T), StateError>;

/// Counters and structures a trace transition may touch.
pub(super) struct Ledger<'a> {
    pub now: Instant,
    pub untriggered: &'a mut UntriggeredData,
    pub triggered: &'a mut TriggeredData,
}

#[derive(Debug)]
pub enum TraceState {
    Untriggered(UntriggeredTrace),
    Triggered(TriggeredTrace),
    Reporting(ReportingTrace),
}

/// Accumulates data until triggered or evicted. Lives in the untriggered LRU.
#[derive(Debug)]
pub struct UntriggeredTrace {
    buffers: Vec<BufferId>,
    breadcrumbs: Vec<String>,
    last_modified: Instant,
}

/// Member of at least one fired trigger with nothing pending.
#[derive(Debug)]
pub struct TriggeredTrace {
    triggers: HashSet<TriggerId>,
}

/// Member of at least one fired trigger with buffers awaiting report.
#[derive(Debug)]
pub struct ReportingTrace {
    buffers: Vec<BufferId>,
    triggers: HashSet<TriggerId>,
}

impl TraceState {
    /// First sighting of a trace.
    pub(super) fn create(id: TraceId, ledger: &mut Ledger<'_>) -> Self {
        ledger.untriggered.lru.touch(id);
        ledger.untriggered.trace_count += 1;
        TraceState::Untriggered(UntriggeredTrace {
            buffers: Vec::new(),
            breadcrumbs: Vec::new(),
            last_modified: ledger.now,
        })
    }

    pub fn is_triggered(&self) -> bool {
        !matches!(self, TraceState::Untriggered(_))
    }

    /// Buffers held by this trace, pending or untriggered.
    pub fn buffer_count(&self) -> usize {
        match self {
            TraceState::Untriggered(t) => t.buffers.len(),
            TraceState::Triggered(_) => 0,
            TraceState::Reporting(t) => t.buffers.len(),
        }
    }

    pub(super) fn add_buffers(
        self,
        id: TraceId,
        buffers: Vec<BufferId>,
        ledger: &mut Ledger<'_>,
    ) -> Step<()> {
        let n = buffers.len();
        match self {
            TraceState::Untriggered(mut t) => {
                t.buffers.extend(buffers);
                t.last_modified = ledger.now;
                ledger.untriggered.lru.touch(id);
                ledger.untriggered.buffer_count += n;
                Ok((Some(TraceState::Untriggered(t)), ()))
            }
            TraceState::Triggered(t) if n == 0 => Ok((Some(TraceState::Triggered(t)), ())),
            TraceState::Triggered(t) => {
                ledger.triggered.buffer_count += n;
                for &trigger in &t.triggers {
                    ledger.triggered.buffers_added(trigger, n)?;
                }
                let next = ReportingTrace {
                    buffers,
                    triggers: t.triggers,
                };
                Ok((Some(TraceState::Reporting(next)), ()))
            }
            TraceState::Reporting(mut t) => {
                ledger.triggered.buffer_count += n;
                t.buffers.extend(buffers);
                for &trigger in &t.triggers {
                    ledger.triggered.buffers_added(trigger, n)?;
                }
                Ok((Some(TraceState::Reporting(t)), ()))
            }
        }
    }

    /// Returns the breadcrumbs that must be disseminated now.
    pub(super) fn add_breadcrumbs(
        self,
        id: TraceId,
        breadcrumbs: Vec<String>,
        ledger: &mut Ledger<'_>,
    ) -> Step<Vec<String>> {
        match self {
            TraceState::Untriggered(mut t) => {
                t.breadcrumbs.extend(breadcrumbs);
                t.last_modified = ledger.now;
                ledger.untriggered.lru.touch(id);
                Ok((Some(TraceState::Untriggered(t)), Vec::new()))
            }
            triggered => Ok((Some(triggered), breadcrumbs)),
        }
    }

    /// Attaches a fired trigger. Returns breadcrumbs buffered while untriggered.
    pub(super) fn add_trigger(
        self,
        id: TraceId,
        trigger: TriggerId,
        ledger: &mut Ledger<'_>,
    ) -> Step<Vec<String>> {
        match self {
            TraceState::Untriggered(t) => {
                let n = t.buffers.len();
                ledger.untriggered.lru.remove(&id);
                ledger.untriggered.trace_count -= 1;
                ledger.untriggered.buffer_count -= n;
                ledger.triggered.trace_count += 1;
                ledger.triggered.buffer_count += n;
                ledger.triggered.queue_mut(trigger.queue_id)?.trace_count += 1;

                let triggers = HashSet::from([trigger]);
                let next = if n > 0 {
                    ledger.triggered.buffers_added(trigger, n)?;
                    TraceState::Reporting(ReportingTrace {
                        buffers: t.buffers,
                        triggers,
                    })
                } else {
                    TraceState::Triggered(TriggeredTrace { triggers })
                };
                Ok((Some(next), t.breadcrumbs))
            }
            TraceState::Triggered(mut t) => {
                if t.triggers.insert(trigger) {
                    ledger.triggered.queue_mut(trigger.queue_id)?.trace_count += 1;
                }
                Ok((Some(TraceState::Triggered(t)), Vec::new()))
            }
            TraceState::Reporting(mut t) => {
                if t.triggers.insert(trigger) {
                    ledger.triggered.queue_mut(trigger.queue_id)?.trace_count += 1;
                    ledger.triggered.buffers_added(trigger, t.buffers.len())?;
                }
                Ok((Some(TraceState::Reporting(t)), Vec::new()))
            }
        }
    }

    /// Detaches a fired trigger. Returns the trace's buffers when this was
    /// its last trigger and the trace is deleted.
    pub(super) fn remove_trigger(
        self,
        id: TraceId,
        trigger: TriggerId,
        ledger: &mut Ledger<'_>,
    ) -> Step<Vec<BufferId>> {
        match self {
            TraceState::Untriggered(_) => Err(StateError::RemoveFromUntriggered {
                trace_id: id,
                trigger,
            }),
            TraceState::Triggered(mut t) => {
                if !t.triggers.remove(&trigger) {
                    return Err(StateError::TriggerNotAttached { trace_id: id, trigger });
                }
                ledger.triggered.queue_mut(trigger.queue_id)?.trace_count -= 1;
                if t.triggers.is_empty() {
                    ledger.triggered.trace_count -= 1;
                    return Ok((None, Vec::new()));
                }
                Ok((Some(TraceState::Triggered(t)), Vec::new()))
            }
            TraceState::Reporting(mut t) => {
                if !t.triggers.remove(&trigger) {
                    return Err(StateError::TriggerNotAttached { trace_id: id, trigger });
                }
                let n = t.buffers.len();
                ledger.triggered.queue_mut(trigger.queue_id)?.trace_count -= 1;
                ledger.triggered.buffers_removed(trigger, n, ledger.now)?;
                if t.triggers.is_empty() {
                    ledger.triggered.trace_count -= 1;
                    ledger.triggered.buffer_count -= n;
                    return Ok((None, t.buffers));
                }
                Ok((Some(TraceState::Reporting(t)), Vec::new()))
            }
        }
    }

    /// Untriggered: eviction, deletes the trace. Reporting: hands pending
    /// buffers over for report. Triggered: nothing to take.
    pub(super) fn take_buffers(self, id: TraceId, ledger: &mut Ledger<'_>) -> Step<Vec<BufferId>> {
        match self {
            TraceState::Untriggered(t) => {
                ledger.untriggered.trace_count -= 1;
                ledger.untriggered.buffer_count -= t.buffers.len();
                ledger.untriggered.lru.remove(&id);
                ledger.untriggered.event_horizon = Some(t.last_modified);
                Ok((None, t.buffers))
            }
            TraceState::Triggered(t) => Ok((Some(TraceState::Triggered(t)), Vec::new())),
            TraceState::Reporting(t) => {
                let n = t.buffers.len();
                ledger.triggered.buffer_count -= n;
                for &trigger in &t.triggers {
                    ledger.triggered.buffers_removed(trigger, n, ledger.now)?;
                }
                let next = TriggeredTrace {
                    triggers: t.triggers,
                };
                Ok((Some(TraceState::Triggered(next)), t.buffers))
            }
        }
    }
}
