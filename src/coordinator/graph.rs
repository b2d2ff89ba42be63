//! Knowledge graph of which agents know which traces and triggers.
//!
//! The coordinator holds no trace data. It tracks, per trace, the agents
//! that hold breadcrumbs for it, and per trigger, the agents that already
//! know the trigger. From these it computes the minimal set of agents a new
//! trigger or breadcrumb must be forwarded to.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::util::lru::Lru;
use crate::{QueueId, TraceId, TriggerId};

/// A trigger as forwarded to agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub id: TriggerId,
    pub trace_ids: Vec<TraceId>,
}

/// Emitted when a trigger expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedTrigger {
    pub queue_id: QueueId,
    /// Number of agents the trigger reached.
    pub total_agents: usize,
    /// Time between creation and last update.
    pub dissemination_time: Duration,
}

#[derive(Debug)]
struct TraceNode {
    known_at: HashSet<String>,
    triggers: HashSet<TriggerId>,
    last_modified: Instant,
    last_breadcrumb: Option<Instant>,
}

#[derive(Debug)]
struct TriggerNode {
    known_at: HashSet<String>,
    traces: HashSet<TraceId>,
    created: Instant,
    last_modified: Instant,
    last_breadcrumb: Option<Instant>,
}

impl TriggerNode {
    fn to_trigger(&self, id: TriggerId) -> Trigger {
        let mut trace_ids: Vec<TraceId> = self.traces.iter().copied().collect();
        trace_ids.sort_unstable();
        Trigger { id, trace_ids }
    }
}

#[derive(Debug)]
pub struct Coordinator {
    now: Instant,
    traces: HashMap<TraceId, TraceNode>,
    triggers: HashMap<TriggerId, TriggerNode>,
    trace_lru: Lru<TraceId>,
    trigger_lru: Lru<TriggerId>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            traces: HashMap::new(),
            triggers: HashMap::new(),
            trace_lru: Lru::new(),
            trigger_lru: Lru::new(),
        }
    }

    /// Timestamp applied to subsequent modifications.
    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    /// Agents known to hold the trigger, sorted.
    pub fn trigger_known_at(&self, id: TriggerId) -> Vec<String> {
        sorted(self.triggers.get(&id).map(|t| &t.known_at))
    }

    /// Agents known to hold breadcrumbs of the trace, sorted.
    pub fn trace_known_at(&self, id: TraceId) -> Vec<String> {
        sorted(self.traces.get(&id).map(|t| &t.known_at))
    }

    pub fn last_breadcrumb(&self, id: TraceId) -> Option<Instant> {
        self.traces.get(&id).and_then(|t| t.last_breadcrumb)
    }

    fn touch_trigger(&mut self, id: TriggerId) -> &mut TriggerNode {
        let now = self.now;
        self.trigger_lru.touch(id);
        let node = self.triggers.entry(id).or_insert_with(|| TriggerNode {
            known_at: HashSet::new(),
            traces: HashSet::new(),
            created: now,
            last_modified: now,
            last_breadcrumb: None,
        });
        node.last_modified = now;
        node
    }

    fn touch_trace(&mut self, id: TraceId) -> &mut TraceNode {
        let now = self.now;
        self.trace_lru.touch(id);
        let node = self.traces.entry(id).or_insert_with(|| TraceNode {
            known_at: HashSet::new(),
            triggers: HashSet::new(),
            last_modified: now,
            last_breadcrumb: None,
        });
        node.last_modified = now;
        node
    }

    /// Records a trigger reported by `src`. When the trigger gained traces,
    /// returns every other agent that must receive the updated trigger.
    pub fn add_trigger(&mut self, src: &str, trigger: &Trigger) -> Vec<String> {
        let id = trigger.id;
        self.touch_trigger(id).known_at.insert(src.to_string());

        let mut needs_rebroadcast = false;
        for &trace_id in &trigger.trace_ids {
            let already_linked = self
                .triggers
                .get(&id)
                .is_some_and(|t| t.traces.contains(&trace_id));
            if already_linked {
                continue;
            }
            needs_rebroadcast = true;

            let trace = self.touch_trace(trace_id);
            trace.triggers.insert(id);
            let trace_known_at: Vec<String> = trace.known_at.iter().cloned().collect();
            trace.known_at.insert(src.to_string());

            if let Some(node) = self.triggers.get_mut(&id) {
                node.traces.insert(trace_id);
                node.known_at.extend(trace_known_at);
            }
        }

        if !needs_rebroadcast {
            return Vec::new();
        }
        let mut send_to: Vec<String> = self
            .triggers
            .get(&id)
            .map(|t| t.known_at.iter().filter(|a| *a != src).cloned().collect())
            .unwrap_or_default();
        send_to.sort();
        send_to
    }

    /// Records that `src` sent data of `trace_id` to `addrs`. Returns, per
    /// agent, the triggers it must now receive.
    pub fn add_breadcrumb(
        &mut self,
        src: &str,
        trace_id: TraceId,
        addrs: &[String],
    ) -> HashMap<String, Vec<Trigger>> {
        let now = self.now;
        let trace = self.touch_trace(trace_id);
        let attached: Vec<TriggerId> = trace.triggers.iter().copied().collect();
        let new_addrs: Vec<String> = addrs
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(src))
            .filter(|addr| !trace.known_at.contains(*addr))
            .map(str::to_string)
            .collect();

        let mut to_disseminate: HashMap<String, Vec<Trigger>> = HashMap::new();
        for addr in new_addrs {
            // Duplicates within `addrs` are skipped once known.
            if !self.traces.get_mut(&trace_id).is_some_and(|t| {
                let fresh = t.known_at.insert(addr.clone());
                if fresh {
                    t.last_breadcrumb = Some(now);
                }
                fresh
            }) {
                continue;
            }

            let mut pending = Vec::new();
            for &tid in &attached {
                if let Some(node) = self.triggers.get_mut(&tid) {
                    if node.known_at.insert(addr.clone()) {
                        node.last_breadcrumb = Some(now);
                        pending.push(node.to_trigger(tid));
                    }
                }
            }
            if !pending.is_empty() {
                pending.sort_by_key(|t| t.id);
                to_disseminate.insert(addr, pending);
            }
        }

        for tid in attached {
            if self.triggers.contains_key(&tid) {
                self.touch_trigger(tid);
            }
        }
        to_disseminate
    }

    /// Forgets traces last modified at or before `cutoff`.
    pub fn check_trace_expiration(&mut self, cutoff: Instant) -> usize {
        let mut expired = 0;
        while let Some(trace_id) = self.trace_lru.back() {
            let Some(trace) = self.traces.get(&trace_id) else {
                self.trace_lru.remove(&trace_id);
                continue;
            };
            if trace.last_modified > cutoff {
                break;
            }
            if let Some(trace) = self.traces.remove(&trace_id) {
                for tid in trace.triggers {
                    if let Some(node) = self.triggers.get_mut(&tid) {
                        node.traces.remove(&trace_id);
                    }
                }
            }
            self.trace_lru.remove(&trace_id);
            expired += 1;
        }
        expired
    }

    /// Forgets triggers last modified at or before `cutoff`.
    pub fn check_trigger_expiration(&mut self, cutoff: Instant) -> Vec<FinishedTrigger> {
        let mut finished = Vec::new();
        while let Some(tid) = self.trigger_lru.back() {
            let Some(node) = self.triggers.get(&tid) else {
                self.trigger_lru.remove(&tid);
                continue;
            };
            if node.last_modified > cutoff {
                break;
            }
            if let Some(node) = self.triggers.remove(&tid) {
                for trace_id in &node.traces {
                    if let Some(trace) = self.traces.get_mut(trace_id) {
                        trace.triggers.remove(&tid);
                    }
                }
                finished.push(FinishedTrigger {
                    queue_id: tid.queue_id,
                    total_agents: node.known_at.len(),
                    dissemination_time: node.last_modified.saturating_duration_since(node.created),
                });
            }
            self.trigger_lru.remove(&tid);
        }
        finished
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut out: Vec<String> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    out.sort();
    out
}
