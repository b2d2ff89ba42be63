//! Retroactive tracing: an agent that buffers trace fragments until a trigger
//! asks for them, a coordinator that spreads triggers between agents, and a
//! collector that persists reported fragments.

pub mod agent;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod export;
pub mod transport;
pub mod util;

use std::fmt;

use serde::{Deserialize, Serialize};

/// 64-bit trace identifier. Zero is reserved for "no trace".
pub type TraceId = u64;

/// Opaque handle to a buffer owned by the buffer transport.
pub type BufferId = u32;

/// Trigger class identifier.
pub type QueueId = i32;

/// Identity of one firing of a trigger class: the class and the trace that
/// fired it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerId {
    pub queue_id: QueueId,
    pub base_trace_id: TraceId,
}

impl TriggerId {
    pub fn new(queue_id: QueueId, base_trace_id: TraceId) -> Self {
        Self {
            queue_id,
            base_trace_id,
        }
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue_id, self.base_trace_id)
    }
}
