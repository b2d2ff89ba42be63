use thiserror::Error;

use crate::{QueueId, TraceId};

use super::fired_trigger::TriggerId;

/// Broken bookkeeping in the trace/trigger graph.
///
/// None of these are reachable from valid input; the agent loop treats every
/// variant as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("trace {0} is not in the trace table")]
    UnknownTrace(TraceId),

    #[error("queue {0} does not exist")]
    UnknownQueue(QueueId),

    #[error("fired trigger {0} does not exist")]
    UnknownTrigger(TriggerId),

    #[error("cannot remove trigger {trigger} from untriggered trace {trace_id}")]
    RemoveFromUntriggered { trace_id: TraceId, trigger: TriggerId },

    #[error("trigger {trigger} is not attached to trace {trace_id}")]
    TriggerNotAttached { trace_id: TraceId, trigger: TriggerId },

    #[error("{op} is not valid for idle trigger {trigger}")]
    TriggerIdle { trigger: TriggerId, op: &'static str },

    #[error("trigger {trigger} still holds {remaining} buffers after {op}")]
    BuffersRemain {
        trigger: TriggerId,
        remaining: usize,
        op: &'static str,
    },

    #[error("idle trigger {trigger} released {count} pending buffers on timeout")]
    IdleTriggerHadBuffers { trigger: TriggerId, count: usize },
}
