//! Boundaries between the agent core and the outside world: the buffer
//! transport feeding completed buffers in, and the wire formats used to talk
//! to the coordinator and the collector.

pub mod frame;
pub mod memory;
pub mod rpc;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{BufferId, QueueId, TraceId};

/// Completed buffers keyed by trace.
pub type CompleteBatch = HashMap<TraceId, Vec<BufferId>>;

/// Breadcrumb addresses keyed by trace.
pub type BreadcrumbBatch = HashMap<TraceId, Vec<String>>;

/// A trigger fired by local instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrigger {
    pub queue_id: QueueId,
    pub base_trace_id: TraceId,
    pub trace_id: TraceId,
}

/// Read access to buffer contents by id.
pub trait BufferStore: Send + Sync {
    /// Number of buffers in the pool.
    fn capacity(&self) -> usize;

    /// Size in bytes of every buffer.
    fn buffer_size(&self) -> usize;

    /// Copy of a buffer's contents, or `None` for an unknown id.
    fn read(&self, id: BufferId) -> Option<Vec<u8>>;
}

/// The four batch channels between the buffer transport and the agent.
#[derive(Debug)]
pub struct AgentChannels {
    pub complete: mpsc::Receiver<CompleteBatch>,
    pub breadcrumbs: mpsc::Receiver<BreadcrumbBatch>,
    pub triggers: mpsc::Receiver<Vec<LocalTrigger>>,
    /// Buffers released back to the producer.
    pub available: mpsc::UnboundedSender<Vec<BufferId>>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransportError {
    #[error("payload of {len} bytes exceeds buffer size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("buffer {0} is outside the pool")]
    UnknownBuffer(BufferId),

    #[error("agent channel is full")]
    Full,

    #[error("agent channel is closed")]
    Closed,
}

impl<T> From<mpsc::error::TrySendError<T>> for TransportError {
    fn from(e: mpsc::error::TrySendError<T>) -> Self {
        match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        }
    }
}
