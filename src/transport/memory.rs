//! In-process buffer pool.
//!
//! Stands in for a shared-memory transport: producers acquire free buffer
//! ids, write payloads, and hand completed batches to the agent; the agent
//! releases ids back through the available channel once reported or evicted.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{BufferId, QueueId, TraceId};

use super::{
    AgentChannels, BreadcrumbBatch, BufferStore, CompleteBatch, LocalTrigger, TransportError,
};

/// Fixed set of equally sized buffers.
#[derive(Debug)]
pub struct MemoryBufferPool {
    buffer_size: usize,
    slots: Vec<RwLock<Vec<u8>>>,
}

impl MemoryBufferPool {
    /// Creates a pool of `capacity` buffers and the channels that connect a
    /// producer to an agent. `channel_size` bounds each batch channel.
    pub fn new(
        capacity: usize,
        buffer_size: usize,
        channel_size: usize,
    ) -> (Arc<Self>, AgentChannels, Producer) {
        let pool = Arc::new(Self {
            buffer_size,
            slots: (0..capacity).map(|_| RwLock::new(Vec::new())).collect(),
        });

        let channel_size = channel_size.max(1);
        let (complete_tx, complete_rx) = mpsc::channel(channel_size);
        let (breadcrumbs_tx, breadcrumbs_rx) = mpsc::channel(channel_size);
        let (triggers_tx, triggers_rx) = mpsc::channel(channel_size);
        let (available_tx, available_rx) = mpsc::unbounded_channel();

        let channels = AgentChannels {
            complete: complete_rx,
            breadcrumbs: breadcrumbs_rx,
            triggers: triggers_rx,
            available: available_tx,
        };

        let producer = Producer {
            pool: Arc::clone(&pool),
            free: (0..capacity as BufferId).rev().collect(),
            available: available_rx,
            complete: complete_tx,
            breadcrumbs: breadcrumbs_tx,
            triggers: triggers_tx,
        };

        (pool, channels, producer)
    }

    fn slot(&self, id: BufferId) -> Result<&RwLock<Vec<u8>>, TransportError> {
        self.slots
            .get(id as usize)
            .ok_or(TransportError::UnknownBuffer(id))
    }
}

impl BufferStore for MemoryBufferPool {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn read(&self, id: BufferId) -> Option<Vec<u8>> {
        self.slots.get(id as usize).map(|slot| slot.read().clone())
    }
}

/// Writer side of the pool, used by instrumentation.
#[derive(Debug)]
pub struct Producer {
    pool: Arc<MemoryBufferPool>,
    free: Vec<BufferId>,
    available: mpsc::UnboundedReceiver<Vec<BufferId>>,
    complete: mpsc::Sender<CompleteBatch>,
    breadcrumbs: mpsc::Sender<BreadcrumbBatch>,
    triggers: mpsc::Sender<Vec<LocalTrigger>>,
}

impl Producer {
    /// Takes a free buffer, collecting any the agent has released.
    /// Returns `None` when the pool is exhausted.
    pub fn acquire(&mut self) -> Option<BufferId> {
        while let Ok(released) = self.available.try_recv() {
            self.free.extend(released);
        }
        self.free.pop()
    }

    /// Number of buffers known free, including ones released but not yet
    /// collected.
    pub fn free_count(&mut self) -> usize {
        while let Ok(released) = self.available.try_recv() {
            self.free.extend(released);
        }
        self.free.len()
    }

    pub fn write(&self, id: BufferId, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > self.pool.buffer_size {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: self.pool.buffer_size,
            });
        }
        let mut slot = self.pool.slot(id)?.write();
        slot.clear();
        slot.extend_from_slice(payload);
        Ok(())
    }

    /// Acquires a buffer and fills it. `Ok(None)` when the pool is exhausted.
    pub fn record(&mut self, payload: &[u8]) -> Result<Option<BufferId>, TransportError> {
        let Some(id) = self.acquire() else {
            return Ok(None);
        };
        if let Err(e) = self.write(id, payload) {
            self.free.push(id);
            return Err(e);
        }
        Ok(Some(id))
    }

    pub fn complete(&self, batch: CompleteBatch) -> Result<(), TransportError> {
        Ok(self.complete.try_send(batch)?)
    }

    pub fn breadcrumbs(&self, batch: BreadcrumbBatch) -> Result<(), TransportError> {
        Ok(self.breadcrumbs.try_send(batch)?)
    }

    pub fn trigger(&self, triggers: Vec<LocalTrigger>) -> Result<(), TransportError> {
        Ok(self.triggers.try_send(triggers)?)
    }

    /// Fires a trigger for a single trace.
    pub fn trigger_one(
        &self,
        queue_id: QueueId,
        base_trace_id: TraceId,
        trace_id: TraceId,
    ) -> Result<(), TransportError> {
        self.trigger(vec![LocalTrigger {
            queue_id,
            base_trace_id,
            trace_id,
        }])
    }
}
