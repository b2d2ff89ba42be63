//! Ships reported buffers to the collector over TCP.
//!
//! A connection starts with one handshake frame carrying the agent's
//! address; every buffer then travels as one frame.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::export::health::HealthMetrics;
use crate::transport::frame::write_frame;
use crate::transport::BufferStore;
use crate::util::token_bucket::TokenBucket;
use crate::BufferId;

use super::coordinator_link::{backoff, Outage};

const MB: f64 = 1024.0 * 1024.0;

pub struct ReportingSender {
    /// Collector address; empty disables reporting.
    collector_addr: String,
    agent_addr: String,
    store: Arc<dyn BufferStore>,
    available: mpsc::UnboundedSender<Vec<BufferId>>,
    limiter: Option<TokenBucket>,
    health: Arc<HealthMetrics>,
}

impl ReportingSender {
    /// `rate_limit_mb` bounds the bytes sent per second; zero is unlimited.
    pub fn new(
        collector_addr: String,
        agent_addr: String,
        store: Arc<dyn BufferStore>,
        available: mpsc::UnboundedSender<Vec<BufferId>>,
        rate_limit_mb: f64,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let limiter = (rate_limit_mb > 0.0)
            .then(|| TokenBucket::new(rate_limit_mb * MB, std::time::Instant::now()));
        Self {
            collector_addr,
            agent_addr,
            store,
            available,
            limiter,
            health,
        }
    }

    fn recycle(&self, buffers: Vec<BufferId>) {
        if !buffers.is_empty() && self.available.send(buffers).is_err() {
            debug!("buffer producer gone, dropping reported buffers");
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<BufferId>>, cancel: CancellationToken) {
        if self.collector_addr.is_empty() {
            info!("reporting disabled, recycling triggered data");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    batch = rx.recv() => match batch {
                        Some(batch) => self.recycle(batch),
                        None => return,
                    },
                }
            }
        }

        info!(collector = %self.collector_addr, "reporting triggered trace data");
        let mut outage = Outage::new("trace data");
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                conn = TcpStream::connect(self.collector_addr.as_str()) => {
                    match conn.with_context(|| format!("connecting to {}", self.collector_addr)) {
                        Ok(stream) => self.stream_batches(stream, &mut rx, &mut outage, &cancel).await,
                        Err(e) => Err(e),
                    }
                }
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    self.health.reporting_errors.inc();
                    outage.failed(&self.collector_addr, &e);
                    if !backoff(&cancel).await {
                        break;
                    }
                }
            }
        }
        info!("stopped reporting triggered trace data");
    }

    /// Sends batches on one connection until cancelled or the connection
    /// fails.
    async fn stream_batches(
        &mut self,
        stream: TcpStream,
        rx: &mut mpsc::Receiver<Vec<BufferId>>,
        outage: &mut Outage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut writer = BufWriter::new(stream);
        write_frame(&mut writer, self.agent_addr.as_bytes())
            .await
            .context("writing handshake")?;
        writer.flush().await.context("writing handshake")?;
        outage.succeeded(&self.collector_addr);

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => return Ok(()),
                },
            };
            self.report(&mut writer, batch).await?;
        }
    }

    /// Writes one batch. The buffers are recycled whether or not the write
    /// succeeded.
    pub async fn report<W>(&mut self, writer: &mut W, buffers: Vec<BufferId>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(limiter) = self.limiter.as_mut() {
            limiter
                .wait((buffers.len() * self.store.buffer_size()) as f64)
                .await;
        }

        let result = self.write_buffers(writer, &buffers).await;
        self.recycle(buffers);
        result
    }

    async fn write_buffers<W>(&self, writer: &mut W, buffers: &[BufferId]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for &id in buffers {
            let payload = self
                .store
                .read(id)
                .with_context(|| format!("buffer {id} is not in the pool"))?;
            write_frame(writer, &payload)
                .await
                .context("writing trace data")?;
        }
        writer.flush().await.context("writing trace data")?;
        Ok(())
    }
}
