//! Trace data collector: receives reported buffers from agents over TCP and
//! appends them to an output file.
//!
//! Each received buffer is written as two frames, the source agent's address
//! and the payload, so the file can be replayed with
//! [`read_frame`](crate::transport::frame::read_frame).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{bind_addr, Config};
use crate::export::health::HealthMetrics;
use crate::transport::frame::{read_frame, write_frame};

/// Depth of the channel between connections and the writer.
pub const INCOMING_CHANNEL_SIZE: usize = 1000;

const THROUGHPUT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBuffer {
    pub source: Arc<str>,
    pub payload: Vec<u8>,
}

pub struct Collector {
    cfg: Config,
    health: Arc<HealthMetrics>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            local_addr: None,
            acceptor: None,
            writer: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let bind = bind_addr(&format!(":{}", self.cfg.collector.port));
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, "collector listening");

        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);
        self.writer = Some(tokio::spawn(run_writer(self.cfg.collector.output.clone(), rx)));
        self.acceptor = Some(tokio::spawn(accept_loop(
            listener,
            tx,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        )));

        Ok(())
    }

    /// Stops accepting, then waits for the writer to flush everything
    /// already received.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(acceptor) = self.acceptor.take() {
            acceptor.await.context("collector acceptor panicked")?;
        }
        if let Some(writer) = self.writer.take() {
            writer.await.context("collector writer panicked")??;
        }

        self.health.stop().await?;

        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<ReceivedBuffer>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted agent connection");
                    connections.push(tokio::spawn(handle_connection(
                        stream,
                        tx.clone(),
                        Arc::clone(&health),
                        cancel.clone(),
                    )));
                }
                Err(e) => {
                    error!(error = %e, "accepting connection");
                    break;
                }
            },
        }
    }

    drop(tx);
    for connection in connections {
        let _ = connection.await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    tx: mpsc::Sender<ReceivedBuffer>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    health.collector_connections.inc();
    if let Err(e) = receive_buffers(stream, &tx, &health, &cancel).await {
        warn!(error = %format!("{e:#}"), "agent connection closed");
    }
    health.collector_connections.dec();
}

async fn receive_buffers(
    stream: TcpStream,
    tx: &mpsc::Sender<ReceivedBuffer>,
    health: &HealthMetrics,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let handshake = read_frame(&mut reader)
        .await
        .context("receiving handshake")?
        .context("connection closed before handshake")?;
    let source: Arc<str> = String::from_utf8_lossy(&handshake).into();
    info!(agent = %source, "new agent connection");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut reader) => frame.context("receiving buffer")?,
        };
        let Some(payload) = frame else {
            info!(agent = %source, "agent disconnected");
            return Ok(());
        };

        health.collector_buffers.inc();
        health.collector_bytes.inc_by(payload.len() as f64);
        let received = ReceivedBuffer {
            source: Arc::clone(&source),
            payload,
        };
        if tx.send(received).await.is_err() {
            return Ok(());
        }
    }
}

/// Drains received buffers into `output` (or just counts them) until every
/// connection is gone, logging throughput once a second.
pub async fn run_writer(
    output: Option<PathBuf>,
    mut rx: mpsc::Receiver<ReceivedBuffer>,
) -> Result<()> {
    let mut file = match &output {
        Some(path) => {
            info!(path = %path.display(), "writing trace data");
            let file = File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => {
            info!("not writing trace data to disk");
            None
        }
    };

    let mut ticker = tokio::time::interval(THROUGHPUT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut bytes = 0usize;
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(received) = received else { break };
                bytes += received.payload.len();
                if let Some(file) = file.as_mut() {
                    write_frame(file, received.source.as_bytes())
                        .await
                        .context("writing trace data")?;
                    write_frame(file, &received.payload)
                        .await
                        .context("writing trace data")?;
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let secs = now.duration_since(last_report).as_secs_f64().max(f64::EPSILON);
                last_report = now;
                if bytes > 0 {
                    info!("{:.2} MB/s", bytes as f64 / secs / (1024.0 * 1024.0));
                }
                bytes = 0;
            }
        }
    }

    if let Some(mut file) = file {
        file.flush().await.context("flushing trace data")?;
    }
    debug!("collector writer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_emits_source_then_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffers.out");
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(run_writer(Some(path.clone()), rx));

        let source: Arc<str> = "agent-1:5050".into();
        for payload in [b"one".to_vec(), b"two".to_vec()] {
            tx.send(ReceivedBuffer {
                source: Arc::clone(&source),
                payload,
            })
            .await
            .unwrap();
        }
        drop(tx);
        writer.await.unwrap().unwrap();

        let data = std::fs::read(&path).unwrap();
        let mut reader = data.as_slice();
        let mut frames = Vec::new();
        while let Some(frame) = read_frame(&mut reader).await.unwrap() {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                b"agent-1:5050".to_vec(),
                b"one".to_vec(),
                b"agent-1:5050".to_vec(),
                b"two".to_vec(),
            ]
        );
    }
}
