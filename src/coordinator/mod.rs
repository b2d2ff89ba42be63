//! The coordinator: learns which agents hold data for which traces and
//! disseminates triggers between them.

pub mod graph;
pub mod logger;
pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{bind_addr, Config};
use crate::export::health::HealthMetrics;

pub use graph::{Coordinator, FinishedTrigger, Trigger};

use logger::CsvLogger;
use server::CoordinatorLoop;

/// Runs the coordinator's HTTP server, processing loop and CSV logger.
pub struct CoordinatorService {
    cfg: Config,
    health: Arc<HealthMetrics>,
    local_addr: Option<SocketAddr>,
    server: Option<JoinHandle<()>>,
    processor: Option<JoinHandle<()>>,
    logger: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl CoordinatorService {
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            local_addr: None,
            server: None,
            processor: None,
            logger: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<()> {
        let cfg = self.cfg.coordinator.clone();

        // 0. Start health metrics server.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Open the dissemination log.
        let finished = match &cfg.log_file {
            Some(path) => {
                let (logger, tx) = CsvLogger::create(path).await?;
                info!(path = %path.display(), "logging finished triggers");
                self.logger = Some(tokio::spawn(logger.run()));
                Some(tx)
            }
            None => None,
        };

        // 2. Start the processing loop.
        let (state, inputs) = server::channels();
        let processor = CoordinatorLoop::new(
            cfg.expiry_timeout,
            Arc::clone(&self.health),
            finished,
            self.cancel.child_token(),
        );
        self.processor = Some(tokio::spawn(processor.run(inputs, cfg.sweep_interval)));

        // 3. Serve agents.
        let bind = bind_addr(&format!(":{}", cfg.port));
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;
        self.local_addr = Some(local_addr);

        let cancel = self.cancel.child_token();
        self.server = Some(tokio::spawn(async move {
            info!(addr = %local_addr, "listening for agent connections");
            let result = axum::serve(listener, server::router(state))
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "coordinator server error");
            }
        }));

        info!("coordinator fully started");

        Ok(())
    }

    /// Stops serving, flushes every trigger to the log and waits for the log
    /// to close.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(server) = self.server.take() {
            server.await.context("coordinator server panicked")?;
        }
        if let Some(processor) = self.processor.take() {
            processor.await.context("coordinator loop panicked")?;
        }
        if let Some(logger) = self.logger.take() {
            logger.await.context("dissemination logger panicked")??;
        }

        self.health.stop().await?;

        Ok(())
    }
}
