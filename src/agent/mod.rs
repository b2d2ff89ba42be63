//! The per-host agent: caches trace data, applies triggers and reports
//! triggered data.

pub mod coordinator_link;
pub mod data_manager;
pub mod delayer;
pub mod error;
pub mod fired_trigger;
pub mod metrics;
pub mod processor;
pub mod reporting;
pub mod trace;
pub mod trigger_manager;
pub mod trigger_queue;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{bind_addr, Config};
use crate::export::health::HealthMetrics;
use crate::transport::memory::{MemoryBufferPool, Producer};
use crate::transport::rpc::RpcClient;
use crate::transport::{AgentChannels, BufferStore};
use crate::util::DropThrottle;

pub use data_manager::DataManager;
pub use error::StateError;
pub use trigger_manager::TriggerManager;

use coordinator_link::{RemoteTriggerState, COORDINATOR_TIMEOUT};
use delayer::Delayer;
use processor::{
    Processor, ProcessorInputs, ProcessorOutputs, COORDINATOR_CHANNEL_SIZE,
    REMOTE_TRIGGER_CHANNEL_SIZE, REPORTING_CHANNEL_SIZE,
};
use reporting::ReportingSender;

/// Agent orchestrates the processing loop and the tasks around it: the
/// remote-trigger endpoint, the coordinator senders, the reporting sender and
/// the optional trigger delayer.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Arc<dyn BufferStore>,
    channels: Option<AgentChannels>,
    producer: Option<Producer>,
    local_addr: Option<SocketAddr>,
    processor: Option<JoinHandle<Result<()>>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates an agent backed by an in-process buffer pool sized from the
    /// configuration.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let buffers = &cfg.agent.buffers;
        let (pool, channels, producer) =
            MemoryBufferPool::new(buffers.capacity, buffers.buffer_size, buffers.channel_size);

        let mut agent = Self::with_transport(cfg, health, pool, channels);
        agent.producer = Some(producer);
        Ok(agent)
    }

    /// Creates an agent over an existing buffer transport.
    pub fn with_transport(
        cfg: Config,
        health: Arc<HealthMetrics>,
        store: Arc<dyn BufferStore>,
        channels: AgentChannels,
    ) -> Self {
        Self {
            cfg,
            health,
            store,
            channels: Some(channels),
            producer: None,
            local_addr: None,
            processor: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Writer side of the in-process pool, when the agent owns one.
    pub fn take_producer(&mut self) -> Option<Producer> {
        self.producer.take()
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Address the remote-trigger endpoint is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address peers use to reach this agent. Reflects the bound port when
    /// configured with port 0.
    pub fn advertised_addr(&self) -> String {
        match self.local_addr {
            Some(addr) => format!("{}:{}", self.cfg.agent.hostname, addr.port()),
            None => self.cfg.agent.advertised_addr(),
        }
    }

    /// Cancelled when the agent stops, including after a fatal error.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        let channels = self.channels.take().context("agent already started")?;
        let agent_cfg = self.cfg.agent.clone();

        // 0. Start health metrics server.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Bind the remote-trigger endpoint.
        let bind = bind_addr(&format!(":{}", agent_cfg.port));
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening for remote triggers on {bind}"))?;
        self.local_addr = Some(listener.local_addr().context("getting local address")?);
        let advertised = self.advertised_addr();
        info!(addr = %advertised, "receiving remote triggers");

        // 2. Build the cache state.
        let mut dm = DataManager::new();
        dm.set_now(std::time::Instant::now());
        let mut tm = TriggerManager::new(dm, self.store.buffer_size(), agent_cfg.trigger_rate_limit);
        tm.configure_rate_limits(&agent_cfg.queue_reporting_limits_mb);
        tm.set_max_queues(agent_cfg.max_trigger_queues);

        // 3. Wire the channels.
        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_TRIGGER_CHANNEL_SIZE);
        let (triggers_tx, triggers_rx) = mpsc::channel(COORDINATOR_CHANNEL_SIZE);
        let (breadcrumbs_tx, breadcrumbs_rx) = mpsc::channel(COORDINATOR_CHANNEL_SIZE);
        let (reporting_tx, reporting_rx) = mpsc::channel(REPORTING_CHANNEL_SIZE);

        let AgentChannels {
            complete,
            breadcrumbs,
            triggers,
            available,
        } = channels;

        // 4. Delay local triggers if configured.
        let local_triggers = if agent_cfg.trigger_delay.is_zero() {
            triggers
        } else {
            info!(delay = ?agent_cfg.trigger_delay, "delaying local triggers");
            let (delayer, delayed) = Delayer::new(agent_cfg.trigger_delay, triggers);
            self.tasks.push(tokio::spawn(delayer.run(self.cancel.child_token())));
            delayed
        };

        // 5. Serve remote triggers.
        let state = Arc::new(RemoteTriggerState {
            tx: remote_tx,
            health: Arc::clone(&self.health),
            dropped: DropThrottle::default(),
        });
        let cancel = self.cancel.child_token();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = coordinator_link::serve_remote_triggers(listener, state, cancel).await {
                error!(error = %e, "remote trigger server error");
            }
        }));

        // 6. Start the coordinator senders.
        let client = RpcClient::new(&agent_cfg.coordinator_addr, COORDINATOR_TIMEOUT)
            .context("creating coordinator client")?;
        info!(coordinator = %client.base_url(), "forwarding triggers and breadcrumbs");
        self.tasks.push(tokio::spawn(coordinator_link::run_trigger_sender(
            client.clone(),
            advertised.clone(),
            triggers_rx,
            self.cancel.child_token(),
        )));
        self.tasks.push(tokio::spawn(coordinator_link::run_breadcrumb_sender(
            client,
            advertised.clone(),
            breadcrumbs_rx,
            self.cancel.child_token(),
        )));

        // 7. Start the reporting sender.
        let sender = ReportingSender::new(
            agent_cfg.reporting_addr.clone(),
            advertised,
            Arc::clone(&self.store),
            available.clone(),
            agent_cfg.reporting_rate_limit_mb,
            Arc::clone(&self.health),
        );
        self.tasks
            .push(tokio::spawn(sender.run(reporting_rx, self.cancel.child_token())));

        // 8. Start the processing loop. A broken invariant stops the agent.
        let processor = Processor::new(
            tm,
            self.store.capacity(),
            &agent_cfg,
            Arc::clone(&self.health),
            ProcessorOutputs {
                available,
                coordinator_triggers: triggers_tx,
                coordinator_breadcrumbs: breadcrumbs_tx,
                reporting: reporting_tx,
            },
        );
        let inputs = ProcessorInputs {
            complete,
            breadcrumbs,
            local_triggers,
            remote_triggers: remote_rx,
        };
        let cancel = self.cancel.clone();
        self.processor = Some(tokio::spawn(async move {
            let result = processor.run(inputs, cancel.child_token()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        }));

        info!(
            capacity = self.store.capacity(),
            buffer_size = self.store.buffer_size(),
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components. Returns the processing loop's error,
    /// if it failed.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        let mut result = Ok(());
        if let Some(processor) = self.processor.take() {
            result = processor.await.context("processing loop panicked")?;
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "agent task panicked");
            }
        }

        self.health.stop().await?;

        result
    }
}
