//! Coordinator request handling.
//!
//! HTTP handlers only enqueue; a single loop owns the dissemination graph,
//! applies each request, forwards resulting triggers to agents and expires
//! stale state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::coordinator_link::{backoff, Outage};
use crate::export::health::HealthMetrics;
use crate::transport::rpc::{
    BreadcrumbMessage, RpcClient, TriggerEntry, TriggerMessage, BREADCRUMBS_PATH,
    LOCAL_TRIGGER_PATH,
};
use crate::util::{recv_batch, DropThrottle, SEND_BATCH_LIMIT};
use crate::{TraceId, TriggerId};

use super::graph::{Coordinator, FinishedTrigger, Trigger};

/// Depth of each incoming request channel.
pub const INCOMING_CHANNEL_SIZE: usize = 10_000;
/// Depth of each agent's outgoing trigger channel.
pub const OUTGOING_CHANNEL_SIZE: usize = 10_000;
/// Request timeout toward agents.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("address id {id} from {src} has not been mapped to an address")]
    UnmappedAddress { id: i32, src: String },

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

/// A request waiting for the coordinator loop.
pub struct Incoming<T> {
    pub msg: T,
    pub reply: oneshot::Sender<Result<(), RequestError>>,
}

/// Receiving ends of the request channels.
pub struct CoordinatorInputs {
    pub triggers: mpsc::Receiver<Incoming<TriggerMessage>>,
    pub breadcrumbs: mpsc::Receiver<Incoming<BreadcrumbMessage>>,
}

/// Shared state of the HTTP handlers.
pub struct AppState {
    triggers: mpsc::Sender<Incoming<TriggerMessage>>,
    breadcrumbs: mpsc::Sender<Incoming<BreadcrumbMessage>>,
    dropped_triggers: DropThrottle,
    dropped_breadcrumbs: DropThrottle,
}

/// Creates the request channels and the handler state feeding them.
pub fn channels() -> (Arc<AppState>, CoordinatorInputs) {
    let (triggers_tx, triggers_rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);
    let (breadcrumbs_tx, breadcrumbs_rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);
    let state = Arc::new(AppState {
        triggers: triggers_tx,
        breadcrumbs: breadcrumbs_tx,
        dropped_triggers: DropThrottle::default(),
        dropped_breadcrumbs: DropThrottle::default(),
    });
    let inputs = CoordinatorInputs {
        triggers: triggers_rx,
        breadcrumbs: breadcrumbs_rx,
    };
    (state, inputs)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(LOCAL_TRIGGER_PATH, post(local_trigger_handler))
        .route(BREADCRUMBS_PATH, post(breadcrumbs_handler))
        .with_state(state)
}

async fn enqueue<T>(
    tx: &mpsc::Sender<Incoming<T>>,
    msg: T,
    items: usize,
    dropped: &DropThrottle,
    kind: &str,
) -> (StatusCode, String) {
    let (reply, rx) = oneshot::channel();
    if tx.try_send(Incoming { msg, reply }).is_err() {
        if let Some(n) = dropped.record(items as u64) {
            warn!(dropped = n, "coordinator is bottlenecked, incoming {kind} dropped");
        }
        return (StatusCode::OK, String::new());
    }

    match rx.await {
        Ok(Ok(())) => (StatusCode::OK, String::new()),
        Ok(Err(e)) => {
            warn!(error = %e, "rejected {kind} request");
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            RequestError::ShuttingDown.to_string(),
        ),
    }
}

/// POST /v1/local_trigger
async fn local_trigger_handler(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<TriggerMessage>,
) -> (StatusCode, String) {
    let items = msg.triggers.len();
    enqueue(&state.triggers, msg, items, &state.dropped_triggers, "triggers").await
}

/// POST /v1/breadcrumbs
async fn breadcrumbs_handler(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<BreadcrumbMessage>,
) -> (StatusCode, String) {
    let items = msg.breadcrumbs.len();
    enqueue(
        &state.breadcrumbs,
        msg,
        items,
        &state.dropped_breadcrumbs,
        "breadcrumbs",
    )
    .await
}

/// Coordinator-side view of one agent.
struct AgentPeer {
    /// Address ids interned by this agent's breadcrumb sender.
    id_to_addr: HashMap<i32, String>,
    outgoing: mpsc::Sender<Vec<Trigger>>,
    dropped: DropThrottle,
}

/// Owns the dissemination graph and the per-agent senders.
pub struct CoordinatorLoop {
    graph: Coordinator,
    agents: HashMap<String, AgentPeer>,
    expiry_timeout: Duration,
    health: Arc<HealthMetrics>,
    finished: Option<mpsc::Sender<Vec<FinishedTrigger>>>,
    dropped_finished: u64,
    senders: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl CoordinatorLoop {
    /// `finished` receives expired triggers, if a log is configured.
    pub fn new(
        expiry_timeout: Duration,
        health: Arc<HealthMetrics>,
        finished: Option<mpsc::Sender<Vec<FinishedTrigger>>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            graph: Coordinator::new(),
            agents: HashMap::new(),
            expiry_timeout,
            health,
            finished,
            dropped_finished: 0,
            senders: Vec::new(),
            cancel,
        }
    }

    pub fn graph(&self) -> &Coordinator {
        &self.graph
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Looks up an agent, starting its sender on first sight.
    fn agent(&mut self, addr: &str) -> &mut AgentPeer {
        let cancel = &self.cancel;
        let senders = &mut self.senders;
        self.agents
            .entry(addr.to_string())
            .or_insert_with(|| spawn_peer(addr, cancel, senders))
    }

    fn forward(&mut self, to_forward: HashMap<String, Vec<Trigger>>) {
        for (addr, triggers) in to_forward {
            let n = triggers.len() as u64;
            let peer = self.agent(&addr);
            if peer.outgoing.try_send(triggers).is_err() {
                if let Some(dropped) = peer.dropped.record(n) {
                    warn!(agent = %addr, dropped, "agent is bottlenecked, dropping triggers");
                }
            }
        }
    }

    pub fn process_triggers(&mut self, msg: &TriggerMessage) {
        self.graph.set_now(std::time::Instant::now());
        self.health
            .coordinator_requests
            .with_label_values(&["triggers"])
            .inc();

        let mut to_forward: HashMap<String, Vec<Trigger>> = HashMap::new();
        for entry in &msg.triggers {
            let trigger = Trigger {
                id: TriggerId::new(entry.queue_id, entry.base_trace_id),
                trace_ids: entry.trace_ids.clone(),
            };
            for addr in self.graph.add_trigger(&msg.src, &trigger) {
                to_forward.entry(addr).or_default().push(trigger.clone());
            }
        }
        self.forward(to_forward);
        self.check_expirations();
    }

    pub fn process_breadcrumbs(&mut self, msg: &BreadcrumbMessage) -> Result<(), RequestError> {
        self.graph.set_now(std::time::Instant::now());
        self.health
            .coordinator_requests
            .with_label_values(&["breadcrumbs"])
            .inc();

        // Nothing is recorded until every id resolves.
        let incoming: HashMap<i32, &str> = msg
            .addresses
            .iter()
            .map(|entry| (entry.id, entry.addr.as_str()))
            .collect();
        let known = self.agents.get(&msg.src).map(|peer| &peer.id_to_addr);
        let resolve = |id: &i32| {
            incoming
                .get(id)
                .map(|addr| addr.to_string())
                .or_else(|| known.and_then(|table| table.get(id).cloned()))
                .ok_or_else(|| RequestError::UnmappedAddress {
                    id: *id,
                    src: msg.src.clone(),
                })
        };

        let mut breadcrumbs: Vec<(TraceId, Vec<String>)> = Vec::with_capacity(msg.breadcrumbs.len());
        for entry in &msg.breadcrumbs {
            let addrs = entry.addrs.iter().map(&resolve).collect::<Result<Vec<_>, _>>()?;
            breadcrumbs.push((entry.trace_id, addrs));
        }

        let origin = self.agent(&msg.src);
        for entry in &msg.addresses {
            origin.id_to_addr.insert(entry.id, entry.addr.clone());
        }

        let mut to_forward: HashMap<String, Vec<Trigger>> = HashMap::new();
        for (trace_id, addrs) in breadcrumbs {
            for (addr, triggers) in self.graph.add_breadcrumb(&msg.src, trace_id, &addrs) {
                to_forward.entry(addr).or_default().extend(triggers);
            }
        }
        self.forward(to_forward);
        self.check_expirations();
        Ok(())
    }

    /// Forgets state untouched for the expiry timeout.
    pub fn check_expirations(&mut self) {
        let now = std::time::Instant::now();
        self.graph.set_now(now);
        if let Some(cutoff) = now.checked_sub(self.expiry_timeout) {
            self.graph.check_trace_expiration(cutoff);
            let finished = self.graph.check_trigger_expiration(cutoff);
            self.record_finished(finished);
        }
        self.health
            .coordinator_traces
            .set(self.graph.trace_count() as f64);
        self.health
            .coordinator_triggers
            .set(self.graph.trigger_count() as f64);
    }

    fn record_finished(&mut self, finished: Vec<FinishedTrigger>) {
        if finished.is_empty() {
            return;
        }
        self.health.finished_triggers.inc_by(finished.len() as f64);
        for trigger in &finished {
            self.health
                .dissemination_duration
                .observe(trigger.dissemination_time.as_secs_f64());
        }

        let Some(tx) = &self.finished else {
            return;
        };
        let n = finished.len() as u64;
        if tx.try_send(finished).is_err() {
            self.dropped_finished += n;
            debug!(dropped = self.dropped_finished, "dissemination log is behind");
        }
    }

    /// Runs until cancelled, then expires every trigger so the log sees it.
    pub async fn run(mut self, mut inputs: CoordinatorInputs, sweep_interval: Duration) {
        info!("coordinator loop running");
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(req) = inputs.triggers.recv() => {
                    self.process_triggers(&req.msg);
                    let _ = req.reply.send(Ok(()));
                }
                Some(req) = inputs.breadcrumbs.recv() => {
                    let result = self.process_breadcrumbs(&req.msg);
                    let _ = req.reply.send(result);
                }
                _ = sweep.tick() => self.check_expirations(),
            }
        }

        let cutoff = std::time::Instant::now() + Duration::from_secs(1);
        let finished = self.graph.check_trigger_expiration(cutoff);
        info!(triggers = finished.len(), "flushing triggers to dissemination log");
        self.record_finished(finished);
        if self.dropped_finished > 0 {
            warn!(dropped = self.dropped_finished, "finished triggers missing from log");
        }
        self.finished = None;

        for sender in self.senders.drain(..) {
            let _ = sender.await;
        }
        info!("coordinator loop stopped");
    }
}

fn spawn_peer(
    addr: &str,
    cancel: &CancellationToken,
    senders: &mut Vec<JoinHandle<()>>,
) -> AgentPeer {
    let (outgoing, rx) = mpsc::channel(OUTGOING_CHANNEL_SIZE);
    match RpcClient::new(addr, AGENT_TIMEOUT) {
        Ok(client) => {
            info!(agent = %addr, "connecting to agent");
            senders.push(tokio::spawn(run_agent_sender(client, rx, cancel.child_token())));
        }
        Err(e) => warn!(agent = %addr, error = %e, "unable to create agent client"),
    }
    AgentPeer {
        id_to_addr: HashMap::new(),
        outgoing,
        dropped: DropThrottle::default(),
    }
}

/// Builds a remote-trigger request from accumulated triggers.
pub fn remote_trigger_message(batches: Vec<Vec<Trigger>>) -> TriggerMessage {
    TriggerMessage {
        src: String::new(),
        triggers: batches
            .into_iter()
            .flatten()
            .map(|t| TriggerEntry {
                queue_id: t.id.queue_id,
                base_trace_id: t.id.base_trace_id,
                trace_ids: t.trace_ids,
            })
            .collect(),
    }
}

/// Delivers triggers to one agent.
async fn run_agent_sender(
    client: RpcClient,
    mut rx: mpsc::Receiver<Vec<Trigger>>,
    cancel: CancellationToken,
) {
    let mut outage = Outage::new("remote triggers");
    while let Some(batches) = recv_batch(&mut rx, SEND_BATCH_LIMIT, &cancel).await {
        let msg = remote_trigger_message(batches);
        if msg.triggers.is_empty() {
            continue;
        }
        match client.remote_trigger(&msg).await {
            Ok(()) => outage.succeeded(client.base_url()),
            Err(e) => {
                outage.failed(client.base_url(), &e);
                if !backoff(&cancel).await {
                    break;
                }
            }
        }
    }
}
