//! Agent side of the coordinator protocol: the two outbound senders and the
//! inbound remote-trigger endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::export::health::HealthMetrics;
use crate::transport::rpc::{
    AddressTable, RpcClient, TriggerEntry, TriggerMessage, REMOTE_TRIGGER_PATH,
};
use crate::transport::LocalTrigger;
use crate::util::{recv_batch, DropThrottle, SEND_BATCH_LIMIT};

use super::trigger_manager::Breadcrumbs;

/// Request timeout toward the coordinator.
pub const COORDINATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed send.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Tracks one outage so only its first failure is logged.
#[derive(Debug)]
pub(crate) struct Outage {
    what: &'static str,
    failing: bool,
}

impl Outage {
    pub(crate) fn new(what: &'static str) -> Self {
        Self {
            what,
            failing: false,
        }
    }

    pub(crate) fn failed(&mut self, target: &str, err: &anyhow::Error) {
        if !self.failing {
            warn!(
                target_addr = %target,
                error = %format!("{err:#}"),
                "unable to send {}, retrying every {:?}",
                self.what,
                RETRY_INTERVAL,
            );
            self.failing = true;
        }
    }

    pub(crate) fn succeeded(&mut self, target: &str) {
        if self.failing {
            info!(target_addr = %target, "sending {} again", self.what);
            self.failing = false;
        }
    }
}

/// Waits out the retry interval. Returns false when cancelled.
pub(crate) async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(RETRY_INTERVAL) => true,
    }
}

/// Builds one request from accumulated local triggers.
pub fn trigger_message(src: &str, batches: Vec<Vec<LocalTrigger>>) -> TriggerMessage {
    TriggerMessage {
        src: src.to_string(),
        triggers: batches
            .into_iter()
            .flatten()
            .map(|t| TriggerEntry {
                queue_id: t.queue_id,
                base_trace_id: t.base_trace_id,
                trace_ids: vec![t.trace_id],
            })
            .collect(),
    }
}

/// Forwards accepted local triggers to the coordinator.
pub async fn run_trigger_sender(
    client: RpcClient,
    src: String,
    mut rx: mpsc::Receiver<Vec<LocalTrigger>>,
    cancel: CancellationToken,
) {
    let mut outage = Outage::new("local triggers");
    while let Some(batches) = recv_batch(&mut rx, SEND_BATCH_LIMIT, &cancel).await {
        let msg = trigger_message(&src, batches);
        match client.local_trigger(&msg).await {
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

/// Forwards breadcrumbs of triggered traces to the coordinator, interning
/// addresses for as long as requests keep succeeding.
pub async fn run_breadcrumb_sender(
    client: RpcClient,
    src: String,
    mut rx: mpsc::Receiver<Breadcrumbs>,
    cancel: CancellationToken,
) {
    let mut outage = Outage::new("breadcrumbs");
    let mut addresses = AddressTable::new();
    while let Some(batches) = recv_batch(&mut rx, SEND_BATCH_LIMIT, &cancel).await {
        let entries: Vec<_> = batches.into_iter().flatten().collect();
        let msg = addresses.encode(&src, &entries);
        match client.breadcrumbs(&msg).await {
            Ok(()) => outage.succeeded(client.base_url()),
            Err(e) => {
                // The coordinator may not have seen the interned ids.
                addresses.reset();
                outage.failed(client.base_url(), &e);
                if !backoff(&cancel).await {
                    break;
                }
            }
        }
    }
}

/// Shared state of the remote-trigger endpoint.
pub struct RemoteTriggerState {
    pub tx: mpsc::Sender<Vec<LocalTrigger>>,
    pub health: Arc<HealthMetrics>,
    pub dropped: DropThrottle,
}

/// Expands a coordinator message into one trigger per trace id.
pub fn expand_triggers(msg: &TriggerMessage) -> Vec<LocalTrigger> {
    msg.triggers
        .iter()
        .flat_map(|entry| {
            entry.trace_ids.iter().map(|&trace_id| LocalTrigger {
                queue_id: entry.queue_id,
                base_trace_id: entry.base_trace_id,
                trace_id,
            })
        })
        .collect()
}

/// POST /v1/remote_trigger
async fn remote_trigger_handler(
    State(state): State<Arc<RemoteTriggerState>>,
    Json(msg): Json<TriggerMessage>,
) -> StatusCode {
    let triggers = expand_triggers(&msg);
    if triggers.is_empty() {
        return StatusCode::OK;
    }

    let n = triggers.len() as u64;
    if state.tx.try_send(triggers).is_err() {
        state
            .health
            .channel_dropped
            .with_label_values(&["remote_triggers"])
            .inc_by(n as f64);
        if let Some(dropped) = state.dropped.record(n) {
            warn!(dropped, "agent is bottlenecked, dropping remote triggers");
        }
    }
    StatusCode::OK
}

pub fn router(state: Arc<RemoteTriggerState>) -> Router {
    Router::new()
        .route(REMOTE_TRIGGER_PATH, post(remote_trigger_handler))
        .with_state(state)
}

/// Serves remote triggers until cancelled.
pub async fn serve_remote_triggers(
    listener: TcpListener,
    state: Arc<RemoteTriggerState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_message_one_trace_per_entry() {
        let t = |base, trace| LocalTrigger {
            queue_id: 3,
            base_trace_id: base,
            trace_id: trace,
        };
        let msg = trigger_message("me:5050", vec![vec![t(1, 1)], vec![t(1, 2), t(4, 4)]]);

        assert_eq!(msg.src, "me:5050");
        assert_eq!(msg.triggers.len(), 3);
        assert_eq!(msg.triggers[1].base_trace_id, 1);
        assert_eq!(msg.triggers[1].trace_ids, vec![2]);
    }

    #[test]
    fn test_expand_triggers_per_trace_id() {
        let msg = TriggerMessage {
            src: String::new(),
            triggers: vec![
                TriggerEntry {
                    queue_id: 1,
                    base_trace_id: 10,
                    trace_ids: vec![10, 11, 12],
                },
                TriggerEntry {
                    queue_id: 2,
                    base_trace_id: 20,
                    trace_ids: vec![],
                },
            ],
        };

        let triggers = expand_triggers(&msg);
        assert_eq!(triggers.len(), 3);
        assert!(triggers.iter().all(|t| t.queue_id == 1 && t.base_trace_id == 10));
        assert_eq!(triggers[2].trace_id, 12);
    }

    #[tokio::test]
    async fn test_remote_trigger_endpoint_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let state = Arc::new(RemoteTriggerState {
            tx,
            health: Arc::clone(&health),
            dropped: DropThrottle::default(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve_remote_triggers(listener, state, cancel.clone()));

        let client = RpcClient::new(&addr.to_string(), COORDINATOR_TIMEOUT).unwrap();
        let msg = TriggerMessage {
            src: String::new(),
            triggers: vec![TriggerEntry {
                queue_id: 1,
                base_trace_id: 7,
                trace_ids: vec![7, 8],
            }],
        };
        client.remote_trigger(&msg).await.unwrap();
        client.remote_trigger(&msg).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            health
                .channel_dropped
                .with_label_values(&["remote_triggers"])
                .get(),
            2.0
        );

        cancel.cancel();
    }
}
