//! JSON-over-HTTP messages exchanged between agents and the coordinator.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{QueueId, TraceId};

/// Agent to coordinator: triggers fired locally.
pub const LOCAL_TRIGGER_PATH: &str = "/v1/local_trigger";
/// Agent to coordinator: breadcrumbs of triggered traces.
pub const BREADCRUMBS_PATH: &str = "/v1/breadcrumbs";
/// Coordinator to agent: triggers fired elsewhere.
pub const REMOTE_TRIGGER_PATH: &str = "/v1/remote_trigger";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub queue_id: QueueId,
    pub base_trace_id: TraceId,
    pub trace_ids: Vec<TraceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMessage {
    /// Address of the sending agent, or empty when sent by the coordinator.
    pub src: String,
    pub triggers: Vec<TriggerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub id: i32,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreadcrumbEntry {
    pub trace_id: TraceId,
    /// Interned address ids.
    pub addrs: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreadcrumbMessage {
    pub src: String,
    /// Addresses interned for the first time in this message.
    pub addresses: Vec<AddressEntry>,
    pub breadcrumbs: Vec<BreadcrumbEntry>,
}

/// Sender-side address interning.
///
/// An address is included in a message's address table only the first time
/// it is used; afterwards only its id travels.
#[derive(Debug, Default)]
pub struct AddressTable {
    addr_to_id: HashMap<String, i32>,
    seed: i32,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, addr: &str, fresh: &mut Vec<AddressEntry>) -> i32 {
        if let Some(&id) = self.addr_to_id.get(addr) {
            return id;
        }
        let id = self.seed;
        self.seed += 1;
        self.addr_to_id.insert(addr.to_string(), id);
        fresh.push(AddressEntry {
            id,
            addr: addr.to_string(),
        });
        id
    }

    /// Forgets every interned address. The next message carries full entries.
    pub fn reset(&mut self) {
        self.addr_to_id.clear();
        self.seed = 0;
    }

    pub fn len(&self) -> usize {
        self.addr_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addr_to_id.is_empty()
    }

    pub fn encode(&mut self, src: &str, batch: &[(TraceId, Vec<String>)]) -> BreadcrumbMessage {
        let mut addresses = Vec::new();
        let breadcrumbs = batch
            .iter()
            .map(|(trace_id, addrs)| BreadcrumbEntry {
                trace_id: *trace_id,
                addrs: addrs
                    .iter()
                    .map(|addr| self.intern(addr, &mut addresses))
                    .collect(),
            })
            .collect();
        BreadcrumbMessage {
            src: src.to_string(),
            addresses,
            breadcrumbs,
        }
    }
}

/// HTTP client for one peer.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    base_url: String,
}

impl RpcClient {
    /// `addr` is `host:port` or a full `http://` URL.
    pub fn new(addr: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("sending request to {url}"))?
            .error_for_status()
            .with_context(|| format!("request to {url} rejected"))?;
        Ok(())
    }

    pub async fn local_trigger(&self, msg: &TriggerMessage) -> Result<()> {
        self.post(LOCAL_TRIGGER_PATH, msg).await
    }

    pub async fn breadcrumbs(&self, msg: &BreadcrumbMessage) -> Result<()> {
        self.post(BREADCRUMBS_PATH, msg).await
    }

    pub async fn remote_trigger(&self, msg: &TriggerMessage) -> Result<()> {
        self.post(REMOTE_TRIGGER_PATH, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_table_interns_once() {
        let mut table = AddressTable::new();
        let batch = vec![
            (1, vec!["a:1".to_string(), "b:1".to_string()]),
            (2, vec!["b:1".to_string()]),
        ];

        let msg = table.encode("me:1", &batch);
        assert_eq!(msg.addresses.len(), 2);
        assert_eq!(msg.breadcrumbs[0].addrs, vec![0, 1]);
        assert_eq!(msg.breadcrumbs[1].addrs, vec![1]);

        let msg = table.encode("me:1", &[(3, vec!["a:1".to_string(), "c:1".to_string()])]);
        assert_eq!(
            msg.addresses,
            vec![AddressEntry {
                id: 2,
                addr: "c:1".to_string()
            }]
        );
        assert_eq!(msg.breadcrumbs[0].addrs, vec![0, 2]);
    }

    #[test]
    fn test_reset_resends_addresses() {
        let mut table = AddressTable::new();
        table.encode("me", &[(1, vec!["a".to_string()])]);
        table.reset();
        let msg = table.encode("me", &[(1, vec!["a".to_string()])]);
        assert_eq!(msg.addresses.len(), 1);
        assert_eq!(msg.addresses[0].id, 0);
    }

    #[test]
    fn test_client_base_url() {
        let c = RpcClient::new("localhost:5252", Duration::from_secs(1)).unwrap();
        assert_eq!(c.base_url(), "http://localhost:5252");
        let c = RpcClient::new("http://coord:80/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.base_url(), "http://coord:80");
    }

    #[test]
    fn test_trigger_message_json_shape() {
        let msg = TriggerMessage {
            src: "a:5050".to_string(),
            triggers: vec![TriggerEntry {
                queue_id: 3,
                base_trace_id: 9,
                trace_ids: vec![9, 10],
            }],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["triggers"][0]["queue_id"], 3);
        assert_eq!(json["triggers"][0]["trace_ids"][1], 10);
    }
}
