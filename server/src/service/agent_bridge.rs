//! Repair agent reached through the HTTP bridge
//!
//! Requests are published for whoever listens on the event stream; the
//! agent answers by posting signals to `/repairs/{id}/signal`.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::domain::repair::{AgentSignal, RepairRequest};
use crate::error::{Error, Result};
use crate::service::repair::RepairAgent;

const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub struct BridgeRepairAgent {
    pending: DashMap<String, mpsc::Sender<AgentSignal>>,
    requests: broadcast::Sender<RepairRequest>,
}

impl BridgeRepairAgent {
    pub fn new() -> Self {
        let (requests, _) = broadcast::channel(REQUEST_CHANNEL_CAPACITY);
        Self {
            pending: DashMap::new(),
            requests,
        }
    }

    /// Stream of work orders for connected agents
    pub fn subscribe(&self) -> broadcast::Receiver<RepairRequest> {
        self.requests.subscribe()
    }

    /// Forward a signal to the repair waiting on it
    pub async fn signal(&self, repair_id: &str, signal: AgentSignal) -> Result<()> {
        let sender = self
            .pending
            .get(repair_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::RepairNotFound(repair_id.to_string()))?;

        debug!("Agent signal for {}: {:?}", repair_id, signal);
        sender
            .send(signal)
            .await
            .map_err(|_| Error::RepairNotFound(repair_id.to_string()))
    }

    /// Repairs currently waiting on an agent
    pub fn pending(&self) -> Vec<String> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for BridgeRepairAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepairAgent for BridgeRepairAgent {
    async fn dispatch(
        &self,
        request: RepairRequest,
        signals: mpsc::Sender<AgentSignal>,
    ) -> Result<()> {
        self.pending.insert(request.repair_id.clone(), signals);

        let repair_id = request.repair_id.clone();
        match self.requests.send(request) {
            Ok(listeners) => info!("Repair {} sent to {} agent listener(s)", repair_id, listeners),
            Err(_) => warn!("No repair agent connected for {}", repair_id),
        }
        Ok(())
    }

    fn release(&self, repair_id: &str) {
        self.pending.remove(repair_id);
    }
}
