//! Request/response correlation for transports with a shared inbound stream

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{McpError, Result};
use crate::protocol::JsonRpcResponse;

#[derive(Default)]
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate an id and a slot that receives its response
    pub fn register(self: &Arc<Self>) -> PendingSlot {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        PendingSlot {
            id,
            rx,
            owner: Arc::clone(self),
        }
    }

    /// Hand a response to whoever waits for it; false when nobody does
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let id = response.id;
        match self.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!("◆ UNCLAIMED RESPONSE {}", id);
                false
            }
        }
    }

    /// Wake every waiter with a disconnect
    pub fn fail_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One outstanding request; dropping it withdraws the request
pub(crate) struct PendingSlot {
    pub id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    owner: Arc<PendingRequests>,
}

impl PendingSlot {
    pub async fn wait(mut self) -> Result<JsonRpcResponse> {
        (&mut self.rx)
            .await
            .map_err(|_| McpError::Disconnected(format!("request {} abandoned", self.id)))
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.id);
    }
}
