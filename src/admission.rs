//! Per-client admission control.
//!
//! One counting semaphore per client identity bounds that client's in-flight
//! requests. Slots are created lazily on first contact and live for the
//! process; a configuration reload resizes every existing slot in place
//! without disturbing current holders.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// A released slot is the RAII drop of this permit, so every exit path of a
/// request (success, upstream failure, client disconnect mid-stream)
/// returns the slot.
pub type AdmissionPermit = OwnedSemaphorePermit;

struct ClientSlot {
    permits: Arc<Semaphore>,
    // capacity as of the last resize; the lock serialises resizes only,
    // acquisition never touches it
    capacity: Mutex<usize>,
}

impl ClientSlot {
    fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity: Mutex::new(capacity),
        }
    }

    async fn resize(&self, new_capacity: usize) {
        let mut capacity = self.capacity.lock().await;
        match new_capacity.cmp(&*capacity) {
            Ordering::Greater => self.permits.add_permits(new_capacity - *capacity),
            Ordering::Less => {
                let shrink = *capacity - new_capacity;
                let forgotten = self.permits.forget_permits(shrink);
                let outstanding = shrink - forgotten;
                if outstanding > 0 {
                    // Permits still held by in-flight requests. A waiter at
                    // the head of the FIFO queue retires them as holders
                    // release, so the bound converges without disturbing
                    // anyone currently admitted.
                    let permits = self.permits.clone();
                    tokio::spawn(async move {
                        if let Ok(reclaimed) =
                            permits.acquire_many_owned(outstanding as u32).await
                        {
                            reclaimed.forget();
                        }
                    });
                }
            }
            Ordering::Equal => {}
        }
        *capacity = new_capacity;
    }
}

/// Lazily-keyed map of per-client slots.
///
/// Entries are never removed; long-running gateways accumulate one slot per
/// distinct client identity seen.
#[derive(Default)]
pub struct ClientSlots {
    slots: DashMap<String, Arc<ClientSlot>>,
}

impl ClientSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `wait` for a free slot. `limit` is only consulted when the
    /// client is seen for the first time; existing slots keep the capacity
    /// of their creation or the most recent resize.
    pub async fn acquire(
        &self,
        client_id: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<AdmissionPermit, GatewayError> {
        let slot = self
            .slots
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(ClientSlot::new(limit)))
            .clone();

        match timeout(wait, slot.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(client = client_id, "admission slot acquired");
                Ok(permit)
            }
            Ok(Err(_)) => Err(GatewayError::Internal(
                "admission semaphore closed".into(),
            )),
            Err(_) => {
                warn!(client = client_id, "concurrency limit exceeded");
                Err(GatewayError::ConcurrencyLimit)
            }
        }
    }

    /// Apply a new per-client capacity to every existing slot. Future slots
    /// pick the limit up from the config snapshot at creation.
    pub async fn resize_all(&self, limit: usize) {
        for entry in self.slots.iter() {
            entry.value().resize(limit).await;
        }
        debug!(limit, clients = self.slots.len(), "client slots resized");
    }

    pub fn tracked_clients(&self) -> usize {
        self.slots.len()
    }
}
