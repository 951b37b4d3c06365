// Inspect ring buffer and subscriber fan-out
// Per tunnel, a bounded FIFO of captured exchanges plus live subscribers
// fed over drop-on-slow channels. Every write is also journaled to the
// store asynchronously; the ring is the source for the inspect API.

use fxtunnel_store::{CapturedExchange, Store};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of each subscriber channel; overflow drops the subscriber
const SUBSCRIBER_BUFFER: usize = 16;

/// Events delivered to inspect subscribers
#[derive(Debug, Clone)]
pub enum InspectEvent {
    Exchange(Arc<CapturedExchange>),
}

/// Body-less summary of an exchange, used for lists and SSE
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeSummary {
    pub id: Uuid,
    pub tunnel_id: Uuid,
    pub host: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub duration_ns: u64,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub error: bool,
    pub replay_ref: Option<Uuid>,
}

impl From<&CapturedExchange> for ExchangeSummary {
    fn from(e: &CapturedExchange) -> Self {
        ExchangeSummary {
            id: e.id,
            tunnel_id: e.tunnel_id,
            host: e.host.clone(),
            timestamp: e.timestamp,
            duration_ns: e.duration_ns,
            method: e.method.clone(),
            path: e.path.clone(),
            status: e.status,
            error: e.error,
            replay_ref: e.replay_ref,
        }
    }
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<InspectEvent>,
}

#[derive(Default)]
struct TunnelRing {
    ring: VecDeque<Arc<CapturedExchange>>,
    subscribers: Vec<Subscriber>,
}

/// All inspect state, keyed by tunnel id
pub struct InspectHub {
    rings: Mutex<HashMap<Uuid, TunnelRing>>,
    capacity: usize,
    store: Arc<dyn Store>,
}

impl InspectHub {
    pub fn new(capacity: usize, store: Arc<dyn Store>) -> InspectHub {
        InspectHub { rings: Mutex::new(HashMap::new()), capacity, store }
    }

    /// Record a completed exchange: append to the ring, fan out to
    /// subscribers, and journal to the store without waiting
    pub fn push(&self, exchange: CapturedExchange) -> Arc<CapturedExchange> {
        let exchange = Arc::new(exchange);
        {
            let mut rings = self.rings.lock().unwrap();
            let entry = rings.entry(exchange.tunnel_id).or_default();
            if entry.ring.len() >= self.capacity {
                entry.ring.pop_front();
            }
            entry.ring.push_back(exchange.clone());

            // Drop-on-slow: a subscriber that cannot keep up is removed;
            // its closed channel is the reset signal
            entry.subscribers.retain(|sub| {
                match sub.tx.try_send(InspectEvent::Exchange(exchange.clone())) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = %sub.id, "inspect subscriber too slow, dropping");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }

        let store = self.store.clone();
        let journaled = (*exchange).clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_exchange(journaled).await {
                warn!("failed to journal exchange: {}", e);
            }
        });

        exchange
    }

    /// Subscribe to new exchanges for a tunnel
    pub fn subscribe(&self, tunnel_id: Uuid) -> (Uuid, mpsc::Receiver<InspectEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        self.rings
            .lock()
            .unwrap()
            .entry(tunnel_id)
            .or_default()
            .subscribers
            .push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, tunnel_id: Uuid, subscriber_id: Uuid) {
        if let Some(entry) = self.rings.lock().unwrap().get_mut(&tunnel_id) {
            entry.subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Latest-first page of the ring
    pub fn list(&self, tunnel_id: Uuid, offset: usize, limit: usize) -> Vec<Arc<CapturedExchange>> {
        let rings = self.rings.lock().unwrap();
        match rings.get(&tunnel_id) {
            Some(entry) => entry.ring.iter().rev().skip(offset).take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn get(&self, tunnel_id: Uuid, exchange_id: Uuid) -> Option<Arc<CapturedExchange>> {
        let rings = self.rings.lock().unwrap();
        rings.get(&tunnel_id)?.ring.iter().find(|e| e.id == exchange_id).cloned()
    }

    pub fn ring_len(&self, tunnel_id: Uuid) -> usize {
        self.rings.lock().unwrap().get(&tunnel_id).map(|e| e.ring.len()).unwrap_or(0)
    }

    /// Clear the in-memory ring and the durable journal
    pub fn clear(&self, tunnel_id: Uuid) {
        if let Some(entry) = self.rings.lock().unwrap().get_mut(&tunnel_id) {
            entry.ring.clear();
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.clear_exchanges(tunnel_id).await {
                warn!("failed to clear exchange journal: {}", e);
            }
        });
    }

    /// Drop all inspect state for a closed tunnel
    pub fn remove_tunnel(&self, tunnel_id: Uuid) {
        self.rings.lock().unwrap().remove(&tunnel_id);
    }
}
