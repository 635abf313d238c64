use crate::Pixel;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Fans committed pixel updates out to connected clients. Delivery is
/// fire-and-forget: a closed sink is pruned, never retried.
pub struct ClientBroadcaster {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Pixel>>>,
}

impl ClientBroadcaster {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<Pixel>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().unwrap().insert(client_id, tx);
        (client_id, rx)
    }

    pub fn unsubscribe(&self, client_id: u64) {
        self.clients.lock().unwrap().remove(&client_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Push one update to every subscriber. Unbounded sends never block, so
    /// this is safe to call from the apply path.
    pub fn broadcast(&self, pixel: Pixel) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|client_id, tx| {
            if tx.send(pixel).is_ok() {
                true
            } else {
                debug!("dropping disconnected subscriber {}", client_id);
                false
            }
        });
    }
}

impl Default for ClientBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
