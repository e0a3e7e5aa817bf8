//! Connection registry. Tracks live push-stream connections
//! keyed by connection-id (a bare `device_id` for devices, `client_<id>` for
//! clients) and the pending-response routing table. One mutex guards both
//! maps; it is held only for map mutations, never across a send — mirrors
//! `core-rs::sync::relay::BlindRelayServer`'s `Mutex<HashMap<...>>` shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::relay::envelope::OuterEnvelope;

/// Transport-agnostic send capability for a registered connection. The
/// server crate implements this over a `tokio::sync::mpsc::UnboundedSender`
/// so the core stays free of any async runtime or WebSocket dependency.
/// `send` returning `false` means the peer is gone — the caller falls back
/// to the durable queue.
pub trait DeliverySink: Send + Sync {
    fn send(&self, envelope: &OuterEnvelope) -> bool;

    /// Called on a sink that has just been displaced by a newer registration
    /// under the same id, or force-removed via `ConnectionRegistry::remove`.
    /// Default no-op; transports that own a background task (e.g. a
    /// forwarder draining a channel into a socket) should tear it down here.
    fn close(&self) {}
}

/// A connection's registration, tagged with the epoch it was registered
/// under so a handler's own end-of-life cleanup can tell whether it is still
/// the current occupant of `id` before removing it.
struct Slot {
    epoch: u64,
    sink: Box<dyn DeliverySink>,
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Slot>>,
    queues: Mutex<HashMap<String, Vec<OuterEnvelope>>>,
    pending_responses: Mutex<HashMap<String, String>>,
    next_epoch: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Register `id`'s stream and drain any envelopes queued for it in FIFO
    /// order, stopping at the first send failure — leftover envelopes stay
    /// queued. A second registration under the same id wins over the first:
    /// the displaced sink is closed here (`DeliverySink::close`) before this
    /// call returns, so its caller never needs to do so itself. Returns the
    /// epoch this registration was stamped with — hand it to `deregister` so
    /// a handler's own cleanup only removes the entry if it is still current.
    pub fn register(&self, id: &str, sink: Box<dyn DeliverySink>) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let (previous, queued) = {
            let mut connections = self.connections.lock().expect("registry mutex poisoned");
            let previous = connections.insert(id.to_string(), Slot { epoch, sink });
            let mut queues = self.queues.lock().expect("registry mutex poisoned");
            let queued = queues.remove(id).unwrap_or_default();
            (previous, queued)
        };

        if let Some(previous) = previous {
            previous.sink.close();
        }

        if !queued.is_empty() {
            let sink_ref = {
                let connections = self.connections.lock().expect("registry mutex poisoned");
                connections.get(id).is_some()
            };
            if sink_ref {
                self.drain_into(id, queued);
            }
        }

        epoch
    }

    fn drain_into(&self, id: &str, queued: Vec<OuterEnvelope>) {
        let mut iter = queued.into_iter();
        let mut remainder = Vec::new();
        for envelope in iter.by_ref() {
            let sent = {
                let connections = self.connections.lock().expect("registry mutex poisoned");
                match connections.get(id) {
                    Some(slot) => slot.sink.send(&envelope),
                    None => false,
                }
            };
            if !sent {
                remainder.push(envelope);
                remainder.extend(iter);
                break;
            }
        }
        if !remainder.is_empty() {
            let mut queues = self.queues.lock().expect("registry mutex poisoned");
            queues.entry(id.to_string()).or_default().splice(0..0, remainder);
        }
    }

    /// Remove `id`'s connection, but only if it is still the one registered
    /// under `epoch` — a later registration under the same id (which has
    /// already closed and displaced this one, see `register`) is left
    /// untouched. Returns `true` iff this call actually removed the entry.
    /// Intended for a stream handler's own end-of-life cleanup.
    pub fn deregister(&self, id: &str, epoch: u64) -> bool {
        let removed = {
            let mut connections = self.connections.lock().expect("registry mutex poisoned");
            match connections.get(id) {
                Some(slot) if slot.epoch == epoch => connections.remove(id).is_some(),
                _ => false,
            }
        };
        if removed {
            let mut pending = self.pending_responses.lock().expect("registry mutex poisoned");
            pending.retain(|_, waiting_client| waiting_client != id);
        }
        removed
    }

    /// Remove whichever connection currently occupies `id`, regardless of
    /// epoch, and close it. For administrative paths (e.g. device deletion)
    /// that must drop a connection unconditionally rather than only their
    /// own. Returns `true` iff a connection was removed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut connections = self.connections.lock().expect("registry mutex poisoned");
            connections.remove(id)
        };
        let existed = removed.is_some();
        if let Some(slot) = removed {
            slot.sink.close();
        }
        if existed {
            let mut pending = self.pending_responses.lock().expect("registry mutex poisoned");
            pending.retain(|_, waiting_client| waiting_client != id);
        }
        existed
    }

    pub fn is_present(&self, id: &str) -> bool {
        self.connections.lock().expect("registry mutex poisoned").contains_key(id)
    }

    pub fn devices_present(&self) -> Vec<String> {
        self.connections
            .lock()
            .expect("registry mutex poisoned")
            .keys()
            .filter(|id| !id.starts_with("client_"))
            .cloned()
            .collect()
    }

    /// Total live connections (devices and clients alike) — the surface
    /// exposed for `/api/stats` and `/api/health`'s websocket counters.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("registry mutex poisoned").len()
    }

    pub(crate) fn send_to(&self, id: &str, envelope: &OuterEnvelope) -> bool {
        let connections = self.connections.lock().expect("registry mutex poisoned");
        match connections.get(id) {
            Some(slot) => slot.sink.send(envelope),
            None => false,
        }
    }

    pub(crate) fn enqueue(&self, id: &str, envelope: OuterEnvelope) {
        let mut queues = self.queues.lock().expect("registry mutex poisoned");
        queues.entry(id.to_string()).or_default().push(envelope);
    }

    pub(crate) fn queue_len(&self, id: &str) -> usize {
        self.queues
            .lock()
            .expect("registry mutex poisoned")
            .get(id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Overwrite the pending-response entry for `target_id`. At most one
    /// entry per device-id; a new pending overwrites the previous one.
    pub(crate) fn set_pending_response(&self, target_id: &str, client_id: &str) {
        let mut pending = self.pending_responses.lock().expect("registry mutex poisoned");
        pending.insert(target_id.to_string(), client_id.to_string());
    }

    pub(crate) fn take_pending_response(&self, device_id: &str) -> Option<String> {
        let mut pending = self.pending_responses.lock().expect("registry mutex poisoned");
        pending.remove(device_id)
    }

    pub fn waiting_client(&self, device_id: &str) -> Option<String> {
        self.pending_responses
            .lock()
            .expect("registry mutex poisoned")
            .get(device_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        sent: Arc<AtomicUsize>,
        fail: bool,
        closed: Arc<AtomicBool>,
    }

    impl CountingSink {
        fn new(sent: Arc<AtomicUsize>, fail: bool) -> Self {
            Self { sent, fail, closed: Arc::new(AtomicBool::new(false)) }
        }
    }

    impl DeliverySink for CountingSink {
        fn send(&self, _envelope: &OuterEnvelope) -> bool {
            if self.fail {
                return false;
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn envelope() -> OuterEnvelope {
        OuterEnvelope {
            device_id: "d1".into(),
            payload: "p".into(),
            signature: "s".into(),
            version: "1.0".into(),
            request_counter: None,
        }
    }

    #[test]
    fn register_drains_queue() {
        let registry = ConnectionRegistry::new();
        registry.enqueue("d1", envelope());
        registry.enqueue("d1", envelope());

        let sent = Arc::new(AtomicUsize::new(0));
        registry.register("d1", Box::new(CountingSink::new(sent.clone(), false)));

        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deregister_clears_presence_and_pending() {
        let registry = ConnectionRegistry::new();
        registry.set_pending_response("d1", "client_a");
        let epoch = registry.register("client_a", Box::new(CountingSink::new(Arc::new(AtomicUsize::new(0)), false)));

        assert!(registry.deregister("client_a", epoch));

        assert!(!registry.is_present("client_a"));
        assert_eq!(registry.waiting_client("d1"), None);
    }

    #[test]
    fn last_writer_wins_and_closes_the_displaced_sink() {
        let registry = ConnectionRegistry::new();
        let first = CountingSink::new(Arc::new(AtomicUsize::new(0)), false);
        let first_closed = first.closed.clone();
        let first_epoch = registry.register("d1", Box::new(first));

        let second_epoch = registry.register("d1", Box::new(CountingSink::new(Arc::new(AtomicUsize::new(0)), false)));

        assert_ne!(first_epoch, second_epoch);
        assert!(first_closed.load(Ordering::SeqCst));
        assert!(registry.is_present("d1"));
    }

    #[test]
    fn a_displaced_handlers_own_deregister_does_not_remove_the_newer_connection() {
        let registry = ConnectionRegistry::new();
        let first_epoch = registry.register("d1", Box::new(CountingSink::new(Arc::new(AtomicUsize::new(0)), false)));
        let second_epoch = registry.register("d1", Box::new(CountingSink::new(Arc::new(AtomicUsize::new(0)), false)));

        assert!(!registry.deregister("d1", first_epoch));
        assert!(registry.is_present("d1"));

        assert!(registry.deregister("d1", second_epoch));
        assert!(!registry.is_present("d1"));
    }

    #[test]
    fn remove_is_unconditional_and_closes_the_sink() {
        let registry = ConnectionRegistry::new();
        let sink = CountingSink::new(Arc::new(AtomicUsize::new(0)), false);
        let closed = sink.closed.clone();
        registry.register("d1", Box::new(sink));

        assert!(registry.remove("d1"));
        assert!(closed.load(Ordering::SeqCst));
        assert!(!registry.is_present("d1"));
        assert!(!registry.remove("d1"));
    }
}
