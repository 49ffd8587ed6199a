//! Event channel abstraction.
//!
//! A [`Channel`] is one persistent, ordered, bidirectional connection shared
//! by every session of the process. Client events go out in the order they
//! are emitted; server events fan out to every subscriber.
//!
//! ```text
//! emit / emit_with_ack ──► ordered outbound queue ──► server
//! subscribe()          ◄── broadcast::Sender<RoomEvent> ◄── reader
//! ```
//!
//! Implementations:
//! - [`ws`] — WebSocket transport with an HTTP readiness probe
//! - [`memory`] — in-process hub used by tests and demos

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};

use crate::error::TransportError;
use crate::protocol::{Ack, ClientEvent, ClientId, RoomEvent};

/// Resolves with the server's acknowledgment. Errors when the channel goes
/// away before the ack arrives.
pub type AckReceiver = oneshot::Receiver<Option<Ack>>;

#[async_trait]
pub trait Channel: Send + Sync {
    fn client_id(&self) -> ClientId;

    /// Fire-and-forget emit.
    fn emit(&self, event: ClientEvent) -> Result<(), TransportError>;

    /// Emit and obtain a receiver for the server's acknowledgment. The event
    /// is queued before this returns, so ordering with [`emit`](Self::emit)
    /// is preserved.
    fn emit_with_ack(&self, event: ClientEvent) -> Result<AckReceiver, TransportError>;

    /// Receiver for server events. Yields `Closed` once the channel drops.
    fn subscribe(&self) -> Result<broadcast::Receiver<RoomEvent>, TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Establishes channels. One connector backs one [`ConnectionPool`](crate::connection::ConnectionPool).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Cheap idempotent readiness check run before every connect.
    async fn probe(&self) -> Result<(), TransportError>;

    async fn connect(&self, client_id: ClientId) -> Result<Arc<dyn Channel>, TransportError>;
}

/// State shared by a channel front end and its reader: server event fan-out
/// and outstanding acknowledgments.
pub(crate) struct ChannelCore {
    events: Mutex<Option<broadcast::Sender<RoomEvent>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Option<Ack>>>>,
    next_seq: AtomicU64,
    open: AtomicBool,
}

impl ChannelCore {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            events: Mutex::new(Some(sender)),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self) -> Result<broadcast::Receiver<RoomEvent>, TransportError> {
        lock(&self.events)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(TransportError::ConnectionClosed)
    }

    /// Deliver a server event to every subscriber. Returns receiver count.
    pub(crate) fn publish(&self, event: RoomEvent) -> usize {
        match lock(&self.events).as_ref() {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Allocate a sequence number and the receiver its ack will resolve.
    pub(crate) fn register_ack(&self) -> Result<(u64, AckReceiver), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(seq, tx);
        Ok((seq, rx))
    }

    pub(crate) fn resolve_ack(&self, seq: u64, ack: Option<Ack>) -> bool {
        match lock(&self.pending).remove(&seq) {
            Some(tx) => tx.send(ack).is_ok(),
            None => {
                log::debug!("ack for unknown seq {seq}");
                false
            }
        }
    }

    /// Mark closed. Subscribers observe `Closed`; outstanding acks error.
    pub(crate) fn shut_down(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            lock(&self.events).take();
            lock(&self.pending).clear();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;

    #[tokio::test]
    async fn test_core_resolves_acks_by_seq() {
        let core = ChannelCore::new(8);
        let (a, rx_a) = core.register_ack().unwrap();
        let (b, rx_b) = core.register_ack().unwrap();
        assert!(b > a);

        assert!(core.resolve_ack(b, Some(Ack { ok: true })));
        assert!(!core.resolve_ack(b, None));
        assert_eq!(rx_b.await.unwrap(), Some(Ack { ok: true }));

        core.shut_down();
        assert!(rx_a.await.is_err());
    }

    #[tokio::test]
    async fn test_shut_down_closes_subscribers() {
        let core = ChannelCore::new(8);
        let mut rx = core.subscribe().unwrap();
        assert_eq!(core.publish(RoomEvent::new("d", ServerEvent::UserLeft(ClientId::generate()))), 1);
        assert!(rx.recv().await.is_ok());

        core.shut_down();
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert!(core.subscribe().is_err());
        assert!(core.register_ack().is_err());
    }
}
