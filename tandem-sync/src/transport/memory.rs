//! In-process room server.
//!
//! [`MemoryHub`] plays the server side of the protocol without a socket: it
//! routes room events between channels, answers acknowledgments according to
//! an [`AckPolicy`], and keeps the authoritative copy of every document so it
//! can double as a [`DocumentSource`]. Like a real room server it echoes
//! broadcasts back to their sender.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};

use super::{AckReceiver, Channel, ChannelCore, Connector};
use crate::error::{StoreError, TransportError};
use crate::protocol::{Ack, ClientEvent, ClientId, RoomEvent, RoomState, ServerEvent};
use crate::store::{DocumentSource, ServerDocument};

/// How the hub answers `emit_with_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Persist, broadcast and ack `{ ok: true }`.
    Accept,
    /// Refuse: nothing is stored or broadcast, ack `{ ok: false }`.
    Reject,
    /// Persist and broadcast, ack without a body.
    Silent,
    /// Persist and broadcast, never ack.
    Hang,
}

#[derive(Default)]
struct Room {
    members: BTreeSet<ClientId>,
    formatting: String,
}

struct HubState {
    rooms: HashMap<String, Room>,
    clients: HashMap<ClientId, Arc<ChannelCore>>,
    documents: HashMap<String, ServerDocument>,
    emitted: Vec<(ClientId, ClientEvent)>,
    policy: AckPolicy,
}

struct HubInner {
    state: Mutex<HubState>,
    reachable: AtomicBool,
    connects: AtomicUsize,
    event_buffer: usize,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_buffer(256)
    }

    pub fn with_buffer(event_buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    rooms: HashMap::new(),
                    clients: HashMap::new(),
                    documents: HashMap::new(),
                    emitted: Vec::new(),
                    policy: AckPolicy::Accept,
                }),
                reachable: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                event_buffer,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_ack_policy(&self, policy: AckPolicy) {
        self.state().policy = policy;
    }

    /// Simulate the server going away or coming back. Going unreachable
    /// drops every connected channel.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::Release);
        if !reachable {
            let clients: Vec<ClientId> = self.state().clients.keys().copied().collect();
            for client in clients {
                self.disconnect(client);
            }
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::Acquire)
    }

    /// Server-side drop of one client; peers in its rooms see it leave.
    pub fn disconnect(&self, client: ClientId) {
        let mut state = self.state();
        if let Some(core) = state.clients.remove(&client) {
            core.shut_down();
        }
        let rooms: Vec<String> = state
            .rooms
            .iter()
            .filter(|(_, room)| room.members.contains(&client))
            .map(|(id, _)| id.clone())
            .collect();
        for room_id in rooms {
            Self::leave(&mut state, &room_id, client);
        }
    }

    /// Write the authoritative copy directly, as another client persisting
    /// through the document API would.
    pub fn put_document(&self, document_id: &str, document: ServerDocument) {
        self.state().documents.insert(document_id.to_owned(), document);
    }

    pub fn document(&self, document_id: &str) -> Option<ServerDocument> {
        self.state().documents.get(document_id).cloned()
    }

    /// Every client event the hub has received, in arrival order.
    pub fn emitted(&self) -> Vec<(ClientId, ClientEvent)> {
        self.state().emitted.clone()
    }

    pub fn members(&self, room_id: &str) -> Vec<ClientId> {
        self.state()
            .rooms
            .get(room_id)
            .map(|room| room.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of successful connects so far.
    pub fn connections(&self) -> usize {
        self.inner.connects.load(Ordering::Acquire)
    }

    fn leave(state: &mut HubState, room_id: &str, client: ClientId) {
        let Some(room) = state.rooms.get_mut(room_id) else {
            return;
        };
        if !room.members.remove(&client) {
            return;
        }
        let members: Vec<ClientId> = room.members.iter().copied().collect();
        if members.is_empty() {
            state.rooms.remove(room_id);
        }
        Self::fan_out(state, room_id, &members, ServerEvent::UserLeft(client));
    }

    fn fan_out(state: &HubState, room_id: &str, members: &[ClientId], event: ServerEvent) {
        let event = RoomEvent::new(room_id, event);
        for member in members {
            if let Some(core) = state.clients.get(member) {
                core.publish(event.clone());
            }
        }
    }

    /// Apply one client event. Returns false when it was refused.
    fn dispatch(&self, from: ClientId, event: ClientEvent, acked: bool) -> bool {
        let mut state = self.state();
        state.emitted.push((from, event.clone()));
        if acked && state.policy == AckPolicy::Reject {
            return false;
        }

        match event {
            ClientEvent::JoinRoom { room_id } => {
                let text = state
                    .documents
                    .get(&room_id)
                    .map(|d| d.text.clone())
                    .unwrap_or_default();
                let room = state.rooms.entry(room_id.clone()).or_default();
                let others: Vec<ClientId> = room.members.iter().copied().collect();
                room.members.insert(from);
                let room_state = RoomState {
                    events: Vec::new(),
                    text,
                    formatting: room.formatting.clone(),
                };
                if let Some(core) = state.clients.get(&from) {
                    core.publish(RoomEvent::new(room_id.as_str(), ServerEvent::RoomState(room_state)));
                }
                Self::fan_out(&state, &room_id, &others, ServerEvent::UserJoined(from));
            }
            ClientEvent::LeaveRoom { room_id } => Self::leave(&mut state, &room_id, from),
            ClientEvent::TextUpdate { room_id, payload }
            | ClientEvent::TextUpdateWithCursor { room_id, payload } => {
                let document = state.documents.entry(room_id.clone()).or_default();
                document.text = payload.content.clone();
                document.title = payload.title.clone();
                document.tags = payload.tags.clone();
                if let Some(room) = state.rooms.get_mut(&room_id) {
                    room.formatting = payload.persist_snapshot.formatting.clone();
                }
                let event = if payload.cursor.is_some() {
                    ServerEvent::TextUpdateWithCursor(payload)
                } else {
                    ServerEvent::TextUpdate(payload)
                };
                let members = Self::room_members(&state, &room_id);
                Self::fan_out(&state, &room_id, &members, event);
            }
            ClientEvent::TitleUpdate { room_id, payload } => {
                state.documents.entry(room_id.clone()).or_default().title = payload.title.clone();
                let members = Self::room_members(&state, &room_id);
                Self::fan_out(&state, &room_id, &members, ServerEvent::TitleUpdate(payload));
            }
            ClientEvent::CursorPosition { room_id, cursor } => {
                let members = Self::room_members(&state, &room_id);
                Self::fan_out(&state, &room_id, &members, ServerEvent::CursorPosition(cursor));
            }
        }
        true
    }

    fn room_members(state: &HubState, room_id: &str) -> Vec<ClientId> {
        state
            .rooms
            .get(room_id)
            .map(|room| room.members.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryHub {
    async fn probe(&self) -> Result<(), TransportError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(TransportError::ProbeFailed("hub unreachable".into()))
        }
    }

    async fn connect(&self, client_id: ClientId) -> Result<Arc<dyn Channel>, TransportError> {
        if !self.is_reachable() {
            return Err(TransportError::ConnectFailed("hub unreachable".into()));
        }
        // Yield like a real handshake would, so concurrent connects interleave.
        tokio::task::yield_now().await;

        let core = Arc::new(ChannelCore::new(self.inner.event_buffer));
        if let Some(stale) = self.state().clients.insert(client_id, core.clone()) {
            stale.shut_down();
        }
        self.inner.connects.fetch_add(1, Ordering::AcqRel);
        log::debug!("memory hub accepted {client_id}");
        Ok(Arc::new(MemoryChannel {
            client_id,
            core,
            hub: self.clone(),
        }))
    }
}

#[async_trait]
impl DocumentSource for MemoryHub {
    async fn fetch(&self, document_id: &str) -> Result<ServerDocument, StoreError> {
        if !self.is_reachable() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "hub unreachable",
            )));
        }
        self.document(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_owned()))
    }
}

pub struct MemoryChannel {
    client_id: ClientId,
    core: Arc<ChannelCore>,
    hub: MemoryHub,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        if !self.core.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.hub.dispatch(self.client_id, event, false);
        Ok(())
    }

    fn emit_with_ack(&self, event: ClientEvent) -> Result<AckReceiver, TransportError> {
        if !self.core.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let policy = self.hub.state().policy;
        let accepted = self.hub.dispatch(self.client_id, event, true);
        let ack = match policy {
            AckPolicy::Hang => return self.core.register_ack().map(|(_, rx)| rx),
            AckPolicy::Silent => None,
            _ => Some(Ack { ok: accepted }),
        };
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(ack);
        Ok(rx)
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<RoomEvent>, TransportError> {
        self.core.subscribe()
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    async fn close(&self) {
        if self.core.is_open() {
            self.hub.disconnect(self.client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PersistSnapshot, TextUpdatePayload};

    fn update(room: &str, from: ClientId, text: &str) -> ClientEvent {
        ClientEvent::TextUpdate {
            room_id: room.into(),
            payload: TextUpdatePayload {
                content: text.into(),
                client_id: from,
                timestamp: 1,
                document_id: room.into(),
                user_id: "u".into(),
                user_email: String::new(),
                title: "T".into(),
                tags: vec![],
                persist_snapshot: PersistSnapshot::text_only(text, 1),
                cursor: None,
            },
        }
    }

    #[tokio::test]
    async fn test_join_sends_room_state_and_announces() {
        let hub = MemoryHub::new();
        hub.put_document("d", ServerDocument { text: "seed".into(), ..Default::default() });
        let (a, b) = (ClientId::generate(), ClientId::generate());
        let ch_a = hub.connect(a).await.unwrap();
        let ch_b = hub.connect(b).await.unwrap();
        let mut rx_a = ch_a.subscribe().unwrap();
        let mut rx_b = ch_b.subscribe().unwrap();

        ch_a.emit(ClientEvent::JoinRoom { room_id: "d".into() }).unwrap();
        match rx_a.recv().await.unwrap().event {
            ServerEvent::RoomState(state) => assert_eq!(state.text, "seed"),
            other => panic!("unexpected {other:?}"),
        }

        ch_b.emit(ClientEvent::JoinRoom { room_id: "d".into() }).unwrap();
        assert!(matches!(rx_b.recv().await.unwrap().event, ServerEvent::RoomState(_)));
        assert_eq!(rx_a.recv().await.unwrap(), RoomEvent::new("d", ServerEvent::UserJoined(b)));
        assert_eq!(hub.members("d").len(), 2);
    }

    #[tokio::test]
    async fn test_text_update_echoes_and_persists() {
        let hub = MemoryHub::new();
        let a = ClientId::generate();
        let ch = hub.connect(a).await.unwrap();
        let mut rx = ch.subscribe().unwrap();
        ch.emit(ClientEvent::JoinRoom { room_id: "d".into() }).unwrap();
        rx.recv().await.unwrap();

        let ack = ch.emit_with_ack(update("d", a, "hello ")).unwrap().await.unwrap();
        assert_eq!(ack, Some(Ack { ok: true }));
        assert_eq!(rx.recv().await.unwrap().event.origin(), Some(a));
        assert_eq!(hub.fetch("d").await.unwrap().text, "hello ");
    }

    #[tokio::test]
    async fn test_reject_stores_nothing() {
        let hub = MemoryHub::new();
        hub.set_ack_policy(AckPolicy::Reject);
        let a = ClientId::generate();
        let ch = hub.connect(a).await.unwrap();
        let ack = ch.emit_with_ack(update("d", a, "x")).unwrap().await.unwrap();
        assert_eq!(ack, Some(Ack { ok: false }));
        assert!(matches!(hub.fetch("d").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_hang_errors_when_disconnected() {
        let hub = MemoryHub::new();
        hub.set_ack_policy(AckPolicy::Hang);
        let a = ClientId::generate();
        let ch = hub.connect(a).await.unwrap();
        let rx = ch.emit_with_ack(update("d", a, "x")).unwrap();
        hub.set_reachable(false);
        assert!(rx.await.is_err());
        assert!(!ch.is_open());
        assert!(hub.connect(a).await.is_err());
    }

    #[tokio::test]
    async fn test_close_announces_user_left() {
        let hub = MemoryHub::new();
        let (a, b) = (ClientId::generate(), ClientId::generate());
        let ch_a = hub.connect(a).await.unwrap();
        let ch_b = hub.connect(b).await.unwrap();
        let mut rx_b = ch_b.subscribe().unwrap();
        ch_b.emit(ClientEvent::JoinRoom { room_id: "d".into() }).unwrap();
        ch_a.emit(ClientEvent::JoinRoom { room_id: "d".into() }).unwrap();

        ch_a.close().await;
        let mut seen = Vec::new();
        while let Ok(event) = rx_b.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.last(), Some(&RoomEvent::new("d", ServerEvent::UserLeft(a))));
        assert_eq!(hub.members("d"), vec![b]);
    }
}
