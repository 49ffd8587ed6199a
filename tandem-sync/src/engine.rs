//! The sans-IO sync engine.
//!
//! All behaviour funnels through [`SyncEngine::handle`]: one [`Input`] in, a
//! list of [`Command`]s out. The engine never sleeps, sends or touches disk;
//! the session driver executes its commands and feeds results back as inputs.
//! That makes the flush/ack race and echo suppression testable with nothing
//! but a clock.
//!
//! ```text
//!            ┌──────────── Input ────────────┐
//!            ▼                               │
//!      ┌───────────┐   Command::EmitWithAck  │
//!      │ SyncEngine│ ───────────────────────►│ driver ──► channel
//!      │           │   Command::Arm/Disarm   │        ──► timers
//!      │ batcher   │   Command::Fetch        │        ──► DocumentSource
//!      │ cursor    │   Command::SaveBaseline │        ──► BaselineStore
//!      │ resolver  │   Command::Notify       │        ──► application
//!      └───────────┘                         │
//! ```

use tokio::time::{Duration, Instant};

use crate::batcher::{AckOutcome, BatchAction, BatchPhase, ChangeBatcher, FlushId, FlushTicket, TitleChannel};
use crate::config::{SyncConfig, UserProfile};
use crate::cursor::{CaretTrigger, CursorTracker, RemoteCursors};
use crate::filter::EchoFilter;
use crate::layout::CaretSource;
use crate::protocol::{
    now_millis, ClientEvent, ClientId, CursorSnapshot, PersistSnapshot, RoomEvent, RoomState,
    ServerEvent, TextUpdatePayload,
};
use crate::resolver::{ConflictResolver, Resolution};
use crate::room::RoomMembership;
use crate::status::{StatusSignals, SyncStatus};
use crate::store::{OfflineBaseline, ServerDocument};

/// Supplies the authoritative persistable unit for a flush, decoupling the
/// engine from the concrete editor.
pub trait SnapshotProvider: Send {
    fn snapshot(&self) -> Option<PersistSnapshot>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Text debounce
    Flush,
    /// Caret coalescing window
    Cursor,
    /// Retry of a failed reconnection fetch
    Reconcile,
}

/// A document being opened in the editor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenDocument {
    pub document_id: String,
    pub text: String,
    pub title: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Open(OpenDocument),
    LocalEdit(String),
    TitleEdit(String),
    TagsChanged(Vec<String>),
    Caret(CaretTrigger),
    Timer(TimerKind),
    Ack { flush: FlushId, outcome: AckOutcome },
    Remote(RoomEvent),
    Connectivity(bool),
    ChannelReady,
    ChannelLost,
    BaselineRestored(OfflineBaseline),
    ServerFetched { document_id: String, server: ServerDocument },
    FetchFailed(String),
    Unmount,
}

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    RoomState(RoomState),
    RemoteText {
        from: ClientId,
        content: String,
        title: String,
        tags: Vec<String>,
    },
    RemoteTitle { from: ClientId, title: String },
    RemoteCursor(CursorSnapshot),
    PeerJoined(ClientId),
    /// Peer left; its cursor has been removed.
    PeerLeft(ClientId),
    /// Offline edits were discarded; the editor must show this copy.
    Divergence { document_id: String, server: ServerDocument },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Emit(ClientEvent),
    EmitWithAck { flush: FlushId, event: ClientEvent },
    Arm { timer: TimerKind, at: Instant },
    Disarm(TimerKind),
    SaveBaseline(OfflineBaseline),
    ClearBaseline(String),
    Fetch(String),
    Notify(SessionEvent),
}

pub struct SyncEngine {
    client_id: ClientId,
    profile: UserProfile,
    batcher: ChangeBatcher,
    title: TitleChannel,
    tags: Vec<String>,
    cursor: CursorTracker,
    remote_cursors: RemoteCursors,
    filter: EchoFilter,
    room: RoomMembership,
    resolver: ConflictResolver,
    caret: Box<dyn CaretSource>,
    snapshots: Option<Box<dyn SnapshotProvider>>,
    reconcile_retry: Duration,
    closed: bool,
}

impl SyncEngine {
    pub fn new(
        client_id: ClientId,
        profile: UserProfile,
        config: &SyncConfig,
        caret: Box<dyn CaretSource>,
    ) -> Self {
        Self {
            client_id,
            batcher: ChangeBatcher::new(config),
            title: TitleChannel::new(client_id),
            tags: Vec::new(),
            cursor: CursorTracker::new(client_id, profile.username.clone(), config),
            remote_cursors: RemoteCursors::new(client_id),
            filter: EchoFilter::new(client_id),
            room: RoomMembership::new(),
            resolver: ConflictResolver::new(),
            caret,
            snapshots: None,
            reconcile_retry: config.reconcile_retry(),
            closed: false,
            profile,
        }
    }

    /// Install a snapshot provider; without one flushes persist the text only.
    pub fn with_snapshot_provider(mut self, provider: Box<dyn SnapshotProvider>) -> Self {
        self.snapshots = Some(provider);
        self
    }

    /// Single dispatch entry point.
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Command> {
        if self.closed {
            log::trace!("engine closed; dropping {input:?}");
            return Vec::new();
        }
        match input {
            Input::Open(doc) => self.open(doc),
            Input::LocalEdit(text) => {
                let actions = self.batcher.on_edit(&text, now);
                self.apply_batch(actions)
            }
            Input::TitleEdit(title) => self.title_edit(&title),
            Input::TagsChanged(tags) => {
                self.tags = tags;
                if !self.batcher.is_online() {
                    self.batcher.mark_dirty();
                }
                Vec::new()
            }
            Input::Caret(trigger) => match self.cursor.on_trigger(trigger, now) {
                Some(at) => vec![Command::Arm { timer: TimerKind::Cursor, at }],
                None => Vec::new(),
            },
            Input::Timer(kind) => self.timer(kind, now),
            Input::Ack { flush, outcome } => {
                self.batcher.on_ack(flush, outcome);
                Vec::new()
            }
            Input::Remote(event) => self.remote(event, now),
            Input::Connectivity(online) => self.connectivity(online),
            Input::ChannelReady => {
                let mut cmds: Vec<Command> = self
                    .room
                    .connection_ready()
                    .into_iter()
                    .map(Command::Emit)
                    .collect();
                cmds.push(Command::Notify(SessionEvent::Connected));
                let actions = self.batcher.flush_now();
                cmds.extend(self.apply_batch(actions));
                cmds
            }
            Input::ChannelLost => {
                self.room.connection_lost();
                vec![Command::Notify(SessionEvent::Disconnected)]
            }
            Input::BaselineRestored(baseline) => match self.resolver.restore(baseline) {
                Some(document_id) => self.begin_reconcile(document_id),
                None => Vec::new(),
            },
            Input::ServerFetched { document_id, server } => self.fetched(&document_id, server),
            Input::FetchFailed(reason) => {
                if !self.resolver.is_reconciling() {
                    return Vec::new();
                }
                log::warn!("could not fetch server copy for reconciliation: {reason}");
                vec![Command::Arm {
                    timer: TimerKind::Reconcile,
                    at: now + self.reconcile_retry,
                }]
            }
            Input::Unmount => self.unmount(),
        }
    }

    fn open(&mut self, doc: OpenDocument) -> Vec<Command> {
        let switching = self.room.document() != Some(doc.document_id.as_str());
        let mut cmds: Vec<Command> = self
            .room
            .set_document(Some(&doc.document_id))
            .into_iter()
            .map(Command::Emit)
            .collect();
        if switching {
            self.remote_cursors.clear();
            self.cursor.reset();
        }
        let actions = self.batcher.adopt(&doc.text);
        cmds.extend(self.apply_batch(actions));
        self.title.adopt(&doc.title);
        self.tags = doc.tags;

        if switching {
            let was_reconciling = self.resolver.is_reconciling();
            let rebase = self.resolver.switch_document(&doc.document_id, &doc.text, now_millis());
            if let Some(old) = rebase.dropped {
                cmds.push(Command::ClearBaseline(old));
            }
            if let Some(baseline) = rebase.captured {
                cmds.push(Command::SaveBaseline(baseline));
            }
            if was_reconciling && !self.resolver.is_reconciling() {
                self.batcher.set_held(false);
                cmds.push(Command::Disarm(TimerKind::Reconcile));
            }
        }
        cmds
    }

    fn title_edit(&mut self, title: &str) -> Vec<Command> {
        let transmit = self.batcher.is_online() && !self.resolver.is_reconciling();
        let changed = self.title.title() != title;
        match (self.title.on_title(title, transmit), self.room.document()) {
            (Some(payload), Some(room_id)) => vec![Command::Emit(ClientEvent::TitleUpdate {
                room_id: room_id.to_owned(),
                payload,
            })],
            (None, _) if changed && !transmit => {
                // Rides along with the next flush once back online.
                self.batcher.mark_dirty();
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn timer(&mut self, kind: TimerKind, now: Instant) -> Vec<Command> {
        match kind {
            TimerKind::Flush => {
                let actions = self.batcher.on_timer(now);
                self.apply_batch(actions)
            }
            TimerKind::Cursor => {
                if !self.batcher.is_online() {
                    self.cursor.cancel();
                    return Vec::new();
                }
                let Some(room_id) = self.room.document().map(str::to_owned) else {
                    self.cursor.cancel();
                    return Vec::new();
                };
                match self.cursor.on_timer(now, self.caret.as_ref()) {
                    Some(cursor) => vec![Command::Emit(ClientEvent::CursorPosition { room_id, cursor })],
                    None => Vec::new(),
                }
            }
            TimerKind::Reconcile => match self.resolver.baseline() {
                Some(b) if self.resolver.is_reconciling() => vec![Command::Fetch(b.document_id.clone())],
                _ => Vec::new(),
            },
        }
    }

    fn remote(&mut self, RoomEvent { room_id, event }: RoomEvent, now: Instant) -> Vec<Command> {
        // The channel is shared with sessions in other rooms.
        if self.room.document() != Some(room_id.as_str()) {
            log::trace!("ignoring {} for room {room_id}", event.name());
            return Vec::new();
        }
        if !self.filter.admit(&event) {
            return Vec::new();
        }
        match event {
            ServerEvent::RoomState(state) => {
                let mut cmds = Vec::new();
                if !self.batcher.is_dirty() && !self.resolver.is_reconciling() && !state.text.is_empty() {
                    let actions = self.batcher.adopt(&state.text);
                    cmds.extend(self.apply_batch(actions));
                }
                cmds.push(Command::Notify(SessionEvent::RoomState(state)));
                cmds
            }
            ServerEvent::TextUpdate(payload) | ServerEvent::TextUpdateWithCursor(payload) => {
                let actions = self.batcher.adopt(&payload.content);
                let mut cmds = self.apply_batch(actions);
                self.title.adopt(&payload.title);
                self.tags = payload.tags.clone();
                cmds.push(Command::Notify(SessionEvent::RemoteText {
                    from: payload.client_id,
                    content: payload.content,
                    title: payload.title,
                    tags: payload.tags,
                }));
                // Content first, then the caret that moved with it.
                if let Some(cursor) = payload.cursor {
                    if self.remote_cursors.upsert(cursor.clone(), now) {
                        cmds.push(Command::Notify(SessionEvent::RemoteCursor(cursor)));
                    }
                }
                cmds
            }
            ServerEvent::TitleUpdate(payload) => {
                self.title.adopt(&payload.title);
                vec![Command::Notify(SessionEvent::RemoteTitle {
                    from: payload.client_id,
                    title: payload.title,
                })]
            }
            ServerEvent::CursorPosition(cursor) => {
                if self.remote_cursors.upsert(cursor.clone(), now) {
                    vec![Command::Notify(SessionEvent::RemoteCursor(cursor))]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::UserJoined(id) => vec![Command::Notify(SessionEvent::PeerJoined(id))],
            ServerEvent::UserLeft(id) => {
                self.remote_cursors.remove(&id);
                vec![Command::Notify(SessionEvent::PeerLeft(id))]
            }
        }
    }

    fn connectivity(&mut self, online: bool) -> Vec<Command> {
        if online == self.batcher.is_online() {
            return Vec::new();
        }
        if !online {
            log::info!("connectivity lost");
            let actions = self.batcher.set_online(false);
            let mut cmds = self.apply_batch(actions);
            if self.cursor.cancel() {
                cmds.push(Command::Disarm(TimerKind::Cursor));
            }
            if self.resolver.is_reconciling() {
                cmds.push(Command::Disarm(TimerKind::Reconcile));
            }
            let document_id = self.room.document().unwrap_or_default().to_owned();
            if let Some(baseline) = self.resolver.go_offline(&document_id, self.batcher.text(), now_millis()) {
                cmds.push(Command::SaveBaseline(baseline));
            }
            return cmds;
        }

        log::info!("connectivity restored");
        self.batcher.set_online(true);
        match self.resolver.go_online() {
            Some(document_id) => self.begin_reconcile(document_id),
            None => {
                let actions = self.batcher.flush_now();
                self.apply_batch(actions)
            }
        }
    }

    fn begin_reconcile(&mut self, document_id: String) -> Vec<Command> {
        let actions = self.batcher.set_held(true);
        let mut cmds = self.apply_batch(actions);
        cmds.push(Command::Fetch(document_id));
        cmds
    }

    fn fetched(&mut self, document_id: &str, server: ServerDocument) -> Vec<Command> {
        let Some(resolution) = self.resolver.on_fetched(document_id, &server) else {
            return Vec::new();
        };
        self.batcher.set_held(false);
        let document_id = document_id.to_owned();
        let mut cmds = vec![Command::ClearBaseline(document_id.clone())];
        if self.room.document() != Some(document_id.as_str()) {
            // The editor no longer shows this document; only the baseline goes.
            log::info!("reconciled {document_id} after the editor moved on");
            return cmds;
        }

        match resolution {
            Resolution::RemoteWins(server) => {
                let actions = self.batcher.adopt(&server.text);
                cmds.extend(self.apply_batch(actions));
                self.title.adopt(&server.title);
                self.tags = server.tags.clone();
                self.cursor.reset();
                cmds.push(Command::Notify(SessionEvent::Divergence { document_id, server }));
            }
            Resolution::LocalWins => {
                let actions = self.batcher.flush_now();
                cmds.extend(self.apply_batch(actions));
            }
        }
        cmds
    }

    fn unmount(&mut self) -> Vec<Command> {
        let mut cmds: Vec<Command> = self.room.unmount().into_iter().map(Command::Emit).collect();
        let actions = self.batcher.close();
        cmds.extend(self.apply_batch(actions));
        if self.cursor.cancel() {
            cmds.push(Command::Disarm(TimerKind::Cursor));
        }
        cmds.push(Command::Disarm(TimerKind::Reconcile));
        self.closed = true;
        cmds
    }

    fn apply_batch(&mut self, actions: Vec<BatchAction>) -> Vec<Command> {
        let mut cmds = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                BatchAction::Arm(at) => cmds.push(Command::Arm { timer: TimerKind::Flush, at }),
                BatchAction::Disarm => cmds.push(Command::Disarm(TimerKind::Flush)),
                BatchAction::Flush(ticket) => cmds.extend(self.flush(ticket)),
            }
        }
        cmds
    }

    fn flush(&mut self, ticket: FlushTicket) -> Vec<Command> {
        let Some(room_id) = self.room.document().map(str::to_owned) else {
            log::warn!("flush {} without an open document", ticket.id);
            self.batcher.on_ack(ticket.id, AckOutcome::Failed);
            return Vec::new();
        };
        let timestamp = now_millis();
        let persist_snapshot = self
            .snapshots
            .as_ref()
            .and_then(|p| p.snapshot())
            .unwrap_or_else(|| PersistSnapshot::text_only(ticket.text.clone(), timestamp));

        let cursor = self.cursor.snapshot_now(self.caret.as_ref());
        let mut cmds = Vec::new();
        if cursor.is_some() && self.cursor.cancel() {
            cmds.push(Command::Disarm(TimerKind::Cursor));
        }

        let payload = TextUpdatePayload {
            content: ticket.text,
            client_id: self.client_id,
            timestamp,
            document_id: room_id.clone(),
            user_id: self.profile.user_id.clone(),
            user_email: self.profile.user_email.clone(),
            title: self.title.title().to_owned(),
            tags: self.tags.clone(),
            persist_snapshot,
            cursor,
        };
        let event = if payload.cursor.is_some() {
            ClientEvent::TextUpdateWithCursor { room_id, payload }
        } else {
            ClientEvent::TextUpdate { room_id, payload }
        };
        log::debug!("flush {} via {}", ticket.id, event.name());
        cmds.push(Command::EmitWithAck { flush: ticket.id, event });
        cmds
    }

    pub fn status(&self) -> SyncStatus {
        StatusSignals {
            online: self.batcher.is_online(),
            dirty: self.batcher.is_dirty(),
            failed: self.batcher.has_failed(),
            in_flight: self.batcher.in_flight().is_some(),
            batching: self.batcher.deadline().is_some(),
            reconciling: self.resolver.is_reconciling(),
        }
        .project()
    }

    pub fn phase(&self) -> BatchPhase {
        self.batcher.phase()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn text(&self) -> &str {
        self.batcher.text()
    }

    pub fn title(&self) -> &str {
        self.title.title()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn remote_cursors(&self) -> &RemoteCursors {
        &self.remote_cursors
    }

    pub fn room(&self) -> &RoomMembership {
        &self.room
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn echoes_dropped(&self) -> u64 {
        self.filter.dropped()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
