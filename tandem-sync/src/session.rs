//! Editor session: drives a [`SyncEngine`] against real I/O.
//!
//! One tokio task per session owns the engine. Everything the engine reacts
//! to (application calls, server events, timers, ack and fetch results) is
//! serialized through that task's `select!` loop, so no two engine inputs are
//! ever handled concurrently.
//!
//! ```text
//! EditorSession ──commands──► ┌────────────┐ ──emit──► Channel
//! Channel ───server events──► │ driver task│ ──spawn─► ack wait / fetch / store
//! spawned work ──internal───► │  (engine)  │ ──────► SessionEvent (mpsc)
//! timers ───────────────────► └────────────┘ ──────► SyncStatus (watch)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::batcher::AckOutcome;
use crate::config::{SyncConfig, UserProfile};
use crate::connection::ConnectionPool;
use crate::cursor::CaretTrigger;
use crate::engine::{Command, Input, OpenDocument, SessionEvent, SnapshotProvider, SyncEngine, TimerKind};
use crate::error::SyncError;
use crate::layout::{CaretSource, NoCaret};
use crate::protocol::{ClientId, RoomEvent};
use crate::status::{StatusPublisher, SyncStatus};
use crate::store::{BaselineStore, DocumentSource, MemoryBaselineStore};
use crate::transport::{AckReceiver, Channel};

enum SessionCommand {
    Input(Input),
    Close(oneshot::Sender<()>),
}

/// Results of work the driver spawned.
enum Internal {
    Input(Input),
    Acquired(Option<Arc<dyn Channel>>),
}

/// Builds an [`EditorSession`].
pub struct SessionBuilder {
    config: SyncConfig,
    pool: Arc<ConnectionPool>,
    documents: Arc<dyn DocumentSource>,
    baselines: Arc<dyn BaselineStore>,
    profile: UserProfile,
    caret: Box<dyn CaretSource>,
    snapshots: Option<Box<dyn SnapshotProvider>>,
}

impl SessionBuilder {
    pub fn new(config: SyncConfig, pool: Arc<ConnectionPool>, documents: Arc<dyn DocumentSource>) -> Self {
        Self {
            config,
            pool,
            documents,
            baselines: Arc::new(MemoryBaselineStore::new()),
            profile: UserProfile::default(),
            caret: Box::new(NoCaret),
            snapshots: None,
        }
    }

    pub fn baselines(mut self, baselines: Arc<dyn BaselineStore>) -> Self {
        self.baselines = baselines;
        self
    }

    pub fn profile(mut self, profile: UserProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn caret(mut self, caret: Box<dyn CaretSource>) -> Self {
        self.caret = caret;
        self
    }

    pub fn snapshots(mut self, provider: Box<dyn SnapshotProvider>) -> Self {
        self.snapshots = Some(provider);
        self
    }

    /// Mount `document` and start syncing it. Must be called inside a tokio
    /// runtime.
    pub fn open(self, document: OpenDocument) -> Result<EditorSession, SyncError> {
        self.config.validate()?;
        if document.document_id.is_empty() {
            return Err(SyncError::EmptyDocumentId);
        }

        let client_id = self.pool.client_id();
        let mut engine = SyncEngine::new(client_id, self.profile, &self.config, self.caret);
        if let Some(provider) = self.snapshots {
            engine = engine.with_snapshot_provider(provider);
        }

        let (command_tx, command_rx) = mpsc::channel(self.config.event_buffer);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let status = StatusPublisher::new();
        let status_rx = status.subscribe();

        let driver = Driver {
            engine,
            pool: self.pool,
            documents: self.documents,
            baselines: self.baselines,
            status,
            events: event_tx,
            internal_tx,
            internal_rx,
            channel: None,
            server_rx: None,
            acquiring: false,
            timers: HashMap::new(),
            reconnect_at: None,
            ack_timeout: self.config.ack_timeout(),
            reconnect: self.config.reconnect(),
        };
        let task = tokio::spawn(driver.run(document, command_rx));

        Ok(EditorSession {
            client_id,
            commands: command_tx,
            events: event_rx,
            status: status_rx,
            task: Some(task),
        })
    }
}

/// Handle to a running session. Dropping it unmounts the document.
pub struct EditorSession {
    client_id: ClientId,
    commands: mpsc::Sender<SessionCommand>,
    events: mpsc::Receiver<SessionEvent>,
    status: watch::Receiver<SyncStatus>,
    task: Option<JoinHandle<()>>,
}

impl EditorSession {
    async fn send(&self, input: Input) -> Result<(), SyncError> {
        self.commands
            .send(SessionCommand::Input(input))
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Report the full editor text after a local edit.
    pub async fn edit(&self, text: impl Into<String>) -> Result<(), SyncError> {
        self.send(Input::LocalEdit(text.into())).await
    }

    pub async fn set_title(&self, title: impl Into<String>) -> Result<(), SyncError> {
        self.send(Input::TitleEdit(title.into())).await
    }

    pub async fn set_tags(&self, tags: Vec<String>) -> Result<(), SyncError> {
        self.send(Input::TagsChanged(tags)).await
    }

    pub async fn caret_moved(&self, trigger: CaretTrigger) -> Result<(), SyncError> {
        self.send(Input::Caret(trigger)).await
    }

    /// Host connectivity signal (network up / down).
    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        self.send(Input::Connectivity(online)).await
    }

    /// Switch the editor to another document.
    pub async fn switch_document(&self, document: OpenDocument) -> Result<(), SyncError> {
        if document.document_id.is_empty() {
            return Err(SyncError::EmptyDocumentId);
        }
        self.send(Input::Open(document)).await
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Next notification; `None` once the session has stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Unmount: leave the room, cancel timers, release the channel.
    pub async fn close(mut self) -> Result<(), SyncError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Close(done_tx))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        let _ = done_rx.await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

struct Driver {
    engine: SyncEngine,
    pool: Arc<ConnectionPool>,
    documents: Arc<dyn DocumentSource>,
    baselines: Arc<dyn BaselineStore>,
    status: StatusPublisher,
    events: mpsc::Sender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    channel: Option<Arc<dyn Channel>>,
    server_rx: Option<broadcast::Receiver<RoomEvent>>,
    acquiring: bool,
    timers: HashMap<TimerKind, Instant>,
    reconnect_at: Option<Instant>,
    ack_timeout: Option<Duration>,
    reconnect: Duration,
}

impl Driver {
    async fn run(mut self, document: OpenDocument, mut commands: mpsc::Receiver<SessionCommand>) {
        let document_id = document.document_id.clone();
        self.dispatch(Input::Open(document));
        match self.baselines.load(&document_id).await {
            Ok(Some(baseline)) => {
                log::info!("restoring offline baseline for {document_id}");
                self.dispatch(Input::BaselineRestored(baseline));
            }
            Ok(None) => {}
            Err(e) => log::warn!("could not load baseline for {document_id}: {e}"),
        }
        self.request_channel();

        loop {
            let deadline = self.next_deadline();
            let wake_at = deadline.map(|(_, at)| at).unwrap_or_else(far_future);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Input(input)) => {
                        if input == Input::Connectivity(true) {
                            self.request_channel();
                        }
                        self.dispatch(input);
                    }
                    Some(SessionCommand::Close(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                event = recv_server(&mut self.server_rx) => match event {
                    Ok(event) => self.dispatch(Input::Remote(event)),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("session lagged behind the channel; {skipped} server events lost");
                    }
                    Err(RecvError::Closed) => self.channel_lost(),
                },
                _ = sleep_until(wake_at), if deadline.is_some() => {
                    if let Some((wake, _)) = deadline {
                        self.on_deadline(wake);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, input: Input) {
        let commands = self.engine.handle(input, Instant::now());
        for command in commands {
            self.execute(command);
        }
        self.status.publish(self.engine.status());
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Emit(event) => match &self.channel {
                Some(channel) => {
                    if let Err(e) = channel.emit(event) {
                        log::warn!("emit failed: {e}");
                    }
                }
                None => log::debug!("no channel; dropping {}", event.name()),
            },
            Command::EmitWithAck { flush, event } => {
                let receiver = match &self.channel {
                    Some(channel) => channel.emit_with_ack(event).map_err(|e| e.to_string()),
                    None => Err("no channel".to_string()),
                };
                match receiver {
                    Ok(receiver) => self.await_ack(flush, receiver),
                    Err(reason) => {
                        log::warn!("flush {flush} not sent: {reason}");
                        self.feed(Input::Ack { flush, outcome: AckOutcome::Failed });
                    }
                }
            }
            Command::Arm { timer, at } => {
                self.timers.insert(timer, at);
            }
            Command::Disarm(timer) => {
                self.timers.remove(&timer);
            }
            Command::SaveBaseline(baseline) => {
                let store = self.baselines.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.save(&baseline).await {
                        log::error!("could not persist baseline for {}: {e}", baseline.document_id);
                    }
                });
            }
            Command::ClearBaseline(document_id) => {
                let store = self.baselines.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.clear(&document_id).await {
                        log::warn!("could not clear baseline for {document_id}: {e}");
                    }
                });
            }
            Command::Fetch(document_id) => {
                let documents = self.documents.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let input = match documents.fetch(&document_id).await {
                        Ok(server) => Input::ServerFetched { document_id, server },
                        Err(e) => Input::FetchFailed(e.to_string()),
                    };
                    let _ = tx.send(Internal::Input(input));
                });
            }
            Command::Notify(event) => {
                if let Err(e) = self.events.try_send(event) {
                    log::warn!("session event dropped: {e}");
                }
            }
        }
    }

    fn await_ack(&self, flush: crate::batcher::FlushId, receiver: AckReceiver) {
        let tx = self.internal_tx.clone();
        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, receiver).await {
                    Ok(Ok(ack)) => AckOutcome::from_ack(ack),
                    Ok(Err(_)) => AckOutcome::Failed,
                    Err(_) => {
                        log::warn!("flush {flush} unacknowledged after {limit:?}");
                        AckOutcome::Failed
                    }
                },
                None => match receiver.await {
                    Ok(ack) => AckOutcome::from_ack(ack),
                    Err(_) => AckOutcome::Failed,
                },
            };
            let _ = tx.send(Internal::Input(Input::Ack { flush, outcome }));
        });
    }

    fn feed(&self, input: Input) {
        let _ = self.internal_tx.send(Internal::Input(input));
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Input(input) => self.dispatch(input),
            Internal::Acquired(channel) => {
                self.acquiring = false;
                match channel {
                    Some(channel) => self.attach(channel),
                    None => self.schedule_reconnect(),
                }
            }
        }
    }

    fn attach(&mut self, channel: Arc<dyn Channel>) {
        match channel.subscribe() {
            Ok(rx) => {
                self.server_rx = Some(rx);
                self.channel = Some(channel);
                self.reconnect_at = None;
                self.dispatch(Input::ChannelReady);
            }
            Err(e) => {
                log::warn!("channel closed before subscribe: {e}");
                self.release_in_background();
                self.schedule_reconnect();
            }
        }
    }

    fn channel_lost(&mut self) {
        log::info!("sync channel lost");
        self.server_rx = None;
        if self.channel.take().is_some() {
            self.release_in_background();
        }
        self.dispatch(Input::ChannelLost);
        self.schedule_reconnect();
    }

    fn request_channel(&mut self) {
        if self.channel.is_some() || self.acquiring {
            return;
        }
        self.acquiring = true;
        self.reconnect_at = None;
        let pool = self.pool.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let channel = pool.acquire().await;
            let _ = tx.send(Internal::Acquired(channel));
        });
    }

    fn schedule_reconnect(&mut self) {
        if self.channel.is_none() && !self.acquiring {
            self.reconnect_at = Some(Instant::now() + self.reconnect);
        }
    }

    fn release_in_background(&self) {
        let pool = self.pool.clone();
        tokio::spawn(async move { pool.release().await });
    }

    fn next_deadline(&self) -> Option<(Wake, Instant)> {
        let timers = self.timers.iter().map(|(kind, at)| (Wake::Timer(*kind), *at));
        let reconnect = self.reconnect_at.map(|at| (Wake::Reconnect, at));
        timers.chain(reconnect).min_by_key(|(_, at)| *at)
    }

    fn on_deadline(&mut self, wake: Wake) {
        match wake {
            Wake::Timer(kind) => {
                self.timers.remove(&kind);
                self.dispatch(Input::Timer(kind));
            }
            Wake::Reconnect => {
                self.reconnect_at = None;
                self.request_channel();
            }
        }
    }

    async fn shutdown(&mut self) {
        self.dispatch(Input::Unmount);
        self.timers.clear();
        self.reconnect_at = None;
        self.server_rx = None;

        // An acquisition in flight still holds a pool reference.
        while self.acquiring {
            match self.internal_rx.recv().await {
                Some(Internal::Acquired(channel)) => {
                    self.acquiring = false;
                    if channel.is_some() {
                        self.pool.release().await;
                    }
                }
                Some(Internal::Input(_)) => {}
                None => break,
            }
        }
        if self.channel.take().is_some() {
            self.pool.release().await;
        }
        log::debug!("session closed");
    }
}

#[derive(Debug, Clone, Copy)]
enum Wake {
    Timer(TimerKind),
    Reconnect,
}

async fn recv_server(rx: &mut Option<broadcast::Receiver<RoomEvent>>) -> Result<RoomEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
