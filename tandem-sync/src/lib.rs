//! # tandem-sync — Real-time document sync for collaborative editors
//!
//! Keeps an editor's document consistent with a room server and with peers
//! editing the same document: batched text flushes, acknowledged persistence,
//! live cursor broadcast, and last-writer-wins reconciliation after offline
//! periods.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Input   ┌────────────┐  Command  ┌──────────────┐
//! │ EditorSession│ ───────► │ SyncEngine │ ────────► │ driver task  │
//! │ (per editor) │          │ (sans-IO)  │           │ timers / I/O │
//! └──────────────┘          └────────────┘           └──────┬───────┘
//!                                                           │
//!                         ┌─────────────────────────────────┤
//!                         ▼                                 ▼
//!                  ┌──────────────┐                 ┌──────────────┐
//!                  │ConnectionPool│ ── one per ──►  │ Channel      │
//!                  │ (shared)     │    process      │ ws / memory  │
//!                  └──────────────┘                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Room events and the bincode frame envelope
//! - [`batcher`] — Debounce/threshold flush policy and flush ids
//! - [`cursor`] — Caret coalescing and the remote cursor registry
//! - [`filter`] — Echo suppression by client id
//! - [`room`] — Deferred room join/leave
//! - [`resolver`] — Offline baseline and reconnection outcome
//! - [`status`] — Sync status projection and publisher
//! - [`engine`] — The single dispatch point tying the above together
//! - [`connection`] — Shared, ref-counted channel acquisition
//! - [`transport`] — Channel traits, WebSocket and in-process hub
//! - [`store`] — Baseline persistence and authoritative fetches
//! - [`session`] — tokio driver around the engine
//! - [`layout`] — Caret measurement sources
//!
//! ## Cadence
//!
//! | Trigger | Effect |
//! |---------|--------|
//! | 10+ net characters, or a completed word | flush now |
//! | any other edit | flush 500ms after the last edit |
//! | caret trigger | measure and broadcast after 50ms |
//! | title edit | sent at once, unbatched |

pub mod batcher;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod filter;
pub mod layout;
pub mod protocol;
pub mod resolver;
pub mod room;
pub mod session;
pub mod status;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use batcher::{AckOutcome, BatchPhase, ChangeBatcher, FlushId, TitleChannel};
pub use config::{SyncConfig, UserProfile, WordBoundaryPolicy};
pub use connection::ConnectionPool;
pub use cursor::{CaretTrigger, CursorColor, CursorTracker, RemoteCursor, RemoteCursors};
pub use engine::{Command, Input, OpenDocument, SessionEvent, SnapshotProvider, SyncEngine, TimerKind};
pub use error::{ProtocolError, StoreError, SyncError, TransportError};
pub use filter::EchoFilter;
pub use layout::{CaretSource, MonospaceLayout, NoCaret, Point, SharedTextModel, TextModel};
pub use protocol::{ClientEvent, ClientId, CursorSnapshot, PersistSnapshot, RoomEvent, ServerEvent};
pub use resolver::{ConflictResolver, Connectivity, Resolution};
pub use room::RoomMembership;
pub use session::{EditorSession, SessionBuilder};
pub use status::{StatusPublisher, SyncStatus};
pub use store::{
    BaselineStore, DocumentSource, FileBaselineStore, HttpDocumentSource, MemoryBaselineStore,
    OfflineBaseline, ServerDocument,
};
pub use transport::memory::{AckPolicy, MemoryHub};
pub use transport::ws::WsConnector;
pub use transport::{Channel, Connector};
