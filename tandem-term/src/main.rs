//! tandem-term: line-oriented terminal front end for tandem-sync.
//!
//! ## Usage
//!
//! ```bash
//! # Edit a document on a room server
//! tandem-term connect <document-id> --server ws://host:9090/sync --http http://host:9090
//!
//! # Two sessions on an in-process hub; typed lines go to the first
//! tandem-term demo
//! ```
//!
//! Each typed line is appended to the document. Lines starting with `/` are
//! commands: `/title <text>`, `/tags a,b`, `/offline`, `/online`, `/show`,
//! `/quit`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tandem_sync::{
    CaretTrigger, ConnectionPool, EditorSession, FileBaselineStore, HttpDocumentSource, MemoryHub,
    MonospaceLayout, OpenDocument, SessionBuilder, SessionEvent, SharedTextModel, SyncConfig,
    TextModel, UserProfile, WsConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "tandem-term")]
#[command(about = "Terminal editor for real-time document sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Edit a document on a room server
    Connect {
        /// Document id (room)
        document: String,
        /// WebSocket endpoint
        #[arg(long)]
        server: Option<String>,
        /// HTTP base for the readiness probe and document API
        #[arg(long)]
        http: Option<String>,
        #[arg(short, long, default_value = "anonymous")]
        user: String,
        #[arg(long, default_value = "")]
        email: String,
        /// Where offline baselines are kept
        #[arg(long, default_value = ".tandem")]
        baseline_dir: PathBuf,
    },
    /// Two sessions sharing an in-process hub
    Demo {
        #[arg(default_value = "demo")]
        document: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_json_file(path).context("loading config")?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Commands::Connect {
            document,
            server,
            http,
            user,
            email,
            baseline_dir,
        } => {
            if let Some(server) = server {
                config.server_url = server;
            }
            if let Some(http) = http {
                config.http_base = http;
            }
            let connector = WsConnector::new(&config)?;
            let documents = HttpDocumentSource::new(&config.http_base, config.probe_timeout())?;
            let pool = Arc::new(ConnectionPool::new(Arc::new(connector), &config));
            let model = SharedTextModel::new(TextModel::new(MonospaceLayout::default()));

            let session = SessionBuilder::new(config, pool, Arc::new(documents))
                .baselines(Arc::new(FileBaselineStore::new(baseline_dir)))
                .profile(UserProfile::new(user.clone(), email, user))
                .caret(Box::new(model.clone()))
                .open(OpenDocument {
                    document_id: document,
                    ..OpenDocument::default()
                })?;
            edit_loop(session, model).await
        }
        Commands::Demo { document } => {
            let hub = MemoryHub::new();
            let open = |name: &str, model: &SharedTextModel| {
                let pool = Arc::new(ConnectionPool::new(Arc::new(hub.clone()), &config));
                SessionBuilder::new(config.clone(), pool, Arc::new(hub.clone()))
                    .profile(UserProfile::new(name, format!("{name}@example.com"), name))
                    .caret(Box::new(model.clone()))
                    .open(OpenDocument {
                        document_id: document.clone(),
                        ..OpenDocument::default()
                    })
            };

            let model = SharedTextModel::default();
            let session = open("you", &model)?;
            let peer_model = SharedTextModel::default();
            let mut peer = open("peer", &peer_model)?;
            tokio::spawn(async move {
                while let Some(event) = peer.next_event().await {
                    apply_event(&peer_model, &event);
                    if let SessionEvent::RemoteText { content, .. } = &event {
                        println!("  peer sees: {content:?}");
                    }
                }
            });
            edit_loop(session, model).await
        }
    }
}

async fn edit_loop(mut session: EditorSession, model: SharedTextModel) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = session.status_changes();
    println!("client {}; type to edit, /quit to leave", session.client_id());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&session, &model, &line).await? {
                    break;
                }
            }
            Some(event) = session.next_event() => {
                apply_event(&model, &event);
                print_event(&event);
            }
            Ok(()) = status.changed() => {
                println!("[{}]", status.borrow_and_update().label());
            }
        }
    }

    session.close().await?;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(session: &EditorSession, model: &SharedTextModel, line: &str) -> Result<bool> {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return Ok(false),
        ("/title", title) => session.set_title(title).await?,
        ("/tags", tags) => {
            let tags = tags.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from);
            session.set_tags(tags.collect()).await?;
        }
        ("/offline", _) => session.set_online(false).await?,
        ("/online", _) => session.set_online(true).await?,
        ("/show", _) => println!("{}", model.lock().text()),
        _ => {
            let text = {
                let mut m = model.lock();
                let text = format!("{}{line}\n", m.text());
                m.set_text(text.clone());
                m.caret_to_end();
                text
            };
            session.edit(text).await?;
            session.caret_moved(CaretTrigger::KeyUp).await?;
        }
    }
    Ok(true)
}

fn apply_event(model: &SharedTextModel, event: &SessionEvent) {
    match event {
        SessionEvent::RemoteText { content, .. } => model.lock().set_text(content.clone()),
        SessionEvent::Divergence { server, .. } => model.lock().set_text(server.text.clone()),
        SessionEvent::RoomState(state) if !state.text.is_empty() => {
            let mut m = model.lock();
            if m.text().is_empty() {
                m.set_text(state.text.clone());
            }
        }
        _ => {}
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected => println!("* connected"),
        SessionEvent::Disconnected => println!("* disconnected"),
        SessionEvent::RemoteText { from, content, .. } => println!("* {from} wrote: {content:?}"),
        SessionEvent::RemoteTitle { title, .. } => println!("* title is now {title:?}"),
        SessionEvent::RemoteCursor(cursor) => {
            log::debug!("{} caret at {} ({}, {})", cursor.username, cursor.offset, cursor.x, cursor.y)
        }
        SessionEvent::PeerJoined(id) => println!("* {id} joined"),
        SessionEvent::PeerLeft(id) => println!("* {id} left"),
        SessionEvent::Divergence { server, .. } => {
            println!("* document changed while offline; now showing server copy:\n{}", server.text)
        }
        SessionEvent::RoomState(_) => {}
    }
}
