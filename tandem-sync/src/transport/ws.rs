//! WebSocket transport.
//!
//! Frames are bincode-encoded [`Frame`]s carried in binary messages. Before
//! every connect the HTTP readiness endpoint is probed so an unreachable
//! server fails fast instead of hanging in the upgrade.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use super::{AckReceiver, Channel, ChannelCore, Connector};
use crate::config::SyncConfig;
use crate::error::TransportError;
use crate::protocol::{ClientEvent, ClientId, Frame, RoomEvent};

/// Connects to `server_url` after probing `probe_url`.
pub struct WsConnector {
    server_url: String,
    probe_url: String,
    timeout: Duration,
    event_buffer: usize,
    http: reqwest::Client,
}

impl WsConnector {
    pub fn new(config: &SyncConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| TransportError::ProbeFailed(e.to_string()))?;
        Ok(Self {
            server_url: config.server_url.clone(),
            probe_url: config.probe_url(),
            timeout: config.probe_timeout(),
            event_buffer: config.event_buffer,
            http,
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn probe(&self) -> Result<(), TransportError> {
        let response = self
            .http
            .get(&self.probe_url)
            .send()
            .await
            .map_err(|e| TransportError::ProbeFailed(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::ProbeFailed(format!(
                "{} answered {}",
                self.probe_url,
                response.status()
            )))
        }
    }

    async fn connect(&self, client_id: ClientId) -> Result<Arc<dyn Channel>, TransportError> {
        let (ws_stream, _) = tokio::time::timeout(
            self.timeout,
            tokio_tungstenite::connect_async(self.server_url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.timeout))?
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let core = Arc::new(ChannelCore::new(self.event_buffer));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

        // Writer task: forward the ordered outbound queue to the socket
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                let result = match outbound {
                    Outbound::Frame(frame) => match frame.encode() {
                        Ok(bytes) => ws_writer.send(Message::Binary(bytes.into())).await,
                        Err(e) => {
                            log::error!("dropping unencodable frame: {e}");
                            continue;
                        }
                    },
                    Outbound::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        out_tx
            .send(Outbound::Frame(Frame::Hello { client_id }))
            .map_err(|_| TransportError::ConnectionClosed)?;

        // Reader task: route events and acks until the socket ends
        let reader_core = core.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(Frame::Event(event)) => {
                            reader_core.publish(event);
                        }
                        Ok(Frame::Ack { seq, ack }) => {
                            reader_core.resolve_ack(seq, ack);
                        }
                        Ok(Frame::Ping) => {
                            let _ = pong_tx.send(Outbound::Frame(Frame::Pong));
                        }
                        Ok(Frame::Pong) => {}
                        Ok(other) => log::debug!("ignoring client-side frame {other:?}"),
                        Err(e) => log::warn!("undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("sync channel for {client_id} closed");
            reader_core.shut_down();
        });

        log::info!("sync channel connected to {} as {client_id}", self.server_url);
        Ok(Arc::new(WsChannel {
            client_id,
            core,
            out_tx,
        }))
    }
}

enum Outbound {
    Frame(Frame),
    Close,
}

pub struct WsChannel {
    client_id: ClientId,
    core: Arc<ChannelCore>,
    out_tx: mpsc::UnboundedSender<Outbound>,
}

impl WsChannel {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.core.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.out_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        self.send(Frame::Emit { seq: None, event })
    }

    fn emit_with_ack(&self, event: ClientEvent) -> Result<AckReceiver, TransportError> {
        let (seq, rx) = self.core.register_ack()?;
        self.send(Frame::Emit { seq: Some(seq), event })?;
        Ok(rx)
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<RoomEvent>, TransportError> {
        self.core.subscribe()
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    async fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close);
        self.core.shut_down();
    }
}
