//! Tunnel session
//!
//! One WebSocket connection to the broker. The session waits for
//! `tunnel-ready`, then runs a receive loop on a detached task. Every
//! `http-request` frame is forwarded on its own task and the reply is queued
//! to a single writer task, so slow local calls never stall the loop.

use crate::config::TunnelConfig;
use crate::proxy::LocalForwarder;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use porthole_shared::protocol::{BrokerMessage, InboundRequestFrame};
use porthole_shared::{Error, Result};
use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Public endpoint assigned by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub url: String,
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Lifecycle of a session. Ready and forwarding are the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Forwarding,
    Closed,
}

/// Validate `config` and open a tunnel.
///
/// Resolves once the broker sends `tunnel-ready`. The session keeps
/// forwarding on a background task for as long as the connection lives.
pub async fn start(config: &serde_json::Value) -> Result<Tunnel> {
    let config = TunnelConfig::from_value(config)?;
    let active = TunnelSession::new(config).connect().await?;
    Ok(active.detach())
}

pub struct TunnelSession {
    config: TunnelConfig,
}

impl TunnelSession {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Connect and perform the handshake.
    ///
    /// Fails with [`Error::Connection`] if the broker cannot be reached or
    /// the connection ends before `tunnel-ready`.
    pub async fn connect(self) -> Result<ActiveTunnel> {
        let forwarder = LocalForwarder::new(self.config.port())
            .map_err(|e| Error::HttpClient(e.to_string()))?;

        let endpoint = Url::parse(&self.config.connect_url())
            .map_err(|e| Error::Connection(format!("invalid broker address: {}", e)))?;

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        info!(
            "Connecting to tunnel server at {}://{}",
            self.config.scheme(),
            self.config.domain()
        );

        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (write, mut read) = ws_stream.split();

        let url = wait_for_ready(&mut read).await?;
        info!("Tunnel ready: {} -> localhost:{}", url, self.config.port());
        state_tx.send_replace(SessionState::Forwarding);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let writer = tokio::spawn(write_frames(write, frames_rx));

            let requested = receive_frames(read, frames_tx, forwarder, shutdown_rx).await;
            if requested {
                let _ = writer.await;
            } else {
                writer.abort();
            }

            state_tx.send_replace(SessionState::Closed);
            info!("Tunnel connection closed");
        });

        Ok(ActiveTunnel {
            tunnel: Tunnel { url },
            state: state_rx,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// A tunnel whose receive loop is running.
///
/// Dropping it leaves the loop running, same as [`ActiveTunnel::detach`].
pub struct ActiveTunnel {
    tunnel: Tunnel,
    state: watch::Receiver<SessionState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ActiveTunnel {
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn url(&self) -> &str {
        &self.tunnel.url
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the broker connection is gone
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Send a close frame and wait for the session to wind down
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }

    pub fn detach(self) -> Tunnel {
        self.tunnel
    }
}

/// Frame payload of a data message, `None` for control frames
fn payload(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(data) => Some(data),
        _ => None,
    }
}

async fn wait_for_ready<S>(read: &mut S) -> Result<String>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| Error::Connection(e.to_string()))?;
        if let Message::Close(frame) = &msg {
            let reason = frame.as_ref().map(|f| f.reason.to_string()).unwrap_or_default();
            return Err(Error::Connection(format!(
                "broker closed the connection before the tunnel was ready: {}",
                reason
            )));
        }
        let Some(data) = payload(msg) else {
            continue;
        };

        match BrokerMessage::parse(&data) {
            Ok(BrokerMessage::TunnelReady { url }) => return Ok(url),
            Ok(BrokerMessage::HttpRequest(frame)) => {
                warn!("Dropping request {} received before tunnel-ready", frame.request_id)
            }
            Ok(BrokerMessage::Unknown) => debug!("Ignoring unknown message during handshake"),
            Err(e) => debug!("Ignoring malformed message during handshake: {}", e),
        }
    }

    Err(Error::Connection(
        "connection ended before the tunnel was ready".to_string(),
    ))
}

/// Returns true when the loop ended because shutdown was requested
async fn receive_frames<S>(
    mut read: S,
    frames: mpsc::UnboundedSender<Message>,
    forwarder: LocalForwarder,
    mut shutdown: oneshot::Receiver<()>,
) -> bool
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let mut shutdown_open = true;
    loop {
        tokio::select! {
            msg = read.next() => {
                // Pings are answered by tungstenite itself
                let data = match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Connection closed by broker");
                        return false;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return false;
                    }
                    Some(Ok(msg)) => match payload(msg) {
                        Some(data) => data,
                        None => continue,
                    },
                };

                match BrokerMessage::parse(&data) {
                    Ok(BrokerMessage::HttpRequest(frame)) => dispatch(frame, &forwarder, &frames),
                    Ok(BrokerMessage::TunnelReady { url }) => {
                        debug!("Ignoring repeated tunnel-ready for {}", url)
                    }
                    Ok(BrokerMessage::Unknown) => debug!("Ignoring unknown message kind"),
                    Err(e) => debug!("Ignoring malformed message: {}", e),
                }
            }
            requested = &mut shutdown, if shutdown_open => match requested {
                Ok(()) => {
                    info!("Shutting down tunnel");
                    let _ = frames.send(Message::Close(None));
                    return true;
                }
                // Handle dropped, keep forwarding
                Err(_) => shutdown_open = false,
            }
        }
    }
}

/// Forward one request on its own task and queue the reply
fn dispatch(
    frame: InboundRequestFrame,
    forwarder: &LocalForwarder,
    frames: &mpsc::UnboundedSender<Message>,
) {
    let forwarder = forwarder.clone();
    let frames = frames.clone();

    tokio::spawn(async move {
        debug!("Proxying {} {} ({})", frame.method, frame.path, frame.request_id);
        let response = forwarder.forward(frame).await;
        let request_id = response.request_id.clone();

        match response.into_message().encode() {
            Ok(json) => {
                if frames.send(Message::Text(json)).is_err() {
                    debug!("Connection gone, dropping response {}", request_id);
                }
            }
            Err(e) => error!("Failed to encode response {}: {}", request_id, e),
        }
    });
}

/// Sole writer of the connection. Stops after a close frame or a failed send.
async fn write_frames<S>(mut write: S, mut frames: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(msg) = frames.recv().await {
        let closing = msg.is_close();
        if let Err(e) = write.send(msg).await {
            warn!("Failed to send frame: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
}
