use crate::protocol::{Message, MessageKind, WS_PATH};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsLink = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("link closed while sending")]
    LinkClosed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    Disconnected,
    ClipboardReceived(String),
}

/// Outbound connection manager: keeps at most one live link to a hub,
/// reconnecting on a fixed delay for as long as the reconnect policy is
/// armed, and pinging the hub every 30 seconds while connected.
#[derive(Clone)]
pub struct Peer {
    server_addr: Arc<Mutex<String>>,
    reconnect: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    retry_loop_alive: Arc<AtomicBool>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
    disconnect: Arc<Notify>,
    events: mpsc::Sender<PeerEvent>,
}

impl Peer {
    /// The receiver carries connect/disconnect transitions and received
    /// clipboard content; subscribe by keeping it before calling
    /// [`Peer::connect`].
    pub fn new() -> (Self, mpsc::Receiver<PeerEvent>) {
        let (events, events_rx) = mpsc::channel(32);
        let peer = Self {
            server_addr: Arc::new(Mutex::new(String::new())),
            reconnect: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            retry_loop_alive: Arc::new(AtomicBool::new(false)),
            outbound: Arc::new(Mutex::new(None)),
            disconnect: Arc::new(Notify::new()),
            events,
        };
        (peer, events_rx)
    }

    /// Record the hub address, arm the reconnect policy, and launch the
    /// connect-retry loop. Returns immediately; dial failures surface only
    /// through logs and [`PeerEvent::Disconnected`]. No-op while connected.
    pub async fn connect(&self, addr: impl Into<String>) {
        if self.connected.load(Ordering::SeqCst) {
            return;
        }
        *self.server_addr.lock().await = addr.into();
        self.reconnect.store(true, Ordering::SeqCst);
        if self.retry_loop_alive.swap(true, Ordering::SeqCst) {
            // an earlier loop is still winding down; it picks up the
            // re-armed policy and the new address on its next pass
            return;
        }

        let peer = self.clone();
        tokio::spawn(async move {
            loop {
                peer.retry_loop().await;
                peer.retry_loop_alive.store(false, Ordering::SeqCst);
                // a connect() that re-armed the policy while this loop was
                // exiting takes over here instead of spawning a second one
                if peer.reconnect.load(Ordering::SeqCst)
                    && !peer.retry_loop_alive.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                break;
            }
        });
    }

    /// Disarm the reconnect policy and close any active link. Idempotent.
    pub fn disconnect(&self) {
        if self.reconnect.swap(false, Ordering::SeqCst) {
            self.disconnect.notify_one();
            info!("disconnect requested");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a clipboard frame on the active link. Silently succeeds without
    /// any I/O while disconnected: delivery here is best-effort by design.
    pub async fn send_clipboard(&self, content: &str, source: &str) -> Result<(), PeerError> {
        let guard = self.outbound.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Ok(());
        };
        let frame = WsMessage::Text(Message::clipboard(content, source).encode());
        tx.send(frame).map_err(|_| PeerError::LinkClosed)
    }

    async fn retry_loop(&self) {
        loop {
            if !self.reconnect.load(Ordering::SeqCst) {
                break;
            }
            let addr = self.server_addr.lock().await.clone();
            let url = format!("ws://{addr}{WS_PATH}");
            info!(%url, "connecting to hub");

            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(%addr, "connected to hub");
                    self.run_link(ws).await;
                    if self.reconnect.load(Ordering::SeqCst) {
                        info!(delay_secs = RECONNECT_DELAY.as_secs(), "link lost, will retry");
                        self.backoff().await;
                    }
                }
                Err(e) => {
                    warn!(%addr, error = %e, "connection failed, retrying");
                    self.backoff().await;
                }
            }
        }
        debug!("connect-retry loop ended");
    }

    /// Wait out the reconnect delay, cancellable by [`Peer::disconnect`].
    async fn backoff(&self) {
        let delay = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                _ = self.disconnect.notified() => {
                    if !self.reconnect.load(Ordering::SeqCst) {
                        break;
                    }
                    // stale permit from a previous disconnect; keep waiting
                }
            }
        }
    }

    /// Drive one established link until it drops or a disconnect arrives.
    async fn run_link(&self, mut ws: WsLink) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.outbound.lock().await = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(PeerEvent::Connected).await;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        // interval fires immediately; the first real ping comes one period in
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.disconnect.notified() => {
                    if self.reconnect.load(Ordering::SeqCst) {
                        // stale permit; the link stays up
                        continue;
                    }
                    let _ = ws.close(None).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    let ping = WsMessage::Text(Message::ping().encode());
                    if ws.send(ping).await.is_err() {
                        // the read half observes the broken link on its own
                        debug!("heartbeat failed");
                        break;
                    }
                }
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = ws.send(frame).await {
                            warn!(error = %e, "send failed");
                            break;
                        }
                    }
                    None => break,
                },
                inbound = ws.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => match Message::decode(text.as_bytes()) {
                        Ok(msg) if msg.kind == MessageKind::Clipboard => {
                            let _ = self
                                .events
                                .send(PeerEvent::ClipboardReceived(msg.content))
                                .await;
                        }
                        // pong acknowledgments and anything unrecognized
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "skipping malformed frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "read failed");
                        break;
                    }
                }
            }
        }

        *self.outbound.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
        info!("disconnected from hub");
        let _ = self.events.send(PeerEvent::Disconnected).await;
    }
}
