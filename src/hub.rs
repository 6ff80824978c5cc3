use crate::protocol::{Message, MessageKind, WS_PATH};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum HubEvent {
    ClipboardReceived(String),
    ClientConnected(usize),
    ClientDisconnected(usize),
}

/// Each accepted connection gets an opaque handle and an outbound frame
/// queue; the queue's sender lives in the registry for the lifetime of the
/// link.
type Registry = Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<WsMessage>>>>;

/// Broadcast node other machines connect to. Accepts WebSocket connections
/// on `/ws`, fans clipboard frames out to every connected peer, and relays
/// inbound clipboard frames to everyone but their sender.
#[derive(Clone)]
pub struct Hub {
    connections: Registry,
    running: Arc<AtomicBool>,
    local_addr: Arc<StdMutex<Option<SocketAddr>>>,
    shutdown: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    /// The receiver carries connection-count changes and received clipboard
    /// content; subscribe by keeping it before calling [`Hub::start`].
    pub fn new() -> (Self, mpsc::Receiver<HubEvent>) {
        let (events, events_rx) = mpsc::channel(32);
        let hub = Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Arc::new(StdMutex::new(None)),
            shutdown: Arc::new(StdMutex::new(None)),
            events,
        };
        (hub, events_rx)
    }

    /// Bind `0.0.0.0:port` and start accepting connections. No-op when
    /// already running; a bind failure is returned synchronously and leaves
    /// the hub stopped.
    pub async fn start(&self, port: u16) -> Result<(), HubError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(HubError::Bind { port, source });
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(HubError::Bind { port, source });
            }
        };

        if let Ok(mut guard) = self.local_addr.lock() {
            *guard = Some(addr);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Ok(mut guard) = self.shutdown.lock() {
            *guard = Some(shutdown_tx);
        }

        info!(%addr, "hub listening");

        let connections = self.connections.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            accept_loop(listener, shutdown_rx, connections, events).await;
        });

        Ok(())
    }

    /// Close every connection, clear the registry, and stop accepting. Safe
    /// to call when already stopped.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let shutdown = self.shutdown.lock().ok().and_then(|mut g| g.take());
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        // Dropping each outbound queue unblocks the owning connection task;
        // tasks that already saw the shutdown signal find their entry gone
        // and skip the disconnect event.
        let dropped = {
            let mut conns = self.connections.write().await;
            let dropped = conns.len();
            conns.clear();
            dropped
        };
        info!(connections = dropped, "hub stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Address actually bound by the last successful [`Hub::start`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().map(|guard| *guard).unwrap_or(None)
    }

    /// Send a clipboard frame to every connected peer. Failures to queue for
    /// an individual connection are logged and never abort the fan-out.
    pub async fn broadcast_clipboard(&self, content: &str, source: &str) {
        let frame = WsMessage::Text(Message::clipboard(content, source).encode());
        let conns = self.connections.read().await;
        debug!(connections = conns.len(), "broadcasting clipboard");
        for (id, tx) in conns.iter() {
            if tx.send(frame.clone()).is_err() {
                warn!(connection = %id, "failed to queue broadcast, connection closing");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    connections: Registry,
    events: mpsc::Sender<HubEvent>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming connection");
                    let connections = connections.clone();
                    let events = events.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, connections, events, shutdown).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
    debug!("accept loop ended");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connections: Registry,
    events: mpsc::Sender<HubEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let check_path = |req: &Request, response: Response| {
        if req.uri().path() == WS_PATH {
            Ok(response)
        } else {
            warn!(path = %req.uri().path(), "rejecting upgrade on unexpected path");
            let mut response = ErrorResponse::new(Some("not found".to_string()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Err(response)
        }
    };
    let mut ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let count = {
        let mut conns = connections.write().await;
        conns.insert(id, tx);
        conns.len()
    };
    info!(%addr, connection = %id, count, "client connected");
    let _ = events.send(HubEvent::ClientConnected(count)).await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = ws.close(None).await;
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws.send(frame).await {
                        warn!(connection = %id, error = %e, "write failed");
                        break;
                    }
                }
                // deregistered by stop()
                None => break,
            },
            inbound = ws.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let msg = match Message::decode(text.as_bytes()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(connection = %id, error = %e, "skipping malformed frame");
                            continue;
                        }
                    };
                    match msg.kind {
                        MessageKind::Clipboard => {
                            let _ = events
                                .send(HubEvent::ClipboardReceived(msg.content))
                                .await;
                            relay(&connections, id, &text).await;
                        }
                        MessageKind::Ping => {
                            let pong = WsMessage::Text(Message::pong().encode());
                            if let Err(e) = ws.send(pong).await {
                                warn!(connection = %id, error = %e, "pong failed");
                                break;
                            }
                        }
                        MessageKind::Pong => {}
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "read failed");
                    break;
                }
            }
        }
    }

    // Cleanup runs exactly once per connection: whoever removes the registry
    // entry reports the disconnect.
    let (removed, count) = {
        let mut conns = connections.write().await;
        let removed = conns.remove(&id).is_some();
        (removed, conns.len())
    };
    if removed {
        info!(connection = %id, count, "client disconnected");
        let _ = events.send(HubEvent::ClientDisconnected(count)).await;
    }
}

/// Forward a raw clipboard frame to every connection except its sender.
/// One hop only: relayed frames are never re-relayed, so a star topology
/// cannot amplify.
async fn relay(connections: &Registry, sender: Uuid, text: &str) {
    let conns = connections.read().await;
    for (id, tx) in conns.iter() {
        if *id == sender {
            continue;
        }
        if tx.send(WsMessage::Text(text.to_string())).is_err() {
            warn!(connection = %id, "failed to queue relay, connection closing");
        }
    }
}
