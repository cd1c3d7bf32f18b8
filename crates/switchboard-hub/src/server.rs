//! [`Hub`] – owner of the upstream connection and RPC broker.
//!
//! The Hub:
//!
//! 1. **Ingests** native events from its [`Gateway`], runs local bookkeeping
//!    through the [`EventDispatcher`] and pushes each event onto the
//!    [`WorkQueue`].
//! 2. **Serves** a WebSocket endpoint for Workers. Each connected Worker
//!    competes for queued events; each event is sent as a `start` frame to
//!    exactly one of them.
//! 3. **Brokers** `request` frames: the named operation is resolved on the
//!    [`RequestProxy`] and answered with `ok` or `error`.
//!
//! Each session loop is an explicit `tokio::select!` over queue pops, inbound
//! frames and finished replies, so pushing events and answering requests never
//! starve each other. Operations run in their own tasks; a failing or
//! panicking operation only produces an `error` frame.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use switchboard_types::{BridgeError, Frame, FrameKind, RequestData, StartData, WireCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::Gateway;
use crate::events::EventDispatcher;
use crate::proxy::RequestProxy;
use crate::queue::WorkQueue;
use crate::session::SessionRegistry;

/// Default listen port for Worker connections.
pub const DEFAULT_PORT: u16 = 3000;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The Hub. Clone it cheaply – clones share the queue, cache and sessions.
#[derive(Clone)]
pub struct Hub {
    gateway: Arc<dyn Gateway>,
    proxy: Arc<RequestProxy>,
    queue: WorkQueue,
    dispatcher: EventDispatcher,
    sessions: SessionRegistry,
}

/// A Hub bound to a local address, ready to [`run`](BoundHub::run).
pub struct BoundHub {
    hub: Hub,
    listener: TcpListener,
}

impl Hub {
    /// Create a Hub around `gateway`, answering requests with `proxy`.
    pub fn new(gateway: Arc<dyn Gateway>, proxy: RequestProxy) -> Self {
        let queue = WorkQueue::new();
        Self {
            gateway,
            proxy: Arc::new(proxy),
            dispatcher: EventDispatcher::new(queue.clone()),
            queue,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Bind the Worker endpoint on `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Connection`] if the TCP listener cannot bind.
    pub async fn bind(self, addr: SocketAddr) -> Result<BoundHub, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Connection(format!("hub bind error on {addr}: {e}")))?;
        Ok(BoundHub { hub: self, listener })
    }

    /// Identity stamped into `start` frames: the gateway's, falling back to
    /// the user announced by the last `ready` event.
    fn me(&self) -> Value {
        let id = self.gateway.self_id();
        if !id.is_null() {
            return id;
        }
        self.dispatcher
            .cache()
            .read()
            .ok()
            .and_then(|cache| cache.me().and_then(|me| me.get("id")).cloned())
            .unwrap_or(Value::Null)
    }

    /// Pump the gateway's event stream into the dispatcher until it ends.
    pub async fn pump_events(&self) {
        let mut stream = self.gateway.event_stream().await;
        while let Some(event) = stream.next().await {
            self.dispatcher.dispatch(event);
        }
        warn!("upstream event stream ended");
    }

    // -----------------------------------------------------------------------
    // Per-Worker session
    // -----------------------------------------------------------------------

    async fn handle_worker(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| BridgeError::Connection(format!("ws handshake from {peer}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let session = self.sessions.register(peer);
        info!(peer = %peer, session = %session, workers = self.sessions.len(), "worker connected");

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Frame>();

        let result = loop {
            tokio::select! {
                // ── Queue → Worker ──────────────────────────────────────────
                event = self.queue.pop() => {
                    let frame = Frame::start(StartData {
                        event: event.event.clone(),
                        data: event.data.clone(),
                        me: self.me(),
                    });
                    if let Err(e) = send_frame(&mut ws_tx, &frame).await {
                        // Nobody received it; hand it to another Worker.
                        self.queue.requeue(event);
                        break Err(e);
                    }
                    debug!(session = %session, event = %event.event, "event delivered");
                }
                // ── Worker → Hub ────────────────────────────────────────────
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_inbound(WireCodec::decode(text.as_str()), session, &reply_tx);
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            self.handle_inbound(WireCodec::decode_bytes(&bytes), session, &reply_tx);
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Err(e)) => break Err(BridgeError::Connection(format!("ws read from {peer}: {e}"))),
                        _ => {}
                    }
                }
                // ── Finished operations → Worker ────────────────────────────
                Some(reply) = reply_rx.recv() => {
                    if let Err(e) = send_frame(&mut ws_tx, &reply).await {
                        break Err(e);
                    }
                }
            }
        };

        self.sessions.remove(session);
        info!(peer = %peer, session = %session, workers = self.sessions.len(), "worker disconnected");
        result
    }

    /// Route one inbound frame. Never fails: problems are logged or answered
    /// with an `error` frame.
    fn handle_inbound(
        &self,
        decoded: Result<Frame, BridgeError>,
        session: Uuid,
        reply_tx: &mpsc::UnboundedSender<Frame>,
    ) {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session = %session, error = %e, "dropping undecodable frame");
                return;
            }
        };
        if frame.kind != FrameKind::Request {
            debug!(session = %session, kind = ?frame.kind, "ignoring non-request frame");
            return;
        }
        let id = frame.id;
        let request: RequestData = match frame.payload() {
            Ok(request) => request,
            Err(e) => {
                let _ = reply_tx.send(Frame::error(id, e.to_string()));
                return;
            }
        };
        debug!(session = %session, op = %request.op, id = ?id, wait = request.wait, "request received");

        // Built-in operations answered by the Hub itself.
        match request.op.as_str() {
            "get_worker_number" => {
                let reply = match self.sessions.index_of(session) {
                    Some(index) => Frame::ok(id, Value::from(index)),
                    None => Frame::error(id, "session is not registered"),
                };
                let _ = reply_tx.send(reply);
                return;
            }
            "get_worker_count" => {
                let _ = reply_tx.send(Frame::ok(id, Value::from(self.sessions.len())));
                return;
            }
            _ => {}
        }

        if !request.wait {
            let _ = reply_tx.send(Frame::ok(id, Value::Null));
        }
        let proxy = Arc::clone(&self.proxy);
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let op = request.op.clone();
            let wait = request.wait;
            // A nested task so a panicking operation surfaces as a JoinError.
            let outcome = tokio::spawn(async move {
                proxy.execute(&request.op, request.args, request.kwargs).await
            })
            .await;
            let reply = match outcome {
                Ok(Ok(value)) => Frame::ok(id, value),
                Ok(Err(e)) => {
                    warn!(op = %op, error = %e, "request failed");
                    Frame::error(id, e.to_string())
                }
                Err(join) => {
                    let text = panic_text(&op, join);
                    error!(op = %op, "{text}");
                    Frame::error(id, text)
                }
            };
            if wait {
                let _ = reply_tx.send(reply);
            }
        });
    }
}

impl BoundHub {
    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.listener
            .local_addr()
            .map_err(|e| BridgeError::Connection(format!("local_addr: {e}")))
    }

    /// Run until the process exits.
    pub async fn run(self) -> Result<(), BridgeError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves.
    ///
    /// Pumps gateway events and accepts Worker connections concurrently.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        let BoundHub { hub, listener } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "hub listening for workers");
        }

        let pump = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.pump_events().await })
        };

        let accept = async {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let hub = hub.clone();
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_worker(stream, peer).await {
                                error!(peer = %peer, error = %e, "worker session error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "ws accept error");
                    }
                }
            }
        };

        tokio::select! {
            _ = accept => {}
            _ = shutdown => info!("hub shutting down"),
        }
        pump.abort();
        Ok(())
    }
}

async fn send_frame(ws_tx: &mut WsSink, frame: &Frame) -> Result<(), BridgeError> {
    let text = WireCodec::encode(frame)?;
    ws_tx
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| BridgeError::Connection(format!("ws send: {e}")))
}

fn panic_text(op: &str, join: JoinError) -> String {
    if !join.is_panic() {
        return format!("operation `{op}` was cancelled");
    }
    let payload = join.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("operation `{op}` panicked: {message}")
}
