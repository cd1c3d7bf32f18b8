//! [`WebServer`] – the HTTP front-end in front of the Worker pool.
//!
//! One axum router serves both sides:
//!
//! * WebSocket upgrades on [`WORKER_PATH`] register a Worker with the
//!   [`Balancer`].
//! * Every other request is described as an `access` frame, sent to the
//!   least-loaded Worker and answered with whatever the Worker's `end`
//!   descriptor names.
//!
//! | Situation | Response |
//! |---|---|
//! | no Worker connected | `503` not ready, immediately |
//! | Worker replies `error` | `500` with the diagnostic text |
//! | Worker disconnects before replying | `502` |
//! | body over [`MAX_BODY`] or unreadable | `400` |

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::any;
use futures_util::{SinkExt, StreamExt};
use switchboard_types::{AccessData, BridgeError, Frame, FrameKind, ResponseDescriptor, WireCodec};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::balancer::{Balancer, WorkerLink, WorkerReply};
use crate::http::{MAX_BODY, access_data, not_ready, render, text};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 5000;

/// Path Workers dial to join the pool.
pub const WORKER_PATH: &str = "/webserver";

/// The front-end. Clone it cheaply – clones share the Worker pool.
#[derive(Clone, Default)]
pub struct WebServer {
    balancer: Balancer,
    next_id: Arc<AtomicU64>,
}

#[derive(Clone)]
struct AppState {
    server: WebServer,
    local: SocketAddr,
}

/// A front-end bound to a local address.
pub struct BoundWebServer {
    server: WebServer,
    listener: TcpListener,
}

impl WebServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    /// The router behind [`BoundWebServer::run`]; `local` is reported to
    /// Workers as the serving address. Needs `ConnectInfo<SocketAddr>`.
    pub fn router(&self, local: SocketAddr) -> Router {
        Router::new()
            .route(WORKER_PATH, any(worker_or_request))
            .fallback(request)
            .with_state(AppState {
                server: self.clone(),
                local,
            })
    }

    /// # Errors
    ///
    /// Returns [`BridgeError::Connection`] if the TCP listener cannot bind.
    pub async fn bind(self, addr: SocketAddr) -> Result<BoundWebServer, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Connection(format!("web bind error on {addr}: {e}")))?;
        Ok(BoundWebServer { server: self, listener })
    }

    // -----------------------------------------------------------------------
    // Worker sessions
    // -----------------------------------------------------------------------

    async fn serve_worker(&self, socket: WebSocket, peer: SocketAddr) -> Result<(), BridgeError> {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let link = Arc::new(WorkerLink::new(out_tx));
        self.balancer.add(Arc::clone(&link));
        info!(peer = %peer, workers = self.balancer.len(), "web worker connected");

        let result = loop {
            tokio::select! {
                Some(frame) = out_rx.recv() => {
                    let text = match WireCodec::encode(&frame) {
                        Ok(text) => text,
                        Err(e) => break Err(e),
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        break Err(BridgeError::Connection(format!("ws send to {peer}: {e}")));
                    }
                }
                msg = ws_rx.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => WireCodec::decode(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => WireCodec::decode_bytes(&bytes),
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Err(e)) => break Err(BridgeError::Connection(format!("ws read from {peer}: {e}"))),
                        Some(Ok(_)) => continue,
                    };
                    match decoded {
                        Ok(frame) => complete(&link, frame),
                        Err(e) => warn!(peer = %peer, error = %e, "dropping undecodable frame"),
                    }
                }
            }
        };

        self.balancer.remove(link.id());
        let abandoned = link.abandon();
        info!(peer = %peer, abandoned, workers = self.balancer.len(), "web worker disconnected");
        result
    }

    // -----------------------------------------------------------------------
    // HTTP requests
    // -----------------------------------------------------------------------

    /// Hand one request to a Worker and turn its reply into a response.
    pub async fn forward(&self, access: AccessData) -> Response {
        let Some(assignment) = self.balancer.assign() else {
            return not_ready();
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Some(reply) = assignment.link().send(id, Frame::access(Some(id), access)) else {
            return text(StatusCode::BAD_GATEWAY, "502 Bad Gateway: worker disconnected");
        };
        // The assignment is held until the reply arrives.
        let outcome = reply.await;
        drop(assignment);
        match outcome {
            Ok(WorkerReply::End(descriptor)) => render(&descriptor),
            Ok(WorkerReply::Error(diagnostic)) => text(StatusCode::INTERNAL_SERVER_ERROR, diagnostic),
            Err(_) => text(StatusCode::BAD_GATEWAY, "502 Bad Gateway: worker disconnected"),
        }
    }
}

/// `/webserver`: a WebSocket upgrade joins the pool, anything else is an
/// ordinary request.
async fn worker_or_request(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    req: Request,
) -> Response {
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| async move {
            if let Err(e) = state.server.serve_worker(socket, peer).await {
                warn!(peer = %peer, error = %e, "web worker session ended with error");
            }
        }),
        Err(_) => forward_request(&state, peer, req).await,
    }
}

async fn request(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    forward_request(&state, peer, req).await
}

async fn forward_request(state: &AppState, peer: SocketAddr, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY).await {
        Ok(body) => body,
        Err(e) => {
            debug!(peer = %peer, error = %e, "unreadable request body");
            return text(StatusCode::BAD_REQUEST, format!("400 Bad Request: {e}"));
        }
    };
    let access = access_data(&parts.method, &parts.uri, &parts.headers, &body, peer, state.local);
    let response = state.server.forward(access).await;
    debug!(peer = %peer, method = %parts.method, uri = %parts.uri, status = response.status().as_u16(), "served");
    response
}

/// Match an `end` / `error` frame to its waiting request.
fn complete(link: &WorkerLink, frame: Frame) {
    let Some(id) = frame.id else {
        warn!(kind = ?frame.kind, "reply without id from web worker");
        return;
    };
    let reply = match frame.kind {
        FrameKind::End => match frame.payload::<ResponseDescriptor>() {
            Ok(descriptor) => WorkerReply::End(descriptor),
            Err(e) => WorkerReply::Error(e.to_string()),
        },
        FrameKind::Error => WorkerReply::Error(frame.error_text()),
        other => {
            debug!(kind = ?other, "ignoring frame from web worker");
            return;
        }
    };
    if !link.complete(id, reply) {
        warn!(id, "reply for unknown request");
    }
}

impl BoundWebServer {
    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.listener
            .local_addr()
            .map_err(|e| BridgeError::Connection(format!("local_addr: {e}")))
    }

    pub fn server(&self) -> &WebServer {
        &self.server
    }

    pub async fn run(self) -> Result<(), BridgeError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = self.local_addr()?;
        let BoundWebServer { server, listener } = self;
        info!(addr = %local, "web front-end listening");
        let app = server.router(local);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("web front-end shutting down");
            })
            .await
            .map_err(|e| BridgeError::Connection(format!("web server error: {e}")))
    }
}
