//! Worker side of the web bridge.
//!
//! [`WebBridge`] keeps a second WebSocket open to the HTTP front-end. Each
//! `access` frame is resolved against the Worker's route table in its own
//! task and answered with an `end` frame (the response descriptor) or an
//! `error` frame, echoing the request id.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use switchboard_types::{AccessData, BridgeError, Frame, FrameKind, WireCodec};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::client::{Worker, reconnecting};

/// Default front-end endpoint for Workers.
pub const DEFAULT_WEB_URL: &str = "ws://127.0.0.1:5000/webserver";

pub struct WebBridge {
    worker: Worker,
    url: String,
}

impl WebBridge {
    pub fn new(worker: Worker, url: impl Into<String>) -> Self {
        Self {
            worker,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Serve the front-end with the Worker's reconnect policy.
    pub async fn run(&self) -> Result<(), BridgeError> {
        let config = self.worker.config();
        reconnecting(config.reconnect, config.reconnect_delay, &self.url, || self.serve_connection()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => Ok(()),
        }
    }

    async fn serve_connection(&self) -> Result<(), BridgeError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Connection(format!("dial {}: {e}", self.url)))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(url = %self.url, "connected to web front-end");

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Frame>();

        loop {
            tokio::select! {
                Some(reply) = reply_rx.recv() => {
                    let text = WireCodec::encode(&reply)?;
                    ws_tx
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| BridgeError::Connection(format!("send to front-end: {e}")))?;
                }
                msg = ws_rx.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => WireCodec::decode(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => WireCodec::decode_bytes(&bytes),
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(BridgeError::Connection("front-end closed the connection".into()));
                        }
                        Some(Err(e)) => return Err(BridgeError::Connection(format!("read from front-end: {e}"))),
                        Some(Ok(_)) => continue,
                    };
                    match decoded {
                        Ok(frame) if frame.kind == FrameKind::Access => self.spawn_access(frame, reply_tx.clone()),
                        Ok(frame) => debug!(kind = ?frame.kind, "ignoring frame from front-end"),
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    }
                }
            }
        }
    }

    fn spawn_access(&self, frame: Frame, reply_tx: mpsc::UnboundedSender<Frame>) {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            let id = frame.id;
            let reply = match frame.payload::<AccessData>() {
                Ok(access) => {
                    debug!(id = ?id, method = %access.method, uri = %access.uri, "access");
                    match worker.handle_access(access).await {
                        Ok(descriptor) => Frame::end(id, descriptor),
                        Err(e) => {
                            error!(id = ?id, error = %e, "route failed");
                            Frame::error(id, e.to_string())
                        }
                    }
                }
                Err(e) => Frame::error(id, e.to_string()),
            };
            // The connection may be gone; the front-end then answers 502.
            let _ = reply_tx.send(reply);
        });
    }
}
