//! [`Worker`] – a Hub client running plugin logic.
//!
//! The Worker dials the Hub, marks itself ready and then multiplexes two
//! things over the one socket:
//!
//! * `start` frames: each event fans out to every local handler bound to its
//!   name. Handlers run in their own tasks, so the read loop never waits on
//!   them; `message_create` also feeds the command framework.
//! * RPC traffic: outgoing `request` frames queued by [`RpcClient`] and the
//!   `ok` / `error` replies that complete them.
//!
//! When the socket closes, pending calls fail, the cached worker number is
//! dropped and, with `reconnect` on, the Worker dials again after
//! `reconnect_delay`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{Value, json};
use switchboard_types::{
    AccessData, Args, BridgeError, Frame, FrameKind, Kwargs, ResponseDescriptor, StartData, WireCodec,
    diagnostic,
};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::cache::ObjectCache;
use crate::handler::{Context, Handler};
use crate::plugin::{Plugin, PluginRegistry, SharedRegistry};
use crate::routes::into_descriptor;
use crate::rpc::{RpcClient, RpcMode};

/// Local event dispatched when a command's arguments fail to convert.
/// Handlers receive `[message, error text, command name]`.
pub const COMMAND_ERROR_EVENT: &str = "command_error";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub hub_url: String,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    pub rpc_mode: RpcMode,
    /// `None` waits for replies indefinitely.
    pub rpc_timeout: Option<Duration>,
    pub prefixes: Vec<String>,
    /// Skip commands in messages authored by the Hub's own account.
    pub ignore_self: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:3000".to_string(),
            reconnect: true,
            reconnect_delay: Duration::from_secs(3),
            rpc_mode: RpcMode::Multiplexed,
            rpc_timeout: None,
            prefixes: vec!["!".to_string()],
            ignore_self: true,
        }
    }
}

impl WorkerConfig {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            ..Self::default()
        }
    }

    pub fn with_reconnect(mut self, reconnect: bool, delay: Duration) -> Self {
        self.reconnect = reconnect;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_rpc(mut self, mode: RpcMode, timeout: Option<Duration>) -> Self {
        self.rpc_mode = mode;
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ignore_self(mut self, ignore_self: bool) -> Self {
        self.ignore_self = ignore_self;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    config: WorkerConfig,
    registry: SharedRegistry,
    rpc: RpcClient,
    cache: ObjectCache,
    number: Mutex<Option<usize>>,
    me: RwLock<Value>,
    ready: watch::Sender<bool>,
}

/// Cheap to clone; clones drive the same connection and registry.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_registry(config, PluginRegistry::default())
    }

    pub fn with_registry(config: WorkerConfig, registry: PluginRegistry) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                rpc: RpcClient::new(config.rpc_mode, config.rpc_timeout),
                config,
                registry: registry.shared(),
                cache: ObjectCache::new(),
                number: Mutex::new(None),
                me: RwLock::new(Value::Null),
                ready,
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.inner.rpc
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.inner.cache
    }

    /// Run `f` with the registry write-locked.
    pub fn with_plugins<T>(&self, f: impl FnOnce(&mut PluginRegistry) -> T) -> T {
        let mut registry = self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut registry)
    }

    pub fn add_cog<P: Plugin + 'static>(&self, plugin: P) -> Result<(), BridgeError> {
        self.with_plugins(|r| r.add_cog(plugin))
    }

    pub fn remove_cog(&self, name: &str) -> Result<(), BridgeError> {
        self.with_plugins(|r| r.remove_cog(name))
    }

    /// Identity of the upstream account from the last `start` frame.
    pub fn me(&self) -> Value {
        self.inner.me.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Resolve once the Worker is connected to the Hub.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = ready.wait_for(|r| *r).await;
    }

    // ── RPC shorthands ───────────────────────────────────────────────────────

    pub async fn call(&self, op: &str, args: Args) -> Result<Value, BridgeError> {
        self.inner.rpc.call(op, args, Kwargs::new()).await
    }

    pub async fn call_with(&self, op: &str, args: Args, kwargs: Kwargs) -> Result<Value, BridgeError> {
        self.inner.rpc.call(op, args, kwargs).await
    }

    pub async fn call_nowait(&self, op: &str, args: Args, kwargs: Kwargs) -> Result<(), BridgeError> {
        self.inner.rpc.call_nowait(op, args, kwargs).await
    }

    /// This Worker's ordinal among connected Workers, asked once per
    /// connection.
    pub async fn number(&self) -> Result<usize, BridgeError> {
        if let Some(n) = *self.inner.number.lock().unwrap_or_else(PoisonError::into_inner) {
            return Ok(n);
        }
        let value = self.call("get_worker_number", Args::new()).await?;
        let n = value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| BridgeError::Codec(format!("worker number is not an integer: {value}")))?;
        *self.inner.number.lock().unwrap_or_else(PoisonError::into_inner) = Some(n);
        Ok(n)
    }

    /// `true` on exactly one connected Worker for each `n` in range; used to
    /// run singleton jobs.
    pub async fn is_worker(&self, n: usize) -> Result<bool, BridgeError> {
        Ok(self.number().await? == n)
    }

    pub(crate) fn context(&self, event: &str, data: Value) -> Context {
        Context::new(
            event,
            data,
            self.me(),
            self.inner.rpc.clone(),
            self.inner.cache.clone(),
            Arc::clone(&self.inner.registry),
        )
    }

    // ── Connection ───────────────────────────────────────────────────────────

    /// Connect and serve until the connection is gone for good.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Connection`] when the Hub is unreachable or closes the
    /// socket and `reconnect` is off.
    pub async fn run(&self) -> Result<(), BridgeError> {
        let config = &self.inner.config;
        reconnecting(config.reconnect, config.reconnect_delay, &config.hub_url, || {
            self.serve_connection()
        })
        .await
    }

    /// [`run`](Self::run) until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("worker shutting down");
                Ok(())
            }
        }
    }

    async fn serve_connection(&self) -> Result<(), BridgeError> {
        let url = &self.inner.config.hub_url;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| BridgeError::Connection(format!("dial {url}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        self.inner.rpc.attach(out_tx);
        *self.inner.number.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.ready.send_replace(true);
        info!(hub = %url, "connected to hub");

        let result = loop {
            tokio::select! {
                Some(frame) = out_rx.recv() => {
                    let text = match WireCodec::encode(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "cannot encode request");
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        break Err(BridgeError::Connection(format!("send to hub: {e}")));
                    }
                }
                msg = ws_rx.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => WireCodec::decode(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => WireCodec::decode_bytes(&bytes),
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(BridgeError::Connection("hub closed the connection".into()));
                        }
                        Some(Err(e)) => break Err(BridgeError::Connection(format!("read from hub: {e}"))),
                        Some(Ok(_)) => continue,
                    };
                    match decoded {
                        Ok(frame) => self.handle_frame(frame),
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    }
                }
            }
        };

        self.inner.ready.send_replace(false);
        self.inner.rpc.detach();
        result
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Start => match frame.payload::<StartData>() {
                Ok(start) => {
                    self.dispatch(start);
                }
                Err(e) => warn!(error = %e, "bad start frame"),
            },
            FrameKind::Ok | FrameKind::Error => {
                self.inner.rpc.resolve(frame);
            }
            other => debug!(kind = ?other, "ignoring frame"),
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Fan one Hub event out to local handlers. Returns how many handler
    /// tasks were spawned.
    pub fn dispatch(&self, start: StartData) -> usize {
        let StartData { event, data, me } = start;
        *self.inner.me.write().unwrap_or_else(PoisonError::into_inner) = me;
        self.inner.cache.observe(&data);
        debug!(event = %event, "event received");

        let mut spawned = self.dispatch_local(&event, vec![data.clone()], data.clone());
        if event == "message_create" {
            spawned += self.process_commands(data);
        }
        spawned
    }

    /// Run every handler bound to `event` with `args`.
    pub fn dispatch_local(&self, event: &str, args: Args, data: Value) -> usize {
        let handlers = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events()
            .handlers_for(event);
        for (name, handler) in &handlers {
            spawn_handler(
                name.clone(),
                event.to_string(),
                handler.clone(),
                self.context(event, data.clone()),
                args.clone(),
            );
        }
        handlers.len()
    }

    fn is_own_message(&self, message: &Value) -> bool {
        let me = self.me();
        let me_id = me.get("id").unwrap_or(&me);
        match message.get("author").and_then(|a| a.get("id")) {
            Some(author) if !me_id.is_null() => same_id(author, me_id),
            _ => false,
        }
    }

    /// Run the command `message` invokes, if any. Returns `1` when a command
    /// handler was spawned.
    pub fn process_commands(&self, message: Value) -> usize {
        let Some(content) = message.get("content").and_then(Value::as_str) else {
            return 0;
        };
        if self.inner.config.ignore_self && self.is_own_message(&message) {
            return 0;
        }
        let found = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .commands()
            .resolve(content, &self.inner.config.prefixes);
        let Some(command) = found else { return 0 };

        match command.arguments() {
            Ok(args) => {
                debug!(command = %command.name, "running command");
                spawn_handler(
                    command.handler_name.clone(),
                    "message_create".to_string(),
                    command.handler.clone(),
                    self.context("message_create", message),
                    args,
                );
                1
            }
            Err(e) => {
                warn!(command = %command.name, error = %e, "command argument conversion failed");
                self.dispatch_local(
                    COMMAND_ERROR_EVENT,
                    vec![message.clone(), Value::String(e.to_string()), json!(command.name)],
                    message,
                );
                0
            }
        }
    }

    /// Resolve one web request against the route table.
    ///
    /// A missing route yields a `404` text descriptor; a failing handler
    /// yields [`BridgeError::Handler`] with its diagnostic.
    pub async fn handle_access(&self, access: AccessData) -> Result<ResponseDescriptor, BridgeError> {
        let found = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .routes()
            .resolve(access.path());
        let Some(route) = found else {
            debug!(uri = %access.uri, "no route");
            return Ok(ResponseDescriptor::text("404 Not Found").with_status(404));
        };
        let ctx = self
            .context("access", serde_json::to_value(&access).unwrap_or(Value::Null))
            .with_request(access);
        let outcome = AssertUnwindSafe((route.handler)(ctx, route.args)).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => Ok(into_descriptor(value)),
            Ok(Err(e)) => Err(BridgeError::Handler(format!(
                "route `{}` failed: {}",
                route.handler_name,
                diagnostic(&*e)
            ))),
            Err(panic) => Err(BridgeError::Handler(format!(
                "route `{}` panicked: {}",
                route.handler_name,
                panic_message(&*panic)
            ))),
        }
    }
}

fn same_id(a: &Value, b: &Value) -> bool {
    let text = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    matches!((text(a), text(b)), (Some(a), Some(b)) if a == b)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Spawn one handler; its failure is logged and goes no further.
fn spawn_handler(name: String, event: String, handler: Handler, ctx: Context, args: Args) {
    tokio::spawn(async move {
        match AssertUnwindSafe(handler(ctx, args)).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!(handler = %name, event = %event, error = %diagnostic(&*e), "handler failed");
            }
            Err(panic) => {
                error!(handler = %name, event = %event, panic = %panic_message(&*panic), "handler panicked");
            }
        }
    });
}

/// Drive `session` with the reconnect policy shared by the Hub and web
/// connections.
pub(crate) async fn reconnecting<F, Fut>(
    reconnect: bool,
    delay: Duration,
    target: &str,
    mut session: F,
) -> Result<(), BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BridgeError>>,
{
    loop {
        let error = match session().await {
            Ok(()) => BridgeError::Connection(format!("connection to {target} ended")),
            Err(e) => e,
        };
        if !reconnect {
            return Err(match error {
                BridgeError::Connection(_) => error,
                other => BridgeError::Connection(other.to_string()),
            });
        }
        warn!(url = %target, error = %error, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}
