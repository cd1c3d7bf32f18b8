//! Handler type shared by events, commands and routes, and the [`Context`]
//! every handler receives.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use switchboard_types::{AccessData, Args, BridgeError, Kwargs};

use crate::cache::ObjectCache;
use crate::plugin::SharedRegistry;
use crate::rpc::RpcClient;

/// Error type handlers may return. Anything implementing `std::error::Error`
/// converts through `?`, including [`BridgeError`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type HandlerResult = Result<Value, HandlerError>;

/// A bound handler.
///
/// * events receive `[data]`,
/// * commands receive their converted parameters,
/// * routes receive the percent-decoded `<name>` segments and return a value
///   that is turned into a response descriptor.
pub type Handler = Arc<dyn Fn(Context, Args) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, args| f(ctx, args).boxed())
}

/// Everything a handler can reach: the triggering payload, the Hub RPC
/// client, the Worker's object cache and the plugin registry.
#[derive(Clone)]
pub struct Context {
    /// Name of the event (or `"access"` for web requests).
    pub event: String,
    /// Event payload, or the triggering message for commands.
    pub data: Value,
    /// Identity of the upstream account, as stamped by the Hub.
    pub me: Value,
    rpc: RpcClient,
    cache: ObjectCache,
    registry: SharedRegistry,
    request: Option<Arc<AccessData>>,
}

impl Context {
    pub(crate) fn new(
        event: impl Into<String>,
        data: Value,
        me: Value,
        rpc: RpcClient,
        cache: ObjectCache,
        registry: SharedRegistry,
    ) -> Self {
        Self {
            event: event.into(),
            data,
            me,
            rpc,
            cache,
            registry,
            request: None,
        }
    }

    pub(crate) fn with_request(mut self, request: AccessData) -> Self {
        self.request = Some(Arc::new(request));
        self
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// The HTTP request being served, for route handlers.
    pub fn request(&self) -> Option<&AccessData> {
        self.request.as_deref()
    }

    /// Run an operation on the Hub with positional arguments only.
    pub async fn call(&self, op: &str, args: Args) -> Result<Value, BridgeError> {
        self.rpc.call(op, args, Kwargs::new()).await
    }

    /// Channel the triggering payload belongs to, if any.
    pub fn channel_id(&self) -> Option<&Value> {
        self.data.get("channel_id").filter(|id| !id.is_null())
    }

    /// Send `content` to the channel of the triggering payload.
    pub async fn reply(&self, content: impl Into<String>) -> Result<Value, BridgeError> {
        let channel = self
            .channel_id()
            .cloned()
            .ok_or_else(|| BridgeError::Handler("payload has no channel_id to reply to".into()))?;
        self.call("send", vec![channel, Value::String(content.into())]).await
    }
}
