//! [`RequestProxy`] – named operations against the upstream connection.
//!
//! Workers never touch the upstream connection. They send `request` frames
//! naming an operation (`"send"`, `"add_role"`, …) with positional and
//! keyword arguments; the Hub resolves the name here and runs the handler.
//!
//! Operations are registered up front into a validated, static map. Names
//! must be non-empty `[a-z0-9_]` identifiers and must not shadow the Hub's
//! built-in operations.
//!
//! # Example
//!
//! ```
//! use switchboard_hub::RequestProxy;
//! use serde_json::json;
//!
//! let mut proxy = RequestProxy::new();
//! proxy
//!     .register_typed("add", |(a, b): (i64, i64), _kwargs| async move { Ok(a + b) })
//!     .unwrap();
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let sum = proxy.execute("add", vec![json!(2), json!(3)], Default::default()).await.unwrap();
//! assert_eq!(sum, json!(5));
//! # });
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use switchboard_types::{Args, BridgeError, Kwargs, diagnostic};
use tracing::debug;

/// Error type operation handlers may return; its `source()` chain is
/// preserved in the diagnostic text sent back to the Worker.
pub type OpError = Box<dyn std::error::Error + Send + Sync + 'static>;

type OpHandler = Arc<dyn Fn(Args, Kwargs) -> BoxFuture<'static, Result<Value, OpError>> + Send + Sync>;

/// Operations answered by the Hub itself, never by the proxy.
pub const RESERVED_OPERATIONS: &[&str] = &["get_worker_number", "get_worker_count"];

/// Registry of upstream operations, keyed by name.
#[derive(Default, Clone)]
pub struct RequestProxy {
    operations: BTreeMap<String, OpHandler>,
}

impl RequestProxy {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(&self, name: &str) -> Result<(), BridgeError> {
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            Some("name must match [a-z0-9_]+")
        } else if RESERVED_OPERATIONS.contains(&name) {
            Some("name is reserved by the hub")
        } else if self.operations.contains_key(name) {
            Some("already registered")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(BridgeError::InvalidOperation {
                name: name.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Register an operation working on raw JSON arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidOperation`] for invalid, reserved or
    /// duplicate names.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self, BridgeError>
    where
        F: Fn(Args, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, OpError>> + Send + 'static,
    {
        self.validate(name)?;
        let handler: OpHandler = Arc::new(move |args, kwargs| handler(args, kwargs).boxed());
        self.operations.insert(name.to_string(), handler);
        debug!(op = name, "operation registered");
        Ok(self)
    }

    /// Register an operation whose positional arguments deserialize into `A`
    /// (usually a tuple) and whose result serializes from `R`.
    pub fn register_typed<A, R, F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self, BridgeError>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, OpError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, move |args: Args, kwargs: Kwargs| {
            let handler = Arc::clone(&handler);
            async move {
                let parsed: A = serde_json::from_value(Value::Array(args))?;
                let result = handler(parsed, kwargs).await?;
                Ok(serde_json::to_value(result)?)
            }
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<&str> {
        self.operations.keys().map(String::as_str).collect()
    }

    /// Resolve `op` and run it.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::UnknownOperation`] – no such operation.
    /// * [`BridgeError::Handler`] – the handler failed; the text carries the
    ///   full error chain.
    pub async fn execute(&self, op: &str, args: Args, kwargs: Kwargs) -> Result<Value, BridgeError> {
        let handler = self
            .operations
            .get(op)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownOperation(op.to_string()))?;
        handler(args, kwargs).await.map_err(|e| {
            BridgeError::Handler(format!("operation `{op}` failed: {}", diagnostic(&*e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn proxy() -> RequestProxy {
        let mut proxy = RequestProxy::new();
        proxy
            .register_typed("send", |(channel, text): (u64, String), _| async move {
                Ok(json!({"channel_id": channel, "content": text, "id": 99}))
            })
            .unwrap()
            .register("fail", |_, _| async move {
                Err::<Value, OpError>("channel not found".into())
            })
            .unwrap();
        proxy
    }

    #[tokio::test]
    async fn execute_runs_typed_handler() {
        let result = proxy()
            .execute("send", vec![json!(123), json!("hi")], Kwargs::new())
            .await
            .unwrap();
        assert_eq!(result["id"], json!(99));
        assert_eq!(result["content"], json!("hi"));
    }

    #[tokio::test]
    async fn unknown_operation_is_an_error_not_a_panic() {
        let err = proxy().execute("launch", vec![], Kwargs::new()).await.unwrap_err();
        assert_eq!(err, BridgeError::UnknownOperation("launch".into()));
    }

    #[tokio::test]
    async fn handler_failure_carries_diagnostic() {
        let err = proxy().execute("fail", vec![], Kwargs::new()).await.unwrap_err();
        match err {
            BridgeError::Handler(text) => {
                assert!(text.contains("`fail`"));
                assert!(text.contains("channel not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_typed_arguments_are_reported() {
        let err = proxy()
            .execute("send", vec![json!("not-a-number")], Kwargs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Handler(_)));
    }

    #[test]
    fn registration_is_validated() {
        let mut proxy = proxy();
        let noop = |_: Args, _: Kwargs| async move { Ok::<Value, OpError>(Value::Null) };
        assert!(proxy.register("", noop).is_err());
        assert!(proxy.register("Send Message", noop).is_err());
        assert!(proxy.register("get_worker_number", noop).is_err());
        assert!(proxy.register("send", noop).is_err());
        assert!(proxy.register("edit_message", noop).is_ok());
        assert_eq!(proxy.operations(), vec!["edit_message", "fail", "send"]);
    }
}
