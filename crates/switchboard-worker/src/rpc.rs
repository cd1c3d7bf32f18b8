//! [`RpcClient`] – the Worker's side of Hub requests.
//!
//! # Modes
//!
//! | Mode | Wire | In flight |
//! |---|---|---|
//! | [`RpcMode::Multiplexed`] | every `request` carries a monotonic `id`, echoed by the reply | any number |
//! | [`RpcMode::SingleInFlight`] | no `id`; the next reply frame is the answer | one per connection |
//!
//! A call waits on a one-shot channel filled by the connection's read loop.
//! When the connection drops every pending call fails with
//! [`BridgeError::ConnectionClosed`]. There is no deadline unless
//! `rpc_timeout` is configured.
//!
//! In single-in-flight mode a timed-out call keeps the turn until its late
//! reply arrives (or the connection drops). The next request is therefore
//! never sent while an unanswered one is still on the wire, and the late
//! reply cannot be taken for the next call's answer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_types::{Args, BridgeError, Frame, FrameKind, Kwargs, RequestData};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMode {
    #[default]
    Multiplexed,
    /// Compatibility mode for Hubs that do not echo request ids.
    SingleInFlight,
}

type Reply = oneshot::Sender<Result<Value, BridgeError>>;

#[derive(Default)]
struct Pending {
    keyed: BTreeMap<u64, Reply>,
    unkeyed: VecDeque<Reply>,
}

struct Inner {
    mode: RpcMode,
    timeout: Option<Duration>,
    next_id: AtomicU64,
    pending: Mutex<Pending>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    turn: Arc<Semaphore>,
}

/// Cloneable handle; all clones share the pending map and the connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    pub fn new(mode: RpcMode, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                timeout,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(Pending::default()),
                outbound: Mutex::new(None),
                turn: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    pub fn mode(&self) -> RpcMode {
        self.inner.mode
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Frame>>> {
        self.inner.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.outbound().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Calls still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        let pending = self.pending();
        pending.keyed.len() + pending.unkeyed.len()
    }

    /// Route outgoing requests through a new connection's writer.
    pub(crate) fn attach(&self, writer: mpsc::UnboundedSender<Frame>) {
        *self.outbound() = Some(writer);
    }

    /// Forget the connection and fail everything still pending.
    pub(crate) fn detach(&self) {
        self.outbound().take();
        let drained = std::mem::take(&mut *self.pending());
        let failed = drained.keyed.len() + drained.unkeyed.len();
        for reply in drained.keyed.into_values().chain(drained.unkeyed) {
            let _ = reply.send(Err(BridgeError::ConnectionClosed));
        }
        if failed > 0 {
            warn!(failed, "connection lost with requests in flight");
        }
    }

    /// Complete the call an `ok` / `error` frame answers. Returns `false` for
    /// a reply nobody was waiting for.
    pub(crate) fn resolve(&self, frame: Frame) -> bool {
        let outcome = match frame.kind {
            FrameKind::Ok => Ok(frame.data),
            FrameKind::Error => Err(BridgeError::Remote(frame.error_text())),
            _ => return false,
        };
        let reply = {
            let mut pending = self.pending();
            match frame.id {
                Some(id) => pending.keyed.remove(&id),
                None => pending.unkeyed.pop_front(),
            }
        };
        match reply {
            Some(reply) => {
                // The caller may have timed out and gone away.
                let _ = reply.send(outcome);
                true
            }
            None => {
                warn!(id = ?frame.id, "unsolicited reply from hub");
                false
            }
        }
    }

    fn forget(&self, id: Option<u64>) {
        let mut pending = self.pending();
        match id {
            Some(id) => {
                pending.keyed.remove(&id);
            }
            None => {
                pending.unkeyed.pop_back();
            }
        }
    }

    /// Run `op` on the Hub and wait for its result.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::NotConnected`] – no Hub connection right now.
    /// * [`BridgeError::Remote`] – the Hub replied `error`; carries its text.
    /// * [`BridgeError::ConnectionClosed`] – the connection dropped first.
    /// * [`BridgeError::Timeout`] – `rpc_timeout` elapsed.
    pub async fn call(&self, op: &str, args: Args, kwargs: Kwargs) -> Result<Value, BridgeError> {
        self.request(op, args, kwargs, true).await
    }

    /// Ask the Hub to run `op` in the background; returns once it is
    /// acknowledged.
    pub async fn call_nowait(&self, op: &str, args: Args, kwargs: Kwargs) -> Result<(), BridgeError> {
        self.request(op, args, kwargs, false).await.map(|_| ())
    }

    /// Wait for the single-in-flight turn, bounded by `rpc_timeout`.
    async fn acquire_turn(&self, op: &str) -> Result<OwnedSemaphorePermit, BridgeError> {
        let acquire = Arc::clone(&self.inner.turn).acquire_owned();
        let permit = match self.inner.timeout {
            None => acquire.await,
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| BridgeError::Timeout(op.to_string()))?,
        };
        permit.map_err(|_| BridgeError::ConnectionClosed)
    }

    async fn request(&self, op: &str, args: Args, kwargs: Kwargs, wait: bool) -> Result<Value, BridgeError> {
        // Held until the reply arrives in single-in-flight mode.
        let turn = match self.inner.mode {
            RpcMode::SingleInFlight => Some(self.acquire_turn(op).await?),
            RpcMode::Multiplexed => None,
        };

        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending();
            match self.inner.mode {
                RpcMode::Multiplexed => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    pending.keyed.insert(id, tx);
                    Some(id)
                }
                RpcMode::SingleInFlight => {
                    pending.unkeyed.push_back(tx);
                    None
                }
            }
        };

        let frame = Frame::request(
            id,
            RequestData {
                op: op.to_string(),
                args,
                kwargs,
                wait,
            },
        );
        let sent = match self.outbound().as_ref() {
            Some(writer) => writer.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            self.forget(id);
            return Err(BridgeError::NotConnected);
        }
        debug!(op, id = ?id, wait, "request sent");

        let Some(limit) = self.inner.timeout else {
            return rx.await.unwrap_or(Err(BridgeError::ConnectionClosed));
        };
        match tokio::time::timeout(limit, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or(Err(BridgeError::ConnectionClosed)),
            Err(_) => {
                warn!(op, timeout_ms = limit.as_millis() as u64, "request timed out");
                match turn {
                    // The unkeyed slot stays queued; the turn is released only
                    // once the late reply (or a disconnect) consumes it.
                    Some(turn) => {
                        tokio::spawn(async move {
                            let _ = rx.await;
                            drop(turn);
                        });
                    }
                    None => self.forget(id),
                }
                Err(BridgeError::Timeout(op.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attached(mode: RpcMode, timeout: Option<Duration>) -> (RpcClient, mpsc::UnboundedReceiver<Frame>) {
        let client = RpcClient::new(mode, timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        client.attach(tx);
        (client, rx)
    }

    #[tokio::test]
    async fn not_connected_fails_fast() {
        let client = RpcClient::new(RpcMode::Multiplexed, None);
        let err = client.call("send", vec![], Kwargs::new()).await.unwrap_err();
        assert_eq!(err, BridgeError::NotConnected);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn multiplexed_replies_match_by_id_out_of_order() {
        let (client, mut wire) = attached(RpcMode::Multiplexed, None);
        let a = tokio::spawn({
            let client = client.clone();
            async move { client.call("a", vec![], Kwargs::new()).await }
        });
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.call("b", vec![], Kwargs::new()).await }
        });
        let first = wire.recv().await.unwrap();
        let second = wire.recv().await.unwrap();
        assert_ne!(first.id, second.id);

        // Answer in reverse order, echoing each op name.
        for frame in [second, first] {
            let op = frame.payload::<RequestData>().unwrap().op;
            assert!(client.resolve(Frame::ok(frame.id, json!(op))));
        }
        assert_eq!(a.await.unwrap().unwrap(), json!("a"));
        assert_eq!(b.await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn single_in_flight_serialises_calls() {
        let (client, mut wire) = attached(RpcMode::SingleInFlight, None);
        let a = tokio::spawn({
            let client = client.clone();
            async move { client.call("a", vec![], Kwargs::new()).await }
        });
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.call("b", vec![], Kwargs::new()).await }
        });
        let first = wire.recv().await.unwrap();
        assert_eq!(first.id, None);
        // The second request is not sent until the first is answered.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(wire.try_recv().is_err());

        let first_op = first.payload::<RequestData>().unwrap().op;
        client.resolve(Frame::ok(None, json!(first_op.clone())));
        let second = wire.recv().await.unwrap();
        let second_op = second.payload::<RequestData>().unwrap().op;
        client.resolve(Frame::ok(None, json!(second_op.clone())));

        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(ra, json!("a"));
        assert_eq!(rb, json!("b"));
    }

    #[tokio::test]
    async fn error_reply_carries_remote_text() {
        let (client, mut wire) = attached(RpcMode::Multiplexed, None);
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("send", vec![json!(123), json!("hi")], Kwargs::new()).await }
        });
        let frame = wire.recv().await.unwrap();
        client.resolve(Frame::error(frame.id, "Traceback: Missing Access"));
        match call.await.unwrap() {
            Err(BridgeError::Remote(text)) => assert!(text.contains("Missing Access")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn detach_fails_every_pending_call() {
        let (client, mut wire) = attached(RpcMode::Multiplexed, None);
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.call("slow", vec![], Kwargs::new()).await })
            })
            .collect();
        for _ in 0..3 {
            wire.recv().await.unwrap();
        }
        assert_eq!(client.in_flight(), 3);
        client.detach();
        for call in calls {
            assert_eq!(call.await.unwrap(), Err(BridgeError::ConnectionClosed));
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn timeout_is_opt_in() {
        let (client, _wire) = attached(RpcMode::Multiplexed, Some(Duration::from_millis(30)));
        let err = client.call("hang", vec![], Kwargs::new()).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout("hang".into()));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn single_in_flight_timeout_holds_the_turn_until_the_late_reply() {
        let (client, mut wire) = attached(RpcMode::SingleInFlight, Some(Duration::from_millis(30)));

        let err = client.call("a", vec![], Kwargs::new()).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout("a".into()));
        assert_eq!(wire.recv().await.unwrap().payload::<RequestData>().unwrap().op, "a");

        // `a` is still unanswered, so `b` never reaches the wire.
        let err = client.call("b", vec![], Kwargs::new()).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout("b".into()));
        assert!(wire.try_recv().is_err());

        // The late reply goes to the stale slot, not to a later call.
        assert!(client.resolve(Frame::ok(None, json!("late a"))));
        let c = tokio::spawn({
            let client = client.clone();
            async move { client.call("c", vec![], Kwargs::new()).await }
        });
        let frame = wire.recv().await.unwrap();
        assert_eq!(frame.payload::<RequestData>().unwrap().op, "c");
        assert!(client.resolve(Frame::ok(None, json!("c"))));
        assert_eq!(c.await.unwrap().unwrap(), json!("c"));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn nowait_sends_wait_false() {
        let (client, mut wire) = attached(RpcMode::Multiplexed, None);
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call_nowait("typing", vec![], Kwargs::new()).await }
        });
        let frame = wire.recv().await.unwrap();
        assert!(!frame.payload::<RequestData>().unwrap().wait);
        client.resolve(Frame::ok(frame.id, Value::Null));
        assert!(call.await.unwrap().is_ok());
    }

    #[test]
    fn unsolicited_reply_is_rejected() {
        let client = RpcClient::new(RpcMode::Multiplexed, None);
        assert!(!client.resolve(Frame::ok(Some(77), Value::Null)));
        assert!(!client.resolve(Frame::start(switchboard_types::StartData {
            event: "ready".into(),
            data: Value::Null,
            me: Value::Null,
        })));
    }
}
