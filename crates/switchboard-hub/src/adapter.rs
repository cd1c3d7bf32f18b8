//! The upstream Gateway adapter seam.
//!
//! The Hub never speaks the chat platform's protocol itself. It consumes a
//! [`Gateway`]: something that yields native events and knows the identity it
//! is logged in as. Operations against the platform are registered separately
//! on the [`RequestProxy`][crate::proxy::RequestProxy].
//!
//! - [`Gateway`] – the trait every upstream adapter must implement.
//! - [`ChannelGateway`] – an in-process adapter fed through a channel; used by
//!   the CLI's stdin feeder and by tests.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::events::{EventKind, GatewayEvent};

/// Every upstream connection adapter must implement this trait.
///
/// # Contract
///
/// * `self_id` – identity of the upstream account; stamped into every `start`
///   frame as `me` so Workers can ignore their own messages.
/// * `event_stream` – the live stream of native events. The Hub calls it
///   once; the stream ending means the upstream connection is gone.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn self_id(&self) -> Value;

    async fn event_stream(&self) -> BoxStream<'static, GatewayEvent>;
}

/// A [`Gateway`] whose events are pushed through a [`ChannelGatewayHandle`].
pub struct ChannelGateway {
    self_id: Value,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<GatewayEvent>>>,
}

/// Sending half of a [`ChannelGateway`].
#[derive(Clone)]
pub struct ChannelGatewayHandle {
    sender: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelGateway {
    /// Create a gateway logged in as `self_id` together with its feeding handle.
    pub fn new(self_id: Value) -> (Self, ChannelGatewayHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                self_id,
                receiver: Mutex::new(Some(receiver)),
            },
            ChannelGatewayHandle { sender },
        )
    }
}

#[async_trait]
impl Gateway for ChannelGateway {
    fn self_id(&self) -> Value {
        self.self_id.clone()
    }

    async fn event_stream(&self) -> BoxStream<'static, GatewayEvent> {
        let receiver = self.receiver.lock().ok().and_then(|mut guard| guard.take());
        match receiver {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            // The stream can only be taken once.
            None => stream::empty().boxed(),
        }
    }
}

impl ChannelGatewayHandle {
    /// Push one native event. Returns `false` once the gateway is gone.
    pub fn emit(&self, kind: EventKind, data: Value) -> bool {
        self.sender.send(GatewayEvent::new(kind, data)).is_ok()
    }

    /// Push an event by its wire name.
    pub fn emit_named(&self, name: &str, data: Value) -> bool {
        self.emit(EventKind::from_name(name), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn emitted_events_come_out_of_the_stream_in_order() {
        let (gateway, handle) = ChannelGateway::new(json!(1));
        assert!(handle.emit(EventKind::Ready, json!({})));
        assert!(handle.emit_named("message_create", json!({"content": "a"})));
        drop(handle);

        let events: Vec<_> = gateway.event_stream().await.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Ready);
        assert_eq!(events[1].kind, EventKind::MessageCreate);
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once() {
        let (gateway, handle) = ChannelGateway::new(json!(1));
        let _first = gateway.event_stream().await;
        handle.emit(EventKind::Ready, json!({}));
        let second: Vec<_> = gateway.event_stream().await.collect().await;
        assert!(second.is_empty());
    }

    #[test]
    fn self_id_is_reported() {
        let (gateway, _handle) = ChannelGateway::new(json!("bot-7"));
        assert_eq!(gateway.self_id(), json!("bot-7"));
    }
}
