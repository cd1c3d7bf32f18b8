//! Console upstream for `switchboard hub`.
//!
//! Without a chat-platform connection the Hub reads events from stdin and
//! prints outgoing operations to stdout. A line is either a JSON event
//! `{"type": "message_create", "data": {...}}` or plain text, which becomes a
//! `message_create` authored by the console user in channel `0`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use colored::Colorize;
use serde::Deserialize;
use serde_json::{Value, json};
use switchboard_hub::{ChannelGatewayHandle, OpError, RequestProxy};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Id of the pseudo user typing into the console.
pub const CONSOLE_USER_ID: u64 = 1;

#[derive(Debug, Deserialize)]
struct ConsoleEvent {
    #[serde(rename = "type")]
    event: String,
    #[serde(default)]
    data: Value,
}

/// Turn one stdin line into `(event name, payload)`.
pub fn parse_line(line: &str, message_id: u64) -> Option<(String, Value)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('{')
        && let Ok(event) = serde_json::from_str::<ConsoleEvent>(line)
    {
        return Some((event.event, event.data));
    }
    Some((
        "message_create".to_string(),
        json!({
            "id": message_id,
            "channel_id": 0,
            "content": line,
            "author": {"id": CONSOLE_USER_ID, "username": "console"},
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    ))
}

/// Feed stdin into the gateway until EOF.
pub async fn feed_stdin(handle: ChannelGatewayHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_id = 1u64;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some((event, data)) = parse_line(&line, next_id) else {
                    continue;
                };
                next_id += 1;
                debug!(event = %event, "console event");
                if !handle.emit_named(&event, data) {
                    warn!("gateway closed; console input stops");
                    return;
                }
            }
            Ok(None) => {
                info!("stdin closed; no more console events");
                return;
            }
            Err(e) => {
                warn!(error = %e, "stdin read error");
                return;
            }
        }
    }
}

fn arg_text(args: &[Value], index: usize) -> String {
    match args.get(index) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Operations the console Hub answers: `send`, `reply`, `typing`.
pub fn console_proxy() -> Result<RequestProxy, switchboard_types::BridgeError> {
    let ids = Arc::new(AtomicU64::new(1_000_000));
    let mut proxy = RequestProxy::new();

    let send_ids = Arc::clone(&ids);
    proxy.register("send", move |args, _| {
        let id = send_ids.fetch_add(1, Ordering::Relaxed);
        async move {
            let channel = args.first().cloned().unwrap_or(Value::Null);
            let content = arg_text(&args, 1);
            println!("{} {}", format!("#{channel} >").cyan().bold(), content);
            Ok::<Value, OpError>(json!({
                "id": id,
                "channel_id": channel,
                "content": content,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }))
        }
    })?;

    let reply_ids = Arc::clone(&ids);
    proxy.register("reply", move |args, _| {
        let id = reply_ids.fetch_add(1, Ordering::Relaxed);
        async move {
            let message = args.first().cloned().unwrap_or(Value::Null);
            let content = arg_text(&args, 1);
            let Some(channel) = message.get("channel_id").cloned() else {
                return Err::<Value, OpError>("reply needs a message with a channel_id".into());
            };
            println!("{} {}", format!("#{channel} ↩").cyan().bold(), content);
            Ok(json!({"id": id, "channel_id": channel, "content": content}))
        }
    })?;

    proxy.register("typing", |args, _| async move {
        let channel = args.first().cloned().unwrap_or(Value::Null);
        println!("{}", format!("#{channel} … typing").dimmed());
        Ok::<Value, OpError>(Value::Null)
    })?;

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_are_events() {
        let (event, data) = parse_line(r#"{"type": "guild_create", "data": {"id": 5}}"#, 1).unwrap();
        assert_eq!(event, "guild_create");
        assert_eq!(data, json!({"id": 5}));
    }

    #[test]
    fn plain_text_is_a_console_message() {
        let (event, data) = parse_line("  !ping  ", 42).unwrap();
        assert_eq!(event, "message_create");
        assert_eq!(data["content"], json!("!ping"));
        assert_eq!(data["id"], json!(42));
        assert_eq!(data["author"]["id"], json!(CONSOLE_USER_ID));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_line("   ", 1).is_none());
    }

    #[test]
    fn broken_json_falls_back_to_text() {
        let (event, data) = parse_line("{not json", 1).unwrap();
        assert_eq!(event, "message_create");
        assert_eq!(data["content"], json!("{not json"));
    }

    #[tokio::test]
    async fn console_operations() {
        let proxy = console_proxy().unwrap();
        assert_eq!(proxy.operations(), vec!["reply", "send", "typing"]);

        let sent = proxy
            .execute("send", vec![json!(7), json!("hello")], Default::default())
            .await
            .unwrap();
        assert_eq!(sent["channel_id"], json!(7));
        assert_eq!(sent["content"], json!("hello"));

        let err = proxy
            .execute("reply", vec![json!({}), json!("x")], Default::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channel_id"));
    }
}
