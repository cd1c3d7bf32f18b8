//! The cog every `switchboard worker` process starts with.

use serde_json::{Value, json};
use switchboard_types::ResponseDescriptor;
use switchboard_worker::{Binding, CommandSpec, Param, ParamKind, Plugin, handler};
use tracing::info;

pub struct Core;

impl Plugin for Core {
    fn name(&self) -> &str {
        "Core"
    }

    fn bindings(&self) -> Vec<Binding> {
        vec![
            Binding::event(
                "log_ready",
                "ready",
                handler(|ctx, _| async move {
                    info!(me = %ctx.me, "upstream ready");
                    Ok(Value::Null)
                }),
            ),
            Binding::command(
                CommandSpec::new("ping"),
                handler(|ctx, _| async move {
                    ctx.reply("pong").await?;
                    Ok(Value::Null)
                }),
            ),
            Binding::command(
                CommandSpec::new("echo").alias("say").param(Param::rest("text")),
                handler(|ctx, args| async move {
                    let text = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
                    if !text.is_empty() {
                        ctx.reply(text).await?;
                    }
                    Ok(Value::Null)
                }),
            ),
            Binding::command(
                CommandSpec::new("worker"),
                handler(|ctx, _| async move {
                    let number = ctx.call("get_worker_number", vec![]).await?;
                    let count = ctx.call("get_worker_count", vec![]).await?;
                    ctx.reply(format!("worker {number} of {count}")).await?;
                    Ok(Value::Null)
                }),
            ),
            Binding::command(
                CommandSpec::new("roll").param(Param::optional("sides", ParamKind::Int, json!(6))),
                handler(|ctx, args| async move {
                    let sides = args.first().and_then(Value::as_i64).unwrap_or(6).max(1);
                    let roll = chrono::Utc::now().timestamp_subsec_nanos() as i64 % sides + 1;
                    ctx.reply(format!("rolled {roll} (d{sides})")).await?;
                    Ok(Value::Null)
                }),
            ),
            Binding::route(
                "index",
                "/",
                handler(|ctx, _| async move {
                    let number = ctx.call("get_worker_number", vec![]).await?;
                    Ok(json!(format!("switchboard worker {number}")))
                }),
            ),
            Binding::route(
                "health",
                "/health",
                handler(|_, _| async move {
                    Ok(serde_json::to_value(ResponseDescriptor::json(json!({"status": "ok"})))?)
                }),
            ),
        ]
    }
}
