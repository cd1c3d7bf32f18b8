//! `switchboard-worker` – business logic behind the Hub.
//!
//! A Worker holds no upstream connection of its own. It receives events from
//! the Hub, runs them through locally registered plugins and asks the Hub to
//! act on its behalf through RPC.
//!
//! # Modules
//!
//! - [`client`] – the [`Worker`]: Hub connection, event dispatch, commands.
//! - [`rpc`] – [`RpcClient`], correlated or single-in-flight requests.
//! - [`plugin`] – [`Plugin`] trait, [`PluginRegistry`] and extensions.
//! - [`events`], [`commands`], [`routes`] – the three binding tables.
//! - [`handler`] – the shared [`Handler`] type and its [`Context`].
//! - [`cache`] – objects seen in Hub events.
//! - [`web`] – [`WebBridge`], serving routes to the HTTP front-end.
//! - [`telemetry`] – `tracing` / OpenTelemetry setup for every binary.

pub mod cache;
pub mod client;
pub mod commands;
pub mod events;
pub mod handler;
pub mod plugin;
pub mod routes;
pub mod rpc;
pub mod telemetry;
pub mod web;


pub use cache::ObjectCache;
pub use client::{COMMAND_ERROR_EVENT, Worker, WorkerConfig};
pub use commands::{CommandSpec, Param, ParamKind, tokenize};
pub use events::EventTable;
pub use handler::{Context, Handler, HandlerError, HandlerResult, handler};
pub use plugin::{Binding, BindingKind, ExtensionCatalog, Plugin, PluginRegistry, SharedRegistry};
pub use routes::RouteTable;
pub use rpc::{RpcClient, RpcMode};
pub use web::{DEFAULT_WEB_URL, WebBridge};
