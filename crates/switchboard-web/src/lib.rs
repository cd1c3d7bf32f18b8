//! `switchboard-web` – HTTP front-end for the Worker pool
//!
//! A stateless axum server that never renders anything itself:
//!
//! 1. **Registers** Workers that upgrade `ws://…/webserver` to a WebSocket.
//! 2. **Forwards** every other HTTP request as an `access` frame to the
//!    Worker with the fewest outstanding requests.
//! 3. **Renders** the `end` descriptor the Worker sends back (`text`, `html`,
//!    `json`, `redirect`, `empty`).
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use switchboard_web::WebServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), switchboard_types::BridgeError> {
//!     WebServer::new()
//!         .bind(SocketAddr::from(([0, 0, 0, 0], 5000)))
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod balancer;
pub mod http;
pub mod server;

pub use balancer::{Assignment, Balancer, WorkerLink, WorkerReply};
pub use http::{MAX_BODY, access_data, not_ready, render, text};
pub use server::{BoundWebServer, DEFAULT_PORT, WORKER_PATH, WebServer};
