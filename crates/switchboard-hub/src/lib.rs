//! `switchboard-hub` – The Switchboard
//!
//! Owns the single upstream connection, fans its events out to a pool of
//! Workers and brokers the Workers' requests back onto the upstream.
//!
//! # Modules
//!
//! | Module      | Role                                                        |
//! |-------------|-------------------------------------------------------------|
//! | [`adapter`] | [`Gateway`] trait and the channel-fed [`ChannelGateway`].   |
//! | [`events`]  | Event kinds, [`StateCache`] and the [`EventDispatcher`].    |
//! | [`queue`]   | Competitive FIFO handing each event to exactly one Worker.  |
//! | [`proxy`]   | [`RequestProxy`] – validated registry of named operations.  |
//! | [`session`] | Connected Worker sessions and their ordinal numbers.        |
//! | [`server`]  | The [`Hub`] WebSocket server tying it all together.         |

pub mod adapter;
pub mod events;
pub mod proxy;
pub mod queue;
pub mod server;
pub mod session;

pub use adapter::{ChannelGateway, ChannelGatewayHandle, Gateway};
pub use events::{EventDispatcher, EventKind, GatewayEvent, StateCache};
pub use proxy::{OpError, RESERVED_OPERATIONS, RequestProxy};
pub use queue::{QueuedEvent, WorkQueue};
pub use server::{BoundHub, DEFAULT_PORT, Hub};
pub use session::{SessionRegistry, WorkerSession};
