//! # tether-server
//!
//! Axum HTTP + `WebSocket` front end of the gateway.
//!
//! - `WebSocket` sessions: heartbeat, read deadline, prompt dispatch, close handling
//! - Connection registry of live sessions
//! - `/health` and `/metrics` endpoints
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod channel;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use channel::{ChannelError, Inbound, MessageChannel, WsChannel};
pub use registry::{ConnectionRegistry, Registration};
pub use server::{router, start, AppState, ServerError, ServerHandle};
pub use session::{CloseReason, Session, SessionConfig, SessionContext, SessionState};
pub use shutdown::ShutdownCoordinator;
