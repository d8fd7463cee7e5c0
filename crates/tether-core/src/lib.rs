//! # tether-core
//!
//! Shared types for the tether gateway: the [`Backend`] and [`Resolver`]
//! traits, the error taxonomy, connection ids and the configuration model.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod errors;
pub mod ids;
pub mod loader;

pub use backend::{Backend, Resolver};
pub use config::{
    reference_backends, BackendSpec, DispatchSettings, FailoverSettings, GatewayConfig,
    LoggingSettings, ServerSettings, SessionSettings,
};
pub use errors::{BackendError, ConfigError, DispatchError};
pub use ids::ConnectionId;
pub use loader::{config_path, deep_merge, load_config_from_path};
