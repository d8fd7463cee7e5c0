//! # tether-backend
//!
//! Answer sources and the resolution path in front of them:
//!
//! - [`StaticBackend`]: fixed prompt table with simulated latency
//! - [`BackendPool`]: latency/error-score failover across backends
//! - [`Dispatcher`]: bounded retry with a per-attempt timeout

#![deny(unsafe_code)]

pub mod backend;
pub mod dispatch;
pub mod mock;
pub mod pool;

pub use backend::{catalog, StaticBackend};
pub use dispatch::{
    DispatchPolicy, Dispatcher, DISPATCH_ATTEMPTS_TOTAL, DISPATCH_FAILURES_TOTAL,
    DISPATCH_TIMEOUTS_TOTAL,
};
pub use pool::{
    BackendPool, BackendStatus, FailoverPolicy, BACKEND_FAILOVERS_TOTAL,
    BACKEND_LOOKUP_DURATION_SECONDS,
};
