//! HTTP cache subsystem.
//!
//! # Data Flow
//! ```text
//! client request
//!     → coordinator.rs (pass / lookup / fetch / validate, per-key lock)
//!     → store (persisted variants)
//!     → surrogate (fragment templates evaluated through sub-requests)
//!     → strategy.rs (freshness of the assembled page)
//!     → trace.rs (decisions, optionally exposed as X-Cache-Trace)
//! ```

pub mod coordinator;
pub mod error;
pub mod strategy;
pub mod trace;

pub use coordinator::{HttpCache, X_CACHE_TRACE};
pub use error::CacheError;
pub use strategy::ResponseCacheStrategy;
pub use trace::{Trace, TraceEvent};
