//! HTTP caching reverse proxy library.
//!
//! A shared cache in front of a single origin: Vary-aware persistent storage, stampede
//! protection through per-key locks, revalidation, and assembly of ESI/SSI fragments.

pub mod admin;
pub mod backend;
pub mod cache;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod security;
pub mod store;
pub mod surrogate;

pub use cache::{CacheError, HttpCache, Trace, TraceEvent};
pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use store::{FileStore, Store};
pub use surrogate::Surrogate;
