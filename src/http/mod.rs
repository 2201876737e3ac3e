//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, body buffering, client address)
//!     → request.rs (absolute URI, client address, canonical cache URI)
//!     → cache coordinator (lookup / validate / store)
//!     → response.rs (freshness arithmetic, 304 handling)
//!     → Send to client
//! ```
//!
//! # Design Decisions
//! - The cache works on fully buffered messages (`Request<Bytes>` / `Response<Bytes>`)
//! - Cache semantics live in extension traits over the `http` types rather than wrappers

pub mod cache_control;
pub mod date;
pub mod request;
pub mod response;
pub mod server;

use axum::body::Bytes;

/// Buffered request as seen by the cache and its backends.
pub type Request = axum::http::Request<Bytes>;

/// Buffered response as produced by backends and the store.
pub type Response = axum::http::Response<Bytes>;

pub use cache_control::CacheControl;
pub use request::{clone_request, ClientAddr, RequestExt, X_REQUEST_ID};
pub use response::{clone_response, ResponseExt};
pub use server::HttpServer;
