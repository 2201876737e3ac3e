//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → limits.rs (buffer body up to the configured size)
//!     → cache coordinator
//!     → headers.rs (sanitize forwarding headers before any backend dispatch)
//!     → backend sees loopback peer + trusted.rs allowlist (with loopback)
//! ```
//!
//! # Design Decisions
//! - No trust in client-supplied forwarding headers unless the peer is allowlisted
//! - The allowlist is an immutable value threaded through calls, never global state

pub mod headers;
pub mod limits;
pub mod trusted;

pub use headers::{sanitize, sanitize_and_dispatch};
pub use trusted::{client_ip, client_ips, TrustedProxies};
