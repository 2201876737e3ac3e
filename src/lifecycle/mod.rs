//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Ctrl-C / SIGTERM → trigger → server stops accepting → in-flight requests drain
//!     → store locks released → exit
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
