//! Persistent cache store subsystem.
//!
//! # Data Flow
//! ```text
//! write(request, response)
//!     → key.rs (canonical URI → "md" + sha256)
//!     → body → "en" + sha256 digest → en/xx/yy/zz/<rest>   (written once per digest)
//!     → variant list [request headers, response headers] → md/xx/yy/zz/<rest> (JSON)
//!
//! lookup(request)
//!     → variant list for the key
//!     → first variant whose Vary'd request headers match
//!     → response with x-body-file pointing at the content (loaded lazily)
//! ```
//!
//! # Design Decisions
//! - Metadata and content are separate; identical bodies are stored once
//! - Digests are always computed here, never taken from inbound headers
//! - Locks are marker files so that separate processes sharing a root see each other
//! - Tags come from the response's `Cache-Tags` header (comma separated) as stored

pub mod file;
pub mod key;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::http::{Request, Response};

pub use file::FileStore;

/// Digest of the stored body (`en` + hex sha256).
pub const X_CONTENT_DIGEST: &str = "x-content-digest";

/// Path of the stored body on a looked-up response whose body has not been loaded yet.
pub const X_BODY_FILE: &str = "x-body-file";

/// Status code inside a persisted response header snapshot.
pub const X_STATUS: &str = "x-status";

/// Response header listing the tags a stored variant can be invalidated by.
pub const CACHE_TAGS: &str = "cache-tags";

/// What a prune removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub variants: usize,
    pub bodies: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("body file {0} is outside the store")]
    InvalidBodyFile(PathBuf),

    #[error("invalid stored header: {0}")]
    InvalidHeader(String),
}

/// Key/variant-aware response storage with advisory per-key locks.
///
/// Lock identity is the store handle: `session()` hands out a new identity that shares
/// the same directories, so each in-flight request can hold locks independently.
pub trait Store: Send + Sync {
    /// First stored variant matching the request's Vary'd headers.
    fn lookup(&self, request: &Request) -> Result<Option<Response>, StoreError>;

    /// Persist `response` for `request`; stamps digest and length headers on it.
    fn write(&self, request: &Request, response: &mut Response) -> Result<String, StoreError>;

    /// Load the body referenced by `x-body-file` into the response.
    fn restore_body(&self, response: &mut Response) -> Result<(), StoreError>;

    /// Mark every fresh variant for the request's URL as stale.
    fn invalidate(&self, request: &Request) -> Result<(), StoreError>;

    /// Remove metadata for both the http and https forms of `url`.
    fn purge(&self, url: &str) -> Result<bool, StoreError>;

    /// Drop variants that can no longer be served or revalidated, then bodies nothing references.
    fn prune(&self) -> Result<PruneStats, StoreError>;

    /// Remove every stored entry and body. Lock markers survive. Returns the entries removed.
    fn clear(&self) -> Result<usize, StoreError>;

    /// Remove every variant tagged with any of `tags`. Returns the variants removed.
    fn invalidate_tags(&self, tags: &[String]) -> Result<usize, StoreError>;

    fn lock(&self, request: &Request) -> Result<bool, StoreError>;

    fn unlock(&self, request: &Request) -> Result<bool, StoreError>;

    fn is_locked(&self, request: &Request) -> Result<bool, StoreError>;

    /// Release every lock held by this process.
    fn cleanup(&self);

    /// New lock identity over the same storage.
    fn session(&self) -> Arc<dyn Store>;

    /// Number of locks currently held by this process.
    fn held_locks(&self) -> usize;
}
