//! Origin application contract.
//!
//! The cache talks to whatever sits behind it through [`Backend`]: a real HTTP origin
//! ([`origin::HttpOrigin`]) in production, an in-process handler in tests.

pub mod origin;

use async_trait::async_trait;
use thiserror::Error;

use crate::http::{Request, Response};

pub use origin::HttpOrigin;

/// Whether a request is the client's own or one issued for an embedded fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Main,
    Sub,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to origin {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("origin request failed: {0}")]
    Upstream(String),

    #[error("origin response body error: {0}")]
    Body(String),

    #[error("invalid origin request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn handle(&self, request: Request, kind: RequestType) -> Result<Response, BackendError>;
}
