//! Request size limits.
//!
//! # Responsibilities
//! - Enforce maximum request body size while buffering
//!
//! # Design Decisions
//! - The cache needs whole bodies, so buffering and the size check happen together
//! - Oversized bodies are rejected with 413 Payload Too Large

use axum::body::{Body, Bytes};
use axum::http::StatusCode;

/// Buffer a request body, rejecting it when larger than `limit` bytes.
pub async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, StatusCode> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)
}
