//! Request-side helpers.
//!
//! # Responsibilities
//! - Carry the peer address through the cache as a request extension
//! - Derive scheme, host and the canonical cache URI from a request
//! - Expose the request's cache-relevant intent (safe methods, no-cache, ETags)
//!
//! # Design Decisions
//! - Requests entering the cache have an absolute URI; relative ones fall back to the Host header
//! - The query string is normalized (sorted pairs) so equivalent URLs share one cache key

use std::net::IpAddr;

use axum::http::{header, uri::Uri, Method};
use url::form_urlencoded;

use super::{CacheControl, Request};
use crate::security::TrustedProxies;

/// Header used to correlate a request across logs.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Address of the peer that sent the request, attached by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub IpAddr);

pub trait RequestExt {
    /// Peer address, if the request came through the server or a sanitized dispatch.
    fn client_addr(&self) -> Option<IpAddr>;

    fn scheme_str(&self) -> &str;

    /// Host without port, lowercased.
    fn host(&self) -> Option<String>;

    /// Effective port, defaulting on the scheme.
    fn port(&self) -> u16;

    /// `scheme://host[:port]/path[?sorted-query]`
    fn canonical_uri(&self) -> String;

    /// Path plus raw query, as used in trace keys.
    fn path_and_query(&self) -> &str;

    fn is_method_safe(&self) -> bool;

    /// GET and HEAD are the only methods whose responses may be stored.
    fn is_method_cacheable(&self) -> bool;

    /// Client asked to bypass stored responses (`Cache-Control: no-cache` or `Pragma: no-cache`).
    fn is_no_cache(&self) -> bool;

    /// Entity tags listed in `If-None-Match`.
    fn etags(&self) -> Vec<String>;
}

impl RequestExt for Request {
    fn client_addr(&self) -> Option<IpAddr> {
        self.extensions().get::<ClientAddr>().map(|addr| addr.0)
    }

    fn scheme_str(&self) -> &str {
        self.uri().scheme_str().unwrap_or("http")
    }

    fn host(&self) -> Option<String> {
        if let Some(host) = self.uri().host() {
            return Some(host.to_ascii_lowercase());
        }
        let raw = self.headers().get(header::HOST)?.to_str().ok()?;
        Some(split_host_header(raw).0.to_ascii_lowercase())
    }

    fn port(&self) -> u16 {
        if let Some(port) = self.uri().port_u16() {
            return port;
        }
        if self.uri().host().is_none() {
            let port = self
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .and_then(|raw| split_host_header(raw).1);
            if let Some(port) = port {
                return port;
            }
        }
        default_port(self.scheme_str())
    }

    fn canonical_uri(&self) -> String {
        let scheme = self.scheme_str().to_ascii_lowercase();
        let host = self.host().unwrap_or_else(|| "localhost".to_string());
        let port = self.port();
        let mut uri = if port == default_port(&scheme) {
            format!("{}://{}", scheme, host)
        } else {
            format!("{}://{}:{}", scheme, host, port)
        };
        uri.push_str(self.uri().path());
        if let Some(query) = self.uri().query().and_then(normalize_query) {
            uri.push('?');
            uri.push_str(&query);
        }
        uri
    }

    fn path_and_query(&self) -> &str {
        self.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    fn is_method_safe(&self) -> bool {
        matches!(
            *self.method(),
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }

    fn is_method_cacheable(&self) -> bool {
        matches!(*self.method(), Method::GET | Method::HEAD)
    }

    fn is_no_cache(&self) -> bool {
        if CacheControl::from_headers(self.headers()).has("no-cache") {
            return true;
        }
        self.headers()
            .get(header::PRAGMA)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"))
    }

    fn etags(&self) -> Vec<String> {
        self.headers()
            .get_all(header::IF_NONE_MATCH)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Split a Host header into host and optional port, keeping IPv6 brackets.
fn split_host_header(raw: &str) -> (&str, Option<u16>) {
    let raw = raw.trim();
    let split_at = if raw.starts_with('[') {
        raw.find(']').map(|end| end + 1)
    } else {
        raw.find(':')
    };
    match split_at {
        Some(idx) if raw[idx..].starts_with(':') => (&raw[..idx], raw[idx + 1..].parse().ok()),
        _ => (raw, None),
    }
}

pub(crate) fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// Sort query pairs so `?b=2&a=1` and `?a=1&b=2` canonicalize identically.
pub fn normalize_query(query: &str) -> Option<String> {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    pairs.sort();
    Some(
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish(),
    )
}

/// Copy a buffered request, including the extensions the cache relies on.
pub fn clone_request(request: &Request) -> Request {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    if let Some(addr) = request.extensions().get::<ClientAddr>() {
        copy.extensions_mut().insert(*addr);
    }
    if let Some(trusted) = request.extensions().get::<TrustedProxies>() {
        copy.extensions_mut().insert(trusted.clone());
    }
    copy
}

/// Resolve `target` (absolute or relative) against the request's URL.
pub fn resolve_uri(base: &Request, target: &str) -> Option<Uri> {
    let base = url::Url::parse(&base.canonical_uri()).ok()?;
    let joined = base.join(target).ok()?;
    joined.as_str().parse().ok()
}
