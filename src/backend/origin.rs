//! HTTP origin backend.
//!
//! # Responsibilities
//! - Forward cache requests to the configured origin address
//! - Rewrite the request URI to the origin while preserving the client's Host header
//! - Buffer the origin response so the cache can inspect and store it
//!
//! # Design Decisions
//! - hyper-util legacy client with a pooled HTTP/1.1 connector
//! - Hop-by-hop headers never cross the proxy in either direction

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, Uri, Version};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use super::{Backend, BackendError, RequestType};
use crate::config::{OriginConfig, TimeoutConfig};
use crate::http::{Request, Response};

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are hop-by-hop as well.
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove(header::TRANSFER_ENCODING);
}

/// Origin server reached over HTTP.
pub struct HttpOrigin {
    client: Client<HttpConnector, Body>,
    authority: Authority,
    max_body_size: usize,
}

impl HttpOrigin {
    pub fn new(origin: &OriginConfig, timeouts: &TimeoutConfig) -> Result<Self, BackendError> {
        let authority = Authority::from_str(&origin.address)
            .map_err(|e| BackendError::InvalidRequest(format!("origin address {}: {}", origin.address, e)))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(timeouts.idle_secs))
            .build(connector);

        Ok(Self {
            client,
            authority,
            max_body_size: origin.max_body_size,
        })
    }

    pub fn address(&self) -> &str {
        self.authority.as_str()
    }
}

#[async_trait]
impl Backend for HttpOrigin {
    async fn handle(&self, request: Request, kind: RequestType) -> Result<Response, BackendError> {
        let (parts, body) = request.into_parts();

        let mut uri_parts = parts.uri.into_parts();
        uri_parts.scheme = Some(Scheme::HTTP);
        uri_parts.authority = Some(self.authority.clone());
        if uri_parts.path_and_query.is_none() {
            uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        let uri = Uri::from_parts(uri_parts).map_err(|e| BackendError::InvalidRequest(e.to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let mut outbound = axum::http::Request::new(Body::from(body));
        *outbound.method_mut() = parts.method.clone();
        *outbound.uri_mut() = uri;
        *outbound.version_mut() = Version::HTTP_11;
        *outbound.headers_mut() = headers;

        tracing::debug!(
            origin = %self.authority,
            method = %parts.method,
            uri = %outbound.uri(),
            kind = ?kind,
            "Forwarding to origin"
        );

        let response: hyper::Response<Incoming> = self.client.request(outbound).await.map_err(|e| {
            if e.is_connect() {
                BackendError::Connect {
                    address: self.authority.to_string(),
                    reason: e.to_string(),
                }
            } else {
                BackendError::Upstream(e.to_string())
            }
        })?;

        let (mut parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(Body::new(body), self.max_body_size)
            .await
            .map_err(|e| BackendError::Body(e.to_string()))?;
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::CONTENT_LENGTH);

        Ok(Response::from_parts(parts, bytes))
    }
}
