//! Forwarding header sanitation for backend dispatch.
//!
//! # Responsibilities
//! - Strip `Forwarded` / `X-Forwarded-*` sent by untrusted or unknown peers
//! - Synthesize `Forwarded` for an untrusted peer from its address, host and scheme
//! - Present the cache as the backend's peer (loopback) with loopback trusted
//!
//! # Design Decisions
//! - The caller's allowlist is never mutated; the backend gets a derived copy as an extension
//! - Forwarding headers from trusted peers pass through unchanged

use std::net::{IpAddr, Ipv4Addr};

use axum::http::{header, HeaderValue};

use super::trusted::TrustedProxies;
use crate::backend::{Backend, BackendError, RequestType};
use crate::http::request::default_port;
use crate::http::{ClientAddr, Request, RequestExt, Response};

const FORWARDING_HEADERS: [&str; 5] = [
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-forwarded-proto",
    "x-forwarded-prefix",
];

fn forwarded_node(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("for=\"{}\"", v4),
        IpAddr::V6(v6) => format!("for=\"[{}]\"", v6),
    }
}

/// Rewrite `request` so that the backend sees a sanitized forwarding context.
///
/// A request without a known peer is treated like one from an untrusted peer.
pub fn sanitize(mut request: Request, trusted: &TrustedProxies) -> Request {
    let peer = request.client_addr();
    if !peer.is_some_and(|peer| trusted.contains(peer)) {
        request.headers_mut().remove(header::FORWARDED);
        for name in FORWARDING_HEADERS {
            request.headers_mut().remove(name);
        }

        let host = match request.host() {
            Some(host) if request.port() == default_port(request.scheme_str()) => host,
            Some(host) => format!("{}:{}", host, request.port()),
            None => "localhost".to_string(),
        };
        let mut params: Vec<String> = peer.map(forwarded_node).into_iter().collect();
        params.push(format!("host=\"{}\"", host));
        params.push(format!("proto={}", request.scheme_str()));
        if let Ok(value) = HeaderValue::from_str(&params.join(";")) {
            request.headers_mut().insert(header::FORWARDED, value);
        }
    }

    request
        .extensions_mut()
        .insert(ClientAddr(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    request.extensions_mut().insert(trusted.with_loopback());
    request
}

/// Sanitize forwarding headers and hand the request to the backend.
pub async fn sanitize_and_dispatch(
    backend: &dyn Backend,
    request: Request,
    kind: RequestType,
    trusted: &TrustedProxies,
) -> Result<Response, BackendError> {
    let request = sanitize(request, trusted);
    backend.handle(request, kind).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::trusted::{client_ip, client_ips};
    use async_trait::async_trait;
    use axum::body::Bytes;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl Backend for Recorder {
        async fn handle(&self, request: Request, _kind: RequestType) -> Result<Response, BackendError> {
            self.seen.lock().unwrap().push(request);
            Ok(Response::new(Bytes::from_static(b"ok")))
        }
    }

    fn request(peer: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("http://localhost/page");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Bytes::new()).unwrap();
        req.extensions_mut().insert(ClientAddr(peer.parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn test_untrusted_peer_headers_stripped() {
        let backend = Recorder { seen: Mutex::new(Vec::new()) };
        let outer = request(
            "10.0.0.1",
            &[("x-forwarded-for", "1.2.3.4"), ("x-forwarded-host", "evil.test")],
        );
        let forwarded = crate::http::clone_request(&outer);

        sanitize_and_dispatch(&backend, forwarded, RequestType::Sub, &TrustedProxies::default())
            .await
            .unwrap();

        let seen = backend.seen.lock().unwrap();
        let inner = &seen[0];
        assert!(inner.headers().get("x-forwarded-for").is_none());
        assert!(inner.headers().get("x-forwarded-host").is_none());
        assert_eq!(
            inner.headers().get("forwarded").unwrap(),
            "for=\"10.0.0.1\";host=\"localhost\";proto=http"
        );
        assert_eq!(inner.client_addr(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        // The backend resolves the real client through loopback trust.
        assert_eq!(client_ip(inner), Some("10.0.0.1".parse().unwrap()));

        // The outer request keeps its headers; trusting the peer reveals the original client.
        assert_eq!(outer.headers().get("x-forwarded-for").unwrap(), "1.2.3.4");
        let trusted = TrustedProxies::parse(&["10.0.0.1"]).unwrap();
        assert_eq!(client_ips(&outer, &trusted), vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_trusted_peer_headers_kept() {
        let backend = Recorder { seen: Mutex::new(Vec::new()) };
        let trusted = TrustedProxies::parse(&["10.0.0.1"]).unwrap();
        let outer = request("10.0.0.1", &[("x-forwarded-for", "10.0.0.2")]);

        sanitize_and_dispatch(&backend, outer, RequestType::Main, &trusted)
            .await
            .unwrap();

        let seen = backend.seen.lock().unwrap();
        let inner = &seen[0];
        assert_eq!(inner.headers().get("x-forwarded-for").unwrap(), "10.0.0.2");
        assert!(inner.headers().get("forwarded").is_none());
        assert_eq!(client_ip(inner), Some("10.0.0.2".parse().unwrap()));
        // Caller's allowlist is untouched.
        assert!(!trusted.contains(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[tokio::test]
    async fn test_trusted_peer_forwarded_is_verbatim() {
        let backend = Recorder { seen: Mutex::new(Vec::new()) };
        let trusted = TrustedProxies::parse(&["10.0.0.0/8"]).unwrap();
        let outer = request(
            "10.0.0.1",
            &[
                ("forwarded", "for=1.2.3.4;proto=https;host=shop.example"),
                ("x-forwarded-proto", "https"),
                ("x-forwarded-port", "443"),
                ("x-forwarded-prefix", "/shop"),
            ],
        );

        sanitize_and_dispatch(&backend, outer, RequestType::Sub, &trusted)
            .await
            .unwrap();

        let seen = backend.seen.lock().unwrap();
        let inner = &seen[0];
        let headers = inner.headers();
        assert_eq!(headers.get("forwarded").unwrap(), "for=1.2.3.4;proto=https;host=shop.example");
        assert_eq!(headers.get_all("forwarded").iter().count(), 1);
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-port").unwrap(), "443");
        assert_eq!(headers.get("x-forwarded-prefix").unwrap(), "/shop");
        assert_eq!(inner.client_addr(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(client_ip(inner), Some("1.2.3.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_untrusted_forwarded_replaced_by_peer_only() {
        let backend = Recorder { seen: Mutex::new(Vec::new()) };
        let outer = request("192.0.2.7", &[("forwarded", "for=1.2.3.4;host=evil.test")]);

        sanitize_and_dispatch(&backend, outer, RequestType::Main, &TrustedProxies::default())
            .await
            .unwrap();

        let seen = backend.seen.lock().unwrap();
        assert_eq!(
            seen[0].headers().get("forwarded").unwrap(),
            "for=\"192.0.2.7\";host=\"localhost\";proto=http"
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_trusted() {
        let backend = Recorder { seen: Mutex::new(Vec::new()) };
        let outer = axum::http::Request::builder()
            .uri("https://shop.example:8443/cart")
            .header("host", "shop.example:8443")
            .header("x-forwarded-proto", "http")
            .body(Bytes::new())
            .unwrap();

        sanitize_and_dispatch(&backend, outer, RequestType::Main, &TrustedProxies::parse(&["0.0.0.0/0"]).unwrap())
            .await
            .unwrap();

        let seen = backend.seen.lock().unwrap();
        let inner = &seen[0];
        assert!(inner.headers().get("x-forwarded-proto").is_none());
        assert_eq!(
            inner.headers().get("forwarded").unwrap(),
            "host=\"shop.example:8443\";proto=https"
        );
        assert_eq!(inner.client_addr(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
