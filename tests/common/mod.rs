//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use http_cache_proxy::backend::{Backend, BackendError, RequestType};
use http_cache_proxy::config::CacheConfig;
use http_cache_proxy::http::date::format_http_date;
use http_cache_proxy::http::{Request, Response};
use http_cache_proxy::{FileStore, HttpCache, Surrogate};

/// Store directory removed when dropped.
pub struct TempRoot(pub PathBuf);

impl TempRoot {
    pub fn new(name: &str) -> Self {
        Self(std::env::temp_dir().join(format!("http-cache-proxy-{}-{}", name, uuid::Uuid::new_v4())))
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

type Handler = dyn Fn(&Request, usize) -> Result<Response, BackendError> + Send + Sync;

/// In-process origin: answers from a closure and remembers what it was sent.
pub struct ScriptedOrigin {
    calls: AtomicUsize,
    seen: Mutex<Vec<Request>>,
    handler: Box<Handler>,
}

impl ScriptedOrigin {
    /// The handler receives the request and the zero-based call number.
    pub fn new(
        handler: impl Fn(&Request, usize) -> Result<Response, BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Value of `name` on the n-th request the origin received.
    pub fn header(&self, call: usize, name: &str) -> Option<String> {
        let seen = self.seen.lock().unwrap();
        seen.get(call)?
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn path(&self, call: usize) -> Option<String> {
        let seen = self.seen.lock().unwrap();
        seen.get(call).map(|r| r.uri().path().to_string())
    }
}

#[async_trait]
impl Backend for ScriptedOrigin {
    async fn handle(&self, request: Request, _kind: RequestType) -> Result<Response, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let response = (self.handler)(&request, call);
        self.seen.lock().unwrap().push(request);
        response
    }
}

pub fn cache(root: &TempRoot, origin: Arc<ScriptedOrigin>, options: CacheConfig, surrogates: Vec<Surrogate>) -> HttpCache {
    let store = Arc::new(FileStore::open(&root.0).unwrap());
    HttpCache::new(origin, store, options).with_surrogates(surrogates)
}

pub fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> Request {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::new()).unwrap()
}

pub fn get(uri: &str) -> Request {
    request("GET", uri, &[])
}

/// Origin response stamped with the current date.
pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> Response {
    let mut builder = axum::http::Response::builder()
        .status(status)
        .header("date", format_http_date(chrono::Utc::now()));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::from(body.to_string())).unwrap()
}

/// Request as seen by a TCP origin.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reply of a TCP origin: status, extra headers and body.
pub type RawResponse = (u16, Vec<(String, String)>, String);

fn parse_head(head: &str) -> Option<RawRequest> {
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();
    Some(RawRequest { method, path, headers })
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Start a programmable HTTP/1.1 origin on an ephemeral port (one request per connection).
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(RawRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RawResponse> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut buf = Vec::new();
                        let mut chunk = [0u8; 4096];
                        let head = loop {
                            match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                                break String::from_utf8_lossy(&buf[..end]).into_owned();
                            }
                        };
                        let Some(request) = parse_head(&head) else {
                            return;
                        };
                        let (status, headers, body) = f(request).await;

                        let mut response = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
                        for (name, value) in headers {
                            response.push_str(&format!("{}: {}\r\n", name, value));
                        }
                        response.push_str(&format!(
                            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        ));
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Start a mock origin that always returns the same cacheable body.
pub async fn start_mock_backend(body: &'static str, cache_control: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move {
        (
            200,
            vec![("Cache-Control".to_string(), cache_control.to_string())],
            body.to_string(),
        )
    })
    .await
}
