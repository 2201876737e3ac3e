//! Cache coordinator.
//!
//! # Responsibilities
//! - Decide per request between pass, lookup, fetch and revalidation
//! - Keep stampedes off the origin with the store's per-key lock
//! - Assemble surrogate fragments through nested sub-requests
//! - Record every decision in the request's [`Trace`]
//!
//! # Data Flow
//! ```text
//! handle(request)
//!     → unsafe method        → pass → invalidate key, Location, Content-Location
//!     → Expect / OPTIONS …   → pass
//!     → no-cache + reload    → fetch
//!     → lookup
//!         → none             → miss → fetch → store
//!         → fresh            → serve entry
//!         → stale, locked    → validate (conditional GET) → store → unlock
//!         → stale, contended → stale-while-revalidate | wait for lock | 503
//!     → restore body (evaluate fragments) → aggregate freshness → 304 check
//! ```
//!
//! # Design Decisions
//! - Each master request gets its own store session, so locks belong to the request
//!   and are released when it finishes or is dropped
//! - Fragments run on the same task, in body order, through the same state machine
//! - Store failures are traced and logged but never stop delivery unless `debug` is set

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderValue, Method, StatusCode};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::time::Instant;

use super::error::CacheError;
use super::strategy::ResponseCacheStrategy;
use super::trace::{Trace, TraceEvent};
use crate::backend::{Backend, RequestType};
use crate::config::CacheConfig;
use crate::http::request::resolve_uri;
use crate::http::{clone_request, CacheControl, Request, RequestExt, Response, ResponseExt};
use crate::observability::metrics;
use crate::security::{sanitize_and_dispatch, TrustedProxies};
use crate::store::{Store, StoreError, X_BODY_FILE, X_CONTENT_DIGEST, X_STATUS};
use crate::surrogate::{FragmentFetcher, Surrogate, SurrogateError, X_BODY_EVAL};

/// Debug header carrying the trace log of the master request.
pub const X_CACHE_TRACE: &str = "x-cache-trace";

const LOCK_POLL: Duration = Duration::from_millis(50);
const RETRY_AFTER_SECS: u64 = 10;
const INTERNAL_HEADERS: [&str; 4] = [X_CONTENT_DIGEST, X_BODY_FILE, X_BODY_EVAL, X_STATUS];

/// State shared by a master request and all of its fragment sub-requests.
struct RequestContext {
    main: Request,
    store: Arc<dyn Store>,
    trace: Mutex<Trace>,
    strategy: Mutex<ResponseCacheStrategy>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RequestContext {
    fn new(main: &Request, store: Arc<dyn Store>) -> Self {
        Self {
            main: clone_request(main),
            store,
            trace: Mutex::new(Trace::default()),
            strategy: Mutex::new(ResponseCacheStrategy::new()),
        }
    }

    fn begin(&self, request: &Request) {
        lock(&self.trace).begin(request);
    }

    fn record(&self, request: &Request, event: TraceEvent) {
        metrics::record_cache_event(event);
        lock(&self.trace).record(request, event);
    }

    fn trace_log(&self) -> String {
        lock(&self.trace).log()
    }

    fn into_trace(self) -> Trace {
        self.trace.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fragment fetcher handed to the surrogate processor during body evaluation.
struct SubRequests<'a> {
    cache: &'a HttpCache,
    ctx: &'a RequestContext,
    depth: usize,
}

#[async_trait]
impl<'a> FragmentFetcher for SubRequests<'a> {
    fn main_request(&self) -> &Request {
        &self.ctx.main
    }

    async fn fetch(&self, request: Request) -> Result<Response, CacheError> {
        self.cache
            .handle_in(self.ctx, request, RequestType::Sub, self.depth + 1)
            .await
    }
}

/// Shared HTTP cache in front of a [`Backend`].
pub struct HttpCache {
    backend: Arc<dyn Backend>,
    store: Arc<dyn Store>,
    options: CacheConfig,
    surrogates: Vec<Surrogate>,
    trusted: TrustedProxies,
}

impl HttpCache {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn Store>, options: CacheConfig) -> Self {
        Self {
            backend,
            store,
            options,
            surrogates: Vec::new(),
            trusted: TrustedProxies::default(),
        }
    }

    /// Register the dialects advertised to the origin and processed in its responses.
    pub fn with_surrogates(mut self, surrogates: Vec<Surrogate>) -> Self {
        self.surrogates = surrogates;
        self
    }

    pub fn with_trusted_proxies(mut self, trusted: TrustedProxies) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn options(&self) -> &CacheConfig {
        &self.options
    }

    pub fn surrogates(&self) -> &[Surrogate] {
        &self.surrogates
    }

    pub async fn handle(&self, request: Request) -> Result<Response, CacheError> {
        self.handle_traced(request).await.map(|(response, _)| response)
    }

    /// Handle a master request and return the decisions taken along the way.
    pub async fn handle_traced(&self, request: Request) -> Result<(Response, Trace), CacheError> {
        let ctx = RequestContext::new(&request, self.store.session());
        let response = self.handle_in(&ctx, request, RequestType::Main, 0).await?;
        Ok((response, ctx.into_trace()))
    }

    fn handle_in<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: Request,
        kind: RequestType,
        depth: usize,
    ) -> BoxFuture<'a, Result<Response, CacheError>> {
        async move {
            if depth > self.options.max_fragment_depth {
                return Err(CacheError::NestingTooDeep(self.options.max_fragment_depth));
            }
            ctx.begin(&request);

            let mut response = if !request.is_method_safe() {
                self.invalidate(ctx, &request, kind).await?
            } else if request.headers().contains_key(header::EXPECT) || !request.is_method_cacheable() {
                self.pass(ctx, &request, kind).await?
            } else if self.options.allow_reload && request.is_no_cache() {
                ctx.record(&request, TraceEvent::Reload);
                self.fetch(ctx, &request, kind).await?
            } else {
                self.lookup(ctx, &request, kind).await?
            };

            self.restore_response_body(ctx, &request, &mut response, depth).await?;

            if !self.surrogates.is_empty() {
                let mut strategy = lock(&ctx.strategy);
                match kind {
                    RequestType::Main => strategy.update(&mut response),
                    RequestType::Sub => strategy.add(&response),
                }
            }

            prepare(&request, &mut response);
            response.apply_not_modified(&request);

            if kind == RequestType::Main {
                for name in INTERNAL_HEADERS {
                    response.headers_mut().remove(name);
                }
                let log = ctx.trace_log();
                tracing::debug!(method = %request.method(), uri = %request.uri(), trace = %log, "Cache trace");
                if self.options.debug {
                    if let Ok(value) = HeaderValue::from_str(&log) {
                        response.headers_mut().insert(X_CACHE_TRACE, value);
                    }
                }
            }
            Ok(response)
        }
        .boxed()
    }

    /// Unsafe methods: forward, then drop stored copies of everything the response names.
    async fn invalidate(&self, ctx: &RequestContext, request: &Request, kind: RequestType) -> Result<Response, CacheError> {
        let response = self.pass(ctx, request, kind).await?;
        if !(response.status().is_success() || response.status().is_redirection()) {
            return Ok(response);
        }

        match invalidate_targets(ctx.store.as_ref(), request, &response) {
            Ok(()) => ctx.record(request, TraceEvent::Invalidate),
            Err(e) => {
                ctx.record(request, TraceEvent::InvalidateFailed);
                metrics::record_store_error("invalidate");
                tracing::warn!(uri = %request.uri(), error = %e, "Cache invalidation failed");
                if self.options.debug {
                    return Err(e.into());
                }
            }
        }
        Ok(response)
    }

    async fn pass(&self, ctx: &RequestContext, request: &Request, kind: RequestType) -> Result<Response, CacheError> {
        ctx.record(request, TraceEvent::Pass);
        self.forward(clone_request(request), kind).await
    }

    async fn lookup(&self, ctx: &RequestContext, request: &Request, kind: RequestType) -> Result<Response, CacheError> {
        let mut waited = false;
        loop {
            let entry = match ctx.store.lookup(request) {
                Ok(entry) => entry,
                Err(e) => {
                    ctx.record(request, TraceEvent::LookupFailed);
                    metrics::record_store_error("lookup");
                    tracing::warn!(uri = %request.uri(), error = %e, "Cache lookup failed");
                    if self.options.debug {
                        return Err(e.into());
                    }
                    return self.pass(ctx, request, kind).await;
                }
            };

            let Some(mut entry) = entry else {
                ctx.record(request, TraceEvent::Miss);
                return self.fetch(ctx, request, kind).await;
            };

            if self.is_fresh_enough(request, &entry) {
                ctx.record(request, TraceEvent::Fresh);
                set_age(&mut entry);
                return Ok(entry);
            }
            ctx.record(request, TraceEvent::Stale);

            if entry.is_fresh() {
                // Only the client's max-age made it stale; nobody else needs to wait on this.
                return self.validate(ctx, request, entry, kind).await;
            }

            let acquired = match ctx.store.lock(request) {
                Ok(acquired) => acquired,
                Err(e) => {
                    metrics::record_store_error("lock");
                    tracing::warn!(uri = %request.uri(), error = %e, "Cache lock failed, revalidating unlocked");
                    true
                }
            };
            if acquired {
                let result = self.validate(ctx, request, entry, kind).await;
                if let Err(e) = ctx.store.unlock(request) {
                    metrics::record_store_error("unlock");
                    tracing::warn!(uri = %request.uri(), error = %e, "Cache unlock failed");
                }
                return result;
            }

            if within_window(&entry, "stale-while-revalidate", self.options.stale_while_revalidate) {
                ctx.record(request, TraceEvent::StaleWhileRevalidate);
                set_age(&mut entry);
                return Ok(entry);
            }

            if !waited && self.wait_for_lock(ctx, request).await {
                waited = true;
                continue;
            }

            tracing::warn!(uri = %request.uri(), "Revalidation still running elsewhere, answering 503");
            *entry.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            entry
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            return Ok(entry);
        }
    }

    fn is_fresh_enough(&self, request: &Request, entry: &Response) -> bool {
        if !entry.is_fresh() {
            return false;
        }
        if self.options.allow_revalidate {
            if let Some(max_age) = CacheControl::from_headers(request.headers()).seconds("max-age") {
                return max_age > 0 && max_age >= entry.age();
            }
        }
        true
    }

    /// Poll until the key is unlocked or `lock_wait_ms` elapses. True when released.
    async fn wait_for_lock(&self, ctx: &RequestContext, request: &Request) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.options.lock_wait_ms);
        loop {
            match ctx.store.is_locked(request) {
                Ok(false) => return true,
                Ok(true) if Instant::now() >= deadline => return false,
                Ok(true) => tokio::time::sleep(LOCK_POLL).await,
                Err(e) => {
                    tracing::warn!(uri = %request.uri(), error = %e, "Cannot read cache lock state");
                    return true;
                }
            }
        }
    }

    async fn validate(
        &self,
        ctx: &RequestContext,
        request: &Request,
        mut entry: Response,
        kind: RequestType,
    ) -> Result<Response, CacheError> {
        let mut conditional = clone_request(request);
        if conditional.method() == Method::HEAD {
            *conditional.method_mut() = Method::GET;
        }

        let headers = conditional.headers_mut();
        headers.remove(header::IF_MODIFIED_SINCE);
        if let Some(last_modified) = entry.headers().get(header::LAST_MODIFIED) {
            headers.insert(header::IF_MODIFIED_SINCE, last_modified.clone());
        }

        // Client tags are kept: the client may hold a valid private copy we never stored.
        let cached_etags: Vec<String> = entry.etag().map(str::to_string).into_iter().collect();
        let request_etags = request.etags();
        let mut etags = cached_etags.clone();
        for tag in &request_etags {
            if !etags.contains(tag) {
                etags.push(tag.clone());
            }
        }
        headers.remove(header::IF_NONE_MATCH);
        if !etags.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&etags.join(", ")) {
                headers.insert(header::IF_NONE_MATCH, value);
            }
        }

        let outcome = self.forward(conditional, kind).await;
        let origin_failed = match &outcome {
            Ok(response) => matches!(response.status().as_u16(), 500 | 502 | 503 | 504),
            Err(e) => e.is_origin_failure(),
        };
        if origin_failed && within_window(&entry, "stale-if-error", self.options.stale_if_error) {
            ctx.record(request, TraceEvent::StaleIfError);
            tracing::warn!(uri = %request.uri(), "Origin failed during revalidation, serving stale entry");
            set_age(&mut entry);
            return Ok(entry);
        }
        let mut response = outcome?;

        if response.status() == StatusCode::NOT_MODIFIED {
            ctx.record(request, TraceEvent::Valid);

            let client_only = response.etag().is_some_and(|etag| {
                request_etags.iter().any(|tag| tag == etag) && !cached_etags.iter().any(|tag| tag == etag)
            });
            if client_only {
                return Ok(response);
            }

            entry.headers_mut().remove(header::DATE);
            for name in [
                header::DATE,
                header::EXPIRES,
                header::CACHE_CONTROL,
                header::ETAG,
                header::LAST_MODIFIED,
            ] {
                if let Some(value) = response.headers().get(&name).cloned() {
                    entry.headers_mut().insert(name, value);
                }
            }
            response = entry;
        } else {
            ctx.record(request, TraceEvent::Invalid);
        }

        if response.is_cacheable() {
            self.store_response(ctx, request, &mut response)?;
        }
        Ok(response)
    }

    async fn fetch(&self, ctx: &RequestContext, request: &Request, kind: RequestType) -> Result<Response, CacheError> {
        let mut outbound = clone_request(request);
        if outbound.method() == Method::HEAD {
            *outbound.method_mut() = Method::GET;
        }
        // The origin must answer with content, not a 304 for the client's copy.
        outbound.headers_mut().remove(header::IF_MODIFIED_SINCE);
        outbound.headers_mut().remove(header::IF_NONE_MATCH);

        let mut response = self.forward(outbound, kind).await?;
        if response.is_cacheable() {
            self.store_response(ctx, request, &mut response)?;
        }
        Ok(response)
    }

    async fn forward(&self, mut request: Request, kind: RequestType) -> Result<Response, CacheError> {
        for surrogate in &self.surrogates {
            surrogate.advertise_capability(&mut request);
        }

        let mut response =
            sanitize_and_dispatch(self.backend.as_ref(), clone_request(&request), kind, &self.trusted).await?;
        // Internal markers are only ever set by this cache.
        for name in INTERNAL_HEADERS {
            response.headers_mut().remove(name);
        }
        response.ensure_date();

        if let Some(surrogate) = self.surrogates.iter().find(|s| s.needs_processing(&response)) {
            surrogate.process(&request, &mut response)?;
        }

        let cc = response.cache_control();
        if self.is_private_request(&request) && !cc.has("public") {
            response.set_private();
        } else if self.options.default_ttl > 0 && response.ttl().is_none() && !cc.has("must-revalidate") {
            response.set_ttl(self.options.default_ttl);
        }
        Ok(response)
    }

    fn is_private_request(&self, request: &Request) -> bool {
        self.options
            .private_headers
            .iter()
            .any(|name| request.headers().contains_key(name.as_str()))
    }

    fn store_response(&self, ctx: &RequestContext, request: &Request, response: &mut Response) -> Result<(), CacheError> {
        match ctx.store.write(request, response) {
            Ok(key) => {
                ctx.record(request, TraceEvent::Store);
                tracing::debug!(key = %key, uri = %request.uri(), "Response cached");
                set_age(response);
            }
            Err(e) => {
                ctx.record(request, TraceEvent::StoreFailed);
                metrics::record_store_error("write");
                tracing::warn!(uri = %request.uri(), error = %e, "Failed to store response");
                if self.options.debug {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Load the stored body, evaluating surrogate templates into the final content.
    async fn restore_response_body(
        &self,
        ctx: &RequestContext,
        request: &Request,
        response: &mut Response,
        depth: usize,
    ) -> Result<(), CacheError> {
        if let Some(marker) = response.header_str(X_BODY_EVAL).map(str::to_string) {
            let surrogate = Surrogate::from_marker(&marker).ok_or(SurrogateError::UnknownDialect(marker))?;
            ctx.store.restore_body(response)?;

            let fetcher = SubRequests { cache: self, ctx, depth };
            let body = surrogate.evaluate(&fetcher, response.body()).await?;

            response.headers_mut().remove(X_BODY_EVAL);
            if !response.headers().contains_key(header::TRANSFER_ENCODING) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            }
            *response.body_mut() = body;
        } else if response.headers().contains_key(X_BODY_FILE) {
            // Static content is not needed to answer HEAD.
            if request.method() != Method::HEAD {
                ctx.store.restore_body(response)?;
            }
            response.headers_mut().remove(X_BODY_FILE);
        }
        Ok(())
    }
}

fn invalidate_targets(store: &dyn Store, request: &Request, response: &Response) -> Result<(), StoreError> {
    store.invalidate(request)?;
    for name in [header::LOCATION, header::CONTENT_LOCATION] {
        let Some(uri) = response
            .header_str(name.as_str())
            .and_then(|target| resolve_uri(request, target))
        else {
            continue;
        };
        let mut target = clone_request(request);
        *target.method_mut() = Method::GET;
        *target.uri_mut() = uri;
        *target.body_mut() = Bytes::new();
        store.invalidate(&target)?;
    }
    Ok(())
}

/// Whether a stale entry is still inside the window named by `directive` (or `default`).
fn within_window(entry: &Response, directive: &str, default: i64) -> bool {
    let window = entry.cache_control().seconds(directive).unwrap_or(default);
    entry.ttl().unwrap_or(0).saturating_abs() < window
}

fn set_age(response: &mut Response) {
    let age = response.age().max(0);
    response.headers_mut().insert(header::AGE, HeaderValue::from(age));
}

/// Fix up the body for the request method and status.
fn prepare(request: &Request, response: &mut Response) {
    let status = response.status();
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        *response.body_mut() = Bytes::new();
        response.headers_mut().remove(header::CONTENT_TYPE);
        response.headers_mut().remove(header::CONTENT_LENGTH);
        return;
    }

    let head = request.method() == Method::HEAD;
    // A HEAD answered from the store has no body loaded; keep the stored length.
    if !response.headers().contains_key(header::TRANSFER_ENCODING) && !(head && response.body().is_empty()) {
        let len = response.body().len();
        response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if head {
        *response.body_mut() = Bytes::new();
    }
}
