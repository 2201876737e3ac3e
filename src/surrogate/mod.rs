//! Surrogate fragment processing (ESI and SSI).
//!
//! # Data Flow
//! ```text
//! origin response with Surrogate-Control: content="ESI/1.0"
//!     → process()   (esi.rs / ssi.rs compile markup into a template, template.rs)
//!     → stored with x-body-eval: ESI
//!
//! delivery
//!     → evaluate()  (template segments in body order)
//!     → handle()    (nested GET through the cache via FragmentFetcher)
//!     → assembled body
//! ```
//!
//! # Design Decisions
//! - Markup is recognized by a byte scanner; unterminated tags are left as text
//! - Processed bodies never contain executable code, only `<?include …?>` directives
//! - Fragments are fetched strictly in body order on the calling task

pub mod esi;
pub mod scanner;
pub mod ssi;
pub mod template;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::http::request::resolve_uri;
use crate::http::{clone_request, Request, ResponseExt, Response};
use template::Segment;

pub const SURROGATE_CAPABILITY: &str = "surrogate-capability";
pub const SURROGATE_CONTROL: &str = "surrogate-control";

/// Dialect whose template is stored in the body (`ESI` or `SSI`).
pub const X_BODY_EVAL: &str = "x-body-eval";

const CONTENT_TYPES: [&str; 4] = ["text/html", "text/xml", "application/xhtml+xml", "application/xml"];

#[derive(Debug, Error)]
pub enum SurrogateError {
    #[error("unable to process an {dialect} tag without a \"{attribute}\" attribute")]
    MissingAttribute {
        dialect: &'static str,
        attribute: &'static str,
    },

    #[error("error when rendering \"{uri}\" (status code is {status})")]
    FragmentStatus { uri: String, status: u16 },

    #[error("error when rendering \"{uri}\": {source}")]
    Fragment {
        uri: String,
        #[source]
        source: Box<CacheError>,
    },

    #[error("fragment URI \"{0}\" cannot be resolved")]
    InvalidUri(String),

    #[error("malformed include template at byte {0}")]
    InvalidTemplate(usize),

    #[error("unknown surrogate dialect \"{0}\"")]
    UnknownDialect(String),
}

impl SurrogateError {
    /// Whether a fragment somewhere down the chain hit the nesting limit.
    pub fn is_nesting_limit(&self) -> bool {
        match self {
            SurrogateError::Fragment { source, .. } => match source.as_ref() {
                CacheError::NestingTooDeep(_) => true,
                CacheError::Surrogate(inner) => inner.is_nesting_limit(),
                _ => false,
            },
            _ => false,
        }
    }
}

/// Issues fragment sub-requests on behalf of a master request.
#[async_trait]
pub trait FragmentFetcher: Send + Sync {
    /// The original master request, as received from the client.
    fn main_request(&self) -> &Request;

    async fn fetch(&self, request: Request) -> Result<Response, CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surrogate {
    Esi,
    Ssi,
}

impl Surrogate {
    pub fn name(&self) -> &'static str {
        match self {
            Surrogate::Esi => "esi",
            Surrogate::Ssi => "ssi",
        }
    }

    /// Value of `x-body-eval` for processed bodies.
    pub fn marker(&self) -> &'static str {
        match self {
            Surrogate::Esi => "ESI",
            Surrogate::Ssi => "SSI",
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Surrogate::Esi => "ESI/1.0",
            Surrogate::Ssi => "SSI/1.0",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.trim() {
            "ESI" => Some(Surrogate::Esi),
            "SSI" => Some(Surrogate::Ssi),
            _ => None,
        }
    }

    pub fn has_capability(&self, request: &Request) -> bool {
        request
            .headers()
            .get_all(SURROGATE_CAPABILITY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains(self.token()))
    }

    /// Advertise this dialect to the origin, keeping capabilities already present.
    pub fn advertise_capability(&self, request: &mut Request) {
        let new = format!("proxy=\"{}\"", self.token());
        let value = match request
            .headers()
            .get(SURROGATE_CAPABILITY)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            Some(current) => format!("{}, {}", current, new),
            None => new,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            request.headers_mut().insert(SURROGATE_CAPABILITY, value);
        }
    }

    /// Flag a response whose body contains include markup of this dialect.
    pub fn mark_control(&self, response: &mut Response) {
        if self.has_include(response.body()) {
            let value = format!("content=\"{}\"", self.token());
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers_mut().insert(SURROGATE_CONTROL, value);
            }
        }
    }

    fn has_include(&self, body: &[u8]) -> bool {
        match self {
            Surrogate::Esi => esi::has_include(body),
            Surrogate::Ssi => ssi::has_include(body),
        }
    }

    /// Whether `Surrogate-Control` has a `content="…"` value naming this dialect.
    pub fn needs_processing(&self, response: &Response) -> bool {
        let Some(control) = response.header_str(SURROGATE_CONTROL) else {
            return false;
        };
        let mut rest = control;
        while let Some(start) = rest.find("content=\"") {
            let value = &rest[start + "content=\"".len()..];
            let Some(end) = value.find('"') else {
                return false;
            };
            if value[..end].contains(self.token()) {
                return true;
            }
            rest = &value[end + 1..];
        }
        false
    }

    pub fn render_include_tag(&self, uri: &str, alt: Option<&str>, ignore_errors: bool, comment: Option<&str>) -> String {
        match self {
            Surrogate::Esi => esi::render_include_tag(uri, alt, ignore_errors, comment),
            Surrogate::Ssi => ssi::render_include_tag(uri),
        }
    }

    /// Compile include markup in the body into a template for delivery-time evaluation.
    ///
    /// A body that already carries a template is left alone.
    pub fn process(&self, request: &Request, response: &mut Response) -> Result<(), SurrogateError> {
        if response.headers().contains_key(X_BODY_EVAL) {
            return Ok(());
        }
        let content_type = response
            .header_str(header::CONTENT_TYPE.as_str())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "text/html".to_string());
        if !CONTENT_TYPES.contains(&content_type.as_str()) {
            return Ok(());
        }

        let template = match self {
            Surrogate::Esi => esi::compile(response.body())?,
            Surrogate::Ssi => ssi::compile(response.body())?,
        };
        tracing::debug!(
            dialect = self.name(),
            uri = %request.uri(),
            "Compiled surrogate markup"
        );

        *response.body_mut() = Bytes::from(template);
        response
            .headers_mut()
            .insert(X_BODY_EVAL, HeaderValue::from_static(self.marker()));
        self.remove_from_control(response);
        Ok(())
    }

    fn remove_from_control(&self, response: &mut Response) {
        let Some(control) = response.header_str(SURROGATE_CONTROL) else {
            return;
        };
        let own = format!("content=\"{}\"", self.token());
        let remaining: Vec<&str> = control
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty() && *item != own)
            .collect();
        if remaining.is_empty() {
            response.headers_mut().remove(SURROGATE_CONTROL);
        } else if let Ok(value) = HeaderValue::from_str(&remaining.join(", ")) {
            response.headers_mut().insert(SURROGATE_CONTROL, value);
        }
    }

    /// Expand a processed template, fetching each include in body order.
    pub async fn evaluate(&self, fetcher: &dyn FragmentFetcher, template: &[u8]) -> Result<Bytes, SurrogateError> {
        let mut out = Vec::with_capacity(template.len());
        for segment in template::parse(template)? {
            match segment {
                Segment::Text(text) => out.extend_from_slice(text),
                Segment::Include(include) => {
                    let body = self
                        .handle(fetcher, &include.src, include.alt.as_deref(), include.ignore_errors)
                        .await?;
                    out.extend_from_slice(&body);
                }
            }
        }
        Ok(Bytes::from(out))
    }

    /// Resolve one include: `uri` first, `alt` once when errors are ignored.
    pub async fn handle(
        &self,
        fetcher: &dyn FragmentFetcher,
        uri: &str,
        alt: Option<&str>,
        ignore_errors: bool,
    ) -> Result<Bytes, SurrogateError> {
        match fetch_fragment(fetcher, uri).await {
            Ok(body) => Ok(body),
            Err(err) if ignore_errors && !err.is_nesting_limit() => {
                tracing::warn!(uri, error = %err, "Fragment failed, continuing");
                match alt {
                    Some(alt) => fetch_fragment(fetcher, alt).await,
                    None => Ok(Bytes::new()),
                }
            }
            Err(err) => Err(err),
        }
    }
}

async fn fetch_fragment(fetcher: &dyn FragmentFetcher, uri: &str) -> Result<Bytes, SurrogateError> {
    let main = fetcher.main_request();
    let target = resolve_uri(main, uri).ok_or_else(|| SurrogateError::InvalidUri(uri.to_string()))?;

    let mut request = clone_request(main);
    *request.method_mut() = Method::GET;
    *request.body_mut() = Bytes::new();
    request.headers_mut().remove(header::CONTENT_LENGTH);
    request.headers_mut().remove(header::CONTENT_TYPE);
    if let Some(host) = target.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
        request.headers_mut().insert(header::HOST, host);
    }
    let target_str = target.to_string();
    *request.uri_mut() = target;

    let response = fetcher.fetch(request).await.map_err(|source| SurrogateError::Fragment {
        uri: target_str.clone(),
        source: Box::new(source),
    })?;

    if response.status() == StatusCode::NOT_MODIFIED {
        return Ok(Bytes::new());
    }
    if !response.status().is_success() {
        return Err(SurrogateError::FragmentStatus {
            uri: target_str,
            status: response.status().as_u16(),
        });
    }
    Ok(response.into_body())
}
