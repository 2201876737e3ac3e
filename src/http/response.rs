//! Response-side cache semantics.
//!
//! # Responsibilities
//! - Freshness arithmetic (age, max-age, ttl) from Cache-Control, Expires, Age and Date
//! - Cacheability and validator checks used by the store and the coordinator
//! - Mutators for the directives the cache rewrites (s-maxage, private, expire)
//! - Conditional request evaluation (`304 Not Modified`)
//!
//! # Design Decisions
//! - Numbers are seconds as `i64`; a negative ttl means "stale by that much"
//! - Only explicit `private` makes a response private; no implicit defaults are synthesized

use axum::http::{header, HeaderValue, StatusCode};
use chrono::Utc;

use super::date::{format_http_date, parse_http_date};
use super::request::RequestExt;
use super::{CacheControl, Request, Response};

/// Status codes whose responses may be stored.
pub const CACHEABLE_STATUSES: [u16; 7] = [200, 203, 300, 301, 302, 404, 410];

pub trait ResponseExt {
    fn cache_control(&self) -> CacheControl;

    fn set_cache_control(&mut self, cc: &CacheControl);

    fn header_str(&self, name: &str) -> Option<&str>;

    fn date(&self) -> Option<chrono::DateTime<Utc>>;

    /// Add a `Date` header when the origin did not send one.
    fn ensure_date(&mut self);

    /// Seconds since the response was generated: `Age` header, else now − `Date`.
    fn age(&self) -> i64;

    /// Freshness lifetime: `s-maxage`, then `max-age`, then `Expires − Date`.
    fn max_age(&self) -> Option<i64>;

    /// Remaining freshness (max-age − age); negative once stale.
    fn ttl(&self) -> Option<i64>;

    fn is_fresh(&self) -> bool;

    fn is_validateable(&self) -> bool;

    fn is_cacheable(&self) -> bool;

    fn must_revalidate(&self) -> bool;

    fn etag(&self) -> Option<&str>;

    fn last_modified(&self) -> Option<chrono::DateTime<Utc>>;

    /// Header names listed in `Vary`.
    fn vary(&self) -> Vec<String>;

    /// Shared freshness; implies `public`.
    fn set_shared_max_age(&mut self, secs: i64);

    /// Shared freshness expressed as remaining lifetime from now.
    fn set_ttl(&mut self, secs: i64);

    fn set_private(&mut self);

    /// Mark a fresh response stale without touching its validators.
    fn expire(&mut self);

    fn set_not_modified(&mut self);

    /// Turn the response into a 304 when `request`'s conditions are satisfied.
    fn apply_not_modified(&mut self, request: &Request) -> bool;
}

impl ResponseExt for Response {
    fn cache_control(&self) -> CacheControl {
        CacheControl::from_headers(self.headers())
    }

    fn set_cache_control(&mut self, cc: &CacheControl) {
        cc.apply(self.headers_mut());
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn date(&self) -> Option<chrono::DateTime<Utc>> {
        self.header_str("date").and_then(parse_http_date)
    }

    fn ensure_date(&mut self) {
        if self.date().is_none() {
            if let Ok(value) = HeaderValue::from_str(&format_http_date(Utc::now())) {
                self.headers_mut().insert(header::DATE, value);
            }
        }
    }

    fn age(&self) -> i64 {
        if let Some(age) = self.header_str("age").and_then(|v| v.trim().parse::<i64>().ok()) {
            return age.max(0);
        }
        match self.date() {
            Some(date) => (Utc::now() - date).num_seconds().max(0),
            None => 0,
        }
    }

    fn max_age(&self) -> Option<i64> {
        let cc = self.cache_control();
        if let Some(secs) = cc.seconds("s-maxage") {
            return Some(secs);
        }
        if let Some(secs) = cc.seconds("max-age") {
            return Some(secs);
        }
        let expires = self.header_str("expires")?;
        // An unparsable Expires (e.g. "0") means already expired.
        let Some(expires) = parse_http_date(expires) else {
            return Some(0);
        };
        let date = self.date().unwrap_or_else(Utc::now);
        Some((expires - date).num_seconds())
    }

    fn ttl(&self) -> Option<i64> {
        self.max_age().map(|max_age| max_age.saturating_sub(self.age()))
    }

    fn is_fresh(&self) -> bool {
        self.ttl().is_some_and(|ttl| ttl > 0)
    }

    fn is_validateable(&self) -> bool {
        self.headers().contains_key(header::LAST_MODIFIED) || self.headers().contains_key(header::ETAG)
    }

    fn is_cacheable(&self) -> bool {
        if !CACHEABLE_STATUSES.contains(&self.status().as_u16()) {
            return false;
        }
        let cc = self.cache_control();
        if cc.has("no-store") || cc.has("private") {
            return false;
        }
        self.is_validateable() || self.is_fresh()
    }

    fn must_revalidate(&self) -> bool {
        let cc = self.cache_control();
        cc.has("must-revalidate") || cc.has("proxy-revalidate")
    }

    fn etag(&self) -> Option<&str> {
        self.header_str("etag")
    }

    fn last_modified(&self) -> Option<chrono::DateTime<Utc>> {
        self.header_str("last-modified").and_then(parse_http_date)
    }

    fn vary(&self) -> Vec<String> {
        self.headers()
            .get_all(header::VARY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn set_shared_max_age(&mut self, secs: i64) {
        let mut cc = self.cache_control();
        cc.remove("private");
        cc.set("public", None);
        cc.set_seconds("s-maxage", secs);
        self.set_cache_control(&cc);
    }

    fn set_ttl(&mut self, secs: i64) {
        let age = self.age();
        self.set_shared_max_age(age.saturating_add(secs));
    }

    fn set_private(&mut self) {
        let mut cc = self.cache_control();
        cc.remove("public");
        cc.set("private", None);
        self.set_cache_control(&cc);
    }

    fn expire(&mut self) {
        if !self.is_fresh() {
            return;
        }
        if let Some(max_age) = self.max_age() {
            self.headers_mut().insert(header::AGE, HeaderValue::from(max_age.max(0)));
        }
        self.headers_mut().remove(header::EXPIRES);
    }

    fn set_not_modified(&mut self) {
        *self.status_mut() = StatusCode::NOT_MODIFIED;
        *self.body_mut() = Default::default();
        for name in [
            header::ALLOW,
            header::CONTENT_ENCODING,
            header::CONTENT_LANGUAGE,
            header::CONTENT_LENGTH,
            header::CONTENT_TYPE,
            header::LAST_MODIFIED,
        ] {
            self.headers_mut().remove(name);
        }
        self.headers_mut().remove("content-md5");
    }

    fn apply_not_modified(&mut self, request: &Request) -> bool {
        if !request.is_method_cacheable() || !self.status().is_success() {
            return false;
        }
        let etags = request.etags();
        let mut not_modified = false;
        if !etags.is_empty() {
            not_modified = etags.iter().any(|tag| tag == "*")
                || self.etag().is_some_and(|own| etags.iter().any(|tag| tag == own));
        }
        let modified_since = request
            .headers()
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        if let (Some(since), Some(last_modified)) = (modified_since, self.last_modified()) {
            not_modified = since >= last_modified && (etags.is_empty() || not_modified);
        }
        if not_modified {
            self.set_not_modified();
        }
        not_modified
    }
}

/// Copy a buffered response (status, version, headers, body).
pub fn clone_response(response: &Response) -> Response {
    let mut copy = Response::new(response.body().clone());
    *copy.status_mut() = response.status();
    *copy.version_mut() = response.version();
    *copy.headers_mut() = response.headers().clone();
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use chrono::Duration;

    fn response(headers: &[(&str, String)]) -> Response {
        let mut builder = axum::http::Response::builder().status(200);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        builder.body(Bytes::from_static(b"body")).unwrap()
    }

    fn ago(secs: i64) -> String {
        format_http_date(Utc::now() - Duration::seconds(secs))
    }

    #[test]
    fn test_freshness_from_max_age() {
        let res = response(&[
            ("cache-control", "max-age=10".into()),
            ("date", ago(4)),
        ]);
        assert_eq!(res.max_age(), Some(10));
        let ttl = res.ttl().unwrap();
        assert!((5..=6).contains(&ttl), "ttl was {}", ttl);
        assert!(res.is_fresh());
        assert!(res.is_cacheable());
    }

    #[test]
    fn test_s_maxage_wins_over_max_age() {
        let res = response(&[("cache-control", "max-age=10, s-maxage=20".into())]);
        assert_eq!(res.max_age(), Some(20));
    }

    #[test]
    fn test_expires_relative_to_date() {
        let now = Utc::now();
        let res = response(&[
            ("date", format_http_date(now)),
            ("expires", format_http_date(now + Duration::seconds(30))),
        ]);
        assert_eq!(res.max_age(), Some(30));

        let expired = response(&[("expires", "0".into())]);
        assert!(!expired.is_fresh());
    }

    #[test]
    fn test_cacheability_rules() {
        let private = response(&[("cache-control", "private, max-age=60".into())]);
        assert!(!private.is_cacheable());

        let no_store = response(&[("cache-control", "no-store, max-age=60".into())]);
        assert!(!no_store.is_cacheable());

        let validator_only = response(&[("etag", "\"v1\"".into())]);
        assert!(validator_only.is_cacheable());
        assert!(!validator_only.is_fresh());

        let nothing = response(&[]);
        assert!(!nothing.is_cacheable());

        let mut server_error = response(&[("cache-control", "max-age=60".into())]);
        *server_error.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        assert!(!server_error.is_cacheable());
    }

    #[test]
    fn test_expire_marks_stale() {
        let mut res = response(&[
            ("cache-control", "max-age=100".into()),
            ("expires", ago(-100)),
        ]);
        res.expire();
        assert_eq!(res.age(), 100);
        assert!(!res.is_fresh());
        assert!(res.headers().get("expires").is_none());
    }

    #[test]
    fn test_extreme_lifetimes_do_not_overflow() {
        let res = response(&[
            ("cache-control", "max-age=-9223372036854775808".into()),
            ("age", "5".into()),
        ]);
        assert_eq!(res.ttl(), Some(i64::MIN));
        assert!(!res.is_fresh());

        let mut res = response(&[("age", i64::MAX.to_string())]);
        res.set_ttl(10);
        assert_eq!(res.cache_control().seconds("s-maxage"), Some(i64::MAX));
    }

    #[test]
    fn test_set_ttl_and_private() {
        let mut res = response(&[("age", "5".into()), ("cache-control", "private".into())]);
        res.set_ttl(10);
        let cc = res.cache_control();
        assert_eq!(cc.seconds("s-maxage"), Some(15));
        assert!(cc.has("public"));
        assert!(!cc.has("private"));

        res.set_private();
        let cc = res.cache_control();
        assert!(cc.has("private"));
        assert!(!cc.has("public"));
    }

    #[test]
    fn test_not_modified_by_etag() {
        let mut res = response(&[
            ("etag", "\"abc\"".into()),
            ("content-type", "text/plain".into()),
        ]);
        let req = axum::http::Request::builder()
            .uri("http://localhost/")
            .header("if-none-match", "\"abc\"")
            .body(Bytes::new())
            .unwrap();
        assert!(res.apply_not_modified(&req));
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert!(res.body().is_empty());
        assert!(res.headers().get("content-type").is_none());
    }

    #[test]
    fn test_not_modified_requires_both_validators() {
        let mut res = response(&[
            ("etag", "\"abc\"".into()),
            ("last-modified", ago(100)),
        ]);
        let req = axum::http::Request::builder()
            .uri("http://localhost/")
            .header("if-none-match", "\"other\"")
            .header("if-modified-since", ago(0))
            .body(Bytes::new())
            .unwrap();
        assert!(!res.apply_not_modified(&req));
        assert_eq!(res.status(), StatusCode::OK);
    }
}
