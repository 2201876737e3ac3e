//! Cacheability aggregation across a master response and its embedded fragments.

use axum::http::{header, HeaderValue};

use crate::http::{CacheControl, Response, ResponseExt};

/// Collects freshness facts from fragment responses and folds them into the master.
#[derive(Debug)]
pub struct ResponseCacheStrategy {
    cacheable: bool,
    embedded: usize,
    ttls: Vec<Option<i64>>,
    max_ages: Vec<Option<i64>>,
}

impl ResponseCacheStrategy {
    pub fn new() -> Self {
        Self {
            cacheable: true,
            embedded: 0,
            ttls: Vec::new(),
            max_ages: Vec::new(),
        }
    }

    pub fn embedded(&self) -> usize {
        self.embedded
    }

    /// Record an embedded fragment response.
    pub fn add(&mut self, response: &Response) {
        let cc = response.cache_control();
        let validator_only = response.is_validateable() && response.max_age().is_none();
        if validator_only || cc.has("private") || cc.has("no-store") {
            self.cacheable = false;
        } else {
            self.ttls.push(response.ttl());
            self.max_ages.push(response.max_age());
        }
        self.embedded += 1;
    }

    /// Rewrite the master response's caching headers from the collected fragments.
    pub fn update(&mut self, response: &mut Response) {
        if self.embedded == 0 {
            return;
        }

        if response.is_validateable() {
            response.headers_mut().remove(header::ETAG);
            response.headers_mut().remove(header::LAST_MODIFIED);
            self.cacheable = false;
        }

        if !self.cacheable {
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("must-revalidate, no-cache, private"),
            );
            return;
        }

        self.ttls.push(response.ttl());
        self.max_ages.push(response.max_age());

        let min_max_age = self.max_ages.iter().copied().collect::<Option<Vec<_>>>()
            .and_then(|ages| ages.into_iter().min());
        let min_ttl = self.ttls.iter().copied().collect::<Option<Vec<_>>>()
            .and_then(|ttls| ttls.into_iter().min());

        match (min_max_age, min_ttl) {
            (Some(max_age), Some(ttl)) => {
                response.set_shared_max_age(max_age);
                let age = max_age.saturating_sub(ttl).max(0);
                response.headers_mut().insert(header::AGE, HeaderValue::from(age));
            }
            _ => {
                let mut cc = response.cache_control();
                cc.remove("s-maxage");
                response.set_cache_control(&cc);
            }
        }

        let mut cc: CacheControl = response.cache_control();
        cc.set_seconds("max-age", 0);
        response.set_cache_control(&cc);
    }
}

impl Default for ResponseCacheStrategy {
    fn default() -> Self {
        Self::new()
    }
}
