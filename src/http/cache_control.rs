//! `Cache-Control` directive parsing and serialization.
//!
//! Directives keep their original order so that a parsed header written back out
//! stays recognizable in logs. Names are case-insensitive and stored lowercased.

use axum::http::{header, HeaderMap, HeaderValue};

/// Ordered set of Cache-Control directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: Vec<(String, Option<String>)>,
}

impl CacheControl {
    /// Parse a single header value such as `public, max-age=60, stale-if-error="30"`.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, arg) = match part.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"').to_string())),
                None => (part, None),
            };
            cc.set(name, arg.as_deref());
        }
        cc
    }

    /// Parse every Cache-Control header present in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cc = Self::default();
        for value in headers.get_all(header::CACHE_CONTROL) {
            if let Ok(value) = value.to_str() {
                for (name, arg) in Self::parse(value).directives {
                    cc.set(&name, arg.as_deref());
                }
            }
        }
        cc
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.directives.iter().any(|(n, _)| *n == name)
    }

    /// Argument of a directive; `Some(None)` for a bare directive.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        let name = name.to_ascii_lowercase();
        self.directives
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, arg)| arg.as_deref())
    }

    /// Numeric argument of a directive (`max-age`, `s-maxage`, ...).
    pub fn seconds(&self, name: &str) -> Option<i64> {
        self.get(name).flatten().and_then(|arg| arg.parse().ok())
    }

    pub fn set(&mut self, name: &str, arg: Option<&str>) {
        let name = name.to_ascii_lowercase();
        let arg = arg.map(str::to_string);
        match self.directives.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = arg,
            None => self.directives.push((name, arg)),
        }
    }

    pub fn set_seconds(&mut self, name: &str, secs: i64) {
        self.set(name, Some(&secs.to_string()));
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.directives.retain(|(n, _)| *n != name);
    }

    /// Serialize back into a header value, or `None` when no directive is left.
    pub fn to_header_value(&self) -> Option<HeaderValue> {
        if self.directives.is_empty() {
            return None;
        }
        HeaderValue::from_str(&self.to_string()).ok()
    }

    /// Replace the Cache-Control header(s) in `headers` with this directive set.
    pub fn apply(&self, headers: &mut HeaderMap) {
        match self.to_header_value() {
            Some(value) => {
                headers.insert(header::CACHE_CONTROL, value);
            }
            None => {
                headers.remove(header::CACHE_CONTROL);
            }
        }
    }
}

impl std::fmt::Display for CacheControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (name, arg)) in self.directives.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match arg {
                Some(arg) if arg.contains([',', ' ', ';']) => write!(f, "{}=\"{}\"", name, arg)?,
                Some(arg) => write!(f, "{}={}", name, arg)?,
                None => write!(f, "{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let cc = CacheControl::parse("Public, max-age=60, s-maxage=\"120\", no-transform");
        assert!(cc.has("public"));
        assert_eq!(cc.seconds("max-age"), Some(60));
        assert_eq!(cc.seconds("s-maxage"), Some(120));
        assert_eq!(cc.get("no-transform"), Some(None));
        assert_eq!(cc.get("private"), None);
    }

    #[test]
    fn test_roundtrip_keeps_order() {
        let mut cc = CacheControl::parse("private, max-age=0");
        cc.remove("private");
        cc.set("public", None);
        cc.set_seconds("s-maxage", 30);
        assert_eq!(cc.to_string(), "max-age=0, public, s-maxage=30");
    }

    #[test]
    fn test_merges_multiple_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::CACHE_CONTROL, HeaderValue::from_static("public"));
        headers.append(header::CACHE_CONTROL, HeaderValue::from_static("max-age=5"));
        let cc = CacheControl::from_headers(&headers);
        assert!(cc.has("public"));
        assert_eq!(cc.seconds("max-age"), Some(5));

        let mut out = HeaderMap::new();
        CacheControl::default().apply(&mut out);
        assert!(out.get(header::CACHE_CONTROL).is_none());
    }
}
