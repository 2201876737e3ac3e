//! Per-request record of cache decisions.

use std::fmt;

use crate::http::{Request, RequestExt};

/// Outcome recorded while handling one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEvent {
    Miss,
    Fresh,
    Stale,
    Valid,
    Invalid,
    Store,
    StoreFailed,
    Pass,
    Invalidate,
    InvalidateFailed,
    Reload,
    LookupFailed,
    StaleWhileRevalidate,
    StaleIfError,
}

impl TraceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceEvent::Miss => "miss",
            TraceEvent::Fresh => "fresh",
            TraceEvent::Stale => "stale",
            TraceEvent::Valid => "valid",
            TraceEvent::Invalid => "invalid",
            TraceEvent::Store => "store",
            TraceEvent::StoreFailed => "store-failed",
            TraceEvent::Pass => "pass",
            TraceEvent::Invalidate => "invalidate",
            TraceEvent::InvalidateFailed => "invalidate-failed",
            TraceEvent::Reload => "reload",
            TraceEvent::LookupFailed => "lookup-failed",
            TraceEvent::StaleWhileRevalidate => "stale-while-revalidate",
            TraceEvent::StaleIfError => "stale-if-error",
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered trace for a master request and the fragments it pulled in.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    entries: Vec<(String, Vec<TraceEvent>)>,
}

impl Trace {
    /// `METHOD /path?query`
    pub fn key(request: &Request) -> String {
        format!("{} {}", request.method(), request.path_and_query())
    }

    /// Make sure `request` has an entry even before anything is recorded.
    pub fn begin(&mut self, request: &Request) {
        let key = Self::key(request);
        if !self.entries.iter().any(|(k, _)| *k == key) {
            self.entries.push((key, Vec::new()));
        }
    }

    pub fn record(&mut self, request: &Request, event: TraceEvent) {
        let key = Self::key(request);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, events)) => events.push(event),
            None => self.entries.push((key, vec![event])),
        }
    }

    /// Events recorded for `request`.
    pub fn events(&self, request: &Request) -> &[TraceEvent] {
        let key = Self::key(request);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, events)| events.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, request: &Request, event: TraceEvent) -> bool {
        self.events(request).contains(&event)
    }

    /// Single-line rendering: `GET /: stale, valid, store; GET /frag: fresh`
    pub fn log(&self) -> String {
        self.entries
            .iter()
            .map(|(key, events)| {
                let events: Vec<&str> = events.iter().map(TraceEvent::as_str).collect();
                format!("{}: {}", key, events.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
