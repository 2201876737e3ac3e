//! Trusted proxy allowlist and client address resolution.
//!
//! # Responsibilities
//! - Hold the set of proxy networks whose forwarding headers are believed
//! - Resolve the real client address chain from `Forwarded` / `X-Forwarded-For`
//!
//! # Design Decisions
//! - The allowlist is an immutable value; changing it means building a new one
//! - Cloning is cheap (shared slice) so it can ride along as a request extension

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use ipnet::IpNet;

use crate::http::{Request, RequestExt};

/// Immutable allowlist of trusted proxy networks.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    nets: Arc<[IpNet]>,
}

impl TrustedProxies {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets: nets.into() }
    }

    /// Parse entries such as `10.0.0.0/8`, `192.168.1.10` or `::1`.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, String> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            let net = match entry.parse::<IpNet>() {
                Ok(net) => net,
                Err(_) => entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|_| format!("invalid trusted proxy '{}'", entry))?,
            };
            nets.push(net);
        }
        Ok(Self::new(nets))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.nets
    }

    /// This allowlist plus the loopback addresses.
    pub fn with_loopback(&self) -> Self {
        let mut nets = self.nets.to_vec();
        for loopback in [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)] {
            if !self.contains(loopback) {
                nets.push(IpNet::from(loopback));
            }
        }
        Self::new(nets)
    }
}

/// Strip quotes, IPv6 brackets and a trailing port from a forwarded node.
fn parse_node(raw: &str) -> Option<IpAddr> {
    let node = raw.trim().trim_matches('"');
    if let Some(rest) = node.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }
    if let Ok(ip) = node.parse() {
        return Some(ip);
    }
    // IPv4 with port
    match node.rsplit_once(':') {
        Some((host, _)) => host.parse().ok(),
        None => None,
    }
}

/// Addresses listed by the forwarding headers, closest to the origin client first.
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    let forwarded: Vec<&str> = headers
        .get_all(header::FORWARDED)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if !forwarded.is_empty() {
        return forwarded
            .iter()
            .flat_map(|v| v.split(','))
            .flat_map(|element| element.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                if name.trim().eq_ignore_ascii_case("for") {
                    parse_node(value)
                } else {
                    None
                }
            })
            .collect();
    }
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(parse_node)
        .collect()
}

/// Untrusted client addresses, nearest hop first (index 0 is the client to believe).
///
/// Forwarding headers are only believed when the peer itself is trusted.
pub fn client_ips(request: &Request, trusted: &TrustedProxies) -> Vec<IpAddr> {
    let Some(peer) = request.client_addr() else {
        return Vec::new();
    };
    if !trusted.contains(peer) {
        return vec![peer];
    }

    let mut chain = forwarded_chain(request.headers());
    chain.push(peer);

    let mut first_trusted = None;
    chain.retain(|ip| {
        if trusted.contains(*ip) {
            first_trusted.get_or_insert(*ip);
            false
        } else {
            true
        }
    });

    if chain.is_empty() {
        return first_trusted.into_iter().collect();
    }
    chain.reverse();
    chain
}

/// Real client address, using the allowlist attached to the request (if any).
pub fn client_ip(request: &Request) -> Option<IpAddr> {
    let trusted = request
        .extensions()
        .get::<TrustedProxies>()
        .cloned()
        .unwrap_or_default();
    client_ips(request, &trusted).into_iter().next()
}
