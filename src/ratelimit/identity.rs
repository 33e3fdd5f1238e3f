//! Identity resolution from request metadata.

use axum::http::{HeaderMap, HeaderName};
use std::fmt;
use std::net::SocketAddr;

use crate::error::{GatekeeperError, Result};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// What kind of subject an identity key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// An API token taken from the identity header
    Token,
    /// A client IP address
    Ip,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Token => "token",
            IdentityKind::Ip => "ip",
        }
    }

    /// The storage key for `key`, namespaced so tokens and IPs never collide.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.as_str(), key)
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subject a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub key: String,
    pub kind: IdentityKind,
}

impl Identity {
    pub fn token(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: IdentityKind::Token,
        }
    }

    pub fn ip(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: IdentityKind::Ip,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Picks the identity a request is rate limited by.
///
/// A non-empty token header wins. Otherwise the client IP is taken from the
/// first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    header: HeaderName,
}

impl IdentityResolver {
    /// Create a resolver reading tokens from `header`.
    pub fn new(header: &str) -> Result<Self> {
        if header.is_empty() {
            return Err(GatekeeperError::Config(
                "identity header name must not be empty".to_string(),
            ));
        }

        let header = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
            GatekeeperError::Config(format!("invalid identity header {:?}: {}", header, e))
        })?;

        Ok(Self { header })
    }

    /// Resolve the identity for a request. Never fails.
    pub fn resolve(&self, headers: &HeaderMap, peer: &str) -> Identity {
        let token = headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty());

        match token {
            Some(token) => Identity::token(token),
            None => Identity::ip(client_ip(headers, peer)),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn client_ip(headers: &HeaderMap, peer: &str) -> String {
    if let Some(first) = header_str(headers, X_FORWARDED_FOR)
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_str(headers, X_REAL_IP) {
        return real_ip.to_string();
    }

    strip_port(peer)
}

/// Drop a `:port` suffix; anything without a separable port is returned as is.
fn strip_port(peer: &str) -> String {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }

    match peer.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty()
                && !host.contains(':')
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host.to_string()
        }
        _ => peer.to_string(),
    }
}
