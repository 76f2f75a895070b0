// ABOUTME: Liveness probe interface and endpoint parsing.
// ABOUTME: One probe is one request; retry and verdict logic live in the health verifier.

mod http;

pub use http::HttpProbe;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// A plain-HTTP liveness endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    /// Parse `http://[user@]host[:port][/path][?query]`. A missing scheme means `http`.
    pub fn parse(url: &str) -> Result<Self, ProbeError> {
        let invalid = |reason: &str| ProbeError::InvalidEndpoint(format!("{url}: {reason}"));

        let uri: hyper::Uri = if url.contains("://") {
            url.parse()
        } else {
            format!("http://{url}").parse()
        }
        .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;

        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
            Some(scheme) => return Err(invalid(&format!("unsupported scheme {scheme}"))),
            None => return Err(invalid("missing scheme")),
        }

        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        // Authority parsing accepts any port text; port_u16 is None when it is not a number.
        let host_port = authority.as_str().rsplit('@').next().unwrap_or_default();
        let port_text = match host_port.rfind(']') {
            Some(i) => &host_port[i + 1..],
            None => host_port.find(':').map_or("", |i| &host_port[i..]),
        };
        let port = match (uri.port_u16(), port_text.is_empty()) {
            (Some(port), _) => port,
            (None, true) => 80,
            (None, false) => return Err(invalid("invalid port")),
        };

        let path = match uri.query() {
            Some(query) => format!("{}?{query}", uri.path()),
            None => uri.path().to_string(),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            path,
        })
    }

    /// Endpoint from an infrastructure address output plus a health path.
    pub fn from_address(address: &str, path: &str) -> Result<Self, ProbeError> {
        let mut endpoint = Self::parse(address.trim_end_matches('/'))?;
        endpoint.path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(endpoint)
    }

    /// Host to connect to; IPv6 literals come without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Host and port as sent in the `Host` header; the port is left out when it is 80.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == 80 {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Base URL without the path, as shown to operators.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base_url(), self.path)
    }
}

/// Answer to one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
}

impl ProbeResponse {
    /// 2xx and 3xx count as alive.
    pub fn is_healthy(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Result<ProbeResponse, ProbeError>;
}
