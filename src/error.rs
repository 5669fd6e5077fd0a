//! Error kinds for the proxy core (spec §7).
//!
//! Startup failures are fatal and surface through `anyhow` in `main`.
//! Everything here is for errors that must be classified so a flow
//! handler can pick the right client-visible response.

use thiserror::Error;

/// Top-level error kind for a single flow (client request/response exchange).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("ca error: {0}")]
    Ca(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Status line to write back to the client for this error kind.
    pub fn status_line(&self) -> &'static str {
        match self {
            ProxyError::ClientProtocol(_) => "HTTP/1.1 400 Bad Request",
            ProxyError::Upstream(_) => "HTTP/1.1 502 Bad Gateway",
            ProxyError::Ca(_) => "HTTP/1.1 502 Bad Gateway",
            ProxyError::Internal(_) => "HTTP/1.1 500 Internal Server Error",
        }
    }

    /// Opaque body to write back to the client — never leaks hostnames,
    /// tokens, or internal state (spec §7).
    pub fn body(&self) -> &'static str {
        match self {
            ProxyError::ClientProtocol(_) => "Bad Request",
            ProxyError::Upstream(_) | ProxyError::Ca(_) => "Proxy error",
            ProxyError::Internal(_) => "Internal error",
        }
    }

    /// A complete, ready-to-write HTTP/1.1 response for this error.
    pub fn response_bytes(&self) -> Vec<u8> {
        let body = self.body();
        format!(
            "{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status_line(),
            body.len(),
            body
        )
        .into_bytes()
    }
}

/// Config-loading errors (fatal at startup).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
