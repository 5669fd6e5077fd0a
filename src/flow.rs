//! Dispatches one request as its own upstream connection and streams
//! the response back to the client (spec §4.C "Upstream dispatch").
//! No connection pooling: every flow opens and tears down its own
//! upstream socket (SPEC_FULL.md Open Question 3).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::header::CONTENT_LENGTH;
use http::HeaderValue;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::Config;
use crate::error::ProxyError;
use crate::http1::{self, BodyFraming, PrefixedReader, RequestHead, Stream};
use crate::router;
use crate::secrets::SecretMap;

/// Run one request/response exchange against `host:port` and write the
/// (sanitized) response straight through to `client`.
pub async fn dispatch(
    config: &Config,
    secrets: &SecretMap,
    host: &str,
    port: u16,
    tls: bool,
    request: RequestHead,
    body: Vec<u8>,
    client: &mut (dyn Stream),
) -> Result<(), ProxyError> {
    let transformed = router::apply(config, secrets, host, request.headers);

    if transformed.blocked_secret_leak {
        write_simple_response(client, 502, "Bad Gateway", "Proxy error").await?;
        return Ok(());
    }

    let mut headers = transformed.headers;
    if body.is_empty() {
        headers.remove(CONTENT_LENGTH);
    } else {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    }

    let mut upstream = connect_upstream(host, port, tls, config.connect_timeout_secs)
        .await
        .map_err(|e| {
            tracing::warn!(host, port, %e, "upstream connect failed");
            e
        })?;

    let mut out = http1::write_request_head(&request.method, &request.target, &headers);
    out.extend_from_slice(&body);
    upstream
        .write_all(&out)
        .await
        .map_err(|e| ProxyError::Upstream(format!("write failed: {e}")))?;

    let head_bytes = http1::read_head_bytes(&mut upstream)
        .await
        .map_err(|e| ProxyError::Upstream(format!("read response failed: {e}")))?
        .ok_or_else(|| ProxyError::Upstream("upstream closed before sending a response".into()))?;
    let (head_bytes, spillover) = http1::split_head_and_spillover(head_bytes);
    let mut response = http1::parse_response_head(&head_bytes)?;
    router::sanitize_response_headers(&mut response.headers);

    let no_body = request.method.eq_ignore_ascii_case("HEAD")
        || matches!(response.status, 100..=199 | 204 | 304);
    let framing = http1::body_framing(&response.headers, no_body);

    let head_out = http1::write_response_head(response.status, &response.reason, &response.headers);
    client
        .write_all(&head_out)
        .await
        .map_err(|e| ProxyError::ClientProtocol(format!("write to client failed: {e}")))?;

    let mut upstream = PrefixedReader::new(spillover, upstream);
    match framing {
        BodyFraming::ContentLength(n) => {
            http1::passthrough_exact(&mut upstream, client, n)
                .await
                .map_err(|e| ProxyError::Upstream(format!("response body read failed: {e}")))?;
        }
        BodyFraming::Chunked => {
            http1::passthrough_chunked_body(&mut upstream, client)
                .await
                .map_err(|e| ProxyError::Upstream(format!("response body read failed: {e}")))?;
        }
        BodyFraming::UntilClose => {
            tokio::io::copy(&mut upstream, client)
                .await
                .map_err(|e| ProxyError::Upstream(format!("response body read failed: {e}")))?;
        }
        BodyFraming::None => {}
    }
    client.flush().await.map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;

    Ok(())
}

async fn write_simple_response(
    client: &mut (impl tokio::io::AsyncWrite + Unpin),
    status: u16,
    reason: &str,
    body: &str,
) -> Result<(), ProxyError> {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    client
        .write_all(response.as_bytes())
        .await
        .map_err(|e| ProxyError::ClientProtocol(e.to_string()))
}

async fn connect_upstream(
    host: &str,
    port: u16,
    tls: bool,
    timeout_secs: u64,
) -> Result<Box<dyn Stream>, ProxyError> {
    let tcp = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        TcpStream::connect((host, port)),
    )
    .await
    .map_err(|_| ProxyError::Upstream(format!("connect to {host}:{port} timed out")))?
    .map_err(|e| ProxyError::Upstream(format!("connect to {host}:{port} failed: {e}")))?;

    if !tls {
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(client_tls_config());
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Upstream(format!("invalid server name {host:?}")))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::Upstream(format!("tls handshake with {host} failed: {e}")))?;
    Ok(Box::new(stream))
}

fn client_tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_bad_gateway_on_blocked_flow() {
        let mut buf = Vec::new();
        write_simple_response(&mut buf, 502, "Bad Gateway", "Proxy error")
            .await
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway"));
        assert!(text.ends_with("Proxy error"));
    }
}
