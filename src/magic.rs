//! The `mitm.it`-style magic domain: serves the root CA certificate so
//! a client can install it as trusted, short-circuiting ahead of the
//! router (spec §4.D).

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::ca::RootCa;
use crate::error::ProxyError;
use crate::http1::RequestHead;

pub const MAGIC_HOST: &str = "mitm.it";

const INDEX_HTML: &str = concat!(
    "<!DOCTYPE html><html><head><title>Sidecar Proxy CA</title></head><body>",
    "<h1>Sidecar Proxy</h1>",
    "<p>Install the root certificate to trust intercepted connections:</p>",
    "<ul><li><a href=\"/cert/pem\">PEM</a></li><li><a href=\"/cert/crt\">CRT</a></li></ul>",
    "</body></html>",
);

pub fn is_magic_host(host: &str) -> bool {
    host.eq_ignore_ascii_case(MAGIC_HOST)
}

/// Serve a request to the magic domain directly, without consulting
/// the router or touching any upstream connection.
pub async fn handle(
    request: &RequestHead,
    ca: &RootCa,
    client: &mut (impl AsyncWrite + Unpin),
) -> Result<(), ProxyError> {
    match request.target.as_str() {
        "/" | "/index.html" => write_response(client, 200, "OK", "text/html", INDEX_HTML.as_bytes()).await,
        "/cert/pem" => write_attachment(client, ca.cert_pem().as_bytes(), "application/x-pem-file").await,
        "/cert/crt" => write_attachment(client, ca.cert_pem().as_bytes(), "application/x-x509-ca-cert").await,
        _ => write_response(client, 501, "Not Implemented", "text/plain", b"Not Implemented").await,
    }
}

async fn write_response(
    client: &mut (impl AsyncWrite + Unpin),
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> Result<(), ProxyError> {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    client
        .write_all(head.as_bytes())
        .await
        .map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;
    client
        .write_all(body)
        .await
        .map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;
    client.flush().await.map_err(|e| ProxyError::ClientProtocol(e.to_string()))
}

async fn write_attachment(
    client: &mut (impl AsyncWrite + Unpin),
    body: &[u8],
    content_type: &str,
) -> Result<(), ProxyError> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Disposition: attachment; filename=\"ca.crt\"\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    client
        .write_all(head.as_bytes())
        .await
        .map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;
    client
        .write_all(body)
        .await
        .map_err(|e| ProxyError::ClientProtocol(e.to_string()))?;
    client.flush().await.map_err(|e| ProxyError::ClientProtocol(e.to_string()))
}
