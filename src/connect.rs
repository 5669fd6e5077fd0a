//! CONNECT tunnel handling: TLS-terminate the tunnel using a minted
//! leaf cert, then treat each inner HTTP/1.1 request as its own flow
//! (spec §4.A "CONNECT handler", §4.B "TLS termination").
//!
//! Unlike a transparent byte-copy tunnel, every request inside the
//! tunnel is parsed and run back through the transformation pipeline —
//! a client reusing one CONNECT for several keep-alive requests still
//! gets header injection applied to each one.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::ca::RootCa;
use crate::config::Config;
use crate::error::ProxyError;
use crate::flow;
use crate::http1::{self, BodyFraming, PrefixedReader};
use crate::magic;
use crate::router;
use crate::secrets::SecretMap;

/// Parse a CONNECT target of the form `host:port` (port defaults to 443).
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let target = target.trim();
    if let Some(stripped) = target.strip_prefix('[') {
        // bracketed IPv6, e.g. [::1]:443
        let (host, rest) = stripped.split_once(']')?;
        let port = rest.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(443);
        return Some((host.to_string(), port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((target.to_string(), 443)),
    }
}

/// Handle one accepted CONNECT tunnel end-to-end: reply `200`, perform
/// the server-side TLS handshake, then loop over inner requests until
/// the client closes the tunnel or a protocol error occurs.
pub async fn handle(
    mut client: TcpStream,
    target: &str,
    config: Arc<Config>,
    secrets: Arc<SecretMap>,
    ca: Arc<RootCa>,
) -> Result<(), ProxyError> {
    let Some((host, port)) = parse_connect_target(target) else {
        write_and_close(&mut client, "HTTP/1.1 400 Bad Request\r\n\r\n").await;
        return Err(ProxyError::ClientProtocol(format!("malformed CONNECT target {target:?}")));
    };

    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .map_err(|e| ProxyError::ClientProtocol(format!("failed writing CONNECT reply: {e}")))?;

    let leaf = ca.leaf_for(&host).await?;
    let server_config = build_server_config(&leaf.cert_der, &leaf.key_der)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let mut tls = acceptor
        .accept(client)
        .await
        .map_err(|e| ProxyError::Ca(format!("TLS handshake with client for {host} failed: {e}")))?;

    loop {
        let Some(head_bytes) = http1::read_head_bytes(&mut tls)
            .await
            .map_err(|e| ProxyError::ClientProtocol(format!("read request failed: {e}")))?
        else {
            // clean end of the tunnel
            return Ok(());
        };
        let (head_bytes, spillover) = http1::split_head_and_spillover(head_bytes);
        let request = http1::parse_request_head(&head_bytes)?;

        let host_header = request.headers.get(http::header::HOST).and_then(|v| v.to_str().ok());
        let resolved_host = router::resolve_host(Some(&host), host_header)
            .unwrap_or_else(|| host.clone());

        let framing = http1::body_framing(&request.headers, false);
        let mut reader = PrefixedReader::new(spillover, &mut tls);
        let body = match framing {
            BodyFraming::ContentLength(n) => http1::read_exact_body(&mut reader, n)
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("request body read failed: {e}")))?,
            BodyFraming::Chunked => http1::read_chunked_body(&mut reader)
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("request body read failed: {e}")))?,
            BodyFraming::None | BodyFraming::UntilClose => Vec::new(),
        };

        if magic::is_magic_host(&resolved_host) {
            magic::handle(&request, &ca, &mut tls).await?;
            continue;
        }

        if let Err(err) = flow::dispatch(
            &config,
            &secrets,
            &resolved_host,
            port,
            true,
            request,
            body,
            &mut tls,
        )
        .await
        {
            tracing::warn!(host = %resolved_host, %err, "flow failed inside CONNECT tunnel");
            let _ = tls.write_all(&err.response_bytes()).await;
            let _ = tls.flush().await;
            return Err(err);
        }
    }
}

fn build_server_config(cert_der: &[u8], key_der: &[u8]) -> Result<ServerConfig, ProxyError> {
    let cert = CertificateDer::from(cert_der.to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.to_vec()));
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| ProxyError::Ca(format!("failed building TLS server config: {e}")))
}

async fn write_and_close(stream: &mut (impl tokio::io::AsyncWrite + Unpin), response: &str) {
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}
