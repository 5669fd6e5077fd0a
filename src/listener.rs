//! TCP accept loop and per-connection dispatch: a `CONNECT` request
//! starts a TLS-terminated tunnel (spec §4.A/§4.B); anything else is
//! treated as a plain absolute-form HTTP request and forwarded as-is.
//!
//! Each connection runs in its own `tokio::spawn`ed task, so a panic
//! or error handling one client never takes down the listener or any
//! other in-flight connection — the same shape the CONNECT-proxy
//! reference this was built from uses for its accept loop.

use std::sync::Arc;

use http::Uri;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::ca::RootCa;
use crate::config::Config;
use crate::connect;
use crate::error::ProxyError;
use crate::flow;
use crate::http1::{self, BodyFraming, PrefixedReader};
use crate::magic;
use crate::router;
use crate::secrets::SecretMap;

/// Shared, read-mostly state handed to every connection task.
pub struct AppContext {
    pub config: Arc<Config>,
    pub secrets: Arc<SecretMap>,
    pub ca: Arc<RootCa>,
}

/// Accept connections forever, spawning one task per connection.
pub async fn run(listener: TcpListener, ctx: Arc<AppContext>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, ctx).await {
                tracing::warn!(%peer, %err, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: Arc<AppContext>) -> Result<(), ProxyError> {
    let head_bytes = match http1::read_head_bytes(&mut stream).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(()),
        Err(e) => {
            let err = ProxyError::ClientProtocol(format!("read request failed: {e}"));
            write_error_response(&mut stream, &err).await;
            return Err(err);
        }
    };
    let (head_bytes, spillover) = http1::split_head_and_spillover(head_bytes);
    let request = match http1::parse_request_head(&head_bytes) {
        Ok(request) => request,
        Err(err) => {
            write_error_response(&mut stream, &err).await;
            return Err(err);
        }
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        return connect::handle(stream, &request.target, ctx.config.clone(), ctx.secrets.clone(), ctx.ca.clone()).await;
    }

    if let Err(err) = handle_plain_http(&mut stream, request, spillover, &ctx).await {
        write_error_response(&mut stream, &err).await;
        return Err(err);
    }
    Ok(())
}

/// Write a ready-made HTTP error response for a failed flow (spec §7:
/// client protocol errors get 400, upstream/CA failures get 502 with an
/// opaque body, nothing upstream-specific leaks to the client).
async fn write_error_response(stream: &mut TcpStream, err: &ProxyError) {
    let _ = stream.write_all(&err.response_bytes()).await;
    let _ = stream.flush().await;
}

/// Plain (non-CONNECT) absolute-form proxying, e.g. `GET http://host/path HTTP/1.1`.
async fn handle_plain_http(
    stream: &mut TcpStream,
    mut request: http1::RequestHead,
    mut spillover: Vec<u8>,
    ctx: &Arc<AppContext>,
) -> Result<(), ProxyError> {
    loop {
        let uri: Uri = request
            .target
            .parse()
            .map_err(|_| ProxyError::ClientProtocol(format!("invalid absolute-form target {:?}", request.target)))?;
        let uri_host = uri.host().map(|h| h.to_string());
        let port = uri.port_u16().unwrap_or(80);
        let path = uri
            .path_and_query()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "/".to_string());

        let host_header = request.headers.get(http::header::HOST).and_then(|v| v.to_str().ok());
        let resolved_host = router::resolve_host(uri_host.as_deref(), host_header)
            .ok_or_else(|| ProxyError::ClientProtocol("request has no resolvable host".into()))?;

        let framing = http1::body_framing(&request.headers, false);
        let mut reader = PrefixedReader::new(spillover, &mut *stream);
        let body = match framing {
            BodyFraming::ContentLength(n) => http1::read_exact_body(&mut reader, n)
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("request body read failed: {e}")))?,
            BodyFraming::Chunked => http1::read_chunked_body(&mut reader)
                .await
                .map_err(|e| ProxyError::ClientProtocol(format!("request body read failed: {e}")))?,
            BodyFraming::None | BodyFraming::UntilClose => Vec::new(),
        };

        request.target = path;

        if magic::is_magic_host(&resolved_host) {
            magic::handle(&request, &ctx.ca, &mut *stream).await?;
        } else if let Err(err) = flow::dispatch(
            &ctx.config,
            &ctx.secrets,
            &resolved_host,
            port,
            false,
            request,
            body,
            &mut *stream,
        )
        .await
        {
            tracing::warn!(host = %resolved_host, %err, "flow failed for plain HTTP request");
            return Err(err);
        }

        let Some(head_bytes) = http1::read_head_bytes(&mut *stream)
            .await
            .map_err(|e| ProxyError::ClientProtocol(format!("read request failed: {e}")))?
        else {
            return Ok(());
        };
        let (head_bytes, next_spillover) = http1::split_head_and_spillover(head_bytes);
        request = http1::parse_request_head(&head_bytes)?;
        spillover = next_spillover;
    }
}
