//! Minimal HTTP/1.1 message framing: request/response head parsing via
//! `httparse`, and body-length resolution (Content-Length / chunked /
//! connection-close) so each request inside a CONNECT tunnel — or a
//! plain absolute-form request — can be read and forwarded as its own
//! distinct flow (spec §4.A).

use std::pin::Pin;
use std::task::{Context, Poll};

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::ProxyError;

/// Any duplex byte stream a flow talks over — a plain `TcpStream` or a
/// `tokio_rustls::server::TlsStream`/`client::TlsStream`, type-erased so
/// flow/connect code doesn't need to carry TLS generics around.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Wraps a reader with bytes that were already read off the wire (e.g.
/// body bytes read alongside the head in the same TCP read) so the
/// rest of the pipeline can keep reading from one place.
pub struct PrefixedReader<R> {
    prefix: Vec<u8>,
    pos: usize,
    inner: R,
}

impl<R> PrefixedReader<R> {
    pub fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for PrefixedReader<R> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(usize),
    Chunked,
    None,
    UntilClose,
}

/// A parsed request line + headers.
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: HeaderMap,
}

/// A parsed status line + headers.
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Read raw bytes from `reader` until `\r\n\r\n` (end of headers) is
/// seen, or EOF. Returns `None` on immediate EOF (no bytes read at
/// all — a clean end of a keep-alive tunnel), `Some(buf)` otherwise.
pub async fn read_head_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(buf));
        }
        buf.extend_from_slice(&chunk[..n]);
        // `buf` may run past the `\r\n\r\n` terminator into body bytes read
        // in the same syscall; callers split that spillover off with
        // `split_head_and_spillover` before handing the rest to a body
        // reader positioned on the same stream.
        if find_subslice(&buf, b"\r\n\r\n").is_some() {
            return Ok(Some(buf));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "header block too large"));
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split head bytes (as returned by [`read_head_bytes`]) into the
/// `\r\n\r\n`-terminated head block and whatever body bytes were
/// read alongside it in the same TCP read.
pub fn split_head_and_spillover(buf: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    match find_subslice(&buf, b"\r\n\r\n") {
        Some(pos) => {
            let head_end = pos + 4;
            let mut buf = buf;
            let spillover = buf.split_off(head_end);
            (buf, spillover)
        }
        None => (buf, Vec::new()),
    }
}

/// Parse a request head (spec §4.A: malformed request line -> 400).
pub fn parse_request_head(buf: &[u8]) -> Result<RequestHead, ProxyError> {
    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_slots);
    match req
        .parse(buf)
        .map_err(|e| ProxyError::ClientProtocol(format!("malformed request: {e}")))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(ProxyError::ClientProtocol("incomplete request head".into()));
        }
    }

    let method = req
        .method
        .ok_or_else(|| ProxyError::ClientProtocol("missing method".into()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| ProxyError::ClientProtocol("missing request target".into()))?
        .to_string();
    let version = req.version.unwrap_or(1);
    let headers = headers_to_map(req.headers)?;

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Parse a response head (from an upstream connection).
pub fn parse_response_head(buf: &[u8]) -> Result<ResponseHead, ProxyError> {
    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_slots);
    match resp
        .parse(buf)
        .map_err(|e| ProxyError::Upstream(format!("malformed response: {e}")))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(ProxyError::Upstream("incomplete response head".into()));
        }
    }

    let status = resp.code.ok_or_else(|| ProxyError::Upstream("missing status code".into()))?;
    let reason = resp.reason.unwrap_or("").to_string();
    let version = resp.version.unwrap_or(1);
    let headers = headers_to_map(resp.headers)?;

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

fn headers_to_map(raw: &[httparse::Header]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::new();
    for header in raw {
        if header.name.is_empty() {
            continue;
        }
        let name = HeaderName::try_from(header.name)
            .map_err(|_| ProxyError::ClientProtocol(format!("invalid header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ProxyError::ClientProtocol(format!("invalid header value for {:?}", header.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Resolve how a message's body is framed from its headers (spec's
/// implicit requirement to support Content-Length and chunked bodies).
pub fn body_framing(headers: &HeaderMap, is_response_with_no_body_status: bool) -> BodyFraming {
    if is_response_with_no_body_status {
        return BodyFraming::None;
    }
    if let Some(te) = headers.get(http::header::TRANSFER_ENCODING).and_then(|v| v.to_str().ok()) {
        if te.to_ascii_lowercase().contains("chunked") {
            return BodyFraming::Chunked;
        }
    }
    if let Some(len) = headers.get(http::header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()) {
        if let Ok(n) = len.trim().parse::<usize>() {
            return BodyFraming::ContentLength(n);
        }
    }
    BodyFraming::None
}

/// Read exactly `n` bytes (a Content-Length-framed body) into a buffer.
pub async fn read_exact_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    n: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Decode a chunked body fully into a buffer (used for request bodies,
/// which this proxy re-frames with an explicit Content-Length after
/// stripping `Transfer-Encoding` per the hygiene step).
pub async fn read_chunked_body<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut line_buf = Vec::new();
    loop {
        line_buf.clear();
        read_crlf_line(reader, &mut line_buf).await?;
        let size_str = std::str::from_utf8(&line_buf)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size"))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size"))?;
        if size == 0 {
            // consume trailers up to the terminating blank line
            loop {
                line_buf.clear();
                read_crlf_line(reader, &mut line_buf).await?;
                if line_buf.is_empty() {
                    break;
                }
            }
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        out.extend_from_slice(&chunk);
        // consume trailing CRLF after the chunk data
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
    Ok(out)
}

/// Pass a chunked body through byte-for-byte to `writer`, preserving
/// the exact wire framing (used for response bodies — see
/// SPEC_FULL.md Open Question 2: response Transfer-Encoding is kept,
/// so the bytes must stay chunk-framed for the client to decode them).
pub async fn passthrough_chunked_body<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line_buf = Vec::new();
    loop {
        line_buf.clear();
        read_crlf_line(reader, &mut line_buf).await?;
        writer.write_all(&line_buf).await?;
        writer.write_all(b"\r\n").await?;

        let size_str = std::str::from_utf8(&line_buf)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size"))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size"))?;

        if size == 0 {
            loop {
                line_buf.clear();
                read_crlf_line(reader, &mut line_buf).await?;
                writer.write_all(&line_buf).await?;
                writer.write_all(b"\r\n").await?;
                if line_buf.is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size + 2]; // + trailing CRLF
        reader.read_exact(&mut chunk).await?;
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Copy exactly `n` bytes from `reader` to `writer` (Content-Length passthrough).
pub async fn passthrough_exact<R, W>(reader: &mut R, writer: &mut W, n: usize) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = n;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buf.len());
        let n = reader.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short body"));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n;
    }
    Ok(())
}

async fn read_crlf_line<R: AsyncRead + Unpin>(reader: &mut R, out: &mut Vec<u8>) -> std::io::Result<()> {
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if out.last() == Some(&b'\r') {
                out.pop();
            }
            return Ok(());
        }
        out.push(byte[0]);
    }
}

/// Serialize a request head back to wire bytes.
pub fn write_request_head(method: &str, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
    write_headers(&mut out, headers);
    out
}

/// Serialize a response head back to wire bytes.
pub fn write_response_head(status: u16, reason: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    write_headers(&mut out, headers);
    out
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_request_head() {
        let raw = b"GET /v1/messages HTTP/1.1\r\nHost: api.anthropic.com\r\nAuthorization: Bearer x\r\n\r\n";
        let head = parse_request_head(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/v1/messages");
        assert_eq!(head.headers.get("host").unwrap(), "api.anthropic.com");
    }

    #[test]
    fn rejects_malformed_request_line() {
        let raw = b"NOT A REQUEST\r\n\r\n";
        assert!(parse_request_head(raw).is_err());
    }

    #[test]
    fn body_framing_prefers_chunked_over_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert_eq!(body_framing(&headers, false), BodyFraming::Chunked);
    }

    #[test]
    fn body_framing_uses_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(body_framing(&headers, false), BodyFraming::ContentLength(42));
    }

    #[test]
    fn body_framing_none_without_headers() {
        let headers = HeaderMap::new();
        assert_eq!(body_framing(&headers, false), BodyFraming::None);
    }

    #[tokio::test]
    async fn decodes_chunked_body() {
        let raw = b"4\r\ntest\r\n5\r\nhello\r\n0\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let body = read_chunked_body(&mut cursor).await.unwrap();
        assert_eq!(body, b"testhello");
    }

    #[tokio::test]
    async fn passthrough_chunked_preserves_bytes() {
        let raw = b"4\r\ntest\r\n0\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let mut out = Vec::new();
        passthrough_chunked_body(&mut cursor, &mut out).await.unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn round_trips_request_head_serialization() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("api.anthropic.com"));
        let bytes = write_request_head("GET", "/v1/messages", &headers);
        let reparsed = parse_request_head(&bytes).unwrap();
        assert_eq!(reparsed.method, "GET");
        assert_eq!(reparsed.target, "/v1/messages");
    }
}
