//! Raw HTTP/1.1 message framing over the session socket.
//!
//! Both the broker and agent read and write plain HTTP/1.1 here: the broker
//! writes requests and reads responses, the agent reads requests and writes
//! responses. Because a session socket is reused across many exchanges
//! (§4.4), framing has to be byte-accurate — there's no connection close to
//! fall back on to mark the end of a body the way a one-shot HTTP client
//! could.

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{WireError, WireResult};

/// Upper bound on a head's size (request/status line + headers) read as one
/// block before handing it to `httparse`. Guards against a peer that never
/// sends a blank line.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum number of headers `httparse` will parse into.
const MAX_HEADERS: usize = 64;

/// A parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// A parsed status line and header block.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// How a message body is delimited. Anything other than `None` on a
/// response that isn't exempt (HEAD, 1xx, 204, 304) is a protocol
/// invariant this design doesn't tolerate, since the session has no
/// connection-close fallback to signal end-of-body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body: HEAD responses, 1xx/204/304, and requests with neither header.
    None,
    ContentLength(u64),
    Chunked,
}

/// Accumulates raw bytes up to (and including) the blank line terminating
/// an HTTP head, then hands them to `httparse`. Returns the raw bytes
/// alongside the parse so callers needing the exact byte count (none
/// currently do) still could.
async fn read_head_bytes<R>(reader: &mut R) -> WireResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let before = buf.len();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(WireError::MalformedHttp("connection closed before a complete head".into()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(WireError::MalformedHttp(format!(
                "head exceeds {MAX_HEAD_BYTES} byte limit"
            )));
        }
        // A lone CRLF (or LF) line terminates the head.
        let line = &buf[before..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(buf)
}

pub async fn read_request_head<R>(reader: &mut R) -> WireResult<RequestHead>
where
    R: AsyncBufRead + Unpin,
{
    let raw = read_head_bytes(reader).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req
        .parse(&raw)
        .map_err(|e| WireError::MalformedHttp(format!("request parse error: {e}")))?;
    if status.is_partial() {
        return Err(WireError::MalformedHttp("incomplete request head".into()));
    }

    let method = req
        .method
        .ok_or_else(|| WireError::MalformedHttp("missing method".into()))?
        .parse::<Method>()
        .map_err(|e| WireError::MalformedHttp(format!("invalid method: {e}")))?;
    let uri = req
        .path
        .ok_or_else(|| WireError::MalformedHttp("missing request target".into()))?
        .parse::<Uri>()
        .map_err(|e| WireError::MalformedHttp(format!("invalid request target: {e}")))?;
    let headers = headers_from_httparse(req.headers)?;

    Ok(RequestHead { method, uri, headers })
}

pub async fn read_response_head<R>(reader: &mut R) -> WireResult<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let raw = read_head_bytes(reader).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_storage);
    let status = resp
        .parse(&raw)
        .map_err(|e| WireError::MalformedHttp(format!("response parse error: {e}")))?;
    if status.is_partial() {
        return Err(WireError::MalformedHttp("incomplete response head".into()));
    }

    let code = resp
        .code
        .ok_or_else(|| WireError::MalformedHttp("missing status code".into()))?;
    let status =
        StatusCode::from_u16(code).map_err(|e| WireError::MalformedHttp(format!("invalid status code: {e}")))?;
    let headers = headers_from_httparse(resp.headers)?;

    Ok(ResponseHead { status, headers })
}

fn headers_from_httparse(raw: &[httparse::Header<'_>]) -> WireResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| WireError::MalformedHttp(format!("invalid header name {:?}: {e}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| WireError::MalformedHttp(format!("invalid header value for {}: {e}", h.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

pub async fn write_request_head<W>(writer: &mut W, method: &Method, target: &str, headers: &HeaderMap) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{method} {target} HTTP/1.1\r\n").into_bytes();
    write_header_lines(&mut out, headers);
    out.extend_from_slice(b"\r\n");
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_response_head<W>(writer: &mut W, status: StatusCode, headers: &HeaderMap) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("");
    let mut out = format!("HTTP/1.1 {} {reason}\r\n", status.as_u16()).into_bytes();
    write_header_lines(&mut out, headers);
    out.extend_from_slice(b"\r\n");
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

fn write_header_lines(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Hop-by-hop headers this design strips when relaying a head, since they
/// describe the state of one transport hop and don't survive being
/// forwarded onto another.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Determines how a request body (if any) is framed. Requests with neither
/// header are assumed bodiless (GET/HEAD/DELETE et al.) rather than
/// rejected, since that's the common and valid case on the request side.
pub fn request_framing(headers: &HeaderMap) -> WireResult<BodyFraming> {
    framing_from_headers(headers, true)
}

/// Determines how a response body is framed for a given status. Exempt
/// statuses (1xx, 204, 304) and HEAD responses never carry a body
/// regardless of headers present. A response with neither header that
/// isn't exempt is an [`WireError::IndeterminateLength`] — this design has
/// no connection-close fallback to signal end-of-body.
pub fn response_framing(status: StatusCode, is_head: bool, headers: &HeaderMap) -> WireResult<BodyFraming> {
    if is_head || status.as_u16() < 200 || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(BodyFraming::None);
    }
    framing_from_headers(headers, false)
}

fn framing_from_headers(headers: &HeaderMap, bodiless_by_default: bool) -> WireResult<BodyFraming> {
    if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|e| WireError::MalformedHttp(format!("invalid transfer-encoding: {e}")))?;
        if te.eq_ignore_ascii_case("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(WireError::MalformedHttp(format!("unsupported transfer-encoding: {te}")));
    }
    if let Some(cl) = headers.get(http::header::CONTENT_LENGTH) {
        let cl = cl
            .to_str()
            .map_err(|e| WireError::MalformedHttp(format!("invalid content-length: {e}")))?
            .parse::<u64>()
            .map_err(|e| WireError::MalformedHttp(format!("invalid content-length: {e}")))?;
        return Ok(if cl == 0 { BodyFraming::None } else { BodyFraming::ContentLength(cl) });
    }
    if bodiless_by_default {
        Ok(BodyFraming::None)
    } else {
        Err(WireError::IndeterminateLength)
    }
}

/// Copies exactly `len` bytes from `reader` to `writer`, the body for a
/// `Content-Length` framed message.
pub async fn copy_fixed_body<R, W>(reader: &mut R, writer: &mut W, len: u64) -> WireResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = tokio::io::AsyncReadExt::read(reader, &mut buf[..want]).await?;
        if n == 0 {
            return Err(WireError::MalformedHttp("connection closed mid-body".into()));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    writer.flush().await?;
    Ok(())
}

/// Forwards a chunked body verbatim: each chunk-size line, its chunk data,
/// and the trailing CRLF are copied byte for byte rather than decoded and
/// re-encoded, so the relay never needs to buffer a whole body in memory.
/// Stops after the zero-length terminator chunk and any trailer lines.
pub async fn copy_chunked_body<R, W>(reader: &mut R, writer: &mut W) -> WireResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut size_line = Vec::new();
        let n = reader.read_until(b'\n', &mut size_line).await?;
        if n == 0 {
            return Err(WireError::MalformedHttp("connection closed mid-chunk-header".into()));
        }
        writer.write_all(&size_line).await?;

        let size_str = std::str::from_utf8(&size_line)
            .map_err(|e| WireError::MalformedHttp(format!("invalid chunk size line: {e}")))?;
        let size_str = size_str.trim_end_matches(['\r', '\n']);
        let size_str = size_str.split(';').next().unwrap_or("");
        let chunk_size = u64::from_str_radix(size_str.trim(), 16)
            .map_err(|e| WireError::MalformedHttp(format!("invalid chunk size {size_str:?}: {e}")))?;

        if chunk_size == 0 {
            // Trailer headers (possibly none), terminated by a blank line.
            loop {
                let mut trailer_line = Vec::new();
                let n = reader.read_until(b'\n', &mut trailer_line).await?;
                if n == 0 {
                    return Err(WireError::MalformedHttp("connection closed mid-trailer".into()));
                }
                writer.write_all(&trailer_line).await?;
                if trailer_line == b"\r\n" || trailer_line == b"\n" {
                    break;
                }
            }
            writer.flush().await?;
            return Ok(());
        }

        let mut remaining = chunk_size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = tokio::io::AsyncReadExt::read(reader, &mut buf[..want]).await?;
            if n == 0 {
                return Err(WireError::MalformedHttp("connection closed mid-chunk".into()));
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }

        // Trailing CRLF after the chunk data.
        let mut crlf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(reader, &mut crlf).await?;
        writer.write_all(&crlf).await?;
    }
}

/// Copies a body of the given framing from `reader` to `writer`. A no-op
/// for [`BodyFraming::None`].
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> WireResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::ContentLength(len) => copy_fixed_body(reader, writer, len).await,
        BodyFraming::Chunked => copy_chunked_body(reader, writer).await,
    }
}
