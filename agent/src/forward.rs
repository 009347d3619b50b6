//! Forwards one request read off the session onto the local service and
//! writes the local service's response back onto the session (§4.4).
//!
//! The raw request/response framing on the session socket is the agent's
//! own responsibility (the frame codec has no concept of HTTP); talking to
//! the local service itself goes through a conventional HTTP client so the
//! agent never reimplements HTTP semantics twice.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use tunnel_wire::{is_hop_by_hop_header, request_framing, write_response_head, BodyFraming, RequestHead, WireError};

use crate::error::AgentError;
use crate::session::{Session, SessionReader};

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<_> = headers.keys().filter(|name| is_hop_by_hop_header(name.as_str())).cloned().collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Reads the body of `head` (if any) off the session reader, forwards the
/// whole request to `http://localhost:<local_port>`, and writes the
/// resulting response back onto the session writer.
pub async fn forward_request(client: &reqwest::Client, local_port: u16, session: &mut Session, head: RequestHead) -> Result<(), AgentError> {
    let is_head = head.method == Method::HEAD;
    let framing = request_framing(&head.headers)?;
    let body = read_request_body(session, framing).await?;

    let url = format!("http://localhost:{local_port}{}", head.uri);
    let mut headers = head.headers.clone();
    strip_hop_by_hop(&mut headers);

    let response = client
        .request(head.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let mut response_headers = response.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    let body_bytes = if is_head { Bytes::new() } else { response.bytes().await? };

    debug!(method = %head.method, path = %head.uri, status = status.as_u16(), "forwarded request to local service");

    write_response(session, status, response_headers, &body_bytes).await
}

async fn read_request_body(session: &mut Session, framing: BodyFraming) -> Result<Bytes, AgentError> {
    match framing {
        BodyFraming::None => Ok(Bytes::new()),
        BodyFraming::ContentLength(len) => {
            let mut buf = vec![0u8; len as usize];
            session.reader.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        }
        BodyFraming::Chunked => dechunk_body(&mut session.reader).await,
    }
}

/// Decodes a chunked request body into a flat byte buffer. Unlike
/// [`tunnel_wire::copy_chunked_body`], which forwards chunk framing
/// verbatim for streaming passthrough, the agent needs the raw bytes
/// since it reissues the request with a plain `Content-Length` against
/// the local service.
async fn dechunk_body(reader: &mut SessionReader) -> Result<Bytes, AgentError> {
    let mut body = Vec::new();
    loop {
        let mut size_line = Vec::new();
        let n = reader.read_until(b'\n', &mut size_line).await?;
        if n == 0 {
            return Err(WireError::MalformedHttp("connection closed mid-chunk-header".into()).into());
        }
        let size_str = std::str::from_utf8(&size_line)
            .map_err(|e| WireError::MalformedHttp(format!("invalid chunk size line: {e}")))?
            .trim_end_matches(['\r', '\n']);
        let size_str = size_str.split(';').next().unwrap_or("");
        let chunk_size = u64::from_str_radix(size_str.trim(), 16)
            .map_err(|e| WireError::MalformedHttp(format!("invalid chunk size {size_str:?}: {e}")))?;

        if chunk_size == 0 {
            loop {
                let mut trailer_line = Vec::new();
                let n = reader.read_until(b'\n', &mut trailer_line).await?;
                if n == 0 {
                    return Err(WireError::MalformedHttp("connection closed mid-trailer".into()).into());
                }
                if trailer_line == b"\r\n" || trailer_line == b"\n" {
                    break;
                }
            }
            return Ok(Bytes::from(body));
        }

        let mut chunk = vec![0u8; chunk_size as usize];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
}

async fn write_response(session: &mut Session, status: StatusCode, mut headers: HeaderMap, body: &[u8]) -> Result<(), AgentError> {
    headers.insert(http::header::CONTENT_LENGTH, body.len().into());
    write_response_head(&mut session.writer, status, &headers).await?;
    if !body.is_empty() {
        session.writer.write_all(body).await?;
    }
    session.writer.flush().await?;
    Ok(())
}
