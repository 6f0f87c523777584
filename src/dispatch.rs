//! Protocol Dispatcher (spec §4.9): picks HTTP/1.1 or HTTP/2 per request and
//! normalizes both engines' results into the common [`Response`] shape.

use std::sync::Arc;

use crate::buffer::SpillableBuffer;
use crate::error::Error;
use crate::h1;
use crate::h2::{Http2Pool, Http2Response, ALPN_REFUSAL_MARKER};
use crate::headers::HeaderMap;
use crate::options::{Options, Protocol, Scheme};
use crate::pool::{ConnMeta, Fabric, PooledConnection};
use crate::response::Response;
use crate::timing::{Recorder, Timings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selected {
    Http1,
    Http2,
}

fn select(opts: &Options, raw_request: &[u8]) -> Selected {
    match opts.protocol {
        Protocol::Http1 => return Selected::Http1,
        Protocol::Http2 => return Selected::Http2,
        Protocol::Auto => {}
    }
    if opts.proxy.is_some() {
        return Selected::Http1;
    }
    if let Some(passthrough) = &opts.tls.raw_tls_config {
        if !passthrough.alpn_protocols.is_empty() && !passthrough.alpn_protocols.iter().any(|p| p == b"h2") {
            return Selected::Http1;
        }
    }
    if request_line_says_http2(raw_request) {
        return Selected::Http2;
    }
    Selected::Http1
}

fn request_line_says_http2(raw: &[u8]) -> bool {
    let line_end = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..line_end]).contains("HTTP/2")
}

fn extract_method(raw: &[u8]) -> String {
    let line_end = raw.iter().position(|&b| b == b'\r' || b == b'\n').unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..line_end])
        .split_whitespace()
        .next()
        .unwrap_or("GET")
        .to_string()
}

/// Runs one request end to end, selecting the engine and falling back from
/// HTTP/2 to HTTP/1.1 on ALPN refusal.
pub(crate) async fn do_request(
    fabric: &Arc<Fabric>,
    h2_pool: &Arc<Http2Pool>,
    raw_request: &[u8],
    opts: &Options,
) -> Result<Response, Error> {
    match select(opts, raw_request) {
        Selected::Http1 => do_http1(fabric, raw_request, opts).await,
        Selected::Http2 => match do_http2(h2_pool, raw_request, opts).await {
            Ok(resp) => Ok(resp),
            Err(e) if e.to_string().contains(ALPN_REFUSAL_MARKER) => do_http1(fabric, raw_request, opts).await,
            Err(e) => Err(e),
        },
    }
}

async fn do_http1(fabric: &Arc<Fabric>, raw_request: &[u8], opts: &Options) -> Result<Response, Error> {
    let mut timer = Recorder::new();
    let pooled = fabric.connect(opts, &mut timer).await?;
    let PooledConnection { mut stream, meta } = pooled;

    let method = extract_method(raw_request);

    if let Err(e) = h1::write_request(&mut stream, raw_request, opts.write_timeout).await {
        fabric.close_active(&meta.pool_key);
        return Err(e);
    }

    let raw_response = match h1::read_response(&mut stream, &method, opts.read_timeout, opts.body_mem_limit, &mut timer).await {
        Ok(r) => r,
        Err(e) => {
            fabric.close_active(&meta.pool_key);
            return Err(e);
        }
    };

    let keep_alive = !raw_response
        .headers
        .get("Connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false);

    fabric.release(PooledConnection { stream, meta: meta.clone() }, keep_alive).await;

    Ok(Response {
        status_line: raw_response.status_line,
        status_code: raw_response.status_code,
        http_version: raw_response.http_version,
        headers: raw_response.headers,
        body: raw_response.body,
        raw: raw_response.raw,
        body_bytes: raw_response.body_bytes,
        raw_bytes: raw_response.raw_bytes,
        timings: timer.finish(),
        connection: meta,
    })
}

async fn do_http2(h2_pool: &Arc<Http2Pool>, raw_request: &[u8], opts: &Options) -> Result<Response, Error> {
    let mut timer = Recorder::new();
    let mut h2_opts = opts.clone();
    h2_opts.protocol = Protocol::Http2;

    let (conn, meta) = h2_pool.acquire(&h2_opts, &mut timer).await?;

    let default_authority = format!("{}:{}", opts.host, opts.port);
    let default_scheme = if matches!(opts.scheme, Scheme::Https) { "https" } else { "http" };

    let h2_response = conn
        .do_request(
            raw_request,
            &default_authority,
            default_scheme,
            opts.body_mem_limit,
            opts.read_timeout,
            &mut timer,
        )
        .await?;

    Ok(build_response(h2_response, meta, timer.finish()).await)
}

/// Converts an HTTP/2 response into the common shape, synthesizing an
/// HTTP/1.1-style textual `raw` buffer (status line + canonical headers +
/// blank line + body) from the decoded frame stream, since HTTP/2 carries no
/// equivalent literal wire bytes to mirror (spec §4.9).
async fn build_response(h2: Http2Response, meta: ConnMeta, timings: Timings) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in &h2.headers {
        headers.push(name, value.clone());
    }

    let status_line = format!("HTTP/2 {} {}", h2.status_code, reason_phrase(h2.status_code));
    let mut head = format!("{status_line}\r\n");
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let raw = SpillableBuffer::new(h2.body_bytes.max(head.len() as u64));
    let _ = raw.write(head.as_bytes()).await;
    if let Ok(body_bytes) = h2.body.to_vec().await {
        let _ = raw.write(&body_bytes).await;
    }
    let raw_bytes = raw.len().await;

    Response {
        status_line,
        status_code: h2.status_code,
        http_version: "HTTP/2".to_string(),
        headers,
        body: h2.body,
        raw,
        body_bytes: h2.body_bytes,
        raw_bytes,
        timings,
        connection: meta,
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
