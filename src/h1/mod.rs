//! HTTP/1.1 Engine (spec §4.7): byte-preserving request write and response
//! read over an already-connected, already-tunneled, already-TLS-upgraded
//! stream.

mod body;
mod reader;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::buffer::SpillableBuffer;
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::timing::Recorder;

use body::{read_chunked, read_content_length, read_no_body, read_to_eof, select_body_mode, BodyMode};
use reader::{read_header_block, read_status_line};

pub struct RawResponse {
    pub status_line: String,
    pub status_code: u16,
    pub http_version: String,
    pub headers: HeaderMap,
    pub body: SpillableBuffer,
    pub raw: SpillableBuffer,
    pub body_bytes: u64,
    pub raw_bytes: u64,
}

/// Writes `request` bytes to `stream` with a partial-write-tolerant loop.
/// The library performs no implicit transformation on these bytes (spec §6).
pub async fn write_request<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &[u8],
    write_timeout: Option<Duration>,
) -> Result<(), Error> {
    let write_all = async {
        let mut written = 0usize;
        while written < request.len() {
            let n = stream
                .write(&request[written..])
                .await
                .map_err(|e| Error::io("write", "request write failed").with_cause(e))?;
            if n == 0 {
                return Err(Error::io("write", "request write returned zero bytes"));
            }
            written += n;
        }
        stream
            .flush()
            .await
            .map_err(|e| Error::io("write", "request flush failed").with_cause(e))
    };

    match write_timeout {
        Some(d) => tokio::time::timeout(d, write_all)
            .await
            .map_err(|_| Error::timeout("write", "write deadline exceeded"))?,
        None => write_all.await,
    }
}

/// Reads a full HTTP/1.1 response: status line, headers, body (selected per
/// spec §4.7), with trailers merged into the header map.
pub async fn read_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    method: &str,
    read_timeout: Option<Duration>,
    body_mem_limit: u64,
    timer: &mut Recorder,
) -> Result<RawResponse, Error> {
    let body = SpillableBuffer::new(body_mem_limit);
    let raw = SpillableBuffer::new(body_mem_limit);
    let mut reader = BufReader::new(stream);

    let outcome = read_all(&mut reader, method, &body, &raw, timer);
    let outcome = match read_timeout {
        Some(d) => tokio::time::timeout(d, outcome)
            .await
            .map_err(|_| Error::timeout("read", "response read deadline exceeded"))?,
        None => outcome.await,
    };

    match outcome {
        Ok((status_line, status_code, http_version, mut header_pairs, body_bytes)) => {
            let raw_bytes = raw.len().await;
            let mut headers = HeaderMap::new();
            for (name, value) in header_pairs.drain(..) {
                headers.push(&name, value);
            }
            Ok(RawResponse {
                status_line,
                status_code,
                http_version,
                headers,
                body,
                raw,
                body_bytes,
                raw_bytes,
            })
        }
        Err(e) => {
            body.close().await;
            raw.close().await;
            Err(e)
        }
    }
}

type Outcome = (String, u16, String, Vec<(String, String)>, u64);

async fn read_all<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    method: &str,
    body: &SpillableBuffer,
    raw: &SpillableBuffer,
    timer: &mut Recorder,
) -> Result<Outcome, Error> {
    let (http_version, status_code, status_line) = read_status_line(reader, raw).await?;
    timer.ttfb_end();

    let mut headers = read_header_block(reader, raw).await?;

    let body_bytes = match select_body_mode(&headers, method, status_code)? {
        BodyMode::Chunked => {
            let (n, trailers) = read_chunked(reader, body, raw).await?;
            headers.extend(trailers);
            n
        }
        BodyMode::ContentLength(len) => read_content_length(reader, len, body, raw).await?,
        BodyMode::NoBody => read_no_body(reader, body, raw).await?,
        BodyMode::Eof => read_to_eof(reader, body, raw).await?,
    };

    Ok((status_line, status_code, http_version, headers, body_bytes))
}
