//! Status-line and header-block parsing (spec §4.7), mirroring every byte
//! read into the raw buffer as it's consumed.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::buffer::SpillableBuffer;
use crate::error::Error;

const HEADER_BLOCK_CAP: usize = 64 * 1024;

pub(super) fn io_err(e: std::io::Error) -> Error {
    Error::io("read", "response read failed").with_cause(e)
}

/// Reads `HTTP/x.y SP code SP reason CRLF`, returning
/// `(http_version, status_code, full_status_line)`.
pub(super) async fn read_status_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    raw: &SpillableBuffer,
) -> Result<(String, u16, String), Error> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.map_err(io_err)?;
    if n == 0 {
        return Err(Error::protocol("read", "connection closed before status line"));
    }
    raw.write(line.as_bytes()).await?;

    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::protocol("read", "malformed status line: missing HTTP version"))?;
    let code_str = parts
        .next()
        .ok_or_else(|| Error::protocol("read", "malformed status line: missing status code"))?;
    let code: u16 = code_str
        .parse()
        .map_err(|_| Error::protocol("read", format!("invalid status code {code_str:?}")))?;

    Ok((version.to_string(), code, trimmed.to_string()))
}

/// Reads header lines until an empty line, merging RFC 7230 obs-fold
/// continuations and enforcing the 64 KiB total cap. Returns
/// `(name, value)` pairs in insertion order.
pub(super) async fn read_header_block<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    raw: &SpillableBuffer,
) -> Result<Vec<(String, String)>, Error> {
    let mut total = 0usize;
    let mut lines: Vec<String> = Vec::new();

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.map_err(io_err)?;
        if n == 0 {
            break; // tolerate a missing terminal CRLF from a closing peer
        }
        total += n;
        if total > HEADER_BLOCK_CAP {
            return Err(Error::protocol("read", "header block exceeds 64 KiB cap"));
        }
        raw.write(line.as_bytes()).await?;
        if line == "\r\n" || line == "\n" {
            break;
        }
        lines.push(line);
    }

    let mut merged: Vec<String> = Vec::new();
    for line in lines {
        if (line.starts_with(' ') || line.starts_with('\t')) && !merged.is_empty() {
            let last = merged.last_mut().expect("checked non-empty above");
            last.push(' ');
            last.push_str(line.trim());
        } else {
            merged.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
    }

    let mut headers = Vec::with_capacity(merged.len());
    for line in merged {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SpillableBuffer;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_status_line() {
        let raw = SpillableBuffer::new(1024);
        let input = b"HTTP/1.1 200 OK\r\n".as_slice();
        let mut reader = BufReader::new(input);
        let (version, code, line) = read_status_line(&mut reader, &raw).await.unwrap();
        assert_eq!(version, "HTTP/1.1");
        assert_eq!(code, 200);
        assert_eq!(line, "HTTP/1.1 200 OK");
    }

    #[tokio::test]
    async fn merges_obs_fold_continuation() {
        let raw = SpillableBuffer::new(1024);
        let input = b"X-Long: first\r\n  continued\r\nShort: ok\r\n\r\n".as_slice();
        let mut reader = BufReader::new(input);
        let headers = read_header_block(&mut reader, &raw).await.unwrap();
        assert_eq!(headers[0], ("X-Long".to_string(), "first continued".to_string()));
        assert_eq!(headers[1], ("Short".to_string(), "ok".to_string()));
    }
}
