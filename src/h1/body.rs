//! Body selection and reading (spec §4.7): chunked, Content-Length, or
//! read-to-EOF, plus the RFC 9110 no-body shortcut.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::buffer::SpillableBuffer;
use crate::error::Error;

use super::reader::io_err;

const MAX_CONTENT_LENGTH: u64 = 1 << 40; // 1 TiB
const COPY_CHUNK: usize = 64 * 1024;

pub(super) enum BodyMode {
    Chunked,
    ContentLength(u64),
    NoBody,
    Eof,
}

/// Selects how to read the body, per spec §4.7 body-selection order, with
/// the RFC 9110 no-body rule taking priority for the relevant
/// statuses/methods whenever Transfer-Encoding isn't chunked.
pub(super) fn select_body_mode(
    headers: &[(String, String)],
    method: &str,
    status_code: u16,
) -> Result<BodyMode, Error> {
    let transfer_encoding = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
        .map(|(_, v)| v.to_ascii_lowercase());
    if transfer_encoding.is_some_and(|te| te.contains("chunked")) {
        return Ok(BodyMode::Chunked);
    }

    let no_body = method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304;
    if no_body {
        return Ok(BodyMode::NoBody);
    }

    if let Some((_, value)) = headers.iter().find(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
        let len: i64 = value
            .trim()
            .parse()
            .map_err(|_| Error::protocol("read", format!("invalid Content-Length value {value:?}")))?;
        if len < 0 || len as u64 > MAX_CONTENT_LENGTH {
            return Err(Error::protocol("read", "Content-Length out of range"));
        }
        return Ok(BodyMode::ContentLength(len as u64));
    }

    Ok(BodyMode::Eof)
}

/// Per RFC 9110, a no-body response is still permitted to carry a
/// (non-compliant) body; we only read what's already buffered rather than
/// blocking the caller on a server that never sends more.
pub(super) async fn read_no_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    body: &SpillableBuffer,
    raw: &SpillableBuffer,
) -> Result<u64, Error> {
    let buffered = reader.fill_buf().await.map_err(io_err)?;
    if buffered.is_empty() {
        return Ok(0);
    }
    let data = buffered.to_vec();
    reader.consume(data.len());
    body.write(&data).await?;
    raw.write(&data).await?;
    Ok(data.len() as u64)
}

/// Reads exactly `len` bytes. A short read (peer closed early) is logged
/// and the partial body is kept rather than discarded, per spec §4.7.
pub(super) async fn read_content_length<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
    body: &SpillableBuffer,
    raw: &SpillableBuffer,
) -> Result<u64, Error> {
    let mut remaining = len;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;

    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..to_read]).await.map_err(io_err)?;
        if n == 0 {
            tracing::warn!(
                expected = len,
                received = total,
                "Content-Length short read: connection closed before full body arrived"
            );
            return Ok(total);
        }
        body.write(&buf[..n]).await?;
        raw.write(&buf[..n]).await?;
        total += n as u64;
        remaining -= n as u64;
    }
    Ok(total)
}

pub(super) async fn read_to_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    body: &SpillableBuffer,
    raw: &SpillableBuffer,
) -> Result<u64, Error> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        body.write(&buf[..n]).await?;
        raw.write(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}

/// Reads `{hex-size[;ext] CRLF, data, CRLF}*` until a zero-size chunk,
/// then trailer headers until an empty line. Every byte (size lines, data,
/// CRLFs, trailers) is mirrored into `raw`; decoded data only into `body`.
/// Returns `(decoded_bytes, trailers)`.
pub(super) async fn read_chunked<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    body: &SpillableBuffer,
    raw: &SpillableBuffer,
) -> Result<(u64, Vec<(String, String)>), Error> {
    let mut total = 0u64;
    let mut trailers = Vec::new();
    let mut buf = vec![0u8; COPY_CHUNK];

    loop {
        let mut size_line = String::new();
        let n = reader.read_line(&mut size_line).await.map_err(io_err)?;
        if n == 0 {
            return Err(Error::protocol("read", "connection closed mid chunk-size line"));
        }
        raw.write(size_line.as_bytes()).await?;

        let size_token = size_line
            .trim_end_matches(['\r', '\n'])
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = u64::from_str_radix(size_token, 16)
            .map_err(|_| Error::protocol("read", format!("invalid chunk size {size_token:?}")))?;

        if size == 0 {
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await.map_err(io_err)?;
                if n == 0 {
                    break;
                }
                raw.write(line.as_bytes()).await?;
                if line == "\r\n" || line == "\n" {
                    break;
                }
                if let Some((name, value)) = line.trim_end_matches(['\r', '\n']).split_once(':') {
                    trailers.push((name.trim().to_string(), value.trim().to_string()));
                }
            }
            break;
        }

        let mut remaining = size;
        while remaining > 0 {
            let to_read = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..to_read]).await.map_err(io_err)?;
            if n == 0 {
                return Err(Error::protocol("read", "connection closed mid chunk data"));
            }
            body.write(&buf[..n]).await?;
            raw.write(&buf[..n]).await?;
            total += n as u64;
            remaining -= n as u64;
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await.map_err(io_err)?;
        raw.write(&crlf).await?;
    }

    Ok((total, trailers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn chunked_body_decodes_and_mirrors_raw() {
        let body = SpillableBuffer::new(1024);
        let raw = SpillableBuffer::new(1024);
        let input = b"5\r\nhello\r\n0\r\n\r\n".as_slice();
        let mut reader = BufReader::new(input);
        let (n, trailers) = read_chunked(&mut reader, &body, &raw).await.unwrap();
        assert_eq!(n, 5);
        assert!(trailers.is_empty());
        assert_eq!(body.to_vec().await.unwrap(), b"hello");
        assert_eq!(raw.to_vec().await.unwrap(), b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn chunked_body_merges_trailers() {
        let body = SpillableBuffer::new(1024);
        let raw = SpillableBuffer::new(1024);
        let input = b"3\r\nabc\r\n0\r\nX-Trailer: yes\r\n\r\n".as_slice();
        let mut reader = BufReader::new(input);
        let (_, trailers) = read_chunked(&mut reader, &body, &raw).await.unwrap();
        assert_eq!(trailers, vec![("X-Trailer".to_string(), "yes".to_string())]);
    }

    #[tokio::test]
    async fn content_length_short_read_keeps_partial_body() {
        let body = SpillableBuffer::new(1024);
        let raw = SpillableBuffer::new(1024);
        let input = b"abc".as_slice();
        let mut reader = BufReader::new(input);
        let n = read_content_length(&mut reader, 10, &body, &raw).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(body.to_vec().await.unwrap(), b"abc");
    }

    #[test]
    fn selects_no_body_for_head_and_204() {
        assert!(matches!(
            select_body_mode(&[], "HEAD", 200).unwrap(),
            BodyMode::NoBody
        ));
        assert!(matches!(select_body_mode(&[], "GET", 204).unwrap(), BodyMode::NoBody));
    }

    #[test]
    fn rejects_out_of_range_content_length() {
        let headers = vec![("Content-Length".to_string(), "-1".to_string())];
        assert!(select_body_mode(&headers, "GET", 200).is_err());
    }
}
