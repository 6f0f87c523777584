//! The 9-byte HTTP/2 frame header codec (RFC 7540 §4.1). HPACK itself is
//! delegated to the external `hpack` crate (see [`super::hpack`]); this is
//! the thin framing layer around it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

pub const FRAME_HEADER_LEN: usize = 9;

pub const TYPE_DATA: u8 = 0x0;
pub const TYPE_HEADERS: u8 = 0x1;
pub const TYPE_PRIORITY: u8 = 0x2;
pub const TYPE_RST_STREAM: u8 = 0x3;
pub const TYPE_SETTINGS: u8 = 0x4;
pub const TYPE_PUSH_PROMISE: u8 = 0x5;
pub const TYPE_PING: u8 = 0x6;
pub const TYPE_GOAWAY: u8 = 0x7;
pub const TYPE_WINDOW_UPDATE: u8 = 0x8;
pub const TYPE_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = (self.length >> 16) as u8;
        buf[1] = (self.length >> 8) as u8;
        buf[2] = self.length as u8;
        buf[3] = self.frame_type;
        buf[4] = self.flags;
        buf[5..9].copy_from_slice(&(self.stream_id & 0x7FFF_FFFF).to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32;
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7FFF_FFFF;
        Self {
            length,
            frame_type: buf[3],
            flags: buf[4],
            stream_id,
        }
    }
}

/// A decoded frame: header plus payload bytes.
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: FrameHeader,
    payload: &[u8],
) -> Result<(), Error> {
    let mut header = header;
    header.length = payload.len() as u32;
    writer
        .write_all(&header.encode())
        .await
        .map_err(|e| Error::io("write", "write HTTP/2 frame header failed").with_cause(e))?;
    if !payload.is_empty() {
        writer
            .write_all(payload)
            .await
            .map_err(|e| Error::io("write", "write HTTP/2 frame payload failed").with_cause(e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| Error::io("write", "flush HTTP/2 frame failed").with_cause(e))
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_size: u32) -> Result<Frame, Error> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(|e| Error::io("read", "read HTTP/2 frame header failed").with_cause(e))?;
    let header = FrameHeader::decode(&header_buf);

    if header.length > max_frame_size {
        return Err(Error::protocol(
            "read",
            format!("HTTP/2 frame length {} exceeds max_frame_size {max_frame_size}", header.length),
        ));
    }

    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::io("read", "read HTTP/2 frame payload failed").with_cause(e))?;
    }

    Ok(Frame { header, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = FrameHeader {
            length: 42,
            frame_type: TYPE_HEADERS,
            flags: FLAG_END_HEADERS | FLAG_END_STREAM,
            stream_id: 7,
        };
        let encoded = h.encode();
        let decoded = FrameHeader::decode(&encoded);
        assert_eq!(decoded.length, 42);
        assert_eq!(decoded.frame_type, TYPE_HEADERS);
        assert_eq!(decoded.flags, FLAG_END_HEADERS | FLAG_END_STREAM);
        assert_eq!(decoded.stream_id, 7);
    }

    #[tokio::test]
    async fn write_then_read_frame() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            FrameHeader {
                length: 0,
                frame_type: TYPE_PING,
                flags: 0,
                stream_id: 0,
            },
            b"12345678",
        )
        .await
        .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor, 16_384).await.unwrap();
        assert_eq!(frame.header.frame_type, TYPE_PING);
        assert_eq!(frame.payload, b"12345678");
    }
}
