//! The [`Response`] aggregate returned by [`crate::Sender::do_request`]
//! (spec §3).

use crate::buffer::SpillableBuffer;
use crate::headers::HeaderMap;
use crate::pool::ConnMeta;
use crate::timing::Timings;

/// A completed (or partially-completed, for short-read bodies) response.
pub struct Response {
    pub status_line: String,
    pub status_code: u16,
    pub http_version: String,
    pub headers: HeaderMap,

    /// Decoded body bytes.
    pub body: SpillableBuffer,
    /// Verbatim wire bytes: status line, headers, chunk framing, body,
    /// trailers, exactly as received.
    pub raw: SpillableBuffer,

    pub body_bytes: u64,
    pub raw_bytes: u64,

    pub timings: Timings,
    pub connection: ConnMeta,
}

impl Response {
    /// Releases both buffers. Callers must call this (or rely on `Drop`-less
    /// cleanup at the binding's discretion) once the response is no longer
    /// needed, since spilled buffers hold an open temp file.
    pub async fn close(&self) {
        self.body.close().await;
        self.raw.close().await;
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status_code)
    }
}
