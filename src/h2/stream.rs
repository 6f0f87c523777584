//! HTTP/2 stream state (spec §3 "HTTP/2 stream", §4.8 state transitions).
//!
//! Scoped to this engine's client-only, one-request-per-stream usage: a
//! stream is opened by sending our HEADERS (and, usually, DATA) and is
//! driven to completion by reading the peer's response on the same
//! stream before the connection is handed back to the pool. Concurrent
//! multiplexing of several in-flight streams on one physical connection
//! is out of scope (see `DESIGN.md`).

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub window: i64,
    pub peer_window: i64,
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub end_stream_received: bool,
}

impl Stream {
    pub fn new(id: u32, initial_window: i64, peer_initial_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            window: initial_window,
            peer_window: peer_initial_window,
            status_code: None,
            headers: Vec::new(),
            body: Vec::new(),
            end_stream_received: false,
        }
    }

    /// Transition on sending our own HEADERS/DATA frame.
    pub fn on_send(&mut self, end_stream: bool) -> Result<(), Error> {
        self.state = match (self.state, end_stream) {
            (StreamState::Idle, false) => StreamState::Open,
            (StreamState::Idle, true) => StreamState::HalfClosedLocal,
            (StreamState::Open, true) => StreamState::HalfClosedLocal,
            (StreamState::Open, false) => StreamState::Open,
            (other, _) => {
                return Err(Error::protocol(
                    "stream",
                    format!("invalid HTTP/2 stream transition sending a frame from {other:?}"),
                ))
            }
        };
        Ok(())
    }

    /// Transition on receiving a HEADERS/DATA frame from the peer.
    pub fn on_recv(&mut self, end_stream: bool) -> Result<(), Error> {
        self.state = match (self.state, end_stream) {
            (StreamState::Open, false) => StreamState::Open,
            (StreamState::Open, true) => StreamState::Closed,
            (StreamState::HalfClosedLocal, false) => StreamState::HalfClosedLocal,
            (StreamState::HalfClosedLocal, true) => StreamState::Closed,
            (other, _) => {
                return Err(Error::protocol(
                    "stream",
                    format!("invalid HTTP/2 stream transition receiving a frame in {other:?}"),
                ))
            }
        };
        if end_stream {
            self.end_stream_received = true;
        }
        Ok(())
    }

    pub fn on_rst(&mut self) {
        self.state = StreamState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_only_headers_goes_straight_to_half_closed_local() {
        let mut s = Stream::new(1, 0, 0);
        s.on_send(true).unwrap();
        assert_eq!(s.state, StreamState::HalfClosedLocal);
    }

    #[test]
    fn response_end_stream_closes_from_half_closed_local() {
        let mut s = Stream::new(1, 0, 0);
        s.on_send(true).unwrap();
        s.on_recv(true).unwrap();
        assert_eq!(s.state, StreamState::Closed);
        assert!(s.end_stream_received);
    }

    #[test]
    fn rejects_frame_after_close() {
        let mut s = Stream::new(1, 0, 0);
        s.on_send(true).unwrap();
        s.on_recv(true).unwrap();
        assert!(s.on_recv(false).is_err());
    }
}
