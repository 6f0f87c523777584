//! HTTP/2 connection state and frame dispatch loop (spec §4.8).
//!
//! One physical connection serves one request at a time in this engine
//! (see `stream.rs` for the scoping rationale): `do_request` opens a
//! stream, writes HEADERS/DATA, then drives the read loop until that
//! stream closes before the connection is handed back to the cache for
//! the next caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, RwLock};

use crate::buffer::SpillableBuffer;
use crate::error::Error;
use crate::options::Http2Settings as Http2SettingsOptions;
use crate::stream::BoxedStream;
use crate::timing::Recorder;

use super::frame::{
    read_frame, write_frame, FrameHeader, CLIENT_PREFACE, FLAG_ACK, FLAG_END_HEADERS, FLAG_END_STREAM,
    FLAG_PADDED, FLAG_PRIORITY, TYPE_DATA, TYPE_GOAWAY, TYPE_HEADERS, TYPE_PING, TYPE_RST_STREAM,
    TYPE_SETTINGS, TYPE_WINDOW_UPDATE,
};
use super::hpack::HpackContext;
use super::request::{self, ParsedRequest};
use super::settings::{parse_params, Settings};
use super::stream::Stream;

struct ConnState {
    our_settings: Settings,
    peer_settings: Settings,
    #[allow(dead_code)]
    conn_window: i64,
    peer_conn_window: i64,
    next_stream_id: u32,
    total_streams: u64,
    last_activity: Instant,
    closed: bool,
}

/// A live HTTP/2 connection, ready to carry requests.
pub struct Http2Connection {
    write_half: Mutex<WriteHalf<BoxedStream>>,
    read_half: Mutex<ReadHalf<BoxedStream>>,
    hpack: Mutex<HpackContext>,
    state: RwLock<ConnState>,
    closed_flag: AtomicBool,
}

pub struct Http2Response {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: SpillableBuffer,
    pub body_bytes: u64,
}

const HANDSHAKE_MAX_FRAME: u32 = 16_777_215;
const MAX_TOTAL_STREAMS: u64 = 10_000;
const MAX_STREAM_ID: u32 = (1u32 << 31) - 1;

impl Http2Connection {
    /// Performs the connection preface + SETTINGS handshake (spec §4.8)
    /// over an already-dialed, already-TLS-upgraded (ALPN `h2`) stream.
    pub async fn handshake(stream: BoxedStream, settings: &Http2SettingsOptions) -> Result<Self, Error> {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let our_settings = Settings::from(settings);

        write_half
            .write_all(CLIENT_PREFACE)
            .await
            .map_err(|e| Error::io("write", "write HTTP/2 client preface failed").with_cause(e))?;
        write_frame(
            &mut write_half,
            FrameHeader {
                length: 0,
                frame_type: TYPE_SETTINGS,
                flags: 0,
                stream_id: 0,
            },
            &our_settings.to_wire(),
        )
        .await?;

        let mut peer_settings = Settings::default();
        let mut conn_window: i64 = 65_535;
        let mut got_ack = false;

        let run = async {
            loop {
                let frame = read_frame(&mut read_half, HANDSHAKE_MAX_FRAME).await?;
                match frame.header.frame_type {
                    TYPE_SETTINGS => {
                        if frame.header.flags & FLAG_ACK != 0 {
                            got_ack = true;
                        } else {
                            for (id, value) in parse_params(&frame.payload) {
                                peer_settings.apply(id, value);
                            }
                            write_frame(
                                &mut write_half,
                                FrameHeader {
                                    length: 0,
                                    frame_type: TYPE_SETTINGS,
                                    flags: FLAG_ACK,
                                    stream_id: 0,
                                },
                                &[],
                            )
                            .await?;
                        }
                    }
                    TYPE_PING => {
                        if frame.header.flags & FLAG_ACK == 0 {
                            write_frame(
                                &mut write_half,
                                FrameHeader {
                                    length: 0,
                                    frame_type: TYPE_PING,
                                    flags: FLAG_ACK,
                                    stream_id: 0,
                                },
                                &frame.payload,
                            )
                            .await?;
                        }
                    }
                    TYPE_WINDOW_UPDATE => {
                        if frame.payload.len() == 4 {
                            let inc = u32::from_be_bytes(frame.payload[..4].try_into().expect("len checked"))
                                & 0x7FFF_FFFF;
                            conn_window += inc as i64;
                        }
                    }
                    TYPE_GOAWAY => {
                        return Err(Error::protocol("handshake", "peer sent GOAWAY during HTTP/2 handshake"));
                    }
                    other => {
                        return Err(Error::protocol(
                            "handshake",
                            format!("unexpected frame type {other} during HTTP/2 handshake"),
                        ));
                    }
                }
                if got_ack {
                    return Ok(());
                }
            }
        };

        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .map_err(|_| Error::timeout("handshake", "HTTP/2 SETTINGS handshake timed out"))??;

        if our_settings.initial_window_size > 65_535 {
            let delta = our_settings.initial_window_size - 65_535;
            write_frame(
                &mut write_half,
                FrameHeader {
                    length: 0,
                    frame_type: TYPE_WINDOW_UPDATE,
                    flags: 0,
                    stream_id: 0,
                },
                &delta.to_be_bytes(),
            )
            .await?;
        }

        Ok(Self {
            write_half: Mutex::new(write_half),
            read_half: Mutex::new(read_half),
            hpack: Mutex::new(HpackContext::new()),
            state: RwLock::new(ConnState {
                our_settings,
                peer_settings,
                conn_window,
                peer_conn_window: 65_535,
                next_stream_id: 1,
                total_streams: 0,
                last_activity: Instant::now(),
                closed: false,
            }),
            closed_flag: AtomicBool::new(false),
        })
    }

    pub async fn do_request(
        &self,
        req_bytes: &[u8],
        default_authority: &str,
        default_scheme: &str,
        body_mem_limit: u64,
        read_timeout: Option<Duration>,
        timer: &mut Recorder,
    ) -> Result<Http2Response, Error> {
        let parsed = request::parse_request(req_bytes, default_authority, default_scheme)?;
        let header_list = request::build_header_list(&parsed);

        let stream_id = self.allocate_stream_id().await?;
        let (local_window, peer_window) = {
            let state = self.state.read().await;
            (
                state.our_settings.initial_window_size as i64,
                state.peer_settings.initial_window_size as i64,
            )
        };
        let mut stream = Stream::new(stream_id, local_window, peer_window);

        let encoded = {
            let mut hpack = self.hpack.lock().await;
            hpack.encode(&header_list)
        };

        let has_body = !parsed.body.is_empty();
        self.write_request_frames(stream_id, &encoded, &parsed, has_body).await?;
        stream.on_send(!has_body)?;
        if has_body {
            stream.on_send(true)?;
        }
        self.touch_activity().await;

        timer.ttfb_start();
        let body = SpillableBuffer::new(body_mem_limit);
        let read_fut = self.read_until_done(stream_id, &mut stream, &body, timer);
        let result = match read_timeout {
            Some(d) => tokio::time::timeout(d, read_fut)
                .await
                .map_err(|_| Error::timeout("read", "HTTP/2 response read deadline exceeded"))?,
            None => read_fut.await,
        };

        if let Err(e) = result {
            body.close().await;
            return Err(e);
        }

        let body_bytes = body.len().await;
        Ok(Http2Response {
            status_code: stream.status_code.unwrap_or(0),
            headers: stream.headers,
            body,
            body_bytes,
        })
    }

    async fn allocate_stream_id(&self) -> Result<u32, Error> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(Error::connection("write", "HTTP/2 connection is closed"));
        }
        if state.total_streams >= MAX_TOTAL_STREAMS {
            return Err(Error::protocol(
                "write",
                "HTTP/2 connection reached its 10000-stream lifetime budget",
            ));
        }
        if state.next_stream_id > MAX_STREAM_ID {
            return Err(Error::protocol("write", "HTTP/2 stream id space exhausted"));
        }
        let id = state.next_stream_id;
        state.next_stream_id += 2;
        state.total_streams += 1;
        Ok(id)
    }

    async fn write_request_frames(
        &self,
        stream_id: u32,
        encoded_headers: &[u8],
        parsed: &ParsedRequest,
        has_body: bool,
    ) -> Result<(), Error> {
        let mut write_half = self.write_half.lock().await;
        let headers_flags = FLAG_END_HEADERS | if has_body { 0 } else { FLAG_END_STREAM };
        write_frame(
            &mut *write_half,
            FrameHeader {
                length: 0,
                frame_type: TYPE_HEADERS,
                flags: headers_flags,
                stream_id,
            },
            encoded_headers,
        )
        .await?;

        if has_body {
            let max_frame = self.state.read().await.peer_settings.max_frame_size as usize;
            let mut offset = 0;
            while offset < parsed.body.len() {
                let end = (offset + max_frame).min(parsed.body.len());
                let last = end == parsed.body.len();
                let flags = if last { FLAG_END_STREAM } else { 0 };
                write_frame(
                    &mut *write_half,
                    FrameHeader {
                        length: 0,
                        frame_type: TYPE_DATA,
                        flags,
                        stream_id,
                    },
                    &parsed.body[offset..end],
                )
                .await?;
                offset = end;
            }
        }
        Ok(())
    }

    async fn read_until_done(
        &self,
        stream_id: u32,
        stream: &mut Stream,
        body: &SpillableBuffer,
        timer: &mut Recorder,
    ) -> Result<(), Error> {
        loop {
            let max_frame = self.state.read().await.our_settings.max_frame_size;
            let frame = {
                let mut read_half = self.read_half.lock().await;
                read_frame(&mut *read_half, max_frame).await?
            };
            self.touch_activity().await;

            match frame.header.frame_type {
                TYPE_HEADERS => {
                    if frame.header.stream_id != stream_id {
                        continue;
                    }
                    let header_block = extract_header_block(&frame.payload, frame.header.flags)?;
                    let decoded = {
                        let mut hpack = self.hpack.lock().await;
                        hpack.decode(&header_block)?
                    };
                    for (name, value) in decoded {
                        let name = String::from_utf8_lossy(&name).into_owned();
                        let value = String::from_utf8_lossy(&value).into_owned();
                        if name == ":status" {
                            stream.status_code = value.parse().ok();
                        } else {
                            stream.headers.push((name, value));
                        }
                    }
                    timer.ttfb_end();
                    let end_stream = frame.header.flags & FLAG_END_STREAM != 0;
                    stream.on_recv(end_stream)?;
                    if end_stream {
                        return Ok(());
                    }
                }
                TYPE_DATA => {
                    if frame.header.stream_id != stream_id {
                        continue;
                    }
                    let payload = strip_padding(&frame.payload, frame.header.flags)?;
                    if !payload.is_empty() {
                        body.write(&payload).await?;
                        self.emit_window_update(stream_id, payload.len() as u32).await?;
                    }
                    let end_stream = frame.header.flags & FLAG_END_STREAM != 0;
                    stream.on_recv(end_stream)?;
                    if end_stream {
                        return Ok(());
                    }
                }
                TYPE_SETTINGS => {
                    if frame.header.flags & FLAG_ACK == 0 {
                        {
                            let mut state = self.state.write().await;
                            for (id, value) in parse_params(&frame.payload) {
                                state.peer_settings.apply(id, value);
                            }
                        }
                        let mut write_half = self.write_half.lock().await;
                        write_frame(
                            &mut *write_half,
                            FrameHeader {
                                length: 0,
                                frame_type: TYPE_SETTINGS,
                                flags: FLAG_ACK,
                                stream_id: 0,
                            },
                            &[],
                        )
                        .await?;
                    }
                }
                TYPE_PING => {
                    if frame.header.flags & FLAG_ACK == 0 {
                        let mut write_half = self.write_half.lock().await;
                        write_frame(
                            &mut *write_half,
                            FrameHeader {
                                length: 0,
                                frame_type: TYPE_PING,
                                flags: FLAG_ACK,
                                stream_id: 0,
                            },
                            &frame.payload,
                        )
                        .await?;
                    }
                }
                TYPE_WINDOW_UPDATE => {
                    if frame.payload.len() == 4 {
                        let inc = u32::from_be_bytes(frame.payload[..4].try_into().expect("len checked")) & 0x7FFF_FFFF;
                        if frame.header.stream_id == 0 {
                            self.state.write().await.peer_conn_window += inc as i64;
                        } else if frame.header.stream_id == stream_id {
                            stream.peer_window += inc as i64;
                        }
                    }
                }
                TYPE_GOAWAY => {
                    let (last_stream_id, code) = if frame.payload.len() >= 8 {
                        (
                            u32::from_be_bytes(frame.payload[0..4].try_into().expect("len checked")) & 0x7FFF_FFFF,
                            u32::from_be_bytes(frame.payload[4..8].try_into().expect("len checked")),
                        )
                    } else {
                        (0, 0)
                    };
                    self.mark_closed().await;
                    return Err(Error::protocol(
                        "read",
                        format!("peer sent GOAWAY last_stream_id={last_stream_id} error_code={code}"),
                    ));
                }
                TYPE_RST_STREAM => {
                    if frame.header.stream_id == stream_id {
                        let code = if frame.payload.len() == 4 {
                            u32::from_be_bytes(frame.payload[..4].try_into().expect("len checked"))
                        } else {
                            0
                        };
                        stream.on_rst();
                        return Err(Error::protocol("read", format!("peer sent RST_STREAM error_code={code}")));
                    }
                }
                _ => {}
            }
        }
    }

    async fn emit_window_update(&self, stream_id: u32, len: u32) -> Result<(), Error> {
        let mut write_half = self.write_half.lock().await;
        write_frame(
            &mut *write_half,
            FrameHeader {
                length: 0,
                frame_type: TYPE_WINDOW_UPDATE,
                flags: 0,
                stream_id,
            },
            &len.to_be_bytes(),
        )
        .await?;
        write_frame(
            &mut *write_half,
            FrameHeader {
                length: 0,
                frame_type: TYPE_WINDOW_UPDATE,
                flags: 0,
                stream_id: 0,
            },
            &len.to_be_bytes(),
        )
        .await
    }

    /// Sends a connection-level keepalive PING (spec §4.6 background
    /// health-check). Does not wait for the PONG; the next `do_request`'s
    /// read loop observes and acks it like any other frame.
    pub async fn ping(&self) -> Result<(), Error> {
        let mut write_half = self.write_half.lock().await;
        write_frame(
            &mut *write_half,
            FrameHeader {
                length: 0,
                frame_type: TYPE_PING,
                flags: 0,
                stream_id: 0,
            },
            &[0u8; 8],
        )
        .await?;
        drop(write_half);
        self.touch_activity().await;
        Ok(())
    }

    async fn touch_activity(&self) {
        self.state.write().await.last_activity = Instant::now();
    }

    async fn mark_closed(&self) {
        self.state.write().await.closed = true;
        self.closed_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::Relaxed)
    }

    pub async fn idle_for(&self) -> Duration {
        self.state.read().await.last_activity.elapsed()
    }
}

fn strip_padding(payload: &[u8], flags: u8) -> Result<Vec<u8>, Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload.to_vec());
    }
    if payload.is_empty() {
        return Err(Error::protocol("read", "PADDED frame missing pad length byte"));
    }
    let pad_len = payload[0] as usize;
    let rest = &payload[1..];
    if pad_len > rest.len() {
        return Err(Error::protocol("read", "PADDED frame pad length exceeds payload"));
    }
    Ok(rest[..rest.len() - pad_len].to_vec())
}

fn extract_header_block(payload: &[u8], flags: u8) -> Result<Vec<u8>, Error> {
    let data = strip_padding(payload, flags)?;
    if flags & FLAG_PRIORITY != 0 {
        if data.len() < 5 {
            return Err(Error::protocol("read", "HEADERS frame with PRIORITY flag too short"));
        }
        return Ok(data[5..].to_vec());
    }
    Ok(data)
}
