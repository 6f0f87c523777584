//! A small boxed-stream abstraction so the proxy connectors, TLS upgrade and
//! pool can hand a connection around without committing to a concrete type
//! (`TcpStream` directly, or `TlsStream<TcpStream>` once upgraded).

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex, unpin, send byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// A type-erased [`Stream`].
pub type BoxedStream = Pin<Box<dyn Stream>>;

pub fn boxed<S: Stream + 'static>(s: S) -> BoxedStream {
    Box::pin(s)
}
