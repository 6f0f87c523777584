//! `rawhttp`: a byte-preserving HTTP/1.1 and HTTP/2 transport core.
//!
//! Callers hand the library an already-formatted HTTP/1.1-style raw request
//! and get back both the parsed response and the literal bytes received from
//! the peer, with connection, TLS and timing metadata attached. HTTP/2 is
//! supported transparently: the caller's raw bytes are parsed and re-emitted
//! as frames, and the response is normalized back into the same shape.
//!
//! The entry point is [`Sender`].

mod address;
mod buffer;
mod dispatch;
mod error;
mod h1;
mod h2;
mod headers;
mod options;
mod pool;
mod proxy;
mod proxy_url;
mod response;
mod sender;
mod stream;
mod timing;
mod tls;

pub use address::{Authority, Host};
pub use buffer::SpillableBuffer;
pub use error::{Error, Kind};
pub use headers::HeaderMap;
pub use options::{
    Http2Settings, Options, Protocol, ProxyOptions, ProxyType, Scheme, TlsOptions, TlsVersion,
};
pub use pool::{ConnMeta, FabricConfig, PoolStats};
pub use proxy_url::parse_proxy_url;
pub use response::Response;
pub use sender::Sender;
pub use timing::Timings;
