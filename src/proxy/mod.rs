//! Proxy Connector (spec §4.5): dispatches on `proxy.type` to tunnel a
//! dialed connection through to the target.

mod error;
pub mod http_connect;
pub mod socks4;
pub mod socks5;

use crate::error::Error;
use crate::options::{ProxyOptions, ProxyType};
use crate::stream::{BoxedStream, Stream};
use crate::tls;

/// Tunnels an already-dialed `stream` (to the proxy) through to
/// `target_host:target_port`, returning the connection ready for the
/// target's own protocol (TLS upgrade, then HTTP/1.1 or HTTP/2) to take
/// over.
pub async fn tunnel<S: Stream + 'static>(
    stream: S,
    proxy: &ProxyOptions,
    target_host: &str,
    target_port: u16,
) -> Result<BoxedStream, Error> {
    match proxy.proxy_type {
        ProxyType::Http => http_connect::connect(stream, proxy, target_host, target_port).await,
        ProxyType::Https => {
            let tls_opts = proxy.tls_config.clone().unwrap_or_default();
            let config = tls::build_client_config(&tls_opts, tls::Engine::Http1)?;
            let server_name = tls_opts
                .raw_server_name
                .clone()
                .unwrap_or_else(|| proxy.host.clone());
            let upgraded = crate::pool::tls_upgrade(stream, config, &server_name).await?;
            http_connect::connect(upgraded.stream, proxy, target_host, target_port).await
        }
        ProxyType::Socks4 => socks4::connect(stream, proxy, target_host, target_port).await,
        ProxyType::Socks5 => socks5::connect(stream, proxy, target_host, target_port).await,
    }
}
