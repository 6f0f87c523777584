//! SOCKS4 client handshake (spec §4.5). SOCKS4 only supports IPv4, so the
//! target hostname is resolved locally before the request is sent.

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::lookup_host;

use crate::error::Error;
use crate::options::ProxyOptions;
use crate::stream::{boxed, BoxedStream, Stream};

use super::error::proxy_err;

const REPLY_GRANTED: u8 = 0x5A;

fn reply_message(code: u8) -> &'static str {
    match code {
        0x5B => "request rejected or failed",
        0x5C => "request failed: client is not running identd",
        0x5D => "request failed: client's identd could not confirm user id",
        _ => "unknown SOCKS4 reply code",
    }
}

pub async fn connect<S: Stream + 'static>(
    mut stream: S,
    proxy: &ProxyOptions,
    target_host: &str,
    target_port: u16,
) -> Result<BoxedStream, Error> {
    let ipv4 = resolve_ipv4(target_host)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "resolve SOCKS4 target to IPv4").with_cause(e))?;

    let user_id = proxy.username.clone().unwrap_or_default();

    let mut req = Vec::with_capacity(9 + user_id.len());
    req.push(0x04); // version
    req.push(0x01); // CONNECT
    req.extend_from_slice(&target_port.to_be_bytes());
    req.extend_from_slice(&ipv4.octets());
    req.extend_from_slice(user_id.as_bytes());
    req.push(0x00);

    stream
        .write_all(&req)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "write SOCKS4 request").with_cause(e))?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "read SOCKS4 reply").with_cause(e))?;

    if reply[1] != REPLY_GRANTED {
        return Err(proxy_err(
            "connect",
            &proxy.host,
            proxy.port,
            format!("SOCKS4 {} (code=0x{:02x})", reply_message(reply[1]), reply[1]),
        ));
    }

    Ok(boxed(stream))
}

async fn resolve_ipv4(host: &str) -> std::io::Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let mut addrs = lookup_host((host, 0)).await?;
    addrs
        .find_map(|a| match a.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| std::io::Error::other("no IPv4 address found for SOCKS4 target"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn opts() -> ProxyOptions {
        ProxyOptions {
            proxy_type: crate::options::ProxyType::Socks4,
            host: "proxy.local".into(),
            port: 1080,
            username: None,
            password: None,
            conn_timeout: None,
            extra_headers: Vec::new(),
            tls_config: None,
            resolve_dns_via_proxy: false,
        }
    }

    #[tokio::test]
    async fn succeeds_on_granted_reply() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(buf[0], 0x04);
            assert_eq!(buf[1], 0x01);
            assert!(n >= 9);
            server.write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });
        connect(client, &opts(), "127.0.0.1", 80).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_granted_reply() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });
        let err = connect(client, &opts(), "127.0.0.1", 80).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Proxy);
    }
}
