//! SOCKS5 client handshake per RFC 1928 (spec §4.5). Supports optional
//! username/password auth (RFC 1929); DNS resolution defaults to the proxy
//! side (the target domain is sent as-is rather than resolved locally).

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::Error;
use crate::options::ProxyOptions;
use crate::stream::{boxed, BoxedStream, Stream};

use super::error::proxy_err;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 reply code",
    }
}

pub async fn connect<S: Stream + 'static>(
    mut stream: S,
    proxy: &ProxyOptions,
    target_host: &str,
    target_port: u16,
) -> Result<BoxedStream, Error> {
    let has_creds = proxy.username.is_some();
    let methods: &[u8] = if has_creds {
        &[METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[METHOD_NO_AUTH]
    };

    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    stream
        .write_all(&greeting)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "write SOCKS5 greeting").with_cause(e))?;

    let mut chosen = [0u8; 2];
    stream
        .read_exact(&mut chosen)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "read SOCKS5 method selection").with_cause(e))?;

    if chosen[0] != VERSION {
        return Err(proxy_err(
            "connect",
            &proxy.host,
            proxy.port,
            "SOCKS5 server replied with unexpected version",
        ));
    }

    match chosen[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            authenticate(&mut stream, proxy).await?;
        }
        METHOD_NONE_ACCEPTABLE => {
            return Err(proxy_err(
                "connect",
                &proxy.host,
                proxy.port,
                "SOCKS5 server accepted no offered auth method",
            ));
        }
        other => {
            return Err(proxy_err(
                "connect",
                &proxy.host,
                proxy.port,
                format!("SOCKS5 server chose unsupported method 0x{other:02x}"),
            ));
        }
    }

    let mut req = vec![VERSION, CMD_CONNECT, 0x00];
    if let Ok(ip) = target_host.parse::<std::net::Ipv4Addr>() {
        req.push(ATYP_IPV4);
        req.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = target_host.parse::<std::net::Ipv6Addr>() {
        req.push(ATYP_IPV6);
        req.extend_from_slice(&ip.octets());
    } else {
        if target_host.len() > 255 {
            return Err(proxy_err(
                "connect",
                &proxy.host,
                proxy.port,
                "SOCKS5 target domain name exceeds 255 bytes",
            ));
        }
        req.push(ATYP_DOMAIN);
        req.push(target_host.len() as u8);
        req.extend_from_slice(target_host.as_bytes());
    }
    req.extend_from_slice(&target_port.to_be_bytes());

    stream
        .write_all(&req)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "write SOCKS5 connect request").with_cause(e))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "read SOCKS5 reply header").with_cause(e))?;

    if head[1] != 0x00 {
        return Err(proxy_err(
            "connect",
            &proxy.host,
            proxy.port,
            format!("SOCKS5 {} (code=0x{:02x})", reply_message(head[1]), head[1]),
        ));
    }

    // Consume the bound address per the reply's ATYP so the stream is left
    // positioned at the tunnel's first application byte.
    match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4 + 2];
            stream.read_exact(&mut buf).await
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16 + 2];
            stream.read_exact(&mut buf).await
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await
        }
        other => {
            return Err(proxy_err(
                "connect",
                &proxy.host,
                proxy.port,
                format!("SOCKS5 reply used unsupported address type 0x{other:02x}"),
            ));
        }
    }
    .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "read SOCKS5 bound address").with_cause(e))?;

    Ok(boxed(stream))
}

async fn authenticate<S: Stream>(stream: &mut S, proxy: &ProxyOptions) -> Result<(), Error> {
    let user = proxy.username.as_deref().unwrap_or_default();
    let pass = proxy.password.as_deref().unwrap_or_default();
    if user.len() > 255 || pass.len() > 255 {
        return Err(proxy_err(
            "connect",
            &proxy.host,
            proxy.port,
            "SOCKS5 username/password exceed 255 bytes",
        ));
    }

    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(0x01);
    req.push(user.len() as u8);
    req.extend_from_slice(user.as_bytes());
    req.push(pass.len() as u8);
    req.extend_from_slice(pass.as_bytes());

    stream
        .write_all(&req)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "write SOCKS5 auth request").with_cause(e))?;

    let mut resp = [0u8; 2];
    stream
        .read_exact(&mut resp)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "read SOCKS5 auth response").with_cause(e))?;

    if resp[1] != 0x00 {
        return Err(proxy_err(
            "connect",
            &proxy.host,
            proxy.port,
            "SOCKS5 username/password authentication failed",
        ));
    }
    Ok(())
}
