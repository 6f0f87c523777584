//! HTTP/HTTPS `CONNECT` tunnel (spec §4.5, §6).

use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Error;
use crate::options::ProxyOptions;
use crate::stream::{boxed, BoxedStream, Stream};

use super::error::proxy_err;

/// Performs the `CONNECT host:port HTTP/1.1` handshake over an already-dialed
/// (and, for `https` proxies, already-TLS-upgraded) `stream`, returning the
/// tunneled connection ready for the target's own protocol to take over.
pub async fn connect<S: Stream + 'static>(
    stream: S,
    proxy: &ProxyOptions,
    target_host: &str,
    target_port: u16,
) -> Result<BoxedStream, Error> {
    let mut req = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\nConnection: keep-alive\r\n"
    );

    for (name, value) in &proxy.extra_headers {
        req.push_str(name);
        req.push_str(": ");
        req.push_str(value);
        req.push_str("\r\n");
    }

    if let Some(user) = &proxy.username {
        let pass = proxy.password.as_deref().unwrap_or_default();
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        req.push_str("Proxy-Authorization: Basic ");
        req.push_str(&encoded);
        req.push_str("\r\n");
    }
    req.push_str("\r\n");

    let mut stream = stream;
    stream
        .write_all(req.as_bytes())
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "write CONNECT request").with_cause(e))?;
    stream
        .flush()
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "flush CONNECT request").with_cause(e))?;

    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "read CONNECT status line").with_cause(e))?;

    // Strictly require a " 200 " substring per spec §4.5, §6 ("2xx" is
    // expressed in the spec as this conservative substring check).
    if !status_line.contains(" 200 ") && !status_line.trim_end().ends_with(" 200") {
        return Err(proxy_err(
            "connect",
            &proxy.host,
            proxy.port,
            format!("CONNECT tunnel rejected: {}", status_line.trim_end()),
        ));
    }

    // Drain remaining headers until an empty line.
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| proxy_err("connect", &proxy.host, proxy.port, "drain CONNECT headers").with_cause(e))?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(boxed(reader.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn opts() -> ProxyOptions {
        ProxyOptions {
            proxy_type: crate::options::ProxyType::Http,
            host: "proxy.local".into(),
            port: 8080,
            username: None,
            password: None,
            conn_timeout: None,
            extra_headers: Vec::new(),
            tls_config: None,
            resolve_dns_via_proxy: false,
        }
    }

    #[tokio::test]
    async fn succeeds_on_2xx_and_drains_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut reader = tokio::io::BufReader::new(&mut sock);
            // drain request (best effort, just read what's pending)
            use tokio::io::AsyncReadExt;
            let _ = tokio::time::timeout(std::time::Duration::from_millis(50), reader.read(&mut buf)).await;
            use tokio::io::AsyncWriteExt;
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\nX-Extra: 1\r\n\r\n")
                .await
                .unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let tunneled = connect(stream, &opts(), "example.com", 443).await.unwrap();
        drop(tunneled);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_2xx() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 1024];
            let _ = tokio::time::timeout(std::time::Duration::from_millis(50), server.read(&mut buf)).await;
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });
        let err = connect(client, &opts(), "example.com", 443).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Proxy);
    }
}
