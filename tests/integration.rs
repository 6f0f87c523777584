//! End-to-end scenarios against loopback TCP/TLS servers, covering the
//! concrete scenarios and universal invariants from spec §8.

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use rawhttp::{Options, ProxyOptions, ProxyType, Protocol, Scheme, Sender, TlsOptions};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn base_options(addr: SocketAddr) -> Options {
    Options {
        host: addr.ip().to_string(),
        port: addr.port(),
        scheme: Scheme::Http,
        read_timeout: Some(Duration::from_secs(5)),
        ..Options::default()
    }
}

async fn serve_once(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

async fn serve_keepalive(response: &'static [u8], requests: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            for _ in 0..requests {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                if stream.write_all(response).await.is_err() {
                    break;
                }
            }
        }
    });
    addr
}

async fn serve_http_connect_proxy(target: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut client, _)) = listener.accept().await {
            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            loop {
                let n = client.read(&mut tmp).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            if client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            if let Ok(mut upstream) = TcpStream::connect(target).await {
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            }
        }
    });
    addr
}

#[tokio::test]
async fn chunked_decode() {
    let addr = serve_once(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n4\r\nTest\r\n0\r\n\r\n",
    )
    .await;

    let sender = Sender::new();
    let opts = base_options(addr);
    let req = b"GET /chunk HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n";
    let resp = sender.do_request(req, &opts).await.unwrap();

    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body_bytes, 4);
    assert_eq!(resp.body.to_vec().await.unwrap(), b"Test");
    assert!(resp.body_bytes <= resp.raw_bytes);

    sender.close().await;
}

#[tokio::test]
async fn content_length_short_read_is_tolerated() {
    let addr = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\nshort").await;

    let sender = Sender::new();
    let opts = base_options(addr);
    let req = b"GET /short HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n";
    let resp = sender.do_request(req, &opts).await.unwrap();

    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body_bytes, 5);
    assert_eq!(resp.body.to_vec().await.unwrap(), b"short");

    sender.close().await;
}

#[tokio::test]
async fn head_request_has_no_body() {
    let addr = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n").await;

    let sender = Sender::new();
    let opts = base_options(addr);
    let req = b"HEAD /x HTTP/1.1\r\nHost: h\r\n\r\n";
    let resp = tokio::time::timeout(Duration::from_secs(2), sender.do_request(req, &opts))
        .await
        .expect("HEAD request must not hang waiting for a body the server never sends")
        .unwrap();

    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body_bytes, 0);

    sender.close().await;
}

#[tokio::test]
async fn pool_reuse_marks_second_request_as_reused() {
    let response: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let addr = serve_keepalive(response, 2).await;

    let sender = Sender::new();
    let opts = Options {
        reuse_connection: true,
        ..base_options(addr)
    };
    let req = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";

    let resp1 = sender.do_request(req, &opts).await.unwrap();
    assert!(!resp1.connection.reused_from_pool);

    let resp2 = sender.do_request(req, &opts).await.unwrap();
    assert!(resp2.connection.reused_from_pool);

    let stats = sender.pool_stats();
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_reused, 1);

    sender.close().await;
}

#[tokio::test]
async fn proxy_and_direct_requests_never_share_a_pool_key() {
    let response: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let direct_addr = serve_once(response).await;
    let target_addr = serve_once(response).await;
    let proxy_addr = serve_http_connect_proxy(target_addr).await;

    let sender = Sender::new();

    let direct_opts = base_options(direct_addr);
    let resp1 = sender.do_request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n", &direct_opts).await.unwrap();

    let proxied_opts = Options {
        proxy: Some(ProxyOptions {
            proxy_type: ProxyType::Http,
            host: proxy_addr.ip().to_string(),
            port: proxy_addr.port(),
            username: None,
            password: None,
            conn_timeout: None,
            extra_headers: Vec::new(),
            tls_config: None,
            resolve_dns_via_proxy: false,
        }),
        ..base_options(target_addr)
    };
    let resp2 = sender
        .do_request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n", &proxied_opts)
        .await
        .unwrap();

    assert_ne!(resp1.connection.proxy_used, resp2.connection.proxy_used);
    assert_ne!(resp1.connection.pool_key, resp2.connection.pool_key);

    sender.close().await;
}

// --- HTTP/2 scenarios -------------------------------------------------

fn install_crypto_provider() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn self_signed_server_config(alpn: &[&str]) -> rustls::ServerConfig {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der: PrivateKeyDer<'static> = PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into();

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    config
}

fn h2_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(9 + payload.len());
    buf.push((len >> 16) as u8);
    buf.push((len >> 8) as u8);
    buf.push(len as u8);
    buf.push(frame_type);
    buf.push(flags);
    buf.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

const H2_SETTINGS: u8 = 0x4;
const H2_HEADERS: u8 = 0x1;
const H2_DATA: u8 = 0x0;
const H2_WINDOW_UPDATE: u8 = 0x8;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

/// Drives the server side of an HTTP/2 connection far enough to answer one
/// request: consumes the client preface, SETTINGS and post-handshake
/// WINDOW_UPDATE, ack's the client's SETTINGS, reads the request HEADERS
/// frame, then writes back HEADERS + DATA with END_STREAM.
async fn serve_h2_happy_path<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(stream: &mut S) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut preface = [0u8; 24];
    stream.read_exact(&mut preface).await.unwrap();
    assert_eq!(&preface, b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");

    // client SETTINGS
    let settings_header = read_frame_header(stream).await;
    let mut settings_payload = vec![0u8; settings_header.0 as usize];
    stream.read_exact(&mut settings_payload).await.unwrap();

    // ack it so the client's handshake loop completes immediately
    stream.write_all(&h2_frame(H2_SETTINGS, FLAG_ACK, 0, &[])).await.unwrap();
    stream.flush().await.unwrap();

    // client's post-handshake connection WINDOW_UPDATE (its default
    // initial_window_size exceeds the RFC default of 65535)
    let wu_header = read_frame_header(stream).await;
    assert_eq!(wu_header.1, H2_WINDOW_UPDATE);
    let mut wu_payload = vec![0u8; wu_header.0 as usize];
    stream.read_exact(&mut wu_payload).await.unwrap();

    // request HEADERS
    let req_header = read_frame_header(stream).await;
    assert_eq!(req_header.1, H2_HEADERS);
    let mut req_payload = vec![0u8; req_header.0 as usize];
    stream.read_exact(&mut req_payload).await.unwrap();

    let mut encoder = hpack::Encoder::new();
    let status_headers = encoder.encode(vec![(b":status".as_slice(), b"200".as_slice())]);
    stream
        .write_all(&h2_frame(H2_HEADERS, FLAG_END_HEADERS, 1, &status_headers))
        .await
        .unwrap();
    stream
        .write_all(&h2_frame(H2_DATA, FLAG_END_STREAM, 1, b"hello"))
        .await
        .unwrap();
    stream.flush().await.unwrap();
}

async fn read_frame_header<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> (u32, u8, u8, u32) {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 9];
    stream.read_exact(&mut buf).await.unwrap();
    let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32;
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7FFF_FFFF;
    (length, buf[3], buf[4], stream_id)
}

#[tokio::test]
async fn http2_happy_path_over_tls() {
    install_crypto_provider();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_config = std::sync::Arc::new(self_signed_server_config(&["h2"]));
    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);

    tokio::spawn(async move {
        if let Ok((tcp, _)) = listener.accept().await {
            if let Ok(mut tls) = acceptor.accept(tcp).await {
                serve_h2_happy_path(&mut tls).await;
            }
        }
    });

    let sender = Sender::new();
    let opts = Options {
        scheme: Scheme::Https,
        host: addr.ip().to_string(),
        port: addr.port(),
        protocol: Protocol::Http2,
        tls: TlsOptions {
            insecure_tls: true,
            ..TlsOptions::default()
        },
        read_timeout: Some(Duration::from_secs(5)),
        ..Options::default()
    };
    let req = b"GET / HTTP/2\r\nHost: localhost\r\n\r\n";
    let resp = sender.do_request(req, &opts).await.unwrap();

    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.http_version, "HTTP/2");
    assert_eq!(resp.body_bytes, 5);
    assert_eq!(resp.body.to_vec().await.unwrap(), b"hello");

    sender.close().await;
}

#[tokio::test]
async fn http2_falls_back_to_http1_on_alpn_refusal() {
    install_crypto_provider();

    let response: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_config = std::sync::Arc::new(self_signed_server_config(&["http/1.1"]));
    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);

    tokio::spawn(async move {
        if let Ok((tcp, _)) = listener.accept().await {
            if let Ok(mut tls) = acceptor.accept(tcp).await {
                let mut buf = [0u8; 4096];
                let _ = tls.read(&mut buf).await;
                let _ = tls.write_all(response).await;
                let _ = tls.shutdown().await;
            }
        }
    });

    let sender = Sender::new();
    let opts = Options {
        scheme: Scheme::Https,
        host: addr.ip().to_string(),
        port: addr.port(),
        protocol: Protocol::Http2,
        tls: TlsOptions {
            insecure_tls: true,
            ..TlsOptions::default()
        },
        read_timeout: Some(Duration::from_secs(5)),
        ..Options::default()
    };
    let req = b"GET / HTTP/2\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    let resp = tokio::time::timeout(Duration::from_secs(3), sender.do_request(req, &opts))
        .await
        .expect("ALPN-refusal fallback must not fall back to waiting out the HTTP/2 handshake timeout")
        .unwrap();

    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.http_version, "HTTP/1.1");
    assert_eq!(resp.body_bytes, 2);

    sender.close().await;
}
