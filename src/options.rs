//! Caller-facing configuration record (spec §3 "Options").

use std::time::Duration;

use crate::error::{Error, Kind};

/// Target scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Which protocol engine to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Auto,
    Http1,
    Http2,
}

/// Upstream proxy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Https,
    Socks4,
    Socks5,
}

/// Proxy connection settings (spec §3 `proxy` record).
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub conn_timeout: Option<Duration>,
    pub extra_headers: Vec<(String, String)>,
    pub tls_config: Option<TlsOptions>,
    pub resolve_dns_via_proxy: bool,
}

/// HTTP/2 SETTINGS parameters + debug flags (spec §3, §6 defaults).
#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub enable_push: bool,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub header_table_size: u32,
    pub max_concurrent_streams: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            enable_push: false,
            initial_window_size: 4_194_304,
            max_frame_size: 16_384,
            max_header_list_size: 10_485_760,
            header_table_size: 4096,
            max_concurrent_streams: 100,
        }
    }
}

/// TLS-relevant subset of [`Options`], also reused standalone for
/// `ProxyOptions::tls_config` (TLS-upgrading an `https` proxy).
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub insecure_tls: bool,
    pub sni: Option<String>,
    pub disable_sni: bool,
    pub min_tls_version: Option<TlsVersion>,
    pub max_tls_version: Option<TlsVersion>,
    pub cipher_suites: Option<Vec<u16>>,
    pub renegotiation: bool,
    pub custom_ca_certs: Option<Vec<Vec<u8>>>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
    pub client_cert_file: Option<String>,
    pub client_key_file: Option<String>,
    /// Passthrough: an already-built `rustls::ClientConfig`, cloned and
    /// merged per spec §4.4 rather than rebuilt from scratch.
    pub raw_tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    /// A server name explicitly carried by the passthrough config, if any.
    /// `rustls::ClientConfig` itself has no such field, so callers supplying
    /// a `raw_tls_config` built for a specific peer set this alongside it;
    /// it is the highest-precedence SNI source (spec §4.4 step 4 / §3 SNI
    /// precedence).
    pub raw_server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// The full request options record.
#[derive(Debug, Clone)]
pub struct Options {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub connect_ip: Option<std::net::IpAddr>,

    pub tls: TlsOptions,

    pub conn_timeout: Option<Duration>,
    pub dns_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,

    pub body_mem_limit: u64,

    pub protocol: Protocol,
    pub http2_settings: Http2Settings,

    pub reuse_connection: bool,

    pub proxy: Option<ProxyOptions>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            host: String::new(),
            port: 80,
            connect_ip: None,
            tls: TlsOptions::default(),
            conn_timeout: Some(Duration::from_secs(30)),
            dns_timeout: Some(Duration::from_secs(5)),
            read_timeout: None,
            write_timeout: None,
            body_mem_limit: 2 * 1024 * 1024,
            protocol: Protocol::Auto,
            http2_settings: Http2Settings::default(),
            reuse_connection: true,
            proxy: None,
        }
    }
}

impl Options {
    /// Validates the invariants from spec §3. Run synchronously before any
    /// I/O — validation errors never touch the network.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tls.disable_sni && self.tls.sni.as_deref().is_some_and(|s| !s.is_empty()) {
            return Err(Error::validation(
                "validate",
                "disable_sni=true conflicts with a non-empty sni option",
            ));
        }
        if self.port == 0 {
            return Err(Error::validation("validate", "port must be in [1,65535]"));
        }
        if self.host.is_empty() {
            return Err(Error::validation("validate", "host must not be empty"));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() {
                return Err(Error::validation("validate", "proxy host must not be empty"));
            }
            if proxy.port == 0 {
                return Err(Error::validation(
                    "validate",
                    "proxy port must be in [1,65535]",
                ));
            }
        }
        Ok(())
    }

    /// Full SNI precedence per spec §3/§4.4: explicit TLS-config-provided
    /// server name > `sni` option > `host`, unless `disable_sni`.
    pub fn effective_sni(&self) -> Option<&str> {
        if let Some(name) = self.tls.raw_server_name.as_deref().filter(|s| !s.is_empty()) {
            return Some(name);
        }
        if self.tls.disable_sni {
            None
        } else if let Some(sni) = self.tls.sni.as_deref().filter(|s| !s.is_empty()) {
            Some(sni)
        } else {
            Some(self.host.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_conflicting_sni_options() {
        let mut o = Options {
            host: "example.com".into(),
            ..Options::default()
        };
        o.tls.disable_sni = true;
        o.tls.sni = Some("foo".into());
        assert_eq!(o.validate().unwrap_err().kind(), Kind::Validation);
    }

    #[test]
    fn rejects_empty_host_and_bad_port() {
        let o = Options {
            host: String::new(),
            ..Options::default()
        };
        assert!(o.validate().is_err());

        let o2 = Options {
            host: "h".into(),
            port: 0,
            ..Options::default()
        };
        assert!(o2.validate().is_err());
    }

    #[test]
    fn sni_precedence_falls_back_to_host() {
        let o = Options {
            host: "example.com".into(),
            ..Options::default()
        };
        assert_eq!(o.effective_sni(), Some("example.com"));
    }
}
