//! TLS Configurator: builds an effective `rustls::ClientConfig` from
//! [`TlsOptions`], following the merge/precedence rules in spec §4.4.

mod verify;

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};

use crate::error::Error;
use crate::options::{TlsOptions, TlsVersion};

/// Which engine is requesting the config — governs the ALPN policy (spec
/// §4.4 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Http1,
    Http2,
}

/// Protocol versions allowed for a (min, max) pair, defaulting to
/// `min_version = TLS 1.2` per spec §4.4 step 1 when unset.
fn allowed_versions(
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let min = min.unwrap_or(TlsVersion::Tls12);
    let max = max.unwrap_or(TlsVersion::Tls13);
    let mut versions = Vec::new();
    if max >= TlsVersion::Tls13 && min <= TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if min <= TlsVersion::Tls12 && max >= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    versions
}

/// Builds the effective TLS client config for a connection attempt.
pub fn build_client_config(opts: &TlsOptions, engine: Engine) -> Result<Arc<ClientConfig>, Error> {
    let mut config = if let Some(passthrough) = &opts.raw_tls_config {
        // Step 2: versions/ciphers are only applied when unset on the
        // cloned config; a full passthrough config already carries its own
        // negotiated version set, so we leave it untouched here.
        (**passthrough).clone()
    } else {
        let roots = build_root_store(opts)?;
        let versions = allowed_versions(opts.min_tls_version, opts.max_tls_version);

        // Step 2: apply `cipher_suites` only when unset — i.e. only on this
        // freshly-built path, never against a passthrough config.
        let base = if let Some(requested) = &opts.cipher_suites {
            let provider = Arc::new(filtered_crypto_provider(requested));
            ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(&versions)
                .map_err(|e| Error::tls("build_config", "invalid TLS protocol version selection").with_cause(e))?
        } else {
            ClientConfig::builder_with_protocol_versions(&versions)
        };

        if let (Some(cert_chain), Some(key)) = client_identity(opts)? {
            base.with_root_certificates(roots)
                .with_client_auth_cert(cert_chain, key)
                .map_err(|e| Error::tls("build_config", "invalid client certificate").with_cause(e))?
        } else {
            base.with_root_certificates(roots).with_no_client_auth()
        }
    };

    // Step 5: insecure_tls always overrides, regardless of passthrough.
    if opts.insecure_tls {
        let mut dangerous = config.dangerous();
        dangerous.set_certificate_verifier(Arc::new(verify::NoVerifier));
    }

    if opts.renegotiation {
        tracing::debug!(
            "renegotiation requested but rustls intentionally does not support TLS \
             renegotiation; the option is advisory only"
        );
    }

    // Step 3: ALPN policy.
    match engine {
        Engine::Http1 => {
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
        }
        Engine::Http2 => {
            if config.alpn_protocols.is_empty() {
                config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            } else if !config.alpn_protocols.iter().any(|p| p == b"h2") {
                config.alpn_protocols.insert(0, b"h2".to_vec());
            }
        }
    }

    Ok(Arc::new(config))
}

/// The ring provider's default cipher suite set, restricted to the IANA ids
/// in `requested`. Falls back to the full default set (with a debug log) if
/// none of the requested ids match a suite the provider supports, rather
/// than handing rustls an empty suite list it can never negotiate with.
fn filtered_crypto_provider(requested: &[u16]) -> rustls::crypto::CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    let selected: Vec<_> = provider
        .cipher_suites
        .iter()
        .filter(|cs| requested.contains(&u16::from(cs.suite())))
        .cloned()
        .collect();
    if selected.is_empty() {
        tracing::debug!(
            "cipher_suites option matched none of the ring provider's supported suites; \
             using its full default set instead"
        );
    } else {
        provider.cipher_suites = selected;
    }
    provider
}

fn build_root_store(opts: &TlsOptions) -> Result<RootCertStore, Error> {
    if let Some(pems) = &opts.custom_ca_certs {
        let mut store = RootCertStore::empty();
        for (idx, block) in pems.iter().enumerate() {
            let mut reader = std::io::Cursor::new(block);
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
                .collect::<Result<_, _>>()
                .map_err(|e| {
                    Error::tls(
                        "build_root_store",
                        format!("failed to parse custom CA cert at index {idx}"),
                    )
                    .with_cause(e)
                })?;
            for cert in certs {
                store.add(cert).map_err(|e| {
                    Error::tls(
                        "build_root_store",
                        format!("failed to add custom CA cert at index {idx}"),
                    )
                    .with_cause(std::io::Error::other(e))
                })?;
            }
        }
        Ok(store)
    } else {
        let mut store = RootCertStore::empty();
        match rustls_native_certs::load_native_certs().certs.into_iter().try_for_each(
            |c| -> Result<(), Error> {
                let _ = store.add(c);
                Ok(())
            },
        ) {
            Ok(()) => {}
            Err(e) => return Err(e),
        }
        if store.is_empty() {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        Ok(store)
    }
}

type ClientIdentity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn client_identity(opts: &TlsOptions) -> Result<(Option<Vec<CertificateDer<'static>>>, Option<PrivateKeyDer<'static>>), Error> {
    if let (Some(cert_pem), Some(key_pem)) = (&opts.client_cert_pem, &opts.client_key_pem) {
        let (chain, key) = parse_identity(cert_pem, key_pem)?;
        return Ok((Some(chain), Some(key)));
    }
    if let (Some(cert_file), Some(key_file)) = (&opts.client_cert_file, &opts.client_key_file) {
        let cert_pem = std::fs::read(cert_file)
            .map_err(|e| Error::tls("client_identity", "read client cert file").with_cause(e))?;
        let key_pem = std::fs::read(key_file)
            .map_err(|e| Error::tls("client_identity", "read client key file").with_cause(e))?;
        let (chain, key) = parse_identity(&cert_pem, &key_pem)?;
        return Ok((Some(chain), Some(key)));
    }
    Ok((None, None))
}

fn parse_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<ClientIdentity, Error> {
    let mut cert_reader = std::io::Cursor::new(cert_pem);
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| Error::tls("parse_identity", "parse client cert PEM").with_cause(e))?;

    let mut key_reader = std::io::Cursor::new(key_pem);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::tls("parse_identity", "parse client key PEM").with_cause(e))?
        .ok_or_else(|| Error::tls("parse_identity", "no private key found in PEM"))?;

    Ok((chain, key))
}
