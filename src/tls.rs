//! TLS termination.
//!
//! One rustls context is built per worker and shared by every connection.
//! The handshake yields the negotiated ALPN protocol (which decides
//! HTTP/1.1 vs HTTP/2) plus the [`TlsInfo`] record surfaced to scopes.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::server::{
    AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient,
};
use tokio_rustls::rustls::{
    self, Certificate, PrivateKey, RootCertStore, ServerConfig, SupportedCipherSuite,
};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::app::{ClientCert, TlsInfo};
use crate::config::{TlsConfig, TlsVersion};
use crate::error::Error;

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// A per-worker TLS context.
#[derive(Clone)]
pub(crate) struct Terminator {
    acceptor: TlsAcceptor,
}

impl Terminator {
    /// Build the shared context once. `http2` controls the advertised ALPN
    /// preference list.
    pub(crate) fn new(config: &TlsConfig, http2: bool) -> crate::Result<Terminator> {
        let certs = load_certs(&config.cert_file)?;
        let key = load_key(&config.key_file)?;

        let versions: &[&rustls::SupportedProtocolVersion] = match config.min_version {
            TlsVersion::V1_2 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::V1_3 => &[&rustls::version::TLS13],
        };
        let suites = if config.cipher_list.is_empty() {
            rustls::DEFAULT_CIPHER_SUITES.to_vec()
        } else {
            select_suites(&config.cipher_list)?
        };

        let builder = ServerConfig::builder()
            .with_cipher_suites(&suites)
            .with_safe_default_kx_groups()
            .with_protocol_versions(versions)
            .map_err(Error::new_tls)?;

        let builder = match (&config.ca_file, config.verify_client) {
            (Some(ca_file), true) => {
                let roots = load_ca(ca_file)?;
                builder.with_client_cert_verifier(Arc::new(
                    AllowAnyAuthenticatedClient::new(roots),
                ))
            }
            (Some(ca_file), false) => {
                let roots = load_ca(ca_file)?;
                builder.with_client_cert_verifier(Arc::new(
                    AllowAnyAnonymousOrAuthenticatedClient::new(roots),
                ))
            }
            (None, true) => {
                return Err(Error::new_config(
                    "verify_client requires a ca_file to verify against",
                ));
            }
            (None, false) => builder.with_no_client_auth(),
        };

        let mut server = builder
            .with_single_cert(certs, key)
            .map_err(Error::new_tls)?;
        server.alpn_protocols = if http2 {
            vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
        } else {
            vec![ALPN_HTTP11.to_vec()]
        };

        Ok(Terminator {
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }

    /// Run the handshake. A failure closes the connection without ever
    /// reaching the application.
    pub(crate) async fn accept<T>(
        &self,
        io: T,
    ) -> crate::Result<(tokio_rustls::server::TlsStream<T>, Arc<TlsInfo>, bool)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.acceptor.accept(io).await.map_err(Error::new_tls)?;
        let (_, session) = stream.get_ref();

        let selected_h2 = session.alpn_protocol() == Some(ALPN_H2);
        let tls_version = session
            .protocol_version()
            .map(|v| v.get_u16())
            .unwrap_or_default();
        let cipher_suite = session
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()));
        let client_cert_chain = session
            .peer_certificates()
            .map(|chain| {
                chain
                    .iter()
                    .map(|cert| ClientCert {
                        der: Bytes::copy_from_slice(&cert.0),
                        subject: subject_dn(&cert.0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            "tls handshake complete: version={:#06x} alpn_h2={}",
            tls_version, selected_h2
        );
        let info = Arc::new(TlsInfo {
            tls_version,
            cipher_suite,
            client_cert_chain,
        });
        Ok((stream, info, selected_h2))
    }
}

/// Resolve cipher preference names against the provider's suite list,
/// preserving the configured order.
fn select_suites(names: &[String]) -> crate::Result<Vec<SupportedCipherSuite>> {
    let mut suites = Vec::with_capacity(names.len());
    for name in names {
        let found = rustls::ALL_CIPHER_SUITES
            .iter()
            .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name));
        match found {
            Some(suite) => suites.push(*suite),
            None => {
                return Err(Error::new_config(format!(
                    "unknown cipher suite {:?}",
                    name
                )));
            }
        }
    }
    Ok(suites)
}

fn load_certs(path: &Path) -> crate::Result<Vec<Certificate>> {
    let file = File::open(path).map_err(Error::new_tls)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(Error::new_tls)?;
    if certs.is_empty() {
        return Err(Error::new_tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> crate::Result<PrivateKey> {
    let file = File::open(path).map_err(Error::new_tls)?;
    let mut reader = BufReader::new(file);
    for item in std::iter::from_fn(|| rustls_pemfile::read_one(&mut reader).transpose()) {
        match item.map_err(Error::new_tls)? {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(Error::new_tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

fn load_ca(path: &Path) -> crate::Result<RootCertStore> {
    let file = File::open(path).map_err(Error::new_tls)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(Error::new_tls)?;
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(&Certificate(cert))
            .map_err(Error::new_tls)?;
    }
    if roots.is_empty() {
        return Err(Error::new_tls(format!(
            "no CA certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

/// Human-readable subject DN from a DER certificate; empty when the DER
/// does not parse (the raw blob is still surfaced to the app).
fn subject_dn(der: &[u8]) -> String {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert.subject().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_cipher_names_resolve_in_order() {
        let suites = select_suites(&[
            "TLS13_AES_256_GCM_SHA384".to_owned(),
            "TLS13_AES_128_GCM_SHA256".to_owned(),
        ])
        .unwrap();
        assert_eq!(suites.len(), 2);
        assert_eq!(format!("{:?}", suites[0].suite()), "TLS13_AES_256_GCM_SHA384");
        assert_eq!(format!("{:?}", suites[1].suite()), "TLS13_AES_128_GCM_SHA256");
    }

    #[test]
    fn unknown_cipher_name_is_config_error() {
        let err = select_suites(&["TLS_MAGIC_NULL_NULL".to_owned()]).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn garbage_der_yields_empty_subject() {
        assert_eq!(subject_dn(b"not a certificate"), "");
    }
}
