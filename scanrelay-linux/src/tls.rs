//! TLS client configuration for the collector uplink.
//!
//! The relay authenticates with a client certificate. Missing or unreadable credentials are
//! detected at startup; a collector that rejects them answers with a fatal alert. Under
//! TLS 1.3 that alert arrives on the first read after the handshake, not during it.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use scanrelay_core::ConnectError;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates in {}", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key in {}", .0.display())]
    NoKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Build the client config: collector roots (custom CA or web PKI) plus our certificate.
pub fn client_config(cfg: &Config) -> Result<Arc<ClientConfig>, TlsError> {
    let root_store = match &cfg.ca_cert {
        Some(path) => {
            let mut store = RootCertStore::empty();
            let (added, ignored) = store.add_parsable_certificates(load_certs(path)?);
            if added == 0 {
                return Err(TlsError::NoCertificates(path.clone()));
            }
            if ignored > 0 {
                tracing::warn!(path = %path.display(), ignored, "skipped unparsable CA certificates");
            }
            store
        }
        None => {
            let mut store = RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        }
    };

    let certs = load_certs(&cfg.client_cert)?;
    let key = load_key(&cfg.client_key)?;
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Classify a TLS failure from the handshake or a read. An alert from the collector means
/// it refused our credentials; anything else is retried.
pub fn classify(err: &std::io::Error) -> ConnectError {
    let tls = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match tls {
        Some(rustls::Error::AlertReceived(alert)) => {
            ConnectError::CredentialsRejected(format!("collector sent {alert:?}"))
        }
        _ => ConnectError::Transient(format!("TLS: {err}")),
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read(path)?;
    let mut reader = BufReader::new(pem.as_slice());
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok())
        .collect();
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read(path)?;
    let mut reader = BufReader::new(pem.as_slice());
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(TlsError::NoKey(path.to_path_buf())),
        Err(source) => Err(TlsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
