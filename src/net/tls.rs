//! TLS configuration and certificate lookup.

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::aws_lc_rs;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::config::schema::{CertificateConfig, TlsConfig};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("{kind} file not found: {path}")]
    NotFound { kind: &'static str, path: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificate in {0}")]
    NoCertificate(String),
    #[error("no private key in {0}")]
    NoPrivateKey(String),
    #[error("unsupported private key in {path}: {source}")]
    Key {
        path: String,
        #[source]
        source: rustls::Error,
    },
    #[error("invalid domain `{0}`")]
    Domain(String),
    #[error("TLS setup failed: {0}")]
    Setup(#[from] rustls::Error),
}

/// A loaded certificate chain, its signing key, and the names it serves.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub domains: Vec<String>,
    pub key: Arc<CertifiedKey>,
    pub cert_path: String,
    pub key_path: String,
}

impl Certificate {
    pub fn from_pem(
        domains: Vec<String>,
        cert_pem: &[u8],
        key_pem: &[u8],
        cert_path: &str,
        key_path: &str,
    ) -> Result<Self, TlsError> {
        let chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Io {
                path: cert_path.to_string(),
                source,
            })?;
        if chain.is_empty() {
            return Err(TlsError::NoCertificate(cert_path.to_string()));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|source| TlsError::Io {
                path: key_path.to_string(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_string()))?;
        let signing_key = aws_lc_rs::sign::any_supported_type(&key).map_err(|source| TlsError::Key {
            path: key_path.to_string(),
            source,
        })?;

        Ok(Self {
            domains,
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
            cert_path: cert_path.to_string(),
            key_path: key_path.to_string(),
        })
    }

    pub fn from_files(domains: Vec<String>, cert_path: &str, key_path: &str) -> Result<Self, TlsError> {
        let read = |kind: &'static str, path: &str| {
            std::fs::read(path).map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    TlsError::NotFound {
                        kind,
                        path: path.to_string(),
                    }
                } else {
                    TlsError::Io {
                        path: path.to_string(),
                        source,
                    }
                }
            })
        };
        let cert = read("certificate", cert_path)?;
        let key = read("private key", key_path)?;
        Self::from_pem(domains, &cert, &key, cert_path, key_path)
    }

    pub fn load(config: &CertificateConfig) -> Result<Self, TlsError> {
        Self::from_files(config.domains.clone(), &config.cert_path, &config.key_path)
    }
}

/// Lookup of the certificate to present for an SNI name.
pub trait CertificateResolver: Send + Sync {
    fn certificate_for(&self, sni: &str) -> Option<Arc<Certificate>>;
}

/// In-memory certificates indexed by exact name and `*.` wildcard suffix.
#[derive(Debug, Default)]
pub struct CertificateStore {
    exact: HashMap<String, Arc<Certificate>>,
    wildcard: HashMap<String, Arc<Certificate>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, certificate: Certificate) -> Result<(), TlsError> {
        let certificate = Arc::new(certificate);
        for domain in &certificate.domains {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain.is_empty() {
                return Err(TlsError::Domain(domain));
            }
            match domain.strip_prefix("*.") {
                Some(suffix) if !suffix.is_empty() && !suffix.contains('*') => {
                    self.wildcard.insert(suffix.to_string(), certificate.clone());
                }
                Some(_) => return Err(TlsError::Domain(domain)),
                None if domain.contains('*') => return Err(TlsError::Domain(domain)),
                None => {
                    self.exact.insert(domain, certificate.clone());
                }
            }
        }
        Ok(())
    }

    /// Load every configured certificate. Fails on the first bad entry.
    pub fn from_config(configs: &[CertificateConfig]) -> Result<Self, TlsError> {
        let mut store = Self::new();
        for config in configs {
            store.insert(Certificate::load(config)?)?;
            tracing::info!(domains = ?config.domains, "Certificate loaded");
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}

impl CertificateResolver for CertificateStore {
    fn certificate_for(&self, sni: &str) -> Option<Arc<Certificate>> {
        let name = sni.trim_end_matches('.').to_ascii_lowercase();
        if let Some(cert) = self.exact.get(&name) {
            return Some(cert.clone());
        }
        // A wildcard covers exactly one label.
        let (_, parent) = name.split_once('.')?;
        self.wildcard.get(parent).cloned()
    }
}

/// Handshake-time certificate choice: the store's match for the SNI name,
/// else the listener's default certificate.
#[derive(Debug)]
pub struct SniResolver {
    store: Arc<CertificateStore>,
    default: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new(store: Arc<CertificateStore>, default: Option<Certificate>) -> Self {
        Self {
            store,
            default: default.map(|c| c.key),
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let chosen = client_hello
            .server_name()
            .and_then(|name| self.store.certificate_for(name))
            .map(|c| c.key.clone())
            .or_else(|| self.default.clone());
        if chosen.is_none() {
            tracing::debug!(sni = ?client_hello.server_name(), "No certificate for TLS handshake");
        }
        chosen
    }
}

/// Listener TLS configuration: the store's certificates by SNI name, with
/// `default` presented when nothing matches.
pub fn listener_tls_config(
    store: Arc<CertificateStore>,
    default: Option<&TlsConfig>,
) -> Result<RustlsConfig, TlsError> {
    let default = default
        .map(|tls| Certificate::from_files(Vec::new(), &tls.cert_path, &tls.key_path))
        .transpose()?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(store, default)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(RustlsConfig::from_config(Arc::new(config)))
}
