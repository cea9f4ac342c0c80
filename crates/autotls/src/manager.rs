//! Certificate manager seam.
//!
//! The ACME client, issuance and renewal live behind [`CertManager`]. The
//! listener only asks it for certificates during handshakes and for HTTP-01
//! key authorizations, and builds it through a [`CertProvider`] at
//! construction time.

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{CacheError, CertCache};

/// ALPN protocol identifier of TLS-ALPN-01 validation handshakes
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Error, Debug)]
pub enum CertError {
    #[error("missing server name")]
    MissingServerName,

    #[error("host {0:?} is not allowed")]
    HostNotAllowed(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// ACME endpoint used by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// ACME directory URL
    pub directory_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_URL.to_string(),
        }
    }
}

impl ClientConfig {
    /// Let's Encrypt staging directory
    pub fn staging() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_STAGING_URL.to_string(),
        }
    }
}

/// What the manager gets to see of a ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// SNI, or the local IP address when the client sent none
    pub server_name: String,
    /// ALPN protocols offered by the client
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl ClientHelloInfo {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Whether this hello is a TLS-ALPN-01 validation attempt
    pub fn is_alpn_challenge(&self) -> bool {
        self.alpn_protocols
            .iter()
            .any(|p| p.as_slice() == ACME_TLS_ALPN_PROTOCOL)
    }
}

/// Set of hosts a manager may issue certificates for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPolicy {
    hosts: Vec<String>,
    index: HashSet<String>,
}

impl HostPolicy {
    /// Allow exactly `hosts` (case-insensitive, order kept)
    pub fn whitelist<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for host in hosts {
            let host = normalize(host.as_ref());
            if policy.index.insert(host.clone()) {
                policy.hosts.push(host);
            }
        }
        policy
    }

    pub fn check(&self, host: &str) -> Result<(), CertError> {
        if self.index.contains(&normalize(host)) {
            Ok(())
        } else {
            Err(CertError::HostNotAllowed(host.to_string()))
        }
    }

    /// Allowed hosts in configuration order
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Certificate source consulted on every TLS handshake.
#[async_trait]
pub trait CertManager: Send + Sync {
    /// Certificate for `hello`, obtaining or renewing it if needed.
    ///
    /// For TLS-ALPN-01 hellos ([`ClientHelloInfo::is_alpn_challenge`]) this
    /// returns the challenge certificate instead.
    async fn get_certificate(&self, hello: &ClientHelloInfo)
    -> Result<Arc<CertifiedKey>, CertError>;

    /// Key authorization for a pending HTTP-01 challenge
    fn http_challenge_response(&self, host: &str, token: &str) -> Option<String>;
}

/// Everything a provider needs to build a manager for one listener
#[derive(Clone)]
pub struct ManagerSettings {
    pub hosts: HostPolicy,
    pub cache: Arc<dyn CertCache>,
    pub client: ClientConfig,
}

/// Builds the [`CertManager`] for a listener.
pub trait CertProvider: Send + Sync {
    fn build(&self, settings: ManagerSettings) -> Result<Arc<dyn CertManager>, CertError>;
}

impl<F> CertProvider for F
where
    F: Fn(ManagerSettings) -> Result<Arc<dyn CertManager>, CertError> + Send + Sync,
{
    fn build(&self, settings: ManagerSettings) -> Result<Arc<dyn CertManager>, CertError> {
        self(settings)
    }
}
