//! Self-signed certificate manager for development and tests.
//!
//! Issues one self-signed certificate per allowed host and persists it in the
//! configured [`CertCache`]. It speaks no ACME: validation challenges are never
//! pending, and TLS-ALPN-01 hellos get the regular certificate.

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::{CacheError, CertCache};
use crate::manager::{
    CertError, CertManager, CertProvider, ClientHelloInfo, HostPolicy, ManagerSettings,
};
use crate::tls::certified_key_from_pem;

pub struct SelfSignedManager {
    hosts: HostPolicy,
    cache: Arc<dyn CertCache>,
    loaded: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl SelfSignedManager {
    pub fn new(hosts: HostPolicy, cache: Arc<dyn CertCache>) -> Self {
        Self {
            hosts,
            cache,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// Hosts with a certificate in memory
    pub async fn loaded_hosts(&self) -> Vec<String> {
        self.loaded.read().await.keys().cloned().collect()
    }

    async fn load_or_issue(&self, host: &str) -> Result<CertifiedKey, CertError> {
        let key = cache_key(host);
        match self.cache.get(&key).await {
            Ok(pem) => {
                debug!(host, "Loaded self-signed certificate from cache");
                certified_key_from_pem(&pem)
            }
            Err(CacheError::Miss) => {
                let pem = issue(host)?;
                self.cache.put(&key, pem.as_bytes()).await?;
                info!(host, "Issued self-signed certificate");
                certified_key_from_pem(pem.as_bytes())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CertManager for SelfSignedManager {
    async fn get_certificate(
        &self,
        hello: &ClientHelloInfo,
    ) -> Result<Arc<CertifiedKey>, CertError> {
        let host = hello.server_name.trim_end_matches('.').to_ascii_lowercase();
        self.hosts.check(&host)?;

        if let Some(key) = self.loaded.read().await.get(&host) {
            return Ok(key.clone());
        }

        let key = Arc::new(self.load_or_issue(&host).await?);
        let mut loaded = self.loaded.write().await;
        // a concurrent handshake may have won the race
        Ok(loaded.entry(host).or_insert(key).clone())
    }

    fn http_challenge_response(&self, _host: &str, _token: &str) -> Option<String> {
        None
    }
}

/// [`CertProvider`] building a [`SelfSignedManager`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfSignedProvider;

impl CertProvider for SelfSignedProvider {
    fn build(&self, settings: ManagerSettings) -> Result<Arc<dyn CertManager>, CertError> {
        debug!(
            directory = %settings.client.directory_url,
            "Self-signed manager ignores the ACME directory"
        );
        Ok(Arc::new(SelfSignedManager::new(settings.hosts, settings.cache)))
    }
}

fn cache_key(host: &str) -> String {
    format!("{host}+self-signed")
}

/// PEM bundle (certificate then key) for `host`
fn issue(host: &str) -> Result<String, CertError> {
    let generated = rcgen::generate_simple_self_signed(vec![host.to_string()])
        .map_err(|e| anyhow::anyhow!("Failed to generate certificate for {host}: {e}"))?;
    Ok(format!(
        "{}{}",
        generated.cert.pem(),
        generated.key_pair.serialize_pem()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn manager(cache: Arc<MemoryCache>) -> SelfSignedManager {
        SelfSignedManager::new(
            HostPolicy::whitelist(["example.com", "192.0.2.1"]),
            cache,
        )
    }

    #[tokio::test]
    async fn test_issues_and_reuses_certificate() {
        let cache = Arc::new(MemoryCache::new());
        let manager = manager(cache.clone());

        let first = manager
            .get_certificate(&ClientHelloInfo::new("example.com"))
            .await
            .unwrap();
        let second = manager
            .get_certificate(&ClientHelloInfo::new("EXAMPLE.com"))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len().await, 1);
        assert_eq!(manager.loaded_hosts().await, vec!["example.com"]);
    }

    #[tokio::test]
    async fn test_reloads_from_cache() {
        let cache = Arc::new(MemoryCache::new());

        let issued = manager(cache.clone())
            .get_certificate(&ClientHelloInfo::new("192.0.2.1"))
            .await
            .unwrap();
        let reloaded = manager(cache.clone())
            .get_certificate(&ClientHelloInfo::new("192.0.2.1"))
            .await
            .unwrap();

        assert_eq!(issued.cert, reloaded.cert);
    }

    #[tokio::test]
    async fn test_rejects_hosts_outside_policy() {
        let cache = Arc::new(MemoryCache::new());
        let result = manager(cache.clone())
            .get_certificate(&ClientHelloInfo::new("evil.example"))
            .await;

        assert!(matches!(result, Err(CertError::HostNotAllowed(_))));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .put(&cache_key("example.com"), b"garbage")
            .await
            .unwrap();

        let result = manager(cache)
            .get_certificate(&ClientHelloInfo::new("example.com"))
            .await;
        assert!(matches!(result, Err(CertError::InvalidCertificate(_))));
    }

    #[test]
    fn test_provider_builds_manager() {
        let settings = ManagerSettings {
            hosts: HostPolicy::whitelist(["example.com"]),
            cache: Arc::new(MemoryCache::new()),
            client: Default::default(),
        };
        let manager = SelfSignedProvider.build(settings).unwrap();
        assert!(manager.http_challenge_response("example.com", "token").is_none());
    }
}
