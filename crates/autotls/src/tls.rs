use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use socket2::{SockRef, TcpKeepalive};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::manager::{CertError, CertManager, ClientHelloInfo, ACME_TLS_ALPN_PROTOCOL};
use crate::types::{Error, Result};

/// Keep-alive idle time applied to accepted connections
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Server-side TLS setup shared by every connection of one listener
pub(crate) struct TlsContext {
    manager: Arc<dyn CertManager>,
    alpn_protocols: Vec<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl TlsContext {
    pub(crate) fn new(manager: Arc<dyn CertManager>, mut alpn_protocols: Vec<Vec<u8>>) -> Self {
        if !alpn_protocols
            .iter()
            .any(|p| p.as_slice() == ACME_TLS_ALPN_PROTOCOL)
        {
            alpn_protocols.push(ACME_TLS_ALPN_PROTOCOL.to_vec());
        }
        Self {
            manager,
            alpn_protocols,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub(crate) fn manager(&self) -> &Arc<dyn CertManager> {
        &self.manager
    }

    /// Run the server handshake on `stream`.
    ///
    /// The certificate comes from the manager once the ClientHello is read.
    /// TLS-ALPN-01 validation handshakes are completed, shut down and reported
    /// as [`Error::ChallengeServed`].
    pub(crate) async fn accept(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let local_ip = stream.local_addr().ok().map(|addr| addr.ip().to_canonical());

        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(Error::Handshake)?;
        let hello = hello_info(&start.client_hello(), local_ip)?;

        let key = match self.manager.get_certificate(&hello).await {
            Ok(key) => key,
            Err(e @ CertError::HostNotAllowed(_)) => {
                warn!(server_name = %hello.server_name, "Rejected handshake: {}", e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let config = self.server_config(key, hello.is_alpn_challenge())?;

        let mut tls = start.into_stream(config).await.map_err(Error::Handshake)?;

        if tls.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_PROTOCOL) {
            debug!(server_name = %hello.server_name, "Completed TLS-ALPN-01 validation handshake");
            let _ = tls.shutdown().await;
            return Err(Error::ChallengeServed);
        }

        Ok(tls)
    }

    fn server_config(&self, key: Arc<CertifiedKey>, challenge: bool) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ResolvedCert(key)));

        config.alpn_protocols = if challenge {
            vec![ACME_TLS_ALPN_PROTOCOL.to_vec()]
        } else {
            self.alpn_protocols.clone()
        };

        Ok(Arc::new(config))
    }
}

fn hello_info(
    hello: &ClientHello<'_>,
    local_ip: Option<IpAddr>,
) -> std::result::Result<ClientHelloInfo, CertError> {
    let server_name = match (hello.server_name(), local_ip) {
        (Some(name), _) => name.to_string(),
        // IP certificates: clients do not send SNI for address literals
        (None, Some(ip)) => ip.to_string(),
        (None, None) => return Err(CertError::MissingServerName),
    };

    let alpn_protocols = hello
        .alpn()
        .map(|protos| protos.map(|p| p.to_vec()).collect())
        .unwrap_or_default();

    Ok(ClientHelloInfo {
        server_name,
        alpn_protocols,
    })
}

/// Resolver handing out the certificate already chosen for this connection
#[derive(Debug)]
struct ResolvedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Turn on TCP keep-alive with [`KEEPALIVE_PERIOD`], as HTTP servers
/// conventionally do for accepted connections
pub(crate) fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD))
}

/// Parse a PEM bundle holding a certificate chain and its private key
pub fn certified_key_from_pem(pem: &[u8]) -> std::result::Result<CertifiedKey, CertError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCertificate(format!("Failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(CertError::InvalidCertificate(
            "No certificates found in PEM".into(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CertError::InvalidCertificate(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| CertError::InvalidCertificate("No private key found in PEM".into()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::InvalidCertificate(format!("Failed to parse signing key: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::manager::HostPolicy;
    use crate::self_signed::SelfSignedManager;
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsConnector;

    async fn context(hosts: &[&str]) -> (TlsContext, Arc<CertifiedKey>) {
        let manager = Arc::new(SelfSignedManager::new(
            HostPolicy::whitelist(hosts),
            Arc::new(MemoryCache::new()),
        ));
        let key = manager
            .get_certificate(&ClientHelloInfo::new(hosts[0]))
            .await
            .unwrap();
        let ctx = TlsContext::new(manager, vec![b"http/1.1".to_vec()]);
        (ctx, key)
    }

    fn connector(trusted: &CertifiedKey, alpn: &[&[u8]]) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(trusted.cert[0].clone()).unwrap();

        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        TlsConnector::from(Arc::new(config))
    }

    async fn pair() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_acme_alpn_always_offered() {
        let manager = Arc::new(SelfSignedManager::new(
            HostPolicy::whitelist(["example.com"]),
            Arc::new(MemoryCache::new()),
        ));
        let ctx = TlsContext::new(manager.clone(), vec![b"h2".to_vec()]);
        assert_eq!(
            ctx.alpn_protocols,
            vec![b"h2".to_vec(), ACME_TLS_ALPN_PROTOCOL.to_vec()]
        );

        let ctx = TlsContext::new(manager, vec![ACME_TLS_ALPN_PROTOCOL.to_vec()]);
        assert_eq!(ctx.alpn_protocols.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake_with_manager_certificate() {
        let (ctx, key) = context(&["example.com"]).await;
        let (listener, addr) = pair().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = ctx.accept(stream).await.unwrap();
            assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));
            tls.write_all(b"hello").await.unwrap();
            tls.shutdown().await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut tls = connector(&key, &[b"http/1.1"])
            .connect(ServerName::try_from("example.com").unwrap(), stream)
            .await
            .unwrap();

        let mut buf = Vec::new();
        tls.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_host() {
        let (ctx, key) = context(&["example.com"]).await;
        let (listener, addr) = pair().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            ctx.accept(stream).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = connector(&key, &[])
            .connect(ServerName::try_from("other.example").unwrap(), stream)
            .await;
        assert!(client.is_err());

        let result = server.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::Certificate(CertError::HostNotAllowed(h))) if h == "other.example"
        ));
    }

    #[tokio::test]
    async fn test_alpn_challenge_handshake_is_consumed() {
        let (ctx, key) = context(&["example.com"]).await;
        let (listener, addr) = pair().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            ctx.accept(stream).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut tls = connector(&key, &[ACME_TLS_ALPN_PROTOCOL])
            .connect(ServerName::try_from("example.com").unwrap(), stream)
            .await
            .unwrap();
        assert_eq!(tls.get_ref().1.alpn_protocol(), Some(ACME_TLS_ALPN_PROTOCOL));

        // the server hangs up once validation is done
        let mut buf = Vec::new();
        let _ = tls.read_to_end(&mut buf).await;
        assert!(buf.is_empty());

        assert!(matches!(server.await.unwrap(), Err(Error::ChallengeServed)));
    }

    #[tokio::test]
    async fn test_set_keepalive() {
        let (listener, addr) = pair().await;
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        set_keepalive(&server).unwrap();
        let sock = SockRef::from(&server);
        assert!(sock.keepalive().unwrap());
        #[cfg(target_os = "linux")]
        assert_eq!(sock.keepalive_time().unwrap(), KEEPALIVE_PERIOD);
        drop(client);
    }

    #[test]
    fn test_certified_key_from_pem_rejects_garbage() {
        assert!(matches!(
            certified_key_from_pem(b"not a pem"),
            Err(CertError::InvalidCertificate(_))
        ));

        let generated = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        // certificate without its key
        assert!(matches!(
            certified_key_from_pem(generated.cert.pem().as_bytes()),
            Err(CertError::InvalidCertificate(msg)) if msg.contains("private key")
        ));

        let bundle = format!("{}{}", generated.cert.pem(), generated.key_pair.serialize_pem());
        let key = certified_key_from_pem(bundle.as_bytes()).unwrap();
        assert_eq!(key.cert.len(), 1);
    }
}
