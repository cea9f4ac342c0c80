//! ACME-aware TLS listener.
//!
//! Owns the production socket and keeps one challenge path reachable for the
//! certificate manager: validation in place on 443, a relay from 443 to the
//! production port, or an HTTP-01 server on 80.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

use crate::bind::{bind_addr, bind_wildcard, jitter, try_bind_port};
use crate::cache::{CertCache, DirCache};
use crate::http01::{Http01Server, SHUTDOWN_TIMEOUT};
use crate::manager::{CertManager, CertProvider, ClientHelloInfo, HostPolicy, ManagerSettings};
use crate::relay::Relay;
use crate::shutdown;
use crate::tls::{set_keepalive, TlsContext};
use crate::types::{Config, Error, ListenAddr, Network, Result, DEFAULT_CACHE_DIR};

/// Which challenge path a listener keeps open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// The listener itself is on the TLS-ALPN port
    InPlace,
    /// TLS-ALPN port relayed to the listener
    Relay,
    /// HTTP-01 server on the HTTP port
    Http01,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InPlace => "in-place",
            Self::Relay => "relay",
            Self::Http01 => "http-01",
        })
    }
}

enum Challenge {
    InPlace,
    Relay(Relay),
    Http01(Http01Server),
}

impl Challenge {
    fn kind(&self) -> ChallengeKind {
        match self {
            Self::InPlace => ChallengeKind::InPlace,
            Self::Relay(_) => ChallengeKind::Relay,
            Self::Http01(_) => ChallengeKind::Http01,
        }
    }

    async fn stop(&self) {
        match self {
            Self::InPlace => {}
            Self::Relay(relay) => relay.stop().await,
            Self::Http01(server) => server.stop(SHUTDOWN_TIMEOUT).await,
        }
    }
}

/// Listen for TLS connections whose certificates come from `provider`.
///
/// `network` is `tcp`, `tcp4` or `tcp6`; `address` is `host:port`, `:port`
/// or `[v6]:port`.
pub async fn listen(
    network: &str,
    address: &str,
    config: Config,
    provider: &dyn CertProvider,
) -> Result<AcmeListener> {
    listen_with_shutdown(network, address, config, provider, shutdown::never()).await
}

/// Like [`listen`], with `scope` bounding construction.
///
/// Firing `scope` while a challenge port is being retried aborts with
/// [`Error::Cancelled`]. Once constructed the listener lives until
/// [`AcmeListener::close`] or drop.
pub async fn listen_with_shutdown(
    network: &str,
    address: &str,
    config: Config,
    provider: &dyn CertProvider,
    scope: watch::Receiver<bool>,
) -> Result<AcmeListener> {
    let network: Network = network.parse()?;
    let requested = ListenAddr::parse(address)?;
    let allow_list = config.allow_list();
    if allow_list.is_empty() {
        return Err(Error::EmptyAllowList);
    }
    if shutdown::is_cancelled(&scope) {
        return Err(Error::Cancelled);
    }

    let listener = TcpListener::from_std(bind_production(network, &requested).await?)?;
    let local_addr = listener.local_addr()?;

    let cache: Arc<dyn CertCache> = match &config.cache {
        Some(cache) => cache.clone(),
        None => Arc::new(DirCache::new(DEFAULT_CACHE_DIR)),
    };
    let hosts = HostPolicy::whitelist(&allow_list);
    let manager = provider.build(ManagerSettings {
        hosts: hosts.clone(),
        cache,
        client: config.client.clone().unwrap_or_default(),
    })?;

    let challenge = select_challenge(network, requested.port, local_addr, &config, &manager, &scope).await?;
    info!(
        %local_addr,
        challenge = %challenge.kind(),
        hosts = ?hosts.hosts(),
        "ACME listener ready"
    );

    let tls = Arc::new(TlsContext::new(manager, config.alpn_protocols.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let provision_task = tokio::spawn(provision_loop(
        tls.manager().clone(),
        hosts.hosts().to_vec(),
        config.provision_interval,
        shutdown_rx,
    ));

    Ok(AcmeListener {
        listener: Mutex::new(Some(Arc::new(listener))),
        local_addr,
        tls,
        challenge,
        shutdown_tx,
        provision_task: Mutex::new(Some(provision_task)),
    })
}

/// Bind the production socket for `addr` on `network`
async fn bind_production(network: Network, addr: &ListenAddr) -> Result<std::net::TcpListener> {
    let Some(host) = addr.host.as_deref() else {
        return Ok(bind_wildcard(addr.port, network)?);
    };

    let candidates: Vec<SocketAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, addr.port)],
        Err(_) => tokio::net::lookup_host((host, addr.port)).await?.collect(),
    };

    let mut last_err = None;
    for candidate in candidates.into_iter().filter(|a| network.accepts(&a.ip())) {
        match bind_addr(candidate, candidate.is_ipv6()) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(%candidate, error = %e, "Bind failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => e.into(),
        None => Error::InvalidAddress(format!("{host}:{} ({network})", addr.port)),
    })
}

async fn select_challenge(
    network: Network,
    requested_port: u16,
    local_addr: SocketAddr,
    config: &Config,
    manager: &Arc<dyn CertManager>,
    scope: &watch::Receiver<bool>,
) -> Result<Challenge> {
    let ports = config.ports;
    let policy = &config.bind_policy;

    if requested_port == ports.tls_alpn {
        return Ok(Challenge::InPlace);
    }

    match try_bind_port(ports.tls_alpn, policy, scope).await {
        Ok(()) => {
            let relay = Relay::new(ports.tls_alpn, relay_target(network, local_addr));
            match relay.start(policy, scope).await {
                Ok(()) => return Ok(Challenge::Relay(relay)),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(port = ports.tls_alpn, "TLS-ALPN relay failed to start: {}", e),
            }
        }
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => debug!(port = ports.tls_alpn, "TLS-ALPN port unavailable: {}", e),
    }

    match try_bind_port(ports.http, policy, scope).await {
        Ok(()) => {
            let server = Http01Server::new(ports.http, manager.clone());
            match server.start(policy, scope).await {
                Ok(()) => return Ok(Challenge::Http01(server)),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(port = ports.http, "HTTP-01 server failed to start: {}", e),
            }
        }
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => debug!(port = ports.http, "HTTP port unavailable: {}", e),
    }

    Err(Error::NoChallengePort {
        tls_alpn: ports.tls_alpn,
        http: ports.http,
    })
}

/// Where relayed connections should land to reach a listener bound on `bound`
fn relay_target(network: Network, bound: SocketAddr) -> SocketAddr {
    let ip = bound.ip().to_canonical();
    let ip = if ip.is_unspecified() {
        network.loopback(bound.ip())
    } else {
        ip
    };
    SocketAddr::new(ip, bound.port())
}

/// Request a certificate for every host, then pause up to `interval`, until
/// `shutdown_rx` fires
async fn provision_loop(
    manager: Arc<dyn CertManager>,
    hosts: Vec<String>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = provision_all(manager.as_ref(), &hosts) => {}
            _ = shutdown::cancelled(&mut shutdown_rx) => break,
        }

        let wait = jitter(Duration::ZERO, interval);
        debug!(wait_secs = wait.as_secs(), "Next certificate pre-provisioning sweep scheduled");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown::cancelled(&mut shutdown_rx) => break,
        }
    }
    debug!("Certificate pre-provisioning stopped");
}

async fn provision_all(manager: &dyn CertManager, hosts: &[String]) {
    for host in hosts {
        match manager.get_certificate(&ClientHelloInfo::new(host.as_str())).await {
            Ok(_) => debug!(host = %host, "Certificate ready"),
            Err(e) => warn!(host = %host, "Failed to provision certificate: {}", e),
        }
    }
}

/// TLS listener with automatic certificates.
///
/// Dropping it has the same effect as [`close`](Self::close) without waiting
/// for the background tasks.
pub struct AcmeListener {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    tls: Arc<TlsContext>,
    challenge: Challenge,
    shutdown_tx: watch::Sender<bool>,
    provision_task: Mutex<Option<JoinHandle<()>>>,
}

impl AcmeListener {
    /// Wait for the next connection.
    ///
    /// The TCP stream already has keep-alive enabled; the TLS handshake runs
    /// in [`Accepting::handshake`]. Returns [`Error::Closed`] once the listener
    /// is closed, including for calls pending at that moment.
    pub async fn accept(&self) -> Result<Accepting> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if shutdown::is_cancelled(&shutdown_rx) {
            return Err(Error::Closed);
        }
        let Some(listener) = self.listener.lock().await.clone() else {
            return Err(Error::Closed);
        };

        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown::cancelled(&mut shutdown_rx) => return Err(Error::Closed),
        };

        if let Err(e) = set_keepalive(&stream) {
            debug!(%remote_addr, "Failed to enable keep-alive: {}", e);
        }

        Ok(Accepting {
            stream,
            remote_addr,
            tls: self.tls.clone(),
        })
    }

    /// Stop the challenge path and pre-provisioning, then release the socket.
    ///
    /// Closing an already closed listener is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }

        self.challenge.stop().await;
        self.listener.lock().await.take();
        let provision_task = self.provision_task.lock().await.take();
        if let Some(task) = provision_task {
            if let Err(e) = task.await {
                warn!("Pre-provisioning task failed: {}", e);
            }
        }

        info!(local_addr = %self.local_addr, "ACME listener closed");
        Ok(())
    }

    /// Address of the production socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Challenge path chosen at construction
    pub fn challenge(&self) -> ChallengeKind {
        self.challenge.kind()
    }
}

impl Drop for AcmeListener {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl fmt::Debug for AcmeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeListener")
            .field("local_addr", &self.local_addr)
            .field("challenge", &self.challenge.kind())
            .finish()
    }
}

/// An accepted connection waiting for its TLS handshake
pub struct Accepting {
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Arc<TlsContext>,
}

impl Accepting {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Run the TLS handshake.
    ///
    /// TLS-ALPN-01 validation connections end here with
    /// [`Error::ChallengeServed`]; callers just drop them.
    pub async fn handshake(self) -> Result<TlsStream<TcpStream>> {
        self.tls.accept(self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_relay_target() {
        let v4 = SocketAddr::from((Ipv4Addr::LOCALHOST, 4000));
        assert_eq!(relay_target(Network::Tcp, v4), v4);

        let lan = SocketAddr::from(([192, 0, 2, 10], 4000));
        assert_eq!(relay_target(Network::Tcp4, lan), lan);

        let any6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, 4000));
        assert_eq!(
            relay_target(Network::Tcp, any6),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 4000))
        );
        assert_eq!(
            relay_target(Network::Tcp6, any6),
            SocketAddr::from((Ipv6Addr::LOCALHOST, 4000))
        );

        let mapped = SocketAddr::from((Ipv4Addr::LOCALHOST.to_ipv6_mapped(), 4000));
        assert_eq!(relay_target(Network::Tcp, mapped), v4);
    }

    #[tokio::test]
    async fn test_bind_production_checks_family() {
        let addr = ListenAddr::parse("[::1]:0").unwrap();
        let result = bind_production(Network::Tcp4, &addr).await;
        assert!(matches!(result, Err(Error::InvalidAddress(_))));

        let addr = ListenAddr::parse("127.0.0.1:0").unwrap();
        let listener = bind_production(Network::Tcp4, &addr).await.unwrap();
        assert!(listener.local_addr().unwrap().is_ipv4());
    }

    #[test]
    fn test_challenge_kind_display() {
        assert_eq!(ChallengeKind::InPlace.to_string(), "in-place");
        assert_eq!(ChallengeKind::Relay.to_string(), "relay");
        assert_eq!(ChallengeKind::Http01.to_string(), "http-01");
    }
}
