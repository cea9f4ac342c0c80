use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cache::CertCache;
use crate::manager::{CertError, ClientConfig};

/// Directory used for the certificate cache when `Config::cache` is `None`.
///
/// The directory is relative to the working directory and is only created on
/// the first cache write.
pub const DEFAULT_CACHE_DIR: &str = "certs";

/// Default TLS-ALPN-01 port
pub const DEFAULT_TLS_ALPN_PORT: u16 = 443;

/// Default HTTP-01 port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default upper bound of the jittered pause between pre-provisioning sweeps
pub const DEFAULT_PROVISION_INTERVAL: Duration = Duration::from_secs(300);

/// Configuration for an ACME-aware listener
#[derive(Clone)]
pub struct Config {
    /// Domain names allowed in SNI, in order
    pub domains: Vec<String>,
    /// Literal IP addresses allowed as certificate subjects, in order
    pub ip_addrs: Vec<IpAddr>,
    /// Persistent certificate store handed to the manager.
    /// `None` means `DirCache::new(DEFAULT_CACHE_DIR)`.
    pub cache: Option<Arc<dyn CertCache>>,
    /// ACME endpoint override (e.g. the staging directory)
    pub client: Option<ClientConfig>,
    /// Application protocols advertised by the production listener.
    /// `acme-tls/1` is always appended.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Ports used for the challenge paths
    pub ports: ChallengePorts,
    /// Retry policy for binding challenge ports
    pub bind_policy: BindPolicy,
    /// Upper bound of the random pause between pre-provisioning sweeps
    pub provision_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            ip_addrs: Vec::new(),
            cache: None,
            client: None,
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            ports: ChallengePorts::default(),
            bind_policy: BindPolicy::default(),
            provision_interval: DEFAULT_PROVISION_INTERVAL,
        }
    }
}

impl Config {
    /// Config allowing the given domains, everything else default
    pub fn with_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Domains followed by IP addresses: the SNI allow-list
    pub fn allow_list(&self) -> Vec<String> {
        self.domains
            .iter()
            .cloned()
            .chain(self.ip_addrs.iter().map(|ip| ip.to_string()))
            .collect()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("domains", &self.domains)
            .field("ip_addrs", &self.ip_addrs)
            .field("cache", &self.cache.as_ref().map(|_| "custom"))
            .field("client", &self.client)
            .field("ports", &self.ports)
            .field("bind_policy", &self.bind_policy)
            .field("provision_interval", &self.provision_interval)
            .finish()
    }
}

/// Ports the challenge paths live on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengePorts {
    /// TLS-ALPN-01 port (relay target when the listener is elsewhere)
    pub tls_alpn: u16,
    /// HTTP-01 port
    pub http: u16,
}

impl Default for ChallengePorts {
    fn default() -> Self {
        Self {
            tls_alpn: DEFAULT_TLS_ALPN_PORT,
            http: DEFAULT_HTTP_PORT,
        }
    }
}

/// Bounded, jittered retry policy used when binding challenge ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindPolicy {
    /// Total bind attempts
    pub attempts: u32,
    /// Shortest wait between attempts
    pub min_backoff: Duration,
    /// Longest wait between attempts
    pub max_backoff: Duration,
}

impl Default for BindPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Stream network of the production listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl Network {
    /// Whether an address of this family may be used on this network
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => ip.is_ipv4(),
            Self::Tcp6 => ip.is_ipv6(),
        }
    }

    /// Loopback address reaching a listener of this network bound on `bound`
    pub fn loopback(&self, bound: IpAddr) -> IpAddr {
        match self {
            Self::Tcp4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::Tcp6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
            Self::Tcp => match bound {
                IpAddr::V6(v6) if !v6.is_unspecified() && v6.to_ipv4_mapped().is_none() => {
                    IpAddr::V6(Ipv6Addr::LOCALHOST)
                }
                _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        })
    }
}

/// A `host:port` listen address split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    /// Host part; `None` for the wildcard (`:4000`)
    pub host: Option<String>,
    pub port: u16,
}

impl ListenAddr {
    /// Split `host:port`, `:port` or `[v6]:port`
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(address.to_string());

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let host = if let Some(inner) = host.strip_prefix('[') {
            inner.strip_suffix(']').ok_or_else(invalid)?
        } else if host.contains(':') {
            // unbracketed IPv6 literal
            return Err(invalid());
        } else {
            host
        };
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            host: (!host.is_empty()).then(|| host.to_string()),
            port,
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid listen address {0:?}: expected host:port")]
    InvalidAddress(String),

    #[error("unsupported network {0:?}: expected tcp, tcp4 or tcp6")]
    UnsupportedNetwork(String),

    #[error("must provide at least one domain or ip address")]
    EmptyAllowList,

    #[error("failed to bind port {port} after {attempts} attempts: {source}")]
    Bind {
        port: u16,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("no reachable port for ACME validation: ports {tls_alpn} and {http} are unavailable")]
    NoChallengePort { tls_alpn: u16, http: u16 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("listener closed")]
    Closed,

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("TLS-ALPN-01 challenge served")]
    ChallengeServed,

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
