//! ACME-aware TLS listener
//!
//! [`listen`] binds a TLS listener whose certificates come from a
//! [`CertManager`] and keeps an ACME validation path reachable while it runs:
//! TLS-ALPN-01 in place when listening on 443, a byte relay from 443 to the
//! real port otherwise, or an HTTP-01 server on 80 when 443 is taken.

mod bind;
pub mod cache;
pub mod http01;
mod listener;
pub mod manager;
pub mod relay;
pub mod self_signed;
pub mod shutdown;
mod tls;
pub mod types;

pub use bind::{try_bind_listener, try_bind_port};
pub use cache::{CacheError, CertCache, DirCache, MemoryCache};
pub use http01::Http01Server;
pub use listener::{listen, listen_with_shutdown, AcmeListener, Accepting, ChallengeKind};
pub use manager::{
    CertError, CertManager, CertProvider, ClientConfig, ClientHelloInfo, HostPolicy,
    ManagerSettings,
};
pub use relay::Relay;
pub use self_signed::{SelfSignedManager, SelfSignedProvider};
pub use tls::{certified_key_from_pem, KEEPALIVE_PERIOD};
pub use tokio_rustls::server::TlsStream;
pub use types::{BindPolicy, ChallengePorts, Config, Error, Network, Result};
