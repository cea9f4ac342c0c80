//! Port binding with bounded, jittered, cancellable retry.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::debug;

use crate::shutdown;
use crate::types::{BindPolicy, Error, Network, Result};

/// Check that `port` can be bound on all interfaces.
///
/// The probe socket is closed right away. Retries follow `policy`; firing
/// `scope` during a wait aborts with [`Error::Cancelled`].
pub async fn try_bind_port(
    port: u16,
    policy: &BindPolicy,
    scope: &watch::Receiver<bool>,
) -> Result<()> {
    let listener = retry_bind(port, policy, scope).await?;
    drop(listener);
    Ok(())
}

/// Bind `port` on all interfaces and keep the listener.
///
/// Same retry and cancellation behavior as [`try_bind_port`].
pub async fn try_bind_listener(
    port: u16,
    policy: &BindPolicy,
    scope: &watch::Receiver<bool>,
) -> Result<TcpListener> {
    retry_bind(port, policy, scope).await
}

async fn retry_bind(
    port: u16,
    policy: &BindPolicy,
    scope: &watch::Receiver<bool>,
) -> Result<TcpListener> {
    let attempts = policy.attempts.max(1);
    let mut scope = scope.clone();
    let mut attempt = 1;

    loop {
        let err = match bind_wildcard(port, Network::Tcp).and_then(TcpListener::from_std) {
            Ok(listener) => return Ok(listener),
            Err(e) => e,
        };
        if attempt >= attempts {
            return Err(Error::Bind {
                port,
                attempts,
                source: err,
            });
        }

        let wait = jitter(policy.min_backoff, policy.max_backoff);
        debug!(
            port,
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "Bind failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown::cancelled(&mut scope) => return Err(Error::Cancelled),
        }
        attempt += 1;
    }
}

/// Uniformly random duration in `[min, max]`, millisecond granularity
pub(crate) fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

/// Bind the wildcard address for `network`.
///
/// `Network::Tcp` prefers a dual-stack IPv6 socket and falls back to
/// `0.0.0.0` when the host has no IPv6.
pub(crate) fn bind_wildcard(port: u16, network: Network) -> io::Result<std::net::TcpListener> {
    let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));

    match network {
        Network::Tcp4 => bind_addr(v4, false),
        Network::Tcp6 => bind_addr(v6, true),
        Network::Tcp => match bind_addr(v6, false) {
            Err(e)
                if e.kind() != io::ErrorKind::AddrInUse
                    && e.kind() != io::ErrorKind::PermissionDenied =>
            {
                debug!(port, error = %e, "IPv6 wildcard unavailable, using 0.0.0.0");
                bind_addr(v4, false)
            }
            other => other,
        },
    }
}

/// Bind a non-blocking listening socket on `addr`
pub(crate) fn bind_addr(addr: SocketAddr, v6_only: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(v6_only)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn occupy() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn fast_policy() -> BindPolicy {
        BindPolicy {
            attempts: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(5);
        for _ in 0..200 {
            let wait = jitter(min, max);
            assert!(wait >= min && wait <= max, "{wait:?} out of range");
        }
        assert_eq!(jitter(max, min), max);
    }

    #[tokio::test]
    async fn test_try_bind_listener_free_port() {
        let (probe, port) = occupy();
        drop(probe);

        let listener = try_bind_listener(port, &fast_policy(), &shutdown::never())
            .await
            .unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_try_bind_port_releases_socket() {
        let (probe, port) = occupy();
        drop(probe);

        try_bind_port(port, &fast_policy(), &shutdown::never())
            .await
            .unwrap();
        // the probe must not keep the port
        let again = bind_wildcard(port, Network::Tcp);
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_try_bind_port_exhausts_attempts() {
        let (_held, port) = occupy();

        let start = Instant::now();
        let err = try_bind_port(port, &fast_policy(), &shutdown::never())
            .await
            .unwrap_err();

        match err {
            Error::Bind {
                port: p, attempts, ..
            } => {
                assert_eq!(p, port);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        // two waits of at least 100ms each
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_default_policy_waits_minimum_backoff() {
        let (_held, port) = occupy();

        let start = Instant::now();
        let result = try_bind_port(port, &BindPolicy::default(), &shutdown::never()).await;

        assert!(matches!(result, Err(Error::Bind { .. })));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let (_held, port) = occupy();
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        let result = try_bind_listener(port, &BindPolicy::default(), &rx).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        // the shortest default wait is one second
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
