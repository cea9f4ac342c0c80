//! TLS-ALPN-01 relay.
//!
//! Forwards every TCP connection arriving on the TLS-ALPN port to the
//! production listener on loopback, so validation handshakes reach the
//! listener that owns the certificates. Bytes are relayed opaquely.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bind::try_bind_listener;
use crate::types::{BindPolicy, Result};

pub struct Relay {
    port: u16,
    target: SocketAddr,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Relay {
    /// Relay from `port` (all interfaces) to `target`
    pub fn new(port: u16, target: SocketAddr) -> Self {
        Self {
            port,
            target,
            running: Mutex::new(None),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Bind the relay port (retrying per `policy`) and start forwarding.
    ///
    /// Does nothing if the relay is already running.
    pub async fn start(&self, policy: &BindPolicy, scope: &watch::Receiver<bool>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let listener = try_bind_listener(self.port, policy, scope).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_relay(listener, self.target, shutdown_rx));

        info!(port = self.port, target = %self.target, "TLS-ALPN relay listening");
        *running = Some(Running {
            local_addr,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Close the relay listener. Connections already relaying drain on their own.
    ///
    /// Returns once the port is released; calling it again is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.task.await {
            warn!(port = self.port, "TLS-ALPN relay task failed: {}", e);
        }
        info!(port = self.port, "TLS-ALPN relay stopped");
    }

    /// Address of the relay listener while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

async fn run_relay(listener: TcpListener, target: SocketAddr, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (inbound, peer_addr) = match accept_result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Relay accept error: {}", e);
                        continue;
                    }
                };

                tokio::spawn(async move {
                    match relay_connection(inbound, target).await {
                        Ok((up, down)) => {
                            debug!("Relay {} -> {} closed: {}↑ {}↓", peer_addr, target, up, down);
                        }
                        Err(e) => {
                            debug!("Relay {} -> {} error: {}", peer_addr, target, e);
                        }
                    }
                });
            }

            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Copy bytes both ways until each side has finished.
///
/// When one direction reaches EOF its destination is shut down for writing,
/// which lets the peer finish the other direction.
async fn relay_connection(mut inbound: TcpStream, target: SocketAddr) -> std::io::Result<(u64, u64)> {
    let mut outbound = TcpStream::connect(target).await?;
    tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
}
