//! HTTP-01 challenge server.
//!
//! Serves `/.well-known/acme-challenge/<token>` from the certificate manager
//! and redirects everything else to HTTPS.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::bind::try_bind_listener;
use crate::manager::{CertManager, ACME_CHALLENGE_PREFIX};
use crate::types::{BindPolicy, Result};

/// Deadline used by the listener when it stops the server
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a client gets to send its request headers
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Http01Server {
    port: u16,
    manager: Arc<dyn CertManager>,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    /// `Some(deadline)` asks the server to stop
    shutdown_tx: watch::Sender<Option<Duration>>,
    task: JoinHandle<()>,
}

impl Http01Server {
    pub fn new(port: u16, manager: Arc<dyn CertManager>) -> Self {
        Self {
            port,
            manager,
            running: Mutex::new(None),
        }
    }

    /// Bind the HTTP port (retrying per `policy`) and serve in the background.
    ///
    /// Returns as soon as the socket is bound. Does nothing if already running.
    pub async fn start(&self, policy: &BindPolicy, scope: &watch::Receiver<bool>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let listener = try_bind_listener(self.port, policy, scope).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let task = tokio::spawn(serve(listener, self.manager.clone(), shutdown_rx));

        info!(port = self.port, "HTTP-01 challenge server listening");
        *running = Some(Running {
            local_addr,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop accepting, then let in-flight requests finish for up to `deadline`.
    ///
    /// Connections still open after the deadline are aborted, so none survive
    /// the call. Calling it again is a no-op.
    pub async fn stop(&self, deadline: Duration) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(Some(deadline));
        if let Err(e) = running.task.await {
            warn!(port = self.port, "HTTP-01 server task failed: {}", e);
        }
        info!(port = self.port, "HTTP-01 challenge server stopped");
    }

    /// Address of the server while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

async fn serve(
    listener: TcpListener,
    manager: Arc<dyn CertManager>,
    mut shutdown_rx: watch::Receiver<Option<Duration>>,
) {
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    let deadline = loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, remote_addr) = match accept_result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("HTTP-01 accept error: {}", e);
                        continue;
                    }
                };

                let manager = manager.clone();
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let manager = manager.clone();
                    async move { Ok::<_, Infallible>(challenge_response(manager.as_ref(), &req)) }
                });

                let conn = graceful.watch(
                    http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(HEADER_READ_TIMEOUT)
                        .serve_connection(TokioIo::new(stream), service),
                );
                connections.spawn(async move {
                    if let Err(e) = conn.await {
                        let msg = e.to_string();
                        if !msg.contains("connection closed") && !msg.contains("not connected") {
                            debug!("HTTP-01 connection error from {}: {}", remote_addr, e);
                        }
                    }
                });
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            changed = shutdown_rx.changed() => {
                // a dropped sender means the owner is gone: no grace period
                break match changed {
                    Ok(()) => shutdown_rx.borrow().unwrap_or(SHUTDOWN_TIMEOUT),
                    Err(_) => Duration::ZERO,
                };
            }
        }
    };

    drop(listener);
    if tokio::time::timeout(deadline, graceful.shutdown()).await.is_err() {
        warn!(
            ?deadline,
            open = connections.len(),
            "Aborting HTTP-01 connections still open after shutdown deadline"
        );
    }
    connections.shutdown().await;
}

/// Response of the challenge handler for `req`
pub fn challenge_response<B>(manager: &dyn CertManager, req: &Request<B>) -> Response<Full<Bytes>> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .map(strip_port)
        .unwrap_or("");

    if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        let name = host.trim_start_matches('[').trim_end_matches(']');
        return match manager.http_challenge_response(name, token) {
            Some(key_auth) => {
                debug!(host = name, token, "Served HTTP-01 challenge");
                text(StatusCode::OK, key_auth)
            }
            None => {
                debug!(host = name, token, "Unknown HTTP-01 challenge token");
                text(StatusCode::NOT_FOUND, "Not Found".to_string())
            }
        };
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text(StatusCode::BAD_REQUEST, "Use HTTPS".to_string());
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    match HeaderValue::try_from(format!("https://{}{}", host, path)) {
        Ok(location) if !host.is_empty() => {
            let mut resp = text(StatusCode::MOVED_PERMANENTLY, String::new());
            resp.headers_mut().insert(LOCATION, location);
            resp
        }
        _ => text(StatusCode::BAD_REQUEST, "Use HTTPS".to_string()),
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// `example.com:80` -> `example.com`, `[::1]:80` -> `[::1]`
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (name.ends_with(']') || !name.contains(':')) =>
        {
            name
        }
        _ => host,
    }
}
