use anyhow::{anyhow, bail, Context};
use autotls::{AcmeListener, ClientConfig, Config, Error, SelfSignedProvider};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Command line flags
#[derive(Debug)]
struct Args {
    domain: Option<String>,
    ip: Option<String>,
    listen: String,
    staging: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            domain: None,
            ip: None,
            listen: ":4000".to_string(),
            staging: false,
        }
    }
}

fn usage() -> &'static str {
    "usage: autotls-hello [-domain NAME] [-ip ADDR] [-l ADDR] [-t]\n\
     \x20 -domain  set domain for certificate\n\
     \x20 -ip      set ip address for certificate\n\
     \x20 -l       set https server address (default \":4000\")\n\
     \x20 -t       use the staging ACME directory (ignored: certificates here are self-signed)"
}

fn parse_args(argv: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut argv = argv.into_iter();

    while let Some(arg) = argv.next() {
        let flag = arg.trim_start_matches('-');
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (flag, None),
        };

        match name {
            "domain" | "ip" | "l" => {
                let value = match inline {
                    Some(value) => value,
                    None => argv
                        .next()
                        .ok_or_else(|| anyhow!("flag needs an argument: -{name}"))?,
                };
                match name {
                    "domain" => args.domain = Some(value),
                    "ip" => args.ip = Some(value),
                    _ => args.listen = value,
                }
            }
            "t" => args.staging = inline.is_none_or(|v| v != "false"),
            "h" | "help" => bail!("{}", usage()),
            _ => bail!("flag provided but not defined: {arg}\n{}", usage()),
        }
    }

    Ok(args)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,autotls=debug".parse().unwrap()),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    if let Err(e) = run().await {
        println!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let mut config = Config {
        alpn_protocols: vec![b"http/1.1".to_vec()],
        ..Config::default()
    };
    if let Some(domain) = args.domain {
        config.domains.push(domain);
    }
    if let Some(ip) = args.ip {
        let ip = ip
            .parse::<IpAddr>()
            .with_context(|| format!("invalid ip address {ip:?}"))?;
        config.ip_addrs.push(ip);
    }
    if args.staging {
        // only an ACME provider reads the directory
        info!("Staging directory requested; the self-signed provider ignores it");
        config.client = Some(ClientConfig::staging());
    }

    let listener = Arc::new(autotls::listen("tcp", &args.listen, config, &SelfSignedProvider).await?);
    println!("bind listener successfully");

    let server = tokio::spawn(serve(listener.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    listener.close().await?;
    server.await?;
    Ok(())
}

async fn serve(listener: Arc<AcmeListener>) {
    loop {
        let accepting = match listener.accept().await {
            Ok(accepting) => accepting,
            Err(Error::Closed) => break,
            Err(e) => {
                warn!("Accept error: {}", e);
                continue;
            }
        };

        tokio::spawn(async move {
            let remote_addr = accepting.remote_addr();
            let tls = match accepting.handshake().await {
                Ok(tls) => tls,
                Err(Error::ChallengeServed) => return,
                Err(e) => {
                    debug!("TLS handshake failed from {}: {}", remote_addr, e);
                    return;
                }
            };

            let service = service_fn(move |_req: Request<Incoming>| async move {
                info!("{}", remote_addr);
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"Hello ACME!"))))
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!("Connection error from {}: {}", remote_addr, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Args> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.listen, ":4000");
        assert!(args.domain.is_none());
        assert!(args.ip.is_none());
        assert!(!args.staging);
    }

    #[test]
    fn test_flags() {
        let args = parse(&["-domain", "example.com", "--ip=192.0.2.1", "-l", ":8443", "-t"]).unwrap();
        assert_eq!(args.domain.as_deref(), Some("example.com"));
        assert_eq!(args.ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(args.listen, ":8443");
        assert!(args.staging);

        assert!(!parse(&["-t=false"]).unwrap().staging);
    }

    #[test]
    fn test_usage_notes_staging_is_ignored() {
        let err = parse(&["-h"]).unwrap_err().to_string();
        let staging = err.lines().find(|l| l.trim_start().starts_with("-t")).unwrap();
        assert!(staging.contains("ignored"), "{staging}");
    }

    #[test]
    fn test_bad_flags() {
        assert!(parse(&["-domain"]).is_err());
        assert!(parse(&["-verbose"]).is_err());
    }
}
