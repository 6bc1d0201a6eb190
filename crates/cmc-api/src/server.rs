//! ---
//! cmc_section: "05-networking-external-interfaces"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "TLS listener lifecycle for the coordinator APIs."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::{from_tcp_rustls, RustlsConfig};
use axum_server::Handle;
use cmc_core::EventNotifier;
use rustls::ServerConfig;
use tokio::sync::watch;
use tracing::{error, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound TLS listener that has not started serving yet.
#[derive(Debug)]
pub struct TlsServer {
    listener: StdTcpListener,
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
}

impl TlsServer {
    pub fn bind(addr: SocketAddr, tls: Arc<ServerConfig>) -> Result<Self> {
        let listener = StdTcpListener::bind(addr)
            .with_context(|| format!("failed to bind listener {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to configure listener as non-blocking")?;
        let addr = listener
            .local_addr()
            .context("failed to read listener address")?;
        Ok(Self { listener, addr, tls })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve `router` until `shutdown` resolves, then drain open connections.
    pub async fn serve<S>(self, router: Router, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr;
        let handle = Handle::new();
        let drain = handle.clone();
        tokio::spawn(async move {
            shutdown.await;
            drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
        });
        info!(address = %addr, "tls api server listening");
        from_tcp_rustls(self.listener, RustlsConfig::from_config(self.tls))
            .handle(handle)
            .serve(router.into_make_service())
            .await
            .map_err(|err| {
                error!(address = %addr, error = %err, "tls api server exited with error");
                anyhow::Error::new(err).context(format!("api server on {addr} failed"))
            })
    }
}

/// Bind, report the bound address to the supervisor and serve until shutdown is signalled.
pub async fn run_server(
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
    router: Router,
    notifier: EventNotifier,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let server = TlsServer::bind(addr, tls)
        .with_context(|| format!("{} could not start", notifier.name()))?;
    notifier.started(server.local_addr()).await;
    server
        .serve(router, async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
