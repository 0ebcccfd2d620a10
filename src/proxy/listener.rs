use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::AppContext;
use super::handler::handle_client;

/// Owns the bound socket. Dropping a `Listener` without serving closes the socket.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    app: AppContext,
}

/// A listener serving on a background task.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl Listener {
    pub async fn bind(app: AppContext) -> Result<Self> {
        let bind_addr = app.settings.listen;
        let inner = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", bind_addr))?;
        let local_addr = inner.local_addr().unwrap_or(bind_addr);
        Ok(Self {
            inner,
            local_addr,
            app,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts until `stop` turns true or its sender is dropped. In-flight
    /// connections keep running on their own tasks.
    pub async fn serve(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!(address = %self.local_addr, "proxy listener started");
        loop {
            if *stop.borrow() {
                break;
            }
            let accepted = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                accepted = self.inner.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            };
            debug!(peer = %peer_addr, "accepted connection");
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
            }
            let connection_app = self.app.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_client(stream, peer_addr, connection_app).await {
                    debug!(peer = %peer_addr, error = %err, "connection closed with error");
                }
            });
        }
        info!(address = %self.local_addr, "proxy listener stopped");
        Ok(())
    }

    pub fn spawn(self) -> ListenerHandle {
        let local_addr = self.local_addr;
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.serve(stop_rx));
        ListenerHandle {
            local_addr,
            stop,
            task,
        }
    }
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for the accept loop to exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.task.await.context("listener task panicked")?
    }
}
