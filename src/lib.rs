pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::proxy::cache::DiskCache;
use crate::proxy::origin::OriginFetcher;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let cache = Arc::new(DiskCache::open(settings.cache_dir.clone()).await?);
    tracing::info!(
        cache_dir = %cache.root().display(),
        origin_port = settings.origin_port,
        log_format = settings.log.as_str(),
        "disk cache ready"
    );
    let origin = OriginFetcher::from_settings(&settings);
    let app = proxy::AppContext::new(settings, cache, origin);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl-C; shutting down"),
            Err(err) => tracing::error!(error = %err, "failed to listen for Ctrl-C"),
        }
        let _ = stop_tx.send(true);
    });

    proxy::run(app, stop_rx).await
}
