pub mod cache;
pub mod handler;
pub mod listener;
pub mod origin;
pub mod request;
pub mod response;
pub mod target;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::settings::Settings;
use cache::CacheBackend;
use origin::OriginFetcher;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<dyn CacheBackend>,
    pub origin: OriginFetcher,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: Arc<dyn CacheBackend>, origin: OriginFetcher) -> Self {
        Self {
            settings,
            cache,
            origin,
        }
    }
}

/// Binds the configured address and serves until `stop` fires.
pub async fn run(app: AppContext, stop: watch::Receiver<bool>) -> Result<()> {
    let listener = listener::Listener::bind(app).await?;
    listener.serve(stop).await
}
