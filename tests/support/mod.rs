#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use stashproxy::proxy::AppContext;
use stashproxy::proxy::cache::DiskCache;
use stashproxy::proxy::listener::{Listener, ListenerHandle};
use stashproxy::proxy::origin::OriginFetcher;
use stashproxy::settings::Settings;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn ok_with_max_age(body: &str, max_age: u64) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nCache-Control: max-age={max_age}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// A loopback origin answering every request with the same bytes and counting
/// the requests it receives.
pub struct TestOrigin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn respond_with(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(Arc::new(response.into()), Duration::ZERO).await
    }

    pub async fn slow(response: impl Into<Vec<u8>>, delay: Duration) -> Result<Self> {
        Self::spawn(Arc::new(response.into()), delay).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    async fn spawn(response: Arc<Vec<u8>>, delay: Duration) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let response = response.clone();
                tokio::spawn(async move {
                    if read_head(&mut stream).await.is_err() {
                        return;
                    }
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Ok(Self { addr, hits, handle })
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("client closed before finishing the request head");
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(head)
}

/// A proxy bound to an ephemeral loopback port with its cache in a temp directory.
pub struct ProxyHarness {
    temp: Option<TempDir>,
    pub cache_dir: PathBuf,
    handle: ListenerHandle,
}

impl ProxyHarness {
    pub async fn start(origin_port: u16) -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("cache");
        let mut harness = Self::start_in(&cache_dir, origin_port).await?;
        harness.temp = Some(temp);
        Ok(harness)
    }

    /// Starts a proxy over an existing cache directory, which the caller keeps alive.
    pub async fn start_in(cache_dir: &Path, origin_port: u16) -> Result<Self> {
        let settings = Settings {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            cache_dir: cache_dir.to_path_buf(),
            client_timeout: 5,
            origin_port,
            origin_connect_timeout: 2,
            origin_read_timeout: 2,
            ..Settings::default()
        };
        let cache = Arc::new(DiskCache::open(settings.cache_dir.clone()).await?);
        let origin = OriginFetcher::from_settings(&settings);
        let app = AppContext::new(Arc::new(settings), cache, origin);
        let handle = Listener::bind(app).await?.spawn();
        Ok(Self {
            temp: None,
            cache_dir: cache_dir.to_path_buf(),
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        self.send(format!("GET {uri} HTTP/1.1\r\nUser-Agent: harness\r\n\r\n").as_bytes())
            .await
    }

    pub async fn send(&self, raw: &[u8]) -> Result<Vec<u8>> {
        send_raw(self.addr(), raw).await
    }

    pub fn cache_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Cache writes happen after the client connection is closed, so callers
    /// poll for the entry instead of expecting it once the response arrives.
    pub async fn wait_for_cache_file(&self, name: &str) -> Result<()> {
        let path = self.cache_dir.join(name);
        for _ in 0..100 {
            if path.exists() {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!("cache entry {} never appeared", path.display())
    }

    pub async fn open_cache(&self) -> Result<DiskCache> {
        DiskCache::open(self.cache_dir.clone()).await
    }

    pub async fn stop(self) -> Result<()> {
        self.handle.stop().await
    }
}

pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> Result<Vec<u8>> {
    let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("timed out connecting to proxy")??;
    stream.write_all(raw).await?;
    stream.shutdown().await?;
    let mut response = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .context("timed out reading proxy response")??;
    Ok(response)
}
