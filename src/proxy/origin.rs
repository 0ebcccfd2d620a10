use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::settings::Settings;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginFailure {
    EmptyHost,
    Resolve,
    Connect,
    Timeout,
    Write,
    Read,
    TooLarge,
}

impl OriginFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginFailure::EmptyHost => "empty_host",
            OriginFailure::Resolve => "resolve",
            OriginFailure::Connect => "connect",
            OriginFailure::Timeout => "timeout",
            OriginFailure::Write => "write",
            OriginFailure::Read => "read",
            OriginFailure::TooLarge => "too_large",
        }
    }
}

impl fmt::Display for OriginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a fetch can fail. The handler answers all of them with a gateway error.
#[derive(Debug, Error)]
#[error("origin {host}:{port} unreachable ({kind}): {detail}")]
pub struct OriginUnreachable {
    pub host: String,
    pub port: u16,
    pub kind: OriginFailure,
    pub detail: String,
}

/// A single `Connection: close` request with no body.
#[derive(Debug, Clone, Copy)]
pub struct OriginRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub version: &'a str,
}

impl OriginRequest<'_> {
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{} {} {}\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.method, self.path, self.version, self.host
        )
        .into_bytes()
    }
}

#[derive(Debug)]
pub struct FetchedResponse {
    pub raw: Bytes,
    pub origin_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct OriginFetcher {
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_response_size: usize,
}

impl OriginFetcher {
    pub fn new(
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
        max_response_size: usize,
    ) -> Self {
        Self {
            port,
            connect_timeout,
            read_timeout,
            max_response_size,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.origin_port,
            settings.origin_connect_timeout(),
            settings.origin_read_timeout(),
            settings.max_response_size,
        )
    }

    /// Sends `request` and collects the response until the origin closes the connection.
    /// Connecting and each individual read are bounded by their own timeouts.
    pub async fn fetch(
        &self,
        request: &OriginRequest<'_>,
    ) -> Result<FetchedResponse, OriginUnreachable> {
        let fail = |kind: OriginFailure, detail: String| OriginUnreachable {
            host: request.host.to_string(),
            port: self.port,
            kind,
            detail,
        };
        if request.host.is_empty() {
            return Err(fail(OriginFailure::EmptyHost, "request has no host".into()));
        }

        let (mut stream, origin_addr) = self.connect(request.host).await.map_err(|(kind, detail)| fail(kind, detail))?;
        trace!(origin = %origin_addr, host = request.host, "connected to origin");

        match timeout(self.read_timeout, stream.write_all(&request.encode())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(fail(OriginFailure::Write, err.to_string())),
            Err(_) => {
                return Err(fail(
                    OriginFailure::Timeout,
                    "timed out sending request".into(),
                ));
            }
        }

        let mut response = BytesMut::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = match timeout(self.read_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(read)) => read,
                Ok(Err(err)) => return Err(fail(OriginFailure::Read, err.to_string())),
                Err(_) => {
                    return Err(fail(
                        OriginFailure::Timeout,
                        format!("no data for {:?} after {} bytes", self.read_timeout, response.len()),
                    ));
                }
            };
            if read == 0 {
                break;
            }
            if response.len() + read > self.max_response_size {
                return Err(fail(
                    OriginFailure::TooLarge,
                    format!("response exceeds {} bytes", self.max_response_size),
                ));
            }
            response.extend_from_slice(&chunk[..read]);
        }
        debug!(origin = %origin_addr, bytes = response.len(), "origin response complete");

        Ok(FetchedResponse {
            raw: response.freeze(),
            origin_addr,
        })
    }

    async fn connect(&self, host: &str) -> Result<(TcpStream, SocketAddr), (OriginFailure, String)> {
        let addrs: Vec<SocketAddr> = match timeout(self.connect_timeout, lookup_host((host, self.port))).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(err)) => return Err((OriginFailure::Resolve, err.to_string())),
            Err(_) => return Err((OriginFailure::Timeout, "timed out resolving host".into())),
        };
        if addrs.is_empty() {
            return Err((OriginFailure::Resolve, "no addresses found".into()));
        }

        let mut last_failure = (OriginFailure::Connect, String::new());
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(origin = %addr, error = %err, "failed to set TCP_NODELAY on origin stream");
                    }
                    return Ok((stream, addr));
                }
                Ok(Err(err)) => {
                    debug!(origin = %addr, error = %err, "origin connect failed");
                    last_failure = (OriginFailure::Connect, format!("{addr}: {err}"));
                }
                Err(_) => {
                    debug!(origin = %addr, "origin connect timed out");
                    last_failure = (OriginFailure::Timeout, format!("timed out connecting to {addr}"));
                }
            }
        }
        Err(last_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn request(host: &str) -> OriginRequest<'_> {
        OriginRequest {
            method: "GET",
            host,
            path: "/page",
            version: "HTTP/1.1",
        }
    }

    async fn spawn_origin(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.ok();
            received
        });
        (port, handle)
    }

    #[test]
    fn encodes_close_delimited_request() {
        let encoded = String::from_utf8(request("example.com").encode()).unwrap();
        assert_eq!(
            encoded,
            "GET /page HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn reads_until_origin_closes() {
        let (port, origin) =
            spawn_origin(b"HTTP/1.1 200 OK\r\nCache-Control: max-age=120\r\n\r\nhello").await;
        let fetcher = OriginFetcher::new(port, Duration::from_secs(1), Duration::from_secs(1), 1024);

        let fetched = fetcher.fetch(&request("127.0.0.1")).await.expect("fetch");
        assert_eq!(
            &fetched.raw[..],
            b"HTTP/1.1 200 OK\r\nCache-Control: max-age=120\r\n\r\nhello"
        );
        assert_eq!(fetched.origin_addr.port(), port);

        let sent = origin.await.unwrap();
        assert_eq!(sent, request("127.0.0.1").encode());
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let fetcher = OriginFetcher::new(port, Duration::from_secs(1), Duration::from_secs(1), 1024);
        let err = fetcher.fetch(&request("127.0.0.1")).await.expect_err("nothing listening");
        assert_eq!(err.kind, OriginFailure::Connect);
        assert_eq!(err.port, port);
    }

    #[tokio::test]
    async fn silent_origin_times_out() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _origin = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let fetcher =
            OriginFetcher::new(port, Duration::from_secs(1), Duration::from_millis(100), 1024);
        let err = fetcher.fetch(&request("127.0.0.1")).await.expect_err("origin never answers");
        assert_eq!(err.kind, OriginFailure::Timeout);
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let (port, _origin) = spawn_origin(b"HTTP/1.1 200 OK\r\n\r\n0123456789abcdef").await;
        let fetcher = OriginFetcher::new(port, Duration::from_secs(1), Duration::from_secs(1), 16);
        let err = fetcher.fetch(&request("127.0.0.1")).await.expect_err("too large");
        assert_eq!(err.kind, OriginFailure::TooLarge);
    }

    #[tokio::test]
    async fn empty_host_is_rejected_without_connecting() {
        let fetcher = OriginFetcher::new(80, Duration::from_secs(1), Duration::from_secs(1), 16);
        let err = fetcher.fetch(&request("")).await.expect_err("empty host");
        assert_eq!(err.kind, OriginFailure::EmptyHost);
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        let fetcher = OriginFetcher::new(80, Duration::from_secs(5), Duration::from_secs(1), 16);
        let err = fetcher
            .fetch(&request("no-such-host.invalid"))
            .await
            .expect_err("resolution must fail");
        assert!(matches!(err.kind, OriginFailure::Resolve | OriginFailure::Timeout));
    }
}
