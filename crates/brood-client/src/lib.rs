//! # brood-client
//!
//! Client for the brood hub, used by the CLI on the host and inside helper
//! containers. Each call opens a fresh connection, sends one request and
//! reads one response, all bounded by the client's timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use brood_core::protocol::{
    decode_frame, encode_frame, CleanupOutcome, HelperSummary, LogQuery, Push, Request, Response,
    SendOutcome, SpawnOutcome, StatusReport,
};
use brood_core::{BroodError, HelperId, LogRecord, Result};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

/// Pause between connection attempts in [`HubClient::wait_ready`]
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct HubClient {
    socket: PathBuf,
    timeout: Duration,
}

impl HubClient {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                BroodError::HubUnavailable(format!("{}: {}", self.socket.display(), e))
            }
            _ => BroodError::Io(e),
        })
    }

    /// Connect, send `request` and read the response line
    async fn exchange(&self, request: &Request) -> Result<(Response, BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = self.connect().await?;
        let (read_half, mut writer) = stream.into_split();
        writer.write_all(&encode_frame(request)?).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(BroodError::ConnectionClosed);
        }
        if !line.ends_with('\n') {
            return Err(BroodError::ConnectionClosed);
        }
        let response = decode_frame(&line)?;
        Ok((response, reader, writer))
    }

    /// Send one request, bounded by the client timeout
    pub async fn request(&self, request: &Request) -> Result<Response> {
        debug!("Sending {} to {}", request.command(), self.socket.display());
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| BroodError::Timeout(self.timeout))?
            .map(|(response, _, _)| response)
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        self.request(&request).await?.into_data()
    }

    /// Retry connecting until the hub answers or `deadline` passes
    pub async fn wait_ready(&self, deadline: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        loop {
            match self.connect().await {
                Ok(_) => return Ok(()),
                Err(BroodError::HubUnavailable(reason)) => {
                    if Instant::now() + RETRY_INTERVAL > until {
                        return Err(BroodError::HubUnavailable(reason));
                    }
                    debug!("Hub not ready yet: {}", reason);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn spawn(
        &self,
        parent: HelperId,
        breadth: Option<u32>,
        depth: Option<u32>,
        model: Option<String>,
    ) -> Result<SpawnOutcome> {
        self.call(Request::Spawn {
            parent,
            breadth,
            depth,
            model,
        })
        .await
    }

    pub async fn register(&self, identity: HelperId) -> Result<HelperSummary> {
        self.call(Request::Register { identity }).await
    }

    pub async fn running(&self, identity: HelperId) -> Result<HelperSummary> {
        self.call(Request::Running { identity }).await
    }

    pub async fn send(&self, from: HelperId, to: HelperId, content: impl Into<String>) -> Result<SendOutcome> {
        self.call(Request::Send {
            from,
            to,
            content: content.into(),
        })
        .await
    }

    pub async fn broadcast(&self, from: HelperId, content: impl Into<String>) -> Result<SendOutcome> {
        self.call(Request::Broadcast {
            from,
            content: content.into(),
        })
        .await
    }

    pub async fn stop(&self, identity: HelperId) -> Result<Option<HelperSummary>> {
        self.call(Request::Stop { identity }).await
    }

    pub async fn respawn(&self, identity: HelperId) -> Result<Option<HelperSummary>> {
        self.call(Request::Respawn { identity }).await
    }

    pub async fn cleanup(&self, identity: HelperId, cascade: bool) -> Result<CleanupOutcome> {
        self.call(Request::Cleanup { identity, cascade }).await
    }

    pub async fn status(&self, identity: Option<HelperId>) -> Result<StatusReport> {
        self.call(Request::Status { identity }).await
    }

    pub async fn log_query(&self, query: LogQuery) -> Result<Vec<LogRecord>> {
        self.call(Request::LogQuery(query)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(&Request::Shutdown).await?.into_result()?;
        Ok(())
    }

    /// Open a push stream for `identity`. Only the handshake is bounded by
    /// the timeout; the stream itself lives until either side closes it.
    pub async fn subscribe(&self, identity: HelperId) -> Result<Subscription> {
        let (response, reader, writer) =
            tokio::time::timeout(self.timeout, self.exchange(&Request::Subscribe { identity }))
                .await
                .map_err(|_| BroodError::Timeout(self.timeout))??;
        response.into_result()?;
        Ok(Subscription {
            identity,
            reader,
            _writer: writer,
        })
    }
}

/// Live push stream for one helper
pub struct Subscription {
    identity: HelperId,
    reader: BufReader<OwnedReadHalf>,
    // Dropping the write half would signal EOF to the hub
    _writer: OwnedWriteHalf,
}

impl Subscription {
    pub fn identity(&self) -> HelperId {
        self.identity
    }

    /// Next push, or `None` once the hub closes the stream
    pub async fn next(&mut self) -> Result<Option<Push>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        decode_frame(&line).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brood_core::ErrorKind;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let dir = tempdir().unwrap();
        let client = HubClient::new(dir.path().join("hub.sock"), Duration::from_secs(1));
        let err = client.status(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_silent_hub_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = HubClient::new(&path, Duration::from_millis(200));
        let err = client.status(None).await.unwrap_err();
        assert!(matches!(err, BroodError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_eof_mid_response_is_connection_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            stream.write_all(br#"{"ok":tr"#).await.unwrap();
        });

        let client = HubClient::new(&path, Duration::from_secs(2));
        let err = client.status(None).await.unwrap_err();
        assert!(matches!(err, BroodError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_remote_error_keeps_kind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            let response = Response::failure(&BroodError::UnknownIdentity(7));
            stream.write_all(&encode_frame(&response).unwrap()).await.unwrap();
        });

        let client = HubClient::new(&path, Duration::from_secs(2));
        let err = client.register(7).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownIdentity);
    }

    #[tokio::test]
    async fn test_wait_ready_gives_up_after_deadline() {
        let dir = tempdir().unwrap();
        let client = HubClient::new(dir.path().join("hub.sock"), Duration::from_secs(1));
        let started = Instant::now();
        let err = client
            .wait_ready(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
