//! Unix socket server in front of the hub actor

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brood_core::protocol::{
    decode_frame, encode_frame, CleanupOutcome, LogQuery, Push, Request, Response, SpawnOutcome,
    MAX_FRAME_BYTES,
};
use brood_core::{BroodConfig, BroodError, HelperId, HubPaths, LogRecord, Result};
use brood_log::{LogFilter, MessageLog};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::actor::{spawn_actor, HubHandle};
use crate::effects::Effects;
use crate::fs::HelperFs;
use crate::launcher::Launcher;
use crate::registry::{ConnId, LaunchPlan, Registry};

/// Triggers a graceful stop of [`HubServer::run`]
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Shared by every connection task
struct Hub {
    handle: HubHandle,
    effects: Effects,
    log_path: PathBuf,
    subscriber_queue: usize,
    shutdown: ShutdownHandle,
    next_conn: AtomicU64,
}

pub struct HubServer {
    listener: UnixListener,
    socket_path: PathBuf,
    hub: Arc<Hub>,
    shutdown_rx: watch::Receiver<bool>,
    actor: JoinHandle<()>,
    /// How long open connections may finish after shutdown
    drain: Duration,
}

impl HubServer {
    /// Open the log, start the actor and bind the socket
    ///
    /// Fails with [`BroodError::AlreadyRunning`] if another hub answers on
    /// the socket path; a dead socket file is removed.
    pub async fn bind(
        paths: &HubPaths,
        config: &BroodConfig,
        launcher: Arc<dyn Launcher>,
        fs: Arc<dyn HelperFs>,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = paths.socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        clear_stale_socket(&paths.socket).await?;

        let numbering = config.numbering()?;
        let log = MessageLog::open(&paths.log)?;
        let registry = Registry::new(numbering, config.director_budget());
        let listener = UnixListener::bind(&paths.socket)?;
        let (handle, actor) = spawn_actor(registry, log);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let effects = Effects::new(
            fs,
            launcher,
            paths.layout(),
            numbering,
            paths.socket.clone(),
            config.container.clone(),
            config.stop_grace(),
        );

        info!("Hub listening on {}", paths.socket.display());
        Ok(Self {
            listener,
            socket_path: paths.socket.clone(),
            hub: Arc::new(Hub {
                handle,
                effects,
                log_path: paths.log.clone(),
                subscriber_queue: config.hub.subscriber_queue,
                shutdown: ShutdownHandle { tx: shutdown_tx },
                next_conn: AtomicU64::new(1),
            }),
            shutdown_rx,
            actor,
            drain: config.request_timeout(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.hub.shutdown.clone()
    }

    /// Accept connections until shut down, then remove the socket file
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            socket_path,
            hub,
            mut shutdown_rx,
            actor,
            drain,
        } = self;

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            let hub = hub.clone();
                            let conn = hub.next_conn.fetch_add(1, Ordering::Relaxed);
                            connections.spawn(async move {
                                hub.handle_connection(stream, conn).await;
                            });
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", socket_path.display(), e);
            }
        }
        drop(hub);

        // Let launches and stops in progress settle with the actor still up
        let drained = tokio::time::timeout(drain, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} connections still open after {:?}; closing them", connections.len(), drain);
            connections.abort_all();
        }
        // Open subscriptions hold handles; the actor would otherwise outlive the server
        actor.abort();
        info!("Hub stopped");
        Ok(())
    }
}

async fn clear_stale_socket(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(BroodError::AlreadyRunning(path.to_path_buf()));
    }
    warn!("Removing stale socket {}", path.display());
    std::fs::remove_file(path)?;
    Ok(())
}

/// Read one newline-terminated frame, bounded by [`MAX_FRAME_BYTES`].
/// Returns `None` on a clean EOF before any byte.
async fn read_frame<R>(reader: &mut BufReader<R>) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_FRAME_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_FRAME_BYTES {
        return Err(BroodError::Protocol("request frame too large".to_string()));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| BroodError::Protocol("request is not valid UTF-8".to_string()))
}

async fn write_frame<T: serde::Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    writer.write_all(&encode_frame(value)?).await?;
    writer.flush().await?;
    Ok(())
}

impl Hub {
    async fn handle_connection(self: Arc<Self>, stream: UnixStream, conn: ConnId) {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = match read_frame(&mut reader).await {
            Ok(None) => return,
            Ok(Some(line)) => decode_frame::<Request>(&line),
            Err(e) => Err(e),
        };
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting request on connection {}: {}", conn, e);
                let _ = write_frame(&mut writer, &Response::failure(&e)).await;
                return;
            }
        };
        debug!("Connection {}: {}", conn, request.command());

        if let Request::Subscribe { identity } = request {
            self.serve_subscription(identity, conn, reader, writer).await;
            return;
        }

        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request on connection {} failed: {}", conn, e);
                Response::failure(&e)
            }
        };
        if let Err(e) = write_frame(&mut writer, &response).await {
            debug!("Failed to answer connection {}: {}", conn, e);
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Spawn {
                parent,
                breadth,
                depth,
                model,
            } => {
                let plan = self.handle.spawn(parent, breadth, depth, model).await?;
                let container = self.launch(&plan).await?;
                Response::with_data(&SpawnOutcome {
                    identity: plan.identity,
                    parent: plan.parent,
                    budget: plan.budget,
                    peers: plan.peers,
                    container: Some(container),
                })
            }
            Request::Register { identity } => {
                Response::with_data(&self.handle.register(identity).await?)
            }
            Request::Running { identity } => {
                Response::with_data(&self.handle.running(identity).await?)
            }
            Request::Send { from, to, content } => {
                Response::with_data(&self.handle.send(from, to, content).await?)
            }
            Request::Broadcast { from, content } => {
                Response::with_data(&self.handle.broadcast(from, content).await?)
            }
            Request::Stop { identity } => {
                let plan = self.handle.stop(identity).await?;
                if let Some(process) = &plan.process {
                    let terminated = self.effects.terminate(process).await;
                    self.handle.teardown_finished(identity).await?;
                    terminated?;
                }
                self.summary(identity).await
            }
            Request::Respawn { identity } => {
                let plan = self.handle.respawn(identity).await?;
                self.launch(&plan).await?;
                self.summary(identity).await
            }
            Request::Cleanup { identity, cascade } => self.cleanup(identity, cascade).await,
            Request::Status { identity } => {
                Response::with_data(&self.handle.status(identity).await?)
            }
            Request::LogQuery(query) => self.log_query(query).await,
            Request::Shutdown => {
                let handles = self.handle.shutdown().await?;
                for process in &handles {
                    if let Err(e) = self.effects.terminate(process).await {
                        warn!("Failed to stop helper {}: {}", process.identity, e);
                    }
                }
                info!("Shutdown requested; stopped {} helpers", handles.len());
                self.shutdown.trigger();
                Ok(Response::ok())
            }
            Request::Subscribe { .. } => Err(BroodError::InvalidRequest(
                "subscribe must be the only request on its connection".to_string(),
            )),
        }
    }

    /// Materialize and launch, reporting the result to the actor.
    /// Returns the container name.
    async fn launch(&self, plan: &LaunchPlan) -> Result<String> {
        let launched = match self.effects.materialize(plan).await {
            Ok(()) => self.effects.launch(plan).await,
            Err(e) => Err(e),
        };
        match launched {
            Ok(process) => {
                let refused = match self
                    .handle
                    .launch_finished(plan.identity, Some(process.clone()))
                    .await
                {
                    Ok(None) => return Ok(process.name),
                    Ok(Some(_)) => BroodError::HubUnavailable("hub is shutting down".to_string()),
                    Err(e) => e,
                };
                warn!("Hub shut down while helper {} launched; stopping it", plan.identity);
                if let Err(e) = self.effects.terminate(&process).await {
                    warn!("Failed to stop helper {}: {}", plan.identity, e);
                }
                Err(refused)
            }
            Err(e) => {
                error!("Launch of helper {} failed: {}", plan.identity, e);
                self.handle.launch_finished(plan.identity, None).await?;
                Err(e)
            }
        }
    }

    async fn cleanup(&self, identity: HelperId, cascade: bool) -> Result<Response> {
        let steps = self.handle.cleanup(identity, cascade).await?;
        let mut first_error = None;
        let mut removed = Vec::with_capacity(steps.len());

        for step in steps {
            if let Some(process) = &step.process {
                if let Err(e) = self.effects.terminate(process).await {
                    warn!("Failed to stop helper {}: {}", step.identity, e);
                }
            }
            if let Err(e) = self.effects.remove_helper(step.identity).await {
                warn!("Failed to remove files of helper {}: {}", step.identity, e);
                first_error.get_or_insert(e);
            }
            removed.push(step.identity);
        }

        match first_error {
            Some(e) => Err(e),
            None => Response::with_data(&CleanupOutcome { removed }),
        }
    }

    async fn log_query(&self, query: LogQuery) -> Result<Response> {
        let up_to = self.handle.log_snapshot().await?;
        let filter = LogFilter::from(&query).up_to(up_to);
        let path = self.log_path.clone();

        let records = tokio::task::spawn_blocking(move || -> Result<Vec<LogRecord>> {
            MessageLog::read(path, filter)?.collect()
        })
        .await
        .map_err(|e| BroodError::Other(format!("log reader panicked: {}", e)))??;
        Response::with_data(&records)
    }

    async fn summary(&self, identity: HelperId) -> Result<Response> {
        let report = self.handle.status(Some(identity)).await?;
        Response::with_data(&report.helpers.into_iter().next())
    }

    async fn serve_subscription(
        &self,
        identity: HelperId,
        conn: ConnId,
        mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) {
        let (tx, mut rx) = mpsc::channel::<Push>(self.subscriber_queue);
        if let Err(e) = self.handle.subscribe(identity, conn, tx).await {
            let _ = write_frame(&mut writer, &Response::failure(&e)).await;
            return;
        }
        if write_frame(&mut writer, &Response::ok()).await.is_err() {
            self.handle.unsubscribe(identity, conn).await;
            return;
        }
        info!("Helper {} subscribed (connection {})", identity, conn);

        loop {
            tokio::select! {
                push = rx.recv() => {
                    let Some(push) = push else {
                        debug!("Subscription of helper {} closed by hub", identity);
                        break;
                    };
                    if let Err(e) = write_frame(&mut writer, &push).await {
                        debug!("Push to helper {} failed: {}", identity, e);
                        break;
                    }
                }
                read = read_frame(&mut reader) => {
                    match read {
                        Ok(Some(_)) => debug!("Ignoring input on subscription of helper {}", identity),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Closing subscription of helper {}: {}", identity, e);
                            break;
                        }
                    }
                }
            }
        }

        self.handle.unsubscribe(identity, conn).await;
    }
}
