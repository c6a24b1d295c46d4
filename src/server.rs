//! Milter Server
//!
//! Accepts agent connections on TCP or Unix sockets and runs one session
//! task per connection.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ConnSpec};
use crate::dispatch::{Dispatcher, Outcome};
use crate::milter::{Milter, Registry};
use crate::proto::{AgentMessage, Command, FilterReply, Packet, PacketCodec, DEFAULT_CHUNK_SIZE};
use crate::session::Session;
use crate::{Error, Result};

/// Settings every connection task reads
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Read/write timeout per packet
    pub timeout: Duration,
    /// Fixed payload bound; `None` follows the negotiated chunk size
    pub max_payload: Option<usize>,
    pub skip_unhandled_stages: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(7210),
            max_payload: None,
            skip_unhandled_stages: false,
        }
    }
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.timeout(),
            max_payload: config.max_payload,
            skip_unhandled_stages: config.skip_unhandled_stages,
        }
    }
}

/// A bound, listening socket
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Address of a TCP listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Unix { .. } => None,
        }
    }

    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Self::Tcp(_) => None,
            Self::Unix { path, .. } => Some(path),
        }
    }
}

/// Server state
pub struct Server<M: Milter> {
    registry: Arc<Registry<M>>,
    spec: ConnSpec,
    backlog: u32,
    remove_stale_socket: bool,
    settings: Arc<ConnectionSettings>,
    next_id: AtomicU64,
}

impl<M: Milter> Server<M> {
    /// Create a new server. The configuration is validated and consumed.
    pub fn new(config: Config, registry: Registry<M>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            spec: config.listen_spec()?,
            backlog: config.backlog,
            remove_stale_socket: config.remove_stale_socket,
            settings: Arc::new(ConnectionSettings::from(&config)),
            registry: Arc::new(registry),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn spec(&self) -> &ConnSpec {
        &self.spec
    }

    pub fn registry(&self) -> &Arc<Registry<M>> {
        &self.registry
    }

    /// Open the listening socket without accepting yet
    pub async fn bind(&self) -> Result<Listener> {
        match &self.spec {
            ConnSpec::Unix(path) => {
                if self.remove_stale_socket {
                    remove_stale_socket(path)?;
                }
                let listener = UnixListener::bind(path)?;
                info!("Milter {} listening on unix:{}", self.registry.name(), path.display());
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            ConnSpec::Inet { host, port } => self.bind_tcp(host, *port, false).await,
            ConnSpec::Inet6 { host, port } => self.bind_tcp(host, *port, true).await,
        }
    }

    async fn bind_tcp(&self, host: &str, port: u16, v6: bool) -> Result<Listener> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .find(|addr| addr.is_ipv6() == v6)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "{} has no {} address",
                    host,
                    if v6 { "IPv6" } else { "IPv4" }
                ))
            })?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.backlog)?;

        info!(
            "Milter {} listening on {}",
            self.registry.name(),
            listener.local_addr()?
        );
        Ok(Listener::Tcp(listener))
    }

    /// Accept connections until `shutdown` is cancelled, then wait for the
    /// running sessions to finish
    pub async fn serve(&self, listener: Listener, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = accept(&listener) => match accepted {
                    Ok(connection) => self.spawn_session(&tracker, connection, &shutdown),
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("Stopped accepting, waiting for {} sessions", tracker.len());
        tracker.close();
        tracker.wait().await;

        if let Listener::Unix { path, .. } = &listener {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    /// Bind and serve
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    fn spawn_session(&self, tracker: &TaskTracker, connection: Connection, shutdown: &CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.registry);
        let settings = Arc::clone(&self.settings);
        let shutdown = shutdown.clone();

        match connection {
            Connection::Tcp(stream, addr) => {
                debug!("Session {}: connection from {}", id, addr);
                tracker.spawn(async move {
                    if let Err(e) = serve_connection(stream, registry, &settings, id, shutdown).await {
                        debug!("Session {} from {} ended: {}", id, addr, e);
                    }
                });
            }
            Connection::Unix(stream) => {
                debug!("Session {}: unix connection", id);
                tracker.spawn(async move {
                    if let Err(e) = serve_connection(stream, registry, &settings, id, shutdown).await {
                        debug!("Session {} ended: {}", id, e);
                    }
                });
            }
        }
    }
}

enum Connection {
    Tcp(tokio::net::TcpStream, SocketAddr),
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &Listener) -> std::io::Result<Connection> {
    match listener {
        Listener::Tcp(listener) => {
            let (stream, addr) = listener.accept().await?;
            Ok(Connection::Tcp(stream, addr))
        }
        Listener::Unix { listener, .. } => {
            let (stream, _) = listener.accept().await?;
            Ok(Connection::Unix(stream))
        }
    }
}

/// Remove a socket file left behind by a previous run. Anything that is
/// not a socket is left alone.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Err(Error::InvalidConfig(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Run one agent connection to completion.
///
/// The close handler runs and the handler context is released however the
/// connection ends.
pub async fn serve_connection<M, S>(
    stream: S,
    registry: Arc<Registry<M>>,
    settings: &ConnectionSettings,
    id: u64,
    shutdown: CancellationToken,
) -> Result<()>
where
    M: Milter,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let codec = PacketCodec::new(settings.max_payload.unwrap_or(DEFAULT_CHUNK_SIZE));
    let mut framed = Framed::new(stream, codec);
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new(registry, Session::with_progress(id, progress_tx))
        .skip_unhandled_stages(settings.skip_unhandled_stages);

    let result = run_session(
        &mut framed,
        &mut dispatcher,
        &mut progress_rx,
        settings,
        &shutdown,
    )
    .await;
    dispatcher.finish().await;
    result
}

async fn run_session<M, S>(
    framed: &mut Framed<S, PacketCodec>,
    dispatcher: &mut Dispatcher<M>,
    progress_rx: &mut mpsc::UnboundedReceiver<()>,
    settings: &ConnectionSettings,
    shutdown: &CancellationToken,
) -> Result<()>
where
    M: Milter,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = dispatcher.session().id();

    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Session {}: shutting down", id);
                return Ok(());
            }
            read = timeout(settings.timeout, framed.next()) => match read {
                Err(_) => return Err(Error::Timeout(settings.timeout)),
                Ok(None) => {
                    debug!("Session {}: agent disconnected", id);
                    return Ok(());
                }
                Ok(Some(packet)) => packet?,
            },
        };

        trace!(
            "Session {}: received {:?} ({} bytes)",
            id,
            packet.command as char,
            packet.payload.len()
        );
        let message = AgentMessage::decode(&packet)?;
        let command = message.command();
        dispatcher
            .session_mut()
            .set_deadline(Instant::now() + settings.timeout);

        let outcome = {
            let dispatch = dispatcher.dispatch(message);
            tokio::pin!(dispatch);
            loop {
                tokio::select! {
                    biased;
                    Some(()) = progress_rx.recv() => {
                        send(framed, FilterReply::Progress.to_packet(), settings.timeout).await?;
                    }
                    outcome = &mut dispatch => break outcome?,
                }
            }
        };
        while progress_rx.try_recv().is_ok() {
            send(framed, FilterReply::Progress.to_packet(), settings.timeout).await?;
        }

        if command == Command::Negotiate && settings.max_payload.is_none() {
            if let Some(negotiated) = dispatcher.session().negotiated() {
                framed
                    .codec_mut()
                    .set_max_payload(negotiated.max_chunk_size());
            }
        }

        match outcome {
            Outcome::Replies(replies) => {
                for reply in replies {
                    trace!("Session {}: sending {:?}", id, reply.command());
                    send(framed, reply.to_packet(), settings.timeout).await?;
                }
            }
            Outcome::Silent => {}
            Outcome::Close => {
                debug!("Session {}: closed by agent", id);
                return Ok(());
            }
        }
    }
}

async fn send<S>(framed: &mut Framed<S, PacketCodec>, packet: Packet, limit: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(limit, framed.send(packet))
        .await
        .map_err(|_| Error::Timeout(limit))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_stale_socket_leaves_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();
        assert!(matches!(
            remove_stale_socket(&path),
            Err(Error::InvalidConfig(_))
        ));
        assert!(path.exists());

        remove_stale_socket(&dir.path().join("missing")).unwrap();
    }

    #[tokio::test]
    async fn test_remove_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("milter.sock");
        let listener = UnixListener::bind(&path).unwrap();
        drop(listener);
        assert!(path.exists());
        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            timeout_secs: 30,
            max_payload: Some(1024),
            skip_unhandled_stages: true,
            ..Config::default()
        };
        let settings = ConnectionSettings::from(&config);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.max_payload, Some(1024));
        assert!(settings.skip_unhandled_stages);
    }
}
