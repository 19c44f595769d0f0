//! Channel server, run by the primary
//!
//! Owns the listening socket for a channel name. Every accepted connection
//! gets its own task that exclusively owns that connection's framing state,
//! so no connection table needs locking: the handshake decoder runs first,
//! and once it validates, every further byte on the socket is application
//! payload forwarded to the host.
//!
//! A connection that fails validation is closed and forgotten. Nothing a
//! stale or hostile client sends can reach the host application or disturb
//! other connections.

use std::io;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use unison_protocol::{ConnectionType, HandshakeCodec};
use unison_utils::{ensure_dir, Result, UnisonError};

/// Event surfaced to the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// Another instance started and announced itself.
    InstanceStarted,
    /// A connected instance delivered payload bytes.
    MessageReceived { instance_id: u32, payload: Vec<u8> },
}

/// Read chunk size for payload delivery after the handshake.
const READ_BUF_LEN: usize = 4096;

/// Per-connection context shared by the accept loop.
struct ServerContext {
    channel_name: String,
    notify_secondaries: bool,
    events: mpsc::Sender<InstanceEvent>,
}

/// Remove any stale endpoint and bind the channel's listening socket.
///
/// Called while the election still holds the block lock, so a bound
/// endpoint and the published primary registration appear atomically to
/// other processes. The socket file mode enforces the access policy:
/// owner-only for user-scoped channels, every local user otherwise.
pub(crate) fn bind_endpoint(
    socket_path: &Path,
    user_scoped: bool,
) -> Result<std::os::unix::net::UnixListener> {
    let wrap = |source: io::Error| UnisonError::Endpoint {
        path: socket_path.to_path_buf(),
        source,
    };

    if let Some(parent) = socket_path.parent() {
        ensure_dir(&parent.to_path_buf()).map_err(wrap)?;
    }

    // A previous primary that crashed leaves its socket file behind
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!(path = %socket_path.display(), "removed stale endpoint"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(wrap(e)),
    }

    let listener = std::os::unix::net::UnixListener::bind(socket_path).map_err(wrap)?;

    let mode = if user_scoped { 0o600 } else { 0o666 };
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(mode)).map_err(wrap)?;

    Ok(listener)
}

/// Handle to the running channel server.
pub struct ChannelServer {
    shutdown_tx: broadcast::Sender<()>,
}

impl ChannelServer {
    /// Start serving on an endpoint bound by [`bind_endpoint`].
    ///
    /// Events flow to `events`; the receiver half belongs to the host.
    pub fn start(
        listener: std::os::unix::net::UnixListener,
        channel_name: String,
        notify_secondaries: bool,
        events: mpsc::Sender<InstanceEvent>,
    ) -> Result<Self> {
        listener.set_nonblocking(true).map_err(UnisonError::Io)?;
        let listener = tokio::net::UnixListener::from_std(listener).map_err(UnisonError::Io)?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let context = Arc::new(ServerContext {
            channel_name,
            notify_secondaries,
            events,
        });

        tokio::spawn(run_accept_loop(listener, context, shutdown_rx));

        Ok(Self { shutdown_tx })
    }

    /// Stop accepting connections. Connections already delivering payload
    /// run until their peer disconnects.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run the accept loop until shutdown.
async fn run_accept_loop(
    listener: tokio::net::UnixListener,
    context: Arc<ServerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(channel = %context.channel_name, "channel server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        debug!(channel = %context.channel_name, "new channel connection");
                        let context = Arc::clone(&context);
                        tokio::spawn(async move {
                            handle_connection(stream, context).await;
                        });
                    }
                    Err(e) => {
                        error!("channel accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!(channel = %context.channel_name, "channel server stopping");
                break;
            }
        }
    }
}

/// Drive one connection: handshake first, then payload until disconnect.
async fn handle_connection(stream: UnixStream, context: Arc<ServerContext>) {
    let mut framed = Framed::new(stream, HandshakeCodec::new());

    // Header and Body stages live inside the codec; the first decoded item
    // is the complete handshake.
    let handshake = match framed.next().await {
        Some(Ok(handshake)) => handshake,
        Some(Err(e)) => {
            // Malformed traffic is dropped without bothering the host
            debug!("closing connection with invalid handshake: {}", e);
            return;
        }
        None => {
            debug!("connection closed before handshake completed");
            return;
        }
    };

    if handshake.channel_name != context.channel_name {
        debug!("closing connection addressed to a different channel");
        return;
    }

    let instance_id = handshake.instance_id;
    let announce = match handshake.connection_type {
        ConnectionType::NewInstance => true,
        ConnectionType::SecondaryInstance => context.notify_secondaries,
        ConnectionType::Reconnect | ConnectionType::Invalid => false,
    };

    if announce && context.events.send(InstanceEvent::InstanceStarted).await.is_err() {
        return;
    }

    // The peer may have sent payload in the same chunk as the handshake;
    // those bytes are already buffered and must not be dropped.
    let parts = framed.into_parts();
    let mut stream = parts.io;

    if !parts.read_buf.is_empty() {
        let event = InstanceEvent::MessageReceived {
            instance_id,
            payload: parts.read_buf.to_vec(),
        };
        if context.events.send(event).await.is_err() {
            return;
        }
    }

    let mut buf = vec![0_u8; READ_BUF_LEN];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                debug!(instance_id, "channel connection closed");
                break;
            }
            Ok(n) => {
                let event = InstanceEvent::MessageReceived {
                    instance_id,
                    payload: buf[..n].to_vec(),
                };
                if context.events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(instance_id, "channel connection read error: {}", e);
                break;
            }
        }
    }
}
