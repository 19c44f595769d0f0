//! Channel client, used by secondary and rejected instances
//!
//! Wraps the one socket a non-primary instance keeps toward the primary.
//! The socket is created lazily, connecting is idempotent, and every wait
//! is bounded by the caller's timeout. I/O failures come back as `false`;
//! whether to retry is the caller's decision, never this module's.

use std::path::PathBuf;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use unison_protocol::{ConnectionType, Handshake, HandshakeCodec};

/// Client side of a channel, addressing whichever process is primary.
pub struct ChannelClient {
    channel_name: String,
    socket_path: PathBuf,
    instance_id: u32,
    stream: Option<UnixStream>,
}

impl ChannelClient {
    pub fn new(
        channel_name: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        instance_id: u32,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            socket_path: socket_path.into(),
            instance_id,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to the primary and send the handshake.
    ///
    /// No-op when already connected. Returns whether a usable connection
    /// exists when the call finishes; a connect or flush that misses the
    /// timeout reports `false` and leaves the client disconnected.
    pub async fn connect_to_primary(
        &mut self,
        deadline: Duration,
        connection_type: ConnectionType,
    ) -> bool {
        if self.stream.is_some() {
            return true;
        }

        let stream = match timeout(deadline, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(path = %self.socket_path.display(), "connect to primary failed: {}", e);
                return false;
            }
            Err(_) => {
                debug!(path = %self.socket_path.display(), "connect to primary timed out");
                return false;
            }
        };

        let mut framed = Framed::new(stream, HandshakeCodec::new());
        let handshake = Handshake::new(
            self.channel_name.clone(),
            connection_type,
            self.instance_id,
        );

        // Framed::send both writes and flushes the frame
        match timeout(deadline, framed.send(handshake)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("handshake write failed: {}", e);
                return false;
            }
            Err(_) => {
                debug!("handshake flush timed out");
                return false;
            }
        }

        self.stream = Some(framed.into_parts().io);
        true
    }

    /// Deliver a payload to the primary, reconnecting first if needed.
    ///
    /// Returns whether every byte was written and flushed within the
    /// deadline. On failure the socket is discarded so a retry starts from
    /// a fresh connection.
    pub async fn send_payload(&mut self, payload: &[u8], deadline: Duration) -> bool {
        if !self
            .connect_to_primary(deadline, ConnectionType::Reconnect)
            .await
        {
            return false;
        }

        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        let write = async {
            stream.write_all(payload).await?;
            stream.flush().await
        };

        match timeout(deadline, write).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("payload write failed: {}", e);
                self.stream = None;
                false
            }
            Err(_) => {
                debug!("payload flush timed out");
                self.stream = None;
                false
            }
        }
    }
}
