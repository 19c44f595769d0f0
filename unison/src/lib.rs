//! unison: single-instance election with instance-to-primary messaging
//!
//! Guarantees at most one primary instance of an application per machine
//! (or per user) for a given identity, while letting additional instances
//! detect the primary, announce themselves, and forward payloads before
//! exiting. The host application keeps its own lifecycle; unison only
//! answers "which role am I" and moves bytes to the primary.
//!
//! ```no_run
//! use std::time::Duration;
//! use unison::{AppIdentity, IdentityOptions, SingleInstance};
//!
//! # async fn run() -> unison::Result<()> {
//! let identity = AppIdentity::new("myapp", "Example Org", "example.org");
//! let mut instance = SingleInstance::elect(
//!     &identity,
//!     true,
//!     IdentityOptions::SECONDARY_NOTIFICATION,
//!     Duration::from_millis(500),
//! )
//! .await?;
//!
//! if instance.is_primary() {
//!     let mut events = instance.take_events().expect("primary has events");
//!     while let Some(event) = events.recv().await {
//!         // react to InstanceStarted / MessageReceived
//!         let _ = event;
//!     }
//! } else {
//!     instance
//!         .send_message(b"hello", Duration::from_millis(500))
//!         .await;
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

pub mod block;
pub mod client;
pub mod election;
pub mod identity;
pub mod server;

// Re-export the host-facing surface at crate root
pub use election::{Election, Role};
pub use identity::{AppIdentity, IdentityOptions};
pub use server::InstanceEvent;
pub use unison_protocol::{ConnectionType, INSTANCE_UNASSIGNED};
pub use unison_utils::{Result, UnisonError};

use block::SharedBlock;
use client::ChannelClient;
use server::ChannelServer;

/// Depth of the host-facing event queue. Connection tasks wait (applying
/// backpressure) rather than drop events when the host falls behind.
const EVENT_QUEUE_DEPTH: usize = 100;

/// One elected application instance.
///
/// Created by [`SingleInstance::elect`]; queries are valid from then on.
/// Dropping a primary clears its registration so the next election can
/// proceed without waiting out the crash-recovery window.
pub struct SingleInstance {
    role: Role,
    instance_id: u32,
    channel_name: String,
    socket_path: PathBuf,
    block: Mutex<SharedBlock>,
    client: Option<ChannelClient>,
    server: Option<ChannelServer>,
    events_rx: Option<mpsc::Receiver<InstanceEvent>>,
}

impl SingleInstance {
    /// Run the election for `identity` and set up this process's side of
    /// the channel.
    ///
    /// `allow_secondary` decides whether a second instance becomes
    /// [`Role::Secondary`] or [`Role::Rejected`]. `timeout` bounds the
    /// client-side connect and flush waits; it does not affect the
    /// election itself.
    ///
    /// # Errors
    ///
    /// Failing to create or attach the shared instance block is fatal:
    /// the process cannot determine uniqueness. Everything else is either
    /// handled internally or reported through boolean send results.
    pub async fn elect(
        identity: &AppIdentity,
        allow_secondary: bool,
        options: IdentityOptions,
        timeout: Duration,
    ) -> Result<Self> {
        let channel_name = identity.channel_name(options);
        let user_scoped = options.contains(IdentityOptions::USER);
        let block_path = unison_utils::block_path(&channel_name, user_scoped);
        let socket_path = unison_utils::socket_path(&channel_name, user_scoped);

        let election = Election::new(
            channel_name.clone(),
            block_path,
            socket_path.clone(),
            user_scoped,
        );
        let outcome = tokio::task::spawn_blocking(move || election.run(allow_secondary))
            .await
            .map_err(|e| UnisonError::internal(format!("election task failed: {e}")))??;

        let mut instance = Self {
            role: outcome.role,
            instance_id: outcome.instance_id,
            channel_name,
            socket_path,
            block: Mutex::new(outcome.block),
            client: None,
            server: None,
            events_rx: None,
        };

        match outcome.role {
            Role::Primary => {
                let Some(listener) = outcome.listener else {
                    return Err(UnisonError::internal("primary outcome without endpoint"));
                };

                let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
                let server = ChannelServer::start(
                    listener,
                    instance.channel_name.clone(),
                    options.contains(IdentityOptions::SECONDARY_NOTIFICATION),
                    events_tx,
                )?;

                instance.server = Some(server);
                instance.events_rx = Some(events_rx);
            }
            Role::Secondary => {
                let mut client = ChannelClient::new(
                    instance.channel_name.clone(),
                    instance.socket_path.clone(),
                    instance.instance_id,
                );

                if options.contains(IdentityOptions::SECONDARY_NOTIFICATION)
                    && !client
                        .connect_to_primary(timeout, ConnectionType::SecondaryInstance)
                        .await
                {
                    debug!("secondary announcement did not reach the primary");
                }

                instance.client = Some(client);
            }
            Role::Rejected => {
                let mut client = ChannelClient::new(
                    instance.channel_name.clone(),
                    instance.socket_path.clone(),
                    instance.instance_id,
                );

                if !client
                    .connect_to_primary(timeout, ConnectionType::NewInstance)
                    .await
                {
                    debug!("rejected-instance announcement did not reach the primary");
                }

                instance.client = Some(client);
            }
        }

        Ok(instance)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.role == Role::Secondary
    }

    /// This instance's id: 0 for the primary, the allocated counter value
    /// for a secondary, [`INSTANCE_UNASSIGNED`] for a rejected instance.
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Process id of the current primary, `-1` when none is registered.
    pub fn primary_pid(&self) -> Result<i64> {
        let mut block = self.block.lock();
        let guard = block.lock()?;
        Ok(guard.primary_pid())
    }

    /// OS username of the current primary's owner, empty when none.
    pub fn primary_user(&self) -> Result<String> {
        let mut block = self.block.lock();
        let guard = block.lock()?;
        Ok(guard.primary_user())
    }

    /// Deliver a payload to the primary. Only meaningful for non-primary
    /// roles; the primary gets `false` immediately.
    ///
    /// Returns whether the payload was fully written and flushed within
    /// `timeout`. Retrying is the caller's call.
    pub async fn send_message(&mut self, payload: &[u8], timeout: Duration) -> bool {
        if self.role == Role::Primary {
            return false;
        }

        let Some(client) = self.client.as_mut() else {
            return false;
        };

        client.send_payload(payload, timeout).await
    }

    /// Take the event receiver. Present exactly once, on the primary.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<InstanceEvent>> {
        self.events_rx.take()
    }
}

impl Drop for SingleInstance {
    fn drop(&mut self) {
        if self.role != Role::Primary {
            return;
        }

        if let Some(server) = self.server.take() {
            server.shutdown();
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    path = %self.socket_path.display(),
                    "failed to remove channel endpoint: {}", e
                );
            }
        }

        // Hand the channel identity back cleanly so the next election
        // does not have to wait out crash recovery
        let mut block = self.block.lock();
        match block.lock() {
            Ok(mut guard) => guard.clear_primary(),
            Err(e) => error!("failed to clear primary registration: {}", e),
        };
    }
}
