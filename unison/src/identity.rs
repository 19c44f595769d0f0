//! Application identity and channel naming
//!
//! The channel name doubles as a shared-memory key and a socket address, so
//! it has to be stable across processes of the same application and
//! collision-resistant against unrelated applications. A SHA-256 digest of
//! the identity fields, base64-encoded with `/` swapped out, satisfies both
//! naming namespaces.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitflags::bitflags;
use sha2::{Digest, Sha256};

use unison_utils::username;

/// Protocol tag mixed into every channel name, so unison channels can never
/// collide with another protocol hashing similar fields.
const PROTOCOL_TAG: &[u8] = b"UnisonInstance";

bitflags! {
    /// Election and naming options, combinable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IdentityOptions: u8 {
        /// Scope uniqueness and channel access to the current OS user.
        const USER = 0b0001;
        /// Have secondaries announce themselves to the primary.
        const SECONDARY_NOTIFICATION = 0b0010;
        /// Omit the application version from the identity hash.
        const EXCLUDE_APP_VERSION = 0b0100;
        /// Omit the executable path from the identity hash.
        const EXCLUDE_APP_PATH = 0b1000;
    }
}

/// The application identity a channel name is derived from.
///
/// `app_path` is fed into the hash as given; callers that want symlink or
/// case normalization normalize before constructing the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub app_name: String,
    pub org_name: String,
    pub org_domain: String,
    pub app_version: String,
    pub app_path: PathBuf,
}

impl AppIdentity {
    /// Build an identity with the executable path taken from the running
    /// process and no version. Set a version with [`Self::with_version`]
    /// when upgrades should not share a channel.
    pub fn new(
        app_name: impl Into<String>,
        org_name: impl Into<String>,
        org_domain: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            org_name: org_name.into(),
            org_domain: org_domain.into(),
            app_version: String::new(),
            app_path: std::env::current_exe().unwrap_or_default(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.app_path = path.into();
        self
    }

    /// Derive the channel name for this identity under the given options.
    ///
    /// Deterministic; contains only `[A-Za-z0-9+_=]`, legal in both socket
    /// and shared-block file names.
    pub fn channel_name(&self, options: IdentityOptions) -> String {
        let mut hasher = Sha256::new();

        hasher.update(PROTOCOL_TAG);
        hasher.update(self.app_name.as_bytes());
        hasher.update(self.org_name.as_bytes());
        hasher.update(self.org_domain.as_bytes());

        if !options.contains(IdentityOptions::EXCLUDE_APP_VERSION) {
            hasher.update(self.app_version.as_bytes());
        }

        if !options.contains(IdentityOptions::EXCLUDE_APP_PATH) {
            hasher.update(self.app_path.to_string_lossy().as_bytes());
        }

        // User-scoped uniqueness needs user-specific data in the hash
        if options.contains(IdentityOptions::USER) {
            hasher.update(username().as_bytes());
        }

        BASE64.encode(hasher.finalize()).replace('/', "_")
    }
}
