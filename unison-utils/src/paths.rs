//! Path utilities for unison
//!
//! Resolves where a channel's rendezvous files live. User-scoped channels
//! use the XDG runtime directory (private to the user); machine-scoped
//! channels need a directory every local user can reach, so they fall back
//! to a fixed location under `/tmp`.

use std::path::PathBuf;

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "unison";

/// Get project directories (cached)
fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the directory holding a channel's socket and state block
///
/// User scope: `$XDG_RUNTIME_DIR/unison` or `/tmp/unison-$UID`.
/// Machine scope: `/tmp/unison` (all local users must be able to reach the
/// rendezvous).
pub fn endpoint_dir(user_scoped: bool) -> PathBuf {
    if user_scoped {
        if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
            return PathBuf::from(xdg_runtime).join(APP_NAME);
        }
        // Fallback to /tmp with UID for security
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    } else {
        PathBuf::from("/tmp").join(APP_NAME)
    }
}

/// Get the local socket path for a channel name
pub fn socket_path(channel_name: &str, user_scoped: bool) -> PathBuf {
    endpoint_dir(user_scoped).join(format!("{channel_name}.sock"))
}

/// Get the instance-state block path for a channel name
pub fn block_path(channel_name: &str, user_scoped: bool) -> PathBuf {
    endpoint_dir(user_scoped).join(format!("{channel_name}.block"))
}

/// Get the state directory (persistent state)
///
/// Location: `$XDG_STATE_HOME/unison` or `~/.local/state/unison`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(fallback_state_dir)
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/unison/log` or `~/.local/state/unison/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &PathBuf) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

// Fallback implementations when ProjectDirs is unavailable

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn fallback_state_dir() -> PathBuf {
    home_dir().join(".local").join("state").join(APP_NAME)
}
