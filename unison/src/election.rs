//! Instance election
//!
//! Decides which of three roles this process gets for a channel identity:
//! primary (listens), secondary (allowed to coexist, gets a fresh instance
//! id), or rejected (must not run; the caller decides what to do with
//! that). The decision is a read-check-write on the instance-state block
//! under its cross-process lock.
//!
//! A crashed primary can leave the block torn. The consistency wait loop
//! tolerates that for a bounded window: retry with a small randomized
//! backoff (so racing processes desynchronize), then assume the writer died
//! and reinitialize. Recovery is deterministic, never an indefinite retry.

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use unison_protocol::INSTANCE_UNASSIGNED;
use unison_utils::{username, Result};

use crate::block::SharedBlock;
use crate::server;

/// How long a torn block is retried before it is declared abandoned.
pub const DEFAULT_CONSISTENCY_DEADLINE: Duration = Duration::from_secs(5);

/// Backoff bounds between consistency retries, in milliseconds.
const BACKOFF_MIN_MS: u64 = 8;
const BACKOFF_MAX_MS: u64 = 18;

/// The role the election assigned to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single listening instance for this channel identity.
    Primary,
    /// A permitted additional instance.
    Secondary,
    /// An instance that must not run; the caller is expected to exit after
    /// optionally messaging the primary.
    Rejected,
}

/// What the election decided, with the role-specific spoils.
pub struct ElectionOutcome {
    pub role: Role,
    /// 0 for the primary, the freshly allocated counter value for a
    /// secondary, the unassigned sentinel for a rejected instance.
    pub instance_id: u32,
    /// The block handle, kept for queries and shutdown bookkeeping.
    pub block: SharedBlock,
    /// The bound endpoint, present exactly for the primary. Bound while
    /// the block lock was still held, so no other process can have won.
    pub listener: Option<UnixListener>,
}

/// Coordinator for one election attempt.
pub struct Election {
    channel_name: String,
    block_path: PathBuf,
    socket_path: PathBuf,
    user_scoped: bool,
    consistency_deadline: Duration,
}

impl Election {
    pub fn new(
        channel_name: impl Into<String>,
        block_path: impl Into<PathBuf>,
        socket_path: impl Into<PathBuf>,
        user_scoped: bool,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            block_path: block_path.into(),
            socket_path: socket_path.into(),
            user_scoped,
            consistency_deadline: DEFAULT_CONSISTENCY_DEADLINE,
        }
    }

    /// Override the torn-block deadline. Tests use this to exercise the
    /// recovery path without waiting out the full window.
    pub fn with_consistency_deadline(mut self, deadline: Duration) -> Self {
        self.consistency_deadline = deadline;
        self
    }

    /// Run the election to completion. Blocks the calling thread (lock
    /// waits and backoff sleeps); drive it from a blocking-friendly
    /// context.
    pub fn run(&self, allow_secondary: bool) -> Result<ElectionOutcome> {
        let mut block = SharedBlock::open(&self.block_path, self.user_scoped)?;
        let start = Instant::now();

        loop {
            let mut guard = block.lock()?;

            if !guard.is_consistent() {
                if start.elapsed() < self.consistency_deadline {
                    drop(guard);
                    // Randomized so two racing processes fall out of step
                    std::thread::sleep(Duration::from_millis(fastrand::u64(
                        BACKOFF_MIN_MS..=BACKOFF_MAX_MS,
                    )));
                    continue;
                }

                warn!(
                    channel = %self.channel_name,
                    "instance block stayed inconsistent past the deadline; \
                     assuming a crashed primary and reinitializing"
                );
                guard.reset();
            }

            // Block is consistent and the lock is held: decide.
            if !guard.is_primary() {
                let listener = server::bind_endpoint(&self.socket_path, self.user_scoped)?;
                guard.publish_primary(std::process::id() as i64, &username());
                drop(guard);

                info!(channel = %self.channel_name, "elected primary");
                return Ok(ElectionOutcome {
                    role: Role::Primary,
                    instance_id: 0,
                    block,
                    listener: Some(listener),
                });
            }

            if allow_secondary {
                let instance_id = guard.register_secondary();
                drop(guard);

                info!(
                    channel = %self.channel_name,
                    instance_id, "primary exists, joining as secondary"
                );
                return Ok(ElectionOutcome {
                    role: Role::Secondary,
                    instance_id,
                    block,
                    listener: None,
                });
            }

            drop(guard);
            debug!(channel = %self.channel_name, "primary exists, instance rejected");
            return Ok(ElectionOutcome {
                role: Role::Rejected,
                instance_id: INSTANCE_UNASSIGNED,
                block,
                listener: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Paths {
        _dir: tempfile::TempDir,
        block: PathBuf,
        socket: PathBuf,
    }

    fn paths() -> Paths {
        let dir = tempfile::tempdir().unwrap();
        Paths {
            block: dir.path().join("chan.block"),
            socket: dir.path().join("chan.sock"),
            _dir: dir,
        }
    }

    fn election(p: &Paths) -> Election {
        Election::new("chan", p.block.clone(), p.socket.clone(), true)
    }

    #[test]
    fn test_first_process_becomes_primary() {
        let p = paths();
        let outcome = election(&p).run(true).unwrap();

        assert_eq!(outcome.role, Role::Primary);
        assert_eq!(outcome.instance_id, 0);
        assert!(outcome.listener.is_some());
        assert!(p.socket.exists());
    }

    #[test]
    fn test_second_process_becomes_secondary_with_increasing_ids() {
        let p = paths();
        let primary = election(&p).run(true).unwrap();

        let second = election(&p).run(true).unwrap();
        assert_eq!(second.role, Role::Secondary);
        assert_eq!(second.instance_id, 1);
        assert!(second.listener.is_none());

        let third = election(&p).run(true).unwrap();
        assert_eq!(third.role, Role::Secondary);
        assert_eq!(third.instance_id, 2);

        drop(primary);
    }

    #[test]
    fn test_second_process_rejected_when_secondaries_disallowed() {
        let p = paths();
        let _primary = election(&p).run(false).unwrap();

        let second = election(&p).run(false).unwrap();
        assert_eq!(second.role, Role::Rejected);
        assert_eq!(second.instance_id, INSTANCE_UNASSIGNED);
    }

    #[test]
    fn test_corrupted_block_recovers_after_deadline() {
        let p = paths();

        // A primary registers, then dies leaving a torn record: the
        // counter bytes change but the stored checksum does not.
        {
            let mut block = SharedBlock::open(&p.block, true).unwrap();
            block.lock().unwrap().publish_primary(12345, "ghost");
        }
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(&p.block)
                .unwrap();
            f.seek(SeekFrom::Start(4)).unwrap();
            f.write_all(&0xdead_beef_u32.to_ne_bytes()).unwrap();
        }

        let outcome = election(&p)
            .with_consistency_deadline(Duration::from_millis(120))
            .run(true)
            .unwrap();

        // Recovery reinitialized the block, so this process won primary
        assert_eq!(outcome.role, Role::Primary);
        assert_eq!(outcome.instance_id, 0);
    }

    #[test]
    fn test_racing_elections_elect_exactly_one_primary() {
        let p = paths();
        let mut handles = Vec::new();

        for _ in 0..8 {
            let election = election(&p);
            handles.push(std::thread::spawn(move || election.run(true).unwrap()));
        }

        let outcomes: Vec<ElectionOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let primaries = outcomes
            .iter()
            .filter(|o| o.role == Role::Primary)
            .count();
        assert_eq!(primaries, 1);

        let mut ids: Vec<u32> = outcomes
            .iter()
            .filter(|o| o.role == Role::Secondary)
            .map(|o| o.instance_id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=7).collect::<Vec<u32>>());
    }
}
