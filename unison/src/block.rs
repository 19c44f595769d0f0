//! Instance-state block
//!
//! A fixed-layout record shared by every process of one channel identity.
//! It lives in a file-backed `MAP_SHARED` mapping under the endpoint
//! directory; `flock` on the backing file is the cross-process mutex, held
//! only for short read-check-write critical sections.
//!
//! The trailing checksum fingerprints the bytes before it in declaration
//! order, so `primary_user` is deliberately outside the checksummed range.
//! A mismatch between the stored and freshly computed checksum marks a torn
//! write from a crashed holder.
//!
//! # Memory Layout
//!
//! ```text
//! offset 0    is_primary       u8
//! offset 4    secondary_count  u32
//! offset 8    primary_pid      i64
//! offset 16   checksum         u16
//! offset 18   primary_user     [u8; 128], NUL-terminated
//! ```

use std::fs::OpenOptions;
use std::io;
use std::mem::offset_of;
use std::ops::{Deref, DerefMut};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::{debug, error};

use unison_protocol::crc16;
use unison_utils::{ensure_dir, Result, UnisonError};

/// Capacity of the registered primary-user field, NUL included.
pub const PRIMARY_USER_LEN: usize = 128;

/// `primary_pid` value when no primary is registered.
pub const NO_PRIMARY_PID: i64 = -1;

/// The process-shared election record.
#[repr(C)]
pub struct BlockData {
    is_primary: u8,
    secondary_count: u32,
    primary_pid: i64,
    checksum: u16,
    primary_user: [u8; PRIMARY_USER_LEN],
}

/// Bytes covered by the checksum: everything declared before it.
const CHECKSUM_RANGE: usize = offset_of!(BlockData, checksum);

const _: () = assert!(offset_of!(BlockData, is_primary) == 0);
const _: () = assert!(offset_of!(BlockData, secondary_count) == 4);
const _: () = assert!(offset_of!(BlockData, primary_pid) == 8);
const _: () = assert!(offset_of!(BlockData, checksum) == 16);
const _: () = assert!(offset_of!(BlockData, primary_user) == 18);
const _: () = assert!(std::mem::size_of::<BlockData>() == 152);

impl BlockData {
    /// A fully zeroed record, as a freshly truncated backing file holds.
    #[cfg(test)]
    pub(crate) fn zeroed() -> Self {
        // SAFETY: all fields are plain integers and arrays; zero is a valid
        // bit pattern for every one of them
        unsafe { std::mem::zeroed() }
    }

    /// Raw view of the checksummed range.
    fn checksummed_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) fixes the layout; CHECKSUM_RANGE never exceeds
        // the struct size, and the block always lives in initialized
        // (zero-filled, then field-written) memory
        unsafe { std::slice::from_raw_parts((self as *const Self).cast::<u8>(), CHECKSUM_RANGE) }
    }

    /// Checksum freshly computed over the record's current contents.
    pub fn computed_checksum(&self) -> u16 {
        crc16(self.checksummed_bytes())
    }

    /// The checksum stored by the last writer.
    pub fn stored_checksum(&self) -> u16 {
        self.checksum
    }

    /// Whether the stored checksum matches the record's contents.
    pub fn is_consistent(&self) -> bool {
        self.checksum == self.computed_checksum()
    }

    /// Reset to the no-primary defaults and restamp the checksum.
    pub fn reset(&mut self) {
        self.is_primary = 0;
        self.secondary_count = 0;
        self.primary_pid = NO_PRIMARY_PID;
        self.primary_user = [0; PRIMARY_USER_LEN];
        self.checksum = self.computed_checksum();
    }

    /// Register the calling process as primary.
    pub fn publish_primary(&mut self, pid: i64, user: &str) {
        self.is_primary = 1;
        self.primary_pid = pid;

        let bytes = user.as_bytes();
        let len = bytes.len().min(PRIMARY_USER_LEN - 1);
        self.primary_user = [0; PRIMARY_USER_LEN];
        self.primary_user[..len].copy_from_slice(&bytes[..len]);

        self.checksum = self.computed_checksum();
    }

    /// Clear the primary registration on clean shutdown. The secondary
    /// counter is left alone so ids stay unique across primary turnover.
    pub fn clear_primary(&mut self) {
        self.is_primary = 0;
        self.primary_pid = NO_PRIMARY_PID;
        self.primary_user = [0; PRIMARY_USER_LEN];
        self.checksum = self.computed_checksum();
    }

    /// Allocate the next secondary instance id.
    pub fn register_secondary(&mut self) -> u32 {
        self.secondary_count += 1;
        self.checksum = self.computed_checksum();
        self.secondary_count
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary != 0
    }

    pub fn secondary_count(&self) -> u32 {
        self.secondary_count
    }

    pub fn primary_pid(&self) -> i64 {
        self.primary_pid
    }

    /// The registered primary's username, up to the first NUL.
    pub fn primary_user(&self) -> String {
        let len = self
            .primary_user
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PRIMARY_USER_LEN);
        String::from_utf8_lossy(&self.primary_user[..len]).into_owned()
    }
}

/// Handle to the mapped, lockable instance-state block.
#[derive(Debug)]
pub struct SharedBlock {
    file: std::fs::File,
    data: NonNull<BlockData>,
    path: PathBuf,
    created: bool,
}

// SAFETY: the mapping is plain shared memory; every access goes through
// BlockGuard, which holds both the exclusive borrow and the file lock
unsafe impl Send for SharedBlock {}

impl SharedBlock {
    /// Open the block for `path`, creating and initializing it when this
    /// process wins the creation race, attaching otherwise.
    ///
    /// Failing to create *and* failing to attach means this process cannot
    /// determine uniqueness; both paths surface a fatal error.
    pub fn open(path: &Path, user_scoped: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(&parent.to_path_buf()).map_err(|e| UnisonError::BlockCreate {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let create = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path);

        match create {
            Ok(file) => {
                // Machine-scoped blocks must stay lockable by other users
                if !user_scoped {
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
                        .map_err(|e| UnisonError::BlockCreate {
                            path: path.to_path_buf(),
                            source: e,
                        })?;
                }

                let mut block = Self::map(file, path, true)?;
                let mut guard = block.lock()?;
                guard.reset();
                drop(guard);

                debug!(path = %path.display(), "created instance block");
                Ok(block)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| UnisonError::BlockAttach {
                        path: path.to_path_buf(),
                        source: e,
                    })?;

                let block = Self::map(file, path, false)?;
                debug!(path = %path.display(), "attached to instance block");
                Ok(block)
            }
            Err(e) => Err(UnisonError::BlockCreate {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn map(file: std::fs::File, path: &Path, created: bool) -> Result<Self> {
        let wrap = |source: io::Error| {
            if created {
                UnisonError::BlockCreate {
                    path: path.to_path_buf(),
                    source,
                }
            } else {
                UnisonError::BlockAttach {
                    path: path.to_path_buf(),
                    source,
                }
            }
        };

        let size = std::mem::size_of::<BlockData>() as u64;

        // Both creator and attacher extend the file: an attacher can race
        // in between the creator's open and truncate, and mapping past EOF
        // faults on first access. Extending to the same size is idempotent.
        let current = file.metadata().map_err(wrap)?.len();
        if current < size {
            file.set_len(size).map_err(wrap)?;
        }

        // SAFETY: fd is valid, length matches the truncated file, and we
        // hand the pointer to exactly one SharedBlock that munmaps on drop
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(wrap(io::Error::last_os_error()));
        }

        let data = NonNull::new(ptr.cast::<BlockData>())
            .ok_or_else(|| wrap(io::Error::other("mmap returned null")))?;

        Ok(Self {
            file,
            data,
            path: path.to_path_buf(),
            created,
        })
    }

    /// Whether this process created (and initialized) the block.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the block's cross-process lock, blocking until it is free.
    ///
    /// The exclusive borrow keeps a single handle from taking the lock
    /// twice; `flock` arbitrates between processes (and between separately
    /// opened handles in one process).
    pub fn lock(&mut self) -> Result<BlockGuard<'_>> {
        loop {
            // SAFETY: the fd lives as long as self
            let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(BlockGuard { block: self });
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(UnisonError::BlockLock(err));
        }
    }
}

impl Drop for SharedBlock {
    fn drop(&mut self) {
        // SAFETY: pointer and length are the ones returned by mmap
        let rc = unsafe {
            libc::munmap(
                self.data.as_ptr().cast::<libc::c_void>(),
                std::mem::size_of::<BlockData>(),
            )
        };
        if rc != 0 {
            error!(
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "munmap failed for instance block"
            );
        }
    }
}

/// RAII view of the locked block. Unlocks on drop.
pub struct BlockGuard<'a> {
    block: &'a mut SharedBlock,
}

impl Deref for BlockGuard<'_> {
    type Target = BlockData;

    fn deref(&self) -> &BlockData {
        // SAFETY: mapping is live for the guard's lifetime and the lock is
        // held, so no other process writes concurrently
        unsafe { self.block.data.as_ref() }
    }
}

impl DerefMut for BlockGuard<'_> {
    fn deref_mut(&mut self) -> &mut BlockData {
        // SAFETY: as above, plus the exclusive borrow of the SharedBlock
        unsafe { self.block.data.as_mut() }
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: fd is valid; releasing a held flock cannot fail for a
        // reason we could act on
        let rc = unsafe { libc::flock(self.block.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            error!(
                error = %io::Error::last_os_error(),
                "failed to unlock instance block"
            );
        }
    }
}
