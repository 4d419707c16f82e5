//! Operating system services used during bootstrap.
//!
//! Everything privilege-sensitive or process-global (user database, chroot, setuid, fork,
//! syscall filtering, resource limits) goes through the [`Platform`] trait so the bootstrap
//! sequence can be driven against a recording implementation in tests. [`SystemPlatform`] is
//! the real thing.
#[cfg(target_os = "linux")]
mod sandbox;
mod unix;

use crate::error::Error;
use crate::managers::FallbackEntropy;
use std::fs::File;
use std::path::Path;

pub use unix::SystemPlatform;

/// Path of the null device opened before the root directory changes.
pub const DEV_NULL: &str = "/dev/null";

/// A resolved account from the user database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

/// Soft open-files limit before and after [`Platform::raise_nofile_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NofileChange {
    pub old: u64,
    pub new: u64,
}

pub trait Platform: Send + Sync {
    /// Number of CPUs available to the process, or 0 when it can't be determined.
    fn detect_cpus(&self) -> usize;

    /// Whether several UDP sockets can be bound to the same address.
    fn multi_listener_supported(&self) -> bool;

    /// Look up `name` in the user database.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownUser`] when there is no such user and [`Error::UserLookup`] when the
    /// database can't be queried.
    fn resolve_identity(&self, name: &str) -> Result<UserInfo, Error>;

    /// # Errors
    ///
    /// [`Error::IO`] when the null device can't be opened.
    fn open_devnull(&self) -> Result<File, Error>;

    /// # Errors
    ///
    /// [`Error::IO`] when the random device can't be opened.
    fn open_fallback_entropy(&self) -> Result<FallbackEntropy, Error>;

    /// # Errors
    ///
    /// [`Error::Chroot`] when the root directory can't be changed.
    fn chroot(&self, dir: &Path) -> Result<(), Error>;

    /// Switch the process to `user`'s group and user IDs. Irreversible.
    ///
    /// # Errors
    ///
    /// [`Error::Privileges`] naming the call that failed.
    fn drop_privileges(&self, user: &UserInfo) -> Result<(), Error>;

    /// Detach from the controlling terminal. Only the child returns; the parent waits for
    /// [`Platform::startup_complete`] and exits with the child's startup status.
    ///
    /// # Errors
    ///
    /// [`Error::Daemonize`] when fork or session creation fails.
    fn daemonize(&self, devnull: &File) -> Result<(), Error>;

    /// Tell a waiting daemonization parent that startup succeeded, then point standard error
    /// at `devnull`. Does nothing when the process didn't daemonize.
    ///
    /// # Errors
    ///
    /// [`Error::Daemonize`] when the parent can't be notified.
    fn startup_complete(&self, devnull: &File) -> Result<(), Error>;

    /// Raise the soft open-files limit as far as the hard limit allows.
    ///
    /// # Errors
    ///
    /// [`Error::IO`] when the limits can't be read or set.
    fn raise_nofile_limit(&self) -> Result<NofileChange, Error>;

    /// Restrict the process to the system calls a running server needs. Irreversible.
    ///
    /// # Errors
    ///
    /// [`Error::SandboxUnsupported`] on platforms without syscall filtering and
    /// [`Error::Sandbox`] when the filter can't be built or loaded.
    fn install_sandbox_filter(&self) -> Result<(), Error>;

    /// Kernel name, release, version and machine.
    fn uname(&self) -> String;

    fn hostname(&self) -> String;
}
