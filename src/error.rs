//! Error types.

use crate::managers::ManagerKind;
use std::path::PathBuf;
use trust_dns_server::proto::error::ProtoError;

/// Error enumerates the possible namecrab error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a [`RuntimeConfig`][crate::config::RuntimeConfig] value is out of range or
    /// two settings contradict each other.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned when the `-T` option is given a value that isn't a known test toggle.
    #[error("unrecognized test option '{0}'")]
    UnknownTestOption(String),

    /// Returned when the user named by [`RuntimeConfig::user`][crate::config::RuntimeConfig::user]
    /// isn't present in the user database.
    #[error("user '{0}' unknown")]
    UnknownUser(String),

    /// Returned when the user database itself can't be queried.
    #[error("getpwnam('{0}') failed: {1}")]
    UserLookup(String, #[source] nix::Error),

    /// Returned when changing the root directory fails.
    #[error("chroot(): {1} ({0})")]
    Chroot(PathBuf, #[source] nix::Error),

    /// Returned when the process can't switch to the target user or group.
    #[error("{0}: {1}")]
    Privileges(&'static str, #[source] nix::Error),

    /// Returned when detaching from the controlling terminal fails.
    #[error("daemonize: {0}")]
    Daemonize(String),

    /// Returned when the syscall filter can't be built or loaded.
    #[error("sandbox: {0}")]
    Sandbox(String),

    /// Returned when the syscall filter isn't available on this platform.
    #[error("sandboxing is not supported on this platform")]
    SandboxUnsupported,

    /// Returned when one of the resource managers can't be created.
    #[error("{0} manager creation failed: {1}")]
    ManagerCreate(ManagerKind, String),

    /// Returned when the socket manager's ceiling has been reached.
    #[error("socket ceiling of {0} reached")]
    SocketCeiling(usize),

    /// Returned when the logging subsystem can't be set up.
    #[error("logging: {0}")]
    Logging(String),

    /// Returned by the server context when it can't be created, started or reloaded.
    #[error("server: {0}")]
    Server(String),

    /// Returned when a backend driver can't be registered.
    #[error("backend '{0}': {1}")]
    Backend(String, String),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when processing a JSON configuration file fails due to invalid JSON content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when the name server encounters a generic DNS protocol error.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),
}
