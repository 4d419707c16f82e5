//! Privilege and sandbox sequencing.
//!
//! The [`Sequencer`] performs the privilege-sensitive steps of startup in their only valid
//! order: resolve the target identity, change the root directory, drop privileges, detach from
//! the terminal, and finally install the syscall filter. Each step can happen at most once.
//! Running a step twice, or before the step it depends on, is a programming error and panics
//! through [`require!`][crate::require] rather than returning an error.
use crate::error::Error;
use crate::os::{Platform, UserInfo};
use crate::require;
use std::fs::File;
use std::path::Path;

/// The privilege transitions taken so far. Transitions are one-way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrivilegeState {
    pub identity_resolved: bool,
    pub chrooted: bool,
    pub privileges_dropped: bool,
    pub daemonized: bool,
    pub filter_installed: bool,
}

pub struct Sequencer<'a> {
    platform: &'a dyn Platform,
    state: PrivilegeState,
    identity: Option<UserInfo>,
}

impl<'a> Sequencer<'a> {
    #[must_use]
    pub fn new(platform: &'a dyn Platform) -> Self {
        Self {
            platform,
            state: PrivilegeState::default(),
            identity: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> PrivilegeState {
        self.state
    }

    #[must_use]
    pub fn identity(&self) -> Option<&UserInfo> {
        self.identity.as_ref()
    }

    /// Resolve the user to run as. With no user the process keeps its current identity.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::UnknownUser`] and [`Error::UserLookup`] from the platform.
    pub fn resolve_identity(&mut self, username: Option<&str>) -> Result<Option<&UserInfo>, Error> {
        require!(!self.state.identity_resolved);
        if let Some(name) = username {
            let user = self.platform.resolve_identity(name)?;
            tracing::debug!(user = %user.name, uid = user.uid, gid = user.gid, "identity resolved");
            self.identity = Some(user);
        }
        self.state.identity_resolved = true;
        Ok(self.identity.as_ref())
    }

    /// Confine the process to `dir`. With no directory this step is a no-op but still counts as
    /// taken.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Chroot`] from the platform.
    pub fn apply_chroot(&mut self, dir: Option<&Path>) -> Result<(), Error> {
        require!(self.state.identity_resolved);
        require!(!self.state.chrooted && !self.state.privileges_dropped);
        if let Some(dir) = dir {
            self.platform.chroot(dir)?;
        }
        self.state.chrooted = true;
        Ok(())
    }

    /// Switch to the resolved identity, if there is one.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Privileges`] from the platform.
    pub fn drop_privileges(&mut self) -> Result<(), Error> {
        require!(self.state.chrooted && !self.state.privileges_dropped);
        if let Some(user) = &self.identity {
            self.platform.drop_privileges(user)?;
        }
        self.state.privileges_dropped = true;
        Ok(())
    }

    /// Detach from the controlling terminal, with standard input and output on `devnull`.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Daemonize`] from the platform.
    pub fn daemonize(&mut self, devnull: &File) -> Result<(), Error> {
        require!(self.state.privileges_dropped && !self.state.daemonized);
        self.platform.daemonize(devnull)?;
        self.state.daemonized = true;
        Ok(())
    }

    /// Install the syscall allow-list.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Sandbox`] and [`Error::SandboxUnsupported`] from the platform.
    pub fn install_sandbox_filter(&mut self) -> Result<(), Error> {
        require!(self.state.privileges_dropped && !self.state.filter_installed);
        self.platform.install_sandbox_filter()?;
        self.state.filter_installed = true;
        Ok(())
    }
}
