use super::{NofileChange, Platform, UserInfo, DEV_NULL};
use crate::error::Error;
use crate::managers::entropy::{FallbackEntropy, RANDOM_DEVICE};
use nix::sys::utsname;
use nix::unistd::{self, ForkResult, Gid, Uid, User};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// The [`Platform`] backed by the running system.
#[derive(Debug, Default)]
pub struct SystemPlatform {
    // Write end of the pipe the daemonization parent is blocked on.
    startup_pipe: Mutex<Option<OwnedFd>>,
}

impl SystemPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for SystemPlatform {
    fn detect_cpus(&self) -> usize {
        std::thread::available_parallelism().map_or(0, usize::from)
    }

    fn multi_listener_supported(&self) -> bool {
        cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "dragonfly"
        ))
    }

    fn resolve_identity(&self, name: &str) -> Result<UserInfo, Error> {
        let user = User::from_name(name)
            .map_err(|e| Error::UserLookup(name.to_string(), e))?
            .ok_or_else(|| Error::UnknownUser(name.to_string()))?;
        Ok(UserInfo {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }

    fn open_devnull(&self) -> Result<File, Error> {
        Ok(OpenOptions::new().read(true).write(true).open(DEV_NULL)?)
    }

    fn open_fallback_entropy(&self) -> Result<FallbackEntropy, Error> {
        Ok(FallbackEntropy::open(RANDOM_DEVICE)?)
    }

    fn chroot(&self, dir: &Path) -> Result<(), Error> {
        unistd::chroot(dir).map_err(|e| Error::Chroot(dir.to_path_buf(), e))?;
        unistd::chdir("/").map_err(|e| Error::Chroot(dir.to_path_buf(), e))
    }

    fn drop_privileges(&self, user: &UserInfo) -> Result<(), Error> {
        let uid = Uid::from_raw(user.uid);
        let gid = Gid::from_raw(user.gid);
        if unistd::geteuid() == uid && unistd::getegid() == gid {
            return Ok(());
        }
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        unistd::setgroups(&[gid]).map_err(|e| Error::Privileges("setgroups()", e))?;
        unistd::setgid(gid).map_err(|e| Error::Privileges("setgid()", e))?;
        unistd::setuid(uid).map_err(|e| Error::Privileges("setuid()", e))?;
        // A process that can still regain root hasn't really dropped anything.
        if unistd::setuid(Uid::from_raw(0)).is_ok() && user.uid != 0 {
            return Err(Error::Privileges("setuid()", nix::Error::EPERM));
        }
        Ok(())
    }

    fn daemonize(&self, devnull: &File) -> Result<(), Error> {
        let (read_end, write_end) =
            unistd::pipe().map_err(|e| Error::Daemonize(format!("pipe(): {e}")))?;
        // SAFETY: called from the only thread of the process; the task scheduler and every
        // other thread are created after this point.
        match unsafe { unistd::fork() }.map_err(|e| Error::Daemonize(format!("fork(): {e}")))? {
            ForkResult::Parent { .. } => {
                drop(write_end);
                let mut status = [0u8; 1];
                let ok = matches!(File::from(read_end).read(&mut status), Ok(1));
                std::process::exit(if ok { 0 } else { 1 });
            }
            ForkResult::Child => {
                drop(read_end);
                unistd::setsid().map_err(|e| Error::Daemonize(format!("setsid(): {e}")))?;
                for fd in [0, 1] {
                    unistd::dup2(devnull.as_raw_fd(), fd)
                        .map_err(|e| Error::Daemonize(format!("dup2(): {e}")))?;
                }
                *self
                    .startup_pipe
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(write_end);
                Ok(())
            }
        }
    }

    fn startup_complete(&self, devnull: &File) -> Result<(), Error> {
        let pipe = self
            .startup_pipe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pipe) = pipe else {
            return Ok(());
        };
        File::from(pipe)
            .write_all(&[1])
            .map_err(|e| Error::Daemonize(format!("notifying parent: {e}")))?;
        unistd::dup2(devnull.as_raw_fd(), 2)
            .map_err(|e| Error::Daemonize(format!("dup2(): {e}")))?;
        Ok(())
    }

    fn raise_nofile_limit(&self) -> Result<NofileChange, Error> {
        let (old, _) = rlimit::getrlimit(rlimit::Resource::NOFILE)?;
        let new = rlimit::increase_nofile_limit(u64::MAX)?;
        Ok(NofileChange { old, new })
    }

    #[cfg(target_os = "linux")]
    fn install_sandbox_filter(&self) -> Result<(), Error> {
        super::sandbox::install()
    }

    #[cfg(not(target_os = "linux"))]
    fn install_sandbox_filter(&self) -> Result<(), Error> {
        Err(Error::SandboxUnsupported)
    }

    fn uname(&self) -> String {
        match utsname::uname() {
            Ok(u) => format!(
                "{} {} {} {}",
                u.sysname().to_string_lossy(),
                u.release().to_string_lossy(),
                u.version().to_string_lossy(),
                u.machine().to_string_lossy()
            ),
            Err(_) => String::from("unavailable"),
        }
    }

    fn hostname(&self) -> String {
        utsname::uname().map_or_else(
            |_| String::from("localhost"),
            |u| u.nodename().to_string_lossy().into_owned(),
        )
    }
}
