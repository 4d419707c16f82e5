//! The resource manager supervisor.
//!
//! Five managers back the server: the task scheduler, the timer service, the socket
//! multiplexer, the entropy source and the name hash. They are created together by
//! [`create_all`] in that order and destroyed together by [`destroy_all`]. The scheduler is
//! drained first on the way down since everything else may still be referenced by its tasks.
pub mod entropy;
pub mod hash;
pub mod socket;
pub mod task;
pub mod timer;

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::report::Reporter;
use crate::{invariant, unexpected_error};
use std::fmt;

pub use entropy::{EntropySource, FallbackEntropy};
pub use hash::NameHash;
pub use socket::{Registered, SocketManager, SocketSlot};
pub use task::{Spawner, TaskManager};
pub use timer::TimerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    Task,
    Timer,
    Socket,
    Entropy,
    Hash,
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ManagerKind::Task => "task",
            ManagerKind::Timer => "timer",
            ManagerKind::Socket => "socket",
            ManagerKind::Entropy => "entropy",
            ManagerKind::Hash => "hash",
        })
    }
}

/// Effective manager parameters, after auto-detection and platform limits have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    pub detected_cpus: usize,
    pub workers: usize,
    pub udp_listeners: usize,
    pub max_sockets: Option<usize>,
    pub max_udp: Option<u16>,
}

impl ManagerSettings {
    #[must_use]
    pub fn resolve(config: &RuntimeConfig, detected_cpus: usize, multi_listener: bool) -> Self {
        let workers = effective_workers(config.workers, detected_cpus);
        let udp_listeners =
            effective_udp_listeners(config.udp_listeners, detected_cpus, workers, multi_listener);
        Self {
            detected_cpus,
            workers,
            udp_listeners,
            max_sockets: config.max_sockets,
            max_udp: config.max_udp,
        }
    }
}

/// Worker threads to run: the requested count, or one per detected CPU when `requested` is 0.
/// Never less than one.
#[must_use]
pub fn effective_workers(requested: usize, detected_cpus: usize) -> usize {
    let workers = if requested == 0 {
        detected_cpus
    } else {
        requested
    };
    workers.max(1)
}

/// UDP listeners per interface. Auto mode leaves one CPU for everything else. Platforms that
/// can't share a port between sockets always get exactly one listener.
#[must_use]
pub fn effective_udp_listeners(
    requested: usize,
    detected_cpus: usize,
    workers: usize,
    multi_listener: bool,
) -> usize {
    if !multi_listener {
        return 1;
    }
    let listeners = if requested == 0 {
        detected_cpus.saturating_sub(1)
    } else {
        requested
    };
    listeners.min(workers).max(1)
}

pub(crate) fn plural(n: usize, one: &str, many: &str) -> String {
    format!("{n} {}", if n == 1 { one } else { many })
}

/// The live resource managers. Only [`create_all`] builds one and only [`destroy_all`] takes
/// one apart.
#[derive(Debug)]
pub struct ResourceManagerSet {
    settings: ManagerSettings,
    task: TaskManager,
    timer: TimerManager,
    socket: SocketManager,
    entropy: EntropySource,
    hash: NameHash,
}

impl ResourceManagerSet {
    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    #[must_use]
    pub fn task(&self) -> &TaskManager {
        &self.task
    }

    #[must_use]
    pub fn timer(&self) -> &TimerManager {
        &self.timer
    }

    #[must_use]
    pub fn socket(&self) -> &SocketManager {
        &self.socket
    }

    #[must_use]
    pub fn entropy(&self) -> &EntropySource {
        &self.entropy
    }

    #[must_use]
    pub fn hash(&self) -> &NameHash {
        &self.hash
    }
}

/// Create every resource manager, in dependency order.
///
/// # Errors
///
/// Returns [`Error::ManagerCreate`] naming the first manager that couldn't be created. The
/// failure has already been reported as unexpected; managers created before it are dropped.
pub fn create_all(
    settings: &ManagerSettings,
    fallback: Option<FallbackEntropy>,
    reporter: &Reporter,
) -> Result<ResourceManagerSet, Error> {
    let fail = |kind: ManagerKind, e: &dyn fmt::Display| {
        unexpected_error!(reporter, "{kind} manager creation failed: {e}");
        Error::ManagerCreate(kind, e.to_string())
    };

    tracing::info!(
        "found {}, using {}",
        plural(settings.detected_cpus, "CPU", "CPUs"),
        plural(settings.workers, "worker thread", "worker threads")
    );
    tracing::info!(
        "using {} per interface",
        plural(settings.udp_listeners, "UDP listener", "UDP listeners")
    );

    let task = TaskManager::create(settings.workers).map_err(|e| fail(ManagerKind::Task, &e))?;
    let timer = TimerManager::create(&task);
    let socket = SocketManager::create(&task, settings.max_sockets, settings.max_udp)
        .map_err(|e| fail(ManagerKind::Socket, &e))?;
    tracing::info!("using up to {}", plural(socket.max_sockets(), "socket", "sockets"));
    let entropy = EntropySource::create(fallback).map_err(|e| fail(ManagerKind::Entropy, &e))?;
    let hash = NameHash::create(&entropy).map_err(|e| fail(ManagerKind::Hash, &e))?;

    Ok(ResourceManagerSet {
        settings: *settings,
        task,
        timer,
        socket,
        entropy,
        hash,
    })
}

/// Destroy every resource manager and return the order they went down in. Blocks until all
/// work scheduled on the task scheduler has completed.
pub fn destroy_all(set: ResourceManagerSet) -> Vec<ManagerKind> {
    let ResourceManagerSet {
        task,
        timer,
        socket,
        entropy,
        hash,
        ..
    } = set;
    let mut order = Vec::with_capacity(5);
    let pending = task.destroy();
    // In-flight work may still hold the hash table.
    invariant!(pending == 0);
    order.push(ManagerKind::Task);
    timer.destroy();
    order.push(ManagerKind::Timer);
    socket.destroy();
    order.push(ManagerKind::Socket);
    entropy.destroy();
    order.push(ManagerKind::Entropy);
    hash.destroy();
    order.push(ManagerKind::Hash);
    order
}
