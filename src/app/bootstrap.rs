//! The bootstrap orchestrator.
//!
//! [`Bootstrap::run`] takes the process from a parsed configuration to a running server and back
//! down again. Everything that needs privileges or the real root directory happens before the
//! root changes and privileges are dropped; everything that starts threads happens after the
//! process has detached from the terminal.
//!
//! Failures before a server context exists are fatal and terminate through
//! [`Reporter::early_fatal`]. Once a server exists, failures are reported, the process is torn
//! down by the [shutdown supervisor][super::shutdown] and the outcome carries
//! [`ExitStatus::Failure`].
use super::run_loop::{LoopExit, RunLoop};
use super::shutdown::{self, Teardown, TeardownReport};
use super::{signals, EventReceiver, ExitStatus};
use crate::backends::{BackendRegistry, BuiltinNames, HostsBackend};
use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::log::{LogCategory, LogContext, LogModule, LogSettings, Severity};
use crate::managers::{self, ManagerSettings, ResourceManagerSet};
use crate::os::Platform;
use crate::privilege::{PrivilegeState, Sequencer};
use crate::report::Reporter;
use crate::server::{ServerContext, ServerFactory, ServerResources};
use crate::unexpected_error;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

/// What happened to a process that ran through [`Bootstrap::run`] and returned.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: ExitStatus,
    /// How the run loop ended; `None` when the server failed before the loop started.
    pub loop_exit: Option<LoopExit>,
    pub settings: ManagerSettings,
    pub privilege: PrivilegeState,
    pub reloads: u64,
    pub teardown: TeardownReport,
}

pub struct Bootstrap<'a> {
    reporter: &'a Reporter,
    platform: &'a dyn Platform,
    factory: &'a dyn ServerFactory,
    events: Option<EventReceiver>,
    log: Option<LogContext>,
    command_line: Vec<String>,
}

impl<'a> Bootstrap<'a> {
    #[must_use]
    pub fn new(
        reporter: &'a Reporter,
        platform: &'a dyn Platform,
        factory: &'a dyn ServerFactory,
    ) -> Self {
        Self {
            reporter,
            platform,
            factory,
            events: None,
            log: None,
            command_line: std::env::args().collect(),
        }
    }

    /// Feed the run loop from `events` instead of installing signal handlers.
    #[must_use]
    pub fn with_events(mut self, events: EventReceiver) -> Self {
        self.events = Some(events);
        self
    }

    /// Use `log` instead of building the log context from the configuration.
    #[must_use]
    pub fn with_log_context(mut self, log: LogContext) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub fn with_command_line(mut self, args: Vec<String>) -> Self {
        self.command_line = args;
        self
    }

    /// Run the process to completion. Only returns once the run loop has ended and everything
    /// has been torn down; fatal startup errors don't return at all.
    pub fn run(mut self, config: &RuntimeConfig) -> Outcome {
        let started = Instant::now();
        let reporter = self.reporter;
        let platform = self.platform;

        if !config.config_file_reachable_after_chroot() {
            reporter.early_warning(&format!(
                "config file {} is outside the chroot directory; reloads will read {}",
                config.config_file.display(),
                config.reload_path().display()
            ));
        }

        let mut sequencer = Sequencer::new(platform);
        if let Err(e) = sequencer.resolve_identity(config.user.as_deref()) {
            self.fatal(&e);
        }

        let daemonize = config.daemonizes();
        let devnull = if daemonize {
            match platform.open_devnull() {
                Ok(file) => Some(file),
                Err(e) => self.fatal_in("opening /dev/null", &e),
            }
        } else {
            None
        };

        let fallback_entropy = match config.chroot {
            Some(_) => match platform.open_fallback_entropy() {
                Ok(source) => Some(source),
                Err(e) => {
                    reporter.early_warning(&format!(
                        "could not open entropy source: {}",
                        describe(&e)
                    ));
                    None
                }
            },
            None => None,
        };

        let settings = ManagerSettings::resolve(
            config,
            platform.detect_cpus(),
            platform.multi_listener_supported(),
        );

        if let Err(e) = sequencer.apply_chroot(config.chroot.as_deref()) {
            self.fatal(&e);
        }
        if let Err(e) = sequencer.drop_privileges() {
            self.fatal(&e);
        }

        let log = match self.log.take() {
            Some(log) => log,
            None => match LogContext::init(&LogSettings::from_config(config)) {
                Ok(log) => log,
                Err(e) => self.fatal(&e),
            },
        };
        let _log_guard = log.set_thread_default();
        reporter.attach_log(log.clone());

        if let Some(devnull) = &devnull {
            if let Err(e) = sequencer.daemonize(devnull) {
                self.fatal(&e);
            }
        }

        notice(
            &log,
            &format!(
                "starting {} {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
        );
        notice(&log, &format!("running on {}", platform.uname()));
        notice(&log, &format!("command line: {}", self.command_line.join(" ")));
        if let Some(user) = sequencer.identity() {
            notice(
                &log,
                &format!("running as {} (uid {}, gid {})", user.name, user.uid, user.gid),
            );
        }

        match platform.raise_nofile_limit() {
            Ok(change) if change.new != change.old => notice(
                &log,
                &format!("raised open files limit from {} to {}", change.old, change.new),
            ),
            Ok(change) => log.write(
                LogCategory::General,
                LogModule::Main,
                Severity::Debug,
                &format!("open files limit unchanged at {}", change.new),
            ),
            Err(e) => reporter.early_warning(&format!(
                "could not raise open files limit: {}",
                describe(&e)
            )),
        }

        let managers = match managers::create_all(&settings, fallback_entropy.clone(), reporter) {
            Ok(set) => set,
            Err(e) => self.fatal_in("creating managers", &e),
        };

        let builtin = Arc::new(BuiltinNames::new(&platform.hostname()));
        let backends = Arc::new(BackendRegistry::new());
        if let Some(path) = &config.server.hosts_file {
            let registered = HostsBackend::load(path)
                .and_then(|hosts| backends.register(Arc::new(hosts)));
            if let Err(e) = registered {
                self.fatal_in("registering backend drivers", &e);
            }
        }
        tracing::debug!(
            builtin = builtin.len(),
            backends = ?backends.names(),
            "name sources ready"
        );

        let server = self.factory.create(ServerResources {
            managers: &managers,
            config,
            builtin: Arc::clone(&builtin),
            backends: Arc::clone(&backends),
        });
        let mut server = match server {
            Ok(server) => server,
            Err(e) => self.fatal_in("creating server", &e),
        };

        let mut run_loop = RunLoop::new();
        let (status, loop_exit) = self.serve(
            config,
            &mut sequencer,
            &managers,
            server.as_mut(),
            devnull.as_ref(),
            &mut run_loop,
        );

        let teardown = shutdown::teardown(
            reporter,
            Teardown {
                managers: Some(managers),
                fallback_entropy,
                server: Some(server),
                backends: Some(backends),
                builtin: Some(builtin),
            },
            started,
        );

        Outcome {
            status,
            loop_exit,
            settings,
            privilege: sequencer.state(),
            reloads: run_loop.reloads(),
            teardown,
        }
    }

    fn serve(
        &mut self,
        config: &RuntimeConfig,
        sequencer: &mut Sequencer<'_>,
        managers: &ResourceManagerSet,
        server: &mut dyn ServerContext,
        devnull: Option<&File>,
        run_loop: &mut RunLoop,
    ) -> (ExitStatus, Option<LoopExit>) {
        let reporter = self.reporter;
        for option in config.server_options() {
            server.set_option(option, true);
        }
        let delay = config.response_delay();
        if !delay.is_zero() {
            server.set_delay(delay);
        }

        if config.sandbox {
            if let Err(e) = sequencer.install_sandbox_filter() {
                reporter.early_warning(&format!("sandbox: {}", describe(&e)));
            }
        }

        if let Err(e) = server.start() {
            unexpected_error!(reporter, "starting server: {}", describe(&e));
            return (ExitStatus::Failure, None);
        }

        let mut events = match self.events.take() {
            Some(events) => events,
            None => match signals::install(&managers.task().spawner()) {
                Ok(events) => events,
                Err(e) => {
                    unexpected_error!(reporter, "installing signal handlers: {}", describe(&e));
                    return (ExitStatus::Failure, None);
                }
            },
        };

        if let Some(devnull) = devnull {
            if let Err(e) = self.platform.startup_complete(devnull) {
                reporter.early_warning(&describe(&e));
            }
        }

        tracing::info!("running");
        run_loop.started();
        let exit = run_loop.run(&mut events, server, reporter);
        match exit {
            LoopExit::Shutdown => tracing::info!("shutting down"),
            LoopExit::Unexpected => tracing::warn!("shutting down after unexpected wake-up"),
        }
        // An unexpected wake-up still shuts down cleanly; callers tell it apart by `loop_exit`.
        (ExitStatus::Success, Some(exit))
    }

    fn fatal(&self, e: &Error) -> ! {
        self.reporter.early_fatal(&describe(e))
    }

    fn fatal_in(&self, context: &str, e: &Error) -> ! {
        self.reporter
            .early_fatal(&format!("{context}: {}", describe(e)))
    }
}

fn notice(log: &LogContext, msg: &str) {
    log.write(LogCategory::General, LogModule::Main, Severity::Notice, msg);
}

/// `e` followed by each of its sources.
fn describe(e: &Error) -> String {
    let mut out = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
