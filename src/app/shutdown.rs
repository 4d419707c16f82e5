//! The shutdown supervisor: takes a running process apart in a fixed order.
//!
//! Every step is attempted even when an earlier one failed; failures are reported as
//! unexpected errors.
use crate::backends::{BackendRegistry, BuiltinNames};
use crate::log::{LogCategory, LogModule, Severity};
use crate::managers::{self, FallbackEntropy, ManagerKind, ResourceManagerSet};
use crate::report::Reporter;
use crate::server::ServerContext;
use crate::unexpected_error;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything there is to tear down. Parts that were never created are `None`.
#[derive(Default)]
pub struct Teardown {
    pub managers: Option<ResourceManagerSet>,
    pub fallback_entropy: Option<FallbackEntropy>,
    pub server: Option<Box<dyn ServerContext>>,
    pub backends: Option<Arc<BackendRegistry>>,
    pub builtin: Option<Arc<BuiltinNames>>,
}

/// What [`teardown`] observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub managers: Vec<ManagerKind>,
    pub entropy_detached: bool,
    pub server_destroyed: bool,
    pub backends: Vec<String>,
    pub builtin_released: bool,
    pub uptime: Duration,
}

pub fn teardown(reporter: &Reporter, parts: Teardown, started: Instant) -> TeardownReport {
    let Teardown {
        managers,
        fallback_entropy,
        server,
        backends,
        builtin,
    } = parts;
    let mut report = TeardownReport::default();

    if let Some(set) = managers {
        report.managers = managers::destroy_all(set);
    }

    if let Some(fallback) = fallback_entropy {
        tracing::debug!(path = %fallback.path().display(), "detaching fallback entropy source");
        drop(fallback);
        report.entropy_detached = true;
    }

    if let Some(server) = server {
        match server.destroy() {
            Ok(()) => report.server_destroyed = true,
            Err(e) => unexpected_error!(reporter, "destroying server: {e}"),
        }
    }

    if let Some(backends) = backends {
        report.backends = backends.unregister_all();
    }

    if let Some(builtin) = builtin {
        match Arc::try_unwrap(builtin) {
            Ok(table) => {
                drop(table);
                report.builtin_released = true;
            }
            Err(_) => unexpected_error!(reporter, "builtin name table still referenced"),
        }
    }

    report.uptime = started.elapsed();
    if let Some(log) = reporter.log() {
        log.write(
            LogCategory::General,
            LogModule::Main,
            Severity::Notice,
            &format!("exiting (uptime {}s)", report.uptime.as_secs()),
        );
    }
    if let Some(log) = reporter.detach_log() {
        log.shutdown();
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::log::{LogContext, MemoryWriter};
    use crate::managers::ManagerSettings;
    use crate::report::{Stream, Termination};
    use crate::server::ServerOption;
    use std::sync::Mutex;

    struct FailingServer;

    impl ServerContext for FailingServer {
        fn set_option(&mut self, _option: ServerOption, _value: bool) {}
        fn set_delay(&mut self, _delay: Duration) {}
        fn start(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn request_reload(&self) {}
        fn destroy(self: Box<Self>) -> Result<(), Error> {
            Err(Error::Server("stuck".to_string()))
        }
    }

    #[test]
    fn failed_step_does_not_stop_the_rest() {
        let log_out = MemoryWriter::default();
        let stderr = MemoryWriter::default();
        let reporter = Reporter::with_stream(
            "namecrab",
            Arc::new(Mutex::new(stderr.clone())) as Stream,
            Termination::Exit,
        );
        reporter.attach_log(LogContext::with_writer(log_out.clone(), "namecrab=info").unwrap());

        let settings = ManagerSettings {
            detected_cpus: 1,
            workers: 1,
            udp_listeners: 1,
            max_sockets: Some(8),
            max_udp: None,
        };
        let managers = managers::create_all(&settings, None, &reporter).unwrap();
        let backends = Arc::new(BackendRegistry::new());
        let builtin = Arc::new(BuiltinNames::new("ns.test"));
        let report = teardown(
            &reporter,
            Teardown {
                managers: Some(managers),
                fallback_entropy: None,
                server: Some(Box::new(FailingServer)),
                backends: Some(backends),
                builtin: Some(builtin),
            },
            Instant::now(),
        );

        assert_eq!(report.managers.len(), 5);
        assert!(!report.server_destroyed);
        assert!(report.builtin_released);
        let logged = log_out.contents();
        assert!(logged.contains("destroying server: server: stuck"));
        assert!(logged.contains("exiting (uptime 0s)"));
        assert!(reporter.log().is_none());
        assert!(stderr.contents().is_empty());
    }

    #[test]
    fn nothing_to_tear_down() {
        let reporter = Reporter::with_stream(
            "namecrab",
            Arc::new(Mutex::new(MemoryWriter::default())) as Stream,
            Termination::Exit,
        );
        let report = teardown(&reporter, Teardown::default(), Instant::now());
        assert!(report.managers.is_empty());
        assert!(!report.entropy_detached);
    }
}
