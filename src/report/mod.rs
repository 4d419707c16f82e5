//! Fatal error, warning and assertion reporting.
//!
//! The [`Reporter`] has to work at every point of the process lifetime: before logging has been
//! initialized, while logging is running and after it has been shut down again. Which path a
//! report takes is decided on every call by looking at the current [`ReportSink`]:
//!
//! * [`ReportSink::NoLog`]: the report is written to the fallback stream (standard error),
//!   prefixed with the program name, and flushed immediately.
//! * [`ReportSink::WithLog`]: the report is written through the [`LogContext`] at a severity
//!   matching its kind. Fatal reports end with an `exiting (due to ...)` record.
//!
//! Assertion and library-fatal reports disarm a one-shot guard before writing anything. If
//! writing the report fails in a way that re-enters the reporter (the log writer itself
//! panicking, say), the nested report finds the guard disarmed and goes straight to the
//! fallback stream, repeating the header of the report it interrupted.
//!
//! Panics are this crate's assertion mechanism. [`Reporter::install_panic_hook`] routes every
//! panic through [`Reporter::assertion_failed`]; the [`require!`][crate::require],
//! [`insist!`][crate::insist] and [`invariant!`][crate::invariant] macros panic with an
//! [`Assertion`] payload so the report carries the assertion kind and predicate text.
pub mod backtrace;

use crate::log::{LogCategory, LogContext, LogModule, Severity};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A shared, lockable output stream.
pub type Stream = Arc<Mutex<dyn Write + Send>>;

/// Source location of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location<'a> {
    pub file: &'a str,
    pub line: u32,
}

impl<'a> Location<'a> {
    #[must_use]
    pub const fn new(file: &'a str, line: u32) -> Self {
        Self { file, line }
    }
}

impl fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// The kind of invariant that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionKind {
    /// A precondition of the function was not met.
    Require,
    /// An internal consistency check failed.
    Insist,
    /// A property that must hold across components, such as teardown ordering, was broken.
    Invariant,
    /// Any other panic.
    Panic,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssertionKind::Require => "REQUIRE",
            AssertionKind::Insist => "INSIST",
            AssertionKind::Invariant => "INVARIANT",
            AssertionKind::Panic => "PANIC",
        })
    }
}

/// Panic payload raised by [`require!`][crate::require], [`insist!`][crate::insist] and
/// [`invariant!`][crate::invariant].
#[derive(Debug, Clone, Copy)]
pub struct Assertion {
    pub kind: AssertionKind,
    pub predicate: &'static str,
}

/// Panic with an [`Assertion`] payload if a precondition doesn't hold.
#[macro_export]
macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            ::std::panic::panic_any($crate::report::Assertion {
                kind: $crate::report::AssertionKind::Require,
                predicate: stringify!($cond),
            });
        }
    };
}

/// Panic with an [`Assertion`] payload if an internal consistency check doesn't hold.
#[macro_export]
macro_rules! insist {
    ($cond:expr) => {
        if !$cond {
            ::std::panic::panic_any($crate::report::Assertion {
                kind: $crate::report::AssertionKind::Insist,
                predicate: stringify!($cond),
            });
        }
    };
}

/// Panic with an [`Assertion`] payload if a cross-component invariant doesn't hold.
#[macro_export]
macro_rules! invariant {
    ($cond:expr) => {
        if !$cond {
            ::std::panic::panic_any($crate::report::Assertion {
                kind: $crate::report::AssertionKind::Invariant,
                predicate: stringify!($cond),
            });
        }
    };
}

/// Report a recoverable, unanticipated failure with the caller's source location.
#[macro_export]
macro_rules! unexpected_error {
    ($reporter:expr, $($arg:tt)+) => {
        $reporter.library_unexpected(
            $crate::report::Location::new(file!(), line!()),
            &format!($($arg)+),
        )
    };
}

/// Report a fatal library failure with the caller's source location. Never returns.
#[macro_export]
macro_rules! fatal_error {
    ($reporter:expr, $($arg:tt)+) => {
        $reporter.library_fatal(
            $crate::report::Location::new(file!(), line!()),
            &format!($($arg)+),
        )
    };
}

/// Where reports currently go.
#[derive(Clone)]
pub enum ReportSink {
    NoLog(Stream),
    WithLog(LogContext),
}

/// How the process ends after a fatal report.
pub enum Termination {
    /// `exit(1)`.
    Exit,
    /// `abort()`, leaving a core dump where the system allows one.
    Abort,
    /// Hand the exit status to a callback. If it returns, the process exits with that status.
    Custom(Box<dyn Fn(i32) + Send + Sync>),
}

/// The process-wide error reporter.
pub struct Reporter {
    program_name: String,
    sink: Mutex<ReportSink>,
    fallback: Stream,
    armed: AtomicBool,
    /// Header of the guarded report currently being written through the log.
    interrupted: Mutex<Option<String>>,
    termination: Termination,
}

impl Reporter {
    /// A reporter writing to standard error until a log context is attached. Fatal reports dump
    /// core when `core_ok` is set and exit with status 1 otherwise.
    #[must_use]
    pub fn new(program_name: impl Into<String>, core_ok: bool) -> Self {
        let stderr: Stream = Arc::new(Mutex::new(io::stderr()));
        let termination = if core_ok {
            Termination::Abort
        } else {
            Termination::Exit
        };
        Self::with_stream(program_name, stderr, termination)
    }

    #[must_use]
    pub fn with_stream(
        program_name: impl Into<String>,
        fallback: Stream,
        termination: Termination,
    ) -> Self {
        Self {
            program_name: program_name.into(),
            sink: Mutex::new(ReportSink::NoLog(fallback.clone())),
            fallback,
            armed: AtomicBool::new(true),
            interrupted: Mutex::new(None),
            termination,
        }
    }

    #[must_use]
    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    /// Route subsequent reports through `log`.
    pub fn attach_log(&self, log: LogContext) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = ReportSink::WithLog(log);
    }

    /// Route subsequent reports back to the fallback stream, returning the detached context.
    pub fn detach_log(&self) -> Option<LogContext> {
        let previous = std::mem::replace(
            &mut *self.sink.lock().unwrap_or_else(PoisonError::into_inner),
            ReportSink::NoLog(self.fallback.clone()),
        );
        match previous {
            ReportSink::WithLog(log) => Some(log),
            ReportSink::NoLog(_) => None,
        }
    }

    /// The log context currently attached, if any.
    #[must_use]
    pub fn log(&self) -> Option<LogContext> {
        match self.current_sink() {
            ReportSink::WithLog(log) => Some(log),
            ReportSink::NoLog(_) => None,
        }
    }

    // The sink is cloned out so no lock is held while writing; a report that re-enters the
    // reporter must not deadlock on it.
    fn current_sink(&self) -> ReportSink {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn early_warning(&self, msg: &str) {
        match self.current_sink() {
            ReportSink::WithLog(log) => main_record(&log, Severity::Warning, msg),
            ReportSink::NoLog(stream) => self.write_line(&stream, msg),
        }
    }

    /// Report an unrecoverable startup failure and terminate.
    pub fn early_fatal(&self, msg: &str) -> ! {
        match self.current_sink() {
            ReportSink::WithLog(log) => {
                main_record(&log, Severity::Critical, msg);
                main_record(&log, Severity::Critical, "exiting (due to early fatal error)");
            }
            ReportSink::NoLog(stream) => self.write_line(&stream, msg),
        }
        self.terminate()
    }

    /// Report a failed invariant, with a stack trace when logging, and terminate.
    pub fn assertion_failed(&self, location: Location<'_>, kind: AssertionKind, cond: &str) -> ! {
        let header = format!("{location}: {kind}({cond}) failed");
        match self.disarm() {
            Some(ReportSink::WithLog(log)) => {
                self.mark_interruptible(&header);
                let frames = backtrace::capture();
                let suffix = if frames.is_empty() { "" } else { ", back trace" };
                main_record(&log, Severity::Critical, &format!("{header}{suffix}"));
                for (i, frame) in frames.iter().enumerate() {
                    let line = backtrace::Numbered(i, frame).to_string();
                    main_record(&log, Severity::Critical, &line);
                }
                main_record(&log, Severity::Critical, "exiting (due to assertion failure)");
            }
            Some(ReportSink::NoLog(stream)) => self.write_line(&stream, &header),
            None => self.write_nested(&header),
        }
        self.terminate()
    }

    /// Report a fatal error raised by a library component and terminate.
    pub fn library_fatal(&self, location: Location<'_>, msg: &str) -> ! {
        let header = format!("{location}: fatal error: {msg}");
        match self.disarm() {
            Some(ReportSink::WithLog(log)) => {
                self.mark_interruptible(&header);
                main_record(&log, Severity::Critical, &format!("{location}: fatal error:"));
                main_record(&log, Severity::Critical, msg);
                main_record(
                    &log,
                    Severity::Critical,
                    "exiting (due to fatal error in library)",
                );
            }
            Some(ReportSink::NoLog(stream)) => self.write_line(&stream, &header),
            None => self.write_nested(&header),
        }
        self.terminate()
    }

    /// Report a failure the caller didn't anticipate but can continue after.
    pub fn library_unexpected(&self, location: Location<'_>, msg: &str) {
        match self.current_sink() {
            ReportSink::WithLog(log) => {
                main_record(&log, Severity::Error, &format!("{location}: unexpected error:"));
                main_record(&log, Severity::Error, msg);
            }
            ReportSink::NoLog(stream) => {
                self.write_line(&stream, &format!("{location}: unexpected error: {msg}"));
            }
        }
    }

    /// Route every panic in the process through [`Reporter::assertion_failed`].
    ///
    /// A panic raised while a panic hook runs aborts the process on the spot, so the report is
    /// written from a thread of its own. If the log writer panics there, the hook runs again on
    /// that thread and the second report lands on the fallback stream.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let reporter = Arc::clone(self);
        std::panic::set_hook(Box::new(move |info| {
            let (file, line) = info
                .location()
                .map_or(("<unknown>".to_string(), 0), |l| (l.file().to_string(), l.line()));
            let payload = info.payload();
            let (kind, predicate) = if let Some(assertion) = payload.downcast_ref::<Assertion>() {
                (assertion.kind, assertion.predicate.to_string())
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                (AssertionKind::Panic, (*s).to_string())
            } else if let Some(s) = payload.downcast_ref::<String>() {
                (AssertionKind::Panic, s.clone())
            } else {
                (AssertionKind::Panic, "Box<dyn Any>".to_string())
            };

            let on_thread = Arc::clone(&reporter);
            let (report_file, report_predicate) = (file.clone(), predicate.clone());
            let spawned = std::thread::Builder::new()
                .name("namecrab-report".to_string())
                .spawn(move || {
                    on_thread.assertion_failed(
                        Location::new(&report_file, line),
                        kind,
                        &report_predicate,
                    );
                });
            if let Ok(handle) = spawned {
                // The report thread terminates the process; joining only returns if it didn't.
                let _ = handle.join();
            }
            let header = format!("{}: {kind}({predicate}) failed", Location::new(&file, line));
            reporter.armed.store(false, Ordering::SeqCst);
            reporter.write_nested(&header);
            reporter.terminate()
        }));
    }

    /// Disarm the one-shot guard. Returns the sink to report through, or `None` when the guard
    /// was already disarmed by an outer report.
    fn disarm(&self) -> Option<ReportSink> {
        if self.armed.swap(false, Ordering::SeqCst) {
            Some(self.current_sink())
        } else {
            None
        }
    }

    fn mark_interruptible(&self, header: &str) {
        *self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(header.to_string());
    }

    /// Write `header` to the fallback stream after the header of any report it interrupted.
    fn write_nested(&self, header: &str) {
        let outer = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(outer) = outer {
            self.write_line(&self.fallback, &outer);
        }
        self.write_line(&self.fallback, header);
    }

    fn write_line(&self, stream: &Stream, msg: &str) {
        let mut out = stream.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(out, "{}: {msg}", self.program_name);
        let _ = out.flush();
    }

    fn terminate(&self) -> ! {
        match &self.termination {
            Termination::Exit => std::process::exit(1),
            Termination::Abort => std::process::abort(),
            Termination::Custom(f) => {
                f(1);
                std::process::exit(1)
            }
        }
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("program_name", &self.program_name)
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn main_record(log: &LogContext, severity: Severity, msg: &str) {
    log.write(LogCategory::General, LogModule::Main, severity, msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryWriter;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Debug)]
    struct Terminated(i32);

    fn reporter(stderr: &MemoryWriter, exits: &Arc<AtomicUsize>) -> Reporter {
        let exits = Arc::clone(exits);
        Reporter::with_stream(
            "named",
            Arc::new(Mutex::new(stderr.clone())),
            Termination::Custom(Box::new(move |code| {
                exits.fetch_add(1, Ordering::SeqCst);
                panic::panic_any(Terminated(code));
            })),
        )
    }

    fn expect_termination(f: impl FnOnce()) -> i32 {
        let err = panic::catch_unwind(AssertUnwindSafe(f)).expect_err("should terminate");
        err.downcast_ref::<Terminated>().expect("terminated").0
    }

    #[test]
    fn early_fatal_without_log_writes_one_stderr_line() {
        let stderr = MemoryWriter::default();
        let exits = Arc::new(AtomicUsize::new(0));
        let r = reporter(&stderr, &exits);

        let code = expect_termination(|| r.early_fatal("boom"));
        assert_eq!(code, 1);
        assert_eq!(stderr.contents(), "named: boom\n");
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn early_fatal_with_log_writes_critical_and_exiting() {
        let stderr = MemoryWriter::default();
        let log_out = MemoryWriter::default();
        let exits = Arc::new(AtomicUsize::new(0));
        let r = reporter(&stderr, &exits);
        r.attach_log(LogContext::with_writer(log_out.clone(), "namecrab=info").unwrap());

        expect_termination(|| r.early_fatal("boom"));
        let text = log_out.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("boom") && lines[0].contains("critical"));
        assert!(lines[1].contains("exiting (due to early fatal error)"));
        assert!(stderr.contents().is_empty());
    }

    #[test]
    fn warnings_and_unexpected_do_not_terminate() {
        let stderr = MemoryWriter::default();
        let exits = Arc::new(AtomicUsize::new(0));
        let r = reporter(&stderr, &exits);

        r.early_warning("careful");
        unexpected_error!(r, "socket {} went away", 7);
        let text = stderr.contents();
        assert!(text.starts_with("named: careful\n"));
        assert!(text.contains("unexpected error: socket 7 went away"));
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn detach_log_falls_back_to_stderr() {
        let stderr = MemoryWriter::default();
        let exits = Arc::new(AtomicUsize::new(0));
        let r = reporter(&stderr, &exits);
        r.attach_log(LogContext::with_writer(MemoryWriter::default(), "namecrab=info").unwrap());
        assert!(r.log().is_some());
        assert!(r.detach_log().is_some());
        assert!(r.log().is_none());
        r.early_warning("after shutdown");
        assert_eq!(stderr.contents(), "named: after shutdown\n");
    }

    #[test]
    fn assertion_with_log_includes_back_trace() {
        let stderr = MemoryWriter::default();
        let log_out = MemoryWriter::default();
        let exits = Arc::new(AtomicUsize::new(0));
        let r = reporter(&stderr, &exits);
        r.attach_log(LogContext::with_writer(log_out.clone(), "namecrab=info").unwrap());

        expect_termination(|| {
            r.assertion_failed(Location::new("main.rs", 42), AssertionKind::Insist, "x > 0")
        });
        let text = log_out.contents();
        assert!(text.contains("main.rs:42: INSIST(x > 0) failed"));
        assert!(text.contains("#0 0x"));
        assert!(text.contains("exiting (due to assertion failure)"));
        assert!(stderr.contents().is_empty());
    }

    #[test]
    fn library_fatal_without_log() {
        let stderr = MemoryWriter::default();
        let exits = Arc::new(AtomicUsize::new(0));
        let r = reporter(&stderr, &exits);
        expect_termination(|| fatal_error!(r, "out of {}", "memory"));
        let text = stderr.contents();
        assert!(text.starts_with("named: "));
        assert!(text.contains("fatal error: out of memory"));
    }

    /// A log writer whose every write re-enters the reporter, like a logging routine that
    /// itself trips an assertion.
    #[derive(Clone)]
    struct Reentrant(Arc<Mutex<Option<Arc<Reporter>>>>);

    impl Write for Reentrant {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            let reporter = self.0.lock().unwrap().clone().unwrap();
            reporter.assertion_failed(
                Location::new("log.rs", 1),
                AssertionKind::Require,
                "writer ok",
            )
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Reentrant {
        type Writer = Reentrant;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn reentrant_assertion_terminates_once() {
        let stderr = MemoryWriter::default();
        let exits = Arc::new(AtomicUsize::new(0));
        let r = Arc::new(reporter(&stderr, &exits));
        let slot = Reentrant(Arc::new(Mutex::new(Some(Arc::clone(&r)))));
        r.attach_log(LogContext::with_writer(slot, "namecrab=info").unwrap());

        expect_termination(|| {
            r.assertion_failed(Location::new("task.rs", 9), AssertionKind::Insist, "drained")
        });
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        let text = stderr.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "named: task.rs:9: INSIST(drained) failed",
                "named: log.rs:1: REQUIRE(writer ok) failed",
            ]
        );
    }

    #[test]
    fn require_panics_with_assertion_payload() {
        let err = panic::catch_unwind(|| {
            let ready = false;
            crate::require!(ready);
        })
        .unwrap_err();
        let assertion = err.downcast_ref::<Assertion>().unwrap();
        assert_eq!(assertion.kind, AssertionKind::Require);
        assert_eq!(assertion.predicate, "ready");
    }
}
