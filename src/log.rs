//! The log context.
//!
//! A [`LogContext`] wraps a `tracing` [`Dispatch`] built from a `tracing_subscriber` registry.
//! Its presence is what the [error reporter][crate::report::Reporter] checks to decide between
//! writing through the log and writing to standard error.
//!
//! The file sink uses `tracing-appender`'s blocking [`RollingFileAppender`] rather than its
//! non-blocking writer: logging is initialized before the process forks into the background,
//! and a writer thread started before `fork()` would not survive it.
use crate::config::RuntimeConfig;
use crate::error::Error;
use is_terminal::IsTerminal;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::dispatcher::DefaultGuard;
use tracing::Dispatch;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

const DEFAULT_FILTER: &str = "namecrab=info";

/// Log file used by a daemon when none is configured. Opened after the root directory changes,
/// so it is relative to the chroot directory when there is one.
pub const DEFAULT_LOG_FILE: &str = "/var/log/namecrab.log";

/// Severity of a record written through [`LogContext::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Notice,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogModule {
    Main,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("general")
    }
}

impl fmt::Display for LogModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogModule::Main => f.write_str("main"),
        }
    }
}

/// Where and how verbosely to log.
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub to_stderr: bool,
    pub file: Option<PathBuf>,
    pub filter: Option<String>,
    pub debug_level: u8,
}

impl LogSettings {
    /// A daemon always logs to a file: its standard error ends up on `/dev/null` once startup
    /// completes.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let file = match &config.log_file {
            Some(path) => Some(path.clone()),
            None if config.daemonizes() => Some(PathBuf::from(DEFAULT_LOG_FILE)),
            None => None,
        };
        Self {
            to_stderr: config.log_stderr || file.is_none(),
            file,
            filter: config.log_filter.clone(),
            debug_level: config.debug_level,
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, Error> {
        if let Some(filter) = &self.filter {
            return EnvFilter::try_new(filter).map_err(|e| Error::Logging(e.to_string()));
        }
        let default = match self.debug_level {
            0 => DEFAULT_FILTER,
            1 => "namecrab=debug",
            _ => "namecrab=trace",
        };
        Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
    }
}

/// A handle on a configured logging pipeline.
#[derive(Clone)]
pub struct LogContext {
    dispatch: Dispatch,
}

impl fmt::Debug for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogContext").finish_non_exhaustive()
    }
}

impl LogContext {
    /// Build the process log context and install it as the global `tracing` default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Logging`] if the filter doesn't parse, the log file can't be opened or a
    /// global default is already installed.
    pub fn init(settings: &LogSettings) -> Result<Self, Error> {
        let filter = settings.env_filter()?;
        let ctx = match (&settings.file, settings.to_stderr) {
            (Some(path), false) => Self::build(open_log_file(path)?, filter, false),
            _ => Self::build(io::stderr, filter, io::stderr().is_terminal()),
        };
        tracing::dispatcher::set_global_default(ctx.dispatch.clone())
            .map_err(|e| Error::Logging(e.to_string()))?;
        Ok(ctx)
    }

    /// Build a log context over an arbitrary writer, without installing it globally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Logging`] if `filter` isn't a valid directive.
    pub fn with_writer<W>(writer: W, filter: &str) -> Result<Self, Error>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let filter = EnvFilter::try_new(filter).map_err(|e| Error::Logging(e.to_string()))?;
        Ok(Self::build(writer, filter, false))
    }

    fn build<W>(writer: W, filter: EnvFilter, ansi: bool) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi),
            )
            .with(filter);
        Self {
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Write one record at the given severity.
    pub fn write(
        &self,
        category: LogCategory,
        module: LogModule,
        severity: Severity,
        message: &str,
    ) {
        tracing::dispatcher::with_default(&self.dispatch, || match severity {
            Severity::Critical => tracing::error!(
                target: "namecrab",
                %category,
                %module,
                severity = "critical",
                "{message}"
            ),
            Severity::Error => {
                tracing::error!(target: "namecrab", %category, %module, "{message}");
            }
            Severity::Warning => {
                tracing::warn!(target: "namecrab", %category, %module, "{message}");
            }
            Severity::Notice => {
                tracing::info!(target: "namecrab", %category, %module, "{message}");
            }
            Severity::Debug => {
                tracing::debug!(target: "namecrab", %category, %module, "{message}");
            }
        });
    }

    /// Make this context the calling thread's default subscriber until the guard is dropped.
    #[must_use]
    pub fn set_thread_default(&self) -> DefaultGuard {
        tracing::dispatcher::set_default(&self.dispatch)
    }

    /// Close the context. Records written after this point through the global macros are
    /// dropped once no other handle keeps the subscriber alive.
    pub fn shutdown(self) {
        drop(self.dispatch);
    }
}

fn open_log_file(path: &Path) -> Result<RollingFileAppender, Error> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .ok_or_else(|| Error::Logging(format!("{} is not a file name", path.display())))?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(dir)
        .map_err(|e| Error::Logging(format!("{}: {e}", path.display())))
}

/// An in-memory writer, usable both as a log sink and as the reporter's fallback stream.
#[derive(Clone, Default, Debug)]
pub struct MemoryWriter(Arc<Mutex<Vec<u8>>>);

impl MemoryWriter {
    #[must_use]
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl io::Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MemoryWriter {
    type Writer = MemoryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_honours_severity_and_filter() {
        let out = MemoryWriter::default();
        let ctx = LogContext::with_writer(out.clone(), "namecrab=info").unwrap();
        ctx.write(
            LogCategory::General,
            LogModule::Main,
            Severity::Critical,
            "disk on fire",
        );
        ctx.write(
            LogCategory::General,
            LogModule::Main,
            Severity::Debug,
            "hidden",
        );
        let text = out.contents();
        assert!(text.contains("disk on fire"));
        assert!(text.contains("critical"));
        assert!(text.contains("ERROR"));
        assert!(!text.contains("hidden"));
    }

    #[test]
    fn bad_filter_is_an_error() {
        assert!(matches!(
            LogContext::with_writer(MemoryWriter::default(), "namecrab=loud"),
            Err(Error::Logging(_))
        ));
    }

    #[test]
    fn settings_from_config() {
        let config = RuntimeConfig {
            log_file: Some(PathBuf::from("named.log")),
            ..RuntimeConfig::default()
        };
        let settings = LogSettings::from_config(&config);
        assert!(!settings.to_stderr);
        assert_eq!(settings.file, Some(PathBuf::from("named.log")));

        let foreground = RuntimeConfig {
            foreground: true,
            ..RuntimeConfig::default()
        };
        let settings = LogSettings::from_config(&foreground);
        assert!(settings.to_stderr);
        assert_eq!(settings.file, None);

        let stderr = RuntimeConfig {
            log_stderr: true,
            log_file: Some(PathBuf::from("named.log")),
            ..RuntimeConfig::default()
        };
        assert!(LogSettings::from_config(&stderr).to_stderr);
    }

    #[test]
    fn daemon_without_log_file_gets_the_default_file() {
        let settings = LogSettings::from_config(&RuntimeConfig::default());
        assert!(!settings.to_stderr);
        assert_eq!(settings.file, Some(PathBuf::from(DEFAULT_LOG_FILE)));
    }

    #[test]
    fn log_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let appender = open_log_file(&dir.path().join("named.log")).unwrap();
        let ctx = LogContext::build(appender, EnvFilter::new("namecrab=info"), false);
        ctx.write(
            LogCategory::General,
            LogModule::Main,
            Severity::Notice,
            "starting",
        );
        let text = std::fs::read_to_string(dir.path().join("named.log")).unwrap();
        assert!(text.contains("starting"));
    }
}
