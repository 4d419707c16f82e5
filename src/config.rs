//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is loaded once from a JSON file, adjusted by command line overrides and
//! then never mutated again. Every field has a default so a minimal file is just `{}`:
//!
//! ```json
//! {
//!   "chroot": "/var/empty",
//!   "user": "named",
//!   "workers": 0,
//!   "udp_listeners": 0,
//!   "sandbox": true,
//!   "test": { "noaa": true, "delay_ms": 250 },
//!   "server": {
//!     "domain": "example.com.",
//!     "ns_domain": "ns1.example.com.",
//!     "ns_admin": "dns-admin@example.com",
//!     "listen_addrs": ["127.0.0.1", "::1"],
//!     "port": 5353,
//!     "addrs": { "www.example.com.": ["93.184.216.34"] }
//!   }
//! }
//! ```
use crate::error::Error;
use crate::server::ServerOption;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use trust_dns_server::client::rr::{LowerName, Name};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/namecrab.json";

/// Process-wide settings consumed by the bootstrap sequence.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Absolute path of the file this configuration was read from.
    #[serde(skip)]
    pub config_file: PathBuf,
    /// Directory to confine the process to.
    pub chroot: Option<PathBuf>,
    /// User to run as once privileges are dropped.
    pub user: Option<String>,
    /// Don't detach from the controlling terminal.
    pub foreground: bool,
    /// Log to standard error instead of the log file. Implies `foreground`.
    pub log_stderr: bool,
    /// Raises the default log filter: 1 is debug, 2 and above is trace.
    pub debug_level: u8,
    /// Worker threads for the task scheduler; `0` means one per detected CPU.
    pub workers: usize,
    /// UDP listeners per interface; `0` means derived from the detected CPU count.
    pub udp_listeners: usize,
    /// Ceiling on sockets the socket manager hands out.
    pub max_sockets: Option<usize>,
    /// Override for the largest UDP payload advertised and sent.
    pub max_udp: Option<u16>,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
    /// Install the syscall allow-list once startup completes.
    pub sandbox: bool,
    /// Abort (and dump core) instead of exiting on fatal errors.
    pub core_dumps: bool,
    /// Log file, relative to the chroot directory when one is set.
    pub log_file: Option<PathBuf>,
    /// `tracing_subscriber::EnvFilter` directive overriding the default filter.
    pub log_filter: Option<String>,
    pub test: TestOptions,
    pub server: ServerSettings,
}

/// Test-only behaviour toggles, set with `-T`.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TestOptions {
    pub clienttest: bool,
    pub dropedns: bool,
    pub noedns: bool,
    pub nosoa: bool,
    pub noaa: bool,
    pub nonearest: bool,
    pub notcp: bool,
    pub fixedlocal: bool,
    /// Artificial delay added before each response.
    pub delay_ms: u64,
}

/// Settings for the name server context.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub domain: LowerName,
    pub ns_domain: LowerName,
    pub ns_admin: String,
    pub listen_addrs: Vec<IpAddr>,
    pub port: u16,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tcp_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stats_interval: Duration,
    pub addrs: HashMap<LowerName, Vec<IpAddr>>,
    /// Hosts-format file served by the hosts backend driver.
    pub hosts_file: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            domain: LowerName::from(Name::root()),
            ns_domain: LowerName::from(Name::root()),
            ns_admin: String::from("hostmaster"),
            listen_addrs: vec![
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ],
            port: 53,
            tcp_timeout: Duration::from_secs(5),
            stats_interval: Duration::from_secs(3600),
            addrs: HashMap::default(),
            hosts_file: None,
        }
    }
}

impl RuntimeConfig {
    /// Load a [`RuntimeConfig`] from the JSON file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] if the file can't be opened, [`Error::InvalidJSON`] if it doesn't
    /// parse and [`Error::InvalidConfig`] if the settings contradict each other.
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let p = p.as_ref();
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let mut conf: RuntimeConfig = serde_json::from_reader(reader)?;
        conf.config_file = if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()?.join(p)
        };
        conf.validate()?;
        Ok(conf)
    }

    /// Check settings that can't be expressed in the JSON schema alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.disable_ipv4 && self.disable_ipv6 {
            return Err(Error::InvalidConfig(
                "IPv4 and IPv6 cannot both be disabled".to_string(),
            ));
        }
        if let Some(chroot) = &self.chroot {
            if !chroot.is_absolute() {
                return Err(Error::InvalidConfig(format!(
                    "chroot directory {} must be absolute",
                    chroot.display()
                )));
            }
        }
        if self.max_sockets == Some(0) {
            return Err(Error::InvalidConfig("max_sockets must be positive".into()));
        }
        Ok(())
    }

    /// Apply a single `-T` test option, e.g. `noaa` or `delay=250`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTestOption`] for unrecognized names and
    /// [`Error::InvalidConfig`] for numeric options with a non-numeric value.
    pub fn apply_test_option(&mut self, arg: &str) -> Result<(), Error> {
        let (name, value) = match arg.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (arg, None),
        };
        let t = &mut self.test;
        match (name, value) {
            ("clienttest", None) => t.clienttest = true,
            ("dropedns", None) => t.dropedns = true,
            ("noedns", None) => t.noedns = true,
            ("nosoa", None) => t.nosoa = true,
            ("noaa", None) => t.noaa = true,
            ("nonearest", None) => t.nonearest = true,
            ("notcp", None) => t.notcp = true,
            ("fixedlocal", None) => t.fixedlocal = true,
            ("delay", Some(v)) => t.delay_ms = parse_number(name, v)?,
            ("maxudp", Some(v)) => self.max_udp = Some(parse_number(name, v)?),
            _ => return Err(Error::UnknownTestOption(arg.to_string())),
        }
        Ok(())
    }

    /// The server options that are switched on by this configuration.
    #[must_use]
    pub fn server_options(&self) -> Vec<ServerOption> {
        let t = &self.test;
        [
            (t.clienttest, ServerOption::ClientTest),
            (t.dropedns, ServerOption::DropEdns),
            (t.noedns, ServerOption::NoEdns),
            (t.nosoa, ServerOption::NoSoa),
            (t.noaa, ServerOption::NoAa),
            (t.nonearest, ServerOption::NoNearest),
            (t.notcp, ServerOption::NoTcp),
            (t.fixedlocal, ServerOption::FixedLocal),
            (self.disable_ipv4, ServerOption::DisableIpv4),
            (self.disable_ipv6, ServerOption::DisableIpv6),
        ]
        .into_iter()
        .filter_map(|(on, option)| on.then_some(option))
        .collect()
    }

    /// Whether the process detaches from the terminal.
    #[must_use]
    pub fn daemonizes(&self) -> bool {
        !self.foreground && !self.log_stderr
    }

    /// Whether the config file can still be reached once the root directory has changed.
    #[must_use]
    pub fn config_file_reachable_after_chroot(&self) -> bool {
        match &self.chroot {
            Some(chroot) => self.config_file.starts_with(chroot),
            None => true,
        }
    }

    /// The path reloads read the config file from. The file is first loaded before the root
    /// directory changes, so a file below the chroot directory is re-read by its path inside
    /// it.
    #[must_use]
    pub fn reload_path(&self) -> PathBuf {
        let inside = self
            .chroot
            .as_deref()
            .and_then(|chroot| self.config_file.strip_prefix(chroot).ok());
        match inside {
            Some(rest) => Path::new("/").join(rest),
            None => self.config_file.clone(),
        }
    }

    #[must_use]
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.test.delay_ms)
    }
}

impl ServerSettings {
    /// Read only the `server` section of a configuration file. Used for reloads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] or [`Error::InvalidJSON`] if the file can't be read or parsed.
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        #[derive(Deserialize)]
        struct Section {
            #[serde(default)]
            server: ServerSettings,
        }
        let f = File::open(p)?;
        let section: Section = serde_json::from_reader(BufReader::new(f))?;
        Ok(section.server)
    }

    /// The SOA `RNAME` for [`ServerSettings::ns_admin`], accepting the email form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DNSError`] if the result isn't a valid name.
    pub fn ns_admin(&self) -> Result<Name, Error> {
        Ok(Name::from_str(&self.sanitized_ns_admin())?)
    }

    fn sanitized_ns_admin(&self) -> Cow<str> {
        match self.ns_admin.split_once('@') {
            Some((user, domain)) => {
                let user = user.replace('.', "\\.");
                Cow::Owned(format!("{user}.{domain}"))
            }
            _ => Cow::Borrowed(&self.ns_admin),
        }
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{name} '{value}' must be numeric")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{}}").unwrap();
        let conf = RuntimeConfig::try_from_file(f.path()).unwrap();
        assert_eq!(conf.workers, 0);
        assert_eq!(conf.server.port, 53);
        assert!(conf.config_file.is_absolute());
        assert!(conf.server_options().is_empty());
    }

    #[test]
    fn rejects_both_families_disabled() {
        let conf = RuntimeConfig {
            disable_ipv4: true,
            disable_ipv6: true,
            ..RuntimeConfig::default()
        };
        assert!(matches!(conf.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_relative_chroot() {
        let conf = RuntimeConfig {
            chroot: Some(PathBuf::from("var/empty")),
            ..RuntimeConfig::default()
        };
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_options() {
        let mut conf = RuntimeConfig::default();
        conf.apply_test_option("noaa").unwrap();
        conf.apply_test_option("delay=250").unwrap();
        conf.apply_test_option("maxudp=1232").unwrap();
        assert!(conf.test.noaa);
        assert_eq!(conf.response_delay(), Duration::from_millis(250));
        assert_eq!(conf.max_udp, Some(1232));
        assert_eq!(conf.server_options(), vec![ServerOption::NoAa]);

        assert!(matches!(
            conf.apply_test_option("bogus"),
            Err(Error::UnknownTestOption(_))
        ));
        assert!(matches!(
            conf.apply_test_option("delay=soon"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(conf.apply_test_option("noaa=1").is_err());
    }

    #[test]
    fn reload_path_follows_the_chroot() {
        let conf = RuntimeConfig {
            chroot: Some(PathBuf::from("/var/named")),
            config_file: PathBuf::from("/var/named/etc/namecrab.json"),
            ..RuntimeConfig::default()
        };
        assert!(conf.config_file_reachable_after_chroot());
        assert_eq!(conf.reload_path(), PathBuf::from("/etc/namecrab.json"));

        let conf = RuntimeConfig {
            chroot: Some(PathBuf::from("/var/named")),
            config_file: PathBuf::from("/var/namedx/namecrab.json"),
            ..RuntimeConfig::default()
        };
        assert!(!conf.config_file_reachable_after_chroot());
        assert_eq!(conf.reload_path(), conf.config_file);

        let conf = RuntimeConfig {
            config_file: PathBuf::from("/etc/namecrab.json"),
            ..RuntimeConfig::default()
        };
        assert!(conf.config_file_reachable_after_chroot());
        assert_eq!(conf.reload_path(), conf.config_file);
    }

    #[test]
    fn daemonizes_unless_in_the_foreground() {
        assert!(RuntimeConfig::default().daemonizes());
        let conf = RuntimeConfig {
            log_stderr: true,
            ..RuntimeConfig::default()
        };
        assert!(!conf.daemonizes());
    }

    #[test]
    fn ns_admin_email_form() {
        let settings = ServerSettings {
            ns_admin: "dns.admin@example.com".to_string(),
            ..ServerSettings::default()
        };
        assert_eq!(
            settings.ns_admin().unwrap(),
            Name::from_str("dns\\.admin.example.com").unwrap()
        );
    }
}
