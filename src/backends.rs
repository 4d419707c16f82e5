//! Builtin names and backend drivers.
//!
//! The [`BuiltinNames`] table answers the CHAOS-class `TXT` queries operators use to identify
//! a server (`version.bind`, `hostname.bind`, `id.server`, `authors.bind`).
//!
//! A [`BackendRegistry`] holds the registered [`Backend`] drivers. The name server consults
//! them, in registration order, for address queries its own zone can't answer. The only driver
//! shipped is [`HostsBackend`], serving a file in `/etc/hosts` format.
use crate::error::Error;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use trust_dns_server::client::rr::{LowerName, Name};

pub struct BuiltinNames {
    entries: HashMap<LowerName, Vec<String>>,
}

impl BuiltinNames {
    /// Build the table. `hostname.bind` and `id.server` report `hostname`.
    #[must_use]
    pub fn new(hostname: &str) -> Self {
        let version = format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let authors: Vec<String> = env!("CARGO_PKG_AUTHORS")
            .split(':')
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        let mut entries = HashMap::new();
        let mut insert = |name: &str, values: Vec<String>| {
            if let Ok(name) = Name::from_ascii(name) {
                entries.insert(LowerName::from(name), values);
            }
        };
        insert("version.bind.", vec![version]);
        insert("hostname.bind.", vec![hostname.to_string()]);
        insert("id.server.", vec![hostname.to_string()]);
        insert("authors.bind.", authors);
        Self { entries }
    }

    #[must_use]
    pub fn lookup(&self, name: &LowerName) -> Option<&[String]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A source of address records outside the configured zone.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Addresses for `name`, or `None` if this backend doesn't know it.
    fn lookup(&self, name: &LowerName) -> Option<Vec<IpAddr>>;

    /// Re-read the backend's data.
    ///
    /// # Errors
    ///
    /// [`Error::Backend`] when the data can't be reloaded. The previous data stays in use.
    fn reload(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<dyn Backend>>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// [`Error::Backend`] when a backend with the same name is already registered.
    pub fn register(&self, backend: Arc<dyn Backend>) -> Result<(), Error> {
        let mut backends = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if backends.iter().any(|b| b.name() == backend.name()) {
            return Err(Error::Backend(
                backend.name().to_string(),
                "already registered".to_string(),
            ));
        }
        tracing::debug!(backend = backend.name(), "backend registered");
        backends.push(backend);
        Ok(())
    }

    /// Remove every backend, returning their names in registration order.
    pub fn unregister_all(&self) -> Vec<String> {
        let mut backends = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        backends.drain(..).map(|b| b.name().to_string()).collect()
    }

    #[must_use]
    pub fn lookup(&self, name: &LowerName) -> Option<Vec<IpAddr>> {
        self.snapshot().iter().find_map(|b| b.lookup(name))
    }

    /// Reload every backend, returning the errors of those that failed.
    pub fn reload_all(&self) -> Vec<Error> {
        self.snapshot()
            .iter()
            .filter_map(|b| b.reload().err())
            .collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|b| b.name().to_string()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Backend>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Serves addresses from a hosts-format file: one address per line followed by its names,
/// `#` starting a comment.
pub struct HostsBackend {
    path: PathBuf,
    entries: RwLock<HashMap<LowerName, Vec<IpAddr>>>,
}

impl HostsBackend {
    pub const NAME: &'static str = "hosts";

    /// # Errors
    ///
    /// [`Error::Backend`] when the file can't be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let entries = read_hosts(&path)?;
        tracing::info!(path = %path.display(), names = entries.len(), "hosts file loaded");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }
}

impl Backend for HostsBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn lookup(&self, name: &LowerName) -> Option<Vec<IpAddr>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn reload(&self) -> Result<(), Error> {
        let entries = read_hosts(&self.path)?;
        *self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner) = entries;
        Ok(())
    }
}

fn read_hosts(path: &Path) -> Result<HashMap<LowerName, Vec<IpAddr>>, Error> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Backend(HostsBackend::NAME.to_string(), format!("{}: {e}", path.display())))?;
    Ok(parse_hosts(&text))
}

fn parse_hosts(text: &str) -> HashMap<LowerName, Vec<IpAddr>> {
    let mut entries: HashMap<LowerName, Vec<IpAddr>> = HashMap::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let Some(Ok(addr)) = fields.next().map(IpAddr::from_str) else {
            continue;
        };
        for host in fields {
            let Ok(mut name) = Name::from_ascii(host) else {
                continue;
            };
            name.set_fqdn(true);
            let addrs = entries.entry(LowerName::from(name)).or_default();
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lower(name: &str) -> LowerName {
        LowerName::from(Name::from_ascii(name).unwrap())
    }

    #[test]
    fn builtin_table() {
        let names = BuiltinNames::new("ns1.example.net");
        assert_eq!(
            names.lookup(&lower("HOSTNAME.BIND.")).unwrap(),
            ["ns1.example.net".to_string()]
        );
        assert!(names.lookup(&lower("version.bind."))
            .unwrap()[0]
            .starts_with("namecrab "));
        assert!(names.lookup(&lower("example.com.")).is_none());
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn hosts_parsing() {
        let entries = parse_hosts(
            "# comment\n\
             127.0.0.1  localhost loopback\n\
             ::1        localhost # trailing\n\
             bogus      ignored.example\n\
             10.0.0.5   Printer.LAN\n",
        );
        assert_eq!(
            entries[&lower("localhost.")],
            vec![
                "127.0.0.1".parse::<IpAddr>().unwrap(),
                "::1".parse::<IpAddr>().unwrap()
            ]
        );
        assert!(entries.contains_key(&lower("printer.lan.")));
        assert!(!entries.contains_key(&lower("ignored.example.")));
    }

    #[test]
    fn registry_with_hosts_backend() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "192.0.2.1 host.test").unwrap();
        let hosts = Arc::new(HostsBackend::load(f.path()).unwrap());

        let registry = BackendRegistry::new();
        registry.register(hosts.clone()).unwrap();
        assert!(matches!(
            registry.register(hosts),
            Err(Error::Backend(name, _)) if name == "hosts"
        ));
        assert_eq!(
            registry.lookup(&lower("host.test.")),
            Some(vec!["192.0.2.1".parse::<IpAddr>().unwrap()])
        );

        writeln!(f, "192.0.2.2 other.test").unwrap();
        assert!(registry.reload_all().is_empty());
        assert!(registry.lookup(&lower("other.test.")).is_some());

        assert_eq!(registry.unregister_all(), vec!["hosts".to_string()]);
        assert!(registry.lookup(&lower("host.test.")).is_none());
    }

    #[test]
    fn missing_hosts_file() {
        assert!(matches!(
            HostsBackend::load("/nonexistent/hosts"),
            Err(Error::Backend(_, _))
        ));
    }
}
