//! The server context seam.
//!
//! The bootstrap sequence only ever talks to the name server through [`ServerFactory`] and
//! [`ServerContext`]. The crate's own responder lives in [`crate::dns`]; tests plug in fakes.
use crate::backends::{BackendRegistry, BuiltinNames};
use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::managers::ResourceManagerSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Behaviour switches applied to a server context before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerOption {
    /// Advertise recursion as available in every response.
    ClientTest,
    /// Silently drop queries carrying an EDNS OPT record.
    DropEdns,
    /// Never include an OPT record in responses.
    NoEdns,
    /// Leave the SOA out of negative responses.
    NoSoa,
    /// Clear the authoritative answer flag.
    NoAa,
    /// Answer NXDOMAIN for empty non-terminals instead of NODATA.
    NoNearest,
    /// Don't listen on TCP.
    NoTcp,
    /// Answer addresses in configured order instead of rotating them.
    FixedLocal,
    DisableIpv4,
    DisableIpv6,
}

impl ServerOption {
    pub const ALL: [ServerOption; 10] = [
        ServerOption::ClientTest,
        ServerOption::DropEdns,
        ServerOption::NoEdns,
        ServerOption::NoSoa,
        ServerOption::NoAa,
        ServerOption::NoNearest,
        ServerOption::NoTcp,
        ServerOption::FixedLocal,
        ServerOption::DisableIpv4,
        ServerOption::DisableIpv6,
    ];

    pub(crate) fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for ServerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerOption::ClientTest => "clienttest",
            ServerOption::DropEdns => "dropedns",
            ServerOption::NoEdns => "noedns",
            ServerOption::NoSoa => "nosoa",
            ServerOption::NoAa => "noaa",
            ServerOption::NoNearest => "nonearest",
            ServerOption::NoTcp => "notcp",
            ServerOption::FixedLocal => "fixedlocal",
            ServerOption::DisableIpv4 => "disable-ipv4",
            ServerOption::DisableIpv6 => "disable-ipv6",
        })
    }
}

/// A created name server.
pub trait ServerContext: Send {
    fn set_option(&mut self, option: ServerOption, value: bool);

    /// Delay added before every response.
    fn set_delay(&mut self, delay: Duration);

    /// Bind listeners and begin answering queries.
    ///
    /// # Errors
    ///
    /// [`Error::Server`] or [`Error::IO`] when no listener could be set up.
    fn start(&mut self) -> Result<(), Error>;

    /// Ask the server to reload its data. Returns immediately; the reload runs on the task
    /// scheduler and reports its own outcome.
    fn request_reload(&self);

    /// # Errors
    ///
    /// [`Error::Server`] when the server couldn't be shut down cleanly.
    fn destroy(self: Box<Self>) -> Result<(), Error>;
}

/// What a [`ServerFactory`] is given to build a server from.
pub struct ServerResources<'a> {
    pub managers: &'a ResourceManagerSet,
    pub config: &'a RuntimeConfig,
    pub builtin: Arc<BuiltinNames>,
    pub backends: Arc<BackendRegistry>,
}

pub trait ServerFactory {
    /// # Errors
    ///
    /// [`Error::Server`] (or the underlying error) when the server can't be created.
    fn create(&self, resources: ServerResources<'_>) -> Result<Box<dyn ServerContext>, Error>;
}
