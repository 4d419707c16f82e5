//! Authoritative DNS responder.
//!
//! The [`NameServer`] is the server context the bootstrap sequence creates. It answers
//! queries for the zone described by the `server` section of the configuration file.
//!
//! # A/AAAA
//!
//! Namecrab will serve a response to `A` or `AAAA` class queries for each FQDN in the config
//! [`ServerSettings::addrs`][`crate::config::ServerSettings::addrs`] map. Only IPv4 values will
//! be used for `A` class queries, and IPv6 values for `AAAA`. When a name has several addresses
//! their order rotates between responses unless the `fixedlocal` test option is set.
//!
//! E.g. with config:
//! ```json
//!   "addrs": {
//!     "www.example.com.": ["93.184.216.34", "2606:2800:220:1:248:1893:25c8:1946" ]
//!   },
//! ```
//!
//! A `A` class query for `www.example.com` would return:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 www.example.com +short A
//! 93.184.216.34
//! ```
//!
//! Names the zone doesn't know are looked up in the registered
//! [backends][crate::backends::BackendRegistry] before giving up.
//!
//! ## NS and SOA
//!
//! At the apex of [`ServerSettings::domain`][`crate::config::ServerSettings::domain`] a `NS`
//! query returns [`ServerSettings::ns_domain`][`crate::config::ServerSettings::ns_domain`] and
//! a `SOA` query returns a record built from `ns_domain` and `ns_admin`:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 example.com +short SOA
//! ns1.example.com. dns-admin.example.com. 20230312 86400 7200 3600000 300
//! ```
//!
//! _Note: The zone serial (`20230312`) will differ based on the date the query is performed._
//!
//! ## Negative answers
//!
//! Names inside the zone without data get `NXDOMAIN`, or `NOERROR` with no answers when the
//! name exists but not with the requested type. The SOA goes in the authority section of both.
//! Names outside the zone are `REFUSED`.
//!
//! ## CHAOS
//!
//! `TXT` queries in the `CH` class are answered from the
//! [builtin names][crate::backends::BuiltinNames]:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 version.bind CH TXT +short
//! "namecrab 0.1.0"
//! ```

mod handlers;
pub mod server;
mod zone;

pub use server::{NameServer, NameServerFactory};
