//! namecrab
//!
//! The process side of an authoritative DNS name server: configuration, privilege handling,
//! daemonization, the resource managers the server runs on, the run loop that turns signals
//! into reloads and shutdowns, and an orderly teardown.
//!
//! The entry point is [`app::Bootstrap`]. The name server itself sits behind the
//! [`server::ServerFactory`] seam; [`dns::NameServerFactory`] is the built-in implementation,
//! serving A and AAAA records for a single configured domain with `trust-dns-server`.
//!
#![warn(clippy::pedantic)]

pub mod app;
pub mod backends;
pub mod config;
pub mod dns;
pub mod error;
pub mod log;
pub mod managers;
pub mod os;
pub mod privilege;
pub mod report;
pub mod server;

pub use config::RuntimeConfig;
pub use error::Error;
