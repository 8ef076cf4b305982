//! Interoperability testing of zone transfers over TLS.
//!
//! This crate drives a scenario checking that zones transferred from a
//! primary name server to a secondary name server over TLS (XoT, RFC 9103)
//! arrive intact, keep arriving after the TLS certificate and configuration
//! have been replaced, and follow dynamic updates on the primary. The name
//! servers themselves are external programs. The crate only starts and
//! stops them, observes them via plain DNS queries and records the traffic
//! between them.
//!
//! # Modules
//!
//! * [scenario] contains the driver sequencing a run and the report it
//!   produces,
//! * [server] defines what the driver needs from a name server and
//!   provides an implementation running external commands,
//! * [watch] waits for zone serials to converge,
//! * [diff] compares zone content between the servers,
//! * [update] changes zone content on the primary,
//! * [capture] records the traffic of a run,
//! * [wire] implements the DNS exchanges used by the above,
//! * [zone] has the types describing zones and their serials, and
//! * [config] and [logging] provide the run-time setup.
//!
//! The `xfr-tls-scenario` binary runs the scenario for servers described
//! in a YAML configuration file.

pub mod capture;
pub mod config;
pub mod diff;
pub mod error;
pub mod logging;
pub mod scenario;
pub mod server;
pub mod update;
pub mod watch;
pub mod wire;
pub mod zone;
