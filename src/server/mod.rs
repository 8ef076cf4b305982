//! The name servers taking part in a scenario.
//!
//! The scenario does not care how a name server is run. It only needs the
//! operations of the [`Server`] trait: bringing the server up, making it
//! re-read its configuration, replacing its certificate material, and
//! asking it for the serial of a zone.
//!
//! The [`external`] module provides an implementation that runs configured
//! commands, which is what is used for testing real server software.

use std::future::Future;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::{fmt, io};

use domain::base::Serial;
use domain::tsig::Key;

use crate::wire::WireError;
use crate::zone::ZoneName;

pub mod external;

//------------ Server --------------------------------------------------------

/// A name server instance under test.
///
/// All lifecycle operations return once their effect can be observed from
/// the outside, e.g., once the server accepts connections after a start.
pub trait Server {
    /// Returns the name of the server used in logs and reports.
    fn name(&self) -> &str;

    /// Returns the address answering plain DNS queries over TCP.
    fn query_addr(&self) -> SocketAddr;

    /// Returns the port the server accepts DNS over TLS on.
    fn tls_port(&self) -> u16;

    /// Returns the TSIG key for signing requests to the query address.
    fn tsig_key(&self) -> Option<&Key> {
        None
    }

    /// Starts the server.
    fn start(&mut self) -> impl Future<Output = Result<(), ServerError>>;

    /// Makes the running server re-read its configuration.
    fn reload(&mut self) -> impl Future<Output = Result<(), ServerError>>;

    /// Writes a fresh configuration for the server.
    fn generate_config(
        &mut self,
    ) -> impl Future<Output = Result<(), ServerError>>;

    /// Replaces the server's TLS certificate and key.
    fn regenerate_certificate(
        &mut self,
    ) -> impl Future<Output = Result<(), ServerError>>;

    /// Returns the serial the server currently has for `zone`.
    fn zone_serial(
        &self,
        zone: &ZoneName,
    ) -> impl Future<Output = Result<Serial, ServerError>>;
}

//------------ ServerError ---------------------------------------------------

/// An operation on a server failed.
#[derive(Debug)]
pub enum ServerError {
    /// A command could not be launched.
    Spawn { command: String, err: io::Error },

    /// A command finished unsuccessfully.
    Status { command: String, status: ExitStatus },

    /// The server process exited while it should be running.
    Exited(ExitStatus),

    /// The server did not accept connections in time.
    NotListening(SocketAddr),

    /// Querying the server failed.
    Query(WireError),

    /// Some other failure reported by a server implementation.
    Other(String),
}

impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        ServerError::Query(err)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Spawn { command, err } => {
                write!(f, "cannot run '{command}': {err}")
            }
            ServerError::Status { command, status } => {
                write!(f, "'{command}' failed: {status}")
            }
            ServerError::Exited(status) => {
                write!(f, "server process exited: {status}")
            }
            ServerError::NotListening(addr) => {
                write!(f, "server not listening on {addr}")
            }
            ServerError::Query(err) => write!(f, "query failed: {err}"),
            ServerError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Spawn { err, .. } => Some(err),
            ServerError::Query(err) => Some(err),
            _ => None,
        }
    }
}
