//! Error types of a scenario run.

use std::fmt;

use crate::capture::CaptureError;
use crate::diff::{DiffError, Mismatch};
use crate::server::ServerError;
use crate::update::UpdateError;
use crate::watch::{ConvergenceTimeout, WatchError};
use crate::zone::ZoneName;

//------------ ScenarioError -------------------------------------------------

/// The reason a scenario run failed.
#[derive(Debug)]
pub enum ScenarioError {
    /// No zones to transfer were given.
    NoZones,

    /// The run could not be set up.
    StartupFailure(StartupFailure),

    /// The servers did not reach the expected serials in time.
    ConvergenceTimeout(ConvergenceTimeout),

    /// A zone was expected that isn't linked between the servers.
    UnlinkedZone(ZoneName),

    /// The secondary's zone content differs from the primary's.
    ContentMismatch(Vec<Mismatch>),

    /// An update for the zone didn't change anything.
    EmptyUpdate(ZoneName),

    /// The primary did not move to a new serial after an update.
    SerialNotAdvanced(ConvergenceTimeout),

    /// A lifecycle operation on a server failed.
    Server {
        server: String,
        operation: &'static str,
        err: ServerError,
    },

    /// Zone content could not be fetched for comparison.
    Diff(DiffError),

    /// Injecting an update failed.
    Update { zone: ZoneName, err: UpdateError },
}

impl From<WatchError> for ScenarioError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::Timeout(timeout) => {
                ScenarioError::ConvergenceTimeout(timeout)
            }
            WatchError::Unlinked(zone) => ScenarioError::UnlinkedZone(zone),
        }
    }
}

impl From<StartupFailure> for ScenarioError {
    fn from(err: StartupFailure) -> Self {
        ScenarioError::StartupFailure(err)
    }
}

impl From<DiffError> for ScenarioError {
    fn from(err: DiffError) -> Self {
        ScenarioError::Diff(err)
    }
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::NoZones => f.write_str("no zones configured"),
            ScenarioError::StartupFailure(err) => {
                write!(f, "startup failed: {err}")
            }
            ScenarioError::ConvergenceTimeout(err) => write!(f, "{err}"),
            ScenarioError::UnlinkedZone(zone) => {
                write!(f, "zone {zone} is not linked")
            }
            ScenarioError::ContentMismatch(mismatches) => {
                write!(f, "{} content differences", mismatches.len())?;
                for mismatch in mismatches {
                    write!(f, "\n  {mismatch}")?;
                }
                Ok(())
            }
            ScenarioError::EmptyUpdate(zone) => {
                write!(f, "update of zone {zone} changed nothing")
            }
            ScenarioError::SerialNotAdvanced(err) => {
                write!(f, "serial not advanced after update: {err}")
            }
            ScenarioError::Server {
                server,
                operation,
                err,
            } => write!(f, "{operation} of {server} failed: {err}"),
            ScenarioError::Diff(err) => write!(f, "{err}"),
            ScenarioError::Update { zone, err } => {
                write!(f, "update of zone {zone} failed: {err}")
            }
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScenarioError::StartupFailure(err) => Some(err),
            ScenarioError::ConvergenceTimeout(err)
            | ScenarioError::SerialNotAdvanced(err) => Some(err),
            ScenarioError::Server { err, .. } => Some(err),
            ScenarioError::Diff(err) => Some(err),
            ScenarioError::Update { err, .. } => Some(err),
            _ => None,
        }
    }
}

//------------ StartupFailure ------------------------------------------------

/// Something that is needed for the run could not be started.
#[derive(Debug)]
pub enum StartupFailure {
    /// The traffic capture didn't start.
    Capture(CaptureError),

    /// A server didn't start.
    Server { server: String, err: ServerError },
}

impl fmt::Display for StartupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupFailure::Capture(err) => write!(f, "capture: {err}"),
            StartupFailure::Server { server, err } => {
                write!(f, "{server}: {err}")
            }
        }
    }
}

impl std::error::Error for StartupFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupFailure::Capture(err) => Some(err),
            StartupFailure::Server { err, .. } => Some(err),
        }
    }
}
