//! Comparing zone content between primary and secondary.
//!
//! Matching serials only tell that a transfer happened. Whether the
//! secondary actually ended up with the same data as the primary is
//! checked by a [`ContentDiffer`]. The [`AxfrDiffer`] transfers each zone
//! from both servers and compares the resulting record sets.

use std::fmt;
use std::future::Future;

use domain::base::Serial;
use tracing::{debug, info};

use crate::server::Server;
use crate::wire::{self, WireError, ZoneContent};
use crate::zone::{SerialSnapshot, ZoneName, ZoneSet};

//------------ ContentDiffer -------------------------------------------------

/// Compares zone content of a primary and a secondary.
pub trait ContentDiffer {
    /// Returns all differences between the two servers for `zones`.
    ///
    /// An empty list means the content is identical. If a baseline is
    /// given, it holds the serials the zones had before the latest
    /// changes.
    fn diff<P: Server, S: Server>(
        &self,
        primary: &P,
        secondary: &S,
        zones: &ZoneSet,
        baseline: Option<&SerialSnapshot>,
    ) -> impl Future<Output = Result<Vec<Mismatch>, DiffError>>;
}

//------------ Mismatch ------------------------------------------------------

/// A single difference found between primary and secondary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mismatch {
    pub zone: ZoneName,
    pub kind: MismatchKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MismatchKind {
    /// The servers have different serials for the zone.
    SerialDiffers { primary: Serial, secondary: Serial },

    /// The primary's serial has not moved past the baseline.
    NotAdvanced { baseline: Serial, primary: Serial },

    /// A record of the primary is missing on the secondary.
    MissingOnSecondary(String),

    /// The secondary has a record the primary doesn't have.
    UnexpectedOnSecondary(String),
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone {}: ", self.zone)?;
        match &self.kind {
            MismatchKind::SerialDiffers { primary, secondary } => write!(
                f,
                "serial {secondary} on secondary, {primary} on primary"
            ),
            MismatchKind::NotAdvanced { baseline, primary } => write!(
                f,
                "primary serial {primary} not newer than {baseline}"
            ),
            MismatchKind::MissingOnSecondary(record) => {
                write!(f, "missing on secondary: {record}")
            }
            MismatchKind::UnexpectedOnSecondary(record) => {
                write!(f, "unexpected on secondary: {record}")
            }
        }
    }
}

//------------ compare -------------------------------------------------------

/// Compares the content of one zone as transferred from both servers.
pub fn compare(
    zone: &ZoneName,
    primary: &ZoneContent,
    secondary: &ZoneContent,
    baseline: Option<Serial>,
) -> Vec<Mismatch> {
    let mismatch = |kind| Mismatch {
        zone: zone.clone(),
        kind,
    };
    let mut res = Vec::new();

    if let Some(baseline) = baseline {
        if !(primary.serial > baseline) {
            res.push(mismatch(MismatchKind::NotAdvanced {
                baseline,
                primary: primary.serial,
            }));
        }
    }
    if primary.serial != secondary.serial {
        res.push(mismatch(MismatchKind::SerialDiffers {
            primary: primary.serial,
            secondary: secondary.serial,
        }));
    }
    res.extend(
        primary.records.difference(&secondary.records).map(|record| {
            mismatch(MismatchKind::MissingOnSecondary(record.clone()))
        }),
    );
    res.extend(
        secondary.records.difference(&primary.records).map(|record| {
            mismatch(MismatchKind::UnexpectedOnSecondary(record.clone()))
        }),
    );
    res
}

//------------ AxfrDiffer ----------------------------------------------------

/// Compares zones by transferring them from both servers via AXFR.
#[derive(Clone, Copy, Debug, Default)]
pub struct AxfrDiffer;

impl AxfrDiffer {
    pub fn new() -> Self {
        AxfrDiffer
    }

    async fn transfer<S: Server>(
        server: &S,
        zone: &ZoneName,
    ) -> Result<ZoneContent, DiffError> {
        let content = wire::axfr(server.query_addr(), zone, server.tsig_key())
            .await
            .map_err(|err| DiffError {
                server: server.name().into(),
                zone: zone.clone(),
                err,
            })?;
        debug!(
            "{}: transferred zone {zone} with serial {} and {} records",
            server.name(),
            content.serial,
            content.records.len()
        );
        Ok(content)
    }
}

impl ContentDiffer for AxfrDiffer {
    async fn diff<P: Server, S: Server>(
        &self,
        primary: &P,
        secondary: &S,
        zones: &ZoneSet,
        baseline: Option<&SerialSnapshot>,
    ) -> Result<Vec<Mismatch>, DiffError> {
        let mut res = Vec::new();
        for zone in zones {
            let ours = Self::transfer(primary, zone).await?;
            let theirs = Self::transfer(secondary, zone).await?;
            res.extend(compare(
                zone,
                &ours,
                &theirs,
                baseline.and_then(|base| base.get(zone)),
            ));
        }
        info!(
            "Compared {} zones of {} and {}: {} differences",
            zones.len(),
            primary.name(),
            secondary.name(),
            res.len()
        );
        Ok(res)
    }
}

//------------ DiffError -----------------------------------------------------

/// A zone could not be transferred for comparison.
#[derive(Debug)]
pub struct DiffError {
    pub server: String,
    pub zone: ZoneName,
    pub err: WireError,
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot transfer zone {} from {}: {}",
            self.zone, self.server, self.err
        )
    }
}

impl std::error::Error for DiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

//============ Testing =======================================================
