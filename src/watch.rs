//! Waiting for zone serials to converge.
//!
//! Zone transfers happen asynchronously. The only way to learn that a
//! server has caught up without relying on server internals is to ask it
//! for its serials repeatedly until they satisfy a [`Condition`] relative
//! to a baseline [`SerialSnapshot`] or a deadline passes. This is what the
//! [`Watcher`] does.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use domain::base::Serial;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info};

use crate::config::PollConfig;
use crate::server::Server;
use crate::zone::{SerialSnapshot, ZoneName, ZoneSet};

//------------ Condition -----------------------------------------------------

/// The relation an observed serial must have to the expected one.
///
/// Serials are compared using the sequence space arithmetic of RFC 1982.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Condition {
    /// The observed serial is equal to or newer than the expected one.
    #[default]
    AtLeast,

    /// The observed serial is the expected one.
    Exact,

    /// The observed serial is newer than the expected one.
    Newer,
}

impl Condition {
    /// Returns whether `observed` satisfies the condition.
    ///
    /// Without an expected serial, any observed serial does.
    pub fn is_satisfied(
        self,
        observed: Serial,
        expected: Option<Serial>,
    ) -> bool {
        let Some(expected) = expected else {
            return true;
        };
        match self {
            Condition::AtLeast => observed == expected || observed > expected,
            Condition::Exact => observed == expected,
            Condition::Newer => observed > expected,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Condition::AtLeast => "at least",
            Condition::Exact => "exactly",
            Condition::Newer => "newer than",
        })
    }
}

//------------ Watcher -------------------------------------------------------

/// Polls a server's serials until they converge.
#[derive(Clone, Copy, Debug)]
pub struct Watcher {
    interval: Duration,
    timeout: Duration,
}

impl Watcher {
    pub fn new(config: &PollConfig) -> Self {
        Watcher {
            interval: config.interval(),
            timeout: config.timeout(),
        }
    }

    /// Waits until `server` has serials for all `zones` satisfying
    /// `condition` relative to `baseline`.
    ///
    /// Zones missing from the baseline only need to be present on the
    /// server. Returns the serials as observed when each zone became
    /// satisfied.
    ///
    /// Failing queries are taken as "not there yet". So are queries still
    /// unanswered at the deadline, or one poll interval into the round if
    /// that is later. Once the configured timeout has passed, a final
    /// round of queries is made before giving up with a
    /// [`ConvergenceTimeout`].
    pub async fn wait_serials<S: Server>(
        &self,
        zones: &ZoneSet,
        server: &S,
        baseline: Option<&SerialSnapshot>,
        condition: Condition,
    ) -> Result<SerialSnapshot, WatchError> {
        if let Some(baseline) = baseline {
            if let Some(zone) = baseline.zones().find(|z| !zones.contains(z))
            {
                return Err(WatchError::Unlinked(zone.clone()));
            }
        }
        let expected =
            |zone: &ZoneName| baseline.and_then(|base| base.get(zone));

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut pending: BTreeMap<ZoneName, Option<Serial>> =
            zones.iter().map(|zone| (zone.clone(), None)).collect();
        let mut res = SerialSnapshot::new();

        loop {
            let round_deadline = deadline.max(Instant::now() + self.interval);
            for (zone, observed) in pending.iter_mut() {
                let query = server.zone_serial(zone);
                let Ok(answer) = timeout_at(round_deadline, query).await
                else {
                    debug!(
                        "{}: serial query for zone {zone} timed out",
                        server.name()
                    );
                    continue;
                };
                match answer {
                    Ok(serial) => {
                        debug!(
                            "{}: zone {zone} has serial {serial}",
                            server.name()
                        );
                        *observed = Some(serial)
                    }
                    Err(err) => {
                        debug!(
                            "{}: no serial for zone {zone} yet: {err}",
                            server.name()
                        );
                    }
                }
            }

            pending.retain(|zone, observed| match *observed {
                Some(serial)
                    if condition.is_satisfied(serial, expected(zone)) =>
                {
                    res.insert(zone.clone(), serial);
                    false
                }
                _ => true,
            });

            if pending.is_empty() {
                info!(
                    "{}: serials converged after {:?}: {res}",
                    server.name(),
                    started.elapsed()
                );
                return Ok(res);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WatchError::Timeout(ConvergenceTimeout {
                    server: server.name().into(),
                    condition,
                    waited: now - started,
                    zones: pending
                        .into_iter()
                        .map(|(zone, observed)| Unsatisfied {
                            expected: expected(&zone),
                            zone,
                            observed,
                        })
                        .collect(),
                }));
            }
            sleep_until(deadline.min(now + self.interval)).await;
        }
    }
}

//------------ ConvergenceTimeout --------------------------------------------

/// Serials did not converge before the deadline.
#[derive(Clone, Debug)]
pub struct ConvergenceTimeout {
    /// The server that was polled.
    pub server: String,

    /// The condition that was waited for.
    pub condition: Condition,

    /// How long the watcher waited.
    pub waited: Duration,

    /// The zones that did not satisfy the condition.
    pub zones: Vec<Unsatisfied>,
}

impl fmt::Display for ConvergenceTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} did not converge within {:?}:",
            self.server, self.waited
        )?;
        for zone in &self.zones {
            write!(f, " zone {} has ", zone.zone)?;
            match zone.observed {
                Some(serial) => write!(f, "serial {serial}")?,
                None => f.write_str("no serial")?,
            }
            match zone.expected {
                Some(serial) => {
                    write!(f, ", expected {} {serial};", self.condition)?
                }
                None => f.write_str(", expected any serial;")?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for ConvergenceTimeout {}

/// A zone that did not reach the expected serial.
#[derive(Clone, Debug)]
pub struct Unsatisfied {
    pub zone: ZoneName,

    /// The last serial observed, if any.
    pub observed: Option<Serial>,

    /// The serial from the baseline, if any.
    pub expected: Option<Serial>,
}

//------------ WatchError ----------------------------------------------------

#[derive(Clone, Debug)]
pub enum WatchError {
    /// Serials did not converge in time.
    Timeout(ConvergenceTimeout),

    /// The baseline contains a zone that is not linked.
    Unlinked(ZoneName),
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Timeout(err) => err.fmt(f),
            WatchError::Unlinked(zone) => {
                write!(f, "zone {zone} is not linked")
            }
        }
    }
}

impl std::error::Error for WatchError {}

//============ Testing =======================================================
