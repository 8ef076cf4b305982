//! Changing zone content on the primary.
//!
//! To see that changes made on the primary reach the secondary, the
//! scenario makes the primary change its zones through dynamic updates.
//! The [`RandomUpdater`] adds A records with random owners and removes some
//! of the records it added earlier.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;

use domain::base::name::FromStrError;
use domain::base::Name;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::server::Server;
use crate::wire::{self, Change, WireError};
use crate::zone::ZoneName;

/// Length of the random label of added owner names.
const LABEL_LEN: usize = 12;

//------------ UpdateInjector ------------------------------------------------

/// Makes the primary change the content of a zone.
pub trait UpdateInjector {
    /// Applies a randomly chosen set of changes to `zone` on `primary`.
    ///
    /// Unless `allow_empty` is given, at least one change is made.
    fn inject_random_update<P: Server>(
        &self,
        primary: &P,
        zone: &ZoneName,
        allow_empty: bool,
    ) -> impl Future<Output = Result<UpdateSummary, UpdateError>>;
}

//------------ UpdateSummary -------------------------------------------------

/// What an injected update changed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UpdateSummary {
    pub added: usize,
    pub deleted: usize,
}

impl UpdateSummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.deleted == 0
    }
}

impl fmt::Display for UpdateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} added, {} deleted", self.added, self.deleted)
    }
}

//------------ RandomUpdater -------------------------------------------------

/// Sends dynamic updates with random changes.
///
/// The updater remembers the records it added to each zone so later updates
/// can delete some of them again.
#[derive(Debug)]
pub struct RandomUpdater {
    max_changes: usize,
    rng: Mutex<StdRng>,
    added: Mutex<HashMap<ZoneName, Vec<(ZoneName, Ipv4Addr)>>>,
}

impl RandomUpdater {
    /// Creates an updater adding up to `max_changes` records per update.
    pub fn new(max_changes: usize) -> Self {
        Self::with_rng(max_changes, StdRng::from_entropy())
    }

    /// Creates an updater with a fixed seed for reproducible changes.
    pub fn with_seed(max_changes: usize, seed: u64) -> Self {
        Self::with_rng(max_changes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(max_changes: usize, rng: StdRng) -> Self {
        RandomUpdater {
            max_changes: max_changes.max(1),
            rng: Mutex::new(rng),
            added: Default::default(),
        }
    }

    /// Returns the records currently added to `zone` by this updater.
    pub fn added(&self, zone: &ZoneName) -> Vec<(ZoneName, Ipv4Addr)> {
        self.added.lock().get(zone).cloned().unwrap_or_default()
    }

    fn apply(&self, zone: &ZoneName, changes: &[Change]) -> UpdateSummary {
        let mut added = self.added.lock();
        let records = added.entry(zone.clone()).or_default();
        let mut res = UpdateSummary::default();
        for change in changes {
            match change {
                Change::Add(owner, ip) => {
                    records.push((owner.clone(), *ip));
                    res.added += 1;
                }
                Change::Delete(owner, ip) => {
                    records.retain(|(o, i)| !(o == owner && i == ip));
                    res.deleted += 1;
                }
            }
        }
        res
    }
}

impl UpdateInjector for RandomUpdater {
    async fn inject_random_update<P: Server>(
        &self,
        primary: &P,
        zone: &ZoneName,
        allow_empty: bool,
    ) -> Result<UpdateSummary, UpdateError> {
        let changes = {
            let previous = self.added(zone);
            let mut rng = self.rng.lock();
            plan(&mut *rng, zone, &previous, self.max_changes, allow_empty)?
        };
        if changes.is_empty() {
            debug!("Empty update for zone {zone}, nothing sent");
            return Ok(UpdateSummary::default());
        }
        for change in &changes {
            debug!("Update for zone {zone}: {change:?}");
        }
        wire::update(primary.query_addr(), zone, &changes, primary.tsig_key())
            .await?;
        let res = self.apply(zone, &changes);
        info!("Updated zone {zone} on {}: {res}", primary.name());
        Ok(res)
    }
}

//------------ plan ----------------------------------------------------------

/// Picks the changes for one update of the zone at `apex`.
///
/// Adds between one, or zero if `allow_empty` is set, and `max_changes` A
/// records below the apex. Also deletes up to half of the `previous`ly
/// added records.
pub fn plan<R: Rng + ?Sized>(
    rng: &mut R,
    apex: &ZoneName,
    previous: &[(ZoneName, Ipv4Addr)],
    max_changes: usize,
    allow_empty: bool,
) -> Result<Vec<Change>, FromStrError> {
    let max_changes = max_changes.max(1);
    let adds = if allow_empty {
        rng.gen_range(0..=max_changes)
    } else {
        rng.gen_range(1..=max_changes)
    };
    let deletes = rng.gen_range(0..=previous.len() / 2);

    let mut res = Vec::with_capacity(adds + deletes);
    for _ in 0..adds {
        res.push(Change::Add(random_owner(rng, apex)?, random_addr(rng)));
    }
    res.extend(
        previous
            .choose_multiple(rng, deletes)
            .map(|(owner, ip)| Change::Delete(owner.clone(), *ip)),
    );
    Ok(res)
}

fn random_owner<R: Rng + ?Sized>(
    rng: &mut R,
    apex: &ZoneName,
) -> Result<ZoneName, FromStrError> {
    let label: String = (0..LABEL_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
        .collect();
    if apex.is_root() {
        Name::bytes_from_str(&format!("{label}."))
    } else {
        Name::bytes_from_str(&format!("{label}.{apex}."))
    }
}

fn random_addr<R: Rng + ?Sized>(rng: &mut R) -> Ipv4Addr {
    Ipv4Addr::new(10, rng.gen(), rng.gen(), rng.gen_range(1..=254))
}

//------------ UpdateError ---------------------------------------------------

/// An update could not be applied.
#[derive(Debug)]
pub enum UpdateError {
    /// A random owner name could not be built.
    Name(FromStrError),

    /// Sending the update failed or the primary refused it.
    Wire(WireError),
}

impl From<FromStrError> for UpdateError {
    fn from(err: FromStrError) -> Self {
        UpdateError::Name(err)
    }
}

impl From<WireError> for UpdateError {
    fn from(err: WireError) -> Self {
        UpdateError::Wire(err)
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Name(err) => write!(f, "bad owner name: {err}"),
            UpdateError::Wire(err) => write!(f, "update failed: {err}"),
        }
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpdateError::Name(err) => Some(err),
            UpdateError::Wire(err) => Some(err),
        }
    }
}

//============ Testing =======================================================
