//! Zones under test and the serials observed for them.
//!
//! A scenario works on a [`ZoneSet`]: a number of zones that are served by
//! a primary and transferred to a secondary. What the scenario learns about
//! the state of these zones on either server is kept in a
//! [`SerialSnapshot`].

use std::collections::{btree_map, BTreeMap};
use std::fmt;

use bytes::Bytes;
use domain::base::name::FromStrError;
use domain::base::{Name, Serial};

//------------ ZoneName ------------------------------------------------------

/// The apex name identifying a zone within a run.
pub type ZoneName = Name<Bytes>;

/// Parses a list of zone names given in presentation format.
pub fn parse_zone_names<I, S>(names: I) -> Result<Vec<ZoneName>, FromStrError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| Name::bytes_from_str(name.as_ref()))
        .collect()
}

//------------ ZoneSet -------------------------------------------------------

/// A set of zones linked from a primary to a secondary.
///
/// The set is ordered and free of duplicates. The names of the two servers
/// are shown when the set is displayed; all zones of a set share the same
/// link.
#[derive(Clone, Debug, Default)]
pub struct ZoneSet {
    primary: String,
    secondary: String,
    zones: Vec<ZoneName>,
}

impl ZoneSet {
    /// Links the given zones from `primary` to `secondary`.
    pub fn link<I>(
        zones: I,
        primary: impl Into<String>,
        secondary: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = ZoneName>,
    {
        let mut zones: Vec<_> = zones.into_iter().collect();
        zones.sort();
        zones.dedup();
        ZoneSet {
            primary: primary.into(),
            secondary: secondary.into(),
            zones,
        }
    }

    /// Returns whether `zone` is part of the link.
    pub fn contains(&self, zone: &ZoneName) -> bool {
        self.zones.binary_search(zone).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZoneName> + '_ {
        self.zones.iter()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

impl fmt::Display for ZoneSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.zones.as_slice() {
            [zone] => write!(f, "zone {zone}")?,
            zones => write!(f, "{} zones", zones.len())?,
        }
        write!(f, " from {} to {}", self.primary, self.secondary)
    }
}

impl<'a> IntoIterator for &'a ZoneSet {
    type Item = &'a ZoneName;
    type IntoIter = std::slice::Iter<'a, ZoneName>;

    fn into_iter(self) -> Self::IntoIter {
        self.zones.iter()
    }
}

//------------ SerialSnapshot ------------------------------------------------

/// The serial of each zone as last observed on one server.
///
/// A snapshot returned by the convergence watcher is the baseline for the
/// next wait: "has this zone reached serial S" or "has it moved past S".
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SerialSnapshot {
    serials: BTreeMap<ZoneName, Serial>,
}

impl SerialSnapshot {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records `serial` for `zone`, returning the previously recorded one.
    pub fn insert(&mut self, zone: ZoneName, serial: Serial) -> Option<Serial> {
        self.serials.insert(zone, serial)
    }

    pub fn get(&self, zone: &ZoneName) -> Option<Serial> {
        self.serials.get(zone).copied()
    }

    pub fn zones(&self) -> impl Iterator<Item = &ZoneName> + '_ {
        self.serials.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ZoneName, Serial> {
        self.serials.iter()
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

impl FromIterator<(ZoneName, Serial)> for SerialSnapshot {
    fn from_iter<T: IntoIterator<Item = (ZoneName, Serial)>>(iter: T) -> Self {
        SerialSnapshot {
            serials: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a SerialSnapshot {
    type Item = (&'a ZoneName, &'a Serial);
    type IntoIter = btree_map::Iter<'a, ZoneName, Serial>;

    fn into_iter(self) -> Self::IntoIter {
        self.serials.iter()
    }
}

//--- Display

impl fmt::Display for SerialSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (zone, serial)) in self.serials.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{zone}: {serial}")?;
        }
        f.write_str("}")
    }
}

//============ Testing =======================================================
