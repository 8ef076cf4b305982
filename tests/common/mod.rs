//! Stand-ins for the collaborators of a scenario run.
#![allow(dead_code)]

pub mod dns;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use domain::base::Serial;
use xfr_interop::config::{PollConfig, ScenarioConfig};
use xfr_interop::diff::{ContentDiffer, DiffError, Mismatch, MismatchKind};
use xfr_interop::server::{Server, ServerError};
use xfr_interop::update::{UpdateError, UpdateInjector, UpdateSummary};
use xfr_interop::zone::{parse_zone_names, SerialSnapshot, ZoneName, ZoneSet};

//------------ Zones ---------------------------------------------------------

/// The serials of the zones a fake server has loaded.
pub type Zones = Rc<RefCell<BTreeMap<ZoneName, u32>>>;

pub fn zones(list: &[(&str, u32)]) -> Zones {
    Rc::new(RefCell::new(
        list.iter()
            .map(|(name, serial)| (zone(name), *serial))
            .collect(),
    ))
}

pub fn zone(name: &str) -> ZoneName {
    parse_zone_names([name]).unwrap().remove(0)
}

//------------ Operations ----------------------------------------------------

/// A log of the lifecycle operations on all fake servers.
pub type Operations = Rc<RefCell<Vec<String>>>;

//------------ FakeServer ----------------------------------------------------

/// A server answering serial queries from memory.
///
/// A server with an upstream copies the upstream's serials whenever it is
/// asked for a serial, imitating an immediate zone transfer. With
/// `detach_on_reload`, it stops doing so after a reload.
pub struct FakeServer {
    name: String,
    tls_port: u16,
    zones: Zones,
    upstream: Option<Zones>,
    ops: Operations,
    running: bool,
    pub fail_start: bool,
    pub fail_reload: bool,
    pub detach_on_reload: bool,
    pub queries: Cell<usize>,
}

impl FakeServer {
    pub fn primary(zones: Zones, ops: Operations) -> Self {
        FakeServer {
            name: "primary".into(),
            tls_port: 8530,
            zones,
            upstream: None,
            ops,
            running: false,
            fail_start: false,
            fail_reload: false,
            detach_on_reload: false,
            queries: Cell::new(0),
        }
    }

    pub fn secondary(upstream: Option<Zones>, ops: Operations) -> Self {
        FakeServer {
            name: "secondary".into(),
            tls_port: 8531,
            zones: Default::default(),
            upstream,
            ops,
            running: false,
            fail_start: false,
            fail_reload: false,
            detach_on_reload: false,
            queries: Cell::new(0),
        }
    }

    pub fn zones(&self) -> Zones {
        self.zones.clone()
    }

    fn record(&self, op: &str) {
        self.ops.borrow_mut().push(format!("{} {op}", self.name));
    }
}

impl Server for FakeServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 53))
    }

    fn tls_port(&self) -> u16 {
        self.tls_port
    }

    async fn start(&mut self) -> Result<(), ServerError> {
        self.record("start");
        if self.fail_start {
            return Err(ServerError::Other("refusing to start".into()));
        }
        self.running = true;
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), ServerError> {
        self.record("reload");
        if self.fail_reload {
            return Err(ServerError::Other("bad configuration".into()));
        }
        if self.detach_on_reload {
            self.upstream = None;
        }
        Ok(())
    }

    async fn generate_config(&mut self) -> Result<(), ServerError> {
        self.record("config");
        Ok(())
    }

    async fn regenerate_certificate(&mut self) -> Result<(), ServerError> {
        self.record("certificate");
        Ok(())
    }

    async fn zone_serial(
        &self,
        zone: &ZoneName,
    ) -> Result<Serial, ServerError> {
        self.queries.set(self.queries.get() + 1);
        if !self.running {
            return Err(ServerError::Other("not running".into()));
        }
        if let Some(upstream) = self.upstream.as_ref() {
            if let Some(serial) = upstream.borrow().get(zone) {
                self.zones.borrow_mut().insert(zone.clone(), *serial);
            }
        }
        match self.zones.borrow().get(zone) {
            Some(serial) => Ok(Serial(*serial)),
            None => Err(ServerError::Other("zone not loaded".into())),
        }
    }
}

//------------ FakeDiffer ----------------------------------------------------

/// Compares the serials of two fake servers.
///
/// A forced mismatch is reported on the given call, counting from one.
pub struct FakeDiffer {
    primary: Zones,
    secondary: Zones,
    pub mismatch_on_call: Option<usize>,
    pub calls: Cell<usize>,
}

impl FakeDiffer {
    pub fn new(primary: Zones, secondary: Zones) -> Self {
        FakeDiffer {
            primary,
            secondary,
            mismatch_on_call: None,
            calls: Cell::new(0),
        }
    }
}

impl ContentDiffer for FakeDiffer {
    async fn diff<P: Server, S: Server>(
        &self,
        _primary: &P,
        _secondary: &S,
        zones: &ZoneSet,
        _baseline: Option<&SerialSnapshot>,
    ) -> Result<Vec<Mismatch>, DiffError> {
        self.calls.set(self.calls.get() + 1);
        let mut res = Vec::new();
        for zone in zones {
            let primary = self.primary.borrow().get(zone).copied();
            let secondary = self.secondary.borrow().get(zone).copied();
            if primary != secondary {
                res.push(Mismatch {
                    zone: zone.clone(),
                    kind: MismatchKind::SerialDiffers {
                        primary: Serial(primary.unwrap_or_default()),
                        secondary: Serial(secondary.unwrap_or_default()),
                    },
                });
            }
            if self.mismatch_on_call == Some(self.calls.get()) {
                res.push(Mismatch {
                    zone: zone.clone(),
                    kind: MismatchKind::MissingOnSecondary(format!(
                        "www.{zone}. 3600 IN A 192.0.2.1"
                    )),
                });
            }
        }
        Ok(res)
    }
}

//------------ FakeInjector --------------------------------------------------

/// How the fake injector treats an update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateEffect {
    /// The zone changes and its serial is increased.
    Bump,

    /// Nothing is changed and an empty summary returned.
    Empty,

    /// A change is reported but the serial stays the same.
    Stuck,
}

/// Increases the serials of a fake primary.
pub struct FakeInjector {
    primary: Zones,
    pub effect: UpdateEffect,
    pub updates: Cell<usize>,
}

impl FakeInjector {
    pub fn new(primary: Zones, effect: UpdateEffect) -> Self {
        FakeInjector {
            primary,
            effect,
            updates: Cell::new(0),
        }
    }
}

impl UpdateInjector for FakeInjector {
    async fn inject_random_update<P: Server>(
        &self,
        _primary: &P,
        zone: &ZoneName,
        allow_empty: bool,
    ) -> Result<UpdateSummary, UpdateError> {
        assert!(!allow_empty);
        self.updates.set(self.updates.get() + 1);
        match self.effect {
            UpdateEffect::Empty => return Ok(UpdateSummary::default()),
            UpdateEffect::Bump => {
                if let Some(serial) = self.primary.borrow_mut().get_mut(zone) {
                    *serial = serial.wrapping_add(1);
                }
            }
            UpdateEffect::Stuck => {}
        }
        Ok(UpdateSummary {
            added: 1,
            deleted: 0,
        })
    }
}

//------------ Capture -------------------------------------------------------

/// Writes a script standing in for tcpdump into `dir`.
///
/// The script writes to the file given with `-w`, reports on stdout and
/// then sleeps until it receives SIGTERM.
pub fn fake_tcpdump(dir: &Path) -> PathBuf {
    let path = dir.join("fake-tcpdump");
    fs::write(
        &path,
        "#!/bin/sh\n\
         while [ $# -gt 0 ]; do\n\
         if [ \"$1\" = -w ]; then out=\"$2\"; fi\n\
         shift\n\
         done\n\
         echo packets > \"$out\"\n\
         echo listening\n\
         exec sleep 30\n",
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Returns a configuration for fast runs with fake collaborators.
pub fn config(dir: &Path) -> ScenarioConfig {
    let mut config = ScenarioConfig::default();
    config.out_dir = dir.join("out");
    config.poll = PollConfig::new(
        Duration::from_millis(10),
        Duration::from_millis(300),
    );
    config.set_settle(Duration::ZERO);
    config.capture.program = fake_tcpdump(dir);
    config.capture.set_startup_grace(Duration::from_millis(100));
    config.capture.set_stop_timeout(Duration::from_secs(2));
    config
}

/// Returns whether `pid` is a running process.
pub fn is_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } != 0 {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat.contains(") Z "),
        Err(_) => true,
    }
}
