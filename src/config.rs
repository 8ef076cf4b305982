//! Configuration of a scenario run.
//!
//! A run is described by a [`ScenarioConfig`] which is usually read from a
//! YAML file. All durations are given in milliseconds. Values that would
//! make the scenario meaningless, such as a zero poll interval, are trimmed
//! into a sane range when they are read through the accessor methods.

use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{fmt, io};

use domain::base::name::FromStrError;
use domain::tsig::{Algorithm, Key, KeyName};
use domain::utils::base64;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::zone::{parse_zone_names, ZoneName};

//------------ DefMinMax -----------------------------------------------------

/// A setting's default and the range its values are trimmed into.
#[derive(Clone, Copy, Debug)]
pub struct DefMinMax<T> {
    def: T,
    min: T,
    max: T,
}

impl<T: Copy + Ord> DefMinMax<T> {
    pub const fn new(def: T, min: T, max: T) -> Self {
        DefMinMax { def, min, max }
    }

    pub fn default(self) -> T {
        self.def
    }

    /// Returns `value` or the range bound it overshoots.
    pub fn limit(self, value: T) -> T {
        value.clamp(self.min, self.max)
    }
}

//------------ Limits --------------------------------------------------------

/// Time between two serial queries while waiting for convergence.
pub const POLL_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(500),
    Duration::from_millis(1),
    Duration::from_secs(10),
);

/// How long to wait for serials to converge before giving up.
pub const POLL_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(60),
    Duration::from_millis(1),
    Duration::from_secs(3600),
);

/// Quiet period after reloading the secondary.
pub const SETTLE: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::ZERO,
    Duration::from_secs(600),
);

/// Number of update cycles to run.
pub const UPDATE_CYCLES: DefMinMax<usize> = DefMinMax::new(1, 1, 10_000);

/// Upper bound on the records added by a single random update.
pub const MAX_CHANGES: DefMinMax<usize> = DefMinMax::new(8, 1, 1000);

/// Time the capture tool gets to come up before it is checked.
pub const CAPTURE_STARTUP_GRACE: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::ZERO,
    Duration::from_secs(60),
);

/// Time the capture tool gets to exit after being asked to terminate.
pub const CAPTURE_STOP_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(5),
    Duration::from_millis(10),
    Duration::from_secs(120),
);

/// Time a server gets until its query address must accept connections.
pub const SERVER_START_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::from_millis(10),
    Duration::from_secs(600),
);

//------------ ScenarioConfig ------------------------------------------------

/// Configuration of a complete scenario run.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Directory receiving the capture artifacts.
    pub out_dir: PathBuf,

    /// The zones transferred from primary to secondary.
    pub zones: Vec<String>,

    pub poll: PollConfig,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    settle: Duration,

    update_cycles: usize,

    pub update: UpdateConfig,

    pub capture: CaptureConfig,

    pub primary: ServerConfig,

    pub secondary: ServerConfig,
}

impl ScenarioConfig {
    /// Reads the configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    /// Reads the configuration from something readable.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, ConfigError> {
        let res: Self = serde_yaml::from_reader(reader)?;
        // Reject bad zone names and keys right away.
        res.zone_names()?;
        for server in [&res.primary, &res.secondary] {
            if let Some(tsig) = server.tsig.as_ref() {
                tsig.key()?;
            }
        }
        Ok(res)
    }

    /// Returns the parsed names of the configured zones.
    pub fn zone_names(&self) -> Result<Vec<ZoneName>, ConfigError> {
        parse_zone_names(&self.zones).map_err(ConfigError::ZoneName)
    }

    /// Returns the quiet period after reloading the secondary.
    pub fn settle(&self) -> Duration {
        SETTLE.limit(self.settle)
    }

    pub fn set_settle(&mut self, value: Duration) {
        self.settle = SETTLE.limit(value)
    }

    /// Returns how many update cycles should be run.
    pub fn update_cycles(&self) -> usize {
        UPDATE_CYCLES.limit(self.update_cycles)
    }

    pub fn set_update_cycles(&mut self, value: usize) {
        self.update_cycles = UPDATE_CYCLES.limit(value)
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            out_dir: PathBuf::from("xfr-interop-out"),
            zones: vec!["example.".into()],
            poll: PollConfig::default(),
            settle: SETTLE.default(),
            update_cycles: UPDATE_CYCLES.default(),
            update: UpdateConfig::default(),
            capture: CaptureConfig::default(),
            primary: ServerConfig::new("primary", 5300, 8530),
            secondary: ServerConfig::new("secondary", 5301, 8531),
        }
    }
}

//------------ PollConfig ----------------------------------------------------

/// Configuration of the convergence polling.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    interval: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        PollConfig {
            interval: POLL_INTERVAL.limit(interval),
            timeout: POLL_TIMEOUT.limit(timeout),
        }
    }

    /// Returns the time between two polling rounds.
    pub fn interval(&self) -> Duration {
        POLL_INTERVAL.limit(self.interval)
    }

    /// Returns the time after which polling gives up.
    pub fn timeout(&self) -> Duration {
        POLL_TIMEOUT.limit(self.timeout)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: POLL_INTERVAL.default(),
            timeout: POLL_TIMEOUT.default(),
        }
    }
}

//------------ UpdateConfig --------------------------------------------------

/// Configuration of the random dynamic updates.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateConfig {
    max_changes: usize,
}

impl UpdateConfig {
    pub fn new(max_changes: usize) -> Self {
        UpdateConfig {
            max_changes: MAX_CHANGES.limit(max_changes),
        }
    }

    /// Returns the maximum number of records added by one update.
    pub fn max_changes(&self) -> usize {
        MAX_CHANGES.limit(self.max_changes)
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            max_changes: MAX_CHANGES.default(),
        }
    }
}

//------------ CaptureConfig -------------------------------------------------

/// Configuration of the packet capture.
///
/// The capture program is invoked as
/// `<program> -i <interface> -w <pcap> <extra_args> <port filter>` which
/// is what `tcpdump` expects.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub program: PathBuf,

    pub interface: String,

    pub extra_args: Vec<String>,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    startup_grace: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    stop_timeout: Duration,
}

impl CaptureConfig {
    pub fn startup_grace(&self) -> Duration {
        CAPTURE_STARTUP_GRACE.limit(self.startup_grace)
    }

    pub fn set_startup_grace(&mut self, value: Duration) {
        self.startup_grace = CAPTURE_STARTUP_GRACE.limit(value)
    }

    pub fn stop_timeout(&self) -> Duration {
        CAPTURE_STOP_TIMEOUT.limit(self.stop_timeout)
    }

    pub fn set_stop_timeout(&mut self, value: Duration) {
        self.stop_timeout = CAPTURE_STOP_TIMEOUT.limit(value)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            program: PathBuf::from("tcpdump"),
            interface: "lo".into(),
            extra_args: Vec::new(),
            startup_grace: CAPTURE_STARTUP_GRACE.default(),
            stop_timeout: CAPTURE_STOP_TIMEOUT.default(),
        }
    }
}

//------------ ServerConfig --------------------------------------------------

/// Configuration of a name server run through external commands.
///
/// Each command is given as a program followed by its arguments. Empty
/// commands are skipped, which is useful for servers that are managed
/// elsewhere.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The name used in log messages and reports.
    pub name: String,

    /// Address answering plain DNS over TCP, used for serials and XFR.
    pub query_addr: SocketAddr,

    /// Port the server accepts DNS over TLS on.
    pub tls_port: u16,

    /// Working directory of all commands.
    pub workdir: Option<PathBuf>,

    /// Starts the server.
    pub start: Vec<String>,

    /// Whether the start command is the server itself and keeps running.
    pub foreground: bool,

    /// Makes the server re-read its configuration.
    pub reload: Vec<String>,

    /// Stops the server.
    pub stop: Vec<String>,

    /// Writes the server's configuration file.
    pub generate_config: Vec<String>,

    /// Writes fresh certificate and key material.
    pub regenerate_certificate: Vec<String>,

    /// Key for signing queries, transfers and updates.
    pub tsig: Option<TsigConfig>,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    start_timeout: Duration,
}

impl ServerConfig {
    /// Creates an empty configuration listening on localhost.
    pub fn new(name: impl Into<String>, port: u16, tls_port: u16) -> Self {
        ServerConfig {
            name: name.into(),
            query_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            tls_port,
            workdir: None,
            start: Vec::new(),
            foreground: false,
            reload: Vec::new(),
            stop: Vec::new(),
            generate_config: Vec::new(),
            regenerate_certificate: Vec::new(),
            tsig: None,
            start_timeout: SERVER_START_TIMEOUT.default(),
        }
    }

    pub fn start_timeout(&self) -> Duration {
        SERVER_START_TIMEOUT.limit(self.start_timeout)
    }

    pub fn set_start_timeout(&mut self, value: Duration) {
        self.start_timeout = SERVER_START_TIMEOUT.limit(value)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new("server", 53, 853)
    }
}

//------------ TsigConfig ----------------------------------------------------

/// A TSIG key shared with a server.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TsigConfig {
    /// The key name, e.g., `xfr.key.`.
    pub name: String,

    /// The HMAC algorithm, e.g., `hmac-sha256`.
    #[serde(default = "TsigConfig::default_algorithm")]
    pub algorithm: String,

    /// The secret in Base64.
    pub secret: String,
}

impl TsigConfig {
    pub fn new(
        name: impl Into<String>,
        algorithm: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        TsigConfig {
            name: name.into(),
            algorithm: algorithm.into(),
            secret: secret.into(),
        }
    }

    fn default_algorithm() -> String {
        "hmac-sha256".into()
    }

    /// Creates the key.
    pub fn key(&self) -> Result<Key, ConfigError> {
        let err = |reason: String| ConfigError::Tsig {
            key: self.name.clone(),
            reason,
        };
        let name =
            KeyName::from_str(&self.name).map_err(|e| err(e.to_string()))?;
        let algorithm = Algorithm::from_str(&self.algorithm)
            .map_err(|e| err(e.to_string()))?;
        let secret: Vec<u8> =
            base64::decode(&self.secret).map_err(|e| err(e.to_string()))?;
        Key::new(algorithm, &secret, name, None, None)
            .map_err(|e| err(e.to_string()))
    }
}

//------------ ConfigError ---------------------------------------------------

/// A configuration could not be read.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Yaml(serde_yaml::Error),
    ZoneName(FromStrError),
    Tsig { key: String, reason: String },
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read config: {err}"),
            ConfigError::Yaml(err) => write!(f, "invalid config: {err}"),
            ConfigError::ZoneName(err) => {
                write!(f, "invalid zone name in config: {err}")
            }
            ConfigError::Tsig { key, reason } => {
                write!(f, "invalid TSIG key '{key}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Yaml(err) => Some(err),
            ConfigError::ZoneName(_) | ConfigError::Tsig { .. } => None,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn def_min_max() {
        let cycles = DefMinMax::new(3, 1, 10);
        assert_eq!(cycles.default(), 3);
        assert_eq!(cycles.limit(0), 1);
        assert_eq!(cycles.limit(7), 7);
        assert_eq!(cycles.limit(11), 10);
    }

    #[test]
    fn defaults() {
        let config = ScenarioConfig::default();
        assert_eq!(config.zones, ["example."]);
        assert_eq!(config.poll.interval(), Duration::from_millis(500));
        assert_eq!(config.poll.timeout(), Duration::from_secs(60));
        assert_eq!(config.settle(), Duration::from_secs(10));
        assert_eq!(config.update_cycles(), 1);
        assert_eq!(config.capture.program, PathBuf::from("tcpdump"));
        assert_eq!(config.capture.interface, "lo");
    }

    #[test]
    fn from_yaml() {
        let yaml = "
out_dir: /tmp/run
zones: [example., example.org.]
poll:
  interval: 100
  timeout: 2000
settle: 250
update_cycles: 3
capture:
  program: /usr/sbin/tcpdump
  extra_args: [-U]
primary:
  name: knot
  query_addr: 127.0.0.1:5300
  tls_port: 8530
  start: [knotd, -c, knot.conf]
  foreground: true
secondary:
  name: bind
  query_addr: 127.0.0.1:5301
  tls_port: 8531
  reload: [rndc, reload]
";
        let config = ScenarioConfig::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(config.out_dir, PathBuf::from("/tmp/run"));
        assert_eq!(config.zone_names().unwrap().len(), 2);
        assert_eq!(config.poll.interval(), Duration::from_millis(100));
        assert_eq!(config.poll.timeout(), Duration::from_secs(2));
        assert_eq!(config.settle(), Duration::from_millis(250));
        assert_eq!(config.update_cycles(), 3);
        assert_eq!(config.capture.extra_args, ["-U"]);
        assert_eq!(config.capture.interface, "lo");
        assert_eq!(config.primary.name, "knot");
        assert!(config.primary.foreground);
        assert_eq!(config.primary.start, ["knotd", "-c", "knot.conf"]);
        assert_eq!(config.secondary.tls_port, 8531);
        assert_eq!(config.secondary.reload, ["rndc", "reload"]);
        assert!(config.secondary.start.is_empty());
    }

    #[test]
    fn limits_apply() {
        let yaml = "poll: { interval: 0, timeout: 99999999999 }\n\
                    update_cycles: 0\n";
        let config = ScenarioConfig::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(config.poll.interval(), Duration::from_millis(1));
        assert_eq!(config.poll.timeout(), Duration::from_secs(3600));
        assert_eq!(config.update_cycles(), 1);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let yaml = "zonez: [example.]\n";
        assert!(matches!(
            ScenarioConfig::from_reader(yaml.as_bytes()),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn bad_zone_is_rejected() {
        let yaml = "zones: [\"exa..mple.\"]\n";
        assert!(matches!(
            ScenarioConfig::from_reader(yaml.as_bytes()),
            Err(ConfigError::ZoneName(_))
        ));
    }

    #[test]
    fn tsig_key() {
        let yaml = "
primary:
  tsig:
    name: xfr.key.
    secret: eGZyLWludGVyb3AgdGVzdCBrZXkgMDEyMzQ1Njc4OQ==
";
        let config = ScenarioConfig::from_reader(yaml.as_bytes()).unwrap();
        let tsig = config.primary.tsig.as_ref().unwrap();
        assert_eq!(tsig.algorithm, "hmac-sha256");
        let key = tsig.key().unwrap();
        assert_eq!(key.algorithm(), Algorithm::Sha256);
        assert_eq!(key.name().to_string(), "xfr.key");
        assert!(config.secondary.tsig.is_none());
    }

    #[test]
    fn bad_tsig_key_is_rejected() {
        let yaml = "
secondary:
  tsig: { name: xfr.key., algorithm: hmac-md4, secret: AAAA }
";
        match ScenarioConfig::from_reader(yaml.as_bytes()) {
            Err(ConfigError::Tsig { key, .. }) => assert_eq!(key, "xfr.key."),
            res => panic!("unexpected result {res:?}"),
        }
        let tsig = TsigConfig::new("xfr.key.", "hmac-sha1", "not base64!");
        assert!(matches!(tsig.key(), Err(ConfigError::Tsig { .. })));
    }
}
