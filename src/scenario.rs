//! The zone transfer over TLS scenario.
//!
//! A run brings up a primary and a secondary name server, checks that the
//! secondary receives the primary's zones, changes the TLS setup and then
//! checks that updates on the primary keep arriving at the secondary. All
//! traffic between the two is captured for the whole run.
//!
//! The run moves through the stages of [`Stage`] strictly in order. A
//! failure in any stage ends the run. Either way, the capture is stopped
//! before the [`ScenarioReport`] is returned.

use std::fmt;
use std::path::PathBuf;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::capture::{CaptureArtifacts, CaptureError, TrafficCapture};
use crate::config::ScenarioConfig;
use crate::diff::ContentDiffer;
use crate::error::{ScenarioError, StartupFailure};
use crate::server::{Server, ServerError};
use crate::update::UpdateInjector;
use crate::watch::{Condition, WatchError, Watcher};
use crate::zone::{SerialSnapshot, ZoneName, ZoneSet};

//------------ Stage ---------------------------------------------------------

/// The stages of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Traffic is being captured and the servers are started.
    Capturing,

    /// The secondary receives the zones for the first time.
    InitialSync,

    /// The transferred zone content is compared.
    Verified,

    /// Certificate and configuration are replaced.
    Reloaded,

    /// Updates on the primary are followed to the secondary.
    ///
    /// Cycles are counted from one.
    UpdateCycle(usize),

    /// The run passed.
    Done,

    /// The run failed.
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Capturing => f.write_str("capturing"),
            Stage::InitialSync => f.write_str("initial sync"),
            Stage::Verified => f.write_str("verified"),
            Stage::Reloaded => f.write_str("reloaded"),
            Stage::UpdateCycle(n) => write!(f, "update cycle {n}"),
            Stage::Done => f.write_str("done"),
            Stage::Failed => f.write_str("failed"),
        }
    }
}

//------------ ScenarioContext -----------------------------------------------

/// Everything a run operates on.
pub struct ScenarioContext<P, S> {
    primary: P,
    secondary: S,
    zones: ZoneSet,
    out_dir: PathBuf,
}

impl<P: Server, S: Server> ScenarioContext<P, S> {
    /// Creates a context transferring `zones` from `primary` to `secondary`.
    pub fn new(
        primary: P,
        secondary: S,
        zones: impl IntoIterator<Item = ZoneName>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        let zones = ZoneSet::link(zones, primary.name(), secondary.name());
        ScenarioContext {
            primary,
            secondary,
            zones,
            out_dir: out_dir.into(),
        }
    }

    pub fn secondary_mut(&mut self) -> &mut S {
        &mut self.secondary
    }

    pub fn into_servers(self) -> (P, S) {
        (self.primary, self.secondary)
    }
}

//------------ Scenario ------------------------------------------------------

/// The scenario driver.
pub struct Scenario<D, U> {
    config: ScenarioConfig,
    watcher: Watcher,
    differ: D,
    updater: U,
}

impl<D: ContentDiffer, U: UpdateInjector> Scenario<D, U> {
    pub fn new(config: ScenarioConfig, differ: D, updater: U) -> Self {
        Scenario {
            watcher: Watcher::new(&config.poll),
            config,
            differ,
            updater,
        }
    }

    pub fn differ(&self) -> &D {
        &self.differ
    }

    pub fn differ_mut(&mut self) -> &mut D {
        &mut self.differ
    }

    /// Runs the scenario once.
    ///
    /// The capture is started before anything else happens and is always
    /// terminated before this returns. A failure to stop it is logged and
    /// kept in the report but doesn't change the result.
    pub async fn run<P: Server, S: Server>(
        &self,
        ctx: &mut ScenarioContext<P, S>,
    ) -> ScenarioReport {
        let mut trail = Trail::default();
        let artifacts = CaptureArtifacts::in_dir(&ctx.out_dir);

        if ctx.zones.is_empty() {
            return trail.fail(ScenarioError::NoZones, artifacts);
        }

        info!("Running scenario for {}", ctx.zones);
        let ports = [ctx.primary.tls_port(), ctx.secondary.tls_port()];
        let mut capture = match TrafficCapture::start(
            &self.config.capture,
            &ctx.out_dir,
            &ports,
        )
        .await
        {
            Ok(capture) => capture,
            Err(err) => {
                return trail.fail(
                    StartupFailure::Capture(err).into(),
                    artifacts,
                )
            }
        };
        trail.enter(Stage::Capturing);

        let result = self.stages(ctx, &mut trail).await;
        match &result {
            Ok(serials) => {
                trail.enter(Stage::Done);
                info!("Scenario passed with serials {serials}");
            }
            Err(err) => {
                trail.enter(Stage::Failed);
                warn!("Scenario failed: {err}");
            }
        }

        let cleanup = capture.terminate().await.err();
        if let Some(err) = cleanup.as_ref() {
            warn!("Cannot cleanly stop the capture: {err}");
        }
        ScenarioReport {
            result,
            stages: trail.stages,
            artifacts,
            capture_pid: capture.id(),
            cleanup,
        }
    }

    async fn stages<P: Server, S: Server>(
        &self,
        ctx: &mut ScenarioContext<P, S>,
        trail: &mut Trail,
    ) -> Result<SerialSnapshot, ScenarioError> {
        start(&mut ctx.primary).await?;
        start(&mut ctx.secondary).await?;

        trail.enter(Stage::InitialSync);
        let primary = self
            .watcher
            .wait_serials(&ctx.zones, &ctx.primary, None, Condition::AtLeast)
            .await?;
        let mut baseline = self
            .watcher
            .wait_serials(
                &ctx.zones,
                &ctx.secondary,
                Some(&primary),
                Condition::Exact,
            )
            .await?;

        trail.enter(Stage::Verified);
        self.verify(ctx, None).await?;

        trail.enter(Stage::Reloaded);
        ctx.primary
            .regenerate_certificate()
            .await
            .map_err(server_error(&ctx.primary, "certificate regeneration"))?;
        ctx.secondary
            .generate_config()
            .await
            .map_err(server_error(&ctx.secondary, "config generation"))?;
        ctx.secondary
            .reload()
            .await
            .map_err(server_error(&ctx.secondary, "reload"))?;
        sleep(self.config.settle()).await;

        for cycle in 1..=self.config.update_cycles() {
            trail.enter(Stage::UpdateCycle(cycle));
            baseline = self.update_cycle(ctx, &baseline).await?;
        }
        Ok(baseline)
    }

    /// Updates all zones once and follows the changes to the secondary.
    ///
    /// Returns the secondary's serials after the update.
    async fn update_cycle<P: Server, S: Server>(
        &self,
        ctx: &ScenarioContext<P, S>,
        baseline: &SerialSnapshot,
    ) -> Result<SerialSnapshot, ScenarioError> {
        for zone in &ctx.zones {
            let summary = self
                .updater
                .inject_random_update(&ctx.primary, zone, false)
                .await
                .map_err(|err| ScenarioError::Update {
                    zone: zone.clone(),
                    err,
                })?;
            if summary.is_empty() {
                return Err(ScenarioError::EmptyUpdate(zone.clone()));
            }
            info!("Updated zone {zone}: {summary}");
        }

        let primary = self
            .watcher
            .wait_serials(
                &ctx.zones,
                &ctx.primary,
                Some(baseline),
                Condition::Newer,
            )
            .await
            .map_err(|err| match err {
                WatchError::Timeout(err) => {
                    ScenarioError::SerialNotAdvanced(err)
                }
                err => err.into(),
            })?;
        let secondary = self
            .watcher
            .wait_serials(
                &ctx.zones,
                &ctx.secondary,
                Some(&primary),
                Condition::AtLeast,
            )
            .await?;
        self.verify(ctx, Some(baseline)).await?;
        Ok(secondary)
    }

    async fn verify<P: Server, S: Server>(
        &self,
        ctx: &ScenarioContext<P, S>,
        baseline: Option<&SerialSnapshot>,
    ) -> Result<(), ScenarioError> {
        let mismatches = self
            .differ
            .diff(&ctx.primary, &ctx.secondary, &ctx.zones, baseline)
            .await?;
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::ContentMismatch(mismatches))
        }
    }
}

async fn start<T: Server>(server: &mut T) -> Result<(), ScenarioError> {
    server.start().await.map_err(|err| {
        StartupFailure::Server {
            server: server.name().into(),
            err,
        }
        .into()
    })
}

fn server_error<T: Server>(
    server: &T,
    operation: &'static str,
) -> impl FnOnce(ServerError) -> ScenarioError {
    let server = server.name().to_string();
    move |err| ScenarioError::Server {
        server,
        operation,
        err,
    }
}

//------------ Trail ---------------------------------------------------------

/// The stages entered so far.
#[derive(Default)]
struct Trail {
    stages: Vec<Stage>,
}

impl Trail {
    fn enter(&mut self, stage: Stage) {
        info!("Entering stage: {stage}");
        self.stages.push(stage);
    }

    /// Ends a run that failed before the capture was started.
    fn fail(
        mut self,
        err: ScenarioError,
        artifacts: CaptureArtifacts,
    ) -> ScenarioReport {
        warn!("Scenario failed: {err}");
        self.enter(Stage::Failed);
        ScenarioReport {
            result: Err(err),
            stages: self.stages,
            artifacts,
            capture_pid: None,
            cleanup: None,
        }
    }
}

//------------ ScenarioReport ------------------------------------------------

/// The outcome of a run.
#[derive(Debug)]
pub struct ScenarioReport {
    /// The secondary's final serials or the reason the run failed.
    pub result: Result<SerialSnapshot, ScenarioError>,

    /// All stages entered in order.
    pub stages: Vec<Stage>,

    /// Where the capture files are.
    pub artifacts: CaptureArtifacts,

    /// The process ID of the capture program if it was started.
    pub capture_pid: Option<u32>,

    /// The error stopping the capture, if any.
    pub cleanup: Option<CaptureError>,
}

impl ScenarioReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Returns the stage the run failed in.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.result.as_ref().err()?;
        Some(
            self.stages
                .iter()
                .rev()
                .copied()
                .find(|stage| *stage != Stage::Failed)
                .unwrap_or(Stage::Failed),
        )
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(serials) => {
                write!(f, "PASS: final serials {serials}")?;
                if let Some(Stage::UpdateCycle(n)) = self
                    .stages
                    .iter()
                    .rev()
                    .find(|stage| matches!(stage, Stage::UpdateCycle(_)))
                {
                    write!(f, " after {n} update cycles")?;
                }
                f.write_str(".")?;
            }
            Err(err) => match self.failed_stage() {
                Some(Stage::Failed) | None => {
                    write!(f, "FAIL before capturing: {err}.")?
                }
                Some(stage) => write!(f, "FAIL in stage {stage}: {err}.")?,
            },
        }
        match self.capture_pid {
            Some(pid) => write!(
                f,
                " Traffic captured by process {pid} into {}.",
                self.artifacts.dir.display()
            )?,
            None => write!(
                f,
                " No traffic captured, output directory {}.",
                self.artifacts.dir.display()
            )?,
        }
        if let Some(err) = self.cleanup.as_ref() {
            write!(f, " Stopping the capture failed: {err}.")?;
        }
        Ok(())
    }
}

//============ Testing =======================================================
