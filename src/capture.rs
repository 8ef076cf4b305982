//! Recording the traffic of a run.
//!
//! Every run records the traffic on the server ports with an external
//! packet capture program, normally tcpdump. The recording is an artifact
//! of the run for later inspection, whether the run passed or not.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use std::{fmt, io};

use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;

//------------ CaptureArtifacts ----------------------------------------------

/// The files written by a traffic capture.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaptureArtifacts {
    /// The directory all files are placed in.
    pub dir: PathBuf,

    /// The packet capture itself.
    pub pcap: PathBuf,

    /// Standard output of the capture program.
    pub stdout: PathBuf,

    /// Standard error of the capture program.
    pub stderr: PathBuf,
}

impl CaptureArtifacts {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        CaptureArtifacts {
            pcap: dir.join("traffic.pcap"),
            stdout: dir.join("tcpdump.out"),
            stderr: dir.join("tcpdump.err"),
            dir,
        }
    }
}

//------------ TrafficCapture ------------------------------------------------

/// A running traffic capture.
///
/// The capture runs until [`terminate`][Self::terminate] is called. If it
/// is dropped before, the capture program is still asked to terminate but
/// nobody waits for it.
#[derive(Debug)]
pub struct TrafficCapture {
    child: Option<Child>,
    pid: Option<u32>,
    artifacts: CaptureArtifacts,
    stop_timeout: Duration,
}

impl TrafficCapture {
    /// Starts capturing traffic on `ports` into `out_dir`.
    ///
    /// The output files of the capture program are opened for appending so
    /// nothing of an earlier run in the same directory gets lost. Returns
    /// an error if the program cannot be started or has already exited
    /// once the startup grace period has passed.
    pub async fn start(
        config: &CaptureConfig,
        out_dir: &Path,
        ports: &[u16],
    ) -> Result<Self, CaptureError> {
        let artifacts = CaptureArtifacts::in_dir(out_dir);
        fs::create_dir_all(&artifacts.dir)
            .map_err(|err| CaptureError::io(&artifacts.dir, err))?;
        let stdout = append(&artifacts.stdout)?;
        let stderr = append(&artifacts.stderr)?;

        let mut cmd = Command::new(&config.program);
        cmd.arg("-i")
            .arg(&config.interface)
            .arg("-w")
            .arg(&artifacts.pcap)
            .args(&config.extra_args)
            .args(port_filter(ports))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        debug!("Starting capture: {cmd:?}");
        let mut child = cmd.spawn().map_err(|err| CaptureError::Spawn {
            program: config.program.clone(),
            err,
        })?;
        let pid = child.id();

        sleep(config.startup_grace()).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => return Err(CaptureError::Exited(status)),
            Err(err) => return Err(abandon(child, CaptureError::Wait(err))),
        }
        info!(
            "Capturing traffic into {} (pid {})",
            artifacts.pcap.display(),
            pid.unwrap_or_default()
        );
        Ok(TrafficCapture {
            child: Some(child),
            pid,
            artifacts,
            stop_timeout: config.stop_timeout(),
        })
    }

    /// Returns the process ID of the capture program.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn artifacts(&self) -> &CaptureArtifacts {
        &self.artifacts
    }

    /// Returns whether the capture has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.child.is_none()
    }

    /// Stops the capture.
    ///
    /// Sends SIGTERM so the program can flush the capture file and waits
    /// for it to exit. If it hasn't exited within the stop timeout, it is
    /// killed and an error is returned. Calling this again after it
    /// returned does nothing.
    pub async fn terminate(&mut self) -> Result<(), CaptureError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Some(pid) = child.id() {
            if let Err(err) = sigterm(pid) {
                return Err(abandon(child, CaptureError::Signal(err)));
            }
        }
        match timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Capture exited: {status}");
                Ok(())
            }
            Ok(Err(err)) => Err(CaptureError::Wait(err)),
            Err(_) => {
                warn!(
                    "Capture did not exit within {:?}, killing it",
                    self.stop_timeout
                );
                let _ = child.kill().await;
                Err(CaptureError::StopTimeout(self.stop_timeout))
            }
        }
    }
}

impl Drop for TrafficCapture {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Some(pid) = child.id() {
                if sigterm(pid).is_err() {
                    let _ = child.start_kill();
                }
            }
        }
    }
}

/// Kills a capture program that can't be stopped orderly.
///
/// The process is reaped by the runtime after `child` has been dropped.
fn abandon(mut child: Child, err: CaptureError) -> CaptureError {
    warn!("Killing capture program: {err}");
    let _ = child.start_kill();
    err
}

fn append(path: &Path) -> Result<File, CaptureError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| CaptureError::io(path, err))
}

/// Returns the filter expression arguments selecting `ports`.
fn port_filter(ports: &[u16]) -> Vec<String> {
    let mut res = Vec::new();
    for port in ports {
        if !res.is_empty() {
            res.push("or".into());
        }
        res.push("port".into());
        res.push(port.to_string());
    }
    res
}

fn sigterm(pid: u32) -> Result<(), io::Error> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: kill has no memory safety requirements.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

//------------ CaptureError --------------------------------------------------

/// Starting or stopping the capture failed.
#[derive(Debug)]
pub enum CaptureError {
    /// An output file or directory could not be created.
    Io { path: PathBuf, err: io::Error },

    /// The capture program could not be launched.
    Spawn { program: PathBuf, err: io::Error },

    /// The capture program exited right after starting.
    Exited(ExitStatus),

    /// Checking on the capture program failed.
    Wait(io::Error),

    /// The capture program could not be signalled.
    Signal(io::Error),

    /// The capture program ignored SIGTERM and had to be killed.
    StopTimeout(Duration),
}

impl CaptureError {
    fn io(path: &Path, err: io::Error) -> Self {
        CaptureError::Io {
            path: path.into(),
            err,
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Io { path, err } => {
                write!(f, "{}: {err}", path.display())
            }
            CaptureError::Spawn { program, err } => {
                write!(f, "cannot run {}: {err}", program.display())
            }
            CaptureError::Exited(status) => {
                write!(f, "capture exited during startup: {status}")
            }
            CaptureError::Wait(err) => {
                write!(f, "cannot wait for capture: {err}")
            }
            CaptureError::Signal(err) => {
                write!(f, "cannot signal capture: {err}")
            }
            CaptureError::StopTimeout(timeout) => {
                write!(f, "capture killed after not exiting within {timeout:?}")
            }
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Io { err, .. }
            | CaptureError::Spawn { err, .. }
            | CaptureError::Wait(err)
            | CaptureError::Signal(err) => Some(err),
            _ => None,
        }
    }
}

//============ Testing =======================================================
