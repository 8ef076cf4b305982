//! Name servers run through external commands.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use domain::base::Serial;
use domain::tsig::Key;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::{Server, ServerError};
use crate::config::{ConfigError, ServerConfig, TsigConfig};
use crate::wire;
use crate::zone::ZoneName;

/// Time between two attempts to connect to a starting server.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

//------------ ExternalServer ------------------------------------------------

/// A name server that is controlled through configured commands.
///
/// Each lifecycle operation runs its command to completion and fails if the
/// command fails. If the server is configured as running in the foreground,
/// the start command is the server itself and is kept as a child process
/// that is killed when the value is dropped.
///
/// Serials are learned by sending SOA queries to the query address,
/// signed with the configured TSIG key if there is one.
#[derive(Debug)]
pub struct ExternalServer {
    config: ServerConfig,
    key: Option<Key>,
    child: Option<Child>,
}

impl ExternalServer {
    /// Creates a server from its configuration.
    ///
    /// Fails if the configured TSIG key is unusable.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let key = config.tsig.as_ref().map(TsigConfig::key).transpose()?;
        Ok(ExternalServer {
            config,
            key,
            child: None,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stops the server.
    ///
    /// Runs the stop command, if any, and kills a foreground server
    /// process that is still around afterwards.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let res = self.run("stop", &self.config.stop).await;
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                debug!("Killing server process of {}", self.config.name);
                let _ = child.kill().await;
            }
        }
        res
    }

    fn command(&self, argv: &[String]) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = self.config.workdir.as_ref() {
            cmd.current_dir(dir);
        }
        Some(cmd)
    }

    /// Runs `argv` to completion.
    async fn run(
        &self,
        operation: &str,
        argv: &[String],
    ) -> Result<(), ServerError> {
        let Some(mut cmd) = self.command(argv) else {
            debug!("No {operation} command for {}", self.config.name);
            return Ok(());
        };
        let command = argv.join(" ");
        debug!(
            "Running {operation} command for {}: {command}",
            self.config.name
        );
        let status = cmd
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|err| ServerError::Spawn {
                command: command.clone(),
                err,
            })?;
        if !status.success() {
            return Err(ServerError::Status { command, status });
        }
        Ok(())
    }

    /// Waits until the query address accepts connections.
    async fn wait_listening(&mut self) -> Result<(), ServerError> {
        let addr = self.config.query_addr;
        let deadline = Instant::now() + self.config.start_timeout();
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.child = None;
                    return Err(ServerError::Exited(status));
                }
            }
            if TcpStream::connect(addr).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ServerError::NotListening(addr));
            }
            sleep(CONNECT_RETRY).await;
        }
    }
}

//--- Server

impl Server for ExternalServer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn query_addr(&self) -> SocketAddr {
        self.config.query_addr
    }

    fn tls_port(&self) -> u16 {
        self.config.tls_port
    }

    fn tsig_key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    async fn start(&mut self) -> Result<(), ServerError> {
        info!("Starting {}", self.config.name);
        if self.config.foreground {
            if let Some(mut cmd) = self.command(&self.config.start) {
                let child = cmd
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|err| ServerError::Spawn {
                        command: self.config.start.join(" "),
                        err,
                    })?;
                self.child = Some(child);
            }
        } else {
            self.run("start", &self.config.start).await?;
        }
        self.wait_listening().await
    }

    async fn reload(&mut self) -> Result<(), ServerError> {
        info!("Reloading {}", self.config.name);
        self.run("reload", &self.config.reload).await
    }

    async fn generate_config(&mut self) -> Result<(), ServerError> {
        self.run("config", &self.config.generate_config).await
    }

    async fn regenerate_certificate(&mut self) -> Result<(), ServerError> {
        info!("Regenerating certificate of {}", self.config.name);
        self.run("certificate", &self.config.regenerate_certificate)
            .await
    }

    async fn zone_serial(
        &self,
        zone: &ZoneName,
    ) -> Result<Serial, ServerError> {
        let key = self.key.as_ref();
        Ok(wire::query_soa_serial(self.config.query_addr, zone, key).await?)
    }
}

//============ Testing =======================================================
