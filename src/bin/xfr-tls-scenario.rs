//! Runs the zone transfer over TLS scenario against two name servers.
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, warn};
use xfr_interop::config::{ConfigError, ScenarioConfig};
use xfr_interop::diff::AxfrDiffer;
use xfr_interop::logging::init_logging;
use xfr_interop::scenario::{Scenario, ScenarioContext};
use xfr_interop::server::external::ExternalServer;
use xfr_interop::update::RandomUpdater;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// The YAML file describing the servers and the run.
    config: PathBuf,

    /// Directory for the capture files, overriding the configuration.
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Only check the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let mut config = match ScenarioConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = args.out_dir {
        config.out_dir = dir;
    }
    let zones = match config.zone_names() {
        Ok(zones) => zones,
        Err(err) => {
            error!("{}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    if args.check_config {
        println!("Configuration {} is valid.", args.config.display());
        return ExitCode::SUCCESS;
    }

    let (primary, secondary) = match servers(&config) {
        Ok(servers) => servers,
        Err(err) => {
            error!("{}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    let out_dir = config.out_dir.clone();
    let mut ctx = ScenarioContext::new(primary, secondary, zones, out_dir);
    let updater = RandomUpdater::new(config.update.max_changes());
    let scenario = Scenario::new(config, AxfrDiffer::new(), updater);
    let report = scenario.run(&mut ctx).await;

    let (mut primary, mut secondary) = ctx.into_servers();
    for server in [&mut secondary, &mut primary] {
        if let Err(err) = server.stop().await {
            warn!("Cannot stop {}: {err}", server.config().name);
        }
    }

    println!("{report}");
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn servers(
    config: &ScenarioConfig,
) -> Result<(ExternalServer, ExternalServer), ConfigError> {
    Ok((
        ExternalServer::new(config.primary.clone())?,
        ExternalServer::new(config.secondary.clone())?,
    ))
}
