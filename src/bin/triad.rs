use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use triad::composition::{Composition, NetworkRoles};
use triad::config::{ConfigAggregator, IoConfig, LoggingConfig};
use triad::core::{wait_for_termination, Termination};
use triad::logging::init_logging;

#[derive(Debug, Parser)]
#[command(name = "triad", about = "Master, user edge and voice edge in one process")]
struct CliArgs {
    /// Configuration file
    #[arg(long = "conf", value_name = "FILE", env = "TRIAD_CONFIG", default_value = "conf/triad.yaml")]
    conf: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

// The lifecycle runs on this thread; role start/stop block on the shared pools.
fn main() -> Result<()> {
    let args = CliArgs::parse();

    let logging = LoggingConfig::from_file(&args.conf)
        .with_context(|| format!("Cannot read config: {}", args.conf.display()))?;
    init_logging(&logging)?;

    if args.check {
        ConfigAggregator::load(&args.conf)?;
        IoConfig::from_file(&args.conf)?;
        tracing::info!("[triad] [config_ok] path={}", args.conf.display());
        return Ok(());
    }

    let composition = Composition::prepare(&args.conf, &NetworkRoles)
        .with_context(|| format!("Cannot build from {}", args.conf.display()))?;
    let mut termination = Termination::install(composition.io().io_handle())
        .context("Cannot install signal handlers")?;
    let composition = composition
        .started()
        .with_context(|| format!("Cannot launch from {}", args.conf.display()))?;
    tracing::info!(
        "[triad] [started] master={:?}",
        composition.master().local_addr()
    );

    let signal = wait_for_termination(composition.io().io_handle(), &mut termination);
    if let Err(e) = &signal {
        tracing::error!("[triad] [signal_wait_failed] err={}", e);
    }

    let stats = composition.stats();
    let stopped = composition.stop();
    for snapshot in stats.snapshot() {
        tracing::info!(
            "[triad] [final_stats] role={} connections={} rejected={} frames_in={} frames_out={} datagrams_in={} relayed={}",
            snapshot.role,
            snapshot.connections_total,
            snapshot.connections_rejected,
            snapshot.frames_in,
            snapshot.frames_out,
            snapshot.datagrams_in,
            snapshot.datagrams_relayed
        );
    }
    stopped?;
    signal?;
    tracing::info!("[triad] [exit]");
    Ok(())
}
