use anyhow::{bail, Context, Result};
use clap::Parser;
use mirage_ecs::config::{Config, ConfigParams};
use mirage_ecs::dns::NoopRecordSetApplier;
use mirage_ecs::local::LocalTaskRunner;
use mirage_ecs::server::Mirage;
use mirage_ecs::task::TaskRunner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// On-demand task launcher and virtual-host reverse proxy for review
/// environments.
#[derive(Parser, Debug)]
#[command(name = "mirage-ecs", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "MIRAGE_CONF", value_name = "FILE")]
    conf: Option<PathBuf>,

    /// Domain suffix served by the proxy
    #[arg(long, env = "MIRAGE_DOMAIN", default_value = "localtest.me")]
    domain: String,

    /// Default target port for the generated port map
    #[arg(long, env = "MIRAGE_DEFAULT_PORT", default_value_t = 80)]
    default_port: u16,

    /// Local mode: run tasks as in-process mock backends
    #[arg(long, env = "MIRAGE_LOCAL")]
    local: bool,

    /// Log level (debug, info, warn, error)
    #[arg(long, env = "MIRAGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MIRAGE_LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Print the effective configuration and exit
    #[arg(short = 'x', long)]
    show_config: bool,
}

fn init_logging(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    if args.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let cfg = Config::new(&ConfigParams {
        path: args.conf.clone(),
        domain: args.domain.clone(),
        default_port: args.default_port,
        local_mode: args.local,
    })?;

    if args.show_config {
        print!("{}", toml::to_string_pretty(&cfg).context("cannot render config")?);
        return Ok(());
    }

    let runner: Arc<dyn TaskRunner> = if args.local {
        info!("local mode: tasks run as in-process backends");
        Arc::new(LocalTaskRunner::new())
    } else {
        // Cloud deployments embed an orchestrator adapter through the
        // library API; the stock binary only ships the local runner.
        bail!("no orchestrator adapter is linked into this binary; run with --local");
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mirage = Mirage::new(Arc::new(cfg), runner, Arc::new(NoopRecordSetApplier));
    let mut server = tokio::spawn(mirage.run(shutdown_rx));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            result = &mut server => {
                // The server stopped on its own: listener bind failure or a
                // startup error. Surface it with exit code 1.
                return result.context("server task failed")?;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
            }
            result = &mut server => {
                return result.context("server task failed")?;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    info!("shutdown complete");
    Ok(())
}
