//! VPN Control Daemon (vpnctld)
//!
//! Brings up one VPN profile and keeps it up until a signal arrives.
//!
//! # Usage
//!
//! ```bash
//! # Connect the profile /etc/crrouter/vpnctl/office.toml (requires root)
//! sudo vpnctld connect --profile office
//!
//! # Show the configuration files a connect would write
//! vpnctld render --profile ./office.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libvpnctl::vpn::manager::profile_path;
use libvpnctl::{
    CommandLauncher, DriverContext, IpCommandSink, IpLinkFactory, NetworkMonitor, ServiceState, TracingMetrics,
    VpnManager, VpnProfile, VpnctlConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "/etc/crrouter/vpnctl/vpnctl.toml";

/// VPN Control Daemon
#[derive(Parser, Debug)]
#[command(name = "vpnctld")]
#[command(author = "vpnctl contributors")]
#[command(version)]
#[command(about = "VPN Control Daemon - connects IKEv2, L2TP/IPsec and WireGuard profiles", long_about = None)]
struct Args {
    /// Daemon configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect a profile and stay connected until SIGTERM/SIGINT
    Connect {
        /// Profile name or path to a profile file
        #[arg(short, long)]
        profile: String,
    },
    /// Print the configuration files a connect attempt would write
    Render {
        /// Profile name or path to a profile file
        #[arg(short, long)]
        profile: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args.config)?;

    match args.command {
        Command::Connect { profile } => connect(config, &profile).await,
        Command::Render { profile } => render(config, &profile).await,
    }
}

fn init_logging(args: &Args) {
    let log_level = if args.verbose { "debug" } else { args.log_level.as_str() };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "vpnctl={},vpnctld={},libvpnctl={}",
            log_level, log_level, log_level
        ))
    });

    // Logs go to stderr so rendered files on stdout stay clean
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

/// A missing file at the default location means built-in defaults
fn load_config(path: &Path) -> Result<VpnctlConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        info!("No configuration at {:?}, using defaults", path);
        return Ok(VpnctlConfig::default());
    }
    VpnctlConfig::load(path).with_context(|| format!("Failed to load configuration {:?}", path))
}

fn build_manager(config: VpnctlConfig) -> VpnManager {
    let sink = Arc::new(IpCommandSink::new(config.paths.state_dir.clone()));
    let ctx = DriverContext {
        launcher: Arc::new(CommandLauncher::new(config.sandbox.clone())),
        devices: Arc::new(IpLinkFactory::new()),
        metrics: Arc::new(TracingMetrics),
        config: Arc::new(config),
    };
    VpnManager::with_default_drivers(ctx, sink)
}

async fn load_profile(config: &VpnctlConfig, name: &str) -> Result<VpnProfile> {
    let path = profile_path(&config.paths.config_dir, name);
    VpnProfile::load(&path)
        .await
        .with_context(|| format!("Failed to load profile {:?}", path))
}

async fn render(config: VpnctlConfig, name: &str) -> Result<()> {
    let profile = load_profile(&config, name).await?;
    let manager = build_manager(config);
    let files = manager
        .render_profile(&profile)
        .with_context(|| format!("Cannot render profile '{}'", profile.name))?;

    for (file_name, content) in files {
        println!("# ---- {} ----", file_name);
        print!("{}", content);
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

async fn connect(config: VpnctlConfig, name: &str) -> Result<()> {
    config.ensure_directories().context("Failed to prepare directories")?;
    let profile = load_profile(&config, name).await?;
    let manager = build_manager(config);
    let mut service = manager.create_service(&profile)?;

    let monitor = NetworkMonitor::new();
    let mut physical = monitor.subscribe();
    if let Err(e) = monitor.start().await {
        warn!("Network monitor unavailable: {}", e);
    }

    info!("Connecting profile '{}' ({})", profile.name, profile.vpn_type());
    service
        .connect()
        .await
        .with_context(|| format!("Failed to start {}", profile.name))?;

    let result = run_service(&mut service, &mut physical).await;

    monitor.stop().await;
    if service.state().is_active() {
        service.disconnect().await;
    }
    result
}

/// Drive the service until it fails or a termination signal arrives
async fn run_service(
    service: &mut libvpnctl::VpnService,
    physical: &mut broadcast::Receiver<libvpnctl::PhysicalServiceEvent>,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;
    let mut monitor_open = true;

    loop {
        if let ServiceState::Failure(reason) = service.state() {
            error!("{} failed: {}", service.name(), reason);
            bail!("{} failed: {}", service.name(), reason);
        }

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, disconnecting");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), disconnecting");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reconnecting {}", service.name());
                service.disconnect().await;
                if let Err(e) = service.connect().await {
                    warn!("Reconnect of {} failed: {}", service.name(), e);
                }
            }
            event = service.next_event() => {
                service.handle_event(event).await;
            }
            received = physical.recv(), if monitor_open => match received {
                Ok(event) => service.on_physical_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} physical network events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("Network monitor stopped");
                    monitor_open = false;
                }
            },
        }
    }
}
