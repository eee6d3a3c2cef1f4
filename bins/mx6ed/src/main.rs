//! mx6ed - M46E/ME6E translation gateway daemon.
//!
//! Bridges the provider (PR) and fabric (FP) IPv6 domains: two TAP
//! devices are created at startup, one forwarding worker per direction
//! rewrites tunnel packets between them, and a control loop applies
//! table mutations received over the command socket.

mod control;
mod setup;
mod worker;

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap::error::ErrorKind;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

use mx6e::config::Config;
use mx6e::rule::DeriveCtx;
use mx6e::stats::Statistics;
use mx6e::table::TableSet;

use control::{ControlLoop, ControlOutcome};
use worker::ForwardWorker;

/// Exit code for CLI usage errors (EINVAL).
const EXIT_USAGE: i32 = 22;
/// Exit code for initialization failures (-1 as a process status).
const EXIT_INIT: i32 = 255;

#[derive(Parser)]
#[command(name = "mx6ed", version, about = "M46E/ME6E translation gateway daemon")]
struct Cli {
    /// Configuration file.
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
}

/// Runtime handle for the `set debug` command.
#[derive(Clone)]
pub struct DebugLogHandle(reload::Handle<EnvFilter, Registry>);

impl DebugLogHandle {
    pub fn set_debug(&self, on: bool) {
        let directive = if on { "debug" } else { "info" };
        if let Err(e) = self.0.reload(EnvFilter::new(directive)) {
            error!(error = %e, "failed to reload log filter");
        } else {
            info!(debug = on, "debug log setting changed");
        }
    }
}

fn init_tracing() -> DebugLogHandle {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    DebugLogHandle(handle)
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let debug_log = init_tracing();

    match run(&cli, debug_log) {
        Ok(ControlOutcome::Shutdown) => {
            info!("shutdown complete");
        }
        Ok(ControlOutcome::Restart) => {
            info!("restarting");
            restart(&cli);
        }
        Err(e) => {
            error!(error = ?e, "initialization failed");
            std::process::exit(EXIT_INIT);
        }
    }
}

fn run(cli: &Cli, debug_log: DebugLogHandle) -> anyhow::Result<ControlOutcome> {
    let config = Config::load(&cli.file)
        .with_context(|| format!("loading configuration {}", cli.file.display()))?;
    if config.general.debug_log {
        debug_log.set_debug(true);
    }
    info!(process_name = %config.general.process_name, "starting");

    if config.general.daemon {
        let rc = unsafe { libc::daemon(0, 0) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error()).context("daemonizing");
        }
    }

    // Signals must be blocked before the worker threads exist so that
    // every thread inherits the mask and delivery stays on the
    // control loop's signalfd.
    control::block_signals().context("blocking signals")?;
    let signal_fd = control::SignalFd::new().context("creating signalfd")?;

    let devices = setup::create_network_devices(&config).context("creating network devices")?;
    let routes = control::NetlinkRoutes::new(devices.tunnel_pr.ifindex(), devices.tunnel_fp.ifindex())
        .context("opening netlink")?;

    let tables = Arc::new(TableSet::new());
    let stats = Arc::new(Statistics::new());
    let ctx = DeriveCtx {
        tunnel_pr_addr: config.device.ipv6_address_pr.0,
        tunnel_pr_prefix_len: config.device.ipv6_address_pr.1,
    };

    let listener = mx6e::ctrlsock::CommandListener::bind(&config.general.process_name)
        .context("binding command socket")?;

    let shutdown = worker::ShutdownSignal::new().context("creating shutdown pipe")?;

    let mut handles = Vec::new();
    for worker in [
        ForwardWorker {
            domain: mx6e::Domain::Pr,
            ingress: devices.tunnel_pr.clone(),
            egress: devices.tunnel_fp.clone(),
            tables: tables.clone(),
            stats: stats.clone(),
            shutdown: shutdown.watcher(),
        },
        ForwardWorker {
            domain: mx6e::Domain::Fp,
            ingress: devices.tunnel_fp.clone(),
            egress: devices.tunnel_pr.clone(),
            tables: tables.clone(),
            stats: stats.clone(),
            shutdown: shutdown.watcher(),
        },
    ] {
        let name = format!("forward-{}", worker.domain.name());
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .context("spawning forwarding worker")?;
        handles.push(handle);
    }

    setup::run_startup_script(&config);

    let mut control = ControlLoop {
        config,
        tables,
        stats,
        ctx,
        routes,
        listener,
        signal_fd,
        debug_log,
    };
    let outcome = control.run();

    shutdown.raise();
    for handle in handles {
        let _ = handle.join();
    }

    Ok(outcome)
}

/// Re-exec the daemon in place for the `restart` command.
fn restart(cli: &Cli) {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!(error = %e, "cannot determine current executable");
            std::process::exit(EXIT_INIT);
        }
    };
    let err = Command::new(exe).arg("-f").arg(&cli.file).exec();
    error!(error = %err, "exec failed");
    std::process::exit(EXIT_INIT);
}
