//! Startup device configuration.
//!
//! Creates the two TAP devices named in the configuration, assigns
//! their tunnel prefixes, enables IPv6 forwarding and launches the
//! optional startup script.

use std::fs;
use std::io;
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use mx6e::config::Config;
use mx6e::netlink::RouteHandle;
use mx6e::tuntap::{self, TapDevice};

/// The gateway's tunnel devices.
pub struct Devices {
    pub tunnel_pr: Arc<TapDevice>,
    pub tunnel_fp: Arc<TapDevice>,
}

/// Create the TAP devices and put the configured addresses on them.
pub fn create_network_devices(config: &Config) -> anyhow::Result<Devices> {
    // The physical interfaces must already exist.
    for name in [&config.device.name_pr, &config.device.name_fp] {
        tuntap::ifindex_by_name(name)
            .with_context(|| format!("physical interface {name} not found"))?;
    }

    let tunnel_fp = TapDevice::create(&config.device.tunnel_fp)
        .with_context(|| format!("creating FP tunnel device {}", config.device.tunnel_fp))?;
    let tunnel_pr = TapDevice::create(&config.device.tunnel_pr)
        .with_context(|| format!("creating PR tunnel device {}", config.device.tunnel_pr))?;
    info!(
        fp = %tunnel_fp.name(),
        fp_hwaddr = %tunnel_fp.hwaddr(),
        pr = %tunnel_pr.name(),
        pr_hwaddr = %tunnel_pr.hwaddr(),
        "tunnel devices created"
    );

    let routes = RouteHandle::new().context("opening netlink for device setup")?;
    let (pr_addr, pr_len) = config.device.ipv6_address_pr;
    routes
        .add_address(tunnel_pr.ifindex(), pr_addr, pr_len)
        .with_context(|| format!("assigning {pr_addr}/{pr_len}"))?;
    if let Some((fp_addr, fp_len)) = config.device.ipv6_address_fp {
        routes
            .add_address(tunnel_fp.ifindex(), fp_addr, fp_len)
            .with_context(|| format!("assigning {fp_addr}/{fp_len}"))?;
    }

    enable_ipv6_forwarding().context("enabling IPv6 forwarding")?;

    Ok(Devices {
        tunnel_pr: Arc::new(tunnel_pr),
        tunnel_fp: Arc::new(tunnel_fp),
    })
}

fn enable_ipv6_forwarding() -> io::Result<()> {
    fs::write("/proc/sys/net/ipv6/conf/all/forwarding", "1")
}

/// Launch the startup script in the background, if one is configured.
/// It receives the process name and both tunnel device names.
pub fn run_startup_script(config: &Config) {
    let Some(script) = &config.general.startup_script else {
        return;
    };
    info!(script = %script.display(), "running startup script");
    let result = Command::new(script)
        .arg(&config.general.process_name)
        .arg(&config.device.tunnel_pr)
        .arg(&config.device.tunnel_fp)
        .spawn();
    if let Err(e) = result {
        // Non-fatal; the gateway runs without it.
        warn!(script = %script.display(), error = %e, "startup script failed to launch");
    }
}
