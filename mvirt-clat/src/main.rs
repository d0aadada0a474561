//! mvirt-clat daemon: stateless 464XLAT customer-side translator.

use anyhow::{Context, Result};
use clap::Parser;
use mvirt_clat::config::{
    ClatConfig, ConfigFile, DEFAULT_CONFIG_PATH, Overrides, default_tun_name, ipv4_address_free,
    parse_plat_prefix, select_free_ipv4_address,
};
use mvirt_clat::daemon::{AddressBinding, Daemon, Tunnels};
use mvirt_clat::pause::{DEFAULT_LOCK_FILE, PauseWatcher};
use mvirt_clat::rawsock::RawSocket;
use mvirt_clat::ring::PacketRing;
use mvirt_clat::tun::TunDevice;
use mvirt_clat::{netif, signals};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Uplink interface carrying IPv6 traffic
    #[arg(short, long)]
    interface: String,

    /// NAT64 prefix (/96), overrides plat_subnet from the config file
    #[arg(short, long, value_parser = parse_prefix)]
    plat_prefix: Option<Ipv6Addr>,

    /// Network handle of the uplink
    #[arg(short, long = "netid")]
    netid: Option<u32>,

    /// Packet mark for translated IPv6 traffic
    #[arg(short, long)]
    mark: Option<u32>,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// TUN device name (default: v4-<interface>)
    #[arg(short, long)]
    tun: Option<String>,

    /// Forwarding pauses while this file exists
    #[arg(long, default_value = DEFAULT_LOCK_FILE)]
    lock_file: PathBuf,
}

fn parse_prefix(s: &str) -> Result<Ipv6Addr, String> {
    parse_plat_prefix(s).map_err(|e| e.to_string())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!(error = format!("{e:#}"), "mvirt-clat failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    signals::setup_signal_handlers().context("Failed to install signal handlers")?;

    let file = ConfigFile::load(&args.config)?;
    let uplink_mtu = match netif::interface_mtu(&args.interface) {
        Ok(mtu) => Some(mtu),
        Err(e) => {
            warn!(error = %e, "Could not read uplink MTU");
            None
        }
    };

    let overrides = Overrides {
        tun_interface: args
            .tun
            .unwrap_or_else(|| default_tun_name(&args.interface)),
        uplink_interface: args.interface,
        plat_prefix: args.plat_prefix,
        mark: args.mark,
        net_id: args.netid,
    };
    let config = ClatConfig::from_file(&file, overrides, uplink_mtu)
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;

    let ifindex = netif::interface_index(&config.uplink_interface)?;
    let uplink_addr = netif::global_ipv6_address(&config.uplink_interface, None)?;
    let config = config.with_local_address(config.generate_local_ipv6_address(uplink_addr));

    let block = config
        .ipv4_local_block()
        .context("Invalid local IPv4 prefix length")?;
    let ipv4 = select_free_ipv4_address(
        config.ipv4_local_subnet,
        config.ipv4_local_prefixlen,
        ipv4_address_free,
    )
    .with_context(|| format!("No free IPv4 address in {block}"))?;
    let config = config.with_ipv4_address(ipv4);

    let tun = TunDevice::create(&config.tun_interface)
        .context("Failed to create TUN device (root privileges required)")?;
    tun.set_nonblocking(true)?;
    netif::configure_tun(tun.name(), ipv4, config.ipv4mtu)?;

    let raw = RawSocket::open(config.mark)?;
    let ring = PacketRing::open(ifindex)?;
    let tunnels = Tunnels {
        tun,
        raw,
        ring,
        ifindex,
    };
    tunnels
        .bind_local_address(config.ipv6_local_subnet)
        .context("Failed to bind local IPv6 address")?;

    info!(
        ipv4 = %config.ipv4_local_subnet,
        ipv6 = %config.ipv6_local_subnet,
        mtu = config.mtu,
        ipv4mtu = config.ipv4mtu,
        net_id = ?config.net_id,
        "CLAT configured"
    );

    let pause = PauseWatcher::new(args.lock_file);
    let mut daemon = Daemon::new(config, tunnels, pause);
    daemon.run().context("Event loop failed")
}
