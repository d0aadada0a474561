//! CLAT configuration: the config file, MTU negotiation and address derivation.
//!
//! A [`ClatConfig`] is built once at startup and never mutated afterwards.
//! When the uplink prefix changes the event loop derives a fresh value with
//! [`ClatConfig::with_local_address`] and swaps it in.

use crate::checksum::{checksum_add, checksum_adjust};
use ipnet::{Ipv4Net, Ipv6Net};
use rand::RngCore;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Default local IPv4 address handed to the TUN device (RFC 7335).
pub const DEFAULT_IPV4_LOCAL_SUBNET: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 4);

/// Default prefix length of the block the local IPv4 address is chosen from.
pub const DEFAULT_IPV4_LOCAL_PREFIXLEN: u8 = 29;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clatd.conf";

/// Smallest MTU an IPv6 link may have.
pub const MIN_MTU: u16 = 1280;

/// Largest MTU the ingress ring frames are sized for.
pub const MAX_MTU: u16 = 1500;

/// IPv4 packets grow by 20 bytes of header and possibly 8 bytes of fragment header.
pub const MTU_DELTA: u16 = 28;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, io::Error),

    #[error("Line {line}: expected 'key value', got '{text}'")]
    Syntax { line: usize, text: String },

    #[error("Invalid value for '{key}': '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid IPv4 local prefix length {0} (must be 16-32)")]
    InvalidPrefixLength(u8),

    #[error("Invalid PLAT prefix '{0}': must be an IPv6 /96")]
    InvalidPlatPrefix(String),

    #[error("No PLAT prefix configured and DNS64 discovery of '{0}' is not supported")]
    MissingPlatPrefix(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Process-wide translation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClatConfig {
    /// Local IPv4 address of the TUN side.
    pub ipv4_local_subnet: Ipv4Addr,
    pub ipv4_local_prefixlen: u8,
    /// Full local IPv6 address: uplink /64 plus the CLAT interface identifier.
    pub ipv6_local_subnet: Ipv6Addr,
    /// NAT64 prefix; the low 32 bits are always zero.
    pub plat_subnet: Ipv6Addr,
    /// Fixed interface identifier, used when `use_dynamic_iid` is false.
    pub ipv6_host_id: Ipv6Addr,
    pub use_dynamic_iid: bool,
    /// MTU of the IPv6 side.
    pub mtu: u16,
    /// MTU of the TUN device.
    pub ipv4mtu: u16,
    pub uplink_interface: String,
    pub tun_interface: String,
    /// SO_MARK applied to the raw send socket.
    pub mark: Option<u32>,
    /// Network handle of the uplink, informational only.
    pub net_id: Option<u32>,
}

impl ClatConfig {
    /// Build a configuration from the file plus command line overrides.
    ///
    /// The local IPv6 address is left unspecified; it is derived from the
    /// uplink address once that is known.
    pub fn from_file(
        file: &ConfigFile,
        overrides: Overrides,
        uplink_mtu: Option<u16>,
    ) -> Result<Self> {
        let ipv6_host_id: Ipv6Addr = file.get("ipv6_host_id")?.unwrap_or(Ipv6Addr::UNSPECIFIED);
        let use_dynamic_iid = ipv6_host_id.is_unspecified();

        let ipv4_local_subnet = file
            .get("ipv4_local_subnet")?
            .unwrap_or(DEFAULT_IPV4_LOCAL_SUBNET);
        let ipv4_local_prefixlen = file
            .get("ipv4_local_prefixlen")?
            .unwrap_or(DEFAULT_IPV4_LOCAL_PREFIXLEN);
        if !(16..=32).contains(&ipv4_local_prefixlen) {
            return Err(ConfigError::InvalidPrefixLength(ipv4_local_prefixlen));
        }

        let configured_mtu: Option<i32> = file.get("mtu")?;
        let mtu = negotiate_mtu(
            configured_mtu.and_then(|m| u16::try_from(m).ok()).filter(|m| *m > 0),
            uplink_mtu,
        );
        let configured_ipv4mtu: Option<i32> = file.get("ipv4mtu")?;
        let ipv4mtu = negotiate_ipv4_mtu(
            configured_ipv4mtu.and_then(|m| u16::try_from(m).ok()),
            mtu,
        );

        let plat_subnet = match overrides.plat_prefix {
            Some(prefix) => prefix,
            None => match file.raw("plat_subnet") {
                Some(value) => parse_plat_prefix(value)?,
                None => {
                    let hostname = file
                        .raw("plat_from_dns64_hostname")
                        .unwrap_or("ipv4only.arpa");
                    return Err(ConfigError::MissingPlatPrefix(hostname.to_string()));
                }
            },
        };

        Ok(Self {
            ipv4_local_subnet,
            ipv4_local_prefixlen,
            ipv6_local_subnet: Ipv6Addr::UNSPECIFIED,
            plat_subnet,
            ipv6_host_id,
            use_dynamic_iid,
            mtu,
            ipv4mtu,
            uplink_interface: overrides.uplink_interface,
            tun_interface: overrides.tun_interface,
            mark: overrides.mark,
            net_id: overrides.net_id,
        })
    }

    /// Derive the local IPv6 address for a given uplink address.
    ///
    /// Keeps the uplink's /64 and appends either the fixed host id or a
    /// fresh checksum-neutral interface identifier.
    pub fn generate_local_ipv6_address(&self, interface_ip: Ipv6Addr) -> Ipv6Addr {
        if self.use_dynamic_iid {
            generate_checksum_neutral_iid(
                &mut rand::thread_rng(),
                interface_ip,
                self.ipv4_local_subnet,
                self.plat_subnet,
            )
        } else {
            let mut octets = interface_ip.octets();
            octets[8..].copy_from_slice(&self.ipv6_host_id.octets()[8..]);
            Ipv6Addr::from(octets)
        }
    }

    /// Copy of this configuration using a different local IPv6 address.
    pub fn with_local_address(&self, ipv6_local_subnet: Ipv6Addr) -> Self {
        Self {
            ipv6_local_subnet,
            ..self.clone()
        }
    }

    /// Copy of this configuration using a different local IPv4 address.
    pub fn with_ipv4_address(&self, ipv4_local_subnet: Ipv4Addr) -> Self {
        Self {
            ipv4_local_subnet,
            ..self.clone()
        }
    }

    /// The IPv4 block the local address is selected from.
    pub fn ipv4_local_block(&self) -> Option<Ipv4Net> {
        Ipv4Net::new(self.ipv4_local_subnet, self.ipv4_local_prefixlen)
            .ok()
            .map(|net| net.trunc())
    }
}

/// Values given on the command line. They win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub uplink_interface: String,
    pub tun_interface: String,
    pub plat_prefix: Option<Ipv6Addr>,
    pub mark: Option<u32>,
    pub net_id: Option<u32>,
}

/// A parsed `key value` configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    entries: HashMap<String, String>,
}

/// Keys understood by [`ClatConfig::from_file`].
const KNOWN_KEYS: &[&str] = &[
    "ipv4_local_subnet",
    "ipv4_local_prefixlen",
    "ipv6_host_id",
    "mtu",
    "ipv4mtu",
    "plat_from_dns64",
    "plat_from_dns64_hostname",
    "plat_subnet",
];

impl ConfigFile {
    /// Load a config file. A missing file yields an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Read(path.to_path_buf(), e)),
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut entries = HashMap::new();

        for (index, line) in contents.lines().enumerate() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(ConfigError::Syntax {
                    line: index + 1,
                    text: line.to_string(),
                });
            };

            if !KNOWN_KEYS.contains(&key) {
                warn!(key, "Ignoring unknown config key");
                continue;
            }
            entries.insert(key.to_string(), value.to_string());
        }

        Ok(Self { entries })
    }

    fn raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.raw(key)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            })
            .transpose()
    }
}

/// Parse a PLAT prefix given either as a bare address or in /96 notation.
pub fn parse_plat_prefix(value: &str) -> Result<Ipv6Addr> {
    let invalid = || ConfigError::InvalidPlatPrefix(value.to_string());

    let net = match value.parse::<Ipv6Net>() {
        Ok(net) => net,
        Err(_) => {
            let addr: Ipv6Addr = value.parse().map_err(|_| invalid())?;
            Ipv6Net::new(addr, 96).map_err(|_| invalid())?
        }
    };
    if net.prefix_len() != 96 {
        return Err(invalid());
    }
    Ok(net.network())
}

/// Longest interface name the kernel accepts.
const MAX_IFNAME_LEN: usize = 15;

/// TUN device name used when none is given: `v4-<uplink>`, cut to fit.
pub fn default_tun_name(uplink: &str) -> String {
    let mut name = format!("v4-{uplink}");
    let mut end = name.len().min(MAX_IFNAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
    name
}

/// Pick the IPv6-side MTU: configured value, else the uplink's, clamped to
/// what the ring frames and IPv6 allow.
pub fn negotiate_mtu(configured: Option<u16>, uplink: Option<u16>) -> u16 {
    configured
        .or(uplink)
        .unwrap_or(MAX_MTU)
        .clamp(MIN_MTU, MAX_MTU)
}

/// Pick the TUN MTU so that every translated packet fits into `mtu`.
pub fn negotiate_ipv4_mtu(configured: Option<u16>, mtu: u16) -> u16 {
    let max = mtu - MTU_DELTA;
    match configured {
        Some(m) if m > 0 && m <= max => m,
        _ => max,
    }
}

/// Whether two IPv6 addresses share the same /64.
pub fn ipv6_prefix_equal(a: &Ipv6Addr, b: &Ipv6Addr) -> bool {
    a.octets()[..8] == b.octets()[..8]
}

/// Generate a random interface identifier on `prefix`'s /64 that makes the
/// resulting address checksum-neutral with `ipv4_local`.
///
/// After this, the one's-complement sum of `ipv4_local` equals the sum of
/// `plat_subnet` plus the returned address, so translating between the two
/// never changes a transport checksum.
pub fn generate_checksum_neutral_iid<R: RngCore + ?Sized>(
    rng: &mut R,
    prefix: Ipv6Addr,
    ipv4_local: Ipv4Addr,
    plat_subnet: Ipv6Addr,
) -> Ipv6Addr {
    let mut octets = prefix.octets();
    rng.fill_bytes(&mut octets[8..]);

    let c1 = checksum_add(0, &ipv4_local.octets());
    let c2 = checksum_add(0, &plat_subnet.octets()) + checksum_add(0, &octets);

    // Bytes 11 and 12 straddle two words: byte 11 is a low byte, byte 12 a
    // high byte, so together they contribute `b12 << 8 | b11`.
    let middle = u16::from_be_bytes([octets[12], octets[11]]);
    let delta = checksum_adjust(middle, c1, c2);
    let [high, low] = delta.to_be_bytes();
    octets[12] = high;
    octets[11] = low;

    Ipv6Addr::from(octets)
}

/// Find a free IPv4 address in `preferred`'s /`prefixlen` block.
///
/// Starts at `preferred`, increments and wraps within the block, and returns
/// the first address `is_free` accepts. Prefix lengths outside 16..=32 are
/// rejected without probing.
pub fn select_free_ipv4_address(
    preferred: Ipv4Addr,
    prefixlen: u8,
    is_free: impl Fn(Ipv4Addr) -> bool,
) -> Option<Ipv4Addr> {
    if !(16..=32).contains(&prefixlen) {
        return None;
    }

    let mask = u32::MAX.checked_shl(32 - prefixlen as u32).unwrap_or(0);
    let start = u32::from(preferred);
    let prefix = start & mask;

    let mut ip = start;
    loop {
        let addr = Ipv4Addr::from(ip);
        if is_free(addr) {
            return Some(addr);
        }
        ip = prefix | (ip.wrapping_add(1) & !mask);
        if ip == start {
            return None;
        }
    }
}

/// Probe whether `addr` is unassigned on this host.
///
/// Connecting a UDP socket towards the address makes the kernel pick a
/// source; if it picks `addr` itself, the address is local.
pub fn ipv4_address_free(addr: Ipv4Addr) -> bool {
    let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
        return false;
    };
    if socket.connect((addr, 53)).is_err() {
        return true;
    }
    match socket.local_addr() {
        Ok(SocketAddr::V4(local)) => *local.ip() != addr,
        _ => true,
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ClatConfig {
    ClatConfig {
        ipv4_local_subnet: DEFAULT_IPV4_LOCAL_SUBNET,
        ipv4_local_prefixlen: DEFAULT_IPV4_LOCAL_PREFIXLEN,
        ipv6_local_subnet: "2001:db8:0:b11::464".parse().unwrap(),
        plat_subnet: "64:ff9b::".parse().unwrap(),
        ipv6_host_id: Ipv6Addr::UNSPECIFIED,
        use_dynamic_iid: true,
        mtu: MAX_MTU,
        ipv4mtu: MAX_MTU - MTU_DELTA,
        uplink_interface: "wlan0".to_string(),
        tun_interface: "v4-wlan0".to_string(),
        mark: None,
        net_id: None,
    }
}
