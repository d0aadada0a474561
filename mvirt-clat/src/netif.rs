//! Interface lookups on the uplink and configuration of the TUN device.

use crate::config::ipv6_prefix_equal;
use nix::libc::{self, IFNAMSIZ, c_char, c_int, c_short};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum NetifError {
    #[error("interface {0} not found: {1}")]
    NotFound(String, #[source] nix::Error),

    #[error("interface {0} has no global IPv6 address")]
    NoGlobalAddress(String),

    #[error("failed to list interface addresses: {0}")]
    Addresses(#[source] nix::Error),

    #[error("{op} failed on {name}: {source}")]
    Ioctl {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Command(String),
}

pub type Result<T> = std::result::Result<T, NetifError>;

/// ifreq carrying interface flags
#[repr(C)]
struct IfReqFlags {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// ifreq carrying an MTU
#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_mtu: c_int,
    _pad: [u8; 20],
}

fn ifr_name(name: &str) -> [c_char; IFNAMSIZ] {
    let mut buf = [0; IFNAMSIZ];
    for (i, byte) in name.bytes().take(IFNAMSIZ - 1).enumerate() {
        buf[i] = byte as c_char;
    }
    buf
}

/// Datagram socket used only as an ioctl handle.
fn ioctl_socket(name: &str) -> Result<OwnedFd> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(NetifError::Ioctl {
            op: "socket",
            name: name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

fn ioctl<T>(
    sock: &OwnedFd,
    request: libc::Ioctl,
    op: &'static str,
    name: &str,
    req: &mut T,
) -> Result<()> {
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), request, req as *mut T) };
    if ret < 0 {
        return Err(NetifError::Ioctl {
            op,
            name: name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

pub fn interface_index(name: &str) -> Result<u32> {
    nix::net::if_::if_nametoindex(name).map_err(|e| NetifError::NotFound(name.to_string(), e))
}

pub fn interface_mtu(name: &str) -> Result<u16> {
    let sock = ioctl_socket(name)?;
    let mut ifr = IfReqMtu {
        ifr_name: ifr_name(name),
        ifr_mtu: 0,
        _pad: [0; 20],
    };
    ioctl(&sock, libc::SIOCGIFMTU as libc::Ioctl, "SIOCGIFMTU", name, &mut ifr)?;
    Ok(u16::try_from(ifr.ifr_mtu).unwrap_or(u16::MAX))
}

/// Whether `addr` can serve as the uplink's routable address.
pub fn is_global_unicast(addr: &Ipv6Addr) -> bool {
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        || addr.is_unicast_link_local())
}

/// A global IPv6 address configured on `name`.
///
/// With several prefixes on the uplink, an address inside `current`'s /64
/// wins so the CLAT address does not hop between them.
pub fn global_ipv6_address(name: &str, current: Option<&Ipv6Addr>) -> Result<Ipv6Addr> {
    let addrs: Vec<Ipv6Addr> = nix::ifaddrs::getifaddrs()
        .map_err(NetifError::Addresses)?
        .filter(|ifa| ifa.interface_name == name)
        .filter_map(|ifa| ifa.address?.as_sockaddr_in6().map(|sin6| sin6.ip()))
        .filter(is_global_unicast)
        .collect();
    preferred_address(&addrs, current)
        .ok_or_else(|| NetifError::NoGlobalAddress(name.to_string()))
}

fn preferred_address(addrs: &[Ipv6Addr], current: Option<&Ipv6Addr>) -> Option<Ipv6Addr> {
    current
        .and_then(|current| addrs.iter().find(|addr| ipv6_prefix_equal(addr, current)))
        .or_else(|| addrs.first())
        .copied()
}

/// Address the TUN device, set its MTU and bring it up.
pub fn configure_tun(name: &str, addr: Ipv4Addr, mtu: u16) -> Result<()> {
    let sock = ioctl_socket(name)?;

    let mut ifr = IfReqMtu {
        ifr_name: ifr_name(name),
        ifr_mtu: mtu as c_int,
        _pad: [0; 20],
    };
    ioctl(&sock, libc::SIOCSIFMTU as libc::Ioctl, "SIOCSIFMTU", name, &mut ifr)?;

    add_address(name, addr)?;

    let mut ifr = IfReqFlags {
        ifr_name: ifr_name(name),
        ifr_flags: 0,
        _pad: [0; 22],
    };
    ioctl(&sock, libc::SIOCGIFFLAGS as libc::Ioctl, "SIOCGIFFLAGS", name, &mut ifr)?;
    ifr.ifr_flags |= libc::IFF_UP as c_short;
    ioctl(&sock, libc::SIOCSIFFLAGS as libc::Ioctl, "SIOCSIFFLAGS", name, &mut ifr)?;

    info!(name, %addr, mtu, "TUN interface configured");
    Ok(())
}

/// Runs `ip addr add <addr>/32 dev <name>`.
fn add_address(name: &str, addr: Ipv4Addr) -> Result<()> {
    let cidr = format!("{addr}/32");
    let output = Command::new("ip")
        .args(["addr", "add", &cidr, "dev", name])
        .output()
        .map_err(|e| NetifError::Command(format!("failed to run ip: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Address already present from a previous run
        if !stderr.contains("File exists") {
            return Err(NetifError::Command(format!(
                "ip addr add failed: {}",
                stderr.trim()
            )));
        }
        debug!(name, %addr, "Address already assigned");
    }
    Ok(())
}
