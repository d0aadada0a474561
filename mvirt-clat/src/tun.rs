//! TUN device carrying the IPv4 side of the translator.
//!
//! The device is opened with packet information enabled, so every frame
//! starts with a 4-byte `tun_pi` header naming the EtherType.

use crate::translate::{ETH_P_IP, TUN_HEADER_LEN};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc::{self, IFF_TUN, IFNAMSIZ, c_char, c_short};
use nix::sys::uio::writev;
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use thiserror::Error;
use tracing::{debug, info};

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;

/// `tun_pi` flag set when the kernel truncated a frame to fit the buffer.
pub const TUN_PKT_STRIP: u16 = 0x0001;

#[derive(Debug, Error)]
pub enum TunError {
    #[error("TUN device name {0:?} is empty or longer than {max} bytes", max = IFNAMSIZ - 1)]
    InvalidName(String),

    #[error("failed to open /dev/net/tun: {0}")]
    Open(#[source] io::Error),

    #[error("TUNSETIFF failed for {name}: {source}")]
    SetIff {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to change blocking mode: {0}")]
    Fcntl(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, TunError>;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

/// Packet information header in front of every TUN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunPi {
    pub flags: u16,
    pub proto: u16,
}

impl TunPi {
    /// Split a frame read from the device into its header and packet.
    pub fn parse(frame: &[u8]) -> Option<(Self, &[u8])> {
        if frame.len() < TUN_HEADER_LEN {
            return None;
        }
        let (header, packet) = frame.split_at(TUN_HEADER_LEN);
        let pi = Self {
            flags: u16::from_be_bytes([header[0], header[1]]),
            proto: u16::from_be_bytes([header[2], header[3]]),
        };
        Some((pi, packet))
    }

    pub fn is_ipv4(&self) -> bool {
        self.proto == ETH_P_IP
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & TUN_PKT_STRIP != 0
    }
}

/// The translator's IPv4 TUN interface.
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Create (or attach to) the TUN interface `name`.
    ///
    /// Requires CAP_NET_ADMIN.
    pub fn create(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(TunError::InvalidName(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(TunError::Open)?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN as c_short,
            _padding: [0; 22],
        };
        for (i, byte) in name.bytes().enumerate() {
            ifr.ifr_name[i] = byte as c_char;
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if ret < 0 {
            return Err(TunError::SetIff {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        info!(name, "TUN device created");
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let flags = OFlag::from_bits_truncate(fcntl(self.file.as_fd(), FcntlArg::F_GETFL)?);
        let flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags - OFlag::O_NONBLOCK
        };
        fcntl(self.file.as_fd(), FcntlArg::F_SETFL(flags))?;
        debug!(name = %self.name, nonblocking, "TUN blocking mode changed");
        Ok(())
    }

    /// Read one frame, including its `tun_pi` header.
    ///
    /// `Ok(0)` means the interface was removed.
    pub fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    /// Write one frame assembled from `slices`; the first slice must be the
    /// `tun_pi` header.
    pub fn write_frame(&self, slices: &[IoSlice<'_>]) -> io::Result<usize> {
        writev(self.file.as_fd(), slices).map_err(io::Error::from)
    }
}

impl AsFd for TunDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
