//! The forwarding event loop.
//!
//! One thread polls the uplink packet ring and the TUN device and moves at
//! most one packet per readable descriptor per iteration:
//!
//! - ring -> [`translate_ipv6_to_ipv4`] -> TUN
//! - TUN -> [`translate_ipv4_to_ipv6`] -> raw IPv6 socket
//!
//! Between packets the uplink's global address is re-checked periodically
//! so the CLAT address follows prefix changes on the network.

use crate::config::{ClatConfig, MAX_MTU, ipv6_prefix_equal};
use crate::netif;
use crate::pause::PauseWatcher;
use crate::rawsock::{RawSocket, RawSocketError};
use crate::ring::{PacketRing, RingError};
use crate::signals;
use crate::translate::{
    ClatPacket, Segment, TUN_HEADER_LEN, translate_ipv4_to_ipv6, translate_ipv6_to_ipv4,
};
use crate::tun::{TunDevice, TunPi};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Interface re-check period when nothing was forwarded since the last one.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Interface re-check period while traffic is flowing.
pub const ACTIVE_CHECK_INTERVAL: Duration = Duration::from_secs(90);
/// How often the lock file is looked at while paused.
pub const PAUSED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Largest frame read from the TUN device.
const TUN_BUFFER_LEN: usize = MAX_MTU as usize + TUN_HEADER_LEN;

#[derive(Debug, Error)]
pub enum AddressChangeError {
    #[error(transparent)]
    Anycast(#[from] RawSocketError),

    #[error(transparent)]
    Filter(#[from] RingError),
}

/// The descriptors packets flow through.
pub struct Tunnels {
    pub tun: TunDevice,
    pub raw: RawSocket,
    pub ring: PacketRing,
    /// Interface index of the uplink.
    pub ifindex: u32,
}

/// Where the CLAT address is held on the uplink: an anycast membership
/// that makes the kernel accept it, and the ring filter that captures it.
pub trait AddressBinding {
    fn join_anycast(&self, addr: Ipv6Addr) -> Result<(), RawSocketError>;
    fn leave_anycast(&self, addr: Ipv6Addr) -> Result<(), RawSocketError>;
    fn set_filter(&self, addr: &Ipv6Addr) -> Result<(), RingError>;

    /// Start receiving traffic for `addr`. On failure no membership is left
    /// behind.
    fn bind_local_address(&self, addr: Ipv6Addr) -> Result<(), AddressChangeError> {
        self.join_anycast(addr)?;
        if let Err(e) = self.set_filter(&addr) {
            let _ = self.leave_anycast(addr);
            return Err(e.into());
        }
        Ok(())
    }

    /// Move the CLAT address from `config` to `new_addr` and return the
    /// updated configuration. On failure the previous address stays bound
    /// and `config` remains the one in effect.
    fn change_local_address(
        &self,
        config: &ClatConfig,
        new_addr: Ipv6Addr,
    ) -> Result<ClatConfig, AddressChangeError> {
        self.bind_local_address(new_addr)?;
        let old_addr = config.ipv6_local_subnet;
        if let Err(e) = self.leave_anycast(old_addr) {
            warn!(error = %e, "Failed to leave previous anycast address");
        }
        Ok(config.with_local_address(new_addr))
    }
}

impl AddressBinding for Tunnels {
    fn join_anycast(&self, addr: Ipv6Addr) -> Result<(), RawSocketError> {
        self.raw.join_anycast(addr, self.ifindex)
    }

    fn leave_anycast(&self, addr: Ipv6Addr) -> Result<(), RawSocketError> {
        self.raw.leave_anycast(addr, self.ifindex)
    }

    fn set_filter(&self, addr: &Ipv6Addr) -> Result<(), RingError> {
        self.ring.set_filter(addr)
    }
}

/// Re-check period for the uplink address.
pub fn check_interval(forwarded: bool) -> Duration {
    if forwarded {
        ACTIVE_CHECK_INTERVAL
    } else {
        IDLE_CHECK_INTERVAL
    }
}

/// The new local address to use when `uplink` is no longer in the
/// configured /64, or `None` when nothing changed.
pub fn local_address_change(config: &ClatConfig, uplink: Ipv6Addr) -> Option<Ipv6Addr> {
    if ipv6_prefix_equal(&uplink, &config.ipv6_local_subnet) {
        None
    } else {
        Some(config.generate_local_ipv6_address(uplink))
    }
}

/// Translate a frame read from the TUN device.
///
/// Returns the IPv6 packet and its destination, or `None` if the frame was
/// dropped.
pub fn translate_tun_frame<'a>(
    config: &ClatConfig,
    frame: &'a [u8],
) -> Option<(ClatPacket<'a>, Ipv6Addr)> {
    let Some((pi, packet)) = TunPi::parse(frame) else {
        warn!(len = frame.len(), "Short read from TUN device");
        return None;
    };
    if pi.is_truncated() {
        warn!(len = frame.len(), "TUN frame truncated");
    }
    if !pi.is_ipv4() {
        warn!(proto = format_args!("{:#06x}", pi.proto), "Unexpected protocol on TUN device");
        return None;
    }

    match translate_ipv4_to_ipv6(config, packet) {
        Ok(out) => {
            let ip6 = out.segment(Segment::IpHeader);
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&ip6[24..40]);
            Some((out, Ipv6Addr::from(dst)))
        }
        Err(e) => {
            trace!(error = %e, "Dropped IPv4 packet");
            None
        }
    }
}

/// Events requested for the ring and the TUN device.
///
/// While paused the ring is left out entirely. The TUN device stays in the
/// set with no events requested: `poll` still reports `POLLHUP` and
/// `POLLERR`, so its removal ends the loop even when paused.
fn poll_interest(paused: bool) -> (Option<PollFlags>, PollFlags) {
    if paused {
        (None, PollFlags::empty())
    } else {
        (Some(PollFlags::POLLIN), PollFlags::POLLIN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunAction {
    Idle,
    Read,
    Gone,
}

fn tun_action(events: PollFlags, paused: bool) -> TunAction {
    let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
    if events.contains(PollFlags::POLLNVAL) {
        TunAction::Gone
    } else if paused {
        if events.intersects(hangup) {
            TunAction::Gone
        } else {
            TunAction::Idle
        }
    } else if events.intersects(PollFlags::POLLIN | hangup) {
        TunAction::Read
    } else {
        TunAction::Idle
    }
}

/// Poll timeout: up to the next interface check, and no longer than the
/// lock file poll interval while paused.
fn loop_timeout(until_check: Duration, paused: bool) -> Duration {
    if paused {
        until_check.min(PAUSED_POLL_INTERVAL)
    } else {
        until_check
    }
}

/// Outcome of servicing one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Serviced {
    Nothing,
    Forwarded,
    Closed,
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    if timeout_ms == 0 {
        PollTimeout::ZERO
    } else {
        PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
    }
}

pub struct Daemon {
    config: ClatConfig,
    tunnels: Tunnels,
    pause: PauseWatcher,
    last_check: Instant,
    forwarded: bool,
}

impl Daemon {
    /// Create the loop. The local address in `config` must already be bound
    /// with [`AddressBinding::bind_local_address`].
    pub fn new(config: ClatConfig, tunnels: Tunnels, pause: PauseWatcher) -> Self {
        Self {
            config,
            tunnels,
            pause,
            last_check: Instant::now(),
            forwarded: false,
        }
    }

    /// Forward packets until a termination signal arrives or the TUN
    /// device goes away.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            uplink = %self.config.uplink_interface,
            tun = %self.config.tun_interface,
            local = %self.config.ipv6_local_subnet,
            plat = %self.config.plat_subnet,
            "Forwarding started"
        );

        while signals::running() {
            let paused = self.pause.refresh();
            let until_check = (self.last_check + check_interval(self.forwarded))
                .saturating_duration_since(Instant::now());
            let timeout = loop_timeout(until_check, paused);
            let (ring_interest, tun_interest) = poll_interest(paused);

            let (ring_events, tun_events, watch_events) = {
                let mut fds = Vec::with_capacity(3);
                let ring_slot = ring_interest.map(|events| {
                    fds.push(PollFd::new(self.tunnels.ring.as_fd(), events));
                    fds.len() - 1
                });
                fds.push(PollFd::new(self.tunnels.tun.as_fd(), tun_interest));
                let tun_slot = fds.len() - 1;
                let watch_slot = self.pause.fd().map(|fd| {
                    fds.push(PollFd::new(fd, PollFlags::POLLIN));
                    fds.len() - 1
                });

                match poll(&mut fds, poll_timeout(timeout)) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(io::Error::from(e)),
                }

                let events = |slot: Option<usize>| {
                    slot.and_then(|i| fds[i].revents())
                        .unwrap_or(PollFlags::empty())
                };
                (events(ring_slot), events(Some(tun_slot)), events(watch_slot))
            };

            if !watch_events.is_empty() {
                self.pause.drain();
                debug!("Lock file directory changed");
            }

            if ring_events.contains(PollFlags::POLLERR) {
                self.tunnels.ring.clear_error();
            }
            if ring_events.contains(PollFlags::POLLIN) && self.read_ring() == Serviced::Forwarded {
                self.forwarded = true;
            }

            let tun_closed = match tun_action(tun_events, paused) {
                TunAction::Gone => true,
                TunAction::Read => match self.read_tun() {
                    Serviced::Closed => true,
                    Serviced::Forwarded => {
                        self.forwarded = true;
                        false
                    }
                    Serviced::Nothing => false,
                },
                TunAction::Idle => false,
            };
            if tun_closed {
                info!(tun = %self.config.tun_interface, "TUN device removed, exiting");
                break;
            }

            if self.last_check.elapsed() >= check_interval(self.forwarded) {
                self.check_uplink_address();
                self.last_check = Instant::now();
                self.forwarded = false;
            }
        }

        if let Err(e) = self.tunnels.leave_anycast(self.config.ipv6_local_subnet) {
            debug!(error = %e, "Failed to leave anycast address on exit");
        }
        info!("Forwarding stopped");
        Ok(())
    }

    /// Move one frame from the ring to the TUN device.
    fn read_ring(&mut self) -> Serviced {
        let config = &self.config;
        let tun = &self.tunnels.tun;
        let Some(frame) = self.tunnels.ring.next_frame() else {
            return Serviced::Nothing;
        };

        let out = match translate_ipv6_to_ipv4(config, frame.data()) {
            Ok(out) => out,
            Err(e) => {
                trace!(error = %e, "Dropped IPv6 packet");
                return Serviced::Nothing;
            }
        };

        let (slices, count) = out.io_slices();
        if let Err(e) = tun.write_frame(&slices[..count]) {
            if e.kind() != io::ErrorKind::WouldBlock {
                warn!(error = %e, "Write to TUN device failed");
            }
        }
        Serviced::Forwarded
    }

    /// Move one packet from the TUN device to the uplink.
    fn read_tun(&mut self) -> Serviced {
        let mut buf = [0u8; TUN_BUFFER_LEN];
        let len = match self.tunnels.tun.read_frame(&mut buf) {
            Ok(0) => return Serviced::Closed,
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Serviced::Nothing,
            Err(e) => {
                warn!(error = %e, "Read from TUN device failed");
                return Serviced::Nothing;
            }
        };

        let Some((out, dst)) = translate_tun_frame(&self.config, &buf[..len]) else {
            return Serviced::Nothing;
        };

        let (slices, count) = out.io_slices();
        if let Err(e) = self.tunnels.raw.send(&slices[..count], dst) {
            if e.kind() != io::ErrorKind::WouldBlock {
                warn!(error = %e, %dst, "Send on raw socket failed");
            }
        }
        Serviced::Forwarded
    }

    /// Follow the uplink to a new /64 if it moved.
    fn check_uplink_address(&mut self) {
        let uplink = match netif::global_ipv6_address(
            &self.config.uplink_interface,
            Some(&self.config.ipv6_local_subnet),
        ) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, "Uplink address unavailable");
                return;
            }
        };
        let Some(new_addr) = local_address_change(&self.config, uplink) else {
            return;
        };

        info!(old = %self.config.ipv6_local_subnet, new = %new_addr, "Uplink prefix changed");
        match self.tunnels.change_local_address(&self.config, new_addr) {
            Ok(config) => self.config = config,
            Err(e) => warn!(error = %e, "Address change failed, keeping previous address"),
        }
    }
}
