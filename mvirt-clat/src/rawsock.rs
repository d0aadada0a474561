//! Raw IPv6 socket for translated outbound packets.
//!
//! Packets are sent with `IPPROTO_RAW`, so the kernel takes the IPv6 header
//! from the buffer as-is. The same socket holds the anycast membership that
//! makes the kernel accept traffic for the CLAT address on the uplink.

use nix::libc;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, IoSlice};
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use thiserror::Error;
use tracing::{debug, info};

/// From linux/in6.h; not exported by libc.
const IPV6_JOIN_ANYCAST: libc::c_int = 27;
const IPV6_LEAVE_ANYCAST: libc::c_int = 28;

#[derive(Debug, Error)]
pub enum RawSocketError {
    #[error("failed to open raw IPv6 socket: {0}")]
    Open(#[source] io::Error),

    #[error("failed to set SO_MARK {mark}: {source}")]
    Mark {
        mark: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to {action} anycast address {addr}: {source}")]
    Anycast {
        action: &'static str,
        addr: Ipv6Addr,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RawSocketError>;

/// Outbound raw IPv6 socket.
pub struct RawSocket {
    socket: Socket,
}

impl RawSocket {
    /// Open a non-blocking raw socket, optionally tagging every packet with
    /// `mark` so policy routing can steer it.
    pub fn open(mark: Option<u32>) -> Result<Self> {
        let socket = Socket::new(
            Domain::IPV6,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )
        .map_err(RawSocketError::Open)?;
        socket.set_nonblocking(true).map_err(RawSocketError::Open)?;

        if let Some(mark) = mark {
            socket
                .set_mark(mark)
                .map_err(|source| RawSocketError::Mark { mark, source })?;
            debug!(mark, "Raw socket mark set");
        }

        Ok(Self { socket })
    }

    /// Send one IPv6 packet assembled from `slices` to `dst`.
    pub fn send(&self, slices: &[IoSlice<'_>], dst: Ipv6Addr) -> io::Result<usize> {
        self.socket.send_to_vectored(slices, &destination(dst))
    }

    pub fn join_anycast(&self, addr: Ipv6Addr, ifindex: u32) -> Result<()> {
        self.anycast(IPV6_JOIN_ANYCAST, "join", addr, ifindex)?;
        info!(%addr, ifindex, "Joined anycast address");
        Ok(())
    }

    pub fn leave_anycast(&self, addr: Ipv6Addr, ifindex: u32) -> Result<()> {
        self.anycast(IPV6_LEAVE_ANYCAST, "leave", addr, ifindex)?;
        debug!(%addr, ifindex, "Left anycast address");
        Ok(())
    }

    fn anycast(
        &self,
        option: libc::c_int,
        action: &'static str,
        addr: Ipv6Addr,
        ifindex: u32,
    ) -> Result<()> {
        let mreq = anycast_request(addr, ifindex);
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IPV6,
                option,
                &mreq as *const libc::ipv6_mreq as *const libc::c_void,
                std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(RawSocketError::Anycast {
                action,
                addr,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Raw sockets take no port; the address only selects the route.
fn destination(dst: Ipv6Addr) -> SockAddr {
    SockAddr::from(SocketAddrV6::new(dst, 0, 0, 0))
}

fn anycast_request(addr: Ipv6Addr, ifindex: u32) -> libc::ipv6_mreq {
    libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr {
            s6_addr: addr.octets(),
        },
        ipv6mr_interface: ifindex as libc::c_uint,
    }
}

impl AsFd for RawSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_has_no_port() {
        let dst: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
        let addr = destination(dst);
        assert!(addr.is_ipv6());
        assert_eq!(addr.as_socket_ipv6(), Some(SocketAddrV6::new(dst, 0, 0, 0)));
        assert_eq!(addr.len() as usize, std::mem::size_of::<libc::sockaddr_in6>());
    }

    #[test]
    fn test_anycast_request() {
        let addr: Ipv6Addr = "2001:db8:0:b11::464".parse().unwrap();
        let mreq = anycast_request(addr, 7);
        assert_eq!(mreq.ipv6mr_multiaddr.s6_addr, addr.octets());
        assert_eq!(mreq.ipv6mr_interface, 7);
    }

    #[test]
    fn test_anycast_error_names_address() {
        let addr: Ipv6Addr = "2001:db8:0:b11::464".parse().unwrap();
        let err = RawSocketError::Anycast {
            action: "join",
            addr,
            source: io::Error::from_raw_os_error(libc::EADDRINUSE),
        };
        assert!(
            err.to_string()
                .starts_with("failed to join anycast address 2001:db8:0:b11::464:")
        );
    }
}
