//! Stateless IPv4/IPv6 header translation.
//!
//! A translated packet is assembled in a [`ClatPacket`]: eight ordered
//! segments holding the rewritten headers plus a borrowed view of the
//! untouched payload. Nothing is copied beyond the headers, and the result is
//! emitted with a single scatter write.
//!
//! Both directions are pure functions of the input bytes and a
//! [`ClatConfig`]. Anything that cannot be represented in the other family
//! yields a [`TranslateError`] and the packet is dropped.

mod header;
mod icmp;
mod ipv4;
mod ipv6;
mod transport;

pub use header::{FragmentHeader, Ipv4Header, Ipv6Header};
pub use icmp::icmp_guess_ttl;
pub use ipv4::ipv4_packet;
pub use ipv6::ipv6_packet;

use crate::checksum::{checksum_add, checksum_finish};
use crate::config::ClatConfig;
use std::io::IoSlice;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_FRAGMENT: u8 = 44;
pub const IPPROTO_GRE: u8 = 47;
pub const IPPROTO_ICMPV6: u8 = 58;

/// EtherType carried in the TUN packet information header.
pub const ETH_P_IP: u16 = 0x0800;

/// Length of the `tun_pi` header in front of every TUN frame.
pub const TUN_HEADER_LEN: usize = 4;

/// Number of segments in a [`ClatPacket`].
pub const SEGMENT_COUNT: usize = 8;

/// Largest header any segment holds (a TCP header with options).
const MAX_HEADER_LEN: usize = 60;

/// Why a packet was not translated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("{what} truncated: {len} bytes")]
    Truncated { what: &'static str, len: usize },

    #[error("invalid {what} header length {len}")]
    InvalidHeaderLength { what: &'static str, len: usize },

    #[error("unexpected IP version {0}")]
    InvalidVersion(u8),

    #[error("multicast destination {0}")]
    Multicast(Ipv6Addr),

    #[error("{src} -> {dst} is not between the CLAT and PLAT prefixes")]
    ForeignAddress { src: Ipv6Addr, dst: Ipv6Addr },

    #[error("no IPv4 mapping for {0}")]
    UnmappedAddress(Ipv6Addr),

    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("fragmented UDP datagram without checksum")]
    FragmentWithoutChecksum,

    #[error("untranslatable ICMP type {kind} code {code}")]
    UnsupportedIcmp { kind: u8, code: u8 },

    #[error("translated packet too large: {0} bytes")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, TranslateError>;

/// Position of a segment inside a [`ClatPacket`].
///
/// The second group of headers is used for the original packet embedded in
/// an ICMP error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Segment {
    TunHeader,
    IpHeader,
    FragHeader,
    TransportHeader,
    IcmpErrIpHeader,
    IcmpErrFragHeader,
    IcmpErrTransportHeader,
    Payload,
}

impl Segment {
    pub const ALL: [Segment; SEGMENT_COUNT] = [
        Segment::TunHeader,
        Segment::IpHeader,
        Segment::FragHeader,
        Segment::TransportHeader,
        Segment::IcmpErrIpHeader,
        Segment::IcmpErrFragHeader,
        Segment::IcmpErrTransportHeader,
        Segment::Payload,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// The segment following this one. `Payload` is the last.
    pub fn next(self) -> Segment {
        Self::ALL[(self.index() + 1).min(SEGMENT_COUNT - 1)]
    }
}

/// A translated packet under construction.
///
/// Header segments live in fixed scratch buffers owned by the packet, so a
/// `ClatPacket` can be built on the stack without allocating. The payload
/// segment borrows the input buffer.
pub struct ClatPacket<'a> {
    headers: [[u8; MAX_HEADER_LEN]; SEGMENT_COUNT],
    lens: [usize; SEGMENT_COUNT],
    payload: &'a [u8],
}

impl Default for ClatPacket<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ClatPacket<'a> {
    pub fn new() -> Self {
        Self {
            headers: [[0; MAX_HEADER_LEN]; SEGMENT_COUNT],
            lens: [0; SEGMENT_COUNT],
            payload: &[],
        }
    }

    /// Claim `len` zeroed bytes for a header segment.
    pub(crate) fn fill_header(&mut self, segment: Segment, len: usize) -> &mut [u8] {
        debug_assert!(segment != Segment::Payload && len <= MAX_HEADER_LEN);
        let i = segment.index();
        self.lens[i] = len;
        let buf = &mut self.headers[i][..len];
        buf.fill(0);
        buf
    }

    /// The already claimed bytes of a header segment.
    pub(crate) fn header_mut(&mut self, segment: Segment) -> &mut [u8] {
        let i = segment.index();
        &mut self.headers[i][..self.lens[i]]
    }

    pub(crate) fn clear(&mut self, segment: Segment) {
        self.lens[segment.index()] = 0;
    }

    pub(crate) fn set_payload(&mut self, payload: &'a [u8]) {
        self.payload = payload;
        self.lens[Segment::Payload.index()] = payload.len();
    }

    /// Contents of one segment; empty if unused.
    pub fn segment(&self, segment: Segment) -> &[u8] {
        match segment {
            Segment::Payload => self.payload,
            _ => {
                let i = segment.index();
                &self.headers[i][..self.lens[i]]
            }
        }
    }

    /// Total number of bytes from `segment` to the end of the packet.
    pub fn length_from(&self, segment: Segment) -> usize {
        self.lens[segment.index()..].iter().sum()
    }

    /// Total length of the packet, including the TUN header if present.
    pub fn len(&self) -> usize {
        self.length_from(Segment::TunHeader)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checksum over `sum` plus every segment from `segment` to the end.
    pub fn checksum_from(&self, sum: u32, segment: Segment) -> u16 {
        let mut sum = sum;
        for seg in &Segment::ALL[segment.index()..] {
            sum = checksum_add(sum, self.segment(*seg));
        }
        checksum_finish(sum)
    }

    /// Scatter list of the non-empty segments, in order, for one `writev`.
    pub fn io_slices(&self) -> ([IoSlice<'_>; SEGMENT_COUNT], usize) {
        let mut slices = [IoSlice::new(&[]); SEGMENT_COUNT];
        let mut count = 0;
        for seg in Segment::ALL {
            let data = self.segment(seg);
            if !data.is_empty() {
                slices[count] = IoSlice::new(data);
                count += 1;
            }
        }
        (slices, count)
    }

    /// Flatten the packet into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in Segment::ALL {
            out.extend_from_slice(self.segment(seg));
        }
        out
    }
}

/// Translate an IPv4 packet read from the TUN device into IPv6.
pub fn translate_ipv4_to_ipv6<'a>(config: &ClatConfig, packet: &'a [u8]) -> Result<ClatPacket<'a>> {
    let mut out = ClatPacket::new();
    ipv4_packet(&mut out, Segment::IpHeader, packet, config)?;
    Ok(out)
}

/// Translate an IPv6 packet from the uplink into an IPv4 TUN frame.
pub fn translate_ipv6_to_ipv4<'a>(config: &ClatConfig, packet: &'a [u8]) -> Result<ClatPacket<'a>> {
    let mut out = ClatPacket::new();
    let tun_header = out.fill_header(Segment::TunHeader, TUN_HEADER_LEN);
    tun_header[2..4].copy_from_slice(&ETH_P_IP.to_be_bytes());
    ipv6_packet(&mut out, Segment::IpHeader, packet, config)?;
    Ok(out)
}

/// Whether `addr` lies inside the PLAT /96.
pub fn is_in_plat_subnet(config: &ClatConfig, addr: &Ipv6Addr) -> bool {
    addr.octets()[..12] == config.plat_subnet.octets()[..12]
}

/// Map an IPv4 address to IPv6: the local address becomes the CLAT
/// address, everything else is embedded in the PLAT prefix.
pub fn ipv4_addr_to_ipv6_addr(config: &ClatConfig, addr: Ipv4Addr) -> Ipv6Addr {
    if addr == config.ipv4_local_subnet {
        return config.ipv6_local_subnet;
    }
    let mut octets = config.plat_subnet.octets();
    octets[12..].copy_from_slice(&addr.octets());
    Ipv6Addr::from(octets)
}

/// Map an IPv6 address back to IPv4, if it has an IPv4 representation.
pub fn ipv6_addr_to_ipv4_addr(config: &ClatConfig, addr: &Ipv6Addr) -> Option<Ipv4Addr> {
    if is_in_plat_subnet(config, addr) {
        let octets = addr.octets();
        Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    } else if *addr == config.ipv6_local_subnet {
        Some(config.ipv4_local_subnet)
    } else {
        None
    }
}
