//! Length-checked views of the IP-layer headers and their writers.
//!
//! Every view is created through `parse`, which validates the buffer before
//! any field is read. Field accessors then index freely.

use super::{Result, TranslateError};
use crate::checksum::{ipv4_pseudo_header_checksum, ipv6_pseudo_header_checksum};
use std::net::{Ipv4Addr, Ipv6Addr};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const FRAGMENT_HEADER_LEN: usize = 8;

/// IPv4 "don't fragment" flag.
const IP_DF: u16 = 0x4000;
/// IPv4 "more fragments" flag.
const IP_MF: u16 = 0x2000;
/// IPv4 fragment offset mask, in 8-byte units.
const IP_OFFMASK: u16 = 0x1fff;
/// IPv6 fragment header "more fragments" flag.
const IP6F_MORE_FRAG: u16 = 0x0001;

/// An IPv4 header without options.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header<'a> {
    bytes: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    /// Split `packet` into its header and the bytes following it.
    ///
    /// Options are skipped. Trailing bytes beyond the total length field are
    /// cut off; a total length larger than the buffer is tolerated because
    /// packets quoted in ICMP errors are truncated.
    pub fn parse(packet: &'a [u8]) -> Result<(Self, &'a [u8])> {
        if packet.len() < IPV4_HEADER_LEN {
            return Err(TranslateError::Truncated {
                what: "IPv4 header",
                len: packet.len(),
            });
        }

        let header_len = (packet[0] & 0x0f) as usize * 4;
        if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
            return Err(TranslateError::InvalidHeaderLength {
                what: "IPv4",
                len: header_len,
            });
        }

        let version = packet[0] >> 4;
        if version != 4 {
            return Err(TranslateError::InvalidVersion(version));
        }

        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let end = if total_len >= header_len && total_len < packet.len() {
            total_len
        } else {
            packet.len()
        };

        let header = Self {
            bytes: &packet[..IPV4_HEADER_LEN],
        };
        Ok((header, &packet[header_len..end]))
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[4], self.bytes[5]])
    }

    fn frag_off(&self) -> u16 {
        u16::from_be_bytes([self.bytes[6], self.bytes[7]])
    }

    pub fn more_fragments(&self) -> bool {
        self.frag_off() & IP_MF != 0
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.frag_off() & IP_OFFMASK
    }

    /// Whether this packet is any part of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    pub fn ttl(&self) -> u8 {
        self.bytes[8]
    }

    pub fn protocol(&self) -> u8 {
        self.bytes[9]
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.bytes[16], self.bytes[17], self.bytes[18], self.bytes[19])
    }

    pub fn pseudo_header_checksum(&self, len: u16) -> u32 {
        ipv4_pseudo_header_checksum(self.src(), self.dst(), self.protocol(), len)
    }
}

/// A fixed IPv6 header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Header<'a> {
    bytes: &'a [u8],
}

impl<'a> Ipv6Header<'a> {
    /// Split `packet` into its fixed header and the bytes following it.
    ///
    /// Trailing bytes beyond the payload length are cut off.
    pub fn parse(packet: &'a [u8]) -> Result<(Self, &'a [u8])> {
        if packet.len() < IPV6_HEADER_LEN {
            return Err(TranslateError::Truncated {
                what: "IPv6 header",
                len: packet.len(),
            });
        }

        let version = packet[0] >> 4;
        if version != 6 {
            return Err(TranslateError::InvalidVersion(version));
        }

        let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        let end = IPV6_HEADER_LEN + payload_len;
        let end = if payload_len > 0 && end < packet.len() {
            end
        } else {
            packet.len()
        };

        let header = Self {
            bytes: &packet[..IPV6_HEADER_LEN],
        };
        Ok((header, &packet[IPV6_HEADER_LEN..end]))
    }

    pub fn next_header(&self) -> u8 {
        self.bytes[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.bytes[7]
    }

    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(address(&self.bytes[8..24]))
    }

    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(address(&self.bytes[24..40]))
    }

    pub fn pseudo_header_checksum(&self, len: u32, protocol: u8) -> u32 {
        ipv6_pseudo_header_checksum(&self.src(), &self.dst(), len, protocol)
    }
}

fn address(bytes: &[u8]) -> [u8; 16] {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    octets
}

/// An IPv6 Fragment extension header.
#[derive(Debug, Clone, Copy)]
pub struct FragmentHeader<'a> {
    bytes: &'a [u8],
}

impl<'a> FragmentHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<(Self, &'a [u8])> {
        if data.len() < FRAGMENT_HEADER_LEN {
            return Err(TranslateError::Truncated {
                what: "fragment header",
                len: data.len(),
            });
        }
        let (bytes, rest) = data.split_at(FRAGMENT_HEADER_LEN);
        Ok((Self { bytes }, rest))
    }

    pub fn next_header(&self) -> u8 {
        self.bytes[0]
    }

    fn offlg(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.offlg() >> 3
    }

    pub fn more_fragments(&self) -> bool {
        self.offlg() & IP6F_MORE_FRAG != 0
    }

    pub fn identification(&self) -> u32 {
        u32::from_be_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }
}

/// Fragmentation state carried across a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Offset in 8-byte units.
    pub offset: u16,
    pub more: bool,
    pub id: u32,
}

impl From<&Ipv4Header<'_>> for Fragment {
    /// The 16-bit IPv4 ID is widened into the low half of the IPv6 ID.
    fn from(header: &Ipv4Header<'_>) -> Self {
        Self {
            offset: header.fragment_offset(),
            more: header.more_fragments(),
            id: header.id() as u32,
        }
    }
}

impl From<&FragmentHeader<'_>> for Fragment {
    fn from(header: &FragmentHeader<'_>) -> Self {
        Self {
            offset: header.fragment_offset(),
            more: header.more_fragments(),
            id: header.identification(),
        }
    }
}

/// Write an IPv6 header with a zero payload length, patched later.
pub fn write_ipv6_header(
    buf: &mut [u8],
    next_header: u8,
    hop_limit: u8,
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
) {
    buf[0] = 0x60;
    buf[6] = next_header;
    buf[7] = hop_limit;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());
}

/// Write an IPv4 header with zero total length and checksum, patched later.
///
/// Unfragmented packets get DF set and ID 0; fragments keep their offset and
/// MF flag and narrow the IPv6 ID to its low 16 bits.
pub fn write_ipv4_header(
    buf: &mut [u8],
    protocol: u8,
    ttl: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    fragment: Option<Fragment>,
) {
    let (id, frag_off) = match fragment {
        Some(frag) => {
            let more = if frag.more { IP_MF } else { 0 };
            (frag.id as u16, (frag.offset & IP_OFFMASK) | more)
        }
        None => (0, IP_DF),
    };

    buf[0] = 0x45;
    buf[4..6].copy_from_slice(&id.to_be_bytes());
    buf[6..8].copy_from_slice(&frag_off.to_be_bytes());
    buf[8] = ttl;
    buf[9] = protocol;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
}

/// Write an IPv6 Fragment header.
pub fn write_fragment_header(buf: &mut [u8], next_header: u8, fragment: Fragment) {
    let more = if fragment.more { IP6F_MORE_FRAG } else { 0 };
    let offlg = (fragment.offset << 3) | more;

    buf[0] = next_header;
    buf[2..4].copy_from_slice(&offlg.to_be_bytes());
    buf[4..8].copy_from_slice(&fragment.id.to_be_bytes());
}
