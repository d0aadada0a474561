//! IPv6 to IPv4 translation.

use super::header::{Fragment, FragmentHeader, IPV4_HEADER_LEN, Ipv6Header, write_ipv4_header};
use super::icmp::{icmp_guess_ttl, icmp6_to_icmp};
use super::transport::{generic_packet, tcp_packet, udp_packet};
use super::{
    ClatPacket, IPPROTO_FRAGMENT, IPPROTO_GRE, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP,
    IPPROTO_UDP, Result, Segment, TranslateError, ipv6_addr_to_ipv4_addr,
};
use crate::checksum::{checksum, ipv4_pseudo_header_checksum};
use crate::config::{ClatConfig, ipv6_prefix_equal};
use std::net::Ipv4Addr;

/// Translate the IPv6 packet in `packet` into IPv4, writing the IP header
/// at `pos` and everything else into the segments after it.
///
/// Only traffic between the PLAT prefix and the CLAT address is translated.
/// ICMPv6 is exempt from the subnet check so errors generated by routers on
/// the path reach the IPv4 side; their sources become `255.0.0.<hops>`.
pub fn ipv6_packet<'a>(
    out: &mut ClatPacket<'a>,
    pos: Segment,
    packet: &'a [u8],
    config: &ClatConfig,
) -> Result<()> {
    let (header, mut next_header) = Ipv6Header::parse(packet)?;
    let src6 = header.src();
    let dst6 = header.dst();
    let mut protocol = header.next_header();

    if dst6.is_multicast() {
        return Err(TranslateError::Multicast(dst6));
    }

    let plat = &config.plat_subnet;
    let local = &config.ipv6_local_subnet;
    let inbound = ipv6_prefix_equal(&src6, plat) && ipv6_prefix_equal(&dst6, local);
    let outbound = ipv6_prefix_equal(&src6, local) && ipv6_prefix_equal(&dst6, plat);
    if !(inbound || outbound) && protocol != IPPROTO_ICMPV6 {
        return Err(TranslateError::ForeignAddress {
            src: src6,
            dst: dst6,
        });
    }

    let src = match ipv6_addr_to_ipv4_addr(config, &src6) {
        Some(addr) => addr,
        None if protocol == IPPROTO_ICMPV6 => {
            Ipv4Addr::new(255, 0, 0, icmp_guess_ttl(header.hop_limit()))
        }
        None => return Err(TranslateError::UnmappedAddress(src6)),
    };
    let dst =
        ipv6_addr_to_ipv4_addr(config, &dst6).ok_or(TranslateError::UnmappedAddress(dst6))?;

    let mut fragment = None;
    if protocol == IPPROTO_FRAGMENT {
        let (frag_header, rest) = FragmentHeader::parse(next_header)?;
        protocol = frag_header.next_header();
        fragment = Some(Fragment::from(&frag_header));
        next_header = rest;
    }

    let len_left = next_header.len();
    let transport_len =
        u16::try_from(len_left).map_err(|_| TranslateError::TooLarge(packet.len()))?;

    let ip_protocol = match protocol {
        IPPROTO_ICMPV6 => IPPROTO_ICMP,
        other => other,
    };

    write_ipv4_header(
        out.fill_header(pos, IPV4_HEADER_LEN),
        ip_protocol,
        header.hop_limit(),
        src,
        dst,
        fragment,
    );

    let frag_pos = pos.next();
    let transport_pos = frag_pos.next();
    out.clear(frag_pos);

    // Checksum deltas are computed over the real addresses, so the
    // synthesized ICMP source above never enters a transport checksum.
    let old_sum = header.pseudo_header_checksum(len_left as u32, protocol);
    let new_sum = ipv4_pseudo_header_checksum(src, dst, ip_protocol, transport_len);

    if fragment.is_some_and(|frag| frag.offset != 0) {
        generic_packet(out, transport_pos, next_header);
    } else {
        match protocol {
            IPPROTO_ICMPV6 => icmp6_to_icmp(out, transport_pos, next_header, config)?,
            IPPROTO_TCP => tcp_packet(out, transport_pos, next_header, old_sum, new_sum)?,
            IPPROTO_UDP => {
                // Quoted packets inside ICMP errors are truncated anyway.
                let fragmented = fragment.is_some() && pos == Segment::IpHeader;
                udp_packet(out, transport_pos, next_header, old_sum, new_sum, fragmented)?
            }
            IPPROTO_GRE => generic_packet(out, transport_pos, next_header),
            other => return Err(TranslateError::UnsupportedProtocol(other)),
        }
    }

    let total_len = IPV4_HEADER_LEN + out.length_from(frag_pos);
    let total_len = u16::try_from(total_len).map_err(|_| TranslateError::TooLarge(total_len))?;
    let ip = out.header_mut(pos);
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    let check = checksum(ip);
    ip[10..12].copy_from_slice(&check.to_be_bytes());
    Ok(())
}
