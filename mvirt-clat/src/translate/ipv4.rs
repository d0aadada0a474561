//! IPv4 to IPv6 translation.

use super::header::{
    FRAGMENT_HEADER_LEN, Fragment, IPV6_HEADER_LEN, Ipv4Header, write_fragment_header,
    write_ipv6_header,
};
use super::icmp::icmp_to_icmp6;
use super::transport::{generic_packet, tcp_packet, udp_packet};
use super::{
    ClatPacket, IPPROTO_FRAGMENT, IPPROTO_GRE, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP,
    IPPROTO_UDP, Result, Segment, TranslateError, ipv4_addr_to_ipv6_addr,
};
use crate::checksum::ipv6_pseudo_header_checksum;
use crate::config::ClatConfig;

/// Translate the IPv4 packet in `packet` into IPv6, writing the IP header
/// at `pos` and everything else into the segments after it.
///
/// `pos` is [`Segment::IpHeader`] for a packet from the TUN device and
/// [`Segment::IcmpErrIpHeader`] for the packet quoted in an ICMP error.
pub fn ipv4_packet<'a>(
    out: &mut ClatPacket<'a>,
    pos: Segment,
    packet: &'a [u8],
    config: &ClatConfig,
) -> Result<()> {
    let (header, next_header) = Ipv4Header::parse(packet)?;
    let len_left = next_header.len();
    let transport_len =
        u16::try_from(len_left).map_err(|_| TranslateError::TooLarge(packet.len()))?;

    let protocol = match header.protocol() {
        IPPROTO_ICMP => IPPROTO_ICMPV6,
        other => other,
    };

    let src = ipv4_addr_to_ipv6_addr(config, header.src());
    let dst = ipv4_addr_to_ipv6_addr(config, header.dst());
    write_ipv6_header(
        out.fill_header(pos, IPV6_HEADER_LEN),
        protocol,
        header.ttl(),
        &src,
        &dst,
    );

    // Transport checksums cover the pseudo-header, so they only need the
    // difference between the old and new one.
    let old_sum = header.pseudo_header_checksum(transport_len);
    let new_sum = ipv6_pseudo_header_checksum(&src, &dst, len_left as u32, protocol);

    let frag_pos = pos.next();
    let transport_pos = frag_pos.next();

    if header.is_fragment() {
        write_fragment_header(
            out.fill_header(frag_pos, FRAGMENT_HEADER_LEN),
            protocol,
            Fragment::from(&header),
        );
        out.header_mut(pos)[6] = IPPROTO_FRAGMENT;
    } else {
        out.clear(frag_pos);
    }

    if header.fragment_offset() != 0 {
        // Only the first fragment carries the transport header.
        generic_packet(out, transport_pos, next_header);
    } else {
        match protocol {
            IPPROTO_ICMPV6 => icmp_to_icmp6(out, transport_pos, next_header, &src, &dst, config)?,
            IPPROTO_TCP => tcp_packet(out, transport_pos, next_header, old_sum, new_sum)?,
            IPPROTO_UDP => {
                // Quoted packets inside ICMP errors are truncated anyway.
                let fragmented = header.is_fragment() && pos == Segment::IpHeader;
                udp_packet(out, transport_pos, next_header, old_sum, new_sum, fragmented)?
            }
            IPPROTO_GRE => generic_packet(out, transport_pos, next_header),
            other => return Err(TranslateError::UnsupportedProtocol(other)),
        }
    }

    let payload_len = out.length_from(frag_pos);
    let payload_len = u16::try_from(payload_len).map_err(|_| TranslateError::TooLarge(payload_len))?;
    out.header_mut(pos)[4..6].copy_from_slice(&payload_len.to_be_bytes());
    Ok(())
}
