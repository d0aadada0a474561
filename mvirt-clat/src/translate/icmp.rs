//! ICMP <-> ICMPv6 translation (RFC 7915 sections 4.2 and 5.2).
//!
//! Echo messages keep their identifier, sequence and payload. Error messages
//! carry the offending packet, which is translated recursively into the
//! ICMP-error segments so it matches what the peer originally sent.

use super::{
    ClatPacket, IPPROTO_ICMPV6, Result, Segment, TranslateError, ipv4_packet, ipv6_packet,
};
use crate::checksum::ipv6_pseudo_header_checksum;
use crate::config::ClatConfig;
use std::net::Ipv6Addr;

const ICMP_HEADER_LEN: usize = 8;

const ICMP_ECHOREPLY: u8 = 0;
const ICMP_UNREACH: u8 = 3;
const ICMP_ECHO: u8 = 8;
const ICMP_TIMXCEED: u8 = 11;
const ICMP_PARAMPROB: u8 = 12;

const ICMP_UNREACH_NET: u8 = 0;
const ICMP_UNREACH_HOST: u8 = 1;
const ICMP_UNREACH_PROTOCOL: u8 = 2;
const ICMP_UNREACH_PORT: u8 = 3;
const ICMP_UNREACH_NEEDFRAG: u8 = 4;
const ICMP_UNREACH_SRCFAIL: u8 = 5;
const ICMP_UNREACH_NET_UNKNOWN: u8 = 6;
const ICMP_UNREACH_HOST_UNKNOWN: u8 = 7;
const ICMP_UNREACH_ISOLATED: u8 = 8;
const ICMP_UNREACH_NET_PROHIB: u8 = 9;
const ICMP_UNREACH_HOST_PROHIB: u8 = 10;
const ICMP_UNREACH_TOSNET: u8 = 11;
const ICMP_UNREACH_TOSHOST: u8 = 12;
const ICMP_UNREACH_FILTER_PROHIB: u8 = 13;
const ICMP_UNREACH_PRECEDENCE_CUTOFF: u8 = 15;

const ICMP6_DST_UNREACH: u8 = 1;
const ICMP6_PACKET_TOO_BIG: u8 = 2;
const ICMP6_TIME_EXCEEDED: u8 = 3;
const ICMP6_PARAM_PROB: u8 = 4;
const ICMP6_ECHO_REQUEST: u8 = 128;
const ICMP6_ECHO_REPLY: u8 = 129;

const ICMP6_DST_UNREACH_NOROUTE: u8 = 0;
const ICMP6_DST_UNREACH_ADMIN: u8 = 1;
const ICMP6_DST_UNREACH_BEYONDSCOPE: u8 = 2;
const ICMP6_DST_UNREACH_ADDR: u8 = 3;
const ICMP6_DST_UNREACH_NOPORT: u8 = 4;

/// Minimum IPv6 link MTU.
const IPV6_MIN_MTU: u32 = 1280;
/// Size difference between the IPv6 and IPv4 headers.
const HEADER_GROWTH: u32 = 20;

fn is_icmp_error(icmp_type: u8) -> bool {
    matches!(icmp_type, ICMP_UNREACH | ICMP_TIMXCEED | ICMP_PARAMPROB)
}

/// ICMPv6 type for an ICMP message. Parameter problem marks messages that
/// have no translation.
fn icmp_to_icmp6_type(icmp_type: u8, code: u8) -> u8 {
    match (icmp_type, code) {
        (ICMP_ECHO, _) => ICMP6_ECHO_REQUEST,
        (ICMP_ECHOREPLY, _) => ICMP6_ECHO_REPLY,
        (ICMP_TIMXCEED, _) => ICMP6_TIME_EXCEEDED,
        (ICMP_UNREACH, ICMP_UNREACH_NEEDFRAG) => ICMP6_PACKET_TOO_BIG,
        (ICMP_UNREACH, ICMP_UNREACH_PROTOCOL) => ICMP6_PARAM_PROB,
        (ICMP_UNREACH, _) => ICMP6_DST_UNREACH,
        _ => ICMP6_PARAM_PROB,
    }
}

fn icmp_to_icmp6_code(icmp_type: u8, code: u8) -> u8 {
    match icmp_type {
        ICMP_ECHO | ICMP_ECHOREPLY => 0,
        ICMP_TIMXCEED => code,
        ICMP_UNREACH => match code {
            ICMP_UNREACH_NET
            | ICMP_UNREACH_HOST
            | ICMP_UNREACH_SRCFAIL
            | ICMP_UNREACH_NET_UNKNOWN
            | ICMP_UNREACH_HOST_UNKNOWN
            | ICMP_UNREACH_ISOLATED
            | ICMP_UNREACH_TOSNET
            | ICMP_UNREACH_TOSHOST => ICMP6_DST_UNREACH_NOROUTE,
            ICMP_UNREACH_PORT => ICMP6_DST_UNREACH_NOPORT,
            ICMP_UNREACH_NET_PROHIB
            | ICMP_UNREACH_HOST_PROHIB
            | ICMP_UNREACH_FILTER_PROHIB
            | ICMP_UNREACH_PRECEDENCE_CUTOFF => ICMP6_DST_UNREACH_ADMIN,
            _ => 0,
        },
        _ => 0,
    }
}

/// ICMP type for an ICMPv6 message. Parameter problem marks messages that
/// have no translation.
fn icmp6_to_icmp_type(icmp6_type: u8) -> u8 {
    match icmp6_type {
        ICMP6_ECHO_REQUEST => ICMP_ECHO,
        ICMP6_ECHO_REPLY => ICMP_ECHOREPLY,
        ICMP6_TIME_EXCEEDED => ICMP_TIMXCEED,
        ICMP6_DST_UNREACH | ICMP6_PACKET_TOO_BIG => ICMP_UNREACH,
        _ => ICMP_PARAMPROB,
    }
}

fn icmp6_to_icmp_code(icmp6_type: u8, code: u8) -> u8 {
    match icmp6_type {
        ICMP6_ECHO_REQUEST | ICMP6_ECHO_REPLY | ICMP6_TIME_EXCEEDED => code,
        ICMP6_PACKET_TOO_BIG => ICMP_UNREACH_NEEDFRAG,
        ICMP6_DST_UNREACH => match code {
            ICMP6_DST_UNREACH_NOROUTE => ICMP_UNREACH_HOST,
            ICMP6_DST_UNREACH_ADMIN => ICMP_UNREACH_HOST_PROHIB,
            ICMP6_DST_UNREACH_BEYONDSCOPE => ICMP_UNREACH_HOST,
            ICMP6_DST_UNREACH_ADDR => ICMP_UNREACH_HOST,
            ICMP6_DST_UNREACH_NOPORT => ICMP_UNREACH_PORT,
            _ => 0,
        },
        _ => 0,
    }
}

/// Guess the hop count a packet travelled from its remaining hop limit,
/// assuming the sender used one of the common initial values.
pub fn icmp_guess_ttl(ttl: u8) -> u8 {
    if ttl > 128 {
        255 - ttl
    } else if ttl > 64 {
        128 - ttl
    } else if ttl > 32 {
        64 - ttl
    } else {
        32 - ttl
    }
}

/// Translate an ICMP message into ICMPv6 at `pos`.
///
/// `src` and `dst` are the translated IPv6 addresses of the enclosing
/// header, needed for the ICMPv6 pseudo-header.
pub(crate) fn icmp_to_icmp6<'a>(
    out: &mut ClatPacket<'a>,
    pos: Segment,
    icmp: &'a [u8],
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    config: &ClatConfig,
) -> Result<()> {
    if icmp.len() < ICMP_HEADER_LEN {
        return Err(TranslateError::Truncated {
            what: "ICMP header",
            len: icmp.len(),
        });
    }

    let (icmp_type, code) = (icmp[0], icmp[1]);
    let icmp6_type = icmp_to_icmp6_type(icmp_type, code);
    let icmp6_code = icmp_to_icmp6_code(icmp_type, code);
    let payload = &icmp[ICMP_HEADER_LEN..];

    let mut rest = [0u8; 4];
    if pos == Segment::TransportHeader
        && is_icmp_error(icmp_type)
        && icmp6_type != ICMP6_PARAM_PROB
    {
        if icmp6_type == ICMP6_PACKET_TOO_BIG {
            let next_hop_mtu = u16::from_be_bytes([icmp[6], icmp[7]]) as u32;
            let mtu = (next_hop_mtu + HEADER_GROWTH).max(IPV6_MIN_MTU);
            rest = mtu.to_be_bytes();
        }
        ipv4_packet(out, pos.next(), payload, config)?;
    } else if icmp6_type == ICMP6_ECHO_REQUEST || icmp6_type == ICMP6_ECHO_REPLY {
        rest.copy_from_slice(&icmp[4..8]);
        out.set_payload(payload);
    } else {
        return Err(TranslateError::UnsupportedIcmp {
            kind: icmp_type,
            code,
        });
    }

    let header = out.fill_header(pos, ICMP_HEADER_LEN);
    header[0] = icmp6_type;
    header[1] = icmp6_code;
    header[4..8].copy_from_slice(&rest);

    let len = out.length_from(pos) as u32;
    let sum = ipv6_pseudo_header_checksum(src, dst, len, IPPROTO_ICMPV6);
    let checksum = out.checksum_from(sum, pos);
    out.header_mut(pos)[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

/// Translate an ICMPv6 message into ICMP at `pos`.
pub(crate) fn icmp6_to_icmp<'a>(
    out: &mut ClatPacket<'a>,
    pos: Segment,
    icmp6: &'a [u8],
    config: &ClatConfig,
) -> Result<()> {
    if icmp6.len() < ICMP_HEADER_LEN {
        return Err(TranslateError::Truncated {
            what: "ICMPv6 header",
            len: icmp6.len(),
        });
    }

    let (icmp6_type, code) = (icmp6[0], icmp6[1]);
    let icmp_type = icmp6_to_icmp_type(icmp6_type);
    let icmp_code = icmp6_to_icmp_code(icmp6_type, code);
    let payload = &icmp6[ICMP_HEADER_LEN..];

    let mut rest = [0u8; 4];
    if pos == Segment::TransportHeader && icmp6_type < 128 && icmp_type != ICMP_PARAMPROB {
        if icmp6_type == ICMP6_PACKET_TOO_BIG {
            let mtu = u32::from_be_bytes([icmp6[4], icmp6[5], icmp6[6], icmp6[7]]);
            let mtu = u16::try_from(mtu.saturating_sub(HEADER_GROWTH)).unwrap_or(u16::MAX);
            rest[2..4].copy_from_slice(&mtu.to_be_bytes());
        }
        ipv6_packet(out, pos.next(), payload, config)?;
    } else if icmp_type == ICMP_ECHO || icmp_type == ICMP_ECHOREPLY {
        rest.copy_from_slice(&icmp6[4..8]);
        out.set_payload(payload);
    } else {
        return Err(TranslateError::UnsupportedIcmp {
            kind: icmp6_type,
            code,
        });
    }

    let header = out.fill_header(pos, ICMP_HEADER_LEN);
    header[0] = icmp_type;
    header[1] = icmp_code;
    header[4..8].copy_from_slice(&rest);

    let checksum = out.checksum_from(0, pos);
    out.header_mut(pos)[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}
