//! One's-complement checksum primitives shared by every translator.
//!
//! Sums are accumulated over big-endian 16-bit words into a `u32` and only
//! folded when a final value is needed, so partial sums over several buffers
//! (pseudo-header, transport header, payload) can simply be added together.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Add `data` to a running 32-bit one's-complement sum.
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
pub fn checksum_add(current: u32, data: &[u8]) -> u32 {
    let mut sum = current;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Fold the carries of a 32-bit sum back into 16 bits.
pub fn checksum_fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    sum as u16
}

/// Fold and complement a running sum into the value stored on the wire.
pub fn checksum_finish(sum: u32) -> u16 {
    !checksum_fold(sum)
}

/// Checksum of a single buffer, e.g. an IPv4 header or an ICMP message.
pub fn checksum(data: &[u8]) -> u16 {
    checksum_finish(checksum_add(0, data))
}

/// Update a checksum after the pseudo-header it covers changed.
///
/// `old_hdr_sum` and `new_hdr_sum` are unfolded sums of the old and new
/// pseudo-headers. The payload is never rescanned.
pub fn checksum_adjust(checksum: u16, old_hdr_sum: u32, new_hdr_sum: u32) -> u16 {
    let folded_sum = checksum_fold(!checksum as u32 + new_hdr_sum);
    let folded_old = checksum_fold(old_hdr_sum);
    if folded_sum > folded_old {
        !(folded_sum - folded_old)
    } else {
        !(folded_sum.wrapping_sub(folded_old).wrapping_sub(1))
    }
}

/// Unfolded sum of the IPv4 pseudo-header (RFC 768 / RFC 793).
pub fn ipv4_pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum += protocol as u32;
    sum + len as u32
}

/// Unfolded sum of the IPv6 pseudo-header (RFC 8200 section 8.1).
pub fn ipv6_pseudo_header_checksum(
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    len: u32,
    next_header: u8,
) -> u32 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum = checksum_add(sum, &len.to_be_bytes());
    sum + next_header as u32
}
