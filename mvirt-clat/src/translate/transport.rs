//! TCP, UDP and opaque pass-through translation.
//!
//! Only the checksum changes: payload bytes are identical in both families,
//! so the old checksum is adjusted by the pseudo-header delta.

use super::{ClatPacket, Result, Segment, TranslateError};
use crate::checksum::checksum_adjust;

const UDP_HEADER_LEN: usize = 8;
const TCP_HEADER_LEN: usize = 20;

/// Forward `data` untouched behind the translated IP header.
pub(crate) fn generic_packet<'a>(out: &mut ClatPacket<'a>, pos: Segment, data: &'a [u8]) {
    out.clear(pos);
    out.set_payload(data);
}

pub(crate) fn udp_packet<'a>(
    out: &mut ClatPacket<'a>,
    pos: Segment,
    udp: &'a [u8],
    old_sum: u32,
    new_sum: u32,
    fragmented: bool,
) -> Result<()> {
    if udp.len() < UDP_HEADER_LEN {
        return Err(TranslateError::Truncated {
            what: "UDP header",
            len: udp.len(),
        });
    }

    let (header, payload) = udp.split_at(UDP_HEADER_LEN);
    let old_check = u16::from_be_bytes([header[6], header[7]]);
    // A missing checksum can only be computed over the whole datagram.
    if old_check == 0 && fragmented {
        return Err(TranslateError::FragmentWithoutChecksum);
    }
    out.fill_header(pos, UDP_HEADER_LEN).copy_from_slice(header);
    out.set_payload(payload);

    let mut check = if old_check != 0 {
        checksum_adjust(old_check, old_sum, new_sum)
    } else {
        // IPv4 UDP may omit the checksum; IPv6 requires one.
        out.header_mut(pos)[6..8].fill(0);
        out.checksum_from(new_sum, pos)
    };
    if check == 0 {
        check = 0xffff;
    }

    out.header_mut(pos)[6..8].copy_from_slice(&check.to_be_bytes());
    Ok(())
}

pub(crate) fn tcp_packet<'a>(
    out: &mut ClatPacket<'a>,
    pos: Segment,
    tcp: &'a [u8],
    old_sum: u32,
    new_sum: u32,
) -> Result<()> {
    if tcp.len() < TCP_HEADER_LEN {
        return Err(TranslateError::Truncated {
            what: "TCP header",
            len: tcp.len(),
        });
    }

    let header_len = (tcp[12] >> 4) as usize * 4;
    if header_len < TCP_HEADER_LEN || header_len > tcp.len() {
        return Err(TranslateError::InvalidHeaderLength {
            what: "TCP",
            len: header_len,
        });
    }

    let (header, payload) = tcp.split_at(header_len);
    let old_check = u16::from_be_bytes([header[16], header[17]]);
    let check = checksum_adjust(old_check, old_sum, new_sum);

    let buf = out.fill_header(pos, header_len);
    buf.copy_from_slice(header);
    buf[16..18].copy_from_slice(&check.to_be_bytes());
    out.set_payload(payload);
    Ok(())
}
