//! Packet fixtures shared by the translation tests.
//!
//! All fixtures describe the same conversation: the CLAT host at
//! 192.0.0.4 / 2001:db8:0:b11::464 talking to 8.8.8.8 through the
//! well-known NAT64 prefix 64:ff9b::/96.

use mvirt_clat::checksum::checksum;
use mvirt_clat::config::{ClatConfig, DEFAULT_IPV4_LOCAL_PREFIXLEN, MAX_MTU, MTU_DELTA};
use std::net::{Ipv4Addr, Ipv6Addr};

pub const LOCAL_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 4);
pub const REMOTE_V4: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

pub fn local_v6() -> Ipv6Addr {
    "2001:db8:0:b11::464".parse().unwrap()
}

pub fn remote_v6() -> Ipv6Addr {
    "64:ff9b::808:808".parse().unwrap()
}

pub fn test_config() -> ClatConfig {
    ClatConfig {
        ipv4_local_subnet: LOCAL_V4,
        ipv4_local_prefixlen: DEFAULT_IPV4_LOCAL_PREFIXLEN,
        ipv6_local_subnet: local_v6(),
        plat_subnet: "64:ff9b::".parse().unwrap(),
        ipv6_host_id: Ipv6Addr::UNSPECIFIED,
        use_dynamic_iid: true,
        mtu: MAX_MTU,
        ipv4mtu: MAX_MTU - MTU_DELTA,
        uplink_interface: "wlan0".to_string(),
        tun_interface: "v4-wlan0".to_string(),
        mark: None,
        net_id: None,
    }
}

pub const UDP_HEADER_V4: [u8; 8] = [0xc8, 0x8b, 0x00, 0x35, 0x00, 0x15, 0xc7, 0xd0];
pub const UDP_HEADER_V6: [u8; 8] = [0xc8, 0x8b, 0x00, 0x35, 0x00, 0x15, 0x4a, 0xa7];
pub const PING_V4: [u8; 8] = [0x08, 0x00, 0x88, 0xd0, 0xd0, 0x0d, 0x00, 0x03];
pub const PING_V6: [u8; 8] = [0x80, 0x00, 0xc3, 0x42, 0xd0, 0x0d, 0x00, 0x03];
pub const PAYLOAD: [u8; 13] = [
    b'H', b'e', b'l', b'l', b'o', b' ', 0x4e, 0xb8, 0x96, 0xe7, 0x95, 0x8c, 0x00,
];

/// IPv4 header 192.0.0.4 -> 8.8.8.8, TTL 55, DF, 21 bytes of payload.
pub fn ipv4_header(protocol: u8, check: [u8; 2]) -> Vec<u8> {
    vec![
        0x45, 0x00, 0x00, 0x29, 0x00, 0x00, 0x40, 0x00, 0x37, protocol, check[0], check[1], 0xc0,
        0x00, 0x00, 0x04, 0x08, 0x08, 0x08, 0x08,
    ]
}

/// IPv6 header 2001:db8:0:b11::464 -> 64:ff9b::808:808, hop limit 55,
/// 21 bytes of payload.
pub fn ipv6_header(next_header: u8) -> Vec<u8> {
    let mut header = vec![0x60, 0x00, 0x00, 0x00, 0x00, 0x15, next_header, 0x37];
    header.extend_from_slice(&local_v6().octets());
    header.extend_from_slice(&remote_v6().octets());
    header
}

pub fn ipv4_udp() -> Vec<u8> {
    [ipv4_header(17, [0x73, 0xb0]), UDP_HEADER_V4.to_vec(), PAYLOAD.to_vec()].concat()
}

pub fn ipv6_udp() -> Vec<u8> {
    [ipv6_header(17), UDP_HEADER_V6.to_vec(), PAYLOAD.to_vec()].concat()
}

pub fn ipv4_ping() -> Vec<u8> {
    [ipv4_header(1, [0x73, 0xc0]), PING_V4.to_vec(), PAYLOAD.to_vec()].concat()
}

pub fn ipv6_ping() -> Vec<u8> {
    [ipv6_header(58), PING_V6.to_vec(), PAYLOAD.to_vec()].concat()
}

/// A DNS query for ipv4.google.com split into three IPv4 fragments.
pub const IPV4_FRAG1: [u8; 36] = [
    0x45, 0x00, 0x00, 0x24, 0xfe, 0x47, 0x20, 0x00, 0x40, 0x11, 0x8c, 0x6d, 0xc0, 0x00, 0x00,
    0x04, 0x08, 0x08, 0x08, 0x08, 0x14, 0x5d, 0x00, 0x35, 0x00, 0x29, 0x68, 0xbb, 0x50, 0x47,
    0x01, 0x00, 0x00, 0x01, 0x00, 0x00,
];
pub const IPV4_FRAG2: [u8; 36] = [
    0x45, 0x00, 0x00, 0x24, 0xfe, 0x47, 0x20, 0x02, 0x40, 0x11, 0x8c, 0x6b, 0xc0, 0x00, 0x00,
    0x04, 0x08, 0x08, 0x08, 0x08, 0x00, 0x00, 0x00, 0x00, 0x04, 0x69, 0x70, 0x76, 0x34, 0x06,
    0x67, 0x6f, 0x6f, 0x67, 0x6c, 0x65,
];
pub const IPV4_FRAG3: [u8; 29] = [
    0x45, 0x00, 0x00, 0x1d, 0xfe, 0x47, 0x00, 0x04, 0x40, 0x11, 0xac, 0x70, 0xc0, 0x00, 0x00,
    0x04, 0x08, 0x08, 0x08, 0x08, 0x03, 0x63, 0x6f, 0x6d, 0x00, 0x00, 0x01, 0x00, 0x01,
];

/// The same fragments after translation to IPv6.
pub fn ipv6_fragments() -> [Vec<u8>; 3] {
    let header = |payload_len: u8| {
        let mut header = vec![0x60, 0x00, 0x00, 0x00, 0x00, payload_len, 0x2c, 0x40];
        header.extend_from_slice(&local_v6().octets());
        header.extend_from_slice(&remote_v6().octets());
        header
    };
    [
        [
            header(0x18),
            vec![0x11, 0x00, 0x00, 0x01, 0x00, 0x00, 0xfe, 0x47],
            vec![
                0x14, 0x5d, 0x00, 0x35, 0x00, 0x29, 0xeb, 0x91, 0x50, 0x47, 0x01, 0x00, 0x00, 0x01,
                0x00, 0x00,
            ],
        ]
        .concat(),
        [
            header(0x18),
            vec![0x11, 0x00, 0x00, 0x11, 0x00, 0x00, 0xfe, 0x47],
            IPV4_FRAG2[20..].to_vec(),
        ]
        .concat(),
        [
            header(0x11),
            vec![0x11, 0x00, 0x00, 0x20, 0x00, 0x00, 0xfe, 0x47],
            IPV4_FRAG3[20..].to_vec(),
        ]
        .concat(),
    ]
}

pub const IPV4_REASSEMBLED: [u8; 61] = [
    0x45, 0x00, 0x00, 0x3d, 0xfe, 0x47, 0x00, 0x00, 0x40, 0x11, 0xac, 0x54, 0xc0, 0x00, 0x00,
    0x04, 0x08, 0x08, 0x08, 0x08, 0x14, 0x5d, 0x00, 0x35, 0x00, 0x29, 0x68, 0xbb, 0x50, 0x47,
    0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x69, 0x70, 0x76, 0x34,
    0x06, 0x67, 0x6f, 0x6f, 0x67, 0x6c, 0x65, 0x03, 0x63, 0x6f, 0x6d, 0x00, 0x00, 0x01, 0x00,
    0x01,
];

/// Reassemble option-less IPv4 fragments into one unfragmented packet.
pub fn reassemble_ipv4(fragments: &[&[u8]]) -> Vec<u8> {
    let mut packet = fragments[0][..20].to_vec();
    for fragment in fragments {
        let frag_off = u16::from_be_bytes([fragment[6], fragment[7]]);
        let start = 20 + (frag_off & 0x1fff) as usize * 8;
        let body = &fragment[20..];
        let end = start + body.len();
        if packet.len() < end {
            packet.resize(end, 0);
        }
        packet[start..end].copy_from_slice(body);
    }

    let total_len = packet.len() as u16;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[6..8].fill(0);
    packet[10..12].fill(0);
    let check = checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&check.to_be_bytes());
    packet
}

/// Split a translated TUN frame into its packet, checking the `tun_pi` header.
pub fn strip_tun_header(frame: &[u8]) -> &[u8] {
    assert_eq!(&frame[..4], &[0u8, 0, 0x08, 0x00], "bad tun_pi header");
    &frame[4..]
}
