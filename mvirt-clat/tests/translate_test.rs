//! End-to-end translation tests against captured packets.
//!
//! Every packet is translated through the public entry points and compared
//! byte for byte with the expected result. ICMP errors are additionally
//! checked with smoltcp's parsers, which validate lengths and checksums
//! independently of the translator.

mod common;

use common::*;
use mvirt_clat::checksum::{
    checksum, checksum_add, checksum_adjust, checksum_finish, ipv4_pseudo_header_checksum,
    ipv6_pseudo_header_checksum,
};
use mvirt_clat::config::generate_checksum_neutral_iid;
use mvirt_clat::translate::{TranslateError, translate_ipv4_to_ipv6, translate_ipv6_to_ipv4};
use rand::SeedableRng;
use rand::rngs::StdRng;
use smoltcp::wire::{
    Icmpv4Message, Icmpv4Packet, IpAddress, IpProtocol, Ipv4Packet, Ipv6Packet, UdpPacket,
};
use std::net::{Ipv4Addr, Ipv6Addr};

fn to_ipv6(packet: &[u8]) -> Vec<u8> {
    translate_ipv4_to_ipv6(&test_config(), packet).unwrap().to_vec()
}

fn to_ipv4(packet: &[u8]) -> Vec<u8> {
    let frame = translate_ipv6_to_ipv4(&test_config(), packet).unwrap().to_vec();
    strip_tun_header(&frame).to_vec()
}

fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, icmp: &[u8]) -> u16 {
    let sum = ipv6_pseudo_header_checksum(src, dst, icmp.len() as u32, 58);
    checksum_finish(checksum_add(sum, icmp))
}

/// ICMP error from 8.8.8.8 to the CLAT host quoting `quoted`.
fn ipv4_icmp_error(kind: u8, code: u8, rest: [u8; 4], quoted: &[u8]) -> Vec<u8> {
    let mut icmp = vec![kind, code, 0, 0];
    icmp.extend_from_slice(&rest);
    icmp.extend_from_slice(quoted);
    let check = checksum(&icmp);
    icmp[2..4].copy_from_slice(&check.to_be_bytes());

    let total_len = (20 + icmp.len()) as u16;
    let mut packet = vec![0x45, 0x00, 0, 0, 0x00, 0x00, 0x00, 0x00, 50, 1, 0, 0];
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&REMOTE_V4.octets());
    packet.extend_from_slice(&LOCAL_V4.octets());
    let check = checksum(&packet);
    packet[10..12].copy_from_slice(&check.to_be_bytes());
    packet.extend_from_slice(&icmp);
    packet
}

/// ICMPv6 error from `src` to the CLAT host quoting `quoted`.
fn ipv6_icmp_error(
    src: Ipv6Addr,
    hop_limit: u8,
    kind: u8,
    code: u8,
    rest: [u8; 4],
    quoted: &[u8],
) -> Vec<u8> {
    let mut icmp = vec![kind, code, 0, 0];
    icmp.extend_from_slice(&rest);
    icmp.extend_from_slice(quoted);
    let check = icmpv6_checksum(&src, &local_v6(), &icmp);
    icmp[2..4].copy_from_slice(&check.to_be_bytes());

    let mut packet = vec![0x60, 0, 0, 0, 0, 0, 58, hop_limit];
    packet[4..6].copy_from_slice(&(icmp.len() as u16).to_be_bytes());
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&local_v6().octets());
    packet.extend_from_slice(&icmp);
    packet
}

#[test]
fn test_udp_ipv4_to_ipv6() {
    assert_eq!(to_ipv6(&ipv4_udp()), ipv6_udp());
}

#[test]
fn test_udp_ipv6_to_ipv4() {
    assert_eq!(to_ipv4(&ipv6_udp()), ipv4_udp());
}

#[test]
fn test_ping_ipv4_to_ipv6() {
    assert_eq!(to_ipv6(&ipv4_ping()), ipv6_ping());
}

#[test]
fn test_ping_ipv6_to_ipv4() {
    assert_eq!(to_ipv4(&ipv6_ping()), ipv4_ping());
}

#[test]
fn test_trailing_bytes_are_ignored() {
    let mut padded = ipv4_udp();
    padded.extend_from_slice(&[0xaa; 6]);
    assert_eq!(to_ipv6(&padded), ipv6_udp());

    let mut padded = ipv6_udp();
    padded.extend_from_slice(&[0xaa; 6]);
    assert_eq!(to_ipv4(&padded), ipv4_udp());
}

#[test]
fn test_fragments_ipv4_to_ipv6() {
    let fragments: [&[u8]; 3] = [&IPV4_FRAG1, &IPV4_FRAG2, &IPV4_FRAG3];
    for (i, (v4, v6)) in fragments.iter().zip(ipv6_fragments()).enumerate() {
        assert_eq!(to_ipv6(v4), v6, "fragment {}", i + 1);
    }
}

#[test]
fn test_fragments_ipv6_to_ipv4() {
    let fragments: [&[u8]; 3] = [&IPV4_FRAG1, &IPV4_FRAG2, &IPV4_FRAG3];
    for (i, (v4, v6)) in fragments.iter().zip(ipv6_fragments()).enumerate() {
        assert_eq!(to_ipv4(&v6), v4.to_vec(), "fragment {}", i + 1);
    }
}

#[test]
fn test_translated_fragments_reassemble() {
    let reassembled = reassemble_ipv4(&[&IPV4_FRAG1, &IPV4_FRAG2, &IPV4_FRAG3]);
    assert_eq!(reassembled, IPV4_REASSEMBLED);

    let translated: Vec<Vec<u8>> = ipv6_fragments().iter().map(|f| to_ipv4(f)).collect();
    let refs: Vec<&[u8]> = translated.iter().map(Vec::as_slice).collect();
    assert_eq!(reassemble_ipv4(&refs), IPV4_REASSEMBLED);

    // The whole datagram translates to the same UDP header as its first fragment.
    let whole = to_ipv6(&IPV4_REASSEMBLED);
    let first = &ipv6_fragments()[0];
    assert_eq!(&whole[40..48], &first[48..56]);

    let ip = Ipv4Packet::new_checked(&IPV4_REASSEMBLED[..]).unwrap();
    let udp = UdpPacket::new_checked(ip.payload()).unwrap();
    assert!(udp.verify_checksum(&IpAddress::Ipv4(LOCAL_V4), &IpAddress::Ipv4(REMOTE_V4)));
}

#[test]
fn test_dns_query_checksum_adjusted() {
    let payload = b"Hello \xe4\xba\xba\xe9\x96\x93\x00";
    let udp_len = (8 + payload.len()) as u16;
    let mut udp = vec![0xc8, 0x8b, 0x00, 0x35];
    udp.extend_from_slice(&udp_len.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let v4_sum = ipv4_pseudo_header_checksum(LOCAL_V4, REMOTE_V4, 17, udp_len);
    let orig = checksum_finish(checksum_add(v4_sum, &udp));
    udp[6..8].copy_from_slice(&orig.to_be_bytes());

    let mut v4 = vec![0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 64, 17, 0, 0];
    v4[2..4].copy_from_slice(&(20 + udp_len).to_be_bytes());
    v4.extend_from_slice(&LOCAL_V4.octets());
    v4.extend_from_slice(&REMOTE_V4.octets());
    let check = checksum(&v4);
    v4[10..12].copy_from_slice(&check.to_be_bytes());
    v4.extend_from_slice(&udp);

    let v6 = to_ipv6(&v4);
    let ip = Ipv6Packet::new_checked(&v6[..]).unwrap();
    assert_eq!(ip.src_addr(), "2001:db8:0:b11::464".parse::<Ipv6Addr>().unwrap());
    assert_eq!(ip.dst_addr(), "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap());
    assert_eq!(ip.next_header(), IpProtocol::Udp);

    let v6_sum = ipv6_pseudo_header_checksum(&local_v6(), &remote_v6(), udp_len as u32, 17);
    let translated = u16::from_be_bytes([v6[46], v6[47]]);
    assert_eq!(translated, checksum_adjust(orig, v4_sum, v6_sum));
    assert_eq!(ipv6_transport_checksum(&v6, 17), 0);
    assert_eq!(&v6[48..], payload);
}

#[test]
fn test_checksum_neutral_address_keeps_checksum() {
    let interface: Ipv6Addr = "2001:db8:1:2:f076:ae99:124e:aa54".parse().unwrap();
    let mut config = test_config();
    let mut rng = StdRng::seed_from_u64(0x464);

    for _ in 0..16 {
        config.ipv6_local_subnet = generate_checksum_neutral_iid(
            &mut rng,
            interface,
            config.ipv4_local_subnet,
            config.plat_subnet,
        );
        assert_eq!(&config.ipv6_local_subnet.octets()[..8], &interface.octets()[..8]);

        let v4 = ipv4_udp();
        let v6 = translate_ipv4_to_ipv6(&config, &v4).unwrap().to_vec();
        assert_eq!(&v6[8..24], &config.ipv6_local_subnet.octets());
        assert_eq!(&v6[40..48], &UDP_HEADER_V4);

        let frame = translate_ipv6_to_ipv4(&config, &v6).unwrap().to_vec();
        assert_eq!(strip_tun_header(&frame), v4.as_slice());
    }
}

#[test]
fn test_tcp_round_trip() {
    let mut tcp = vec![
        0x9c, 0x40, 0x01, 0xbb, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x60, 0x02, 0xff,
        0xff, 0x00, 0x00, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4,
    ];
    let mut sum = checksum_add(0, &LOCAL_V4.octets());
    sum = checksum_add(sum, &REMOTE_V4.octets());
    sum += 6 + tcp.len() as u32;
    let check = checksum_finish(checksum_add(sum, &tcp));
    tcp[16..18].copy_from_slice(&check.to_be_bytes());

    let mut v4 = vec![0x45, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x40, 0x00, 64, 6, 0, 0];
    v4.extend_from_slice(&LOCAL_V4.octets());
    v4.extend_from_slice(&REMOTE_V4.octets());
    let check = checksum(&v4);
    v4[10..12].copy_from_slice(&check.to_be_bytes());
    v4.extend_from_slice(&tcp);

    let v6 = to_ipv6(&v4);
    assert_eq!(v6.len(), 40 + 24);
    assert_eq!(v6[6], 6);
    assert_eq!(ipv6_transport_checksum(&v6, 6), 0);

    assert_eq!(to_ipv4(&v6), v4);
}

/// Checksum over an IPv6 packet's transport payload; zero when valid.
fn ipv6_transport_checksum(packet: &[u8], next_header: u8) -> u16 {
    let ip = Ipv6Packet::new_checked(packet).unwrap();
    let src = ip.src_addr();
    let dst = ip.dst_addr();
    let payload = ip.payload();
    let sum = ipv6_pseudo_header_checksum(&src, &dst, payload.len() as u32, next_header);
    checksum_finish(checksum_add(sum, payload))
}

#[test]
fn test_icmp_port_unreachable_ipv4_to_ipv6() {
    let packet = ipv4_icmp_error(3, 3, [0; 4], &ipv4_udp());
    let v6 = to_ipv6(&packet);

    let ip = Ipv6Packet::new_checked(&v6[..]).unwrap();
    assert_eq!(ip.next_header(), IpProtocol::Icmpv6);
    assert_eq!(ip.hop_limit(), 50);
    assert_eq!(ip.src_addr(), remote_v6());
    assert_eq!(ip.dst_addr(), local_v6());
    assert_eq!(ip.payload_len() as usize, 8 + 61);

    let icmp = ip.payload();
    assert_eq!(&icmp[..2], &[1u8, 4]);
    assert_eq!(ipv6_transport_checksum(&v6, 58), 0);
    assert_eq!(&icmp[8..], ipv6_udp().as_slice());
}

#[test]
fn test_icmp_port_unreachable_ipv6_to_ipv4() {
    let packet = ipv6_icmp_error(remote_v6(), 64, 1, 4, [0; 4], &ipv6_udp());
    let v4 = to_ipv4(&packet);

    let ip = Ipv4Packet::new_checked(&v4[..]).unwrap();
    assert!(ip.verify_checksum());
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.src_addr(), REMOTE_V4);
    assert_eq!(ip.dst_addr(), LOCAL_V4);
    assert_eq!(ip.total_len() as usize, 20 + 8 + 41);

    let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
    assert!(icmp.verify_checksum());
    assert_eq!(icmp.msg_type(), Icmpv4Message::DstUnreachable);
    assert_eq!(icmp.msg_code(), 3);

    let quoted = &ip.payload()[8..];
    assert_eq!(quoted, ipv4_udp().as_slice());
    let inner = Ipv4Packet::new_checked(quoted).unwrap();
    assert!(inner.verify_checksum());
    let udp = UdpPacket::new_checked(inner.payload()).unwrap();
    assert!(udp.verify_checksum(&IpAddress::Ipv4(LOCAL_V4), &IpAddress::Ipv4(REMOTE_V4)));
}

#[test]
fn test_packet_too_big_ipv6_to_ipv4() {
    let packet = ipv6_icmp_error(remote_v6(), 64, 2, 0, 1400u32.to_be_bytes(), &ipv6_udp());
    let v4 = to_ipv4(&packet);

    let ip = Ipv4Packet::new_checked(&v4[..]).unwrap();
    let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
    assert!(icmp.verify_checksum());
    assert_eq!(icmp.msg_type(), Icmpv4Message::DstUnreachable);
    assert_eq!(icmp.msg_code(), 4);
    assert_eq!(&ip.payload()[4..8], &[0u8, 0, 0x05, 0x64]); // 1380
}

#[test]
fn test_fragmentation_needed_ipv4_to_ipv6() {
    for (next_hop_mtu, expected) in [(1400u16, 1420u32), (576, 1280)] {
        let mut rest = [0u8; 4];
        rest[2..4].copy_from_slice(&next_hop_mtu.to_be_bytes());
        let packet = ipv4_icmp_error(3, 4, rest, &ipv4_udp());
        let v6 = to_ipv6(&packet);

        let icmp = &v6[40..];
        assert_eq!(&icmp[..2], &[2u8, 0]);
        assert_eq!(&icmp[4..8], &expected.to_be_bytes());
        assert_eq!(ipv6_transport_checksum(&v6, 58), 0);
    }
}

#[test]
fn test_time_exceeded_from_router() {
    let router: Ipv6Addr = "2001:db8:ffff::1".parse().unwrap();
    let packet = ipv6_icmp_error(router, 250, 3, 0, [0; 4], &ipv6_udp());
    let v4 = to_ipv4(&packet);

    let ip = Ipv4Packet::new_checked(&v4[..]).unwrap();
    assert!(ip.verify_checksum());
    assert_eq!(ip.src_addr(), Ipv4Addr::new(255, 0, 0, 5));
    assert_eq!(ip.hop_limit(), 250);

    let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
    assert!(icmp.verify_checksum());
    assert_eq!(icmp.msg_type(), Icmpv4Message::TimeExceeded);
    assert_eq!(&ip.payload()[8..], ipv4_udp().as_slice());
}

#[test]
fn test_untranslatable_packets_dropped() {
    let config = test_config();

    let mut multicast = ipv6_udp();
    let group: Ipv6Addr = "ff02::1:2".parse().unwrap();
    multicast[24..40].copy_from_slice(&group.octets());
    assert!(matches!(
        translate_ipv6_to_ipv4(&config, &multicast),
        Err(TranslateError::Multicast(addr)) if addr == group
    ));

    let mut foreign = ipv6_udp();
    let stranger: Ipv6Addr = "2001:db8:ffff::1".parse().unwrap();
    foreign[8..24].copy_from_slice(&stranger.octets());
    assert!(matches!(
        translate_ipv6_to_ipv4(&config, &foreign),
        Err(TranslateError::ForeignAddress { .. })
    ));

    // Hop-by-hop options and routing headers are not walked.
    for next_header in [0u8, 43] {
        let mut extension = ipv6_udp();
        extension[6] = next_header;
        assert!(matches!(
            translate_ipv6_to_ipv4(&config, &extension),
            Err(TranslateError::UnsupportedProtocol(n)) if n == next_header
        ));
    }

    let mut sctp = ipv4_udp();
    sctp[9] = 132;
    assert!(matches!(
        translate_ipv4_to_ipv6(&config, &sctp),
        Err(TranslateError::UnsupportedProtocol(132))
    ));

    assert!(matches!(
        translate_ipv4_to_ipv6(&config, &ipv4_udp()[..12]),
        Err(TranslateError::Truncated { len: 12, .. })
    ));
    assert!(matches!(
        translate_ipv6_to_ipv4(&config, &ipv6_udp()[..39]),
        Err(TranslateError::Truncated { len: 39, .. })
    ));

    // Router advertisements and other ICMPv6-only messages have no IPv4 form.
    let ra = ipv6_icmp_error(remote_v6(), 255, 134, 0, [0; 4], &[]);
    assert!(matches!(
        translate_ipv6_to_ipv4(&config, &ra),
        Err(TranslateError::UnsupportedIcmp { kind: 134, code: 0 })
    ));
}
