// Layer-3/4 header parsing.
//
// Length and field extraction over raw packet buffers positioned at the
// start of the network-layer header. NFQUEUE delivers packets from the IP
// header onward, so there is no link-layer framing to strip here.
// Supported: IPv4, IPv6 (fixed header), TCP, UDP.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::addr;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

// IPv6
const IPV6_HLEN: usize = 40;
const IPV6_NEXT_HDR_OFFSET: usize = 6;
const IPV6_SRC_OFFSET: usize = 8;
const IPV6_DST_OFFSET: usize = 24;

// L4
const UDP_HLEN: usize = 8;
const TCP_DATA_OFFSET_BYTE: usize = 12;
const L4_DST_PORT_OFFSET: usize = 2;

/// IP protocol numbers for the transport layers this engine inspects.
pub const PROTO_TCP: u8 = 6;
/// See [`PROTO_TCP`].
pub const PROTO_UDP: u8 = 17;

/// IPv4 header length in bytes: low nibble of byte 0, in 32-bit words.
pub fn ipv4_header_length(data: &[u8]) -> usize {
    match data.first() {
        Some(b) => ((b & 0x0f) as usize) * 4,
        None => 0,
    }
}

/// IPv6 header length: always the fixed 40 bytes (extension chains are out
/// of scope; the kernel ruleset never queues them to this engine).
pub fn ipv6_header_length() -> usize {
    IPV6_HLEN
}

/// TCP header length in bytes: high nibble of byte 12, in 32-bit words.
pub fn tcp_header_length(data: &[u8]) -> usize {
    match data.get(TCP_DATA_OFFSET_BYTE) {
        Some(b) => ((b >> 4) as usize) * 4,
        None => 0,
    }
}

/// UDP header length: always 8 bytes.
pub fn udp_header_length() -> usize {
    UDP_HLEN
}

/// Length of the UDP payload: the datagram length at offset 4 of the UDP
/// header, minus the 8 header bytes.
pub fn udp_payload_length(l4: &[u8]) -> Option<u16> {
    let len = u16::from_be_bytes([*l4.get(4)?, *l4.get(5)?]);
    Some(len.saturating_sub(UDP_HLEN as u16))
}

/// IP version from the first nibble of the layer-3 header.
pub fn ip_version(data: &[u8]) -> u8 {
    match data.first() {
        Some(b) => b >> 4,
        None => 0,
    }
}

/// Length of the layer-3 header (IPv4 or IPv6); 0 for unknown versions.
pub fn l3_header_length(data: &[u8]) -> usize {
    match ip_version(data) {
        4 => ipv4_header_length(data),
        6 => ipv6_header_length(),
        _ => 0,
    }
}

/// IP protocol number carried by the layer-3 header (byte 9 for IPv4,
/// byte 6 for IPv6); 0 for unknown versions.
pub fn ip_protocol(data: &[u8]) -> u8 {
    let offset = match ip_version(data) {
        4 => IPV4_PROTO_OFFSET,
        6 => IPV6_NEXT_HDR_OFFSET,
        _ => return 0,
    };
    data.get(offset).copied().unwrap_or(0)
}

/// Combined length of the layer-3 and layer-4 headers.
///
/// Unknown IP versions and transport protocols other than TCP/UDP
/// contribute zero, so callers must check [`ip_protocol`] before treating
/// the result as the application payload offset.
pub fn headers_length(data: &[u8]) -> usize {
    let mut length = l3_header_length(data);
    if length == 0 {
        return 0;
    }
    match ip_protocol(data) {
        PROTO_TCP => length += tcp_header_length(&data[length.min(data.len())..]),
        PROTO_UDP => length += udp_header_length(),
        _ => {}
    }
    length
}

/// Destination port at offset 2 of a TCP or UDP header.
pub fn dst_port(l4: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([
        *l4.get(L4_DST_PORT_OFFSET)?,
        *l4.get(L4_DST_PORT_OFFSET + 1)?,
    ]))
}

/// Source IPv4 address, bytes 12-15 of the IPv4 header.
pub fn ipv4_src_addr(data: &[u8]) -> Option<Ipv4Addr> {
    addr::ipv4_from_net(data.get(IPV4_SRC_OFFSET..)?)
}

/// Destination IPv4 address, bytes 16-19 of the IPv4 header.
pub fn ipv4_dst_addr(data: &[u8]) -> Option<Ipv4Addr> {
    addr::ipv4_from_net(data.get(IPV4_DST_OFFSET..)?)
}

/// Source IPv6 address, bytes 8-23 of the IPv6 header.
pub fn ipv6_src_addr(data: &[u8]) -> Option<Ipv6Addr> {
    addr::ipv6_from_net(data.get(IPV6_SRC_OFFSET..)?)
}

/// Destination IPv6 address, bytes 24-39 of the IPv6 header.
pub fn ipv6_dst_addr(data: &[u8]) -> Option<Ipv6Addr> {
    addr::ipv6_from_net(data.get(IPV6_DST_OFFSET..)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::hex_to_bytes;

    // TCP SYN from 192.168.1.150 to 108.138.225.17, with TCP options
    // (data offset = 10 words).
    const TCP_SYN: &str = "4500003cbcd2400040066e0fc0a801966c8ae111c67f005004f77abb00000000a002ffff2b380000020405b40402080a0003c6690000000001030306";

    // IPv6 + UDP DNS query to api.smartthings.com.
    const IPV6_UDP: &str = "6002ec1b002d1140fddded18f05b0000d8a3adc0f68fe5cffddded18f05b00000000000000000001b0f20035002d5388ac4a01000001000000000000036170690b736d6172747468696e677303636f6d00001c0001";

    #[test]
    fn ipv4_tcp_header_lengths() {
        let pkt = hex_to_bytes(TCP_SYN).unwrap();
        assert_eq!(ip_version(&pkt), 4);
        assert_eq!(ipv4_header_length(&pkt), 20);
        assert_eq!(ip_protocol(&pkt), PROTO_TCP);
        // 20-byte IPv4 header + 40-byte TCP header (10 words).
        assert_eq!(tcp_header_length(&pkt[20..]), 40);
        assert_eq!(headers_length(&pkt), 60);
    }

    #[test]
    fn ipv4_addresses() {
        let pkt = hex_to_bytes(TCP_SYN).unwrap();
        assert_eq!(ipv4_src_addr(&pkt).unwrap().to_string(), "192.168.1.150");
        assert_eq!(ipv4_dst_addr(&pkt).unwrap().to_string(), "108.138.225.17");
    }

    #[test]
    fn ipv6_udp_header_lengths() {
        let pkt = hex_to_bytes(IPV6_UDP).unwrap();
        assert_eq!(ip_version(&pkt), 6);
        assert_eq!(l3_header_length(&pkt), 40);
        assert_eq!(ip_protocol(&pkt), PROTO_UDP);
        assert_eq!(headers_length(&pkt), 48);
    }

    #[test]
    fn ipv6_addresses() {
        let pkt = hex_to_bytes(IPV6_UDP).unwrap();
        assert_eq!(
            ipv6_src_addr(&pkt).unwrap().to_string(),
            "fddd:ed18:f05b:0:d8a3:adc0:f68f:e5cf"
        );
        assert_eq!(ipv6_dst_addr(&pkt).unwrap().to_string(), "fddd:ed18:f05b::1");
    }

    #[test]
    fn udp_fields() {
        let pkt = hex_to_bytes(IPV6_UDP).unwrap();
        let l4 = &pkt[40..];
        assert_eq!(dst_port(l4), Some(53));
        // Datagram length 0x002d = 45, minus the 8 header bytes.
        assert_eq!(udp_payload_length(l4), Some(37));
    }

    #[test]
    fn unknown_version_contributes_zero() {
        let pkt = [0x00u8; 40];
        assert_eq!(l3_header_length(&pkt), 0);
        assert_eq!(headers_length(&pkt), 0);
        assert_eq!(ip_protocol(&pkt), 0);
    }

    #[test]
    fn truncated_buffers() {
        assert_eq!(ipv4_header_length(&[]), 0);
        assert_eq!(tcp_header_length(&[0u8; 5]), 0);
        assert_eq!(dst_port(&[0x00, 0x35]), None);
        assert_eq!(ipv4_src_addr(&[0u8; 14]), None);
        assert_eq!(ipv6_dst_addr(&[0u8; 30]), None);
    }
}
