// Address and byte-string utilities.
//
// Conversions between wire representations (network-order byte slices) and
// the textual forms used in device profiles: MAC addresses, IPv4/IPv6
// addresses, hex payload strings. Also carries the SHA-256 helper used by
// the verdict observer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sha2::{Digest, Sha256};

/// Length of a MAC address, in bytes.
pub const MAC_ADDR_LENGTH: usize = 6;

/// Length of an IPv6 address, in bytes.
pub const IPV6_ADDR_LENGTH: usize = 16;

/// Convert a 6-byte MAC address to its `aa:bb:cc:dd:ee:ff` string form.
pub fn mac_to_str(mac: &[u8; MAC_ADDR_LENGTH]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse a `aa:bb:cc:dd:ee:ff` string into a 6-byte MAC address.
///
/// Returns `None` (and logs) if the string is not six colon-separated
/// hex octets.
pub fn mac_from_str(s: &str) -> Option<[u8; MAC_ADDR_LENGTH]> {
    let mut mac = [0u8; MAC_ADDR_LENGTH];
    let mut count = 0;
    for (i, part) in s.split(':').enumerate() {
        if i >= MAC_ADDR_LENGTH {
            count = 0;
            break;
        }
        match u8::from_str_radix(part, 16) {
            Ok(b) => mac[i] = b,
            Err(_) => {
                count = 0;
                break;
            }
        }
        count = i + 1;
    }
    if count != MAC_ADDR_LENGTH {
        log::warn!("cannot convert MAC address {s:?} to bytes");
        return None;
    }
    Some(mac)
}

/// Read an IPv4 address from a 4-byte network-order buffer.
///
/// Returns `None` if the slice is too short.
pub fn ipv4_from_net(buf: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Read an IPv6 address from a 16-byte network-order buffer.
///
/// Returns `None` if the slice is too short.
pub fn ipv6_from_net(buf: &[u8]) -> Option<Ipv6Addr> {
    let octets: [u8; IPV6_ADDR_LENGTH] = buf.get(..IPV6_ADDR_LENGTH)?.try_into().ok()?;
    Some(Ipv6Addr::from(octets))
}

/// Parse an IPv4 or IPv6 address from its textual form.
///
/// Wrapper around the std parser with the crate's non-fatal error channel:
/// bad input logs a warning and yields `None`.
pub fn ip_from_str(s: &str) -> Option<IpAddr> {
    match s.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            log::warn!("cannot parse IP address {s:?}");
            None
        }
    }
}

/// Convert a hex string (two hex digits per byte, no separators) to bytes.
///
/// Returns `None` (and logs) on odd length or non-hex characters.
pub fn hex_to_bytes(s: &str) -> Option<Vec<u8>> {
    match hex::decode(s) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::warn!("cannot decode hex payload: {e}");
            None
        }
    }
}

/// SHA-256 digest of an arbitrary buffer.
pub fn sha256(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Render a SHA-256 digest as lowercase hex.
pub fn sha256_to_str(hash: &[u8; 32]) -> String {
    hex::encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trip() {
        let mac = [0x78, 0x8b, 0x2a, 0xb2, 0x20, 0xea];
        let s = mac_to_str(&mac);
        assert_eq!(s, "78:8b:2a:b2:20:ea");
        assert_eq!(mac_from_str(&s), Some(mac));
    }

    #[test]
    fn mac_from_str_rejects_garbage() {
        assert_eq!(mac_from_str("not-a-mac"), None);
        assert_eq!(mac_from_str("78:8b:2a:b2:20"), None);
        assert_eq!(mac_from_str("78:8b:2a:b2:20:ea:ff"), None);
        assert_eq!(mac_from_str("78:8b:2a:b2:20:zz"), None);
    }

    #[test]
    fn ipv4_net_round_trip() {
        let buf = [192, 168, 1, 161];
        let addr = ipv4_from_net(&buf).unwrap();
        assert_eq!(addr.to_string(), "192.168.1.161");
        assert_eq!(addr.octets(), buf);
    }

    #[test]
    fn ipv4_from_net_too_short() {
        assert_eq!(ipv4_from_net(&[10, 0, 0]), None);
    }

    #[test]
    fn ipv6_net_round_trip() {
        let mut buf = [0u8; 16];
        buf[0] = 0xfd;
        buf[1] = 0xdd;
        buf[15] = 0x01;
        let addr = ipv6_from_net(&buf).unwrap();
        assert_eq!(addr.to_string(), "fddd::1");
        assert_eq!(addr.octets(), buf);
    }

    #[test]
    fn ip_str_round_trip_canonical() {
        for s in ["20.47.97.231", "fe80::db22:fbec:a6b4:44fe", "ff02::1"] {
            let ip = ip_from_str(s).unwrap();
            assert_eq!(ip.to_string(), s);
        }
        assert_eq!(ip_from_str("500.1.2.3"), None);
    }

    #[test]
    fn hex_to_bytes_basic() {
        let bytes = hex_to_bytes("63825363").unwrap();
        assert_eq!(bytes, vec![0x63, 0x82, 0x53, 0x63]);
        assert_eq!(bytes.len(), "63825363".len() / 2);
    }

    #[test]
    fn hex_to_bytes_rejects_bad_input() {
        assert_eq!(hex_to_bytes("abc"), None); // odd length
        assert_eq!(hex_to_bytes("zz"), None); // not hex
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_to_str(&sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
