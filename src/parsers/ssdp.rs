// SSDP message parser.
//
// SSDP is HTTP-like over UDP multicast 239.255.255.250:1900. Only the
// method matters to the profiles; requests are told apart from responses
// by the multicast destination.

use std::net::Ipv4Addr;

/// The SSDP multicast group.
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// SSDP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdpMethod {
    MSearch,
    Notify,
    Unknown,
}

impl std::fmt::Display for SsdpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MSearch => "M-SEARCH",
            Self::Notify => "NOTIFY",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A classified SSDP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsdpMessage {
    pub is_request: bool,
    pub method: SsdpMethod,
}

/// Parse an SSDP message from a UDP payload.
///
/// The first character decides the method; the message is a request iff
/// the IPv4 destination is the SSDP multicast group.
pub fn parse(data: &[u8], dst_addr: Ipv4Addr) -> SsdpMessage {
    let method = match data.first() {
        Some(b'M') => SsdpMethod::MSearch,
        Some(b'N') => SsdpMethod::Notify,
        _ => SsdpMethod::Unknown,
    };
    SsdpMessage {
        is_request: dst_addr == SSDP_MULTICAST_ADDR,
        method,
    }
}

impl std::fmt::Display for SsdpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = if self.is_request { "request" } else { "response" };
        write!(f, "SSDP {direction} {}", self.method)
    }
}
