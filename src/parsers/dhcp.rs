// DHCP message parser — RFC 2131/2132, BOOTP-compatible framing.
//
// Fixed 236-byte header followed by an options area that must open with
// the magic cookie 0x63825363. Smart plugs and cameras renew leases on
// predictable schedules, so the boot exchange is one of the interactions
// profiles pin down.

use std::net::Ipv4Addr;

use crate::addr;

/// Length of the fixed (pre-options) DHCP header.
pub const HEADER_LEN: usize = 236;

/// Magic cookie opening the options area.
pub const MAGIC_COOKIE: u32 = 0x63825363;

/// Initial allocation for the parsed options list; doubles as needed.
const INITIAL_OPTION_CAPACITY: usize = 20;

const OPTION_PAD: u8 = 0;
const OPTION_MESSAGE_TYPE: u8 = 53;
const OPTION_END: u8 = 255;

/// BOOTP opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpOpcode {
    BootRequest,
    BootReply,
    Other(u8),
}

impl DhcpOpcode {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::BootRequest,
            2 => Self::BootReply,
            n => Self::Other(n),
        }
    }
}

/// DHCP message type (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
    Other(u8),
}

impl DhcpMessageType {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            n => Self::Other(n),
        }
    }
}

/// A single DHCP option: code plus value bytes (Pad and End excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub value: Vec<u8>,
}

impl DhcpOption {
    pub fn length(&self) -> u8 {
        self.value.len() as u8
    }
}

/// A parsed DHCP message.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
    pub op: DhcpOpcode,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
    /// Option 53, denormalized for the common policy check.
    pub message_type: Option<DhcpMessageType>,
}

impl DhcpMessage {
    /// The client hardware address trimmed to `hlen` (capped at 16).
    pub fn client_hw_addr(&self) -> &[u8] {
        let len = (self.hlen as usize).min(self.chaddr.len());
        &self.chaddr[..len]
    }

    /// The option with the given code, if present.
    pub fn option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }
}

/// Parse a DHCP message starting at the BOOTP header.
///
/// Returns `None` when the buffer cannot hold the fixed header. A missing
/// or wrong magic cookie yields a message with an empty options list and
/// no message type (logged); option parsing stops at End or at the end of
/// the buffer, whichever comes first.
pub fn parse(data: &[u8]) -> Option<DhcpMessage> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let mut message = DhcpMessage {
        op: DhcpOpcode::from_u8(data[0]),
        htype: data[1],
        hlen: data[2],
        hops: data[3],
        xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        secs: u16::from_be_bytes([data[8], data[9]]),
        flags: u16::from_be_bytes([data[10], data[11]]),
        ciaddr: addr::ipv4_from_net(&data[12..16])?,
        yiaddr: addr::ipv4_from_net(&data[16..20])?,
        siaddr: addr::ipv4_from_net(&data[20..24])?,
        giaddr: addr::ipv4_from_net(&data[24..28])?,
        chaddr: data[28..44].try_into().ok()?,
        sname: data[44..108].try_into().ok()?,
        file: data[108..236].try_into().ok()?,
        options: Vec::new(),
        message_type: None,
    };

    parse_options(&mut message, &data[HEADER_LEN..]);
    Some(message)
}

/// Walk the options area (`data` starts at the magic cookie).
fn parse_options(message: &mut DhcpMessage, data: &[u8]) {
    let cookie = match data.get(..4) {
        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        None => return,
    };
    if cookie != MAGIC_COOKIE {
        log::warn!("DHCP magic cookie is {cookie:#x}, expected {MAGIC_COOKIE:#x}");
        return;
    }

    message.options.reserve(INITIAL_OPTION_CAPACITY);
    let mut offset = 4;
    while let Some(&code) = data.get(offset) {
        match code {
            OPTION_PAD => {
                offset += 1;
            }
            OPTION_END => break,
            _ => {
                let Some(&length) = data.get(offset + 1) else {
                    break;
                };
                let Some(value) = data.get(offset + 2..offset + 2 + length as usize) else {
                    break;
                };
                if code == OPTION_MESSAGE_TYPE {
                    if let Some(&t) = value.first() {
                        message.message_type = Some(DhcpMessageType::from_u8(t));
                    }
                }
                message.options.push(DhcpOption {
                    code,
                    value: value.to_vec(),
                });
                offset += 2 + length as usize;
            }
        }
    }
}

impl std::fmt::Display for DhcpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "DHCP {:?} xid={:#x} chaddr={}",
            self.op,
            self.xid,
            self.client_hw_addr()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":")
        )?;
        for opt in &self.options {
            writeln!(f, "  option {}: {}", opt.code, hex::encode(&opt.value))?;
        }
        Ok(())
    }
}
