// CoAP message parser — RFC 7252 header and options.
//
// Decodes the 4-byte fixed header, skips the token, and walks the
// delta-encoded options to reassemble the request URI from Uri-Path and
// Uri-Query segments. Response codes and all other options are ignored;
// the profiles match on (type, method, uri) only.

use super::HttpMethod;

const OPTION_URI_PATH: u16 = 11;
const OPTION_URI_QUERY: u16 = 15;

/// Extended option nibble markers.
const EXT_ONE_BYTE: u16 = 13;
const EXT_TWO_BYTES: u16 = 14;
const EXT_RESERVED: u16 = 15;

/// End-of-options / start-of-payload marker.
const PAYLOAD_MARKER: u8 = 0xff;

/// CoAP message type, bits 2-3 of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl CoapType {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// A parsed CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub coap_type: CoapType,
    /// Request codes 1-4 projected onto the HTTP method enum; responses
    /// and everything else map to `Unknown`.
    pub method: HttpMethod,
    pub uri: String,
}

fn parse_method(code: u8) -> HttpMethod {
    match code {
        1 => HttpMethod::Get,
        2 => HttpMethod::Post,
        3 => HttpMethod::Put,
        4 => HttpMethod::Delete,
        _ => HttpMethod::Unknown,
    }
}

/// Decode an option nibble, consuming extension bytes as needed.
/// Returns `(value, bytes_consumed)`, or `None` on the reserved marker or
/// a truncated extension.
fn decode_nibble(nibble: u16, data: &[u8], offset: usize) -> Option<(u16, usize)> {
    match nibble {
        EXT_ONE_BYTE => {
            let ext = *data.get(offset)? as u16;
            Some((ext + 13, 1))
        }
        EXT_TWO_BYTES => {
            let hi = *data.get(offset)? as u16;
            let lo = *data.get(offset + 1)? as u16;
            Some(((hi << 8 | lo).saturating_add(269), 2))
        }
        EXT_RESERVED => None,
        v => Some((v, 0)),
    }
}

/// Parse a CoAP message.
///
/// `data` must start at the CoAP header (the UDP payload). Returns `None`
/// when the fixed header does not fit; malformed options terminate the
/// walk, keeping the URI assembled so far.
pub fn parse(data: &[u8]) -> Option<CoapMessage> {
    let first = *data.first()?;
    let code = *data.get(1)?;
    let token_length = (first & 0x0f) as usize;
    let header_length = 4 + token_length;

    let mut message = CoapMessage {
        coap_type: CoapType::from_bits((first & 0b0011_0000) >> 4),
        method: parse_method(code),
        uri: String::new(),
    };

    let options = match data.get(header_length..) {
        Some(rest) => rest,
        None => return Some(message),
    };

    let mut option_num: u16 = 0;
    let mut offset = 0;
    while let Some(&byte) = options.get(offset) {
        if byte == PAYLOAD_MARKER {
            break;
        }

        let Some((delta, delta_ext)) = decode_nibble((byte >> 4) as u16, options, offset + 1)
        else {
            break;
        };
        let Some((length, length_ext)) =
            decode_nibble((byte & 0x0f) as u16, options, offset + 1 + delta_ext)
        else {
            break;
        };

        option_num = option_num.saturating_add(delta);
        let value_start = offset + 1 + delta_ext + length_ext;
        let Some(value) = options.get(value_start..value_start + length as usize) else {
            break;
        };

        if option_num == OPTION_URI_PATH || option_num == OPTION_URI_QUERY {
            let prefix = if option_num == OPTION_URI_PATH { '/' } else { '?' };
            message.uri.push(prefix);
            message.uri.push_str(&String::from_utf8_lossy(value));
        }

        offset = value_start + length as usize;
    }

    Some(message)
}

impl std::fmt::Display for CoapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Confirmable => "CON",
            Self::NonConfirmable => "NON",
            Self::Acknowledgement => "ACK",
            Self::Reset => "RST",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for CoapMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoAP {} {} {}", self.coap_type, self.method, self.uri)
    }
}
