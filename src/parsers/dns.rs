// DNS wire format parser — RFC 1035 Section 4.
//
// Parses the DNS header, question section (with name decompression) and
// answer section. Authority and additional sections are skipped: the
// device policies only ever match on questions and resolve answers.
//
// The parser is fed straight from NFQUEUE with attacker-controllable
// bytes, so every read is bounds-checked and pointer chases are bounded by
// the message length. Malformed input yields a best-effort partial message
// rather than an error; the policy's default verdict applies.

use std::net::IpAddr;

use crate::addr;

/// DNS header size in bytes.
const HEADER_SIZE: usize = 12;

/// Initial capacity for a decoded domain name; the buffer doubles on
/// demand like any Vec-backed string.
const NAME_INITIAL_CAPACITY: usize = 100;

/// QR bit in the header flags word.
const QR_FLAG_MASK: u16 = 0x8000;

/// The class field's top bit is the MDNS cache-flush bit, not part of the
/// class value.
const CLASS_MASK: u16 = 0x7fff;

// Record type constants.
const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_PTR: u16 = 12;
const TYPE_AAAA: u16 = 28;

/// DNS resource record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Ptr,
    Aaaa,
    Other(u16),
}

impl RecordType {
    fn from_u16(val: u16) -> Self {
        match val {
            TYPE_A => Self::A,
            TYPE_NS => Self::Ns,
            TYPE_CNAME => Self::Cname,
            TYPE_PTR => Self::Ptr,
            TYPE_AAAA => Self::Aaaa,
            n => Self::Other(n),
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Ns => write!(f, "NS"),
            Self::Cname => write!(f, "CNAME"),
            Self::Ptr => write!(f, "PTR"),
            Self::Aaaa => write!(f, "AAAA"),
            Self::Other(n) => write!(f, "TYPE({n})"),
        }
    }
}

/// DNS message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    /// False for a query, true for a response.
    pub qr: bool,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

/// A single entry of the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub qname: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

/// RDATA payload of a resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    /// A / AAAA: an IP address.
    Ip(IpAddr),
    /// NS / CNAME / PTR: a domain name.
    Name(String),
    /// Any other record type: raw bytes.
    Bytes(Vec<u8>),
    /// rdlength was zero.
    Empty,
}

/// A resource record of the answer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: u16,
    pub ttl: u32,
    pub rdlength: u16,
    pub rdata: RData,
}

/// A parsed DNS message: header, questions, answers.
#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub header: Option<DnsHeader>,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<ResourceRecord>,
}

/// Parse a DNS message from its wire form.
///
/// `data` must start at the DNS header (the UDP payload). Returns `None`
/// only when the buffer cannot hold a header; any later truncation or
/// malformed field stops parsing and returns what was decoded so far.
pub fn parse(data: &[u8]) -> Option<DnsMessage> {
    if data.len() < HEADER_SIZE {
        return None;
    }

    let header = DnsHeader {
        id: u16::from_be_bytes([data[0], data[1]]),
        flags: u16::from_be_bytes([data[2], data[3]]),
        qr: u16::from_be_bytes([data[2], data[3]]) & QR_FLAG_MASK != 0,
        qdcount: u16::from_be_bytes([data[4], data[5]]),
        ancount: u16::from_be_bytes([data[6], data[7]]),
        nscount: u16::from_be_bytes([data[8], data[9]]),
        arcount: u16::from_be_bytes([data[10], data[11]]),
    };

    let mut message = DnsMessage {
        header: Some(header),
        questions: Vec::with_capacity(header.qdcount as usize),
        answers: Vec::new(),
    };
    let mut offset = HEADER_SIZE;

    for _ in 0..header.qdcount {
        match parse_question(data, &mut offset) {
            Some(q) => message.questions.push(q),
            None => {
                log::warn!("truncated DNS question section at offset {offset}");
                return Some(message);
            }
        }
    }

    // Authority/additional sections are never inspected by policies.
    if header.qr && header.ancount > 0 {
        message.answers.reserve(header.ancount as usize);
        for _ in 0..header.ancount {
            match parse_resource_record(data, &mut offset) {
                Some(rr) => message.answers.push(rr),
                None => {
                    log::warn!("truncated DNS answer section at offset {offset}");
                    return Some(message);
                }
            }
        }
    }

    Some(message)
}

fn parse_question(data: &[u8], offset: &mut usize) -> Option<DnsQuestion> {
    let qname = decode_name(data, offset)?;
    let qtype = u16::from_be_bytes([*data.get(*offset)?, *data.get(*offset + 1)?]);
    let qclass = u16::from_be_bytes([*data.get(*offset + 2)?, *data.get(*offset + 3)?]);
    *offset += 4;
    Some(DnsQuestion {
        qname,
        qtype: RecordType::from_u16(qtype),
        qclass: qclass & CLASS_MASK,
    })
}

fn parse_resource_record(data: &[u8], offset: &mut usize) -> Option<ResourceRecord> {
    let name = decode_name(data, offset)?;
    let fixed = data.get(*offset..*offset + 10)?;
    let rtype = RecordType::from_u16(u16::from_be_bytes([fixed[0], fixed[1]]));
    let rclass = u16::from_be_bytes([fixed[2], fixed[3]]) & CLASS_MASK;
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]);
    *offset += 10;
    let rdata = parse_rdata(rtype, rdlength, data, offset)?;
    Some(ResourceRecord {
        name,
        rtype,
        rclass,
        ttl,
        rdlength,
        rdata,
    })
}

fn parse_rdata(rtype: RecordType, rdlength: u16, data: &[u8], offset: &mut usize) -> Option<RData> {
    if rdlength == 0 {
        return Some(RData::Empty);
    }
    let rdlength = rdlength as usize;
    match rtype {
        RecordType::A => {
            let ip = addr::ipv4_from_net(data.get(*offset..*offset + rdlength)?)?;
            *offset += rdlength;
            Some(RData::Ip(IpAddr::V4(ip)))
        }
        RecordType::Aaaa => {
            let ip = addr::ipv6_from_net(data.get(*offset..*offset + rdlength)?)?;
            *offset += rdlength;
            Some(RData::Ip(IpAddr::V6(ip)))
        }
        RecordType::Ns | RecordType::Cname | RecordType::Ptr => {
            Some(RData::Name(decode_name(data, offset)?))
        }
        RecordType::Other(_) => {
            let bytes = data.get(*offset..*offset + rdlength)?.to_vec();
            *offset += rdlength;
            Some(RData::Bytes(bytes))
        }
    }
}

/// Decode a (possibly compressed) domain name starting at `*offset`.
///
/// Labels are joined with '.'; the root name decodes to an empty string.
/// Once a compression pointer is taken, `*offset` stops advancing: it ends
/// up just past the two pointer bytes, per RFC 1035 §4.1.4.
///
/// Pointer chases are bounded by the message length, so crafted cycles
/// terminate with whatever was decoded up to the budget.
fn decode_name(data: &[u8], offset: &mut usize) -> Option<String> {
    if *data.get(*offset)? == 0 {
        *offset += 1;
        return Some(String::new());
    }

    let mut name = String::with_capacity(NAME_INITIAL_CAPACITY);
    let mut pos = *offset;
    let mut compressed = false;
    let mut hops = 0usize;

    loop {
        let length_byte = *data.get(pos)? as usize;
        if length_byte == 0 {
            break;
        }

        hops += 1;
        if hops > data.len() {
            log::warn!("DNS name compression cycle at offset {pos}, truncating");
            if !compressed {
                *offset = pos;
            }
            return Some(name);
        }

        if length_byte & 0xc0 == 0xc0 {
            // Compression pointer: 14-bit absolute offset.
            let low = *data.get(pos + 1)? as usize;
            if !compressed {
                *offset = pos + 2;
                compressed = true;
            }
            pos = ((length_byte & 0x3f) << 8) | low;
            continue;
        }

        let label = data.get(pos + 1..pos + 1 + length_byte)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos += length_byte + 1;
    }

    if !compressed {
        // Advance past the terminating null byte.
        *offset = pos + 1;
    }
    Some(name)
}

// ---------------------------------------------------------------------------
// Lookups over parsed sections
// ---------------------------------------------------------------------------

/// True if any question's name ends with `suffix` (byte-wise).
pub fn contains_suffix(questions: &[DnsQuestion], suffix: &str) -> bool {
    questions.iter().any(|q| q.qname.ends_with(suffix))
}

/// True if any question's name equals `domain_name` exactly.
pub fn contains_full(questions: &[DnsQuestion], domain_name: &str) -> bool {
    questions.iter().any(|q| q.qname == domain_name)
}

/// The question for `domain_name`, if present.
pub fn get_question<'a>(questions: &'a [DnsQuestion], domain_name: &str) -> Option<&'a DnsQuestion> {
    questions.iter().find(|q| q.qname == domain_name)
}

/// Collect the IP addresses that `domain_name` resolves to within an
/// answer list, following CNAME records present in the same list.
///
/// Single forward pass: a CNAME retargets the searched name for the
/// remaining records, so chains resolve as long as the records appear in
/// chain order (the order resolvers emit them). Returns an empty list when
/// the name is absent.
pub fn ip_addresses_for(answers: &[ResourceRecord], domain_name: &str) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    let mut searched = domain_name;
    for rr in answers {
        if rr.name != searched {
            continue;
        }
        match &rr.rdata {
            RData::Ip(ip) => ips.push(*ip),
            RData::Name(target) if rr.rtype == RecordType::Cname => searched = target,
            _ => {}
        }
    }
    ips
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

impl std::fmt::Display for RData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Name(name) => f.write_str(name),
            Self::Bytes(bytes) => f.write_str(&hex::encode(bytes)),
            Self::Empty => Ok(()),
        }
    }
}

impl std::fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} class {}", self.qname, self.qtype, self.qclass)
    }
}

impl std::fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} class {} ttl {} -> {}",
            self.name, self.rtype, self.rclass, self.ttl, self.rdata
        )
    }
}

impl std::fmt::Display for DnsMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(h) = &self.header {
            writeln!(
                f,
                "DNS id={:#x} qr={} qd={} an={}",
                h.id, h.qr as u8, h.qdcount, h.ancount
            )?;
        }
        for q in &self.questions {
            writeln!(f, "  Q: {q}")?;
        }
        for rr in &self.answers {
            writeln!(f, "  A: {rr}")?;
        }
        Ok(())
    }
}
