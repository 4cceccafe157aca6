// IGMP message parser — RFC 2236 (v1/v2) and RFC 3376 membership reports.
//
// Multicast group membership is how cameras and bridges announce their
// discovery channels (mDNS, SSDP), so the profiles gate on join/leave
// traffic. v3 membership queries are not parsed.

use std::net::Ipv4Addr;

use crate::addr;

/// IGMP message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgmpMessageType {
    MembershipQuery,
    V1MembershipReport,
    V2MembershipReport,
    LeaveGroup,
    V3MembershipReport,
}

impl IgmpMessageType {
    fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x11 => Some(Self::MembershipQuery),
            0x12 => Some(Self::V1MembershipReport),
            0x16 => Some(Self::V2MembershipReport),
            0x17 => Some(Self::LeaveGroup),
            0x22 => Some(Self::V3MembershipReport),
            _ => None,
        }
    }
}

/// Body of a v1/v2 message (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgmpV2Message {
    pub max_resp_time: u8,
    pub checksum: u16,
    pub group_address: Ipv4Addr,
}

/// One group record of a v3 membership report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgmpV3GroupRecord {
    pub record_type: u8,
    pub aux_data_len: u8,
    pub num_sources: u16,
    pub group_address: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

/// Body of a v3 membership report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgmpV3MembershipReport {
    pub checksum: u16,
    pub num_groups: u16,
    pub groups: Vec<IgmpV3GroupRecord>,
}

/// Version-discriminated message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgmpBody {
    V2(IgmpV2Message),
    V3MembershipReport(IgmpV3MembershipReport),
}

/// A parsed IGMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgmpMessage {
    pub version: u8,
    pub igmp_type: IgmpMessageType,
    pub body: IgmpBody,
}

/// Parse an IGMP message starting at the IGMP header.
///
/// Types 0x11/0x12/0x16/0x17 parse as a version-2 body; 0x22 as a v3
/// membership report. v3 membership *queries* share type 0x11 with v1/v2
/// and go through the v2 body path unchanged. Unknown types and truncated
/// bodies return `None`.
pub fn parse(data: &[u8]) -> Option<IgmpMessage> {
    let igmp_type = IgmpMessageType::from_u8(*data.first()?)?;
    match igmp_type {
        IgmpMessageType::V3MembershipReport => Some(IgmpMessage {
            version: 3,
            igmp_type,
            body: IgmpBody::V3MembershipReport(parse_v3_membership_report(data)?),
        }),
        _ => Some(IgmpMessage {
            version: 2,
            igmp_type,
            body: IgmpBody::V2(parse_v2_message(data)?),
        }),
    }
}

fn parse_v2_message(data: &[u8]) -> Option<IgmpV2Message> {
    Some(IgmpV2Message {
        max_resp_time: *data.get(1)?,
        checksum: u16::from_be_bytes([*data.get(2)?, *data.get(3)?]),
        group_address: addr::ipv4_from_net(data.get(4..8)?)?,
    })
}

fn parse_v3_membership_report(data: &[u8]) -> Option<IgmpV3MembershipReport> {
    let checksum = u16::from_be_bytes([*data.get(2)?, *data.get(3)?]);
    let num_groups = u16::from_be_bytes([*data.get(6)?, *data.get(7)?]);
    let mut groups = Vec::with_capacity(num_groups as usize);
    let mut offset = 8;
    for _ in 0..num_groups {
        let (record, consumed) = parse_group_record(data.get(offset..)?)?;
        groups.push(record);
        offset += consumed;
    }
    Some(IgmpV3MembershipReport {
        checksum,
        num_groups,
        groups,
    })
}

/// Parse one group record: 8 header bytes plus 4 bytes per source.
fn parse_group_record(data: &[u8]) -> Option<(IgmpV3GroupRecord, usize)> {
    let num_sources = u16::from_be_bytes([*data.get(2)?, *data.get(3)?]);
    let mut sources = Vec::with_capacity(num_sources as usize);
    for i in 0..num_sources as usize {
        sources.push(addr::ipv4_from_net(data.get(8 + i * 4..)?)?);
    }
    let record = IgmpV3GroupRecord {
        record_type: *data.first()?,
        aux_data_len: *data.get(1)?,
        num_sources,
        group_address: addr::ipv4_from_net(data.get(4..8)?)?,
        sources,
    };
    Some((record, 8 + num_sources as usize * 4))
}

impl std::fmt::Display for IgmpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            IgmpBody::V2(v2) => write!(
                f,
                "IGMPv2 {:?} group {} max_resp {}",
                self.igmp_type, v2.group_address, v2.max_resp_time
            ),
            IgmpBody::V3MembershipReport(report) => {
                write!(f, "IGMPv3 report, {} group(s):", report.num_groups)?;
                for g in &report.groups {
                    write!(f, " [type {} group {}]", g.record_type, g.group_address)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_membership_report() {
        // Type 0x16, max resp 0x00, checksum 0x0904, group 224.0.0.251.
        let data = [0x16, 0x00, 0x09, 0x04, 224, 0, 0, 251];
        let msg = parse(&data).unwrap();
        assert_eq!(msg.version, 2);
        assert_eq!(msg.igmp_type, IgmpMessageType::V2MembershipReport);
        let IgmpBody::V2(v2) = msg.body else {
            panic!("expected v2 body");
        };
        assert_eq!(v2.checksum, 0x0904);
        assert_eq!(v2.group_address, Ipv4Addr::new(224, 0, 0, 251));
    }

    #[test]
    fn v2_leave_group() {
        let data = [0x17, 0x00, 0x08, 0x04, 224, 0, 0, 251];
        let msg = parse(&data).unwrap();
        assert_eq!(msg.version, 2);
        assert_eq!(msg.igmp_type, IgmpMessageType::LeaveGroup);
    }

    #[test]
    fn membership_query_parses_as_v2() {
        let data = [0x11, 0x64, 0xee, 0x9b, 0, 0, 0, 0];
        let msg = parse(&data).unwrap();
        assert_eq!(msg.version, 2);
        assert_eq!(msg.igmp_type, IgmpMessageType::MembershipQuery);
        let IgmpBody::V2(v2) = msg.body else {
            panic!("expected v2 body");
        };
        assert_eq!(v2.max_resp_time, 0x64);
        assert_eq!(v2.group_address, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn v3_membership_report_single_group() {
        // Type 0x22, checksum 0xf902, one group record of type 4
        // (change to exclude) for 224.0.0.251, no sources.
        let data = [
            0x22, 0x00, 0xf9, 0x02, 0x00, 0x00, 0x00, 0x01, // report header
            0x04, 0x00, 0x00, 0x00, 224, 0, 0, 251, // group record
        ];
        let msg = parse(&data).unwrap();
        assert_eq!(msg.version, 3);
        assert_eq!(msg.igmp_type, IgmpMessageType::V3MembershipReport);
        let IgmpBody::V3MembershipReport(report) = msg.body else {
            panic!("expected v3 body");
        };
        assert_eq!(report.checksum, 0xf902);
        assert_eq!(report.num_groups, 1);
        assert_eq!(report.groups[0].record_type, 4);
        assert_eq!(report.groups[0].group_address, Ipv4Addr::new(224, 0, 0, 251));
        assert!(report.groups[0].sources.is_empty());
    }

    #[test]
    fn v3_group_record_with_sources() {
        let data = [
            0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // report header
            0x01, 0x00, 0x00, 0x02, 239, 255, 255, 250, // group, 2 sources
            192, 168, 1, 1, 192, 168, 1, 2,
        ];
        let msg = parse(&data).unwrap();
        let IgmpBody::V3MembershipReport(report) = msg.body else {
            panic!("expected v3 body");
        };
        assert_eq!(report.groups[0].num_sources, 2);
        assert_eq!(
            report.groups[0].sources,
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]
        );
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(parse(&[0x42, 0, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(parse(&[]).is_none());
    }

    #[test]
    fn truncated_v3_record_rejected() {
        // Claims one group but the record is cut short.
        let data = [0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x04, 0x00];
        assert!(parse(&data).is_none());
    }
}
