//! IGMP wire format: v1/v2 short messages and v3 query/report framing (spec §6).

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::addr::decode_floating_code;
use crate::checksum;

/// IGMP message type octet (first byte of every IGMP packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// `0x11` — membership query (v1/v2 short, v3 long).
    Query,
    /// `0x12` — v1 membership report.
    ReportV1,
    /// `0x16` — v2 membership report.
    ReportV2,
    /// `0x17` — v2 leave group.
    LeaveV2,
    /// `0x22` — v3 membership report.
    ReportV3,
    /// Anything else: ignored by the receive path (spec §4.8).
    Other(u8),
}

impl MessageType {
    fn from_octet(b: u8) -> MessageType {
        match b {
            0x11 => MessageType::Query,
            0x12 => MessageType::ReportV1,
            0x16 => MessageType::ReportV2,
            0x17 => MessageType::LeaveV2,
            0x22 => MessageType::ReportV3,
            other => MessageType::Other(other),
        }
    }

    fn to_octet(self) -> u8 {
        match self {
            MessageType::Query => 0x11,
            MessageType::ReportV1 => 0x12,
            MessageType::ReportV2 => 0x16,
            MessageType::LeaveV2 => 0x17,
            MessageType::ReportV3 => 0x22,
            MessageType::Other(b) => b,
        }
    }
}

/// Compatibility mode a host speaks on a given link (spec §4.2).
///
/// Ordering matters: "current mode is the lowest-indexed version whose
/// compatibility timer is armed" relies on `V1 < V2 < V3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IgmpVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

/// IGMPv3 group record type this host ever emits (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// `2` — MODE_IS_EXCLUDE, used in unsolicited/link-wide current-state reports.
    ModeIsExclude,
    /// `3` — CHANGE_TO_INCLUDE, used when emitting a v3 leave.
    ChangeToInclude,
    /// `4` — CHANGE_TO_EXCLUDE, used on a state-change report for a new join.
    ChangeToExclude,
}

impl RecordType {
    fn to_octet(self) -> u8 {
        match self {
            RecordType::ModeIsExclude => 2,
            RecordType::ChangeToInclude => 3,
            RecordType::ChangeToExclude => 4,
        }
    }
}

/// A parsed inbound query (v1/v2 short or v3 long), spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRepr {
    /// Zero for a general query, else the group being queried.
    pub group_addr: Ipv4Addr,
    /// Which protocol revision this query's framing implies.
    pub version: IgmpVersion,
    /// Max response time, decoded into 1/10-second units.
    pub max_resp_time_deciseconds: u32,
    /// Robustness variable advertised by a v3 querier (0 = "don't update").
    pub querier_robustness_variable: u8,
    /// Query interval advertised by a v3 querier, in seconds (0 = "don't update").
    pub querier_query_interval: u32,
}

/// Minimum length of the common IGMP header (spec §4.8: "require at least 4 bytes").
pub const HEADER_LEN: usize = 4;
const SHORT_BODY_LEN: usize = 8;
const LONG_QUERY_MIN_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooShort,
    BadChecksum,
    Unrecognized,
}

/// What the receive path dispatches on (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgmpRepr {
    Query(QueryRepr),
    ReportV1 { group_addr: Ipv4Addr },
    ReportV2 { group_addr: Ipv4Addr },
    /// v3 reports are ignored by a host (they target routers).
    ReportV3,
    /// Leave messages are ignored (router-only).
    Leave,
    /// Recognized header but a type this host doesn't act on.
    Other,
}

/// Validate checksum and parse the common header + v1/v2/v3 query/report framing.
pub fn parse(data: &[u8]) -> Result<IgmpRepr, ParseError> {
    if data.len() < HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    if !checksum::verify(data) {
        return Err(ParseError::BadChecksum);
    }

    let msg_type = MessageType::from_octet(data[0]);
    let max_resp_code = data[1];

    match msg_type {
        MessageType::Query => {
            if data.len() >= LONG_QUERY_MIN_LEN {
                let group_addr = Ipv4Addr::from(BigEndian::read_u32(&data[4..8]));
                let flags = data[8];
                let qrv = flags & 0x07;
                let qqic = data[9];
                Ok(IgmpRepr::Query(QueryRepr {
                    group_addr,
                    version: IgmpVersion::V3,
                    max_resp_time_deciseconds: decode_floating_code(max_resp_code),
                    querier_robustness_variable: qrv,
                    querier_query_interval: decode_floating_code(qqic),
                }))
            } else if data.len() >= SHORT_BODY_LEN {
                let group_addr = Ipv4Addr::from(BigEndian::read_u32(&data[4..8]));
                if max_resp_code == 0 {
                    Ok(IgmpRepr::Query(QueryRepr {
                        group_addr,
                        version: IgmpVersion::V1,
                        max_resp_time_deciseconds: 0,
                        querier_robustness_variable: 0,
                        querier_query_interval: 0,
                    }))
                } else {
                    Ok(IgmpRepr::Query(QueryRepr {
                        group_addr,
                        version: IgmpVersion::V2,
                        max_resp_time_deciseconds: max_resp_code as u32,
                        querier_robustness_variable: 0,
                        querier_query_interval: 0,
                    }))
                }
            } else {
                Err(ParseError::TooShort)
            }
        }
        MessageType::ReportV1 => {
            if data.len() < SHORT_BODY_LEN {
                return Err(ParseError::TooShort);
            }
            let group_addr = Ipv4Addr::from(BigEndian::read_u32(&data[4..8]));
            Ok(IgmpRepr::ReportV1 { group_addr })
        }
        MessageType::ReportV2 => {
            if data.len() < SHORT_BODY_LEN {
                return Err(ParseError::TooShort);
            }
            let group_addr = Ipv4Addr::from(BigEndian::read_u32(&data[4..8]));
            Ok(IgmpRepr::ReportV2 { group_addr })
        }
        MessageType::ReportV3 => Ok(IgmpRepr::ReportV3),
        MessageType::LeaveV2 => Ok(IgmpRepr::Leave),
        MessageType::Other(_) => Ok(IgmpRepr::Other),
    }
}

/// Build an 8-byte v1/v2 report or leave message (spec §4.2, §6).
pub fn emit_short(msg_type: MessageType, group_addr: Ipv4Addr) -> [u8; SHORT_BODY_LEN] {
    let mut buf = [0u8; SHORT_BODY_LEN];
    buf[0] = msg_type.to_octet();
    buf[1] = 0;
    BigEndian::write_u32(&mut buf[4..8], u32::from(group_addr));
    checksum::fill(&mut buf, 2);
    buf
}

/// Build a v3 membership report carrying a single group record with an
/// empty source list (spec §4.2/§6 — this host never emits source lists).
pub fn emit_report_v3(record_type: RecordType, group_addr: Ipv4Addr) -> Vec<u8> {
    emit_report_v3_multi(&[(record_type, group_addr)])
}

/// Build a v3 membership report carrying multiple group records, used for
/// the whole-link report in response to a v3 general query (spec §4.2).
pub fn emit_report_v3_multi(records: &[(RecordType, Ipv4Addr)]) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    buf[0] = MessageType::ReportV3.to_octet();
    buf[1] = 0; // reserved
    BigEndian::write_u16(&mut buf[6..8], records.len() as u16);

    for &(record_type, group_addr) in records {
        let mut record = [0u8; 8];
        record[0] = record_type.to_octet();
        record[1] = 0; // aux data length
        BigEndian::write_u16(&mut record[2..4], 0); // source count
        BigEndian::write_u32(&mut record[4..8], u32::from(group_addr));
        buf.extend_from_slice(&record);
    }

    checksum::fill(&mut buf, 2);
    buf
}

/// Byte length of a single group record with an empty source list: used to
/// size the whole-link report fan-out in §4.2.
pub const GROUP_RECORD_LEN: usize = 8;
/// Byte length of the v3 report header (common header + reserved + count).
pub const REPORT_V3_HEADER_LEN: usize = 8;
