//! PTP message header and body parsing (§4.A), plus the DELAY_REQ encoder.
//!
//! Grounded on `PtpMessage`/`PtpClockQuality` and the per-type parse functions in the
//! original GStreamer PTP clock source; byte offsets match IEEE 1588-2008 clause 13.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

use super::identity::ClockIdentity;
use super::timestamp::PtpTimestamp;

pub const HEADER_LEN: usize = 34;
pub const DELAY_REQ_MESSAGE_LEN: usize = 44;

/// `logMessageInterval == 0x7F` is a known-broken sentinel some master implementations
/// emit; substituted for a 1 second interval with a once-only warning (see DESIGN.md's
/// open-question resolution #1).
pub const LOG_INTERVAL_BROKEN: i8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync,
    DelayReq,
    FollowUp,
    DelayResp,
    Announce,
    Other(u8),
}

impl MessageType {
    fn from_nibble(v: u8) -> Self {
        match v {
            0x0 => MessageType::Sync,
            0x1 => MessageType::DelayReq,
            0x8 => MessageType::FollowUp,
            0x9 => MessageType::DelayResp,
            0xb => MessageType::Announce,
            other => MessageType::Other(other),
        }
    }
}

pub const FLAG_ALTERNATE_MASTER: u16 = 0x0100;
pub const FLAG_TWO_STEP: u16 = 0x0200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub transport_specific: u8,
    pub message_type: MessageType,
    pub version: u8,
    pub message_length: u16,
    pub domain_number: u8,
    pub flag_field: u16,
    /// 48.16 fixed-point nanoseconds, raw subunits (divide by 65536 for whole ns).
    pub correction_field: i64,
    pub source_port_identity: ClockIdentity,
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBody {
    pub origin_timestamp: PtpTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUpBody {
    pub precise_origin_timestamp: PtpTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayReqBody {
    pub origin_timestamp: PtpTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRespBody {
    pub receive_timestamp: PtpTimestamp,
    pub requesting_port_identity: ClockIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceBody {
    pub origin_timestamp: PtpTimestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority_1: u8,
    pub grandmaster_clock_class: u8,
    pub grandmaster_clock_accuracy: u8,
    pub grandmaster_offset_scaled_log_variance: u16,
    pub grandmaster_priority_2: u8,
    pub grandmaster_identity: u64,
    pub steps_removed: u16,
    pub time_source: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody {
    Sync(SyncBody),
    FollowUp(FollowUpBody),
    DelayReq(DelayReqBody),
    DelayResp(DelayRespBody),
    Announce(AnnounceBody),
    /// Header-only message of a type this engine doesn't act on (PDELAY_*, SIGNALING, ...).
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedMessage {
    pub header: Header,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    TooShortForHeader,
    TooShortForDeclaredLength,
    TooShortForBody,
    UnsupportedVersion(u8),
    MalformedTimestamp,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::TooShortForHeader => write!(f, "message shorter than the 34-byte PTP header"),
            CodecError::TooShortForDeclaredLength => write!(f, "message shorter than its own messageLength field"),
            CodecError::TooShortForBody => write!(f, "message truncated before the message-type body"),
            CodecError::UnsupportedVersion(v) => write!(f, "unsupported PTP version {v}, expected 2"),
            CodecError::MalformedTimestamp => write!(f, "timestamp nanoseconds field >= 1e9 or seconds out of range"),
        }
    }
}

impl std::error::Error for CodecError {}

fn read_ptp_timestamp(buf: &[u8]) -> Result<PtpTimestamp, CodecError> {
    debug_assert!(buf.len() >= 10);
    let seconds = (BigEndian::read_u16(&buf[0..2]) as u64) << 32 | BigEndian::read_u32(&buf[2..6]) as u64;
    let nanoseconds = BigEndian::read_u32(&buf[6..10]);
    let ts = PtpTimestamp { seconds, nanoseconds };
    if ts.to_nanos().is_none() {
        return Err(CodecError::MalformedTimestamp);
    }
    Ok(ts)
}

fn write_ptp_timestamp(buf: &mut [u8], ts: &PtpTimestamp) {
    debug_assert!(buf.len() >= 10);
    BigEndian::write_u16(&mut buf[0..2], (ts.seconds >> 32) as u16);
    BigEndian::write_u32(&mut buf[2..6], (ts.seconds & 0xffff_ffff) as u32);
    BigEndian::write_u32(&mut buf[6..10], ts.nanoseconds);
}

/// Parses the 34-byte common header. Rejects truncated buffers, wrong version, and
/// buffers shorter than the header's own declared `message_length`.
pub fn parse_header(buf: &[u8]) -> Result<Header, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::TooShortForHeader);
    }

    let version = buf[1] & 0x0f;
    if version != 2 {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let message_length = BigEndian::read_u16(&buf[2..4]);
    if (buf.len() as u64) < message_length as u64 {
        return Err(CodecError::TooShortForDeclaredLength);
    }

    let correction_field = BigEndian::read_i64(&buf[8..16]);
    let clock_identity = BigEndian::read_u64(&buf[20..28]);
    let port_number = BigEndian::read_u16(&buf[28..30]);

    Ok(Header {
        transport_specific: (buf[0] & 0xf0) >> 4,
        message_type: MessageType::from_nibble(buf[0] & 0x0f),
        version,
        message_length,
        domain_number: buf[4],
        flag_field: BigEndian::read_u16(&buf[6..8]),
        correction_field,
        source_port_identity: ClockIdentity::new(clock_identity, port_number),
        sequence_id: BigEndian::read_u16(&buf[30..32]),
        control_field: buf[32],
        log_message_interval: buf[33] as i8,
    })
}

/// Parses the message-type-specific body following the header. `buf` must be the full
/// message (header included); only the bytes after `HEADER_LEN` are consumed.
pub fn parse_body(header: &Header, buf: &[u8]) -> Result<MessageBody, CodecError> {
    let body = &buf[HEADER_LEN..];

    match header.message_type {
        MessageType::Sync => {
            if body.len() < 10 {
                return Err(CodecError::TooShortForBody);
            }
            Ok(MessageBody::Sync(SyncBody { origin_timestamp: read_ptp_timestamp(body)? }))
        }
        MessageType::DelayReq => {
            if body.len() < 10 {
                return Err(CodecError::TooShortForBody);
            }
            Ok(MessageBody::DelayReq(DelayReqBody { origin_timestamp: read_ptp_timestamp(body)? }))
        }
        MessageType::FollowUp => {
            if body.len() < 10 {
                return Err(CodecError::TooShortForBody);
            }
            Ok(MessageBody::FollowUp(FollowUpBody { precise_origin_timestamp: read_ptp_timestamp(body)? }))
        }
        MessageType::DelayResp => {
            if body.len() < 20 {
                return Err(CodecError::TooShortForBody);
            }
            let receive_timestamp = read_ptp_timestamp(&body[0..10])?;
            let clock_identity = BigEndian::read_u64(&body[10..18]);
            let port_number = BigEndian::read_u16(&body[18..20]);
            Ok(MessageBody::DelayResp(DelayRespBody {
                receive_timestamp,
                requesting_port_identity: ClockIdentity::new(clock_identity, port_number),
            }))
        }
        MessageType::Announce => {
            if body.len() < 30 {
                return Err(CodecError::TooShortForBody);
            }
            let origin_timestamp = read_ptp_timestamp(&body[0..10])?;
            Ok(MessageBody::Announce(AnnounceBody {
                origin_timestamp,
                current_utc_offset: BigEndian::read_i16(&body[10..12]),
                // body[12] is reserved
                grandmaster_priority_1: body[13],
                grandmaster_clock_class: body[14],
                grandmaster_clock_accuracy: body[15],
                grandmaster_offset_scaled_log_variance: BigEndian::read_u16(&body[16..18]),
                grandmaster_priority_2: body[18],
                grandmaster_identity: BigEndian::read_u64(&body[19..27]),
                steps_removed: BigEndian::read_u16(&body[27..29]),
                time_source: body[29],
            }))
        }
        MessageType::Other(_) => Ok(MessageBody::Ignored),
    }
}

/// Parses a full PTP message (header + body) from `buf`.
pub fn parse_message(buf: &[u8]) -> Result<ParsedMessage, CodecError> {
    let header = parse_header(buf)?;
    let body = parse_body(&header, buf)?;
    Ok(ParsedMessage { header, body })
}

/// The effective announce/sync interval a `log_message_interval` field encodes, in
/// nanoseconds, applying the 0x7F broken-sentinel substitution (DESIGN.md open question #1).
/// Returns whether this call observed the sentinel, so the caller can decide to warn once.
pub fn log_interval_to_nanos(log_message_interval: i8) -> (i64, bool) {
    if log_message_interval == LOG_INTERVAL_BROKEN {
        (1_000_000_000, true)
    } else {
        (log2_to_nanos(log_message_interval), false)
    }
}

fn log2_to_nanos(log2: i8) -> i64 {
    if log2 >= 0 {
        1_000_000_000i64.saturating_mul(1i64 << log2.min(62) as u32)
    } else {
        let divisor = 1i64 << (-log2).min(62) as u32;
        1_000_000_000i64 / divisor
    }
}

/// Encodes a 44-byte DELAY_REQ message per §4.A/§6: transportSpecific=0, flagField=0,
/// control=0x01, logMessageInterval=0x7F, origin timestamp left zero.
pub fn encode_delay_req(
    source_port_identity: ClockIdentity,
    sequence_id: u16,
    domain_number: u8,
) -> [u8; DELAY_REQ_MESSAGE_LEN] {
    let mut buf = [0u8; DELAY_REQ_MESSAGE_LEN];

    buf[0] = 0x01; // transportSpecific=0 (high nibble), messageType=DELAY_REQ (low nibble)
    buf[1] = 0x02; // version 2
    BigEndian::write_u16(&mut buf[2..4], DELAY_REQ_MESSAGE_LEN as u16);
    buf[4] = domain_number;
    // buf[5] reserved = 0
    // buf[6..8] flagField = 0
    // buf[8..16] correctionField = 0
    // buf[16..20] reserved = 0
    BigEndian::write_u64(&mut buf[20..28], source_port_identity.clock_identity);
    BigEndian::write_u16(&mut buf[28..30], source_port_identity.port_number);
    BigEndian::write_u16(&mut buf[30..32], sequence_id);
    buf[32] = 0x01; // controlField: DELAY_REQ
    buf[33] = LOG_INTERVAL_BROKEN as u8;
    write_ptp_timestamp(&mut buf[34..44], &PtpTimestamp::default());

    buf
}
