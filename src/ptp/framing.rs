//! Length-prefixed typed-message framing over the helper's stdout/stderr/stdin pipes (§4.B).
//!
//! Grounded on `StdIOMessageType` and the stdio reader in the original GStreamer PTP clock
//! source; re-architected per SPEC_FULL.md §9 as an explicit two-state reader instead of a
//! single read loop, so a caller can drive it from non-blocking reads without ever accepting
//! a body shorter than its declared header length.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::io::Read;

use super::identity::ClockIdentity;

pub const DATA_HEADER_LEN: usize = 3;
pub const LOG_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFrameType {
    Event,
    General,
    ClockId,
    SendTimeAck,
    Other(u8),
}

impl DataFrameType {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => DataFrameType::Event,
            1 => DataFrameType::General,
            2 => DataFrameType::ClockId,
            3 => DataFrameType::SendTimeAck,
            other => DataFrameType::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    /// EVENT/GENERAL: helper-observed receive time plus the raw PTP message bytes.
    Message { helper_receive_time: i64, ptp_bytes: Vec<u8> },
    /// CLOCK_ID: this process's derived clock identity, sent exactly once at startup.
    ClockId(ClockIdentity),
    /// SEND_TIME_ACK: refines a pending DELAY_REQ's local send time.
    SendTimeAck { helper_send_time: i64, message_type: u8, domain: u8, sequence_id: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub level: u8,
    pub file: String,
    pub module: String,
    pub line: u32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// The pipe returned EOF or a zero-byte read; fatal per §4.G/§7.
    Eof,
    ShortHeader,
    ShortBody,
    Malformed,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::Eof => write!(f, "helper pipe closed"),
            FramingError::ShortHeader => write!(f, "short read on frame header"),
            FramingError::ShortBody => write!(f, "short read on frame body"),
            FramingError::Malformed => write!(f, "frame body shorter than its declared type requires"),
        }
    }
}

impl std::error::Error for FramingError {}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FramingError> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FramingError::Eof),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return Err(FramingError::Eof),
        }
    }
    Ok(())
}

fn parse_data_frame(frame_type: DataFrameType, payload: &[u8]) -> Result<DataFrame, FramingError> {
    match frame_type {
        DataFrameType::Event | DataFrameType::General => {
            if payload.len() < 8 {
                return Err(FramingError::Malformed);
            }
            let helper_receive_time = BigEndian::read_i64(&payload[0..8]);
            Ok(DataFrame::Message { helper_receive_time, ptp_bytes: payload[8..].to_vec() })
        }
        DataFrameType::ClockId => {
            if payload.len() < 8 {
                return Err(FramingError::Malformed);
            }
            let clock_identity = BigEndian::read_u64(&payload[0..8]);
            let port_number = std::process::id() as u16;
            Ok(DataFrame::ClockId(ClockIdentity::new(clock_identity, port_number)))
        }
        DataFrameType::SendTimeAck => {
            if payload.len() < 12 {
                return Err(FramingError::Malformed);
            }
            Ok(DataFrame::SendTimeAck {
                helper_send_time: BigEndian::read_i64(&payload[0..8]),
                message_type: payload[8],
                domain: payload[9],
                sequence_id: BigEndian::read_u16(&payload[10..12]),
            })
        }
        DataFrameType::Other(_) => Err(FramingError::Malformed),
    }
}

/// Reads exactly one data frame (header then body) from the helper's stdout pipe.
/// Never accepts a body read shorter than the header-declared length (SPEC_FULL.md §9).
pub fn read_data_frame<R: Read>(reader: &mut R) -> Result<DataFrame, FramingError> {
    let mut header = [0u8; DATA_HEADER_LEN];
    read_exact_or_eof(reader, &mut header)?;

    let payload_len = BigEndian::read_u16(&header[0..2]) as usize;
    let frame_type = DataFrameType::from_byte(header[2]);

    let mut payload = vec![0u8; payload_len];
    read_exact_or_eof(reader, &mut payload)?;

    parse_data_frame(frame_type, &payload)
}

/// Reads exactly one structured log frame from the helper's stderr pipe.
pub fn read_log_frame<R: Read>(reader: &mut R) -> Result<LogFrame, FramingError> {
    let mut header = [0u8; LOG_HEADER_LEN];
    read_exact_or_eof(reader, &mut header)?;

    let payload_len = BigEndian::read_u16(&header[0..2]) as usize;
    let mut payload = vec![0u8; payload_len];
    read_exact_or_eof(reader, &mut payload)?;

    if payload.len() < 1 + 2 {
        return Err(FramingError::Malformed);
    }
    let level = payload[0];
    let mut cursor = 1usize;

    let file_len = BigEndian::read_u16(&payload[cursor..cursor + 2]) as usize;
    cursor += 2;
    if payload.len() < cursor + file_len + 2 {
        return Err(FramingError::Malformed);
    }
    let file = String::from_utf8_lossy(&payload[cursor..cursor + file_len]).into_owned();
    cursor += file_len;

    let module_len = BigEndian::read_u16(&payload[cursor..cursor + 2]) as usize;
    cursor += 2;
    if payload.len() < cursor + module_len + 4 {
        return Err(FramingError::Malformed);
    }
    let module = String::from_utf8_lossy(&payload[cursor..cursor + module_len]).into_owned();
    cursor += module_len;

    let line = BigEndian::read_u32(&payload[cursor..cursor + 4]);
    cursor += 4;

    let message = String::from_utf8_lossy(&payload[cursor..]).into_owned();

    Ok(LogFrame { level, file, module, line, message })
}

/// Encodes an outbound DELAY_REQ frame: 3-byte header (type=EVENT) followed by the
/// 8-byte BE local send-time and the 44-byte PTP DELAY_REQ message.
pub fn encode_delay_req_frame(local_send_time: i64, ptp_bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DATA_HEADER_LEN + 8 + ptp_bytes.len());
    let payload_len = (8 + ptp_bytes.len()) as u16;

    let mut header = [0u8; DATA_HEADER_LEN];
    BigEndian::write_u16(&mut header[0..2], payload_len);
    header[2] = 0; // EVENT
    buf.extend_from_slice(&header);

    let mut send_time_buf = [0u8; 8];
    BigEndian::write_i64(&mut send_time_buf, local_send_time);
    buf.extend_from_slice(&send_time_buf);

    buf.extend_from_slice(ptp_bytes);
    buf
}
