//! Datecs wire framing.
//!
//! Two dialects share one frame shape:
//!
//! - hex-nibble: `0x01 | L[4] | SEQ | CMD[4] | DATA | 0x05 | BCC[4] | 0x03`
//!   with `L`, `CMD`, `BCC` each a 4-byte ASCII-hex encoding of a 16-bit
//!   value and `L = 0x20 + 10 + len(DATA)`; responses carry an 8-byte status.
//! - byte: `0x01 | L | SEQ | CMD | DATA | 0x05 | BCC[4] | 0x03` with
//!   `L = 0x20 + 4 + len(DATA)`; responses carry a 6-byte status.
//!
//! BCC is the arithmetic sum (mod 65536) of everything between the preamble
//! (exclusive) and the postamble (inclusive), encoded as `'0' + nibble`.

use std::time::{Duration, Instant};

use encoding_rs::Encoding;
use serde_json::json;

use crate::adapters::WireDialect;
use crate::applog::{log_error, log_info};
use crate::error::{GatewayError, Result};
use crate::transport::{hex_string, Transport};

pub const PRE: u8 = 0x01;
pub const PST: u8 = 0x05;
pub const EOT: u8 = 0x03;
pub const SEP: u8 = 0x04;
pub const NAK: u8 = 0x15;
pub const SYN: u8 = 0x16;

pub const SEQ_MIN: u8 = 0x20;
pub const SEQ_MAX: u8 = 0xFF; // exclusive

const FRAME_RETRIES: usize = 2;

/// Parsed Datecs response frame.
#[derive(Debug, Clone)]
pub struct DatecsResponse {
    pub cmd: u16,
    pub seq: u8,
    pub data: Vec<u8>,
    /// DATA split on TAB, decoded in the device codepage.
    pub fields: Vec<String>,
    /// Opaque status vector (6 or 8 bytes depending on dialect).
    pub status: Vec<u8>,
}

impl DatecsResponse {
    /// Device error code: the first field when it parses as a negative
    /// integer.
    pub fn error_code(&self) -> Option<i64> {
        let first = self.fields.first()?;
        let value: i64 = first.trim().parse().ok()?;
        (value < 0).then_some(value)
    }
}

/// Advance the rolling sequence byte. Wraps 0xFE back to 0x20; 0xFF is never
/// emitted.
pub fn next_seq(current: u8) -> u8 {
    if current < SEQ_MIN || current >= SEQ_MAX - 1 {
        SEQ_MIN
    } else {
        current + 1
    }
}

// ---------------------------------------------------------------------------
// Nibble codec
// ---------------------------------------------------------------------------

fn encode_nibbles(value: u16) -> [u8; 4] {
    [
        0x30 + ((value >> 12) & 0xF) as u8,
        0x30 + ((value >> 8) & 0xF) as u8,
        0x30 + ((value >> 4) & 0xF) as u8,
        0x30 + (value & 0xF) as u8,
    ]
}

fn decode_nibbles(data: &[u8]) -> Result<u16> {
    if data.len() != 4 {
        return Err(GatewayError::framing("nibble field must be 4 bytes"));
    }
    let mut value: u16 = 0;
    for &byte in data {
        let digit = byte.wrapping_sub(0x30);
        if digit > 0xF {
            return Err(GatewayError::framing(format!(
                "invalid nibble byte 0x{byte:02X}"
            )));
        }
        value = (value << 4) | digit as u16;
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Frame build / parse
// ---------------------------------------------------------------------------

/// Serialise a request frame.
pub fn build_request(cmd: u16, data: &[u8], seq: u8, dialect: WireDialect) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::with_capacity(data.len() + 12);
    match dialect {
        WireDialect::Byte => {
            body.push((0x20 + 4 + data.len()) as u8);
            body.push(seq);
            body.push(cmd as u8);
        }
        WireDialect::HexNibble => {
            body.extend_from_slice(&encode_nibbles((0x20 + 10 + data.len()) as u16));
            body.push(seq);
            body.extend_from_slice(&encode_nibbles(cmd));
        }
    }
    body.extend_from_slice(data);
    body.push(PST);

    let bcc: u16 = body.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    let mut frame = Vec::with_capacity(body.len() + 6);
    frame.push(PRE);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&encode_nibbles(bcc));
    frame.push(EOT);
    frame
}

/// Parse a complete response frame (preamble through postamble-of-frame).
pub fn parse_response(
    buffer: &[u8],
    dialect: WireDialect,
    status_len: usize,
    encoding: &'static Encoding,
) -> Result<DatecsResponse> {
    if buffer.first() != Some(&PRE) {
        return Err(GatewayError::framing("invalid response preamble"));
    }
    let length_total = match dialect {
        WireDialect::Byte => {
            let raw = *buffer
                .get(1)
                .ok_or_else(|| GatewayError::framing("response too short"))? as usize;
            raw.checked_sub(0x20)
                .ok_or_else(|| GatewayError::framing("invalid length byte"))?
        }
        WireDialect::HexNibble => {
            let raw = decode_nibbles(
                buffer
                    .get(1..5)
                    .ok_or_else(|| GatewayError::framing("response too short"))?,
            )? as usize;
            raw.checked_sub(0x20)
                .ok_or_else(|| GatewayError::framing("invalid length field"))?
        }
    };
    let expected_total = 1 + length_total + 4 + 1;
    if buffer.len() < expected_total {
        return Err(GatewayError::framing("response length is incomplete"));
    }
    if buffer.get(expected_total - 1) != Some(&EOT) {
        return Err(GatewayError::framing("missing frame terminator"));
    }
    let body = &buffer[1..1 + length_total];
    let bcc_expected = decode_nibbles(&buffer[1 + length_total..1 + length_total + 4])?;
    let bcc_actual: u16 = body.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    if bcc_actual != bcc_expected {
        return Err(GatewayError::framing(format!(
            "BCC mismatch: expected 0x{bcc_expected:04X}, computed 0x{bcc_actual:04X}"
        )));
    }

    let (seq, cmd, data_start, base_len) = match dialect {
        WireDialect::Byte => {
            if body.len() < 3 {
                return Err(GatewayError::framing("response body too short"));
            }
            (body[1], body[2] as u16, 3usize, 5 + status_len)
        }
        WireDialect::HexNibble => {
            if body.len() < 9 {
                return Err(GatewayError::framing("response body too short"));
            }
            (body[4], decode_nibbles(&body[5..9])?, 9usize, 11 + status_len)
        }
    };
    let data_len = length_total
        .checked_sub(base_len)
        .ok_or_else(|| GatewayError::framing("invalid response length"))?;
    let data = body[data_start..data_start + data_len].to_vec();
    let sep = body[data_start + data_len];
    if sep != SEP {
        log_info("DATECS_RESPONSE_SEP_MISMATCH", json!({"sep": sep}));
    }
    let status = body[data_start + data_len + 1..data_start + data_len + 1 + status_len].to_vec();
    if body.last() != Some(&PST) {
        return Err(GatewayError::framing("invalid response postamble"));
    }

    let fields = decode_fields(&data, encoding);
    Ok(DatecsResponse {
        cmd,
        seq,
        data,
        fields,
        status,
    })
}

/// Split DATA on TAB and decode each field in the device codepage.
pub fn decode_fields(data: &[u8], encoding: &'static Encoding) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    data.split(|&b| b == b'\t')
        .map(|part| {
            if part.is_empty() {
                String::new()
            } else {
                let (text, _, _) = encoding.decode(part);
                text.into_owned()
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Wire I/O
// ---------------------------------------------------------------------------

/// Accumulate one response frame from the wire.
///
/// Bytes before the preamble are discarded, a NAK aborts, and a SYN
/// heartbeat resets the deadline without entering the buffer.
pub fn read_response(
    transport: &mut dyn Transport,
    timeout: Duration,
    dialect: WireDialect,
    status_len: usize,
    encoding: &'static Encoding,
) -> Result<DatecsResponse> {
    let mut deadline = Instant::now() + timeout;
    let mut buffer: Vec<u8> = Vec::new();
    let mut saw_preamble = false;

    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let chunk = transport.read(1, remaining.min(Duration::from_millis(50)))?;
        let Some(&byte) = chunk.first() else {
            continue;
        };
        if !saw_preamble {
            if byte == NAK {
                return Err(GatewayError::framing("NAK received"));
            }
            if byte == SYN {
                deadline = Instant::now() + timeout;
                continue;
            }
            if byte != PRE {
                continue;
            }
            saw_preamble = true;
        }
        buffer.push(byte);
        if byte == EOT {
            return parse_response(&buffer, dialect, status_len, encoding);
        }
    }
    Err(GatewayError::Timeout(timeout))
}

/// Send a command and wait for its response, retransmitting the same frame
/// (same sequence byte) up to two times on framing errors or timeouts.
#[allow(clippy::too_many_arguments)]
pub fn send_command(
    transport: &mut dyn Transport,
    cmd: u16,
    data: &[u8],
    seq: u8,
    timeout: Duration,
    dialect: WireDialect,
    status_len: usize,
    encoding: &'static Encoding,
) -> Result<DatecsResponse> {
    let frame = build_request(cmd, data, seq, dialect);
    let mut last_error: Option<GatewayError> = None;
    for attempt in 0..=FRAME_RETRIES {
        log_info(
            "DATECS_PROTOCOL_SEND",
            json!({
                "attempt": attempt + 1,
                "cmd": format!("0x{cmd:02X}"),
                "seq": format!("0x{seq:02X}"),
                "frame_hex": hex_string(&frame),
                "frame_len": frame.len(),
            }),
        );
        transport.write(&frame)?;
        match read_response(transport, timeout, dialect, status_len, encoding) {
            Ok(response) => {
                log_info(
                    "DATECS_PROTOCOL_RECV",
                    json!({
                        "cmd": format!("0x{cmd:02X}"),
                        "seq": format!("0x{seq:02X}"),
                        "status_hex": hex_string(&response.status),
                        "fields_count": response.fields.len(),
                    }),
                );
                return Ok(response);
            }
            Err(e) if e.is_retryable_frame() => {
                log_error(
                    "DATECS_PROTOCOL_ERROR",
                    json!({
                        "attempt": attempt + 1,
                        "cmd": format!("0x{cmd:02X}"),
                        "error": e.to_string(),
                    }),
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| GatewayError::Timeout(timeout)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::WINDOWS_1251;

    /// Build the frame a device would send back for the given response parts.
    fn simulated_reply(
        cmd: u16,
        seq: u8,
        data: &[u8],
        status: &[u8],
        dialect: WireDialect,
    ) -> Vec<u8> {
        let mut body: Vec<u8> = Vec::new();
        match dialect {
            WireDialect::Byte => {
                body.push((0x20 + 5 + status.len() + data.len()) as u8);
                body.push(seq);
                body.push(cmd as u8);
            }
            WireDialect::HexNibble => {
                body.extend_from_slice(&encode_nibbles(
                    (0x20 + 11 + status.len() + data.len()) as u16,
                ));
                body.push(seq);
                body.extend_from_slice(&encode_nibbles(cmd));
            }
        }
        body.extend_from_slice(data);
        body.push(SEP);
        body.extend_from_slice(status);
        body.push(PST);
        let bcc: u16 = body.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
        let mut frame = vec![PRE];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&encode_nibbles(bcc));
        frame.push(EOT);
        frame
    }

    #[test]
    fn test_hex_request_layout() {
        // (cmd=0x4A, data="0", seq=0x20): length = 0x20 + 10 + 1 = 0x3A
        let frame = build_request(0x4A, b"0", 0x20, WireDialect::HexNibble);
        assert_eq!(frame[0], PRE);
        assert_eq!(&frame[1..5], b"003:"); // 0x003A as '0'+nibble
        assert_eq!(frame[5], 0x20);
        assert_eq!(&frame[6..10], b"004:"); // 0x004A
        assert_eq!(frame[10], b'0');
        assert_eq!(frame[11], PST);
        assert_eq!(*frame.last().unwrap(), EOT);
        // BCC covers body between preamble and postamble-of-frame
        let body = &frame[1..12];
        let bcc: u16 = body.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
        assert_eq!(&frame[12..16], &encode_nibbles(bcc));
    }

    #[test]
    fn test_byte_request_layout() {
        let frame = build_request(0x4A, b"X", 0x21, WireDialect::Byte);
        assert_eq!(frame[0], PRE);
        assert_eq!(frame[1], 0x20 + 4 + 1);
        assert_eq!(frame[2], 0x21);
        assert_eq!(frame[3], 0x4A);
        assert_eq!(frame[4], b'X');
        assert_eq!(frame[5], PST);
        assert_eq!(frame.len(), 1 + 5 + 1 + 4 + 1);
    }

    #[test]
    fn test_round_trip_both_dialects() {
        for (dialect, status_len) in [(WireDialect::HexNibble, 8), (WireDialect::Byte, 6)] {
            let status = vec![0x80u8; status_len];
            let frame = simulated_reply(0x30, 0x25, b"0\t123", &status, dialect);
            let resp = parse_response(&frame, dialect, status_len, WINDOWS_1251).unwrap();
            assert_eq!(resp.cmd, 0x30);
            assert_eq!(resp.seq, 0x25);
            assert_eq!(resp.data, b"0\t123");
            assert_eq!(resp.fields, vec!["0".to_string(), "123".to_string()]);
            assert_eq!(resp.status, status);
        }
    }

    #[test]
    fn test_any_single_byte_mutation_rejected() {
        let frame = simulated_reply(0x4A, 0x20, b"0", &[0u8; 8], WireDialect::HexNibble);
        for i in 0..frame.len() {
            let mut mutated = frame.clone();
            mutated[i] ^= 0x01;
            let parsed = parse_response(&mutated, WireDialect::HexNibble, 8, WINDOWS_1251);
            // Flipping the SEP byte only logs; everything else must reject.
            let sep_index = frame.len() - 1 - 4 - 1 - 8 - 1;
            if i == sep_index {
                continue;
            }
            assert!(parsed.is_err(), "mutation at byte {i} was accepted");
        }
    }

    #[test]
    fn test_parse_rejects_request_frames() {
        // A request is not a valid response: no SEP/status section.
        let frame = build_request(0x4A, b"0", 0x20, WireDialect::HexNibble);
        assert!(parse_response(&frame, WireDialect::HexNibble, 8, WINDOWS_1251).is_err());
    }

    #[test]
    fn test_bcc_is_modular() {
        // 600 bytes of 0xFF in DATA pushes the sum past 0xFFFF.
        let data = vec![0xFFu8; 600];
        let frame = simulated_reply(0x31, 0x20, &data, &[0u8; 8], WireDialect::HexNibble);
        let resp = parse_response(&frame, WireDialect::HexNibble, 8, WINDOWS_1251).unwrap();
        assert_eq!(resp.data.len(), 600);
    }

    #[test]
    fn test_sequence_wraps_and_skips_0xff() {
        assert_eq!(next_seq(0x20), 0x21);
        assert_eq!(next_seq(0xFD), 0xFE);
        assert_eq!(next_seq(0xFE), 0x20);
        assert_eq!(next_seq(0xFF), 0x20);
        assert_eq!(next_seq(0x00), 0x20);
        // k-th send property: seq = 0x20 + ((k-1) mod 0xDF)
        let mut seq = SEQ_MIN;
        for k in 1..=500u32 {
            assert_eq!(seq as u32, 0x20 + ((k - 1) % 0xDF));
            seq = next_seq(seq);
        }
    }

    #[test]
    fn test_negative_first_field_is_error_code() {
        let resp = DatecsResponse {
            cmd: 0x30,
            seq: 0x20,
            data: Vec::new(),
            fields: vec!["-112001".into(), "x".into()],
            status: Vec::new(),
        };
        assert_eq!(resp.error_code(), Some(-112001));
        let ok = DatecsResponse {
            fields: vec!["0".into()],
            ..resp
        };
        assert_eq!(ok.error_code(), None);
    }

    #[test]
    fn test_decode_fields_cp1251() {
        // "Хляб" in cp1251
        let raw = [0xD5, 0xEB, 0xFF, 0xE1, b'\t', b'B'];
        let fields = decode_fields(&raw, WINDOWS_1251);
        assert_eq!(fields, vec!["Хляб".to_string(), "B".to_string()]);
    }
}
