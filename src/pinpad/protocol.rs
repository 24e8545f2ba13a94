//! DatecsPay pinpad wire protocol (v1.9).
//!
//! Packet format, completely different from the Datecs fiscal protocol:
//!
//! ```text
//! EXT DEVICE -> CARD READER:  '>' CMD 00 LH LL <DATA> CSUM
//! CARD READER -> EXT DEVICE:  '>' 00  ST LH LL <DATA> CSUM
//! ```
//!
//! CSUM is the XOR of every preceding byte, the start byte included. The
//! reader may volunteer event packets (`TYPE` 0x0E/0x0F/0x0B) at any moment,
//! including between a request and its response, so the link keeps a small
//! pending-events buffer that the transaction loop drains first.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::applog::log_info;
use crate::error::{GatewayError, Result};
use crate::pinpad::tlv::{self, TagMap};
use crate::transport::{hex_string, Transport};

pub const START_BYTE: u8 = 0x3E; // '>'
pub const CMD_BORICA: u8 = 0x3D;
pub const CMD_EXT_INTERNET: u8 = 0x40;
pub const EVT_BORICA: u8 = 0x0E;
pub const EVT_EXT_INTERNET: u8 = 0x0F;
pub const EVT_EMV: u8 = 0x0B;

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

// Borica subcommands (CMD 0x3D payload byte 0)
pub const BOR_PING: u8 = 0x00;
pub const BOR_TRANSACTION_START: u8 = 0x01;
pub const BOR_GET_RECEIPT_TAGS: u8 = 0x02;
pub const BOR_TRANSACTION_END: u8 = 0x03;
pub const BOR_GET_REPORT_INFO: u8 = 0x05;
pub const BOR_GET_PINPAD_INFO: u8 = 0x06;
pub const BOR_GET_PINPAD_STATUS: u8 = 0x1A;
pub const BOR_GET_CARD_READER_STATE: u8 = 0x26;

// Transaction types (TRANSACTION START payload byte 0)
pub const TRANS_PURCHASE: u8 = 0x01;
pub const TRANS_PURCHASE_CASHBACK: u8 = 0x02;
pub const TRANS_PURCHASE_REFERENCE: u8 = 0x03;
pub const TRANS_VOID_PURCHASE: u8 = 0x07;
pub const TRANS_END_OF_DAY: u8 = 0x0A;
pub const TRANS_TEST_CONNECTION: u8 = 0x0E;

// Borica subevents
pub const BOREVT_TRANSACTION_COMPLETE: u8 = 0x01;
pub const BOREVT_INTERMEDIATE_COMPLETE: u8 = 0x02;
pub const BOREVT_PRINT_HANG_RECEIPT: u8 = 0x03;

// External internet subevents
pub const EXTEVT_SOCKET_OPEN: u8 = 0x01;
pub const EXTEVT_SOCKET_CLOSE: u8 = 0x02;
pub const EXTEVT_SEND_DATA: u8 = 0x03;

// External internet subcommands
pub const EXTCMD_RECEIVE_DATA: u8 = 0x01;
pub const EXTCMD_EVENT_CONFIRM: u8 = 0x02;

// Status codes (ST field)
pub const ERR_NO_ERROR: u8 = 0x00;
pub const ERR_NO_DATA: u8 = 0x08;
pub const ERR_BUSY: u8 = 0x26;

pub fn err_name(status: u8) -> &'static str {
    match status {
        0x00 => "errNoErr",
        0x01 => "errGeneral",
        0x02 => "errInvCmd",
        0x03 => "errInvPar",
        0x04 => "errInvAdr",
        0x05 => "errInvVal",
        0x06 => "errInvLen",
        0x07 => "errNoPermit",
        0x08 => "errNoData",
        0x09 => "errTimeOut",
        0x0A => "errKeyNum",
        0x0B => "errKeyAttr",
        0x0C => "errInvDevice",
        0x0D => "errNoSupport",
        0x0E => "errPinLimit",
        0x0F => "errFlash",
        0x10 => "errHard",
        0x12 => "errCancel",
        0x15 => "errInvPass",
        0x17 => "errKeyFormat",
        0x1F => "errNoPerm",
        0x26 => "errBusy",
        0x32 => "errNoConnected",
        0x33 => "errUseChip",
        0x34 => "errEndDay",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Packet shapes
// ---------------------------------------------------------------------------

/// Synchronous response from the card reader.
#[derive(Debug, Clone)]
pub struct PinpadResponse {
    pub status: u8,
    pub data: Vec<u8>,
}

impl PinpadResponse {
    pub fn ok(&self) -> bool {
        self.status == ERR_NO_ERROR
    }

    pub fn no_data(&self) -> bool {
        self.status == ERR_NO_DATA
    }

    pub fn status_name(&self) -> &'static str {
        err_name(self.status)
    }
}

/// Asynchronous event from the card reader.
#[derive(Debug, Clone)]
pub struct PinpadEvent {
    pub event_type: u8,
    pub subevent: u8,
    pub data: Vec<u8>,
}

fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Build an EXT DEVICE -> CARD READER packet.
pub fn build_packet(cmd: u8, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(data.len() + 6);
    packet.push(START_BYTE);
    packet.push(cmd);
    packet.push(0x00);
    packet.push((data.len() >> 8) as u8);
    packet.push(data.len() as u8);
    packet.extend_from_slice(data);
    packet.push(xor_checksum(&packet));
    packet
}

/// Parse a CARD READER -> EXT DEVICE response packet.
pub fn parse_response_packet(raw: &[u8]) -> Result<PinpadResponse> {
    if raw.len() < 6 {
        return Err(GatewayError::framing(format!(
            "response too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0] != START_BYTE {
        return Err(GatewayError::framing(format!(
            "invalid start byte 0x{:02X}",
            raw[0]
        )));
    }
    if raw[1] != 0x00 {
        return Err(GatewayError::framing(format!(
            "invalid fixed byte 0x{:02X}",
            raw[1]
        )));
    }
    let data_len = ((raw[3] as usize) << 8) | raw[4] as usize;
    let expected = 5 + data_len + 1;
    if raw.len() < expected {
        return Err(GatewayError::framing(format!(
            "response incomplete: got {}, expected {expected}",
            raw.len()
        )));
    }
    let csum_received = raw[5 + data_len];
    let csum_computed = xor_checksum(&raw[..5 + data_len]);
    if csum_received != csum_computed {
        return Err(GatewayError::framing(format!(
            "checksum mismatch: received 0x{csum_received:02X}, computed 0x{csum_computed:02X}"
        )));
    }
    Ok(PinpadResponse {
        status: raw[2],
        data: raw[5..5 + data_len].to_vec(),
    })
}

/// Parse an asynchronous event packet. The payload's first byte is the
/// sub-event.
pub fn parse_event_packet(raw: &[u8]) -> Result<PinpadEvent> {
    if raw.len() < 6 {
        return Err(GatewayError::framing(format!(
            "event too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0] != START_BYTE {
        return Err(GatewayError::framing(format!(
            "invalid start byte 0x{:02X}",
            raw[0]
        )));
    }
    let data_len = ((raw[3] as usize) << 8) | raw[4] as usize;
    let expected = 5 + data_len + 1;
    if raw.len() < expected {
        return Err(GatewayError::framing(format!(
            "event incomplete: got {}, expected {expected}",
            raw.len()
        )));
    }
    let csum_received = raw[5 + data_len];
    let csum_computed = xor_checksum(&raw[..5 + data_len]);
    if csum_received != csum_computed {
        return Err(GatewayError::framing("event checksum mismatch"));
    }
    let payload = &raw[5..5 + data_len];
    Ok(PinpadEvent {
        event_type: raw[1],
        subevent: payload.first().copied().unwrap_or(0),
        data: payload.get(1..).unwrap_or_default().to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Link: byte stream + pending-events buffer
// ---------------------------------------------------------------------------

/// One opened conversation with a card reader.
///
/// Owns the transport and the pending-events buffer for its duration; never
/// shared across sessions.
pub struct PinpadLink<'a> {
    pub transport: &'a mut dyn Transport,
    pending: VecDeque<Vec<u8>>,
    pub cid: String,
}

impl<'a> PinpadLink<'a> {
    pub fn new(transport: &'a mut dyn Transport, cid: String) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
            cid,
        }
    }

    /// Read one complete packet: wait for the start byte, then the header
    /// gives the total length.
    fn read_packet(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buffer: Vec<u8> = Vec::new();
        let mut saw_start = false;

        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = self
                .transport
                .read(1, remaining.min(Duration::from_millis(50)))?;
            let Some(&byte) = chunk.first() else {
                continue;
            };
            if !saw_start {
                if byte != START_BYTE {
                    continue;
                }
                saw_start = true;
            }
            buffer.push(byte);
            if buffer.len() >= 5 {
                let data_len = ((buffer[3] as usize) << 8) | buffer[4] as usize;
                if buffer.len() >= 5 + data_len + 1 {
                    return Ok(buffer);
                }
            }
        }
        Err(GatewayError::Timeout(timeout))
    }

    /// Next packet for the transaction loop: queued events first, then the
    /// wire.
    pub fn read_any(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if let Some(raw) = self.pending.pop_front() {
            return Ok(raw);
        }
        self.read_packet(timeout)
    }

    pub fn drain_pending(&mut self) -> Vec<Vec<u8>> {
        self.pending.drain(..).collect()
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Send a command and wait for its response. Event packets observed
    /// before the response are queued for the transaction loop.
    pub fn send_command(
        &mut self,
        cmd: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<PinpadResponse> {
        let packet = build_packet(cmd, data);
        log_info(
            "PINPAD_SEND",
            json!({
                "cmd": format!("0x{cmd:02X}"),
                "data_hex": hex_string(data),
                "packet_len": packet.len(),
                "correlation_id": self.cid,
            }),
        );
        self.transport.write(&packet)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::Timeout(timeout));
            }
            let raw = self.read_packet(remaining)?;
            if raw.get(1) == Some(&0x00) {
                let response = parse_response_packet(&raw)?;
                log_info(
                    "PINPAD_RECV",
                    json!({
                        "status": format!("0x{:02X}", response.status),
                        "status_name": response.status_name(),
                        "data_len": response.data.len(),
                        "correlation_id": self.cid,
                    }),
                );
                return Ok(response);
            }
            // An event slipped in ahead of our response.
            log_info(
                "PINPAD_EVENT_QUEUED",
                json!({
                    "pkt_type": raw.get(1).map(|b| format!("0x{b:02X}")),
                    "raw_len": raw.len(),
                    "correlation_id": self.cid,
                }),
            );
            self.pending.push_back(raw);
        }
    }

    /// Send a Borica subcommand (CMD 0x3D).
    pub fn borica(&mut self, subcmd: u8, data: &[u8], timeout: Duration) -> Result<PinpadResponse> {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(subcmd);
        payload.extend_from_slice(data);
        self.send_command(CMD_BORICA, &payload, timeout)
    }

    /// Send an External Internet subcommand (CMD 0x40).
    pub fn ext_internet(
        &mut self,
        subcmd: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<PinpadResponse> {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(subcmd);
        payload.extend_from_slice(data);
        self.send_command(CMD_EXT_INTERNET, &payload, timeout)
    }
}

// ---------------------------------------------------------------------------
// Parsed command results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PinpadInfo {
    pub model: String,
    pub serial_number: String,
    pub software_version: String,
    pub terminal_id: String,
    pub menu_type: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct PinpadStatus {
    /// 0x00 = none, 0x52 'R' = reversal pending, 0x43 'C' = hung transaction.
    pub reversal: u8,
    pub end_day_required: bool,
}

impl PinpadStatus {
    pub fn has_reversal(&self) -> bool {
        self.reversal == b'R'
    }

    pub fn has_hang_transaction(&self) -> bool {
        self.reversal == b'C'
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CardReaderState {
    pub state: u8,
}

impl CardReaderState {
    pub fn name(&self) -> &'static str {
        match self.state {
            1 => "idle",
            2 => "transaction_started",
            3 => "select_application",
            4 => "pin_entry",
            5 => "online_authorization",
            _ => "unknown",
        }
    }
}

fn ascii_field(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect::<String>()
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

pub fn ping(link: &mut PinpadLink) -> bool {
    matches!(link.borica(BOR_PING, &[], RESPONSE_TIMEOUT), Ok(r) if r.ok())
}

pub fn get_pinpad_info(link: &mut PinpadLink) -> Result<PinpadInfo> {
    let resp = link.borica(BOR_GET_PINPAD_INFO, &[], RESPONSE_TIMEOUT)?;
    if !resp.ok() {
        return Err(GatewayError::PinpadStatus {
            status: resp.status,
            name: resp.status_name(),
        });
    }
    let d = &resp.data;
    if d.len() < 43 {
        return Err(GatewayError::framing(format!(
            "GET PINPAD INFO response too short: {} bytes",
            d.len()
        )));
    }
    Ok(PinpadInfo {
        model: ascii_field(&d[0..20]),
        serial_number: ascii_field(&d[20..30]),
        software_version: format!("{}.{}.{}.{}", d[30], d[31], d[32], d[33]),
        terminal_id: ascii_field(&d[34..42]),
        menu_type: d[42],
    })
}

pub fn get_pinpad_status(link: &mut PinpadLink) -> Result<PinpadStatus> {
    let resp = link.borica(BOR_GET_PINPAD_STATUS, &[], RESPONSE_TIMEOUT)?;
    if !resp.ok() {
        return Err(GatewayError::PinpadStatus {
            status: resp.status,
            name: resp.status_name(),
        });
    }
    if resp.data.len() < 2 {
        return Err(GatewayError::framing("GET PINPAD STATUS response too short"));
    }
    Ok(PinpadStatus {
        reversal: resp.data[0],
        end_day_required: resp.data[1] != 0,
    })
}

pub fn get_card_reader_state(link: &mut PinpadLink) -> Result<CardReaderState> {
    let resp = link.borica(BOR_GET_CARD_READER_STATE, &[], RESPONSE_TIMEOUT)?;
    if !resp.ok() {
        return Err(GatewayError::PinpadStatus {
            status: resp.status,
            name: resp.status_name(),
        });
    }
    let state = *resp
        .data
        .first()
        .ok_or_else(|| GatewayError::framing("GET CARD READER STATE response too short"))?;
    Ok(CardReaderState { state })
}

/// Count of records in the terminal's transaction log.
pub fn get_report_info(link: &mut PinpadLink) -> Result<u16> {
    let resp = link.borica(BOR_GET_REPORT_INFO, &[], RESPONSE_TIMEOUT)?;
    if !resp.ok() {
        return Err(GatewayError::PinpadStatus {
            status: resp.status,
            name: resp.status_name(),
        });
    }
    if resp.data.len() < 2 {
        return Ok(0);
    }
    Ok(((resp.data[0] as u16) << 8) | resp.data[1] as u16)
}

/// Receipt tags for the last completed transaction.
pub fn get_receipt_tags(link: &mut PinpadLink) -> Result<TagMap> {
    let tag_bytes = tlv::encode_tag_list(tlv::tag::RECEIPT_ALL);
    let resp = link.borica(BOR_GET_RECEIPT_TAGS, &tag_bytes, RESPONSE_TIMEOUT)?;
    if resp.no_data() {
        return Ok(TagMap::new());
    }
    if !resp.ok() {
        return Err(GatewayError::PinpadStatus {
            status: resp.status,
            name: resp.status_name(),
        });
    }
    Ok(tlv::decode(&resp.data))
}

/// TRANSACTION END acknowledgement; must follow every transaction. Signals
/// success iff the result code was 0.
pub fn transaction_end(link: &mut PinpadLink, success: bool) -> Result<PinpadResponse> {
    let cfm: [u8; 2] = if success { [0x00, 0x01] } else { [0x00, 0x00] };
    link.borica(BOR_TRANSACTION_END, &cfm, RESPONSE_TIMEOUT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Mock transport fed with canned packets, one read byte at a time.
    pub(crate) struct MockTransport {
        pub sent: Vec<Vec<u8>>,
        pub incoming: VecDeque<u8>,
    }

    impl MockTransport {
        pub fn new(packets: Vec<Vec<u8>>) -> Self {
            Self {
                sent: Vec::new(),
                incoming: packets.into_iter().flatten().collect(),
            }
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }
        fn read(&mut self, max: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let take = max.min(1);
            let mut out = Vec::with_capacity(take);
            if let Some(b) = self.incoming.pop_front() {
                out.push(b);
            }
            Ok(out)
        }
        fn description(&self) -> String {
            "Mock".into()
        }
    }

    /// Frame a device-originated packet (response or event).
    pub(crate) fn device_packet(pkt_type: u8, third: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![
            START_BYTE,
            pkt_type,
            third,
            (payload.len() >> 8) as u8,
            payload.len() as u8,
        ];
        packet.extend_from_slice(payload);
        packet.push(xor_checksum(&packet));
        packet
    }

    pub(crate) fn response_packet(status: u8, data: &[u8]) -> Vec<u8> {
        device_packet(0x00, status, data)
    }

    pub(crate) fn event_packet(event_type: u8, subevent: u8, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![subevent];
        payload.extend_from_slice(data);
        // Event frames carry the length directly after the fixed zero.
        device_packet(event_type, 0x00, &payload)
    }

    #[test]
    fn test_build_packet_layout_and_checksum() {
        let packet = build_packet(CMD_BORICA, &[0x01, 0x81, 0x04, 0x00, 0x00, 0x04, 0xD2]);
        assert_eq!(packet[0], START_BYTE);
        assert_eq!(packet[1], CMD_BORICA);
        assert_eq!(packet[2], 0x00);
        assert_eq!(packet[3], 0x00);
        assert_eq!(packet[4], 0x07);
        let csum = *packet.last().unwrap();
        assert_eq!(csum, xor_checksum(&packet[..packet.len() - 1]));
    }

    #[test]
    fn test_response_round_trip() {
        let raw = response_packet(ERR_NO_ERROR, &[0xAA, 0xBB]);
        let resp = parse_response_packet(&raw).unwrap();
        assert!(resp.ok());
        assert_eq!(resp.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_response_rejects_bad_checksum() {
        let mut raw = response_packet(ERR_NO_ERROR, &[0xAA]);
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(parse_response_packet(&raw).is_err());
    }

    #[test]
    fn test_event_round_trip() {
        let raw = event_packet(EVT_BORICA, BOREVT_TRANSACTION_COMPLETE, &[0x01, 0x02]);
        let event = parse_event_packet(&raw).unwrap();
        assert_eq!(event.event_type, EVT_BORICA);
        assert_eq!(event.subevent, BOREVT_TRANSACTION_COMPLETE);
        assert_eq!(event.data, vec![0x01, 0x02]);
    }

    #[test]
    fn test_send_command_queues_events_before_response() {
        let event = event_packet(EVT_EMV, 0x82, &[0x00, 0xC1, 0x02, 0x00, 0x15]);
        let response = response_packet(ERR_NO_ERROR, &[]);
        let mut transport = MockTransport::new(vec![event.clone(), response]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());

        let resp = link
            .send_command(CMD_BORICA, &[BOR_PING], Duration::from_secs(1))
            .unwrap();
        assert!(resp.ok());
        let pending = link.drain_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0], event);
    }

    #[test]
    fn test_read_any_prefers_pending() {
        let event = event_packet(EVT_BORICA, BOREVT_INTERMEDIATE_COMPLETE, &[]);
        let response = response_packet(ERR_NO_ERROR, &[]);
        let mut transport = MockTransport::new(vec![event.clone(), response]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());
        link.send_command(CMD_BORICA, &[BOR_PING], Duration::from_secs(1))
            .unwrap();
        let next = link.read_any(Duration::from_millis(10)).unwrap();
        assert_eq!(next, event);
    }

    #[test]
    fn test_get_pinpad_status_parses_hang_marker() {
        let response = response_packet(ERR_NO_ERROR, &[b'C', 0x01]);
        let mut transport = MockTransport::new(vec![response]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());
        let status = get_pinpad_status(&mut link).unwrap();
        assert!(status.has_hang_transaction());
        assert!(!status.has_reversal());
        assert!(status.end_day_required);
    }

    #[test]
    fn test_get_pinpad_info_layout() {
        let mut data = Vec::new();
        data.extend_from_slice(b"BluePad-55          "); // 20 model
        data.extend_from_slice(b"SN12345678"); // 10 serial
        data.extend_from_slice(&[1, 9, 0, 4]); // 4 version
        data.extend_from_slice(b"T1234567"); // 8 terminal id
        data.push(2); // menu type
        let response = response_packet(ERR_NO_ERROR, &data);
        let mut transport = MockTransport::new(vec![response]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());
        let info = get_pinpad_info(&mut link).unwrap();
        assert_eq!(info.model, "BluePad-55");
        assert_eq!(info.serial_number, "SN12345678");
        assert_eq!(info.software_version, "1.9.0.4");
        assert_eq!(info.terminal_id, "T1234567");
        assert_eq!(info.menu_type, 2);
    }

    #[test]
    fn test_transaction_end_acknowledgement_bytes() {
        let mut transport = MockTransport::new(vec![
            response_packet(ERR_NO_ERROR, &[]),
            response_packet(ERR_NO_ERROR, &[]),
        ]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());
        transaction_end(&mut link, true).unwrap();
        transaction_end(&mut link, false).unwrap();
        // payload = subcmd 0x03 + two-byte confirmation
        assert_eq!(&transport.sent[0][5..8], &[BOR_TRANSACTION_END, 0x00, 0x01]);
        assert_eq!(&transport.sent[1][5..8], &[BOR_TRANSACTION_END, 0x00, 0x00]);
    }

    #[test]
    fn test_err_names() {
        assert_eq!(err_name(0x26), "errBusy");
        assert_eq!(err_name(0x00), "errNoErr");
        assert_eq!(err_name(0xEE), "unknown");
    }
}
