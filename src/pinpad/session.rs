//! Pinpad transaction session.
//!
//! A card transaction is a nested dialogue: after TRANSACTION START the
//! reader streams asynchronous events until TRANSACTION COMPLETE, and during
//! that window it may ask the gateway to open, write to, read from, and
//! close TCP/UDP sockets on its behalf (readers without their own internet
//! connectivity). The loop pumps three sources each iteration: the
//! pending-events buffer, the open proxy sockets, and the wire.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::applog::{log_error, log_info, log_warning};
use crate::error::{GatewayError, Result};
use crate::models::{val_f64, val_str, PayloadKind, Printer};
use crate::pinpad::protocol::{self, PinpadEvent, PinpadLink};
use crate::pinpad::tlv::{self, tag, TagMap};
use crate::transport::{create_transport, hex_string};

/// RECEIVE_DATA chunk ceiling, also advertised in EVENT CONFIRM.
pub const MTU: usize = 0x0400;

const END_OF_DAY_TIMEOUT: Duration = Duration::from_secs(300);
const HUNG_CLEAR_TIMEOUT: Duration = Duration::from_secs(60);
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Transaction result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TransactionResult {
    pub approved: bool,
    pub result_code: u64,
    pub error_code: u64,
    pub host_error_code: u64,
    /// Minor units.
    pub amount: u64,
    pub stan: u64,
    pub rrn: String,
    pub auth_id: String,
    pub card_scheme: String,
    pub masked_pan: String,
    pub cardholder_name: String,
    pub terminal_id: String,
    pub merchant_id: String,
    pub merchant_name: String,
    pub trans_type: u64,
    pub trans_date: String,
    pub trans_time: String,
    /// 0 = chip, 1 = contactless, 2 = magstripe, 3 = manual.
    pub interface: u64,
    pub batch_num: u64,
    pub currency: String,
    pub tags: TagMap,
}

/// Decode the TLV blob of a TRANSACTION COMPLETE event.
pub fn parse_transaction_complete(event_data: &[u8]) -> TransactionResult {
    let tags = tlv::decode(event_data);
    let result_code = tlv::get_int(&tags, tag::TRANSACTION_RESULT);
    TransactionResult {
        approved: result_code == 0,
        result_code,
        error_code: tlv::get_int(&tags, tag::TRANSACTION_ERROR),
        amount: tlv::get_int(&tags, tag::AMOUNT),
        stan: tlv::get_int(&tags, tag::EMV_STAN),
        tags,
        ..Default::default()
    }
}

/// Merge the receipt-tag map into the result and derive the named fields.
pub fn enrich_with_receipt_tags(mut result: TransactionResult, receipt: TagMap) -> TransactionResult {
    result.tags.extend(receipt);
    let tags = &result.tags;
    result.rrn = tlv::get_str(tags, tag::HOST_RRN);
    result.auth_id = tlv::get_str(tags, tag::HOST_AUTH_ID);
    result.host_error_code = tlv::get_int(tags, tag::HOST_CODE);
    result.card_scheme = tlv::get_str(tags, tag::CARD_SCHEME);
    result.masked_pan = tlv::get_str(tags, tag::MASKED_PAN);
    result.cardholder_name = tlv::get_str(tags, tag::CARDHOLDER_NAME);
    result.terminal_id = tlv::get_str(tags, tag::TERMINAL_ID);
    result.merchant_id = tlv::get_str(tags, tag::MERCHANT_ID);
    result.merchant_name = tlv::get_str(tags, tag::MERCHANT_NAME_BG);
    result.trans_type = tlv::get_int(tags, tag::TRANS_TYPE);
    result.interface = tlv::get_int(tags, tag::PAY_INTERFACE);
    result.batch_num = tlv::get_int(tags, tag::BATCH_NUM);
    result.currency = tlv::get_str(tags, tag::CURRENCY_NAME);
    let amount = tlv::get_int(tags, tag::AMOUNT);
    if amount != 0 {
        result.amount = amount;
    }
    // BCD date/time
    if let Some(date) = tags.get(&tag::TRANS_DATE).filter(|v| v.len() == 3) {
        result.trans_date = format!("20{:02X}-{:02X}-{:02X}", date[0], date[1], date[2]);
    }
    if let Some(time) = tags.get(&tag::TRANS_TIME).filter(|v| v.len() == 3) {
        result.trans_time = format!("{:02X}:{:02X}:{:02X}", time[0], time[1], time[2]);
    }
    result
}

// ---------------------------------------------------------------------------
// Socket proxy
// ---------------------------------------------------------------------------

enum ProxySocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// OS sockets held on behalf of the card reader, keyed by the single-byte
/// id the device assigns.
#[derive(Default)]
struct SocketProxy {
    sockets: HashMap<u8, ProxySocket>,
}

impl SocketProxy {
    fn open(&mut self, id: u8, sock_type: u8, addr: Ipv4Addr, port: u16, timeout_s: u16) -> bool {
        let timeout = Duration::from_secs(timeout_s.max(1) as u64);
        let target = SocketAddr::from((addr, port));
        let opened = if sock_type == 1 || sock_type == 3 {
            TcpStream::connect_timeout(&target, timeout)
                .map(ProxySocket::Tcp)
                .map_err(|e| e.to_string())
        } else {
            UdpSocket::bind(("0.0.0.0", 0))
                .and_then(|s| s.connect(target).map(|_| s))
                .map(ProxySocket::Udp)
                .map_err(|e| e.to_string())
        };
        match opened {
            Ok(socket) => {
                self.sockets.insert(id, socket);
                log_info(
                    "PINPAD_SOCKET_OPEN",
                    json!({"id": id, "addr": addr.to_string(), "port": port, "type": sock_type}),
                );
                true
            }
            Err(error) => {
                log_error(
                    "PINPAD_SOCKET_OPEN_FAIL",
                    json!({"id": id, "addr": addr.to_string(), "port": port, "error": error}),
                );
                false
            }
        }
    }

    fn close(&mut self, id: u8) -> bool {
        if self.sockets.remove(&id).is_some() {
            log_info("PINPAD_SOCKET_CLOSE", json!({"id": id}));
            true
        } else {
            false
        }
    }

    fn send(&mut self, id: u8, data: &[u8]) -> bool {
        let Some(socket) = self.sockets.get_mut(&id) else {
            log_error("PINPAD_SOCKET_SEND_NO_SOCKET", json!({"id": id}));
            return false;
        };
        let outcome = match socket {
            ProxySocket::Tcp(stream) => stream.write_all(data).map_err(|e| e.to_string()),
            ProxySocket::Udp(socket) => socket.send(data).map(|_| ()).map_err(|e| e.to_string()),
        };
        match outcome {
            Ok(()) => {
                log_info("PINPAD_SOCKET_SEND", json!({"id": id, "len": data.len()}));
                true
            }
            Err(error) => {
                log_error("PINPAD_SOCKET_SEND_FAIL", json!({"id": id, "error": error}));
                false
            }
        }
    }

    /// Poll the socket once; `None` when nothing arrived inside `timeout`.
    fn receive(&mut self, id: u8, timeout: Duration) -> Option<Vec<u8>> {
        let socket = self.sockets.get_mut(&id)?;
        let mut buf = vec![0u8; 16384];
        let received = match socket {
            ProxySocket::Tcp(stream) => {
                stream.set_read_timeout(Some(timeout)).ok()?;
                stream.read(&mut buf)
            }
            ProxySocket::Udp(socket) => {
                socket.set_read_timeout(Some(timeout)).ok()?;
                socket.recv(&mut buf)
            }
        };
        match received {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                log_info("PINPAD_SOCKET_RECV", json!({"id": id, "len": n}));
                Some(buf)
            }
            Err(_) => None,
        }
    }

    fn ids(&self) -> Vec<u8> {
        self.sockets.keys().copied().collect()
    }

    fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn close_all(&mut self) {
        for id in self.ids() {
            self.close(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Event handling
// ---------------------------------------------------------------------------

/// Forward a reader-bound payload as RECEIVE_DATA chunks of at most MTU
/// bytes, waiting out BUSY rejections.
fn forward_to_reader(link: &mut PinpadLink, data: &[u8]) -> Result<()> {
    for chunk in data.chunks(MTU) {
        loop {
            let resp = link.ext_internet(
                protocol::EXTCMD_RECEIVE_DATA,
                chunk,
                protocol::RESPONSE_TIMEOUT,
            )?;
            if resp.status != protocol::ERR_BUSY {
                break;
            }
            std::thread::sleep(BUSY_RETRY_DELAY);
        }
    }
    Ok(())
}

/// Collect everything the host has to say right now and relay it to the
/// reader. The first poll waits longer; follow-up segments arrive quickly.
fn forward_host_data(link: &mut PinpadLink, proxy: &mut SocketProxy, id: u8) -> Result<()> {
    let mut all_data = Vec::new();
    let mut poll_timeout = Duration::from_secs(5);
    while let Some(chunk) = proxy.receive(id, poll_timeout) {
        all_data.extend_from_slice(&chunk);
        poll_timeout = Duration::from_millis(200);
    }
    if all_data.is_empty() {
        return Ok(());
    }
    log_info(
        "PINPAD_HOST_DATA_TOTAL",
        json!({"sock_id": id, "total_bytes": all_data.len(), "correlation_id": link.cid}),
    );
    forward_to_reader(link, &all_data)
}

/// Handle one External Internet sub-event (the socket-proxy sub-protocol).
fn handle_ext_event(link: &mut PinpadLink, proxy: &mut SocketProxy, event: &PinpadEvent) -> Result<()> {
    match event.subevent {
        protocol::EXTEVT_SOCKET_OPEN => {
            // [ID] [TYPE] <ADDRESS:4> <PORT:2> <TIMEOUT:2>
            let d = &event.data;
            if d.len() < 10 {
                log_warning(
                    "PINPAD_SOCKET_OPEN_SHORT",
                    json!({"len": d.len(), "correlation_id": link.cid}),
                );
                return Ok(());
            }
            let id = d[0];
            let sock_type = d[1];
            let addr = Ipv4Addr::new(d[2], d[3], d[4], d[5]);
            let port = ((d[6] as u16) << 8) | d[7] as u16;
            let timeout_s = ((d[8] as u16) << 8) | d[9] as u16;
            let success = proxy.open(id, sock_type, addr, port, timeout_s);
            let confirm = [
                protocol::EXTEVT_SOCKET_OPEN,
                if success { 0x00 } else { 0x01 },
                (MTU >> 8) as u8,
                MTU as u8,
            ];
            link.ext_internet(
                protocol::EXTCMD_EVENT_CONFIRM,
                &confirm,
                protocol::RESPONSE_TIMEOUT,
            )?;
        }
        protocol::EXTEVT_SOCKET_CLOSE => {
            let id = event.data.first().copied().unwrap_or(0);
            proxy.close(id);
            link.ext_internet(
                protocol::EXTCMD_EVENT_CONFIRM,
                &[protocol::EXTEVT_SOCKET_CLOSE, 0x00],
                protocol::RESPONSE_TIMEOUT,
            )?;
        }
        protocol::EXTEVT_SEND_DATA => {
            let id = event.data.first().copied().unwrap_or(0);
            let payload = event.data.get(1..).unwrap_or_default();
            let success = proxy.send(id, payload);
            let confirm = [
                protocol::EXTEVT_SEND_DATA,
                if success { 0x00 } else { 0x01 },
            ];
            link.ext_internet(
                protocol::EXTCMD_EVENT_CONFIRM,
                &confirm,
                protocol::RESPONSE_TIMEOUT,
            )?;
            // The host usually answers right away; relay its reply.
            std::thread::sleep(Duration::from_millis(50));
            forward_host_data(link, proxy, id)?;
        }
        other => {
            log_warning(
                "PINPAD_EXT_EVENT_UNKNOWN",
                json!({"subevent": format!("0x{other:02X}"), "correlation_id": link.cid}),
            );
        }
    }
    Ok(())
}

/// EMV USER_INTERFACE message ids (protocol v1.9).
fn emv_message(msg_id: u16) -> &'static str {
    match msg_id {
        0x0010 => "Remove card",
        0x0015 => "Present card",
        0x0016 => "Processing",
        0x0017 => "Card read OK. Please remove card",
        0x0018 => "Try other interface",
        0x001B => "Online authorization",
        0x001C => "Try other card",
        0x001D => "Insert card",
        0x0020 => "See phone",
        0x0021 => "Present card again",
        0x00F0 => "Please use the chip reader",
        0x00F1 => "Please insert, read or try another card",
        _ => "unknown",
    }
}

/// Process one raw packet inside the transaction loop. `Some(result)` means
/// TRANSACTION COMPLETE arrived.
fn process_packet(
    link: &mut PinpadLink,
    proxy: &mut SocketProxy,
    raw: &[u8],
) -> Result<Option<TransactionResult>> {
    let pkt_type = raw.get(1).copied().unwrap_or(0xFF);
    match pkt_type {
        0x00 => {
            log_warning(
                "PINPAD_TXLOOP_UNEXPECTED_RESP",
                json!({"raw_hex": hex_string(&raw[..raw.len().min(32)]), "correlation_id": link.cid}),
            );
            Ok(None)
        }
        protocol::EVT_BORICA => {
            let event = protocol::parse_event_packet(raw)?;
            log_info(
                "PINPAD_BORICA_EVENT",
                json!({
                    "subevent": format!("0x{:02X}", event.subevent),
                    "data_len": event.data.len(),
                    "correlation_id": link.cid,
                }),
            );
            match event.subevent {
                protocol::BOREVT_TRANSACTION_COMPLETE => {
                    log_info(
                        "PINPAD_TX_COMPLETE",
                        json!({"data_len": event.data.len(), "correlation_id": link.cid}),
                    );
                    Ok(Some(parse_transaction_complete(&event.data)))
                }
                protocol::BOREVT_INTERMEDIATE_COMPLETE => {
                    // A hung predecessor transaction just finalised.
                    log_warning(
                        "PINPAD_INTERMEDIATE_COMPLETE",
                        json!({"data_hex": hex_string(&event.data), "correlation_id": link.cid}),
                    );
                    Ok(None)
                }
                protocol::BOREVT_PRINT_HANG_RECEIPT => {
                    log_warning(
                        "PINPAD_HANG_RECEIPT",
                        json!({"data_len": event.data.len(), "correlation_id": link.cid}),
                    );
                    Ok(None)
                }
                _ => Ok(None),
            }
        }
        protocol::EVT_EXT_INTERNET => {
            let event = protocol::parse_event_packet(raw)?;
            log_info(
                "PINPAD_EXT_INTERNET_EVENT",
                json!({
                    "subevent": format!("0x{:02X}", event.subevent),
                    "data_len": event.data.len(),
                    "correlation_id": link.cid,
                }),
            );
            handle_ext_event(link, proxy, &event)?;
            Ok(None)
        }
        protocol::EVT_EMV => {
            let event = protocol::parse_event_packet(raw)?;
            let mut message = String::new();
            // USER_INTERFACE payload: 00 C1 02 <MSG_HI> <MSG_LO>
            if event.subevent == 0x82 && event.data.len() >= 4 {
                let d = &event.data;
                if d[0] == 0x00 && d[1] == 0xC1 && d[2] == 0x02 {
                    let msg_id = if d.len() >= 5 {
                        ((d[3] as u16) << 8) | d[4] as u16
                    } else {
                        d[3] as u16
                    };
                    message = emv_message(msg_id).to_string();
                }
            }
            log_info(
                "PINPAD_EMV_EVENT",
                json!({
                    "subevent": format!("0x{:02X}", event.subevent),
                    "message": message,
                    "correlation_id": link.cid,
                }),
            );
            Ok(None)
        }
        other => {
            log_warning(
                "PINPAD_TXLOOP_UNKNOWN_PKT",
                json!({
                    "pkt_type": format!("0x{other:02X}"),
                    "raw_hex": hex_string(&raw[..raw.len().min(48)]),
                    "correlation_id": link.cid,
                }),
            );
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction loop
// ---------------------------------------------------------------------------

/// Pump events until TRANSACTION COMPLETE or the deadline. Proxy sockets and
/// the pending-events buffer are cleaned up on every exit path.
pub fn transaction_loop(link: &mut PinpadLink, timeout: Duration) -> Result<TransactionResult> {
    let mut proxy = SocketProxy::default();
    log_info(
        "PINPAD_TXLOOP_START",
        json!({"timeout_s": timeout.as_secs(), "correlation_id": link.cid}),
    );
    let result = transaction_loop_inner(link, &mut proxy, timeout);
    proxy.close_all();
    link.clear_pending();
    log_info("PINPAD_TXLOOP_END", json!({"correlation_id": link.cid}));
    result
}

fn transaction_loop_inner(
    link: &mut PinpadLink,
    proxy: &mut SocketProxy,
    timeout: Duration,
) -> Result<TransactionResult> {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        // 1. Events queued while a command awaited its response.
        for raw in link.drain_pending() {
            log_info(
                "PINPAD_TXLOOP_QUEUED",
                json!({
                    "pkt_type": raw.get(1).map(|b| format!("0x{b:02X}")),
                    "raw_len": raw.len(),
                    "correlation_id": link.cid,
                }),
            );
            if let Some(result) = process_packet(link, proxy, &raw)? {
                return Ok(result);
            }
        }

        // 2. Host bytes waiting on any open proxy socket.
        for id in proxy.ids() {
            if let Some(host_data) = proxy.receive(id, Duration::from_millis(50)) {
                forward_to_reader(link, &host_data)?;
            }
        }

        // 3. One packet from the reader. Short timeout while sockets are
        //    open so host data keeps flowing.
        let read_timeout = if proxy.is_empty() {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(100)
        };
        let raw = match link.read_any(read_timeout) {
            Ok(raw) => raw,
            Err(GatewayError::Timeout(_)) => continue,
            Err(e) => return Err(e),
        };
        if raw.len() < 6 {
            log_warning(
                "PINPAD_TXLOOP_SHORT_PKT",
                json!({"raw_len": raw.len(), "raw_hex": hex_string(&raw), "correlation_id": link.cid}),
            );
            continue;
        }
        if let Some(result) = process_packet(link, proxy, &raw)? {
            return Ok(result);
        }
    }
    Err(GatewayError::Timeout(timeout))
}

// ---------------------------------------------------------------------------
// Pre-transaction health check
// ---------------------------------------------------------------------------

/// A reader stuck with a hung transaction (`'C'`) must run a test-connection
/// transaction before anything new starts; a pending reversal (`'R'`)
/// resolves itself on the next transaction.
fn ensure_clean_state(link: &mut PinpadLink) {
    let status = match protocol::get_pinpad_status(link) {
        Ok(status) => status,
        Err(e) => {
            log_warning(
                "PINPAD_PRE_CHECK_FAIL",
                json!({"error": e.to_string(), "correlation_id": link.cid}),
            );
            return;
        }
    };
    log_info(
        "PINPAD_PRE_CHECK",
        json!({
            "reversal": format!("0x{:02X}", status.reversal),
            "end_day_required": status.end_day_required,
            "has_reversal": status.has_reversal(),
            "has_hang_transaction": status.has_hang_transaction(),
            "correlation_id": link.cid,
        }),
    );

    if status.has_hang_transaction() {
        log_warning(
            "PINPAD_HUNG_TX_DETECTED",
            json!({"action": "running_test_connection", "correlation_id": link.cid}),
        );
        match link.borica(
            protocol::BOR_TRANSACTION_START,
            &[protocol::TRANS_TEST_CONNECTION],
            protocol::RESPONSE_TIMEOUT,
        ) {
            Ok(resp) if resp.ok() => match transaction_loop(link, HUNG_CLEAR_TIMEOUT) {
                Ok(result) => {
                    log_info(
                        "PINPAD_HUNG_TX_CLEARED",
                        json!({"approved": result.approved, "correlation_id": link.cid}),
                    );
                    let _ = protocol::transaction_end(link, result.approved);
                }
                Err(e) => log_warning(
                    "PINPAD_HUNG_TX_CLEAR_FAIL",
                    json!({"error": e.to_string(), "correlation_id": link.cid}),
                ),
            },
            Ok(resp) => log_warning(
                "PINPAD_HUNG_TX_CLEAR_FAIL",
                json!({"status": resp.status_name(), "correlation_id": link.cid}),
            ),
            Err(e) => log_warning(
                "PINPAD_HUNG_TX_CLEAR_FAIL",
                json!({"error": e.to_string(), "correlation_id": link.cid}),
            ),
        }
    } else if status.has_reversal() {
        log_warning(
            "PINPAD_REVERSAL_PENDING",
            json!({"correlation_id": link.cid}),
        );
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

fn start_transaction(link: &mut PinpadLink, trans_type: u8, params: &[u8]) -> Result<()> {
    let mut data = Vec::with_capacity(params.len() + 1);
    data.push(trans_type);
    data.extend_from_slice(params);
    let resp = link.borica(
        protocol::BOR_TRANSACTION_START,
        &data,
        protocol::RESPONSE_TIMEOUT,
    )?;
    if !resp.ok() {
        return Err(GatewayError::PinpadStatus {
            status: resp.status,
            name: resp.status_name(),
        });
    }
    Ok(())
}

fn finish_transaction(link: &mut PinpadLink, result: TransactionResult) -> TransactionResult {
    let result = match protocol::get_receipt_tags(link) {
        Ok(receipt) if !receipt.is_empty() => enrich_with_receipt_tags(result, receipt),
        Ok(_) => result,
        Err(e) => {
            log_warning(
                "PINPAD_RECEIPT_TAGS_FAIL",
                json!({"error": e.to_string(), "correlation_id": link.cid}),
            );
            result
        }
    };
    if let Err(e) = protocol::transaction_end(link, result.approved) {
        log_warning(
            "PINPAD_TRANS_END_FAIL",
            json!({"error": e.to_string(), "correlation_id": link.cid}),
        );
    }
    result
}

/// Card purchase, optionally with tip, cashback, or a reference string.
pub fn purchase(
    link: &mut PinpadLink,
    amount_cents: u32,
    tip_cents: u32,
    cashback_cents: u32,
    reference: &str,
    timeout: Duration,
) -> Result<TransactionResult> {
    ensure_clean_state(link);
    log_info(
        "PINPAD_PURCHASE_START",
        json!({
            "amount_cents": amount_cents,
            "tip_cents": tip_cents,
            "cashback_cents": cashback_cents,
            "reference": reference,
            "correlation_id": link.cid,
        }),
    );
    let (trans_type, params) = if tip_cents > 0 {
        let mut p = tlv::encode_amount(tag::AMOUNT, amount_cents);
        p.extend(tlv::encode_amount(tag::TIP, tip_cents));
        (protocol::TRANS_PURCHASE, p)
    } else if cashback_cents > 0 {
        let mut p = tlv::encode_amount(tag::AMOUNT, amount_cents);
        p.extend(tlv::encode_amount(tag::CASHBACK, cashback_cents));
        (protocol::TRANS_PURCHASE_CASHBACK, p)
    } else if !reference.is_empty() {
        let mut p = tlv::encode_amount(tag::AMOUNT, amount_cents);
        p.extend(tlv::encode_str(tag::REFERENCE, reference));
        (protocol::TRANS_PURCHASE_REFERENCE, p)
    } else {
        (
            protocol::TRANS_PURCHASE,
            tlv::encode_amount(tag::AMOUNT, amount_cents),
        )
    };
    start_transaction(link, trans_type, &params)?;
    let result = transaction_loop(link, timeout)?;
    Ok(finish_transaction(link, result))
}

/// Void a previous purchase identified by its RRN and authorization id.
pub fn void_purchase(
    link: &mut PinpadLink,
    amount_cents: u32,
    rrn: &str,
    auth_id: &str,
    timeout: Duration,
) -> Result<TransactionResult> {
    ensure_clean_state(link);
    let mut params = tlv::encode_amount(tag::AMOUNT, amount_cents);
    params.extend(tlv::encode_str(tag::RRN, rrn));
    params.extend(tlv::encode_str(tag::AUTH_ID, auth_id));
    start_transaction(link, protocol::TRANS_VOID_PURCHASE, &params)?;
    let result = transaction_loop(link, timeout)?;
    Ok(finish_transaction(link, result))
}

/// Settlement. Borica end-of-day can be slow, hence the long deadline.
pub fn end_of_day(link: &mut PinpadLink) -> Result<TransactionResult> {
    ensure_clean_state(link);
    start_transaction(link, protocol::TRANS_END_OF_DAY, &[])?;
    let result = transaction_loop(link, END_OF_DAY_TIMEOUT)?;
    Ok(finish_transaction(link, result))
}

/// Test connection to the Borica host.
pub fn test_connection(link: &mut PinpadLink, timeout: Duration) -> Result<TransactionResult> {
    start_transaction(link, protocol::TRANS_TEST_CONNECTION, &[])?;
    let result = transaction_loop(link, timeout)?;
    Ok(finish_transaction(link, result))
}

// ---------------------------------------------------------------------------
// Result tables & JSON rendering
// ---------------------------------------------------------------------------

fn result_name(code: u64) -> &'static str {
    match code {
        0 => "Approved",
        1 => "Declined",
        2 => "Error",
        3 => "Try other interface",
        4 => "Try again",
        _ => "Unknown",
    }
}

fn device_error_text(code: u64) -> &'static str {
    match code {
        0 => "",
        1 => "General error",
        2 => "Invalid command",
        3 => "Invalid parameter",
        5 => "Invalid length",
        7 => "Operation not permitted",
        8 => "No data",
        9 => "Timeout",
        12 => "Invalid device",
        18 => "Operation canceled",
        21 => "Wrong password",
        31 => "Operation not permitted",
        50 => "No connection with host",
        51 => "Please use chip",
        52 => "Please end day",
        _ => "",
    }
}

fn host_error_text(code: u64) -> &'static str {
    match code {
        0 => "",
        4 | 7 => "Pick up card",
        6 => "Technical problem",
        12 => "Invalid transaction",
        13 => "Invalid amount",
        14 => "Invalid card number",
        15 => "Unable to route to issuer",
        33 | 54 => "Expired card",
        36 => "Restricted card",
        37 => "Pick up card, call security",
        38 | 75 => "PIN tries exceeded",
        41 => "Lost card",
        43 => "Stolen card",
        51 => "Insufficient funds",
        52 => "No checking account",
        53 => "No savings account",
        55 => "Incorrect PIN",
        57 => "Not permitted to cardholder",
        58 => "Not permitted to terminal",
        65 => "Withdrawal limit exceeded",
        82 => "Timeout",
        91 | 92 => "Issuer inoperative",
        94 => "Duplicated transaction",
        96 => "System malfunction",
        _ => "",
    }
}

fn interface_name(code: u64) -> &'static str {
    match code {
        0 => "Chip",
        1 => "Contactless",
        2 => "Magnetic stripe",
        3 => "Manual entry",
        _ => "Unknown",
    }
}

/// Human-readable verdict, in Bulgarian for user-facing display.
fn result_message(result: &TransactionResult) -> String {
    match result.result_code {
        0 => "Транзакцията е одобрена".into(),
        1 => {
            let code = result.host_error_code;
            let text = host_error_text(code);
            if text.is_empty() {
                format!("Отказана от хоста (код {code})")
            } else {
                format!("Отказана ({code}). {text}")
            }
        }
        2 => {
            let code = result.error_code;
            let text = device_error_text(code);
            if text.is_empty() {
                format!("Грешка на устройството (код {code})")
            } else {
                format!("Грешка ({code}). {text}")
            }
        }
        3 => "Опитайте с друг интерфейс".into(),
        4 => "Опитайте отново".into(),
        other => format!("Неизвестен резултат ({other})"),
    }
}

fn result_to_json(result: &TransactionResult, cid: &str) -> Value {
    json!({
        "approved": result.approved,
        "result_code": result.result_code,
        "result_name": result_name(result.result_code),
        "result_message": result_message(result),
        "error_code": result.error_code,
        "error_message": device_error_text(result.error_code),
        "host_error_code": result.host_error_code,
        "host_error_message": host_error_text(result.host_error_code),
        "amount": result.amount,
        "amount_display": format!("{}.{:02}", result.amount / 100, result.amount % 100),
        "stan": result.stan,
        "rrn": result.rrn,
        "auth_id": result.auth_id,
        "card_scheme": result.card_scheme,
        "masked_pan": result.masked_pan,
        "cardholder_name": result.cardholder_name,
        "terminal_id": result.terminal_id,
        "merchant_id": result.merchant_id,
        "merchant_name": result.merchant_name,
        "trans_type": result.trans_type,
        "trans_date": result.trans_date,
        "trans_time": result.trans_time,
        "interface": result.interface,
        "interface_name": interface_name(result.interface),
        "batch_num": result.batch_num,
        "currency": result.currency,
        "correlation_id": cid,
    })
}

// ---------------------------------------------------------------------------
// Operation dispatch
// ---------------------------------------------------------------------------

fn amount_cents(payload: &Value, key: &str) -> u32 {
    val_f64(payload, &[key])
        .map(|v| (v * 100.0).round().max(0.0) as u32)
        .unwrap_or(0)
}

/// Run one pinpad operation over a freshly opened, scoped transport.
pub fn pinpad_operation(
    printer: &Printer,
    kind: PayloadKind,
    payload: &Value,
    dry_run: bool,
) -> Result<Value> {
    let cid = Uuid::new_v4().simple().to_string();
    if dry_run {
        log_info(
            "DRY_RUN_PINPAD",
            json!({
                "printer_id": printer.id,
                "payload_type": kind.as_str(),
                "payload": payload,
                "correlation_id": cid,
            }),
        );
        return Ok(json!({"dry_run": true, "correlation_id": cid}));
    }

    let mut transport = create_transport(printer, false)?;
    transport.open()?;
    let mut link = PinpadLink::new(transport.as_mut(), cid.clone());
    let result = run_operation(&mut link, kind, payload);
    transport.close();
    result
}

fn run_operation(link: &mut PinpadLink, kind: PayloadKind, payload: &Value) -> Result<Value> {
    let cid = link.cid.clone();
    let timeout = protocol::TRANSACTION_TIMEOUT;
    match kind {
        PayloadKind::PinpadPing => {
            let alive = protocol::ping(link);
            Ok(json!({"alive": alive, "correlation_id": cid}))
        }
        PayloadKind::PinpadInfo => {
            let info = protocol::get_pinpad_info(link)?;
            Ok(json!({
                "model": info.model,
                "serial_number": info.serial_number,
                "software_version": info.software_version,
                "terminal_id": info.terminal_id,
                "menu_type": info.menu_type,
                "correlation_id": cid,
            }))
        }
        PayloadKind::PinpadStatus => {
            let status = protocol::get_pinpad_status(link)?;
            let state = protocol::get_card_reader_state(link)?;
            let report_count = protocol::get_report_info(link)?;
            Ok(json!({
                "has_reversal": status.has_reversal(),
                "has_hang_transaction": status.has_hang_transaction(),
                "end_day_required": status.end_day_required,
                "reader_state": state.name(),
                "report_count": report_count,
                "correlation_id": cid,
            }))
        }
        PayloadKind::PinpadPurchase => {
            let amount = amount_cents(payload, "amount");
            let tip = amount_cents(payload, "tip");
            let cashback = amount_cents(payload, "cashback");
            let reference = val_str(payload, &["reference"]).unwrap_or_default();
            let result = purchase(link, amount, tip, cashback, &reference, timeout)?;
            Ok(result_to_json(&result, &cid))
        }
        PayloadKind::PinpadVoid => {
            let amount = amount_cents(payload, "amount");
            let rrn = val_str(payload, &["rrn"]).unwrap_or_default();
            let auth_id = val_str(payload, &["auth_id"]).unwrap_or_default();
            if rrn.is_empty() || auth_id.is_empty() {
                return Err(GatewayError::validation(
                    "Void requires 'rrn' and 'auth_id' from the original purchase",
                ));
            }
            let result = void_purchase(link, amount, &rrn, &auth_id, timeout)?;
            Ok(result_to_json(&result, &cid))
        }
        PayloadKind::PinpadEndOfDay => {
            let result = end_of_day(link)?;
            Ok(result_to_json(&result, &cid))
        }
        PayloadKind::PinpadTest => {
            let result = test_connection(link, timeout)?;
            Ok(result_to_json(&result, &cid))
        }
        other => Err(GatewayError::validation(format!(
            "Unknown pinpad operation: {}",
            other.as_str()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinpad::protocol::tests::{event_packet, response_packet, MockTransport};
    use crate::pinpad::protocol::{
        BOREVT_TRANSACTION_COMPLETE, ERR_NO_ERROR, EVT_BORICA, TRANS_PURCHASE,
    };

    fn complete_event(result_code: u8, amount_cents: u32) -> Vec<u8> {
        let mut blob = tlv::encode(tag::TRANSACTION_RESULT, &[result_code]);
        blob.extend(tlv::encode_amount(tag::AMOUNT, amount_cents));
        blob.extend(tlv::encode(tag::EMV_STAN, &[0x00, 0x2A]));
        event_packet(EVT_BORICA, BOREVT_TRANSACTION_COMPLETE, &blob)
    }

    #[test]
    fn test_parse_transaction_complete_approved() {
        let blob = {
            let mut b = tlv::encode(tag::TRANSACTION_RESULT, &[0]);
            b.extend(tlv::encode_amount(tag::AMOUNT, 1234));
            b
        };
        let result = parse_transaction_complete(&blob);
        assert!(result.approved);
        assert_eq!(result.result_code, 0);
        assert_eq!(result.amount, 1234);
    }

    #[test]
    fn test_parse_transaction_complete_declined() {
        let mut blob = tlv::encode(tag::TRANSACTION_RESULT, &[1]);
        blob.extend(tlv::encode(tag::TRANSACTION_ERROR, &[9]));
        let result = parse_transaction_complete(&blob);
        assert!(!result.approved);
        assert_eq!(result.result_code, 1);
        assert_eq!(result.error_code, 9);
    }

    #[test]
    fn test_enrichment_from_receipt_tags() {
        let result = parse_transaction_complete(&tlv::encode(tag::TRANSACTION_RESULT, &[0]));
        let mut receipt = TagMap::new();
        receipt.insert(tag::HOST_RRN, b"123456789012".to_vec());
        receipt.insert(tag::HOST_AUTH_ID, b"AB12CD".to_vec());
        receipt.insert(tag::MASKED_PAN, b"516875******1234".to_vec());
        receipt.insert(tag::PAY_INTERFACE, vec![1]);
        receipt.insert(tag::TRANS_DATE, vec![0x25, 0x08, 0x01]);
        receipt.insert(tag::TRANS_TIME, vec![0x12, 0x34, 0x56]);
        let result = enrich_with_receipt_tags(result, receipt);
        assert_eq!(result.rrn, "123456789012");
        assert_eq!(result.auth_id, "AB12CD");
        assert_eq!(result.masked_pan, "516875******1234");
        assert_eq!(result.interface, 1);
        assert_eq!(result.trans_date, "2025-08-01");
        assert_eq!(result.trans_time, "12:34:56");
    }

    #[test]
    fn test_transaction_loop_returns_on_complete() {
        let mut transport = MockTransport::new(vec![complete_event(0, 1234)]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());
        let result = transaction_loop(&mut link, Duration::from_secs(2)).unwrap();
        assert!(result.approved);
        assert_eq!(result.amount, 1234);
        assert_eq!(result.stan, 0x2A);
    }

    #[test]
    fn test_transaction_loop_skips_intermediate_events() {
        let intermediate = event_packet(EVT_BORICA, 0x02, &[]);
        let mut transport = MockTransport::new(vec![intermediate, complete_event(0, 500)]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());
        let result = transaction_loop(&mut link, Duration::from_secs(2)).unwrap();
        assert_eq!(result.amount, 500);
    }

    #[test]
    fn test_purchase_flow_sends_start_tags_and_end() {
        // start OK, then COMPLETE event, then receipt tags, then end OK.
        let receipt_blob = {
            let mut b = tlv::encode_str(tag::HOST_RRN, "000000001111");
            b.extend(tlv::encode(tag::PAY_INTERFACE, &[0]));
            b
        };
        let mut transport = MockTransport::new(vec![
            response_packet(ERR_NO_ERROR, &[b'\0', 0x00]), // pinpad status (pre-check)
            response_packet(ERR_NO_ERROR, &[]),            // transaction start
            complete_event(0, 1234),
            response_packet(ERR_NO_ERROR, &receipt_blob), // receipt tags
            response_packet(ERR_NO_ERROR, &[]),           // transaction end
        ]);
        let mut link = PinpadLink::new(&mut transport, "cid".into());
        let result = purchase(&mut link, 1234, 0, 0, "", Duration::from_secs(5)).unwrap();
        assert!(result.approved);
        assert_eq!(result.amount, 1234);
        assert_eq!(result.interface, 0);
        assert_eq!(result.rrn, "000000001111");

        // Second frame carries TRANSACTION START with purchase type and the
        // 4-byte big-endian amount TLV.
        let start = &transport.sent[1];
        assert_eq!(start[5], protocol::BOR_TRANSACTION_START);
        assert_eq!(start[6], TRANS_PURCHASE);
        assert_eq!(&start[7..13], &[0x81, 0x04, 0x00, 0x00, 0x04, 0xD2]);
    }

    #[test]
    fn test_socket_open_event_parsing() {
        // SOCKET_OPEN event for 3.4.5.6:443, TCP, 30s timeout
        let data = [1u8, 1, 3, 4, 5, 6, 0x01, 0xBB, 0x00, 0x1E];
        let raw = event_packet(protocol::EVT_EXT_INTERNET, protocol::EXTEVT_SOCKET_OPEN, &data);
        let event = protocol::parse_event_packet(&raw).unwrap();
        assert_eq!(event.subevent, protocol::EXTEVT_SOCKET_OPEN);
        let d = &event.data;
        assert_eq!(d[0], 1);
        assert_eq!(Ipv4Addr::new(d[2], d[3], d[4], d[5]), Ipv4Addr::new(3, 4, 5, 6));
        assert_eq!(((d[6] as u16) << 8) | d[7] as u16, 443);
        assert_eq!(((d[8] as u16) << 8) | d[9] as u16, 30);
    }

    #[test]
    fn test_result_messages() {
        let approved = TransactionResult {
            approved: true,
            ..Default::default()
        };
        assert_eq!(result_message(&approved), "Транзакцията е одобрена");

        let declined = TransactionResult {
            result_code: 1,
            host_error_code: 51,
            ..Default::default()
        };
        assert!(result_message(&declined).contains("Insufficient funds"));

        let device_error = TransactionResult {
            result_code: 2,
            error_code: 9,
            ..Default::default()
        };
        assert!(result_message(&device_error).contains("Timeout"));
    }

    #[test]
    fn test_result_json_shape() {
        let result = TransactionResult {
            approved: true,
            amount: 1234,
            interface: 1,
            ..Default::default()
        };
        let v = result_to_json(&result, "cid");
        assert_eq!(v["approved"], true);
        assert_eq!(v["amount"], 1234);
        assert_eq!(v["amount_display"], "12.34");
        assert_eq!(v["interface_name"], "Contactless");
        assert_eq!(v["correlation_id"], "cid");
    }

    #[test]
    fn test_amount_cents_parsing() {
        assert_eq!(amount_cents(&json!({"amount": 12.34}), "amount"), 1234);
        assert_eq!(amount_cents(&json!({"amount": "12.34"}), "amount"), 1234);
        assert_eq!(amount_cents(&json!({}), "amount"), 0);
    }
}
