//! Fiscal session state machine.
//!
//! Drives the multi-step fiscal dialogues (receipt, storno, report, cash,
//! cancel) over a scoped transport: mandatory preflight cleanup, per-command
//! error classification against the live status flags, and receipt-number
//! extraction for both wire dialects. The per-printer sequence byte lives in
//! a process-wide registry and is only ever touched under the device mutex.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::NaiveDateTime;
use encoding_rs::Encoding;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::adapters::{get_adapter, AdapterSpec, WireDialect};
use crate::applog::{log_error, log_info, log_warning};
use crate::datecs::builders::{builder_for, DataBuilder};
use crate::datecs::protocol::{self, DatecsResponse};
use crate::datecs::status::StatusFlags;
use crate::error::{GatewayError, Result};
use crate::models::{val_f64, val_str, PayloadKind, Printer};
use crate::transport::{create_transport, hex_string, Transport};

pub const CMD_LAST_ERROR: u16 = 0x20;
pub const CMD_NRA_DATA: u16 = 0x25;
pub const CMD_STORNO: u16 = 0x2E;
pub const CMD_OPEN_FISCAL: u16 = 0x30;
pub const CMD_SELL_ITEM: u16 = 0x31;
pub const CMD_PAYMENT: u16 = 0x35;
pub const CMD_CLOSE_FISCAL: u16 = 0x38;
pub const CMD_CANCEL_RECEIPT: u16 = 0x3C;
pub const CMD_SET_DATE_TIME: u16 = 0x3D;
pub const CMD_READ_DATE_TIME: u16 = 0x3E;
pub const CMD_REPORT: u16 = 0x45;
pub const CMD_CASH: u16 = 0x46;
pub const CMD_STATUS: u16 = 0x4A;
pub const CMD_TRANSACTION_STATUS: u16 = 0x4C;
pub const CMD_SET_OPERATOR_NAME: u16 = 0x66;
pub const CMD_REPORT_PLU: u16 = 0x6C;
pub const CMD_OPERATOR_INFO: u16 = 0x70;
pub const CMD_REPORT_DEPT: u16 = 0x75;
pub const CMD_REPORT_DEPT_PLU: u16 = 0x76;

const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Payment remainder below this is float noise, not an unpaid receipt.
const PAYMENT_TOLERANCE: f64 = 0.02;

fn known_error_description(code: i64) -> &'static str {
    match code {
        -111018 => "ERR_R_PAY_STARTED - Registration mode error: Payment is initiated.",
        -112001 | -112101 => "ERR_FP_SYNTAX_PARAM_1 - Invalid syntax of parameter 1.",
        -112107 => "ERR_FP_SYNTAX_PARAM_7 - Invalid syntax of parameter 7.",
        _ => "Unknown Datecs error.",
    }
}

// ---------------------------------------------------------------------------
// Per-printer sequence registry (process lifetime)
// ---------------------------------------------------------------------------

fn seq_registry() -> &'static Mutex<HashMap<i64, u8>> {
    static SEQ: OnceLock<Mutex<HashMap<i64, u8>>> = OnceLock::new();
    SEQ.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn load_seq(printer_id: i64) -> u8 {
    seq_registry()
        .lock()
        .map(|m| m.get(&printer_id).copied())
        .unwrap_or(None)
        .unwrap_or(protocol::SEQ_MIN)
}

fn store_seq(printer_id: i64, seq: u8) {
    if let Ok(mut m) = seq_registry().lock() {
        m.insert(printer_id, seq);
    }
}

// ---------------------------------------------------------------------------
// Session link
// ---------------------------------------------------------------------------

/// One opened conversation with a Datecs printer. Owns the sequence byte for
/// its duration; every exchange advances and persists it.
pub struct DatecsLink<'a> {
    pub transport: &'a mut dyn Transport,
    pub spec: &'static AdapterSpec,
    pub encoding: &'static Encoding,
    pub printer_id: i64,
    pub timeout: Duration,
    pub seq: u8,
    pub cid: String,
}

impl<'a> DatecsLink<'a> {
    pub fn new(
        transport: &'a mut dyn Transport,
        spec: &'static AdapterSpec,
        printer: &Printer,
        cid: String,
    ) -> Self {
        Self {
            transport,
            spec,
            encoding: spec.encoding(&printer.config),
            printer_id: printer.id,
            timeout: Duration::from_millis(printer.timeout_ms),
            seq: load_seq(printer.id),
            cid,
        }
    }

    pub fn builder(&self) -> &'static dyn DataBuilder {
        builder_for(self.spec.family)
    }

    /// Send a command; classify device errors.
    pub fn send(&mut self, cmd: u16, data: &str, context: &'static str) -> Result<DatecsResponse> {
        self.send_with(cmd, data, context, false, self.timeout)
    }

    /// Send a command; never raise on a device error code.
    pub fn send_unchecked(
        &mut self,
        cmd: u16,
        data: &str,
        context: &'static str,
    ) -> Result<DatecsResponse> {
        self.send_with(cmd, data, context, true, self.timeout)
    }

    pub fn send_with(
        &mut self,
        cmd: u16,
        data: &str,
        context: &'static str,
        skip_raise: bool,
        timeout: Duration,
    ) -> Result<DatecsResponse> {
        let (payload, _, _) = self.encoding.encode(data);
        log_info(
            "DATECS_SEND",
            json!({
                "context": context,
                "cmd": format!("0x{cmd:02X}"),
                "seq": self.seq,
                "encoding": self.encoding.name(),
                "data": data,
                "data_len": payload.len(),
                "data_hex": hex_string(&payload),
                "correlation_id": self.cid,
            }),
        );
        let response = protocol::send_command(
            self.transport,
            cmd,
            &payload,
            self.seq,
            timeout,
            self.spec.dialect,
            self.spec.status_len,
            self.encoding,
        )?;
        // A completed exchange advances the sequence even when the device
        // reports an error in its DATA.
        self.seq = protocol::next_seq(self.seq);
        store_seq(self.printer_id, self.seq);
        if !skip_raise {
            self.raise_on_error(&response, context, data)?;
        }
        Ok(response)
    }

    fn raise_on_error(
        &self,
        response: &DatecsResponse,
        context: &'static str,
        data: &str,
    ) -> Result<()> {
        let Some(code) = response.error_code() else {
            return Ok(());
        };
        let flags = StatusFlags::decode(&response.status);
        let description = known_error_description(code);
        let (hint, suspect) = classify_error(code, context, &flags, data);
        log_error(
            "DATECS_ERROR",
            json!({
                "context": context,
                "code": code,
                "description": description,
                "hint": hint,
                "suspect": suspect,
                "status_hex": hex_string(&response.status),
                "status_flags": flags.to_json(),
                "fields": response.fields,
                "data": data,
                "correlation_id": self.cid,
            }),
        );
        let user_friendly = flags.translate_bg();
        let parts: Vec<&str> = [user_friendly.as_str(), hint.as_str(), suspect.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        let hint_text = if parts.is_empty() {
            String::new()
        } else {
            format!(" ({})", parts.join("; "))
        };
        Err(GatewayError::Device {
            code,
            context,
            message: format!("Грешка от принтера {code}: {description}{hint_text}"),
        })
    }
}

/// Best-guess hint and suspect for a known device error code, drawn from the
/// live status flags and the DATA that was sent.
fn classify_error(
    code: i64,
    context: &str,
    flags: &StatusFlags,
    data: &str,
) -> (String, String) {
    let mut hint = String::new();
    let mut suspect = String::new();

    if code == -111018 {
        hint = "Плащането е започнато, но не е приключено. Добави плащане за остатъка.".into();
        if !data.is_empty() {
            suspect = "Плащането е по-малко от тотала и има остатък за плащане.".into();
        }
    } else if code == -112001 || code == -112101 {
        if context == "open receipt" {
            hint = "Провери оператор (ID/парола/каса), HEADER>=2 реда, UIC/часовник, \
                    и дали вече няма отворен фискален бон."
                .into();
            if flags.contains("fiscal_receipt_open") || flags.contains("service_receipt_open") {
                suspect = "Има вече отворен фискален/сервизен бон.".into();
            } else if flags.contains("clock_not_set") {
                suspect = "Часовникът не е настроен.".into();
            } else if flags.contains("uic_missing") {
                suspect = "UIC не е зададен.".into();
            } else if flags.contains("command_not_allowed") {
                suspect = "Командата не е позволена в текущия режим.".into();
            } else if flags.contains("fiscal_memory_full") || flags.contains("ej_end") {
                suspect = "Фискалната памет/ЕЖ е пълна или блокирана.".into();
            }
            if !data.is_empty() && suspect.is_empty() {
                suspect = suspect_from_open_data(data);
            }
            if suspect.is_empty() {
                suspect = "Параметрите изглеждат валидни; вероятно операторът/паролата не са \
                           активни или устройството очаква празни параметри."
                    .into();
            }
        } else if context == "report" {
            hint = "Параметър 1 (option) трябва да е 0/2, по желание N, или ?/* според модела."
                .into();
        } else {
            hint = "Провери параметрите на командата и режима на принтера.".into();
        }
    }
    (hint, suspect)
}

/// Inspect the open-receipt DATA shape for the usual authoring mistakes.
fn suspect_from_open_data(data: &str) -> String {
    let normalized = data.trim();
    if normalized.starts_with("48\t") {
        return "DATA започва с '48\\t' (cmd е в DATA вместо само параметрите).".into();
    }
    if !normalized.contains('\t') {
        return "DATA няма TAB разделители (очаквано е OpNum<TAB>Password<TAB>Till).".into();
    }
    let parts: Vec<&str> = normalized
        .split('\t')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    let Some(&op_num) = parts.first() else {
        return String::new();
    };
    let password = parts.get(1).copied().unwrap_or("");
    let till = parts.get(2).copied().unwrap_or("");
    if op_num.is_empty() || !op_num.chars().all(|c| c.is_ascii_digit()) {
        return "OpNum не е число или има скрит символ.".into();
    }
    if !(1..=30).contains(&op_num.parse::<i64>().unwrap_or(0)) {
        return "OpNum трябва да е между 1 и 30 (провери оператори).".into();
    }
    if !password.is_empty()
        && (!password.chars().all(|c| c.is_ascii_digit()) || !(1..=8).contains(&password.len()))
    {
        return "Паролата трябва да е 1-8 цифри според конфигурацията.".into();
    }
    if !till.is_empty()
        && (!till.chars().all(|c| c.is_ascii_digit()) || till.parse::<i64>().unwrap_or(0) < 1)
    {
        return "Till (каса) трябва да е число >= 1.".into();
    }
    String::new()
}

// ---------------------------------------------------------------------------
// Operator extraction & validation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct Operator {
    op_num: String,
    password: String,
    till: String,
    name: String,
}

fn operator_from(payload: &Value, printer: &Printer) -> Operator {
    let empty = Value::Null;
    let nested = payload
        .get("operator")
        .filter(|v| v.is_object())
        .or_else(|| printer.config.get("operator"))
        .unwrap_or(&empty);

    let normalize = |value: Option<String>| -> String {
        let v = value.unwrap_or_default();
        if !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()) {
            let n: i64 = v.parse().unwrap_or(0);
            if n == 0 {
                return String::new();
            }
            return n.to_string();
        }
        v
    };

    Operator {
        op_num: normalize(
            val_str(payload, &["operator_id"])
                .or_else(|| val_str(nested, &["id", "op_num", "number"])),
        ),
        password: val_str(payload, &["operator_password"])
            .or_else(|| val_str(nested, &["password"]))
            .unwrap_or_default(),
        till: normalize(
            val_str(payload, &["operator_till"])
                .or_else(|| val_str(nested, &["till", "till_num", "till_number"])),
        ),
        name: val_str(payload, &["operator_name"])
            .or_else(|| val_str(nested, &["name"]))
            .unwrap_or_default(),
    }
}

fn validate_operator(operator: &Operator) -> Result<()> {
    if operator.op_num.is_empty() || operator.password.is_empty() || operator.till.is_empty() {
        return Err(GatewayError::validation(
            "Operator info requires id, password, till.",
        ));
    }
    let op: i64 = operator
        .op_num
        .parse()
        .map_err(|_| GatewayError::validation("Operator id must be numeric."))?;
    if !(1..=30).contains(&op) {
        return Err(GatewayError::validation("Operator id must be 1..30."));
    }
    if !operator.password.chars().all(|c| c.is_ascii_digit())
        || !(1..=8).contains(&operator.password.len())
    {
        return Err(GatewayError::validation(
            "Operator password must be 1-8 digits.",
        ));
    }
    let till: i64 = operator
        .till
        .parse()
        .map_err(|_| GatewayError::validation("Operator till must be numeric."))?;
    if till < 1 {
        return Err(GatewayError::validation("Operator till must be >= 1."));
    }
    Ok(())
}

/// `op\tpwd\ttill\t` block prepended to storno DATA when configured.
fn operator_data(payload: &Value, printer: &Printer) -> Result<String> {
    let operator = operator_from(payload, printer);
    if operator.op_num.is_empty() && operator.password.is_empty() && operator.till.is_empty() {
        return Ok(String::new());
    }
    if operator.op_num.is_empty() || operator.password.is_empty() || operator.till.is_empty() {
        return Err(GatewayError::validation(
            "Operator info requires id, password, till.",
        ));
    }
    Ok(format!(
        "{}\t{}\t{}\t",
        operator.op_num, operator.password, operator.till
    ))
}

// ---------------------------------------------------------------------------
// Shared dialogue steps
// ---------------------------------------------------------------------------

fn diagnostic_status(link: &mut DatecsLink) {
    let data = link.builder().status_data().to_string();
    match link.send(CMD_STATUS, &data, "status") {
        Ok(response) => log_info(
            "DATECS_STATUS_SUCCESS",
            json!({
                "printer_id": link.printer_id,
                "status_hex": hex_string(&response.status),
                "status_flags": StatusFlags::decode(&response.status).to_json(),
                "fields": response.fields,
                "correlation_id": link.cid,
            }),
        ),
        Err(e) => log_error(
            "DATECS_STATUS_FAILED",
            json!({
                "printer_id": link.printer_id,
                "error": e.to_string(),
                "correlation_id": link.cid,
            }),
        ),
    }
}

fn transaction_status_snapshot(link: &mut DatecsLink) {
    match link.send(CMD_TRANSACTION_STATUS, "", "transaction status") {
        Ok(response) => log_info(
            "DATECS_TRANSACTION_STATUS",
            json!({
                "printer_id": link.printer_id,
                "fields": response.fields,
                "status_hex": hex_string(&response.status),
                "status_flags": StatusFlags::decode(&response.status).to_json(),
                "correlation_id": link.cid,
            }),
        ),
        Err(e) => log_error(
            "DATECS_TRANSACTION_STATUS_FAILED",
            json!({
                "printer_id": link.printer_id,
                "error": e.to_string(),
                "correlation_id": link.cid,
            }),
        ),
    }
}

fn cancel_open_receipt(link: &mut DatecsLink) -> Result<()> {
    log_warning(
        "DATECS_CANCEL_RECEIPT",
        json!({"printer_id": link.printer_id, "correlation_id": link.cid}),
    );
    link.send(CMD_CANCEL_RECEIPT, "", "cancel receipt")?;
    Ok(())
}

/// Mandatory preflight: status probe, hardware-fault fast fail, transaction
/// snapshot, and cleanup of any receipt a previous session left open.
fn preflight_cleanup(link: &mut DatecsLink) -> Result<StatusFlags> {
    let data = link.builder().status_data().to_string();
    let response = link.send(CMD_STATUS, &data, "status")?;
    let flags = StatusFlags::decode(&response.status);
    log_info(
        "DATECS_STATUS_SNAPSHOT",
        json!({
            "printer_id": link.printer_id,
            "status_hex": hex_string(&response.status),
            "status_flags": flags.to_json(),
            "fields": response.fields,
            "correlation_id": link.cid,
        }),
    );

    if flags.hardware_fault() {
        let mut problems = Vec::new();
        for flag in ["cover_open", "no_paper", "printing_unit_fault"] {
            if flags.contains(flag) {
                if let Some(text) = crate::datecs::status::translate_flag_bg(flag) {
                    problems.push(text);
                }
            }
        }
        return Err(GatewayError::Device {
            code: 0,
            context: "preflight",
            message: format!("Принтерът не е готов: {}", problems.join("; ")),
        });
    }

    transaction_status_snapshot(link);
    if flags.receipt_open() {
        cancel_open_receipt(link)?;
        diagnostic_status(link);
    }
    Ok(flags)
}

fn diagnostic_operator_info(link: &mut DatecsLink, op_num: &str) {
    match link.send(CMD_OPERATOR_INFO, &format!("{op_num}\t"), "operator info") {
        Ok(_) => log_info(
            "DATECS_OPERATOR_INFO_SUCCESS",
            json!({"printer_id": link.printer_id, "op_num": op_num, "correlation_id": link.cid}),
        ),
        Err(e) => log_error(
            "DATECS_OPERATOR_INFO_FAILED",
            json!({
                "printer_id": link.printer_id,
                "op_num": op_num,
                "error": e.to_string(),
                "correlation_id": link.cid,
            }),
        ),
    }
}

/// Program the operator (waiter) name on the printer. Best effort.
fn set_operator_name(link: &mut DatecsLink, operator: &Operator) {
    let data = format!(
        "{}\t{}\t{}\t",
        operator.op_num, operator.name, operator.password
    );
    match link.send(CMD_SET_OPERATOR_NAME, &data, "set operator name") {
        Ok(_) => log_info(
            "DATECS_SET_OPERATOR_NAME",
            json!({
                "printer_id": link.printer_id,
                "op_num": operator.op_num,
                "name": operator.name,
                "correlation_id": link.cid,
            }),
        ),
        Err(e) => log_warning(
            "DATECS_SET_OPERATOR_NAME_FAILED",
            json!({
                "printer_id": link.printer_id,
                "op_num": operator.op_num,
                "error": e.to_string(),
                "correlation_id": link.cid,
            }),
        ),
    }
}

fn open_receipt(link: &mut DatecsLink, payload: &Value, printer: &Printer) -> Result<()> {
    let operator = operator_from(payload, printer);
    log_info(
        "DATECS_DIAGNOSTICS_START",
        json!({
            "printer_id": link.printer_id,
            "op_num": operator.op_num,
            "correlation_id": link.cid,
        }),
    );
    preflight_cleanup(link)?;

    if !operator.op_num.is_empty() {
        diagnostic_operator_info(link, &operator.op_num);
    }
    if !operator.name.is_empty() && !operator.op_num.is_empty() {
        set_operator_name(link, &operator);
    }

    validate_operator(&operator)?;
    let invoice = if crate::models::val_bool(payload, "invoice") {
        "I"
    } else {
        ""
    };
    let nsale = val_str(payload, &["nsale", "n_sale", "sale_id", "unp", "UNP"]).unwrap_or_default();
    let data = link.builder().open_receipt(
        &operator.op_num,
        &operator.password,
        &operator.till,
        invoice,
        &nsale,
    );
    log_info(
        "DATECS_OPEN_RECEIPT_DATA",
        json!({"printer_id": link.printer_id, "data": data, "correlation_id": link.cid}),
    );
    link.send(CMD_OPEN_FISCAL, &data, "open receipt")?;
    Ok(())
}

/// A payment response with second field `"D"` reports an amount still due.
fn ensure_payment_completed(response: &DatecsResponse, context: &'static str, cid: &str) -> Result<()> {
    if response.fields.get(1).map(String::as_str) != Some("D") {
        return Ok(());
    }
    let remainder = response.fields.get(2).cloned().unwrap_or_default();
    let remainder_value: f64 = remainder.replace(',', ".").parse().unwrap_or(0.0);
    if remainder_value > PAYMENT_TOLERANCE {
        log_warning(
            "DATECS_PAYMENT_INCOMPLETE",
            json!({
                "context": context,
                "remainder": remainder,
                "correlation_id": cid,
            }),
        );
        return Err(GatewayError::PaymentIncomplete {
            message: format!("Payment incomplete. Остатък за плащане: {remainder}."),
            remainder,
        });
    }
    Ok(())
}

/// Receipt number for the close response: second field on the hex-nibble
/// dialect; on the byte dialect the close carries only day counters, so the
/// global document number comes from NRA data (0x25, type "1") where it is
/// the penultimate comma-separated token.
fn extract_receipt_number(link: &mut DatecsLink, close_response: &DatecsResponse) -> Option<String> {
    let number = match link.spec.dialect {
        WireDialect::HexNibble => close_response
            .fields
            .get(1)
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty()),
        WireDialect::Byte => match link.send_unchecked(CMD_NRA_DATA, "1", "nra data") {
            Ok(nra) => {
                log_info(
                    "DATECS_NRA_DATA_RESPONSE",
                    json!({
                        "fields": nra.fields,
                        "data_hex": hex_string(&nra.data),
                        "correlation_id": link.cid,
                    }),
                );
                let parts: Vec<String> = nra
                    .fields
                    .iter()
                    .flat_map(|f| f.split(','))
                    .map(|p| p.trim().to_string())
                    .collect();
                if parts.len() >= 4 {
                    parts.get(parts.len() - 2).cloned()
                } else {
                    None
                }
            }
            Err(e) => {
                log_info(
                    "DATECS_NRA_DATA_FAILED",
                    json!({"error": e.to_string(), "correlation_id": link.cid}),
                );
                close_response
                    .fields
                    .first()
                    .and_then(|f| f.split(',').next())
                    .map(|p| p.trim().to_string())
            }
        },
    };
    number.filter(|n| !n.is_empty() && n != "0")
}

fn payment_name_bg(payment_type: &str) -> String {
    match payment_type {
        "P" => "В брой",
        "C" => "Кредитна карта",
        "N" => "Дебитна карта",
        "D" => "Ваучер",
        "I" => "Банка",
        other => return other.to_string(),
    }
    .to_string()
}

fn receipt_totals(payload: &Value) -> (f64, Vec<Value>) {
    let items = payload.get("items").and_then(Value::as_array);
    let total: f64 = items
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    val_f64(item, &["price"]).unwrap_or(0.0)
                        * val_f64(item, &["quantity", "qty"]).unwrap_or(1.0)
                })
                .sum()
        })
        .unwrap_or(0.0);
    let methods: Vec<Value> = payload
        .get("payments")
        .and_then(Value::as_array)
        .map(|payments| {
            payments
                .iter()
                .map(|payment| {
                    let ptype = val_str(payment, &["type"]).unwrap_or_else(|| "P".into());
                    json!({
                        "type": payment_name_bg(&ptype),
                        "amount": val_f64(payment, &["amount"]).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    ((total * 100.0).round() / 100.0, methods)
}

/// Sell items, take payments (watching for an unpaid remainder), close, and
/// extract the receipt number. Shared by the fiscal and storno dialogues.
fn sell_pay_close(
    link: &mut DatecsLink,
    payload: &Value,
    item_context: &'static str,
    payment_context: &'static str,
    close_context: &'static str,
) -> Result<Option<String>> {
    let items = payload
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for item in &items {
        let data = link.builder().sale(item)?;
        link.send(CMD_SELL_ITEM, &data, item_context)?;
    }

    let payments = payload
        .get("payments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if payments.is_empty() {
        return Err(GatewayError::validation("At least one payment is required."));
    }
    let mut last_payment_response = None;
    for payment in &payments {
        let data = link.builder().payment(payment)?;
        last_payment_response = Some(link.send(CMD_PAYMENT, &data, payment_context)?);
    }
    if let Some(response) = &last_payment_response {
        ensure_payment_completed(response, payment_context, &link.cid.clone())?;
    }

    let close_response = link.send(CMD_CLOSE_FISCAL, "", close_context)?;
    log_info(
        "DATECS_CLOSE_RESPONSE",
        json!({
            "printer_id": link.printer_id,
            "fields": close_response.fields,
            "data_hex": hex_string(&close_response.data),
            "status_hex": hex_string(&close_response.status),
            "correlation_id": link.cid,
        }),
    );
    diagnostic_status(link);
    Ok(extract_receipt_number(link, &close_response))
}

// ---------------------------------------------------------------------------
// Payload-kind dialogues
// ---------------------------------------------------------------------------

fn run_fiscal_receipt(link: &mut DatecsLink, payload: &Value, printer: &Printer) -> Result<Value> {
    open_receipt(link, payload, printer)?;
    let receipt_number = sell_pay_close(link, payload, "sell item", "payment", "close receipt")?;
    let (total_amount, payment_methods) = receipt_totals(payload);
    Ok(json!({
        "receipt_number": receipt_number,
        "payload_type": "fiscal_receipt",
        "total_amount": total_amount,
        "payment_methods": payment_methods,
        "correlation_id": link.cid,
    }))
}

fn build_storno_data(payload: &Value) -> String {
    let st_type = val_str(payload, &["storno_type", "type"]).unwrap_or_else(|| "0".into());
    let empty = Value::Null;
    let original = payload.get("original").unwrap_or(&empty);
    let mut parts = vec![st_type];
    for keys in [
        ["doc_no", "document"].as_slice(),
        ["date"].as_slice(),
        ["fm"].as_slice(),
        ["unp"].as_slice(),
    ] {
        if let Some(v) = val_str(original, keys) {
            parts.push(v);
        }
    }
    parts.join(",")
}

fn run_storno(link: &mut DatecsLink, payload: &Value, printer: &Printer) -> Result<Value> {
    let operator = operator_data(payload, printer)?;
    let storno = build_storno_data(payload);
    let data = if operator.is_empty() {
        storno
    } else {
        format!("{operator},{storno}")
    };
    link.send(CMD_STORNO, &data, "storno open")?;

    let receipt_number = if crate::models::val_bool(payload, "auto") {
        // The device replays the original document by itself; nothing to
        // sell or pay, close is implicit.
        None
    } else {
        sell_pay_close(link, payload, "storno item", "storno payment", "storno close")?
    };
    let (total_amount, payment_methods) = receipt_totals(payload);
    Ok(json!({
        "receipt_number": receipt_number,
        "payload_type": "storno",
        "total_amount": total_amount,
        "payment_methods": payment_methods,
        "correlation_id": link.cid,
    }))
}

fn report_command(payload: &Value) -> Result<u16> {
    let Some(raw) = val_str(payload, &["command", "cmd"]) else {
        return Ok(CMD_REPORT);
    };
    let text = raw.trim().to_uppercase();
    let mapped = match text.as_str() {
        "45H" | "69" | "0X45" => Some(CMD_REPORT),
        "6CH" | "108" | "0X6C" => Some(CMD_REPORT_PLU),
        "75H" | "117" | "0X75" => Some(CMD_REPORT_DEPT),
        "76H" | "118" | "0X76" => Some(CMD_REPORT_DEPT_PLU),
        _ => None,
    };
    if let Some(cmd) = mapped {
        return Ok(cmd);
    }
    let parsed = if let Some(hex) = text.strip_prefix("0X") {
        u16::from_str_radix(hex, 16).ok()
    } else if let Some(hex) = text.strip_suffix('H') {
        u16::from_str_radix(hex, 16).ok()
    } else if text.chars().all(|c| c.is_ascii_hexdigit()) && !text.is_empty() {
        u16::from_str_radix(&text, 16).ok()
    } else {
        text.parse().ok()
    };
    parsed.ok_or_else(|| GatewayError::validation(format!("Invalid report command: {raw}")))
}

fn run_report(link: &mut DatecsLink, payload: &Value) -> Result<Value> {
    let data = link.builder().report(payload)?;
    let cmd = report_command(payload)?;
    let timeout = link.timeout.max(REPORT_TIMEOUT);
    let response = link.send_with(cmd, &data, "report", false, timeout)?;

    let flags = StatusFlags::decode(&response.status);
    let blocking = flags.any(&[
        "general_error",
        "command_not_allowed",
        "syntax_error",
        "invalid_command_code",
        "no_paper",
        "cover_open",
        "fiscal_receipt_open",
        "service_receipt_open",
        "storno_receipt_open",
        "clock_not_set",
    ]);
    if blocking {
        let last_error = read_last_error(link);
        let hint = flags.translate_bg();
        let parts: Vec<&str> = [hint.as_str(), last_error.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        let hint_text = if parts.is_empty() {
            String::new()
        } else {
            format!(" ({})", parts.join("; "))
        };
        return Err(GatewayError::Device {
            code: 0,
            context: "report",
            message: format!("Z отчетът е отказан от принтера.{hint_text}"),
        });
    }
    if response.fields.len() == 1 {
        let verdict = response.fields[0].trim().to_uppercase();
        if verdict == "T" || verdict == "F" {
            return Err(GatewayError::Device {
                code: 0,
                context: "report",
                message: "Грешка при Z отчет (код T): проверете дата/час, регистрация в НАП, \
                          SIM карта или връзка към NRA."
                    .into(),
            });
        }
    }
    Ok(json!({
        "payload_type": "report",
        "report_type": val_str(payload, &["type"]).unwrap_or_else(|| "Z".into()),
        "correlation_id": link.cid,
    }))
}

fn read_last_error(link: &mut DatecsLink) -> String {
    match link.send_unchecked(CMD_LAST_ERROR, "", "last error") {
        Ok(response) if !response.fields.is_empty() => {
            let fields = &response.fields;
            if fields.len() >= 4 {
                let mut parts = Vec::new();
                if !fields[0].is_empty() {
                    parts.push(format!("cmd {}", fields[0]));
                }
                if !fields[1].is_empty() {
                    parts.push(format!("код {}", fields[1]));
                }
                for extra in &fields[2..4] {
                    if !extra.is_empty() {
                        parts.push(extra.clone());
                    }
                }
                format!("Последна грешка: {}", parts.join(", "))
            } else {
                format!("Последна грешка: {}", fields.join(", "))
            }
        }
        Ok(_) => String::new(),
        Err(e) => {
            log_warning(
                "DATECS_LAST_ERROR_FAILED",
                json!({
                    "printer_id": link.printer_id,
                    "error": e.to_string(),
                    "correlation_id": link.cid,
                }),
            );
            String::new()
        }
    }
}

fn run_cash(link: &mut DatecsLink, payload: &Value) -> Result<Value> {
    let data = link.builder().cash(payload)?;
    link.send(CMD_CASH, &data, "cash")?;
    Ok(json!({
        "payload_type": "cash",
        "direction": val_str(payload, &["direction"]),
        "amount": val_f64(payload, &["amount"]),
        "correlation_id": link.cid,
    }))
}

/// Cancel whatever receipt is open, if any. Used by the MQTT `cancel` action
/// and the manual REST endpoint.
fn run_cancel_receipt(link: &mut DatecsLink) -> Result<Value> {
    let data = link.builder().status_data().to_string();
    let response = link.send(CMD_STATUS, &data, "status")?;
    let flags = StatusFlags::decode(&response.status);
    let cancelled = if flags.receipt_open() {
        cancel_open_receipt(link)?;
        diagnostic_status(link);
        true
    } else {
        false
    };
    Ok(json!({
        "payload_type": "cancel_receipt",
        "cancelled": cancelled,
        "correlation_id": link.cid,
    }))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one fiscal operation over a freshly opened, scoped transport.
pub fn fiscal_operation(
    printer: &Printer,
    kind: PayloadKind,
    payload: &Value,
    dry_run: bool,
) -> Result<Value> {
    let cid = Uuid::new_v4().simple().to_string();
    if dry_run {
        log_info(
            "DRY_RUN_DATECS_FISCAL",
            json!({
                "printer_id": printer.id,
                "payload_type": kind.as_str(),
                "payload": payload,
                "correlation_id": cid,
            }),
        );
        return Ok(json!({"dry_run": true, "correlation_id": cid}));
    }

    let spec = get_adapter(&printer.model)?;
    let mut transport = create_transport(printer, false)?;
    transport.open()?;
    let mut link = DatecsLink::new(transport.as_mut(), spec, printer, cid);
    log_info(
        "DATECS_FISCAL_JOB_START",
        json!({
            "printer_id": printer.id,
            "payload_type": kind.as_str(),
            "correlation_id": link.cid,
        }),
    );
    let result = match kind {
        PayloadKind::FiscalReceipt => run_fiscal_receipt(&mut link, payload, printer),
        PayloadKind::Storno => run_storno(&mut link, payload, printer),
        PayloadKind::Report => run_report(&mut link, payload),
        PayloadKind::Cash => run_cash(&mut link, payload),
        PayloadKind::CancelReceipt => run_cancel_receipt(&mut link),
        other => Err(GatewayError::validation(format!(
            "Unsupported fiscal payload type: {}",
            other.as_str()
        ))),
    };
    let cid = link.cid.clone();
    transport.close();
    if let Err(e) = &result {
        log_error(
            "DATECS_FISCAL_JOB_FAILED",
            json!({
                "printer_id": printer.id,
                "payload_type": kind.as_str(),
                "error": e.to_string(),
                "correlation_id": cid,
            }),
        );
    }
    result
}

// ---------------------------------------------------------------------------
// Device date/time (REST collaborator surface)
// ---------------------------------------------------------------------------

const DATETIME_FORMATS: &[&str] = &[
    "%d-%m-%y %H:%M:%S",
    "%d-%m-%y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
];

pub fn parse_printer_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim().trim_end_matches(" DST").trim();
    if trimmed.is_empty() {
        return None;
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
}

pub fn format_printer_datetime(value: &NaiveDateTime) -> String {
    value.format("%d-%m-%y %H:%M:%S").to_string()
}

/// Read the device clock. Returns `(raw_text, parsed)`.
pub fn read_printer_datetime(printer: &Printer) -> Result<(String, Option<NaiveDateTime>)> {
    let spec = get_adapter(&printer.model)?;
    let cid = Uuid::new_v4().simple().to_string();
    let mut transport = create_transport(printer, false)?;
    transport.open()?;
    let mut link = DatecsLink::new(transport.as_mut(), spec, printer, cid);
    let result = link.send(CMD_READ_DATE_TIME, "", "read datetime");
    transport.close();
    let response = result?;
    let raw = match spec.dialect {
        // FP-700 series answers [ErrorCode, DateTime]
        WireDialect::HexNibble => response.fields.get(1).cloned().unwrap_or_default(),
        // FP-2000 series answers [DateTime]
        WireDialect::Byte => response.fields.first().cloned().unwrap_or_default(),
    };
    let raw = raw.trim().trim_end_matches(" DST").trim().to_string();
    let parsed = parse_printer_datetime(&raw);
    Ok((raw, parsed))
}

/// Set the device clock.
pub fn set_printer_datetime(printer: &Printer, value: &NaiveDateTime) -> Result<()> {
    let spec = get_adapter(&printer.model)?;
    let cid = Uuid::new_v4().simple().to_string();
    let mut transport = create_transport(printer, false)?;
    transport.open()?;
    let mut link = DatecsLink::new(transport.as_mut(), spec, printer, cid);
    let result = link.send(
        CMD_SET_DATE_TIME,
        &format_printer_datetime(value),
        "set datetime",
    );
    transport.close();
    result.map(|_| ())
}

/// Live status probe for the REST surface.
pub fn probe_status(printer: &Printer) -> Result<StatusFlags> {
    let spec = get_adapter(&printer.model)?;
    let cid = Uuid::new_v4().simple().to_string();
    let mut transport = create_transport(printer, false)?;
    transport.open()?;
    let mut link = DatecsLink::new(transport.as_mut(), spec, printer, cid);
    let data = link.builder().status_data().to_string();
    let result = link.send(CMD_STATUS, &data, "status");
    transport.close();
    Ok(StatusFlags::decode(&result?.status))
}

/// Cancel any open receipt, standalone (REST / MQTT `cancel`).
pub fn cancel_receipt_operation(printer: &Printer) -> Result<Value> {
    fiscal_operation(printer, PayloadKind::CancelReceipt, &Value::Null, false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response_with_fields(fields: &[&str]) -> DatecsResponse {
        DatecsResponse {
            cmd: 0x35,
            seq: 0x20,
            data: Vec::new(),
            fields: fields.iter().map(|s| s.to_string()).collect(),
            status: vec![0, 0, 0, 0, 0x06, 0],
        }
    }

    #[test]
    fn test_payment_due_over_tolerance_fails() {
        let response = response_with_fields(&["0.50", "D", "0.50"]);
        let err = ensure_payment_completed(&response, "payment", "cid").unwrap_err();
        match err {
            GatewayError::PaymentIncomplete { remainder, .. } => assert_eq!(remainder, "0.50"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_payment_remainder_within_tolerance_passes() {
        let response = response_with_fields(&["0.02", "D", "0.02"]);
        assert!(ensure_payment_completed(&response, "payment", "cid").is_ok());
        let response = response_with_fields(&["0.00", "R", "0.00"]);
        assert!(ensure_payment_completed(&response, "payment", "cid").is_ok());
    }

    #[test]
    fn test_payment_comma_decimal_remainder() {
        let response = response_with_fields(&["0,50", "D", "0,50"]);
        assert!(ensure_payment_completed(&response, "payment", "cid").is_err());
    }

    #[test]
    fn test_validate_operator_rules() {
        let ok = Operator {
            op_num: "1".into(),
            password: "0000".into(),
            till: "1".into(),
            name: String::new(),
        };
        assert!(validate_operator(&ok).is_ok());

        let mut bad = ok.clone();
        bad.op_num = "31".into();
        assert!(validate_operator(&bad).is_err());

        let mut bad = ok.clone();
        bad.password = "123456789".into();
        assert!(validate_operator(&bad).is_err());

        let mut bad = ok.clone();
        bad.till = "0".into();
        assert!(validate_operator(&bad).is_err());

        let mut bad = ok;
        bad.password = String::new();
        assert!(validate_operator(&bad).is_err());
    }

    #[test]
    fn test_operator_extraction_normalises_numbers() {
        let printer: Printer = serde_json::from_value(json!({
            "id": 1, "name": "p", "model": "datecs_fp2000", "transport": "serial",
            "port": "COM1", "baudrate": 9600, "data_bits": 8, "parity": "N",
            "stop_bits": 1.0, "timeout_ms": 5000, "ip_address": null, "tcp_port": 4999,
            "enabled": true, "dry_run": false,
            "config": {"operator": {"id": "01", "password": "0000", "till": "001"}},
            "created_at": "", "updated_at": ""
        }))
        .unwrap();
        let operator = operator_from(&json!({}), &printer);
        assert_eq!(operator.op_num, "1");
        assert_eq!(operator.till, "1");

        // Payload-level fields win over printer config.
        let operator = operator_from(&json!({"operator": {"id": "2", "password": "1", "till": "3"}}), &printer);
        assert_eq!(operator.op_num, "2");
        assert_eq!(operator.till, "3");
    }

    #[test]
    fn test_storno_data_building() {
        assert_eq!(build_storno_data(&json!({"storno_type": 1})), "1");
        assert_eq!(
            build_storno_data(&json!({
                "storno_type": 0,
                "original": {"doc_no": "42", "date": "01-01-25 10:00:00", "fm": "FM1", "unp": "U7"}
            })),
            "0,42,01-01-25 10:00:00,FM1,U7"
        );
        assert_eq!(
            build_storno_data(&json!({"type": 2, "original": {"doc_no": "9"}})),
            "2,9"
        );
    }

    #[test]
    fn test_report_command_mapping() {
        assert_eq!(report_command(&json!({})).unwrap(), CMD_REPORT);
        assert_eq!(report_command(&json!({"command": "45h"})).unwrap(), CMD_REPORT);
        assert_eq!(report_command(&json!({"command": "0x6C"})).unwrap(), CMD_REPORT_PLU);
        assert_eq!(report_command(&json!({"cmd": "75H"})).unwrap(), CMD_REPORT_DEPT);
        assert_eq!(report_command(&json!({"command": "76"})).unwrap(), 0x76);
    }

    #[test]
    fn test_error_classification_uses_status_flags() {
        let flags = StatusFlags::decode(&[0, 0, 1 << 3, 0, 0x06, 0]);
        let (hint, suspect) = classify_error(-112001, "open receipt", &flags, "1\t0000\t1\t\t");
        assert!(!hint.is_empty());
        assert!(suspect.contains("отворен"));
    }

    #[test]
    fn test_error_classification_inspects_data_shape() {
        let flags = StatusFlags::decode(&[0, 0, 0, 0, 0x06, 0]);
        let (_, suspect) = classify_error(-112001, "open receipt", &flags, "no-tabs-here");
        assert!(suspect.contains("TAB"));

        let (_, suspect) = classify_error(-112001, "open receipt", &flags, "99\t0000\t1\t\t");
        assert!(suspect.contains("между 1 и 30"));
    }

    #[test]
    fn test_datetime_parsing() {
        let parsed = parse_printer_datetime("01-02-25 10:20:30").unwrap();
        assert_eq!(format_printer_datetime(&parsed), "01-02-25 10:20:30");
        assert!(parse_printer_datetime("01-02-2025 10:20").is_some());
        assert!(parse_printer_datetime("13-02-25 08:00:00 DST").is_some());
        assert!(parse_printer_datetime("").is_none());
        assert!(parse_printer_datetime("not a date").is_none());
    }

    #[test]
    fn test_receipt_totals() {
        let payload = json!({
            "items": [
                {"name": "Хляб", "price": "1.00", "qty": "1"},
                {"name": "Мляко", "price": 2.5, "quantity": 2}
            ],
            "payments": [{"type": "P", "amount": "6.00"}]
        });
        let (total, methods) = receipt_totals(&payload);
        assert_eq!(total, 6.0);
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0]["type"], "В брой");
        assert_eq!(methods[0]["amount"], 6.0);
    }

    #[test]
    fn test_seq_registry_roundtrip() {
        store_seq(9999, 0x42);
        assert_eq!(load_seq(9999), 0x42);
        assert_eq!(load_seq(12345678), protocol::SEQ_MIN);
    }
}
