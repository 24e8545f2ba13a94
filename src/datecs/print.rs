//! Non-fiscal printing over the Datecs protocol.
//!
//! Text and service receipts go out as a 0x26 open / 0x2A text lines /
//! 0x27 close dialogue, with lines wrapped at the configured width and an
//! optional paper cut.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::adapters::get_adapter;
use crate::applog::log_info;
use crate::datecs::fiscal::DatecsLink;
use crate::error::{GatewayError, Result};
use crate::models::{val_bool, val_f64, val_str, PayloadKind, Printer};
use crate::transport::create_transport;

pub const CMD_OPEN_NONFISCAL: u16 = 0x26;
pub const CMD_CLOSE_NONFISCAL: u16 = 0x27;
pub const CMD_PRINT_TEXT: u16 = 0x2A;
pub const CMD_PAPER_CUT: u16 = 0x2E;

const DEFAULT_LINE_WIDTH: usize = 42;

fn line_width(printer: &Printer) -> usize {
    printer
        .config
        .get("line_width")
        .and_then(Value::as_u64)
        .map(|w| w as usize)
        .filter(|w| *w > 0)
        .unwrap_or(DEFAULT_LINE_WIDTH)
}

fn split_line(line: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![line.to_string()];
    }
    let chars: Vec<char> = line.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(width)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn format_receipt_lines(payload: &Value, width: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let divider = "-".repeat(width.min(DEFAULT_LINE_WIDTH));

    let header = payload.get("header").and_then(Value::as_array);
    if let Some(header) = header {
        for line in header {
            lines.push(text_of(line));
        }
        if !header.is_empty() {
            lines.push(divider.clone());
        }
    }
    if let Some(items) = payload.get("items").and_then(Value::as_array) {
        for item in items {
            let name = val_str(item, &["name"]).unwrap_or_default();
            let qty = val_f64(item, &["qty", "quantity"]).unwrap_or(1.0);
            let price = val_f64(item, &["price"]).unwrap_or(0.0);
            let total = val_f64(item, &["total"]).unwrap_or(qty * price);
            lines.push(format!("{name} x{qty} @ {price} = {total}"));
        }
        if !items.is_empty() {
            lines.push(divider);
        }
    }
    if let Some(totals) = payload.get("totals").and_then(Value::as_array) {
        for total_line in totals {
            if total_line.is_object() {
                let label = val_str(total_line, &["label"]).unwrap_or_else(|| "TOTAL".into());
                match val_str(total_line, &["value"]) {
                    Some(value) => lines.push(format!("{label}: {value}")),
                    None => lines.push(label),
                }
            } else {
                lines.push(text_of(total_line));
            }
        }
    }
    if let Some(footer) = payload.get("footer").and_then(Value::as_array) {
        for line in footer {
            lines.push(text_of(line));
        }
    }
    lines
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lines for a payload kind; `test` produces a fixed self-check page.
pub fn build_lines(printer: &Printer, kind: PayloadKind, payload: &Value) -> Result<Vec<String>> {
    match kind {
        PayloadKind::Text => Ok(payload
            .get("lines")
            .and_then(Value::as_array)
            .map(|lines| lines.iter().map(text_of).collect())
            .unwrap_or_default()),
        PayloadKind::Receipt => Ok(format_receipt_lines(payload, line_width(printer))),
        other => Err(GatewayError::validation(format!(
            "Unsupported print payload type: {}",
            other.as_str()
        ))),
    }
}

fn test_lines(printer: &Printer) -> Vec<String> {
    vec![
        "=== Datecs Test Print ===".into(),
        format!("Model: {}", printer.model),
        "Status: OK".into(),
    ]
}

fn print_lines(printer: &Printer, lines: Vec<String>, dry_run: bool) -> Result<Value> {
    let cid = Uuid::new_v4().simple().to_string();
    if dry_run {
        log_info(
            "DRY_RUN_DATECS_PRINT",
            json!({"printer_id": printer.id, "lines": lines, "correlation_id": cid}),
        );
        return Ok(json!({"dry_run": true, "correlation_id": cid}));
    }

    let spec = get_adapter(&printer.model)?;
    let width = line_width(printer);
    let cut_after = val_bool(&printer.config, "cut_after");

    let mut transport = create_transport(printer, false)?;
    transport.open()?;
    let mut link = DatecsLink::new(transport.as_mut(), spec, printer, cid);

    let result = (|| -> Result<Value> {
        link.send(CMD_OPEN_NONFISCAL, "", "open non-fiscal receipt")?;
        for line in &lines {
            for chunk in split_line(line, width) {
                let data = link.builder().nonfiscal_text(&chunk);
                link.send(CMD_PRINT_TEXT, &data, "print text")?;
            }
        }
        let close_response = link.send(CMD_CLOSE_NONFISCAL, "", "close non-fiscal receipt")?;
        let receipt_number = match spec.dialect {
            crate::adapters::WireDialect::HexNibble => close_response.fields.get(1),
            crate::adapters::WireDialect::Byte => close_response.fields.first(),
        }
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty());

        if cut_after {
            link.send(CMD_PAPER_CUT, "", "paper cut")?;
        }
        Ok(json!({
            "receipt_number": receipt_number,
            "correlation_id": link.cid,
        }))
    })();
    transport.close();
    result
}

/// Print a text/receipt payload as a non-fiscal document.
pub fn print_payload(
    printer: &Printer,
    kind: PayloadKind,
    payload: &Value,
    dry_run: bool,
) -> Result<Value> {
    let lines = build_lines(printer, kind, payload)?;
    let mut result = print_lines(printer, lines, dry_run)?;
    if let Some(map) = result.as_object_mut() {
        map.insert("payload_type".into(), json!(kind.as_str()));
    }
    Ok(result)
}

/// Fixed self-check page for `POST /printers/{id}/test-print`.
pub fn test_print(printer: &Printer, dry_run: bool) -> Result<Value> {
    print_lines(printer, test_lines(printer), dry_run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn printer() -> Printer {
        serde_json::from_value(json!({
            "id": 1, "name": "p", "model": "datecs_fp700mx", "transport": "serial",
            "port": "COM1", "baudrate": 9600, "data_bits": 8, "parity": "N",
            "stop_bits": 1.0, "timeout_ms": 100, "ip_address": null, "tcp_port": 4999,
            "enabled": true, "dry_run": false, "config": {},
            "created_at": "", "updated_at": ""
        }))
        .unwrap()
    }

    #[test]
    fn test_split_line_wraps_at_width() {
        assert_eq!(split_line("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(split_line("", 4), vec![""]);
        assert_eq!(split_line("кирилица", 4), vec!["кири", "лица"]);
    }

    #[test]
    fn test_text_payload_lines() {
        let lines = build_lines(
            &printer(),
            PayloadKind::Text,
            &json!({"lines": ["one", "two", 3]}),
        )
        .unwrap();
        assert_eq!(lines, vec!["one", "two", "3"]);
    }

    #[test]
    fn test_receipt_payload_lines() {
        let lines = build_lines(
            &printer(),
            PayloadKind::Receipt,
            &json!({
                "header": ["Магазин"],
                "items": [{"name": "Хляб", "qty": 2, "price": 1.0}],
                "totals": [{"label": "TOTAL", "value": "2.00"}],
                "footer": ["Благодарим!"]
            }),
        )
        .unwrap();
        assert_eq!(lines[0], "Магазин");
        assert!(lines[2].contains("Хляб x2"));
        assert!(lines.iter().any(|l| l == "TOTAL: 2.00"));
        assert_eq!(lines.last().unwrap(), "Благодарим!");
    }

    #[test]
    fn test_dry_run_short_circuits() {
        let result = print_payload(
            &printer(),
            PayloadKind::Text,
            &json!({"lines": ["hello"]}),
            true,
        )
        .unwrap();
        assert_eq!(result["dry_run"], true);
        assert_eq!(result["payload_type"], "text");
    }

    #[test]
    fn test_fiscal_kind_rejected_by_print_path() {
        assert!(build_lines(&printer(), PayloadKind::FiscalReceipt, &json!({})).is_err());
    }
}
