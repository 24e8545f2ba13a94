//! Payload dispatch.
//!
//! Routes a job payload to the engine that owns it: fiscal kinds to the
//! Datecs fiscal session, pinpad kinds to the pinpad session, and plain
//! text/receipt payloads to the non-fiscal print path. Validation failures
//! never reach the wire.

use serde_json::{json, Value};

use crate::adapters::{get_adapter, DeviceKind};
use crate::applog::log_info;
use crate::datecs::{fiscal, print};
use crate::error::{GatewayError, Result};
use crate::models::{PayloadKind, Printer};
use crate::pinpad::session;

/// Execute one payload against one printer. Blocking; the queue wraps this
/// in a worker thread with a deadline.
pub fn execute(
    printer: &Printer,
    kind: PayloadKind,
    payload: &Value,
    global_dry_run: bool,
) -> Result<Value> {
    let spec = get_adapter(&printer.model)?;
    let dry_run = global_dry_run || printer.dry_run;

    let result = match spec.kind {
        DeviceKind::Pinpad => {
            if !kind.is_pinpad() {
                return Err(GatewayError::validation(format!(
                    "{} is a card reader; payload type {} is not supported",
                    printer.model,
                    kind.as_str()
                )));
            }
            session::pinpad_operation(printer, kind, payload, dry_run)
        }
        DeviceKind::FiscalPrinter => {
            if kind.is_pinpad() {
                return Err(GatewayError::validation(format!(
                    "{} is a fiscal printer; payload type {} needs a pinpad",
                    printer.model,
                    kind.as_str()
                )));
            }
            if kind.is_fiscal() {
                fiscal::fiscal_operation(printer, kind, payload, dry_run)
            } else {
                print::print_payload(printer, kind, payload, dry_run)
            }
        }
    };

    if let Ok(value) = &result {
        log_info(
            "PRINT_SENT",
            json!({
                "printer_id": printer.id,
                "payload_type": kind.as_str(),
                "result": value,
            }),
        );
    }
    result
}

/// Test print for the REST surface.
pub fn test_print(printer: &Printer, global_dry_run: bool) -> Result<Value> {
    let spec = get_adapter(&printer.model)?;
    if spec.kind == DeviceKind::Pinpad {
        return Err(GatewayError::validation(
            "Card readers do not print; use pinpad_ping to test connectivity",
        ));
    }
    print::test_print(printer, global_dry_run || printer.dry_run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn printer(model: &str) -> Printer {
        serde_json::from_value(json!({
            "id": 7, "name": "p", "model": model, "transport": "serial",
            "port": "COM1", "baudrate": 9600, "data_bits": 8, "parity": "N",
            "stop_bits": 1.0, "timeout_ms": 100, "ip_address": null, "tcp_port": 4999,
            "enabled": true, "dry_run": true, "config": {},
            "created_at": "", "updated_at": ""
        }))
        .unwrap()
    }

    #[test]
    fn test_pinpad_kind_on_fiscal_printer_rejected() {
        let err = execute(
            &printer("datecs_fp700mx"),
            PayloadKind::PinpadPurchase,
            &json!({}),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_fiscal_kind_on_pinpad_rejected() {
        let err = execute(
            &printer("datecspay_bluepad"),
            PayloadKind::FiscalReceipt,
            &json!({}),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = execute(&printer("noname"), PayloadKind::Text, &json!({}), false).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_dry_run_fiscal_receipt_short_circuits() {
        let result = execute(
            &printer("datecs_fp700mx"),
            PayloadKind::FiscalReceipt,
            &json!({"items": [], "payments": []}),
            false,
        )
        .unwrap();
        assert_eq!(result["dry_run"], true);
    }

    #[test]
    fn test_global_dry_run_overrides_printer() {
        let mut p = printer("datecs_fp700mx");
        p.dry_run = false;
        let result = execute(&p, PayloadKind::Text, &json!({"lines": ["x"]}), true).unwrap();
        assert_eq!(result["dry_run"], true);
    }
}
