//! Durable records and API bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Payload kinds
// ---------------------------------------------------------------------------

/// Closed set of job payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    Receipt,
    FiscalReceipt,
    Storno,
    Report,
    Cash,
    CancelReceipt,
    PinpadPurchase,
    PinpadVoid,
    PinpadEndOfDay,
    PinpadTest,
    PinpadInfo,
    PinpadStatus,
    PinpadPing,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Text => "text",
            PayloadKind::Receipt => "receipt",
            PayloadKind::FiscalReceipt => "fiscal_receipt",
            PayloadKind::Storno => "storno",
            PayloadKind::Report => "report",
            PayloadKind::Cash => "cash",
            PayloadKind::CancelReceipt => "cancel_receipt",
            PayloadKind::PinpadPurchase => "pinpad_purchase",
            PayloadKind::PinpadVoid => "pinpad_void",
            PayloadKind::PinpadEndOfDay => "pinpad_end_of_day",
            PayloadKind::PinpadTest => "pinpad_test",
            PayloadKind::PinpadInfo => "pinpad_info",
            PayloadKind::PinpadStatus => "pinpad_status",
            PayloadKind::PinpadPing => "pinpad_ping",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(Value::String(value.to_string())).ok()
    }

    /// Kinds handled by the Datecs fiscal session.
    pub fn is_fiscal(&self) -> bool {
        matches!(
            self,
            PayloadKind::FiscalReceipt
                | PayloadKind::Storno
                | PayloadKind::Report
                | PayloadKind::Cash
                | PayloadKind::CancelReceipt
        )
    }

    /// Kinds handled by the pinpad session.
    pub fn is_pinpad(&self) -> bool {
        matches!(
            self,
            PayloadKind::PinpadPurchase
                | PayloadKind::PinpadVoid
                | PayloadKind::PinpadEndOfDay
                | PayloadKind::PinpadTest
                | PayloadKind::PinpadInfo
                | PayloadKind::PinpadStatus
                | PayloadKind::PinpadPing
        )
    }
}

// ---------------------------------------------------------------------------
// Printer record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Printer {
    pub id: i64,
    pub name: String,
    /// Model key; must resolve in the adapter registry.
    pub model: String,
    /// Transport kind: "serial" or "lan".
    pub transport: String,
    pub port: Option<String>,
    pub baudrate: u32,
    pub data_bits: u8,
    pub parity: String,
    pub stop_bits: f64,
    pub timeout_ms: u64,
    pub ip_address: Option<String>,
    pub tcp_port: u16,
    pub enabled: bool,
    pub dry_run: bool,
    /// Opaque configuration map (operator credentials, encoding, overrides).
    pub config: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrinterCreate {
    pub name: String,
    pub model: String,
    pub transport: String,
    pub port: Option<String>,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub ip_address: Option<String>,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_config")]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrinterUpdate {
    pub name: Option<String>,
    pub model: Option<String>,
    pub transport: Option<String>,
    pub port: Option<String>,
    pub baudrate: Option<u32>,
    pub data_bits: Option<u8>,
    pub parity: Option<String>,
    pub stop_bits: Option<f64>,
    pub timeout_ms: Option<u64>,
    pub ip_address: Option<String>,
    pub tcp_port: Option<u16>,
    pub enabled: Option<bool>,
    pub dry_run: Option<bool>,
    pub config: Option<Value>,
}

fn default_baudrate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> String {
    "N".into()
}
fn default_stop_bits() -> f64 {
    1.0
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_tcp_port() -> u16 {
    4999
}
fn default_true() -> bool {
    true
}
fn default_config() -> Value {
    Value::Object(Default::default())
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

pub const JOB_QUEUED: &str = "queued";
pub const JOB_PRINTING: &str = "printing";
pub const JOB_SUCCESS: &str = "success";
pub const JOB_FAILED: &str = "failed";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub printer_id: i64,
    pub payload_type: String,
    pub payload: Value,
    pub status: String,
    pub retries: i64,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobCreate {
    pub printer_id: i64,
    pub payload_type: PayloadKind,
    #[serde(default = "default_config")]
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Log record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub context: Option<Value>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Loose-payload helpers
// ---------------------------------------------------------------------------
//
// POS payloads arrive as free-form JSON where numbers may be strings and
// vice versa. These helpers normalise extraction.

/// First non-empty string under any of `keys`.
pub fn val_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// First numeric value under any of `keys`, accepting numeric strings.
pub fn val_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(n) = s.trim().replace(',', ".").parse::<f64>() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn val_bool(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_kind_round_trip() {
        for kind in [
            PayloadKind::FiscalReceipt,
            PayloadKind::Storno,
            PayloadKind::PinpadEndOfDay,
            PayloadKind::CancelReceipt,
        ] {
            assert_eq!(PayloadKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PayloadKind::parse("bogus"), None);
    }

    #[test]
    fn test_fiscal_and_pinpad_partition() {
        assert!(PayloadKind::FiscalReceipt.is_fiscal());
        assert!(!PayloadKind::FiscalReceipt.is_pinpad());
        assert!(PayloadKind::PinpadPurchase.is_pinpad());
        assert!(!PayloadKind::Text.is_fiscal());
        assert!(!PayloadKind::Text.is_pinpad());
    }

    #[test]
    fn test_val_helpers_accept_mixed_types() {
        let v = json!({"amount": "12.50", "qty": 2, "name": "  Хляб "});
        assert_eq!(val_f64(&v, &["amount"]), Some(12.5));
        assert_eq!(val_f64(&v, &["qty"]), Some(2.0));
        assert_eq!(val_str(&v, &["name"]).as_deref(), Some("Хляб"));
        assert_eq!(val_str(&v, &["qty"]).as_deref(), Some("2"));
        assert_eq!(val_str(&v, &["missing"]), None);
    }

    #[test]
    fn test_val_f64_accepts_comma_decimal() {
        let v = json!({"remainder": "0,50"});
        assert_eq!(val_f64(&v, &["remainder"]), Some(0.5));
    }
}
