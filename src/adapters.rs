//! Printer model registry.
//!
//! Each supported model key resolves to a closed record selecting the wire
//! dialect, the status-vector length, the DATA builder family, and the kind
//! of device. Adding a model is one table row.

use encoding_rs::Encoding;

use crate::error::{GatewayError, Result};

/// On-wire variant of the Datecs fiscal protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireDialect {
    /// Length/cmd/BCC as 4-byte ASCII-hex nibbles, 8-byte status vector.
    HexNibble,
    /// Single-byte length/cmd, 6-byte status vector.
    Byte,
}

/// DATA builder family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderFamily {
    /// Newer series: uniformly TAB-separated fields, digit tax groups.
    Tab,
    /// Older series: compact punctuation syntax, letter tax groups.
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    FiscalPrinter,
    Pinpad,
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterSpec {
    pub model: &'static str,
    pub kind: DeviceKind,
    pub dialect: WireDialect,
    pub family: BuilderFamily,
    pub status_len: usize,
    pub default_encoding: &'static str,
}

const HEX4: AdapterSpec = AdapterSpec {
    model: "",
    kind: DeviceKind::FiscalPrinter,
    dialect: WireDialect::HexNibble,
    family: BuilderFamily::Tab,
    status_len: 8,
    default_encoding: "cp1251",
};

const BYTE: AdapterSpec = AdapterSpec {
    model: "",
    kind: DeviceKind::FiscalPrinter,
    dialect: WireDialect::Byte,
    family: BuilderFamily::Compact,
    status_len: 6,
    default_encoding: "cp1251",
};

/// All supported models.
pub const ADAPTERS: &[AdapterSpec] = &[
    // FP-700MX family (protocol 2.08, hex-nibble framing)
    AdapterSpec { model: "datecs_fp700mx", ..HEX4 },
    AdapterSpec { model: "datecs_fmp350x", ..HEX4 },
    AdapterSpec { model: "datecs_fmp55x", ..HEX4 },
    AdapterSpec { model: "datecs_fp700x", ..HEX4 },
    AdapterSpec { model: "datecs_fp700xe", ..HEX4 },
    AdapterSpec { model: "datecs_wp500x", ..HEX4 },
    AdapterSpec { model: "datecs_wp50x", ..HEX4 },
    AdapterSpec { model: "datecs_dp25x", ..HEX4 },
    AdapterSpec { model: "datecs_wp25x", ..HEX4 },
    AdapterSpec { model: "datecs_dp150x", ..HEX4 },
    AdapterSpec { model: "datecs_dp05c", ..HEX4 },
    // FP-2000 family (protocol 2.00BG, byte framing)
    AdapterSpec { model: "datecs_fp2000", ..BYTE },
    AdapterSpec { model: "datecs_fp800", ..BYTE },
    AdapterSpec { model: "datecs_fp650", ..BYTE },
    AdapterSpec { model: "datecs_sk1_21f", ..BYTE },
    AdapterSpec { model: "datecs_sk1_31f", ..BYTE },
    AdapterSpec { model: "datecs_fmp10", ..BYTE },
    AdapterSpec { model: "datecs_fp700", ..BYTE },
    // DatecsPay card readers
    AdapterSpec {
        model: "datecspay_bluepad",
        kind: DeviceKind::Pinpad,
        ..HEX4
    },
];

/// Resolve a model key to its adapter record.
pub fn get_adapter(model: &str) -> Result<&'static AdapterSpec> {
    let key = model.trim().to_lowercase();
    ADAPTERS
        .iter()
        .find(|a| a.model == key)
        .ok_or_else(|| GatewayError::validation(format!("Unsupported printer model: {model}")))
}

pub fn supported_models() -> Vec<&'static str> {
    ADAPTERS.iter().map(|a| a.model).collect()
}

impl AdapterSpec {
    /// Effective text encoding: per-printer config override or the family
    /// default (Cyrillic cp1251).
    pub fn encoding(&self, config: &serde_json::Value) -> &'static Encoding {
        let label = config
            .get("encoding")
            .and_then(|v| v.as_str())
            .unwrap_or(self.default_encoding);
        Encoding::for_label(label.as_bytes()).unwrap_or(encoding_rs::WINDOWS_1251)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_families_are_consistent() {
        for spec in ADAPTERS {
            match spec.dialect {
                WireDialect::HexNibble => assert_eq!(spec.status_len, 8, "{}", spec.model),
                WireDialect::Byte => assert_eq!(spec.status_len, 6, "{}", spec.model),
            }
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(get_adapter("Datecs_FP700MX").is_ok());
        assert!(get_adapter("datecs_fp2000").is_ok());
        assert!(get_adapter("epson_tm20").is_err());
    }

    #[test]
    fn test_fp2000_is_byte_dialect_compact() {
        let spec = get_adapter("datecs_fp2000").unwrap();
        assert_eq!(spec.dialect, WireDialect::Byte);
        assert_eq!(spec.family, BuilderFamily::Compact);
        assert_eq!(spec.status_len, 6);
    }

    #[test]
    fn test_bluepad_is_pinpad() {
        let spec = get_adapter("datecspay_bluepad").unwrap();
        assert_eq!(spec.kind, DeviceKind::Pinpad);
    }

    #[test]
    fn test_encoding_override() {
        let spec = get_adapter("datecs_fp700mx").unwrap();
        assert_eq!(spec.encoding(&json!({})), encoding_rs::WINDOWS_1251);
        assert_eq!(
            spec.encoding(&json!({"encoding": "windows-1252"})),
            encoding_rs::WINDOWS_1252
        );
        assert_eq!(
            spec.encoding(&json!({"encoding": "bogus"})),
            encoding_rs::WINDOWS_1251
        );
    }
}
