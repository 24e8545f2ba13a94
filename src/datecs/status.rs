//! Status-vector decoding.
//!
//! Every Datecs response carries an opaque status vector (6 bytes on the
//! byte dialect, 8 on the hex-nibble dialect). The bit-to-flag mapping is a
//! single table shared by both dialects; bytes beyond the vector length are
//! simply absent.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// `(byte index, bit index, flag name)`.
const STATUS_BITS: &[(usize, u8, &str)] = &[
    // Byte 0
    (0, 6, "cover_open"),
    (0, 5, "general_error"),
    (0, 4, "printing_unit_fault"),
    (0, 3, "no_customer_display"),
    (0, 2, "clock_not_set"),
    (0, 1, "invalid_command_code"),
    (0, 0, "syntax_error"),
    // Byte 1
    (1, 6, "tax_terminal_not_responding"),
    (1, 5, "service_receipt_rotated_open"),
    (1, 4, "storno_receipt_open"),
    (1, 3, "low_battery"),
    (1, 2, "ram_reset"),
    (1, 1, "command_not_allowed"),
    (1, 0, "amount_overflow"),
    // Byte 2
    (2, 6, "ej_near_end"),
    (2, 5, "service_receipt_open"),
    (2, 4, "ej_near"),
    (2, 3, "fiscal_receipt_open"),
    (2, 2, "ej_end"),
    (2, 1, "low_paper"),
    (2, 0, "no_paper"),
    // Byte 4
    (4, 6, "head_overheated"),
    (4, 5, "fiscal_error_or"),
    (4, 4, "fiscal_memory_full"),
    (4, 3, "fiscal_memory_low"),
    (4, 0, "fiscal_memory_store_error"),
    // Byte 5
    (5, 5, "fiscal_memory_read_error"),
    (5, 4, "tax_rates_set"),
    (5, 3, "fiscal_mode"),
    (5, 2, "last_store_failed"),
    (5, 1, "fiscal_memory_formatted"),
    (5, 0, "fiscal_memory_readonly"),
];

/// Bulgarian user-facing texts for the flags that surface in error messages.
const TRANSLATIONS_BG: &[(&str, &str)] = &[
    ("no_paper", "Няма хартия в принтера"),
    ("low_paper", "Хартията в принтера свършва"),
    ("cover_open", "Капакът на принтера е отворен"),
    ("printing_unit_fault", "Повреда в печатащото устройство"),
    ("general_error", "Обща грешка на принтера"),
    ("fiscal_memory_full", "Фискалната памет е пълна"),
    ("fiscal_memory_low", "Фискалната памет е почти пълна"),
    ("fiscal_memory_store_error", "Грешка при запис във фискална памет"),
    ("fiscal_memory_read_error", "Грешка при четене от фискална памет"),
    ("clock_not_set", "Часовникът не е настроен"),
    ("invalid_command_code", "Невалиден код на команда"),
    ("syntax_error", "Синтактична грешка"),
    ("command_not_allowed", "Командата не е разрешена в текущия режим"),
    ("amount_overflow", "Препълване на сума"),
    ("ram_reset", "RAM паметта е била изчистена"),
    ("low_battery", "Слаба батерия"),
    ("fiscal_receipt_open", "Вече има отворен фискален бон"),
    ("service_receipt_open", "Вече има отворен служебен бон"),
    ("storno_receipt_open", "Вече има отворена сторно бележка"),
    ("tax_terminal_not_responding", "Данъчният терминал не отговаря"),
    ("ej_near_end", "КЛЕН приключва"),
    ("ej_end", "КЛЕН е пълен"),
    ("head_overheated", "Печатащата глава е прегряла"),
    ("uic_missing", "ЕИК не е въведен"),
    ("unique_id_missing", "Уникален номер не е въведен"),
];

/// Decoded flag set for one status vector. Pure: identical bytes yield
/// identical flag sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFlags {
    set: BTreeSet<&'static str>,
}

impl StatusFlags {
    pub fn decode(status: &[u8]) -> Self {
        let mut set = BTreeSet::new();
        for &(byte, bit, name) in STATUS_BITS {
            if status.len() > byte && status[byte] & (1 << bit) != 0 {
                set.insert(name);
            }
        }
        // Byte 4 carries two registration bits that signal by being CLEAR.
        if status.len() > 4 {
            if status[4] & (1 << 1) == 0 {
                set.insert("uic_missing");
            } else {
                set.insert("uic_set");
            }
            if status[4] & (1 << 2) == 0 {
                set.insert("unique_id_missing");
            }
        }
        Self { set }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.set.contains(name)
    }

    pub fn any(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.set.contains(n))
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.set.iter().copied()
    }

    /// Any receipt currently open on the device.
    pub fn receipt_open(&self) -> bool {
        self.any(&[
            "fiscal_receipt_open",
            "service_receipt_open",
            "storno_receipt_open",
        ])
    }

    /// Hardware faults that block any printing.
    pub fn hardware_fault(&self) -> bool {
        self.any(&["cover_open", "no_paper", "printing_unit_fault"])
    }

    /// JSON map of raised flags for log context.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for name in &self.set {
            map.insert((*name).to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }

    /// User-facing Bulgarian text for the raised flags that have one.
    pub fn translate_bg(&self) -> String {
        let texts: Vec<&str> = TRANSLATIONS_BG
            .iter()
            .filter(|(flag, _)| self.set.contains(flag))
            .map(|(_, text)| *text)
            .collect();
        texts.join("; ")
    }
}

pub fn translate_flag_bg(flag: &str) -> Option<&'static str> {
    TRANSLATIONS_BG
        .iter()
        .find(|(name, _)| *name == flag)
        .map(|(_, text)| *text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_is_pure() {
        let status = [0x40, 0x00, 0x08, 0x00, 0x06, 0x08];
        assert_eq!(StatusFlags::decode(&status), StatusFlags::decode(&status));
    }

    #[test]
    fn test_byte0_flags() {
        let flags = StatusFlags::decode(&[0b0101_0101, 0, 0, 0, 0x06, 0]);
        assert!(flags.contains("cover_open"));
        assert!(flags.contains("printing_unit_fault"));
        assert!(flags.contains("clock_not_set"));
        assert!(flags.contains("syntax_error"));
        assert!(!flags.contains("general_error"));
        assert!(flags.hardware_fault());
    }

    #[test]
    fn test_receipt_open_flags() {
        let fiscal = StatusFlags::decode(&[0, 0, 1 << 3, 0, 0x06, 0]);
        assert!(fiscal.contains("fiscal_receipt_open"));
        assert!(fiscal.receipt_open());

        let storno = StatusFlags::decode(&[0, 1 << 4, 0, 0, 0x06, 0]);
        assert!(storno.contains("storno_receipt_open"));
        assert!(storno.receipt_open());

        let idle = StatusFlags::decode(&[0, 0, 0, 0, 0x06, 0]);
        assert!(!idle.receipt_open());
    }

    #[test]
    fn test_inverted_registration_bits() {
        // Bits 1 and 2 of byte 4 clear => UIC and unique id missing.
        let missing = StatusFlags::decode(&[0, 0, 0, 0, 0x00, 0]);
        assert!(missing.contains("uic_missing"));
        assert!(missing.contains("unique_id_missing"));

        let set = StatusFlags::decode(&[0, 0, 0, 0, 0x06, 0]);
        assert!(!set.contains("uic_missing"));
        assert!(set.contains("uic_set"));
        assert!(!set.contains("unique_id_missing"));
    }

    #[test]
    fn test_short_vector_ignores_missing_bytes() {
        // 4-byte vector: bytes 4 and 5 absent, no registration verdicts.
        let flags = StatusFlags::decode(&[0, 0, 1 << 1, 0]);
        assert!(flags.contains("low_paper"));
        assert!(!flags.contains("uic_missing"));
        assert!(!flags.contains("uic_set"));
    }

    #[test]
    fn test_translation_joined() {
        let flags = StatusFlags::decode(&[1 << 6, 0, 1 << 0, 0, 0x06, 0]);
        let text = flags.translate_bg();
        assert!(text.contains("Капакът"));
        assert!(text.contains("хартия"));
        assert!(text.contains("; "));
    }
}
