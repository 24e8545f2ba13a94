//! Command DATA builders.
//!
//! Each Datecs series has its own wire format for the *same* command codes.
//! The tab family (FP-700MX class) separates every field with TAB and uses
//! digit tax groups; the compact family (FP-2000 class) mixes TAB with
//! inline punctuation and uses letter tax groups. A builder serialises
//! command parameters into the format its series expects; builders are pure.

use serde_json::Value;

use crate::adapters::BuilderFamily;
use crate::error::{GatewayError, Result};
use crate::models::{val_f64, val_str};

pub trait DataBuilder: Send + Sync {
    /// 0x30 open fiscal receipt.
    fn open_receipt(
        &self,
        op_num: &str,
        password: &str,
        till: &str,
        invoice: &str,
        nsale: &str,
    ) -> String;

    /// 0x31 register sale.
    fn sale(&self, item: &Value) -> Result<String>;

    /// 0x35 payment / total.
    fn payment(&self, payment: &Value) -> Result<String>;

    /// 0x2A free text in a service (non-fiscal) receipt.
    fn nonfiscal_text(&self, text: &str) -> String;

    /// 0x36 free text in a fiscal receipt.
    fn fiscal_text(&self, text: &str) -> String;

    /// 0x46 service deposit / withdrawal.
    fn cash(&self, payload: &Value) -> Result<String>;

    /// 0x45 daily financial report (Z / X).
    fn report(&self, payload: &Value) -> Result<String>;

    /// 0x4A status request data byte.
    fn status_data(&self) -> &'static str;
}

pub fn builder_for(family: BuilderFamily) -> &'static dyn DataBuilder {
    match family {
        BuilderFamily::Tab => &TabDataBuilder,
        BuilderFamily::Compact => &CompactDataBuilder,
    }
}

/// Two-decimal amount formatting shared by all series.
pub fn format_amount(value: f64) -> String {
    format!("{value:.2}")
}

// ---------------------------------------------------------------------------
// Normalisation helpers
// ---------------------------------------------------------------------------

/// Cyrillic tax letter to its Latin equivalent.
fn latinise_tax(v: &str) -> String {
    let upper = v.trim().to_uppercase();
    match upper.as_str() {
        "А" => "A".into(),
        "Б" => "B".into(),
        "В" => "C".into(),
        "Г" => "D".into(),
        "Д" => "E".into(),
        "Е" => "F".into(),
        "Ж" => "G".into(),
        "З" => "H".into(),
        _ => upper,
    }
}

/// Normalise any tax-group representation to a digit '1'..'8'.
fn tax_digit(code: Option<String>) -> String {
    let Some(code) = code.filter(|c| !c.is_empty()) else {
        return "1".into();
    };
    let v = latinise_tax(&code);
    match v.as_str() {
        "A" => "1",
        "B" => "2",
        "C" => "3",
        "D" => "4",
        "E" => "5",
        "F" => "6",
        "G" => "7",
        "H" => "8",
        "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" => return v,
        _ => "1",
    }
    .into()
}

/// Normalise any tax-group representation to a letter 'A'..'H'.
fn tax_letter(code: Option<String>) -> String {
    let Some(code) = code.filter(|c| !c.is_empty()) else {
        return "A".into();
    };
    let v = latinise_tax(&code);
    match v.as_str() {
        "1" => "A",
        "2" => "B",
        "3" => "C",
        "4" => "D",
        "5" => "E",
        "6" => "F",
        "7" => "G",
        "8" => "H",
        "A" | "B" | "C" | "D" | "E" | "F" | "G" | "H" => return v,
        _ => "A",
    }
    .into()
}

/// Map a payment type to the tab-family digit code '0'..'5'.
fn payment_mode_digit(value: Option<String>) -> String {
    let raw = value.unwrap_or_else(|| "P".into()).trim().to_uppercase();
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        return raw;
    }
    match raw.as_str() {
        "C" => "1",
        "N" => "2",
        _ => "0", // "P" cash
    }
    .into()
}

/// Map a payment type to the compact-family letter code.
fn payment_mode_letter(value: Option<String>) -> String {
    let raw = value.unwrap_or_else(|| "P".into()).trim().to_uppercase();
    match raw.as_str() {
        "0" | "P" => "P", // cash
        "1" | "D" => "D", // card
        "2" | "N" => "N", // credit
        "3" | "C" => "C", // cheque
        _ => "P",
    }
    .into()
}

fn item_tax(item: &Value) -> Option<String> {
    val_str(item, &["tax", "tax_code", "tax_group"])
}

fn item_price(item: &Value) -> Result<String> {
    val_f64(item, &["price"])
        .map(format_amount)
        .ok_or_else(|| GatewayError::validation("Sale item requires price."))
}

fn item_name(item: &Value) -> Result<String> {
    val_str(item, &["name"]).ok_or_else(|| GatewayError::validation("Sale item requires name."))
}

/// `(discount_is_percent, value)` from either a `"10%"` string or a number.
fn item_discount(item: &Value) -> Option<(bool, String)> {
    match item.get("discount") {
        Some(Value::String(s)) => {
            let raw = s.trim();
            if raw.is_empty() {
                return None;
            }
            if let Some(pct) = raw.strip_suffix('%') {
                return Some((true, pct.to_string()));
            }
            let n: f64 = raw.replace(',', ".").parse().ok()?;
            (n != 0.0).then(|| (false, format_amount(n.abs())))
        }
        Some(Value::Number(n)) => {
            let n = n.as_f64()?;
            (n != 0.0).then(|| (false, format_amount(n.abs())))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tab family (FP-700MX class, protocol 2.08)
// ---------------------------------------------------------------------------

/// Newer series: all fields TAB-separated.
pub struct TabDataBuilder;

impl DataBuilder for TabDataBuilder {
    // Syntax 1: {OpCode}<SEP>{OpPwd}<SEP>{TillNmb}<SEP>{Invoice}<SEP>
    // Syntax 2: {OpCode}<SEP>{OpPwd}<SEP>{NSale}<SEP>{TillNmb}<SEP>{Invoice}<SEP>
    fn open_receipt(
        &self,
        op_num: &str,
        password: &str,
        till: &str,
        invoice: &str,
        nsale: &str,
    ) -> String {
        if nsale.is_empty() {
            format!("{op_num}\t{password}\t{till}\t{invoice}\t")
        } else {
            format!("{op_num}\t{password}\t{nsale}\t{till}\t{invoice}\t")
        }
    }

    // {PluName}<SEP>{TaxCd}<SEP>{Price}<SEP>{Qty}<SEP>{DiscType}<SEP>{DiscVal}<SEP>{Dept}<SEP>[{Unit}<SEP>]
    fn sale(&self, item: &Value) -> Result<String> {
        let name = item_name(item)?;
        let tax = tax_digit(item_tax(item));
        let price = item_price(item)?;
        let qty = val_str(item, &["qty", "quantity"]).unwrap_or_else(|| "1.000".into());
        let department = val_str(item, &["department"]).unwrap_or_else(|| "0".into());
        let unit = val_str(item, &["unit"]).unwrap_or_default();

        let (disc_type, disc_val) = match item_discount(item) {
            Some((true, pct)) => ("2".to_string(), pct),
            Some((false, abs)) => ("4".to_string(), abs),
            None => (String::new(), String::new()),
        };

        let mut fields = vec![name, tax, price, qty, disc_type, disc_val, department];
        if !unit.is_empty() {
            fields.push(unit);
        }
        Ok(fields.join("\t") + "\t")
    }

    // {PaidMode}<SEP>{Amount}<SEP>{Type}<SEP>
    fn payment(&self, payment: &Value) -> Result<String> {
        let mode = payment_mode_digit(val_str(payment, &["type"]));
        let amount = val_f64(payment, &["amount"])
            .map(format_amount)
            .ok_or_else(|| GatewayError::validation("Payment amount is required."))?;
        Ok(format!("{mode}\t{amount}\t\t"))
    }

    // {Text}<SEP>{Bold}<SEP>{Italic}<SEP>{Height}<SEP>{Underline}<SEP>{alignment}<SEP>
    fn nonfiscal_text(&self, text: &str) -> String {
        format!("{text}\t\t\t\t\t\t")
    }

    fn fiscal_text(&self, text: &str) -> String {
        format!("{text}\t\t\t\t\t\t")
    }

    // {Type}<SEP>{Amount}<SEP>
    fn cash(&self, payload: &Value) -> Result<String> {
        let amount = val_f64(payload, &["amount"])
            .ok_or_else(|| GatewayError::validation("Cash operation requires amount."))?;
        let direction = val_str(payload, &["direction"])
            .unwrap_or_else(|| "in".into())
            .to_lowercase();
        let currency = val_str(payload, &["currency"])
            .unwrap_or_default()
            .to_uppercase();
        let cash_type = match direction.as_str() {
            "in" | "deposit" => {
                if currency == "EUR" {
                    "2"
                } else {
                    "0"
                }
            }
            "out" | "withdraw" | "withdrawal" => {
                if currency == "EUR" {
                    "3"
                } else {
                    "1"
                }
            }
            _ => {
                return Err(GatewayError::validation(
                    "Cash direction must be 'in' or 'out'.",
                ))
            }
        };
        Ok(format!("{cash_type}\t{}\t", format_amount(amount.abs())))
    }

    fn report(&self, payload: &Value) -> Result<String> {
        if let Some(option) = val_str(payload, &["option"]) {
            let mut opt = option.trim().to_uppercase();
            if opt.is_empty() {
                return Ok(String::new());
            }
            if opt == "0" || opt == "Z" {
                opt = "Z".into();
            } else if opt == "2" || opt == "X" {
                opt = "X".into();
            }
            return Ok(format!("{opt}\t"));
        }
        let rtype = val_str(payload, &["type"])
            .unwrap_or_else(|| "x".into())
            .to_lowercase();
        let code = match rtype.as_str() {
            "x" => "X",
            "z" => "Z",
            "d" => "D",
            "g" => "G",
            _ => {
                return Err(GatewayError::validation(
                    "Report type must be 'x', 'z', 'd', or 'g'.",
                ))
            }
        };
        Ok(format!("{code}\t"))
    }

    fn status_data(&self) -> &'static str {
        "0"
    }
}

// ---------------------------------------------------------------------------
// Compact family (FP-2000 class, protocol 2.00BG)
// ---------------------------------------------------------------------------

/// Older series: fields are NOT uniformly TAB-separated; open-receipt uses
/// commas and sale packs price/qty/discount into one token.
pub struct CompactDataBuilder;

impl DataBuilder for CompactDataBuilder {
    // <OpNum>,<Password>,<TillNum>[,<Invoice>][,<UNP>]
    fn open_receipt(
        &self,
        op_num: &str,
        password: &str,
        till: &str,
        invoice: &str,
        nsale: &str,
    ) -> String {
        let mut parts = vec![op_num, password, till];
        if !invoice.is_empty() {
            parts.push(invoice);
        }
        if !nsale.is_empty() {
            parts.push(nsale);
        }
        parts.join(",")
    }

    // <Name><Tab><TaxCd><Price>[*<Qty>[#<Unit>]][,<Pct>|;-<Abs>]
    // OR <Name><Tab><Dept><Tab><Price>[*<Qty>[#<Unit>]][,<Pct>|;-<Abs>]
    fn sale(&self, item: &Value) -> Result<String> {
        let name = item_name(item)?;
        let tax = tax_letter(item_tax(item));
        let price = item_price(item)?;
        let qty = val_str(item, &["qty", "quantity"]).unwrap_or_default();
        let unit = val_str(item, &["unit"]).unwrap_or_default();
        let department = val_str(item, &["department"]).unwrap_or_default();

        let mut suffix = price;
        if !qty.is_empty() && qty != "1" && qty != "1.000" {
            suffix.push('*');
            suffix.push_str(&qty);
            if !unit.is_empty() {
                suffix.push('#');
                suffix.push_str(&unit);
            }
        } else if !unit.is_empty() {
            suffix.push_str("*1.000#");
            suffix.push_str(&unit);
        }

        match item_discount(item) {
            Some((true, pct)) => {
                suffix.push(',');
                suffix.push_str(&pct);
            }
            Some((false, abs)) => {
                suffix.push_str(";-");
                suffix.push_str(&abs);
            }
            None => {}
        }

        if !department.is_empty() && department != "0" {
            Ok(format!("{name}\t{department}\t{suffix}"))
        } else {
            Ok(format!("{name}\t{tax}{suffix}"))
        }
    }

    // <Tab>[<PaidMode>][<Amount>]
    fn payment(&self, payment: &Value) -> Result<String> {
        let mode = payment_mode_letter(val_str(payment, &["type"]));
        let amount = val_f64(payment, &["amount"])
            .map(format_amount)
            .ok_or_else(|| GatewayError::validation("Payment amount is required."))?;
        Ok(format!("\t{mode}{amount}"))
    }

    fn nonfiscal_text(&self, text: &str) -> String {
        text.to_string()
    }

    // <Tab><Font>[<Flags>]<Text>
    fn fiscal_text(&self, text: &str) -> String {
        format!("\t1{text}")
    }

    // [<altcurrency>][<Amount>]   positive = deposit, negative = withdrawal
    fn cash(&self, payload: &Value) -> Result<String> {
        let amount = val_f64(payload, &["amount"])
            .ok_or_else(|| GatewayError::validation("Cash operation requires amount."))?;
        let direction = val_str(payload, &["direction"])
            .unwrap_or_else(|| "in".into())
            .to_lowercase();
        let currency = val_str(payload, &["currency"])
            .unwrap_or_default()
            .to_uppercase();
        let mut num = amount.abs();
        match direction.as_str() {
            "in" | "deposit" => {}
            "out" | "withdraw" | "withdrawal" => num = -num,
            _ => {
                return Err(GatewayError::validation(
                    "Cash direction must be 'in' or 'out'.",
                ))
            }
        }
        let prefix = if currency == "EUR" { "*" } else { "" };
        Ok(format!("{prefix}{}", format_amount(num)))
    }

    // '0' = Z-report, '2' = X-report, optional 'N' keeps registers
    fn report(&self, payload: &Value) -> Result<String> {
        let no_reset = crate::models::val_bool(payload, "no_reset")
            || crate::models::val_bool(payload, "no_clear");
        if let Some(option) = val_str(payload, &["option"]) {
            let mut opt = option.trim().to_uppercase();
            if opt.is_empty() {
                return Ok(String::new());
            }
            if opt == "Z" || opt == "0" {
                opt = "0".into();
            } else if opt == "X" || opt == "2" {
                opt = "2".into();
            }
            if opt == "?" || opt == "*" {
                return Ok(opt);
            }
            let suffix = if no_reset { "N" } else { "" };
            return Ok(format!("{opt}{suffix}"));
        }
        let rtype = val_str(payload, &["type"])
            .unwrap_or_else(|| "x".into())
            .to_lowercase();
        let code = match rtype.as_str() {
            "x" => "2",
            "z" => "0",
            "d" => "D",
            "g" => "G",
            _ => {
                return Err(GatewayError::validation(
                    "Report type must be 'x', 'z', 'd', or 'g'.",
                ))
            }
        };
        Ok(code.to_string())
    }

    fn status_data(&self) -> &'static str {
        "X"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
