//! TLV codec for the pinpad protocol.
//!
//! Tags are 1, 2, or 3 bytes wide: a first byte with the top bit set makes
//! the tag at least two bytes, and a 0xDF first byte followed by a second
//! byte with the top bit set makes it three. Length is always one byte.

use std::collections::BTreeMap;

/// Well-known tags.
pub mod tag {
    pub const AMOUNT: u32 = 0x81;
    pub const CASHBACK: u32 = 0x9F04;
    pub const RRN: u32 = 0xDF01;
    pub const AUTH_ID: u32 = 0xDF02;
    pub const REFERENCE: u32 = 0xDF03;
    pub const TIP: u32 = 0xDF63;
    pub const TRANSACTION_RESULT: u32 = 0xDF05;
    pub const TRANSACTION_ERROR: u32 = 0xDF06;
    pub const HOST_RRN: u32 = 0xDF07;
    pub const HOST_AUTH_ID: u32 = 0xDF08;
    pub const HOST_CODE: u32 = 0xDF09;
    pub const CARD_SCHEME: u32 = 0xDF00;
    pub const MASKED_PAN: u32 = 0xDF0A;
    pub const CARDHOLDER_NAME: u32 = 0x5F20;
    pub const PAY_INTERFACE: u32 = 0xDF25;
    pub const TRANS_TYPE: u32 = 0xDF10;
    pub const EMV_STAN: u32 = 0x9F41;
    pub const TRANS_DATE: u32 = 0x9A;
    pub const TRANS_TIME: u32 = 0x9F21;
    pub const TERMINAL_ID: u32 = 0x9F1C;
    pub const MERCHANT_ID: u32 = 0x9F16;
    pub const MERCHANT_NAME_BG: u32 = 0xDF31;
    pub const BATCH_NUM: u32 = 0xDF61;
    pub const CURRENCY_NAME: u32 = 0xDF27;
    pub const CURRENCY_CODE: u32 = 0x5F2A;

    /// Every tag requested for a full receipt.
    pub const RECEIPT_ALL: &[u32] = &[
        0x81, 0x9F04, 0x9A, 0x9F21, 0x9F06, 0x9F26, 0x9F1C, 0x9F16, 0x5F2A, 0x9F41, 0x5F20,
        0xDF00, 0xDF01, 0xDF02, 0xDF03, 0xDF04, 0xDF05, 0xDF06, 0xDF07, 0xDF08, 0xDF09, 0xDF0A,
        0xDF0B, 0xDF10, 0xDF12, 0xDF19, 0xDF23, 0xDF25, 0xDF24, 0xDF26, 0xDF27, 0xDF28, 0xDF29,
        0xDF2A, 0xDF2B, 0xDF2C, 0xDF2D, 0xDF2E, 0xDF2F, 0xDF30, 0xDF31, 0xDF60, 0xDF61, 0xDF62,
        0xDF63, 0xDF64,
    ];
}

pub type TagMap = BTreeMap<u32, Vec<u8>>;

/// Encode a tag number into its positional width.
pub fn encode_tag(tag: u32) -> Vec<u8> {
    if tag <= 0xFF {
        vec![tag as u8]
    } else if tag <= 0xFFFF {
        vec![(tag >> 8) as u8, tag as u8]
    } else {
        vec![(tag >> 16) as u8, (tag >> 8) as u8, tag as u8]
    }
}

/// Decode the tag at `offset`. Returns `(tag, new_offset)`, or `None` past
/// the end of the buffer.
pub fn decode_tag(data: &[u8], offset: usize) -> Option<(u32, usize)> {
    let b0 = *data.get(offset)?;
    if b0 < 0x80 {
        return Some((b0 as u32, offset + 1));
    }
    let Some(&b1) = data.get(offset + 1) else {
        return Some((b0 as u32, offset + 1));
    };
    if b0 == 0xDF && b1 >= 0x80 {
        if let Some(&b2) = data.get(offset + 2) {
            let tag = ((b0 as u32) << 16) | ((b1 as u32) << 8) | b2 as u32;
            return Some((tag, offset + 3));
        }
    }
    Some((((b0 as u32) << 8) | b1 as u32, offset + 2))
}

/// One element: tag + length + value.
pub fn encode(tag: u32, value: &[u8]) -> Vec<u8> {
    let mut out = encode_tag(tag);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
    out
}

/// 4-byte big-endian minor-unit amount under the given tag.
pub fn encode_amount(tag: u32, amount_cents: u32) -> Vec<u8> {
    encode(tag, &amount_cents.to_be_bytes())
}

pub fn encode_str(tag: u32, value: &str) -> Vec<u8> {
    encode(tag, value.as_bytes())
}

/// Bare tag list (no lengths/values) for GET RECEIPT TAGS requests.
pub fn encode_tag_list(tags: &[u32]) -> Vec<u8> {
    tags.iter().flat_map(|&t| encode_tag(t)).collect()
}

/// Decode a TLV blob into a tag map. Truncated trailing elements are
/// dropped, matching device behaviour on partial reads.
pub fn decode(data: &[u8]) -> TagMap {
    let mut result = TagMap::new();
    let mut offset = 0;
    while offset < data.len() {
        let Some((tag, next)) = decode_tag(data, offset) else {
            break;
        };
        offset = next;
        let Some(&length) = data.get(offset) else {
            break;
        };
        offset += 1;
        let end = offset + length as usize;
        if end > data.len() {
            break;
        }
        result.insert(tag, data[offset..end].to_vec());
        offset = end;
    }
    result
}

pub fn get_int(tags: &TagMap, tag: u32) -> u64 {
    tags.get(&tag)
        .map(|v| v.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
        .unwrap_or(0)
}

pub fn get_str(tags: &TagMap, tag: u32) -> String {
    tags.get(&tag)
        .map(|v| {
            v.iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect::<String>()
                .trim_end_matches('\0')
                .to_string()
        })
        .unwrap_or_default()
}

/// BCD bytes rendered as hex digits (dates, times).
pub fn get_bcd(tags: &TagMap, tag: u32) -> String {
    tags.get(&tag)
        .map(|v| v.iter().map(|b| format!("{b:02X}")).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_widths_are_positional() {
        assert_eq!(encode_tag(0x81), vec![0x81]);
        assert_eq!(encode_tag(0x9F04), vec![0x9F, 0x04]);
        assert_eq!(encode_tag(0xDF01), vec![0xDF, 0x01]);
        assert_eq!(encode_tag(0xDF8004), vec![0xDF, 0x80, 0x04]);

        assert_eq!(decode_tag(&[0x81, 0x00], 0), Some((0x81, 1)));
        assert_eq!(decode_tag(&[0x9F, 0x04, 0x00], 0), Some((0x9F04, 2)));
        assert_eq!(decode_tag(&[0xDF, 0x01, 0x00], 0), Some((0xDF01, 2)));
        assert_eq!(decode_tag(&[0xDF, 0x80, 0x04, 0x00], 0), Some((0xDF8004, 3)));
    }

    #[test]
    fn test_round_trip_well_known_tags() {
        let mut blob = Vec::new();
        blob.extend(encode_amount(tag::AMOUNT, 1234));
        blob.extend(encode_str(tag::HOST_RRN, "123456789012"));
        blob.extend(encode(tag::TRANS_DATE, &[0x25, 0x08, 0x01]));
        blob.extend(encode_str(tag::CARDHOLDER_NAME, "IVAN IVANOV"));

        let tags = decode(&blob);
        assert_eq!(get_int(&tags, tag::AMOUNT), 1234);
        assert_eq!(get_str(&tags, tag::HOST_RRN), "123456789012");
        assert_eq!(get_bcd(&tags, tag::TRANS_DATE), "250801");
        assert_eq!(get_str(&tags, tag::CARDHOLDER_NAME), "IVAN IVANOV");
    }

    #[test]
    fn test_amount_is_four_byte_big_endian() {
        let blob = encode_amount(tag::AMOUNT, 1234);
        assert_eq!(blob, vec![0x81, 0x04, 0x00, 0x00, 0x04, 0xD2]);
    }

    #[test]
    fn test_truncated_element_is_dropped() {
        let mut blob = encode_str(tag::HOST_RRN, "ok");
        blob.extend([0xDF, 0x02, 0x10, 0x41]); // claims 16 bytes, has 1
        let tags = decode(&blob);
        assert_eq!(get_str(&tags, tag::HOST_RRN), "ok");
        assert!(!tags.contains_key(&tag::AUTH_ID));
    }

    #[test]
    fn test_tag_list_encoding() {
        let bytes = encode_tag_list(&[0x81, 0x9F04, 0xDF01]);
        assert_eq!(bytes, vec![0x81, 0x9F, 0x04, 0xDF, 0x01]);
    }

    #[test]
    fn test_missing_tags_defaults() {
        let tags = TagMap::new();
        assert_eq!(get_int(&tags, tag::AMOUNT), 0);
        assert_eq!(get_str(&tags, tag::HOST_RRN), "");
        assert_eq!(get_bcd(&tags, tag::TRANS_DATE), "");
    }
}
