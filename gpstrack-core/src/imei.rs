//! Hardware identity helpers: BCD digit strings and IMEI check digits.

/// Nibbles of `bytes` as lowercase hex digits, high nibble first.
pub fn hex_digits(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Packed BCD integer of `digits` nibbles starting at the high nibble of `buf[0]`.
/// `None` when `buf` is too short or a nibble is not a decimal digit.
pub fn bcd_integer(buf: &[u8], digits: usize) -> Option<u64> {
    if buf.len() < digits.div_ceil(2) {
        return None;
    }
    let mut result: u64 = 0;
    for i in 0..digits {
        let byte = buf[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if nibble > 9 {
            return None;
        }
        result = result * 10 + nibble as u64;
    }
    Some(result)
}

/// Pack a decimal digit string into BCD, two digits per byte. Odd lengths are padded with a
/// trailing zero nibble.
pub fn encode_bcd(digits: &str) -> Option<Vec<u8>> {
    let values: Vec<u8> = digits
        .bytes()
        .map(|c| c.is_ascii_digit().then(|| c - b'0'))
        .collect::<Option<_>>()?;
    Some(
        values
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
            .collect(),
    )
}

/// Luhn check digit for a payload of decimal digits.
pub fn luhn_check_digit(payload: &str) -> Option<u8> {
    let mut sum = 0u32;
    for (i, c) in payload.bytes().rev().enumerate() {
        if !c.is_ascii_digit() {
            return None;
        }
        let mut d = (c - b'0') as u32;
        if i % 2 == 0 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    Some(((10 - sum % 10) % 10) as u8)
}

/// `payload` followed by its Luhn check digit.
pub fn luhn_append(payload: &str) -> Option<String> {
    let check = luhn_check_digit(payload)?;
    Some(format!("{}{}", payload, check))
}

/// Hardware ids accepted for identification: 15 decimal digits.
pub fn is_imei(s: &str) -> bool {
    s.len() == 15 && s.bytes().all(|c| c.is_ascii_digit())
}

/// Short device ids (10 digits) are right-padded with zeros to 14 and Luhn-completed.
pub fn from_short_id(id: &str) -> Option<String> {
    luhn_append(&format!("{:0<14}", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_bcd() {
        let buf = [0x01, 0x23, 0x45, 0x67, 0x89];
        assert_eq!(hex_digits(&buf), "0123456789");
        assert_eq!(bcd_integer(&buf, 4), Some(123));
        assert_eq!(bcd_integer(&buf, 3), Some(12));
        assert_eq!(bcd_integer(&buf, 11), None);
        assert_eq!(bcd_integer(&[0x1a], 2), None);
    }

    #[test]
    fn bcd_pack() {
        assert_eq!(
            encode_bcd("1234567890123450"),
            Some(vec![0x12, 0x34, 0x56, 0x78, 0x90, 0x12, 0x34, 0x50])
        );
        assert_eq!(encode_bcd("123"), Some(vec![0x12, 0x30]));
        assert_eq!(encode_bcd("12a"), None);
    }

    #[test]
    fn luhn() {
        assert_eq!(luhn_check_digit("01234567890123"), Some(7));
        assert_eq!(luhn_check_digit("35341903296748"), Some(6));
        assert_eq!(luhn_append("0123456789012"), Some("01234567890128".into()));
        assert_eq!(luhn_check_digit("12x"), None);
    }

    #[test]
    fn short_id_padding() {
        assert_eq!(from_short_id("1234567890").as_deref(), Some("123456789000003"));
    }

    #[test]
    fn imei_shape() {
        assert!(is_imei("353419032967486"));
        assert!(!is_imei("35341903296748"));
        assert!(!is_imei("35341903296748a"));
    }
}
