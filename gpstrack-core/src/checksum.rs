//! Frame checksums used by the binary tracker protocols.

/// CRC-16/X-25 (reflected 0x1021, init and xorout 0xFFFF). GT06 frames.
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

/// CRC-16/ARC (reflected 0x8005, init 0). Teltonika AVL packets.
pub fn crc16_ibm(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xa001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Inverted 16-bit byte sum. Xexun2 frames.
pub fn xexun2_checksum(data: &[u8]) -> u16 {
    !data
        .iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_values() {
        assert_eq!(crc16_x25(b"123456789"), 0x906e);
        assert_eq!(crc16_ibm(b"123456789"), 0xbb3d);
    }

    #[test]
    fn gt06_login_crc() {
        // 78 78 0D 01 01 23 45 67 89 01 23 45 00 01 | 8C DD 0D 0A
        let body = [
            0x0d, 0x01, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45, 0x00, 0x01,
        ];
        assert_eq!(crc16_x25(&body), 0x8cdd);
    }

    #[test]
    fn xexun2_sum() {
        assert_eq!(xexun2_checksum(&[]), 0xffff);
        assert_eq!(xexun2_checksum(&[0x01]), 0xfffe);
        assert_eq!(xexun2_checksum(&[0xff, 0xff]), !0x01fe);
    }
}
