//! Checksums used by the two MSP wire versions.

/// CRC-8/DVB-S2 (poly 0xD5) step for one byte.
#[inline]
pub fn crc8_dvb_s2(crc: u8, byte: u8) -> u8 {
    let mut crc = crc ^ byte;
    for _ in 0..8 {
        crc = if crc & 0x80 != 0 {
            (crc << 1) ^ 0xD5
        } else {
            crc << 1
        };
    }
    crc
}

/// CRC-8/DVB-S2 over `data`, continuing from `crc` (seed 0 for a fresh frame).
pub fn crc8_dvb_s2_update(crc: u8, data: &[u8]) -> u8 {
    data.iter().fold(crc, |acc, &b| crc8_dvb_s2(acc, b))
}

/// Running XOR used by the legacy framing.
pub fn xor_update(checksum: u8, data: &[u8]) -> u8 {
    data.iter().fold(checksum, |acc, &b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dvb_s2_check_value() {
        assert_eq!(crc8_dvb_s2_update(0, b"123456789"), 0xBC);
    }

    #[test]
    fn dvb_s2_zero_input_stays_zero() {
        assert_eq!(crc8_dvb_s2_update(0, &[0, 0, 0, 0, 0]), 0);
    }

    #[test]
    fn xor_is_self_inverse() {
        let data = [0x04, 0x69, 0xAA, 0xBB, 0xCC, 0xDD];
        let x = xor_update(0, &data);
        assert_eq!(x, 0x04 ^ 0x69 ^ 0xAA ^ 0xBB ^ 0xCC ^ 0xDD);
        assert_eq!(xor_update(x, &data), 0);
    }
}
