/// Modbus CRC-16 over `data`, polynomial 0xA001, initial value 0xFFFF,
/// LSB-first. Stored little-endian when embedded in a frame.
pub fn modbus_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// The V5 additive checksum: sum of every frame byte except the start
/// marker, the checksum byte itself and the end marker, truncated to 8 bits.
///
/// `frame` must be the complete frame including the trailing `0x15`.
pub fn v5_checksum(frame: &[u8]) -> u8 {
    frame[1..frame.len() - 2]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vectors() {
        // Read-holdings request body for slave 1, start 0x003B, count 0x0070.
        assert_eq!(modbus_crc16(&[0x01, 0x03, 0x00, 0x3B, 0x00, 0x70]), 0xE335);
        // The classic reference vector.
        assert_eq!(modbus_crc16(&[0x01, 0x04, 0x02, 0xFF, 0xFF]), 0x80B8);
        assert_eq!(modbus_crc16(&[]), 0xFFFF);
    }

    #[test]
    fn crc16_detects_corruption() {
        let mut data = [0x01, 0x03, 0x00, 0x3B, 0x00, 0x70];
        let good = modbus_crc16(&data);
        data[3] ^= 0x01;
        assert_ne!(modbus_crc16(&data), good);
    }

    #[test]
    fn v5_checksum_sums_interior_bytes() {
        // start | three interior bytes | checksum placeholder | end
        let frame = [0xA5, 0x01, 0x02, 0x03, 0x00, 0x15];
        assert_eq!(v5_checksum(&frame), 0x06);
    }

    #[test]
    fn v5_checksum_wraps_modulo_256() {
        let frame = [0xA5, 0xFF, 0xFF, 0x03, 0x00, 0x15];
        assert_eq!(v5_checksum(&frame), 0x01);
    }
}
