//! The Solarman V5 framing protocol.
//!
//! Data logging sticks speak plain Modbus RTU tunneled inside a vendor
//! wrapper frame over TCP. Requests use control code `0x4510`, responses
//! `0x1510`; the stick occasionally injects `0x4710` keep-alive frames that
//! have to be skipped over. The decoder therefore never assumes byte-aligned
//! arrival and resynchronizes on the `0xA5` start marker.

use rand::Rng as _;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::checksum::{modbus_crc16, v5_checksum};

/// Protocol-imposed ceiling on registers per read request.
pub const MAX_READ_COUNT: u16 = 125;

pub const FRAME_START: u8 = 0xA5;
pub const FRAME_END: u8 = 0x15;
const CONTROL_REQUEST: u16 = 0x4510;
const CONTROL_RESPONSE: u16 = 0x1510;
const FRAME_TYPE: u8 = 0x02;
/// start(1) + length(2) + control(2) + sequence(2) + serial(4) + frametype(1).
const HEADER_LEN: usize = 12;
/// Frame bytes not counted by the length field: the 11 bytes before the
/// payload plus checksum and end marker.
const FRAME_LEN_WITHOUT_PAYLOAD: usize = 13;
/// Responses carry a 14-byte payload header (frame type, status, three
/// 4-byte time fields) before the business field.
const BUSINESS_OFFSET: usize = 25;
/// Smallest embedded RTU frame we accept: slave + fc + byte count + one data
/// byte + CRC would be 6; anything 5 or shorter carries no register data.
const MIN_RTU_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct Request {
    pub slave_id: u8,
    pub sequence: u8,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
pub enum Operation {
    ReadHoldings { address: u16, count: u16 },
    ReadInputs { address: u16, count: u16 },
    WriteHolding { address: u16, value: u16 },
    WriteHoldings { address: u16, values: Vec<u16> },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::ReadHoldings { .. } => 3,
            Operation::ReadInputs { .. } => 4,
            Operation::WriteHolding { .. } => 6,
            Operation::WriteHoldings { .. } => 16,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    /// Register data words from a read, still as big-endian byte pairs.
    Registers(Vec<u8>),
    /// Echo of a single-register write (value) or multi-register write
    /// (count of registers written).
    WriteEcho { address: u16, value: u16 },
}

/// The 8-bit rolling sequence number correlating a request to its response.
///
/// Seeded with a random non-zero value so a fresh session does not match
/// responses still in flight for a previous one, then incremented with
/// natural wraparound.
#[derive(Default)]
pub struct SequenceNumber(Option<u8>);

impl SequenceNumber {
    pub fn next(&mut self) -> u8 {
        let next = match self.0 {
            None => rand::thread_rng().gen_range(1..=255),
            Some(previous) => previous.wrapping_add(1),
        };
        self.0 = Some(next);
        next
    }
}

/// What the decoder should accept for the one outstanding request.
struct Expectation {
    sequence: u8,
    function_code: u8,
    kind: ExpectedKind,
}

enum ExpectedKind {
    Registers { count: u16 },
    Echo { address: u16, value: u16 },
}

pub struct V5Codec {
    logger_serial: u32,
    expected: Option<Expectation>,
}

impl V5Codec {
    pub fn new(logger_serial: u32) -> Self {
        Self { logger_serial, expected: None }
    }
}

/// Builds the complete wire frame for a request.
///
/// The business field is `slave ‖ fc ‖ address BE ‖ count-or-value BE ‖
/// CRC16 LE`; the wrapper's length field counts the 15 payload header bytes
/// plus the business field, and the additive checksum lands in the
/// second-to-last byte.
pub fn encode_request(logger_serial: u32, request: &Request) -> Vec<u8> {
    let mut business = Vec::with_capacity(13);
    business.push(request.slave_id);
    business.push(request.operation.function_code());
    match &request.operation {
        Operation::ReadHoldings { address, count } | Operation::ReadInputs { address, count } => {
            business.extend(address.to_be_bytes());
            business.extend(count.to_be_bytes());
        }
        Operation::WriteHolding { address, value } => {
            business.extend(address.to_be_bytes());
            business.extend(value.to_be_bytes());
        }
        Operation::WriteHoldings { address, values } => {
            business.extend(address.to_be_bytes());
            business.extend((values.len() as u16).to_be_bytes());
            business.push((values.len() * 2) as u8);
            for value in values {
                business.extend(value.to_be_bytes());
            }
        }
    }
    business.extend(modbus_crc16(&business).to_le_bytes());

    let mut frame = Vec::with_capacity(FRAME_LEN_WITHOUT_PAYLOAD + 15 + business.len());
    frame.push(FRAME_START);
    frame.extend((15 + business.len() as u16).to_le_bytes());
    frame.extend(CONTROL_REQUEST.to_le_bytes());
    frame.extend([request.sequence, 0x00]);
    frame.extend(logger_serial.to_le_bytes());
    frame.push(FRAME_TYPE);
    frame.extend([0x00; 2]); // sensor type
    frame.extend([0x00; 12]); // delivery, power-on and offset times
    frame.extend(&business);
    frame.extend([0x00, FRAME_END]);
    let checksum_index = frame.len() - 2;
    frame[checksum_index] = v5_checksum(&frame);
    frame
}

impl Encoder<&Request> for V5Codec {
    type Error = std::io::Error;

    fn encode(&mut self, request: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = match &request.operation {
            Operation::ReadHoldings { count, .. } | Operation::ReadInputs { count, .. } => {
                ExpectedKind::Registers { count: *count }
            }
            Operation::WriteHolding { address, value } => {
                ExpectedKind::Echo { address: *address, value: *value }
            }
            Operation::WriteHoldings { address, values } => {
                ExpectedKind::Echo { address: *address, value: values.len() as u16 }
            }
        };
        self.expected = Some(Expectation {
            sequence: request.sequence,
            function_code: request.operation.function_code(),
            kind,
        });
        dst.extend_from_slice(&encode_request(self.logger_serial, request));
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for V5Codec {
    type Item = Response;
    type Error = std::io::Error;

    /// Resynchronizing scan over whatever has accumulated in `src`.
    ///
    /// Any validation failure drops a single leading byte and restarts the
    /// scan, so keep-alive frames, truncated garbage and responses to stale
    /// sequence numbers are silently skipped. `Ok(None)` means more bytes
    /// are needed.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(expected) = &self.expected else {
            // Nothing outstanding; whatever arrived can only be keep-alive
            // chatter.
            src.clear();
            return Ok(None);
        };
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            while !src.is_empty() && src[0] != FRAME_START {
                src.advance(1);
            }
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            if src[5] != expected.sequence {
                src.advance(1);
                continue;
            }
            if src[7..11] != self.logger_serial.to_le_bytes() {
                src.advance(1);
                continue;
            }
            if u16::from_le_bytes([src[3], src[4]]) != CONTROL_RESPONSE {
                src.advance(1);
                continue;
            }
            if src[11] != FRAME_TYPE {
                src.advance(1);
                continue;
            }
            let payload_len = usize::from(u16::from_le_bytes([src[1], src[2]]));
            let frame_len = FRAME_LEN_WITHOUT_PAYLOAD + payload_len;
            if src.len() < frame_len {
                return Ok(None);
            }
            if src[frame_len - 1] != FRAME_END {
                src.advance(1);
                continue;
            }
            if src[frame_len - 2] != v5_checksum(&src[..frame_len]) {
                src.advance(1);
                continue;
            }
            // The embedded RTU frame sits between the response payload
            // header and the trailer.
            if frame_len - 2 < BUSINESS_OFFSET + MIN_RTU_LEN {
                src.advance(1);
                continue;
            }
            let rtu = &src[BUSINESS_OFFSET..frame_len - 2];
            let (body, crc) = rtu.split_at(rtu.len() - 2);
            if modbus_crc16(body) != u16::from_le_bytes([crc[0], crc[1]]) {
                src.advance(1);
                continue;
            }
            if body[1] != expected.function_code {
                src.advance(1);
                continue;
            }
            let response = match expected.kind {
                ExpectedKind::Registers { count } => {
                    // slave + fc + byte count precede the register words.
                    if body.len() - 3 != usize::from(count) * 2 {
                        src.advance(1);
                        continue;
                    }
                    Response::Registers(body[3..].to_vec())
                }
                ExpectedKind::Echo { address, value } => {
                    if body.len() != 6 {
                        src.advance(1);
                        continue;
                    }
                    let echo_address = u16::from_be_bytes([body[2], body[3]]);
                    let echo_value = u16::from_be_bytes([body[4], body[5]]);
                    if (echo_address, echo_value) != (address, value) {
                        src.advance(1);
                        continue;
                    }
                    Response::WriteEcho { address: echo_address, value: echo_value }
                }
            };
            src.advance(frame_len);
            self.expected = None;
            return Ok(Some(response));
        }
    }
}

/// Synthetic response frame builders shared by the test suites of this
/// module, the transport session and the inverter client.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A `0x1510` response frame wrapping `rtu`.
    pub(crate) fn response_frame(sequence: u8, serial: u32, rtu: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_START];
        frame.extend((14 + rtu.len() as u16).to_le_bytes());
        frame.extend(CONTROL_RESPONSE.to_le_bytes());
        frame.extend([sequence, 0x00]);
        frame.extend(serial.to_le_bytes());
        frame.push(FRAME_TYPE);
        frame.push(0x01); // status
        frame.extend([0x00; 12]);
        frame.extend(rtu);
        frame.extend([0x00, FRAME_END]);
        let checksum_index = frame.len() - 2;
        frame[checksum_index] = v5_checksum(&frame);
        frame
    }

    pub(crate) fn registers_response(
        sequence: u8,
        serial: u32,
        function_code: u8,
        words: &[u16],
    ) -> Vec<u8> {
        let mut rtu = vec![0x01, function_code, (words.len() * 2) as u8];
        for word in words {
            rtu.extend(word.to_be_bytes());
        }
        rtu.extend(modbus_crc16(&rtu).to_le_bytes());
        response_frame(sequence, serial, &rtu)
    }

    pub(crate) fn echo_response(
        sequence: u8,
        serial: u32,
        function_code: u8,
        address: u16,
        value: u16,
    ) -> Vec<u8> {
        let mut rtu = vec![0x01, function_code];
        rtu.extend(address.to_be_bytes());
        rtu.extend(value.to_be_bytes());
        rtu.extend(modbus_crc16(&rtu).to_le_bytes());
        response_frame(sequence, serial, &rtu)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{registers_response as registers_response_fc, response_frame};
    use super::*;

    const SERIAL: u32 = 123456789;

    fn read_request(sequence: u8, address: u16, count: u16) -> Request {
        Request {
            slave_id: 1,
            sequence,
            operation: Operation::ReadHoldings { address, count },
        }
    }

    fn registers_response(sequence: u8, serial: u32, words: &[u16]) -> Vec<u8> {
        registers_response_fc(sequence, serial, 3, words)
    }

    /// Runs a request through the codec and then decodes `inbound`.
    fn decode(request: &Request, inbound: &[u8]) -> Option<Response> {
        let mut codec = V5Codec::new(SERIAL);
        let mut outbound = BytesMut::new();
        codec.encode(request, &mut outbound).unwrap();
        let mut buffer = BytesMut::from(inbound);
        codec.decode(&mut buffer).unwrap()
    }

    #[test]
    fn encodes_known_read_frame() {
        let frame = encode_request(SERIAL, &read_request(5, 0x003B, 0x0070));
        assert_eq!(
            frame,
            [
                0xA5, 0x17, 0x00, 0x10, 0x45, 0x05, 0x00, 0x15, 0xCD, 0x5B, 0x07, 0x02, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x01, 0x03, 0x00, 0x3B, 0x00, 0x70, 0x35, 0xE3, 0x7E, 0x15,
            ]
        );
    }

    #[test]
    fn round_trips_register_payload() {
        let request = read_request(5, 0x003B, 3);
        let words = [0x1234, 0xABCD, 0x0001];
        let decoded = decode(&request, &registers_response(5, SERIAL, &words));
        assert_eq!(
            decoded,
            Some(Response::Registers(vec![0x12, 0x34, 0xAB, 0xCD, 0x00, 0x01]))
        );
    }

    #[test]
    fn resynchronizes_over_junk_prefix() {
        let request = read_request(9, 0x0003, 2);
        let clean = registers_response(9, SERIAL, &[7, 8]);
        for junk_len in [1usize, 3, 17, 255] {
            let mut inbound: Vec<u8> = (0..junk_len).map(|i| (i % 0xA4) as u8).collect();
            inbound.extend(&clean);
            let decoded = decode(&request, &inbound);
            assert_eq!(
                decoded,
                Some(Response::Registers(vec![0x00, 0x07, 0x00, 0x08])),
                "junk prefix of {junk_len} bytes"
            );
        }
    }

    #[test]
    fn rejects_corrupted_v5_checksum() {
        let request = read_request(20, 0x0003, 1);
        let mut frame = registers_response(20, SERIAL, &[42]);
        let checksum_index = frame.len() - 2;
        frame[checksum_index] ^= 0x04;
        assert_eq!(decode(&request, &frame), None);
    }

    #[test]
    fn rejects_corrupted_modbus_crc() {
        let request = read_request(21, 0x0003, 1);
        let mut frame = registers_response(21, SERIAL, &[42]);
        let crc_index = frame.len() - 3;
        frame[crc_index] ^= 0x80;
        assert_eq!(decode(&request, &frame), None);
    }

    #[test]
    fn rejects_sequence_mismatch() {
        let request = read_request(30, 0x0003, 1);
        // Structurally valid frame with the wrong sequence echoed back.
        assert_eq!(decode(&request, &registers_response(31, SERIAL, &[42])), None);
    }

    #[test]
    fn rejects_foreign_logger_serial() {
        let request = read_request(30, 0x0003, 1);
        assert_eq!(decode(&request, &registers_response(30, SERIAL + 1, &[42])), None);
    }

    #[test]
    fn skips_keep_alive_before_response() {
        let request = read_request(12, 0x0003, 1);
        // Keep-alives use control code 0x4710 and frequently precede the
        // real response in the same read.
        let mut keep_alive = registers_response(12, SERIAL, &[0]);
        keep_alive[3..5].copy_from_slice(&0x4710u16.to_le_bytes());
        let mut inbound = keep_alive;
        inbound.extend(registers_response(12, SERIAL, &[42]));
        assert_eq!(decode(&request, &inbound), Some(Response::Registers(vec![0x00, 0x2A])));
    }

    #[test]
    fn rejects_register_count_mismatch() {
        let request = read_request(40, 0x0003, 4);
        // Only two words come back for a four register request.
        assert_eq!(decode(&request, &registers_response(40, SERIAL, &[1, 2])), None);
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let request = read_request(50, 0x0003, 2);
        let frame = registers_response(50, SERIAL, &[1, 2]);
        let mut codec = V5Codec::new(SERIAL);
        let mut outbound = BytesMut::new();
        codec.encode(&request, &mut outbound).unwrap();
        let mut buffer = BytesMut::from(&frame[..frame.len() - 4]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        // The partial frame must not have been discarded.
        buffer.extend_from_slice(&frame[frame.len() - 4..]);
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Response::Registers(vec![0x00, 0x01, 0x00, 0x02]))
        );
    }

    #[test]
    fn decodes_write_echo() {
        let request = Request {
            slave_id: 1,
            sequence: 77,
            operation: Operation::WriteHolding { address: 0x002A, value: 1500 },
        };
        let mut rtu = vec![0x01, 0x06, 0x00, 0x2A];
        rtu.extend(1500u16.to_be_bytes());
        rtu.extend(modbus_crc16(&rtu).to_le_bytes());
        let frame = response_frame(77, SERIAL, &rtu);
        assert_eq!(
            decode(&request, &frame),
            Some(Response::WriteEcho { address: 0x002A, value: 1500 })
        );
    }

    #[test]
    fn sequence_number_seeds_nonzero_and_increments() {
        let mut sequence = SequenceNumber::default();
        let first = sequence.next();
        assert_ne!(first, 0);
        assert_eq!(sequence.next(), first.wrapping_add(1));
        assert_eq!(sequence.next(), first.wrapping_add(2));
    }
}
