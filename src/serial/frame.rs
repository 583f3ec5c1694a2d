//! Frame build/parse for the generic and proprietary command families.

use super::opcodes::*;
use crate::crc16::{crc16, from_wire_bytes, to_wire_bytes, verify_frame};
use crate::error::{Error, Result};
use heapless::Vec as HVec;

/// Maximum frame size this engine ever builds or parses.
pub const MAX_FRAME_LEN: usize = 260;

/// A decoded, CRC-verified response.
#[derive(Debug, Clone)]
pub enum ParsedResponse {
    /// Generic read response: `addr`-relative payload bytes, big-endian
    /// per register.
    Read { payload: HVec<u8, 254> },
    /// Write-multiple positive acknowledgment.
    WriteAck,
    /// A NACK: echoed command and error code.
    Nack { cmd: u8, code: u8 },
    /// A proprietary command's reply payload.
    Proprietary { opcode: u8, payload: HVec<u8, 254> },
}

/// Build a generic read frame: `start_addr`, `count` words (`count <=
/// MAX_READ_WORDS`).
pub fn build_read_frame(start_addr: u16, count: u16) -> Result<HVec<u8, 8>> {
    if count == 0 || count > MAX_READ_WORDS {
        return Err(Error::InvalidArgument);
    }
    let [addr_msb, addr_lsb] = start_addr.to_be_bytes();
    let mut body: HVec<u8, 8> = HVec::new();
    body.extend_from_slice(&[START_BYTE, FN_READ, addr_msb, addr_lsb, 0x00, count as u8])
        .map_err(|_| Error::InvalidSize)?;
    append_crc(&mut body)
}

/// Build a write-multiple frame for `start_addr` and the given register
/// values (big-endian payload).
pub fn build_write_frame(start_addr: u16, values: &[u16]) -> Result<HVec<u8, 264>> {
    if values.is_empty() || values.len() > MAX_READ_WORDS as usize {
        return Err(Error::InvalidArgument);
    }
    let [addr_msb, addr_lsb] = start_addr.to_be_bytes();
    let byte_count = (values.len() * 2) as u8;
    let mut body: HVec<u8, 264> = HVec::new();
    body.extend_from_slice(&[START_BYTE, FN_WRITE_MULTIPLE, addr_msb, addr_lsb, 0x00, values.len() as u8, byte_count])
        .map_err(|_| Error::InvalidSize)?;
    for v in values {
        let [msb, lsb] = v.to_be_bytes();
        body.extend_from_slice(&[msb, lsb]).map_err(|_| Error::InvalidSize)?;
    }
    append_crc(&mut body)
}

/// Build a proprietary command frame with an opcode and (for `OP_RESET`) a
/// one-byte sub-option, little-endian payload for anything beyond that.
pub fn build_proprietary_frame(opcode: u8, payload: &[u8]) -> Result<HVec<u8, 16>> {
    let mut body: HVec<u8, 16> = HVec::new();
    body.extend_from_slice(&[START_BYTE, opcode]).map_err(|_| Error::InvalidSize)?;
    body.extend_from_slice(payload).map_err(|_| Error::InvalidSize)?;
    append_crc(&mut body)
}

fn append_crc<const N: usize>(body: &mut HVec<u8, N>) -> Result<HVec<u8, N>> {
    let crc = crc16(body);
    body.extend_from_slice(&to_wire_bytes(crc)).map_err(|_| Error::InvalidSize)?;
    Ok(body.clone())
}

/// Parse and CRC-verify a raw response frame. `expected_cmd` disambiguates
/// a generic read/write response from a proprietary one: pass the function
/// code or opcode just transmitted.
pub fn parse_response(expected_cmd: u8, frame: &[u8]) -> Result<ParsedResponse> {
    if frame.len() < 5 {
        return Err(Error::InvalidSize);
    }
    if !verify_frame(frame) {
        let body = &frame[..frame.len() - 2];
        let expected = crc16(body);
        let received = from_wire_bytes(frame[frame.len() - 2], frame[frame.len() - 1]);
        return Err(Error::SerialCrcMismatch { expected, received });
    }
    if frame[0] != START_BYTE {
        return Err(Error::InvalidSize);
    }

    if frame[1] == NACK_MARKER {
        if frame.len() < 6 {
            return Err(Error::InvalidSize);
        }
        return Err(Error::SerialNack { cmd: frame[2], code: frame[3] });
    }

    match expected_cmd {
        FN_READ => {
            let byte_count = frame[2] as usize;
            let payload = frame.get(3..3 + byte_count).ok_or(Error::InvalidSize)?;
            let mut out: HVec<u8, 254> = HVec::new();
            out.extend_from_slice(payload).map_err(|_| Error::InvalidSize)?;
            Ok(ParsedResponse::Read { payload: out })
        }
        FN_WRITE_MULTIPLE => Ok(ParsedResponse::WriteAck),
        opcode => {
            // Mirrors the generic-read shape: a byte-count at frame[2]
            // precedes the payload, ahead of the trailing CRC.
            let byte_count = frame[2] as usize;
            let payload = frame.get(3..3 + byte_count).ok_or(Error::InvalidSize)?;
            let mut out: HVec<u8, 254> = HVec::new();
            out.extend_from_slice(payload).map_err(|_| Error::InvalidSize)?;
            Ok(ParsedResponse::Proprietary { opcode, payload: out })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_read_frame_matches_scenario_1() {
        let frame = build_read_frame(0, 0x10).unwrap();
        assert_eq!(&frame[..], &[0xAA, 0x03, 0x00, 0x00, 0x00, 0x10, 0x44, 0x06]);
    }

    #[test]
    fn build_read_frame_rejects_zero_count() {
        assert!(build_read_frame(0, 0).is_err());
    }

    #[test]
    fn parse_nack_extracts_cmd_and_code() {
        let mut frame = vec![0xAA, 0x00, 0x03, 0x01];
        let crc = crc16(&frame);
        frame.extend_from_slice(&to_wire_bytes(crc));
        let err = parse_response(FN_READ, &frame).unwrap_err();
        assert_eq!(err, Error::SerialNack { cmd: 0x03, code: 0x01 });
    }

    #[test]
    fn parse_response_detects_crc_mismatch() {
        let mut frame = vec![0xAA, 0x03, 0x02, 0x00, 0x01];
        frame.extend_from_slice(&[0x00, 0x00]);
        assert!(matches!(parse_response(FN_READ, &frame), Err(Error::SerialCrcMismatch { .. })));
    }

    #[test]
    fn parse_read_response_round_trips_payload() {
        let payload = [0x8C, 0x05];
        let mut frame = vec![0xAA, 0x03, payload.len() as u8];
        frame.extend_from_slice(&payload);
        let crc = crc16(&frame);
        frame.extend_from_slice(&to_wire_bytes(crc));
        match parse_response(FN_READ, &frame).unwrap() {
            ParsedResponse::Read { payload: p } => assert_eq!(&p[..], &payload),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scenario_3_parse_proprietary_pack_voltage() {
        // Literal wire bytes: 0xAA 0x14 0x04 <b0 b1 b2 b3> CRC_L CRC_H —
        // the byte-count at offset 2 mirrors the generic-read shape.
        let payload = [0x14, 0xAE, 0x47, 0x42];
        let mut frame = vec![0xAA, OP_PACK_VOLTAGE, payload.len() as u8];
        frame.extend_from_slice(&payload);
        let crc = crc16(&frame);
        frame.extend_from_slice(&to_wire_bytes(crc));
        match parse_response(OP_PACK_VOLTAGE, &frame).unwrap() {
            ParsedResponse::Proprietary { opcode, payload: p } => {
                assert_eq!(opcode, OP_PACK_VOLTAGE);
                assert_eq!(&p[..], &payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
