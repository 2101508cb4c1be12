//! Wire-format constants, request parsing, and response/exception framing
//! (§4.2, §4.3, §6). Byte-exact: CRC is little-endian on the wire, all other
//! multi-byte fields are big-endian.

use crate::crc;
use crate::error::{DropReason, Exception};
use heapless::Vec;

/// Maximum total frame size, request or response.
pub const MAX_FRAME_LEN: usize = 256;

/// Respond-always broadcast variant layered on top of standard Modbus
/// (§4.2, §6). Standard Modbus broadcast, 0x00, is request-only and never
/// reaches a response path.
pub const BROADCAST_RESPOND: u8 = 0xFF;

/// Standard Modbus broadcast: request-only, no response.
pub const BROADCAST_SILENT: u8 = 0x00;

pub type ResponseBuf = Vec<u8, MAX_FRAME_LEN>;

/// A frame that passed length, address, and CRC checks (§4.2).
pub struct ValidFrame<'a> {
    pub slave_addr: u8,
    pub func_code: u8,
    /// The full frame, CRC included — function handlers index into this
    /// for their own argument layout.
    pub raw: &'a [u8],
    pub was_broadcast: bool,
}

/// Validates a candidate byte run against §4.2, in the mandated order:
/// length, then address, then CRC. Returns the reason for rejection so the
/// caller can log it; the wire contract is always "emit nothing" either way.
pub fn validate<'a>(raw: &'a [u8], own_addr: u8, use_crc_table: bool) -> Result<ValidFrame<'a>, DropReason> {
    if raw.len() < 4 {
        return Err(DropReason::ShortFrame);
    }
    let req_addr = raw[0];
    if req_addr != own_addr && req_addr != BROADCAST_RESPOND {
        return Err(DropReason::AddressMismatch);
    }
    let len = raw.len();
    let received_crc = u16::from_le_bytes([raw[len - 2], raw[len - 1]]);
    let calculated_crc = crc::compute(&raw[..len - 2], use_crc_table);
    if received_crc != calculated_crc {
        return Err(DropReason::CrcMismatch);
    }
    Ok(ValidFrame {
        slave_addr: req_addr,
        func_code: raw[1],
        raw,
        was_broadcast: req_addr == BROADCAST_RESPOND,
    })
}

/// Appends CRC-16/Modbus (low byte first) to `payload` in place.
pub fn append_crc(payload: &mut ResponseBuf, use_crc_table: bool) {
    let crc = crc::compute(payload, use_crc_table);
    let _ = payload.push((crc & 0xFF) as u8);
    let _ = payload.push((crc >> 8) as u8);
}

/// Builds `[own_addr][func][payload...][CRC_lo][CRC_hi]`. `own_addr` is
/// always the instance's real address, even when the request was the
/// respond-always broadcast (§4.3).
pub fn build_response(own_addr: u8, func_code: u8, payload: &[u8], use_crc_table: bool) -> ResponseBuf {
    let mut buf = ResponseBuf::new();
    let _ = buf.push(own_addr);
    let _ = buf.push(func_code);
    let _ = buf.extend_from_slice(payload);
    append_crc(&mut buf, use_crc_table);
    buf
}

/// Builds `[own_addr][func | 0x80][exception_code][CRC_lo][CRC_hi]`, always
/// exactly 5 octets (§8, exception-shape invariant).
pub fn build_exception(
    own_addr: u8,
    func_code: u8,
    exception: Exception,
    use_crc_table: bool,
) -> ResponseBuf {
    let mut buf = ResponseBuf::new();
    let _ = buf.push(own_addr);
    let _ = buf.push(func_code | 0x80);
    let _ = buf.push(exception.into());
    append_crc(&mut buf, use_crc_table);
    buf
}

/// Reads a big-endian u16 at `raw[offset..offset+2]`. `None` if short —
/// callers degrade this to a dropped frame, never a panic (§10.3).
pub fn read_u16_be(raw: &[u8], offset: usize) -> Option<u16> {
    let lo = *raw.get(offset + 1)?;
    let hi = *raw.get(offset)?;
    Some(u16::from_be_bytes([hi, lo]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> heapless::Vec<u8, MAX_FRAME_LEN> {
        bytes.iter().copied().collect()
    }

    #[test]
    fn short_frame_rejected() {
        let raw = frame(&[0x01, 0x03, 0x00]);
        assert_eq!(validate(&raw, 0x01, false), Err(DropReason::ShortFrame));
    }

    #[test]
    fn address_mismatch_rejected() {
        let raw = frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
        assert_eq!(validate(&raw, 0x02, false), Err(DropReason::AddressMismatch));
    }

    #[test]
    fn bad_crc_rejected() {
        let raw = frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00]);
        assert_eq!(validate(&raw, 0x01, false), Err(DropReason::CrcMismatch));
    }

    #[test]
    fn valid_frame_accepted() {
        let raw = frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
        let parsed = validate(&raw, 0x01, false).unwrap();
        assert_eq!(parsed.slave_addr, 0x01);
        assert_eq!(parsed.func_code, 0x03);
        assert!(!parsed.was_broadcast);
    }

    #[test]
    fn broadcast_respond_accepted_and_flagged() {
        let raw = frame(&[0xFF, 0x03, 0x00, 0x00, 0x00, 0x01, 0x90, 0x04]);
        let parsed = validate(&raw, 0x01, false).unwrap();
        assert!(parsed.was_broadcast);
    }

    #[test]
    fn build_response_matches_scenario_1() {
        let resp = build_response(0x01, 0x03, &[0x04, 0x00, 0x00, 0x00, 0x00], false);
        assert_eq!(
            resp.as_slice(),
            &[0x01, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00, 0xFA, 0x33]
        );
    }

    #[test]
    fn build_exception_is_always_five_octets() {
        let resp = build_exception(0x01, 0x03, Exception::IllegalDataAddress, false);
        assert_eq!(resp.len(), 5);
        assert_eq!(resp[1], 0x83);
        assert_eq!(resp[2], 0x02);
        assert_eq!(resp.as_slice(), &[0x01, 0x83, 0x02, 0xC0, 0xF1]);
    }

    #[test]
    fn read_u16_be_reads_correct_bytes() {
        let raw = [0x00, 0x00, 0x12, 0x34];
        assert_eq!(read_u16_be(&raw, 2), Some(0x1234));
        assert_eq!(read_u16_be(&raw, 3), None);
    }
}
