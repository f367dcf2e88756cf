//! ## Header codec
//!
//! Encodes and decodes the 12-byte USBTMC bulk header (component 3). The
//! payload and any zero-padding to a 4-byte boundary live outside of this
//! module; this is strictly the fixed-size header.

use crate::constants::misc::USBTMC_HEADER_SIZE;
use crate::error::Error;

/// A decoded bulk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_id: u8,
    pub btag: u8,
    pub btag_inverse: u8,
    pub transfer_size: u32,
    pub eom: bool,
    /// bit1 of `bmTransferAttributes` on a REQUEST_DEV_DEP_MSG_IN header.
    pub term_char_enabled: bool,
    pub term_char: u8,
}

/// How strictly [`decode`] treats the reserved header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Reject headers with non-zero reserved bytes.
    Strict,
    /// Ignore reserved-byte contents; many real devices leave trash there.
    Lenient,
}

/// Encode a `DEV_DEP_MSG_OUT` (or vendor-specific OUT / TRIGGER) header.
pub fn encode_out(msg_id: u8, btag: u8, transfer_size: u32, eom: bool) -> [u8; USBTMC_HEADER_SIZE] {
    let mut header = [0u8; USBTMC_HEADER_SIZE];
    header[0] = msg_id;
    header[1] = btag;
    header[2] = !btag;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if eom {
        header[8] = 0b0000_0001;
    }
    header
}

/// Encode a `REQUEST_DEV_DEP_MSG_IN` header.
pub fn encode_in_request(
    msg_id: u8,
    btag: u8,
    max_size: u32,
    term_char: Option<u8>,
) -> [u8; USBTMC_HEADER_SIZE] {
    let mut header = [0u8; USBTMC_HEADER_SIZE];
    header[0] = msg_id;
    header[1] = btag;
    header[2] = !btag;
    header[4..8].copy_from_slice(&max_size.to_le_bytes());
    if let Some(tc) = term_char {
        header[8] = 0b0000_0010;
        header[9] = tc;
    }
    header
}

/// Decode a 12-byte bulk header.
///
/// Rejects `btag == 0` and `btag ^ btag_inverse != 0xFF` unconditionally —
/// those are wire-format invariants, not vendor sloppiness. In [`DecodeMode::Strict`]
/// mode, also rejects a non-zero reserved byte (offset 3) or non-zero
/// reserved trailer (offsets 10..12) when the header is not a term-char IN
/// request.
pub fn decode(bytes: &[u8], mode: DecodeMode) -> Result<Header, Error> {
    if bytes.len() < USBTMC_HEADER_SIZE {
        return Err(Error::ProtocolMismatch);
    }

    let msg_id = bytes[0];
    let btag = bytes[1];
    let btag_inverse = bytes[2];

    if btag == 0 || (btag ^ btag_inverse) != 0xFF {
        return Err(Error::ProtocolMismatch);
    }

    if mode == DecodeMode::Strict && (bytes[3] != 0 || bytes[10] != 0 || bytes[11] != 0) {
        return Err(Error::ProtocolMismatch);
    }

    let transfer_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let attributes = bytes[8];
    let eom = attributes & 0b0000_0001 != 0;
    let term_char_enabled = attributes & 0b0000_0010 != 0;
    let term_char = bytes[9];

    Ok(Header {
        msg_id,
        btag,
        btag_inverse,
        transfer_size,
        eom,
        term_char_enabled,
        term_char,
    })
}

/// Zero-pad `buf` up to the next multiple of 4 bytes.
pub fn pad_to_alignment(buf: &mut Vec<u8>) {
    let padding = (4 - (buf.len() % 4)) % 4;
    buf.resize(buf.len() + padding, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::bulk_msg_id;

    #[test]
    fn encode_out_sets_btag_complement_and_eom() {
        let header = encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT, 5, 6, true);
        assert_eq!(header[0], bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT);
        assert_eq!(header[1], 5);
        assert_eq!(header[2], !5u8);
        assert_eq!(u32::from_le_bytes([header[4], header[5], header[6], header[7]]), 6);
        assert_eq!(header[8], 0b0000_0001);
    }

    #[test]
    fn encode_out_without_eom_leaves_attributes_zero() {
        let header = encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT, 5, 6, false);
        assert_eq!(header[8], 0);
    }

    #[test]
    fn round_trip_out_header() {
        for btag in [1u8, 42, 254, 255] {
            for eom in [true, false] {
                let header = encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT, btag, 1234, eom);
                let decoded = decode(&header, DecodeMode::Strict).unwrap();
                assert_eq!(decoded.msg_id, bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT);
                assert_eq!(decoded.btag, btag);
                assert_eq!(decoded.btag_inverse, !btag);
                assert_eq!(decoded.transfer_size, 1234);
                assert_eq!(decoded.eom, eom);
            }
        }
    }

    #[test]
    fn encode_in_request_sets_term_char_bit_only_when_present() {
        let with_tc = encode_in_request(bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN, 2, 512, Some(b'\n'));
        assert_eq!(with_tc[8], 0b0000_0010);
        assert_eq!(with_tc[9], b'\n');

        let without_tc = encode_in_request(bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN, 2, 512, None);
        assert_eq!(without_tc[8], 0);
        assert_eq!(without_tc[9], 0);
    }

    #[test]
    fn decode_rejects_zero_btag() {
        let mut header = encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 1, 0, true);
        header[1] = 0;
        header[2] = 0xFF;
        assert!(matches!(decode(&header, DecodeMode::Lenient), Err(Error::ProtocolMismatch)));
    }

    #[test]
    fn decode_rejects_bad_complement() {
        let mut header = encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 9, 0, true);
        header[2] = 0x00; // should be !9
        assert!(matches!(decode(&header, DecodeMode::Lenient), Err(Error::ProtocolMismatch)));
    }

    #[test]
    fn strict_mode_rejects_reserved_trash_lenient_accepts_it() {
        let mut header = encode_out(bulk_msg_id::DEVICE_DEPENDENT_MSG_IN, 9, 0, true);
        header[3] = 0xAA;
        assert!(decode(&header, DecodeMode::Strict).is_err());
        assert!(decode(&header, DecodeMode::Lenient).is_ok());
    }

    #[test]
    fn padding_rounds_up_to_multiple_of_four() {
        let mut buf = vec![0u8; 12 + 5];
        pad_to_alignment(&mut buf);
        assert_eq!(buf.len() % 4, 0);
        assert_eq!(buf.len(), 20);

        let mut already_aligned = vec![0u8; 16];
        pad_to_alignment(&mut already_aligned);
        assert_eq!(already_aligned.len(), 16);
    }
}
