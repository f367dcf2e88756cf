//! ## Resource string parsing
//!
//! Accepts the VISA-style `USB[N]::<vid>::<pid>::INSTR` and
//! `USB[N]::<vid>::<pid>::<serial>::INSTR` patterns (§4.8). Anything else is
//! `Error::InvalidResource`. Parsing is the full extent of VISA resource
//! string support this driver takes on — no board-index routing, no other
//! interface types.

use crate::error::Error;

/// The identifiers extracted from a resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

fn parse_number(s: &str) -> Option<u16> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u16>().ok()
    }
}

/// Parse a resource string of the shape `USB[N]::vid::pid::INSTR` or
/// `USB[N]::vid::pid::serial::INSTR`.
pub fn parse(resource: &str) -> Result<Resource, Error> {
    let fields: Vec<&str> = resource.split("::").collect();

    let first = fields.first().ok_or(Error::InvalidResource)?;
    if !first.starts_with("USB") && !first.starts_with("usb") {
        return Err(Error::InvalidResource);
    }
    // the optional board index after "USB" (e.g. "USB0") is accepted but unused
    let _board_index = &first[3..];

    let (vid, pid, serial, suffix) = match fields.len() {
        4 => (fields[1], fields[2], None, fields[3]),
        5 => (fields[1], fields[2], Some(fields[3]), fields[4]),
        _ => return Err(Error::InvalidResource),
    };

    if !suffix.eq_ignore_ascii_case("INSTR") {
        return Err(Error::InvalidResource);
    }

    let vendor_id = parse_number(vid).ok_or(Error::InvalidResource)?;
    let product_id = parse_number(pid).ok_or(Error::InvalidResource)?;

    if let Some(s) = serial {
        if s.is_empty() {
            return Err(Error::InvalidResource);
        }
    }

    Ok(Resource {
        vendor_id,
        product_id,
        serial: serial.map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_ids_without_serial() {
        let r = parse("USB::2391::6037::INSTR").unwrap();
        assert_eq!(r.vendor_id, 2391);
        assert_eq!(r.product_id, 6037);
        assert_eq!(r.serial, None);
    }

    #[test]
    fn parses_hex_ids_with_serial() {
        let r = parse("USB::0x0957::0x1755::MY123::INSTR").unwrap();
        assert_eq!(r.vendor_id, 0x0957);
        assert_eq!(r.product_id, 0x1755);
        assert_eq!(r.serial.as_deref(), Some("MY123"));
    }

    #[test]
    fn accepts_board_index() {
        let r = parse("USB0::0x0957::0x1755::MY123::INSTR").unwrap();
        assert_eq!(r.vendor_id, 0x0957);
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(matches!(parse("USB::foo"), Err(Error::InvalidResource)));
        assert!(matches!(parse("GPIB::1::2::INSTR"), Err(Error::InvalidResource)));
        assert!(matches!(parse(""), Err(Error::InvalidResource)));
    }

    #[test]
    fn rejects_non_instr_suffix() {
        assert!(matches!(
            parse("USB::0x0957::0x1755::SOCKET"),
            Err(Error::InvalidResource)
        ));
    }

    #[test]
    fn rejects_unparseable_ids() {
        assert!(matches!(
            parse("USB::not_a_number::0x1755::INSTR"),
            Err(Error::InvalidResource)
        ));
    }
}
