//! USB id formatting and parsing helpers

use crate::{Error, Result};

/// Format a USB vendor or product id the way drive listings show it
///
/// ```
/// assert_eq!(common::format_usb_id(0x0a5c), "0x0a5c");
/// ```
pub fn format_usb_id(id: u16) -> String {
    format!("0x{:04x}", id)
}

/// Parse a `0x`-prefixed hex USB id of 1 to 4 digits
pub fn parse_usb_id(id: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            Error::Usb(format!(
                "Invalid USB id '{}', must start with '0x' (e.g., '0x1234')",
                id
            ))
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(Error::Usb(format!(
            "Invalid USB id '{}', hex part must be 1-4 digits",
            id
        )));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| Error::Usb(format!("Invalid USB id '{}', not a valid hex number", id)))
}

/// Parse a `VID:PID` pair such as `0x0a5c:0x2711`
pub fn parse_identity_pair(pair: &str) -> Result<(u16, u16)> {
    let parts: Vec<&str> = pair.split(':').collect();
    if parts.len() != 2 {
        return Err(Error::Usb(format!(
            "Invalid identity '{}', expected VID:PID (e.g., '0x0a5c:0x2764')",
            pair
        )));
    }

    Ok((parse_usb_id(parts[0])?, parse_usb_id(parts[1])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_usb_id() {
        assert_eq!(format_usb_id(0x0a5c), "0x0a5c");
        assert_eq!(format_usb_id(0x2764), "0x2764");
        assert_eq!(format_usb_id(0x1), "0x0001");
    }

    #[test]
    fn test_parse_usb_id() {
        assert_eq!(parse_usb_id("0x0a5c").unwrap(), 0x0a5c);
        assert_eq!(parse_usb_id("0XABCD").unwrap(), 0xabcd);
        assert!(parse_usb_id("0a5c").is_err());
        assert!(parse_usb_id("0x").is_err());
        assert!(parse_usb_id("0x12345").is_err());
        assert!(parse_usb_id("0xGHIJ").is_err());
    }

    #[test]
    fn test_parse_identity_pair() {
        assert_eq!(
            parse_identity_pair("0x0a5c:0x2711").unwrap(),
            (0x0a5c, 0x2711)
        );
        assert!(parse_identity_pair("0x0a5c").is_err());
        assert!(parse_identity_pair("0x0a5c:0x2711:0x1").is_err());
        assert!(parse_identity_pair("*:0x2711").is_err());
    }
}
