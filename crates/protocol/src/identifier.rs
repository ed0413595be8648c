//! Four-character tags naming packet types, fields and parameters.

use crate::error::{FrameError, FrameResult};
use std::fmt;
use std::str::FromStr;

/// A four-byte `[A-Z0-9 ]` tag.
///
/// Names shorter than four characters are right-padded with spaces. The raw
/// four bytes are the canonical equality key; `Display` strips the trailing
/// padding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; 4]);

impl Identifier {
    /// Validates and packs a name of up to four characters.
    pub fn new(name: &str) -> FrameResult<Self> {
        let bytes = name.as_bytes();
        if bytes.len() > 4 {
            return Err(FrameError::InvalidIdentifier(name.to_owned()));
        }
        let mut raw = [b' '; 4];
        for (slot, &byte) in raw.iter_mut().zip(bytes) {
            if !is_identifier_byte(byte) {
                return Err(FrameError::InvalidIdentifier(name.to_owned()));
            }
            *slot = byte;
        }
        Ok(Identifier(raw))
    }

    /// Packs a static name, panicking on an invalid byte.
    ///
    /// Intended for well-known protocol vocabulary; use [`Identifier::new`]
    /// for anything runtime-supplied.
    pub const fn from_static(raw: [u8; 4]) -> Self {
        let mut i = 0;
        while i < 4 {
            if !is_identifier_byte(raw[i]) {
                panic!("invalid identifier byte");
            }
            i += 1;
        }
        Identifier(raw)
    }

    /// Validates a raw four-byte wire form.
    pub fn from_wire(raw: [u8; 4]) -> FrameResult<Self> {
        if raw.iter().all(|&byte| is_identifier_byte(byte)) {
            Ok(Identifier(raw))
        } else {
            Err(FrameError::InvalidIdentifier(
                String::from_utf8_lossy(&raw).into_owned(),
            ))
        }
    }

    /// The raw four-byte wire form.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// The canonical string form, trailing padding stripped.
    pub fn as_str(&self) -> &str {
        // The charset is pure ASCII, so the bytes are always valid UTF-8.
        std::str::from_utf8(&self.0)
            .unwrap_or_default()
            .trim_end_matches(' ')
    }
}

const fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte.is_ascii_digit() || byte == b' '
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl FromStr for Identifier {
    type Err = FrameError;

    fn from_str(s: &str) -> FrameResult<Self> {
        Identifier::new(s)
    }
}

impl TryFrom<&str> for Identifier {
    type Error = FrameError;

    fn try_from(s: &str) -> FrameResult<Self> {
        Identifier::new(s)
    }
}

impl PartialEq<str> for Identifier {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Identifier {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pads_short_names() {
        let id = Identifier::new("CIW").unwrap();
        assert_eq!(id.as_bytes(), b"CIW ");
        assert_eq!(id.as_str(), "CIW");
        assert_eq!(id.to_string(), "CIW");
    }

    #[test]
    fn test_new_accepts_digits_and_spaces() {
        assert!(Identifier::new("AB12").is_ok());
        assert!(Identifier::new("A B").is_ok());
        assert!(Identifier::new("").is_ok());
        assert_eq!(Identifier::new("").unwrap().as_bytes(), b"    ");
    }

    #[test]
    fn test_new_rejects_invalid_bytes() {
        assert!(matches!(
            Identifier::new("time"),
            Err(FrameError::InvalidIdentifier(_))
        ));
        assert!(Identifier::new("A-B").is_err());
        assert!(Identifier::new("AB\0").is_err());
    }

    #[test]
    fn test_new_rejects_long_names() {
        assert!(matches!(
            Identifier::new("TOOLONG"),
            Err(FrameError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_raw_bytes_are_equality_key() {
        let a = Identifier::new("LINK").unwrap();
        let b = Identifier::from_wire(*b"LINK").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Identifier::new("HELO").unwrap());
    }

    #[test]
    fn test_from_wire_rejects_invalid_bytes() {
        assert!(Identifier::from_wire(*b"AB\0\0").is_err());
        assert!(Identifier::from_wire(*b"ab  ").is_err());
    }

    #[test]
    fn test_str_comparison() {
        let id = Identifier::new("HELO").unwrap();
        assert!(id == "HELO");
        assert!(id != "LINK");
    }

    #[test]
    fn test_from_static() {
        const LINK: Identifier = Identifier::from_static(*b"LINK");
        assert_eq!(LINK, Identifier::new("LINK").unwrap());
    }
}
