//! Wire header codec.
//!
//! Every AnyValue unit on the wire is framed as
//!
//! ```text
//! [category: u8][encrypted: u8 (0|1)][type_name_len: u8][type_name: type_name_len][body...]
//! ```
//!
//! The header is parseable on its own; the body is located via [`body_offset`].

use crate::error::{Result, SerializerError};

/// Fixed size of the header prefix before the type name bytes.
pub const HEADER_PREFIX_LEN: usize = 3;

/// Longest type name that fits the one-byte length field.
pub const MAX_TYPE_NAME_LEN: usize = u8::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueCategory {
    Null = 0,
    Primitive = 1,
    Bytes = 2,
    List = 3,
    Map = 4,
    Struct = 5,
    Json = 6,
    Encrypted = 7,
}

impl ValueCategory {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueCategory::Null),
            1 => Some(ValueCategory::Primitive),
            2 => Some(ValueCategory::Bytes),
            3 => Some(ValueCategory::List),
            4 => Some(ValueCategory::Map),
            5 => Some(ValueCategory::Struct),
            6 => Some(ValueCategory::Json),
            7 => Some(ValueCategory::Encrypted),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueCategory::Null => "null",
            ValueCategory::Primitive => "primitive",
            ValueCategory::Bytes => "bytes",
            ValueCategory::List => "list",
            ValueCategory::Map => "map",
            ValueCategory::Struct => "struct",
            ValueCategory::Json => "json",
            ValueCategory::Encrypted => "encrypted",
        }
    }
}

/// Decoded envelope around a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub category: ValueCategory,
    pub is_encrypted: bool,
    pub type_name: Option<String>,
}

impl WireHeader {
    pub fn new(category: ValueCategory, is_encrypted: bool, type_name: Option<String>) -> Self {
        Self {
            category,
            is_encrypted,
            type_name,
        }
    }

    /// Number of bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_PREFIX_LEN + self.type_name.as_ref().map_or(0, |n| n.len())
    }
}

/// Encode a header. Fails only when the type name does not fit in one length byte.
pub fn write_header(header: &WireHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(header.encoded_len());
    write_header_into(header, &mut buf)?;
    Ok(buf)
}

/// Append an encoded header to `buf`.
pub fn write_header_into(header: &WireHeader, buf: &mut Vec<u8>) -> Result<()> {
    let name_bytes = header.type_name.as_deref().unwrap_or("").as_bytes();
    if name_bytes.len() > MAX_TYPE_NAME_LEN {
        return Err(SerializerError::TypeNameTooLong(name_bytes.len()));
    }
    buf.push(header.category.as_u8());
    buf.push(u8::from(header.is_encrypted));
    buf.push(name_bytes.len() as u8);
    buf.extend_from_slice(name_bytes);
    Ok(())
}

/// Parse the header at the start of `bytes`.
pub fn read_header(bytes: &[u8]) -> Result<WireHeader> {
    if bytes.len() < HEADER_PREFIX_LEN {
        return Err(SerializerError::MalformedHeader(format!(
            "need at least {HEADER_PREFIX_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let category =
        ValueCategory::from_u8(bytes[0]).ok_or(SerializerError::InvalidCategory(bytes[0]))?;

    let is_encrypted = match bytes[1] {
        0 => false,
        1 => true,
        other => {
            return Err(SerializerError::MalformedHeader(format!(
                "encrypted flag must be 0 or 1, got {other}"
            )))
        }
    };

    let name_len = bytes[2] as usize;
    let available = bytes.len() - HEADER_PREFIX_LEN;
    if name_len > available {
        return Err(SerializerError::InvalidTypeNameLength {
            declared: name_len,
            available,
        });
    }

    let type_name = if name_len == 0 {
        None
    } else {
        let raw = &bytes[HEADER_PREFIX_LEN..HEADER_PREFIX_LEN + name_len];
        let name = std::str::from_utf8(raw)
            .map_err(|e| SerializerError::MalformedHeader(format!("type name is not UTF-8: {e}")))?;
        Some(name.to_string())
    };

    Ok(WireHeader {
        category,
        is_encrypted,
        type_name,
    })
}

/// Offset of the body within `bytes`: `3 + type_name_len`.
pub fn body_offset(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < HEADER_PREFIX_LEN {
        return Err(SerializerError::MalformedHeader(format!(
            "need at least {HEADER_PREFIX_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let offset = HEADER_PREFIX_LEN + bytes[2] as usize;
    if offset > bytes.len() {
        return Err(SerializerError::InvalidTypeNameLength {
            declared: bytes[2] as usize,
            available: bytes.len() - HEADER_PREFIX_LEN,
        });
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_header_roundtrip() {
        let header = WireHeader::new(ValueCategory::Struct, false, Some("T".to_string()));
        let bytes = write_header(&header).unwrap();
        assert_eq!(bytes, vec![5, 0, 1, b'T']);

        let parsed = read_header(&bytes).unwrap();
        assert_eq!(parsed.category, ValueCategory::Struct);
        assert!(!parsed.is_encrypted);
        assert_eq!(parsed.type_name.as_deref(), Some("T"));
        assert_eq!(body_offset(&bytes).unwrap(), 3 + "T".len());
    }

    #[test]
    fn header_without_type_name_has_no_trailing_bytes() {
        let header = WireHeader::new(ValueCategory::Null, false, None);
        let bytes = write_header(&header).unwrap();
        assert_eq!(bytes, vec![0, 0, 0]);
        assert_eq!(read_header(&bytes).unwrap(), header);
    }

    #[test]
    fn short_buffers_are_malformed() {
        for len in 0..HEADER_PREFIX_LEN {
            let bytes = vec![1u8; len];
            assert!(matches!(
                read_header(&bytes),
                Err(SerializerError::MalformedHeader(_))
            ));
            assert!(matches!(
                body_offset(&bytes),
                Err(SerializerError::MalformedHeader(_))
            ));
        }
    }

    #[test]
    fn overrunning_type_name_is_rejected() {
        let bytes = [1u8, 0, 10, b'a', b'b'];
        match read_header(&bytes) {
            Err(SerializerError::InvalidTypeNameLength {
                declared,
                available,
            }) => {
                assert_eq!(declared, 10);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            body_offset(&bytes),
            Err(SerializerError::InvalidTypeNameLength { .. })
        ));
    }

    #[test]
    fn unknown_category_is_rejected() {
        assert!(matches!(
            read_header(&[8, 0, 0]),
            Err(SerializerError::InvalidCategory(8))
        ));
    }

    #[test]
    fn encrypted_flag_must_be_boolean() {
        assert!(matches!(
            read_header(&[1, 2, 0]),
            Err(SerializerError::MalformedHeader(_))
        ));
    }

    #[test]
    fn oversized_type_name_is_rejected_on_write() {
        let header = WireHeader::new(ValueCategory::Struct, false, Some("x".repeat(256)));
        assert!(matches!(
            write_header(&header),
            Err(SerializerError::TypeNameTooLong(256))
        ));

        let max = WireHeader::new(ValueCategory::Struct, true, Some("x".repeat(255)));
        let bytes = write_header(&max).unwrap();
        assert_eq!(bytes.len(), 258);
        assert_eq!(read_header(&bytes).unwrap(), max);
    }
}
