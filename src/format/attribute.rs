use super::{ParseErrorKind, Reader};
use crate::types::TypeName;
use core::ops::Range;

pub(crate) const TAG_BOOL: u8 = 0;
pub(crate) const TAG_I32: u8 = 1;
pub(crate) const TAG_I64: u8 = 2;
pub(crate) const TAG_F32: u8 = 3;
pub(crate) const TAG_F64: u8 = 4;
pub(crate) const TAG_STRING: u8 = 5;
pub(crate) const TAG_TYPE: u8 = 6;

/// Inline kernel attribute, borrowed from the program buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Attribute<'a> {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(&'a str),
    Type(&'a TypeName),
}

impl<'a> Attribute<'a> {
    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i32(self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(v),
            Self::I32(v) => Some(v.into()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f32(self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> Option<&'a str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_type(self) -> Option<&'a TypeName> {
        match self {
            Self::Type(v) => Some(v),
            _ => None,
        }
    }
}

/// Owned attribute used when writing a container.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Type(String),
}

/// Validated attribute: its tag plus the absolute byte range of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttributeEntry {
    tag: u8,
    payload: Range<u32>,
}

impl AttributeEntry {
    /// Validate the attribute starting at `reader`'s position.
    pub(crate) fn parse(reader: &mut Reader<'_>, num_types: usize) -> Result<Self, ParseErrorKind> {
        let start = reader.offset();
        let invalid = || ParseErrorKind::InvalidAttribute(start as u32);
        let tag = reader.read_u8().map_err(|_| invalid())?;
        let len = match tag {
            TAG_BOOL => 1,
            TAG_I32 | TAG_F32 | TAG_TYPE => 4,
            TAG_I64 | TAG_F64 => 8,
            TAG_STRING => reader.read_u32().map_err(|_| invalid())? as usize,
            _ => return Err(invalid()),
        };
        let begin = reader.offset();
        let bytes = reader.read_bytes(len).map_err(|_| invalid())?;
        match tag {
            TAG_BOOL if bytes[0] > 1 => return Err(invalid()),
            TAG_STRING if core::str::from_utf8(bytes).is_err() => return Err(invalid()),
            TAG_TYPE if le_u32(bytes) as usize >= num_types => return Err(invalid()),
            _ => {}
        }
        let end = begin + len;
        Ok(Self {
            tag,
            payload: begin as u32..end as u32,
        })
    }

    /// Decode from the buffer the entry was validated against.
    pub(crate) fn decode<'a>(&self, buffer: &'a [u8], types: &'a [TypeName]) -> Attribute<'a> {
        let bytes = &buffer[self.payload.start as usize..self.payload.end as usize];
        match self.tag {
            TAG_BOOL => Attribute::Bool(bytes[0] != 0),
            TAG_I32 => Attribute::I32(le_u32(bytes) as i32),
            TAG_I64 => Attribute::I64(le_u64(bytes) as i64),
            TAG_F32 => Attribute::F32(f32::from_bits(le_u32(bytes))),
            TAG_F64 => Attribute::F64(f64::from_bits(le_u64(bytes))),
            TAG_STRING => Attribute::String(
                core::str::from_utf8(bytes).expect("AttributeEntry::decode: [1]"),
            ),
            TAG_TYPE => Attribute::Type(&types[le_u32(bytes) as usize]),
            _ => unreachable!("AttributeEntry::decode: [2]"),
        }
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().expect("le_u32"))
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().expect("le_u64"))
}
