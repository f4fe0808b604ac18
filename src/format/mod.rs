//! Binary container layout.
//!
//! ```text
//! header   : magic "CDRB", version u16, reserved u16
//! section* : id u8, length u32, payload[length]
//! ```
//!
//! All integers are little endian. Sections (each at most once):
//!
//! | id | name       | payload                                                   |
//! |----|------------|-----------------------------------------------------------|
//! | 1  | strings    | count, then `len` + UTF-8 bytes per string                |
//! | 2  | types      | count, then a string index per type                       |
//! | 3  | kernels    | count, then a string index per kernel name                |
//! | 4  | attributes | attribute pool, entries addressed by byte offset          |
//! | 5  | locations  | count, then (file string, line, column) per location      |
//! | 6  | functions  | count, then one function record each                      |
//!
//! A function record is `name, kind` followed by its argument and result type
//! lists. Interpreted functions (`kind == 0`) then carry their slot count,
//! their kernel table and one result slot per result; native functions
//! (`kind == 1`) carry nothing else and are resolved by name in the registry.
//! Each kernel is `kernel id, location, inputs, outputs, attribute offsets`,
//! every list being a count followed by `u32` entries.

mod attribute;
mod container;
mod writer;

pub use self::{
    attribute::{Attribute, AttributeValue},
    writer::{FunctionWriter, ProgramWriter},
};
pub(crate) use self::{
    attribute::AttributeEntry,
    container::{BodyRecord, Container, Reader},
};
use crate::diagnostic::Location;
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"CDRB";
pub const VERSION: u16 = 1;
/// Location index meaning "no location".
pub const NO_LOCATION: u32 = u32::MAX;

pub(crate) const FUNCTION_KIND_INTERPRETED: u8 = 0;
pub(crate) const FUNCTION_KIND_NATIVE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[repr(u8)]
pub enum SectionId {
    #[display("strings")]
    Strings = 1,
    #[display("types")]
    Types = 2,
    #[display("kernels")]
    Kernels = 3,
    #[display("attributes")]
    Attributes = 4,
    #[display("locations")]
    Locations = 5,
    #[display("functions")]
    Functions = 6,
}

impl SectionId {
    fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            1 => Self::Strings,
            2 => Self::Types,
            3 => Self::Kernels,
            4 => Self::Attributes,
            5 => Self::Locations,
            6 => Self::Functions,
            _ => return None,
        })
    }
}

/// Why a container was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseErrorKind {
    #[error("invalid magic number")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEof(usize),
    #[error("unknown section id {0}")]
    UnknownSection(u8),
    #[error("duplicate {0} section")]
    DuplicateSection(SectionId),
    #[error("missing {0} section")]
    MissingSection(SectionId),
    #[error("trailing bytes in {0} section")]
    TrailingBytes(SectionId),
    #[error("invalid UTF-8 in string {0}")]
    InvalidUtf8(u32),
    #[error("{table} index {index} out of range")]
    IndexOutOfRange { table: &'static str, index: u32 },
    #[error("invalid attribute at offset {0}")]
    InvalidAttribute(u32),
    #[error("unknown function kind {0}")]
    UnknownFunctionKind(u8),
    #[error("slot {slot} out of range in function '{function}'")]
    SlotOutOfRange { function: String, slot: u32 },
    #[error("slot {slot} defined more than once in function '{function}'")]
    SlotRedefined { function: String, slot: u32 },
    #[error("slot {slot} used before it is defined in function '{function}'")]
    SlotUndefined { function: String, slot: u32 },
    #[error("function '{function}' declares {slots} slots but defines only {definitions}")]
    UndefinedSlots {
        function: String,
        slots: u32,
        definitions: u64,
    },
    #[error("native function '{0}' is not registered")]
    UnknownNativeFunction(String),
    #[error("duplicate function '{0}'")]
    DuplicateFunction(String),
}

/// A rejected container, with the offending kernel's location when known.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub location: Option<Location>,
}

impl From<ParseErrorKind> for ParseError {
    fn from(kind: ParseErrorKind) -> Self {
        Self {
            kind,
            location: None,
        }
    }
}

impl ParseError {
    #[must_use]
    pub(crate) fn at(mut self, location: Option<&Location>) -> Self {
        if self.location.is_none() {
            self.location = location.cloned();
        }
        self
    }
}
