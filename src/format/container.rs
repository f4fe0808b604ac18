use super::{
    AttributeEntry, FUNCTION_KIND_INTERPRETED, FUNCTION_KIND_NATIVE, MAGIC, NO_LOCATION,
    ParseError, ParseErrorKind, SectionId, VERSION,
};
use crate::{diagnostic::Location, types::TypeName};
use std::sync::Arc;

/// Bounds-checked little-endian cursor; offsets are absolute in the buffer.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    buffer: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            pos: 0,
            end: buffer.len(),
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.end
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ParseErrorKind> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.end)
            .ok_or(ParseErrorKind::UnexpectedEof(self.pos))?;
        let bytes = &self.buffer[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, ParseErrorKind> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, ParseErrorKind> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, ParseErrorKind> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Count-prefixed list of `u32`.
    pub(crate) fn read_u32_list(&mut self) -> Result<Vec<u32>, ParseErrorKind> {
        let count = self.read_u32()? as usize;
        // Every entry takes four bytes, so this rejects absurd counts early.
        if count > (self.end - self.pos) / 4 {
            return Err(ParseErrorKind::UnexpectedEof(self.pos));
        }
        (0..count).map(|_| self.read_u32()).collect()
    }

    /// Split off the next `len` bytes as a reader of their own.
    fn split(&mut self, len: usize) -> Result<Self, ParseErrorKind> {
        let start = self.pos;
        self.read_bytes(len)?;
        Ok(Self {
            buffer: self.buffer,
            pos: start,
            end: self.pos,
        })
    }

    /// Reader over the rest of this one, starting `offset` bytes in.
    fn sub(&self, offset: u32) -> Option<Self> {
        let start = self.pos.checked_add(offset as usize)?;
        (start < self.end).then(|| Self {
            buffer: self.buffer,
            pos: start,
            end: self.end,
        })
    }
}

/// A kernel record inside an interpreted function.
#[derive(Debug, Clone)]
pub(crate) struct KernelRecord {
    pub kernel: u32,
    pub location: Option<u32>,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub attributes: Vec<AttributeEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct BodyRecord {
    pub num_slots: u32,
    pub kernels: Vec<KernelRecord>,
    pub results: Vec<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct FunctionRecord {
    pub name: Arc<str>,
    pub argument_types: Vec<TypeName>,
    pub result_types: Vec<TypeName>,
    /// `None` for native functions.
    pub body: Option<BodyRecord>,
}

/// Every section of a container, decoded and bounds-checked.
#[derive(Debug)]
pub(crate) struct Container {
    pub types: Vec<TypeName>,
    pub kernel_names: Vec<Arc<str>>,
    pub locations: Vec<Location>,
    pub functions: Vec<FunctionRecord>,
}

#[derive(Default)]
struct Sections<'a> {
    strings: Option<Reader<'a>>,
    types: Option<Reader<'a>>,
    kernels: Option<Reader<'a>>,
    attributes: Option<Reader<'a>>,
    locations: Option<Reader<'a>>,
    functions: Option<Reader<'a>>,
}

impl<'a> Sections<'a> {
    fn slot(&mut self, id: SectionId) -> &mut Option<Reader<'a>> {
        match id {
            SectionId::Strings => &mut self.strings,
            SectionId::Types => &mut self.types,
            SectionId::Kernels => &mut self.kernels,
            SectionId::Attributes => &mut self.attributes,
            SectionId::Locations => &mut self.locations,
            SectionId::Functions => &mut self.functions,
        }
    }

    fn take_required(&mut self, id: SectionId) -> Result<Reader<'a>, ParseErrorKind> {
        self.slot(id)
            .take()
            .ok_or(ParseErrorKind::MissingSection(id))
    }
}

fn lookup<T: Clone>(table: &'static str, items: &[T], index: u32) -> Result<T, ParseErrorKind> {
    items
        .get(index as usize)
        .cloned()
        .ok_or(ParseErrorKind::IndexOutOfRange { table, index })
}

fn finish_section(reader: &Reader<'_>, id: SectionId) -> Result<(), ParseErrorKind> {
    if reader.is_empty() {
        Ok(())
    } else {
        Err(ParseErrorKind::TrailingBytes(id))
    }
}

impl Container {
    /// Decode `buffer`, checking the header, section framing and the range of
    /// every table index. Slot-level validation is left to the interpreter.
    pub(crate) fn parse(buffer: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader::new(buffer);
        if reader.read_bytes(MAGIC.len()).ok() != Some(&MAGIC[..]) {
            return Err(ParseErrorKind::BadMagic.into());
        }
        let version = reader.read_u16()?;
        if version != VERSION {
            return Err(ParseErrorKind::UnsupportedVersion(version).into());
        }
        let _reserved = reader.read_u16()?;

        let mut sections = Sections::default();
        while !reader.is_empty() {
            let raw_id = reader.read_u8()?;
            let id = SectionId::from_u8(raw_id).ok_or(ParseErrorKind::UnknownSection(raw_id))?;
            let len = reader.read_u32()? as usize;
            let section = reader.split(len)?;
            let slot = sections.slot(id);
            if slot.is_some() {
                return Err(ParseErrorKind::DuplicateSection(id).into());
            }
            *slot = Some(section);
        }

        let strings = parse_strings(sections.take_required(SectionId::Strings)?)?;
        let types = parse_string_refs(
            sections.take_required(SectionId::Types)?,
            SectionId::Types,
            &strings,
        )?
        .into_iter()
        .map(TypeName::new)
        .collect::<Vec<_>>();
        let kernel_names = parse_string_refs(
            sections.take_required(SectionId::Kernels)?,
            SectionId::Kernels,
            &strings,
        )?;
        let locations = match sections.locations.take() {
            Some(section) => parse_locations(section, &strings)?,
            None => Vec::new(),
        };
        let functions = parse_functions(
            sections.take_required(SectionId::Functions)?,
            &FunctionContext {
                strings: &strings,
                types: &types,
                kernels: kernel_names.len(),
                locations: &locations,
                attributes: sections.attributes.as_ref(),
            },
        )?;
        Ok(Self {
            types,
            kernel_names,
            locations,
            functions,
        })
    }
}

fn parse_strings(mut section: Reader<'_>) -> Result<Vec<Arc<str>>, ParseErrorKind> {
    let count = section.read_u32()?;
    let mut strings = Vec::new();
    for idx in 0..count {
        let len = section.read_u32()? as usize;
        let bytes = section.read_bytes(len)?;
        let string = core::str::from_utf8(bytes).map_err(|_| ParseErrorKind::InvalidUtf8(idx))?;
        strings.push(Arc::from(string));
    }
    finish_section(&section, SectionId::Strings)?;
    Ok(strings)
}

fn parse_string_refs(
    mut section: Reader<'_>,
    id: SectionId,
    strings: &[Arc<str>],
) -> Result<Vec<Arc<str>>, ParseErrorKind> {
    let refs = section
        .read_u32_list()?
        .into_iter()
        .map(|idx| lookup("string", strings, idx))
        .collect::<Result<Vec<_>, _>>()?;
    finish_section(&section, id)?;
    Ok(refs)
}

fn parse_locations(
    mut section: Reader<'_>,
    strings: &[Arc<str>],
) -> Result<Vec<Location>, ParseErrorKind> {
    let count = section.read_u32()?;
    let mut locations = Vec::new();
    for _ in 0..count {
        let filename = lookup("string", strings, section.read_u32()?)?;
        let line = section.read_u32()?;
        let column = section.read_u32()?;
        locations.push(Location {
            filename,
            line,
            column,
        });
    }
    finish_section(&section, SectionId::Locations)?;
    Ok(locations)
}

struct FunctionContext<'s, 'a> {
    strings: &'s [Arc<str>],
    types: &'s [TypeName],
    kernels: usize,
    locations: &'s [Location],
    attributes: Option<&'s Reader<'a>>,
}

impl FunctionContext<'_, '_> {
    fn type_list(&self, reader: &mut Reader<'_>) -> Result<Vec<TypeName>, ParseErrorKind> {
        reader
            .read_u32_list()?
            .into_iter()
            .map(|idx| lookup("type", self.types, idx))
            .collect()
    }

    fn attribute(&self, offset: u32) -> Result<AttributeEntry, ParseErrorKind> {
        let mut reader = self
            .attributes
            .and_then(|pool| pool.sub(offset))
            .ok_or(ParseErrorKind::IndexOutOfRange {
                table: "attribute",
                index: offset,
            })?;
        AttributeEntry::parse(&mut reader, self.types.len())
    }

    fn location(&self, raw: u32) -> Result<Option<u32>, ParseErrorKind> {
        if raw == NO_LOCATION {
            return Ok(None);
        }
        lookup("location", self.locations, raw)?;
        Ok(Some(raw))
    }
}

fn parse_functions(
    mut section: Reader<'_>,
    context: &FunctionContext<'_, '_>,
) -> Result<Vec<FunctionRecord>, ParseError> {
    let count = section.read_u32()?;
    let mut functions = Vec::new();
    for _ in 0..count {
        let name = lookup("string", context.strings, section.read_u32()?)?;
        let kind = section.read_u8()?;
        let argument_types = context.type_list(&mut section)?;
        let result_types = context.type_list(&mut section)?;
        let body = match kind {
            FUNCTION_KIND_INTERPRETED => {
                Some(parse_body(&mut section, context, result_types.len())?)
            }
            FUNCTION_KIND_NATIVE => None,
            other => return Err(ParseErrorKind::UnknownFunctionKind(other).into()),
        };
        functions.push(FunctionRecord {
            name,
            argument_types,
            result_types,
            body,
        });
    }
    finish_section(&section, SectionId::Functions)?;
    Ok(functions)
}

fn parse_body(
    section: &mut Reader<'_>,
    context: &FunctionContext<'_, '_>,
    num_results: usize,
) -> Result<BodyRecord, ParseError> {
    let num_slots = section.read_u32()?;
    let num_kernels = section.read_u32()?;
    let mut kernels = Vec::new();
    for _ in 0..num_kernels {
        let kernel = section.read_u32()?;
        let location = context.location(section.read_u32()?)?;
        let at = |kind: ParseErrorKind| {
            ParseError::from(kind).at(location.map(|idx| &context.locations[idx as usize]))
        };
        if kernel as usize >= context.kernels {
            return Err(at(ParseErrorKind::IndexOutOfRange {
                table: "kernel",
                index: kernel,
            }));
        }
        let inputs = section.read_u32_list()?;
        let outputs = section.read_u32_list()?;
        let attributes = section
            .read_u32_list()?
            .into_iter()
            .map(|offset| context.attribute(offset))
            .collect::<Result<Vec<_>, _>>()
            .map_err(at)?;
        kernels.push(KernelRecord {
            kernel,
            location,
            inputs,
            outputs,
            attributes,
        });
    }
    let results = (0..num_results)
        .map(|_| section.read_u32())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BodyRecord {
        num_slots,
        kernels,
        results,
    })
}
