use super::{
    AttributeValue, FUNCTION_KIND_INTERPRETED, FUNCTION_KIND_NATIVE, MAGIC, NO_LOCATION,
    SectionId, VERSION,
    attribute::{TAG_BOOL, TAG_F32, TAG_F64, TAG_I32, TAG_I64, TAG_STRING, TAG_TYPE},
};
use crate::{diagnostic::Location, types::SlotIndex};
use indexmap::IndexSet;
use rustc_hash::FxBuildHasher;

type Interner<T> = IndexSet<T, FxBuildHasher>;

/// Builds a container in memory.
///
/// Strings, types, kernel names and locations are interned; attributes are
/// appended to the pool as kernels are written.
#[derive(Debug, Default)]
pub struct ProgramWriter {
    strings: Interner<String>,
    types: Interner<u32>,
    kernels: Interner<u32>,
    locations: Interner<(u32, u32, u32)>,
    attributes: Vec<u8>,
    functions: Vec<u8>,
    num_functions: u32,
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_list(out: &mut Vec<u8>, values: &[u32]) {
    put_u32(out, values.len() as u32);
    for &value in values {
        put_u32(out, value);
    }
}

impl ProgramWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn string(&mut self, value: &str) -> u32 {
        if let Some(idx) = self.strings.get_index_of(value) {
            return idx as u32;
        }
        self.strings.insert_full(value.to_owned()).0 as u32
    }

    fn type_index(&mut self, name: &str) -> u32 {
        let name = self.string(name);
        self.types.insert_full(name).0 as u32
    }

    fn kernel_index(&mut self, name: &str) -> u32 {
        let name = self.string(name);
        self.kernels.insert_full(name).0 as u32
    }

    fn location_index(&mut self, location: Option<&Location>) -> u32 {
        match location {
            Some(location) => {
                let file = self.string(&location.filename);
                self.locations
                    .insert_full((file, location.line, location.column))
                    .0 as u32
            }
            None => NO_LOCATION,
        }
    }

    fn attribute(&mut self, value: &AttributeValue) -> u32 {
        let offset = self.attributes.len() as u32;
        match value {
            AttributeValue::Bool(v) => self.attributes.extend([TAG_BOOL, u8::from(*v)]),
            AttributeValue::I32(v) => {
                self.attributes.push(TAG_I32);
                self.attributes.extend_from_slice(&v.to_le_bytes());
            }
            AttributeValue::I64(v) => {
                self.attributes.push(TAG_I64);
                self.attributes.extend_from_slice(&v.to_le_bytes());
            }
            AttributeValue::F32(v) => {
                self.attributes.push(TAG_F32);
                self.attributes.extend_from_slice(&v.to_le_bytes());
            }
            AttributeValue::F64(v) => {
                self.attributes.push(TAG_F64);
                self.attributes.extend_from_slice(&v.to_le_bytes());
            }
            AttributeValue::String(v) => {
                self.attributes.push(TAG_STRING);
                put_u32(&mut self.attributes, v.len() as u32);
                self.attributes.extend_from_slice(v.as_bytes());
            }
            AttributeValue::Type(v) => {
                let idx = self.type_index(v);
                self.attributes.push(TAG_TYPE);
                put_u32(&mut self.attributes, idx);
            }
        }
        offset
    }

    /// Start an interpreted function. Use an empty name for an anonymous one.
    pub fn function(&mut self, name: &str) -> FunctionWriter<'_> {
        let name = self.string(name);
        FunctionWriter {
            program: self,
            name,
            argument_types: Vec::new(),
            result_types: Vec::new(),
            results: Vec::new(),
            num_slots: 0,
            num_kernels: 0,
            kernels: Vec::new(),
        }
    }

    /// Declare a function implemented by a native callable registered under
    /// `name`.
    pub fn native_function(&mut self, name: &str, argument_types: &[&str], result_types: &[&str]) {
        let name = self.string(name);
        let argument_types: Vec<_> = argument_types.iter().map(|ty| self.type_index(ty)).collect();
        let result_types: Vec<_> = result_types.iter().map(|ty| self.type_index(ty)).collect();
        put_u32(&mut self.functions, name);
        self.functions.push(FUNCTION_KIND_NATIVE);
        put_list(&mut self.functions, &argument_types);
        put_list(&mut self.functions, &result_types);
        self.num_functions += 1;
    }

    /// Serialize the container.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&0_u16.to_le_bytes());

        let mut section = |id: SectionId, payload: Vec<u8>| {
            out.push(id as u8);
            put_u32(&mut out, payload.len() as u32);
            out.extend_from_slice(&payload);
        };

        let mut strings = Vec::new();
        put_u32(&mut strings, self.strings.len() as u32);
        for string in &self.strings {
            put_u32(&mut strings, string.len() as u32);
            strings.extend_from_slice(string.as_bytes());
        }
        section(SectionId::Strings, strings);

        let mut types = Vec::new();
        put_list(&mut types, &self.types.iter().copied().collect::<Vec<_>>());
        section(SectionId::Types, types);

        let mut kernels = Vec::new();
        put_list(&mut kernels, &self.kernels.iter().copied().collect::<Vec<_>>());
        section(SectionId::Kernels, kernels);

        if !self.attributes.is_empty() {
            section(SectionId::Attributes, self.attributes);
        }

        if !self.locations.is_empty() {
            let mut locations = Vec::new();
            put_u32(&mut locations, self.locations.len() as u32);
            for &(file, line, column) in &self.locations {
                put_u32(&mut locations, file);
                put_u32(&mut locations, line);
                put_u32(&mut locations, column);
            }
            section(SectionId::Locations, locations);
        }

        let mut functions = Vec::new();
        put_u32(&mut functions, self.num_functions);
        functions.extend_from_slice(&self.functions);
        section(SectionId::Functions, functions);

        out
    }
}

/// Builds one interpreted function; nothing is recorded until `finish`.
///
/// Arguments occupy the first slots, so declare them before any kernel.
#[derive(Debug)]
pub struct FunctionWriter<'w> {
    program: &'w mut ProgramWriter,
    name: u32,
    argument_types: Vec<u32>,
    result_types: Vec<u32>,
    results: Vec<u32>,
    num_slots: u32,
    num_kernels: u32,
    kernels: Vec<u8>,
}

impl FunctionWriter<'_> {
    pub fn argument(&mut self, ty: &str) -> SlotIndex {
        assert_eq!(
            self.num_slots as usize,
            self.argument_types.len(),
            "arguments must be declared before kernels"
        );
        let ty = self.program.type_index(ty);
        self.argument_types.push(ty);
        self.reserve_slot()
    }

    /// Allocate a slot without defining it.
    pub fn reserve_slot(&mut self) -> SlotIndex {
        let slot = self.num_slots;
        self.num_slots += 1;
        slot
    }

    /// Append a kernel with `N` fresh output slots.
    pub fn kernel<const N: usize>(
        &mut self,
        name: &str,
        inputs: &[SlotIndex],
        attributes: &[AttributeValue],
    ) -> [SlotIndex; N] {
        self.kernel_at(name, inputs, attributes, None)
    }

    pub fn kernel_with_location<const N: usize>(
        &mut self,
        name: &str,
        inputs: &[SlotIndex],
        attributes: &[AttributeValue],
        location: &Location,
    ) -> [SlotIndex; N] {
        self.kernel_at(name, inputs, attributes, Some(location))
    }

    fn kernel_at<const N: usize>(
        &mut self,
        name: &str,
        inputs: &[SlotIndex],
        attributes: &[AttributeValue],
        location: Option<&Location>,
    ) -> [SlotIndex; N] {
        let outputs = core::array::from_fn(|_| self.reserve_slot());
        self.raw_kernel(name, inputs, &outputs, attributes, location);
        outputs
    }

    /// Append a kernel with explicit output slots. Nothing is validated.
    pub fn raw_kernel(
        &mut self,
        name: &str,
        inputs: &[SlotIndex],
        outputs: &[SlotIndex],
        attributes: &[AttributeValue],
        location: Option<&Location>,
    ) {
        let kernel = self.program.kernel_index(name);
        let location = self.program.location_index(location);
        let attributes: Vec<_> = attributes
            .iter()
            .map(|value| self.program.attribute(value))
            .collect();
        put_u32(&mut self.kernels, kernel);
        put_u32(&mut self.kernels, location);
        put_list(&mut self.kernels, inputs);
        put_list(&mut self.kernels, outputs);
        put_list(&mut self.kernels, &attributes);
        self.num_kernels += 1;
    }

    /// Return `slot` as the next result, of type `ty`.
    pub fn result(&mut self, ty: &str, slot: SlotIndex) {
        let ty = self.program.type_index(ty);
        self.result_types.push(ty);
        self.results.push(slot);
    }

    pub fn finish(self) {
        let out = &mut self.program.functions;
        put_u32(out, self.name);
        out.push(FUNCTION_KIND_INTERPRETED);
        put_list(out, &self.argument_types);
        put_list(out, &self.result_types);
        put_u32(out, self.num_slots);
        put_u32(out, self.num_kernels);
        out.extend_from_slice(&self.kernels);
        for slot in self.results {
            put_u32(out, slot);
        }
        self.program.num_functions += 1;
    }
}
