use crate::{
    diagnostic::Location,
    format::{AttributeEntry, BodyRecord, ParseError, ParseErrorKind},
    function::FunctionSignature,
    types::SlotIndex,
};
use core::ops::Range;

/// Validated, index-based layout of one interpreted function.
#[derive(Debug)]
pub(crate) struct FunctionBody {
    pub(super) num_slots: usize,
    pub(super) kernels: Vec<KernelEntry>,
    /// Input and output slot lists of every kernel, back to back.
    pub(super) operands: Vec<SlotIndex>,
    /// `users[user_offsets[s]..user_offsets[s + 1]]` lists the kernels
    /// reading slot `s`, once per read.
    pub(super) user_offsets: Vec<u32>,
    pub(super) users: Vec<u32>,
    /// Kernels without inputs, dispatched at start.
    pub(super) roots: Vec<u32>,
    pub(super) results: Vec<SlotIndex>,
}

#[derive(Debug)]
pub(crate) struct KernelEntry {
    /// Index into the program's kernel table.
    pub(super) kernel: u32,
    pub(super) location: Option<u32>,
    pub(super) inputs: Range<u32>,
    pub(super) outputs: Range<u32>,
    pub(super) attributes: Vec<AttributeEntry>,
}

impl KernelEntry {
    pub(super) fn num_inputs(&self) -> u32 {
        self.inputs.end - self.inputs.start
    }
}

impl FunctionBody {
    /// Validate `record` and lay it out:
    /// - every slot is defined exactly once, by an argument or by one kernel
    ///   output,
    /// - every kernel input is defined by an argument or an earlier kernel,
    ///   which rules out cycles,
    /// - every result slot is defined.
    pub(crate) fn build(
        signature: &FunctionSignature,
        record: BodyRecord,
        locations: &[Location],
    ) -> Result<Self, ParseError> {
        let function = || signature.name.to_string();
        let num_slots = record.num_slots as usize;
        let num_arguments = signature.argument_types.len();
        if num_arguments > num_slots {
            return Err(ParseErrorKind::SlotOutOfRange {
                function: function(),
                slot: num_arguments as u32 - 1,
            }
            .into());
        }
        // Each slot needs its own definition, so a count beyond the
        // definitions present cannot be valid and must not size any table.
        let definitions = num_arguments as u64
            + record
                .kernels
                .iter()
                .map(|kernel| kernel.outputs.len() as u64)
                .sum::<u64>();
        if u64::from(record.num_slots) > definitions {
            return Err(ParseErrorKind::UndefinedSlots {
                function: function(),
                slots: record.num_slots,
                definitions,
            }
            .into());
        }
        let mut defined = vec![false; num_slots];
        defined[..num_arguments].fill(true);

        let mut kernels = Vec::with_capacity(record.kernels.len());
        let mut operands = Vec::new();
        let mut readers = vec![0_u32; num_slots + 1];
        for kernel in record.kernels {
            let location = kernel.location.map(|idx| &locations[idx as usize]);
            let fail = |kind: ParseErrorKind| ParseError::from(kind).at(location);
            let check_range = |slot: SlotIndex| {
                if (slot as usize) < num_slots {
                    Ok(slot as usize)
                } else {
                    Err(fail(ParseErrorKind::SlotOutOfRange {
                        function: function(),
                        slot,
                    }))
                }
            };
            for &slot in &kernel.inputs {
                if !defined[check_range(slot)?] {
                    return Err(fail(ParseErrorKind::SlotUndefined {
                        function: function(),
                        slot,
                    }));
                }
                readers[slot as usize] += 1;
            }
            for &slot in &kernel.outputs {
                let idx = check_range(slot)?;
                if core::mem::replace(&mut defined[idx], true) {
                    return Err(fail(ParseErrorKind::SlotRedefined {
                        function: function(),
                        slot,
                    }));
                }
            }
            let inputs_start = operands.len() as u32;
            operands.extend_from_slice(&kernel.inputs);
            let outputs_start = operands.len() as u32;
            operands.extend_from_slice(&kernel.outputs);
            kernels.push(KernelEntry {
                kernel: kernel.kernel,
                location: kernel.location,
                inputs: inputs_start..outputs_start,
                outputs: outputs_start..operands.len() as u32,
                attributes: kernel.attributes,
            });
        }

        if let Some(slot) = defined.iter().position(|defined| !defined) {
            return Err(ParseErrorKind::SlotUndefined {
                function: function(),
                slot: slot as u32,
            }
            .into());
        }
        for &slot in &record.results {
            if slot as usize >= num_slots {
                return Err(ParseErrorKind::SlotOutOfRange {
                    function: function(),
                    slot,
                }
                .into());
            }
        }

        // Exclusive prefix sum turns the per-slot reader counts into offsets.
        let mut total = 0_u32;
        for count in &mut readers {
            let next = total + *count;
            *count = total;
            total = next;
        }
        let user_offsets = readers;
        let mut fill = user_offsets.clone();
        let mut users = vec![0_u32; total as usize];
        let mut roots = Vec::new();
        for (idx, kernel) in kernels.iter().enumerate() {
            let idx = idx as u32;
            if kernel.num_inputs() == 0 {
                roots.push(idx);
            }
            for &slot in &operands[kernel.inputs.start as usize..kernel.inputs.end as usize] {
                let cursor = &mut fill[slot as usize];
                users[*cursor as usize] = idx;
                *cursor += 1;
            }
        }

        let body = Self {
            num_slots,
            kernels,
            operands,
            user_offsets,
            users,
            roots,
            results: record.results,
        };
        assert_eq!(
            body.user_offsets.len(),
            body.num_slots + 1,
            "FunctionBody::build: [1]"
        );
        Ok(body)
    }

    pub(super) fn inputs(&self, kernel: &KernelEntry) -> &[SlotIndex] {
        &self.operands[kernel.inputs.start as usize..kernel.inputs.end as usize]
    }

    pub(super) fn outputs(&self, kernel: &KernelEntry) -> &[SlotIndex] {
        &self.operands[kernel.outputs.start as usize..kernel.outputs.end as usize]
    }

    /// Kernels reading `slot`.
    pub(super) fn users(&self, slot: usize) -> &[u32] {
        let start = self.user_offsets[slot] as usize;
        let end = self.user_offsets[slot + 1] as usize;
        &self.users[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Container, ProgramWriter};

    fn build(bytes: &[u8]) -> Result<FunctionBody, ParseError> {
        let container = Container::parse(bytes).unwrap();
        let record = container.functions.into_iter().next().unwrap();
        let signature = FunctionSignature {
            name: record.name,
            argument_types: record.argument_types,
            result_types: record.result_types,
        };
        FunctionBody::build(&signature, record.body.unwrap(), &container.locations)
    }

    #[test]
    fn lays_out_users_and_roots() {
        let mut writer = ProgramWriter::new();
        let mut function = writer.function("f");
        let arg = function.argument("i32");
        let [a] = function.kernel("constant.i32", &[], &[]);
        let [b] = function.kernel("add.i32", &[arg, a], &[]);
        let [c] = function.kernel("add.i32", &[b, b], &[]);
        function.result("i32", c);
        function.finish();
        let body = build(&writer.finish()).unwrap();

        assert_eq!(body.num_slots, 4);
        assert_eq!(body.roots, [0]);
        assert_eq!(body.users(arg as usize), [1]);
        assert_eq!(body.users(a as usize), [1]);
        assert_eq!(body.users(b as usize), [2, 2]);
        assert!(body.users(c as usize).is_empty());
        assert_eq!(body.kernels[2].num_inputs(), 2);
        assert_eq!(body.outputs(&body.kernels[1]), [b]);
    }

    #[test]
    fn rejects_use_before_definition() {
        let mut writer = ProgramWriter::new();
        let mut function = writer.function("f");
        let later = function.reserve_slot();
        let location = Location {
            filename: "prog.mlir".into(),
            line: 3,
            column: 7,
        };
        function.raw_kernel("add.i32", &[later], &[], &[], Some(&location));
        function.raw_kernel("constant.i32", &[], &[later], &[], None);
        function.finish();
        let err = build(&writer.finish()).unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::SlotUndefined {
                function: "f".into(),
                slot: later
            }
        );
        assert_eq!(err.location, Some(location));
    }

    #[test]
    fn rejects_redefinition_and_dangling_results() {
        let mut writer = ProgramWriter::new();
        let mut function = writer.function("twice");
        let [a] = function.kernel("constant.i32", &[], &[]);
        function.raw_kernel("constant.i32", &[], &[a], &[], None);
        function.finish();
        let err = build(&writer.finish()).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::SlotRedefined { slot, .. } if slot == a));

        let mut writer = ProgramWriter::new();
        let mut function = writer.function("dangling");
        function.result("i32", 5);
        function.finish();
        let err = build(&writer.finish()).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::SlotOutOfRange { slot: 5, .. }));
    }

    #[test]
    fn rejects_slot_counts_beyond_definitions() {
        let mut writer = ProgramWriter::new();
        writer.function("huge").finish();
        let mut bytes = writer.finish();
        // An empty function record ends with its slot and kernel counts.
        let slots_at = bytes.len() - 8;
        bytes[slots_at..slots_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        let err = build(&bytes).unwrap_err();
        assert_eq!(
            err.kind,
            ParseErrorKind::UndefinedSlots {
                function: "huge".into(),
                slots: u32::MAX,
                definitions: 0,
            }
        );
    }
}
