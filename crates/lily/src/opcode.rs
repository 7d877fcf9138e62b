//! The opcode set and the instruction shape iterator.
//!
//! Code is a flat `Vec<u16>`. Every instruction follows one layout:
//!
//! ```text
//! opcode, special..., counter?, inputs..., outputs..., jumps..., line?
//! ```
//!
//! * `special` — non-register operands (literal/function/class indices).
//! * `counter` — present when the input, output, or jump count is dynamic;
//!   the counted section reads that many slots.
//! * `inputs` — registers the instruction reads.
//! * `outputs` — registers the instruction writes.
//! * `jumps` — signed relative offsets from the opcode position.
//! * `line` — the source line, on every instruction that can raise.
//!
//! [`CodeIter`] decodes this layout generically, which is what lets the
//! closure transform rewrite arbitrary code and the disassembler render it
//! without per-opcode knowledge.

use strum::FromRepr;

/// Jump operand placeholder written by catching opcodes to mean "no next
/// branch". Real jumps are never zero (they would loop on themselves).
pub(crate) const NO_NEXT_BRANCH: u16 = 0;

/// Register operand meaning "discard the result".
pub(crate) const NO_RESULT: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum Opcode {
    Assign,
    /// Assignment with deref of the old value and incref of the new.
    RefAssign,
    /// Assignment into an `Any`, rewrapping the value with its type tag.
    AnyAssign,
    GetGlobal,
    SetGlobal,
    /// Loads an interned literal.
    GetReadonly,
    /// Loads a plain (capture-free) method value.
    LoadFunction,
    /// Loads a method value bound to the current closure cells.
    LoadClosure,

    IntegerAdd,
    IntegerMinus,
    IntegerMul,
    IntegerDiv,
    Modulo,
    LeftShift,
    RightShift,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    DoubleAdd,
    DoubleMinus,
    DoubleMul,
    DoubleDiv,
    StringConcat,

    IsEqual,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,

    UnaryNot,
    UnaryMinus,

    Jump,
    /// `special` holds the truthiness selector: jump on 1 = true, 0 = false.
    JumpIf,
    /// Sanity-checks the range before entering an integer for loop and
    /// gives the user loop var its initial value. `special` is 1 when the
    /// step must be inferred from the range direction.
    ForSetup,
    /// One pass of an integer range loop; jumps out when the range ends.
    IntegerFor,

    ReturnVal,
    ReturnNoval,
    /// Emitted when a non-void method can fall off its end; raises.
    ReturnExpected,
    /// Leaves the VM entirely. Written at the end of `__main__`.
    ReturnFromVm,

    BuildList,
    /// Counter is the number of values (keys and values interleaved), not
    /// the number of pairs, so the count always precedes that many slots.
    BuildHash,
    BuildTuple,
    /// `special` carries the enum class id and the variant index.
    BuildVariant,

    GetItem,
    SetItem,
    GetProperty,
    SetProperty,

    /// Checked downcast out of an `Any`; raises `BadCast` on mismatch.
    AnyTypecast,
    IntDblTypecast,

    /// Calls the function table entry in `special`.
    CallReadonly,
    /// Calls through a register (function values and closures).
    CallRegister,
    /// Allocates an instance of `special`'s class with nil properties.
    NewInstance,

    PushTry,
    PopTry,
    Raise,
    /// Catch clause head: `special` is the class id and the register the
    /// exception binds to (`NO_RESULT` when there is no `as` clause). The
    /// jump leads to the next clause, `NO_NEXT_BRANCH` for the last.
    Except,

    /// Creates the closure cell array; `special` is the cell count.
    ClosureNew,
    ClosureSet,
    ClosureGet,

    /// Jump table over an enum value's variant index.
    MatchDispatch,
    /// Unpacks a matched variant's payload into bind registers.
    VariantDecompose,

    /// Debug output of a value with its type.
    Show,
    PackageGet,
    PackageSet,
    PackageGetDeep,
    PackageSetDeep,
}

/// How many slots a section occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Count {
    Fixed(u16),
    /// Read the instruction's counter slot.
    Counted,
}

/// Shape of one opcode under the shared layout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpShape {
    pub special: u16,
    pub inputs: Count,
    pub outputs: Count,
    pub jumps: Count,
    pub has_line: bool,
}

impl OpShape {
    pub fn has_counter(&self) -> bool {
        self.inputs == Count::Counted
            || self.outputs == Count::Counted
            || self.jumps == Count::Counted
    }
}

const fn shape(special: u16, inputs: Count, outputs: Count, jumps: Count, has_line: bool) -> OpShape {
    OpShape {
        special,
        inputs,
        outputs,
        jumps,
        has_line,
    }
}

use Count::{Counted, Fixed};

impl Opcode {
    /// The operand shape for this opcode. The emitter writes and the VM
    /// reads with this exact agreement.
    pub(crate) fn shape(self) -> OpShape {
        match self {
            Self::Assign | Self::RefAssign | Self::AnyAssign => {
                shape(0, Fixed(1), Fixed(1), Fixed(0), true)
            }
            Self::GetGlobal => shape(1, Fixed(0), Fixed(1), Fixed(0), true),
            Self::SetGlobal => shape(1, Fixed(1), Fixed(0), Fixed(0), true),
            Self::GetReadonly | Self::LoadFunction | Self::LoadClosure => {
                shape(1, Fixed(0), Fixed(1), Fixed(0), true)
            }

            Self::IntegerAdd
            | Self::IntegerMinus
            | Self::IntegerMul
            | Self::IntegerDiv
            | Self::Modulo
            | Self::LeftShift
            | Self::RightShift
            | Self::BitwiseAnd
            | Self::BitwiseOr
            | Self::BitwiseXor
            | Self::DoubleAdd
            | Self::DoubleMinus
            | Self::DoubleMul
            | Self::DoubleDiv
            | Self::StringConcat
            | Self::IsEqual
            | Self::NotEq
            | Self::Less
            | Self::LessEq
            | Self::Greater
            | Self::GreaterEq => shape(0, Fixed(2), Fixed(1), Fixed(0), true),

            Self::UnaryNot | Self::UnaryMinus => shape(0, Fixed(1), Fixed(1), Fixed(0), true),

            Self::Jump => shape(0, Fixed(0), Fixed(0), Fixed(1), false),
            Self::JumpIf => shape(1, Fixed(1), Fixed(0), Fixed(1), false),
            Self::ForSetup => shape(1, Fixed(3), Fixed(1), Fixed(0), true),
            Self::IntegerFor => shape(0, Fixed(3), Fixed(1), Fixed(1), true),

            Self::ReturnVal => shape(0, Fixed(1), Fixed(0), Fixed(0), true),
            Self::ReturnNoval | Self::ReturnExpected => {
                shape(0, Fixed(0), Fixed(0), Fixed(0), true)
            }
            Self::ReturnFromVm => shape(0, Fixed(0), Fixed(0), Fixed(0), false),

            Self::BuildList | Self::BuildHash | Self::BuildTuple => {
                shape(0, Counted, Fixed(1), Fixed(0), true)
            }
            Self::BuildVariant => shape(2, Counted, Fixed(1), Fixed(0), true),

            Self::GetItem => shape(0, Fixed(2), Fixed(1), Fixed(0), true),
            Self::SetItem => shape(0, Fixed(3), Fixed(0), Fixed(0), true),
            Self::GetProperty => shape(1, Fixed(1), Fixed(1), Fixed(0), true),
            Self::SetProperty => shape(1, Fixed(2), Fixed(0), Fixed(0), true),

            Self::AnyTypecast | Self::IntDblTypecast => {
                shape(0, Fixed(1), Fixed(1), Fixed(0), true)
            }

            Self::CallReadonly | Self::CallRegister => shape(1, Counted, Fixed(1), Fixed(0), true),
            Self::NewInstance => shape(1, Fixed(0), Fixed(1), Fixed(0), true),

            Self::PushTry => shape(0, Fixed(0), Fixed(0), Fixed(1), false),
            Self::PopTry => shape(0, Fixed(0), Fixed(0), Fixed(0), false),
            Self::Raise => shape(0, Fixed(1), Fixed(0), Fixed(0), true),
            Self::Except => shape(2, Fixed(0), Fixed(0), Fixed(1), false),

            Self::ClosureNew => shape(1, Fixed(0), Fixed(1), Fixed(0), true),
            Self::ClosureSet => shape(1, Fixed(1), Fixed(0), Fixed(0), true),
            Self::ClosureGet => shape(1, Fixed(0), Fixed(1), Fixed(0), true),

            Self::MatchDispatch => shape(0, Fixed(1), Fixed(0), Counted, true),
            Self::VariantDecompose => shape(0, Fixed(1), Counted, Fixed(0), true),

            Self::Show => shape(0, Fixed(1), Fixed(0), Fixed(0), true),
            Self::PackageGet => shape(2, Fixed(0), Fixed(1), Fixed(0), true),
            Self::PackageSet => shape(2, Fixed(1), Fixed(0), Fixed(0), true),
            Self::PackageGetDeep => shape(3, Fixed(0), Fixed(1), Fixed(0), true),
            Self::PackageSetDeep => shape(3, Fixed(1), Fixed(0), Fixed(0), true),
        }
    }
}

/// One decoded instruction: section positions within the code buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodeRound {
    pub offset: usize,
    pub opcode: Opcode,
    /// Slot index of the special section.
    pub special_at: usize,
    pub special: u16,
    /// The counter value (0 when the shape has none).
    pub counter: u16,
    pub inputs_at: usize,
    pub inputs: u16,
    pub outputs_at: usize,
    pub outputs: u16,
    pub jumps_at: usize,
    pub jumps: u16,
    /// Slot index of the line number; `usize::MAX` when absent.
    pub line_at: usize,
    /// Total slots including the opcode itself.
    pub round_total: usize,
}

impl CodeRound {
    pub fn line(&self, code: &[u16]) -> u16 {
        if self.line_at == usize::MAX {
            0
        } else {
            code[self.line_at]
        }
    }
}

/// Iterates instructions in a code buffer, reporting each one's layout.
#[derive(Debug)]
pub(crate) struct CodeIter<'a> {
    code: &'a [u16],
    pos: usize,
    stop: usize,
}

impl<'a> CodeIter<'a> {
    pub fn new(code: &'a [u16], start: usize, stop: usize) -> Self {
        Self {
            code,
            pos: start,
            stop,
        }
    }

    /// Decodes the instruction at the current position and advances past
    /// it. Returns `None` at the stop position.
    ///
    /// # Panics
    /// Panics on an unknown opcode; the emitter never writes one.
    pub fn next(&mut self) -> Option<CodeRound> {
        if self.pos >= self.stop {
            return None;
        }
        let offset = self.pos;
        let opcode =
            Opcode::from_repr(self.code[offset]).expect("CodeIter: unknown opcode in code buffer");
        let shape = opcode.shape();

        let mut at = offset + 1;
        let special_at = at;
        at += shape.special as usize;

        let counter = if shape.has_counter() {
            let value = self.code[at];
            at += 1;
            value
        } else {
            0
        };

        let resolve = |count: Count| -> u16 {
            match count {
                Count::Fixed(n) => n,
                Count::Counted => counter,
            }
        };

        let inputs = resolve(shape.inputs);
        let inputs_at = at;
        at += inputs as usize;

        let outputs = resolve(shape.outputs);
        let outputs_at = at;
        at += outputs as usize;

        let jumps = resolve(shape.jumps);
        let jumps_at = at;
        at += jumps as usize;

        let line_at = if shape.has_line {
            let slot = at;
            at += 1;
            slot
        } else {
            usize::MAX
        };

        self.pos = at;
        Some(CodeRound {
            offset,
            opcode,
            special_at,
            special: if shape.special > 0 {
                self.code[special_at]
            } else {
                0
            },
            counter,
            inputs_at,
            inputs,
            outputs_at,
            outputs,
            jumps_at,
            jumps,
            line_at,
            round_total: at - offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iter_walks_mixed_instructions() {
        // get_readonly 3 -> r1 ; integer_add r1 r1 -> r2 ; jump +2 ; return_noval
        let code: Vec<u16> = vec![
            Opcode::GetReadonly as u16,
            3,
            1,
            7, // line
            Opcode::IntegerAdd as u16,
            1,
            1,
            2,
            7,
            Opcode::Jump as u16,
            2,
            Opcode::ReturnNoval as u16,
            8,
        ];
        let mut iter = CodeIter::new(&code, 0, code.len());

        let round = iter.next().unwrap();
        assert_eq!(round.opcode, Opcode::GetReadonly);
        assert_eq!(round.special, 3);
        assert_eq!(round.outputs, 1);
        assert_eq!(code[round.outputs_at], 1);
        assert_eq!(round.line(&code), 7);

        let round = iter.next().unwrap();
        assert_eq!(round.opcode, Opcode::IntegerAdd);
        assert_eq!(round.inputs, 2);
        assert_eq!(code[round.inputs_at], 1);
        assert_eq!(code[round.outputs_at], 2);

        let round = iter.next().unwrap();
        assert_eq!(round.opcode, Opcode::Jump);
        assert_eq!(round.jumps, 1);
        assert_eq!(code[round.jumps_at], 2);
        assert_eq!(round.line_at, usize::MAX);

        let round = iter.next().unwrap();
        assert_eq!(round.opcode, Opcode::ReturnNoval);
        assert!(iter.next().is_none());
    }

    #[test]
    fn counted_sections_read_the_counter() {
        // build_list of 3 values into r5
        let code: Vec<u16> = vec![Opcode::BuildList as u16, 3, 0, 1, 2, 5, 4];
        let mut iter = CodeIter::new(&code, 0, code.len());
        let round = iter.next().unwrap();
        assert_eq!(round.counter, 3);
        assert_eq!(round.inputs, 3);
        assert_eq!(&code[round.inputs_at..round.inputs_at + 3], &[0, 1, 2]);
        assert_eq!(code[round.outputs_at], 5);
        assert_eq!(round.line(&code), 4);
        assert_eq!(round.round_total, 7);
    }

    #[test]
    fn match_dispatch_counts_jumps() {
        let code: Vec<u16> = vec![Opcode::MatchDispatch as u16, 2, 9, 10, 20, 3];
        let mut iter = CodeIter::new(&code, 0, code.len());
        let round = iter.next().unwrap();
        assert_eq!(round.inputs, 1);
        assert_eq!(code[round.inputs_at], 9);
        assert_eq!(round.jumps, 2);
        assert_eq!(&code[round.jumps_at..round.jumps_at + 2], &[10, 20]);
    }
}
