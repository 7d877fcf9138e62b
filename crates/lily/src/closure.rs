//! The closure transform.
//!
//! A method whose locals are captured (or that captures locals itself) has
//! its already-emitted code rewritten once, when it finishes emission.
//! Captured locals live in a shared cell array addressed by compile-time
//! closure spots. The rewrite walks the original code with [`CodeIter`]
//! and emits to a fresh buffer: a prelude that materializes the cell
//! array, then, for every instruction, `closure_get` loads for inputs that
//! map to cells, the instruction itself with unchanged operands, and
//! `closure_set` stores for outputs that map to cells. Writing outputs
//! after inputs preserves the original semantics.
//!
//! Jumps are collected in a sorted destination list on a first pass; each
//! jump is then resolved to a new relative offset, pulled back by the
//! `closure_get` loads inserted ahead of its target so the loads run
//! before the landing instruction.

use crate::opcode::{CodeIter, NO_NEXT_BRANCH, Opcode};

/// A spot not in the transform table: leave the register access alone.
const NOT_CAPTURED: u16 = u16::MAX;

/// Slots one inserted `closure_get`/`closure_set` occupies.
const TRANSFORM_LEN: usize = 4;

/// Everything the transform needs about the closing method.
#[derive(Debug)]
pub(crate) struct TransformCtx<'a> {
    /// The emitter's code buffer; the method's code starts at `code_start`.
    pub code: &'a [u16],
    pub code_start: usize,
    /// True when this method creates the cell array (its locals are
    /// captured but it captures nothing from further out).
    pub is_backing: bool,
    /// The method's nesting depth; selects which closure spots are its own.
    pub function_depth: u16,
    /// Parameter count, including self. Parameters that are captured must
    /// be stored into their cells in the prelude.
    pub param_count: u16,
    /// Register count so far; the backing method takes one more register
    /// to anchor the cell array against the collector.
    pub next_reg_spot: u16,
}

#[derive(Debug)]
pub(crate) struct TransformResult {
    /// Replacement for `code[code_start..]`.
    pub code: Vec<u16>,
    /// One more than the input when a backing register was reserved.
    pub next_reg_spot: u16,
    /// Closure spots holding this method's own locals; the VM refreshes
    /// these cells on entry so recursive calls see fresh captures.
    pub fresh_cells: Vec<u16>,
}

/// Finds the first line number recorded in the code segment, for the
/// prelude instructions.
fn first_line_of(code: &[u16], start: usize) -> u16 {
    let mut iter = CodeIter::new(code, start, code.len());
    while let Some(round) = iter.next() {
        if round.line_at != usize::MAX {
            return code[round.line_at];
        }
    }
    0
}

/// Records `dest` in the sorted jump-destination list if it is new. Kept
/// lowest-to-highest so the rewrite pass can advance through it without
/// searching.
fn maybe_add_jump(jump_map: &mut Vec<(usize, usize)>, dest: usize) {
    for i in 0..jump_map.len() {
        if jump_map[i].0 > dest {
            jump_map.insert(i, (dest, 0));
            return;
        }
        if jump_map[i].0 == dest {
            return;
        }
    }
    jump_map.push((dest, 0));
}

/// Counts the `closure_get` loads the rewrite inserted ahead of the
/// instruction at `at` (a jump destination), so the jump can be pulled
/// back to run them.
fn count_transforms(code: &[u16], at: usize, table: &[u16]) -> usize {
    let mut iter = CodeIter::new(code, at, code.len());
    let round = iter.next().expect("count_transforms: jump outside code");
    let mut count = 0;

    let spot_of = |reg: u16| table.get(reg as usize).copied().unwrap_or(NOT_CAPTURED);

    if round.opcode == Opcode::CallRegister && spot_of(code[round.special_at]) != NOT_CAPTURED {
        count += 1;
    }
    for i in 0..round.inputs as usize {
        if spot_of(code[round.inputs_at + i]) != NOT_CAPTURED {
            count += 1;
        }
    }
    count
}

/// Rewrites a method's code to route captured registers through closure
/// cells. `closure_spots` is the emitter's accumulated `(register, depth)`
/// list; the entries belonging to this method are consumed, and the whole
/// list is drained when the backing method closes.
pub(crate) fn transform(ctx: &TransformCtx<'_>, closure_spots: &mut Vec<(u16, u16)>) -> TransformResult {
    let code = ctx.code;
    let mut aux: Vec<u16> = Vec::with_capacity(code.len() - ctx.code_start);
    let first_line = first_line_of(code, ctx.code_start);
    let mut next_reg_spot = ctx.next_reg_spot;

    if ctx.is_backing {
        // Put the closure into a fresh register so the collector always
        // sees it rooted.
        let closure_reg = next_reg_spot;
        next_reg_spot += 1;
        let total_spots = u16::try_from(closure_spots.len()).expect("closure spots exceed u16");
        aux.extend_from_slice(&[
            Opcode::ClosureNew as u16,
            total_spots,
            closure_reg,
            first_line,
        ]);
    }

    // Build the register -> spot map for this method's own captures. A
    // captured parameter must always exist in the cells, so store it in
    // the prelude.
    let mut table = vec![NOT_CAPTURED; next_reg_spot as usize];
    let mut fresh_cells = Vec::new();
    for (spot_index, entry) in closure_spots.iter_mut().enumerate() {
        if entry.1 == ctx.function_depth {
            let reg = entry.0;
            let spot = u16::try_from(spot_index).expect("closure spot index exceeds u16");
            if reg < ctx.param_count {
                aux.extend_from_slice(&[Opcode::ClosureSet as u16, spot, reg, first_line]);
            }
            if (reg as usize) < table.len() {
                table[reg as usize] = spot;
            }
            // Keep other methods at this level from claiming this local.
            entry.1 = u16::MAX;
        }
    }
    if !ctx.is_backing {
        for (reg, &spot) in table.iter().enumerate() {
            if spot != NOT_CAPTURED && reg >= ctx.param_count as usize {
                fresh_cells.push(spot);
            }
        }
    }
    if ctx.is_backing {
        closure_spots.clear();
    }

    // First pass: list every jump destination, sorted.
    let mut jump_map: Vec<(usize, usize)> = Vec::new();
    let mut iter = CodeIter::new(code, ctx.code_start, code.len());
    while let Some(round) = iter.next() {
        for i in 0..round.jumps as usize {
            let jump = code[round.jumps_at + i] as i16;
            // Catching opcodes write a zero jump to mean "no next branch";
            // those are not patched.
            if jump == NO_NEXT_BRANCH as i16 {
                continue;
            }
            let dest = round
                .offset
                .checked_add_signed(jump as isize)
                .expect("jump destination before code start");
            maybe_add_jump(&mut jump_map, dest);
        }
    }

    let spot_of = |table: &[u16], reg: u16| -> u16 {
        table.get(reg as usize).copied().unwrap_or(NOT_CAPTURED)
    };

    // Second pass: rewrite. Pending jumps are recorded as
    // (aux position of the jump slot, slot offset from the new opcode) and
    // temporarily hold their absolute destination in the original code.
    let mut pending_jumps: Vec<(usize, usize)> = Vec::new();
    let mut map_iter = 0usize;
    let mut iter = CodeIter::new(code, ctx.code_start, code.len());
    while let Some(round) = iter.next() {
        // Inputs that live in cells are fetched first, so an assignment to
        // the local as an upvalue is seen here.
        if round.opcode == Opcode::CallRegister {
            let callee = code[round.special_at];
            let spot = spot_of(&table, callee);
            if spot != NOT_CAPTURED {
                aux.extend_from_slice(&[Opcode::ClosureGet as u16, spot, callee, first_line]);
            }
        }
        for i in 0..round.inputs as usize {
            let reg = code[round.inputs_at + i];
            let spot = spot_of(&table, reg);
            if spot != NOT_CAPTURED {
                aux.extend_from_slice(&[Opcode::ClosureGet as u16, spot, reg, first_line]);
            }
        }

        // If this instruction is a jump target, record where the rewrite
        // placed it.
        if map_iter < jump_map.len() && jump_map[map_iter].0 == round.offset {
            jump_map[map_iter].1 = aux.len();
            map_iter += 1;
        }

        // Copy the instruction through the jump section; jump operands are
        // rewritten below and the line slot follows them.
        let body_stop = round.offset + round.round_total
            - round.jumps as usize
            - usize::from(round.line_at != usize::MAX);
        aux.extend_from_slice(&code[round.offset..body_stop]);

        for i in 0..round.jumps as usize {
            let distance = code[round.jumps_at + i] as i16;
            if distance != NO_NEXT_BRANCH as i16 {
                let destination = round
                    .offset
                    .checked_add_signed(distance as isize)
                    .expect("jump destination before code start");
                let slot_offset = body_stop - round.offset + i;
                pending_jumps.push((aux.len(), slot_offset));
                aux.push(u16::try_from(destination).expect("code position exceeds u16"));
            } else {
                aux.push(NO_NEXT_BRANCH);
            }
        }

        if round.line_at != usize::MAX {
            aux.push(code[round.line_at]);
        }

        // Outputs written to cells are stored after the instruction runs.
        for i in 0..round.outputs as usize {
            let reg = code[round.outputs_at + i];
            let spot = spot_of(&table, reg);
            if spot != NOT_CAPTURED {
                aux.extend_from_slice(&[Opcode::ClosureSet as u16, spot, reg, first_line]);
            }
        }
    }

    // Resolve the recorded jumps against the destination map.
    for &(aux_pos, slot_offset) in &pending_jumps {
        let original = aux[aux_pos] as usize;
        let entry = jump_map
            .iter()
            .find(|&&(dest, _)| dest == original)
            .expect("recorded jump has no destination entry");
        let tx_offset = count_transforms(code, original, &table) * TRANSFORM_LEN;
        let new_jump = entry.1 as i64 - aux_pos as i64 + slot_offset as i64 - tx_offset as i64;
        aux[aux_pos] = (new_jump as i16) as u16;
    }

    TransformResult {
        code: aux,
        next_reg_spot,
        fresh_cells,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// With an empty spot table the rewrite must reproduce the code
    /// byte-for-byte (no captures, no prelude).
    #[test]
    fn transform_without_captures_is_identity() {
        let code: Vec<u16> = vec![
            Opcode::GetReadonly as u16,
            0,
            1,
            1, // line
            Opcode::IntegerAdd as u16,
            1,
            1,
            2,
            1,
            Opcode::ReturnVal as u16,
            2,
            1,
        ];
        let mut spots = Vec::new();
        let ctx = TransformCtx {
            code: &code,
            code_start: 0,
            is_backing: false,
            function_depth: 2,
            param_count: 0,
            next_reg_spot: 3,
        };
        let result = transform(&ctx, &mut spots);
        assert_eq!(result.code, code);
        assert_eq!(result.next_reg_spot, 3);
        assert!(result.fresh_cells.is_empty());
    }

    /// A captured local gets a `closure_get` before each read and a
    /// `closure_set` after each write.
    #[test]
    fn captured_register_reads_and_writes_cells() {
        // r0 = r0 + r0 (r0 captured at spot 0)
        let code: Vec<u16> = vec![Opcode::IntegerAdd as u16, 0, 0, 0, 5];
        let mut spots = vec![(0u16, 2u16)];
        let ctx = TransformCtx {
            code: &code,
            code_start: 0,
            is_backing: true,
            function_depth: 2,
            param_count: 0,
            next_reg_spot: 1,
        };
        let result = transform(&ctx, &mut spots);
        // Prelude: closure_new 1 -> r1. Then get, get, add, set.
        let expected: Vec<u16> = vec![
            Opcode::ClosureNew as u16,
            1,
            1,
            5,
            Opcode::ClosureGet as u16,
            0,
            0,
            5,
            Opcode::ClosureGet as u16,
            0,
            0,
            5,
            Opcode::IntegerAdd as u16,
            0,
            0,
            0,
            5,
            Opcode::ClosureSet as u16,
            0,
            0,
            5,
        ];
        assert_eq!(result.code, expected);
        assert_eq!(result.next_reg_spot, 2);
        assert!(spots.is_empty(), "backing close drains the spot list");
    }

    /// A backward jump over a transformed instruction lands on the
    /// inserted `closure_get`, not the instruction itself.
    #[test]
    fn jumps_pull_back_over_inserted_loads() {
        // loop: r1 = r0 + r0 ; jump -> loop (r0 captured)
        let code: Vec<u16> = vec![
            Opcode::IntegerAdd as u16,
            0,
            0,
            1,
            3,
            Opcode::Jump as u16,
            (-5i16) as u16,
        ];
        let mut spots = vec![(0u16, 2u16)];
        let ctx = TransformCtx {
            code: &code,
            code_start: 0,
            is_backing: true,
            function_depth: 2,
            param_count: 0,
            next_reg_spot: 2,
        };
        let result = transform(&ctx, &mut spots);

        // The add gained one closure_get (its two inputs are the same
        // register twice, so two gets are emitted, one per operand).
        // Locate the rewritten jump and check it lands at the first
        // closure_get ahead of the add.
        let jump_at = result
            .code
            .windows(1)
            .position(|w| w[0] == Opcode::Jump as u16)
            .expect("jump survives rewrite");
        let offset = result.code[jump_at + 1] as i16;
        let target = (jump_at as i64 + i64::from(offset)) as usize;
        // Prelude is closure_new (4 slots); the first get follows it.
        assert_eq!(target, 4);
        assert_eq!(result.code[target], Opcode::ClosureGet as u16);
    }
}
