//! The expression compiler.
//!
//! The emitter owns a stack of blocks (one per lexical/control structure),
//! a shared `u16` code buffer, and the storages (anonymous registers) of
//! the method being compiled. Statements are appended to the current
//! method's segment of the code buffer; when a method block closes, its
//! segment is split off into the method value, leaving the enclosing
//! method's code contiguous.
//!
//! Branches write placeholder jump operands and record them in the patch
//! vector; closing a block rewrites every patch recorded since the block
//! opened. `break` injects its patch into the enclosing loop's segment so
//! that segment stays contiguous.

use ahash::AHashSet;

use crate::{
    ast::{AstId, AstPool, ExprOp, TreeKind},
    closure::{self, TransformCtx},
    msgbuf::MsgBuf,
    opcode::{NO_RESULT, Opcode},
    raiser::{ErrorClass, ParseResult, Raise},
    sig::SigId,
    symtab::{
        CLS_ANY, CLS_BOOLEAN, CLS_DOUBLE, CLS_FUNCTION, CLS_HASH, CLS_INTEGER, CLS_LIST,
        CLS_STRING, CLS_TEMPLATE, CLS_TUPLE, CLS_UNIT, ClassId, ClassKind, ClassMember, LitValue,
        Symtab, VarId, VarKind, Visibility,
    },
    value::{FuncBody, FunctionId, FunctionVal, NativeFunc, RegInfo},
};

/// This method's own locals are captured by an inner method.
const BLOCK_CLOSURE_ORIGIN: u8 = 0x1;
/// This method touches cells owned further out (reads upvalues or loads an
/// inner closure), so its frame needs the inherited cell array.
const BLOCK_USES_CLOSURE: u8 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Main,
    Define,
    ClassInit,
    Lambda,
    If,
    IfElse,
    While,
    DoWhile,
    ForIn,
    Try,
    TryExcept,
    Match,
    AndOr,
}

impl BlockKind {
    fn is_scope(self) -> bool {
        matches!(
            self,
            Self::Main | Self::Define | Self::ClassInit | Self::Lambda
        )
    }

    fn is_loop(self) -> bool {
        matches!(self, Self::While | Self::DoWhile | Self::ForIn)
    }
}

/// A patch: the slot holding the jump operand and the position of the
/// opcode it is relative to.
type Patch = (usize, usize);

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    code_start: usize,
    patch_start: usize,
    var_start: usize,
    storage_start: usize,
    /// Jump target for `continue`.
    loop_start: Option<usize>,
    /// The pending conditional jump of the current if/while branch.
    branch_patch: Option<Patch>,

    // Scope (method) fields.
    func: Option<FunctionId>,
    depth: u16,
    next_reg_spot: u16,
    param_count: u16,
    self_class: Option<ClassId>,
    ret_sig: Option<SigId>,
    /// Lambdas infer their return from the first `return`.
    ret_inferred: bool,
    reg_info: Vec<RegInfo>,
    flags: u8,
    last_op_returned: bool,

    // Match fields.
    match_reg: u16,
    match_class: Option<ClassId>,
    match_dispatch_at: usize,
    match_cases_seen: Vec<bool>,
    match_in_case: bool,

    // Try fields.
    try_patch: Option<Patch>,
    except_next_patch: Option<Patch>,
    has_except: bool,
}

impl Block {
    fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            code_start: 0,
            patch_start: 0,
            var_start: 0,
            storage_start: 0,
            loop_start: None,
            branch_patch: None,
            func: None,
            depth: 0,
            next_reg_spot: 0,
            param_count: 0,
            self_class: None,
            ret_sig: None,
            ret_inferred: false,
            reg_info: Vec::new(),
            flags: 0,
            last_op_returned: false,
            match_reg: 0,
            match_class: None,
            match_dispatch_at: 0,
            match_cases_seen: Vec::new(),
            match_in_case: false,
            try_patch: None,
            except_next_patch: None,
            has_except: false,
        }
    }
}

/// An anonymous register holding an intermediate result. Reused within a
/// method when the signature matches and the expression number differs.
#[derive(Debug)]
struct Storage {
    sig: SigId,
    reg: u16,
    expr_num: u32,
}

/// A fully evaluated expression: its type and the local register holding
/// the value. A unit result has no register.
pub(crate) type ExprResult = (SigId, u16);

#[derive(Debug)]
pub(crate) struct Emitter {
    code: Vec<u16>,
    patches: Vec<Patch>,
    blocks: Vec<Block>,
    storages: Vec<Storage>,
    expr_num: u32,
    function_depth: u16,
    /// `(register, depth)` pairs for captured locals, shared across the
    /// whole chain of nested methods until the backing method closes.
    closure_spots: Vec<(u16, u16)>,
    /// Methods that must bind the current cells when loaded as values.
    closure_functions: AHashSet<FunctionId>,
    /// Register metadata of the global window, persistent across chunks.
    main_reg_info: Vec<RegInfo>,
    main_func: FunctionId,
    /// Rewrite target for in-place build coercion: position and output
    /// register of the most recent container build.
    last_build: Option<(usize, u16)>,
    /// Reused buffer for messages that interleave text with rendered
    /// types.
    msgbuf: MsgBuf,
    /// Current line for errors raised mid-expression.
    pub line: u16,
}

impl Emitter {
    /// Creates the emitter and the `__main__` method the top level emits
    /// into.
    pub fn new(symtab: &mut Symtab) -> Self {
        let unit = symtab.sig_for_class(CLS_UNIT);
        let main_sig = symtab.function_sig(unit, &[], false);
        let main_func = symtab.add_function(FunctionVal {
            name: "__main__".into(),
            trace_name: "__main__".into(),
            sig: main_sig,
            line: 0,
            body: FuncBody::Native(NativeFunc {
                code: Vec::new(),
                reg_count: 0,
                param_count: 0,
                reg_info: Vec::new(),
                fresh_cells: Vec::new(),
            }),
        });
        let mut main_block = Block::new(BlockKind::Main);
        main_block.func = Some(main_func);
        main_block.depth = 1;
        Self {
            code: Vec::new(),
            patches: Vec::new(),
            blocks: vec![main_block],
            storages: Vec::new(),
            expr_num: 1,
            function_depth: 1,
            closure_spots: Vec::new(),
            closure_functions: AHashSet::new(),
            main_reg_info: Vec::new(),
            main_func,
            last_build: None,
            msgbuf: MsgBuf::new(),
            line: 0,
        }
    }

    pub fn main_func(&self) -> FunctionId {
        self.main_func
    }

    pub fn function_depth(&self) -> u16 {
        self.function_depth
    }

    fn raise(&self, message: impl Into<String>) -> Raise {
        Raise::new(ErrorClass::Syntax, message, self.line)
    }

    /// Builds `before<type-a>mid<type-b>after` through the message buffer
    /// and raises it. This is the typed (`%T`) error path.
    fn raise_two_types(
        &mut self,
        symtab: &Symtab,
        before: &str,
        a: SigId,
        mid: &str,
        b: SigId,
        after: &str,
    ) -> Raise {
        self.msgbuf.reset();
        self.msgbuf
            .add(before)
            .add_sig(symtab, a)
            .add(mid)
            .add_sig(symtab, b)
            .add(after);
        Raise::new(ErrorClass::Syntax, self.msgbuf.flush(), self.line)
    }

    // -- block plumbing ----------------------------------------------------

    fn scope_index(&self) -> usize {
        self.blocks
            .iter()
            .rposition(|b| b.kind.is_scope())
            .expect("emitter always has a scope block")
    }

    fn scope(&self) -> &Block {
        &self.blocks[self.scope_index()]
    }

    fn scope_mut(&mut self) -> &mut Block {
        let index = self.scope_index();
        &mut self.blocks[index]
    }

    fn block(&self) -> &Block {
        self.blocks.last().expect("emitter always has a block")
    }

    fn block_mut(&mut self) -> &mut Block {
        self.blocks.last_mut().expect("emitter always has a block")
    }

    fn push_block(&mut self, symtab: &Symtab, kind: BlockKind) {
        let mut block = Block::new(kind);
        block.code_start = self.code.len();
        block.patch_start = self.patches.len();
        block.var_start = symtab.var_count();
        block.storage_start = self.storages.len();
        if !kind.is_scope() {
            // Control blocks allocate from the enclosing scope.
            let scope = self.scope();
            block.depth = scope.depth;
        }
        self.blocks.push(block);
    }

    // -- registers and storages --------------------------------------------

    /// Allocates the next register of the current scope and records its
    /// metadata.
    fn alloc_reg(&mut self, sig: SigId, name: Option<&str>, line: u16) -> u16 {
        let info = RegInfo {
            sig,
            name: name.map(Into::into),
            line,
        };
        let scope_index = self.scope_index();
        if self.blocks[scope_index].kind == BlockKind::Main {
            let reg = u16::try_from(self.main_reg_info.len()).expect("global registers exceed u16");
            self.main_reg_info.push(info);
            self.blocks[scope_index].next_reg_spot = reg + 1;
            reg
        } else {
            let block = &mut self.blocks[scope_index];
            let reg = block.next_reg_spot;
            block.next_reg_spot += 1;
            block.reg_info.push(info);
            reg
        }
    }

    /// Fetches a storage of this signature, reusing one no longer needed
    /// by the current expression.
    fn get_storage(&mut self, _symtab: &mut Symtab, sig: SigId) -> u16 {
        let start = self.scope().storage_start;
        let expr_num = self.expr_num;
        if let Some(storage) = self.storages[start..]
            .iter_mut()
            .find(|s| s.sig == sig && s.expr_num != expr_num)
        {
            storage.expr_num = expr_num;
            return storage.reg;
        }
        let reg = self.alloc_reg(sig, None, self.line);
        self.storages.push(Storage {
            sig,
            reg,
            expr_num,
        });
        reg
    }

    // -- code writing ------------------------------------------------------

    fn write(&mut self, slots: &[u16]) {
        self.code.extend_from_slice(slots);
        self.block_mut().last_op_returned = false;
    }

    /// Marks that the method cannot fall past this point — but only for
    /// returns written at the method's own level; a return inside a
    /// branch still leaves a fall-through path.
    fn write_return_marker(&mut self) {
        if self.blocks.len() - 1 == self.scope_index() {
            self.scope_mut().last_op_returned = true;
        }
    }

    /// Writes a placeholder jump operand, returning its patch record.
    fn write_patch_slot(&mut self, opcode_pos: usize) -> Patch {
        let slot = self.code.len();
        self.code.push(0);
        (slot, opcode_pos)
    }

    fn patch_to_here(&mut self, patch: Patch) {
        let (slot, opcode_pos) = patch;
        let target = self.code.len();
        let offset = i64::try_from(target).expect("code len") - opcode_pos as i64;
        self.code[slot] = (offset as i16) as u16;
    }

    fn write_jump_to(&mut self, target: usize) {
        let opcode_pos = self.code.len();
        let offset = target as i64 - opcode_pos as i64;
        self.write(&[Opcode::Jump as u16, (offset as i16) as u16]);
    }

    /// Emits a forward jump whose patch belongs to `block_index`'s
    /// segment, shuffling inner segments so each stays contiguous.
    fn write_jump_patched_into(&mut self, block_index: usize) {
        let opcode_pos = self.code.len();
        self.code.push(Opcode::Jump as u16);
        let patch = self.write_patch_slot(opcode_pos);
        let insert_at = self
            .blocks
            .get(block_index + 1)
            .map_or(self.patches.len(), |b| b.patch_start);
        self.patches.insert(insert_at, patch);
        for block in &mut self.blocks[block_index + 1..] {
            block.patch_start += 1;
        }
    }

    fn write_jump_patched_here(&mut self) {
        let index = self.blocks.len() - 1;
        self.write_jump_patched_into(index);
    }

    /// Emits `jump_if` on `reg` with the given truthiness selector,
    /// leaving the target to be patched.
    fn write_jump_if_patch(&mut self, jump_on_true: bool, reg: u16) -> Patch {
        let opcode_pos = self.code.len();
        self.write(&[
            Opcode::JumpIf as u16,
            u16::from(jump_on_true),
            reg,
        ]);
        self.write_patch_slot(opcode_pos)
    }

    // -- expression evaluation --------------------------------------------

    /// Evaluates the pool's expression tree and resets the pool. Returns
    /// `None` for expressions with no value (calls of void methods).
    pub fn eval_expression(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
        expect: Option<SigId>,
    ) -> ParseResult<Option<ExprResult>> {
        let root = pool.root().ok_or_else(|| self.raise("Expected a value."))?;
        self.expr_num += 1;
        let result = self.eval_tree(pool, symtab, root, expect)?;
        pool.reset();
        Ok(result)
    }

    /// Evaluates a condition: Boolean, or Integer for the C-style forms.
    fn eval_condition(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
    ) -> ParseResult<ExprResult> {
        let result = self
            .eval_expression(pool, symtab, None)?
            .ok_or_else(|| self.raise("Conditions must have a value."))?;
        let class = symtab.sigs.get(result.0).class;
        if class != CLS_BOOLEAN && class != CLS_INTEGER {
            return Err(self.raise(format!(
                "Condition must be Boolean or Integer, not {}.",
                symtab.sig_name(result.0)
            )));
        }
        Ok(result)
    }

    fn eval_tree(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
        expect: Option<SigId>,
    ) -> ParseResult<Option<ExprResult>> {
        self.line = pool.get(ast).line;
        match &pool.get(ast).kind {
            TreeKind::Readonly { literal } => {
                let literal = *literal;
                let sig = symtab.literal(literal).sig;
                let line = pool.get(ast).line;
                let storage = self.get_storage(symtab, sig);
                self.write(&[Opcode::GetReadonly as u16, literal, storage, line]);
                Ok(Some((sig, storage)))
            }
            TreeKind::LocalVar { var } => {
                let var = symtab.var(*var);
                match var.kind {
                    VarKind::Local(reg) | VarKind::Global(reg) => Ok(Some((var.sig, reg))),
                    VarKind::Readonly(_) => unreachable!("readonly vars parse as DefinedFunc"),
                }
            }
            TreeKind::GlobalVar { var } => {
                let (sig, global_reg) = {
                    let var = symtab.var(*var);
                    let VarKind::Global(reg) = var.kind else {
                        unreachable!("GlobalVar tree over non-global var");
                    };
                    (var.sig, reg)
                };
                let line = pool.get(ast).line;
                let storage = self.get_storage(symtab, sig);
                self.write(&[Opcode::GetGlobal as u16, global_reg, storage, line]);
                Ok(Some((sig, storage)))
            }
            TreeKind::Upvalue { var } => {
                let spot = self.close_over_var(symtab, *var)?;
                let sig = symtab.var(*var).sig;
                let line = pool.get(ast).line;
                let storage = self.get_storage(symtab, sig);
                self.write(&[Opcode::ClosureGet as u16, spot, storage, line]);
                Ok(Some((sig, storage)))
            }
            TreeKind::DefinedFunc { func, .. } => {
                let func = *func;
                Ok(Some(self.load_function_value(symtab, func, pool.get(ast).line)))
            }
            TreeKind::Lambda { func } => {
                let func = *func;
                Ok(Some(self.load_function_value(symtab, func, pool.get(ast).line)))
            }
            TreeKind::VariantCtor { class, variant } => {
                let (class, variant) = (*class, *variant);
                let line = pool.get(ast).line;
                let arg_count = symtab.class(class).variants[variant as usize].arg_sigs.len();
                if arg_count != 0 {
                    return Err(self.raise(format!(
                        "Variant {} takes arguments.",
                        symtab.class(class).variant_name(variant)
                    )));
                }
                let sig = symtab.sig_for_class(class);
                let storage = self.get_storage(symtab, sig);
                self.write(&[
                    Opcode::BuildVariant as u16,
                    class.0,
                    variant,
                    0,
                    storage,
                    line,
                ]);
                Ok(Some((sig, storage)))
            }
            TreeKind::Parenth => {
                let inner = pool.get(ast).args[0];
                self.eval_tree(pool, symtab, inner, expect)
            }
            TreeKind::Unary => self.eval_unary(pool, symtab, ast),
            TreeKind::Binary => self.eval_binary(pool, symtab, ast),
            TreeKind::ListTree => self.eval_build_list(pool, symtab, ast, expect),
            TreeKind::HashTree => self.eval_build_hash(pool, symtab, ast, expect),
            TreeKind::TupleTree => self.eval_build_tuple(pool, symtab, ast),
            TreeKind::Subscript => self.eval_subscript(pool, symtab, ast).map(Some),
            TreeKind::Call => self.eval_call(pool, symtab, ast),
            TreeKind::Typecast => self.eval_typecast(pool, symtab, ast).map(Some),
            TreeKind::OoAccess { .. } => self.eval_oo_access(pool, symtab, ast).map(Some),
            TreeKind::PackageRef { .. } => {
                Err(self.raise("Packages cannot be used as values."))
            }
            TreeKind::SigTree { .. } => unreachable!("sig trees are typecast internals"),
        }
    }

    /// Loads a method value, binding the current cells when the method
    /// captures.
    fn load_function_value(&mut self, symtab: &mut Symtab, func: FunctionId, line: u16) -> ExprResult {
        let sig = symtab.function(func).sig;
        let storage = self.get_storage(symtab, sig);
        let op = if self.closure_functions.contains(&func) {
            // Loading a capturing method requires this frame's cells. A
            // capture origin creates its own; everything else inherits.
            if self.scope().flags & BLOCK_CLOSURE_ORIGIN == 0 {
                self.scope_mut().flags |= BLOCK_USES_CLOSURE;
            }
            Opcode::LoadClosure
        } else {
            Opcode::LoadFunction
        };
        self.write(&[op as u16, func.0, storage, line]);
        (sig, storage)
    }

    /// Assigns a closure spot to an outer-method local on first capture.
    fn close_over_var(&mut self, symtab: &mut Symtab, var_id: VarId) -> ParseResult<u16> {
        self.scope_mut().flags |= BLOCK_USES_CLOSURE;
        let var = symtab.var(var_id);
        if var.closure_spot != u16::MAX {
            return Ok(var.closure_spot);
        }
        let VarKind::Local(reg) = var.kind else {
            return Err(self.raise(format!("Cannot close over {}.", var.name)));
        };
        let depth = var.depth;
        if self
            .blocks
            .iter()
            .any(|b| b.kind == BlockKind::ClassInit && b.depth == depth)
        {
            // Methods outlive the constructor's register window.
            return Err(self.raise(format!(
                "Cannot close over constructor local {} from a class method.",
                var.name
            )));
        }
        let spot = u16::try_from(self.closure_spots.len()).expect("closure spots exceed u16");
        self.closure_spots.push((reg, depth));
        symtab.var_mut(var_id).closure_spot = spot;
        // The owning method becomes (at least) a capture origin.
        if let Some(owner) = self
            .blocks
            .iter_mut()
            .rfind(|b| b.kind.is_scope() && b.depth == depth)
        {
            owner.flags |= BLOCK_CLOSURE_ORIGIN;
        }
        Ok(spot)
    }

    fn eval_to_value(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
        expect: Option<SigId>,
    ) -> ParseResult<ExprResult> {
        self.eval_tree(pool, symtab, ast, expect)?
            .ok_or_else(|| self.raise("Expected a value, but the expression has none."))
    }

    fn eval_unary(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<Option<ExprResult>> {
        let node = pool.get(ast);
        let op = node.op.expect("unary tree has an op");
        let line = node.line;
        let operand = node.left.ok_or_else(|| self.raise("Expected a value."))?;
        let (sig, reg) = self.eval_to_value(pool, symtab, operand, None)?;
        let class = symtab.sigs.get(sig).class;
        let (opcode, result_sig) = match op {
            ExprOp::UnaryNot if class == CLS_BOOLEAN => (Opcode::UnaryNot, sig),
            ExprOp::UnaryMinus if class == CLS_INTEGER || class == CLS_DOUBLE => {
                (Opcode::UnaryMinus, sig)
            }
            _ => {
                return Err(self.raise(format!(
                    "Invalid operation: {}{}.",
                    op.name(),
                    symtab.sig_name(sig)
                )));
            }
        };
        let storage = self.get_storage(symtab, result_sig);
        self.write(&[opcode as u16, reg, storage, line]);
        Ok(Some((result_sig, storage)))
    }

    /// The `[op][lhs][rhs]` dispatch for binary operators. Equality and
    /// inequality are additionally allowed between any two values of the
    /// same signature, handled by the caller.
    fn binary_opcode(
        op: ExprOp,
        lhs: ClassId,
        rhs: ClassId,
    ) -> Option<(Opcode, ClassId)> {
        use Opcode as O;
        let both_int = lhs == CLS_INTEGER && rhs == CLS_INTEGER;
        let numeric = (lhs == CLS_INTEGER || lhs == CLS_DOUBLE)
            && (rhs == CLS_INTEGER || rhs == CLS_DOUBLE);
        let both_str = lhs == CLS_STRING && rhs == CLS_STRING;
        match op {
            ExprOp::Plus if both_int => Some((O::IntegerAdd, CLS_INTEGER)),
            ExprOp::Minus if both_int => Some((O::IntegerMinus, CLS_INTEGER)),
            ExprOp::Multiply if both_int => Some((O::IntegerMul, CLS_INTEGER)),
            ExprOp::Divide if both_int => Some((O::IntegerDiv, CLS_INTEGER)),
            ExprOp::Plus if both_str => Some((O::StringConcat, CLS_STRING)),
            ExprOp::Plus if numeric => Some((O::DoubleAdd, CLS_DOUBLE)),
            ExprOp::Minus if numeric => Some((O::DoubleMinus, CLS_DOUBLE)),
            ExprOp::Multiply if numeric => Some((O::DoubleMul, CLS_DOUBLE)),
            ExprOp::Divide if numeric => Some((O::DoubleDiv, CLS_DOUBLE)),
            ExprOp::Modulo if both_int => Some((O::Modulo, CLS_INTEGER)),
            ExprOp::LeftShift if both_int => Some((O::LeftShift, CLS_INTEGER)),
            ExprOp::RightShift if both_int => Some((O::RightShift, CLS_INTEGER)),
            ExprOp::BitAnd if both_int => Some((O::BitwiseAnd, CLS_INTEGER)),
            ExprOp::BitOr if both_int => Some((O::BitwiseOr, CLS_INTEGER)),
            ExprOp::BitXor if both_int => Some((O::BitwiseXor, CLS_INTEGER)),
            ExprOp::Lt if numeric || both_str => Some((O::Less, CLS_BOOLEAN)),
            ExprOp::LtEq if numeric || both_str => Some((O::LessEq, CLS_BOOLEAN)),
            ExprOp::Gt if numeric || both_str => Some((O::Greater, CLS_BOOLEAN)),
            ExprOp::GtEq if numeric || both_str => Some((O::GreaterEq, CLS_BOOLEAN)),
            ExprOp::EqEq if numeric => Some((O::IsEqual, CLS_BOOLEAN)),
            ExprOp::NotEq if numeric => Some((O::NotEq, CLS_BOOLEAN)),
            _ => None,
        }
    }

    fn eval_binary(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<Option<ExprResult>> {
        let op = pool.get(ast).op.expect("binary tree has an op");
        if op.is_assign_family() {
            return self.eval_assign(pool, symtab, ast).map(Some);
        }
        if op == ExprOp::LogicalAnd || op == ExprOp::LogicalOr {
            return self.eval_andor(pool, symtab, ast).map(Some);
        }

        let node = pool.get(ast);
        let line = node.line;
        let left = node.left.ok_or_else(|| self.raise("Expected a value."))?;
        let right = node.right.ok_or_else(|| self.raise("Expected a value."))?;
        let (lhs_sig, lhs_reg) = self.eval_to_value(pool, symtab, left, None)?;
        let (rhs_sig, rhs_reg) = self.eval_to_value(pool, symtab, right, None)?;
        self.emit_binary_op(symtab, op, (lhs_sig, lhs_reg), (rhs_sig, rhs_reg), line)
            .map(Some)
    }

    fn emit_binary_op(
        &mut self,
        symtab: &mut Symtab,
        op: ExprOp,
        lhs: ExprResult,
        rhs: ExprResult,
        line: u16,
    ) -> ParseResult<ExprResult> {
        let lhs_class = symtab.sigs.get(lhs.0).class;
        let rhs_class = symtab.sigs.get(rhs.0).class;

        let (opcode, result_class) = match Self::binary_opcode(op, lhs_class, rhs_class) {
            Some(hit) => hit,
            None if (op == ExprOp::EqEq || op == ExprOp::NotEq) && lhs.0 == rhs.0 => {
                // Same interned signature: structural equality.
                let opcode = if op == ExprOp::EqEq {
                    Opcode::IsEqual
                } else {
                    Opcode::NotEq
                };
                (opcode, CLS_BOOLEAN)
            }
            None => {
                return Err(self.raise_two_types(
                    symtab,
                    "Invalid operation: ",
                    lhs.0,
                    &format!(" {} ", op.name()),
                    rhs.0,
                    ".",
                ));
            }
        };

        let result_sig = symtab.sig_for_class(result_class);
        let storage = self.get_storage(symtab, result_sig);
        self.write(&[opcode as u16, lhs.1, rhs.1, storage, line]);
        Ok((result_sig, storage))
    }

    /// Short-circuit `&&` / `||`: branch past the right side, then load
    /// the Boolean the path decided on.
    fn eval_andor(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<ExprResult> {
        let node = pool.get(ast);
        let op = node.op.expect("andor tree has an op");
        let line = node.line;
        let is_and = op == ExprOp::LogicalAnd;
        let left = node.left.ok_or_else(|| self.raise("Expected a value."))?;
        let right = node.right.ok_or_else(|| self.raise("Expected a value."))?;

        let bool_sig = symtab.sig_for_class(CLS_BOOLEAN);
        let result = self.get_storage(symtab, bool_sig);
        let true_lit = symtab.new_literal(LitValue::Boolean(true));
        let false_lit = symtab.new_literal(LitValue::Boolean(false));

        let check = |emit: &mut Self, symtab: &mut Symtab, sig: SigId| -> ParseResult<()> {
            if symtab.sigs.get(sig).class != CLS_BOOLEAN {
                return Err(emit.raise(format!(
                    "{} expects Boolean values, not {}.",
                    op.name(),
                    symtab.sig_name(sig)
                )));
            }
            Ok(())
        };

        // On && a false left short-circuits; on || a true left does. The
        // andor block collects the jump past the short-circuit load.
        self.push_block(symtab, BlockKind::AndOr);
        let (lhs_sig, lhs_reg) = self.eval_to_value(pool, symtab, left, None)?;
        check(self, symtab, lhs_sig)?;
        let short_1 = self.write_jump_if_patch(!is_and, lhs_reg);
        let (rhs_sig, rhs_reg) = self.eval_to_value(pool, symtab, right, None)?;
        check(self, symtab, rhs_sig)?;
        let short_2 = self.write_jump_if_patch(!is_and, rhs_reg);

        let (through_lit, short_lit) = if is_and {
            (true_lit, false_lit)
        } else {
            (false_lit, true_lit)
        };
        self.write(&[Opcode::GetReadonly as u16, through_lit, result, line]);
        self.write_jump_patched_here();
        self.patch_to_here(short_1);
        self.patch_to_here(short_2);
        self.write(&[Opcode::GetReadonly as u16, short_lit, result, line]);
        self.leave_block(symtab)?;

        Ok((bool_sig, result))
    }

    /// Where an assignment target lives.
    fn eval_assign(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<ExprResult> {
        let node = pool.get(ast);
        let op = node.op.expect("assign tree has an op");
        let line = node.line;
        let left = node
            .left
            .ok_or_else(|| self.raise("Left side of assignment is missing."))?;
        let right = node
            .right
            .ok_or_else(|| self.raise("Right side of assignment is missing."))?;
        let compound = op.compound_base();

        match pool.get(left).kind.clone() {
            TreeKind::LocalVar { var } => {
                let (sig, target_kind) = {
                    let v = symtab.var(var);
                    (v.sig, v.kind)
                };
                let (VarKind::Local(target) | VarKind::Global(target)) = target_kind else {
                    return Err(self.raise("Cannot assign to a method."));
                };
                let value = self.eval_assign_value(
                    pool, symtab, right, sig, compound, Some((sig, target)), line,
                )?;
                self.write_assign(symtab, sig, target, value, line);
                Ok((sig, target))
            }
            TreeKind::GlobalVar { var } => {
                let (sig, global_reg) = {
                    let v = symtab.var(var);
                    let VarKind::Global(reg) = v.kind else {
                        return Err(self.raise("Cannot assign to a method."));
                    };
                    (v.sig, reg)
                };
                let current = if compound.is_some() {
                    let storage = self.get_storage(symtab, sig);
                    self.write(&[Opcode::GetGlobal as u16, global_reg, storage, line]);
                    Some((sig, storage))
                } else {
                    None
                };
                let value = self.eval_assign_value(pool, symtab, right, sig, compound, current, line)?;
                self.write(&[Opcode::SetGlobal as u16, global_reg, value.1, line]);
                Ok(value)
            }
            TreeKind::Upvalue { var } => {
                let sig = symtab.var(var).sig;
                let spot = self.close_over_var(symtab, var)?;
                let current = if compound.is_some() {
                    let storage = self.get_storage(symtab, sig);
                    self.write(&[Opcode::ClosureGet as u16, spot, storage, line]);
                    Some((sig, storage))
                } else {
                    None
                };
                let value = self.eval_assign_value(pool, symtab, right, sig, compound, current, line)?;
                self.write(&[Opcode::ClosureSet as u16, spot, value.1, line]);
                Ok(value)
            }
            TreeKind::Subscript => {
                let sub = pool.get(left);
                let container_ast = sub.args[0];
                let index_ast = sub.args[1];
                let container = self.eval_to_value(pool, symtab, container_ast, None)?;
                let index = self.eval_to_value(pool, symtab, index_ast, None)?;
                let elem_sig = self.subscript_result_sig(pool, symtab, container.0, index, index_ast)?;
                let current = if compound.is_some() {
                    let storage = self.get_storage(symtab, elem_sig);
                    self.write(&[
                        Opcode::GetItem as u16,
                        container.1,
                        index.1,
                        storage,
                        line,
                    ]);
                    Some((elem_sig, storage))
                } else {
                    None
                };
                let value =
                    self.eval_assign_value(pool, symtab, right, elem_sig, compound, current, line)?;
                self.write(&[
                    Opcode::SetItem as u16,
                    container.1,
                    index.1,
                    value.1,
                    line,
                ]);
                Ok(value)
            }
            TreeKind::OoAccess { name } => {
                if let Some(access) = self.package_access(pool, symtab, left)? {
                    let PackageAccess::Var {
                        package,
                        sub,
                        var,
                        sig,
                    } = access
                    else {
                        return Err(self.raise("Cannot assign to a package function."));
                    };
                    let current = if compound.is_some() {
                        Some(self.emit_package_get(symtab, access, line))
                    } else {
                        None
                    };
                    let value =
                        self.eval_assign_value(pool, symtab, right, sig, compound, current, line)?;
                    match sub {
                        None => {
                            self.write(&[Opcode::PackageSet as u16, package, var, value.1, line]);
                        }
                        Some(sub) => {
                            self.write(&[
                                Opcode::PackageSetDeep as u16,
                                package,
                                sub,
                                var,
                                value.1,
                                line,
                            ]);
                        }
                    }
                    return Ok(value);
                }
                let object_ast = pool.get(left).args[0];
                let object = self.eval_to_value(pool, symtab, object_ast, None)?;
                let class = symtab.sigs.get(object.0).class;
                let (prop_index, prop_sig) = self.find_property(symtab, class, &name)?;
                let current = if compound.is_some() {
                    let storage = self.get_storage(symtab, prop_sig);
                    self.write(&[
                        Opcode::GetProperty as u16,
                        prop_index,
                        object.1,
                        storage,
                        line,
                    ]);
                    Some((prop_sig, storage))
                } else {
                    None
                };
                let value =
                    self.eval_assign_value(pool, symtab, right, prop_sig, compound, current, line)?;
                self.write(&[
                    Opcode::SetProperty as u16,
                    prop_index,
                    object.1,
                    value.1,
                    line,
                ]);
                Ok(value)
            }
            other => Err(self.raise(format!(
                "Left side of assignment is not assignable ({other:?})."
            ))),
        }
    }

    /// Evaluates the right side of an assignment, expanding compound ops
    /// against the current value and coercing to the target signature.
    #[allow(clippy::too_many_arguments)]
    fn eval_assign_value(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        right: AstId,
        target_sig: SigId,
        compound: Option<ExprOp>,
        current: Option<ExprResult>,
        line: u16,
    ) -> ParseResult<ExprResult> {
        let rhs = self.eval_to_value(pool, symtab, right, Some(target_sig))?;
        let value = match compound {
            Some(base_op) => {
                let current = current.expect("compound assignment reads current value");
                self.emit_binary_op(symtab, base_op, current, rhs, line)?
            }
            None => rhs,
        };
        self.type_matchup(symtab, target_sig, value, line)
    }

    /// Plain/ref/any assignment into a local register.
    fn write_assign(
        &mut self,
        symtab: &mut Symtab,
        sig: SigId,
        target: u16,
        value: ExprResult,
        line: u16,
    ) {
        let class = symtab.sigs.get(sig).class;
        let opcode = if class == CLS_ANY {
            // The matchup already wrapped the value; the any-assign keeps
            // the tag refreshed for raw any-to-any copies.
            Opcode::AnyAssign
        } else if symtab.class(class).is_refcounted {
            Opcode::RefAssign
        } else {
            Opcode::Assign
        };
        self.write(&[opcode as u16, value.1, target, line]);
    }

    fn find_property(
        &self,
        symtab: &Symtab,
        class: ClassId,
        name: &str,
    ) -> ParseResult<(u16, SigId)> {
        match symtab.find_member(class, name) {
            Some(ClassMember::Property(index)) => {
                let def = &symtab.class(class).props[index as usize];
                if def.visibility == Visibility::Private && self.scope().self_class != Some(class) {
                    return Err(self.raise(format!(
                        "{}.{} is private.",
                        symtab.class(class).name,
                        name
                    )));
                }
                if def.visibility == Visibility::Protected {
                    let ok = self
                        .scope()
                        .self_class
                        .is_some_and(|own| symtab.class_matches(own, class));
                    if !ok {
                        return Err(self.raise(format!(
                            "{}.{} is protected.",
                            symtab.class(class).name,
                            name
                        )));
                    }
                }
                Ok((index, def.sig))
            }
            Some(_) => Err(self.raise(format!(
                "{}.{} is not a property.",
                symtab.class(class).name,
                name
            ))),
            None => Err(self.raise(format!(
                "Class {} has no member named {}.",
                symtab.class(class).name,
                name
            ))),
        }
    }

    // -- containers --------------------------------------------------------

    fn eval_build_list(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
        expect: Option<SigId>,
    ) -> ParseResult<Option<ExprResult>> {
        let node = pool.get(ast);
        let line = node.line;
        let args = node.args.clone();

        // An expected List[T] supplies T; an expected Any accepts a
        // List[Any] which the matchup then wraps.
        let expected_elem = match expect.map(|sig| symtab.sigs.get(sig).clone()) {
            Some(s) if s.class == CLS_LIST => Some(s.subsigs[0]),
            Some(s) if s.class == CLS_ANY => Some(symtab.sig_for_class(CLS_ANY)),
            _ => None,
        };

        if args.is_empty() {
            let elem = expected_elem
                .ok_or_else(|| self.raise("Cannot infer the type of an empty list."))?;
            let list_sig = symtab.list_sig(elem);
            let storage = self.get_storage(symtab, list_sig);
            let pos = self.code.len();
            self.write(&[Opcode::BuildList as u16, 0, storage, line]);
            self.last_build = Some((pos, storage));
            return Ok(Some((list_sig, storage)));
        }

        let mut elem_sig: Option<SigId> = expected_elem;
        let mut regs = Vec::with_capacity(args.len());
        for &arg in &args {
            let value = self.eval_to_value(pool, symtab, arg, elem_sig)?;
            let value = match elem_sig {
                Some(want) => self.type_matchup(symtab, want, value, line)?,
                None => {
                    elem_sig = Some(value.0);
                    value
                }
            };
            regs.push(value.1);
        }
        let elem = elem_sig.expect("list has at least one element");
        let list_sig = symtab.list_sig(elem);
        let storage = self.get_storage(symtab, list_sig);
        let pos = self.code.len();
        let mut slots = vec![
            Opcode::BuildList as u16,
            u16::try_from(regs.len()).expect("list argument count exceeds u16"),
        ];
        slots.extend_from_slice(&regs);
        slots.push(storage);
        slots.push(line);
        self.write(&slots);
        self.last_build = Some((pos, storage));
        Ok(Some((list_sig, storage)))
    }

    fn eval_build_hash(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
        expect: Option<SigId>,
    ) -> ParseResult<Option<ExprResult>> {
        let node = pool.get(ast);
        let line = node.line;
        let args = node.args.clone();
        if args.len() % 2 != 0 {
            return Err(self.raise("Hash literals need a value for every key."));
        }

        let (mut key_sig, mut value_sig) = match expect.map(|sig| symtab.sigs.get(sig).clone()) {
            Some(s) if s.class == CLS_HASH => (Some(s.subsigs[0]), Some(s.subsigs[1])),
            _ => (None, None),
        };
        if args.is_empty() && key_sig.is_none() {
            return Err(self.raise("Cannot infer the type of an empty hash."));
        }

        let mut regs = Vec::with_capacity(args.len());
        for pair in args.chunks(2) {
            let key = self.eval_to_value(pool, symtab, pair[0], key_sig)?;
            let key = match key_sig {
                Some(want) if want != key.0 => {
                    return Err(self.raise(format!(
                        "Hash keys must all be type '{}', but got type '{}'.",
                        symtab.sig_name(want),
                        symtab.sig_name(key.0)
                    )));
                }
                Some(_) => key,
                None => {
                    let class = symtab.sigs.get(key.0).class;
                    if class != CLS_INTEGER && class != CLS_STRING {
                        return Err(self.raise(format!(
                            "Hash keys must be Integer or String, not {}.",
                            symtab.sig_name(key.0)
                        )));
                    }
                    key_sig = Some(key.0);
                    key
                }
            };
            let value = self.eval_to_value(pool, symtab, pair[1], value_sig)?;
            let value = match value_sig {
                Some(want) => self.type_matchup(symtab, want, value, line)?,
                None => {
                    value_sig = Some(value.0);
                    value
                }
            };
            regs.push(key.1);
            regs.push(value.1);
        }

        let key = key_sig.expect("hash key sig inferred or given");
        let value = value_sig.expect("hash value sig inferred or given");
        let hash_sig = symtab.hash_sig(key, value);
        let storage = self.get_storage(symtab, hash_sig);
        let pos = self.code.len();
        let mut slots = vec![
            Opcode::BuildHash as u16,
            u16::try_from(regs.len()).expect("hash argument count exceeds u16"),
        ];
        slots.extend_from_slice(&regs);
        slots.push(storage);
        slots.push(line);
        self.write(&slots);
        self.last_build = Some((pos, storage));
        Ok(Some((hash_sig, storage)))
    }

    fn eval_build_tuple(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<Option<ExprResult>> {
        let node = pool.get(ast);
        let line = node.line;
        let args = node.args.clone();
        if args.is_empty() {
            return Err(self.raise("Tuples cannot be empty."));
        }
        let mut member_sigs = Vec::with_capacity(args.len());
        let mut regs = Vec::with_capacity(args.len());
        for &arg in &args {
            let value = self.eval_to_value(pool, symtab, arg, None)?;
            member_sigs.push(value.0);
            regs.push(value.1);
        }
        let tuple_sig = symtab.ensure_unique_sig(CLS_TUPLE, &member_sigs, 0);
        let storage = self.get_storage(symtab, tuple_sig);
        let mut slots = vec![
            Opcode::BuildTuple as u16,
            u16::try_from(regs.len()).expect("tuple argument count exceeds u16"),
        ];
        slots.extend_from_slice(&regs);
        slots.push(storage);
        slots.push(line);
        self.write(&slots);
        Ok(Some((tuple_sig, storage)))
    }

    /// The element signature a subscript read/write works with, enforcing
    /// index typing per container.
    fn subscript_result_sig(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        container_sig: SigId,
        index: ExprResult,
        index_ast: AstId,
    ) -> ParseResult<SigId> {
        let container = symtab.sigs.get(container_sig).clone();
        let index_class = symtab.sigs.get(index.0).class;
        match container.class {
            CLS_LIST => {
                if index_class != CLS_INTEGER {
                    return Err(self.raise(format!(
                        "list expects an index of type 'Integer', but got type '{}'.",
                        symtab.sig_name(index.0)
                    )));
                }
                Ok(container.subsigs[0])
            }
            CLS_HASH => {
                let key_sig = container.subsigs[0];
                if key_sig != index.0 {
                    return Err(self.raise_two_types(
                        symtab,
                        "hash expects an index of type '",
                        key_sig,
                        "', but got type '",
                        index.0,
                        "'.",
                    ));
                }
                Ok(container.subsigs[1])
            }
            CLS_TUPLE => {
                // Tuple members have distinct types, so the index must be
                // a literal the emitter can resolve.
                let TreeKind::Readonly { literal } = pool.get(index_ast).kind else {
                    return Err(self.raise("Tuple subscripts must be integer literals."));
                };
                let LitValue::Integer(value) = symtab.literal(literal).value else {
                    return Err(self.raise("Tuple subscripts must be integer literals."));
                };
                let count = container.subsigs.len();
                if value < 0 || value as usize >= count {
                    return Err(self.raise(format!(
                        "Tuple subscript {value} is out of range (tuple has {count} members)."
                    )));
                }
                Ok(container.subsigs[value as usize])
            }
            _ => Err(self.raise(format!(
                "Cannot subscript type {}.",
                symtab.sig_name(container_sig)
            ))),
        }
    }

    fn eval_subscript(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<ExprResult> {
        let node = pool.get(ast);
        let line = node.line;
        let container_ast = node.args[0];
        let index_ast = node.args[1];
        let container = self.eval_to_value(pool, symtab, container_ast, None)?;
        let index = self.eval_to_value(pool, symtab, index_ast, None)?;
        let elem_sig = self.subscript_result_sig(pool, symtab, container.0, index, index_ast)?;
        let storage = self.get_storage(symtab, elem_sig);
        self.write(&[Opcode::GetItem as u16, container.1, index.1, storage, line]);
        Ok((elem_sig, storage))
    }

    // -- calls -------------------------------------------------------------

    fn eval_call(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<Option<ExprResult>> {
        let node = pool.get(ast);
        let line = node.line;
        let args = node.args.clone();
        let target_ast = args[0];
        let arg_asts = &args[1..];

        // Resolve the call target without forcing it into a register when
        // it is directly callable.
        enum Target {
            Readonly(FunctionId),
            Register(ExprResult),
            Variant(ClassId, u16),
            Method(FunctionId, ExprResult),
        }

        let target = match pool.get(target_ast).kind.clone() {
            TreeKind::DefinedFunc { func, .. } => {
                if self.closure_functions.contains(&func) {
                    // A capturing method must be called through its bound
                    // closure value.
                    Target::Register(self.load_function_value(symtab, func, line))
                } else {
                    Target::Readonly(func)
                }
            }
            TreeKind::Lambda { func } => {
                Target::Register(self.load_function_value(symtab, func, line))
            }
            TreeKind::VariantCtor { class, variant } => Target::Variant(class, variant),
            TreeKind::OoAccess { name } => {
                if let Some(access) = self.package_access(pool, symtab, target_ast)? {
                    match access {
                        PackageAccess::Func(func) => {
                            let sig = symtab.function(func).sig;
                            return self.emit_call(
                                pool,
                                symtab,
                                sig,
                                CallTarget::Readonly(func),
                                None,
                                arg_asts,
                                line,
                            );
                        }
                        PackageAccess::Var { sig, .. } => {
                            if symtab.sigs.get(sig).class != CLS_FUNCTION {
                                return Err(self.raise(format!(
                                    "Cannot call a value of type {}.",
                                    symtab.sig_name(sig)
                                )));
                            }
                            let value = self.emit_package_get(symtab, access, line);
                            return self.emit_call(
                                pool,
                                symtab,
                                value.0,
                                CallTarget::Register(value.1),
                                None,
                                arg_asts,
                                line,
                            );
                        }
                    }
                }
                let object_ast = pool.get(target_ast).args[0];
                let object = self.eval_to_value(pool, symtab, object_ast, None)?;
                let class = symtab.sigs.get(object.0).class;
                match symtab.find_member(class, &name) {
                    Some(ClassMember::Method(func)) => Target::Method(func, object),
                    Some(ClassMember::Variant(variant)) => Target::Variant(class, variant),
                    Some(ClassMember::Property(_)) => {
                        // A property holding a Function value.
                        let value = self.eval_oo_access(pool, symtab, target_ast)?;
                        Target::Register(value)
                    }
                    None => {
                        return Err(self.raise(format!(
                            "Class {} has no member named {}.",
                            symtab.class(class).name,
                            name
                        )));
                    }
                }
            }
            _ => {
                let value = self.eval_to_value(pool, symtab, target_ast, None)?;
                Target::Register(value)
            }
        };

        match target {
            Target::Variant(class, variant) => {
                self.eval_build_variant(pool, symtab, class, variant, arg_asts, line)
            }
            Target::Readonly(func) => {
                let sig = symtab.function(func).sig;
                let result =
                    self.emit_call(pool, symtab, sig, CallTarget::Readonly(func), None, arg_asts, line)?;
                Ok(result)
            }
            Target::Method(func, object) => {
                let sig = symtab.function(func).sig;
                let target = if self.closure_functions.contains(&func) {
                    CallTarget::Register(self.load_function_value(symtab, func, line).1)
                } else {
                    CallTarget::Readonly(func)
                };
                let result = self.emit_call(pool, symtab, sig, target, Some(object), arg_asts, line)?;
                Ok(result)
            }
            Target::Register(value) => {
                if symtab.sigs.get(value.0).class != CLS_FUNCTION {
                    return Err(self.raise(format!(
                        "Cannot call a value of type {}.",
                        symtab.sig_name(value.0)
                    )));
                }
                let result = self.emit_call(
                    pool,
                    symtab,
                    value.0,
                    CallTarget::Register(value.1),
                    None,
                    arg_asts,
                    line,
                )?;
                Ok(result)
            }
        }
    }

    fn eval_build_variant(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        class: ClassId,
        variant: u16,
        arg_asts: &[AstId],
        line: u16,
    ) -> ParseResult<Option<ExprResult>> {
        let arg_sigs = symtab.class(class).variants[variant as usize].arg_sigs.clone();
        if arg_sigs.len() != arg_asts.len() {
            return Err(self.raise(format!(
                "Variant {} takes {} arguments, but got {}.",
                symtab.class(class).variant_name(variant),
                arg_sigs.len(),
                arg_asts.len()
            )));
        }
        let mut regs = Vec::with_capacity(arg_asts.len());
        for (&arg, &want) in arg_asts.iter().zip(&arg_sigs) {
            let value = self.eval_to_value(pool, symtab, arg, Some(want))?;
            let value = self.type_matchup(symtab, want, value, line)?;
            regs.push(value.1);
        }
        let sig = symtab.sig_for_class(class);
        let storage = self.get_storage(symtab, sig);
        let mut slots = vec![
            Opcode::BuildVariant as u16,
            class.0,
            variant,
            u16::try_from(regs.len()).expect("variant argument count exceeds u16"),
        ];
        slots.extend_from_slice(&regs);
        slots.push(storage);
        slots.push(line);
        self.write(&slots);
        Ok(Some((sig, storage)))
    }

    // -- typed call emission ----------------------------------------------

    fn emit_call(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        func_sig: SigId,
        target: CallTarget,
        bound_self: Option<ExprResult>,
        arg_asts: &[AstId],
        line: u16,
    ) -> ParseResult<Option<ExprResult>> {
        let sig = symtab.sigs.get(func_sig).clone();
        let params: Vec<SigId> = sig.func_params().to_vec();
        let ret = sig.func_return();
        let is_varargs = sig.is_varargs();

        let supplied = arg_asts.len() + usize::from(bound_self.is_some());
        let min_args = if is_varargs { params.len() - 1 } else { params.len() };
        let arity_ok = if is_varargs {
            supplied >= min_args
        } else {
            supplied == params.len()
        };
        if !arity_ok {
            return Err(self.raise(format!(
                "Wrong number of arguments to call (expected {}{}, got {}).",
                min_args,
                if is_varargs { "+" } else { "" },
                supplied
            )));
        }

        // Template positions resolve from the first argument binding each
        // position; later arguments must agree.
        let mut template_map: Vec<Option<SigId>> = vec![None; 26];
        let mut arg_regs = Vec::with_capacity(supplied);

        let mut param_iter = params.iter().copied();
        if let Some(self_value) = bound_self {
            let want = param_iter
                .next()
                .ok_or_else(|| self.raise("Method signature is missing its self parameter."))?;
            self.unify_template(symtab, want, self_value.0, &mut template_map);
            let want = self.substitute_templates(symtab, want, &template_map)?;
            let value = self.type_matchup(symtab, want, self_value, line)?;
            arg_regs.push(value.1);
        }

        let mut remaining: Vec<SigId> = param_iter.collect();
        let vararg_elem = if is_varargs {
            let last = remaining.pop().expect("varargs sig has a final parameter");
            // The final parameter is List[T]; surplus args are its elements.
            let last_sig = symtab.sigs.get(last).clone();
            if last_sig.class != CLS_LIST {
                return Err(self.raise("Vararg methods must end with a List parameter."));
            }
            Some(last_sig.subsigs[0])
        } else {
            None
        };

        for (i, &arg) in arg_asts.iter().enumerate() {
            let want = match remaining.get(i) {
                Some(&want) => want,
                None => vararg_elem.expect("arity check guarantees varargs"),
            };
            let value = self.eval_to_value(pool, symtab, arg, Some(want))?;
            self.unify_template(symtab, want, value.0, &mut template_map);
            let want = self.substitute_templates(symtab, want, &template_map)?;
            let value = self.type_matchup(symtab, want, value, line)?;
            arg_regs.push(value.1);
        }

        let ret_resolved = self.substitute_templates(symtab, ret, &template_map)?;
        let ret_class = symtab.sigs.get(ret_resolved).class;
        let result = if ret_class == CLS_UNIT {
            NO_RESULT
        } else {
            self.get_storage(symtab, ret_resolved)
        };

        let (opcode, special) = match target {
            CallTarget::Readonly(func) => (Opcode::CallReadonly, func.0),
            CallTarget::Register(reg) => (Opcode::CallRegister, reg),
        };
        let mut slots = vec![
            opcode as u16,
            special,
            u16::try_from(arg_regs.len()).expect("call argument count exceeds u16"),
        ];
        slots.extend_from_slice(&arg_regs);
        slots.push(result);
        slots.push(line);
        self.write(&slots);

        if result == NO_RESULT {
            Ok(None)
        } else {
            Ok(Some((ret_resolved, result)))
        }
    }

    /// Binds template positions in `want` from the shape of `have`.
    fn unify_template(
        &self,
        symtab: &Symtab,
        want: SigId,
        have: SigId,
        map: &mut [Option<SigId>],
    ) {
        let want_sig = symtab.sigs.get(want).clone();
        if want_sig.class == CLS_TEMPLATE {
            let pos = want_sig.template_pos as usize;
            if map[pos].is_none() {
                map[pos] = Some(have);
            }
            return;
        }
        let have_sig = symtab.sigs.get(have).clone();
        if want_sig.class == have_sig.class {
            for (&w, &h) in want_sig.subsigs.iter().zip(have_sig.subsigs.iter()) {
                self.unify_template(symtab, w, h, map);
            }
        }
    }

    /// Rewrites template positions to their bound signatures.
    fn substitute_templates(
        &self,
        symtab: &mut Symtab,
        sig_id: SigId,
        map: &[Option<SigId>],
    ) -> ParseResult<SigId> {
        let sig = symtab.sigs.get(sig_id).clone();
        if sig.class == CLS_TEMPLATE {
            return map[sig.template_pos as usize]
                .ok_or_else(|| self.raise("Could not resolve a template parameter from the call."));
        }
        if sig.subsigs.is_empty() || !self.contains_template(symtab, sig_id) {
            return Ok(sig_id);
        }
        let mut subsigs = Vec::with_capacity(sig.subsigs.len());
        for &sub in &sig.subsigs {
            subsigs.push(self.substitute_templates(symtab, sub, map)?);
        }
        Ok(symtab.ensure_unique_sig(sig.class, &subsigs, sig.flags))
    }

    fn contains_template(&self, symtab: &Symtab, sig_id: SigId) -> bool {
        let sig = symtab.sigs.get(sig_id);
        sig.class == CLS_TEMPLATE
            || sig
                .subsigs
                .clone()
                .iter()
                .any(|&sub| self.contains_template(symtab, sub))
    }

    /// Checks that `have` satisfies `want`, possibly rewriting the emitted
    /// value: promoting to `Any` with a wrap, or retyping a just-built
    /// list in place.
    fn type_matchup(
        &mut self,
        symtab: &mut Symtab,
        want: SigId,
        have: ExprResult,
        line: u16,
    ) -> ParseResult<ExprResult> {
        if want == have.0 {
            return Ok(have);
        }
        let want_sig = symtab.sigs.get(want).clone();
        let have_sig = symtab.sigs.get(have.0).clone();

        // Promote any value to Any by wrapping it.
        if want_sig.class == CLS_ANY {
            let storage = self.get_storage(symtab, want);
            self.write(&[Opcode::AnyAssign as u16, have.1, storage, line]);
            return Ok((want, storage));
        }

        // A subclass instance satisfies a parent-class signature.
        if want_sig.subsigs.is_empty()
            && have_sig.subsigs.is_empty()
            && symtab.class_matches(have_sig.class, want_sig.class)
        {
            return Ok((want, have.1));
        }

        // A freshly built List[X] can be retyped List[Any] in place; the
        // build wraps its elements at runtime from the result signature.
        if want_sig.class == CLS_LIST
            && have_sig.class == CLS_LIST
            && symtab.sigs.get(want_sig.subsigs[0]).class == CLS_ANY
        {
            if let Some((build_pos, build_reg)) = self.last_build {
                if build_reg == have.1 && self.code.get(build_pos) == Some(&(Opcode::BuildList as u16))
                {
                    let storage = self.get_storage(symtab, want);
                    // The output register slot sits before the line slot.
                    let round_len = 2 + self.code[build_pos + 1] as usize + 2;
                    let out_slot = build_pos + round_len - 2;
                    self.code[out_slot] = storage;
                    self.last_build = Some((build_pos, storage));
                    return Ok((want, storage));
                }
            }
        }

        Err(self.raise_two_types(
            symtab,
            "Cannot assign type '",
            have.0,
            "' to type '",
            want,
            "'.",
        ))
    }

    fn eval_typecast(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<ExprResult> {
        let node = pool.get(ast);
        let line = node.line;
        if node.args.len() != 2 {
            return Err(self.raise("Typecast takes exactly one value."));
        }
        // The cast value was absorbed first; the target sig collected
        // after it. Accept either order.
        let (sig_ast, value_ast) = if matches!(pool.get(node.args[0]).kind, TreeKind::SigTree { .. })
        {
            (node.args[0], node.args[1])
        } else {
            (node.args[1], node.args[0])
        };
        let TreeKind::SigTree { sig: target } = pool.get(sig_ast).kind else {
            return Err(self.raise("Typecast is missing its target type."));
        };
        let value = self.eval_to_value(pool, symtab, value_ast, None)?;
        if value.0 == target {
            return Ok(value);
        }
        let value_class = symtab.sigs.get(value.0).class;
        let target_class = symtab.sigs.get(target).class;
        if value_class == CLS_ANY {
            let storage = self.get_storage(symtab, target);
            self.write(&[Opcode::AnyTypecast as u16, value.1, storage, line]);
            return Ok((target, storage));
        }
        let int_dbl = |a: ClassId, b: ClassId| {
            (a == CLS_INTEGER && b == CLS_DOUBLE) || (a == CLS_DOUBLE && b == CLS_INTEGER)
        };
        if int_dbl(value_class, target_class) {
            let storage = self.get_storage(symtab, target);
            self.write(&[Opcode::IntDblTypecast as u16, value.1, storage, line]);
            return Ok((target, storage));
        }
        Err(self.raise(format!(
            "Cannot cast type '{}' to type '{}'.",
            symtab.sig_name(value.0),
            symtab.sig_name(target)
        )))
    }

    fn eval_oo_access(
        &mut self,
        pool: &AstPool,
        symtab: &mut Symtab,
        ast: AstId,
    ) -> ParseResult<ExprResult> {
        let node = pool.get(ast);
        let line = node.line;
        let TreeKind::OoAccess { name } = node.kind.clone() else {
            unreachable!("eval_oo_access on a non-oo tree");
        };
        if let Some(access) = self.package_access(pool, symtab, ast)? {
            return Ok(self.emit_package_get(symtab, access, line));
        }
        let object_ast = node.args[0];
        let object = self.eval_to_value(pool, symtab, object_ast, None)?;
        let class = symtab.sigs.get(object.0).class;
        let (index, sig) = self.find_property(symtab, class, &name)?;
        let storage = self.get_storage(symtab, sig);
        self.write(&[Opcode::GetProperty as u16, index, object.1, storage, line]);
        Ok((sig, storage))
    }

    // -- packages ----------------------------------------------------------

    /// Resolves `pkg.name` and `pkg.sub.name` chains. Returns `None` when
    /// the object of the access is not a package reference.
    fn package_access(
        &self,
        pool: &AstPool,
        symtab: &Symtab,
        ast: AstId,
    ) -> ParseResult<Option<PackageAccess>> {
        let TreeKind::OoAccess { name } = &pool.get(ast).kind else {
            return Ok(None);
        };
        let object = pool.get(ast).args[0];
        match &pool.get(object).kind {
            TreeKind::PackageRef { package } => {
                let pkg = symtab.package(*package);
                if let Some(index) = pkg.vars.iter().position(|(n, _)| &**n == name) {
                    let sig = pkg.vars[index].1;
                    return Ok(Some(PackageAccess::Var {
                        package: *package,
                        sub: None,
                        var: index as u16,
                        sig,
                    }));
                }
                if let Some(&func) = pkg.funcs.get(name.as_str()) {
                    return Ok(Some(PackageAccess::Func(func)));
                }
                Err(self.raise(format!(
                    "Package {} has no member named {}.",
                    pkg.name, name
                )))
            }
            TreeKind::OoAccess { name: sub_name } => {
                let inner = pool.get(object).args[0];
                let TreeKind::PackageRef { package } = pool.get(inner).kind else {
                    return Ok(None);
                };
                let pkg = symtab.package(package);
                let Some(&(_, sub)) = pkg
                    .sub_packages
                    .iter()
                    .find(|(n, _)| &**n == sub_name)
                else {
                    return Ok(None);
                };
                let sub_pkg = symtab.package(sub);
                if let Some(index) = sub_pkg.vars.iter().position(|(n, _)| &**n == name) {
                    let sig = sub_pkg.vars[index].1;
                    return Ok(Some(PackageAccess::Var {
                        package,
                        sub: Some(sub),
                        var: index as u16,
                        sig,
                    }));
                }
                if let Some(&func) = sub_pkg.funcs.get(name.as_str()) {
                    return Ok(Some(PackageAccess::Func(func)));
                }
                Err(self.raise(format!(
                    "Package {} has no member named {}.",
                    sub_pkg.name, name
                )))
            }
            _ => Ok(None),
        }
    }

    fn emit_package_get(
        &mut self,
        symtab: &mut Symtab,
        access: PackageAccess,
        line: u16,
    ) -> ExprResult {
        match access {
            PackageAccess::Func(func) => self.load_function_value(symtab, func, line),
            PackageAccess::Var {
                package,
                sub: None,
                var,
                sig,
            } => {
                let storage = self.get_storage(symtab, sig);
                self.write(&[Opcode::PackageGet as u16, package, var, storage, line]);
                (sig, storage)
            }
            PackageAccess::Var {
                package,
                sub: Some(sub),
                var,
                sig,
            } => {
                let storage = self.get_storage(symtab, sig);
                self.write(&[
                    Opcode::PackageGetDeep as u16,
                    package,
                    sub,
                    var,
                    storage,
                    line,
                ]);
                (sig, storage)
            }
        }
    }

    // -- classes -----------------------------------------------------------

    /// The `self` of the current method scope.
    fn self_value(&mut self, symtab: &Symtab) -> ParseResult<ExprResult> {
        let var_id = symtab
            .find_var("self")
            .ok_or_else(|| self.raise("self is not available here."))?;
        let var = symtab.var(var_id);
        if var.depth != self.function_depth {
            return Err(self.raise("self is not available in a nested method."));
        }
        let VarKind::Local(reg) = var.kind else {
            return Err(self.raise("self is not available here."));
        };
        Ok((var.sig, reg))
    }

    /// Opens a class: registers the class and enters its body initializer,
    /// which receives `self` plus the constructor parameters.
    pub fn enter_class(
        &mut self,
        symtab: &mut Symtab,
        name: &str,
        params: &[(String, SigId)],
        parent: Option<ClassId>,
        line: u16,
    ) -> ParseResult<ClassId> {
        if symtab.class_by_name(name).is_some() {
            return Err(self.raise(format!("Class {name} is already declared.")));
        }
        if let Some(parent) = parent {
            let parent_class = symtab.class(parent);
            let inheritable = matches!(parent_class.kind, ClassKind::User | ClassKind::Exception);
            if !inheritable || parent_class.init.is_none() {
                return Err(self.raise(format!(
                    "Class {} cannot be inherited from.",
                    parent_class.name
                )));
            }
        }
        let kind = if parent.is_some_and(|p| symtab.is_exception_class(p)) {
            ClassKind::Exception
        } else {
            ClassKind::User
        };
        let class_id = symtab.new_class(name, kind, parent);
        let class_sig = symtab.sig_for_class(class_id);
        let mut init_params = Vec::with_capacity(params.len() + 1);
        init_params.push(("self".to_string(), class_sig));
        init_params.extend_from_slice(params);
        let init = self.enter_define(
            symtab,
            BlockKind::ClassInit,
            name,
            format!("{name}.new"),
            &init_params,
            None,
            false,
            Some(class_id),
            line,
        )?;
        symtab.class_mut(class_id).init = Some(init);
        Ok(class_id)
    }

    /// `< Parent(args)`: chains into the parent's initializer before the
    /// class body runs.
    pub fn emit_init_chain(
        &mut self,
        symtab: &mut Symtab,
        parent: ClassId,
        args: &[ExprResult],
        line: u16,
    ) -> ParseResult<()> {
        let init = symtab
            .class(parent)
            .init
            .ok_or_else(|| self.raise("Parent class has no constructor."))?;
        let params: Vec<SigId> = {
            let sig = symtab.sigs.get(symtab.function(init).sig).clone();
            sig.func_params()[1..].to_vec()
        };
        if params.len() != args.len() {
            return Err(self.raise(format!(
                "Parent constructor takes {} arguments, but got {}.",
                params.len(),
                args.len()
            )));
        }
        let self_value = self.self_value(symtab)?;
        let mut arg_regs = vec![self_value.1];
        for (&want, &have) in params.iter().zip(args) {
            let value = self.type_matchup(symtab, want, have, line)?;
            arg_regs.push(value.1);
        }
        let mut slots = vec![
            Opcode::CallReadonly as u16,
            init.0,
            u16::try_from(arg_regs.len()).expect("argument count exceeds u16"),
        ];
        slots.extend_from_slice(&arg_regs);
        slots.push(NO_RESULT);
        slots.push(line);
        self.write(&slots);
        Ok(())
    }

    /// `var @name = value` inside a class body: declares the property and
    /// initializes it on self.
    pub fn emit_property_decl(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
        name: &str,
        declared_sig: Option<SigId>,
        visibility: Visibility,
        line: u16,
    ) -> ParseResult<()> {
        if self.scope().kind != BlockKind::ClassInit {
            return Err(self.raise("Properties can only be declared in a class body."));
        }
        let class = self.scope().self_class.expect("class body has a class");
        if symtab.find_member(class, name).is_some() {
            return Err(self.raise(format!(
                "Class {} already has a member named {}.",
                symtab.class(class).name,
                name
            )));
        }
        let value = self
            .eval_expression(pool, symtab, declared_sig)?
            .ok_or_else(|| self.raise("Property initializer must have a value."))?;
        let sig = declared_sig.unwrap_or(value.0);
        let value = self.type_matchup(symtab, sig, value, line)?;

        let index = u16::try_from(symtab.class(class).props.len()).expect("property count exceeds u16");
        symtab.class_mut(class).props.push(crate::symtab::PropDef {
            name: name.into(),
            sig,
            visibility,
        });
        symtab
            .class_mut(class)
            .members
            .insert(name.to_string(), ClassMember::Property(index));

        let self_value = self.self_value(symtab)?;
        self.write(&[
            Opcode::SetProperty as u16,
            index,
            self_value.1,
            value.1,
            line,
        ]);
        Ok(())
    }

    /// Closes a class body and synthesizes the constructor: allocate the
    /// instance, run the initializer over it, return it.
    pub fn leave_class(&mut self, symtab: &mut Symtab, class_id: ClassId) -> ParseResult<()> {
        if self.scope().kind != BlockKind::ClassInit {
            return Err(self.raise("'}' does not close a class here."));
        }
        let line = self.line;
        self.leave_block(symtab)?;

        let class_sig = symtab.sig_for_class(class_id);
        let init = symtab.class(class_id).init.expect("class body registered its init");
        let params: Vec<SigId> = {
            let sig = symtab.sigs.get(symtab.function(init).sig).clone();
            sig.func_params()[1..].to_vec()
        };
        let param_count = u16::try_from(params.len()).expect("parameter count exceeds u16");
        let self_reg = param_count;

        let mut code = vec![Opcode::NewInstance as u16, class_id.0, self_reg, line];
        code.extend_from_slice(&[
            Opcode::CallReadonly as u16,
            init.0,
            param_count + 1,
            self_reg,
        ]);
        code.extend((0..param_count).map(u16::from));
        code.push(NO_RESULT);
        code.push(line);
        code.extend_from_slice(&[Opcode::ReturnVal as u16, self_reg, line]);

        let mut reg_info: Vec<RegInfo> = params
            .iter()
            .map(|&sig| RegInfo {
                sig,
                name: None,
                line,
            })
            .collect();
        reg_info.push(RegInfo {
            sig: class_sig,
            name: Some("self".into()),
            line,
        });

        let ctor_sig = symtab.function_sig(class_sig, &params, false);
        let name = symtab.class(class_id).name.clone();
        let ctor = symtab.add_function(FunctionVal {
            name: name.clone(),
            trace_name: name,
            sig: ctor_sig,
            line,
            body: FuncBody::Native(NativeFunc {
                code,
                reg_count: param_count + 1,
                param_count,
                reg_info,
                fresh_cells: Vec::new(),
            }),
        });
        symtab.class_mut(class_id).ctor = Some(ctor);
        Ok(())
    }

    // -- statements --------------------------------------------------------

    /// `var name = value`, allocating the register only after the value
    /// evaluates so the initializer cannot read the new variable.
    pub fn emit_var_decl(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
        name: &str,
        declared_sig: Option<SigId>,
        line: u16,
    ) -> ParseResult<()> {
        let value = self
            .eval_expression(pool, symtab, declared_sig)?
            .ok_or_else(|| self.raise("var initializer must have a value."))?;
        let sig = match declared_sig {
            Some(want) => want,
            None => value.0,
        };
        let value = self.type_matchup(symtab, sig, value, line)?;

        let depth = self.function_depth;
        let reg = self.alloc_reg(sig, Some(name), line);
        let kind = if self.scope().kind == BlockKind::Main {
            VarKind::Global(reg)
        } else {
            VarKind::Local(reg)
        };
        symtab.new_var(name, sig, kind, line, depth);
        self.write_assign(symtab, sig, reg, value, line);
        Ok(())
    }

    /// Begins an `if` block: evaluate the condition, branch past the body
    /// when false.
    pub fn enter_if(&mut self, pool: &mut AstPool, symtab: &mut Symtab) -> ParseResult<()> {
        self.push_block(symtab, BlockKind::If);
        let cond = self.eval_condition(pool, symtab)?;
        let patch = self.write_jump_if_patch(false, cond.1);
        self.block_mut().branch_patch = Some(patch);
        Ok(())
    }

    /// `elif`: jump the previous branch to the end, land its false-jump
    /// here, open the next condition.
    pub fn enter_elif(&mut self, pool: &mut AstPool, symtab: &mut Symtab) -> ParseResult<()> {
        if !matches!(self.block().kind, BlockKind::If) {
            return Err(self.raise("elif outside of an if block."));
        }
        self.write_jump_patched_here();
        let patch = self
            .block_mut()
            .branch_patch
            .take()
            .expect("if block has a pending branch");
        self.patch_to_here(patch);
        self.hide_block_vars_since_entry(symtab);
        let cond = self.eval_condition(pool, symtab)?;
        let patch = self.write_jump_if_patch(false, cond.1);
        self.block_mut().branch_patch = Some(patch);
        Ok(())
    }

    pub fn enter_else(&mut self, symtab: &mut Symtab) -> ParseResult<()> {
        if !matches!(self.block().kind, BlockKind::If) {
            return Err(self.raise("else outside of an if block."));
        }
        self.write_jump_patched_here();
        let patch = self
            .block_mut()
            .branch_patch
            .take()
            .expect("if block has a pending branch");
        self.patch_to_here(patch);
        self.hide_block_vars_since_entry(symtab);
        self.block_mut().kind = BlockKind::IfElse;
        Ok(())
    }

    fn hide_block_vars_since_entry(&mut self, symtab: &mut Symtab) {
        let start = self.block().var_start;
        symtab.hide_block_vars(start);
    }

    pub fn enter_while(&mut self, pool: &mut AstPool, symtab: &mut Symtab) -> ParseResult<()> {
        self.push_block(symtab, BlockKind::While);
        self.block_mut().loop_start = Some(self.code.len());
        let cond = self.eval_condition(pool, symtab)?;
        let patch = self.write_jump_if_patch(false, cond.1);
        self.block_mut().branch_patch = Some(patch);
        Ok(())
    }

    pub fn enter_do_while(&mut self, symtab: &mut Symtab) {
        self.push_block(symtab, BlockKind::DoWhile);
        self.block_mut().loop_start = Some(self.code.len());
    }

    /// The trailing `while <cond>` of a do-while: jump back on true.
    pub fn finish_do_while(&mut self, pool: &mut AstPool, symtab: &mut Symtab) -> ParseResult<()> {
        if self.block().kind != BlockKind::DoWhile {
            return Err(self.raise("while does not close a do block here."));
        }
        let cond = self.eval_condition(pool, symtab)?;
        let loop_start = self.block().loop_start.expect("do-while has a loop start");
        let opcode_pos = self.code.len();
        let offset = loop_start as i64 - opcode_pos as i64;
        self.write(&[
            Opcode::JumpIf as u16,
            1,
            cond.1,
            (offset as i16) as u16,
        ]);
        self.leave_block(symtab)
    }

    /// Opens the `for` block before its range expressions evaluate, so
    /// the loop-owned registers land in the right scope.
    pub fn enter_for_block(&mut self, symtab: &mut Symtab) {
        self.push_block(symtab, BlockKind::ForIn);
    }

    /// Evaluates an expression and anchors the result in a fresh register
    /// of its own, so evaluating a following expression cannot reuse its
    /// storage out from under it.
    pub fn eval_anchored(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
    ) -> ParseResult<ExprResult> {
        let value = self
            .eval_expression(pool, symtab, None)?
            .ok_or_else(|| self.raise("Expected a value."))?;
        let line = self.line;
        let reg = self.alloc_reg(value.0, None, line);
        self.write_assign(symtab, value.0, reg, value, line);
        Ok((value.0, reg))
    }

    /// Evaluates a range expression of a for loop and anchors it.
    pub fn eval_loop_part(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
    ) -> ParseResult<u16> {
        let value = self.eval_anchored(pool, symtab)?;
        let int = symtab.sig_for_class(CLS_INTEGER);
        if value.0 != int {
            return Err(self.raise(format!(
                "for loop ranges must be Integer, not {}.",
                symtab.sig_name(value.0)
            )));
        }
        Ok(value.1)
    }

    /// `for <name> in <start>...<end> [by <step>]`: writes the setup and
    /// loop test once the range registers are anchored.
    pub fn finish_for_header(
        &mut self,
        symtab: &mut Symtab,
        var_name: &str,
        start_reg: u16,
        end_reg: u16,
        step_reg: Option<u16>,
        line: u16,
    ) -> ParseResult<()> {
        if self.block().kind != BlockKind::ForIn {
            return Err(self.raise("for header outside of a for block."));
        }
        let int = symtab.sig_for_class(CLS_INTEGER);
        let (step_reg, infer_step) = match step_reg {
            Some(reg) => (reg, 0),
            None => (self.alloc_reg(int, None, line), 1),
        };

        // The user loop var is a fresh variable scoped to the block.
        let depth = self.function_depth;
        let user_reg = self.alloc_reg(int, Some(var_name), line);
        let kind = if self.scope().kind == BlockKind::Main {
            VarKind::Global(user_reg)
        } else {
            VarKind::Local(user_reg)
        };
        symtab.new_var(var_name, int, kind, line, depth);

        self.write(&[
            Opcode::ForSetup as u16,
            infer_step,
            start_reg,
            end_reg,
            step_reg,
            user_reg,
            line,
        ]);

        let loop_start = self.code.len();
        self.block_mut().loop_start = Some(loop_start);
        let opcode_pos = self.code.len();
        self.write(&[
            Opcode::IntegerFor as u16,
            start_reg,
            end_reg,
            step_reg,
            user_reg,
        ]);
        let patch = self.write_patch_slot(opcode_pos);
        self.code.push(line);
        self.block_mut().branch_patch = Some(patch);
        Ok(())
    }

    pub fn emit_break(&mut self) -> ParseResult<()> {
        let Some(loop_index) = self.blocks.iter().rposition(|b| b.kind.is_loop()) else {
            return Err(self.raise("break outside of a loop."));
        };
        if self.blocks[loop_index..].iter().any(|b| b.kind.is_scope()) {
            return Err(self.raise("break cannot cross a method boundary."));
        }
        self.write_jump_patched_into(loop_index);
        Ok(())
    }

    pub fn emit_continue(&mut self) -> ParseResult<()> {
        let Some(loop_index) = self.blocks.iter().rposition(|b| b.kind.is_loop()) else {
            return Err(self.raise("continue outside of a loop."));
        };
        if self.blocks[loop_index..].iter().any(|b| b.kind.is_scope()) {
            return Err(self.raise("continue cannot cross a method boundary."));
        }
        let target = self.blocks[loop_index]
            .loop_start
            .expect("loop block has a loop start");
        self.write_jump_to(target);
        Ok(())
    }

    // -- try/except --------------------------------------------------------

    pub fn enter_try(&mut self, symtab: &mut Symtab) {
        self.push_block(symtab, BlockKind::Try);
        let opcode_pos = self.code.len();
        self.code.push(Opcode::PushTry as u16);
        let patch = self.write_patch_slot(opcode_pos);
        self.block_mut().try_patch = Some(patch);
    }

    /// Opens an `except <Class> [as <name>]` clause.
    pub fn enter_except(
        &mut self,
        symtab: &mut Symtab,
        class: ClassId,
        as_name: Option<&str>,
        line: u16,
    ) -> ParseResult<()> {
        if !matches!(self.block().kind, BlockKind::Try | BlockKind::TryExcept) {
            return Err(self.raise("except outside of a try block."));
        }
        if !symtab.is_exception_class(class) {
            return Err(self.raise(format!(
                "{} is not a class derived from Exception.",
                symtab.class(class).name
            )));
        }

        if self.block().kind == BlockKind::Try {
            // Closing the protected body: successful runs skip the catch
            // chain entirely.
            self.write(&[Opcode::PopTry as u16]);
            self.write_jump_patched_here();
            let patch = self.block_mut().try_patch.take().expect("try has a patch");
            self.patch_to_here(patch);
            self.block_mut().kind = BlockKind::TryExcept;
        } else {
            self.write_jump_patched_here();
            let patch = self
                .block_mut()
                .except_next_patch
                .take()
                .expect("except chain has a pending next-clause jump");
            self.patch_to_here(patch);
        }
        self.hide_block_vars_since_entry(symtab);

        let catch_reg = match as_name {
            Some(name) => {
                let sig = symtab.sig_for_class(class);
                let depth = self.function_depth;
                let reg = self.alloc_reg(sig, Some(name), line);
                let kind = if self.scope().kind == BlockKind::Main {
                    VarKind::Global(reg)
                } else {
                    VarKind::Local(reg)
                };
                symtab.new_var(name, sig, kind, line, depth);
                reg
            }
            None => NO_RESULT,
        };

        let opcode_pos = self.code.len();
        self.write(&[Opcode::Except as u16, class.0, catch_reg]);
        let patch = self.write_patch_slot(opcode_pos);
        self.block_mut().except_next_patch = Some(patch);
        self.block_mut().has_except = true;
        Ok(())
    }

    pub fn emit_raise(&mut self, pool: &mut AstPool, symtab: &mut Symtab) -> ParseResult<()> {
        let value = self
            .eval_expression(pool, symtab, None)?
            .ok_or_else(|| self.raise("raise requires a value."))?;
        let class = symtab.sigs.get(value.0).class;
        if !symtab.is_exception_class(class) {
            return Err(self.raise(format!(
                "Raised values must derive from Exception, not {}.",
                symtab.sig_name(value.0)
            )));
        }
        let line = self.line;
        self.write(&[Opcode::Raise as u16, value.1, line]);
        Ok(())
    }

    // -- match -------------------------------------------------------------

    pub fn enter_match(&mut self, pool: &mut AstPool, symtab: &mut Symtab, line: u16) -> ParseResult<()> {
        let value = self
            .eval_expression(pool, symtab, None)?
            .ok_or_else(|| self.raise("match requires a value."))?;
        let class = symtab.sigs.get(value.0).class;
        if symtab.class(class).kind != ClassKind::Enum {
            return Err(self.raise(format!(
                "match works on enum values, not {}.",
                symtab.sig_name(value.0)
            )));
        }
        let variant_count = symtab.class(class).variants.len();

        self.push_block(symtab, BlockKind::Match);

        // Anchor the matched value in a loop-owned register so case arms
        // cannot clobber it through storage reuse.
        let match_reg = self.alloc_reg(value.0, None, line);
        self.write_assign(symtab, value.0, match_reg, value, line);

        let dispatch_at = self.code.len();
        let mut slots = vec![
            Opcode::MatchDispatch as u16,
            u16::try_from(variant_count).expect("variant count exceeds u16"),
            match_reg,
        ];
        slots.extend(std::iter::repeat_n(0u16, variant_count));
        slots.push(line);
        self.write(&slots);

        let block = self.block_mut();
        block.match_reg = match_reg;
        block.match_class = Some(class);
        block.match_dispatch_at = dispatch_at;
        block.match_cases_seen = vec![false; variant_count];
        Ok(())
    }

    /// Opens `case Variant(binds):`, patching the dispatch slot for the
    /// variant to land here.
    pub fn enter_match_case(
        &mut self,
        symtab: &mut Symtab,
        variant_name: &str,
        binds: &[String],
        line: u16,
    ) -> ParseResult<()> {
        if self.block().kind != BlockKind::Match {
            return Err(self.raise("case outside of a match block."));
        }
        let class = self.block().match_class.expect("match block has a class");
        let Some(ClassMember::Variant(variant)) = symtab.find_member(class, variant_name) else {
            return Err(self.raise(format!(
                "{} is not a variant of enum {}.",
                variant_name,
                symtab.class(class).name
            )));
        };

        if self.block().match_in_case {
            // The previous arm jumps past the rest of the match.
            self.write_jump_patched_here();
            self.hide_block_vars_since_entry(symtab);
        }

        let index = variant as usize;
        if self.block().match_cases_seen[index] {
            return Err(self.raise(format!("case {variant_name} appears more than once.")));
        }
        self.block_mut().match_cases_seen[index] = true;

        // Patch the dispatch table: slot layout is op, count, reg, jumps.
        let dispatch_at = self.block().match_dispatch_at;
        let slot = dispatch_at + 3 + index;
        let offset = self.code.len() as i64 - dispatch_at as i64;
        self.code[slot] = (offset as i16) as u16;

        let arg_sigs = symtab.class(class).variants[index].arg_sigs.clone();
        if binds.len() != arg_sigs.len() {
            return Err(self.raise(format!(
                "case {} expects {} bindings, but got {}.",
                variant_name,
                arg_sigs.len(),
                binds.len()
            )));
        }
        if !binds.is_empty() {
            let depth = self.function_depth;
            let is_main = self.scope().kind == BlockKind::Main;
            let mut out_regs = Vec::with_capacity(binds.len());
            for (name, &sig) in binds.iter().zip(&arg_sigs) {
                let reg = self.alloc_reg(sig, Some(name), line);
                let kind = if is_main {
                    VarKind::Global(reg)
                } else {
                    VarKind::Local(reg)
                };
                symtab.new_var(name, sig, kind, line, depth);
                out_regs.push(reg);
            }
            let match_reg = self.block().match_reg;
            let mut slots = vec![
                Opcode::VariantDecompose as u16,
                u16::try_from(out_regs.len()).expect("bind count exceeds u16"),
                match_reg,
            ];
            slots.extend_from_slice(&out_regs);
            slots.push(line);
            self.write(&slots);
        }
        self.block_mut().match_in_case = true;
        Ok(())
    }

    // -- return / show -----------------------------------------------------

    pub fn emit_return(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
        has_value: bool,
        line: u16,
    ) -> ParseResult<()> {
        if self.scope().kind == BlockKind::Main {
            return Err(self.raise("return outside of a method."));
        }
        if has_value {
            let value = self
                .eval_expression(pool, symtab, self.scope().ret_sig)?
                .ok_or_else(|| self.raise("return expression has no value."))?;
            let scope = self.scope_mut();
            let want = match scope.ret_sig {
                Some(want) => want,
                None if scope.ret_inferred => {
                    // Lambdas adopt the first returned type.
                    scope.ret_sig = Some(value.0);
                    value.0
                }
                None => {
                    return Err(self.raise("Method does not return a value."));
                }
            };
            let value = self.type_matchup(symtab, want, value, line)?;
            self.write(&[Opcode::ReturnVal as u16, value.1, line]);
        } else {
            if self.scope().ret_sig.is_some() {
                return Err(self.raise("Method must return a value."));
            }
            self.write(&[Opcode::ReturnNoval as u16, line]);
        }
        self.write_return_marker();
        Ok(())
    }

    /// A single-expression lambda body: the expression's value is the
    /// lambda's return.
    pub fn emit_lambda_value_return(
        &mut self,
        pool: &mut AstPool,
        symtab: &mut Symtab,
        line: u16,
    ) -> ParseResult<()> {
        let result = self.eval_expression(pool, symtab, None)?;
        if let Some(value) = result {
            let scope = self.scope_mut();
            if scope.ret_sig.is_none() {
                scope.ret_sig = Some(value.0);
            }
            let want = self.scope().ret_sig.expect("set above");
            let value = self.type_matchup(symtab, want, value, line)?;
            self.write(&[Opcode::ReturnVal as u16, value.1, line]);
            self.write_return_marker();
        }
        Ok(())
    }

    /// The name `__function__` resolves to, from the enclosing scope.
    pub fn current_function_name(&self, symtab: &Symtab) -> String {
        let func = self.scope().func.expect("scope block has a function");
        symtab.function(func).trace_name.to_string()
    }

    pub fn emit_show(&mut self, pool: &mut AstPool, symtab: &mut Symtab, line: u16) -> ParseResult<()> {
        let value = self
            .eval_expression(pool, symtab, None)?
            .ok_or_else(|| self.raise("show requires a value."))?;
        self.write(&[Opcode::Show as u16, value.1, line]);
        Ok(())
    }

    // -- method scopes -----------------------------------------------------

    /// Opens a method scope. Parameters land in the first registers; the
    /// function value is registered up front so recursion resolves.
    pub fn enter_define(
        &mut self,
        symtab: &mut Symtab,
        kind: BlockKind,
        name: &str,
        trace_name: String,
        params: &[(String, SigId)],
        ret_sig: Option<SigId>,
        is_varargs: bool,
        self_class: Option<ClassId>,
        line: u16,
    ) -> ParseResult<FunctionId> {
        debug_assert!(kind.is_scope() && kind != BlockKind::Main);
        let unit = symtab.sig_for_class(CLS_UNIT);
        let ret = ret_sig.unwrap_or(unit);
        let param_sigs: Vec<SigId> = params.iter().map(|(_, sig)| *sig).collect();
        let func_sig = symtab.function_sig(ret, &param_sigs, is_varargs);
        let func = symtab.add_function(FunctionVal {
            name: name.into(),
            trace_name: trace_name.into(),
            sig: func_sig,
            line,
            body: FuncBody::Native(NativeFunc {
                code: Vec::new(),
                reg_count: 0,
                param_count: 0,
                reg_info: Vec::new(),
                fresh_cells: Vec::new(),
            }),
        });

        // Register the method where callers can see it before the body
        // parses, so recursion resolves.
        if kind == BlockKind::Define {
            match self_class {
                Some(class) => {
                    if symtab.find_member(class, name).is_some() {
                        return Err(self.raise(format!(
                            "Class {} already has a member named {}.",
                            symtab.class(class).name,
                            name
                        )));
                    }
                    symtab
                        .class_mut(class)
                        .members
                        .insert(name.to_string(), ClassMember::Method(func));
                }
                None => {
                    symtab.new_var(
                        name,
                        func_sig,
                        VarKind::Readonly(func),
                        line,
                        self.function_depth,
                    );
                }
            }
        }

        self.push_block(symtab, kind);
        self.function_depth += 1;
        let depth = self.function_depth;
        {
            let block = self.block_mut();
            block.func = Some(func);
            block.depth = depth;
            block.ret_sig = ret_sig;
            block.ret_inferred = kind == BlockKind::Lambda && ret_sig.is_none();
            block.self_class = self_class;
            block.param_count = u16::try_from(params.len()).expect("parameter count exceeds u16");
        }
        for (param_name, sig) in params {
            let reg = self.alloc_reg(*sig, Some(param_name), line);
            symtab.new_var(param_name, *sig, VarKind::Local(reg), line, depth);
        }
        Ok(func)
    }

    /// Closes the innermost block. Control blocks patch their jumps;
    /// method blocks finalize their function value.
    pub fn leave_block(&mut self, symtab: &mut Symtab) -> ParseResult<()> {
        let kind = self.block().kind;
        if kind == BlockKind::Main {
            return Err(self.raise("'}' outside of a block."));
        }
        if kind.is_scope() {
            self.leave_scope_block(symtab)?;
            return Ok(());
        }

        match kind {
            BlockKind::Try => {
                return Err(self.raise("try block has no except clause."));
            }
            BlockKind::Match => {
                let class = self.block().match_class.expect("match block has a class");
                let missing: Vec<String> = self
                    .block()
                    .match_cases_seen
                    .iter()
                    .enumerate()
                    .filter(|(_, seen)| !**seen)
                    .map(|(i, _)| symtab.class(class).variant_name(i as u16))
                    .collect();
                if !missing.is_empty() {
                    return Err(self.raise(format!(
                        "match is not exhaustive (missing {}).",
                        missing.join(", ")
                    )));
                }
            }
            BlockKind::While | BlockKind::ForIn => {
                // Loop back to the test before falling out.
                let target = self.block().loop_start.expect("loop block has a start");
                self.write_jump_to(target);
            }
            _ => {}
        }

        if let Some(patch) = self.block_mut().branch_patch.take() {
            self.patch_to_here(patch);
        }
        let patch_start = self.block().patch_start;
        let pending: Vec<Patch> = self.patches.split_off(patch_start);
        for patch in pending {
            self.patch_to_here(patch);
        }

        // Storages stay on the method's reuse list; only name visibility
        // ends with a control block.
        self.hide_block_vars_since_entry(symtab);
        self.blocks.pop();
        Ok(())
    }

    fn leave_scope_block(&mut self, symtab: &mut Symtab) -> ParseResult<()> {
        // Outstanding patches inside a method always belong to inner
        // control blocks, which have already closed.
        let block_index = self.blocks.len() - 1;
        let depth = self.blocks[block_index].depth;
        let func = self.blocks[block_index].func.expect("scope block has a function");

        // A method with a return type must not fall off its end.
        if !self.blocks[block_index].last_op_returned {
            let line = self.line;
            if self.blocks[block_index].ret_sig.is_some() {
                self.write(&[Opcode::ReturnExpected as u16, line]);
            } else {
                self.write(&[Opcode::ReturnNoval as u16, line]);
            }
        }

        // Lambda return inference finalizes the signature now.
        if self.blocks[block_index].ret_inferred {
            if let Some(ret) = self.blocks[block_index].ret_sig {
                let params: Vec<SigId> = {
                    let sig = symtab.sigs.get(symtab.function(func).sig).clone();
                    sig.func_params().to_vec()
                };
                let new_sig = symtab.function_sig(ret, &params, false);
                symtab.function_mut(func).sig = new_sig;
            }
        }

        let block = &self.blocks[block_index];
        let code_start = block.code_start;
        let own_spots = self.closure_spots.iter().any(|&(_, d)| d == depth);
        let uses_closure = block.flags & BLOCK_USES_CLOSURE != 0;
        let mut next_reg_spot = block.next_reg_spot;
        let mut reg_info = std::mem::take(&mut self.blocks[block_index].reg_info);
        let mut fresh_cells = Vec::new();

        if own_spots || uses_closure {
            let is_backing = own_spots && !uses_closure;
            let ctx = TransformCtx {
                code: &self.code,
                code_start,
                is_backing,
                function_depth: depth,
                param_count: self.blocks[block_index].param_count,
                next_reg_spot,
            };
            let result = closure::transform(&ctx, &mut self.closure_spots);
            if result.next_reg_spot != next_reg_spot {
                // The backing register anchoring the cell array.
                let any = symtab.sig_for_class(CLS_ANY);
                reg_info.push(RegInfo {
                    sig: any,
                    name: None,
                    line: self.line,
                });
                next_reg_spot = result.next_reg_spot;
            }
            self.code.truncate(code_start);
            self.code.extend_from_slice(&result.code);
            fresh_cells = result.fresh_cells;
            if !is_backing {
                self.closure_functions.insert(func);
            }
        }

        let body_code = self.code.split_off(code_start);
        {
            let func_val = symtab.function_mut(func);
            func_val.body = FuncBody::Native(NativeFunc {
                code: body_code,
                reg_count: next_reg_spot,
                param_count: self.blocks[block_index].param_count,
                reg_info,
                fresh_cells,
            });
        }

        self.hide_block_vars_since_entry(symtab);
        let storage_start = self.blocks[block_index].storage_start;
        self.storages.truncate(storage_start);
        self.function_depth -= 1;
        self.blocks.pop();
        Ok(())
    }

    /// Drops everything a failed compile left behind, keeping the global
    /// register metadata so later chunks still see their globals.
    pub fn reset_after_error(&mut self) {
        self.code.clear();
        self.patches.clear();
        self.storages.clear();
        self.blocks.truncate(1);
        self.blocks[0].code_start = 0;
        self.blocks[0].patch_start = 0;
        self.function_depth = 1;
        self.closure_spots.clear();
        self.last_build = None;
    }

    /// Finishes the current chunk of `__main__`: appends the VM exit and
    /// installs the accumulated globals metadata.
    pub fn finalize_main(&mut self, symtab: &mut Symtab) -> ParseResult<()> {
        if self.blocks.len() != 1 {
            return Err(Raise::new(
                ErrorClass::Syntax,
                format!("Unterminated block at end of input ({:?}).", self.block().kind),
                self.line,
            ));
        }
        self.write(&[Opcode::ReturnFromVm as u16]);
        let code = std::mem::take(&mut self.code);
        let reg_count = u16::try_from(self.main_reg_info.len()).expect("global registers exceed u16");
        symtab.next_global = reg_count;
        let main = symtab.function_mut(self.main_func);
        main.body = FuncBody::Native(NativeFunc {
            code,
            reg_count,
            param_count: 0,
            reg_info: self.main_reg_info.clone(),
            fresh_cells: Vec::new(),
        });
        self.blocks[0].code_start = 0;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum CallTarget {
    Readonly(FunctionId),
    Register(u16),
}

#[derive(Debug, Clone, Copy)]
enum PackageAccess {
    Var {
        package: u16,
        sub: Option<u16>,
        var: u16,
        sig: SigId,
    },
    Func(FunctionId),
}
