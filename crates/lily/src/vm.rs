//! The register-machine bytecode interpreter.
//!
//! One flat register file backs every frame: `__main__`'s window starts at
//! zero (its registers are the globals), and each native call opens a new
//! window at the top. A frame records its callee, window base, the try
//! stack depth at entry, and where to resume the caller.
//!
//! Dispatch decodes one instruction per pass through the loop and caches
//! the current code slice; calls, returns, and caught exceptions reload
//! the cache. Errors carry their traceback from the raise site and walk
//! the try stack; an uncaught error leaves the VM with every window torn
//! down.

use crate::{
    heap::{Heap, HeapId},
    io::PrintWriter,
    msgbuf::MsgBuf,
    opcode::{CodeIter, CodeRound, NO_RESULT, Opcode},
    raiser::{RunError, RunResult},
    sig::SigId,
    symtab::{
        CLS_ANY, CLS_BAD_CAST, CLS_BAD_VALUE, CLS_DIVIDE_BY_ZERO, CLS_KEY, CLS_NOVALUE,
        CLS_OUT_OF_RANGE, CLS_RECURSION, CLS_RETURN_EXPECTED, CLS_VALUE_ERROR, ClassId, LitValue,
        Symtab,
    },
    tracer::VmTracer,
    value::{
        AnyBox, Closure, ForeignRaise, FuncBody, FunctionId, HeapData, Instance, List, Tuple,
        Value, Variant, is_truthy, render_value, value_eq,
    },
    hash::{HashKey, LilyHash},
};

/// Native call depth before `Recursion` is raised.
pub(crate) const DEFAULT_RECURSION_LIMIT: usize = 100;

#[derive(Debug)]
struct Frame {
    func: FunctionId,
    base: usize,
    /// Caller-window register receiving the return value.
    ret_reg: u16,
    /// Code position to resume in the caller.
    return_pos: usize,
    /// The closure cell array this frame reads upvalues through.
    cells: Option<HeapId>,
    /// Line of the call instruction, for tracebacks of outer frames.
    call_line: u16,
    /// Try stack depth at entry; a return drops entries pushed inside.
    try_depth: usize,
}

#[derive(Debug, Clone, Copy)]
struct TryEntry {
    frame_index: usize,
    /// Position of the first `except` clause.
    catch_pos: usize,
}

/// The state a foreign function works against: typed argument reads,
/// a typed result write, and the print writer.
pub struct ForeignCall<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) symtab: &'a Symtab,
    pub(crate) regs: &'a mut Vec<Value>,
    pub(crate) base: usize,
    pub(crate) argc: usize,
    pub(crate) result: Option<Value>,
    pub(crate) out: &'a mut dyn PrintWriter,
}

impl ForeignCall<'_> {
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.argc
    }

    fn arg(&self, index: usize) -> Result<&Value, ForeignRaise> {
        if index >= self.argc {
            return Err(ForeignRaise::new(
                "ValueError",
                format!("Argument {index} is out of range."),
            ));
        }
        Ok(&self.regs[self.base + index])
    }

    pub fn arg_is_nil(&self, index: usize) -> Result<bool, ForeignRaise> {
        Ok(self.arg(index)?.is_nil())
    }

    pub fn arg_integer(&self, index: usize) -> Result<i64, ForeignRaise> {
        match self.arg(index)? {
            Value::Integer(i) => Ok(*i),
            other => Err(bad_arg(index, "Integer", other)),
        }
    }

    pub fn arg_double(&self, index: usize) -> Result<f64, ForeignRaise> {
        match self.arg(index)? {
            Value::Double(d) => Ok(*d),
            other => Err(bad_arg(index, "Double", other)),
        }
    }

    pub fn arg_boolean(&self, index: usize) -> Result<bool, ForeignRaise> {
        match self.arg(index)? {
            Value::Boolean(b) => Ok(*b),
            other => Err(bad_arg(index, "Boolean", other)),
        }
    }

    pub fn arg_string(&self, index: usize) -> Result<&str, ForeignRaise> {
        match self.arg(index)? {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Str(s) => Ok(s),
                _ => Err(ForeignRaise::new(
                    "ValueError",
                    format!("Argument {index} is not a String."),
                )),
            },
            other => Err(bad_arg(index, "String", other)),
        }
    }

    pub fn arg_bytestring(&self, index: usize) -> Result<&[u8], ForeignRaise> {
        match self.arg(index)? {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Bytes(b) => Ok(b),
                _ => Err(ForeignRaise::new(
                    "ValueError",
                    format!("Argument {index} is not a ByteString."),
                )),
            },
            other => Err(bad_arg(index, "ByteString", other)),
        }
    }

    /// Renders any argument the way `print` does, including `Any`
    /// contents.
    pub fn render_arg(&self, index: usize) -> Result<String, ForeignRaise> {
        let value = self.arg(index)?;
        let mut text = String::new();
        render_value(self.heap, self.symtab, value, &mut text);
        Ok(text)
    }

    pub fn result_integer(&mut self, value: i64) {
        self.result = Some(Value::Integer(value));
    }

    pub fn result_double(&mut self, value: f64) {
        self.result = Some(Value::Double(value));
    }

    pub fn result_boolean(&mut self, value: bool) {
        self.result = Some(Value::Boolean(value));
    }

    pub fn result_string(&mut self, value: &str) {
        let id = self.heap.allocate(HeapData::Str(value.into()), false);
        self.result = Some(Value::Ref(id));
    }

    pub fn result_bytestring(&mut self, value: &[u8]) {
        let id = self.heap.allocate(HeapData::Bytes(value.into()), false);
        self.result = Some(Value::Ref(id));
    }

    /// Returns an instance of a foreign class declared in a dynaload
    /// seed. `class_id` comes from the package's cid table; the payload
    /// layout is the package's own, and `destroy` runs when the value's
    /// last reference drops.
    pub fn result_foreign(
        &mut self,
        class_id: u16,
        data: Box<dyn std::any::Any>,
        destroy: Option<fn(Box<dyn std::any::Any>)>,
    ) {
        let id = self.heap.allocate(
            HeapData::Foreign(crate::value::ForeignData {
                class: crate::symtab::ClassId(class_id),
                data,
                destroy,
            }),
            false,
        );
        self.result = Some(Value::Ref(id));
    }

    /// Downcasts a foreign argument back to the payload the package put
    /// in it.
    pub fn arg_foreign<T: 'static>(&self, index: usize) -> Result<&T, ForeignRaise> {
        match self.arg(index)? {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Foreign(foreign) => foreign.data.downcast_ref::<T>().ok_or_else(|| {
                    ForeignRaise::new(
                        "ValueError",
                        format!("Argument {index} holds a different foreign payload."),
                    )
                }),
                _ => Err(ForeignRaise::new(
                    "ValueError",
                    format!("Argument {index} is not a foreign value."),
                )),
            },
            other => Err(bad_arg(index, "a foreign value", other)),
        }
    }

    /// Returns a file value. The core only models the shape; packages
    /// supply the handle and the operations over it.
    pub fn result_file(&mut self, path: &str, handle: Option<std::fs::File>, read_ok: bool, write_ok: bool) {
        let id = self.heap.allocate(
            HeapData::File(crate::value::LilyFile {
                path: path.into(),
                handle,
                read_ok,
                write_ok,
            }),
            false,
        );
        self.result = Some(Value::Ref(id));
    }

    /// The path of a file argument.
    pub fn arg_file_path(&self, index: usize) -> Result<&str, ForeignRaise> {
        match self.arg(index)? {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::File(file) => Ok(&file.path),
                _ => Err(ForeignRaise::new(
                    "ValueError",
                    format!("Argument {index} is not a File."),
                )),
            },
            other => Err(bad_arg(index, "File", other)),
        }
    }

    pub fn print(&mut self, text: &str) {
        self.out.print(text);
    }
}

fn bad_arg(index: usize, want: &str, got: &Value) -> ForeignRaise {
    ForeignRaise::new(
        "ValueError",
        format!("Argument {index} is not {want} (got {got:?})."),
    )
}

/// One execution of the VM over a state's register file and heap.
pub(crate) struct Vm<'a, P: PrintWriter, T: VmTracer> {
    symtab: &'a Symtab,
    heap: &'a mut Heap,
    regs: &'a mut Vec<Value>,
    /// Lazily materialized literal values, cached across runs.
    lit_values: &'a mut Vec<Option<Value>>,
    /// Mutable package var slots, by package index.
    package_values: &'a mut Vec<Vec<Value>>,
    /// Values the embedding API holds outside the register file.
    foreign_stack: &'a Vec<Value>,
    print: &'a mut P,
    tracer: &'a mut T,
    frames: Vec<Frame>,
    try_stack: Vec<TryEntry>,
    recursion_limit: usize,
    /// Return value of the entry function, for calls driven by the
    /// embedding API.
    exit_value: Option<Value>,
    /// Reused text buffer for `show` output and traceback lines.
    msgbuf: MsgBuf,
}

fn decode(code: &[u16], pos: usize) -> CodeRound {
    CodeIter::new(code, pos, code.len())
        .next()
        .expect("Vm: decode past end of code")
}

impl<'a, P: PrintWriter, T: VmTracer> Vm<'a, P, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symtab: &'a Symtab,
        heap: &'a mut Heap,
        regs: &'a mut Vec<Value>,
        lit_values: &'a mut Vec<Option<Value>>,
        package_values: &'a mut Vec<Vec<Value>>,
        foreign_stack: &'a Vec<Value>,
        print: &'a mut P,
        tracer: &'a mut T,
        recursion_limit: usize,
    ) -> Self {
        Self {
            symtab,
            heap,
            regs,
            lit_values,
            package_values,
            foreign_stack,
            print,
            tracer,
            frames: Vec::new(),
            try_stack: Vec::new(),
            recursion_limit,
            exit_value: None,
            msgbuf: MsgBuf::new(),
        }
    }

    /// The value the entry function returned, if any.
    pub fn take_exit_value(&mut self) -> Option<Value> {
        self.exit_value.take()
    }

    /// Runs `entry` with its window already prepared at `base` (arguments
    /// in the leading registers, the rest nil-padded).
    pub fn run(&mut self, entry: FunctionId, base: usize, ret_reg: u16) -> RunResult<()> {
        self.frames.push(Frame {
            func: entry,
            base,
            ret_reg,
            return_pos: 0,
            cells: None,
            call_line: 0,
            try_depth: 0,
        });
        let result = self.exec_loop(entry, base);
        // Leave the entry window in place (main's window is the globals);
        // inner windows were unwound by the loop or the error path.
        self.frames.clear();
        self.try_stack.clear();
        result
    }

    fn err(class: ClassId, message: impl Into<String>) -> RunError {
        RunError::new(class, message)
    }

    // -- register helpers --------------------------------------------------

    /// Clones an input register; reading a nil value raises `NoValue`.
    fn clone_reg(&self, index: usize) -> RunResult<Value> {
        let value = &self.regs[index];
        if value.is_nil() {
            return Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
        }
        Ok(value.clone_with_heap(self.heap))
    }

    /// Writes an owned value into a register, releasing the old one.
    fn write_reg(&mut self, index: usize, value: Value) {
        let old = std::mem::replace(&mut self.regs[index], value);
        old.drop_with_heap(self.heap);
    }

    fn integer_at(&self, index: usize) -> RunResult<i64> {
        match &self.regs[index] {
            Value::Integer(i) => Ok(*i),
            Value::Nil => Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value.")),
            other => panic!("Vm: expected an Integer register, found {other:?}"),
        }
    }

    fn number_at(&self, index: usize) -> RunResult<f64> {
        match &self.regs[index] {
            Value::Integer(i) => Ok(*i as f64),
            Value::Double(d) => Ok(*d),
            Value::Nil => Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value.")),
            other => panic!("Vm: expected a numeric register, found {other:?}"),
        }
    }

    fn str_at(&self, index: usize) -> RunResult<&str> {
        match &self.regs[index] {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Str(s) => Ok(s),
                other => panic!("Vm: expected a String register, found {other:?}"),
            },
            Value::Nil => Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value.")),
            other => panic!("Vm: expected a String register, found {other:?}"),
        }
    }

    fn reg_sig(&self, func: FunctionId, reg: u16) -> SigId {
        self.symtab.function(func).native().reg_info[reg as usize].sig
    }

    /// Wraps a value into an `Any` box carrying its signature tag.
    fn wrap_any(&mut self, value: Value, sig: SigId) -> Value {
        let id = self
            .heap
            .allocate(HeapData::Any(AnyBox { sig, value }), true);
        Value::Ref(id)
    }

    /// Clones a register for a destination expecting `Any`, wrapping
    /// non-Any sources.
    fn clone_for_any(&mut self, func: FunctionId, base: usize, reg: u16) -> RunResult<Value> {
        let sig = self.reg_sig(func, reg);
        let value = self.clone_reg(base + reg as usize)?;
        if self.symtab.sigs.get(sig).class == CLS_ANY {
            Ok(value)
        } else {
            Ok(self.wrap_any(value, sig))
        }
    }

    fn literal_value(&mut self, index: u16) -> Value {
        if self.lit_values.len() <= index as usize {
            self.lit_values.resize_with(index as usize + 1, || None);
        }
        if self.lit_values[index as usize].is_none() {
            let value = match &self.symtab.literal(index).value {
                LitValue::Integer(i) => Value::Integer(*i),
                LitValue::Double(d) => Value::Double(*d),
                LitValue::Boolean(b) => Value::Boolean(*b),
                LitValue::Byte(b) => Value::Integer(i64::from(*b)),
                LitValue::Str(s) => {
                    let id = self.heap.allocate(HeapData::Str(s.clone()), false);
                    Value::Ref(id)
                }
                LitValue::Bytes(b) => {
                    let id = self.heap.allocate(HeapData::Bytes(b.clone()), false);
                    Value::Ref(id)
                }
            };
            self.lit_values[index as usize] = Some(value);
        }
        self.lit_values[index as usize]
            .as_ref()
            .expect("literal cache filled above")
            .clone_with_heap(self.heap)
    }

    fn maybe_gc(&mut self) {
        if !self.heap.needs_gc() {
            return;
        }
        let before = self.heap.stats().tagged_objects;
        let roots = self
            .regs
            .iter()
            .chain(self.lit_values.iter().filter_map(Option::as_ref))
            .chain(self.package_values.iter().flatten())
            .chain(self.foreign_stack.iter());
        self.heap.collect(roots);
        let after = self.heap.stats().tagged_objects;
        self.tracer.on_gc_pass(before.saturating_sub(after));
    }

    // -- frame teardown ----------------------------------------------------

    /// Pops the top frame, releasing every value in its window.
    fn pop_frame_discard(&mut self) -> Frame {
        let frame = self.frames.pop().expect("Vm: no frame to pop");
        for index in (frame.base..self.regs.len()).rev() {
            let value = std::mem::replace(&mut self.regs[index], Value::Nil);
            value.drop_with_heap(self.heap);
        }
        self.regs.truncate(frame.base);
        self.try_stack.truncate(frame.try_depth);
        self.tracer.on_return(self.frames.len());
        frame
    }

    fn build_traceback(&mut self, fault_line: u16) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.frames.len());
        for (index, frame) in self.frames.iter().enumerate() {
            let line = match self.frames.get(index + 1) {
                Some(above) => above.call_line,
                None => fault_line,
            };
            let func = self.symtab.function(frame.func);
            self.msgbuf.reset();
            self.msgbuf
                .add("Function ")
                .add(&func.trace_name)
                .add(" at line ")
                .add_int(i64::from(line));
            lines.push(self.msgbuf.flush());
        }
        lines
    }

    // -- calls -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn begin_call(
        &mut self,
        caller_func: FunctionId,
        caller_base: usize,
        callee: FunctionId,
        cells: Option<HeapId>,
        arg_regs: &[u16],
        ret_reg: u16,
        return_pos: usize,
        call_line: u16,
    ) -> RunResult<bool> {
        let func_val = self.symtab.function(callee);
        match &func_val.body {
            FuncBody::Native(_) => {
                self.begin_native_call(
                    caller_func,
                    caller_base,
                    callee,
                    cells,
                    arg_regs,
                    ret_reg,
                    return_pos,
                    call_line,
                )?;
                Ok(true)
            }
            FuncBody::Foreign(entry) => {
                let entry = *entry;
                self.run_foreign_call(caller_base, callee, entry, arg_regs, ret_reg, call_line)?;
                Ok(false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_native_call(
        &mut self,
        caller_func: FunctionId,
        caller_base: usize,
        callee: FunctionId,
        cells: Option<HeapId>,
        arg_regs: &[u16],
        ret_reg: u16,
        return_pos: usize,
        call_line: u16,
    ) -> RunResult<()> {
        if self.frames.len() >= self.recursion_limit {
            return Err(Self::err(
                CLS_RECURSION,
                "Function call recursion limit reached.",
            ));
        }
        let symtab = self.symtab;
        let native = symtab.function(callee).native();
        let sig = symtab.sigs.get(symtab.function(callee).sig);
        let param_count = native.param_count as usize;
        let new_base = self.regs.len();

        // Stage the window so a nil argument mid-copy releases cleanly.
        let mut window: Vec<Value> = Vec::with_capacity(native.reg_count as usize);
        let mut staging = || -> RunResult<()> {
            if sig.is_varargs() {
                // Surplus arguments collect into a fresh list of the
                // vararg element type.
                let fixed = param_count - 1;
                for &reg in &arg_regs[..fixed] {
                    window.push(self.clone_reg(caller_base + reg as usize)?);
                }
                let list_sig = *sig.func_params().last().expect("varargs sig has params");
                let elem_sig = symtab.sigs.get(list_sig).subsigs[0];
                let elem_is_any = symtab.sigs.get(elem_sig).class == CLS_ANY;
                let mut values = Vec::with_capacity(arg_regs.len() - fixed);
                for &reg in &arg_regs[fixed..] {
                    let value = if elem_is_any {
                        self.clone_for_any(caller_func, caller_base, reg)?
                    } else {
                        self.clone_reg(caller_base + reg as usize)?
                    };
                    values.push(value);
                }
                let tagged = symtab.sigs.get(list_sig).may_circle();
                let id = self
                    .heap
                    .allocate(HeapData::List(List { elem_sig, values }), tagged);
                window.push(Value::Ref(id));
            } else {
                for &reg in arg_regs {
                    window.push(self.clone_reg(caller_base + reg as usize)?);
                }
            }
            Ok(())
        };
        if let Err(err) = staging() {
            for value in window {
                value.drop_with_heap(self.heap);
            }
            return Err(err);
        }
        for _ in param_count..native.reg_count as usize {
            window.push(Value::Nil);
        }
        self.regs.append(&mut window);

        // Fresh cells: an inner method's own captured locals must not
        // leak between calls.
        if let Some(cells_id) = cells {
            for &spot in &native.fresh_cells {
                let HeapData::CellArray(cell_values) = self.heap.get_mut(cells_id) else {
                    panic!("Vm: closure cells are not a cell array");
                };
                let old = std::mem::replace(&mut cell_values[spot as usize], Value::Nil);
                old.drop_with_heap(self.heap);
            }
        }

        self.tracer
            .on_call(&symtab.function(callee).trace_name, self.frames.len() + 1);
        self.frames.push(Frame {
            func: callee,
            base: new_base,
            ret_reg,
            return_pos,
            cells,
            call_line,
            try_depth: self.try_stack.len(),
        });
        Ok(())
    }

    /// Runs a foreign function inside a temporary frame. Collection is
    /// suspended so values the host is holding cannot vanish mid-call.
    fn run_foreign_call(
        &mut self,
        caller_base: usize,
        callee: FunctionId,
        entry: crate::value::ForeignFn,
        arg_regs: &[u16],
        ret_reg: u16,
        call_line: u16,
    ) -> RunResult<()> {
        let new_base = self.regs.len();
        let mut window: Vec<Value> = Vec::with_capacity(arg_regs.len());
        for &reg in arg_regs {
            match self.clone_reg(caller_base + reg as usize) {
                Ok(value) => window.push(value),
                Err(err) => {
                    for value in window {
                        value.drop_with_heap(self.heap);
                    }
                    return Err(err);
                }
            }
        }
        self.regs.append(&mut window);
        self.frames.push(Frame {
            func: callee,
            base: new_base,
            ret_reg,
            return_pos: 0,
            cells: None,
            call_line,
            try_depth: self.try_stack.len(),
        });

        self.heap.suspend_gc();
        let mut ctx = ForeignCall {
            heap: &mut *self.heap,
            symtab: self.symtab,
            regs: &mut *self.regs,
            base: new_base,
            argc: arg_regs.len(),
            result: None,
            out: &mut *self.print,
        };
        let outcome = entry(&mut ctx);
        let result_value = ctx.result.take();
        self.heap.resume_gc();

        match outcome {
            Ok(()) => {
                self.pop_frame_discard();
                if let Some(value) = result_value {
                    if ret_reg != NO_RESULT {
                        self.write_reg(caller_base + ret_reg as usize, value);
                    } else {
                        value.drop_with_heap(self.heap);
                    }
                }
                Ok(())
            }
            Err(raise) => {
                if let Some(value) = result_value {
                    value.drop_with_heap(self.heap);
                }
                // The foreign frame stays on the stack so the traceback
                // names it; the error path unwinds it.
                let class = self
                    .symtab
                    .class_by_name(&raise.class_name)
                    .filter(|&c| self.symtab.is_exception_class(c))
                    .unwrap_or(CLS_VALUE_ERROR);
                Err(Self::err(class, raise.message))
            }
        }
    }

    /// Builds the exception value a handler binds: the raised instance,
    /// or a fresh instance of the error's class.
    fn exception_value(&mut self, err: &mut RunError) -> Value {
        if let Some(id) = err.instance.take() {
            return Value::Ref(id);
        }
        let message_id = self
            .heap
            .allocate(HeapData::Str(err.message.as_str().into()), false);
        let mut tb_values = Vec::with_capacity(err.traceback.len());
        for line in &err.traceback {
            let id = self.heap.allocate(HeapData::Str(line.as_str().into()), false);
            tb_values.push(Value::Ref(id));
        }
        let elem_sig = self.symtab.class(err.class).props[1].sig;
        let elem_sig = self.symtab.sigs.get(elem_sig).subsigs[0];
        let tb_id = self.heap.allocate(
            HeapData::List(List {
                elem_sig,
                values: tb_values,
            }),
            false,
        );
        let id = self.heap.allocate(
            HeapData::Instance(Instance {
                class: err.class,
                props: vec![Value::Ref(message_id), Value::Ref(tb_id)],
            }),
            true,
        );
        Value::Ref(id)
    }

    /// Walks the try stack for a handler. `Ok` means execution resumes at
    /// the updated cached state; `Err` means the error left the VM.
    fn handle_error(
        &mut self,
        mut err: RunError,
        fault_line: u16,
        func: &mut FunctionId,
        code: &mut &'a [u16],
        base: &mut usize,
        pos: &mut usize,
    ) -> Result<(), RunError> {
        let symtab = self.symtab;
        if err.traceback.is_empty() {
            err.traceback = self.build_traceback(fault_line);
        }
        // A raised instance carries its traceback as a property, filled
        // in at raise time.
        if let Some(id) = err.instance {
            let mut tb_values = Vec::with_capacity(err.traceback.len());
            for line in &err.traceback {
                let line_id = self
                    .heap
                    .allocate(HeapData::Str(line.as_str().into()), false);
                tb_values.push(Value::Ref(line_id));
            }
            let elem_sig = symtab.class(err.class).props[1].sig;
            let elem_sig = symtab.sigs.get(elem_sig).subsigs[0];
            let tb_id = self.heap.allocate(
                HeapData::List(List {
                    elem_sig,
                    values: tb_values,
                }),
                false,
            );
            let HeapData::Instance(inst) = self.heap.get_mut(id) else {
                panic!("Vm: raised value is not an instance");
            };
            let old = std::mem::replace(&mut inst.props[1], Value::Ref(tb_id));
            old.drop_with_heap(self.heap);
        }
        loop {
            let Some(entry) = self.try_stack.pop() else {
                while self.frames.len() > 1 {
                    self.pop_frame_discard();
                }
                if let Some(id) = err.instance.take() {
                    self.heap.dec_ref(id);
                }
                return Err(err);
            };

            while self.frames.len() - 1 > entry.frame_index {
                self.pop_frame_discard();
            }

            let frame_func = self.frames[entry.frame_index].func;
            let frame_base = self.frames[entry.frame_index].base;
            let frame_code: &'a [u16] = &symtab.function(frame_func).native().code;
            let mut catch_pos = entry.catch_pos;
            loop {
                let round = decode(frame_code, catch_pos);
                assert_eq!(
                    round.opcode,
                    Opcode::Except,
                    "try target does not lead to a catch clause"
                );
                let clause_class = ClassId(frame_code[round.special_at]);
                let catch_reg = frame_code[round.special_at + 1];
                let next = frame_code[round.jumps_at] as i16;

                if symtab.class_matches(err.class, clause_class) {
                    if catch_reg == NO_RESULT {
                        if let Some(id) = err.instance.take() {
                            self.heap.dec_ref(id);
                        }
                    } else {
                        let value = self.exception_value(&mut err);
                        self.write_reg(frame_base + catch_reg as usize, value);
                    }
                    *func = frame_func;
                    *code = frame_code;
                    *base = frame_base;
                    *pos = catch_pos + round.round_total;
                    return Ok(());
                }

                if next == 0 {
                    break;
                }
                catch_pos = catch_pos
                    .checked_add_signed(next as isize)
                    .expect("catch chain jump out of range");
            }
        }
    }

    // -- the dispatch loop -------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn exec_loop(&mut self, entry: FunctionId, entry_base: usize) -> RunResult<()> {
        let symtab = self.symtab;
        let mut func = entry;
        let mut code: &'a [u16] = &symtab.function(func).native().code;
        let mut base = entry_base;
        let mut pos = 0usize;

        macro_rules! fault {
            ($round:expr, $err:expr) => {{
                let line = $round.line(code);
                self.handle_error($err, line, &mut func, &mut code, &mut base, &mut pos)?;
                continue;
            }};
        }

        macro_rules! try_op {
            ($round:expr, $expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(err) => fault!($round, err),
                }
            };
        }

        loop {
            let round = decode(code, pos);
            self.tracer.on_instruction(pos, round.opcode);
            let next_pos = round.offset + round.round_total;

            match round.opcode {
                Opcode::Assign | Opcode::RefAssign => {
                    let src = code[round.inputs_at];
                    let dst = code[round.outputs_at];
                    let value = try_op!(round, self.clone_reg(base + src as usize));
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::AnyAssign => {
                    let src = code[round.inputs_at];
                    let dst = code[round.outputs_at];
                    let value = try_op!(round, self.clone_for_any(func, base, src));
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::GetGlobal => {
                    let global = round.special as usize;
                    let dst = code[round.outputs_at];
                    let value = try_op!(round, self.clone_reg(global));
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::SetGlobal => {
                    let global = round.special as usize;
                    let src = code[round.inputs_at];
                    let value = try_op!(round, self.clone_reg(base + src as usize));
                    self.write_reg(global, value);
                }
                Opcode::GetReadonly => {
                    let dst = code[round.outputs_at];
                    let value = self.literal_value(round.special);
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::LoadFunction => {
                    let dst = code[round.outputs_at];
                    self.write_reg(base + dst as usize, Value::Function(FunctionId(round.special)));
                }
                Opcode::LoadClosure => {
                    let dst = code[round.outputs_at];
                    let cells = self.frames.last().and_then(|f| f.cells).expect(
                        "Vm: load_closure without closure cells in the frame",
                    );
                    self.heap.inc_ref(cells);
                    let id = self.heap.allocate(
                        HeapData::Closure(Closure {
                            func: FunctionId(round.special),
                            cells,
                        }),
                        true,
                    );
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }

                Opcode::IntegerAdd
                | Opcode::IntegerMinus
                | Opcode::IntegerMul
                | Opcode::IntegerDiv
                | Opcode::Modulo
                | Opcode::LeftShift
                | Opcode::RightShift
                | Opcode::BitwiseAnd
                | Opcode::BitwiseOr
                | Opcode::BitwiseXor => {
                    let lhs = try_op!(round, self.integer_at(base + code[round.inputs_at] as usize));
                    let rhs =
                        try_op!(round, self.integer_at(base + code[round.inputs_at + 1] as usize));
                    let dst = code[round.outputs_at];
                    let value = match round.opcode {
                        Opcode::IntegerAdd => lhs.wrapping_add(rhs),
                        Opcode::IntegerMinus => lhs.wrapping_sub(rhs),
                        Opcode::IntegerMul => lhs.wrapping_mul(rhs),
                        Opcode::IntegerDiv => {
                            if rhs == 0 {
                                fault!(
                                    round,
                                    Self::err(CLS_DIVIDE_BY_ZERO, "Attempt to divide by zero.")
                                );
                            }
                            lhs.wrapping_div(rhs)
                        }
                        Opcode::Modulo => {
                            if rhs == 0 {
                                fault!(
                                    round,
                                    Self::err(CLS_DIVIDE_BY_ZERO, "Attempt to divide by zero.")
                                );
                            }
                            lhs.wrapping_rem(rhs)
                        }
                        Opcode::LeftShift => lhs.wrapping_shl(rhs as u32 & 63),
                        Opcode::RightShift => lhs.wrapping_shr(rhs as u32 & 63),
                        Opcode::BitwiseAnd => lhs & rhs,
                        Opcode::BitwiseOr => lhs | rhs,
                        Opcode::BitwiseXor => lhs ^ rhs,
                        _ => unreachable!(),
                    };
                    self.write_reg(base + dst as usize, Value::Integer(value));
                }

                Opcode::DoubleAdd | Opcode::DoubleMinus | Opcode::DoubleMul | Opcode::DoubleDiv => {
                    let lhs = try_op!(round, self.number_at(base + code[round.inputs_at] as usize));
                    let rhs =
                        try_op!(round, self.number_at(base + code[round.inputs_at + 1] as usize));
                    let dst = code[round.outputs_at];
                    let value = match round.opcode {
                        Opcode::DoubleAdd => lhs + rhs,
                        Opcode::DoubleMinus => lhs - rhs,
                        Opcode::DoubleMul => lhs * rhs,
                        Opcode::DoubleDiv => {
                            if rhs == 0.0 {
                                fault!(
                                    round,
                                    Self::err(CLS_DIVIDE_BY_ZERO, "Attempt to divide by zero.")
                                );
                            }
                            lhs / rhs
                        }
                        _ => unreachable!(),
                    };
                    self.write_reg(base + dst as usize, Value::Double(value));
                }

                Opcode::StringConcat => {
                    let lhs = try_op!(round, self.str_at(base + code[round.inputs_at] as usize));
                    let rhs =
                        try_op!(round, self.str_at(base + code[round.inputs_at + 1] as usize));
                    let mut text = String::with_capacity(lhs.len() + rhs.len());
                    text.push_str(lhs);
                    text.push_str(rhs);
                    let dst = code[round.outputs_at];
                    let id = self.heap.allocate(HeapData::Str(text.into()), false);
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }

                Opcode::IsEqual
                | Opcode::NotEq
                | Opcode::Less
                | Opcode::LessEq
                | Opcode::Greater
                | Opcode::GreaterEq => {
                    let result =
                        try_op!(round, self.compare(round.opcode, base, code, round.inputs_at));
                    let dst = code[round.outputs_at];
                    self.write_reg(base + dst as usize, Value::Boolean(result));
                }

                Opcode::UnaryNot => {
                    let src = base + code[round.inputs_at] as usize;
                    let value = match &self.regs[src] {
                        Value::Boolean(b) => Value::Boolean(!*b),
                        Value::Nil => {
                            fault!(round, Self::err(CLS_NOVALUE, "Attempt to read a nil value."))
                        }
                        other => panic!("Vm: unary not on {other:?}"),
                    };
                    let dst = code[round.outputs_at];
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::UnaryMinus => {
                    let src = base + code[round.inputs_at] as usize;
                    let value = match &self.regs[src] {
                        Value::Integer(i) => Value::Integer(i.wrapping_neg()),
                        Value::Double(d) => Value::Double(-d),
                        Value::Nil => {
                            fault!(round, Self::err(CLS_NOVALUE, "Attempt to read a nil value."))
                        }
                        other => panic!("Vm: unary minus on {other:?}"),
                    };
                    let dst = code[round.outputs_at];
                    self.write_reg(base + dst as usize, value);
                }

                Opcode::Jump => {
                    let offset = code[round.jumps_at] as i16;
                    pos = pos
                        .checked_add_signed(offset as isize)
                        .expect("jump out of code range");
                    continue;
                }
                Opcode::JumpIf => {
                    let reg = base + code[round.inputs_at] as usize;
                    let truth = try_op!(round, is_truthy(&self.regs[reg]));
                    let jump_on = round.special == 1;
                    if truth == jump_on {
                        let offset = code[round.jumps_at] as i16;
                        pos = pos
                            .checked_add_signed(offset as isize)
                            .expect("jump out of code range");
                        continue;
                    }
                }

                Opcode::ForSetup => {
                    let start_reg = base + code[round.inputs_at] as usize;
                    let end_reg = base + code[round.inputs_at + 1] as usize;
                    let step_reg = base + code[round.inputs_at + 2] as usize;
                    let user_reg = base + code[round.outputs_at] as usize;
                    let start = try_op!(round, self.integer_at(start_reg));
                    let end = try_op!(round, self.integer_at(end_reg));
                    let step = if round.special == 1 {
                        let step = if start <= end { 1 } else { -1 };
                        self.regs[step_reg] = Value::Integer(step);
                        step
                    } else {
                        let step = try_op!(round, self.integer_at(step_reg));
                        if step == 0 {
                            fault!(round, Self::err(CLS_BAD_VALUE, "for loop step cannot be 0."));
                        }
                        step
                    };
                    self.regs[user_reg] = Value::Integer(start);
                    // Pre-step so the first loop pass lands on start.
                    self.regs[start_reg] = Value::Integer(start.wrapping_sub(step));
                }
                Opcode::IntegerFor => {
                    let start_reg = base + code[round.inputs_at] as usize;
                    let end_reg = base + code[round.inputs_at + 1] as usize;
                    let step_reg = base + code[round.inputs_at + 2] as usize;
                    let user_reg = base + code[round.outputs_at] as usize;
                    let current = try_op!(round, self.integer_at(start_reg));
                    let end = try_op!(round, self.integer_at(end_reg));
                    let step = try_op!(round, self.integer_at(step_reg));
                    let next = current.wrapping_add(step);
                    let done = if step > 0 { next > end } else { next < end };
                    if done {
                        let offset = code[round.jumps_at] as i16;
                        pos = pos
                            .checked_add_signed(offset as isize)
                            .expect("jump out of code range");
                        continue;
                    }
                    self.regs[start_reg] = Value::Integer(next);
                    self.write_reg(user_reg, Value::Integer(next));
                }

                Opcode::ReturnVal => {
                    let src = code[round.inputs_at];
                    let value = try_op!(round, self.clone_reg(base + src as usize));
                    if self.frames.len() == 1 {
                        // Returning from the entry function of an
                        // embedder-driven call.
                        self.pop_frame_discard();
                        self.exit_value = Some(value);
                        return Ok(());
                    }
                    let frame = self.pop_frame_discard();
                    let (caller_func, caller_base) = {
                        let caller = self.frames.last().expect("return with no caller frame");
                        (caller.func, caller.base)
                    };
                    if frame.ret_reg != NO_RESULT {
                        self.write_reg(caller_base + frame.ret_reg as usize, value);
                    } else {
                        value.drop_with_heap(self.heap);
                    }
                    func = caller_func;
                    code = &symtab.function(func).native().code;
                    base = caller_base;
                    pos = frame.return_pos;
                    continue;
                }
                Opcode::ReturnNoval => {
                    if self.frames.len() == 1 {
                        self.pop_frame_discard();
                        return Ok(());
                    }
                    let frame = self.pop_frame_discard();
                    let (caller_func, caller_base) = {
                        let caller = self.frames.last().expect("return with no caller frame");
                        (caller.func, caller.base)
                    };
                    func = caller_func;
                    code = &symtab.function(func).native().code;
                    base = caller_base;
                    pos = frame.return_pos;
                    continue;
                }
                Opcode::ReturnExpected => {
                    fault!(
                        round,
                        Self::err(
                            CLS_RETURN_EXPECTED,
                            "Method ended without returning a value.",
                        )
                    );
                }
                Opcode::ReturnFromVm => {
                    return Ok(());
                }

                Opcode::BuildList => {
                    let dst = code[round.outputs_at];
                    let list_sig = self.reg_sig(func, dst);
                    let elem_sig = symtab.sigs.get(list_sig).subsigs[0];
                    let elem_is_any = symtab.sigs.get(elem_sig).class == CLS_ANY;
                    let mut values = Vec::with_capacity(round.inputs as usize);
                    let mut failed = None;
                    for i in 0..round.inputs as usize {
                        let reg = code[round.inputs_at + i];
                        let value = if elem_is_any {
                            self.clone_for_any(func, base, reg)
                        } else {
                            self.clone_reg(base + reg as usize)
                        };
                        match value {
                            Ok(value) => values.push(value),
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    if let Some(err) = failed {
                        for value in values {
                            value.drop_with_heap(self.heap);
                        }
                        fault!(round, err);
                    }
                    let tagged = symtab.sigs.get(list_sig).may_circle();
                    let id = self
                        .heap
                        .allocate(HeapData::List(List { elem_sig, values }), tagged);
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }

                Opcode::BuildHash => {
                    let dst = code[round.outputs_at];
                    let hash_sig = self.reg_sig(func, dst);
                    let value_sig = symtab.sigs.get(hash_sig).subsigs[1];
                    let value_is_any = symtab.sigs.get(value_sig).class == CLS_ANY;
                    let mut hash = LilyHash::new();
                    let mut failed = None;
                    for i in (0..round.inputs as usize).step_by(2) {
                        let key_reg = base + code[round.inputs_at + i] as usize;
                        let value_reg = code[round.inputs_at + i + 1];
                        let key = match self.hash_key_at(key_reg) {
                            Ok(key) => key,
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        };
                        let value = if value_is_any {
                            self.clone_for_any(func, base, value_reg)
                        } else {
                            self.clone_reg(base + value_reg as usize)
                        };
                        match value {
                            Ok(value) => {
                                if let Some(old) = hash.insert(key, value) {
                                    old.drop_with_heap(self.heap);
                                }
                            }
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    if let Some(err) = failed {
                        for value in hash.drain_values() {
                            value.drop_with_heap(self.heap);
                        }
                        fault!(round, err);
                    }
                    let tagged = symtab.sigs.get(hash_sig).may_circle();
                    let id = self.heap.allocate(HeapData::Hash(hash), tagged);
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }

                Opcode::BuildTuple => {
                    let dst = code[round.outputs_at];
                    let tuple_sig = self.reg_sig(func, dst);
                    let mut values = Vec::with_capacity(round.inputs as usize);
                    let mut failed = None;
                    for i in 0..round.inputs as usize {
                        let reg = code[round.inputs_at + i];
                        match self.clone_reg(base + reg as usize) {
                            Ok(value) => values.push(value),
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    if let Some(err) = failed {
                        for value in values {
                            value.drop_with_heap(self.heap);
                        }
                        fault!(round, err);
                    }
                    let tagged = symtab.sigs.get(tuple_sig).may_circle();
                    let id = self.heap.allocate(
                        HeapData::Tuple(Tuple {
                            sig: tuple_sig,
                            values,
                        }),
                        tagged,
                    );
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }

                Opcode::BuildVariant => {
                    let class = ClassId(code[round.special_at]);
                    let variant = code[round.special_at + 1];
                    let dst = code[round.outputs_at];
                    let mut args = Vec::with_capacity(round.inputs as usize);
                    let mut failed = None;
                    for i in 0..round.inputs as usize {
                        let reg = code[round.inputs_at + i];
                        match self.clone_reg(base + reg as usize) {
                            Ok(value) => args.push(value),
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    if let Some(err) = failed {
                        for value in args {
                            value.drop_with_heap(self.heap);
                        }
                        fault!(round, err);
                    }
                    let id = self.heap.allocate(
                        HeapData::Variant(Variant {
                            class,
                            variant,
                            args,
                        }),
                        true,
                    );
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }

                Opcode::GetItem => {
                    let container = base + code[round.inputs_at] as usize;
                    let index = base + code[round.inputs_at + 1] as usize;
                    let dst = code[round.outputs_at];
                    let value = try_op!(round, self.get_item(container, index));
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::SetItem => {
                    let container = base + code[round.inputs_at] as usize;
                    let index = base + code[round.inputs_at + 1] as usize;
                    let value_reg = code[round.inputs_at + 2];
                    try_op!(round, self.set_item(base, container, index, value_reg));
                }

                Opcode::GetProperty => {
                    let obj = base + code[round.inputs_at] as usize;
                    let dst = code[round.outputs_at];
                    let value = try_op!(round, self.get_property(obj, round.special));
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::SetProperty => {
                    let obj = base + code[round.inputs_at] as usize;
                    let value_reg = base + code[round.inputs_at + 1] as usize;
                    let value = try_op!(round, self.clone_reg(value_reg));
                    let Value::Ref(id) = &self.regs[obj] else {
                        value.drop_with_heap(self.heap);
                        fault!(round, Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
                    };
                    let id = *id;
                    let HeapData::Instance(inst) = self.heap.get_mut(id) else {
                        panic!("Vm: set_property on a non-instance");
                    };
                    let old = std::mem::replace(&mut inst.props[round.special as usize], value);
                    old.drop_with_heap(self.heap);
                }

                Opcode::AnyTypecast => {
                    let src = base + code[round.inputs_at] as usize;
                    let dst = code[round.outputs_at];
                    let want = self.reg_sig(func, dst);
                    let value = try_op!(round, self.any_typecast(src, want));
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::IntDblTypecast => {
                    let src = base + code[round.inputs_at] as usize;
                    let dst = code[round.outputs_at];
                    let value = match &self.regs[src] {
                        Value::Integer(i) => Value::Double(*i as f64),
                        Value::Double(d) => Value::Integer(*d as i64),
                        Value::Nil => {
                            fault!(round, Self::err(CLS_NOVALUE, "Attempt to read a nil value."))
                        }
                        other => panic!("Vm: int/double cast on {other:?}"),
                    };
                    self.write_reg(base + dst as usize, value);
                }

                Opcode::CallReadonly => {
                    let callee = FunctionId(round.special);
                    let argc = round.counter as usize;
                    let arg_regs: Vec<u16> =
                        code[round.inputs_at..round.inputs_at + argc].to_vec();
                    let ret_reg = code[round.outputs_at];
                    let line = round.line(code);
                    let pushed = try_op!(
                        round,
                        self.begin_call(
                            func, base, callee, None, &arg_regs, ret_reg, next_pos, line,
                        )
                    );
                    if pushed {
                        let frame = self.frames.last().expect("call pushed a frame");
                        func = frame.func;
                        code = &symtab.function(func).native().code;
                        base = frame.base;
                        pos = 0;
                        continue;
                    }
                }
                Opcode::CallRegister => {
                    let callee_reg = base + round.special as usize;
                    let argc = round.counter as usize;
                    let arg_regs: Vec<u16> =
                        code[round.inputs_at..round.inputs_at + argc].to_vec();
                    let ret_reg = code[round.outputs_at];
                    let line = round.line(code);
                    let (callee, cells) = match &self.regs[callee_reg] {
                        Value::Function(id) => (*id, None),
                        Value::Ref(id) => match self.heap.get(*id) {
                            HeapData::Closure(closure) => (closure.func, Some(closure.cells)),
                            other => panic!("Vm: call through a non-function ({other:?})"),
                        },
                        Value::Nil => {
                            fault!(round, Self::err(CLS_NOVALUE, "Attempt to read a nil value."))
                        }
                        other => panic!("Vm: call through a non-function ({other:?})"),
                    };
                    let pushed = try_op!(
                        round,
                        self.begin_call(
                            func, base, callee, cells, &arg_regs, ret_reg, next_pos, line,
                        )
                    );
                    if pushed {
                        let frame = self.frames.last().expect("call pushed a frame");
                        func = frame.func;
                        code = &symtab.function(func).native().code;
                        base = frame.base;
                        pos = 0;
                        continue;
                    }
                }

                Opcode::NewInstance => {
                    let class = ClassId(round.special);
                    let dst = code[round.outputs_at];
                    let prop_count = symtab.class(class).props.len();
                    let props = (0..prop_count).map(|_| Value::Nil).collect();
                    let id = self
                        .heap
                        .allocate(HeapData::Instance(Instance { class, props }), true);
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }

                Opcode::PushTry => {
                    let offset = code[round.jumps_at] as i16;
                    let catch_pos = pos
                        .checked_add_signed(offset as isize)
                        .expect("try target out of code range");
                    self.try_stack.push(TryEntry {
                        frame_index: self.frames.len() - 1,
                        catch_pos,
                    });
                }
                Opcode::PopTry => {
                    self.try_stack.pop().expect("pop_try with no try entry");
                }
                Opcode::Raise => {
                    let src = base + code[round.inputs_at] as usize;
                    let err = match &self.regs[src] {
                        Value::Ref(id) => {
                            let HeapData::Instance(inst) = self.heap.get(*id) else {
                                panic!("Vm: raise of a non-instance");
                            };
                            let message = match inst.props.first() {
                                Some(Value::Ref(msg_id)) => match self.heap.get(*msg_id) {
                                    HeapData::Str(s) => s.to_string(),
                                    _ => String::new(),
                                },
                                _ => String::new(),
                            };
                            self.heap.inc_ref(*id);
                            let mut err = RunError::new(inst.class, message);
                            err.instance = Some(*id);
                            err
                        }
                        Value::Nil => Self::err(CLS_NOVALUE, "Attempt to read a nil value."),
                        other => panic!("Vm: raise of a non-instance ({other:?})"),
                    };
                    fault!(round, err);
                }
                Opcode::Except => {
                    unreachable!("except clauses are only entered through exception dispatch");
                }

                Opcode::ClosureNew => {
                    let count = round.special as usize;
                    let dst = code[round.outputs_at];
                    let cells = (0..count).map(|_| Value::Nil).collect();
                    let id = self.heap.allocate(HeapData::CellArray(cells), true);
                    self.frames
                        .last_mut()
                        .expect("closure_new inside a frame")
                        .cells = Some(id);
                    self.write_reg(base + dst as usize, Value::Ref(id));
                }
                Opcode::ClosureSet => {
                    let spot = round.special;
                    let src = code[round.inputs_at];
                    let value = self.regs[base + src as usize].clone_with_heap(self.heap);
                    let cells_id = self
                        .frames
                        .last()
                        .and_then(|f| f.cells)
                        .expect("closure_set without cells");
                    let HeapData::CellArray(cells) = self.heap.get_mut(cells_id) else {
                        panic!("Vm: closure cells are not a cell array");
                    };
                    let old = std::mem::replace(&mut cells[spot as usize], value);
                    old.drop_with_heap(self.heap);
                    self.tracer.on_cell_store(spot);
                }
                Opcode::ClosureGet => {
                    let spot = round.special;
                    let dst = code[round.outputs_at];
                    let cells_id = self
                        .frames
                        .last()
                        .and_then(|f| f.cells)
                        .expect("closure_get without cells");
                    let HeapData::CellArray(cells) = self.heap.get(cells_id) else {
                        panic!("Vm: closure cells are not a cell array");
                    };
                    let value = cells[spot as usize].clone_with_heap(self.heap);
                    self.write_reg(base + dst as usize, value);
                    self.tracer.on_cell_load(spot);
                }

                Opcode::MatchDispatch => {
                    let src = base + code[round.inputs_at] as usize;
                    let variant = match &self.regs[src] {
                        Value::Ref(id) => match self.heap.get(*id) {
                            HeapData::Variant(v) => v.variant,
                            other => panic!("Vm: match on a non-variant ({other:?})"),
                        },
                        Value::Nil => {
                            fault!(round, Self::err(CLS_NOVALUE, "Attempt to read a nil value."))
                        }
                        other => panic!("Vm: match on a non-variant ({other:?})"),
                    };
                    let offset = code[round.jumps_at + variant as usize] as i16;
                    pos = pos
                        .checked_add_signed(offset as isize)
                        .expect("match jump out of code range");
                    continue;
                }
                Opcode::VariantDecompose => {
                    let src = base + code[round.inputs_at] as usize;
                    let Value::Ref(id) = &self.regs[src] else {
                        fault!(round, Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
                    };
                    let id = *id;
                    for i in 0..round.outputs as usize {
                        let value = {
                            let HeapData::Variant(v) = self.heap.get(id) else {
                                panic!("Vm: decompose of a non-variant");
                            };
                            v.args[i].clone_with_heap(self.heap)
                        };
                        let dst = code[round.outputs_at + i];
                        self.write_reg(base + dst as usize, value);
                    }
                }

                Opcode::Show => {
                    let src = code[round.inputs_at];
                    let sig = self.reg_sig(func, src);
                    self.msgbuf.reset();
                    self.msgbuf.add("show: (").add_sig(symtab, sig).add(") ");
                    let mut text = String::new();
                    render_value(self.heap, symtab, &self.regs[base + src as usize], &mut text);
                    self.msgbuf.add(&text).add_char('\n');
                    let line = self.msgbuf.flush();
                    self.print.print(&line);
                }

                Opcode::PackageGet => {
                    let package = round.special as usize;
                    let var = code[round.special_at + 1] as usize;
                    let dst = code[round.outputs_at];
                    let value = self.package_values[package][var].clone_with_heap(self.heap);
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::PackageSet => {
                    let package = round.special as usize;
                    let var = code[round.special_at + 1] as usize;
                    let src = code[round.inputs_at];
                    let value = try_op!(round, self.clone_reg(base + src as usize));
                    let old = std::mem::replace(&mut self.package_values[package][var], value);
                    old.drop_with_heap(self.heap);
                }
                Opcode::PackageGetDeep => {
                    let sub = code[round.special_at + 1] as usize;
                    let var = code[round.special_at + 2] as usize;
                    let dst = code[round.outputs_at];
                    let value = self.package_values[sub][var].clone_with_heap(self.heap);
                    self.write_reg(base + dst as usize, value);
                }
                Opcode::PackageSetDeep => {
                    let sub = code[round.special_at + 1] as usize;
                    let var = code[round.special_at + 2] as usize;
                    let src = code[round.inputs_at];
                    let value = try_op!(round, self.clone_reg(base + src as usize));
                    let old = std::mem::replace(&mut self.package_values[sub][var], value);
                    old.drop_with_heap(self.heap);
                }
            }

            self.maybe_gc();
            pos = next_pos;
        }
    }

    // -- op bodies that read containers ------------------------------------

    fn compare(
        &mut self,
        opcode: Opcode,
        base: usize,
        code: &[u16],
        inputs_at: usize,
    ) -> RunResult<bool> {
        let lhs = base + code[inputs_at] as usize;
        let rhs = base + code[inputs_at + 1] as usize;
        if self.regs[lhs].is_nil() || self.regs[rhs].is_nil() {
            return Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
        }
        let ordering = match (&self.regs[lhs], &self.regs[rhs]) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Ref(a), Value::Ref(b)) => {
                match (self.heap.get(*a), self.heap.get(*b)) {
                    (HeapData::Str(x), HeapData::Str(y)) => x.partial_cmp(y),
                    _ => None,
                }
            }
            _ => None,
        };
        let result = match (opcode, ordering) {
            (Opcode::Less, Some(o)) => o.is_lt(),
            (Opcode::LessEq, Some(o)) => o.is_le(),
            (Opcode::Greater, Some(o)) => o.is_gt(),
            (Opcode::GreaterEq, Some(o)) => o.is_ge(),
            (Opcode::IsEqual, Some(o)) => o.is_eq(),
            (Opcode::NotEq, Some(o)) => o.is_ne(),
            // Structural equality for same-signature values.
            (Opcode::IsEqual, None) => value_eq(self.heap, &self.regs[lhs], &self.regs[rhs]),
            (Opcode::NotEq, None) => !value_eq(self.heap, &self.regs[lhs], &self.regs[rhs]),
            (op, None) => panic!("Vm: unordered comparison for {op:?}"),
            _ => unreachable!(),
        };
        Ok(result)
    }

    fn hash_key_at(&self, index: usize) -> RunResult<HashKey> {
        match &self.regs[index] {
            Value::Integer(i) => Ok(HashKey::Integer(*i)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Str(s) => Ok(HashKey::Str(s.clone())),
                other => panic!("Vm: hash key of unexpected shape ({other:?})"),
            },
            Value::Nil => Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value.")),
            other => panic!("Vm: hash key of unexpected shape ({other:?})"),
        }
    }

    fn get_item(&mut self, container: usize, index: usize) -> RunResult<Value> {
        let Value::Ref(id) = &self.regs[container] else {
            return Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
        };
        let id = *id;
        match self.heap.get(id) {
            HeapData::List(_) | HeapData::Tuple(_) => {
                let i = self.integer_at(index)?;
                let values = match self.heap.get(id) {
                    HeapData::List(list) => &list.values,
                    HeapData::Tuple(tuple) => &tuple.values,
                    _ => unreachable!(),
                };
                // Negative indices are rejected rather than wrapped.
                if i < 0 || i as usize >= values.len() {
                    return Err(Self::err(
                        CLS_OUT_OF_RANGE,
                        format!("Subscript index {i} is out of range."),
                    ));
                }
                Ok(values[i as usize].clone_with_heap(self.heap))
            }
            HeapData::Hash(_) => {
                let key = self.hash_key_at(index)?;
                let HeapData::Hash(hash) = self.heap.get(id) else {
                    unreachable!()
                };
                match hash.get(&key) {
                    Some(value) => Ok(value.clone_with_heap(self.heap)),
                    None => Err(Self::err(CLS_KEY, "Hash does not have the given key.")),
                }
            }
            other => panic!("Vm: subscript of unexpected shape ({other:?})"),
        }
    }

    fn set_item(
        &mut self,
        base: usize,
        container: usize,
        index: usize,
        value_reg: u16,
    ) -> RunResult<()> {
        let Value::Ref(id) = &self.regs[container] else {
            return Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
        };
        let id = *id;
        match self.heap.get(id) {
            HeapData::List(list) => {
                let len = list.values.len();
                let i = self.integer_at(index)?;
                // Negative indices are rejected rather than wrapped.
                if i < 0 || i as usize >= len {
                    return Err(Self::err(
                        CLS_OUT_OF_RANGE,
                        format!("Subscript index {i} is out of range."),
                    ));
                }
                let value = self.clone_reg(base + value_reg as usize)?;
                let HeapData::List(list) = self.heap.get_mut(id) else {
                    unreachable!()
                };
                let old = std::mem::replace(&mut list.values[i as usize], value);
                old.drop_with_heap(self.heap);
                Ok(())
            }
            HeapData::Tuple(_) => {
                let i = self.integer_at(index)?;
                let value = self.clone_reg(base + value_reg as usize)?;
                let HeapData::Tuple(tuple) = self.heap.get_mut(id) else {
                    unreachable!()
                };
                if i < 0 || i as usize >= tuple.values.len() {
                    value.drop_with_heap(self.heap);
                    return Err(Self::err(
                        CLS_OUT_OF_RANGE,
                        format!("Subscript index {i} is out of range."),
                    ));
                }
                let old = std::mem::replace(&mut tuple.values[i as usize], value);
                old.drop_with_heap(self.heap);
                Ok(())
            }
            HeapData::Hash(_) => {
                // The emitter already coerced the value to the hash's
                // value signature, so a plain clone is correct here.
                let key = self.hash_key_at(index)?;
                let value = self.clone_reg(base + value_reg as usize)?;
                let HeapData::Hash(hash) = self.heap.get_mut(id) else {
                    unreachable!()
                };
                if let Some(old) = hash.insert(key, value) {
                    old.drop_with_heap(self.heap);
                }
                Ok(())
            }
            other => panic!("Vm: subscript assign of unexpected shape ({other:?})"),
        }
    }

    fn get_property(&mut self, obj: usize, index: u16) -> RunResult<Value> {
        let Value::Ref(id) = &self.regs[obj] else {
            return Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
        };
        let HeapData::Instance(inst) = self.heap.get(*id) else {
            panic!("Vm: property read on a non-instance");
        };
        Ok(inst.props[index as usize].clone_with_heap(self.heap))
    }

    fn any_typecast(&mut self, src: usize, want: SigId) -> RunResult<Value> {
        let Value::Ref(id) = &self.regs[src] else {
            return Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
        };
        let HeapData::Any(any) = self.heap.get(*id) else {
            panic!("Vm: any typecast on a non-any value");
        };
        if any.value.is_nil() {
            return Err(Self::err(CLS_NOVALUE, "Attempt to read a nil value."));
        }
        if any.sig != want {
            let mut have_name = String::new();
            self.symtab.write_sig_name(&mut have_name, any.sig);
            let mut want_name = String::new();
            self.symtab.write_sig_name(&mut want_name, want);
            return Err(Self::err(
                CLS_BAD_CAST,
                format!("Cannot cast Any containing type '{have_name}' to type '{want_name}'."),
            ));
        }
        Ok(any.value.clone_with_heap(self.heap))
    }
}
