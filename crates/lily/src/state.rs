//! The embedding API: one interpreter state and its entry points.
//!
//! A [`State`] wraps everything a run needs — symbol table, emitter, heap,
//! the global register window, literal and package value caches — and
//! exposes the parse/exec calls, the foreign-call value stack, and package
//! registration. Every public entry installs a protected frame on the
//! raiser: no error escapes as anything but a recorded [`LilyError`].

use std::{any::Any, fs::File, io::BufReader};

use ahash::AHashMap;

use crate::{
    dynaload::{self, SeedLoader},
    emit::Emitter,
    heap::{GcStats, Heap},
    io::{PrintWriter, StdPrint},
    lexer::{Lexer, ParseMode, Source},
    opcode::{NO_RESULT, Opcode},
    parser::Parser,
    raiser::{ErrorClass, LilyError, Raise, Raiser},
    symtab::{CLS_EXCEPTION, CLS_STRING, ClassId, Symtab, VarKind},
    tracer::{NoopTracer, VmTracer},
    value::{
        ForeignFn, ForeignRaise, FuncBody, FunctionId, FunctionVal, HeapData, List, NativeFunc,
        RegInfo, Value, render_value,
    },
    vm::{DEFAULT_RECURSION_LIMIT, ForeignCall, Vm},
};

/// Recognized interpreter settings, with the defaults the runners use.
pub struct Options {
    /// Tagged-object count that triggers the first collection pass.
    pub gc_start: u32,
    /// Growth factor applied to the threshold after each pass.
    pub gc_multiplier: u32,
    /// Arguments surfaced as `sys.argv`.
    pub argv: Vec<String>,
    /// Receives page text in tag mode. Defaults to the print writer.
    pub html_sender: Option<Box<dyn FnMut(&str)>>,
    /// Opaque embedder payload, reachable from foreign functions through
    /// the state.
    pub data: Option<Box<dyn Any>>,
    /// When false, the `sys` package is suppressed entirely.
    pub allow_sys: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            gc_start: 100,
            gc_multiplier: 2,
            argv: Vec::new(),
            html_sender: None,
            data: None,
            allow_sys: true,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("gc_start", &self.gc_start)
            .field("gc_multiplier", &self.gc_multiplier)
            .field("argv", &self.argv)
            .field("allow_sys", &self.allow_sys)
            .finish_non_exhaustive()
    }
}

/// One interpreter. Not thread-safe; one state is one cooperative
/// execution.
pub struct State {
    symtab: Symtab,
    emitter: Emitter,
    heap: Heap,
    /// The global register file; `__main__`'s window starts at zero.
    regs: Vec<Value>,
    lit_values: Vec<Option<Value>>,
    package_values: Vec<Vec<Value>>,
    /// Values pushed by the embedder; GC roots until consumed.
    foreign_stack: Vec<Value>,
    raiser: Raiser,
    options: Options,
    recursion_limit: usize,
    prepared: Option<FunctionId>,
    cid_tables: AHashMap<String, Vec<u16>>,
}

impl State {
    pub fn new(options: Options) -> Self {
        let mut symtab = Symtab::new();
        let emitter = Emitter::new(&mut symtab);
        let mut heap = Heap::new(options.gc_start, options.gc_multiplier);

        seed_exception_constructors(&mut symtab);
        let mut package_values = Vec::new();

        // The core package: `print` as a global function.
        dynaload::materialize(&mut symtab, "core", CORE_SEED, core_loader, true)
            .expect("core seed is well-formed");

        // sys: argv behind the allow_sys switch.
        if options.allow_sys {
            let loaded = dynaload::materialize(&mut symtab, "sys", SYS_SEED, sys_loader, false)
                .expect("sys seed is well-formed");
            let package = loaded.package.expect("sys declares vars") as usize;
            package_values.resize_with(symtab.package_count(), Vec::new);
            let argv_values: Vec<Value> = options
                .argv
                .iter()
                .map(|arg| {
                    let id = heap.allocate(HeapData::Str(arg.as_str().into()), false);
                    Value::Ref(id)
                })
                .collect();
            let string_sig = symtab.sig_for_class(CLS_STRING);
            let argv_id = heap.allocate(
                HeapData::List(List {
                    elem_sig: string_sig,
                    values: argv_values,
                }),
                false,
            );
            package_values[package] = vec![Value::Ref(argv_id)];
        }

        Self {
            symtab,
            emitter,
            heap,
            regs: Vec::new(),
            lit_values: Vec::new(),
            package_values,
            foreign_stack: Vec::new(),
            raiser: Raiser::new(),
            options,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            prepared: None,
            cid_tables: AHashMap::new(),
        }
    }

    /// The last error of a failed call, formatted per
    /// `ErrorClass: message` plus `Where:`/`Traceback:`.
    pub fn get_error(&self) -> Option<&LilyError> {
        self.raiser.error()
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    /// Forces one collection pass over the tagged set, with every global,
    /// cached literal, package var, and pushed value as a root.
    pub fn collect_garbage(&mut self) {
        let roots = self
            .regs
            .iter()
            .chain(self.lit_values.iter().filter_map(Option::as_ref))
            .chain(self.package_values.iter().flatten())
            .chain(self.foreign_stack.iter());
        self.heap.collect(roots);
    }

    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.recursion_limit = limit.max(1);
    }

    pub fn data(&mut self) -> Option<&mut Box<dyn Any>> {
        self.options.data.as_mut()
    }

    // -- package registration ----------------------------------------------

    /// Registers a package from its dynaload seed. Classes, methods,
    /// functions, and vars declared by the seed materialize into the type
    /// system; the returned class ids are kept in the package's cid
    /// table.
    pub fn register_package(&mut self, name: &str, seed: &[&str], loader: SeedLoader) -> bool {
        match dynaload::materialize(&mut self.symtab, name, seed, loader, false) {
            Ok(loaded) => {
                self.cid_tables.insert(name.to_string(), loaded.cid_table);
                self.package_values
                    .resize_with(self.symtab.package_count(), Vec::new);
                if let Some(package) = loaded.package {
                    self.package_values[package as usize] =
                        (0..loaded.var_count).map(|_| Value::Nil).collect();
                }
                true
            }
            Err(raise) => {
                self.raiser.set_static(&raise, name);
                false
            }
        }
    }

    /// Runtime class ids a package declared, in seed order.
    pub fn class_id_table(&self, package: &str) -> Option<&[u16]> {
        self.cid_tables.get(package).map(Vec::as_slice)
    }

    // -- parse / run -------------------------------------------------------

    pub fn parse_string(&mut self, label: &str, mode: ParseMode, text: &str) -> bool {
        self.parse_string_to(label, mode, text, &mut StdPrint)
    }

    pub fn parse_string_to(
        &mut self,
        label: &str,
        mode: ParseMode,
        text: &str,
        print: &mut impl PrintWriter,
    ) -> bool {
        let source = Source::Text {
            text: text.to_string(),
            offset: 0,
        };
        self.parse_source(label, mode, source, print, &mut NoopTracer)
    }

    /// Like [`parse_string_to`](Self::parse_string_to), with an execution
    /// tracer observing the run.
    pub fn parse_string_traced(
        &mut self,
        label: &str,
        mode: ParseMode,
        text: &str,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> bool {
        let source = Source::Text {
            text: text.to_string(),
            offset: 0,
        };
        self.parse_source(label, mode, source, print, tracer)
    }

    pub fn parse_file(&mut self, mode: ParseMode, path: &str) -> bool {
        self.parse_file_to(mode, path, &mut StdPrint)
    }

    pub fn parse_file_to(
        &mut self,
        mode: ParseMode,
        path: &str,
        print: &mut impl PrintWriter,
    ) -> bool {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                let raise = Raise::new(ErrorClass::IOError, err.to_string(), 0);
                self.raiser.set_static(&raise, path);
                return false;
            }
        };
        self.parse_source(
            path,
            mode,
            Source::File(BufReader::new(file)),
            print,
            &mut NoopTracer,
        )
    }

    /// Embedding callback input: the lexer pulls chunks on demand until
    /// the callback returns `None`.
    pub fn parse_callback_to(
        &mut self,
        label: &str,
        mode: ParseMode,
        next: Box<dyn FnMut() -> Option<String>>,
        print: &mut impl PrintWriter,
    ) -> bool {
        self.parse_source(label, mode, Source::Callback(next), print, &mut NoopTracer)
    }

    /// REPL accumulation: each chunk compiles and runs against the same
    /// globals.
    pub fn parse_chunk(&mut self, text: &str) -> bool {
        self.parse_chunk_to(text, &mut StdPrint)
    }

    pub fn parse_chunk_to(&mut self, text: &str, print: &mut impl PrintWriter) -> bool {
        self.parse_string_to("<chunk>", ParseMode::NoTags, text, print)
    }

    /// Template execution: tag mode over a string or file.
    pub fn exec_template_string(&mut self, label: &str, text: &str) -> bool {
        self.parse_string(label, ParseMode::Tags, text)
    }

    pub fn exec_template_file(&mut self, path: &str) -> bool {
        self.parse_file(ParseMode::Tags, path)
    }

    fn parse_source(
        &mut self,
        label: &str,
        mode: ParseMode,
        source: Source,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> bool {
        self.raiser.clear();
        self.raiser.push_frame(0);
        let ok = self.parse_and_exec(label, mode, source, print, tracer);
        self.raiser.pop_frame();
        ok
    }

    fn parse_and_exec(
        &mut self,
        label: &str,
        mode: ParseMode,
        source: Source,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> bool {
        let lexer = Lexer::new(source, mode);
        let compile_result = {
            let Self {
                symtab,
                emitter,
                options,
                ..
            } = self;
            let mut default_sender = |text: &str| print.print(text);
            let html: &mut dyn FnMut(&str) = match options.html_sender.as_mut() {
                Some(sender) => sender.as_mut(),
                None => &mut default_sender,
            };
            let parse_result = {
                let mut parser = Parser::new(lexer, emitter, symtab, html, label);
                parser.parse()
            };
            parse_result.and_then(|()| emitter.finalize_main(symtab))
        };
        if let Err(raise) = compile_result {
            self.emitter.reset_after_error();
            self.raiser.set_static(&raise, label);
            return false;
        }

        let main = self.emitter.main_func();
        let reg_count = self.symtab.function(main).native().reg_count as usize;
        while self.regs.len() < reg_count {
            self.regs.push(Value::Nil);
        }
        self.run_function_traced(main, 0, print, tracer)
    }

    fn run_function_traced(
        &mut self,
        func: FunctionId,
        base: usize,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> bool {
        let recursion_limit = self.recursion_limit;
        let run_result = {
            let Self {
                symtab,
                heap,
                regs,
                lit_values,
                package_values,
                foreign_stack,
                ..
            } = self;
            let mut vm = Vm::new(
                symtab,
                heap,
                regs,
                lit_values,
                package_values,
                foreign_stack,
                print,
                tracer,
                recursion_limit,
            );
            let result = vm.run(func, base, NO_RESULT);
            (result, vm.take_exit_value())
        };
        match run_result {
            (Ok(()), exit_value) => {
                if let Some(value) = exit_value {
                    // Root the call result on the foreign stack so the
                    // collector sees it until the embedder takes it.
                    self.foreign_stack.push(value);
                }
                true
            }
            (Err(err), _) => {
                let class_name = self.symtab.class(err.class).name.to_string();
                self.raiser.set_runtime(&class_name, &err);
                false
            }
        }
    }

    // -- the foreign-call value stack --------------------------------------

    pub fn push_integer(&mut self, value: i64) {
        self.foreign_stack.push(Value::Integer(value));
    }

    pub fn push_double(&mut self, value: f64) {
        self.foreign_stack.push(Value::Double(value));
    }

    pub fn push_boolean(&mut self, value: bool) {
        self.foreign_stack.push(Value::Boolean(value));
    }

    pub fn push_string(&mut self, value: &str) {
        let id = self.heap.allocate(HeapData::Str(value.into()), false);
        self.foreign_stack.push(Value::Ref(id));
    }

    pub fn push_bytestring(&mut self, value: &[u8]) {
        let id = self.heap.allocate(HeapData::Bytes(value.into()), false);
        self.foreign_stack.push(Value::Ref(id));
    }

    pub fn push_nil(&mut self) {
        self.foreign_stack.push(Value::Nil);
    }

    /// Drops every pushed value.
    pub fn clear_stack(&mut self) {
        for value in std::mem::take(&mut self.foreign_stack) {
            value.drop_with_heap(&mut self.heap);
        }
    }

    /// Looks up a global method by name for a host-driven call.
    pub fn prepare_call(&mut self, name: &str) -> bool {
        let Some(var_id) = self.symtab.find_var(name) else {
            return false;
        };
        let VarKind::Readonly(func) = self.symtab.var(var_id).kind else {
            return false;
        };
        if !matches!(self.symtab.function(func).body, FuncBody::Native(_)) {
            return false;
        }
        self.prepared = Some(func);
        true
    }

    /// Calls the prepared method with the pushed values as arguments,
    /// leaving the return value (if any) on the stack.
    pub fn exec_prepared(&mut self) -> bool {
        self.exec_prepared_to(&mut StdPrint)
    }

    pub fn exec_prepared_to(&mut self, print: &mut impl PrintWriter) -> bool {
        self.raiser.clear();
        let Some(func) = self.prepared else {
            let raise = Raise::new(ErrorClass::BadValue, "No call has been prepared.", 0);
            self.raiser.set_static(&raise, "<call>");
            return false;
        };
        let native = self.symtab.function(func).native();
        let param_count = native.param_count as usize;
        if self.foreign_stack.len() != param_count {
            let raise = Raise::new(
                ErrorClass::BadValue,
                format!(
                    "Prepared call takes {} arguments, but {} were pushed.",
                    param_count,
                    self.foreign_stack.len()
                ),
                0,
            );
            self.raiser.set_static(&raise, "<call>");
            return false;
        }

        self.raiser.push_frame(0);
        let base = self.regs.len();
        // Argument ownership moves from the stack into the window.
        let args: Vec<Value> = self.foreign_stack.drain(..).collect();
        self.regs.extend(args);
        for _ in param_count..self.symtab.function(func).native().reg_count as usize {
            self.regs.push(Value::Nil);
        }
        let ok = self.run_function_traced(func, base, print, &mut NoopTracer);
        // The callee window was torn down by the return or error path;
        // drop any padding left above base.
        while self.regs.len() > base {
            let value = self.regs.pop().expect("length checked");
            value.drop_with_heap(&mut self.heap);
        }
        self.raiser.pop_frame();
        ok
    }

    /// Reads the value a prepared call left on the stack.
    pub fn result_integer(&self) -> Option<i64> {
        match self.foreign_stack.last() {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn result_double(&self) -> Option<f64> {
        match self.foreign_stack.last() {
            Some(Value::Double(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn result_boolean(&self) -> Option<bool> {
        match self.foreign_stack.last() {
            Some(Value::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    /// Renders whatever the call returned, the way `print` would.
    pub fn result_render(&self) -> Option<String> {
        let value = self.foreign_stack.last()?;
        let mut text = String::new();
        render_value(&self.heap, &self.symtab, value, &mut text);
        Some(text)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        // Windows and the foreign stack hold owned references; release
        // them so the heap's refcount bookkeeping stays balanced.
        for value in std::mem::take(&mut self.regs) {
            value.drop_with_heap(&mut self.heap);
        }
        for value in std::mem::take(&mut self.foreign_stack) {
            value.drop_with_heap(&mut self.heap);
        }
    }
}

// -- the core and sys seeds ------------------------------------------------

const CORE_SEED: &[&str] = &["F print (Any)", "Z"];

fn builtin_print(ctx: &mut ForeignCall<'_>) -> Result<(), ForeignRaise> {
    let mut text = ctx.render_arg(0)?;
    text.push('\n');
    ctx.print(&text);
    Ok(())
}

fn core_loader(name: &str) -> Option<ForeignFn> {
    match name {
        "print" => Some(builtin_print),
        _ => None,
    }
}

const SYS_SEED: &[&str] = &["R argv List[String]", "Z"];

fn sys_loader(_name: &str) -> Option<ForeignFn> {
    None
}

/// Gives the exception hierarchy its callable surface: a shared
/// `Exception` body initializer plus a constructor per builtin class, so
/// `raise ValueError("x")` and user subclasses both work.
fn seed_exception_constructors(symtab: &mut Symtab) {
    let string_sig = symtab.sig_for_class(CLS_STRING);
    let exc_sig = symtab.sig_for_class(CLS_EXCEPTION);
    let list_string = symtab.list_sig(string_sig);
    let unit = symtab.sig_for_class(crate::symtab::CLS_UNIT);

    // Exception.new(self, message): message lands in the first property,
    // the traceback starts empty and fills at raise time.
    let init_sig = symtab.function_sig(unit, &[exc_sig, string_sig], false);
    let init_code: Vec<u16> = vec![
        Opcode::SetProperty as u16,
        0,
        0,
        1,
        0,
        Opcode::BuildList as u16,
        0,
        2,
        0,
        Opcode::SetProperty as u16,
        1,
        0,
        2,
        0,
        Opcode::ReturnNoval as u16,
        0,
    ];
    let init = symtab.add_function(FunctionVal {
        name: "new".into(),
        trace_name: "Exception.new".into(),
        sig: init_sig,
        line: 0,
        body: FuncBody::Native(NativeFunc {
            code: init_code,
            reg_count: 3,
            param_count: 2,
            fresh_cells: Vec::new(),
            reg_info: vec![
                RegInfo {
                    sig: exc_sig,
                    name: Some("self".into()),
                    line: 0,
                },
                RegInfo {
                    sig: string_sig,
                    name: Some("message".into()),
                    line: 0,
                },
                RegInfo {
                    sig: list_string,
                    name: None,
                    line: 0,
                },
            ],
        }),
    });

    for index in 0..symtab.class_count() {
        let class_id = ClassId(index as u16);
        if !symtab.is_exception_class(class_id) {
            continue;
        }
        symtab.class_mut(class_id).init = Some(init);
        let class_sig = symtab.sig_for_class(class_id);
        let ctor_sig = symtab.function_sig(class_sig, &[string_sig], false);
        let ctor_code: Vec<u16> = vec![
            Opcode::NewInstance as u16,
            class_id.0,
            1,
            0,
            Opcode::CallReadonly as u16,
            init.0,
            2,
            1,
            0,
            NO_RESULT,
            0,
            Opcode::ReturnVal as u16,
            1,
            0,
        ];
        let name = symtab.class(class_id).name.clone();
        let ctor = symtab.add_function(FunctionVal {
            name: name.clone(),
            trace_name: name,
            sig: ctor_sig,
            line: 0,
            body: FuncBody::Native(NativeFunc {
                code: ctor_code,
                reg_count: 2,
                param_count: 1,
                fresh_cells: Vec::new(),
                reg_info: vec![
                    RegInfo {
                        sig: string_sig,
                        name: Some("message".into()),
                        line: 0,
                    },
                    RegInfo {
                        sig: class_sig,
                        name: Some("self".into()),
                        line: 0,
                    },
                ],
            }),
        });
        symtab.class_mut(class_id).ctor = Some(ctor);
    }
}
