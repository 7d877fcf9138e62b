//! Primary value types for the interpreter at runtime.
//!
//! A [`Value`] is a tag plus payload: integers, doubles, and booleans stay
//! inline, everything else lives in the heap arena behind a refcounted
//! [`Ref`](Value::Ref). `Clone` is intentionally not derived — use
//! `clone_with_heap` so the reference count tracks every owner, and
//! `drop_with_heap` when an owned value leaves a register or container.

use std::fmt::Write;

use crate::{
    hash::LilyHash,
    heap::{Heap, HeapId},
    raiser::{ErrorClass, RunResult},
    sig::SigId,
    symtab::{ClassId, Symtab},
};

/// Index of a method value in the symbol table's function list.
///
/// Function code is immutable once emitted and methods that fall out of
/// lexical scope stay reachable through this table, so plain function
/// values need no reference count — only closures live on the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FunctionId(pub u16);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A register's content.
#[derive(Debug)]
pub(crate) enum Value {
    /// The register's nil bit: declared but never assigned. Reading raises
    /// `NoValue`.
    Nil,
    Integer(i64),
    Double(f64),
    Boolean(bool),
    /// A plain (capture-free) method value.
    Function(FunctionId),
    /// A refcounted heap object.
    Ref(HeapId),
}

impl Value {
    /// Copies the value, bumping the refcount when it points at the heap.
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        match self {
            Self::Nil => Self::Nil,
            Self::Integer(i) => Self::Integer(*i),
            Self::Double(d) => Self::Double(*d),
            Self::Boolean(b) => Self::Boolean(*b),
            Self::Function(f) => Self::Function(*f),
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
        }
    }

    /// Releases an owned value, dropping a reference when it points at the
    /// heap.
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

/// The payload of a heap slot.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(Box<str>),
    Bytes(Box<[u8]>),
    List(List),
    Hash(LilyHash),
    Tuple(Tuple),
    Instance(Instance),
    Variant(Variant),
    /// The `Any` container: a type tag plus the contained value. A `Nil`
    /// inner value is a nil `Any`.
    Any(AnyBox),
    File(LilyFile),
    Foreign(ForeignData),
    /// A method value bound to a closure cell array.
    Closure(Closure),
    /// The shared cell array captured locals live in.
    CellArray(Vec<Value>),
}

impl HeapData {
    /// Whether values of this shape can sit inside a reference cycle. Used
    /// with the signature's may-circle flag to decide GC tagging.
    pub fn can_cycle(&self) -> bool {
        matches!(
            self,
            Self::List(_)
                | Self::Hash(_)
                | Self::Tuple(_)
                | Self::Instance(_)
                | Self::Variant(_)
                | Self::Any(_)
                | Self::Closure(_)
                | Self::CellArray(_)
        )
    }

    /// Appends the heap ids of every directly held child value.
    pub fn child_ids(&self, out: &mut Vec<HeapId>) {
        let mut push = |v: &Value| {
            if let Value::Ref(id) = v {
                out.push(*id);
            }
        };
        match self {
            Self::Str(_) | Self::Bytes(_) | Self::File(_) | Self::Foreign(_) => {}
            Self::List(list) => list.values.iter().for_each(&mut push),
            Self::Tuple(tuple) => tuple.values.iter().for_each(&mut push),
            Self::Hash(hash) => {
                for (_, v) in hash.iter() {
                    push(v);
                }
            }
            Self::Instance(inst) => inst.props.iter().for_each(&mut push),
            Self::Variant(var) => var.args.iter().for_each(&mut push),
            Self::Any(any) => push(&any.value),
            Self::Closure(closure) => out.push(closure.cells),
            Self::CellArray(cells) => cells.iter().for_each(&mut push),
        }
    }
}

#[derive(Debug)]
pub(crate) struct List {
    pub elem_sig: SigId,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct Tuple {
    pub sig: SigId,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct Instance {
    pub class: ClassId,
    pub props: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct Variant {
    /// The enum class this variant belongs to.
    pub class: ClassId,
    /// The variant's position within the enum declaration.
    pub variant: u16,
    pub args: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct AnyBox {
    /// Signature of the contained value; meaningless while `value` is nil.
    pub sig: SigId,
    pub value: Value,
}

/// A file value. The core defines the shape; the operations live in
/// packages.
#[derive(Debug)]
pub(crate) struct LilyFile {
    pub path: Box<str>,
    pub handle: Option<std::fs::File>,
    pub write_ok: bool,
    pub read_ok: bool,
}

/// Opaque package-supplied payload with a user destructor.
pub(crate) struct ForeignData {
    pub class: ClassId,
    pub data: Box<dyn std::any::Any>,
    pub destroy: Option<fn(Box<dyn std::any::Any>)>,
}

impl std::fmt::Debug for ForeignData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignData")
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct Closure {
    pub func: FunctionId,
    /// Heap id of the shared `CellArray`.
    pub cells: HeapId,
}

/// An error raised by a foreign function back into the VM.
///
/// The class is named rather than id'd so package code does not need to
/// track the interpreter's runtime class ids for the builtin error set.
#[derive(Debug, Clone)]
pub struct ForeignRaise {
    pub class_name: String,
    pub message: String,
}

impl ForeignRaise {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    pub fn err(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::new(class.to_string(), message)
    }
}

/// Entry point type for foreign (host-native) functions.
pub type ForeignFn = fn(&mut crate::vm::ForeignCall<'_>) -> Result<(), ForeignRaise>;

/// Per-register metadata of a native method, finalized when its block
/// closes. Names and lines feed error messages and `show`.
#[derive(Debug, Clone)]
pub(crate) struct RegInfo {
    pub sig: SigId,
    pub name: Option<Box<str>>,
    pub line: u16,
}

#[derive(Debug)]
pub(crate) struct NativeFunc {
    pub code: Vec<u16>,
    pub reg_count: u16,
    pub param_count: u16,
    pub reg_info: Vec<RegInfo>,
    /// Closure spots holding this method's own locals. The VM clears these
    /// cells on entry so recursive calls see fresh captures.
    pub fresh_cells: Vec<u16>,
}

#[derive(Debug)]
pub(crate) enum FuncBody {
    Native(NativeFunc),
    Foreign(ForeignFn),
}

/// A callable unit: either emitted bytecode or a host entry point.
#[derive(Debug)]
pub(crate) struct FunctionVal {
    pub name: Box<str>,
    /// Name as it appears in tracebacks: `__main__`, `f`, or `Class.f`.
    pub trace_name: Box<str>,
    pub sig: SigId,
    pub line: u16,
    pub body: FuncBody,
}

impl FunctionVal {
    pub fn native(&self) -> &NativeFunc {
        match &self.body {
            FuncBody::Native(n) => n,
            FuncBody::Foreign(_) => panic!("FunctionVal::native: foreign function"),
        }
    }
}

/// Deep equality for two values of the same signature.
///
/// Containers compare element-wise; instances, files, and foreign values
/// compare by identity; functions by id.
pub(crate) fn value_eq(heap: &Heap, left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Nil, Value::Nil) => true,
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (Value::Double(a), Value::Double(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Function(a), Value::Function(b)) => a == b,
        (Value::Ref(a), Value::Ref(b)) => {
            if a == b {
                return true;
            }
            match (heap.get(*a), heap.get(*b)) {
                (HeapData::Str(x), HeapData::Str(y)) => x == y,
                (HeapData::Bytes(x), HeapData::Bytes(y)) => x == y,
                (HeapData::List(x), HeapData::List(y)) => {
                    x.values.len() == y.values.len()
                        && x.values
                            .iter()
                            .zip(&y.values)
                            .all(|(a, b)| value_eq(heap, a, b))
                }
                (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                    x.values.len() == y.values.len()
                        && x.values
                            .iter()
                            .zip(&y.values)
                            .all(|(a, b)| value_eq(heap, a, b))
                }
                (HeapData::Hash(x), HeapData::Hash(y)) => {
                    x.len() == y.len()
                        && x.iter().all(|(k, v)| {
                            y.get(k).is_some_and(|other| value_eq(heap, v, other))
                        })
                }
                (HeapData::Variant(x), HeapData::Variant(y)) => {
                    x.class == y.class
                        && x.variant == y.variant
                        && x.args.len() == y.args.len()
                        && x.args
                            .iter()
                            .zip(&y.args)
                            .all(|(a, b)| value_eq(heap, a, b))
                }
                (HeapData::Any(x), HeapData::Any(y)) => {
                    x.sig == y.sig && value_eq(heap, &x.value, &y.value)
                }
                // Instances, files, foreign values, closures: identity only,
                // and identity already failed above.
                _ => false,
            }
        }
        _ => false,
    }
}

/// Renders a value for `print` and string conversion.
pub(crate) fn render_value(heap: &Heap, symtab: &Symtab, value: &Value, out: &mut String) {
    match value {
        Value::Nil => out.push_str("(nil)"),
        Value::Integer(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Double(d) => {
            let mut buf = ryu::Buffer::new();
            out.push_str(buf.format(*d));
        }
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Function(id) => {
            let func = symtab.function(*id);
            let _ = write!(out, "<function {}>", func.trace_name);
        }
        Value::Ref(id) => render_heap_value(heap, symtab, *id, out),
    }
}

fn render_heap_value(heap: &Heap, symtab: &Symtab, id: HeapId, out: &mut String) {
    match heap.get(id) {
        HeapData::Str(s) => out.push_str(s),
        HeapData::Bytes(b) => {
            let _ = write!(out, "<bytestring of {} bytes>", b.len());
        }
        HeapData::List(list) => {
            out.push('[');
            for (i, v) in list.values.iter().enumerate() {
                if i != 0 {
                    out.push_str(", ");
                }
                render_value(heap, symtab, v, out);
            }
            out.push(']');
        }
        HeapData::Tuple(tuple) => {
            out.push_str("<[");
            for (i, v) in tuple.values.iter().enumerate() {
                if i != 0 {
                    out.push_str(", ");
                }
                render_value(heap, symtab, v, out);
            }
            out.push_str("]>");
        }
        HeapData::Hash(hash) => {
            out.push('[');
            for (i, (k, v)) in hash.iter().enumerate() {
                if i != 0 {
                    out.push_str(", ");
                }
                match k {
                    crate::hash::HashKey::Integer(n) => {
                        let _ = write!(out, "{n}");
                    }
                    crate::hash::HashKey::Str(s) => {
                        let _ = write!(out, "\"{s}\"");
                    }
                }
                out.push_str(" => ");
                render_value(heap, symtab, v, out);
            }
            out.push(']');
        }
        HeapData::Instance(inst) => {
            let _ = write!(out, "<{} instance>", symtab.class(inst.class).name);
        }
        HeapData::Variant(var) => {
            let class = symtab.class(var.class);
            out.push_str(&class.variant_name(var.variant));
            if !var.args.is_empty() {
                out.push('(');
                for (i, v) in var.args.iter().enumerate() {
                    if i != 0 {
                        out.push_str(", ");
                    }
                    render_value(heap, symtab, v, out);
                }
                out.push(')');
            }
        }
        HeapData::Any(any) => render_value(heap, symtab, &any.value, out),
        HeapData::File(file) => {
            let _ = write!(out, "<file \"{}\">", file.path);
        }
        HeapData::Foreign(data) => {
            let _ = write!(out, "<{} value>", symtab.class(data.class).name);
        }
        HeapData::Closure(closure) => {
            let func = symtab.function(closure.func);
            let _ = write!(out, "<function {}>", func.trace_name);
        }
        HeapData::CellArray(_) => out.push_str("<closure cells>"),
    }
}

/// Truthiness for `jump_if`. Only Boolean and Integer conditions reach the
/// VM; the emitter rejects everything else.
pub(crate) fn is_truthy(value: &Value) -> RunResult<bool> {
    match value {
        Value::Boolean(b) => Ok(*b),
        Value::Integer(i) => Ok(*i != 0),
        Value::Nil => Err(crate::raiser::RunError::new(
            crate::symtab::CLS_NOVALUE,
            "Attempt to read a nil value.",
        )),
        other => panic!("is_truthy: emitter allowed {other:?} as a condition"),
    }
}
