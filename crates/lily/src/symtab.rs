//! Classes, variables, literals, and interned signatures.
//!
//! The symbol table owns the class table (indexed by id), the lexically
//! scoped variable chain, the literal table, the signature pool, and every
//! method value ever emitted. Methods stay in the function list after
//! their defining scope exits, because emitted bytecode may still call
//! them through references.

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    sig::{SIG_IS_VARARGS, SIG_MAY_CIRCLE, Sig, SigId, SigPool},
    value::{FunctionId, FunctionVal},
};

/// Index into the variable chain.
pub(crate) type VarId = usize;

/// Index into the class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClassId(pub u16);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) const CLS_INTEGER: ClassId = ClassId(0);
pub(crate) const CLS_DOUBLE: ClassId = ClassId(1);
pub(crate) const CLS_STRING: ClassId = ClassId(2);
pub(crate) const CLS_BOOLEAN: ClassId = ClassId(3);
pub(crate) const CLS_BYTESTRING: ClassId = ClassId(4);
pub(crate) const CLS_BYTE: ClassId = ClassId(5);
pub(crate) const CLS_FUNCTION: ClassId = ClassId(6);
pub(crate) const CLS_ANY: ClassId = ClassId(7);
pub(crate) const CLS_LIST: ClassId = ClassId(8);
pub(crate) const CLS_HASH: ClassId = ClassId(9);
pub(crate) const CLS_TUPLE: ClassId = ClassId(10);
pub(crate) const CLS_FILE: ClassId = ClassId(11);
/// Marker class for the return of value-less methods. Never user-visible.
pub(crate) const CLS_UNIT: ClassId = ClassId(12);
/// Marker class for template positions (`A`..`Z`).
pub(crate) const CLS_TEMPLATE: ClassId = ClassId(13);
pub(crate) const CLS_EXCEPTION: ClassId = ClassId(14);
pub(crate) const CLS_NOVALUE: ClassId = ClassId(15);
pub(crate) const CLS_DIVIDE_BY_ZERO: ClassId = ClassId(16);
pub(crate) const CLS_OUT_OF_RANGE: ClassId = ClassId(17);
pub(crate) const CLS_BAD_CAST: ClassId = ClassId(18);
pub(crate) const CLS_BAD_VALUE: ClassId = ClassId(19);
pub(crate) const CLS_KEY: ClassId = ClassId(20);
pub(crate) const CLS_FORMAT: ClassId = ClassId(21);
pub(crate) const CLS_IO_ERROR: ClassId = ClassId(22);
pub(crate) const CLS_RECURSION: ClassId = ClassId(23);
pub(crate) const CLS_RETURN_EXPECTED: ClassId = ClassId(24);
pub(crate) const CLS_VALUE_ERROR: ClassId = ClassId(25);

/// Property index of `Exception.message`.
pub(crate) const EXCEPTION_PROP_MESSAGE: u16 = 0;
/// Property index of `Exception.traceback`.
pub(crate) const EXCEPTION_PROP_TRACEBACK: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClassKind {
    Primitive,
    Container,
    Enum,
    User,
    Exception,
    /// Declared by a package through the dynaload seed; payload layout is
    /// foreign.
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visibility {
    Public,
    Protected,
    Private,
}

#[derive(Debug, Clone)]
pub(crate) struct PropDef {
    pub name: Box<str>,
    pub sig: SigId,
    pub visibility: Visibility,
}

#[derive(Debug, Clone)]
pub(crate) struct VariantDef {
    pub name: Box<str>,
    pub arg_sigs: Vec<SigId>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ClassMember {
    Method(FunctionId),
    Property(u16),
    Variant(u16),
}

#[derive(Debug)]
pub(crate) struct Class {
    pub name: Box<str>,
    pub id: ClassId,
    pub parent: Option<ClassId>,
    /// Whether values of this class live on the heap and carry a refcount.
    pub is_refcounted: bool,
    /// Whether values of this class can sit inside a reference cycle.
    pub can_cycle: bool,
    pub template_count: u16,
    pub kind: ClassKind,
    pub props: Vec<PropDef>,
    /// Methods, properties, and variants by name, in declaration order.
    pub members: IndexMap<String, ClassMember>,
    pub variants: Vec<VariantDef>,
    /// The synthesized constructor of a user class.
    pub ctor: Option<FunctionId>,
    /// The body initializer a child constructor chains into.
    pub init: Option<FunctionId>,
}

impl Class {
    pub fn variant_name(&self, index: u16) -> String {
        self.variants
            .get(index as usize)
            .map_or_else(|| "?".to_string(), |v| v.name.to_string())
    }
}

/// Where a variable's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarKind {
    /// Register index in `__main__`'s (global) register window.
    Global(u16),
    /// Register index within the enclosing method.
    Local(u16),
    /// A method value; loaded through the function table, never written.
    Readonly(FunctionId),
}

#[derive(Debug)]
pub(crate) struct Var {
    pub name: Box<str>,
    pub sig: SigId,
    pub kind: VarKind,
    pub line: u16,
    /// Function nesting depth at declaration; 1 is `__main__`. Used to
    /// detect upvalue references.
    pub depth: u16,
    /// Assigned closure spot, or `u16::MAX` while uncaptured.
    pub closure_spot: u16,
}

/// An interned constant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LitValue {
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Str(Box<str>),
    Bytes(Box<[u8]>),
    Byte(u8),
}

#[derive(Debug)]
pub(crate) struct Literal {
    pub sig: SigId,
    pub value: LitValue,
}

/// Hashable identity for literal interning; doubles key by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LitKey {
    Integer(i64),
    Double(u64),
    Boolean(bool),
    Str(Box<str>),
    Bytes(Box<[u8]>),
    Byte(u8),
}

/// A member variable or function declared by a registered package.
#[derive(Debug)]
pub(crate) struct Package {
    pub name: Box<str>,
    /// Mutable package vars, addressed by index at runtime.
    pub vars: Vec<(Box<str>, SigId)>,
    pub funcs: IndexMap<String, FunctionId>,
    /// Nested packages, addressed through the deep package opcodes.
    pub sub_packages: Vec<(Box<str>, u16)>,
}

#[derive(Debug)]
pub(crate) struct Symtab {
    classes: Vec<Class>,
    class_names: AHashMap<String, ClassId>,
    pub sigs: SigPool,
    vars: Vec<Var>,
    literals: Vec<Literal>,
    lit_map: AHashMap<LitKey, u16>,
    functions: Vec<FunctionVal>,
    packages: Vec<Package>,
    /// Next free register in the global (`__main__`) window.
    pub next_global: u16,
}

impl Symtab {
    pub fn new() -> Self {
        let mut symtab = Self {
            classes: Vec::new(),
            class_names: AHashMap::new(),
            sigs: SigPool::new(),
            vars: Vec::new(),
            literals: Vec::new(),
            lit_map: AHashMap::new(),
            functions: Vec::new(),
            packages: Vec::new(),
            next_global: 0,
        };
        symtab.seed_builtin_classes();
        symtab
    }

    /// Registers the builtin class set at their fixed ids, then gives the
    /// exception classes their `message`/`traceback` properties.
    fn seed_builtin_classes(&mut self) {
        use ClassKind::{Container, Exception, Primitive};
        let seeds: &[(&str, ClassKind, bool, bool, u16)] = &[
            // (name, kind, refcounted, can_cycle, template_count)
            ("Integer", Primitive, false, false, 0),
            ("Double", Primitive, false, false, 0),
            ("String", Primitive, true, false, 0),
            ("Boolean", Primitive, false, false, 0),
            ("ByteString", Primitive, true, false, 0),
            ("Byte", Primitive, false, false, 0),
            ("Function", Container, true, true, 0),
            ("Any", Container, true, true, 0),
            ("List", Container, true, true, 1),
            ("Hash", Container, true, true, 2),
            ("Tuple", Container, true, true, 0),
            ("File", Container, true, false, 0),
            ("Unit", Primitive, false, false, 0),
            ("Template", Primitive, false, false, 0),
            ("Exception", Exception, true, true, 0),
            ("NoValue", Exception, true, true, 0),
            ("DivideByZero", Exception, true, true, 0),
            ("OutOfRange", Exception, true, true, 0),
            ("BadCast", Exception, true, true, 0),
            ("BadValue", Exception, true, true, 0),
            ("Key", Exception, true, true, 0),
            ("Format", Exception, true, true, 0),
            ("IOError", Exception, true, true, 0),
            ("Recursion", Exception, true, true, 0),
            ("ReturnExpected", Exception, true, true, 0),
            ("ValueError", Exception, true, true, 0),
        ];
        for &(name, kind, refcounted, can_cycle, template_count) in seeds {
            let parent = if kind == Exception && name != "Exception" {
                Some(CLS_EXCEPTION)
            } else {
                None
            };
            let id = self.new_class(name, kind, parent);
            let class = &mut self.classes[id.index()];
            class.is_refcounted = refcounted;
            class.can_cycle = can_cycle;
            class.template_count = template_count;
        }

        // Exception properties shared by the whole hierarchy. The builtin
        // subclasses were registered before the base grew its properties,
        // so their property lists are brought up to date here; classes
        // declared later inherit on creation.
        let string_sig = self.sig_for_class(CLS_STRING);
        let list_string = self.list_sig(string_sig);
        let base = &mut self.classes[CLS_EXCEPTION.index()];
        base.props.push(PropDef {
            name: "message".into(),
            sig: string_sig,
            visibility: Visibility::Public,
        });
        base.props.push(PropDef {
            name: "traceback".into(),
            sig: list_string,
            visibility: Visibility::Public,
        });
        base.members
            .insert("message".to_string(), ClassMember::Property(0));
        base.members
            .insert("traceback".to_string(), ClassMember::Property(1));
        let base_props = base.props.clone();
        for class in &mut self.classes {
            if class.parent == Some(CLS_EXCEPTION) {
                class.props = base_props.clone();
            }
        }
    }

    pub fn new_class(&mut self, name: &str, kind: ClassKind, parent: Option<ClassId>) -> ClassId {
        let id = ClassId(u16::try_from(self.classes.len()).expect("class table exceeds u16"));
        // User classes inherit their parent's property list so property
        // indices stay valid across the hierarchy.
        let (props, refcounted, can_cycle) = match parent {
            Some(parent_id) => {
                let parent_class = &self.classes[parent_id.index()];
                (parent_class.props.clone(), true, true)
            }
            None => (
                Vec::new(),
                matches!(kind, ClassKind::User | ClassKind::Exception | ClassKind::Foreign),
                matches!(kind, ClassKind::User | ClassKind::Exception | ClassKind::Enum),
            ),
        };
        self.classes.push(Class {
            name: name.into(),
            id,
            parent,
            is_refcounted: refcounted,
            can_cycle,
            template_count: 0,
            kind,
            props,
            members: IndexMap::new(),
            variants: Vec::new(),
            ctor: None,
            init: None,
        });
        self.class_names.insert(name.to_string(), id);
        id
    }

    #[must_use]
    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.index()]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.index()]
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.class_names.get(name).copied()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Walks the parent chain: does `child` match a handler for `ancestor`?
    pub fn class_matches(&self, child: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(child);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.classes[id.index()].parent;
        }
        false
    }

    pub fn is_exception_class(&self, id: ClassId) -> bool {
        self.class_matches(id, CLS_EXCEPTION)
    }

    /// Searches every enum for a variant with this bare name.
    pub fn find_variant_global(&self, name: &str) -> Option<(ClassId, u16)> {
        for class in &self.classes {
            if class.kind != ClassKind::Enum {
                continue;
            }
            if let Some(ClassMember::Variant(index)) = class.members.get(name) {
                return Some((class.id, *index));
            }
        }
        None
    }

    /// Finds a member by name, walking the inheritance chain.
    pub fn find_member(&self, class: ClassId, name: &str) -> Option<ClassMember> {
        let mut current = Some(class);
        while let Some(id) = current {
            if let Some(member) = self.classes[id.index()].members.get(name) {
                return Some(*member);
            }
            current = self.classes[id.index()].parent;
        }
        None
    }

    // -- signatures --------------------------------------------------------

    /// The plain signature for a class with no subtypes.
    pub fn sig_for_class(&mut self, class: ClassId) -> SigId {
        let flags = if self.classes[class.index()].can_cycle {
            SIG_MAY_CIRCLE
        } else {
            0
        };
        self.sigs.intern(Sig {
            class,
            subsigs: SmallVec::new(),
            flags,
            template_pos: 0,
        })
    }

    /// Interns a signature, deriving the may-circle flag from the class
    /// and subtypes.
    pub fn ensure_unique_sig(&mut self, class: ClassId, subsigs: &[SigId], flags: u8) -> SigId {
        let class_cycles = self.classes[class.index()].can_cycle;
        let mut may_circle = match class {
            CLS_LIST | CLS_HASH | CLS_TUPLE => subsigs
                .iter()
                .any(|&sub| self.sigs.get(sub).may_circle() || self.sigs.get(sub).class == CLS_ANY),
            _ => class_cycles,
        };
        // A container of templates must be pessimistic until resolution.
        if subsigs
            .iter()
            .any(|&sub| self.sigs.get(sub).class == CLS_TEMPLATE)
        {
            may_circle = true;
        }
        let flags = if may_circle {
            flags | SIG_MAY_CIRCLE
        } else {
            flags
        };
        self.sigs.intern(Sig {
            class,
            subsigs: SmallVec::from_slice(subsigs),
            flags,
            template_pos: 0,
        })
    }

    /// Builds a signature from a class id and subtype ids. Used by package
    /// seeds.
    pub fn sig_from_ids(&mut self, class: ClassId, subsigs: &[SigId]) -> SigId {
        self.ensure_unique_sig(class, subsigs, 0)
    }

    pub fn list_sig(&mut self, elem: SigId) -> SigId {
        self.ensure_unique_sig(CLS_LIST, &[elem], 0)
    }

    pub fn hash_sig(&mut self, key: SigId, value: SigId) -> SigId {
        self.ensure_unique_sig(CLS_HASH, &[key, value], 0)
    }

    /// A function signature: return first, parameters after.
    pub fn function_sig(&mut self, ret: SigId, params: &[SigId], varargs: bool) -> SigId {
        let mut subsigs = SmallVec::with_capacity(params.len() + 1);
        subsigs.push(ret);
        subsigs.extend_from_slice(params);
        let flags = SIG_MAY_CIRCLE | if varargs { SIG_IS_VARARGS } else { 0 };
        self.sigs.intern(Sig {
            class: CLS_FUNCTION,
            subsigs,
            flags,
            template_pos: 0,
        })
    }

    /// The signature for template position `pos` (`A` = 0).
    pub fn template_sig(&mut self, pos: u16) -> SigId {
        self.sigs.intern(Sig {
            class: CLS_TEMPLATE,
            subsigs: SmallVec::new(),
            flags: SIG_MAY_CIRCLE,
            template_pos: pos,
        })
    }

    /// Renders a signature the way the user wrote it.
    pub fn write_sig_name(&self, out: &mut String, sig_id: SigId) {
        let sig = self.sigs.get(sig_id);
        match sig.class {
            CLS_TEMPLATE => {
                out.push((b'A' + (sig.template_pos as u8 % 26)) as char);
            }
            CLS_FUNCTION => {
                out.push_str("Function(");
                let params = sig.func_params();
                for (i, &param) in params.iter().enumerate() {
                    if i != 0 {
                        out.push_str(", ");
                    }
                    self.write_sig_name(out, param);
                    if sig.is_varargs() && i == params.len() - 1 {
                        out.push_str("...");
                    }
                }
                let ret = sig.func_return();
                if self.sigs.get(ret).class != CLS_UNIT {
                    out.push_str(" => ");
                    self.write_sig_name(out, ret);
                }
                out.push(')');
            }
            class if sig.subsigs.is_empty() => {
                out.push_str(&self.classes[class.index()].name);
            }
            class => {
                out.push_str(&self.classes[class.index()].name);
                out.push('[');
                for (i, &sub) in sig.subsigs.iter().enumerate() {
                    if i != 0 {
                        out.push_str(", ");
                    }
                    self.write_sig_name(out, sub);
                }
                out.push(']');
            }
        }
    }

    pub fn sig_name(&self, sig: SigId) -> String {
        let mut out = String::new();
        self.write_sig_name(&mut out, sig);
        out
    }

    // -- vars --------------------------------------------------------------

    /// Appends a variable to the current scope. The caller supplies the
    /// register kind since global and local allocation differ.
    pub fn new_var(
        &mut self,
        name: &str,
        sig: SigId,
        kind: VarKind,
        line: u16,
        depth: u16,
    ) -> usize {
        self.vars.push(Var {
            name: name.into(),
            sig,
            kind,
            line,
            depth,
            closure_spot: u16::MAX,
        });
        self.vars.len() - 1
    }

    /// Finds the innermost in-scope variable with this name.
    pub fn find_var(&self, name: &str) -> Option<usize> {
        self.vars.iter().rposition(|v| &*v.name == name)
    }

    pub fn var(&self, index: usize) -> &Var {
        &self.vars[index]
    }

    pub fn var_mut(&mut self, index: usize) -> &mut Var {
        &mut self.vars[index]
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Marks every variable declared since `start` as out of scope. Their
    /// registers stay allocated; only name visibility ends.
    pub fn hide_block_vars(&mut self, start: usize) {
        self.vars.truncate(start);
    }

    // -- literals ----------------------------------------------------------

    /// Interns a literal; identical payloads share one table slot.
    pub fn new_literal(&mut self, value: LitValue) -> u16 {
        let key = match &value {
            LitValue::Integer(i) => LitKey::Integer(*i),
            LitValue::Double(d) => LitKey::Double(d.to_bits()),
            LitValue::Boolean(b) => LitKey::Boolean(*b),
            LitValue::Str(s) => LitKey::Str(s.clone()),
            LitValue::Bytes(b) => LitKey::Bytes(b.clone()),
            LitValue::Byte(b) => LitKey::Byte(*b),
        };
        if let Some(&index) = self.lit_map.get(&key) {
            return index;
        }
        let class = match &value {
            LitValue::Integer(_) => CLS_INTEGER,
            LitValue::Double(_) => CLS_DOUBLE,
            LitValue::Boolean(_) => CLS_BOOLEAN,
            LitValue::Str(_) => CLS_STRING,
            LitValue::Bytes(_) => CLS_BYTESTRING,
            LitValue::Byte(_) => CLS_BYTE,
        };
        let sig = self.sig_for_class(class);
        let index = u16::try_from(self.literals.len()).expect("literal table exceeds u16");
        self.literals.push(Literal { sig, value });
        self.lit_map.insert(key, index);
        index
    }

    pub fn literal(&self, index: u16) -> &Literal {
        &self.literals[index as usize]
    }

    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    // -- functions ---------------------------------------------------------

    pub fn add_function(&mut self, func: FunctionVal) -> FunctionId {
        let id = FunctionId(u16::try_from(self.functions.len()).expect("function table exceeds u16"));
        self.functions.push(func);
        id
    }

    #[must_use]
    pub fn function(&self, id: FunctionId) -> &FunctionVal {
        &self.functions[id.index()]
    }

    // -- packages ----------------------------------------------------------

    pub fn add_package(&mut self, package: Package) -> u16 {
        let index = u16::try_from(self.packages.len()).expect("package table exceeds u16");
        self.packages.push(package);
        index
    }

    pub fn package(&self, index: u16) -> &Package {
        &self.packages[index as usize]
    }

    pub fn package_mut(&mut self, index: u16) -> &mut Package {
        &mut self.packages[index as usize]
    }

    pub fn find_package(&self, name: &str) -> Option<u16> {
        self.packages
            .iter()
            .position(|p| &*p.name == name)
            .map(|i| i as u16)
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut FunctionVal {
        &mut self.functions[id.index()]
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_classes_sit_at_fixed_ids() {
        let symtab = Symtab::new();
        assert_eq!(symtab.class(CLS_INTEGER).name.as_ref(), "Integer");
        assert_eq!(symtab.class(CLS_HASH).name.as_ref(), "Hash");
        assert_eq!(symtab.class(CLS_VALUE_ERROR).name.as_ref(), "ValueError");
        assert_eq!(symtab.class_by_name("List"), Some(CLS_LIST));
    }

    #[test]
    fn exception_hierarchy_matches() {
        let symtab = Symtab::new();
        assert!(symtab.class_matches(CLS_VALUE_ERROR, CLS_EXCEPTION));
        assert!(symtab.class_matches(CLS_KEY, CLS_EXCEPTION));
        assert!(!symtab.class_matches(CLS_EXCEPTION, CLS_VALUE_ERROR));
        assert!(!symtab.class_matches(CLS_INTEGER, CLS_EXCEPTION));
    }

    #[test]
    fn literal_interning_shares_slots() {
        let mut symtab = Symtab::new();
        let a = symtab.new_literal(LitValue::Integer(5));
        let b = symtab.new_literal(LitValue::Integer(5));
        let c = symtab.new_literal(LitValue::Integer(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
        let s1 = symtab.new_literal(LitValue::Str("x".into()));
        let s2 = symtab.new_literal(LitValue::Str("x".into()));
        assert_eq!(s1, s2);
    }

    #[test]
    fn sig_names_render_like_source() {
        let mut symtab = Symtab::new();
        let int = symtab.sig_for_class(CLS_INTEGER);
        let str_sig = symtab.sig_for_class(CLS_STRING);
        let list_int = symtab.list_sig(int);
        assert_eq!(symtab.sig_name(list_int), "List[Integer]");
        let hash = symtab.hash_sig(str_sig, list_int);
        assert_eq!(symtab.sig_name(hash), "Hash[String, List[Integer]]");
        let func = symtab.function_sig(int, &[str_sig], false);
        assert_eq!(symtab.sig_name(func), "Function(String => Integer)");
        let unit = symtab.sig_for_class(CLS_UNIT);
        let void_fn = symtab.function_sig(unit, &[], false);
        assert_eq!(symtab.sig_name(void_fn), "Function()");
    }

    #[test]
    fn may_circle_propagates_through_containers() {
        let mut symtab = Symtab::new();
        let int = symtab.sig_for_class(CLS_INTEGER);
        let any = symtab.sig_for_class(CLS_ANY);
        let list_int = symtab.list_sig(int);
        let list_any = symtab.list_sig(any);
        let list_list_any = symtab.list_sig(list_any);
        assert!(!symtab.sigs.get(list_int).may_circle());
        assert!(symtab.sigs.get(list_any).may_circle());
        assert!(symtab.sigs.get(list_list_any).may_circle());
    }

    #[test]
    fn var_scoping_shadows_and_hides() {
        let mut symtab = Symtab::new();
        let int = symtab.sig_for_class(CLS_INTEGER);
        let outer = symtab.new_var("a", int, VarKind::Global(0), 1, 1);
        let mark = symtab.var_count();
        let inner = symtab.new_var("a", int, VarKind::Local(0), 2, 2);
        assert_eq!(symtab.find_var("a"), Some(inner));
        symtab.hide_block_vars(mark);
        assert_eq!(symtab.find_var("a"), Some(outer));
    }
}
