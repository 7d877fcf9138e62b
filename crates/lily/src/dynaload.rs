//! Dynaload: materializing a package's seed table into the type system.
//!
//! A seed is a flat table of entries, each classified by its leading
//! character:
//!
//! * `C Name` — a foreign class header.
//! * `m name (Self, ...)[:Ret]` — a method of the preceding class.
//! * `F name (T1, T2...)[:Ret]` — a package function. `...` after the
//!   final `List[...]` parameter marks varargs.
//! * `R name Type` — a package var.
//! * `Z` — end of table.
//!
//! Signatures are written in source syntax and parsed against the symbol
//! table, so packages can name any class the interpreter knows, including
//! classes from earlier entries of the same seed. Materialization is
//! all-or-nothing: the table builds into local collections and commits
//! only on success, so an error mid-seed leaves no partial package.

use indexmap::IndexMap;

use crate::{
    raiser::{ErrorClass, ParseResult, Raise},
    sig::SigId,
    symtab::{
        CLS_FUNCTION, CLS_HASH, CLS_LIST, CLS_TUPLE, CLS_UNIT, ClassId, ClassKind, ClassMember,
        Package, Symtab,
    },
    value::{ForeignFn, FuncBody, FunctionId, FunctionVal},
};

/// Maps a seed entry's name to the native entry point implementing it.
pub type SeedLoader = fn(&str) -> Option<ForeignFn>;

/// What a materialized seed produced.
#[derive(Debug)]
pub(crate) struct LoadedPackage {
    /// Index of the new package, when the seed declared package members.
    pub package: Option<u16>,
    /// Class ids declared by the seed, in order, so foreign code can
    /// identify its instances by runtime id.
    pub cid_table: Vec<u16>,
    /// Var count, for sizing the package's value slots.
    pub var_count: usize,
}

fn raise(message: impl Into<String>) -> Raise {
    Raise::new(ErrorClass::Import, message, 0)
}

/// Parses one seed table and installs it.
///
/// With `globals` set, functions register as top-level vars instead of
/// package members — that is how the core's own `print` arrives.
pub(crate) fn materialize(
    symtab: &mut Symtab,
    name: &str,
    seed: &[&str],
    loader: SeedLoader,
    globals: bool,
) -> ParseResult<LoadedPackage> {
    if symtab.find_package(name).is_some() {
        return Err(raise(format!("Package {name} is already registered.")));
    }

    let mut cid_table = Vec::new();
    let mut funcs: IndexMap<String, FunctionId> = IndexMap::new();
    let mut global_funcs: Vec<(String, SigId, FunctionId)> = Vec::new();
    let mut vars: Vec<(Box<str>, SigId)> = Vec::new();
    let mut current_class = None;
    let mut pending_methods: Vec<(ClassId, String, FunctionVal)> = Vec::new();
    let mut pending_funcs: Vec<FunctionVal> = Vec::new();

    for &entry in seed {
        let entry = entry.trim();
        let (tag, rest) = entry.split_at(1);
        let rest = rest.trim();
        match tag {
            "Z" => break,
            "C" => {
                if symtab.class_by_name(rest).is_some() {
                    return Err(raise(format!("Class {rest} is already declared.")));
                }
                let id = symtab.new_class(rest, ClassKind::Foreign, None);
                cid_table.push(id.0);
                current_class = Some(id);
            }
            "F" | "m" => {
                let (func_name, sig_text) = rest
                    .split_once(' ')
                    .ok_or_else(|| raise(format!("Malformed seed entry '{entry}'.")))?;
                let sig = parse_sig_text(symtab, sig_text.trim())?;
                let entry_fn = loader(func_name)
                    .ok_or_else(|| raise(format!("Package {name} has no loader for {func_name}.")))?;
                // Methods belong to the class header they appear under.
                let method_class = if tag == "m" {
                    Some(
                        current_class
                            .ok_or_else(|| raise("Method entry before any class header."))?,
                    )
                } else {
                    None
                };
                let trace_name = match method_class {
                    Some(class) => format!("{}.{}", symtab.class(class).name, func_name),
                    None => func_name.to_string(),
                };
                let func_val = FunctionVal {
                    name: func_name.into(),
                    trace_name: trace_name.into(),
                    sig,
                    line: 0,
                    body: FuncBody::Foreign(entry_fn),
                };
                match method_class {
                    Some(class) => pending_methods.push((class, func_name.to_string(), func_val)),
                    None => pending_funcs.push(func_val),
                }
            }
            "R" => {
                let (var_name, type_text) = rest
                    .split_once(' ')
                    .ok_or_else(|| raise(format!("Malformed seed entry '{entry}'.")))?;
                let mut cursor = TypeCursor::new(type_text.trim());
                let sig = cursor.parse(symtab)?;
                vars.push((var_name.into(), sig));
            }
            other => {
                return Err(raise(format!("Unknown seed entry tag '{other}'.")));
            }
        }
    }

    // Commit: everything parsed, so installation cannot fail halfway.
    for (class, method_name, func_val) in pending_methods {
        let func = symtab.add_function(func_val);
        symtab
            .class_mut(class)
            .members
            .insert(method_name, ClassMember::Method(func));
    }
    for func_val in pending_funcs {
        let func_name = func_val.name.to_string();
        let sig = func_val.sig;
        let func = symtab.add_function(func_val);
        if globals {
            global_funcs.push((func_name, sig, func));
        } else {
            funcs.insert(func_name, func);
        }
    }
    for (var_name, sig, func) in global_funcs {
        symtab.new_var(&var_name, sig, crate::symtab::VarKind::Readonly(func), 0, 1);
    }

    let var_count = vars.len();
    let package = if globals && vars.is_empty() {
        None
    } else {
        Some(symtab.add_package(Package {
            name: name.into(),
            vars,
            funcs,
            sub_packages: Vec::new(),
        }))
    };

    Ok(LoadedPackage {
        package,
        cid_table,
        var_count,
    })
}

/// Parses `(T1, T2...)[:Ret]` function signature text.
fn parse_sig_text(symtab: &mut Symtab, text: &str) -> ParseResult<SigId> {
    let mut cursor = TypeCursor::new(text);
    cursor.expect('(')?;
    let mut params = Vec::new();
    let mut varargs = false;
    loop {
        cursor.skip_ws();
        if cursor.eat(')') {
            break;
        }
        let sig = cursor.parse(symtab)?;
        if cursor.eat_str("...") {
            varargs = true;
        }
        params.push(sig);
        cursor.skip_ws();
        if cursor.eat(',') {
            continue;
        }
        cursor.expect(')')?;
        break;
    }
    cursor.skip_ws();
    let ret = if cursor.eat(':') {
        cursor.parse(symtab)?
    } else {
        symtab.sig_for_class(CLS_UNIT)
    };
    Ok(symtab.function_sig(ret, &params, varargs))
}

/// A tiny cursor over type text in source syntax.
struct TypeCursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> TypeCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while self.text[self.pos..].starts_with(' ') {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn eat(&mut self, ch: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, prefix: &str) -> bool {
        self.skip_ws();
        if self.text[self.pos..].starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> ParseResult<()> {
        if self.eat(ch) {
            Ok(())
        } else {
            Err(raise(format!(
                "Expected '{ch}' in seed signature '{}'.",
                self.text
            )))
        }
    }

    fn word(&mut self) -> ParseResult<&'a str> {
        self.skip_ws();
        let start = self.pos;
        let rest = &self.text[start..];
        let end = rest
            .find(|c: char| !c.is_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(raise(format!(
                "Expected a type name in seed signature '{}'.",
                self.text
            )));
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn parse(&mut self, symtab: &mut Symtab) -> ParseResult<SigId> {
        let name = self.word()?;
        let class = symtab
            .class_by_name(name)
            .ok_or_else(|| raise(format!("{name} is not a declared type.")))?;
        match class {
            CLS_LIST => {
                self.expect('[')?;
                let elem = self.parse(symtab)?;
                self.expect(']')?;
                Ok(symtab.list_sig(elem))
            }
            CLS_HASH => {
                self.expect('[')?;
                let key = self.parse(symtab)?;
                self.expect(',')?;
                let value = self.parse(symtab)?;
                self.expect(']')?;
                Ok(symtab.hash_sig(key, value))
            }
            CLS_TUPLE => {
                self.expect('[')?;
                let mut members = Vec::new();
                loop {
                    members.push(self.parse(symtab)?);
                    if self.eat(',') {
                        continue;
                    }
                    self.expect(']')?;
                    break;
                }
                Ok(symtab.ensure_unique_sig(CLS_TUPLE, &members, 0))
            }
            CLS_FUNCTION => {
                // Function(T1, T2 => R) nested inside a seed signature.
                self.expect('(')?;
                let mut params = Vec::new();
                let unit = symtab.sig_for_class(CLS_UNIT);
                let mut ret = unit;
                loop {
                    self.skip_ws();
                    if self.eat(')') {
                        break;
                    }
                    if self.eat_str("=>") {
                        ret = self.parse(symtab)?;
                        self.expect(')')?;
                        break;
                    }
                    params.push(self.parse(symtab)?);
                    if self.eat(',') {
                        continue;
                    }
                }
                Ok(symtab.function_sig(ret, &params, false))
            }
            other => Ok(symtab.sig_from_ids(other, &[])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ForeignRaise;

    fn no_op(_ctx: &mut crate::vm::ForeignCall<'_>) -> Result<(), ForeignRaise> {
        Ok(())
    }

    fn test_loader(name: &str) -> Option<ForeignFn> {
        matches!(name, "go" | "peek").then_some(no_op as ForeignFn)
    }

    #[test]
    fn seed_declares_functions_and_vars() {
        let mut symtab = Symtab::new();
        let loaded = materialize(
            &mut symtab,
            "demo",
            &["F go (Integer, String):Boolean", "R counter Integer", "Z"],
            test_loader,
            false,
        )
        .expect("seed materializes");
        let package = loaded.package.expect("package members registered");
        assert_eq!(loaded.var_count, 1);
        let pkg = symtab.package(package);
        assert_eq!(&*pkg.vars[0].0, "counter");
        let func = pkg.funcs.get("go").copied().expect("go registered");
        let sig = symtab.function(func).sig;
        assert_eq!(symtab.sig_name(sig), "Function(Integer, String => Boolean)");
    }

    #[test]
    fn seed_classes_fill_the_cid_table() {
        let mut symtab = Symtab::new();
        let loaded = materialize(
            &mut symtab,
            "conn",
            &["C Conn", "m peek (Conn):String", "Z"],
            test_loader,
            false,
        )
        .expect("seed materializes");
        assert_eq!(loaded.cid_table.len(), 1);
        let class = symtab.class_by_name("Conn").expect("class declared");
        assert_eq!(class.0, loaded.cid_table[0]);
        assert!(matches!(
            symtab.find_member(class, "peek"),
            Some(ClassMember::Method(_))
        ));
    }

    #[test]
    fn methods_attach_to_their_own_class_header() {
        let mut symtab = Symtab::new();
        let loaded = materialize(
            &mut symtab,
            "multi",
            &["C First", "m go (First)", "C Second", "m peek (Second):String", "Z"],
            test_loader,
            false,
        )
        .expect("seed materializes");
        assert_eq!(loaded.cid_table.len(), 2);
        let first = symtab.class_by_name("First").expect("class declared");
        let second = symtab.class_by_name("Second").expect("class declared");
        // Each method lands on the class it was declared under, not the
        // last header in the seed.
        let Some(ClassMember::Method(go)) = symtab.find_member(first, "go") else {
            panic!("go belongs to First");
        };
        assert_eq!(&*symtab.function(go).trace_name, "First.go");
        assert!(symtab.find_member(second, "go").is_none());
        let Some(ClassMember::Method(peek)) = symtab.find_member(second, "peek") else {
            panic!("peek belongs to Second");
        };
        assert_eq!(&*symtab.function(peek).trace_name, "Second.peek");
        assert!(symtab.find_member(first, "peek").is_none());
    }

    #[test]
    fn missing_loader_entry_fails_cleanly() {
        let mut symtab = Symtab::new();
        let before_funcs = symtab.function_count();
        let result = materialize(
            &mut symtab,
            "broken",
            &["F nothere (Integer)", "Z"],
            test_loader,
            false,
        );
        assert!(result.is_err());
        assert_eq!(symtab.function_count(), before_funcs);
        assert!(symtab.find_package("broken").is_none());
    }

    #[test]
    fn varargs_seed_signatures() {
        let mut symtab = Symtab::new();
        let loaded = materialize(
            &mut symtab,
            "va",
            &["F go (String, List[Integer]...):Integer", "Z"],
            test_loader,
            false,
        )
        .expect("seed materializes");
        let pkg = symtab.package(loaded.package.expect("package"));
        let func = pkg.funcs.get("go").copied().expect("go registered");
        let sig = symtab.function(func).sig;
        assert!(symtab.sigs.get(sig).is_varargs());
    }
}
