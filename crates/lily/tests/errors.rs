//! Error behavior: parse/emit rejections, runtime raises, try/except,
//! and traceback assembly.

use lily::{CollectPrint, ErrorLocation, LilyError, Options, ParseMode, State};
use pretty_assertions::assert_eq;

fn run(source: &str) -> String {
    let mut state = State::new(Options::default());
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to("test", ParseMode::NoTags, source, &mut print);
    assert!(
        ok,
        "run failed: {}",
        state.get_error().map_or_else(|| "?".to_string(), ToString::to_string)
    );
    print.take()
}

fn run_err(source: &str) -> LilyError {
    let mut state = State::new(Options::default());
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to("test", ParseMode::NoTags, source, &mut print);
    assert!(!ok, "expected an error, got output: {:?}", print.take());
    state.get_error().cloned().expect("error recorded")
}

#[test]
fn subscript_out_of_range_message_and_line() {
    let err = run_err("var l = [1, 2, 3]\nl[5]");
    assert_eq!(err.class_name, "OutOfRange");
    assert_eq!(err.message, "Subscript index 5 is out of range.");
    let ErrorLocation::Traceback(lines) = &err.location else {
        panic!("runtime errors carry a traceback: {err:?}");
    };
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], "Function __main__ at line 2");
}

#[test]
fn negative_subscripts_are_rejected_not_wrapped() {
    let err = run_err("var l = [1, 2, 3]\nvar i = 0 - 1\nl[i]");
    assert_eq!(err.class_name, "OutOfRange");
    assert_eq!(err.message, "Subscript index -1 is out of range.");
}

#[test]
fn hash_index_type_is_enforced_at_emit_time() {
    let err = run_err("var h = [\"a\" => 1]\nh[0] = 2");
    assert_eq!(err.class_name, "Syntax");
    assert_eq!(
        err.message,
        "hash expects an index of type 'String', but got type 'Integer'."
    );
    assert_eq!(
        err.location,
        ErrorLocation::Where {
            file: "test".to_string(),
            line: 2
        }
    );
}

#[test]
fn missing_hash_key_raises_key_error() {
    let err = run_err("var h = [\"a\" => 1]\nprint(h[\"b\"])");
    assert_eq!(err.class_name, "Key");
}

#[test]
fn divide_by_zero() {
    let err = run_err("var x = 0\nprint(10 / x)");
    assert_eq!(err.class_name, "DivideByZero");
    assert_eq!(err.message, "Attempt to divide by zero.");
}

#[test]
fn modulo_by_zero() {
    let err = run_err("var x = 0\nprint(10 % x)");
    assert_eq!(err.class_name, "DivideByZero");
}

#[test]
fn raise_and_catch_binds_the_instance() {
    let out = run("try: raise ValueError(\"x\") except ValueError as e: print(e.message)");
    assert_eq!(out, "x\n");
}

#[test]
fn raised_instance_traceback_names_the_raise_site() {
    let out = run(
        "try: raise ValueError(\"x\") except ValueError as e: print(e.traceback[0])",
    );
    assert_eq!(out, "Function __main__ at line 1\n");
}

#[test]
fn base_class_handlers_catch_subclasses() {
    let out = run("try: raise ValueError(\"v\") except Exception: print(\"caught\")");
    assert_eq!(out, "caught\n");
}

#[test]
fn handlers_match_in_order() {
    let out = run(
        "try: {\n\
             raise ValueError(\"v\")\n\
         except Key:\n\
             print(\"key\")\n\
         except ValueError:\n\
             print(\"value\")\n\
         }",
    );
    assert_eq!(out, "value\n");
}

#[test]
fn core_raises_are_catchable() {
    let out = run(
        "var zero = 0\n\
         try: print(1 / zero) except DivideByZero: print(\"div\")",
    );
    assert_eq!(out, "div\n");
}

#[test]
fn uncaught_raise_exits_with_the_exception() {
    let err = run_err("raise ValueError(\"boom\")");
    assert_eq!(err.class_name, "ValueError");
    assert_eq!(err.message, "boom");
}

#[test]
fn unmatched_handlers_keep_unwinding() {
    let err = run_err("try: raise ValueError(\"v\") except Key: print(\"no\")");
    assert_eq!(err.class_name, "ValueError");
}

#[test]
fn tracebacks_walk_the_call_stack() {
    let err = run_err(
        "define inner(): Integer {\n\
             return 1 / 0\n\
         }\n\
         define outer(): Integer {\n\
             return inner()\n\
         }\n\
         print(outer())",
    );
    assert_eq!(err.class_name, "DivideByZero");
    let ErrorLocation::Traceback(lines) = &err.location else {
        panic!("runtime errors carry a traceback");
    };
    assert_eq!(
        lines,
        &vec![
            "Function __main__ at line 7".to_string(),
            "Function outer at line 5".to_string(),
            "Function inner at line 2".to_string(),
        ]
    );
}

#[test]
fn user_exception_classes_derive_from_exception() {
    let out = run(
        "class AppError(msg: String) < Exception(msg) { }\n\
         try: raise AppError(\"app\") except Exception as e: print(e.message)",
    );
    assert_eq!(out, "app\n");
}

#[test]
fn recursion_limit_raises_past_the_limit() {
    let source = "define r(n: Integer): Integer {\n\
                      if n == 0: return 0\n\
                      return r(n - 1)\n\
                  }\n\
                  print(r(DEPTH))";

    let mut state = State::new(Options::default());
    state.set_recursion_limit(20);
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to(
        "test",
        ParseMode::NoTags,
        &source.replace("DEPTH", "10"),
        &mut print,
    );
    assert!(ok, "shallow recursion fits: {:?}", state.get_error());
    assert_eq!(print.take(), "0\n");

    let mut state = State::new(Options::default());
    state.set_recursion_limit(20);
    let ok = state.parse_string_to(
        "test",
        ParseMode::NoTags,
        &source.replace("DEPTH", "30"),
        &mut print,
    );
    assert!(!ok);
    assert_eq!(state.get_error().expect("error").class_name, "Recursion");
}

#[test]
fn falling_off_a_valued_method_raises_return_expected() {
    let err = run_err(
        "define f(): Integer {\n\
             if false: return 1\n\
         }\n\
         print(f())",
    );
    assert_eq!(err.class_name, "ReturnExpected");
}

#[test]
fn bad_any_cast_raises() {
    let err = run_err("var a: Any = 10\nprint(a.@(String))");
    assert_eq!(err.class_name, "BadCast");
    assert_eq!(
        err.message,
        "Cannot cast Any containing type 'Integer' to type 'String'."
    );
}

#[test]
fn zero_for_step_is_a_bad_value() {
    let err = run_err("var s = 0\nfor i in 1...3 by s: print(i)");
    assert_eq!(err.class_name, "BadValue");
}

#[test]
fn error_display_formats_where_and_traceback() {
    let err = run_err("var a = ");
    assert_eq!(err.class_name, "Syntax");
    let rendered = err.to_string();
    assert!(
        rendered.starts_with("Syntax: "),
        "unexpected rendering: {rendered}"
    );
    assert!(rendered.contains("\nWhere: File \"test\" at line 1"));

    let err = run_err("print(1 / 0)");
    let rendered = err.to_string();
    assert!(rendered.contains("\nTraceback:"));
    assert!(rendered.contains("Function __main__ at line 1"));
}
