//! Closure semantics and the transform's observable behavior.

use lily::{CollectPrint, Opcode, Options, ParseMode, RecordingTracer, State, TraceEvent};
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

fn run_traced(source: &str) -> (String, RecordingTracer) {
    let mut state = State::new(Options::default());
    let mut print = CollectPrint::new();
    let mut tracer = RecordingTracer::new();
    let ok = state.parse_string_traced("test", ParseMode::NoTags, source, &mut print, &mut tracer);
    assert!(
        ok,
        "run failed: {}",
        state.get_error().map_or_else(|| "?".to_string(), ToString::to_string)
    );
    (print.take(), tracer)
}

const COUNTER: &str = "define mk(): Function( => Integer) {\n\
                           var n = 0\n\
                           return (|| { n += 1 return n })\n\
                       }\n\
                       var f = mk()\n\
                       print(f())\n\
                       print(f())";

#[test]
fn captured_local_persists_across_calls() {
    assert_eq!(run(COUNTER), "1\n2\n");
}

#[test]
fn transform_routes_the_capture_through_cells() {
    let (out, tracer) = run_traced(COUNTER);
    assert_eq!(out, "1\n2\n");

    // mk materializes the cell array; the lambda reads the cell before
    // the add and writes it back after.
    let opcodes = tracer.opcodes();
    assert!(opcodes.contains(&Opcode::ClosureNew), "mk creates the cells");
    assert!(opcodes.contains(&Opcode::ClosureGet));
    assert!(opcodes.contains(&Opcode::ClosureSet));
    let loads = tracer
        .events()
        .iter()
        .filter(|e| matches!(e, TraceEvent::CellLoad { .. }))
        .count();
    let stores = tracer
        .events()
        .iter()
        .filter(|e| matches!(e, TraceEvent::CellStore { .. }))
        .count();
    assert!(loads >= 2, "each lambda call reads the cell");
    assert!(stores >= 2, "each += writes the cell back");
}

#[test]
fn counters_from_separate_calls_are_independent() {
    let out = run(&format!(
        "{}\nvar g = mk()\nprint(g())\nprint(f())",
        COUNTER
    ));
    // f printed 1 and 2 already; g starts fresh; f continues.
    assert_eq!(out, "1\n2\n1\n3\n");
}

#[test]
fn captured_parameters_are_stored_in_the_prelude() {
    let out = run(
        "define adder(n: Integer): Function(Integer => Integer) {\n\
             return (|x: Integer| x + n)\n\
         }\n\
         var add5 = adder(5)\n\
         var add9 = adder(9)\n\
         print(add5(3))\n\
         print(add9(3))",
    );
    assert_eq!(out, "8\n12\n");
}

#[test]
fn assignment_to_an_upvalue_is_visible_outside_the_lambda() {
    let out = run(
        "define probe(): Integer {\n\
             var state = 1\n\
             var bump = (|| { state = state + 10 return state })\n\
             bump()\n\
             bump()\n\
             return state\n\
         }\n\
         print(probe())",
    );
    assert_eq!(out, "21\n");
}

#[test]
fn transform_is_a_no_op_without_captures() {
    // A lambda with no captures must not touch closure machinery.
    let (out, tracer) = run_traced("var f = (|x: Integer| x * 3) print(f(7))");
    assert_eq!(out, "21\n");
    let opcodes = tracer.opcodes();
    assert!(!opcodes.contains(&Opcode::ClosureNew));
    assert!(!opcodes.contains(&Opcode::ClosureGet));
    assert!(!opcodes.contains(&Opcode::ClosureSet));
}

#[test]
fn repeated_parses_execute_identically() {
    // Same source, fresh states: the opcode stream must match exactly.
    let (_, first) = run_traced(COUNTER);
    let (_, second) = run_traced(COUNTER);
    assert_eq!(first.opcodes(), second.opcodes());
}

#[test]
fn loops_inside_capturing_methods_keep_their_jumps() {
    // The transform recomputes jump offsets over inserted cell loads; a
    // backward loop over a captured local is the stress case.
    let out = run(
        "define sum_to(limit: Integer): Function( => Integer) {\n\
             var total = 0\n\
             return (|| {\n\
                 var i = 1\n\
                 while i <= limit: {\n\
                     total += i\n\
                     i += 1\n\
                 }\n\
                 return total\n\
             })\n\
         }\n\
         var s = sum_to(4)\n\
         print(s())",
    );
    assert_eq!(out, "10\n");
}
