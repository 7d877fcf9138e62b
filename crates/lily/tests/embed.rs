//! The embedding surface: foreign packages, the typed value stack,
//! host-driven calls, templates, and REPL chunks.

use lily::{
    CollectPrint, ForeignCall, ForeignFn, ForeignRaise, Options, ParseMode, State,
};
use pretty_assertions::assert_eq;

fn shout(ctx: &mut ForeignCall<'_>) -> Result<(), ForeignRaise> {
    let text = ctx.arg_string(0)?.to_uppercase();
    ctx.result_string(&text);
    Ok(())
}

fn total(ctx: &mut ForeignCall<'_>) -> Result<(), ForeignRaise> {
    let mut sum = 0;
    for index in 0..ctx.arg_count() {
        sum += ctx.arg_integer(index)?;
    }
    ctx.result_integer(sum);
    Ok(())
}

fn fail(_ctx: &mut ForeignCall<'_>) -> Result<(), ForeignRaise> {
    Err(ForeignRaise::new("ValueError", "host said no"))
}

fn demo_loader(name: &str) -> Option<ForeignFn> {
    match name {
        "shout" => Some(shout),
        "total" => Some(total),
        "fail" => Some(fail),
        _ => None,
    }
}

const DEMO_SEED: &[&str] = &[
    "F shout (String):String",
    "F total (Integer, Integer):Integer",
    "F fail ()",
    "R counter Integer",
    "Z",
];

fn demo_state() -> State {
    let mut state = State::new(Options::default());
    assert!(state.register_package("demo", DEMO_SEED, demo_loader));
    state
}

fn run_in(state: &mut State, source: &str) -> String {
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to("test", ParseMode::NoTags, source, &mut print);
    assert!(
        ok,
        "run failed: {}",
        state.get_error().map_or_else(|| "?".to_string(), ToString::to_string)
    );
    print.take()
}

#[test]
fn foreign_functions_receive_typed_args_and_return_values() {
    let mut state = demo_state();
    assert_eq!(run_in(&mut state, "print(demo.shout(\"hey\"))"), "HEY\n");
    assert_eq!(run_in(&mut state, "print(demo.total(20, 22))"), "42\n");
}

#[test]
fn foreign_raises_surface_as_typed_exceptions() {
    let mut state = demo_state();
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to("test", ParseMode::NoTags, "demo.fail()", &mut print);
    assert!(!ok);
    let err = state.get_error().expect("error recorded");
    assert_eq!(err.class_name, "ValueError");
    assert_eq!(err.message, "host said no");
}

#[test]
fn foreign_raises_are_catchable_in_source() {
    let mut state = demo_state();
    let out = run_in(
        &mut state,
        "try: demo.fail() except ValueError as e: print(e.message)",
    );
    assert_eq!(out, "host said no\n");
}

#[test]
fn package_vars_read_and_write() {
    let mut state = demo_state();
    let out = run_in(
        &mut state,
        "demo.counter = 5\n\
         demo.counter += 2\n\
         print(demo.counter)",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn package_vars_persist_across_runs() {
    let mut state = demo_state();
    run_in(&mut state, "demo.counter = 41");
    assert_eq!(run_in(&mut state, "print(demo.counter + 1)"), "42\n");
}

#[test]
fn seed_classes_report_their_runtime_ids() {
    let mut state = State::new(Options::default());
    assert!(state.register_package(
        "conn",
        &["C Conn", "m close (Conn)", "Z"],
        |_| Some(fail as ForeignFn),
    ));
    let table = state.class_id_table("conn").expect("cid table recorded");
    assert_eq!(table.len(), 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut state = demo_state();
    assert!(!state.register_package("demo", DEMO_SEED, demo_loader));
}

#[test]
fn prepared_calls_with_pushed_arguments() {
    let mut state = State::new(Options::default());
    run_in(
        &mut state,
        "define double(x: Integer): Integer { return x * 2 }",
    );
    state.push_integer(21);
    assert!(state.prepare_call("double"));
    let mut print = CollectPrint::new();
    assert!(
        state.exec_prepared_to(&mut print),
        "prepared call failed: {:?}",
        state.get_error()
    );
    assert_eq!(state.result_integer(), Some(42));
    state.clear_stack();
}

#[test]
fn prepared_calls_check_arity() {
    let mut state = State::new(Options::default());
    run_in(
        &mut state,
        "define double(x: Integer): Integer { return x * 2 }",
    );
    assert!(state.prepare_call("double"));
    assert!(!state.exec_prepared_to(&mut CollectPrint::new()));
    let err = state.get_error().expect("arity error recorded");
    assert_eq!(err.class_name, "BadValue");
}

#[test]
fn prepared_calls_render_results() {
    let mut state = State::new(Options::default());
    run_in(
        &mut state,
        "define greet(who: String): String { return \"hi \" + who }",
    );
    state.push_string("lily");
    assert!(state.prepare_call("greet"));
    assert!(state.exec_prepared_to(&mut CollectPrint::new()));
    assert_eq!(state.result_render().as_deref(), Some("hi lily"));
}

#[test]
fn sys_argv_is_a_string_list() {
    let options = Options {
        argv: vec!["prog".to_string(), "alpha".to_string()],
        ..Options::default()
    };
    let mut state = State::new(options);
    let out = run_in(&mut state, "import sys\nprint(sys.argv[1])");
    assert_eq!(out, "alpha\n");
}

#[test]
fn allow_sys_false_suppresses_the_package() {
    let options = Options {
        allow_sys: false,
        ..Options::default()
    };
    let mut state = State::new(options);
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to("test", ParseMode::NoTags, "import sys", &mut print);
    assert!(!ok);
    assert_eq!(state.get_error().expect("error").class_name, "Import");
}

#[test]
fn tag_mode_interleaves_page_text_and_code() {
    let mut state = State::new(Options::default());
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to(
        "page",
        ParseMode::Tags,
        "<h1><@lily print(\"hi\") @></h1>",
        &mut print,
    );
    assert!(ok, "template failed: {:?}", state.get_error());
    assert_eq!(print.take(), "<h1>hi\n</h1>");
}

#[test]
fn custom_html_sender_receives_page_text() {
    use std::{cell::RefCell, rc::Rc};
    let chunks: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = Rc::clone(&chunks);
    let options = Options {
        html_sender: Some(Box::new(move |text: &str| {
            sink.borrow_mut().push(text.to_string());
        })),
        ..Options::default()
    };
    let mut state = State::new(options);
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to(
        "page",
        ParseMode::Tags,
        "<a><@lily print(\"x\") @><b>",
        &mut print,
    );
    assert!(ok, "template failed: {:?}", state.get_error());
    assert_eq!(print.take(), "x\n");
    assert_eq!(*chunks.borrow(), vec!["<a>".to_string(), "<b>".to_string()]);
}

#[test]
fn chunks_accumulate_like_a_repl() {
    let mut state = State::new(Options::default());
    let mut print = CollectPrint::new();
    assert!(state.parse_chunk_to("var x = 1", &mut print));
    assert!(state.parse_chunk_to("x += 10", &mut print));
    assert!(state.parse_chunk_to("print(x + 1)", &mut print));
    assert_eq!(print.take(), "12\n");
}

#[test]
fn a_failed_chunk_does_not_poison_the_next() {
    let mut state = State::new(Options::default());
    let mut print = CollectPrint::new();
    assert!(state.parse_chunk_to("var x = 5", &mut print));
    assert!(!state.parse_chunk_to("var y = ", &mut print));
    assert!(state.parse_chunk_to("print(x)", &mut print));
    assert_eq!(print.take(), "5\n");
}

#[test]
fn callback_sources_feed_the_lexer_on_demand() {
    let mut state = State::new(Options::default());
    let mut lines = vec!["var x = 40\n".to_string(), "print(x + 2)\n".to_string()].into_iter();
    let mut print = CollectPrint::new();
    let ok = state.parse_callback_to(
        "cb",
        ParseMode::NoTags,
        Box::new(move || lines.next()),
        &mut print,
    );
    assert!(ok, "callback parse failed: {:?}", state.get_error());
    assert_eq!(print.take(), "42\n");
}

struct Counter {
    hits: i64,
}

fn counter_new(ctx: &mut ForeignCall<'_>) -> Result<(), ForeignRaise> {
    // The class id comes from the seed's cid table; this demo package
    // declares exactly one class.
    ctx.result_foreign(COUNTER_CLASS.load(std::sync::atomic::Ordering::Relaxed), Box::new(Counter { hits: 0 }), None);
    Ok(())
}

fn counter_hits(ctx: &mut ForeignCall<'_>) -> Result<(), ForeignRaise> {
    let counter = ctx.arg_foreign::<Counter>(0)?;
    ctx.result_integer(counter.hits);
    Ok(())
}

static COUNTER_CLASS: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(0);

fn counter_loader(name: &str) -> Option<ForeignFn> {
    match name {
        "make" => Some(counter_new),
        "hits" => Some(counter_hits),
        _ => None,
    }
}

#[test]
fn foreign_values_round_trip_through_the_vm() {
    let mut state = State::new(Options::default());
    assert!(state.register_package(
        "tally",
        &["C Counter", "m hits (Counter):Integer", "F make ():Counter", "Z"],
        counter_loader,
    ));
    let table = state.class_id_table("tally").expect("cid table");
    COUNTER_CLASS.store(table[0], std::sync::atomic::Ordering::Relaxed);

    let mut print = CollectPrint::new();
    let ok = state.parse_string_to(
        "test",
        ParseMode::NoTags,
        "var c = tally.make()\nprint(c.hits())",
        &mut print,
    );
    assert!(ok, "foreign round trip failed: {:?}", state.get_error());
    assert_eq!(print.take(), "0\n");
}

#[test]
fn nil_package_var_read_raises_no_value() {
    let mut state = demo_state();
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to(
        "test",
        ParseMode::NoTags,
        "print(demo.counter)",
        &mut print,
    );
    assert!(!ok);
    assert_eq!(state.get_error().expect("error").class_name, "NoValue");
}
