//! Hybrid collector behavior observable through `gc_stats`.

use lily::{CollectPrint, Options, ParseMode, State};
use pretty_assertions::assert_eq;

fn state_with(source: &str, options: Options) -> State {
    let mut state = State::new(options);
    let mut print = CollectPrint::new();
    let ok = state.parse_string_to("test", ParseMode::NoTags, source, &mut print);
    assert!(
        ok,
        "run failed: {}",
        state.get_error().map_or_else(|| "?".to_string(), ToString::to_string)
    );
    state
}

#[test]
fn refcounting_reclaims_replaced_values() {
    let mut state = state_with("var a: Any = 1", Options::default());
    let before = state.gc_stats().tagged_objects;
    // Replacing the Any rewraps; the old box dies by refcount, so the
    // tagged population is stable.
    let mut print = CollectPrint::new();
    assert!(state.parse_chunk_to("a = 2", &mut print));
    assert_eq!(state.gc_stats().tagged_objects, before);
}

#[test]
fn a_cycle_survives_refcounting_and_dies_in_one_pass() {
    // l[0] = l builds List[Any] <-> Any cycle.
    let mut state = state_with(
        "var l: List[Any] = [0]\n\
         l[0] = l",
        Options::default(),
    );
    let with_cycle = state.gc_stats().tagged_objects;
    assert!(with_cycle >= 2, "list and wrapper are both tagged");

    // Point l elsewhere: the cycle's refcounts keep each other alive.
    let mut print = CollectPrint::new();
    assert!(state.parse_chunk_to("l = [9]", &mut print));
    let before_collect = state.gc_stats().tagged_objects;
    assert!(
        before_collect > 2,
        "the unreferenced cycle still occupies the tagged set"
    );

    state.collect_garbage();
    let after = state.gc_stats().tagged_objects;
    // Only the new list and its wrapped element remain.
    assert_eq!(after, 2);
}

#[test]
fn collection_destroys_each_cycle_member_exactly_once() {
    // Repeated passes over an already-clean heap must be stable.
    let mut state = state_with(
        "var l: List[Any] = [0]\n\
         l[0] = l\n\
         l = [1]",
        Options::default(),
    );
    state.collect_garbage();
    let first = state.gc_stats();
    state.collect_garbage();
    let second = state.gc_stats();
    assert_eq!(first.tagged_objects, second.tagged_objects);
    assert_eq!(first.live_objects, second.live_objects);
    assert_eq!(second.pass, first.pass + 1);
}

#[test]
fn crossing_the_threshold_triggers_a_pass() {
    let options = Options {
        gc_start: 4,
        ..Options::default()
    };
    let state = state_with(
        "var a: Any = 1\n\
         var b: Any = 2\n\
         var c: Any = 3\n\
         var d: Any = 4\n\
         var e: Any = 5\n\
         var f: Any = 6",
        options,
    );
    let stats = state.gc_stats();
    assert!(stats.pass >= 1, "allocations crossed gc_start: {stats:?}");
    // Everything is rooted in globals, so nothing was reclaimed.
    assert_eq!(stats.tagged_objects, 6);
}

#[test]
fn threshold_grows_by_the_multiplier() {
    let options = Options {
        gc_start: 4,
        gc_multiplier: 3,
        ..Options::default()
    };
    let mut state = state_with("var a = 1", options);
    assert_eq!(state.gc_stats().threshold, 4);
    state.collect_garbage();
    assert_eq!(state.gc_stats().threshold, 12);
    state.collect_garbage();
    assert_eq!(state.gc_stats().threshold, 36);
}

#[test]
fn rooted_values_survive_passes() {
    let mut state = state_with(
        "var keep: List[Any] = [1, 2, 3]\n\
         var l: List[Any] = [0]\n\
         l[0] = l\n\
         l = keep",
        Options::default(),
    );
    state.collect_garbage();
    let mut print = CollectPrint::new();
    assert!(state.parse_chunk_to("print(keep[1].@(Integer))", &mut print));
    assert_eq!(print.take(), "2\n");
}
