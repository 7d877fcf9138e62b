//! End-to-end language behavior: parse a source string on a fresh state,
//! run it, and check what `print` produced.

use lily::{CollectPrint, Options, ParseMode, State};
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

#[test]
fn arithmetic_precedence() {
    // Multiplication binds below the add in the tree, so it runs first.
    assert_eq!(run("var a = 5 + 6 * 7 print(a)"), "47\n");
}

#[test]
fn parenthesized_grouping() {
    assert_eq!(run("print((5 + 6) * 7)"), "77\n");
}

#[test]
fn mixed_numeric_promotes_to_double() {
    assert_eq!(run("print(1 + 0.5)"), "1.5\n");
}

#[test]
fn integer_division_truncates() {
    assert_eq!(run("print(7 / 2)"), "3\n");
}

#[test]
fn modulo_and_shifts() {
    assert_eq!(run("print(7 % 3)"), "1\n");
    assert_eq!(run("print(1 << 4)"), "16\n");
    assert_eq!(run("print(32 >> 2)"), "8\n");
}

#[test]
fn bitwise_binds_above_equality() {
    assert_eq!(run("print(18 & 0x10 == 16)"), "true\n");
}

#[test]
fn string_concat() {
    assert_eq!(run("print(\"ab\" + \"cd\")"), "abcd\n");
}

#[test]
fn string_ordering() {
    assert_eq!(run("print(\"abc\" < \"abd\")"), "true\n");
}

#[test]
fn unary_operators() {
    assert_eq!(run("print(-(2 + 3))"), "-5\n");
    assert_eq!(run("print(!false)"), "true\n");
}

#[test]
fn comparisons_yield_booleans() {
    assert_eq!(run("print(1 < 2) print(2 <= 1) print(3 == 3)"), "true\nfalse\ntrue\n");
}

#[test]
fn short_circuit_and_or() {
    assert_eq!(run("print(true && false)"), "false\n");
    assert_eq!(run("print(false || true)"), "true\n");
    // The right side must not run when the left decides.
    let out = run(
        "define boom(): Boolean { print(\"ran\") return true }\n\
         print(false && boom())",
    );
    assert_eq!(out, "false\n");
}

#[test]
fn if_elif_else_single_statement_form() {
    let out = run(
        "var a = 10\n\
         if a > 10: print(\"big\") elif a == 10: print(\"ten\") else: print(\"small\")",
    );
    assert_eq!(out, "ten\n");
}

#[test]
fn if_brace_form_with_else() {
    let out = run(
        "if 1 > 2: {\n\
             print(\"one\")\n\
         else:\n\
             print(\"two\")\n\
         }",
    );
    assert_eq!(out, "two\n");
}

#[test]
fn while_loop_accumulates() {
    let out = run(
        "var i = 0\n\
         var total = 0\n\
         while i < 5: {\n\
             total += i\n\
             i += 1\n\
         }\n\
         print(total)",
    );
    assert_eq!(out, "10\n");
}

#[test]
fn do_while_runs_at_least_once() {
    assert_eq!(run("var i = 0 do: { i += 1 } while i < 3 print(i)"), "3\n");
    assert_eq!(run("var i = 9 do: { i += 1 } while false print(i)"), "10\n");
}

#[test]
fn for_range_is_inclusive() {
    let out = run(
        "var total = 0\n\
         for i in 1...10: total += i\n\
         print(total)",
    );
    assert_eq!(out, "55\n");
}

#[test]
fn for_range_with_step() {
    let out = run(
        "var total = 0\n\
         for i in 10...0 by -2: total += i\n\
         print(total)",
    );
    assert_eq!(out, "30\n");
}

#[test]
fn break_and_continue() {
    let out = run(
        "var total = 0\n\
         for i in 1...10: {\n\
             if i == 3: continue\n\
             if i == 6: break\n\
             total += i\n\
         }\n\
         print(total)",
    );
    // 1 + 2 + 4 + 5; three skipped, loop ends at six.
    assert_eq!(out, "12\n");
}

#[test]
fn loop_variable_modification_does_not_change_the_walk() {
    let out = run(
        "var passes = 0\n\
         for i in 1...3: {\n\
             i = 100\n\
             passes += 1\n\
         }\n\
         print(passes)",
    );
    assert_eq!(out, "3\n");
}

#[test]
fn list_literal_subscript_and_assignment() {
    let out = run(
        "var l = [1, 2, 3]\n\
         l[0] = 9\n\
         print(l[0] + l[2])",
    );
    assert_eq!(out, "12\n");
}

#[test]
fn hash_literal_read_write_and_append() {
    let out = run(
        "var h = [\"a\" => 1, \"b\" => 2]\n\
         h[\"c\"] = 3\n\
         print(h[\"a\"] + h[\"c\"])",
    );
    assert_eq!(out, "4\n");
}

#[test]
fn integer_keyed_hash() {
    assert_eq!(run("var h = [10 => \"x\"] print(h[10])"), "x\n");
}

#[test]
fn tuple_literal_and_member_read() {
    assert_eq!(run("var t = <[1, \"x\"]> print(t[1])"), "x\n");
    assert_eq!(run("var t = <[1, \"x\"]> print(t[0] + 1)"), "2\n");
}

#[test]
fn define_and_call() {
    let out = run(
        "define add(a: Integer, b: Integer): Integer { return a + b }\n\
         print(add(2, 3))",
    );
    assert_eq!(out, "5\n");
}

#[test]
fn recursion() {
    let out = run(
        "define fib(n: Integer): Integer {\n\
             if n < 2: return n\n\
             return fib(n - 1) + fib(n - 2)\n\
         }\n\
         print(fib(10))",
    );
    assert_eq!(out, "55\n");
}

#[test]
fn varargs_collect_into_a_list() {
    let out = run(
        "define total(args: List[Integer]...): Integer {\n\
             var sum = 0\n\
             for i in 0...2: sum += args[i]\n\
             return sum\n\
         }\n\
         print(total(1, 2, 3))",
    );
    assert_eq!(out, "6\n");
}

#[test]
fn template_resolution_from_arguments() {
    let out = run(
        "define first[A](values: List[A]): A { return values[0] }\n\
         print(first([10, 20]))\n\
         print(first([\"x\", \"y\"]))",
    );
    assert_eq!(out, "10\nx\n");
}

#[test]
fn any_wraps_and_casts_back() {
    let out = run(
        "var a: Any = 10\n\
         print(a.@(Integer) + 1)",
    );
    assert_eq!(out, "11\n");
}

#[test]
fn int_double_typecasts() {
    assert_eq!(run("print(1.@(Double) + 0.25)"), "1.25\n");
    assert_eq!(run("print(3.9.@(Integer))"), "3\n");
}

#[test]
fn function_values_call_through_registers() {
    let out = run(
        "define double(x: Integer): Integer { return x * 2 }\n\
         var f = double\n\
         print(f(21))",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn lambda_with_parameters() {
    assert_eq!(run("var dbl = (|x: Integer| x * 2) print(dbl(21))"), "42\n");
}

#[test]
fn classes_properties_and_methods() {
    let out = run(
        "class Point(x: Integer) {\n\
             var @x = x\n\
             define getx(): Integer { return @x }\n\
         }\n\
         var p = Point(5)\n\
         print(p.x)\n\
         print(p.getx())",
    );
    assert_eq!(out, "5\n5\n");
}

#[test]
fn property_assignment_through_objects() {
    let out = run(
        "class Box(v: Integer) { var @v = v }\n\
         var b = Box(1)\n\
         b.v = 7\n\
         b.v += 1\n\
         print(b.v)",
    );
    assert_eq!(out, "8\n");
}

#[test]
fn inheritance_chains_the_parent_constructor() {
    let out = run(
        "class Animal(name: String) { var @name = name }\n\
         class Dog(name: String) < Animal(name) {\n\
             define label(): String { return @name + \"!\" }\n\
         }\n\
         var d = Dog(\"rex\")\n\
         print(d.label())\n\
         print(d.name)",
    );
    assert_eq!(out, "rex!\nrex\n");
}

#[test]
fn enums_build_and_match() {
    let out = run(
        "enum Color { Red, Green(Integer) }\n\
         var c = Color.Green(4)\n\
         match c: {\n\
             case Red: print(\"red\")\n\
             case Green(x): print(x)\n\
         }",
    );
    assert_eq!(out, "4\n");
}

#[test]
fn match_dispatches_on_the_variant() {
    let out = run(
        "enum Shape { Dot, Wide(Integer), Tall(Integer) }\n\
         define pick(s: Shape): Integer {\n\
             match s: {\n\
                 case Dot: return 0\n\
                 case Wide(w): return w\n\
                 case Tall(h): return -h\n\
             }\n\
             return -99\n\
         }\n\
         print(pick(Shape.Dot))\n\
         print(pick(Wide(7)))\n\
         print(pick(Tall(2)))",
    );
    assert_eq!(out, "0\n7\n-2\n");
}

#[test]
fn enum_methods_take_self() {
    let out = run(
        "enum Flag {\n\
             On, Off,\n\
             define flip(): Flag {\n\
                 match self: {\n\
                     case On: return Flag.Off\n\
                     case Off: return Flag.On\n\
                 }\n\
                 return Flag.On\n\
             }\n\
         }\n\
         var f = Flag.On\n\
         match f.flip(): {\n\
             case On: print(\"on\")\n\
             case Off: print(\"off\")\n\
         }",
    );
    assert_eq!(out, "off\n");
}

#[test]
fn show_renders_value_and_type() {
    assert_eq!(run("show 5 + 5"), "show: (Integer) 10\n");
    assert_eq!(run("show [1, 2]"), "show: (List[Integer]) [1, 2]\n");
}

#[test]
fn magic_literals() {
    assert_eq!(run("print(__line__)"), "1\n");
    assert_eq!(run("print(__file__)"), "test\n");
    let out = run("define where(): String { return __function__ }\nprint(where())");
    assert_eq!(out, "where\n");
}

#[test]
fn assignments_chain_right_to_left() {
    assert_eq!(run("var a = 1 var b = 2 a = b = 9 print(a + b)"), "18\n");
}

#[test]
fn nested_containers() {
    let out = run(
        "var grid = [[1, 2], [3, 4]]\n\
         print(grid[1][0])",
    );
    assert_eq!(out, "3\n");
}

#[test]
fn list_of_any_promotes_elements() {
    let out = run(
        "var mixed: List[Any] = [1, 2]\n\
         print(mixed[0].@(Integer) + 1)",
    );
    assert_eq!(out, "2\n");
}

#[test]
fn multi_line_strings() {
    assert_eq!(run("print(\"\"\"a\nb\"\"\")"), "a\nb\n");
}

#[test]
fn methods_survive_scope_exit_through_references() {
    // The define's var goes out of scope with the if block, but the
    // function value stored in f keeps the code callable.
    let out = run(
        "var f = (|x: Integer| x)\n\
         if true: {\n\
             define g(y: Integer): Integer { return y + 1 }\n\
             f = g\n\
         }\n\
         print(f(9))",
    );
    assert_eq!(out, "10\n");
}
