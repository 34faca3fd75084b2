//! End-to-end language tests
//!
//! Each test compiles and runs a small program through the library with a
//! captured output sink and checks what it printed.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use alder::{Interp, Value};
use quickcheck_macros::quickcheck;

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn take(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

/// Run a program; returns (stdout, stderr, result-or-error).
fn run(src: &str) -> (String, String, Result<Value, alder::LoadError>) {
    let out = SharedBuf::default();
    let err = SharedBuf::default();
    let mut k = Interp::with_output(Box::new(out.clone()), Box::new(err.clone()));
    let result = k.run_source(src, "test");
    (out.take(), err.take(), result)
}

fn output_of(src: &str) -> String {
    let (out, err, result) = run(src);
    assert!(result.is_ok(), "program failed: {}", err);
    out
}

// ===== seed programs =====

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(output_of("println 2 + 3 * 4"), "14\n");
}

#[test]
fn test_regex_substitution() {
    assert_eq!(output_of(r#"var s = "foo"; s ~= /o+/"0"; println s"#), "f0\n");
}

#[test]
fn test_for_each() {
    assert_eq!(
        output_of(r#"for var x = [10, 20, 30]: print x, ",""#),
        "10,20,30,"
    );
}

#[test]
fn test_table_members() {
    assert_eq!(output_of("var t = {a = 1, b = 2}; println t.a + t.b"), "3\n");
}

#[test]
fn test_fn_default_argument() {
    assert_eq!(output_of("fn f(x = 5) = x * 2; println f(), f(7)"), "10 14\n");
}

#[test]
fn test_eval() {
    assert_eq!(output_of(r#"println eval("1 + 2 + 3")"#), "6\n");
}

#[test]
fn test_range_push_join() {
    assert_eq!(
        output_of(r#"var a = []; for x = 0..2: push(a, x); println join(a, "-")"#),
        "0-1-2\n"
    );
}

#[test]
fn test_die_writes_killed() {
    let (_, err, result) = run(r#"die "boom";"#);
    assert!(result.is_err());
    assert!(err.contains("killed: boom"), "stderr was: {}", err);
}

// ===== control flow =====

#[test]
fn test_if_else() {
    assert_eq!(output_of("if 1 < 2: println \"yes\"; else: println \"no\";"), "yes\n");
    assert_eq!(output_of("if 2 < 1: println \"yes\"; else: println \"no\";"), "no\n");
}

#[test]
fn test_while_with_last_and_next() {
    let src = r#"
        var i = 0;
        var total = 0;
        while true {
            i = i + 1;
            next when i % 2 == 0;
            last when i > 7;
            total = total + i;
        }
        println total;
    "#;
    // 1 + 3 + 5 + 7 = 16
    assert_eq!(output_of(src), "16\n");
}

#[test]
fn test_do_while() {
    assert_eq!(output_of("var i = 0; do: i = i + 1; while i < 3; println i;"), "3\n");
}

#[test]
fn test_c_style_for() {
    assert_eq!(output_of("for var i = 0; i < 3; i++ { print i; }"), "012");
}

#[test]
fn test_implicit_for() {
    assert_eq!(output_of("for [1, 2, 3]: print _;"), "123");
}

#[test]
fn test_for_iterates_in_order() {
    assert_eq!(
        output_of("var seen = []; for var x = [3, 1, 2]: push(seen, x); println join(seen, \"\");"),
        "312\n"
    );
}

#[test]
fn test_nested_loops() {
    let src = r#"
        for var i = [1, 2] {
            for var j = [10, 20]: print i * j, ";";
        }
    "#;
    assert_eq!(output_of(src), "10;20;20;40;");
}

#[test]
fn test_goto_with_when() {
    let src = r#"
        var i = 0;
        top: i = i + 1;
        goto top when i < 3;
        println i;
    "#;
    assert_eq!(output_of(src), "3\n");
}

#[test]
fn test_statement_when_suffix() {
    assert_eq!(output_of("println \"a\" when 1 < 2; println \"b\" when 2 < 1;"), "a\n");
}

#[test]
fn test_ternary() {
    assert_eq!(output_of("println 1 < 2 ? \"lo\" : \"hi\";"), "lo\n");
}

#[test]
fn test_short_circuit() {
    // The right side would be fatal if evaluated.
    assert_eq!(output_of("fn boom() { die \"no\"; } println false && boom();"), "false\n");
    assert_eq!(output_of("fn boom() { die \"no\"; } println true || boom();"), "true\n");
}

// ===== functions =====

#[test]
fn test_recursion() {
    assert_eq!(
        output_of("fn fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2); println fib(10);"),
        "55\n"
    );
}

#[test]
fn test_fn_block_body_and_return() {
    let src = r#"
        fn classify(n) {
            return "small" when n < 10;
            return "big";
        }
        println classify(3), classify(30);
    "#;
    assert_eq!(output_of(src), "small big\n");
}

#[test]
fn test_fn_fallthrough_returns_nil() {
    assert_eq!(output_of("fn f() { } println type(f());"), "nil\n");
}

#[test]
fn test_globals_visible_in_fn() {
    assert_eq!(output_of("var g = 41; fn f() = g + 1; println f();"), "42\n");
}

#[test]
fn test_varargs() {
    let src = r#"
        fn total() { var args = ...; return sum(args); }
        println total(1, 2, 3);
    "#;
    assert_eq!(output_of(src), "6\n");
}

#[test]
fn test_fn_value_in_table() {
    let src = r#"
        fn double(t, x) = x * 2;
        var obj = {f = double};
        println obj.f(21);
    "#;
    assert_eq!(output_of(src), "42\n");
}

// ===== values and builtins =====

#[test]
fn test_string_concat_stringifies() {
    assert_eq!(output_of(r#"println "n = " + 4;"#), "n = 4\n");
}

#[test]
fn test_copy_is_deep() {
    let src = r#"
        var a = [1, 2];
        var b = copy(a);
        push(b, 3);
        println len(a), len(b);
    "#;
    assert_eq!(output_of(src), "2 3\n");
}

#[test]
fn test_type_names() {
    assert_eq!(
        output_of(r#"println type(1), type(1.5), type("s"), type([1]), type({a = 1}), type(true);"#),
        "integer float string array table boolean\n"
    );
}

#[test]
fn test_len_of_string_and_array() {
    assert_eq!(output_of(r#"println len("hello"), len([1, 2, 3]);"#), "5 3\n");
}

#[test]
fn test_sort_reverse_min_max() {
    assert_eq!(
        output_of("var a = [3, 1, 2]; println join(sort(a), \"\"), join(reverse(sort(a)), \"\"), min(a), max(a);"),
        "123 321 1 3\n"
    );
}

#[test]
fn test_case_builtins() {
    assert_eq!(
        output_of(r#"println uc("abc"), lc("ABC"), ucfirst("abc"), lcfirst("ABC");"#),
        "ABC abc Abc aBC\n"
    );
}

#[test]
fn test_chr_ord() {
    assert_eq!(output_of(r#"println chr(97), ord("a");"#), "a 97\n");
}

#[test]
fn test_keys_values() {
    let src = r#"
        var t = {x = 1};
        println join(keys(t), ""), join(values(t), "");
    "#;
    assert_eq!(output_of(src), "x 1\n");
}

#[test]
fn test_pop_shift_insert() {
    let src = r#"
        var a = [1, 2, 3];
        var last = pop(a);
        var first = shift(a);
        insert(a, 0, 9);
        println last, first, join(a, "");
    "#;
    assert_eq!(output_of(src), "3 1 92\n");
}

#[test]
fn test_enum() {
    assert_eq!(output_of("enum { A, B = 3, C } println A, B, C;"), "0 3 4\n");
}

#[test]
fn test_string_interpolation() {
    assert_eq!(output_of(r#"var x = 4; println "x is $x";"#), "x is 4\n");
    assert_eq!(output_of(r#"var a = 2; var b = 3; println "${a + b}!";"#), "5!\n");
}

#[test]
fn test_comprehension() {
    assert_eq!(
        output_of(r#"println join([x * 2 for var x = [1, 2, 3]], ",");"#),
        "2,4,6\n"
    );
    assert_eq!(
        output_of(r#"println join([_ + 1 for [1, 2]], ",");"#),
        "2,3\n"
    );
}

#[test]
fn test_match_expression() {
    let src = r#"
        fn judge(s) = match s {
            /^\d+$/: "number",
            "yes": "affirmative",
        };
        println judge("42"), judge("yes"), type(judge("?"));
    "#;
    assert_eq!(output_of(src), "number affirmative nil\n");
}

#[test]
fn test_subscript_assignment_vivifies() {
    assert_eq!(output_of("var a; a[0] = 5; a[2] = 7; println a[0], type(a[1]), a[2];"), "5 nil 7\n");
    assert_eq!(output_of(r#"var t; t["k"] = 3; println t.k;"#), "3\n");
}

#[test]
fn test_nested_table_assignment() {
    assert_eq!(output_of("var t; t.a.b = 1; println t.a.b;"), "1\n");
}

#[test]
fn test_string_index_assignment_splices() {
    assert_eq!(output_of(r#"var s = "cat"; s[0] = "b"; println s;"#), "bat\n");
}

#[test]
fn test_slice() {
    assert_eq!(output_of(r#"println join([1, 2, 3, 4][1:3], "");"#), "23\n");
    assert_eq!(output_of(r#"println "hello"[1:4];"#), "ell\n");
}

#[test]
fn test_increment_decrement() {
    assert_eq!(output_of("var i = 5; println i++, i, ++i, --i, i--;"), "5 6 7 6 6\n");
}

#[test]
fn test_compound_assignment() {
    assert_eq!(output_of("var x = 10; x += 5; x -= 3; x *= 2; x /= 4; println x;"), "6\n");
}

// ===== boundary behaviors =====

#[test]
fn test_array_negative_index_is_nil() {
    assert_eq!(output_of("var a = [1]; println type(a[-1]);"), "nil\n");
}

#[test]
fn test_array_past_end_is_nil() {
    assert_eq!(output_of("var a = [1]; println type(a[5]);"), "nil\n");
}

#[test]
fn test_string_index_at_len_is_nil() {
    assert_eq!(output_of(r#"var s = "abc"; println type(s[3]), s[0];"#), "nil a\n");
}

#[test]
fn test_one_element_range() {
    assert_eq!(output_of("println len(1 .. 1);"), "1\n");
}

#[test]
fn test_range_step_sign_is_fatal() {
    let (_, err, result) = run("println range(1, 5, -1);");
    assert!(result.is_err());
    assert!(err.contains("step"), "stderr was: {}", err);
}

#[test]
fn test_division_by_zero_is_fatal() {
    let (_, err, result) = run("println 1 / 0;");
    assert!(result.is_err());
    assert!(err.contains("division by zero"), "stderr was: {}", err);
}

#[test]
fn test_string_truthiness_is_false() {
    assert_eq!(output_of(r#"println "x" ? "t" : "f";"#), "f\n");
}

#[test]
fn test_group_out_of_range_is_fatal() {
    let (_, err, result) = run(r#"var s = "ab"; var m = s ~= /(a)/; println $5;"#);
    assert!(result.is_err());
    assert!(err.contains("group"), "stderr was: {}", err);
}

#[test]
fn test_eval_return_inside_fn_returns_from_eval() {
    let src = r#"
        fn f() {
            var x = eval("return 1");
            return x + 1;
        }
        println f();
    "#;
    assert_eq!(output_of(src), "2\n");
}

#[test]
fn test_eval_sees_enclosing_scope() {
    assert_eq!(output_of(r#"var x = 10; println eval("x + 5");"#), "15\n");
}

#[test]
fn test_eval_next_escapes_to_parent_loop() {
    let src = r#"
        var total = 0;
        for var i = [1, 2, 3, 4] {
            eval("next") when i % 2 == 0;
            total = total + i;
        }
        println total;
    "#;
    assert_eq!(output_of(src), "4\n");
}

#[test]
fn test_undeclared_identifier_is_compile_error() {
    let (_, err, result) = run("println nope;");
    assert!(result.is_err());
    assert!(err.contains("undeclared"), "stderr was: {}", err);
}

#[test]
fn test_suppressed_output() {
    let out = SharedBuf::default();
    let err = SharedBuf::default();
    let mut k = Interp::with_output(Box::new(out.clone()), Box::new(err.clone()));
    k.opts.talkative = false;
    k.run_source("println 42;", "test").unwrap();
    assert_eq!(out.take(), "");
}

#[test]
fn test_module_result_value() {
    let (_, _, result) = run("1 + 1");
    assert!(matches!(result.unwrap(), Value::Int(2)));
}

// ===== regex-driven control flow =====

#[test]
fn test_for_regex_iterates_matches() {
    let src = r#"
        var s = "a1 b22 c333";
        for var x; s ~= /\d+/g: print x, ";";
    "#;
    assert_eq!(output_of(src), "1;22;333;");
}

#[test]
fn test_for_regex_groups() {
    let src = r#"
        var s = "x=1 y=2";
        for var x; s ~= /(\w)=(\d)/g: print $1, $2, ";";
    "#;
    assert_eq!(output_of(src), "x 1;y 2;");
}

#[test]
fn test_split_builtin() {
    assert_eq!(
        output_of(r#"println join(split(/,/, "a,b,c"), "-");"#),
        "a-b-c\n"
    );
}

#[test]
fn test_evaluated_substitution() {
    // With the `e` flag the replacement is compiled as source and
    // evaluated once per match, `_` bound to the match text.
    let src = r#"
        var s = "a1b2";
        s ~= /\d/"int(_) * 2"ge;
        println s;
    "#;
    assert_eq!(output_of(src), "a2b4\n");
}

// ===== round trips =====

#[quickcheck]
fn prop_int_str_roundtrip(n: i32) -> bool {
    let (out, _, result) = run(&format!("println int(str({}));", n));
    result.is_ok() && out.trim() == n.to_string()
}

#[quickcheck]
fn prop_copy_equal_and_independent(items: Vec<u8>) -> bool {
    let list = items
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let src = format!(
        "var a = [{}]; var b = copy(a); push(b, 1); println len(b) - len(a);",
        list
    );
    let (out, _, result) = run(&src);
    result.is_ok() && out.trim() == "1"
}

#[test]
fn test_join_split_roundtrip() {
    assert_eq!(
        output_of(r#"println join(split(/-/, "a-b-c"), "-");"#),
        "a-b-c\n"
    );
}
