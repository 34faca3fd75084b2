//! Integration tests for regex behavior at the language level
//!
//! These compile and run small programs to verify end-to-end matching,
//! substitution and splitting through the VM's regex opcodes.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use alder::Interp;

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

fn run(src: &str) -> String {
    let out = SharedBuf::default();
    let err = SharedBuf::default();
    let mut k = Interp::with_output(Box::new(out.clone()), Box::new(err.clone()));
    let result = k.run_source(src, "test");
    assert!(
        result.is_ok(),
        "program failed: {}",
        String::from_utf8_lossy(&err.0.borrow())
    );
    let bytes = out.0.borrow();
    String::from_utf8_lossy(&bytes).into_owned()
}

// ===== core matching =====

#[test]
fn test_basic_match() {
    let out = run(r#"
        var s = "hello world";
        if s ~= /world/: print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_no_match_goes_to_else() {
    let out = run(r#"
        var s = "hello world";
        if s ~= /xyz/: print "FAIL";
        else: print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_negated_match() {
    let out = run(r#"
        var s = "hello world";
        if !(s ~= /xyz/): print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_wildcard() {
    let out = run(r#"
        var s = "hello";
        if s ~= /h.llo/: print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_anchors() {
    let out = run(r#"
        var s = "hello world";
        print "A" when s ~= /^hello/;
        print "B" when s ~= /world$/;
        print "C" when s ~= /^world/;
    "#);
    assert_eq!(out, "AB");
}

#[test]
fn test_case_sensitive_by_default() {
    let out = run(r#"
        var s = "Hello";
        if s ~= /hello/: print "FAIL";
        else: print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_insensitive_flag() {
    let out = run(r#"
        var s = "Hello";
        if s ~= /hello/i: print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_match_in_while_condition() {
    let out = run(r#"
        var s = "done";
        var count = 0;
        while (s ~= /run/) && count < 5 {
            count = count + 1;
        }
        print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_multiple_conditions() {
    let out = run(r#"
        var s = "hello world";
        if (s ~= /hello/) && !(s ~= /xyz/): print "PASS";
    "#);
    assert!(out.contains("PASS"));
}

#[test]
fn test_match_result_is_array_of_texts() {
    let out = run(r#"
        var s = "a1 b22 c333";
        var m = s ~= /\d+/g;
        println len(m), join(m, ",");
    "#);
    assert_eq!(out, "3 1,22,333\n");
}

#[test]
fn test_groups_after_match() {
    let out = run(r#"
        var s = "key=value";
        var m = s ~= /(\w+)=(\w+)/;
        println $1, $2;
    "#);
    assert_eq!(out, "key value\n");
}

#[test]
fn test_group_zero_is_whole_match() {
    let out = run(r#"
        var s = "abc123";
        var m = s ~= /\d+/;
        println $0;
    "#);
    assert_eq!(out, "123\n");
}

// ===== substitution =====

#[test]
fn test_substitution_first_match() {
    let out = run(r#"var s = "foo boo"; s ~= /o+/"0"; println s;"#);
    assert_eq!(out, "f0 boo\n");
}

#[test]
fn test_substitution_global() {
    let out = run(r#"var s = "foo boo"; s ~= /o+/"0"g; println s;"#);
    assert_eq!(out, "f0 b0\n");
}

#[test]
fn test_substitution_group_reference() {
    let out = run(r#"var s = "john smith"; s ~= /(\w+) (\w+)/"$2 $1"; println s;"#);
    assert_eq!(out, "smith john\n");
}

#[test]
fn test_substitution_case_escapes() {
    let out = run(r#"var s = "name"; s ~= /(\w+)/"\U$1"; println s;"#);
    assert_eq!(out, "NAME\n");
}

#[test]
fn test_substitution_no_match_keeps_string() {
    let out = run(r#"var s = "abc"; s ~= /xyz/"!"; println s;"#);
    assert_eq!(out, "abc\n");
}

// ===== splitting =====

#[test]
fn test_split_on_whitespace() {
    let out = run(r#"println join(split(/\s+/, "a  b   c"), "|");"#);
    assert_eq!(out, "a|b|c\n");
}

#[test]
fn test_split_keeps_empty_edges() {
    let out = run(r#"println len(split(/,/, ",a,"));"#);
    assert_eq!(out, "3\n");
}

// ===== iteration =====

#[test]
fn test_for_regex_with_variable() {
    let out = run(r#"
        var s = "one two three";
        for var w; s ~= /\w+/g: print w, ".";
    "#);
    assert_eq!(out, "one.two.three.");
}

#[test]
fn test_for_regex_implicit() {
    let out = run(r#"
        var s = "a b c";
        for s ~= /\w/g: print _;
    "#);
    assert_eq!(out, "abc");
}

#[test]
fn test_for_regex_loop_runs_once_per_match() {
    let out = run(r#"
        var s = "x1y2";
        var n = 0;
        for var d; s ~= /\d/g: n = n + 1;
        println n;
    "#);
    assert_eq!(out, "2\n");
}

#[test]
fn test_match_arm_with_regex() {
    let out = run(r#"
        println match "2024-01-01" {
            /^\d{4}-\d{2}-\d{2}$/: "date",
            /^\d+$/: "number",
        };
    "#);
    assert_eq!(out, "date\n");
}

#[test]
fn test_lookahead_at_language_level() {
    let out = run(r#"
        var s = "foobar foobaz";
        for var x; s ~= /foo(?=bar)/g: print x, ";";
    "#);
    assert_eq!(out, "foo;");
}

#[test]
fn test_backreference_at_language_level() {
    let out = run(r#"
        var s = "abab cdcd efgh";
        for var x; s ~= /(\w\w)\1/g: print x, ";";
    "#);
    assert_eq!(out, "abab;cdcd;");
}
