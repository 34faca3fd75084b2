//! Diagnostics for Alder
//!
//! Errors are collected, not thrown: every pipeline stage owns a [`Reporter`]
//! and pushes diagnostics into it. The interpreter checks `pending` at stage
//! and instruction boundaries and flushes the batch with source context.

use std::fmt;
use std::io::Write;
use std::rc::Rc;

/// A region of source text. Carries handles to the file name and the full
/// source so a diagnostic can be formatted without further lookups.
#[derive(Debug, Clone)]
pub struct Loc {
    pub file: Rc<str>,
    pub text: Rc<str>,
    pub index: usize,
    pub len: usize,
}

impl Loc {
    pub fn new(file: Rc<str>, text: Rc<str>, index: usize, len: usize) -> Self {
        Loc { file, text, index, len }
    }

    /// 1-based line number of the start of the region.
    pub fn line(&self) -> usize {
        1 + self.text[..self.index.min(self.text.len())]
            .bytes()
            .filter(|&b| b == b'\n')
            .count()
    }

    /// 1-based column number of the start of the region.
    pub fn column(&self) -> usize {
        1 + self.index - self.line_start()
    }

    fn line_start(&self) -> usize {
        self.text[..self.index.min(self.text.len())]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// The full source line containing the start of the region.
    pub fn source_line(&self) -> &str {
        let start = self.line_start();
        let rest = &self.text[start..];
        match rest.find('\n') {
            Some(end) => &rest[..end],
            None => rest,
        }
    }

    pub fn index_in_line(&self) -> usize {
        self.index - self.line_start()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Fatal,
    Killed,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Fatal => "error",
            Severity::Killed => "killed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub loc: Loc,
    pub sev: Severity,
    pub msg: String,
}

/// Accumulator for diagnostics. `pending` is set by any push; `fatal` only by
/// fatal or killed pushes.
#[derive(Debug, Default)]
pub struct Reporter {
    pub diags: Vec<Diagnostic>,
    pub pending: bool,
    pub fatal: bool,
}

impl Reporter {
    pub fn new() -> Self {
        Reporter::default()
    }

    pub fn push(&mut self, loc: Loc, sev: Severity, msg: impl Into<String>) {
        self.pending = true;
        if sev >= Severity::Fatal {
            self.fatal = true;
        }
        self.diags.push(Diagnostic { loc, sev, msg: msg.into() });
    }

    pub fn clear(&mut self) {
        self.diags.clear();
        self.pending = false;
        self.fatal = false;
    }

    /// Write every collected diagnostic with the offending line and a
    /// caret-and-squiggle underline.
    pub fn write(&self, out: &mut dyn Write) {
        for d in &self.diags {
            let line = d.loc.source_line();
            let col = d.loc.index_in_line();
            let len = d.loc.len.max(1).min(line.len().saturating_sub(col).max(1));

            let _ = writeln!(
                out,
                "{}:{}:{}: {}: {}",
                d.loc.file,
                d.loc.line(),
                d.loc.column(),
                d.sev,
                d.msg
            );
            let _ = writeln!(out, "\t{}", line);
            let mut underline = String::new();
            for ch in line[..col.min(line.len())].chars() {
                underline.push(if ch == '\t' { '\t' } else { ' ' });
            }
            underline.push('^');
            for _ in 1..len {
                underline.push('~');
            }
            let _ = writeln!(out, "\t{}", underline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(text: &str, index: usize, len: usize) -> Loc {
        Loc::new(Rc::from("test.ald"), Rc::from(text), index, len)
    }

    #[test]
    fn test_line_and_column() {
        let l = loc("var x = 1;\nvar y = 2;\n", 15, 1);
        assert_eq!(l.line(), 2);
        assert_eq!(l.column(), 5);
        assert_eq!(l.source_line(), "var y = 2;");
    }

    #[test]
    fn test_reporter_severity_flags() {
        let mut r = Reporter::new();
        r.push(loc("x", 0, 1), Severity::Warning, "meh");
        assert!(r.pending);
        assert!(!r.fatal);
        r.push(loc("x", 0, 1), Severity::Fatal, "boom");
        assert!(r.fatal);
    }

    #[test]
    fn test_diagnostic_format() {
        let mut r = Reporter::new();
        r.push(loc("var x = ;\n", 8, 1), Severity::Fatal, "expected an expression");
        let mut buf = Vec::new();
        r.write(&mut buf);
        let s = String::from_utf8(buf).unwrap();
        assert!(s.contains("test.ald:1:9: error: expected an expression"));
        assert!(s.contains("var x = ;"));
        assert!(s.contains('^'));
    }
}
