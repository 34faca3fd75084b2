//! Backtracking regular-expression engine
//!
//! A self-contained PCRE subset. Patterns parse into a node tree, compile
//! into a small instruction list, and run on a bounded pool of backtracking
//! threads in leftmost-first order. Case-insensitive matching works against
//! a lowercased mirror of the subject; unanchored matching is the compiled
//! prefix `.*?`.

use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReOpt: u32 {
        const INSENSITIVE = 1 << 0;
        const UNANCHORED  = 1 << 1;
        const EXTENDED    = 1 << 2;
        const GLOBAL      = 1 << 3;
        const MULTILINE   = 1 << 4;
    }
}

pub const MAX_GROUPS: usize = 100;
pub const MAX_THREAD: usize = 200;
pub const MAX_CALL_DEPTH: usize = 100;
pub const MEM_CAP: usize = 1_000_000;

const WHITESPACE: &[u8] = b" \t\r\n\x0b\x0c";
const DIGIT: &[u8] = b"0123456789";
const WORD: &[u8] = b"_0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, Error)]
pub enum RegexErrorKind {
    #[error("regex exceeded the maximum number of executable threads")]
    StackOverflow,
    #[error("regex exceeded the maximum depth for subroutine calls")]
    CallOverflow,
    #[error("{0}")]
    Syntax(String),
    #[error("regex exceeded the memory cap")]
    OutOfMemory,
    #[error("too many capture groups")]
    TooManyGroups,
}

/// A regex failure, carrying the byte offset into the pattern (for compile
/// errors) or into the last subject (for runtime errors).
#[derive(Debug, Clone, Error)]
#[error("{kind} (at offset {pos})")]
pub struct RegexError {
    pub kind: RegexErrorKind,
    pub pos: usize,
}

impl RegexError {
    fn new(kind: RegexErrorKind, pos: usize) -> Self {
        RegexError { kind, pos }
    }

    fn syntax(msg: impl Into<String>, pos: usize) -> Self {
        RegexError::new(RegexErrorKind::Syntax(msg.into()), pos)
    }
}

// ===== pattern AST =====

#[derive(Debug, Clone)]
enum Node {
    None,
    Char(u8),
    Str(Vec<u8>),
    Sequence(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Asterisk(Box<Node>),
    Plus(Box<Node>),
    Question(Box<Node>),
    /// Counted repetition `{lo}` / `{lo,}` (hi = -1) / `{lo,hi}`.
    Rep { a: Box<Node>, lo: i32, hi: i32 },
    Group { gi: usize, a: Box<Node> },
    Call(usize),
    Recurse,
    Any,
    Class(Vec<u8>),
    Not(Vec<u8>),
    Backref(usize),
    Bol,
    Eol,
    Bos,
    Eos,
    Wb,
    Nwb,
    Digit,
    Space,
    Word,
    SetOpt(ReOpt),
    SetStart,
    Atom(Box<Node>),
    Pla(Box<Node>),
    Nla(Box<Node>),
    Plb(Box<Node>),
    Nlb(Box<Node>),
}

#[derive(Debug, Clone, Default)]
struct GroupInfo {
    name: Option<String>,
    is_called: bool,
    is_compiled: bool,
    address: usize,
}

// ===== pattern parser =====

struct ReParser<'p> {
    pat: &'p [u8],
    sp: usize,
    popt: ReOpt,
    /// Group slots; index 0 is the whole-match group, so user groups are
    /// 1-based. `gp` is the live counter (branch reset rewinds it).
    groups: Vec<GroupInfo>,
    gp: usize,
    literal: bool,
}

type ReResult<T> = Result<T, RegexError>;

impl<'p> ReParser<'p> {
    fn new(pat: &'p [u8], opt: ReOpt) -> Self {
        ReParser {
            pat,
            sp: 0,
            popt: opt,
            groups: vec![GroupInfo::default()],
            gp: 1,
            literal: false,
        }
    }

    fn cur(&self) -> u8 {
        self.pat.get(self.sp).copied().unwrap_or(0)
    }

    fn peek(&self) -> u8 {
        self.pat.get(self.sp + 1).copied().unwrap_or(0)
    }

    fn next(&mut self) {
        self.sp += 1;
    }

    fn add_group(&mut self) -> ReResult<usize> {
        if self.gp >= MAX_GROUPS {
            return Err(RegexError::new(RegexErrorKind::TooManyGroups, self.sp));
        }
        if self.gp == self.groups.len() {
            self.groups.push(GroupInfo::default());
        }
        let gi = self.gp;
        self.gp += 1;
        Ok(gi)
    }

    fn dec_num(&mut self) -> i32 {
        let mut n = -1;
        while self.cur().is_ascii_digit() {
            if n < 0 {
                n = 0;
            }
            n = n * 10 + (self.cur() - b'0') as i32;
            self.next();
        }
        n
    }

    fn parse_dec_num(&mut self) -> ReResult<i32> {
        let n = self.dec_num();
        if n < 0 {
            return Err(RegexError::syntax("expected a number", self.sp));
        }
        Ok(n)
    }

    fn hex_num(&mut self) -> i32 {
        let mut n = -1;
        while self.cur().is_ascii_hexdigit() {
            if n < 0 {
                n = 0;
            }
            n = n * 16 + (self.cur() as char).to_digit(16).unwrap() as i32;
            self.next();
        }
        n
    }

    fn oct_num(&mut self) -> i32 {
        let mut n = -1;
        while (b'0'..=b'7').contains(&self.cur()) {
            if n < 0 {
                n = 0;
            }
            n = n * 8 + (self.cur() - b'0') as i32;
            self.next();
        }
        n
    }

    fn read_name(&mut self) -> String {
        let start = self.sp;
        while self.cur() != 0 && WORD.contains(&self.cur()) {
            self.next();
        }
        String::from_utf8_lossy(&self.pat[start..self.sp]).into_owned()
    }

    fn named_group_index(&self, name: &str) -> Option<usize> {
        self.groups[..self.gp]
            .iter()
            .position(|g| g.name.as_deref() == Some(name))
    }

    fn parse(&mut self) -> ReResult<Node> {
        let n = self.term()?;
        if self.cur() == b'|' {
            self.next();
            let m = self.parse()?;
            return Ok(Node::Or(Box::new(n), Box::new(m)));
        }
        Ok(n)
    }

    fn term(&mut self) -> ReResult<Node> {
        let mut left = Node::None;
        while self.cur() != 0 && self.cur() != b'|' && self.cur() != b')' {
            let right = self.factor()?;
            left = join(left, right, self.popt);
        }
        Ok(left)
    }

    fn factor(&mut self) -> ReResult<Node> {
        let mut left = self.parse_primary()?;

        while matches!(self.cur(), b'*' | b'+' | b'?' | b'{') {
            match self.cur() {
                b'*' => {
                    self.next();
                    left = self.iterable(Node::Asterisk(Box::new(left)))?;
                }
                b'+' => {
                    self.next();
                    left = self.iterable(Node::Plus(Box::new(left)))?;
                }
                b'?' => {
                    self.next();
                    left = self.iterable(Node::Question(Box::new(left)))?;
                }
                b'{' => {
                    self.next();
                    let lo = self.parse_dec_num()?;
                    let mut hi = 0;
                    if self.cur() == b',' {
                        self.next();
                        hi = if self.cur().is_ascii_digit() {
                            self.parse_dec_num()?
                        } else {
                            -1
                        };
                    }
                    if self.cur() != b'}' {
                        return Err(RegexError::syntax("unmatched '{'", self.sp));
                    }
                    self.next();
                    left = Node::Rep { a: Box::new(left), lo, hi };
                }
                _ => unreachable!(),
            }
        }

        Ok(left)
    }

    fn iterable(&self, n: Node) -> ReResult<Node> {
        let inner = match &n {
            Node::Asterisk(a) | Node::Plus(a) | Node::Question(a) => a,
            _ => return Ok(n),
        };
        if matches!(**inner, Node::SetOpt(_)) {
            return Err(RegexError::syntax("iteration on non-iteratable value", self.sp));
        }
        Ok(n)
    }

    fn parse_primary(&mut self) -> ReResult<Node> {
        if self.literal {
            if self.cur() == b'\\' && self.peek() == b'E' {
                self.literal = false;
                self.sp += 2;
                return self.parse_primary();
            }
            let c = self.cur();
            self.next();
            return Ok(Node::Char(c));
        }

        if self.cur() != b'\\' {
            return match self.cur() {
                b'[' => {
                    self.next();
                    self.parse_character_class()
                }
                b'(' => self.parse_group(),
                b'.' => {
                    self.next();
                    Ok(Node::Any)
                }
                b'^' => {
                    self.next();
                    Ok(Node::Bol)
                }
                b'$' => {
                    self.next();
                    Ok(Node::Eol)
                }
                b'#' if self.popt.contains(ReOpt::EXTENDED) => {
                    while self.cur() != 0 && self.cur() != b'\n' {
                        self.next();
                    }
                    self.parse_primary()
                }
                c if self.popt.contains(ReOpt::EXTENDED) && WHITESPACE.contains(&c) => {
                    while self.cur() != 0 && WHITESPACE.contains(&self.cur()) {
                        self.next();
                    }
                    if self.cur() == 0 || self.cur() == b'|' || self.cur() == b')' {
                        Ok(Node::None)
                    } else {
                        self.parse_primary()
                    }
                }
                c => {
                    self.next();
                    Ok(Node::Char(c))
                }
            };
        }

        // An escape.
        self.next();
        let node = match self.cur() {
            b'x' => {
                self.next();
                let loc = self.sp;
                if self.cur() == b'{' {
                    self.next();
                    let n = self.hex_num();
                    if self.cur() != b'}' {
                        return Err(RegexError::syntax("incomplete token", loc));
                    }
                    Node::Char(n.max(0) as u8)
                } else {
                    let n = self.hex_num();
                    self.sp -= 1;
                    Node::Char(n.max(0) as u8)
                }
            }
            b'o' => {
                self.next();
                let loc = self.sp;
                if self.cur() != b'{' {
                    return Err(RegexError::syntax("expected '{'", loc));
                }
                self.next();
                let n = self.oct_num();
                if self.cur() != b'}' {
                    return Err(RegexError::syntax("unmatched '{'", loc));
                }
                Node::Char(n.max(0) as u8)
            }
            b'-' | b'+' | b'1'..=b'9' => {
                let neg = self.cur() == b'-';
                let pos = self.cur() == b'+';
                if neg || pos {
                    self.next();
                }
                let mut n = self.parse_dec_num()?;
                if neg {
                    n = self.gp as i32 - n;
                }
                if pos {
                    n = self.gp as i32 + n;
                }
                self.sp -= 1;
                Node::Backref(n.max(0) as usize)
            }
            b'0' => {
                self.next();
                let n = self.oct_num();
                self.sp -= 1;
                Node::Char(n.max(0) as u8)
            }
            b'a' => Node::Char(0x07),
            b'f' => Node::Char(0x0c),
            b'n' => Node::Char(b'\n'),
            b't' => Node::Char(b'\t'),
            b'r' => Node::Char(b'\r'),
            b'e' => Node::Char(0x07),
            b'h' => Node::Class(b" \t".to_vec()),
            b's' => Node::Space,
            b'S' => Node::Not(WHITESPACE.to_vec()),
            b'd' => Node::Digit,
            b'D' => Node::Not(DIGIT.to_vec()),
            b'w' => Node::Word,
            b'W' => Node::Not(WORD.to_vec()),
            b'K' => Node::SetStart,
            b'b' => Node::Wb,
            b'B' => Node::Nwb,
            b'A' => Node::Bos,
            b'Z' => Node::Eos,
            b'Q' => {
                self.literal = true;
                self.next();
                return self.parse_primary();
            }
            b'E' => {
                self.literal = false;
                self.next();
                return self.parse_primary();
            }
            b'H' => Node::Class((1u8..=255).filter(|c| !b"\t ".contains(c)).collect()),
            b'N' => Node::Class((1u8..=255).filter(|&c| c != b'\n').collect()),
            b'g' => {
                self.next();
                return self.parse_g();
            }
            b'k' => {
                self.next();
                return self.parse_k();
            }
            c => Node::Char(c),
        };
        self.next();
        Ok(node)
    }

    fn parse_g(&mut self) -> ReResult<Node> {
        let bracketed = self.cur() == b'{';
        if bracketed {
            self.next();
        }
        let neg = self.cur() == b'-';
        let pos = self.cur() == b'+';
        if neg || pos {
            self.next();
        }
        let mut n = self.parse_dec_num()?;
        if bracketed {
            if self.cur() != b'}' {
                return Err(RegexError::syntax("incomplete token", self.sp));
            }
            self.next();
        }
        if pos {
            n = self.gp as i32 + n;
        }
        if neg {
            n = self.gp as i32 - n;
        }
        Ok(Node::Backref(n.max(0) as usize))
    }

    fn parse_k(&mut self) -> ReResult<Node> {
        let bracketed = self.cur() == b'<';
        if self.cur() != b'<' && self.cur() != b'\'' {
            return Err(RegexError::syntax("expected '<' or '''", self.sp));
        }
        self.next();
        let name = self.read_name();
        let closer = if bracketed { b'>' } else { b'\'' };
        if self.cur() != closer || name.is_empty() {
            return Err(RegexError::syntax("expected '>' or '''", self.sp));
        }
        self.next();
        match self.named_group_index(&name) {
            Some(i) => Ok(Node::Backref(i)),
            None => Err(RegexError::syntax(
                "name references a group that does not exist",
                self.sp,
            )),
        }
    }

    fn parse_group(&mut self) -> ReResult<Node> {
        let loc = self.sp;
        self.next(); // (

        let node = if self.cur() == b'?' && self.peek() == b'R' {
            self.sp += 2;
            self.groups[0].is_called = true;
            Node::Recurse
        } else if self.cur() == b'?' {
            self.next();
            self.parse_special_group()?
        } else {
            let gi = self.add_group()?;
            let a = self.parse()?;
            Node::Group { gi, a: Box::new(a) }
        };

        if self.cur() != b')' {
            return Err(RegexError::syntax("unmatched '('", loc));
        }
        self.next();
        Ok(node)
    }

    fn parse_named_group(&mut self, closer: u8) -> ReResult<Node> {
        let name = self.read_name();
        if self.cur() != closer {
            return Err(RegexError::syntax(
                format!("expected '{}'", closer as char),
                self.sp,
            ));
        }
        self.next();
        let gi = self.add_group()?;
        self.groups[gi].name = Some(name);
        let a = self.parse()?;
        Ok(Node::Group { gi, a: Box::new(a) })
    }

    fn parse_special_group(&mut self) -> ReResult<Node> {
        let c = self.cur();
        self.next();
        match c {
            b'#' => {
                while self.cur() != 0 && self.cur() != b')' {
                    self.next();
                }
                Ok(Node::None)
            }
            b'<' => {
                if WORD.contains(&self.cur()) {
                    return self.parse_named_group(b'>');
                }
                match self.cur() {
                    b'=' => {
                        self.next();
                        Ok(Node::Plb(Box::new(self.parse()?)))
                    }
                    b'!' => {
                        self.next();
                        Ok(Node::Nlb(Box::new(self.parse()?)))
                    }
                    _ => Err(RegexError::syntax("invalid group syntax", self.sp)),
                }
            }
            b'\'' => self.parse_named_group(b'\''),
            b':' => self.parse(),
            b'|' => self.parse_branch_reset(),
            b'>' => Ok(Node::Atom(Box::new(self.parse()?))),
            b'=' => Ok(Node::Pla(Box::new(self.parse()?))),
            b'!' => Ok(Node::Nla(Box::new(self.parse()?))),
            b'0'..=b'9' => {
                self.sp -= 1;
                let n = self.parse_dec_num()? as usize;
                if n < self.gp {
                    self.groups[n].is_called = true;
                }
                Ok(Node::Call(n))
            }
            b'P' => {
                if self.cur() == b'=' {
                    self.next();
                    let name = self.read_name();
                    if self.cur() != b')' {
                        return Err(RegexError::syntax("expected ')'", self.sp));
                    }
                    return match self.named_group_index(&name) {
                        Some(i) => Ok(Node::Backref(i)),
                        None => Err(RegexError::syntax(
                            "name references a group that does not exist",
                            self.sp,
                        )),
                    };
                }
                if self.cur() != b'<' {
                    return Err(RegexError::syntax("expected '<'", self.sp));
                }
                self.next();
                self.parse_named_group(b'>')
            }
            _ => {
                self.sp -= 1;
                self.parse_mode_modifiers()
            }
        }
    }

    fn parse_branch_reset(&mut self) -> ReResult<Node> {
        let mut left: Option<Node> = None;
        let bottom = self.gp;
        let mut top = bottom;

        loop {
            if self.cur() == b'|' {
                self.next();
            }
            let tmp = self.term()?;
            left = Some(match left {
                Some(l) => Node::Or(Box::new(l), Box::new(tmp)),
                None => tmp,
            });
            // Every alternative re-numbers its groups from the same base.
            top = top.max(self.gp);
            self.gp = bottom;
            if self.cur() != b'|' {
                break;
            }
        }

        self.gp = top;

        if self.cur() != b')' {
            return Err(RegexError::syntax("expected ')'", self.sp));
        }
        Ok(left.unwrap_or(Node::None))
    }

    fn parse_mode_modifiers(&mut self) -> ReResult<Node> {
        let old = self.popt;
        let mut opt = self.popt;
        let mut neg = false;

        while self.cur() != 0 && self.cur() != b')' && self.cur() != b':' {
            let (off, bit) = match self.cur() {
                b'c' => (true, ReOpt::INSENSITIVE),
                b'i' => (false, ReOpt::INSENSITIVE),
                b't' => (true, ReOpt::EXTENDED),
                b'x' => (false, ReOpt::EXTENDED),
                b'm' => (false, ReOpt::MULTILINE),
                b'-' => {
                    neg = true;
                    self.next();
                    continue;
                }
                _ => return Err(RegexError::syntax("invalid mode modifier", self.sp)),
            };
            if off || neg {
                opt.remove(bit);
            } else {
                opt.insert(bit);
            }
            self.next();
        }

        self.popt = opt;
        let left = Node::SetOpt(opt);

        if self.cur() == b':' {
            self.next();
            // Scoped modifiers restore the enclosing options on exit.
            let body = self.parse()?;
            self.popt = old;
            return Ok(Node::Sequence(
                Box::new(left),
                Box::new(Node::Sequence(Box::new(body), Box::new(Node::SetOpt(old)))),
            ));
        }

        Ok(left)
    }

    fn parse_character_class(&mut self) -> ReResult<Node> {
        let loc = self.sp;
        let negated = self.cur() == b'^';
        if negated {
            self.next();
        }

        let mut class: Vec<u8> = Vec::new();
        while self.cur() != 0 && self.cur() != b']' {
            let a = self.parse_class_char()?;
            let range = self.cur() == b'-' && self.peek() != b']' && a.len() == 1;
            if range {
                self.next();
                let b = self.parse_class_char()?;
                if b.len() != 1 {
                    class.extend_from_slice(&a);
                    class.extend_from_slice(&b);
                    continue;
                }
                for c in a[0]..=b[0] {
                    class.push(c);
                }
            } else {
                class.extend_from_slice(&a);
            }
        }

        if self.cur() != b']' {
            return Err(RegexError::syntax("unterminated character class", loc));
        }
        if class.is_empty() {
            return Err(RegexError::syntax("empty character class", loc));
        }
        self.next();

        Ok(if negated { Node::Not(class) } else { Node::Class(class) })
    }

    fn parse_class_char(&mut self) -> ReResult<Vec<u8>> {
        const PCLASSES: &[(&str, &[u8])] = &[
            ("[:upper:]", b"ABCDEFGHIJKLMNOPQRSTUVWXYZ"),
            ("[:lower:]", b"abcdefghijklmnopqrstuvwxyz"),
            ("[:alpha:]", b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ"),
            ("[:digit:]", b"0123456789"),
            ("[:xdigit:]", b"0123456789ABCDEFabcdef"),
            (
                "[:alnum:]",
                b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ",
            ),
            ("[:punct:]", b"!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~"),
            ("[:blank:]", b" \t"),
            ("[:space:]", WHITESPACE),
        ];

        if self.cur() == b'[' {
            let rest = &self.pat[self.sp..];
            for (name, class) in PCLASSES {
                if rest.starts_with(name.as_bytes()) {
                    self.sp += name.len();
                    return Ok(class.to_vec());
                }
            }
            self.next();
            return Ok(vec![b'[']);
        }

        if self.cur() != b'\\' {
            let c = self.cur();
            self.next();
            return Ok(vec![c]);
        }

        self.next(); // backslash
        let out = match self.cur() {
            b'x' => {
                self.next();
                let loc = self.sp;
                if self.cur() == b'{' {
                    self.next();
                    let n = self.hex_num();
                    if self.cur() != b'}' {
                        return Err(RegexError::syntax("incomplete token", loc));
                    }
                    vec![n.max(0) as u8]
                } else {
                    let n = self.hex_num();
                    self.sp -= 1;
                    vec![n.max(0) as u8]
                }
            }
            b'0' => {
                self.next();
                let n = self.oct_num();
                self.sp -= 1;
                vec![n.max(0) as u8]
            }
            b'o' => {
                self.next();
                let loc = self.sp;
                if self.cur() != b'{' {
                    return Err(RegexError::syntax("incomplete token", loc));
                }
                self.next();
                let n = self.oct_num();
                if self.cur() != b'}' {
                    return Err(RegexError::syntax("unmatched '{'", loc));
                }
                vec![n.max(0) as u8]
            }
            b's' => WHITESPACE.to_vec(),
            b'w' => WORD.to_vec(),
            b'd' => DIGIT.to_vec(),
            b'h' => b" \t".to_vec(),
            b'a' => vec![0x07],
            b'b' => vec![0x08],
            b'f' => vec![0x0c],
            b'n' => vec![b'\n'],
            b't' => vec![b'\t'],
            b'r' => vec![b'\r'],
            b'e' => vec![0x07],
            b'D' => (1u8..=255).filter(|c| !DIGIT.contains(c)).collect(),
            b'H' => (1u8..=255).filter(|c| !b"\t ".contains(c)).collect(),
            b'N' => (1u8..=255).filter(|&c| c != b'\n').collect(),
            b'S' => (1u8..=255).filter(|c| !WHITESPACE.contains(c)).collect(),
            c => vec![c],
        };
        self.next();
        Ok(out)
    }
}

fn lc(c: u8) -> u8 {
    c.to_ascii_lowercase()
}

fn uc(c: u8) -> u8 {
    c.to_ascii_uppercase()
}

/// Join two nodes into a sequence, merging adjacent characters into string
/// runs (lowercased when the insensitive option is live).
fn join(left: Node, right: Node, popt: ReOpt) -> Node {
    let fold = |c: u8| {
        if popt.contains(ReOpt::INSENSITIVE) {
            lc(c)
        } else {
            c
        }
    };

    match (left, right) {
        (Node::None, right) => right,
        (Node::Char(a), Node::Char(b)) => Node::Str(vec![fold(a), fold(b)]),
        (Node::Str(mut s), Node::Char(b)) => {
            s.push(fold(b));
            Node::Str(s)
        }
        (Node::Sequence(a, b), Node::Char(c)) => match *b {
            Node::Char(p) => Node::Sequence(a, Box::new(Node::Str(vec![fold(p), fold(c)]))),
            Node::Str(mut s) => {
                s.push(fold(c));
                Node::Sequence(a, Box::new(Node::Str(s)))
            }
            other => Node::Sequence(
                Box::new(Node::Sequence(a, Box::new(other))),
                Box::new(Node::Char(c)),
            ),
        },
        (left, right) => Node::Sequence(Box::new(left), Box::new(right)),
    }
}

// ===== compiled program =====

#[derive(Debug, Clone)]
enum RInstr {
    Match,
    Char(u8),
    Jmp(usize),
    Branch(usize, usize),
    Any,
    Class(Vec<u8>),
    /// String comparison; `TStr` is the unrolled form of `x{n}`.
    Str(Vec<u8>),
    TStr(Vec<u8>),
    Not(Vec<u8>),
    Backref(usize),
    Bol,
    Eol,
    Bos,
    Eos,
    Wb,
    Nwb,
    Digit,
    Space,
    Word,
    Save(usize),
    SetOpt(ReOpt),
    SetStart,
    Try,
    Catch,
    Call(usize),
    Ret,
    Pla,
    PlaWin,
    Nla(usize),
    NlaFail,
    Plb,
    PlbWin,
    Nlb(usize),
    NlbFail,
    Prog(usize),
}

#[derive(Debug)]
struct Program {
    code: Vec<RInstr>,
    locs: Vec<usize>,
    num_groups: usize,
    num_prog: usize,
    group_names: Vec<Option<String>>,
    opt: ReOpt,
    pat: String,
}

impl Default for Program {
    /// The empty pattern: one group, matches the empty string anywhere.
    fn default() -> Self {
        Program {
            code: vec![RInstr::Save(0), RInstr::Save(1), RInstr::Match],
            locs: vec![0, 0, 0],
            num_groups: 1,
            num_prog: 0,
            group_names: vec![None],
            opt: ReOpt::UNANCHORED,
            pat: String::new(),
        }
    }
}

struct ReCompiler {
    code: Vec<RInstr>,
    locs: Vec<usize>,
    groups: Vec<GroupInfo>,
    num_prog: usize,
}

impl ReCompiler {
    fn emit(&mut self, instr: RInstr, loc: usize) {
        self.code.push(instr);
        self.locs.push(loc);
    }

    fn ip(&self) -> usize {
        self.code.len()
    }

    fn patch(&mut self, at: usize, f: impl FnOnce(&mut RInstr)) {
        f(&mut self.code[at]);
    }

    fn compile(&mut self, n: &Node, rev: bool, loc: usize) -> ReResult<()> {
        match n {
            Node::None => {}

            Node::Asterisk(a) => {
                let start = self.ip();
                self.emit(RInstr::Branch(start + 1, 0), loc);
                let prog = self.num_prog;
                self.num_prog += 1;
                self.emit(RInstr::Prog(prog), loc);
                self.compile(a, rev, loc)?;
                let here = self.ip();
                self.emit(RInstr::Branch(start + 1, here + 1), loc);
                let end = self.ip();
                self.patch(start, |i| {
                    if let RInstr::Branch(_, b) = i {
                        *b = end;
                    }
                });
            }

            Node::Question(a) => match &**a {
                // Lazy quantifiers: `*?`, `+?`, `??`.
                Node::Asterisk(inner) => {
                    let start = self.ip();
                    self.emit(RInstr::Branch(0, start + 1), loc);
                    let prog = self.num_prog;
                    self.num_prog += 1;
                    self.emit(RInstr::Prog(prog), loc);
                    self.compile(inner, rev, loc)?;
                    let here = self.ip();
                    self.emit(RInstr::Branch(here + 1, start + 1), loc);
                    let end = self.ip();
                    self.patch(start, |i| {
                        if let RInstr::Branch(a, _) = i {
                            *a = end;
                        }
                    });
                }
                Node::Plus(inner) => {
                    let start = self.ip();
                    let prog = self.num_prog;
                    self.num_prog += 1;
                    self.emit(RInstr::Prog(prog), loc);
                    self.compile(inner, rev, loc)?;
                    let here = self.ip();
                    self.emit(RInstr::Branch(here + 1, start), loc);
                }
                Node::Question(inner) => {
                    let start = self.ip();
                    self.emit(RInstr::Branch(0, start + 1), loc);
                    let prog = self.num_prog;
                    self.num_prog += 1;
                    self.emit(RInstr::Prog(prog), loc);
                    self.compile(inner, rev, loc)?;
                    let end = self.ip();
                    self.patch(start, |i| {
                        if let RInstr::Branch(a, _) = i {
                            *a = end;
                        }
                    });
                }
                _ => {
                    let start = self.ip();
                    self.emit(RInstr::Branch(start + 1, 0), loc);
                    self.compile(a, rev, loc)?;
                    let end = self.ip();
                    self.patch(start, |i| {
                        if let RInstr::Branch(_, b) = i {
                            *b = end;
                        }
                    });
                }
            },

            Node::Plus(a) => match &**a {
                Node::Asterisk(_) | Node::Plus(_) | Node::Question(_) | Node::Rep { .. } => {
                    self.emit(RInstr::Try, loc);
                    let prog = self.num_prog;
                    self.num_prog += 1;
                    self.emit(RInstr::Prog(prog), loc);
                    self.compile(a, rev, loc)?;
                    self.emit(RInstr::Catch, loc);
                }
                _ => {
                    let start = self.ip();
                    let prog = self.num_prog;
                    self.num_prog += 1;
                    self.emit(RInstr::Prog(prog), loc);
                    self.compile(a, rev, loc)?;
                    let here = self.ip();
                    self.emit(RInstr::Branch(start, here + 1), loc);
                }
            },

            Node::Group { gi, a } => {
                let gi = *gi;
                if self.groups[gi].is_called && !self.groups[gi].is_compiled {
                    let here = self.ip();
                    self.emit(RInstr::Call(here + 3), loc);
                    self.emit(RInstr::Save(gi * 2 + 1), loc);
                    let jmp = self.ip();
                    self.emit(RInstr::Jmp(0), loc);
                    self.emit(RInstr::Save(gi * 2), loc);

                    self.groups[gi].address = self.ip() - 1;

                    self.compile(a, rev, loc)?;
                    self.emit(RInstr::Ret, loc);
                    let end = self.ip();
                    self.patch(jmp, |i| {
                        if let RInstr::Jmp(t) = i {
                            *t = end;
                        }
                    });
                    self.groups[gi].is_compiled = true;
                } else if self.groups[gi].is_compiled {
                    self.emit(RInstr::Save(gi * 2), loc);
                    self.compile(a, rev, loc)?;
                    self.emit(RInstr::Save(gi * 2 + 1), loc);
                } else {
                    self.emit(RInstr::Save(gi * 2), loc);
                    self.groups[gi].address = self.ip() - 1;
                    self.compile(a, rev, loc)?;
                    self.emit(RInstr::Save(gi * 2 + 1), loc);
                    self.groups[gi].is_compiled = true;
                }
            }

            Node::Call(c) => {
                if *c >= self.groups.len() {
                    return Err(RegexError::syntax(
                        "subroutine call references a group that does not exist",
                        loc,
                    ));
                }
                let addr = self.groups[*c].address;
                self.emit(RInstr::Call(addr + 1), loc);
            }

            Node::Recurse => {
                let addr = self.groups[0].address;
                self.emit(RInstr::Call(addr + 1), loc);
            }

            Node::Or(a, b) => {
                let branch = self.ip();
                self.emit(RInstr::Branch(branch + 1, 0), loc);
                self.compile(a, rev, loc)?;
                let jmp = self.ip();
                self.emit(RInstr::Jmp(0), loc);
                let rhs = self.ip();
                self.patch(branch, |i| {
                    if let RInstr::Branch(_, t) = i {
                        *t = rhs;
                    }
                });
                self.compile(b, rev, loc)?;
                let end = self.ip();
                self.patch(jmp, |i| {
                    if let RInstr::Jmp(t) = i {
                        *t = end;
                    }
                });
            }

            Node::Sequence(a, b) => {
                if rev {
                    self.compile(b, rev, loc)?;
                    self.compile(a, rev, loc)?;
                } else {
                    self.compile(a, rev, loc)?;
                    self.compile(b, rev, loc)?;
                }
            }

            Node::Backref(c) => {
                if *c == 0 || *c >= self.groups.len() {
                    return Err(RegexError::syntax(
                        "backreference number is invalid or references a group that does not yet exist",
                        loc,
                    ));
                }
                if !self.groups[*c].is_compiled {
                    return Err(RegexError::syntax(
                        "backreferences may not reference the group they occur in",
                        loc,
                    ));
                }
                self.emit(RInstr::Backref(*c), loc);
            }

            Node::Rep { a, lo: 0, hi: -1 } => {
                // `{0,}` is just `*`.
                self.compile(&Node::Asterisk(a.clone()), rev, loc)?;
            }

            Node::Rep { a, lo, hi } => {
                let mut last = 0;
                for _ in 0..*lo {
                    last = self.ip();
                    match &**a {
                        Node::Group { gi, .. } if self.groups[*gi].is_compiled => {
                            let addr = self.groups[*gi].address;
                            self.emit(RInstr::Call(addr + 1), loc);
                        }
                        Node::Group { .. } => self.compile(a, rev, loc)?,
                        Node::Char(c) => {
                            // A counted character collapses into one run.
                            self.emit(RInstr::TStr(vec![*c; *lo as usize]), loc);
                            break;
                        }
                        _ => self.compile(a, rev, loc)?,
                    }
                }

                if *hi == -1 {
                    if let Node::Group { gi, .. } = &**a {
                        let here = self.ip();
                        self.emit(RInstr::Branch(here + 1, here + 2), loc);
                        let addr = self.groups[*gi].address;
                        self.emit(RInstr::Call(addr + 1), loc);
                        let here = self.ip();
                        self.emit(RInstr::Branch(here - 1, here + 1), loc);
                    } else {
                        let here = self.ip();
                        self.emit(RInstr::Branch(last, here + 1), loc);
                    }
                } else {
                    // A bracket of optional copies covers lo..hi.
                    for _ in 0..(*hi - *lo).max(0) {
                        let branch = self.ip();
                        self.emit(RInstr::Branch(branch + 1, 0), loc);
                        match &**a {
                            Node::Group { gi, .. } => {
                                let addr = self.groups[*gi].address;
                                self.emit(RInstr::Call(addr + 1), loc);
                            }
                            _ => self.compile(a, rev, loc)?,
                        }
                        let end = self.ip();
                        self.patch(branch, |i| {
                            if let RInstr::Branch(_, t) = i {
                                *t = end;
                            }
                        });
                    }
                }
            }

            Node::Atom(a) => {
                self.emit(RInstr::Try, loc);
                self.compile(a, rev, loc)?;
                self.emit(RInstr::Catch, loc);
            }

            Node::Pla(a) => {
                self.emit(RInstr::Pla, loc);
                self.compile(a, false, loc)?;
                self.emit(RInstr::PlaWin, loc);
            }

            Node::Nla(a) => {
                let at = self.ip();
                self.emit(RInstr::Nla(0), loc);
                self.compile(a, false, loc)?;
                self.emit(RInstr::NlaFail, loc);
                let end = self.ip();
                self.patch(at, |i| {
                    if let RInstr::Nla(t) = i {
                        *t = end;
                    }
                });
            }

            Node::Plb(a) => {
                self.emit(RInstr::Plb, loc);
                self.compile(a, true, loc)?;
                self.emit(RInstr::PlbWin, loc);
            }

            Node::Nlb(a) => {
                let at = self.ip();
                self.emit(RInstr::Nlb(0), loc);
                self.compile(a, true, loc)?;
                self.emit(RInstr::NlbFail, loc);
                let end = self.ip();
                self.patch(at, |i| {
                    if let RInstr::Nlb(t) = i {
                        *t = end;
                    }
                });
            }

            Node::Class(c) => self.emit(RInstr::Class(c.clone()), loc),
            Node::Str(s) => self.emit(RInstr::Str(s.clone()), loc),
            Node::Not(c) => self.emit(RInstr::Not(c.clone()), loc),
            Node::SetOpt(o) => self.emit(RInstr::SetOpt(*o), loc),
            Node::Char(c) => self.emit(RInstr::Char(*c), loc),
            Node::Bol => self.emit(RInstr::Bol, loc),
            Node::Eol => self.emit(RInstr::Eol, loc),
            Node::Bos => self.emit(RInstr::Bos, loc),
            Node::Eos => self.emit(RInstr::Eos, loc),
            Node::Any => self.emit(RInstr::Any, loc),
            Node::SetStart => self.emit(RInstr::SetStart, loc),
            Node::Wb => self.emit(RInstr::Wb, loc),
            Node::Nwb => self.emit(RInstr::Nwb, loc),
            Node::Digit => self.emit(RInstr::Digit, loc),
            Node::Space => self.emit(RInstr::Space, loc),
            Node::Word => self.emit(RInstr::Word, loc),
        }

        Ok(())
    }
}

// ===== runtime =====

#[derive(Debug, Clone, Default)]
struct Thread {
    ip: usize,
    sp: i32,
    fp: usize,
    ep: usize,
    opt: ReOpt,
    die: bool,
    rev: bool,
    vec: Vec<i32>,
    prog: Vec<i32>,
    frame: Vec<i32>,
    exception: Vec<i32>,
}

struct ReVm<'a> {
    prog: &'a Program,
    subject: &'a [u8],
    subject_lc: Vec<u8>,
    threads: Vec<Thread>,
    tp: i32,
    mem: usize,
    matches: Vec<Vec<i32>>,
}

impl<'a> ReVm<'a> {
    fn new(prog: &'a Program, subject: &'a [u8]) -> Self {
        ReVm {
            prog,
            subject,
            subject_lc: subject.iter().map(|&c| lc(c)).collect(),
            threads: Vec::new(),
            tp: -1,
            mem: 0,
            matches: Vec::new(),
        }
    }

    fn at(&self, sp: i32) -> u8 {
        if sp < 0 || sp as usize >= self.subject.len() {
            0
        } else {
            self.subject[sp as usize]
        }
    }

    fn at_lc(&self, sp: i32) -> u8 {
        if sp < 0 || sp as usize >= self.subject.len() {
            0
        } else {
            self.subject_lc[sp as usize]
        }
    }

    fn len(&self) -> i32 {
        self.subject.len() as i32
    }

    fn charge(&mut self, bytes: usize, loc: usize) -> ReResult<()> {
        self.mem += bytes;
        if self.mem > MEM_CAP {
            return Err(RegexError::new(RegexErrorKind::OutOfMemory, loc));
        }
        Ok(())
    }

    fn spawn(&mut self, ip: usize, sp: i32, opt: ReOpt, fp: usize, ep: usize) -> ReResult<()> {
        let loc = self.prog.locs.get(ip).copied().unwrap_or(0);
        let t = if self.tp >= 0 {
            let src = &self.threads[self.tp as usize];
            let mut t = src.clone();
            t.ip = ip;
            t.sp = sp;
            t.opt = opt;
            t.fp = fp;
            t.ep = ep;
            t.die = false;
            t
        } else {
            Thread {
                ip,
                sp,
                opt,
                fp,
                ep,
                vec: vec![-1; self.prog.num_groups * 2],
                prog: vec![-1; self.prog.num_prog],
                ..Thread::default()
            }
        };

        self.tp += 1;
        let tp = self.tp as usize;
        if tp < self.threads.len() {
            self.threads[tp] = t;
        } else {
            self.charge(
                4 * (t.vec.len() + t.prog.len() + t.frame.len() + t.exception.len())
                    + std::mem::size_of::<Thread>(),
                loc,
            )?;
            self.threads.push(t);
        }
        Ok(())
    }

    fn run(&mut self) -> ReResult<bool> {
        tracing::trace!(
            target: "alder::regex",
            instrs = self.prog.code.len(),
            subject_len = self.subject.len(),
            "run"
        );
        self.spawn(0, 0, self.prog.opt, 0, 0)?;

        // The program reference outlives `self`'s borrows, so instruction
        // payloads can be held across thread mutation.
        let prog = self.prog;

        while self.tp >= 0 {
            let tp = self.tp as usize;
            let ip = self.threads[tp].ip;
            let sp = self.threads[tp].sp;
            let fp = self.threads[tp].fp;
            let ep = self.threads[tp].ep;
            let opt = self.threads[tp].opt;
            let rev = self.threads[tp].rev;
            let loc = prog.locs.get(ip).copied().unwrap_or(0);

            if self.threads[tp].die {
                self.threads[tp].die = false;
                self.tp -= 1;
                continue;
            }

            match &prog.code[ip] {
                RInstr::Char(c) => {
                    self.threads[tp].ip += 1;
                    if sp < 0 || sp >= self.len() {
                        self.tp -= 1;
                        continue;
                    }
                    let hit = if opt.contains(ReOpt::INSENSITIVE) {
                        self.at_lc(sp) == lc(*c)
                    } else {
                        self.at(sp) == *c
                    };
                    if hit {
                        self.threads[tp].sp += if rev { -1 } else { 1 };
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Any => {
                    self.threads[tp].ip += 1;
                    let c = self.at(sp);
                    let ok = sp >= 0
                        && c != 0
                        && (opt.contains(ReOpt::MULTILINE) || c != b'\n');
                    if ok {
                        self.threads[tp].sp += if rev { -1 } else { 1 };
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Class(class) => {
                    self.threads[tp].ip += 1;
                    let c = self.at(sp);
                    if c == 0 || sp < 0 {
                        self.tp -= 1;
                        continue;
                    }
                    if class.contains(&c)
                        || (opt.contains(ReOpt::INSENSITIVE) && class.contains(&self.at_lc(sp)))
                    {
                        self.threads[tp].sp += 1;
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Not(class) => {
                    self.threads[tp].ip += 1;
                    let c = self.at(sp);
                    if !class.contains(&c) && c != 0 && sp >= 0 {
                        self.threads[tp].sp += 1;
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Str(s) | RInstr::TStr(s) => {
                    self.threads[tp].ip += 1;
                    let n = s.len() as i32;
                    let start = if rev { sp + 1 - n } else { sp };
                    let hit = start >= 0
                        && start + n <= self.len()
                        && (0..n).all(|i| {
                            if opt.contains(ReOpt::INSENSITIVE) {
                                self.at_lc(start + i) == lc(s[i as usize])
                            } else {
                                self.at(start + i) == s[i as usize]
                            }
                        });
                    if hit {
                        self.threads[tp].sp += if rev { -n } else { n };
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Backref(c) => {
                    self.threads[tp].ip += 1;
                    let start = self.threads[tp].vec[c * 2];
                    let n = self.threads[tp].vec[c * 2 + 1];
                    if start < 0 || n < 0 {
                        self.tp -= 1;
                        continue;
                    }
                    let base = if rev { sp + 1 - n } else { sp };
                    let hit = base >= 0
                        && base + n <= self.len()
                        && (0..n).all(|i| {
                            if opt.contains(ReOpt::INSENSITIVE) {
                                self.at_lc(base + i) == self.at_lc(start + i)
                            } else {
                                self.at(base + i) == self.at(start + i)
                            }
                        });
                    if hit {
                        self.threads[tp].sp += if rev { -n } else { n };
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Bol => {
                    if (sp > 0 && self.at(sp - 1) == b'\n') || sp == 0 {
                        self.threads[tp].ip += 1;
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Eol => {
                    if (self.at(sp) == b'\n' && sp >= 0) || sp == self.len() {
                        self.threads[tp].ip += 1;
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Bos => {
                    if sp == 0 {
                        self.threads[tp].ip += 1;
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Eos => {
                    if sp == self.len() {
                        self.threads[tp].ip += 1;
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Wb => {
                    self.threads[tp].ip += 1;
                    let here = WORD.contains(&self.at(sp));
                    let before = sp > 0 && WORD.contains(&self.at(sp - 1));
                    let boundary = if sp < 0 || sp >= self.len() {
                        false
                    } else if sp == 0 {
                        here
                    } else {
                        here != before
                    };
                    if !boundary {
                        self.tp -= 1;
                    }
                }

                RInstr::Nwb => {
                    self.threads[tp].ip += 1;
                    let here = WORD.contains(&self.at(sp));
                    let before = sp > 0 && WORD.contains(&self.at(sp - 1));
                    let boundary = if sp < 0 || sp >= self.len() {
                        true
                    } else if sp == 0 {
                        here
                    } else {
                        here != before
                    };
                    if boundary {
                        self.tp -= 1;
                    }
                }

                RInstr::Digit => {
                    self.threads[tp].ip += 1;
                    let c = self.at(sp);
                    if c != 0 && DIGIT.contains(&c) {
                        self.threads[tp].sp += if rev { -1 } else { 1 };
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Word => {
                    self.threads[tp].ip += 1;
                    let c = self.at(sp);
                    if c != 0 && WORD.contains(&c) {
                        self.threads[tp].sp += if rev { -1 } else { 1 };
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Space => {
                    self.threads[tp].ip += 1;
                    let c = self.at(sp);
                    if c != 0 && WHITESPACE.contains(&c) {
                        self.threads[tp].sp += if rev { -1 } else { 1 };
                    } else {
                        self.tp -= 1;
                    }
                }

                RInstr::Branch(a, b) => {
                    let (a, b) = (*a, *b);
                    self.threads[tp].ip = b;
                    self.spawn(a, sp, opt, fp, ep)?;
                }

                RInstr::Jmp(t) => {
                    self.threads[tp].ip = *t;
                }

                RInstr::SetOpt(o) => {
                    self.threads[tp].ip += 1;
                    self.threads[tp].opt = *o;
                }

                RInstr::Save(c) => {
                    let c = *c;
                    self.threads[tp].ip += 1;
                    if c % 2 == 0 {
                        self.threads[tp].vec[c] = sp;
                    } else {
                        let start = self.threads[tp].vec[c - 1];
                        self.threads[tp].vec[c] = sp - start;
                    }
                }

                RInstr::SetStart => {
                    self.threads[tp].ip += 1;
                    self.threads[tp].vec[0] = sp;
                }

                RInstr::Call(t) => {
                    self.threads[tp].ip = *t;
                    let depth = self.threads[tp].fp;
                    if self.threads[tp].frame.len() <= depth {
                        self.threads[tp].frame.resize(depth + 1, -1);
                        self.charge(4, loc)?;
                    }
                    self.threads[tp].frame[depth] = ip as i32 + 1;
                    self.threads[tp].fp += 1;
                }

                RInstr::Ret => {
                    let depth = self.threads[tp].fp - 1;
                    self.threads[tp].fp = depth;
                    self.threads[tp].ip = self.threads[tp].frame[depth] as usize;
                }

                RInstr::Prog(c) => {
                    let c = *c;
                    self.threads[tp].ip += 1;
                    if self.threads[tp].prog[c] == sp {
                        self.tp -= 1;
                    } else {
                        self.threads[tp].prog[c] = sp;
                    }
                }

                RInstr::Try => {
                    self.threads[tp].ip += 1;
                    let depth = self.threads[tp].ep;
                    if self.threads[tp].exception.len() <= depth {
                        self.threads[tp].exception.resize(depth + 1, -1);
                        self.charge(4, loc)?;
                    }
                    self.threads[tp].exception[depth] = tp as i32;
                    self.threads[tp].ep += 1;
                }

                RInstr::Catch => {
                    let target = self.threads[tp].exception[ep - 1];
                    self.tp = target;
                    let t = self.tp as usize;
                    self.threads[t].ip = ip + 1;
                    self.threads[t].sp = sp;
                }

                RInstr::Pla => {
                    self.threads[tp].die = true;
                    self.spawn(ip + 1, sp, opt, fp, ep + 1)?;
                    let new = self.tp as usize;
                    if self.threads[new].exception.len() <= ep {
                        self.threads[new].exception.resize(ep + 1, -1);
                    }
                    self.threads[new].exception[ep] = self.tp - 1;
                    self.threads[new].rev = false;
                }

                RInstr::PlaWin => {
                    let depth = self.threads[tp].ep - 1;
                    self.threads[tp].ep = depth;
                    self.tp = self.threads[tp].exception[depth];
                    let t = self.tp as usize;
                    self.threads[t].die = false;
                    self.threads[t].ip = ip + 1;
                }

                RInstr::Nla(t) => {
                    self.threads[tp].ip = *t;
                    self.spawn(ip + 1, sp, opt, fp, ep + 1)?;
                    let new = self.tp as usize;
                    if self.threads[new].exception.len() <= ep {
                        self.threads[new].exception.resize(ep + 1, -1);
                    }
                    self.threads[new].exception[ep] = self.tp - 1;
                    self.threads[new].rev = false;
                }

                RInstr::NlaFail => {
                    let depth = self.threads[tp].ep - 1;
                    self.threads[tp].ep = depth;
                    self.tp = self.threads[tp].exception[depth] - 1;
                }

                RInstr::Plb => {
                    self.threads[tp].die = true;
                    self.spawn(ip + 1, sp - 1, opt, fp, ep + 1)?;
                    let new = self.tp as usize;
                    if self.threads[new].exception.len() <= ep {
                        self.threads[new].exception.resize(ep + 1, -1);
                    }
                    self.threads[new].exception[ep] = self.tp - 1;
                    self.threads[new].rev = true;
                }

                RInstr::PlbWin => {
                    let depth = self.threads[tp].ep - 1;
                    self.threads[tp].ep = depth;
                    self.tp = self.threads[tp].exception[depth];
                    let t = self.tp as usize;
                    self.threads[t].rev = false;
                    self.threads[t].die = false;
                    self.threads[t].ip = ip + 1;
                }

                RInstr::Nlb(t) => {
                    self.threads[tp].ip = *t;
                    self.spawn(ip + 1, sp - 1, opt, fp, ep + 1)?;
                    let new = self.tp as usize;
                    if self.threads[new].exception.len() <= ep {
                        self.threads[new].exception.resize(ep + 1, -1);
                    }
                    self.threads[new].exception[ep] = self.tp - 1;
                    self.threads[new].rev = true;
                }

                RInstr::NlbFail => {
                    let depth = self.threads[tp].ep - 1;
                    self.threads[tp].ep = depth;
                    self.tp = self.threads[tp].exception[depth] - 1;
                }

                RInstr::Match => {
                    // A match may not start where a previous one started.
                    let duplicate = self.matches.iter().any(|m| m[0] == self.threads[tp].vec[0]);
                    if duplicate {
                        self.tp -= 1;
                        continue;
                    }

                    if opt.contains(ReOpt::UNANCHORED) || (sp >= 0 && sp == self.len()) {
                        tracing::trace!(
                            target: "alder::regex",
                            start = self.threads[tp].vec[0],
                            len = self.threads[tp].vec[1],
                            "match"
                        );
                        self.matches.push(self.threads[tp].vec.clone());

                        if !opt.contains(ReOpt::GLOBAL) {
                            return Ok(true);
                        }

                        self.tp = 0;
                        self.threads[0].ip = 0;
                        self.threads[0].sp = sp;
                        if self.threads[0].sp > self.len() {
                            return Ok(true);
                        }
                        continue;
                    }

                    self.tp -= 1;
                }
            }

            if self.tp >= MAX_THREAD as i32 - 1 {
                return Err(RegexError::new(RegexErrorKind::StackOverflow, loc));
            }
            if fp >= MAX_CALL_DEPTH - 1 {
                return Err(RegexError::new(RegexErrorKind::CallOverflow, loc));
            }
        }

        Ok(!self.matches.is_empty())
    }
}

// ===== public surface =====

/// A compiled regex plus its continuation state. Copies share the compiled
/// program; the cursor is per-object.
#[derive(Debug, Clone, Default)]
pub struct Regex {
    prog: Rc<Program>,
    /// Byte cursor for `/…/c` iterative matching.
    pub cursor: usize,
    pub cont: bool,
}

impl Regex {
    pub fn compile(pat: &str, mut opt: ReOpt) -> Result<Regex, RegexError> {
        if opt.contains(ReOpt::GLOBAL) {
            opt.insert(ReOpt::UNANCHORED);
        }
        tracing::debug!(target: "alder::regex", pat, ?opt, "compile pattern");

        let mut parser = ReParser::new(pat.as_bytes(), opt);
        let body = parser.parse()?;
        if parser.sp < pat.len() {
            return Err(RegexError::syntax("unmatched righthand delimiter", parser.sp));
        }

        // Group 0 captures the whole match; user groups are 1-based.
        let num_groups = parser.gp;
        let mut groups = parser.groups;
        groups.truncate(num_groups);
        let root = Node::Group { gi: 0, a: Box::new(body) };

        let mut c = ReCompiler {
            code: Vec::new(),
            locs: Vec::new(),
            groups,
            num_prog: 0,
        };

        if opt.contains(ReOpt::UNANCHORED) {
            // Bake `.*?` in front of the program.
            c.emit(RInstr::Branch(3, 1), 0);
            c.emit(RInstr::Any, 0);
            c.emit(RInstr::Branch(3, 1), 0);
        }

        c.compile(&root, false, 0)?;
        c.emit(RInstr::Match, pat.len());

        tracing::trace!(
            target: "alder::regex",
            instrs = c.code.len(),
            groups = c.groups.len(),
            "pattern compiled"
        );

        Ok(Regex {
            prog: Rc::new(Program {
                code: c.code,
                locs: c.locs,
                num_groups: c.groups.len(),
                num_prog: c.num_prog,
                group_names: c.groups.iter().map(|g| g.name.clone()).collect(),
                opt,
                pat: pat.to_string(),
            }),
            cursor: 0,
            cont: false,
        })
    }

    /// Compile from a language-level flag string (`ixgmc`; `e` flags are
    /// counted by the caller). Language-level matching is unanchored.
    pub fn compile_with_flags(pat: &str, flags: &str) -> Result<Regex, RegexError> {
        tracing::debug!(target: "alder::regex", pat, flags, "compile literal");
        let mut opt = ReOpt::UNANCHORED;
        let mut cont = false;
        for f in flags.chars() {
            match f {
                'i' => opt.insert(ReOpt::INSENSITIVE),
                'x' => opt.insert(ReOpt::EXTENDED),
                'g' => opt.insert(ReOpt::GLOBAL),
                'm' => opt.insert(ReOpt::MULTILINE),
                'c' => cont = true,
                'e' => {}
                _ => {}
            }
        }
        let mut re = Regex::compile(pat, opt)?;
        re.cont = cont;
        Ok(re)
    }

    pub fn pattern(&self) -> &str {
        &self.prog.pat
    }

    pub fn num_groups(&self) -> usize {
        self.prog.num_groups
    }

    pub fn group_name(&self, i: usize) -> Option<&str> {
        self.prog.group_names.get(i).and_then(|n| n.as_deref())
    }

    pub fn options(&self) -> ReOpt {
        self.prog.opt
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Run the pattern over the subject. Each returned record is a
    /// `(start, length)` pair per group, `-1` for unset groups.
    pub fn exec(&self, subject: &str) -> Result<Vec<Vec<i32>>, RegexError> {
        tracing::trace!(
            target: "alder::regex",
            pat = self.prog.pat.as_str(),
            subject_len = subject.len(),
            "exec"
        );
        let mut vm = ReVm::new(&self.prog, subject.as_bytes());
        vm.run()?;
        tracing::trace!(target: "alder::regex", matches = vm.matches.len(), "exec finished");
        Ok(vm.matches)
    }

    /// Like `exec`, but always scanning the whole subject for every match;
    /// used for split and for iterative (`/…/c`) matching.
    pub fn exec_all(&self, subject: &str) -> Result<Vec<Vec<i32>>, RegexError> {
        if self.prog.opt.contains(ReOpt::GLOBAL) {
            return self.exec(subject);
        }
        let mut prog = Program {
            code: self.prog.code.clone(),
            locs: self.prog.locs.clone(),
            num_groups: self.prog.num_groups,
            num_prog: self.prog.num_prog,
            group_names: self.prog.group_names.clone(),
            opt: self.prog.opt | ReOpt::GLOBAL | ReOpt::UNANCHORED,
            pat: self.prog.pat.clone(),
        };
        if !self.prog.opt.contains(ReOpt::UNANCHORED) {
            let mut code = vec![
                RInstr::Branch(3, 1),
                RInstr::Any,
                RInstr::Branch(3, 1),
            ];
            code.extend(rebase(&self.prog.code, 3));
            prog.code = code;
            let mut locs = vec![0, 0, 0];
            locs.extend_from_slice(&self.prog.locs);
            prog.locs = locs;
        }
        let mut vm = ReVm::new(&prog, subject.as_bytes());
        vm.run()?;
        Ok(vm.matches)
    }

    /// Substitute every match. Returns None when nothing matched.
    pub fn filter(
        &self,
        subject: &str,
        replacement: &str,
        indicator: &str,
    ) -> Result<Option<String>, RegexError> {
        let matches = self.exec(subject)?;
        if matches.is_empty() {
            return Ok(None);
        }

        let bytes = subject.as_bytes();
        let mut out: Vec<u8> = Vec::new();
        let mut last_end = 0usize;

        for m in &matches {
            let start = m[0].max(0) as usize;
            let len = m[1].max(0) as usize;
            out.extend_from_slice(&bytes[last_end..start.min(bytes.len())]);
            last_end = (start + len).min(bytes.len());
            out.extend_from_slice(&expand_replacement(bytes, m, replacement, indicator));
        }

        out.extend_from_slice(&bytes[last_end.min(bytes.len())..]);
        Ok(Some(String::from_utf8_lossy(&out).into_owned()))
    }

    /// Split the subject around every match, keeping empty pieces so that
    /// joining with the matched text reproduces the subject.
    pub fn split(&self, subject: &str) -> Result<Vec<String>, RegexError> {
        let matches = self.exec_all(subject)?;
        let bytes = subject.as_bytes();
        let mut pieces = Vec::new();
        let mut last_end = 0usize;

        for m in &matches {
            let start = m[0].max(0) as usize;
            let len = m[1].max(0) as usize;
            pieces.push(
                String::from_utf8_lossy(&bytes[last_end.min(bytes.len())..start.min(bytes.len())])
                    .into_owned(),
            );
            last_end = start + len;
        }
        pieces.push(String::from_utf8_lossy(&bytes[last_end.min(bytes.len())..]).into_owned());

        Ok(pieces)
    }
}

/// Shift every jump target in a program fragment by `n`.
fn rebase(code: &[RInstr], n: usize) -> Vec<RInstr> {
    code.iter()
        .map(|i| match i {
            RInstr::Jmp(t) => RInstr::Jmp(t + n),
            RInstr::Branch(a, b) => RInstr::Branch(a + n, b + n),
            RInstr::Call(t) => RInstr::Call(t + n),
            RInstr::Nla(t) => RInstr::Nla(t + n),
            RInstr::Nlb(t) => RInstr::Nlb(t + n),
            other => other.clone(),
        })
        .collect()
}

/// Case state for replacement expansion: `\U`/`\L` run until `\E`; `\u`/`\l`
/// affect only the next character copied.
#[derive(Default)]
struct CaseState {
    upper: bool,
    lower: bool,
    upper_one: bool,
    lower_one: bool,
}

impl CaseState {
    fn apply(&mut self, c: u8) -> u8 {
        let mapped = if self.upper_one || self.upper {
            uc(c)
        } else if self.lower_one || self.lower {
            lc(c)
        } else {
            c
        };
        self.upper_one = false;
        self.lower_one = false;
        mapped
    }
}

/// Expand a replacement template for one match: `\U \L \E \u \l` case
/// mapping, `\<digit>` and `<indicator><digit>` group references, `\\` for
/// a literal backslash.
fn expand_replacement(subject: &[u8], m: &[i32], replacement: &str, indicator: &str) -> Vec<u8> {
    let rep = replacement.as_bytes();
    let ind = indicator.as_bytes();
    let mut out = Vec::new();
    let mut case = CaseState::default();

    fn copy_group(out: &mut Vec<u8>, subject: &[u8], m: &[i32], n: usize, case: &mut CaseState) {
        if n * 2 + 1 >= m.len() {
            return;
        }
        let (start, len) = (m[n * 2], m[n * 2 + 1]);
        if start < 0 || len < 0 {
            return;
        }
        for i in 0..len {
            let idx = (start + i) as usize;
            if idx < subject.len() {
                let c = case.apply(subject[idx]);
                out.push(c);
            }
        }
    }

    fn read_num(rep: &[u8], i: &mut usize) -> usize {
        let mut n = 0usize;
        while *i < rep.len() && rep[*i].is_ascii_digit() {
            n = n * 10 + (rep[*i] - b'0') as usize;
            *i += 1;
        }
        n
    }

    let mut i = 0;
    while i < rep.len() {
        let group_ref = !ind.is_empty()
            && rep[i..].starts_with(ind)
            && rep
                .get(i + ind.len())
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false);
        if group_ref {
            i += ind.len();
            let n = read_num(rep, &mut i);
            copy_group(&mut out, subject, m, n, &mut case);
            continue;
        }

        if rep[i] == b'\\' && i + 1 < rep.len() {
            i += 1;
            match rep[i] {
                b'U' => case.upper = true,
                b'L' => case.lower = true,
                b'E' => {
                    case.upper = false;
                    case.lower = false;
                }
                b'u' => case.upper_one = true,
                b'l' => case.lower_one = true,
                b'\\' => out.push(b'\\'),
                c if c.is_ascii_digit() => {
                    let n = read_num(rep, &mut i);
                    copy_group(&mut out, subject, m, n, &mut case);
                    continue;
                }
                c => {
                    let c = case.apply(c);
                    out.push(c);
                }
            }
            i += 1;
            continue;
        }

        let c = case.apply(rep[i]);
        out.push(c);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(pat: &str, flags: &str, subject: &str) -> Vec<(i32, i32)> {
        let re = Regex::compile_with_flags(pat, flags).unwrap();
        re.exec(subject)
            .unwrap()
            .iter()
            .map(|m| (m[0], m[1]))
            .collect()
    }

    #[test]
    fn test_basic_match() {
        assert_eq!(exec("world", "", "hello world"), vec![(6, 5)]);
        assert_eq!(exec("xyz", "", "hello world"), vec![]);
    }

    #[test]
    fn test_anchors() {
        assert_eq!(exec("^h", "", "hello"), vec![(0, 1)]);
        assert_eq!(exec("o$", "", "hello"), vec![(4, 1)]);
        assert_eq!(exec("^ello", "", "hello"), vec![]);
    }

    #[test]
    fn test_star_and_plus() {
        assert_eq!(exec("ab*c", "", "ac"), vec![(0, 2)]);
        assert_eq!(exec("ab+c", "", "abbbc"), vec![(0, 5)]);
        assert_eq!(exec("ab+c", "", "ac"), vec![]);
    }

    #[test]
    fn test_classes() {
        assert_eq!(exec("[a-c]+", "", "xxabcax"), vec![(2, 4)]);
        assert_eq!(exec("[^x]+", "", "xxabc"), vec![(2, 3)]);
        assert_eq!(exec(r"\d+", "", "abc123"), vec![(3, 3)]);
    }

    #[test]
    fn test_posix_class() {
        assert_eq!(exec("[[:digit:]]+", "", "a42b"), vec![(1, 2)]);
    }

    #[test]
    fn test_alternation_leftmost_first() {
        assert_eq!(exec("cat|category", "", "category"), vec![(0, 3)]);
    }

    #[test]
    fn test_groups_capture() {
        let re = Regex::compile_with_flags(r"(\w+)@(\w+)", "").unwrap();
        let m = re.exec("mail me at bob@example now").unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0][0], 11);
        assert_eq!(m[0][1], 11);
        assert_eq!((m[0][2], m[0][3]), (11, 3));
        assert_eq!((m[0][4], m[0][5]), (15, 7));
    }

    #[test]
    fn test_named_group_backref() {
        assert_eq!(exec(r"(?<x>ab)\k<x>", "", "abab"), vec![(0, 4)]);
        assert_eq!(exec(r"(?'x'ab)\k'x'", "", "abab"), vec![(0, 4)]);
    }

    #[test]
    fn test_numeric_backref() {
        assert_eq!(exec(r"(a+)b\1", "", "aabaa"), vec![(0, 5)]);
        assert_eq!(exec(r"(a+)b\1", "", "aaba"), vec![]);
    }

    #[test]
    fn test_counted_repetition() {
        assert_eq!(exec("a{3}", "", "aaaa"), vec![(0, 3)]);
        assert_eq!(exec("a{2,3}b", "", "aaab"), vec![(0, 4)]);
        assert_eq!(exec("a{2,}b", "", "ab"), vec![]);
    }

    #[test]
    fn test_lookahead() {
        assert_eq!(exec(r"foo(?=bar)", "", "foobar"), vec![(0, 3)]);
        assert_eq!(exec(r"foo(?!bar)", "", "foobaz"), vec![(0, 3)]);
        assert_eq!(exec(r"foo(?!bar)", "", "foobar"), vec![]);
    }

    #[test]
    fn test_lookbehind() {
        assert_eq!(exec(r"(?<=foo)bar", "", "foobar"), vec![(3, 3)]);
        assert_eq!(exec(r"(?<!foo)bar", "", "bazbar"), vec![(3, 3)]);
        assert_eq!(exec(r"(?<!foo)bar", "", "foobar"), vec![]);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(exec("hello", "i", "say HELLO"), vec![(4, 5)]);
        assert_eq!(exec("(?i:h)ello", "", "Hello"), vec![(0, 5)]);
    }

    #[test]
    fn test_global_collects_all() {
        assert_eq!(exec(r"\d+", "g", "1 22 333"), vec![(0, 1), (2, 2), (5, 3)]);
    }

    #[test]
    fn test_literal_section() {
        assert_eq!(exec(r"\Qa.c\E", "", "xa.cx"), vec![(1, 3)]);
        assert_eq!(exec(r"\Qa.c\E", "", "xabcx"), vec![]);
    }

    #[test]
    fn test_atomic_group() {
        // The atomic group commits to the longest `a+`, so no backtrack
        // leaves an `a` for the trailing literal.
        assert_eq!(exec(r"(?>a+)a", "", "aaa"), vec![]);
        assert_eq!(exec(r"(?>a+)b", "", "aab"), vec![(0, 3)]);
    }

    #[test]
    fn test_recursion() {
        // Balanced parens via (?R).
        assert_eq!(exec(r"\((?:[^()]|(?R))*\)", "", "x((a)b)y"), vec![(1, 6)]);
    }

    #[test]
    fn test_branch_reset_shares_numbers() {
        let re = Regex::compile_with_flags(r"(?|(a)|(b))", "").unwrap();
        assert_eq!(re.num_groups(), 2);
        let m = re.exec("b").unwrap();
        assert_eq!((m[0][2], m[0][3]), (0, 1));
    }

    #[test]
    fn test_filter_groups_and_case() {
        let re = Regex::compile_with_flags(r"(\w+) (\w+)", "").unwrap();
        assert_eq!(
            re.filter("john smith", "$2 $1", "$").unwrap().unwrap(),
            "smith john"
        );
        assert_eq!(
            re.filter("john smith", r"\U$2\E $1", "$").unwrap().unwrap(),
            "SMITH john"
        );
        assert_eq!(
            re.filter("john smith", r"\u$1", "$").unwrap().unwrap(),
            "John"
        );
    }

    #[test]
    fn test_filter_all_matches() {
        let re = Regex::compile_with_flags("o+", "g").unwrap();
        assert_eq!(re.filter("foo boo", "0", "$").unwrap().unwrap(), "f0 b0");
    }

    #[test]
    fn test_filter_no_match() {
        let re = Regex::compile_with_flags("x", "").unwrap();
        assert!(re.filter("abc", "y", "$").unwrap().is_none());
    }

    #[test]
    fn test_split() {
        let re = Regex::compile_with_flags(",", "g").unwrap();
        assert_eq!(re.split("a,b,c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(re.split(",a,").unwrap(), vec!["", "a", ""]);
    }

    #[test]
    fn test_split_joins_back() {
        let re = Regex::compile_with_flags("-", "g").unwrap();
        let pieces = re.split("a-b-c").unwrap();
        assert_eq!(pieces.join("-"), "a-b-c");
    }

    #[test]
    fn test_syntax_errors_carry_position() {
        let e = Regex::compile("(abc", ReOpt::empty()).unwrap_err();
        assert!(matches!(e.kind, RegexErrorKind::Syntax(_)));
        assert_eq!(e.pos, 0);

        let e = Regex::compile("[abc", ReOpt::empty()).unwrap_err();
        assert!(matches!(e.kind, RegexErrorKind::Syntax(_)));
    }

    #[test]
    fn test_too_many_groups() {
        let pat = "(a)".repeat(MAX_GROUPS + 1);
        let e = Regex::compile(&pat, ReOpt::empty()).unwrap_err();
        assert!(matches!(e.kind, RegexErrorKind::TooManyGroups));
    }

    #[test]
    fn test_mode_modifier_scope_restores() {
        assert_eq!(exec("a(?i:b)c", "", "aBc"), vec![(0, 3)]);
        assert_eq!(exec("a(?i:b)c", "", "aBC"), vec![]);
    }

    #[test]
    fn test_extended_mode_ignores_whitespace() {
        assert_eq!(exec("a b  # comment\nc", "x", "abc"), vec![(0, 3)]);
    }

    #[test]
    fn test_non_overlapping_matches() {
        assert_eq!(exec("aa", "g", "aaaa"), vec![(0, 2), (2, 2)]);
    }
}
