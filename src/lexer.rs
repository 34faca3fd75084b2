//! Lexer for Alder

use std::rc::Rc;

use crate::error::{Loc, Reporter, Severity};
use crate::token::{SpannedToken, Token};

pub struct Lexer<'r> {
    text: Rc<str>,
    file: Rc<str>,
    bytes: Vec<u8>,
    pos: usize,
    last: Option<Token>,
    r: &'r mut Reporter,
}

impl<'r> Lexer<'r> {
    pub fn new(text: Rc<str>, file: Rc<str>, r: &'r mut Reporter) -> Self {
        let bytes = text.as_bytes().to_vec();
        Lexer { text, file, bytes, pos: 0, last: None, r }
    }

    fn cur(&self) -> u8 {
        self.bytes.get(self.pos).copied().unwrap_or(0)
    }

    fn peek(&self) -> u8 {
        self.bytes.get(self.pos + 1).copied().unwrap_or(0)
    }

    fn loc(&self, start: usize) -> Loc {
        Loc::new(
            Rc::clone(&self.file),
            Rc::clone(&self.text),
            start,
            self.pos.saturating_sub(start).max(1),
        )
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.cur() {
                b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c => self.pos += 1,
                b'#' => {
                    while self.cur() != b'\n' && self.cur() != 0 {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while self.cur().is_ascii_alphanumeric() || self.cur() == b'_' {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn read_number(&mut self) -> Token {
        let start = self.pos;

        if self.cur() == b'0' && (self.peek() == b'x' || self.peek() == b'X') {
            self.pos += 2;
            let hstart = self.pos;
            while self.cur().is_ascii_hexdigit() {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.bytes[hstart..self.pos]).unwrap_or("0");
            return Token::Int(i64::from_str_radix(text, 16).unwrap_or(0));
        }

        let mut is_float = false;
        while self.cur().is_ascii_digit() {
            self.pos += 1;
        }
        if self.cur() == b'.' && self.peek().is_ascii_digit() {
            is_float = true;
            self.pos += 1;
            while self.cur().is_ascii_digit() {
                self.pos += 1;
            }
        }
        if (self.cur() == b'e' || self.cur() == b'E')
            && (self.peek().is_ascii_digit() || self.peek() == b'-' || self.peek() == b'+')
        {
            is_float = true;
            self.pos += 1;
            if self.cur() == b'-' || self.cur() == b'+' {
                self.pos += 1;
            }
            while self.cur().is_ascii_digit() {
                self.pos += 1;
            }
        }

        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("0");
        if is_float {
            Token::Float(text.parse().unwrap_or(0.0))
        } else {
            Token::Int(text.parse().unwrap_or(0))
        }
    }

    fn escape_char(&mut self) -> u8 {
        // Called with pos on the character after the backslash.
        let c = self.cur();
        self.pos += 1;
        match c {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0b,
            b'0'..=b'7' => {
                let mut n = 0u32;
                self.pos -= 1;
                while (b'0'..=b'7').contains(&self.cur()) {
                    n = n * 8 + (self.cur() - b'0') as u32;
                    self.pos += 1;
                }
                n as u8
            }
            b'x' => {
                let mut n = 0u32;
                while self.cur().is_ascii_hexdigit() {
                    n = n * 16 + (self.cur() as char).to_digit(16).unwrap();
                    self.pos += 1;
                }
                n as u8
            }
            _ => c,
        }
    }

    fn read_string(&mut self, start: usize) -> Token {
        self.pos += 1; // opening quote
        let mut s = Vec::new();
        let mut interp = false;

        loop {
            match self.cur() {
                0 | b'\n' => {
                    self.r.push(self.loc(start), Severity::Fatal, "unterminated string literal");
                    break;
                }
                b'"' => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    self.pos += 1;
                    match self.cur() {
                        b'"' => {
                            s.push(b'"');
                            self.pos += 1;
                        }
                        b'\\' => {
                            s.push(b'\\');
                            self.pos += 1;
                        }
                        b'$' => {
                            s.push(b'$');
                            self.pos += 1;
                        }
                        _ => s.push(self.escape_char()),
                    }
                }
                b'$' => {
                    let next = self.peek();
                    if next.is_ascii_alphanumeric() || next == b'_' || next == b'{' {
                        interp = true;
                    }
                    s.push(b'$');
                    self.pos += 1;
                }
                c => {
                    s.push(c);
                    self.pos += 1;
                }
            }
        }

        Token::Str(String::from_utf8_lossy(&s).into_owned(), interp)
    }

    fn read_char_literal(&mut self, start: usize) -> Token {
        self.pos += 1; // opening quote
        let c = match self.cur() {
            0 | b'\n' => {
                self.r.push(self.loc(start), Severity::Fatal, "unterminated character literal");
                0
            }
            b'\\' => {
                self.pos += 1;
                self.escape_char()
            }
            c => {
                self.pos += 1;
                c
            }
        };
        if self.cur() == b'\'' {
            self.pos += 1;
        } else {
            self.r.push(self.loc(start), Severity::Fatal, "unterminated character literal");
        }
        Token::Int(c as i64)
    }

    fn read_regex(&mut self, start: usize) -> Token {
        self.pos += 1; // opening slash
        let mut pat = Vec::new();

        loop {
            match self.cur() {
                0 => {
                    self.r.push(self.loc(start), Severity::Fatal, "unterminated regular expression");
                    break;
                }
                b'/' => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    if self.peek() == b'/' {
                        pat.push(b'/');
                        self.pos += 2;
                    } else {
                        // Every other escape belongs to the regex engine.
                        pat.push(b'\\');
                        self.pos += 1;
                        if self.cur() != 0 {
                            pat.push(self.cur());
                            self.pos += 1;
                        }
                    }
                }
                c => {
                    pat.push(c);
                    self.pos += 1;
                }
            }
        }

        // Optional substitution: /pat/"replacement"
        let mut subst = None;
        if self.cur() == b'"' {
            self.pos += 1;
            let mut s = Vec::new();
            loop {
                match self.cur() {
                    0 | b'\n' => {
                        self.r.push(self.loc(start), Severity::Fatal, "unterminated substitution");
                        break;
                    }
                    b'"' => {
                        self.pos += 1;
                        break;
                    }
                    b'\\' => {
                        // Replacement escapes (\U, \1, \\ ...) are interpreted
                        // at substitution time, except the closing quote.
                        if self.peek() == b'"' {
                            s.push(b'"');
                            self.pos += 2;
                        } else {
                            s.push(b'\\');
                            self.pos += 1;
                            if self.cur() != 0 {
                                s.push(self.cur());
                                self.pos += 1;
                            }
                        }
                    }
                    c => {
                        s.push(c);
                        self.pos += 1;
                    }
                }
            }
            subst = Some(String::from_utf8_lossy(&s).into_owned());
        }

        let mut flags = String::new();
        while self.cur().is_ascii_alphabetic() {
            let c = self.cur() as char;
            if "ixgmce".contains(c) {
                flags.push(c);
                self.pos += 1;
            } else {
                self.r.push(
                    self.loc(self.pos),
                    Severity::Fatal,
                    format!("unrecognized regex flag '{}'", c),
                );
                self.pos += 1;
            }
        }

        Token::Regex(String::from_utf8_lossy(&pat).into_owned(), subst, flags)
    }

    pub fn next_token(&mut self) -> SpannedToken {
        self.skip_whitespace();
        let start = self.pos;

        macro_rules! two {
            ($tok:expr) => {{
                self.pos += 2;
                $tok
            }};
        }
        macro_rules! one {
            ($tok:expr) => {{
                self.pos += 1;
                $tok
            }};
        }

        let token = match self.cur() {
            0 => Token::Eof,

            b'"' => self.read_string(start),
            b'\'' => self.read_char_literal(start),
            b'0'..=b'9' => self.read_number(),

            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let ident = self.read_ident();
                Token::keyword(&ident).unwrap_or(Token::Ident(ident))
            }

            b'$' => {
                if self.peek().is_ascii_digit() {
                    self.pos += 1;
                    let dstart = self.pos;
                    while self.cur().is_ascii_digit() {
                        self.pos += 1;
                    }
                    let text = std::str::from_utf8(&self.bytes[dstart..self.pos]).unwrap_or("0");
                    Token::Group(text.parse().unwrap_or(0))
                } else {
                    self.r.push(self.loc(start), Severity::Fatal, "stray '$' outside of a string");
                    one!(Token::Eof)
                }
            }

            b'/' => {
                let regex_ok = self.last.as_ref().map(|t| t.regex_may_follow()).unwrap_or(true);
                if regex_ok {
                    self.read_regex(start)
                } else if self.peek() == b'=' {
                    two!(Token::SlashEq)
                } else {
                    one!(Token::Slash)
                }
            }

            b'+' => match self.peek() {
                b'+' => two!(Token::Inc),
                b'=' => two!(Token::PlusEq),
                _ => one!(Token::Plus),
            },
            b'-' => match self.peek() {
                b'-' => two!(Token::Dec),
                b'=' => two!(Token::MinusEq),
                _ => one!(Token::Minus),
            },
            b'*' => match self.peek() {
                b'*' => two!(Token::StarStar),
                b'=' => two!(Token::StarEq),
                _ => one!(Token::Star),
            },
            b'%' => one!(Token::Percent),
            b'.' => {
                if self.peek() == b'.' {
                    if self.bytes.get(self.pos + 2) == Some(&b'.') {
                        self.pos += 3;
                        Token::Ellipsis
                    } else {
                        two!(Token::DotDot)
                    }
                } else if self.peek() == b'=' {
                    two!(Token::DotEq)
                } else {
                    one!(Token::Dot)
                }
            }
            b'=' => match self.peek() {
                b'=' => two!(Token::EqEq),
                b'~' => two!(Token::Squiggle),
                _ => one!(Token::Assign),
            },
            b'~' => match self.peek() {
                b'=' => two!(Token::Squiggle),
                _ => {
                    self.r.push(self.loc(start), Severity::Fatal, "unexpected character '~'");
                    one!(Token::Eof)
                }
            },
            b'!' => match self.peek() {
                b'=' => two!(Token::NotEq),
                _ => one!(Token::Bang),
            },
            b'<' => match self.peek() {
                b'=' => two!(Token::Le),
                b'<' => two!(Token::Shl),
                _ => one!(Token::Lt),
            },
            b'>' => match self.peek() {
                b'=' => two!(Token::Ge),
                b'>' => two!(Token::Shr),
                _ => one!(Token::Gt),
            },
            b'&' => match self.peek() {
                b'&' => two!(Token::AndAnd),
                _ => one!(Token::Amp),
            },
            b'|' => match self.peek() {
                b'|' => two!(Token::OrOr),
                _ => one!(Token::Pipe),
            },
            b'^' => one!(Token::Caret),
            b'?' => one!(Token::Question),

            b'(' => one!(Token::LParen),
            b')' => one!(Token::RParen),
            b'[' => one!(Token::LBracket),
            b']' => one!(Token::RBracket),
            b'{' => one!(Token::LBrace),
            b'}' => one!(Token::RBrace),
            b',' => one!(Token::Comma),
            b';' => one!(Token::Semicolon),
            b':' => one!(Token::Colon),

            c => {
                self.r.push(
                    self.loc(start),
                    Severity::Fatal,
                    format!("unexpected character '{}'", c as char),
                );
                one!(Token::Eof)
            }
        };

        self.last = Some(token.clone());
        SpannedToken { token, loc: self.loc(start) }
    }

    pub fn tokenize(&mut self) -> Vec<SpannedToken> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token();
            let done = tok.token == Token::Eof;
            tokens.push(tok);
            if done || self.r.fatal {
                break;
            }
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        let mut r = Reporter::new();
        let mut lexer = Lexer::new(Rc::from(src), Rc::from("test"), &mut r);
        lexer.tokenize().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(lex("42"), vec![Token::Int(42), Token::Eof]);
        assert_eq!(lex("0x10"), vec![Token::Int(16), Token::Eof]);
        assert_eq!(lex("1.5"), vec![Token::Float(1.5), Token::Eof]);
        assert_eq!(lex("2.5e2"), vec![Token::Float(250.0), Token::Eof]);
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            lex("var foo fn"),
            vec![Token::Var, Token::Ident("foo".into()), Token::Fn, Token::Eof]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(lex(r#""a\tb""#), vec![Token::Str("a\tb".into(), false), Token::Eof]);
    }

    #[test]
    fn test_string_interpolation_flag() {
        assert_eq!(lex(r#""x is $x""#), vec![Token::Str("x is $x".into(), true), Token::Eof]);
        assert_eq!(lex(r#""100\$""#), vec![Token::Str("100$".into(), false), Token::Eof]);
    }

    #[test]
    fn test_char_literal_is_int() {
        assert_eq!(lex("'a'"), vec![Token::Int(97), Token::Eof]);
        assert_eq!(lex(r"'\n'"), vec![Token::Int(10), Token::Eof]);
    }

    #[test]
    fn test_slash_division_vs_regex() {
        assert_eq!(
            lex("x / y"),
            vec![
                Token::Ident("x".into()),
                Token::Slash,
                Token::Ident("y".into()),
                Token::Eof
            ]
        );
        assert_eq!(
            lex("x ~= /o+/"),
            vec![
                Token::Ident("x".into()),
                Token::Squiggle,
                Token::Regex("o+".into(), None, "".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_regex_with_substitution_and_flags() {
        assert_eq!(
            lex(r#"s ~= /o+/"0"gi"#),
            vec![
                Token::Ident("s".into()),
                Token::Squiggle,
                Token::Regex("o+".into(), Some("0".into()), "gi".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_regex_escaped_slash() {
        assert_eq!(
            lex(r"for /a\/b/: next;"),
            vec![
                Token::For,
                Token::Regex("a/b".into(), None, "".into()),
                Token::Colon,
                Token::Next,
                Token::Semicolon,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_both_squiggle_spellings() {
        assert_eq!(lex("a ~= b")[1], Token::Squiggle);
        assert_eq!(lex("a =~ b")[1], Token::Squiggle);
    }

    #[test]
    fn test_group_token() {
        assert_eq!(lex("$1"), vec![Token::Group(1), Token::Eof]);
    }

    #[test]
    fn test_comments() {
        assert_eq!(lex("1 # comment\n2"), vec![Token::Int(1), Token::Int(2), Token::Eof]);
    }

    #[test]
    fn test_range_and_ellipsis() {
        assert_eq!(lex("0..2")[1], Token::DotDot);
        assert_eq!(lex("f(...)")[2], Token::Ellipsis);
    }
}
