//! Recursive-descent parser for Alder

use crate::ast::{BinOp, Builtin, Expr, ExprKind, MatchBody, Program, Stmt, StmtKind, UnOp};
use crate::error::{Loc, Reporter, Severity};
use crate::token::{SpannedToken, Token};

pub struct Parser<'r> {
    tokens: Vec<SpannedToken>,
    pos: usize,
    r: &'r mut Reporter,
}

type PResult<T> = Result<T, ()>;

impl<'r> Parser<'r> {
    pub fn new(tokens: Vec<SpannedToken>, r: &'r mut Reporter) -> Self {
        Parser { tokens, pos: 0, r }
    }

    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn loc(&self) -> Loc {
        self.tokens
            .get(self.pos.min(self.tokens.len() - 1))
            .map(|t| t.loc.clone())
            .unwrap()
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn at(&self, token: &Token) -> bool {
        self.current() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> PResult<()> {
        if self.at(&token) {
            self.advance();
            Ok(())
        } else {
            self.error(format!("expected {:?}, got {:?}", token, self.current()))
        }
    }

    fn error<T>(&mut self, msg: impl Into<String>) -> PResult<T> {
        let loc = self.loc();
        self.r.push(loc, Severity::Fatal, msg);
        Err(())
    }

    /// A semicolon, or an implicit terminator at end of input or block.
    fn expect_semi(&mut self) -> PResult<()> {
        if self.eat(&Token::Semicolon) {
            return Ok(());
        }
        if self.at(&Token::Eof) || self.at(&Token::RBrace) {
            return Ok(());
        }
        self.error(format!("expected ';', got {:?}", self.current()))
    }

    pub fn parse(&mut self) -> PResult<Program> {
        let mut program = Program::default();
        while !self.at(&Token::Eof) {
            program.stmts.push(self.parse_stmt()?);
        }
        Ok(program)
    }

    fn stmt(&self, loc: Loc, kind: StmtKind) -> Stmt {
        Stmt { loc, scope: -1, when: None, kind }
    }

    fn expr(&self, loc: Loc, kind: ExprKind) -> Expr {
        Expr { loc, kind }
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        match self.current().clone() {
            Token::Var => self.parse_var_decl(),
            Token::Fn => self.parse_fn_def(),
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::Do => self.parse_do(),
            Token::For => self.parse_for(),
            Token::Enum => self.parse_enum(),
            Token::LBrace => {
                self.advance();
                let mut stmts = Vec::new();
                while !self.at(&Token::RBrace) && !self.at(&Token::Eof) {
                    stmts.push(self.parse_stmt()?);
                }
                self.expect(Token::RBrace)?;
                Ok(self.stmt(loc, StmtKind::Block(stmts)))
            }
            Token::Return => {
                self.advance();
                let expr = if self.at(&Token::Semicolon) || self.at(&Token::When) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.finish_simple(loc, StmtKind::Return(expr))
            }
            Token::Last => {
                self.advance();
                self.finish_simple(loc, StmtKind::Last)
            }
            Token::Next => {
                self.advance();
                self.finish_simple(loc, StmtKind::Next)
            }
            Token::Die => {
                self.advance();
                let expr = self.parse_expr()?;
                self.finish_simple(loc, StmtKind::Die(expr))
            }
            Token::Goto => {
                self.advance();
                let name = self.parse_ident_name()?;
                self.finish_simple(loc, StmtKind::Goto(name))
            }
            Token::Print => {
                self.advance();
                let args = self.parse_print_args()?;
                self.finish_simple(loc, StmtKind::Print(args))
            }
            Token::Println => {
                self.advance();
                let args = self.parse_print_args()?;
                self.finish_simple(loc, StmtKind::Println(args))
            }
            Token::Ident(name) if self.peek() == &Token::Colon => {
                self.advance();
                self.advance();
                Ok(self.stmt(loc, StmtKind::Label(name)))
            }
            Token::Semicolon => {
                self.advance();
                Ok(self.stmt(loc, StmtKind::Null))
            }
            _ => {
                let expr = self.parse_expr()?;
                self.finish_simple(loc, StmtKind::Expr(expr))
            }
        }
    }

    /// Attach a trailing `when` condition, then require a terminator.
    fn finish_simple(&mut self, loc: Loc, kind: StmtKind) -> PResult<Stmt> {
        let mut stmt = self.stmt(loc, kind);
        if self.eat(&Token::When) {
            stmt.when = Some(self.parse_expr()?);
        }
        self.expect_semi()?;
        Ok(stmt)
    }

    fn parse_ident_name(&mut self) -> PResult<String> {
        match self.current().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            t => self.error(format!("expected an identifier, got {:?}", t)),
        }
    }

    fn parse_print_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.at(&Token::Semicolon)
            || self.at(&Token::When)
            || self.at(&Token::Eof)
            || self.at(&Token::RBrace)
        {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(args)
    }

    /// `: stmt` or `{ ... }` after a control-flow head.
    fn parse_body(&mut self) -> PResult<Stmt> {
        if self.eat(&Token::Colon) {
            self.parse_stmt()
        } else if self.at(&Token::LBrace) {
            self.parse_stmt()
        } else {
            self.error(format!("expected ':' or '{{', got {:?}", self.current()))
        }
    }

    fn parse_var_decl(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // var
        let (names, init) = self.parse_var_names_init()?;
        let mut stmt = self.stmt(loc, StmtKind::VarDecl { names, init });
        if self.eat(&Token::When) {
            // Reported as an error at compile time, like every other
            // malformed condition; the parse still has to carry it.
            stmt.when = Some(self.parse_expr()?);
        }
        self.expect_semi()?;
        Ok(stmt)
    }

    fn parse_var_names_init(&mut self) -> PResult<(Vec<String>, Vec<Expr>)> {
        let mut names = vec![self.parse_ident_name()?];
        while self.eat(&Token::Comma) {
            names.push(self.parse_ident_name()?);
        }
        let mut init = Vec::new();
        if self.eat(&Token::Assign) {
            loop {
                init.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            if init.len() != names.len() {
                return self.error("variable declaration initializer count does not match");
            }
        }
        Ok((names, init))
    }

    fn parse_fn_def(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // fn
        let name = self.parse_ident_name()?;

        let mut params = Vec::new();
        let mut defaults = Vec::new();
        if self.eat(&Token::LParen) {
            while !self.at(&Token::RParen) {
                params.push(self.parse_ident_name()?);
                if self.eat(&Token::Assign) {
                    defaults.push(Some(self.parse_expr()?));
                } else {
                    defaults.push(None);
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen)?;
        }

        let body = if self.eat(&Token::Assign) {
            let bloc = self.loc();
            let expr = self.parse_expr()?;
            let ret = self.stmt(bloc, StmtKind::Return(Some(expr)));
            self.expect_semi()?;
            ret
        } else {
            self.parse_body()?
        };

        Ok(self.stmt(loc, StmtKind::FnDef { name, params, defaults, body: Box::new(body) }))
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // if
        let cond = self.parse_expr()?;
        let then = self.parse_body()?;
        let otherwise = if self.eat(&Token::Else) {
            if self.at(&Token::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                Some(Box::new(self.parse_body()?))
            }
        } else {
            None
        };
        Ok(self.stmt(loc, StmtKind::If { cond, then: Box::new(then), otherwise }))
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // while
        let cond = self.parse_expr()?;
        let body = self.parse_body()?;
        Ok(self.stmt(loc, StmtKind::While { cond, body: Box::new(body) }))
    }

    fn parse_do(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // do
        let body = self.parse_body()?;
        self.expect(Token::While)?;
        let cond = self.parse_expr()?;
        self.expect_semi()?;
        Ok(self.stmt(loc, StmtKind::Do { body: Box::new(body), cond }))
    }

    /// All five for-loop shapes, encoded by which clauses survive:
    ///   for a; b; c: ...    C-style
    ///   for var x = e: ...  iterate e into x
    ///   for x = e: ...      same, declaring x in the loop scope
    ///   for var x; e: ...   loop variable + iteration expression
    ///   for e: ...          iterate with the implicit variable
    fn parse_for(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // for

        let (init, cond): (Option<Box<Stmt>>, Option<Expr>) = if self.at(&Token::Var) {
            let dloc = self.loc();
            self.advance();
            let (names, init_exprs) = self.parse_var_names_init()?;
            if self.at(&Token::Colon) || self.at(&Token::LBrace) {
                // `for var x = e:` — the initializer is the iterable.
                if names.len() != 1 || init_exprs.len() != 1 {
                    return self.error("iteration must declare exactly one variable");
                }
                let iter = init_exprs.into_iter().next().unwrap();
                let decl = self.stmt(dloc, StmtKind::VarDecl { names, init: vec![] });
                (Some(Box::new(decl)), Some(iter))
            } else {
                let decl = self.stmt(dloc, StmtKind::VarDecl { names, init: init_exprs });
                self.expect(Token::Semicolon)?;
                let c = self.parse_expr()?;
                (Some(Box::new(decl)), Some(c))
            }
        } else {
            let eloc = self.loc();
            let first = self.parse_expr()?;
            if self.at(&Token::Colon) || self.at(&Token::LBrace) {
                match first.kind {
                    // `for x = e:` declares x in the loop scope.
                    ExprKind::Assign(lhs, rhs) => {
                        let Expr { loc: lhs_loc, kind: lhs_kind } = *lhs;
                        let head = match lhs_kind {
                            ExprKind::Ident(name) => self.stmt(
                                lhs_loc,
                                StmtKind::VarDecl { names: vec![name], init: vec![] },
                            ),
                            other => {
                                let e = Expr { loc: lhs_loc.clone(), kind: other };
                                self.stmt(lhs_loc, StmtKind::Expr(e))
                            }
                        };
                        let body = self.parse_body()?;
                        return Ok(self.stmt(loc, StmtKind::For {
                            init: Some(Box::new(head)),
                            cond: Some(*rhs),
                            step: None,
                            body: Box::new(body),
                        }));
                    }
                    _ => {
                        let body = self.parse_body()?;
                        return Ok(self.stmt(loc, StmtKind::For {
                            init: Some(Box::new(self.stmt(eloc, StmtKind::Expr(first)))),
                            cond: None,
                            step: None,
                            body: Box::new(body),
                        }));
                    }
                }
            } else {
                self.expect(Token::Semicolon)?;
                let c = self.parse_expr()?;
                (Some(Box::new(self.stmt(eloc, StmtKind::Expr(first)))), Some(c))
            }
        };

        let step = if self.eat(&Token::Semicolon) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let body = self.parse_body()?;
        Ok(self.stmt(loc, StmtKind::For { init, cond, step, body: Box::new(body) }))
    }

    fn parse_enum(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // enum
        self.expect(Token::LBrace)?;
        let mut names = Vec::new();
        let mut init = Vec::new();
        while !self.at(&Token::RBrace) {
            names.push(self.parse_ident_name()?);
            if self.eat(&Token::Assign) {
                init.push(Some(self.parse_expr()?));
            } else {
                init.push(None);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace)?;
        Ok(self.stmt(loc, StmtKind::Enum { names, init }))
    }

    // ===== expressions =====

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let lhs = self.parse_ternary()?;
        let kind = match self.current() {
            Token::Assign => {
                self.advance();
                ExprKind::Assign(Box::new(lhs), Box::new(self.parse_assign()?))
            }
            Token::PlusEq => {
                self.advance();
                ExprKind::OpAssign(BinOp::Add, Box::new(lhs), Box::new(self.parse_assign()?))
            }
            Token::MinusEq => {
                self.advance();
                ExprKind::OpAssign(BinOp::Sub, Box::new(lhs), Box::new(self.parse_assign()?))
            }
            Token::StarEq => {
                self.advance();
                ExprKind::OpAssign(BinOp::Mul, Box::new(lhs), Box::new(self.parse_assign()?))
            }
            Token::SlashEq => {
                self.advance();
                ExprKind::OpAssign(BinOp::Div, Box::new(lhs), Box::new(self.parse_assign()?))
            }
            Token::DotEq => {
                self.advance();
                ExprKind::OpAssign(BinOp::Add, Box::new(lhs), Box::new(self.parse_assign()?))
            }
            Token::Squiggle => {
                self.advance();
                ExprKind::Squiggle(Box::new(lhs), Box::new(self.parse_ternary()?))
            }
            _ => return Ok(lhs),
        };
        Ok(self.expr(loc, kind))
    }

    fn parse_ternary(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_expr()?;
            self.expect(Token::Colon)?;
            let otherwise = self.parse_ternary()?;
            Ok(self.expr(
                loc,
                ExprKind::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
            ))
        } else {
            Ok(cond)
        }
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> PResult<Expr>,
        table: &[(Token, BinOp)],
    ) -> PResult<Expr> {
        let loc = self.loc();
        let mut lhs = next(self)?;
        'outer: loop {
            for (tok, op) in table {
                if self.at(tok) {
                    self.advance();
                    let rhs = next(self)?;
                    lhs = self.expr(
                        loc.clone(),
                        ExprKind::Binary(*op, Box::new(lhs), Box::new(rhs)),
                    );
                    continue 'outer;
                }
            }
            break;
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        self.binary_level(Self::parse_and, &[(Token::OrOr, BinOp::Or)])
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        self.binary_level(Self::parse_bitor, &[(Token::AndAnd, BinOp::And)])
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        self.binary_level(Self::parse_bitxor, &[(Token::Pipe, BinOp::BitOr)])
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        self.binary_level(Self::parse_bitand, &[(Token::Caret, BinOp::BitXor)])
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        self.binary_level(Self::parse_equality, &[(Token::Amp, BinOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::parse_comparison,
            &[(Token::EqEq, BinOp::EqEq), (Token::NotEq, BinOp::NotEq)],
        )
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::parse_range,
            &[
                (Token::Lt, BinOp::Less),
                (Token::Gt, BinOp::More),
                (Token::Le, BinOp::Leq),
                (Token::Ge, BinOp::Geq),
            ],
        )
    }

    fn parse_range(&mut self) -> PResult<Expr> {
        self.binary_level(Self::parse_shift, &[(Token::DotDot, BinOp::Range)])
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::parse_additive,
            &[(Token::Shl, BinOp::Shl), (Token::Shr, BinOp::Shr)],
        )
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::parse_multiplicative,
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        self.binary_level(
            Self::parse_pow,
            &[
                (Token::Star, BinOp::Mul),
                (Token::Slash, BinOp::Div),
                (Token::Percent, BinOp::Mod),
            ],
        )
    }

    fn parse_pow(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let base = self.parse_unary()?;
        if self.eat(&Token::StarStar) {
            let exp = self.parse_pow()?;
            Ok(self.expr(loc, ExprKind::Binary(BinOp::Pow, Box::new(base), Box::new(exp))))
        } else {
            Ok(base)
        }
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        match self.current() {
            Token::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(self.expr(loc, ExprKind::Unary(UnOp::Neg, Box::new(operand))))
            }
            Token::Bang => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(self.expr(loc, ExprKind::Unary(UnOp::Not, Box::new(operand))))
            }
            Token::Plus => {
                self.advance();
                self.parse_unary()
            }
            Token::Inc => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(self.expr(loc, ExprKind::PreInc(Box::new(operand))))
            }
            Token::Dec => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(self.expr(loc, ExprKind::PreDec(Box::new(operand))))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let mut expr = self.parse_primary()?;
        loop {
            match self.current() {
                Token::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    while !self.at(&Token::RParen) {
                        args.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                    expr = match expr.kind {
                        ExprKind::Ident(ref name) if Builtin::lookup(name).is_some() => {
                            let bi = Builtin::lookup(name).unwrap();
                            self.expr(loc.clone(), ExprKind::BuiltinCall(bi, args))
                        }
                        _ => self.expr(loc.clone(), ExprKind::Call(Box::new(expr), args)),
                    };
                }
                Token::LBracket => {
                    self.advance();
                    expr = self.parse_subscript_or_slice(loc.clone(), expr)?;
                }
                Token::Dot => {
                    self.advance();
                    let name = self.parse_ident_name()?;
                    expr = self.expr(loc.clone(), ExprKind::Member(Box::new(expr), name));
                }
                Token::Inc => {
                    self.advance();
                    expr = self.expr(loc.clone(), ExprKind::PostInc(Box::new(expr)));
                }
                Token::Dec => {
                    self.advance();
                    expr = self.expr(loc.clone(), ExprKind::PostDec(Box::new(expr)));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_subscript_or_slice(&mut self, loc: Loc, base: Expr) -> PResult<Expr> {
        let start = if self.at(&Token::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };

        if self.eat(&Token::RBracket) {
            let idx = match start {
                Some(idx) => idx,
                None => return self.error("expected a subscript expression"),
            };
            return Ok(self.expr(loc, ExprKind::Subscript(Box::new(base), idx)));
        }

        self.expect(Token::Colon)?;
        let stop = if self.at(&Token::Colon) || self.at(&Token::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if self.eat(&Token::Colon) {
            if self.at(&Token::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            }
        } else {
            None
        };
        self.expect(Token::RBracket)?;
        Ok(self.expr(loc, ExprKind::Slice { base: Box::new(base), start, stop, step }))
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        match self.current().clone() {
            Token::Int(n) => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Int(n)))
            }
            Token::Float(f) => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Float(f)))
            }
            Token::Bool(b) => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Bool(b)))
            }
            Token::Str(value, interp) => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Str { value, interp }))
            }
            Token::Regex(pattern, subst, flags) => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Regex { pattern, subst, flags }))
            }
            Token::Group(n) => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Group(n)))
            }
            Token::Nil => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Nil))
            }
            Token::Ellipsis => {
                self.advance();
                Ok(self.expr(loc, ExprKind::Varargs))
            }
            Token::Ident(name) => {
                self.advance();
                if name == "_" {
                    Ok(self.expr(loc, ExprKind::Imp))
                } else {
                    Ok(self.expr(loc, ExprKind::Ident(name)))
                }
            }
            Token::Eval => {
                self.advance();
                self.expect(Token::LParen)?;
                let src = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(self.expr(loc, ExprKind::Eval(Box::new(src))))
            }
            Token::Match => self.parse_match(),
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => self.parse_list_or_comprehension(),
            Token::LBrace => self.parse_table(),
            t => self.error(format!("expected an expression, got {:?}", t)),
        }
    }

    fn parse_match(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        self.advance(); // match
        let subject = self.parse_expr()?;
        self.expect(Token::LBrace)?;
        let mut arms = Vec::new();
        while !self.at(&Token::RBrace) && !self.at(&Token::Eof) {
            let pat = self.parse_ternary()?;
            self.expect(Token::Colon)?;
            let body = if self.at(&Token::LBrace) {
                let mut stmts = Vec::new();
                self.advance();
                while !self.at(&Token::RBrace) && !self.at(&Token::Eof) {
                    stmts.push(self.parse_stmt()?);
                }
                self.expect(Token::RBrace)?;
                MatchBody::Block(stmts)
            } else {
                MatchBody::Expr(Box::new(self.parse_ternary()?))
            };
            arms.push((pat, body));
            self.eat(&Token::Comma);
        }
        self.expect(Token::RBrace)?;
        Ok(self.expr(loc, ExprKind::Match { subject: Box::new(subject), arms }))
    }

    fn parse_list_or_comprehension(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        self.advance(); // [
        if self.eat(&Token::RBracket) {
            return Ok(self.expr(loc, ExprKind::List(Vec::new())));
        }

        let first = self.parse_expr()?;

        if self.eat(&Token::For) {
            let (var, iter) = if self.eat(&Token::Var) {
                let name = self.parse_ident_name()?;
                self.expect(Token::Assign)?;
                (Some(name), self.parse_expr()?)
            } else {
                let e = self.parse_expr()?;
                match e.kind {
                    ExprKind::Assign(lhs, rhs) => match lhs.kind {
                        ExprKind::Ident(name) => (Some(name), *rhs),
                        _ => return self.error("expected a variable to iterate into"),
                    },
                    _ => (None, e),
                }
            };
            self.expect(Token::RBracket)?;
            return Ok(self.expr(
                loc,
                ExprKind::Comprehension { value: Box::new(first), var, iter: Box::new(iter) },
            ));
        }

        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.at(&Token::RBracket) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(Token::RBracket)?;
        Ok(self.expr(loc, ExprKind::List(items)))
    }

    fn parse_table(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        self.advance(); // {
        let mut pairs = Vec::new();
        while !self.at(&Token::RBrace) && !self.at(&Token::Eof) {
            let key = match self.current().clone() {
                Token::Ident(name) => {
                    self.advance();
                    name
                }
                Token::Str(s, _) => {
                    self.advance();
                    s
                }
                t => return self.error(format!("expected a table key, got {:?}", t)),
            };
            self.expect(Token::Assign)?;
            let value = self.parse_expr()?;
            pairs.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace)?;
        Ok(self.expr(loc, ExprKind::Table(pairs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use std::rc::Rc;

    fn parse(src: &str) -> Program {
        let mut r = Reporter::new();
        let tokens = Lexer::new(Rc::from(src), Rc::from("test"), &mut r).tokenize();
        assert!(!r.fatal, "lex failed: {:?}", r.diags);
        let program = Parser::new(tokens, &mut r).parse();
        assert!(!r.fatal, "parse failed: {:?}", r.diags);
        program.unwrap()
    }

    #[test]
    fn test_precedence() {
        let p = parse("println 2 + 3 * 4;");
        match &p.stmts[0].kind {
            StmtKind::Println(args) => match &args[0].kind {
                ExprKind::Binary(BinOp::Add, _, rhs) => {
                    assert!(matches!(rhs.kind, ExprKind::Binary(BinOp::Mul, _, _)))
                }
                k => panic!("bad tree: {:?}", k),
            },
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_var_decl_multi() {
        let p = parse("var a, b = 1, 2;");
        match &p.stmts[0].kind {
            StmtKind::VarDecl { names, init } => {
                assert_eq!(names, &["a", "b"]);
                assert_eq!(init.len(), 2);
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_fn_shorthand_body() {
        let p = parse("fn f(x = 5) = x * 2;");
        match &p.stmts[0].kind {
            StmtKind::FnDef { name, params, defaults, body } => {
                assert_eq!(name, "f");
                assert_eq!(params, &["x"]);
                assert!(defaults[0].is_some());
                assert!(matches!(body.kind, StmtKind::Return(Some(_))));
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_for_each_declares_var() {
        let p = parse("for x = 0..2: print x;");
        match &p.stmts[0].kind {
            StmtKind::For { init, cond, step, .. } => {
                assert!(matches!(
                    init.as_ref().unwrap().kind,
                    StmtKind::VarDecl { .. }
                ));
                assert!(matches!(
                    cond.as_ref().unwrap().kind,
                    ExprKind::Binary(BinOp::Range, _, _)
                ));
                assert!(step.is_none());
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_c_style_for() {
        let p = parse("for var i = 0; i < 10; i++ { print i; }");
        match &p.stmts[0].kind {
            StmtKind::For { init, cond, step, .. } => {
                assert!(init.is_some());
                assert!(cond.is_some());
                assert!(step.is_some());
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_implicit_for() {
        let p = parse("for [1, 2, 3]: print _;");
        match &p.stmts[0].kind {
            StmtKind::For { init, cond, step, .. } => {
                assert!(init.is_some());
                assert!(cond.is_none());
                assert!(step.is_none());
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_table_and_member() {
        let p = parse("var t = {a = 1, b = 2}; println t.a + t.b;");
        assert_eq!(p.stmts.len(), 2);
        match &p.stmts[1].kind {
            StmtKind::Println(args) => {
                assert!(matches!(args[0].kind, ExprKind::Binary(BinOp::Add, _, _)))
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_squiggle_subst() {
        let p = parse(r#"s ~= /o+/"0";"#);
        match &p.stmts[0].kind {
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::Squiggle(_, rhs) => {
                    assert!(matches!(rhs.kind, ExprKind::Regex { subst: Some(_), .. }))
                }
                k => panic!("bad tree: {:?}", k),
            },
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_when_suffix() {
        let p = parse("print 1 when x > 2;");
        assert!(p.stmts[0].when.is_some());
    }

    #[test]
    fn test_comprehension() {
        let p = parse("var a = [x * 2 for var x = [1, 2]];");
        match &p.stmts[0].kind {
            StmtKind::VarDecl { init, .. } => {
                assert!(matches!(init[0].kind, ExprKind::Comprehension { .. }))
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_match_expr() {
        let p = parse(r#"var x = match s { /a+/: 1, "b": 2 };"#);
        match &p.stmts[0].kind {
            StmtKind::VarDecl { init, .. } => match &init[0].kind {
                ExprKind::Match { arms, .. } => assert_eq!(arms.len(), 2),
                k => panic!("bad tree: {:?}", k),
            },
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_slice() {
        let p = parse("var b = a[1:3:2];");
        match &p.stmts[0].kind {
            StmtKind::VarDecl { init, .. } => {
                assert!(matches!(init[0].kind, ExprKind::Slice { .. }))
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_label_and_goto() {
        let p = parse("top: goto top;");
        assert!(matches!(p.stmts[0].kind, StmtKind::Label(_)));
        assert!(matches!(p.stmts[1].kind, StmtKind::Goto(_)));
    }

    #[test]
    fn test_enum() {
        let p = parse("enum { A, B = 3, C }");
        match &p.stmts[0].kind {
            StmtKind::Enum { names, init } => {
                assert_eq!(names, &["A", "B", "C"]);
                assert!(init[0].is_none());
                assert!(init[1].is_some());
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }

    #[test]
    fn test_builtin_call() {
        let p = parse("push(a, 1);");
        match &p.stmts[0].kind {
            StmtKind::Expr(e) => {
                assert!(matches!(e.kind, ExprKind::BuiltinCall(Builtin::Push, _)))
            }
            k => panic!("bad stmt: {:?}", k),
        }
    }
}
