//! Symbol resolution
//!
//! Symbols form a tree stored in an arena of nodes addressed by stable
//! indices; `parent` links let name resolution walk upward without any
//! shared ownership. Every block-like construct gets a fresh integer scope
//! id, written back onto the statements it covers; the compiler later finds
//! the scope a statement belongs to through `find_from_scope`.
//!
//! Eval children symbolize into their parent module's arena, rooted at the
//! lexical scope the eval occurred in, so resolution inside eval'd code sees
//! the enclosing function's names.

use std::io::Write;

use crate::ast::{Expr, ExprKind, MatchBody, Program, Stmt, StmtKind};
use crate::error::{Loc, Reporter, Severity};

pub type SymId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Module,
    Fn,
    Var,
    Argument,
    Block,
    Label,
    Enum,
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub kind: SymKind,
    pub parent: Option<SymId>,
    pub children: Vec<SymId>,
    pub scope: i32,
    pub module: usize,

    /// Function entry, variable register, or label address; filled in by
    /// the compiler.
    pub address: usize,
    pub num_variables: usize,
    pub num_arguments: usize,
    /// Module-root variables are addressed as NUM_REG + address.
    pub global: bool,
    /// Function nesting depth of the scope.
    pub fp: usize,
    /// The scope pushes the implicit variable while it runs.
    pub imp: bool,

    /// Enclosing-loop continue/break addresses, recorded when the loop is
    /// compiled so eval'd `next`/`last` can escape to them.
    pub next: i64,
    pub last: i64,

    pub enum_val: i64,
    /// Forward-goto instruction indices waiting for this label.
    pub pending_gotos: Vec<usize>,
    pub label_addr: Option<usize>,
}

impl Symbol {
    fn new(name: impl Into<String>, kind: SymKind, scope: i32, module: usize) -> Self {
        Symbol {
            name: name.into(),
            kind,
            parent: None,
            children: Vec::new(),
            scope,
            module,
            address: usize::MAX,
            num_variables: 0,
            num_arguments: 0,
            global: false,
            fp: 0,
            imp: false,
            next: -1,
            last: -1,
            enum_val: 0,
            pending_gotos: Vec::new(),
            label_addr: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    pub syms: Vec<Symbol>,
    next_scope: i32,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn fresh_scope(&mut self) -> i32 {
        let s = self.next_scope;
        self.next_scope += 1;
        s
    }

    fn push(&mut self, mut sym: Symbol, parent: Option<SymId>) -> SymId {
        sym.parent = parent;
        let id = self.syms.len();
        self.syms.push(sym);
        if let Some(p) = parent {
            self.syms[p].children.push(id);
        }
        id
    }

    /// Search upward through enclosing scopes for a named symbol.
    pub fn resolve(&self, from: SymId, name: &str) -> Option<SymId> {
        let mut at = Some(from);
        while let Some(id) = at {
            for &child in &self.syms[id].children {
                let c = &self.syms[child];
                if c.name == name
                    && matches!(
                        c.kind,
                        SymKind::Var | SymKind::Fn | SymKind::Argument | SymKind::Label | SymKind::Enum
                    )
                {
                    return Some(child);
                }
            }
            at = self.syms[id].parent;
        }
        None
    }

    /// The symbol whose unique scope id matches, searching the subtree.
    pub fn find_from_scope(&self, root: SymId, scope: i32) -> Option<SymId> {
        if self.syms[root].scope == scope {
            return Some(root);
        }
        for &child in &self.syms[root].children {
            if let Some(found) = self.find_from_scope(child, scope) {
                return Some(found);
            }
        }
        None
    }

    /// Enclosing-loop continue target. The walk crosses eval-child module
    /// roots (their code runs inside the parent's loops) but never a
    /// function boundary.
    pub fn loop_next(&self, from: SymId) -> i64 {
        let mut at = Some(from);
        while let Some(id) = at {
            let s = &self.syms[id];
            if s.next >= 0 {
                return s.next;
            }
            if s.kind == SymKind::Fn || (s.kind == SymKind::Module && s.parent.is_none()) {
                break;
            }
            at = s.parent;
        }
        -1
    }

    /// Enclosing-loop break target; same walk as [`loop_next`].
    pub fn loop_last(&self, from: SymId) -> i64 {
        let mut at = Some(from);
        while let Some(id) = at {
            let s = &self.syms[id];
            if s.last >= 0 {
                return s.last;
            }
            if s.kind == SymKind::Fn || (s.kind == SymKind::Module && s.parent.is_none()) {
                break;
            }
            at = s.parent;
        }
        -1
    }

    /// The frame (function or module root) a scope belongs to.
    pub fn frame_of(&self, from: SymId) -> SymId {
        let mut id = from;
        loop {
            if matches!(self.syms[id].kind, SymKind::Fn | SymKind::Module) {
                return id;
            }
            match self.syms[id].parent {
                Some(p) => id = p,
                None => return id,
            }
        }
    }

    /// Count the implicit-variable scopes crossed when jumping from `from`
    /// out to (but not through) `to`.
    pub fn count_imp(&self, from: SymId, to: SymId) -> usize {
        let mut n = 0;
        let mut at = Some(from);
        while let Some(id) = at {
            if id == to {
                break;
            }
            if self.syms[id].imp {
                n += 1;
            }
            at = self.syms[id].parent;
        }
        n
    }

    pub fn print(&self, out: &mut dyn std::io::Write, root: SymId, depth: usize) {
        let s = &self.syms[root];
        let _ = writeln!(
            out,
            "{:indent$}{:?} `{}' (scope {}, {} vars, {} args{})",
            "",
            s.kind,
            s.name,
            s.scope,
            s.num_variables,
            s.num_arguments,
            if s.global { ", global" } else { "" },
            indent = depth * 2
        );
        for &child in &s.children {
            self.print(out, child, depth + 1);
        }
    }
}

/// Walks an AST, building the symbol tree and assigning scope ids to
/// statements.
pub struct Symbolizer<'t, 'r> {
    pub tab: &'t mut SymbolTable,
    r: &'r mut Reporter,
    module: usize,
}

impl<'t, 'r> Symbolizer<'t, 'r> {
    pub fn new(tab: &'t mut SymbolTable, r: &'r mut Reporter, module: usize) -> Self {
        Symbolizer { tab, r, module }
    }

    /// Symbolize a root module (or an eval child when `parent` names the
    /// lexical scope the eval occurred in). Returns the module's root
    /// symbol.
    pub fn run(&mut self, program: &mut Program, name: &str, parent: Option<SymId>) -> SymId {
        let scope = self.tab.fresh_scope();
        let mut sym = Symbol::new(name, SymKind::Module, scope, self.module);
        if let Some(p) = parent {
            sym.fp = self.tab.syms[p].fp;
        }
        let root = self.tab.push(sym, parent);

        for stmt in &mut program.stmts {
            self.stmt(stmt, root);
        }
        root
    }

    fn frame(&self, at: SymId) -> SymId {
        self.tab.frame_of(at)
    }

    fn declare_var(&mut self, name: &str, loc: &Loc, at: SymId) -> SymId {
        let frame = self.frame(at);
        let global =
            self.tab.syms[frame].kind == SymKind::Module && self.tab.syms[frame].parent.is_none();
        let scope = self.tab.syms[at].scope;

        let already = self.tab.syms[at]
            .children
            .iter()
            .any(|&c| self.tab.syms[c].name == name && self.tab.syms[c].kind == SymKind::Var);
        if already {
            self.r.push(
                loc.clone(),
                Severity::Warning,
                format!("redeclaration of variable `{}'", name),
            );
        }

        self.tab.syms[frame].num_variables += 1;
        let mut sym = Symbol::new(name, SymKind::Var, scope, self.module);
        sym.global = global;
        sym.fp = self.tab.syms[at].fp;
        self.tab.push(sym, Some(at))
    }

    fn new_block(&mut self, at: SymId, kind: SymKind, name: &str) -> SymId {
        let scope = self.tab.fresh_scope();
        let mut sym = Symbol::new(name, kind, scope, self.module);
        sym.fp = self.tab.syms[at].fp + usize::from(kind == SymKind::Fn);
        self.tab.push(sym, Some(at))
    }

    fn stmt(&mut self, stmt: &mut Stmt, at: SymId) {
        stmt.scope = self.tab.syms[at].scope;
        if let Some(when) = &mut stmt.when {
            self.expr(when, at);
        }

        match &mut stmt.kind {
            StmtKind::Expr(e) | StmtKind::Die(e) => self.expr(e, at),

            StmtKind::VarDecl { names, init } => {
                for e in init.iter_mut() {
                    self.expr(e, at);
                }
                for name in names.iter() {
                    self.declare_var(name, &stmt.loc, at);
                }
            }

            StmtKind::FnDef { name, params, defaults, body } => {
                // The function symbol is itself the body scope: arguments
                // and body variables hang off it, and resolving the name
                // from outside finds the callable.
                let scope = self.tab.fresh_scope();
                let mut fn_sym = Symbol::new(name.clone(), SymKind::Fn, scope, self.module);
                fn_sym.num_arguments = params.len();
                fn_sym.fp = self.tab.syms[at].fp + 1;
                let fn_id = self.tab.push(fn_sym, Some(at));

                for param in params.iter() {
                    self.tab.syms[fn_id].num_variables += 1;
                    let mut arg = Symbol::new(param.clone(), SymKind::Argument, scope, self.module);
                    arg.fp = self.tab.syms[fn_id].fp;
                    self.tab.push(arg, Some(fn_id));
                }
                for d in defaults.iter_mut().flatten() {
                    self.expr(d, fn_id);
                }
                self.stmt(body, fn_id);
                // The statement resolves through the body scope.
                stmt.scope = scope;
            }

            StmtKind::If { cond, then, otherwise } => {
                self.expr(cond, at);
                self.stmt(then, at);
                if let Some(o) = otherwise {
                    self.stmt(o, at);
                }
            }

            StmtKind::While { cond, body } => {
                let scope = self.new_block(at, SymKind::Block, "while");
                stmt.scope = self.tab.syms[scope].scope;
                self.expr(cond, scope);
                self.stmt(body, scope);
            }

            StmtKind::Do { body, cond } => {
                let scope = self.new_block(at, SymKind::Block, "do");
                stmt.scope = self.tab.syms[scope].scope;
                self.stmt(body, scope);
                self.expr(cond, scope);
            }

            StmtKind::For { init, cond, step, body } => {
                let scope = self.new_block(at, SymKind::Block, "for");
                // Iteration without a loop variable binds `_`.
                if cond.is_none() && step.is_none() {
                    self.tab.syms[scope].imp = true;
                }
                // Iteration forms claim up to three hidden registers
                // (iterator index, iterable, regex) from the frame.
                let frame = self.frame(at);
                self.tab.syms[frame].num_variables += 3;
                stmt.scope = self.tab.syms[scope].scope;
                if let Some(i) = init {
                    self.stmt(i, scope);
                }
                if let Some(c) = cond {
                    self.expr(c, scope);
                }
                if let Some(s) = step {
                    self.expr(s, scope);
                }
                self.stmt(body, scope);
            }

            StmtKind::Block(stmts) => {
                let scope = self.new_block(at, SymKind::Block, "block");
                stmt.scope = self.tab.syms[scope].scope;
                for s in stmts {
                    self.stmt(s, scope);
                }
            }

            StmtKind::Print(args) | StmtKind::Println(args) => {
                for e in args {
                    self.expr(e, at);
                }
            }

            StmtKind::Return(e) => {
                if let Some(e) = e {
                    self.expr(e, at);
                }
            }

            StmtKind::Label(name) => {
                let frame = self.frame(at);
                let scope = self.tab.syms[at].scope;
                let mut sym = Symbol::new(name.clone(), SymKind::Label, scope, self.module);
                sym.global = self.tab.syms[frame].kind == SymKind::Module;
                sym.fp = self.tab.syms[at].fp;
                self.tab.push(sym, Some(at));
            }

            StmtKind::Enum { names, .. } => {
                let scope = self.tab.syms[at].scope;
                for name in names.iter() {
                    let mut sym = Symbol::new(name.clone(), SymKind::Enum, scope, self.module);
                    sym.fp = self.tab.syms[at].fp;
                    self.tab.push(sym, Some(at));
                }
            }

            StmtKind::Last | StmtKind::Next | StmtKind::Goto(_) | StmtKind::Null => {}
        }
    }

    fn expr(&mut self, expr: &mut Expr, at: SymId) {
        match &mut expr.kind {
            ExprKind::Unary(_, a)
            | ExprKind::PreInc(a)
            | ExprKind::PreDec(a)
            | ExprKind::PostInc(a)
            | ExprKind::PostDec(a)
            | ExprKind::Member(a, _)
            | ExprKind::Eval(a) => self.expr(a, at),

            ExprKind::Binary(_, a, b)
            | ExprKind::Assign(a, b)
            | ExprKind::OpAssign(_, a, b)
            | ExprKind::Squiggle(a, b)
            | ExprKind::Subscript(a, b) => {
                self.expr(a, at);
                self.expr(b, at);
            }

            ExprKind::Ternary(a, b, c) => {
                self.expr(a, at);
                self.expr(b, at);
                self.expr(c, at);
            }

            ExprKind::Slice { base, start, stop, step } => {
                self.expr(base, at);
                for e in [start, stop, step].into_iter().flatten() {
                    self.expr(e, at);
                }
            }

            ExprKind::Call(f, args) => {
                self.expr(f, at);
                for a in args {
                    self.expr(a, at);
                }
            }

            ExprKind::BuiltinCall(_, args) | ExprKind::List(args) => {
                for a in args {
                    self.expr(a, at);
                }
            }

            ExprKind::Table(pairs) => {
                for (_, v) in pairs {
                    self.expr(v, at);
                }
            }

            ExprKind::Comprehension { value, var, iter } => {
                self.expr(iter, at);
                if let Some(name) = var {
                    if self.tab.resolve(at, name).is_none() {
                        self.declare_var(&name.clone(), &expr.loc, at);
                    }
                }
                self.expr(value, at);
            }

            ExprKind::Match { subject, arms } => {
                self.expr(subject, at);
                for (pat, body) in arms {
                    self.expr(pat, at);
                    match body {
                        MatchBody::Expr(e) => self.expr(e, at),
                        MatchBody::Block(stmts) => {
                            let scope = self.new_block(at, SymKind::Block, "match");
                            self.tab.syms[scope].imp = true;
                            for s in stmts {
                                self.stmt(s, scope);
                            }
                        }
                    }
                }
            }

            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Bool(_)
            | ExprKind::Str { .. }
            | ExprKind::Nil
            | ExprKind::Regex { .. }
            | ExprKind::Group(_)
            | ExprKind::Ident(_)
            | ExprKind::Imp
            | ExprKind::Varargs => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use std::rc::Rc;

    fn symbolize(src: &str) -> (SymbolTable, Program, SymId) {
        let mut r = Reporter::new();
        let tokens = Lexer::new(Rc::from(src), Rc::from("test"), &mut r).tokenize();
        let mut program = Parser::new(tokens, &mut r).parse().unwrap();
        let mut tab = SymbolTable::new();
        let root = Symbolizer::new(&mut tab, &mut r, 0).run(&mut program, "test", None);
        assert!(!r.fatal, "symbolize failed: {:?}", r.diags);
        (tab, program, root)
    }

    #[test]
    fn test_module_vars_are_global() {
        let (tab, _, root) = symbolize("var x = 1;");
        let x = tab.resolve(root, "x").unwrap();
        assert!(tab.syms[x].global);
        assert_eq!(tab.syms[root].num_variables, 1);
    }

    #[test]
    fn test_fn_scope_resolution() {
        let (tab, program, root) = symbolize("var g = 1; fn f(a) { var l = a + g; }");
        // The fn body scope resolves a, l, and g.
        let body_scope = program.stmts[1].scope;
        let inner = tab.find_from_scope(root, body_scope).unwrap();
        assert!(tab.resolve(inner, "a").is_some());
        assert!(tab.resolve(inner, "g").is_some());
        let a = tab.resolve(inner, "a").unwrap();
        assert_eq!(tab.syms[a].kind, SymKind::Argument);
        assert!(!tab.syms[tab.resolve(inner, "l").unwrap()].global);
    }

    #[test]
    fn test_fn_vars_counted_on_fn_frame() {
        let (tab, program, root) = symbolize("fn f(a, b) { var c = 0; }");
        let inner = tab.find_from_scope(root, program.stmts[0].scope).unwrap();
        let frame = tab.frame_of(inner);
        assert_eq!(tab.syms[frame].kind, SymKind::Fn);
        assert_eq!(tab.syms[frame].num_variables, 3);
        assert_eq!(tab.syms[root].num_variables, 0);
    }

    #[test]
    fn test_loop_gets_own_scope() {
        let (tab, program, root) = symbolize("for var x = [1]: print x;");
        let scope = program.stmts[0].scope;
        assert_ne!(scope, tab.syms[root].scope);
        let loop_sym = tab.find_from_scope(root, scope).unwrap();
        assert!(tab.resolve(loop_sym, "x").is_some());
        assert!(tab.resolve(root, "x").is_none());
    }

    #[test]
    fn test_implicit_loop_marks_imp() {
        let (tab, program, root) = symbolize("for [1, 2]: print _;");
        let loop_sym = tab.find_from_scope(root, program.stmts[0].scope).unwrap();
        assert!(tab.syms[loop_sym].imp);
    }

    #[test]
    fn test_scope_ids_are_unique() {
        let (tab, _, _) = symbolize("{ var a = 1; } { var b = 2; }");
        let mut scopes: Vec<i32> = tab.syms.iter().map(|s| s.scope).collect();
        scopes.sort_unstable();
        let before = scopes.len();
        scopes.dedup();
        // Variables share their block's scope id; blocks are distinct.
        assert!(scopes.len() >= 3);
        assert!(before >= scopes.len());
    }

    #[test]
    fn test_find_from_scope() {
        let (tab, program, root) = symbolize("{ var a = 1; }");
        let id = tab.find_from_scope(root, program.stmts[0].scope).unwrap();
        assert_eq!(tab.syms[id].scope, program.stmts[0].scope);
    }
}
