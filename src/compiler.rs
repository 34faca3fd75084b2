//! Bytecode compiler for Alder
//!
//! Lowers a resolved AST to register bytecode. Each frame's local variables
//! claim the low registers; temporaries grow above them through a high-water
//! allocator that resets to the frame base between statements. Function
//! addresses are written back into their symbols, and loop continue/break
//! addresses are recorded on loop scopes so eval-compiled `last`/`next` can
//! escape to them.

use crate::ast::{BinOp, Builtin, Expr, ExprKind, MatchBody, Program, Stmt, StmtKind, UnOp};
use crate::bytecode::{ConstantTable, Instr, Op};
use crate::error::{Loc, Reporter, Severity};
use crate::heap::{Array, Heap, Table};
use crate::regex::Regex;
use crate::symbol::{SymId, SymKind, SymbolTable};
use crate::value::{self, Value};
use crate::vm::NUM_REG;

type CResult<T> = Result<T, ()>;

pub struct Compiler<'a> {
    code: Vec<Instr>,
    pub tab: &'a mut SymbolTable,
    pub ct: &'a mut ConstantTable,
    pub heap: &'a mut Heap,
    pub r: &'a mut Reporter,

    module: usize,
    root: SymId,
    eval: bool,

    // Per-frame register bookkeeping. Index 0 is the module body.
    stack_top: Vec<u16>,
    stack_base: Vec<u16>,
    var: Vec<u16>,
    sp: usize,
    in_expr: bool,

    // Back-patch lists for the innermost loop being compiled.
    last_patches: Vec<usize>,
    next_patches: Vec<usize>,
    cur_loop: Option<SymId>,
}

/// Compile a module body. `stack_base` places the first local register for
/// eval children so their temporaries do not collide with the caller's.
#[allow(clippy::too_many_arguments)]
pub fn compile(
    program: &Program,
    tab: &mut SymbolTable,
    ct: &mut ConstantTable,
    heap: &mut Heap,
    r: &mut Reporter,
    module: usize,
    root: SymId,
    eval: bool,
    stack_base: Option<u16>,
) -> Option<Vec<Instr>> {
    tracing::debug!(target: "alder::compiler", module, eval, ?stack_base, "compile module");

    let mut c = Compiler {
        code: Vec::new(),
        tab,
        ct,
        heap,
        r,
        module,
        root,
        eval,
        stack_top: Vec::new(),
        stack_base: Vec::new(),
        var: Vec::new(),
        sp: 0,
        in_expr: false,
        last_patches: Vec::new(),
        next_patches: Vec::new(),
        cur_loop: None,
    };

    c.push_frame(root);
    if let Some(base) = stack_base {
        let vars = c.tab.syms[root].num_variables as u16;
        c.var[0] = base;
        c.stack_base[0] = base + vars;
        c.stack_top[0] = base + vars;
    }

    let result = c.compile_program(program);

    if result.is_err() || c.r.fatal {
        tracing::debug!(target: "alder::compiler", module, "compile failed");
        return None;
    }
    tracing::debug!(
        target: "alder::compiler",
        module,
        instrs = c.code.len(),
        constants = c.ct.vals.len(),
        "compile finished"
    );
    Some(c.code)
}

impl<'a> Compiler<'a> {
    fn compile_program(&mut self, program: &Program) -> CResult<()> {
        let n = program.stmts.len();
        for (i, stmt) in program.stmts.iter().enumerate() {
            // A trailing expression becomes the module result.
            if i == n - 1 {
                if let StmtKind::Expr(e) = &stmt.kind {
                    if stmt.when.is_none() {
                        let sym = self.scope_sym(stmt)?;
                        let reg = self.compile_expr_stmt(e, sym)?;
                        self.emit(Op::End(reg), stmt.loc.clone());
                        return self.finish(&stmt.loc);
                    }
                }
            }
            self.compile_stmt(stmt)?;
        }

        let loc = program
            .stmts
            .last()
            .map(|s| s.loc.clone())
            .unwrap_or_else(|| Loc::new("".into(), "".into(), 0, 1));
        let reg = self.nil(&loc)?;
        self.emit(Op::End(reg), loc.clone());
        self.finish(&loc)
    }

    fn finish(&mut self, loc: &Loc) -> CResult<()> {
        if !self.next_patches.is_empty() {
            self.r.push(
                loc.clone(),
                Severity::Fatal,
                "'next' keyword must occur inside of a loop body",
            );
        }
        if !self.last_patches.is_empty() {
            self.r.push(
                loc.clone(),
                Severity::Fatal,
                "'last' keyword must occur inside of a loop body",
            );
        }
        Ok(())
    }

    // ===== plumbing =====

    fn emit(&mut self, op: Op, loc: Loc) -> usize {
        self.code.push(Instr { op, loc });
        self.code.len() - 1
    }

    fn ip(&self) -> usize {
        self.code.len()
    }

    fn patch_jmp(&mut self, at: usize, target: usize) {
        tracing::trace!(target: "alder::compiler", at, jump_to = target, "patch");
        match &mut self.code[at].op {
            Op::Jmp(d) => *d = target as u32,
            op => unreachable!("patching a non-jump {:?}", op),
        }
    }

    fn push_frame(&mut self, frame_sym: SymId) {
        let vars = self.tab.syms[frame_sym].num_variables as u16;
        self.var.push(0);
        self.stack_top.push(vars);
        self.stack_base.push(vars);
        self.sp = self.var.len() - 1;
    }

    fn pop_frame(&mut self) {
        self.var.pop();
        self.stack_top.pop();
        self.stack_base.pop();
        self.sp = self.var.len() - 1;
    }

    fn alloc_reg(&mut self, loc: &Loc) -> CResult<u16> {
        let top = self.stack_top[self.sp];
        if top as usize >= NUM_REG || top as usize >= 1 << 15 {
            self.r.push(
                loc.clone(),
                Severity::Fatal,
                "insufficient registers to compile module or function",
            );
            return Err(());
        }
        self.stack_top[self.sp] += 1;
        Ok(top)
    }

    fn alloc_var(&mut self) -> u16 {
        let v = self.var[self.sp];
        self.var[self.sp] += 1;
        v
    }

    fn set_stack_top(&mut self) {
        if !self.in_expr {
            self.stack_top[self.sp] = self.stack_base[self.sp];
        }
    }

    /// Statement-level expression entry: temporaries restart at the frame
    /// base between statements.
    fn compile_expr_stmt(&mut self, e: &Expr, sym: SymId) -> CResult<u16> {
        self.set_stack_top();
        let saved = self.in_expr;
        self.in_expr = true;
        let reg = self.compile_expression(e, sym);
        self.in_expr = saved;
        reg
    }

    fn scope_sym(&mut self, stmt: &Stmt) -> CResult<SymId> {
        match self.tab.find_from_scope(self.root, stmt.scope) {
            Some(id) => Ok(id),
            None => {
                self.r.push(stmt.loc.clone(), Severity::Fatal, "statement has no resolved scope");
                Err(())
            }
        }
    }

    fn error<T>(&mut self, loc: &Loc, msg: impl Into<String>) -> CResult<T> {
        self.r.push(loc.clone(), Severity::Fatal, msg);
        Err(())
    }

    fn add_const(&mut self, v: Value) -> u16 {
        self.ct.add(v) as u16
    }

    fn nil(&mut self, loc: &Loc) -> CResult<u16> {
        let reg = self.alloc_reg(loc)?;
        let k = self.add_const(Value::Nil);
        self.emit(Op::Copyc(reg, k), loc.clone());
        Ok(reg)
    }

    fn getimp(&mut self, loc: &Loc) -> CResult<u16> {
        let reg = self.alloc_reg(loc)?;
        self.emit(Op::Getimp(reg), loc.clone());
        Ok(reg)
    }

    /// Build the constant value for a regex literal, compiling the pattern
    /// now so syntax errors land at compile time with a position into the
    /// pattern.
    fn regex_const(
        &mut self,
        pattern: &str,
        flags: &str,
        extra: &str,
        loc: &Loc,
    ) -> CResult<Value> {
        let mut all = flags.to_string();
        for f in extra.chars() {
            if !all.contains(f) {
                all.push(f);
            }
        }
        match Regex::compile_with_flags(pattern, &all) {
            Ok(re) => {
                let evals = flags.chars().filter(|&c| c == 'e').count() as u16;
                let slot = self.heap.alloc_regex(re);
                Ok(Value::Regex { slot, evals })
            }
            Err(e) => {
                let mut at = loc.clone();
                at.index += 1 + e.pos.min(pattern.len());
                at.len = 1;
                self.r.push(at, Severity::Fatal, format!("regex failed to compile: {}", e));
                Err(())
            }
        }
    }

    // ===== constant folding =====

    fn is_constant_expr(&self, e: &Expr, sym: SymId) -> bool {
        match &e.kind {
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Bool(_)
            | ExprKind::Nil => true,
            ExprKind::Str { interp, .. } => !interp,
            ExprKind::Ident(name) => self
                .tab
                .resolve(sym, name)
                .map(|id| self.tab.syms[id].kind == SymKind::Enum)
                .unwrap_or(false),
            ExprKind::Unary(_, a) => self.is_constant_expr(a, sym),
            ExprKind::Binary(_, a, b) => {
                self.is_constant_expr(a, sym) && self.is_constant_expr(b, sym)
            }
            ExprKind::Ternary(a, b, c) => {
                self.is_constant_expr(a, sym)
                    && self.is_constant_expr(b, sym)
                    && self.is_constant_expr(c, sym)
            }
            ExprKind::List(items) => items.iter().all(|i| self.is_constant_expr(i, sym)),
            ExprKind::Table(pairs) => pairs.iter().all(|(_, v)| self.is_constant_expr(v, sym)),
            ExprKind::Slice { base, start, stop, step } => {
                self.is_constant_expr(base, sym)
                    && [start, stop, step]
                        .iter()
                        .all(|o| o.as_ref().map(|e| self.is_constant_expr(e, sym)).unwrap_or(true))
            }
            _ => false,
        }
    }

    fn fold_constant(&mut self, e: &Expr, sym: SymId) -> CResult<Value> {
        let v = match &e.kind {
            ExprKind::Int(n) => Value::Int(*n),
            ExprKind::Float(f) => Value::Float(*f),
            ExprKind::Bool(b) => Value::Bool(*b),
            ExprKind::Nil => Value::Nil,
            ExprKind::Str { value, .. } => Value::Str(self.heap.alloc_str(value.clone())),
            ExprKind::Ident(name) => {
                let id = self.tab.resolve(sym, name).ok_or(())?;
                Value::Int(self.tab.syms[id].enum_val)
            }
            ExprKind::Unary(op, a) => {
                let a = self.fold_constant(a, sym)?;
                match op {
                    UnOp::Neg => value::neg_value(self.heap, a),
                    UnOp::Not => value::flip_value(self.heap, a),
                }
            }
            ExprKind::Binary(op, a, b) => {
                let a = self.fold_constant(a, sym)?;
                let b = self.fold_constant(b, sym)?;
                self.fold_binop(*op, a, b)
            }
            ExprKind::Ternary(a, b, c) => {
                let cond = self.fold_constant(a, sym)?;
                if value::is_truthy(self.heap, cond) {
                    self.fold_constant(b, sym)?
                } else {
                    self.fold_constant(c, sym)?
                }
            }
            ExprKind::List(items) => {
                let mut a = Array::new();
                for item in items {
                    let v = self.fold_constant(item, sym)?;
                    a.push(v);
                }
                Value::Array(self.heap.alloc_array(a))
            }
            ExprKind::Table(pairs) => {
                let mut t = Table::new();
                for (k, ve) in pairs {
                    let v = self.fold_constant(ve, sym)?;
                    t.add(k, v);
                }
                Value::Table(self.heap.alloc_table(t))
            }
            ExprKind::Slice { base, start, stop, step } => {
                let b = self.fold_constant(base, sym)?;
                let start = match start {
                    Some(e) => self.fold_constant(e, sym)?,
                    None => Value::Nil,
                };
                let stop = match stop {
                    Some(e) => self.fold_constant(e, sym)?,
                    None => Value::Nil,
                };
                let step = match step {
                    Some(e) => self.fold_constant(e, sym)?,
                    None => Value::Int(1),
                };
                crate::vm::slice_value(self.heap, b, start, stop, step)
            }
            _ => return Err(()),
        };

        if let Value::Err(slot) = v {
            let msg = self.heap.strs[slot].clone();
            return self.error(&e.loc, msg);
        }
        Ok(v)
    }

    fn fold_binop(&mut self, op: BinOp, a: Value, b: Value) -> Value {
        match op {
            BinOp::Add => value::add_values(self.heap, a, b),
            BinOp::Sub => value::sub_values(self.heap, a, b),
            BinOp::Mul => value::mul_values(self.heap, a, b),
            BinOp::Div => value::div_values(self.heap, a, b),
            BinOp::Mod => value::mod_values(self.heap, a, b),
            BinOp::Pow => value::pow_values(self.heap, a, b),
            BinOp::Shl => value::sleft_values(self.heap, a, b),
            BinOp::Shr => value::sright_values(self.heap, a, b),
            BinOp::BitAnd => value::band_values(self.heap, a, b),
            BinOp::BitOr => value::bor_values(self.heap, a, b),
            BinOp::BitXor => value::bxor_values(self.heap, a, b),
            BinOp::Less => value::less_values(self.heap, a, b),
            BinOp::More => value::more_values(self.heap, a, b),
            BinOp::Leq => value::leq_values(self.heap, a, b),
            BinOp::Geq => value::geq_values(self.heap, a, b),
            BinOp::EqEq => value::cmp_values(self.heap, a, b),
            BinOp::NotEq => {
                let eq = value::cmp_values(self.heap, a, b);
                value::flip_value(self.heap, eq)
            }
            BinOp::And => {
                let t = value::is_truthy(self.heap, a) && value::is_truthy(self.heap, b);
                Value::Bool(t)
            }
            BinOp::Or => {
                let t = value::is_truthy(self.heap, a) || value::is_truthy(self.heap, b);
                Value::Bool(t)
            }
            BinOp::Range => value::range_value(self.heap, a, b, Value::Int(1)),
        }
    }

    // ===== lvalues =====

    fn compile_lvalue(&mut self, e: &Expr, sym: SymId) -> CResult<u16> {
        match &e.kind {
            ExprKind::Ident(name) => {
                let id = match self.tab.resolve(sym, name) {
                    Some(id) => id,
                    None => return self.error(&e.loc, format!("undeclared identifier `{}'", name)),
                };
                let s = &self.tab.syms[id];
                if !matches!(s.kind, SymKind::Var | SymKind::Argument) {
                    return self.error(&e.loc, "invalid use of identifier in lvalue");
                }
                Ok(s.address as u16)
            }
            ExprKind::Subscript(base, idx) => {
                let reg = self.alloc_reg(&e.loc)?;
                let l = self.compile_lvalue(base, sym)?;
                let i = self.compile_expression(idx, sym)?;
                self.emit(Op::Deref(reg, l, i), e.loc.clone());
                Ok(reg)
            }
            ExprKind::Member(base, key) => {
                let k = self.heap.alloc_str(key.clone());
                let kc = self.add_const(Value::Str(k));
                let keyreg = self.alloc_reg(&e.loc)?;
                self.emit(Op::Copyc(keyreg, kc), e.loc.clone());
                let reg = self.alloc_reg(&e.loc)?;
                let l = self.compile_lvalue(base, sym)?;
                self.emit(Op::Deref(reg, l, keyreg), e.loc.clone());
                Ok(reg)
            }
            _ => self.error(&e.loc, "expected an lvalue"),
        }
    }

    /// Store `rhs` through an assignable expression; returns the register
    /// holding the stored value.
    fn write_variable(&mut self, e: &Expr, sym: SymId, rhs: u16) -> CResult<u16> {
        let r = self.alloc_reg(&e.loc)?;
        self.emit(Op::Copy(r, rhs), e.loc.clone());

        match &e.kind {
            ExprKind::Subscript(base, idx) => {
                let l = self.compile_lvalue(base, sym)?;
                let i = self.compile_expression(idx, sym)?;
                self.emit(Op::Aset(l, i, r), e.loc.clone());
            }
            ExprKind::Member(base, key) => {
                let k = self.heap.alloc_str(key.clone());
                let kc = self.add_const(Value::Str(k));
                let keyreg = self.alloc_reg(&e.loc)?;
                self.emit(Op::Copyc(keyreg, kc), e.loc.clone());
                let l = self.compile_lvalue(base, sym)?;
                self.emit(Op::Aset(l, keyreg, r), e.loc.clone());
            }
            _ => {
                let addr = self.compile_lvalue(e, sym)?;
                self.emit(Op::Mov(addr, r), e.loc.clone());
            }
        }
        Ok(r)
    }

    // ===== expressions =====

    fn compile_expression(&mut self, e: &Expr, sym: SymId) -> CResult<u16> {
        if self.is_constant_expr(e, sym) {
            let v = self.fold_constant(e, sym)?;
            let k = self.add_const(v);
            let reg = self.alloc_reg(&e.loc)?;
            self.emit(Op::Copyc(reg, k), e.loc.clone());
            return Ok(reg);
        }

        let loc = e.loc.clone();
        match &e.kind {
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Bool(_)
            | ExprKind::Nil => unreachable!("constants are folded"),

            ExprKind::Str { value, interp } => {
                debug_assert!(*interp);
                let slot = self.heap.alloc_str(value.clone());
                let k = self.add_const(Value::Str(slot));
                let reg = self.alloc_reg(&loc)?;
                let scope = self.tab.syms[sym].scope as u16;
                self.emit(Op::Interp(reg, k, scope), loc);
                Ok(reg)
            }

            ExprKind::Regex { pattern, subst: _, flags } => {
                // A bare regex matches against the implicit variable.
                let v = self.regex_const(pattern, flags, "", &loc)?;
                let k = self.add_const(v);
                let re = self.alloc_reg(&loc)?;
                self.emit(Op::Copyc(re, k), loc.clone());
                let subj = self.getimp(&loc)?;
                let reg = self.alloc_reg(&loc)?;
                self.emit(Op::Match(reg, subj, re), loc);
                Ok(reg)
            }

            ExprKind::Group(n) => {
                let k = self.add_const(Value::Int(*n));
                let temp = self.alloc_reg(&loc)?;
                self.emit(Op::Copyc(temp, k), loc.clone());
                let reg = self.alloc_reg(&loc)?;
                self.emit(Op::Group(reg, temp), loc);
                Ok(reg)
            }

            ExprKind::Imp => self.getimp(&loc),

            ExprKind::Varargs => {
                let reg = self.alloc_reg(&loc)?;
                self.emit(Op::Popall(reg), loc);
                Ok(reg)
            }

            ExprKind::Ident(name) => {
                let id = match self.tab.resolve(sym, name) {
                    Some(id) => id,
                    None => {
                        return self.error(&loc, format!("undeclared identifier `{}'", name))
                    }
                };
                let reg = self.alloc_reg(&loc)?;
                match self.tab.syms[id].kind {
                    SymKind::Enum => {
                        let k = self.add_const(Value::Int(self.tab.syms[id].enum_val));
                        self.emit(Op::Copyc(reg, k), loc);
                    }
                    SymKind::Fn => {
                        let s = &self.tab.syms[id];
                        let name_slot = self.heap.alloc_str(s.name.clone());
                        let v = Value::Fn {
                            entry: self.tab.syms[id].address as u32,
                            module: self.module as u16,
                            num_args: self.tab.syms[id].num_arguments as u16,
                            name: Some(name_slot),
                        };
                        let k = self.add_const(v);
                        self.emit(Op::Copyc(reg, k), loc);
                    }
                    SymKind::Var | SymKind::Argument => {
                        let addr = self.tab.syms[id].address as u16;
                        self.emit(Op::Mov(reg, addr), loc);
                    }
                    _ => return self.error(&loc, "invalid use of identifier in expression"),
                }
                Ok(reg)
            }

            ExprKind::Unary(op, a) => {
                let reg = self.alloc_reg(&loc)?;
                let operand = self.compile_expression(a, sym)?;
                match op {
                    UnOp::Neg => self.emit(Op::Neg(reg, operand), loc),
                    UnOp::Not => self.emit(Op::Flip(reg, operand), loc),
                };
                Ok(reg)
            }

            ExprKind::PreInc(a) => {
                let reg = self.compile_expression(a, sym)?;
                self.emit(Op::Inc(reg), loc);
                self.write_variable(a, sym, reg)?;
                Ok(reg)
            }
            ExprKind::PreDec(a) => {
                let reg = self.compile_expression(a, sym)?;
                self.emit(Op::Dec(reg), loc);
                self.write_variable(a, sym, reg)?;
                Ok(reg)
            }
            ExprKind::PostInc(a) => {
                let reg = self.compile_expression(a, sym)?;
                let t = self.alloc_reg(&loc)?;
                self.emit(Op::Copy(t, reg), loc.clone());
                self.emit(Op::Inc(t), loc);
                self.write_variable(a, sym, t)?;
                Ok(reg)
            }
            ExprKind::PostDec(a) => {
                let reg = self.compile_expression(a, sym)?;
                let t = self.alloc_reg(&loc)?;
                self.emit(Op::Copy(t, reg), loc.clone());
                self.emit(Op::Dec(t), loc);
                self.write_variable(a, sym, t)?;
                Ok(reg)
            }

            ExprKind::Binary(op, a, b) => self.compile_binary(*op, a, b, sym, &loc),

            ExprKind::Ternary(a, b, c) => {
                let reg = self.alloc_reg(&loc)?;
                let cond = self.compile_expression(a, sym)?;
                self.emit(Op::Cond(cond), loc.clone());
                let ja = self.emit(Op::Jmp(0), loc.clone());
                let t = self.compile_expression(b, sym)?;
                self.emit(Op::Mov(reg, t), loc.clone());
                let jb = self.emit(Op::Jmp(0), loc.clone());
                let here = self.ip();
                self.patch_jmp(ja, here);
                let f = self.compile_expression(c, sym)?;
                self.emit(Op::Mov(reg, f), loc);
                let here = self.ip();
                self.patch_jmp(jb, here);
                Ok(reg)
            }

            ExprKind::Assign(lhs, rhs) => {
                let reg = self.compile_expression(rhs, sym)?;
                self.write_variable(lhs, sym, reg)?;
                Ok(reg)
            }

            ExprKind::OpAssign(op, lhs, rhs) => {
                let reg = self.alloc_reg(&loc)?;
                let a = self.compile_expression(lhs, sym)?;
                let b = self.compile_expression(rhs, sym)?;
                let binop = self.arith_op(*op, reg, a, b, &loc)?;
                self.emit(binop, loc.clone());
                self.write_variable(lhs, sym, reg)?;
                Ok(reg)
            }

            ExprKind::Squiggle(lhs, rhs) => {
                let (pattern, subst, flags) = match &rhs.kind {
                    ExprKind::Regex { pattern, subst, flags } => (pattern, subst, flags),
                    _ => return self.error(&loc, "operator requires regex righthand argument"),
                };

                if let Some(replacement) = subst {
                    let temp = self.alloc_reg(&loc)?;
                    let operand = self.compile_expression(lhs, sym)?;
                    self.emit(Op::Copy(temp, operand), loc.clone());

                    let v = self.regex_const(pattern, flags, "", &loc)?;
                    let rk = self.add_const(v);
                    let re = self.alloc_reg(&loc)?;
                    self.emit(Op::Copyc(re, rk), loc.clone());

                    let slot = self.heap.alloc_str(replacement.clone());
                    let sk = self.add_const(Value::Str(slot));
                    let sreg = self.alloc_reg(&loc)?;
                    self.emit(Op::Copyc(sreg, sk), loc.clone());

                    let scope = self.tab.syms[sym].scope as u16;
                    self.emit(Op::Subst(temp, re, sreg, scope), loc.clone());
                    self.write_variable(lhs, sym, temp)?;
                    Ok(temp)
                } else {
                    let v = self.regex_const(pattern, flags, "", &loc)?;
                    let rk = self.add_const(v);
                    let re = self.alloc_reg(&loc)?;
                    let reg = self.alloc_reg(&loc)?;
                    self.emit(Op::Copyc(re, rk), loc.clone());
                    let operand = self.compile_expression(lhs, sym)?;
                    self.emit(Op::Match(reg, operand, re), loc);
                    Ok(reg)
                }
            }

            ExprKind::Member(base, key) => {
                let reg = self.alloc_reg(&loc)?;
                let k = self.heap.alloc_str(key.clone());
                let kc = self.add_const(Value::Str(k));
                let keyreg = self.alloc_reg(&loc)?;
                self.emit(Op::Movc(keyreg, kc), loc.clone());
                let b = self.compile_expression(base, sym)?;
                self.emit(Op::Subscr(reg, b, keyreg), loc);
                Ok(reg)
            }

            ExprKind::Subscript(base, idx) => {
                let b = self.compile_expression(base, sym)?;
                let reg = self.alloc_reg(&loc)?;
                let i = self.compile_expression(idx, sym)?;
                self.emit(Op::Subscr(reg, b, i), loc);
                Ok(reg)
            }

            ExprKind::Slice { base, start, stop, step } => {
                let b = self.compile_expression(base, sym)?;
                let reg = self.alloc_reg(&loc)?;
                let s1 = match start {
                    Some(e) => self.compile_expression(e, sym)?,
                    None => self.nil(&loc)?,
                };
                let s2 = match stop {
                    Some(e) => self.compile_expression(e, sym)?,
                    None => self.nil(&loc)?,
                };
                let s3 = match step {
                    Some(e) => self.compile_expression(e, sym)?,
                    None => {
                        let k = self.add_const(Value::Int(1));
                        let r = self.alloc_reg(&loc)?;
                        self.emit(Op::Copyc(r, k), loc.clone());
                        r
                    }
                };
                self.emit(Op::Slice(reg, b, s1, s2, s3), loc);
                Ok(reg)
            }

            ExprKind::Call(callee, args) => {
                let mut arg_regs = Vec::with_capacity(args.len());
                for arg in args {
                    let t = self.alloc_reg(&loc)?;
                    let v = self.compile_expression(arg, sym)?;
                    self.emit(Op::Mov(t, v), loc.clone());
                    arg_regs.push(t);
                }
                for &t in arg_regs.iter().rev() {
                    self.emit(Op::Push(t), loc.clone());
                }

                if let ExprKind::Member(table, key) = &callee.kind {
                    // t.f(...) pushes t as the first popped argument and
                    // calls the function stored under the key.
                    let treg = self.compile_expression(table, sym)?;
                    self.emit(Op::Push(treg), loc.clone());

                    let k = self.heap.alloc_str(key.clone());
                    let kc = self.add_const(Value::Str(k));
                    let keyreg = self.alloc_reg(&loc)?;
                    self.emit(Op::Movc(keyreg, kc), loc.clone());
                    let f = self.alloc_reg(&loc)?;
                    self.emit(Op::Subscr(f, treg, keyreg), loc.clone());
                    self.emit(Op::Call(f), loc.clone());
                } else {
                    let f = self.compile_expression(callee, sym)?;
                    self.emit(Op::Call(f), loc.clone());
                }

                let reg = self.alloc_reg(&loc)?;
                self.emit(Op::Pop(reg), loc);
                Ok(reg)
            }

            ExprKind::BuiltinCall(bi, args) => self.compile_builtin(*bi, args, sym, &loc),

            ExprKind::List(items) => {
                let reg = self.alloc_reg(&loc)?;
                let slot = self.heap.alloc_array(Array::new());
                let k = self.add_const(Value::Array(slot));
                self.emit(Op::Copyc(reg, k), loc.clone());
                for item in items {
                    let v = self.compile_expression(item, sym)?;
                    self.emit(Op::Pushback(reg, v), loc.clone());
                }
                Ok(reg)
            }

            ExprKind::Table(pairs) => {
                let reg = self.alloc_reg(&loc)?;
                let slot = self.heap.alloc_table(Table::new());
                let k = self.add_const(Value::Table(slot));
                self.emit(Op::Copyc(reg, k), loc.clone());
                for (key, ve) in pairs {
                    let ks = self.heap.alloc_str(key.clone());
                    let kc = self.add_const(Value::Str(ks));
                    let keyreg = self.alloc_reg(&loc)?;
                    self.emit(Op::Copyc(keyreg, kc), loc.clone());
                    let v = self.compile_expression(ve, sym)?;
                    self.emit(Op::Aset(reg, keyreg, v), loc.clone());
                }
                Ok(reg)
            }

            ExprKind::Comprehension { value, var, iter } => {
                self.compile_comprehension(value, var.as_deref(), iter, sym, &loc)
            }

            ExprKind::Match { subject, arms } => self.compile_match(subject, arms, sym, &loc),

            ExprKind::Eval(src) => {
                let scope = self.tab.syms[sym].scope;
                let k = self.add_const(Value::Int(scope as i64));
                let a = self.alloc_reg(&loc)?;
                self.emit(Op::Copyc(a, k), loc.clone());
                let s = self.compile_expression(src, sym)?;
                let reg = self.alloc_reg(&loc)?;
                self.emit(Op::Eval(reg, s, a), loc);
                Ok(reg)
            }
        }
    }

    fn arith_op(&mut self, op: BinOp, e: u16, f: u16, g: u16, loc: &Loc) -> CResult<Op> {
        Ok(match op {
            BinOp::Add => Op::Add(e, f, g),
            BinOp::Sub => Op::Sub(e, f, g),
            BinOp::Mul => Op::Mul(e, f, g),
            BinOp::Div => Op::Div(e, f, g),
            BinOp::Mod => Op::Mod(e, f, g),
            BinOp::Pow => Op::Pow(e, f, g),
            BinOp::Shl => Op::Sleft(e, f, g),
            BinOp::Shr => Op::Sright(e, f, g),
            BinOp::BitAnd => Op::Band(e, f, g),
            BinOp::BitOr => Op::Bor(e, f, g),
            BinOp::BitXor => Op::Xor(e, f, g),
            BinOp::Less => Op::Less(e, f, g),
            BinOp::More => Op::More(e, f, g),
            BinOp::Leq => Op::Leq(e, f, g),
            BinOp::Geq => Op::Geq(e, f, g),
            BinOp::EqEq => Op::Cmp(e, f, g),
            _ => return self.error(loc, "operator has no direct opcode"),
        })
    }

    fn compile_binary(
        &mut self,
        op: BinOp,
        a: &Expr,
        b: &Expr,
        sym: SymId,
        loc: &Loc,
    ) -> CResult<u16> {
        match op {
            BinOp::NotEq => {
                let temp = self.alloc_reg(loc)?;
                let x = self.compile_expression(a, sym)?;
                let y = self.compile_expression(b, sym)?;
                self.emit(Op::Cmp(temp, x, y), loc.clone());
                let reg = self.alloc_reg(loc)?;
                self.emit(Op::Flip(reg, temp), loc.clone());
                Ok(reg)
            }

            // Short-circuit forms write a Bool into a single register.
            BinOp::And => {
                let reg = self.alloc_reg(loc)?;
                let kf = self.add_const(Value::Bool(false));
                let kt = self.add_const(Value::Bool(true));
                self.emit(Op::Copyc(reg, kf), loc.clone());
                let x = self.compile_expression(a, sym)?;
                self.emit(Op::Cond(x), a.loc.clone());
                let ja = self.emit(Op::Jmp(0), a.loc.clone());
                let y = self.compile_expression(b, sym)?;
                self.emit(Op::Cond(y), b.loc.clone());
                let jb = self.emit(Op::Jmp(0), b.loc.clone());
                self.emit(Op::Copyc(reg, kt), loc.clone());
                let here = self.ip();
                self.patch_jmp(ja, here);
                self.patch_jmp(jb, here);
                Ok(reg)
            }

            BinOp::Or => {
                let reg = self.alloc_reg(loc)?;
                let kf = self.add_const(Value::Bool(false));
                let kt = self.add_const(Value::Bool(true));
                self.emit(Op::Copyc(reg, kf), loc.clone());

                let x = self.compile_expression(a, sym)?;
                self.emit(Op::Cond(x), a.loc.clone());
                let ja = self.emit(Op::Jmp(0), a.loc.clone());
                self.emit(Op::Copyc(reg, kt), loc.clone());
                let jc = self.emit(Op::Jmp(0), a.loc.clone());

                let here = self.ip();
                self.patch_jmp(ja, here);
                let y = self.compile_expression(b, sym)?;
                self.emit(Op::Cond(y), b.loc.clone());
                let jb = self.emit(Op::Jmp(0), b.loc.clone());
                self.emit(Op::Copyc(reg, kt), loc.clone());

                let here = self.ip();
                self.patch_jmp(jb, here);
                self.patch_jmp(jc, here);
                Ok(reg)
            }

            BinOp::Range => {
                let start = self.compile_expression(a, sym)?;
                let stop = self.compile_expression(b, sym)?;
                let k = self.add_const(Value::Int(1));
                let step = self.alloc_reg(loc)?;
                self.emit(Op::Copyc(step, k), loc.clone());
                let reg = self.alloc_reg(loc)?;
                self.emit(Op::Range(reg, start, stop, step), loc.clone());
                Ok(reg)
            }

            _ => {
                let reg = self.alloc_reg(loc)?;
                let x = self.compile_expression(a, sym)?;
                let y = self.compile_expression(b, sym)?;
                let op = self.arith_op(op, reg, x, y, loc)?;
                self.emit(op, loc.clone());
                Ok(reg)
            }
        }
    }

    fn compile_comprehension(
        &mut self,
        value: &Expr,
        var: Option<&str>,
        iter: &Expr,
        sym: SymId,
        loc: &Loc,
    ) -> CResult<u16> {
        let index = self.alloc_reg(loc)?;
        let array = self.compile_expression(iter, sym)?;

        let reg = self.alloc_reg(loc)?;
        let slot = self.heap.alloc_array(Array::new());
        let ka = self.add_const(Value::Array(slot));
        self.emit(Op::Copyc(reg, ka), loc.clone());

        let km = self.add_const(Value::Int(-1));
        self.emit(Op::Copyc(index, km), loc.clone());

        let cond = self.alloc_reg(loc)?;
        let start = self.ip();
        self.emit(Op::Inc(index), loc.clone());
        let len = self.alloc_reg(loc)?;
        self.emit(Op::Len(len, array), loc.clone());
        self.emit(Op::Less(cond, index, len), loc.clone());
        self.emit(Op::Cond(cond), loc.clone());
        let exit = self.emit(Op::Jmp(0), loc.clone());

        if let Some(name) = var {
            let id = match self.tab.resolve(sym, name) {
                Some(id) => id,
                None => return self.error(loc, format!("undeclared identifier `{}'", name)),
            };
            if self.tab.syms[id].address == usize::MAX {
                let mut addr = self.alloc_var() as usize;
                if self.tab.syms[id].global {
                    addr += NUM_REG;
                }
                self.tab.syms[id].address = addr;
            }
            let addr = self.tab.syms[id].address as u16;
            self.emit(Op::Subscr(addr, array, index), loc.clone());
            let v = self.compile_expression(value, sym)?;
            self.emit(Op::Pushback(reg, v), loc.clone());
        } else {
            let imp = self.alloc_reg(loc)?;
            self.emit(Op::Subscr(imp, array, index), loc.clone());
            self.emit(Op::Pushimp(imp), loc.clone());
            let v = self.compile_expression(value, sym)?;
            self.emit(Op::Pushback(reg, v), loc.clone());
            self.emit(Op::Popimp, loc.clone());
        }

        self.emit(Op::Jmp(start as u32), loc.clone());
        let here = self.ip();
        self.patch_jmp(exit, here);
        Ok(reg)
    }

    fn compile_match(
        &mut self,
        subject: &Expr,
        arms: &[(Expr, MatchBody)],
        sym: SymId,
        loc: &Loc,
    ) -> CResult<u16> {
        let reg = self.nil(loc)?;

        let subj = self.compile_expression(subject, sym)?;
        self.emit(Op::Pushimp(subj), loc.clone());

        let mut skip: Option<usize> = None;
        let mut ends = Vec::new();

        for (pat, body) in arms {
            if let Some(at) = skip.take() {
                let here = self.ip();
                self.patch_jmp(at, here);
            }

            let cond = match &pat.kind {
                ExprKind::Regex { pattern, flags, .. } => {
                    let v = self.regex_const(pattern, flags, "", &pat.loc)?;
                    let k = self.add_const(v);
                    let re = self.alloc_reg(&pat.loc)?;
                    self.emit(Op::Copyc(re, k), pat.loc.clone());
                    let temp = self.getimp(&pat.loc)?;
                    let cond = self.alloc_reg(&pat.loc)?;
                    self.emit(Op::Match(cond, temp, re), pat.loc.clone());
                    cond
                }
                _ => {
                    let imp = self.getimp(&pat.loc)?;
                    let v = self.compile_expression(pat, sym)?;
                    let cond = self.alloc_reg(&pat.loc)?;
                    self.emit(Op::Cmp(cond, imp, v), pat.loc.clone());
                    cond
                }
            };
            self.emit(Op::Cond(cond), pat.loc.clone());
            skip = Some(self.emit(Op::Jmp(0), pat.loc.clone()));

            match body {
                MatchBody::Expr(e) => {
                    let v = self.compile_expression(e, sym)?;
                    self.emit(Op::Mov(reg, v), loc.clone());
                }
                MatchBody::Block(stmts) => {
                    let mut wrote = false;
                    for (i, s) in stmts.iter().enumerate() {
                        if i == stmts.len() - 1 {
                            if let StmtKind::Expr(e) = &s.kind {
                                let inner = self.scope_sym(s)?;
                                let v = self.compile_expression(e, inner)?;
                                self.emit(Op::Mov(reg, v), loc.clone());
                                wrote = true;
                                break;
                            }
                        }
                        self.compile_stmt(s)?;
                    }
                    if !wrote {
                        let n = self.nil(loc)?;
                        self.emit(Op::Mov(reg, n), loc.clone());
                    }
                }
            }

            ends.push(self.emit(Op::Jmp(0), loc.clone()));
        }

        let here = self.ip();
        if let Some(at) = skip {
            self.patch_jmp(at, here);
        }
        for at in ends {
            self.patch_jmp(at, here);
        }
        self.emit(Op::Popimp, loc.clone());
        Ok(reg)
    }

    fn compile_builtin(
        &mut self,
        bi: Builtin,
        args: &[Expr],
        sym: SymId,
        loc: &Loc,
    ) -> CResult<u16> {
        macro_rules! checkargs {
            ($bad:expr) => {
                if $bad {
                    return self.error(loc, "invalid number of arguments to builtin function");
                }
            };
        }

        // Unary builtins fall back to the implicit variable.
        let unary_arg = |c: &mut Self, args: &[Expr]| -> CResult<u16> {
            if args.is_empty() {
                c.getimp(loc)
            } else {
                c.compile_expression(&args[0], sym)
            }
        };

        match bi {
            Builtin::Split => {
                checkargs!(args.is_empty() || args.len() > 2);
                let subject = if args.len() == 1 {
                    self.getimp(loc)?
                } else {
                    self.compile_expression(&args[1], sym)?
                };
                let re = match &args[0].kind {
                    ExprKind::Regex { pattern, flags, .. } => {
                        // Split always scans the whole subject.
                        let v = self.regex_const(pattern, flags, "g", &args[0].loc)?;
                        let k = self.add_const(v);
                        let re = self.alloc_reg(loc)?;
                        self.emit(Op::Copyc(re, k), loc.clone());
                        re
                    }
                    _ => self.compile_expression(&args[0], sym)?,
                };
                let reg = self.alloc_reg(loc)?;
                self.emit(Op::Split(reg, subject, re), loc.clone());
                Ok(reg)
            }

            Builtin::Join => {
                checkargs!(args.len() != 2);
                let array = self.compile_expression(&args[0], sym)?;
                let delim = self.compile_expression(&args[1], sym)?;
                let reg = self.alloc_reg(loc)?;
                self.emit(Op::Join(reg, array, delim), loc.clone());
                Ok(reg)
            }

            Builtin::Range => {
                checkargs!(args.len() != 2 && args.len() != 3);
                let start = self.compile_expression(&args[0], sym)?;
                let stop = self.compile_expression(&args[1], sym)?;
                let step = if args.len() == 3 {
                    self.compile_expression(&args[2], sym)?
                } else {
                    let k = self.add_const(Value::Int(1));
                    let r = self.alloc_reg(loc)?;
                    self.emit(Op::Copyc(r, k), loc.clone());
                    r
                };
                let reg = self.alloc_reg(loc)?;
                self.emit(Op::Range(reg, start, stop, step), loc.clone());
                Ok(reg)
            }

            Builtin::Push => {
                checkargs!(args.is_empty() || args.len() > 2);
                let target = self.compile_lvalue(&args[0], sym)?;
                let v = if args.len() == 2 {
                    self.compile_expression(&args[1], sym)?
                } else {
                    self.getimp(loc)?
                };
                self.emit(Op::Apush(target, v), loc.clone());
                Ok(target)
            }

            Builtin::Insert => {
                checkargs!(args.len() != 2 && args.len() != 3);
                let target = self.compile_lvalue(&args[0], sym)?;
                let idx = self.compile_expression(&args[1], sym)?;
                let v = if args.len() == 3 {
                    self.compile_expression(&args[2], sym)?
                } else {
                    self.getimp(loc)?
                };
                self.emit(Op::Ins(target, idx, v), loc.clone());
                Ok(target)
            }

            Builtin::Pop => {
                checkargs!(args.len() > 1);
                let a = unary_arg(self, args)?;
                let reg = self.alloc_reg(loc)?;
                self.emit(Op::Apop(reg, a), loc.clone());
                Ok(reg)
            }
            Builtin::Shift => {
                checkargs!(args.len() > 1);
                let a = unary_arg(self, args)?;
                let reg = self.alloc_reg(loc)?;
                self.emit(Op::Shift(reg, a), loc.clone());
                Ok(reg)
            }

            Builtin::Reverse
            | Builtin::Sort
            | Builtin::Uc
            | Builtin::Lc
            | Builtin::Ucfirst
            | Builtin::Lcfirst
            | Builtin::Type
            | Builtin::Len
            | Builtin::Sum
            | Builtin::Abs
            | Builtin::Keys
            | Builtin::Values
            | Builtin::Int
            | Builtin::Float
            | Builtin::Str
            | Builtin::Copy => {
                checkargs!(args.len() > 1);
                let a = unary_arg(self, args)?;
                let reg = self.alloc_reg(loc)?;
                let op = match bi {
                    Builtin::Reverse => Op::Rev(reg, a),
                    Builtin::Sort => Op::Sort(reg, a),
                    Builtin::Uc => Op::Uc(reg, a),
                    Builtin::Lc => Op::Lc(reg, a),
                    Builtin::Ucfirst => Op::Ucfirst(reg, a),
                    Builtin::Lcfirst => Op::Lcfirst(reg, a),
                    Builtin::Type => Op::Type(reg, a),
                    Builtin::Len => Op::Len(reg, a),
                    Builtin::Sum => Op::Sum(reg, a),
                    Builtin::Abs => Op::Abs(reg, a),
                    Builtin::Keys => Op::Keys(reg, a),
                    Builtin::Values => Op::Values(reg, a),
                    Builtin::Int => Op::Int(reg, a),
                    Builtin::Float => Op::Float(reg, a),
                    Builtin::Str => Op::Str(reg, a),
                    Builtin::Copy => Op::Copy(reg, a),
                    _ => unreachable!(),
                };
                self.emit(op, loc.clone());
                Ok(reg)
            }

            Builtin::Min | Builtin::Max | Builtin::Chr | Builtin::Ord => {
                // Stack-fed: arguments are pushed, the opcode drains them.
                let reg = self.alloc_reg(loc)?;
                if args.is_empty() {
                    let imp = self.getimp(loc)?;
                    self.emit(Op::Push(imp), loc.clone());
                } else {
                    let mut temps = Vec::with_capacity(args.len());
                    for arg in args {
                        let t = self.alloc_reg(loc)?;
                        let v = self.compile_expression(arg, sym)?;
                        self.emit(Op::Mov(t, v), loc.clone());
                        temps.push(t);
                    }
                    for &t in temps.iter().rev() {
                        self.emit(Op::Push(t), loc.clone());
                    }
                }
                let op = match bi {
                    Builtin::Min => Op::Min(reg),
                    Builtin::Max => Op::Max(reg),
                    Builtin::Chr => Op::Chr(reg),
                    Builtin::Ord => Op::Ord(reg),
                    _ => unreachable!(),
                };
                self.emit(op, loc.clone());
                Ok(reg)
            }
        }
    }

    // ===== statements =====

    fn compile_stmt(&mut self, s: &Stmt) -> CResult<()> {
        tracing::trace!(
            target: "alder::compiler",
            ip = self.ip(),
            scope = s.scope,
            line = s.loc.line(),
            "compile statement"
        );
        let sym = self.scope_sym(s)?;

        if matches!(s.kind, StmtKind::VarDecl { .. }) && s.when.is_some() {
            return self.error(&s.loc, "variable declarations may not carry a condition");
        }

        let when_jmp = if let Some(cond) = &s.when {
            let reg = self.compile_expr_stmt(cond, sym)?;
            self.emit(Op::Cond(reg), s.loc.clone());
            Some(self.emit(Op::Jmp(0), s.loc.clone()))
        } else {
            None
        };

        match &s.kind {
            StmtKind::Expr(e) => {
                self.compile_expr_stmt(e, sym)?;
            }

            StmtKind::VarDecl { names, init } => {
                for (i, name) in names.iter().enumerate() {
                    let id = match self.tab.resolve(sym, name) {
                        Some(id) => id,
                        None => {
                            return self.error(&s.loc, format!("undeclared identifier `{}'", name))
                        }
                    };
                    let mut addr = self.alloc_var() as usize;
                    if self.tab.syms[id].global {
                        addr += NUM_REG;
                    }
                    self.tab.syms[id].address = addr;

                    let reg = match init.get(i) {
                        Some(e) => self.compile_expr_stmt(e, sym)?,
                        None => self.nil(&s.loc)?,
                    };
                    self.emit(Op::Copy(addr as u16, reg), s.loc.clone());
                }
            }

            StmtKind::FnDef { name, params, defaults, body } => {
                self.compile_fn_def(s, sym, name, params, defaults, body)?;
            }

            StmtKind::If { cond, then, otherwise } => {
                let reg = self.compile_expr_stmt(cond, sym)?;
                self.emit(Op::Cond(reg), s.loc.clone());
                let ja = self.emit(Op::Jmp(0), s.loc.clone());
                self.compile_stmt(then)?;
                let jb = self.emit(Op::Jmp(0), s.loc.clone());
                let here = self.ip();
                self.patch_jmp(ja, here);
                if let Some(o) = otherwise {
                    self.compile_stmt(o)?;
                }
                let here = self.ip();
                self.patch_jmp(jb, here);
            }

            StmtKind::While { cond, body } => {
                let (lp, np, old_loop) = self.enter_loop(sym);

                let a = self.ip();
                let reg = self.compile_expr_stmt(cond, sym)?;
                self.emit(Op::Cond(reg), s.loc.clone());
                let jb = self.emit(Op::Jmp(0), s.loc.clone());
                self.compile_stmt(body)?;
                self.emit(Op::Jmp(a as u32), s.loc.clone());
                let here = self.ip();
                self.patch_jmp(jb, here);

                self.tab.syms[sym].next = a as i64;
                self.tab.syms[sym].last = here as i64;
                self.leave_loop(lp, np, old_loop, a, here);
            }

            StmtKind::Do { body, cond } => {
                let (lp, np, old_loop) = self.enter_loop(sym);

                let a = self.ip();
                self.compile_stmt(body)?;
                let cont = self.ip();
                // `next` in a do loop re-tests the condition.
                for at in self.next_patches.split_off(np) {
                    self.patch_jmp(at, cont);
                }
                let reg = self.compile_expr_stmt(cond, sym)?;
                self.emit(Op::Ncond(reg), s.loc.clone());
                self.emit(Op::Jmp(a as u32), s.loc.clone());
                let here = self.ip();
                for at in self.last_patches.split_off(lp) {
                    self.patch_jmp(at, here);
                }

                self.tab.syms[sym].next = cont as i64;
                self.tab.syms[sym].last = here as i64;
                self.cur_loop = old_loop;
            }

            StmtKind::For { init, cond, step, body } => {
                self.compile_for(s, sym, init.as_deref(), cond.as_ref(), step.as_ref(), body)?;
            }

            StmtKind::Block(stmts) => {
                for inner in stmts {
                    self.compile_stmt(inner)?;
                }
            }

            StmtKind::Print(args) => {
                for e in args {
                    let reg = self.compile_expr_stmt(e, sym)?;
                    self.emit(Op::Print(reg), s.loc.clone());
                }
            }

            StmtKind::Println(args) => {
                // Arguments separated by a single space.
                for (i, e) in args.iter().enumerate() {
                    if i > 0 {
                        let slot = self.heap.alloc_str(" ");
                        let sk = self.add_const(Value::Str(slot));
                        let sep = self.alloc_reg(&s.loc)?;
                        self.emit(Op::Copyc(sep, sk), s.loc.clone());
                        self.emit(Op::Print(sep), s.loc.clone());
                    }
                    let reg = self.compile_expr_stmt(e, sym)?;
                    self.emit(Op::Print(reg), s.loc.clone());
                }
                self.emit(Op::Line, s.loc.clone());
            }

            StmtKind::Return(e) => {
                if self.sp == 0 && self.eval {
                    let reg = match e {
                        Some(e) => self.compile_expr_stmt(e, sym)?,
                        None => self.nil(&s.loc)?,
                    };
                    self.emit(Op::Eend(reg), s.loc.clone());
                } else if self.sp == 0 {
                    return self.error(
                        &s.loc,
                        "'return' keyword must occur inside of a function body",
                    );
                } else {
                    let frame = self.tab.frame_of(sym);
                    for _ in 0..self.tab.count_imp(sym, frame) {
                        self.emit(Op::Popimp, s.loc.clone());
                    }
                    let reg = match e {
                        Some(e) => self.compile_expr_stmt(e, sym)?,
                        None => self.nil(&s.loc)?,
                    };
                    self.emit(Op::Push(reg), s.loc.clone());
                    self.emit(Op::Ret, s.loc.clone());
                }
            }

            StmtKind::Last => {
                self.pop_loop_imps(sym, &s.loc);
                if self.eval {
                    let target = self.tab.loop_last(sym);
                    if target < 0 {
                        return self.error(
                            &s.loc,
                            "'last' keyword must occur inside of a loop body",
                        );
                    }
                    self.emit(Op::Escape(target as u32), s.loc.clone());
                } else {
                    let at = self.emit(Op::Jmp(0), s.loc.clone());
                    self.last_patches.push(at);
                }
            }

            StmtKind::Next => {
                self.pop_loop_imps(sym, &s.loc);
                if self.eval {
                    let target = self.tab.loop_next(sym);
                    if target < 0 {
                        return self.error(
                            &s.loc,
                            "'next' keyword must occur inside of a loop body",
                        );
                    }
                    self.emit(Op::Escape(target as u32), s.loc.clone());
                } else {
                    let at = self.emit(Op::Jmp(0), s.loc.clone());
                    self.next_patches.push(at);
                }
            }

            StmtKind::Die(e) => {
                let reg = self.compile_expr_stmt(e, sym)?;
                self.emit(Op::Kill(reg), s.loc.clone());
            }

            StmtKind::Label(name) => {
                let id = match self.tab.resolve(sym, name) {
                    Some(id) => id,
                    None => return self.error(&s.loc, format!("undeclared label `{}'", name)),
                };
                let here = self.ip();
                self.tab.syms[id].label_addr = Some(here);
                let pending = std::mem::take(&mut self.tab.syms[id].pending_gotos);
                for at in pending {
                    self.patch_jmp(at, here);
                }
            }

            StmtKind::Goto(name) => {
                let id = match self.tab.resolve(sym, name) {
                    Some(id) => id,
                    None => return self.error(&s.loc, "undeclared identifier"),
                };
                if self.sp != 0 && self.tab.syms[id].global {
                    return self.error(&s.loc, "goto may not jump out of a function definition");
                }

                let label_parent = self.tab.syms[id].parent.unwrap_or(self.root);
                for _ in 0..self.tab.count_imp(sym, label_parent) {
                    self.emit(Op::Popimp, s.loc.clone());
                }

                match self.tab.syms[id].label_addr {
                    Some(addr) => {
                        self.emit(Op::Jmp(addr as u32), s.loc.clone());
                    }
                    None => {
                        let at = self.emit(Op::Jmp(0), s.loc.clone());
                        self.tab.syms[id].pending_gotos.push(at);
                    }
                }
            }

            StmtKind::Enum { names, init } => {
                let mut cur: i64 = 0;
                for (i, name) in names.iter().enumerate() {
                    if let Some(e) = &init[i] {
                        if !self.is_constant_expr(e, sym) {
                            return self.error(
                                &e.loc,
                                "enum initializer requires constant expression",
                            );
                        }
                        match self.fold_constant(e, sym)? {
                            Value::Int(n) => cur = n,
                            _ => {
                                return self.error(
                                    &e.loc,
                                    "enum initializer requires integer expression",
                                )
                            }
                        }
                    }
                    if let Some(id) = self.tab.resolve(sym, name) {
                        self.tab.syms[id].enum_val = cur;
                    }
                    cur += 1;
                }
            }

            StmtKind::Null => {}
        }

        if let Some(at) = when_jmp {
            let here = self.ip();
            self.patch_jmp(at, here);
        }

        Ok(())
    }

    fn enter_loop(&mut self, scope: SymId) -> (usize, usize, Option<SymId>) {
        let old = self.cur_loop.replace(scope);
        (self.last_patches.len(), self.next_patches.len(), old)
    }

    fn leave_loop(
        &mut self,
        lp: usize,
        np: usize,
        old_loop: Option<SymId>,
        next_target: usize,
        last_target: usize,
    ) {
        for at in self.next_patches.split_off(np) {
            self.patch_jmp(at, next_target);
        }
        for at in self.last_patches.split_off(lp) {
            self.patch_jmp(at, last_target);
        }
        self.cur_loop = old_loop;
    }

    /// POPIMP once per implicit scope crossed when leaving the innermost
    /// loop.
    fn pop_loop_imps(&mut self, sym: SymId, loc: &Loc) {
        if let Some(loop_scope) = self.cur_loop {
            let mut n = 0;
            let mut at = Some(sym);
            while let Some(id) = at {
                if self.tab.syms[id].imp {
                    n += 1;
                }
                if id == loop_scope {
                    break;
                }
                at = self.tab.syms[id].parent;
            }
            for _ in 0..n {
                self.emit(Op::Popimp, loc.clone());
            }
        }
    }

    fn compile_fn_def(
        &mut self,
        s: &Stmt,
        sym: SymId,
        name: &str,
        params: &[String],
        defaults: &[Option<Expr>],
        body: &Stmt,
    ) -> CResult<()> {
        // `sym` is the function symbol itself, doubling as the body scope.
        let fn_id = sym;
        if self.tab.syms[fn_id].kind != SymKind::Fn {
            return self.error(&s.loc, format!("undeclared function `{}'", name));
        }

        let skip = self.emit(Op::Jmp(0), s.loc.clone());
        self.push_frame(sym);
        self.tab.syms[fn_id].address = self.ip();
        tracing::debug!(
            target: "alder::compiler",
            name,
            entry = self.tab.syms[fn_id].address,
            args = params.len(),
            "compile fn"
        );

        for (i, param) in params.iter().enumerate() {
            let id = match self.tab.resolve(sym, param) {
                Some(id) => id,
                None => return self.error(&s.loc, format!("undeclared identifier `{}'", param)),
            };
            let addr = self.alloc_var();
            self.tab.syms[id].address = addr as usize;

            // The default value is loaded first; a caller-supplied value
            // pops over it.
            let reg = match &defaults[i] {
                Some(e) => self.compile_expression(e, sym)?,
                None => self.nil(&s.loc)?,
            };
            self.emit(Op::Mov(addr, reg), s.loc.clone());
            self.emit(Op::Pop(addr), s.loc.clone());
        }

        self.emit(Op::Chkstck, s.loc.clone());
        self.compile_stmt(body)?;
        self.pop_frame();

        let nil = self.nil(&s.loc)?;
        self.emit(Op::Push(nil), s.loc.clone());
        self.emit(Op::Ret, s.loc.clone());
        let here = self.ip();
        self.patch_jmp(skip, here);
        Ok(())
    }

    fn compile_for(
        &mut self,
        s: &Stmt,
        sym: SymId,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
    ) -> CResult<()> {
        let (lp, np, old_loop) = self.enter_loop(sym);
        let loc = s.loc.clone();

        match (init, cond, step) {
            // Classic C-style loop.
            (Some(init), Some(cond), Some(step)) => {
                self.compile_stmt(init)?;
                let a = self.ip();
                let reg = self.compile_expr_stmt(cond, sym)?;
                self.emit(Op::Cond(reg), loc.clone());
                let jb = self.emit(Op::Jmp(0), loc.clone());
                self.compile_stmt(body)?;
                let cont = self.ip();
                self.compile_expr_stmt(step, sym)?;
                self.emit(Op::Jmp(a as u32), loc.clone());
                let here = self.ip();
                self.patch_jmp(jb, here);

                self.tab.syms[sym].next = cont as i64;
                self.tab.syms[sym].last = here as i64;
                self.leave_loop(lp, np, old_loop, cont, here);
            }

            // Loop variable + iteration expression.
            (Some(init), Some(iter), None) => match &iter.kind {
                ExprKind::Squiggle(lhs, rhs) => {
                    self.compile_regex_for(s, sym, Some(init), Some(lhs), rhs, body, lp, np, old_loop)?;
                }
                ExprKind::Regex { .. } => {
                    self.compile_regex_for(s, sym, Some(init), None, iter, body, lp, np, old_loop)?;
                }
                _ => {
                    let reg = self.loop_var_reg(init, sym)?;

                    let iter_reg = self.alloc_var();
                    let expr_reg = self.alloc_var();

                    let v = self.compile_expr_stmt(iter, sym)?;
                    self.emit(Op::Mov(expr_reg, v), loc.clone());
                    let km = self.add_const(Value::Int(-1));
                    self.emit(Op::Copyc(iter_reg, km), loc.clone());

                    let start = self.ip();
                    self.emit(Op::Inc(iter_reg), loc.clone());
                    self.set_stack_top();
                    let len = self.alloc_reg(&loc)?;
                    self.emit(Op::Len(len, expr_reg), loc.clone());
                    let cond = self.alloc_reg(&loc)?;
                    self.emit(Op::Less(cond, iter_reg, len), loc.clone());
                    self.emit(Op::Cond(cond), loc.clone());
                    let ja = self.emit(Op::Jmp(0), loc.clone());
                    self.emit(Op::Subscr(reg, expr_reg, iter_reg), loc.clone());

                    self.compile_stmt(body)?;
                    self.emit(Op::Jmp(start as u32), loc.clone());
                    let here = self.ip();
                    self.patch_jmp(ja, here);

                    self.tab.syms[sym].next = start as i64;
                    self.tab.syms[sym].last = here as i64;
                    self.leave_loop(lp, np, old_loop, start, here);
                }
            },

            // Single clause: iterate with the implicit variable.
            (Some(init), None, None) => {
                let e = match &init.kind {
                    StmtKind::Expr(e) => e,
                    _ => return self.error(&loc, "argument to `for' must be an expression"),
                };
                match &e.kind {
                    ExprKind::Squiggle(lhs, rhs) => {
                        self.compile_regex_for(s, sym, None, Some(lhs), rhs, body, lp, np, old_loop)?;
                    }
                    ExprKind::Regex { .. } => {
                        self.compile_regex_for(s, sym, None, None, e, body, lp, np, old_loop)?;
                    }
                    _ => {
                        let iter_reg = self.alloc_var();
                        let expr_reg = self.alloc_var();

                        let v = self.compile_expr_stmt(e, sym)?;
                        self.emit(Op::Mov(expr_reg, v), loc.clone());
                        let km = self.add_const(Value::Int(-1));
                        self.emit(Op::Copyc(iter_reg, km), loc.clone());

                        let start = self.ip();
                        self.emit(Op::Inc(iter_reg), loc.clone());
                        self.set_stack_top();
                        let len = self.alloc_reg(&loc)?;
                        self.emit(Op::Len(len, expr_reg), loc.clone());
                        let cond = self.alloc_reg(&loc)?;
                        self.emit(Op::Less(cond, iter_reg, len), loc.clone());
                        self.emit(Op::Cond(cond), loc.clone());
                        let ja = self.emit(Op::Jmp(0), loc.clone());

                        let temp = self.alloc_reg(&loc)?;
                        self.emit(Op::Subscr(temp, expr_reg, iter_reg), loc.clone());
                        self.emit(Op::Pushimp(temp), loc.clone());
                        self.compile_stmt(body)?;
                        self.emit(Op::Popimp, loc.clone());

                        self.emit(Op::Jmp(start as u32), loc.clone());
                        let here = self.ip();
                        self.patch_jmp(ja, here);

                        self.tab.syms[sym].next = start as i64;
                        self.tab.syms[sym].last = here as i64;
                        self.leave_loop(lp, np, old_loop, start, here);
                    }
                }
            }

            _ => return self.error(&loc, "malformed for loop"),
        }

        Ok(())
    }

    /// The register the loop variable lives in: a one-name declaration or
    /// any lvalue.
    fn loop_var_reg(&mut self, init: &Stmt, sym: SymId) -> CResult<u16> {
        match &init.kind {
            StmtKind::VarDecl { names, .. } => {
                if names.len() != 1 {
                    return self.error(
                        &init.loc,
                        "variable declaration for-loop initializers must declare only one variable",
                    );
                }
                self.compile_stmt(init)?;
                let id = self.tab.resolve(sym, &names[0]).ok_or(())?;
                Ok(self.tab.syms[id].address as u16)
            }
            StmtKind::Expr(e) => self.compile_lvalue(e, sym),
            _ => self.error(&init.loc, "malformed for-loop initializer"),
        }
    }

    /// Iterative regex loops: `for [var x;] subject ~= /re/: body` and
    /// `for [var x;] /re/: body`. The regex gets the continue flag, its
    /// cursor is reset on entry, and each iteration matches once.
    #[allow(clippy::too_many_arguments)]
    fn compile_regex_for(
        &mut self,
        s: &Stmt,
        sym: SymId,
        init: Option<&Stmt>,
        lhs: Option<&Expr>,
        regex: &Expr,
        body: &Stmt,
        lp: usize,
        np: usize,
        old_loop: Option<SymId>,
    ) -> CResult<()> {
        let loc = s.loc.clone();
        let (pattern, flags) = match &regex.kind {
            ExprKind::Regex { pattern, flags, .. } => (pattern, flags),
            _ => return self.error(&loc, "operator requires regex righthand argument"),
        };

        let var_reg = match init {
            Some(init) => Some(self.loop_var_reg(init, sym)?),
            None => None,
        };

        let expr_reg = self.alloc_var();
        let operand = self.alloc_var();
        let re = self.alloc_var();

        match lhs {
            Some(lhs) => {
                let v = self.compile_expr_stmt(lhs, sym)?;
                self.emit(Op::Mov(operand, v), loc.clone());
            }
            None => {
                self.emit(Op::Getimp(operand), loc.clone());
            }
        }

        let v = self.regex_const(pattern, flags, "c", &regex.loc)?;
        let k = self.add_const(v);
        self.emit(Op::Copyc(re, k), loc.clone());
        self.emit(Op::Resetr(re), loc.clone());

        let start = self.ip();
        self.emit(Op::Match(expr_reg, operand, re), regex.loc.clone());
        self.emit(Op::Cond(expr_reg), loc.clone());
        let ja = self.emit(Op::Jmp(0), loc.clone());

        self.set_stack_top();
        let kz = self.add_const(Value::Int(0));
        let zero = self.alloc_reg(&loc)?;
        self.emit(Op::Copyc(zero, kz), loc.clone());
        let temp = self.alloc_reg(&loc)?;
        self.emit(Op::Subscr(temp, expr_reg, zero), loc.clone());

        match var_reg {
            Some(reg) => {
                self.emit(Op::Mov(reg, temp), loc.clone());
                self.compile_stmt(body)?;
            }
            None => {
                self.emit(Op::Pushimp(temp), loc.clone());
                self.compile_stmt(body)?;
                self.emit(Op::Popimp, loc.clone());
            }
        }

        self.emit(Op::Jmp(start as u32), loc.clone());
        let here = self.ip();
        self.patch_jmp(ja, here);

        self.tab.syms[sym].next = start as i64;
        self.tab.syms[sym].last = here as i64;
        self.leave_loop(lp, np, old_loop, start, here);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::symbol::Symbolizer;
    use std::rc::Rc;

    fn compile_src(src: &str) -> (Vec<Instr>, ConstantTable, Heap) {
        let mut r = Reporter::new();
        let tokens = Lexer::new(Rc::from(src), Rc::from("test"), &mut r).tokenize();
        let mut program = Parser::new(tokens, &mut r).parse().unwrap();
        let mut tab = SymbolTable::new();
        let root = Symbolizer::new(&mut tab, &mut r, 0).run(&mut program, "test", None);
        let mut ct = ConstantTable::new();
        let mut heap = Heap::new();
        let code = compile(&program, &mut tab, &mut ct, &mut heap, &mut r, 0, root, false, None);
        assert!(code.is_some(), "compile failed: {:?}", r.diags);
        (code.unwrap(), ct, heap)
    }

    fn compile_err(src: &str) -> String {
        let mut r = Reporter::new();
        let tokens = Lexer::new(Rc::from(src), Rc::from("test"), &mut r).tokenize();
        let mut program = Parser::new(tokens, &mut r).parse().unwrap();
        let mut tab = SymbolTable::new();
        let root = Symbolizer::new(&mut tab, &mut r, 0).run(&mut program, "test", None);
        let mut ct = ConstantTable::new();
        let mut heap = Heap::new();
        let code = compile(&program, &mut tab, &mut ct, &mut heap, &mut r, 0, root, false, None);
        assert!(code.is_none(), "compile unexpectedly succeeded");
        r.diags.last().unwrap().msg.clone()
    }

    #[test]
    fn test_jump_targets_valid() {
        let (code, _, _) = compile_src(
            "var x = 0; while x < 10 { x = x + 1; if x == 5: last; } println x;",
        );
        assert!(crate::bytecode::jump_targets_valid(&code));
    }

    #[test]
    fn test_constant_folding_collapses_arithmetic() {
        let (code, ct, _) = compile_src("println 2 + 3 * 4;");
        // The expression collapses to one constant load.
        assert!(ct.vals.iter().any(|v| matches!(v, Value::Int(14))));
        let adds = code.iter().filter(|i| matches!(i.op, Op::Add(..))).count();
        assert_eq!(adds, 0);
    }

    #[test]
    fn test_regex_literal_is_not_folded() {
        let (code, _, _) = compile_src("var s = \"x\"; var m = s ~= /x/;");
        assert!(code.iter().any(|i| matches!(i.op, Op::Match(..))));
    }

    #[test]
    fn test_short_circuit_and() {
        let (code, _, _) = compile_src("var a = true && false;");
        assert!(code.iter().any(|i| matches!(i.op, Op::Cond(_))));
    }

    #[test]
    fn test_fn_def_emits_prologue() {
        let (code, _, _) = compile_src("fn f(x = 5) = x * 2; println f(7);");
        assert!(code.iter().any(|i| matches!(i.op, Op::Chkstck)));
        assert!(code.iter().any(|i| matches!(i.op, Op::Ret)));
        assert!(code.iter().any(|i| matches!(i.op, Op::Call(_))));
    }

    #[test]
    fn test_last_outside_loop_is_error() {
        let msg = compile_err("last;");
        assert!(msg.contains("last"));
    }

    #[test]
    fn test_return_outside_fn_is_error() {
        let msg = compile_err("return 1;");
        assert!(msg.contains("return"));
    }

    #[test]
    fn test_undeclared_identifier_is_error() {
        let msg = compile_err("println y;");
        assert!(msg.contains("undeclared"));
    }

    #[test]
    fn test_var_decl_with_when_is_error() {
        let msg = compile_err("var x = 1 when true;");
        assert!(msg.contains("condition"));
    }

    #[test]
    fn test_enum_requires_constant_integers() {
        let msg = compile_err("var y = 1; enum { A = y }");
        assert!(msg.contains("enum initializer"));
    }

    #[test]
    fn test_bad_regex_reports_position() {
        let msg = compile_err("var s = \"a\"; s ~= /(x/;");
        assert!(msg.contains("regex"));
    }

    #[test]
    fn test_goto_forward_backpatched() {
        let (code, _, _) = compile_src("goto skip; println 1; skip: println 2;");
        assert!(crate::bytecode::jump_targets_valid(&code));
    }

    #[test]
    fn test_match_balances_implicit_stack() {
        let (code, _, _) = compile_src(r#"var r = match "x" { /x/: 1, "y": 2 };"#);
        let pushes = code.iter().filter(|i| matches!(i.op, Op::Pushimp(_))).count();
        let pops = code.iter().filter(|i| matches!(i.op, Op::Popimp)).count();
        assert_eq!(pushes, pops);
    }

    #[test]
    fn test_comprehension_balances_implicit_stack() {
        let (code, _, _) = compile_src("var a = [_ * 2 for [1, 2, 3]];");
        let pushes = code.iter().filter(|i| matches!(i.op, Op::Pushimp(_))).count();
        let pops = code.iter().filter(|i| matches!(i.op, Op::Popimp)).count();
        assert_eq!(pushes, pops);
    }

    #[test]
    fn test_for_regex_uses_reset_and_match() {
        let (code, _, _) = compile_src(r#"var s = "a1 b2"; for var x; s ~= /\d/: print x;"#);
        assert!(code.iter().any(|i| matches!(i.op, Op::Resetr(_))));
        assert!(code.iter().any(|i| matches!(i.op, Op::Match(..))));
    }

    #[test]
    fn test_interp_string_emits_interp() {
        let (code, _, _) = compile_src(r#"var x = 1; println "x is $x";"#);
        assert!(code.iter().any(|i| matches!(i.op, Op::Interp(..))));
    }

    #[test]
    fn test_globals_offset_into_root_frame() {
        let (code, _, _) = compile_src("var g = 1; fn f() = g; println f();");
        // Inside f, g is addressed above NUM_REG.
        let has_global_ref = code.iter().any(|i| match i.op {
            Op::Mov(_, src) => src as usize >= NUM_REG,
            _ => false,
        });
        assert!(has_global_ref);
    }
}
