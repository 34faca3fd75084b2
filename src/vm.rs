//! The Alder virtual machine
//!
//! Register frames of NUM_REG values; register indices at or above NUM_REG
//! address the module's root frame (the globals). Calls push a frame and a
//! return address; cross-module calls swap the code and constant table and
//! run the callee to completion. Eval re-enters the whole pipeline on a new
//! source string, sharing the current frame above a chosen stack base.
//!
//! Errors are collected in the reporter and checked after every
//! instruction; a fatal diagnostic stops the current module and is written
//! out with a stack trace at the outermost execution boundary.

use std::io::Write;
use std::rc::Rc;

use crate::bytecode::{Instr, Op};
use crate::error::{Loc, Reporter, Severity};
use crate::heap::{Array, Heap, Table};
use crate::interp::Interp;
use crate::value::{self, copy_value, is_truthy, print_string, show_value, Value};

pub const NUM_REG: usize = 256;
pub const MAX_CALL_DEPTH: usize = 8192;

#[derive(Debug, Clone)]
struct CallFrame {
    ret: i64,
    func: Value,
    args_at_entry: usize,
}

pub struct Vm {
    code: Rc<[Instr]>,
    ip: i64,
    step: u64,
    module: usize,
    ct: usize,

    frames: Vec<Vec<Value>>,
    module_of: Vec<usize>,
    fp: usize,

    stack: Vec<Value>,
    imp: Vec<Value>,
    callstack: Vec<CallFrame>,

    // State shared between MATCH and GROUP/SUBST.
    re_slot: Option<usize>,
    subject: String,
    match_vecs: Vec<Vec<i32>>,
    match_idx: i64,

    pub r: Reporter,
    returning: bool,
    escaping: bool,
    escape_target: Option<i64>,
    depth: usize,
}

impl Vm {
    pub fn new(k: &Interp, module: usize) -> Self {
        Vm {
            code: Rc::clone(&k.modules[module].code),
            ip: 0,
            step: 0,
            module,
            ct: k.modules[module].ct,
            frames: vec![Vec::new()],
            module_of: vec![0],
            fp: 0,
            stack: Vec::new(),
            imp: Vec::new(),
            callstack: Vec::new(),
            re_slot: None,
            subject: String::new(),
            match_vecs: Vec::new(),
            match_idx: -1,
            r: Reporter::new(),
            returning: false,
            escaping: false,
            escape_target: None,
            depth: 0,
        }
    }

    pub fn push_frame(&mut self) {
        self.fp += 1;
        if self.fp < self.frames.len() {
            self.frames[self.fp].fill(Value::Undef);
        } else {
            self.frames.push(vec![Value::Undef; NUM_REG]);
            self.module_of.push(self.module);
        }
        self.module_of[self.fp] = self.module;
    }

    fn pop_frame(&mut self) {
        self.fp -= 1;
    }

    fn get(&self, r: u16) -> Value {
        let r = r as usize;
        if r >= NUM_REG {
            self.frames[1][r - NUM_REG]
        } else {
            self.frames[self.fp][r]
        }
    }

    fn set(&mut self, k: &mut Interp, r: u16, v: Value, loc: &Loc) {
        if let Value::Err(slot) = v {
            let msg = k.heap.strs[slot].clone();
            self.r.push(loc.clone(), Severity::Fatal, format!("ValueError: {}", msg));
        }
        let r = r as usize;
        if r >= NUM_REG {
            self.frames[1][r - NUM_REG] = v;
        } else {
            self.frames[self.fp][r] = v;
        }
    }

    fn fatal(&mut self, loc: &Loc, msg: impl Into<String>) {
        self.r.push(loc.clone(), Severity::Fatal, msg);
    }

    /// The lowest register index such that every register at or above it in
    /// the current frame is still unwritten. Eval children claim registers
    /// from here.
    fn find_undef(&self) -> u16 {
        let frame = &self.frames[self.fp];
        let mut i = NUM_REG;
        while i > 0 && matches!(frame[i - 1], Value::Undef) {
            i -= 1;
        }
        i as u16
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop_into(&mut self, k: &mut Interp, r: u16, loc: &Loc) {
        if let Some(v) = self.stack.pop() {
            self.set(k, r, v, loc);
        }
    }

    // ===== calls =====

    fn call(&mut self, k: &mut Interp, v: Value, loc: &Loc) {
        let (entry, module) = match v {
            Value::Fn { entry, module, .. } => (entry as i64, module as usize),
            _ => {
                self.fatal(loc, "attempt to call a non-callable object as function");
                return;
            }
        };

        if self.callstack.len() >= MAX_CALL_DEPTH - 1 {
            self.fatal(
                loc,
                format!("program exceeded the maximum call depth of {}", MAX_CALL_DEPTH),
            );
            return;
        }

        tracing::trace!(target: "alder::vm", entry, module, args = self.stack.len(), "call");

        if module != self.module {
            // A foreign function: swap in its module's code and constants,
            // run it to completion, restore.
            let saved_code = Rc::clone(&self.code);
            let saved_ct = self.ct;
            let saved_module = self.module;
            let saved_ip = self.ip;

            self.code = Rc::clone(&k.modules[module].code);
            self.ct = k.modules[module].ct;
            self.module = module;

            self.push_frame();
            self.execute(k, entry);

            self.code = saved_code;
            self.ct = saved_ct;
            self.module = saved_module;
            self.ip = saved_ip;
            return;
        }

        self.push_frame();
        self.callstack.push(CallFrame {
            ret: self.ip,
            func: v,
            args_at_entry: self.stack.len(),
        });
        self.ip = entry - 1;
    }

    fn ret(&mut self) {
        if self.fp == 1 || self.module_of[self.fp] != self.module_of[self.fp - 1] {
            self.returning = true;
            self.pop_frame();
            return;
        }

        self.pop_frame();
        if let Some(frame) = self.callstack.pop() {
            self.ip = frame.ret;
        }
    }

    fn stacktrace(&self, k: &mut Interp) {
        let _ = writeln!(k.err, "Stack trace:");
        let start = self.callstack.len().saturating_sub(10);
        for (i, frame) in self.callstack.iter().enumerate().skip(start).rev() {
            let name = match frame.func {
                Value::Fn { name: Some(slot), .. } => k.heap.strs[slot].clone(),
                _ => "*function*".to_string(),
            };
            let entry = match frame.func {
                Value::Fn { entry, .. } => entry,
                _ => 0,
            };
            let loc = &self.code[frame.ret as usize].loc;
            let _ = writeln!(
                k.err,
                "\t{:2}: <`{}' @{} : {} argument{}> {}:{}:{}",
                i,
                name,
                entry,
                frame.args_at_entry,
                if frame.args_at_entry == 1 { "" } else { "s" },
                loc.file,
                loc.line(),
                loc.column()
            );
        }
        if start != 0 {
            let _ = writeln!(k.err, "\t--- Truncated ---");
        }
    }

    /// Run another loaded module's code on this VM in the current frame
    /// stack; used for `-e` text evaluated as a child of a file's root
    /// scope.
    pub fn run_module(&mut self, k: &mut Interp, module: usize) {
        let saved_code = Rc::clone(&self.code);
        let saved_ct = self.ct;
        let saved_module = self.module;
        let saved_ip = self.ip;

        self.code = Rc::clone(&k.modules[module].code);
        self.ct = k.modules[module].ct;
        self.module = module;
        self.execute(k, 0);

        self.code = saved_code;
        self.ct = saved_ct;
        self.module = saved_module;
        self.ip = saved_ip;
    }

    // ===== eval =====

    /// Compile and run `src` in the lexical scope with the given id,
    /// sharing the current frame above `stack_base`. The child's result
    /// lands in `dest`.
    fn eval(
        &mut self,
        k: &mut Interp,
        dest: u16,
        src: &str,
        scope: i64,
        loc: &Loc,
        stack_base: u16,
    ) {
        tracing::debug!(target: "alder::vm", src, scope, "eval");

        let symtab = k.modules[self.module].symtab;
        let scope_sym = match k.symtabs[symtab].find_from_scope(0, scope as i32) {
            Some(id) => id,
            None => {
                self.fatal(loc, "eval failed: scope not found");
                return;
            }
        };

        let child = match k.load_child(src, self.module, scope_sym, stack_base, "*eval*") {
            Ok(id) => id,
            Err(_) => {
                self.fatal(loc, "eval failed");
                return;
            }
        };

        let saved_code = Rc::clone(&self.code);
        let saved_ct = self.ct;
        let saved_module = self.module;
        let saved_ip = self.ip;

        self.code = Rc::clone(&k.modules[child].code);
        self.ct = k.modules[child].ct;
        self.module = child;
        self.module_of[self.fp] = child;

        self.execute(k, 0);

        self.code = saved_code;
        self.ct = saved_ct;
        self.module = saved_module;
        self.ip = saved_ip;
        self.module_of[self.fp] = saved_module;

        let result = k.stack.pop().unwrap_or(Value::Nil);
        let translated = copy_value(&mut k.heap, result);
        self.set(k, dest, translated, loc);

        // An escape from eval'd `last`/`next` rejoins the parent loop.
        if self.returning {
            if let Some(target) = self.escape_target.take() {
                self.ip = target - 1;
            }
            self.returning = false;
        }

        // Registers the child may have claimed go back to Undef.
        for i in (stack_base as usize)..NUM_REG {
            if i != dest as usize {
                self.frames[self.fp][i] = Value::Undef;
            }
        }
    }

    /// Rewrite an interpolatable string into a concatenation expression and
    /// evaluate it: `"x is $x"` becomes `"x is " + (x)`.
    fn interp(&mut self, k: &mut Interp, dest: u16, raw: &str, scope: i64, loc: &Loc) {
        let src = interp_source(raw);
        let base = self.find_undef();
        self.eval(k, dest, &src, scope, loc, base);
    }

    // ===== regex =====

    fn regex_fatal(&mut self, loc: &Loc, e: crate::regex::RegexError) {
        let mut at = loc.clone();
        at.len = 1;
        self.fatal(&at, format!("regex failed at runtime: {}", e));
    }

    fn do_match(&mut self, k: &mut Interp, e: u16, f: u16, g: u16, loc: &Loc) {
        let (slot, _) = match self.get(g) {
            Value::Regex { slot, evals } => (slot, evals),
            _ => {
                self.fatal(loc, "attempt to apply match to non regular expression value");
                return;
            }
        };
        let subject = match self.get(f) {
            Value::Str(s) => k.heap.strs[s].clone(),
            _ => {
                self.fatal(loc, "attempt to apply regular expression to non-string value");
                return;
            }
        };

        let re = k.heap.regexes[slot].clone();
        let mut out = Array::new();

        if re.cont {
            // Iterative matching: one match per MATCH, from the cursor.
            let vecs = match re.exec_all(&subject) {
                Ok(v) => v,
                Err(err) => return self.regex_fatal(loc, err),
            };
            let next = vecs
                .into_iter()
                .find(|m| m[0] >= re.cursor as i32 && m[0] >= 0);
            match next {
                Some(m) => {
                    let start = m[0].max(0) as usize;
                    let len = m[1].max(0) as usize;
                    let text = subject[start.min(subject.len())
                        ..(start + len).min(subject.len())]
                        .to_string();
                    k.heap.regexes[slot].cursor = start + len.max(1);
                    let ts = k.heap.alloc_str(text);
                    out.push(Value::Str(ts));
                    self.match_vecs = vec![m];
                    self.match_idx = 0;
                }
                None => {
                    self.match_vecs.clear();
                    self.match_idx = -1;
                }
            }
        } else {
            let vecs = match re.exec(&subject) {
                Ok(v) => v,
                Err(err) => return self.regex_fatal(loc, err),
            };
            for m in &vecs {
                let start = m[0].max(0) as usize;
                let len = m[1].max(0) as usize;
                let text = subject
                    [start.min(subject.len())..(start + len).min(subject.len())]
                    .to_string();
                let ts = k.heap.alloc_str(text);
                out.push(Value::Str(ts));
            }
            self.match_idx = vecs.len() as i64 - 1;
            self.match_vecs = vecs;
        }

        self.re_slot = Some(slot);
        self.subject = subject;
        let arr = k.heap.alloc_array(out);
        self.set(k, e, Value::Array(arr), loc);
    }

    fn do_subst(&mut self, k: &mut Interp, e: u16, f: u16, g: u16, scope: u16, loc: &Loc) {
        let (slot, evals) = match self.get(f) {
            Value::Regex { slot, evals } => (slot, evals),
            _ => {
                self.fatal(loc, "substitution requires a regular expression");
                return;
            }
        };
        let subject = match self.get(e) {
            Value::Str(s) => k.heap.strs[s].clone(),
            v => {
                self.fatal(
                    loc,
                    format!("substitution requires a string subject (got {})", v.type_name()),
                );
                return;
            }
        };
        let replacement = match self.get(g) {
            Value::Str(s) => k.heap.strs[s].clone(),
            v => {
                self.fatal(
                    loc,
                    format!("substitution requires a string replacement (got {})", v.type_name()),
                );
                return;
            }
        };

        let re = k.heap.regexes[slot].clone();
        self.re_slot = Some(slot);

        if evals == 0 {
            let result = match re.filter(&subject, &replacement, "$") {
                Ok(Some(s)) => s,
                Ok(None) => subject.clone(),
                Err(err) => return self.regex_fatal(loc, err),
            };
            self.subject = subject;
            let rs = k.heap.alloc_str(result);
            self.set(k, e, Value::Str(rs), loc);
            return;
        }

        // Evaluating substitution: the replacement is compiled as source
        // and evaluated `evals` times per match, `_` bound to the match
        // text, taking the last result.
        let vecs = match re.exec(&subject) {
            Ok(v) => v,
            Err(err) => return self.regex_fatal(loc, err),
        };
        if vecs.is_empty() {
            self.set(k, e, Value::Nil, loc);
            return;
        }

        let bytes = subject.as_bytes();
        let mut out = String::new();
        let mut last_end = 0usize;

        for (i, m) in vecs.iter().enumerate() {
            let start = m[0].max(0) as usize;
            let len = m[1].max(0) as usize;
            out.push_str(&String::from_utf8_lossy(
                &bytes[last_end.min(bytes.len())..start.min(bytes.len())],
            ));
            last_end = (start + len).min(bytes.len());

            let text = subject[start.min(subject.len())..last_end].to_string();
            let mut piece = String::new();
            for _ in 0..evals {
                self.match_vecs = vecs.clone();
                self.match_idx = i as i64;
                self.subject = subject.clone();

                let imp_slot = k.heap.alloc_str(text.clone());
                self.imp.push(Value::Str(imp_slot));
                let base = self.find_undef();
                self.eval(k, g, &replacement, scope as i64, loc, base);
                self.imp.pop();

                if self.r.fatal {
                    return;
                }
                piece = show_value(&k.heap, self.get(g));
            }
            out.push_str(&piece);
        }

        out.push_str(&String::from_utf8_lossy(&bytes[last_end.min(bytes.len())..]));
        self.subject = subject;
        let rs = k.heap.alloc_str(out);
        self.set(k, e, Value::Str(rs), loc);
    }

    fn do_group(&mut self, k: &mut Interp, b: u16, c: u16, loc: &Loc) {
        let n = match self.get(c) {
            Value::Int(n) => n,
            v => {
                self.fatal(loc, format!("group index must be an integer (got {})", v.type_name()));
                return;
            }
        };

        let slot = match self.re_slot {
            Some(slot) => slot,
            None => {
                self.set(k, b, Value::Nil, loc);
                return;
            }
        };

        if n < 0 || n as usize >= k.heap.regexes[slot].num_groups() {
            self.fatal(loc, "group does not exist");
            return;
        }

        if self.match_idx < 0 || self.match_idx as usize >= self.match_vecs.len() {
            self.set(k, b, Value::Nil, loc);
            return;
        }

        let m = &self.match_vecs[self.match_idx as usize];
        let (start, len) = (m[n as usize * 2], m[n as usize * 2 + 1]);
        if start < 0 || len < 0 {
            self.set(k, b, Value::Nil, loc);
            return;
        }
        let start = start as usize;
        let end = (start + len as usize).min(self.subject.len());
        let text = self.subject[start.min(self.subject.len())..end].to_string();
        let ts = k.heap.alloc_str(text);
        self.set(k, b, Value::Str(ts), loc);
    }

    fn do_split(&mut self, k: &mut Interp, e: u16, f: u16, g: u16, loc: &Loc) {
        let slot = match self.get(g) {
            Value::Regex { slot, .. } => slot,
            v => {
                self.fatal(loc, format!("split requires a regex delimiter (got {})", v.type_name()));
                return;
            }
        };
        let subject = match self.get(f) {
            Value::Str(s) => k.heap.strs[s].clone(),
            v => {
                self.fatal(loc, format!("split requires a string subject (got {})", v.type_name()));
                return;
            }
        };

        let re = k.heap.regexes[slot].clone();
        let pieces = match re.split(&subject) {
            Ok(p) => p,
            Err(err) => return self.regex_fatal(loc, err),
        };

        let mut out = Array::new();
        for piece in pieces {
            let s = k.heap.alloc_str(piece);
            out.push(Value::Str(s));
        }
        let arr = k.heap.alloc_array(out);
        self.set(k, e, Value::Array(arr), loc);
    }

    // ===== subscripts =====

    fn subscr(&mut self, k: &mut Interp, e: u16, f: u16, g: u16, loc: &Loc) {
        let base = self.get(f);
        let idx = self.get(g);

        match base {
            Value::Array(slot) => {
                let i = match idx {
                    Value::Int(i) => i,
                    v => {
                        self.fatal(
                            loc,
                            format!("array requires integer subscript (got {})", v.type_name()),
                        );
                        return;
                    }
                };
                let v = if i < 0 || i as usize >= k.heap.arrays[slot].len() {
                    Value::Nil
                } else {
                    k.heap.arrays[slot].v[i as usize]
                };
                self.set(k, e, v, loc);
            }
            Value::Table(slot) => {
                let key = match idx {
                    Value::Str(s) => k.heap.strs[s].clone(),
                    v => {
                        self.fatal(
                            loc,
                            format!("table requires string subscript (got {})", v.type_name()),
                        );
                        return;
                    }
                };
                let v = k.heap.tables[slot].lookup(&key);
                self.set(k, e, v, loc);
            }
            Value::Str(slot) => {
                let i = match idx {
                    Value::Int(i) => i,
                    v => {
                        self.fatal(
                            loc,
                            format!("string requires integer subscript (got {})", v.type_name()),
                        );
                        return;
                    }
                };
                let s = &k.heap.strs[slot];
                let v = if i < 0 || i as usize >= s.len() {
                    Value::Nil
                } else {
                    let c = s.as_bytes()[i as usize];
                    Value::Str(k.heap.alloc_str((c as char).to_string()))
                };
                self.set(k, e, v, loc);
            }
            v => self.fatal(
                loc,
                format!("invalid subscript on unsubscriptable type {}", v.type_name()),
            ),
        }
    }

    fn aset(&mut self, k: &mut Interp, e: u16, f: u16, g: u16, loc: &Loc) {
        let target = self.get(e);
        let idx = self.get(f);
        let val = self.get(g);

        // Writing one position of a string splices in the shown value.
        if let (Value::Str(slot), Value::Int(i)) = (target, idx) {
            let len = k.heap.strs[slot].len();
            if i < 0 || i as usize >= len {
                self.fatal(loc, format!("invalid index into string of length {}", len));
                return;
            }
            let insert = show_value(&k.heap, val);
            let s = &mut k.heap.strs[slot];
            let i = i as usize;
            let mut out = String::with_capacity(s.len() + insert.len());
            out.push_str(&s[..i]);
            out.push_str(&insert);
            out.push_str(&s[i + 1..]);
            *s = out;
            return;
        }

        let target = match (target, idx) {
            (Value::Array(_), Value::Int(_)) | (Value::Table(_), Value::Str(_)) => target,
            (_, Value::Int(_)) => {
                let slot = k.heap.alloc_array(Array::new());
                let v = Value::Array(slot);
                self.set(k, e, v, loc);
                v
            }
            (_, Value::Str(_)) => {
                let slot = k.heap.alloc_table(Table::new());
                let v = Value::Table(slot);
                self.set(k, e, v, loc);
                v
            }
            (_, v) => {
                self.fatal(loc, format!("invalid subscript of type {}", v.type_name()));
                return;
            }
        };

        match (target, idx) {
            (Value::Array(slot), Value::Int(i)) => {
                if i < 0 {
                    self.fatal(loc, "array requires a non-negative subscript");
                    return;
                }
                let a = &mut k.heap.arrays[slot];
                a.grow_to(i as usize + 1);
                a.v[i as usize] = val;
            }
            (Value::Table(slot), Value::Str(key)) => {
                let key = k.heap.strs[key].clone();
                k.heap.tables[slot].add(&key, val);
            }
            _ => unreachable!(),
        }
    }

    /// The lvalue path through a subscript: auto-vivifies nested containers
    /// so `a[0][1] = x` and `t.a.b = x` can build their spine.
    fn deref(&mut self, k: &mut Interp, e: u16, f: u16, g: u16, loc: &Loc) {
        let mut base = self.get(f);
        let idx = self.get(g);

        // A non-container base becomes one, chosen by the subscript kind.
        match (base, idx) {
            (Value::Array(_), Value::Int(_)) | (Value::Table(_), Value::Str(_)) => {}
            (_, Value::Int(_)) => {
                let slot = k.heap.alloc_array(Array::new());
                base = Value::Array(slot);
                self.set(k, f, base, loc);
            }
            (_, Value::Str(_)) => {
                let slot = k.heap.alloc_table(Table::new());
                base = Value::Table(slot);
                self.set(k, f, base, loc);
            }
            _ => {
                self.set(k, e, Value::Nil, loc);
                return;
            }
        }

        match (base, idx) {
            (Value::Array(slot), Value::Int(i)) => {
                if i < 0 {
                    self.fatal(loc, "array requires a non-negative subscript");
                    return;
                }
                let i = i as usize;
                k.heap.arrays[slot].grow_to(i + 1);
                let existing = k.heap.arrays[slot].v[i];
                let v = match existing {
                    Value::Array(_) | Value::Table(_) => existing,
                    _ => {
                        let inner = k.heap.alloc_array(Array::new());
                        k.heap.arrays[slot].v[i] = Value::Array(inner);
                        Value::Array(inner)
                    }
                };
                self.set(k, e, v, loc);
            }
            (Value::Table(slot), Value::Str(key)) => {
                let key = k.heap.strs[key].clone();
                let existing = k.heap.tables[slot].lookup(&key);
                let v = match existing {
                    Value::Array(_) | Value::Table(_) => existing,
                    _ => {
                        let inner = k.heap.alloc_table(Table::new());
                        k.heap.tables[slot].add(&key, Value::Table(inner));
                        Value::Table(inner)
                    }
                };
                self.set(k, e, v, loc);
            }
            _ => self.set(k, e, Value::Nil, loc),
        }
    }

    // ===== execution =====

    pub fn execute(&mut self, k: &mut Interp, start: i64) {
        self.ip = start;
        self.returning = false;
        self.module_of[self.fp] = self.module;
        self.depth += 1;

        loop {
            if self.ip < 0 || self.ip as usize >= self.code.len() {
                break;
            }
            let op = self.code[self.ip as usize].op;
            if matches!(op, Op::End(_) | Op::Eend(_)) || self.fp < 1 || self.returning {
                break;
            }

            if k.opts.print_vm {
                tracing::trace!(
                    target: "alder::vm",
                    "{}:{:6}> {:4}: {:<24?} | sp {:3} | csp {:3} | fp {:3} | imp {:3} | m {}",
                    k.modules[self.module].name,
                    self.step,
                    self.ip,
                    op,
                    self.stack.len(),
                    self.callstack.len(),
                    self.fp,
                    self.imp.len(),
                    self.module
                );
            }

            self.execute_instr(k, op);
            if self.r.fatal {
                break;
            }
            self.ip += 1;
            self.step += 1;
        }

        // Module result: END and EEND name a register; a module-crossing
        // return leaves its value on the operand stack.
        let final_op = if self.ip >= 0 && (self.ip as usize) < self.code.len() {
            Some(self.code[self.ip as usize].op)
        } else {
            None
        };

        if !self.escaping {
            self.returning = false;
        }
        self.escaping = false;

        if !self.r.fatal {
            match final_op {
                Some(Op::End(a)) | Some(Op::Eend(a)) => {
                    let v = self.get(a);
                    k.stack.push(v);
                }
                _ => {
                    let v = self.stack.last().copied().unwrap_or(Value::Nil);
                    k.stack.push(v);
                }
            }
        }

        self.depth -= 1;
        if self.depth == 0 && self.r.pending {
            self.r.write(&mut k.err);
            if !self.callstack.is_empty() {
                self.stacktrace(k);
            }
        }

        if k.opts.print_gc && self.depth == 0 {
            tracing::debug!(target: "alder::heap", "{}", k.heap.stats());
        }
    }

    fn execute_instr(&mut self, k: &mut Interp, op: Op) {
        let loc = self.code[self.ip as usize].loc.clone();

        macro_rules! bin {
            ($f:path, $e:expr, $a:expr, $b:expr) => {{
                let l = self.get($a);
                let r = self.get($b);
                let v = $f(&mut k.heap, l, r);
                self.set(k, $e, v, &loc);
            }};
        }

        match op {
            Op::Nop | Op::Chkstck => {}

            Op::Mov(b, c) => {
                let v = self.get(c);
                self.set(k, b, v, &loc);
            }
            Op::Movc(b, c) => {
                let v = k.cts[self.ct].get(c as usize);
                self.set(k, b, v, &loc);
            }
            Op::Copy(b, c) => {
                let v = self.get(c);
                let v = copy_value(&mut k.heap, v);
                self.set(k, b, v, &loc);
            }
            Op::Copyc(b, c) => {
                let v = k.cts[self.ct].get(c as usize);
                let v = copy_value(&mut k.heap, v);
                self.set(k, b, v, &loc);
            }

            Op::Jmp(d) => self.ip = d as i64 - 1,
            Op::Escape(d) => {
                self.returning = true;
                self.escaping = true;
                self.escape_target = Some(d as i64);
            }

            Op::Cond(a) => {
                if is_truthy(&k.heap, self.get(a)) {
                    self.ip += 1;
                }
            }
            Op::Ncond(a) => {
                if !is_truthy(&k.heap, self.get(a)) {
                    self.ip += 1;
                }
            }

            Op::Push(a) => {
                let v = self.get(a);
                self.push(v);
            }
            Op::Pop(a) => self.pop_into(k, a, &loc),
            Op::Popall(a) => {
                let mut arr = Array::new();
                while let Some(v) = self.stack.pop() {
                    arr.push(v);
                }
                let slot = k.heap.alloc_array(arr);
                self.set(k, a, Value::Array(slot), &loc);
            }

            Op::Call(a) => {
                let v = self.get(a);
                self.call(k, v, &loc);
            }
            Op::Ret => self.ret(),

            Op::Pushimp(a) => {
                let v = self.get(a);
                self.imp.push(v);
            }
            Op::Popimp => {
                if self.imp.pop().is_none() {
                    self.fatal(&loc, "implicit stack underflow");
                }
            }
            Op::Getimp(a) => match self.imp.last().copied() {
                Some(v) => self.set(k, a, v, &loc),
                None => self.fatal(&loc, "the implicit variable is not in scope"),
            },

            Op::Pushback(b, c) => {
                let v = self.get(c);
                match self.get(b) {
                    Value::Array(slot) => k.heap.arrays[slot].push(v),
                    t => self.fatal(
                        &loc,
                        format!("cannot append to a value of type {}", t.type_name()),
                    ),
                }
            }
            Op::Apush(b, c) => {
                let v = self.get(c);
                match self.get(b) {
                    Value::Array(slot) => {
                        let copy = copy_value(&mut k.heap, v);
                        k.heap.arrays[slot].push(copy);
                    }
                    t => self.fatal(
                        &loc,
                        format!(
                            "push builtin requires array as its lefthand argument (got {})",
                            t.type_name()
                        ),
                    ),
                }
            }
            Op::Apop(b, c) => match self.get(c) {
                Value::Array(slot) => {
                    let v = k.heap.arrays[slot].v.pop().unwrap_or(Value::Nil);
                    self.set(k, b, v, &loc);
                }
                t => self.fatal(
                    &loc,
                    format!("pop builtin requires array operand (got {})", t.type_name()),
                ),
            },
            Op::Shift(b, c) => match self.get(c) {
                Value::Array(slot) => {
                    let a = &mut k.heap.arrays[slot];
                    let v = if a.is_empty() { Value::Nil } else { a.v.remove(0) };
                    self.set(k, b, v, &loc);
                }
                t => self.fatal(
                    &loc,
                    format!("shift builtin requires array operand (got {})", t.type_name()),
                ),
            },
            Op::Ins(e, f, g) => {
                let idx = match self.get(f) {
                    Value::Int(i) if i >= 0 => i as usize,
                    v => {
                        self.fatal(
                            &loc,
                            format!("insert requires a non-negative index (got {})", v.type_name()),
                        );
                        return;
                    }
                };
                let v = self.get(g);
                match self.get(e) {
                    Value::Array(slot) => k.heap.arrays[slot].insert(idx, v),
                    t => self.fatal(
                        &loc,
                        format!("insert requires array operand (got {})", t.type_name()),
                    ),
                }
            }

            Op::Aset(e, f, g) => self.aset(k, e, f, g, &loc),
            Op::Deref(e, f, g) => self.deref(k, e, f, g, &loc),
            Op::Subscr(e, f, g) => self.subscr(k, e, f, g, &loc),
            Op::Slice(e, f, g, h, i) => {
                let base = self.get(f);
                let start = self.get(g);
                let stop = self.get(h);
                let step = self.get(i);
                let v = slice_value(&mut k.heap, base, start, stop, step);
                self.set(k, e, v, &loc);
            }

            Op::Match(e, f, g) => self.do_match(k, e, f, g, &loc),
            Op::Subst(e, f, g, h) => self.do_subst(k, e, f, g, h, &loc),
            Op::Split(e, f, g) => self.do_split(k, e, f, g, &loc),
            Op::Group(b, c) => self.do_group(k, b, c, &loc),
            Op::Resetr(a) => match self.get(a) {
                Value::Regex { slot, .. } => k.heap.regexes[slot].reset(),
                t => self.fatal(
                    &loc,
                    format!("cannot reset a value of type {}", t.type_name()),
                ),
            },

            Op::Cmp(e, f, g) => {
                let v = value::cmp_values(&k.heap, self.get(f), self.get(g));
                self.set(k, e, v, &loc);
            }
            Op::Less(e, f, g) => bin!(value::less_values, e, f, g),
            Op::Leq(e, f, g) => bin!(value::leq_values, e, f, g),
            Op::More(e, f, g) => bin!(value::more_values, e, f, g),
            Op::Geq(e, f, g) => bin!(value::geq_values, e, f, g),
            Op::Flip(b, c) => {
                let v = value::flip_value(&k.heap, self.get(c));
                self.set(k, b, v, &loc);
            }

            Op::Add(e, f, g) => bin!(value::add_values, e, f, g),
            Op::Sub(e, f, g) => bin!(value::sub_values, e, f, g),
            Op::Mul(e, f, g) => bin!(value::mul_values, e, f, g),
            Op::Div(e, f, g) => bin!(value::div_values, e, f, g),
            Op::Mod(e, f, g) => bin!(value::mod_values, e, f, g),
            Op::Pow(e, f, g) => bin!(value::pow_values, e, f, g),
            Op::Sleft(e, f, g) => bin!(value::sleft_values, e, f, g),
            Op::Sright(e, f, g) => bin!(value::sright_values, e, f, g),
            Op::Band(e, f, g) => bin!(value::band_values, e, f, g),
            Op::Bor(e, f, g) => bin!(value::bor_values, e, f, g),
            Op::Xor(e, f, g) => bin!(value::bxor_values, e, f, g),

            Op::Inc(a) => {
                let v = value::inc_value(&mut k.heap, self.get(a));
                self.set(k, a, v, &loc);
            }
            Op::Dec(a) => {
                let v = value::dec_value(&mut k.heap, self.get(a));
                self.set(k, a, v, &loc);
            }
            Op::Neg(b, c) => {
                let v = value::neg_value(&mut k.heap, self.get(c));
                self.set(k, b, v, &loc);
            }

            Op::Type(b, c) => {
                let name = self.get(c).type_name();
                let slot = k.heap.alloc_str(name);
                self.set(k, b, Value::Str(slot), &loc);
            }
            Op::Len(b, c) => {
                let v = value::value_len(&mut k.heap, self.get(c));
                self.set(k, b, v, &loc);
            }
            Op::Int(b, c) => match self.get(c) {
                Value::Str(slot) => {
                    let n = value::int_of_str(&k.heap.strs[slot]);
                    self.set(k, b, Value::Int(n), &loc);
                }
                v => self.fatal(
                    &loc,
                    format!("int builtin requires string argument (got {})", v.type_name()),
                ),
            },
            Op::Float(b, c) => match self.get(c) {
                Value::Str(slot) => {
                    let f = value::float_of_str(&k.heap.strs[slot]);
                    self.set(k, b, Value::Float(f), &loc);
                }
                v => self.fatal(
                    &loc,
                    format!("float builtin requires string argument (got {})", v.type_name()),
                ),
            },
            Op::Str(b, c) => {
                let s = show_value(&k.heap, self.get(c));
                let slot = k.heap.alloc_str(s);
                self.set(k, b, Value::Str(slot), &loc);
            }

            Op::Rev(b, c) => match self.get(c) {
                Value::Str(slot) => {
                    let s: String = k.heap.strs[slot].chars().rev().collect();
                    let rs = k.heap.alloc_str(s);
                    self.set(k, b, Value::Str(rs), &loc);
                }
                Value::Array(slot) => {
                    let mut v = k.heap.arrays[slot].v.clone();
                    v.reverse();
                    let rs = k.heap.alloc_array(Array { v });
                    self.set(k, b, Value::Array(rs), &loc);
                }
                t => self.fatal(
                    &loc,
                    format!("reverse requires a string or array operand (got {})", t.type_name()),
                ),
            },
            Op::Sort(b, c) => match self.get(c) {
                Value::Str(slot) => {
                    let mut bytes = k.heap.strs[slot].clone().into_bytes();
                    bytes.sort_unstable();
                    let s = String::from_utf8_lossy(&bytes).into_owned();
                    let rs = k.heap.alloc_str(s);
                    self.set(k, b, Value::Str(rs), &loc);
                }
                Value::Array(slot) => {
                    let mut v = k.heap.arrays[slot].v.clone();
                    v.sort_by(|a, b| value::value_ord(&k.heap, *a, *b));
                    let rs = k.heap.alloc_array(Array { v });
                    self.set(k, b, Value::Array(rs), &loc);
                }
                t => self.fatal(
                    &loc,
                    format!("sort requires a string or array operand (got {})", t.type_name()),
                ),
            },
            Op::Sum(b, c) => match self.get(c) {
                Value::Array(slot) => {
                    let mut sum = 0.0;
                    for v in &k.heap.arrays[slot].v {
                        match v {
                            Value::Int(n) => sum += *n as f64,
                            Value::Float(f) => sum += f,
                            _ => {}
                        }
                    }
                    self.set(k, b, Value::Float(sum), &loc);
                }
                t => self.fatal(
                    &loc,
                    format!("sum builtin requires array operand (got {})", t.type_name()),
                ),
            },
            Op::Abs(b, c) => {
                let v = value::abs_value(&mut k.heap, self.get(c));
                self.set(k, b, v, &loc);
            }

            Op::Uc(b, c) | Op::Lc(b, c) | Op::Ucfirst(b, c) | Op::Lcfirst(b, c) => {
                let s = match self.get(c) {
                    Value::Str(slot) => k.heap.strs[slot].clone(),
                    t => {
                        self.fatal(
                            &loc,
                            format!("case builtin requires string operand (got {})", t.type_name()),
                        );
                        return;
                    }
                };
                let mapped = match op {
                    Op::Uc(..) => s.to_ascii_uppercase(),
                    Op::Lc(..) => s.to_ascii_lowercase(),
                    Op::Ucfirst(..) => first_mapped(&s, true),
                    _ => first_mapped(&s, false),
                };
                let slot = k.heap.alloc_str(mapped);
                self.set(k, b, Value::Str(slot), &loc);
            }

            Op::Keys(b, c) => match self.get(c) {
                Value::Table(slot) => {
                    let keys: Vec<String> =
                        k.heap.tables[slot].iter().map(|(key, _)| key.to_string()).collect();
                    let mut arr = Array::new();
                    for key in keys {
                        let s = k.heap.alloc_str(key);
                        arr.push(Value::Str(s));
                    }
                    let a = k.heap.alloc_array(arr);
                    self.set(k, b, Value::Array(a), &loc);
                }
                t => self.fatal(
                    &loc,
                    format!("keys builtin requires table argument (got {})", t.type_name()),
                ),
            },
            Op::Values(b, c) => match self.get(c) {
                Value::Table(slot) => {
                    let vals: Vec<Value> = k.heap.tables[slot].iter().map(|(_, v)| v).collect();
                    let a = k.heap.alloc_array(Array { v: vals });
                    self.set(k, b, Value::Array(a), &loc);
                }
                t => self.fatal(
                    &loc,
                    format!("values builtin requires table argument (got {})", t.type_name()),
                ),
            },

            Op::Min(a) | Op::Max(a) => {
                let want_max = matches!(op, Op::Max(_));
                let mut items: Vec<Value> = Vec::new();
                while let Some(v) = self.stack.pop() {
                    items.push(v);
                }
                // A single array argument compares its elements.
                if items.len() == 1 {
                    if let Value::Array(slot) = items[0] {
                        items = k.heap.arrays[slot].v.clone();
                    }
                }
                let mut best: Option<Value> = None;
                for v in items {
                    best = Some(match best {
                        None => v,
                        Some(b) => {
                            let ord = value::value_ord(&k.heap, v, b);
                            let take = if want_max {
                                ord == std::cmp::Ordering::Greater
                            } else {
                                ord == std::cmp::Ordering::Less
                            };
                            if take {
                                v
                            } else {
                                b
                            }
                        }
                    });
                }
                self.set(k, a, best.unwrap_or(Value::Nil), &loc);
            }
            Op::Chr(a) => {
                let v = self.stack.pop().unwrap_or(Value::Nil);
                match v {
                    Value::Int(n) => {
                        let s = ((n as u8) as char).to_string();
                        let slot = k.heap.alloc_str(s);
                        self.set(k, a, Value::Str(slot), &loc);
                    }
                    t => self.fatal(
                        &loc,
                        format!("chr builtin requires integer argument (got {})", t.type_name()),
                    ),
                }
            }
            Op::Ord(a) => {
                let v = self.stack.pop().unwrap_or(Value::Nil);
                match v {
                    Value::Str(slot) => {
                        let n = k.heap.strs[slot].as_bytes().first().copied().unwrap_or(0);
                        self.set(k, a, Value::Int(n as i64), &loc);
                    }
                    t => self.fatal(
                        &loc,
                        format!("ord builtin requires string argument (got {})", t.type_name()),
                    ),
                }
            }

            Op::Join(e, f, g) => {
                let delim = show_value(&k.heap, self.get(g));
                match self.get(f) {
                    Value::Array(slot) => {
                        let shown: Vec<String> = k.heap.arrays[slot]
                            .v
                            .clone()
                            .into_iter()
                            .map(|v| show_value(&k.heap, v))
                            .collect();
                        let s = shown.join(&delim);
                        let rs = k.heap.alloc_str(s);
                        self.set(k, e, Value::Str(rs), &loc);
                    }
                    t => self.fatal(
                        &loc,
                        format!("join requires array operand (got {})", t.type_name()),
                    ),
                }
            }

            Op::Range(e, f, g, h) => {
                let from = self.get(f);
                let to = self.get(g);
                let step = self.get(h);
                let v = value::range_value(&mut k.heap, from, to, step);
                self.set(k, e, v, &loc);
            }

            Op::Interp(b, c, scope) => {
                let raw = match k.cts[self.ct].get(c as usize) {
                    Value::Str(slot) => k.heap.strs[slot].clone(),
                    _ => {
                        self.fatal(&loc, "interpolation requires a string constant");
                        return;
                    }
                };
                self.interp(k, b, &raw, scope as i64, &loc);
            }

            Op::Eval(e, f, g) => {
                let src = match self.get(f) {
                    Value::Str(slot) => k.heap.strs[slot].clone(),
                    v => {
                        self.fatal(
                            &loc,
                            format!("eval requires string argument (got {})", v.type_name()),
                        );
                        return;
                    }
                };
                let scope = match self.get(g) {
                    Value::Int(n) => n,
                    _ => {
                        self.fatal(&loc, "eval scope must be an integer");
                        return;
                    }
                };
                let base = self.find_undef();
                self.eval(k, e, &src, scope, &loc, base);
            }

            Op::Kill(a) => {
                let msg = show_value(&k.heap, self.get(a));
                self.r.push(loc, Severity::Killed, msg);
            }

            Op::Print(a) => {
                if k.opts.talkative {
                    let s = print_string(&k.heap, self.get(a));
                    let _ = write!(k.out, "{}", s);
                }
            }
            Op::Line => {
                if k.opts.talkative {
                    let _ = writeln!(k.out);
                }
            }

            Op::End(_) | Op::Eend(_) => unreachable!("terminators are handled by the loop"),
        }
    }
}

fn first_mapped(s: &str, upper: bool) -> String {
    let mut bytes = s.as_bytes().to_vec();
    if let Some(b) = bytes.first_mut() {
        *b = if upper {
            b.to_ascii_uppercase()
        } else {
            b.to_ascii_lowercase()
        };
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Rewrite `"a $x ${e} b"` into `"a " + (x) + (e) + " b"`.
fn interp_source(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::new();
    let mut lit = String::new();
    let mut first = true;
    let mut i = 0;

    let mut flush = |out: &mut String, lit: &mut String, first: &mut bool| {
        if !*first {
            out.push_str(" + ");
        }
        out.push('"');
        for ch in lit.chars() {
            match ch {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                '\r' => out.push_str("\\r"),
                '$' => out.push_str("\\$"),
                c => out.push(c),
            }
        }
        out.push('"');
        *first = false;
        lit.clear();
    };

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            let next = bytes[i + 1];
            if next == b'{' {
                flush(&mut out, &mut lit, &mut first);
                i += 2;
                let start = i;
                let mut depth = 1;
                while i < bytes.len() && depth > 0 {
                    match bytes[i] {
                        b'{' => depth += 1,
                        b'}' => depth -= 1,
                        _ => {}
                    }
                    if depth > 0 {
                        i += 1;
                    }
                }
                out.push_str(" + (");
                out.push_str(&raw[start..i]);
                out.push(')');
                i += 1; // closing brace
                continue;
            }
            if next.is_ascii_digit() {
                flush(&mut out, &mut lit, &mut first);
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                out.push_str(" + (");
                out.push_str(&raw[start..i]);
                out.push(')');
                continue;
            }
            if next.is_ascii_alphabetic() || next == b'_' {
                flush(&mut out, &mut lit, &mut first);
                i += 1;
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                out.push_str(" + (");
                out.push_str(&raw[start..i]);
                out.push(')');
                continue;
            }
        }
        lit.push(bytes[i] as char);
        i += 1;
    }

    if !lit.is_empty() || first {
        flush(&mut out, &mut lit, &mut first);
    }
    out
}

/// `base[start:stop:step]` with clamping; nil bounds follow the step
/// direction, the stop bound is exclusive.
pub fn slice_value(heap: &mut Heap, base: Value, start: Value, stop: Value, step: Value) -> Value {
    let len = match base {
        Value::Array(slot) => heap.arrays[slot].len() as i64,
        Value::Str(slot) => heap.strs[slot].len() as i64,
        v => {
            return value::err(
                heap,
                format!("cannot slice a value of type {}", v.type_name()),
            )
        }
    };

    let step = match step {
        Value::Nil => 1,
        Value::Int(0) => return value::err(heap, "slice step must be nonzero"),
        Value::Int(n) => n,
        v => {
            return value::err(heap, format!("slice step must be an integer (got {})", v.type_name()))
        }
    };

    let norm = |v: Value, default: i64| -> i64 {
        match v {
            Value::Nil => default,
            Value::Int(n) if n < 0 => n + len,
            Value::Int(n) => n,
            Value::Float(f) => f as i64,
            _ => default,
        }
    };

    let (mut i, stop) = if step > 0 {
        (norm(start, 0).clamp(0, len), norm(stop, len).clamp(0, len))
    } else {
        (norm(start, len - 1).clamp(-1, len - 1), norm(stop, -1).clamp(-1, len - 1))
    };

    match base {
        Value::Array(slot) => {
            let mut out = Array::new();
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                out.push(heap.arrays[slot].v[i as usize]);
                i += step;
            }
            Value::Array(heap.alloc_array(out))
        }
        Value::Str(slot) => {
            let bytes = heap.strs[slot].as_bytes().to_vec();
            let mut out = Vec::new();
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                out.push(bytes[i as usize]);
                i += step;
            }
            Value::Str(heap.alloc_str(String::from_utf8_lossy(&out).into_owned()))
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interp_source_rewrites() {
        assert_eq!(interp_source("x is $x"), "\"x is \" + (x)");
        assert_eq!(interp_source("${a + b}!"), "\"\" + (a + b) + \"!\"");
        assert_eq!(interp_source("g=$1"), "\"g=\" + ($1)");
        assert_eq!(interp_source("plain"), "\"plain\"");
    }

    #[test]
    fn test_slice_value() {
        let mut heap = Heap::new();
        let slot = heap.alloc_str("hello");
        let v = slice_value(
            &mut heap,
            Value::Str(slot),
            Value::Int(1),
            Value::Int(4),
            Value::Int(1),
        );
        match v {
            Value::Str(s) => assert_eq!(heap.strs[s], "ell"),
            v => panic!("bad value: {:?}", v),
        }

        // Negative step walks backward.
        let v = slice_value(&mut heap, Value::Str(slot), Value::Nil, Value::Nil, Value::Int(-1));
        match v {
            Value::Str(s) => assert_eq!(heap.strs[s], "olleh"),
            v => panic!("bad value: {:?}", v),
        }
    }

    #[test]
    fn test_slice_clamps() {
        let mut heap = Heap::new();
        let mut arr = Array::new();
        for i in 0..3 {
            arr.push(Value::Int(i));
        }
        let slot = heap.alloc_array(arr);
        let v = slice_value(
            &mut heap,
            Value::Array(slot),
            Value::Int(1),
            Value::Int(99),
            Value::Int(1),
        );
        match v {
            Value::Array(s) => assert_eq!(heap.arrays[s].len(), 2),
            v => panic!("bad value: {:?}", v),
        }
    }
}
