//! Interpreter state and module loading
//!
//! The interpreter owns the heap, the per-root-module constant tables and
//! symbol arenas, and the registry of loaded modules. Eval children share
//! their parent's heap, constant table, and symbol arena; only the code
//! vector is their own. Program output and diagnostics go to injectable
//! sinks so tests can capture both.

use std::io::Write;
use std::rc::Rc;

use thiserror::Error;

use crate::bytecode::{print_code, print_constants, ConstantTable, Instr};
use crate::compiler;
use crate::error::Reporter;
use crate::heap::Heap;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::symbol::{SymId, SymbolTable, Symbolizer};
use crate::value::Value;
use crate::vm::Vm;

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub print_input: bool,
    pub print_tokens: bool,
    pub print_ast: bool,
    pub print_symbols: bool,
    pub print_code: bool,
    pub print_gc: bool,
    pub print_vm: bool,
    /// Load modules but do not execute.
    pub debug: bool,
    /// Program output enabled.
    pub talkative: bool,
}

impl Options {
    pub fn new() -> Self {
        Options { talkative: true, ..Options::default() }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("module `{0}' failed to load")]
    Failed(String),
}

#[derive(Debug)]
pub struct Module {
    pub id: usize,
    pub name: String,
    pub path: String,
    pub text: Rc<str>,
    pub code: Rc<[Instr]>,
    /// Constant-table and symbol-arena indices; children share their
    /// parent's.
    pub ct: usize,
    pub symtab: usize,
    pub root_sym: SymId,
    pub parent: Option<usize>,
}

pub struct Interp {
    pub modules: Vec<Module>,
    pub cts: Vec<ConstantTable>,
    pub symtabs: Vec<SymbolTable>,
    pub heap: Heap,
    /// Module-result stack: END/EEND push here.
    pub stack: Vec<Value>,
    pub opts: Options,
    pub out: Box<dyn Write>,
    pub err: Box<dyn Write>,
}

impl Default for Interp {
    fn default() -> Self {
        Interp::new()
    }
}

impl Interp {
    pub fn new() -> Self {
        Interp {
            modules: Vec::new(),
            cts: Vec::new(),
            symtabs: Vec::new(),
            heap: Heap::new(),
            stack: Vec::new(),
            opts: Options::new(),
            out: Box::new(std::io::stdout()),
            err: Box::new(std::io::stderr()),
        }
    }

    pub fn with_output(out: Box<dyn Write>, err: Box<dyn Write>) -> Self {
        Interp { out, err, ..Interp::new() }
    }

    /// Load a root module: lex, parse, symbolize, compile. Diagnostics are
    /// written to the error sink; a fatal batch fails the load.
    pub fn load_root(&mut self, text: &str, path: &str, name: &str) -> Result<usize, LoadError> {
        self.load_module(text, path, name, None)
    }

    /// Load an eval child into its parent's tables. `parent_scope` is the
    /// symbol of the lexical scope the eval occurred in, and `stack_base`
    /// the first register the child may claim.
    pub fn load_child(
        &mut self,
        text: &str,
        parent_module: usize,
        parent_scope: SymId,
        stack_base: u16,
        name: &str,
    ) -> Result<usize, LoadError> {
        self.load_module(text, "*eval*", name, Some((parent_module, parent_scope, stack_base)))
    }

    fn load_module(
        &mut self,
        text: &str,
        path: &str,
        name: &str,
        child: Option<(usize, SymId, u16)>,
    ) -> Result<usize, LoadError> {
        let id = self.modules.len();
        let text: Rc<str> = Rc::from(text);
        let file: Rc<str> = Rc::from(path);
        let mut r = Reporter::new();

        if self.opts.print_input {
            let _ = writeln!(self.err, "{}", text);
        }

        let tokens = Lexer::new(Rc::clone(&text), Rc::clone(&file), &mut r).tokenize();
        if self.opts.print_tokens {
            for t in &tokens {
                let _ = writeln!(
                    self.err,
                    "{:?} at {}:{}",
                    t.token,
                    t.loc.line(),
                    t.loc.column()
                );
            }
        }
        if r.fatal {
            return self.load_failed(r, name);
        }

        let program = Parser::new(tokens, &mut r).parse();
        if r.fatal || program.is_err() {
            return self.load_failed(r, name);
        }
        let mut program = program.unwrap();
        if self.opts.print_ast {
            let _ = writeln!(self.err, "{:#?}", program);
        }

        let (symtab_id, parent_scope) = match child {
            Some((pm, scope, _)) => (self.modules[pm].symtab, Some(scope)),
            None => {
                self.symtabs.push(SymbolTable::new());
                (self.symtabs.len() - 1, None)
            }
        };
        let root_sym = Symbolizer::new(&mut self.symtabs[symtab_id], &mut r, id)
            .run(&mut program, name, parent_scope);
        if r.fatal {
            return self.load_failed(r, name);
        }
        if self.opts.print_symbols {
            self.symtabs[symtab_id].print(&mut self.err, root_sym, 0);
        }

        let (ct_id, stack_base) = match child {
            Some((pm, _, base)) => (self.modules[pm].ct, Some(base)),
            None => {
                self.cts.push(ConstantTable::new());
                (self.cts.len() - 1, None)
            }
        };

        let code = compiler::compile(
            &program,
            &mut self.symtabs[symtab_id],
            &mut self.cts[ct_id],
            &mut self.heap,
            &mut r,
            id,
            root_sym,
            child.is_some(),
            stack_base,
        );
        let code = match code {
            Some(code) => code,
            None => return self.load_failed(r, name),
        };

        if r.pending {
            r.write(&mut self.err);
        }

        if self.opts.print_code {
            print_constants(&mut self.err, &self.cts[ct_id], &self.heap);
            print_code(&mut self.err, &code);
        }

        self.modules.push(Module {
            id,
            name: name.to_string(),
            path: path.to_string(),
            text,
            code: Rc::from(code),
            ct: ct_id,
            symtab: symtab_id,
            root_sym,
            parent: child.map(|(pm, _, _)| pm),
        });
        Ok(id)
    }

    fn load_failed(&mut self, r: Reporter, name: &str) -> Result<usize, LoadError> {
        r.write(&mut self.err);
        Err(LoadError::Failed(name.to_string()))
    }

    /// Compile and run a source string as a root module; the module result
    /// value is returned. Used by tests and by `-e` without a file.
    pub fn run_source(&mut self, src: &str, name: &str) -> Result<Value, LoadError> {
        let id = self.load_root(src, name, name)?;
        if self.opts.debug {
            return Ok(Value::Nil);
        }
        let mut vm = Vm::new(self, id);
        vm.push_frame();
        vm.execute(self, 0);
        if vm.r.fatal {
            return Err(LoadError::Failed(name.to_string()));
        }
        Ok(self.stack.pop().unwrap_or(Value::Nil))
    }

    pub fn gc_stats(&self) -> String {
        self.heap.stats()
    }
}
