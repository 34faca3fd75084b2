//! Alder — a small dynamically-typed scripting language
//!
//! Source text is lexed, parsed into an AST, resolved into a lexical
//! symbol table, lowered to register bytecode, and run on a stack-framed
//! VM. Strings, arrays, tables and regex objects live on a slot-indexed
//! heap with per-kind bitmap free lists; an embedded backtracking regex
//! engine drives matching, substitution and splitting; `eval` compiles
//! and runs new source inside a caller's lexical scope.

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod heap;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod regex;
pub mod symbol;
pub mod token;
pub mod value;
pub mod vm;

pub use interp::{Interp, LoadError, Options};
pub use value::Value;
pub use vm::Vm;
