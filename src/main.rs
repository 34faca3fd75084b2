//! The alder command-line interpreter

use std::fs;
use std::process;

use alder::value::{print_string, Value};
use alder::{Interp, Options, Vm};

struct Args {
    options: Options,
    eval: Option<String>,
    path: Option<String>,
}

fn usage() -> ! {
    eprintln!("Usage: alder [options] [file.ald]");
    eprintln!("Options:");
    eprintln!("  -e <src>  Evaluate <src> (after the file, inside its root scope)");
    eprintln!("  -pi       Print the input");
    eprintln!("  -pt       Print the token stream");
    eprintln!("  -pa       Print the AST");
    eprintln!("  -ps       Print the symbol table");
    eprintln!("  -pc       Print the compiled code");
    eprintln!("  -pg       Print GC diagnostics");
    eprintln!("  -pv       Print the VM trace");
    eprintln!("  -p        Print all of the above");
    eprintln!("  -d        Load modules but do not execute");
    eprintln!("  -np       Suppress program output");
    process::exit(1);
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut options = Options::new();
    let mut eval = None;
    let mut path = None;
    let mut print_all = false;

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-pi" => options.print_input = true,
            "-pt" => options.print_tokens = true,
            "-pa" => options.print_ast = true,
            "-ps" => options.print_symbols = true,
            "-pc" => options.print_code = true,
            "-pg" => options.print_gc = true,
            "-pv" => options.print_vm = true,
            "-p" => print_all = true,
            "-d" => options.debug = true,
            "-np" => options.talkative = false,
            "-e" => {
                if eval.is_some() {
                    eprintln!("alder: invalid options; received multiple -e");
                    process::exit(1);
                }
                i += 1;
                if i >= argv.len() {
                    usage();
                }
                eval = Some(argv[i].clone());
            }
            arg if arg.starts_with('-') => {
                eprintln!("alder: unknown option: {}", arg);
                process::exit(1);
            }
            arg => {
                if path.is_some() {
                    eprintln!(
                        "alder: invalid options; received multiple input files; '{}' and '{}'",
                        path.as_deref().unwrap(),
                        arg
                    );
                    process::exit(1);
                }
                path = Some(arg.to_string());
            }
        }
        i += 1;
    }

    if print_all {
        options.print_input = true;
        options.print_tokens = true;
        options.print_ast = true;
        options.print_symbols = true;
        options.print_code = true;
        options.print_gc = true;
        options.print_vm = true;
    }

    if path.is_none() && eval.is_none() {
        eprintln!("alder: invalid options; did not receive an input file");
        process::exit(1);
    }

    Args { options, eval, path }
}

/// The module name is the file name with its extension removed.
fn module_name(path: &str) -> String {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match base.rfind('.') {
        Some(dot) => base[..dot].to_string(),
        None => base.to_string(),
    }
}

fn main() {
    let args = parse_args();

    let trace = args.options.print_vm || args.options.print_gc;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if trace {
            tracing::Level::TRACE
        } else {
            tracing::Level::WARN
        })
        .with_target(false)
        .without_time()
        .init();

    let mut k = Interp::new();
    k.opts = args.options.clone();

    if let Some(path) = &args.path {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("alder: could not load file {}: {}", path, e);
                process::exit(1);
            }
        };

        let id = match k.load_root(&text, path, &module_name(path)) {
            Ok(id) => id,
            Err(_) => process::exit(1),
        };

        let mut vm = Vm::new(&k, id);
        vm.push_frame();
        if !k.opts.debug {
            vm.execute(&mut k, 0);
        }
        if vm.r.fatal {
            process::exit(1);
        }

        // `-e` runs as a child evaluated inside the file's root scope.
        if let Some(src) = &args.eval {
            let root_sym = k.modules[id].root_sym;
            let child = match k.load_child(src, id, root_sym, 0, "*e*") {
                Ok(child) => child,
                Err(_) => process::exit(1),
            };
            vm.push_frame();
            if !k.opts.debug {
                vm.run_module(&mut k, child);
            }
            if vm.r.fatal {
                process::exit(1);
            }
            let v = k.stack.pop().unwrap_or(Value::Nil);
            let shown = print_string(&k.heap, v);
            let _ = writeln_out(&mut k, &shown);
        }
    } else if let Some(src) = &args.eval {
        match k.run_source(src, "e") {
            Ok(v) => {
                let shown = print_string(&k.heap, v);
                let _ = writeln_out(&mut k, &shown);
            }
            Err(_) => process::exit(1),
        }
    }
}

fn writeln_out(k: &mut Interp, s: &str) -> std::io::Result<()> {
    use std::io::Write;
    writeln!(k.out, "{}", s)
}
