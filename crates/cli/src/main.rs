//! `lumen`: the command-line entry point (spec.md §7).
//!
//! `lumen [flags] [file]`. With no file, runs an interactive REPL (prompt
//! `>>>`, one line per interpretation, blank lines ignored, EOF terminates).
//! With a file, reads it fully, compiles, and runs it. Exit codes: 0 on
//! success, 1 on a usage/open error, 2 on a compile error, 3 on a runtime
//! error. `-s` dumps disassembled bytecode before running.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use lumen_compiler::disassemble_chunk;
use lumen_core::gc::Heap;
use lumen_core::object::ObjKind;
use lumen_core::LumenError;
use lumen_vm::Vm;

#[derive(Parser)]
#[command(name = "lumen")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lumen: a small dynamically-typed scripting language", long_about = None)]
struct Args {
    /// Script to run. Omit to start an interactive REPL.
    file: Option<PathBuf>,

    /// Dump disassembled bytecode before executing it.
    #[arg(short = 's', long = "show-bytecode")]
    show_bytecode: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.file {
        Some(path) => run_file(&path, args.show_bytecode),
        None => run_repl(args.show_bytecode),
    }
}

fn run_file(path: &PathBuf, show_bytecode: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("lumen: can't open {}: {}", path.display(), e);
            return ExitCode::from(1);
        }
    };

    let name = path.display().to_string();
    let mut heap = Heap::new();
    let mut vm = Vm::new(&mut heap);

    if show_bytecode {
        if let Err(errors) = dump_bytecode(&source, &mut heap) {
            report_compile_errors(&name, &errors);
            return ExitCode::from(2);
        }
    }

    match vm.interpret(&mut heap, &source) {
        Ok(()) => ExitCode::from(0),
        Err(LumenError::Compile(errors)) => {
            report_compile_errors(&name, &errors);
            ExitCode::from(2)
        }
        Err(LumenError::Runtime(e)) => {
            report_runtime_error(&name, &e);
            ExitCode::from(3)
        }
    }
}

fn run_repl(show_bytecode: bool) -> ExitCode {
    let mut editor = rustyline::DefaultEditor::new().expect("failed to initialize line editor");
    let mut heap = Heap::new();
    let mut vm = Vm::new(&mut heap);

    loop {
        let line = match editor.readline(">>> ") {
            Ok(line) => line,
            Err(_) => break, // EOF (Ctrl-D) or interrupt terminates the REPL.
        };

        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        if show_bytecode {
            if let Err(errors) = dump_bytecode(&line, &mut heap) {
                report_compile_errors("stdin", &errors);
                continue;
            }
        }

        match vm.interpret(&mut heap, &line) {
            Ok(()) => {}
            Err(LumenError::Compile(errors)) => report_compile_errors("stdin", &errors),
            Err(LumenError::Runtime(e)) => report_runtime_error("stdin", &e),
        }
    }

    ExitCode::from(0)
}

/// Compile `source` purely to print its bytecode; discards the resulting
/// function rather than handing it to a `Vm` (the real run compiles again,
/// since nothing here is cheap enough to be worth threading through).
fn dump_bytecode(source: &str, heap: &mut Heap) -> Result<(), Vec<lumen_core::error::CompileError>> {
    let function = lumen_compiler::compile(source, heap)?;
    match function.kind() {
        ObjKind::Function(f) => {
            eprintln!("{}", disassemble_chunk(&f.chunk, f.display_name()));
        }
        _ => unreachable!("compile() always returns a Function"),
    }
    Ok(())
}

fn report_compile_errors(name: &str, errors: &[lumen_core::error::CompileError]) {
    for e in errors {
        eprintln!("{name}:{e}");
    }
}

fn report_runtime_error(name: &str, e: &lumen_core::error::RuntimeError) {
    eprintln!("{}:{}: runtime error: {}", name, e.line, e.message);
    eprintln!("traceback:");
    for frame in &e.traceback {
        eprintln!("[line {}] in {}", frame.line, frame.name);
    }
}
