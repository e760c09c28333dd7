use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, LevelFilter};

use scriptvm::bytecode::{disassemble, format_instruction};
use scriptvm::diagnostic::{ansi::AnsiRenderer, json, Diagnostic};
use scriptvm::gc::{GcConfig, Heap};
use scriptvm::program::Program;
use scriptvm::vm::{Vm, VmConfig};
use scriptvm::{FuncDef, RunState};

/// Exit code when `--max-cycles` ran out before the program finished.
const EXIT_SUSPENDED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "scriptvm", version, about = "Run and inspect scriptvm bytecode programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a program's entry function and print its result.
    Run(RunArgs),
    /// Print every function's constants and instructions.
    Dis {
        program: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    program: PathBuf,
    /// Stop after this many instructions.
    #[arg(long)]
    max_cycles: Option<u64>,
    /// Log every instruction (at trace level).
    #[arg(long)]
    trace: bool,
    /// Collect garbage before every allocation.
    #[arg(long)]
    gc_stress: bool,
    #[arg(long, default_value_t = 1024)]
    stack_slots: usize,
    #[arg(long, default_value_t = 256)]
    call_slots: usize,
    #[arg(long, value_enum, default_value_t = ErrorFormat::Ansi)]
    error_format: ErrorFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorFormat {
    Ansi,
    Json,
}

fn init_logging(trace: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if trace {
        builder.filter_level(LevelFilter::Trace);
    }
    builder.format_timestamp(None).init();
}

fn emit(format: ErrorFormat, d: &Diagnostic) {
    match format {
        ErrorFormat::Ansi => {
            let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
            eprint!("{}", renderer.render(d));
        }
        ErrorFormat::Json => eprintln!("{}", json::render(d)),
    }
}

fn load(path: &Path, heap: &mut Heap) -> Result<Vec<FuncDef>, Diagnostic> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Diagnostic::error(format!("cannot read {}: {e}", path.display())))?;
    let program = Program::from_json(&text).map_err(|e| Diagnostic::error(e.to_string()))?;
    program.build(heap, true).map_err(|e| Diagnostic::error(e.to_string()))
}

fn run(args: RunArgs) -> i32 {
    init_logging(args.trace);
    let config = VmConfig {
        stack_slots: args.stack_slots,
        call_slots: args.call_slots,
        debug_trace: args.trace,
        gc: GcConfig { stress: args.gc_stress, ..GcConfig::default() },
        ..VmConfig::default()
    };
    let mut vm = Vm::new(config);
    let functions = match load(&args.program, vm.heap_mut()) {
        Ok(f) => f,
        Err(d) => {
            emit(args.error_format, &d);
            return 1;
        }
    };
    debug!("loaded {} functions from {}", functions.len(), args.program.display());

    if let Err(e) = vm.reset(functions) {
        emit(args.error_format, &Diagnostic::from(&e));
        return 1;
    }

    let result = match args.max_cycles {
        Some(n) => vm.run_cycles(n),
        None => vm.run(),
    };

    match vm.state() {
        RunState::Returned => {
            if !result.is_null() {
                println!("{}", vm.heap().to_display(result));
            }
            0
        }
        RunState::Suspended => {
            let d = Diagnostic::warning(format!(
                "program suspended after {} cycles",
                args.max_cycles.unwrap_or_default()
            ))
            .at(vm.function_name(vm.current_function_index()), vm.pc());
            emit(args.error_format, &d);
            EXIT_SUSPENDED
        }
        _ => {
            let Some(fault) = vm.fault() else { return 1 };
            let mut d = Diagnostic::from(fault);
            let word = vm
                .functions()
                .iter()
                .find(|f| f.name == fault.function)
                .and_then(|f| f.code.get(fault.pc));
            if let Some(&word) = word {
                d = d.with_instruction(format_instruction(word));
            }
            emit(args.error_format, &d);
            1
        }
    }
}

fn dis(path: &Path) -> i32 {
    init_logging(false);
    let mut heap = Heap::new();
    match load(path, &mut heap) {
        Ok(functions) => {
            for (i, f) in functions.iter().enumerate() {
                if i > 0 {
                    println!();
                }
                print!("{}", disassemble(f, &heap));
            }
            0
        }
        Err(d) => {
            emit(ErrorFormat::Ansi, &d);
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Dis { program } => dis(&program),
    };
    process::exit(code);
}
