// File: src/main.rs
//
// Command-line driver for the Slate virtual machine. Dispatches to the
// appropriate subcommand: run a bytecode assembly file, disassemble one,
// or start the interactive REPL.

mod asm;
mod builtins;
mod bytecode;
mod class;
mod errors;
mod repl;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(
    name = "slate",
    about = "Slate: a stack-based bytecode virtual machine",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Slate bytecode assembly file
    Run {
        /// Path to the .slasm file
        file: PathBuf,
    },

    /// Disassemble a Slate bytecode assembly file
    Dis {
        /// Path to the .slasm file
        file: PathBuf,
    },

    /// Launch the interactive REPL
    Repl,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("Failed to read {}: {}", file.display(), err);
                    std::process::exit(1);
                }
            };

            let program = match asm::assemble(&source) {
                Ok(program) => program,
                Err(err) => {
                    eprint!("{}", err);
                    std::process::exit(1);
                }
            };

            let mut vm = vm::Vm::new();
            vm.set_context(vm::Context::Script);
            vm.set_file(file.to_string_lossy());
            builtins::install_globals(&mut vm);

            let entry = match vm.load_program(program) {
                Ok(entry) => entry,
                Err(err) => {
                    eprint!("{}", err);
                    std::process::exit(1);
                }
            };

            // Script context already printed the diagnostic on error.
            if vm.execute(entry).is_err() {
                std::process::exit(1);
            }
        }

        Commands::Dis { file } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("Failed to read {}: {}", file.display(), err);
                    std::process::exit(1);
                }
            };
            match asm::assemble(&source) {
                Ok(program) => print!("{}", bytecode::disassemble_program(&program)),
                Err(err) => {
                    eprint!("{}", err);
                    std::process::exit(1);
                }
            }
        }

        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("REPL error: {}", err);
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("Failed to start REPL: {}", err);
                std::process::exit(1);
            }
        },
    }
}
