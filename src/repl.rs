// File: src/repl.rs
//
// Interactive REPL for the Slate virtual machine. Reads bytecode assembly
// snippets, executes them against one persistent VM in Interactive context,
// and prints the result register after each evaluation. Features:
// - Multi-line input: an open .fn block continues on the next line
// - Command history with line editing
// - Special commands (:help, :quit, :reset, :globals)
// - VM state (globals, functions, classes) persists across inputs and
//   across runtime errors

use crate::asm;
use crate::builtins;
use crate::value::Value;
use crate::vm::{Context, Vm};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// REPL session holding the persistent VM and the line editor.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        let mut vm = Vm::new();
        vm.set_context(Context::Interactive);
        builtins::install_globals(&mut vm);
        Ok(Repl { vm, editor })
    }

    fn show_banner(&self) {
        println!("{}", format!("Slate VM v{} - interactive", env!("CARGO_PKG_VERSION")).bright_cyan());
        println!(
            "  Enter bytecode assembly; {} for commands, {} to leave.",
            ":help".bright_yellow(),
            ":quit".bright_yellow()
        );
        println!();
    }

    /// Starts the REPL loop.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "slate> ".bright_green().to_string()
            } else {
                "....>  ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    let force = line.trim().is_empty();
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if input_complete(&buffer) || force {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (input discarded, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!();
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles `:command` lines. Returns false when the REPL should quit.
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => false,
            ":reset" | ":r" => {
                let mut vm = Vm::new();
                vm.set_context(Context::Interactive);
                builtins::install_globals(&mut vm);
                self.vm = vm;
                println!("{}", "VM state reset".bright_green());
                true
            }
            ":globals" | ":g" => {
                for name in self.vm.global_names() {
                    match self.vm.global(&name) {
                        Some(value) => println!("  {} = {}", name.bright_yellow(), value),
                        None => println!("  {}", name.bright_yellow()),
                    }
                }
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {} for available commands.",
                    "Error:".bright_red(),
                    command.bright_yellow(),
                    ":help".bright_yellow()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "Commands:".bright_cyan().bold());
        println!("  {}   Display this help", ":help or :h   ".bright_yellow());
        println!("  {}   Exit the REPL", ":quit or :q   ".bright_yellow());
        println!("  {}   Reset the VM (globals, functions)", ":reset or :r  ".bright_yellow());
        println!("  {}   List defined globals", ":globals or :g".bright_yellow());
        println!();
        println!("{}", "Input:".bright_cyan().bold());
        println!("  One instruction per line; `.const` adds to the constant pool,");
        println!("  `.fn` ... `.end` defines a function. A snippet runs once a");
        println!("  top-level HALT or RETURN is entered (or on a blank line).");
        println!("  End a snippet with SET_RESULT; HALT to print its value, e.g.:");
        println!();
        println!("  {}", "slate> .const 40".dimmed());
        println!("  {}", "slate> .const 2".dimmed());
        println!("  {}", "slate> PUSH_CONSTANT 0".dimmed());
        println!("  {}", "slate> PUSH_CONSTANT 1".dimmed());
        println!("  {}", "slate> ADD".dimmed());
        println!("  {}", "slate> SET_RESULT".dimmed());
        println!("  {}", "slate> HALT".dimmed());
        println!("  {}", "=> 42".dimmed());
        println!();
    }

    /// Assembles and runs one snippet. Errors print and leave the VM state
    /// intact for the next prompt.
    fn eval_input(&mut self, source: &str) {
        if source.trim().is_empty() {
            return;
        }

        let program = match asm::assemble(source) {
            Ok(program) => program,
            Err(err) => {
                eprint!("{}", err);
                return;
            }
        };
        let entry = match self.vm.load_program(program) {
            Ok(entry) => entry,
            Err(err) => {
                eprint!("{}", err);
                return;
            }
        };

        // Runtime errors already printed by the Interactive context policy.
        if self.vm.execute(entry).is_ok() {
            if let Some(value) = self.vm.take_result() {
                self.print_value(&value);
            }
        }
    }

    fn print_value(&self, value: &Value) {
        let rendered = match value {
            Value::Str(s) => format!("\"{}\"", s).bright_green(),
            Value::Bool(_) | Value::Null | Value::Undefined => {
                format!("{}", value).bright_magenta()
            }
            other => format!("{}", other).bright_white(),
        };
        println!("{} {}", "=>".bright_blue(), rendered);
    }
}

/// A snippet is complete once every .fn block is closed and a top-level
/// HALT or RETURN has been entered. A blank line runs the buffer as-is.
fn input_complete(buffer: &str) -> bool {
    let mut depth = 0i32;
    let mut terminated = false;
    for line in buffer.lines() {
        let line = line.trim();
        if line.starts_with(".fn") {
            depth += 1;
        } else if line == ".end" {
            depth -= 1;
        } else if depth == 0 {
            let mnemonic = line.split_whitespace().next().unwrap_or("");
            if mnemonic == "HALT" || mnemonic == "RETURN" {
                terminated = true;
            }
        }
    }
    depth <= 0 && terminated
}
