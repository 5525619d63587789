// File: src/asm.rs
//
// Text assembler for Slate bytecode, the inverse of the disassembler.
// One instruction per line, `;` comments, `name:` labels, and directives:
//
//   .const <literal>                        add to the current constant pool
//   .fn <name> arity=N [locals=N] [upvalues=local:i,up:j,...]
//   .end                                    close the current .fn block
//
// Literals: integers (i32, overflow or a trailing `b` makes a BigInt),
// floats (`1.5`, `1.5f32`), quoted strings, true/false/null. Lines outside
// a .fn block form the entry chunk. Jump operands may be labels; the
// assembler encodes the relative offset, two's-complement for backward
// jumps.

use crate::bytecode::{Op, Operands, Program};
use crate::errors::{DebugLocation, SlateError};
use crate::value::{Function, UpvalueDescriptor, Value};
use ahash::AHashMap;
use num_bigint::BigInt;
use once_cell::sync::Lazy;
use std::rc::Rc;

static MNEMONICS: Lazy<AHashMap<&'static str, Op>> = Lazy::new(|| {
    (0..=u8::MAX)
        .filter_map(|byte| Op::try_from(byte).ok())
        .map(|op| (op.mnemonic(), op))
        .collect()
});

/// A pending label reference inside one chunk.
struct Fixup {
    operand_at: usize,
    label: String,
    line: usize,
    /// LOOP encodes a subtracted offset and must point backward.
    is_loop: bool,
}

/// Per-chunk assembly state: the function being built, its labels, and
/// unresolved jump operands.
struct FunctionCtx {
    function: Function,
    labels: AHashMap<String, usize>,
    fixups: Vec<Fixup>,
}

impl FunctionCtx {
    fn new(function: Function) -> Self {
        Self { function, labels: AHashMap::new(), fixups: Vec::new() }
    }
}

pub fn assemble(source: &str) -> Result<Program, SlateError> {
    Assembler::new(source).run()
}

struct Assembler<'a> {
    source: &'a str,
    entry: FunctionCtx,
    /// The .fn block currently open, if any.
    open: Option<FunctionCtx>,
    functions: Vec<Function>,
}

impl<'a> Assembler<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            entry: FunctionCtx::new(Function::new(None, 0)),
            open: None,
            functions: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Program, SlateError> {
        let source = self.source;
        for (index, raw_line) in source.lines().enumerate() {
            let lineno = index + 1;
            let line = strip_comment(raw_line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.line(line, lineno)
                .map_err(|err| locate(err, lineno, raw_line))?;
        }
        if self.open.is_some() {
            return Err(SlateError::syntax_error("unterminated .fn block (missing .end)"));
        }
        let mut entry = self.entry;
        resolve_fixups(&mut entry)?;
        let entry_index = self.functions.len();
        let mut functions = self.functions;
        functions.push(entry.function);
        Ok(Program { functions, entry: entry_index })
    }

    fn line(&mut self, line: &str, lineno: usize) -> Result<(), SlateError> {
        if let Some(rest) = line.strip_prefix(".const") {
            let value = parse_literal(rest.trim())?;
            self.current().function.chunk.add_constant(value);
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix(".fn") {
            if self.open.is_some() {
                return Err(SlateError::syntax_error(".fn blocks cannot nest"));
            }
            self.open = Some(FunctionCtx::new(parse_fn_header(rest.trim())?));
            return Ok(());
        }
        if line == ".end" {
            let mut ctx = self
                .open
                .take()
                .ok_or_else(|| SlateError::syntax_error(".end without an open .fn"))?;
            resolve_fixups(&mut ctx)?;
            self.functions.push(ctx.function);
            return Ok(());
        }
        if let Some(label) = line.strip_suffix(':') {
            let label = label.trim();
            if label.is_empty() || label.contains(char::is_whitespace) {
                return Err(SlateError::syntax_error(format!("invalid label '{}'", label)));
            }
            let ctx = self.current();
            let at = ctx.function.chunk.code.len();
            if ctx.labels.insert(label.to_string(), at).is_some() {
                return Err(SlateError::syntax_error(format!("duplicate label '{}'", label)));
            }
            return Ok(());
        }
        self.instruction(line, lineno)
    }

    fn current(&mut self) -> &mut FunctionCtx {
        self.open.as_mut().unwrap_or(&mut self.entry)
    }

    fn instruction(&mut self, line: &str, lineno: usize) -> Result<(), SlateError> {
        let cleaned = line.replace(',', " ");
        let mut tokens = cleaned.split_whitespace();
        let mnemonic = tokens.next().unwrap_or_default();
        let op = *MNEMONICS.get(mnemonic).ok_or_else(|| {
            SlateError::syntax_error(format!("unknown instruction '{}'", mnemonic))
        })?;
        let operands: Vec<&str> = tokens.collect();

        let ctx = self.open.as_mut().unwrap_or(&mut self.entry);
        let chunk = &mut ctx.function.chunk;

        match op.operands() {
            Operands::None => {
                expect_operands(op, &operands, 0)?;
                chunk.emit_op(op);
            }
            Operands::Byte => {
                expect_operands(op, &operands, 1)?;
                let byte = parse_u8(operands[0])?;
                chunk.emit_byte_op(op, byte);
            }
            Operands::Short => {
                expect_operands(op, &operands, 1)?;
                let is_jump =
                    matches!(op, Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue | Op::Loop);
                if is_jump && operands[0].parse::<i64>().is_err() {
                    // Label operand: emit a placeholder and fix up later.
                    chunk.emit_op(op);
                    let operand_at = chunk.code.len();
                    chunk.emit_u16(0xffff);
                    ctx.fixups.push(Fixup {
                        operand_at,
                        label: operands[0].to_string(),
                        line: lineno,
                        is_loop: op == Op::Loop,
                    });
                } else {
                    let short = parse_u16(operands[0])?;
                    chunk.emit_short_op(op, short);
                }
            }
            Operands::ShortByte => {
                expect_operands(op, &operands, 2)?;
                let short = parse_u16(operands[0])?;
                let byte = parse_u8(operands[1])?;
                chunk.emit_short_op(op, short);
                chunk.emit_u8(byte);
            }
            Operands::ShortByteByte => {
                expect_operands(op, &operands, 3)?;
                let short = parse_u16(operands[0])?;
                let line_byte = parse_u8(operands[1])?;
                let col_byte = parse_u8(operands[2])?;
                chunk.emit_short_op(op, short);
                chunk.emit_u8(line_byte);
                chunk.emit_u8(col_byte);
            }
        }
        Ok(())
    }
}

fn locate(err: SlateError, lineno: usize, raw_line: &str) -> SlateError {
    if err.line > 0 {
        return err;
    }
    err.with_location(&DebugLocation::new(lineno, 1, Rc::from(raw_line)))
}

fn resolve_fixups(ctx: &mut FunctionCtx) -> Result<(), SlateError> {
    for fixup in &ctx.fixups {
        let target = *ctx.labels.get(&fixup.label).ok_or_else(|| {
            SlateError::syntax_error(format!(
                "undefined label '{}' (line {})",
                fixup.label, fixup.line
            ))
        })?;
        let after = fixup.operand_at + 2;
        let operand = if fixup.is_loop {
            if target > after {
                return Err(SlateError::syntax_error(format!(
                    "LOOP target '{}' must be backward (line {})",
                    fixup.label, fixup.line
                )));
            }
            (after - target) as u16
        } else {
            let delta = target as i64 - after as i64;
            if delta < i16::MIN as i64 || delta > i16::MAX as i64 {
                return Err(SlateError::syntax_error(format!(
                    "jump to '{}' out of 16-bit range (line {})",
                    fixup.label, fixup.line
                )));
            }
            delta as i16 as u16
        };
        let bytes = operand.to_le_bytes();
        ctx.function.chunk.code[fixup.operand_at] = bytes[0];
        ctx.function.chunk.code[fixup.operand_at + 1] = bytes[1];
    }
    ctx.fixups.clear();
    Ok(())
}

/// Strips a `;` comment, ignoring semicolons inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (at, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..at],
            _ => {}
        }
    }
    line
}

fn expect_operands(op: Op, operands: &[&str], expected: usize) -> Result<(), SlateError> {
    if operands.len() != expected {
        return Err(SlateError::syntax_error(format!(
            "{} expects {} operand(s), got {}",
            op.mnemonic(),
            expected,
            operands.len()
        )));
    }
    Ok(())
}

fn parse_u8(token: &str) -> Result<u8, SlateError> {
    token
        .parse::<u8>()
        .map_err(|_| SlateError::syntax_error(format!("invalid byte operand '{}'", token)))
}

fn parse_u16(token: &str) -> Result<u16, SlateError> {
    if let Ok(short) = token.parse::<u16>() {
        return Ok(short);
    }
    // Negative operands encode as 16-bit two's complement.
    token
        .parse::<i16>()
        .map(|short| short as u16)
        .map_err(|_| SlateError::syntax_error(format!("invalid operand '{}'", token)))
}

/// Parses a `.const` literal.
fn parse_literal(text: &str) -> Result<Value, SlateError> {
    if text.is_empty() {
        return Err(SlateError::syntax_error(".const requires a literal"));
    }
    match text {
        "null" => return Ok(Value::Null),
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if text.starts_with('"') {
        return parse_string_literal(text);
    }
    if let Some(digits) = text.strip_suffix('b') {
        let big = digits.parse::<BigInt>().map_err(|_| {
            SlateError::syntax_error(format!("invalid bigint literal '{}'", text))
        })?;
        return Ok(Value::bigint(big));
    }
    if let Some(digits) = text.strip_suffix("f32") {
        let float = digits.parse::<f32>().map_err(|_| {
            SlateError::syntax_error(format!("invalid float literal '{}'", text))
        })?;
        return Ok(Value::Float32(float));
    }
    if text.contains('.') || text.contains('e') || text.contains('E') {
        let float = text.parse::<f64>().map_err(|_| {
            SlateError::syntax_error(format!("invalid float literal '{}'", text))
        })?;
        return Ok(Value::Float64(float));
    }
    if let Ok(int) = text.parse::<i32>() {
        return Ok(Value::Int(int));
    }
    // Integer literals beyond i32 silently widen.
    text.parse::<BigInt>()
        .map(Value::bigint)
        .map_err(|_| SlateError::syntax_error(format!("invalid literal '{}'", text)))
}

fn parse_string_literal(text: &str) -> Result<Value, SlateError> {
    let inner = text
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| {
            SlateError::syntax_error(format!("unterminated string literal {}", text))
        })?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            other => {
                return Err(SlateError::syntax_error(format!(
                    "unknown escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(Value::str(out))
}

/// Parses `.fn name arity=N [locals=N] [upvalues=local:i,up:j,...]`.
fn parse_fn_header(text: &str) -> Result<Function, SlateError> {
    let mut tokens = text.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| SlateError::syntax_error(".fn requires a name"))?;
    let mut function = Function::new(Some(name.to_string()), 0);
    let mut saw_locals = false;

    for token in tokens {
        let (key, value) = token.split_once('=').ok_or_else(|| {
            SlateError::syntax_error(format!("expected key=value in .fn header, got '{}'", token))
        })?;
        match key {
            "arity" => {
                function.arity = value.parse().map_err(|_| {
                    SlateError::syntax_error(format!("invalid arity '{}'", value))
                })?;
            }
            "locals" => {
                saw_locals = true;
                function.local_count = value.parse().map_err(|_| {
                    SlateError::syntax_error(format!("invalid locals '{}'", value))
                })?;
            }
            "upvalues" => {
                for part in value.split(',').filter(|p| !p.is_empty()) {
                    let descriptor = match part.split_once(':') {
                        Some(("local", index)) => UpvalueDescriptor {
                            is_local: true,
                            index: parse_u8(index)?,
                        },
                        Some(("up", index)) => UpvalueDescriptor {
                            is_local: false,
                            index: parse_u8(index)?,
                        },
                        _ => {
                            return Err(SlateError::syntax_error(format!(
                                "invalid upvalue descriptor '{}'",
                                part
                            )))
                        }
                    };
                    function.upvalues.push(descriptor);
                }
            }
            other => {
                return Err(SlateError::syntax_error(format!(
                    "unknown .fn attribute '{}'",
                    other
                )))
            }
        }
    }
    if !saw_locals {
        function.local_count = function.arity;
    }
    Ok(function)
}
