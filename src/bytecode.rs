// File: src/bytecode.rs
//
// Bytecode instruction definitions and chunk structures for the Slate VM.
// Instructions are byte-encoded: a 1-byte opcode followed by its fixed-width
// operands, multi-byte operands little-endian. The decoding helpers here are
// shared by the dispatch loop and the disassembler.

use crate::value::{Function, Value};
use num_enum::TryFromPrimitive;
use std::fmt::Write as _;

/// Bytecode opcodes for the Slate VM.
///
/// Stack-effect notation in the doc comments: `a` is the deeper operand,
/// `b` the shallower. Unless stated otherwise an opcode releases what it
/// pops and retains what it pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    // === Constants & literals ===
    /// `PUSH_CONSTANT <k16>`: push constant pool entry k. Bounds-checked.
    PushConstant,
    /// Push the Null literal.
    PushNull,
    /// Push the Undefined literal.
    PushUndefined,
    /// Push boolean true.
    PushTrue,
    /// Push boolean false.
    PushFalse,

    // === Stack shuffles ===
    /// `v ->`: pop and release the top value.
    Pop,
    /// `v -> v, v`: push a retained copy of the top value.
    Dup,
    /// `a, b -> b, a`
    Swap,
    /// `a, b -> a, b, a`
    Over,
    /// `a, b, c -> b, c, a`
    Rot,
    /// `a, b -> b`: release the value below the top.
    Nip,
    /// `POP_N <k8>`: release the top k values.
    PopN,
    /// `POP_N_PRESERVE_TOP <k8>`: release the k values below the top,
    /// keeping the top in place.
    PopNPreserveTop,

    // === Locals, globals, upvalues ===
    /// `GET_LOCAL <s8>`: push a retained copy of frame slot s.
    GetLocal,
    /// `SET_LOCAL <s8>`: peek the top (no pop) into frame slot s.
    SetLocal,
    /// `DEFINE_GLOBAL <k16, imm8>`: pop a value and bind it to the name in
    /// constant k; imm8 marks the binding immutable.
    DefineGlobal,
    /// `SET_GLOBAL <k16>`: peek the top into the named global.
    SetGlobal,
    /// `GET_GLOBAL <k16>`: push a retained copy of the named global.
    GetGlobal,
    /// `GET_UPVALUE <i8>`: push a retained copy of the current closure's
    /// upvalue i.
    GetUpvalue,
    /// `SET_UPVALUE <i8>`: peek the top into the current closure's
    /// upvalue i.
    SetUpvalue,

    // === Arithmetic ===
    /// `a, b -> a + b`: string/array concatenation or numeric addition with
    /// the Int -> BigInt -> Float32 -> Float64 promotion ladder.
    Add,
    /// `a, b -> a - b`
    Subtract,
    /// `a, b -> a * b`
    Multiply,
    /// `a, b -> a / b`: integer operands produce a Float.
    Divide,
    /// `a, b -> a % b`
    Mod,
    /// `a, b -> a ** b`: always produces a Float.
    Power,
    /// `a -> -a`: Int MIN promotes to BigInt.
    Negate,
    /// `a -> a + 1`
    Increment,
    /// `a -> a - 1`
    Decrement,
    /// `a, b -> floor(a / b)`: rounds toward negative infinity.
    FloorDiv,

    // === Bitwise ===
    /// `a, b -> a & b`: operands coerced to signed 32-bit.
    BitAnd,
    /// `a, b -> a | b`
    BitOr,
    /// `a, b -> a ^ b`
    BitXor,
    /// `a -> !a`: bitwise complement.
    BitNot,
    /// `a, b -> a << b`: shift amount taken mod 32.
    LeftShift,
    /// `a, b -> a >> b`: arithmetic shift.
    RightShift,
    /// `a, b -> a >>> b`: zero-filling shift.
    LogicalRightShift,

    // === Comparison & logic ===
    /// `a, b -> bool`: `.equals` on a's class chain if defined, structural
    /// equality otherwise.
    Equal,
    /// `a, b -> bool`: negation of Equal.
    NotEqual,
    /// `a, b -> bool`
    Less,
    /// `a, b -> bool`
    LessEqual,
    /// `a, b -> bool`
    Greater,
    /// `a, b -> bool`
    GreaterEqual,
    /// `a -> bool`: boolean of is_falsy.
    Not,
    /// `a, b -> r`: a if falsy, else b.
    And,
    /// `a, b -> r`: a if truthy, else b.
    Or,
    /// `a, b -> r`: a unless Null or Undefined, else b.
    NullCoalesce,

    // === Construction ===
    /// `BUILD_ARRAY <n16>`: `x1..xn -> arr`, elements in source order.
    BuildArray,
    /// `BUILD_OBJECT <n16>`: `k1, v1, .., kn, vn -> obj`.
    BuildObject,
    /// `BUILD_RANGE <excl16>`: `start, end, step -> range`.
    BuildRange,

    // === Indexing & properties ===
    /// `c, i -> v`: integer index into Array, Buffer, or Str.
    GetIndex,
    /// `c, i, v -> v`: store into Array or Buffer.
    SetIndex,
    /// `obj, name -> v`: property resolution through the class chain.
    GetProperty,
    /// `obj, name, v -> v`: store an Object property.
    SetProperty,

    // === Calls & closures ===
    /// `CALL <argc16>`: `f, a1..an -> result`.
    Call,
    /// `CLOSURE <k16>`: constant k holds a function-table index; captures
    /// upvalues from the enclosing frame/closure and pushes the closure.
    Closure,
    /// `v ->` (caller stack gains v): pop the frame.
    Return,

    // === Control flow ===
    /// `JUMP <off16>`: relative unsigned offset added to the instruction
    /// pointer with 16-bit wrap-around, so backward deltas are encoded as
    /// two's complement.
    Jump,
    /// `JUMP_IF_FALSE <off16>`: pop, test, jump.
    JumpIfFalse,
    /// `JUMP_IF_TRUE <off16>`: pop, test, jump.
    JumpIfTrue,
    /// `LOOP <off16>`: explicit backward jump, offset subtracted.
    Loop,

    // === Diagnostics & termination ===
    /// `SET_DEBUG_LOCATION <k16, line8, col8>`: constant k holds the source
    /// line text; stores the location for subsequent errors.
    SetDebugLocation,
    /// Discard the stored debug location.
    ClearDebugLocation,
    /// `v ->`: move the top into the result register.
    SetResult,
    /// Stop execution successfully.
    Halt,
}

/// Operand layout of an opcode, used by the reader, the disassembler, and
/// the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    Byte,
    Short,
    ShortByte,
    ShortByteByte,
}

impl Op {
    pub fn operands(self) -> Operands {
        match self {
            Op::PushConstant
            | Op::SetGlobal
            | Op::GetGlobal
            | Op::BuildArray
            | Op::BuildObject
            | Op::BuildRange
            | Op::Call
            | Op::Closure
            | Op::Jump
            | Op::JumpIfFalse
            | Op::JumpIfTrue
            | Op::Loop => Operands::Short,
            Op::PopN
            | Op::PopNPreserveTop
            | Op::GetLocal
            | Op::SetLocal
            | Op::GetUpvalue
            | Op::SetUpvalue => Operands::Byte,
            Op::DefineGlobal => Operands::ShortByte,
            Op::SetDebugLocation => Operands::ShortByteByte,
            _ => Operands::None,
        }
    }

    /// Total instruction width in bytes, opcode included.
    pub fn width(self) -> usize {
        match self.operands() {
            Operands::None => 1,
            Operands::Byte => 2,
            Operands::Short => 3,
            Operands::ShortByte => 4,
            Operands::ShortByteByte => 5,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::PushConstant => "PUSH_CONSTANT",
            Op::PushNull => "PUSH_NULL",
            Op::PushUndefined => "PUSH_UNDEFINED",
            Op::PushTrue => "PUSH_TRUE",
            Op::PushFalse => "PUSH_FALSE",
            Op::Pop => "POP",
            Op::Dup => "DUP",
            Op::Swap => "SWAP",
            Op::Over => "OVER",
            Op::Rot => "ROT",
            Op::Nip => "NIP",
            Op::PopN => "POP_N",
            Op::PopNPreserveTop => "POP_N_PRESERVE_TOP",
            Op::GetLocal => "GET_LOCAL",
            Op::SetLocal => "SET_LOCAL",
            Op::DefineGlobal => "DEFINE_GLOBAL",
            Op::SetGlobal => "SET_GLOBAL",
            Op::GetGlobal => "GET_GLOBAL",
            Op::GetUpvalue => "GET_UPVALUE",
            Op::SetUpvalue => "SET_UPVALUE",
            Op::Add => "ADD",
            Op::Subtract => "SUBTRACT",
            Op::Multiply => "MULTIPLY",
            Op::Divide => "DIVIDE",
            Op::Mod => "MOD",
            Op::Power => "POWER",
            Op::Negate => "NEGATE",
            Op::Increment => "INCREMENT",
            Op::Decrement => "DECREMENT",
            Op::FloorDiv => "FLOOR_DIV",
            Op::BitAnd => "BITWISE_AND",
            Op::BitOr => "BITWISE_OR",
            Op::BitXor => "BITWISE_XOR",
            Op::BitNot => "BITWISE_NOT",
            Op::LeftShift => "LEFT_SHIFT",
            Op::RightShift => "RIGHT_SHIFT",
            Op::LogicalRightShift => "LOGICAL_RIGHT_SHIFT",
            Op::Equal => "EQUAL",
            Op::NotEqual => "NOT_EQUAL",
            Op::Less => "LESS",
            Op::LessEqual => "LESS_EQUAL",
            Op::Greater => "GREATER",
            Op::GreaterEqual => "GREATER_EQUAL",
            Op::Not => "NOT",
            Op::And => "AND",
            Op::Or => "OR",
            Op::NullCoalesce => "NULL_COALESCE",
            Op::BuildArray => "BUILD_ARRAY",
            Op::BuildObject => "BUILD_OBJECT",
            Op::BuildRange => "BUILD_RANGE",
            Op::GetIndex => "GET_INDEX",
            Op::SetIndex => "SET_INDEX",
            Op::GetProperty => "GET_PROPERTY",
            Op::SetProperty => "SET_PROPERTY",
            Op::Call => "CALL",
            Op::Closure => "CLOSURE",
            Op::Return => "RETURN",
            Op::Jump => "JUMP",
            Op::JumpIfFalse => "JUMP_IF_FALSE",
            Op::JumpIfTrue => "JUMP_IF_TRUE",
            Op::Loop => "LOOP",
            Op::SetDebugLocation => "SET_DEBUG_LOCATION",
            Op::ClearDebugLocation => "CLEAR_DEBUG_LOCATION",
            Op::SetResult => "SET_RESULT",
            Op::Halt => "HALT",
        }
    }
}

/// One entry of the optional debug table, sorted by byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEntry {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

/// A compiled bytecode chunk: instruction stream, constant pool, and
/// optional debug table.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub debug: Vec<DebugEntry>,
}

impl Chunk {
    pub fn new() -> Self {
        Self { code: Vec::new(), constants: Vec::new(), debug: Vec::new() }
    }

    // --- reader, shared by the dispatch loop and the disassembler ---

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let lo = *self.code.get(offset)? as u16;
        let hi = *self.code.get(offset + 1)? as u16;
        Some(hi << 8 | lo)
    }

    pub fn read_op(&self, offset: usize) -> Option<Op> {
        Op::try_from(self.read_u8(offset)?).ok()
    }

    pub fn constant(&self, index: usize) -> Option<&Value> {
        self.constants.get(index)
    }

    /// Debug-table lookup: the entry governing `offset` is the last entry
    /// at or before it.
    pub fn debug_entry(&self, offset: usize) -> Option<DebugEntry> {
        match self.debug.binary_search_by_key(&offset, |e| e.offset) {
            Ok(i) => Some(self.debug[i]),
            Err(0) => None,
            Err(i) => Some(self.debug[i - 1]),
        }
    }

    // --- emission, used by the assembler and by tests ---

    /// Appends a value to the constant pool and returns its index.
    pub fn add_constant(&mut self, value: Value) -> usize {
        let index = self.constants.len();
        self.constants.push(value);
        index
    }

    pub fn emit_op(&mut self, op: Op) -> usize {
        let at = self.code.len();
        self.code.push(op as u8);
        at
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, short: u16) {
        self.code.extend_from_slice(&short.to_le_bytes());
    }

    /// Emits `op` with a byte operand.
    pub fn emit_byte_op(&mut self, op: Op, operand: u8) -> usize {
        let at = self.emit_op(op);
        self.emit_u8(operand);
        at
    }

    /// Emits `op` with a 16-bit operand.
    pub fn emit_short_op(&mut self, op: Op, operand: u16) -> usize {
        let at = self.emit_op(op);
        self.emit_u16(operand);
        at
    }

    /// Emits a forward jump with a placeholder offset; returns the position
    /// to hand to `patch_jump` once the target is known.
    pub fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let operand_at = self.code.len();
        self.emit_u16(0xffff);
        operand_at
    }

    /// Patches a forward jump emitted by `emit_jump` to land at the current
    /// end of the chunk.
    pub fn patch_jump(&mut self, operand_at: usize) {
        let delta = self.code.len() - (operand_at + 2);
        let bytes = (delta as u16).to_le_bytes();
        self.code[operand_at] = bytes[0];
        self.code[operand_at + 1] = bytes[1];
    }

    /// Emits a LOOP instruction jumping back to `target`.
    pub fn emit_loop(&mut self, target: usize) {
        self.emit_op(Op::Loop);
        let delta = (self.code.len() + 2) - target;
        self.emit_u16(delta as u16);
    }

    pub fn record_debug(&mut self, line: u32, column: u32) {
        let offset = self.code.len();
        self.debug.push(DebugEntry { offset, line, column });
    }
}

/// A complete compiled program: the function table plus the entry point.
/// `CLOSURE` operands index into the function table; the indices are
/// program-relative until `Vm::load_program` rebases them.
#[derive(Debug, Default)]
pub struct Program {
    pub functions: Vec<Function>,
    pub entry: usize,
}

impl Program {
    /// Wraps a single chunk-bearing function as a whole program.
    pub fn from_entry(function: Function) -> Self {
        Self { functions: vec![function], entry: 0 }
    }

    pub fn entry_function(&self) -> &Function {
        &self.functions[self.entry]
    }
}

// === Disassembler ===

/// Renders a human-readable dump of every function in a program.
pub fn disassemble_program(program: &Program) -> String {
    let mut out = String::new();
    for (index, function) in program.functions.iter().enumerate() {
        let name = function.name.as_deref().unwrap_or(if index == program.entry {
            "<main>"
        } else {
            "<anonymous>"
        });
        let _ = writeln!(
            out,
            "== fn {} #{} arity={} locals={} ==",
            name, index, function.arity, function.local_count
        );
        disassemble_chunk(&function.chunk, &mut out);
        out.push('\n');
    }
    out
}

pub fn disassemble_chunk(chunk: &Chunk, out: &mut String) {
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, out);
    }
}

/// Renders one instruction and returns the offset of the next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04}  ", offset);
    let op = match chunk.read_op(offset) {
        Some(op) => op,
        None => {
            let byte = chunk.read_u8(offset).unwrap_or(0);
            let _ = writeln!(out, "??  0x{:02x}", byte);
            return offset + 1;
        }
    };

    match op.operands() {
        Operands::None => {
            let _ = writeln!(out, "{}", op.mnemonic());
        }
        Operands::Byte => {
            let operand = chunk.read_u8(offset + 1).unwrap_or(0);
            let _ = writeln!(out, "{} {}", op.mnemonic(), operand);
        }
        Operands::Short => {
            let operand = chunk.read_u16(offset + 1).unwrap_or(0);
            match op {
                Op::PushConstant => {
                    let constant = chunk
                        .constant(operand as usize)
                        .map(|c| format!("{:?}", c))
                        .unwrap_or_else(|| "<out of range>".into());
                    let _ = writeln!(out, "{} {}  ; {}", op.mnemonic(), operand, constant);
                }
                Op::SetGlobal | Op::GetGlobal => {
                    let name = chunk
                        .constant(operand as usize)
                        .map(|c| format!("{}", c))
                        .unwrap_or_else(|| "<out of range>".into());
                    let _ = writeln!(out, "{} {}  ; {}", op.mnemonic(), operand, name);
                }
                Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue => {
                    let target = (offset + 3) as isize + (operand as i16) as isize;
                    let _ = writeln!(out, "{} {}  ; -> {:04}", op.mnemonic(), operand, target);
                }
                Op::Loop => {
                    let target = (offset + 3).wrapping_sub(operand as usize);
                    let _ = writeln!(out, "{} {}  ; -> {:04}", op.mnemonic(), operand, target);
                }
                _ => {
                    let _ = writeln!(out, "{} {}", op.mnemonic(), operand);
                }
            }
        }
        Operands::ShortByte => {
            let short = chunk.read_u16(offset + 1).unwrap_or(0);
            let byte = chunk.read_u8(offset + 3).unwrap_or(0);
            let name = chunk
                .constant(short as usize)
                .map(|c| format!("{}", c))
                .unwrap_or_else(|| "<out of range>".into());
            let _ = writeln!(out, "{} {} {}  ; {}", op.mnemonic(), short, byte, name);
        }
        Operands::ShortByteByte => {
            let short = chunk.read_u16(offset + 1).unwrap_or(0);
            let line = chunk.read_u8(offset + 3).unwrap_or(0);
            let column = chunk.read_u8(offset + 4).unwrap_or(0);
            let _ = writeln!(out, "{} {} {} {}", op.mnemonic(), short, line, column);
        }
    }

    offset + op.width()
}
