// File: src/vm.rs
//
// The Slate virtual machine: operand stack, call frames, global and module
// namespaces, and the fetch-decode-execute loop over byte-encoded chunks.
// Every opcode handler returns Result and propagates with `?`; errors
// unwind to the execute() boundary where the context policy is applied.

use crate::builtins::CoreClasses;
use crate::bytecode::{disassemble_instruction, Op};
use crate::class::Class;
use crate::errors::{DebugLocation, ErrorKind, SlateError};
use crate::value::{
    promote_pair, values_equal, Closure, Function, NumericPair, RangeValue, Value,
};
use ahash::AHashMap;
use colored::Colorize;
use num_bigint::{BigInt, Sign};
use num_traits::cast::ToPrimitive;
use num_traits::{Signed, Zero};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::rc::Rc;

/// Instruction tracing, enabled with SLATE_TRACE=1 in the environment.
static TRACE_ENABLED: Lazy<bool> = Lazy::new(|| std::env::var("SLATE_TRACE").is_ok());

const INITIAL_STACK_CAPACITY: usize = 256;

/// Execution context, selecting the error-propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Print the diagnostic; the driver terminates the process with exit
    /// code 1.
    Script,
    /// Print the diagnostic; VM state survives and control returns to the
    /// prompt.
    Interactive,
    /// No printing; the embedding harness inspects the error record.
    Test,
}

/// Width of the Float produced when integer division has no float operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatWidth {
    F32,
    F64,
}

/// Tunable limits and defaults for a VM instance.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub default_float: FloatWidth,
    pub stack_limit: usize,
    pub frame_limit: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self { default_float: FloatWidth::F64, stack_limit: 16 * 1024, frame_limit: 256 }
    }
}

impl VmOptions {
    pub fn with_default_float(mut self, width: FloatWidth) -> Self {
        self.default_float = width;
        self
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }

    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = limit;
        self
    }
}

/// Per-invocation record: the closure being run, its instruction pointer,
/// and the base of its local slot window on the operand stack.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    slots: usize,
}

/// A module's private namespace. While the module stack is non-empty,
/// DEFINE_GLOBAL writes here instead of the VM globals.
#[derive(Debug, Default)]
pub struct ModuleScope {
    pub name: String,
    globals: AHashMap<String, Value>,
    immutables: AHashMap<String, bool>,
}

impl ModuleScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

/// The Slate virtual machine.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<String, Value>,
    global_immutable: AHashMap<String, bool>,
    /// Registered compiled functions; CLOSURE operands index this table.
    functions: Vec<Rc<Function>>,
    module_stack: Vec<ModuleScope>,
    /// Core classes backing method dispatch on primitive values.
    pub core: CoreClasses,
    context: Context,
    current_debug: Option<DebugLocation>,
    /// Script file name, used in diagnostics.
    file: Option<String>,
    /// REPL result register, written by SET_RESULT.
    result: Option<Value>,
    options: VmOptions,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        Self {
            stack: Vec::with_capacity(INITIAL_STACK_CAPACITY),
            frames: Vec::new(),
            globals: AHashMap::new(),
            global_immutable: AHashMap::new(),
            functions: Vec::new(),
            module_stack: Vec::new(),
            core: CoreClasses::new(),
            context: Context::Script,
            current_debug: None,
            file: None,
            result: None,
            options,
        }
    }

    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn set_file(&mut self, file: impl Into<String>) {
        self.file = Some(file.into());
    }

    /// Registers a compiled function and returns its stable index for use
    /// with CLOSURE.
    pub fn add_function(&mut self, function: Rc<Function>) -> usize {
        let index = self.functions.len();
        self.functions.push(function);
        index
    }

    /// Registers every function of a program, rebasing program-relative
    /// CLOSURE indices onto this VM's function table, and returns the entry
    /// function. Indices stay stable across loads, so an Interactive
    /// session can layer programs without invalidating earlier closures.
    pub fn load_program(&mut self, program: crate::bytecode::Program) -> Result<Rc<Function>, SlateError> {
        let base = self.functions.len();
        let entry_index = program.entry;
        let mut entry = None;
        for (index, mut function) in program.functions.into_iter().enumerate() {
            rebase_closure_constants(&mut function, base)?;
            let function = Rc::new(function);
            self.add_function(Rc::clone(&function));
            if index == entry_index {
                entry = Some(function);
            }
        }
        entry.ok_or_else(|| SlateError::internal_error("program has no entry function"))
    }

    /// Installs a value in the VM global namespace, bypassing context
    /// rules. Used by embedders to provide built-ins.
    pub fn define_global(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.global_immutable.insert(name.clone(), false);
        self.globals.insert(name, value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.lookup_variable(name)
    }

    pub fn global_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.globals.keys().cloned().collect();
        names.sort();
        names
    }

    /// Enters a module namespace. Subsequent DEFINE_GLOBALs write to it.
    pub fn push_module(&mut self, name: impl Into<String>) {
        self.module_stack.push(ModuleScope::new(name));
    }

    /// Leaves the current module namespace, returning it to the loader.
    pub fn pop_module(&mut self) -> Option<ModuleScope> {
        self.module_stack.pop()
    }

    /// The value most recently stored by SET_RESULT, if any.
    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    // === Operand stack ===

    fn push(&mut self, value: Value) -> Result<(), SlateError> {
        if self.stack.len() >= self.options.stack_limit {
            return Err(self.locate(SlateError::internal_error("stack overflow")));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, SlateError> {
        self.stack
            .pop()
            .ok_or_else(|| self.locate(SlateError::internal_error("stack underflow")))
    }

    fn peek(&self, depth: usize) -> Result<&Value, SlateError> {
        if depth >= self.stack.len() {
            return Err(self.locate(SlateError::internal_error("stack underflow")));
        }
        Ok(&self.stack[self.stack.len() - 1 - depth])
    }

    // === Errors ===

    /// Attaches the current debug location and file to an error record.
    /// Falls back to the chunk's debug table when no SET_DEBUG_LOCATION is
    /// in effect.
    fn locate(&self, mut err: SlateError) -> SlateError {
        if let Some(ref debug) = self.current_debug {
            err = err.with_location(debug);
        } else if let Some(frame) = self.frames.last() {
            if let Some(entry) = frame.closure.function.chunk.debug_entry(frame.ip) {
                err.line = entry.line as usize;
                err.column = entry.column as usize;
            }
        }
        if let Some(ref file) = self.file {
            err = err.with_file(file.clone());
        }
        err
    }

    fn type_error(&self, message: impl Into<String>) -> SlateError {
        self.locate(SlateError::type_error(message))
    }

    fn reference_error(&self, message: impl Into<String>) -> SlateError {
        self.locate(SlateError::reference_error(message))
    }

    fn range_error(&self, message: impl Into<String>) -> SlateError {
        self.locate(SlateError::range_error(message))
    }

    fn arithmetic_error(&self, message: impl Into<String>) -> SlateError {
        self.locate(SlateError::arithmetic_error(message))
    }

    fn internal_error(&self, message: impl Into<String>) -> SlateError {
        self.locate(SlateError::internal_error(message))
    }

    /// Standard helper for arithmetic and type errors involving two
    /// operands: the operand type names are appended to the message.
    pub fn runtime_error_with_values(
        &self,
        kind: ErrorKind,
        a: &Value,
        b: &Value,
        message: impl Into<String>,
    ) -> SlateError {
        let message =
            format!("{} ({} and {})", message.into(), a.type_name(), b.type_name());
        self.locate(SlateError::new(kind, message))
    }

    // === Namespaces ===

    fn define_variable(
        &mut self,
        name: &str,
        value: Value,
        immutable: bool,
    ) -> Result<(), SlateError> {
        let duplicate = match self.module_stack.last() {
            Some(module) => module.globals.contains_key(name),
            None => self.globals.contains_key(name),
        };
        if duplicate && self.context != Context::Interactive {
            return Err(self.reference_error(format!("'{}' is already defined", name)));
        }
        match self.module_stack.last_mut() {
            Some(module) => {
                module.globals.insert(name.to_string(), value);
                module.immutables.insert(name.to_string(), immutable);
            }
            None => {
                self.globals.insert(name.to_string(), value);
                self.global_immutable.insert(name.to_string(), immutable);
            }
        }
        Ok(())
    }

    fn set_variable(&mut self, name: &str, value: Value) -> Result<(), SlateError> {
        if value.is_undefined() {
            return Err(self.type_error(format!("cannot assign undefined to '{}'", name)));
        }
        let in_module = self
            .module_stack
            .last()
            .is_some_and(|module| module.globals.contains_key(name));
        if in_module {
            let immutable = self
                .module_stack
                .last()
                .and_then(|module| module.immutables.get(name).copied())
                .unwrap_or(false);
            if immutable {
                return Err(self.type_error(format!("'{}' is immutable", name)));
            }
            if let Some(module) = self.module_stack.last_mut() {
                module.globals.insert(name.to_string(), value);
            }
            return Ok(());
        }
        if self.globals.contains_key(name) {
            if self.global_immutable.get(name).copied().unwrap_or(false) {
                return Err(self.type_error(format!("'{}' is immutable", name)));
            }
            self.globals.insert(name.to_string(), value);
            return Ok(());
        }
        Err(self.reference_error(format!("'{}' is not defined", name)))
    }

    fn lookup_variable(&self, name: &str) -> Option<Value> {
        if let Some(module) = self.module_stack.last() {
            if let Some(value) = module.globals.get(name) {
                return Some(value.clone());
            }
        }
        self.globals.get(name).cloned()
    }

    // === Method dispatch support ===

    /// The class backing method dispatch for a value: the instance's own
    /// class when present, otherwise the core class for its tag.
    pub fn class_of(&self, value: &Value) -> Rc<Class> {
        match value {
            Value::Object(instance) => {
                instance.class().unwrap_or_else(|| Rc::clone(&self.core.object))
            }
            Value::Null | Value::Undefined => Rc::clone(&self.core.null),
            Value::Bool(_) => Rc::clone(&self.core.boolean),
            Value::Int(_) => Rc::clone(&self.core.int),
            Value::BigInt(_) => Rc::clone(&self.core.bigint),
            Value::Float32(_) | Value::Float64(_) => Rc::clone(&self.core.float),
            Value::Str(_) => Rc::clone(&self.core.string),
            Value::Array(_) => Rc::clone(&self.core.array),
            Value::Range(_) => Rc::clone(&self.core.range),
            Value::Buffer(_) => Rc::clone(&self.core.buffer),
            Value::Class(_)
            | Value::Closure(_)
            | Value::Function(_)
            | Value::Native(_)
            | Value::BoundMethod(_) => Rc::clone(&self.core.function),
        }
    }

    /// Property resolution: Class statics first for Class receivers, then
    /// Object own properties, then the class chain's instance properties.
    /// Native hits wrap into BoundMethods; misses yield Undefined.
    pub fn resolve_property(&self, receiver: &Value, name: &str) -> Value {
        if let Value::Class(class) = receiver {
            return class.lookup_static(name).unwrap_or(Value::Undefined);
        }
        if let Value::Object(instance) = receiver {
            if let Some(value) = instance.properties.borrow().get(name) {
                return value.clone();
            }
        }
        let mut found = self.class_of(receiver).lookup_instance(name);
        if found.is_none() {
            // Instances constructed from user classes still answer the core
            // Object prototype.
            if let Value::Object(instance) = receiver {
                if instance.class().is_some() {
                    found = self.core.object.lookup_instance(name);
                }
            }
        }
        match found {
            Some(Value::Native(method)) => {
                Value::BoundMethod(Rc::new(crate::value::BoundMethod {
                    receiver: receiver.clone(),
                    method,
                    name: name.to_string(),
                }))
            }
            Some(value) => value,
            None => Value::Undefined,
        }
    }

    // === Execution ===

    /// Runs a compiled entry function to HALT or error. On error the
    /// frames and operand stack unwind; globals, functions, and core
    /// classes survive for Interactive and Test embeddings.
    pub fn execute(&mut self, entry: Rc<Function>) -> Result<Value, SlateError> {
        self.result = None;
        let closure = Rc::new(Closure::bare(entry));
        let slots = self.stack.len();
        self.frames.push(CallFrame { closure, ip: 0, slots });

        match self.run() {
            Ok(value) => Ok(value),
            Err(err) => {
                self.unwind();
                match self.context {
                    Context::Script | Context::Interactive => eprint!("{}", err),
                    Context::Test => {}
                }
                Err(err)
            }
        }
    }

    fn unwind(&mut self) {
        self.frames.clear();
        self.stack.clear();
        self.current_debug = None;
        self.result = None;
    }

    /// Ends a run: the program result is the result register when
    /// SET_RESULT ran, else the provided return value, else Null. The
    /// register itself stays readable through take_result so embedders can
    /// tell "no result" apart from an explicit Null.
    fn finish(&mut self, returned: Option<Value>) -> Value {
        let value = self.result.clone().or(returned).unwrap_or(Value::Null);
        self.frames.clear();
        self.stack.clear();
        self.current_debug = None;
        value
    }

    fn current_ip(&self) -> Result<(Rc<Function>, usize, usize), SlateError> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| SlateError::internal_error("no active call frame"))?;
        Ok((Rc::clone(&frame.closure.function), frame.ip, frame.slots))
    }

    fn set_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn run(&mut self) -> Result<Value, SlateError> {
        loop {
            let (function, ip, slots) = self.current_ip()?;
            let chunk = &function.chunk;
            let op = match chunk.read_op(ip) {
                Some(op) => op,
                None => {
                    return Err(
                        self.internal_error(format!("invalid opcode at offset {}", ip))
                    )
                }
            };

            if *TRACE_ENABLED {
                let mut line = String::new();
                disassemble_instruction(chunk, ip, &mut line);
                eprint!("{} {}", format!("[{:>3}]", self.stack.len()).dimmed(), line);
            }

            // Operands are decoded up front; jump handlers adjust further.
            let next_ip = ip + op.width();
            self.set_ip(next_ip);

            match op {
                // === Constants & literals ===
                Op::PushConstant => {
                    let index = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    let constant = chunk
                        .constant(index)
                        .cloned()
                        .ok_or_else(|| {
                            self.internal_error(format!("constant {} out of range", index))
                        })?;
                    self.push(constant)?;
                }
                Op::PushNull => self.push(Value::Null)?,
                Op::PushUndefined => self.push(Value::Undefined)?,
                Op::PushTrue => self.push(Value::Bool(true))?,
                Op::PushFalse => self.push(Value::Bool(false))?,

                // === Stack shuffles ===
                Op::Pop => {
                    self.pop()?;
                }
                Op::Dup => {
                    let top = self.peek(0)?.clone();
                    self.push(top)?;
                }
                Op::Swap => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(b)?;
                    self.push(a)?;
                }
                Op::Over => {
                    let a = self.peek(1)?.clone();
                    self.push(a)?;
                }
                Op::Rot => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(b)?;
                    self.push(c)?;
                    self.push(a)?;
                }
                Op::Nip => {
                    let b = self.pop()?;
                    self.pop()?;
                    self.push(b)?;
                }
                Op::PopN => {
                    let count = chunk.read_u8(ip + 1).unwrap_or(0) as usize;
                    for _ in 0..count {
                        self.pop()?;
                    }
                }
                Op::PopNPreserveTop => {
                    let count = chunk.read_u8(ip + 1).unwrap_or(0) as usize;
                    let top = self.pop()?;
                    for _ in 0..count {
                        self.pop()?;
                    }
                    self.push(top)?;
                }

                // === Locals, globals, upvalues ===
                Op::GetLocal => {
                    let slot = chunk.read_u8(ip + 1).unwrap_or(0) as usize;
                    let index = slots + slot;
                    if index >= self.stack.len() {
                        return Err(self.internal_error(format!("local slot {} out of range", slot)));
                    }
                    let value = self.stack[index].clone();
                    self.push(value)?;
                }
                Op::SetLocal => {
                    // Assignments are expressions: the rvalue stays on top.
                    let slot = chunk.read_u8(ip + 1).unwrap_or(0) as usize;
                    let value = self.peek(0)?.clone();
                    let index = slots + slot;
                    if index >= self.stack.len() {
                        return Err(self.internal_error(format!("local slot {} out of range", slot)));
                    }
                    self.stack[index] = value;
                }
                Op::DefineGlobal => {
                    let index = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    let immutable = chunk.read_u8(ip + 3).unwrap_or(0) != 0;
                    let name = self.constant_name(chunk, index)?;
                    let value = self.pop()?;
                    if value.is_undefined() {
                        return Err(
                            self.type_error(format!("cannot assign undefined to '{}'", name))
                        );
                    }
                    self.define_variable(&name, value, immutable)?;
                }
                Op::SetGlobal => {
                    let index = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    let name = self.constant_name(chunk, index)?;
                    let value = self.peek(0)?.clone();
                    self.set_variable(&name, value)?;
                }
                Op::GetGlobal => {
                    let index = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    let name = self.constant_name(chunk, index)?;
                    let value = self
                        .lookup_variable(&name)
                        .ok_or_else(|| self.reference_error(format!("'{}' is not defined", name)))?;
                    self.push(value)?;
                }
                Op::GetUpvalue => {
                    let index = chunk.read_u8(ip + 1).unwrap_or(0) as usize;
                    let closure = Rc::clone(&self.frames.last().unwrap().closure);
                    let value = closure
                        .upvalues
                        .borrow()
                        .get(index)
                        .cloned()
                        .ok_or_else(|| {
                            self.internal_error(format!("upvalue {} out of range", index))
                        })?;
                    self.push(value)?;
                }
                Op::SetUpvalue => {
                    let index = chunk.read_u8(ip + 1).unwrap_or(0) as usize;
                    let value = self.peek(0)?.clone();
                    let closure = Rc::clone(&self.frames.last().unwrap().closure);
                    let mut upvalues = closure.upvalues.borrow_mut();
                    if index >= upvalues.len() {
                        return Err(self.internal_error(format!("upvalue {} out of range", index)));
                    }
                    upvalues[index] = value;
                }

                // === Arithmetic ===
                Op::Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_add(a, b)?;
                    self.push(result)?;
                }
                Op::Subtract => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_subtract(a, b)?;
                    self.push(result)?;
                }
                Op::Multiply => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_multiply(a, b)?;
                    self.push(result)?;
                }
                Op::Divide => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_divide(a, b)?;
                    self.push(result)?;
                }
                Op::Mod => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_mod(a, b)?;
                    self.push(result)?;
                }
                Op::Power => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_power(a, b)?;
                    self.push(result)?;
                }
                Op::FloorDiv => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_floor_div(a, b)?;
                    self.push(result)?;
                }
                Op::Negate => {
                    let a = self.pop()?;
                    let result = self.op_negate(a)?;
                    self.push(result)?;
                }
                Op::Increment => {
                    let a = self.pop()?;
                    let result = self.op_step(a, 1)?;
                    self.push(result)?;
                }
                Op::Decrement => {
                    let a = self.pop()?;
                    let result = self.op_step(a, -1)?;
                    self.push(result)?;
                }

                // === Bitwise ===
                Op::BitAnd | Op::BitOr | Op::BitXor => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let x = self.to_int32(&a, &b)?;
                    let y = self.to_int32(&b, &a)?;
                    let result = match op {
                        Op::BitAnd => x & y,
                        Op::BitOr => x | y,
                        _ => x ^ y,
                    };
                    self.push(Value::Int(result))?;
                }
                Op::BitNot => {
                    let a = self.pop()?;
                    let x = self.to_int32(&a, &a)?;
                    self.push(Value::Int(!x))?;
                }
                Op::LeftShift | Op::RightShift | Op::LogicalRightShift => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let amount = self.to_int32(&b, &a)?;
                    if amount < 0 {
                        return Err(self.range_error("shift amount cannot be negative"));
                    }
                    let amount = (amount as u32) % 32;
                    let x = self.to_int32(&a, &b)?;
                    let result = match op {
                        Op::LeftShift => x.wrapping_shl(amount),
                        Op::RightShift => x.wrapping_shr(amount),
                        _ => ((x as u32).wrapping_shr(amount)) as i32,
                    };
                    self.push(Value::Int(result))?;
                }

                // === Comparison & logic ===
                Op::Equal | Op::NotEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = self.op_equals(&a, &b)?;
                    let result = if op == Op::Equal { equal } else { !equal };
                    self.push(Value::Bool(result))?;
                }
                Op::Less | Op::LessEqual | Op::Greater | Op::GreaterEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self.op_compare(op, a, b)?;
                    self.push(Value::Bool(result))?;
                }
                Op::Not => {
                    let a = self.pop()?;
                    self.push(Value::Bool(a.is_falsy()))?;
                }
                Op::And => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(if a.is_falsy() { a } else { b })?;
                }
                Op::Or => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(if a.is_truthy() { a } else { b })?;
                }
                Op::NullCoalesce => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let keep_a = !matches!(a, Value::Null | Value::Undefined);
                    self.push(if keep_a { a } else { b })?;
                }

                // === Construction ===
                Op::BuildArray => {
                    let count = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    if self.stack.len() < count {
                        return Err(self.internal_error("stack underflow"));
                    }
                    let elements = self.stack.split_off(self.stack.len() - count);
                    if elements.iter().any(Value::is_undefined) {
                        return Err(self.type_error("cannot store undefined in an array"));
                    }
                    self.push(Value::array(elements))?;
                }
                Op::BuildObject => {
                    let count = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    if self.stack.len() < count * 2 {
                        return Err(self.internal_error("stack underflow"));
                    }
                    let mut pairs = self.stack.split_off(self.stack.len() - count * 2);
                    let object = Value::object();
                    if let Value::Object(ref instance) = object {
                        let mut props = instance.properties.borrow_mut();
                        for _ in 0..count {
                            let value = pairs.pop().unwrap();
                            let key = pairs.pop().unwrap();
                            let key = match key {
                                Value::Str(s) => s.to_string(),
                                other => {
                                    return Err(self.type_error(format!(
                                        "object key must be a string, got {}",
                                        other.type_name()
                                    )))
                                }
                            };
                            if value.is_undefined() {
                                return Err(
                                    self.type_error("cannot store undefined in an object")
                                );
                            }
                            props.insert(key, value);
                        }
                    }
                    self.push(object)?;
                }
                Op::BuildRange => {
                    let exclusive = chunk.read_u16(ip + 1).unwrap_or(0) != 0;
                    let step = self.pop()?;
                    let end = self.pop()?;
                    let start = self.pop()?;
                    let range = self.op_build_range(start, end, step, exclusive)?;
                    self.push(range)?;
                }

                // === Indexing & properties ===
                Op::GetIndex => {
                    let index = self.pop()?;
                    let container = self.pop()?;
                    let value = self.op_get_index(container, index)?;
                    self.push(value)?;
                }
                Op::SetIndex => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let container = self.pop()?;
                    self.op_set_index(container, index, value.clone())?;
                    self.push(value)?;
                }
                Op::GetProperty => {
                    let name = self.pop()?;
                    let receiver = self.pop()?;
                    let name = match name {
                        Value::Str(s) => s,
                        other => {
                            return Err(self.type_error(format!(
                                "property name must be a string, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    let value = self.resolve_property(&receiver, &name);
                    self.push(value)?;
                }
                Op::SetProperty => {
                    let value = self.pop()?;
                    let name = self.pop()?;
                    let receiver = self.pop()?;
                    let name = match name {
                        Value::Str(s) => s,
                        other => {
                            return Err(self.type_error(format!(
                                "property name must be a string, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    if value.is_undefined() {
                        return Err(self.type_error("cannot store undefined in an object"));
                    }
                    match receiver {
                        Value::Object(instance) => {
                            instance
                                .properties
                                .borrow_mut()
                                .insert(name.to_string(), value.clone());
                        }
                        other => {
                            return Err(self.type_error(format!(
                                "cannot set property on {}",
                                other.type_name()
                            )))
                        }
                    }
                    self.push(value)?;
                }

                // === Calls & closures ===
                Op::Call => {
                    let argc = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    self.op_call(argc)?;
                }
                Op::Closure => {
                    let index = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    let closure = self.op_closure(chunk, index, slots)?;
                    self.push(closure)?;
                }
                Op::Return => {
                    let value = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| SlateError::internal_error("no active call frame"))?;
                    if self.frames.is_empty() {
                        return Ok(self.finish(Some(value)));
                    }
                    self.stack.truncate(frame.slots);
                    self.push(value)?;
                }

                // === Control flow ===
                Op::Jump => {
                    let offset = chunk.read_u16(ip + 1).unwrap_or(0);
                    self.jump_relative(next_ip, offset, chunk.code.len())?;
                }
                Op::JumpIfFalse => {
                    let offset = chunk.read_u16(ip + 1).unwrap_or(0);
                    let condition = self.pop()?;
                    if condition.is_falsy() {
                        self.jump_relative(next_ip, offset, chunk.code.len())?;
                    }
                }
                Op::JumpIfTrue => {
                    let offset = chunk.read_u16(ip + 1).unwrap_or(0);
                    let condition = self.pop()?;
                    if condition.is_truthy() {
                        self.jump_relative(next_ip, offset, chunk.code.len())?;
                    }
                }
                Op::Loop => {
                    let offset = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    if offset > next_ip {
                        return Err(self.internal_error("loop target before start of chunk"));
                    }
                    self.set_ip(next_ip - offset);
                }

                // === Diagnostics & termination ===
                Op::SetDebugLocation => {
                    let index = chunk.read_u16(ip + 1).unwrap_or(0) as usize;
                    let line = chunk.read_u8(ip + 3).unwrap_or(0) as usize;
                    let column = chunk.read_u8(ip + 4).unwrap_or(0) as usize;
                    let source_line = match chunk.constant(index) {
                        Some(Value::Str(s)) => Rc::clone(s),
                        _ => {
                            return Err(self.internal_error(
                                "SET_DEBUG_LOCATION constant must be a string",
                            ))
                        }
                    };
                    self.current_debug = Some(DebugLocation::new(line, column, source_line));
                }
                Op::ClearDebugLocation => {
                    self.current_debug = None;
                }
                Op::SetResult => {
                    let value = self.pop()?;
                    self.result = Some(value);
                }
                Op::Halt => {
                    return Ok(self.finish(None));
                }
            }
        }
    }

    fn constant_name(&self, chunk: &crate::bytecode::Chunk, index: usize) -> Result<Rc<str>, SlateError> {
        match chunk.constant(index) {
            Some(Value::Str(s)) => Ok(Rc::clone(s)),
            Some(other) => Err(self.internal_error(format!(
                "name constant must be a string, got {}",
                other.type_name()
            ))),
            None => Err(self.internal_error(format!("constant {} out of range", index))),
        }
    }

    fn jump_relative(
        &mut self,
        from: usize,
        offset: u16,
        code_len: usize,
    ) -> Result<(), SlateError> {
        // Backward jumps arrive as the two's-complement encoding of the
        // negative delta.
        let target = from as i64 + (offset as i16) as i64;
        if target < 0 || target as usize > code_len {
            return Err(self.internal_error("jump target out of range"));
        }
        self.set_ip(target as usize);
        Ok(())
    }

    // === Arithmetic handlers ===

    fn make_default_float(&self, value: f64) -> Value {
        match self.options.default_float {
            FloatWidth::F32 => Value::Float32(value as f32),
            FloatWidth::F64 => Value::Float64(value),
        }
    }

    fn op_add(&mut self, a: Value, b: Value) -> Result<Value, SlateError> {
        if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
            return Ok(Value::str(format!("{}{}", a, b)));
        }
        if let (Value::Array(x), Value::Array(y)) = (&a, &b) {
            let mut combined = x.borrow().clone();
            combined.extend(y.borrow().iter().cloned());
            return Ok(Value::array(combined));
        }
        match promote_pair(&a, &b) {
            Some(NumericPair::Int(x, y)) => Ok(match x.checked_add(y) {
                Some(n) => Value::Int(n),
                None => Value::bigint(BigInt::from(x) + BigInt::from(y)),
            }),
            Some(NumericPair::Big(x, y)) => Ok(Value::bigint(x + y)),
            Some(NumericPair::F32(x, y)) => Ok(Value::Float32(x + y)),
            Some(NumericPair::F64(x, y)) => Ok(Value::Float64(x + y)),
            None => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &a,
                &b,
                "cannot add operands",
            )),
        }
    }

    fn op_subtract(&mut self, a: Value, b: Value) -> Result<Value, SlateError> {
        match promote_pair(&a, &b) {
            Some(NumericPair::Int(x, y)) => Ok(match x.checked_sub(y) {
                Some(n) => Value::Int(n),
                None => Value::bigint(BigInt::from(x) - BigInt::from(y)),
            }),
            Some(NumericPair::Big(x, y)) => Ok(Value::bigint(x - y)),
            Some(NumericPair::F32(x, y)) => Ok(Value::Float32(x - y)),
            Some(NumericPair::F64(x, y)) => Ok(Value::Float64(x - y)),
            None => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &a,
                &b,
                "cannot subtract operands",
            )),
        }
    }

    fn op_multiply(&mut self, a: Value, b: Value) -> Result<Value, SlateError> {
        match promote_pair(&a, &b) {
            Some(NumericPair::Int(x, y)) => Ok(match x.checked_mul(y) {
                Some(n) => Value::Int(n),
                None => Value::bigint(BigInt::from(x) * BigInt::from(y)),
            }),
            Some(NumericPair::Big(x, y)) => Ok(Value::bigint(x * y)),
            Some(NumericPair::F32(x, y)) => Ok(Value::Float32(x * y)),
            Some(NumericPair::F64(x, y)) => Ok(Value::Float64(x * y)),
            None => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &a,
                &b,
                "cannot multiply operands",
            )),
        }
    }

    fn is_zero_number(value: &Value) -> bool {
        match value {
            Value::Int(n) => *n == 0,
            Value::BigInt(n) => n.is_zero(),
            Value::Float32(f) => *f == 0.0,
            Value::Float64(f) => *f == 0.0,
            _ => false,
        }
    }

    fn op_divide(&mut self, a: Value, b: Value) -> Result<Value, SlateError> {
        if b.is_number() && Self::is_zero_number(&b) {
            return Err(self.arithmetic_error("Division by zero"));
        }
        match promote_pair(&a, &b) {
            Some(NumericPair::Int(x, y)) => Ok(self.make_default_float(x as f64 / y as f64)),
            Some(NumericPair::Big(x, y)) => {
                let x = x.to_f64().unwrap_or(f64::NAN);
                let y = y.to_f64().unwrap_or(f64::NAN);
                Ok(self.make_default_float(x / y))
            }
            Some(NumericPair::F32(x, y)) => Ok(Value::Float32(x / y)),
            Some(NumericPair::F64(x, y)) => Ok(Value::Float64(x / y)),
            None => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &a,
                &b,
                "cannot divide operands",
            )),
        }
    }

    fn op_mod(&mut self, a: Value, b: Value) -> Result<Value, SlateError> {
        if b.is_number() && Self::is_zero_number(&b) {
            return Err(self.arithmetic_error("Modulo by zero"));
        }
        match promote_pair(&a, &b) {
            Some(NumericPair::Int(x, y)) => Ok(Value::Int(x.checked_rem(y).unwrap_or(0))),
            Some(NumericPair::Big(x, y)) => Ok(Value::bigint(x % y)),
            Some(NumericPair::F32(x, y)) => Ok(Value::Float32(x % y)),
            Some(NumericPair::F64(x, y)) => Ok(Value::Float64(x % y)),
            None => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &a,
                &b,
                "cannot take modulo of operands",
            )),
        }
    }

    fn op_power(&mut self, a: Value, b: Value) -> Result<Value, SlateError> {
        match promote_pair(&a, &b) {
            Some(NumericPair::F64(x, y)) => Ok(Value::Float64(x.powf(y))),
            Some(NumericPair::F32(x, y)) => Ok(Value::Float32(x.powf(y))),
            Some(NumericPair::Int(x, y)) => {
                Ok(self.make_default_float((x as f64).powf(y as f64)))
            }
            Some(NumericPair::Big(x, y)) => {
                let x = x.to_f64().unwrap_or(f64::NAN);
                let y = y.to_f64().unwrap_or(f64::NAN);
                Ok(self.make_default_float(x.powf(y)))
            }
            None => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &a,
                &b,
                "cannot raise operands",
            )),
        }
    }

    fn op_floor_div(&mut self, a: Value, b: Value) -> Result<Value, SlateError> {
        if b.is_number() && Self::is_zero_number(&b) {
            return Err(self.arithmetic_error("Division by zero"));
        }
        match promote_pair(&a, &b) {
            Some(NumericPair::Int(x, y)) => Ok(match floor_div_i32(x, y) {
                Some(n) => Value::Int(n),
                None => Value::bigint(floor_div_big(BigInt::from(x), BigInt::from(y))),
            }),
            Some(NumericPair::Big(x, y)) => Ok(Value::bigint(floor_div_big(x, y))),
            Some(NumericPair::F32(x, y)) => Ok(Value::Float32((x / y).floor())),
            Some(NumericPair::F64(x, y)) => Ok(Value::Float64((x / y).floor())),
            None => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &a,
                &b,
                "cannot divide operands",
            )),
        }
    }

    fn op_negate(&mut self, a: Value) -> Result<Value, SlateError> {
        match a {
            Value::Int(n) => Ok(match n.checked_neg() {
                Some(m) => Value::Int(m),
                None => Value::bigint(-BigInt::from(n)),
            }),
            Value::BigInt(n) => Ok(Value::bigint(-(*n).clone())),
            Value::Float32(f) => Ok(Value::Float32(-f)),
            Value::Float64(f) => Ok(Value::Float64(-f)),
            other => {
                Err(self.type_error(format!("cannot negate {}", other.type_name())))
            }
        }
    }

    fn op_step(&mut self, a: Value, delta: i32) -> Result<Value, SlateError> {
        match a {
            Value::Int(n) => Ok(match n.checked_add(delta) {
                Some(m) => Value::Int(m),
                None => Value::bigint(BigInt::from(n) + delta),
            }),
            Value::BigInt(n) => Ok(Value::bigint((*n).clone() + delta)),
            Value::Float32(f) => Ok(Value::Float32(f + delta as f32)),
            Value::Float64(f) => Ok(Value::Float64(f + delta as f64)),
            other => Err(self.type_error(format!(
                "cannot {} {}",
                if delta > 0 { "increment" } else { "decrement" },
                other.type_name()
            ))),
        }
    }

    /// Coercion to signed 32-bit for the bitwise family. `other` is only
    /// used for the error message.
    fn to_int32(&self, value: &Value, other: &Value) -> Result<i32, SlateError> {
        match value {
            Value::Int(n) => Ok(*n),
            Value::BigInt(n) => {
                let modulus = BigInt::from(1u64 << 32);
                let mut low = (**n).clone() % &modulus;
                if low.sign() == Sign::Minus {
                    low += &modulus;
                }
                Ok(low.to_u32().unwrap_or(0) as i32)
            }
            Value::Float32(f) => Ok((*f as f64).trunc() as i64 as i32),
            Value::Float64(f) => Ok(f.trunc() as i64 as i32),
            _ => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                value,
                other,
                "bitwise operand must be numeric",
            )),
        }
    }

    fn op_equals(&mut self, a: &Value, b: &Value) -> Result<bool, SlateError> {
        // `.equals` on the left operand's class chain takes precedence over
        // structural equality.
        if let Some(Value::Native(method)) = self.class_of(a).lookup_instance("equals") {
            let result = method(self, &[a.clone(), b.clone()])?;
            return Ok(result.is_truthy());
        }
        Ok(values_equal(a, b))
    }

    fn op_compare(&mut self, op: Op, a: Value, b: Value) -> Result<bool, SlateError> {
        use std::cmp::Ordering;
        let ordering = if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
            Some(x.as_bytes().cmp(y.as_bytes()))
        } else {
            match promote_pair(&a, &b) {
                Some(NumericPair::Int(x, y)) => x.partial_cmp(&y),
                Some(NumericPair::Big(x, y)) => x.partial_cmp(&y),
                Some(NumericPair::F32(x, y)) => x.partial_cmp(&y),
                Some(NumericPair::F64(x, y)) => x.partial_cmp(&y),
                None => {
                    return Err(self.runtime_error_with_values(
                        ErrorKind::Type,
                        &a,
                        &b,
                        "cannot order operands",
                    ))
                }
            }
        };
        // NaN comparisons are false for every ordering operator.
        Ok(match ordering {
            None => false,
            Some(ordering) => match op {
                Op::Less => ordering == Ordering::Less,
                Op::LessEqual => ordering != Ordering::Greater,
                Op::Greater => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            },
        })
    }

    fn op_build_range(
        &mut self,
        start: Value,
        end: Value,
        step: Value,
        exclusive: bool,
    ) -> Result<Value, SlateError> {
        if !start.is_number() || !end.is_number() || !step.is_number() {
            return Err(self.runtime_error_with_values(
                ErrorKind::Type,
                &start,
                &end,
                "range bounds must be numeric",
            ));
        }
        if Self::is_zero_number(&step) {
            return Err(self.range_error("range step cannot be zero"));
        }
        let descending = matches!(
            self.op_compare(Op::Greater, start.clone(), end.clone()),
            Ok(true)
        );
        let step_negative = match &step {
            Value::Int(n) => *n < 0,
            Value::BigInt(n) => n.is_negative(),
            Value::Float32(f) => *f < 0.0,
            Value::Float64(f) => *f < 0.0,
            _ => false,
        };
        // The compiler's default step is literal 1; a descending range
        // flips it rather than erroring.
        let step = if descending && matches!(step, Value::Int(1)) {
            Value::Int(-1)
        } else if descending && !step_negative {
            return Err(self.range_error("range step has wrong direction"));
        } else if !descending && step_negative {
            return Err(self.range_error("range step has wrong direction"));
        } else {
            step
        };
        Ok(Value::Range(Rc::new(RangeValue { start, end, step, exclusive })))
    }

    fn op_get_index(&mut self, container: Value, index: Value) -> Result<Value, SlateError> {
        match container {
            Value::Array(elements) => {
                let i = self.index_value(&index, &Value::Array(Rc::clone(&elements)))?;
                let elements = elements.borrow();
                if i < 0 || i as usize >= elements.len() {
                    return Err(self.range_error(format!(
                        "array index {} out of bounds (length {})",
                        i,
                        elements.len()
                    )));
                }
                Ok(elements[i as usize].clone())
            }
            Value::Buffer(bytes) => {
                let i = self.index_value(&index, &Value::Buffer(Rc::clone(&bytes)))?;
                let bytes = bytes.borrow();
                if i < 0 || i as usize >= bytes.len() {
                    return Err(self.range_error(format!(
                        "buffer index {} out of bounds (length {})",
                        i,
                        bytes.len()
                    )));
                }
                Ok(Value::Int(bytes[i as usize] as i32))
            }
            Value::Str(s) => {
                let i = self.index_value(&index, &Value::Str(Rc::clone(&s)))?;
                if i < 0 {
                    return Ok(Value::Null);
                }
                Ok(s.chars()
                    .nth(i as usize)
                    .map(|c| Value::str(c.to_string()))
                    .unwrap_or(Value::Null))
            }
            other => Err(self.type_error(format!("cannot index {}", other.type_name()))),
        }
    }

    fn op_set_index(
        &mut self,
        container: Value,
        index: Value,
        value: Value,
    ) -> Result<(), SlateError> {
        if value.is_undefined() {
            return Err(self.type_error("cannot store undefined in an array"));
        }
        match container {
            Value::Array(elements) => {
                let i = self.index_value(&index, &Value::Array(Rc::clone(&elements)))?;
                let mut elements = elements.borrow_mut();
                if i < 0 || i as usize >= elements.len() {
                    return Err(self.range_error(format!(
                        "array index {} out of bounds (length {})",
                        i,
                        elements.len()
                    )));
                }
                elements[i as usize] = value;
                Ok(())
            }
            Value::Buffer(bytes) => {
                let i = self.index_value(&index, &Value::Buffer(Rc::clone(&bytes)))?;
                let byte = match value {
                    Value::Int(n) if (0..=255).contains(&n) => n as u8,
                    other => {
                        return Err(self.range_error(format!(
                            "buffer element must be an integer in 0..=255, got {}",
                            other
                        )))
                    }
                };
                let mut bytes = bytes.borrow_mut();
                if i < 0 || i as usize >= bytes.len() {
                    return Err(self.range_error(format!(
                        "buffer index {} out of bounds (length {})",
                        i,
                        bytes.len()
                    )));
                }
                bytes[i as usize] = byte;
                Ok(())
            }
            Value::Str(_) => Err(self.type_error("strings are immutable")),
            other => Err(self.type_error(format!("cannot index {}", other.type_name()))),
        }
    }

    fn index_value(&self, index: &Value, container: &Value) -> Result<i64, SlateError> {
        match index {
            Value::Int(n) => Ok(*n as i64),
            other => Err(self.runtime_error_with_values(
                ErrorKind::Type,
                container,
                other,
                "index must be an integer",
            )),
        }
    }

    // === Calls ===

    /// CALL dispatch: operands are popped up front so error paths never
    /// leave them on the stack.
    fn op_call(&mut self, argc: usize) -> Result<(), SlateError> {
        if self.stack.len() < argc + 1 {
            return Err(self.internal_error("stack underflow"));
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let callee = self.pop()?;

        match callee {
            Value::BoundMethod(bound) => {
                let mut full_args = Vec::with_capacity(argc + 1);
                full_args.push(bound.receiver.clone());
                full_args.extend(args);
                let result = (bound.method)(self, &full_args)?;
                self.push(result)
            }
            Value::Closure(closure) => self.call_closure(closure, args),
            Value::Function(function) => {
                self.call_closure(Rc::new(Closure::bare(function)), args)
            }
            Value::Native(native) => {
                let result = native(self, &args)?;
                self.push(result)
            }
            Value::Array(elements) => {
                if args.len() != 1 {
                    return Err(self.type_error(format!(
                        "array call expects 1 argument, got {}",
                        args.len()
                    )));
                }
                let element = match &args[0] {
                    Value::Int(i) => {
                        let elements = elements.borrow();
                        if *i >= 0 && (*i as usize) < elements.len() {
                            elements[*i as usize].clone()
                        } else {
                            Value::Null
                        }
                    }
                    other => {
                        return Err(self.type_error(format!(
                            "array index must be an integer, got {}",
                            other.type_name()
                        )))
                    }
                };
                self.push(element)
            }
            Value::Str(s) => {
                if args.len() != 1 {
                    return Err(self.type_error(format!(
                        "string call expects 1 argument, got {}",
                        args.len()
                    )));
                }
                let result = match &args[0] {
                    Value::Int(i) if *i >= 0 => s
                        .chars()
                        .nth(*i as usize)
                        .map(|c| Value::str(c.to_string()))
                        .unwrap_or(Value::Null),
                    Value::Int(_) => Value::Null,
                    other => {
                        return Err(self.type_error(format!(
                            "string index must be an integer, got {}",
                            other.type_name()
                        )))
                    }
                };
                self.push(result)
            }
            Value::Class(class) => match class.factory {
                Some(factory) => {
                    let result = factory(self, &class, &args)?;
                    self.push(result)
                }
                None => Err(self.type_error(format!(
                    "class '{}' is not callable",
                    class.name
                ))),
            },
            other => Err(self.type_error(format!(
                "value is not callable ({})",
                other.type_name()
            ))),
        }
    }

    fn call_closure(
        &mut self,
        closure: Rc<Closure>,
        args: Vec<Value>,
    ) -> Result<(), SlateError> {
        let function = Rc::clone(&closure.function);
        if args.len() != function.arity {
            let name = function.name.as_deref().unwrap_or("<anonymous>");
            return Err(self.type_error(format!(
                "'{}' expects {} arguments, got {}",
                name,
                function.arity,
                args.len()
            )));
        }
        if self.frames.len() >= self.options.frame_limit {
            return Err(self.internal_error("call depth exceeded"));
        }
        let slots = self.stack.len();
        if slots + function.local_count > self.options.stack_limit {
            return Err(self.internal_error("stack overflow"));
        }
        for arg in args {
            self.push(arg)?;
        }
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    fn op_closure(
        &mut self,
        chunk: &crate::bytecode::Chunk,
        constant_index: usize,
        slots: usize,
    ) -> Result<Value, SlateError> {
        let function_index = match chunk.constant(constant_index) {
            Some(Value::Int(n)) => *n as usize,
            Some(other) => {
                return Err(self.internal_error(format!(
                    "CLOSURE constant must be a function index, got {}",
                    other.type_name()
                )))
            }
            None => {
                return Err(
                    self.internal_error(format!("constant {} out of range", constant_index))
                )
            }
        };
        let function = self
            .functions
            .get(function_index)
            .cloned()
            .ok_or_else(|| {
                self.internal_error(format!("function {} not registered", function_index))
            })?;

        let enclosing = Rc::clone(&self.frames.last().unwrap().closure);
        let mut upvalues = Vec::with_capacity(function.upvalues.len());
        for descriptor in &function.upvalues {
            let index = descriptor.index as usize;
            let captured = if descriptor.is_local {
                let at = slots + index;
                if at >= self.stack.len() {
                    return Err(
                        self.internal_error(format!("captured slot {} out of range", index))
                    );
                }
                self.stack[at].clone()
            } else {
                enclosing
                    .upvalues
                    .borrow()
                    .get(index)
                    .cloned()
                    .ok_or_else(|| {
                        self.internal_error(format!("captured upvalue {} out of range", index))
                    })?
            };
            upvalues.push(captured);
        }

        Ok(Value::Closure(Rc::new(Closure {
            function,
            upvalues: RefCell::new(upvalues),
        })))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Adds `base` to every function-table index referenced by a CLOSURE
/// instruction in the function's chunk. Each constant is patched once even
/// if several instructions share it.
fn rebase_closure_constants(function: &mut Function, base: usize) -> Result<(), SlateError> {
    if base == 0 {
        return Ok(());
    }
    let chunk = &mut function.chunk;
    let mut patched = std::collections::HashSet::new();
    let mut offset = 0;
    while offset < chunk.code.len() {
        let op = Op::try_from(chunk.code[offset]).map_err(|_| {
            SlateError::internal_error(format!("invalid opcode at offset {}", offset))
        })?;
        if op == Op::Closure {
            let index = chunk
                .read_u16(offset + 1)
                .ok_or_else(|| SlateError::internal_error("truncated CLOSURE instruction"))?
                as usize;
            if patched.insert(index) {
                match chunk.constants.get_mut(index) {
                    Some(Value::Int(n)) => *n += base as i32,
                    Some(other) => {
                        return Err(SlateError::internal_error(format!(
                            "CLOSURE constant must be a function index, got {}",
                            other.type_name()
                        )))
                    }
                    None => {
                        return Err(SlateError::internal_error(format!(
                            "constant {} out of range",
                            index
                        )))
                    }
                }
            }
        }
        offset += op.width();
    }
    Ok(())
}

/// Integer division rounded toward negative infinity. None when the
/// quotient overflows i32 (MIN / -1).
fn floor_div_i32(x: i32, y: i32) -> Option<i32> {
    let quotient = x.checked_div(y)?;
    let remainder = x % y;
    if remainder != 0 && ((remainder < 0) != (y < 0)) {
        quotient.checked_sub(1)
    } else {
        Some(quotient)
    }
}

fn floor_div_big(x: BigInt, y: BigInt) -> BigInt {
    let quotient = &x / &y;
    let remainder = &x % &y;
    if !remainder.is_zero() && (remainder.is_negative() != y.is_negative()) {
        quotient - 1
    } else {
        quotient
    }
}
