// File: src/value.rs
//
// Runtime value representation for the Slate virtual machine.
// A Value is a tagged union over every type a Slate program can touch.
// Heap payloads are Rc-managed: cloning a Value retains, dropping releases,
// and Rc's recursive drop releases owned children before freeing.

use crate::bytecode::Chunk;
use crate::class::Class;
use crate::errors::SlateError;
use crate::vm::Vm;
use ahash::AHashMap;
use num_bigint::BigInt;
use num_traits::cast::{FromPrimitive, ToPrimitive};
use num_traits::Zero;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Built-in function signature: receiver-first argument slice, result or error.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, SlateError>;

/// Descriptor for one captured variable of a compiled function.
/// `is_local` captures from the enclosing frame's slot window; otherwise
/// from the enclosing closure's upvalue array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDescriptor {
    pub is_local: bool,
    pub index: u8,
}

/// A compiled function record: bytecode, constants, and call metadata.
#[derive(Debug)]
pub struct Function {
    /// Function name, None for anonymous functions and the entry chunk
    pub name: Option<String>,
    /// Number of declared parameters
    pub arity: usize,
    /// Parameter names, kept for diagnostics
    pub params: Vec<String>,
    /// Maximum simultaneously live locals, parameters included
    pub local_count: usize,
    /// Bytecode, constant pool, and debug table
    pub chunk: Chunk,
    /// One descriptor per upvalue the function captures
    pub upvalues: Vec<UpvalueDescriptor>,
}

impl Function {
    pub fn new(name: Option<String>, arity: usize) -> Self {
        Self {
            name,
            arity,
            params: Vec::new(),
            local_count: arity,
            chunk: Chunk::new(),
            upvalues: Vec::new(),
        }
    }
}

/// A function plus its bound upvalues, created by the CLOSURE opcode.
/// The upvalue array length always equals the function's descriptor count.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: RefCell<Vec<Value>>,
}

impl Closure {
    /// Wraps a bare function in a closure with no captures.
    pub fn bare(function: Rc<Function>) -> Self {
        Self { function, upvalues: RefCell::new(Vec::new()) }
    }
}

/// A native function bound to a fixed receiver. Calling it prepends the
/// receiver to the argument list.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: NativeFn,
    pub name: String,
}

/// Range payload: start/end/step are numeric Values, `exclusive` drops the
/// end bound.
#[derive(Debug, Clone)]
pub struct RangeValue {
    pub start: Value,
    pub end: Value,
    pub step: Value,
    pub exclusive: bool,
}

/// Heap payload of an Object value: a property map plus an optional weak
/// back-reference to the class the instance was constructed from. Weak
/// because ADT singleton instances live inside their class's statics.
#[derive(Debug)]
pub struct Instance {
    pub class: RefCell<Option<Weak<Class>>>,
    pub properties: RefCell<AHashMap<String, Value>>,
}

impl Instance {
    pub fn new() -> Self {
        Self { class: RefCell::new(None), properties: RefCell::new(AHashMap::new()) }
    }

    pub fn with_class(class: &Rc<Class>) -> Self {
        Self {
            class: RefCell::new(Some(Rc::downgrade(class))),
            properties: RefCell::new(AHashMap::new()),
        }
    }

    /// Upgrades the weak class back-reference, if one is set and alive.
    pub fn class(&self) -> Option<Rc<Class>> {
        self.class.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime values in the Slate virtual machine.
///
/// Undefined is not a storable value: it appears only transiently on the
/// operand stack and in declared-but-uninitialized local slots. Container
/// writes reject it with a TypeError.
#[derive(Clone)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    /// 32-bit signed integer; arithmetic overflow promotes to BigInt
    Int(i32),
    /// Arbitrary-precision integer
    BigInt(Rc<BigInt>),
    Float32(f32),
    Float64(f64),
    /// Immutable byte sequence
    Str(Rc<str>),
    /// Ordered sequence of values, shared and mutable
    Array(Rc<RefCell<Vec<Value>>>),
    /// String-keyed property map, shared and mutable
    Object(Rc<Instance>),
    Class(Rc<Class>),
    Closure(Rc<Closure>),
    /// Bare compiled function, no captures
    Function(Rc<Function>),
    Native(NativeFn),
    BoundMethod(Rc<BoundMethod>),
    Range(Rc<RangeValue>),
    /// Raw byte sequence, shared and mutable
    Buffer(Rc<RefCell<Vec<u8>>>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn object() -> Self {
        Value::Object(Rc::new(Instance::new()))
    }

    pub fn bigint(n: BigInt) -> Self {
        Value::BigInt(Rc::new(n))
    }

    pub fn buffer(bytes: Vec<u8>) -> Self {
        Value::Buffer(Rc::new(RefCell::new(bytes)))
    }

    /// Type name as user programs see it.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Float32(_) | Value::Float64(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Class(_) => "class",
            Value::Closure(_) | Value::Function(_) => "function",
            Value::Native(_) | Value::BoundMethod(_) => "function",
            Value::Range(_) => "range",
            Value::Buffer(_) => "buffer",
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::BigInt(_) | Value::Float32(_) | Value::Float64(_)
        )
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Falsy set: Null, Undefined, false, zero of every numeric type, and
    /// the empty string. Everything else is truthy.
    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Null | Value::Undefined => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::BigInt(n) => n.is_zero(),
            Value::Float32(f) => *f == 0.0,
            Value::Float64(f) => *f == 0.0,
            Value::Str(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }
}

/// A pair of numeric operands promoted to their widest common type.
/// Promotion order: Int -> BigInt -> Float32 -> Float64.
pub(crate) enum NumericPair {
    Int(i32, i32),
    Big(BigInt, BigInt),
    F32(f32, f32),
    F64(f64, f64),
}

fn to_f64(v: &Value) -> f64 {
    match v {
        Value::Int(n) => *n as f64,
        Value::BigInt(n) => n.to_f64().unwrap_or(f64::NAN),
        Value::Float32(f) => *f as f64,
        Value::Float64(f) => *f,
        _ => f64::NAN,
    }
}

fn to_f32(v: &Value) -> f32 {
    match v {
        Value::Int(n) => *n as f32,
        Value::BigInt(n) => n.to_f32().unwrap_or(f32::NAN),
        Value::Float32(f) => *f,
        Value::Float64(f) => *f as f32,
        _ => f32::NAN,
    }
}

fn to_bigint(v: &Value) -> Option<BigInt> {
    match v {
        Value::Int(n) => Some(BigInt::from(*n)),
        Value::BigInt(n) => Some((**n).clone()),
        _ => None,
    }
}

/// Promotes two numeric operands to their widest common representation.
/// Returns None if either operand is not a number.
pub(crate) fn promote_pair(a: &Value, b: &Value) -> Option<NumericPair> {
    if !a.is_number() || !b.is_number() {
        return None;
    }
    if matches!(a, Value::Float64(_)) || matches!(b, Value::Float64(_)) {
        return Some(NumericPair::F64(to_f64(a), to_f64(b)));
    }
    if matches!(a, Value::Float32(_)) || matches!(b, Value::Float32(_)) {
        return Some(NumericPair::F32(to_f32(a), to_f32(b)));
    }
    if matches!(a, Value::BigInt(_)) || matches!(b, Value::BigInt(_)) {
        return Some(NumericPair::Big(to_bigint(a)?, to_bigint(b)?));
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(NumericPair::Int(*x, *y)),
        _ => None,
    }
}

/// Structural equality, the fallback when neither operand's class chain
/// defines `.equals`. Numeric cross-type comparison promotes through the
/// widest type involved; different non-numeric tags are unequal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if let Some(pair) = promote_pair(a, b) {
        return match pair {
            NumericPair::Int(x, y) => x == y,
            NumericPair::Big(x, y) => x == y,
            NumericPair::F32(x, y) => x == y,
            NumericPair::F64(x, y) => x == y,
        };
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Undefined, Value::Undefined) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x.as_bytes() == y.as_bytes(),
        (Value::Array(x), Value::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (xp, yp) = (x.properties.borrow(), y.properties.borrow());
            xp.len() == yp.len()
                && xp.iter().all(|(k, v)| yp.get(k).is_some_and(|w| values_equal(v, w)))
        }
        (Value::Buffer(x), Value::Buffer(y)) => {
            Rc::ptr_eq(x, y) || *x.borrow() == *y.borrow()
        }
        (Value::Range(x), Value::Range(y)) => {
            values_equal(&x.start, &y.start)
                && values_equal(&x.end, &y.end)
                && values_equal(&x.step, &y.step)
                && x.exclusive == y.exclusive
        }
        (Value::Class(x), Value::Class(y)) => Rc::ptr_eq(x, y),
        (Value::Closure(x), Value::Closure(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::BoundMethod(x), Value::BoundMethod(y)) => Rc::ptr_eq(x, y),
        (Value::Native(x), Value::Native(y)) => *x as usize == *y as usize,
        _ => false,
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    let mut hash = hash;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// FNV-1a over a canonical byte encoding. Numbers that compare equal hash
/// equal: integral values hash their BigInt magnitude, fractional values
/// hash their f64 bits. Object hashing sorts keys lexicographically, folds
/// (key-hash, value-hash) pairs, and short-circuits object-valued children
/// to pointer identity to avoid cycles.
pub fn hash_value(v: &Value) -> u64 {
    hash_with(FNV_OFFSET, v)
}

fn hash_with(seed: u64, v: &Value) -> u64 {
    match v {
        Value::Null => fnv1a(seed, b"n"),
        Value::Undefined => fnv1a(seed, b"u"),
        Value::Bool(b) => fnv1a(seed, if *b { b"b1" } else { b"b0" }),
        Value::Int(n) => hash_number(seed, &BigInt::from(*n)),
        Value::BigInt(n) => hash_number(seed, n),
        Value::Float32(f) => hash_float(seed, *f as f64),
        Value::Float64(f) => hash_float(seed, *f),
        Value::Str(s) => fnv1a(fnv1a(seed, b"s"), s.as_bytes()),
        Value::Array(elements) => {
            let mut hash = fnv1a(seed, b"a");
            for element in elements.borrow().iter() {
                let child = match element {
                    Value::Object(o) => fnv1a(seed, &(Rc::as_ptr(o) as usize).to_le_bytes()),
                    other => hash_with(FNV_OFFSET, other),
                };
                hash = fnv1a(hash, &child.to_le_bytes());
            }
            hash
        }
        Value::Object(instance) => {
            let props = instance.properties.borrow();
            let mut keys: Vec<&String> = props.keys().collect();
            keys.sort();
            let mut hash = fnv1a(seed, b"o");
            for key in keys {
                let key_hash = fnv1a(FNV_OFFSET, key.as_bytes());
                let value_hash = match &props[key] {
                    Value::Object(o) => fnv1a(seed, &(Rc::as_ptr(o) as usize).to_le_bytes()),
                    other => hash_with(FNV_OFFSET, other),
                };
                hash = fnv1a(hash, &key_hash.to_le_bytes());
                hash = fnv1a(hash, &value_hash.to_le_bytes());
            }
            hash
        }
        Value::Buffer(bytes) => fnv1a(fnv1a(seed, b"B"), &bytes.borrow()),
        Value::Range(range) => {
            let mut hash = fnv1a(seed, b"r");
            for part in [&range.start, &range.end, &range.step] {
                hash = fnv1a(hash, &hash_with(FNV_OFFSET, part).to_le_bytes());
            }
            fnv1a(hash, if range.exclusive { b"1" } else { b"0" })
        }
        Value::Class(c) => fnv1a(seed, &(Rc::as_ptr(c) as usize).to_le_bytes()),
        Value::Closure(c) => fnv1a(seed, &(Rc::as_ptr(c) as usize).to_le_bytes()),
        Value::Function(f) => fnv1a(seed, &(Rc::as_ptr(f) as usize).to_le_bytes()),
        Value::BoundMethod(m) => fnv1a(seed, &(Rc::as_ptr(m) as usize).to_le_bytes()),
        Value::Native(f) => fnv1a(seed, &(*f as usize).to_le_bytes()),
    }
}

fn hash_number(seed: u64, n: &BigInt) -> u64 {
    let (sign, bytes) = n.to_bytes_le();
    let tag: &[u8] = match sign {
        num_bigint::Sign::Minus => b"i-",
        _ => b"i+",
    };
    fnv1a(fnv1a(seed, tag), &bytes)
}

fn hash_float(seed: u64, f: f64) -> u64 {
    // Integral floats hash as the integer they equal, so Int 1, BigInt 1,
    // and Float 1.0 agree.
    if f.fract() == 0.0 && f.is_finite() {
        if let Some(n) = BigInt::from_f64(f) {
            return hash_number(seed, &n);
        }
    }
    fnv1a(fnv1a(seed, b"f"), &f.to_bits().to_le_bytes())
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

/// Stringification used by ADD string concatenation and `toString`.
/// Strings render bare; inside containers they render quoted.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Undefined => write!(f, "undefined"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::BigInt(n) => write!(f, "{}", n),
            Value::Float32(x) => write!(f, "{}", format_float(*x as f64)),
            Value::Float64(x) => write!(f, "{}", format_float(*x)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", display_quoted(element))?;
                }
                write!(f, "]")
            }
            Value::Object(instance) => {
                let props = instance.properties.borrow();
                let mut keys: Vec<&String> = props.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, display_quoted(&props[*key]))?;
                }
                write!(f, "}}")
            }
            Value::Class(c) => write!(f, "<class {}>", c.name),
            Value::Closure(c) => {
                let name = c.function.name.as_deref().unwrap_or("<anonymous>");
                write!(f, "<fn {}/{}>", name, c.function.arity)
            }
            Value::Function(func) => {
                let name = func.name.as_deref().unwrap_or("<anonymous>");
                write!(f, "<fn {}/{}>", name, func.arity)
            }
            Value::Native(_) => write!(f, "<native fn>"),
            Value::BoundMethod(m) => write!(f, "<bound method {}>", m.name),
            Value::Range(r) => {
                let op = if r.exclusive { "..<" } else { ".." };
                if matches!(r.step, Value::Int(1)) {
                    write!(f, "{}{}{}", r.start, op, r.end)
                } else {
                    write!(f, "{}{}{} by {}", r.start, op, r.end, r.step)
                }
            }
            Value::Buffer(bytes) => write!(f, "<buffer {} bytes>", bytes.borrow().len()),
        }
    }
}

fn display_quoted(v: &Value) -> String {
    match v {
        Value::Str(s) => format!("\"{}\"", s),
        other => format!("{}", other),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Array(elements) => write!(f, "Array[{}]", elements.borrow().len()),
            Value::Object(instance) => {
                write!(f, "Object{{{} keys}}", instance.properties.borrow().len())
            }
            Value::Native(_) => write!(f, "Native"),
            other => write!(f, "{}({})", other.type_name(), other),
        }
    }
}
