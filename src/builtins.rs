// File: src/builtins.rs
//
// Core classes for the Slate VM: one per primitive tag family, each
// carrying a small prototype of native methods. These back uniform method
// dispatch — GET_PROPERTY on any value walks its core class when the value
// has no class of its own. The full standard library lives elsewhere; this
// is the dispatch substrate every VM instance starts with.

use crate::class::Class;
use crate::errors::SlateError;
use crate::value::{values_equal, Value};
use crate::vm::Vm;
use std::rc::Rc;

/// The per-tag class registry created at VM construction.
pub struct CoreClasses {
    pub null: Rc<Class>,
    pub boolean: Rc<Class>,
    pub int: Rc<Class>,
    pub bigint: Rc<Class>,
    pub float: Rc<Class>,
    pub string: Rc<Class>,
    pub array: Rc<Class>,
    pub object: Rc<Class>,
    pub range: Rc<Class>,
    pub buffer: Rc<Class>,
    pub function: Rc<Class>,
}

impl CoreClasses {
    pub fn new() -> Self {
        let core = Self {
            null: Rc::new(Class::new("Null")),
            boolean: Rc::new(Class::new("Boolean")),
            int: Rc::new(Class::new("Int")),
            bigint: Rc::new(Class::new("BigInt")),
            float: Rc::new(Class::new("Float")),
            string: Rc::new(Class::new("String")),
            array: Rc::new(Class::new("Array")),
            object: Rc::new(Class::new("Object")),
            range: Rc::new(Class::new("Range")),
            buffer: Rc::new(Class::new("Buffer")),
            function: Rc::new(Class::new("Function")),
        };

        for class in [
            &core.null,
            &core.boolean,
            &core.int,
            &core.bigint,
            &core.float,
            &core.string,
            &core.array,
            &core.object,
            &core.range,
            &core.buffer,
            &core.function,
        ] {
            class.define_method("toString", native_to_string);
            class.define_method("type", native_type);
            class.define_method("equals", native_equals);
        }

        core.string.define_method("length", native_length);
        core.string.define_method("isEmpty", native_is_empty);
        core.array.define_method("length", native_length);
        core.array.define_method("push", native_array_push);
        core.array.define_method("pop", native_array_pop);
        core.buffer.define_method("length", native_length);
        core.object.define_method("keys", native_object_keys);
        core.object.define_method("has", native_object_has);
        core.range.define_method("start", native_range_start);
        core.range.define_method("end", native_range_end);
        core.range.define_method("step", native_range_step);
        core.range.define_method("isExclusive", native_range_is_exclusive);

        core
    }
}

impl Default for CoreClasses {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the free built-in functions every execution surface provides.
pub fn install_globals(vm: &mut Vm) {
    vm.define_global("print", Value::Native(native_print));
    vm.define_global("println", Value::Native(native_println));
}

fn expect_args(args: &[Value], expected: usize, name: &str) -> Result<(), SlateError> {
    if args.len() != expected {
        // Receiver included: a method with no parameters expects 1.
        return Err(SlateError::type_error(format!(
            "{} expects {} arguments, got {}",
            name,
            expected.saturating_sub(1),
            args.len().saturating_sub(1)
        )));
    }
    Ok(())
}

fn native_to_string(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "toString")?;
    Ok(Value::str(format!("{}", args[0])))
}

fn native_type(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "type")?;
    Ok(Value::str(args[0].type_name()))
}

fn native_equals(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 2, "equals")?;
    Ok(Value::Bool(values_equal(&args[0], &args[1])))
}

fn native_length(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "length")?;
    match &args[0] {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i32)),
        Value::Array(elements) => Ok(Value::Int(elements.borrow().len() as i32)),
        Value::Buffer(bytes) => Ok(Value::Int(bytes.borrow().len() as i32)),
        other => Err(SlateError::type_error(format!(
            "length is not defined for {}",
            other.type_name()
        ))),
    }
}

fn native_is_empty(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "isEmpty")?;
    match &args[0] {
        Value::Str(s) => Ok(Value::Bool(s.is_empty())),
        other => Err(SlateError::type_error(format!(
            "isEmpty is not defined for {}",
            other.type_name()
        ))),
    }
}

fn native_array_push(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 2, "push")?;
    let elements = match &args[0] {
        Value::Array(elements) => elements,
        other => {
            return Err(SlateError::type_error(format!(
                "push is not defined for {}",
                other.type_name()
            )))
        }
    };
    if args[1].is_undefined() {
        return Err(SlateError::type_error("cannot store undefined in an array"));
    }
    elements.borrow_mut().push(args[1].clone());
    Ok(Value::Int(elements.borrow().len() as i32))
}

fn native_array_pop(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "pop")?;
    match &args[0] {
        Value::Array(elements) => Ok(elements.borrow_mut().pop().unwrap_or(Value::Null)),
        other => Err(SlateError::type_error(format!(
            "pop is not defined for {}",
            other.type_name()
        ))),
    }
}

fn native_object_keys(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "keys")?;
    match &args[0] {
        Value::Object(instance) => {
            let mut keys: Vec<String> =
                instance.properties.borrow().keys().cloned().collect();
            keys.sort();
            Ok(Value::array(keys.into_iter().map(Value::str).collect()))
        }
        other => Err(SlateError::type_error(format!(
            "keys is not defined for {}",
            other.type_name()
        ))),
    }
}

fn native_object_has(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 2, "has")?;
    let key = match &args[1] {
        Value::Str(s) => s,
        other => {
            return Err(SlateError::type_error(format!(
                "has expects a string key, got {}",
                other.type_name()
            )))
        }
    };
    match &args[0] {
        Value::Object(instance) => {
            Ok(Value::Bool(instance.properties.borrow().contains_key(key.as_ref())))
        }
        other => Err(SlateError::type_error(format!(
            "has is not defined for {}",
            other.type_name()
        ))),
    }
}

fn native_range_start(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "start")?;
    range_field(&args[0], |r| r.start.clone())
}

fn native_range_end(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "end")?;
    range_field(&args[0], |r| r.end.clone())
}

fn native_range_step(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "step")?;
    range_field(&args[0], |r| r.step.clone())
}

fn native_range_is_exclusive(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    expect_args(args, 1, "isExclusive")?;
    range_field(&args[0], |r| Value::Bool(r.exclusive))
}

fn range_field(
    receiver: &Value,
    read: impl Fn(&crate::value::RangeValue) -> Value,
) -> Result<Value, SlateError> {
    match receiver {
        Value::Range(range) => Ok(read(range)),
        other => Err(SlateError::type_error(format!(
            "range accessor is not defined for {}",
            other.type_name()
        ))),
    }
}

fn native_print(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    let rendered: Vec<String> = args.iter().map(|v| format!("{}", v)).collect();
    print!("{}", rendered.join(" "));
    Ok(Value::Null)
}

fn native_println(_vm: &mut Vm, args: &[Value]) -> Result<Value, SlateError> {
    let rendered: Vec<String> = args.iter().map(|v| format!("{}", v)).collect();
    println!("{}", rendered.join(" "));
    Ok(Value::Null)
}
