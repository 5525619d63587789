// File: src/class.rs
//
// Class objects and method dispatch support for the Slate VM.
// A Class carries a prototype of instance properties (typically Native
// methods), a static property table, an optional factory, and an optional
// parent link used by the property-resolution chain. Algebraic data types
// are built from classes: one base class plus one constructor class per
// case.

use crate::errors::SlateError;
use crate::value::{Instance, NativeFn, Value};
use crate::vm::Vm;
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Factory signature: class identity is passed so a factory can construct
/// the correct instance variant.
pub type FactoryFn = fn(&mut Vm, &Rc<Class>, &[Value]) -> Result<Value, SlateError>;

/// The two shapes an ADT case can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdtCaseKind {
    /// A case with no payload; constructed once and stored in the base
    /// class's statics.
    Singleton,
    /// A case carrying positional parameters.
    Tuple,
}

/// Case metadata attached to ADT constructor classes.
#[derive(Debug, Clone)]
pub struct AdtInfo {
    pub kind: AdtCaseKind,
    pub params: Vec<String>,
}

/// A runtime class: prototype, statics, optional factory, optional parent.
#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub factory: Option<FactoryFn>,
    pub instance_properties: RefCell<AHashMap<String, Value>>,
    pub static_properties: RefCell<AHashMap<String, Value>>,
    pub parent: Option<Rc<Class>>,
    /// Present only on ADT constructor classes.
    pub adt: Option<AdtInfo>,
}

impl Class {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: None,
            instance_properties: RefCell::new(AHashMap::new()),
            static_properties: RefCell::new(AHashMap::new()),
            parent: None,
            adt: None,
        }
    }

    pub fn with_parent(name: impl Into<String>, parent: Rc<Class>) -> Self {
        let mut class = Self::new(name);
        class.parent = Some(parent);
        class
    }

    pub fn with_factory(mut self, factory: FactoryFn) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Installs a native method on the prototype.
    pub fn define_method(&self, name: impl Into<String>, method: NativeFn) {
        self.instance_properties.borrow_mut().insert(name.into(), Value::Native(method));
    }

    pub fn define_static(&self, name: impl Into<String>, value: Value) {
        self.static_properties.borrow_mut().insert(name.into(), value);
    }

    /// Walks the parent chain looking for an instance property. The first
    /// match wins.
    pub fn lookup_instance(self: &Rc<Self>, name: &str) -> Option<Value> {
        let mut current = Some(Rc::clone(self));
        while let Some(class) = current {
            if let Some(value) = class.instance_properties.borrow().get(name) {
                return Some(value.clone());
            }
            current = class.parent.clone();
        }
        None
    }

    /// Walks the parent chain looking for a static property.
    pub fn lookup_static(self: &Rc<Self>, name: &str) -> Option<Value> {
        let mut current = Some(Rc::clone(self));
        while let Some(class) = current {
            if let Some(value) = class.static_properties.borrow().get(name) {
                return Some(value.clone());
            }
            current = class.parent.clone();
        }
        None
    }
}

/// Shared factory for ADT tuple cases: validates arity against the case
/// parameter list and builds an instance backed by the constructor class.
fn adt_tuple_factory(
    _vm: &mut Vm,
    class: &Rc<Class>,
    args: &[Value],
) -> Result<Value, SlateError> {
    let info = class.adt.as_ref().ok_or_else(|| {
        SlateError::internal_error(format!("class '{}' has no case metadata", class.name))
    })?;
    if args.len() != info.params.len() {
        return Err(SlateError::type_error(format!(
            "{} expects {} arguments, got {}",
            class.name,
            info.params.len(),
            args.len()
        )));
    }
    for arg in args {
        if arg.is_undefined() {
            return Err(SlateError::type_error("cannot store undefined in a constructor"));
        }
    }
    let instance = Instance::with_class(class);
    {
        let mut props = instance.properties.borrow_mut();
        for (param, arg) in info.params.iter().zip(args) {
            props.insert(param.clone(), arg.clone());
        }
    }
    Ok(Value::Object(Rc::new(instance)))
}

/// Builds an algebraic data type: a base class plus one constructor class
/// per case, all linked through the parent chain. Tuple cases become
/// callable constructor classes; singleton cases are constructed once.
/// Both land in the base class's statics under the case name, which is how
/// user programs reach them.
pub fn define_adt(
    name: impl Into<String>,
    cases: Vec<(String, AdtCaseKind, Vec<String>)>,
) -> (Rc<Class>, Vec<Rc<Class>>) {
    let base = Rc::new(Class::new(name));
    let mut constructors = Vec::with_capacity(cases.len());

    for (case_name, kind, params) in cases {
        let mut class = Class::with_parent(case_name.clone(), Rc::clone(&base));
        class.adt = Some(AdtInfo { kind, params });
        if kind == AdtCaseKind::Tuple {
            class.factory = Some(adt_tuple_factory);
        }
        let class = Rc::new(class);

        match kind {
            AdtCaseKind::Tuple => {
                base.define_static(case_name, Value::Class(Rc::clone(&class)));
            }
            AdtCaseKind::Singleton => {
                let instance = Instance::with_class(&class);
                base.define_static(case_name, Value::Object(Rc::new(instance)));
            }
        }
        constructors.push(class);
    }

    (base, constructors)
}
