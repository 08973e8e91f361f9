//! Attribute access: `getattr`, `setattr`, `delattr` and `dir` for every kind of value.

use std::rc::Rc;

use crate::{
    args::Args,
    exception::{ExcClass, ExcType, Exception, RunResult},
    methods,
    runtime::Runtime,
    types::{BoundMethod, BuiltinMethod, Class, Descriptor, NativeFunction},
    value::{Type, Value},
};

impl Runtime {
    /// `getattr(obj, name)`.
    pub fn getattr(&self, obj: &Value, name: &str) -> RunResult<Value> {
        if let Some(value) = self.getattr_opt(obj, name)? {
            return Ok(value);
        }
        Err(match obj {
            Value::Class(c) => ExcType::AttributeError.msg(format!("type object '{}' has no attribute '{name}'", c.name)),
            Value::Type(t) => ExcType::AttributeError.msg(format!("type object '{}' has no attribute '{name}'", t.name())),
            Value::Module(m) => ExcType::AttributeError.msg(format!("module '{}' has no attribute '{name}'", m.name)),
            Value::Super(_) => ExcType::AttributeError.msg(format!("'super' object has no attribute '{name}'")),
            _ => no_attribute(obj, name),
        })
    }

    /// `hasattr(obj, name)`; errors other than `AttributeError` propagate.
    pub fn hasattr(&self, obj: &Value, name: &str) -> RunResult<bool> {
        match self.getattr_opt(obj, name) {
            Ok(found) => Ok(found.is_some()),
            Err(exc) if exc.is_instance(ExcType::AttributeError) => Ok(false),
            Err(exc) => Err(exc),
        }
    }

    fn getattr_opt(&self, obj: &Value, name: &str) -> RunResult<Option<Value>> {
        let found = match obj {
            Value::Instance(inst) => {
                let class_attr = inst.class.lookup(name);
                if let Some(Value::Descriptor(d)) = &class_attr
                    && let Descriptor::Property { fget, .. } = &**d
                {
                    if fget.is_none() {
                        return Err(ExcType::AttributeError.msg(format!(
                            "property '{name}' of '{}' object has no getter",
                            inst.class.name
                        )));
                    }
                    return self.call(fget, Args::one(obj.clone())).map(Some);
                }
                let own = inst.dict.borrow().get(name).cloned();
                if own.is_some() {
                    return Ok(own);
                }
                match name {
                    "__class__" => return Ok(Some(Value::Class(inst.class.clone()))),
                    "__dict__" => {
                        let items = inst.dict.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                        return Ok(Some(Value::dict(items)));
                    }
                    _ => {}
                }
                if let Some(attr) = class_attr {
                    return Ok(Some(bind(attr, obj, &inst.class)));
                }
                if let Some(fallback) = inst.class.lookup("__getattr__") {
                    return self.call(&fallback, Args::two(obj.clone(), Value::str(name))).map(Some);
                }
                None
            }
            Value::Class(class) => class_attr(class, name),
            Value::Module(m) => match name {
                "__name__" => Some(Value::Str(m.name.clone())),
                "__dict__" => Some(Value::dict(
                    m.attrs.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )),
                _ => m.get(name),
            },
            Value::Exception(exc) => self.exception_attr(obj, exc, name),
            Value::Super(s) => {
                let obj_class = match &s.obj {
                    Value::Instance(inst) => Some(inst.class.clone()),
                    Value::Class(c) => Some(c.clone()),
                    Value::Exception(e) => match e.class() {
                        ExcClass::User(c) => Some(c.clone()),
                        ExcClass::Builtin(_) => None,
                    },
                    _ => None,
                };
                let found = obj_class.as_ref().and_then(|c| c.lookup_after(&s.class, name));
                match (found, obj_class) {
                    (Some(attr), Some(class)) => Some(bind(attr, &s.obj, &class)),
                    _ => super_fallback(&s.obj, name),
                }
            }
            Value::Function(f) => match name {
                "__name__" => Some(Value::Str(f.def.name.clone())),
                "__qualname__" => Some(Value::Str(f.def.qualname.clone())),
                "__module__" => Some(f.globals.borrow().get_str("__name__").unwrap_or(Value::None)),
                "__defaults__" => {
                    let defaults: Vec<Value> = f.defaults.iter().flatten().cloned().collect();
                    Some(if defaults.is_empty() { Value::None } else { Value::tuple(defaults) })
                }
                "__dict__" => Some(Value::dict(
                    f.attrs.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )),
                _ => f.attrs.borrow().get(name).cloned().or_else(|| (name == "__doc__").then_some(Value::None)),
            },
            Value::BoundMethod(m) => match name {
                "__self__" => Some(m.receiver.clone()),
                "__func__" => Some(m.func.clone()),
                _ => self.getattr_opt(&m.func, name)?,
            },
            Value::BuiltinMethod(m) => match name {
                "__self__" => Some(m.receiver.clone()),
                "__name__" | "__qualname__" => Some(Value::Str(m.name.clone())),
                _ => None,
            },
            Value::Builtin(b) => match name {
                "__name__" | "__qualname__" => Some(Value::str(b.name())),
                "__module__" => Some(Value::str("builtins")),
                _ => None,
            },
            Value::Native(n) => match name {
                "__name__" | "__qualname__" => Some(Value::Str(n.name.clone())),
                _ => None,
            },
            Value::Descriptor(d) => match (&**d, name) {
                (_, "__func__") => Some(d.inner().into_owned()),
                (Descriptor::Property { fget, .. }, "fget") => Some(fget.clone()),
                (Descriptor::Property { fset, .. }, "fset") => Some(fset.clone()),
                (Descriptor::Property { fdel, .. }, "fdel") => Some(fdel.clone()),
                (_, "__isabstractmethod__") => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Coroutine(c) => match name {
                "__name__" => Some(Value::str(c.name())),
                "__qualname__" => Some(Value::str(c.qualname())),
                "cr_running" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Generator(g) => match name {
                "__name__" => Some(Value::str(short_name(g.qualname()))),
                "__qualname__" => Some(Value::str(g.qualname())),
                "gi_running" => Some(Value::Bool(g.is_running())),
                _ => None,
            },
            Value::AsyncGenerator(g) => match name {
                "__name__" => Some(Value::str(short_name(g.qualname()))),
                "__qualname__" => Some(Value::str(g.qualname())),
                "ag_running" => Some(Value::Bool(g.is_running())),
                _ => None,
            },
            Value::Type(t) => match name {
                "__name__" | "__qualname__" => Some(Value::str(t.name())),
                "__module__" => Some(Value::str(type_module(*t))),
                "__mro__" => {
                    let mut mro = Vec::new();
                    let mut current = Some(*t);
                    while let Some(t) = current {
                        mro.push(Value::Type(t));
                        current = t.parent();
                    }
                    Some(Value::tuple(mro))
                }
                "__doc__" => Some(Value::None),
                _ => None,
            },
            Value::Stream(s) => match name {
                "name" => Some(Value::str(s.name())),
                "encoding" => Some(Value::str("utf-8")),
                "closed" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::HostProxy(p) => p.attrs.get(name).cloned(),
            Value::Slice(s) => match name {
                "start" => Some(s.start.clone()),
                "stop" => Some(s.stop.clone()),
                "step" => Some(s.step.clone()),
                _ => None,
            },
            Value::Range(r) => match name {
                "start" => Some(Value::Int(r.start)),
                "stop" => Some(Value::Int(r.stop)),
                "step" => Some(Value::Int(r.step)),
                _ => None,
            },
            Value::Int(_) | Value::BigInt(_) | Value::Bool(_) => match name {
                "real" | "numerator" => Some(self.unary_op(crate::expressions::UnaryOperator::Pos, obj)?),
                "imag" => Some(Value::Int(0)),
                "denominator" => Some(Value::Int(1)),
                _ => None,
            },
            Value::Float(f) => match name {
                "real" => Some(Value::Float(*f)),
                "imag" => Some(Value::Float(0.0)),
                _ => None,
            },
            _ => None,
        };
        if found.is_some() {
            return Ok(found);
        }
        Ok(match name {
            "__class__" => Some(obj.py_type()),
            _ if methods::has_method(obj, name) => Some(Value::BuiltinMethod(Rc::new(BuiltinMethod {
                receiver: obj.clone(),
                name: name.into(),
            }))),
            _ => None,
        })
    }

    fn exception_attr(&self, obj: &Value, exc: &Exception, name: &str) -> Option<Value> {
        let value = match name {
            "args" => Value::tuple(exc.args()),
            "__cause__" => exc.cause().map_or(Value::None, Value::Exception),
            "__context__" => exc.context().map_or(Value::None, Value::Exception),
            "__traceback__" => Value::None,
            "value" if exc.is_instance(ExcType::StopIteration) => exc.first_arg(),
            "msg" | "filename" | "lineno" | "offset" | "text" if exc.syntax_location().is_some() => {
                let loc = exc.syntax_location()?;
                match name {
                    "msg" => exc.first_arg(),
                    "filename" => Value::str(loc.filename),
                    "lineno" => Value::Int(i64::from(loc.lineno)),
                    "offset" => Value::Int(i64::from(loc.offset)),
                    _ => Value::str(loc.text),
                }
            }
            "name" if exc.is_instance(ExcType::NameError) => exc.get_attr(name).unwrap_or(Value::None),
            _ => {
                if let Some(own) = exc.get_attr(name) {
                    return Some(own);
                }
                if let ExcClass::User(class) = exc.class() {
                    return class.lookup(name).map(|attr| bind(attr, obj, class));
                }
                return None;
            }
        };
        Some(value)
    }

    /// `setattr(obj, name, value)`.
    pub fn setattr(&self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        match obj {
            Value::Instance(inst) => {
                if let Some(Value::Descriptor(d)) = inst.class.lookup(name)
                    && let Descriptor::Property { fset, .. } = &*d
                {
                    if fset.is_none() {
                        return Err(ExcType::AttributeError.msg(format!(
                            "property '{name}' of '{}' object has no setter",
                            inst.class.name
                        )));
                    }
                    return self.call(fset, Args::two(obj.clone(), value)).map(drop);
                }
                if let Some(custom) = inst.class.lookup("__setattr__") {
                    return self
                        .call(&custom, Args::positional(vec![obj.clone(), Value::str(name), value]))
                        .map(drop);
                }
                let old = inst.dict.borrow_mut().insert(name.into(), value);
                drop(old);
                Ok(())
            }
            Value::Class(c) => {
                let old = c.dict.borrow_mut().insert(name.into(), value);
                drop(old);
                Ok(())
            }
            Value::Module(m) => {
                m.set(name, value);
                Ok(())
            }
            Value::Function(f) => {
                let old = f.attrs.borrow_mut().insert(name.into(), value);
                drop(old);
                Ok(())
            }
            Value::Exception(exc) => {
                match name {
                    "args" => exc.set_args(self.to_vec(&value)?),
                    "__cause__" => match value {
                        Value::None => exc.set_cause(None),
                        other => exc.set_cause(Some(self.make_exception(other)?)),
                    },
                    "__context__" => {
                        if let Value::Exception(context) = value {
                            exc.set_context(context);
                        }
                    }
                    _ => exc.set_attr(name.into(), value),
                }
                Ok(())
            }
            Value::Super(_) => Err(ExcType::AttributeError.msg(format!("'super' object has no attribute '{name}'"))),
            _ => Err(no_attribute(obj, name)),
        }
    }

    /// `delattr(obj, name)`.
    pub fn delattr(&self, obj: &Value, name: &str) -> RunResult<()> {
        let removed = match obj {
            Value::Instance(inst) => {
                if let Some(Value::Descriptor(d)) = inst.class.lookup(name)
                    && let Descriptor::Property { fdel, .. } = &*d
                    && !fdel.is_none()
                {
                    return self.call(fdel, Args::one(obj.clone())).map(drop);
                }
                inst.dict.borrow_mut().shift_remove(name)
            }
            Value::Class(c) => c.dict.borrow_mut().shift_remove(name),
            Value::Module(m) => m.attrs.borrow_mut().shift_remove(name),
            Value::Function(f) => f.attrs.borrow_mut().shift_remove(name),
            _ => None,
        };
        match removed {
            Some(old) => {
                drop(old);
                Ok(())
            }
            None => Err(no_attribute(obj, name)),
        }
    }

    /// Looks up a special method the way the interpreter does: on the type, bound to `obj`.
    pub(crate) fn lookup_special(&self, obj: &Value, name: &str) -> Option<Value> {
        let class = match obj {
            Value::Instance(inst) => Some(&inst.class),
            Value::Exception(exc) => match exc.class() {
                ExcClass::User(class) => Some(class),
                ExcClass::Builtin(_) => None,
            },
            _ => None,
        };
        if let Some(class) = class
            && let Some(attr) = class.lookup(name)
        {
            return Some(bind(attr, obj, class));
        }
        methods::has_method(obj, name).then(|| {
            Value::BuiltinMethod(Rc::new(BuiltinMethod {
                receiver: obj.clone(),
                name: name.into(),
            }))
        })
    }

    /// Attribute names of `obj`, sorted, as `dir(obj)` reports them.
    #[must_use]
    pub fn dir(&self, obj: &Value) -> Vec<Rc<str>> {
        let mut names: Vec<Rc<str>> = Vec::new();
        let mut add_class = |class: &Rc<Class>, names: &mut Vec<Rc<str>>| {
            for c in std::iter::once(class).chain(class.mro.iter()) {
                names.extend(c.dict.borrow().keys().cloned());
            }
        };
        match obj {
            Value::Instance(inst) => {
                names.extend(inst.dict.borrow().keys().cloned());
                add_class(&inst.class, &mut names);
                names.extend(["__class__", "__dict__"].map(Rc::from));
            }
            Value::Class(c) => {
                add_class(c, &mut names);
                names.extend(["__name__", "__qualname__", "__module__", "__mro__"].map(Rc::from));
            }
            Value::Module(m) => names.extend(m.names()),
            Value::Exception(exc) => {
                names.extend(exc.attr_names());
                if let ExcClass::User(class) = exc.class() {
                    add_class(class, &mut names);
                }
                names.extend(["args", "__cause__", "__context__", "__traceback__"].map(Rc::from));
            }
            Value::Function(f) => {
                names.extend(f.attrs.borrow().keys().cloned());
                names.extend(["__name__", "__qualname__", "__module__", "__defaults__", "__doc__"].map(Rc::from));
            }
            Value::HostProxy(p) => names.extend(p.attrs.keys().cloned()),
            Value::Stream(_) => names.extend(["name", "encoding", "closed"].map(Rc::from)),
            _ => {}
        }
        names.extend(methods::method_names(obj).iter().map(|n| Rc::from(*n)));
        names.sort();
        names.dedup();
        names
    }
}

/// Binds a class attribute found for `obj`.
fn bind(attr: Value, obj: &Value, class: &Rc<Class>) -> Value {
    match &attr {
        Value::Function(_) => Value::BoundMethod(Rc::new(BoundMethod {
            func: attr,
            receiver: obj.clone(),
        })),
        Value::Descriptor(d) => match &**d {
            Descriptor::StaticMethod(f) => f.clone(),
            Descriptor::ClassMethod(f) => Value::BoundMethod(Rc::new(BoundMethod {
                func: f.clone(),
                receiver: Value::Class(class.clone()),
            })),
            Descriptor::Property { .. } => attr,
        },
        _ => attr,
    }
}

/// Attribute lookup on a class object: plain functions stay unbound.
fn class_attr(class: &Rc<Class>, name: &str) -> Option<Value> {
    match name {
        "__name__" => return Some(Value::Str(class.name.clone())),
        "__qualname__" => return Some(Value::Str(class.qualname.clone())),
        "__module__" => return Some(Value::Str(class.module.clone())),
        "__bases__" => {
            let bases = if class.bases.is_empty() {
                vec![Value::Type(Type::Object)]
            } else {
                class.bases.clone()
            };
            return Some(Value::tuple(bases));
        }
        "__mro__" => {
            let mut mro: Vec<Value> = std::iter::once(class)
                .chain(class.mro.iter())
                .map(|c| Value::Class(c.clone()))
                .collect();
            match class.exc_base {
                Some(base) => {
                    let mut current = Some(Type::Exc(base));
                    while let Some(t) = current {
                        mro.push(Value::Type(t));
                        current = t.parent();
                    }
                }
                None => mro.push(Value::Type(Type::Object)),
            }
            return Some(Value::tuple(mro));
        }
        "__dict__" => {
            let items = class.dict.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            return Some(Value::dict(items));
        }
        _ => {}
    }
    let attr = class.lookup(name)?;
    Some(match &attr {
        Value::Descriptor(d) => match &**d {
            Descriptor::StaticMethod(f) => f.clone(),
            Descriptor::ClassMethod(f) => Value::BoundMethod(Rc::new(BoundMethod {
                func: f.clone(),
                receiver: Value::Class(class.clone()),
            })),
            Descriptor::Property { .. } => attr,
        },
        _ => attr,
    })
}

/// What `super()` finds past the last user class: the builtin base's methods.
fn super_fallback(obj: &Value, name: &str) -> Option<Value> {
    match (obj, name) {
        (Value::Exception(_), _) if methods::has_method(obj, name) => Some(Value::BuiltinMethod(Rc::new(BuiltinMethod {
            receiver: obj.clone(),
            name: name.into(),
        }))),
        (_, "__init__") => Some(NativeFunction::value("__init__", |_, _| Ok(Value::None))),
        (_, "__repr__" | "__str__") => {
            let receiver = obj.clone();
            Some(NativeFunction::value(name, move |_, _| Ok(Value::str(receiver.repr_leaf()))))
        }
        _ => None,
    }
}

fn type_module(t: Type) -> &'static str {
    match t {
        Type::Future | Type::Task | Type::Lock => "asyncio",
        Type::Exc(exc) => exc.module().unwrap_or("builtins"),
        _ => "builtins",
    }
}

fn short_name(qualname: &str) -> &str {
    qualname.rsplit('.').next().unwrap_or(qualname)
}

fn no_attribute(obj: &Value, name: &str) -> Exception {
    ExcType::AttributeError.msg(format!("'{}' object has no attribute '{name}'", obj.type_name()))
}
