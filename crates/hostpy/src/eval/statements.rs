use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::{
    Flow, Frame, FrameFuture, Locals, await_value, eval_expr,
    expressions::{define_function, unpack},
    run_sync,
};
use crate::{
    args::Args,
    exception::{ExcClass, ExcType, Exception, RunResult},
    expressions::{ClassDef, ExceptHandler, ImportAlias, Node, StmtLoc, Target, Try, WithItem},
    runtime::Runtime,
    types::{Class, Descriptor, LocalBoxFuture},
    value::{Type, Value},
};

/// Runs a block, stopping at the first statement that does not complete normally.
pub(crate) fn exec_block<'a>(frame: &'a Frame, body: &'a [StmtLoc]) -> LocalBoxFuture<'a, RunResult<Flow>> {
    Box::pin(async move {
        for stmt in body {
            let flow = exec_stmt(frame, stmt).await?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    })
}

async fn exec_stmt(frame: &Frame, stmt: &StmtLoc) -> RunResult<Flow> {
    frame.line.set(stmt.position.line());
    let rt = &frame.rt;
    match &stmt.node {
        Node::Expr(e) => {
            eval_expr(frame, e).await?;
        }
        Node::Assign { targets, value } => {
            let value = eval_expr(frame, value).await?;
            for target in targets {
                assign(frame, target, value.clone()).await?;
            }
        }
        Node::AugAssign { target, op, value } => match target {
            Target::Name(ident) => {
                let current = frame.load(ident)?;
                let rhs = eval_expr(frame, value).await?;
                let result = rt.inplace_op(&current, *op, &rhs)?;
                frame.store(&ident.name, result)?;
            }
            Target::Attribute { object, attr } => {
                let object = eval_expr(frame, object).await?;
                let current = rt.getattr(&object, attr)?;
                let rhs = eval_expr(frame, value).await?;
                let result = rt.inplace_op(&current, *op, &rhs)?;
                rt.setattr(&object, attr, result)?;
            }
            Target::Subscript { object, index } => {
                let object = eval_expr(frame, object).await?;
                let index = eval_expr(frame, index).await?;
                let current = rt.getitem(&object, &index)?;
                let rhs = eval_expr(frame, value).await?;
                let result = rt.inplace_op(&current, *op, &rhs)?;
                rt.setitem(&object, index, result)?;
            }
            Target::Tuple(_) | Target::Starred(_) => {
                return Err(ExcType::SyntaxError.msg("illegal expression for augmented assignment"));
            }
        },
        Node::AnnAssign { target, value, .. } => {
            if let Some(value) = value {
                let value = eval_expr(frame, value).await?;
                assign(frame, target, value).await?;
            }
        }
        Node::Delete(targets) => {
            for target in targets {
                delete(frame, target).await?;
            }
        }
        Node::Pass | Node::Global(_) | Node::Nonlocal(_) => {}
        Node::Break => return Ok(Flow::Break),
        Node::Continue => return Ok(Flow::Continue),
        Node::Return(value) => {
            let value = match value {
                Some(value) => eval_expr(frame, value).await?,
                None => Value::None,
            };
            return Ok(Flow::Return(value));
        }
        Node::Raise { exc, cause } => {
            let Some(exc) = exc else {
                let active = frame.handling.borrow().last().cloned();
                return Err(active.unwrap_or_else(|| ExcType::RuntimeError.msg("No active exception to reraise")));
            };
            let exc = eval_expr(frame, exc).await?;
            let exception = rt.make_exception(exc)?;
            if let Some(cause) = cause {
                match eval_expr(frame, cause).await? {
                    Value::None => exception.set_cause(None),
                    cause => exception.set_cause(Some(rt.make_exception(cause)?)),
                }
            }
            return Err(exception);
        }
        Node::Assert { test, msg } => {
            let test = eval_expr(frame, test).await?;
            if !rt.truthy(&test)? {
                let args = match msg {
                    Some(msg) => vec![eval_expr(frame, msg).await?],
                    None => Vec::new(),
                };
                return Err(Exception::new(ExcType::AssertionError, args));
            }
        }
        Node::If { test, body, or_else } => {
            let test = eval_expr(frame, test).await?;
            let branch = if rt.truthy(&test)? { body } else { or_else };
            return exec_block(frame, branch).await;
        }
        Node::While { test, body, or_else } => {
            loop {
                let value = eval_expr(frame, test).await?;
                if !rt.truthy(&value)? {
                    break;
                }
                match exec_block(frame, body).await? {
                    Flow::Break => return Ok(Flow::Normal),
                    Flow::Normal | Flow::Continue => {}
                    flow @ Flow::Return(_) => return Ok(flow),
                }
            }
            return exec_block(frame, or_else).await;
        }
        Node::For {
            target,
            iter,
            body,
            or_else,
            is_async,
        } => {
            let iterable = eval_expr(frame, iter).await?;
            let finished = if *is_async {
                async_for_loop(frame, iterable, target, body).await?
            } else {
                for_loop(frame, iterable, target, body).await?
            };
            return match finished {
                Some(flow) => Ok(flow),
                None => exec_block(frame, or_else).await,
            };
        }
        Node::Try(t) => return try_stmt(frame, t).await,
        Node::With { items, body, is_async } => return with_items(frame, items, body, *is_async).await,
        Node::FunctionDef(def) => {
            let mut decorators: SmallVec<[Value; 2]> = SmallVec::new();
            for decorator in &def.decorators {
                decorators.push(eval_expr(frame, decorator).await?);
            }
            let mut func = define_function(frame, def).await?;
            for decorator in decorators.iter().rev() {
                func = rt.call(decorator, Args::one(func))?;
            }
            frame.store(&def.name, func)?;
        }
        Node::ClassDef(def) => {
            let class = define_class(frame, def).await?;
            frame.store(&def.name, class)?;
        }
        Node::Import(aliases) => import(frame, aliases)?,
        Node::ImportFrom { module, names, level } => {
            if *level > 0 {
                return Err(ExcType::ImportError.msg("attempted relative import with no known parent package"));
            }
            let module_name = module.clone().unwrap_or_default();
            import_from(frame, &module_name, names)?;
        }
    }
    Ok(Flow::Normal)
}

/// Binds `value` to an assignment target.
pub(crate) fn assign<'a>(frame: &'a Frame, target: &'a Target, value: Value) -> LocalBoxFuture<'a, RunResult<()>> {
    Box::pin(async move {
        match target {
            Target::Name(ident) => frame.store(&ident.name, value),
            Target::Attribute { object, attr } => {
                let object = eval_expr(frame, object).await?;
                frame.rt.setattr(&object, attr, value)
            }
            Target::Subscript { object, index } => {
                let object = eval_expr(frame, object).await?;
                let index = eval_expr(frame, index).await?;
                frame.rt.setitem(&object, index, value)
            }
            Target::Tuple(targets) => {
                let values = unpack(&frame.rt, &value, targets)?;
                for (target, value) in targets.iter().zip(values) {
                    let target = match target {
                        Target::Starred(inner) => inner.as_ref(),
                        other => other,
                    };
                    assign(frame, target, value).await?;
                }
                Ok(())
            }
            Target::Starred(_) => Err(ExcType::SyntaxError.msg("starred assignment target must be in a list or tuple")),
        }
    })
}

fn delete<'a>(frame: &'a Frame, target: &'a Target) -> LocalBoxFuture<'a, RunResult<()>> {
    Box::pin(async move {
        match target {
            Target::Name(ident) => frame.delete(&ident.name),
            Target::Attribute { object, attr } => {
                let object = eval_expr(frame, object).await?;
                frame.rt.delattr(&object, attr)
            }
            Target::Subscript { object, index } => {
                let object = eval_expr(frame, object).await?;
                let index = eval_expr(frame, index).await?;
                frame.rt.delitem(&object, &index)
            }
            Target::Tuple(targets) => {
                for target in targets {
                    delete(frame, target).await?;
                }
                Ok(())
            }
            Target::Starred(_) => Err(ExcType::SyntaxError.msg("cannot delete starred")),
        }
    })
}

/// Runs a `for` body over `iterable`. `None` means the loop ran to exhaustion, so `else` runs.
async fn for_loop(frame: &Frame, iterable: Value, target: &Target, body: &[StmtLoc]) -> RunResult<Option<Flow>> {
    let rt = &frame.rt;
    let iterator = rt.iter(&iterable)?;
    while let Some(item) = rt.iter_next(&iterator)? {
        assign(frame, target, item).await?;
        match exec_block(frame, body).await? {
            Flow::Break => return Ok(Some(Flow::Normal)),
            Flow::Normal | Flow::Continue => {}
            flow @ Flow::Return(_) => return Ok(Some(flow)),
        }
    }
    Ok(None)
}

async fn async_for_loop(frame: &Frame, iterable: Value, target: &Target, body: &[StmtLoc]) -> RunResult<Option<Flow>> {
    let rt = &frame.rt;
    let iterator = rt.aiter(&iterable)?;
    loop {
        let awaitable = rt.anext(&iterator)?;
        let item = match await_value(rt, awaitable).await {
            Ok(item) => item,
            Err(exc) if exc.is_instance(ExcType::StopAsyncIteration) => return Ok(None),
            Err(exc) => return Err(exc),
        };
        assign(frame, target, item).await?;
        match exec_block(frame, body).await? {
            Flow::Break => return Ok(Some(Flow::Normal)),
            Flow::Normal | Flow::Continue => {}
            flow @ Flow::Return(_) => return Ok(Some(flow)),
        }
    }
}

async fn try_stmt(frame: &Frame, t: &Try) -> RunResult<Flow> {
    let result = match exec_block(frame, &t.body).await {
        Err(exc) if !t.handlers.is_empty() => handle(frame, &t.handlers, exc).await,
        Ok(Flow::Normal) if !t.or_else.is_empty() => exec_block(frame, &t.or_else).await,
        other => other,
    };
    if t.finally.is_empty() {
        return result;
    }
    if let Err(exc) = &result {
        frame.handling.borrow_mut().push(exc.clone());
    }
    let finally = exec_block(frame, &t.finally).await;
    if result.is_err() {
        frame.handling.borrow_mut().pop();
    }
    match finally {
        Ok(Flow::Normal) => result,
        Ok(flow) => Ok(flow),
        Err(exc) => {
            if let Err(previous) = &result {
                exc.set_context(previous.clone());
            }
            Err(exc)
        }
    }
}

/// Finds the handler matching `exc` and runs it; re-raises `exc` when none matches.
async fn handle(frame: &Frame, handlers: &[ExceptHandler], exc: Exception) -> RunResult<Flow> {
    let mut chosen = None;
    for handler in handlers {
        let matches = match &handler.exc_type {
            None => true,
            Some(expr) => {
                let class = eval_expr(frame, expr).await?;
                exception_matches(&exc, &class)?
            }
        };
        if matches {
            chosen = Some(handler);
            break;
        }
    }
    let Some(handler) = chosen else {
        return Err(exc);
    };
    if let Some(name) = &handler.name {
        frame.store(&name.name, Value::Exception(exc.clone()))?;
    }
    frame.handling.borrow_mut().push(exc.clone());
    let result = exec_block(frame, &handler.body).await;
    frame.handling.borrow_mut().pop();
    if let Some(name) = &handler.name {
        // the name is unbound at the end of the handler, even if the body deleted it already
        let _ = frame.delete(&name.name);
    }
    if let Err(raised) = &result {
        raised.set_context(exc);
    }
    result
}

/// `isinstance(exc, class)` for `except` clauses, where `class` may be a tuple.
pub(crate) fn exception_matches(exc: &Exception, class: &Value) -> RunResult<bool> {
    match class {
        Value::Type(Type::Exc(t)) => Ok(exc.is_instance(*t)),
        Value::Class(c) if c.exc_base.is_some() => Ok(match exc.class() {
            ExcClass::User(own) => own.is_subclass_of(c),
            ExcClass::Builtin(_) => false,
        }),
        Value::Tuple(items) => {
            for item in items.iter() {
                if exception_matches(exc, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(ExcType::TypeError.msg("catching classes that do not inherit from BaseException is not allowed")),
    }
}

/// Runs `with a, b: body` as nested single-item `with` statements.
fn with_items<'a>(
    frame: &'a Frame,
    items: &'a [WithItem],
    body: &'a [StmtLoc],
    is_async: bool,
) -> LocalBoxFuture<'a, RunResult<Flow>> {
    Box::pin(async move {
        let Some((item, rest)) = items.split_first() else {
            return exec_block(frame, body).await;
        };
        let rt = &frame.rt;
        let manager = eval_expr(frame, &item.context_expr).await?;
        if let (true, Value::Lock(lock)) = (is_async, &manager) {
            lock.acquire(rt).await?;
            let result = async {
                if let Some(target) = &item.target {
                    assign(frame, target, Value::None).await?;
                }
                with_items(frame, rest, body, is_async).await
            }
            .await;
            lock.release()?;
            return result;
        }
        let (enter, exit) = if is_async {
            ("__aenter__", "__aexit__")
        } else {
            ("__enter__", "__exit__")
        };
        let Some(exit_fn) = rt.lookup_special(&manager, exit) else {
            return Err(ExcType::TypeError.msg(format!(
                "'{}' object does not support the {}context manager protocol",
                manager.type_name(),
                if is_async { "asynchronous " } else { "" }
            )));
        };
        let mut entered = rt.call_method(&manager, enter, Args::empty())?;
        if is_async {
            entered = await_value(rt, entered).await?;
        }
        let result = async {
            if let Some(target) = &item.target {
                assign(frame, target, entered).await?;
            }
            with_items(frame, rest, body, is_async).await
        }
        .await;
        match result {
            Ok(flow) => {
                let mut done = rt.call(&exit_fn, Args::positional(vec![Value::None, Value::None, Value::None]))?;
                if is_async {
                    done = await_value(rt, done).await?;
                }
                drop(done);
                Ok(flow)
            }
            Err(exc) => {
                let args = vec![Value::Exception(exc.clone()).py_type(), Value::Exception(exc.clone()), Value::None];
                let mut suppress = rt.call(&exit_fn, Args::positional(args))?;
                if is_async {
                    suppress = await_value(rt, suppress).await?;
                }
                if rt.truthy(&suppress)? { Ok(Flow::Normal) } else { Err(exc) }
            }
        }
    })
}

async fn define_class(frame: &Frame, def: &Rc<ClassDef>) -> RunResult<Value> {
    let rt = &frame.rt;
    let mut decorators: SmallVec<[Value; 2]> = SmallVec::new();
    for decorator in &def.decorators {
        decorators.push(eval_expr(frame, decorator).await?);
    }
    let mut bases = Vec::with_capacity(def.bases.len());
    for base in &def.bases {
        bases.push(eval_expr(frame, base).await?);
    }
    if let Some(keyword) = def.keywords.first() {
        let name = keyword.name.as_deref().unwrap_or("**");
        return Err(ExcType::NotImplementedError.msg(format!(
            "hostpy does not yet support class keyword argument '{name}'"
        )));
    }
    let module = frame.module_name();
    let ns = Rc::new(RefCell::new(IndexMap::new()));
    ns.borrow_mut().insert(Rc::from("__module__"), Value::Str(module.clone()));
    ns.borrow_mut()
        .insert(Rc::from("__qualname__"), Value::Str(def.qualname.clone()));
    let class_frame = Rc::new(Frame::new(
        rt,
        frame.globals.clone(),
        Locals::Class {
            ns: ns.clone(),
            enclosing: frame.current_scope(),
        },
        frame.code.clone(),
        def.name.clone(),
    ));
    let body = {
        let class_frame = class_frame.clone();
        let def = def.clone();
        async move {
            exec_block(&class_frame, &def.body).await?;
            Ok(Value::None)
        }
    };
    run_sync(FrameFuture::new(class_frame, Box::pin(body)))?;
    let mut dict = std::mem::take(&mut *ns.borrow_mut());
    dict.shift_remove("__qualname__");
    let class = Rc::new(Class::new(def.name.clone(), def.qualname.clone(), module, bases, dict)?);
    for value in class.dict.borrow().values() {
        let func = match value {
            Value::Descriptor(d) => match &**d {
                Descriptor::Property { fget, fset, fdel } => {
                    for f in [fget, fset, fdel] {
                        set_owner(f, &class);
                    }
                    continue;
                }
                Descriptor::StaticMethod(f) | Descriptor::ClassMethod(f) => f,
            },
            other => other,
        };
        set_owner(func, &class);
    }
    let mut value = Value::Class(class);
    for decorator in decorators.iter().rev() {
        value = rt.call(decorator, Args::one(value))?;
    }
    Ok(value)
}

fn set_owner(func: &Value, class: &Rc<Class>) {
    if let Value::Function(f) = func
        && f.owner.borrow().is_none()
    {
        *f.owner.borrow_mut() = Some(Rc::downgrade(class));
    }
}

fn import(frame: &Frame, aliases: &[ImportAlias]) -> RunResult<()> {
    for alias in aliases {
        let module = frame.rt.import_module(&alias.name)?;
        match &alias.asname {
            Some(asname) => frame.store(asname, module)?,
            None => match alias.name.split_once('.') {
                Some((top, _)) => {
                    let top_module = frame.rt.import_module(top)?;
                    frame.store(&Rc::from(top), top_module)?;
                }
                None => frame.store(&alias.name, module)?,
            },
        }
    }
    Ok(())
}

fn import_from(frame: &Frame, module_name: &str, names: &[ImportAlias]) -> RunResult<()> {
    let rt = &frame.rt;
    let module = rt.import_module(module_name)?;
    for alias in names {
        if alias.name.as_ref() == "*" {
            for (name, value) in public_names(rt, &module)? {
                frame.store(&name, value)?;
            }
            continue;
        }
        let value = match rt.getattr(&module, &alias.name) {
            Ok(value) => value,
            Err(exc) if exc.is_instance(ExcType::AttributeError) => rt
                .import_module(&format!("{module_name}.{}", alias.name))
                .map_err(|_| {
                    ExcType::ImportError.msg(format!(
                        "cannot import name '{}' from '{module_name}' (unknown location)",
                        alias.name
                    ))
                })?,
            Err(exc) => return Err(exc),
        };
        let bound = alias.asname.as_ref().unwrap_or(&alias.name);
        frame.store(bound, value)?;
    }
    Ok(())
}

/// Names `from module import *` binds: `__all__` when defined, else names without a leading `_`.
fn public_names(rt: &Runtime, module: &Value) -> RunResult<Vec<(Rc<str>, Value)>> {
    let Value::Module(m) = module else {
        return Ok(Vec::new());
    };
    if let Some(all) = m.get("__all__") {
        let mut names = Vec::new();
        for name in rt.to_vec(&all)? {
            let Value::Str(name) = name else {
                return Err(ExcType::TypeError.msg("Item in module.__all__ must be str"));
            };
            let value = rt.getattr(module, &name)?;
            names.push((name, value));
        }
        return Ok(names);
    }
    Ok(m.attrs
        .borrow()
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect())
}
