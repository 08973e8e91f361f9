use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use super::{Frame, FrameFuture, Locals, Scope, ScopeOwner, statements::assign};
use crate::{
    args::Args,
    exception::{ExcType, RunResult},
    expressions::{
        BoolOperator, CallArg, CompElement, Comprehension, ConversionFlag, DictItem, Expr, ExprLoc, FStringPart,
        FunctionDef, Keyword, Literal, Target, UnaryOperator,
    },
    fstring,
    runtime::Runtime,
    types::{Dict, Function, GenChannel, GenCore, GenStep, Generator, LocalBoxFuture, Resume},
    value::{SliceObj, Value},
    webloop::{FutureAwait, YieldOnce},
};

/// Evaluates an expression.
pub(crate) fn eval_expr<'a>(frame: &'a Frame, expr: &'a ExprLoc) -> LocalBoxFuture<'a, RunResult<Value>> {
    Box::pin(async move {
        let rt = &frame.rt;
        match &expr.expr {
            Expr::Literal(literal) => Ok(literal_value(literal)),
            Expr::FString(parts) => Ok(Value::str(fstring_value(frame, parts).await?)),
            Expr::Name(ident) => frame.load(ident),
            Expr::Attribute { object, attr } => {
                let object = eval_expr(frame, object).await?;
                rt.getattr(&object, attr)
            }
            Expr::Subscript { object, index } => {
                let object = eval_expr(frame, object).await?;
                let index = eval_expr(frame, index).await?;
                rt.getitem(&object, &index)
            }
            Expr::Slice { lower, upper, step } => {
                let mut parts = [Value::None, Value::None, Value::None];
                for (slot, part) in parts.iter_mut().zip([lower, upper, step]) {
                    if let Some(part) = part {
                        *slot = eval_expr(frame, part).await?;
                    }
                }
                let [start, stop, step] = parts;
                Ok(Value::Slice(Rc::new(SliceObj { start, stop, step })))
            }
            Expr::Call { func, args, keywords } => {
                let callee = eval_expr(frame, func).await?;
                let args = call_args(frame, &callee, args, keywords).await?;
                rt.call(&callee, args)
            }
            Expr::Op { left, op, right } => {
                let left = eval_expr(frame, left).await?;
                let right = eval_expr(frame, right).await?;
                rt.binary_op(&left, *op, &right)
            }
            Expr::BoolOp { op, values } => {
                let mut result = Value::None;
                for value in values {
                    result = eval_expr(frame, value).await?;
                    let truthy = rt.truthy(&result)?;
                    if truthy == (*op == BoolOperator::Or) {
                        break;
                    }
                }
                Ok(result)
            }
            Expr::Unary { op, operand } => {
                let operand = eval_expr(frame, operand).await?;
                match op {
                    UnaryOperator::Not => Ok(Value::Bool(!rt.truthy(&operand)?)),
                    _ => rt.unary_op(*op, &operand),
                }
            }
            Expr::Compare { left, comparisons } => {
                let mut left = eval_expr(frame, left).await?;
                let mut result = Value::Bool(true);
                for (op, right) in comparisons {
                    let right = eval_expr(frame, right).await?;
                    result = rt.compare(&left, *op, &right)?;
                    if !rt.truthy(&result)? {
                        break;
                    }
                    left = right;
                }
                Ok(result)
            }
            Expr::IfElse { test, body, orelse } => {
                let test = eval_expr(frame, test).await?;
                if rt.truthy(&test)? {
                    eval_expr(frame, body).await
                } else {
                    eval_expr(frame, orelse).await
                }
            }
            Expr::Named { target, value } => {
                let value = eval_expr(frame, value).await?;
                frame.store(&target.name, value.clone())?;
                Ok(value)
            }
            Expr::List(items) => Ok(Value::list(display_items(frame, items).await?)),
            Expr::Tuple(items) => Ok(Value::tuple(display_items(frame, items).await?)),
            Expr::Set(items) => {
                let items = display_items(frame, items).await?;
                rt.new_set(items)
            }
            Expr::Dict(items) => {
                let mut dict = Dict::new();
                for item in items {
                    match item {
                        DictItem::Pair(key, value) => {
                            let key = eval_expr(frame, key).await?;
                            let value = eval_expr(frame, value).await?;
                            dict.set(key, value)?;
                        }
                        DictItem::Unpack(mapping) => {
                            let mapping = eval_expr(frame, mapping).await?;
                            for (key, value) in rt.mapping_items(&mapping)? {
                                dict.set(key, value)?;
                            }
                        }
                    }
                }
                Ok(Value::dict(dict))
            }
            Expr::Starred(_) => Err(ExcType::SyntaxError.msg("can't use starred expression here")),
            Expr::Lambda(def) => define_function(frame, def).await,
            Expr::ListComp(comp) => comprehension(frame, comp, Sink::List(Vec::new())).await,
            Expr::SetComp(comp) => comprehension(frame, comp, Sink::Set(Vec::new())).await,
            Expr::DictComp(comp) => comprehension(frame, comp, Sink::Dict(Dict::new())).await,
            Expr::GeneratorExp(comp) => generator_expression(frame, comp).await,
            Expr::Await(inner) => {
                let awaitable = eval_expr(frame, inner).await?;
                await_value(rt, awaitable).await
            }
            Expr::Yield(value) => {
                let value = match value {
                    Some(value) => eval_expr(frame, value).await?,
                    None => Value::None,
                };
                let channel = frame
                    .gen
                    .as_ref()
                    .ok_or_else(|| ExcType::SyntaxError.msg("'yield' outside function"))?;
                channel.yield_value(value).await
            }
            Expr::YieldFrom(inner) => {
                let iterable = eval_expr(frame, inner).await?;
                yield_from(frame, iterable).await
            }
        }
    })
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::None => Value::None,
        Literal::Ellipsis => Value::Ellipsis,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::BigInt(b) => Value::BigInt(b.clone()),
        Literal::Float(f) => Value::Float(*f),
        Literal::Str(s) => Value::Str(s.clone()),
    }
}

/// Renders an f-string; format specs may nest interpolations.
fn fstring_value<'a>(frame: &'a Frame, parts: &'a [FStringPart]) -> LocalBoxFuture<'a, RunResult<String>> {
    Box::pin(async move {
        let rt = &frame.rt;
        let mut out = String::new();
        for part in parts {
            match part {
                FStringPart::Literal(text) => out.push_str(text),
                FStringPart::Interpolation {
                    expr,
                    conversion,
                    format_spec,
                    debug_prefix,
                } => {
                    let value = eval_expr(frame, expr).await?;
                    let spec = match format_spec {
                        Some(spec) => fstring_value(frame, spec).await?,
                        None => String::new(),
                    };
                    if let Some(prefix) = debug_prefix {
                        out.push_str(prefix);
                    }
                    let conversion = match conversion {
                        ConversionFlag::None if debug_prefix.is_some() && format_spec.is_none() => ConversionFlag::Repr,
                        other => *other,
                    };
                    let value = match conversion {
                        ConversionFlag::None => value,
                        ConversionFlag::Str => Value::str(rt.str(&value)?),
                        ConversionFlag::Repr => Value::str(rt.repr(&value)?),
                        ConversionFlag::Ascii => Value::str(fstring::ascii_escape(&rt.repr(&value)?)),
                    };
                    out.push_str(&fstring::format_value(rt, &value, &spec)?);
                }
            }
        }
        Ok(out)
    })
}

/// Items of a list, tuple or set display, expanding `*iterable`.
async fn display_items(frame: &Frame, items: &[ExprLoc]) -> RunResult<Vec<Value>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if let Expr::Starred(inner) = &item.expr {
            let iterable = eval_expr(frame, inner).await?;
            out.extend(frame.rt.to_vec(&iterable)?);
        } else {
            out.push(eval_expr(frame, item).await?);
        }
    }
    Ok(out)
}

async fn call_args(frame: &Frame, callee: &Value, args: &[CallArg], keywords: &[Keyword]) -> RunResult<Args> {
    let rt = &frame.rt;
    let mut positional = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            CallArg::Positional(e) => positional.push(eval_expr(frame, e).await?),
            CallArg::Starred(e) => {
                let iterable = eval_expr(frame, e).await?;
                let items = rt.to_vec(&iterable).map_err(|_| {
                    ExcType::TypeError.msg(format!(
                        "{}() argument after * must be an iterable, not {}",
                        rt.callable_name(callee),
                        iterable.type_name()
                    ))
                })?;
                positional.extend(items);
            }
        }
    }
    let mut named: Vec<(Rc<str>, Value)> = Vec::with_capacity(keywords.len());
    for keyword in keywords {
        let value = eval_expr(frame, &keyword.value).await?;
        let pairs = match &keyword.name {
            Some(name) => vec![(name.clone(), value)],
            None => {
                let mut pairs = Vec::new();
                for (key, value) in rt.mapping_items(&value)? {
                    let Value::Str(key) = key else {
                        return Err(ExcType::TypeError.msg("keywords must be strings"));
                    };
                    pairs.push((key, value));
                }
                pairs
            }
        };
        for (name, value) in pairs {
            if named.iter().any(|(existing, _)| *existing == name) {
                return Err(ExcType::TypeError.msg(format!(
                    "{}() got multiple values for keyword argument '{name}'",
                    rt.callable_name(callee)
                )));
            }
            named.push((name, value));
        }
    }
    Ok(Args::new(positional, named))
}

/// Evaluates defaults and creates the function object for a `def` or `lambda`.
pub(crate) async fn define_function(frame: &Frame, def: &Rc<FunctionDef>) -> RunResult<Value> {
    let params = &def.params;
    let mut defaults = Vec::with_capacity(params.posonly.len() + params.args.len());
    for param in params.posonly.iter().chain(&params.args) {
        defaults.push(match &param.default {
            Some(default) => Some(eval_expr(frame, default).await?),
            None => None,
        });
    }
    let mut kw_defaults = Vec::with_capacity(params.kwonly.len());
    for param in &params.kwonly {
        kw_defaults.push(match &param.default {
            Some(default) => Some(eval_expr(frame, default).await?),
            None => None,
        });
    }
    Ok(Value::Function(Rc::new(Function {
        def: def.clone(),
        code: frame.code.clone(),
        globals: frame.globals.clone(),
        closure: frame.current_scope(),
        defaults,
        kw_defaults,
        owner: RefCell::new(None),
        attrs: RefCell::new(IndexMap::new()),
    })))
}

/// Splits `value` across unpacking targets, collecting a starred target into a list.
pub(crate) fn unpack(rt: &Runtime, value: &Value, targets: &[Target]) -> RunResult<Vec<Value>> {
    let mut items = rt.to_vec(value).map_err(|exc| {
        if exc.is_instance(ExcType::TypeError) && rt.iter(value).is_err() {
            ExcType::TypeError.msg(format!("cannot unpack non-iterable {} object", value.type_name()))
        } else {
            exc
        }
    })?;
    let expected = targets.len();
    let got = items.len();
    match targets.iter().position(|t| matches!(t, Target::Starred(_))) {
        None if got > expected => Err(ExcType::ValueError.msg(format!(
            "too many values to unpack (expected {expected})"
        ))),
        None if got < expected => Err(ExcType::ValueError.msg(format!(
            "not enough values to unpack (expected {expected}, got {got})"
        ))),
        None => Ok(items),
        Some(_) if got < expected - 1 => Err(ExcType::ValueError.msg(format!(
            "not enough values to unpack (expected at least {}, got {got})",
            expected - 1
        ))),
        Some(star) => {
            let after = expected - star - 1;
            let tail = items.split_off(got - after);
            let middle = items.split_off(star);
            items.push(Value::list(middle));
            items.extend(tail);
            Ok(items)
        }
    }
}

/// Where comprehension elements go.
enum Sink {
    List(Vec<Value>),
    Set(Vec<Value>),
    Dict(Dict),
    /// Generator expressions yield each element.
    Yield,
}

async fn comprehension(frame: &Frame, comp: &Rc<Comprehension>, mut sink: Sink) -> RunResult<Value> {
    let first = eval_expr(frame, &comp.generators[0].iter).await?;
    let scope = Rc::new(Scope::new(
        ScopeOwner::Comprehension(comp.clone()),
        frame.current_scope(),
        Default::default(),
    ));
    let saved = frame.locals.replace(Locals::Function(scope));
    let result = comprehension_loop(frame, comp, 0, first, &mut sink).await;
    drop(frame.locals.replace(saved));
    result?;
    match sink {
        Sink::List(items) => Ok(Value::list(items)),
        Sink::Set(items) => frame.rt.new_set(items),
        Sink::Dict(dict) => Ok(Value::dict(dict)),
        Sink::Yield => Ok(Value::None),
    }
}

fn comprehension_loop<'a>(
    frame: &'a Frame,
    comp: &'a Comprehension,
    index: usize,
    iterable: Value,
    sink: &'a mut Sink,
) -> LocalBoxFuture<'a, RunResult<()>> {
    Box::pin(async move {
        let rt = &frame.rt;
        let generator = &comp.generators[index];
        let iterator = if generator.is_async {
            rt.aiter(&iterable)?
        } else {
            rt.iter(&iterable)?
        };
        loop {
            let item = if generator.is_async {
                let awaitable = rt.anext(&iterator)?;
                match await_value(rt, awaitable).await {
                    Ok(item) => item,
                    Err(exc) if exc.is_instance(ExcType::StopAsyncIteration) => break,
                    Err(exc) => return Err(exc),
                }
            } else {
                match rt.iter_next(&iterator)? {
                    Some(item) => item,
                    None => break,
                }
            };
            assign(frame, &generator.target, item).await?;
            let mut keep = true;
            for cond in &generator.ifs {
                let test = eval_expr(frame, cond).await?;
                if !rt.truthy(&test)? {
                    keep = false;
                    break;
                }
            }
            if !keep {
                continue;
            }
            if let Some(next) = comp.generators.get(index + 1) {
                let inner = eval_expr(frame, &next.iter).await?;
                comprehension_loop(frame, comp, index + 1, inner, sink).await?;
                continue;
            }
            match (&comp.element, &mut *sink) {
                (CompElement::Single(e), Sink::List(items) | Sink::Set(items)) => items.push(eval_expr(frame, e).await?),
                (CompElement::Single(e), Sink::Yield) => {
                    let value = eval_expr(frame, e).await?;
                    if let Some(channel) = &frame.gen {
                        channel.yield_value(value).await?;
                    }
                }
                (CompElement::Pair(k, v), Sink::Dict(dict)) => {
                    let key = eval_expr(frame, k).await?;
                    let value = eval_expr(frame, v).await?;
                    dict.set(key, value)?;
                }
                _ => return Err(ExcType::RuntimeError.msg("comprehension element does not match its display")),
            }
        }
        Ok(())
    })
}

/// Builds the generator object for `(element for target in iterable)`.
async fn generator_expression(frame: &Frame, comp: &Rc<Comprehension>) -> RunResult<Value> {
    let first = eval_expr(frame, &comp.generators[0].iter).await?;
    let first = frame.rt.iter(&first)?;
    let scope = Rc::new(Scope::new(
        ScopeOwner::Comprehension(comp.clone()),
        frame.current_scope(),
        Default::default(),
    ));
    let channel = Rc::new(GenChannel::default());
    let gen_frame = Rc::new(Frame {
        gen: Some(channel.clone()),
        ..Frame::new(
            &frame.rt,
            frame.globals.clone(),
            Locals::Function(scope),
            frame.code.clone(),
            "<genexpr>".into(),
        )
    });
    gen_frame.line.set(frame.line.get());
    let body = {
        let gen_frame = gen_frame.clone();
        let comp = comp.clone();
        async move {
            let mut sink = Sink::Yield;
            comprehension_loop(&gen_frame, &comp, 0, first, &mut sink).await?;
            Ok(Value::None)
        }
    };
    let future = FrameFuture::new(gen_frame, Box::pin(body));
    Ok(Value::Generator(Generator::new(GenCore::new(
        "<genexpr>".into(),
        channel,
        Box::pin(future),
    ))))
}

/// `yield from iterable`: delegates to a sub-generator, forwarding sent and thrown values.
async fn yield_from(frame: &Frame, iterable: Value) -> RunResult<Value> {
    let rt = &frame.rt;
    let channel = frame
        .gen
        .clone()
        .ok_or_else(|| ExcType::SyntaxError.msg("'yield from' outside function"))?;
    match iterable {
        Value::Generator(sub) => {
            let mut resume = Resume::Send(Value::None);
            loop {
                match sub.resume(resume)? {
                    GenStep::Returned(value) => return Ok(value),
                    GenStep::Yielded(value) => {
                        resume = match channel.yield_value(value).await {
                            Ok(sent) => Resume::Send(sent),
                            Err(exc) if exc.is_instance(ExcType::GeneratorExit) => {
                                sub.close()?;
                                return Err(exc);
                            }
                            Err(exc) => Resume::Throw(exc),
                        };
                    }
                }
            }
        }
        Value::Coroutine(_) => Err(ExcType::TypeError.msg(
            "cannot 'yield from' a coroutine object in a non-coroutine generator",
        )),
        other => {
            let iterator = rt.iter(&other)?;
            while let Some(item) = rt.iter_next(&iterator)? {
                channel.yield_value(item).await?;
            }
            Ok(Value::None)
        }
    }
}

/// Awaits any awaitable: coroutines, futures, tasks, syncifyable tasks and objects with
/// `__await__`.
pub(crate) fn await_value(rt: &Runtime, value: Value) -> LocalBoxFuture<'_, RunResult<Value>> {
    Box::pin(async move {
        match value {
            Value::Coroutine(coro) => coro.take_body()?.await,
            Value::Future(fut) => FutureAwait::new(fut).await,
            Value::Task(task) => FutureAwait::new(task.future()).await,
            Value::SyncTask(task) => {
                task.schedule_async(rt)?;
                FutureAwait::new(task.future()).await
            }
            other => {
                let Some(method) = rt.lookup_special(&other, "__await__") else {
                    return Err(ExcType::TypeError.msg(format!(
                        "object {} can't be used in 'await' expression",
                        other.type_name()
                    )));
                };
                let iterator = rt.call(&method, Args::empty())?;
                drive_await_iterator(rt, iterator).await
            }
        }
    })
}

/// Runs the iterator returned by `__await__`: yielded futures are awaited and their results
/// sent back in; a bare `yield` gives the loop one turn.
async fn drive_await_iterator(rt: &Runtime, iterator: Value) -> RunResult<Value> {
    let generator = match iterator {
        Value::Generator(g) => g,
        Value::Coroutine(_) | Value::Future(_) | Value::Task(_) => return await_value(rt, iterator).await,
        other => {
            return Err(ExcType::TypeError.msg(format!(
                "__await__() returned non-iterator of type '{}'",
                other.type_name()
            )));
        }
    };
    let mut resume = Resume::Send(Value::None);
    loop {
        match generator.resume(resume)? {
            GenStep::Returned(value) => return Ok(value),
            GenStep::Yielded(Value::None) => {
                resume = match YieldOnce::default().await {
                    Ok(()) => Resume::Send(Value::None),
                    Err(exc) => Resume::Throw(exc),
                };
            }
            GenStep::Yielded(yielded @ (Value::Future(_) | Value::Task(_))) => {
                resume = match await_value(rt, yielded).await {
                    Ok(value) => Resume::Send(value),
                    Err(exc) => Resume::Throw(exc),
                };
            }
            GenStep::Yielded(other) => {
                return Err(ExcType::RuntimeError.msg(format!(
                    "Task got bad yield: {}",
                    rt.repr(&other)?
                )));
            }
        }
    }
}
