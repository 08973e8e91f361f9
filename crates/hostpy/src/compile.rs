//! Validation and scope analysis: turns a parsed [`Module`] into a runnable [`Code`] object.
//!
//! The pass walks every statement once. It fills in [`ScopeInfo`] for each function and
//! comprehension, rejects constructs that are only legal in certain contexts (`return` outside a
//! function, `await` outside a coroutine, ...) and collects `__future__` imports.

use std::{ops::BitOr, rc::Rc};

use ahash::AHashSet;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    exception::RunResult,
    expressions::{
        CallArg, CompElement, Comprehension, DictItem, Expr, ExprLoc, FStringPart, FunctionDef, Keyword, Literal, Module,
        Node, ScopeInfo, StmtLoc, Target,
    },
    parse::{CodeRange, ParseError},
    transform::{self, ReturnMode},
};

/// Compiler flags, using the same bit values as CPython's `PyCF_*` / `CO_FUTURE_*` constants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CompileFlags(u32);

impl CompileFlags {
    pub const NONE: Self = Self(0);
    /// Accept `await`, `async for` and `async with` at module level.
    pub const ALLOW_TOP_LEVEL_AWAIT: Self = Self(0x2000);
    pub const FUTURE_DIVISION: Self = Self(0x2_0000);
    pub const FUTURE_ABSOLUTE_IMPORT: Self = Self(0x4_0000);
    pub const FUTURE_WITH_STATEMENT: Self = Self(0x8_0000);
    pub const FUTURE_PRINT_FUNCTION: Self = Self(0x10_0000);
    pub const FUTURE_UNICODE_LITERALS: Self = Self(0x20_0000);
    pub const FUTURE_BARRY_AS_BDFL: Self = Self(0x40_0000);
    pub const FUTURE_GENERATOR_STOP: Self = Self(0x80_0000);
    pub const FUTURE_ANNOTATIONS: Self = Self(0x100_0000);
    /// Every `__future__` feature bit.
    pub const FUTURE_MASK: Self = Self(0x1fe_0000);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Only the `__future__` feature bits of these flags.
    #[must_use]
    pub const fn future_features(self) -> Self {
        Self(self.0 & Self::FUTURE_MASK.0)
    }
}

impl BitOr for CompileFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// `compile()` modes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    #[default]
    Exec,
    Single,
    Eval,
}

/// `__future__` features and the flag each one sets. Features that are always on map to `NONE`.
pub(crate) const FUTURE_FEATURES: [(&str, CompileFlags); 10] = [
    ("nested_scopes", CompileFlags::NONE),
    ("generators", CompileFlags::NONE),
    ("division", CompileFlags::FUTURE_DIVISION),
    ("absolute_import", CompileFlags::FUTURE_ABSOLUTE_IMPORT),
    ("with_statement", CompileFlags::FUTURE_WITH_STATEMENT),
    ("print_function", CompileFlags::FUTURE_PRINT_FUNCTION),
    ("unicode_literals", CompileFlags::FUTURE_UNICODE_LITERALS),
    ("barry_as_FLUFL", CompileFlags::FUTURE_BARRY_AS_BDFL),
    ("generator_stop", CompileFlags::FUTURE_GENERATOR_STOP),
    ("annotations", CompileFlags::FUTURE_ANNOTATIONS),
];

/// Source text and filename of compiled code, shared by every function it defines.
#[derive(Debug)]
pub struct CodeInfo {
    filename: Rc<str>,
    lines: Vec<Rc<str>>,
}

impl CodeInfo {
    #[must_use]
    pub fn new(filename: impl Into<Rc<str>>, source: &str) -> Self {
        Self {
            filename: filename.into(),
            lines: source.lines().map(Rc::from).collect(),
        }
    }

    #[must_use]
    pub fn filename(&self) -> &Rc<str> {
        &self.filename
    }

    /// Source line for traceback display. Pseudo-files such as `<console>` have no line cache.
    #[must_use]
    pub fn line(&self, lineno: u32) -> Option<Rc<str>> {
        if self.filename.starts_with('<') && self.filename.ends_with('>') {
            return None;
        }
        let line = self.lines.get(lineno.checked_sub(1)? as usize)?;
        (!line.trim().is_empty()).then(|| line.clone())
    }
}

/// A compiled code object.
pub struct Code {
    pub(crate) module: Rc<Module>,
    pub(crate) info: Rc<CodeInfo>,
    flags: CompileFlags,
    mode: CompileMode,
    is_coroutine: bool,
}

impl Code {
    /// Flags the code was compiled with, including `__future__` features it imports.
    #[must_use]
    pub fn flags(&self) -> CompileFlags {
        self.flags
    }

    #[must_use]
    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    /// True if the module body uses top-level `await` and must be run as a coroutine
    /// (`CO_COROUTINE`).
    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.is_coroutine
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        self.info.filename()
    }
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Code")
            .field("filename", self.info.filename())
            .field("mode", &self.mode)
            .field("flags", &self.flags)
            .field("is_coroutine", &self.is_coroutine)
            .finish_non_exhaustive()
    }
}

/// Compiles a parsed module.
///
/// In `eval` mode the module must consist of a single expression statement, whose value the
/// code raises through the result sentinel.
pub fn compile(mut module: Module, source: &str, filename: &str, mode: CompileMode, flags: CompileFlags) -> RunResult<Code> {
    let mut compiler = Compiler::new(flags);
    let result = compiler.module(&mut module, mode);
    if let Err(err) = result {
        return Err(err.into_python_exc(filename, source));
    }
    if mode == CompileMode::Eval {
        transform::apply(&mut module, ReturnMode::LastExpr);
    }
    Ok(Code {
        module: Rc::new(module),
        info: Rc::new(CodeInfo::new(filename, source)),
        flags: flags | compiler.future_flags,
        mode,
        is_coroutine: compiler.is_coroutine,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

impl CompKind {
    fn description(self) -> &'static str {
        match self {
            Self::List => "list comprehension",
            Self::Set => "set comprehension",
            Self::Dict => "dict comprehension",
            Self::Generator => "generator expression",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Module,
    Class,
    Function { is_async: bool, is_lambda: bool },
    Comprehension(CompKind),
}

#[derive(Debug, Clone, Copy)]
enum AsyncUse {
    Await,
    For,
    With,
    Comprehension,
}

impl AsyncUse {
    fn outside_function(self) -> &'static str {
        match self {
            Self::Await => "'await' outside function",
            _ => self.outside_async(),
        }
    }

    fn outside_async(self) -> &'static str {
        match self {
            Self::Await => "'await' outside async function",
            Self::For => "'async for' outside async function",
            Self::With => "'async with' outside async function",
            Self::Comprehension => "asynchronous comprehension outside of an asynchronous function",
        }
    }
}

/// Facts collected for one scope while its body is walked.
struct ScopeBuilder {
    kind: BlockKind,
    bound: AHashSet<Rc<str>>,
    globals: AHashSet<Rc<str>>,
    nonlocals: Vec<(Rc<str>, CodeRange)>,
    is_generator: bool,
    return_with_value: Option<CodeRange>,
    loops: u32,
    /// `nonlocal` names of nested functions still looking for their binding.
    unresolved: Vec<(Rc<str>, CodeRange)>,
}

impl ScopeBuilder {
    fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            bound: AHashSet::new(),
            globals: AHashSet::new(),
            nonlocals: Vec::new(),
            is_generator: false,
            return_with_value: None,
            loops: 0,
            unresolved: Vec::new(),
        }
    }

    fn into_info(self) -> (ScopeInfo, Vec<(Rc<str>, CodeRange)>) {
        let nonlocals: AHashSet<Rc<str>> = self.nonlocals.iter().map(|(n, _)| n.clone()).collect();
        let locals: AHashSet<Rc<str>> = self
            .bound
            .into_iter()
            .filter(|n| !self.globals.contains(n) && !nonlocals.contains(n))
            .collect();
        let mut pending: Vec<_> = self
            .unresolved
            .into_iter()
            .filter(|(n, _)| !locals.contains(n))
            .collect();
        pending.extend(self.nonlocals);
        let info = ScopeInfo {
            locals,
            globals: self.globals,
            nonlocals,
            is_generator: self.is_generator,
        };
        (info, pending)
    }
}

type CompileResult = Result<(), ParseError>;

struct Compiler {
    flags: CompileFlags,
    scopes: Vec<ScopeBuilder>,
    is_coroutine: bool,
    future_flags: CompileFlags,
}

impl Compiler {
    fn new(flags: CompileFlags) -> Self {
        Self {
            flags,
            scopes: Vec::new(),
            is_coroutine: false,
            future_flags: CompileFlags::NONE,
        }
    }

    fn scope(&mut self) -> &mut ScopeBuilder {
        let index = self.scopes.len() - 1;
        &mut self.scopes[index]
    }

    fn kind(&self) -> BlockKind {
        self.scopes.last().map_or(BlockKind::Module, |s| s.kind)
    }

    fn module(&mut self, module: &mut Module, mode: CompileMode) -> CompileResult {
        if mode == CompileMode::Eval {
            let position = module.body.first().map(|s| s.position).unwrap_or_default();
            if module.body.len() != 1 || !matches!(module.body[0].node, Node::Expr(_)) {
                return Err(ParseError::syntax("invalid syntax", position));
            }
        }
        self.scopes.push(ScopeBuilder::new(BlockKind::Module));
        self.future_imports(&module.body)?;
        self.block(&mut module.body)?;
        let scope = self.scopes.pop().map(ScopeBuilder::into_info);
        if let Some((_, pending)) = scope
            && let Some((name, position)) = pending.into_iter().next()
        {
            return Err(ParseError::syntax(format!("no binding for nonlocal '{name}' found"), position));
        }
        Ok(())
    }

    /// Records `from __future__ import ...` at the top of the module and rejects later ones.
    fn future_imports(&mut self, body: &[StmtLoc]) -> CompileResult {
        let mut allowed = true;
        for (index, stmt) in body.iter().enumerate() {
            match &stmt.node {
                Node::ImportFrom {
                    module: Some(module),
                    names,
                    level: 0,
                } if module.as_ref() == "__future__" => {
                    if !allowed {
                        return Err(ParseError::syntax(
                            "from __future__ imports must occur at the beginning of the file",
                            stmt.position,
                        ));
                    }
                    for alias in names {
                        if alias.name.as_ref() == "braces" {
                            return Err(ParseError::syntax("not a chance", stmt.position));
                        }
                        let Some((_, flag)) = FUTURE_FEATURES.iter().find(|(name, _)| *name == alias.name.as_ref())
                        else {
                            return Err(ParseError::syntax(
                                format!("future feature {} is not defined", alias.name),
                                stmt.position,
                            ));
                        };
                        self.future_flags = self.future_flags | *flag;
                    }
                }
                Node::Expr(ExprLoc {
                    expr: Expr::Literal(Literal::Str(_)),
                    ..
                }) if index == 0 => {}
                _ => allowed = false,
            }
        }
        Ok(())
    }

    fn block(&mut self, body: &mut [StmtLoc]) -> CompileResult {
        body.iter_mut().try_for_each(|stmt| self.stmt(stmt))
    }

    fn bind(&mut self, name: &Rc<str>) {
        self.scope().bound.insert(name.clone());
    }

    fn stmt(&mut self, stmt: &mut StmtLoc) -> CompileResult {
        let position = stmt.position;
        match &mut stmt.node {
            Node::Expr(e) => self.expr(e),
            Node::Assign { targets, value } => {
                self.expr(value)?;
                targets.iter_mut().try_for_each(|t| self.target(t))
            }
            Node::AugAssign { target, value, .. } => {
                self.expr(value)?;
                self.target(target)
            }
            Node::AnnAssign { target, value, .. } => {
                if let Some(value) = value {
                    self.expr(value)?;
                }
                self.target(target)
            }
            Node::Delete(targets) => targets.iter_mut().try_for_each(|t| self.target(t)),
            Node::Pass => Ok(()),
            Node::Break => self.check_loop("'break' outside loop", position),
            Node::Continue => self.check_loop("'continue' not properly in loop", position),
            Node::Return(value) => {
                if !matches!(self.kind(), BlockKind::Function { .. }) {
                    return Err(ParseError::syntax("'return' outside function", position));
                }
                if let Some(value) = value {
                    self.scope().return_with_value.get_or_insert(position);
                    self.expr(value)?;
                }
                Ok(())
            }
            Node::Raise { exc, cause } => {
                self.opt_expr(exc.as_mut())?;
                self.opt_expr(cause.as_mut())
            }
            Node::Assert { test, msg } => {
                self.expr(test)?;
                self.opt_expr(msg.as_mut())
            }
            Node::If { test, body, or_else } => {
                self.expr(test)?;
                self.block(body)?;
                self.block(or_else)
            }
            Node::While { test, body, or_else } => {
                self.expr(test)?;
                self.loop_body(body)?;
                self.block(or_else)
            }
            Node::For {
                target,
                iter,
                body,
                or_else,
                is_async,
            } => {
                if *is_async {
                    self.check_async(AsyncUse::For, position)?;
                }
                self.expr(iter)?;
                self.target(target)?;
                self.loop_body(body)?;
                self.block(or_else)
            }
            Node::Try(t) => {
                self.block(&mut t.body)?;
                for handler in &mut t.handlers {
                    self.opt_expr(handler.exc_type.as_mut())?;
                    if let Some(name) = &handler.name {
                        let name = name.name.clone();
                        self.bind(&name);
                    }
                    self.block(&mut handler.body)?;
                }
                self.block(&mut t.or_else)?;
                self.block(&mut t.finally)
            }
            Node::With { items, body, is_async } => {
                if *is_async {
                    self.check_async(AsyncUse::With, position)?;
                }
                for item in items {
                    self.expr(&mut item.context_expr)?;
                    if let Some(target) = &mut item.target {
                        self.target(target)?;
                    }
                }
                self.block(body)
            }
            Node::FunctionDef(def) => {
                {
                    let def = Rc::make_mut(def);
                    for decorator in &mut def.decorators {
                        self.expr(decorator)?;
                    }
                }
                let name = def.name.clone();
                self.bind(&name);
                self.function(def)
            }
            Node::ClassDef(def) => {
                let def = Rc::make_mut(def);
                for e in def.decorators.iter_mut().chain(def.bases.iter_mut()) {
                    self.expr(e)?;
                }
                self.keywords(&mut def.keywords)?;
                self.bind(&def.name);
                self.scopes.push(ScopeBuilder::new(BlockKind::Class));
                let result = self.block(&mut def.body);
                let class_scope = self.scopes.pop();
                result?;
                // names bound in a class body live in the class namespace; only pass nonlocal
                // lookups through
                if let Some(class_scope) = class_scope {
                    let mut pending = class_scope.unresolved;
                    pending.extend(class_scope.nonlocals);
                    self.scope().unresolved.extend(pending);
                }
                Ok(())
            }
            Node::Import(aliases) => {
                for alias in aliases.iter() {
                    let bound = match &alias.asname {
                        Some(asname) => asname.clone(),
                        None => alias.name.split('.').next().unwrap_or_default().into(),
                    };
                    self.bind(&bound);
                }
                Ok(())
            }
            Node::ImportFrom { names, .. } => {
                for alias in names.iter() {
                    if alias.name.as_ref() == "*" {
                        if !matches!(self.kind(), BlockKind::Module) {
                            return Err(ParseError::syntax("import * only allowed at module level", position));
                        }
                        continue;
                    }
                    let bound = alias.asname.clone().unwrap_or_else(|| alias.name.clone());
                    self.bind(&bound);
                }
                Ok(())
            }
            Node::Global(names) => {
                let names = names.clone();
                self.scope().globals.extend(names);
                Ok(())
            }
            Node::Nonlocal(names) => {
                if matches!(self.kind(), BlockKind::Module) {
                    return Err(ParseError::syntax("nonlocal declaration not allowed at module level", position));
                }
                let names = names.clone();
                self.scope().nonlocals.extend(names.into_iter().map(|n| (n, position)));
                Ok(())
            }
        }
    }

    fn check_loop(&mut self, msg: &'static str, position: CodeRange) -> CompileResult {
        if self.scopes.last().is_some_and(|s| s.loops > 0) {
            Ok(())
        } else {
            Err(ParseError::syntax(msg, position))
        }
    }

    fn loop_body(&mut self, body: &mut [StmtLoc]) -> CompileResult {
        self.scope().loops += 1;
        let result = self.block(body);
        self.scope().loops -= 1;
        result
    }

    fn check_async(&mut self, use_: AsyncUse, position: CodeRange) -> CompileResult {
        for scope in self.scopes.iter().rev() {
            match scope.kind {
                BlockKind::Comprehension(CompKind::Generator) => {
                    return Err(ParseError::not_implemented("asynchronous generator expressions", position));
                }
                BlockKind::Comprehension(_) => {}
                BlockKind::Function {
                    is_async: true,
                    is_lambda: false,
                } => return Ok(()),
                BlockKind::Function { .. } => return Err(ParseError::syntax(use_.outside_async(), position)),
                BlockKind::Class => return Err(ParseError::syntax(use_.outside_function(), position)),
                BlockKind::Module => {
                    if self.flags.contains(CompileFlags::ALLOW_TOP_LEVEL_AWAIT) {
                        self.is_coroutine = true;
                        return Ok(());
                    }
                    return Err(ParseError::syntax(use_.outside_function(), position));
                }
            }
        }
        Err(ParseError::syntax(use_.outside_function(), position))
    }

    fn function(&mut self, def: &mut Rc<FunctionDef>) -> CompileResult {
        let def = Rc::make_mut(def);
        for param in def
            .params
            .posonly
            .iter_mut()
            .chain(def.params.args.iter_mut())
            .chain(def.params.kwonly.iter_mut())
        {
            if let Some(default) = &mut param.default {
                self.expr(default)?;
            }
        }
        let mut scope = ScopeBuilder::new(BlockKind::Function {
            is_async: def.is_async,
            is_lambda: def.is_lambda,
        });
        scope.bound.extend(def.params.names().cloned());
        self.scopes.push(scope);
        let result = self.block(&mut def.body);
        let Some(scope) = self.scopes.pop() else {
            return result;
        };
        result?;
        if def.is_async
            && scope.is_generator
            && let Some(position) = scope.return_with_value
        {
            return Err(ParseError::syntax("'return' with value in async generator", position));
        }
        let (info, pending) = scope.into_info();
        def.scope = info;
        self.scope().unresolved.extend(pending);
        Ok(())
    }

    fn comprehension(&mut self, comp: &mut Rc<Comprehension>, kind: CompKind) -> CompileResult {
        let comp = Rc::make_mut(comp);
        // the outermost iterable is evaluated in the enclosing scope
        if let Some(first) = comp.generators.first_mut() {
            self.expr(&mut first.iter)?;
        }
        self.scopes.push(ScopeBuilder::new(BlockKind::Comprehension(kind)));
        let result = self.comprehension_body(comp, kind);
        let Some(scope) = self.scopes.pop() else {
            return result;
        };
        result?;
        let (info, pending) = scope.into_info();
        comp.scope = info;
        self.scope().unresolved.extend(pending);
        Ok(())
    }

    fn comprehension_body(&mut self, comp: &mut Comprehension, kind: CompKind) -> CompileResult {
        let position = comp.position;
        for (index, generator) in comp.generators.iter_mut().enumerate() {
            if generator.is_async {
                if kind == CompKind::Generator {
                    return Err(ParseError::not_implemented("asynchronous generator expressions", position));
                }
                self.check_async(AsyncUse::Comprehension, position)?;
            }
            if index > 0 {
                self.expr(&mut generator.iter)?;
            }
            self.target(&mut generator.target)?;
            for cond in &mut generator.ifs {
                self.expr(cond)?;
            }
        }
        match &mut comp.element {
            CompElement::Single(e) => self.expr(e),
            CompElement::Pair(k, v) => {
                self.expr(k)?;
                self.expr(v)
            }
        }
    }

    fn target(&mut self, target: &mut Target) -> CompileResult {
        match target {
            Target::Name(ident) => {
                let name = ident.name.clone();
                self.bind(&name);
                Ok(())
            }
            Target::Attribute { object, .. } => self.expr(object),
            Target::Subscript { object, index } => {
                self.expr(object)?;
                self.expr(index)
            }
            Target::Tuple(targets) => targets.iter_mut().try_for_each(|t| self.target(t)),
            Target::Starred(inner) => self.target(inner),
        }
    }

    /// Binds a walrus target in the nearest scope that is not a comprehension.
    fn bind_walrus(&mut self, name: &Rc<str>, position: CodeRange) -> CompileResult {
        let in_comprehension = matches!(self.kind(), BlockKind::Comprehension(_));
        let Some(scope) = self
            .scopes
            .iter_mut()
            .rev()
            .find(|s| !matches!(s.kind, BlockKind::Comprehension(_)))
        else {
            return Ok(());
        };
        if in_comprehension && scope.kind == BlockKind::Class {
            return Err(ParseError::syntax(
                "assignment expression within a comprehension cannot be used in a class body",
                position,
            ));
        }
        scope.bound.insert(name.clone());
        Ok(())
    }

    fn opt_expr(&mut self, e: Option<&mut ExprLoc>) -> CompileResult {
        e.map_or(Ok(()), |e| self.expr(e))
    }

    fn keywords(&mut self, keywords: &mut [Keyword]) -> CompileResult {
        keywords.iter_mut().try_for_each(|k| self.expr(&mut k.value))
    }

    fn fstring(&mut self, parts: &mut [FStringPart]) -> CompileResult {
        for part in parts {
            if let FStringPart::Interpolation { expr, format_spec, .. } = part {
                self.expr(expr)?;
                if let Some(spec) = format_spec {
                    self.fstring(spec)?;
                }
            }
        }
        Ok(())
    }

    fn expr(&mut self, e: &mut ExprLoc) -> CompileResult {
        let position = e.position;
        match &mut e.expr {
            Expr::Literal(_) | Expr::Name(_) => Ok(()),
            Expr::FString(parts) => self.fstring(parts),
            Expr::Attribute { object, .. } => self.expr(object),
            Expr::Subscript { object, index } => {
                self.expr(object)?;
                self.expr(index)
            }
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part)?;
                }
                Ok(())
            }
            Expr::Call { func, args, keywords } => {
                self.expr(func)?;
                for arg in args {
                    match arg {
                        CallArg::Positional(a) | CallArg::Starred(a) => self.expr(a)?,
                    }
                }
                self.keywords(keywords)
            }
            Expr::Op { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::BoolOp { values, .. } | Expr::List(values) | Expr::Tuple(values) | Expr::Set(values) => {
                values.iter_mut().try_for_each(|v| self.expr(v))
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Compare { left, comparisons } => {
                self.expr(left)?;
                comparisons.iter_mut().try_for_each(|(_, c)| self.expr(c))
            }
            Expr::IfElse { test, body, orelse } => {
                self.expr(test)?;
                self.expr(body)?;
                self.expr(orelse)
            }
            Expr::Named { target, value } => {
                self.expr(value)?;
                let name = target.name.clone();
                self.bind_walrus(&name, position)
            }
            Expr::Dict(items) => {
                for item in items {
                    match item {
                        DictItem::Pair(k, v) => {
                            self.expr(k)?;
                            self.expr(v)?;
                        }
                        DictItem::Unpack(v) => self.expr(v)?,
                    }
                }
                Ok(())
            }
            Expr::Starred(inner) => self.expr(inner),
            Expr::Lambda(def) => self.function(def),
            Expr::ListComp(comp) => self.comprehension(comp, CompKind::List),
            Expr::SetComp(comp) => self.comprehension(comp, CompKind::Set),
            Expr::DictComp(comp) => self.comprehension(comp, CompKind::Dict),
            Expr::GeneratorExp(comp) => self.comprehension(comp, CompKind::Generator),
            Expr::Await(inner) => {
                self.check_async(AsyncUse::Await, position)?;
                self.expr(inner)
            }
            Expr::Yield(value) => {
                self.mark_generator(position, false)?;
                self.opt_expr(value.as_deref_mut())
            }
            Expr::YieldFrom(value) => {
                self.mark_generator(position, true)?;
                self.expr(value)
            }
        }
    }

    fn mark_generator(&mut self, position: CodeRange, from: bool) -> CompileResult {
        match self.kind() {
            BlockKind::Function { is_async, .. } => {
                if from && is_async {
                    return Err(ParseError::syntax("'yield from' inside async function", position));
                }
                self.scope().is_generator = true;
                Ok(())
            }
            BlockKind::Comprehension(kind) => Err(ParseError::syntax(
                format!("'yield' inside {}", kind.description()),
                position,
            )),
            BlockKind::Module | BlockKind::Class => Err(ParseError::syntax("'yield' outside function", position)),
        }
    }
}

