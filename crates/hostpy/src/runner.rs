//! Running source fragments: [`CodeRunner`], [`eval_code`], [`eval_code_async`] and
//! [`find_imports`].
//!
//! The value of a fragment's last expression leaves the module body through the result
//! sentinel exception (see [`crate::transform`]), so running code never inspects its locals.

use std::{borrow::Cow, cell::RefCell, collections::BTreeSet, rc::Rc};

use ruff_python_ast::{
    Stmt,
    statement_visitor::{StatementVisitor, walk_stmt},
};
use ruff_python_parser::parse_module;

use crate::{
    compile::{Code, CompileFlags, CompileMode, compile},
    eval::{module_future, run_sync},
    exception::{ExcType, RunResult},
    expressions::Module,
    parse::{dedent, parse},
    runtime::Runtime,
    transform::{self, ReturnMode, should_quiet},
    types::{Coroutine, Dict},
    value::{DictRef, Value},
};

/// Options for [`CodeRunner`], [`eval_code`] and [`eval_code_async`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Which trailing statement provides the result.
    pub return_mode: ReturnMode,
    /// Return `None` when the source ends with a semicolon, whatever `return_mode` says.
    pub quiet_trailing_semicolon: bool,
    pub mode: CompileMode,
    /// Filename recorded in tracebacks.
    pub filename: String,
    pub flags: CompileFlags,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            return_mode: ReturnMode::LastExpr,
            quiet_trailing_semicolon: true,
            mode: CompileMode::Exec,
            filename: "<exec>".to_owned(),
            flags: CompileFlags::NONE,
        }
    }
}

/// Fine control over running a block of code: parse, optionally rewrite [`CodeRunner::ast`],
/// compile once, then run synchronously or as a coroutine.
#[derive(Debug)]
pub struct CodeRunner {
    /// The parsed source. Hosts may rewrite it before [`CodeRunner::compile`].
    pub ast: Module,
    source: String,
    return_mode: ReturnMode,
    options: RunnerOptions,
    code: Option<Rc<Code>>,
}

impl CodeRunner {
    /// Dedents and parses `source`. Syntax errors are raised here.
    pub fn new(source: &str, options: RunnerOptions) -> RunResult<Self> {
        let source = dedent(source).into_owned();
        let ast = parse(&source).map_err(|err| err.into_python_exc(&options.filename, &source))?;
        let mut return_mode = options.return_mode;
        if options.quiet_trailing_semicolon && should_quiet(&source) {
            return_mode = ReturnMode::None;
        }
        // eval mode code raises its value by construction
        if options.mode == CompileMode::Eval {
            return_mode = ReturnMode::None;
        }
        Ok(Self {
            ast,
            source,
            return_mode,
            options,
            code: None,
        })
    }

    /// The source after dedenting.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The compiled code, once [`CodeRunner::compile`] has been called.
    #[must_use]
    pub fn code(&self) -> Option<&Code> {
        self.code.as_deref()
    }

    /// Applies the return-mode rewrite to [`CodeRunner::ast`] and compiles it.
    ///
    /// Can only be called once.
    pub fn compile(&mut self) -> RunResult<&mut Self> {
        if self.code.is_some() {
            return Err(ExcType::RuntimeError.msg("Already compiled"));
        }
        let mut module = std::mem::take(&mut self.ast);
        transform::apply(&mut module, self.return_mode);
        self.ast = module.clone();
        let code = compile(
            module,
            &self.source,
            &self.options.filename,
            self.options.mode,
            self.options.flags,
        )?;
        self.code = Some(Rc::new(code));
        Ok(self)
    }

    fn compiled(&self) -> RunResult<Rc<Code>> {
        self.code
            .clone()
            .ok_or_else(|| ExcType::RuntimeError.msg("Not yet compiled"))
    }

    /// Runs the code synchronously and returns the value of its last expression.
    ///
    /// Code that uses top-level `await` must go through [`CodeRunner::run_async`].
    pub fn run(&self, rt: &Runtime, globals: Option<DictRef>, locals: Option<DictRef>) -> RunResult<Value> {
        let code = self.compiled()?;
        if code.is_coroutine() {
            return Err(ExcType::RuntimeError.msg(
                "Used eval_code with TOP_LEVEL_AWAIT. Use run_async for this instead.",
            ));
        }
        let globals = globals.unwrap_or_else(empty_namespace);
        take_result(run_sync(module_future(rt, &code, globals, locals)))
    }

    /// Runs the code as a coroutine, which may use top-level `await`.
    pub fn run_async(&self, rt: &Runtime, globals: Option<DictRef>, locals: Option<DictRef>) -> RunResult<Coroutine> {
        let code = self.compiled()?;
        let globals = globals.unwrap_or_else(empty_namespace);
        let body = module_future(rt, &code, globals, locals);
        Ok(Coroutine::from_future("<module>", async move { take_result(body.await) }))
    }
}

fn empty_namespace() -> DictRef {
    Rc::new(RefCell::new(Dict::new()))
}

/// Maps the result sentinel to the value it carries; a body that finishes normally gives `None`.
fn take_result(outcome: RunResult<Value>) -> RunResult<Value> {
    match outcome {
        Ok(_) => Ok(Value::None),
        Err(exc) if exc.exc_type() == ExcType::EvalCodeResult => Ok(exc.first_arg()),
        Err(exc) => Err(exc),
    }
}

/// Runs `source` synchronously and returns the value of its last expression (or assignment,
/// depending on `options.return_mode`).
///
/// `globals` defaults to a new empty namespace; `locals` defaults to `globals`.
pub fn eval_code(
    rt: &Runtime,
    source: &str,
    globals: Option<DictRef>,
    locals: Option<DictRef>,
    options: RunnerOptions,
) -> RunResult<Value> {
    let mut runner = CodeRunner::new(source, options)?;
    runner.compile()?.run(rt, globals, locals)
}

/// Like [`eval_code`], but top-level `await` is allowed and the result is a coroutine to be
/// awaited or scheduled on the event loop.
pub fn eval_code_async(
    rt: &Runtime,
    source: &str,
    globals: Option<DictRef>,
    locals: Option<DictRef>,
    mut options: RunnerOptions,
) -> RunResult<Coroutine> {
    options.flags = options.flags | CompileFlags::ALLOW_TOP_LEVEL_AWAIT;
    let mut runner = CodeRunner::new(source, options)?;
    runner.compile()?.run_async(rt, globals, locals)
}

/// Module names imported anywhere in `source`, with every parent package, sorted and without
/// duplicates. `import a.b.c` gives `a`, `a.b` and `a.b.c`.
///
/// Any syntactically valid source is accepted, including constructs the interpreter cannot run.
/// Source that does not parse gives an empty list.
#[must_use]
pub fn find_imports(source: &str) -> Vec<String> {
    let Ok(parsed) = parse_module(&dedent(source)) else {
        return Vec::new();
    };
    let mut collector = ImportCollector::default();
    collector.visit_body(&parsed.syntax().body);
    collector.imports.into_iter().collect()
}

#[derive(Default)]
struct ImportCollector {
    imports: BTreeSet<String>,
}

impl<'a> StatementVisitor<'a> for ImportCollector {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Import(import) => {
                for alias in &import.names {
                    add_prefixes(&mut self.imports, alias.name.as_str());
                }
            }
            Stmt::ImportFrom(import) => {
                if let Some(module) = &import.module {
                    add_prefixes(&mut self.imports, module.as_str());
                }
            }
            _ => walk_stmt(self, stmt),
        }
    }
}

fn add_prefixes(imports: &mut BTreeSet<String>, module: &str) {
    let mut end = 0;
    for part in module.split('.') {
        end += part.len();
        imports.insert(module[..end].to_owned());
        end += 1;
    }
}

/// `repr(value)`, with the middle elided when it is longer than `limit` characters: the first
/// and last `split` characters (default `limit / 2`) joined by `separator`.
pub fn repr_shorten(
    rt: &Runtime,
    value: &Value,
    limit: usize,
    split: Option<usize>,
    separator: &str,
) -> RunResult<String> {
    let repr = rt.repr(value)?;
    Ok(shorten(&repr, limit, split, separator).into_owned())
}

fn shorten<'a>(text: &'a str, limit: usize, split: Option<usize>, separator: &str) -> Cow<'a, str> {
    let length = text.chars().count();
    if length <= limit {
        return Cow::Borrowed(text);
    }
    let split = split.unwrap_or(limit / 2);
    let head: String = text.chars().take(split).collect();
    let tail: String = text.chars().skip(length.saturating_sub(split)).collect();
    Cow::Owned(format!("{head}{separator}{tail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorten_keeps_short_text() {
        assert_eq!(shorten("abc", 10, None, "..."), "abc");
    }

    #[test]
    fn shorten_elides_the_middle() {
        assert_eq!(shorten("abcdefghij", 4, None, "..."), "ab...ij");
        assert_eq!(shorten("abcdefghij", 4, Some(1), "<>"), "a<>j");
    }

    #[test]
    fn prefixes_of_dotted_names() {
        let mut imports = BTreeSet::new();
        add_prefixes(&mut imports, "a.bc.d");
        assert_eq!(imports.into_iter().collect::<Vec<_>>(), vec!["a", "a.bc", "a.bc.d"]);
    }
}
