//! Incremental compilation of interactive input.
//!
//! [`IncrementalCompiler`] tells three outcomes apart, like the standard library's `codeop`:
//! a runnable [`CodeRunner`], `None` for input that is the start of a valid statement, or a
//! raised `SyntaxError`. It also remembers `__future__` imports between inputs.

use std::cell::Cell;

use crate::{
    compile::{CompileFlags, CompileMode},
    exception::RunResult,
    parse::{SourceScan, dedent, parse},
    runner::{CodeRunner, RunnerOptions},
    transform::ReturnMode,
};

/// Compiles console input, remembering `__future__` features and reporting incomplete input.
///
/// Every compile allows top-level `await`.
#[derive(Debug)]
pub struct IncrementalCompiler {
    return_mode: ReturnMode,
    quiet_trailing_semicolon: bool,
    flags: Cell<CompileFlags>,
}

impl Default for IncrementalCompiler {
    fn default() -> Self {
        Self::new(ReturnMode::LastExpr, true, CompileFlags::NONE)
    }
}

impl IncrementalCompiler {
    #[must_use]
    pub fn new(return_mode: ReturnMode, quiet_trailing_semicolon: bool, flags: CompileFlags) -> Self {
        Self {
            return_mode,
            quiet_trailing_semicolon,
            flags: Cell::new(flags | CompileFlags::ALLOW_TOP_LEVEL_AWAIT),
        }
    }

    /// Flags the next compile will use.
    #[must_use]
    pub fn flags(&self) -> CompileFlags {
        self.flags.get()
    }

    /// Compiles `source`, or returns `None` if more input is needed to complete it.
    pub fn compile(&self, source: &str, filename: &str, mode: CompileMode) -> RunResult<Option<CodeRunner>> {
        if is_incomplete(source, mode) {
            return Ok(None);
        }
        let options = RunnerOptions {
            return_mode: self.return_mode,
            quiet_trailing_semicolon: self.quiet_trailing_semicolon,
            mode,
            filename: filename.to_owned(),
            flags: self.flags.get(),
        };
        let mut runner = CodeRunner::new(source, options)?;
        runner.compile()?;
        if let Some(code) = runner.code() {
            self.flags.set(self.flags.get() | code.flags().future_features());
        }
        Ok(Some(runner))
    }
}

/// True if `source` does not parse yet but could with more lines, or if it ends in a compound
/// statement that still needs its terminating blank line.
fn is_incomplete(source: &str, mode: CompileMode) -> bool {
    let source = dedent(source);
    match parse(&source) {
        Ok(module) => {
            mode == CompileMode::Single
                && !source.ends_with('\n')
                && module.body.last().is_some_and(|stmt| stmt.node.is_compound())
        }
        Err(_) => {
            let scan = SourceScan::new(&source);
            scan.is_open() || (scan.ends_with_block_opener() && !source.ends_with('\n'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_constructs_are_incomplete() {
        for source in ["def f(x):", "x = (1,", "s = '''abc", "x = 1 + \\", "@decorator"] {
            assert!(is_incomplete(source, CompileMode::Single), "{source:?} should be incomplete");
        }
    }

    #[test]
    fn compound_statements_wait_for_a_blank_line() {
        assert!(is_incomplete("def f(x):\n    return x+1", CompileMode::Single));
        assert!(!is_incomplete("def f(x):\n    return x+1\n", CompileMode::Single));
    }

    #[test]
    fn simple_statements_are_complete() {
        assert!(!is_incomplete("f(10)", CompileMode::Single));
        assert!(!is_incomplete("", CompileMode::Single));
    }

    #[test]
    fn real_errors_are_not_incomplete() {
        assert!(!is_incomplete("1 +* 2", CompileMode::Single));
        assert!(!is_incomplete("x = )", CompileMode::Single));
    }
}
