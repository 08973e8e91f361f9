use std::{borrow::Cow, fmt, rc::Rc};

use num_bigint::BigInt;
use ruff_python_ast::{
    self as ast, BoolOp, CmpOp, ConversionFlag as RuffConversionFlag, ElifElseClause, Expr as AstExpr,
    InterpolatedStringElement, Number, Operator as AstOperator, ParameterWithDefault, Stmt, UnaryOp,
};
use ruff_python_parser::{parse_expression, parse_module};
use ruff_text_size::{Ranged, TextRange};

use crate::{
    exception::{ExcType, Exception, SyntaxLocation},
    expressions::{
        BoolOperator, CallArg, CmpOperator, CompElement, CompFor, Comprehension, ConversionFlag, DictItem,
        ExceptHandler, Expr, ExprLoc, FStringPart, FunctionDef, Identifier, ImportAlias, Keyword, Literal, Module,
        Node, Operator, Param, Parameters, ScopeInfo, StmtLoc, Target, Try, UnaryOperator, WithItem,
    },
};

/// Maximum nesting depth for AST structures during conversion.
#[cfg(not(debug_assertions))]
pub const MAX_NESTING_DEPTH: u16 = 200;
/// Debug builds have much larger stack frames.
#[cfg(debug_assertions)]
pub const MAX_NESTING_DEPTH: u16 = 60;

/// A 1-based line and 0-based column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

/// Source span of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CodeRange {
    pub start: CodeLoc,
    pub end: CodeLoc,
}

impl CodeRange {
    /// Line the node starts on, used for traceback entries.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.start.line
    }
}

/// Errors that can occur while converting source into the interpreter AST.
#[derive(Debug, Clone)]
pub enum ParseError {
    /// Error in syntax.
    Syntax { msg: Cow<'static, str>, position: CodeRange },
    /// Valid Python that the interpreter does not run.
    /// Message gets prefixed with "hostpy does not yet support ".
    NotImplemented { msg: Cow<'static, str>, position: CodeRange },
}

impl ParseError {
    pub(crate) fn syntax(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::Syntax {
            msg: msg.into(),
            position,
        }
    }

    pub(crate) fn not_implemented(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::NotImplemented {
            msg: msg.into(),
            position,
        }
    }

    #[must_use]
    pub fn position(&self) -> CodeRange {
        match self {
            Self::Syntax { position, .. } | Self::NotImplemented { position, .. } => *position,
        }
    }

    /// Converts this parser error into a Python `SyntaxError` with source location.
    #[must_use]
    pub fn into_python_exc(self, filename: &str, source: &str) -> Exception {
        let position = self.position();
        let msg = match self {
            Self::Syntax { msg, .. } => msg.into_owned(),
            Self::NotImplemented { msg, .. } => format!("hostpy does not yet support {msg}"),
        };
        let text = source
            .lines()
            .nth(position.start.line.saturating_sub(1) as usize)
            .unwrap_or_default()
            .to_owned();
        let exc_type = if msg.contains("indent") {
            ExcType::IndentationError
        } else {
            ExcType::SyntaxError
        };
        Exception::syntax_error(
            exc_type,
            msg,
            SyntaxLocation {
                filename: filename.to_owned(),
                lineno: position.start.line,
                offset: position.start.column + 1,
                text,
            },
        )
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { msg, position } => write!(f, "{msg} (line {})", position.start.line),
            Self::NotImplemented { msg, position } => {
                write!(f, "hostpy does not yet support {msg} (line {})", position.start.line)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses a module, converting the ruff AST into the interpreter's own.
pub(crate) fn parse(code: &str) -> Result<Module, ParseError> {
    let mut parser = Parser::new(code);
    let parsed = parse_module(code).map_err(|e| ParseError::syntax(e.error.to_string(), parser.convert_range(e.location)))?;
    let module = parsed.into_syntax();
    let body = parser.parse_statements(module.body)?;
    Ok(Module { body })
}

/// Parses a single expression (`eval` mode).
pub(crate) fn parse_eval(code: &str) -> Result<ExprLoc, ParseError> {
    let mut parser = Parser::new(code);
    let parsed =
        parse_expression(code).map_err(|e| ParseError::syntax(e.error.to_string(), parser.convert_range(e.location)))?;
    let expression = parsed.into_syntax();
    parser.parse_expression(*expression.body)
}

/// Removes common leading whitespace from every non-blank line, like `textwrap.dedent`.
#[must_use]
pub fn dedent(source: &str) -> Cow<'_, str> {
    let margin = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| &line[..line.len() - line.trim_start().len()])
        .reduce(|acc, indent| {
            let common = acc.bytes().zip(indent.bytes()).take_while(|(a, b)| a == b).count();
            &acc[..common]
        })
        .unwrap_or("");
    if margin.is_empty() {
        return Cow::Borrowed(source);
    }
    let mut out = String::with_capacity(source.len());
    for line in source.split_inclusive('\n') {
        if line.trim().is_empty() {
            // whitespace-only lines are normalized to just their newline
            if line.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(line.strip_prefix(margin).unwrap_or(line));
        }
    }
    Cow::Owned(out)
}

/// Lexical facts about the end of a source fragment.
///
/// This is a small tokenizer that only tracks strings, comments and brackets. It is used for
/// quiet-semicolon detection and to tell incomplete interactive input from real errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceScan {
    /// Unclosed `(`, `[` and `{` at the end of input.
    pub open_brackets: usize,
    /// The input ends inside a triple-quoted string.
    pub in_triple_string: bool,
    /// The last physical line ends with a backslash continuation.
    pub continuation: bool,
    /// Last character that is not whitespace or part of a comment.
    pub last_code_char: Option<char>,
    /// The last line holding code, with comments and surrounding whitespace removed.
    pub last_code_line: String,
}

impl SourceScan {
    #[must_use]
    pub fn new(source: &str) -> Self {
        let mut scan = Self::default();
        let mut line = String::new();
        let mut chars = source.chars().peekable();
        let mut quote: Option<(char, bool)> = None;
        while let Some(c) = chars.next() {
            if let Some((q, triple)) = quote {
                line.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        line.push(escaped);
                    }
                } else if c == q {
                    if !triple {
                        quote = None;
                    } else if chars.peek() == Some(&q) {
                        chars.next();
                        if chars.peek() == Some(&q) {
                            chars.next();
                            line.push_str(&format!("{q}{q}"));
                            quote = None;
                        }
                    }
                } else if c == '\n' && !triple {
                    quote = None;
                }
                if quote.is_none() {
                    scan.last_code_char = Some(q);
                }
                continue;
            }
            match c {
                '#' => {
                    while chars.peek().is_some_and(|&n| n != '\n') {
                        chars.next();
                    }
                }
                '\n' => {
                    if !line.trim().is_empty() {
                        scan.last_code_line = line.trim().to_owned();
                    }
                    line.clear();
                }
                '"' | '\'' => {
                    line.push(c);
                    let mut triple = false;
                    if chars.peek() == Some(&c) {
                        chars.next();
                        line.push(c);
                        if chars.peek() == Some(&c) {
                            chars.next();
                            line.push(c);
                            triple = true;
                        } else {
                            // empty string literal
                            scan.last_code_char = Some(c);
                            continue;
                        }
                    }
                    quote = Some((c, triple));
                }
                _ => {
                    line.push(c);
                    match c {
                        '(' | '[' | '{' => scan.open_brackets += 1,
                        ')' | ']' | '}' => scan.open_brackets = scan.open_brackets.saturating_sub(1),
                        _ => {}
                    }
                    if !c.is_whitespace() {
                        scan.last_code_char = Some(c);
                    }
                }
            }
        }
        if !line.trim().is_empty() {
            scan.last_code_line = line.trim().to_owned();
        }
        scan.in_triple_string = matches!(quote, Some((_, true)));
        let last_physical = source.strip_suffix('\n').unwrap_or(source);
        scan.continuation = quote.is_none() && last_physical.ends_with('\\');
        scan
    }

    /// True if input is lexically unfinished: open brackets, open triple quote or a trailing backslash.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open_brackets > 0 || self.in_triple_string || self.continuation
    }

    /// True if the last code line is a block header (`if x:`) or a decorator waiting for its target.
    #[must_use]
    pub fn ends_with_block_opener(&self) -> bool {
        const KEYWORDS: [&str; 15] = [
            "if", "elif", "else", "for", "while", "try", "except", "finally", "with", "def", "class", "async",
            "match", "case", "lambda",
        ];
        let line = self.last_code_line.as_str();
        if line.starts_with('@') {
            return true;
        }
        let first_word = line
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
            .unwrap_or_default();
        line.ends_with(':') && KEYWORDS.contains(&first_word)
    }
}

/// Converts ruff AST nodes into the interpreter AST.
struct Parser<'a> {
    code: &'a str,
    /// Byte offset of the start of each line.
    line_starts: Vec<usize>,
    /// Qualified name prefixes of the enclosing definitions.
    qualname_stack: Vec<String>,
    depth_remaining: u16,
}

impl<'a> Parser<'a> {
    fn new(code: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(code.match_indices('\n').map(|(i, _)| i + 1));
        Self {
            code,
            line_starts,
            qualname_stack: Vec::new(),
            depth_remaining: MAX_NESTING_DEPTH,
        }
    }

    fn parse_statements(&mut self, statements: Vec<Stmt>) -> Result<Vec<StmtLoc>, ParseError> {
        statements.into_iter().map(|s| self.parse_statement(s)).collect()
    }

    fn parse_statement(&mut self, statement: Stmt) -> Result<StmtLoc, ParseError> {
        self.decr_depth_remaining(|| statement.range())?;
        let position = self.convert_range(statement.range());
        let result = self.parse_statement_impl(statement, position);
        self.depth_remaining += 1;
        Ok(StmtLoc::new(position, result?))
    }

    fn parse_statement_impl(&mut self, statement: Stmt, position: CodeRange) -> Result<Node, ParseError> {
        match statement {
            Stmt::FunctionDef(function) => {
                let name: Rc<str> = function.name.id.as_str().into();
                let decorators = function
                    .decorator_list
                    .into_iter()
                    .map(|d| self.parse_expression(d.expression))
                    .collect::<Result<Vec<_>, _>>()?;
                let params = self.parse_parameters(&function.parameters)?;
                let qualname = self.qualname(&name);
                self.qualname_stack.push(format!("{qualname}.<locals>"));
                let body = self.parse_statements(function.body);
                self.qualname_stack.pop();
                Ok(Node::FunctionDef(Rc::new(FunctionDef {
                    name,
                    qualname: qualname.into(),
                    params,
                    body: body?,
                    decorators,
                    is_async: function.is_async,
                    is_lambda: false,
                    position,
                    scope: ScopeInfo::default(),
                })))
            }
            Stmt::ClassDef(c) => {
                let name: Rc<str> = c.name.id.as_str().into();
                let (bases, keywords) = match c.arguments {
                    Some(arguments) => {
                        let bases = arguments
                            .args
                            .into_vec()
                            .into_iter()
                            .map(|arg| self.parse_expression(arg))
                            .collect::<Result<Vec<_>, _>>()?;
                        (bases, self.parse_keywords(arguments.keywords.into_vec())?)
                    }
                    None => (Vec::new(), Vec::new()),
                };
                let decorators = c
                    .decorator_list
                    .into_iter()
                    .map(|d| self.parse_expression(d.expression))
                    .collect::<Result<Vec<_>, _>>()?;
                let qualname = self.qualname(&name);
                self.qualname_stack.push(qualname.clone());
                let body = self.parse_statements(c.body);
                self.qualname_stack.pop();
                Ok(Node::ClassDef(Rc::new(crate::expressions::ClassDef {
                    name,
                    qualname: qualname.into(),
                    bases,
                    keywords,
                    body: body?,
                    decorators,
                    position,
                })))
            }
            Stmt::Return(ast::StmtReturn { value, .. }) => {
                Ok(Node::Return(value.map(|v| self.parse_expression(*v)).transpose()?))
            }
            Stmt::Delete(ast::StmtDelete { targets, .. }) => Ok(Node::Delete(
                targets
                    .into_iter()
                    .map(|t| self.parse_target(t))
                    .collect::<Result<_, _>>()?,
            )),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                let value = self.parse_expression(*value)?;
                let targets = targets
                    .into_iter()
                    .map(|t| self.parse_target(t))
                    .collect::<Result<_, _>>()?;
                Ok(Node::Assign { targets, value })
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, op, value, .. }) => Ok(Node::AugAssign {
                target: self.parse_target(*target)?,
                op: convert_op(op),
                value: self.parse_expression(*value)?,
            }),
            Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => Ok(Node::AnnAssign {
                target: self.parse_target(*target)?,
                annotation: self.parse_expression(*annotation)?,
                value: value.map(|v| self.parse_expression(*v)).transpose()?,
            }),
            Stmt::For(ast::StmtFor {
                is_async,
                target,
                iter,
                body,
                orelse,
                ..
            }) => Ok(Node::For {
                target: self.parse_target(*target)?,
                iter: self.parse_expression(*iter)?,
                body: self.parse_statements(body)?,
                or_else: self.parse_statements(orelse)?,
                is_async,
            }),
            Stmt::While(ast::StmtWhile { test, body, orelse, .. }) => Ok(Node::While {
                test: self.parse_expression(*test)?,
                body: self.parse_statements(body)?,
                or_else: self.parse_statements(orelse)?,
            }),
            Stmt::If(ast::StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => Ok(Node::If {
                test: self.parse_expression(*test)?,
                body: self.parse_statements(body)?,
                or_else: self.parse_elif_else_clauses(elif_else_clauses)?,
            }),
            Stmt::With(ast::StmtWith {
                is_async, items, body, ..
            }) => {
                let items = items
                    .into_iter()
                    .map(|item| {
                        Ok(WithItem {
                            context_expr: self.parse_expression(item.context_expr)?,
                            target: item.optional_vars.map(|v| self.parse_target(*v)).transpose()?,
                        })
                    })
                    .collect::<Result<_, ParseError>>()?;
                Ok(Node::With {
                    items,
                    body: self.parse_statements(body)?,
                    is_async,
                })
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => Ok(Node::Raise {
                exc: exc.map(|e| self.parse_expression(*e)).transpose()?,
                cause: cause.map(|e| self.parse_expression(*e)).transpose()?,
            }),
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
                ..
            }) => {
                if is_star {
                    return Err(ParseError::not_implemented("except* clauses", position));
                }
                let body = self.parse_statements(body)?;
                let handlers = handlers
                    .into_iter()
                    .map(|h| self.parse_except_handler(h))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::Try(Box::new(Try {
                    body,
                    handlers,
                    or_else: self.parse_statements(orelse)?,
                    finally: self.parse_statements(finalbody)?,
                })))
            }
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => Ok(Node::Assert {
                test: self.parse_expression(*test)?,
                msg: msg.map(|m| self.parse_expression(*m)).transpose()?,
            }),
            Stmt::Import(ast::StmtImport { names, .. }) => Ok(Node::Import(
                names
                    .iter()
                    .map(|alias| ImportAlias {
                        name: alias.name.as_str().into(),
                        asname: alias.asname.as_ref().map(|a| a.as_str().into()),
                    })
                    .collect(),
            )),
            Stmt::ImportFrom(ast::StmtImportFrom {
                module, names, level, ..
            }) => Ok(Node::ImportFrom {
                module: module.map(|m| m.as_str().into()),
                names: names
                    .iter()
                    .map(|alias| ImportAlias {
                        name: alias.name.as_str().into(),
                        asname: alias.asname.as_ref().map(|a| a.as_str().into()),
                    })
                    .collect(),
                level,
            }),
            Stmt::Global(ast::StmtGlobal { names, .. }) => {
                Ok(Node::Global(names.iter().map(|n| n.as_str().into()).collect()))
            }
            Stmt::Nonlocal(ast::StmtNonlocal { names, .. }) => {
                Ok(Node::Nonlocal(names.iter().map(|n| n.as_str().into()).collect()))
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => self.parse_expression(*value).map(Node::Expr),
            Stmt::Pass(_) => Ok(Node::Pass),
            Stmt::Break(_) => Ok(Node::Break),
            Stmt::Continue(_) => Ok(Node::Continue),
            Stmt::Match(_) => Err(ParseError::not_implemented("match statements", position)),
            Stmt::TypeAlias(_) => Err(ParseError::not_implemented("type alias statements", position)),
            Stmt::IpyEscapeCommand(_) => Err(ParseError::not_implemented("IPython escape commands", position)),
        }
    }

    fn parse_elif_else_clauses(&mut self, clauses: Vec<ElifElseClause>) -> Result<Vec<StmtLoc>, ParseError> {
        let mut tail: Vec<StmtLoc> = Vec::new();
        for clause in clauses.into_iter().rev() {
            let position = self.convert_range(clause.range);
            match clause.test {
                Some(test) => {
                    let test = self.parse_expression(test)?;
                    let body = self.parse_statements(clause.body)?;
                    tail = vec![StmtLoc::new(
                        position,
                        Node::If {
                            test,
                            body,
                            or_else: tail,
                        },
                    )];
                }
                None => tail = self.parse_statements(clause.body)?,
            }
        }
        Ok(tail)
    }

    fn parse_except_handler(&mut self, handler: ast::ExceptHandler) -> Result<ExceptHandler, ParseError> {
        let ast::ExceptHandler::ExceptHandler(h) = handler;
        Ok(ExceptHandler {
            exc_type: h.type_.map(|e| self.parse_expression(*e)).transpose()?,
            name: h.name.map(|n| Identifier::new(n.as_str(), self.convert_range(n.range))),
            body: self.parse_statements(h.body)?,
            position: self.convert_range(h.range),
        })
    }

    fn parse_parameters(&mut self, params: &ast::Parameters) -> Result<Parameters, ParseError> {
        Ok(Parameters {
            posonly: self.parse_params_with_defaults(&params.posonlyargs)?,
            args: self.parse_params_with_defaults(&params.args)?,
            vararg: params.vararg.as_ref().map(|p| p.name.as_str().into()),
            kwonly: self.parse_params_with_defaults(&params.kwonlyargs)?,
            kwarg: params.kwarg.as_ref().map(|p| p.name.as_str().into()),
        })
    }

    fn parse_params_with_defaults(&mut self, params: &[ParameterWithDefault]) -> Result<Vec<Param>, ParseError> {
        params
            .iter()
            .map(|p| {
                Ok(Param {
                    name: p.parameter.name.as_str().into(),
                    default: p
                        .default
                        .as_ref()
                        .map(|expr| self.parse_expression((**expr).clone()))
                        .transpose()?,
                })
            })
            .collect()
    }

    fn parse_keywords(&mut self, keywords: Vec<ast::Keyword>) -> Result<Vec<Keyword>, ParseError> {
        keywords
            .into_iter()
            .map(|kw| {
                Ok(Keyword {
                    name: kw.arg.map(|a| a.as_str().into()),
                    value: self.parse_expression(kw.value)?,
                })
            })
            .collect()
    }

    fn parse_target(&mut self, ast: AstExpr) -> Result<Target, ParseError> {
        let position = self.convert_range(ast.range());
        match ast {
            AstExpr::Name(ast::ExprName { id, .. }) => Ok(Target::Name(Identifier::new(id.as_str(), position))),
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => Ok(Target::Attribute {
                object: self.parse_expression(*value)?,
                attr: attr.as_str().into(),
            }),
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => Ok(Target::Subscript {
                object: self.parse_expression(*value)?,
                index: self.parse_expression(*slice)?,
            }),
            AstExpr::Tuple(ast::ExprTuple { elts, .. }) | AstExpr::List(ast::ExprList { elts, .. }) => {
                let targets = elts
                    .into_iter()
                    .map(|e| self.parse_target(e))
                    .collect::<Result<Vec<_>, _>>()?;
                if targets.iter().filter(|t| matches!(t, Target::Starred(_))).count() > 1 {
                    return Err(ParseError::syntax("multiple starred expressions in assignment", position));
                }
                Ok(Target::Tuple(targets))
            }
            AstExpr::Starred(ast::ExprStarred { value, .. }) => Ok(Target::Starred(Box::new(self.parse_target(*value)?))),
            _ => Err(ParseError::syntax("cannot assign to expression", position)),
        }
    }

    fn parse_expression(&mut self, expression: AstExpr) -> Result<ExprLoc, ParseError> {
        self.decr_depth_remaining(|| expression.range())?;
        let result = self.parse_expression_impl(expression);
        self.depth_remaining += 1;
        result
    }

    fn parse_boxed(&mut self, expression: AstExpr) -> Result<Box<ExprLoc>, ParseError> {
        self.parse_expression(expression).map(Box::new)
    }

    fn parse_list(&mut self, elts: Vec<AstExpr>) -> Result<Vec<ExprLoc>, ParseError> {
        elts.into_iter().map(|e| self.parse_expression(e)).collect()
    }

    fn parse_expression_impl(&mut self, expression: AstExpr) -> Result<ExprLoc, ParseError> {
        let position = self.convert_range(expression.range());
        let expr = match expression {
            AstExpr::BoolOp(ast::ExprBoolOp { op, values, .. }) => Expr::BoolOp {
                op: match op {
                    BoolOp::And => BoolOperator::And,
                    BoolOp::Or => BoolOperator::Or,
                },
                values: self.parse_list(values)?,
            },
            AstExpr::Named(ast::ExprNamed { target, value, .. }) => {
                let target = match *target {
                    AstExpr::Name(ast::ExprName { id, range, .. }) => {
                        Identifier::new(id.as_str(), self.convert_range(range))
                    }
                    other => {
                        return Err(ParseError::syntax(
                            "cannot use assignment expressions with this target",
                            self.convert_range(other.range()),
                        ));
                    }
                };
                Expr::Named {
                    target,
                    value: self.parse_boxed(*value)?,
                }
            }
            AstExpr::BinOp(ast::ExprBinOp { left, op, right, .. }) => Expr::Op {
                left: self.parse_boxed(*left)?,
                op: convert_op(op),
                right: self.parse_boxed(*right)?,
            },
            AstExpr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => Expr::Unary {
                op: match op {
                    UnaryOp::Not => UnaryOperator::Not,
                    UnaryOp::USub => UnaryOperator::Neg,
                    UnaryOp::UAdd => UnaryOperator::Pos,
                    UnaryOp::Invert => UnaryOperator::Invert,
                },
                operand: self.parse_boxed(*operand)?,
            },
            AstExpr::Lambda(ast::ExprLambda { parameters, body, .. }) => {
                let params = match parameters {
                    Some(params) => self.parse_parameters(&params)?,
                    None => Parameters::default(),
                };
                let qualname = self.qualname("<lambda>");
                self.qualname_stack.push(format!("{qualname}.<locals>"));
                let body = self.parse_expression(*body);
                self.qualname_stack.pop();
                let body = body?;
                Expr::Lambda(Rc::new(FunctionDef {
                    name: "<lambda>".into(),
                    qualname: qualname.into(),
                    params,
                    body: vec![StmtLoc::new(body.position, Node::Return(Some(body)))],
                    decorators: Vec::new(),
                    is_async: false,
                    is_lambda: true,
                    position,
                    scope: ScopeInfo::default(),
                }))
            }
            AstExpr::If(ast::ExprIf { test, body, orelse, .. }) => Expr::IfElse {
                test: self.parse_boxed(*test)?,
                body: self.parse_boxed(*body)?,
                orelse: self.parse_boxed(*orelse)?,
            },
            AstExpr::Dict(ast::ExprDict { items, .. }) => Expr::Dict(
                items
                    .into_iter()
                    .map(|ast::DictItem { key, value }| match key {
                        Some(key) => Ok(DictItem::Pair(self.parse_expression(key)?, self.parse_expression(value)?)),
                        None => Ok(DictItem::Unpack(self.parse_expression(value)?)),
                    })
                    .collect::<Result<_, ParseError>>()?,
            ),
            AstExpr::Set(ast::ExprSet { elts, .. }) => Expr::Set(self.parse_list(elts)?),
            AstExpr::ListComp(ast::ExprListComp { elt, generators, .. }) => {
                let element = CompElement::Single(self.parse_expression(*elt)?);
                Expr::ListComp(self.comprehension(element, generators, position)?)
            }
            AstExpr::SetComp(ast::ExprSetComp { elt, generators, .. }) => {
                let element = CompElement::Single(self.parse_expression(*elt)?);
                Expr::SetComp(self.comprehension(element, generators, position)?)
            }
            AstExpr::DictComp(ast::ExprDictComp {
                key, value, generators, ..
            }) => {
                let element = CompElement::Pair(self.parse_expression(*key)?, self.parse_expression(*value)?);
                Expr::DictComp(self.comprehension(element, generators, position)?)
            }
            AstExpr::Generator(ast::ExprGenerator { elt, generators, .. }) => {
                let element = CompElement::Single(self.parse_expression(*elt)?);
                Expr::GeneratorExp(self.comprehension(element, generators, position)?)
            }
            AstExpr::Await(ast::ExprAwait { value, .. }) => Expr::Await(self.parse_boxed(*value)?),
            AstExpr::Yield(ast::ExprYield { value, .. }) => {
                Expr::Yield(value.map(|v| self.parse_boxed(*v)).transpose()?)
            }
            AstExpr::YieldFrom(ast::ExprYieldFrom { value, .. }) => Expr::YieldFrom(self.parse_boxed(*value)?),
            AstExpr::Compare(ast::ExprCompare {
                left, ops, comparators, ..
            }) => {
                let left = self.parse_boxed(*left)?;
                let comparisons = ops
                    .into_vec()
                    .into_iter()
                    .zip(comparators.into_vec())
                    .map(|(op, cmp)| Ok((convert_compare_op(op), self.parse_expression(cmp)?)))
                    .collect::<Result<Vec<_>, ParseError>>()?;
                Expr::Compare { left, comparisons }
            }
            AstExpr::Call(ast::ExprCall { func, arguments, .. }) => {
                let ast::Arguments { args, keywords, .. } = arguments;
                let func = self.parse_boxed(*func)?;
                let args = args
                    .into_vec()
                    .into_iter()
                    .map(|arg| match arg {
                        AstExpr::Starred(ast::ExprStarred { value, .. }) => {
                            Ok(CallArg::Starred(self.parse_expression(*value)?))
                        }
                        other => Ok(CallArg::Positional(self.parse_expression(other)?)),
                    })
                    .collect::<Result<_, ParseError>>()?;
                let keywords = self.parse_keywords(keywords.into_vec())?;
                Expr::Call { func, args, keywords }
            }
            AstExpr::FString(ast::ExprFString { value, .. }) => {
                let mut parts = Vec::new();
                for part in &value {
                    match part {
                        ast::FStringPart::Literal(lit) => {
                            let text = lit.value.to_string();
                            if !text.is_empty() {
                                parts.push(FStringPart::Literal(text.into()));
                            }
                        }
                        ast::FStringPart::FString(fstring) => {
                            for element in &fstring.elements {
                                parts.push(self.parse_fstring_element(element)?);
                            }
                        }
                    }
                }
                Expr::FString(parts)
            }
            AstExpr::StringLiteral(ast::ExprStringLiteral { value, .. }) => {
                Expr::Literal(Literal::Str(value.to_string().into()))
            }
            AstExpr::NumberLiteral(ast::ExprNumberLiteral { value, .. }) => match value {
                Number::Int(i) => match i.as_i64() {
                    Some(i) => Expr::Literal(Literal::Int(i)),
                    None => {
                        let big = parse_int_literal(&i.to_string())
                            .ok_or_else(|| ParseError::syntax(format!("invalid integer literal: {i}"), position))?;
                        Expr::Literal(Literal::BigInt(Rc::new(big)))
                    }
                },
                Number::Float(f) => Expr::Literal(Literal::Float(f)),
                Number::Complex { .. } => return Err(ParseError::not_implemented("complex numbers", position)),
            },
            AstExpr::BooleanLiteral(ast::ExprBooleanLiteral { value, .. }) => Expr::Literal(Literal::Bool(value)),
            AstExpr::NoneLiteral(_) => Expr::Literal(Literal::None),
            AstExpr::EllipsisLiteral(_) => Expr::Literal(Literal::Ellipsis),
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => Expr::Attribute {
                object: self.parse_boxed(*value)?,
                attr: attr.as_str().into(),
            },
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => Expr::Subscript {
                object: self.parse_boxed(*value)?,
                index: self.parse_boxed(*slice)?,
            },
            AstExpr::Starred(ast::ExprStarred { value, .. }) => Expr::Starred(self.parse_boxed(*value)?),
            AstExpr::Name(ast::ExprName { id, .. }) => Expr::Name(Identifier::new(id.as_str(), position)),
            AstExpr::List(ast::ExprList { elts, .. }) => Expr::List(self.parse_list(elts)?),
            AstExpr::Tuple(ast::ExprTuple { elts, .. }) => Expr::Tuple(self.parse_list(elts)?),
            AstExpr::Slice(ast::ExprSlice { lower, upper, step, .. }) => Expr::Slice {
                lower: lower.map(|e| self.parse_boxed(*e)).transpose()?,
                upper: upper.map(|e| self.parse_boxed(*e)).transpose()?,
                step: step.map(|e| self.parse_boxed(*e)).transpose()?,
            },
            AstExpr::BytesLiteral(_) => return Err(ParseError::not_implemented("bytes literals", position)),
            AstExpr::TString(_) => return Err(ParseError::not_implemented("template strings (t-strings)", position)),
            AstExpr::IpyEscapeCommand(_) => {
                return Err(ParseError::not_implemented("IPython escape commands", position));
            }
        };
        Ok(ExprLoc::new(position, expr))
    }

    fn comprehension(
        &mut self,
        element: CompElement,
        generators: Vec<ast::Comprehension>,
        position: CodeRange,
    ) -> Result<Rc<Comprehension>, ParseError> {
        let generators = generators
            .into_iter()
            .map(|comp| {
                Ok(CompFor {
                    target: self.parse_target(comp.target)?,
                    iter: self.parse_expression(comp.iter)?,
                    ifs: self.parse_list(comp.ifs)?,
                    is_async: comp.is_async,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Rc::new(Comprehension {
            element,
            generators,
            position,
            scope: ScopeInfo::default(),
        }))
    }

    fn parse_fstring_element(&mut self, element: &InterpolatedStringElement) -> Result<FStringPart, ParseError> {
        match element {
            InterpolatedStringElement::Literal(lit) => Ok(FStringPart::Literal(lit.value.to_string().into())),
            InterpolatedStringElement::Interpolation(interp) => {
                let expr = self.parse_boxed((*interp.expression).clone())?;
                let format_spec = match &interp.format_spec {
                    Some(spec) => Some(
                        spec.elements
                            .iter()
                            .map(|e| self.parse_fstring_element(e))
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    None => None,
                };
                let debug_prefix = interp.debug_text.as_ref().map(|dt| {
                    let expr_text = &self.code[interp.expression.range()];
                    Rc::from(format!("{}{}{}", dt.leading, expr_text, dt.trailing))
                });
                // `f"{x=}"` defaults to repr when no conversion or spec is given
                let conversion = match interp.conversion {
                    RuffConversionFlag::None if debug_prefix.is_some() && format_spec.is_none() => ConversionFlag::Repr,
                    RuffConversionFlag::None => ConversionFlag::None,
                    RuffConversionFlag::Str => ConversionFlag::Str,
                    RuffConversionFlag::Repr => ConversionFlag::Repr,
                    RuffConversionFlag::Ascii => ConversionFlag::Ascii,
                };
                Ok(FStringPart::Interpolation {
                    expr,
                    conversion,
                    format_spec,
                    debug_prefix,
                })
            }
        }
    }

    fn qualname(&self, name: &str) -> String {
        match self.qualname_stack.last() {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_owned(),
        }
    }

    fn convert_range(&self, range: TextRange) -> CodeRange {
        CodeRange {
            start: self.index_to_loc(range.start().into()),
            end: self.index_to_loc(range.end().into()),
        }
    }

    fn index_to_loc(&self, index: usize) -> CodeLoc {
        let line = self.line_starts.partition_point(|&start| start <= index).max(1);
        let line_start = self.line_starts[line - 1];
        let column = self
            .code
            .get(line_start..index.min(self.code.len()))
            .map_or(0, |s| s.chars().count());
        CodeLoc {
            line: line as u32,
            column: column as u32,
        }
    }

    fn decr_depth_remaining(&mut self, get_range: impl FnOnce() -> TextRange) -> Result<(), ParseError> {
        if let Some(depth_remaining) = self.depth_remaining.checked_sub(1) {
            self.depth_remaining = depth_remaining;
            Ok(())
        } else {
            let position = self.convert_range(get_range());
            Err(ParseError::syntax("too many nested parentheses", position))
        }
    }
}

fn convert_op(op: AstOperator) -> Operator {
    match op {
        AstOperator::Add => Operator::Add,
        AstOperator::Sub => Operator::Sub,
        AstOperator::Mult => Operator::Mult,
        AstOperator::MatMult => Operator::MatMult,
        AstOperator::Div => Operator::Div,
        AstOperator::Mod => Operator::Mod,
        AstOperator::Pow => Operator::Pow,
        AstOperator::LShift => Operator::LShift,
        AstOperator::RShift => Operator::RShift,
        AstOperator::BitOr => Operator::BitOr,
        AstOperator::BitXor => Operator::BitXor,
        AstOperator::BitAnd => Operator::BitAnd,
        AstOperator::FloorDiv => Operator::FloorDiv,
    }
}

fn convert_compare_op(op: CmpOp) -> CmpOperator {
    match op {
        CmpOp::Eq => CmpOperator::Eq,
        CmpOp::NotEq => CmpOperator::NotEq,
        CmpOp::Lt => CmpOperator::Lt,
        CmpOp::LtE => CmpOperator::LtE,
        CmpOp::Gt => CmpOperator::Gt,
        CmpOp::GtE => CmpOperator::GtE,
        CmpOp::Is => CmpOperator::Is,
        CmpOp::IsNot => CmpOperator::IsNot,
        CmpOp::In => CmpOperator::In,
        CmpOp::NotIn => CmpOperator::NotIn,
    }
}

/// Parses an integer literal string into a `BigInt`, handling radix prefixes and underscores.
fn parse_int_literal(s: &str) -> Option<BigInt> {
    let cleaned: String = s.chars().filter(|c| *c != '_').collect();
    if cleaned.len() >= 2 {
        let (prefix, digits) = cleaned.split_at(2);
        match prefix.to_ascii_lowercase().as_str() {
            "0x" => return BigInt::parse_bytes(digits.as_bytes(), 16),
            "0o" => return BigInt::parse_bytes(digits.as_bytes(), 8),
            "0b" => return BigInt::parse_bytes(digits.as_bytes(), 2),
            _ => {}
        }
    }
    cleaned.parse::<BigInt>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedent_strips_common_margin() {
        assert_eq!(dedent("    a = 1\n    if a:\n        b = 2\n"), "a = 1\nif a:\n    b = 2\n");
        assert_eq!(dedent("x\n  y"), "x\n  y");
    }

    #[test]
    fn scan_tracks_brackets_strings_and_comments() {
        let scan = SourceScan::new("f(1,\n  [2");
        assert_eq!(scan.open_brackets, 2);
        let scan = SourceScan::new("x = '(' # (\n");
        assert_eq!(scan.open_brackets, 0);
        assert_eq!(scan.last_code_char, Some('\''));
        let scan = SourceScan::new("s = \"\"\"abc\n");
        assert!(scan.in_triple_string);
        let scan = SourceScan::new("1 + 1;  # quiet");
        assert_eq!(scan.last_code_char, Some(';'));
        let scan = SourceScan::new("x = 1 + \\");
        assert!(scan.continuation);
    }

    #[test]
    fn block_openers() {
        assert!(SourceScan::new("def f(x):  # doc").ends_with_block_opener());
        assert!(SourceScan::new("if True:\n  pass\nelse:").ends_with_block_opener());
        assert!(SourceScan::new("@decorator").ends_with_block_opener());
        assert!(!SourceScan::new("x = {'a': 1}").ends_with_block_opener());
        assert!(!SourceScan::new("1+").ends_with_block_opener());
    }
}
