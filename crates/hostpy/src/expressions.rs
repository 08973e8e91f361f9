use std::rc::Rc;

use ahash::AHashSet;
use num_bigint::BigInt;

use crate::parse::CodeRange;

/// A parsed module: the statements of one source fragment.
///
/// This is what `CodeRunner::ast` exposes; hosts may rewrite it before compiling.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub body: Vec<StmtLoc>,
}

/// A name together with where it appears in the source.
#[derive(Debug, Clone)]
pub struct Identifier {
    pub name: Rc<str>,
    pub position: CodeRange,
}

impl Identifier {
    #[must_use]
    pub fn new(name: impl Into<Rc<str>>, position: CodeRange) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Literal {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    BigInt(Rc<BigInt>),
    Float(f64),
    Str(Rc<str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    FloorDiv,
}

impl Operator {
    /// The operator symbol, used in `TypeError` messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mult => "*",
            Self::MatMult => "@",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "** or pow()",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::BitAnd => "&",
            Self::FloorDiv => "//",
        }
    }

    /// Dunder pair (`__add__`, `__radd__`) used for user-defined operands.
    #[must_use]
    pub fn dunders(self) -> (&'static str, &'static str) {
        match self {
            Self::Add => ("__add__", "__radd__"),
            Self::Sub => ("__sub__", "__rsub__"),
            Self::Mult => ("__mul__", "__rmul__"),
            Self::MatMult => ("__matmul__", "__rmatmul__"),
            Self::Div => ("__truediv__", "__rtruediv__"),
            Self::Mod => ("__mod__", "__rmod__"),
            Self::Pow => ("__pow__", "__rpow__"),
            Self::LShift => ("__lshift__", "__rlshift__"),
            Self::RShift => ("__rshift__", "__rrshift__"),
            Self::BitOr => ("__or__", "__ror__"),
            Self::BitXor => ("__xor__", "__rxor__"),
            Self::BitAnd => ("__and__", "__rand__"),
            Self::FloorDiv => ("__floordiv__", "__rfloordiv__"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionFlag {
    None,
    Str,
    Repr,
    Ascii,
}

#[derive(Debug, Clone)]
pub enum FStringPart {
    Literal(Rc<str>),
    Interpolation {
        expr: Box<ExprLoc>,
        conversion: ConversionFlag,
        /// Parts of the format spec, which may itself contain interpolations.
        format_spec: Option<Vec<FStringPart>>,
        /// Text before the value for the `f"{x=}"` form.
        debug_prefix: Option<Rc<str>>,
    },
}

/// An expression with its source position.
#[derive(Debug, Clone)]
pub struct ExprLoc {
    pub position: CodeRange,
    pub expr: Expr,
}

impl ExprLoc {
    #[must_use]
    pub fn new(position: CodeRange, expr: Expr) -> Self {
        Self { position, expr }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    FString(Vec<FStringPart>),
    Name(Identifier),
    Attribute {
        object: Box<ExprLoc>,
        attr: Rc<str>,
    },
    Subscript {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    Slice {
        lower: Option<Box<ExprLoc>>,
        upper: Option<Box<ExprLoc>>,
        step: Option<Box<ExprLoc>>,
    },
    Call {
        func: Box<ExprLoc>,
        args: Vec<CallArg>,
        keywords: Vec<Keyword>,
    },
    Op {
        left: Box<ExprLoc>,
        op: Operator,
        right: Box<ExprLoc>,
    },
    BoolOp {
        op: BoolOperator,
        values: Vec<ExprLoc>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<ExprLoc>,
    },
    /// A comparison chain, `a < b <= c`.
    Compare {
        left: Box<ExprLoc>,
        comparisons: Vec<(CmpOperator, ExprLoc)>,
    },
    IfElse {
        test: Box<ExprLoc>,
        body: Box<ExprLoc>,
        orelse: Box<ExprLoc>,
    },
    /// Walrus, `(x := value)`.
    Named {
        target: Identifier,
        value: Box<ExprLoc>,
    },
    List(Vec<ExprLoc>),
    Tuple(Vec<ExprLoc>),
    Set(Vec<ExprLoc>),
    Dict(Vec<DictItem>),
    /// `*value` inside a list, tuple or set display.
    Starred(Box<ExprLoc>),
    Lambda(Rc<FunctionDef>),
    ListComp(Rc<Comprehension>),
    SetComp(Rc<Comprehension>),
    DictComp(Rc<Comprehension>),
    GeneratorExp(Rc<Comprehension>),
    Await(Box<ExprLoc>),
    Yield(Option<Box<ExprLoc>>),
    YieldFrom(Box<ExprLoc>),
}

#[derive(Debug, Clone)]
pub enum CallArg {
    Positional(ExprLoc),
    Starred(ExprLoc),
}

/// A keyword argument; `name` is `None` for `**mapping`.
#[derive(Debug, Clone)]
pub struct Keyword {
    pub name: Option<Rc<str>>,
    pub value: ExprLoc,
}

#[derive(Debug, Clone)]
pub enum DictItem {
    Pair(ExprLoc, ExprLoc),
    Unpack(ExprLoc),
}

#[derive(Debug, Clone)]
pub enum CompElement {
    Single(ExprLoc),
    Pair(ExprLoc, ExprLoc),
}

/// A comprehension body; evaluated in its own scope holding the loop targets.
#[derive(Debug, Clone)]
pub struct Comprehension {
    pub element: CompElement,
    pub generators: Vec<CompFor>,
    pub position: CodeRange,
    pub scope: ScopeInfo,
}

#[derive(Debug, Clone)]
pub struct CompFor {
    pub target: Target,
    pub iter: ExprLoc,
    pub ifs: Vec<ExprLoc>,
    pub is_async: bool,
}

/// An assignment target.
#[derive(Debug, Clone)]
pub enum Target {
    Name(Identifier),
    Attribute { object: ExprLoc, attr: Rc<str> },
    Subscript { object: ExprLoc, index: ExprLoc },
    Tuple(Vec<Target>),
    Starred(Box<Target>),
}

/// A statement with its source position.
#[derive(Debug, Clone)]
pub struct StmtLoc {
    pub position: CodeRange,
    pub node: Node,
}

impl StmtLoc {
    #[must_use]
    pub fn new(position: CodeRange, node: Node) -> Self {
        Self { position, node }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Expr(ExprLoc),
    Assign {
        targets: Vec<Target>,
        value: ExprLoc,
    },
    AugAssign {
        target: Target,
        op: Operator,
        value: ExprLoc,
    },
    AnnAssign {
        target: Target,
        annotation: ExprLoc,
        value: Option<ExprLoc>,
    },
    Delete(Vec<Target>),
    Pass,
    Break,
    Continue,
    Return(Option<ExprLoc>),
    Raise {
        exc: Option<ExprLoc>,
        cause: Option<ExprLoc>,
    },
    Assert {
        test: ExprLoc,
        msg: Option<ExprLoc>,
    },
    If {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        or_else: Vec<StmtLoc>,
    },
    While {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        or_else: Vec<StmtLoc>,
    },
    For {
        target: Target,
        iter: ExprLoc,
        body: Vec<StmtLoc>,
        or_else: Vec<StmtLoc>,
        is_async: bool,
    },
    Try(Box<Try>),
    With {
        items: Vec<WithItem>,
        body: Vec<StmtLoc>,
        is_async: bool,
    },
    FunctionDef(Rc<FunctionDef>),
    ClassDef(Rc<ClassDef>),
    Import(Vec<ImportAlias>),
    ImportFrom {
        module: Option<Rc<str>>,
        names: Vec<ImportAlias>,
        level: u32,
    },
    Global(Vec<Rc<str>>),
    Nonlocal(Vec<Rc<str>>),
}

impl Node {
    /// Compound statements need a terminating blank line at the interactive prompt.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            Self::If { .. }
                | Self::While { .. }
                | Self::For { .. }
                | Self::Try(_)
                | Self::With { .. }
                | Self::FunctionDef(_)
                | Self::ClassDef(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Try {
    pub body: Vec<StmtLoc>,
    pub handlers: Vec<ExceptHandler>,
    pub or_else: Vec<StmtLoc>,
    pub finally: Vec<StmtLoc>,
}

#[derive(Debug, Clone)]
pub struct ExceptHandler {
    pub exc_type: Option<ExprLoc>,
    pub name: Option<Identifier>,
    pub body: Vec<StmtLoc>,
    pub position: CodeRange,
}

#[derive(Debug, Clone)]
pub struct WithItem {
    pub context_expr: ExprLoc,
    pub target: Option<Target>,
}

#[derive(Debug, Clone)]
pub struct ImportAlias {
    pub name: Rc<str>,
    pub asname: Option<Rc<str>>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Rc<str>,
    pub default: Option<ExprLoc>,
}

#[derive(Debug, Clone, Default)]
pub struct Parameters {
    pub posonly: Vec<Param>,
    pub args: Vec<Param>,
    pub vararg: Option<Rc<str>>,
    pub kwonly: Vec<Param>,
    pub kwarg: Option<Rc<str>>,
}

impl Parameters {
    /// Every name the parameters bind, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.posonly
            .iter()
            .chain(&self.args)
            .map(|p| &p.name)
            .chain(self.vararg.iter())
            .chain(self.kwonly.iter().map(|p| &p.name))
            .chain(self.kwarg.iter())
    }
}

/// Name resolution facts for one function or comprehension body, filled in by `compile`.
#[derive(Debug, Clone, Default)]
pub struct ScopeInfo {
    pub locals: AHashSet<Rc<str>>,
    pub globals: AHashSet<Rc<str>>,
    pub nonlocals: AHashSet<Rc<str>>,
    /// True if the body contains `yield`.
    pub is_generator: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Rc<str>,
    pub qualname: Rc<str>,
    pub params: Parameters,
    pub body: Vec<StmtLoc>,
    pub decorators: Vec<ExprLoc>,
    pub is_async: bool,
    pub is_lambda: bool,
    pub position: CodeRange,
    pub scope: ScopeInfo,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: Rc<str>,
    pub qualname: Rc<str>,
    pub bases: Vec<ExprLoc>,
    pub keywords: Vec<Keyword>,
    pub body: Vec<StmtLoc>,
    pub decorators: Vec<ExprLoc>,
    pub position: CodeRange,
}
