//! The return-mode rewrite: lifts the value of a module's final statement into a raise of the
//! result sentinel so it escapes the module body.

use std::rc::Rc;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    expressions::{CallArg, Expr, ExprLoc, Identifier, Literal, Module, Node, StmtLoc, Target},
    parse::SourceScan,
};

/// Name under which the builtins hold a one-element list with the result sentinel class.
pub const EVAL_RESULT_NAME: &str = "___EvalCodeResultException";

/// Which trailing statement, if any, provides the result of running a fragment.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ReturnMode {
    /// The value of a trailing expression statement.
    #[default]
    #[strum(serialize = "last_expr")]
    LastExpr,
    /// As `LastExpr`, and a trailing assignment to a name yields the assigned value.
    #[strum(serialize = "last_expr_or_assign")]
    LastExprOrAssign,
    /// Always `None`.
    #[strum(serialize = "none")]
    None,
}

/// True if the last token of `source` that is not a comment or whitespace is `;`.
#[must_use]
pub fn should_quiet(source: &str) -> bool {
    SourceScan::new(source).last_code_char == Some(';')
}

/// Rewrites `module` in place according to `mode`.
pub(crate) fn apply(module: &mut Module, mode: ReturnMode) {
    if mode == ReturnMode::None {
        return;
    }
    if mode == ReturnMode::LastExprOrAssign
        && let Some(name) = module.body.last().and_then(assigned_name)
    {
        let position = name.position;
        module
            .body
            .push(StmtLoc::new(position, Node::Expr(ExprLoc::new(position, Expr::Name(name)))));
    }
    let Some(last) = module.body.last_mut().filter(|s| matches!(s.node, Node::Expr(_))) else {
        return;
    };
    let Node::Expr(value) = std::mem::replace(&mut last.node, Node::Pass) else {
        return;
    };
    last.node = Node::Raise {
        exc: Some(raise_result(value)),
        cause: None,
    };
}

/// The name assigned by a trailing `x = ...`, `x += ...` or `x: T = ...`.
fn assigned_name(stmt: &StmtLoc) -> Option<Identifier> {
    let target = match &stmt.node {
        Node::Assign { targets, .. } => targets.first()?,
        Node::AugAssign { target, .. } => target,
        Node::AnnAssign {
            target, value: Some(_), ..
        } => target,
        _ => return None,
    };
    match target {
        Target::Name(ident) => Some(Identifier::new(ident.name.clone(), stmt.position)),
        _ => None,
    }
}

/// `___EvalCodeResultException[0](value)`.
fn raise_result(value: ExprLoc) -> ExprLoc {
    let position = value.position;
    let sentinel = ExprLoc::new(
        position,
        Expr::Subscript {
            object: Box::new(ExprLoc::new(
                position,
                Expr::Name(Identifier::new(Rc::<str>::from(EVAL_RESULT_NAME), position)),
            )),
            index: Box::new(ExprLoc::new(position, Expr::Literal(Literal::Int(0)))),
        },
    );
    ExprLoc::new(
        position,
        Expr::Call {
            func: Box::new(sentinel),
            args: vec![CallArg::Positional(value)],
            keywords: Vec::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_ignores_comments_and_strings() {
        assert!(should_quiet("1+1;"));
        assert!(should_quiet("1+1;  # trailing\n"));
        assert!(!should_quiet("x = ';'"));
        assert!(!should_quiet("1+1 # ;"));
    }

    #[test]
    fn return_mode_names() {
        assert_eq!("last_expr_or_assign".parse::<ReturnMode>().ok(), Some(ReturnMode::LastExprOrAssign));
        assert_eq!(ReturnMode::None.to_string(), "none");
        assert!("last".parse::<ReturnMode>().is_err());
    }
}
