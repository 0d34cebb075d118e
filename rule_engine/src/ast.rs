// Syntax tree produced by the parser and consumed by the compiler and the
// session's matcher.

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourceFile {
    pub package: Option<String>,
    pub imports: Vec<String>,
    pub rules: Vec<RuleDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RuleDecl {
    pub name: String,
    pub line: usize,
    pub column: usize,
    pub salience: i32,
    pub no_loop: bool,
    pub patterns: Vec<Pattern>,
    pub actions: Vec<Action>,
}

/// One condition element: `[not] [$b :] Type( constraint, ... )`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pattern {
    pub binding: Option<String>,
    pub type_name: String,
    pub constraints: Vec<Expr>,
    pub negated: bool,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Source position of an identifier, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pos {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// Field of the fact being matched by the enclosing pattern.
    Field { name: String, pos: Pos },
    /// A binding used on its own.
    Var { name: String, pos: Pos },
    /// `$binding.field`
    VarField { var: String, field: String, pos: Pos },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Visits every binding reference in this expression.
    pub fn for_each_var(&self, f: &mut impl FnMut(&str, Pos)) {
        match self {
            Expr::Literal(_) | Expr::Field { .. } => {}
            Expr::Var { name, pos } => f(name, *pos),
            Expr::VarField { var, pos, .. } => f(var, *pos),
            Expr::Unary(_, inner) => inner.for_each_var(f),
            Expr::Binary(_, lhs, rhs) => {
                lhs.for_each_var(f);
                rhs.for_each_var(f);
            }
        }
    }

    /// Visits every bare field reference in this expression.
    pub fn for_each_field(&self, f: &mut impl FnMut(&str, Pos)) {
        match self {
            Expr::Field { name, pos } => f(name, *pos),
            Expr::Literal(_) | Expr::Var { .. } | Expr::VarField { .. } => {}
            Expr::Unary(_, inner) => inner.for_each_field(f),
            Expr::Binary(_, lhs, rhs) => {
                lhs.for_each_field(f);
                rhs.for_each_field(f);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Assignment {
    pub field: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Modify {
        binding: String,
        assignments: Vec<Assignment>,
        pos: Pos,
    },
    Insert {
        type_name: String,
        assignments: Vec<Assignment>,
        pos: Pos,
    },
    Delete {
        binding: String,
        pos: Pos,
    },
}

impl Action {
    pub fn assignments(&self) -> &[Assignment] {
        match self {
            Action::Modify { assignments, .. } | Action::Insert { assignments, .. } => assignments,
            Action::Delete { .. } => &[],
        }
    }
}
