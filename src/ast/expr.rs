use super::span::{Span, Spanned};
use super::value::Value;

pub type Expr = Spanned<ExprKind>;

/// Whether a name or tuple is read from or bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprContext {
    Load,
    Store,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Literal value: 'hello', 42, 1.5, true, none
    Const(Value),

    /// Name reference, or a binding target when `ctx` is `Store`.
    Name { name: String, ctx: ExprContext },

    /// Tuple literal `(1, *rest)`, or an unpacking target `a, b`.
    Tuple {
        items: Vec<ScalarItem>,
        ctx: ExprContext,
    },

    /// List literal: [1, *rest, 3]
    List(Vec<ScalarItem>),

    /// Set literal: {1, *rest, 3}
    Set(Vec<ScalarItem>),

    /// Dict literal: {'a': 1, **base, 'b': 2}
    Dict(Vec<DictItem>),

    /// Lazy sequence: (x for x in xs), or the sole argument `f(x for x in xs)`
    Generator(Comprehension<Box<Expr>>),

    /// [x for x in xs]
    ListComprehension(Comprehension<Box<Expr>>),

    /// {x for x in xs}
    SetComprehension(Comprehension<Box<Expr>>),

    /// {k: v for k, v in pairs}
    DictComprehension(Comprehension<Box<Pair>>),

    /// Binary operation: a + b, a and b
    BinaryOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },

    /// Unary operation: not x, -x
    UnaryOp { op: UnaryOp, operand: Box<Expr> },

    /// Comparison chain: a < b <= c, x in xs
    Compare { expr: Box<Expr>, ops: Vec<Operand> },

    /// Conditional expression: a if test else b
    CondExpr {
        test: Box<Expr>,
        expr1: Box<Expr>,
        expr2: Option<Box<Expr>>,
    },

    /// Attribute access: obj.name
    Getattr { node: Box<Expr>, attr: String },

    /// Subscript: obj[key]
    Getitem { node: Box<Expr>, arg: Box<Expr> },

    /// Function or method call
    Call(Call),
}

/// An item of a list, tuple or set literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarItem {
    Expr(Expr),
    Spread(SpreadScalars),
}

/// `*expr` inside a scalar collection literal.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadScalars {
    pub node: Box<Expr>,
    pub span: Span,
}

/// An item of a dict literal.
#[derive(Debug, Clone, PartialEq)]
pub enum DictItem {
    Pair(Pair),
    Spread(SpreadPairs),
}

/// `key: value` inside a dict literal or dict comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub key: Expr,
    pub value: Expr,
    pub span: Span,
}

/// `**expr` inside a dict literal.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadPairs {
    pub node: Box<Expr>,
    pub span: Span,
}

/// One `for target in iter [if cond]` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ComprehensionClause {
    pub target: Expr,
    pub iter: Expr,
    pub cond: Option<Expr>,
    pub span: Span,
}

/// Shared shape of the four comprehension kinds. `clauses` is never
/// empty and is ordered outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension<R> {
    pub result: R,
    pub clauses: Vec<ComprehensionClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub node: Box<Expr>,
    pub args: Vec<Expr>,
    pub kwargs: Vec<Keyword>,
    pub dyn_args: Option<Box<Expr>>,
    pub dyn_kwargs: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub key: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub op: CmpOp,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Logical
    And,
    Or,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,

    /// `~`: string concatenation of both operands' output forms
    Concat,
}

impl BinOp {
    /// Operator spelling in generated source.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Concat => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::LtEq => "<=",
            CmpOp::GtEq => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(self, CmpOp::In | CmpOp::NotIn)
    }
}

impl ExprKind {
    /// Whether this node can be the target of a comprehension clause.
    pub fn can_assign(&self) -> bool {
        match self {
            ExprKind::Name { .. } => true,
            ExprKind::Tuple { items, .. } => items.iter().all(|item| match item {
                ScalarItem::Expr(expr) => expr.node.can_assign(),
                ScalarItem::Spread(_) => false,
            }),
            _ => false,
        }
    }

    /// Short node description for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            ExprKind::Const(_) => "literal",
            ExprKind::Name { .. } => "name",
            ExprKind::Tuple { .. } => "tuple",
            ExprKind::List(_) => "list",
            ExprKind::Set(_) => "set",
            ExprKind::Dict(_) => "dict",
            ExprKind::Generator(_) => "generator expression",
            ExprKind::ListComprehension(_) => "list comprehension",
            ExprKind::SetComprehension(_) => "set comprehension",
            ExprKind::DictComprehension(_) => "dict comprehension",
            ExprKind::BinaryOp { .. } => "operator",
            ExprKind::UnaryOp { .. } => "operator",
            ExprKind::Compare { .. } => "comparison",
            ExprKind::CondExpr { .. } => "conditional expression",
            ExprKind::Getattr { .. } => "attribute",
            ExprKind::Getitem { .. } => "subscript",
            ExprKind::Call(_) => "call",
        }
    }

    /// Append the names a binding target introduces.
    pub fn target_names(&self, out: &mut Vec<String>) {
        match self {
            ExprKind::Name { name, .. } => out.push(name.clone()),
            ExprKind::Tuple { items, .. } => {
                for item in items {
                    if let ScalarItem::Expr(expr) = item {
                        expr.node.target_names(out);
                    }
                }
            }
            _ => {}
        }
    }

    /// Append, once each, the names this expression reads that are neither
    /// in `bound` nor bound by a comprehension inside it.
    pub fn free_names(&self, bound: &mut Vec<String>, out: &mut Vec<String>) {
        match self {
            ExprKind::Name {
                name,
                ctx: ExprContext::Load,
            } => {
                if !bound.contains(name) && !out.contains(name) {
                    out.push(name.clone());
                }
            }
            ExprKind::Const(_) | ExprKind::Name { .. } => {}
            ExprKind::Tuple { items, .. } | ExprKind::List(items) | ExprKind::Set(items) => {
                for item in items {
                    match item {
                        ScalarItem::Expr(expr) => expr.node.free_names(bound, out),
                        ScalarItem::Spread(spread) => spread.node.node.free_names(bound, out),
                    }
                }
            }
            ExprKind::Dict(items) => {
                for item in items {
                    match item {
                        DictItem::Pair(pair) => {
                            pair.key.node.free_names(bound, out);
                            pair.value.node.free_names(bound, out);
                        }
                        DictItem::Spread(spread) => spread.node.node.free_names(bound, out),
                    }
                }
            }
            ExprKind::Generator(comp)
            | ExprKind::ListComprehension(comp)
            | ExprKind::SetComprehension(comp) => {
                clause_free_names(&comp.clauses, bound, out, |bound, out| {
                    comp.result.node.free_names(bound, out)
                })
            }
            ExprKind::DictComprehension(comp) => {
                clause_free_names(&comp.clauses, bound, out, |bound, out| {
                    comp.result.key.node.free_names(bound, out);
                    comp.result.value.node.free_names(bound, out);
                })
            }
            ExprKind::BinaryOp { left, right, .. } => {
                left.node.free_names(bound, out);
                right.node.free_names(bound, out);
            }
            ExprKind::UnaryOp { operand, .. } => operand.node.free_names(bound, out),
            ExprKind::Compare { expr, ops } => {
                expr.node.free_names(bound, out);
                for operand in ops {
                    operand.expr.node.free_names(bound, out);
                }
            }
            ExprKind::CondExpr { test, expr1, expr2 } => {
                test.node.free_names(bound, out);
                expr1.node.free_names(bound, out);
                if let Some(expr2) = expr2 {
                    expr2.node.free_names(bound, out);
                }
            }
            ExprKind::Getattr { node, .. } => node.node.free_names(bound, out),
            ExprKind::Getitem { node, arg } => {
                node.node.free_names(bound, out);
                arg.node.free_names(bound, out);
            }
            ExprKind::Call(call) => {
                call.node.node.free_names(bound, out);
                for arg in &call.args {
                    arg.node.free_names(bound, out);
                }
                if let Some(dyn_args) = &call.dyn_args {
                    dyn_args.node.free_names(bound, out);
                }
                for keyword in &call.kwargs {
                    keyword.value.node.free_names(bound, out);
                }
                if let Some(dyn_kwargs) = &call.dyn_kwargs {
                    dyn_kwargs.node.free_names(bound, out);
                }
            }
        }
    }

    /// Rewrite names (recursively through tuples) into store context.
    pub fn into_store(self) -> ExprKind {
        match self {
            ExprKind::Name { name, .. } => ExprKind::Name {
                name,
                ctx: ExprContext::Store,
            },
            ExprKind::Tuple { items, .. } => ExprKind::Tuple {
                items: items
                    .into_iter()
                    .map(|item| match item {
                        ScalarItem::Expr(expr) => ScalarItem::Expr(expr.map(ExprKind::into_store)),
                        spread => spread,
                    })
                    .collect(),
                ctx: ExprContext::Store,
            },
            other => other,
        }
    }
}

/// Free names of a clause chain: each iterable sees the targets of the
/// clauses before it, the result sees all of them.
fn clause_free_names(
    clauses: &[ComprehensionClause],
    bound: &mut Vec<String>,
    out: &mut Vec<String>,
    result: impl FnOnce(&mut Vec<String>, &mut Vec<String>),
) {
    let depth = bound.len();
    for clause in clauses {
        clause.iter.node.free_names(bound, out);
        clause.target.node.target_names(bound);
        if let Some(cond) = &clause.cond {
            cond.node.free_names(bound, out);
        }
    }
    result(bound, out);
    bound.truncate(depth);
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_expr;

    fn free(source: &str) -> Vec<String> {
        let expr = parse_expr(source).unwrap();
        let mut names = Vec::new();
        expr.node.free_names(&mut Vec::new(), &mut names);
        names
    }

    #[test]
    fn test_free_names_skip_comprehension_targets() {
        assert_eq!(free("[x + y for x in xs if x > z]"), ["xs", "z", "y"]);
        assert_eq!(free("[x for x in x]"), ["x"]);
        assert_eq!(free("{k: f(v, **opts) for k, v in d.items()}"), ["d", "f", "opts"]);
        assert_eq!(free("([a for a in b], a)"), ["b", "a"]);
    }
}
