//! Compile-time constant folding.
//!
//! [`Expr::as_const`] evaluates a subtree without a runtime context. It
//! succeeds only when every operand is itself a literal, and fails with
//! [`NotConstantError`] otherwise. [`optimize`] applies it to every output
//! expression of a template and keeps the original node whenever folding
//! is impossible.

use tracing::trace;

use super::expr::*;
use super::span::Spanned;
use super::template::{NodeKind, Template};
use super::value::Value;
use crate::error::NotConstantError;
use crate::eval::ops;

/// Settings for constant folding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstContext {
    /// When set, nothing folds. Use this when the output of otherwise
    /// constant expressions must still be produced at render time.
    pub volatile: bool,
}

impl ConstContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volatile(mut self, volatile: bool) -> Self {
        self.volatile = volatile;
        self
    }
}

impl Expr {
    /// Fold this expression to a value without a runtime context.
    ///
    /// Spread items are folded first and their elements or pairs are
    /// spliced into the parent in source position. Names, calls, item and
    /// attribute access, and all comprehension kinds never fold. Any error
    /// the operation would raise at runtime is reported as
    /// [`NotConstantError`] too, so the caller falls back to evaluation and
    /// the error surfaces there.
    ///
    /// ```rust
    /// use weaver_comprehensions::{parse_expr, ConstContext, Value};
    ///
    /// let expr = parse_expr("[1, *(2, 3), 4]").unwrap();
    /// let folded = expr.as_const(&ConstContext::default()).unwrap();
    /// assert_eq!(folded.to_string(), "[1, 2, 3, 4]");
    ///
    /// let comp = parse_expr("[x for x in (1, 2)]").unwrap();
    /// assert!(comp.as_const(&ConstContext::default()).is_err());
    /// ```
    pub fn as_const(&self, ctx: &ConstContext) -> Result<Value, NotConstantError> {
        if ctx.volatile {
            return Err(NotConstantError);
        }

        match &self.node {
            ExprKind::Const(value) => Ok(value.clone()),

            ExprKind::Tuple {
                items,
                ctx: ExprContext::Load,
            } => Ok(Value::Tuple(fold_scalars(items, ctx)?)),
            ExprKind::Tuple { .. } => Err(NotConstantError),

            ExprKind::List(items) => Ok(Value::List(fold_scalars(items, ctx)?)),

            ExprKind::Set(items) => {
                let mut set = ops::SetBuilder::default();
                for value in fold_scalars(items, ctx)? {
                    set.insert(value).map_err(|_| NotConstantError)?;
                }
                Ok(set.finish())
            }

            ExprKind::Dict(items) => {
                let mut dict = ops::DictBuilder::default();
                for item in items {
                    match item {
                        DictItem::Pair(pair) => {
                            let key = pair.key.as_const(ctx)?;
                            let value = pair.value.as_const(ctx)?;
                            dict.insert(key, value).map_err(|_| NotConstantError)?;
                        }
                        DictItem::Spread(spread) => {
                            let mapping = spread.node.as_const(ctx)?;
                            if !matches!(mapping, Value::Dict(_)) {
                                return Err(NotConstantError);
                            }
                            for (key, value) in
                                ops::mapping_pairs(&mapping).map_err(|_| NotConstantError)?
                            {
                                dict.insert(key, value).map_err(|_| NotConstantError)?;
                            }
                        }
                    }
                }
                Ok(dict.finish())
            }

            ExprKind::BinaryOp { left, op, right } => {
                let left = left.as_const(ctx)?;
                match op {
                    BinOp::And if !left.is_truthy() => Ok(left),
                    BinOp::Or if left.is_truthy() => Ok(left),
                    _ => {
                        let right = right.as_const(ctx)?;
                        ops::binary(*op, &left, &right).map_err(|_| NotConstantError)
                    }
                }
            }

            ExprKind::UnaryOp { op, operand } => {
                let value = operand.as_const(ctx)?;
                ops::unary(*op, &value).map_err(|_| NotConstantError)
            }

            ExprKind::Compare { expr, ops: operands } => {
                let mut left = expr.as_const(ctx)?;
                for operand in operands {
                    let right = operand.expr.as_const(ctx)?;
                    if !ops::compare(operand.op, &left, &right).map_err(|_| NotConstantError)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }

            ExprKind::CondExpr { test, expr1, expr2 } => {
                if test.as_const(ctx)?.is_truthy() {
                    expr1.as_const(ctx)
                } else {
                    match expr2 {
                        Some(expr2) => expr2.as_const(ctx),
                        None => Err(NotConstantError),
                    }
                }
            }

            ExprKind::Name { .. }
            | ExprKind::Generator(_)
            | ExprKind::ListComprehension(_)
            | ExprKind::SetComprehension(_)
            | ExprKind::DictComprehension(_)
            | ExprKind::Getattr { .. }
            | ExprKind::Getitem { .. }
            | ExprKind::Call(_) => Err(NotConstantError),
        }
    }
}

fn fold_scalars(items: &[ScalarItem], ctx: &ConstContext) -> Result<Vec<Value>, NotConstantError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            ScalarItem::Expr(expr) => out.push(expr.as_const(ctx)?),
            ScalarItem::Spread(spread) => {
                let iterable = spread.node.as_const(ctx)?;
                out.extend(ops::iterate(&iterable).map_err(|_| NotConstantError)?);
            }
        }
    }
    Ok(out)
}

/// Replace every foldable output expression of `template` with its value.
///
/// Returns how many expressions were folded. Expressions that are already
/// constants are left alone and not counted.
pub fn optimize(template: &mut Template, ctx: &ConstContext) -> usize {
    let mut folded = 0;
    for node in &mut template.nodes {
        let NodeKind::Expression(expr) = &mut node.node else {
            continue;
        };
        if matches!(expr.node, ExprKind::Const(_)) {
            continue;
        }
        match expr.as_const(ctx) {
            Ok(value) => {
                trace!(line = expr.lineno(), value = %value.repr(), "folded output expression");
                *expr = Spanned::new(ExprKind::Const(value), expr.span);
                folded += 1;
            }
            Err(NotConstantError) => {}
        }
    }
    folded
}
