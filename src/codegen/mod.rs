//! Lowering of template ASTs to Python source.
//!
//! The generated module defines a render function `root(context)` that
//! yields one string per template node. Literal collections, spreads and
//! comprehensions lower to their native Python forms, so the emitted code
//! has the same nesting as the clause chain in the template.
//!
//! In asynchronous mode every comprehension clause becomes an `async for`
//! over `auto_aiter(...)`, membership operands are resolved with
//! `await syncify(...)`, spread operands are syncified, and call results
//! are awaited. The runtime helpers are imported from `weaver.runtime`.
//!
//! Free names lower to `context.resolve('name')`. A name bound by the
//! comprehension clause at depth `d` (counting from 1) lowers to
//! `l_<d>_<name>`, so a loop variable can never shadow `context`, a runtime
//! helper or a Python keyword.

use std::fmt::Write as _;

use crate::ast::expr::*;
use crate::ast::template::{NodeKind, Template};
use crate::ast::value::Value;

const INDENT: &str = "    ";

/// Emits Python source for templates and expressions.
///
/// ```rust
/// use weaver_comprehensions::{parse, CodeGenerator};
///
/// let template = parse("{{ [n for l in rows for n in l] }}").unwrap();
///
/// let sync = CodeGenerator::new(false).generate(&template);
/// assert!(sync.contains("[l_2_n for l_1_l in context.resolve('rows') for l_2_n in l_1_l]"));
///
/// let lowered = CodeGenerator::new(true).generate(&template);
/// assert!(lowered.contains(
///     "[l_2_n async for l_1_l in auto_aiter(context.resolve('rows')) async for l_2_n in auto_aiter(l_1_l)]"
/// ));
/// ```
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    is_async: bool,
    /// Names bound by the enclosing comprehension clauses, innermost last.
    frames: Vec<Vec<String>>,
}

impl CodeGenerator {
    pub fn new(is_async: bool) -> Self {
        Self {
            is_async,
            frames: Vec::new(),
        }
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Pick the asynchronous or synchronous spelling of a construct.
    pub fn choose_async<'s>(&self, async_value: &'s str, sync_value: &'s str) -> &'s str {
        if self.is_async { async_value } else { sync_value }
    }

    /// Generate the full module for a template.
    pub fn generate(&mut self, template: &Template) -> String {
        let mut out = String::new();
        if self.is_async {
            out.push_str("from weaver.runtime import auto_aiter, auto_await, syncify\n");
        }
        let _ = writeln!(out, "{}def root(context):", self.choose_async("async ", ""));

        if template.nodes.is_empty() {
            let _ = writeln!(out, "{INDENT}if 0: yield None");
        }
        for node in &template.nodes {
            match &node.node {
                NodeKind::Literal(text) => {
                    let _ = writeln!(out, "{INDENT}yield {}", Value::String(text.clone()).repr());
                }
                NodeKind::Expression(expr) => {
                    let value = self.expression(expr);
                    if self.is_async {
                        let _ = writeln!(out, "{INDENT}yield str(await syncify({value}))");
                    } else {
                        let _ = writeln!(out, "{INDENT}yield str({value})");
                    }
                }
            }
        }
        out
    }

    /// Lower a single expression.
    pub fn expression(&mut self, expr: &Expr) -> String {
        let mut out = String::new();
        self.visit(expr, &mut out);
        out
    }

    /// Depth of the innermost clause binding `name`, if any.
    fn binding_depth(&self, name: &str) -> Option<usize> {
        self.frames
            .iter()
            .rposition(|frame| frame.iter().any(|bound| bound == name))
            .map(|i| i + 1)
    }

    fn visit(&mut self, expr: &Expr, out: &mut String) {
        match &expr.node {
            ExprKind::Const(value) => const_source(value, out),

            ExprKind::Name {
                name,
                ctx: ExprContext::Store,
            } => {
                let _ = write!(out, "l_{}_{name}", self.frames.len());
            }
            ExprKind::Name { name, .. } => match self.binding_depth(name) {
                Some(depth) => {
                    let _ = write!(out, "l_{depth}_{name}");
                }
                None => {
                    let _ = write!(out, "context.resolve({})", Value::String(name.clone()).repr());
                }
            },

            ExprKind::Tuple { items, .. } => {
                out.push('(');
                self.visit_scalars(items, out);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            ExprKind::List(items) => {
                out.push('[');
                self.visit_scalars(items, out);
                out.push(']');
            }
            ExprKind::Set(items) if items.is_empty() => out.push_str("set()"),
            ExprKind::Set(items) => {
                out.push('{');
                self.visit_scalars(items, out);
                out.push('}');
            }
            ExprKind::Dict(items) => {
                out.push('{');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match item {
                        DictItem::Pair(pair) => self.visit_pair(pair, out),
                        DictItem::Spread(spread) => {
                            out.push_str("**");
                            self.visit_spread_operand(&spread.node, out);
                        }
                    }
                }
                out.push('}');
            }

            ExprKind::Generator(comp) => self.visit_comprehension(("(", ")"), &comp.clauses, out, |g, out| {
                g.visit(&comp.result, out)
            }),
            ExprKind::ListComprehension(comp) => {
                self.visit_comprehension(("[", "]"), &comp.clauses, out, |g, out| g.visit(&comp.result, out))
            }
            ExprKind::SetComprehension(comp) => {
                self.visit_comprehension(("{", "}"), &comp.clauses, out, |g, out| g.visit(&comp.result, out))
            }
            ExprKind::DictComprehension(comp) => {
                self.visit_comprehension(("{", "}"), &comp.clauses, out, |g, out| {
                    g.visit_pair(&comp.result, out)
                })
            }

            ExprKind::BinaryOp {
                left,
                op: BinOp::Concat,
                right,
            } => {
                out.push_str("(str(");
                self.visit(left, out);
                out.push_str(") + str(");
                self.visit(right, out);
                out.push_str("))");
            }
            ExprKind::BinaryOp { left, op, right } => {
                out.push('(');
                self.visit(left, out);
                let _ = write!(out, " {} ", op.symbol());
                self.visit(right, out);
                out.push(')');
            }

            ExprKind::UnaryOp { op, operand } => {
                out.push_str(match op {
                    UnaryOp::Not => "(not ",
                    UnaryOp::Neg => "(-",
                    UnaryOp::Pos => "(+",
                });
                self.visit(operand, out);
                out.push(')');
            }

            ExprKind::Compare { expr, ops } => {
                out.push('(');
                self.visit(expr, out);
                for operand in ops {
                    let _ = write!(out, " {} ", operand.op.symbol());
                    if self.is_async && operand.op.is_membership() {
                        out.push_str("(await syncify(");
                        self.visit(&operand.expr, out);
                        out.push_str("))");
                    } else {
                        self.visit(&operand.expr, out);
                    }
                }
                out.push(')');
            }

            ExprKind::CondExpr { test, expr1, expr2 } => {
                out.push('(');
                self.visit(expr1, out);
                out.push_str(" if ");
                self.visit(test, out);
                out.push_str(" else ");
                match expr2 {
                    Some(expr2) => self.visit(expr2, out),
                    None => {
                        let hint = format!("inline if-expression on line {}", expr.span.line);
                        let _ = write!(out, "context.undefined({})", Value::String(hint).repr());
                    }
                }
                out.push(')');
            }

            ExprKind::Getattr { node, attr } => {
                out.push_str("context.getattr(");
                self.visit(node, out);
                let _ = write!(out, ", {})", Value::String(attr.clone()).repr());
            }
            ExprKind::Getitem { node, arg } => {
                out.push_str("context.getitem(");
                self.visit(node, out);
                out.push_str(", ");
                self.visit(arg, out);
                out.push(')');
            }

            ExprKind::Call(call) => {
                out.push_str(self.choose_async("(await auto_await(context.call(", "context.call("));
                self.visit(&call.node, out);
                for arg in &call.args {
                    out.push_str(", ");
                    self.visit(arg, out);
                }
                if let Some(dyn_args) = &call.dyn_args {
                    out.push_str(", *");
                    self.visit_spread_operand(dyn_args, out);
                }
                for keyword in &call.kwargs {
                    let _ = write!(out, ", {}=", keyword.key);
                    self.visit(&keyword.value, out);
                }
                if let Some(dyn_kwargs) = &call.dyn_kwargs {
                    out.push_str(", **");
                    self.visit_spread_operand(dyn_kwargs, out);
                }
                out.push_str(self.choose_async(")))", ")"));
            }
        }
    }

    fn visit_scalars(&mut self, items: &[ScalarItem], out: &mut String) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match item {
                ScalarItem::Expr(expr) => self.visit(expr, out),
                ScalarItem::Spread(spread) => {
                    out.push('*');
                    self.visit_spread_operand(&spread.node, out);
                }
            }
        }
    }

    /// Spread operands may be async sequences, which `*` cannot unpack.
    fn visit_spread_operand(&mut self, expr: &Expr, out: &mut String) {
        if self.is_async {
            out.push_str("(await syncify(");
            self.visit(expr, out);
            out.push_str("))");
        } else {
            self.visit(expr, out);
        }
    }

    fn visit_pair(&mut self, pair: &Pair, out: &mut String) {
        self.visit(&pair.key, out);
        out.push_str(": ");
        self.visit(&pair.value, out);
    }

    /// Emit `open result clauses close`. Each clause iterable is lowered
    /// before its own target binds; the result sees every target.
    fn visit_comprehension(
        &mut self,
        (open, close): (&str, &str),
        clauses: &[ComprehensionClause],
        out: &mut String,
        result: impl FnOnce(&mut Self, &mut String),
    ) {
        let depth = self.frames.len();
        let mut tail = String::new();
        for clause in clauses {
            let iter = self.expression(&clause.iter);

            let mut names = Vec::new();
            clause.target.node.target_names(&mut names);
            self.frames.push(names);

            tail.push_str(self.choose_async(" async for ", " for "));
            self.visit(&clause.target, &mut tail);
            if self.is_async {
                let _ = write!(tail, " in auto_aiter({iter})");
            } else {
                let _ = write!(tail, " in {iter}");
            }

            if let Some(cond) = &clause.cond {
                tail.push_str(" if ");
                self.visit(cond, &mut tail);
            }
        }

        out.push_str(open);
        result(self, out);
        out.push_str(&tail);
        out.push_str(close);
        self.frames.truncate(depth);
    }
}

/// Python source for a folded constant.
fn const_source(value: &Value, out: &mut String) {
    match value {
        Value::Float(f) if f.is_nan() => out.push_str("float('nan')"),
        Value::Float(f) if f.is_infinite() => {
            out.push_str(if *f > 0.0 { "float('inf')" } else { "float('-inf')" })
        }
        Value::List(items) => {
            out.push('[');
            const_items(items.iter(), out);
            out.push(']');
        }
        Value::Tuple(items) => {
            out.push('(');
            const_items(items.iter(), out);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::Set(items) if items.is_empty() => out.push_str("set()"),
        Value::Set(items) => {
            out.push('{');
            const_items(items.iter(), out);
            out.push('}');
        }
        Value::Dict(map) => {
            out.push('{');
            for (i, (key, value)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                const_source(key, out);
                out.push_str(": ");
                const_source(value, out);
            }
            out.push('}');
        }
        other => out.push_str(&other.repr()),
    }
}

fn const_items<'v>(items: impl Iterator<Item = &'v Value>, out: &mut String) {
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        const_source(item, out);
    }
}
