//! Template evaluation engine.
//!
//! The evaluator walks a parsed [`Template`] AST and produces a string
//! output. Free names resolve through the provided [`EvalContext`] and then
//! the [`Registry`]; names bound by comprehension clauses live in scope
//! frames managed internally and never reach the host.
//!
//! There are two paths through the tree. The synchronous path iterates
//! plain values. The asynchronous path adapts every comprehension iterable
//! with [`auto_aiter`](crate::runtime::auto_aiter), awaits call results,
//! and passes the right operand of `in` and every output chunk through
//! [`syncify`](crate::runtime::syncify).
//!
//! Generator expressions are lazy on both paths: only their first clause
//! iterable is evaluated up front.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::ast::expr::*;
use crate::ast::span::Span;
use crate::ast::template::*;
use crate::ast::value::Value;
use crate::error::{EvalError, EvalErrorKind};
use crate::registry::{FunctionRef, Kwargs, Registry};
use crate::runtime::{self, syncify};

mod context;
mod generator;
pub mod ops;

pub use context::{EvalContext, SimpleContext};

/// Nesting depth at which evaluation gives up with
/// [`RecursionLimit`](EvalErrorKind::RecursionLimit).
const MAX_DEPTH: usize = 256;

/// Evaluate a template against a context and registry, producing the final
/// string output.
///
/// This creates a fresh evaluator with an empty scope stack on each call.
/// For repeated evaluation of the same template, use [`CompiledTemplate`](crate::CompiledTemplate).
pub fn evaluate(
    template: &Template,
    ctx: &impl EvalContext,
    registry: &Registry,
) -> Result<String, EvalError> {
    evaluate_with_options(template, ctx, registry, EvalOptions::default())
}

/// Evaluate a template with custom options for resource limits,
/// cancellation, undefined handling and async mode.
///
/// With [`EvalOptions::enable_async`] set, this drives the asynchronous
/// path to completion on the calling thread.
///
/// # Example: resource limits
///
/// ```rust
/// use weaver_comprehensions::{evaluate_with_options, EvalOptions, SimpleContext, Registry};
///
/// let template = weaver_comprehensions::parse("{{ [x * x for x in range(4)] }}").unwrap();
/// let ctx = SimpleContext::new();
/// let registry = Registry::with_builtins();
///
/// let opts = EvalOptions::new().max_node_evaluations(1000).max_iterations(100);
/// let result = evaluate_with_options(&template, &ctx, &registry, opts);
/// assert_eq!(result.unwrap(), "[0, 1, 4, 9]");
/// ```
///
/// # Example: strict undefined
///
/// ```rust
/// use weaver_comprehensions::{evaluate_with_options, EvalOptions, UndefinedBehavior};
/// use weaver_comprehensions::{SimpleContext, Registry};
///
/// let template = weaver_comprehensions::parse("Hi {{ missing }}!").unwrap();
/// let ctx = SimpleContext::new();
/// let registry = Registry::new();
///
/// // Lenient mode (default) renders undefined values as empty text.
/// let lenient = evaluate_with_options(&template, &ctx, &registry, EvalOptions::new());
/// assert_eq!(lenient.unwrap(), "Hi !");
///
/// let opts = EvalOptions::new().undefined(UndefinedBehavior::Strict);
/// let err = evaluate_with_options(&template, &ctx, &registry, opts).unwrap_err();
/// assert_eq!(err.message, "'missing' is undefined");
/// ```
pub fn evaluate_with_options(
    template: &Template,
    ctx: &impl EvalContext,
    registry: &Registry,
    options: EvalOptions,
) -> Result<String, EvalError> {
    let mut evaluator = Evaluator::new(ctx, registry, options);
    if evaluator.options.enable_async {
        futures::executor::block_on(evaluator.eval_template_async(template))
    } else {
        evaluator.eval_template(template)
    }
}

/// Evaluate a template on the asynchronous path.
///
/// Fails with [`AsyncDisabled`](EvalErrorKind::AsyncDisabled) unless
/// `options` has [`enable_async`](EvalOptions::enable_async) set.
pub async fn evaluate_async(
    template: &Template,
    ctx: &impl EvalContext,
    registry: &Registry,
    options: EvalOptions,
) -> Result<String, EvalError> {
    if !options.enable_async {
        return Err(EvalError::async_disabled());
    }
    let mut evaluator = Evaluator::new(ctx, registry, options);
    evaluator.eval_template_async(template).await
}

/// Evaluate a parsed expression and return its [`Value`] directly.
///
/// Unlike [`evaluate`], which walks a full template AST and produces
/// a string, this evaluates a single expression and returns the typed
/// result.
///
/// This is the evaluation counterpart to [`parse_expr`](crate::parse_expr).
///
/// # Examples
///
/// ```rust
/// use weaver_comprehensions::{parse_expr, eval_expr_value, SimpleContext, Registry, Value};
///
/// let expr = parse_expr("{n: n % 2 == 0 for n in nums}").unwrap();
/// let mut ctx = SimpleContext::new();
/// ctx.set("nums", vec![1i64, 2]);
/// let registry = Registry::new();
///
/// let result = eval_expr_value(&expr, &ctx, &registry).unwrap();
/// assert_eq!(result.to_string(), "{1: False, 2: True}");
/// ```
pub fn eval_expr_value(
    expr: &Expr,
    ctx: &impl EvalContext,
    registry: &Registry,
) -> Result<Value, EvalError> {
    let mut evaluator = Evaluator::new(ctx, registry, EvalOptions::default());
    evaluator.eval_expr(expr)
}

/// Asynchronous counterpart of [`eval_expr_value`]. The result is not
/// passed through `syncify`, so a generator expression yields an
/// [`AsyncSeq`](crate::runtime::AsyncSeq).
pub async fn eval_expr_value_async(
    expr: &Expr,
    ctx: &impl EvalContext,
    registry: &Registry,
    options: EvalOptions,
) -> Result<Value, EvalError> {
    if !options.enable_async {
        return Err(EvalError::async_disabled());
    }
    let mut evaluator = Evaluator::new(ctx, registry, options);
    evaluator.eval_expr_async(expr).await
}

// ── Evaluation options ──────────────────────────────────────────────────

/// What happens when an undefined name is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UndefinedBehavior {
    /// Undefined renders as empty text and iterates as an empty sequence.
    #[default]
    Lenient,
    /// Rendering, iterating, spreading or testing membership against an
    /// undefined value is an [`UndefinedVariable`](EvalErrorKind::UndefinedVariable)
    /// error. Truthiness tests and `syncify` still accept it.
    Strict,
}

/// Configuration for resource limits, cancellation, undefined handling
/// and async mode during template evaluation.
///
/// Create with [`EvalOptions::new()`] and chain builder methods:
///
/// ```rust
/// use weaver_comprehensions::{EvalOptions, UndefinedBehavior};
/// use std::sync::Arc;
/// use std::sync::atomic::AtomicBool;
///
/// let token = Arc::new(AtomicBool::new(false));
/// let opts = EvalOptions::new()
///     .max_node_evaluations(10_000)
///     .max_iterations(1_000)
///     .cancellation_token(token)
///     .undefined(UndefinedBehavior::Strict)
///     .enable_async(true);
/// ```
#[derive(Clone, Default)]
pub struct EvalOptions {
    /// Maximum number of AST node evaluations before the evaluator
    /// returns a [`ResourceLimit`](EvalErrorKind::ResourceLimit) error.
    /// `None` means unlimited.
    pub max_node_evaluations: Option<u64>,

    /// Maximum number of elements produced by comprehension clauses and
    /// spreads before the evaluator returns a
    /// [`ResourceLimit`](EvalErrorKind::ResourceLimit) error.
    /// `None` means unlimited.
    pub max_iterations: Option<u64>,

    /// An external flag that can be set to `true` to cancel an
    /// in-progress evaluation. Checked after each node evaluation.
    pub cancellation_token: Option<Arc<AtomicBool>>,

    pub undefined: UndefinedBehavior,

    /// Evaluate on the asynchronous path.
    pub enable_async: bool,
}

impl EvalOptions {
    /// Create a new `EvalOptions` with all defaults (no limits, lenient
    /// undefined, synchronous).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of AST node evaluations.
    pub fn max_node_evaluations(mut self, limit: u64) -> Self {
        self.max_node_evaluations = Some(limit);
        self
    }

    /// Set the maximum number of comprehension and spread elements.
    pub fn max_iterations(mut self, limit: u64) -> Self {
        self.max_iterations = Some(limit);
        self
    }

    /// Attach a cancellation token. Set the `AtomicBool` to `true` from
    /// another thread to abort evaluation.
    pub fn cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn undefined(mut self, behavior: UndefinedBehavior) -> Self {
        self.undefined = behavior;
        self
    }

    /// Enable or disable the asynchronous evaluation path.
    pub fn enable_async(mut self, enable: bool) -> Self {
        self.enable_async = enable;
        self
    }
}

impl std::fmt::Debug for EvalOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalOptions")
            .field("max_node_evaluations", &self.max_node_evaluations)
            .field("max_iterations", &self.max_iterations)
            .field("cancellation_token", &self.cancellation_token.is_some())
            .field("undefined", &self.undefined)
            .field("enable_async", &self.enable_async)
            .finish()
    }
}

// ── Lexical scope stack ─────────────────────────────────────────────────

/// Bindings introduced by one comprehension clause for one element.
struct ScopeFrame {
    bindings: HashMap<String, Value>,
}

impl ScopeFrame {
    fn new(bindings: Vec<(String, Value)>) -> Self {
        Self {
            bindings: bindings.into_iter().collect(),
        }
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }
}

/// Accumulates the results of one comprehension.
enum Collector<'e> {
    List { result: &'e Expr, items: Vec<Value> },
    Set { result: &'e Expr, items: ops::SetBuilder },
    Dict { result: &'e Pair, items: ops::DictBuilder },
}

impl<'e> Collector<'e> {
    fn list(result: &'e Expr) -> Self {
        Collector::List {
            result,
            items: Vec::new(),
        }
    }

    fn set(result: &'e Expr) -> Self {
        Collector::Set {
            result,
            items: ops::SetBuilder::default(),
        }
    }

    fn dict(result: &'e Pair) -> Self {
        Collector::Dict {
            result,
            items: ops::DictBuilder::default(),
        }
    }

    fn finish(self) -> Value {
        match self {
            Collector::List { items, .. } => Value::List(items),
            Collector::Set { items, .. } => items.finish(),
            Collector::Dict { items, .. } => items.finish(),
        }
    }
}

/// What a call expression invokes.
enum Callee {
    Function(FunctionRef),
    Method(Value, String),
}

struct Evaluator<'a> {
    ctx: &'a dyn EvalContext,
    registry: &'a Registry,
    options: EvalOptions,
    scopes: Vec<ScopeFrame>,
    node_count: u64,
    iteration_count: u64,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    fn new(ctx: &'a dyn EvalContext, registry: &'a Registry, options: EvalOptions) -> Self {
        Self {
            ctx,
            registry,
            options,
            scopes: Vec::new(),
            node_count: 0,
            iteration_count: 0,
            depth: 0,
        }
    }

    /// Open a scope frame for one element of a comprehension clause.
    fn push_bindings(&mut self, target: &Expr, value: Value) -> Result<(), EvalError> {
        let mut bindings = Vec::new();
        ops::bind_target(target, value, &mut bindings).map_err(|e| e.or_span(target.span))?;
        self.scopes.push(ScopeFrame::new(bindings));
        Ok(())
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn resolve_lexical(&self, name: &str) -> Option<Value> {
        for frame in self.scopes.iter().rev() {
            if let Some(val) = frame.get(name) {
                return Some(val.clone());
            }
        }
        None
    }

    /// Comprehension bindings, then the host context, then the registry.
    fn resolve_name(&self, name: &str) -> Result<Value, EvalError> {
        if let Some(value) = self.resolve_lexical(name) {
            return Ok(value);
        }
        if let Some(value) = self.ctx.resolve(name)? {
            return Ok(value);
        }
        if let Some(func) = self.registry.get(name) {
            return Ok(Value::Function(func));
        }
        Ok(Value::Undefined(name.to_string()))
    }

    /// Reject an undefined operand in strict mode.
    fn require_defined(&self, value: &Value) -> Result<(), EvalError> {
        match value {
            Value::Undefined(name) if self.options.undefined == UndefinedBehavior::Strict => {
                Err(EvalError::undefined_variable(name))
            }
            _ => Ok(()),
        }
    }

    fn output_string(&self, value: &Value) -> Result<String, EvalError> {
        self.require_defined(value)?;
        Ok(value.to_output_string())
    }

    /// Check resource limits and cancellation. Called once per node evaluation.
    fn check_limits(&mut self) -> Result<(), EvalError> {
        self.node_count += 1;

        if let Some(max) = self.options.max_node_evaluations
            && self.node_count > max
        {
            return Err(EvalError::new(
                EvalErrorKind::ResourceLimit,
                format!("evaluation exceeded maximum of {max} node evaluations"),
            ));
        }

        if let Some(ref token) = self.options.cancellation_token
            && token.load(Ordering::Relaxed)
        {
            return Err(EvalError::new(
                EvalErrorKind::Cancelled,
                "evaluation cancelled",
            ));
        }

        Ok(())
    }

    /// Check iteration limit. Called once per comprehension or spread element.
    fn check_iteration_limit(&mut self) -> Result<(), EvalError> {
        self.iteration_count += 1;

        if let Some(max) = self.options.max_iterations
            && self.iteration_count > max
        {
            return Err(EvalError::new(
                EvalErrorKind::ResourceLimit,
                format!("evaluation exceeded maximum of {max} iterations"),
            ));
        }

        Ok(())
    }

    fn enter(&mut self) -> Result<(), EvalError> {
        self.check_limits()?;
        if self.depth >= MAX_DEPTH {
            return Err(EvalError::new(
                EvalErrorKind::RecursionLimit,
                format!("expression nesting exceeded maximum depth of {MAX_DEPTH}"),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ── Shared pieces of both paths ─────────────────────────────────────

    /// Splice the elements of a `*` spread operand into `out`.
    fn extend_spread(&mut self, out: &mut Vec<Value>, value: Value, span: Span) -> Result<(), EvalError> {
        self.require_defined(&value).map_err(|e| e.or_span(span))?;
        for element in ops::iterate(&value).map_err(|e| e.or_span(span))? {
            self.check_iteration_limit()?;
            out.push(element);
        }
        Ok(())
    }

    /// Merge the pairs of a `**` spread operand into `dict`.
    fn merge_spread(&mut self, dict: &mut ops::DictBuilder, value: Value, span: Span) -> Result<(), EvalError> {
        self.require_defined(&value).map_err(|e| e.or_span(span))?;
        for (key, value) in ops::mapping_pairs(&value).map_err(|e| e.or_span(span))? {
            self.check_iteration_limit()?;
            dict.insert(key, value).map_err(|e| e.or_span(span))?;
        }
        Ok(())
    }

    fn merge_kwargs(&mut self, kwargs: &mut Kwargs, value: Value, span: Span) -> Result<(), EvalError> {
        self.require_defined(&value).map_err(|e| e.or_span(span))?;
        for (key, value) in ops::mapping_pairs(&value).map_err(|e| e.or_span(span))? {
            let Value::String(key) = key else {
                return Err(EvalError::new(EvalErrorKind::TypeError, "keywords must be strings")
                    .with_span(span));
            };
            if kwargs.contains_key(&key) {
                return Err(EvalError::new(
                    EvalErrorKind::TypeError,
                    format!("got multiple values for keyword argument '{key}'"),
                )
                .with_span(span));
            }
            kwargs.insert(key, value);
        }
        Ok(())
    }

    fn comprehension_iterable(&self, iterable: &Value, span: Span) -> Result<(), EvalError> {
        self.require_defined(iterable).map_err(|e| e.or_span(span))
    }

    fn callable(value: Value) -> Result<Callee, EvalError> {
        match value {
            Value::Function(func) => Ok(Callee::Function(func)),
            Value::Undefined(name) => Err(EvalError::undefined_callable(&name)),
            other => Err(EvalError::new(
                EvalErrorKind::TypeError,
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    /// `obj.attr(...)`: a function stored under a dict key, or a builtin method.
    fn method(obj: Value, attr: &str) -> Callee {
        if let Value::Dict(map) = &obj
            && let Some(Value::Function(func)) = map.get(&Value::String(attr.to_string()))
        {
            return Callee::Function(func.clone());
        }
        Callee::Method(obj, attr.to_string())
    }

    fn call_method(&self, obj: &Value, name: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value, EvalError> {
        if !kwargs.is_empty() {
            return Err(EvalError::new(
                EvalErrorKind::TypeError,
                format!("{name}() takes no keyword arguments"),
            ));
        }
        ops::call_method(obj, name, args)
    }

    /// Attribute access. In lenient mode an undefined object yields another
    /// undefined value instead of failing.
    fn getattr(&self, obj: &Value, attr: &str) -> Result<Value, EvalError> {
        match obj {
            Value::Undefined(name) if self.options.undefined == UndefinedBehavior::Lenient => {
                Ok(Value::Undefined(format!("{name}.{attr}")))
            }
            _ => ops::getattr(obj, attr),
        }
    }

    fn getitem(&self, obj: &Value, key: &Value) -> Result<Value, EvalError> {
        match obj {
            Value::Undefined(name) if self.options.undefined == UndefinedBehavior::Lenient => {
                Ok(Value::Undefined(format!("{name}[{}]", key.repr())))
            }
            _ => ops::getitem(obj, key),
        }
    }

    // ── Template evaluation ─────────────────────────────────────────────

    fn eval_template(&mut self, template: &Template) -> Result<String, EvalError> {
        let mut output = String::new();
        for node in &template.nodes {
            self.check_limits()?;
            match &node.node {
                NodeKind::Literal(text) => output.push_str(text),
                NodeKind::Expression(expr) => {
                    let value = self.eval_expr(expr)?;
                    let fragment = self.output_string(&value).map_err(|e| e.or_span(node.span))?;
                    output.push_str(&fragment);
                }
            }
        }
        Ok(output)
    }

    // ── Expression evaluation ───────────────────────────────────────────

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        self.enter()?;
        let result = self.eval_expr_kind(expr).map_err(|e| e.or_span(expr.span));
        self.leave();
        result
    }

    fn eval_expr_kind(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match &expr.node {
            ExprKind::Const(value) => Ok(value.clone()),

            ExprKind::Name { name, .. } => self.resolve_name(name),

            ExprKind::Tuple { items, .. } => Ok(Value::Tuple(self.eval_scalars(items)?)),
            ExprKind::List(items) => Ok(Value::List(self.eval_scalars(items)?)),
            ExprKind::Set(items) => {
                let mut set = ops::SetBuilder::default();
                for value in self.eval_scalars(items)? {
                    set.insert(value)?;
                }
                Ok(set.finish())
            }
            ExprKind::Dict(items) => self.eval_dict(items),

            ExprKind::ListComprehension(comp) => {
                let mut collector = Collector::list(&comp.result);
                self.run_comprehension(&comp.clauses, &mut collector)?;
                Ok(collector.finish())
            }
            ExprKind::SetComprehension(comp) => {
                let mut collector = Collector::set(&comp.result);
                self.run_comprehension(&comp.clauses, &mut collector)?;
                Ok(collector.finish())
            }
            ExprKind::DictComprehension(comp) => {
                let mut collector = Collector::dict(&comp.result);
                self.run_comprehension(&comp.clauses, &mut collector)?;
                Ok(collector.finish())
            }
            ExprKind::Generator(comp) => self.start_generator(comp),

            ExprKind::BinaryOp { left, op, right } => {
                let left_val = self.eval_expr(left)?;
                match op {
                    BinOp::And if !left_val.is_truthy() => Ok(left_val),
                    BinOp::Or if left_val.is_truthy() => Ok(left_val),
                    BinOp::And | BinOp::Or => self.eval_expr(right),
                    _ => {
                        let right_val = self.eval_expr(right)?;
                        ops::binary(*op, &left_val, &right_val)
                    }
                }
            }

            ExprKind::UnaryOp { op, operand } => {
                let value = self.eval_expr(operand)?;
                ops::unary(*op, &value)
            }

            ExprKind::Compare { expr, ops: operands } => {
                let mut left = self.eval_expr(expr)?;
                for operand in operands {
                    let right = self.eval_expr(&operand.expr)?;
                    if operand.op.is_membership() {
                        self.require_defined(&right)?;
                    }
                    if !ops::compare(operand.op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }

            ExprKind::CondExpr { test, expr1, expr2 } => {
                if self.eval_expr(test)?.is_truthy() {
                    self.eval_expr(expr1)
                } else if let Some(expr2) = expr2 {
                    self.eval_expr(expr2)
                } else {
                    Ok(missing_else(expr.span))
                }
            }

            ExprKind::Getattr { node, attr } => {
                let obj = self.eval_expr(node)?;
                self.getattr(&obj, attr)
            }

            ExprKind::Getitem { node, arg } => {
                let obj = self.eval_expr(node)?;
                let key = self.eval_expr(arg)?;
                self.getitem(&obj, &key)
            }

            ExprKind::Call(call) => {
                let callee = match &call.node.node {
                    ExprKind::Getattr { node, attr } => Self::method(self.eval_expr(node)?, attr),
                    _ => Self::callable(self.eval_expr(&call.node)?)?,
                };
                let (args, kwargs) = self.eval_call_args(call)?;
                match callee {
                    Callee::Function(func) => func.call(args, kwargs),
                    Callee::Method(obj, name) => self.call_method(&obj, &name, &args, &kwargs),
                }
            }
        }
    }

    fn eval_scalars(&mut self, items: &[ScalarItem]) -> Result<Vec<Value>, EvalError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                ScalarItem::Expr(expr) => out.push(self.eval_expr(expr)?),
                ScalarItem::Spread(spread) => {
                    let value = self.eval_expr(&spread.node)?;
                    self.extend_spread(&mut out, value, spread.span)?;
                }
            }
        }
        Ok(out)
    }

    fn eval_dict(&mut self, items: &[DictItem]) -> Result<Value, EvalError> {
        let mut dict = ops::DictBuilder::default();
        for item in items {
            match item {
                DictItem::Pair(pair) => {
                    let key = self.eval_expr(&pair.key)?;
                    let value = self.eval_expr(&pair.value)?;
                    dict.insert(key, value).map_err(|e| e.or_span(pair.span))?;
                }
                DictItem::Spread(spread) => {
                    let value = self.eval_expr(&spread.node)?;
                    self.merge_spread(&mut dict, value, spread.span)?;
                }
            }
        }
        Ok(dict.finish())
    }

    fn eval_call_args(&mut self, call: &Call) -> Result<(Vec<Value>, Kwargs), EvalError> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval_expr(arg)?);
        }
        if let Some(dyn_args) = &call.dyn_args {
            let value = self.eval_expr(dyn_args)?;
            self.extend_spread(&mut args, value, dyn_args.span)?;
        }
        let mut kwargs = Kwargs::with_capacity(call.kwargs.len());
        for keyword in &call.kwargs {
            let value = self.eval_expr(&keyword.value)?;
            kwargs.insert(keyword.key.clone(), value);
        }
        if let Some(dyn_kwargs) = &call.dyn_kwargs {
            let value = self.eval_expr(dyn_kwargs)?;
            self.merge_kwargs(&mut kwargs, value, dyn_kwargs.span)?;
        }
        Ok((args, kwargs))
    }

    /// Run the clause chain outermost first. Each element of a clause gets
    /// its own scope frame, popped before the next element binds.
    fn run_comprehension(
        &mut self,
        clauses: &[ComprehensionClause],
        collector: &mut Collector<'_>,
    ) -> Result<(), EvalError> {
        let Some((clause, rest)) = clauses.split_first() else {
            return self.emit(collector);
        };

        let iterable = self.eval_expr(&clause.iter)?;
        self.comprehension_iterable(&iterable, clause.iter.span)?;
        let elements = ops::elements(&iterable).map_err(|e| e.or_span(clause.iter.span))?;

        for element in elements {
            let element = element.map_err(|e| e.or_span(clause.iter.span))?;
            self.check_iteration_limit()?;
            self.push_bindings(&clause.target, element)?;
            let result = self.clause_body(clause, rest, collector);
            self.pop_scope();
            result?;
        }
        Ok(())
    }

    fn clause_body(
        &mut self,
        clause: &ComprehensionClause,
        rest: &[ComprehensionClause],
        collector: &mut Collector<'_>,
    ) -> Result<(), EvalError> {
        if let Some(cond) = &clause.cond
            && !self.eval_expr(cond)?.is_truthy()
        {
            return Ok(());
        }
        self.run_comprehension(rest, collector)
    }

    fn emit(&mut self, collector: &mut Collector<'_>) -> Result<(), EvalError> {
        match collector {
            Collector::List { result, items } => {
                let value = self.eval_expr(*result)?;
                items.push(value);
            }
            Collector::Set { result, items } => {
                let value = self.eval_expr(*result)?;
                items.insert(value).map_err(|e| e.or_span(result.span))?;
            }
            Collector::Dict { result, items } => {
                let key = self.eval_expr(&result.key)?;
                let value = self.eval_expr(&result.value)?;
                items.insert(key, value).map_err(|e| e.or_span(result.span))?;
            }
        }
        Ok(())
    }

    // ── Asynchronous path ───────────────────────────────────────────────

    async fn eval_template_async(&mut self, template: &Template) -> Result<String, EvalError> {
        debug!(nodes = template.nodes.len(), "rendering template asynchronously");
        let mut output = String::new();
        for node in &template.nodes {
            self.check_limits()?;
            match &node.node {
                NodeKind::Literal(text) => output.push_str(text),
                NodeKind::Expression(expr) => {
                    let value = self.eval_expr_async(expr).await?;
                    let value = syncify(value).await.map_err(|e| e.or_span(node.span))?;
                    let fragment = self.output_string(&value).map_err(|e| e.or_span(node.span))?;
                    output.push_str(&fragment);
                }
            }
        }
        Ok(output)
    }

    fn eval_expr_async<'f>(&'f mut self, expr: &'f Expr) -> BoxFuture<'f, Result<Value, EvalError>> {
        Box::pin(async move {
            self.enter()?;
            let result = self
                .eval_expr_kind_async(expr)
                .await
                .map_err(|e| e.or_span(expr.span));
            self.leave();
            result
        })
    }

    async fn eval_expr_kind_async(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match &expr.node {
            ExprKind::Const(value) => Ok(value.clone()),

            ExprKind::Name { name, .. } => self.resolve_name(name),

            ExprKind::Tuple { items, .. } => Ok(Value::Tuple(self.eval_scalars_async(items).await?)),
            ExprKind::List(items) => Ok(Value::List(self.eval_scalars_async(items).await?)),
            ExprKind::Set(items) => {
                let mut set = ops::SetBuilder::default();
                for value in self.eval_scalars_async(items).await? {
                    set.insert(value)?;
                }
                Ok(set.finish())
            }
            ExprKind::Dict(items) => self.eval_dict_async(items).await,

            ExprKind::ListComprehension(comp) => {
                let mut collector = Collector::list(&comp.result);
                self.run_comprehension_async(&comp.clauses, &mut collector).await?;
                Ok(collector.finish())
            }
            ExprKind::SetComprehension(comp) => {
                let mut collector = Collector::set(&comp.result);
                self.run_comprehension_async(&comp.clauses, &mut collector).await?;
                Ok(collector.finish())
            }
            ExprKind::DictComprehension(comp) => {
                let mut collector = Collector::dict(&comp.result);
                self.run_comprehension_async(&comp.clauses, &mut collector).await?;
                Ok(collector.finish())
            }
            ExprKind::Generator(comp) => self.start_generator_async(comp).await,

            ExprKind::BinaryOp { left, op, right } => {
                let left_val = self.eval_expr_async(left).await?;
                match op {
                    BinOp::And if !left_val.is_truthy() => Ok(left_val),
                    BinOp::Or if left_val.is_truthy() => Ok(left_val),
                    BinOp::And | BinOp::Or => self.eval_expr_async(right).await,
                    _ => {
                        let right_val = self.eval_expr_async(right).await?;
                        ops::binary(*op, &left_val, &right_val)
                    }
                }
            }

            ExprKind::UnaryOp { op, operand } => {
                let value = self.eval_expr_async(operand).await?;
                ops::unary(*op, &value)
            }

            ExprKind::Compare { expr, ops: operands } => {
                let mut left = self.eval_expr_async(expr).await?;
                for operand in operands {
                    let mut right = self.eval_expr_async(&operand.expr).await?;
                    if operand.op.is_membership() {
                        right = syncify(right).await?;
                        self.require_defined(&right)?;
                    }
                    if !ops::compare(operand.op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }

            ExprKind::CondExpr { test, expr1, expr2 } => {
                if self.eval_expr_async(test).await?.is_truthy() {
                    self.eval_expr_async(expr1).await
                } else if let Some(expr2) = expr2 {
                    self.eval_expr_async(expr2).await
                } else {
                    Ok(missing_else(expr.span))
                }
            }

            ExprKind::Getattr { node, attr } => {
                let obj = self.eval_expr_async(node).await?;
                self.getattr(&obj, attr)
            }

            ExprKind::Getitem { node, arg } => {
                let obj = self.eval_expr_async(node).await?;
                let key = self.eval_expr_async(arg).await?;
                self.getitem(&obj, &key)
            }

            ExprKind::Call(call) => {
                let callee = match &call.node.node {
                    ExprKind::Getattr { node, attr } => {
                        Self::method(self.eval_expr_async(node).await?, attr)
                    }
                    _ => Self::callable(self.eval_expr_async(&call.node).await?)?,
                };
                let (args, kwargs) = self.eval_call_args_async(call).await?;
                let value = match callee {
                    Callee::Function(func) => func.call_async(args, kwargs).await?,
                    Callee::Method(obj, name) => self.call_method(&obj, &name, &args, &kwargs)?,
                };
                // Call results are awaited automatically.
                match value {
                    Value::Awaitable(awaitable) => awaitable.resolve().await,
                    other => Ok(other),
                }
            }
        }
    }

    async fn eval_scalars_async(&mut self, items: &[ScalarItem]) -> Result<Vec<Value>, EvalError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                ScalarItem::Expr(expr) => out.push(self.eval_expr_async(expr).await?),
                ScalarItem::Spread(spread) => {
                    let value = self.eval_expr_async(&spread.node).await?;
                    let value = syncify(value).await?;
                    self.extend_spread(&mut out, value, spread.span)?;
                }
            }
        }
        Ok(out)
    }

    async fn eval_dict_async(&mut self, items: &[DictItem]) -> Result<Value, EvalError> {
        let mut dict = ops::DictBuilder::default();
        for item in items {
            match item {
                DictItem::Pair(pair) => {
                    let key = self.eval_expr_async(&pair.key).await?;
                    let value = self.eval_expr_async(&pair.value).await?;
                    dict.insert(key, value).map_err(|e| e.or_span(pair.span))?;
                }
                DictItem::Spread(spread) => {
                    let value = self.eval_expr_async(&spread.node).await?;
                    let value = syncify(value).await?;
                    self.merge_spread(&mut dict, value, spread.span)?;
                }
            }
        }
        Ok(dict.finish())
    }

    async fn eval_call_args_async(&mut self, call: &Call) -> Result<(Vec<Value>, Kwargs), EvalError> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval_expr_async(arg).await?);
        }
        if let Some(dyn_args) = &call.dyn_args {
            let value = self.eval_expr_async(dyn_args).await?;
            let value = syncify(value).await?;
            self.extend_spread(&mut args, value, dyn_args.span)?;
        }
        let mut kwargs = Kwargs::with_capacity(call.kwargs.len());
        for keyword in &call.kwargs {
            let value = self.eval_expr_async(&keyword.value).await?;
            kwargs.insert(keyword.key.clone(), value);
        }
        if let Some(dyn_kwargs) = &call.dyn_kwargs {
            let value = self.eval_expr_async(dyn_kwargs).await?;
            let value = syncify(value).await?;
            self.merge_kwargs(&mut kwargs, value, dyn_kwargs.span)?;
        }
        Ok((args, kwargs))
    }

    /// Asynchronous clause chain. Each iterable goes through `auto_aiter`,
    /// so async sequences are pulled one element per suspension.
    fn run_comprehension_async<'f, 'e: 'f>(
        &'f mut self,
        clauses: &'f [ComprehensionClause],
        collector: &'f mut Collector<'e>,
    ) -> BoxFuture<'f, Result<(), EvalError>> {
        Box::pin(async move {
            let Some((clause, rest)) = clauses.split_first() else {
                return self.emit_async(collector).await;
            };

            let iterable = self.eval_expr_async(&clause.iter).await?;
            self.comprehension_iterable(&iterable, clause.iter.span)?;
            let mut elements =
                runtime::auto_aiter(&iterable).map_err(|e| e.or_span(clause.iter.span))?;

            while let Some(element) = elements.next().await {
                let element = element.map_err(|e| e.or_span(clause.iter.span))?;
                self.check_iteration_limit()?;
                self.push_bindings(&clause.target, element)?;
                let result = self.clause_body_async(clause, rest, collector).await;
                self.pop_scope();
                result?;
            }
            Ok(())
        })
    }

    async fn clause_body_async(
        &mut self,
        clause: &ComprehensionClause,
        rest: &[ComprehensionClause],
        collector: &mut Collector<'_>,
    ) -> Result<(), EvalError> {
        if let Some(cond) = &clause.cond
            && !self.eval_expr_async(cond).await?.is_truthy()
        {
            return Ok(());
        }
        self.run_comprehension_async(rest, collector).await
    }

    async fn emit_async(&mut self, collector: &mut Collector<'_>) -> Result<(), EvalError> {
        match collector {
            Collector::List { result, items } => {
                let value = self.eval_expr_async(*result).await?;
                items.push(value);
            }
            Collector::Set { result, items } => {
                let value = self.eval_expr_async(*result).await?;
                items.insert(value).map_err(|e| e.or_span(result.span))?;
            }
            Collector::Dict { result, items } => {
                let key = self.eval_expr_async(&result.key).await?;
                let value = self.eval_expr_async(&result.value).await?;
                items.insert(key, value).map_err(|e| e.or_span(result.span))?;
            }
        }
        Ok(())
    }
}

/// The value of `a if b` when `b` is false.
fn missing_else(span: Span) -> Value {
    Value::Undefined(format!("inline if-expression on line {}", span.line))
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::registry::ClosureFunction;
    use crate::runtime::AsyncSeq;

    fn eval_simple(source: &str) -> String {
        let template = parser::parse(source).expect("parse failed");
        let ctx = SimpleContext::new();
        let registry = Registry::with_builtins();
        evaluate(&template, &ctx, &registry).expect("eval failed")
    }

    fn eval_with_ctx(source: &str, ctx: &SimpleContext) -> String {
        let template = parser::parse(source).expect("parse failed");
        let registry = Registry::with_builtins();
        evaluate(&template, ctx, &registry).expect("eval failed")
    }

    fn eval_err(source: &str, ctx: &SimpleContext) -> EvalError {
        let template = parser::parse(source).expect("parse failed");
        let registry = Registry::with_builtins();
        evaluate(&template, ctx, &registry).expect_err("expected an error")
    }

    #[test]
    fn test_literal() {
        assert_eq!(eval_simple("Hello, world!"), "Hello, world!");
    }

    #[test]
    fn test_variable_substitution() {
        let ctx = SimpleContext::new().with("name", "Alice");
        assert_eq!(eval_with_ctx("Hello, {{ name }}!", &ctx), "Hello, Alice!");
    }

    #[test]
    fn test_collection_literals() {
        assert_eq!(eval_simple("{{ [1, 'a', none] }}"), "[1, 'a', None]");
        assert_eq!(eval_simple("{{ (1,) }}"), "(1,)");
        assert_eq!(eval_simple("{{ {1, 2, 1} }}"), "{1, 2}");
        assert_eq!(eval_simple("{{ {} }}"), "{}");
    }

    #[test]
    fn test_spreads_splice_in_position() {
        let ctx = SimpleContext::new()
            .with("xs", vec![2i64, 3])
            .with("extra", Value::dict_from_pairs([("b".into(), Value::Int(9))]));
        assert_eq!(eval_with_ctx("{{ [1, *xs, 4] }}", &ctx), "[1, 2, 3, 4]");
        assert_eq!(eval_with_ctx("{{ (*xs, *xs) }}", &ctx), "(2, 3, 2, 3)");
        assert_eq!(eval_with_ctx("{{ {*xs, 3, 1} }}", &ctx), "{2, 3, 1}");
        assert_eq!(
            eval_with_ctx("{{ {'a': 1, 'b': 2, **extra, 'c': 3} }}", &ctx),
            "{'a': 1, 'b': 9, 'c': 3}"
        );
    }

    #[test]
    fn test_spread_of_non_iterable_fails() {
        let ctx = SimpleContext::new().with("n", 5i64);
        let err = eval_err("{{ [*n] }}", &ctx);
        assert_eq!(err.kind, EvalErrorKind::NotIterable);
        let err = eval_err("{{ {**n} }}", &ctx);
        assert_eq!(err.message, "'int' object is not a mapping");
    }

    #[test]
    fn test_unhashable_set_member() {
        let err = eval_err("{{ {[1], 2} }}", &SimpleContext::new());
        assert_eq!(err.message, "unhashable type: 'list'");
    }

    #[test]
    fn test_comprehension_kinds() {
        let ctx = SimpleContext::new().with("xs", vec![1i64, 2, 3]);
        assert_eq!(eval_with_ctx("{{ [x * 2 for x in xs] }}", &ctx), "[2, 4, 6]");
        assert_eq!(eval_with_ctx("{{ {x % 2 for x in xs} }}", &ctx), "{1, 0}");
        assert_eq!(eval_with_ctx("{{ {x: x > 1 for x in xs} }}", &ctx), "{1: False, 2: True, 3: True}");
        assert_eq!(eval_with_ctx("{{ list(x for x in xs if x != 2) }}", &ctx), "[1, 3]");
    }

    #[test]
    fn test_clause_order_and_guards() {
        assert_eq!(
            eval_simple("{{ [(a, b) for a in [1, 2] for b in 'xy' if a == 1 or b == 'y'] }}"),
            "[(1, 'x'), (1, 'y'), (2, 'y')]"
        );
    }

    #[test]
    fn test_targets_do_not_leak() {
        let ctx = SimpleContext::new().with("x", "outer");
        assert_eq!(eval_with_ctx("{{ [x for x in [1, 2]] }} {{ x }}", &ctx), "[1, 2] outer");
    }

    #[test]
    fn test_inner_clause_sees_outer_binding() {
        assert_eq!(eval_simple("{{ [n for row in [[1], [2, 3]] for n in row] }}"), "[1, 2, 3]");
    }

    #[test]
    fn test_tuple_unpacking() {
        let ctx = SimpleContext::new().with("pairs", vec![vec![1i64, 2], vec![3, 4]]);
        assert_eq!(eval_with_ctx("{{ [b for a, b in pairs] }}", &ctx), "[2, 4]");
        let err = eval_err("{{ [a for a, b, c in pairs] }}", &ctx);
        assert_eq!(err.message, "not enough values to unpack (expected 3, got 2)");
    }

    #[test]
    fn test_generator_is_one_shot() {
        let registry = Registry::with_builtins();
        let ctx = SimpleContext::new();
        let expr = parser::parse_expr("(x for x in [1, 2])").unwrap();
        let value = eval_expr_value(&expr, &ctx, &registry).unwrap();
        let Value::Iterator(iter) = &value else {
            panic!("expected generator, got {value:?}");
        };
        assert_eq!(iter.drain().unwrap().len(), 2);
        assert!(iter.drain().unwrap().is_empty());
    }

    #[test]
    fn test_calls_with_keywords_and_spreads() {
        let ctx = SimpleContext::new()
            .with("args", vec![3i64, 1, 2])
            .with("opts", Value::dict_from_pairs([("reverse".into(), Value::Bool(true))]));
        assert_eq!(eval_with_ctx("{{ sorted(args, reverse=true) }}", &ctx), "[3, 2, 1]");
        assert_eq!(eval_with_ctx("{{ sorted(args, **opts) }}", &ctx), "[3, 2, 1]");
        assert_eq!(eval_with_ctx("{{ max(*args) }}", &ctx), "3");
    }

    #[test]
    fn test_method_calls() {
        let ctx = SimpleContext::new()
            .with("d", Value::dict_from_pairs([("a".into(), Value::Int(1))]));
        assert_eq!(eval_with_ctx("{{ [k ~ '=' ~ v for k, v in d.items()] }}", &ctx), "['a=1']");
        assert_eq!(eval_with_ctx("{{ ','.join(['x', 'y']) }}", &ctx), "x,y");
    }

    #[test]
    fn test_registry_function_in_comprehension() {
        let mut registry = Registry::new();
        registry.register(ClosureFunction::new("twice", |args| {
            let n = args.first().and_then(Value::as_int).unwrap_or(0);
            Ok(Value::Int(n * 2))
        }));
        let template = parser::parse("{{ [twice(n) for n in [1, 2]] }}").unwrap();
        let ctx = SimpleContext::new();
        assert_eq!(evaluate(&template, &ctx, &registry).unwrap(), "[2, 4]");
    }

    #[test]
    fn test_undefined_callable() {
        let err = eval_err("{{ nope(1) }}", &SimpleContext::new());
        assert_eq!(err.kind, EvalErrorKind::UndefinedCallable);
        assert!(err.span.is_some());
    }

    #[test]
    fn test_membership() {
        let ctx = SimpleContext::new().with("xs", vec!["a", "b"]);
        assert_eq!(eval_with_ctx("{{ 'a' in xs }} {{ 'c' not in xs }}", &ctx), "True True");
        assert_eq!(eval_with_ctx("{{ [x for x in 'abc' if x not in xs] }}", &ctx), "['c']");
    }

    #[test]
    fn test_inline_if_without_else_is_undefined() {
        assert_eq!(eval_simple("[{{ 1 if false }}]"), "[]");
    }

    #[test]
    fn test_division_by_zero_carries_span() {
        let err = eval_err("ab{{ 1 // 0 }}", &SimpleContext::new());
        assert_eq!(err.kind, EvalErrorKind::ArithmeticError);
        assert_eq!(err.span.map(|s| s.start), Some(5));
    }

    #[tokio::test]
    async fn test_async_path_matches_sync_output() {
        let template = parser::parse("{{ {k: [v * 2 for v in vs] for k, vs in data.items()} }}").unwrap();
        let ctx = SimpleContext::new().with(
            "data",
            Value::dict_from_pairs([("a".into(), vec![1i64, 2].into())]),
        );
        let registry = Registry::with_builtins();
        let sync = evaluate(&template, &ctx, &registry).unwrap();
        let opts = EvalOptions::new().enable_async(true);
        let async_out = evaluate_async(&template, &ctx, &registry, opts).await.unwrap();
        assert_eq!(sync, async_out);
        assert_eq!(async_out, "{'a': [2, 4]}");
    }

    #[tokio::test]
    async fn test_async_iterates_async_sequences() {
        let template = parser::parse("{{ [x + 1 for x in feed if x] }}|{{ 2 in other }}").unwrap();
        let ctx = SimpleContext::new()
            .with("feed", Value::AsyncSeq(AsyncSeq::from_values([0i64, 1, 2])))
            .with("other", Value::AsyncSeq(AsyncSeq::from_values([1i64, 2])));
        let registry = Registry::new();
        let opts = EvalOptions::new().enable_async(true);
        let out = evaluate_async(&template, &ctx, &registry, opts).await.unwrap();
        assert_eq!(out, "[2, 3]|True");
    }

    #[tokio::test]
    async fn test_async_generator_is_async_sequence() {
        let expr = parser::parse_expr("(x for x in [1, 2])").unwrap();
        let ctx = SimpleContext::new();
        let registry = Registry::new();
        let opts = EvalOptions::new().enable_async(true);
        let value = eval_expr_value_async(&expr, &ctx, &registry, opts).await.unwrap();
        assert!(matches!(value, Value::AsyncSeq(_)));
        assert_eq!(syncify(value).await.unwrap().repr(), "[1, 2]");
    }
}

// ── Resource limits and options tests ───────────────────────────────────

#[cfg(test)]
mod options_tests {
    use super::*;
    use crate::parser;
    use crate::runtime::AsyncSeq;

    fn run(source: &str, ctx: &SimpleContext, opts: EvalOptions) -> Result<String, EvalError> {
        let template = parser::parse(source).expect("parse failed");
        let registry = Registry::with_builtins();
        evaluate_with_options(&template, ctx, &registry, opts)
    }

    #[test]
    fn test_node_evaluation_limit() {
        let opts = EvalOptions::new().max_node_evaluations(3);
        let err = run("{{ [x for x in [1, 2, 3, 4, 5]] }}", &SimpleContext::new(), opts).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
        assert!(err.message.contains("node evaluations"));
    }

    #[test]
    fn test_node_evaluation_limit_sufficient() {
        let opts = EvalOptions::new().max_node_evaluations(100);
        assert_eq!(run("Hello, world!", &SimpleContext::new(), opts).unwrap(), "Hello, world!");
    }

    #[test]
    fn test_iteration_limit_counts_comprehension_elements() {
        let opts = EvalOptions::new().max_iterations(5);
        let err = run("{{ [x for x in range(10)] }}", &SimpleContext::new(), opts).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
        assert!(err.message.contains("iterations"));
    }

    #[test]
    fn test_iteration_limit_counts_spread_elements() {
        let ctx = SimpleContext::new().with("xs", vec![1i64, 2, 3, 4]);
        let opts = EvalOptions::new().max_iterations(3);
        let err = run("{{ [*xs] }}", &ctx, opts).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
    }

    #[test]
    fn test_iteration_limit_sufficient() {
        let opts = EvalOptions::new().max_iterations(100);
        assert_eq!(
            run("{{ [x for x in range(3)] }}", &SimpleContext::new(), opts).unwrap(),
            "[0, 1, 2]"
        );
    }

    #[test]
    fn test_cancellation() {
        let token = Arc::new(AtomicBool::new(true));
        let opts = EvalOptions::new().cancellation_token(token);
        let err = run("{{ 1 }}", &SimpleContext::new(), opts).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::Cancelled);
    }

    #[test]
    fn test_cancellation_not_triggered() {
        let token = Arc::new(AtomicBool::new(false));
        let opts = EvalOptions::new().cancellation_token(token);
        assert_eq!(run("Hello!", &SimpleContext::new(), opts).unwrap(), "Hello!");
    }

    #[test]
    fn test_lenient_undefined_renders_and_iterates_empty() {
        let out = run(
            "[{{ missing }}] {{ [x for x in missing] }} {{ missing.attr }}",
            &SimpleContext::new(),
            EvalOptions::new(),
        )
        .unwrap();
        assert_eq!(out, "[] [] ");
    }

    #[test]
    fn test_strict_undefined_errors_on_use() {
        let opts = || EvalOptions::new().undefined(UndefinedBehavior::Strict);
        let ctx = SimpleContext::new();
        for source in [
            "{{ missing }}",
            "{{ [x for x in missing] }}",
            "{{ [*missing] }}",
            "{{ 1 in missing }}",
            "{{ missing.attr }}",
        ] {
            let err = run(source, &ctx, opts()).unwrap_err();
            assert_eq!(err.kind, EvalErrorKind::UndefinedVariable, "{source}");
        }
        // truthiness is still allowed
        assert_eq!(run("{{ 1 if missing else 2 }}", &ctx, opts()).unwrap(), "2");
    }

    #[test]
    fn test_sync_render_drives_async_path() {
        let ctx = SimpleContext::new().with("feed", Value::AsyncSeq(AsyncSeq::from_values([1i64, 2])));
        let opts = EvalOptions::new().enable_async(true);
        assert_eq!(run("{{ [x for x in feed] }}", &ctx, opts).unwrap(), "[1, 2]");
    }

    #[tokio::test]
    async fn test_async_requires_enable_async() {
        let template = parser::parse("{{ 1 }}").unwrap();
        let ctx = SimpleContext::new();
        let registry = Registry::new();
        let err = evaluate_async(&template, &ctx, &registry, EvalOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::AsyncDisabled);
        assert_eq!(
            err.message,
            "the environment was not created with async mode enabled"
        );
    }

    #[test]
    fn test_error_chaining() {
        use std::error::Error;
        let io_err = std::io::Error::other("disk full");
        let err = EvalError::host_error("lookup failed").with_source(io_err);
        assert!(err.source().is_some());
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("disk full"));
    }
}
