//! # weaver-comprehensions
//!
//! Collection literals, spreads and comprehensions for a Jinja-style
//! template expression language.
//!
//! Templates are raw text with `{{ expression }}` output blocks. On top of
//! the usual operators, expressions support:
//!
//! - list, tuple, set and dict literals with `*iterable` and `**mapping`
//!   spreads: `[1, *rest]`, `{**defaults, 'debug': true}`;
//! - list, set and dict comprehensions and generator expressions with any
//!   number of `for ... in ... [if ...]` clauses;
//! - the generator shorthand for a sole call argument: `sum(x for x in xs)`.
//!
//! Templates can be rendered directly by the tree-walking evaluator, either
//! synchronously or asynchronously (with async sequences and awaitables as
//! data sources), or lowered to Python source with [`CodeGenerator`].
//!
//! ## Quick start
//!
//! ```rust
//! use weaver_comprehensions::{render, SimpleContext, Registry};
//!
//! let mut ctx = SimpleContext::new();
//! ctx.set("rows", vec![vec![0i64, 1], vec![2, 3]]);
//!
//! let registry = Registry::with_builtins();
//! let output = render("{{ [n for row in rows for n in row if n] }}", &ctx, &registry).unwrap();
//! assert_eq!(output, "[1, 2, 3]");
//! ```
//!
//! ## Compiled templates
//!
//! For repeated evaluation, parse and fold once with
//! [`CompiledTemplate::compile`] and render against different contexts:
//!
//! ```rust
//! use weaver_comprehensions::{CompiledTemplate, SimpleContext, Registry};
//!
//! let template = CompiledTemplate::compile("{{ {**base, 'user': name} }}").unwrap();
//! let registry = Registry::new();
//!
//! let mut ctx = SimpleContext::new();
//! ctx.set("base", weaver_comprehensions::Value::dict_from_pairs([("user".into(), "?".into())]));
//! ctx.set("name", "ann");
//! assert_eq!(template.render(&ctx, &registry).unwrap(), "{'user': 'ann'}");
//! ```
//!
//! ## Asynchronous rendering
//!
//! ```rust
//! use weaver_comprehensions::{render_async, EvalOptions, SimpleContext, Registry, Value};
//! use weaver_comprehensions::runtime::AsyncSeq;
//!
//! let mut ctx = SimpleContext::new();
//! ctx.set("feed", Value::AsyncSeq(AsyncSeq::from_values([1i64, 2, 3])));
//!
//! let registry = Registry::with_builtins();
//! let opts = EvalOptions::new().enable_async(true);
//! let output = futures::executor::block_on(render_async(
//!     "{{ [x * 10 for x in feed if x != 2] }}",
//!     &ctx,
//!     &registry,
//!     opts,
//! ))
//! .unwrap();
//! assert_eq!(output, "[10, 30]");
//! ```

use thiserror::Error;
use tracing::debug;

pub mod ast;
pub mod codegen;
pub mod error;
pub mod eval;
mod parser;
pub mod registry;
pub mod runtime;

pub use ast::expr::{Expr, ExprKind};
pub use ast::fold::{ConstContext, optimize};
pub use ast::span::{Span, Spanned};
pub use ast::template::Template;
pub use ast::value::Value;
pub use codegen::CodeGenerator;
pub use error::{EvalError, EvalErrorKind, NotConstantError, ParseError, ParseErrorKind};
pub use eval::{
    EvalContext, EvalOptions, SimpleContext, UndefinedBehavior, eval_expr_value,
    eval_expr_value_async, evaluate, evaluate_async, evaluate_with_options,
};
pub use parser::{parse, parse_expr};
pub use registry::{
    AsyncClosureFunction, ClosureFunction, FunctionSignature, Kwargs, Registry, TemplateFunction,
};

/// Parse source text and evaluate it in a single step.
///
/// For repeated evaluation of the same source, prefer [`CompiledTemplate`]
/// to avoid re-parsing.
pub fn render(
    source: &str,
    ctx: &impl EvalContext,
    registry: &Registry,
) -> Result<String, RenderError> {
    let template = parser::parse(source)?;
    Ok(evaluate(&template, ctx, registry)?)
}

/// Parse source text and evaluate it with custom options.
///
/// Combines parsing and [`evaluate_with_options`] in a single step.
pub fn render_with_options(
    source: &str,
    ctx: &impl EvalContext,
    registry: &Registry,
    options: EvalOptions,
) -> Result<String, RenderError> {
    let template = parser::parse(source)?;
    Ok(evaluate_with_options(&template, ctx, registry, options)?)
}

/// Parse source text and evaluate it on the asynchronous path.
pub async fn render_async(
    source: &str,
    ctx: &impl EvalContext,
    registry: &Registry,
    options: EvalOptions,
) -> Result<String, RenderError> {
    let template = parser::parse(source)?;
    Ok(evaluate_async(&template, ctx, registry, options).await?)
}

/// Combined error type returned by the `render*` functions.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Eval(#[from] EvalError),
}

/// A parsed and constant-folded template that can be rendered multiple
/// times without re-parsing.
///
/// ```rust
/// use weaver_comprehensions::{CompiledTemplate, SimpleContext, Registry};
///
/// let template = CompiledTemplate::compile("{{ [1, *(2, 3)] }} {{ [x for x in xs] }}").unwrap();
/// let registry = Registry::new();
///
/// let mut ctx = SimpleContext::new();
/// ctx.set("xs", vec!["a"]);
/// assert_eq!(template.render(&ctx, &registry).unwrap(), "[1, 2, 3] ['a']");
///
/// let source = template.generate_source(false);
/// assert!(source.contains("yield str([1, 2, 3])"));
/// ```
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    template: Template,
}

impl CompiledTemplate {
    /// Parse source text and fold every constant output expression.
    pub fn compile(source: &str) -> Result<Self, ParseError> {
        Self::compile_with(source, &ConstContext::default())
    }

    /// Parse source text, folding with the given settings.
    pub fn compile_with(source: &str, ctx: &ConstContext) -> Result<Self, ParseError> {
        let mut template = parser::parse(source)?;
        let folded = optimize(&mut template, ctx);
        debug!(
            nodes = template.nodes.len(),
            expressions = template.expressions().count(),
            folded,
            "compiled template"
        );
        Ok(Self { template })
    }

    pub fn render(&self, ctx: &impl EvalContext, registry: &Registry) -> Result<String, EvalError> {
        evaluate(&self.template, ctx, registry)
    }

    /// Render with custom options.
    pub fn render_with_options(
        &self,
        ctx: &impl EvalContext,
        registry: &Registry,
        options: EvalOptions,
    ) -> Result<String, EvalError> {
        evaluate_with_options(&self.template, ctx, registry, options)
    }

    pub async fn render_async(
        &self,
        ctx: &impl EvalContext,
        registry: &Registry,
        options: EvalOptions,
    ) -> Result<String, EvalError> {
        evaluate_async(&self.template, ctx, registry, options).await
    }

    /// Lower this template to Python source.
    pub fn generate_source(&self, is_async: bool) -> String {
        CodeGenerator::new(is_async).generate(&self.template)
    }

    /// Access the underlying AST for inspection or analysis.
    pub fn ast(&self) -> &Template {
        &self.template
    }
}

/// A parsed expression that can be evaluated multiple times without
/// re-parsing.
///
/// This is the expression-level counterpart to [`CompiledTemplate`].
///
/// ```rust
/// use weaver_comprehensions::{CompiledExpr, SimpleContext, Registry, Value};
///
/// let expr = CompiledExpr::compile("{k for k in flags if k != 'off'}").unwrap();
/// let registry = Registry::new();
///
/// let mut ctx = SimpleContext::new();
/// ctx.set("flags", vec!["on", "off", "on"]);
/// assert_eq!(expr.evaluate(&ctx, &registry).unwrap().to_string(), "{'on'}");
/// ```
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    expr: Expr,
}

impl CompiledExpr {
    pub fn compile(source: &str) -> Result<Self, ParseError> {
        let expr = parse_expr(source)?;
        Ok(Self { expr })
    }

    pub fn evaluate(&self, ctx: &impl EvalContext, registry: &Registry) -> Result<Value, EvalError> {
        eval_expr_value(&self.expr, ctx, registry)
    }

    /// Fold this expression without a runtime context.
    pub fn as_const(&self, ctx: &ConstContext) -> Result<Value, NotConstantError> {
        self.expr.as_const(ctx)
    }

    /// Access the underlying AST for inspection.
    pub fn ast(&self) -> &Expr {
        &self.expr
    }
}
