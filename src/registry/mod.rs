//! Callable globals for templates.
//!
//! The [`Registry`] stores functions that expressions can call by name,
//! such as `range(3)` or `sorted(items, reverse=true)`. The host populates
//! it before evaluation, usually starting from [`Registry::with_builtins`].
//!
//! There are three ways to register callables:
//!
//! - **Closure-based**: [`ClosureFunction`] wraps a plain closure over the
//!   positional arguments.
//! - **Async closure-based**: [`AsyncClosureFunction`] wraps a closure that
//!   returns a future. Calling it yields an awaitable, which asynchronous
//!   rendering awaits automatically.
//! - **Trait-based**: implement [`TemplateFunction`] directly for keyword
//!   arguments, custom async behavior, or signature metadata. The
//!   `#[weaver_function]` macro in the `weaver_macros` crate generates such
//!   implementations from a typed Rust function.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::ast::value::Value;
use crate::error::{EvalError, EvalErrorKind};
use crate::runtime::Awaitable;

pub mod builtins;

/// Keyword arguments in call order.
pub type Kwargs = IndexMap<String, Value>;

// ── Trait definitions ───────────────────────────────────────────────────

/// A function callable from template expressions.
pub trait TemplateFunction: Send + Sync {
    /// Execute the function with pre-evaluated arguments.
    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError>;

    /// Execute the function during asynchronous rendering.
    ///
    /// Defaults to [`call`](TemplateFunction::call). Override this when the
    /// function needs to await something, or to normalize asynchronous
    /// arguments before use.
    fn call_async(&self, args: Vec<Value>, kwargs: Kwargs) -> BoxFuture<'_, Result<Value, EvalError>> {
        Box::pin(async move { self.call(args, kwargs) })
    }

    /// Declare this function's identity and parameter expectations.
    fn signature(&self) -> FunctionSignature;
}

// ── Signatures ──────────────────────────────────────────────────────────

/// Describes a function's name and expected parameters.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<ParamDef>,
}

impl FunctionSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }
}

/// A parameter definition. Parameters bind positionally first and by
/// keyword otherwise.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub expected_type: Option<ValueType>,
    pub required: bool,
}

/// Type tag describing a parameter in a [`FunctionSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Int,
    /// Accepts `int` and `float`.
    Number,
    Bool,
    List,
    Dict,
    /// Accepts any value type.
    Any,
}

/// Fail if any keyword argument was passed to a positional-only function.
pub fn reject_kwargs(name: &str, kwargs: &Kwargs) -> Result<(), EvalError> {
    match kwargs.keys().next() {
        Some(key) => Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!("{name}() got an unexpected keyword argument '{key}'"),
        )),
        None => Ok(()),
    }
}

// ── Function handles ────────────────────────────────────────────────────

/// Shared handle to a registered function. This is what [`Value::Function`]
/// carries when a function name is used as a value.
#[derive(Clone)]
pub struct FunctionRef {
    name: Arc<str>,
    func: Arc<dyn TemplateFunction>,
}

impl FunctionRef {
    pub fn new(func: impl TemplateFunction + 'static) -> Self {
        let name = func.signature().name;
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
        self.func.call(args, kwargs)
    }

    pub fn call_async(&self, args: Vec<Value>, kwargs: Kwargs) -> BoxFuture<'_, Result<Value, EvalError>> {
        self.func.call_async(args, kwargs)
    }

    pub fn signature(&self) -> FunctionSignature {
        self.func.signature()
    }

    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionRef({})", self.name)
    }
}

// ── Registry ────────────────────────────────────────────────────────────

/// Stores registered functions for use during evaluation.
///
/// The host creates and populates a `Registry`, then passes it to the
/// evaluator. Functions are keyed by their signature name.
///
/// ```rust
/// use weaver_comprehensions::{Registry, ClosureFunction, Value};
///
/// let mut registry = Registry::with_builtins();
///
/// registry.register(ClosureFunction::new("double", |args| {
///     let n = args.first().and_then(Value::as_int).unwrap_or(0);
///     Ok(Value::Int(n * 2))
/// }));
/// assert!(registry.get("double").is_some());
/// assert!(registry.get("range").is_some());
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<String, FunctionRef>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with `range`, `list`, `tuple`, `set`, `dict`,
    /// `min`, `max`, `enumerate`, `len`, `sorted`, `sum` and `str`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::install(&mut registry);
        registry
    }

    /// Register a function. If a function with the same name already
    /// exists, it is replaced.
    pub fn register(&mut self, func: impl TemplateFunction + 'static) {
        let func = FunctionRef::new(func);
        self.functions.insert(func.name().to_string(), func);
    }

    pub fn get(&self, name: &str) -> Option<FunctionRef> {
        self.functions.get(name).cloned()
    }

    /// Dispatch a call by name. Returns [`EvalError`] if the function is
    /// not registered.
    pub fn call(&self, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
        match self.functions.get(name) {
            Some(func) => func.call(args, kwargs),
            None => Err(EvalError::undefined_callable(name)),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("functions", &names).finish()
    }
}

// ── Closure-based convenience wrappers ──────────────────────────────────

/// A [`TemplateFunction`] implementation backed by a closure over the
/// positional arguments. Keyword arguments are rejected.
///
/// ```rust
/// use weaver_comprehensions::{ClosureFunction, Value};
///
/// let greet = ClosureFunction::new("greet", |args| {
///     let name = args.first().and_then(Value::as_str).unwrap_or("world");
///     Ok(Value::String(format!("Hello, {name}!")))
/// });
/// ```
pub struct ClosureFunction<F>
where
    F: Fn(Vec<Value>) -> Result<Value, EvalError> + Send + Sync,
{
    sig: FunctionSignature,
    func: F,
}

impl<F> ClosureFunction<F>
where
    F: Fn(Vec<Value>) -> Result<Value, EvalError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            sig: FunctionSignature::new(name),
            func,
        }
    }
}

impl<F> TemplateFunction for ClosureFunction<F>
where
    F: Fn(Vec<Value>) -> Result<Value, EvalError> + Send + Sync,
{
    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
        reject_kwargs(&self.sig.name, &kwargs)?;
        (self.func)(args)
    }

    fn signature(&self) -> FunctionSignature {
        self.sig.clone()
    }
}

/// A [`TemplateFunction`] backed by a closure returning a future.
///
/// A synchronous call produces a [`Value::Awaitable`]; asynchronous
/// rendering awaits the future in place.
///
/// ```rust
/// use weaver_comprehensions::{AsyncClosureFunction, Value};
///
/// let fetch = AsyncClosureFunction::new("fetch_scores", |_args| async {
///     Ok(Value::from(vec![3i64, 5, 8]))
/// });
/// ```
pub struct AsyncClosureFunction<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, EvalError>> + Send + 'static,
{
    sig: FunctionSignature,
    func: F,
}

impl<F, Fut> AsyncClosureFunction<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, EvalError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            sig: FunctionSignature::new(name),
            func,
        }
    }
}

impl<F, Fut> TemplateFunction for AsyncClosureFunction<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, EvalError>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
        reject_kwargs(&self.sig.name, &kwargs)?;
        Ok(Value::Awaitable(Awaitable::new((self.func)(args))))
    }

    fn call_async(&self, args: Vec<Value>, kwargs: Kwargs) -> BoxFuture<'_, Result<Value, EvalError>> {
        Box::pin(async move {
            reject_kwargs(&self.sig.name, &kwargs)?;
            (self.func)(args).await
        })
    }

    fn signature(&self) -> FunctionSignature {
        self.sig.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_closure_rejects_keywords() {
        let func = ClosureFunction::new("echo", |args| Ok(Value::List(args)));
        let mut kwargs = Kwargs::new();
        kwargs.insert("sep".into(), Value::from(","));
        let err = func.call(vec![], kwargs).unwrap_err();
        assert_eq!(err.message, "echo() got an unexpected keyword argument 'sep'");
    }

    #[test]
    fn test_async_closure_sync_call_yields_awaitable() {
        let func = AsyncClosureFunction::new("later", |_| async { Ok(Value::Int(4)) });
        let value = func.call(vec![], Kwargs::new()).unwrap();
        let Value::Awaitable(awaitable) = value else {
            panic!("expected awaitable, got {value:?}");
        };
        assert_eq!(block_on(awaitable.resolve()).unwrap(), Value::Int(4));
        assert_eq!(
            block_on(func.call_async(vec![], Kwargs::new())).unwrap(),
            Value::Int(4)
        );
    }

    #[test]
    fn test_registry_dispatch_and_missing() {
        let mut registry = Registry::new();
        registry.register(ClosureFunction::new("one", |_| Ok(Value::Int(1))));
        assert_eq!(registry.call("one", vec![], Kwargs::new()).unwrap(), Value::Int(1));
        let err = registry.call("two", vec![], Kwargs::new()).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::UndefinedCallable);
    }

    #[test]
    fn test_function_ref_identity() {
        let mut registry = Registry::new();
        registry.register(ClosureFunction::new("f", |_| Ok(Value::None)));
        let a = Value::Function(registry.get("f").unwrap());
        let b = Value::Function(registry.get("f").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.repr(), "<function f>");
    }
}
