use indexmap::IndexMap;

use crate::ast::value::Value;
use crate::error::EvalError;

/// Trait implemented by the host application to provide template data to
/// the evaluator.
///
/// The evaluator asks the context for every free name it cannot resolve
/// from a comprehension binding. Comprehension targets are managed
/// internally and never reach the host.
///
/// Return `Ok(None)` for a name that does not exist. The evaluator then
/// tries the function registry and finally produces an undefined value
/// (see [`UndefinedBehavior`](crate::UndefinedBehavior)).
///
/// Asynchronous evaluation may hold the context across suspension points
/// of a `Send` future, hence the `Sync` bound.
pub trait EvalContext: Sync {
    fn resolve(&self, name: &str) -> Result<Option<Value>, EvalError>;
}

/// A minimal [`EvalContext`] backed by an in-memory map.
///
/// ```rust
/// use weaver_comprehensions::{SimpleContext, Value};
///
/// let mut ctx = SimpleContext::new();
/// ctx.set("users", vec!["ann", "bob"]);
/// ctx.set("limit", 10i64);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimpleContext {
    variables: IndexMap<String, Value>,
}

impl SimpleContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable. Accepts any type that implements `Into<Value>`.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.variables.insert(name.to_string(), value.into());
    }

    /// Builder form of [`SimpleContext::set`].
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }
}

impl EvalContext for SimpleContext {
    fn resolve(&self, name: &str) -> Result<Option<Value>, EvalError> {
        Ok(self.variables.get(name).cloned())
    }
}

impl<C: EvalContext + ?Sized> EvalContext for &C {
    fn resolve(&self, name: &str) -> Result<Option<Value>, EvalError> {
        (**self).resolve(name)
    }
}
