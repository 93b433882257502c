//! Abstract syntax tree types for the weaver expression language.
//!
//! The AST has two layers:
//!
//! - **Template layer** ([`template`]): raw text and `{{ ... }}` output
//!   blocks. A [`Template`] is a sequence of [`Node`]s whose string
//!   representations are concatenated.
//! - **Expression layer** ([`expr`]): literal collections, spreads,
//!   comprehensions and the operators around them. Expression results are
//!   coerced to strings only when they appear at the template level.
//!
//! Nodes own their children outright and are never mutated after parsing,
//! except by the constant folding pass in [`fold`], which replaces whole
//! output expressions with their folded value.

pub mod expr;
pub mod fold;
pub mod span;
pub mod template;
pub mod value;

// Convenience re-exports
pub use expr::*;
pub use fold::{ConstContext, optimize};
pub use span::{Span, Spanned};
pub use template::*;
pub use value::Value;
