//! Error types for parsing, constant folding and evaluation.
//!
//! [`ParseError`] is produced during template parsing and carries source
//! spans for diagnostic formatting. [`NotConstantError`] signals that a
//! subtree cannot be folded at compile time and must be evaluated instead.
//! [`EvalError`] is produced during evaluation and can originate from the
//! evaluator, the registry, or the host's
//! [`EvalContext`](crate::eval::EvalContext) implementation.

use crate::ast::span::Span;
use std::sync::Arc;
use thiserror::Error;

// ── Parse errors ────────────────────────────────────────────────────────

/// What stage of parsing rejected the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The source could not be split into tokens (unbalanced delimiters,
    /// unterminated strings, stray characters).
    Tokenize,
    /// The token stream does not match the grammar.
    Syntax,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
}

impl ParseError {
    pub fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            kind: ParseErrorKind::Syntax,
            span,
            message: message.into(),
            hint: None,
        }
    }

    pub fn tokenize(span: Span, message: impl Into<String>) -> Self {
        Self {
            kind: ParseErrorKind::Tokenize,
            ..Self::new(span, message)
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Line the error was reported on.
    pub fn lineno(&self) -> usize {
        self.span.line
    }

    /// Format the error with source context for display
    pub fn format_with_source(&self, source: &str, template_name: Option<&str>) -> String {
        let (line, col) = offset_to_line_col(source, self.span.start);
        let source_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");

        let location = if let Some(name) = template_name {
            format!(" --> {name}:{line}:{col}")
        } else {
            format!(" --> {line}:{col}")
        };

        let pointer = " ".repeat(col.saturating_sub(1))
            + &"^".repeat(self.span.end.saturating_sub(self.span.start).max(1));

        let mut output = format!(
            "Error: {}\n{location}\n  |\n{line:>3} | {source_line}\n    | {pointer}",
            self.message
        );

        if let Some(hint) = &self.hint {
            output.push_str(&format!("\n  = hint: {hint}"));
        }

        output
    }
}

fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

// ── Constant folding ────────────────────────────────────────────────────

/// Raised when constant folding reaches a node that needs a runtime
/// context: a name, a call, a comprehension, or an operation that would
/// fail. Callers recover by evaluating the node instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("expression cannot be evaluated at compile time")]
pub struct NotConstantError;

// ── Eval errors ─────────────────────────────────────────────────────────

/// An error that occurs during template evaluation.
///
/// Carries a structured [`EvalErrorKind`], a human-readable message,
/// an optional source [`Span`], and an optional underlying error cause.
///
/// # Error chaining
///
/// When a host's [`EvalContext`](crate::eval::EvalContext) or a
/// registered function catches an underlying error (database, I/O, etc.),
/// it can preserve the original error chain using
/// [`with_source`](EvalError::with_source):
///
/// ```rust
/// use weaver_comprehensions::EvalError;
///
/// fn example() -> Result<(), EvalError> {
///     let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
///     Err(EvalError::host_error("failed to load fixture").with_source(io_err))
/// }
/// ```
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub span: Option<Span>,
    pub message: String,
    /// The underlying error that caused this evaluation error, if any.
    ///
    /// Wrapped in `Arc` so that `EvalError` remains `Clone`.
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            span: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Attach a span only if the error does not carry one yet.
    pub fn or_span(self, span: Span) -> Self {
        if self.span.is_none() {
            self.with_span(span)
        } else {
            self
        }
    }

    /// Attach an underlying error cause to this evaluation error.
    ///
    /// The source is wrapped in an `Arc` so that `EvalError` remains
    /// `Clone`.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    // Convenience constructors for common error types

    pub fn undefined_variable(name: &str) -> Self {
        Self::new(
            EvalErrorKind::UndefinedVariable,
            format!("'{name}' is undefined"),
        )
    }

    pub fn undefined_callable(name: &str) -> Self {
        Self::new(
            EvalErrorKind::UndefinedCallable,
            format!("'{name}' is not callable"),
        )
    }

    pub fn type_error(expected: &str, got: &str) -> Self {
        Self::new(
            EvalErrorKind::TypeError,
            format!("expected {expected}, got {got}"),
        )
    }

    pub fn not_iterable(got: &str) -> Self {
        Self::new(
            EvalErrorKind::NotIterable,
            format!("'{got}' object is not iterable"),
        )
    }

    pub fn unhashable(got: &str) -> Self {
        Self::new(
            EvalErrorKind::TypeError,
            format!("unhashable type: '{got}'"),
        )
    }

    pub fn async_disabled() -> Self {
        Self::new(
            EvalErrorKind::AsyncDisabled,
            "the environment was not created with async mode enabled",
        )
    }

    pub fn host_error(message: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::HostError, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    UndefinedVariable,
    UndefinedCallable,
    TypeError,
    NotIterable,
    ArithmeticError,
    /// Missing dict key, out-of-range index, or unknown attribute.
    LookupError,
    HostError,
    RecursionLimit,
    /// The evaluation exceeded a configured resource limit (node count
    /// or iteration cap).
    ResourceLimit,
    /// The evaluation was cancelled via an external cancellation token.
    Cancelled,
    /// Asynchronous rendering was requested without enabling async mode.
    AsyncDisabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_with_source_points_at_token() {
        let source = "line one\n{{ [1, **x] }}";
        let err = ParseError::new(Span::new(15, 17, 2), "unexpected '**'")
            .with_hint("'**' is only valid inside a dict literal");
        let formatted = err.format_with_source(source, Some("page.txt"));
        assert!(formatted.contains("page.txt:2:7"));
        assert!(formatted.contains("^^"));
        assert!(formatted.contains("hint: '**' is only valid"));
    }

    #[test]
    fn test_or_span_keeps_existing() {
        let err = EvalError::host_error("boom")
            .with_span(Span::new(1, 2, 1))
            .or_span(Span::new(5, 6, 1));
        assert_eq!(err.span, Some(Span::new(1, 2, 1)));
    }

    #[test]
    fn test_error_chaining_preserves_source() {
        let io_err = std::io::Error::other("disk");
        let err = EvalError::host_error("wrapped").with_source(io_err);
        let cloned = err.clone();
        assert!(std::error::Error::source(&cloned).is_some());
    }
}
