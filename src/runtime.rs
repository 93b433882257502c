//! Asynchronous value handles and the helpers that normalize them.
//!
//! Under asynchronous rendering a value may be an [`Awaitable`] (a pending
//! result) or an [`AsyncSeq`] (a sequence whose elements arrive one at a
//! time). [`syncify`] turns either into a plain value so that code written
//! against synchronous values keeps working, and [`auto_aiter`] adapts
//! any iterable, synchronous or not, to a single stream interface.
//!
//! Both handles are one-shot: awaiting an awaitable twice or iterating an
//! async sequence twice behaves like the host language does (the second
//! await fails, the second iteration is empty).

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::trace;

use crate::ast::value::Value;
use crate::error::{EvalError, EvalErrorKind};
use crate::eval::ops;

pub type ValueFuture = BoxFuture<'static, Result<Value, EvalError>>;
pub type ValueStream = BoxStream<'static, Result<Value, EvalError>>;

// ── Awaitable ───────────────────────────────────────────────────────────

/// A pending value. Resolving it drives the wrapped future to completion.
#[derive(Clone)]
pub struct Awaitable(Arc<Mutex<Option<ValueFuture>>>);

impl Awaitable {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, EvalError>> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(Box::pin(future)))))
    }

    /// An awaitable that resolves immediately.
    pub fn ready(value: impl Into<Value>) -> Self {
        Self::new(futures::future::ready(Ok(value.into())))
    }

    fn take(&self) -> Option<ValueFuture> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Wait for the value. Fails if the awaitable was already resolved.
    pub async fn resolve(&self) -> Result<Value, EvalError> {
        match self.take() {
            Some(future) => future.await,
            None => Err(EvalError::new(
                EvalErrorKind::TypeError,
                "cannot reuse an already awaited awaitable",
            )),
        }
    }

    pub fn ptr_eq(&self, other: &Awaitable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Awaitable(..)")
    }
}

// ── AsyncSeq ────────────────────────────────────────────────────────────

/// An asynchronous sequence of values.
///
/// ```rust
/// use weaver_comprehensions::runtime::{AsyncSeq, syncify};
/// use weaver_comprehensions::Value;
///
/// let seq = AsyncSeq::from_values([1i64, 2, 3]);
/// let plain = futures::executor::block_on(syncify(Value::AsyncSeq(seq))).unwrap();
/// assert_eq!(plain.to_string(), "[1, 2, 3]");
/// ```
#[derive(Clone)]
pub struct AsyncSeq(Arc<Mutex<Option<ValueStream>>>);

impl AsyncSeq {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, EvalError>> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(stream.boxed()))))
    }

    pub fn from_values<T: Into<Value>>(values: impl IntoIterator<Item = T>) -> Self {
        let values: Vec<Result<Value, EvalError>> =
            values.into_iter().map(|v| Ok(v.into())).collect();
        Self::new(stream::iter(values))
    }

    /// Take the underlying stream. An exhausted sequence yields an empty one.
    pub fn take_stream(&self) -> ValueStream {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| stream::empty().boxed())
    }

    /// Pull every remaining element, suspending once per element.
    pub async fn collect(&self) -> Result<Vec<Value>, EvalError> {
        let mut stream = self.take_stream();
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    pub fn ptr_eq(&self, other: &AsyncSeq) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for AsyncSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncSeq(..)")
    }
}

// ── Normalization ───────────────────────────────────────────────────────

/// Resolve a possibly asynchronous value into a plain one.
///
/// - undefined values pass through untouched;
/// - async sequences are drained into a list;
/// - awaitables are awaited;
/// - anything else is returned as is.
///
/// Used for the right operand of `in` and for every output chunk when
/// rendering asynchronously.
pub async fn syncify(value: Value) -> Result<Value, EvalError> {
    match value {
        Value::Undefined(_) => {
            trace!("syncify: undefined passed through");
            Ok(value)
        }
        Value::AsyncSeq(seq) => {
            trace!("syncify: draining async sequence");
            Ok(Value::List(seq.collect().await?))
        }
        Value::Awaitable(awaitable) => {
            trace!("syncify: awaiting value");
            awaitable.resolve().await
        }
        other => Ok(other),
    }
}

/// Adapt any iterable to a stream of elements.
///
/// Async sequences and generators are pulled lazily; other synchronous
/// iterables are walked in order. Undefined iterates empty. Anything else
/// is not iterable.
pub fn auto_aiter(value: &Value) -> Result<ValueStream, EvalError> {
    match value {
        Value::AsyncSeq(seq) => Ok(seq.take_stream()),
        other => Ok(stream::iter(ops::elements(other)?).boxed()),
    }
}
