use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};

use crate::error::EvalError;
use crate::registry::FunctionRef;
use crate::runtime::{AsyncSeq, Awaitable};

/// The set of runtime value types understood by the expression language.
///
/// Expressions produce `Value`s during evaluation and during constant
/// folding. The model mirrors the host expression language the
/// comprehension syntax is borrowed from: numbers compare across `Int`,
/// `Float` and `Bool`, sets and dicts remember insertion order, and
/// containers render with their literal syntax.
///
/// Conversion from common Rust types is provided via `From` impls:
///
/// ```rust
/// use weaver_comprehensions::Value;
///
/// let s: Value = "hello".into();
/// let n: Value = 42i64.into();
/// let b: Value = true.into();
/// let a: Value = vec![1i64, 2, 3].into();
/// assert_eq!(a.to_string(), "[1, 2, 3]");
/// ```
#[derive(Debug, Clone)]
pub enum Value {
    /// A name that could not be resolved. Carries the name for diagnostics.
    Undefined(String),
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(IndexSet<Value>),
    Dict(IndexMap<Value, Value>),
    /// One-shot sequence produced by a generator comprehension. Elements
    /// are computed as they are pulled; draining it leaves it empty.
    Iterator(ValueIter),
    Function(FunctionRef),
    Awaitable(Awaitable),
    AsyncSeq(AsyncSeq),
}

impl Value {
    /// Convert this value to its string representation for template output.
    ///
    /// Strings are returned verbatim, undefined renders empty, and
    /// everything else uses its literal representation (see [`Value::repr`]).
    pub fn to_output_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Undefined(_) => String::new(),
            other => other.repr(),
        }
    }

    /// Literal representation: `'a'`, `[1, 2]`, `(1,)`, `set()`, `{'k': 1}`.
    pub fn repr(&self) -> String {
        match self {
            Value::Undefined(_) => String::new(),
            Value::None => "None".to_string(),
            Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::String(s) => string_repr(s),
            Value::List(items) => format!("[{}]", join_repr(items.iter())),
            Value::Tuple(items) => {
                if items.len() == 1 {
                    format!("({},)", items[0].repr())
                } else {
                    format!("({})", join_repr(items.iter()))
                }
            }
            Value::Set(items) => {
                if items.is_empty() {
                    "set()".to_string()
                } else {
                    format!("{{{}}}", join_repr(items.iter()))
                }
            }
            Value::Dict(map) => {
                let pairs = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{pairs}}}")
            }
            Value::Iterator(_) => "<generator object>".to_string(),
            Value::Function(f) => format!("<function {}>", f.name()),
            Value::Awaitable(_) => "<awaitable object>".to_string(),
            Value::AsyncSeq(_) => "<async_generator object>".to_string(),
        }
    }

    /// Type name for diagnostic messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined(_) => "undefined",
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Iterator(_) => "generator",
            Value::Function(_) => "function",
            Value::Awaitable(_) => "awaitable",
            Value::AsyncSeq(_) => "async_generator",
        }
    }

    /// Truthiness check, used by `if` guards, `and`/`or` and `not`.
    ///
    /// Falsy values: undefined, `None`, `False`, zero, and empty strings
    /// or containers. Everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined(_) | Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Set(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            Value::Iterator(_) | Value::Function(_) | Value::Awaitable(_) | Value::AsyncSeq(_) => {
                true
            }
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined(_))
    }

    /// Whether this value may be a set member or dict key.
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::Undefined(_)
            | Value::None
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Function(_) => true,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of `Int` and `Bool` values.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Numeric view of `Int`, `Float` and `Bool` values.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Element view for values that iterate synchronously without
    /// consuming anything.
    ///
    /// Strings iterate by character, dicts by key. Returns `None` for
    /// generators (see [`ValueIter::drain`]) and for values that are not
    /// synchronously iterable.
    pub fn iter_values(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items.clone()),
            Value::Set(items) => Some(items.iter().cloned().collect()),
            Value::Dict(map) => Some(map.keys().cloned().collect()),
            Value::String(s) => Some(s.chars().map(|c| Value::String(c.to_string())).collect()),
            _ => None,
        }
    }

    /// Build a dict from ordered pairs. Later duplicates overwrite the
    /// value but keep the position of the first occurrence.
    pub fn dict_from_pairs(pairs: impl IntoIterator<Item = (Value, Value)>) -> Value {
        let mut map = IndexMap::new();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        Value::Dict(map)
    }

    pub fn set_from(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Set(items.into_iter().collect())
    }
}

fn join_repr<'a>(items: impl Iterator<Item = &'a Value>) -> String {
    items.map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn float_repr(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn string_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Undefined(_), Undefined(_)) => true,
            (None, None) => true,
            (String(a), String(b)) => a == b,
            (List(a), List(b)) | (Tuple(a), Tuple(b)) => a == b,
            (Set(a), Set(b)) => a.len() == b.len() && a.iter().all(|v| b.contains(v)),
            (Dict(a), Dict(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|o| o == v))
            }
            (Iterator(a), Iterator(b)) => a.ptr_eq(b),
            (Function(a), Function(b)) => a.ptr_eq(b),
            (Awaitable(a), Awaitable(b)) => a.ptr_eq(b),
            (AsyncSeq(a), AsyncSeq(b)) => a.ptr_eq(b),
            (Float(a), Float(b)) => a == b,
            (Float(f), n) | (n, Float(f)) => n.as_int().is_some_and(|i| int_eq_float(i, *f)),
            _ => match (self.as_int(), other.as_int()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

/// Exact comparison of an integer with a float, without rounding the
/// integer through `f64`.
fn int_eq_float(i: i64, f: f64) -> bool {
    integral_float(f) == Some(i)
}

/// The integer a float holds exactly, if it is integral and in `i64` range.
fn integral_float(f: f64) -> Option<i64> {
    // 2^63 is exactly representable; every float below it in magnitude
    // that has no fraction converts without loss.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Bool(_) | Value::Int(_) => {
                0u8.hash(state);
                self.as_int().unwrap_or_default().hash(state);
            }
            Value::Float(f) => match integral_float(*f) {
                Some(i) => {
                    0u8.hash(state);
                    i.hash(state);
                }
                None => {
                    1u8.hash(state);
                    f.to_bits().hash(state);
                }
            },
            Value::String(s) => {
                2u8.hash(state);
                s.hash(state);
            }
            Value::Tuple(items) => {
                3u8.hash(state);
                for item in items {
                    item.hash(state);
                }
            }
            Value::Function(f) => {
                4u8.hash(state);
                f.name().hash(state);
            }
            // Unhashable kinds are rejected before insertion; hashing by
            // discriminant keeps `Hash` consistent with `Eq` regardless.
            other => std::mem::discriminant(other).hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_output_string())
    }
}

/// Elements pulled one at a time. Pulling may fail, since generator
/// elements are computed on demand.
pub type ElementSource = Box<dyn Iterator<Item = Result<Value, EvalError>> + Send>;

/// Shared, one-shot element source behind [`Value::Iterator`].
///
/// Clones share the source: whoever pulls first consumes it.
#[derive(Clone)]
pub struct ValueIter(Arc<Mutex<Option<ElementSource>>>);

impl ValueIter {
    /// An iterator over already computed elements.
    pub fn new(items: Vec<Value>) -> Self {
        Self::lazy(items.into_iter().map(Ok))
    }

    /// An iterator that computes each element when it is pulled.
    pub fn lazy<I>(source: I) -> Self
    where
        I: Iterator<Item = Result<Value, EvalError>> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(Box::new(source)))))
    }

    /// Take the remaining source. An exhausted iterator yields an empty one.
    pub fn take_source(&self) -> ElementSource {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| Box::new(std::iter::empty()))
    }

    /// Pull every remaining element, leaving the iterator exhausted.
    pub fn drain(&self) -> Result<Vec<Value>, EvalError> {
        self.take_source().collect()
    }

    pub fn ptr_eq(&self, other: &ValueIter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ValueIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueIter(..)")
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_cross_equality() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Int(1), Value::String("1".into()));
    }

    #[test]
    fn test_large_numbers_compare_exactly() {
        let above = Value::Int((1 << 53) + 1);
        let rounded = Value::Float((1u64 << 53) as f64);
        assert_ne!(above, rounded);
        assert_eq!(Value::Int(1 << 53), rounded);
        assert_ne!(Value::Int(i64::MAX), Value::Float(9_223_372_036_854_775_808.0));

        let set = Value::set_from([above, rounded]);
        assert_eq!(set.repr(), "{9007199254740993, 9007199254740992.0}");

        let big = Value::set_from([Value::Int(1 << 60), Value::Float((1u64 << 60) as f64)]);
        match big {
            Value::Set(items) => assert_eq!(items.len(), 1),
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[test]
    fn test_set_dedupes_across_numeric_kinds() {
        let set = Value::set_from([Value::Int(1), Value::Float(1.0), Value::Bool(true)]);
        match set {
            Value::Set(items) => assert_eq!(items.len(), 1),
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[test]
    fn test_dict_later_key_overwrites_in_place() {
        let dict = Value::dict_from_pairs([
            (Value::from("a"), Value::Int(1)),
            (Value::from("b"), Value::Int(2)),
            (Value::from("a"), Value::Int(3)),
        ]);
        assert_eq!(dict.repr(), "{'a': 3, 'b': 2}");
    }

    #[test]
    fn test_container_reprs() {
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(Value::Tuple(vec![]).repr(), "()");
        assert_eq!(Value::set_from([]).repr(), "set()");
        assert_eq!(Value::dict_from_pairs([]).repr(), "{}");
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::from("it's").repr(), "\"it's\"");
        assert_eq!(
            Value::List(vec![Value::from("a"), Value::None, Value::Bool(false)]).repr(),
            "['a', None, False]"
        );
    }

    #[test]
    fn test_set_equality_ignores_order() {
        let a = Value::set_from([Value::Int(1), Value::Int(2)]);
        let b = Value::set_from([Value::Int(2), Value::Int(1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_iterator_is_one_shot() {
        let iter = ValueIter::new(vec![Value::Int(1), Value::Int(2)]);
        let shared = iter.clone();
        assert_eq!(iter.drain().unwrap().len(), 2);
        assert!(shared.drain().unwrap().is_empty());
        assert!(Value::Iterator(iter).iter_values().is_none());
    }

    #[test]
    fn test_lazy_iterator_pulls_on_demand() {
        let pulled = Arc::new(Mutex::new(0));
        let counter = pulled.clone();
        let iter = ValueIter::lazy((1..=3).map(move |n| {
            *counter.lock().unwrap() += 1;
            Ok(Value::Int(n))
        }));
        assert_eq!(*pulled.lock().unwrap(), 0);
        let mut source = iter.take_source();
        assert_eq!(source.next().unwrap().unwrap(), Value::Int(1));
        assert_eq!(*pulled.lock().unwrap(), 1);
    }

    #[test]
    fn test_hashability() {
        assert!(Value::Tuple(vec![Value::Int(1), Value::from("a")]).is_hashable());
        assert!(!Value::Tuple(vec![Value::List(vec![])]).is_hashable());
        assert!(!Value::List(vec![]).is_hashable());
    }
}
