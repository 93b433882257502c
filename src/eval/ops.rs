//! Pure operator semantics shared by the evaluator and constant folding.
//!
//! Nothing here touches a context, a registry or the scope stack. Every
//! function takes fully evaluated operands, so folding a literal subtree
//! and evaluating it at render time go through exactly the same code.

use indexmap::{IndexMap, IndexSet};

use crate::ast::expr::{BinOp, CmpOp, ExprKind, ScalarItem, UnaryOp};
use crate::ast::span::Spanned;
use crate::ast::value::{ElementSource, Value};
use crate::error::{EvalError, EvalErrorKind};

// ── Arithmetic ──────────────────────────────────────────────────────────

/// Longest string (in bytes) or sequence that `*` repetition or `range`
/// may build.
pub const MAX_SEQUENCE_LEN: usize = 1 << 20;

enum Num {
    Int(i64, i64),
    Float(f64, f64),
}

fn numbers(left: &Value, right: &Value) -> Option<Num> {
    if let (Some(l), Some(r)) = (left.as_int(), right.as_int()) {
        return Some(Num::Int(l, r));
    }
    match (left.as_float(), right.as_float()) {
        (Some(l), Some(r)) => Some(Num::Float(l, r)),
        _ => None,
    }
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> EvalError {
    EvalError::new(
        EvalErrorKind::TypeError,
        format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ),
    )
}

fn overflow() -> EvalError {
    EvalError::new(EvalErrorKind::ArithmeticError, "integer overflow")
}

fn division_by_zero() -> EvalError {
    EvalError::new(EvalErrorKind::ArithmeticError, "division by zero")
}

fn zero_to_negative_power() -> EvalError {
    EvalError::new(
        EvalErrorKind::ArithmeticError,
        "0.0 cannot be raised to a negative power",
    )
}

fn undefined_operand(value: &Value) -> Option<EvalError> {
    match value {
        Value::Undefined(name) => Some(EvalError::undefined_variable(name)),
        _ => None,
    }
}

/// Apply a binary operator to two evaluated operands.
///
/// `and`/`or` return one of their operands, like the host language does.
/// Callers that need short-circuiting handle those two before evaluating
/// the right side.
pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinOp::And => {
            return Ok(if left.is_truthy() { right } else { left }.clone());
        }
        BinOp::Or => {
            return Ok(if left.is_truthy() { left } else { right }.clone());
        }
        BinOp::Concat => {
            return Ok(Value::String(format!(
                "{}{}",
                left.to_output_string(),
                right.to_output_string()
            )));
        }
        _ => {}
    }

    if let Some(err) = undefined_operand(left).or_else(|| undefined_operand(right)) {
        return Err(err);
    }

    match op {
        BinOp::Add => add(left, right),
        BinOp::Sub => match numbers(left, right) {
            Some(Num::Int(l, r)) => l.checked_sub(r).map(Value::Int).ok_or_else(overflow),
            Some(Num::Float(l, r)) => Ok(Value::Float(l - r)),
            None => Err(unsupported(op, left, right)),
        },
        BinOp::Mul => mul(left, right),
        BinOp::Div => match numbers(left, right) {
            Some(Num::Int(_, 0)) => Err(division_by_zero()),
            Some(Num::Int(l, r)) => Ok(Value::Float(l as f64 / r as f64)),
            Some(Num::Float(_, r)) if r == 0.0 => Err(division_by_zero()),
            Some(Num::Float(l, r)) => Ok(Value::Float(l / r)),
            None => Err(unsupported(op, left, right)),
        },
        BinOp::FloorDiv => match numbers(left, right) {
            Some(Num::Int(_, 0)) => Err(division_by_zero()),
            Some(Num::Int(l, r)) => floor_div(l, r).map(Value::Int).ok_or_else(overflow),
            Some(Num::Float(_, r)) if r == 0.0 => Err(division_by_zero()),
            Some(Num::Float(l, r)) => Ok(Value::Float((l / r).floor())),
            None => Err(unsupported(op, left, right)),
        },
        BinOp::Mod => {
            if let Value::String(fmt) = left {
                return format_percent(fmt, right).map(Value::String);
            }
            match numbers(left, right) {
                Some(Num::Int(_, 0)) => Err(division_by_zero()),
                Some(Num::Int(l, r)) => {
                    let m = l.checked_rem(r).ok_or_else(overflow)?;
                    Ok(Value::Int(if m != 0 && (m < 0) != (r < 0) { m + r } else { m }))
                }
                Some(Num::Float(_, r)) if r == 0.0 => Err(division_by_zero()),
                Some(Num::Float(l, r)) => Ok(Value::Float(l - r * (l / r).floor())),
                None => Err(unsupported(op, left, right)),
            }
        }
        BinOp::Pow => match numbers(left, right) {
            Some(Num::Int(0, r)) if r < 0 => Err(zero_to_negative_power()),
            Some(Num::Float(l, r)) if l == 0.0 && r < 0.0 => Err(zero_to_negative_power()),
            Some(Num::Int(l, r)) if r >= 0 => u32::try_from(r)
                .ok()
                .and_then(|exp| l.checked_pow(exp))
                .map(Value::Int)
                .ok_or_else(overflow),
            Some(Num::Int(l, r)) => Ok(Value::Float((l as f64).powf(r as f64))),
            Some(Num::Float(l, r)) => Ok(Value::Float(l.powf(r))),
            None => Err(unsupported(op, left, right)),
        },
        BinOp::And | BinOp::Or | BinOp::Concat => Err(unsupported(op, left, right)),
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => Ok(Value::List(a.iter().chain(b).cloned().collect())),
        (Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::Tuple(a.iter().chain(b).cloned().collect()))
        }
        _ => match numbers(left, right) {
            Some(Num::Int(l, r)) => l.checked_add(r).map(Value::Int).ok_or_else(overflow),
            Some(Num::Float(l, r)) => Ok(Value::Float(l + r)),
            None => Err(unsupported(BinOp::Add, left, right)),
        },
    }
}

fn mul(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::String(s), Value::Int(n)) | (Value::Int(n), Value::String(s)) => {
            Ok(Value::String(s.repeat(repeat_count(s.len(), *n)?)))
        }
        (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
            Ok(Value::List(repeat_items(items, repeat_count(items.len(), *n)?)))
        }
        (Value::Tuple(items), Value::Int(n)) | (Value::Int(n), Value::Tuple(items)) => {
            Ok(Value::Tuple(repeat_items(items, repeat_count(items.len(), *n)?)))
        }
        _ => match numbers(left, right) {
            Some(Num::Int(l, r)) => l.checked_mul(r).map(Value::Int).ok_or_else(overflow),
            Some(Num::Float(l, r)) => Ok(Value::Float(l * r)),
            None => Err(unsupported(BinOp::Mul, left, right)),
        },
    }
}

/// Number of copies for `sequence * count`. Negative counts repeat zero
/// times; results longer than [`MAX_SEQUENCE_LEN`] are refused before any
/// allocation.
fn repeat_count(len: usize, count: i64) -> Result<usize, EvalError> {
    let times = usize::try_from(count).unwrap_or(0);
    if len == 0 {
        return Ok(0);
    }
    match len.checked_mul(times) {
        Some(total) if total <= MAX_SEQUENCE_LEN => Ok(times),
        _ => Err(EvalError::new(
            EvalErrorKind::ResourceLimit,
            format!("repeated sequence would exceed {MAX_SEQUENCE_LEN} items"),
        )),
    }
}

fn repeat_items(items: &[Value], times: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    out
}

fn floor_div(l: i64, r: i64) -> Option<i64> {
    let q = l.checked_div(r)?;
    if l % r != 0 && ((l < 0) != (r < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// printf-style `%` formatting with `%s`, `%d`, `%r` and `%%`.
pub fn format_percent(fmt: &str, args: &Value) -> Result<String, EvalError> {
    let args: Vec<Value> = match args {
        Value::Tuple(items) => items.clone(),
        other => vec![other.clone()],
    };
    let mut args = args.into_iter();
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let spec = chars.next().ok_or_else(|| {
            EvalError::new(EvalErrorKind::TypeError, "incomplete format")
        })?;
        if spec == '%' {
            out.push('%');
            continue;
        }
        let arg = args.next().ok_or_else(|| {
            EvalError::new(
                EvalErrorKind::TypeError,
                "not enough arguments for format string",
            )
        })?;
        match spec {
            's' => out.push_str(&arg.to_output_string()),
            'r' => out.push_str(&arg.repr()),
            'd' => match (&arg, arg.as_int(), arg.as_float()) {
                (_, Some(n), _) => out.push_str(&n.to_string()),
                (Value::Float(_), _, Some(f)) => out.push_str(&(f.trunc() as i64).to_string()),
                _ => {
                    return Err(EvalError::type_error("a number for %d", arg.type_name()));
                }
            },
            other => {
                return Err(EvalError::new(
                    EvalErrorKind::TypeError,
                    format!("unsupported format character '{other}'"),
                ));
            }
        }
    }

    if args.next().is_some() {
        return Err(EvalError::new(
            EvalErrorKind::TypeError,
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

pub fn unary(op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
    if op == UnaryOp::Not {
        return Ok(Value::Bool(!value.is_truthy()));
    }
    if let Some(err) = undefined_operand(value) {
        return Err(err);
    }
    match (op, value) {
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, v) => v
            .as_int()
            .ok_or_else(|| bad_unary("-", v))?
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(overflow),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, v) => v.as_int().map(Value::Int).ok_or_else(|| bad_unary("+", v)),
        (UnaryOp::Not, _) => Ok(Value::Bool(!value.is_truthy())),
    }
}

fn bad_unary(symbol: &str, value: &Value) -> EvalError {
    EvalError::new(
        EvalErrorKind::TypeError,
        format!("bad operand type for unary {symbol}: '{}'", value.type_name()),
    )
}

// ── Comparison ──────────────────────────────────────────────────────────

pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::NotEq => Ok(left != right),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Lt | CmpOp::Gt | CmpOp::LtEq | CmpOp::GtEq => {
            let ordering = order(left, right).ok_or_else(|| {
                EvalError::new(
                    EvalErrorKind::TypeError,
                    format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        op.symbol(),
                        left.type_name(),
                        right.type_name()
                    ),
                )
            })?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::LtEq => ordering.is_le(),
                _ => ordering.is_ge(),
            })
        }
    }
}

/// Total order over comparable values. `None` when the pair is unordered.
pub fn order(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b) {
                if x != y {
                    return order(x, y);
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => match numbers(left, right)? {
            Num::Int(l, r) => Some(l.cmp(&r)),
            Num::Float(l, r) => l.partial_cmp(&r),
        },
    }
}

/// Membership test `item in container`.
pub fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match container {
        Value::String(haystack) => match item {
            Value::String(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(EvalError::new(
                EvalErrorKind::TypeError,
                format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ),
            )),
        },
        Value::List(items) | Value::Tuple(items) => Ok(items.contains(item)),
        Value::Set(items) => {
            require_hashable(item)?;
            Ok(items.contains(item))
        }
        Value::Dict(map) => {
            require_hashable(item)?;
            Ok(map.contains_key(item))
        }
        Value::Iterator(iter) => {
            for element in iter.take_source() {
                if element? == *item {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Undefined(_) => Ok(false),
        other => Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!("argument of type '{}' is not iterable", other.type_name()),
        )),
    }
}

// ── Collections ─────────────────────────────────────────────────────────

pub fn require_hashable(value: &Value) -> Result<(), EvalError> {
    if value.is_hashable() {
        Ok(())
    } else {
        Err(EvalError::unhashable(value.type_name()))
    }
}

/// Elements of a synchronously iterable value, in iteration order.
/// Undefined iterates empty. A generator is drained.
pub fn iterate(value: &Value) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::Undefined(_) => Ok(Vec::new()),
        Value::Iterator(iter) => iter.drain(),
        other => other
            .iter_values()
            .ok_or_else(|| EvalError::not_iterable(other.type_name())),
    }
}

/// Like [`iterate`], but a generator is pulled one element at a time
/// instead of being drained up front.
pub fn elements(value: &Value) -> Result<ElementSource, EvalError> {
    match value {
        Value::Iterator(iter) => Ok(iter.take_source()),
        other => Ok(Box::new(iterate(other)?.into_iter().map(Ok))),
    }
}

/// Key/value pairs contributed by a `**` spread operand.
pub fn mapping_pairs(value: &Value) -> Result<Vec<(Value, Value)>, EvalError> {
    match value {
        Value::Dict(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Value::Undefined(_) => Ok(Vec::new()),
        other => Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!("'{}' object is not a mapping", other.type_name()),
        )),
    }
}

/// Accumulates set members, rejecting unhashable values.
#[derive(Default)]
pub struct SetBuilder(IndexSet<Value>);

impl SetBuilder {
    pub fn insert(&mut self, value: Value) -> Result<(), EvalError> {
        require_hashable(&value)?;
        self.0.insert(value);
        Ok(())
    }

    pub fn finish(self) -> Value {
        Value::Set(self.0)
    }
}

/// Accumulates dict entries. A repeated key overwrites the value in place.
#[derive(Default)]
pub struct DictBuilder(IndexMap<Value, Value>);

impl DictBuilder {
    pub fn insert(&mut self, key: Value, value: Value) -> Result<(), EvalError> {
        require_hashable(&key)?;
        self.0.insert(key, value);
        Ok(())
    }

    pub fn finish(self) -> Value {
        Value::Dict(self.0)
    }
}

/// Bind `value` to an assignment target, appending `(name, value)` pairs
/// in target order. Tuple targets unpack sequences of exactly matching
/// length.
pub fn bind_target(
    target: &Spanned<ExprKind>,
    value: Value,
    out: &mut Vec<(String, Value)>,
) -> Result<(), EvalError> {
    match &target.node {
        ExprKind::Name { name, .. } => {
            out.push((name.clone(), value));
            Ok(())
        }
        ExprKind::Tuple { items, .. } => {
            let values = match &value {
                Value::Iterator(iter) => iter.drain()?,
                other => other.iter_values().ok_or_else(|| {
                    EvalError::new(
                        EvalErrorKind::TypeError,
                        format!("cannot unpack non-iterable {} object", other.type_name()),
                    )
                })?,
            };
            if values.len() < items.len() {
                return Err(EvalError::new(
                    EvalErrorKind::TypeError,
                    format!(
                        "not enough values to unpack (expected {}, got {})",
                        items.len(),
                        values.len()
                    ),
                ));
            }
            if values.len() > items.len() {
                return Err(EvalError::new(
                    EvalErrorKind::TypeError,
                    format!("too many values to unpack (expected {})", items.len()),
                ));
            }
            for (item, value) in items.iter().zip(values) {
                match item {
                    ScalarItem::Expr(sub) => bind_target(sub, value, out)?,
                    ScalarItem::Spread(spread) => {
                        return Err(EvalError::new(
                            EvalErrorKind::TypeError,
                            "can't assign to starred expression",
                        )
                        .with_span(spread.span));
                    }
                }
            }
            Ok(())
        }
        other => Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!("can't assign to {}", other.describe()),
        )
        .with_span(target.span)),
    }
}

// ── Item and attribute access ───────────────────────────────────────────

pub fn len(value: &Value) -> Result<usize, EvalError> {
    match value {
        Value::String(s) => Ok(s.chars().count()),
        Value::List(items) | Value::Tuple(items) => Ok(items.len()),
        Value::Set(items) => Ok(items.len()),
        Value::Dict(map) => Ok(map.len()),
        other => Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!("object of type '{}' has no len()", other.type_name()),
        )),
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if index < 0 { index + len } else { index };
    if (0..len).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

/// Subscript `obj[key]`.
pub fn getitem(obj: &Value, key: &Value) -> Result<Value, EvalError> {
    if let Some(err) = undefined_operand(obj) {
        return Err(err);
    }
    match obj {
        Value::List(items) | Value::Tuple(items) => {
            let index = key
                .as_int()
                .ok_or_else(|| EvalError::type_error("integer index", key.type_name()))?;
            normalize_index(index, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| {
                    EvalError::new(
                        EvalErrorKind::LookupError,
                        format!("{} index out of range", obj.type_name()),
                    )
                })
        }
        Value::String(s) => {
            let index = key
                .as_int()
                .ok_or_else(|| EvalError::type_error("integer index", key.type_name()))?;
            let chars: Vec<char> = s.chars().collect();
            normalize_index(index, chars.len())
                .map(|i| Value::String(chars[i].to_string()))
                .ok_or_else(|| {
                    EvalError::new(EvalErrorKind::LookupError, "string index out of range")
                })
        }
        Value::Dict(map) => {
            require_hashable(key)?;
            map.get(key).cloned().ok_or_else(|| {
                EvalError::new(
                    EvalErrorKind::LookupError,
                    format!("key {} not found", key.repr()),
                )
            })
        }
        other => Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!("'{}' object is not subscriptable", other.type_name()),
        )),
    }
}

/// Attribute access `obj.name`. Dicts expose their string keys.
pub fn getattr(obj: &Value, name: &str) -> Result<Value, EvalError> {
    if let Some(err) = undefined_operand(obj) {
        return Err(err);
    }
    if let Value::Dict(map) = obj
        && let Some(value) = map.get(&Value::String(name.to_string()))
    {
        return Ok(value.clone());
    }
    Err(no_attribute(obj, name))
}

fn no_attribute(obj: &Value, name: &str) -> EvalError {
    EvalError::new(
        EvalErrorKind::LookupError,
        format!("'{}' object has no attribute '{name}'", obj.type_name()),
    )
}

fn expect_args(method: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!(
                "{method}() takes {expected} argument(s) ({} given)",
                args.len()
            ),
        ));
    }
    Ok(())
}

fn str_arg<'a>(method: &str, value: &'a Value) -> Result<&'a str, EvalError> {
    value
        .as_str()
        .ok_or_else(|| EvalError::type_error(&format!("str argument to {method}()"), value.type_name()))
}

/// Method call `obj.name(args...)` on a builtin value.
pub fn call_method(obj: &Value, name: &str, args: &[Value]) -> Result<Value, EvalError> {
    if let Some(err) = undefined_operand(obj) {
        return Err(err);
    }
    match name {
        "__len__" => {
            expect_args(name, args, 0, 0)?;
            return len(obj).map(|n| Value::Int(n as i64));
        }
        "__str__" => {
            expect_args(name, args, 0, 0)?;
            return Ok(Value::String(obj.to_output_string()));
        }
        _ => {}
    }

    match obj {
        Value::Dict(map) => match name {
            "items" => {
                expect_args(name, args, 0, 0)?;
                Ok(Value::List(
                    map.iter()
                        .map(|(k, v)| Value::Tuple(vec![k.clone(), v.clone()]))
                        .collect(),
                ))
            }
            "keys" => {
                expect_args(name, args, 0, 0)?;
                Ok(Value::List(map.keys().cloned().collect()))
            }
            "values" => {
                expect_args(name, args, 0, 0)?;
                Ok(Value::List(map.values().cloned().collect()))
            }
            "get" => {
                expect_args(name, args, 1, 2)?;
                require_hashable(&args[0])?;
                Ok(map
                    .get(&args[0])
                    .cloned()
                    .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            _ => Err(no_attribute(obj, name)),
        },
        Value::String(s) => string_method(s, name, args)?.ok_or_else(|| no_attribute(obj, name)),
        Value::List(items) | Value::Tuple(items) => match name {
            "count" => {
                expect_args(name, args, 1, 1)?;
                Ok(Value::Int(items.iter().filter(|v| *v == &args[0]).count() as i64))
            }
            "index" => {
                expect_args(name, args, 1, 1)?;
                items
                    .iter()
                    .position(|v| v == &args[0])
                    .map(|i| Value::Int(i as i64))
                    .ok_or_else(|| {
                        EvalError::new(
                            EvalErrorKind::LookupError,
                            format!("{} is not in {}", args[0].repr(), obj.type_name()),
                        )
                    })
            }
            _ => Err(no_attribute(obj, name)),
        },
        _ => Err(no_attribute(obj, name)),
    }
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let value = match name {
        "startswith" | "endswith" => {
            expect_args(name, args, 1, 1)?;
            let affix = str_arg(name, &args[0])?;
            Value::Bool(if name == "startswith" {
                s.starts_with(affix)
            } else {
                s.ends_with(affix)
            })
        }
        "upper" => {
            expect_args(name, args, 0, 0)?;
            Value::String(s.to_uppercase())
        }
        "lower" => {
            expect_args(name, args, 0, 0)?;
            Value::String(s.to_lowercase())
        }
        "strip" => {
            expect_args(name, args, 0, 1)?;
            match args.first() {
                None | Some(Value::None) => Value::String(s.trim().to_string()),
                Some(chars) => {
                    let chars: Vec<char> = str_arg(name, chars)?.chars().collect();
                    Value::String(s.trim_matches(chars.as_slice()).to_string())
                }
            }
        }
        "split" => {
            expect_args(name, args, 0, 1)?;
            match args.first() {
                None | Some(Value::None) => {
                    Value::List(s.split_whitespace().map(Value::from).collect())
                }
                Some(sep) => {
                    let sep = str_arg(name, sep)?;
                    if sep.is_empty() {
                        return Err(EvalError::new(EvalErrorKind::TypeError, "empty separator"));
                    }
                    Value::List(s.split(sep).map(Value::from).collect())
                }
            }
        }
        "join" => {
            expect_args(name, args, 1, 1)?;
            let parts = iterate(&args[0])?
                .iter()
                .map(|part| str_arg(name, part).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            Value::String(parts.join(s))
        }
        "replace" => {
            expect_args(name, args, 2, 2)?;
            let old = str_arg(name, &args[0])?;
            let new = str_arg(name, &args[1])?;
            Value::String(s.replace(old, new))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::value::ValueIter;

    fn s(text: &str) -> Value {
        Value::from(text)
    }

    #[test]
    fn test_int_arithmetic_follows_floor_semantics() {
        assert_eq!(binary(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(binary(BinOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(binary(BinOp::Div, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Float(3.5));
        assert_eq!(binary(BinOp::Pow, &Value::Int(2), &Value::Int(10)).unwrap(), Value::Int(1024));
    }

    #[test]
    fn test_division_by_zero() {
        let err = binary(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ArithmeticError);
    }

    #[test]
    fn test_sequence_add_and_repeat() {
        let joined = binary(
            BinOp::Add,
            &Value::List(vec![Value::Int(1)]),
            &Value::List(vec![Value::Int(2)]),
        )
        .unwrap();
        assert_eq!(joined.repr(), "[1, 2]");
        assert_eq!(binary(BinOp::Mul, &s("ab"), &Value::Int(3)).unwrap(), s("ababab"));
        assert!(binary(BinOp::Add, &s("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_repeat_is_capped_before_allocating() {
        let err = binary(BinOp::Mul, &s("ab"), &Value::Int(4_611_686_018_427_387_904)).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
        let err = binary(BinOp::Mul, &Value::Int(i64::MAX), &Value::List(vec![Value::None])).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
        assert_eq!(binary(BinOp::Mul, &Value::List(vec![]), &Value::Int(i64::MAX)).unwrap().repr(), "[]");
        assert_eq!(binary(BinOp::Mul, &s("ab"), &Value::Int(-2)).unwrap(), s(""));
    }

    #[test]
    fn test_zero_to_negative_power() {
        let err = binary(BinOp::Pow, &Value::Int(0), &Value::Int(-1)).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ArithmeticError);
        assert!(binary(BinOp::Pow, &Value::Float(0.0), &Value::Float(-0.5)).is_err());
        assert_eq!(binary(BinOp::Pow, &Value::Int(2), &Value::Int(-1)).unwrap(), Value::Float(0.5));
    }

    #[test]
    fn test_and_or_return_operands() {
        assert_eq!(binary(BinOp::Or, &Value::Int(0), &s("x")).unwrap(), s("x"));
        assert_eq!(binary(BinOp::And, &Value::Int(0), &s("x")).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_percent_formatting() {
        let args = Value::Tuple(vec![s("a"), Value::Int(3), s("b")]);
        assert_eq!(format_percent("%s=%d %r 100%%", &args).unwrap(), "a=3 'b' 100%");
        assert!(format_percent("%s %s", &s("one")).is_err());
        assert!(format_percent("%s", &Value::Tuple(vec![s("a"), s("b")])).is_err());
    }

    #[test]
    fn test_membership() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert!(compare(CmpOp::In, &Value::Float(2.0), &list).unwrap());
        assert!(compare(CmpOp::NotIn, &Value::Int(3), &list).unwrap());
        assert!(compare(CmpOp::In, &s("ell"), &s("hello")).unwrap());
        assert!(compare(CmpOp::In, &Value::Int(1), &Value::Int(5)).is_err());
        let set = Value::set_from([Value::Int(1)]);
        assert!(compare(CmpOp::In, &Value::List(vec![]), &set).is_err());
    }

    #[test]
    fn test_membership_pulls_generator_until_found() {
        let iter = ValueIter::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(contains(&Value::Iterator(iter.clone()), &Value::Int(2)).unwrap());
        assert_eq!(iter.drain().unwrap(), vec![Value::Int(3)]);
    }

    #[test]
    fn test_ordering_rejects_mixed_types() {
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(CmpOp::Lt, &s("a"), &s("b")).unwrap());
        assert!(compare(CmpOp::Lt, &Value::Int(1), &s("b")).is_err());
    }

    #[test]
    fn test_set_builder_rejects_unhashable() {
        let mut set = SetBuilder::default();
        set.insert(Value::Int(1)).unwrap();
        let err = set.insert(Value::List(vec![])).unwrap_err();
        assert!(err.message.contains("unhashable type: 'list'"));
    }

    #[test]
    fn test_methods() {
        let dict = Value::dict_from_pairs([(s("a"), Value::Int(1))]);
        assert_eq!(call_method(&dict, "items", &[]).unwrap().repr(), "[('a', 1)]");
        assert_eq!(call_method(&dict, "get", &[s("z"), Value::Int(0)]).unwrap(), Value::Int(0));
        assert_eq!(
            call_method(&s(","), "join", &[Value::List(vec![s("a"), s("b")])]).unwrap(),
            s("a,b")
        );
        assert_eq!(call_method(&s(" x "), "strip", &[]).unwrap(), s("x"));
        assert_eq!(call_method(&s("a"), "__len__", &[]).unwrap(), Value::Int(1));
        assert_eq!(
            call_method(&s("a"), "nope", &[]).unwrap_err().kind,
            EvalErrorKind::LookupError
        );
    }

    #[test]
    fn test_getitem_negative_index() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(getitem(&list, &Value::Int(-1)).unwrap(), Value::Int(2));
        assert_eq!(
            getitem(&list, &Value::Int(2)).unwrap_err().kind,
            EvalErrorKind::LookupError
        );
    }
}
