//! The builtin function set installed by [`Registry::with_builtins`].
//!
//! Each builtin is a plain function over evaluated arguments. During
//! asynchronous rendering its arguments go through [`syncify`] first, so
//! `list(feed)` or `sum(x for x in feed)` work unchanged when `feed` is an
//! async sequence.

use futures::future::BoxFuture;

use super::{FunctionSignature, Kwargs, Registry, TemplateFunction, reject_kwargs};
use crate::ast::value::{Value, ValueIter};
use crate::error::{EvalError, EvalErrorKind};
use crate::eval::ops;
use crate::runtime::syncify;

type BuiltinFn = fn(Vec<Value>, Kwargs) -> Result<Value, EvalError>;

struct Builtin {
    name: &'static str,
    func: BuiltinFn,
}

impl TemplateFunction for Builtin {
    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
        (self.func)(args, kwargs)
    }

    fn call_async(&self, args: Vec<Value>, kwargs: Kwargs) -> BoxFuture<'_, Result<Value, EvalError>> {
        Box::pin(async move {
            let mut plain_args = Vec::with_capacity(args.len());
            for arg in args {
                plain_args.push(syncify(arg).await?);
            }
            let mut plain_kwargs = Kwargs::with_capacity(kwargs.len());
            for (key, value) in kwargs {
                plain_kwargs.insert(key, syncify(value).await?);
            }
            (self.func)(plain_args, plain_kwargs)
        })
    }

    fn signature(&self) -> FunctionSignature {
        FunctionSignature::new(self.name)
    }
}

pub(crate) fn install(registry: &mut Registry) {
    let table: [(&'static str, BuiltinFn); 12] = [
        ("range", range),
        ("list", list),
        ("tuple", tuple),
        ("set", set),
        ("dict", dict),
        ("min", min),
        ("max", max),
        ("enumerate", enumerate),
        ("len", len),
        ("sorted", sorted),
        ("sum", sum),
        ("str", to_str),
    ];
    for (name, func) in table {
        registry.register(Builtin { name, func });
    }
}

fn arity_error(name: &str, min: usize, max: usize, got: usize) -> EvalError {
    EvalError::new(
        EvalErrorKind::TypeError,
        format!("{name}() expected at most {max} and at least {min} argument(s), got {got}"),
    )
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        return Err(arity_error(name, min, max, args.len()));
    }
    Ok(())
}

fn int_arg(name: &str, value: &Value) -> Result<i64, EvalError> {
    value.as_int().ok_or_else(|| {
        EvalError::new(
            EvalErrorKind::TypeError,
            format!(
                "'{}' object cannot be interpreted as an integer in {name}()",
                value.type_name()
            ),
        )
    })
}

fn take_kwarg(kwargs: &mut Kwargs, key: &str) -> Option<Value> {
    kwargs.shift_remove(key)
}

fn range(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    reject_kwargs("range", &kwargs)?;
    let ints = args
        .iter()
        .map(|v| int_arg("range", v))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(arity_error("range", 1, 3, args.len())),
    };
    if step == 0 {
        return Err(EvalError::new(
            EvalErrorKind::TypeError,
            "range() arg 3 must not be zero",
        ));
    }
    let len = range_len(start, stop, step);
    if len > ops::MAX_SEQUENCE_LEN as i128 {
        return Err(EvalError::new(
            EvalErrorKind::ResourceLimit,
            format!("range() of {len} items exceeds the maximum of {}", ops::MAX_SEQUENCE_LEN),
        ));
    }
    let out = (0..len)
        .map(|i| Value::Int((i128::from(start) + i * i128::from(step)) as i64))
        .collect();
    Ok(Value::List(out))
}

/// Element count of `range(start, stop, step)`, computed without
/// overflow. `step` is non-zero.
fn range_len(start: i64, stop: i64, step: i64) -> i128 {
    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    if step > 0 && start < stop {
        (stop - start - 1) / step + 1
    } else if step < 0 && start > stop {
        (start - stop - 1) / -step + 1
    } else {
        0
    }
}

fn items_of(name: &str, args: &[Value]) -> Result<Vec<Value>, EvalError> {
    arity(name, args, 0, 1)?;
    match args.first() {
        Some(iterable) => ops::iterate(iterable),
        None => Ok(Vec::new()),
    }
}

fn list(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    reject_kwargs("list", &kwargs)?;
    items_of("list", &args).map(Value::List)
}

fn tuple(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    reject_kwargs("tuple", &kwargs)?;
    items_of("tuple", &args).map(Value::Tuple)
}

fn set(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    reject_kwargs("set", &kwargs)?;
    let mut set = ops::SetBuilder::default();
    for item in items_of("set", &args)? {
        set.insert(item)?;
    }
    Ok(set.finish())
}

fn dict(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    arity("dict", &args, 0, 1)?;
    let mut dict = ops::DictBuilder::default();
    match args.first() {
        Some(Value::Dict(map)) => {
            for (key, value) in map {
                dict.insert(key.clone(), value.clone())?;
            }
        }
        Some(pairs) => {
            for (index, pair) in ops::iterate(pairs)?.into_iter().enumerate() {
                let parts = pair.iter_values().ok_or_else(|| {
                    EvalError::new(
                        EvalErrorKind::TypeError,
                        format!("cannot convert dictionary update sequence element #{index} to a sequence"),
                    )
                })?;
                let [key, value] = parts.as_slice() else {
                    return Err(EvalError::new(
                        EvalErrorKind::TypeError,
                        format!(
                            "dictionary update sequence element #{index} has length {}; 2 is required",
                            parts.len()
                        ),
                    ));
                };
                dict.insert(key.clone(), value.clone())?;
            }
        }
        None => {}
    }
    for (key, value) in kwargs {
        dict.insert(Value::String(key), value)?;
    }
    Ok(dict.finish())
}

fn extreme(name: &str, args: Vec<Value>, kwargs: Kwargs, want: std::cmp::Ordering) -> Result<Value, EvalError> {
    reject_kwargs(name, &kwargs)?;
    let candidates = match args.len() {
        0 => {
            return Err(EvalError::new(
                EvalErrorKind::TypeError,
                format!("{name} expected at least 1 argument, got 0"),
            ));
        }
        1 => ops::iterate(&args[0])?,
        _ => args,
    };
    let mut best: Option<Value> = None;
    for candidate in candidates {
        best = Some(match best {
            None => candidate,
            Some(current) => {
                let ordering = ops::order(&candidate, &current).ok_or_else(|| {
                    EvalError::new(
                        EvalErrorKind::TypeError,
                        format!(
                            "'{name}' not supported between instances of '{}' and '{}'",
                            candidate.type_name(),
                            current.type_name()
                        ),
                    )
                })?;
                if ordering == want { candidate } else { current }
            }
        });
    }
    best.ok_or_else(|| {
        EvalError::new(
            EvalErrorKind::LookupError,
            format!("{name}() arg is an empty sequence"),
        )
    })
}

fn min(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    extreme("min", args, kwargs, std::cmp::Ordering::Less)
}

fn max(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    extreme("max", args, kwargs, std::cmp::Ordering::Greater)
}

fn enumerate(args: Vec<Value>, mut kwargs: Kwargs) -> Result<Value, EvalError> {
    let start = match take_kwarg(&mut kwargs, "start") {
        Some(start) => int_arg("enumerate", &start)?,
        None => 0,
    };
    reject_kwargs("enumerate", &kwargs)?;
    arity("enumerate", &args, 1, 2)?;
    let start = match args.get(1) {
        Some(explicit) => int_arg("enumerate", explicit)?,
        None => start,
    };
    let pairs = ops::elements(&args[0])?
        .zip(start..)
        .map(|(item, index)| Ok(Value::Tuple(vec![Value::Int(index), item?])));
    Ok(Value::Iterator(ValueIter::lazy(pairs)))
}

fn len(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    reject_kwargs("len", &kwargs)?;
    arity("len", &args, 1, 1)?;
    ops::len(&args[0]).map(|n| Value::Int(n as i64))
}

fn sorted(args: Vec<Value>, mut kwargs: Kwargs) -> Result<Value, EvalError> {
    let reverse = take_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.is_truthy());
    reject_kwargs("sorted", &kwargs)?;
    arity("sorted", &args, 1, 1)?;
    let mut items = ops::iterate(&args[0])?;
    let mut failure = None;
    items.sort_by(|a, b| match ops::order(a, b) {
        Some(ordering) => ordering,
        None => {
            failure.get_or_insert((a.type_name(), b.type_name()));
            std::cmp::Ordering::Equal
        }
    });
    if let Some((left, right)) = failure {
        return Err(EvalError::new(
            EvalErrorKind::TypeError,
            format!("'<' not supported between instances of '{left}' and '{right}'"),
        ));
    }
    if reverse {
        items.reverse();
    }
    Ok(Value::List(items))
}

fn sum(args: Vec<Value>, mut kwargs: Kwargs) -> Result<Value, EvalError> {
    let start = take_kwarg(&mut kwargs, "start");
    reject_kwargs("sum", &kwargs)?;
    arity("sum", &args, 1, 2)?;
    let mut total = args.get(1).cloned().or(start).unwrap_or(Value::Int(0));
    for item in ops::iterate(&args[0])? {
        total = ops::binary(crate::ast::expr::BinOp::Add, &total, &item)?;
    }
    Ok(total)
}

fn to_str(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EvalError> {
    reject_kwargs("str", &kwargs)?;
    arity("str", &args, 0, 1)?;
    Ok(Value::String(
        args.first().map(Value::to_output_string).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        Registry::with_builtins().call(name, args, Kwargs::new())
    }

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn test_range_forms() {
        assert_eq!(call("range", vec![Value::Int(3)]).unwrap(), ints(&[0, 1, 2]));
        assert_eq!(
            call("range", vec![Value::Int(5), Value::Int(0), Value::Int(-2)]).unwrap(),
            ints(&[5, 3, 1])
        );
        assert!(call("range", vec![Value::Int(1), Value::Int(2), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_range_length_is_checked_before_allocating() {
        let err = call("range", vec![Value::Int(1_000_000_000_000_000_000)]).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
        let err = call("range", vec![Value::Int(i64::MIN), Value::Int(i64::MAX)]).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
        assert_eq!(
            call("range", vec![Value::Int(i64::MAX - 2), Value::Int(i64::MAX), Value::Int(5)]).unwrap(),
            ints(&[i64::MAX - 2])
        );
        assert_eq!(call("range", vec![Value::Int(3), Value::Int(1)]).unwrap(), ints(&[]));
    }

    #[test]
    fn test_dict_from_pairs_and_keywords() {
        let pairs = Value::List(vec![
            Value::Tuple(vec![Value::from("a"), Value::Int(1)]),
            Value::List(vec![Value::from("b"), Value::Int(2)]),
        ]);
        let mut kwargs = Kwargs::new();
        kwargs.insert("a".into(), Value::Int(9));
        let value = Registry::with_builtins().call("dict", vec![pairs], kwargs).unwrap();
        assert_eq!(value.repr(), "{'a': 9, 'b': 2}");
    }

    #[test]
    fn test_min_max_sorted() {
        let values = ints(&[3, 1, 2]);
        assert_eq!(call("min", vec![values.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("max", vec![Value::Int(4), Value::Int(9)]).unwrap(), Value::Int(9));
        assert_eq!(call("sorted", vec![values]).unwrap(), ints(&[1, 2, 3]));
        assert!(call("min", vec![ints(&[])]).is_err());
        assert!(call("sorted", vec![Value::List(vec![Value::Int(1), Value::from("a")])]).is_err());
    }

    #[test]
    fn test_sorted_reverse_keyword() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("reverse".into(), Value::Bool(true));
        let value = Registry::with_builtins()
            .call("sorted", vec![ints(&[1, 3, 2])], kwargs)
            .unwrap();
        assert_eq!(value, ints(&[3, 2, 1]));
    }

    #[test]
    fn test_enumerate_is_one_shot() {
        let value = call("enumerate", vec![Value::from("ab")]).unwrap();
        assert_eq!(
            ops::iterate(&value).unwrap(),
            vec![
                Value::Tuple(vec![Value::Int(0), Value::from("a")]),
                Value::Tuple(vec![Value::Int(1), Value::from("b")]),
            ]
        );
        assert!(ops::iterate(&value).unwrap().is_empty());
    }

    #[test]
    fn test_sum_and_len() {
        assert_eq!(call("sum", vec![ints(&[1, 2, 3])]).unwrap(), Value::Int(6));
        assert_eq!(call("len", vec![Value::from("héllo")]).unwrap(), Value::Int(5));
        assert_eq!(call("str", vec![Value::Float(1.0)]).unwrap(), Value::from("1.0"));
    }

    #[tokio::test]
    async fn test_async_call_syncifies_arguments() {
        use crate::runtime::AsyncSeq;
        let registry = Registry::with_builtins();
        let list = registry.get("list").unwrap();
        let seq = Value::AsyncSeq(AsyncSeq::from_values([1i64, 2]));
        let value = list.call_async(vec![seq], Kwargs::new()).await.unwrap();
        assert_eq!(value, ints(&[1, 2]));
    }
}
