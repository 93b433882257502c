//! Generator comprehensions, evaluated on demand.
//!
//! Creating a generator evaluates only the first clause iterable. Every
//! other part of the comprehension runs when an element is pulled, against
//! a snapshot of the names the comprehension reads taken at creation time.
//! Pulls continue the node and iteration counts of the evaluator that
//! created the generator.

use futures::StreamExt;
use futures::stream::{self, Stream};

use super::{EvalOptions, Evaluator, ScopeFrame, SimpleContext, ops};
use crate::ast::expr::{Comprehension, Expr};
use crate::ast::value::{ElementSource, Value, ValueIter};
use crate::error::EvalError;
use crate::registry::Registry;
use crate::runtime::{self, AsyncSeq, ValueStream};

/// Everything a generator needs once the expression that created it has
/// finished evaluating.
struct Closure {
    comp: Comprehension<Box<Expr>>,
    env: SimpleContext,
    /// Functions are captured as values in `env`.
    registry: Registry,
    options: EvalOptions,
}

impl Closure {
    fn evaluator(&self, progress: &mut Progress) -> Evaluator<'_> {
        let mut evaluator = Evaluator::new(&self.env, &self.registry, self.options.clone());
        evaluator.scopes = std::mem::take(&mut progress.scopes);
        evaluator.node_count = progress.node_count;
        evaluator.iteration_count = progress.iteration_count;
        evaluator
    }
}

/// Evaluator state carried from one pull to the next.
struct Progress {
    scopes: Vec<ScopeFrame>,
    node_count: u64,
    iteration_count: u64,
}

impl Progress {
    fn save(&mut self, evaluator: Evaluator<'_>) {
        self.scopes = evaluator.scopes;
        self.node_count = evaluator.node_count;
        self.iteration_count = evaluator.iteration_count;
    }
}

/// Names the generator reads after creation, i.e. everything free in the
/// comprehension except the first iterable.
fn captured_names(comp: &Comprehension<Box<Expr>>) -> Vec<String> {
    let mut bound = Vec::new();
    let mut names = Vec::new();
    for (i, clause) in comp.clauses.iter().enumerate() {
        if i > 0 {
            clause.iter.node.free_names(&mut bound, &mut names);
        }
        clause.target.node.target_names(&mut bound);
        if let Some(cond) = &clause.cond {
            cond.node.free_names(&mut bound, &mut names);
        }
    }
    comp.result.node.free_names(&mut bound, &mut names);
    names
}

// ── Synchronous ─────────────────────────────────────────────────────────

/// Pull-based state of a generator. `levels[i]` holds the remaining
/// elements of clause `i`, and scope frame `i` binds its current element.
struct Generator {
    closure: Closure,
    progress: Progress,
    levels: Vec<ElementSource>,
}

impl Iterator for Generator {
    type Item = Result<Value, EvalError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut evaluator = self.closure.evaluator(&mut self.progress);
        let item = step(&self.closure.comp, &mut evaluator, &mut self.levels);
        self.progress.save(evaluator);
        if matches!(item, Some(Err(_))) {
            self.levels.clear();
        }
        item
    }
}

fn step(
    comp: &Comprehension<Box<Expr>>,
    evaluator: &mut Evaluator<'_>,
    levels: &mut Vec<ElementSource>,
) -> Option<Result<Value, EvalError>> {
    loop {
        let level = levels.len().checked_sub(1)?;
        evaluator.scopes.truncate(level);
        let Some(element) = levels[level].next() else {
            levels.pop();
            continue;
        };
        match bind_element(comp, evaluator, level, element) {
            Ok(Bound::Result) => return Some(evaluator.eval_expr(&comp.result)),
            Ok(Bound::Skipped) => {}
            Ok(Bound::Open(iterable)) => {
                let span = comp.clauses[level + 1].iter.span;
                match ops::elements(&iterable) {
                    Ok(source) => levels.push(source),
                    Err(e) => return Some(Err(e.or_span(span))),
                }
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

/// Outcome of binding one element of a clause.
enum Bound {
    /// A guard rejected the element.
    Skipped,
    /// The next clause starts over this iterable.
    Open(Value),
    /// Every clause is bound; the result expression is due.
    Result,
}

fn bind_element(
    comp: &Comprehension<Box<Expr>>,
    evaluator: &mut Evaluator<'_>,
    level: usize,
    element: Result<Value, EvalError>,
) -> Result<Bound, EvalError> {
    let clause = &comp.clauses[level];
    let element = element.map_err(|e| e.or_span(clause.iter.span))?;
    evaluator.check_iteration_limit()?;
    evaluator.push_bindings(&clause.target, element)?;
    if let Some(cond) = &clause.cond
        && !evaluator.eval_expr(cond)?.is_truthy()
    {
        return Ok(Bound::Skipped);
    }
    match comp.clauses.get(level + 1) {
        Some(next) => {
            let iterable = evaluator.eval_expr(&next.iter)?;
            evaluator.comprehension_iterable(&iterable, next.iter.span)?;
            Ok(Bound::Open(iterable))
        }
        None => Ok(Bound::Result),
    }
}

// ── Asynchronous ────────────────────────────────────────────────────────

/// Asynchronous twin of [`Generator`]. Every clause iterable goes through
/// `auto_aiter`.
struct AsyncGenerator {
    closure: Closure,
    progress: Progress,
    levels: Vec<ValueStream>,
}

impl AsyncGenerator {
    async fn pull(&mut self) -> Option<Result<Value, EvalError>> {
        let mut evaluator = self.closure.evaluator(&mut self.progress);
        let item = step_async(&self.closure.comp, &mut evaluator, &mut self.levels).await;
        self.progress.save(evaluator);
        if matches!(item, Some(Err(_))) {
            self.levels.clear();
        }
        item
    }

    fn into_stream(self) -> impl Stream<Item = Result<Value, EvalError>> + Send {
        stream::unfold(self, |mut generator| async move {
            let item = generator.pull().await?;
            Some((item, generator))
        })
    }
}

async fn step_async(
    comp: &Comprehension<Box<Expr>>,
    evaluator: &mut Evaluator<'_>,
    levels: &mut Vec<ValueStream>,
) -> Option<Result<Value, EvalError>> {
    loop {
        let level = levels.len().checked_sub(1)?;
        evaluator.scopes.truncate(level);
        let Some(element) = levels[level].next().await else {
            levels.pop();
            continue;
        };
        match bind_element_async(comp, evaluator, level, element).await {
            Ok(Bound::Result) => return Some(evaluator.eval_expr_async(&comp.result).await),
            Ok(Bound::Skipped) => {}
            Ok(Bound::Open(iterable)) => {
                let span = comp.clauses[level + 1].iter.span;
                match runtime::auto_aiter(&iterable) {
                    Ok(source) => levels.push(source),
                    Err(e) => return Some(Err(e.or_span(span))),
                }
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

async fn bind_element_async(
    comp: &Comprehension<Box<Expr>>,
    evaluator: &mut Evaluator<'_>,
    level: usize,
    element: Result<Value, EvalError>,
) -> Result<Bound, EvalError> {
    let clause = &comp.clauses[level];
    let element = element.map_err(|e| e.or_span(clause.iter.span))?;
    evaluator.check_iteration_limit()?;
    evaluator.push_bindings(&clause.target, element)?;
    if let Some(cond) = &clause.cond
        && !evaluator.eval_expr_async(cond).await?.is_truthy()
    {
        return Ok(Bound::Skipped);
    }
    match comp.clauses.get(level + 1) {
        Some(next) => {
            let iterable = evaluator.eval_expr_async(&next.iter).await?;
            evaluator.comprehension_iterable(&iterable, next.iter.span)?;
            Ok(Bound::Open(iterable))
        }
        None => Ok(Bound::Result),
    }
}

// ── Creation ────────────────────────────────────────────────────────────

impl Evaluator<'_> {
    /// Snapshot the names the generator reads. Undefined names are left
    /// out so they stay undefined when pulled.
    fn capture(&self, comp: &Comprehension<Box<Expr>>) -> Result<(Closure, Progress), EvalError> {
        let mut env = SimpleContext::new();
        for name in captured_names(comp) {
            match self.resolve_name(&name)? {
                Value::Undefined(_) => {}
                value => env.set(&name, value),
            }
        }
        let closure = Closure {
            comp: comp.clone(),
            env,
            registry: Registry::new(),
            options: self.options.clone(),
        };
        let progress = Progress {
            scopes: Vec::new(),
            node_count: self.node_count,
            iteration_count: self.iteration_count,
        };
        Ok((closure, progress))
    }

    /// `(result for ...)` on the synchronous path: a lazy [`Value::Iterator`].
    pub(super) fn start_generator(&mut self, comp: &Comprehension<Box<Expr>>) -> Result<Value, EvalError> {
        let Some(first) = comp.clauses.first() else {
            return Ok(Value::Iterator(ValueIter::new(Vec::new())));
        };
        let iterable = self.eval_expr(&first.iter)?;
        self.comprehension_iterable(&iterable, first.iter.span)?;
        let source = ops::elements(&iterable).map_err(|e| e.or_span(first.iter.span))?;

        let (closure, progress) = self.capture(comp)?;
        Ok(Value::Iterator(ValueIter::lazy(Generator {
            closure,
            progress,
            levels: vec![source],
        })))
    }

    /// `(result for ...)` on the asynchronous path: a lazy [`AsyncSeq`].
    pub(super) async fn start_generator_async(
        &mut self,
        comp: &Comprehension<Box<Expr>>,
    ) -> Result<Value, EvalError> {
        let Some(first) = comp.clauses.first() else {
            return Ok(Value::AsyncSeq(AsyncSeq::from_values(Vec::<Value>::new())));
        };
        let iterable = self.eval_expr_async(&first.iter).await?;
        self.comprehension_iterable(&iterable, first.iter.span)?;
        let source = runtime::auto_aiter(&iterable).map_err(|e| e.or_span(first.iter.span))?;

        let (closure, progress) = self.capture(comp)?;
        let generator = AsyncGenerator {
            closure,
            progress,
            levels: vec![source],
        };
        Ok(Value::AsyncSeq(AsyncSeq::new(generator.into_stream())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::EvalErrorKind;
    use crate::eval::{eval_expr_value, eval_expr_value_async, evaluate, evaluate_with_options};
    use crate::parser;
    use crate::registry::ClosureFunction;
    use crate::runtime::syncify;

    fn counting_registry(calls: Arc<AtomicUsize>) -> Registry {
        let mut registry = Registry::with_builtins();
        registry.register(ClosureFunction::new("tick", move |args: Vec<Value>| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(args.into_iter().next().unwrap_or(Value::None))
        }));
        registry
    }

    fn render(source: &str, registry: &Registry) -> Result<String, EvalError> {
        let template = parser::parse(source).unwrap();
        evaluate(&template, &SimpleContext::new(), registry)
    }

    #[test]
    fn test_captured_names_skip_first_iterable_and_targets() {
        let expr = parser::parse_expr("(f(x, y) for x in xs if x > lo for y in x)").unwrap();
        let crate::ast::expr::ExprKind::Generator(comp) = &expr.node else {
            panic!("expected generator");
        };
        assert_eq!(captured_names(comp), ["lo", "f"]);
    }

    #[test]
    fn test_unconsumed_generator_never_evaluates_elements() {
        let registry = Registry::with_builtins();
        assert_eq!(render("{{ 'ok' if (1 // x for x in [0]) else 'no' }}", &registry).unwrap(), "ok");
        assert_eq!(render("{{ [1 for g in [(1 // x for x in [0])]] }}", &registry).unwrap(), "[1]");

        let err = render("{{ list(1 // x for x in [0]) }}", &registry).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ArithmeticError);
    }

    #[test]
    fn test_elements_are_computed_as_they_are_pulled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone());
        let ctx = SimpleContext::new().with("xs", vec![1i64, 2, 3]);

        let expr = parser::parse_expr("(tick(x) for x in xs if x != 2)").unwrap();
        let value = eval_expr_value(&expr, &ctx, &registry).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let Value::Iterator(iter) = &value else {
            panic!("expected generator, got {value:?}");
        };
        let mut source = iter.take_source();
        assert_eq!(source.next().unwrap().unwrap(), Value::Int(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.next().unwrap().unwrap(), Value::Int(3));
        assert!(source.next().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_generator_sees_bindings_from_its_creation() {
        let registry = Registry::with_builtins();
        assert_eq!(
            render("{{ [list(x * k for x in [1, 2]) for k in [1, 10]] }}", &registry).unwrap(),
            "[[1, 2], [10, 20]]"
        );
        assert_eq!(
            render("{{ list((a, b) for a in [1, 2] for b in range(a)) }}", &registry).unwrap(),
            "[(1, 0), (2, 0), (2, 1)]"
        );
    }

    #[test]
    fn test_generator_of_generator_stays_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone());
        let output = render("{{ 2 in (y for y in (tick(x) for x in [1, 2, 3])) }}", &registry).unwrap();
        assert_eq!(output, "True");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_ends_the_generator() {
        let expr = parser::parse_expr("(10 // x for x in [5, 0, 2])").unwrap();
        let value = eval_expr_value(&expr, &SimpleContext::new(), &Registry::new()).unwrap();
        let Value::Iterator(iter) = value else {
            panic!("expected generator");
        };
        let items: Vec<_> = iter.take_source().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Value::Int(2));
        assert_eq!(items[1].as_ref().unwrap_err().kind, EvalErrorKind::ArithmeticError);
    }

    #[test]
    fn test_pulls_count_against_iteration_limit() {
        let template = parser::parse("{{ sum(x for x in range(10)) }}").unwrap();
        let opts = EvalOptions::new().max_iterations(5);
        let err = evaluate_with_options(&template, &SimpleContext::new(), &Registry::with_builtins(), opts)
            .unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
    }

    #[tokio::test]
    async fn test_async_generator_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(calls.clone());
        let opts = EvalOptions::new().enable_async(true);

        let expr = parser::parse_expr("(tick(x) for x in [1, 2])").unwrap();
        let value = eval_expr_value_async(&expr, &SimpleContext::new(), &registry, opts.clone())
            .await
            .unwrap();
        assert!(matches!(value, Value::AsyncSeq(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(syncify(value).await.unwrap().repr(), "[1, 2]");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let expr = parser::parse_expr("[1 for g in [(1 // x for x in [0])]]").unwrap();
        let value = eval_expr_value_async(&expr, &SimpleContext::new(), &registry, opts)
            .await
            .unwrap();
        assert_eq!(value.repr(), "[1]");
    }
}
