use weaver_comprehensions::{
    CompiledExpr, CompiledTemplate, ConstContext, EvalErrorKind, ParseErrorKind, Registry,
    RenderError, SimpleContext, Value, parse_expr, render,
};

fn render_with(source: &str, ctx: &SimpleContext) -> Result<String, RenderError> {
    render(source, ctx, &Registry::with_builtins())
}

fn render_plain(source: &str) -> String {
    render_with(source, &SimpleContext::new()).unwrap()
}

// ── Literals ────────────────────────────────────────────────────────────

#[test]
fn test_literal_reprs() {
    assert_eq!(render_plain("{{ [1, 'a', none, true] }}"), "[1, 'a', None, True]");
    assert_eq!(render_plain("{{ (1,) }}"), "(1,)");
    assert_eq!(render_plain("{{ () }}"), "()");
    assert_eq!(render_plain("{{ {1, 2, 1} }}"), "{1, 2}");
    assert_eq!(render_plain("{{ {'k': [1, 2]} }}"), "{'k': [1, 2]}");
}

#[test]
fn test_empty_set_and_dict() {
    assert_eq!(render_plain("{{ {} }}"), "{}");
    assert_eq!(render_plain("{{ {*()} }}"), "set()");
    assert_eq!(render_plain("{{ set() }}"), "set()");
}

// ── Spreads ─────────────────────────────────────────────────────────────

#[test]
fn test_list_and_tuple_spreads() {
    let ctx = SimpleContext::new()
        .with("rest", vec![3i64, 4])
        .with("pair", Value::Tuple(vec![Value::Int(8), Value::Int(9)]));
    assert_eq!(render_with("{{ [1, 2, *rest] }}", &ctx).unwrap(), "[1, 2, 3, 4]");
    assert_eq!(render_with("{{ [*rest, *pair] }}", &ctx).unwrap(), "[3, 4, 8, 9]");
    assert_eq!(render_with("{{ (0, *rest) }}", &ctx).unwrap(), "(0, 3, 4)");
}

#[test]
fn test_set_spread_deduplicates_in_order() {
    let ctx = SimpleContext::new().with("more", vec![3i64, 1, 4]);
    assert_eq!(render_with("{{ {1, 2, *more} }}", &ctx).unwrap(), "{1, 2, 3, 4}");
}

#[test]
fn test_dict_spreads_later_keys_win() {
    assert_eq!(
        render_plain("{{ {'a': 1, **{'b': 2, 'c': 3}, 'd': 4, **{'b': 9}} }}"),
        "{'a': 1, 'b': 9, 'c': 3, 'd': 4}"
    );
}

#[test]
fn test_dict_spread_from_context() {
    let defaults = Value::dict_from_pairs([
        ("debug".into(), false.into()),
        ("level".into(), 1i64.into()),
    ]);
    let ctx = SimpleContext::new().with("defaults", defaults);
    assert_eq!(
        render_with("{{ {**defaults, 'debug': true} }}", &ctx).unwrap(),
        "{'debug': True, 'level': 1}"
    );
}

#[test]
fn test_spread_of_non_iterable_fails() {
    let ctx = SimpleContext::new().with("n", 5i64);
    let err = render_with("{{ [*n] }}", &ctx).unwrap_err();
    match err {
        RenderError::Eval(err) => assert_eq!(err.kind, EvalErrorKind::NotIterable),
        other => panic!("expected eval error, got {other:?}"),
    }
}

#[test]
fn test_unhashable_set_element_fails() {
    let err = render_with("{{ {[1]} }}", &SimpleContext::new()).unwrap_err();
    match err {
        RenderError::Eval(err) => {
            assert_eq!(err.kind, EvalErrorKind::TypeError);
            assert!(err.message.contains("unhashable"));
        }
        other => panic!("expected eval error, got {other:?}"),
    }
}

// ── Syntax errors ───────────────────────────────────────────────────────

#[test]
fn test_mismatched_spread_kinds() {
    let cases = [
        ("{{ [**x] }}", "unexpected '**' in list literal"),
        ("{{ {1, **x} }}", "unexpected '**' in set literal"),
        ("{{ {'a': 1, *x} }}", "unexpected '*' in dict literal"),
    ];
    for (source, message) in cases {
        match render_plain_err(source) {
            RenderError::Parse(err) => {
                assert_eq!(err.kind, ParseErrorKind::Syntax, "{source}");
                assert_eq!(err.message, message, "{source}");
                assert!(err.hint.is_some(), "{source}");
            }
            other => panic!("expected parse error for {source}, got {other:?}"),
        }
    }
}

#[test]
fn test_error_format_points_at_line() {
    let source = "header\n{{ [1, **x] }}";
    let err = match render_plain_err(source) {
        RenderError::Parse(err) => err,
        other => panic!("expected parse error, got {other:?}"),
    };
    assert_eq!(err.lineno(), 2);
    let formatted = err.format_with_source(source, Some("page.html"));
    assert!(formatted.contains("page.html:2:"));
    assert!(formatted.contains("hint:"));
}

fn render_plain_err(source: &str) -> RenderError {
    render_with(source, &SimpleContext::new()).unwrap_err()
}

// ── Constant folding ────────────────────────────────────────────────────

#[test]
fn test_as_const_of_literals() {
    let ctx = ConstContext::default();
    let expr = parse_expr("[1, *(2, 3), *{4}]").unwrap();
    assert_eq!(expr.as_const(&ctx).unwrap().repr(), "[1, 2, 3, 4]");

    let expr = parse_expr("{'a': 1, **{'a': 2}}").unwrap();
    assert_eq!(expr.as_const(&ctx).unwrap().repr(), "{'a': 2}");

    assert!(parse_expr("[x]").unwrap().as_const(&ctx).is_err());
    assert!(parse_expr("[n for n in (1, 2)]").unwrap().as_const(&ctx).is_err());
}

#[test]
fn test_compiled_expr_reuse() {
    let expr = CompiledExpr::compile("{**base, 'n': n}").unwrap();
    let registry = Registry::new();
    let base = Value::dict_from_pairs([("n".into(), 0i64.into())]);
    for n in 1..=3i64 {
        let ctx = SimpleContext::new().with("base", base.clone()).with("n", n);
        let value = expr.evaluate(&ctx, &registry).unwrap();
        assert_eq!(value.repr(), format!("{{'n': {n}}}"));
    }
}

#[test]
fn test_compiled_template_folds_constants() {
    let template = CompiledTemplate::compile("{{ [1, *[2]] }}-{{ [v] }}").unwrap();
    let source = template.generate_source(false);
    assert!(source.contains("yield str([1, 2])"));
    assert!(source.contains("yield str([context.resolve('v')])"));

    let ctx = SimpleContext::new().with("v", "x");
    assert_eq!(template.render(&ctx, &Registry::new()).unwrap(), "[1, 2]-['x']");
}

#[test]
fn test_oversized_repeat_is_left_for_render() {
    let template = CompiledTemplate::compile("{{ 'ab' * 4611686018427387904 }}").unwrap();
    assert!(template.generate_source(false).contains("yield str(('ab' * 4611686018427387904))"));

    let err = template.render(&SimpleContext::new(), &Registry::new()).unwrap_err();
    assert_eq!(err.kind, EvalErrorKind::ResourceLimit);
}
