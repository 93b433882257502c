//! Template and expression parser.
//!
//! Tokenization happens in [`lexer`] (pest). This module is a
//! recursive-descent parser over the token stream with a single token of
//! lookahead and no backtracking. Literal collections decide between plain
//! items and comprehension clauses after their first item, and braces
//! decide between set and dict after their first key.
//!
//! Use [`parse`] to convert template source into a [`Template`] AST and
//! [`parse_expr`] for a standalone expression.

mod lexer;

use crate::ast::expr::*;
use crate::ast::span::{Span, Spanned};
use crate::ast::template::*;
use crate::ast::value::Value;
use crate::error::ParseError;
use lexer::{Segment, Token, TokenKind};

/// Parse template source into a [`Template`] AST.
///
/// Parsing aborts at the first error. The returned [`ParseError`] carries
/// a source [`Span`](crate::Span) for diagnostic formatting.
pub fn parse(source: &str) -> Result<Template, ParseError> {
    let mut nodes = Vec::new();
    for segment in lexer::tokenize_template(source)? {
        match segment {
            Segment::Raw { text, span } => nodes.push(Spanned::new(NodeKind::Literal(text), span)),
            Segment::Block { tokens, span } => {
                let expr = TokenParser::new(&tokens).parse_complete()?;
                nodes.push(Spanned::new(NodeKind::Expression(expr), span));
            }
        }
    }
    Ok(Template { nodes })
}

/// Parse a standalone expression (no `{{ }}` delimiters).
///
/// This is the same grammar as an output block, so a bare comma list is
/// a tuple and `x for x in xs` is a generator.
///
/// ```rust
/// use weaver_comprehensions::{parse_expr, ExprKind};
///
/// let expr = parse_expr("{k: v for k, v in pairs}").unwrap();
/// assert!(matches!(expr.node, ExprKind::DictComprehension(_)));
///
/// let expr = parse_expr("{*a, *b}").unwrap();
/// assert!(matches!(expr.node, ExprKind::Set(_)));
/// ```
pub fn parse_expr(source: &str) -> Result<Expr, ParseError> {
    let tokens = lexer::tokenize_expression(source)?;
    TokenParser::new(&tokens).parse_complete()
}

// ── Parser state ────────────────────────────────────────────────────────

/// How a comma-separated item list is parsed by [`TokenParser::parse_tuple`].
#[derive(Clone, Copy)]
struct TupleOptions {
    /// Items are primaries only (assignment targets).
    simplified: bool,
    /// Items may be conditional expressions.
    with_condexpr: bool,
    /// The list sits directly inside `(` `)`, so it may be empty.
    explicit_parentheses: bool,
    /// A single item followed by `for` becomes a generator.
    with_comprehension: bool,
    /// Keywords that end the list in addition to `)` and end of input.
    extra_end: &'static [&'static str],
}

impl Default for TupleOptions {
    fn default() -> Self {
        Self {
            simplified: false,
            with_condexpr: true,
            explicit_parentheses: false,
            with_comprehension: true,
            extra_end: &[],
        }
    }
}

/// Set-versus-dict state of a brace literal.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BraceKind {
    Undetermined,
    Set,
    Dict,
}

struct TokenParser<'t> {
    tokens: &'t [Token],
    pos: usize,
    /// Span of the most recently consumed token.
    prev: Span,
}

impl<'t> TokenParser<'t> {
    /// `tokens` always ends with an `Eof` token.
    fn new(tokens: &'t [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            prev: tokens.first().map(|t| t.span).unwrap_or_default(),
        }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn look(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        self.prev = token.span;
        token
    }

    fn at_punct(&self, punct: &str) -> bool {
        matches!(self.current().kind, TokenKind::Punct(p) if p == punct)
    }

    fn at_name(&self, keyword: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Name(n) if n == keyword)
    }

    fn skip_punct(&mut self, punct: &str) -> bool {
        let hit = self.at_punct(punct);
        if hit {
            self.advance();
        }
        hit
    }

    fn skip_name(&mut self, keyword: &str) -> bool {
        let hit = self.at_name(keyword);
        if hit {
            self.advance();
        }
        hit
    }

    fn expect_punct(&mut self, punct: &str) -> Result<Token, ParseError> {
        if self.at_punct(punct) {
            Ok(self.advance())
        } else {
            Err(self.fail(format!(
                "expected token '{punct}', got '{}'",
                self.current().describe()
            )))
        }
    }

    fn expect_name(&mut self, keyword: &str) -> Result<Token, ParseError> {
        if self.at_name(keyword) {
            Ok(self.advance())
        } else {
            Err(self.fail(format!(
                "expected '{keyword}', got '{}'",
                self.current().describe()
            )))
        }
    }

    fn fail(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.current().span, message)
    }

    /// Span from `start` through the last consumed token.
    fn finish(&self, start: Span) -> Span {
        start.merge(self.prev)
    }

    fn is_tuple_end(&self, extra_end: &[&str]) -> bool {
        match &self.current().kind {
            TokenKind::Eof => true,
            TokenKind::Punct(")") => true,
            TokenKind::Name(name) => extra_end.contains(&name.as_str()),
            _ => false,
        }
    }

    /// An output block or standalone expression: a tuple-level expression
    /// that must consume every token.
    fn parse_complete(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_tuple(TupleOptions::default())?;
        if self.current().kind != TokenKind::Eof {
            return Err(self.fail(format!(
                "expected end of expression, got '{}'",
                self.current().describe()
            )));
        }
        Ok(expr)
    }

    // ── Tuples, generators and assignment targets ───────────────────────

    /// Comma-separated items. One item without a trailing comma is that
    /// item; one item followed by `for` is a generator.
    fn parse_tuple(&mut self, opts: TupleOptions) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut items: Vec<ScalarItem> = Vec::new();
        let mut is_tuple = false;

        loop {
            if !items.is_empty() {
                self.expect_punct(",")?;
            }
            if self.is_tuple_end(opts.extra_end) {
                break;
            }

            let item = if opts.with_condexpr && !opts.simplified && self.at_punct("*") {
                ScalarItem::Spread(self.parse_spread_scalars()?)
            } else if opts.simplified {
                ScalarItem::Expr(self.parse_primary()?)
            } else if opts.with_condexpr {
                ScalarItem::Expr(self.parse_expression()?)
            } else {
                ScalarItem::Expr(self.parse_or()?)
            };

            if self.at_punct(",") {
                is_tuple = true;
                items.push(item);
            } else if opts.with_comprehension && items.is_empty() && self.at_name("for") {
                let result = self.comprehension_result(item)?;
                self.advance();
                let clauses = self.parse_comprehension()?;
                return Ok(Spanned::new(
                    ExprKind::Generator(Comprehension {
                        result: Box::new(result),
                        clauses,
                    }),
                    self.finish(start),
                ));
            } else {
                items.push(item);
                break;
            }
        }

        if !is_tuple {
            match items.pop() {
                Some(ScalarItem::Expr(expr)) => return Ok(expr),
                Some(ScalarItem::Spread(spread)) => {
                    return Err(ParseError::new(
                        spread.span,
                        "can't use starred expression here",
                    ));
                }
                None if !opts.explicit_parentheses => {
                    return Err(self.fail(format!(
                        "Expected an expression, got '{}'",
                        self.current().describe()
                    )));
                }
                None => {}
            }
        }

        Ok(Spanned::new(
            ExprKind::Tuple {
                items,
                ctx: ExprContext::Load,
            },
            self.finish(start),
        ))
    }

    /// A name or (nested) tuple of names, rewritten into store context.
    fn parse_assign_target(&mut self, extra_end: &'static [&'static str]) -> Result<Expr, ParseError> {
        let target = self.parse_tuple(TupleOptions {
            simplified: true,
            with_comprehension: false,
            extra_end,
            ..TupleOptions::default()
        })?;
        if !target.node.can_assign() {
            return Err(ParseError::new(
                target.span,
                format!("can't assign to {}", target.node.describe()),
            ));
        }
        Ok(target.map(ExprKind::into_store))
    }

    // ── Comprehensions ──────────────────────────────────────────────────

    /// Parse the clause chain after the first `for` has been consumed.
    /// Stops before the closing delimiter, which the caller consumes.
    fn parse_comprehension(&mut self) -> Result<Vec<ComprehensionClause>, ParseError> {
        let mut clauses = Vec::new();
        loop {
            let start = self.prev;
            let target = self.parse_assign_target(&["in"])?;
            self.expect_name("in")?;
            let iter = self.parse_tuple(TupleOptions {
                with_condexpr: false,
                with_comprehension: false,
                extra_end: &["if"],
                ..TupleOptions::default()
            })?;
            let cond = if self.skip_name("if") {
                Some(self.parse_expression()?)
            } else {
                None
            };
            clauses.push(ComprehensionClause {
                target,
                iter,
                cond,
                span: self.finish(start),
            });

            if !self.skip_name("for") {
                break;
            }
        }
        Ok(clauses)
    }

    fn comprehension_result(&self, item: ScalarItem) -> Result<Expr, ParseError> {
        match item {
            ScalarItem::Expr(expr) => Ok(expr),
            ScalarItem::Spread(spread) => Err(ParseError::new(
                spread.span,
                "iterable unpacking cannot be used in comprehension",
            )),
        }
    }

    fn parse_spread_scalars(&mut self) -> Result<SpreadScalars, ParseError> {
        let start = self.expect_punct("*")?.span;
        let node = self.parse_expression()?;
        Ok(SpreadScalars {
            node: Box::new(node),
            span: self.finish(start),
        })
    }

    // ── Literal collections ─────────────────────────────────────────────

    fn parse_list(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect_punct("[")?.span;
        let mut items: Vec<ScalarItem> = Vec::new();

        while !self.at_punct("]") {
            if !items.is_empty() {
                if items.len() == 1 && self.skip_name("for") {
                    let result = self.comprehension_result(items.remove(0))?;
                    let clauses = self.parse_comprehension()?;
                    self.expect_punct("]")?;
                    return Ok(Spanned::new(
                        ExprKind::ListComprehension(Comprehension {
                            result: Box::new(result),
                            clauses,
                        }),
                        self.finish(start),
                    ));
                }
                self.expect_punct(",")?;
            }
            if self.at_punct("]") {
                break;
            }
            if self.at_punct("**") {
                return Err(self
                    .fail("unexpected '**' in list literal")
                    .with_hint("'**' spreads mappings and is only valid inside a dict literal"));
            }

            let item = if self.at_punct("*") {
                ScalarItem::Spread(self.parse_spread_scalars()?)
            } else {
                ScalarItem::Expr(self.parse_expression()?)
            };
            items.push(item);
        }

        self.expect_punct("]")?;
        Ok(Spanned::new(ExprKind::List(items), self.finish(start)))
    }

    /// `{...}`: the first item fixes set versus dict. `{}` is a dict.
    fn parse_dict(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect_punct("{")?.span;
        let mut kind = BraceKind::Undetermined;
        let mut set_items: Vec<ScalarItem> = Vec::new();
        let mut dict_items: Vec<DictItem> = Vec::new();

        while !self.at_punct("}") {
            let count = set_items.len() + dict_items.len();
            if count > 0 {
                if count == 1 && self.skip_name("for") {
                    let node = if kind == BraceKind::Set {
                        let result = self.comprehension_result(set_items.remove(0))?;
                        let clauses = self.parse_comprehension()?;
                        ExprKind::SetComprehension(Comprehension {
                            result: Box::new(result),
                            clauses,
                        })
                    } else {
                        let pair = match dict_items.remove(0) {
                            DictItem::Pair(pair) => pair,
                            DictItem::Spread(spread) => {
                                return Err(ParseError::new(
                                    spread.span,
                                    "dict unpacking cannot be used in dict comprehension",
                                ));
                            }
                        };
                        let clauses = self.parse_comprehension()?;
                        ExprKind::DictComprehension(Comprehension {
                            result: Box::new(pair),
                            clauses,
                        })
                    };
                    self.expect_punct("}")?;
                    return Ok(Spanned::new(node, self.finish(start)));
                }
                self.expect_punct(",")?;
            }
            if self.at_punct("}") {
                break;
            }

            if self.at_punct("**") {
                if kind == BraceKind::Set {
                    return Err(self
                        .fail("unexpected '**' in set literal")
                        .with_hint("'**' spreads mappings; use '*' to spread into a set"));
                }
                let spread_start = self.advance().span;
                let node = self.parse_expression()?;
                kind = BraceKind::Dict;
                dict_items.push(DictItem::Spread(SpreadPairs {
                    node: Box::new(node),
                    span: self.finish(spread_start),
                }));
                continue;
            }
            if self.at_punct("*") {
                if kind == BraceKind::Dict {
                    return Err(self
                        .fail("unexpected '*' in dict literal")
                        .with_hint("'*' spreads scalars; use '**' to merge a mapping"));
                }
                kind = BraceKind::Set;
                set_items.push(ScalarItem::Spread(self.parse_spread_scalars()?));
                continue;
            }

            let key = self.parse_expression()?;
            if kind == BraceKind::Undetermined {
                kind = if self.at_punct(":") {
                    BraceKind::Dict
                } else {
                    BraceKind::Set
                };
            }
            if kind == BraceKind::Set {
                set_items.push(ScalarItem::Expr(key));
            } else {
                self.expect_punct(":")?;
                let value = self.parse_expression()?;
                let span = key.span.merge(self.prev);
                dict_items.push(DictItem::Pair(Pair { key, value, span }));
            }
        }

        self.expect_punct("}")?;
        let node = match kind {
            BraceKind::Set => ExprKind::Set(set_items),
            BraceKind::Dict | BraceKind::Undetermined => ExprKind::Dict(dict_items),
        };
        Ok(Spanned::new(node, self.finish(start)))
    }

    // ── Operators, lowest precedence first ──────────────────────────────

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_condexpr()
    }

    fn parse_condexpr(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut expr1 = self.parse_or()?;
        while self.skip_name("if") {
            let test = self.parse_or()?;
            let expr2 = if self.skip_name("else") {
                Some(Box::new(self.parse_condexpr()?))
            } else {
                None
            };
            expr1 = Spanned::new(
                ExprKind::CondExpr {
                    test: Box::new(test),
                    expr1: Box::new(expr1),
                    expr2,
                },
                self.finish(start),
            );
        }
        Ok(expr1)
    }

    fn binary(&self, left: Expr, op: BinOp, right: Expr, start: Span) -> Expr {
        Spanned::new(
            ExprKind::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            self.finish(start),
        )
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut left = self.parse_and()?;
        while self.skip_name("or") {
            let right = self.parse_and()?;
            left = self.binary(left, BinOp::Or, right, start);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut left = self.parse_not()?;
        while self.skip_name("and") {
            let right = self.parse_not()?;
            left = self.binary(left, BinOp::And, right, start);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        if self.skip_name("not") {
            let operand = self.parse_not()?;
            return Ok(Spanned::new(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                self.finish(start),
            ));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let expr = self.parse_math1()?;
        let mut ops = Vec::new();
        loop {
            let op = match &self.current().kind {
                TokenKind::Punct("==") => CmpOp::Eq,
                TokenKind::Punct("!=") => CmpOp::NotEq,
                TokenKind::Punct("<") => CmpOp::Lt,
                TokenKind::Punct(">") => CmpOp::Gt,
                TokenKind::Punct("<=") => CmpOp::LtEq,
                TokenKind::Punct(">=") => CmpOp::GtEq,
                TokenKind::Name(n) if n == "in" => CmpOp::In,
                TokenKind::Name(n)
                    if n == "not" && matches!(&self.look().kind, TokenKind::Name(m) if m == "in") =>
                {
                    self.advance();
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.advance();
            let operand = self.parse_math1()?;
            ops.push(Operand { op, expr: operand });
        }
        if ops.is_empty() {
            return Ok(expr);
        }
        Ok(Spanned::new(
            ExprKind::Compare {
                expr: Box::new(expr),
                ops,
            },
            self.finish(start),
        ))
    }

    fn parse_math1(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Punct("+") => BinOp::Add,
                TokenKind::Punct("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat()?;
            left = self.binary(left, op, right, start);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut left = self.parse_math2()?;
        while self.skip_punct("~") {
            let right = self.parse_math2()?;
            left = self.binary(left, BinOp::Concat, right, start);
        }
        Ok(left)
    }

    fn parse_math2(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Punct("*") => BinOp::Mul,
                TokenKind::Punct("/") => BinOp::Div,
                TokenKind::Punct("//") => BinOp::FloorDiv,
                TokenKind::Punct("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_pow()?;
            left = self.binary(left, op, right, start);
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let mut left = self.parse_unary()?;
        while self.skip_punct("**") {
            let right = self.parse_unary()?;
            left = self.binary(left, BinOp::Pow, right, start);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let start = self.current().span;
        let op = match self.current().kind {
            TokenKind::Punct("-") => Some(UnaryOp::Neg),
            TokenKind::Punct("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        let node = match op {
            Some(op) => {
                self.advance();
                let operand = self.parse_unary()?;
                Spanned::new(
                    ExprKind::UnaryOp {
                        op,
                        operand: Box::new(operand),
                    },
                    self.finish(start),
                )
            }
            None => self.parse_primary()?,
        };
        self.parse_postfix(node, start)
    }

    // ── Primaries and postfix operators ─────────────────────────────────

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.current().clone();
        let start = token.span;
        let node = match token.kind {
            TokenKind::Name(name) => {
                self.advance();
                match name.as_str() {
                    "true" | "True" => ExprKind::Const(Value::Bool(true)),
                    "false" | "False" => ExprKind::Const(Value::Bool(false)),
                    "none" | "None" => ExprKind::Const(Value::None),
                    _ => ExprKind::Name {
                        name,
                        ctx: ExprContext::Load,
                    },
                }
            }
            TokenKind::Str(mut text) => {
                self.advance();
                while let TokenKind::Str(next) = &self.current().kind {
                    text.push_str(next);
                    self.advance();
                }
                ExprKind::Const(Value::String(text))
            }
            TokenKind::Int(n) => {
                self.advance();
                ExprKind::Const(Value::Int(n))
            }
            TokenKind::Float(f) => {
                self.advance();
                ExprKind::Const(Value::Float(f))
            }
            TokenKind::Punct("(") => {
                self.advance();
                let mut inner = self.parse_tuple(TupleOptions {
                    explicit_parentheses: true,
                    ..TupleOptions::default()
                })?;
                self.expect_punct(")")?;
                if matches!(inner.node, ExprKind::Tuple { .. } | ExprKind::Generator(_)) {
                    inner.span = self.finish(start);
                }
                return Ok(inner);
            }
            TokenKind::Punct("[") => return self.parse_list(),
            TokenKind::Punct("{") => return self.parse_dict(),
            _ => {
                return Err(self.fail(format!("unexpected '{}'", token.describe())));
            }
        };
        Ok(Spanned::new(node, self.finish(start)))
    }

    fn parse_postfix(&mut self, mut node: Expr, start: Span) -> Result<Expr, ParseError> {
        loop {
            if self.skip_punct(".") {
                let token = self.advance();
                let kind = match token.kind {
                    TokenKind::Name(attr) => ExprKind::Getattr {
                        node: Box::new(node),
                        attr,
                    },
                    TokenKind::Int(index) => ExprKind::Getitem {
                        node: Box::new(node),
                        arg: Box::new(Spanned::new(ExprKind::Const(Value::Int(index)), token.span)),
                    },
                    _ => {
                        return Err(ParseError::new(
                            token.span,
                            format!("expected name or number, got '{}'", token.describe()),
                        ));
                    }
                };
                node = Spanned::new(kind, self.finish(start));
            } else if self.skip_punct("[") {
                let arg = self.parse_expression()?;
                self.expect_punct("]")?;
                node = Spanned::new(
                    ExprKind::Getitem {
                        node: Box::new(node),
                        arg: Box::new(arg),
                    },
                    self.finish(start),
                );
            } else if self.at_punct("(") {
                let call = self.parse_call_args(node)?;
                node = Spanned::new(ExprKind::Call(call), self.finish(start));
            } else {
                return Ok(node);
            }
        }
    }

    /// Call arguments: positional, `key=value`, `*args`, `**kwargs`, and a
    /// sole unparenthesized generator argument.
    fn parse_call_args(&mut self, callee: Expr) -> Result<Call, ParseError> {
        let open = self.expect_punct("(")?.span;
        let mut args: Vec<Expr> = Vec::new();
        let mut kwargs: Vec<Keyword> = Vec::new();
        let mut dyn_args: Option<Box<Expr>> = None;
        let mut dyn_kwargs: Option<Box<Expr>> = None;
        let mut require_comma = false;

        let ensure = |ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ParseError::new(open, "invalid syntax for function call expression"))
            }
        };

        while !self.at_punct(")") {
            if require_comma {
                self.expect_punct(",")?;
                // trailing comma
                if self.at_punct(")") {
                    break;
                }
            }

            if self.at_punct("*") {
                ensure(dyn_args.is_none() && dyn_kwargs.is_none())?;
                self.advance();
                dyn_args = Some(Box::new(self.parse_expression()?));
            } else if self.at_punct("**") {
                ensure(dyn_kwargs.is_none())?;
                self.advance();
                dyn_kwargs = Some(Box::new(self.parse_expression()?));
            } else if let TokenKind::Name(key) = &self.current().kind
                && matches!(self.look().kind, TokenKind::Punct("="))
            {
                let key = key.clone();
                ensure(dyn_kwargs.is_none())?;
                self.advance();
                self.advance();
                let value = self.parse_expression()?;
                kwargs.push(Keyword { key, value });
            } else {
                ensure(dyn_args.is_none() && dyn_kwargs.is_none() && kwargs.is_empty())?;
                let arg = self.parse_expression()?;
                if args.is_empty() && self.skip_name("for") {
                    let start = arg.span;
                    let clauses = self.parse_comprehension()?;
                    if !self.at_punct(")") {
                        return Err(self.fail("Generator expression must be parenthesized"));
                    }
                    args.push(Spanned::new(
                        ExprKind::Generator(Comprehension {
                            result: Box::new(arg),
                            clauses,
                        }),
                        self.finish(start),
                    ));
                } else {
                    args.push(arg);
                }
            }

            require_comma = true;
        }

        self.expect_punct(")")?;
        Ok(Call {
            node: Box::new(callee),
            args,
            kwargs,
            dyn_args,
            dyn_kwargs,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> ExprKind {
        parse_expr(source).expect("parse failed").node
    }

    fn error(source: &str) -> ParseError {
        parse_expr(source).expect_err("expected a parse error")
    }

    fn name_of(expr: &Expr) -> &str {
        match &expr.node {
            ExprKind::Name { name, .. } => name,
            other => panic!("expected name, got {other:?}"),
        }
    }

    #[test]
    fn test_template_segments() {
        let template = parse("Hello, {{ name }}!").unwrap();
        assert_eq!(template.nodes.len(), 3);
        assert!(matches!(&template.nodes[0].node, NodeKind::Literal(t) if t == "Hello, "));
        assert!(matches!(&template.nodes[2].node, NodeKind::Literal(t) if t == "!"));
    }

    #[test]
    fn test_list_with_spreads() {
        let ExprKind::List(items) = expr("[1, *rest, 3,]") else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[1], ScalarItem::Spread(s) if name_of(&s.node) == "rest"));
    }

    #[test]
    fn test_brace_kind_follows_first_item() {
        assert!(matches!(expr("{}"), ExprKind::Dict(items) if items.is_empty()));
        assert!(matches!(expr("{1}"), ExprKind::Set(_)));
        assert!(matches!(expr("{*a}"), ExprKind::Set(_)));
        assert!(matches!(expr("{**a}"), ExprKind::Dict(_)));
        let ExprKind::Dict(items) = expr("{'a': 1, **b}") else {
            panic!("expected dict");
        };
        assert!(matches!(items[0], DictItem::Pair(_)));
        assert!(matches!(items[1], DictItem::Spread(_)));
    }

    #[test]
    fn test_mismatched_spreads_are_rejected() {
        let err = error("{1, **a}");
        assert!(err.message.contains("'**' in set literal"), "{}", err.message);
        let err = error("{'a': 1, *b}");
        assert!(err.message.contains("'*' in dict literal"), "{}", err.message);
        let err = error("{**a, 1}");
        assert!(err.message.contains("expected token ':'"), "{}", err.message);
        let err = error("[1, **a]");
        assert_eq!(err.span.start, 4);
    }

    #[test]
    fn test_comprehension_kinds() {
        assert!(matches!(expr("[x for x in xs]"), ExprKind::ListComprehension(_)));
        assert!(matches!(expr("{x for x in xs}"), ExprKind::SetComprehension(_)));
        assert!(matches!(expr("{x: 1 for x in xs}"), ExprKind::DictComprehension(_)));
        assert!(matches!(expr("(x for x in xs)"), ExprKind::Generator(_)));
        assert!(matches!(expr("x for x in xs"), ExprKind::Generator(_)));
    }

    #[test]
    fn test_clauses_nest_outermost_first() {
        let ExprKind::ListComprehension(comp) = expr("[n for l in ls if l for n in l if n > 1]") else {
            panic!("expected list comprehension");
        };
        assert_eq!(comp.clauses.len(), 2);
        assert_eq!(name_of(&comp.clauses[0].target), "l");
        assert_eq!(name_of(&comp.clauses[0].iter), "ls");
        assert!(comp.clauses[0].cond.is_some());
        assert_eq!(name_of(&comp.clauses[1].target), "n");
        assert!(matches!(
            comp.clauses[1].cond.as_ref().map(|c| &c.node),
            Some(ExprKind::Compare { .. })
        ));
    }

    #[test]
    fn test_tuple_targets_are_store_context() {
        let ExprKind::DictComprehension(comp) = expr("{k: v for k, (v, w) in items}") else {
            panic!("expected dict comprehension");
        };
        let ExprKind::Tuple { items, ctx } = &comp.clauses[0].target.node else {
            panic!("expected tuple target");
        };
        assert_eq!(*ctx, ExprContext::Store);
        let ScalarItem::Expr(inner) = &items[1] else {
            panic!("expected nested target");
        };
        assert!(matches!(inner.node, ExprKind::Tuple { ctx: ExprContext::Store, .. }));
    }

    #[test]
    fn test_invalid_targets() {
        assert_eq!(error("[x for 1 in xs]").message, "can't assign to literal");
        assert_eq!(error("[x for [a] in xs]").message, "can't assign to list");
        assert!(error("[x for f() in xs]").message.contains("expected 'in'"));
    }

    #[test]
    fn test_empty_expression() {
        let err = parse("{{ }}").unwrap_err();
        assert_eq!(err.message, "Expected an expression, got 'end of expression'");
        assert!(matches!(expr("()"), ExprKind::Tuple { items, .. } if items.is_empty()));
    }

    #[test]
    fn test_parenthesized_boundary() {
        assert!(matches!(expr("(x)"), ExprKind::Name { .. }));
        assert!(matches!(expr("(x,)"), ExprKind::Tuple { items, .. } if items.len() == 1));
        assert!(matches!(expr("(x for x in y)"), ExprKind::Generator(_)));
        assert!(matches!(expr("1, 2"), ExprKind::Tuple { items, .. } if items.len() == 2));
    }

    #[test]
    fn test_call_generator_shorthand() {
        let ExprKind::Call(call) = expr("sum(x * 2 for x in xs if x)") else {
            panic!("expected call");
        };
        assert_eq!(call.args.len(), 1);
        assert!(matches!(call.args[0].node, ExprKind::Generator(_)));

        let err = error("f(x for x in xs, 1)");
        assert_eq!(err.message, "Generator expression must be parenthesized");
        assert!(error("f(a, x for x in xs)").message.contains("expected token ','"));
    }

    #[test]
    fn test_call_arguments() {
        let ExprKind::Call(call) = expr("f(1, key=2, *rest, **opts,)") else {
            panic!("expected call");
        };
        assert_eq!(call.args.len(), 1);
        assert_eq!(call.kwargs[0].key, "key");
        assert!(call.dyn_args.is_some());
        assert!(call.dyn_kwargs.is_some());
        assert_eq!(
            error("f(key=1, 2)").message,
            "invalid syntax for function call expression"
        );
    }

    #[test]
    fn test_operator_precedence() {
        let ExprKind::BinaryOp { op, right, .. } = expr("1 + 2 * 3") else {
            panic!("expected binary op");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(right.node, ExprKind::BinaryOp { op: BinOp::Mul, .. }));

        let ExprKind::Compare { ops, .. } = expr("a not in b") else {
            panic!("expected comparison");
        };
        assert_eq!(ops[0].op, CmpOp::NotIn);

        assert!(matches!(
            expr("not a in b"),
            ExprKind::UnaryOp { op: UnaryOp::Not, .. }
        ));
        assert!(matches!(expr("a if b else c"), ExprKind::CondExpr { .. }));
    }

    #[test]
    fn test_postfix_chain() {
        let ExprKind::Getattr { node, attr } = expr("data.items()[0].x") else {
            panic!("expected attribute access");
        };
        assert_eq!(attr, "x");
        let ExprKind::Getitem { node, .. } = node.node else {
            panic!("expected subscript");
        };
        assert!(matches!(node.node, ExprKind::Call(_)));
        assert!(matches!(expr("t.0"), ExprKind::Getitem { .. }));
    }

    #[test]
    fn test_adjacent_strings_concatenate() {
        assert_eq!(expr("'a' \"b\""), ExprKind::Const(Value::from("ab")));
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        let err = error("a b");
        assert_eq!(err.message, "expected end of expression, got 'b'");
    }

    #[test]
    fn test_parsing_is_idempotent() {
        let source = "{{ {'a': 1, **b} }} and {{ [n for l in ls for n in l if n] }} {{ f(x for x in y) }}";
        assert_eq!(parse(source).unwrap(), parse(source).unwrap());
    }

    #[test]
    fn test_error_lines() {
        let err = parse("line one\n{{ [x for 1 in y] }}").unwrap_err();
        assert_eq!(err.lineno(), 2);
    }
}
