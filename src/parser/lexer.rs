//! Tokenizer, built on [pest](https://pest.rs/).
//!
//! The grammar in `weaver.pest` splits a template into raw text and
//! `{{ ... }}` blocks and balances delimiters inside each block. This
//! module flattens pest's tree of groups into a linear [`Token`] stream
//! for the recursive-descent parser.

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::ast::span::Span;
use crate::error::ParseError;

#[derive(Parser)]
#[grammar = "parser/weaver.pest"]
struct WeaverLexer;

const PUNCTUATION: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "~", "<", ">", "=", ".", ",",
    ":", "|", "(", ")", "[", "]", "{", "}",
];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    /// Token description for error messages.
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Name(name) => name.clone(),
            TokenKind::Str(_) => "string".to_string(),
            TokenKind::Int(_) => "integer".to_string(),
            TokenKind::Float(_) => "float".to_string(),
            TokenKind::Punct(p) => (*p).to_string(),
            TokenKind::Eof => "end of expression".to_string(),
        }
    }
}

/// A top-level piece of a template.
#[derive(Debug)]
pub enum Segment {
    Raw { text: String, span: Span },
    Block { tokens: Vec<Token>, span: Span },
}

/// Byte offsets of every line start, for mapping offsets to line numbers
/// without rescanning the source.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    /// 1-based line containing `offset`.
    fn line(&self, offset: usize) -> usize {
        self.starts.partition_point(|&start| start <= offset)
    }

    fn span(&self, pair: &Pair<Rule>) -> Span {
        let s = pair.as_span();
        Span::new(s.start(), s.end(), self.line(s.start()))
    }
}

/// Split a template into raw text and tokenized output blocks.
pub fn tokenize_template(source: &str) -> Result<Vec<Segment>, ParseError> {
    let pairs = WeaverLexer::parse(Rule::template, source).map_err(to_parse_error)?;
    let lines = LineIndex::new(source);
    let mut segments = Vec::new();

    for pair in pairs.flat_map(|template| template.into_inner()) {
        let span = lines.span(&pair);
        match pair.as_rule() {
            Rule::raw_text => segments.push(Segment::Raw {
                text: pair.as_str().to_string(),
                span,
            }),
            Rule::block => {
                let mut tokens = Vec::new();
                for inner in pair.into_inner() {
                    flatten(inner, &lines, &mut tokens)?;
                }
                // Eof sits on the closing `}}`.
                let close_start = span.end.saturating_sub(2);
                let close = Span::new(close_start, span.end, lines.line(close_start));
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    span: close,
                });
                segments.push(Segment::Block { tokens, span });
            }
            _ => {}
        }
    }

    Ok(segments)
}

/// Tokenize a standalone expression.
pub fn tokenize_expression(source: &str) -> Result<Vec<Token>, ParseError> {
    let pairs = WeaverLexer::parse(Rule::expression_source, source).map_err(to_parse_error)?;
    let lines = LineIndex::new(source);
    let mut tokens = Vec::new();
    for pair in pairs {
        for inner in pair.into_inner() {
            if inner.as_rule() == Rule::token_seq {
                flatten(inner, &lines, &mut tokens)?;
            }
        }
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(source.len(), source.len(), lines.line(source.len())),
    });
    Ok(tokens)
}

fn to_parse_error(e: pest::error::Error<Rule>) -> ParseError {
    let (start, end) = match e.location {
        pest::error::InputLocation::Pos(p) => (p, p + 1),
        pest::error::InputLocation::Span((s, e)) => (s, e),
    };
    let line = match e.line_col {
        pest::error::LineColLocation::Pos((line, _)) => line,
        pest::error::LineColLocation::Span((line, _), _) => line,
    };
    ParseError::tokenize(
        Span::new(start, end, line),
        format!("tokenize error: {}", e.variant.message()),
    )
    .with_hint("check for unbalanced brackets, unterminated strings or a missing '}}'")
}

fn punct(text: &str, span: Span) -> Result<Token, ParseError> {
    PUNCTUATION
        .iter()
        .find(|p| **p == text)
        .copied()
        .map(|p| Token {
            kind: TokenKind::Punct(p),
            span,
        })
        .ok_or_else(|| ParseError::tokenize(span, format!("unknown operator '{text}'")))
}

fn flatten(pair: Pair<Rule>, lines: &LineIndex, out: &mut Vec<Token>) -> Result<(), ParseError> {
    let span = lines.span(&pair);
    match pair.as_rule() {
        Rule::token_seq => {
            for inner in pair.into_inner() {
                flatten(inner, lines, out)?;
            }
        }
        Rule::paren_group | Rule::bracket_group | Rule::brace_group => {
            let text = pair.as_str();
            let open = &text[..1];
            let close = &text[text.len() - 1..];
            let close_line = lines.line(span.end - 1);
            out.push(punct(open, Span::new(span.start, span.start + 1, span.line))?);
            for inner in pair.into_inner() {
                flatten(inner, lines, out)?;
            }
            out.push(punct(close, Span::new(span.end - 1, span.end, close_line))?);
        }
        Rule::name => out.push(Token {
            kind: TokenKind::Name(pair.as_str().to_string()),
            span,
        }),
        Rule::string => out.push(Token {
            kind: TokenKind::Str(unescape(pair.as_str())),
            span,
        }),
        Rule::integer => {
            let digits = pair.as_str().replace('_', "");
            let value = digits.parse::<i64>().map_err(|_| {
                ParseError::tokenize(span, format!("integer literal {digits} is too large"))
            })?;
            out.push(Token {
                kind: TokenKind::Int(value),
                span,
            });
        }
        Rule::float => {
            let digits = pair.as_str().replace('_', "");
            let value = digits.parse::<f64>().map_err(|_| {
                ParseError::tokenize(span, format!("invalid float literal {digits}"))
            })?;
            out.push(Token {
                kind: TokenKind::Float(value),
                span,
            });
        }
        Rule::operator => out.push(punct(pair.as_str(), span)?),
        _ => {}
    }
    Ok(())
}

/// Strip the quotes of a string literal and resolve escapes. Unknown
/// escapes keep their backslash.
fn unescape(literal: &str) -> String {
    let body = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(c @ ('\\' | '\'' | '"')) => out.push(c),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize_expression(source)
            .expect("tokenize failed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_operators_prefer_longest_match() {
        assert_eq!(
            kinds("a ** b // c"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Punct("**"),
                TokenKind::Name("b".into()),
                TokenKind::Punct("//"),
                TokenKind::Name("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"1_000 2.5 1e3 'it\'s' "a\nb""#),
            vec![
                TokenKind::Int(1000),
                TokenKind::Float(2.5),
                TokenKind::Float(1000.0),
                TokenKind::Str("it's".into()),
                TokenKind::Str("a\nb".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_braces_inside_block_do_not_close_it() {
        let segments = tokenize_template("a {{ {'k': {'n': 1}}}} b").unwrap();
        assert_eq!(segments.len(), 3);
        let Segment::Block { tokens, .. } = &segments[1] else {
            panic!("expected block");
        };
        let closes = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Punct("}"))
            .count();
        assert_eq!(closes, 2);
    }

    #[test]
    fn test_unbalanced_delimiters_fail() {
        let err = tokenize_template("{{ [1, 2 }}").unwrap_err();
        assert_eq!(err.kind, crate::error::ParseErrorKind::Tokenize);
        assert!(tokenize_template("{{ 'open }}").is_err());
    }

    #[test]
    fn test_line_index() {
        let lines = LineIndex::new("a\nbc\n\nd");
        assert_eq!(lines.line(0), 1);
        assert_eq!(lines.line(1), 1);
        assert_eq!(lines.line(2), 2);
        assert_eq!(lines.line(5), 3);
        assert_eq!(lines.line(6), 4);
        assert_eq!(lines.line(100), 4);
    }

    #[test]
    fn test_multiline_group_closes_on_its_own_line() {
        let tokens = tokenize_expression("[1,\n 2\n]").unwrap();
        let lines: Vec<usize> = tokens.iter().map(|t| t.span.line).collect();
        assert_eq!(lines, vec![1, 1, 1, 2, 3, 3]);
    }

    #[test]
    fn test_spans_carry_lines() {
        let segments = tokenize_template("one\ntwo {{ x }}").unwrap();
        let Segment::Block { tokens, .. } = &segments[1] else {
            panic!("expected block");
        };
        assert_eq!(tokens[0].span.line, 2);
        assert_eq!(tokens[0].span.start, 11);
    }
}
