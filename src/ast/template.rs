use super::expr::Expr;
use super::span::Spanned;

/// A template is the top-level AST unit. It contains a sequence of nodes
/// whose evaluated string outputs are concatenated to produce the final result.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub nodes: Vec<Node>,
}

pub type Node = Spanned<NodeKind>;

/// The kinds of content that can appear in a template.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Raw text between output blocks.
    /// For example, `"Hello, "` in `Hello, {{ name }}`.
    Literal(String),

    /// An `{{ expression }}` output block. The evaluated result is
    /// converted to a string via [`Value::to_output_string`](crate::Value::to_output_string).
    Expression(Expr),
}

impl Template {
    /// Iterate over the output expressions in source order.
    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        self.nodes.iter().filter_map(|node| match &node.node {
            NodeKind::Expression(expr) => Some(expr),
            NodeKind::Literal(_) => None,
        })
    }
}
