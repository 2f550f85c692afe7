use std::sync::Arc;

use crate::value::Value;

/// 1-based source position, attached to the nodes that can fail at render
/// time so execution errors point back into the template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// One step of a reference chain. The chain is left-associative: the first
/// segment resolves against the namespace, every later one against the value
/// produced so far.
#[derive(Clone, Debug)]
pub enum Segment {
    /// `.name` (or the rooted name itself).
    Name(String),
    /// `.name(args)` — method or callable invocation.
    Call(String, Vec<Expr>),
    /// `[expr]`.
    Index(Expr),
}

#[derive(Clone, Debug)]
pub struct Path {
    pub segments: Vec<Segment>,
}

/// A `$name` / `${name.path|alt}` reference.
#[derive(Clone, Debug)]
pub struct Reference {
    pub quiet: bool,
    pub path: Path,
    /// Fallback expression from the `${path|alt}` braced form.
    pub alternate: Option<Box<Expr>>,
    /// Verbatim source text, emitted when a non-quiet lookup is missing.
    pub raw: String,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum InterpPart {
    Text(String),
    Reference(Reference),
}

#[derive(Clone, Debug)]
pub enum Expr {
    Literal(Value),
    Reference(Reference),
    /// Double-quoted string with embedded references.
    Interp(Vec<InterpPart>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Range(Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Body of a `#macro` or `#define`. Shared by `Arc` between the AST and the
/// values/macro-table entries that are created while rendering.
#[derive(Debug)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Block,
}

#[derive(Clone, Debug)]
pub enum Node {
    Text(String),
    Reference(Reference),
    If {
        branches: Vec<(Expr, Block)>,
        else_body: Option<Block>,
    },
    Foreach {
        var: String,
        iterable: Expr,
        body: Block,
        span: Span,
    },
    Set {
        target: Path,
        value: Expr,
        span: Span,
    },
    MacroDef(Arc<MacroDef>),
    MacroCall {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    Define(Arc<MacroDef>),
    Include {
        names: Vec<Expr>,
        span: Span,
    },
    Parse {
        name: Expr,
        span: Span,
    },
    Evaluate {
        source: Expr,
        span: Span,
    },
    Noescape(String),
    Stop,
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub nodes: Vec<Node>,
}

impl Block {
    /// Drops the horizontal whitespace a standalone directive line left at
    /// the end of the preceding text run (its indentation).
    pub(crate) fn trim_trailing_indent(&mut self) {
        if let Some(Node::Text(text)) = self.nodes.last_mut() {
            let keep = text.trim_end_matches([' ', '\t']).len();
            text.truncate(keep);
            if text.is_empty() {
                self.nodes.pop();
            }
        }
    }
}
