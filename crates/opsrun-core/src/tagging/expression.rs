use super::filter::{unescape, Symbol, TagFilter};
use super::Tags;
use crate::error::{OpsError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Node {
    Term(TagFilter),
    Group(Box<Sequence>),
}

/// Operands joined by operators, evaluated strictly in source order.
#[derive(Debug, Clone)]
struct Sequence {
    first: Node,
    rest: Vec<(Op, Node)>,
}

#[derive(Debug, Clone)]
enum Token {
    Term(Vec<Symbol>),
    Op(Op),
    Open,
    Close,
}

// ---------------------------------------------------------------------------
// TagFilterExpression
// ---------------------------------------------------------------------------

/// Boolean expression over tag terms: `term (('&'|'|') term)*` with groups.
///
/// `a | b & c` evaluates as `(a | b) & c`.
#[derive(Debug, Clone)]
pub struct TagFilterExpression {
    source: String,
    root: Sequence,
}

impl TagFilterExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut pos = 0;
        let root = parse_sequence(&tokens, &mut pos, expression)?;
        if pos != tokens.len() {
            return Err(OpsError::tag_filter(expression, "unbalanced ')'"));
        }
        Ok(TagFilterExpression {
            source: expression.to_string(),
            root,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, tags: &Tags) -> bool {
        self.root.eval(tags)
    }

    /// Tag names as written in the terms, wildcards included.
    pub fn get_filter_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        self.root.visit(&mut |f: &TagFilter| {
            keys.insert(f.name().to_string());
        });
        keys
    }

    /// Whether any term's name side matches `key`.
    pub fn references(&self, key: &str) -> bool {
        let mut found = false;
        self.root.visit(&mut |f: &TagFilter| found |= f.matches_name(key));
        found
    }
}

impl FromStr for TagFilterExpression {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        TagFilterExpression::parse(s)
    }
}

impl fmt::Display for TagFilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Sequence {
    fn eval(&self, tags: &Tags) -> bool {
        self.rest
            .iter()
            .fold(self.first.eval(tags), |acc, (op, node)| match op {
                Op::And => acc && node.eval(tags),
                Op::Or => acc || node.eval(tags),
            })
    }

    fn visit(&self, f: &mut dyn FnMut(&TagFilter)) {
        self.first.visit(f);
        for (_, node) in &self.rest {
            node.visit(f);
        }
    }
}

impl Node {
    fn eval(&self, tags: &Tags) -> bool {
        match self {
            Node::Term(filter) => filter.is_match(tags),
            Node::Group(seq) => seq.eval(tags),
        }
    }

    fn visit(&self, f: &mut dyn FnMut(&TagFilter)) {
        match self {
            Node::Term(filter) => f(filter),
            Node::Group(seq) => seq.visit(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut term: Vec<Symbol> = Vec::new();

    fn flush(term: &mut Vec<Symbol>, tokens: &mut Vec<Token>) {
        if term.iter().any(|(c, esc)| *esc || !c.is_whitespace()) {
            tokens.push(Token::Term(std::mem::take(term)));
        } else {
            term.clear();
        }
    }

    for symbol in unescape(expression, expression)? {
        let token = match symbol {
            ('&', false) => Some(Token::Op(Op::And)),
            ('|', false) => Some(Token::Op(Op::Or)),
            ('(', false) => Some(Token::Open),
            (')', false) => Some(Token::Close),
            _ => None,
        };
        match token {
            Some(token) => {
                flush(&mut term, &mut tokens);
                tokens.push(token);
            }
            None => term.push(symbol),
        }
    }
    flush(&mut term, &mut tokens);
    Ok(tokens)
}

fn parse_sequence(tokens: &[Token], pos: &mut usize, expression: &str) -> Result<Sequence> {
    let first = parse_operand(tokens, pos, expression)?;
    let mut rest = Vec::new();
    while let Some(Token::Op(op)) = tokens.get(*pos) {
        *pos += 1;
        rest.push((*op, parse_operand(tokens, pos, expression)?));
    }
    Ok(Sequence { first, rest })
}

fn parse_operand(tokens: &[Token], pos: &mut usize, expression: &str) -> Result<Node> {
    match tokens.get(*pos) {
        Some(Token::Term(symbols)) => {
            *pos += 1;
            Ok(Node::Term(TagFilter::from_symbols(symbols, expression)?))
        }
        Some(Token::Open) => {
            *pos += 1;
            let inner = parse_sequence(tokens, pos, expression)?;
            match tokens.get(*pos) {
                Some(Token::Close) => {
                    *pos += 1;
                    Ok(Node::Group(Box::new(inner)))
                }
                _ => Err(OpsError::tag_filter(expression, "missing ')'")),
            }
        }
        Some(Token::Op(_)) => Err(OpsError::tag_filter(expression, "operator without operand")),
        Some(Token::Close) => Err(OpsError::tag_filter(expression, "empty group")),
        None => Err(OpsError::tag_filter(expression, "expression ends without a term")),
    }
}
