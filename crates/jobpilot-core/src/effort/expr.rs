//! Restricted predicate expression language for effort policy rules.
//!
//! The grammar is total and side-effect free: comparisons (`<`, `<=`, `==`,
//! `>=`, `>`, `!=`), boolean `and` / `or` / `not`, membership (`in` over a
//! literal list), parentheses, numeric and string literals, and identifiers
//! resolved only from the frozen evaluation context. There are no function
//! calls, no assignment, and no loops, so evaluation always terminates.
//!
//! Precedence, tightest first: `not`, comparison, `and`, `or`.
//!
//! Identifiers are validated against the allowed variable set at policy load
//! time; evaluation never sees an unknown name unless the caller builds its
//! own context.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A value in the evaluation context or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Numeric value; all numbers are f64.
    Number(f64),
    /// String value.
    Text(String),
    /// Boolean value.
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `<`
    Lt,
    /// `<=` (also `≤`)
    Le,
    /// `==`
    Eq,
    /// `>=` (also `≥`)
    Ge,
    /// `>`
    Gt,
    /// `!=`
    Ne,
}

/// A comparison operand: a literal or an identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Numeric literal.
    Number(f64),
    /// String literal.
    Text(String),
    /// Identifier resolved from the context.
    Ident(String),
}

/// Parsed predicate expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Binary comparison.
    Cmp {
        /// Left operand.
        lhs: Operand,
        /// Operator.
        op: CmpOp,
        /// Right operand.
        rhs: Operand,
    },
    /// Membership test against a literal list.
    In {
        /// The tested operand.
        needle: Operand,
        /// Literal list elements.
        list: Vec<Operand>,
    },
    /// A bare operand used as a boolean, e.g. a `bool` context variable.
    Truth(Operand),
}

/// Expression parse or evaluation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    /// Unexpected character or token during parsing.
    #[error("unexpected input at offset {at}: '{found}'")]
    Unexpected {
        /// Byte offset.
        at: usize,
        /// The offending fragment.
        found: String,
    },

    /// Input ended mid-expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Input continued past a complete expression.
    #[error("trailing input at offset {0}")]
    Trailing(usize),

    /// An identifier is not present in the evaluation context.
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    /// Operands have incompatible types for the operator.
    #[error("type mismatch: cannot apply '{op}' to {lhs} and {rhs}")]
    TypeMismatch {
        /// Operator text.
        op: &'static str,
        /// Left type name.
        lhs: &'static str,
        /// Right type name.
        rhs: &'static str,
    },

    /// A non-boolean operand was used as a predicate.
    #[error("expected a boolean, found {0}")]
    NotBoolean(&'static str),
}

/// Frozen evaluation context: variable name to value.
pub type Context = BTreeMap<String, Value>;

impl Expr {
    /// Parses a predicate expression.
    ///
    /// # Errors
    ///
    /// Returns an `ExprError` describing the first offending token.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = lex(input)?;
        let mut p = Parser { tokens, pos: 0 };
        let expr = p.or_expr()?;
        match p.peek() {
            None => Ok(expr),
            Some(t) => Err(ExprError::Trailing(t.at)),
        }
    }

    /// Collects every identifier the expression references.
    #[must_use]
    pub fn identifiers(&self) -> BTreeSet<String> {
        fn operand(o: &Operand, out: &mut BTreeSet<String>) {
            if let Operand::Ident(name) = o {
                out.insert(name.clone());
            }
        }
        fn walk(e: &Expr, out: &mut BTreeSet<String>) {
            match e {
                Expr::Or(a, b) | Expr::And(a, b) => {
                    walk(a, out);
                    walk(b, out);
                }
                Expr::Not(a) => walk(a, out),
                Expr::Cmp { lhs, rhs, .. } => {
                    operand(lhs, out);
                    operand(rhs, out);
                }
                Expr::In { needle, list } => {
                    operand(needle, out);
                    for o in list {
                        operand(o, out);
                    }
                }
                Expr::Truth(o) => operand(o, out),
            }
        }
        let mut out = BTreeSet::new();
        walk(self, &mut out);
        out
    }

    /// Evaluates the expression against a frozen context.
    ///
    /// # Errors
    ///
    /// Returns an `ExprError` on unknown identifiers or operand type
    /// mismatches. Callers decide policy: the effort evaluator treats an
    /// evaluation error as `false`.
    pub fn eval(&self, ctx: &Context) -> Result<bool, ExprError> {
        match self {
            Self::Or(a, b) => Ok(a.eval(ctx)? || b.eval(ctx)?),
            Self::And(a, b) => Ok(a.eval(ctx)? && b.eval(ctx)?),
            Self::Not(a) => Ok(!a.eval(ctx)?),
            Self::Cmp { lhs, op, rhs } => {
                let l = resolve(lhs, ctx)?;
                let r = resolve(rhs, ctx)?;
                compare(&l, *op, &r)
            }
            Self::In { needle, list } => {
                let n = resolve(needle, ctx)?;
                for item in list {
                    let v = resolve(item, ctx)?;
                    if values_equal(&n, &v)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Truth(o) => match resolve(o, ctx)? {
                Value::Bool(b) => Ok(b),
                other => Err(ExprError::NotBoolean(other.type_name())),
            },
        }
    }
}

fn resolve(o: &Operand, ctx: &Context) -> Result<Value, ExprError> {
    match o {
        Operand::Number(n) => Ok(Value::Number(*n)),
        Operand::Text(s) => Ok(Value::Text(s.clone())),
        Operand::Ident(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
    }
}

fn compare(l: &Value, op: CmpOp, r: &Value) -> Result<bool, ExprError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Ok(match op {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Eq => (a - b).abs() < f64::EPSILON,
            CmpOp::Ge => a >= b,
            CmpOp::Gt => a > b,
            CmpOp::Ne => (a - b).abs() >= f64::EPSILON,
        }),
        (Value::Text(a), Value::Text(b)) => match op {
            CmpOp::Eq => Ok(a == b),
            CmpOp::Ne => Ok(a != b),
            _ => Err(mismatch(op, l, r)),
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq => Ok(a == b),
            CmpOp::Ne => Ok(a != b),
            _ => Err(mismatch(op, l, r)),
        },
        _ => Err(mismatch(op, l, r)),
    }
}

fn values_equal(l: &Value, r: &Value) -> Result<bool, ExprError> {
    compare(l, CmpOp::Eq, r)
}

fn mismatch(op: CmpOp, l: &Value, r: &Value) -> ExprError {
    ExprError::TypeMismatch {
        op: op_text(op),
        lhs: l.type_name(),
        rhs: r.type_name(),
    }
}

const fn op_text(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Eq => "==",
        CmpOp::Ge => ">=",
        CmpOp::Gt => ">",
        CmpOp::Ne => "!=",
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(f64),
    Text(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    In,
    True,
    False,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    at: usize,
}

#[allow(clippy::too_many_lines)]
fn lex(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (at, c) = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, at });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, at });
                i += 1;
            }
            '[' => {
                tokens.push(Token { kind: TokenKind::LBracket, at });
                i += 1;
            }
            ']' => {
                tokens.push(Token { kind: TokenKind::RBracket, at });
                i += 1;
            }
            ',' => {
                tokens.push(Token { kind: TokenKind::Comma, at });
                i += 1;
            }
            '≤' => {
                tokens.push(Token { kind: TokenKind::Op(CmpOp::Le), at });
                i += 1;
            }
            '≥' => {
                tokens.push(Token { kind: TokenKind::Op(CmpOp::Ge), at });
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let next_eq = chars.get(i + 1).is_some_and(|&(_, n)| n == '=');
                let kind = match (c, next_eq) {
                    ('<', true) => TokenKind::Op(CmpOp::Le),
                    ('<', false) => TokenKind::Op(CmpOp::Lt),
                    ('>', true) => TokenKind::Op(CmpOp::Ge),
                    ('>', false) => TokenKind::Op(CmpOp::Gt),
                    ('=', true) => TokenKind::Op(CmpOp::Eq),
                    ('!', true) => TokenKind::Op(CmpOp::Ne),
                    _ => {
                        return Err(ExprError::Unexpected {
                            at,
                            found: c.to_string(),
                        });
                    }
                };
                tokens.push(Token { kind, at });
                i += if next_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&(_, ch)) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&(_, ch)) => {
                            text.push(ch);
                            i += 1;
                        }
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Text(text),
                    at,
                });
            }
            c if c.is_ascii_digit() => {
                let mut end = i;
                while end < chars.len()
                    && (chars[end].1.is_ascii_digit() || chars[end].1 == '.')
                {
                    end += 1;
                }
                let text: String = chars[i..end].iter().map(|&(_, ch)| ch).collect();
                let value = text.parse::<f64>().map_err(|_| ExprError::Unexpected {
                    at,
                    found: text.clone(),
                })?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    at,
                });
                i = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len()
                    && (chars[end].1.is_ascii_alphanumeric() || chars[end].1 == '_')
                {
                    end += 1;
                }
                let word: String = chars[i..end].iter().map(|&(_, ch)| ch).collect();
                let kind = match word.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    _ => TokenKind::Ident(word),
                };
                tokens.push(Token { kind, at });
                i = end;
            }
            other => {
                return Err(ExprError::Unexpected {
                    at,
                    found: other.to_string(),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ExprError> {
        match self.bump() {
            Some(t) if t.kind == *kind => Ok(()),
            Some(t) => Err(ExprError::Unexpected {
                at: t.at,
                found: format!("{:?}", t.kind),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            self.bump();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Not)) {
            self.bump();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
            self.bump();
            let inner = self.or_expr()?;
            self.expect(&TokenKind::RParen)?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.operand()?;
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Op(op)) => {
                self.bump();
                let rhs = self.operand()?;
                Ok(Expr::Cmp { lhs, op, rhs })
            }
            Some(TokenKind::In) => {
                self.bump();
                self.expect(&TokenKind::LBracket)?;
                let mut list = vec![self.operand()?];
                while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Comma)) {
                    self.bump();
                    list.push(self.operand()?);
                }
                self.expect(&TokenKind::RBracket)?;
                Ok(Expr::In { needle: lhs, list })
            }
            _ => Ok(Expr::Truth(lhs)),
        }
    }

    fn operand(&mut self) -> Result<Operand, ExprError> {
        match self.bump() {
            Some(Token {
                kind: TokenKind::Number(n),
                ..
            }) => Ok(Operand::Number(n)),
            Some(Token {
                kind: TokenKind::Text(s),
                ..
            }) => Ok(Operand::Text(s)),
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => Ok(Operand::Ident(name)),
            // `true`/`false` literals behave as identifiers bound in every
            // context; simplest to inline them as comparisons on booleans.
            Some(Token {
                kind: TokenKind::True,
                ..
            }) => Ok(Operand::Ident("true".to_string())),
            Some(Token {
                kind: TokenKind::False,
                ..
            }) => Ok(Operand::Ident("false".to_string())),
            Some(t) => Err(ExprError::Unexpected {
                at: t.at,
                found: format!("{:?}", t.kind),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// Returns a context pre-populated with the `true`/`false` literals.
#[must_use]
pub fn base_context() -> Context {
    let mut ctx = Context::new();
    ctx.insert("true".to_string(), Value::Bool(true));
    ctx.insert("false".to_string(), Value::Bool(false));
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        let mut c = base_context();
        c.insert("match_score".into(), Value::Number(0.85));
        c.insert("company_tier".into(), Value::Text("top".into()));
        c.insert("hint_effort".into(), Value::Text("medium".into()));
        c.insert("domain_avoid".into(), Value::Bool(false));
        c
    }

    #[test]
    fn test_comparisons() {
        let e = Expr::parse("match_score >= 0.8").unwrap();
        assert!(e.eval(&ctx()).unwrap());
        let e = Expr::parse("match_score < 0.8").unwrap();
        assert!(!e.eval(&ctx()).unwrap());
        let e = Expr::parse("match_score ≥ 0.85").unwrap();
        assert!(e.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_boolean_connectives_and_precedence() {
        // `and` binds tighter than `or`.
        let e = Expr::parse("match_score > 0.9 or company_tier == 'top' and match_score > 0.5")
            .unwrap();
        assert!(e.eval(&ctx()).unwrap());
        let e = Expr::parse("not domain_avoid and match_score > 0.5").unwrap();
        assert!(e.eval(&ctx()).unwrap());
        let e = Expr::parse("(match_score > 0.9 or company_tier == 'top') and domain_avoid")
            .unwrap();
        assert!(!e.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_membership() {
        let e = Expr::parse("company_tier in ['top', 'normal']").unwrap();
        assert!(e.eval(&ctx()).unwrap());
        let e = Expr::parse("company_tier in ['avoid']").unwrap();
        assert!(!e.eval(&ctx()).unwrap());
        let e = Expr::parse("hint_effort in ['low']").unwrap();
        assert!(!e.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_bare_booleans() {
        let e = Expr::parse("domain_avoid").unwrap();
        assert!(!e.eval(&ctx()).unwrap());
        let e = Expr::parse("not domain_avoid").unwrap();
        assert!(e.eval(&ctx()).unwrap());
        let e = Expr::parse("true").unwrap();
        assert!(e.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_identifier_collection() {
        let e = Expr::parse("match_score >= 0.8 and company_tier in ['top'] or domain_avoid")
            .unwrap();
        let ids = e.identifiers();
        assert!(ids.contains("match_score"));
        assert!(ids.contains("company_tier"));
        assert!(ids.contains("domain_avoid"));
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Expr::parse("match_score >="),
            Err(ExprError::UnexpectedEnd)
        ));
        assert!(matches!(
            Expr::parse("match_score > 0.5 extra"),
            Err(ExprError::Trailing(_))
        ));
        assert!(Expr::parse("match_score @ 3").is_err());
        assert!(Expr::parse("'unterminated").is_err());
    }

    #[test]
    fn test_eval_errors() {
        let e = Expr::parse("unknown_var > 1").unwrap();
        assert!(matches!(
            e.eval(&ctx()),
            Err(ExprError::UnknownIdentifier(_))
        ));
        let e = Expr::parse("company_tier > 3").unwrap();
        assert!(matches!(e.eval(&ctx()), Err(ExprError::TypeMismatch { .. })));
        let e = Expr::parse("match_score").unwrap();
        assert!(matches!(e.eval(&ctx()), Err(ExprError::NotBoolean(_))));
    }
}
