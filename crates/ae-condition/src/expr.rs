//! Dependency expressions
//!
//! A dependency expression is a boolean formula over dependency names using
//! `&&`, `||` and parentheses. `&&` binds tighter than `||`. There is no
//! negation: an expression only ever asks which dependencies have fired.

use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Deepest parenthesis nesting accepted
pub const MAX_NESTING_DEPTH: usize = 64;

/// Most dependency references accepted in one expression
pub const MAX_TERMS: usize = 1024;

/// Errors parsing or validating a dependency expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("dependency expression is empty")]
    Empty,

    #[error("unexpected character '{found}' at position {position}")]
    InvalidCharacter { position: usize, found: char },

    #[error("unexpected token '{found}' at position {position}")]
    UnexpectedToken { position: usize, found: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("parentheses nested deeper than {limit} at position {position}")]
    NestingTooDeep { position: usize, limit: usize },

    #[error("expression has more than {limit} terms")]
    TooManyTerms { limit: usize },

    #[error("expression references unknown dependency '{0}'")]
    UnknownDependency(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{}", name),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push((pos, Token::LParen)),
            ')' => tokens.push((pos, Token::RParen)),
            '&' | '|' => match chars.next() {
                Some((_, next)) if next == c => {
                    let token = if c == '&' { Token::And } else { Token::Or };
                    tokens.push((pos, token));
                }
                _ => return Err(ExpressionError::InvalidCharacter { position: pos, found: c }),
            },
            c if is_ident_char(c) => {
                let mut name = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if !is_ident_char(next) {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                tokens.push((pos, Token::Ident(name)));
            }
            other => {
                return Err(ExpressionError::InvalidCharacter {
                    position: pos,
                    found: other,
                })
            }
        }
    }

    Ok(tokens)
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Dependency(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn evaluate<F: Fn(&str) -> bool>(&self, fired: &F) -> bool {
        match self {
            Expr::Dependency(name) => fired(name),
            Expr::And(l, r) => l.evaluate(fired) && r.evaluate(fired),
            Expr::Or(l, r) => l.evaluate(fired) || r.evaluate(fired),
        }
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Dependency(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect(out);
                r.collect(out);
            }
        }
    }

    fn has_and(&self) -> bool {
        match self {
            Expr::Dependency(_) => false,
            Expr::And(_, _) => true,
            Expr::Or(l, r) => l.has_and() || r.has_and(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Dependency(name) => write!(f, "{}", name),
            Expr::And(l, r) => write!(f, "({} && {})", l, r),
            Expr::Or(l, r) => write!(f, "({} || {})", l, r),
        }
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some((_, Token::Ident(name))) => Ok(Expr::Dependency(name)),
            Some((open, Token::LParen)) => {
                if self.depth == MAX_NESTING_DEPTH {
                    return Err(ExpressionError::NestingTooDeep {
                        position: open,
                        limit: MAX_NESTING_DEPTH,
                    });
                }
                self.depth += 1;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((position, token)) => Err(ExpressionError::UnexpectedToken {
                        position,
                        found: token.to_string(),
                    }),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some((position, token)) => Err(ExpressionError::UnexpectedToken {
                position,
                found: token.to_string(),
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

/// A dependency expression: the raw source plus its parsed tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyExpression {
    raw: String,
    tree: Expr,
}

impl DependencyExpression {
    /// Parse an expression such as `(dep-a || dep-b) && dep-c`
    pub fn parse(raw: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(raw)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let terms = tokens
            .iter()
            .filter(|(_, t)| matches!(t, Token::Ident(_)))
            .count();
        if terms > MAX_TERMS {
            return Err(ExpressionError::TooManyTerms { limit: MAX_TERMS });
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let tree = parser.parse_or()?;

        if let Some((position, token)) = parser.advance() {
            return Err(ExpressionError::UnexpectedToken {
                position,
                found: token.to_string(),
            });
        }

        Ok(Self {
            raw: raw.to_string(),
            tree,
        })
    }

    /// Evaluate against a predicate telling whether a dependency has fired
    pub fn evaluate<F: Fn(&str) -> bool>(&self, fired: F) -> bool {
        self.tree.evaluate(&fired)
    }

    /// Evaluate against a set of fired dependency names
    pub fn evaluate_set(&self, fired: &HashSet<String>) -> bool {
        self.evaluate(|name| fired.contains(name))
    }

    /// Dependency names referenced, deduplicated in first-appearance order
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.tree.collect(&mut out);
        out
    }

    /// Whether any clause needs more than one dependency
    ///
    /// Expressions made only of `||` fire on every accepted event.
    pub fn requires_and(&self) -> bool {
        self.tree.has_and()
    }

    /// Ensure every referenced name is a known dependency
    pub fn validate<'a, I>(&self, known: I) -> Result<(), ExpressionError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: HashSet<&str> = known.into_iter().collect();
        match self.variables().into_iter().find(|v| !known.contains(v)) {
            Some(unknown) => Err(ExpressionError::UnknownDependency(unknown.to_string())),
            None => Ok(()),
        }
    }

    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed tree
    pub fn tree(&self) -> &Expr {
        &self.tree
    }
}

impl fmt::Display for DependencyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl std::str::FromStr for DependencyExpression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fired(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let at_limit = format!(
            "{}a{}",
            "(".repeat(MAX_NESTING_DEPTH),
            ")".repeat(MAX_NESTING_DEPTH)
        );
        assert!(DependencyExpression::parse(&at_limit).is_ok());

        let hostile = format!("{}a{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(
            DependencyExpression::parse(&hostile),
            Err(ExpressionError::NestingTooDeep {
                position: MAX_NESTING_DEPTH,
                limit: MAX_NESTING_DEPTH,
            })
        );
    }

    #[test]
    fn test_too_many_terms_rejected() {
        let long = vec!["a"; MAX_TERMS + 1].join(" && ");
        assert_eq!(
            DependencyExpression::parse(&long),
            Err(ExpressionError::TooManyTerms { limit: MAX_TERMS })
        );
        let fits = vec!["a"; MAX_TERMS].join(" || ");
        assert!(DependencyExpression::parse(&fits).is_ok());
    }

    #[test]
    fn test_precedence() {
        let expr = DependencyExpression::parse("a || b && c").unwrap();
        assert_eq!(expr.tree().to_string(), "(a || (b && c))");

        assert!(expr.evaluate_set(&fired(&["a"])));
        assert!(!expr.evaluate_set(&fired(&["b"])));
        assert!(expr.evaluate_set(&fired(&["b", "c"])));
    }

    #[test]
    fn test_parentheses() {
        let expr = DependencyExpression::parse("(a || b) && c").unwrap();

        assert!(!expr.evaluate_set(&fired(&["a"])));
        assert!(!expr.evaluate_set(&fired(&["c"])));
        assert!(expr.evaluate_set(&fired(&["a", "c"])));
        assert!(expr.evaluate_set(&fired(&["b", "c"])));
    }

    #[test]
    fn test_hyphenated_names() {
        let expr = DependencyExpression::parse("dep-1 && dep-2").unwrap();
        assert_eq!(expr.variables(), vec!["dep-1", "dep-2"]);
        assert!(expr.evaluate_set(&fired(&["dep-1", "dep-2"])));
    }

    #[test]
    fn test_variables_deduplicated() {
        let expr = DependencyExpression::parse("(a && b) || (a && c)").unwrap();
        assert_eq!(expr.variables(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_requires_and() {
        assert!(!DependencyExpression::parse("a || b || c")
            .unwrap()
            .requires_and());
        assert!(DependencyExpression::parse("a || (b && c)")
            .unwrap()
            .requires_and());
        assert!(!DependencyExpression::parse("a").unwrap().requires_and());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DependencyExpression::parse("   "),
            Err(ExpressionError::Empty)
        );
        assert_eq!(
            DependencyExpression::parse("a &&"),
            Err(ExpressionError::UnexpectedEnd)
        );
        assert!(matches!(
            DependencyExpression::parse("a & b"),
            Err(ExpressionError::InvalidCharacter { found: '&', .. })
        ));
        assert!(matches!(
            DependencyExpression::parse("!a"),
            Err(ExpressionError::InvalidCharacter { found: '!', .. })
        ));
        assert!(matches!(
            DependencyExpression::parse("(a || b"),
            Err(ExpressionError::UnexpectedEnd)
        ));
        assert!(matches!(
            DependencyExpression::parse("a b"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            DependencyExpression::parse("a && )"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let expr = DependencyExpression::parse("a && ghost").unwrap();
        assert_eq!(
            expr.validate(["a", "b"]),
            Err(ExpressionError::UnknownDependency("ghost".to_string()))
        );
        assert!(expr.validate(["a", "ghost"]).is_ok());
    }

    #[test]
    fn test_evaluation_independent_of_arrival_order() {
        let expr = DependencyExpression::parse("(a || b) && (c || d) && e").unwrap();
        let names = ["a", "c", "e", "b"];

        // Every prefix of every rotation yields the same result as the set itself
        for start in 0..names.len() {
            let mut seen = HashSet::new();
            let mut reversed = HashSet::new();
            for i in 0..names.len() {
                seen.insert(names[(start + i) % names.len()].to_string());
                reversed.insert(names[(start + names.len() - i) % names.len()].to_string());
            }
            assert_eq!(expr.evaluate_set(&seen), expr.evaluate_set(&reversed));
        }
        assert!(expr.evaluate_set(&fired(&["e", "c", "a"])));
        assert!(!expr.evaluate_set(&fired(&["a", "b", "e"])));
    }
}
