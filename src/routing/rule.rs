//! Rule expression parser.
//!
//! Grammar (`&&` binds tighter than `||`):
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | "(" expr ")" | matcher
//! matcher := Ident "(" string ( "," string )* ")"
//! ```
//! Strings are quoted with backquotes or double quotes.

use thiserror::Error;

/// Parsed rule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Any of the hosts (lowercased).
    Host(Vec<String>),
    /// Exact path, any of.
    Path(Vec<String>),
    /// Path prefix, any of.
    PathPrefix(Vec<String>),
    /// Request method (uppercased), any of.
    Method(Vec<String>),
    /// Header equals value (name lowercased).
    Header(String, String),
    /// Query parameter equals value.
    Query(String, String),
    And(Box<Rule>, Box<Rule>),
    Or(Box<Rule>, Box<Rule>),
    Not(Box<Rule>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("empty rule")]
    Empty,
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("unexpected end of rule")]
    UnexpectedEnd,
    #[error("expected {expected} at offset {offset}")]
    Expected { expected: &'static str, offset: usize },
    #[error("unknown matcher `{0}`")]
    UnknownMatcher(String),
    #[error("matcher `{matcher}` takes {expected} argument(s), got {got}")]
    Arity {
        matcher: String,
        expected: &'static str,
        got: usize,
    },
    #[error("invalid argument for `{matcher}`: {reason}")]
    InvalidArgument { matcher: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, RuleError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push((Token::LParen, offset));
            }
            ')' => {
                chars.next();
                tokens.push((Token::RParen, offset));
            }
            ',' => {
                chars.next();
                tokens.push((Token::Comma, offset));
            }
            '!' => {
                chars.next();
                tokens.push((Token::Not, offset));
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == ch => {
                        let token = if ch == '&' { Token::And } else { Token::Or };
                        tokens.push((token, offset));
                    }
                    Some((at, other)) => return Err(RuleError::UnexpectedChar { ch: other, offset: at }),
                    None => return Err(RuleError::UnexpectedEnd),
                }
            }
            '`' | '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == ch {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(RuleError::UnterminatedString(offset));
                }
                tokens.push((Token::Str(value), offset));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(ident), offset));
            }
            other => return Err(RuleError::UnexpectedChar { ch: other, offset }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), RuleError> {
        let offset = self.offset();
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(_) => Err(RuleError::Expected { expected, offset }),
            None => Err(RuleError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Rule, RuleError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and()?;
            left = Rule::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Rule, RuleError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.unary()?;
            left = Rule::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Rule, RuleError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Not) => Ok(Rule::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.matcher(name),
            Some(_) => Err(RuleError::Expected {
                expected: "matcher",
                offset,
            }),
            None => Err(RuleError::UnexpectedEnd),
        }
    }

    fn matcher(&mut self, name: String) -> Result<Rule, RuleError> {
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        loop {
            let offset = self.offset();
            match self.next() {
                Some(Token::Str(s)) => args.push(s),
                Some(_) => return Err(RuleError::Expected { expected: "string", offset }),
                None => return Err(RuleError::UnexpectedEnd),
            }
            let offset = self.offset();
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                Some(_) => return Err(RuleError::Expected { expected: "',' or ')'", offset }),
                None => return Err(RuleError::UnexpectedEnd),
            }
        }
        build_matcher(name, args)
    }
}

fn build_matcher(name: String, args: Vec<String>) -> Result<Rule, RuleError> {
    let invalid = |reason: &str| RuleError::InvalidArgument {
        matcher: name.clone(),
        reason: reason.to_string(),
    };
    let pair = |args: Vec<String>| -> Result<(String, String), RuleError> {
        let got = args.len();
        let mut it = args.into_iter();
        match (it.next(), it.next(), it.next()) {
            (Some(a), Some(b), None) => Ok((a, b)),
            _ => Err(RuleError::Arity {
                matcher: name.clone(),
                expected: "2",
                got,
            }),
        }
    };

    if args.iter().any(|a| a.is_empty()) && name != "Query" && name != "Header" {
        return Err(invalid("empty value"));
    }

    match name.as_str() {
        "Host" => Ok(Rule::Host(
            args.into_iter()
                .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
                .collect(),
        )),
        "Path" | "PathPrefix" => {
            if args.iter().any(|p| !p.starts_with('/')) {
                return Err(invalid("path must start with '/'"));
            }
            if name == "Path" {
                Ok(Rule::Path(args))
            } else {
                Ok(Rule::PathPrefix(args))
            }
        }
        "Method" => Ok(Rule::Method(
            args.into_iter().map(|m| m.to_ascii_uppercase()).collect(),
        )),
        "Header" => {
            let (header, value) = pair(args)?;
            if header.is_empty() {
                return Err(invalid("empty header name"));
            }
            Ok(Rule::Header(header.to_ascii_lowercase(), value))
        }
        "Query" => {
            let (key, value) = pair(args)?;
            if key.is_empty() {
                return Err(invalid("empty query key"));
            }
            Ok(Rule::Query(key, value))
        }
        _ => Err(RuleError::UnknownMatcher(name.clone())),
    }
}

impl Rule {
    /// Parse a rule expression.
    pub fn parse(input: &str) -> Result<Rule, RuleError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(RuleError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: input.len(),
        };
        let rule = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(RuleError::Expected {
                expected: "end of rule",
                offset: parser.offset(),
            });
        }
        Ok(rule)
    }

    /// Priority derived from how constrained the rule is.
    ///
    /// Host and path literals count their length, exact paths one more than an
    /// equal prefix, other predicates one each. `&&` sums, `||` takes the weakest
    /// branch, `!` constrains nothing.
    pub fn specificity(&self) -> i64 {
        match self {
            Rule::Host(hosts) => longest(hosts),
            Rule::Path(paths) => longest(paths) + 1,
            Rule::PathPrefix(prefixes) => longest(prefixes),
            Rule::Method(_) | Rule::Header(..) | Rule::Query(..) => 1,
            Rule::And(a, b) => a.specificity() + b.specificity(),
            Rule::Or(a, b) => a.specificity().min(b.specificity()),
            Rule::Not(_) => 0,
        }
    }

    /// Length of the host and path literals the rule pins down. Tie-breaker.
    pub fn literal_length(&self) -> usize {
        match self {
            Rule::Host(v) | Rule::Path(v) | Rule::PathPrefix(v) => shortest(v),
            Rule::And(a, b) => a.literal_length() + b.literal_length(),
            Rule::Or(a, b) => a.literal_length().min(b.literal_length()),
            _ => 0,
        }
    }

    /// Hosts this rule is restricted to, if any.
    ///
    /// `Some(hosts)` means the rule can only match when the request host is one of
    /// `hosts`, which lets the route table index it by exact host.
    pub fn required_hosts(&self) -> Option<Vec<String>> {
        match self {
            Rule::Host(hosts) => Some(hosts.clone()),
            Rule::And(a, b) => match (a.required_hosts(), b.required_hosts()) {
                (Some(x), Some(y)) => Some(x.into_iter().filter(|h| y.contains(h)).collect()),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            },
            Rule::Or(a, b) => match (a.required_hosts(), b.required_hosts()) {
                (Some(mut x), Some(y)) => {
                    for h in y {
                        if !x.contains(&h) {
                            x.push(h);
                        }
                    }
                    Some(x)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// A prefix every matching path must start with, used as a cheap pre-check.
    pub fn required_path_prefix(&self) -> Option<String> {
        match self {
            Rule::Path(v) | Rule::PathPrefix(v) if v.len() == 1 => Some(v[0].clone()),
            Rule::And(a, b) => match (a.required_path_prefix(), b.required_path_prefix()) {
                (Some(x), Some(y)) => Some(if x.len() >= y.len() { x } else { y }),
                (x, y) => x.or(y),
            },
            _ => None,
        }
    }
}

fn longest(values: &[String]) -> i64 {
    values.iter().map(|v| v.len()).max().unwrap_or(0) as i64
}

fn shortest(values: &[String]) -> usize {
    values.iter().map(|v| v.len()).min().unwrap_or(0)
}
