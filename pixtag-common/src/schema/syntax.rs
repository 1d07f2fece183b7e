//! Type expression grammar for output type descriptions
//!
//! ```text
//! expr := term ( '|' term )*
//! term := IDENT ( '<' expr ( ',' expr )* '>' )?
//! ```
//!
//! `list<T>` and `map<K, V>` are the only generic names. Anything else with
//! generic arguments is a parse error. Resolution of names (primitives, enums,
//! self-reference) happens in the compiler, not here.

use std::fmt;

/// Parsed, unresolved type expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSyntax {
    Named(String),
    List(Box<TypeSyntax>),
    Map(Box<TypeSyntax>, Box<TypeSyntax>),
    Union(Vec<TypeSyntax>),
}

impl fmt::Display for TypeSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSyntax::Named(name) => write!(f, "{}", name),
            TypeSyntax::List(inner) => write!(f, "list<{}>", inner),
            TypeSyntax::Map(k, v) => write!(f, "map<{}, {}>", k, v),
            TypeSyntax::Union(variants) => {
                let parts: Vec<String> = variants.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(" | "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Open,
    Close,
    Comma,
    Pipe,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Open => write!(f, "'<'"),
            Token::Close => write!(f, "'>'"),
            Token::Comma => write!(f, "','"),
            Token::Pipe => write!(f, "'|'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '<' | '[' => {
                chars.next();
                tokens.push(Token::Open);
            }
            '>' | ']' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{}'", other)),
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

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<TypeSyntax, String> {
        let mut variants = vec![self.term()?];
        while self.peek() == Some(&Token::Pipe) {
            self.next();
            variants.push(self.term()?);
        }

        if variants.len() == 1 {
            Ok(variants.remove(0))
        } else {
            Ok(TypeSyntax::Union(variants))
        }
    }

    fn term(&mut self) -> Result<TypeSyntax, String> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(other) => return Err(format!("expected a type name, found {}", other)),
            None => return Err("expected a type name, found end of input".to_string()),
        };

        if self.peek() != Some(&Token::Open) {
            return Ok(TypeSyntax::Named(name));
        }
        self.next();

        let mut args = vec![self.expr()?];
        loop {
            match self.next() {
                Some(Token::Comma) => args.push(self.expr()?),
                Some(Token::Close) => break,
                Some(other) => return Err(format!("expected ',' or '>', found {}", other)),
                None => return Err(format!("unclosed '<' after '{}'", name)),
            }
        }

        match (name.to_ascii_lowercase().as_str(), args.len()) {
            ("list", 1) => Ok(TypeSyntax::List(Box::new(args.remove(0)))),
            ("map" | "dict", 2) => {
                let value = args.remove(1);
                let key = args.remove(0);
                Ok(TypeSyntax::Map(Box::new(key), Box::new(value)))
            }
            ("list", n) => Err(format!("list takes 1 type argument, got {}", n)),
            ("map" | "dict", n) => Err(format!("map takes 2 type arguments, got {}", n)),
            _ => Err(format!("'{}' does not take type arguments", name)),
        }
    }
}

/// Parse a type expression such as `list<ImageType>`
pub fn parse(input: &str) -> Result<TypeSyntax, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty type expression".to_string());
    }

    let mut parser = Parser { tokens, pos: 0 };
    let syntax = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(format!("unexpected {} after type expression", extra));
    }

    Ok(syntax)
}
