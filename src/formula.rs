//! Minimal arithmetic formula evaluator shared by parameter extraction
//! and the orchestrator's pre-flight formula well-formedness check
//! (spec §4.2, §4.6).
//!
//! Supports `+ - * /`, unary minus, parentheses, numeric literals, and
//! bare identifiers resolved from an environment map. This is
//! deliberately small: the drug models this core consumes declare
//! formulas as short algebraic expressions over covariates and
//! population parameters, not a general scripting language.

use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;

use crate::error::{PkError, PkResult};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Ident,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn lex(input: &str) -> PkResult<(Vec<Token>, Vec<String>)> {
    let mut tokens = Vec::new();
    let mut idents = Vec::new();
    let mut chars: Peekable<Chars> = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = s
                    .parse::<f64>()
                    .map_err(|_| PkError::ParameterExtractionError(format!("bad numeric literal: {s}")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                idents.push(s);
                tokens.push(Token::Ident);
            }
            _ => {
                return Err(PkError::ParameterExtractionError(format!(
                    "unexpected character in formula: {c}"
                )))
            }
        }
    }
    Ok((tokens, idents))
}

struct Parser<'a> {
    tokens: &'a [Token],
    idents: &'a [String],
    pos: usize,
    ident_cursor: usize,
    env: &'a HashMap<String, f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next_ident(&mut self) -> PkResult<String> {
        let id = self
            .idents
            .get(self.ident_cursor)
            .cloned()
            .ok_or_else(|| PkError::ParameterExtractionError("formula identifier underflow".to_string()))?;
        self.ident_cursor += 1;
        Ok(id)
    }

    fn expr(&mut self) -> PkResult<f64> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> PkResult<f64> {
        let mut value = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(PkError::ParameterExtractionError("division by zero in formula".to_string()));
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> PkResult<f64> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Token::Ident) => {
                self.pos += 1;
                let id = self.next_ident()?;
                self.env.get(&id).copied().ok_or_else(|| {
                    PkError::ParameterExtractionError(format!("unknown identifier in formula: {id}"))
                })
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err(PkError::ParameterExtractionError("unbalanced parentheses in formula".to_string())),
                }
            }
            _ => Err(PkError::ParameterExtractionError("unexpected token in formula".to_string())),
        }
    }
}

/// Evaluate `expr` against `env`, resolving bare identifiers to their
/// numeric value. Returns `ParameterExtractionError` on any syntax or
/// unknown-identifier problem.
pub fn evaluate(expr: &str, env: &HashMap<String, f64>) -> PkResult<f64> {
    let (tokens, idents) = lex(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        idents: &idents,
        pos: 0,
        ident_cursor: 0,
        env,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(PkError::ParameterExtractionError(format!(
            "trailing tokens after parsing formula: {expr}"
        )));
    }
    Ok(value)
}

/// The identifiers a formula references, without evaluating it — used
/// by the orchestrator's pre-flight "every formula input is declared"
/// check (spec §4.6).
pub fn referenced_identifiers(expr: &str) -> PkResult<Vec<String>> {
    let (_, idents) = lex(expr)?;
    Ok(idents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_simple_arithmetic() {
        let env = HashMap::new();
        assert_eq!(evaluate("2 + 3 * 4", &env).unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4", &env).unwrap(), 20.0);
    }

    #[test]
    fn resolves_identifiers_from_env() {
        let mut env = HashMap::new();
        env.insert("weight".to_string(), 70.0);
        env.insert("CL_population".to_string(), 5.0);
        assert_eq!(evaluate("CL_population * weight / 70", &env).unwrap(), 5.0);
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let env = HashMap::new();
        assert!(evaluate("unknown_var + 1", &env).is_err());
    }

    #[test]
    fn referenced_identifiers_lists_all_names() {
        let ids = referenced_identifiers("a + b * (c - d)").unwrap();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }
}
