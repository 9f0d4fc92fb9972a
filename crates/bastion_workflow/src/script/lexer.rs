//! Tokenizer for the script surface.

use crate::error::WorkflowError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Nil,
    If,
    Then,
    Else,
    End,
    Local,
    And,
    Or,
    Not,
    // punctuation
    Assign,       // =
    Eq,           // ==
    NotEq,        // ~=
    Less,         // <
    LessEq,       // <=
    Greater,      // >
    GreaterEq,    // >=
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    Concat,       // ..
    Dot,          // .
    Comma,        // ,
    LParen,       // (
    RParen,       // )
}

/// A token with the 1-based source line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

pub fn lex(source: &str) -> Result<Vec<Spanned>, WorkflowError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '-' => {
                chars.next();
                if chars.peek() == Some(&'-') {
                    // comment to end of line
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                            break;
                        }
                    }
                } else {
                    tokens.push(Spanned { token: Token::Minus, line });
                }
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('"') => text.push('"'),
                            Some('\\') => text.push('\\'),
                            Some(other) => text.push(other),
                            None => break,
                        },
                        '\n' => {
                            return Err(err(line, "unterminated string"));
                        }
                        other => text.push(other),
                    }
                }
                if !closed {
                    return Err(err(line, "unterminated string"));
                }
                tokens.push(Spanned { token: Token::Str(text), line });
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        // `..` after a number is the concat operator
                        if c == '.' {
                            let mut lookahead = chars.clone();
                            lookahead.next();
                            if lookahead.peek() == Some(&'.') {
                                break;
                            }
                        }
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = text
                    .parse()
                    .map_err(|_| err(line, &format!("bad number '{text}'")))?;
                tokens.push(Spanned { token: Token::Number(value), line });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "nil" => Token::Nil,
                    "if" => Token::If,
                    "then" => Token::Then,
                    "else" => Token::Else,
                    "end" => Token::End,
                    "local" => Token::Local,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(text),
                };
                tokens.push(Spanned { token, line });
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Spanned { token: Token::Eq, line });
                } else {
                    tokens.push(Spanned { token: Token::Assign, line });
                }
            }
            '~' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Spanned { token: Token::NotEq, line });
                } else {
                    return Err(err(line, "expected '=' after '~'"));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Spanned { token: Token::LessEq, line });
                } else {
                    tokens.push(Spanned { token: Token::Less, line });
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Spanned { token: Token::GreaterEq, line });
                } else {
                    tokens.push(Spanned { token: Token::Greater, line });
                }
            }
            '.' => {
                chars.next();
                if chars.peek() == Some(&'.') {
                    chars.next();
                    tokens.push(Spanned { token: Token::Concat, line });
                } else {
                    tokens.push(Spanned { token: Token::Dot, line });
                }
            }
            '+' => {
                chars.next();
                tokens.push(Spanned { token: Token::Plus, line });
            }
            '*' => {
                chars.next();
                tokens.push(Spanned { token: Token::Star, line });
            }
            '/' => {
                chars.next();
                tokens.push(Spanned { token: Token::Slash, line });
            }
            '%' => {
                chars.next();
                tokens.push(Spanned { token: Token::Percent, line });
            }
            ',' => {
                chars.next();
                tokens.push(Spanned { token: Token::Comma, line });
            }
            '(' => {
                chars.next();
                tokens.push(Spanned { token: Token::LParen, line });
            }
            ')' => {
                chars.next();
                tokens.push(Spanned { token: Token::RParen, line });
            }
            other => {
                return Err(err(line, &format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

fn err(line: usize, message: &str) -> WorkflowError {
    WorkflowError::Script(format!("line {line}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_statements_and_operators() {
        let tokens = lex("local a = 1 + 2.5 .. \"x\"").unwrap();
        let kinds: Vec<Token> = tokens.into_iter().map(|s| s.token).collect();
        assert_eq!(
            kinds,
            vec![
                Token::Local,
                Token::Ident("a".into()),
                Token::Assign,
                Token::Number(1.0),
                Token::Plus,
                Token::Number(2.5),
                Token::Concat,
                Token::Str("x".into()),
            ]
        );
    }

    #[test]
    fn comments_are_skipped_and_lines_tracked() {
        let tokens = lex("-- nothing here\nx = 1").unwrap();
        assert_eq!(tokens[0].token, Token::Ident("x".into()));
        assert_eq!(tokens[0].line, 2);
    }

    #[test]
    fn number_followed_by_concat_lexes_cleanly() {
        let tokens = lex("1 .. 2").unwrap();
        let kinds: Vec<Token> = tokens.into_iter().map(|s| s.token).collect();
        assert_eq!(
            kinds,
            vec![Token::Number(1.0), Token::Concat, Token::Number(2.0)]
        );
    }

    #[test]
    fn string_escapes() {
        let tokens = lex(r#""a\"b\n""#).unwrap();
        assert_eq!(tokens[0].token, Token::Str("a\"b\n".into()));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(lex("\"oops").is_err());
    }
}
