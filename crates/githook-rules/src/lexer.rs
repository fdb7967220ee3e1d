//! Tokenizer for the `when` expression language.

use std::fmt;

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Minus,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "{s}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Num(n) => write!(f, "{n}"),
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Null => write!(f, "null"),
            Self::EqEq => write!(f, "=="),
            Self::NotEq => write!(f, "!="),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
            Self::AndAnd => write!(f, "&&"),
            Self::OrOr => write!(f, "||"),
            Self::Not => write!(f, "!"),
            Self::Minus => write!(f, "-"),
            Self::Dot => write!(f, "."),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
        }
    }
}

/// Tokenize `src`, reporting the byte offset of the first bad character.
pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(format!("expected '==' at offset {i}"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(format!("expected '&&' at offset {i}"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(format!("expected '||' at offset {i}"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                let mut out = String::new();
                let mut closed = false;
                while j < bytes.len() {
                    let cj = bytes[j] as char;
                    if cj == '\\' && j + 1 < bytes.len() {
                        let esc = bytes[j + 1] as char;
                        out.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        j += 2;
                        continue;
                    }
                    if cj == quote {
                        closed = true;
                        break;
                    }
                    out.push(cj);
                    j += 1;
                }
                if !closed {
                    return Err(format!("unterminated string starting at offset {i}"));
                }
                tokens.push(Token::Str(out));
                i = j + 1;
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                    // A dot followed by a non-digit is field access, not
                    // a decimal point ("commits.0" style never lexes here
                    // but "1.x" should not swallow the dot).
                    && !(bytes[i] == b'.'
                        && !bytes.get(i + 1).is_some_and(|b| (*b as char).is_ascii_digit()))
                {
                    i += 1;
                }
                let text = &src[start..i];
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{text}' at offset {start}"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                match &src[start..i] {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    ident => tokens.push(Token::Ident(ident.to_string())),
                }
            }
            other => return Err(format!("unexpected character '{other}' at offset {i}")),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_a_full_expression() {
        let tokens = tokenize(r#"action == "opened" && pull_request.draft == false"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("action".into()),
                Token::EqEq,
                Token::Str("opened".into()),
                Token::AndAnd,
                Token::Ident("pull_request".into()),
                Token::Dot,
                Token::Ident("draft".into()),
                Token::EqEq,
                Token::False,
            ]
        );
    }

    #[test]
    fn lexes_indexing_and_numbers() {
        let tokens = tokenize("commits[1] == null || size >= 2.5").unwrap();
        assert!(tokens.contains(&Token::LBracket));
        assert!(tokens.contains(&Token::Num(1.0)));
        assert!(tokens.contains(&Token::Num(2.5)));
        assert!(tokens.contains(&Token::Null));
    }

    #[test]
    fn rejects_bare_ampersand_and_unterminated_strings() {
        assert!(tokenize("a & b").is_err());
        assert!(tokenize("a == \"oops").is_err());
        assert!(tokenize("a = b").is_err());
    }

    #[test]
    fn single_quotes_work() {
        let tokens = tokenize("ref == 'refs/heads/main'").unwrap();
        assert!(tokens.contains(&Token::Str("refs/heads/main".into())));
    }
}
