//! Tokenizer for the expression sub-language.
//!
//! Hand-written maximal-munch scanner. `?` is emitted as [`Token::Question`]
//! and disambiguated by the parser: in operand position it is a substitution
//! hole, in operator position the start of a ternary.

use crate::error::{QueryError, QueryResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    This,

    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,
    Dot,
    Question,

    Arrow,    // =>
    EqEqEq,   // ===
    NotEqEq,  // !==
    EqEq,     // ==
    NotEq,    // !=
    Le,       // <=
    Ge,       // >=
    Lt,       // <
    Gt,       // >
    AndAnd,   // &&
    OrOr,     // ||
    Bang,     // !
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

/// Scan `source` into a token list.
pub fn tokenize(source: &str) -> QueryResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent suffix
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| QueryError::Parse(format!("invalid number literal: {text}")))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    let esc = chars[i + 1];
                    text.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                text.push(ch);
                i += 1;
            }
            if !closed {
                return Err(QueryError::Parse("unterminated string literal".into()));
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(match text.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" | "undefined" => Token::Null,
                "this" => Token::This,
                _ => Token::Ident(text),
            });
            continue;
        }

        // Punctuation and operators, longest match first.
        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        let (token, len) = if rest.starts_with("===") {
            (Token::EqEqEq, 3)
        } else if rest.starts_with("!==") {
            (Token::NotEqEq, 3)
        } else if rest.starts_with("==") {
            (Token::EqEq, 2)
        } else if rest.starts_with("!=") {
            (Token::NotEq, 2)
        } else if rest.starts_with("<=") {
            (Token::Le, 2)
        } else if rest.starts_with(">=") {
            (Token::Ge, 2)
        } else if rest.starts_with("=>") {
            (Token::Arrow, 2)
        } else if rest.starts_with("&&") {
            (Token::AndAnd, 2)
        } else if rest.starts_with("||") {
            (Token::OrOr, 2)
        } else {
            let single = match c {
                '{' => Token::LBrace,
                '}' => Token::RBrace,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                ':' => Token::Colon,
                '.' => Token::Dot,
                '?' => Token::Question,
                '<' => Token::Lt,
                '>' => Token::Gt,
                '!' => Token::Bang,
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '%' => Token::Percent,
                other => {
                    return Err(QueryError::Parse(format!(
                        "unexpected character {other:?} in expression"
                    )))
                }
            };
            (single, 1)
        };
        tokens.push(token);
        i += len;
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_operators_longest_first() {
        let toks = tokenize("a === b !== c == d != e <= f => g").expect("tokenize");
        assert!(toks.contains(&Token::EqEqEq));
        assert!(toks.contains(&Token::NotEqEq));
        assert!(toks.contains(&Token::EqEq));
        assert!(toks.contains(&Token::NotEq));
        assert!(toks.contains(&Token::Le));
        assert!(toks.contains(&Token::Arrow));
    }

    #[test]
    fn scans_dollar_identifiers() {
        let toks = tokenize("$limit $$subs thing").expect("tokenize");
        assert_eq!(
            toks,
            vec![
                Token::Ident("$limit".into()),
                Token::Ident("$$subs".into()),
                Token::Ident("thing".into()),
            ]
        );
    }

    #[test]
    fn scans_numbers_and_strings() {
        let toks = tokenize("1.5e3 'a\\n' \"b\"").expect("tokenize");
        assert_eq!(
            toks,
            vec![
                Token::Number(1500.0),
                Token::Str("a\n".into()),
                Token::Str("b".into()),
            ]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }
}
