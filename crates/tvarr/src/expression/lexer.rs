//! Tokenizer for the rule DSL.
//!
//! Produces spanned tokens so parse errors can name the offending input
//! range. Words cover identifiers, bare literals and `*glob*` shortcuts;
//! runs of `=`, `!`, `<`, `>` become symbol tokens (`==`, `!=`, `=>`, …).

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier, bare literal or glob shortcut.
    Word(String),
    /// Double-quoted string literal (escapes resolved).
    Str(String),
    /// Operator symbol: `==`, `!=`, `=`, `=>`, `>`, `<`.
    Sym(String),
    LParen,
    RParen,
    Comma,
    Colon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{w}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Sym(s) => write!(f, "{s}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// A lex error names the byte span of the offending text.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<SpannedToken>, LexError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(spanned(Token::LParen, i, i + 1));
                i += 1;
            }
            ')' => {
                tokens.push(spanned(Token::RParen, i, i + 1));
                i += 1;
            }
            ',' => {
                tokens.push(spanned(Token::Comma, i, i + 1));
                i += 1;
            }
            ':' => {
                tokens.push(spanned(Token::Colon, i, i + 1));
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                let mut closed = false;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch == '\\' && i + 1 < bytes.len() {
                        let escaped = bytes[i + 1] as char;
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    } else if ch == '"' {
                        closed = true;
                        i += 1;
                        break;
                    } else {
                        value.push(ch);
                        i += 1;
                    }
                }
                if !closed {
                    return Err(LexError {
                        message: "unterminated string literal".to_string(),
                        position: start,
                    });
                }
                tokens.push(spanned(Token::Str(value), start, i));
            }
            '=' | '!' | '<' | '>' => {
                let start = i;
                while i < bytes.len() && matches!(bytes[i] as char, '=' | '!' | '<' | '>') {
                    i += 1;
                }
                let sym = &input[start..i];
                match sym {
                    "==" | "!=" | "=" | "=>" | ">" | "<" => {
                        tokens.push(spanned(Token::Sym(sym.to_string()), start, i));
                    }
                    other => {
                        return Err(LexError {
                            message: format!("unknown operator '{other}'"),
                            position: start,
                        });
                    }
                }
            }
            _ => {
                let start = i;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_whitespace()
                        || matches!(ch, '(' | ')' | ',' | ':' | '"' | '=' | '!' | '<' | '>')
                    {
                        break;
                    }
                    i += 1;
                }
                if i == start {
                    return Err(LexError {
                        message: format!("unexpected character '{c}'"),
                        position: start,
                    });
                }
                tokens.push(spanned(Token::Word(input[start..i].to_string()), start, i));
            }
        }
    }

    Ok(tokens)
}

fn spanned(token: Token, start: usize, end: usize) -> SpannedToken {
    SpannedToken { token, start, end }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn lexes_a_simple_predicate() {
        assert_eq!(
            words("group_title equals \"News\""),
            vec![
                Token::Word("group_title".into()),
                Token::Word("equals".into()),
                Token::Str("News".into()),
            ]
        );
    }

    #[test]
    fn lexes_symbolic_operators() {
        assert_eq!(
            words("channel_number > 100 => channel_name = \"x\""),
            vec![
                Token::Word("channel_number".into()),
                Token::Sym(">".into()),
                Token::Word("100".into()),
                Token::Sym("=>".into()),
                Token::Word("channel_name".into()),
                Token::Sym("=".into()),
                Token::Str("x".into()),
            ]
        );
    }

    #[test]
    fn lexes_shortcut_globs() {
        assert_eq!(
            words("channel_name:*HD*"),
            vec![
                Token::Word("channel_name".into()),
                Token::Colon,
                Token::Word("*HD*".into()),
            ]
        );
    }

    #[test]
    fn string_escapes_resolve() {
        assert_eq!(
            words(r#"name equals "say \"hi\"""#),
            vec![
                Token::Word("name".into()),
                Token::Word("equals".into()),
                Token::Str("say \"hi\"".into()),
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("name equals \"oops").unwrap_err();
        assert!(err.message.contains("unterminated"));
        assert_eq!(err.position, 12);
    }
}
