//! Recursive-descent parser for the rule DSL.
//!
//! ```text
//! Rule       := Condition ('=>' ActionList)?
//! Condition  := OrExpr
//! OrExpr     := AndExpr ('OR' AndExpr)*
//! AndExpr    := NotExpr ('AND' NotExpr)*
//! NotExpr    := 'NOT'? Predicate | '(' OrExpr ')'
//! Predicate  := Field Operator Literal
//!             | Field 'is_empty' | Field 'is_not_empty'
//!             | Field ':' Shortcut
//! ActionList := Action (',' Action)*
//! ```

use super::ast::{Action, ActionOp, CompareOp, ConditionNode, Expression};
use super::lexer::{self, SpannedToken, Token};

/// A parse diagnostic naming the offending span.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Option<(usize, usize)>,
}

impl ParseError {
    fn at(message: impl Into<String>, token: &SpannedToken) -> Self {
        Self {
            message: message.into(),
            span: Some((token.start, token.end)),
        }
    }

    fn eof(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.span {
            Some((start, end)) => write!(f, "{} (at {start}..{end})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

pub fn parse(input: &str) -> Result<Expression, ParseError> {
    let tokens = lexer::tokenize(input).map_err(|e| ParseError {
        message: e.message,
        span: Some((e.position, e.position + 1)),
    })?;
    if tokens.is_empty() {
        return Err(ParseError::eof("empty expression"));
    }

    let mut parser = Parser { tokens, pos: 0 };
    let condition = parser.parse_or()?;

    let actions = if parser.eat_sym("=>") {
        parser.parse_actions()?
    } else {
        Vec::new()
    };

    if let Some(extra) = parser.peek() {
        return Err(ParseError::at(
            format!("unexpected trailing input '{}'", extra.token),
            extra,
        ));
    }

    Ok(Expression { condition, actions })
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<SpannedToken> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(SpannedToken {
            token: Token::Word(word),
            ..
        }) = self.peek()
            && word.eq_ignore_ascii_case(keyword)
        {
            self.pos += 1;
            return true;
        }
        false
    }

    fn eat_sym(&mut self, symbol: &str) -> bool {
        if let Some(SpannedToken {
            token: Token::Sym(s),
            ..
        }) = self.peek()
            && s == symbol
        {
            self.pos += 1;
            return true;
        }
        false
    }

    fn parse_or(&mut self) -> Result<ConditionNode, ParseError> {
        let mut children = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.pop().expect("one child")
        } else {
            ConditionNode::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<ConditionNode, ParseError> {
        let mut children = vec![self.parse_not()?];
        while self.eat_keyword("AND") {
            children.push(self.parse_not()?);
        }
        Ok(if children.len() == 1 {
            children.pop().expect("one child")
        } else {
            ConditionNode::And(children)
        })
    }

    fn parse_not(&mut self) -> Result<ConditionNode, ParseError> {
        if self.eat_keyword("NOT") {
            return Ok(ConditionNode::Not(Box::new(self.parse_not()?)));
        }
        if let Some(SpannedToken {
            token: Token::LParen,
            ..
        }) = self.peek()
        {
            self.pos += 1;
            let inner = self.parse_or()?;
            match self.next() {
                Some(SpannedToken {
                    token: Token::RParen,
                    ..
                }) => return Ok(inner),
                Some(other) => {
                    return Err(ParseError::at("expected ')'", &other));
                }
                None => return Err(ParseError::eof("expected ')'")),
            }
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<ConditionNode, ParseError> {
        let field = self.expect_field()?;

        // Shortcut sugar: field:*HD* and friends.
        if let Some(SpannedToken {
            token: Token::Colon,
            ..
        }) = self.peek()
        {
            self.pos += 1;
            let shortcut = match self.next() {
                Some(SpannedToken {
                    token: Token::Word(word),
                    ..
                }) => word,
                Some(SpannedToken {
                    token: Token::Str(s),
                    ..
                }) => s,
                Some(other) => return Err(ParseError::at("expected shortcut pattern", &other)),
                None => return Err(ParseError::eof("expected shortcut pattern")),
            };
            return Ok(expand_shortcut(field, &shortcut));
        }

        let op_token = self
            .next()
            .ok_or_else(|| ParseError::eof(format!("expected operator after '{field}'")))?;
        let op_text = match &op_token.token {
            Token::Word(word) => word.clone(),
            Token::Sym(sym) => sym.clone(),
            other => {
                return Err(ParseError::at(
                    format!("expected operator, found '{other}'"),
                    &op_token,
                ));
            }
        };

        if op_text.eq_ignore_ascii_case("is_empty") {
            return Ok(ConditionNode::IsEmpty {
                field,
                negated: false,
            });
        }
        if op_text.eq_ignore_ascii_case("is_not_empty") {
            return Ok(ConditionNode::IsEmpty {
                field,
                negated: true,
            });
        }

        let op = CompareOp::from_token(&op_text).ok_or_else(|| {
            ParseError::at(format!("unknown operator '{op_text}'"), &op_token)
        })?;
        let value = self.expect_literal(&op_text)?;
        Ok(ConditionNode::Compare { field, op, value })
    }

    fn parse_actions(&mut self) -> Result<Vec<Action>, ParseError> {
        let mut actions = vec![self.parse_action()?];
        while let Some(SpannedToken {
            token: Token::Comma,
            ..
        }) = self.peek()
        {
            self.pos += 1;
            actions.push(self.parse_action()?);
        }
        Ok(actions)
    }

    fn parse_action(&mut self) -> Result<Action, ParseError> {
        let field = self.expect_field()?;
        let op_token = self
            .next()
            .ok_or_else(|| ParseError::eof(format!("expected action after '{field}'")))?;
        let op_text = match &op_token.token {
            Token::Word(word) => word.clone(),
            Token::Sym(sym) => sym.clone(),
            other => {
                return Err(ParseError::at(
                    format!("expected action operator, found '{other}'"),
                    &op_token,
                ));
            }
        };
        let op: ActionOp = op_text.parse().map_err(|_| {
            ParseError::at(format!("unknown action '{op_text}'"), &op_token)
        })?;

        let value = if op.takes_value() {
            Some(self.expect_literal(&op_text)?)
        } else {
            None
        };

        Ok(Action { field, op, value })
    }

    fn expect_field(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Some(SpannedToken {
                token: Token::Word(word),
                ..
            }) => Ok(word),
            Some(other) => Err(ParseError::at(
                format!("expected field name, found '{}'", other.token),
                &other,
            )),
            None => Err(ParseError::eof("expected field name")),
        }
    }

    fn expect_literal(&mut self, after: &str) -> Result<String, ParseError> {
        match self.next() {
            Some(SpannedToken {
                token: Token::Str(s),
                ..
            }) => Ok(s),
            Some(SpannedToken {
                token: Token::Word(word),
                ..
            }) => Ok(word),
            Some(other) => Err(ParseError::at(
                format!("expected literal after '{after}'"),
                &other,
            )),
            None => Err(ParseError::eof(format!("expected literal after '{after}'"))),
        }
    }
}

/// `*x*` → contains, `x*` → starts_with, `*x` → ends_with, bare → equals.
fn expand_shortcut(field: String, shortcut: &str) -> ConditionNode {
    let leading = shortcut.starts_with('*');
    let trailing = shortcut.ends_with('*') && shortcut.len() > 1;
    let trimmed = shortcut.trim_matches('*').to_string();
    let op = match (leading, trailing) {
        (true, true) => CompareOp::Contains,
        (false, true) => CompareOp::StartsWith,
        (true, false) => CompareOp::EndsWith,
        (false, false) => CompareOp::Equals,
    };
    ConditionNode::Compare {
        field,
        op,
        value: trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_predicate() {
        let expr = parse("group_title equals \"Adult\"").unwrap();
        assert_eq!(
            expr.condition,
            ConditionNode::Compare {
                field: "group_title".into(),
                op: CompareOp::Equals,
                value: "Adult".into(),
            }
        );
        assert!(expr.actions.is_empty());
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a equals \"1\" OR b equals \"2\" AND c equals \"3\"").unwrap();
        match expr.condition {
            ConditionNode::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], ConditionNode::And(_)));
            }
            other => panic!("expected OR at root, got {other:?}"),
        }
    }

    #[test]
    fn parens_override_precedence() {
        let expr = parse("(a equals \"1\" OR b equals \"2\") AND c equals \"3\"").unwrap();
        match expr.condition {
            ConditionNode::And(children) => {
                assert!(matches!(children[0], ConditionNode::Or(_)));
            }
            other => panic!("expected AND at root, got {other:?}"),
        }
    }

    #[test]
    fn not_prefixes_a_predicate() {
        let expr = parse("NOT group_title contains \"XXX\"").unwrap();
        assert!(matches!(expr.condition, ConditionNode::Not(_)));
    }

    #[test]
    fn is_empty_forms() {
        assert_eq!(
            parse("tvg_id is_empty").unwrap().condition,
            ConditionNode::IsEmpty {
                field: "tvg_id".into(),
                negated: false
            }
        );
        assert_eq!(
            parse("tvg_id is_not_empty").unwrap().condition,
            ConditionNode::IsEmpty {
                field: "tvg_id".into(),
                negated: true
            }
        );
    }

    #[test]
    fn shortcut_sugar_expands() {
        assert_eq!(
            parse("channel_name:*HD*").unwrap().condition,
            ConditionNode::Compare {
                field: "channel_name".into(),
                op: CompareOp::Contains,
                value: "HD".into(),
            }
        );
        assert_eq!(
            parse("channel_name:UK*").unwrap().condition,
            ConditionNode::Compare {
                field: "channel_name".into(),
                op: CompareOp::StartsWith,
                value: "UK".into(),
            }
        );
        assert_eq!(
            parse("channel_name:*4K").unwrap().condition,
            ConditionNode::Compare {
                field: "channel_name".into(),
                op: CompareOp::EndsWith,
                value: "4K".into(),
            }
        );
    }

    #[test]
    fn symbolic_operators_parse() {
        assert!(matches!(
            parse("channel_number > 100").unwrap().condition,
            ConditionNode::Compare {
                op: CompareOp::GreaterThan,
                ..
            }
        ));
        assert!(matches!(
            parse("tvg_id != \"x\"").unwrap().condition,
            ConditionNode::Compare {
                op: CompareOp::NotEquals,
                ..
            }
        ));
    }

    #[test]
    fn actions_parse_in_order() {
        let expr = parse(
            "group_title equals \"News\" => channel_name PREPEND \"UK: \", tvg_logo DELETE",
        )
        .unwrap();
        assert_eq!(expr.actions.len(), 2);
        assert_eq!(expr.actions[0].op, ActionOp::Prepend);
        assert_eq!(expr.actions[0].value.as_deref(), Some("UK: "));
        assert_eq!(expr.actions[1].op, ActionOp::Delete);
        assert_eq!(expr.actions[1].value, None);
    }

    #[test]
    fn set_via_equals_sign() {
        let expr = parse("tvg_id is_empty => tvg_id = \"unknown\"").unwrap();
        assert_eq!(expr.actions[0].op, ActionOp::Set);
    }

    #[test]
    fn errors_name_the_span() {
        let err = parse("group_title frobnicates \"x\"").unwrap_err();
        assert!(err.message.contains("frobnicates"));
        assert!(err.span.is_some());
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        assert!(parse("a equals \"1\" bogus").is_err());
    }
}
