//! Compilation and evaluation of parsed expressions.
//!
//! Compilation resolves fields against the domain registry and builds the
//! regexes once; evaluation is infallible: missing fields and failed
//! numeric coercions read as "no match", never as errors.

use regex::{Regex, RegexBuilder};

use super::ast::{ActionOp, CompareOp, ConditionNode, Expression};
use super::fields::{self, ExpressionDomain, FieldAccess};
use super::parser::ParseError;

/// A rule compiled for one domain, ready for repeated evaluation.
#[derive(Debug)]
pub struct CompiledExpression {
    domain: ExpressionDomain,
    condition: CompiledCondition,
    actions: Vec<CompiledAction>,
}

#[derive(Debug)]
enum CompiledCondition {
    Compare {
        field: String,
        op: CompareOp,
        value: String,
        numeric: Option<f64>,
        regex: Option<Regex>,
    },
    IsEmpty {
        field: String,
        negated: bool,
    },
    Not(Box<CompiledCondition>),
    And(Vec<CompiledCondition>),
    Or(Vec<CompiledCondition>),
}

#[derive(Debug)]
struct CompiledAction {
    field: String,
    op: ActionOp,
    value: Option<String>,
    remove_regex: Option<Regex>,
}

/// Result of applying a rule to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOutcome {
    pub matched: bool,
    pub mutated: bool,
}

pub fn compile(
    expression: &Expression,
    domain: ExpressionDomain,
) -> Result<CompiledExpression, ParseError> {
    // Field validation first: one diagnostic with a suggestion where we
    // have one.
    let mut unknown: Option<String> = None;
    expression.condition.visit_fields(&mut |field| {
        if unknown.is_none() && !fields::is_valid_field(domain, field) {
            unknown = Some(field.to_string());
        }
    });
    for action in &expression.actions {
        if unknown.is_none() && !fields::is_valid_field(domain, &action.field) {
            unknown = Some(action.field.clone());
        }
    }
    if let Some(bad) = unknown {
        let mut message = format!("unknown field '{bad}'");
        if let Some(suggestion) = fields::suggest(domain, &bad) {
            message.push_str(&format!(", did you mean '{suggestion}'?"));
        }
        message.push_str(&format!(
            " (available: {})",
            fields::fields(domain).join(", ")
        ));
        return Err(ParseError {
            message,
            span: None,
        });
    }

    let condition = compile_condition(&expression.condition)?;

    let mut actions = Vec::with_capacity(expression.actions.len());
    for action in &expression.actions {
        let remove_regex = if action.op == ActionOp::Remove {
            let pattern = action.value.as_deref().unwrap_or_default();
            Some(build_regex(pattern)?)
        } else {
            None
        };
        actions.push(CompiledAction {
            field: action.field.clone(),
            op: action.op,
            value: action.value.clone(),
            remove_regex,
        });
    }

    Ok(CompiledExpression {
        domain,
        condition,
        actions,
    })
}

fn compile_condition(node: &ConditionNode) -> Result<CompiledCondition, ParseError> {
    Ok(match node {
        ConditionNode::Compare { field, op, value } => {
            let regex = if op.is_regex() {
                Some(build_regex(value)?)
            } else {
                None
            };
            let numeric = if op.is_numeric() {
                let parsed = value.trim().parse::<f64>();
                if parsed.is_err() {
                    return Err(ParseError {
                        message: format!(
                            "operator requires a numeric literal, got '{value}'"
                        ),
                        span: None,
                    });
                }
                parsed.ok()
            } else {
                None
            };
            CompiledCondition::Compare {
                field: field.clone(),
                op: *op,
                value: value.clone(),
                numeric,
                regex,
            }
        }
        ConditionNode::IsEmpty { field, negated } => CompiledCondition::IsEmpty {
            field: field.clone(),
            negated: *negated,
        },
        ConditionNode::Not(inner) => CompiledCondition::Not(Box::new(compile_condition(inner)?)),
        ConditionNode::And(children) => CompiledCondition::And(
            children
                .iter()
                .map(compile_condition)
                .collect::<Result<_, _>>()?,
        ),
        ConditionNode::Or(children) => CompiledCondition::Or(
            children
                .iter()
                .map(compile_condition)
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn build_regex(pattern: &str) -> Result<Regex, ParseError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| ParseError {
            message: format!("invalid regex '{pattern}': {e}"),
            span: None,
        })
}

impl CompiledExpression {
    pub fn domain(&self) -> ExpressionDomain {
        self.domain
    }

    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    /// Condition-only check; used by filters and client classification.
    pub fn matches(&self, record: &dyn FieldAccess) -> bool {
        let mut captures = Captures::default();
        eval_condition(&self.condition, record, &mut captures)
    }

    /// Evaluate the condition and, on match, apply the actions in order.
    /// `$1..$9` in action literals refer to the groups of the last
    /// successful `matches` predicate.
    pub fn apply(&self, record: &mut dyn FieldAccess) -> EvalOutcome {
        let mut captures = Captures::default();
        if !eval_condition(&self.condition, record, &mut captures) {
            return EvalOutcome {
                matched: false,
                mutated: false,
            };
        }

        let mut mutated = false;
        for action in &self.actions {
            mutated |= apply_action(action, record, &captures);
        }
        EvalOutcome {
            matched: true,
            mutated,
        }
    }
}

#[derive(Debug, Default)]
struct Captures {
    groups: Vec<String>,
}

impl Captures {
    fn substitute(&self, literal: &str) -> String {
        if self.groups.is_empty() || !literal.contains('$') {
            return literal.to_string();
        }
        let mut result = String::with_capacity(literal.len());
        let mut chars = literal.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '$'
                && let Some(digit) = chars.peek().and_then(|d| d.to_digit(10))
                && (1..=9).contains(&digit)
            {
                chars.next();
                if let Some(group) = self.groups.get(digit as usize - 1) {
                    result.push_str(group);
                }
                continue;
            }
            result.push(c);
        }
        result
    }
}

fn eval_condition(
    condition: &CompiledCondition,
    record: &dyn FieldAccess,
    captures: &mut Captures,
) -> bool {
    match condition {
        CompiledCondition::Compare {
            field,
            op,
            value,
            numeric,
            regex,
        } => {
            // Unknown field: no value, no match.
            let Some(actual) = record.get_field(field) else {
                return false;
            };
            compare(&actual, *op, value, *numeric, regex.as_ref(), captures)
        }
        CompiledCondition::IsEmpty { field, negated } => {
            let empty = record
                .get_field(field)
                .map(|v| v.trim().is_empty())
                .unwrap_or(true);
            empty != *negated
        }
        CompiledCondition::Not(inner) => !eval_condition(inner, record, captures),
        CompiledCondition::And(children) => children
            .iter()
            .all(|child| eval_condition(child, record, captures)),
        CompiledCondition::Or(children) => children
            .iter()
            .any(|child| eval_condition(child, record, captures)),
    }
}

fn compare(
    actual: &str,
    op: CompareOp,
    expected: &str,
    numeric: Option<f64>,
    regex: Option<&Regex>,
    captures: &mut Captures,
) -> bool {
    match op {
        CompareOp::Equals => actual.eq_ignore_ascii_case(expected),
        CompareOp::NotEquals => !actual.eq_ignore_ascii_case(expected),
        CompareOp::Contains => lower(actual).contains(&lower(expected)),
        CompareOp::NotContains => !lower(actual).contains(&lower(expected)),
        CompareOp::StartsWith => lower(actual).starts_with(&lower(expected)),
        CompareOp::EndsWith => lower(actual).ends_with(&lower(expected)),
        CompareOp::Matches => match regex.and_then(|r| r.captures(actual)) {
            Some(groups) => {
                captures.groups = groups
                    .iter()
                    .skip(1)
                    .take(9)
                    .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                true
            }
            None => false,
        },
        CompareOp::NotMatches => !regex.is_some_and(|r| r.is_match(actual)),
        CompareOp::GreaterThan => match (actual.trim().parse::<f64>(), numeric) {
            (Ok(left), Some(right)) => left > right,
            _ => false,
        },
        CompareOp::LessThan => match (actual.trim().parse::<f64>(), numeric) {
            (Ok(left), Some(right)) => left < right,
            _ => false,
        },
    }
}

fn lower(value: &str) -> String {
    value.to_lowercase()
}

fn apply_action(action: &CompiledAction, record: &mut dyn FieldAccess, captures: &Captures) -> bool {
    let current = record.get_field(&action.field).unwrap_or_default();
    match action.op {
        ActionOp::Set => {
            let value = captures.substitute(action.value.as_deref().unwrap_or_default());
            record.set_field(&action.field, &value)
        }
        ActionOp::SetIfEmpty => {
            // Whitespace-only counts as empty.
            if current.trim().is_empty() {
                let value = captures.substitute(action.value.as_deref().unwrap_or_default());
                record.set_field(&action.field, &value)
            } else {
                false
            }
        }
        ActionOp::Append => {
            let suffix = captures.substitute(action.value.as_deref().unwrap_or_default());
            record.set_field(&action.field, &format!("{current}{suffix}"))
        }
        ActionOp::Prepend => {
            let prefix = captures.substitute(action.value.as_deref().unwrap_or_default());
            record.set_field(&action.field, &format!("{prefix}{current}"))
        }
        ActionOp::Remove => match &action.remove_regex {
            Some(regex) => {
                let replaced = regex.replace_all(&current, "").to_string();
                if replaced != current {
                    record.set_field(&action.field, &replaced)
                } else {
                    false
                }
            }
            None => false,
        },
        ActionOp::Delete => record.set_field(&action.field, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::parse;
    use crate::models::Channel;
    use chrono::Utc;
    use ulid::Ulid;

    fn compiled(text: &str) -> CompiledExpression {
        compile(&parse(text).unwrap(), ExpressionDomain::Stream).unwrap()
    }

    fn channel(name: &str, group: &str) -> Channel {
        Channel {
            id: Ulid::new(),
            source_id: Ulid::new(),
            external_id: None,
            tvg_id: None,
            tvg_name: None,
            tvg_logo: None,
            group_title: Some(group.to_string()),
            channel_name: name.to_string(),
            channel_number: None,
            stream_url: "http://up/1.ts".into(),
            stream_type: None,
            language: None,
            country: None,
            is_adult: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn string_comparisons_are_case_insensitive() {
        let rule = compiled("group_title equals \"news\"");
        assert!(rule.matches(&channel("BBC", "News")));
        let rule = compiled("channel_name contains \"hd\"");
        assert!(rule.matches(&channel("Sky HD", "x")));
        assert!(!rule.matches(&channel("Sky", "x")));
    }

    #[test]
    fn numeric_coercion_failure_is_false_not_an_error() {
        let rule = compiled("channel_number > 100");
        // channel_number is unset -> empty string -> parse fails -> false.
        assert!(!rule.matches(&channel("BBC", "News")));
        let mut c = channel("BBC", "News");
        c.channel_number = Some(101);
        assert!(rule.matches(&c));
    }

    #[test]
    fn non_numeric_literal_is_a_validation_diagnostic() {
        let err = compile(
            &parse("channel_number > \"lots\"").unwrap(),
            ExpressionDomain::Stream,
        )
        .unwrap_err();
        assert!(err.message.contains("numeric"));
    }

    #[test]
    fn unknown_field_is_a_diagnostic_with_suggestion() {
        let err = compile(
            &parse("chanel_name equals \"x\"").unwrap(),
            ExpressionDomain::Stream,
        )
        .unwrap_err();
        assert!(err.message.contains("unknown field"));
        assert!(err.message.contains("channel_name"));
    }

    #[test]
    fn actions_apply_in_listed_order() {
        let rule = compiled(
            "group_title equals \"News\" => channel_name PREPEND \"UK: \", channel_name APPEND \" (live)\"",
        );
        let mut c = channel("BBC News", "News");
        let outcome = rule.apply(&mut c);
        assert!(outcome.matched && outcome.mutated);
        assert_eq!(c.channel_name, "UK: BBC News (live)");
    }

    #[test]
    fn set_if_empty_treats_whitespace_as_empty() {
        let rule = compiled("channel_name is_not_empty => tvg_name SET_IF_EMPTY \"fallback\"");
        let mut c = channel("BBC", "News");
        c.tvg_name = Some("   ".to_string());
        rule.apply(&mut c);
        assert_eq!(c.tvg_name.as_deref(), Some("fallback"));

        let mut c = channel("BBC", "News");
        c.tvg_name = Some("keep".to_string());
        rule.apply(&mut c);
        assert_eq!(c.tvg_name.as_deref(), Some("keep"));
    }

    #[test]
    fn remove_deletes_regex_matches() {
        let rule = compiled("channel_name matches \".*\" => channel_name REMOVE \"\\\\s*\\\\[.*?\\\\]\"");
        let mut c = channel("BBC One [Geo-blocked]", "News");
        rule.apply(&mut c);
        assert_eq!(c.channel_name, "BBC One");
    }

    #[test]
    fn delete_clears_to_empty() {
        let rule = compiled("group_title equals \"News\" => tvg_logo DELETE");
        let mut c = channel("BBC", "News");
        c.tvg_logo = Some("http://logo".into());
        rule.apply(&mut c);
        assert_eq!(c.tvg_logo, None);
    }

    #[test]
    fn capture_references_substitute() {
        let rule = compiled(
            "channel_name matches \"^(\\\\w+) (\\\\d+)$\" => tvg_name = \"$1-$2\"",
        );
        let mut c = channel("Sky 101", "x");
        let outcome = rule.apply(&mut c);
        assert!(outcome.matched);
        assert_eq!(c.tvg_name.as_deref(), Some("Sky-101"));
    }

    #[test]
    fn apply_is_idempotent_for_idempotent_actions() {
        let rule = compiled("group_title equals \"News\" => tvg_name = \"fixed\"");
        let mut c = channel("BBC", "News");
        rule.apply(&mut c);
        let first = c.clone();
        rule.apply(&mut c);
        assert_eq!(c, first);
    }

    #[test]
    fn eval_never_errors_on_unknown_runtime_field() {
        // Request-domain rule evaluated against a channel: every lookup
        // misses, the rule simply does not match.
        let rule = compile(
            &parse("user_agent contains \"VLC\"").unwrap(),
            ExpressionDomain::Request,
        )
        .unwrap();
        assert!(!rule.matches(&channel("BBC", "News")));
    }
}
