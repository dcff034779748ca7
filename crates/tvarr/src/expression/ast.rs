//! Expression AST shared by the parser and the evaluator.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    NotMatches,
    GreaterThan,
    LessThan,
}

impl CompareOp {
    /// Keyword and symbolic spellings both resolve here (case-insensitive).
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "equals" | "==" => Some(Self::Equals),
            "not_equals" | "!=" => Some(Self::NotEquals),
            "contains" => Some(Self::Contains),
            "not_contains" => Some(Self::NotContains),
            "starts_with" => Some(Self::StartsWith),
            "ends_with" => Some(Self::EndsWith),
            "matches" => Some(Self::Matches),
            "not_matches" => Some(Self::NotMatches),
            "greater_than" | ">" => Some(Self::GreaterThan),
            "less_than" | "<" => Some(Self::LessThan),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::GreaterThan | Self::LessThan)
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Self::Matches | Self::NotMatches)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    Compare {
        field: String,
        op: CompareOp,
        value: String,
    },
    IsEmpty {
        field: String,
        negated: bool,
    },
    Not(Box<ConditionNode>),
    And(Vec<ConditionNode>),
    Or(Vec<ConditionNode>),
}

impl ConditionNode {
    /// Visit every field referenced by the condition tree.
    pub fn visit_fields(&self, visit: &mut impl FnMut(&str)) {
        match self {
            Self::Compare { field, .. } | Self::IsEmpty { field, .. } => visit(field),
            Self::Not(inner) => inner.visit_fields(visit),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.visit_fields(visit);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOp {
    Set,
    SetIfEmpty,
    Append,
    Prepend,
    Remove,
    Delete,
}

impl FromStr for ActionOp {
    type Err = ();

    fn from_str(token: &str) -> Result<Self, ()> {
        match token.to_ascii_uppercase().as_str() {
            "SET" | "=" => Ok(Self::Set),
            "SET_IF_EMPTY" => Ok(Self::SetIfEmpty),
            "APPEND" => Ok(Self::Append),
            "PREPEND" => Ok(Self::Prepend),
            "REMOVE" => Ok(Self::Remove),
            "DELETE" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl ActionOp {
    pub fn takes_value(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub field: String,
    pub op: ActionOp,
    /// Absent only for DELETE.
    pub value: Option<String>,
}

/// A parsed rule: a condition, optionally followed by `=> action, action`.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub condition: ConditionNode,
    pub actions: Vec<Action>,
}
