//! Review rule model and load-time validation.
//!
//! A [`ReviewRule`] owns a boolean tree of [`RuleNode`]s. Leaves are
//! [`Condition`]s that compare either a content field or the result of a
//! function call against an operand; inner nodes are [`RuleGroup`]s that
//! combine their children with a [`GroupLogic`].
//!
//! Rules are stored as JSON. The tree shape is untagged so that stored rules
//! read naturally:
//!
//! ```json
//! {
//!   "logic": "AND",
//!   "conditions": [
//!     {"field": "author.level", "operator": "lt", "value": 3},
//!     {"function": {"name": "has_url"}, "operator": "eq", "value": true}
//!   ]
//! }
//! ```
//!
//! Every structural problem is caught by [`ReviewRule::validate`] when a rule
//! is loaded into a snapshot. Evaluation never sees a malformed tree.

pub mod snapshot;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content::{ContentKind, PartitionKey};
use crate::errors::RuleError;
use crate::functions::FunctionCall;

pub use snapshot::{RuleSnapshot, SnapshotPublisher, SnapshotReader, snapshot_channel};

/// Default limit on nesting depth for rule trees.
pub const DEFAULT_MAX_RULE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    #[serde(alias = "ge")]
    Gte,
    Lt,
    #[serde(alias = "le")]
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    Regex,
    NotRegex,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::Regex => "regex",
            Operator::NotRegex => "not_regex",
        }
    }
}

/// What a condition inspects.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionSubject {
    /// Dot-separated path into the content view.
    Field(String),
    /// Result of a named function evaluated against the content.
    Function(FunctionCall),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConditionRepr", into = "ConditionRepr")]
pub struct Condition {
    pub subject: ConditionSubject,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn field(path: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            subject: ConditionSubject::Field(path.into()),
            operator,
            value,
        }
    }

    pub fn function(call: FunctionCall, operator: Operator, value: Value) -> Self {
        Self {
            subject: ConditionSubject::Function(call),
            operator,
            value,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ConditionRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function: Option<FunctionCall>,
    operator: Operator,
    #[serde(default)]
    value: Value,
}

impl TryFrom<ConditionRepr> for Condition {
    type Error = String;

    fn try_from(repr: ConditionRepr) -> Result<Self, Self::Error> {
        let subject = match (repr.field, repr.function) {
            (Some(path), None) => ConditionSubject::Field(path),
            (None, Some(call)) => ConditionSubject::Function(call),
            (Some(_), Some(_)) => {
                return Err("condition sets both field and function".to_string());
            }
            (None, None) => return Err("condition sets neither field nor function".to_string()),
        };

        Ok(Self {
            subject,
            operator: repr.operator,
            value: repr.value,
        })
    }
}

impl From<Condition> for ConditionRepr {
    fn from(condition: Condition) -> Self {
        let (field, function) = match condition.subject {
            ConditionSubject::Field(path) => (Some(path), None),
            ConditionSubject::Function(call) => (None, Some(call)),
        };
        Self {
            field,
            function,
            operator: condition.operator,
            value: condition.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupLogic {
    And,
    Or,
    Not,
    Xor,
    Xnor,
    Nand,
    Nor,
}

impl GroupLogic {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupLogic::And => "AND",
            GroupLogic::Or => "OR",
            GroupLogic::Not => "NOT",
            GroupLogic::Xor => "XOR",
            GroupLogic::Xnor => "XNOR",
            GroupLogic::Nand => "NAND",
            GroupLogic::Nor => "NOR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub logic: GroupLogic,
    #[serde(alias = "children")]
    pub conditions: Vec<RuleNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Group(RuleGroup),
    Condition(Condition),
}

impl RuleNode {
    pub fn group(logic: GroupLogic, conditions: Vec<RuleNode>) -> Self {
        RuleNode::Group(RuleGroup { logic, conditions })
    }

    /// Depth of the deepest leaf, counting this node as 1.
    pub fn depth(&self) -> usize {
        match self {
            RuleNode::Condition(_) => 1,
            RuleNode::Group(group) => {
                1 + group
                    .conditions
                    .iter()
                    .map(RuleNode::depth)
                    .max()
                    .unwrap_or(0)
            }
        }
    }

    fn validate(&self, rule_id: i64, depth: usize, max_depth: usize) -> Result<(), RuleError> {
        if depth > max_depth {
            return Err(RuleError::DepthExceeded { rule_id, max_depth });
        }

        match self {
            RuleNode::Condition(condition) => validate_condition(rule_id, condition),
            RuleNode::Group(group) => {
                if group.conditions.is_empty() {
                    return Err(RuleError::EmptyGroup {
                        rule_id,
                        logic: group.logic.as_str().to_string(),
                    });
                }
                if group.logic == GroupLogic::Not && group.conditions.len() != 1 {
                    return Err(RuleError::NotArity {
                        rule_id,
                        children: group.conditions.len(),
                    });
                }
                group
                    .conditions
                    .iter()
                    .try_for_each(|child| child.validate(rule_id, depth + 1, max_depth))
            }
        }
    }
}

impl From<Condition> for RuleNode {
    fn from(condition: Condition) -> Self {
        RuleNode::Condition(condition)
    }
}

fn validate_condition(rule_id: i64, condition: &Condition) -> Result<(), RuleError> {
    match &condition.subject {
        ConditionSubject::Field(path) if path.trim().is_empty() => {
            return Err(RuleError::EmptyFieldPath { rule_id });
        }
        ConditionSubject::Function(call) if call.name.trim().is_empty() => {
            return Err(RuleError::EmptyFunctionName { rule_id });
        }
        _ => {}
    }

    match condition.operator {
        Operator::In | Operator::NotIn if !condition.value.is_array() => {
            Err(RuleError::InvalidMembershipOperand {
                rule_id,
                operator: condition.operator.as_str().to_string(),
            })
        }
        Operator::Regex | Operator::NotRegex => {
            let pattern = condition
                .value
                .as_str()
                .ok_or_else(|| RuleError::InvalidRegex {
                    rule_id,
                    pattern: condition.value.to_string(),
                    details: "pattern must be a string".to_string(),
                })?;
            Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| RuleError::InvalidRegex {
                    rule_id,
                    pattern: pattern.to_string(),
                    details: e.to_string(),
                })
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Delete,
    Ban,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Content kinds a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    #[serde(alias = "All")]
    All,
    Thread,
    Post,
    Comment,
}

impl TargetType {
    pub fn applies_to(&self, kind: ContentKind) -> bool {
        match self {
            TargetType::All => true,
            TargetType::Thread => kind == ContentKind::Thread,
            TargetType::Post => kind == ContentKind::Post,
            TargetType::Comment => kind == ContentKind::Comment,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "all" => Some(TargetType::All),
            "thread" => Some(TargetType::Thread),
            "post" => Some(TargetType::Post),
            "comment" => Some(TargetType::Comment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Higher values are applied first.
    pub priority: i32,
    #[serde(rename = "fid", alias = "partition_key")]
    pub partition_key: PartitionKey,
    #[serde(default)]
    pub target_type: TargetType,
    pub trigger: RuleNode,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl ReviewRule {
    /// Reject trees that are empty, too deep, or carry operands the matcher
    /// cannot apply.
    pub fn validate(&self, max_depth: usize) -> Result<(), RuleError> {
        self.trigger.validate(self.id, 1, max_depth)
    }

    /// Whether the rule should be considered for an event.
    pub fn applies_to(&self, partition: PartitionKey, kind: ContentKind) -> bool {
        self.enabled && self.partition_key == partition && self.target_type.applies_to(kind)
    }
}

/// Decode a stored trigger tree.
pub fn decode_trigger(rule_id: i64, value: Value) -> Result<RuleNode, RuleError> {
    serde_json::from_value(value).map_err(|e| RuleError::DecodeFailed {
        rule_id,
        details: e.to_string(),
    })
}

/// Decode a stored action list.
pub fn decode_actions(rule_id: i64, value: Value) -> Result<Vec<Action>, RuleError> {
    if value.is_null() {
        return Ok(vec![]);
    }
    serde_json::from_value(value).map_err(|e| RuleError::DecodeFailed {
        rule_id,
        details: e.to_string(),
    })
}
