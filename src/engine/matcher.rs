//! Rule tree evaluation.
//!
//! Nodes evaluate to a three-valued [`Verdict`]. Only a function-backed
//! condition can produce `Verdict::Error`; groups absorb it:
//!
//! | Logic | Error child counts as |
//! |---|---|
//! | AND, NAND | not true |
//! | NOT | false, so NOT yields true |
//! | OR, NOR, XOR, XNOR | excluded from the operands |
//!
//! Children are evaluated strictly left to right, one at a time, and
//! evaluation stops as soon as the group's result is decided.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::operators::{RegexCache, apply};
use crate::content::{ContentEvent, ContentRef};
use crate::errors::FunctionError;
use crate::functions::{FunctionCall, FunctionProvider};
use crate::rules::{
    Action, Condition, ConditionSubject, GroupLogic, ReviewRule, RuleGroup, RuleNode,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    True,
    False,
    Error(FunctionError),
}

impl Verdict {
    pub fn is_true(&self) -> bool {
        matches!(self, Verdict::True)
    }
}

impl From<bool> for Verdict {
    fn from(value: bool) -> Self {
        if value { Verdict::True } else { Verdict::False }
    }
}

/// One rule matching one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewMatch {
    pub rule_id: i64,
    pub rule_name: String,
    pub priority: i32,
    pub content: ContentRef,
    pub actions: Vec<Action>,
}

impl ReviewMatch {
    fn new(rule: &ReviewRule, content: &ContentEvent) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            priority: rule.priority,
            content: content.content_ref(),
            actions: rule.actions.clone(),
        }
    }
}

/// Everything produced by matching one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// Matches in rule order.
    pub matches: Vec<ReviewMatch>,
    /// Successful function results keyed by call signature.
    pub function_results: BTreeMap<String, Value>,
    /// Function calls that failed while evaluating this event.
    pub function_errors: Vec<FunctionError>,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        !self.matches.is_empty()
    }
}

/// Per-event memo of function results.
#[derive(Default)]
struct EvaluationContext {
    calls: HashMap<String, Result<Value, FunctionError>>,
    order: Vec<String>,
}

impl EvaluationContext {
    fn into_parts(self) -> (BTreeMap<String, Value>, Vec<FunctionError>) {
        let mut results = BTreeMap::new();
        let mut errors = Vec::new();
        let mut calls = self.calls;
        for signature in self.order {
            match calls.remove(&signature) {
                Some(Ok(value)) => {
                    results.insert(signature, value);
                }
                Some(Err(e)) => errors.push(e),
                None => {}
            }
        }
        (results, errors)
    }
}

pub struct RuleMatcher {
    provider: Arc<FunctionProvider>,
    regexes: RegexCache,
}

impl RuleMatcher {
    pub fn new(provider: Arc<FunctionProvider>) -> Self {
        Self {
            provider,
            regexes: RegexCache::default(),
        }
    }

    /// Evaluate `rules` in order against `content`.
    ///
    /// Only enabled rules of the event's partition and content kind are
    /// considered. Each rule is evaluated independently; a failing function
    /// makes its condition an error, never the whole batch.
    pub async fn match_rules(
        &self,
        content: &ContentEvent,
        rules: &[Arc<ReviewRule>],
    ) -> MatchOutcome {
        let mut context = EvaluationContext::default();
        let mut matches = Vec::new();

        for rule in rules
            .iter()
            .filter(|rule| rule.applies_to(content.fid(), content.kind()))
        {
            match self.evaluate(&rule.trigger, content, &mut context).await {
                Verdict::True => {
                    trace!(rule_id = rule.id, "Rule matched");
                    matches.push(ReviewMatch::new(rule, content));
                }
                Verdict::False => {}
                Verdict::Error(e) => {
                    debug!(rule_id = rule.id, error = ?e, "Rule trigger failed, treating as no match");
                }
            }
        }

        let (function_results, function_errors) = context.into_parts();
        MatchOutcome {
            matches,
            function_results,
            function_errors,
        }
    }

    /// Evaluate a single tree. Exposed for rule previews and tests.
    pub async fn evaluate_node(&self, node: &RuleNode, content: &ContentEvent) -> Verdict {
        let mut context = EvaluationContext::default();
        self.evaluate(node, content, &mut context).await
    }

    fn evaluate<'a>(
        &'a self,
        node: &'a RuleNode,
        content: &'a ContentEvent,
        context: &'a mut EvaluationContext,
    ) -> Pin<Box<dyn Future<Output = Verdict> + Send + 'a>> {
        Box::pin(async move {
            match node {
                RuleNode::Condition(condition) => {
                    self.evaluate_condition(condition, content, context).await
                }
                RuleNode::Group(group) => self.evaluate_group(group, content, context).await,
            }
        })
    }

    async fn evaluate_group(
        &self,
        group: &RuleGroup,
        content: &ContentEvent,
        context: &mut EvaluationContext,
    ) -> Verdict {
        let mut trues = 0usize;

        for child in &group.conditions {
            let verdict = self.evaluate(child, content, context).await;
            if verdict.is_true() {
                trues += 1;
            }

            let decided = match group.logic {
                GroupLogic::And | GroupLogic::Nand | GroupLogic::Not => !verdict.is_true(),
                GroupLogic::Or | GroupLogic::Nor => verdict.is_true(),
                GroupLogic::Xor | GroupLogic::Xnor => trues > 1,
            };
            if decided {
                break;
            }
        }

        let result = match group.logic {
            GroupLogic::And => trues == group.conditions.len(),
            GroupLogic::Nand => trues != group.conditions.len(),
            GroupLogic::Or => trues > 0,
            GroupLogic::Nor => trues == 0,
            GroupLogic::Not => trues == 0,
            GroupLogic::Xor => trues == 1,
            GroupLogic::Xnor => trues != 1,
        };

        trace!(logic = group.logic.as_str(), trues, result, "Group evaluated");
        Verdict::from(result)
    }

    async fn evaluate_condition(
        &self,
        condition: &Condition,
        content: &ContentEvent,
        context: &mut EvaluationContext,
    ) -> Verdict {
        match &condition.subject {
            ConditionSubject::Field(path) => Verdict::from(apply(
                condition.operator,
                content.field(path),
                &condition.value,
                &self.regexes,
            )),
            ConditionSubject::Function(call) => {
                match self.call_function(call, content, context).await {
                    Ok(value) => {
                        let subject = (!value.is_null()).then_some(&value);
                        Verdict::from(apply(
                            condition.operator,
                            subject,
                            &condition.value,
                            &self.regexes,
                        ))
                    }
                    Err(e) => Verdict::Error(e),
                }
            }
        }
    }

    async fn call_function(
        &self,
        call: &FunctionCall,
        content: &ContentEvent,
        context: &mut EvaluationContext,
    ) -> Result<Value, FunctionError> {
        let signature = call.signature();
        if let Some(result) = context.calls.get(&signature) {
            return result.clone();
        }

        let result = self.provider.resolve(call, content).await;
        if let Err(e) = &result {
            debug!(function = %signature, error = ?e, "Function call failed");
        }
        context.calls.insert(signature.clone(), result.clone());
        context.order.push(signature);
        result
    }
}
