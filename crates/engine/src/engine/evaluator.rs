//! Condition, iterator and argument evaluation for step activations and
//! transitions.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{AppResult, ErrorKind, StepError};
use crate::events::ActivationOutcome;
use crate::playbook::{Loop, Step};
use crate::template::{Context, TemplateRenderer};

/// Decision for one transition rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecision {
    pub target: String,
    /// Whether the rule fired; a dead rule still produces a (dead) token.
    pub live: bool,
    /// Rendered `args`; empty for dead rules.
    pub args: Map<String, Value>,
}

/// Evaluates guards, iterators and transition rules.
pub struct TransitionEvaluator {
    renderer: TemplateRenderer,
}

impl Default for TransitionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionEvaluator {
    pub fn new() -> Self {
        Self {
            renderer: TemplateRenderer::new(),
        }
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    /// Evaluate a condition expression.
    pub fn evaluate_condition(&self, condition: &str, context: &Context) -> AppResult<bool> {
        self.renderer.evaluate_condition(condition, context)
    }

    /// Step-level `when`. An absent guard passes; a guard that fails to
    /// evaluate counts as false.
    pub fn evaluate_guard(&self, step: &Step, context: &Context) -> bool {
        match step.when.as_deref() {
            None => true,
            Some(condition) => self.condition_or_false(&step.step, condition, context),
        }
    }

    /// Evaluate a step's `next` rules for an activation outcome.
    ///
    /// After success every rule is evaluated and a rule without `when` is
    /// true. After failure only rules with an explicit `when` can fire.
    pub fn evaluate_rules(
        &self,
        step: &Step,
        outcome: ActivationOutcome,
        context: &Context,
    ) -> Vec<RuleDecision> {
        step.transitions()
            .into_iter()
            .map(|rule| {
                let mut live = match (outcome, rule.when.as_deref()) {
                    (ActivationOutcome::Skipped, _) => false,
                    (ActivationOutcome::Failed, None) => false,
                    (ActivationOutcome::Succeeded, None) => true,
                    (_, Some(condition)) => self.condition_or_false(&step.step, condition, context),
                };

                let mut args = Map::new();
                if live && !rule.args.is_empty() {
                    match self.render_args(&rule.args, context) {
                        Ok(rendered) => args = rendered,
                        Err(e) => {
                            warn!(step = %step.step, target = %rule.step, error = %e, "Failed to render transition args; rule not taken");
                            live = false;
                        }
                    }
                }

                RuleDecision {
                    target: rule.step,
                    live,
                    args,
                }
            })
            .collect()
    }

    /// Render an argument mapping.
    pub fn render_args(&self, args: &Map<String, Value>, context: &Context) -> AppResult<Map<String, Value>> {
        let mut rendered = Map::new();
        for (key, value) in args {
            rendered.insert(key.clone(), self.renderer.render_value(value, context)?);
        }
        Ok(rendered)
    }

    /// Evaluate an iterator's source to a finite ordered sequence.
    pub fn evaluate_loop(&self, lp: &Loop, context: &Context) -> Result<Vec<Value>, StepError> {
        let value = match &lp.in_expr {
            Value::String(expr) => self.renderer.resolve(expr, context),
            other => self.renderer.render_value(other, context),
        }
        .map_err(|e| StepError::new(ErrorKind::Configuration, e.to_string()))?;

        match value {
            Value::Array(items) => Ok(items),
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(key, value)| serde_json::json!({"key": key, "value": value}))
                .collect()),
            Value::String(text) => serde_json::from_str::<Vec<Value>>(&text).map_err(|_| {
                StepError::new(
                    ErrorKind::Configuration,
                    format!("Loop source is a string that is not a JSON array: {}", text),
                )
            }),
            Value::Number(n) => match n.as_u64() {
                Some(count) => Ok((0..count).map(Value::from).collect()),
                None => Err(StepError::new(
                    ErrorKind::Configuration,
                    format!("Loop count must be a non-negative integer, got {}", n),
                )),
            },
            other => Err(StepError::new(
                ErrorKind::Configuration,
                format!("Loop source did not evaluate to an iterable: {}", other),
            )),
        }
    }

    fn condition_or_false(&self, step: &str, condition: &str, context: &Context) -> bool {
        match self.evaluate_condition(condition, context) {
            Ok(value) => value,
            Err(e) => {
                warn!(step, condition, error = %e, "Condition evaluation failed; treating as false");
                false
            }
        }
    }
}
