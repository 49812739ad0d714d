//! Compiles a connector's declared [`FilterRule`]/[`TransformerStep`] lists
//! into [`ScriptIr`] chains, and folds filter results using the declared
//! [`BooleanOperator`] sequence. Each rule/step compiles independently, so a
//! channel with a mix of rule-builder expressions and hand-written scripts
//! produces a chain of mixed [`ScriptIr`] variants; the pipeline dispatches
//! each to the native evaluator or the sandbox as appropriate.

use crate::domain::channel::{BooleanOperator, FilterRule, TransformerStep};
use crate::error::ValidationError;
use crate::script::ir::{ComparisonOp, ScriptIr, ScriptKind};
use crate::script::rule_builder;

/// Parses the small field-expression DSL: `field == value`, `field != value`,
/// `field ~ value` (substring), `field exists`, `field !exists`. Anything
/// that doesn't match is treated as hand-written WAT script source.
fn parse_field_expression(expression: &str) -> Option<(&str, ComparisonOp, &str)> {
    let trimmed = expression.trim();
    if let Some((field, value)) = trimmed.split_once("==") {
        return Some((field.trim(), ComparisonOp::Equals, value.trim()));
    }
    if let Some((field, value)) = trimmed.split_once("!=") {
        return Some((field.trim(), ComparisonOp::NotEquals, value.trim()));
    }
    if let Some((field, value)) = trimmed.split_once('~') {
        return Some((field.trim(), ComparisonOp::Contains, value.trim()));
    }
    if let Some(field) = trimmed.strip_suffix("!exists") {
        return Some((field.trim(), ComparisonOp::NotExists, ""));
    }
    if let Some(field) = trimmed.strip_suffix("exists") {
        return Some((field.trim(), ComparisonOp::Exists, ""));
    }
    None
}

/// Compiles one expression string, dispatching to the rule-builder DSL or
/// falling back to a script module for anything that isn't recognized as a
/// field comparison.
///
/// # Errors
///
/// Propagates [`ValidationError`] from the rule-builder validator or the WAT
/// compiler.
pub fn compile_expression(kind: ScriptKind, expression: &str) -> Result<ScriptIr, ValidationError> {
    if let Some((field, operator, value)) = parse_field_expression(expression) {
        rule_builder::compile_field_expression(field, operator, value)
    } else {
        ScriptIr::compile_script(kind, expression)
    }
}

/// Compiles a connector's enabled filter rules, in declared order, pairing
/// each with the [`BooleanOperator`] it combines with the accumulated result.
///
/// # Errors
///
/// Propagates the first rule's compile error.
pub fn compile_filter_chain(rules: &[FilterRule]) -> Result<Vec<(ScriptIr, BooleanOperator)>, ValidationError> {
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .map(|rule| Ok((compile_expression(ScriptKind::FilterTransform, &rule.expression)?, rule.operator)))
        .collect()
}

/// Compiles a connector's enabled transformer steps, in declared order.
///
/// # Errors
///
/// Propagates the first step's compile error.
pub fn compile_transform_chain(steps: &[TransformerStep]) -> Result<Vec<ScriptIr>, ValidationError> {
    steps
        .iter()
        .filter(|step| step.enabled)
        .map(|step| compile_expression(ScriptKind::FilterTransform, &step.source))
        .collect()
}

/// Folds a sequence of (rule result, combining operator) pairs left to right.
/// The first rule's own operator is ignored, since there is no accumulated
/// result yet to combine it with; an empty chain accepts (a connector with no
/// filter rules passes every message).
#[must_use]
pub fn fold_filter_results(results: impl IntoIterator<Item = (bool, BooleanOperator)>) -> bool {
    let mut iter = results.into_iter();
    let Some((mut accumulated, _)) = iter.next() else {
        return true;
    };
    for (result, operator) in iter {
        accumulated = match operator {
            BooleanOperator::And => accumulated && result,
            BooleanOperator::Or => accumulated || result,
        };
    }
    accumulated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_equals_expression_as_field_expression() {
        let ir = compile_expression(ScriptKind::FilterTransform, "sourceMap.kind == LAB").unwrap();
        assert!(matches!(ir, ScriptIr::FieldExpression(_)));
    }

    #[test]
    fn fold_with_single_rule_ignores_its_operator() {
        assert!(fold_filter_results([(true, BooleanOperator::Or)]));
        assert!(!fold_filter_results([(false, BooleanOperator::And)]));
    }

    #[test]
    fn fold_empty_chain_accepts() {
        assert!(fold_filter_results(Vec::<(bool, BooleanOperator)>::new()));
    }

    #[test]
    fn fold_and_then_or() {
        let chain = [(true, BooleanOperator::And), (false, BooleanOperator::And), (true, BooleanOperator::Or)];
        assert!(fold_filter_results(chain));
    }

    #[test]
    fn rejects_unsafe_expression_via_compile() {
        let result = compile_expression(ScriptKind::FilterTransform, "sourceMap.kind == foo; DROP");
        assert!(result.is_err());
    }
}
