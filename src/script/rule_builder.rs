//! Validates and compiles rule-builder field expressions: the non-script way
//! to author a filter rule or a mapper assignment. Field expressions are a
//! restricted sublanguage (a dotted field path, an operator, a literal) so
//! they never need the wasmtime sandbox; [`validate_expression`] rejects the
//! characters that would let one smuggle in script-like control flow.

use crate::error::ValidationError;
use crate::script::ir::{ComparisonOp, FieldExpressionIr, ScriptIr};

/// Code-injection vectors a rule-builder field expression must never contain.
/// Rule-builder fields are meant to be evaluated as plain data comparisons;
/// allowing statement separators or comment markers through would let an
/// expression escape into script-like behavior the sandboxing decision never
/// covers.
const REJECTED_SUBSTRINGS: &[&str] = &[";", "{", "}", "//", "/*"];

/// Validates a raw field-expression string against the rejected-character
/// list and newline/emptiness rules.
///
/// # Errors
///
/// Returns [`ValidationError::EmptyExpression`] if `expression` is blank, or
/// [`ValidationError::UnsafeExpression`] if it contains a rejected substring
/// or an embedded newline.
pub fn validate_expression(expression: &str) -> Result<(), ValidationError> {
    if expression.trim().is_empty() {
        return Err(ValidationError::EmptyExpression);
    }
    if expression.contains('\n') || expression.contains('\r') {
        return Err(ValidationError::UnsafeExpression(
            "field expressions may not contain newlines".to_string(),
        ));
    }
    for needle in REJECTED_SUBSTRINGS {
        if expression.contains(needle) {
            return Err(ValidationError::UnsafeExpression(format!(
                "field expression contains rejected token {needle:?}"
            )));
        }
    }
    Ok(())
}

/// Compiles a validated `field operator value` expression into a
/// [`FieldExpressionIr`] and wraps it as a [`ScriptIr`] step.
///
/// Expects `field` and `value` to already be split out by the caller (the
/// channel config editor is responsible for presenting the three parts
/// separately; this function does not parse free text).
///
/// # Errors
///
/// Returns [`ValidationError`] if `field` or `value` fails
/// [`validate_expression`].
pub fn compile_field_expression(
    field: &str,
    operator: ComparisonOp,
    value: &str,
) -> Result<ScriptIr, ValidationError> {
    validate_expression(field)?;
    if !matches!(operator, ComparisonOp::Exists | ComparisonOp::NotExists) {
        validate_expression(value)?;
    }
    Ok(ScriptIr::FieldExpression(FieldExpressionIr {
        field: field.to_string(),
        operator,
        value: value.to_string(),
    }))
}

/// Evaluates a compiled field expression against a flat key/value scope
/// (typically the merged result of [`crate::domain::message::Maps::resolve`]
/// for every key the expression might reference).
#[must_use]
pub fn evaluate(expr: &FieldExpressionIr, resolve: impl Fn(&str) -> Option<String>) -> bool {
    let actual = resolve(&expr.field);
    match expr.operator {
        ComparisonOp::Exists => actual.is_some(),
        ComparisonOp::NotExists => actual.is_none(),
        ComparisonOp::Equals => actual.as_deref() == Some(expr.value.as_str()),
        ComparisonOp::NotEquals => actual.as_deref() != Some(expr.value.as_str()),
        ComparisonOp::Contains => actual.is_some_and(|a| a.contains(&expr.value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_semicolon_and_braces() {
        assert!(validate_expression("a; b").is_err());
        assert!(validate_expression("{ a }").is_err());
        assert!(validate_expression("a // comment").is_err());
        assert!(validate_expression("a /* comment */").is_err());
    }

    #[test]
    fn rejects_empty_expression() {
        assert!(validate_expression("").is_err());
        assert!(validate_expression("   ").is_err());
    }

    #[test]
    fn accepts_plain_field_path() {
        assert!(validate_expression("sourceMap.patientId").is_ok());
    }

    #[test]
    fn evaluate_equals() {
        let expr = FieldExpressionIr {
            field: "sourceMap.patientId".to_string(),
            operator: ComparisonOp::Equals,
            value: "123".to_string(),
        };
        assert!(evaluate(&expr, |_| Some("123".to_string())));
        assert!(!evaluate(&expr, |_| Some("456".to_string())));
    }

    #[test]
    fn evaluate_exists_ignores_value() {
        let expr = FieldExpressionIr {
            field: "sourceMap.patientId".to_string(),
            operator: ComparisonOp::NotExists,
            value: String::new(),
        };
        assert!(evaluate(&expr, |_| None));
        assert!(!evaluate(&expr, |_| Some("x".to_string())));
    }
}
