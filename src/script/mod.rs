//! The Script Runtime: compiles and sandboxes every script-like channel step
//! (deploy/undeploy hooks, preprocessor/postprocessor, filter/transform,
//! response transform), and natively evaluates rule-builder field expressions
//! that never need the sandbox. See `ir`, `security`, `sandbox`, `scope`,
//! `compose`, and `rule_builder` for the pieces.

pub mod compose;
pub mod ir;
pub mod rule_builder;
pub mod sandbox;
pub mod scope;
pub mod security;

pub use ir::{ComparisonOp, FieldExpressionIr, SandboxedScript, ScriptIr, ScriptKind};
pub use sandbox::{ScriptOutput, ScriptSandbox};
pub use scope::ScriptScope;
pub use security::SecurityPolicy;

use crate::domain_types::{ScriptFuelBudget, ScriptTimeoutMs};
use crate::error::ScriptError;

/// Runs one compiled [`ScriptIr`] step against a scope, dispatching
/// [`ScriptIr::FieldExpression`] to the native evaluator and
/// [`ScriptIr::Sandboxed`] to the wasmtime sandbox.
pub struct ScriptRuntime {
    sandbox: ScriptSandbox,
}

impl ScriptRuntime {
    /// Builds a runtime around a fresh wasmtime engine.
    ///
    /// # Errors
    ///
    /// Propagates [`ScriptError::Compile`] if the engine cannot be configured.
    pub fn new() -> Result<Self, ScriptError> {
        Ok(Self { sandbox: ScriptSandbox::new()? })
    }

    /// Evaluates a filter/transform step. Field expressions resolve
    /// synchronously against `scope`'s maps; sandboxed scripts run under
    /// `fuel_budget`/`timeout` and their exit code `0` is treated as boolean
    /// `true` (pass/accept) for filter steps.
    ///
    /// # Errors
    ///
    /// Propagates [`ScriptError::Compile`] if a sandboxed step's module fails
    /// to compile, or any error [`sandbox::ScriptSandbox::run`] returns.
    pub async fn evaluate_step(
        &self,
        step: &ScriptIr,
        scope: ScriptScope,
        policy: SecurityPolicy,
        fuel_budget: ScriptFuelBudget,
        timeout: ScriptTimeoutMs,
    ) -> Result<StepResult, ScriptError> {
        match step {
            ScriptIr::FieldExpression(expr) => {
                let accepted = rule_builder::evaluate(expr, |field| {
                    if field == "msg" || field == "message" {
                        return scope.message_content.clone();
                    }
                    scope
                        .maps
                        .resolve(field, &scope.global_channel_map, &scope.global_map, &scope.configuration_map)
                        .map(str::to_string)
                });
                Ok(StepResult { accepted, content: scope.message_content, map_mutations: Vec::new() })
            }
            ScriptIr::Sandboxed(script) => {
                let module = self.sandbox.compile(script)?;
                let original_content = scope.message_content.clone();
                let output = self.sandbox.run(&module, scope, policy, fuel_budget, timeout).await?;
                let content = output.content.or(original_content);
                Ok(StepResult { accepted: output.exit_code == 0, content, map_mutations: output.map_mutations })
            }
        }
    }
}

/// Outcome of evaluating one [`ScriptIr`] step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Whether the step passed (filter semantics) or completed without error
    /// (transform semantics).
    pub accepted: bool,
    /// Content, possibly unchanged if this step didn't mutate it.
    pub content: Option<String>,
    /// Map mutations the step recorded.
    pub map_mutations: Vec<(String, String)>,
}
