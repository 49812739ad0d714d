//! Internal representation every channel step compiles to, whether it was
//! authored as a rule-builder field expression, a mapper step, or a hand-written
//! script. Only the [`ScriptIr::Sandboxed`] variant ever reaches the wasmtime
//! sandbox; field expressions are restricted enough to evaluate natively.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Which lifecycle point a compiled script runs at. Determines the
/// [`crate::script::security::SecurityPolicy`] and scope composition used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptKind {
    /// Runs once at channel deploy.
    Deploy,
    /// Runs once at channel undeploy.
    Undeploy,
    /// Runs once per message before source filter/transform.
    Preprocessor,
    /// Source or destination filter/transform step.
    FilterTransform,
    /// Destination response transformer.
    ResponseTransform,
    /// Runs once per message after every destination completes.
    Postprocessor,
}

/// Comparison a rule-builder field expression evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    /// Field equals the literal.
    Equals,
    /// Field does not equal the literal.
    NotEquals,
    /// Field exists (literal ignored).
    Exists,
    /// Field does not exist (literal ignored).
    NotExists,
    /// Field contains the literal as a substring.
    Contains,
}

/// A single compiled rule-builder field expression: `<field> <op> <value>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldExpressionIr {
    /// Dotted path into the message/map scope, e.g. `"sourceMap.patientId"`.
    pub field: String,
    /// The comparison to apply.
    pub operator: ComparisonOp,
    /// Literal to compare against, ignored by `Exists`/`NotExists`.
    pub value: String,
}

/// A script compiled ahead of time into a WASM module, run inside the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxedScript {
    /// Which lifecycle point this script is attached to.
    pub kind: ScriptKind,
    /// Compiled WASM bytes, produced from the author's source via `wat`/an
    /// external toolchain ahead of deploy.
    pub wasm: Vec<u8>,
}

/// One compiled step of a filter/transform/postprocessor chain.
#[derive(Debug, Clone)]
pub enum ScriptIr {
    /// A natively evaluated rule-builder comparison.
    FieldExpression(FieldExpressionIr),
    /// A sandboxed script module.
    Sandboxed(SandboxedScript),
}

impl ScriptIr {
    /// Compiles `source` (raw WAT text) into a [`ScriptIr::Sandboxed`] step.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyExpression`] if `source` is blank, or
    /// wraps the `wat` parser's error as [`ValidationError::InvalidConfig`].
    pub fn compile_script(kind: ScriptKind, source: &str) -> Result<Self, ValidationError> {
        if source.trim().is_empty() {
            return Err(ValidationError::EmptyExpression);
        }
        let wasm = wat::parse_str(source).map_err(|e| ValidationError::InvalidConfig {
            field: "script_source".to_string(),
            reason: e.to_string(),
        })?;
        Ok(ScriptIr::Sandboxed(SandboxedScript { kind, wasm }))
    }
}
