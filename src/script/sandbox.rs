//! wasmtime-backed sandbox for one script invocation. Unlike the teacher's
//! long-lived per-agent `Sandbox`, a script sandbox is single-use: every
//! invocation gets a fresh [`wasmtime::Store`] so no object-realm state leaks
//! between messages (`spec.md`'s "fresh Store per invocation" requirement).
//! The host-function wiring, `ResourceLimiter`, and fuel/timeout plumbing are
//! ported from the teacher's `sandbox.rs`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, instrument, warn};
use wasmtime::{Config, Engine, Linker, Module, ResourceLimiter, Store, StoreLimits, StoreLimitsBuilder};

use crate::domain_types::{ScriptFuelBudget, ScriptTimeoutMs};
use crate::error::ScriptError;
use crate::script::ir::SandboxedScript;
use crate::script::scope::ScriptScope;
use crate::script::security::SecurityPolicy;

/// Result of one sandboxed invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    /// Exit code the module's `run` export returned (`0` = success).
    pub exit_code: i32,
    /// Fuel actually consumed by the call.
    pub fuel_consumed: u64,
    /// Map mutations the host functions recorded during the call.
    pub map_mutations: Vec<(String, String)>,
    /// The working content (`msg`/`tmp`) the script wrote back, if any. `None`
    /// means the script never called `set_content`, so the caller should keep
    /// whatever content it had going in.
    pub content: Option<String>,
}

struct SandboxState {
    limits: StoreLimits,
    max_memory: usize,
    scope: ScriptScope,
    mutations: Vec<(String, String)>,
    content: Option<String>,
    policy: SecurityPolicy,
}

impl ResourceLimiter for SandboxState {
    fn memory_growing(&mut self, _current: usize, desired: usize, _maximum: Option<usize>) -> wasmtime::Result<bool> {
        if desired > self.max_memory {
            warn!(desired, max = self.max_memory, "sandbox memory growth denied");
            return Ok(false);
        }
        Ok(true)
    }

    fn table_growing(&mut self, _current: usize, desired: usize, _maximum: Option<usize>) -> wasmtime::Result<bool> {
        Ok(desired <= 10_000)
    }
}

/// Builds a script module from source bytes and runs it once to completion,
/// under the caller's fuel budget and wall-clock timeout.
pub struct ScriptSandbox {
    engine: Engine,
    memory_usage: Arc<AtomicUsize>,
}

impl ScriptSandbox {
    /// Builds a sandbox. One `ScriptSandbox` (and its `wasmtime::Engine`, which
    /// is expensive to construct) is shared across every invocation of every
    /// channel; only the `Store` is per-invocation.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Compile`] if the wasmtime engine cannot be
    /// configured (should not happen with a hardcoded config).
    pub fn new() -> Result<Self, ScriptError> {
        let mut config = Config::new();
        config.async_support(true);
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|e| ScriptError::Compile(e.to_string()))?;
        Ok(Self { engine, memory_usage: Arc::new(AtomicUsize::new(0)) })
    }

    /// Compiles a script's WASM bytes into a [`Module`].
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Compile`] if the bytes are not valid WASM.
    pub fn compile(&self, script: &SandboxedScript) -> Result<Module, ScriptError> {
        Module::new(&self.engine, &script.wasm).map_err(|e| ScriptError::Compile(e.to_string()))
    }

    fn setup_host_functions(linker: &mut Linker<SandboxState>, policy: &SecurityPolicy) -> Result<(), ScriptError> {
        linker
            .func_wrap("env", "log", |_caller: wasmtime::Caller<'_, SandboxState>, ptr: i32, len: i32| {
                debug!(ptr, len, "script log call");
            })
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        linker
            .func_wrap("env", "get_time", |_caller: wasmtime::Caller<'_, SandboxState>| -> i64 {
                i64::try_from(chrono::Utc::now().timestamp()).unwrap_or(i64::MAX)
            })
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        linker
            .func_wrap(
                "env",
                "set_map_value",
                |mut caller: wasmtime::Caller<'_, SandboxState>, key_ptr: i32, key_len: i32, val_ptr: i32, val_len: i32| -> i32 {
                    let Some(memory) = caller.get_export("memory").and_then(wasmtime::Extern::into_memory) else {
                        return -1;
                    };
                    let key = read_utf8(&memory, &caller, key_ptr, key_len);
                    let value = read_utf8(&memory, &caller, val_ptr, val_len);
                    match (key, value) {
                        (Some(key), Some(value)) => {
                            caller.data_mut().mutations.push((key, value));
                            0
                        }
                        _ => -1,
                    }
                },
            )
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        linker
            .func_wrap(
                "env",
                "set_content",
                |mut caller: wasmtime::Caller<'_, SandboxState>, ptr: i32, len: i32| -> i32 {
                    let Some(memory) = caller.get_export("memory").and_then(wasmtime::Extern::into_memory) else {
                        return -1;
                    };
                    match read_utf8(&memory, &caller, ptr, len) {
                        Some(content) => {
                            caller.data_mut().content = Some(content);
                            0
                        }
                        None => -1,
                    }
                },
            )
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        if policy.is_function_allowed("httpRequest") {
            linker
                .func_wrap("env", "http_request", |_caller: wasmtime::Caller<'_, SandboxState>, _ptr: i32, _len: i32| -> i32 {
                    // Outbound HTTP from a deploy/undeploy script is provisioned
                    // by the connector surface, not executed here.
                    -1
                })
                .map_err(|e| ScriptError::Compile(e.to_string()))?;
        }

        Ok(())
    }

    /// Runs a compiled script module's `run` export to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Timeout`] if `timeout` elapses,
    /// [`ScriptError::FuelExhausted`] if the budget is consumed before the
    /// call returns, or [`ScriptError::Execution`] for any other trap or
    /// missing export.
    #[instrument(skip(self, module, scope, policy), fields(fuel_budget = fuel_budget.into_inner()))]
    pub async fn run(
        &self,
        module: &Module,
        scope: ScriptScope,
        policy: SecurityPolicy,
        fuel_budget: ScriptFuelBudget,
        timeout: ScriptTimeoutMs,
    ) -> Result<ScriptOutput, ScriptError> {
        let mut linker = Linker::new(&self.engine);
        Self::setup_host_functions(&mut linker, &policy)?;

        let limits = StoreLimitsBuilder::new().memory_size(64 * 1024 * 1024).instances(1).build();
        let state = SandboxState { limits, max_memory: 64 * 1024 * 1024, scope, mutations: Vec::new(), content: None, policy };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| state);
        store
            .set_fuel(fuel_budget.into_inner())
            .map_err(|e| ScriptError::Execution(e.to_string()))?;

        let run_future = async {
            let instance = linker
                .instantiate_async(&mut store, module)
                .await
                .map_err(|e| ScriptError::Execution(e.to_string()))?;

            if let Some(memory) = instance.get_memory(&mut store, "memory") {
                self.memory_usage.store(memory.data_size(&store), Ordering::Relaxed);
            }

            let entry = instance
                .get_typed_func::<(), i32>(&mut store, "run")
                .map_err(|e| ScriptError::Execution(format!("missing `run` export: {e}")))?;

            entry.call_async(&mut store, ()).await.map_err(|e| ScriptError::Execution(e.to_string()))
        };

        let exit_code = tokio::time::timeout(Duration::from_millis(timeout.into_inner()), run_future)
            .await
            .map_err(|_| ScriptError::Timeout)??;

        let remaining = store.get_fuel().unwrap_or(0);
        let consumed = fuel_budget.into_inner().saturating_sub(remaining);
        if remaining == 0 {
            return Err(ScriptError::FuelExhausted);
        }

        let data = store.into_data();
        Ok(ScriptOutput { exit_code, fuel_consumed: consumed, map_mutations: data.mutations, content: data.content })
    }

    /// Most recent peak memory footprint observed across invocations, for
    /// diagnostics.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

fn read_utf8(memory: &wasmtime::Memory, store: &impl wasmtime::AsContext, ptr: i32, len: i32) -> Option<String> {
    if ptr < 0 || len < 0 {
        return None;
    }
    let data = memory.data(store);
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    data.get(start..end).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSTHROUGH_WAT: &str = r#"
        (module
            (func (export "run") (result i32)
                i32.const 0))
    "#;

    #[tokio::test]
    async fn runs_a_trivial_module_to_completion() {
        let sandbox = ScriptSandbox::new().unwrap();
        let wasm = wat::parse_str(PASSTHROUGH_WAT).unwrap();
        let module = Module::new(&sandbox.engine, &wasm).unwrap();

        let output = sandbox
            .run(
                &module,
                ScriptScope::default(),
                SecurityPolicy::message_script(),
                ScriptFuelBudget::try_new(1_000_000).unwrap(),
                ScriptTimeoutMs::try_new(1_000).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn missing_run_export_is_an_execution_error() {
        let sandbox = ScriptSandbox::new().unwrap();
        let wasm = wat::parse_str("(module)").unwrap();
        let module = Module::new(&sandbox.engine, &wasm).unwrap();

        let result = sandbox
            .run(
                &module,
                ScriptScope::default(),
                SecurityPolicy::message_script(),
                ScriptFuelBudget::try_new(1_000_000).unwrap(),
                ScriptTimeoutMs::try_new(1_000).unwrap(),
            )
            .await;

        assert!(matches!(result, Err(ScriptError::Execution(_))));
    }
}
