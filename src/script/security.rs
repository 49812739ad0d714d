//! Sandbox security policy: which WASM features and host functions a compiled
//! script may use. Generalizes the teacher's `security.rs` from a per-agent
//! policy to a per-script-kind policy (deploy/undeploy scripts get broader
//! host access than per-message filter/transform scripts).

use serde::{Deserialize, Serialize};

use crate::domain_types::{HostFunctionName, MaxImportFunctions};

/// Feature enablement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureState {
    /// Feature is enabled.
    Enabled,
    /// Feature is disabled.
    Disabled,
}

/// WebAssembly features that can be enabled or disabled for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmFeatures {
    /// SIMD instructions.
    pub simd: FeatureState,
    /// Reference types (`anyref`, `funcref`).
    pub reference_types: FeatureState,
    /// Bulk memory operations.
    pub bulk_memory: FeatureState,
    /// Threading support.
    pub threads: FeatureState,
}

impl WasmFeatures {
    /// All advanced features disabled.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            simd: FeatureState::Disabled,
            reference_types: FeatureState::Disabled,
            bulk_memory: FeatureState::Disabled,
            threads: FeatureState::Disabled,
        }
    }
}

impl Default for WasmFeatures {
    fn default() -> Self {
        Self::strict()
    }
}

/// Host-facing access permissions. Per-message scripts never get either; only
/// deploy/undeploy scripts may be granted them via channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPermissions {
    /// Allow the `httpRequest` host function.
    pub network: bool,
    /// Allow the `readFile`/`writeFile` host functions.
    pub filesystem: bool,
}

impl AccessPermissions {
    /// No external access permitted.
    #[must_use]
    pub fn none() -> Self {
        Self { network: false, filesystem: false }
    }
}

impl Default for AccessPermissions {
    fn default() -> Self {
        Self::none()
    }
}

/// Security policy a [`crate::script::sandbox::Sandbox`] is constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// WASM feature configuration.
    pub wasm_features: WasmFeatures,
    /// System access permissions.
    pub access_permissions: AccessPermissions,
    /// Whether the sandbox enforces a fuel budget.
    pub enable_fuel_metering: bool,
    /// Cap on host import functions visible to the module.
    pub max_import_functions: MaxImportFunctions,
    /// Host functions the module may import.
    pub allowed_host_functions: Vec<HostFunctionName>,
}

impl SecurityPolicy {
    /// Policy used for per-message filter/transform/response-transform/
    /// postprocessor scripts: log, time, and map access only, no network or
    /// filesystem.
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded host function names fail validation, which
    /// would indicate a bug in this function, not caller input.
    #[must_use]
    pub fn message_script() -> Self {
        Self {
            wasm_features: WasmFeatures::strict(),
            access_permissions: AccessPermissions::none(),
            enable_fuel_metering: true,
            max_import_functions: MaxImportFunctions::try_new(8).unwrap(),
            allowed_host_functions: ["log", "getTime", "getMapValue", "setMapValue"]
                .into_iter()
                .map(|n| HostFunctionName::try_new(n).unwrap())
                .collect(),
        }
    }

    /// Policy used for deploy/undeploy scripts, which may need network or
    /// filesystem access to provision external resources.
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded host function names fail validation.
    #[must_use]
    pub fn lifecycle_script() -> Self {
        Self {
            wasm_features: WasmFeatures::strict(),
            access_permissions: AccessPermissions { network: true, filesystem: true },
            enable_fuel_metering: true,
            max_import_functions: MaxImportFunctions::try_new(16).unwrap(),
            allowed_host_functions: ["log", "getTime", "httpRequest", "readFile", "writeFile"]
                .into_iter()
                .map(|n| HostFunctionName::try_new(n).unwrap())
                .collect(),
        }
    }

    /// Whether `function_name` is in the allow-list.
    #[must_use]
    pub fn is_function_allowed(&self, function_name: &str) -> bool {
        HostFunctionName::try_new(function_name)
            .is_ok_and(|name| self.allowed_host_functions.contains(&name))
    }

    /// Validates internal consistency.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enable_fuel_metering && self.wasm_features.threads == FeatureState::Enabled {
            return Err("fuel metering must be enabled when threads are allowed".to_string());
        }
        if self.access_permissions.filesystem && self.allowed_host_functions.is_empty() {
            return Err("filesystem access requires at least one allowed host function".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_script_policy_denies_network_and_filesystem() {
        let policy = SecurityPolicy::message_script();
        assert!(!policy.access_permissions.network);
        assert!(!policy.access_permissions.filesystem);
        assert!(policy.is_function_allowed("log"));
        assert!(!policy.is_function_allowed("httpRequest"));
    }

    #[test]
    fn lifecycle_script_policy_allows_network_and_filesystem() {
        let policy = SecurityPolicy::lifecycle_script();
        assert!(policy.access_permissions.network);
        assert!(policy.validate().is_ok());
    }
}
