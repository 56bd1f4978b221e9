//! Compiler configuration
//!
//! One [`CompilerConfig`] value per invocation; there is no process-wide
//! state. The config deserializes from TOML so drivers can ship defaults as
//! files, and every field has a default matching the reference setup:
//! 32 KiB per-thread stack, 1 KiB per-subgroup stack, SPIR-V 1.4.

use serde::Deserialize;

const KIB: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SpirvVersion {
    pub major: u8,
    pub minor: u8,
}

impl Default for SpirvVersion {
    fn default() -> Self {
        SpirvVersion { major: 1, minor: 4 }
    }
}

impl SpirvVersion {
    pub fn at_least(self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

/// Which lowerings are forced on regardless of target capabilities.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LowerConfig {
    /// Emulate subgroup broadcasts on 32-bit words via the stack.
    pub emulate_subgroup_ops: bool,
    /// Also emulate them for types wider than one word.
    pub emulate_subgroup_ops_extended_types: bool,
    /// Leave SIMT: explicit N-wide SIMD with a lane mask parameter.
    pub simt_to_explicit_simd: bool,
    /// The target has no 64-bit integers; split them into 32-bit pairs.
    pub int64: bool,
    /// Decay physical pointers into integer indices early.
    pub decay_ptrs: bool,
}

/// Backend-specific workarounds.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HacksConfig {
    /// Some drivers miscompile OpGroupNonUniformBroadcastFirst; use a
    /// shuffle from the elected lane instead.
    pub spv_shuffle_instead_of_broadcast_first: bool,
}

/// Which module dumps to suppress on the logging channel.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub skip_generated: bool,
    pub skip_builtin: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpecializationConfig {
    /// Specialize the module for this entry point; declarations it cannot
    /// reach may be pruned.
    pub entry_point: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Permit extended surface syntax in the front end.
    pub allow_frontend_syntax: bool,
    /// Inject the built-in scheduler sources before binding.
    pub dynamic_scheduling: bool,
    pub per_thread_stack_size: u32,
    pub per_subgroup_stack_size: u32,
    pub subgroup_size: u32,
    pub target_spirv_version: SpirvVersion,
    pub lower: LowerConfig,
    pub hacks: HacksConfig,
    pub logging: LoggingConfig,
    pub specialization: SpecializationConfig,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            allow_frontend_syntax: false,
            dynamic_scheduling: false,
            per_thread_stack_size: 32 * KIB,
            per_subgroup_stack_size: KIB,
            subgroup_size: 32,
            target_spirv_version: SpirvVersion::default(),
            lower: LowerConfig::default(),
            hacks: HacksConfig::default(),
            logging: LoggingConfig::default(),
            specialization: SpecializationConfig::default(),
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Parse a configuration from TOML text. Unknown keys are rejected so
    /// typos fail loudly rather than silently falling back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("invalid compiler configuration: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = CompilerConfig::default();
        assert_eq!(c.per_thread_stack_size, 32 * 1024);
        assert_eq!(c.per_subgroup_stack_size, 1024);
        assert_eq!(c.subgroup_size, 32);
        assert_eq!(c.target_spirv_version, SpirvVersion { major: 1, minor: 4 });
        assert!(!c.lower.emulate_subgroup_ops);
    }

    #[test]
    fn test_from_toml() {
        let c = CompilerConfig::from_toml_str(
            r#"
            subgroup_size = 64
            per_thread_stack_size = 65536

            [lower]
            emulate_subgroup_ops = true
            int64 = true

            [target_spirv_version]
            major = 1
            minor = 5

            [specialization]
            entry_point = "main"
            "#,
        )
        .unwrap();
        assert_eq!(c.subgroup_size, 64);
        assert_eq!(c.per_thread_stack_size, 65536);
        assert!(c.lower.emulate_subgroup_ops);
        assert!(c.lower.int64);
        assert_eq!(c.target_spirv_version.minor, 5);
        assert_eq!(c.specialization.entry_point.as_deref(), Some("main"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(CompilerConfig::from_toml_str("sub_group_size = 64").is_err());
    }
}
