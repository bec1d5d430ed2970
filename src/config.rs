//! Runtime configuration types.
//!
//! Values come from an optional `lmnt.toml`; command line flags override
//! them. Every field has a default, so an empty file is a valid config.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default file name looked up by the CLI.
pub const CONFIG_FILE: &str = "lmnt.toml";

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// Interpreter only
    Off,
    /// Always compile; fail if the target has no backend
    On,
    /// Compile when the host target has a backend, otherwise interpret
    #[default]
    Auto,
}

/// Code generation target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Whatever the host is
    #[default]
    Current,
    #[serde(rename = "x86-64")]
    X86_64,
    Armv7a,
    Armv7m,
    Arm64,
}

impl Target {
    pub const ALL: [Target; 5] = [Target::Current, Target::X86_64, Target::Armv7a, Target::Armv7m, Target::Arm64];

    /// The concrete target `Current` stands for, if the host has one.
    pub fn host() -> Option<Target> {
        if cfg!(target_arch = "x86_64") {
            Some(Target::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Target::Arm64)
        } else if cfg!(all(target_arch = "arm", target_os = "none")) {
            Some(Target::Armv7m)
        } else if cfg!(target_arch = "arm") {
            Some(Target::Armv7a)
        } else {
            None
        }
    }

    /// Resolve `Current` to the host target.
    pub fn resolve(self) -> Option<Target> {
        match self {
            Target::Current => Target::host(),
            t => Some(t),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Target::Current => "current",
            Target::X86_64 => "x86-64",
            Target::Armv7a => "armv7a",
            Target::Armv7m => "armv7m",
            Target::Arm64 => "arm64",
        }
    }

    pub fn from_name(name: &str) -> Option<Target> {
        Target::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Memory budget in bytes for the archive copy and the stack
    pub memory_size: usize,
    pub jit: JitMode,
    pub jit_target: Target,
    /// Let the x86-64 backend cache values in callee-saved XMM registers
    /// under the Windows calling convention.
    pub allow_nonvolatile_registers: bool,
    /// Check the register cache invariants after every JIT operation
    pub validate_register_cache: bool,
    /// Report register allocation statistics after compiling
    pub collect_stats: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_size: 64 * 1024,
            jit: JitMode::Auto,
            jit_target: Target::Current,
            allow_nonvolatile_registers: false,
            validate_register_cache: false,
            collect_stats: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse {}: {}", CONFIG_FILE, e))
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if given, else `lmnt.toml` in the working directory if
    /// present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self, String> {
        match path {
            Some(p) => Self::load(p),
            None if Path::new(CONFIG_FILE).exists() => Self::load(Path::new(CONFIG_FILE)),
            None => Ok(Self::default()),
        }
    }

    /// Whether compiled code should be used for `target`.
    pub fn use_jit(&self, has_backend: bool) -> bool {
        match self.jit {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => has_backend,
        }
    }
}
