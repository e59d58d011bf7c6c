// config.rs - Command kinds, device capabilities and resolved pass configuration
//
// `CommandBufferOptions` is what users write (JSON or CLI flags).
// Resolving it against a `DeviceCapabilities` applies platform and toolchain
// gating and yields the immutable `CommandBufferConfig` the pass reads.
//
// Preconditions: none.
// Postconditions: a resolved config never enables a kind the device or
//                 toolchain cannot record.
// Failure modes: malformed JSON (serde_json::Error), unknown kind names.
// Side effects: logs dropped kinds at info level.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Minimum CUDA toolkit and driver version (12.3) for recording library
/// calls, collectives and device-side control flow into a command buffer.
pub const CUDA_GRAPH_MIN_VERSION: u32 = 12030;

// ── Command kinds ───────────────────────────────────────────────────────────

/// A family of instructions that may be captured into a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Fusion,
    Cublas,
    CublasLt,
    Cudnn,
    CustomCall,
    Collectives,
    Conditionals,
    While,
}

impl CommandKind {
    pub const ALL: [CommandKind; 8] = [
        CommandKind::Fusion,
        CommandKind::Cublas,
        CommandKind::CublasLt,
        CommandKind::Cudnn,
        CommandKind::CustomCall,
        CommandKind::Collectives,
        CommandKind::Conditionals,
        CommandKind::While,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Fusion => "fusion",
            CommandKind::Cublas => "cublas",
            CommandKind::CublasLt => "cublas_lt",
            CommandKind::Cudnn => "cudnn",
            CommandKind::CustomCall => "custom_call",
            CommandKind::Collectives => "collectives",
            CommandKind::Conditionals => "conditionals",
            CommandKind::While => "while",
        }
    }

    /// Kinds recorded by tracing library calls into a graph.
    pub fn is_traced(self) -> bool {
        matches!(
            self,
            CommandKind::Cublas
                | CommandKind::CublasLt
                | CommandKind::Cudnn
                | CommandKind::CustomCall
                | CommandKind::Collectives
        )
    }

    /// Kinds that need device-side conditional nodes.
    pub fn is_control_flow(self) -> bool {
        matches!(self, CommandKind::Conditionals | CommandKind::While)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        CommandKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = CommandKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown command kind '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

// ── Device capabilities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Cuda,
    Rocm,
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" => Ok(Platform::Cuda),
            "rocm" => Ok(Platform::Rocm),
            other => Err(format!("unknown platform '{other}' (expected cuda or rocm)")),
        }
    }
}

/// What the target device can record. Queried once, when options resolve.
pub trait DeviceCapabilities {
    fn platform(&self) -> Platform;
}

/// Plain capability descriptor for a known platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub platform: Platform,
}

impl DeviceDescription {
    pub fn cuda() -> Self {
        Self {
            platform: Platform::Cuda,
        }
    }

    pub fn rocm() -> Self {
        Self {
            platform: Platform::Rocm,
        }
    }
}

impl DeviceCapabilities for DeviceDescription {
    fn platform(&self) -> Platform {
        self.platform
    }
}

// ── User-facing options ─────────────────────────────────────────────────────

/// Serializable pass options, before capability gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandBufferOptions {
    pub enabled_kinds: Vec<CommandKind>,
    /// Custom-call targets (outside the library families) that may be captured.
    pub custom_call_targets: Vec<String>,
    /// Runs with fewer commands than this are left alone.
    pub min_graph_size: usize,
    pub toolkit_version: u32,
    pub driver_version: u32,
}

impl Default for CommandBufferOptions {
    fn default() -> Self {
        Self {
            enabled_kinds: vec![
                CommandKind::Fusion,
                CommandKind::Collectives,
                CommandKind::While,
            ],
            custom_call_targets: Vec::new(),
            min_graph_size: 2,
            toolkit_version: CUDA_GRAPH_MIN_VERSION,
            driver_version: CUDA_GRAPH_MIN_VERSION,
        }
    }
}

impl CommandBufferOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Compact JSON with kinds and targets sorted and deduplicated, so equal
    /// option sets always serialize identically.
    pub fn canonical_json(&self) -> String {
        let kinds: BTreeSet<CommandKind> = self.enabled_kinds.iter().copied().collect();
        let targets: BTreeSet<&str> = self.custom_call_targets.iter().map(String::as_str).collect();
        serde_json::json!({
            "custom_call_targets": targets,
            "driver_version": self.driver_version,
            "enabled_kinds": kinds,
            "min_graph_size": self.min_graph_size,
            "toolkit_version": self.toolkit_version,
        })
        .to_string()
    }

    /// Apply platform and toolchain gating.
    pub fn resolve(&self, device: &dyn DeviceCapabilities) -> CommandBufferConfig {
        let platform = device.platform();
        let mut enabled: BTreeSet<CommandKind> = self.enabled_kinds.iter().copied().collect();

        match platform {
            Platform::Cuda => {
                let version = self.toolkit_version.min(self.driver_version);
                if version < CUDA_GRAPH_MIN_VERSION {
                    erase_kinds(
                        &mut enabled,
                        |k| !k.is_traced() && !k.is_control_flow(),
                        "requires CUDA toolkit and driver 12.3 or newer",
                    );
                }
            }
            Platform::Rocm => {
                erase_kinds(
                    &mut enabled,
                    |k| !k.is_control_flow(),
                    "conditional command buffer nodes are not supported on ROCm",
                );
            }
        }

        CommandBufferConfig {
            enabled,
            custom_call_targets: self.custom_call_targets.iter().cloned().collect(),
            platform,
            toolkit_version: self.toolkit_version,
            driver_version: self.driver_version,
            min_graph_size: self.min_graph_size,
        }
    }
}

fn erase_kinds(enabled: &mut BTreeSet<CommandKind>, keep: impl Fn(CommandKind) -> bool, reason: &str) {
    let dropped: Vec<CommandKind> = enabled.iter().copied().filter(|k| !keep(*k)).collect();
    for kind in dropped {
        info!(kind = kind.as_str(), "command kind disabled: {reason}");
        enabled.remove(&kind);
    }
}

// ── Resolved configuration ──────────────────────────────────────────────────

/// Immutable configuration read by the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBufferConfig {
    enabled: BTreeSet<CommandKind>,
    custom_call_targets: BTreeSet<String>,
    platform: Platform,
    toolkit_version: u32,
    driver_version: u32,
    min_graph_size: usize,
}

impl CommandBufferConfig {
    pub fn is_enabled(&self, kind: CommandKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn enabled_kinds(&self) -> impl Iterator<Item = CommandKind> + '_ {
        self.enabled.iter().copied()
    }

    pub fn allows_custom_call_target(&self, target: &str) -> bool {
        self.custom_call_targets.contains(target)
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn toolkit_version(&self) -> u32 {
        self.toolkit_version
    }

    pub fn driver_version(&self) -> u32 {
        self.driver_version
    }

    pub fn min_graph_size(&self) -> usize {
        self.min_graph_size
    }

    /// The run-size threshold actually applied: a run needs at least one
    /// command no matter how small `min_graph_size` is.
    pub fn effective_min_graph_size(&self) -> usize {
        self.min_graph_size.max(1)
    }
}

impl Default for CommandBufferConfig {
    fn default() -> Self {
        CommandBufferOptions::default().resolve(&DeviceDescription::cuda())
    }
}
