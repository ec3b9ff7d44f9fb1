//! Run configuration
//!
//! Supports YAML, with every field optional.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the engine maintains K/V context across steps.
///
/// All strategies produce the same outputs; they differ in how much work and
/// scratch residency each step costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Rebuild K/V from rows 0..=i in the bulk tier every step.
    Recompute,
    /// Persistent scratch K/V, full transpose of K every step.
    Incremental,
    /// Persistent scratch K/V plus a column-appended transpose cache.
    #[default]
    IncrementalTranspose,
}

impl ContextStrategy {
    pub const ALL: [ContextStrategy; 3] = [
        ContextStrategy::Recompute,
        ContextStrategy::Incremental,
        ContextStrategy::IncrementalTranspose,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ContextStrategy::Recompute => "recompute",
            ContextStrategy::Incremental => "incremental",
            ContextStrategy::IncrementalTranspose => "incremental_transpose",
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategy: ContextStrategy,

    /// Subtract each row's maximum before exponentiation
    #[serde(default)]
    pub stable_softmax: bool,

    /// Trace every instruction at each step's synchronization
    #[serde(default)]
    pub verbose_sync: bool,
}

impl EngineConfig {
    pub fn with_strategy(strategy: ContextStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn stable(mut self, stable_softmax: bool) -> Self {
        self.stable_softmax = stable_softmax;
        self
    }
}

/// Simulator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Scratch tier capacity in f32 elements; unbounded when absent
    #[serde(default)]
    pub scratch_capacity: Option<usize>,
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scratch_capacity == Some(0) {
            return Err(Error::ConfigError {
                reason: "scratch_capacity must be > 0".into(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        self.simulator.validate()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        Self::from_yaml_str(&content)
    }
}
