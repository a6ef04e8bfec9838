//! Scheduler configuration.
//!
//! Configuration is fixed at context construction. It can be built in code
//! with [`SchedulerConfigBuilder`], or loaded from a TOML file and
//! `KERNELFLOW_*` environment variables with [`load_config`].
//!
//! ```toml
//! execution_policy = "default"
//! dependency_policy = "with-const"
//! device_selection_policy = "least-loaded"
//! max_streams_per_device = 16
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{KernelFlowError, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "KERNELFLOW";

/// How elements are executed once scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPolicy {
    /// Asynchronous DAG scheduling on multiple streams.
    #[default]
    Default,
    /// Every element completes before the next one is placed.
    Sync,
}

/// Which operand pairs create dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyPolicy {
    /// Any shared operand orders two elements.
    #[default]
    Default,
    /// Operands read-only in both elements do not order them.
    #[serde(alias = "with_const", alias = "const-aware")]
    WithConst,
}

/// Whether a child may continue on one of its parents' streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParentStreamPolicy {
    /// Reuse the stream of the first parent on the chosen device.
    #[default]
    SameAsParent,
    /// Reuse a parent's stream only if no other child continued on it.
    Disjoint,
}

/// How a stream is obtained when no parent stream is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NewStreamPolicy {
    /// Take a free stream, creating one only if none is free.
    #[default]
    #[serde(alias = "fifo")]
    ReuseFree,
    /// Always create a new stream.
    AlwaysNew,
}

/// Device selection for elements that need a new stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceSelectionPolicy {
    /// Always use the current device.
    #[serde(alias = "single-gpu")]
    SingleDevice,
    /// Cycle over devices.
    RoundRobin,
    /// Device with the fewest busy streams.
    #[default]
    #[serde(alias = "stream-aware")]
    LeastLoaded,
    /// Device already holding the most bytes of the element's arrays.
    #[serde(alias = "min-transfer-size")]
    MinTransfer,
}

macro_rules! policy_strings {
    (@first $first:literal $(, $rest:literal)*) => { $first };
    ($ty:ident { $($variant:ident => [$($name:literal),+]),+ $(,)? }) => {
        impl $ty {
            /// Canonical configuration string.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => policy_strings!(@first $($name),+),)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = KernelFlowError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($($name)|+ => Ok(Self::$variant),)+
                    other => Err(KernelFlowError::InvalidConfig(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

policy_strings!(ExecutionPolicy {
    Default => ["default", "async"],
    Sync => ["sync"],
});

policy_strings!(DependencyPolicy {
    Default => ["default"],
    WithConst => ["with-const", "with_const", "const-aware"],
});

policy_strings!(ParentStreamPolicy {
    SameAsParent => ["same-as-parent", "default"],
    Disjoint => ["disjoint"],
});

policy_strings!(NewStreamPolicy {
    ReuseFree => ["reuse-free", "fifo"],
    AlwaysNew => ["always-new"],
});

policy_strings!(DeviceSelectionPolicy {
    SingleDevice => ["single-device", "single-gpu"],
    RoundRobin => ["round-robin"],
    LeastLoaded => ["least-loaded", "stream-aware"],
    MinTransfer => ["min-transfer", "min-transfer-size"],
});

/// Configuration of an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Execution policy.
    pub execution_policy: ExecutionPolicy,
    /// Dependency policy.
    pub dependency_policy: DependencyPolicy,
    /// Parent stream reuse policy.
    pub parent_stream_policy: ParentStreamPolicy,
    /// New stream retrieval policy.
    pub new_stream_policy: NewStreamPolicy,
    /// Device selection policy.
    pub device_selection_policy: DeviceSelectionPolicy,
    /// Upper bound on streams created per device (`None` = unbounded).
    pub max_streams_per_device: Option<usize>,
    /// Use at most this many of the enumerated devices.
    pub number_of_gpus: Option<usize>,
    /// Prefetch arrays to the executing device when a read finds it stale.
    pub input_prefetch: bool,
    /// Keep a record of every vertex and edge for DOT export.
    pub record_dag: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            execution_policy: ExecutionPolicy::Default,
            dependency_policy: DependencyPolicy::Default,
            parent_stream_policy: ParentStreamPolicy::SameAsParent,
            new_stream_policy: NewStreamPolicy::ReuseFree,
            device_selection_policy: DeviceSelectionPolicy::LeastLoaded,
            max_streams_per_device: None,
            number_of_gpus: None,
            input_prefetch: false,
            record_dag: false,
        }
    }
}

impl SchedulerConfig {
    /// Configuration for the synchronous execution policy.
    pub fn sync() -> Self {
        Self {
            execution_policy: ExecutionPolicy::Sync,
            ..Self::default()
        }
    }

    /// Whether read-only operands are treated as non-conflicting.
    pub fn is_const_aware(&self) -> bool {
        self.dependency_policy == DependencyPolicy::WithConst
    }

    /// Check limits for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_streams_per_device == Some(0) {
            return Err(KernelFlowError::invalid_config(
                "max_streams_per_device must be at least 1",
            ));
        }
        if self.number_of_gpus == Some(0) {
            return Err(KernelFlowError::invalid_config(
                "number_of_gpus must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution policy.
    pub fn execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.config.execution_policy = policy;
        self
    }

    /// Set the dependency policy.
    pub fn dependency_policy(mut self, policy: DependencyPolicy) -> Self {
        self.config.dependency_policy = policy;
        self
    }

    /// Set the parent stream policy.
    pub fn parent_stream_policy(mut self, policy: ParentStreamPolicy) -> Self {
        self.config.parent_stream_policy = policy;
        self
    }

    /// Set the new stream policy.
    pub fn new_stream_policy(mut self, policy: NewStreamPolicy) -> Self {
        self.config.new_stream_policy = policy;
        self
    }

    /// Set the device selection policy.
    pub fn device_selection_policy(mut self, policy: DeviceSelectionPolicy) -> Self {
        self.config.device_selection_policy = policy;
        self
    }

    /// Limit the number of streams per device.
    pub fn max_streams_per_device(mut self, limit: usize) -> Self {
        self.config.max_streams_per_device = Some(limit);
        self
    }

    /// Use at most `count` devices.
    pub fn number_of_gpus(mut self, count: usize) -> Self {
        self.config.number_of_gpus = Some(count);
        self
    }

    /// Enable or disable input prefetching.
    pub fn input_prefetch(mut self, enabled: bool) -> Self {
        self.config.input_prefetch = enabled;
        self
    }

    /// Enable or disable DAG recording.
    pub fn record_dag(mut self, enabled: bool) -> Self {
        self.config.record_dag = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from a file, with `KERNELFLOW_*` environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<SchedulerConfig> {
    let config: SchedulerConfig = Config::builder()
        .add_source(File::from(path.as_ref()))
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from `KERNELFLOW_*` environment variables only.
pub fn load_config_from_env() -> Result<SchedulerConfig> {
    let config: SchedulerConfig = Config::builder()
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}
