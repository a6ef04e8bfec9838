//! Error types for KernelFlow.

use thiserror::Error;

use crate::argument::ArrayId;
use crate::device::DeviceId;
use crate::element::ElementId;

/// Result type alias for KernelFlow operations.
pub type Result<T> = std::result::Result<T, KernelFlowError>;

/// Comprehensive error type for KernelFlow operations.
#[derive(Debug, Clone, Error)]
pub enum KernelFlowError {
    // ===== Configuration Errors =====
    /// Device id outside the enumerated range.
    #[error("invalid device id {id}: {count} device(s) available")]
    InvalidDevice {
        /// Requested device id.
        id: DeviceId,
        /// Number of enumerated devices.
        count: usize,
    },

    /// Invalid configuration value (policy strings, limits).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file or environment could not be loaded.
    #[error("failed to load configuration: {0}")]
    Config(String),

    // ===== Resource Errors =====
    /// No free stream on the device and creation is not allowed.
    #[error("no free stream is available on device {device}")]
    NoFreeStream {
        /// Device that ran out of streams.
        device: DeviceId,
    },

    // ===== Re-entrancy Errors =====
    /// The element was already scheduled.
    #[error("computational element {0} has already been scheduled")]
    AlreadyScheduled(ElementId),

    /// The array was freed twice.
    #[error("array {0} has already been freed")]
    ArrayAlreadyFreed(ArrayId),

    // ===== Launch Errors =====
    /// The element's execution failed.
    #[error("computational element {element} failed: {reason}")]
    LaunchFailed {
        /// Failing element.
        element: ElementId,
        /// Failure description.
        reason: String,
    },

    /// Access past the end of an array.
    #[error("access of {requested} bytes exceeds array {array} of {size} bytes")]
    OutOfBounds {
        /// Accessed array.
        array: ArrayId,
        /// Requested size in bytes.
        requested: usize,
        /// Array size in bytes.
        size: usize,
    },

    // ===== Memory Errors =====
    /// Access to the memory of a freed array.
    #[error("accessed freed memory of array {0}")]
    ArrayFreed(ArrayId),

    /// Unknown array id.
    #[error("unknown array {0}")]
    UnknownArray(ArrayId),

    // ===== State Errors =====
    /// Unknown element id.
    #[error("unknown computational element {0}")]
    UnknownElement(ElementId),

    /// Operation not valid in the current state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    // ===== Backend Errors =====
    /// Backend not available.
    #[error("backend not available: {0}")]
    BackendUnavailable(String),

    /// Error reported by the runtime collaborator.
    #[error("backend error: {0}")]
    BackendError(String),
}

impl KernelFlowError {
    /// Create a launch failure for an element.
    pub fn launch_failed(element: ElementId, reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            element,
            reason: reason.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendError(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Returns true if the caller may retry after a synchronization.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoFreeStream { .. })
    }

    /// Returns true for configuration errors that fail fast at construction.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDevice { .. } | Self::InvalidConfig(_) | Self::Config(_)
        )
    }
}

impl From<config::ConfigError> for KernelFlowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
