// error.rs — Error taxonomy for a convolution pass.
//
// Configuration errors (filter, image size, workgroup shape, device limits)
// are raised by the planner before any device interaction. Device errors
// (allocation, transfer, build, dispatch) carry the underlying device fault
// so the caller can decide whether to retry with a smaller geometry or a
// different strategy. Nothing is retried internally.

use std::fmt;

use thiserror::Error;

/// Underlying device error: an optional numeric code plus the driver message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub code: Option<i32>,
    pub message: String,
}

impl DeviceFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        DeviceFault { code: Some(code), message: message.into() }
    }

    /// A fault reported without a numeric code (wgpu surfaces strings only).
    pub fn message(message: impl Into<String>) -> Self {
        DeviceFault { code: None, message: message.into() }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "device error {code}: {}", self.message),
            None => write!(f, "device error: {}", self.message),
        }
    }
}

impl std::error::Error for DeviceFault {}

/// Every way a convolution pass can fail.
#[derive(Debug, Error)]
pub enum ConvolveError {
    #[error("filter width {width} is invalid: must be odd and at least 1")]
    InvalidFilter { width: usize },

    #[error("gaussian sigma {sigma} is invalid: must be positive")]
    InvalidSigma { sigma: f32 },

    #[error("filter of width {width} needs {} coefficients, got {len}", .width * .width)]
    FilterLength { width: usize, len: usize },

    #[error("image {width}x{height} leaves no valid interior after {padding} padding pixels")]
    ImageTooSmall { width: usize, height: usize, padding: usize },

    #[error("pixel buffer of length {len} does not match a {width}x{height} image")]
    ImageSize { width: usize, height: usize, len: usize },

    #[error("output image is {actual:?} but the input is {expected:?}")]
    DimensionsMismatch { expected: (usize, usize), actual: (usize, usize) },

    #[error("image dimension {0} does not fit the device's 32-bit index space")]
    DimensionOverflow(usize),

    #[error("workgroup {width}x{height} is invalid: {reason}")]
    InvalidWorkgroup { width: u32, height: u32, reason: &'static str },

    #[error("workgroup of {total} invocations exceeds the device limit of {max}")]
    WorkgroupTooLarge { total: u32, max: u32 },

    #[error("tile needs {needed} bytes of workgroup memory, device allows {max}")]
    SharedMemoryExceeded { needed: u64, max: u64 },

    #[error("failed to allocate {bytes} bytes for `{label}`")]
    AllocationFailure {
        label: String,
        bytes: u64,
        #[source]
        source: DeviceFault,
    },

    #[error("transfer failed on `{label}`")]
    TransferFailure {
        label: String,
        #[source]
        source: DeviceFault,
    },

    #[error("kernel program `{program}` failed to build:\n{log}")]
    BuildFailure { program: String, log: String },

    #[error("kernel dispatch failed")]
    DispatchFailure {
        #[source]
        source: DeviceFault,
    },
}

impl ConvolveError {
    /// Configuration errors never succeed on retry with the same inputs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ConvolveError::InvalidFilter { .. }
                | ConvolveError::InvalidSigma { .. }
                | ConvolveError::FilterLength { .. }
                | ConvolveError::ImageTooSmall { .. }
                | ConvolveError::ImageSize { .. }
                | ConvolveError::DimensionsMismatch { .. }
                | ConvolveError::DimensionOverflow(_)
                | ConvolveError::InvalidWorkgroup { .. }
                | ConvolveError::WorkgroupTooLarge { .. }
                | ConvolveError::SharedMemoryExceeded { .. }
        )
    }

    /// The device fault behind a device-side error, if any.
    pub fn device_fault(&self) -> Option<&DeviceFault> {
        match self {
            ConvolveError::AllocationFailure { source, .. }
            | ConvolveError::TransferFailure { source, .. }
            | ConvolveError::DispatchFailure { source } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvolveError>;
