use thiserror::Error;

use super::driver::types::{DeviceAllocation, PipelineId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    #[error("out of device memory: {0}")]
    OutOfMemory(String),
    #[error("unsupported usage: {0}")]
    UnsupportedUsage(String),
    #[error("not supported by this device: {0}")]
    Unsupported(&'static str),
    #[error("failed to compile pipeline `{pipeline}`: {message}")]
    CompilationError { pipeline: String, message: String },
    #[error("invalid command sequence: {0}")]
    InvalidSequence(String),
    #[error("{0} is not a live allocation of this device")]
    InvalidHandle(DeviceAllocation),
    #[error("{0} is not a live pipeline of this device")]
    InvalidPipeline(PipelineId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[cfg(feature = "dashi-vulkan")]
    #[error("Vulkan Error: {0}")]
    Vulkan(ash::vk::Result),
    #[cfg(feature = "dashi-vulkan")]
    #[error("failed to load the Vulkan library: {0}")]
    Loading(String),
}

impl GpuError {
    /// True for errors after which the device refuses all further work.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, GpuError::DeviceLost(_))
    }
}

/// Convenient crate-wide result type.
pub type Result<T, E = GpuError> = std::result::Result<T, E>;
