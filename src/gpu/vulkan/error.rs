use ash::vk;

use crate::gpu::error::GpuError;

impl From<vk::Result> for GpuError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost(res.to_string()),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GpuError::OutOfMemory(res.to_string())
            }
            _ => GpuError::Vulkan(res),
        }
    }
}

impl From<ash::LoadingError> for GpuError {
    fn from(err: ash::LoadingError) -> Self {
        GpuError::Loading(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portable_codes() {
        assert!(GpuError::from(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::OutOfMemory(_)
        ));
        assert_eq!(
            GpuError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }
}
