use ash::vk;
use thiserror::Error;

/// Errors produced by the renderer core.
#[derive(Debug, Error)]
pub enum AshError {
    #[error("Vulkan error: {0}")]
    VulkanError(String),

    #[error("Device initialization failed: {0}")]
    DeviceInitFailed(String),

    #[error("Swapchain out of date: {0}")]
    SwapchainOutOfDate(String),

    #[error("{pool} pool exhausted (capacity {capacity})")]
    PoolExhausted { pool: &'static str, capacity: u32 },

    #[error("invalid {pool} handle (index {index}, generation {generation})")]
    InvalidHandle {
        pool: &'static str,
        index: u32,
        generation: u32,
    },

    #[error("staging request of {requested} bytes exceeds staging capacity {capacity}")]
    StagingOverflow { requested: u64, capacity: u64 },

    #[error("Shader error: {0}")]
    ShaderError(String),

    #[error("Asset error: {0}")]
    AssetError(String),

    #[error("Resource still in use: {0}")]
    ResourceInUse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<vk::Result> for AshError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => {
                AshError::SwapchainOutOfDate(format!("{result:?}"))
            }
            other => AshError::VulkanError(format!("{other:?}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, AshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_maps_to_swapchain_variant() {
        let err: AshError = vk::Result::ERROR_OUT_OF_DATE_KHR.into();
        assert!(matches!(err, AshError::SwapchainOutOfDate(_)));
    }

    #[test]
    fn other_results_map_to_vulkan_error() {
        let err: AshError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, AshError::VulkanError(_)));
    }

    #[test]
    fn pool_errors_render_pool_name() {
        let err = AshError::PoolExhausted {
            pool: "buffer",
            capacity: 4,
        };
        assert_eq!(err.to_string(), "buffer pool exhausted (capacity 4)");
    }
}
