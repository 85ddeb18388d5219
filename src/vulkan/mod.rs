//! Thin RAII layer over raw Vulkan objects.

pub mod barrier;
pub mod bindless;
pub mod commands;
pub mod descriptor_layout;
pub mod device;
pub mod instance;
pub mod shader;
pub mod surface;
pub mod swapchain;

pub use bindless::{BindlessHeap, BINDLESS_BUFFER_BINDING, BINDLESS_TEXTURE_BINDING};
pub use commands::{submit_immediate, submit_with_fence, CommandRing, FrameSync};
pub use descriptor_layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use device::{QueueFamilies, QueueKind, VulkanDevice};
pub use instance::VulkanInstance;
pub use shader::{DescriptorBindingTable, ReflectedBinding, ShaderBlob, ShaderModule};
pub use surface::{HeadlessSurfaceProvider, SurfaceProvider, WindowSurfaceProvider};
pub use swapchain::SwapchainWrapper;
