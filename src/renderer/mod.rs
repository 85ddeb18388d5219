//! GPU resource and frame-execution core.

pub mod async_loader;
pub mod device;
pub mod passes;
pub(crate) mod pipeline;
pub mod pipeline_cache;
#[allow(clippy::module_inception)]
pub mod renderer;
pub mod resource_pool;
pub mod resources;
pub mod ring;
pub mod scene_data;

pub use async_loader::{AsyncLoader, FileRequest, FileTarget, UploadRequest};
pub use device::{Device, FrameStatus};
pub use passes::{FrameInputs, Pass, PushConstants};
pub use renderer::{FrameCamera, OverlayRecorder, Renderer};
pub use resource_pool::{Handle, ResourcePool};
pub use resources::{
    Buffer, BufferCI, DescriptorSet, DescriptorSetCI, Pipeline, PipelineCI, Sampler, SamplerCI,
    Texture, TextureCI,
};
pub use ring::{Ring, RingBuffer};
pub use scene_data::{IndirectDrawData, ModelInstance, ModelPrefab, Scene, SceneAggregator};
