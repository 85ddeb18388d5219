//! Bindless, GPU-driven deferred renderer on Vulkan 1.3 through `ash`.
//!
//! [`renderer::Renderer`] drives a fixed pass graph (shadow, frustum cull,
//! G-buffer, lighting, skybox, overlay) over a [`renderer::Device`] that owns
//! every GPU object behind generation-checked handles. Uploads go through the
//! dedicated transfer queue via [`renderer::AsyncLoader`].

pub mod config;
pub mod error;
pub mod renderer;
pub mod scene;
pub mod vulkan;

pub use config::{EngineConfig, RenderToggles};
pub use error::{AshError, Result};

pub mod prelude {
    pub use crate::config::{EngineConfig, RenderToggles};
    pub use crate::error::{AshError, Result};
    pub use crate::renderer::{
        FrameCamera, Handle, ModelInstance, ModelPrefab, OverlayRecorder, Renderer,
    };
    pub use crate::scene::{Material, SceneData};
    pub use crate::vulkan::{HeadlessSurfaceProvider, SurfaceProvider, WindowSurfaceProvider};
    pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
}
