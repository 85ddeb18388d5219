//! The frame driver: owns the device, transfer loader, scene and pass graph,
//! and records one frame per [`Renderer::render_frame`] call.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use glam::{Mat4, Vec3};
use log::{error, info, warn};

use super::async_loader::AsyncLoader;
use super::device::{Device, FrameStatus};
use super::passes::{
    transition, vulkan_clip, FrameInputs, FrustumCullPass, GBufferPass, LightingPass, Pass,
    ShadowPass, SkyboxPass,
};
use super::resource_pool::Handle;
use super::resources::Texture;
use super::scene_data::{ModelInstance, ModelPrefab, Scene};
use crate::config::{EngineConfig, RenderToggles};
use crate::scene::SceneData;
use crate::vulkan::{SurfaceProvider, VulkanDevice, VulkanInstance};
use crate::Result;

/// UI collaborator drawing on top of the finished frame.
pub trait OverlayRecorder {
    /// Records draws into `target`, which is in `COLOR_ATTACHMENT_OPTIMAL` and
    /// must be left in that layout.
    fn record(
        &mut self,
        device: &Device,
        cmd: vk::CommandBuffer,
        target: Handle<Texture>,
        extent: vk::Extent2D,
    ) -> Result<()>;
}

/// Camera state for one frame. `projection` is a right-handed, zero-to-one depth
/// projection such as [`Mat4::perspective_rh`]; the Vulkan Y flip is applied here.
#[derive(Clone, Copy, Debug)]
pub struct FrameCamera {
    pub view: Mat4,
    pub projection: Mat4,
    pub position: Vec3,
}

/// The pass graph in execution order.
struct Passes {
    shadow: ShadowPass,
    cull: FrustumCullPass,
    gbuffer: GBufferPass,
    lighting: LightingPass,
    skybox: SkyboxPass,
}

impl Passes {
    fn all_mut(&mut self) -> [&mut dyn Pass; 5] {
        [
            &mut self.shadow,
            &mut self.cull,
            &mut self.gbuffer,
            &mut self.lighting,
            &mut self.skybox,
        ]
    }
}

pub struct Renderer {
    passes: Passes,
    overlay: Option<Box<dyn OverlayRecorder>>,
    scene: Scene,
    extent: vk::Extent2D,
    shut_down: bool,
    // Dropped before the device it records into.
    loader: AsyncLoader,
    device: Device,
}

impl Renderer {
    pub fn new<S: SurfaceProvider>(surface_provider: &S, config: EngineConfig) -> Result<Self> {
        info!("Initializing deferred renderer...");
        config.validate()?;
        let instance = Arc::new(VulkanInstance::new(
            surface_provider,
            config.enable_validation,
        )?);
        let vulkan = VulkanDevice::new(instance)?;
        let mut device = Device::new(vulkan, config, surface_provider.extent())?;
        let mut loader = AsyncLoader::new(&mut device)?;

        let passes = Passes {
            shadow: ShadowPass::new(&mut device)?,
            cull: FrustumCullPass::new(&mut device)?,
            gbuffer: GBufferPass::new(&mut device)?,
            lighting: LightingPass::new(&mut device, &mut loader)?,
            skybox: SkyboxPass::new(&mut device)?,
        };
        let scene = Scene::new(&mut device)?;

        let extent = device.extent();
        info!(
            "Deferred renderer ready at {}x{}",
            extent.width, extent.height
        );
        Ok(Self {
            passes,
            overlay: None,
            scene,
            extent,
            shut_down: false,
            loader,
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn loader_mut(&mut self) -> &mut AsyncLoader {
        &mut self.loader
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn set_overlay(&mut self, overlay: Option<Box<dyn OverlayRecorder>>) {
        self.overlay = overlay;
    }

    /// Imports a glTF file (once per path) into the scene.
    #[cfg(feature = "gltf_loading")]
    pub fn load_prefab(&mut self, path: impl AsRef<Path>) -> Result<Handle<ModelPrefab>> {
        self.scene
            .load_prefab(&mut self.device, &mut self.loader, path)
    }

    pub fn add_prefab_data(&mut self, key: &str, data: &SceneData) -> Result<Handle<ModelPrefab>> {
        self.scene
            .add_prefab_data(&mut self.device, &mut self.loader, key, data)
    }

    pub fn add_instance(
        &mut self,
        prefab: Handle<ModelPrefab>,
        transform: Mat4,
    ) -> Result<Handle<ModelInstance>> {
        self.scene.add_instance(prefab, transform)
    }

    /// Starts loading an equirectangular environment image for the sky and IBL.
    pub fn set_environment(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.passes
            .skybox
            .set_environment(&mut self.device, &self.loader, path)
    }

    /// Requests new swapchain dimensions; targets follow on a later frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.device.resize(width, height);
    }

    fn resize_passes(&mut self, extent: vk::Extent2D) -> Result<()> {
        if extent == self.extent || extent.width == 0 || extent.height == 0 {
            return Ok(());
        }
        for pass in self.passes.all_mut() {
            pass.resize(&mut self.device, extent)?;
        }
        self.extent = extent;
        info!("Render targets resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn reload_pipelines(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        for pass in self.passes.all_mut() {
            // A pass that fails keeps its previous pipeline.
            if let Err(e) = pass.reload(&mut self.device) {
                error!("Reloading {} pipelines failed: {e}", pass.name());
            }
        }
        info!("Pipelines reloaded");
        Ok(())
    }

    /// Records and submits one frame: shadow, frustum cull, G-buffer, lighting,
    /// skybox, then the overlay, and presents the draw texture.
    pub fn render_frame(&mut self, camera: &FrameCamera, toggles: &mut RenderToggles) -> Result<()> {
        if toggles.take_reload_request() {
            self.reload_pipelines()?;
        }

        match self.device.new_frame()? {
            FrameStatus::Resized => {
                let extent = self.device.extent();
                return self.resize_passes(extent);
            }
            FrameStatus::Ready => {}
        }

        let extent = self.device.extent();
        let recorded = self
            .resize_passes(extent)
            .and_then(|()| self.record_frame(camera, toggles));
        // Submit even after a recording error so the slot's fence signals again.
        let presented = self.device.present();
        if let Err(e) = &recorded {
            error!("Frame recording failed: {e}");
        }
        recorded?;
        presented
    }

    fn record_frame(&mut self, camera: &FrameCamera, toggles: &RenderToggles) -> Result<()> {
        self.loader.update(&mut self.device)?;
        let cmd = self.device.get_command_buffer()?;
        self.loader.signal_buffers(&mut self.device, cmd)?;
        self.loader.signal_textures(&mut self.device, cmd)?;
        self.scene.new_frame(&mut self.device)?;

        let mut inputs = FrameInputs {
            scene: self.scene.frame_buffers(),
            view: camera.view,
            projection: vulkan_clip(camera.projection),
            camera_position: camera.position,
            light_position: toggles.light_position,
            extent: self.extent,
            shadows_enabled: toggles.shadows_enabled,
            cull_enabled: toggles.frustum_cull_enabled,
            freeze_cull: toggles.freeze_cull,
            skybox_enabled: toggles.skybox_enabled,
            gbuffer: self.passes.gbuffer.targets(),
            environment: self.passes.skybox.environment(),
            brdf_lut: self.passes.lighting.brdf_lut(),
            draw_texture: self.passes.lighting.draw_texture(),
            ..Default::default()
        };
        let device = &mut self.device;
        let passes = &mut self.passes;

        passes.shadow.set_inputs(device, &inputs)?;
        passes.shadow.render(device, cmd)?;
        inputs.light_view_proj = passes.shadow.light_view_proj();
        inputs.shadow_map = passes.shadow.shadow_map();

        passes.cull.set_inputs(device, &inputs)?;
        passes.cull.render(device, cmd)?;
        (inputs.visible_draws, inputs.visible_count) = passes.cull.visible();

        passes.gbuffer.set_inputs(device, &inputs)?;
        passes.gbuffer.render(device, cmd)?;

        passes.lighting.set_inputs(device, &inputs)?;
        passes.lighting.render(device, cmd)?;

        passes.skybox.set_inputs(device, &inputs)?;
        passes.skybox.render(device, cmd)?;

        if let Some(overlay) = self.overlay.as_mut() {
            overlay.record(device, cmd, inputs.draw_texture, self.extent)?;
        }

        transition(
            device,
            cmd,
            &[(
                inputs.draw_texture,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )],
        )?;
        device.blit_to_swapchain(cmd, inputs.draw_texture)
    }

    /// Waits for the GPU, then releases every pass, the scene and the loader.
    /// Called by `Drop` when not done explicitly.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Shutting down deferred renderer...");
        if let Err(e) = self.device.wait_idle() {
            warn!("Device wait failed during shutdown: {e}");
        }
        for pass in self.passes.all_mut() {
            pass.shutdown(&mut self.device);
        }
        self.scene.release(&mut self.device);
        self.loader.shutdown(&mut self.device);
        info!("Deferred renderer shut down");
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
