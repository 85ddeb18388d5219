//! The deferred pass graph.
//!
//! Passes run in a fixed order every frame: shadow, frustum cull, G-buffer,
//! lighting, skybox. Each pass owns its pipelines and targets, performs its own
//! layout transitions, and reads the previous passes' outputs through
//! [`FrameInputs`].

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::path::PathBuf;

use super::device::Device;
use super::resource_pool::Handle;
use super::resources::{is_depth_format, Buffer, Pipeline, Sampler, Texture, TextureCI};
use super::scene_data::SceneBuffers;
use crate::vulkan::{barrier, ShaderBlob};
use crate::Result;

pub mod frustum_cull;
pub mod gbuffer;
pub mod lighting;
pub mod shadow;
pub mod skybox;

pub use frustum_cull::{extract_frustum_planes, FrustumCullPass};
pub use gbuffer::{GBufferPass, GBufferTargets};
pub use lighting::LightingPass;
pub use shadow::ShadowPass;
pub use skybox::SkyboxPass;

/// Directory of `.spv` files that override the embedded shaders, re-read on
/// every pipeline reload.
pub const SHADER_DIR_ENV: &str = "ASH_DEFERRED_SHADER_DIR";

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Converts a right-handed, zero-to-one depth projection (glam `*_rh`) to Vulkan
/// clip space by flipping Y. Front faces stay counter-clockwise on screen.
pub fn vulkan_clip(projection: Mat4) -> Mat4 {
    Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0)) * projection
}

/// The only per-draw parameter channel: a matrix plus four bindless indices
/// whose meaning each pass defines.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    pub view_proj: Mat4,
    pub slots: [u32; 4],
}

impl PushConstants {
    pub fn new(view_proj: Mat4, slots: [u32; 4]) -> Self {
        Self { view_proj, slots }
    }
}

/// Everything a pass may read this frame. Filled in pass order by the frame
/// driver, so a pass only sees outputs of the passes before it.
#[derive(Clone, Copy, Debug)]
pub struct FrameInputs {
    pub scene: SceneBuffers,
    pub view: Mat4,
    pub projection: Mat4,
    pub camera_position: Vec3,
    pub light_position: Vec3,
    pub extent: vk::Extent2D,

    pub shadows_enabled: bool,
    pub cull_enabled: bool,
    pub freeze_cull: bool,
    pub skybox_enabled: bool,

    /// Written by the shadow pass.
    pub light_view_proj: Mat4,
    pub shadow_map: Handle<Texture>,
    /// Draw list and count consumed by the G-buffer pass; the cull output when
    /// culling ran, otherwise the full scene list.
    pub visible_draws: Handle<Buffer>,
    pub visible_count: Handle<Buffer>,
    pub gbuffer: GBufferTargets,
    /// Environment cubemap once the skybox has built it.
    pub environment: Handle<Texture>,
    pub brdf_lut: Handle<Texture>,
    /// HDR color target the lighting, skybox and overlay write into.
    pub draw_texture: Handle<Texture>,
}

impl Default for FrameInputs {
    fn default() -> Self {
        Self {
            scene: SceneBuffers::default(),
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            camera_position: Vec3::ZERO,
            light_position: Vec3::Y,
            extent: vk::Extent2D::default(),
            shadows_enabled: true,
            cull_enabled: true,
            freeze_cull: false,
            skybox_enabled: true,
            light_view_proj: Mat4::IDENTITY,
            shadow_map: Handle::INVALID,
            visible_draws: Handle::INVALID,
            visible_count: Handle::INVALID,
            gbuffer: GBufferTargets::default(),
            environment: Handle::INVALID,
            brdf_lut: Handle::INVALID,
            draw_texture: Handle::INVALID,
        }
    }
}

impl FrameInputs {
    pub fn view_proj(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// Uniform contract of every pass. Construction (`new`) creates pipelines,
/// targets and ring buffers.
pub trait Pass {
    fn name(&self) -> &'static str;

    /// Captures this frame's handles and writes any per-pass uniform data into
    /// the pass's own ring slot.
    fn set_inputs(&mut self, device: &mut Device, inputs: &FrameInputs) -> Result<()>;

    /// Records the pass into the frame command buffer, with its own layout
    /// transitions before and after.
    fn render(&mut self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<()>;

    /// Recreates size-dependent targets.
    fn resize(&mut self, _device: &mut Device, _extent: vk::Extent2D) -> Result<()> {
        Ok(())
    }

    /// Rebuilds pipelines from the current shader binaries. Called with the device idle.
    fn reload(&mut self, device: &mut Device) -> Result<()>;

    fn shutdown(&mut self, device: &mut Device);
}

/// Loads `<name>.spv` from [`SHADER_DIR_ENV`] when set and present, otherwise
/// the binary embedded at build time.
pub fn load_shader(
    name: &str,
    embedded: &'static [u8],
    stage: vk::ShaderStageFlags,
) -> Result<ShaderBlob> {
    if let Some(dir) = std::env::var_os(SHADER_DIR_ENV) {
        let path = PathBuf::from(dir).join(format!("{name}.spv"));
        if path.is_file() {
            log::debug!("Loading shader override {}", path.display());
            let bytes = std::fs::read(&path)?;
            return ShaderBlob::from_bytes(stage, "main", &bytes);
        }
    }
    ShaderBlob::from_bytes(stage, "main", embedded)
}

/// Loads a shader compiled by the build script from `shaders/<name>`.
macro_rules! shader {
    ($name:literal, $stage:expr) => {
        $crate::renderer::passes::load_shader(
            $name,
            include_bytes!(concat!(env!("OUT_DIR"), "/", $name, ".spv")),
            $stage,
        )
    };
}
pub(crate) use shader;

/// Full-target viewport and scissor; Y is not flipped.
pub(crate) fn set_viewport(device: &Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent,
    };
    unsafe {
        device.raw().cmd_set_viewport(cmd, 0, &[viewport]);
        device.raw().cmd_set_scissor(cmd, 0, &[scissor]);
    }
}

pub(crate) fn color_attachment(
    view: vk::ImageView,
    load_op: vk::AttachmentLoadOp,
    clear: [f32; 4],
) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            color: vk::ClearColorValue { float32: clear },
        })
}

pub(crate) fn depth_attachment(
    view: vk::ImageView,
    load_op: vk::AttachmentLoadOp,
) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(view)
        .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        })
}

pub(crate) fn begin_rendering(
    device: &Device,
    cmd: vk::CommandBuffer,
    extent: vk::Extent2D,
    colors: &[vk::RenderingAttachmentInfo],
    depth: Option<&vk::RenderingAttachmentInfo>,
) {
    let mut info = vk::RenderingInfo::default()
        .render_area(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        })
        .layer_count(1)
        .color_attachments(colors);
    if let Some(depth) = depth {
        info = info.depth_attachment(depth);
    }
    unsafe { device.raw().cmd_begin_rendering(cmd, &info) };
    set_viewport(device, cmd, extent);
}

pub(crate) fn end_rendering(device: &Device, cmd: vk::CommandBuffer) {
    unsafe { device.raw().cmd_end_rendering(cmd) };
}

/// Attachment that is sampled by later passes.
pub(crate) fn create_target(
    device: &mut Device,
    extent: vk::Extent2D,
    format: vk::Format,
    sampler: Handle<Sampler>,
    name: &str,
) -> Result<Handle<Texture>> {
    let attachment = if is_depth_format(format) {
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
    } else {
        vk::ImageUsageFlags::COLOR_ATTACHMENT
    };
    device.create_texture(
        &TextureCI::new(extent.width, extent.height, format)
            .usage(attachment | vk::ImageUsageFlags::SAMPLED)
            .sampler(sampler)
            .name(name),
    )
}

pub(crate) fn transition(
    device: &Device,
    cmd: vk::CommandBuffer,
    transitions: &[(Handle<Texture>, vk::ImageLayout, vk::ImageLayout)],
) -> Result<()> {
    let barriers = transitions
        .iter()
        .map(|(handle, old, new)| {
            let texture = device.texture(*handle)?;
            Ok(barrier::image_transition(
                texture.image,
                texture.full_range(),
                *old,
                *new,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    barrier::record(device.raw(), cmd, &[], &barriers);
    Ok(())
}

/// Releases a handle if it is still live; shutdown paths log instead of failing.
pub(crate) fn release_texture(device: &mut Device, handle: &mut Handle<Texture>) {
    let handle = std::mem::replace(handle, Handle::INVALID);
    if handle.is_valid() {
        if let Err(e) = device.destroy_texture(handle) {
            log::warn!("Failed to destroy texture: {e}");
        }
    }
}

pub(crate) fn release_pipeline(device: &mut Device, handle: &mut Handle<Pipeline>) {
    let handle = std::mem::replace(handle, Handle::INVALID);
    if handle.is_valid() {
        if let Err(e) = device.destroy_pipeline(handle) {
            log::warn!("Failed to destroy pipeline: {e}");
        }
    }
}

pub(crate) fn release_sampler(device: &mut Device, handle: &mut Handle<Sampler>) {
    let handle = std::mem::replace(handle, Handle::INVALID);
    if handle.is_valid() {
        if let Err(e) = device.destroy_sampler(handle) {
            log::warn!("Failed to destroy sampler: {e}");
        }
    }
}

/// Binds the scene's vertex streams (position, uv, normal, tangent) at bindings
/// 0..`streams` and its index buffer.
pub(crate) fn bind_scene_geometry(
    device: &Device,
    cmd: vk::CommandBuffer,
    scene: &SceneBuffers,
    streams: usize,
) -> Result<()> {
    let handles = [scene.positions, scene.uvs, scene.normals, scene.tangents];
    let buffers = handles[..streams]
        .iter()
        .map(|handle| device.buffer(*handle).map(|buffer| buffer.raw))
        .collect::<Result<Vec<_>>>()?;
    let offsets = vec![0; buffers.len()];
    let indices = device.buffer(scene.indices)?.raw;
    unsafe {
        device
            .raw()
            .cmd_bind_vertex_buffers(cmd, 0, &buffers, &offsets);
        device
            .raw()
            .cmd_bind_index_buffer(cmd, indices, 0, vk::IndexType::UINT32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_fit_the_guaranteed_range() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 80);
        assert!(std::mem::size_of::<PushConstants>() <= 128);
    }

    #[test]
    fn vulkan_clip_flips_only_y() {
        let clip = vulkan_clip(Mat4::IDENTITY);
        let p = clip.transform_point3(Vec3::new(0.25, 0.5, 0.75));
        assert_eq!(p, Vec3::new(0.25, -0.5, 0.75));
    }

    #[test]
    fn view_proj_composes_projection_after_view() {
        let inputs = FrameInputs {
            view: Mat4::from_translation(Vec3::X),
            projection: Mat4::from_scale(Vec3::splat(2.0)),
            ..Default::default()
        };
        assert_eq!(
            inputs.view_proj().transform_point3(Vec3::ZERO),
            Vec3::new(2.0, 0.0, 0.0)
        );
    }
}
