//! Directional shadow map.

use ash::vk;
use glam::{Mat4, Vec3};
use log::{debug, info};

use super::{
    begin_rendering, bind_scene_geometry, create_target, depth_attachment, end_rendering,
    release_pipeline, release_sampler, release_texture, shader, transition, vulkan_clip,
    FrameInputs, Pass, PushConstants, DEPTH_FORMAT,
};
use crate::renderer::device::Device;
use crate::renderer::resource_pool::Handle;
use crate::renderer::resources::{
    DepthBias, Pipeline, PipelineCI, RasterState, Sampler, SamplerCI, Texture, VertexStream,
};
use crate::renderer::scene_data::{IndirectDrawData, SceneBuffers};
use crate::Result;

/// Half size of the light's orthographic box, in world units.
const LIGHT_HALF_EXTENT: f32 = 30.0;
/// Depth covered beyond the scene origin as seen from the light.
const LIGHT_DEPTH_PADDING: f32 = 100.0;

/// Light view-projection for a directional light placed at `light_position`
/// and aimed at the origin, in Vulkan clip space.
pub fn light_view_proj(light_position: Vec3) -> Mat4 {
    let direction = (-light_position).normalize_or_zero();
    let up = if direction.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
    let view = Mat4::look_at_rh(light_position, Vec3::ZERO, up);
    let projection = Mat4::orthographic_rh(
        -LIGHT_HALF_EXTENT,
        LIGHT_HALF_EXTENT,
        -LIGHT_HALF_EXTENT,
        LIGHT_HALF_EXTENT,
        0.1,
        light_position.length() + LIGHT_DEPTH_PADDING,
    );
    vulkan_clip(projection) * view
}

fn scaled_extent(extent: vk::Extent2D, scale: f32) -> vk::Extent2D {
    vk::Extent2D {
        width: ((extent.width as f32 * scale) as u32).max(1),
        height: ((extent.height as f32 * scale) as u32).max(1),
    }
}

pub struct ShadowPass {
    pipeline: Handle<Pipeline>,
    shadow_map: Handle<Texture>,
    sampler: Handle<Sampler>,
    extent: vk::Extent2D,
    scale: f32,
    enabled: bool,
    scene: SceneBuffers,
    light_view_proj: Mat4,
}

impl ShadowPass {
    pub fn new(device: &mut Device) -> Result<Self> {
        let scale = device.config().shadow_resolution_scale;
        let extent = scaled_extent(device.extent(), scale);
        // Outside the map reads as depth 1, i.e. lit.
        let sampler = device.create_sampler(&SamplerCI {
            filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            max_lod: 0.0,
            max_anisotropy: None,
            compare_op: None,
            debug_name: "shadow_sampler".into(),
        })?;
        let mut pass = Self {
            pipeline: Handle::INVALID,
            shadow_map: Handle::INVALID,
            sampler,
            extent,
            scale,
            enabled: true,
            scene: SceneBuffers::default(),
            light_view_proj: Mat4::IDENTITY,
        };
        pass.shadow_map = create_target(device, extent, DEPTH_FORMAT, sampler, "shadow_map")?;
        pass.pipeline = create_pipeline(device)?;
        info!("Shadow pass ready at {}x{}", extent.width, extent.height);
        Ok(pass)
    }

    pub fn shadow_map(&self) -> Handle<Texture> {
        self.shadow_map
    }

    pub fn light_view_proj(&self) -> Mat4 {
        self.light_view_proj
    }
}

fn create_pipeline(device: &mut Device) -> Result<Handle<Pipeline>> {
    let mut ci = PipelineCI::new(vec![
        shader!("shadow.vert", vk::ShaderStageFlags::VERTEX)?,
        shader!("shadow.frag", vk::ShaderStageFlags::FRAGMENT)?,
    ])
    .name("shadow");
    ci.vertex_streams = vec![VertexStream {
        binding: 0,
        location: 0,
        format: vk::Format::R32G32B32_SFLOAT,
        stride: 12,
    }];
    ci.raster = RasterState {
        cull_mode: vk::CullModeFlags::FRONT,
        depth_bias: Some(DepthBias {
            constant: 1.25,
            slope: 1.75,
            clamp: 0.0,
        }),
        depth_clamp: true,
        ..Default::default()
    };
    ci.depth_format = Some(DEPTH_FORMAT);
    device.create_pipeline(&ci)
}

impl Pass for ShadowPass {
    fn name(&self) -> &'static str {
        "shadow"
    }

    fn set_inputs(&mut self, _device: &mut Device, inputs: &FrameInputs) -> Result<()> {
        self.enabled = inputs.shadows_enabled;
        self.scene = inputs.scene;
        self.light_view_proj = light_view_proj(inputs.light_position);
        Ok(())
    }

    fn render(&mut self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<()> {
        transition(
            device,
            cmd,
            &[(
                self.shadow_map,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            )],
        )?;

        // Disabled or empty still clears, so the lighting pass reads "fully lit".
        let depth = depth_attachment(
            device.texture(self.shadow_map)?.view,
            vk::AttachmentLoadOp::CLEAR,
        );
        begin_rendering(device, cmd, self.extent, &[], Some(&depth));
        if self.enabled && self.scene.draw_count > 0 {
            device.bind_pipeline(cmd, self.pipeline)?;
            let push = PushConstants::new(
                self.light_view_proj,
                [
                    device.buffer(self.scene.transforms)?.shader_index(),
                    device.buffer(self.scene.draws)?.shader_index(),
                    0,
                    0,
                ],
            );
            device.push_constants(cmd, self.pipeline, &push)?;
            bind_scene_geometry(device, cmd, &self.scene, 1)?;
            let draws = device.buffer(self.scene.draws)?.raw;
            let count = device.buffer(self.scene.count)?.raw;
            unsafe {
                device.raw().cmd_draw_indexed_indirect_count(
                    cmd,
                    draws,
                    0,
                    count,
                    0,
                    self.scene.draw_count,
                    std::mem::size_of::<IndirectDrawData>() as u32,
                )
            };
        }
        end_rendering(device, cmd);

        transition(
            device,
            cmd,
            &[(
                self.shadow_map,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        )
    }

    fn resize(&mut self, device: &mut Device, extent: vk::Extent2D) -> Result<()> {
        let extent = scaled_extent(extent, self.scale);
        if extent == self.extent {
            return Ok(());
        }
        release_texture(device, &mut self.shadow_map);
        self.shadow_map = create_target(device, extent, DEPTH_FORMAT, self.sampler, "shadow_map")?;
        self.extent = extent;
        debug!("Shadow map resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn reload(&mut self, device: &mut Device) -> Result<()> {
        let pipeline = create_pipeline(device)?;
        release_pipeline(device, &mut self.pipeline);
        self.pipeline = pipeline;
        Ok(())
    }

    fn shutdown(&mut self, device: &mut Device) {
        release_pipeline(device, &mut self.pipeline);
        release_texture(device, &mut self.shadow_map);
        release_sampler(device, &mut self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn origin_lands_inside_the_light_volume() {
        let clip = light_view_proj(Vec3::new(-2.0, 20.0, 2.0)) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn overhead_light_still_has_a_valid_basis() {
        let matrix = light_view_proj(Vec3::new(0.0, 10.0, 0.0));
        assert!(matrix.is_finite());
    }

    #[test]
    fn extent_scales_and_never_collapses() {
        let base = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert_eq!(
            scaled_extent(base, 2.0),
            vk::Extent2D {
                width: 1600,
                height: 1200
            }
        );
        assert_eq!(scaled_extent(base, 0.0001).width, 1);
    }
}
