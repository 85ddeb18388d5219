//! Fullscreen deferred lighting: one directional light with PCF shadows plus
//! image-based ambient from the environment cubemap.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};
use log::{debug, info};

use super::{
    begin_rendering, color_attachment, end_rendering, release_pipeline, release_sampler,
    release_texture, shader, transition, FrameInputs, Pass, GBufferTargets,
};
use crate::renderer::async_loader::{AsyncLoader, UploadRequest};
use crate::renderer::device::Device;
use crate::renderer::resource_pool::Handle;
use crate::renderer::resources::{
    BufferCI, DepthState, DescriptorSet, DescriptorSetCI, Pipeline, PipelineCI, RasterState,
    Sampler, SamplerCI, Texture, TextureCI,
};
use crate::renderer::ring::RingBuffer;
use crate::vulkan::{DescriptorBindingTable, ReflectedBinding};
use crate::Result;

pub const DRAW_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const BRDF_LUT_SIZE: u32 = 64;

const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.03, 1.0];
const LIGHT_COLOR: Vec3 = Vec3::new(1.0, 0.96, 0.9);
const LIGHT_INTENSITY: f32 = 3.0;
const UNIFORM_SET: u32 = 1;

/// Split-sum environment BRDF `(scale, bias)` for a given `n_dot_v` and roughness,
/// using Karis' analytic fit instead of an integrated table.
pub fn env_brdf(n_dot_v: f32, roughness: f32) -> Vec2 {
    let c0 = Vec4::new(-1.0, -0.0275, -0.572, 0.022);
    let c1 = Vec4::new(1.0, 0.0425, 1.04, -0.04);
    let r = roughness * c0 + c1;
    let a004 = (r.x * r.x).min((-9.28 * n_dot_v).exp2()) * r.x + r.y;
    Vec2::new(-1.04 * a004 + r.z, 1.04 * a004 + r.w)
}

/// RGBA8 lookup table: `n_dot_v` along x, roughness along y, scale in red,
/// bias in green.
pub fn brdf_lut_pixels(size: u32) -> Vec<u8> {
    let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        let roughness = (y as f32 + 0.5) / size as f32;
        for x in 0..size {
            let n_dot_v = (x as f32 + 0.5) / size as f32;
            let ab = env_brdf(n_dot_v, roughness);
            pixels.extend_from_slice(&[to_byte(ab.x), to_byte(ab.y), 0, 255]);
        }
    }
    pixels
}

/// std140 block at set 1, binding 0 of `lighting.frag`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct LightingUniforms {
    inv_view_proj: Mat4,
    light_view_proj: Mat4,
    camera_position: Vec4,
    /// Direction the light travels; `w` is intensity.
    light_direction: Vec4,
    light_color: Vec4,
    /// Albedo, normal, ORM, emissive.
    gbuffer: [u32; 4],
    /// Depth, shadow map, environment cube, BRDF LUT.
    maps: [u32; 4],
    /// Shadows enabled, environment mip count, IBL enabled.
    flags: [u32; 4],
}

fn uniform_table() -> DescriptorBindingTable {
    DescriptorBindingTable::new().with_binding(
        UNIFORM_SET,
        ReflectedBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            stages: vk::ShaderStageFlags::FRAGMENT,
            count: 1,
        },
    )
}

pub struct LightingPass {
    pipeline: Handle<Pipeline>,
    uniforms: RingBuffer,
    sets: Vec<Handle<DescriptorSet>>,
    draw_texture: Handle<Texture>,
    brdf_lut: Handle<Texture>,
    lut_sampler: Handle<Sampler>,
    extent: vk::Extent2D,
}

impl LightingPass {
    pub fn new(device: &mut Device, loader: &mut AsyncLoader) -> Result<Self> {
        let uniforms = RingBuffer::per_frame(
            device,
            &BufferCI::new(
                std::mem::size_of::<LightingUniforms>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )
            .mapped()
            .name("lighting_uniforms"),
        )?;
        let mut pass = Self {
            pipeline: Handle::INVALID,
            uniforms,
            sets: Vec::new(),
            draw_texture: Handle::INVALID,
            brdf_lut: Handle::INVALID,
            lut_sampler: Handle::INVALID,
            extent: device.extent(),
        };
        if let Err(e) = pass.create_resources(device, loader) {
            pass.shutdown(device);
            return Err(e);
        }
        info!("Lighting pass ready");
        Ok(pass)
    }

    fn create_resources(&mut self, device: &mut Device, loader: &mut AsyncLoader) -> Result<()> {
        for slot in 0..self.uniforms.ring_size() {
            let set = device.create_descriptor_set(&DescriptorSetCI {
                bindings: uniform_table(),
                set: UNIFORM_SET,
                debug_name: format!("lighting_set[{slot}]"),
            })?;
            self.sets.push(set);
            if let Some(buffer) = self.uniforms.buffer_at(slot) {
                device.write_descriptor_buffer(
                    set,
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    buffer,
                )?;
            }
        }

        self.lut_sampler = device.create_sampler(&SamplerCI {
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_lod: 0.0,
            max_anisotropy: None,
            debug_name: "brdf_lut_sampler".into(),
            ..Default::default()
        })?;
        self.brdf_lut = device.create_texture(
            &TextureCI::new(BRDF_LUT_SIZE, BRDF_LUT_SIZE, vk::Format::R8G8B8A8_UNORM)
                .sampler(self.lut_sampler)
                .name("brdf_lut"),
        )?;
        loader.enqueue(UploadRequest::Texture {
            dst: self.brdf_lut,
            data: brdf_lut_pixels(BRDF_LUT_SIZE),
        });

        self.draw_texture = create_draw_texture(device, self.extent)?;
        self.pipeline = create_pipeline(device)?;
        Ok(())
    }

    /// HDR color target the later passes draw over and the frame is presented from.
    pub fn draw_texture(&self) -> Handle<Texture> {
        self.draw_texture
    }

    pub fn brdf_lut(&self) -> Handle<Texture> {
        self.brdf_lut
    }
}

fn create_draw_texture(device: &mut Device, extent: vk::Extent2D) -> Result<Handle<Texture>> {
    device.create_texture(
        &TextureCI::new(extent.width, extent.height, DRAW_FORMAT)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .name("draw_texture"),
    )
}

fn create_pipeline(device: &mut Device) -> Result<Handle<Pipeline>> {
    let mut ci = PipelineCI::new(vec![
        shader!("fullscreen.vert", vk::ShaderStageFlags::VERTEX)?,
        shader!("lighting.frag", vk::ShaderStageFlags::FRAGMENT)?,
    ])
    .name("lighting");
    ci.reflection = uniform_table();
    ci.raster = RasterState {
        cull_mode: vk::CullModeFlags::NONE,
        ..Default::default()
    };
    ci.depth = DepthState {
        test: false,
        write: false,
        compare_op: vk::CompareOp::ALWAYS,
    };
    ci.color_formats = vec![DRAW_FORMAT];
    device.create_pipeline(&ci)
}

impl LightingPass {
    fn uniforms_for(&self, device: &Device, inputs: &FrameInputs) -> Result<LightingUniforms> {
        let index = |handle: Handle<Texture>| -> Result<u32> {
            Ok(device.texture(handle)?.shader_index())
        };
        let GBufferTargets {
            albedo,
            normal,
            orm,
            emissive,
            depth,
        } = inputs.gbuffer;
        let (environment, environment_mips) = match device.texture(inputs.environment) {
            Ok(cube) if cube.resident => (cube.shader_index(), cube.mip_levels),
            _ => (0, 0),
        };
        let light_direction = (-inputs.light_position).normalize_or(Vec3::NEG_Y);
        Ok(LightingUniforms {
            inv_view_proj: inputs.view_proj().inverse(),
            light_view_proj: inputs.light_view_proj,
            camera_position: inputs.camera_position.extend(1.0),
            light_direction: light_direction.extend(LIGHT_INTENSITY),
            light_color: LIGHT_COLOR.extend(1.0),
            gbuffer: [index(albedo)?, index(normal)?, index(orm)?, index(emissive)?],
            maps: [
                index(depth)?,
                index(inputs.shadow_map)?,
                environment,
                index(self.brdf_lut)?,
            ],
            flags: [
                u32::from(inputs.shadows_enabled),
                environment_mips,
                u32::from(environment_mips > 0),
                0,
            ],
        })
    }
}

impl Pass for LightingPass {
    fn name(&self) -> &'static str {
        "lighting"
    }

    fn set_inputs(&mut self, device: &mut Device, inputs: &FrameInputs) -> Result<()> {
        let uniforms = self.uniforms_for(device, inputs)?;
        self.uniforms.move_to_next_buffer();
        self.uniforms.write(device, bytemuck::bytes_of(&uniforms))
    }

    fn render(&mut self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<()> {
        transition(
            device,
            cmd,
            &[(
                self.draw_texture,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )],
        )?;
        let color = color_attachment(
            device.texture(self.draw_texture)?.view,
            vk::AttachmentLoadOp::CLEAR,
            CLEAR_COLOR,
        );
        begin_rendering(device, cmd, self.extent, &[color], None);
        device.bind_pipeline(cmd, self.pipeline)?;
        let set = self.sets[self.uniforms.current_index()];
        device.bind_descriptor_set(cmd, self.pipeline, UNIFORM_SET, set)?;
        unsafe { device.raw().cmd_draw(cmd, 3, 1, 0, 0) };
        end_rendering(device, cmd);
        // Left as a color attachment for the skybox and overlay.
        Ok(())
    }

    fn resize(&mut self, device: &mut Device, extent: vk::Extent2D) -> Result<()> {
        if extent == self.extent {
            return Ok(());
        }
        let draw_texture = create_draw_texture(device, extent)?;
        release_texture(device, &mut self.draw_texture);
        self.draw_texture = draw_texture;
        self.extent = extent;
        debug!("Draw texture resized to {}x{}", extent.width, extent.height);
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
        for set in self.sets.drain(..) {
            if let Err(e) = device.destroy_descriptor_set(set) {
                log::warn!("Failed to destroy lighting descriptor set: {e}");
            }
        }
        self.uniforms.release(device);
        release_texture(device, &mut self.draw_texture);
        release_texture(device, &mut self.brdf_lut);
        release_sampler(device, &mut self.lut_sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_head_on_surfaces_reflect_almost_everything() {
        let ab = env_brdf(1.0, 0.0);
        assert!(ab.x > 0.95, "scale {}", ab.x);
        assert!(ab.y < 0.05, "bias {}", ab.y);
    }

    #[test]
    fn grazing_angles_shift_energy_into_the_bias_term() {
        let head_on = env_brdf(1.0, 0.2);
        let grazing = env_brdf(0.05, 0.2);
        assert!(grazing.y > head_on.y);
    }

    #[test]
    fn lut_is_tightly_packed_rgba() {
        let pixels = brdf_lut_pixels(BRDF_LUT_SIZE);
        assert_eq!(pixels.len(), (BRDF_LUT_SIZE * BRDF_LUT_SIZE * 4) as usize);
        assert!(pixels.chunks_exact(4).all(|texel| texel[3] == 255));
    }

    #[test]
    fn uniform_block_matches_std140() {
        assert_eq!(std::mem::size_of::<LightingUniforms>(), 224);
    }
}
