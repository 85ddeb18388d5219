//! Geometry pass: one indirect-count draw fills the G-buffer.

use ash::vk;
use glam::Mat4;
use log::debug;

use super::{
    begin_rendering, bind_scene_geometry, color_attachment, create_target, depth_attachment,
    end_rendering, release_pipeline, release_sampler, release_texture, shader, transition,
    FrameInputs, Pass, PushConstants, DEPTH_FORMAT,
};
use crate::renderer::device::Device;
use crate::renderer::resource_pool::Handle;
use crate::renderer::resources::{
    Buffer, Pipeline, PipelineCI, Sampler, SamplerCI, Texture, VertexStream,
};
use crate::renderer::scene_data::{IndirectDrawData, SceneBuffers};
use crate::Result;

pub const ALBEDO_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;
/// Octahedral-encoded world normal.
pub const NORMAL_FORMAT: vk::Format = vk::Format::R16G16_SFLOAT;
/// Occlusion, roughness, metallic.
pub const ORM_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const EMISSIVE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

const COLOR_FORMATS: [vk::Format; 4] = [ALBEDO_FORMAT, NORMAL_FORMAT, ORM_FORMAT, EMISSIVE_FORMAT];

/// The G-buffer attachments, sampled by the lighting pass through their bindless slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GBufferTargets {
    pub albedo: Handle<Texture>,
    pub normal: Handle<Texture>,
    pub orm: Handle<Texture>,
    pub emissive: Handle<Texture>,
    pub depth: Handle<Texture>,
}

impl GBufferTargets {
    fn create(device: &mut Device, extent: vk::Extent2D, sampler: Handle<Sampler>) -> Result<Self> {
        let mut targets = Self::default();
        let created = (|| -> Result<()> {
            targets.albedo = create_target(device, extent, ALBEDO_FORMAT, sampler, "gbuffer_albedo")?;
            targets.normal = create_target(device, extent, NORMAL_FORMAT, sampler, "gbuffer_normal")?;
            targets.orm = create_target(device, extent, ORM_FORMAT, sampler, "gbuffer_orm")?;
            targets.emissive =
                create_target(device, extent, EMISSIVE_FORMAT, sampler, "gbuffer_emissive")?;
            targets.depth = create_target(device, extent, DEPTH_FORMAT, sampler, "gbuffer_depth")?;
            Ok(())
        })();
        match created {
            Ok(()) => Ok(targets),
            Err(e) => {
                targets.release(device);
                Err(e)
            }
        }
    }

    fn colors(&self) -> [Handle<Texture>; 4] {
        [self.albedo, self.normal, self.orm, self.emissive]
    }

    fn release(&mut self, device: &mut Device) {
        for target in [
            &mut self.albedo,
            &mut self.normal,
            &mut self.orm,
            &mut self.emissive,
            &mut self.depth,
        ] {
            release_texture(device, target);
        }
    }
}

pub struct GBufferPass {
    pipeline: Handle<Pipeline>,
    sampler: Handle<Sampler>,
    targets: GBufferTargets,
    extent: vk::Extent2D,
    scene: SceneBuffers,
    draws: Handle<Buffer>,
    count: Handle<Buffer>,
    view_proj: Mat4,
}

impl GBufferPass {
    pub fn new(device: &mut Device) -> Result<Self> {
        let sampler = device.create_sampler(&SamplerCI {
            filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_lod: 0.0,
            max_anisotropy: None,
            compare_op: None,
            debug_name: "gbuffer_sampler".into(),
        })?;
        let extent = device.extent();
        let targets = GBufferTargets::create(device, extent, sampler)?;
        Ok(Self {
            pipeline: create_pipeline(device)?,
            sampler,
            targets,
            extent,
            scene: SceneBuffers::default(),
            draws: Handle::INVALID,
            count: Handle::INVALID,
            view_proj: Mat4::IDENTITY,
        })
    }

    pub fn targets(&self) -> GBufferTargets {
        self.targets
    }
}

fn create_pipeline(device: &mut Device) -> Result<Handle<Pipeline>> {
    let stream = |binding: u32, format: vk::Format, stride: u32| VertexStream {
        binding,
        location: binding,
        format,
        stride,
    };
    let mut ci = PipelineCI::new(vec![
        shader!("gbuffer.vert", vk::ShaderStageFlags::VERTEX)?,
        shader!("gbuffer.frag", vk::ShaderStageFlags::FRAGMENT)?,
    ])
    .name("gbuffer");
    ci.vertex_streams = vec![
        stream(0, vk::Format::R32G32B32_SFLOAT, 12),
        stream(1, vk::Format::R32G32_SFLOAT, 8),
        stream(2, vk::Format::R32G32B32_SFLOAT, 12),
        stream(3, vk::Format::R32G32B32A32_SFLOAT, 16),
    ];
    ci.color_formats = COLOR_FORMATS.to_vec();
    ci.depth_format = Some(DEPTH_FORMAT);
    device.create_pipeline(&ci)
}

impl Pass for GBufferPass {
    fn name(&self) -> &'static str {
        "gbuffer"
    }

    fn set_inputs(&mut self, _device: &mut Device, inputs: &FrameInputs) -> Result<()> {
        self.scene = inputs.scene;
        self.draws = inputs.visible_draws;
        self.count = inputs.visible_count;
        self.view_proj = inputs.view_proj();
        Ok(())
    }

    fn render(&mut self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<()> {
        let mut to_attachment: Vec<_> = self
            .targets
            .colors()
            .iter()
            .map(|target| {
                (
                    *target,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                )
            })
            .collect();
        to_attachment.push((
            self.targets.depth,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ));
        transition(device, cmd, &to_attachment)?;

        let colors = self
            .targets
            .colors()
            .iter()
            .map(|target| {
                Ok(color_attachment(
                    device.texture(*target)?.view,
                    vk::AttachmentLoadOp::CLEAR,
                    [0.0; 4],
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let depth = depth_attachment(
            device.texture(self.targets.depth)?.view,
            vk::AttachmentLoadOp::CLEAR,
        );
        begin_rendering(device, cmd, self.extent, &colors, Some(&depth));
        if self.scene.draw_count > 0 {
            device.bind_pipeline(cmd, self.pipeline)?;
            let push = PushConstants::new(
                self.view_proj,
                [
                    device.buffer(self.draws)?.shader_index(),
                    device.buffer(self.scene.transforms)?.shader_index(),
                    device.buffer(self.scene.materials)?.shader_index(),
                    device.buffer(self.scene.texture_indices)?.shader_index(),
                ],
            );
            device.push_constants(cmd, self.pipeline, &push)?;
            bind_scene_geometry(device, cmd, &self.scene, 4)?;
            let draws = device.buffer(self.draws)?.raw;
            let count = device.buffer(self.count)?.raw;
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

        let mut to_sampled: Vec<_> = self
            .targets
            .colors()
            .iter()
            .map(|target| {
                (
                    *target,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            })
            .collect();
        to_sampled.push((
            self.targets.depth,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        transition(device, cmd, &to_sampled)
    }

    fn resize(&mut self, device: &mut Device, extent: vk::Extent2D) -> Result<()> {
        if extent == self.extent {
            return Ok(());
        }
        let targets = GBufferTargets::create(device, extent, self.sampler)?;
        self.targets.release(device);
        self.targets = targets;
        self.extent = extent;
        debug!("G-buffer resized to {}x{}", extent.width, extent.height);
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
        self.targets.release(device);
        release_sampler(device, &mut self.sampler);
    }
}
