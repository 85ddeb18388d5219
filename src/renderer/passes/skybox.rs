//! Environment cubemap and sky background.
//!
//! An equirectangular image is decoded off-thread, uploaded through the
//! transfer loader, then projected onto the six faces of a mip-mapped cube on
//! the main queue. The same cube feeds image-based lighting.

use std::f32::consts::PI;
use std::path::Path;

use ash::vk;
use glam::{Mat3, Mat4, Vec2, Vec3};
use log::{info, warn};

use super::{
    begin_rendering, color_attachment, depth_attachment, end_rendering, release_pipeline,
    release_sampler, release_texture, shader, transition, FrameInputs, Pass, PushConstants,
    DEPTH_FORMAT,
};
use super::lighting::DRAW_FORMAT;
use crate::renderer::async_loader::{AsyncLoader, FileRequest, FileTarget};
use crate::renderer::device::Device;
use crate::renderer::resource_pool::Handle;
use crate::renderer::resources::{
    DepthState, Pipeline, PipelineCI, RasterState, Sampler, SamplerCI, Texture, TextureCI,
};
use crate::{AshError, Result};

pub const FACE_SIZE: u32 = 512;
const CUBE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Direction through texel `(s, t)` of a cube face, with faces ordered
/// +X, -X, +Y, -Y, +Z, -Z and `t` growing downwards. Mirrors `cubemap.frag`.
pub fn face_direction(face: u32, s: f32, t: f32) -> Vec3 {
    let (a, b) = (2.0 * s - 1.0, 2.0 * t - 1.0);
    let direction = match face {
        0 => Vec3::new(1.0, -b, -a),
        1 => Vec3::new(-1.0, -b, a),
        2 => Vec3::new(a, 1.0, b),
        3 => Vec3::new(a, -1.0, -b),
        4 => Vec3::new(a, -b, 1.0),
        _ => Vec3::new(-a, -b, -1.0),
    };
    direction.normalize()
}

/// Equirectangular texture coordinate of a unit direction; `v = 0` is straight up.
pub fn equirect_uv(direction: Vec3) -> Vec2 {
    Vec2::new(
        direction.z.atan2(direction.x) / (2.0 * PI) + 0.5,
        direction.y.clamp(-1.0, 1.0).acos() / PI,
    )
}

pub struct SkyboxPass {
    capture_pipeline: Handle<Pipeline>,
    sky_pipeline: Handle<Pipeline>,
    cube_sampler: Handle<Sampler>,
    /// Equirectangular source, released once the cube is built.
    source: Handle<Texture>,
    cube: Handle<Texture>,
    cube_ready: bool,

    enabled: bool,
    sky_view_proj: Mat4,
    draw_texture: Handle<Texture>,
    depth: Handle<Texture>,
    extent: vk::Extent2D,
}

impl SkyboxPass {
    pub fn new(device: &mut Device) -> Result<Self> {
        let cube_sampler = device.create_sampler(&SamplerCI {
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: None,
            debug_name: "environment_sampler".into(),
            ..Default::default()
        })?;
        let mut pass = Self {
            capture_pipeline: Handle::INVALID,
            sky_pipeline: Handle::INVALID,
            cube_sampler,
            source: Handle::INVALID,
            cube: Handle::INVALID,
            cube_ready: false,
            enabled: true,
            sky_view_proj: Mat4::IDENTITY,
            draw_texture: Handle::INVALID,
            depth: Handle::INVALID,
            extent: device.extent(),
        };
        if let Err(e) = pass.create_pipelines(device) {
            pass.shutdown(device);
            return Err(e);
        }
        Ok(pass)
    }

    fn create_pipelines(&mut self, device: &mut Device) -> Result<()> {
        let capture = create_capture_pipeline(device)?;
        let sky = match create_sky_pipeline(device) {
            Ok(sky) => sky,
            Err(e) => {
                let _ = device.destroy_pipeline(capture);
                return Err(e);
            }
        };
        release_pipeline(device, &mut self.capture_pipeline);
        release_pipeline(device, &mut self.sky_pipeline);
        self.capture_pipeline = capture;
        self.sky_pipeline = sky;
        Ok(())
    }

    /// Starts loading a new environment. The previous cube stops being sampled
    /// immediately; the new one appears once its upload and projection finish.
    pub fn set_environment(
        &mut self,
        device: &mut Device,
        loader: &AsyncLoader,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let path = path.as_ref();
        let (width, height) = image::image_dimensions(path).map_err(|e| {
            AshError::AssetError(format!("Cannot read environment {}: {e}", path.display()))
        })?;
        let source = device.create_texture(
            &TextureCI::new(width, height, vk::Format::R8G8B8A8_SRGB).name("environment_source"),
        )?;
        if let Err(e) = loader.request_file(FileRequest {
            path: path.to_path_buf(),
            target: FileTarget::Texture(source),
        }) {
            let _ = device.destroy_texture(source);
            return Err(e);
        }
        release_texture(device, &mut self.source);
        release_texture(device, &mut self.cube);
        self.source = source;
        self.cube_ready = false;
        info!(
            "Loading environment {} ({width}x{height})",
            path.display()
        );
        Ok(())
    }

    /// The environment cube once it is built, otherwise an invalid handle.
    pub fn environment(&self) -> Handle<Texture> {
        if self.cube_ready {
            self.cube
        } else {
            Handle::INVALID
        }
    }

    fn source_is_resident(&self, device: &Device) -> bool {
        self.source.is_valid()
            && device
                .texture(self.source)
                .map(|texture| texture.resident)
                .unwrap_or(false)
    }

    /// Projects the source onto the cube one face at a time through a shared
    /// capture target, then builds the mip chain.
    fn build_cube(&mut self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<()> {
        let cube = device.create_texture(
            &TextureCI::new(FACE_SIZE, FACE_SIZE, CUBE_FORMAT)
                .cube()
                .full_mip_chain()
                .usage(
                    vk::ImageUsageFlags::SAMPLED
                        | vk::ImageUsageFlags::TRANSFER_DST
                        | vk::ImageUsageFlags::TRANSFER_SRC,
                )
                .sampler(self.cube_sampler)
                .name("environment_cube"),
        )?;
        let mut capture = match device.create_texture(
            &TextureCI::new(FACE_SIZE, FACE_SIZE, CUBE_FORMAT)
                .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
                .name("environment_capture"),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                let _ = device.destroy_texture(cube);
                return Err(e);
            }
        };

        let recorded = self.record_faces(device, cmd, cube, capture);
        release_texture(device, &mut capture);
        if let Err(e) = recorded {
            let _ = device.destroy_texture(cube);
            return Err(e);
        }
        device.record_mip_chain(cmd, cube)?;
        device.make_texture_resident(cube)?;

        release_texture(device, &mut self.cube);
        release_texture(device, &mut self.source);
        self.cube = cube;
        self.cube_ready = true;
        info!("Environment cube built ({FACE_SIZE}px faces)");
        Ok(())
    }

    fn record_faces(
        &self,
        device: &Device,
        cmd: vk::CommandBuffer,
        cube: Handle<Texture>,
        capture: Handle<Texture>,
    ) -> Result<()> {
        transition(
            device,
            cmd,
            &[(
                cube,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )],
        )?;
        let extent = vk::Extent2D {
            width: FACE_SIZE,
            height: FACE_SIZE,
        };
        let source = device.texture(self.source)?.shader_index();
        let capture_view = device.texture(capture)?.view;
        let capture_image = device.texture(capture)?.image;
        let cube_image = device.texture(cube)?.image;

        for face in 0..6u32 {
            let previous = if face == 0 {
                vk::ImageLayout::UNDEFINED
            } else {
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL
            };
            transition(
                device,
                cmd,
                &[(capture, previous, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)],
            )?;
            let color = color_attachment(capture_view, vk::AttachmentLoadOp::DONT_CARE, [0.0; 4]);
            begin_rendering(device, cmd, extent, &[color], None);
            device.bind_pipeline(cmd, self.capture_pipeline)?;
            device.push_constants(
                cmd,
                self.capture_pipeline,
                &PushConstants::new(Mat4::IDENTITY, [source, face, 0, 0]),
            )?;
            unsafe { device.raw().cmd_draw(cmd, 3, 1, 0, 0) };
            end_rendering(device, cmd);
            transition(
                device,
                cmd,
                &[(
                    capture,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                )],
            )?;

            let layer = |base_array_layer: u32| vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer,
                layer_count: 1,
            };
            let region = vk::ImageCopy {
                src_subresource: layer(0),
                src_offset: vk::Offset3D::default(),
                dst_subresource: layer(face),
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width: FACE_SIZE,
                    height: FACE_SIZE,
                    depth: 1,
                },
            };
            unsafe {
                device.raw().cmd_copy_image(
                    cmd,
                    capture_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    cube_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
        }
        Ok(())
    }

    fn draw_sky(&self, device: &Device, cmd: vk::CommandBuffer) -> Result<()> {
        // Same-layout barrier orders the lighting writes before the sky's load.
        transition(
            device,
            cmd,
            &[
                (
                    self.draw_texture,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
                (
                    self.depth,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
                ),
            ],
        )?;
        let color = color_attachment(
            device.texture(self.draw_texture)?.view,
            vk::AttachmentLoadOp::LOAD,
            [0.0; 4],
        );
        let depth = depth_attachment(device.texture(self.depth)?.view, vk::AttachmentLoadOp::LOAD)
            .image_layout(vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL)
            .store_op(vk::AttachmentStoreOp::NONE);
        begin_rendering(device, cmd, self.extent, &[color], Some(&depth));
        device.bind_pipeline(cmd, self.sky_pipeline)?;
        device.push_constants(
            cmd,
            self.sky_pipeline,
            &PushConstants::new(
                self.sky_view_proj,
                [device.texture(self.cube)?.shader_index(), 0, 0, 0],
            ),
        )?;
        unsafe { device.raw().cmd_draw(cmd, 36, 1, 0, 0) };
        end_rendering(device, cmd);
        transition(
            device,
            cmd,
            &[(
                self.depth,
                vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        )
    }
}

fn create_capture_pipeline(device: &mut Device) -> Result<Handle<Pipeline>> {
    let mut ci = PipelineCI::new(vec![
        shader!("fullscreen.vert", vk::ShaderStageFlags::VERTEX)?,
        shader!("cubemap.frag", vk::ShaderStageFlags::FRAGMENT)?,
    ])
    .name("environment_capture");
    ci.raster = RasterState {
        cull_mode: vk::CullModeFlags::NONE,
        ..Default::default()
    };
    ci.depth = DepthState {
        test: false,
        write: false,
        compare_op: vk::CompareOp::ALWAYS,
    };
    ci.color_formats = vec![CUBE_FORMAT];
    device.create_pipeline(&ci)
}

fn create_sky_pipeline(device: &mut Device) -> Result<Handle<Pipeline>> {
    let mut ci = PipelineCI::new(vec![
        shader!("skybox.vert", vk::ShaderStageFlags::VERTEX)?,
        shader!("skybox.frag", vk::ShaderStageFlags::FRAGMENT)?,
    ])
    .name("skybox");
    ci.raster = RasterState {
        cull_mode: vk::CullModeFlags::NONE,
        ..Default::default()
    };
    // Sky sits at depth 1 and only shows where nothing was drawn.
    ci.depth = DepthState {
        test: true,
        write: false,
        compare_op: vk::CompareOp::LESS_OR_EQUAL,
    };
    ci.color_formats = vec![DRAW_FORMAT];
    ci.depth_format = Some(DEPTH_FORMAT);
    device.create_pipeline(&ci)
}

impl Pass for SkyboxPass {
    fn name(&self) -> &'static str {
        "skybox"
    }

    fn set_inputs(&mut self, _device: &mut Device, inputs: &FrameInputs) -> Result<()> {
        self.enabled = inputs.skybox_enabled;
        let rotation = Mat4::from_mat3(Mat3::from_mat4(inputs.view));
        self.sky_view_proj = inputs.projection * rotation;
        self.draw_texture = inputs.draw_texture;
        self.depth = inputs.gbuffer.depth;
        self.extent = inputs.extent;
        Ok(())
    }

    fn render(&mut self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<()> {
        if !self.cube_ready && self.source_is_resident(device) {
            if let Err(e) = self.build_cube(device, cmd) {
                warn!("Environment cube build failed: {e}");
                release_texture(device, &mut self.source);
            }
        }
        if self.enabled && self.cube_ready {
            self.draw_sky(device, cmd)?;
        }
        Ok(())
    }

    fn reload(&mut self, device: &mut Device) -> Result<()> {
        self.create_pipelines(device)
    }

    fn shutdown(&mut self, device: &mut Device) {
        release_pipeline(device, &mut self.capture_pipeline);
        release_pipeline(device, &mut self.sky_pipeline);
        release_texture(device, &mut self.source);
        release_texture(device, &mut self.cube);
        self.cube_ready = false;
        release_sampler(device, &mut self.cube_sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_centers_point_along_their_axes() {
        let axes = [
            Vec3::X,
            Vec3::NEG_X,
            Vec3::Y,
            Vec3::NEG_Y,
            Vec3::Z,
            Vec3::NEG_Z,
        ];
        for (face, axis) in axes.into_iter().enumerate() {
            let direction = face_direction(face as u32, 0.5, 0.5);
            assert!(direction.abs_diff_eq(axis, 1e-6), "face {face}: {direction}");
        }
    }

    #[test]
    fn face_texels_stay_on_their_face() {
        for face in 0..6u32 {
            for (s, t) in [(0.1, 0.1), (0.9, 0.2), (0.3, 0.8)] {
                let d = face_direction(face, s, t);
                let major = d.abs().max_element();
                let component = [d.x, d.x, d.y, d.y, d.z, d.z][face as usize];
                assert_eq!(component.abs(), major);
                assert_eq!(component > 0.0, face % 2 == 0);
            }
        }
    }

    #[test]
    fn poles_map_to_top_and_bottom_rows() {
        assert!(equirect_uv(Vec3::Y).y.abs() < 1e-6);
        assert!((equirect_uv(Vec3::NEG_Y).y - 1.0).abs() < 1e-6);
        let horizon = equirect_uv(Vec3::X);
        assert!((horizon - Vec2::new(0.5, 0.5)).length() < 1e-6);
    }
}
