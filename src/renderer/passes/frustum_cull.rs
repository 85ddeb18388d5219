//! GPU frustum culling: compacts the scene's indirect draw list into the draws
//! whose bounding spheres intersect the camera frustum.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use log::debug;

use super::{release_pipeline, shader, FrameInputs, Pass, PushConstants};
use crate::renderer::device::Device;
use crate::renderer::resource_pool::Handle;
use crate::renderer::resources::{Buffer, BufferCI, Pipeline, PipelineCI};
use crate::renderer::ring::RingBuffer;
use crate::renderer::scene_data::{IndirectDrawData, SceneBuffers, INITIAL_DRAW_CAPACITY};
use crate::vulkan::barrier::{self, QueueTransfer};
use crate::vulkan::QueueKind;
use crate::Result;

/// Must match `local_size_x` in `cull.comp`.
const WORKGROUP_SIZE: u32 = 64;

/// Left, right, bottom, top, near, far planes of a Vulkan clip-space
/// (zero-to-one depth) view-projection, as `xyz` normal and `w` distance,
/// normalized so that `dot(n, p) + w` is a signed distance.
pub fn extract_frustum_planes(view_proj: Mat4) -> [Vec4; 6] {
    let (r0, r1, r2, r3) = (
        view_proj.row(0),
        view_proj.row(1),
        view_proj.row(2),
        view_proj.row(3),
    );
    [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|plane| {
        let length = plane.truncate().length();
        if length > f32::EPSILON {
            plane / length
        } else {
            plane
        }
    })
}

/// CPU twin of the test in `cull.comp`.
pub fn sphere_in_frustum(planes: &[Vec4; 6], sphere: Vec4) -> bool {
    let center = sphere.truncate();
    planes
        .iter()
        .all(|plane| plane.truncate().dot(center) + plane.w >= -sphere.w)
}

/// Storage block read by `cull.comp` through push slot 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct CullUniforms {
    planes: [Vec4; 6],
    draw_count: u32,
    in_draws: u32,
    bounds: u32,
    out_draws: u32,
    out_count: u32,
    _pad: [u32; 3],
}

pub struct FrustumCullPass {
    pipeline: Handle<Pipeline>,
    uniforms: RingBuffer,
    out_draws: RingBuffer,
    out_count: RingBuffer,
    /// Queue the dispatch is recorded on, and the queue drawing from its output.
    /// Both are the main queue today; the barrier pair keeps the hand-off explicit.
    handoff: QueueTransfer,
    enabled: bool,
    cull_view_proj: Option<Mat4>,
    scene: SceneBuffers,
}

impl FrustumCullPass {
    pub fn new(device: &mut Device) -> Result<Self> {
        let draw_size = std::mem::size_of::<IndirectDrawData>() as u64;
        let uniforms = RingBuffer::per_frame(
            device,
            &BufferCI::new(
                std::mem::size_of::<CullUniforms>() as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
            )
            .mapped()
            .bindless()
            .name("cull_uniforms"),
        )?;
        let out_draws = RingBuffer::per_frame(
            device,
            &BufferCI::new(
                INITIAL_DRAW_CAPACITY * draw_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
            )
            .bindless()
            .name("culled_draws"),
        )?;
        let out_count = RingBuffer::per_frame(
            device,
            &BufferCI::new(
                16,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .bindless()
            .name("culled_draw_count"),
        )?;
        let main = device.queue_family(QueueKind::Main);
        Ok(Self {
            pipeline: create_pipeline(device)?,
            uniforms,
            out_draws,
            out_count,
            handoff: QueueTransfer::new(main, main),
            enabled: true,
            cull_view_proj: None,
            scene: SceneBuffers::default(),
        })
    }

    /// Draw list and count the G-buffer pass should consume this frame.
    pub fn visible(&self) -> (Handle<Buffer>, Handle<Buffer>) {
        if self.enabled {
            (self.out_draws.buffer(), self.out_count.buffer())
        } else {
            (self.scene.draws, self.scene.count)
        }
    }
}

fn create_pipeline(device: &mut Device) -> Result<Handle<Pipeline>> {
    device.create_pipeline(
        &PipelineCI::new(vec![shader!("cull.comp", vk::ShaderStageFlags::COMPUTE)?])
            .name("frustum_cull"),
    )
}

impl Pass for FrustumCullPass {
    fn name(&self) -> &'static str {
        "frustum_cull"
    }

    fn set_inputs(&mut self, device: &mut Device, inputs: &FrameInputs) -> Result<()> {
        self.enabled = inputs.cull_enabled;
        self.scene = inputs.scene;
        if !(inputs.freeze_cull && self.cull_view_proj.is_some()) {
            self.cull_view_proj = Some(inputs.view_proj());
        }
        if !self.enabled {
            return Ok(());
        }

        self.uniforms.move_to_next_buffer();
        self.out_draws.move_to_next_buffer();
        self.out_count.move_to_next_buffer();
        let draw_bytes =
            u64::from(self.scene.draw_count) * std::mem::size_of::<IndirectDrawData>() as u64;
        if self.out_draws.ensure_capacity(device, draw_bytes)? {
            debug!("Cull output grown for {} draws", self.scene.draw_count);
        }

        let uniforms = CullUniforms {
            planes: extract_frustum_planes(self.cull_view_proj.unwrap_or(Mat4::IDENTITY)),
            draw_count: self.scene.draw_count,
            in_draws: device.buffer(self.scene.draws)?.shader_index(),
            bounds: device.buffer(self.scene.bounds)?.shader_index(),
            out_draws: device.buffer(self.out_draws.buffer())?.shader_index(),
            out_count: device.buffer(self.out_count.buffer())?.shader_index(),
            _pad: [0; 3],
        };
        self.uniforms.write(device, bytemuck::bytes_of(&uniforms))
    }

    fn render(&mut self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let raw = device.raw();
        let count = device.buffer(self.out_count.buffer())?.raw;
        let draws = device.buffer(self.out_draws.buffer())?.raw;

        unsafe { raw.cmd_fill_buffer(cmd, count, 0, vk::WHOLE_SIZE, 0) };
        let cleared = vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
            .dst_access_mask(
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            )
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(count)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        barrier::record(raw, cmd, &[cleared], &[]);

        if self.scene.draw_count > 0 {
            device.bind_pipeline(cmd, self.pipeline)?;
            let push = PushConstants::new(
                Mat4::IDENTITY,
                [
                    device.buffer(self.uniforms.buffer())?.shader_index(),
                    0,
                    0,
                    0,
                ],
            );
            device.push_constants(cmd, self.pipeline, &push)?;
            let groups = self.scene.draw_count.div_ceil(WORKGROUP_SIZE);
            unsafe { raw.cmd_dispatch(cmd, groups, 1, 1) };
        }

        let released = [draws, count].map(|buffer| {
            barrier::buffer_release(
                buffer,
                self.handoff,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            )
        });
        barrier::record(raw, cmd, &released, &[]);
        let acquired = [draws, count].map(|buffer| {
            barrier::buffer_acquire(
                buffer,
                self.handoff,
                vk::PipelineStageFlags2::DRAW_INDIRECT | vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::AccessFlags2::INDIRECT_COMMAND_READ | vk::AccessFlags2::SHADER_STORAGE_READ,
            )
        });
        barrier::record(raw, cmd, &acquired, &[]);
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
        self.uniforms.release(device);
        self.out_draws.release(device);
        self.out_count.release(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn camera() -> Mat4 {
        let projection = Mat4::perspective_rh(90f32.to_radians(), 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        super::super::vulkan_clip(projection) * view
    }

    #[test]
    fn planes_are_normalized() {
        for plane in extract_frustum_planes(camera()) {
            assert!((plane.truncate().length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn sphere_in_front_of_camera_is_visible() {
        let planes = extract_frustum_planes(camera());
        assert!(sphere_in_frustum(&planes, Vec4::new(0.0, 0.0, -10.0, 1.0)));
    }

    #[test]
    fn spheres_outside_are_rejected() {
        let planes = extract_frustum_planes(camera());
        // Behind the camera.
        assert!(!sphere_in_frustum(&planes, Vec4::new(0.0, 0.0, 10.0, 1.0)));
        // Far to the right of a 90 degree frustum at depth 10.
        assert!(!sphere_in_frustum(&planes, Vec4::new(50.0, 0.0, -10.0, 1.0)));
        // Beyond the far plane.
        assert!(!sphere_in_frustum(&planes, Vec4::new(0.0, 0.0, -200.0, 1.0)));
    }

    #[test]
    fn straddling_sphere_is_kept() {
        let planes = extract_frustum_planes(camera());
        // Center just outside the right plane, radius reaches back in.
        assert!(sphere_in_frustum(&planes, Vec4::new(11.0, 0.0, -10.0, 2.0)));
    }

    #[test]
    fn uniform_block_matches_std430() {
        assert_eq!(std::mem::size_of::<CullUniforms>(), 128);
    }
}
