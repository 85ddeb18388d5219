//! The GPU object authority: every buffer, texture, sampler, pipeline and
//! descriptor set is created and destroyed here and referenced elsewhere by handle.

use ash::vk;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;
use vk_mem::Alloc;

use super::async_loader::UploadRequest;
use super::pipeline;
use super::pipeline_cache::{CacheIdentity, PipelineCache};
use super::resource_pool::{Handle, ResourcePool};
use super::resources::{
    Buffer, BufferCI, DescriptorSet, DescriptorSetCI, Pipeline, PipelineCI, Sampler, SamplerCI,
    Texture, TextureCI, TextureKind,
};
use crate::config::EngineConfig;
use crate::vulkan::{
    barrier, submit_immediate, submit_with_fence, BindlessHeap, CommandRing, DescriptorSetLayoutBuilder, FrameSync,
    QueueKind, SwapchainWrapper, VulkanDevice,
};
use crate::{AshError, Result};

/// A pool entry whose handle is gone but whose GPU object may still be in use by
/// an in-flight frame.
enum Retired {
    Buffer(Buffer),
    Texture(Texture),
    Sampler(Sampler),
    Pipeline(Pipeline),
    DescriptorSet(DescriptorSet),
}

/// Objects waiting for every frame that might still read them to finish.
///
/// An object is tagged with the index of the frame being recorded when it was
/// retired (the next frame to be submitted when retired between frames). It is
/// released once that frame's slot has been waited on again, which `new_frame`
/// does `frames_in_flight` frames later.
#[derive(Debug)]
struct RetireQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> RetireQueue<T> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, frame: u64, object: T) {
        self.entries.push_back((frame, object));
    }

    /// Removes every object no frame before `frame` can still be using, given
    /// that frames up to `frame - frames_in_flight` have completed.
    fn drain_completed(&mut self, frame: u64, frames_in_flight: usize) -> Vec<T> {
        let mut released = Vec::new();
        while let Some((tag, _)) = self.entries.front() {
            if tag + frames_in_flight as u64 > frame {
                break;
            }
            if let Some((_, object)) = self.entries.pop_front() {
                released.push(object);
            }
        }
        released
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, object)| object).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of [`Device::new_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// A command buffer is recording and an image was acquired.
    Ready,
    /// The swapchain was rebuilt; size-dependent targets must be recreated and the
    /// frame skipped.
    Resized,
}

pub struct Device {
    config: EngineConfig,
    buffers: ResourcePool<Buffer>,
    textures: ResourcePool<Texture>,
    samplers: ResourcePool<Sampler>,
    pipelines: ResourcePool<Pipeline>,
    descriptor_sets: ResourcePool<DescriptorSet>,
    retired: RetireQueue<Retired>,
    initial_uploads: VecDeque<UploadRequest>,

    frames: Vec<FrameSync>,
    commands: CommandRing,
    frame_index: usize,
    frame_counter: u64,
    image_index: u32,
    recording: Option<vk::CommandBuffer>,
    swapchain: Option<SwapchainWrapper>,
    requested_extent: vk::Extent2D,
    headless_extent: vk::Extent2D,
    swapchain_dirty: bool,

    descriptor_pool: vk::DescriptorPool,
    bindless: BindlessHeap,
    pipeline_cache: PipelineCache,
    default_sampler: Handle<Sampler>,
    default_texture: Handle<Texture>,
    default_buffer: Handle<Buffer>,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    vulkan: VulkanDevice,
}

impl Device {
    pub fn new(vulkan: VulkanDevice, config: EngineConfig, extent: vk::Extent2D) -> Result<Self> {
        config.validate()?;
        let raw = Arc::clone(&vulkan.device);

        let mut allocator_info = vk_mem::AllocatorCreateInfo::new(
            vulkan.instance.instance(),
            &raw,
            vulkan.physical_device,
        );
        allocator_info.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = unsafe { vk_mem::Allocator::new(allocator_info) }.map_err(|e| {
            AshError::DeviceInitFailed(format!("Failed to create memory allocator: {e:?}"))
        })?;

        let bindless = BindlessHeap::new(
            Arc::clone(&raw),
            config.max_bindless_textures,
            config.max_bindless_buffers,
        )?;
        let pipeline_cache = PipelineCache::new(
            Arc::clone(&raw),
            &CacheIdentity::from_properties(&vulkan.properties),
            config.pipeline_cache_path.clone(),
        )?;
        let descriptor_pool = create_descriptor_pool(&raw, config.pools.descriptor_sets)?;

        let frames = (0..config.frames_in_flight)
            .map(|_| FrameSync::new(Arc::clone(&raw)))
            .collect::<Result<Vec<_>>>()?;
        let commands = CommandRing::new(
            Arc::clone(&raw),
            vulkan.families.main,
            config.frames_in_flight,
        )?;

        let swapchain = if vulkan.instance.is_headless() {
            None
        } else {
            Some(SwapchainWrapper::new(&vulkan, extent, config.vsync)?)
        };

        let pools = config.pools;
        let mut device = Self {
            buffers: ResourcePool::new("buffer", pools.buffers),
            textures: ResourcePool::new("texture", pools.textures),
            samplers: ResourcePool::new("sampler", pools.samplers),
            pipelines: ResourcePool::new("pipeline", pools.pipelines),
            descriptor_sets: ResourcePool::new("descriptor set", pools.descriptor_sets),
            retired: RetireQueue::new(),
            initial_uploads: VecDeque::new(),
            frames,
            commands,
            frame_index: 0,
            frame_counter: 0,
            image_index: 0,
            recording: None,
            swapchain,
            requested_extent: extent,
            headless_extent: extent,
            swapchain_dirty: false,
            descriptor_pool,
            bindless,
            pipeline_cache,
            default_sampler: Handle::INVALID,
            default_texture: Handle::INVALID,
            default_buffer: Handle::INVALID,
            allocator: ManuallyDrop::new(allocator),
            vulkan,
            config,
        };
        device.create_defaults()?;

        info!(
            "Device ready: {} frames in flight, extent {}x{}{}",
            device.config.frames_in_flight,
            device.extent().width,
            device.extent().height,
            if device.is_headless() { " (headless)" } else { "" }
        );
        Ok(device)
    }

    /// Claims bindless slot 0 of both arrays so that index 0 means "absent": a white
    /// texel for textures and a small zeroed buffer for storage buffers.
    fn create_defaults(&mut self) -> Result<()> {
        self.default_sampler = self.create_sampler(&SamplerCI {
            debug_name: "default_sampler".into(),
            ..SamplerCI::default()
        })?;
        self.default_texture = self.create_texture(
            &TextureCI::new(1, 1, vk::Format::R8G8B8A8_UNORM).name("default_white"),
        )?;
        self.default_buffer = self.create_buffer(
            &BufferCI::new(16, vk::BufferUsageFlags::STORAGE_BUFFER)
                .bindless()
                .name("default_storage"),
        )?;

        let staging = self.create_buffer(
            &BufferCI::new(4, vk::BufferUsageFlags::TRANSFER_SRC)
                .mapped()
                .name("default_white_staging"),
        )?;
        self.write_buffer(staging, 0, &[255u8; 4])?;

        let image = self.texture(self.default_texture)?.image;
        let src = self.buffer(staging)?.raw;
        let range = barrier::color_range(1, 1);
        let device = Arc::clone(&self.vulkan.device);
        submit_immediate(
            &device,
            self.vulkan.families.main,
            self.vulkan.main_queue,
            |cmd| {
                barrier::record(
                    &device,
                    cmd,
                    &[],
                    &[barrier::image_transition(
                        image,
                        range,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    )],
                );
                let region = vk::BufferImageCopy::default()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width: 1,
                        height: 1,
                        depth: 1,
                    });
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
                barrier::record(
                    &device,
                    cmd,
                    &[],
                    &[barrier::image_transition(
                        image,
                        range,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    )],
                );
            },
        )?;
        // The immediate submit has completed, so the staging buffer can go right away.
        let staging = self.buffers.release(staging)?;
        self.destroy_now(Retired::Buffer(staging));

        debug_assert_eq!(self.texture(self.default_texture)?.bindless_index, Some(0));
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vulkan(&self) -> &VulkanDevice {
        &self.vulkan
    }

    pub fn raw(&self) -> &Arc<ash::Device> {
        &self.vulkan.device
    }

    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        self.vulkan.queue(kind)
    }

    pub fn queue_family(&self, kind: QueueKind) -> u32 {
        self.vulkan.families.family(kind)
    }

    pub fn is_headless(&self) -> bool {
        self.swapchain.is_none()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.config.frames_in_flight
    }

    /// Current frame-in-flight slot.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Frames presented since creation.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or(self.headless_extent, |swapchain| swapchain.extent)
    }

    pub fn bindless_set(&self) -> vk::DescriptorSet {
        self.bindless.descriptor_set()
    }

    pub fn bindless_layout(&self) -> vk::DescriptorSetLayout {
        self.bindless.layout()
    }

    pub fn default_texture(&self) -> Handle<Texture> {
        self.default_texture
    }

    pub fn default_sampler(&self) -> Handle<Sampler> {
        self.default_sampler
    }

    pub fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) {
        if !name.is_empty() {
            self.vulkan.set_object_name(handle, name);
        }
    }

    // Buffers

    pub fn create_buffer(&mut self, ci: &BufferCI) -> Result<Handle<Buffer>> {
        let mut usage = ci.usage;
        if ci.bindless {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        let info = vk::BufferCreateInfo::default()
            .size(ci.size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_info = if ci.mapped {
            vk_mem::AllocationCreateInfo {
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                usage: vk_mem::MemoryUsage::Auto,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            }
        } else {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            }
        };

        let (raw, mut allocation) = unsafe { self.allocator.create_buffer(&info, &alloc_info) }
            .map_err(|e| {
                error!("Failed to create buffer '{}': {e:?}", ci.debug_name);
                AshError::VulkanError(format!("Failed to create buffer '{}': {e:?}", ci.debug_name))
            })?;

        let mapped = if ci.mapped {
            match unsafe { self.allocator.map_memory(&mut allocation) } {
                Ok(ptr) => NonNull::new(ptr),
                Err(e) => {
                    unsafe { self.allocator.destroy_buffer(raw, &mut allocation) };
                    return Err(AshError::VulkanError(format!(
                        "Failed to map buffer '{}': {e:?}",
                        ci.debug_name
                    )));
                }
            }
        } else {
            None
        };

        let bindless_index = if ci.bindless {
            Some(self.bindless.add_storage_buffer(raw, vk::WHOLE_SIZE)?)
        } else {
            None
        };
        self.set_debug_name(raw, &ci.debug_name);

        let buffer = Buffer {
            raw,
            allocation,
            size: ci.size,
            usage,
            mapped,
            bindless_index,
            resident: ci.initial_data.is_none(),
            name: ci.debug_name.clone(),
        };
        let handle = match self.buffers.obtain(buffer) {
            Ok(handle) => handle,
            Err(e) => {
                error!("{e}");
                return Err(e);
            }
        };

        if let Some(data) = &ci.initial_data {
            self.initial_uploads.push_back(UploadRequest::Buffer {
                dst: handle,
                offset: 0,
                data: data.clone(),
            });
        }
        debug!("Created buffer '{}' ({} bytes)", ci.debug_name, ci.size);
        Ok(handle)
    }

    pub fn buffer(&self, handle: Handle<Buffer>) -> Result<&Buffer> {
        self.buffers.get(handle)
    }

    /// Copies `data` into a persistently mapped buffer at `offset`.
    pub fn write_buffer(&self, handle: Handle<Buffer>, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffers.get(handle)?;
        let ptr = buffer.mapped.ok_or_else(|| {
            AshError::VulkanError(format!("Buffer '{}' is not host mapped", buffer.name))
        })?;
        let end = offset + data.len() as u64;
        if end > buffer.size {
            return Err(AshError::VulkanError(format!(
                "Write of {} bytes at {offset} overruns buffer '{}' ({} bytes)",
                data.len(),
                buffer.name,
                buffer.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            )
        };
        Ok(())
    }

    pub fn mark_buffer_resident(&mut self, handle: Handle<Buffer>) -> Result<()> {
        self.buffers.get_mut(handle)?.resident = true;
        Ok(())
    }

    pub fn is_buffer_resident(&self, handle: Handle<Buffer>) -> bool {
        self.buffers.get(handle).is_ok_and(|buffer| buffer.resident)
    }

    pub fn destroy_buffer(&mut self, handle: Handle<Buffer>) -> Result<()> {
        let buffer = self.buffers.release(handle)?;
        self.retire(Retired::Buffer(buffer));
        Ok(())
    }

    // Textures

    pub fn create_texture(&mut self, ci: &TextureCI) -> Result<Handle<Texture>> {
        let mip_levels = ci.resolved_mip_levels();
        let layers = ci.kind.layers();
        let flags = match ci.kind {
            TextureKind::D2 => vk::ImageCreateFlags::empty(),
            TextureKind::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
        };
        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(ci.format)
            .extent(vk::Extent3D {
                width: ci.width.max(1),
                height: ci.height.max(1),
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(ci.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, mut allocation) = unsafe { self.allocator.create_image(&info, &alloc_info) }
            .map_err(|e| {
                error!("Failed to create texture '{}': {e:?}", ci.debug_name);
                AshError::VulkanError(format!(
                    "Failed to create texture '{}': {e:?}",
                    ci.debug_name
                ))
            })?;

        let mut texture = Texture {
            image,
            view: vk::ImageView::null(),
            allocation,
            extent: vk::Extent2D {
                width: ci.width.max(1),
                height: ci.height.max(1),
            },
            format: ci.format,
            kind: ci.kind,
            mip_levels,
            usage: ci.usage,
            bindless_index: None,
            sampler: ci.sampler.unwrap_or(self.default_sampler),
            resident: true,
            name: ci.debug_name.clone(),
        };
        texture.resident = !(texture.is_content() && self.default_texture.is_valid());

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(match ci.kind {
                TextureKind::D2 => vk::ImageViewType::TYPE_2D,
                TextureKind::Cube => vk::ImageViewType::CUBE,
            })
            .format(ci.format)
            .subresource_range(texture.full_range());
        texture.view = match unsafe { self.vulkan.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.allocator.destroy_image(image, &mut texture.allocation) };
                return Err(AshError::VulkanError(format!(
                    "Failed to create view for texture '{}': {e:?}",
                    ci.debug_name
                )));
            }
        };

        if ci.usage.contains(vk::ImageUsageFlags::SAMPLED) {
            let placeholder = if texture.resident {
                Ok(texture.view)
            } else {
                self.textures.get(self.default_texture).map(|default| default.view)
            };
            let registered = placeholder
                .and_then(|view| Ok((view, self.sampler(texture.sampler)?.raw)))
                .and_then(|(view, sampler)| self.bindless.add_sampled_image(view, sampler));
            match registered {
                Ok(index) => texture.bindless_index = Some(index),
                Err(e) => {
                    self.destroy_now(Retired::Texture(texture));
                    return Err(e);
                }
            }
        }
        self.set_debug_name(image, &ci.debug_name);
        self.set_debug_name(texture.view, &ci.debug_name);

        debug!(
            "Created texture '{}' {}x{} {:?} ({} mips, {} layers)",
            ci.debug_name, ci.width, ci.height, ci.format, mip_levels, layers
        );
        match self.textures.obtain(texture) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                error!("{e}");
                Err(e)
            }
        }
    }

    pub fn texture(&self, handle: Handle<Texture>) -> Result<&Texture> {
        self.textures.get(handle)
    }

    /// Points the texture's bindless slot at its own view. Called once its pixels
    /// are readable in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn make_texture_resident(&mut self, handle: Handle<Texture>) -> Result<()> {
        let texture = self.textures.get_mut(handle)?;
        if texture.resident {
            return Ok(());
        }
        texture.resident = true;
        let (view, index, sampler) = (texture.view, texture.bindless_index, texture.sampler);
        if let Some(index) = index {
            let sampler = self.samplers.get(sampler)?.raw;
            self.bindless.write_sampled_image(index, view, sampler);
        }
        Ok(())
    }

    pub fn destroy_texture(&mut self, handle: Handle<Texture>) -> Result<()> {
        let texture = self.textures.release(handle)?;
        self.retire(Retired::Texture(texture));
        Ok(())
    }

    /// Records a blit chain from mip 0 down through every level of every layer.
    ///
    /// Level 0 must be in `TRANSFER_DST_OPTIMAL`; the remaining levels may be
    /// undefined. Every level ends in `SHADER_READ_ONLY_OPTIMAL`. Textures with
    /// more than one level need `TRANSFER_SRC` usage.
    pub fn record_mip_chain(&self, cmd: vk::CommandBuffer, handle: Handle<Texture>) -> Result<()> {
        let texture = self.textures.get(handle)?;
        let device = &self.vulkan.device;
        if texture.mip_levels == 1 {
            barrier::record(
                device,
                cmd,
                &[],
                &[barrier::image_transition(
                    texture.image,
                    texture.full_range(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )],
            );
            return Ok(());
        }
        let layers = texture.kind.layers();
        let level = |mip: u32| vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: mip,
            level_count: 1,
            base_array_layer: 0,
            layer_count: layers,
        };

        let mut width = texture.extent.width as i32;
        let mut height = texture.extent.height as i32;
        for mip in 1..texture.mip_levels {
            barrier::record(
                device,
                cmd,
                &[],
                &[
                    barrier::image_transition(
                        texture.image,
                        level(mip - 1),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    ),
                    barrier::image_transition(
                        texture.image,
                        level(mip),
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    ),
                ],
            );
            let next_width = (width / 2).max(1);
            let next_height = (height / 2).max(1);
            let blit = vk::ImageBlit::default()
                .src_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: mip - 1,
                    base_array_layer: 0,
                    layer_count: layers,
                })
                .src_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: width,
                        y: height,
                        z: 1,
                    },
                ])
                .dst_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: mip,
                    base_array_layer: 0,
                    layer_count: layers,
                })
                .dst_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ]);
            unsafe {
                device.cmd_blit_image(
                    cmd,
                    texture.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    texture.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                )
            };
            width = next_width;
            height = next_height;
        }

        // Last level was only written; bring it in line with the others first.
        barrier::record(
            device,
            cmd,
            &[],
            &[barrier::image_transition(
                texture.image,
                level(texture.mip_levels - 1),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )],
        );
        barrier::record(
            device,
            cmd,
            &[],
            &[barrier::image_transition(
                texture.image,
                texture.full_range(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        );
        Ok(())
    }

    // Samplers

    pub fn create_sampler(&mut self, ci: &SamplerCI) -> Result<Handle<Sampler>> {
        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(ci.filter)
            .min_filter(ci.filter)
            .mipmap_mode(ci.mipmap_mode)
            .address_mode_u(ci.address_mode)
            .address_mode_v(ci.address_mode)
            .address_mode_w(ci.address_mode)
            .max_lod(ci.max_lod)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        if let Some(anisotropy) = ci.max_anisotropy {
            let limit = self.vulkan.properties.limits.max_sampler_anisotropy;
            info = info.anisotropy_enable(true).max_anisotropy(anisotropy.min(limit));
        }
        if let Some(op) = ci.compare_op {
            info = info.compare_enable(true).compare_op(op);
        }
        let raw = unsafe { self.vulkan.device.create_sampler(&info, None) }.map_err(|e| {
            AshError::VulkanError(format!("Failed to create sampler '{}': {e:?}", ci.debug_name))
        })?;
        self.set_debug_name(raw, &ci.debug_name);
        let sampler = Sampler {
            raw,
            name: ci.debug_name.clone(),
        };
        self.samplers.obtain(sampler).map_err(|e| {
            error!("{e}");
            e
        })
    }

    pub fn sampler(&self, handle: Handle<Sampler>) -> Result<&Sampler> {
        self.samplers.get(handle)
    }

    pub fn destroy_sampler(&mut self, handle: Handle<Sampler>) -> Result<()> {
        let sampler = self.samplers.release(handle)?;
        self.retire(Retired::Sampler(sampler));
        Ok(())
    }

    // Pipelines

    pub fn create_pipeline(&mut self, ci: &PipelineCI) -> Result<Handle<Pipeline>> {
        #[cfg(feature = "shader_reflection")]
        let reflected;
        #[cfg(feature = "shader_reflection")]
        let ci = if ci.reflection.is_empty() {
            let mut owned = ci.clone();
            for stage in &ci.stages {
                owned.reflection.merge(&stage.reflect()?);
            }
            reflected = owned;
            &reflected
        } else {
            ci
        };

        let pipeline = pipeline::create_pipeline(
            &self.vulkan.device,
            self.pipeline_cache.handle(),
            self.bindless.layout(),
            ci,
        )
        .map_err(|e| {
            error!("{e}");
            e
        })?;
        self.set_debug_name(pipeline.raw, &ci.debug_name);
        self.pipelines.obtain(pipeline).map_err(|e| {
            error!("{e}");
            e
        })
    }

    pub fn pipeline(&self, handle: Handle<Pipeline>) -> Result<&Pipeline> {
        self.pipelines.get(handle)
    }

    pub fn destroy_pipeline(&mut self, handle: Handle<Pipeline>) -> Result<()> {
        let pipeline = self.pipelines.release(handle)?;
        self.retire(Retired::Pipeline(pipeline));
        Ok(())
    }

    /// Binds the pipeline and the bindless heap at set 0.
    pub fn bind_pipeline(&self, cmd: vk::CommandBuffer, handle: Handle<Pipeline>) -> Result<()> {
        let pipeline = self.pipelines.get(handle)?;
        unsafe {
            self.vulkan
                .device
                .cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.raw);
            self.vulkan.device.cmd_bind_descriptor_sets(
                cmd,
                pipeline.bind_point,
                pipeline.layout,
                0,
                &[self.bindless.descriptor_set()],
                &[],
            );
        }
        Ok(())
    }

    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        cmd: vk::CommandBuffer,
        handle: Handle<Pipeline>,
        value: &T,
    ) -> Result<()> {
        let pipeline = self.pipelines.get(handle)?;
        let stages = if pipeline.bind_point == vk::PipelineBindPoint::COMPUTE {
            vk::ShaderStageFlags::COMPUTE
        } else {
            vk::ShaderStageFlags::ALL_GRAPHICS
        };
        unsafe {
            self.vulkan.device.cmd_push_constants(
                cmd,
                pipeline.layout,
                stages,
                0,
                bytemuck::bytes_of(value),
            )
        };
        Ok(())
    }

    // Descriptor sets

    pub fn create_descriptor_set(&mut self, ci: &DescriptorSetCI) -> Result<Handle<DescriptorSet>> {
        let mut builder = DescriptorSetLayoutBuilder::new();
        if let Some((_, bindings)) = ci.bindings.sets().find(|(set, _)| *set == ci.set) {
            for binding in bindings {
                builder = builder.add_binding(
                    binding.binding,
                    binding.descriptor_type,
                    binding.stages,
                    binding.count.max(1),
                );
            }
        }
        let layout = builder.build(Arc::clone(&self.vulkan.device))?;

        let counts = [layout.variable_count().unwrap_or(0)];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let layouts = [layout.handle()];
        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        if layout.variable_count().is_some() {
            alloc_info = alloc_info.push_next(&mut variable_info);
        }
        let raw = unsafe { self.vulkan.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| {
                AshError::VulkanError(format!(
                    "Failed to allocate descriptor set '{}': {e:?}",
                    ci.debug_name
                ))
            })?[0];
        self.set_debug_name(raw, &ci.debug_name);

        let set = DescriptorSet {
            raw,
            layout,
            name: ci.debug_name.clone(),
        };
        self.descriptor_sets.obtain(set).map_err(|e| {
            error!("{e}");
            e
        })
    }

    pub fn descriptor_set(&self, handle: Handle<DescriptorSet>) -> Result<&DescriptorSet> {
        self.descriptor_sets.get(handle)
    }

    /// Points `binding` of a descriptor set at a whole buffer.
    pub fn write_descriptor_buffer(
        &self,
        set: Handle<DescriptorSet>,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: Handle<Buffer>,
    ) -> Result<()> {
        let set = self.descriptor_sets.get(set)?;
        let buffer = self.buffers.get(buffer)?;
        let info = [vk::DescriptorBufferInfo {
            buffer: buffer.raw,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set.raw)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .buffer_info(&info);
        unsafe { self.vulkan.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    pub fn bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: Handle<Pipeline>,
        set_index: u32,
        set: Handle<DescriptorSet>,
    ) -> Result<()> {
        let pipeline = self.pipelines.get(pipeline)?;
        let set = self.descriptor_sets.get(set)?;
        unsafe {
            self.vulkan.device.cmd_bind_descriptor_sets(
                cmd,
                pipeline.bind_point,
                pipeline.layout,
                set_index,
                &[set.raw],
                &[],
            )
        };
        Ok(())
    }

    pub fn destroy_descriptor_set(&mut self, handle: Handle<DescriptorSet>) -> Result<()> {
        let set = self.descriptor_sets.release(handle)?;
        self.retire(Retired::DescriptorSet(set));
        Ok(())
    }

    // Uploads queued by creation calls

    /// Hands the transfer loader every initial-data upload queued since the last call.
    pub fn take_initial_uploads(&mut self) -> VecDeque<UploadRequest> {
        std::mem::take(&mut self.initial_uploads)
    }

    // Frame lifecycle

    /// Waits for the current slot's previous submission, releases objects no
    /// in-flight frame can reference, acquires a swapchain image and begins the
    /// slot's command buffer.
    pub fn new_frame(&mut self) -> Result<FrameStatus> {
        if self.swapchain_dirty {
            self.recreate_swapchain()?;
            return Ok(FrameStatus::Resized);
        }

        let slot = self.frame_index;
        self.frames[slot].wait()?;
        self.flush_retired();

        if let Some(swapchain) = &self.swapchain {
            match swapchain.acquire_next_image(self.frames[slot].image_available) {
                Ok((index, suboptimal)) => {
                    self.image_index = index;
                    if suboptimal {
                        self.swapchain_dirty = true;
                    }
                }
                Err(AshError::SwapchainOutOfDate(_)) => {
                    self.recreate_swapchain()?;
                    return Ok(FrameStatus::Resized);
                }
                Err(e) => return Err(e),
            }
        }

        // The fence is only reset at submission, so it stays signaled if this
        // frame never reaches the queue.
        self.recording = Some(self.commands.begin(slot)?);
        Ok(FrameStatus::Ready)
    }

    /// The current slot's command buffer, in the recording state.
    pub fn get_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.recording.ok_or_else(|| {
            AshError::VulkanError("No frame is recording; call new_frame first".into())
        })
    }

    /// Copies `source` (in `TRANSFER_SRC_OPTIMAL`) onto the acquired swapchain image
    /// and leaves that image ready for presentation. No-op when headless.
    pub fn blit_to_swapchain(&self, cmd: vk::CommandBuffer, source: Handle<Texture>) -> Result<()> {
        let Some(swapchain) = &self.swapchain else {
            return Ok(());
        };
        let source = self.textures.get(source)?;
        let target = swapchain.images[self.image_index as usize];
        let device = &self.vulkan.device;
        let range = barrier::color_range(1, 1);

        // The wait on image_available happens at the transfer stage, so the
        // transition has to be ordered after that stage.
        let to_dst = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(target)
            .subresource_range(range);
        barrier::record(device, cmd, &[], &[to_dst]);

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let blit = vk::ImageBlit::default()
            .src_subresource(layers)
            .src_offsets([vk::Offset3D::default(), corner(source.extent)])
            .dst_subresource(layers)
            .dst_offsets([vk::Offset3D::default(), corner(swapchain.extent)]);
        unsafe {
            device.cmd_blit_image(
                cmd,
                source.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            )
        };

        barrier::record(
            device,
            cmd,
            &[],
            &[barrier::image_transition(
                target,
                range,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            )],
        );
        Ok(())
    }

    /// Submits the recorded command buffer, presents the acquired image and moves
    /// to the next frame-in-flight slot.
    pub fn present(&mut self) -> Result<()> {
        let cmd = self.recording.take().ok_or_else(|| {
            AshError::VulkanError("present called without a recording frame".into())
        })?;
        self.commands.end(cmd)?;

        let slot = self.frame_index;
        let sync = &self.frames[slot];
        let render_finished = match &self.swapchain {
            Some(swapchain) => Some(swapchain.render_finished(self.image_index)?),
            None => None,
        };
        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let waits = [vk::SemaphoreSubmitInfo::default()
            .semaphore(sync.image_available)
            .stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)];
        let signals: Vec<_> = render_finished
            .iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let mut submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
        if render_finished.is_some() {
            submit = submit
                .wait_semaphore_infos(&waits)
                .signal_semaphore_infos(&signals);
        }
        submit_with_fence(
            &self.vulkan.device,
            self.vulkan.main_queue,
            &[submit],
            sync.in_flight,
        )?;

        if let (Some(swapchain), Some(wait)) = (&self.swapchain, render_finished) {
            if swapchain.present(self.vulkan.main_queue, self.image_index, wait)? {
                self.swapchain_dirty = true;
            }
        }

        self.frame_index = (self.frame_index + 1) % self.config.frames_in_flight;
        self.frame_counter += 1;
        Ok(())
    }

    /// Requests a swapchain rebuild at the next [`Device::new_frame`].
    pub fn resize(&mut self, width: u32, height: u32) {
        let extent = vk::Extent2D { width, height };
        if extent != self.requested_extent {
            self.requested_extent = extent;
            if self.swapchain.is_some() {
                self.swapchain_dirty = true;
            } else {
                self.headless_extent = extent;
            }
        }
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        if self.requested_extent.width == 0 || self.requested_extent.height == 0 {
            // Minimized; keep the old swapchain until there is something to draw to.
            return Ok(());
        }
        self.vulkan.wait_idle()?;
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.recreate(&self.vulkan, self.requested_extent, self.config.vsync)?;
            info!(
                "Swapchain recreated at {}x{}",
                swapchain.extent.width, swapchain.extent.height
            );
        }
        self.swapchain_dirty = false;
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.vulkan.wait_idle()
    }

    // Destruction

    fn retire(&mut self, object: Retired) {
        self.retired.push(self.frame_counter, object);
    }

    fn flush_retired(&mut self) {
        let released = self
            .retired
            .drain_completed(self.frame_counter, self.config.frames_in_flight);
        for object in released {
            self.destroy_now(object);
        }
    }

    fn destroy_now(&mut self, object: Retired) {
        let device = &self.vulkan.device;
        unsafe {
            match object {
                Retired::Buffer(mut buffer) => {
                    if buffer.mapped.is_some() {
                        self.allocator.unmap_memory(&mut buffer.allocation);
                    }
                    self.allocator
                        .destroy_buffer(buffer.raw, &mut buffer.allocation);
                    if let Some(index) = buffer.bindless_index {
                        self.bindless.release_buffer(index);
                    }
                }
                Retired::Texture(mut texture) => {
                    device.destroy_image_view(texture.view, None);
                    self.allocator
                        .destroy_image(texture.image, &mut texture.allocation);
                    if let Some(index) = texture.bindless_index {
                        self.bindless.release_texture(index);
                    }
                }
                Retired::Sampler(sampler) => device.destroy_sampler(sampler.raw, None),
                Retired::Pipeline(pipeline) => pipeline::destroy_pipeline(device, pipeline),
                Retired::DescriptorSet(set) => {
                    if let Err(e) = device.free_descriptor_sets(self.descriptor_pool, &[set.raw]) {
                        warn!("Failed to free descriptor set '{}': {e:?}", set.name);
                    }
                }
            }
        }
    }

    /// Destroys every remaining object. Called once the device is idle.
    fn destroy_all(&mut self) {
        let mut objects = self.retired.drain_all();
        self.descriptor_sets
            .drain_with(|set| objects.push(Retired::DescriptorSet(set)));
        self.pipelines
            .drain_with(|pipeline| objects.push(Retired::Pipeline(pipeline)));
        self.textures
            .drain_with(|texture| objects.push(Retired::Texture(texture)));
        self.buffers
            .drain_with(|buffer| objects.push(Retired::Buffer(buffer)));
        self.samplers
            .drain_with(|sampler| objects.push(Retired::Sampler(sampler)));
        for object in objects {
            self.destroy_now(object);
        }
    }
}

fn create_descriptor_pool(device: &ash::Device, max_sets: u32) -> Result<vk::DescriptorPool> {
    let sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: max_sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: max_sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: max_sets,
        },
    ];
    let info = vk::DescriptorPoolCreateInfo::default()
        .flags(
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
                | vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
        )
        .max_sets(max_sets)
        .pool_sizes(&sizes);
    unsafe { device.create_descriptor_pool(&info, None) }
        .map_err(|e| AshError::VulkanError(format!("Failed to create descriptor pool: {e:?}")))
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.vulkan.wait_idle() {
            warn!("Device wait failed during teardown: {e}");
        }
        self.destroy_all();
        unsafe {
            self.vulkan
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
        }
        info!("Device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::RetireQueue;

    #[test]
    fn object_retired_between_frames_outlives_the_frame_in_flight() {
        let frames_in_flight = 2;
        let mut queue = RetireQueue::new();

        // Frame 0 was submitted and still reads the buffer. The counter already
        // points at frame 1 when the buffer is retired.
        queue.push(1, "buffer");

        // Frame 1 starts on the other slot: frame 0 may still be executing.
        assert!(queue.drain_completed(1, frames_in_flight).is_empty());
        // Frame 2 waited on frame 0's slot, but frame 1 may use the buffer too.
        assert!(queue.drain_completed(2, frames_in_flight).is_empty());
        // Frame 3 waited on frame 1's slot.
        assert_eq!(queue.drain_completed(3, frames_in_flight), vec!["buffer"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn objects_are_released_in_retirement_order() {
        let mut queue = RetireQueue::new();
        queue.push(4, 'a');
        queue.push(4, 'b');
        queue.push(5, 'c');

        assert!(queue.drain_completed(6, 3).is_empty());
        assert_eq!(queue.drain_completed(7, 3), vec!['a', 'b']);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain_all(), vec!['c']);
        assert!(queue.drain_completed(100, 3).is_empty());
    }

    #[test]
    fn single_frame_in_flight_releases_after_the_next_wait() {
        let mut queue = RetireQueue::new();
        queue.push(0, 1u32);
        assert!(queue.drain_completed(0, 1).is_empty());
        assert_eq!(queue.drain_completed(1, 1), vec![1]);
    }
}
