use ash::vk;
use log::debug;
use std::sync::Arc;

use super::descriptor_layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
use crate::{AshError, Result};

pub const BINDLESS_TEXTURE_BINDING: u32 = 0;
pub const BINDLESS_BUFFER_BINDING: u32 = 1;

/// Free-list allocator for indices into one bindless array.
#[derive(Debug)]
pub struct BindlessSlots {
    capacity: u32,
    next: u32,
    free: Vec<u32>,
}

impl BindlessSlots {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: 0,
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        (self.next < self.capacity).then(|| {
            self.next += 1;
            self.next - 1
        })
    }

    pub fn free(&mut self, index: u32) {
        debug_assert!(index < self.next && !self.free.contains(&index));
        self.free.push(index);
    }

    pub fn in_use(&self) -> u32 {
        self.next - self.free.len() as u32
    }
}

/// The global bindless descriptor set (set 0 of every pipeline layout): an array of
/// combined image samplers and an array of storage buffers, both partially bound.
pub struct BindlessHeap {
    device: Arc<ash::Device>,
    layout: DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    textures: BindlessSlots,
    buffers: BindlessSlots,
}

impl BindlessHeap {
    pub fn new(device: Arc<ash::Device>, max_textures: u32, max_buffers: u32) -> Result<Self> {
        let stages = vk::ShaderStageFlags::ALL_GRAPHICS | vk::ShaderStageFlags::COMPUTE;
        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                BINDLESS_TEXTURE_BINDING,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                stages,
                max_textures,
            )
            .add_binding(
                BINDLESS_BUFFER_BINDING,
                vk::DescriptorType::STORAGE_BUFFER,
                stages,
                max_buffers,
            )
            .build(Arc::clone(&device))?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_textures,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_buffers,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
            AshError::VulkanError(format!("Failed to create bindless descriptor pool: {e:?}"))
        })?;

        let counts = [max_buffers];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .push_next(&mut variable_info);
        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(AshError::VulkanError(format!(
                    "Failed to allocate bindless descriptor set: {e:?}"
                )));
            }
        };

        debug!("Bindless heap created ({max_textures} textures, {max_buffers} buffers)");

        Ok(Self {
            device,
            layout,
            pool,
            set,
            textures: BindlessSlots::new(max_textures),
            buffers: BindlessSlots::new(max_buffers),
        })
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }

    pub fn add_sampled_image(&mut self, view: vk::ImageView, sampler: vk::Sampler) -> Result<u32> {
        let index = self
            .textures
            .allocate()
            .ok_or_else(|| AshError::VulkanError("Exceeded bindless texture capacity".into()))?;
        self.write_sampled_image(index, view, sampler);
        Ok(index)
    }

    /// Rewrites an existing texture slot, e.g. after a view was recreated on resize.
    pub fn write_sampled_image(&self, index: u32, view: vk::ImageView, sampler: vk::Sampler) {
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BINDLESS_TEXTURE_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn add_storage_buffer(&mut self, buffer: vk::Buffer, range: vk::DeviceSize) -> Result<u32> {
        let index = self
            .buffers
            .allocate()
            .ok_or_else(|| AshError::VulkanError("Exceeded bindless buffer capacity".into()))?;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BINDLESS_BUFFER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(index)
    }

    /// Returns a texture slot to the free list. The caller guarantees no in-flight
    /// frame still samples it.
    pub fn release_texture(&mut self, index: u32) {
        self.textures.free(index);
    }

    pub fn release_buffer(&mut self, index: u32) {
        self.buffers.free(index);
    }

    pub fn texture_count(&self) -> u32 {
        self.textures.in_use()
    }
}

impl Drop for BindlessHeap {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::BindlessSlots;

    #[test]
    fn slots_are_sequential_then_recycled() {
        let mut slots = BindlessSlots::new(3);
        assert_eq!(slots.allocate(), Some(0));
        assert_eq!(slots.allocate(), Some(1));
        slots.free(0);
        assert_eq!(slots.allocate(), Some(0));
        assert_eq!(slots.allocate(), Some(2));
        assert_eq!(slots.allocate(), None);
        assert_eq!(slots.in_use(), 3);
    }
}
