use ash::vk;
use std::sync::Arc;

use crate::{AshError, Result};

/// RAII wrapper for a descriptor set layout; array bindings get bindless flags.
pub struct DescriptorSetLayout {
    device: Arc<ash::Device>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayout {
    pub fn new(
        device: Arc<ash::Device>,
        bindings: &[vk::DescriptorSetLayoutBinding<'static>],
    ) -> Result<Self> {
        let binding_flags = bindless_flags(bindings);
        let update_after_bind = binding_flags
            .iter()
            .any(|flags| flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(bindings)
            .push_next(&mut flags_info);
        if update_after_bind {
            create_info =
                create_info.flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL);
        }

        let layout = unsafe {
            device
                .create_descriptor_set_layout(&create_info, None)
                .map_err(|e| {
                    AshError::VulkanError(format!("Failed to create descriptor set layout: {e}"))
                })?
        };

        Ok(Self {
            device,
            layout,
            bindings: bindings.to_vec(),
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// Descriptor count of the trailing variable-sized binding, if any.
    pub fn variable_count(&self) -> Option<u32> {
        self.bindings
            .iter()
            .max_by_key(|binding| binding.binding)
            .filter(|binding| binding.descriptor_count > 1)
            .map(|binding| binding.descriptor_count)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Array bindings are partially bound and update-after-bind; the highest-numbered
/// array binding additionally gets a variable descriptor count.
fn bindless_flags(bindings: &[vk::DescriptorSetLayoutBinding]) -> Vec<vk::DescriptorBindingFlags> {
    let last_binding = bindings.iter().map(|b| b.binding).max();
    bindings
        .iter()
        .map(|binding| {
            if binding.descriptor_count > 1 {
                let mut flags = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                    | vk::DescriptorBindingFlags::PARTIALLY_BOUND;
                if Some(binding.binding) == last_binding {
                    flags |= vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
                }
                flags
            } else {
                vk::DescriptorBindingFlags::empty()
            }
        })
        .collect()
}

#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    pub fn build(self, device: Arc<ash::Device>) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(device, &self.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_last_array_binding_is_variable() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::ALL,
                1024,
            )
            .add_binding(
                1,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::ALL,
                256,
            );
        let flags = bindless_flags(builder.bindings());
        assert!(!flags[0].contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT));
        assert!(flags[0].contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND));
        assert!(flags[1].contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT));
    }

    #[test]
    fn single_bindings_stay_plain() {
        let builder = DescriptorSetLayoutBuilder::new().add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX,
            1,
        );
        assert_eq!(
            bindless_flags(builder.bindings()),
            vec![vk::DescriptorBindingFlags::empty()]
        );
    }
}
