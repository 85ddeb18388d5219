//! Compiled shader blobs and the descriptor-binding tables reflected from them.
//!
//! Compilation happens upstream; this module only validates SPIR-V, creates
//! modules, and merges per-stage binding tables into per-set layouts.

use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::Cursor;
use std::sync::Arc;

use crate::{AshError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// One binding as reported by reflection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    /// 0 marks a runtime-sized (bindless) array.
    pub count: u32,
}

/// set -> bindings, as consumed by layout creation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorBindingTable {
    sets: BTreeMap<u32, Vec<ReflectedBinding>>,
}

impl DescriptorBindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, set: u32, binding: ReflectedBinding) -> Self {
        self.insert(set, binding);
        self
    }

    /// Adds a binding, OR-ing stage masks when the same (set, binding) appears
    /// in several stages.
    pub fn insert(&mut self, set: u32, binding: ReflectedBinding) {
        let bindings = self.sets.entry(set).or_default();
        match bindings.iter_mut().find(|b| b.binding == binding.binding) {
            Some(existing) => {
                existing.stages |= binding.stages;
                existing.count = existing.count.max(binding.count);
            }
            None => {
                bindings.push(binding);
                bindings.sort_by_key(|b| b.binding);
            }
        }
    }

    pub fn merge(&mut self, other: &DescriptorBindingTable) {
        for (&set, bindings) in &other.sets {
            for binding in bindings {
                self.insert(set, *binding);
            }
        }
    }

    pub fn sets(&self) -> impl Iterator<Item = (u32, &[ReflectedBinding])> {
        self.sets.iter().map(|(set, bindings)| (*set, bindings.as_slice()))
    }

    pub fn highest_set(&self) -> Option<u32> {
        self.sets.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Validated SPIR-V words for one stage plus its entry point.
#[derive(Clone, Debug)]
pub struct ShaderBlob {
    pub stage: vk::ShaderStageFlags,
    pub entry_point: CString,
    words: Vec<u32>,
}

impl ShaderBlob {
    pub fn from_bytes(stage: vk::ShaderStageFlags, entry_point: &str, bytes: &[u8]) -> Result<Self> {
        let words = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| AshError::ShaderError(format!("Invalid SPIR-V blob: {e}")))?;
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(AshError::ShaderError(format!(
                "SPIR-V magic mismatch ({:#010x})",
                words.first().copied().unwrap_or(0)
            )));
        }
        let entry_point = CString::new(entry_point)
            .map_err(|_| AshError::ShaderError("Entry point contains NUL".into()))?;
        Ok(Self {
            stage,
            entry_point,
            words,
        })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Reflects the blob's descriptor bindings.
    #[cfg(feature = "shader_reflection")]
    pub fn reflect(&self) -> Result<DescriptorBindingTable> {
        let bytes: &[u8] = bytemuck::cast_slice(&self.words);
        let module = spirv_reflect::ShaderModule::load_u8_data(bytes)
            .map_err(|e| AshError::ShaderError(format!("Reflection failed: {e}")))?;
        let stages = vk::ShaderStageFlags::from_raw(module.get_shader_stage().bits());
        let sets = module
            .enumerate_descriptor_sets(None)
            .map_err(|e| AshError::ShaderError(format!("Reflection failed: {e}")))?;

        let mut table = DescriptorBindingTable::new();
        for set in sets {
            for binding in set.bindings {
                table.insert(
                    set.set,
                    ReflectedBinding {
                        binding: binding.binding,
                        descriptor_type: reflect_descriptor_type(binding.descriptor_type)?,
                        stages,
                        count: binding.count,
                    },
                );
            }
        }
        Ok(table)
    }
}

#[cfg(feature = "shader_reflection")]
fn reflect_descriptor_type(
    ty: spirv_reflect::types::ReflectDescriptorType,
) -> Result<vk::DescriptorType> {
    use spirv_reflect::types::ReflectDescriptorType as R;
    Ok(match ty {
        R::Sampler => vk::DescriptorType::SAMPLER,
        R::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        R::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        R::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        R::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        R::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        R::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        R::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        R::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        R::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        R::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        other => {
            return Err(AshError::ShaderError(format!(
                "Unsupported descriptor type {other:?}"
            )))
        }
    })
}

/// RAII shader module.
pub struct ShaderModule {
    device: Arc<ash::Device>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    pub fn new(device: Arc<ash::Device>, blob: &ShaderBlob) -> Result<Self> {
        let info = vk::ShaderModuleCreateInfo::default().code(blob.words());
        let module = unsafe { device.create_shader_module(&info, None) }
            .map_err(|e| AshError::ShaderError(format!("Failed to create shader module: {e:?}")))?;
        Ok(Self { device, module })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spirv() -> Vec<u8> {
        // Header only: magic, version 1.0, generator, bound, schema.
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    #[test]
    fn accepts_valid_header() {
        let blob =
            ShaderBlob::from_bytes(vk::ShaderStageFlags::VERTEX, "main", &minimal_spirv()).unwrap();
        assert_eq!(blob.words().len(), 5);
        assert_eq!(blob.entry_point.to_str().unwrap(), "main");
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut bytes = minimal_spirv();
        bytes[0] = 0;
        assert!(ShaderBlob::from_bytes(vk::ShaderStageFlags::VERTEX, "main", &bytes).is_err());

        let bytes = minimal_spirv();
        assert!(ShaderBlob::from_bytes(vk::ShaderStageFlags::VERTEX, "main", &bytes[..7]).is_err());
    }

    #[test]
    fn merging_ors_stage_masks() {
        let binding = |stages| ReflectedBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            stages,
            count: 1,
        };
        let mut table = DescriptorBindingTable::new().with_binding(1, binding(vk::ShaderStageFlags::VERTEX));
        let fragment = DescriptorBindingTable::new()
            .with_binding(1, binding(vk::ShaderStageFlags::FRAGMENT))
            .with_binding(
                2,
                ReflectedBinding {
                    binding: 3,
                    descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                    count: 1,
                },
            );
        table.merge(&fragment);

        let sets: Vec<_> = table.sets().collect();
        assert_eq!(sets.len(), 2);
        assert_eq!(
            sets[0].1[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(table.highest_set(), Some(2));
    }
}
