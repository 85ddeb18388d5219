//! GPU object wrappers and the creation-info value objects that describe them.
//!
//! Objects are owned by their pool slot in [`super::device::Device`] and
//! referenced everywhere else through [`Handle`]s.

use ash::vk;
use std::ptr::NonNull;

use super::resource_pool::Handle;
use crate::vulkan::{DescriptorBindingTable, DescriptorSetLayout, ShaderBlob};

/// Creation info for [`Buffer`].
#[derive(Clone, Debug)]
pub struct BufferCI {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Persistently map host-visible, host-coherent memory.
    pub mapped: bool,
    /// Queued for asynchronous upload after creation; never copied synchronously.
    pub initial_data: Option<Vec<u8>>,
    /// Register the buffer in the bindless storage-buffer array.
    pub bindless: bool,
    pub debug_name: String,
}

impl BufferCI {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            mapped: false,
            initial_data: None,
            bindless: false,
            debug_name: String::new(),
        }
    }

    pub fn mapped(mut self) -> Self {
        self.mapped = true;
        self
    }

    pub fn bindless(mut self) -> Self {
        self.bindless = true;
        self
    }

    pub fn initial_data(mut self, data: Vec<u8>) -> Self {
        self.usage |= vk::BufferUsageFlags::TRANSFER_DST;
        self.initial_data = Some(data);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }
}

pub struct Buffer {
    pub raw: vk::Buffer,
    pub(crate) allocation: vk_mem::Allocation,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub(crate) mapped: Option<NonNull<u8>>,
    pub bindless_index: Option<u32>,
    /// False while an initial-data upload has not been acquired by the main queue.
    pub resident: bool,
    pub name: String,
}

impl Buffer {
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Bindless index, or 0 (which shaders treat as "absent") when unregistered.
    pub fn shader_index(&self) -> u32 {
        self.bindless_index.unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextureKind {
    #[default]
    D2,
    /// Six array layers viewed as a cube.
    Cube,
}

impl TextureKind {
    pub fn layers(self) -> u32 {
        match self {
            TextureKind::D2 => 1,
            TextureKind::Cube => 6,
        }
    }
}

/// Creation info for [`Texture`]. Pixel contents are populated by the transfer loader.
#[derive(Clone, Debug)]
pub struct TextureCI {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub kind: TextureKind,
    /// 0 requests a full mip chain.
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    /// Sampler paired with the texture in the bindless array; `None` uses the default.
    pub sampler: Option<Handle<Sampler>>,
    pub debug_name: String,
}

impl TextureCI {
    pub fn new(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            kind: TextureKind::D2,
            mip_levels: 1,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            sampler: None,
            debug_name: String::new(),
        }
    }

    pub fn cube(mut self) -> Self {
        self.kind = TextureKind::Cube;
        self
    }

    pub fn full_mip_chain(mut self) -> Self {
        self.mip_levels = 0;
        self.usage |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn sampler(mut self, sampler: Handle<Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }

    pub fn resolved_mip_levels(&self) -> u32 {
        if self.mip_levels == 0 {
            mip_count(self.width, self.height)
        } else {
            self.mip_levels
        }
    }
}

pub fn mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub(crate) allocation: vk_mem::Allocation,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub kind: TextureKind,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    pub bindless_index: Option<u32>,
    pub sampler: Handle<Sampler>,
    /// Content textures sample the default texel through their bindless slot
    /// until their pixels have been uploaded and acquired.
    pub resident: bool,
    pub name: String,
}

impl Texture {
    /// Sampled texture that receives its pixels by transfer rather than rendering.
    pub fn is_content(&self) -> bool {
        self.usage.contains(vk::ImageUsageFlags::TRANSFER_DST)
            && !self.usage.intersects(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            )
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        if is_depth_format(self.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.kind.layers(),
        }
    }

    pub fn shader_index(&self) -> u32 {
        self.bindless_index.unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct SamplerCI {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_lod: f32,
    pub max_anisotropy: Option<f32>,
    /// Enables depth comparison (shadow sampling).
    pub compare_op: Option<vk::CompareOp>,
    pub debug_name: String,
}

impl Default for SamplerCI {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_lod: vk::LOD_CLAMP_NONE,
            max_anisotropy: Some(8.0),
            compare_op: None,
            debug_name: String::new(),
        }
    }
}

pub struct Sampler {
    pub raw: vk::Sampler,
    pub name: String,
}

#[derive(Clone, Copy, Debug)]
pub struct VertexStream {
    pub binding: u32,
    pub location: u32,
    pub format: vk::Format,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct DepthBias {
    pub constant: f32,
    pub slope: f32,
    pub clamp: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct RasterState {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_bias: Option<DepthBias>,
    pub depth_clamp: bool,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_bias: None,
            depth_clamp: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

/// Creation info for [`Pipeline`]. A single compute stage yields a compute pipeline.
#[derive(Clone, Debug)]
pub struct PipelineCI {
    pub stages: Vec<ShaderBlob>,
    /// Binding table from the shader front-end; set 0 is always the bindless heap.
    pub reflection: DescriptorBindingTable,
    pub vertex_streams: Vec<VertexStream>,
    pub topology: vk::PrimitiveTopology,
    pub raster: RasterState,
    pub depth: DepthState,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub push_constant_size: u32,
    pub debug_name: String,
}

impl PipelineCI {
    pub fn new(stages: Vec<ShaderBlob>) -> Self {
        Self {
            stages,
            reflection: DescriptorBindingTable::new(),
            vertex_streams: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            raster: RasterState::default(),
            depth: DepthState::default(),
            color_formats: Vec::new(),
            depth_format: None,
            push_constant_size: std::mem::size_of::<super::passes::PushConstants>() as u32,
            debug_name: String::new(),
        }
    }

    pub fn is_compute(&self) -> bool {
        self.stages.len() == 1 && self.stages[0].stage == vk::ShaderStageFlags::COMPUTE
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }
}

pub struct Pipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    /// Layouts for reflected sets above 0; set 0 belongs to the bindless heap.
    pub(crate) set_layouts: Vec<DescriptorSetLayout>,
    pub name: String,
}

/// Creation info for [`DescriptorSet`]: the bindings of one set.
#[derive(Clone, Debug, Default)]
pub struct DescriptorSetCI {
    pub bindings: DescriptorBindingTable,
    pub set: u32,
    pub debug_name: String,
}

pub struct DescriptorSet {
    pub raw: vk::DescriptorSet,
    pub(crate) layout: DescriptorSetLayout,
    pub name: String,
}

impl DescriptorSet {
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_chain_counts_levels() {
        assert_eq!(mip_count(1, 1), 1);
        assert_eq!(mip_count(256, 256), 9);
        assert_eq!(mip_count(300, 20), 9);
        let ci = TextureCI::new(1024, 512, vk::Format::R8G8B8A8_UNORM).full_mip_chain();
        assert_eq!(ci.resolved_mip_levels(), 11);
        assert!(ci.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn initial_data_implies_transfer_dst() {
        let ci = BufferCI::new(16, vk::BufferUsageFlags::VERTEX_BUFFER).initial_data(vec![0; 16]);
        assert!(ci.usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!ci.mapped);
    }

    #[test]
    fn cube_textures_have_six_layers() {
        assert_eq!(TextureKind::Cube.layers(), 6);
        assert_eq!(TextureKind::D2.layers(), 1);
    }
}
