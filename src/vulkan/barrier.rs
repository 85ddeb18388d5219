//! Barrier builders (synchronization2).
//!
//! Queue ownership transfers are expressed as a release/acquire pair with
//! identical family indices and layouts. When both families are the same the
//! pair degrades to plain memory barriers with `QUEUE_FAMILY_IGNORED`.

use ash::vk;

/// Source and destination queue families of an ownership transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueTransfer {
    pub src_family: u32,
    pub dst_family: u32,
}

impl QueueTransfer {
    pub fn new(src_family: u32, dst_family: u32) -> Self {
        Self {
            src_family,
            dst_family,
        }
    }

    pub fn crosses_families(&self) -> bool {
        self.src_family != self.dst_family
    }

    fn indices(&self) -> (u32, u32) {
        if self.crosses_families() {
            (self.src_family, self.dst_family)
        } else {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        }
    }
}

/// Stage/access pair describing how a layout is used.
pub fn layout_scope(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        ),
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

pub fn color_range(mip_levels: u32, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count: layers,
    }
}

pub fn depth_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::DEPTH,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Same-queue layout transition with stages derived from the layouts.
pub fn image_transition(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access) = layout_scope(old_layout);
    let (dst_stage, dst_access) = layout_scope(new_layout);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

/// Release half of a buffer ownership transfer, recorded on the source queue.
pub fn buffer_release(
    buffer: vk::Buffer,
    transfer: QueueTransfer,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
) -> vk::BufferMemoryBarrier2<'static> {
    let (src_family, dst_family) = transfer.indices();
    let barrier = vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .src_queue_family_index(src_family)
        .dst_queue_family_index(dst_family)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);
    if transfer.crosses_families() {
        barrier
    } else {
        // Without a family change this is the only barrier, so it carries the full dependency.
        barrier
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ)
    }
}

/// Acquire half of a buffer ownership transfer, recorded on the destination queue.
pub fn buffer_acquire(
    buffer: vk::Buffer,
    transfer: QueueTransfer,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
) -> vk::BufferMemoryBarrier2<'static> {
    let (src_family, dst_family) = transfer.indices();
    vk::BufferMemoryBarrier2::default()
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .src_queue_family_index(src_family)
        .dst_queue_family_index(dst_family)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Release half of an image ownership transfer including its layout change.
pub fn image_release(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    transfer: QueueTransfer,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_family, dst_family) = transfer.indices();
    let (src_stage, src_access) = layout_scope(old_layout);
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(src_family)
        .dst_queue_family_index(dst_family)
        .image(image)
        .subresource_range(range);
    if transfer.crosses_families() {
        barrier
    } else {
        let (dst_stage, dst_access) = layout_scope(new_layout);
        barrier.dst_stage_mask(dst_stage).dst_access_mask(dst_access)
    }
}

/// Acquire half matching [`image_release`]; layouts must be identical on both halves.
pub fn image_acquire(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    transfer: QueueTransfer,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_family, dst_family) = transfer.indices();
    let (dst_stage, dst_access) = layout_scope(new_layout);
    vk::ImageMemoryBarrier2::default()
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(src_family)
        .dst_queue_family_index(dst_family)
        .image(image)
        .subresource_range(range)
}

/// Records the given barriers in a single `vkCmdPipelineBarrier2`.
pub fn record(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffers: &[vk::BufferMemoryBarrier2],
    images: &[vk::ImageMemoryBarrier2],
) {
    if buffers.is_empty() && images.is_empty() {
        return;
    }
    let dependency = vk::DependencyInfo::default()
        .buffer_memory_barriers(buffers)
        .image_memory_barriers(images);
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_family_pair_carries_matching_indices() {
        let transfer = QueueTransfer::new(2, 0);
        let release = buffer_release(
            vk::Buffer::null(),
            transfer,
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        let acquire = buffer_acquire(
            vk::Buffer::null(),
            transfer,
            vk::PipelineStageFlags2::VERTEX_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        );
        assert_eq!(release.src_queue_family_index, 2);
        assert_eq!(release.dst_queue_family_index, 0);
        assert_eq!(acquire.src_queue_family_index, 2);
        assert_eq!(acquire.dst_queue_family_index, 0);
        // Release leaves the destination scope empty, acquire leaves the source scope empty.
        assert_eq!(release.dst_stage_mask, vk::PipelineStageFlags2::NONE);
        assert_eq!(acquire.src_stage_mask, vk::PipelineStageFlags2::NONE);
    }

    #[test]
    fn same_family_degrades_to_memory_barrier() {
        let transfer = QueueTransfer::new(0, 0);
        assert!(!transfer.crosses_families());
        let release = buffer_release(
            vk::Buffer::null(),
            transfer,
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        assert_eq!(release.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(release.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_ne!(release.dst_stage_mask, vk::PipelineStageFlags2::NONE);
    }

    #[test]
    fn image_halves_agree_on_layouts() {
        let transfer = QueueTransfer::new(1, 0);
        let range = color_range(4, 6);
        let release = image_release(
            vk::Image::null(),
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            transfer,
        );
        let acquire = image_acquire(
            vk::Image::null(),
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            transfer,
        );
        assert_eq!(release.old_layout, acquire.old_layout);
        assert_eq!(release.new_layout, acquire.new_layout);
        assert_eq!(release.subresource_range.layer_count, 6);
        assert_eq!(acquire.subresource_range.level_count, 4);
        assert_eq!(
            acquire.dst_access_mask,
            vk::AccessFlags2::SHADER_SAMPLED_READ
        );
    }

    #[test]
    fn transition_scopes_follow_layouts() {
        let barrier = image_transition(
            vk::Image::null(),
            depth_range(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert!(barrier
            .dst_access_mask
            .contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }
}
