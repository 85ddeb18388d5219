use ash::{khr::swapchain, vk};
use log::{debug, info};
use std::sync::Arc;

use super::device::VulkanDevice;
use crate::{AshError, Result};

/// Swapchain plus its images, views and one present-wait semaphore per image.
pub struct SwapchainWrapper {
    device: Arc<ash::Device>,
    loader: swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    /// Signaled by the frame that rendered into image `i`, waited on by its present.
    render_finished: Vec<vk::Semaphore>,
}

impl SwapchainWrapper {
    pub fn new(device: &VulkanDevice, requested: vk::Extent2D, vsync: bool) -> Result<Self> {
        let loader = device
            .swapchain_loader
            .clone()
            .ok_or_else(|| AshError::VulkanError("Swapchain requested in headless mode".into()))?;

        let mut wrapper = Self {
            device: Arc::clone(&device.device),
            loader,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent: requested,
            images: Vec::new(),
            image_views: Vec::new(),
            render_finished: Vec::new(),
        };
        wrapper.create(device, requested, vsync)?;
        Ok(wrapper)
    }

    /// Rebuilds the swapchain for a new extent. The caller must make sure no frame
    /// still references the old images.
    pub fn recreate(
        &mut self,
        device: &VulkanDevice,
        requested: vk::Extent2D,
        vsync: bool,
    ) -> Result<()> {
        self.destroy_image_resources();
        self.create(device, requested, vsync)
    }

    fn create(&mut self, device: &VulkanDevice, requested: vk::Extent2D, vsync: bool) -> Result<()> {
        let instance = &device.instance;
        let surface = instance.surface();
        let surface_loader = instance.surface_loader();

        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(device.physical_device, surface)?,
                surface_loader.get_physical_device_surface_formats(device.physical_device, surface)?,
                surface_loader
                    .get_physical_device_surface_present_modes(device.physical_device, surface)?,
            )
        };

        let surface_format = formats
            .iter()
            .copied()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first().copied())
            .ok_or_else(|| AshError::VulkanError("Surface reports no formats".into()))?;

        let present_mode = if !vsync && present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = choose_extent(&capabilities, requested);
        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|e| AshError::VulkanError(format!("Failed to create swapchain: {e:?}")))?;
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }

        let images = unsafe { self.loader.get_swapchain_images(swapchain)? };
        let image_views = images
            .iter()
            .map(|&image| {
                let info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(super::barrier::color_range(1, 1));
                unsafe { self.device.create_image_view(&info, None) }.map_err(AshError::from)
            })
            .collect::<Result<Vec<_>>>()?;
        let render_finished = images
            .iter()
            .map(|_| {
                unsafe {
                    self.device
                        .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                }
                .map_err(AshError::from)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Swapchain ready: {}x{} {:?} {:?} ({} images)",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        self.swapchain = swapchain;
        self.format = surface_format.format;
        self.extent = extent;
        self.images = images;
        self.image_views = image_views;
        self.render_finished = render_finished;
        Ok(())
    }

    /// Semaphore the frame rendering into `image_index` signals for its present.
    pub fn render_finished(&self, image_index: u32) -> Result<vk::Semaphore> {
        semaphore_for_image(&self.render_finished, image_index)
    }

    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
                .map_err(AshError::from)
        }
    }

    /// Returns `true` when the swapchain should be recreated.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let waits = [wait];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { self.loader.queue_present(queue, &info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(AshError::VulkanError(format!("Present failed: {e:?}"))),
        }
    }

    fn destroy_image_resources(&mut self) {
        for view in self.image_views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        for semaphore in self.render_finished.drain(..) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
        self.images.clear();
    }
}

impl Drop for SwapchainWrapper {
    fn drop(&mut self) {
        debug!("Destroying swapchain");
        self.destroy_image_resources();
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
    }
}

fn semaphore_for_image(semaphores: &[vk::Semaphore], image_index: u32) -> Result<vk::Semaphore> {
    semaphores.get(image_index as usize).copied().ok_or_else(|| {
        AshError::VulkanError(format!(
            "Swapchain image {image_index} out of range ({} images)",
            semaphores.len()
        ))
    })
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn each_image_presents_with_its_own_semaphore() {
        let semaphores: Vec<_> = (1..=3).map(vk::Semaphore::from_raw).collect();
        // Three images cycling under two frame slots: slot reuse never picks
        // another image's semaphore.
        for (frame, image) in [0u32, 1, 2, 0, 1].into_iter().enumerate() {
            let semaphore = semaphore_for_image(&semaphores, image).unwrap();
            assert_eq!(semaphore.as_raw(), u64::from(image) + 1, "frame {frame}");
        }
        assert!(semaphore_for_image(&semaphores, 3).is_err());
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!((extent.width, extent.height), (640, 480));
    }

    #[test]
    fn requested_extent_is_clamped() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 4096,
                height: 8,
            },
        );
        assert_eq!((extent.width, extent.height), (1024, 16));
    }
}
