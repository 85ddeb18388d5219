use ash::{ext::debug_utils, khr::swapchain, vk};
use log::{info, warn};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::instance::VulkanInstance;
use crate::{AshError, Result};

/// Hardware queue roles used by the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics + present; everything the frame loop records.
    Main,
    Compute,
    Transfer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub main: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Picks the main family (graphics, and present when a surface exists), then
    /// prefers dedicated compute and transfer families, falling back to the main one.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Option<Self> {
        let has = |props: &vk::QueueFamilyProperties, flags| {
            props.queue_count > 0 && props.queue_flags.contains(flags)
        };

        let main = families.iter().enumerate().find_map(|(index, props)| {
            (has(props, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && supports_present(index as u32))
            .then_some(index as u32)
        })?;

        let compute = families
            .iter()
            .enumerate()
            .find_map(|(index, props)| {
                (has(props, vk::QueueFlags::COMPUTE)
                    && !props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .then_some(index as u32)
            })
            .unwrap_or(main);

        let transfer = families
            .iter()
            .enumerate()
            .find_map(|(index, props)| {
                (has(props, vk::QueueFlags::TRANSFER)
                    && !props
                        .queue_flags
                        .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
                .then_some(index as u32)
            })
            .unwrap_or(compute);

        Some(Self {
            main,
            compute,
            transfer,
        })
    }

    pub fn family(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Main => self.main,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }

    fn unique(&self) -> BTreeSet<u32> {
        [self.main, self.compute, self.transfer].into_iter().collect()
    }
}

/// Physical + logical device with the main, compute, and transfer queues.
pub struct VulkanDevice {
    pub instance: Arc<VulkanInstance>,
    pub physical_device: vk::PhysicalDevice,
    pub device: Arc<ash::Device>,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub families: QueueFamilies,
    pub main_queue: vk::Queue,
    pub compute_queue: vk::Queue,
    pub transfer_queue: vk::Queue,
    pub swapchain_loader: Option<swapchain::Device>,
    debug_utils: Option<debug_utils::Device>,
}

impl VulkanDevice {
    pub fn new(instance: Arc<VulkanInstance>) -> Result<Self> {
        unsafe {
            let raw_instance = instance.instance();
            let physical_devices = raw_instance.enumerate_physical_devices().map_err(|e| {
                AshError::DeviceInitFailed(format!("Failed to enumerate physical devices: {e:?}"))
            })?;

            let (physical_device, families) = physical_devices
                .iter()
                .filter_map(|&pd| Self::rate_device(&instance, pd).map(|f| (pd, f)))
                .max_by_key(|(pd, _)| {
                    let props = raw_instance.get_physical_device_properties(*pd);
                    match props.device_type {
                        vk::PhysicalDeviceType::DISCRETE_GPU => 2,
                        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                        _ => 0,
                    }
                })
                .ok_or_else(|| {
                    AshError::DeviceInitFailed(
                        "No Vulkan 1.3 device with the required queues found".into(),
                    )
                })?;

            let properties = raw_instance.get_physical_device_properties(physical_device);
            let memory_properties =
                raw_instance.get_physical_device_memory_properties(physical_device);
            let device_name = CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy();
            info!("Selected GPU: {device_name} (queue families {families:?})");

            let priorities = [1.0f32];
            let queue_infos: Vec<_> = families
                .unique()
                .into_iter()
                .map(|family| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family)
                        .queue_priorities(&priorities)
                })
                .collect();

            let mut extensions: Vec<*const c_char> = Vec::new();
            if !instance.is_headless() {
                extensions.push(swapchain::NAME.as_ptr());
            }

            let features = vk::PhysicalDeviceFeatures::default()
                .multi_draw_indirect(true)
                .sampler_anisotropy(true)
                .depth_clamp(true)
                .depth_bias_clamp(true)
                .fill_mode_non_solid(true);
            let mut features11 =
                vk::PhysicalDeviceVulkan11Features::default().shader_draw_parameters(true);
            let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
                .draw_indirect_count(true)
                .descriptor_indexing(true)
                .runtime_descriptor_array(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_variable_descriptor_count(true)
                .descriptor_binding_sampled_image_update_after_bind(true)
                .descriptor_binding_storage_buffer_update_after_bind(true)
                .descriptor_binding_update_unused_while_pending(true)
                .shader_sampled_image_array_non_uniform_indexing(true)
                .shader_storage_buffer_array_non_uniform_indexing(true)
                .scalar_block_layout(true);
            let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
                .dynamic_rendering(true)
                .synchronization2(true);

            let create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&extensions)
                .enabled_features(&features)
                .push_next(&mut features11)
                .push_next(&mut features12)
                .push_next(&mut features13);

            let device = raw_instance
                .create_device(physical_device, &create_info, None)
                .map_err(|e| {
                    AshError::DeviceInitFailed(format!("Failed to create logical device: {e:?}"))
                })?;

            let main_queue = device.get_device_queue(families.main, 0);
            let compute_queue = device.get_device_queue(families.compute, 0);
            let transfer_queue = device.get_device_queue(families.transfer, 0);

            let swapchain_loader = (!instance.is_headless())
                .then(|| swapchain::Device::new(raw_instance, &device));
            let debug_utils = instance
                .validation_enabled()
                .then(|| debug_utils::Device::new(raw_instance, &device));

            Ok(Self {
                instance,
                physical_device,
                device: Arc::new(device),
                properties,
                memory_properties,
                families,
                main_queue,
                compute_queue,
                transfer_queue,
                swapchain_loader,
                debug_utils,
            })
        }
    }

    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Main => self.main_queue,
            QueueKind::Compute => self.compute_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }

    /// True when uploads have to hand ownership across queue families.
    pub fn has_dedicated_transfer(&self) -> bool {
        self.families.transfer != self.families.main
    }

    /// Attach a debug name to a Vulkan object; a no-op without validation.
    pub fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(utils) = self.debug_utils.as_ref() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { utils.set_debug_utils_object_name(&info) } {
            warn!("Failed to name object {name:?}: {e:?}");
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| {
            AshError::VulkanError(format!("device_wait_idle failed: {e:?}"))
        })
    }

    unsafe fn rate_device(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
    ) -> Option<QueueFamilies> {
        let raw = instance.instance();
        let props = raw.get_physical_device_properties(physical_device);
        if props.api_version < vk::API_VERSION_1_3 {
            return None;
        }

        let families = raw.get_physical_device_queue_family_properties(physical_device);
        QueueFamilies::select(&families, |index| {
            instance.is_headless()
                || instance
                    .surface_loader()
                    .get_physical_device_surface_support(
                        physical_device,
                        index,
                        instance.surface(),
                    )
                    .unwrap_or(false)
        })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_dedicated_compute_and_transfer() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selected = QueueFamilies::select(&families, |_| true).unwrap();
        assert_eq!(
            selected,
            QueueFamilies {
                main: 0,
                compute: 1,
                transfer: 2
            }
        );
    }

    #[test]
    fn falls_back_to_main_family() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let selected = QueueFamilies::select(&families, |_| true).unwrap();
        assert_eq!(selected.compute, 0);
        assert_eq!(selected.transfer, 0);
        assert_eq!(selected.unique().len(), 1);
    }

    #[test]
    fn main_family_must_support_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let selected = QueueFamilies::select(&families, |index| index == 1).unwrap();
        assert_eq!(selected.main, 1);

        assert!(QueueFamilies::select(&families, |_| false).is_none());
    }
}
