//! Surface providers decouple windowing from renderer initialization.
//!
//! The renderer only needs a `vk::SurfaceKHR` and the current extent; where
//! they come from (winit, another toolkit, nothing at all) is up to the caller.

use ash::{khr::surface, vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;

use crate::{AshError, Result};

/// Source of the presentation surface and its extent.
pub trait SurfaceProvider {
    /// Create a Vulkan surface using the provided entry and instance.
    ///
    /// # Safety
    /// `entry` and `instance` must be valid and outlive the returned surface.
    unsafe fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR>;

    /// Current extent (size) of the surface in pixels.
    fn extent(&self) -> vk::Extent2D;

    /// Instance extensions needed to create this kind of surface.
    fn required_extensions(&self) -> Vec<*const c_char> {
        let mut extensions = vec![surface::NAME.as_ptr()];

        #[cfg(target_os = "windows")]
        extensions.push(ash::khr::win32_surface::NAME.as_ptr());

        #[cfg(target_os = "linux")]
        {
            extensions.push(ash::khr::xlib_surface::NAME.as_ptr());
            extensions.push(ash::khr::wayland_surface::NAME.as_ptr());
        }

        extensions
    }
}

/// Surface provider over anything exposing raw window/display handles (e.g. a winit window).
pub struct WindowSurfaceProvider<W> {
    window: W,
    extent: vk::Extent2D,
}

impl<W> WindowSurfaceProvider<W> {
    pub fn new(window: W, width: u32, height: u32) -> Self {
        Self {
            window,
            extent: vk::Extent2D { width, height },
        }
    }

    pub fn set_extent(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
    }

    pub fn window(&self) -> &W {
        &self.window
    }
}

impl<'a> WindowSurfaceProvider<&'a winit::window::Window> {
    pub fn from_winit(window: &'a winit::window::Window) -> Self {
        let size = window.inner_size();
        Self::new(window, size.width, size.height)
    }
}

impl<W: HasWindowHandle + HasDisplayHandle> SurfaceProvider for WindowSurfaceProvider<W> {
    unsafe fn create_surface(&self, entry: &Entry, instance: &Instance) -> Result<vk::SurfaceKHR> {
        let window_handle = self
            .window
            .window_handle()
            .map_err(|e| AshError::DeviceInitFailed(format!("No window handle: {e:?}")))?
            .as_raw();
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| AshError::DeviceInitFailed(format!("No display handle: {e:?}")))?
            .as_raw();

        create_platform_surface(entry, instance, window_handle, display_handle)
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Provider for offscreen operation: no surface, no swapchain, no present.
pub struct HeadlessSurfaceProvider {
    extent: vk::Extent2D,
}

impl HeadlessSurfaceProvider {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
        }
    }
}

impl SurfaceProvider for HeadlessSurfaceProvider {
    unsafe fn create_surface(
        &self,
        _entry: &Entry,
        _instance: &Instance,
    ) -> Result<vk::SurfaceKHR> {
        Ok(vk::SurfaceKHR::null())
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn required_extensions(&self) -> Vec<*const c_char> {
        Vec::new()
    }
}

#[allow(unused_variables)]
unsafe fn create_platform_surface(
    entry: &Entry,
    instance: &Instance,
    window: RawWindowHandle,
    display: RawDisplayHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (window, display) {
        #[cfg(target_os = "windows")]
        (RawWindowHandle::Win32(handle), _) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0);
            let create_info = vk::Win32SurfaceCreateInfoKHR::default()
                .hwnd(handle.hwnd.get() as vk::HWND)
                .hinstance(hinstance as vk::HINSTANCE);
            ash::khr::win32_surface::Instance::new(entry, instance)
                .create_win32_surface(&create_info, None)
        }
        #[cfg(target_os = "linux")]
        (RawWindowHandle::Wayland(handle), RawDisplayHandle::Wayland(display)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            ash::khr::wayland_surface::Instance::new(entry, instance)
                .create_wayland_surface(&create_info, None)
        }
        #[cfg(target_os = "linux")]
        (RawWindowHandle::Xlib(handle), RawDisplayHandle::Xlib(display)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(dpy as *mut _)
                .window(handle.window);
            ash::khr::xlib_surface::Instance::new(entry, instance)
                .create_xlib_surface(&create_info, None)
        }
        _ => {
            return Err(AshError::DeviceInitFailed(
                "Unsupported window/display handle combination".to_string(),
            ))
        }
    };

    surface.map_err(|e| AshError::VulkanError(format!("Failed to create surface: {e:?}")))
}
