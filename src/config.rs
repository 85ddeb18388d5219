use std::path::PathBuf;

use glam::Vec3;

use crate::{AshError, Result};

/// Upper bound on frames in flight; per-frame arrays are sized by this.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Capacities of the per-kind resource pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolCapacities {
    pub buffers: u32,
    pub textures: u32,
    pub samplers: u32,
    pub pipelines: u32,
    pub descriptor_sets: u32,
}

impl Default for PoolCapacities {
    fn default() -> Self {
        Self {
            buffers: 4096,
            textures: 4096,
            samplers: 64,
            pipelines: 128,
            descriptor_sets: 256,
        }
    }
}

/// Static engine configuration, fixed for the lifetime of a [`crate::renderer::Renderer`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub frames_in_flight: usize,
    pub pools: PoolCapacities,
    /// Bytes available to the transfer loader per staging epoch.
    pub staging_buffer_size: u64,
    pub max_bindless_textures: u32,
    pub max_bindless_buffers: u32,
    /// Shadow map extent relative to the swapchain extent.
    pub shadow_resolution_scale: f32,
    pub enable_validation: bool,
    pub vsync: bool,
    /// When set, the pipeline cache is loaded from and saved to this file.
    pub pipeline_cache_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            pools: PoolCapacities::default(),
            staging_buffer_size: 64 * 1024 * 1024,
            max_bindless_textures: 4096,
            max_bindless_buffers: 1024,
            shadow_resolution_scale: 2.0,
            enable_validation: cfg!(all(feature = "validation", debug_assertions)),
            vsync: true,
            pipeline_cache_path: Some(
                std::env::temp_dir()
                    .join("ash_deferred")
                    .join("pipeline.cache"),
            ),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(AshError::InvalidConfig(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }

        let pools = &self.pools;
        if pools.buffers == 0
            || pools.textures == 0
            || pools.samplers == 0
            || pools.pipelines == 0
            || pools.descriptor_sets == 0
        {
            return Err(AshError::InvalidConfig(
                "resource pool capacities must be non-zero".into(),
            ));
        }

        if self.staging_buffer_size == 0 {
            return Err(AshError::InvalidConfig(
                "staging buffer size must be non-zero".into(),
            ));
        }

        if self.max_bindless_textures == 0 || self.max_bindless_buffers == 0 {
            return Err(AshError::InvalidConfig(
                "bindless capacities must be non-zero".into(),
            ));
        }

        if !(self.shadow_resolution_scale > 0.0) {
            return Err(AshError::InvalidConfig(format!(
                "shadow resolution scale must be positive, got {}",
                self.shadow_resolution_scale
            )));
        }

        Ok(())
    }
}

/// Per-frame switches written by the UI collaborator and read by the frame driver.
#[derive(Clone, Debug)]
pub struct RenderToggles {
    pub shadows_enabled: bool,
    pub frustum_cull_enabled: bool,
    /// Keeps the last culling camera so culling can be inspected from outside.
    pub freeze_cull: bool,
    pub skybox_enabled: bool,
    /// Edge-triggered; cleared by [`RenderToggles::take_reload_request`].
    pub reload_pipelines: bool,
    pub light_position: Vec3,
}

impl Default for RenderToggles {
    fn default() -> Self {
        Self {
            shadows_enabled: true,
            frustum_cull_enabled: true,
            freeze_cull: false,
            skybox_enabled: true,
            reload_pipelines: false,
            light_position: Vec3::new(-2.0, 20.0, 2.0),
        }
    }
}

impl RenderToggles {
    pub fn take_reload_request(&mut self) -> bool {
        std::mem::take(&mut self.reload_pipelines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_frames_in_flight() {
        let mut config = EngineConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.frames_in_flight = MAX_FRAMES_IN_FLIGHT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_capacities() {
        let mut config = EngineConfig::default();
        config.pools.samplers = 0;
        assert!(config.validate().is_err());

        let config = EngineConfig {
            staging_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn reload_request_is_consumed() {
        let mut toggles = RenderToggles {
            reload_pipelines: true,
            ..Default::default()
        };
        assert!(toggles.take_reload_request());
        assert!(!toggles.take_reload_request());
    }
}
