use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::{vk, Device};

use crate::{AshError, Result};

/// Size of `VkPipelineCacheHeaderVersionOne`.
const HEADER_LEN: usize = 16 + vk::UUID_SIZE;

/// Identity of the physical device a cache blob was produced on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheIdentity {
    pub vendor_id: u32,
    pub device_id: u32,
    pub uuid: [u8; vk::UUID_SIZE],
}

impl CacheIdentity {
    pub fn from_properties(properties: &vk::PhysicalDeviceProperties) -> Self {
        Self {
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            uuid: properties.pipeline_cache_uuid,
        }
    }

    /// Whether a serialized cache blob was written by this device and driver.
    pub fn accepts(&self, data: &[u8]) -> bool {
        if data.len() < HEADER_LEN {
            return false;
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let header_len = word(0) as usize;
        let version = word(4);
        header_len >= HEADER_LEN
            && version == vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32
            && word(8) == self.vendor_id
            && word(12) == self.device_id
            && data[16..HEADER_LEN] == self.uuid
    }
}

/// Reads a cache blob from disk, discarding it when it belongs to another device.
pub fn load_cache_file(path: &Path, identity: &CacheIdentity) -> Option<Vec<u8>> {
    if !path.exists() {
        log::debug!("No pipeline cache at {}", path.display());
        return None;
    }
    match std::fs::read(path) {
        Ok(data) if identity.accepts(&data) => {
            log::info!(
                "Loaded pipeline cache ({} bytes) from {}",
                data.len(),
                path.display()
            );
            Some(data)
        }
        Ok(_) => {
            log::warn!(
                "Ignoring pipeline cache at {}: written by another device or driver",
                path.display()
            );
            None
        }
        Err(e) => {
            log::warn!("Failed to read pipeline cache: {e}");
            None
        }
    }
}

/// Driver pipeline cache shared by every pipeline the device creates, persisted to
/// disk on shutdown when a path is configured.
pub struct PipelineCache {
    device: Arc<Device>,
    cache: vk::PipelineCache,
    cache_file: Option<PathBuf>,
}

impl PipelineCache {
    pub fn new(
        device: Arc<Device>,
        identity: &CacheIdentity,
        cache_file: Option<PathBuf>,
    ) -> Result<Self> {
        let initial_data = cache_file
            .as_deref()
            .and_then(|path| load_cache_file(path, identity))
            .unwrap_or_default();

        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(&initial_data);
        let cache = unsafe { device.create_pipeline_cache(&create_info, None) }
            .map_err(|e| AshError::VulkanError(format!("Failed to create pipeline cache: {e}")))?;

        Ok(Self {
            device,
            cache,
            cache_file,
        })
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Writes the cache to its configured path. No-op without persistence.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.cache_file.as_deref() else {
            return Ok(());
        };
        let data = unsafe { self.device.get_pipeline_cache_data(self.cache) }
            .map_err(|e| AshError::VulkanError(format!("Failed to read pipeline cache data: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &data)?;
        log::info!(
            "Saved pipeline cache ({} bytes) to {}",
            data.len(),
            path.display()
        );
        Ok(())
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            log::warn!("Failed to save pipeline cache on drop: {e}");
        }
        unsafe {
            self.device.destroy_pipeline_cache(self.cache, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn identity() -> CacheIdentity {
        CacheIdentity {
            vendor_id: 0x10de,
            device_id: 0x2684,
            uuid: [7; vk::UUID_SIZE],
        }
    }

    fn header(identity: &CacheIdentity) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&identity.vendor_id.to_le_bytes());
        data.extend_from_slice(&identity.device_id.to_le_bytes());
        data.extend_from_slice(&identity.uuid);
        data.extend_from_slice(&[0xAB; 64]);
        data
    }

    #[test]
    fn accepts_matching_header_only() {
        let id = identity();
        assert!(id.accepts(&header(&id)));

        let other = CacheIdentity {
            device_id: 1,
            ..id
        };
        assert!(!id.accepts(&header(&other)));
        assert!(!id.accepts(&header(&id)[..HEADER_LEN - 1]));
    }

    #[test]
    fn stale_cache_file_is_discarded() {
        let id = identity();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&header(&CacheIdentity { vendor_id: 0x1002, ..id }))
            .unwrap();
        assert!(load_cache_file(file.path(), &id).is_none());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&header(&id)).unwrap();
        assert_eq!(load_cache_file(file.path(), &id).unwrap().len(), HEADER_LEN + 64);
    }

    #[test]
    fn missing_file_yields_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_cache_file(&dir.path().join("pipelines.bin"), &identity()).is_none());
    }
}
