use ash::vk;
use log::error;
use std::sync::Arc;

use crate::{AshError, Result};

/// Command pool owning one primary command buffer per frame-in-flight slot.
pub struct CommandRing {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandRing {
    pub fn new(device: Arc<ash::Device>, queue_family: u32, slots: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| AshError::VulkanError(format!("Failed to create command pool: {e:?}")))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slots as u32);
        let buffers = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(AshError::VulkanError(format!(
                    "Failed to allocate command buffers: {e:?}"
                )));
            }
        };

        Ok(Self {
            device,
            pool,
            buffers,
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Resets the slot's buffer and puts it in the recording state.
    pub fn begin(&self, slot: usize) -> Result<vk::CommandBuffer> {
        let cmd = *self
            .buffers
            .get(slot)
            .ok_or_else(|| AshError::VulkanError(format!("Command slot {slot} out of range")))?;
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin)?;
        }
        Ok(cmd)
    }

    pub fn end(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }.map_err(AshError::from)
    }
}

impl Drop for CommandRing {
    fn drop(&mut self) {
        unsafe {
            self.device.free_command_buffers(self.pool, &self.buffers);
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Per-frame synchronization primitives. Present-wait semaphores live with the
/// swapchain images instead, since presentation is per image.
pub struct FrameSync {
    device: Arc<ash::Device>,
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        unsafe {
            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let image_available = device.create_semaphore(&semaphore_info, None)?;
            let in_flight = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e.into());
                }
            };
            Ok(Self {
                device,
                image_available,
                in_flight,
            })
        }
    }

    /// Blocks until this slot's previous submission has retired.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight], true, u64::MAX)
                .map_err(AshError::from)
        }
    }

}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.image_available, None);
            self.device.destroy_fence(self.in_flight, None);
        }
    }
}

/// Resets `fence` and submits `submits` signaling it. When the submission fails
/// the fence is signaled again by an empty batch, so a later wait on it returns.
pub fn submit_with_fence(
    device: &ash::Device,
    queue: vk::Queue,
    submits: &[vk::SubmitInfo2<'_>],
    fence: vk::Fence,
) -> Result<()> {
    fenced_submit(
        || unsafe { device.reset_fences(&[fence]) }.map_err(AshError::from),
        || {
            unsafe { device.queue_submit2(queue, submits, fence) }
                .map_err(|e| AshError::VulkanError(format!("Queue submission failed: {e:?}")))
        },
        || unsafe { device.queue_submit2(queue, &[], fence) }.map_err(AshError::from),
    )
}

fn fenced_submit(
    reset: impl FnOnce() -> Result<()>,
    submit: impl FnOnce() -> Result<()>,
    resignal: impl FnOnce() -> Result<()>,
) -> Result<()> {
    reset()?;
    if let Err(e) = submit() {
        if let Err(resignal_error) = resignal() {
            error!("Fence left unsignaled after failed submission: {resignal_error}");
        }
        return Err(e);
    }
    Ok(())
}

/// Records and synchronously submits a one-off command buffer. Only for init-time work.
pub fn submit_immediate(
    device: &ash::Device,
    queue_family: u32,
    queue: vk::Queue,
    record: impl FnOnce(vk::CommandBuffer),
) -> Result<()> {
    unsafe {
        let pool = device.create_command_pool(
            &vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT),
            None,
        )?;

        let result = (|| -> Result<()> {
            let cmd = device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?[0];
            device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            record(cmd);
            device.end_command_buffer(cmd)?;

            let fence = device.create_fence(&vk::FenceCreateInfo::default(), None)?;
            let cmds = [cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            let submitted = device
                .queue_submit(queue, &[submit], fence)
                .and_then(|_| device.wait_for_fences(&[fence], true, u64::MAX));
            device.destroy_fence(fence, None);
            submitted.map_err(AshError::from)
        })();

        device.destroy_command_pool(pool, None);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn failed_submission_leaves_the_fence_signaled() {
        let signaled = Cell::new(true);
        let result = fenced_submit(
            || {
                signaled.set(false);
                Ok(())
            },
            || Err(AshError::VulkanError("ERROR_DEVICE_LOST".into())),
            || {
                signaled.set(true);
                Ok(())
            },
        );
        assert!(matches!(result, Err(AshError::VulkanError(_))));
        assert!(signaled.get());
    }

    #[test]
    fn successful_submission_does_not_resignal() {
        let resignaled = Cell::new(false);
        fenced_submit(|| Ok(()), || Ok(()), || {
            resignaled.set(true);
            Ok(())
        })
        .unwrap();
        assert!(!resignaled.get());
    }

    #[test]
    fn failed_reset_skips_the_submission() {
        let submitted = Cell::new(false);
        let result = fenced_submit(
            || Err(AshError::VulkanError("ERROR_OUT_OF_DEVICE_MEMORY".into())),
            || {
                submitted.set(true);
                Ok(())
            },
            || Ok(()),
        );
        assert!(result.is_err());
        assert!(!submitted.get());
    }
}
