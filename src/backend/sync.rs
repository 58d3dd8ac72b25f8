// Synchronization primitives
//
// One set per renderer: a single frame is ever in flight.
// - image_available: acquire -> submit (GPU-GPU)
// - render_finished: submit -> present (GPU-GPU)
// - in_flight: submit -> next frame's CPU (GPU-CPU), created signaled so the
//   first frame does not wait forever

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{BackendError, VulkanDevice};

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device.device.create_semaphore(&semaphore_info, None)?;
            let render_finished = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    return Err(e).context("Failed to create semaphore");
                }
            };
            let in_flight_fence = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create fence");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
                device,
            })
        }
    }

    /// Block until the last submission retired, then re-arm the fence.
    pub fn wait_and_reset(&self) -> Result<()> {
        let fences = [self.in_flight_fence];
        unsafe {
            self.device
                .device
                .wait_for_fences(&fences, true, u64::MAX)
                .map_err(|e| BackendError::operation("wait_for_fences", e))?;
            self.device
                .device
                .reset_fences(&fences)
                .map_err(|e| BackendError::operation("reset_fences", e))?;
        }
        Ok(())
    }

    pub fn is_signaled(&self) -> Result<bool> {
        let signaled = unsafe { self.device.device.get_fence_status(self.in_flight_fence) }
            .map_err(|e| BackendError::operation("get_fence_status", e))?;
        Ok(signaled)
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
