// Per-frame draw loop
//
// WAIT_FENCE -> ACQUIRE_IMAGE -> RECORD -> SUBMIT -> PRESENT
//
// The in-flight fence gates re-recording of the single command buffer, which
// bounds GPU work to one outstanding frame. Any stage failing ends the frame
// with the error; nothing is retried.

use anyhow::{Context, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    WaitFence,
    AcquireImage,
    Record,
    Submit,
    Present,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStage::WaitFence => "WAIT_FENCE",
            FrameStage::AcquireImage => "ACQUIRE_IMAGE",
            FrameStage::Record => "RECORD",
            FrameStage::Submit => "SUBMIT",
            FrameStage::Present => "PRESENT",
        };
        f.write_str(name)
    }
}

/// GPU operations behind each stage of a frame
pub trait FrameOps {
    /// Block until the previous frame's fence signals, then reset it
    fn wait_for_previous_frame(&mut self) -> Result<()>;
    /// Next presentable image index; signals "image available"
    fn acquire_image(&mut self) -> Result<u32>;
    /// Reset and re-record the command buffer for `image_index`
    fn record(&mut self, image_index: u32) -> Result<()>;
    /// Submit waiting on "image available", signaling "render finished" and the fence
    fn submit(&mut self) -> Result<()>;
    /// Present `image_index` once "render finished" signals
    fn present(&mut self, image_index: u32) -> Result<()>;
}

/// Run one frame through every stage in order.
pub fn draw_frame<O: FrameOps + ?Sized>(ops: &mut O) -> Result<()> {
    log::trace!("{}", FrameStage::WaitFence);
    ops.wait_for_previous_frame()
        .with_context(|| format!("Frame stage {} failed", FrameStage::WaitFence))?;

    log::trace!("{}", FrameStage::AcquireImage);
    let image_index = ops
        .acquire_image()
        .with_context(|| format!("Frame stage {} failed", FrameStage::AcquireImage))?;

    log::trace!("{} image {}", FrameStage::Record, image_index);
    ops.record(image_index)
        .with_context(|| format!("Frame stage {} failed", FrameStage::Record))?;

    log::trace!("{}", FrameStage::Submit);
    ops.submit()
        .with_context(|| format!("Frame stage {} failed", FrameStage::Submit))?;

    log::trace!("{} image {}", FrameStage::Present, image_index);
    ops.present(image_index)
        .with_context(|| format!("Frame stage {} failed", FrameStage::Present))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use ash::vk;

    /// Simulated device: submissions stay pending until the CPU waits on
    /// the fence, at which point the "GPU" retires them.
    struct FakeGpu {
        fence_signaled: bool,
        fence_observed: bool,
        pending_submissions: u32,
        max_pending: u32,
        image_count: u32,
        next_image: u32,
        acquired: Option<u32>,
        recorded: Option<u32>,
        stages: Vec<FrameStage>,
        fail_at: Option<FrameStage>,
        failure: BackendError,
    }

    impl FakeGpu {
        fn new(image_count: u32) -> Self {
            Self {
                fence_signaled: true,
                fence_observed: false,
                pending_submissions: 0,
                max_pending: 0,
                image_count,
                next_image: 0,
                acquired: None,
                recorded: None,
                stages: Vec::new(),
                fail_at: None,
                failure: BackendError::operation("fake", vk::Result::ERROR_OUT_OF_DATE_KHR),
            }
        }

        fn enter(&mut self, stage: FrameStage) -> Result<()> {
            self.stages.push(stage);
            if self.fail_at == Some(stage) {
                return Err(self.failure.clone().into());
            }
            Ok(())
        }
    }

    impl FrameOps for FakeGpu {
        fn wait_for_previous_frame(&mut self) -> Result<()> {
            self.enter(FrameStage::WaitFence)?;
            // Waiting lets the GPU drain everything outstanding and signal;
            // the signal is observed, then the fence is reset.
            self.pending_submissions = 0;
            self.fence_observed = true;
            self.fence_signaled = false;
            Ok(())
        }

        fn acquire_image(&mut self) -> Result<u32> {
            self.enter(FrameStage::AcquireImage)?;
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            self.acquired = Some(index);
            Ok(index)
        }

        fn record(&mut self, image_index: u32) -> Result<()> {
            self.enter(FrameStage::Record)?;
            assert!(
                std::mem::take(&mut self.fence_observed),
                "command buffer re-recorded without observing the fence"
            );
            assert_eq!(
                self.pending_submissions, 0,
                "command buffer re-recorded while a submission is in flight"
            );
            assert_eq!(self.acquired, Some(image_index));
            self.recorded = Some(image_index);
            Ok(())
        }

        fn submit(&mut self) -> Result<()> {
            self.enter(FrameStage::Submit)?;
            assert!(!self.fence_signaled, "submitting with a signaled fence");
            self.pending_submissions += 1;
            self.max_pending = self.max_pending.max(self.pending_submissions);
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<()> {
            self.enter(FrameStage::Present)?;
            assert_eq!(self.recorded, Some(image_index));
            Ok(())
        }
    }

    const ORDER: [FrameStage; 5] = [
        FrameStage::WaitFence,
        FrameStage::AcquireImage,
        FrameStage::Record,
        FrameStage::Submit,
        FrameStage::Present,
    ];

    #[test]
    fn stages_run_in_order() {
        let mut gpu = FakeGpu::new(3);
        draw_frame(&mut gpu).unwrap();
        assert_eq!(gpu.stages, ORDER.to_vec());
    }

    #[test]
    fn never_more_than_one_submission_in_flight() {
        let mut gpu = FakeGpu::new(3);
        for _ in 0..10 {
            draw_frame(&mut gpu).unwrap();
        }

        assert_eq!(gpu.max_pending, 1);
        assert_eq!(gpu.stages.len(), 50);
        for frame in gpu.stages.chunks(5) {
            assert_eq!(frame, ORDER);
        }
    }

    #[test]
    fn acquired_images_cycle_through_the_swapchain() {
        let mut gpu = FakeGpu::new(2);
        let mut presented = Vec::new();
        for _ in 0..4 {
            draw_frame(&mut gpu).unwrap();
            presented.push(gpu.recorded.unwrap());
        }
        assert_eq!(presented, vec![0, 1, 0, 1]);
    }

    #[test]
    fn failed_acquire_stops_the_frame() {
        let mut gpu = FakeGpu::new(3);
        gpu.fail_at = Some(FrameStage::AcquireImage);

        let err = draw_frame(&mut gpu).unwrap_err();
        assert_eq!(gpu.stages, vec![FrameStage::WaitFence, FrameStage::AcquireImage]);
        assert!(err.to_string().contains("ACQUIRE_IMAGE"));
        assert_eq!(
            err.downcast_ref::<BackendError>(),
            Some(&BackendError::operation("fake", vk::Result::ERROR_OUT_OF_DATE_KHR))
        );
    }

    #[test]
    fn lost_device_at_fence_wait_is_typed() {
        let mut gpu = FakeGpu::new(3);
        gpu.fail_at = Some(FrameStage::WaitFence);
        gpu.failure = BackendError::operation("wait_for_fences", vk::Result::ERROR_DEVICE_LOST);

        let err = draw_frame(&mut gpu).unwrap_err();
        assert_eq!(gpu.stages, vec![FrameStage::WaitFence]);
        assert_eq!(gpu.pending_submissions, 0);
        assert!(err.to_string().contains("WAIT_FENCE"));
        assert_eq!(
            err.downcast_ref::<BackendError>(),
            Some(&BackendError::Operation {
                operation: "wait_for_fences",
                result: vk::Result::ERROR_DEVICE_LOST,
            })
        );
    }

    #[test]
    fn failed_present_is_reported_after_submission() {
        let mut gpu = FakeGpu::new(3);
        gpu.fail_at = Some(FrameStage::Present);

        assert!(draw_frame(&mut gpu).is_err());
        assert_eq!(gpu.stages, ORDER.to_vec());
        assert_eq!(gpu.pending_submissions, 1);
    }
}
