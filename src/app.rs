// =============================================================================
// APPLICATION - owns the whole pipeline chain and drives the frame loop
// =============================================================================
//
// CONSTRUCTION ORDER:
//   instance -> surface -> physical device -> queue families -> device
//   -> swapchain + views -> render pass -> framebuffers -> pipeline
//   -> command pool + buffer -> sync objects
//
// Teardown is the exact reverse: Drop waits for the device to go idle, then
// the fields below drop top to bottom.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::command::{record_draw, DrawTarget};
use crate::backend::device::{find_queue_families, select_physical_device};
use crate::backend::frame::{draw_frame, FrameOps};
use crate::backend::{
    BackendError, BootstrapConfig, CommandPool, FrameSync, Framebuffers, GraphicsPipeline, Instance,
    RenderPass, ShaderModule, ShaderSource, Surface, Swapchain, VulkanDevice,
};
use crate::window::Window;

/// Per-run rendering knobs that don't affect capability negotiation
#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub present_mode: vk::PresentModeKHR,
    pub show_fps: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present_mode: vk::PresentModeKHR::FIFO,
            show_fps: false,
        }
    }
}

/// Top-level object holding every GPU resource.
///
/// IMPORTANT: Field order matters for Drop! Fields are declared in reverse
/// construction order so that each object is destroyed before anything it
/// was built from.
pub struct VulkanApplication<W: Window> {
    // ─────────────────────────────────────────────────────────────────────────
    // PER-FRAME STATE
    // ─────────────────────────────────────────────────────────────────────────
    frame_sync: FrameSync,
    /// Freed together with the pool
    command_buffer: vk::CommandBuffer,
    _command_pool: CommandPool,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING
    // ─────────────────────────────────────────────────────────────────────────
    pipeline: GraphicsPipeline,
    framebuffers: Framebuffers,
    render_pass: RenderPass,
    swapchain: Swapchain,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN CORE
    // ─────────────────────────────────────────────────────────────────────────
    device: Arc<VulkanDevice>,
    _surface: Surface,
    _instance: Arc<Instance>,
    window: W,

    // ─────────────────────────────────────────────────────────────────────────
    // SETTINGS & FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    settings: RenderSettings,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl<W: Window> VulkanApplication<W> {
    /// Build the full pipeline chain for `window`.
    ///
    /// Any step failing aborts construction; whatever was already created is
    /// released in reverse order as the partially built locals go out of scope.
    pub fn new(
        window: W,
        shaders: &impl ShaderSource,
        config: &BootstrapConfig,
        settings: RenderSettings,
    ) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1-2: Instance and surface
        // ─────────────────────────────────────────────────────────────────────
        let window_extensions = window.required_extensions()?;
        let instance = Instance::new(config, &window_extensions)?;
        let surface = Surface::new(instance.clone(), &window)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3-5: Physical device, queue families, logical device
        // ─────────────────────────────────────────────────────────────────────
        let physical_device = select_physical_device(&instance)?;
        let indices = find_queue_families(
            &instance,
            physical_device,
            &surface,
            config.queue_family_policy,
        )?;
        let device = VulkanDevice::new(instance.clone(), physical_device, &indices, config)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Swapchain and image views
        // ─────────────────────────────────────────────────────────────────────
        let support = surface.query_support(physical_device)?;
        let swapchain = Swapchain::new(
            device.clone(),
            &surface,
            &support,
            window.size(),
            settings.present_mode,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7: Render pass and framebuffers
        // ─────────────────────────────────────────────────────────────────────
        let render_pass = RenderPass::new(device.clone(), swapchain.format)?;
        let framebuffers = Framebuffers::new(
            device.clone(),
            &render_pass,
            &swapchain.image_views,
            swapchain.extent,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 8: Graphics pipeline
        // ─────────────────────────────────────────────────────────────────────
        // Shader modules are only needed while the pipeline is created
        let pipeline = {
            let vert = ShaderModule::new(device.clone(), &shaders.vertex_spirv()?)
                .context("Vertex shader")?;
            let frag = ShaderModule::new(device.clone(), &shaders.fragment_spirv()?)
                .context("Fragment shader")?;
            GraphicsPipeline::new(device.clone(), &render_pass, &vert, &frag)?
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 9-10: Command buffer and synchronization
        // ─────────────────────────────────────────────────────────────────────
        let command_pool = CommandPool::new(device.clone(), device.graphics_queue_family)?;
        let command_buffer = command_pool.allocate()?;
        let frame_sync = FrameSync::new(device.clone())?;

        log::info!("Vulkan initialized successfully!");

        let now = Instant::now();
        Ok(Self {
            frame_sync,
            command_buffer,
            _command_pool: command_pool,
            pipeline,
            framebuffers,
            render_pass,
            swapchain,
            device,
            _surface: surface,
            _instance: instance,
            window,
            settings,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        })
    }

    /// Draw frames until the window asks to close, then drain the GPU.
    pub fn run(&mut self) -> Result<()> {
        log::info!("Entering main loop");

        while self.window.update() {
            draw_frame(self)?;
            self.update_fps();
        }

        log::info!("Main loop finished, waiting for device idle");
        self.device.wait_idle()
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.settings.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            log::info!(
                "{:.0} FPS ({:.2}ms)",
                self.frame_count as f32 / elapsed,
                frame_time * 1000.0
            );
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl<W: Window> FrameOps for VulkanApplication<W> {
    fn wait_for_previous_frame(&mut self) -> Result<()> {
        self.frame_sync.wait_and_reset()
    }

    fn acquire_image(&mut self) -> Result<u32> {
        self.swapchain
            .acquire_next_image(self.frame_sync.image_available)
    }

    fn record(&mut self, image_index: u32) -> Result<()> {
        let framebuffer = *self
            .framebuffers
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for swapchain image {}", image_index))?;

        let target = DrawTarget {
            render_pass: self.render_pass.render_pass,
            framebuffer,
            pipeline: self.pipeline.pipeline,
            extent: self.swapchain.extent,
            clear_color: self.settings.clear_color,
        };

        record_draw(&self.device.device, self.command_buffer, &target)
    }

    fn submit(&mut self) -> Result<()> {
        let wait_semaphores = [self.frame_sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.frame_sync.render_finished];
        let command_buffers = [self.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                self.frame_sync.in_flight_fence,
            )
        }
        .map_err(|e| BackendError::operation("queue_submit", e))?;

        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<()> {
        self.swapchain.present(
            self.device.present_queue,
            image_index,
            &[self.frame_sync.render_finished],
        )
    }
}

impl<W: Window> Drop for VulkanApplication<W> {
    fn drop(&mut self) {
        log::info!("Shutting down...");
        // Nothing may still be executing when the fields start dropping
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait idle failed during shutdown: {:?}", e);
        }
    }
}
