// Window collaborator
//
// The renderer only needs four things from a window: a surface factory, the
// instance extensions that factory relies on, the drawable size, and a poll
// that reports whether the window is still open.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{WindowAttributes, WindowId},
};

pub trait Window {
    /// Create a presentable surface for this window on `instance`
    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR>;

    /// Instance extensions the surface factory needs
    fn required_extensions(&self) -> Result<Vec<CString>>;

    /// Current drawable size in pixels
    fn size(&self) -> vk::Extent2D;

    /// Process pending events; false once the window wants to close
    fn update(&mut self) -> bool;
}

/// Event handler state driven by `pump_app_events`
struct WindowState {
    attributes: WindowAttributes,
    window: Option<winit::window::Window>,
    created: bool,
    close_requested: bool,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.created {
            return;
        }
        self.created = true;

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(window),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.close_requested = true;
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                }
            }
            WindowEvent::Resized(size) => {
                // The swapchain is fixed-size; a resize only gets noted
                log::debug!("Window resized to {}x{}", size.width, size.height);
            }
            _ => {}
        }
    }
}

/// winit window polled from the render loop
pub struct WinitWindow {
    window: winit::window::Window,
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl WinitWindow {
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("Failed to create event loop")?;

        let mut state = WindowState {
            attributes: WindowAttributes::default()
                .with_title(title)
                .with_inner_size(winit::dpi::PhysicalSize::new(width, height))
                .with_resizable(false),
            window: None,
            created: false,
            close_requested: false,
        };

        // The window is created from `resumed`, pump until that happened
        while !state.created {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::ZERO), &mut state)
            {
                anyhow::bail!("Event loop exited with code {} before creating the window", code);
            }
        }

        let window = state.window.take().context("Failed to create window")?;
        log::info!("Window: {}x{} \"{}\"", width, height, title);

        Ok(Self {
            window,
            state,
            event_loop,
        })
    }
}

impl Window for WinitWindow {
    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR> {
        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }?;
        Ok(surface)
    }

    fn required_extensions(&self) -> Result<Vec<CString>> {
        let names = ash_window::enumerate_required_extensions(self.event_loop.raw_display_handle())
            .context("Unsupported windowing platform")?;

        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_owned())
            .collect())
    }

    fn size(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn update(&mut self) -> bool {
        let status = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state);

        !matches!(status, PumpStatus::Exit(_)) && !self.state.close_requested
    }
}
