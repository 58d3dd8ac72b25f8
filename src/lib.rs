//! Minimal Vulkan triangle renderer.
//!
//! [`app::VulkanApplication`] bootstraps the pipeline chain against a
//! [`window::Window`] and drives the per-frame loop. [`backend`] holds the
//! RAII wrappers for each GPU object, plus a general-purpose [`backend::Buffer`].

pub mod app;
pub mod backend;
pub mod config;
pub mod window;
