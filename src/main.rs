// =============================================================================
// TRIANGLE RENDERER - entry point
// =============================================================================
//
// FLOW:
// 1. Load config.toml (or the path given as first argument)
// 2. Initialize logging
// 3. Open the window
// 4. Build the Vulkan pipeline chain
// 5. Draw until the window closes, then tear down in reverse order
//
// =============================================================================

use anyhow::Result;
use triangle_renderer::app::{RenderSettings, VulkanApplication};
use triangle_renderer::backend::SpirvFiles;
use triangle_renderer::config::{Config, DEFAULT_CONFIG_PATH};
use triangle_renderer::window::WinitWindow;

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // Logging isn't up yet, so a broken config is reported once it is
    let loaded = Config::load_from_path(&config_path);
    let level = loaded
        .as_ref()
        .map(|c| c.debug.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    let config = loaded.unwrap_or_else(|e| {
        log::warn!("Failed to load {}: {:#}. Using defaults.", config_path, e);
        Config::default()
    });

    log::info!("Starting triangle renderer");
    log::info!("Present mode: {}", config.graphics.present_mode);

    let window = WinitWindow::new(
        &config.window.title,
        config.window.width,
        config.window.height,
    )?;

    let shaders = SpirvFiles::new(
        config.graphics.vertex_shader.clone(),
        config.graphics.fragment_shader.clone(),
    );

    let settings = RenderSettings {
        clear_color: config.graphics.clear_color,
        present_mode: config.present_mode(),
        show_fps: config.debug.show_fps,
    };

    let mut app = VulkanApplication::new(window, &shaders, &config.bootstrap(), settings)?;
    app.run()?;

    log::info!("Shutdown complete");
    Ok(())
}

/// Initialize logging; RUST_LOG still overrides the configured level
fn init_logging(level: &str) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(level)).init();
}
