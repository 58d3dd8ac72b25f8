// Vulkan Instance - API entry point
//
// Responsibilities:
// - Loading the Vulkan library
// - Checking required layers/extensions against what the loader reports
// - Instance creation, plus a debug messenger when validation is enabled

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::device::QueueFamilyPolicy;
use super::BackendError;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const API_VERSION: u32 = vk::API_VERSION_1_2;

/// Process-wide capability configuration consulted while bootstrapping.
///
/// Passed explicitly into [`Instance::new`] and the logical device builder so
/// callers (and tests) can vary it.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub app_name: String,
    pub app_version: u32,
    pub enable_validation: bool,
    pub validation_layers: Vec<CString>,
    pub device_extensions: Vec<CString>,
    pub queue_family_policy: QueueFamilyPolicy,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            app_name: "Triangle Renderer".to_string(),
            app_version: vk::make_api_version(0, 0, 0, 1),
            enable_validation: cfg!(debug_assertions),
            validation_layers: vec![VALIDATION_LAYER.to_owned()],
            device_extensions: vec![ash::extensions::khr::Swapchain::name().to_owned()],
            queue_family_policy: QueueFamilyPolicy::default(),
        }
    }
}

impl BootstrapConfig {
    /// Layers to request, empty when validation is off
    pub fn required_layers(&self) -> &[CString] {
        if self.enable_validation {
            self.validation_layers.as_slice()
        } else {
            &[]
        }
    }
}

/// Match every required layer against the enumerated ones.
pub fn gather_layers<'a>(
    available: &[vk::LayerProperties],
    required: &'a [CString],
) -> Result<Vec<&'a CStr>, BackendError> {
    let names: Vec<&CStr> = available
        .iter()
        .map(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) })
        .collect();
    require_all(&names, required, BackendError::MissingLayer)
}

/// Match every required extension against the enumerated ones.
pub fn gather_extensions<'a>(
    available: &[vk::ExtensionProperties],
    required: &'a [CString],
) -> Result<Vec<&'a CStr>, BackendError> {
    let names: Vec<&CStr> = available
        .iter()
        .map(|extension| unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) })
        .collect();
    require_all(&names, required, BackendError::MissingExtension)
}

// Lists are a handful of entries long, a linear scan per name is enough.
fn require_all<'a>(
    available: &[&CStr],
    required: &'a [CString],
    missing: fn(String) -> BackendError,
) -> Result<Vec<&'a CStr>, BackendError> {
    required
        .iter()
        .map(|name| {
            if available.contains(&name.as_c_str()) {
                Ok(name.as_c_str())
            } else {
                Err(missing(name.to_string_lossy().into_owned()))
            }
        })
        .collect()
}

/// Vulkan instance wrapper with automatic cleanup
pub struct Instance {
    pub instance: ash::Instance,
    pub entry: Entry,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    /// Create the instance.
    ///
    /// # Arguments
    /// * `config` - Layer configuration and application identity
    /// * `window_extensions` - Instance extensions the window needs for its surface
    pub fn new(config: &BootstrapConfig, window_extensions: &[CString]) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", config.app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let mut required_extensions = window_extensions.to_vec();
        if config.enable_validation {
            required_extensions.push(DebugUtils::name().to_owned());
        }

        let available_layers = entry.enumerate_instance_layer_properties()?;
        let available_extensions = entry.enumerate_instance_extension_properties(None)?;

        let layers = gather_layers(&available_layers, config.required_layers())?;
        let extensions = gather_extensions(&available_extensions, &required_extensions)?;
        log::debug!("Instance layers: {:?}", layers);
        log::debug!("Instance extensions: {:?}", extensions);

        let layer_ptrs: Vec<_> = layers.iter().map(|name| name.as_ptr()).collect();
        let extension_ptrs: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();

        let app_name = CString::new(config.app_name.as_str())?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(config.app_version)
            .api_version(API_VERSION);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let debug_utils = if config.enable_validation {
            // No Self yet, so Drop won't release the instance on failure
            let messenger = release_on_err(setup_debug_messenger(&entry, &instance), || unsafe {
                instance.destroy_instance(None)
            })?;
            Some(messenger)
        } else {
            None
        };

        Ok(Arc::new(Self {
            instance,
            entry,
            debug_utils,
        }))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Run `release` if `result` failed, then hand the result back.
fn release_on_err<T>(result: Result<T>, release: impl FnOnce()) -> Result<T> {
    if result.is_err() {
        release();
    }
    result
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;

    Ok((debug_utils, messenger))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, src) in props.layer_name.iter_mut().zip(name.bytes()) {
            *dst = src as std::ffi::c_char;
        }
        props
    }

    fn extension(name: &str) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, src) in props.extension_name.iter_mut().zip(name.bytes()) {
            *dst = src as std::ffi::c_char;
        }
        props
    }

    fn names(list: &[&str]) -> Vec<CString> {
        list.iter().map(|n| CString::new(*n).unwrap()).collect()
    }

    #[test]
    fn gathers_required_layers_in_request_order() {
        let available = [layer("VK_LAYER_LUNARG_monitor"), layer("VK_LAYER_KHRONOS_validation")];
        let required = names(&["VK_LAYER_KHRONOS_validation", "VK_LAYER_LUNARG_monitor"]);

        let gathered = gather_layers(&available, &required).unwrap();
        assert_eq!(gathered, vec![required[0].as_c_str(), required[1].as_c_str()]);
    }

    #[test]
    fn missing_layer_is_reported_by_name() {
        let available = [layer("VK_LAYER_LUNARG_monitor")];
        let required = names(&["VK_LAYER_KHRONOS_validation"]);

        let err = gather_layers(&available, &required).unwrap_err();
        assert_eq!(err, BackendError::MissingLayer("VK_LAYER_KHRONOS_validation".into()));
        assert_eq!(err.to_string(), "missing required layer VK_LAYER_KHRONOS_validation");
    }

    #[test]
    fn missing_extension_is_reported_by_name() {
        let available = [extension("VK_KHR_surface")];
        let required = names(&["VK_KHR_surface", "VK_KHR_xcb_surface"]);

        let err = gather_extensions(&available, &required).unwrap_err();
        assert_eq!(err, BackendError::MissingExtension("VK_KHR_xcb_surface".into()));
    }

    #[test]
    fn nothing_required_gathers_nothing() {
        assert!(gather_extensions(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn validation_off_requires_no_layers() {
        let config = BootstrapConfig {
            enable_validation: false,
            ..Default::default()
        };
        assert!(config.required_layers().is_empty());

        let config = BootstrapConfig {
            enable_validation: true,
            ..Default::default()
        };
        assert_eq!(config.required_layers(), &[VALIDATION_LAYER.to_owned()]);
    }

    #[test]
    fn failed_setup_releases_exactly_once() {
        let released = std::cell::Cell::new(0);

        let failed: Result<u32> = Err(anyhow::anyhow!("messenger"));
        assert!(release_on_err(failed, || released.set(released.get() + 1)).is_err());
        assert_eq!(released.get(), 1);

        let ok = release_on_err(Ok(7), || released.set(released.get() + 1)).unwrap();
        assert_eq!(ok, 7);
        assert_eq!(released.get(), 1);
    }
}
