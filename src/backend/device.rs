// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (first enumerated GPU)
// - Queue family resolution for graphics and presentation
// - Logical device + queue creation, checking device layers/extensions

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::ffi::CStr;
use std::sync::Arc;

use super::instance::{gather_extensions, gather_layers, BootstrapConfig, Instance};
use super::BackendError;

/// Tie-break when several queue families qualify for the same role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFamilyPolicy {
    /// Every later match overwrites the previous one
    #[default]
    Last,
    /// The first match for each role sticks
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Both indices, or a configuration error if either role is unresolved
    pub fn complete(&self) -> Result<(u32, u32), BackendError> {
        match (self.graphics_family, self.present_family) {
            (Some(graphics), Some(present)) => Ok((graphics, present)),
            _ => Err(BackendError::IncompleteQueueFamilies),
        }
    }
}

/// Scan the queue families once, recording graphics and present capable ones.
///
/// Present support is queried for every family regardless of its graphics
/// capability, so with [`QueueFamilyPolicy::Last`] a family that does both
/// wins whenever it comes last.
pub fn resolve_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
    policy: QueueFamilyPolicy,
) -> Result<QueueFamilyIndices>
where
    F: FnMut(u32) -> Result<bool>,
{
    let mut indices = QueueFamilyIndices::default();

    let record = |slot: &mut Option<u32>, index: u32| match policy {
        QueueFamilyPolicy::Last => *slot = Some(index),
        QueueFamilyPolicy::First => {
            slot.get_or_insert(index);
        }
    };

    for (index, family) in (0u32..).zip(families) {
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            record(&mut indices.graphics_family, index);
        }
        if supports_present(index)? {
            record(&mut indices.present_family, index);
        }
    }

    Ok(indices)
}

/// Resolve queue families of `physical_device` against `surface`.
pub fn find_queue_families(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    surface: &super::Surface,
    policy: QueueFamilyPolicy,
) -> Result<QueueFamilyIndices> {
    let families = unsafe {
        instance
            .instance
            .get_physical_device_queue_family_properties(physical_device)
    };

    let indices = resolve_queue_families(
        &families,
        |index| surface.supports_present(physical_device, index),
        policy,
    )?;

    log::info!(
        "Queue families: graphics={:?} present={:?}",
        indices.graphics_family,
        indices.present_family
    );
    Ok(indices)
}

/// Pick the first enumerated GPU.
///
/// No scoring: the renderer targets a single known class of hardware.
pub fn select_physical_device(instance: &Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.instance.enumerate_physical_devices() }
        .context("Failed to enumerate physical devices")?;

    devices
        .first()
        .copied()
        .ok_or_else(|| BackendError::NoPhysicalDevice.into())
}

/// Logical device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    // Keeps the instance alive until the device is gone
    pub instance: Arc<Instance>,
}

impl VulkanDevice {
    /// Create the logical device and fetch its graphics and present queues.
    ///
    /// Fails with [`BackendError::IncompleteQueueFamilies`] before touching
    /// the driver if either queue role is unresolved.
    pub fn new(
        instance: Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        indices: &QueueFamilyIndices,
        config: &BootstrapConfig,
    ) -> Result<Arc<Self>> {
        let (graphics_family, present_family) = indices.complete()?;

        let (available_layers, available_extensions) = unsafe {
            (
                instance
                    .instance
                    .enumerate_device_layer_properties(physical_device)?,
                instance
                    .instance
                    .enumerate_device_extension_properties(physical_device)?,
            )
        };
        let layers = gather_layers(&available_layers, config.required_layers())?;
        let extensions = gather_extensions(&available_extensions, &config.device_extensions)?;
        log::debug!("Device extensions: {:?}", extensions);

        let layer_ptrs: Vec<_> = layers.iter().map(|name| name.as_ptr()).collect();
        let extension_ptrs: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();

        let mut families = vec![graphics_family];
        if present_family != graphics_family {
            log::warn!(
                "Graphics ({}) and present ({}) use different queue families",
                graphics_family,
                present_family
            );
            families.push(present_family);
        }

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(graphics_family, 0),
                device.get_device_queue(present_family, 0),
            )
        };

        let (properties, memory_properties) = unsafe {
            (
                instance.instance.get_physical_device_properties(physical_device),
                instance
                    .instance
                    .get_physical_device_memory_properties(physical_device),
            )
        };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            graphics_queue,
            graphics_queue_family: graphics_family,
            present_queue,
            present_queue_family: present_family,
            properties,
            memory_properties,
            instance,
        }))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device wait idle failed during teardown: {:?}", e);
        }

        unsafe {
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn present_on(supported: &'static [u32]) -> impl FnMut(u32) -> Result<bool> {
        move |index| Ok(supported.contains(&index))
    }

    #[test]
    fn last_policy_keeps_the_last_match_of_each_role() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
        ];

        let indices =
            resolve_queue_families(&families, present_on(&[0, 1]), QueueFamilyPolicy::Last).unwrap();

        assert_eq!(indices.graphics_family, Some(2));
        assert_eq!(indices.present_family, Some(1));
    }

    #[test]
    fn first_policy_keeps_the_first_match_of_each_role() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
        ];

        let indices =
            resolve_queue_families(&families, present_on(&[1, 2]), QueueFamilyPolicy::First)
                .unwrap();

        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.present_family, Some(1));
    }

    #[test]
    fn present_support_is_queried_for_non_graphics_families() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::COMPUTE)];
        let mut queried = Vec::new();

        let indices = resolve_queue_families(
            &families,
            |index| {
                queried.push(index);
                Ok(index == 1)
            },
            QueueFamilyPolicy::Last,
        )
        .unwrap();

        assert_eq!(queried, vec![0, 1]);
        assert_eq!(indices.complete().unwrap(), (0, 1));
    }

    #[test]
    fn missing_present_family_is_a_configuration_error() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices =
            resolve_queue_families(&families, present_on(&[]), QueueFamilyPolicy::Last).unwrap();

        assert!(!indices.is_complete());
        assert_eq!(indices.complete(), Err(BackendError::IncompleteQueueFamilies));
    }

    #[test]
    fn missing_graphics_family_is_a_configuration_error() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let indices =
            resolve_queue_families(&families, present_on(&[0]), QueueFamilyPolicy::First).unwrap();

        assert_eq!(indices.present_family, Some(0));
        assert_eq!(indices.complete(), Err(BackendError::IncompleteQueueFamilies));
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = resolve_queue_families(
            &families,
            |_| Err(anyhow::anyhow!("surface lost")),
            QueueFamilyPolicy::Last,
        );
        assert!(result.is_err());
    }
}
