// GPU memory buffers (staging, vertex, index, uniform)
//
// Each Buffer owns exactly one VkBuffer and the VkDeviceMemory bound to it.
// Buffers are move-only and do no internal synchronization: callers must not
// fill a buffer the GPU is still reading.

use anyhow::{Context, Result};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use super::command::submit_one_shot;
use super::{BackendError, VulkanDevice};

/// What a buffer is for and what kind of memory backs it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub size: vk::DeviceSize,
    pub properties: vk::MemoryPropertyFlags,
    pub usage: vk::BufferUsageFlags,
    pub sharing_mode: vk::SharingMode,
    /// Map once at creation and keep the pointer until drop
    pub keep_mapped: bool,
}

const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

impl Requirements {
    pub fn new(
        size: vk::DeviceSize,
        properties: vk::MemoryPropertyFlags,
        usage: vk::BufferUsageFlags,
        sharing_mode: vk::SharingMode,
        keep_mapped: bool,
    ) -> Self {
        Self {
            size,
            properties,
            usage,
            sharing_mode,
            keep_mapped,
        }
    }

    /// Reject requests the driver would treat as invalid usage
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.size == 0 {
            return Err(BackendError::EmptyBuffer);
        }
        Ok(())
    }

    /// Host-visible transfer buffer, usable as copy source and destination
    pub fn staging(size: vk::DeviceSize) -> Self {
        Self::new(
            size,
            HOST_MEMORY,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::SharingMode::EXCLUSIVE,
            false,
        )
    }

    /// Device-local vertex buffer, filled through a staging copy
    pub fn vertex(size: vk::DeviceSize) -> Self {
        Self::new(
            size,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::SharingMode::EXCLUSIVE,
            false,
        )
    }

    /// Device-local index buffer, filled through a staging copy
    pub fn index(size: vk::DeviceSize) -> Self {
        Self::new(
            size,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::SharingMode::EXCLUSIVE,
            false,
        )
    }

    /// Host-visible uniform buffer, persistently mapped for per-frame updates
    pub fn uniform(size: vk::DeviceSize) -> Self {
        Self::new(
            size,
            HOST_MEMORY,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            true,
        )
    }
}

/// Index of the first memory type allowed by `type_bits` that has every flag
/// in `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, BackendError> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(BackendError::NoSuitableMemoryType {
            type_bits,
            properties,
        })
}

pub struct Buffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    mapped: Option<NonNull<u8>>,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create the buffer, allocate matching memory and bind it.
    pub fn new(device: Arc<VulkanDevice>, requirements: Requirements) -> Result<Self> {
        requirements.validate()?;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(requirements.size)
            .usage(requirements.usage)
            .sharing_mode(requirements.sharing_mode);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = match find_memory_type(
            &device.memory_properties,
            mem_requirements.memory_type_bits,
            requirements.properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        // From here on Drop releases both handles
        let mut this = Self {
            buffer,
            memory,
            size: requirements.size,
            usage: requirements.usage,
            memory_flags: device.memory_properties.memory_types[memory_type_index as usize]
                .property_flags,
            mapped: None,
            device,
        };

        unsafe { this.device.device.bind_buffer_memory(buffer, memory, 0) }
            .context("Failed to bind buffer memory")?;

        if requirements.keep_mapped {
            this.mapped = Some(this.map()?);
        }

        log::debug!(
            "Created buffer: {} bytes, {:?}, memory type {} ({:?})",
            this.size,
            this.usage,
            memory_type_index,
            this.memory_flags
        );

        Ok(this)
    }

    fn map(&self) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map buffer memory")?;

        NonNull::new(ptr.cast::<u8>()).context("Driver returned a null mapping")
    }

    fn unmap(&self) {
        unsafe { self.device.device.unmap_memory(self.memory) };
    }

    fn is_coherent(&self) -> bool {
        self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Run `f` on a host pointer to the memory, mapping transiently unless
    /// the buffer is kept mapped.
    fn with_mapping<T>(&self, f: impl FnOnce(NonNull<u8>) -> Result<T>) -> Result<T> {
        match self.mapped {
            Some(ptr) => f(ptr),
            None => {
                let ptr = self.map()?;
                let result = f(ptr);
                self.unmap();
                result
            }
        }
    }

    fn whole_range(&self) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build()
    }

    /// Copy `data` to the start of the buffer.
    pub fn fill(&self, data: &[u8]) -> Result<()> {
        let len = data.len() as vk::DeviceSize;
        if len > self.size {
            return Err(BackendError::BufferOverflow {
                len,
                size: self.size,
            }
            .into());
        }

        self.with_mapping(|ptr| {
            unsafe {
                ptr.as_ptr()
                    .copy_from_nonoverlapping(data.as_ptr(), data.len());
                if !self.is_coherent() {
                    self.device
                        .device
                        .flush_mapped_memory_ranges(&[self.whole_range()])?;
                }
            }
            Ok(())
        })
    }

    /// Copy a slice of plain-old-data values to the start of the buffer.
    pub fn fill_slice<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.fill(bytemuck::cast_slice(data))
    }

    /// Read the first `len` bytes back to the host.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        if len as vk::DeviceSize > self.size {
            return Err(BackendError::BufferOverflow {
                len: len as vk::DeviceSize,
                size: self.size,
            }
            .into());
        }

        self.with_mapping(|ptr| {
            let mut out = vec![0u8; len];
            unsafe {
                if !self.is_coherent() {
                    self.device
                        .device
                        .invalidate_mapped_memory_ranges(&[self.whole_range()])?;
                }
                out.as_mut_ptr()
                    .copy_from_nonoverlapping(ptr.as_ptr(), len);
            }
            Ok(out)
        })
    }

    /// Persistent host pointer, if the buffer was created with `keep_mapped`
    pub fn data(&self) -> Option<*mut u8> {
        self.mapped.map(NonNull::as_ptr)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Property flags of the memory type actually bound
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Copy the whole of `destination.size()` bytes from `source` using a
    /// one-shot submission on `transfer_queue`, blocking until it completes.
    ///
    /// `command_buffer` must come from a pool on the queue's family and not
    /// be in use; allocating and freeing it is up to the caller.
    pub fn copy(
        source: &Buffer,
        destination: &Buffer,
        command_buffer: vk::CommandBuffer,
        transfer_queue: vk::Queue,
    ) -> Result<()> {
        if destination.size > source.size {
            return Err(BackendError::BufferOverflow {
                len: destination.size,
                size: source.size,
            }
            .into());
        }

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: destination.size,
        };

        submit_one_shot(&source.device.device, command_buffer, transfer_queue, |device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, source.buffer, destination.buffer, &[region]);
        })
        .context("Buffer copy failed")
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.device.unmap_memory(self.memory);
            }
            self.device.device.free_memory(self.memory, None);
            self.device.device.destroy_buffer(self.buffer, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    fn typical_gpu() -> vk::PhysicalDeviceMemoryProperties {
        memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ])
    }

    #[test]
    fn picks_first_allowed_type_with_all_flags() {
        let props = typical_gpu();
        assert_eq!(find_memory_type(&props, 0b1111, HOST_MEMORY), Ok(1));
        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Ok(0)
        );
    }

    #[test]
    fn skips_types_outside_the_allowed_bits() {
        let props = typical_gpu();
        assert_eq!(find_memory_type(&props, 0b1100, HOST_MEMORY), Ok(2));
        assert_eq!(
            find_memory_type(&props, 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Ok(3)
        );
    }

    #[test]
    fn result_satisfies_bits_and_flags() {
        let props = typical_gpu();
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE;
        for bits in 1u32..16 {
            if let Ok(index) = find_memory_type(&props, bits, wanted) {
                assert_ne!(bits & (1 << index), 0);
                assert!(props.memory_types[index as usize].property_flags.contains(wanted));
            }
        }
    }

    #[test]
    fn no_match_is_an_unsupported_configuration() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b11, HOST_MEMORY),
            Err(BackendError::NoSuitableMemoryType {
                type_bits: 0b11,
                properties: HOST_MEMORY,
            })
        );
    }

    #[test]
    fn types_beyond_the_reported_count_are_ignored() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        props.memory_types[1].property_flags = HOST_MEMORY;
        assert!(find_memory_type(&props, 0b11, HOST_MEMORY).is_err());
    }

    #[test]
    fn presets_fix_usage_and_memory() {
        let staging = Requirements::staging(64);
        assert_eq!(staging.properties, HOST_MEMORY);
        assert!(staging.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(!staging.keep_mapped);

        let vertex = Requirements::vertex(64);
        assert_eq!(vertex.properties, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(
            vertex.usage,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );

        let index = Requirements::index(64);
        assert!(index.usage.contains(vk::BufferUsageFlags::INDEX_BUFFER));

        let uniform = Requirements::uniform(256);
        assert_eq!(uniform.size, 256);
        assert_eq!(uniform.usage, vk::BufferUsageFlags::UNIFORM_BUFFER);
        assert!(uniform.keep_mapped);

        for preset in [staging, vertex, index, uniform] {
            assert_eq!(preset.sharing_mode, vk::SharingMode::EXCLUSIVE);
        }
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        assert_eq!(Requirements::staging(0).validate(), Err(BackendError::EmptyBuffer));
        assert_eq!(Requirements::uniform(0).validate(), Err(BackendError::EmptyBuffer));
        assert_eq!(Requirements::vertex(1).validate(), Ok(()));
    }
}
