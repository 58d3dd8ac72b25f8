// Typed backend failures
//
// Every variant is fatal: nothing in the backend retries. Functions return
// anyhow::Result and raise these, so callers can downcast to inspect the kind.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A required layer is absent from the enumerated list
    #[error("missing required layer {0}")]
    MissingLayer(String),

    /// A required extension is absent from the enumerated list
    #[error("missing required extension {0}")]
    MissingExtension(String),

    #[error("no Vulkan-capable GPU found")]
    NoPhysicalDevice,

    #[error("cannot find queues for both graphics and present")]
    IncompleteQueueFamilies,

    #[error("surface reports no supported formats")]
    NoSurfaceFormat,

    #[error("no memory type matches type bits {type_bits:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// A frame operation returned anything other than VK_SUCCESS
    #[error("{operation} returned {result}")]
    Operation {
        operation: &'static str,
        result: vk::Result,
    },

    #[error("buffer size must be non-zero")]
    EmptyBuffer,

    #[error("write of {len} bytes exceeds buffer size {size}")]
    BufferOverflow { len: u64, size: u64 },
}

impl BackendError {
    pub fn operation(operation: &'static str, result: vk::Result) -> Self {
        Self::Operation { operation, result }
    }
}
