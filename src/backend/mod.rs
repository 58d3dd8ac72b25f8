// Vulkan backend - GPU object wrappers, one module per object.
// Every wrapper owns its handle exclusively and releases it on drop.

pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{Buffer, Requirements};
pub use command::CommandPool;
pub use device::{QueueFamilyIndices, QueueFamilyPolicy, VulkanDevice};
pub use error::BackendError;
pub use instance::{BootstrapConfig, Instance};
pub use pipeline::{Framebuffers, GraphicsPipeline, RenderPass};
pub use shader::{ShaderModule, ShaderSource, SpirvFiles};
pub use surface::{Surface, SwapChainSupportDetails};
pub use swapchain::Swapchain;
pub use sync::FrameSync;
