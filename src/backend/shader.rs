// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Shaders are compiled ahead of time
// (build.rs runs glslc) and handed over as opaque byte blobs.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use super::VulkanDevice;

/// Supplies the vertex and fragment stage bytecode
pub trait ShaderSource {
    fn vertex_spirv(&self) -> Result<Vec<u8>>;
    fn fragment_spirv(&self) -> Result<Vec<u8>>;
}

/// SPIR-V files on disk
#[derive(Debug, Clone)]
pub struct SpirvFiles {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl SpirvFiles {
    pub fn new(vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }
}

impl ShaderSource for SpirvFiles {
    fn vertex_spirv(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.vertex)
            .with_context(|| format!("Failed to read vertex shader {:?}", self.vertex))
    }

    fn fragment_spirv(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.fragment)
            .with_context(|| format!("Failed to read fragment shader {:?}", self.fragment))
    }
}

/// Bytecode already in memory
#[derive(Debug, Clone)]
pub struct SpirvBytes {
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
}

impl ShaderSource for SpirvBytes {
    fn vertex_spirv(&self) -> Result<Vec<u8>> {
        Ok(self.vertex.clone())
    }

    fn fragment_spirv(&self) -> Result<Vec<u8>> {
        Ok(self.fragment.clone())
    }
}

/// Reinterpret bytecode as properly aligned 32-bit words.
///
/// Fails when the length is not a multiple of four. Byte-swapped modules are
/// corrected based on the magic number.
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V bytecode")
}

/// Shader module that lives only as long as pipeline creation needs it
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: Arc<VulkanDevice>, bytes: &[u8]) -> Result<Self> {
        let code = decode_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0x03, 0x02, 0x23, 0x07];

    #[test]
    fn decodes_little_endian_words() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = decode_spirv(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn swaps_big_endian_modules() {
        let mut bytes = vec![0x07, 0x23, 0x02, 0x03];
        bytes.extend_from_slice(&0x0001_0000u32.to_be_bytes());

        let words = decode_spirv(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_bytecode() {
        let mut bytes = MAGIC.to_vec();
        bytes.push(0);
        assert!(decode_spirv(&bytes).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let files = SpirvFiles::new("does/not/exist.vert.spv", "does/not/exist.frag.spv");
        let err = files.vertex_spirv().unwrap_err();
        assert!(format!("{:#}", err).contains("does/not/exist.vert.spv"));
    }

    #[test]
    fn in_memory_source_returns_its_blobs() {
        let source = SpirvBytes {
            vertex: MAGIC.to_vec(),
            fragment: vec![],
        };
        assert_eq!(source.vertex_spirv().unwrap(), MAGIC.to_vec());
        assert!(source.fragment_spirv().unwrap().is_empty());
    }
}
