//! Creation descriptors for GPU resources

use ash::vk;
use bitflags::bitflags;

use super::format::Format;
use super::handles::ShaderModuleHandle;

/// Where resource memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    /// Device-local, not host visible; written through the staging ring
    #[default]
    Device,
    /// Host visible and coherent, persistently mapped
    HostVisible,
    /// Lazily allocated (transient attachments)
    Memoryless,
}

impl StorageType {
    /// Memory property flags requested for this storage
    pub fn memory_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::Device => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            Self::Memoryless => {
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED
            }
        }
    }
}

bitflags! {
    /// How a buffer will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u8 {
        /// Index buffer
        const INDEX = 1 << 0;
        /// Vertex buffer
        const VERTEX = 1 << 1;
        /// Uniform buffer
        const UNIFORM = 1 << 2;
        /// Storage buffer
        const STORAGE = 1 << 3;
        /// Indirect draw/dispatch arguments
        const INDIRECT = 1 << 4;
    }
}

bitflags! {
    /// How a texture will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u8 {
        /// Sampled in shaders
        const SAMPLED = 1 << 0;
        /// Storage image
        const STORAGE = 1 << 1;
        /// Color or depth/stencil attachment
        const ATTACHMENT = 1 << 2;
    }
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    /// Usage flags; must not be empty
    pub usage: BufferUsage,
    /// Memory placement
    pub storage: StorageType,
    /// Size in bytes
    pub size: usize,
    /// Initial contents
    pub data: Option<&'a [u8]>,
    /// Debug name
    pub debug_name: &'a str,
}

impl<'a> BufferDesc<'a> {
    /// Describe a buffer without initial contents
    pub fn new(usage: BufferUsage, storage: StorageType, size: usize) -> Self {
        Self {
            usage,
            storage,
            size,
            data: None,
            debug_name: "",
        }
    }

    /// Upload `data` right after creation
    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the debug name
    pub fn with_debug_name(mut self, name: &'a str) -> Self {
        self.debug_name = name;
        self
    }
}

/// Texture dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureType {
    /// 2D texture or 2D array
    #[default]
    Tex2D,
    /// Volume texture
    Tex3D,
    /// Cube map; each layer is six faces
    Cube,
}

/// Width, height and depth in texels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Depth
    pub depth: u32,
}

impl Dimensions {
    /// 3D dimensions
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    /// 2D dimensions (depth 1)
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self::new(width, height, 1)
    }

    /// Native extent
    pub const fn to_extent(self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }

    /// Dimensions of mip `level`, clamped to 1
    pub fn mip(self, level: u32) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth: (self.depth >> level).max(1),
        }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

/// Texture creation parameters
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    /// Dimensionality
    pub texture_type: TextureType,
    /// Texel format
    pub format: Format,
    /// Size of mip 0
    pub dimensions: Dimensions,
    /// Array layers (cube maps: number of cubes)
    pub num_layers: u32,
    /// MSAA sample count
    pub num_samples: u32,
    /// Usage; empty means sampled
    pub usage: TextureUsage,
    /// Mip levels; 0 is treated as 1
    pub num_mip_levels: u32,
    /// Memory placement
    pub storage: StorageType,
    /// Initial contents of mip 0 onwards
    pub data: Option<&'a [u8]>,
    /// How many mips `data` covers
    pub data_num_mip_levels: u32,
    /// Fill the remaining mips by blitting after the upload
    pub generate_mipmaps: bool,
    /// Debug name
    pub debug_name: &'a str,
}

impl<'a> TextureDesc<'a> {
    /// Describe a single-layer 2D texture
    pub fn new_2d(format: Format, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            texture_type: TextureType::Tex2D,
            format,
            dimensions: Dimensions::new_2d(width, height),
            num_layers: 1,
            num_samples: 1,
            usage,
            num_mip_levels: 1,
            storage: StorageType::Device,
            data: None,
            data_num_mip_levels: 1,
            generate_mipmaps: false,
            debug_name: "",
        }
    }

    /// Describe a volume texture
    pub fn new_3d(format: Format, dimensions: Dimensions, usage: TextureUsage) -> Self {
        Self {
            texture_type: TextureType::Tex3D,
            dimensions,
            ..Self::new_2d(format, dimensions.width, dimensions.height, usage)
        }
    }

    /// Describe a cube map
    pub fn new_cube(format: Format, size: u32, usage: TextureUsage) -> Self {
        Self {
            texture_type: TextureType::Cube,
            ..Self::new_2d(format, size, size, usage)
        }
    }

    /// Set the mip count
    pub fn with_mip_levels(mut self, num_mip_levels: u32) -> Self {
        self.num_mip_levels = num_mip_levels;
        self
    }

    /// Set the array layer count
    pub fn with_layers(mut self, num_layers: u32) -> Self {
        self.num_layers = num_layers;
        self
    }

    /// Set the MSAA sample count
    pub fn with_samples(mut self, num_samples: u32) -> Self {
        self.num_samples = num_samples;
        self
    }

    /// Set the memory placement
    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    /// Upload `data` covering `num_mip_levels` mips right after creation
    pub fn with_data(mut self, data: &'a [u8], num_mip_levels: u32) -> Self {
        self.data = Some(data);
        self.data_num_mip_levels = num_mip_levels;
        self
    }

    /// Generate the remaining mips after the initial upload
    pub fn with_generated_mipmaps(mut self) -> Self {
        self.generate_mipmaps = true;
        self
    }

    /// Set the debug name
    pub fn with_debug_name(mut self, name: &'a str) -> Self {
        self.debug_name = name;
        self
    }
}

/// Sub-region of a texture for upload and download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRangeDesc {
    /// Texel offset inside the mip
    pub offset: vk::Offset3D,
    /// Region size
    pub dimensions: Dimensions,
    /// First array layer
    pub layer: u32,
    /// Number of array layers
    pub num_layers: u32,
    /// First mip level
    pub mip_level: u32,
    /// Number of mip levels
    pub num_mip_levels: u32,
}

impl TextureRangeDesc {
    /// Whole mip 0, layer 0 of a texture of the given size
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            offset: vk::Offset3D::default(),
            dimensions,
            layer: 0,
            num_layers: 1,
            mip_level: 0,
            num_mip_levels: 1,
        }
    }

    /// Set the texel offset
    pub fn with_offset(mut self, x: i32, y: i32, z: i32) -> Self {
        self.offset = vk::Offset3D { x, y, z };
        self
    }

    /// Set the layer range
    pub fn with_layers(mut self, layer: u32, num_layers: u32) -> Self {
        self.layer = layer;
        self.num_layers = num_layers;
        self
    }

    /// Set the mip range
    pub fn with_mip_levels(mut self, mip_level: u32, num_mip_levels: u32) -> Self {
        self.mip_level = mip_level;
        self.num_mip_levels = num_mip_levels;
        self
    }
}

/// Sampler creation parameters
#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc<'a> {
    /// Minification filter
    pub min_filter: vk::Filter,
    /// Magnification filter
    pub mag_filter: vk::Filter,
    /// Mip filter
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// U addressing
    pub wrap_u: vk::SamplerAddressMode,
    /// V addressing
    pub wrap_v: vk::SamplerAddressMode,
    /// W addressing
    pub wrap_w: vk::SamplerAddressMode,
    /// Depth comparison, for shadow samplers
    pub compare_op: Option<vk::CompareOp>,
    /// Anisotropy; clamped to the device limit and ignored when unsupported
    pub max_anisotropy: Option<f32>,
    /// Lowest LOD
    pub min_lod: f32,
    /// Highest LOD
    pub max_lod: f32,
    /// Debug name
    pub debug_name: &'a str,
}

impl Default for SamplerDesc<'_> {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            wrap_u: vk::SamplerAddressMode::REPEAT,
            wrap_v: vk::SamplerAddressMode::REPEAT,
            wrap_w: vk::SamplerAddressMode::REPEAT,
            compare_op: None,
            max_anisotropy: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            debug_name: "",
        }
    }
}

/// Shader module creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ShaderModuleDesc<'a> {
    /// Pipeline stage the module is for
    pub stage: vk::ShaderStageFlags,
    /// SPIR-V bytes; length must be a multiple of 4
    pub spirv: &'a [u8],
    /// Debug name
    pub debug_name: &'a str,
}

impl<'a> ShaderModuleDesc<'a> {
    /// Describe a module from SPIR-V bytes
    pub fn new(stage: vk::ShaderStageFlags, spirv: &'a [u8]) -> Self {
        Self {
            stage,
            spirv,
            debug_name: "",
        }
    }

    /// Set the debug name
    pub fn with_debug_name(mut self, name: &'a str) -> Self {
        self.debug_name = name;
        self
    }
}

/// Compute pipeline creation parameters
#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    /// Compute shader
    pub shader: ShaderModuleHandle,
    /// Entry point name
    pub entry_point: String,
    /// Debug name
    pub debug_name: String,
}

impl ComputePipelineDesc {
    /// Describe a pipeline using the `main` entry point
    pub fn new(shader: ShaderModuleHandle) -> Self {
        Self {
            shader,
            entry_point: "main".to_string(),
            debug_name: String::new(),
        }
    }

    /// Set the debug name
    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }
}

/// One color attachment of a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachmentDesc {
    /// Attachment format
    pub format: Format,
    /// Standard alpha blending (`src_alpha`, `1 - src_alpha`)
    pub blend_enabled: bool,
}

impl ColorAttachmentDesc {
    /// Opaque attachment
    pub const fn new(format: Format) -> Self {
        Self {
            format,
            blend_enabled: false,
        }
    }
}

/// Render pipeline creation parameters (dynamic rendering, no render pass)
#[derive(Debug, Clone)]
pub struct RenderPipelineDesc {
    /// Vertex shader; required
    pub vertex_shader: ShaderModuleHandle,
    /// Fragment shader; required
    pub fragment_shader: ShaderModuleHandle,
    /// Vertex stage entry point
    pub vertex_entry_point: String,
    /// Fragment stage entry point
    pub fragment_entry_point: String,
    /// Vertex buffer bindings
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    /// Vertex attributes
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Color attachments
    pub color_attachments: Vec<ColorAttachmentDesc>,
    /// Depth attachment format
    pub depth_format: Option<Format>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Winding of front faces
    pub front_face: vk::FrontFace,
    /// Fill mode
    pub polygon_mode: vk::PolygonMode,
    /// MSAA sample count
    pub samples: u32,
    /// Debug name
    pub debug_name: String,
}

impl RenderPipelineDesc {
    /// Describe a pipeline with one color attachment and default state
    pub fn new(
        vertex_shader: ShaderModuleHandle,
        fragment_shader: ShaderModuleHandle,
        color_format: Format,
    ) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            vertex_entry_point: "main".to_string(),
            fragment_entry_point: "main".to_string(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            color_attachments: vec![ColorAttachmentDesc::new(color_format)],
            depth_format: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
            samples: 1,
            debug_name: String::new(),
        }
    }

    /// Set the depth attachment format
    pub fn with_depth_format(mut self, format: Format) -> Self {
        self.depth_format = Some(format);
        self
    }

    /// Set the debug name
    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }
}

/// Clamp a sample count to a native flag (rounds down to a power of two)
pub fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2..=3 => vk::SampleCountFlags::TYPE_2,
        4..=7 => vk::SampleCountFlags::TYPE_4,
        8..=15 => vk::SampleCountFlags::TYPE_8,
        16..=31 => vk::SampleCountFlags::TYPE_16,
        32..=63 => vk::SampleCountFlags::TYPE_32,
        _ => vk::SampleCountFlags::TYPE_64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_memory_flags() {
        assert_eq!(StorageType::Device.memory_flags(), vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let host_visible =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert!(StorageType::HostVisible.memory_flags().contains(host_visible));
        assert!(StorageType::Memoryless
            .memory_flags()
            .contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED));
    }

    #[test]
    fn test_mip_dimensions_clamp() {
        let dims = Dimensions::new(64, 16, 1);
        assert_eq!(dims.mip(2), Dimensions::new(16, 4, 1));
        assert_eq!(dims.mip(6), Dimensions::new(1, 1, 1));
    }

    #[test]
    fn test_sample_counts() {
        assert_eq!(sample_count_flags(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(sample_count_flags(6), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn test_texture_desc_builders() {
        let desc = TextureDesc::new_cube(Format::Rgba8Unorm, 32, TextureUsage::SAMPLED)
            .with_mip_levels(6)
            .with_debug_name("sky");
        assert_eq!(desc.texture_type, TextureType::Cube);
        assert_eq!(desc.dimensions, Dimensions::new_2d(32, 32));
        assert_eq!(desc.num_mip_levels, 6);
        assert_eq!(desc.debug_name, "sky");
    }
}
