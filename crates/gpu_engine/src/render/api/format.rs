//! Texture formats and their memory footprint

use ash::vk;

/// Texture formats understood by the engine
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R16Uint,
    R16Unorm,
    R16Float,
    Rg8Unorm,
    R32Float,
    Rg16Uint,
    Rg16Unorm,
    Rg16Float,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rg32Float,
    Rgba16Float,
    Rgba32Uint,
    Rgba32Float,
    Etc2Rgb8,
    Etc2Srgb8,
    Bc7Rgba,
    Z16Unorm,
    Z24Unorm,
    Z32Float,
    Z24UnormS8Uint,
    Z32FloatS8Uint,
}

/// Block layout of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatProperties {
    /// Bytes per texel, or per block for compressed formats
    pub bytes_per_block: u32,
    /// Block width in texels
    pub block_width: u32,
    /// Block height in texels
    pub block_height: u32,
    /// Block-compressed format
    pub compressed: bool,
    /// Has a depth aspect
    pub depth: bool,
    /// Has a stencil aspect
    pub stencil: bool,
}

impl FormatProperties {
    const fn color(bytes_per_block: u32) -> Self {
        Self {
            bytes_per_block,
            block_width: 1,
            block_height: 1,
            compressed: false,
            depth: false,
            stencil: false,
        }
    }

    const fn compressed(bytes_per_block: u32) -> Self {
        Self {
            bytes_per_block,
            block_width: 4,
            block_height: 4,
            compressed: true,
            depth: false,
            stencil: false,
        }
    }

    const fn depth(bytes_per_block: u32, stencil: bool) -> Self {
        Self {
            bytes_per_block,
            block_width: 1,
            block_height: 1,
            compressed: false,
            depth: true,
            stencil,
        }
    }
}

impl Format {
    /// Every format, in declaration order
    pub const ALL: [Self; 25] = [
        Self::R8Unorm,
        Self::R16Uint,
        Self::R16Unorm,
        Self::R16Float,
        Self::Rg8Unorm,
        Self::R32Float,
        Self::Rg16Uint,
        Self::Rg16Unorm,
        Self::Rg16Float,
        Self::Rgba8Unorm,
        Self::Rgba8Srgb,
        Self::Bgra8Unorm,
        Self::Bgra8Srgb,
        Self::Rg32Float,
        Self::Rgba16Float,
        Self::Rgba32Uint,
        Self::Rgba32Float,
        Self::Etc2Rgb8,
        Self::Etc2Srgb8,
        Self::Bc7Rgba,
        Self::Z16Unorm,
        Self::Z24Unorm,
        Self::Z32Float,
        Self::Z24UnormS8Uint,
        Self::Z32FloatS8Uint,
    ];

    /// Block layout of this format
    pub const fn properties(self) -> FormatProperties {
        match self {
            Self::R8Unorm => FormatProperties::color(1),
            Self::R16Uint | Self::R16Unorm | Self::R16Float | Self::Rg8Unorm => {
                FormatProperties::color(2)
            }
            Self::R32Float
            | Self::Rg16Uint
            | Self::Rg16Unorm
            | Self::Rg16Float
            | Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::Bgra8Srgb => FormatProperties::color(4),
            Self::Rg32Float | Self::Rgba16Float => FormatProperties::color(8),
            Self::Rgba32Uint | Self::Rgba32Float => FormatProperties::color(16),
            Self::Etc2Rgb8 | Self::Etc2Srgb8 => FormatProperties::compressed(8),
            Self::Bc7Rgba => FormatProperties::compressed(16),
            Self::Z16Unorm => FormatProperties::depth(2, false),
            Self::Z24Unorm => FormatProperties::depth(3, false),
            Self::Z32Float => FormatProperties::depth(4, false),
            Self::Z24UnormS8Uint => FormatProperties::depth(4, true),
            Self::Z32FloatS8Uint => FormatProperties::depth(5, true),
        }
    }

    /// Bytes occupied by one layer of mip `level` of a `width` x `height` image
    ///
    /// Saturates at `u64::MAX`.
    pub const fn bytes_per_layer(self, width: u32, height: u32, level: u32) -> u64 {
        let props = self.properties();
        let level_width = max1(width >> level);
        let level_height = max1(height >> level);

        let (columns, rows) = if props.compressed {
            (
                level_width.div_ceil(props.block_width),
                level_height.div_ceil(props.block_height),
            )
        } else {
            (level_width, level_height)
        };
        (columns as u64)
            .saturating_mul(rows as u64)
            .saturating_mul(props.bytes_per_block as u64)
    }

    /// True for formats with a depth or stencil aspect
    pub const fn is_depth_or_stencil(self) -> bool {
        let props = self.properties();
        props.depth || props.stencil
    }

    /// Image aspects a view of this format covers
    pub fn aspect_flags(self) -> vk::ImageAspectFlags {
        let props = self.properties();
        if props.depth && props.stencil {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else if props.depth {
            vk::ImageAspectFlags::DEPTH
        } else if props.stencil {
            vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    /// Native format
    pub const fn to_vk(self) -> vk::Format {
        match self {
            Self::R8Unorm => vk::Format::R8_UNORM,
            Self::R16Uint => vk::Format::R16_UINT,
            Self::R16Unorm => vk::Format::R16_UNORM,
            Self::R16Float => vk::Format::R16_SFLOAT,
            Self::Rg8Unorm => vk::Format::R8G8_UNORM,
            Self::R32Float => vk::Format::R32_SFLOAT,
            Self::Rg16Uint => vk::Format::R16G16_UINT,
            Self::Rg16Unorm => vk::Format::R16G16_UNORM,
            Self::Rg16Float => vk::Format::R16G16_SFLOAT,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::Rg32Float => vk::Format::R32G32_SFLOAT,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::Etc2Rgb8 => vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
            Self::Etc2Srgb8 => vk::Format::ETC2_R8G8B8_SRGB_BLOCK,
            Self::Bc7Rgba => vk::Format::BC7_UNORM_BLOCK,
            Self::Z16Unorm => vk::Format::D16_UNORM,
            Self::Z24Unorm => vk::Format::X8_D24_UNORM_PACK32,
            Self::Z32Float => vk::Format::D32_SFLOAT,
            Self::Z24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            Self::Z32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }

    /// Engine format for a native one
    pub fn from_vk(format: vk::Format) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.to_vk() == format)
    }
}

const fn max1(value: u32) -> u32 {
    if value == 0 { 1 } else { value }
}

/// Pick a depth format from `supported` that is closest to `requested`
///
/// Candidates with the same stencil presence are preferred; among those the
/// requested format wins, then wider depth.
pub fn closest_depth_stencil_format(requested: Format, supported: &[Format]) -> Option<Format> {
    if supported.contains(&requested) {
        return Some(requested);
    }

    let wants_stencil = requested.properties().stencil;
    let preference: &[Format] = if wants_stencil {
        &[
            Format::Z24UnormS8Uint,
            Format::Z32FloatS8Uint,
            Format::Z32Float,
            Format::Z24Unorm,
            Format::Z16Unorm,
        ]
    } else {
        &[
            Format::Z32Float,
            Format::Z24Unorm,
            Format::Z16Unorm,
            Format::Z24UnormS8Uint,
            Format::Z32FloatS8Uint,
        ]
    };

    preference.iter().copied().find(|f| supported.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_bytes_per_layer() {
        assert_eq!(Format::Rgba8Unorm.bytes_per_layer(256, 128, 0), 256 * 128 * 4);
        assert_eq!(Format::Rgba8Unorm.bytes_per_layer(256, 128, 1), 128 * 64 * 4);
        assert_eq!(Format::R8Unorm.bytes_per_layer(4, 4, 5), 1);
        assert_eq!(Format::Rgba32Float.bytes_per_layer(3, 1, 0), 48);
    }

    #[test]
    fn test_compressed_bytes_per_layer_rounds_to_blocks() {
        // 10x6 -> 3x2 blocks
        assert_eq!(Format::Bc7Rgba.bytes_per_layer(10, 6, 0), 3 * 2 * 16);
        assert_eq!(Format::Etc2Rgb8.bytes_per_layer(10, 6, 0), 3 * 2 * 8);
        // A 1x1 mip still occupies a whole block
        assert_eq!(Format::Bc7Rgba.bytes_per_layer(64, 64, 6), 16);
    }

    #[test]
    fn test_bytes_per_layer_past_u32() {
        assert_eq!(Format::Rgba8Unorm.bytes_per_layer(65536, 16384, 0), 1 << 32);
        assert_eq!(Format::Rgba32Float.bytes_per_layer(u32::MAX, u32::MAX, 0), u64::MAX);
    }

    #[test]
    fn test_vk_mapping_is_bijective() {
        for format in Format::ALL {
            assert_eq!(Format::from_vk(format.to_vk()), Some(format));
        }
        assert_eq!(Format::from_vk(vk::Format::UNDEFINED), None);
    }

    #[test]
    fn test_aspects() {
        assert_eq!(Format::Rgba8Unorm.aspect_flags(), vk::ImageAspectFlags::COLOR);
        assert_eq!(Format::Z32Float.aspect_flags(), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            Format::Z24UnormS8Uint.aspect_flags(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert!(Format::Z16Unorm.is_depth_or_stencil());
        assert!(!Format::Bc7Rgba.is_depth_or_stencil());
    }

    #[test]
    fn test_closest_depth_format() {
        let supported = [Format::Z32Float, Format::Z32FloatS8Uint];
        assert_eq!(
            closest_depth_stencil_format(Format::Z32Float, &supported),
            Some(Format::Z32Float)
        );
        assert_eq!(
            closest_depth_stencil_format(Format::Z24UnormS8Uint, &supported),
            Some(Format::Z32FloatS8Uint)
        );
        assert_eq!(
            closest_depth_stencil_format(Format::Z16Unorm, &supported),
            Some(Format::Z32Float)
        );
        assert_eq!(closest_depth_stencil_format(Format::Z16Unorm, &[]), None);
    }
}
