/// Texel/element formats understood by the resource layer.
///
/// This is the subset the engine's materials and render targets actually use; `Unknown` doubles
/// as "no format" (e.g. no depth buffer, or a reflected binding that accepts any format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Unknown,
    R8G8B8A8Typeless,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Typeless,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R10G10B10A2Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32G32B32Float,
    R32G32Float,
    R32Typeless,
    R32Float,
    R32Uint,
    R16Uint,
    R24G8Typeless,
    D24UnormS8Uint,
    D32Float,
}

impl Format {
    /// Typeless family representative; views may reinterpret formats within a family.
    pub fn typeless(self) -> Format {
        match self {
            Format::R8G8B8A8Typeless | Format::R8G8B8A8Unorm | Format::R8G8B8A8UnormSrgb => {
                Format::R8G8B8A8Typeless
            }
            Format::B8G8R8A8Typeless | Format::B8G8R8A8Unorm | Format::B8G8R8A8UnormSrgb => {
                Format::B8G8R8A8Typeless
            }
            Format::R32Typeless | Format::R32Float | Format::R32Uint | Format::D32Float => {
                Format::R32Typeless
            }
            Format::R24G8Typeless | Format::D24UnormS8Uint => Format::R24G8Typeless,
            other => other,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32Float)
    }

    /// Size of one element in bytes, if the format has a fixed element size.
    pub fn byte_size(self) -> Option<u32> {
        match self {
            Format::Unknown => None,
            Format::R16Uint => Some(2),
            Format::R8G8B8A8Typeless
            | Format::R8G8B8A8Unorm
            | Format::R8G8B8A8UnormSrgb
            | Format::B8G8R8A8Typeless
            | Format::B8G8R8A8Unorm
            | Format::B8G8R8A8UnormSrgb
            | Format::R10G10B10A2Unorm
            | Format::R32Typeless
            | Format::R32Float
            | Format::R32Uint
            | Format::R24G8Typeless
            | Format::D24UnormS8Uint
            | Format::D32Float => Some(4),
            Format::R16G16B16A16Float | Format::R32G32Float => Some(8),
            Format::R32G32B32Float => Some(12),
            Format::R32G32B32A32Float => Some(16),
        }
    }

    /// Whether a view of format `self` satisfies a shader expecting `expected`.
    pub fn is_compatible_with(self, expected: Format) -> bool {
        expected == Format::Unknown || self == expected || self.typeless() == expected.typeless()
    }
}

/// How a view interprets its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ViewDimension {
    #[default]
    Unknown,
    Buffer,
    Texture1D,
    Texture1DArray,
    Texture2D,
    Texture2DArray,
    Texture2DMs,
    Texture3D,
    TextureCube,
    TextureCubeArray,
}

/// Identifies a structured/constant buffer layout so a bound buffer can be checked against the
/// layout a shader was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferLayoutId(pub u32);
