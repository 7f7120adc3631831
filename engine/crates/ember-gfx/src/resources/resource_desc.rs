//! 资源描述
//!
//! Buffer 与四种 Texture 变体共用同一个描述枚举，通过 match 区分。

use ash::vk;

use crate::resources::format::texel_size;
use crate::resources::resource_state::GfxResourceState;

/// placed 资源在 heap 内的默认对齐
pub const PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// 资源的格式与尺寸描述
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxResourceDesc {
    /// 顶点/索引缓冲区
    Buffer { size: u64 },
    Texture1D {
        width: u64,
        array_count: u16,
        format: vk::Format,
    },
    Texture2D {
        width: u64,
        height: u64,
        array_count: u16,
        mip_levels: u16,
        format: vk::Format,
    },
    Texture3D {
        width: u64,
        height: u64,
        depth: u16,
        format: vk::Format,
    },
    TextureCube {
        width: u64,
        height: u64,
        format: vk::Format,
    },
}

// new
impl GfxResourceDesc {
    #[inline]
    pub fn buffer(size: u64) -> Self {
        Self::Buffer { size }
    }

    #[inline]
    pub fn texture_1d(width: u64, format: vk::Format) -> Self {
        Self::Texture1D {
            width,
            array_count: 1,
            format,
        }
    }

    #[inline]
    pub fn texture_2d(width: u64, height: u64, format: vk::Format) -> Self {
        Self::Texture2D {
            width,
            height,
            array_count: 1,
            mip_levels: 1,
            format,
        }
    }

    #[inline]
    pub fn texture_3d(width: u64, height: u64, depth: u16, format: vk::Format) -> Self {
        Self::Texture3D {
            width,
            height,
            depth,
            format,
        }
    }

    #[inline]
    pub fn texture_cube(width: u64, height: u64, format: vk::Format) -> Self {
        Self::TextureCube { width, height, format }
    }
}

// getters
impl GfxResourceDesc {
    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer { .. })
    }

    /// texture 的格式；buffer 返回 None
    pub fn format(&self) -> Option<vk::Format> {
        match *self {
            Self::Buffer { .. } => None,
            Self::Texture1D { format, .. }
            | Self::Texture2D { format, .. }
            | Self::Texture3D { format, .. }
            | Self::TextureCube { format, .. } => Some(format),
        }
    }

    /// 资源内容占用的字节数（未对齐）
    pub fn byte_size(&self) -> u64 {
        match *self {
            Self::Buffer { size } => size,
            Self::Texture1D {
                width,
                array_count,
                format,
            } => width * array_count.max(1) as u64 * texel_size(format),
            Self::Texture2D {
                width,
                height,
                array_count,
                mip_levels,
                format,
            } => {
                // 逐级累加 mip chain
                let mut total = 0;
                let (mut w, mut h) = (width.max(1), height.max(1));
                for _ in 0..mip_levels.max(1) {
                    total += w * h;
                    w = (w / 2).max(1);
                    h = (h / 2).max(1);
                }
                total * array_count.max(1) as u64 * texel_size(format)
            }
            Self::Texture3D {
                width,
                height,
                depth,
                format,
            } => width * height * depth.max(1) as u64 * texel_size(format),
            Self::TextureCube { width, height, format } => 6 * width * height * texel_size(format),
        }
    }

    /// 按 placement 对齐之后，在 heap 中实际占用的字节数
    #[inline]
    pub fn allocation_size(&self) -> u64 {
        align_up(self.byte_size().max(1), PLACEMENT_ALIGNMENT)
    }
}

/// heap 的内存类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum GfxHeapType {
    /// 仅 GPU 可见
    #[default]
    Default,
    /// CPU 可写，用于上传
    Upload,
    /// CPU 可读，用于回读
    Readback,
}

impl GfxHeapType {
    /// CPU 是否可以映射这类内存
    #[inline]
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, Self::Default)
    }
}

/// heap 创建信息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxHeapDesc {
    pub size: u64,
    pub heap_type: GfxHeapType,
    pub alignment: u64,
}

/// 资源分配请求
#[derive(Clone, Debug)]
pub struct GfxAllocationInfo {
    pub desc: GfxResourceDesc,
    pub heap_type: GfxHeapType,
    pub initial_state: GfxResourceState,
    pub debug_name: String,
}

impl GfxAllocationInfo {
    pub fn new(desc: GfxResourceDesc, debug_name: impl Into<String>) -> Self {
        Self {
            desc,
            heap_type: GfxHeapType::Default,
            initial_state: GfxResourceState::COMMON,
            debug_name: debug_name.into(),
        }
    }

    #[inline]
    pub fn heap_type(mut self, heap_type: GfxHeapType) -> Self {
        self.heap_type = heap_type;
        self
    }

    #[inline]
    pub fn initial_state(mut self, state: GfxResourceState) -> Self {
        self.initial_state = state;
        self
    }
}
