//! 资源类型模型
//!
//! 所有资源共享同一份属性记录 [`GfxResource`]，变体相关的尺寸与格式放在
//! [`GfxResourceKind`] 中，通过 `match` 访问。

use ash::vk;

use ember_gfx::handles::{DescriptorHandle, NativeResource};
use ember_gfx::resources::resource_desc::{GfxHeapType, GfxResourceDesc};
use ember_gfx::resources::resource_state::GfxResourceState;

use crate::handles::GfxHeapHandle;

/// 资源的底层内存来源
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxBacking {
    /// 独占一块内存
    Committed,
    /// 放置在共享 heap 中
    Placed { heap: GfxHeapHandle, offset: u64 },
    /// 外部创建（例如 swapchain image），核心不负责销毁
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxResourceKind {
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

impl From<&GfxResourceDesc> for GfxResourceKind {
    fn from(desc: &GfxResourceDesc) -> Self {
        match *desc {
            GfxResourceDesc::Buffer { size } => Self::Buffer { size },
            GfxResourceDesc::Texture1D {
                width,
                array_count,
                format,
            } => Self::Texture1D {
                width,
                array_count,
                format,
            },
            GfxResourceDesc::Texture2D {
                width,
                height,
                array_count,
                mip_levels,
                format,
            } => Self::Texture2D {
                width,
                height,
                array_count,
                mip_levels,
                format,
            },
            GfxResourceDesc::Texture3D {
                width,
                height,
                depth,
                format,
            } => Self::Texture3D {
                width,
                height,
                depth,
                format,
            },
            GfxResourceDesc::TextureCube { width, height, format } => Self::TextureCube { width, height, format },
        }
    }
}

/// 引擎层资源
///
/// residency 标记只由 MemoryManager / ResidencyQueue 修改；对外只读。
#[derive(Clone, Debug)]
pub struct GfxResource {
    pub(crate) native: NativeResource,
    pub(crate) backing: GfxBacking,
    pub(crate) heap_type: GfxHeapType,
    pub(crate) kind: GfxResourceKind,
    pub(crate) view: Option<DescriptorHandle>,
    pub(crate) resident: bool,
    /// 对齐后实际占用的字节数
    pub(crate) allocation_size: u64,
    /// 上一帧结束时的状态，作为下一帧的入口状态
    pub(crate) state: GfxResourceState,
    pub(crate) last_used_frame: Option<u64>,
    pub(crate) essential: bool,
    /// 创建序号，LRU 相同时用来打破平局
    pub(crate) seq: u64,
    pub(crate) name: String,
}

// getters
impl GfxResource {
    #[inline]
    pub fn native(&self) -> NativeResource {
        self.native
    }

    #[inline]
    pub fn backing(&self) -> GfxBacking {
        self.backing
    }

    #[inline]
    pub fn heap_type(&self) -> GfxHeapType {
        self.heap_type
    }

    #[inline]
    pub fn kind(&self) -> &GfxResourceKind {
        &self.kind
    }

    #[inline]
    pub fn view(&self) -> Option<DescriptorHandle> {
        self.view
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.resident
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.backing, GfxBacking::External)
    }

    #[inline]
    pub fn allocation_size(&self) -> u64 {
        self.allocation_size
    }

    #[inline]
    pub fn state(&self) -> GfxResourceState {
        self.state
    }

    #[inline]
    pub fn last_used_frame(&self) -> Option<u64> {
        self.last_used_frame
    }

    #[inline]
    pub fn is_essential(&self) -> bool {
        self.essential
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 参与驻留预算的字节数；外部资源不计入
    #[inline]
    pub(crate) fn budget_bytes(&self) -> u64 {
        if self.is_external() { 0 } else { self.allocation_size }
    }
}

// 变体相关的 getters
impl GfxResource {
    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, GfxResourceKind::Buffer { .. })
    }

    /// buffer 的字节数
    pub fn size(&self) -> Option<u64> {
        match self.kind {
            GfxResourceKind::Buffer { size } => Some(size),
            _ => None,
        }
    }

    pub fn width(&self) -> Option<u64> {
        match self.kind {
            GfxResourceKind::Buffer { .. } => None,
            GfxResourceKind::Texture1D { width, .. }
            | GfxResourceKind::Texture2D { width, .. }
            | GfxResourceKind::Texture3D { width, .. }
            | GfxResourceKind::TextureCube { width, .. } => Some(width),
        }
    }

    pub fn height(&self) -> Option<u64> {
        match self.kind {
            GfxResourceKind::Texture2D { height, .. }
            | GfxResourceKind::Texture3D { height, .. }
            | GfxResourceKind::TextureCube { height, .. } => Some(height),
            _ => None,
        }
    }

    pub fn depth(&self) -> Option<u16> {
        match self.kind {
            GfxResourceKind::Texture3D { depth, .. } => Some(depth),
            _ => None,
        }
    }

    pub fn array_count(&self) -> Option<u16> {
        match self.kind {
            GfxResourceKind::Texture1D { array_count, .. } | GfxResourceKind::Texture2D { array_count, .. } => {
                Some(array_count)
            }
            GfxResourceKind::TextureCube { .. } => Some(6),
            _ => None,
        }
    }

    pub fn format(&self) -> Option<vk::Format> {
        match self.kind {
            GfxResourceKind::Buffer { .. } => None,
            GfxResourceKind::Texture1D { format, .. }
            | GfxResourceKind::Texture2D { format, .. }
            | GfxResourceKind::Texture3D { format, .. }
            | GfxResourceKind::TextureCube { format, .. } => Some(format),
        }
    }
}
