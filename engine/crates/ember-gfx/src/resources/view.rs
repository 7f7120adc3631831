//! 资源视图描述

use ash::vk;

bitflags::bitflags! {
    /// 资源允许的使用方式，决定可以创建哪些视图
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct GfxResourceUsage: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const VERTEX_BUFFER = 1 << 4;
        const INDEX_BUFFER = 1 << 5;
        const TRANSFER_SRC = 1 << 6;
        const TRANSFER_DST = 1 << 7;
    }
}

/// 视图类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxViewDesc {
    /// 顶点/索引缓冲区视图
    Buffer { offset: u64, size: u64, stride: u32 },
    ShaderResource { format: vk::Format },
    RenderTarget { format: vk::Format },
    DepthStencil { format: vk::Format },
    UnorderedAccess { format: vk::Format },
}

impl GfxViewDesc {
    /// 该视图要求资源具备的 usage
    pub fn required_usage(&self) -> GfxResourceUsage {
        match self {
            Self::Buffer { .. } => GfxResourceUsage::VERTEX_BUFFER | GfxResourceUsage::INDEX_BUFFER,
            Self::ShaderResource { .. } => GfxResourceUsage::SHADER_RESOURCE,
            Self::RenderTarget { .. } => GfxResourceUsage::RENDER_TARGET,
            Self::DepthStencil { .. } => GfxResourceUsage::DEPTH_STENCIL,
            Self::UnorderedAccess { .. } => GfxResourceUsage::UNORDERED_ACCESS,
        }
    }
}
