//! 录制好的命令列表
//!
//! 核心把每一帧的工作录制成 [`GfxCommand`] 序列，最终交给
//! [`GfxDevice::execute_command_lists`](crate::device::GfxDevice::execute_command_lists) 执行。

use itertools::Itertools;

use crate::handles::{NativeCommandAllocator, NativeCommandList, NativeResource};
use crate::resources::resource_state::GfxResourceState;

/// 命令列表类型，每种类型在每个 frame slot 中有自己的 allocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum GfxCommandListType {
    #[default]
    Graphics,
    Compute,
    Copy,
}

impl GfxCommandListType {
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Compute, Self::Copy];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// 资源状态转换
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxResourceBarrier {
    pub resource: NativeResource,
    pub before: GfxResourceState,
    pub after: GfxResourceState,
}

impl GfxResourceBarrier {
    #[inline]
    pub fn new(resource: NativeResource, before: GfxResourceState, after: GfxResourceState) -> Self {
        Self {
            resource,
            before,
            after,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GfxCommand {
    Barrier(Vec<GfxResourceBarrier>),
    BeginLabel(String),
    EndLabel,
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_buffer: NativeResource,
        vertex_buffer: NativeResource,
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: NativeResource,
        src_offset: u64,
        dst: NativeResource,
        dst_offset: u64,
        size: u64,
    },
    CopyTexture {
        src: NativeResource,
        dst: NativeResource,
    },
    ClearRenderTarget {
        target: NativeResource,
        color: [f32; 4],
    },
}

impl GfxCommand {
    /// 命令直接访问的资源
    pub fn resources(&self) -> Vec<NativeResource> {
        match self {
            Self::Barrier(barriers) => barriers.iter().map(|b| b.resource).collect(),
            Self::DrawIndexed {
                index_buffer,
                vertex_buffer,
                ..
            } => vec![*index_buffer, *vertex_buffer],
            Self::CopyBuffer { src, dst, .. } | Self::CopyTexture { src, dst } => vec![*src, *dst],
            Self::ClearRenderTarget { target, .. } => vec![*target],
            Self::BeginLabel(_) | Self::EndLabel | Self::Draw { .. } | Self::Dispatch { .. } => vec![],
        }
    }
}

/// 一个正在录制或已经关闭的命令列表
#[derive(Debug)]
pub struct GfxCommandList {
    native: NativeCommandList,
    allocator: NativeCommandAllocator,
    list_type: GfxCommandListType,
    commands: Vec<GfxCommand>,
    /// 通过 pass 声明引用的资源（不一定出现在具体命令中）
    referenced: Vec<NativeResource>,
    closed: bool,
    debug_name: String,
}

// new & init
impl GfxCommandList {
    pub fn new(
        native: NativeCommandList,
        allocator: NativeCommandAllocator,
        list_type: GfxCommandListType,
        debug_name: impl Into<String>,
    ) -> Self {
        Self {
            native,
            allocator,
            list_type,
            commands: Vec::new(),
            referenced: Vec::new(),
            closed: false,
            debug_name: debug_name.into(),
        }
    }
}

// getters
impl GfxCommandList {
    #[inline]
    pub fn native(&self) -> NativeCommandList {
        self.native
    }

    #[inline]
    pub fn allocator(&self) -> NativeCommandAllocator {
        self.allocator
    }

    #[inline]
    pub fn list_type(&self) -> GfxCommandListType {
        self.list_type
    }

    #[inline]
    pub fn commands(&self) -> &[GfxCommand] {
        &self.commands
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// 该命令列表执行时必须驻留的全部资源
    pub fn referenced_resources(&self) -> Vec<NativeResource> {
        self.commands
            .iter()
            .flat_map(GfxCommand::resources)
            .chain(self.referenced.iter().copied())
            .filter(|r| !r.is_null())
            .unique()
            .collect()
    }

    /// barrier 数量（按单个资源计）
    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .map(|c| match c {
                GfxCommand::Barrier(b) => b.len(),
                _ => 0,
            })
            .sum()
    }
}

// 录制
impl GfxCommandList {
    #[inline]
    fn push(&mut self, command: GfxCommand) {
        debug_assert!(!self.closed, "recording into closed command list {}", self.debug_name);
        self.commands.push(command);
    }

    pub fn resource_barriers(&mut self, barriers: &[GfxResourceBarrier]) {
        if barriers.is_empty() {
            return;
        }
        self.push(GfxCommand::Barrier(barriers.to_vec()));
    }

    pub fn begin_label(&mut self, label: &str) {
        self.push(GfxCommand::BeginLabel(label.to_string()));
    }

    pub fn end_label(&mut self) {
        self.push(GfxCommand::EndLabel);
    }

    /// 声明该命令列表会访问 `resource`
    pub fn reference(&mut self, resource: NativeResource) {
        self.referenced.push(resource);
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        self.push(GfxCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_buffer: NativeResource,
        vertex_buffer: NativeResource,
        index_count: u32,
        instance_count: u32,
    ) {
        self.push(GfxCommand::DrawIndexed {
            index_buffer,
            vertex_buffer,
            index_count,
            instance_count,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(GfxCommand::Dispatch { x, y, z });
    }

    pub fn copy_buffer(&mut self, src: NativeResource, src_offset: u64, dst: NativeResource, dst_offset: u64, size: u64) {
        self.push(GfxCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn copy_texture(&mut self, src: NativeResource, dst: NativeResource) {
        self.push(GfxCommand::CopyTexture { src, dst });
    }

    pub fn clear_render_target(&mut self, target: NativeResource, color: [f32; 4]) {
        self.push(GfxCommand::ClearRenderTarget { target, color });
    }

    /// 结束录制，之后只能提交
    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_resources_are_unique() {
        let mut list = GfxCommandList::new(
            NativeCommandList(1),
            NativeCommandAllocator(1),
            GfxCommandListType::Graphics,
            "test",
        );
        let a = NativeResource(10);
        let b = NativeResource(11);
        list.resource_barriers(&[GfxResourceBarrier::new(
            a,
            GfxResourceState::COMMON,
            GfxResourceState::TRANSFER_SRC,
        )]);
        list.copy_texture(a, b);
        list.reference(b);
        list.close();

        assert_eq!(list.referenced_resources(), vec![a, b]);
        assert_eq!(list.barrier_count(), 1);
        assert!(list.is_closed());
    }

    #[test]
    fn test_empty_barrier_batch_is_skipped() {
        let mut list =
            GfxCommandList::new(NativeCommandList(1), NativeCommandAllocator(1), GfxCommandListType::Compute, "test");
        list.resource_barriers(&[]);
        assert!(list.commands().is_empty());
    }
}
