//! Pass 定义和构建器
//!
//! 提供 `RgPass` trait 用于声明式定义 Pass，
//! 以及 `RgPassBuilder` 用于在 setup 阶段声明资源依赖。

use std::collections::HashMap;

use ember_gfx::commands::command_list::{GfxCommandList, GfxCommandListType};
use ember_gfx::handles::{DescriptorHandle, NativeResource};
use ember_gfx::resources::resource_state::GfxResourceState;
use ember_render_interface::context::EngineContext;
use ember_render_interface::handles::ResourceHandle;
use ember_render_interface::scratch_space_pool::ScratchSpace;

/// 资源访问方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RgAccess {
    Read,
    Write,
    ReadWrite,
}

impl RgAccess {
    #[inline]
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }

    #[inline]
    pub fn is_read(self) -> bool {
        !matches!(self, Self::Write)
    }

    fn merge(self, other: Self) -> Self {
        if self == other { self } else { Self::ReadWrite }
    }
}

/// Pass 对一个资源的使用声明
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgResourceUse {
    pub handle: ResourceHandle,
    pub access: RgAccess,
    /// 该 Pass 要求资源处于的状态
    pub state: GfxResourceState,
}

/// Pass 构建器
///
/// 在 `RgPass::setup()` 中使用，声明 Pass 的资源依赖。
/// 同一个资源声明多次时合并为一次使用；要求的状态不一致时记录为冲突，由 `build()` 报告。
pub struct RgPassBuilder {
    pub(crate) name: String,
    pub(crate) uses: Vec<RgResourceUse>,
    pub(crate) conflicts: Vec<String>,
}

impl RgPassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uses: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    fn declare(&mut self, handle: ResourceHandle, access: RgAccess, state: GfxResourceState) -> ResourceHandle {
        match self.uses.iter_mut().find(|u| u.handle == handle) {
            Some(existing) if existing.state != state => {
                self.conflicts.push(format!(
                    "pass '{}' requires {:?} in two states: {:?} and {:?}",
                    self.name, handle, existing.state, state
                ));
            }
            Some(existing) => existing.access = existing.access.merge(access),
            None => self.uses.push(RgResourceUse { handle, access, state }),
        }
        handle
    }

    /// 声明读取资源
    #[inline]
    pub fn read(&mut self, handle: ResourceHandle, state: GfxResourceState) -> ResourceHandle {
        self.declare(handle, RgAccess::Read, state)
    }

    /// 声明写入资源
    #[inline]
    pub fn write(&mut self, handle: ResourceHandle, state: GfxResourceState) -> ResourceHandle {
        self.declare(handle, RgAccess::Write, state)
    }

    /// 声明读写资源（同时读取和写入）
    ///
    /// 常用于累积操作（如 RT 累积、后处理）
    #[inline]
    pub fn read_write(&mut self, handle: ResourceHandle, state: GfxResourceState) -> ResourceHandle {
        self.declare(handle, RgAccess::ReadWrite, state)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Pass 执行时的上下文
pub struct RgPassContext<'a> {
    pub cmd: &'a mut GfxCommandList,
    pub engine: &'a EngineContext,
    pub scratch: &'a mut ScratchSpace,
    pub frame_id: u64,
    /// 本帧 shader visible 描述符表的起始位置
    pub frame_table: DescriptorHandle,
    pub(crate) natives: &'a HashMap<ResourceHandle, NativeResource>,
    pub(crate) table_indices: &'a HashMap<ResourceHandle, u32>,
}

impl RgPassContext<'_> {
    /// 工作集中资源的原生句柄
    ///
    /// 只能查询本 Pass 所在 Pipeline 声明过的资源，其他资源返回 None。
    #[inline]
    pub fn native(&self, handle: ResourceHandle) -> Option<NativeResource> {
        self.natives.get(&handle).copied()
    }

    /// 资源视图在本帧描述符表中的位置；没有视图的资源返回 None
    #[inline]
    pub fn descriptor(&self, handle: ResourceHandle) -> Option<DescriptorHandle> {
        self.table_indices.get(&handle).map(|&i| self.frame_table.offset(i))
    }
}

/// Pipeline 中的一个 Pass
///
/// # 示例
///
/// ```ignore
/// struct BlurPass {
///     input: ResourceHandle,
///     output: ResourceHandle,
/// }
///
/// impl RgPass for BlurPass {
///     fn setup(&mut self, builder: &mut RgPassBuilder) {
///         builder.read(self.input, GfxResourceState::SHADER_READ_COMPUTE);
///         builder.write(self.output, GfxResourceState::STORAGE_WRITE_COMPUTE);
///     }
///
///     fn execute(&self, ctx: &mut RgPassContext<'_>) {
///         ctx.cmd.dispatch(64, 64, 1);
///     }
///
///     fn list_type(&self) -> GfxCommandListType {
///         GfxCommandListType::Compute
///     }
/// }
/// ```
pub trait RgPass {
    /// 声明 Pass 的资源依赖
    fn setup(&mut self, builder: &mut RgPassBuilder);

    /// 录制 Pass 的命令
    ///
    /// barrier 已经由 Pipeline 录制好，直接录制命令即可。
    fn execute(&self, ctx: &mut RgPassContext<'_>);

    /// Pass 录制到哪种命令列表中
    fn list_type(&self) -> GfxCommandListType {
        GfxCommandListType::Graphics
    }
}

/// Pass 节点数据（构建后使用）
pub(crate) struct RgPassNode {
    pub name: String,
    pub uses: Vec<RgResourceUse>,
    pub list_type: GfxCommandListType,
    pub pass: Box<dyn RgPass>,
}
