//! 设备能力接口
//!
//! 核心消费而不实现这些接口：真正的驱动层（或 [`HeadlessDevice`](crate::headless::HeadlessDevice)）
//! 负责创建队列、分配器、资源、视图、fence，以及驻留切换。

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use raw_window_handle::RawWindowHandle;

use crate::commands::command_list::{GfxCommandList, GfxCommandListType};
use crate::commands::queue::GfxQueueDesc;
use crate::error::GfxResult;
use crate::handles::{
    DescriptorHandle, NativeCommandAllocator, NativeDescriptorHeap, NativeFence, NativeHeap, NativeQueue,
    NativeResource,
};
use crate::resources::resource_desc::{GfxHeapDesc, GfxHeapType, GfxResourceDesc};
use crate::resources::resource_state::GfxResourceState;
use crate::resources::view::GfxViewDesc;

/// 原生图形设备
///
/// 所有方法都只借用 `&self`，实现者自己负责内部同步。
pub trait GfxDevice: Send + Sync {
    // ---------- 队列与命令 ----------

    fn create_command_queue(&self, desc: &GfxQueueDesc) -> GfxResult<NativeQueue>;

    fn create_command_allocator(&self, list_type: GfxCommandListType) -> GfxResult<NativeCommandAllocator>;

    /// 重置 allocator，之前从它录制的命令列表全部失效
    ///
    /// 调用者必须保证这些命令已经执行完毕。
    fn reset_command_allocator(&self, allocator: NativeCommandAllocator) -> GfxResult<()>;

    fn create_command_list(
        &self,
        allocator: NativeCommandAllocator,
        list_type: GfxCommandListType,
        debug_name: &str,
    ) -> GfxResult<GfxCommandList>;

    /// 按顺序执行命令列表
    fn execute_command_lists(&self, queue: NativeQueue, lists: &[GfxCommandList]) -> GfxResult<()>;

    // ---------- 内存与资源 ----------

    fn create_heap(&self, desc: &GfxHeapDesc) -> GfxResult<NativeHeap>;

    fn destroy_heap(&self, heap: NativeHeap);

    /// 独占一块内存的资源，创建后即处于驻留状态
    fn create_committed_resource(
        &self,
        desc: &GfxResourceDesc,
        heap_type: GfxHeapType,
        initial_state: GfxResourceState,
    ) -> GfxResult<NativeResource>;

    /// 放置在 `heap` 的 `offset` 处的资源
    fn create_placed_resource(
        &self,
        heap: NativeHeap,
        offset: u64,
        desc: &GfxResourceDesc,
        initial_state: GfxResourceState,
    ) -> GfxResult<NativeResource>;

    fn destroy_resource(&self, resource: NativeResource);

    /// GPU 虚拟地址，仅在资源驻留时有效
    fn resource_virtual_address(&self, resource: NativeResource) -> GfxResult<u64>;

    /// 把资源变为驻留；调用返回时驻留已经完成
    fn make_resident(&self, resources: &[NativeResource]) -> GfxResult<()>;

    fn evict(&self, resources: &[NativeResource]) -> GfxResult<()>;

    /// 设备可用于驻留资源的内存总量
    fn memory_budget(&self) -> u64;

    // ---------- 描述符 ----------

    fn create_descriptor_heap(&self, capacity: u32, shader_visible: bool) -> GfxResult<NativeDescriptorHeap>;

    fn create_view(&self, resource: NativeResource, view: &GfxViewDesc, dest: DescriptorHandle) -> GfxResult<()>;

    fn copy_descriptors(&self, src: DescriptorHandle, dst: DescriptorHandle, count: u32) -> GfxResult<()>;

    // ---------- 同步 ----------

    fn create_fence(&self, initial_value: u64) -> GfxResult<NativeFence>;

    fn fence_completed_value(&self, fence: NativeFence) -> GfxResult<u64>;

    /// 等待 fence 到达 `value`
    ///
    /// 超时返回 `Ok(false)`。
    fn wait_fence(&self, fence: NativeFence, value: u64, timeout: Duration) -> GfxResult<bool>;

    /// 队列执行完之前提交的所有工作后，把 fence 设置为 `value`
    fn signal(&self, queue: NativeQueue, fence: NativeFence, value: u64) -> GfxResult<()>;
}

/// 交换链创建信息
#[derive(Clone, Debug)]
pub struct GfxSwapChainDesc {
    pub window: Option<RawWindowHandle>,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub format: vk::Format,
    pub full_screen: bool,
}

/// 窗口系统一侧的设备管理器，负责为目标窗口创建交换链
pub trait GfxDeviceManager {
    fn create_swap_chain(
        &self,
        device: Arc<dyn GfxDevice>,
        queue: NativeQueue,
        desc: &GfxSwapChainDesc,
    ) -> GfxResult<Box<dyn GfxSwapChain>>;
}

pub trait GfxSwapChain {
    fn buffer_count(&self) -> u32;

    fn back_buffer(&self, index: u32) -> NativeResource;

    fn current_back_buffer_index(&self) -> u32;

    fn format(&self) -> vk::Format;

    fn extent(&self) -> vk::Extent2D;

    fn present(&mut self) -> GfxResult<()>;

    /// 重建所有 back buffer，之前的 back buffer 句柄全部失效
    fn resize(&mut self, width: u32, height: u32) -> GfxResult<()>;
}
