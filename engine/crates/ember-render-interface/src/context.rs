//! 引擎上下文
//!
//! 把设备、主队列、时间线以及进程级的管理器收拢到一个显式对象中，
//! 构造一次，以 `Arc` 共享给 Scheduler、每个 Pass 以及流式加载线程。

use std::sync::{Arc, Mutex, PoisonError};

use ember_gfx::commands::command_list::GfxCommandListType;
use ember_gfx::commands::queue::GfxQueueDesc;
use ember_gfx::device::GfxDevice;
use ember_gfx::handles::NativeQueue;
use ember_gfx::resources::resource_desc::{GfxAllocationInfo, GfxResourceDesc};
use ember_gfx::resources::view::GfxViewDesc;

use crate::descriptor_table::DescriptorTableManager;
use crate::error::FrameError;
use crate::handles::ResourceHandle;
use crate::memory_manager::{MemoryManager, PlacementPolicy};
use crate::residency_queue::ResidencyQueue;
use crate::sync_point::SyncTimeline;

/// 构造 [`EngineContext`] 所需的参数
#[derive(Clone, Debug)]
pub struct EngineContextDesc {
    pub frames_in_flight: usize,
    /// 驻留预算（字节）
    pub residency_budget: u64,
    pub descriptor_capacity: u32,
    pub heap_block_size: u64,
}

pub struct EngineContext {
    device: Arc<dyn GfxDevice>,
    queue: NativeQueue,
    timeline: SyncTimeline,

    memory: Arc<MemoryManager>,
    descriptors: DescriptorTableManager,
    residency: ResidencyQueue,

    /// 等待 GPU 用完之后再释放的资源，以及释放请求发出时的帧号
    pending_release: Mutex<Vec<(ResourceHandle, u64)>>,
}

// new & init
impl EngineContext {
    pub fn new(device: Arc<dyn GfxDevice>, desc: &EngineContextDesc) -> Result<Self, FrameError> {
        let _span = ember_crate_tools::profile_span!("EngineContext::new");

        let queue = device.create_command_queue(&GfxQueueDesc::new(GfxCommandListType::Graphics, "master"))?;
        let timeline = SyncTimeline::new(device.clone(), queue)?;
        let memory = Arc::new(MemoryManager::new(device.clone(), desc.heap_block_size));
        let descriptors =
            DescriptorTableManager::new(device.clone(), desc.descriptor_capacity, desc.frames_in_flight as u32)?;
        let residency = ResidencyQueue::new(device.clone(), desc.residency_budget);

        Ok(Self {
            device,
            queue,
            timeline,
            memory,
            descriptors,
            residency,
            pending_release: Mutex::new(Vec::new()),
        })
    }
}

// getters
impl EngineContext {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> NativeQueue {
        self.queue
    }

    #[inline]
    pub fn timeline(&self) -> &SyncTimeline {
        &self.timeline
    }

    #[inline]
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    #[inline]
    pub fn descriptors(&self) -> &DescriptorTableManager {
        &self.descriptors
    }

    #[inline]
    pub fn residency(&self) -> &ResidencyQueue {
        &self.residency
    }

    pub fn pending_release_count(&self) -> usize {
        self.pending_release.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// 资源创建与释放
impl EngineContext {
    /// 分配资源并创建默认视图
    ///
    /// 分配失败时先做一次通用驱逐，然后重试一次。
    pub fn create_resource(
        &self,
        desc: &GfxResourceDesc,
        policy: PlacementPolicy,
        name: &str,
    ) -> Result<ResourceHandle, FrameError> {
        self.create_resource_with(&GfxAllocationInfo::new(*desc, name), policy)
    }

    pub fn create_resource_with(
        &self,
        info: &GfxAllocationInfo,
        policy: PlacementPolicy,
    ) -> Result<ResourceHandle, FrameError> {
        let handle = match self.memory.allocate_with(info, policy) {
            Ok(handle) => handle,
            Err(FrameError::AllocationFailure { requested, name }) => {
                log::warn!("EngineContext: allocation of {} ({} bytes) failed, evicting and retrying", name, requested);
                self.residency.evict_for(&self.memory, requested)?;
                self.memory.allocate_with(info, policy)?
            }
            Err(e) => return Err(e),
        };

        let view = default_view(&info.desc);
        let native = self.memory.native(handle)?;
        match self.descriptors.create_view(native, &view) {
            Ok(descriptor) => {
                self.memory.set_view(handle, Some(descriptor))?;
                Ok(handle)
            }
            Err(e) => {
                self.memory.release(handle)?;
                Err(e)
            }
        }
    }

    /// 立即释放资源及其视图
    ///
    /// 调用者必须保证 GPU 不再使用该资源；不确定时使用 [`Self::release_resource_deferred`]。
    pub fn release_resource(&self, handle: ResourceHandle) -> Result<(), FrameError> {
        let resource = self.memory.release(handle)?;
        if let Some(view) = resource.view() {
            self.descriptors.free(view);
        }
        Ok(())
    }

    /// 等 `frame_id` 及之前的帧全部退休之后再释放
    pub fn release_resource_deferred(&self, handle: ResourceHandle, frame_id: u64) -> Result<(), FrameError> {
        if !self.memory.contains(handle) {
            return Err(FrameError::InvalidResource(handle));
        }
        self.pending_release.lock().unwrap_or_else(PoisonError::into_inner).push((handle, frame_id));
        Ok(())
    }

    /// 释放所有在 `retired_frame_id` 及之前请求的延迟释放
    ///
    /// 返回释放的资源数量。
    pub fn collect_garbage(&self, retired_frame_id: u64) -> usize {
        let ready = {
            let mut pending = self.pending_release.lock().unwrap_or_else(PoisonError::into_inner);
            let (ready, keep): (Vec<_>, Vec<_>) = pending.drain(..).partition(|&(_, f)| f <= retired_frame_id);
            *pending = keep;
            ready
        };
        ready
            .into_iter()
            .filter(|&(handle, _)| match self.release_resource(handle) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("EngineContext: deferred release failed: {e}");
                    false
                }
            })
            .count()
    }
}

/// 资源的默认视图：buffer 为顶点/索引视图，texture 为 shader resource 视图
pub fn default_view(desc: &GfxResourceDesc) -> GfxViewDesc {
    match desc.format() {
        None => GfxViewDesc::Buffer {
            offset: 0,
            size: desc.byte_size(),
            stride: 0,
        },
        Some(format) => GfxViewDesc::ShaderResource { format },
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        log::info!("Dropping EngineContext");
    }
}
