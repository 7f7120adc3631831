//! Memory Manager
//!
//! 持有所有的 heap 和资源记录，为资源分配/放置内存，并维护驻留字节计数。
//! 所有修改都在内部的 `Mutex` 下串行执行，因此方法只需要 `&self`，
//! 可以同时被渲染线程和流式加载线程调用。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slotmap::SlotMap;

use ember_gfx::GfxError;
use ember_gfx::device::GfxDevice;
use ember_gfx::handles::{DescriptorHandle, NativeResource};
use ember_gfx::resources::resource_desc::{GfxAllocationInfo, GfxHeapDesc, GfxResourceDesc, PLACEMENT_ALIGNMENT, align_up};
use ember_gfx::resources::resource_state::GfxResourceState;

use crate::error::FrameError;
use crate::handles::{GfxHeapHandle, ResourceHandle};
use crate::heap::GfxHeap;
use crate::resource::{GfxBacking, GfxResource, GfxResourceKind};

/// 资源的内存放置策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    /// 独占一次分配，没有碎片但粒度大
    Committed,
    /// 放置在共享 heap 中
    #[default]
    Placed,
}

pub(crate) struct MemoryState {
    pub(crate) resources: SlotMap<ResourceHandle, GfxResource>,
    heaps: SlotMap<GfxHeapHandle, GfxHeap>,
    /// 驻留资源占用的字节数（不含外部资源）
    pub(crate) committed_bytes: u64,
    next_seq: u64,
}

impl MemoryState {
    /// 修改驻留标记，同时维护 committed_bytes
    pub(crate) fn set_resident(&mut self, handle: ResourceHandle, resident: bool) {
        let Some(resource) = self.resources.get_mut(handle) else {
            return;
        };
        if resource.resident == resident {
            return;
        }
        resource.resident = resident;
        let bytes = resource.budget_bytes();
        if resident {
            self.committed_bytes += bytes;
        } else {
            self.committed_bytes -= bytes;
        }
    }
}

pub struct MemoryManager {
    device: Arc<dyn GfxDevice>,
    heap_block_size: u64,
    state: Mutex<MemoryState>,
}

// new & init
impl MemoryManager {
    pub fn new(device: Arc<dyn GfxDevice>, heap_block_size: u64) -> Self {
        Self {
            device,
            heap_block_size: align_up(heap_block_size.max(PLACEMENT_ALIGNMENT), PLACEMENT_ALIGNMENT),
            state: Mutex::new(MemoryState {
                resources: SlotMap::with_key(),
                heaps: SlotMap::with_key(),
                committed_bytes: 0,
                next_seq: 0,
            }),
        }
    }
}

// destroy
impl Drop for MemoryManager {
    fn drop(&mut self) {
        log::info!("Dropping MemoryManager");
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, resource) in state.resources.drain() {
            if !resource.is_external() {
                self.device.destroy_resource(resource.native);
            }
        }
        for (_, heap) in state.heaps.drain() {
            self.device.destroy_heap(heap.native());
        }
    }
}

// getters
impl MemoryManager {
    pub(crate) fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    /// 驻留资源占用的字节数，驻留预算检查读取的就是这个值
    pub fn committed_bytes(&self) -> u64 {
        self.lock().committed_bytes
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn heap_count(&self) -> usize {
        self.lock().heaps.len()
    }

    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.lock().resources.contains_key(handle)
    }

    /// 资源记录的快照
    pub fn resource(&self, handle: ResourceHandle) -> Option<GfxResource> {
        self.lock().resources.get(handle).cloned()
    }

    pub fn native(&self, handle: ResourceHandle) -> Result<NativeResource, FrameError> {
        self.lock().resources.get(handle).map(|r| r.native).ok_or(FrameError::InvalidResource(handle))
    }

    pub fn is_resident(&self, handle: ResourceHandle) -> Option<bool> {
        self.lock().resources.get(handle).map(|r| r.resident)
    }

    /// 资源的默认视图所在的 CPU 描述符槽位
    pub fn view(&self, handle: ResourceHandle) -> Option<DescriptorHandle> {
        self.lock().resources.get(handle).and_then(|r| r.view())
    }

    /// 资源在上一帧结束时的状态
    pub fn state(&self, handle: ResourceHandle) -> Option<GfxResourceState> {
        self.lock().resources.get(handle).map(|r| r.state)
    }

    /// GPU 虚拟地址；资源未驻留时返回 None
    pub fn virtual_address(&self, handle: ResourceHandle) -> Option<u64> {
        let native = {
            let state = self.lock();
            let resource = state.resources.get(handle)?;
            if !resource.resident {
                return None;
            }
            resource.native
        };
        self.device.resource_virtual_address(native).ok()
    }
}

// 分配与释放
impl MemoryManager {
    /// 在 default heap 中为资源分配内存
    pub fn allocate(
        &self,
        desc: &GfxResourceDesc,
        policy: PlacementPolicy,
        name: &str,
    ) -> Result<ResourceHandle, FrameError> {
        self.allocate_with(&GfxAllocationInfo::new(*desc, name), policy)
    }

    pub fn allocate_with(&self, info: &GfxAllocationInfo, policy: PlacementPolicy) -> Result<ResourceHandle, FrameError> {
        let _span = ember_crate_tools::profile_span!("MemoryManager::allocate");

        let size = info.desc.allocation_size();
        let allocation_failure = |e: GfxError| match e {
            GfxError::OutOfMemory { .. } => FrameError::AllocationFailure {
                requested: size,
                name: info.debug_name.clone(),
            },
            other => other.into(),
        };

        let mut state = self.lock();
        let (native, backing) = match policy {
            PlacementPolicy::Committed => {
                let native = self
                    .device
                    .create_committed_resource(&info.desc, info.heap_type, info.initial_state)
                    .map_err(allocation_failure)?;
                (native, GfxBacking::Committed)
            }
            PlacementPolicy::Placed => {
                let (heap, offset) = self.place(&mut state, info, size).map_err(allocation_failure)?;
                let native = match self.device.create_placed_resource(
                    state.heaps[heap].native(),
                    offset,
                    &info.desc,
                    info.initial_state,
                ) {
                    Ok(native) => native,
                    Err(e) => {
                        self.free_extent(&mut state, heap, offset, size);
                        return Err(allocation_failure(e));
                    }
                };
                (native, GfxBacking::Placed { heap, offset })
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.committed_bytes += size;
        let handle = state.resources.insert(GfxResource {
            native,
            backing,
            heap_type: info.heap_type,
            kind: GfxResourceKind::from(&info.desc),
            view: None,
            resident: true,
            allocation_size: size,
            state: info.initial_state,
            last_used_frame: None,
            essential: false,
            seq,
            name: info.debug_name.clone(),
        });

        log::debug!("MemoryManager: allocated {} ({} bytes, {:?})", info.debug_name, size, backing);
        Ok(handle)
    }

    /// first-fit 遍历同类型的 heap，都放不下时新建一个 heap 块
    fn place(
        &self,
        state: &mut MemoryState,
        info: &GfxAllocationInfo,
        size: u64,
    ) -> Result<(GfxHeapHandle, u64), GfxError> {
        for (handle, heap) in state.heaps.iter_mut() {
            if heap.heap_type() != info.heap_type {
                continue;
            }
            if let Some(offset) = heap.allocate(size, PLACEMENT_ALIGNMENT) {
                return Ok((handle, offset));
            }
        }

        let desc = GfxHeapDesc {
            size: self.heap_block_size.max(size),
            heap_type: info.heap_type,
            alignment: PLACEMENT_ALIGNMENT,
        };
        let native = self.device.create_heap(&desc)?;
        log::info!("MemoryManager: new {:?} heap block of {} bytes", desc.heap_type, desc.size);

        let mut heap = GfxHeap::new(native, desc);
        let offset = heap
            .allocate(size, PLACEMENT_ALIGNMENT)
            .ok_or(GfxError::OutOfMemory { requested: size })?;
        Ok((state.heaps.insert(heap), offset))
    }

    /// 归还 heap 中的区间，heap 变空时销毁
    fn free_extent(&self, state: &mut MemoryState, heap: GfxHeapHandle, offset: u64, size: u64) {
        let Some(heap_ref) = state.heaps.get_mut(heap) else {
            return;
        };
        heap_ref.free(offset, size);
        if heap_ref.is_empty() {
            if let Some(heap) = state.heaps.remove(heap) {
                self.device.destroy_heap(heap.native());
            }
        }
    }

    /// 注册外部创建的资源（例如 swapchain image）
    ///
    /// 外部资源总是驻留且不可驱逐，不计入驻留预算，释放时也不会销毁原生对象。
    pub fn register_external(
        &self,
        native: NativeResource,
        desc: &GfxResourceDesc,
        state: GfxResourceState,
        name: &str,
    ) -> ResourceHandle {
        let mut guard = self.lock();
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.resources.insert(GfxResource {
            native,
            backing: GfxBacking::External,
            heap_type: Default::default(),
            kind: GfxResourceKind::from(desc),
            view: None,
            resident: true,
            allocation_size: desc.allocation_size(),
            state,
            last_used_frame: None,
            essential: true,
            seq,
            name: name.to_string(),
        })
    }

    /// 释放资源并把内存还给所属的 heap
    ///
    /// 调用者必须保证 GPU 已经不再使用该资源。
    pub fn release(&self, handle: ResourceHandle) -> Result<GfxResource, FrameError> {
        let mut state = self.lock();
        let resource = state.resources.remove(handle).ok_or(FrameError::InvalidResource(handle))?;
        if resource.resident {
            state.committed_bytes -= resource.budget_bytes();
        }

        match resource.backing {
            GfxBacking::External => {}
            GfxBacking::Committed => self.device.destroy_resource(resource.native),
            GfxBacking::Placed { heap, offset } => {
                self.device.destroy_resource(resource.native);
                self.free_extent(&mut state, heap, offset, resource.allocation_size);
            }
        }
        log::debug!("MemoryManager: released {}", resource.name);
        Ok(resource)
    }
}

// 属性修改
impl MemoryManager {
    /// essential 资源永远不会被驱逐
    pub fn set_essential(&self, handle: ResourceHandle, essential: bool) -> Result<(), FrameError> {
        let mut state = self.lock();
        let resource = state.resources.get_mut(handle).ok_or(FrameError::InvalidResource(handle))?;
        resource.essential = essential;
        Ok(())
    }

    pub fn set_view(&self, handle: ResourceHandle, view: Option<DescriptorHandle>) -> Result<(), FrameError> {
        let mut state = self.lock();
        let resource = state.resources.get_mut(handle).ok_or(FrameError::InvalidResource(handle))?;
        resource.view = view;
        Ok(())
    }

    /// 提交一帧结束时各资源的状态，作为下一帧的入口状态
    pub fn commit_states(&self, states: impl IntoIterator<Item = (ResourceHandle, GfxResourceState)>) {
        let mut guard = self.lock();
        for (handle, state) in states {
            if let Some(resource) = guard.resources.get_mut(handle) {
                resource.state = state;
            }
        }
    }

    /// 设备丢失后所有资源都视为未驻留
    pub fn mark_all_non_resident(&self) {
        let mut state = self.lock();
        for (_, resource) in state.resources.iter_mut() {
            resource.resident = false;
        }
        state.committed_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use ember_gfx::headless::{HeadlessDevice, HeadlessDeviceDesc};
    use ember_gfx::resources::resource_desc::GfxHeapType;

    use super::*;

    const KB64: u64 = 64 * 1024;

    fn setup(capacity: u64, block: u64) -> (Arc<HeadlessDevice>, MemoryManager) {
        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
            memory_capacity: capacity,
            ..Default::default()
        }));
        let memory = MemoryManager::new(device.clone(), block);
        (device, memory)
    }

    #[test]
    fn test_committed_allocate_and_release() {
        let (device, memory) = setup(1 << 20, KB64 * 4);
        let handle = memory.allocate(&GfxResourceDesc::buffer(100), PlacementPolicy::Committed, "vb").unwrap();

        let resource = memory.resource(handle).unwrap();
        assert!(resource.is_resident());
        assert_eq!(resource.size(), Some(100));
        assert_eq!(memory.committed_bytes(), KB64);
        assert!(memory.virtual_address(handle).is_some());

        memory.release(handle).unwrap();
        assert_eq!(memory.committed_bytes(), 0);
        assert_eq!(device.live_resource_count(), 0);
        assert_eq!(memory.release(handle).unwrap_err(), FrameError::InvalidResource(handle));
    }

    #[test]
    fn test_placed_allocations_share_heap() {
        let (device, memory) = setup(1 << 20, KB64 * 4);
        let desc = GfxResourceDesc::buffer(KB64);
        let a = memory.allocate(&desc, PlacementPolicy::Placed, "a").unwrap();
        let b = memory.allocate(&desc, PlacementPolicy::Placed, "b").unwrap();
        assert_eq!(memory.heap_count(), 1);
        assert_eq!(device.live_heap_count(), 1);

        let offset = |h| match memory.resource(h).unwrap().backing() {
            GfxBacking::Placed { offset, .. } => offset,
            other => panic!("unexpected backing {other:?}"),
        };
        assert_eq!(offset(a), 0);
        assert_eq!(offset(b), KB64);

        // 第五个放不下，新建 heap 块
        for i in 0..3 {
            memory.allocate(&desc, PlacementPolicy::Placed, &format!("c{i}")).unwrap();
        }
        assert_eq!(memory.heap_count(), 2);

        // 释放后的空洞会被复用
        memory.release(a).unwrap();
        let d = memory.allocate(&desc, PlacementPolicy::Placed, "d").unwrap();
        assert_eq!(offset(d), 0);
    }

    #[test]
    fn test_empty_heap_is_destroyed() {
        let (device, memory) = setup(1 << 20, KB64 * 2);
        let a = memory.allocate(&GfxResourceDesc::buffer(16), PlacementPolicy::Placed, "a").unwrap();
        memory.release(a).unwrap();
        assert_eq!(memory.heap_count(), 0);
        assert_eq!(device.live_heap_count(), 0);
        assert_eq!(device.used_memory(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        let (_device, memory) = setup(KB64, KB64);
        memory.allocate(&GfxResourceDesc::buffer(KB64), PlacementPolicy::Committed, "a").unwrap();
        let err = memory.allocate(&GfxResourceDesc::buffer(KB64), PlacementPolicy::Committed, "b").unwrap_err();
        assert_eq!(
            err,
            FrameError::AllocationFailure {
                requested: KB64,
                name: "b".to_string()
            }
        );
        let err = memory.allocate(&GfxResourceDesc::buffer(1), PlacementPolicy::Placed, "c").unwrap_err();
        assert!(matches!(err, FrameError::AllocationFailure { .. }));
    }

    #[test]
    fn test_external_resources() {
        let (device, memory) = setup(1 << 20, KB64);
        let desc = GfxResourceDesc::texture_2d(8, 8, vk::Format::B8G8R8A8_UNORM);
        let native = device.create_committed_resource(&desc, GfxHeapType::Default, GfxResourceState::PRESENT).unwrap();
        let handle = memory.register_external(native, &desc, GfxResourceState::PRESENT, "back buffer");

        let resource = memory.resource(handle).unwrap();
        assert!(resource.is_external());
        assert!(resource.is_essential());
        assert_eq!(memory.committed_bytes(), 0);

        memory.release(handle).unwrap();
        // 外部资源不由核心销毁
        assert_eq!(device.is_resident(native), Some(true));
    }

    #[test]
    fn test_commit_states() {
        let (_device, memory) = setup(1 << 20, KB64);
        let handle = memory.allocate(&GfxResourceDesc::buffer(16), PlacementPolicy::Committed, "a").unwrap();
        assert_eq!(memory.state(handle), Some(GfxResourceState::COMMON));
        memory.commit_states([(handle, GfxResourceState::TRANSFER_DST)]);
        assert_eq!(memory.state(handle), Some(GfxResourceState::TRANSFER_DST));
    }
}
