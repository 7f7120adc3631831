use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::commands::command_list::{GfxCommand, GfxCommandList, GfxCommandListType};
use crate::commands::queue::GfxQueueDesc;
use crate::device::GfxDevice;
use crate::error::{GfxError, GfxResult};
use crate::handles::{
    DescriptorHandle, NativeCommandAllocator, NativeCommandList, NativeDescriptorHeap, NativeFence, NativeHeap,
    NativeQueue, NativeResource,
};
use crate::resources::resource_desc::{GfxHeapDesc, GfxHeapType, GfxResourceDesc};
use crate::resources::resource_state::GfxResourceState;
use crate::resources::view::GfxViewDesc;

/// signal 之后 fence 何时完成
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HeadlessCompletion {
    /// signal 时立即完成，相当于一个无限快的 GPU
    #[default]
    Immediate,
    /// 由调用者通过 `complete_*` 推进
    Manual,
}

#[derive(Clone, Debug)]
pub struct HeadlessDeviceDesc {
    /// 可驻留的内存总量（committed 资源 + heap）
    pub memory_capacity: u64,
    pub completion: HeadlessCompletion,
}

impl Default for HeadlessDeviceDesc {
    fn default() -> Self {
        Self {
            memory_capacity: 1 << 30,
            completion: HeadlessCompletion::Immediate,
        }
    }
}

/// 记录下来的设备调用
#[derive(Clone, Debug, PartialEq)]
pub enum HeadlessCall {
    MakeResident(Vec<NativeResource>),
    Evict(Vec<NativeResource>),
    Execute {
        queue: NativeQueue,
        lists: Vec<(NativeCommandList, GfxCommandListType)>,
        commands: Vec<GfxCommand>,
    },
    Signal {
        fence: NativeFence,
        value: u64,
    },
    ResetAllocator(NativeCommandAllocator),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub executed_lists: u64,
    pub executed_barriers: u64,
    pub make_resident_calls: u64,
    pub evict_calls: u64,
    pub signals: u64,
    /// copy_descriptors 拷贝的描述符总数
    pub copied_descriptors: u64,
}

struct ResourceRecord {
    size: u64,
    /// placed 资源所在的 heap；committed 资源为 None
    heap: Option<NativeHeap>,
    offset: u64,
    resident: bool,
}

struct FenceRecord {
    completed: u64,
    /// Manual 模式下尚未完成的 signal
    pending: VecDeque<u64>,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    queues: HashMap<NativeQueue, GfxQueueDesc>,
    allocators: HashMap<NativeCommandAllocator, GfxCommandListType>,
    heaps: HashMap<NativeHeap, GfxHeapDesc>,
    resources: HashMap<NativeResource, ResourceRecord>,
    descriptor_heaps: HashMap<NativeDescriptorHeap, Vec<Option<(NativeResource, GfxViewDesc)>>>,
    fences: HashMap<NativeFence, FenceRecord>,
    /// Manual 模式下所有未完成 signal 的提交顺序
    pending_signals: VecDeque<(NativeFence, u64)>,
    used_memory: u64,
    lost: bool,
    /// 这些值的 signal 返回错误，设备本身不受影响
    rejected_signals: Vec<u64>,
    stats: HeadlessStats,
    calls: Vec<HeadlessCall>,
}

impl HeadlessState {
    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_alive(&self) -> GfxResult<()> {
        if self.lost { Err(GfxError::DeviceLost) } else { Ok(()) }
    }

    fn reserve_memory(&mut self, bytes: u64, capacity: u64) -> GfxResult<()> {
        if self.used_memory + bytes > capacity {
            return Err(GfxError::OutOfMemory { requested: bytes });
        }
        self.used_memory += bytes;
        Ok(())
    }

    fn fence_mut(&mut self, fence: NativeFence) -> GfxResult<&mut FenceRecord> {
        self.fences.get_mut(&fence).ok_or(GfxError::InvalidHandle {
            kind: "fence",
            raw: fence.raw(),
        })
    }

    fn complete(&mut self, fence: NativeFence, value: u64) {
        if let Some(record) = self.fences.get_mut(&fence) {
            record.completed = record.completed.max(value);
            record.pending.retain(|&v| v > value);
        }
        self.pending_signals.retain(|&(f, v)| f != fence || v > value);
    }
}

/// 进程内设备
pub struct HeadlessDevice {
    desc: HeadlessDeviceDesc,
    state: Mutex<HeadlessState>,
    /// fence 完成或设备丢失时通知等待者
    fence_cv: Condvar,
}

// new & init
impl HeadlessDevice {
    pub fn new(desc: HeadlessDeviceDesc) -> Self {
        log::info!(
            "HeadlessDevice created: capacity {} bytes, completion {:?}",
            desc.memory_capacity,
            desc.completion
        );
        Self {
            desc,
            state: Mutex::new(HeadlessState::default()),
            fence_cv: Condvar::new(),
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(HeadlessDeviceDesc::default())
    }
}

// 测试控制
impl HeadlessDevice {
    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 模拟设备丢失，所有后续调用返回 `DeviceLost`
    pub fn lose_device(&self) {
        log::error!("HeadlessDevice: device lost injected");
        self.lock().lost = true;
        self.fence_cv.notify_all();
    }

    pub fn is_lost(&self) -> bool {
        self.lock().lost
    }

    /// 值为 `value` 的下一次 signal 失败并返回 `Unsupported`
    pub fn reject_signal(&self, value: u64) {
        self.lock().rejected_signals.push(value);
    }

    /// 完成最早一个尚未完成的 signal，没有待完成的 signal 时返回 false
    pub fn complete_next(&self) -> bool {
        let mut state = self.lock();
        let Some((fence, value)) = state.pending_signals.front().copied() else {
            return false;
        };
        state.complete(fence, value);
        drop(state);
        self.fence_cv.notify_all();
        true
    }

    /// 完成 `fence` 上所有不超过 `value` 的 signal
    pub fn complete_fence(&self, fence: NativeFence, value: u64) {
        self.lock().complete(fence, value);
        self.fence_cv.notify_all();
    }

    /// 完成所有待完成的 signal
    pub fn complete_all(&self) {
        let mut state = self.lock();
        while let Some((fence, value)) = state.pending_signals.pop_front() {
            state.complete(fence, value);
        }
        drop(state);
        self.fence_cv.notify_all();
    }

    pub fn pending_signal_count(&self) -> usize {
        self.lock().pending_signals.len()
    }

    pub fn calls(&self) -> Vec<HeadlessCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn stats(&self) -> HeadlessStats {
        self.lock().stats
    }

    pub fn used_memory(&self) -> u64 {
        self.lock().used_memory
    }

    /// 资源是否驻留；资源不存在时返回 None
    pub fn is_resident(&self, resource: NativeResource) -> Option<bool> {
        self.lock().resources.get(&resource).map(|r| r.resident)
    }

    pub fn live_resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn live_heap_count(&self) -> usize {
        self.lock().heaps.len()
    }

    /// 描述符槽位当前指向的资源
    pub fn descriptor(&self, handle: DescriptorHandle) -> Option<(NativeResource, GfxViewDesc)> {
        self.lock()
            .descriptor_heaps
            .get(&handle.heap)
            .and_then(|slots| slots.get(handle.index as usize).copied().flatten())
    }
}

impl GfxDevice for HeadlessDevice {
    fn create_command_queue(&self, desc: &GfxQueueDesc) -> GfxResult<NativeQueue> {
        let mut state = self.lock();
        state.check_alive()?;
        let queue = NativeQueue(state.alloc_handle());
        log::debug!("HeadlessDevice: create queue {} {:?}", desc.debug_name, queue);
        state.queues.insert(queue, desc.clone());
        Ok(queue)
    }

    fn create_command_allocator(&self, list_type: GfxCommandListType) -> GfxResult<NativeCommandAllocator> {
        let mut state = self.lock();
        state.check_alive()?;
        let allocator = NativeCommandAllocator(state.alloc_handle());
        state.allocators.insert(allocator, list_type);
        Ok(allocator)
    }

    fn reset_command_allocator(&self, allocator: NativeCommandAllocator) -> GfxResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        if !state.allocators.contains_key(&allocator) {
            return Err(GfxError::InvalidHandle {
                kind: "command allocator",
                raw: allocator.raw(),
            });
        }
        state.calls.push(HeadlessCall::ResetAllocator(allocator));
        Ok(())
    }

    fn create_command_list(
        &self,
        allocator: NativeCommandAllocator,
        list_type: GfxCommandListType,
        debug_name: &str,
    ) -> GfxResult<GfxCommandList> {
        let mut state = self.lock();
        state.check_alive()?;
        match state.allocators.get(&allocator) {
            Some(&t) if t == list_type => {}
            Some(_) => {
                return Err(GfxError::Unsupported(format!(
                    "command list {debug_name} type {list_type:?} does not match its allocator"
                )));
            }
            None => {
                return Err(GfxError::InvalidHandle {
                    kind: "command allocator",
                    raw: allocator.raw(),
                });
            }
        }
        let native = NativeCommandList(state.alloc_handle());
        Ok(GfxCommandList::new(native, allocator, list_type, debug_name))
    }

    fn execute_command_lists(&self, queue: NativeQueue, lists: &[GfxCommandList]) -> GfxResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        if !state.queues.contains_key(&queue) {
            return Err(GfxError::InvalidHandle {
                kind: "queue",
                raw: queue.raw(),
            });
        }

        for list in lists {
            if !list.is_closed() {
                return Err(GfxError::Unsupported(format!("command list {} is not closed", list.debug_name())));
            }
            // 引用未驻留的资源相当于 GPU page fault，设备直接丢失
            for resource in list.referenced_resources() {
                let resident = state.resources.get(&resource).is_some_and(|r| r.resident);
                if !resident {
                    log::error!(
                        "HeadlessDevice: command list {} references non-resident {:?}",
                        list.debug_name(),
                        resource
                    );
                    state.lost = true;
                    drop(state);
                    self.fence_cv.notify_all();
                    return Err(GfxError::DeviceLost);
                }
            }
        }

        let barriers: usize = lists.iter().map(GfxCommandList::barrier_count).sum();
        state.stats.executed_lists += lists.len() as u64;
        state.stats.executed_barriers += barriers as u64;
        state.calls.push(HeadlessCall::Execute {
            queue,
            lists: lists.iter().map(|l| (l.native(), l.list_type())).collect(),
            commands: lists.iter().flat_map(|l| l.commands().iter().cloned()).collect(),
        });
        Ok(())
    }

    fn create_heap(&self, desc: &GfxHeapDesc) -> GfxResult<NativeHeap> {
        let mut state = self.lock();
        state.check_alive()?;
        state.reserve_memory(desc.size, self.desc.memory_capacity)?;
        let heap = NativeHeap(state.alloc_handle());
        state.heaps.insert(heap, *desc);
        Ok(heap)
    }

    fn destroy_heap(&self, heap: NativeHeap) {
        let mut state = self.lock();
        if let Some(desc) = state.heaps.remove(&heap) {
            state.used_memory -= desc.size;
        }
    }

    fn create_committed_resource(
        &self,
        desc: &GfxResourceDesc,
        _heap_type: GfxHeapType,
        _initial_state: GfxResourceState,
    ) -> GfxResult<NativeResource> {
        let mut state = self.lock();
        state.check_alive()?;
        let size = desc.allocation_size();
        state.reserve_memory(size, self.desc.memory_capacity)?;
        let resource = NativeResource(state.alloc_handle());
        state.resources.insert(
            resource,
            ResourceRecord {
                size,
                heap: None,
                offset: 0,
                resident: true,
            },
        );
        Ok(resource)
    }

    fn create_placed_resource(
        &self,
        heap: NativeHeap,
        offset: u64,
        desc: &GfxResourceDesc,
        _initial_state: GfxResourceState,
    ) -> GfxResult<NativeResource> {
        let mut state = self.lock();
        state.check_alive()?;
        let Some(heap_desc) = state.heaps.get(&heap) else {
            return Err(GfxError::InvalidHandle {
                kind: "heap",
                raw: heap.raw(),
            });
        };
        let size = desc.allocation_size();
        if offset % heap_desc.alignment.max(1) != 0 || offset + size > heap_desc.size {
            return Err(GfxError::Unsupported(format!(
                "placement [{offset}, {}) does not fit heap of {} bytes",
                offset + size,
                heap_desc.size
            )));
        }
        let resource = NativeResource(state.alloc_handle());
        state.resources.insert(
            resource,
            ResourceRecord {
                size,
                heap: Some(heap),
                offset,
                resident: true,
            },
        );
        Ok(resource)
    }

    fn destroy_resource(&self, resource: NativeResource) {
        let mut state = self.lock();
        if let Some(record) = state.resources.remove(&resource)
            && record.heap.is_none()
            && record.resident
        {
            state.used_memory -= record.size;
        }
    }

    fn resource_virtual_address(&self, resource: NativeResource) -> GfxResult<u64> {
        let state = self.lock();
        state.check_alive()?;
        let record = state.resources.get(&resource).ok_or(GfxError::InvalidHandle {
            kind: "resource",
            raw: resource.raw(),
        })?;
        if !record.resident {
            return Err(GfxError::NotResident(resource));
        }
        // heap 内的资源地址 = heap 基址 + offset
        let base = record.heap.map_or(resource.raw(), |h| h.raw()) << 32;
        Ok(base + record.offset)
    }

    fn make_resident(&self, resources: &[NativeResource]) -> GfxResult<()> {
        let mut state = self.lock();
        state.check_alive()?;

        let mut needed = 0;
        for resource in resources {
            let record = state.resources.get(resource).ok_or(GfxError::InvalidHandle {
                kind: "resource",
                raw: resource.raw(),
            })?;
            if !record.resident && record.heap.is_none() {
                needed += record.size;
            }
        }
        state.reserve_memory(needed, self.desc.memory_capacity)?;

        for resource in resources {
            if let Some(record) = state.resources.get_mut(resource) {
                record.resident = true;
            }
        }
        state.stats.make_resident_calls += 1;
        state.calls.push(HeadlessCall::MakeResident(resources.to_vec()));
        Ok(())
    }

    fn evict(&self, resources: &[NativeResource]) -> GfxResult<()> {
        let mut state = self.lock();
        state.check_alive()?;

        let mut freed = 0;
        for resource in resources {
            if let Some(record) = state.resources.get_mut(resource)
                && record.resident
            {
                record.resident = false;
                if record.heap.is_none() {
                    freed += record.size;
                }
            }
        }
        state.used_memory -= freed;
        state.stats.evict_calls += 1;
        state.calls.push(HeadlessCall::Evict(resources.to_vec()));
        Ok(())
    }

    fn memory_budget(&self) -> u64 {
        self.desc.memory_capacity
    }

    fn create_descriptor_heap(&self, capacity: u32, _shader_visible: bool) -> GfxResult<NativeDescriptorHeap> {
        let mut state = self.lock();
        state.check_alive()?;
        let heap = NativeDescriptorHeap(state.alloc_handle());
        state.descriptor_heaps.insert(heap, vec![None; capacity as usize]);
        Ok(heap)
    }

    fn create_view(&self, resource: NativeResource, view: &GfxViewDesc, dest: DescriptorHandle) -> GfxResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        if !state.resources.contains_key(&resource) {
            return Err(GfxError::InvalidHandle {
                kind: "resource",
                raw: resource.raw(),
            });
        }
        let slot = state
            .descriptor_heaps
            .get_mut(&dest.heap)
            .and_then(|slots| slots.get_mut(dest.index as usize))
            .ok_or(GfxError::InvalidHandle {
                kind: "descriptor",
                raw: dest.index as u64,
            })?;
        *slot = Some((resource, *view));
        Ok(())
    }

    fn copy_descriptors(&self, src: DescriptorHandle, dst: DescriptorHandle, count: u32) -> GfxResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        let invalid = |h: DescriptorHandle| GfxError::InvalidHandle {
            kind: "descriptor",
            raw: h.index as u64,
        };

        let copied = {
            let slots = state.descriptor_heaps.get(&src.heap).ok_or(invalid(src))?;
            let range = src.index as usize..(src.index + count) as usize;
            slots.get(range).ok_or(invalid(src))?.to_vec()
        };
        let slots = state.descriptor_heaps.get_mut(&dst.heap).ok_or(invalid(dst))?;
        let range = dst.index as usize..(dst.index + count) as usize;
        slots.get_mut(range).ok_or(invalid(dst))?.copy_from_slice(&copied);
        state.stats.copied_descriptors += count as u64;
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> GfxResult<NativeFence> {
        let mut state = self.lock();
        state.check_alive()?;
        let fence = NativeFence(state.alloc_handle());
        state.fences.insert(
            fence,
            FenceRecord {
                completed: initial_value,
                pending: VecDeque::new(),
            },
        );
        Ok(fence)
    }

    fn fence_completed_value(&self, fence: NativeFence) -> GfxResult<u64> {
        let mut state = self.lock();
        state.check_alive()?;
        Ok(state.fence_mut(fence)?.completed)
    }

    fn wait_fence(&self, fence: NativeFence, value: u64, timeout: Duration) -> GfxResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            state.check_alive()?;
            if state.fence_mut(fence)?.completed >= value {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .fence_cv
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn signal(&self, queue: NativeQueue, fence: NativeFence, value: u64) -> GfxResult<()> {
        let mut state = self.lock();
        state.check_alive()?;
        if let Some(pos) = state.rejected_signals.iter().position(|&v| v == value) {
            state.rejected_signals.swap_remove(pos);
            return Err(GfxError::Unsupported(format!("signal {value} rejected")));
        }
        if !state.queues.contains_key(&queue) {
            return Err(GfxError::InvalidHandle {
                kind: "queue",
                raw: queue.raw(),
            });
        }
        match self.desc.completion {
            HeadlessCompletion::Immediate => {
                let record = state.fence_mut(fence)?;
                record.completed = record.completed.max(value);
            }
            HeadlessCompletion::Manual => {
                state.fence_mut(fence)?.pending.push_back(value);
                state.pending_signals.push_back((fence, value));
            }
        }
        state.stats.signals += 1;
        state.calls.push(HeadlessCall::Signal { fence, value });
        drop(state);
        self.fence_cv.notify_all();
        Ok(())
    }
}
