//! Descriptor Table Manager
//!
//! CPU 侧的描述符堆，以槽位为单位分配视图；释放的槽位按后进先出复用。
//! 另有一块 shader visible 的堆，每个 frame slot 一段，每帧把本帧用到的描述符拷贝过去。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ember_gfx::device::GfxDevice;
use ember_gfx::handles::{DescriptorHandle, NativeDescriptorHeap, NativeResource};
use ember_gfx::resources::view::GfxViewDesc;

use crate::error::FrameError;

struct DescriptorState {
    /// 从未分配过的第一个槽位
    next: u32,
    /// 释放的槽位，LIFO
    free: Vec<u32>,
}

pub struct DescriptorTableManager {
    device: Arc<dyn GfxDevice>,

    cpu_heap: NativeDescriptorHeap,
    capacity: u32,
    state: Mutex<DescriptorState>,

    /// 每个 frame slot 一段连续区间，每段长度为 capacity
    frame_heap: NativeDescriptorHeap,
    frame_count: u32,
}

// new & init
impl DescriptorTableManager {
    pub fn new(device: Arc<dyn GfxDevice>, capacity: u32, frame_count: u32) -> Result<Self, FrameError> {
        let cpu_heap = device.create_descriptor_heap(capacity, false)?;
        let frame_heap = device.create_descriptor_heap(capacity * frame_count, true)?;
        log::info!("DescriptorTableManager: {} descriptors, {} frame tables", capacity, frame_count);
        Ok(Self {
            device,
            cpu_heap,
            capacity,
            state: Mutex::new(DescriptorState {
                next: 0,
                free: Vec::new(),
            }),
            frame_heap,
            frame_count,
        })
    }
}

// getters
impl DescriptorTableManager {
    fn lock(&self) -> MutexGuard<'_, DescriptorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 当前已经分配出去的槽位数量
    pub fn allocated_count(&self) -> u32 {
        let state = self.lock();
        state.next - state.free.len() as u32
    }

    /// 第 `slot` 个 frame table 的起始位置
    #[inline]
    pub fn frame_table(&self, slot: usize) -> DescriptorHandle {
        DescriptorHandle::new(self.frame_heap, slot as u32 * self.capacity)
    }
}

// tools
impl DescriptorTableManager {
    pub fn allocate(&self) -> Result<DescriptorHandle, FrameError> {
        let mut state = self.lock();
        let index = match state.free.pop() {
            Some(index) => index,
            None if state.next < self.capacity => {
                state.next += 1;
                state.next - 1
            }
            None => {
                return Err(FrameError::AllocationFailure {
                    requested: 1,
                    name: "descriptor table".to_string(),
                });
            }
        };
        Ok(DescriptorHandle::new(self.cpu_heap, index))
    }

    pub fn free(&self, handle: DescriptorHandle) {
        debug_assert_eq!(handle.heap, self.cpu_heap, "descriptor from another heap");
        let mut state = self.lock();
        debug_assert!(!state.free.contains(&handle.index), "descriptor freed twice");
        state.free.push(handle.index);
    }

    /// 分配一个槽位并在其中创建视图
    pub fn create_view(&self, resource: NativeResource, view: &GfxViewDesc) -> Result<DescriptorHandle, FrameError> {
        let handle = self.allocate()?;
        if let Err(e) = self.device.create_view(resource, view, handle) {
            self.free(handle);
            return Err(e.into());
        }
        Ok(handle)
    }

    /// 把本帧用到的描述符拷贝到 frame slot 对应的 shader visible 区间
    ///
    /// 返回该区间的起始位置，第 i 个描述符位于 `base.offset(i)`。
    pub fn stage_frame_table(&self, slot: usize, descriptors: &[DescriptorHandle]) -> Result<DescriptorHandle, FrameError> {
        let _span = ember_crate_tools::profile_span!("DescriptorTableManager::stage_frame_table");

        debug_assert!((slot as u32) < self.frame_count);
        if descriptors.len() > self.capacity as usize {
            return Err(FrameError::AllocationFailure {
                requested: descriptors.len() as u64,
                name: "frame descriptor table".to_string(),
            });
        }

        let base = self.frame_table(slot);
        for (i, descriptor) in descriptors.iter().enumerate() {
            self.device.copy_descriptors(*descriptor, base.offset(i as u32), 1)?;
        }
        Ok(base)
    }
}
