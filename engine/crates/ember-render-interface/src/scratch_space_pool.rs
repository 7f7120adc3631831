//! Scratch Space Pool
//!
//! 每个 frame slot 一块 upload heap 中的 buffer，帧内用线性分配器切分，
//! slot 重新获取时整体重置。

use std::sync::Arc;

use ember_gfx::handles::NativeResource;
use ember_gfx::resources::resource_desc::{GfxAllocationInfo, GfxHeapType, GfxResourceDesc, align_up};
use ember_gfx::resources::resource_state::GfxResourceState;

use crate::error::FrameError;
use crate::handles::ResourceHandle;
use crate::memory_manager::{MemoryManager, PlacementPolicy};

/// scratch 中的一段区间
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchAllocation {
    pub buffer: ResourceHandle,
    pub resource: NativeResource,
    pub offset: u64,
    pub size: u64,
}

/// 一帧的 scratch 空间，线性分配
#[derive(Debug)]
pub struct ScratchSpace {
    slot_index: usize,
    buffer: ResourceHandle,
    resource: NativeResource,
    capacity: u64,
    cursor: u64,
}

impl ScratchSpace {
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<ScratchAllocation, FrameError> {
        let offset = align_up(self.cursor, align.max(1));
        let Some(end) = offset.checked_add(size).filter(|&end| end <= self.capacity) else {
            return Err(FrameError::AllocationFailure {
                requested: size,
                name: format!("scratch space of slot {}", self.slot_index),
            });
        };
        self.cursor = end;
        Ok(ScratchAllocation {
            buffer: self.buffer,
            resource: self.resource,
            offset,
            size,
        })
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.cursor
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn buffer(&self) -> ResourceHandle {
        self.buffer
    }
}

struct ScratchSlot {
    buffer: ResourceHandle,
    resource: NativeResource,
}

pub struct ScratchSpacePool {
    memory: Arc<MemoryManager>,
    slots: Vec<ScratchSlot>,
    slot_size: u64,
}

// new & init
impl ScratchSpacePool {
    pub fn new(memory: Arc<MemoryManager>, slot_count: usize, slot_size: u64) -> Result<Self, FrameError> {
        let mut slots = Vec::with_capacity(slot_count);
        for i in 0..slot_count.max(1) {
            let info = GfxAllocationInfo::new(GfxResourceDesc::buffer(slot_size), format!("scratch-space-{i}"))
                .heap_type(GfxHeapType::Upload)
                .initial_state(GfxResourceState::HOST_WRITE);
            let buffer = memory.allocate_with(&info, PlacementPolicy::Committed)?;
            // scratch 在整个帧内都可能被任意 pass 读取
            memory.set_essential(buffer, true)?;
            let resource = memory.native(buffer)?;
            slots.push(ScratchSlot { buffer, resource });
        }
        Ok(Self {
            memory,
            slots,
            slot_size,
        })
    }
}

// getters
impl ScratchSpacePool {
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }
}

// tools
impl ScratchSpacePool {
    /// 获取 slot 的 scratch 空间并重置分配位置
    ///
    /// 调用者必须先通过 CommandAllocatorPool 确认该 slot 的上一帧已经退休。
    pub fn acquire(&self, slot_index: usize) -> ScratchSpace {
        let slot = &self.slots[slot_index % self.slots.len()];
        ScratchSpace {
            slot_index,
            buffer: slot.buffer,
            resource: slot.resource,
            capacity: self.slot_size,
            cursor: 0,
        }
    }
}

impl Drop for ScratchSpacePool {
    fn drop(&mut self) {
        log::info!("Dropping ScratchSpacePool");
        for slot in self.slots.drain(..) {
            if let Err(e) = self.memory.release(slot.buffer) {
                log::warn!("ScratchSpacePool: failed to release scratch buffer: {e}");
            }
        }
    }
}
