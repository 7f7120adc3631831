//! Command Allocator Pool
//!
//! N 个 frame slot 组成的环，每个 slot 对每种命令列表类型各持有一个 allocator。
//! slot 被标记为最后一次使用它的帧的 sync point，只有该 sync point 退休之后才能再次获取，
//! 这就是 CPU 最多领先 GPU N 帧的背压点。

use std::sync::Arc;
use std::time::Duration;

use ember_gfx::commands::command_list::GfxCommandListType;
use ember_gfx::device::GfxDevice;
use ember_gfx::handles::NativeCommandAllocator;

use crate::error::FrameError;
use crate::sync_point::{SyncPoint, SyncTimeline};

/// 一帧获取到的录制存储
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    frame_id: u64,
    allocators: [NativeCommandAllocator; 3],
}

// getters
impl FrameSlot {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn allocator(&self, list_type: GfxCommandListType) -> NativeCommandAllocator {
        self.allocators[list_type.index()]
    }
}

struct SlotRecord {
    allocators: [NativeCommandAllocator; 3],
    /// 最后一次使用该 slot 的帧的 sync point
    tag: Option<SyncPoint>,
    acquired: bool,
}

pub struct CommandAllocatorPool {
    device: Arc<dyn GfxDevice>,
    slots: Vec<SlotRecord>,
}

// new & init
impl CommandAllocatorPool {
    pub fn new(device: Arc<dyn GfxDevice>, slot_count: usize) -> Result<Self, FrameError> {
        let slots = (0..slot_count.max(1))
            .map(|_| -> Result<SlotRecord, FrameError> {
                let allocators = [
                    device.create_command_allocator(GfxCommandListType::Graphics)?,
                    device.create_command_allocator(GfxCommandListType::Compute)?,
                    device.create_command_allocator(GfxCommandListType::Copy)?,
                ];
                Ok(SlotRecord {
                    allocators,
                    tag: None,
                    acquired: false,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { device, slots })
    }
}

// getters
impl CommandAllocatorPool {
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot_index(&self, frame_id: u64) -> usize {
        (frame_id % self.slots.len() as u64) as usize
    }

    /// slot 当前的标记
    #[inline]
    pub fn slot_tag(&self, index: usize) -> Option<SyncPoint> {
        self.slots.get(index).and_then(|s| s.tag)
    }
}

// tools
impl CommandAllocatorPool {
    /// 获取 `frame_id` 对应的 slot
    ///
    /// slot 的标记尚未退休时阻塞等待，最多等待 `timeout`。超时返回 `SyncTimeout`，
    /// 此时 slot 保持原来的标记，什么都不会被重置。
    pub fn acquire(&mut self, timeline: &SyncTimeline, frame_id: u64, timeout: Duration) -> Result<FrameSlot, FrameError> {
        let _span = ember_crate_tools::profile_span!("CommandAllocatorPool::acquire");

        let index = self.slot_index(frame_id);
        let slot = &mut self.slots[index];
        debug_assert!(!slot.acquired, "frame slot {index} acquired twice");

        if let Some(tag) = slot.tag
            && !timeline.is_retired(tag)
        {
            log::debug!("CommandAllocatorPool: frame {} waits for slot {} ({:?})", frame_id, index, tag);
            timeline.wait(tag, timeout)?;
        }

        for allocator in slot.allocators {
            self.device.reset_command_allocator(allocator)?;
        }
        slot.tag = None;
        slot.acquired = true;

        Ok(FrameSlot {
            index,
            frame_id,
            allocators: slot.allocators,
        })
    }

    /// 归还 slot；提交成功时用本帧的 sync point 标记它，中止的帧传 None
    pub fn release(&mut self, frame_slot: FrameSlot, sync_point: Option<SyncPoint>) {
        let slot = &mut self.slots[frame_slot.index];
        slot.tag = sync_point;
        slot.acquired = false;
    }
}

impl Drop for CommandAllocatorPool {
    fn drop(&mut self) {
        log::info!("Dropping CommandAllocatorPool");
    }
}
