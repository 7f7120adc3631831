//! Sync Point
//!
//! 每个队列一条时间线：一个 fence 加上严格递增的 signal 值。
//! 值不大于 fence 完成值的 sync point 即为 Retired，且不会回退。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ember_gfx::GfxError;
use ember_gfx::device::GfxDevice;
use ember_gfx::handles::{NativeFence, NativeQueue};

use crate::error::FrameError;

/// SyncPoint 所属的队列
pub type GfxQueueId = NativeQueue;

/// 某个队列上的一次提交的完成标记
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncPoint {
    pub queue: GfxQueueId,
    pub value: u64,
}

impl SyncPoint {
    #[inline]
    pub fn new(queue: GfxQueueId, value: u64) -> Self {
        Self { queue, value }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPointStatus {
    /// 值已经分配，但还没有提交 signal
    Pending,
    /// signal 已经提交，GPU 尚未执行到
    Signaled,
    /// GPU 已经执行完此前的所有工作
    Retired,
}

/// 单个队列的时间线
pub struct SyncTimeline {
    device: Arc<dyn GfxDevice>,
    queue: NativeQueue,
    fence: NativeFence,

    /// 下一次 signal 使用的值
    next_value: AtomicU64,
    /// 已经成功提交 signal 的最大值
    last_signaled: AtomicU64,
    /// 观察到的 fence 完成值，只增不减
    completed: AtomicU64,
}

// new & init
impl SyncTimeline {
    pub fn new(device: Arc<dyn GfxDevice>, queue: NativeQueue) -> Result<Self, FrameError> {
        let fence = device.create_fence(0)?;
        Ok(Self {
            device,
            queue,
            fence,
            next_value: AtomicU64::new(1),
            last_signaled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }
}

// getters
impl SyncTimeline {
    #[inline]
    pub fn queue(&self) -> NativeQueue {
        self.queue
    }

    #[inline]
    pub fn fence(&self) -> NativeFence {
        self.fence
    }

    /// 最近一次成功提交的 sync point；还没有提交过时 value 为 0
    #[inline]
    pub fn last_signaled(&self) -> SyncPoint {
        SyncPoint::new(self.queue, self.last_signaled.load(Ordering::Acquire))
    }

    /// 缓存的完成值，不访问设备
    #[inline]
    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

// tools
impl SyncTimeline {
    /// 在队列上提交一次 signal，返回严格大于之前所有值的 sync point
    pub fn signal(&self) -> Result<SyncPoint, FrameError> {
        let value = self.next_value.fetch_add(1, Ordering::AcqRel);
        self.device.signal(self.queue, self.fence, value)?;
        self.last_signaled.fetch_max(value, Ordering::AcqRel);
        Ok(SyncPoint::new(self.queue, value))
    }

    /// 向设备查询完成值并更新缓存
    pub fn poll(&self) -> Result<u64, FrameError> {
        let value = self.device.fence_completed_value(self.fence)?;
        Ok(self.observe(value))
    }

    fn observe(&self, value: u64) -> u64 {
        let prev = self.completed.fetch_max(value, Ordering::AcqRel);
        prev.max(value)
    }

    pub fn status(&self, sync_point: SyncPoint) -> SyncPointStatus {
        debug_assert_eq!(sync_point.queue, self.queue, "sync point belongs to another queue");

        let completed = self.poll().unwrap_or_else(|_| self.completed_value());
        if sync_point.value <= completed {
            SyncPointStatus::Retired
        } else if sync_point.value <= self.last_signaled.load(Ordering::Acquire) {
            SyncPointStatus::Signaled
        } else {
            SyncPointStatus::Pending
        }
    }

    #[inline]
    pub fn is_retired(&self, sync_point: SyncPoint) -> bool {
        self.status(sync_point) == SyncPointStatus::Retired
    }

    /// 有界等待 sync point 退休
    pub fn wait(&self, sync_point: SyncPoint, timeout: Duration) -> Result<(), FrameError> {
        if sync_point.value <= self.completed_value() {
            return Ok(());
        }
        match self.device.wait_fence(self.fence, sync_point.value, timeout) {
            Ok(true) => {
                self.observe(sync_point.value);
                Ok(())
            }
            Ok(false) | Err(GfxError::Timeout) => Err(FrameError::SyncTimeout { sync_point, timeout }),
            Err(e) => Err(e.into()),
        }
    }

    /// 等待目前为止提交的所有工作完成
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), FrameError> {
        self.wait(self.last_signaled(), timeout)
    }
}

#[cfg(test)]
mod tests {
    use ember_gfx::commands::command_list::GfxCommandListType;
    use ember_gfx::commands::queue::GfxQueueDesc;
    use ember_gfx::headless::{HeadlessCompletion, HeadlessDevice, HeadlessDeviceDesc};

    use super::*;

    fn manual_timeline() -> (Arc<HeadlessDevice>, SyncTimeline) {
        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
            completion: HeadlessCompletion::Manual,
            ..Default::default()
        }));
        let queue = device.create_command_queue(&GfxQueueDesc::new(GfxCommandListType::Graphics, "main")).unwrap();
        let timeline = SyncTimeline::new(device.clone(), queue).unwrap();
        (device, timeline)
    }

    #[test]
    fn test_values_strictly_increase() {
        let (_device, timeline) = manual_timeline();
        let a = timeline.signal().unwrap();
        let b = timeline.signal().unwrap();
        let c = timeline.signal().unwrap();
        assert!(a.value < b.value && b.value < c.value);
        assert_eq!(timeline.last_signaled(), c);
    }

    #[test]
    fn test_status_transitions() {
        let (device, timeline) = manual_timeline();
        let sp = timeline.signal().unwrap();
        assert_eq!(timeline.status(sp), SyncPointStatus::Signaled);
        assert_eq!(timeline.status(SyncPoint::new(sp.queue, sp.value + 1)), SyncPointStatus::Pending);

        device.complete_all();
        assert_eq!(timeline.status(sp), SyncPointStatus::Retired);

        // 设备丢失之后查询失败，已退休的状态不回退
        device.lose_device();
        assert_eq!(timeline.status(sp), SyncPointStatus::Retired);
    }

    #[test]
    fn test_wait_timeout() {
        let (_device, timeline) = manual_timeline();
        let sp = timeline.signal().unwrap();
        assert_eq!(
            timeline.wait(sp, Duration::from_millis(5)),
            Err(FrameError::SyncTimeout {
                sync_point: sp,
                timeout: Duration::from_millis(5)
            })
        );
    }

    #[test]
    fn test_wait_device_lost() {
        let (device, timeline) = manual_timeline();
        let sp = timeline.signal().unwrap();
        device.lose_device();
        assert_eq!(timeline.wait(sp, Duration::from_millis(5)), Err(FrameError::DeviceLost));
    }
}
