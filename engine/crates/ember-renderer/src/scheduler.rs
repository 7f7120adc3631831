//! 帧调度器
//!
//! 每帧的状态机：
//!
//! ```text
//! Idle -> SlotAcquired -> ResidencyReady -> Recorded -> Submitted -> Retired
//! ```
//!
//! `execute_frame` 同步地走到 Submitted；Retired 由之后的 `poll_retired` 异步观察到。
//! 命令列表交给设备之前的任何错误都会中止这一帧：slot 不带标记地归还，钉住的工作集被放弃，
//! 资源状态不更新。交给设备之后的错误一律视为设备丢失。

use std::collections::VecDeque;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};

use ember_render_graph::{FrameBarriers, Pipeline, StateTracker};
use ember_render_interface::cmd_allocator_pool::{CommandAllocatorPool, FrameSlot};
use ember_render_interface::context::EngineContext;
use ember_render_interface::error::FrameError;
use ember_render_interface::handles::ResourceHandle;
use ember_render_interface::scratch_space_pool::ScratchSpacePool;
use ember_render_interface::sync_point::SyncPoint;

use crate::event_dispatcher::{PipelineEvent, PipelineEventDispatcher};
use crate::log_stream::LogStream;
use crate::present::PresentEpilogue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameState {
    Idle,
    SlotAcquired,
    ResidencyReady,
    Recorded,
    Submitted,
    Retired,
}

/// 一帧的执行记录
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRecord {
    frame_id: u64,
    state: FrameState,
    slot: usize,
    /// 在本帧命令列表之前 signal，完成即表示设备开始执行本帧
    begin_marker: Option<SyncPoint>,
    /// 在本帧命令列表之后 signal，也是 frame slot 的标记
    sync_point: Option<SyncPoint>,
    begin_observed: bool,
}

impl FrameRecord {
    fn new(frame_id: u64, slot: usize) -> Self {
        Self {
            frame_id,
            state: FrameState::Idle,
            slot,
            begin_marker: None,
            sync_point: None,
            begin_observed: false,
        }
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn begin_marker(&self) -> Option<SyncPoint> {
        self.begin_marker
    }

    #[inline]
    pub fn sync_point(&self) -> Option<SyncPoint> {
        self.sync_point
    }
}

pub struct Scheduler {
    allocators: CommandAllocatorPool,
    scratch: ScratchSpacePool,
    acquire_timeout: Duration,

    /// 已提交、尚未退休的帧，按提交顺序
    in_flight: VecDeque<FrameRecord>,
    /// 最近一次 execute_frame 的记录，包括中止的帧
    last_frame: Option<FrameRecord>,
    last_retired: Option<FrameRecord>,

    stream: LogStream,
}

// new & init
impl Scheduler {
    pub fn new(
        ctx: &EngineContext,
        frames_in_flight: usize,
        scratch_size: u64,
        acquire_timeout: Duration,
        stream: LogStream,
    ) -> Result<Self, FrameError> {
        let allocators = CommandAllocatorPool::new(ctx.device().clone(), frames_in_flight)?;
        let scratch = ScratchSpacePool::new(ctx.memory().clone(), frames_in_flight, scratch_size)?;
        Ok(Self {
            allocators,
            scratch,
            acquire_timeout,
            in_flight: VecDeque::new(),
            last_frame: None,
            last_retired: None,
            stream,
        })
    }
}

// getters
impl Scheduler {
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.allocators.slot_count()
    }

    #[inline]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    #[inline]
    pub fn allocators(&self) -> &CommandAllocatorPool {
        &self.allocators
    }

    #[inline]
    pub fn in_flight(&self) -> impl Iterator<Item = &FrameRecord> {
        self.in_flight.iter()
    }

    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// 最近一个已提交但尚未退休的帧
    #[inline]
    pub fn last_in_flight_frame(&self) -> Option<u64> {
        self.in_flight.back().map(|r| r.frame_id)
    }

    #[inline]
    pub fn last_frame(&self) -> Option<&FrameRecord> {
        self.last_frame.as_ref()
    }

    #[inline]
    pub fn last_retired(&self) -> Option<&FrameRecord> {
        self.last_retired.as_ref()
    }
}

// 每帧执行
impl Scheduler {
    /// 执行一帧，返回本帧的 sync point
    ///
    /// 可能在获取 frame slot 时阻塞，最多等待两次 `acquire_timeout`。
    pub fn execute_frame(
        &mut self,
        ctx: &EngineContext,
        pipeline: &Pipeline,
        present: Option<PresentEpilogue>,
        frame_id: u64,
        dispatcher: &PipelineEventDispatcher,
    ) -> Result<SyncPoint, FrameError> {
        let _span = ember_crate_tools::profile_span!("Scheduler::execute_frame");

        let mut record = FrameRecord::new(frame_id, self.allocators.slot_index(frame_id));

        // 1. Idle -> SlotAcquired
        let slot = self.acquire_slot(ctx, frame_id)?;
        record.state = FrameState::SlotAcquired;
        dispatcher.dispatch(PipelineEvent::FrameBeginHost, frame_id);

        match self.run_frame(ctx, pipeline, present, &slot, &mut record) {
            Ok(sync_point) => {
                self.allocators.release(slot, Some(sync_point));
                self.in_flight.push_back(record);
                self.last_frame = Some(record);
                dispatcher.dispatch(PipelineEvent::FrameCompleteHost, frame_id);
                Ok(sync_point)
            }
            Err(e) => {
                self.allocators.release(slot, None);
                ctx.residency().unpin(frame_id);
                self.last_frame = Some(record);
                self.stream.warn(format_args!("frame {} aborted in {:?}: {}", frame_id, record.state, e));
                Err(e)
            }
        }
    }

    /// 获取 slot；超时后重试一次，再次超时视为设备丢失
    fn acquire_slot(&mut self, ctx: &EngineContext, frame_id: u64) -> Result<FrameSlot, FrameError> {
        match self.allocators.acquire(ctx.timeline(), frame_id, self.acquire_timeout) {
            Err(FrameError::SyncTimeout { sync_point, timeout }) => {
                self.stream.warn(format_args!(
                    "frame {} stalled {:?} waiting for {:?} on slot {}, retrying",
                    frame_id,
                    timeout,
                    sync_point,
                    self.allocators.slot_index(frame_id)
                ));
                match self.allocators.acquire(ctx.timeline(), frame_id, self.acquire_timeout) {
                    Err(FrameError::SyncTimeout { sync_point, .. }) => {
                        self.stream.error(format_args!(
                            "frame {} stalled twice waiting for {:?}, treating the device as lost",
                            frame_id, sync_point
                        ));
                        Err(FrameError::DeviceLost)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn run_frame(
        &self,
        ctx: &EngineContext,
        pipeline: &Pipeline,
        present: Option<PresentEpilogue>,
        slot: &FrameSlot,
        record: &mut FrameRecord,
    ) -> Result<SyncPoint, FrameError> {
        let frame_id = record.frame_id;

        // 2. SlotAcquired -> ResidencyReady
        let mut working_set: IndexSet<ResourceHandle> = pipeline.working_set().clone();
        if let Some(present) = present {
            working_set.extend(present.resources());
        }
        let token = ctx.residency().prepare(ctx.memory(), &working_set, frame_id)?;
        debug_assert_eq!(token.frame_id(), frame_id);
        record.state = FrameState::ResidencyReady;

        // 3. ResidencyReady -> Recorded
        let entry_states: IndexMap<_, _> =
            working_set.iter().filter_map(|&h| ctx.memory().state(h).map(|s| (h, s))).collect();
        let mut tracker = StateTracker::with_entry_states(&entry_states);
        let per_pass = pipeline.compute_barriers_with(&mut tracker);
        let present_list = present.map(|p| p.record(ctx, slot, &mut tracker)).transpose()?;
        let barriers = FrameBarriers {
            per_pass,
            final_states: tracker.states(),
        };

        // 同时把工作集的视图拷贝到本 slot 的 frame table
        let mut scratch = self.scratch.acquire(slot.index());
        let mut lists = pipeline.record(ctx, slot, &mut scratch, &barriers)?;
        lists.extend(present_list);
        record.state = FrameState::Recorded;

        // 4. Recorded -> Submitted
        let begin_marker = ctx.timeline().signal()?;
        record.begin_marker = Some(begin_marker);
        ctx.device().execute_command_lists(ctx.queue(), &lists)?;
        // 命令列表已经在 GPU 上，没有结束标记就无法知道它们何时完成
        let sync_point = ctx.timeline().signal().map_err(|e| {
            self.stream.error(format_args!(
                "frame {} executed but its end signal failed ({}), treating the device as lost",
                frame_id, e
            ));
            FrameError::DeviceLost
        })?;
        record.sync_point = Some(sync_point);
        record.state = FrameState::Submitted;

        ctx.residency().track_in_flight(frame_id, sync_point);
        ctx.memory().commit_states(barriers.final_states.iter().map(|(&h, &s)| (h, s)));

        self.stream.debug(format_args!(
            "frame {} submitted: {} lists, {} barriers, {} resident ({} loaded, {} evicted), scratch {} bytes, {:?}",
            frame_id,
            lists.len(),
            barriers.total(),
            token.resident_count(),
            token.loaded(),
            token.evicted(),
            scratch.used(),
            sync_point
        ));
        Ok(sync_point)
    }

    /// 观察已经完成的帧
    ///
    /// 设备开始执行的帧派发 frame-begin-device，执行完成的帧派发 frame-complete-device，
    /// 并通知 ResidencyQueue 以及延迟释放。返回本次退休的帧数。
    pub fn poll_retired(&mut self, ctx: &EngineContext, dispatcher: &PipelineEventDispatcher) -> Result<usize, FrameError> {
        let completed = ctx.timeline().poll()?;

        for record in self.in_flight.iter_mut() {
            let started = record.begin_marker.is_some_and(|m| m.value <= completed);
            if !started {
                break;
            }
            if !record.begin_observed {
                record.begin_observed = true;
                dispatcher.dispatch(PipelineEvent::FrameBeginDevice, record.frame_id);
            }
        }

        let mut retired = 0;
        while let Some(sync_point) = self.in_flight.front().and_then(|r| r.sync_point).filter(|sp| sp.value <= completed)
        {
            let Some(mut record) = self.in_flight.pop_front() else {
                break;
            };
            record.state = FrameState::Retired;

            ctx.residency().retire(sync_point);
            let released = ctx.collect_garbage(record.frame_id);
            if released > 0 {
                self.stream.debug(format_args!("frame {} retired, {} deferred releases", record.frame_id, released));
            }
            dispatcher.dispatch(PipelineEvent::FrameCompleteDevice, record.frame_id);

            self.last_retired = Some(record);
            retired += 1;
        }
        Ok(retired)
    }

    /// 设备丢失之后在途帧永远不会退休
    pub fn abandon_in_flight(&mut self) {
        self.in_flight.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        log::info!("Dropping Scheduler");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ember_gfx::headless::{HeadlessCompletion, HeadlessDevice, HeadlessDeviceDesc};
    use ember_gfx::resources::resource_desc::GfxResourceDesc;
    use ember_gfx::resources::resource_state::GfxResourceState;
    use ember_render_graph::{PipelineBuilder, RgPass, RgPassBuilder, RgPassContext};
    use ember_render_interface::context::EngineContextDesc;
    use ember_render_interface::memory_manager::PlacementPolicy;

    use super::*;
    use crate::event_dispatcher::PipelineEventListener;

    struct FillPass {
        target: ResourceHandle,
    }

    impl RgPass for FillPass {
        fn setup(&mut self, builder: &mut RgPassBuilder) {
            builder.write(self.target, GfxResourceState::STORAGE_WRITE_COMPUTE);
        }

        fn execute(&self, ctx: &mut RgPassContext<'_>) {
            ctx.cmd.dispatch(1, 1, 1);
        }
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<(PipelineEvent, u64)>>);

    impl PipelineEventListener for EventLog {
        fn on_frame_begin_host(&self, frame_id: u64) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((PipelineEvent::FrameBeginHost, frame_id));
            Ok(())
        }
        fn on_frame_begin_device(&self, frame_id: u64) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((PipelineEvent::FrameBeginDevice, frame_id));
            Ok(())
        }
        fn on_frame_complete_host(&self, frame_id: u64) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((PipelineEvent::FrameCompleteHost, frame_id));
            Ok(())
        }
        fn on_frame_complete_device(&self, frame_id: u64) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((PipelineEvent::FrameCompleteDevice, frame_id));
            Ok(())
        }
    }

    fn setup(budget: u64) -> (Arc<HeadlessDevice>, EngineContext, Scheduler) {
        let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
            completion: HeadlessCompletion::Manual,
            ..Default::default()
        }));
        let ctx = EngineContext::new(
            device.clone(),
            &EngineContextDesc {
                frames_in_flight: 2,
                residency_budget: budget,
                descriptor_capacity: 32,
                heap_block_size: 1 << 20,
            },
        )
        .unwrap();
        let scheduler =
            Scheduler::new(&ctx, 2, 256, Duration::from_millis(10), LogStream::pipeline(None)).unwrap();
        (device, ctx, scheduler)
    }

    fn fill_pipeline(target: ResourceHandle) -> Pipeline {
        let mut builder = PipelineBuilder::new();
        builder.add_pass("fill", FillPass { target });
        builder.build().unwrap()
    }

    #[test]
    fn test_frame_events_and_retirement() {
        let (device, ctx, mut scheduler) = setup(1 << 30);
        let target = ctx.create_resource(&GfxResourceDesc::buffer(1024), PlacementPolicy::Placed, "target").unwrap();
        let pipeline = fill_pipeline(target);

        let events = Arc::new(EventLog::default());
        let mut dispatcher = PipelineEventDispatcher::default();
        dispatcher.register(events.clone());

        let sp = scheduler.execute_frame(&ctx, &pipeline, None, 0, &dispatcher).unwrap();
        assert_eq!(scheduler.last_frame().unwrap().state(), FrameState::Submitted);
        assert_eq!(ctx.residency().pinned_count(), 0);
        assert_eq!(ctx.residency().in_flight_count(), 1);
        assert_eq!(scheduler.poll_retired(&ctx, &dispatcher).unwrap(), 0);

        // 只完成 begin marker
        assert!(device.complete_next());
        assert_eq!(scheduler.poll_retired(&ctx, &dispatcher).unwrap(), 0);
        device.complete_fence(ctx.timeline().fence(), sp.value);
        assert_eq!(scheduler.poll_retired(&ctx, &dispatcher).unwrap(), 1);
        assert_eq!(scheduler.last_retired().unwrap().state(), FrameState::Retired);
        assert_eq!(ctx.memory().state(target), Some(GfxResourceState::STORAGE_WRITE_COMPUTE));

        assert_eq!(
            *events.0.lock().unwrap(),
            vec![
                (PipelineEvent::FrameBeginHost, 0),
                (PipelineEvent::FrameCompleteHost, 0),
                (PipelineEvent::FrameBeginDevice, 0),
                (PipelineEvent::FrameCompleteDevice, 0),
            ]
        );
    }

    #[test]
    fn test_aborted_frame_releases_slot_untagged() {
        // 预算小于工作集
        let (device, ctx, mut scheduler) = setup(1024);
        let target =
            ctx.create_resource(&GfxResourceDesc::buffer(256 * 1024), PlacementPolicy::Committed, "big").unwrap();
        let pipeline = fill_pipeline(target);
        let dispatcher = PipelineEventDispatcher::default();
        device.clear_calls();

        let err = scheduler.execute_frame(&ctx, &pipeline, None, 0, &dispatcher).unwrap_err();
        assert!(matches!(err, FrameError::ResidencyOvercommit { .. }));
        assert_eq!(scheduler.last_frame().unwrap().state(), FrameState::SlotAcquired);
        assert_eq!(scheduler.allocators().slot_tag(0), None);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert_eq!(device.stats().executed_lists, 0);
        assert_eq!(ctx.memory().state(target), Some(GfxResourceState::COMMON));
    }

    #[test]
    fn test_end_signal_failure_is_device_lost() {
        let (device, ctx, mut scheduler) = setup(1 << 30);
        let target = ctx.create_resource(&GfxResourceDesc::buffer(64), PlacementPolicy::Placed, "t").unwrap();
        let pipeline = fill_pipeline(target);
        let dispatcher = PipelineEventDispatcher::default();

        // begin marker 之后的第二个 signal 是本帧的结束标记
        device.reject_signal(ctx.timeline().last_signaled().value + 2);
        let err = scheduler.execute_frame(&ctx, &pipeline, None, 0, &dispatcher).unwrap_err();
        assert_eq!(err, FrameError::DeviceLost);
        assert_eq!(device.stats().executed_lists, 1);
        assert_eq!(scheduler.last_frame().unwrap().state(), FrameState::Recorded);
        assert_eq!(ctx.residency().pinned_count(), 0);
    }

    #[test]
    fn test_begin_signal_failure_aborts_frame() {
        let (device, ctx, mut scheduler) = setup(1 << 30);
        let target = ctx.create_resource(&GfxResourceDesc::buffer(64), PlacementPolicy::Placed, "t").unwrap();
        let pipeline = fill_pipeline(target);
        let dispatcher = PipelineEventDispatcher::default();

        device.reject_signal(ctx.timeline().last_signaled().value + 1);
        let err = scheduler.execute_frame(&ctx, &pipeline, None, 0, &dispatcher).unwrap_err();
        assert!(matches!(err, FrameError::Device(_)));
        assert_eq!(device.stats().executed_lists, 0);
        assert_eq!(scheduler.allocators().slot_tag(0), None);
        assert_eq!(ctx.residency().pinned_count(), 0);
        assert_eq!(ctx.residency().in_flight_count(), 0);

        // 下一帧正常提交
        scheduler.execute_frame(&ctx, &pipeline, None, 1, &dispatcher).unwrap();
        assert_eq!(ctx.residency().in_flight_count(), 1);
    }

    #[test]
    fn test_frame_tables_staged_per_slot() {
        let (device, ctx, mut scheduler) = setup(1 << 30);
        let target = ctx.create_resource(&GfxResourceDesc::buffer(1024), PlacementPolicy::Placed, "t").unwrap();
        let native = ctx.memory().native(target).unwrap();
        let pipeline = fill_pipeline(target);
        let dispatcher = PipelineEventDispatcher::default();

        for frame_id in 0..2 {
            let copied = device.stats().copied_descriptors;
            scheduler.execute_frame(&ctx, &pipeline, None, frame_id, &dispatcher).unwrap();
            assert_eq!(device.stats().copied_descriptors, copied + 1);

            let slot = scheduler.allocators().slot_index(frame_id);
            let table = ctx.descriptors().frame_table(slot);
            assert_eq!(device.descriptor(table).map(|(r, _)| r), Some(native));
        }
        assert_ne!(ctx.descriptors().frame_table(0), ctx.descriptors().frame_table(1));
    }

    #[test]
    fn test_second_timeout_escalates_to_device_lost() {
        let (_device, ctx, mut scheduler) = setup(1 << 30);
        let target = ctx.create_resource(&GfxResourceDesc::buffer(64), PlacementPolicy::Placed, "t").unwrap();
        let pipeline = fill_pipeline(target);
        let dispatcher = PipelineEventDispatcher::default();

        scheduler.execute_frame(&ctx, &pipeline, None, 0, &dispatcher).unwrap();
        scheduler.execute_frame(&ctx, &pipeline, None, 1, &dispatcher).unwrap();
        // 设备一直不完成，frame 2 的 slot 永远拿不到
        let err = scheduler.execute_frame(&ctx, &pipeline, None, 2, &dispatcher).unwrap_err();
        assert_eq!(err, FrameError::DeviceLost);
        assert!(scheduler.allocators().slot_tag(0).is_some());
    }
}
