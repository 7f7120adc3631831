//! 整帧测试：GraphicsEngine 跑在 HeadlessDevice 上

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ember_gfx::commands::command_list::GfxCommand;
use ember_gfx::headless::{HeadlessCall, HeadlessCompletion, HeadlessDevice, HeadlessDeviceDesc, HeadlessDeviceManager};
use ember_gfx::resources::resource_desc::GfxResourceDesc;
use ember_gfx::resources::resource_state::GfxResourceState;
use ember_render_graph::{Pipeline, PipelineBuilder, RgPass, RgPassBuilder, RgPassContext};
use ember_render_interface::error::FrameError;
use ember_render_interface::handles::ResourceHandle;
use ember_render_interface::memory_manager::PlacementPolicy;
use ember_renderer::{EngineSettings, GraphicsEngine, GraphicsEngineDesc, PipelineEventListener};
use raw_window_handle::{RawWindowHandle, WebWindowHandle};

const UNIT: u64 = 256 * 1024;
const SCRATCH: u64 = 64 * 1024;
const FRAME: Duration = Duration::from_millis(16);

/// 对每个资源按给定状态访问
struct UsePass {
    reads: Vec<(ResourceHandle, GfxResourceState)>,
    writes: Vec<(ResourceHandle, GfxResourceState)>,
}

impl RgPass for UsePass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        for &(h, s) in &self.reads {
            builder.read(h, s);
        }
        for &(h, s) in &self.writes {
            builder.write(h, s);
        }
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        ctx.cmd.draw(3, 1, 0);
    }
}

fn writer(targets: &[ResourceHandle]) -> Pipeline {
    let mut builder = PipelineBuilder::new();
    builder.add_pass(
        "write",
        UsePass {
            reads: Vec::new(),
            writes: targets.iter().map(|&h| (h, GfxResourceState::COLOR_ATTACHMENT_WRITE)).collect(),
        },
    );
    builder.build().unwrap()
}

fn headless(completion: HeadlessCompletion) -> Arc<HeadlessDevice> {
    ember_crate_tools::init_log::init_test_log();
    Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
        completion,
        ..Default::default()
    }))
}

fn engine(device: &Arc<HeadlessDevice>, settings: EngineSettings) -> GraphicsEngine {
    GraphicsEngine::with_settings(
        GraphicsEngineDesc {
            device_manager: None,
            device: device.clone(),
            target_window: None,
            full_screen: false,
            width: 64,
            height: 64,
            logger: None,
        },
        settings,
    )
    .unwrap()
}

fn settings(frames_in_flight: usize) -> EngineSettings {
    EngineSettings {
        frames_in_flight,
        scratch_space_size: SCRATCH,
        descriptor_capacity: 64,
        heap_block_size: 4 * UNIT,
        ..Default::default()
    }
}

#[derive(Default)]
struct CountingListener {
    begin_host: Mutex<Vec<u64>>,
    begin_device: Mutex<Vec<u64>>,
    complete_host: Mutex<Vec<u64>>,
    complete_device: Mutex<Vec<u64>>,
}

impl PipelineEventListener for CountingListener {
    fn on_frame_begin_host(&self, frame_id: u64) -> anyhow::Result<()> {
        self.begin_host.lock().unwrap().push(frame_id);
        Ok(())
    }

    fn on_frame_begin_device(&self, frame_id: u64) -> anyhow::Result<()> {
        self.begin_device.lock().unwrap().push(frame_id);
        Ok(())
    }

    fn on_frame_complete_host(&self, frame_id: u64) -> anyhow::Result<()> {
        self.complete_host.lock().unwrap().push(frame_id);
        Ok(())
    }

    fn on_frame_complete_device(&self, frame_id: u64) -> anyhow::Result<()> {
        self.complete_device.lock().unwrap().push(frame_id);
        Ok(())
    }
}

struct BrokenListener;

impl PipelineEventListener for BrokenListener {
    fn on_frame_begin_host(&self, _frame_id: u64) -> anyhow::Result<()> {
        anyhow::bail!("broken listener")
    }

    fn on_frame_complete_device(&self, _frame_id: u64) -> anyhow::Result<()> {
        panic!("broken listener panicked")
    }
}

#[test]
fn test_third_frame_blocks_until_first_retires() {
    let device = headless(HeadlessCompletion::Manual);
    let mut engine = engine(&device, EngineSettings {
        acquire_timeout: Duration::from_secs(5),
        ..settings(2)
    });
    let target = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, "t").unwrap();
    engine.set_pipeline(writer(&[target]));

    engine.update(FRAME).unwrap();
    let frame0 = engine.scheduler().last_frame().unwrap().sync_point().unwrap();
    engine.update(FRAME).unwrap();
    let frame1 = engine.scheduler().last_frame().unwrap().sync_point().unwrap();

    let fence = engine.context().timeline().fence();
    let completer = {
        let device = device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            device.complete_fence(fence, frame0.value);
        })
    };

    let start = Instant::now();
    engine.update(FRAME).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(90));
    completer.join().unwrap();

    let timeline = engine.context().timeline();
    assert!(timeline.is_retired(frame0));
    assert!(!timeline.is_retired(frame1));
    // slot 0 现在属于 frame 2
    let frame2 = engine.scheduler().last_frame().unwrap().sync_point().unwrap();
    assert_eq!(engine.scheduler().allocators().slot_tag(0), Some(frame2));

    device.complete_all();
}

#[test]
fn test_sync_points_strictly_increase() {
    let device = headless(HeadlessCompletion::Immediate);
    let mut engine = engine(&device, settings(3));
    let target = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Placed, "t").unwrap();
    engine.set_pipeline(writer(&[target]));

    let mut previous = None;
    for _ in 0..10 {
        engine.update(FRAME).unwrap();
        let record = engine.scheduler().last_frame().unwrap();
        let begin = record.begin_marker().unwrap();
        let end = record.sync_point().unwrap();
        assert!(begin.value < end.value);
        if let Some(prev) = previous {
            assert!(begin.value > prev);
        }
        previous = Some(end.value);
    }
    assert_eq!(engine.frame_id(), 10);
}

#[test]
fn test_listener_faults_do_not_abort_frames() {
    let device = headless(HeadlessCompletion::Immediate);
    let mut engine = engine(&device, settings(2));
    let counter = Arc::new(CountingListener::default());
    engine.add_listener(Arc::new(BrokenListener));
    let id = engine.add_listener(counter.clone());

    for _ in 0..3 {
        engine.update(FRAME).unwrap();
    }
    engine.wait_idle().unwrap();

    assert_eq!(*counter.begin_host.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(*counter.complete_host.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(*counter.begin_device.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(*counter.complete_device.lock().unwrap(), vec![0, 1, 2]);

    assert!(engine.remove_listener(id));
    engine.update(FRAME).unwrap();
    assert_eq!(counter.begin_host.lock().unwrap().len(), 3);
}

#[test]
fn test_cyclic_pipeline_never_records() {
    let device = headless(HeadlessCompletion::Immediate);
    let engine = engine(&device, settings(2));
    let a = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Placed, "a").unwrap();
    let b = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Placed, "b").unwrap();

    let mut builder = PipelineBuilder::new();
    builder
        .add_pass(
            "ping",
            UsePass {
                reads: vec![(b, GfxResourceState::SHADER_READ_FRAGMENT)],
                writes: vec![(a, GfxResourceState::COLOR_ATTACHMENT_WRITE)],
            },
        )
        .add_pass(
            "pong",
            UsePass {
                reads: vec![(a, GfxResourceState::SHADER_READ_FRAGMENT)],
                writes: vec![(b, GfxResourceState::COLOR_ATTACHMENT_WRITE)],
            },
        );
    match builder.build() {
        Err(FrameError::BarrierConflict(msg)) => assert!(msg.contains("ping") && msg.contains("pong")),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("cycle accepted"),
    }
    assert_eq!(device.stats().executed_lists, 0);
}

#[test]
fn test_overcommitted_frame_is_dropped() {
    let device = headless(HeadlessCompletion::Immediate);
    let sink = Arc::new(CaptureLog::default());
    let mut engine = GraphicsEngine::with_settings(
        GraphicsEngineDesc {
            device_manager: None,
            device: device.clone(),
            target_window: None,
            full_screen: false,
            width: 64,
            height: 64,
            logger: Some(sink.clone()),
        },
        EngineSettings {
            residency_budget: Some(2 * SCRATCH + UNIT),
            ..settings(2)
        },
    )
    .unwrap();
    let a = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, "a").unwrap();
    let b = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, "b").unwrap();
    engine.set_pipeline(writer(&[a, b]));
    device.clear_calls();

    let err = engine.update(FRAME).unwrap_err();
    assert!(matches!(err, FrameError::ResidencyOvercommit { .. }));
    assert!(!err.is_fatal());
    assert_eq!(engine.frame_id(), 1);
    assert!(!device.calls().iter().any(|c| matches!(c, HeadlessCall::MakeResident(_) | HeadlessCall::Execute { .. })));
    assert!(sink.contains("dropped"));

    // 预算放宽之后继续出帧
    engine.context().residency().set_budget(2 * SCRATCH + 2 * UNIT);
    engine.update(FRAME).unwrap();
    assert_eq!(device.stats().executed_lists, 1);
}

#[test]
fn test_working_set_resident_at_submission() {
    let device = headless(HeadlessCompletion::Immediate);
    let mut engine = engine(&device, EngineSettings {
        residency_budget: Some(2 * SCRATCH + 2 * UNIT),
        ..settings(2)
    });
    let ctx = engine.context().clone();
    let create = |name| ctx.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, name).unwrap();
    let (a, b, c) = (create("a"), create("b"), create("c"));
    let native = |h| ctx.memory().native(h).unwrap();

    // {A, B}：C 被驱逐
    engine.set_pipeline(writer(&[a, b]));
    engine.update(FRAME).unwrap();
    assert_eq!(device.is_resident(native(c)), Some(false));

    // {B, C}：A 是最久未使用的，被驱逐；C 重新加载
    engine.set_pipeline(writer(&[b, c]));
    device.clear_calls();
    engine.update(FRAME).unwrap();

    let calls = device.calls();
    let evict = calls.iter().position(|call| *call == HeadlessCall::Evict(vec![native(a)])).unwrap();
    let load = calls.iter().position(|call| *call == HeadlessCall::MakeResident(vec![native(c)])).unwrap();
    let execute = calls.iter().position(|call| matches!(call, HeadlessCall::Execute { .. })).unwrap();
    assert!(evict < load && load < execute);

    assert_eq!(ctx.memory().is_resident(a), Some(false));
    assert_eq!(ctx.memory().is_resident(b), Some(true));
    assert_eq!(ctx.memory().is_resident(c), Some(true));
    assert!(!device.is_lost());
}

/// 录制时顺便分配一个新资源，模拟并发的流式加载
struct StreamingPass {
    target: ResourceHandle,
    streamed: Arc<Mutex<Vec<Result<ResourceHandle, FrameError>>>>,
}

impl RgPass for StreamingPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        builder.write(self.target, GfxResourceState::COLOR_ATTACHMENT_WRITE);
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        let result = ctx.engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, "streamed");
        self.streamed.lock().unwrap().push(result);
        ctx.cmd.draw(3, 1, 0);
    }
}

#[test]
fn test_allocation_during_recording_keeps_working_set() {
    ember_crate_tools::init_log::init_test_log();
    // 两块 scratch 加上一个资源正好占满设备
    let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc {
        memory_capacity: 2 * SCRATCH + UNIT,
        completion: HeadlessCompletion::Immediate,
    }));
    let mut engine = engine(&device, EngineSettings {
        residency_budget: Some(2 * SCRATCH + 2 * UNIT),
        ..settings(2)
    });
    let target = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, "target").unwrap();

    let streamed = Arc::new(Mutex::new(Vec::new()));
    let mut builder = PipelineBuilder::new();
    builder.add_pass(
        "stream",
        StreamingPass {
            target,
            streamed: streamed.clone(),
        },
    );
    engine.set_pipeline(builder.build().unwrap());

    // 本帧的工作集不能被腾出来给新分配使用
    engine.update(FRAME).unwrap();
    assert!(matches!(streamed.lock().unwrap()[0], Err(FrameError::AllocationFailure { .. })));
    assert_eq!(engine.context().memory().is_resident(target), Some(true));
    assert!(!device.is_lost());
    assert_eq!(device.stats().executed_lists, 1);

    // 帧退休之后，target 不再受保护
    engine.set_pipeline(Pipeline::empty());
    engine.wait_idle().unwrap();
    assert_eq!(engine.context().residency().in_flight_count(), 0);
    let late = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, "late");
    assert!(late.is_ok());
    assert_eq!(engine.context().memory().is_resident(target), Some(false));
}

#[test]
fn test_device_lost_is_terminal() {
    let device = headless(HeadlessCompletion::Immediate);
    let mut engine = engine(&device, settings(2));
    let target = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Placed, "t").unwrap();
    engine.set_pipeline(writer(&[target]));
    engine.update(FRAME).unwrap();

    device.lose_device();
    assert_eq!(engine.update(FRAME), Err(FrameError::DeviceLost));
    assert!(engine.is_device_lost());
    assert_eq!(engine.context().memory().is_resident(target), Some(false));
    assert_eq!(engine.context().residency().in_flight_count(), 0);

    assert_eq!(engine.update(FRAME), Err(FrameError::DeviceLost));
    assert_eq!(engine.wait_idle(), Err(FrameError::DeviceLost));
    assert_eq!(
        engine.create_resource(&GfxResourceDesc::buffer(64), PlacementPolicy::Placed, "late").unwrap_err(),
        FrameError::DeviceLost
    );
}

#[test]
fn test_present_copies_into_back_buffer() {
    let device = headless(HeadlessCompletion::Immediate);
    let mut engine = GraphicsEngine::with_settings(
        GraphicsEngineDesc {
            device_manager: Some(Arc::new(HeadlessDeviceManager)),
            device: device.clone(),
            target_window: Some(RawWindowHandle::Web(WebWindowHandle::new(1))),
            full_screen: false,
            width: 32,
            height: 32,
            logger: None,
        },
        EngineSettings {
            back_buffer_count: 2,
            ..settings(2)
        },
    )
    .unwrap();
    let scene = engine
        .create_resource(
            &GfxResourceDesc::texture_2d(32, 32, ash::vk::Format::R8G8B8A8_UNORM),
            PlacementPolicy::Placed,
            "scene",
        )
        .unwrap();
    engine.set_pipeline(writer(&[scene]));
    engine.set_present_source(Some(scene));

    let back_buffer = engine.present_target().unwrap().current_back_buffer().unwrap();
    engine.update(FRAME).unwrap();

    let memory = engine.context().memory().clone();
    assert_eq!(memory.state(scene), Some(GfxResourceState::TRANSFER_SRC));
    assert_eq!(memory.state(back_buffer), Some(GfxResourceState::PRESENT));
    assert_ne!(engine.present_target().unwrap().current_back_buffer(), Some(back_buffer));

    let commands = device
        .calls()
        .into_iter()
        .rev()
        .find_map(|c| match c {
            HeadlessCall::Execute { commands, .. } => Some(commands),
            _ => None,
        })
        .unwrap();
    let src = memory.native(scene).unwrap();
    let dst = memory.native(back_buffer).unwrap();
    assert!(commands.contains(&GfxCommand::CopyTexture { src, dst }));

    // 下一帧：scene 先回到附件状态，拷贝之后再回到 TRANSFER_SRC，各一个 barrier
    device.clear_calls();
    engine.update(FRAME).unwrap();
    assert_eq!(memory.state(scene), Some(GfxResourceState::TRANSFER_SRC));
    let scene_barriers = device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            HeadlessCall::Execute { commands, .. } => Some(commands),
            _ => None,
        })
        .flatten()
        .filter_map(|c| match c {
            GfxCommand::Barrier(barriers) => Some(barriers),
            _ => None,
        })
        .flatten()
        .filter(|b| b.resource == src)
        .map(|b| (b.before, b.after))
        .collect::<Vec<_>>();
    assert_eq!(
        scene_barriers,
        vec![
            (GfxResourceState::TRANSFER_SRC, GfxResourceState::COLOR_ATTACHMENT_WRITE),
            (GfxResourceState::COLOR_ATTACHMENT_WRITE, GfxResourceState::TRANSFER_SRC),
        ]
    );
}

#[test]
fn test_release_waits_for_in_flight_frames() {
    let device = headless(HeadlessCompletion::Manual);
    let mut engine = engine(&device, settings(2));
    let target = engine.create_resource(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Placed, "t").unwrap();
    engine.set_pipeline(writer(&[target]));
    engine.update(FRAME).unwrap();

    engine.set_pipeline(Pipeline::empty());
    engine.release_resource(target).unwrap();
    assert!(engine.context().memory().contains(target));
    assert_eq!(engine.context().pending_release_count(), 1);

    device.complete_all();
    engine.wait_idle().unwrap();
    assert!(!engine.context().memory().contains(target));
}

/// 保存所有日志记录的 sink
#[derive(Default)]
struct CaptureLog {
    lines: Mutex<Vec<String>>,
}

impl CaptureLog {
    fn contains(&self, needle: &str) -> bool {
        self.lines.lock().unwrap().iter().any(|l| l.contains(needle))
    }
}

impl log::Log for CaptureLog {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        self.lines.lock().unwrap().push(format!("{} {}", record.target(), record.args()));
    }

    fn flush(&self) {}
}
