//! GraphicsEngine：宿主看到的入口
//!
//! 构造时接收配置记录（设备管理器、设备、目标窗口、全屏、尺寸、日志 sink），
//! 之后每个 tick 调用一次 `update(elapsed)`，准备并提交一帧。

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use raw_window_handle::RawWindowHandle;

use ember_gfx::device::{GfxDevice, GfxDeviceManager, GfxSwapChainDesc};
use ember_gfx::resources::resource_desc::GfxResourceDesc;
use ember_render_graph::Pipeline;
use ember_render_interface::context::{EngineContext, EngineContextDesc};
use ember_render_interface::error::FrameError;
use ember_render_interface::frame_counter::FrameCounter;
use ember_render_interface::handles::ResourceHandle;
use ember_render_interface::memory_manager::PlacementPolicy;

use crate::event_dispatcher::{ListenerId, PipelineEventDispatcher, PipelineEventListener};
use crate::log_stream::LogStream;
use crate::present::PresentTarget;
use crate::scheduler::Scheduler;

/// 构造时的配置记录
pub struct GraphicsEngineDesc {
    /// 为目标窗口创建 swap chain；为 None 时不做 present
    pub device_manager: Option<Arc<dyn GfxDeviceManager>>,
    pub device: Arc<dyn GfxDevice>,
    pub target_window: Option<RawWindowHandle>,
    pub full_screen: bool,
    pub width: u32,
    pub height: u32,
    /// `general` 和 `pipeline` 两条日志流写到这里；为 None 时写到全局 `log`
    pub logger: Option<Arc<dyn log::Log>>,
}

/// 可调参数
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// 最多同时在途的帧数，也是 frame slot 的数量
    pub frames_in_flight: usize,
    /// 获取 frame slot 时单次等待的上限
    pub acquire_timeout: Duration,
    /// 驻留预算（字节）；None 表示设备报告预算的 80%
    pub residency_budget: Option<u64>,
    /// 每个 frame slot 的 scratch 大小
    pub scratch_space_size: u64,
    pub descriptor_capacity: u32,
    /// placed 资源的 heap 块大小
    pub heap_block_size: u64,
    pub back_buffer_count: u32,
    pub back_buffer_format: vk::Format,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            acquire_timeout: Duration::from_secs(2),
            residency_budget: None,
            scratch_space_size: 4 * 1024 * 1024,
            descriptor_capacity: 4096,
            heap_block_size: 64 * 1024 * 1024,
            back_buffer_count: 3,
            back_buffer_format: vk::Format::B8G8R8A8_UNORM,
        }
    }
}

pub struct GraphicsEngine {
    scheduler: Scheduler,
    present_target: Option<PresentTarget>,
    present_source: Option<ResourceHandle>,
    pipeline: Pipeline,
    dispatcher: PipelineEventDispatcher,

    context: Arc<EngineContext>,

    frame_counter: FrameCounter,
    absolute_time: Duration,
    device_lost: bool,

    settings: EngineSettings,
    general: LogStream,
}

// new & init
impl GraphicsEngine {
    pub fn new(desc: GraphicsEngineDesc) -> Result<Self, FrameError> {
        Self::with_settings(desc, EngineSettings::default())
    }

    pub fn with_settings(desc: GraphicsEngineDesc, settings: EngineSettings) -> Result<Self, FrameError> {
        ember_crate_tools::profile::start_profiler();
        let _span = ember_crate_tools::profile_span!("GraphicsEngine::new");

        let general = LogStream::general(desc.logger.clone());
        let pipeline_stream = LogStream::pipeline(desc.logger.clone());

        let residency_budget = settings.residency_budget.unwrap_or(desc.device.memory_budget() / 10 * 8);
        let context = Arc::new(EngineContext::new(
            desc.device.clone(),
            &EngineContextDesc {
                frames_in_flight: settings.frames_in_flight,
                residency_budget,
                descriptor_capacity: settings.descriptor_capacity,
                heap_block_size: settings.heap_block_size,
            },
        )?);

        let present_target = match (&desc.device_manager, desc.target_window) {
            (Some(device_manager), Some(window)) => {
                let swap_chain = device_manager.create_swap_chain(
                    desc.device.clone(),
                    context.queue(),
                    &GfxSwapChainDesc {
                        window: Some(window),
                        width: desc.width,
                        height: desc.height,
                        buffer_count: settings.back_buffer_count,
                        format: settings.back_buffer_format,
                        full_screen: desc.full_screen,
                    },
                )?;
                Some(PresentTarget::new(context.memory(), swap_chain))
            }
            _ => None,
        };

        let scheduler = Scheduler::new(
            &context,
            settings.frames_in_flight,
            settings.scratch_space_size,
            settings.acquire_timeout,
            pipeline_stream,
        )?;

        general.info(format_args!(
            "GraphicsEngine created: {}x{}{}, {} frames in flight, residency budget {} bytes, present {}",
            desc.width,
            desc.height,
            if desc.full_screen { " fullscreen" } else { "" },
            settings.frames_in_flight,
            residency_budget,
            if present_target.is_some() { "on" } else { "off" }
        ));

        Ok(Self {
            scheduler,
            present_target,
            present_source: None,
            pipeline: Pipeline::empty(),
            dispatcher: PipelineEventDispatcher::new(general.clone()),
            context,
            frame_counter: FrameCounter::new(0, settings.frames_in_flight),
            absolute_time: Duration::ZERO,
            device_lost: false,
            settings,
            general,
        })
    }
}

// getters
impl GraphicsEngine {
    /// 可以共享给流式加载线程的上下文
    #[inline]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// 下一次 `update` 要执行的帧
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_counter.frame_id()
    }

    #[inline]
    pub fn absolute_time(&self) -> Duration {
        self.absolute_time
    }

    #[inline]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[inline]
    pub fn present_target(&self) -> Option<&PresentTarget> {
        self.present_target.as_ref()
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }
}

// 资源与配置
impl GraphicsEngine {
    fn check_alive(&self) -> Result<(), FrameError> {
        if self.device_lost { Err(FrameError::DeviceLost) } else { Ok(()) }
    }

    /// 分配资源并创建默认视图；分配失败时驱逐之后重试一次
    pub fn create_resource(
        &self,
        desc: &GfxResourceDesc,
        policy: PlacementPolicy,
        name: &str,
    ) -> Result<ResourceHandle, FrameError> {
        self.check_alive()?;
        self.context.create_resource(desc, policy, name)
    }

    /// 释放资源；仍可能被在途帧使用时，等这些帧退休之后再释放
    pub fn release_resource(&self, handle: ResourceHandle) -> Result<(), FrameError> {
        match self.scheduler.last_in_flight_frame() {
            Some(frame_id) if !self.device_lost => self.context.release_resource_deferred(handle, frame_id),
            _ => self.context.release_resource(handle),
        }
    }

    pub fn set_pipeline(&mut self, pipeline: Pipeline) {
        self.general.info(format_args!(
            "pipeline set: [{}]",
            pipeline.ordered_pass_names().join(" -> ")
        ));
        self.pipeline = pipeline;
    }

    /// 每帧拷贝到 back buffer 的纹理；None 表示不 present
    pub fn set_present_source(&mut self, source: Option<ResourceHandle>) {
        self.present_source = source;
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PipelineEventListener>) -> ListenerId {
        self.dispatcher.register(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.dispatcher.unregister(id).is_some()
    }
}

// update
impl GraphicsEngine {
    /// 准备并提交一帧
    ///
    /// 帧被中止（例如驻留超出预算）时返回错误，帧号照常前进。
    /// 设备丢失之后所有调用都返回 `DeviceLost`。
    pub fn update(&mut self, elapsed: Duration) -> Result<(), FrameError> {
        self.check_alive()?;
        let _span = ember_crate_tools::profile_span!("GraphicsEngine::update");

        self.absolute_time += elapsed;
        let result = self.run_frame();
        let frame_name = self.frame_counter.frame_name();
        self.frame_counter.next_frame();

        if let Err(e) = &result {
            self.handle_error(&frame_name, e);
        }
        result
    }

    fn run_frame(&mut self) -> Result<(), FrameError> {
        let frame_id = self.frame_counter.frame_id();

        self.scheduler.poll_retired(&self.context, &self.dispatcher)?;

        let present = match (self.present_source, &self.present_target) {
            (Some(source), Some(target)) => target.epilogue(source),
            _ => None,
        };
        self.scheduler.execute_frame(&self.context, &self.pipeline, present, frame_id, &self.dispatcher)?;

        if present.is_some()
            && let Some(target) = self.present_target.as_mut()
        {
            target.present()?;
        }
        Ok(())
    }

    fn handle_error(&mut self, frame_name: &str, e: &FrameError) {
        match e {
            FrameError::DeviceLost => self.on_device_lost(),
            FrameError::ResidencyOvercommit { .. } => {
                self.general.warn(format_args!("{frame_name} dropped: {e}"));
            }
            _ if e.is_fatal() => {
                self.general.error(format_args!("{frame_name} failed: {e}"));
            }
            _ => {
                self.general.warn(format_args!("{frame_name} aborted: {e}"));
            }
        }
    }

    /// 所有 GPU 侧状态都失效
    fn on_device_lost(&mut self) {
        if self.device_lost {
            return;
        }
        self.device_lost = true;
        self.general.error(format_args!(
            "device lost at frame {}, all GPU state must be reconstructed",
            self.frame_counter.frame_id()
        ));
        self.context.memory().mark_all_non_resident();
        self.context.residency().clear_in_flight();
        self.scheduler.abandon_in_flight();
        self.general.flush();
    }

    /// 等待所有已提交的帧完成
    pub fn wait_idle(&mut self) -> Result<(), FrameError> {
        self.check_alive()?;
        let result = self
            .context
            .timeline()
            .wait_idle(self.settings.acquire_timeout)
            .and_then(|()| self.scheduler.poll_retired(&self.context, &self.dispatcher).map(|_| ()));
        if let Err(FrameError::DeviceLost) = result {
            self.on_device_lost();
        }
        result
    }

    /// 重建 swap chain；没有 present 目标时什么也不做
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        self.wait_idle()?;
        if let Some(target) = self.present_target.as_mut() {
            target.resize(self.context.memory(), width, height)?;
            self.general.info(format_args!("resized to {width}x{height}"));
        }
        Ok(())
    }
}

impl Drop for GraphicsEngine {
    fn drop(&mut self) {
        log::info!("Dropping GraphicsEngine");
        if !self.device_lost {
            if let Err(e) = self.wait_idle() {
                log::warn!("GraphicsEngine: wait idle on drop failed: {e}");
            }
        }
        if let Some(target) = self.present_target.as_mut() {
            target.unregister_back_buffers(self.context.memory());
        }
    }
}
