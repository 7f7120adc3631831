//! 帧执行核心的最外层
//!
//! - [`scheduler`]：每帧的状态机，获取 slot、准备驻留、录制、提交
//! - [`event_dispatcher`]：帧边界事件
//! - [`engine`]：`GraphicsEngine`，对宿主暴露的配置与 `update` 入口

pub mod engine;
pub mod event_dispatcher;
pub mod log_stream;
pub mod present;
pub mod scheduler;

pub use engine::{EngineSettings, GraphicsEngine, GraphicsEngineDesc};
pub use event_dispatcher::{ListenerId, PipelineEventDispatcher, PipelineEventListener};
pub use scheduler::{FrameRecord, FrameState, Scheduler};
