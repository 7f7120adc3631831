//! 帧执行核心中与 GPU 资源相关的部分
//!
//! 所有管理器都收拢在 [`context::EngineContext`] 中，由引擎构造一次，
//! 然后以引用的方式传给 Scheduler 和每一个 Pass。

pub mod cmd_allocator_pool;
pub mod context;
pub mod descriptor_table;
pub mod error;
pub mod frame_counter;
pub mod handles;
pub mod heap;
pub mod memory_manager;
pub mod residency_queue;
pub mod resource;
pub mod scratch_space_pool;
pub mod sync_point;

pub use error::FrameError;
