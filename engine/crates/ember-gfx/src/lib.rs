//! 设备能力层 (Device Capability)
//!
//! 引擎核心只通过 [`device::GfxDevice`] 与原生图形设备交互：创建队列、命令分配器、
//! 资源、视图、fence，以及执行驻留切换。核心持有的是一个不拥有所有权的能力引用，
//! 从不负责销毁设备本身。
//!
//! [`headless::HeadlessDevice`] 是一个完整的进程内实现，用于测试和无窗口运行。

pub mod commands;
pub mod device;
pub mod error;
pub mod handles;
pub mod headless;
pub mod resources;

pub use error::{GfxError, GfxResult};
