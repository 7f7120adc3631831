//! 进程内的设备实现
//!
//! 不依赖任何驱动，按设备契约模拟队列执行、fence、内存容量与驻留，
//! 同时记录所有驻留切换和提交调用，供测试断言。

mod device;
mod swap_chain;

pub use device::{HeadlessCall, HeadlessCompletion, HeadlessDevice, HeadlessDeviceDesc, HeadlessStats};
pub use swap_chain::{HeadlessDeviceManager, HeadlessSwapChain};
