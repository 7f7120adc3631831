//! Ember 工具集
//!
//! 提供日志初始化以及可选的 Tracy 性能分析 span。

pub mod init_log;
pub mod profile;

#[cfg(feature = "tracy")]
#[doc(hidden)]
pub use tracy_client;
