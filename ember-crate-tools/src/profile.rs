//! 性能分析 span
//!
//! 开启 `tracy` feature 后，`profile_span!` 等价于 `tracy_client::span!`，
//! 否则展开为空，不需要启动 tracy client。
//!
//! ```ignore
//! let _span = ember_crate_tools::profile_span!("Scheduler::execute_frame");
//! ```

#[cfg(feature = "tracy")]
#[macro_export]
macro_rules! profile_span {
    ($name:expr) => {
        $crate::tracy_client::span!($name)
    };
}

#[cfg(not(feature = "tracy"))]
#[macro_export]
macro_rules! profile_span {
    ($name:expr) => {{
        let _ = $name;
    }};
}

/// 启动 tracy client；未开启 feature 时什么也不做
#[inline]
pub fn start_profiler() {
    #[cfg(feature = "tracy")]
    {
        tracy_client::Client::start();
    }
}
