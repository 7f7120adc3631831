//! 引擎的两条日志流：`general` 和 `pipeline`
//!
//! 宿主在 `GraphicsEngineDesc::logger` 中提供 sink 时写入 sink，否则写入全局 `log` facade。

use std::fmt;
use std::sync::Arc;

use log::{Level, Log, Record};

#[derive(Clone)]
pub struct LogStream {
    target: &'static str,
    sink: Option<Arc<dyn Log>>,
}

// new & init
impl LogStream {
    pub const GENERAL_TARGET: &'static str = "ember::general";
    pub const PIPELINE_TARGET: &'static str = "ember::pipeline";

    /// 一般事件：创建、销毁、设备丢失
    pub fn general(sink: Option<Arc<dyn Log>>) -> Self {
        Self {
            target: Self::GENERAL_TARGET,
            sink,
        }
    }

    /// 每帧事件：提交、驻留、卡顿
    pub fn pipeline(sink: Option<Arc<dyn Log>>) -> Self {
        Self {
            target: Self::PIPELINE_TARGET,
            sink,
        }
    }
}

// tools
impl LogStream {
    #[inline]
    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let record = Record::builder().args(args).level(level).target(self.target).build();
        match &self.sink {
            Some(sink) => {
                if sink.enabled(record.metadata()) {
                    sink.log(&record);
                }
            }
            None => {
                if level <= log::max_level() {
                    log::logger().log(&record);
                }
            }
        }
    }

    #[inline]
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    #[inline]
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    #[inline]
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    #[inline]
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn flush(&self) {
        match &self.sink {
            Some(sink) => sink.flush(),
            None => log::logger().flush(),
        }
    }
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStream")
            .field("target", &self.target)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
