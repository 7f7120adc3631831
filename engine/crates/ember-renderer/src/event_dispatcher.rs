//! 帧边界事件
//!
//! 四种通知：frame-begin-host、frame-begin-device、frame-complete-host、frame-complete-device。
//! 监听者按注册顺序同步调用；某个监听者返回错误或者 panic 时记录日志并跳过，不会中止这一帧。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use slotmap::{SlotMap, new_key_type};

use crate::log_stream::LogStream;

new_key_type! {
    pub struct ListenerId;
}

/// 帧事件监听者
///
/// 所有方法都有空的默认实现，只需要实现关心的事件。
pub trait PipelineEventListener: Send + Sync {
    /// CPU 开始准备这一帧（已经拿到 frame slot）
    fn on_frame_begin_host(&self, _frame_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// 设备开始执行这一帧
    fn on_frame_begin_device(&self, _frame_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// CPU 提交完这一帧
    fn on_frame_complete_host(&self, _frame_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// 设备执行完这一帧
    fn on_frame_complete_device(&self, _frame_id: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineEvent {
    FrameBeginHost,
    FrameBeginDevice,
    FrameCompleteHost,
    FrameCompleteDevice,
}

impl PipelineEvent {
    fn invoke(self, listener: &dyn PipelineEventListener, frame_id: u64) -> anyhow::Result<()> {
        match self {
            Self::FrameBeginHost => listener.on_frame_begin_host(frame_id),
            Self::FrameBeginDevice => listener.on_frame_begin_device(frame_id),
            Self::FrameCompleteHost => listener.on_frame_complete_host(frame_id),
            Self::FrameCompleteDevice => listener.on_frame_complete_device(frame_id),
        }
    }
}

pub struct PipelineEventDispatcher {
    listeners: SlotMap<ListenerId, Arc<dyn PipelineEventListener>>,
    /// 注册顺序；SlotMap 的迭代顺序会因为槽位复用而改变
    order: Vec<ListenerId>,
    stream: LogStream,
}

// new & init
impl PipelineEventDispatcher {
    pub fn new(stream: LogStream) -> Self {
        Self {
            listeners: SlotMap::with_key(),
            order: Vec::new(),
            stream,
        }
    }
}

impl Default for PipelineEventDispatcher {
    fn default() -> Self {
        Self::new(LogStream::general(None))
    }
}

// tools
impl PipelineEventDispatcher {
    pub fn register(&mut self, listener: Arc<dyn PipelineEventListener>) -> ListenerId {
        let id = self.listeners.insert(listener);
        self.order.push(id);
        id
    }

    /// 返回被移除的监听者；id 无效时返回 None
    pub fn unregister(&mut self, id: ListenerId) -> Option<Arc<dyn PipelineEventListener>> {
        let listener = self.listeners.remove(id)?;
        self.order.retain(|&i| i != id);
        Some(listener)
    }

    #[inline]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// 通知所有监听者，返回失败的监听者数量
    pub fn dispatch(&self, event: PipelineEvent, frame_id: u64) -> usize {
        let mut faults = 0;
        for &id in &self.order {
            let Some(listener) = self.listeners.get(id) else {
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| event.invoke(listener.as_ref(), frame_id))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    faults += 1;
                    self.stream.warn(format_args!("listener {:?} failed on {:?} of frame {}: {:#}", id, event, frame_id, e));
                }
                Err(payload) => {
                    faults += 1;
                    self.stream.error(format_args!(
                        "listener {:?} panicked on {:?} of frame {}: {}",
                        id,
                        event,
                        frame_id,
                        panic_message(payload.as_ref())
                    ));
                }
            }
        }
        faults
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
