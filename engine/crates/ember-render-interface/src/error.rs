use std::time::Duration;

use ember_gfx::GfxError;

use crate::handles::ResourceHandle;
use crate::sync_point::SyncPoint;

/// 帧执行过程中的错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    /// heap 没有足够的连续空间，且驱逐后依然无法满足
    #[error("allocation failure: {requested} bytes for {name}")]
    AllocationFailure { requested: u64, name: String },

    /// 最大程度驱逐之后，工作集依然超出预算
    #[error("residency overcommit: working set needs {required} bytes, budget is {budget} bytes")]
    ResidencyOvercommit { required: u64, budget: u64 },

    /// pass 图存在环，或者同一个 pass 对同一资源要求了两个不同的状态
    #[error("barrier conflict: {0}")]
    BarrierConflict(String),

    /// 设备不可恢复，所有 GPU 侧对象失效
    #[error("graphics device lost")]
    DeviceLost,

    #[error("timed out after {timeout:?} waiting for {sync_point:?}")]
    SyncTimeout { sync_point: SyncPoint, timeout: Duration },

    #[error("invalid resource handle {0:?}")]
    InvalidResource(ResourceHandle),

    #[error(transparent)]
    Device(GfxError),
}

impl From<GfxError> for FrameError {
    fn from(value: GfxError) -> Self {
        match value {
            GfxError::DeviceLost => Self::DeviceLost,
            other => Self::Device(other),
        }
    }
}

impl FrameError {
    /// 致命错误：配置错误或设备丢失，不能靠丢弃当前帧恢复
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BarrierConflict(_) | Self::DeviceLost)
    }

    /// 只影响当前帧，可以丢帧后继续
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Self::ResidencyOvercommit { .. } | Self::SyncTimeout { .. } | Self::AllocationFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_maps_to_frame_error() {
        assert_eq!(FrameError::from(GfxError::DeviceLost), FrameError::DeviceLost);
        assert!(FrameError::DeviceLost.is_fatal());
        assert!(FrameError::BarrierConflict("cycle".into()).is_fatal());
        assert!(!FrameError::ResidencyOvercommit { required: 2, budget: 1 }.is_fatal());
    }
}
