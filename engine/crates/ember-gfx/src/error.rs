use crate::handles::NativeResource;

/// 设备层返回的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GfxError {
    /// 设备出现不可恢复的错误，所有 GPU 侧状态都失效
    #[error("graphics device lost")]
    DeviceLost,
    #[error("device out of memory (requested {requested} bytes)")]
    OutOfMemory { requested: u64 },
    #[error("invalid {kind} handle: {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: u64 },
    #[error("resource {0:?} is referenced by a command list but is not resident")]
    NotResident(NativeResource),
    /// 等待 fence 超时；设备本身仍然可用
    #[error("wait on fence timed out")]
    Timeout,
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type GfxResult<T> = Result<T, GfxError>;
