//! Pipeline（pass 图）
//!
//! Pass 只声明自己读写哪些资源以及要求的状态，Pass 之间的边由共享资源推导，
//! 从不显式声明。构建时检测环，执行时按确定的拓扑顺序录制命令，并在相邻状态不同的地方插入 barrier。

pub mod barrier;
pub mod graph;
pub mod pass;
pub mod pipeline;

pub use barrier::{FrameBarriers, PassBarriers, RgBarrier, StateTracker};
pub use pass::{RgAccess, RgPass, RgPassBuilder, RgPassContext, RgResourceUse};
pub use pipeline::{Pipeline, PipelineBuilder};
