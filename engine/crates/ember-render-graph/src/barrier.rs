//! Barrier 自动计算
//!
//! 每个资源在一帧内有一条状态序列：从入口状态（上一帧的最终状态）开始，
//! 每个 Pass 要求一个状态。相邻两个状态不同时恰好插入一个 barrier，相同时不插入。

use indexmap::IndexMap;
use slotmap::SecondaryMap;

use ember_gfx::commands::command_list::GfxResourceBarrier;
use ember_gfx::handles::NativeResource;
use ember_gfx::resources::resource_state::GfxResourceState;
use ember_render_interface::handles::ResourceHandle;

/// 一次资源状态转换
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgBarrier {
    pub resource: ResourceHandle,
    pub before: GfxResourceState,
    pub after: GfxResourceState,
}

impl RgBarrier {
    /// 转换为设备层的 barrier
    #[inline]
    pub fn to_gfx_barrier(&self, native: NativeResource) -> GfxResourceBarrier {
        GfxResourceBarrier::new(native, self.before, self.after)
    }
}

/// 跟踪资源的当前状态
pub struct StateTracker {
    states: SecondaryMap<ResourceHandle, GfxResourceState>,
    /// 第一次出现的顺序，用于输出稳定的最终状态
    order: Vec<ResourceHandle>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            states: SecondaryMap::new(),
            order: Vec::new(),
        }
    }

    /// 以入口状态初始化
    pub fn with_entry_states<'a>(entry: impl IntoIterator<Item = (&'a ResourceHandle, &'a GfxResourceState)>) -> Self {
        let mut tracker = Self::new();
        for (&handle, &state) in entry {
            tracker.set(handle, state);
        }
        tracker
    }

    fn set(&mut self, handle: ResourceHandle, state: GfxResourceState) {
        if self.states.insert(handle, state).is_none() {
            self.order.push(handle);
        }
    }

    #[inline]
    pub fn state(&self, handle: ResourceHandle) -> Option<GfxResourceState> {
        self.states.get(handle).copied()
    }

    /// 让资源进入 `required` 状态
    ///
    /// 状态不同时返回需要的 barrier；资源未知时以 `COMMON` 作为当前状态。
    pub fn transition(&mut self, handle: ResourceHandle, required: GfxResourceState) -> Option<RgBarrier> {
        let current = self.state(handle).unwrap_or(GfxResourceState::COMMON);
        self.set(handle, required);
        (current != required).then_some(RgBarrier {
            resource: handle,
            before: current,
            after: required,
        })
    }

    /// 当前所有资源的状态，按首次出现的顺序
    pub fn states(&self) -> IndexMap<ResourceHandle, GfxResourceState> {
        self.order.iter().filter_map(|&h| self.states.get(h).map(|&s| (h, s))).collect()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pass 执行前需要的 Barrier 集合
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassBarriers {
    pub barriers: Vec<RgBarrier>,
}

impl PassBarriers {
    #[inline]
    pub fn has_barriers(&self) -> bool {
        !self.barriers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }
}

/// 一帧的 barrier 计算结果
#[derive(Clone, Debug, Default)]
pub struct FrameBarriers {
    /// 按 Pass 的声明索引存放
    pub per_pass: Vec<PassBarriers>,
    /// 每个资源在最后一个 Pass 之后的状态
    pub final_states: IndexMap<ResourceHandle, GfxResourceState>,
}

impl FrameBarriers {
    #[inline]
    pub fn pass(&self, pass_index: usize) -> &PassBarriers {
        &self.per_pass[pass_index]
    }

    pub fn total(&self) -> usize {
        self.per_pass.iter().map(PassBarriers::len).sum()
    }
}
