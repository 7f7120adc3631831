//! Present 收尾
//!
//! swap chain 的 back buffer 以 external + essential 资源的形式注册到 MemoryManager。
//! 每帧在 Pipeline 之后录制一个单独的 graphics 命令列表：
//! source -> TRANSFER_SRC，back buffer -> TRANSFER_DST，拷贝，back buffer -> PRESENT。

use itertools::Itertools;

use ember_gfx::commands::command_list::{GfxCommandList, GfxCommandListType};
use ember_gfx::device::GfxSwapChain;
use ember_gfx::resources::resource_desc::GfxResourceDesc;
use ember_gfx::resources::resource_state::GfxResourceState;
use ember_render_graph::StateTracker;
use ember_render_interface::cmd_allocator_pool::FrameSlot;
use ember_render_interface::context::EngineContext;
use ember_render_interface::error::FrameError;
use ember_render_interface::handles::ResourceHandle;
use ember_render_interface::memory_manager::MemoryManager;

/// 一帧的 present 拷贝
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentEpilogue {
    pub source: ResourceHandle,
    pub back_buffer: ResourceHandle,
}

impl PresentEpilogue {
    #[inline]
    pub fn resources(&self) -> [ResourceHandle; 2] {
        [self.source, self.back_buffer]
    }

    /// 在 tracker 上继续计算状态转换，并录制 present 命令列表
    ///
    /// tracker 之前已经走完了整个 Pipeline，结束时 back buffer 处于 PRESENT。
    pub fn record(
        &self,
        engine: &EngineContext,
        slot: &FrameSlot,
        tracker: &mut StateTracker,
    ) -> Result<GfxCommandList, FrameError> {
        let memory = engine.memory();
        let src = memory.native(self.source)?;
        let dst = memory.native(self.back_buffer)?;

        let to_copy = [
            (self.source, src, GfxResourceState::TRANSFER_SRC),
            (self.back_buffer, dst, GfxResourceState::TRANSFER_DST),
        ]
        .into_iter()
        .filter_map(|(handle, native, state)| tracker.transition(handle, state).map(|b| b.to_gfx_barrier(native)))
        .collect_vec();
        let to_present = tracker
            .transition(self.back_buffer, GfxResourceState::PRESENT)
            .map(|b| b.to_gfx_barrier(dst))
            .into_iter()
            .collect_vec();

        let list_type = GfxCommandListType::Graphics;
        let mut cmd = engine.device().create_command_list(
            slot.allocator(list_type),
            list_type,
            &format!("[F{}]present", slot.frame_id()),
        )?;
        cmd.begin_label("present");
        cmd.resource_barriers(&to_copy);
        cmd.copy_texture(src, dst);
        cmd.resource_barriers(&to_present);
        cmd.end_label();
        cmd.close();
        Ok(cmd)
    }
}

/// swap chain 以及它注册到 MemoryManager 中的 back buffer
pub struct PresentTarget {
    swap_chain: Box<dyn GfxSwapChain>,
    back_buffers: Vec<ResourceHandle>,
}

// new & init
impl PresentTarget {
    pub fn new(memory: &MemoryManager, swap_chain: Box<dyn GfxSwapChain>) -> Self {
        let mut target = Self {
            swap_chain,
            back_buffers: Vec::new(),
        };
        target.register_back_buffers(memory);
        target
    }

    fn register_back_buffers(&mut self, memory: &MemoryManager) {
        let extent = self.swap_chain.extent();
        let desc = GfxResourceDesc::texture_2d(extent.width as u64, extent.height as u64, self.swap_chain.format());
        self.back_buffers = (0..self.swap_chain.buffer_count())
            .map(|i| {
                memory.register_external(
                    self.swap_chain.back_buffer(i),
                    &desc,
                    GfxResourceState::PRESENT,
                    &format!("back-buffer-{i}"),
                )
            })
            .collect();
    }

    /// 从 MemoryManager 中注销 back buffer，底层资源归 swap chain 所有
    pub fn unregister_back_buffers(&mut self, memory: &MemoryManager) {
        for handle in self.back_buffers.drain(..) {
            if let Err(e) = memory.release(handle) {
                log::warn!("PresentTarget: failed to unregister back buffer: {e}");
            }
        }
    }
}

// getters
impl PresentTarget {
    #[inline]
    pub fn swap_chain(&self) -> &dyn GfxSwapChain {
        self.swap_chain.as_ref()
    }

    #[inline]
    pub fn back_buffers(&self) -> &[ResourceHandle] {
        &self.back_buffers
    }

    pub fn current_back_buffer(&self) -> Option<ResourceHandle> {
        self.back_buffers.get(self.swap_chain.current_back_buffer_index() as usize).copied()
    }
}

// tools
impl PresentTarget {
    /// 把 `source` 拷贝到当前 back buffer 的收尾工作
    pub fn epilogue(&self, source: ResourceHandle) -> Option<PresentEpilogue> {
        self.current_back_buffer().map(|back_buffer| PresentEpilogue { source, back_buffer })
    }

    pub fn present(&mut self) -> Result<(), FrameError> {
        Ok(self.swap_chain.present()?)
    }

    /// 调用者必须保证 GPU 已经不再使用旧的 back buffer
    pub fn resize(&mut self, memory: &MemoryManager, width: u32, height: u32) -> Result<(), FrameError> {
        self.unregister_back_buffers(memory);
        self.swap_chain.resize(width, height)?;
        self.register_back_buffers(memory);
        Ok(())
    }
}
