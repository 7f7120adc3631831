//! Pipeline 构建器和执行器
//!
//! `PipelineBuilder` 收集 Pass 并在 `build()` 中完成依赖分析和环检测，
//! `Pipeline` 缓存执行顺序，每帧计算 barrier 并录制命令列表。

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;

use ember_gfx::commands::command_list::{GfxCommandList, GfxCommandListType};
use ember_gfx::handles::{DescriptorHandle, NativeResource};
use ember_gfx::resources::resource_state::GfxResourceState;
use ember_render_interface::cmd_allocator_pool::FrameSlot;
use ember_render_interface::context::EngineContext;
use ember_render_interface::error::FrameError;
use ember_render_interface::handles::ResourceHandle;
use ember_render_interface::scratch_space_pool::ScratchSpace;

use crate::barrier::{FrameBarriers, PassBarriers, StateTracker};
use crate::graph::DependencyAnalyzer;
use crate::pass::{RgPass, RgPassBuilder, RgPassContext, RgPassNode};

/// Pipeline 构建器
///
/// # 使用流程
///
/// 1. 创建 builder: `PipelineBuilder::new()`
/// 2. 添加 Pass: `builder.add_pass("name", pass)`
/// 3. 构建: `builder.build()?`
/// 4. 交给引擎: `engine.set_pipeline(pipeline)`
#[derive(Default)]
pub struct PipelineBuilder {
    passes: Vec<RgPassNode>,
    conflicts: Vec<String>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加 Pass，立即调用其 `setup` 收集资源依赖
    pub fn add_pass<P: RgPass + 'static>(&mut self, name: impl Into<String>, mut pass: P) -> &mut Self {
        let name = name.into();

        let mut builder = RgPassBuilder::new(&name);
        pass.setup(&mut builder);
        self.conflicts.append(&mut builder.conflicts);

        self.passes.push(RgPassNode {
            name,
            uses: builder.uses,
            list_type: pass.list_type(),
            pass: Box::new(pass),
        });
        self
    }

    /// 依赖分析、拓扑排序
    ///
    /// 存在环或者状态冲突时返回 `BarrierConflict`，此时不会录制任何命令。
    pub fn build(self) -> Result<Pipeline, FrameError> {
        let _span = ember_crate_tools::profile_span!("PipelineBuilder::build");

        if !self.conflicts.is_empty() {
            return Err(FrameError::BarrierConflict(self.conflicts.join("; ")));
        }

        let uses = self.passes.iter().map(|p| p.uses.iter().map(|u| (u.handle, u.access)).collect_vec()).collect_vec();
        let dep_graph = DependencyAnalyzer::analyze(&uses);

        let execution_order = dep_graph.topological_sort().map_err(|cycle| {
            let names = cycle.iter().map(|&i| self.passes[i].name.as_str()).join(", ");
            FrameError::BarrierConflict(format!("dependency cycle among passes: {names}"))
        })?;

        // 工作集按执行顺序收集，保证顺序确定
        let working_set: IndexSet<ResourceHandle> =
            execution_order.iter().flat_map(|&i| self.passes[i].uses.iter().map(|u| u.handle)).collect();

        log::debug!(
            "Pipeline built: {} passes, {} edges, {} resources, order [{}]",
            self.passes.len(),
            dep_graph.edge_count(),
            working_set.len(),
            execution_order.iter().map(|&i| self.passes[i].name.as_str()).join(" -> ")
        );

        Ok(Pipeline {
            passes: self.passes,
            execution_order,
            working_set,
        })
    }
}

/// 本帧 shader visible 描述符表
struct FrameTable {
    base: DescriptorHandle,
    indices: HashMap<ResourceHandle, u32>,
}

/// 构建好的 Pipeline，可以每帧重复执行
pub struct Pipeline {
    passes: Vec<RgPassNode>,
    execution_order: Vec<usize>,
    working_set: IndexSet<ResourceHandle>,
}

// getters
impl Pipeline {
    /// 空 Pipeline，不录制任何 Pass
    pub fn empty() -> Self {
        Self {
            passes: Vec::new(),
            execution_order: Vec::new(),
            working_set: IndexSet::new(),
        }
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Pass 的声明索引，按执行顺序排列
    #[inline]
    pub fn execution_order(&self) -> &[usize] {
        &self.execution_order
    }

    #[inline]
    pub fn pass_name(&self, pass_index: usize) -> &str {
        &self.passes[pass_index].name
    }

    /// 按执行顺序排列的 Pass 名称
    pub fn ordered_pass_names(&self) -> Vec<&str> {
        self.execution_order.iter().map(|&i| self.passes[i].name.as_str()).collect()
    }

    /// 所有 Pass 读写的资源
    #[inline]
    pub fn working_set(&self) -> &IndexSet<ResourceHandle> {
        &self.working_set
    }
}

// 执行
impl Pipeline {
    /// 计算每个 Pass 需要的 barriers
    ///
    /// 按执行顺序模拟资源状态的变化；`entry_states` 中没有的资源以 `COMMON` 开始。
    pub fn compute_barriers(&self, entry_states: &IndexMap<ResourceHandle, GfxResourceState>) -> FrameBarriers {
        let mut tracker = StateTracker::with_entry_states(entry_states);
        let per_pass = self.compute_barriers_with(&mut tracker);
        FrameBarriers {
            per_pass,
            final_states: tracker.states(),
        }
    }

    /// 在已有的 tracker 上继续计算，tracker 最终保存每个资源的最后状态
    pub fn compute_barriers_with(&self, tracker: &mut StateTracker) -> Vec<PassBarriers> {
        let mut per_pass = vec![PassBarriers::default(); self.passes.len()];
        for &pass_idx in &self.execution_order {
            per_pass[pass_idx].barriers =
                self.passes[pass_idx].uses.iter().filter_map(|u| tracker.transition(u.handle, u.state)).collect();
        }
        per_pass
    }

    /// 按执行顺序录制所有 Pass
    ///
    /// 先把工作集的视图拷贝到 slot 的 frame table，然后连续的同类型 Pass 录制到同一个命令列表中，
    /// 类型变化时开启新的命令列表。返回的命令列表都已关闭，按顺序提交即满足拓扑顺序。
    pub fn record(
        &self,
        engine: &EngineContext,
        slot: &FrameSlot,
        scratch: &mut ScratchSpace,
        barriers: &FrameBarriers,
    ) -> Result<Vec<GfxCommandList>, FrameError> {
        let _span = ember_crate_tools::profile_span!("Pipeline::record");

        let natives: HashMap<ResourceHandle, NativeResource> = self
            .working_set
            .iter()
            .map(|&h| engine.memory().native(h).map(|n| (h, n)))
            .collect::<Result<_, _>>()?;
        let table = self.stage_frame_table(engine, slot)?;

        let mut lists: Vec<GfxCommandList> = Vec::new();
        let runs = self.execution_order.iter().group_by(|&&pass_idx| self.passes[pass_idx].list_type);
        for (list_type, run) in &runs {
            let mut cmd = Self::begin_list(engine, slot, list_type, lists.len())?;
            for &pass_idx in run {
                self.record_pass(pass_idx, &mut cmd, engine, slot, scratch, barriers, &natives, &table);
            }
            cmd.close();
            lists.push(cmd);
        }
        Ok(lists)
    }

    /// 工作集中有视图的资源按工作集顺序排进本帧的描述符表
    fn stage_frame_table(&self, engine: &EngineContext, slot: &FrameSlot) -> Result<FrameTable, FrameError> {
        let mut views = Vec::new();
        let mut indices = HashMap::new();
        for &handle in &self.working_set {
            if let Some(view) = engine.memory().view(handle) {
                indices.insert(handle, views.len() as u32);
                views.push(view);
            }
        }
        let base = engine.descriptors().stage_frame_table(slot.index(), &views)?;
        Ok(FrameTable { base, indices })
    }

    #[allow(clippy::too_many_arguments)]
    fn record_pass(
        &self,
        pass_idx: usize,
        cmd: &mut GfxCommandList,
        engine: &EngineContext,
        slot: &FrameSlot,
        scratch: &mut ScratchSpace,
        barriers: &FrameBarriers,
        natives: &HashMap<ResourceHandle, NativeResource>,
        table: &FrameTable,
    ) {
        let node = &self.passes[pass_idx];

        let gfx_barriers =
            barriers.pass(pass_idx).barriers.iter().map(|b| b.to_gfx_barrier(natives[&b.resource])).collect_vec();
        cmd.resource_barriers(&gfx_barriers);

        cmd.begin_label(&node.name);
        for u in &node.uses {
            cmd.reference(natives[&u.handle]);
        }
        let mut ctx = RgPassContext {
            cmd,
            engine,
            scratch,
            frame_id: slot.frame_id(),
            frame_table: table.base,
            natives,
            table_indices: &table.indices,
        };
        node.pass.execute(&mut ctx);
        ctx.cmd.end_label();
    }

    fn begin_list(
        engine: &EngineContext,
        slot: &FrameSlot,
        list_type: GfxCommandListType,
        index: usize,
    ) -> Result<GfxCommandList, FrameError> {
        let name = format!("[F{}]pipeline-{:?}-{}", slot.frame_id(), list_type, index);
        Ok(engine.device().create_command_list(slot.allocator(list_type), list_type, &name)?)
    }
}
