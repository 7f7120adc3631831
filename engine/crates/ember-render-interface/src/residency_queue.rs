//! Resource Residency Queue
//!
//! 每帧提交之前，根据本帧工作集计算需要驱逐和需要加载的资源：
//!
//! - `to_load = required - resident`
//! - 驱逐候选 = `resident - required`，排除 essential 以及仍被在途帧引用的资源，按 LRU 排序
//!
//! 先完整地计算计划并检查预算，计划可行之后才调用设备。计划不可行时返回
//! `ResidencyOvercommit`，不修改任何状态，也不会发出任何 make-resident 调用。
//!
//! `prepare` 成功后工作集被钉住，直到 `track_in_flight` 把它转为在途帧，或者 `unpin` 放弃这一帧。
//! 在此期间其他线程的分配失败重试也不会驱逐其中的资源。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;

use ember_gfx::GfxError;
use ember_gfx::device::GfxDevice;
use ember_gfx::handles::NativeResource;

use crate::error::FrameError;
use crate::handles::ResourceHandle;
use crate::memory_manager::{MemoryManager, MemoryState};
use crate::sync_point::SyncPoint;

/// 工作集已经全部驻留的凭证
///
/// Scheduler 只有拿到本帧的 token 之后才能开始录制命令。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyToken {
    frame_id: u64,
    resident_count: usize,
    resident_bytes: u64,
    evicted: usize,
    loaded: usize,
}

// getters
impl ReadyToken {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// 工作集中的资源数量
    #[inline]
    pub fn resident_count(&self) -> usize {
        self.resident_count
    }

    /// prepare 完成后所有驻留资源占用的字节数
    #[inline]
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    #[inline]
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    #[inline]
    pub fn loaded(&self) -> usize {
        self.loaded
    }
}

struct InFlightFrame {
    sync_point: SyncPoint,
    resources: IndexSet<ResourceHandle>,
}

struct ResidencyState {
    budget: u64,
    /// 按提交顺序排列
    in_flight: VecDeque<InFlightFrame>,
    /// 已经 prepare、尚未提交的帧的工作集，key 为帧号
    pinned: IndexMap<u64, IndexSet<ResourceHandle>>,
}

impl ResidencyState {
    /// 被在途帧或待提交帧引用
    fn is_pinned(&self, handle: ResourceHandle) -> bool {
        self.in_flight.iter().any(|f| f.resources.contains(&handle))
            || self.pinned.values().any(|set| set.contains(&handle))
    }

    /// 可以驱逐的驻留资源，按 LRU 排序
    fn eviction_candidates(&self, memory: &MemoryState, required: &IndexSet<ResourceHandle>) -> Vec<ResourceHandle> {
        memory
            .resources
            .iter()
            .filter(|(handle, r)| {
                r.resident && !r.essential && !r.is_external() && !required.contains(handle) && !self.is_pinned(*handle)
            })
            // 从未使用过的资源最先被驱逐
            .sorted_by_key(|(_, r)| (r.last_used_frame.map_or(0, |f| f + 1), r.seq))
            .map(|(handle, _)| handle)
            .collect()
    }
}

pub struct ResidencyQueue {
    device: Arc<dyn GfxDevice>,
    state: Mutex<ResidencyState>,
}

// new & init
impl ResidencyQueue {
    pub fn new(device: Arc<dyn GfxDevice>, budget: u64) -> Self {
        log::info!("ResidencyQueue: budget {} bytes", budget);
        Self {
            device,
            state: Mutex::new(ResidencyState {
                budget,
                in_flight: VecDeque::new(),
                pinned: IndexMap::new(),
            }),
        }
    }
}

// getters
impl ResidencyQueue {
    fn lock(&self) -> MutexGuard<'_, ResidencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn budget(&self) -> u64 {
        self.lock().budget
    }

    pub fn set_budget(&self, budget: u64) {
        log::info!("ResidencyQueue: budget changed to {} bytes", budget);
        self.lock().budget = budget;
    }

    /// 尚未退休的帧数量
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// 已经 prepare、尚未提交也没有放弃的帧数量
    pub fn pinned_count(&self) -> usize {
        self.lock().pinned.len()
    }
}

// tools
impl ResidencyQueue {
    /// 让 `required` 中的所有资源驻留
    ///
    /// 返回时所有 make-resident 调用都已经完成，工作集以 `frame_id` 钉住。
    /// 调用者之后必须调用 [`Self::track_in_flight`] 或 [`Self::unpin`]。
    pub fn prepare(
        &self,
        memory: &MemoryManager,
        required: &IndexSet<ResourceHandle>,
        frame_id: u64,
    ) -> Result<ReadyToken, FrameError> {
        let _span = ember_crate_tools::profile_span!("ResidencyQueue::prepare");

        // 锁顺序：residency -> memory
        let mut state = self.lock();
        let mut mem = memory.lock();

        // 1. 计算计划
        let mut to_load = Vec::new();
        let mut load_bytes = 0;
        let mut required_bytes = 0;
        for &handle in required {
            let resource = mem.resources.get(handle).ok_or(FrameError::InvalidResource(handle))?;
            required_bytes += resource.budget_bytes();
            if !resource.resident && !resource.is_external() {
                to_load.push(handle);
                load_bytes += resource.budget_bytes();
            }
        }

        let candidates = state.eviction_candidates(&mem, required);
        let evictable_bytes: u64 = candidates.iter().map(|&h| mem.resources[h].budget_bytes()).sum();

        // 最大程度驱逐之后仍然驻留的字节数
        let floor = mem.committed_bytes - evictable_bytes + load_bytes;
        if floor > state.budget {
            log::warn!(
                "ResidencyQueue: frame {} overcommitted: {} bytes required, {} bytes after maximal eviction, budget {}",
                frame_id,
                required_bytes,
                floor,
                state.budget
            );
            return Err(FrameError::ResidencyOvercommit {
                required: floor,
                budget: state.budget,
            });
        }

        let need = (mem.committed_bytes + load_bytes).saturating_sub(state.budget);
        let mut to_evict = Vec::new();
        let mut freed = 0;
        for handle in candidates {
            if freed >= need {
                break;
            }
            freed += mem.resources[handle].budget_bytes();
            to_evict.push(handle);
        }

        // 2. 执行计划
        if !to_evict.is_empty() {
            let natives = to_evict.iter().map(|&h| mem.resources[h].native).collect_vec();
            self.device.evict(&natives)?;
            for &handle in &to_evict {
                mem.set_resident(handle, false);
            }
        }
        if !to_load.is_empty() {
            let natives = to_load.iter().map(|&h| mem.resources[h].native).collect_vec();
            self.device.make_resident(&natives).map_err(|e| match e {
                GfxError::OutOfMemory { .. } => FrameError::ResidencyOvercommit {
                    required: required_bytes,
                    budget: state.budget,
                },
                other => other.into(),
            })?;
            for &handle in &to_load {
                mem.set_resident(handle, true);
            }
        }

        for &handle in required {
            if let Some(resource) = mem.resources.get_mut(handle) {
                resource.last_used_frame = Some(frame_id);
            }
        }

        if !to_evict.is_empty() || !to_load.is_empty() {
            log::debug!(
                "ResidencyQueue: frame {} evicted {} ({} bytes), loaded {} ({} bytes)",
                frame_id,
                to_evict.len(),
                freed,
                to_load.len(),
                load_bytes
            );
        }

        state.pinned.insert(frame_id, required.clone());

        Ok(ReadyToken {
            frame_id,
            resident_count: required.len(),
            resident_bytes: mem.committed_bytes,
            evicted: to_evict.len(),
            loaded: to_load.len(),
        })
    }

    /// 帧已提交：钉住的工作集转为在途记录，在 `sync_point` 退休之前不会被驱逐
    pub fn track_in_flight(&self, frame_id: u64, sync_point: SyncPoint) {
        let mut state = self.lock();
        let Some(resources) = state.pinned.shift_remove(&frame_id) else {
            log::warn!("ResidencyQueue: frame {} submitted without a prepared working set", frame_id);
            return;
        };
        state.in_flight.push_back(InFlightFrame { sync_point, resources });
    }

    /// 帧在提交之前中止，放弃钉住的工作集
    pub fn unpin(&self, frame_id: u64) -> bool {
        self.lock().pinned.shift_remove(&frame_id).is_some()
    }

    /// `completed` 及之前的帧全部退休
    pub fn retire(&self, completed: SyncPoint) {
        self.lock()
            .in_flight
            .retain(|f| f.sync_point.queue != completed.queue || f.sync_point.value > completed.value);
    }

    /// 设备丢失后丢弃所有在途记录
    pub fn clear_in_flight(&self) {
        let mut state = self.lock();
        state.in_flight.clear();
        state.pinned.clear();
    }

    /// 通用驱逐：按 LRU 驱逐至少 `bytes` 字节，返回实际释放的字节数
    ///
    /// 分配失败后的重试路径使用。在途帧和已 prepare 未提交的帧引用的资源都不会被驱逐。
    pub fn evict_for(&self, memory: &MemoryManager, bytes: u64) -> Result<u64, FrameError> {
        let state = self.lock();
        let mut mem = memory.lock();

        let mut freed = 0;
        let mut to_evict: Vec<(ResourceHandle, NativeResource)> = Vec::new();
        for handle in state.eviction_candidates(&mem, &IndexSet::new()) {
            if freed >= bytes {
                break;
            }
            let resource = &mem.resources[handle];
            freed += resource.budget_bytes();
            to_evict.push((handle, resource.native));
        }

        if to_evict.is_empty() {
            return Ok(0);
        }
        let natives = to_evict.iter().map(|(_, n)| *n).collect_vec();
        self.device.evict(&natives)?;
        for (handle, _) in to_evict {
            mem.set_resident(handle, false);
        }
        log::info!("ResidencyQueue: evicted {} bytes to make room for {} bytes", freed, bytes);
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use ember_gfx::commands::command_list::GfxCommandListType;
    use ember_gfx::commands::queue::GfxQueueDesc;
    use ember_gfx::headless::{HeadlessCall, HeadlessDevice};
    use ember_gfx::resources::resource_desc::GfxResourceDesc;

    use super::*;
    use crate::memory_manager::PlacementPolicy;

    const UNIT: u64 = 64 * 1024;

    struct Fixture {
        device: Arc<HeadlessDevice>,
        memory: MemoryManager,
        residency: ResidencyQueue,
    }

    fn fixture(budget_units: u64) -> Fixture {
        let device = Arc::new(HeadlessDevice::default());
        Fixture {
            memory: MemoryManager::new(device.clone(), UNIT * 16),
            residency: ResidencyQueue::new(device.clone(), budget_units * UNIT),
            device,
        }
    }

    impl Fixture {
        fn buffer(&self, name: &str) -> ResourceHandle {
            self.memory.allocate(&GfxResourceDesc::buffer(UNIT), PlacementPolicy::Committed, name).unwrap()
        }

        fn evict(&self, handle: ResourceHandle) {
            let native = self.memory.native(handle).unwrap();
            self.device.evict(&[native]).unwrap();
            self.memory.lock().set_resident(handle, false);
        }

        fn resident(&self, handle: ResourceHandle) -> bool {
            self.memory.is_resident(handle).unwrap()
        }

        /// prepare 之后立即放弃，只留下 LRU 信息
        fn touch(&self, required: &[ResourceHandle], frame_id: u64) {
            let required: IndexSet<ResourceHandle> = required.iter().copied().collect();
            self.residency.prepare(&self.memory, &required, frame_id).unwrap();
            assert!(self.residency.unpin(frame_id));
        }

        fn queue(&self) -> ember_gfx::handles::NativeQueue {
            self.device.create_command_queue(&GfxQueueDesc::new(GfxCommandListType::Graphics, "q")).unwrap()
        }
    }

    #[test]
    fn test_evicts_lru_and_loads_required() {
        let f = fixture(2);
        let a = f.buffer("A");
        let b = f.buffer("B");
        let c = f.buffer("C");
        f.evict(c);

        // A 比 B 更久没有使用
        f.touch(&[a], 0);
        f.touch(&[a, b], 1);
        f.touch(&[b], 2);
        f.device.clear_calls();

        let token = f.residency.prepare(&f.memory, &IndexSet::from([b, c]), 3).unwrap();
        assert_eq!(token.evicted(), 1);
        assert_eq!(token.loaded(), 1);
        assert!(!f.resident(a));
        assert!(f.resident(b));
        assert!(f.resident(c));
        assert_eq!(f.memory.committed_bytes(), 2 * UNIT);

        // 驱逐发生在加载之前
        let a_native = f.memory.native(a).unwrap();
        let c_native = f.memory.native(c).unwrap();
        assert_eq!(
            f.device.calls(),
            vec![HeadlessCall::Evict(vec![a_native]), HeadlessCall::MakeResident(vec![c_native])]
        );
    }

    #[test]
    fn test_overcommit_has_no_side_effects() {
        let f = fixture(2);
        let a = f.buffer("A");
        let b = f.buffer("B");
        let c = f.buffer("C");
        f.evict(c);
        f.memory.set_essential(a, true).unwrap();
        f.device.clear_calls();

        let err = f.residency.prepare(&f.memory, &IndexSet::from([b, c]), 0).unwrap_err();
        assert!(matches!(err, FrameError::ResidencyOvercommit { .. }));
        assert!(f.device.calls().is_empty());
        assert_eq!(f.residency.pinned_count(), 0);
        assert!(f.resident(a));
        assert!(f.resident(b));
        assert!(!f.resident(c));
    }

    #[test]
    fn test_required_set_larger_than_budget() {
        let f = fixture(1);
        let a = f.buffer("A");
        let b = f.buffer("B");
        f.evict(a);
        f.evict(b);
        f.device.clear_calls();

        let err = f.residency.prepare(&f.memory, &IndexSet::from([a, b]), 0).unwrap_err();
        assert_eq!(
            err,
            FrameError::ResidencyOvercommit {
                required: 2 * UNIT,
                budget: UNIT
            }
        );
        assert!(!f.device.calls().iter().any(|c| matches!(c, HeadlessCall::MakeResident(_))));
    }

    #[test]
    fn test_in_flight_resources_are_not_evicted() {
        let f = fixture(2);
        let queue = f.queue();
        let a = f.buffer("A");
        let b = f.buffer("B");
        let c = f.buffer("C");
        f.evict(c);

        let sp = SyncPoint::new(queue, 1);
        f.residency.prepare(&f.memory, &IndexSet::from([a]), 0).unwrap();
        f.residency.track_in_flight(0, sp);
        assert_eq!(f.residency.pinned_count(), 0);
        f.touch(&[b], 1);

        // A 仍在途，B 和 C 都是必需的，无法腾出空间
        let err = f.residency.prepare(&f.memory, &IndexSet::from([b, c]), 2).unwrap_err();
        assert!(matches!(err, FrameError::ResidencyOvercommit { .. }));

        f.residency.retire(sp);
        assert_eq!(f.residency.in_flight_count(), 0);
        f.residency.prepare(&f.memory, &IndexSet::from([b, c]), 2).unwrap();
        assert!(!f.resident(a));
    }

    #[test]
    fn test_prepared_working_set_survives_evict_for() {
        let f = fixture(4);
        let queue = f.queue();
        let a = f.buffer("A");
        let b = f.buffer("B");

        // A 已经 prepare 但还没有提交，只有 B 可以驱逐
        f.residency.prepare(&f.memory, &IndexSet::from([a]), 7).unwrap();
        assert_eq!(f.residency.evict_for(&f.memory, 2 * UNIT).unwrap(), UNIT);
        assert!(f.resident(a));
        assert!(!f.resident(b));

        // 提交之后由在途记录继续保护
        let sp = SyncPoint::new(queue, 3);
        f.residency.track_in_flight(7, sp);
        assert_eq!(f.residency.evict_for(&f.memory, UNIT).unwrap(), 0);
        assert!(f.resident(a));

        f.residency.retire(sp);
        assert_eq!(f.residency.evict_for(&f.memory, UNIT).unwrap(), UNIT);
        assert!(!f.resident(a));
    }

    #[test]
    fn test_unpin_releases_aborted_frame() {
        let f = fixture(4);
        let a = f.buffer("A");

        f.residency.prepare(&f.memory, &IndexSet::from([a]), 1).unwrap();
        assert_eq!(f.residency.evict_for(&f.memory, UNIT).unwrap(), 0);

        assert!(f.residency.unpin(1));
        assert!(!f.residency.unpin(1));
        assert_eq!(f.residency.pinned_count(), 0);
        assert_eq!(f.residency.evict_for(&f.memory, UNIT).unwrap(), UNIT);
        assert!(!f.resident(a));
    }

    #[test]
    fn test_no_eviction_within_budget() {
        let f = fixture(4);
        let a = f.buffer("A");
        let b = f.buffer("B");
        f.device.clear_calls();

        let token = f.residency.prepare(&f.memory, &IndexSet::from([b]), 0).unwrap();
        assert_eq!(token.evicted(), 0);
        assert!(f.resident(a));
        assert!(f.device.calls().is_empty());
    }

    #[test]
    fn test_evict_for() {
        let f = fixture(4);
        let a = f.buffer("A");
        let b = f.buffer("B");
        f.memory.set_essential(a, true).unwrap();

        assert_eq!(f.residency.evict_for(&f.memory, 1).unwrap(), UNIT);
        assert!(f.resident(a));
        assert!(!f.resident(b));
        assert_eq!(f.residency.evict_for(&f.memory, UNIT).unwrap(), 0);
    }
}
