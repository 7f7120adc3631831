//! 放置资源用的 heap 块
//!
//! 空闲空间用按 offset 排序的区间列表表示，first-fit 分配，释放时与相邻区间合并。

use ember_gfx::handles::NativeHeap;
use ember_gfx::resources::resource_desc::{GfxHeapDesc, GfxHeapType, align_up};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Extent {
    offset: u64,
    size: u64,
}

impl Extent {
    #[inline]
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

pub struct GfxHeap {
    native: NativeHeap,
    desc: GfxHeapDesc,
    /// 按 offset 升序，互不重叠且互不相邻
    free_extents: Vec<Extent>,
    used: u64,
    allocation_count: usize,
}

// new & init
impl GfxHeap {
    pub fn new(native: NativeHeap, desc: GfxHeapDesc) -> Self {
        Self {
            native,
            desc,
            free_extents: vec![Extent {
                offset: 0,
                size: desc.size,
            }],
            used: 0,
            allocation_count: 0,
        }
    }
}

// getters
impl GfxHeap {
    #[inline]
    pub fn native(&self) -> NativeHeap {
        self.native
    }

    #[inline]
    pub fn heap_type(&self) -> GfxHeapType {
        self.desc.heap_type
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0
    }

    pub fn largest_free_extent(&self) -> u64 {
        self.free_extents.iter().map(|e| e.size).max().unwrap_or(0)
    }

    #[inline]
    pub fn free_extent_count(&self) -> usize {
        self.free_extents.len()
    }
}

// tools
impl GfxHeap {
    /// first-fit 分配，返回 offset；没有足够的连续空间时返回 None
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(self.desc.alignment).max(1);
        let (index, aligned) = self.free_extents.iter().enumerate().find_map(|(i, e)| {
            let aligned = align_up(e.offset, align);
            (aligned + size <= e.end()).then_some((i, aligned))
        })?;

        let extent = self.free_extents[index];
        let mut remains = Vec::with_capacity(2);
        if aligned > extent.offset {
            remains.push(Extent {
                offset: extent.offset,
                size: aligned - extent.offset,
            });
        }
        if aligned + size < extent.end() {
            remains.push(Extent {
                offset: aligned + size,
                size: extent.end() - aligned - size,
            });
        }
        self.free_extents.splice(index..=index, remains);

        self.used += size;
        self.allocation_count += 1;
        Some(aligned)
    }

    /// 归还 `[offset, offset + size)`
    pub fn free(&mut self, offset: u64, size: u64) {
        let index = self.free_extents.partition_point(|e| e.offset < offset);
        debug_assert!(index == 0 || self.free_extents[index - 1].end() <= offset, "double free in heap");
        debug_assert!(
            index == self.free_extents.len() || offset + size <= self.free_extents[index].offset,
            "double free in heap"
        );

        self.free_extents.insert(index, Extent { offset, size });

        // 先与后一个合并，再与前一个合并
        if index + 1 < self.free_extents.len() && self.free_extents[index].end() == self.free_extents[index + 1].offset
        {
            self.free_extents[index].size += self.free_extents[index + 1].size;
            self.free_extents.remove(index + 1);
        }
        if index > 0 && self.free_extents[index - 1].end() == self.free_extents[index].offset {
            self.free_extents[index - 1].size += self.free_extents[index].size;
            self.free_extents.remove(index);
        }

        self.used -= size;
        self.allocation_count -= 1;
    }
}
