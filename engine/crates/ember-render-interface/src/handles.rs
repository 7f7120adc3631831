slotmap::new_key_type! {
    /// 引擎层的资源句柄，由 MemoryManager 分配
    pub struct ResourceHandle;
}

slotmap::new_key_type! {
    /// MemoryManager 内部的 heap 句柄
    pub struct GfxHeapHandle;
}
