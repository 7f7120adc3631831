//! 原生对象句柄
//!
//! 所有句柄都是设备层分配的不透明 u64，核心只负责传递，不解释其含义。

use std::fmt;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: Self = Self(0);

            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }

            #[inline]
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

native_handle!(
    /// 命令队列，同时作为 SyncPoint 的队列标识
    NativeQueue
);
native_handle!(NativeCommandAllocator);
native_handle!(NativeCommandList);
native_handle!(NativeHeap);
native_handle!(NativeResource);
native_handle!(NativeDescriptorHeap);
native_handle!(NativeFence);

/// 描述符堆中的一个槽位
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    pub heap: NativeDescriptorHeap,
    pub index: u32,
}

impl DescriptorHandle {
    #[inline]
    pub fn new(heap: NativeDescriptorHeap, index: u32) -> Self {
        Self { heap, index }
    }

    /// 同一个堆内偏移 `offset` 个槽位
    #[inline]
    pub fn offset(self, offset: u32) -> Self {
        Self {
            heap: self.heap,
            index: self.index + offset,
        }
    }
}
