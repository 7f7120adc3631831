use std::sync::Arc;

use ash::vk;

use crate::device::{GfxDevice, GfxDeviceManager, GfxSwapChain, GfxSwapChainDesc};
use crate::error::GfxResult;
use crate::handles::{NativeQueue, NativeResource};
use crate::resources::resource_desc::{GfxHeapType, GfxResourceDesc};
use crate::resources::resource_state::GfxResourceState;

/// 不需要真实窗口的设备管理器
#[derive(Default)]
pub struct HeadlessDeviceManager;

impl GfxDeviceManager for HeadlessDeviceManager {
    fn create_swap_chain(
        &self,
        device: Arc<dyn GfxDevice>,
        queue: NativeQueue,
        desc: &GfxSwapChainDesc,
    ) -> GfxResult<Box<dyn GfxSwapChain>> {
        Ok(Box::new(HeadlessSwapChain::new(device, queue, desc)?))
    }
}

/// back buffer 就是普通的 committed texture，present 只轮换索引
pub struct HeadlessSwapChain {
    device: Arc<dyn GfxDevice>,
    _queue: NativeQueue,
    back_buffers: Vec<NativeResource>,
    current: u32,
    format: vk::Format,
    extent: vk::Extent2D,
    present_count: u64,
}

// new & init
impl HeadlessSwapChain {
    pub fn new(device: Arc<dyn GfxDevice>, queue: NativeQueue, desc: &GfxSwapChainDesc) -> GfxResult<Self> {
        let mut swap_chain = Self {
            device,
            _queue: queue,
            back_buffers: Vec::new(),
            current: 0,
            format: desc.format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            present_count: 0,
        };
        swap_chain.create_back_buffers(desc.buffer_count.max(1))?;
        log::info!(
            "HeadlessSwapChain created: {}x{} {:?}, {} buffers",
            desc.width,
            desc.height,
            desc.format,
            desc.buffer_count
        );
        Ok(swap_chain)
    }

    fn create_back_buffers(&mut self, count: u32) -> GfxResult<()> {
        let desc = GfxResourceDesc::texture_2d(self.extent.width as u64, self.extent.height as u64, self.format);
        for _ in 0..count {
            let buffer = self.device.create_committed_resource(&desc, GfxHeapType::Default, GfxResourceState::PRESENT)?;
            self.back_buffers.push(buffer);
        }
        Ok(())
    }

    fn destroy_back_buffers(&mut self) {
        for buffer in self.back_buffers.drain(..) {
            self.device.destroy_resource(buffer);
        }
    }
}

// getters
impl HeadlessSwapChain {
    #[inline]
    pub fn present_count(&self) -> u64 {
        self.present_count
    }
}

impl GfxSwapChain for HeadlessSwapChain {
    fn buffer_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    fn back_buffer(&self, index: u32) -> NativeResource {
        self.back_buffers.get(index as usize).copied().unwrap_or(NativeResource::NULL)
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.current
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn present(&mut self) -> GfxResult<()> {
        self.present_count += 1;
        self.current = (self.current + 1) % self.buffer_count().max(1);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> GfxResult<()> {
        let count = self.buffer_count();
        self.destroy_back_buffers();
        self.extent = vk::Extent2D { width, height };
        self.current = 0;
        self.create_back_buffers(count)
    }
}

impl Drop for HeadlessSwapChain {
    fn drop(&mut self) {
        log::info!("Dropping HeadlessSwapChain");
        self.destroy_back_buffers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_present_rotates_back_buffers() {
        let device = Arc::new(HeadlessDevice::default());
        let desc = GfxSwapChainDesc {
            window: None,
            width: 64,
            height: 32,
            buffer_count: 3,
            format: vk::Format::B8G8R8A8_UNORM,
            full_screen: false,
        };
        let mut swap_chain = HeadlessSwapChain::new(device.clone(), NativeQueue(1), &desc).unwrap();
        assert_eq!(swap_chain.buffer_count(), 3);
        assert_eq!(device.live_resource_count(), 3);

        for expected in [1, 2, 0] {
            swap_chain.present().unwrap();
            assert_eq!(swap_chain.current_back_buffer_index(), expected);
        }

        let old = swap_chain.back_buffer(0);
        swap_chain.resize(128, 64).unwrap();
        assert_ne!(swap_chain.back_buffer(0), old);
        assert_eq!(swap_chain.extent().width, 128);
        assert_eq!(device.live_resource_count(), 3);

        drop(swap_chain);
        assert_eq!(device.live_resource_count(), 0);
    }
}
