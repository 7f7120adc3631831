/// 帧计数器
///
/// frame id 一直累加；slot 是 frame id 在 frames-in-flight 环上的位置。
pub struct FrameCounter {
    /// 当前的帧序号
    frame_id: u64,
    fif_count: usize,
}

// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64, fif_count: usize) -> Self {
        Self {
            frame_id: init_frame_id,
            fif_count: fif_count.max(1),
        }
    }
}

// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}

// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn fif_count(&self) -> usize {
        self.fif_count
    }

    #[inline]
    pub fn slot_index(&self) -> usize {
        (self.frame_id % self.fif_count as u64) as usize
    }

    /// slot 的字母标记：A, B, C ...
    #[inline]
    pub fn frame_label(&self) -> char {
        (b'A' + (self.slot_index() % 26) as u8) as char
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_name() {
        let mut counter = FrameCounter::new(0, 3);
        assert_eq!(counter.frame_name(), "[F0A]");
        counter.next_frame();
        counter.next_frame();
        counter.next_frame();
        assert_eq!(counter.slot_index(), 0);
        assert_eq!(counter.frame_name(), "[F3A]");
    }
}
