use crate::commands::command_list::GfxCommandListType;

/// 命令队列创建信息
#[derive(Clone, Debug)]
pub struct GfxQueueDesc {
    pub list_type: GfxCommandListType,
    pub debug_name: String,
}

impl GfxQueueDesc {
    pub fn new(list_type: GfxCommandListType, debug_name: impl Into<String>) -> Self {
        Self {
            list_type,
            debug_name: debug_name.into(),
        }
    }
}
