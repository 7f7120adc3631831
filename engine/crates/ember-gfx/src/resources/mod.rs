pub mod format;
pub mod resource_desc;
pub mod resource_state;
pub mod view;
