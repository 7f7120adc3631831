pub mod command_list;
pub mod queue;
