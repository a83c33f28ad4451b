pub mod bench;
pub mod cancel;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod path_utils;
pub mod pipeline;
pub mod system_info;
