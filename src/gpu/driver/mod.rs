pub mod binding;
pub mod command;
pub mod pipeline;
pub mod types;
