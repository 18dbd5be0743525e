pub mod board;
pub mod completions;
pub mod config;
pub mod drop;
pub mod sim;
