pub mod config;
pub mod log;
pub mod lsp;
pub mod platform;
pub mod provision;
pub mod release;
