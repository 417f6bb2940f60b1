pub mod build_info;
pub mod cli;
pub mod clock;
pub mod command_processor;
pub mod commands;
pub mod commit_governor;
pub mod config;
pub mod coordination;
pub mod http_source;
pub mod lease_store;
pub mod local_state;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod scan;
pub mod server;
pub mod state;
pub mod work;

#[cfg(test)]
pub(crate) mod test_support;
