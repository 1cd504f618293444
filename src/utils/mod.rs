pub mod config;
pub mod hosts;

pub use config::RunConfig;
pub use hosts::HostPolicy;
