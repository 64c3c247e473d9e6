pub mod broker;
pub mod chat;
pub mod cli;
pub mod config;
pub mod decision;
pub mod error;
pub mod ipc;
pub mod orchestrator;
pub mod plugins;
pub mod session;
pub mod supervisor;
pub mod task;
