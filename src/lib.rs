pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod context;
pub mod logging;
pub mod os;
pub mod server;
pub mod session;
pub mod ssh;
