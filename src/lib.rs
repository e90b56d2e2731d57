pub mod api;
pub mod auth;
pub mod bridge;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod context;
pub mod encoding;
pub mod error;
pub mod pause;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod session;
pub mod system_info;
