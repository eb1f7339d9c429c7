// gateway: Library entry point.
// Exposes modules for integration testing.

pub mod config;
pub mod guard;
pub mod handler;
pub mod http;
pub mod listener;
pub mod session;
pub mod sink;
pub mod storage;
