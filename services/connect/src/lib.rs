// Connect tier library surface; the binary and integration tests both build on it.
pub mod config;
pub mod error;
pub mod logic;
pub mod online;
pub mod operate;
pub mod push;
pub mod server;
pub mod session;
pub mod tcp;
pub mod ws;
