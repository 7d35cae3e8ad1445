pub mod config;
pub mod engine;
pub mod review;
pub mod shared;
pub mod store;
pub mod triggers;
