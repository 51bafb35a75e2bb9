pub mod cache;
pub mod command;
pub mod error;
pub mod frame;
pub mod message;
pub mod pool;
pub mod subscription;
