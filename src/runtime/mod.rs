pub mod blueprint;
pub mod context;
pub mod engine;
pub mod redis_storage;
pub mod response;
pub mod storage;
pub mod task;
pub mod trace;
