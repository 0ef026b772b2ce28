//! Worker 循环：领取任务、执行处理器、续期锁并上报结果

pub mod components;
pub mod handler;
pub mod service;

pub use handler::{JobContext, JobError, JobHandler};
pub use service::{default_worker_id, Worker};
