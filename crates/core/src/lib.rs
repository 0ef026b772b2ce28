//! 任务队列核心：错误类型、数据模型、存储适配器抽象、键布局与配置

pub mod config;
pub mod errors;
pub mod keys;
pub mod models;
pub mod traits;

pub use errors::{QueueError, QueueResult};
pub use keys::QueueKeys;
pub use traits::{
    JsonCodec, ManualTimeProvider, PayloadCodec, Store, StoreTx, StreamEntry, StreamInfo,
    SystemTimeProvider, TimeProvider, WriteOp,
};
