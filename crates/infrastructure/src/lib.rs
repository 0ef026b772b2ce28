pub mod memory_store;
pub mod redis_store;
pub mod store_factory;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use store_factory::StoreFactory;
