pub mod context_pool;
pub mod thread_pool;

pub use context_pool::ContextPool;
pub use thread_pool::{Task, ThreadPool};
