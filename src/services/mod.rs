pub mod dispatcher;
pub mod janitor;
pub mod memory_log;
pub mod processor;
pub mod queue;
pub mod redis_log;
pub mod results;
pub mod shutdown;
pub mod storage;
pub mod stream_log;
pub mod worker;
