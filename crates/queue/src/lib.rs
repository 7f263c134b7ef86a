pub mod error;
pub mod memory;
pub mod storage;

pub use error::QueueError;
pub use memory::MemoryQueue;
pub use storage::QueueStorage;
