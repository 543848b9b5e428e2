mod batched;
mod reuse;

pub use batched::{BatchedHeaps, BatchingConfig, Defragmentation};
pub use reuse::ReusePool;
