mod config;
mod events;
mod keys;
mod manager;
mod metrics;
mod transaction;

pub use config::ManagerConfig;
pub use events::{DefragStep, ResourceReposition};
pub use keys::{EventListId, TransactionId};
pub use manager::{Manager, UploadManager};
pub use metrics::{
    AssemblyLineMetrics, AssemblyLineRetirement, BatchedHeapMetrics, BatchingSystemMetrics,
    CommandListMetrics, PoolMetrics, PoolSystemMetrics, TimeMarker,
};
pub use transaction::TransactionOptions;
