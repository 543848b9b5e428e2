use smallvec::SmallVec;

use crate::buffer::{BufferDesc, UploadDataType};

/// Microseconds since the manager was created. Zero is reserved for "never".
pub type TimeMarker = u64;

type PerType = [u32; UploadDataType::COUNT];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssemblyLineMetrics {
    pub transaction_count: u32,
    pub temporary_transactions_allocated: u32,
    pub long_term_transactions_allocated: u32,
    pub queued_creates: u32,
    pub queued_uploads: u32,
    pub queued_staging_creates: u32,
    pub queued_peak_creates: u32,
    pub queued_peak_uploads: u32,
    pub queued_peak_staging_creates: u32,
    pub queued_bytes: PerType,
}

/// A transaction that completed during the frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyLineRetirement {
    pub desc: BufferDesc,
    pub request_time: TimeMarker,
    pub retirement_time: TimeMarker,
}

/// Counters for one `update` (or `flush`) of the assembly line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandListMetrics {
    pub bytes_uploaded: PerType,
    pub bytes_created: PerType,
    pub bytes_uploaded_during_creation: PerType,
    pub bytes_upload_total: u32,
    pub count_creations: PerType,
    pub count_device_creations: PerType,
    pub count_uploaded: PerType,
    pub context_operations: u32,
    pub non_context_operations: u32,
    pub device_create_operations: u32,
    pub assembly_line: AssemblyLineMetrics,
    pub retirements: SmallVec<[AssemblyLineRetirement; 16]>,
    pub resolve_time: TimeMarker,
    pub commit_time: TimeMarker,
    pub wait_time: TimeMarker,
    pub processing_start: TimeMarker,
    pub processing_end: TimeMarker,
    pub frame_priority_stall_time: TimeMarker,
    pub batched_copy_bytes: u32,
    pub batched_copy_count: u32,
    pub wake_count: u32,
    pub frame_id: u32,
}

impl CommandListMetrics {
    pub fn retirement_count(&self) -> usize {
        self.retirements.len()
    }

    /// Whether this is the value returned by an empty metrics queue.
    pub fn is_empty_sentinel(&self) -> bool {
        self.commit_time == 0
    }
}

/// Occupancy of one bucket of interchangeable pooled resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolMetrics {
    pub desc: BufferDesc,
    pub current_size: u32,
    pub peak_size: u32,
    /// Frames since the oldest free entry was returned.
    pub top_most_age: u32,
    pub recent_device_create_count: u32,
    pub recent_pool_create_count: u32,
    pub recent_release_count: u32,
    pub total_real_size: usize,
    pub total_create_size: usize,
    pub total_create_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchedHeapMetrics {
    /// Start offsets of every allocated block.
    pub markers: Vec<usize>,
    pub allocated_space: usize,
    pub unallocated_space: usize,
    pub heap_size: usize,
    pub largest_free_block: usize,
    pub space_in_reference_counted_blocks: usize,
    pub reference_counted_block_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchingSystemMetrics {
    pub heaps: Vec<BatchedHeapMetrics>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolSystemMetrics {
    pub resource_pools: Vec<PoolMetrics>,
    pub staging_pools: Vec<PoolMetrics>,
    pub batching: BatchingSystemMetrics,
}
