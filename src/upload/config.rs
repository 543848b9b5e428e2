/// Budgets and capacities of the upload manager.
#[derive(Clone, Debug, PartialEq)]
pub struct ManagerConfig {
    pub max_creates_per_frame: u32,
    pub max_upload_bytes_per_frame: usize,
    pub metrics_queue_capacity: usize,
    pub event_list_capacity: usize,
    /// Frames a returned resource waits before it can be handed out again.
    pub retirement_latency_frames: u32,
    /// Frames an unused pooled resource is kept before it is released.
    pub pool_idle_frames: u32,
    pub batch_heap_size: usize,
    pub batch_max_allocation: usize,
    pub batch_alignment: usize,
    pub defrag_min_free_fraction: f32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_creates_per_frame: 64,
            max_upload_bytes_per_frame: 16 * 1024 * 1024,
            metrics_queue_capacity: 256,
            event_list_capacity: 4,
            retirement_latency_frames: 2,
            pool_idle_frames: 120,
            batch_heap_size: 256 * 1024,
            batch_max_allocation: 16 * 1024,
            batch_alignment: 16,
            defrag_min_free_fraction: 0.25,
        }
    }
}

impl ManagerConfig {
    pub fn max_creates_per_frame(mut self, count: u32) -> Self {
        self.max_creates_per_frame = count;
        self
    }

    pub fn max_upload_bytes_per_frame(mut self, bytes: usize) -> Self {
        self.max_upload_bytes_per_frame = bytes;
        self
    }

    pub fn metrics_queue_capacity(mut self, capacity: usize) -> Self {
        self.metrics_queue_capacity = capacity;
        self
    }

    pub fn event_list_capacity(mut self, capacity: usize) -> Self {
        self.event_list_capacity = capacity.max(1);
        self
    }

    pub fn retirement_latency_frames(mut self, frames: u32) -> Self {
        self.retirement_latency_frames = frames;
        self
    }

    pub fn pool_idle_frames(mut self, frames: u32) -> Self {
        self.pool_idle_frames = frames;
        self
    }

    pub fn batching(mut self, heap_size: usize, max_allocation: usize, alignment: usize) -> Self {
        self.batch_heap_size = heap_size;
        self.batch_max_allocation = max_allocation.min(heap_size);
        self.batch_alignment = alignment.max(1).next_power_of_two();
        self
    }

    pub fn defrag_min_free_fraction(mut self, fraction: f32) -> Self {
        self.defrag_min_free_fraction = fraction.clamp(0.0, 1.0);
        self
    }
}
