use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::buffer::{
    BindFlags, BufferDesc, ResourceId, ResourceLocator, ResourcePool, UnderlyingResource,
};
use crate::device::Device;
use crate::error::DeviceError;
use crate::upload::{BatchedHeapMetrics, BatchingSystemMetrics, DefragStep, ResourceReposition};

#[derive(Clone, Copy, Debug)]
pub struct BatchingConfig {
    pub heap_size: usize,
    pub max_allocation: usize,
    pub alignment: usize,
    pub defrag_min_free_fraction: f32,
    pub retirement_latency: u32,
}

struct Block {
    size: usize,
    refs: u32,
}

struct PendingFree {
    range: Range<usize>,
    ready_frame: u64,
}

struct Heap {
    marker: u64,
    bind_flags: BindFlags,
    resource: Arc<UnderlyingResource>,
    blocks: BTreeMap<usize, Block>,
    /// Sorted, non-adjacent free spans.
    free: Vec<Range<usize>>,
    pending_frees: Vec<PendingFree>,
}

impl Heap {
    fn allocate(&mut self, size: usize) -> Option<usize> {
        let index = self.free.iter().position(|span| span.len() >= size)?;
        let offset = self.free[index].start;
        self.free[index].start += size;
        if self.free[index].is_empty() {
            self.free.remove(index);
        }
        self.blocks.insert(offset, Block { size, refs: 0 });
        Some(offset)
    }

    fn release(&mut self, range: Range<usize>) {
        let index = self.free.partition_point(|span| span.start < range.start);
        self.free.insert(index, range);
        if index + 1 < self.free.len() && self.free[index].end == self.free[index + 1].start {
            let next = self.free.remove(index + 1);
            self.free[index].end = next.end;
        }
        if index > 0 && self.free[index - 1].end == self.free[index].start {
            let this = self.free.remove(index);
            self.free[index - 1].end = this.end;
        }
    }

    fn free_space(&self) -> usize {
        self.free.iter().map(Range::len).sum()
    }

    fn largest_free_block(&self) -> usize {
        self.free.iter().map(Range::len).max().unwrap_or(0)
    }

    fn heap_size(&self) -> usize {
        self.resource.byte_count()
    }

    fn metrics(&self) -> BatchedHeapMetrics {
        let pending: usize = self.pending_frees.iter().map(|p| p.range.len()).sum();
        let referenced: Vec<_> = self.blocks.values().filter(|b| b.refs > 0).collect();
        BatchedHeapMetrics {
            markers: self.blocks.keys().copied().collect(),
            allocated_space: self.heap_size() - self.free_space(),
            unallocated_space: self.free_space(),
            heap_size: self.heap_size(),
            largest_free_block: self.largest_free_block(),
            space_in_reference_counted_blocks: referenced.iter().map(|b| b.size).sum::<usize>()
                + pending,
            reference_counted_block_count: referenced.len() as u32,
        }
    }
}

/// One finished compaction, kept while locators to `original` may still exist.
struct Compaction {
    original: Weak<UnderlyingResource>,
    original_id: ResourceId,
    replacement_id: ResourceId,
    steps: SmallVec<[DefragStep; 8]>,
}

impl Compaction {
    /// Redirects this entry past `next`, which compacted its replacement.
    /// Spans whose blocks died before `next` ran are dropped.
    fn fold(&mut self, next: &Compaction) {
        self.steps = self
            .steps
            .iter()
            .filter_map(|step| {
                let moved = next.steps.iter().find(|s| {
                    step.destination >= s.source_start && step.destination < s.source_end
                })?;
                Some(DefragStep {
                    destination: moved.destination + (step.destination - moved.source_start),
                    ..*step
                })
            })
            .collect();
        self.replacement_id = next.replacement_id;
    }
}

#[derive(Default)]
struct BatchState {
    frame: u64,
    next_marker: u64,
    heaps: Vec<Heap>,
    history: VecDeque<Compaction>,
}

impl BatchState {
    /// Finds the heap and current offset of a block that may be addressed
    /// through a resource that has since been compacted away.
    fn resolve(&self, marker: u64, resource: ResourceId, offset: usize) -> Option<(usize, usize)> {
        let index = self.heaps.iter().position(|heap| heap.marker == marker)?;
        let current = self.heaps[index].resource.id();
        let (mut id, mut offset) = (resource, offset);
        while id != current {
            let compaction = self.history.iter().find(|c| c.original_id == id)?;
            let step = compaction
                .steps
                .iter()
                .find(|s| offset >= s.source_start && offset < s.source_end)?;
            offset = step.destination + (offset - step.source_start);
            id = compaction.replacement_id;
        }
        Some((index, offset))
    }
}

/// Compaction result handed back to the manager.
pub struct Defragmentation {
    pub events: Vec<ResourceReposition>,
    pub copied_bytes: usize,
    pub copy_count: usize,
}

/// Shared heaps for small linear buffers. Blocks are reference counted by
/// their locators; freed space is reused only after the retirement latency.
pub struct BatchedHeaps {
    device: Arc<dyn Device>,
    config: BatchingConfig,
    state: Mutex<BatchState>,
    weak_self: Weak<BatchedHeaps>,
}

impl BatchedHeaps {
    pub fn new(device: Arc<dyn Device>, config: BatchingConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            device,
            config,
            state: Mutex::new(BatchState::default()),
            weak_self: weak_self.clone(),
        })
    }

    fn as_pool(&self) -> Option<Arc<dyn ResourcePool>> {
        self.weak_self
            .upgrade()
            .map(|pool| pool as Arc<dyn ResourcePool>)
    }

    fn aligned(&self, size: usize) -> usize {
        size.max(1).next_multiple_of(self.config.alignment)
    }

    pub fn accepts(&self, desc: &BufferDesc) -> bool {
        desc.as_linear().is_some_and(|linear| {
            linear.size_in_bytes > 0
                && self.aligned(linear.size_in_bytes as usize) <= self.config.max_allocation
        })
    }

    /// Carves a block for `desc` out of a heap with matching bind flags,
    /// creating a heap when none has room.
    pub fn allocate(&self, desc: &BufferDesc) -> Result<ResourceLocator, DeviceError> {
        let requested = desc.byte_count();
        let size = self.aligned(requested);
        let (resource, offset, marker) = {
            let mut state = self.state.lock();
            let found = state
                .heaps
                .iter_mut()
                .filter(|heap| heap.bind_flags == desc.bind_flags)
                .find_map(|heap| {
                    heap.allocate(size)
                        .map(|offset| (heap.resource.clone(), offset, heap.marker))
                });
            match found {
                Some(found) => found,
                None => {
                    let heap_desc = BufferDesc::linear(self.config.heap_size as u32, 0)
                        .bind_flags(desc.bind_flags)
                        .cpu_access(desc.cpu_access)
                        .gpu_access(desc.gpu_access)
                        .name("BatchedHeap");
                    let resource = self.device.create_resource(&heap_desc, None)?;
                    state.next_marker += 1;
                    let mut heap = Heap {
                        marker: state.next_marker,
                        bind_flags: desc.bind_flags,
                        resource: resource.clone(),
                        blocks: BTreeMap::new(),
                        free: vec![0..self.config.heap_size],
                        pending_frees: Vec::new(),
                    };
                    log::debug!(
                        "batched heap {}: created for {:?} ({} bytes)",
                        heap.marker,
                        desc.bind_flags,
                        self.config.heap_size
                    );
                    let offset = heap
                        .allocate(size)
                        .ok_or_else(|| DeviceError::OutOfRange {
                            resource: resource.id(),
                            offset: 0,
                            size,
                            capacity: self.config.heap_size,
                        })?;
                    let marker = heap.marker;
                    state.heaps.push(heap);
                    (resource, offset, marker)
                }
            }
        };

        Ok(ResourceLocator::new(
            resource,
            offset,
            requested,
            self.as_pool(),
            marker,
        ))
    }

    pub fn frame_maintenance(&self, frame: u64) {
        let mut state = self.state.lock();
        state.frame = frame;
        for heap in &mut state.heaps {
            let (ready, waiting): (Vec<_>, Vec<_>) = heap
                .pending_frees
                .drain(..)
                .partition(|pending| pending.ready_frame <= frame);
            heap.pending_frees = waiting;
            for pending in ready {
                heap.release(pending.range);
            }
        }
        state.history.retain(|c| c.original.strong_count() > 0);
    }

    fn wants_compaction(&self, heap: &Heap) -> bool {
        let free = heap.free_space();
        !heap.blocks.is_empty()
            && free as f32 >= heap.heap_size() as f32 * self.config.defrag_min_free_fraction
            && heap.largest_free_block() < free / 2
    }

    /// Compacts fragmented heaps into fresh resources, at most `max_heaps` of
    /// them. Each compaction produces one reposition event.
    pub fn defragment(&self, max_heaps: usize) -> Defragmentation {
        let mut result = Defragmentation {
            events: Vec::new(),
            copied_bytes: 0,
            copy_count: 0,
        };
        let Some(pool) = self.as_pool() else {
            return result;
        };

        let mut state = self.state.lock();
        let mut history = Vec::new();
        for heap in state.heaps.iter_mut() {
            if result.events.len() >= max_heaps {
                break;
            }
            if !self.wants_compaction(heap) {
                continue;
            }

            let original = heap.resource.clone();
            let replacement = match self.device.create_resource(original.desc(), None) {
                Ok(resource) => resource,
                Err(e) => {
                    log::warn!("batched heap {}: compaction skipped: {}", heap.marker, e);
                    continue;
                }
            };

            let mut steps: SmallVec<[DefragStep; 8]> = SmallVec::new();
            let mut destination = 0;
            let mut copy_failed = false;
            for (offset, block) in &heap.blocks {
                if let Err(e) =
                    self.device
                        .copy_region(&replacement, destination, &original, *offset, block.size)
                {
                    log::warn!("batched heap {}: compaction copy failed: {}", heap.marker, e);
                    copy_failed = true;
                    break;
                }
                steps.push(DefragStep {
                    source_start: *offset,
                    source_end: offset + block.size,
                    destination,
                });
                destination += block.size;
                result.copied_bytes += block.size;
                result.copy_count += 1;
            }
            if copy_failed {
                continue;
            }

            let blocks = std::mem::take(&mut heap.blocks);
            heap.blocks = blocks
                .into_values()
                .zip(&steps)
                .map(|(block, step)| (step.destination, block))
                .collect();
            heap.free = if destination < heap.heap_size() {
                vec![destination..heap.heap_size()]
            } else {
                Vec::new()
            };
            heap.pending_frees.clear();
            heap.resource = replacement.clone();

            log::debug!(
                "batched heap {}: compacted {:?} into {:?}, {} blocks",
                heap.marker,
                original.id(),
                replacement.id(),
                steps.len()
            );
            history.push(Compaction {
                original: Arc::downgrade(&original),
                original_id: original.id(),
                replacement_id: replacement.id(),
                steps: steps.clone(),
            });
            result.events.push(ResourceReposition {
                original,
                new: replacement,
                pool: pool.clone(),
                pool_marker: heap.marker,
                defrag_steps: steps,
            });
        }
        // older entries map straight onto the live heap resource
        for compaction in &history {
            for earlier in state
                .history
                .iter_mut()
                .filter(|c| c.replacement_id == compaction.original_id)
            {
                earlier.fold(compaction);
            }
        }
        state.history.extend(history);
        result
    }

    pub fn metrics(&self) -> BatchingSystemMetrics {
        BatchingSystemMetrics {
            heaps: self.state.lock().heaps.iter().map(Heap::metrics).collect(),
        }
    }
}

impl ResourcePool for BatchedHeaps {
    fn add_ref(&self, marker: u64, resource: &Arc<UnderlyingResource>, offset: usize, _size: usize) {
        let mut state = self.state.lock();
        let Some((heap, offset)) = state.resolve(marker, resource.id(), offset) else {
            panic!("batched heap {marker}: add_ref of unknown block at {offset}");
        };
        match state.heaps[heap].blocks.get_mut(&offset) {
            Some(block) => block.refs += 1,
            None => panic!("batched heap {marker}: add_ref of unknown block at {offset}"),
        }
    }

    fn return_to_pool(
        &self,
        marker: u64,
        resource: Arc<UnderlyingResource>,
        offset: usize,
        _size: usize,
    ) {
        let mut state = self.state.lock();
        let ready_frame = state.frame + u64::from(self.config.retirement_latency);
        let Some((index, offset)) = state.resolve(marker, resource.id(), offset) else {
            panic!("batched heap {marker}: return of unknown block at {offset}");
        };
        let heap = &mut state.heaps[index];
        let size = match heap.blocks.get_mut(&offset) {
            Some(block) if block.refs > 0 => {
                block.refs -= 1;
                (block.refs == 0).then_some(block.size)
            }
            _ => panic!("batched heap {marker}: block at {offset} returned without a reference"),
        };
        if let Some(size) = size {
            heap.blocks.remove(&offset);
            heap.pending_frees.push(PendingFree {
                range: offset..offset + size,
                ready_frame,
            });
        }
    }
}
