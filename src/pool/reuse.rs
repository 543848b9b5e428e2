use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{BufferDesc, DescName, ResourceId, ResourceLocator, ResourcePool, UnderlyingResource};
use crate::device::Device;
use crate::error::DeviceError;
use crate::upload::PoolMetrics;

/// Descriptions that only differ by name share a bucket.
fn pool_key(desc: &BufferDesc) -> BufferDesc {
    BufferDesc {
        name: DescName::default(),
        ..*desc
    }
}

struct Retiring {
    resource: Arc<UnderlyingResource>,
    ready_frame: u64,
}

struct Free {
    resource: Arc<UnderlyingResource>,
    since_frame: u64,
}

struct Bucket {
    marker: u64,
    in_use: u32,
    peak_size: u32,
    retiring: VecDeque<Retiring>,
    free: VecDeque<Free>,
    recent_device_creates: u32,
    recent_pool_creates: u32,
    recent_releases: u32,
    total_create_size: usize,
    total_create_count: u32,
}

impl Bucket {
    fn new(marker: u64) -> Self {
        Self {
            marker,
            in_use: 0,
            peak_size: 0,
            retiring: VecDeque::new(),
            free: VecDeque::new(),
            recent_device_creates: 0,
            recent_pool_creates: 0,
            recent_releases: 0,
            total_create_size: 0,
            total_create_count: 0,
        }
    }

    fn current_size(&self) -> u32 {
        self.in_use + (self.retiring.len() + self.free.len()) as u32
    }
}

#[derive(Default)]
struct ReuseState {
    frame: u64,
    next_marker: u64,
    buckets: HashMap<BufferDesc, Bucket>,
    references: HashMap<ResourceId, u32>,
}

/// Whole-resource pool. A returned resource is held back for
/// `retirement_latency` frames before it can be handed out again, and is
/// released after sitting unused for `idle_frames`.
pub struct ReusePool {
    label: &'static str,
    device: Arc<dyn Device>,
    retirement_latency: u32,
    idle_frames: u32,
    state: Mutex<ReuseState>,
    weak_self: Weak<ReusePool>,
}

impl ReusePool {
    pub fn new(
        label: &'static str,
        device: Arc<dyn Device>,
        retirement_latency: u32,
        idle_frames: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            label,
            device,
            retirement_latency,
            idle_frames,
            state: Mutex::new(ReuseState::default()),
            weak_self: weak_self.clone(),
        })
    }

    fn as_pool(&self) -> Option<Arc<dyn ResourcePool>> {
        self.weak_self
            .upgrade()
            .map(|pool| pool as Arc<dyn ResourcePool>)
    }

    /// Hands out a compatible retired resource, or creates one. The flag tells
    /// whether the device was involved.
    pub fn allocate(&self, desc: &BufferDesc) -> Result<(ResourceLocator, bool), DeviceError> {
        let key = pool_key(desc);
        let (reused, marker) = {
            let mut state = self.state.lock();
            let ReuseState {
                next_marker,
                buckets,
                ..
            } = &mut *state;
            let bucket = match buckets.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    *next_marker += 1;
                    entry.insert(Bucket::new(*next_marker))
                }
            };
            let reused = bucket.free.pop_back().map(|free| free.resource);
            if reused.is_some() {
                bucket.recent_pool_creates += 1;
            }
            (reused, bucket.marker)
        };

        let created = reused.is_none();
        let resource = match reused {
            Some(resource) => {
                log::trace!("{} pool: reclaimed {:?} for {}", self.label, resource.id(), desc);
                resource
            }
            None => {
                let resource = self.device.create_resource(desc, None)?;
                log::debug!("{} pool: created {:?} for {}", self.label, resource.id(), desc);
                resource
            }
        };

        {
            let mut state = self.state.lock();
            if let Some(bucket) = state.buckets.get_mut(&key) {
                bucket.in_use += 1;
                if created {
                    bucket.recent_device_creates += 1;
                    bucket.total_create_count += 1;
                    bucket.total_create_size += resource.byte_count();
                }
                bucket.peak_size = bucket.peak_size.max(bucket.current_size());
            }
        }

        let locator = ResourceLocator::new(resource, 0, 0, self.as_pool(), marker);
        Ok((locator, created))
    }

    /// Advances the pool to `frame`: retired resources past the latency become
    /// reusable and long-idle ones are released.
    pub fn frame_maintenance(&self, frame: u64) {
        let mut state = self.state.lock();
        state.frame = frame;
        let idle_frames = u64::from(self.idle_frames);
        let mut released = 0;
        for bucket in state.buckets.values_mut() {
            bucket.recent_device_creates = 0;
            bucket.recent_pool_creates = 0;
            bucket.recent_releases = 0;

            while bucket
                .retiring
                .front()
                .is_some_and(|retiring| retiring.ready_frame <= frame)
            {
                if let Some(retiring) = bucket.retiring.pop_front() {
                    bucket.free.push_back(Free {
                        resource: retiring.resource,
                        since_frame: frame,
                    });
                }
            }

            let before = bucket.free.len();
            bucket
                .free
                .retain(|free| frame.saturating_sub(free.since_frame) <= idle_frames);
            released += before - bucket.free.len();
        }
        state
            .buckets
            .retain(|_, bucket| bucket.current_size() > 0 || bucket.peak_size == 0);
        if released > 0 {
            log::debug!("{} pool: released {} idle resources", self.label, released);
        }
    }

    pub fn metrics(&self) -> Vec<PoolMetrics> {
        let state = self.state.lock();
        state
            .buckets
            .iter()
            .map(|(desc, bucket)| PoolMetrics {
                desc: *desc,
                current_size: bucket.current_size(),
                peak_size: bucket.peak_size,
                top_most_age: bucket
                    .free
                    .front()
                    .map_or(0, |free| state.frame.saturating_sub(free.since_frame) as u32),
                recent_device_create_count: bucket.recent_device_creates,
                recent_pool_create_count: bucket.recent_pool_creates,
                recent_release_count: bucket.recent_releases,
                total_real_size: bucket.current_size() as usize * desc.byte_count(),
                total_create_size: bucket.total_create_size,
                total_create_count: bucket.total_create_count,
            })
            .collect()
    }
}

impl ResourcePool for ReusePool {
    fn add_ref(&self, _marker: u64, resource: &Arc<UnderlyingResource>, _offset: usize, _size: usize) {
        *self
            .state
            .lock()
            .references
            .entry(resource.id())
            .or_insert(0) += 1;
    }

    fn return_to_pool(
        &self,
        _marker: u64,
        resource: Arc<UnderlyingResource>,
        _offset: usize,
        _size: usize,
    ) {
        let mut state = self.state.lock();
        let remaining = match state.references.get_mut(&resource.id()) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => panic!(
                "{} pool: {:?} returned without a reference",
                self.label,
                resource.id()
            ),
        };
        if remaining > 0 {
            return;
        }
        state.references.remove(&resource.id());

        let ready_frame = state.frame + u64::from(self.retirement_latency);
        let key = pool_key(resource.desc());
        match state.buckets.get_mut(&key) {
            Some(bucket) => {
                bucket.in_use = bucket.in_use.saturating_sub(1);
                bucket.recent_releases += 1;
                bucket.retiring.push_back(Retiring {
                    resource,
                    ready_frame,
                });
            }
            None => log::warn!(
                "{} pool: dropping {:?}, its bucket is gone",
                self.label,
                resource.id()
            ),
        }
    }
}
