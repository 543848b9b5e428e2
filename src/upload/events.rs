use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::buffer::{ResourceLocator, ResourcePool, UnderlyingResource};
use crate::upload::keys::EventListId;

/// One moved span: bytes `source_start..source_end` of the original resource
/// now start at `destination` in the new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefragStep {
    pub source_start: usize,
    pub source_end: usize,
    pub destination: usize,
}

/// Published when a pool compacts `original` into `new`.
pub struct ResourceReposition {
    pub original: Arc<UnderlyingResource>,
    pub new: Arc<UnderlyingResource>,
    pub pool: Arc<dyn ResourcePool>,
    pub pool_marker: u64,
    pub defrag_steps: SmallVec<[DefragStep; 8]>,
}

impl ResourceReposition {
    /// Where `offset` in the original resource lives now, if it was moved.
    pub fn translate_offset(&self, offset: usize) -> Option<usize> {
        self.defrag_steps
            .iter()
            .find(|step| offset >= step.source_start && offset < step.source_end)
            .map(|step| step.destination + (offset - step.source_start))
    }

    /// Points `locator` at the new resource when it referenced a moved range of
    /// the original. Returns whether the locator changed.
    pub fn apply(&self, locator: &mut ResourceLocator) -> bool {
        let refers_to_original = locator
            .resource()
            .is_some_and(|resource| resource.id() == self.original.id());
        if !refers_to_original || !locator.is_pooled() {
            return false;
        }
        match self.translate_offset(locator.offset()) {
            Some(offset) => {
                locator.rebind(self.new.clone(), offset);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ResourceReposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceReposition")
            .field("original", &self.original.id())
            .field("new", &self.new.id())
            .field("pool_marker", &self.pool_marker)
            .field("defrag_steps", &self.defrag_steps)
            .finish()
    }
}

struct EventList {
    id: EventListId,
    events: Arc<[ResourceReposition]>,
}

/// Bounded queue of published reposition lists. A list occupies a slot until
/// the client releases it; with every slot taken nothing new is published.
pub(crate) struct EventQueue {
    capacity: usize,
    lists: VecDeque<EventList>,
    latest: EventListId,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lists: VecDeque::with_capacity(capacity),
            latest: 0,
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.lists.len() < self.capacity
    }

    pub(crate) fn publish(&mut self, events: Vec<ResourceReposition>) -> Option<EventListId> {
        if events.is_empty() || !self.has_capacity() {
            return None;
        }
        self.latest += 1;
        self.lists.push_back(EventList {
            id: self.latest,
            events: events.into(),
        });
        Some(self.latest)
    }

    pub(crate) fn latest_id(&self) -> EventListId {
        self.latest
    }

    pub(crate) fn get(&self, id: EventListId) -> Arc<[ResourceReposition]> {
        self.lists
            .iter()
            .find(|list| list.id == id)
            .map(|list| list.events.clone())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub(crate) fn release(&mut self, id: EventListId) {
        match self.lists.iter().position(|list| list.id == id) {
            Some(index) => {
                self.lists.remove(index);
            }
            None => log::warn!("event list {} released twice or never published", id),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.lists.len()
    }
}
