use std::fmt;
use std::mem;
use std::ops::Range;
use std::sync::Arc;

use crate::buffer::resource::UnderlyingResource;

/// A pool that hands out resources, or ranges of them, and tracks each
/// outstanding range by `(marker, offset, size)`.
///
/// Every pooled [`ResourceLocator`] calls `add_ref` exactly once when it is
/// built and `return_to_pool` exactly once when it is dropped. Returning a
/// range that holds no references is a contract violation and panics.
pub trait ResourcePool: Send + Sync {
    fn add_ref(&self, marker: u64, resource: &Arc<UnderlyingResource>, offset: usize, size: usize);

    fn return_to_pool(
        &self,
        marker: u64,
        resource: Arc<UnderlyingResource>,
        offset: usize,
        size: usize,
    );
}

/// Owning handle to a resource or a sub-range of one.
///
/// Move-only: the value left behind by [`ResourceLocator::take`] is empty and
/// dropping it does nothing. Use [`ResourceLocator::share`] for an additional
/// counted reference.
#[derive(Default)]
pub struct ResourceLocator {
    resource: Option<Arc<UnderlyingResource>>,
    offset: usize,
    size: usize,
    pool: Option<Arc<dyn ResourcePool>>,
    pool_marker: u64,
}

impl ResourceLocator {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Unpooled handle to the whole resource.
    pub fn whole(resource: Arc<UnderlyingResource>) -> Self {
        Self {
            resource: Some(resource),
            offset: 0,
            size: 0,
            pool: None,
            pool_marker: 0,
        }
    }

    /// Handle to `offset..offset + size` of `resource`. With a pool, the pool
    /// is told about the new reference immediately.
    pub fn new(
        resource: Arc<UnderlyingResource>,
        offset: usize,
        size: usize,
        pool: Option<Arc<dyn ResourcePool>>,
        pool_marker: u64,
    ) -> Self {
        if let Some(pool) = &pool {
            pool.add_ref(pool_marker, &resource, offset, size);
        }
        Self {
            resource: Some(resource),
            offset,
            size,
            pool,
            pool_marker,
        }
    }

    /// Another counted handle to the same range.
    pub fn share(&self) -> Self {
        match &self.resource {
            Some(resource) => Self::new(
                resource.clone(),
                self.offset,
                self.size,
                self.pool.clone(),
                self.pool_marker,
            ),
            None => Self::empty(),
        }
    }

    /// Moves the handle out, leaving an empty locator in its place.
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Detaches from the pool and claims the whole underlying resource. The
    /// pool never hears about this locator again.
    pub fn adopt_underlying(&mut self) {
        self.pool = None;
        self.pool_marker = 0;
        self.offset = 0;
        self.size = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resource.is_none()
    }

    #[inline]
    pub fn resource(&self) -> Option<&Arc<UnderlyingResource>> {
        self.resource.as_ref()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the range, or of the whole resource.
    pub fn size(&self) -> usize {
        match &self.resource {
            Some(resource) if self.is_whole_resource() => resource.byte_count(),
            Some(_) => self.size,
            None => 0,
        }
    }

    /// Bytes of the underlying resource this handle may touch.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..self.offset + self.size()
    }

    pub fn is_whole_resource(&self) -> bool {
        self.offset == 0 && self.size == 0
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn pool_marker(&self) -> u64 {
        self.pool_marker
    }

    /// Rebinds this handle without touching the pool. The caller takes over
    /// the pool bookkeeping for both the old and the new range.
    pub(crate) fn rebind(&mut self, resource: Arc<UnderlyingResource>, offset: usize) {
        self.resource = Some(resource);
        self.offset = offset;
    }
}

impl Drop for ResourceLocator {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take()
            && let Some(pool) = self.pool.take()
        {
            pool.return_to_pool(self.pool_marker, resource, self.offset, self.size);
        }
    }
}

impl fmt::Debug for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLocator")
            .field("resource", &self.resource.as_ref().map(|r| r.id()))
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("pooled", &self.pool.is_some())
            .field("pool_marker", &self.pool_marker)
            .finish()
    }
}
