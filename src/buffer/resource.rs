use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::spec::BufferDesc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ResourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Backend-specific payload of a resource. Devices downcast to their own type.
pub trait BackendResource: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A device resource together with the description it was created from.
pub struct UnderlyingResource {
    id: ResourceId,
    desc: BufferDesc,
    backend: Box<dyn BackendResource>,
}

impl UnderlyingResource {
    pub fn new(desc: BufferDesc, backend: Box<dyn BackendResource>) -> Self {
        Self {
            id: ResourceId::next(),
            desc,
            backend,
        }
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn byte_count(&self) -> usize {
        self.desc.byte_count()
    }

    pub fn backend<T: 'static>(&self) -> Option<&T> {
        self.backend.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for UnderlyingResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnderlyingResource")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// Read-only view handed to consumers that sample a resource.
#[derive(Clone, Debug)]
pub struct ShaderResourceView {
    resource: Arc<UnderlyingResource>,
}

impl ShaderResourceView {
    pub fn new(resource: Arc<UnderlyingResource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Arc<UnderlyingResource> {
        &self.resource
    }
}
