use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::{BufferDesc, DataPacket, PartialResource, ResourceLocator};
use crate::upload::metrics::TimeMarker;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TransactionOptions: u32 {
        /// Expected to live across many frames; never sub-allocated.
        const LONG_TERM = 1 << 0;
        /// Completes before the next `frame_priority_barrier`.
        const FRAME_PRIORITY = 1 << 1;
        /// Always allocates a fresh resource, bypassing every pool.
        const FORCE_CREATE = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransactionState {
    PendingCreate,
    PendingUpload,
    Completed,
    /// Creation failed. Observed as "not completed"; never retried.
    Failed,
}

pub(crate) struct PendingData {
    pub packet: Arc<dyn DataPacket>,
    pub partial: PartialResource,
}

pub(crate) struct Transaction {
    pub desc: BufferDesc,
    pub options: TransactionOptions,
    pub ref_count: u32,
    pub state: TransactionState,
    pub locator: ResourceLocator,
    pub pending: Option<PendingData>,
    pub request_time: TimeMarker,
}

impl Transaction {
    pub fn new(
        desc: BufferDesc,
        options: TransactionOptions,
        init: Option<Arc<dyn DataPacket>>,
        request_time: TimeMarker,
    ) -> Self {
        Self {
            desc,
            options,
            ref_count: 1,
            state: TransactionState::PendingCreate,
            locator: ResourceLocator::empty(),
            pending: init.map(|packet| PendingData {
                packet,
                partial: PartialResource::whole(),
            }),
            request_time,
        }
    }

    /// Tracks a resource that already exists.
    pub fn existing(locator: ResourceLocator, options: TransactionOptions, request_time: TimeMarker) -> Option<Self> {
        let desc = *locator.resource()?.desc();
        Some(Self {
            desc,
            options,
            ref_count: 1,
            state: TransactionState::Completed,
            locator,
            pending: None,
            request_time,
        })
    }

    pub fn is_priority(&self) -> bool {
        self.options.contains(TransactionOptions::FRAME_PRIORITY)
    }

    pub fn is_long_term(&self) -> bool {
        self.options.contains(TransactionOptions::LONG_TERM)
    }
}
