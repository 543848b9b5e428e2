use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::buffer::{
    AllocationRules, BasicPacket, BufferDesc, DataPacket, PartialResource, ResourceLocator,
    SubresourceId, UploadDataType,
};
use crate::device::Device;
use crate::error::UploadError;
use crate::pool::{BatchedHeaps, BatchingConfig, ReusePool};
use crate::upload::config::ManagerConfig;
use crate::upload::events::{EventQueue, ResourceReposition};
use crate::upload::keys::{EventListId, TransactionId, TransactionKey};
use crate::upload::metrics::{
    AssemblyLineMetrics, AssemblyLineRetirement, CommandListMetrics, PoolSystemMetrics, TimeMarker,
};
use crate::upload::transaction::{PendingData, Transaction, TransactionOptions, TransactionState};

/// Entry point for creating and filling device resources.
///
/// `update`, `flush` and `frame_priority_barrier` are frame-scoped and belong
/// to the thread that created the manager. Everything else may be called from
/// any thread.
pub trait UploadManager: Send + Sync {
    fn transaction_begin(
        &self,
        desc: &BufferDesc,
        init: Option<Arc<dyn DataPacket>>,
        options: TransactionOptions,
    ) -> TransactionId;

    /// Tracks an already created resource, so later `update_data` calls flow
    /// through the same queues and metrics.
    fn transaction_begin_existing(
        &self,
        locator: ResourceLocator,
        options: TransactionOptions,
    ) -> Result<TransactionId, UploadError>;

    fn update_data(&self, id: TransactionId, data: Arc<dyn DataPacket>, partial: &PartialResource);

    fn transaction_end(&self, id: TransactionId);

    fn add_ref(&self, id: TransactionId);

    /// Creates and fills a resource on the calling thread.
    fn transaction_immediate(
        &self,
        desc: &BufferDesc,
        init: Option<&dyn DataPacket>,
        partial: &PartialResource,
    ) -> Result<ResourceLocator, UploadError>;

    fn transaction_validate(&self, id: TransactionId) -> Result<(), UploadError>;

    fn is_completed(&self, id: TransactionId) -> bool;

    /// Another counted handle to the transaction's resource, or an empty
    /// locator until it has been created. A resource receiving an
    /// `update_data` upload stays available while the upload is queued.
    fn get_resource(&self, id: TransactionId) -> ResourceLocator;

    fn event_list_latest_id(&self) -> EventListId;

    fn event_list_get(&self, id: EventListId) -> Arc<[ResourceReposition]>;

    fn event_list_release(&self, id: EventListId);

    fn resource_validate(&self, locator: &ResourceLocator) -> Result<(), UploadError>;

    /// Blocking copy of the locator's bytes back to the CPU.
    fn resource_read_back(&self, locator: &ResourceLocator) -> Result<BasicPacket, UploadError>;

    fn update(&self);

    fn flush(&self);

    fn pop_metrics(&self) -> CommandListMetrics;

    fn byte_count(&self, desc: &BufferDesc) -> usize {
        desc.byte_count()
    }

    fn calculate_pool_metrics(&self) -> PoolSystemMetrics;

    fn frame_priority_barrier(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkKind {
    Create,
    Upload,
}

#[derive(Clone, Copy, Debug)]
struct WorkItem {
    key: TransactionKey,
    kind: WorkKind,
    priority: bool,
    staging: bool,
    data_type: UploadDataType,
    bytes: usize,
    epoch: u64,
}

#[derive(Default)]
struct AssemblyLine {
    priority: VecDeque<WorkItem>,
    normal: VecDeque<WorkItem>,
    frame: u64,
    pending_metrics: CommandListMetrics,
    metrics: VecDeque<CommandListMetrics>,
    peaks: AssemblyLineMetrics,
}

impl AssemblyLine {
    fn queued(&self) -> impl Iterator<Item = &WorkItem> {
        self.priority.iter().chain(self.normal.iter())
    }
}

/// What realizing one piece of work cost.
#[derive(Default)]
struct Outcome {
    created: bool,
    bytes: usize,
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub struct Manager {
    device: Arc<dyn Device>,
    config: ManagerConfig,
    transactions: Mutex<SlotMap<TransactionKey, Transaction>>,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    line: Mutex<AssemblyLine>,
    events: Mutex<EventQueue>,
    /// Frame-priority barriers passed so far.
    epoch: AtomicU64,
    resource_pool: Arc<ReusePool>,
    staging_pool: Arc<ReusePool>,
    batched: Arc<BatchedHeaps>,
    start: Instant,
    owner: ThreadId,
}

impl Manager {
    /// The calling thread becomes the owner of the frame-scoped methods.
    pub fn new(device: Arc<dyn Device>, config: ManagerConfig) -> Self {
        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        let resource_pool = ReusePool::new(
            "resource",
            device.clone(),
            config.retirement_latency_frames,
            config.pool_idle_frames,
        );
        let staging_pool = ReusePool::new(
            "staging",
            device.clone(),
            config.retirement_latency_frames,
            config.pool_idle_frames,
        );
        let batched = BatchedHeaps::new(
            device.clone(),
            BatchingConfig {
                heap_size: config.batch_heap_size,
                max_allocation: config.batch_max_allocation,
                alignment: config.batch_alignment,
                defrag_min_free_fraction: config.defrag_min_free_fraction,
                retirement_latency: config.retirement_latency_frames,
            },
        );
        log::debug!("upload manager created: {:?}", config);

        Self {
            device,
            events: Mutex::new(EventQueue::new(config.event_list_capacity)),
            config,
            transactions: Mutex::new(SlotMap::with_key()),
            work_tx,
            work_rx,
            line: Mutex::new(AssemblyLine::default()),
            epoch: AtomicU64::new(0),
            resource_pool,
            staging_pool,
            batched,
            start: Instant::now(),
            owner: thread::current().id(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Transactions that have been begun and not yet fully ended.
    pub fn outstanding_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    fn now(&self) -> TimeMarker {
        (self.start.elapsed().as_micros() as TimeMarker).max(1)
    }

    fn assert_owner(&self, operation: &str) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "{operation} called from a thread that does not own the upload manager"
        );
    }

    fn enqueue(&self, key: TransactionKey, kind: WorkKind, tx: &Transaction, bytes: usize) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let _ = self.work_tx.send(WorkItem {
            key,
            kind,
            priority: tx.is_priority(),
            staging: tx.desc.allocation_rules.contains(AllocationRules::STAGING),
            data_type: tx.desc.upload_data_type(),
            bytes,
            epoch,
        });
    }

    /// Picks where the resource comes from and fills it.
    fn realize(
        &self,
        desc: &BufferDesc,
        options: TransactionOptions,
        init: Option<&dyn DataPacket>,
        partial: &PartialResource,
        metrics: &mut CommandListMetrics,
    ) -> Result<ResourceLocator, UploadError> {
        let rules = desc.allocation_rules;
        let forced = options.contains(TransactionOptions::FORCE_CREATE);
        let data_type = desc.upload_data_type().index();
        let bytes = desc.byte_count();

        let (locator, device_created, init_pending) = if !forced
            && rules.contains(AllocationRules::BATCHED)
            && !options.contains(TransactionOptions::LONG_TERM)
            && self.batched.accepts(desc)
        {
            (self.batched.allocate(desc)?, false, true)
        } else if !forced && rules.contains(AllocationRules::POOLED) {
            let pool = if rules.contains(AllocationRules::STAGING) {
                &self.staging_pool
            } else {
                &self.resource_pool
            };
            let (locator, created) = pool.allocate(desc)?;
            (locator, created, true)
        } else if partial.is_whole() {
            let resource = self.device.create_resource(desc, init)?;
            (ResourceLocator::whole(resource), true, false)
        } else {
            let resource = self.device.create_resource(desc, None)?;
            (ResourceLocator::whole(resource), true, true)
        };

        metrics.count_creations[data_type] += 1;
        metrics.bytes_created[data_type] += to_u32(bytes);
        if device_created {
            metrics.count_device_creations[data_type] += 1;
            metrics.device_create_operations += 1;
        } else {
            metrics.non_context_operations += 1;
        }

        if let Some(init) = init {
            let written = match (init_pending, locator.resource()) {
                (true, Some(resource)) => {
                    metrics.context_operations += 1;
                    self.device
                        .update_resource(resource, locator.byte_range(), init, partial)?
                }
                _ => init.data_size(SubresourceId::FIRST),
            };
            metrics.bytes_uploaded_during_creation[data_type] += to_u32(written);
            metrics.bytes_upload_total += to_u32(written);
        }
        Ok(locator)
    }

    /// Runs one queued item to completion.
    fn process(&self, item: WorkItem, metrics: &mut CommandListMetrics) -> Outcome {
        let data_type = item.data_type.index();
        match item.kind {
            WorkKind::Create => {
                let (desc, options, pending) = {
                    let mut transactions = self.transactions.lock();
                    let Some(tx) = transactions.get_mut(item.key) else {
                        return Outcome::default();
                    };
                    if tx.state != TransactionState::PendingCreate {
                        return Outcome::default();
                    }
                    (tx.desc, tx.options, tx.pending.take())
                };

                let result = self.realize(
                    &desc,
                    options,
                    pending.as_ref().map(|p| p.packet.as_ref()),
                    &pending.as_ref().map_or(PartialResource::whole(), |p| p.partial),
                    metrics,
                );

                let now = self.now();
                let mut transactions = self.transactions.lock();
                let Some(tx) = transactions.get_mut(item.key) else {
                    return Outcome {
                        created: true,
                        bytes: item.bytes,
                    };
                };
                match result {
                    Ok(locator) => {
                        tx.locator = locator;
                        tx.state = if tx.pending.is_some() {
                            // data replaced while the resource was being built
                            let _ = self.work_tx.send(WorkItem {
                                kind: WorkKind::Upload,
                                ..item
                            });
                            TransactionState::PendingUpload
                        } else {
                            metrics.retirements.push(AssemblyLineRetirement {
                                desc: tx.desc,
                                request_time: tx.request_time,
                                retirement_time: now,
                            });
                            TransactionState::Completed
                        };
                    }
                    Err(e) => {
                        log::error!(
                            "transaction {:#x}: could not create {}: {}",
                            TransactionId::from(item.key).raw(),
                            desc,
                            e
                        );
                        tx.state = TransactionState::Failed;
                    }
                }
                Outcome {
                    created: true,
                    bytes: item.bytes,
                }
            }

            WorkKind::Upload => {
                let (resource, window, pending) = {
                    let mut transactions = self.transactions.lock();
                    let Some(tx) = transactions.get_mut(item.key) else {
                        return Outcome::default();
                    };
                    if tx.state != TransactionState::PendingUpload {
                        return Outcome::default();
                    }
                    let Some(pending) = tx.pending.take() else {
                        tx.state = TransactionState::Completed;
                        return Outcome::default();
                    };
                    let Some(resource) = tx.locator.resource().cloned() else {
                        tx.state = TransactionState::Failed;
                        return Outcome::default();
                    };
                    (resource, tx.locator.byte_range(), pending)
                };

                let result = self.device.update_resource(
                    &resource,
                    window,
                    pending.packet.as_ref(),
                    &pending.partial,
                );
                metrics.context_operations += 1;

                let now = self.now();
                let mut transactions = self.transactions.lock();
                let written = match result {
                    Ok(written) => written,
                    Err(e) => {
                        log::error!(
                            "transaction {:#x}: upload failed: {}",
                            TransactionId::from(item.key).raw(),
                            e
                        );
                        if let Some(tx) = transactions.get_mut(item.key) {
                            tx.pending = None;
                            tx.state = TransactionState::Failed;
                        }
                        return Outcome::default();
                    }
                };
                metrics.bytes_uploaded[data_type] += to_u32(written);
                metrics.bytes_upload_total += to_u32(written);
                metrics.count_uploaded[data_type] += 1;
                if let Some(tx) = transactions.get_mut(item.key)
                    && tx.pending.is_none()
                {
                    tx.state = TransactionState::Completed;
                    metrics.retirements.push(AssemblyLineRetirement {
                        desc: tx.desc,
                        request_time: tx.request_time,
                        retirement_time: now,
                    });
                }
                Outcome {
                    created: false,
                    bytes: written,
                }
            }
        }
    }

    fn drain_work(&self, line: &mut AssemblyLine) {
        for item in self.work_rx.try_iter() {
            if item.priority {
                line.priority.push_back(item);
            } else {
                line.normal.push_back(item);
            }
        }

        let mut snapshot = AssemblyLineMetrics::default();
        for item in line.queued() {
            match (item.kind, item.staging) {
                (WorkKind::Create, true) => snapshot.queued_staging_creates += 1,
                (WorkKind::Create, false) => snapshot.queued_creates += 1,
                (WorkKind::Upload, _) => snapshot.queued_uploads += 1,
            }
            snapshot.queued_bytes[item.data_type.index()] += to_u32(item.bytes);
        }
        let peaks = &mut line.peaks;
        peaks.queued_peak_creates = peaks.queued_peak_creates.max(snapshot.queued_creates);
        peaks.queued_peak_uploads = peaks.queued_peak_uploads.max(snapshot.queued_uploads);
        peaks.queued_peak_staging_creates = peaks
            .queued_peak_staging_creates
            .max(snapshot.queued_staging_creates);
        snapshot.queued_peak_creates = peaks.queued_peak_creates;
        snapshot.queued_peak_uploads = peaks.queued_peak_uploads;
        snapshot.queued_peak_staging_creates = peaks.queued_peak_staging_creates;

        let transactions = self.transactions.lock();
        snapshot.transaction_count = to_u32(transactions.len());
        snapshot.long_term_transactions_allocated =
            to_u32(transactions.values().filter(|tx| tx.is_long_term()).count());
        snapshot.temporary_transactions_allocated =
            snapshot.transaction_count - snapshot.long_term_transactions_allocated;
        line.pending_metrics.assembly_line = snapshot;
    }

    fn maintain_pools(&self, line: &mut AssemblyLine) {
        self.resource_pool.frame_maintenance(line.frame);
        self.staging_pool.frame_maintenance(line.frame);
        self.batched.frame_maintenance(line.frame);

        let mut events = self.events.lock();
        if !events.has_capacity() {
            log::trace!(
                "event lists full ({} unreleased), deferring defragmentation",
                events.outstanding()
            );
            return;
        }
        let defrag = self.batched.defragment(1);
        line.pending_metrics.batched_copy_bytes += to_u32(defrag.copied_bytes);
        line.pending_metrics.batched_copy_count += to_u32(defrag.copy_count);
        if !defrag.events.is_empty() {
            // locators held by live transactions follow their blocks
            let mut transactions = self.transactions.lock();
            for tx in transactions.values_mut() {
                for event in &defrag.events {
                    if event.apply(&mut tx.locator) {
                        break;
                    }
                }
            }
        }
        if let Some(id) = events.publish(defrag.events) {
            log::debug!("published reposition event list {}", id);
        }
    }

    fn commit_metrics(&self, line: &mut AssemblyLine, processing_start: TimeMarker) {
        let mut metrics = std::mem::take(&mut line.pending_metrics);
        metrics.processing_start = processing_start;
        metrics.processing_end = self.now();
        metrics.commit_time = self.now();
        metrics.resolve_time = metrics.commit_time;
        metrics.frame_id = line.frame as u32;
        metrics.wake_count += 1;
        if line.metrics.len() < self.config.metrics_queue_capacity {
            line.metrics.push_back(metrics);
        } else {
            log::trace!("metrics queue full, dropping frame {}", line.frame);
        }
    }
}

impl UploadManager for Manager {
    fn transaction_begin(
        &self,
        desc: &BufferDesc,
        init: Option<Arc<dyn DataPacket>>,
        options: TransactionOptions,
    ) -> TransactionId {
        let bytes = init
            .as_ref()
            .map_or(0, |packet| packet.data_size(SubresourceId::FIRST));
        let mut transactions = self.transactions.lock();
        let key = transactions.insert(Transaction::new(*desc, options, init, self.now()));
        if let Some(tx) = transactions.get(key) {
            self.enqueue(key, WorkKind::Create, tx, bytes.max(desc.byte_count()));
        }
        log::trace!("transaction {:#x} begun: {}", TransactionId::from(key).raw(), desc);
        key.into()
    }

    fn transaction_begin_existing(
        &self,
        locator: ResourceLocator,
        options: TransactionOptions,
    ) -> Result<TransactionId, UploadError> {
        let tx = Transaction::existing(locator, options, self.now()).ok_or(UploadError::EmptyLocator)?;
        Ok(self.transactions.lock().insert(tx).into())
    }

    fn update_data(&self, id: TransactionId, data: Arc<dyn DataPacket>, partial: &PartialResource) {
        let bytes = data.data_size(SubresourceId::FIRST);
        let mut transactions = self.transactions.lock();
        let key = id.key();
        let Some(tx) = transactions.get_mut(key) else {
            panic!("update_data on unknown transaction {:#x}", id.raw());
        };
        let replaced = tx.pending.replace(PendingData {
            packet: data,
            partial: *partial,
        });
        match tx.state {
            TransactionState::Completed => {
                tx.state = TransactionState::PendingUpload;
                self.enqueue(key, WorkKind::Upload, tx, bytes);
            }
            TransactionState::PendingUpload if replaced.is_none() => {
                self.enqueue(key, WorkKind::Upload, tx, bytes);
            }
            TransactionState::PendingCreate | TransactionState::PendingUpload => {}
            TransactionState::Failed => {
                log::warn!("update_data on failed transaction {:#x} ignored", id.raw());
                tx.pending = None;
            }
        }
    }

    fn transaction_end(&self, id: TransactionId) {
        let removed = {
            let mut transactions = self.transactions.lock();
            let key = id.key();
            let Some(tx) = transactions.get_mut(key) else {
                panic!("transaction_end on unknown transaction {:#x}", id.raw());
            };
            assert!(tx.ref_count > 0, "transaction {:#x} ended too often", id.raw());
            tx.ref_count -= 1;
            if tx.ref_count == 0 {
                transactions.remove(key)
            } else {
                None
            }
        };
        if removed.is_some() {
            log::trace!("transaction {:#x} released", id.raw());
        }
    }

    fn add_ref(&self, id: TransactionId) {
        match self.transactions.lock().get_mut(id.key()) {
            Some(tx) => tx.ref_count += 1,
            None => panic!("add_ref on unknown transaction {:#x}", id.raw()),
        }
    }

    fn transaction_immediate(
        &self,
        desc: &BufferDesc,
        init: Option<&dyn DataPacket>,
        partial: &PartialResource,
    ) -> Result<ResourceLocator, UploadError> {
        let _span = tracing::trace_span!("transaction_immediate").entered();
        let mut metrics = CommandListMetrics::default();
        let result = self.realize(desc, TransactionOptions::empty(), init, partial, &mut metrics);

        let mut line = self.line.lock();
        let pending = &mut line.pending_metrics;
        for i in 0..UploadDataType::COUNT {
            pending.count_creations[i] += metrics.count_creations[i];
            pending.count_device_creations[i] += metrics.count_device_creations[i];
            pending.bytes_created[i] += metrics.bytes_created[i];
            pending.bytes_uploaded_during_creation[i] += metrics.bytes_uploaded_during_creation[i];
        }
        pending.bytes_upload_total += metrics.bytes_upload_total;
        pending.context_operations += metrics.context_operations;
        pending.non_context_operations += metrics.non_context_operations;
        pending.device_create_operations += metrics.device_create_operations;

        if let Err(e) = &result {
            log::warn!("immediate transaction for {} failed: {}", desc, e);
        }
        result
    }

    fn transaction_validate(&self, id: TransactionId) -> Result<(), UploadError> {
        let transactions = self.transactions.lock();
        let tx = transactions
            .get(id.key())
            .ok_or(UploadError::UnknownTransaction(id.raw()))?;
        if tx.ref_count == 0 {
            return Err(UploadError::Unreferenced(id.raw()));
        }
        if tx.state == TransactionState::Completed {
            if tx.locator.is_empty() {
                return Err(UploadError::MissingResource(id.raw()));
            }
            self.resource_validate(&tx.locator)?;
        }
        Ok(())
    }

    fn is_completed(&self, id: TransactionId) -> bool {
        self.transactions
            .lock()
            .get(id.key())
            .is_some_and(|tx| tx.state == TransactionState::Completed)
    }

    fn get_resource(&self, id: TransactionId) -> ResourceLocator {
        let transactions = self.transactions.lock();
        match transactions.get(id.key()) {
            Some(tx)
                if matches!(
                    tx.state,
                    TransactionState::Completed | TransactionState::PendingUpload
                ) =>
            {
                tx.locator.share()
            }
            _ => ResourceLocator::empty(),
        }
    }

    fn event_list_latest_id(&self) -> EventListId {
        self.events.lock().latest_id()
    }

    fn event_list_get(&self, id: EventListId) -> Arc<[ResourceReposition]> {
        self.events.lock().get(id)
    }

    fn event_list_release(&self, id: EventListId) {
        self.events.lock().release(id);
    }

    fn resource_validate(&self, locator: &ResourceLocator) -> Result<(), UploadError> {
        let resource = locator.resource().ok_or(UploadError::EmptyLocator)?;
        let capacity = resource.byte_count();
        if locator.offset() + locator.size() > capacity {
            return Err(UploadError::LocatorOutOfRange {
                offset: locator.offset(),
                size: locator.size(),
                capacity,
            });
        }
        Ok(())
    }

    fn resource_read_back(&self, locator: &ResourceLocator) -> Result<BasicPacket, UploadError> {
        self.resource_validate(locator)?;
        let Some(resource) = locator.resource() else {
            return Err(UploadError::EmptyLocator);
        };
        let range = (!locator.is_whole_resource() && resource.desc().as_linear().is_some())
            .then(|| locator.offset()..locator.offset() + locator.size());
        Ok(self.device.read_back(resource, range)?)
    }

    fn update(&self) {
        self.assert_owner("update");
        let _span = tracing::trace_span!("upload_update").entered();
        let processing_start = self.now();
        let mut line = self.line.lock();
        self.drain_work(&mut line);

        let mut metrics = std::mem::take(&mut line.pending_metrics);
        while let Some(item) = line.priority.pop_front() {
            self.process(item, &mut metrics);
        }

        let mut creates = 0;
        let mut bytes = 0;
        while creates < self.config.max_creates_per_frame
            && bytes < self.config.max_upload_bytes_per_frame
        {
            let Some(item) = line.normal.pop_front() else {
                break;
            };
            let outcome = self.process(item, &mut metrics);
            creates += u32::from(outcome.created);
            bytes += outcome.bytes;
        }
        line.pending_metrics = metrics;

        line.frame += 1;
        self.maintain_pools(&mut line);
        self.commit_metrics(&mut line, processing_start);
    }

    fn flush(&self) {
        self.assert_owner("flush");
        let _span = tracing::trace_span!("upload_flush").entered();
        let processing_start = self.now();
        let mut line = self.line.lock();
        loop {
            self.drain_work(&mut line);
            if line.priority.is_empty() && line.normal.is_empty() {
                break;
            }
            let mut metrics = std::mem::take(&mut line.pending_metrics);
            while let Some(item) = line.priority.pop_front().or_else(|| line.normal.pop_front()) {
                self.process(item, &mut metrics);
            }
            line.pending_metrics = metrics;
        }
        self.commit_metrics(&mut line, processing_start);
    }

    fn pop_metrics(&self) -> CommandListMetrics {
        self.line.lock().metrics.pop_front().unwrap_or_default()
    }

    fn calculate_pool_metrics(&self) -> PoolSystemMetrics {
        PoolSystemMetrics {
            resource_pools: self.resource_pool.metrics(),
            staging_pools: self.staging_pool.metrics(),
            batching: self.batched.metrics(),
        }
    }

    fn frame_priority_barrier(&self) {
        self.assert_owner("frame_priority_barrier");
        let _span = tracing::trace_span!("frame_priority_barrier").entered();
        let mut line = self.line.lock();
        self.drain_work(&mut line);

        let epoch = self.epoch.load(Ordering::Acquire);
        let stall_start = self.now();
        let mut metrics = std::mem::take(&mut line.pending_metrics);
        let mut forced = 0;
        while line.priority.front().is_some_and(|item| item.epoch <= epoch) {
            if let Some(item) = line.priority.pop_front() {
                self.process(item, &mut metrics);
                forced += 1;
            }
        }
        if forced > 0 {
            metrics.frame_priority_stall_time += self.now() - stall_start;
            log::debug!("frame priority barrier forced {} transactions", forced);
        }
        line.pending_metrics = metrics;
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let open = self.transactions.get_mut().len();
        if open > 0 {
            log::error!("upload manager destroyed with {} open transactions", open);
            if !thread::panicking() {
                debug_assert_eq!(open, 0, "upload manager destroyed with open transactions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BindFlags, CpuAccess};
    use crate::device::HostDevice;

    fn manager(config: ManagerConfig) -> (Arc<HostDevice>, Manager) {
        let device = Arc::new(HostDevice::new());
        let manager = Manager::new(device.clone(), config);
        (device, manager)
    }

    fn vertex(size: u32) -> BufferDesc {
        BufferDesc::linear(size, 0)
            .bind_flags(BindFlags::VERTEX_BUFFER)
            .cpu_access(CpuAccess::WRITE)
    }

    #[test]
    fn begin_never_completes_before_update() {
        let (_, manager) = manager(ManagerConfig::default());
        let id = manager.transaction_begin(&vertex(64), None, TransactionOptions::empty());
        assert!(!manager.is_completed(id));
        assert!(manager.get_resource(id).is_empty());
        manager.update();
        assert!(manager.is_completed(id));
        manager.transaction_end(id);
    }

    #[test]
    fn add_ref_keeps_transaction_alive() {
        let (_, manager) = manager(ManagerConfig::default());
        let id = manager.transaction_begin(&vertex(64), None, TransactionOptions::empty());
        manager.add_ref(id);
        manager.transaction_end(id);
        assert_eq!(manager.outstanding_transactions(), 1);
        assert!(manager.transaction_validate(id).is_ok());
        manager.transaction_end(id);
        assert_eq!(manager.outstanding_transactions(), 0);
        assert!(matches!(
            manager.transaction_validate(id),
            Err(UploadError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn creation_budget_spreads_work_over_frames() {
        let (_, manager) = manager(ManagerConfig::default().max_creates_per_frame(2));
        let ids: Vec<_> = (0..5)
            .map(|_| manager.transaction_begin(&vertex(32), None, TransactionOptions::empty()))
            .collect();
        manager.update();
        assert_eq!(ids.iter().filter(|id| manager.is_completed(**id)).count(), 2);
        manager.update();
        manager.update();
        assert!(ids.iter().all(|id| manager.is_completed(*id)));
        ids.into_iter().for_each(|id| manager.transaction_end(id));
    }

    #[test]
    fn priority_work_ignores_the_budget() {
        let (_, manager) = manager(ManagerConfig::default().max_creates_per_frame(1));
        let normal: Vec<_> = (0..3)
            .map(|_| manager.transaction_begin(&vertex(32), None, TransactionOptions::empty()))
            .collect();
        let urgent: Vec<_> = (0..3)
            .map(|_| {
                manager.transaction_begin(&vertex(32), None, TransactionOptions::FRAME_PRIORITY)
            })
            .collect();
        manager.update();
        assert!(urgent.iter().all(|id| manager.is_completed(*id)));
        assert_eq!(normal.iter().filter(|id| manager.is_completed(**id)).count(), 1);
        normal
            .into_iter()
            .chain(urgent)
            .for_each(|id| manager.transaction_end(id));
    }

    #[test]
    fn barrier_forces_earlier_priority_work() {
        let (_, manager) = manager(ManagerConfig::default());
        let first = manager.transaction_begin(&vertex(32), None, TransactionOptions::FRAME_PRIORITY);
        let normal = manager.transaction_begin(&vertex(32), None, TransactionOptions::empty());
        manager.frame_priority_barrier();
        assert!(manager.is_completed(first));
        assert!(!manager.is_completed(normal));

        let second = manager.transaction_begin(&vertex(32), None, TransactionOptions::FRAME_PRIORITY);
        assert!(!manager.is_completed(second));
        manager.frame_priority_barrier();
        assert!(manager.is_completed(second));
        [first, normal, second]
            .into_iter()
            .for_each(|id| manager.transaction_end(id));
    }

    #[test]
    fn update_data_streams_into_completed_resource() {
        let (device, manager) = manager(ManagerConfig::default());
        let id = manager.transaction_begin(&vertex(8), None, TransactionOptions::empty());
        manager.update();
        manager.update_data(
            id,
            Arc::new(BasicPacket::linear(vec![9; 4])),
            &PartialResource::area(crate::buffer::Box2D::new(4, 0, 8, 1)),
        );
        assert!(!manager.is_completed(id));
        let streaming = manager.get_resource(id);
        assert_eq!(streaming.size(), 8);
        manager.update();
        assert!(manager.is_completed(id));

        let locator = manager.get_resource(id);
        assert_eq!(
            locator.resource().unwrap().id(),
            streaming.resource().unwrap().id()
        );
        let bytes = device.read_back(locator.resource().unwrap(), None).unwrap();
        assert_eq!(bytes.as_bytes(), &[0, 0, 0, 0, 9, 9, 9, 9]);
        drop(locator);
        manager.transaction_end(id);
    }

    #[test]
    fn metrics_are_queued_per_frame() {
        let (_, manager) = manager(ManagerConfig::default());
        let id = manager.transaction_begin(
            &vertex(16),
            Some(Arc::new(BasicPacket::linear(vec![1; 16]))),
            TransactionOptions::empty(),
        );
        manager.update();
        let metrics = manager.pop_metrics();
        assert!(metrics.commit_time > 0);
        assert_eq!(metrics.count_creations[UploadDataType::Vertex.index()], 1);
        assert_eq!(metrics.bytes_uploaded_during_creation[UploadDataType::Vertex.index()], 16);
        assert_eq!(metrics.retirement_count(), 1);
        assert_eq!(manager.pop_metrics().commit_time, 0);
        manager.transaction_end(id);
    }

    #[test]
    fn full_metrics_queue_keeps_oldest_frames() {
        let (_, manager) = manager(ManagerConfig::default().metrics_queue_capacity(2));
        for _ in 0..4 {
            manager.update();
        }
        assert_eq!(manager.pop_metrics().frame_id, 1);
        assert_eq!(manager.pop_metrics().frame_id, 2);
        assert!(manager.pop_metrics().is_empty_sentinel());
    }

    #[test]
    fn read_back_is_limited_to_the_locator_range() {
        let (_, manager) = manager(ManagerConfig::default());
        let desc = vertex(32).allocation_rules(AllocationRules::BATCHED);
        let first = manager
            .transaction_immediate(&desc, Some(&BasicPacket::linear(vec![1; 32])), &PartialResource::whole())
            .unwrap();
        let second = manager
            .transaction_immediate(&desc, Some(&BasicPacket::linear(vec![2; 32])), &PartialResource::whole())
            .unwrap();
        assert_eq!(
            first.resource().unwrap().id(),
            second.resource().unwrap().id()
        );
        assert_eq!(manager.resource_read_back(&second).unwrap().as_bytes(), &[2; 32]);
        assert!(manager.resource_validate(&first).is_ok());
        assert!(matches!(
            manager.resource_validate(&ResourceLocator::empty()),
            Err(UploadError::EmptyLocator)
        ));
    }

    #[test]
    fn existing_locator_is_tracked_as_completed() {
        let (device, manager) = manager(ManagerConfig::default());
        let resource = device.create_resource(&vertex(16), None).unwrap();
        let id = manager
            .transaction_begin_existing(ResourceLocator::whole(resource), TransactionOptions::empty())
            .unwrap();
        assert!(manager.is_completed(id));
        assert_eq!(manager.get_resource(id).size(), 16);
        manager.transaction_end(id);
        assert!(matches!(
            manager.transaction_begin_existing(ResourceLocator::empty(), TransactionOptions::empty()),
            Err(UploadError::EmptyLocator)
        ));
    }
}
