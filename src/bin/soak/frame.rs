use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
#[cfg(feature = "tracing")]
use tracy_client::{frame_mark, plot};

use gpu_uploads::buffer::ResourceLocator;
use gpu_uploads::device::Device;
use gpu_uploads::upload::{EventListId, Manager, ManagerConfig, UploadManager};

use crate::messages::{Begun, EngineControl, Retired, ShutdownPhase};

const FRAME_TIME: Duration = Duration::from_millis(4);
const KEPT_LOCATORS: usize = 256;
const METRICS_EVERY: u32 = 250;

struct Pending {
    begun: Begun,
    frames_waited: u32,
}

/// Locators held past their transaction, so heap compaction has live blocks
/// to move and reposition events have somebody to patch.
struct Kept {
    locators: Vec<ResourceLocator>,
    next: usize,
    last_event: EventListId,
}

impl Kept {
    fn keep(&mut self, locator: ResourceLocator) {
        if self.locators.len() < KEPT_LOCATORS {
            self.locators.push(locator);
        } else {
            self.locators[self.next] = locator;
            self.next = (self.next + 1) % KEPT_LOCATORS;
        }
    }

    fn apply_events(&mut self, manager: &Manager) {
        let latest = manager.event_list_latest_id();
        while self.last_event < latest {
            self.last_event += 1;
            let events = manager.event_list_get(self.last_event);
            let mut patched = 0;
            for event in events.iter() {
                for locator in &mut self.locators {
                    patched += usize::from(event.apply(locator));
                }
            }
            manager.event_list_release(self.last_event);
            log::debug!(
                "Frame: event list {} moved {} heaps, patched {} locators",
                self.last_event,
                events.len(),
                patched
            );
        }
    }
}

fn retire_completed(
    manager: &Manager,
    pending: &mut Vec<Pending>,
    kept: &mut Kept,
    retired_tx: &Sender<Retired>,
) -> anyhow::Result<()> {
    let mut still_pending = Vec::with_capacity(pending.len());
    for mut entry in pending.drain(..) {
        if !manager.is_completed(entry.begun.id) {
            entry.frames_waited += 1;
            still_pending.push(entry);
            continue;
        }
        manager
            .transaction_validate(entry.begun.id)
            .with_context(|| format!("{} transaction failed validation", entry.begun.label))?;
        let locator = manager.get_resource(entry.begun.id);
        if locator.size() < entry.begun.bytes {
            anyhow::bail!(
                "{} locator holds {} bytes, expected {}",
                entry.begun.label,
                locator.size(),
                entry.begun.bytes
            );
        }
        kept.keep(locator);
        manager.transaction_end(entry.begun.id);
        let _ = retired_tx.send(Retired {
            id: entry.begun.id,
            label: entry.begun.label,
            frames_waited: entry.frames_waited,
        });
    }
    *pending = still_pending;
    Ok(())
}

fn log_metrics(manager: &Manager) {
    let mut frames = 0;
    let mut uploaded = 0u64;
    let mut retirements = 0;
    loop {
        let metrics = manager.pop_metrics();
        if metrics.is_empty_sentinel() {
            break;
        }
        frames += 1;
        uploaded += u64::from(metrics.bytes_upload_total);
        retirements += metrics.retirement_count();
    }
    let pools = manager.calculate_pool_metrics();
    let heaps = &pools.batching.heaps;
    log::info!(
        "Frame: {} frames, {} bytes uploaded, {} retirements; {} pooled buckets, {} batched heaps ({} bytes free)",
        frames,
        uploaded,
        retirements,
        pools.resource_pools.len() + pools.staging_pools.len(),
        heaps.len(),
        heaps.iter().map(|heap| heap.unallocated_space).sum::<usize>()
    );
}

pub fn frame_thread(
    device: Arc<dyn Device>,
    config: ManagerConfig,
    manager_tx: Sender<Arc<Manager>>,
    begun_rx: Receiver<Begun>,
    retired_tx: Sender<Retired>,
    control: Arc<EngineControl>,
) -> anyhow::Result<()> {
    // the manager belongs to the thread that runs its frames
    let manager = Arc::new(Manager::new(device, config));
    manager_tx
        .send(manager.clone())
        .context("producer thread is gone")?;

    let mut pending: Vec<Pending> = Vec::new();
    let mut kept = Kept {
        locators: Vec::with_capacity(KEPT_LOCATORS),
        next: 0,
        last_event: manager.event_list_latest_id(),
    };
    let mut frame = 0u32;

    while control.phase() != ShutdownPhase::StopFrames {
        pending.extend(begun_rx.try_iter().map(|begun| Pending {
            begun,
            frames_waited: 0,
        }));

        manager.frame_priority_barrier();
        manager.update();
        retire_completed(&manager, &mut pending, &mut kept, &retired_tx)?;
        kept.apply_events(&manager);

        frame += 1;
        if frame % METRICS_EVERY == 0 {
            log_metrics(&manager);
        }

        #[cfg(feature = "tracing")]
        {
            plot!("pending transactions", pending.len() as f64);
            plot!("open transactions", manager.outstanding_transactions() as f64);
            frame_mark();
        }

        std::thread::sleep(FRAME_TIME);
    }

    // the producer has stopped, so everything it began is already queued
    pending.extend(begun_rx.try_iter().map(|begun| Pending {
        begun,
        frames_waited: 0,
    }));
    manager.flush();
    retire_completed(&manager, &mut pending, &mut kept, &retired_tx)?;
    for entry in pending.drain(..) {
        log::warn!(
            "Frame: {} {:#x} never completed",
            entry.begun.label,
            entry.begun.id.raw()
        );
        manager.transaction_end(entry.begun.id);
    }
    kept.locators.clear();
    log_metrics(&manager);

    log::debug!("Frame Thread shutting down after {} frames", frame);
    Ok(())
}
